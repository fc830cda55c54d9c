//! LoRaWAN 1.0 PHY payload construction and parsing.
//!
//! Frame layout: `MHDR(1) | MACPayload(N) | MIC(4)`.
//! - Join request MAC payload: `AppEUI(8) | DevEUI(8) | DevNonce(2)`, MIC keyed with AppKey
//! - Data MAC payload: `FHDR(7..22) | FPort(0..1) | FRMPayload(N)`, MIC keyed with NwSKey
//!
//! Multi-byte fields are little-endian; EUIs and DevAddr travel reversed.

use std::io::{Cursor, Read};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use cmac::{Cmac, Mac};

use crate::{HammerError, Result};

pub type Eui64 = [u8; 8];
pub type DevAddr = [u8; 4];
pub type AesKey = [u8; 16];

pub const MIC_LEN: usize = 4;

const MHDR_LEN: usize = 1;
const JOIN_REQUEST_LEN: usize = MHDR_LEN + 8 + 8 + 2 + MIC_LEN;
const FHDR_MIN_LEN: usize = 7;

// ============================================================================
// MAC header
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    Rfu,
    Proprietary,
}

impl MType {
    fn bits(self) -> u8 {
        match self {
            MType::JoinRequest => 0,
            MType::JoinAccept => 1,
            MType::UnconfirmedDataUp => 2,
            MType::UnconfirmedDataDown => 3,
            MType::ConfirmedDataUp => 4,
            MType::ConfirmedDataDown => 5,
            MType::Rfu => 6,
            MType::Proprietary => 7,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => MType::JoinRequest,
            1 => MType::JoinAccept,
            2 => MType::UnconfirmedDataUp,
            3 => MType::UnconfirmedDataDown,
            4 => MType::ConfirmedDataUp,
            5 => MType::ConfirmedDataDown,
            6 => MType::Rfu,
            _ => MType::Proprietary,
        }
    }

    fn is_uplink(self) -> bool {
        matches!(self, MType::UnconfirmedDataUp | MType::ConfirmedDataUp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Major {
    LoRaWANR1,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MHdr {
    pub mtype: MType,
    pub major: Major,
}

impl MHdr {
    pub fn new(mtype: MType) -> Self {
        Self { mtype, major: Major::LoRaWANR1 }
    }

    pub fn encode(&self) -> u8 {
        let major = match self.major {
            Major::LoRaWANR1 => 0,
            Major::Other(m) => m & 0x03,
        };
        (self.mtype.bits() << 5) | major
    }

    pub fn decode(byte: u8) -> Self {
        let major = match byte & 0x03 {
            0 => Major::LoRaWANR1,
            m => Major::Other(m),
        };
        Self { mtype: MType::from_bits(byte >> 5), major }
    }
}

// ============================================================================
// MAC payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub app_eui: Eui64,
    pub dev_eui: Eui64,
    pub dev_nonce: [u8; 2],
}

/// Frame control bits for an uplink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FCtrl {
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    pub class_b: bool,
    pub f_opts_len: u8,
}

impl FCtrl {
    fn encode(&self) -> u8 {
        let mut byte = self.f_opts_len & 0x0f;
        if self.adr {
            byte |= 0x80;
        }
        if self.adr_ack_req {
            byte |= 0x40;
        }
        if self.ack {
            byte |= 0x20;
        }
        if self.class_b {
            byte |= 0x10;
        }
        byte
    }

    fn decode(byte: u8) -> Self {
        Self {
            adr: byte & 0x80 != 0,
            adr_ack_req: byte & 0x40 != 0,
            ack: byte & 0x20 != 0,
            class_b: byte & 0x10 != 0,
            f_opts_len: byte & 0x0f,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FHdr {
    pub dev_addr: DevAddr,
    pub f_ctrl: FCtrl,
    /// Only the low 16 bits travel on the wire.
    pub f_cnt: u32,
    pub f_opts: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPayload {
    pub fhdr: FHdr,
    pub f_port: Option<u8>,
    pub frm_payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacPayload {
    JoinRequest(JoinRequest),
    /// Join accepts are encrypted with the AppKey; kept opaque.
    JoinAccept(Vec<u8>),
    Data(DataPayload),
    Raw(Vec<u8>),
}

// ============================================================================
// PHY payload
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhyPayload {
    pub mhdr: MHdr,
    pub mac_payload: MacPayload,
    pub mic: [u8; MIC_LEN],
}

impl PhyPayload {
    /// Build a signed join request.
    pub fn join_request(app_eui: Eui64, dev_eui: Eui64, dev_nonce: [u8; 2], app_key: &AesKey) -> Self {
        let mut phy = Self {
            mhdr: MHdr::new(MType::JoinRequest),
            mac_payload: MacPayload::JoinRequest(JoinRequest { app_eui, dev_eui, dev_nonce }),
            mic: [0; MIC_LEN],
        };
        phy.mic = phy.compute_mic(app_key);
        phy
    }

    /// Build an unconfirmed uplink on FPort 1.
    ///
    /// `data` is encrypted with `app_s_key` before the MIC is computed with `nw_s_key`.
    pub fn unconfirmed_uplink(
        dev_addr: DevAddr,
        f_cnt: u32,
        data: &[u8],
        nw_s_key: &AesKey,
        app_s_key: &AesKey,
    ) -> Self {
        let frm_payload = crypt_frm_payload(app_s_key, Direction::Uplink, &dev_addr, f_cnt, data);
        let mut phy = Self {
            mhdr: MHdr::new(MType::UnconfirmedDataUp),
            mac_payload: MacPayload::Data(DataPayload {
                fhdr: FHdr { dev_addr, f_ctrl: FCtrl::default(), f_cnt, f_opts: Vec::new() },
                f_port: Some(1),
                frm_payload,
            }),
            mic: [0; MIC_LEN],
        };
        phy.mic = phy.compute_mic(nw_s_key);
        phy
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(self.mhdr.encode());
        match &self.mac_payload {
            MacPayload::JoinRequest(jr) => {
                out.extend(jr.app_eui.iter().rev());
                out.extend(jr.dev_eui.iter().rev());
                out.extend_from_slice(&jr.dev_nonce);
            }
            MacPayload::Data(data) => {
                let fhdr = &data.fhdr;
                out.extend(fhdr.dev_addr.iter().rev());
                let mut f_ctrl = fhdr.f_ctrl;
                f_ctrl.f_opts_len = fhdr.f_opts.len().min(15) as u8;
                out.push(f_ctrl.encode());
                // Writing into a Vec never fails.
                let _ = out.write_u16::<LittleEndian>(fhdr.f_cnt as u16);
                out.extend_from_slice(&fhdr.f_opts[..f_ctrl.f_opts_len as usize]);
                if let Some(port) = data.f_port {
                    out.push(port);
                    out.extend_from_slice(&data.frm_payload);
                }
            }
            MacPayload::JoinAccept(bytes) | MacPayload::Raw(bytes) => out.extend_from_slice(bytes),
        }
        out
    }

    /// Wire bytes: header | MAC payload | MIC.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.encode_body();
        out.extend_from_slice(&self.mic);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < MHDR_LEN + MIC_LEN {
            return Err(HammerError::InvalidPacket(format!("PHY payload too short: {} bytes", data.len())));
        }
        let mhdr = MHdr::decode(data[0]);
        let body = &data[MHDR_LEN..data.len() - MIC_LEN];
        let mut mic = [0u8; MIC_LEN];
        mic.copy_from_slice(&data[data.len() - MIC_LEN..]);

        let mac_payload = match mhdr.mtype {
            MType::JoinRequest => {
                if data.len() != JOIN_REQUEST_LEN {
                    return Err(HammerError::InvalidPacket(format!(
                        "join request must be {} bytes, got {}",
                        JOIN_REQUEST_LEN,
                        data.len()
                    )));
                }
                let mut app_eui = [0u8; 8];
                let mut dev_eui = [0u8; 8];
                app_eui.copy_from_slice(&body[0..8]);
                dev_eui.copy_from_slice(&body[8..16]);
                app_eui.reverse();
                dev_eui.reverse();
                MacPayload::JoinRequest(JoinRequest { app_eui, dev_eui, dev_nonce: [body[16], body[17]] })
            }
            MType::JoinAccept => MacPayload::JoinAccept(body.to_vec()),
            MType::UnconfirmedDataUp
            | MType::UnconfirmedDataDown
            | MType::ConfirmedDataUp
            | MType::ConfirmedDataDown => MacPayload::Data(decode_data(body)?),
            MType::Rfu | MType::Proprietary => MacPayload::Raw(body.to_vec()),
        };

        Ok(Self { mhdr, mac_payload, mic })
    }

    /// MIC over this frame with `key`; always 4 bytes.
    pub fn compute_mic(&self, key: &AesKey) -> [u8; MIC_LEN] {
        let body = self.encode_body();
        let mut input = Vec::with_capacity(16 + body.len());
        if let MacPayload::Data(data) = &self.mac_payload {
            let dir = if self.mhdr.mtype.is_uplink() { Direction::Uplink } else { Direction::Downlink };
            input.extend_from_slice(&b_block(0x49, dir, &data.fhdr.dev_addr, data.fhdr.f_cnt, body.len() as u8));
        }
        input.extend_from_slice(&body);
        let tag = aes_cmac(key, &input);
        let mut mic = [0u8; MIC_LEN];
        mic.copy_from_slice(&tag[..MIC_LEN]);
        mic
    }

    pub fn validate_mic(&self, key: &AesKey) -> bool {
        self.compute_mic(key) == self.mic
    }

    /// Decrypt the FRMPayload of a data frame with the application session key.
    pub fn decrypt_frm_payload(&self, app_s_key: &AesKey) -> Option<Vec<u8>> {
        match &self.mac_payload {
            MacPayload::Data(data) => {
                let dir = if self.mhdr.mtype.is_uplink() { Direction::Uplink } else { Direction::Downlink };
                Some(crypt_frm_payload(app_s_key, dir, &data.fhdr.dev_addr, data.fhdr.f_cnt, &data.frm_payload))
            }
            _ => None,
        }
    }
}

fn decode_data(body: &[u8]) -> Result<DataPayload> {
    if body.len() < FHDR_MIN_LEN {
        return Err(HammerError::InvalidPacket(format!("FHDR too short: {} bytes", body.len())));
    }
    let mut cursor = Cursor::new(body);
    let mut dev_addr = [0u8; 4];
    cursor.read_exact(&mut dev_addr)?;
    dev_addr.reverse();
    let f_ctrl = FCtrl::decode(cursor.read_u8()?);
    let f_cnt = cursor.read_u16::<LittleEndian>()? as u32;
    let mut f_opts = vec![0u8; f_ctrl.f_opts_len as usize];
    cursor
        .read_exact(&mut f_opts)
        .map_err(|_| HammerError::InvalidPacket("FOpts exceed frame length".to_string()))?;

    let rest = &body[cursor.position() as usize..];
    let (f_port, frm_payload) = match rest.split_first() {
        Some((port, payload)) => (Some(*port), payload.to_vec()),
        None => (None, Vec::new()),
    };

    Ok(DataPayload { fhdr: FHdr { dev_addr, f_ctrl, f_cnt, f_opts }, f_port, frm_payload })
}

// ============================================================================
// Crypto
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Direction {
    Uplink,
    Downlink,
}

/// `A`/`B0` block shared by MIC and FRMPayload encryption.
fn b_block(tag: u8, dir: Direction, dev_addr: &DevAddr, f_cnt: u32, last: u8) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0] = tag;
    block[5] = match dir {
        Direction::Uplink => 0,
        Direction::Downlink => 1,
    };
    for (i, b) in dev_addr.iter().rev().enumerate() {
        block[6 + i] = *b;
    }
    block[10..14].copy_from_slice(&f_cnt.to_le_bytes());
    block[15] = last;
    block
}

fn aes_cmac(key: &AesKey, data: &[u8]) -> [u8; 16] {
    // A 16-byte key is always a valid AES-128 key.
    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(key));
    mac.update(data);
    let mut tag = [0u8; 16];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    tag
}

fn crypt_frm_payload(key: &AesKey, dir: Direction, dev_addr: &DevAddr, f_cnt: u32, data: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = Vec::with_capacity(data.len());
    for (i, chunk) in data.chunks(16).enumerate() {
        let a = b_block(0x01, dir, dev_addr, f_cnt, (i + 1) as u8);
        let mut s = GenericArray::clone_from_slice(&a);
        cipher.encrypt_block(&mut s);
        out.extend(chunk.iter().zip(s.iter()).map(|(d, k)| d ^ k));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: AesKey = [0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c];

    #[test]
    fn test_cmac_rfc4493_vectors() {
        // RFC 4493 example 1 (empty message) and example 2 (one block)
        assert_eq!(hex::encode(aes_cmac(&KEY, &[])), "bb1d6929e95937287fa37d129b756746");
        let msg = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        assert_eq!(hex::encode(aes_cmac(&KEY, &msg)), "070a16b46b4d4144f79bdd9dd04a287c");
    }

    #[test]
    fn test_join_request_encode_decode() {
        let phy = PhyPayload::join_request([1; 8], [2, 3, 4, 5, 6, 7, 8, 9], [0xab, 0xcd], &KEY);
        let bytes = phy.encode();
        assert_eq!(bytes.len(), JOIN_REQUEST_LEN);
        assert_eq!(bytes[0], 0x00);
        // DevEUI travels little-endian
        assert_eq!(&bytes[9..17], &[9, 8, 7, 6, 5, 4, 3, 2]);

        let decoded = PhyPayload::decode(&bytes).unwrap();
        assert_eq!(decoded.mhdr.mtype, MType::JoinRequest);
        assert_eq!(decoded.mhdr.major, Major::LoRaWANR1);
        assert!(matches!(decoded.mac_payload, MacPayload::JoinRequest(_)));
        assert!(decoded.validate_mic(&KEY));
        assert_eq!(decoded, phy);
    }

    #[test]
    fn test_mic_depends_on_key() {
        let phy = PhyPayload::join_request([1; 8], [2; 8], [0, 1], &KEY);
        let mut other = KEY;
        other[0] ^= 0xff;
        assert_eq!(phy.mic.len(), MIC_LEN);
        assert_ne!(phy.compute_mic(&other), phy.mic);
        assert!(!phy.validate_mic(&other));
    }

    #[test]
    fn test_uplink_layout_and_payload_encryption() {
        let dev_addr = [0x26, 0x0b, 0x12, 0x34];
        let app_s_key = [7u8; 16];
        let phy = PhyPayload::unconfirmed_uplink(dev_addr, 0x10042, &[0xde, 0xad, 0xbe, 0xef], &KEY, &app_s_key);
        let bytes = phy.encode();

        assert_eq!(bytes[0], 0x40);
        assert_eq!(&bytes[1..5], &[0x34, 0x12, 0x0b, 0x26]);
        assert_eq!(bytes[5], 0x00);
        assert_eq!(&bytes[6..8], &[0x42, 0x00]);
        assert_eq!(bytes[8], 1);
        assert_eq!(bytes.len(), 1 + 7 + 1 + 4 + MIC_LEN);
        assert_ne!(&bytes[9..13], &[0xde, 0xad, 0xbe, 0xef]);

        let decoded = PhyPayload::decode(&bytes).unwrap();
        assert_eq!(decoded.mhdr.mtype, MType::UnconfirmedDataUp);
        assert_eq!(decoded.decrypt_frm_payload(&app_s_key).unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        // Only the low 16 bits of FCnt travel, so MIC must be checked against the full counter
        assert!(phy.validate_mic(&KEY));
    }

    #[test]
    fn test_uplink_without_payload_keeps_port() {
        let phy = PhyPayload::unconfirmed_uplink([1, 2, 3, 4], 1, &[], &KEY, &KEY);
        let decoded = PhyPayload::decode(&phy.encode()).unwrap();
        match decoded.mac_payload {
            MacPayload::Data(data) => {
                assert_eq!(data.f_port, Some(1));
                assert!(data.frm_payload.is_empty());
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_short_frames() {
        assert!(PhyPayload::decode(&[0x40, 1, 2]).is_err());
        assert!(PhyPayload::decode(&[0x00, 1, 2, 3, 4, 5]).is_err());
        assert!(PhyPayload::decode(&[0x40, 1, 2, 3, 4, 5, 6, 7, 8]).is_err());
    }
}
