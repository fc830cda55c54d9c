//! Semtech UDP packet-forwarder protocol (v2 subset)
//!
//! Layout: version(1) + token(2) + type(1) [+ gateway MAC(8)] [+ JSON body]
//! The token is big-endian and random; responses are not correlated to it.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{HammerError, Result};

pub const PROTOCOL_VERSION: u8 = 2;

/// Offset of the type byte, also the ack flag checked by ack accounting.
pub const TYPE_OFFSET: usize = 3;

const HEADER_LEN: usize = 4;
const MAC_LEN: usize = 8;

/// Packet types (identifier byte)
pub mod packet_type {
    pub const PUSH_DATA: u8 = 0;
    pub const PUSH_ACK: u8 = 1;
    pub const PULL_DATA: u8 = 2;
    pub const PULL_RESP: u8 = 3;
    pub const PULL_ACK: u8 = 4;
}

pub type GatewayMac = [u8; 8];

// ============================================================================
// RXPK / TXPK
// ============================================================================

/// Received-packet record carried in PUSH_DATA
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rxpk {
    pub time: String,
    pub tmst: u32,
    pub chan: u8,
    pub rfch: u8,
    pub freq: f64,
    pub stat: i8,
    pub modu: String,
    pub datr: String,
    pub codr: String,
    pub rssi: i16,
    pub lsnr: f64,
    pub size: u16,
    pub data: String,
}

impl Rxpk {
    /// Wrap a PHY payload with the fixed simulated radio metadata.
    ///
    /// Timestamp priority: gateway-level fixed date, then `date`, then now.
    /// Dates are unix seconds; zero means unset.
    pub fn new(phy: &[u8], gateway_date: Option<i64>, date: i64) -> Self {
        let now = Utc::now();
        let time = gateway_date
            .filter(|d| *d > 0)
            .or(Some(date).filter(|d| *d > 0))
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or(now);

        Self {
            time: time.to_rfc3339_opts(SecondsFormat::Nanos, true),
            tmst: now.timestamp_micros() as u32,
            chan: 2,
            rfch: 0,
            freq: 868.1,
            stat: 1,
            modu: "LORA".to_string(),
            datr: "SF7BW125".to_string(),
            codr: "4/6".to_string(),
            rssi: -42,
            lsnr: 5.5,
            size: phy.len() as u16,
            data: BASE64.encode(phy),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PushDataBody {
    rxpk: Vec<Rxpk>,
}

/// Transmit-packet record carried in PULL_RESP
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Txpk {
    #[serde(default)]
    pub imme: bool,
    #[serde(default)]
    pub tmst: Option<u32>,
    #[serde(default)]
    pub freq: Option<f64>,
    #[serde(default)]
    pub powe: Option<i16>,
    #[serde(default)]
    pub datr: Option<String>,
    #[serde(default)]
    pub size: Option<u16>,
    pub data: String,
}

#[derive(Debug, Deserialize)]
struct PullRespBody {
    txpk: Txpk,
}

// ============================================================================
// Encoding
// ============================================================================

fn header(token: u16, kind: u8, capacity: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + capacity);
    buf.push(PROTOCOL_VERSION);
    // Writing into a Vec never fails.
    let _ = buf.write_u16::<BigEndian>(token);
    buf.push(kind);
    buf
}

pub fn random_token() -> u16 {
    rand::random::<u16>()
}

/// PUSH_DATA frame carrying the given records.
pub fn encode_push_data(token: u16, mac: &GatewayMac, rxpk: Vec<Rxpk>) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(&PushDataBody { rxpk })?;
    let mut buf = header(token, packet_type::PUSH_DATA, MAC_LEN + body.len());
    buf.extend_from_slice(mac);
    buf.extend_from_slice(&body);
    Ok(buf)
}

pub fn encode_pull_data(token: u16, mac: &GatewayMac) -> Vec<u8> {
    let mut buf = header(token, packet_type::PULL_DATA, MAC_LEN);
    buf.extend_from_slice(mac);
    buf
}

// ============================================================================
// Decoding
// ============================================================================

/// Downstream packet as seen by a gateway
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    PushAck { token: u16 },
    PullAck { token: u16 },
    PullResp { token: u16, txpk: Txpk, phy: Vec<u8> },
    /// Any other type byte; callers log it and move on.
    Other { token: u16, kind: u8 },
}

/// True when the datagram's type byte is PUSH_ACK.
///
/// The token is not compared with anything that was sent.
pub fn is_ack(data: &[u8]) -> bool {
    data.get(TYPE_OFFSET) == Some(&packet_type::PUSH_ACK)
}

pub fn decode(data: &[u8]) -> Result<Packet> {
    if data.len() < HEADER_LEN {
        return Err(HammerError::InvalidPacket(format!("packet too short: {} bytes", data.len())));
    }
    let mut cursor = Cursor::new(data);
    let version = cursor.read_u8()?;
    if version != PROTOCOL_VERSION {
        log::debug!("Unexpected protocol version {}", version);
    }
    let token = cursor.read_u16::<BigEndian>()?;
    let kind = cursor.read_u8()?;

    match kind {
        packet_type::PUSH_ACK => Ok(Packet::PushAck { token }),
        packet_type::PULL_ACK => Ok(Packet::PullAck { token }),
        packet_type::PULL_RESP => {
            let body: PullRespBody = serde_json::from_slice(&data[HEADER_LEN..])?;
            let phy = BASE64
                .decode(body.txpk.data.as_bytes())
                .map_err(|e| HammerError::InvalidPacket(format!("txpk data: {}", e)))?;
            if phy.is_empty() {
                return Err(HammerError::InvalidPacket("txpk data decoded to zero bytes".to_string()));
            }
            Ok(Packet::PullResp { token, txpk: body.txpk, phy })
        }
        _ => Ok(Packet::Other { token, kind }),
    }
}
