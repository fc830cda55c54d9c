//! Simulated end device: identity, session keys and payload replay cursor.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::lorawan::{AesKey, DevAddr, Eui64, PhyPayload};
use crate::{HammerError, Result};

/// AppKey shared by every simulated node.
pub const DEFAULT_APP_KEY: AesKey = [
    0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
];

/// One replayable uplink
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Hex-encoded application bytes
    pub value: String,
    /// Unix seconds used as the RXPK time, if any
    #[serde(default)]
    pub date: Option<i64>,
}

impl Payload {
    pub fn new(value: impl Into<String>, date: Option<i64>) -> Self {
        Self { value: value.into(), date }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub dev_eui: Eui64,
    pub app_eui: Eui64,
    dev_addr: DevAddr,
    pub app_key: AesKey,
    pub app_s_key: AesKey,
    pub nw_s_key: AesKey,
    pub payloads: Vec<Payload>,
    pub next_payload: usize,
    pub payloads_replay_lap: i32,
    pub joined_network: bool,
    pub random_payloads: bool,
}

/// Parse a hex AES-128 key; an empty string is the zero key.
pub fn parse_key(hex_key: &str) -> Result<AesKey> {
    let mut key = [0u8; 16];
    if hex_key.is_empty() {
        return Ok(key);
    }
    let bytes = hex::decode(hex_key)?;
    if bytes.len() != key.len() {
        return Err(HammerError::InvalidKey(format!("expected 16 bytes, got {}", bytes.len())));
    }
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// DevAddr is the last 8 hex digits of the DevEUI, i.e. its low 4 bytes.
pub fn dev_addr_from_eui(dev_eui: &Eui64) -> DevAddr {
    [dev_eui[4], dev_eui[5], dev_eui[6], dev_eui[7]]
}

impl Node {
    pub fn new(app_s_key: &str, nw_s_key: &str, payloads: Vec<Payload>, random_payloads: bool) -> Result<Self> {
        let dev_eui: Eui64 = rand::random();
        let app_eui: Eui64 = rand::random();
        Ok(Self::with_identity(dev_eui, app_eui, parse_key(app_s_key)?, parse_key(nw_s_key)?, payloads, random_payloads))
    }

    pub fn with_identity(
        dev_eui: Eui64,
        app_eui: Eui64,
        app_s_key: AesKey,
        nw_s_key: AesKey,
        payloads: Vec<Payload>,
        random_payloads: bool,
    ) -> Self {
        Self {
            dev_eui,
            app_eui,
            dev_addr: dev_addr_from_eui(&dev_eui),
            app_key: DEFAULT_APP_KEY,
            app_s_key,
            nw_s_key,
            payloads,
            next_payload: 0,
            payloads_replay_lap: 0,
            joined_network: false,
            random_payloads,
        }
    }

    pub fn dev_addr(&self) -> DevAddr {
        self.dev_addr
    }

    /// Pick the next application bytes and their date, moving the replay cursor.
    pub fn next_payload(&mut self) -> Result<(Vec<u8>, i64)> {
        if self.payloads.is_empty() {
            return Ok((Vec::new(), 0));
        }
        if self.random_payloads {
            let index = rand::thread_rng().gen_range(0..self.payloads.len());
            return Ok((hex::decode(&self.payloads[index].value)?, 0));
        }

        let Payload { value, date } = self.payloads[self.next_payload].clone();
        self.next_payload += 1;
        if self.next_payload >= self.payloads.len() {
            self.next_payload = 0;
            self.payloads_replay_lap += 1;
        }
        Ok((hex::decode(value)?, date.unwrap_or(0)))
    }

    /// Encoded uplink PHY payload for `f_cnt` plus the date to stamp it with.
    pub fn push_data_payload(&mut self, f_cnt: u32) -> Result<(Vec<u8>, i64)> {
        let (data, date) = self.next_payload()?;
        let phy = PhyPayload::unconfirmed_uplink(self.dev_addr, f_cnt, &data, &self.nw_s_key, &self.app_s_key);
        Ok((phy.encode(), date))
    }

    /// Encoded join request with a fresh DevNonce.
    pub fn join_request_payload(&self) -> Vec<u8> {
        let dev_nonce: [u8; 2] = rand::random();
        PhyPayload::join_request(self.app_eui, self.dev_eui, dev_nonce, &self.app_key).encode()
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            dev_eui: hex::encode(self.dev_eui),
            app_eui: hex::encode(self.app_eui),
            dev_addr: hex::encode(self.dev_addr),
            app_key: hex::encode(self.app_key),
            app_s_key: hex::encode(self.app_s_key),
            nw_s_key: hex::encode(self.nw_s_key),
        }
    }
}

/// Node identity as sent to provisioning backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub dev_eui: String,
    pub app_eui: String,
    pub dev_addr: String,
    pub app_key: String,
    pub app_s_key: String,
    pub nw_s_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::{MType, MacPayload};

    fn node_with(payloads: &[&str], random: bool) -> Node {
        let payloads = payloads.iter().enumerate().map(|(i, v)| Payload::new(*v, Some(100 + i as i64))).collect();
        Node::with_identity([1, 2, 3, 4, 5, 6, 7, 8], [9; 8], [0; 16], [0; 16], payloads, random)
    }

    #[test]
    fn test_dev_addr_derivation() {
        assert_eq!(dev_addr_from_eui(&[1, 2, 3, 4, 5, 6, 7, 8]), [5, 6, 7, 8]);
        assert_eq!(node_with(&[], false).info().dev_addr, "05060708");

        for _ in 0..32 {
            let node = Node::new("", "", vec![], false).unwrap();
            assert_eq!(node.dev_addr(), node.dev_eui[4..]);
        }
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("").unwrap(), [0; 16]);
        assert_eq!(parse_key("2b7e151628aed2a6abf7158809cf4f3c").unwrap(), DEFAULT_APP_KEY);
        assert!(parse_key("zz").is_err());
        assert!(parse_key("0102").is_err());
    }

    #[test]
    fn test_sequential_replay_laps() {
        let mut node = node_with(&["0a", "0b", "0c"], false);
        let mut seen = Vec::new();
        for call in 1..=9 {
            let (bytes, date) = node.next_payload().unwrap();
            seen.push(bytes[0]);
            assert!(date >= 100);
            assert_eq!(node.payloads_replay_lap, call / 3);
        }
        assert_eq!(seen, vec![0x0a, 0x0b, 0x0c, 0x0a, 0x0b, 0x0c, 0x0a, 0x0b, 0x0c]);
    }

    #[test]
    fn test_empty_payloads_never_lap() {
        let mut node = node_with(&[], false);
        for _ in 0..5 {
            let (bytes, date) = node.next_payload().unwrap();
            assert!(bytes.is_empty());
            assert_eq!(date, 0);
        }
        assert_eq!(node.payloads_replay_lap, 0);
    }

    #[test]
    fn test_random_payloads_do_not_move_cursor() {
        let mut node = node_with(&["0a", "0b"], true);
        for _ in 0..10 {
            let (bytes, date) = node.next_payload().unwrap();
            assert!(bytes == vec![0x0a] || bytes == vec![0x0b]);
            assert_eq!(date, 0);
        }
        assert_eq!(node.next_payload, 0);
        assert_eq!(node.payloads_replay_lap, 0);
    }

    #[test]
    fn test_join_request_is_fresh_each_call() {
        let node = node_with(&[], false);
        let first = node.join_request_payload();
        let decoded = PhyPayload::decode(&first).unwrap();
        assert_eq!(decoded.mhdr.mtype, MType::JoinRequest);
        match decoded.mac_payload {
            MacPayload::JoinRequest(jr) => assert_eq!(jr.dev_eui, node.dev_eui),
            other => panic!("unexpected payload {:?}", other),
        }
        // DevNonce is random; collisions are possible but vanishingly rare across 8 draws
        let distinct = (0..8).map(|_| node.join_request_payload()).any(|p| p != first);
        assert!(distinct);
    }

    #[test]
    fn test_push_data_payload_is_uplink() {
        let mut node = node_with(&["cafe"], false);
        let (phy, date) = node.push_data_payload(3).unwrap();
        assert_eq!(date, 100);
        let decoded = PhyPayload::decode(&phy).unwrap();
        assert_eq!(decoded.mhdr.mtype, MType::UnconfirmedDataUp);
        assert_eq!(decoded.decrypt_frm_payload(&node.app_s_key).unwrap(), vec![0xca, 0xfe]);
        assert!(decoded.validate_mic(&node.nw_s_key));
    }
}
