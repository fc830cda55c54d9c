//! Simulated packet-forwarder gateway.
//!
//! Each `join`/`start` call is one UDP conversation: dial a fresh socket, emit
//! frames, listen for downstream datagrams until the receive timeout, then
//! drop the socket. Any PUSH_ACK counts as an ack, whatever its token.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::{lookup_host, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::lorawan::PhyPayload;
use crate::node::{Node, NodeInfo};
use crate::packet::{self, GatewayMac, Packet, Rxpk};
use crate::stats::Stats;

const MAX_DATAGRAM: usize = 65_536;

/// One frame queued for a conversation
#[derive(Debug, Clone)]
enum Outgoing {
    PullData(Vec<u8>),
    PushData { frame: Vec<u8>, join_request: bool },
}

/// Result of one Join/Start conversation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundOutcome {
    pub dialed: bool,
    /// PUSH_DATA frames actually sent
    pub emitted: u64,
    pub acked: u64,
    pub received: u64,
}

impl RoundOutcome {
    pub fn unacked(&self) -> u64 {
        self.emitted.saturating_sub(self.acked)
    }
}

pub struct Gateway {
    pub mac: GatewayMac,
    pub ns_address: String,
    pub receive_timeout: Duration,
    /// Fixed RXPK date (unix seconds) overriding every payload date
    pub rxpk_date: Option<i64>,
    pub payloads_replay_max_laps: i32,
    all_laps_completed: AtomicBool,
    nodes: Mutex<Vec<Node>>,
    stats: Arc<Stats>,
}

impl Gateway {
    pub fn new(
        ns_address: impl Into<String>,
        receive_timeout: Duration,
        rxpk_date: Option<i64>,
        payloads_replay_max_laps: i32,
        nodes: Vec<Node>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            mac: rand::random(),
            ns_address: ns_address.into(),
            receive_timeout,
            rxpk_date: rxpk_date.filter(|d| *d > 0),
            payloads_replay_max_laps,
            all_laps_completed: AtomicBool::new(false),
            nodes: Mutex::new(nodes),
            stats,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn laps_enabled(&self) -> bool {
        self.payloads_replay_max_laps > 0
    }

    pub fn all_laps_completed(&self) -> bool {
        self.all_laps_completed.load(Ordering::SeqCst)
    }

    /// Laps of every node, in order.
    pub fn node_laps(&self) -> Vec<i32> {
        self.nodes.lock().iter().map(|n| n.payloads_replay_lap).collect()
    }

    /// Re-evaluate lap completion. Once true it stays true.
    pub fn update_laps_completed(&self) -> bool {
        if self.all_laps_completed() {
            return true;
        }
        if !self.laps_enabled() {
            return false;
        }
        let done = self
            .nodes
            .lock()
            .iter()
            .all(|n| n.payloads_replay_lap >= self.payloads_replay_max_laps);
        if done {
            self.all_laps_completed.store(true, Ordering::SeqCst);
            log::info!("Gateway {} completed {} replay laps", hex::encode(self.mac), self.payloads_replay_max_laps);
        }
        done
    }

    pub fn info(&self) -> GatewayInfo {
        GatewayInfo {
            mac: hex::encode(self.mac),
            ns_address: self.ns_address.clone(),
            nodes: self.nodes.lock().iter().map(Node::info).collect(),
        }
    }

    fn push_data(&self, phy: &[u8], date: i64) -> crate::Result<Vec<u8>> {
        let rxpk = Rxpk::new(phy, self.rxpk_date, date);
        packet::encode_push_data(packet::random_token(), &self.mac, vec![rxpk])
    }

    /// PULL_DATA, then one join request per unjoined node when `with_join`.
    /// Also returns the indexes of the nodes whose join request was queued.
    fn join_frames(&self, with_join: bool) -> (Vec<Outgoing>, Vec<usize>) {
        let mut frames = vec![Outgoing::PullData(packet::encode_pull_data(packet::random_token(), &self.mac))];
        let mut queued = Vec::new();
        if with_join {
            let nodes = self.nodes.lock();
            for (index, node) in nodes.iter().enumerate().filter(|(_, n)| !n.joined_network) {
                match self.push_data(&node.join_request_payload(), 0) {
                    Ok(frame) => {
                        frames.push(Outgoing::PushData { frame, join_request: true });
                        queued.push(index);
                    }
                    Err(e) => {
                        self.stats.record_encode_error();
                        log::warn!("Join request for {} not encoded: {}", hex::encode(node.dev_eui), e);
                    }
                }
            }
        }
        (frames, queued)
    }

    pub async fn join(&self, with_join: bool) -> RoundOutcome {
        let (frames, queued) = self.join_frames(with_join);
        let outcome = self.exchange(frames).await;
        if outcome.dialed {
            // Session keys are provisioned up front, so an emitted join request is enough.
            let mut nodes = self.nodes.lock();
            for index in queued {
                if let Some(node) = nodes.get_mut(index) {
                    node.joined_network = true;
                }
            }
        }
        outcome
    }

    /// One uplink per node still under its lap limit, all sharing `f_cnt`.
    pub async fn start(&self, f_cnt: u32) -> RoundOutcome {
        let frames = {
            let mut nodes = self.nodes.lock();
            let mut frames = Vec::with_capacity(nodes.len());
            for node in nodes.iter_mut() {
                if self.laps_enabled() && node.payloads_replay_lap >= self.payloads_replay_max_laps {
                    continue;
                }
                let encoded = node
                    .push_data_payload(f_cnt)
                    .and_then(|(phy, date)| self.push_data(&phy, date));
                match encoded {
                    Ok(frame) => frames.push(Outgoing::PushData { frame, join_request: false }),
                    Err(e) => {
                        self.stats.record_encode_error();
                        log::warn!("Uplink for {} not encoded: {}", hex::encode(node.dev_eui), e);
                    }
                }
            }
            frames
        };
        self.update_laps_completed();
        self.exchange(frames).await
    }

    async fn exchange(&self, frames: Vec<Outgoing>) -> RoundOutcome {
        let mut outcome = RoundOutcome::default();
        let socket = match dial(&self.ns_address).await {
            Ok(socket) => socket,
            Err(e) => {
                self.stats.record_dial_error();
                log::error!("Gateway {} cannot dial {}: {}", hex::encode(self.mac), self.ns_address, e);
                return outcome;
            }
        };
        outcome.dialed = true;

        let token = CancellationToken::new();
        let sent_at = Instant::now();
        let send_then_wait = async {
            let mut emitted = 0;
            for frame in &frames {
                let (bytes, push) = match frame {
                    Outgoing::PullData(bytes) => (bytes, None),
                    Outgoing::PushData { frame, join_request } => (frame, Some(*join_request)),
                };
                match socket.send(bytes).await {
                    Ok(_) => match push {
                        Some(join_request) => {
                            emitted += 1;
                            self.stats.record_push_data(join_request);
                        }
                        None => self.stats.record_pull_data(),
                    },
                    Err(e) => log::warn!("Gateway {} send failed: {}", hex::encode(self.mac), e),
                }
            }
            tokio::time::sleep(self.receive_timeout).await;
            token.cancel();
            emitted
        };

        let (emitted, (acked, received)) = tokio::join!(send_then_wait, self.listen(&socket, &token, sent_at));
        outcome.emitted = emitted;
        outcome.acked = acked;
        outcome.received = received;

        self.stats.record_acks(outcome.acked, outcome.unacked());
        log::debug!(
            "Gateway {} round: emitted={} acked={} received={}",
            hex::encode(self.mac),
            outcome.emitted,
            outcome.acked,
            outcome.received
        );
        outcome
    }

    /// Read downstream datagrams until `token` fires or a read fails.
    async fn listen(&self, socket: &UdpSocket, token: &CancellationToken, sent_at: Instant) -> (u64, u64) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut acked = 0;
        let mut received = 0;
        loop {
            let size = tokio::select! {
                _ = token.cancelled() => break,
                read = socket.recv(&mut buf) => match read {
                    Ok(size) => size,
                    Err(e) => {
                        log::debug!("Gateway {} read stopped: {}", hex::encode(self.mac), e);
                        break;
                    }
                },
            };
            received += 1;
            self.stats.record_datagram(sent_at.elapsed());
            let data = &buf[..size];
            if packet::is_ack(data) {
                acked += 1;
            }
            self.handle_downstream(data);
        }
        (acked, received)
    }

    fn handle_downstream(&self, data: &[u8]) {
        match packet::decode(data) {
            Ok(Packet::PushAck { token }) => log::trace!("PUSH_ACK token={}", token),
            Ok(Packet::PullAck { token }) => log::trace!("PULL_ACK token={}", token),
            Ok(Packet::PullResp { phy, .. }) => {
                self.stats.record_pull_resp();
                match PhyPayload::decode(&phy) {
                    Ok(downlink) => log::debug!("PULL_RESP carrying {:?}", downlink.mhdr.mtype),
                    Err(e) => log::debug!("PULL_RESP with undecodable PHY payload: {}", e),
                }
            }
            Ok(Packet::Other { kind, .. }) => log::warn!("Unknown packet type {} from network server", kind),
            Err(e) => {
                self.stats.record_decode_error();
                log::warn!("Gateway {} cannot decode datagram: {}", hex::encode(self.mac), e);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn with_nodes<R>(&self, f: impl FnOnce(&mut Vec<Node>) -> R) -> R {
        f(&mut self.nodes.lock())
    }
}

async fn dial(address: &str) -> io::Result<UdpSocket> {
    let remote = lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", address)))?;
    let local = if remote.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(remote).await?;
    Ok(socket)
}

/// Gateway identity as sent to provisioning backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayInfo {
    pub mac: String,
    pub ns_address: String,
    pub nodes: Vec<NodeInfo>,
}
