//! Networked command bus.
//!
//! A `Broker` accepts TCP connections and relays line-delimited JSON frames
//! through an in-process `LocalBus`; a `TcpBus` is the client side, letting
//! agents in other processes join the orchestrator's fleet.
//!
//! Frames: `{"op":"subscribe","topic":T}` and
//! `{"op":"publish","topic":T,"message":BASE64}` in both directions.

use std::collections::HashSet;
use std::net::SocketAddr;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::bus::{CommandBus, LocalBus, Subscription};
use crate::{HammerError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum Frame {
    Subscribe { topic: String },
    Publish { topic: String, message: String },
}

impl Frame {
    fn publish(topic: &str, message: &[u8]) -> Self {
        Frame::Publish { topic: topic.to_string(), message: BASE64.encode(message) }
    }

    fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Drain `lines` into the socket until either side goes away.
fn spawn_writer(mut write: OwnedWriteHalf, mut lines: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            if let Err(e) = write.write_all(line.as_bytes()).await {
                log::warn!("Bus connection write failed: {}", e);
                break;
            }
        }
    })
}

// ============================================================================
// Broker
// ============================================================================

pub struct Broker {
    listener: TcpListener,
    bus: LocalBus,
}

impl Broker {
    pub async fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener, bus: LocalBus::new() })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// In-process side of the broker; publishes here reach remote subscribers too.
    pub fn bus(&self) -> LocalBus {
        self.bus.clone()
    }

    /// Accept connections in the background.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            log::info!("Command broker listening on {:?}", self.listener.local_addr());
            loop {
                match self.listener.accept().await {
                    Ok((stream, peer)) => {
                        log::info!("Bus client connected from {}", peer);
                        let bus = self.bus.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, bus).await {
                                log::warn!("Bus client {} dropped: {}", peer, e);
                            }
                            log::info!("Bus client {} disconnected", peer);
                        });
                    }
                    Err(e) => log::error!("Broker accept error: {}", e),
                }
            }
        })
    }
}

async fn serve_connection(stream: TcpStream, bus: LocalBus) -> Result<()> {
    let (read, write) = stream.into_split();
    let (outgoing, lines) = mpsc::unbounded_channel();
    let writer = spawn_writer(write, lines);
    let mut forwarders = JoinSet::new();
    let mut subscribed = HashSet::new();

    let mut reader = BufReader::new(read).lines();
    let outcome = loop {
        let line = match reader.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(HammerError::from(e)),
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Frame>(&line) {
            Ok(Frame::Subscribe { topic }) => {
                if !subscribed.insert(topic.clone()) {
                    continue;
                }
                let mut subscription = bus.subscribe(&topic);
                let outgoing = outgoing.clone();
                forwarders.spawn(async move {
                    while let Some(message) = subscription.recv().await {
                        match Frame::publish(&topic, &message).to_line() {
                            Ok(line) => {
                                if outgoing.send(line).is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Cannot relay message on {}: {}", topic, e),
                        }
                    }
                });
            }
            Ok(Frame::Publish { topic, message }) => match BASE64.decode(message) {
                Ok(bytes) => {
                    if let Err(e) = bus.publish(&topic, bytes).await {
                        log::warn!("Broker publish on {:?} rejected: {}", topic, e);
                    }
                }
                Err(e) => log::warn!("Broker dropped undecodable message on {}: {}", topic, e),
            },
            Err(e) => log::warn!("Broker dropped malformed frame: {} ({})", e, line),
        }
    };

    forwarders.abort_all();
    writer.abort();
    outcome
}

// ============================================================================
// TCP client bus
// ============================================================================

pub struct TcpBus {
    outgoing: mpsc::UnboundedSender<String>,
    inbound: LocalBus,
    subscribed: Mutex<HashSet<String>>,
    closed: CancellationToken,
}

impl TcpBus {
    pub async fn connect(address: &str) -> Result<Self> {
        let stream = TcpStream::connect(address).await?;
        let (read, write) = stream.into_split();
        let (outgoing, lines) = mpsc::unbounded_channel();
        spawn_writer(write, lines);

        let inbound = LocalBus::new();
        let closed = CancellationToken::new();
        tokio::spawn(read_frames(read, inbound.clone(), closed.clone()));
        log::info!("Connected to command broker {}", address);
        Ok(Self { outgoing, inbound, subscribed: Mutex::new(HashSet::new()), closed })
    }

    /// Cancelled when the broker connection ends.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.outgoing
            .send(frame.to_line()?)
            .map_err(|_| HammerError::Bus("broker connection closed".to_string()))
    }
}

async fn read_frames(read: OwnedReadHalf, inbound: LocalBus, closed: CancellationToken) {
    let mut reader = BufReader::new(read).lines();
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<Frame>(&line) {
                Ok(Frame::Publish { topic, message }) => match BASE64.decode(message) {
                    Ok(bytes) => {
                        if let Err(e) = inbound.publish(&topic, bytes).await {
                            log::warn!("Dropped message on {:?}: {}", topic, e);
                        }
                    }
                    Err(e) => log::warn!("Undecodable message on {}: {}", topic, e),
                },
                Ok(other) => log::debug!("Ignoring broker frame {:?}", other),
                Err(e) => log::warn!("Malformed broker frame: {} ({})", e, line),
            },
            Ok(None) => {
                log::warn!("Command broker closed the connection");
                break;
            }
            Err(e) => {
                log::error!("Command broker read failed: {}", e);
                break;
            }
        }
    }
    closed.cancel();
}

#[async_trait]
impl CommandBus for TcpBus {
    async fn publish(&self, topic: &str, message: Vec<u8>) -> Result<()> {
        if topic.is_empty() {
            return Err(HammerError::Bus("cannot publish on an empty topic".to_string()));
        }
        self.send_frame(&Frame::publish(topic, &message))
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        let subscription = self.inbound.subscribe(topic);
        if self.subscribed.lock().insert(topic.to_string()) {
            if let Err(e) = self.send_frame(&Frame::Subscribe { topic: topic.to_string() }) {
                log::error!("Cannot subscribe to {}: {}", topic, e);
            }
        }
        subscription
    }
}
