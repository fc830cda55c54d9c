//! Publish/subscribe command bus.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::command::Command;
use crate::{HammerError, Result};

pub type Subscription = mpsc::UnboundedReceiver<Vec<u8>>;

#[async_trait]
pub trait CommandBus: Send + Sync {
    /// Deliver `message` to every current subscriber of `topic`.
    async fn publish(&self, topic: &str, message: Vec<u8>) -> Result<()>;

    fn subscribe(&self, topic: &str) -> Subscription;

    async fn send(&self, topic: &str, command: &Command) -> Result<()> {
        log::debug!("-> {} {}", topic, command.cmd);
        self.publish(topic, command.encode()?).await
    }
}

/// In-process bus; a publish with no subscriber is dropped, like a non-retained broker message.
#[derive(Clone, Default)]
pub struct LocalBus {
    topics: Arc<RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map(|subs| subs.len()).unwrap_or(0)
    }
}

#[async_trait]
impl CommandBus for LocalBus {
    async fn publish(&self, topic: &str, message: Vec<u8>) -> Result<()> {
        if topic.is_empty() {
            return Err(HammerError::Bus("cannot publish on an empty topic".to_string()));
        }
        let mut topics = self.topics.write();
        match topics.get_mut(topic) {
            Some(subscribers) => {
                subscribers.retain(|tx| tx.send(message.clone()).is_ok());
                if subscribers.is_empty() {
                    topics.remove(topic);
                }
            }
            None => log::trace!("No subscriber on {}, message dropped", topic),
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.write().entry(topic.to_string()).or_default().push(tx);
        rx
    }
}
