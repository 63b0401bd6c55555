//! Message bus seam between the schedule node and its peers.
//!
//! The node only ever talks to the [`MessageBus`] trait; [`ChannelBus`] is
//! the in-process implementation used by tests and single-process
//! deployments. Retained topics keep their latest message and replay it to
//! late subscribers, which is how participant and query announcements reach
//! mirrors that start after the node.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use thiserror::Error;

use crate::core::Message;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus lock poisoned")]
    LockPoisoned,
}

pub trait MessageBus: Send + Sync {
    /// Deliver to current subscribers of `topic`.
    fn publish(&self, topic: &str, message: Message) -> Result<(), BusError>;

    /// Deliver to current subscribers and retain the message; future
    /// subscribers receive the retained copy on subscription.
    fn publish_retained(&self, topic: &str, message: Message) -> Result<(), BusError>;

    /// One subscription feeding every listed topic into a single receiver.
    fn subscribe(&self, topics: &[&str]) -> Result<BusSubscription, BusError>;

    /// Live subscriber count for a topic.
    fn subscriber_count(&self, topic: &str) -> Result<usize, BusError>;
}

pub struct BusSubscription {
    receiver: Receiver<Message>,
    alive: Arc<AtomicBool>,
}

impl BusSubscription {
    pub fn recv(&self) -> Result<Message, crossbeam::channel::RecvError> {
        self.receiver.recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Message, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<Message, TryRecvError> {
        self.receiver.try_recv()
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
    }
}

struct TopicSubscriber {
    sender: Sender<Message>,
    alive: Arc<AtomicBool>,
}

impl TopicSubscriber {
    fn is_live(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct TopicState {
    subscribers: Vec<TopicSubscriber>,
    retained: Option<Message>,
}

#[derive(Default)]
struct BusState {
    topics: BTreeMap<String, TopicState>,
}

/// In-process bus backed by crossbeam channels.
#[derive(Clone, Default)]
pub struct ChannelBus {
    inner: Arc<Mutex<BusState>>,
}

impl ChannelBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, BusState>, BusError> {
        self.inner.lock().map_err(|_| BusError::LockPoisoned)
    }

    fn publish_inner(&self, topic: &str, message: Message, retain: bool) -> Result<(), BusError> {
        let mut state = self.lock_state()?;
        let entry = state.topics.entry(topic.to_string()).or_default();
        entry.subscribers.retain(TopicSubscriber::is_live);
        for subscriber in &entry.subscribers {
            // Unbounded channel: a send only fails when the receiver is
            // already gone, which the next retain sweep cleans up.
            let _ = subscriber.sender.send(message.clone());
        }
        if retain {
            entry.retained = Some(message);
        }
        Ok(())
    }
}

impl MessageBus for ChannelBus {
    fn publish(&self, topic: &str, message: Message) -> Result<(), BusError> {
        self.publish_inner(topic, message, false)
    }

    fn publish_retained(&self, topic: &str, message: Message) -> Result<(), BusError> {
        self.publish_inner(topic, message, true)
    }

    fn subscribe(&self, topics: &[&str]) -> Result<BusSubscription, BusError> {
        let (sender, receiver) = crossbeam::channel::unbounded();
        let alive = Arc::new(AtomicBool::new(true));
        let mut state = self.lock_state()?;
        for topic in topics {
            let entry = state.topics.entry((*topic).to_string()).or_default();
            if let Some(retained) = &entry.retained {
                let _ = sender.send(retained.clone());
            }
            entry.subscribers.push(TopicSubscriber {
                sender: sender.clone(),
                alive: Arc::clone(&alive),
            });
        }
        Ok(BusSubscription { receiver, alive })
    }

    fn subscriber_count(&self, topic: &str) -> Result<usize, BusError> {
        let mut state = self.lock_state()?;
        Ok(state
            .topics
            .get_mut(topic)
            .map(|entry| {
                entry.subscribers.retain(TopicSubscriber::is_live);
                entry.subscribers.len()
            })
            .unwrap_or(0))
    }
}
