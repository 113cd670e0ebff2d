//! In-process broadcast channel backed by `tokio::sync::broadcast`.
//!
//! [`EventBus`] is the local stand-in for the platform event channel:
//! publishers fan messages out to every subscriber, and a bounded
//! retention log lets new subscribers replay recent messages. It is
//! designed to be shared via `Arc<EventBus>`.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;

use crate::message::{ChannelMessage, ChannelName, ReplayPosition};

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// Default number of messages kept for replay.
const DEFAULT_RETENTION: usize = 1024;

/// In-process fan-out channel with replay.
///
/// Every published message is stamped with a monotonically increasing
/// replay id (starting at 1).
pub struct EventBus {
    sender: broadcast::Sender<ChannelMessage>,
    log: Mutex<RetentionLog>,
}

struct RetentionLog {
    retained: VecDeque<ChannelMessage>,
    capacity: usize,
    next_replay_id: i64,
}

/// A fresh subscription to the bus.
///
/// `backlog` holds the replayed messages for the requested channel;
/// `receiver` yields every message published afterwards, on any channel.
pub struct BusSubscription {
    pub backlog: Vec<ChannelMessage>,
    pub receiver: broadcast::Receiver<ChannelMessage>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity and retention size.
    ///
    /// When the broadcast buffer is full, the oldest un-consumed messages
    /// are dropped and slow receivers observe `RecvError::Lagged`. A
    /// `capacity` of zero is raised to one.
    pub fn new(capacity: usize, retention: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            log: Mutex::new(RetentionLog {
                retained: VecDeque::with_capacity(retention.min(DEFAULT_RETENTION)),
                capacity: retention,
                next_replay_id: 1,
            }),
        }
    }

    /// Publish a payload on `channel` and return its replay id.
    ///
    /// If there are no active subscribers the message is only retained.
    pub fn publish(&self, channel: &ChannelName, payload: serde_json::Value) -> i64 {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);

        let replay_id = log.next_replay_id;
        log.next_replay_id += 1;

        let message = ChannelMessage::new(channel.clone(), payload).with_replay_id(replay_id);

        if log.capacity > 0 {
            if log.retained.len() == log.capacity {
                log.retained.pop_front();
            }
            log.retained.push_back(message.clone());
        }

        // Ignore the SendError -- it only means there are zero receivers.
        let _ = self.sender.send(message);
        replay_id
    }

    /// Subscribe to `channel`, replaying retained messages per `replay`.
    ///
    /// The backlog snapshot and the live receiver are taken under the
    /// same lock as [`publish`](Self::publish), so no message is seen
    /// twice or skipped between the two.
    pub fn subscribe(&self, channel: &ChannelName, replay: ReplayPosition) -> BusSubscription {
        let log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let receiver = self.sender.subscribe();

        let backlog = match replay {
            ReplayPosition::Latest => Vec::new(),
            ReplayPosition::All => log
                .retained
                .iter()
                .filter(|m| &m.channel == channel)
                .cloned()
                .collect(),
            ReplayPosition::After(after) => log
                .retained
                .iter()
                .filter(|m| &m.channel == channel && m.replay_id.is_some_and(|id| id > after))
                .cloned()
                .collect(),
        };

        BusSubscription { backlog, receiver }
    }

    /// Number of live receivers across all channels.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_RETENTION)
    }
}
