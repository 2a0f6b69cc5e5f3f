//! Queue between the HTTP handler and the broker.
//!
//! Accepted messages go into one FIFO. A fixed set of long-lived workers pops
//! from it and offers each message to [`BrokerClient::try_send_async`]. When
//! the producer's pipeline is full the message goes back to the head of the
//! queue and the worker backs off, so a stalled broker fills this queue and
//! new submissions are rejected once `capacity` messages are waiting.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{select, sync::Notify, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    message::{Message, MessagePayload, ValidationError},
    producer::{Backpressure, BrokerClient},
};

pub const DEFAULT_WORKERS: usize = 100;
pub const DEFAULT_CAPACITY: usize = 10_000;
const BACKLOG_RETRY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    pub workers: usize,
    pub capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("dispatch queue is full ({capacity} messages pending)")]
    QueueFull { capacity: usize },
    #[error("dispatch queue is shut down")]
    Closed,
}

#[derive(Default)]
struct Pending {
    messages: VecDeque<Message>,
    closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drained {
    Empty,
    Backlogged,
}

struct Shared {
    pending: Mutex<Pending>,
    wakeup: Notify,
    capacity: usize,
    dispatched: AtomicU64,
    producer: Arc<BrokerClient>,
}

impl Shared {
    fn pop(&self) -> Option<Message> {
        self.pending.lock().messages.pop_front()
    }

    fn drain(&self, worker: usize) -> Drained {
        while let Some(message) = self.pop() {
            match self
                .producer
                .try_send_async(message.topic(), message.key(), message.payload())
            {
                Ok(()) => {
                    self.dispatched.fetch_add(1, Ordering::Relaxed);
                    debug!(worker, topic = message.topic(), "message handed to producer");
                }
                Err(Backpressure::Full) => {
                    self.pending.lock().messages.push_front(message);
                    return Drained::Backlogged;
                }
                Err(Backpressure::Closed) => {
                    // Logged and reported through the delivery hook.
                    self.producer
                        .send_async(message.topic(), message.key(), message.payload());
                }
            }
        }

        Drained::Empty
    }
}

pub struct DispatchQueue {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchQueue {
    /// Spawns the worker pool on the current tokio runtime.
    pub fn start(producer: Arc<BrokerClient>, config: DispatchConfig) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            wakeup: Notify::new(),
            capacity: config.capacity.max(1),
            dispatched: AtomicU64::new(0),
            producer,
        });
        let shutdown = CancellationToken::new();

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    Arc::clone(&shared),
                    shutdown.clone(),
                ))
            })
            .collect();

        info!(
            workers = config.workers.max(1),
            capacity = shared.capacity,
            "dispatch queue started"
        );

        Self {
            shared,
            shutdown,
            workers: Mutex::new(workers),
        }
    }

    /// Validates and queues one message without waiting for the broker.
    pub fn enqueue(&self, payload: MessagePayload) -> Result<(), EnqueueError> {
        let message = Message::try_from(payload)?;

        {
            let mut pending = self.shared.pending.lock();
            if pending.closed {
                return Err(EnqueueError::Closed);
            }
            if pending.messages.len() >= self.shared.capacity {
                warn!(
                    capacity = self.shared.capacity,
                    topic = message.topic(),
                    "dispatch queue full; rejecting message"
                );
                return Err(EnqueueError::QueueFull {
                    capacity: self.shared.capacity,
                });
            }
            pending.messages.push_back(message);
        }

        self.shared.wakeup.notify_one();
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.lock().messages.len()
    }

    /// Number of messages handed to the producer so far.
    pub fn dispatched(&self) -> u64 {
        self.shared.dispatched.load(Ordering::Relaxed)
    }

    /// Stops accepting messages, lets the workers drain what is queued, and
    /// waits for them to exit.
    pub async fn shutdown(&self) {
        // Closed under the queue lock, so every accepted message is queued
        // before the workers start their final drain.
        self.shared.pending.lock().closed = true;
        self.shutdown.cancel();
        let workers = std::mem::take(&mut *self.workers.lock());

        for result in futures::future::join_all(workers).await {
            if let Err(error) = result {
                warn!(?error, "dispatch worker failed");
            }
        }

        info!(dispatched = self.dispatched(), "dispatch queue stopped");
    }
}

async fn run_worker(worker: usize, shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        match shared.drain(worker) {
            Drained::Empty => select! {
                _ = shared.wakeup.notified() => {}
                _ = shutdown.cancelled() => break,
            },
            Drained::Backlogged => select! {
                _ = sleep(BACKLOG_RETRY) => {}
                _ = shutdown.cancelled() => break,
            },
        }
    }

    // Messages accepted before the queue closed are still owed to the broker.
    while shared.drain(worker) == Drained::Backlogged {
        sleep(BACKLOG_RETRY).await;
    }
    debug!(worker, "dispatch worker stopped");
}
