//! Membership and fan-out for live stream connections.
//!
//! The [`Hub`] loop is the only owner of the connection map. Everything else
//! talks to it through a [`HubHandle`], which turns register, unregister and
//! broadcast calls into [`HubCommand`]s on one channel, so membership changes
//! and fan-out are applied strictly in the order the loop receives them.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;
use tokio::{
    select,
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{message::Message, producer::BrokerClient};

pub const DEFAULT_COMMAND_CAPACITY: usize = 100;

pub type ConnectionId = u64;

/// Sending half of a connection's bounded outbound queue.
pub type Mailbox = mpsc::Sender<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    pub command_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_capacity: DEFAULT_COMMAND_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("connection hub is not running")]
    Closed,
}

enum HubCommand {
    Register {
        id: ConnectionId,
        mailbox: Mailbox,
    },
    Unregister {
        id: ConnectionId,
    },
    Broadcast {
        message: Message,
        except: Option<ConnectionId>,
    },
    Count {
        respond_to: oneshot::Sender<usize>,
    },
}

pub fn channel(producer: Arc<BrokerClient>, config: HubConfig) -> (Hub, HubHandle) {
    let (commands_tx, commands_rx) = mpsc::channel(config.command_capacity.max(1));

    let hub = Hub {
        commands: commands_rx,
        clients: HashMap::new(),
    };
    let handle = HubHandle {
        commands: commands_tx,
        producer,
        next_id: Arc::new(AtomicU64::new(1)),
    };

    (hub, handle)
}

pub struct Hub {
    commands: mpsc::Receiver<HubCommand>,
    clients: HashMap<ConnectionId, Mailbox>,
}

impl Hub {
    /// Runs until `shutdown` fires or every handle is dropped.
    ///
    /// Connections still registered when the loop exits lose their mailbox,
    /// which ends their writer loops.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("connection hub started");

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    info!(connections = self.clients.len(), "connection hub shutting down");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        debug!("all hub handles dropped");
                        break;
                    }
                },
            }
        }
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { id, mailbox } => self.register(id, mailbox),
            HubCommand::Unregister { id } => self.unregister(id),
            HubCommand::Broadcast { message, except } => self.broadcast(&message, except),
            HubCommand::Count { respond_to } => {
                let _ = respond_to.send(self.clients.len());
            }
        }
    }

    fn register(&mut self, id: ConnectionId, mailbox: Mailbox) {
        // Ids come from HubHandle::next_id, so a repeat means a caller bug. The
        // newer mailbox wins and the old one is closed by the drop.
        if self.clients.insert(id, mailbox).is_some() {
            warn!(id, "connection registered twice; replacing its mailbox");
        }
        info!(id, connections = self.clients.len(), "stream client connected");
    }

    fn unregister(&mut self, id: ConnectionId) {
        if self.clients.remove(&id).is_some() {
            info!(id, connections = self.clients.len(), "stream client disconnected");
        }
    }

    fn broadcast(&self, message: &Message, except: Option<ConnectionId>) {
        let mut delivered = 0usize;

        for (&id, mailbox) in &self.clients {
            if except == Some(id) {
                continue;
            }
            match mailbox.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(id, topic = message.topic(), "mailbox full; dropping message for slow client");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(id, topic = message.topic(), "mailbox closed; dropping message");
                }
            }
        }

        debug!(topic = message.topic(), delivered, "broadcast message");
    }
}

/// Cloneable front end of the hub loop.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    producer: Arc<BrokerClient>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register(&self, id: ConnectionId, mailbox: Mailbox) -> Result<(), HubError> {
        self.send(HubCommand::Register { id, mailbox }).await
    }

    /// Removing an id that is not registered is a no-op.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.send(HubCommand::Unregister { id }).await
    }

    pub async fn broadcast(&self, message: Message) -> Result<(), HubError> {
        self.send(HubCommand::Broadcast {
            message,
            except: None,
        })
        .await
    }

    /// Forwards an inbound stream message to the broker and to every other
    /// connection.
    ///
    /// The broker send runs on its own task; its result is only logged and
    /// the caller never waits for the acknowledgement.
    pub async fn relay(&self, origin: ConnectionId, message: Message) -> Result<(), HubError> {
        let producer = Arc::clone(&self.producer);
        let outbound = message.clone();
        tokio::spawn(async move {
            match producer
                .send_sync(outbound.topic(), outbound.key(), outbound.payload())
                .await
            {
                Ok(delivery) => debug!(
                    origin,
                    topic = outbound.topic(),
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "relayed message stored"
                ),
                Err(error) => warn!(
                    origin,
                    topic = outbound.topic(),
                    %error,
                    "failed to send relayed message to broker"
                ),
            }
        });

        self.send(HubCommand::Broadcast {
            message,
            except: Some(origin),
        })
        .await
    }

    pub async fn connection_count(&self) -> Result<usize, HubError> {
        let (respond_to, response) = oneshot::channel();
        self.send(HubCommand::Count { respond_to }).await?;
        response.await.map_err(|_| HubError::Closed)
    }

    async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HubError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{eventually, recording_client, within};

    fn message(payload: &str) -> Message {
        Message::new("chat", Some("room-1".into()), payload).expect("valid message")
    }

    fn start_hub() -> (HubHandle, CancellationToken, crate::test_support::Recorded) {
        let (producer, recorded) = recording_client();
        let (hub, handle) = channel(producer, HubConfig::default());
        let shutdown = CancellationToken::new();
        tokio::spawn(hub.run(shutdown.clone()));
        (handle, shutdown, recorded)
    }

    #[tokio::test]
    async fn broadcast_reaches_every_mailbox() {
        let (hub, shutdown, _) = start_hub();
        let (tx_one, mut rx_one) = mpsc::channel(4);
        let (tx_two, mut rx_two) = mpsc::channel(4);

        hub.register(hub.next_id(), tx_one).await.expect("register");
        hub.register(hub.next_id(), tx_two).await.expect("register");
        hub.broadcast(message("hello")).await.expect("broadcast");

        assert_eq!(within(rx_one.recv()).await, Some(message("hello")));
        assert_eq!(within(rx_two.recv()).await, Some(message("hello")));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn relay_skips_origin_and_reaches_broker() {
        let (hub, shutdown, recorded) = start_hub();
        let origin = hub.next_id();
        let (tx_origin, mut rx_origin) = mpsc::channel(4);
        let (tx_peer, mut rx_peer) = mpsc::channel(4);

        hub.register(origin, tx_origin).await.expect("register");
        hub.register(hub.next_id(), tx_peer).await.expect("register");
        hub.relay(origin, message("ping")).await.expect("relay");

        assert_eq!(within(rx_peer.recv()).await, Some(message("ping")));
        eventually(|| recorded.sync_records().len() == 1).await;
        assert!(rx_origin.try_recv().is_err());

        let record = &recorded.sync_records()[0];
        assert_eq!(record.topic, "chat");
        assert_eq!(record.key.as_deref(), Some("room-1"));
        assert_eq!(record.value, "ping");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn full_mailbox_does_not_block_others() {
        let (hub, shutdown, _) = start_hub();
        let (tx_slow, _rx_slow) = mpsc::channel(1);
        let (tx_fast, mut rx_fast) = mpsc::channel(8);

        hub.register(hub.next_id(), tx_slow).await.expect("register");
        hub.register(hub.next_id(), tx_fast).await.expect("register");
        for n in 0..3 {
            hub.broadcast(message(&n.to_string())).await.expect("broadcast");
        }

        for n in 0..3 {
            assert_eq!(within(rx_fast.recv()).await, Some(message(&n.to_string())));
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn unregister_closes_mailbox_and_ignores_unknown_ids() {
        let (hub, shutdown, _) = start_hub();
        let id = hub.next_id();
        let (tx, mut rx) = mpsc::channel(4);

        hub.register(id, tx).await.expect("register");
        hub.unregister(9_999).await.expect("unknown id is a no-op");
        assert_eq!(hub.connection_count().await, Ok(1));

        hub.unregister(id).await.expect("unregister");
        assert_eq!(within(rx.recv()).await, None);
        assert_eq!(hub.connection_count().await, Ok(0));

        hub.unregister(id).await.expect("second unregister is a no-op");
        assert_eq!(hub.connection_count().await, Ok(0));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn shutdown_stops_loop_and_closes_mailboxes() {
        let (hub, shutdown, _) = start_hub();
        let (tx, mut rx) = mpsc::channel(4);
        hub.register(hub.next_id(), tx).await.expect("register");
        assert_eq!(hub.connection_count().await, Ok(1));

        shutdown.cancel();

        assert_eq!(within(rx.recv()).await, None);
        eventually(|| hub.commands.is_closed()).await;
        assert_eq!(hub.broadcast(message("late")).await, Err(HubError::Closed));
    }
}
