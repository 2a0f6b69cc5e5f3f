//! One stream client: a reader feeding the hub and a writer draining the
//! client's mailbox.

use std::fmt::Display;

use axum::extract::ws::{Message as Frame, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::{select, sync::mpsc};
use tracing::{debug, warn};

use crate::{
    hub::{ConnectionId, HubHandle},
    message::{Message, decode_frame, encode_frame},
};

pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// Why a reader loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    Closed,
    TransportError,
    Malformed,
    HubStopped,
}

/// Serves an upgraded WebSocket until either side of it ends.
pub async fn serve(socket: WebSocket, hub: HubHandle, mailbox_capacity: usize) {
    let (sink, stream) = socket.split();
    run(stream, sink, hub, mailbox_capacity).await;
}

/// Registers a connection, runs its reader and writer, and unregisters it
/// as soon as either loop ends.
pub async fn run<S, E, K>(stream: S, sink: K, hub: HubHandle, mailbox_capacity: usize)
where
    S: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
    K: Sink<Frame> + Unpin + Send + 'static,
    K::Error: Display + Send,
{
    let id = hub.next_id();
    let (mailbox, outbox) = mpsc::channel(mailbox_capacity.max(1));

    if let Err(error) = hub.register(id, mailbox).await {
        warn!(id, %error, "could not register stream client");
        return;
    }

    let mut writer = tokio::spawn(write_loop(id, outbox, sink));

    let writer_finished = select! {
        end = read_loop(id, stream, &hub) => {
            debug!(id, ?end, "reader stopped");
            false
        }
        result = &mut writer => {
            if let Err(error) = result {
                warn!(id, ?error, "writer task failed");
            }
            true
        }
    };

    if let Err(error) = hub.unregister(id).await {
        debug!(id, %error, "hub stopped before connection cleanup");
    }

    // Unregistering drops the hub's mailbox sender, so the writer flushes what
    // is left and closes the transport.
    if !writer_finished {
        if let Err(error) = writer.await {
            warn!(id, ?error, "writer task failed");
        }
    }
}

/// Reads frames until the client goes away, relaying each valid message.
///
/// Malformed JSON ends the connection. Well-formed messages that fail
/// validation are logged and skipped.
pub async fn read_loop<S, E>(id: ConnectionId, mut stream: S, hub: &HubHandle) -> ReadEnd
where
    S: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    while let Some(frame) = stream.next().await {
        let bytes = match frame {
            Ok(Frame::Text(text)) => text.into_bytes(),
            Ok(Frame::Binary(bytes)) => bytes,
            Ok(Frame::Ping(_) | Frame::Pong(_)) => continue,
            Ok(Frame::Close(_)) => return ReadEnd::Closed,
            Err(error) => {
                warn!(id, %error, "error reading frame");
                return ReadEnd::TransportError;
            }
        };

        let payload = match decode_frame(&bytes) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(id, %error, "error decoding frame");
                return ReadEnd::Malformed;
            }
        };

        let message = match Message::try_from(payload) {
            Ok(message) => message,
            Err(error) => {
                warn!(id, %error, "ignoring invalid message");
                continue;
            }
        };

        if hub.relay(id, message).await.is_err() {
            return ReadEnd::HubStopped;
        }
    }

    ReadEnd::Closed
}

/// Writes every mailbox message as a JSON text frame, then closes the sink.
pub async fn write_loop<K>(id: ConnectionId, mut outbox: mpsc::Receiver<Message>, mut sink: K)
where
    K: Sink<Frame> + Unpin,
    K::Error: Display,
{
    while let Some(message) = outbox.recv().await {
        let text = match encode_frame(&message) {
            Ok(text) => text,
            Err(error) => {
                warn!(id, %error, "error encoding message");
                continue;
            }
        };

        if let Err(error) = sink.send(Frame::Text(text)).await {
            warn!(id, %error, "error writing message");
            break;
        }
    }

    if let Err(error) = sink.close().await {
        debug!(id, %error, "error closing connection");
    }
}
