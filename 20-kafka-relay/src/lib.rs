//! HTTP and WebSocket front door for a Kafka cluster.
//!
//! Messages arrive either as `POST /api/receive-message` requests or as
//! frames on a `/api/ws` stream. HTTP submissions are queued and pushed to the
//! broker by a fixed worker pool; stream frames are sent to the broker and
//! rebroadcast to every other connected stream client.
//!
//! - [`cli`] reads the service configuration from flags and environment.
//! - [`message`] defines the JSON payload, the validated [`message::Message`]
//!   and the stream frame encoding.
//! - [`producer`] wraps the broker connection: acknowledged and
//!   fire-and-forget sends, initialized once per process.
//! - [`dispatch`] is the bounded FIFO and worker pool behind the HTTP path.
//! - [`hub`] owns the set of live stream connections and serializes
//!   registration, removal and broadcast through one loop.
//! - [`connection`] runs the reader and writer halves of one stream client.
//! - [`http`] wires everything into an axum router.

pub mod cli;
pub mod connection;
pub mod dispatch;
pub mod http;
pub mod hub;
pub mod message;
pub mod producer;

#[cfg(test)]
pub(crate) mod test_support;
