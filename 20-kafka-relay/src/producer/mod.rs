//! Broker producer shared by every part of the relay.
//!
//! A [`BrokerClient`] owns two producer handles. The sync handle sits behind a
//! mutex and answers [`BrokerClient::send_sync`] with the partition and offset
//! the broker assigned. The async handle is owned by a dedicated pipeline
//! thread fed through a bounded channel; [`BrokerClient::send_async`] only
//! offers records to that channel, and outcomes are visible through logs and
//! the optional [`DeliveryHook`]. Callers that can hold a record back when the
//! pipeline is full use [`BrokerClient::try_send_async`] instead.
//!
//! The client is built once per process through a [`BrokerCell`] and passed
//! around as `Arc<BrokerClient>`.

use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, SystemTime},
};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

#[cfg(feature = "kafka")]
pub mod kafka;

const MIN_RETRY_MAX: u32 = 10;
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_PIPELINE_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Acks {
    /// Fire without waiting for the broker.
    None,
    /// Wait for the partition leader.
    One,
    /// Wait for every in-sync replica.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Snappy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    pub required_acks: Acks,
    pub retry_max: u32,
    pub compression: Compression,
    pub ack_timeout: Duration,
    /// Records the async pipeline holds before offers are refused.
    pub pipeline_capacity: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            required_acks: Acks::All,
            retry_max: MIN_RETRY_MAX,
            compression: Compression::Snappy,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            pipeline_capacity: DEFAULT_PIPELINE_CAPACITY,
        }
    }
}

impl ProducerConfig {
    /// Applies the settings every connection is opened with: acknowledged
    /// sends, at least ten retries, snappy compression.
    pub fn normalized(mut self) -> Self {
        if self.required_acks == Acks::None {
            self.required_acks = Acks::All;
        }
        self.retry_max = self.retry_max.max(MIN_RETRY_MAX);
        self.compression = Compression::Snappy;
        self.pipeline_capacity = self.pipeline_capacity.max(1);
        self
    }
}

/// One message as handed to a producer backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub key: Option<String>,
    pub value: String,
    pub timestamp: SystemTime,
}

impl Record {
    pub fn new(topic: &str, key: Option<&str>, value: &str) -> Self {
        Self {
            topic: topic.to_string(),
            key: key.filter(|key| !key.is_empty()).map(str::to_string),
            value: value.to_string(),
            timestamp: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker transport failed: {0}")]
    Transport(String),
    #[error("broker rejected message for topic '{topic}': {reason}")]
    Rejected { topic: String, reason: String },
    #[error("async pipeline is full")]
    Backlogged,
    #[error("producer is closed")]
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to start producer: {source}")]
pub struct ConnectionError {
    source: BrokerError,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("send task did not complete: {0}")]
    Aborted(#[from] JoinError),
}

/// Why [`BrokerClient::try_send_async`] refused a record.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum Backpressure {
    #[error("async pipeline is full")]
    Full,
    #[error("producer is closed")]
    Closed,
}

impl From<Backpressure> for BrokerError {
    fn from(reason: Backpressure) -> Self {
        match reason {
            Backpressure::Full => BrokerError::Backlogged,
            Backpressure::Closed => BrokerError::Closed,
        }
    }
}

/// A single connection to the broker.
///
/// Calls are blocking; the client never calls the same handle from two
/// threads at once.
pub trait Produce: Send + 'static {
    fn produce(&mut self, record: &Record) -> Result<Delivery, BrokerError>;

    fn close(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}

pub type ProducerHandle = Box<dyn Produce>;

/// Opens the sync and async handles for a broker list.
pub trait ProducerFactory: Send + Sync {
    fn connect(
        &self,
        brokers: &[String],
        config: &ProducerConfig,
    ) -> Result<(ProducerHandle, ProducerHandle), BrokerError>;
}

impl<F> ProducerFactory for F
where
    F: Fn(&[String], &ProducerConfig) -> Result<(ProducerHandle, ProducerHandle), BrokerError>
        + Send
        + Sync,
{
    fn connect(
        &self,
        brokers: &[String],
        config: &ProducerConfig,
    ) -> Result<(ProducerHandle, ProducerHandle), BrokerError> {
        self(brokers, config)
    }
}

/// Outcome of one fire-and-forget send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub record: Record,
    pub outcome: Result<Delivery, BrokerError>,
}

pub type DeliveryHook = Arc<dyn Fn(&DeliveryReport) + Send + Sync>;

/// One-time initialization slot for the process's [`BrokerClient`].
#[derive(Default)]
pub struct BrokerCell {
    client: OnceLock<Result<Arc<BrokerClient>, ConnectionError>>,
    hook: Option<DeliveryHook>,
}

impl BrokerCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delivery_hook(hook: DeliveryHook) -> Self {
        Self {
            client: OnceLock::new(),
            hook: Some(hook),
        }
    }

    /// Connects on the first call; every later or concurrent call returns
    /// the same client, or the same error if the first attempt failed.
    pub fn initialize<F>(
        &self,
        brokers: &[String],
        config: ProducerConfig,
        factory: &F,
    ) -> Result<Arc<BrokerClient>, ConnectionError>
    where
        F: ProducerFactory + ?Sized,
    {
        self.client
            .get_or_init(|| {
                BrokerClient::connect(brokers, config.normalized(), factory, self.hook.clone())
                    .map(Arc::new)
            })
            .clone()
    }

    pub fn get(&self) -> Option<Arc<BrokerClient>> {
        self.client.get()?.as_ref().ok().cloned()
    }
}

struct Pipeline {
    input: Sender<Record>,
    worker: thread::JoinHandle<Result<(), BrokerError>>,
}

pub struct BrokerClient {
    sync_handle: Arc<tokio::sync::Mutex<Option<ProducerHandle>>>,
    pipeline: Mutex<Option<Pipeline>>,
    closed: AtomicBool,
    hook: Option<DeliveryHook>,
}

impl BrokerClient {
    fn connect<F>(
        brokers: &[String],
        config: ProducerConfig,
        factory: &F,
        hook: Option<DeliveryHook>,
    ) -> Result<Self, ConnectionError>
    where
        F: ProducerFactory + ?Sized,
    {
        let (sync_handle, async_handle) = factory
            .connect(brokers, &config)
            .map_err(|source| ConnectionError { source })?;

        let (input, records) = bounded(config.pipeline_capacity);
        let pipeline_hook = hook.clone();
        let worker = thread::Builder::new()
            .name("broker-async-pipeline".to_string())
            .spawn(move || run_pipeline(async_handle, records, pipeline_hook))
            .map_err(|error| ConnectionError {
                source: BrokerError::Transport(error.to_string()),
            })?;

        info!(
            brokers = ?brokers,
            acks = ?config.required_acks,
            pipeline_capacity = config.pipeline_capacity,
            "connected to broker producer"
        );

        Ok(Self {
            sync_handle: Arc::new(tokio::sync::Mutex::new(Some(sync_handle))),
            pipeline: Mutex::new(Some(Pipeline { input, worker })),
            closed: AtomicBool::new(false),
            hook,
        })
    }

    /// Sends one message and waits for the broker's acknowledgement.
    ///
    /// Callers queue on an async lock, so only the send holding it occupies a
    /// blocking-pool thread.
    pub async fn send_sync(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &str,
    ) -> Result<Delivery, SendError> {
        let record = Record::new(topic, key, payload);
        let mut handle = Arc::clone(&self.sync_handle).lock_owned().await;

        let delivery = tokio::task::spawn_blocking(move || match handle.as_mut() {
            Some(producer) => producer.produce(&record),
            None => Err(BrokerError::Closed),
        })
        .await??;

        debug!(
            topic,
            partition = delivery.partition,
            offset = delivery.offset,
            "message acknowledged"
        );
        Ok(delivery)
    }

    /// Hands one message to the async pipeline and returns immediately.
    ///
    /// Nothing is reported back to the caller. A full pipeline or a closed
    /// client drops the message; both are logged and passed to the delivery
    /// hook.
    pub fn send_async(&self, topic: &str, key: Option<&str>, payload: &str) {
        let record = Record::new(topic, key, payload);
        if let Err((rejected, reason)) = self.offer(record) {
            warn!(topic = %rejected.topic, %reason, "message dropped");
            self.report(DeliveryReport {
                record: rejected,
                outcome: Err(reason.into()),
            });
        }
    }

    /// Like [`send_async`](Self::send_async), but a refused message is left
    /// with the caller instead of being dropped.
    pub fn try_send_async(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &str,
    ) -> Result<(), Backpressure> {
        self.offer(Record::new(topic, key, payload))
            .map_err(|(_, reason)| reason)
    }

    fn offer(&self, record: Record) -> Result<(), (Record, Backpressure)> {
        let pipeline = self.pipeline.lock();
        let Some(pipeline) = pipeline.as_ref() else {
            return Err((record, Backpressure::Closed));
        };

        pipeline.input.try_send(record).map_err(|error| match error {
            TrySendError::Full(record) => (record, Backpressure::Full),
            TrySendError::Disconnected(record) => (record, Backpressure::Closed),
        })
    }

    /// Drains the async pipeline and closes both handles.
    ///
    /// Blocks until any in-flight sync send and the pipeline thread have
    /// finished, so call it off the async runtime. Returns
    /// [`BrokerError::Closed`] if the client was already closed.
    pub fn close(&self) -> Result<(), BrokerError> {
        let Some(mut sync_handle) = self.sync_handle.blocking_lock().take() else {
            return Err(BrokerError::Closed);
        };
        self.closed.store(true, Ordering::SeqCst);

        let sync_result = sync_handle.close();
        if let Err(error) = &sync_result {
            warn!(%error, "failed to shut down sync producer cleanly");
        }

        let async_result = match self.pipeline.lock().take() {
            Some(Pipeline { input, worker }) => {
                drop(input);
                worker.join().unwrap_or_else(|_| {
                    Err(BrokerError::Transport("async pipeline panicked".to_string()))
                })
            }
            None => Ok(()),
        };
        if let Err(error) = &async_result {
            warn!(%error, "failed to shut down async producer cleanly");
        }

        info!("broker producer closed");
        sync_result.and(async_result)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn report(&self, report: DeliveryReport) {
        if let Some(hook) = &self.hook {
            hook(&report);
        }
    }
}

fn run_pipeline(
    mut handle: ProducerHandle,
    records: Receiver<Record>,
    hook: Option<DeliveryHook>,
) -> Result<(), BrokerError> {
    for record in records.iter() {
        let outcome = handle.produce(&record);
        match &outcome {
            Ok(delivery) => debug!(
                topic = %record.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                "async message delivered"
            ),
            Err(error) => warn!(topic = %record.topic, %error, "failed to produce message"),
        }

        if let Some(hook) = &hook {
            hook(&DeliveryReport { record, outcome });
        }
    }

    handle.close()
}
