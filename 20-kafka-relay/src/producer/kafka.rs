//! Kafka backend built on `rdkafka`.
//!
//! Retries, acknowledgements and compression are handed to librdkafka through
//! its client configuration; each [`KafkaProducer::produce`] call waits for the
//! delivery report of exactly one record.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::executor::block_on;
use rdkafka::{
    ClientConfig,
    error::KafkaError,
    producer::{FutureProducer, FutureRecord, Producer},
    util::Timeout,
};
use tracing::debug;

use super::{
    Acks, BrokerError, Compression, Delivery, Produce, ProducerConfig, ProducerFactory,
    ProducerHandle, Record,
};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens two independent Kafka producers, one per [`BrokerClient`] handle.
///
/// [`BrokerClient`]: super::BrokerClient
#[derive(Debug, Default, Clone, Copy)]
pub struct KafkaFactory;

impl ProducerFactory for KafkaFactory {
    fn connect(
        &self,
        brokers: &[String],
        config: &ProducerConfig,
    ) -> Result<(ProducerHandle, ProducerHandle), BrokerError> {
        let sync_producer = KafkaProducer::connect(brokers, config)?;
        let async_producer = KafkaProducer::connect(brokers, config)?;
        Ok((Box::new(sync_producer), Box::new(async_producer)))
    }
}

pub struct KafkaProducer {
    inner: FutureProducer,
}

impl KafkaProducer {
    pub fn connect(brokers: &[String], config: &ProducerConfig) -> Result<Self, BrokerError> {
        let inner = client_config(brokers, config)
            .create::<FutureProducer>()
            .map_err(|error| BrokerError::Transport(error.to_string()))?;

        Ok(Self { inner })
    }
}

impl Produce for KafkaProducer {
    fn produce(&mut self, record: &Record) -> Result<Delivery, BrokerError> {
        let delivery = self
            .inner
            .send_result(future_record(record))
            .map_err(|(error, _)| broker_error(&record.topic, error))?;

        match block_on(delivery) {
            Ok(Ok((partition, offset))) => Ok(Delivery { partition, offset }),
            Ok(Err((error, _))) => Err(broker_error(&record.topic, error)),
            Err(_) => Err(BrokerError::Transport(
                "producer dropped the delivery report".to_string(),
            )),
        }
    }

    fn close(&mut self) -> Result<(), BrokerError> {
        debug!("flushing kafka producer");
        self.inner
            .flush(Timeout::After(FLUSH_TIMEOUT))
            .map_err(|error| BrokerError::Transport(error.to_string()))
    }
}

fn client_config(brokers: &[String], config: &ProducerConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", brokers.join(","))
        .set("acks", acks(config.required_acks))
        .set("message.send.max.retries", config.retry_max.to_string())
        .set("compression.type", compression(config.compression))
        .set(
            "request.timeout.ms",
            config.ack_timeout.as_millis().to_string(),
        );
    client
}

/// Maps a record onto the wire record, carrying its creation time as the
/// Kafka message timestamp in milliseconds.
fn future_record(record: &Record) -> FutureRecord<'_, str, str> {
    let wire = FutureRecord::to(&record.topic)
        .payload(record.value.as_str())
        .timestamp(timestamp_millis(record.timestamp));

    match record.key.as_deref() {
        Some(key) => wire.key(key),
        None => wire,
    }
}

fn timestamp_millis(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map(|since| since.as_millis() as i64)
        .unwrap_or_default()
}

fn broker_error(topic: &str, error: KafkaError) -> BrokerError {
    match error {
        KafkaError::MessageProduction(code) => BrokerError::Rejected {
            topic: topic.to_string(),
            reason: code.to_string(),
        },
        other => BrokerError::Transport(other.to_string()),
    }
}

fn acks(acks: Acks) -> &'static str {
    match acks {
        Acks::None => "0",
        Acks::One => "1",
        Acks::All => "all",
    }
}

fn compression(compression: Compression) -> &'static str {
    match compression {
        Compression::None => "none",
        Compression::Snappy => "snappy",
    }
}
