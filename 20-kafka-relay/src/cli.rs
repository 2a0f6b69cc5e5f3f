use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::{
    connection::DEFAULT_MAILBOX_CAPACITY,
    dispatch::{DEFAULT_CAPACITY, DEFAULT_WORKERS, DispatchConfig},
    hub::{DEFAULT_COMMAND_CAPACITY, HubConfig},
    producer::{Acks, DEFAULT_PIPELINE_CAPACITY, ProducerConfig},
};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Port for the HTTP and WebSocket endpoints.
    #[arg(long, env = "PORT", default_value_t = 8045)]
    pub port: u16,

    /// Comma-separated list of Kafka brokers, e.g. `localhost:9092`.
    #[arg(long, env = "KAFKA_BROKERS", value_delimiter = ',', required = true)]
    pub brokers: Vec<String>,

    /// Number of workers draining the HTTP dispatch queue.
    #[arg(long, env = "WORKER_POOL_SIZE", default_value_t = DEFAULT_WORKERS, value_parser = parse_positive)]
    pub workers: usize,

    /// Maximum number of queued HTTP messages before submissions are rejected.
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = DEFAULT_CAPACITY, value_parser = parse_positive)]
    pub queue_capacity: usize,

    /// Outbound messages buffered per stream client before new ones are dropped.
    #[arg(long, env = "MAILBOX_CAPACITY", default_value_t = DEFAULT_MAILBOX_CAPACITY, value_parser = parse_positive)]
    pub mailbox_capacity: usize,

    /// Buffered register/unregister/broadcast commands for the connection hub.
    #[arg(long, env = "HUB_COMMAND_CAPACITY", default_value_t = DEFAULT_COMMAND_CAPACITY, value_parser = parse_positive)]
    pub hub_command_capacity: usize,

    /// Acknowledgement level requested from the brokers.
    #[arg(long, env = "KAFKA_REQUIRED_ACKS", value_enum, default_value_t = Acks::All)]
    pub required_acks: Acks,

    /// Retries per send; values below 10 are raised to 10.
    #[arg(long, env = "KAFKA_RETRY_MAX", default_value_t = 10)]
    pub retry_max: u32,

    /// How long the brokers may take to acknowledge a send.
    #[arg(long, env = "KAFKA_ACK_TIMEOUT_MS", default_value_t = 5_000)]
    pub ack_timeout_ms: u64,

    /// Records buffered for the broker's async pipeline before dispatch
    /// workers hold back.
    #[arg(long, env = "KAFKA_PIPELINE_CAPACITY", default_value_t = DEFAULT_PIPELINE_CAPACITY, value_parser = parse_positive)]
    pub pipeline_capacity: usize,

    /// Origin allowed to call the API from a browser.
    #[arg(long, env = "CLIENT_ORIGIN", default_value = "http://localhost:3000")]
    pub client_origin: String,

    /// Serve the `/api/ws` stream endpoint.
    #[arg(long, env = "ENABLE_WEBSOCKET", default_value_t = true, action = ArgAction::Set)]
    pub enable_websocket: bool,
}

impl Cli {
    /// Broker addresses with blanks and stray whitespace removed.
    pub fn broker_list(&self) -> Vec<String> {
        self.brokers
            .iter()
            .map(|broker| broker.trim())
            .filter(|broker| !broker.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            required_acks: self.required_acks,
            retry_max: self.retry_max,
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            pipeline_capacity: self.pipeline_capacity,
            ..ProducerConfig::default()
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            workers: self.workers,
            capacity: self.queue_capacity,
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            command_capacity: self.hub_command_capacity,
        }
    }
}

fn parse_positive(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(error) => Err(error.to_string()),
    }
}
