use std::{future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::{sleep, timeout};

use crate::producer::{
    BrokerCell, BrokerClient, BrokerError, Delivery, Produce, ProducerConfig, ProducerHandle,
    Record,
};

/// Everything a recording broker has been asked to produce, per handle.
#[derive(Clone, Default)]
pub struct Recorded {
    sync: Arc<Mutex<Vec<Record>>>,
    asynchronous: Arc<Mutex<Vec<Record>>>,
}

impl Recorded {
    pub fn sync_records(&self) -> Vec<Record> {
        self.sync.lock().clone()
    }

    pub fn async_records(&self) -> Vec<Record> {
        self.asynchronous.lock().clone()
    }
}

struct RecordingHandle {
    log: Arc<Mutex<Vec<Record>>>,
}

impl Produce for RecordingHandle {
    fn produce(&mut self, record: &Record) -> Result<Delivery, BrokerError> {
        let mut log = self.log.lock();
        log.push(record.clone());
        Ok(Delivery {
            partition: 0,
            offset: log.len() as i64 - 1,
        })
    }
}

pub fn recording_client() -> (Arc<BrokerClient>, Recorded) {
    let recorded = Recorded::default();
    let handles = recorded.clone();
    let factory = move |_: &[String],
                        _: &ProducerConfig|
          -> Result<(ProducerHandle, ProducerHandle), BrokerError> {
        Ok((
            Box::new(RecordingHandle {
                log: Arc::clone(&handles.sync),
            }),
            Box::new(RecordingHandle {
                log: Arc::clone(&handles.asynchronous),
            }),
        ))
    };

    let client = BrokerCell::new()
        .initialize(&[], ProducerConfig::default(), &factory)
        .expect("recording client");
    (client, recorded)
}

pub async fn eventually<F>(condition: F)
where
    F: Fn() -> bool,
{
    timeout(Duration::from_secs(1), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition was not met in time");
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    timeout(Duration::from_secs(1), future)
        .await
        .expect("operation timed out")
}
