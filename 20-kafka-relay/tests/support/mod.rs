#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender};
use kafka_relay::producer::{
    BrokerCell, BrokerClient, BrokerError, Delivery, DeliveryReport, Produce, ProducerConfig,
    ProducerHandle, Record,
};
use parking_lot::Mutex;
use tokio::time::{sleep, timeout};

pub const WAIT: Duration = Duration::from_secs(2);

/// Calls seen by a broker double, split by handle.
#[derive(Clone, Default)]
pub struct BrokerLog {
    sync: Arc<Mutex<Vec<Record>>>,
    asynchronous: Arc<Mutex<Vec<Record>>>,
    reports: Arc<Mutex<Vec<DeliveryReport>>>,
    gate: Arc<Mutex<Option<Sender<()>>>>,
}

impl BrokerLog {
    pub fn sync_records(&self) -> Vec<Record> {
        self.sync.lock().clone()
    }

    pub fn async_records(&self) -> Vec<Record> {
        self.asynchronous.lock().clone()
    }

    pub fn reports(&self) -> Vec<DeliveryReport> {
        self.reports.lock().clone()
    }

    /// Lets a gated async handle run freely from now on.
    pub fn open_async_gate(&self) {
        self.gate.lock().take();
    }
}

/// Always-succeeding handle. With `exclusive` set it fails any call that
/// overlaps another call on the same handle.
struct FakeHandle {
    log: Arc<Mutex<Vec<Record>>>,
    exclusive: Option<Arc<AtomicBool>>,
    fail_with: Option<BrokerError>,
    gate: Option<Receiver<()>>,
}

impl Produce for FakeHandle {
    fn produce(&mut self, record: &Record) -> Result<Delivery, BrokerError> {
        if let Some(gate) = &self.gate {
            // Returns once the gate's sender is dropped.
            let _ = gate.recv();
        }

        if let Some(in_flight) = &self.exclusive {
            if in_flight.swap(true, Ordering::SeqCst) {
                return Err(BrokerError::Transport("overlapping send".into()));
            }
            thread::sleep(Duration::from_millis(2));
            in_flight.store(false, Ordering::SeqCst);
        }

        if let Some(error) = &self.fail_with {
            return Err(error.clone());
        }

        let mut log = self.log.lock();
        log.push(record.clone());
        Ok(Delivery {
            partition: 0,
            offset: log.len() as i64 - 1,
        })
    }
}

#[derive(Default)]
pub struct FakeBroker {
    exclusive_sync: bool,
    failing_async: Option<BrokerError>,
    gated_async: bool,
    pipeline_capacity: Option<usize>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sync handle rejects overlapping calls.
    pub fn exclusive_sync(mut self) -> Self {
        self.exclusive_sync = true;
        self
    }

    /// Async handle fails every send with `error`.
    pub fn failing_async(mut self, error: BrokerError) -> Self {
        self.failing_async = Some(error);
        self
    }

    /// Async handle blocks on every record until
    /// [`BrokerLog::open_async_gate`] is called.
    pub fn gated_async(mut self) -> Self {
        self.gated_async = true;
        self
    }

    pub fn pipeline_capacity(mut self, capacity: usize) -> Self {
        self.pipeline_capacity = Some(capacity);
        self
    }

    pub fn connect(self) -> (Arc<BrokerClient>, BrokerLog) {
        let log = BrokerLog::default();
        let gate = self.gated_async.then(|| {
            let (open, gate) = crossbeam_channel::bounded(0);
            *log.gate.lock() = Some(open);
            gate
        });
        let handles = log.clone();
        let exclusive = self
            .exclusive_sync
            .then(|| Arc::new(AtomicBool::new(false)));
        let failing_async = self.failing_async;

        let factory = move |_: &[String],
                            _: &ProducerConfig|
              -> Result<(ProducerHandle, ProducerHandle), BrokerError> {
            Ok((
                Box::new(FakeHandle {
                    log: Arc::clone(&handles.sync),
                    exclusive: exclusive.clone(),
                    fail_with: None,
                    gate: None,
                }),
                Box::new(FakeHandle {
                    log: Arc::clone(&handles.asynchronous),
                    exclusive: None,
                    fail_with: failing_async.clone(),
                    gate: gate.clone(),
                }),
            ))
        };

        let reports = Arc::clone(&log.reports);
        let cell = BrokerCell::with_delivery_hook(Arc::new(move |report: &DeliveryReport| {
            reports.lock().push(report.clone());
        }));
        let config = ProducerConfig {
            pipeline_capacity: self
                .pipeline_capacity
                .unwrap_or(ProducerConfig::default().pipeline_capacity),
            ..ProducerConfig::default()
        };
        let client = cell
            .initialize(&["fake:9092".into()], config, &factory)
            .expect("fake broker connects");

        (client, log)
    }
}

pub async fn eventually<F>(condition: F)
where
    F: Fn() -> bool,
{
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition was not met in time");
}
