// ── SOAR seeing store ──
//
// The SOAR variant never talks to an instrument. It reads the most recent
// seeing record from an external store and republishes it while current.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SoarSettings;
use crate::measurement::{Measurement, SeeingDetails};
use crate::model::ControllerState;
use crate::telemetry::{Telemetry, TelemetrySink};

/// One row of the external seeing table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeeingRecord {
    pub timestamp: DateTime<Utc>,
    pub seeing: f64,
    #[serde(default)]
    pub airmass: Option<f64>,
    #[serde(default)]
    pub hr_num: Option<i64>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Source of externally produced seeing records.
#[async_trait]
pub trait SeeingStore: Send + Sync {
    /// The most recent record, if the store holds any.
    async fn latest(&self) -> Result<Option<SeeingRecord>, StoreError>;
}

// ── Stores ───────────────────────────────────────────────────────────

/// In-process store, filled by hand.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<SeeingRecord>>,
}

impl MemoryStore {
    pub fn push(&self, record: SeeingRecord) {
        self.records.lock().push(record);
    }
}

#[async_trait]
impl SeeingStore for MemoryStore {
    async fn latest(&self) -> Result<Option<SeeingRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .iter()
            .max_by_key(|r| r.timestamp)
            .cloned())
    }
}

/// JSON array of [`SeeingRecord`]s, re-read on every query.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SeeingStore for FileStore {
    async fn latest(&self) -> Result<Option<SeeingRecord>, StoreError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;
        let records: Vec<SeeingRecord> =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
                path: self.path.clone(),
                source,
            })?;
        Ok(records.into_iter().max_by_key(|r| r.timestamp))
    }
}

// ── Controller ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SoarController {
    inner: Arc<SoarInner>,
}

struct SoarInner {
    store: Arc<dyn SeeingStore>,
    check_interval: Duration,
    validity: Duration,
    telemetry: Arc<Telemetry>,
    last_seen: Mutex<Option<DateTime<Utc>>>,
    task: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SoarController {
    /// Reads from `settings.source` when set, otherwise from an empty
    /// [`MemoryStore`].
    pub fn from_settings(
        settings: &SoarSettings,
        validity: Duration,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        let store: Arc<dyn SeeingStore> = match &settings.source {
            Some(path) => Arc::new(FileStore::new(path.clone())),
            None => Arc::new(MemoryStore::default()),
        };
        Self::with_store(store, settings.check_interval, validity, sink)
    }

    pub fn with_store(
        store: Arc<dyn SeeingStore>,
        check_interval: Duration,
        validity: Duration,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            inner: Arc::new(SoarInner {
                store,
                check_interval,
                validity,
                telemetry: Arc::new(Telemetry::new(sink)),
                last_seen: Mutex::new(None),
                task: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.inner.telemetry
    }

    pub async fn start(&self) {
        let mut task = self.inner.task.lock().await;
        if task.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(self.clone(), cancel.clone()));
        *task = Some((cancel, handle));
        self.inner.telemetry.set_state(ControllerState::Running);
    }

    pub async fn stop(&self) {
        let task = self.inner.task.lock().await.take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            let _ = handle.await;
        }
        self.inner.telemetry.set_state(ControllerState::Disconnected);
    }

    /// Query the store once. Returns the measurement recorded, if any.
    pub async fn check(&self) -> Option<Measurement> {
        let telemetry = &self.inner.telemetry;
        let record = match self.inner.store.latest().await {
            Ok(record) => {
                if telemetry.state().is_faulted() {
                    telemetry.set_state(ControllerState::Running);
                }
                record?
            }
            Err(e) => {
                warn!(error = %e, "seeing store query failed");
                telemetry.fault(e.to_string());
                return None;
            }
        };

        {
            let mut last = self.inner.last_seen.lock();
            if last.is_some_and(|seen| record.timestamp <= seen) {
                return None;
            }
            *last = Some(record.timestamp);
        }
        if record.seeing <= 0.0 {
            warn!(seeing = record.seeing, "store holds non-positive seeing");
            return None;
        }

        let measurement = Measurement::new(record.seeing, record.timestamp, self.inner.validity)
            .with_details(SeeingDetails {
                airmass: record.airmass,
                hr_num: record.hr_num,
                ..SeeingDetails::default()
            });
        if !measurement.is_current() {
            debug!(timestamp = %record.timestamp, "latest store record already expired");
            return None;
        }
        info!(seeing = record.seeing, timestamp = %record.timestamp, "new seeing record");
        telemetry.record(measurement.clone());
        Some(measurement)
    }
}

async fn run(soar: SoarController, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(soar.inner.check_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = soar.check() => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::telemetry::NullSink;
    use crate::telemetry::tests::RecordingSink;
    use pretty_assertions::assert_eq;

    fn record(age: chrono::Duration, seeing: f64) -> SeeingRecord {
        SeeingRecord {
            timestamp: Utc::now() - age,
            seeing,
            airmass: Some(1.2),
            hr_num: Some(1708),
        }
    }

    fn controller(store: Arc<dyn SeeingStore>, sink: Arc<dyn TelemetrySink>) -> SoarController {
        SoarController::with_store(
            store,
            Duration::from_secs(180),
            Duration::from_secs(60),
            sink,
        )
    }

    #[tokio::test]
    async fn records_only_newer_entries() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(RecordingSink::default());
        let soar = controller(store.clone(), sink.clone());

        assert!(soar.check().await.is_none());

        store.push(record(chrono::Duration::seconds(10), 0.7));
        let m = soar.check().await.unwrap();
        assert_eq!(m.seeing, 0.7);
        assert_eq!(m.details.hr_num, Some(1708));

        assert!(soar.check().await.is_none());
        assert_eq!(sink.published.lock().len(), 1);

        store.push(record(chrono::Duration::seconds(1), 0.9));
        assert_eq!(soar.check().await.unwrap().seeing, 0.9);
        assert_eq!(soar.telemetry().current().unwrap().seeing, 0.9);
    }

    #[tokio::test]
    async fn stale_and_bad_records_are_ignored() {
        let store = Arc::new(MemoryStore::default());
        let soar = controller(store.clone(), Arc::new(NullSink));

        store.push(record(chrono::Duration::minutes(10), 0.7));
        assert!(soar.check().await.is_none());

        store.push(record(chrono::Duration::seconds(1), -1.0));
        assert!(soar.check().await.is_none());
        assert!(soar.telemetry().latest().is_none());
    }

    #[tokio::test]
    async fn file_store_returns_the_newest_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seeing.json");
        let records = vec![
            record(chrono::Duration::seconds(30), 0.6),
            record(chrono::Duration::seconds(5), 0.8),
            record(chrono::Duration::seconds(50), 0.4),
        ];
        std::fs::write(&path, serde_json::to_vec(&records).unwrap()).unwrap();

        let latest = FileStore::new(&path).latest().await.unwrap().unwrap();
        assert_eq!(latest, records[1]);
    }

    #[tokio::test]
    async fn unreadable_store_faults_until_it_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seeing.json");
        let sink = Arc::new(RecordingSink::default());
        let soar = controller(Arc::new(FileStore::new(&path)), sink.clone());

        assert!(soar.check().await.is_none());
        assert!(soar.telemetry().state().is_faulted());

        std::fs::write(&path, b"not json").unwrap();
        assert!(soar.check().await.is_none());
        assert_eq!(sink.faults.lock().len(), 1);

        let records = vec![record(chrono::Duration::seconds(2), 0.55)];
        std::fs::write(&path, serde_json::to_vec(&records).unwrap()).unwrap();
        assert_eq!(soar.check().await.unwrap().seeing, 0.55);
        assert_eq!(soar.telemetry().state(), ControllerState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn background_loop_polls_the_store() {
        let store = Arc::new(MemoryStore::default());
        store.push(record(chrono::Duration::seconds(1), 0.65));
        let soar = controller(store, Arc::new(NullSink));

        soar.start().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(soar.telemetry().latest().unwrap().seeing, 0.65);

        soar.stop().await;
        assert_eq!(soar.telemetry().state(), ControllerState::Disconnected);
        soar.start().await;
        soar.stop().await;
        assert!(soar.inner.task.lock().await.is_none());
    }
}
