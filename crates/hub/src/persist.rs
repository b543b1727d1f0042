//! Append-only CSV logs for sensor readings and confirmed effector states.
//!
//! The control loop never touches the files. It hands rows to a [`Recorder`],
//! and a single writer task owns the files, so a slow disk never delays the
//! handshake.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::effector::EffectorKind;
use crate::manager::EffectorManager;
use crate::sensors::SensorSnapshot;

const SENSOR_HEADER: &str =
    "timestamp_utc,soil_humidity,soil_temperature,system_air_humidity,system_air_temperature";
const EFFECTOR_HEADER: &str = "timestamp_utc,air_blower,water_pump,radiator_valve,air_renew_valve";

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// Confirmed state of every effector at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectorRow {
    pub at: OffsetDateTime,
    pub air_blower: bool,
    pub water_pump: bool,
    pub radiator_valve: bool,
    pub air_renew_valve: bool,
}

impl EffectorRow {
    pub fn capture<C: Clock>(manager: &EffectorManager<C>) -> Self {
        let on = |kind| manager.effector(kind).confirmed().is_on();
        Self {
            at: manager.now(),
            air_blower: on(EffectorKind::Blower),
            water_pump: on(EffectorKind::WaterPump),
            radiator_valve: on(EffectorKind::RadiatorValve),
            air_renew_valve: on(EffectorKind::AirRenewValve),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Sensor(SensorSnapshot),
    Effectors(EffectorRow),
}

fn timestamp(at: OffsetDateTime) -> Result<String> {
    at.to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .context("failed to format row timestamp")
}

impl Row {
    /// One complete CSV line, newline included.
    fn to_line(&self) -> Result<String> {
        Ok(match self {
            Row::Sensor(s) => format!(
                "{},{},{},{},{}\n",
                timestamp(s.captured_at)?,
                s.soil_humidity,
                s.soil_temperature,
                s.air_humidity,
                s.air_temperature
            ),
            Row::Effectors(e) => format!(
                "{},{},{},{},{}\n",
                timestamp(e.at)?,
                e.air_blower,
                e.water_pump,
                e.radiator_valve,
                e.air_renew_valve
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// Recorder (producer side)
// ---------------------------------------------------------------------------

/// Cheap, cloneable, never-blocking hand-off to the writer task.
#[derive(Debug, Clone)]
pub struct Recorder {
    tx: mpsc::UnboundedSender<Row>,
}

impl Recorder {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Row>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn record(&self, row: Row) {
        if self.tx.send(row).is_err() {
            warn!("row writer gone, dropping row");
        }
    }
}

// ---------------------------------------------------------------------------
// CSV store (writer side)
// ---------------------------------------------------------------------------

pub struct CsvStore {
    sensor_path: PathBuf,
    effector_path: PathBuf,
    /// Shared with the uploader so a commit never sees a half-written line.
    lock: Arc<Mutex<()>>,
}

impl CsvStore {
    pub async fn open(
        dir: impl AsRef<Path>,
        sensor_file: &str,
        effector_file: &str,
        lock: Arc<Mutex<()>>,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create log dir {}", dir.display()))?;

        let store = Self {
            sensor_path: dir.join(sensor_file),
            effector_path: dir.join(effector_file),
            lock,
        };
        write_header_if_new(&store.sensor_path, SENSOR_HEADER).await?;
        write_header_if_new(&store.effector_path, EFFECTOR_HEADER).await?;

        info!(
            sensors = %store.sensor_path.display(),
            effectors = %store.effector_path.display(),
            "csv logs ready"
        );
        Ok(store)
    }

    pub fn paths(&self) -> [&Path; 2] {
        [&self.sensor_path, &self.effector_path]
    }

    pub async fn write(&self, row: &Row) -> Result<()> {
        let path = match row {
            Row::Sensor(_) => &self.sensor_path,
            Row::Effectors(_) => &self.effector_path,
        };
        let line = row.to_line()?;

        let _guard = self.lock.lock().await;
        append(path, line.as_bytes()).await
    }
}

async fn append(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("failed to append to {}", path.display()))?;
    file.flush().await?;
    Ok(())
}

async fn write_header_if_new(path: &Path, header: &str) -> Result<()> {
    let empty = match fs::metadata(path).await {
        Ok(meta) => meta.len() == 0,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            return Err(e).with_context(|| format!("failed to stat {}", path.display()));
        }
    };
    if empty {
        append(path, format!("{header}\n").as_bytes()).await?;
        debug!(path = %path.display(), "csv header written");
    }
    Ok(())
}

/// Start the writer task. It runs until every [`Recorder`] clone is dropped.
pub fn spawn_writer(store: CsvStore) -> (Recorder, JoinHandle<()>) {
    let (recorder, mut rx) = Recorder::channel();
    let handle = tokio::spawn(async move {
        while let Some(row) = rx.recv().await {
            if let Err(e) = store.write(&row).await {
                error!("csv write failed: {e:#}");
            }
        }
        debug!("row writer stopped");
    });
    (recorder, handle)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2025-06-01 12:00 UTC);

    fn snapshot() -> SensorSnapshot {
        SensorSnapshot {
            captured_at: T0,
            soil_humidity: 52.1,
            soil_temperature: 31.4,
            air_humidity: 61.0,
            air_temperature: 24.2,
            air_o2: None,
        }
    }

    fn effectors() -> EffectorRow {
        EffectorRow {
            at: T0,
            air_blower: true,
            water_pump: false,
            radiator_valve: true,
            air_renew_valve: false,
        }
    }

    async fn open(dir: &Path) -> CsvStore {
        CsvStore::open(dir, "sensors.csv", "effectors.csv", Arc::new(Mutex::new(())))
            .await
            .unwrap()
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn sensor_line_format() {
        let line = Row::Sensor(snapshot()).to_line().unwrap();
        assert_eq!(line, "2025-06-01T12:00:00Z,52.1,31.4,61,24.2\n");
    }

    #[test]
    fn effector_line_format() {
        let line = Row::Effectors(effectors()).to_line().unwrap();
        assert_eq!(line, "2025-06-01T12:00:00Z,true,false,true,false\n");
    }

    #[test]
    fn timestamps_are_written_in_utc() {
        let mut s = snapshot();
        s.captured_at = datetime!(2025-06-01 05:00 -7);
        let line = Row::Sensor(s).to_line().unwrap();
        assert!(line.starts_with("2025-06-01T12:00:00Z,"), "{line}");
    }

    #[tokio::test]
    async fn open_writes_headers_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        store.write(&Row::Sensor(snapshot())).await.unwrap();
        drop(store);

        // Reopening an existing log must not repeat the header.
        let store = open(dir.path()).await;
        store.write(&Row::Sensor(snapshot())).await.unwrap();

        let content = read(&dir.path().join("sensors.csv"));
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], SENSOR_HEADER);
        assert_eq!(read(&dir.path().join("effectors.csv")), format!("{EFFECTOR_HEADER}\n"));
    }

    #[tokio::test]
    async fn open_creates_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("logs").join("2025");
        let store = open(&nested).await;
        assert!(store.paths().iter().all(|p| p.exists()));
    }

    #[tokio::test]
    async fn rows_go_to_their_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        store.write(&Row::Effectors(effectors())).await.unwrap();

        assert_eq!(read(&dir.path().join("sensors.csv")).lines().count(), 1);
        let effectors = read(&dir.path().join("effectors.csv"));
        assert_eq!(effectors.lines().nth(1), Some("2025-06-01T12:00:00Z,true,false,true,false"));
    }

    #[tokio::test]
    async fn writer_drains_queue_then_stops() {
        let dir = tempfile::tempdir().unwrap();
        let (recorder, handle) = spawn_writer(open(dir.path()).await);

        for _ in 0..5 {
            recorder.record(Row::Sensor(snapshot()));
        }
        recorder.record(Row::Effectors(effectors()));
        drop(recorder);
        handle.await.unwrap();

        assert_eq!(read(&dir.path().join("sensors.csv")).lines().count(), 6);
        assert_eq!(read(&dir.path().join("effectors.csv")).lines().count(), 2);
    }

    #[tokio::test]
    async fn recorder_survives_dead_writer() {
        let (recorder, rx) = Recorder::channel();
        drop(rx);
        // Logged and dropped, never panics.
        recorder.record(Row::Sensor(snapshot()));
    }
}
