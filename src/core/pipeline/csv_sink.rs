//! CSV consumer
//! One file per (device, characteristic) and session. Every file has its own queue
//! and writer task; rows are flushed after every batch.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::Configuration;
use crate::core::decoder::Row;
use crate::core::pipeline::consumer::next_until_drained;
use crate::core::pipeline::{Consumer, ConsumerQueue, DecodedSample};
use crate::logging::Logger;
use crate::utils::{ensure_directory_exists, sanitize_file_component};

/// How long a file may take to work off its queue once the session stops.
pub const FILE_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

const SESSION_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

struct OpenFile {
    name: String,
    tx: mpsc::Sender<Arc<DecodedSample>>,
    task: JoinHandle<()>,
}

pub struct CsvSink {
    queue: ConsumerQueue,
    folder: PathBuf,
    session_stamp: String,
    aliases: BTreeMap<String, String>,
    file_queue_capacity: usize,
    halt: CancellationToken,
    log: Logger,
}

impl CsvSink {
    pub fn new(
        config: &Configuration,
        session_start: DateTime<Local>,
        halt: CancellationToken,
        log: Logger,
    ) -> Self {
        Self {
            queue: ConsumerQueue::new("CsvSink", config.consumer_queue_capacity, log.clone()),
            folder: config.output_folder.clone(),
            session_stamp: session_start.format(SESSION_STAMP_FORMAT).to_string(),
            aliases: config.device_aliases.clone(),
            file_queue_capacity: config.consumer_queue_capacity,
            halt,
            log,
        }
    }

    /// Writes into `folder` instead of the configured output folder.
    pub fn with_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.folder = folder.into();
        self
    }

    /// `{alias-or-address}_{session}_{characteristic}`, without extension.
    pub fn file_stem(&self, address: &str, characteristic: &str) -> String {
        let device = self
            .aliases
            .get(address)
            .map(String::as_str)
            .unwrap_or(address);
        sanitize_file_component(&format!(
            "{}_{}_{}",
            device, self.session_stamp, characteristic
        ))
    }

    async fn route(
        &self,
        files: &mut HashMap<(String, String), OpenFile>,
        files_drained: &CancellationToken,
        sample: Arc<DecodedSample>,
    ) -> Result<()> {
        let key = (sample.address.clone(), sample.characteristic.name.clone());
        let file = files
            .entry(key)
            .or_insert_with(|| self.open_file(&sample, files_drained));
        file.tx
            .send(sample)
            .await
            .map_err(|_| anyhow!("writer for {} has stopped", file.name))
    }

    fn open_file(&self, sample: &DecodedSample, files_drained: &CancellationToken) -> OpenFile {
        let name = self.file_stem(&sample.address, &sample.characteristic.name);
        let (tx, rx) = mpsc::channel(self.file_queue_capacity);
        let writer = FileWriter {
            folder: self.folder.clone(),
            stem: name.clone(),
            columns: sample.characteristic.columns.clone(),
            rx,
            log: self.log.clone(),
        };

        let drained = files_drained.clone();
        let halt = self.halt.clone();
        let log = self.log.clone();
        let task = tokio::spawn(async move {
            let stem = writer.stem.clone();
            if let Err(e) = writer.run(drained).await {
                log.error(format_args!("CSV file {} failed: {:#}", stem, e));
                halt.cancel();
            }
        });
        OpenFile { name, tx, task }
    }
}

#[async_trait]
impl Consumer for CsvSink {
    fn name(&self) -> &str {
        "CsvSink"
    }

    fn accept(&self, sample: Arc<DecodedSample>) -> bool {
        self.queue.offer(sample)
    }

    fn backlog(&self) -> usize {
        self.queue.backlog()
    }

    async fn run(&self, drained: CancellationToken) -> Result<()> {
        ensure_directory_exists(&self.folder, &self.log).await?;

        let files_drained = CancellationToken::new();
        let mut files: HashMap<(String, String), OpenFile> = HashMap::new();
        let mut result = Ok(());
        {
            let mut rx = self.queue.receiver().await;
            while let Some(sample) = next_until_drained(&mut *rx, &drained).await {
                if let Err(e) = self.route(&mut files, &files_drained, sample).await {
                    result = Err(e);
                    break;
                }
            }
        }

        let pending: usize = files
            .values()
            .map(|f| f.tx.max_capacity() - f.tx.capacity())
            .sum();
        if pending > 0 {
            self.log.info(format_args!(
                "CsvSink ready to shut down. Waiting for {} items in file queues...",
                pending
            ));
        }
        files_drained.cancel();

        for file in files.into_values() {
            let OpenFile { name, tx, task } = file;
            drop(tx);
            match timeout(FILE_CLOSE_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.log
                        .error(format_args!("Writer task for {} failed: {}", name, e));
                    self.halt.cancel();
                }
                Err(_) => self.log.warn(format_args!(
                    "Timed out closing {}, unwritten rows are lost",
                    name
                )),
            }
        }
        self.log.info("CsvSink shut down");
        result
    }
}

/// Owns one CSV file for the duration of a session.
struct FileWriter {
    folder: PathBuf,
    stem: String,
    columns: Vec<String>,
    rx: mpsc::Receiver<Arc<DecodedSample>>,
    log: Logger,
}

impl FileWriter {
    async fn run(mut self, drained: CancellationToken) -> Result<()> {
        let (mut file, path) = create_unique(&self.folder, &self.stem)
            .await
            .with_context(|| format!("creating CSV file in {:?}", self.folder))?;
        self.log.info(format_args!("Created {:?}", path));

        file.write_all(&encode_header(&self.columns)?)
            .await
            .with_context(|| format!("writing {:?}", path))?;
        file.flush().await?;

        while let Some(sample) = next_until_drained(&mut self.rx, &drained).await {
            file.write_all(&encode_rows(&sample.rows)?)
                .await
                .with_context(|| format!("writing {:?}", path))?;
            file.flush().await?;
        }

        file.sync_all().await?;
        self.log.debug(format_args!("Closed {:?}", path));
        Ok(())
    }
}

/// Creates `{stem}.csv`, or `{stem}_N.csv` if that name is already taken.
async fn create_unique(folder: &Path, stem: &str) -> std::io::Result<(File, PathBuf)> {
    let mut suffix = 0u32;
    loop {
        let name = if suffix == 0 {
            format!("{}.csv", stem)
        } else {
            format!("{}_{}.csv", stem, suffix)
        };
        let path = folder.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
            Err(e) => return Err(e),
        }
    }
}

fn encode_header(columns: &[String]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(columns)?;
    writer
        .into_inner()
        .map_err(|e| anyhow!("encoding CSV header: {}", e.error()))
}

fn encode_rows(rows: &[Row]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    for row in rows {
        writer.write_record(row.iter().map(|v| format_value(*v)))?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow!("encoding CSV rows: {}", e.error()))
}

/// Integral values are written without a fractional part (`123456`, `0`); everything
/// else in the shortest form that reads back to the same `f64`.
fn format_value(value: f64) -> String {
    if value == 0.0 {
        "0".to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::test_support::sample;
    use crate::logging::CaptureLog;
    use chrono::TimeZone;

    fn session_start() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap()
    }

    fn sink(folder: &Path, halt: CancellationToken, log: Logger) -> Arc<CsvSink> {
        let config = Configuration::default().validated().unwrap();
        Arc::new(CsvSink::new(&config, session_start(), halt, log).with_folder(folder))
    }

    async fn run_with(sink: &Arc<CsvSink>, samples: Vec<Arc<DecodedSample>>) -> Result<()> {
        let drained = CancellationToken::new();
        let task = {
            let sink = sink.clone();
            let drained = drained.clone();
            tokio::spawn(async move { sink.run(drained).await })
        };
        for s in samples {
            assert!(sink.accept(s));
        }
        drained.cancel();
        task.await.unwrap()
    }

    #[test]
    fn file_stem_uses_alias_or_sanitized_address() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path(), CancellationToken::new(), Logger::new("test"));
        assert_eq!(
            sink.file_stem("FB:4A:66:AC:08:01", "data"),
            "SmartVNS0_20240305_140709_data"
        );
        assert_eq!(
            sink.file_stem("00:11:22:33:44:55", "raw imu"),
            "00_11_22_33_44_55_20240305_140709_raw_imu"
        );
    }

    #[test]
    fn integral_values_are_written_without_fraction() {
        assert_eq!(format_value(123456.0), "123456");
        assert_eq!(format_value(-200.0), "-200");
        assert_eq!(format_value(0.0), "0");
        assert_eq!(format_value(-0.0), "0");
        assert_eq!(format_value(0.25), "0.25");
        assert_eq!(format_value(1_700_000_000.5), "1700000000.5");

        let encoded = encode_rows(&[vec![1.5, 2000.0, -3.0, 0.0]]).unwrap();
        assert_eq!(String::from_utf8(encoded).unwrap().trim_end(), "1.5,2000,-3,0");
    }

    #[tokio::test]
    async fn writes_header_then_rows_per_device() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path(), CancellationToken::new(), Logger::new("test"));

        run_with(
            &sink,
            vec![
                sample("FB:4A:66:AC:08:01", "SmartVNS0", 1.0),
                sample("00:11:22:33:44:55", "SmartVNS", 5.0),
                sample("FB:4A:66:AC:08:01", "SmartVNS0", 2.0),
            ],
        )
        .await
        .unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("SmartVNS0_20240305_140709_data.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("sys_time,timestamp,gyro_x,"));
        assert_eq!(lines[0].split(',').count(), 15);
        assert_eq!(lines[1], "1700000000.5,1,0,0,0,0,0,0,0,0,0,0,0,0,0");
        assert!(lines[2].starts_with("1700000000.5,2,0,"));
        assert_eq!(lines[2].split(',').count(), 15);

        let other = std::fs::read_to_string(
            dir.path()
                .join("00_11_22_33_44_55_20240305_140709_data.csv"),
        )
        .unwrap();
        assert_eq!(other.lines().count(), 2);
    }

    #[tokio::test]
    async fn existing_session_file_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("SmartVNS0_20240305_140709_data.csv");
        std::fs::write(&first, "previous run\n").unwrap();

        let sink = sink(dir.path(), CancellationToken::new(), Logger::new("test"));
        run_with(&sink, vec![sample("FB:4A:66:AC:08:01", "SmartVNS0", 1.0)])
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&first).unwrap(), "previous run\n");
        let second = dir.path().join("SmartVNS0_20240305_140709_data_1.csv");
        assert_eq!(std::fs::read_to_string(second).unwrap().lines().count(), 2);
    }

    #[tokio::test]
    async fn missing_folder_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("output").join("today");
        let sink = sink(&folder, CancellationToken::new(), Logger::new("test"));
        run_with(&sink, vec![sample("FB:4A:66:AC:08:01", "SmartVNS0", 1.0)])
            .await
            .unwrap();
        assert!(folder.join("SmartVNS0_20240305_140709_data.csv").exists());
    }

    #[tokio::test]
    async fn io_failure_raises_halt() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("gone");
        let capture = CaptureLog::new();
        let halt = CancellationToken::new();
        let sink = sink(&folder, halt.clone(), Logger::with_sink("test", capture.clone()));

        let drained = CancellationToken::new();
        let task = {
            let sink = sink.clone();
            let drained = drained.clone();
            tokio::spawn(async move { sink.run(drained).await })
        };
        while !folder.exists() {
            tokio::task::yield_now().await;
        }
        std::fs::remove_dir(&folder).unwrap();
        sink.accept(sample("FB:4A:66:AC:08:01", "SmartVNS0", 1.0));

        halt.cancelled().await;
        drained.cancel();
        let _ = task.await.unwrap();
        assert!(capture.contains("CSV file SmartVNS0_20240305_140709_data failed"));
    }
}
