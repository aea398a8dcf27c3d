use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::{ffi::OsStr, io::Write, path::PathBuf};

use crate::error::{Result, SqcError};
use crate::types::EnvironmentReading;

const MAX_FLUSH_FAILURES: usize = 10;

/// One emitted measurement row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub timestamp: DateTime<Utc>,
    /// Node path, `Stripscan/Istrip`
    pub measurement: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub index: usize,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance_ok: Option<bool>,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

impl Row {
    pub fn new(measurement: impl Into<String>, kind: &str, index: usize) -> Self {
        Self {
            timestamp: Utc::now(),
            measurement: measurement.into(),
            kind: kind.to_string(),
            index,
            temperature: None,
            humidity: None,
            strip: None,
            strip_index: None,
            tolerance_ok: None,
            values: Map::new(),
        }
    }

    pub fn environment(mut self, reading: Option<EnvironmentReading>) -> Self {
        self.temperature = reading.map(|r| r.temperature);
        self.humidity = reading.map(|r| r.humidity);
        self
    }

    pub fn strip(mut self, name: &str, index: usize) -> Self {
        self.strip = Some(name.to_string());
        self.strip_index = Some(index);
        self
    }

    pub fn tolerance_ok(mut self, ok: bool) -> Self {
        self.tolerance_ok = Some(ok);
        self
    }

    pub fn value(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }
}

/// Sink for measurement rows
pub trait Recorder {
    fn record(&mut self, row: Row) -> Result<()>;

    /// Flushes everything still buffered
    fn finish(&mut self) -> Result<()>;
}

/// Keeps rows in memory
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    pub rows: Vec<Row>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows_for(&self, measurement: &str) -> Vec<&Row> {
        self.rows
            .iter()
            .filter(|r| r.measurement == measurement)
            .collect()
    }
}

impl Recorder for MemoryRecorder {
    fn record(&mut self, row: Row) -> Result<()> {
        self.rows.push(row);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Buffered JSON-lines writer.
///
/// Transient write failures are logged and retried on the next flush; only
/// after repeated consecutive failures the error is returned. With
/// `final_format_json` the file is rewritten as a pretty JSON array on finish.
#[derive(Debug)]
pub struct JsonlRecorder<T = Row>
where
    T: Serialize + DeserializeOwned,
{
    buffer: Vec<T>,
    buffer_size: usize,
    file_path: PathBuf,
    final_format_json: bool,
    flush_failures: usize,
    finished: bool,
}

impl<T> JsonlRecorder<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new<P: Into<PathBuf>>(file_path: P, buffer_size: usize, final_format_json: bool) -> Self {
        let mut path = file_path.into();
        let extension = if final_format_json { "json" } else { "jsonl" };
        if path.extension() != Some(OsStr::new(extension)) {
            path.set_extension(extension);
        }

        Self {
            buffer: Vec::with_capacity(buffer_size.max(1)),
            buffer_size: buffer_size.max(1),
            file_path: path,
            final_format_json,
            flush_failures: 0,
            finished: false,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.file_path
    }

    pub fn add(&mut self, entry: T) -> Result<()> {
        self.buffer.push(entry);
        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        match self.write_buffer() {
            Ok(()) => {
                debug!(
                    "Flushed {} rows to {}",
                    self.buffer.len(),
                    self.file_path.display()
                );
                self.flush_failures = 0;
                self.buffer.clear();
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                log::error!(
                    "Flush failure {}/{} for {}: {e}",
                    self.flush_failures,
                    MAX_FLUSH_FAILURES,
                    self.file_path.display()
                );
                if self.flush_failures % 3 == 0 {
                    log::warn!(
                        "Experiencing intermittent flush failures ({}/{})",
                        self.flush_failures,
                        MAX_FLUSH_FAILURES
                    );
                }
                if self.flush_failures >= MAX_FLUSH_FAILURES {
                    return Err(SqcError::Io(std::io::Error::other(format!(
                        "too many consecutive flush failures for {}: {e}",
                        self.file_path.display()
                    ))));
                }
                Ok(())
            }
        }
    }

    fn write_buffer(&self) -> Result<()> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        let mut writer = std::io::BufWriter::new(file);
        for entry in &self.buffer {
            serde_json::to_writer(&mut writer, entry)?;
            writeln!(writer)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Rewrites the JSON-lines file as a JSON array
    pub fn finalize_as_json(&mut self) -> Result<()> {
        if !self.final_format_json {
            return Ok(());
        }
        self.flush()?;
        if !self.file_path.exists() {
            std::fs::write(&self.file_path, "[]")?;
            return Ok(());
        }

        let content = std::fs::read_to_string(&self.file_path)?;
        let entries = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<T>)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        std::fs::write(&self.file_path, serde_json::to_string_pretty(&entries)?)?;
        info!(
            "Converted {} rows to JSON in {}",
            entries.len(),
            self.file_path.display()
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Recorder for JsonlRecorder<Row> {
    fn record(&mut self, row: Row) -> Result<()> {
        self.add(row)
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.flush()?;
        if !self.buffer.is_empty() {
            return Err(SqcError::Io(std::io::Error::other(format!(
                "{} rows still buffered, could not write {}",
                self.buffer.len(),
                self.file_path.display()
            ))));
        }
        self.finalize_as_json()?;
        self.finished = true;
        Ok(())
    }
}

impl<T> Drop for JsonlRecorder<T>
where
    T: Serialize + DeserializeOwned,
{
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.flush();
            let _ = self.finalize_as_json();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(index: usize) -> Row {
        Row::new("Stripscan/Istrip", "istrip", index)
            .strip("P1", 0)
            .tolerance_ok(true)
            .value("istrip_i", 1.5e-10)
    }

    #[test]
    fn test_extension_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let recorder: JsonlRecorder<Row> = JsonlRecorder::new(dir.path().join("run"), 4, false);
        assert_eq!(recorder.path().extension(), Some(OsStr::new("jsonl")));
        let recorder: JsonlRecorder<Row> = JsonlRecorder::new(dir.path().join("run.txt"), 4, true);
        assert_eq!(recorder.path().extension(), Some(OsStr::new("json")));
    }

    #[test]
    fn test_rows_buffered_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = JsonlRecorder::new(dir.path().join("run.jsonl"), 3, false);
        recorder.record(row(0)).unwrap();
        recorder.record(row(1)).unwrap();
        assert_eq!(recorder.len(), 2);
        assert!(!recorder.path().exists());

        recorder.record(row(2)).unwrap();
        assert!(recorder.is_empty());
        recorder.record(row(3)).unwrap();
        recorder.finish().unwrap();

        let content = std::fs::read_to_string(recorder.path()).unwrap();
        let rows: Vec<Row> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[3].index, 3);
        assert_eq!(rows[0].get_f64("istrip_i"), Some(1.5e-10));
        assert_eq!(rows[0].strip.as_deref(), Some("P1"));
    }

    #[test]
    fn test_flat_row_layout() {
        let json = serde_json::to_value(row(7)).unwrap();
        assert_eq!(json["type"], "istrip");
        assert_eq!(json["istrip_i"], 1.5e-10);
        assert_eq!(json["tolerance_ok"], true);
        assert!(json.get("values").is_none());
    }

    #[test]
    fn test_finalize_as_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = JsonlRecorder::new(dir.path().join("run"), 10, true);
        recorder.record(row(0)).unwrap();
        recorder.record(row(1)).unwrap();
        recorder.finish().unwrap();

        let content = std::fs::read_to_string(recorder.path()).unwrap();
        let rows: Vec<Row> = serde_json::from_str(&content).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_transient_failure_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing").join("run.jsonl");
        let mut recorder = JsonlRecorder::new(missing, 1, false);
        recorder.record(row(0)).unwrap();
        assert_eq!(recorder.len(), 1);
    }

    #[test]
    fn test_finish_fails_while_rows_are_buffered() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing").join("run.jsonl");
        let mut recorder = JsonlRecorder::new(missing, 16, false);
        recorder.record(row(0)).unwrap();
        assert!(recorder.finish().is_err());
        assert_eq!(recorder.len(), 1);

        std::fs::create_dir(dir.path().join("missing")).unwrap();
        recorder.finish().unwrap();
        assert!(recorder.is_empty());
        let content = std::fs::read_to_string(recorder.path()).unwrap();
        assert_eq!(content.lines().count(), 1);
    }
}
