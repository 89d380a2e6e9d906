//! Output sinks for computed deltas
//!
//! One append-only stream per instrument. The file sinks keep a buffered
//! writer per instrument open for the lifetime of the sink and are flushed
//! by the delta job at the end of every run.
//!
//! Stream layout under the output directory:
//!
//! ```text
//! output/
//!   BTC-PERP.csv     ticker,datetime (UTC),price,price change in last 60 sec ($)
//!   ETH-PERP.csv
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;
use types::delta::DeltaRecord;
use types::ids::InstrumentId;
use types::time::format_utc;

use crate::config::OutputFormat;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for delta records.
pub trait DeltaSink: Send {
    /// Append one record to the instrument's stream.
    fn write(&mut self, record: &DeltaRecord) -> Result<(), SinkError>;

    /// Push buffered records to the underlying storage.
    fn flush(&mut self) -> Result<(), SinkError>;

    /// Create the streams of known instruments ahead of the first record.
    fn prepare(&mut self, _instruments: &[InstrumentId]) -> Result<(), SinkError> {
        Ok(())
    }

    fn backend_type(&self) -> &'static str;
}

/// Open the file sink for `format` under `dir`, creating the directory.
pub fn open_sink(
    format: OutputFormat,
    dir: impl Into<PathBuf>,
    target_lag: Duration,
) -> Result<Box<dyn DeltaSink>, SinkError> {
    let sink: Box<dyn DeltaSink> = match format {
        OutputFormat::Csv => Box::new(CsvSink::new(dir, target_lag)?),
        OutputFormat::Jsonl => Box::new(JsonlSink::new(dir)?),
    };
    Ok(sink)
}

/// File name stem for an instrument's stream.
///
/// Anything outside `[A-Za-z0-9_-]` becomes `_`, so names never escape the
/// output directory.
pub fn file_stem(instrument: &InstrumentId) -> String {
    instrument
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Quote a CSV field when it holds a delimiter, quote or line break.
pub fn escape_csv(field: &str) -> String {
    if field.contains(&[',', '"', '\n', '\r'][..]) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Header row of the CSV streams.
pub fn csv_header(target_lag: Duration) -> String {
    format!(
        "ticker,datetime (UTC),price,price change in last {} sec ($)",
        target_lag.as_secs_f64()
    )
}

/// Lazily opened per-instrument append streams.
struct StreamFiles {
    dir: PathBuf,
    format: OutputFormat,
    header: Option<String>,
    writers: BTreeMap<InstrumentId, BufWriter<File>>,
}

impl StreamFiles {
    fn new(dir: PathBuf, format: OutputFormat, header: Option<String>) -> Result<Self, SinkError> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            format,
            header,
            writers: BTreeMap::new(),
        })
    }

    fn path_for(&self, instrument: &InstrumentId) -> PathBuf {
        self.dir
            .join(format!("{}.{}", file_stem(instrument), self.format.extension()))
    }

    fn writer(&mut self, instrument: &InstrumentId) -> Result<&mut BufWriter<File>, SinkError> {
        if !self.writers.contains_key(instrument) {
            let path = self.path_for(instrument);
            let writer = open_stream(&path, self.header.as_deref())?;
            debug!(instrument = %instrument, path = %path.display(), "Opened output stream");
            self.writers.insert(instrument.clone(), writer);
        }
        self.writers.get_mut(instrument).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "stream missing after open").into()
        })
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        for writer in self.writers.values_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for StreamFiles {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn open_stream(path: &Path, header: Option<&str>) -> Result<BufWriter<File>, SinkError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let is_empty = file.metadata()?.len() == 0;
    let mut writer = BufWriter::new(file);
    if let (true, Some(header)) = (is_empty, header) {
        writeln!(writer, "{}", header)?;
        writer.flush()?;
    }
    Ok(writer)
}

/// CSV streams: `<dir>/<instrument>.csv`.
pub struct CsvSink {
    files: StreamFiles,
}

impl CsvSink {
    pub fn new(dir: impl Into<PathBuf>, target_lag: Duration) -> Result<Self, SinkError> {
        Ok(Self {
            files: StreamFiles::new(dir.into(), OutputFormat::Csv, Some(csv_header(target_lag)))?,
        })
    }

    pub fn path_for(&self, instrument: &InstrumentId) -> PathBuf {
        self.files.path_for(instrument)
    }
}

impl DeltaSink for CsvSink {
    fn write(&mut self, record: &DeltaRecord) -> Result<(), SinkError> {
        let writer = self.files.writer(&record.instrument)?;
        writeln!(
            writer,
            "{},{},{},{}",
            escape_csv(record.instrument.as_str()),
            format_utc(record.publish_time),
            record.price,
            record.delta
        )?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.files.flush()
    }

    fn prepare(&mut self, instruments: &[InstrumentId]) -> Result<(), SinkError> {
        for instrument in instruments {
            self.files.writer(instrument)?;
        }
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        self.files.format.extension()
    }
}

/// JSON Lines streams: `<dir>/<instrument>.jsonl`, one record per line.
pub struct JsonlSink {
    files: StreamFiles,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SinkError> {
        Ok(Self {
            files: StreamFiles::new(dir.into(), OutputFormat::Jsonl, None)?,
        })
    }

    pub fn path_for(&self, instrument: &InstrumentId) -> PathBuf {
        self.files.path_for(instrument)
    }
}

impl DeltaSink for JsonlSink {
    fn write(&mut self, record: &DeltaRecord) -> Result<(), SinkError> {
        let line = serde_json::to_string(record)?;
        let writer = self.files.writer(&record.instrument)?;
        writeln!(writer, "{}", line)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.files.flush()
    }

    fn prepare(&mut self, instruments: &[InstrumentId]) -> Result<(), SinkError> {
        for instrument in instruments {
            self.files.writer(instrument)?;
        }
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        self.files.format.extension()
    }
}

/// In-memory sink. Clones share the same record list.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<DeltaRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far, in write order.
    pub fn records(&self) -> Vec<DeltaRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeltaSink for MemorySink {
    fn write(&mut self, record: &DeltaRecord) -> Result<(), SinkError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
