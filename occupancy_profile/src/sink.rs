use crate::error::SinkError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub const CSV_HEADER: [&str; 5] = ["Set", "Iteration", "SPrime", "LPrime", "Cycles"];

/// One probe: after priming `set`, line (`s_prime`, `l_prime`) was read in `cycles` ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OccupancyRecord {
    #[serde(rename = "Set")]
    pub set: usize,
    #[serde(rename = "Iteration")]
    pub iteration: usize,
    #[serde(rename = "SPrime")]
    pub s_prime: usize,
    #[serde(rename = "LPrime")]
    pub l_prime: usize,
    #[serde(rename = "Cycles")]
    pub cycles: u64,
}

pub trait RecordSink {
    fn record(&mut self, record: &OccupancyRecord) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl RecordSink for Vec<OccupancyRecord> {
    fn record(&mut self, record: &OccupancyRecord) -> Result<(), SinkError> {
        self.push(*record);
        Ok(())
    }
}

impl<S: RecordSink + ?Sized> RecordSink for &mut S {
    fn record(&mut self, record: &OccupancyRecord) -> Result<(), SinkError> {
        (**self).record(record)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

/**
Writes records as CSV:

```text
Set,Iteration,SPrime,LPrime,Cycles
0,0,0,0,270
0,0,1,0,45
...
```

The header is written on creation, so an aborted run still leaves a well-formed prefix.
*/
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl CsvSink<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let file = File::create(path.as_ref())?;
        log::info!("writing {}", path.as_ref().display());
        CsvSink::from_writer(BufWriter::new(file))
    }
}

impl<W: Write> CsvSink<W> {
    pub fn from_writer(writer: W) -> Result<Self, SinkError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(writer);
        writer.write_record(CSV_HEADER)?;
        Ok(CsvSink { writer })
    }

    pub fn into_inner(self) -> Result<W, SinkError> {
        self.writer
            .into_inner()
            .map_err(|e| SinkError::Io(e.into_error()))
    }
}

impl<W: Write> RecordSink for CsvSink<W> {
    fn record(&mut self, record: &OccupancyRecord) -> Result<(), SinkError> {
        self.writer.serialize(record)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}
