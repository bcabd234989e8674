use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use tracing::{debug, warn};

use crate::error::Result;

/// Receives one scalar per metric name and global step.
pub trait MetricSink {
    fn record(&mut self, name: &str, value: f64, step: usize);

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Emits every scalar as a `debug` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&mut self, name: &str, value: f64, step: usize) {
        debug!(metric = name, value, step);
    }
}

/// Appends `step,name,value` rows to a file.
pub struct CsvSink {
    writer: BufWriter<File>,
}

impl CsvSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let exists = path.exists();
        let file = File::options().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);
        if !exists {
            writeln!(writer, "step,name,value")?;
        }
        Ok(Self { writer })
    }
}

impl MetricSink for CsvSink {
    fn record(&mut self, name: &str, value: f64, step: usize) {
        if let Err(err) = writeln!(self.writer, "{step},{name},{value}") {
            warn!(%err, metric = name, "failed to write metric");
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub records: Vec<(String, f64, usize)>,
}

impl MemorySink {
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.records
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|&(_, v, _)| v)
            .collect()
    }
}

impl MetricSink for MemorySink {
    fn record(&mut self, name: &str, value: f64, step: usize) {
        self.records.push((name.to_string(), value, step));
    }
}

/// Fans out to several sinks.
impl<A: MetricSink, B: MetricSink> MetricSink for (A, B) {
    fn record(&mut self, name: &str, value: f64, step: usize) {
        self.0.record(name, value, step);
        self.1.record(name, value, step);
    }

    fn flush(&mut self) -> Result<()> {
        self.0.flush()?;
        self.1.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_sink_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");

        let mut sink = CsvSink::create(&path).unwrap();
        sink.record("loss/d_total", 1.5, 0);
        sink.flush().unwrap();
        drop(sink);

        let mut sink = CsvSink::create(&path).unwrap();
        sink.record("loss/g_total", -0.25, 1);
        sink.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "step,name,value\n0,loss/d_total,1.5\n1,loss/g_total,-0.25\n");
    }

    #[test]
    fn pair_fans_out() {
        let mut sink = (MemorySink::default(), MemorySink::default());
        sink.record("scale/g", 65536.0, 3);

        assert_eq!(sink.0.values("scale/g"), vec![65536.0]);
        assert_eq!(sink.1.records, vec![("scale/g".to_string(), 65536.0, 3)]);
    }
}
