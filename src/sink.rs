/*!
Persistence of main-run samples.

The sampler hands over samples in per-chunk batches; where they end up is
the caller's business. [`MemorySink`] collects everything in RAM; with the
`csv` feature enabled, [`CsvSink`] streams records to disk instead.
*/

use crate::chain::InfoAtPoint;
use crate::error::Result;

/// One stored sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub chain: usize,
    pub iteration: u64,
    pub point: Vec<f64>,
    pub log_likelihood: f64,
    pub log_prior: f64,
    pub log_posterior: f64,
}

impl SampleRecord {
    pub(crate) fn new(chain: usize, iteration: u64, info: &InfoAtPoint) -> Self {
        SampleRecord {
            chain,
            iteration,
            point: info.point.clone(),
            log_likelihood: info.log_likelihood,
            log_prior: info.log_prior,
            log_posterior: info.log_posterior,
        }
    }
}

/// Receives batches of samples as they become available.
pub trait SampleSink {
    fn append(&mut self, records: &[SampleRecord]) -> Result<()>;
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<SampleRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[SampleRecord] {
        &self.records
    }

    /// Records of one chain only, in iteration order.
    pub fn chain_records(&self, chain: usize) -> impl Iterator<Item = &SampleRecord> {
        self.records.iter().filter(move |r| r.chain == chain)
    }
}

impl SampleSink for MemorySink {
    fn append(&mut self, records: &[SampleRecord]) -> Result<()> {
        self.records.extend_from_slice(records);
        Ok(())
    }
}

#[cfg(feature = "csv")]
pub use self::csv_sink::CsvSink;

#[cfg(feature = "csv")]
mod csv_sink {
    use super::{SampleRecord, SampleSink};
    use crate::error::{Error, Result};
    use std::fs::File;
    use std::path::Path;

    /// Streams records to a CSV file, one row per sample.
    ///
    /// The header is `chain,iteration,<parameter names...>,log_likelihood,
    /// log_prior,log_posterior`.
    pub struct CsvSink {
        writer: csv::Writer<File>,
        wrote_header: bool,
        parameter_names: Vec<String>,
    }

    impl CsvSink {
        pub fn create<P: AsRef<Path>>(path: P, parameter_names: Vec<String>) -> Result<Self> {
            let file = File::create(path).map_err(|e| Error::Sink(Box::new(e)))?;
            Ok(CsvSink {
                writer: csv::Writer::from_writer(file),
                wrote_header: false,
                parameter_names,
            })
        }

        fn write_header(&mut self) -> Result<()> {
            let mut header = vec!["chain".to_string(), "iteration".to_string()];
            header.extend(self.parameter_names.iter().cloned());
            header.extend(
                ["log_likelihood", "log_prior", "log_posterior"]
                    .iter()
                    .map(|s| s.to_string()),
            );
            self.writer
                .write_record(&header)
                .map_err(|e| Error::Sink(Box::new(e)))
        }

        /// Flushes buffered rows to the file.
        pub fn flush(&mut self) -> Result<()> {
            self.writer.flush().map_err(|e| Error::Sink(Box::new(e)))
        }
    }

    impl SampleSink for CsvSink {
        fn append(&mut self, records: &[SampleRecord]) -> Result<()> {
            if !self.wrote_header {
                self.write_header()?;
                self.wrote_header = true;
            }
            for record in records {
                let mut row = vec![record.chain.to_string(), record.iteration.to_string()];
                row.extend(record.point.iter().map(|x| x.to_string()));
                row.push(record.log_likelihood.to_string());
                row.push(record.log_prior.to_string());
                row.push(record.log_posterior.to_string());
                self.writer
                    .write_record(&row)
                    .map_err(|e| Error::Sink(Box::new(e)))?;
            }
            self.flush()
        }
    }
}
