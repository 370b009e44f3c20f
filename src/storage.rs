//! Sweep result storage.
//!
//! [`CsvWriter`] writes one row per [`MeasurementSample`] with the header
//! `frequency_hz,vpp_in,vpp_out,gain_db,phase_deg`. It is available with the
//! `storage_csv` feature (on by default).

use crate::sweep::MeasurementSample;
#[cfg(feature = "storage_csv")]
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Column names of the CSV output
pub const CSV_HEADER: [&str; 5] = ["frequency_hz", "vpp_in", "vpp_out", "gain_db", "phase_deg"];

/// Storage failures
#[derive(Error, Debug)]
pub enum StorageError {
    /// File could not be created or written
    #[error("cannot write '{path}': {reason}")]
    Write {
        /// Target file
        path: PathBuf,
        /// Underlying failure
        reason: String,
    },

    /// Output format compiled out
    #[error("feature '{0}' is not enabled")]
    FeatureNotEnabled(String),
}

/// Writer for CSV files.
#[cfg(feature = "storage_csv")]
pub struct CsvWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: usize,
}

#[cfg(feature = "storage_csv")]
impl CsvWriter {
    /// Create (or truncate) `path` and write the header row.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let fail = |e: &dyn std::fmt::Display| StorageError::Write {
            path: path.clone(),
            reason: e.to_string(),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| fail(&e))?;
        }
        let mut writer = csv::Writer::from_path(&path).map_err(|e| fail(&e))?;
        writer.write_record(CSV_HEADER).map_err(|e| fail(&e))?;

        tracing::info!(path = %path.display(), "CSV writer opened");
        Ok(Self {
            path,
            writer,
            rows: 0,
        })
    }

    /// Append samples.
    pub fn write(&mut self, samples: &[MeasurementSample]) -> Result<(), StorageError> {
        for sample in samples {
            self.writer
                .write_record(&[
                    sample.frequency_hz.to_string(),
                    sample.vpp_in.to_string(),
                    sample.vpp_out.to_string(),
                    sample.gain_db.to_string(),
                    sample.phase_deg.to_string(),
                ])
                .map_err(|e| self.error(&e))?;
            self.rows += 1;
        }
        Ok(())
    }

    /// Flush and close the file.
    pub fn finish(mut self) -> Result<PathBuf, StorageError> {
        self.writer.flush().map_err(|e| self.error(&e))?;
        tracing::info!(path = %self.path.display(), rows = self.rows, "CSV writer closed");
        Ok(self.path)
    }

    /// Rows written so far, header excluded
    pub fn rows(&self) -> usize {
        self.rows
    }

    fn error(&self, e: &dyn std::fmt::Display) -> StorageError {
        StorageError::Write {
            path: self.path.clone(),
            reason: e.to_string(),
        }
    }
}

/// Write `samples` to a new CSV file at `path`.
#[cfg(feature = "storage_csv")]
pub fn write_csv<P: AsRef<Path>>(path: P, samples: &[MeasurementSample]) -> Result<PathBuf, StorageError> {
    let mut writer = CsvWriter::create(path)?;
    writer.write(samples)?;
    writer.finish()
}

/// Write `samples` to a new CSV file at `path`.
#[cfg(not(feature = "storage_csv"))]
pub fn write_csv<P: AsRef<Path>>(_path: P, _samples: &[MeasurementSample]) -> Result<PathBuf, StorageError> {
    Err(StorageError::FeatureNotEnabled("storage_csv".to_string()))
}
