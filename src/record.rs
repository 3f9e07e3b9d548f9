//! Trace records handed to sinks and file writers.
//!
//! File layout (comma-separated, or tab-separated for `.txt`):
//!
//! ```text
//! Start Frequency,0
//! Stop Frequency,1000000000
//! ...
//! DATA
//! 0,-87.2
//! 250000000,-86.9
//! ```

use serde::Serialize;
use std::path::Path;

#[cfg(feature = "storage_csv")]
use anyhow::Context;

/// One fetched trace and the loggable parameters in effect when it was fetched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SampleRecord {
    /// `(display name, value)` pairs, registration order
    pub parameters: Vec<(String, String)>,
    /// X axis (Hz, or seconds in zero span)
    pub x: Vec<f64>,
    /// Amplitudes
    pub y: Vec<f64>,
}

impl SampleRecord {
    /// Value recorded for the parameter displayed as `name`
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Field delimiter for `path`: tab for `.txt`, comma otherwise
    pub fn delimiter_for(path: &Path) -> u8 {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("txt") => b'\t',
            _ => b',',
        }
    }

    /// Write the record to `path`.
    #[cfg(feature = "storage_csv")]
    pub fn write_delimited(&self, path: &Path) -> anyhow::Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(Self::delimiter_for(path))
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("Failed to create record file {}", path.display()))?;

        for (name, value) in &self.parameters {
            writer.write_record([name.as_str(), value.as_str()])?;
        }
        writer.write_record(["DATA"])?;
        for (x, y) in self.x.iter().zip(&self.y) {
            writer.write_record([x.to_string(), y.to_string()])?;
        }
        writer
            .flush()
            .with_context(|| format!("Failed to flush record file {}", path.display()))?;
        tracing::debug!(path = %path.display(), points = self.x.len(), "record written");
        Ok(())
    }

    /// Without CSV support, records can only be published to sinks.
    #[cfg(not(feature = "storage_csv"))]
    pub fn write_delimited(&self, _path: &Path) -> anyhow::Result<()> {
        Err(anyhow::Error::new(crate::error::StationError::FeatureNotEnabled(
            "storage_csv".to_string(),
        )))
    }
}

/// `{prefix}-{YYYY-MM-DD}-{n}.csv` in `dir`, with `n` the first unused index.
pub fn next_record_path(dir: &Path, prefix: &str) -> std::path::PathBuf {
    let date = chrono::Local::now().format("%Y-%m-%d");
    (0..)
        .map(|n| dir.join(format!("{prefix}-{date}-{n}.csv")))
        .find(|path| !path.exists())
        .unwrap_or_else(|| dir.join(format!("{prefix}-{date}.csv")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record() -> SampleRecord {
        SampleRecord {
            parameters: vec![
                ("Start Frequency".into(), "0".into()),
                ("Stop Frequency".into(), "1000000000".into()),
            ],
            x: vec![0.0, 5e8, 1e9],
            y: vec![-80.5, -79.0, -81.25],
        }
    }

    #[test]
    fn test_delimiter_by_extension() {
        assert_eq!(SampleRecord::delimiter_for(Path::new("trace.txt")), b'\t');
        assert_eq!(SampleRecord::delimiter_for(Path::new("trace.csv")), b',');
        assert_eq!(SampleRecord::delimiter_for(Path::new("trace")), b',');
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn test_write_csv_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.csv");
        record().write_delimited(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Start Frequency,0");
        assert_eq!(lines[2], "DATA");
        assert_eq!(lines[3], "0,-80.5");
        assert_eq!(lines[5], "1000000000,-81.25");
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn test_write_tab_separated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace.txt");
        record().write_delimited(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Start Frequency\t0\n"));
    }

    #[test]
    fn test_next_record_path_skips_existing() {
        let dir = tempdir().unwrap();
        let first = next_record_path(dir.path(), "EMS1");
        std::fs::write(&first, "").unwrap();
        let second = next_record_path(dir.path(), "EMS1");
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("-1.csv"));
    }
}
