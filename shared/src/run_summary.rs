//! Tabular record of a focusing run.
//!
//! Ellipse parameters are appended once per completed batch and currents and
//! cost once per optimizer evaluation, so the columns can differ in length.
//! The CSV export pads short columns with NaN.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::image_proc::DetectedEllipse;

pub const CSV_HEADER: [&str; 9] = [
    "Count", "xc", "yc", "minor", "major", "angle", "Q1", "Q2", "Function",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub x_c: Vec<f64>,
    pub y_c: Vec<f64>,
    pub minor: Vec<f64>,
    pub major: Vec<f64>,
    pub angle: Vec<f64>,
    pub current1: Vec<f64>,
    pub current2: Vec<f64>,
    pub cost: Vec<f64>,
}

impl RunSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ellipse(&mut self, ellipse: &DetectedEllipse) {
        self.x_c.push(ellipse.x_c());
        self.y_c.push(ellipse.y_c());
        self.minor.push(ellipse.minor());
        self.major.push(ellipse.major());
        self.angle.push(ellipse.angle());
    }

    pub fn record_evaluation(&mut self, currents: [f64; 2], cost: f64) {
        self.current1.push(currents[0]);
        self.current2.push(currents[1]);
        self.cost.push(cost);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn columns(&self) -> [&[f64]; 8] {
        [
            &self.x_c,
            &self.y_c,
            &self.minor,
            &self.major,
            &self.angle,
            &self.current1,
            &self.current2,
            &self.cost,
        ]
    }

    /// Length of the longest column
    pub fn rows(&self) -> usize {
        self.columns().iter().map(|c| c.len()).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    /// Write the table as CSV with a leading row counter.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(CSV_HEADER)?;

        let columns = self.columns();
        for row in 0..self.rows() {
            let mut record = Vec::with_capacity(CSV_HEADER.len());
            record.push(row.to_string());
            record.extend(
                columns
                    .iter()
                    .map(|column| column.get(row).copied().unwrap_or(f64::NAN).to_string()),
            );
            csv_writer.write_record(&record)?;
        }

        csv_writer.flush()?;
        Ok(())
    }

    /// Save as `<dir>/data_<date>_<ns>.csv`, creating `dir` if needed.
    pub fn save(&self, dir: &Path, date: NaiveDate, timestamp_ns: i64) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        let path = dir.join(format!("data_{}_{}.csv", date.format("%Y-%m-%d"), timestamp_ns));
        let file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        self.write_csv(file)?;
        Ok(path)
    }

    /// Save under `<data_dir>/<today>/` with the current time as the suffix.
    pub fn save_now(&self, data_dir: &Path) -> Result<PathBuf> {
        let now = Local::now();
        let today = now.date_naive();
        let dir = data_dir.join(today.format("%Y-%m-%d").to_string());
        let ns = now.timestamp_nanos_opt().unwrap_or_default();
        self.save(&dir, today, ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_short_columns_padded_with_nan() {
        let mut summary = RunSummary::new();
        summary.record_ellipse(&DetectedEllipse::new(1.0, 2.0, 3.0, 4.0, 5.0));
        summary.record_ellipse(&DetectedEllipse::new(6.0, 7.0, 8.0, 9.0, 10.0));
        summary.record_evaluation([0.5, 1.5], 42.0);
        assert_eq!(summary.rows(), 2);

        let mut out = Vec::new();
        summary.write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "Count,xc,yc,minor,major,angle,Q1,Q2,Function");
        assert_eq!(lines[1], "0,1,2,3,4,5,0.5,1.5,42");
        assert_eq!(lines[2], "1,6,7,8,9,10,NaN,NaN,NaN");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_save_names_file_by_date_and_timestamp() {
        let temp_dir = TempDir::new().unwrap();
        let mut summary = RunSummary::new();
        summary.record_evaluation([1.0, 2.0], 3.0);

        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let path = summary.save(temp_dir.path(), date, 123).unwrap();

        assert_eq!(path.file_name().unwrap(), "data_2024-01-02_123.csv");
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("0,NaN,NaN,NaN,NaN,NaN,1,2,3"));
    }

    #[test]
    fn test_clear() {
        let mut summary = RunSummary::new();
        summary.record_evaluation([1.0, 2.0], 3.0);
        summary.clear();
        assert!(summary.is_empty());
    }
}
