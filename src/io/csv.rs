/*!
# CSV output for training histories and weighted samples

Enable via the `csv` feature.
*/

use crate::error::Result;
use crate::logger::{Logger, Metrics};
use csv::{Reader, Writer};
use ndarray::{ArrayView1, ArrayView2};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/**
Saves weighted samples as a CSV file.

The file has a header row with `"sample"`, `"log_w"` and one column per dimension named
`"dim_0"`, `"dim_1"`, etc., followed by one row per sample.

# Examples

```rust
use fab_mcmc::io::csv::save_weighted_samples;
use ndarray::array;

let x = array![[0.0, 1.0], [2.0, 3.0]];
let log_w = array![-0.5, f64::NEG_INFINITY];
let path = std::env::temp_dir().join("fab_mcmc_doc_samples.csv");
save_weighted_samples(x.view(), log_w.view(), &path).unwrap();
```
*/
pub fn save_weighted_samples(
    x: ArrayView2<f64>,
    log_w: ArrayView1<f64>,
    path: impl AsRef<Path>,
) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(path)?);
    let mut header = vec!["sample".to_string(), "log_w".to_string()];
    header.extend((0..x.ncols()).map(|i| format!("dim_{}", i)));
    wtr.write_record(&header)?;

    for (i, (row, w)) in x.rows().into_iter().zip(log_w.iter()).enumerate() {
        let mut record = vec![i.to_string(), w.to_string()];
        record.extend(row.iter().map(|v| v.to_string()));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Logger that writes the training history as a CSV file.
///
/// Metrics may appear at some iterations only (evaluation metrics, for example). Rows are
/// buffered and appended on [`Logger::flush`], or as soon as `max_buffered` rows are waiting.
/// When a metric name shows up that the file has no column for yet, the file is rewritten
/// once with the wider header, leaving empty cells where a metric was not logged.
#[derive(Debug)]
pub struct CsvLogger {
    path: PathBuf,
    /// Metric columns currently in the file header, sorted.
    columns: Vec<String>,
    pending: Vec<(usize, Metrics)>,
    max_buffered: usize,
}

impl CsvLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            columns: Vec::new(),
            pending: Vec::new(),
            max_buffered: 1000,
        }
    }

    /// Flushes automatically once `max_buffered` rows are waiting.
    pub fn with_max_buffered(mut self, max_buffered: usize) -> Self {
        self.max_buffered = max_buffered.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record(columns: &[String], iteration: usize, metrics: &Metrics) -> Vec<String> {
        let mut record = Vec::with_capacity(columns.len() + 1);
        record.push(iteration.to_string());
        record.extend(
            columns
                .iter()
                .map(|c| metrics.get(c).map(|v| v.to_string()).unwrap_or_default()),
        );
        record
    }

    /// Rewrites the file with `columns`, carrying over the rows already on disk.
    fn rewrite(&self, columns: &[String]) -> Result<()> {
        let tmp = self.path.with_extension("csv.tmp");
        let mut wtr = Writer::from_path(&tmp)?;
        let mut header = vec!["iteration".to_string()];
        header.extend(columns.iter().cloned());
        wtr.write_record(&header)?;
        if !self.columns.is_empty() && self.path.exists() {
            let mut rdr = Reader::from_path(&self.path)?;
            let old: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();
            for row in rdr.records() {
                let row = row?;
                let mut record = vec![row.get(0).unwrap_or_default().to_string()];
                record.extend(columns.iter().map(|c| {
                    old.iter()
                        .position(|o| o == c)
                        .and_then(|i| row.get(i))
                        .unwrap_or_default()
                        .to_string()
                }));
                wtr.write_record(&record)?;
            }
        }
        wtr.flush()?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Logger for CsvLogger {
    fn write(&mut self, iteration: usize, metrics: &Metrics) {
        self.pending.push((iteration, metrics.clone()));
        if self.pending.len() >= self.max_buffered {
            if let Err(e) = self.flush() {
                log::warn!("could not write {}: {e}", self.path.display());
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        let mut columns: BTreeSet<String> = self.columns.iter().cloned().collect();
        columns.extend(self.pending.iter().flat_map(|(_, m)| m.keys().cloned()));
        let columns: Vec<String> = columns.into_iter().collect();
        if columns != self.columns || !self.path.exists() {
            self.rewrite(&columns)?;
            self.columns = columns;
        }
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut wtr = Writer::from_writer(file);
        for (iteration, metrics) in &self.pending {
            wtr.write_record(Self::record(&self.columns, *iteration, metrics))?;
        }
        wtr.flush()?;
        self.pending.clear();
        Ok(())
    }
}
