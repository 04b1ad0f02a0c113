//! Sinks for the named scalars produced every training iteration.
//!
//! Loggers only receive copies of the metrics, so nothing they do can feed back into the
//! sampler or the training state.

use crate::error::Result;
use std::collections::BTreeMap;

/// Named scalars of one iteration.
pub type Metrics = BTreeMap<String, f64>;

pub trait Logger {
    /// Appends the metrics of `iteration`. Calls arrive in iteration order.
    fn write(&mut self, iteration: usize, metrics: &Metrics);

    /// Persists whatever is buffered.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Keeps the whole history in memory, one series per metric name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListLogger {
    pub history: BTreeMap<String, Vec<f64>>,
    /// Iteration at which each value of a series was written.
    pub iterations: BTreeMap<String, Vec<usize>>,
}

impl ListLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn series(&self, name: &str) -> Option<&[f64]> {
        self.history.get(name).map(Vec::as_slice)
    }

    pub fn last(&self, name: &str) -> Option<f64> {
        self.history.get(name).and_then(|v| v.last().copied())
    }
}

impl Logger for ListLogger {
    fn write(&mut self, iteration: usize, metrics: &Metrics) {
        for (name, value) in metrics {
            self.history.entry(name.clone()).or_default().push(*value);
            self.iterations
                .entry(name.clone())
                .or_default()
                .push(iteration);
        }
    }
}

impl<L: Logger + ?Sized> Logger for &mut L {
    fn write(&mut self, iteration: usize, metrics: &Metrics) {
        (**self).write(iteration, metrics)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_logger_appends_in_order() {
        let mut logger = ListLogger::new();
        let mut m = Metrics::new();
        m.insert("loss".into(), 1.0);
        logger.write(0, &m);
        m.insert("loss".into(), 0.5);
        m.insert("ess".into(), 0.2);
        logger.write(1, &m);
        assert_eq!(logger.series("loss"), Some(&[1.0, 0.5][..]));
        assert_eq!(logger.iterations["ess"], vec![1]);
        assert_eq!(logger.last("ess"), Some(0.2));
        assert_eq!(logger.last("missing"), None);
    }
}
