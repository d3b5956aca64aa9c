use std::collections::VecDeque;

use serde::Serialize;

use crate::detect::DetectError;

/// Floor for the standard deviation so Z-scores stay finite.
pub const MIN_STD_DEV: f64 = 1e-10;

/// A bounded FIFO of the most recent values for one key.
#[derive(Debug, Clone)]
pub struct StatisticsWindow {
    values: VecDeque<f64>,
    capacity: usize,
    total_seen: u64,
}

/// Point-in-time statistics of a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowSummary {
    pub count: usize,
    pub capacity: usize,
    pub mean: Option<f64>,
    pub std_dev: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub latest: Option<f64>,
    pub total_seen: u64,
}

impl StatisticsWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
            total_seen: 0,
        }
    }

    /// Append a value, evicting the oldest once past capacity.
    pub fn append(&mut self, value: f64) -> Result<(), DetectError> {
        if !value.is_finite() {
            return Err(DetectError::NonFiniteValue {
                key: String::new(),
                value,
            });
        }
        self.values.push_back(value);
        while self.values.len() > self.capacity {
            self.values.pop_front();
        }
        self.total_seen += 1;
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the bound. Shrinking drops the oldest values.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.values.len() > self.capacity {
            self.values.pop_front();
        }
    }

    pub fn total_seen(&self) -> u64 {
        self.total_seen
    }

    pub fn mean(&self) -> Result<f64, DetectError> {
        if self.values.is_empty() {
            return Err(DetectError::InsufficientData { needed: 1, have: 0 });
        }
        Ok(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    /// Sample standard deviation (N-1), floored at [`MIN_STD_DEV`].
    pub fn std_dev(&self) -> f64 {
        let n = self.values.len();
        if n < 2 {
            return MIN_STD_DEV;
        }
        let mean = self.values.iter().sum::<f64>() / n as f64;
        let sum_sq_diff: f64 = self.values.iter().map(|&x| (x - mean).powi(2)).sum();
        let std = (sum_sq_diff / (n - 1) as f64).sqrt();
        if std.is_nan() || std <= 0.0 {
            MIN_STD_DEV
        } else {
            std
        }
    }

    pub fn min(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::max)
    }

    pub fn latest(&self) -> Option<f64> {
        self.values.back().copied()
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.total_seen = 0;
    }

    pub fn summary(&self) -> WindowSummary {
        WindowSummary {
            count: self.values.len(),
            capacity: self.capacity,
            mean: self.mean().ok(),
            std_dev: self.std_dev(),
            min: self.min(),
            max: self.max(),
            latest: self.latest(),
            total_seen: self.total_seen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_sample_std_dev() {
        let mut w = StatisticsWindow::new(10);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            w.append(v).unwrap();
        }
        assert_eq!(w.mean().unwrap(), 3.0);
        // Sample variance of 1..5 is 2.5
        assert!((w.std_dev() - 2.5_f64.sqrt()).abs() < 1e-12);
        assert_eq!(w.min(), Some(1.0));
        assert_eq!(w.max(), Some(5.0));
    }

    #[test]
    fn test_fifo_eviction_keeps_last_values() {
        let mut w = StatisticsWindow::new(3);
        for v in 0..10 {
            w.append(v as f64).unwrap();
        }
        assert_eq!(w.size(), 3);
        assert_eq!(w.values().collect::<Vec<_>>(), vec![7.0, 8.0, 9.0]);
        assert_eq!(w.total_seen(), 10);
    }

    #[test]
    fn test_empty_mean_is_insufficient() {
        let w = StatisticsWindow::new(5);
        assert_eq!(
            w.mean(),
            Err(DetectError::InsufficientData { needed: 1, have: 0 })
        );
    }

    #[test]
    fn test_std_dev_never_zero() {
        let mut w = StatisticsWindow::new(5);
        assert_eq!(w.std_dev(), MIN_STD_DEV);
        w.append(4.0).unwrap();
        assert_eq!(w.std_dev(), MIN_STD_DEV);
        for _ in 0..4 {
            w.append(4.0).unwrap();
        }
        assert!(w.std_dev() > 0.0);
        assert!(!w.std_dev().is_nan());
    }

    #[test]
    fn test_rejects_non_finite() {
        let mut w = StatisticsWindow::new(5);
        assert!(w.append(f64::NAN).is_err());
        assert!(w.append(f64::INFINITY).is_err());
        assert!(w.append(f64::NEG_INFINITY).is_err());
        assert!(w.is_empty());
    }

    #[test]
    fn test_shrink_trims_oldest() {
        let mut w = StatisticsWindow::new(5);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            w.append(v).unwrap();
        }
        w.set_capacity(2);
        assert_eq!(w.values().collect::<Vec<_>>(), vec![4.0, 5.0]);
        w.set_capacity(10);
        assert_eq!(w.size(), 2);
    }
}
