// Fixed-capacity time series store for a single entity
use super::telemetry::Sample;
use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;

/// Parallel timestamp/value columns, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BufferArrays {
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
}

/// Circular sample buffer. Once full, every push evicts the oldest sample.
///
/// Samples are kept in insertion order; callers push in non-decreasing
/// timestamp order.
#[derive(Debug, Clone)]
pub struct RollingBuffer {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl RollingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, timestamp: i64, value: f64) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample::new(timestamp, value));
    }

    pub fn arrays(&self) -> BufferArrays {
        let (timestamps, values) = self.samples.iter().map(|s| (s.timestamp, s.value)).unzip();
        BufferArrays { timestamps, values }
    }

    /// Samples no older than `window_ms` before the current wall clock.
    pub fn slice_since(&self, window_ms: i64) -> Vec<Sample> {
        self.slice_since_at(window_ms, Utc::now().timestamp_millis())
    }

    pub fn slice_since_at(&self, window_ms: i64, now_ms: i64) -> Vec<Sample> {
        let cutoff = now_ms.saturating_sub(window_ms);
        // Timestamps are non-decreasing, so everything from the first match on qualifies.
        let start = self.samples.partition_point(|s| s.timestamp < cutoff);
        self.samples.range(start..).copied().collect()
    }

    pub fn last(&self) -> Option<Sample> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest_past_capacity() {
        let mut buffer = RollingBuffer::new(5);
        for i in 0..=7 {
            buffer.push(1_000 + i * 10, i as f64);
        }

        let arrays = buffer.arrays();
        assert_eq!(arrays.values, vec![3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(arrays.timestamps, vec![1_030, 1_040, 1_050, 1_060, 1_070]);
        assert_eq!(buffer.len(), buffer.capacity());
    }

    #[test]
    fn test_length_never_exceeds_capacity() {
        let mut buffer = RollingBuffer::new(3);
        for i in 0..50 {
            buffer.push(i, i as f64);
            assert!(buffer.len() <= 3);
        }
    }

    #[test]
    fn test_arrays_are_detached_from_buffer() {
        let mut buffer = RollingBuffer::new(4);
        buffer.push(1, 1.0);
        buffer.push(2, 2.0);

        let mut arrays = buffer.arrays();
        arrays.values.clear();
        arrays.timestamps.push(99);

        assert_eq!(buffer.arrays().values, vec![1.0, 2.0]);
        assert_eq!(buffer.arrays().timestamps, vec![1, 2]);
    }

    #[test]
    fn test_slice_since() {
        let mut buffer = RollingBuffer::new(10);
        for t in [100, 200, 300, 400, 500] {
            buffer.push(t, t as f64 / 100.0);
        }

        let recent = buffer.slice_since_at(150, 500);
        assert_eq!(recent, vec![Sample::new(400, 4.0), Sample::new(500, 5.0)]);

        assert!(buffer.slice_since_at(50, 10_000).is_empty());
        assert_eq!(buffer.slice_since_at(1_000, 500).len(), 5);
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_last_and_empty() {
        let mut buffer = RollingBuffer::new(2);
        assert_eq!(buffer.last(), None);
        assert!(buffer.slice_since(60_000).is_empty());

        buffer.push(10, 1.5);
        buffer.push(20, 2.5);
        assert_eq!(buffer.last(), Some(Sample::new(20, 2.5)));

        buffer.clear();
        assert!(buffer.is_empty());
    }
}
