//! Bounded ring buffer of face embeddings with a synchronously maintained
//! centroid.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// A single face embedding and the moment it was captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub embedding: Array1<f32>,
    pub captured_at: DateTime<Utc>,
}

impl Sample {
    pub fn new(embedding: Array1<f32>, captured_at: DateTime<Utc>) -> Self {
        Self {
            embedding,
            captured_at,
        }
    }
}

/// Embedding buffer holding at most `capacity` samples.
///
/// Adding a sample at capacity evicts the oldest one. The centroid is
/// recomputed on every mutation so it never lags the buffer contents.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    samples: VecDeque<Sample>,
    capacity: usize,
    centroid: Array1<f32>,
}

impl SampleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            centroid: Array1::zeros(0),
        }
    }

    /// Build a buffer from samples in capture order, keeping the newest
    /// `capacity` of them.
    pub fn from_samples(capacity: usize, samples: impl IntoIterator<Item = Sample>) -> Self {
        let mut buffer = Self::new(capacity);
        buffer.samples.extend(samples);
        buffer.evict_overflow();
        buffer.recompute_centroid();
        buffer
    }

    /// Append a sample, returning the evicted one if the buffer was full.
    pub fn push(&mut self, sample: Sample) -> Option<Sample> {
        self.samples.push_back(sample);
        let evicted = if self.samples.len() > self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.recompute_centroid();
        evicted
    }

    /// Combine another buffer's samples with this one in capture order, then
    /// evict the oldest entries until the buffer is back within capacity.
    pub fn merge(&mut self, other: impl IntoIterator<Item = Sample>) {
        let mut combined: Vec<Sample> = self.samples.drain(..).chain(other).collect();
        combined.sort_by_key(|sample| sample.captured_at);
        self.samples.extend(combined);
        self.evict_overflow();
        self.recompute_centroid();
    }

    pub fn centroid(&self) -> &Array1<f32> {
        &self.centroid
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

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples.into()
    }

    fn evict_overflow(&mut self) {
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    fn recompute_centroid(&mut self) {
        let Some(first) = self.samples.front() else {
            self.centroid = Array1::zeros(0);
            return;
        };

        let mut sum = Array1::<f32>::zeros(first.embedding.len());
        for sample in &self.samples {
            sum += &sample.embedding;
        }
        sum /= self.samples.len() as f32;
        self.centroid = sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ndarray::array;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_centroid_tracks_contents() {
        let mut buffer = SampleBuffer::new(3);
        buffer.push(Sample::new(array![1.0, 0.0], at(0)));
        buffer.push(Sample::new(array![0.0, 1.0], at(1)));
        assert_eq!(buffer.centroid(), &array![0.5, 0.5]);
    }

    #[test]
    fn test_push_evicts_oldest_at_capacity() {
        let mut buffer = SampleBuffer::new(2);
        buffer.push(Sample::new(array![1.0], at(0)));
        buffer.push(Sample::new(array![2.0], at(1)));
        let evicted = buffer.push(Sample::new(array![3.0], at(2)));

        assert_eq!(evicted.map(|s| s.embedding), Some(array![1.0]));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.centroid(), &array![2.5]);
    }

    #[test]
    fn test_merge_interleaves_by_capture_time_and_evicts_oldest() {
        let mut buffer = SampleBuffer::from_samples(
            3,
            [
                Sample::new(array![1.0], at(0)),
                Sample::new(array![3.0], at(2)),
            ],
        );
        buffer.merge([
            Sample::new(array![2.0], at(1)),
            Sample::new(array![4.0], at(3)),
        ]);

        let kept: Vec<f32> = buffer.iter().map(|s| s.embedding[0]).collect();
        assert_eq!(kept, vec![2.0, 3.0, 4.0]);
        assert_eq!(buffer.centroid(), &array![3.0]);
    }

    #[test]
    fn test_empty_buffer_has_empty_centroid() {
        let buffer = SampleBuffer::new(4);
        assert!(buffer.is_empty());
        assert_eq!(buffer.centroid().len(), 0);
    }
}
