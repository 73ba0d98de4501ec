//! A fixed-capacity rolling window of spectra, newest first.
//!
//! Summing the window integrates noise down over time; how full the window is
//! says how much to trust the sum.

use std::collections::VecDeque;

/// Keeps the `capacity` most recent items.
#[derive(Debug, Clone)]
pub struct FixedBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> FixedBuffer<T> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Adds `item` as the newest entry, evicting the oldest when full.
    pub fn insert(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_back();
        }
        self.items.push_front(item);
    }

    /// Entries held.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing has been inserted.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Most entries ever held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `len / capacity`, between 0.0 and 1.0.
    pub fn percent_full(&self) -> f32 {
        self.items.len() as f32 / self.capacity as f32
    }

    /// Newest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl FixedBuffer<Vec<f32>> {
    /// Element-wise sum of every entry. Entries shorter than the newest one
    /// only contribute to the bins they have.
    pub fn sum(&self) -> Vec<f32> {
        let width = self.items.front().map_or(0, Vec::len);
        let mut total = vec![0.0; width];
        for entry in &self.items {
            for (acc, value) in total.iter_mut().zip(entry) {
                *acc += value;
            }
        }
        total
    }
}
