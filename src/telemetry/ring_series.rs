use std::collections::{VecDeque, vec_deque};

/// Fixed capacity history of one metric, once full every append evicts
/// the oldest sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingBufferSeries {
    samples: VecDeque<i32>,
    capacity: usize,

    total_appended: u64,
}

impl RingBufferSeries {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,

            total_appended: 0,
        }
    }

    pub fn append(&mut self, value: i32) {
        if self.capacity == 0 {
            self.total_appended += 1;
            return;
        }

        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }

        self.samples.push_back(value);
        self.total_appended += 1;
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

    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }

    // Index of the oldest kept sample in the full history
    pub fn display_offset(&self) -> u64 {
        self.total_appended.saturating_sub(self.capacity as u64)
    }

    pub fn latest(&self) -> Option<i32> {
        self.samples.back().copied()
    }

    // Samples from the oldest to the newest
    pub fn iter(&self) -> vec_deque::Iter<'_, i32> {
        self.samples.iter()
    }

    pub fn to_vec(&self) -> Vec<i32> {
        self.samples.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_the_last_values_in_order() {
        let mut series = RingBufferSeries::new(300);

        for value in 0..450 {
            series.append(value);
        }

        assert_eq!(series.len(), 300);
        assert_eq!(series.to_vec(), (150..450).collect::<Vec<_>>());
        assert_eq!(series.total_appended(), 450);
        assert_eq!(series.display_offset(), 150);
        assert_eq!(series.latest(), Some(449));
    }

    #[test]
    fn offset_is_zero_until_full() {
        let mut series = RingBufferSeries::new(300);
        assert!(series.is_empty());
        assert_eq!(series.display_offset(), 0);

        for value in 0..300 {
            series.append(value);
        }

        assert_eq!(series.len(), series.capacity());
        assert_eq!(series.display_offset(), 0);

        series.append(300);
        assert_eq!(series.display_offset(), 1);
        assert_eq!(series.iter().next(), Some(&1));
    }

    #[test]
    fn zero_capacity_only_counts() {
        let mut series = RingBufferSeries::new(0);

        series.append(1);
        series.append(2);

        assert!(series.is_empty());
        assert_eq!(series.total_appended(), 2);
        assert_eq!(series.display_offset(), 2);
    }
}
