use std::collections::VecDeque;

/// Bounded FIFO: pushing onto a full window evicts the oldest value.
#[derive(Debug, Clone)]
pub struct Window<T> {
    values: VecDeque<T>,
    capacity: usize,
}

impl<T> Window<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "window capacity must be positive");
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `value`, returning the evicted oldest value once full.
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.is_full() {
            self.values.pop_front()
        } else {
            None
        };
        self.values.push_back(value);
        evicted
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<&T> {
        self.values.back()
    }

    /// The value `n` positions from the end: `back(1)` is the newest.
    pub fn back(&self, n: usize) -> Option<&T> {
        if n == 0 || n > self.values.len() {
            return None;
        }
        self.values.get(self.values.len() - n)
    }

    /// The newest `n` values (fewer if the window holds fewer), oldest first.
    pub fn newest(&self, n: usize) -> impl Iterator<Item = &T> {
        self.values.iter().skip(self.values.len().saturating_sub(n))
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.values.iter()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::Window;

    #[test]
    fn filling_evicts_nothing() {
        let mut w = Window::new(3);
        assert_eq!(w.push(1), None);
        assert_eq!(w.push(2), None);
        assert_eq!(w.push(3), None);
        assert!(w.is_full());
    }

    #[test]
    fn full_window_evicts_oldest() {
        let mut w = Window::new(3);
        for v in 1..=3 {
            w.push(v);
        }
        assert_eq!(w.push(4), Some(1));
        assert_eq!(w.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(w.len(), 3);
    }

    #[test]
    fn back_counts_from_newest() {
        let mut w = Window::new(4);
        for v in [10, 20, 30] {
            w.push(v);
        }
        assert_eq!(w.back(1), Some(&30));
        assert_eq!(w.back(3), Some(&10));
        assert_eq!(w.back(4), None);
        assert_eq!(w.back(0), None);
        assert_eq!(w.newest(2).copied().collect::<Vec<_>>(), vec![20, 30]);
        assert_eq!(w.newest(9).count(), 3);
    }
}
