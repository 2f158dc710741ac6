//! Throttle for intermediate card updates.

use crate::llm::Snapshot;

/// Approves a push once the answer grew by more than `threshold` characters since the
/// last approved push. The final snapshot is always approved.
#[derive(Debug, Clone)]
pub struct Coalescer {
    threshold: usize,
    last_pushed_len: usize,
}

impl Coalescer {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            last_pushed_len: 0,
        }
    }

    /// Length recorded at the last approved push.
    pub fn last_pushed_len(&self) -> usize {
        self.last_pushed_len
    }

    /// Offer an intermediate snapshot; true when it should be pushed.
    pub fn offer(&mut self, snapshot: &Snapshot) -> bool {
        if snapshot.len.saturating_sub(self.last_pushed_len) > self.threshold {
            self.last_pushed_len = snapshot.len;
            true
        } else {
            false
        }
    }

    /// The stream is exhausted: the last snapshot is pushed regardless of growth.
    pub fn finish(&mut self, snapshot: &Snapshot) -> bool {
        self.last_pushed_len = snapshot.len;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pushed_lengths(threshold: usize, text: &str) -> Vec<usize> {
        let mut c = Coalescer::new(threshold);
        let mut out = Vec::new();
        let chars: Vec<char> = text.chars().collect();
        for n in 1..=chars.len() {
            let s = Snapshot::new(chars[..n].iter().collect::<String>());
            if c.offer(&s) {
                out.push(s.len);
            }
        }
        out
    }

    #[test]
    fn pushes_only_past_threshold() {
        assert_eq!(pushed_lengths(2, "hello"), vec![3]);
        assert_eq!(pushed_lengths(2, "hello world"), vec![3, 6, 9]);
    }

    #[test]
    fn zero_threshold_pushes_every_growth() {
        assert_eq!(pushed_lengths(0, "abc"), vec![1, 2, 3]);
    }

    #[test]
    fn large_threshold_pushes_nothing_until_finish() {
        let mut c = Coalescer::new(100);
        let s = Snapshot::new("short answer");
        assert!(!c.offer(&s));
        assert!(c.finish(&s));
        assert_eq!(c.last_pushed_len(), 12);
    }

    #[test]
    fn shrinking_snapshot_is_not_pushed() {
        let mut c = Coalescer::new(1);
        assert!(c.offer(&Snapshot::new("abcd")));
        assert!(!c.offer(&Snapshot::new("ab")));
    }
}
