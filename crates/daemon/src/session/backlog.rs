//! Bounded output history for late-joining viewers.

use std::collections::VecDeque;

use bytes::Bytes;

/// Ring buffer of sequence-numbered output chunks.
///
/// Sequence numbers start at 1 and increase by one per pushed chunk, so a
/// viewer that has seen everything up to `n` can skip any chunk `<= n`.
#[derive(Debug)]
pub struct Backlog {
    chunks: VecDeque<(u64, Bytes)>,
    capacity: usize,
    last_seq: u64,
}

impl Backlog {
    /// Creates an empty backlog holding at most `capacity` chunks.
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            last_seq: 0,
        }
    }

    /// Appends a chunk, evicting the oldest when full. Returns its sequence.
    pub fn push(&mut self, data: Bytes) -> u64 {
        self.last_seq += 1;
        if self.chunks.len() == self.capacity {
            self.chunks.pop_front();
        }
        self.chunks.push_back((self.last_seq, data));
        self.last_seq
    }

    /// Sequence number of the most recent chunk, 0 when nothing was pushed.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Retained chunk count.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// The most recent `n` chunks, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Bytes> {
        let skip = self.chunks.len().saturating_sub(n);
        self.chunks.iter().skip(skip).map(|(_, b)| b.clone()).collect()
    }

    /// Every retained chunk with its sequence number, oldest first.
    pub fn snapshot(&self) -> Vec<(u64, Bytes)> {
        self.chunks.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_sequence_starts_at_one() {
        let mut backlog = Backlog::new(4);
        assert_eq!(backlog.last_seq(), 0);
        assert!(backlog.is_empty());
        assert_eq!(backlog.push(chunk("a")), 1);
        assert_eq!(backlog.push(chunk("b")), 2);
        assert_eq!(backlog.last_seq(), 2);
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut backlog = Backlog::new(3);
        for s in ["a", "b", "c", "d", "e"] {
            backlog.push(chunk(s));
        }

        assert_eq!(backlog.len(), 3);
        let seqs: Vec<u64> = backlog.snapshot().iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(backlog.recent(10), vec![chunk("c"), chunk("d"), chunk("e")]);
    }

    #[test]
    fn test_recent_returns_tail_in_order() {
        let mut backlog = Backlog::new(10);
        for s in ["1", "2", "3", "4"] {
            backlog.push(chunk(s));
        }
        assert_eq!(backlog.recent(2), vec![chunk("3"), chunk("4")]);
        assert!(backlog.recent(0).is_empty());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut backlog = Backlog::new(0);
        backlog.push(chunk("x"));
        backlog.push(chunk("y"));
        assert_eq!(backlog.recent(5), vec![chunk("y")]);
    }
}
