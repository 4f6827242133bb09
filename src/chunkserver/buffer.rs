//! Staged-write buffer for the data pipeline.
//!
//! A client push stores its bytes here under a client-supplied fingerprint;
//! the commit that follows consumes them. Entries that never see a commit
//! (the client died, the write was retried under a fresh fingerprint) are
//! dropped after a TTL.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

struct Staged {
    data: Vec<u8>,
    staged_at: Instant,
}

/// In-memory buffer keyed by push fingerprint.
pub struct DataBuffer {
    entries: Mutex<HashMap<String, Staged>>,
    ttl: Duration,
}

impl DataBuffer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Stage a payload, evicting anything past its TTL.
    pub fn put(&self, fingerprint: &str, data: Vec<u8>) {
        let mut entries = self.entries.lock();
        let ttl = self.ttl;
        entries.retain(|_, staged| staged.staged_at.elapsed() < ttl);
        entries.insert(
            fingerprint.to_string(),
            Staged { data, staged_at: Instant::now() },
        );
        debug!(fingerprint, buffered = entries.len(), "Staged push data");
    }

    /// Consume a staged payload.
    pub fn take(&self, fingerprint: &str) -> Option<Vec<u8>> {
        self.entries.lock().remove(fingerprint).map(|s| s.data)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DataBuffer {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_take() {
        let buffer = DataBuffer::default();
        buffer.put("fp-1", b"payload".to_vec());

        assert_eq!(buffer.take("fp-1"), Some(b"payload".to_vec()));
        // Consumed: a second take finds nothing.
        assert_eq!(buffer.take("fp-1"), None);
    }

    #[test]
    fn test_distinct_fingerprints() {
        let buffer = DataBuffer::default();
        buffer.put("a", vec![1]);
        buffer.put("b", vec![2]);

        assert_eq!(buffer.take("b"), Some(vec![2]));
        assert_eq!(buffer.take("a"), Some(vec![1]));
    }

    #[test]
    fn test_expired_entries_evicted() {
        let buffer = DataBuffer::new(Duration::from_millis(0));
        buffer.put("old", vec![1]);
        std::thread::sleep(Duration::from_millis(2));
        // The next put sweeps expired entries.
        buffer.put("new", vec![2]);

        assert_eq!(buffer.take("old"), None);
        assert_eq!(buffer.take("new"), Some(vec![2]));
    }
}
