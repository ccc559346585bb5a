//! Per-source FIFO queues plus a ready-flag cache that gate multi-source
//! iterations.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use indexmap::IndexMap;
use uuid::Uuid;

struct SourceQueue {
    display_name: String,
    queue: Mutex<VecDeque<Vec<u8>>>,
}

/// The queue set is fixed at construction; no GUID is added or removed during
/// the run.
pub struct FanInBuffer {
    sources: IndexMap<Uuid, SourceQueue>,
    /// Driver-thread-local readiness cache.
    ready_flag: Mutex<HashMap<Uuid, bool>>,
}

impl FanInBuffer {
    /// Builds the fixed source list, disambiguating duplicate display names:
    /// the i-th occurrence (i>1) of a repeated name `n` is displayed as
    /// `n (i-1)`.
    pub fn new(peers: Vec<(Uuid, String)>) -> FanInBuffer {
        let mut seen_counts: HashMap<String, usize> = HashMap::new();
        let mut sources = IndexMap::new();
        let mut ready_flag = HashMap::new();

        for (guid, name) in peers {
            let count = seen_counts.entry(name.clone()).or_insert(0);
            *count += 1;
            let display_name = if *count == 1 {
                name
            } else {
                format!("{} ({})", name, *count - 1)
            };
            sources.insert(
                guid,
                SourceQueue {
                    display_name,
                    queue: Mutex::new(VecDeque::new()),
                },
            );
            ready_flag.insert(guid, false);
        }

        FanInBuffer {
            sources,
            ready_flag: Mutex::new(ready_flag),
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn contains(&self, guid: &Uuid) -> bool {
        self.sources.contains_key(guid)
    }

    /// Enqueues a payload for `guid`, called from the background receiver.
    /// No-op (with a return of `false`) if `guid` isn't one of the fixed sources.
    pub fn push(&self, guid: Uuid, payload: Vec<u8>) -> bool {
        let Some(source) = self.sources.get(&guid) else {
            return false;
        };
        source.queue.lock().unwrap().push_back(payload);
        self.ready_flag.lock().unwrap().insert(guid, true);
        true
    }

    /// True iff every source currently has at least one ready message
    /// (fast-path cache: reads can occasionally observe false for a queue
    /// that just became non-empty, which is fine since callers poll).
    pub fn all_ready(&self) -> bool {
        let flags = self.ready_flag.lock().unwrap();
        flags.values().all(|&ready| ready)
    }

    /// Dequeues exactly one message from each source, keyed by disambiguated
    /// display name, in the fixed construction order.
    /// Panics if called while `all_ready()` would return false — callers must
    /// check first.
    pub fn drain_one_each(&self) -> IndexMap<String, Vec<u8>> {
        let mut out = IndexMap::with_capacity(self.sources.len());
        let mut flags = self.ready_flag.lock().unwrap();
        for (guid, source) in &self.sources {
            let mut q = source.queue.lock().unwrap();
            let item = q
                .pop_front()
                .expect("drain_one_each called without all sources ready");
            flags.insert(*guid, !q.is_empty());
            out.insert(source.display_name.clone(), item);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[test]
    fn disambiguates_duplicate_names_preserving_order() {
        let buf = FanInBuffer::new(vec![
            (guid(1), "x".to_string()),
            (guid(2), "y".to_string()),
            (guid(3), "x".to_string()),
            (guid(4), "x".to_string()),
        ]);
        buf.push(guid(1), b"a".to_vec());
        buf.push(guid(2), b"b".to_vec());
        buf.push(guid(3), b"c".to_vec());
        buf.push(guid(4), b"d".to_vec());

        let out = buf.drain_one_each();
        let keys: Vec<&String> = out.keys().collect();
        assert_eq!(keys, vec!["x", "y", "x (1)", "x (2)"]);
    }

    #[test]
    fn all_ready_requires_every_source() {
        let buf = FanInBuffer::new(vec![(guid(1), "x".into()), (guid(2), "y".into())]);
        assert!(!buf.all_ready());
        buf.push(guid(1), b"a".to_vec());
        assert!(!buf.all_ready());
        buf.push(guid(2), b"b".to_vec());
        assert!(buf.all_ready());
    }

    #[test]
    fn ready_flag_resets_when_queue_drains_empty() {
        let buf = FanInBuffer::new(vec![(guid(1), "x".into())]);
        buf.push(guid(1), b"a".to_vec());
        assert!(buf.all_ready());
        let _ = buf.drain_one_each();
        assert!(!buf.all_ready());
    }

    #[test]
    fn push_to_unknown_guid_is_a_no_op() {
        let buf = FanInBuffer::new(vec![(guid(1), "x".into())]);
        assert!(!buf.push(guid(99), b"nope".to_vec()));
        assert!(!buf.contains(&guid(99)));
    }

    #[test]
    fn zero_sources_is_immediately_ready() {
        let buf = FanInBuffer::new(vec![]);
        assert!(buf.all_ready());
        assert!(buf.drain_one_each().is_empty());
    }
}
