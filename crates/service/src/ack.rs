use std::cmp::Reverse;
use std::collections::BinaryHeap;

use ahash::AHashMap;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    source: u64,
    adapter: u64,
    deadline: u64,
}

/// Outstanding `requiresAck` requests: message id → waiting source, with a
/// deadline min-heap so the supervisor pops expired entries in O(log n).
///
/// Every armed entry resolves exactly once: either a matching
/// `command_result` arrives from the addressed adapter, or the deadline
/// passes and the caller synthesizes an `ack_timeout` error.
#[derive(Default)]
pub struct AckTable {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    by_id: AHashMap<String, Pending>,
    deadlines: BinaryHeap<Reverse<(u64, String)>>,
}

impl AckTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, message_id: &str, source: u64, adapter: u64, deadline: u64) {
        let mut inner = self.inner.lock();
        inner.by_id.insert(
            message_id.to_string(),
            Pending {
                source,
                adapter,
                deadline,
            },
        );
        inner.deadlines.push(Reverse((deadline, message_id.to_string())));
    }

    /// Match a `command_result` from `adapter`. Returns the waiting source
    /// connection, or `None` when nothing is pending (the frame is dropped).
    pub fn resolve(&self, message_id: &str, adapter: u64) -> Option<u64> {
        let mut inner = self.inner.lock();
        match inner.by_id.get(message_id).copied() {
            Some(pending) if pending.adapter == adapter => {
                // The heap entry stays behind; `expired` skips resolved ids.
                inner.by_id.remove(message_id);
                Some(pending.source)
            }
            _ => None,
        }
    }

    /// Pop every entry whose deadline has passed.
    pub fn expired(&self, now: u64) -> Vec<(String, u64)> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();

        loop {
            match inner.deadlines.peek() {
                Some(Reverse((deadline, _))) if *deadline <= now => {}
                _ => break,
            }

            let Some(Reverse((deadline, message_id))) = inner.deadlines.pop() else {
                break;
            };

            // Stale heap entries: already resolved, or re-armed with a
            // different deadline.
            if let Some(pending) = inner.by_id.get(&message_id).copied() {
                if pending.deadline == deadline {
                    inner.by_id.remove(&message_id);
                    out.push((message_id, pending.source));
                }
            }
        }

        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_delivers_to_source_once() {
        let acks = AckTable::new();
        acks.arm("m-1", 7, 3, 1015);

        assert_eq!(acks.resolve("m-1", 3), Some(7));
        assert_eq!(acks.resolve("m-1", 3), None);
        assert!(acks.is_empty());
    }

    #[test]
    fn result_from_wrong_adapter_is_dropped() {
        let acks = AckTable::new();
        acks.arm("m-1", 7, 3, 1015);

        assert_eq!(acks.resolve("m-1", 4), None);
        assert_eq!(acks.len(), 1);
    }

    #[test]
    fn expiry_pops_in_deadline_order() {
        let acks = AckTable::new();
        acks.arm("m-1", 7, 3, 1010);
        acks.arm("m-2", 8, 3, 1005);
        acks.arm("m-3", 9, 3, 1020);

        assert_eq!(acks.expired(1004), vec![]);
        assert_eq!(
            acks.expired(1012),
            vec![("m-2".to_string(), 8), ("m-1".to_string(), 7)]
        );
        assert_eq!(acks.len(), 1);
    }

    #[test]
    fn resolved_entries_never_expire() {
        let acks = AckTable::new();
        acks.arm("m-1", 7, 3, 1010);
        assert_eq!(acks.resolve("m-1", 3), Some(7));

        // Exactly one outcome per armed message.
        assert_eq!(acks.expired(2000), vec![]);
    }

    #[test]
    fn rearmed_id_uses_fresh_deadline() {
        let acks = AckTable::new();
        acks.arm("m-1", 7, 3, 1010);
        acks.arm("m-1", 7, 3, 1030);

        assert_eq!(acks.expired(1015), vec![]);
        assert_eq!(acks.expired(1030), vec![("m-1".to_string(), 7)]);
    }
}
