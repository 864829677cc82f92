//! Global/local id handling (spec §3, §4.6, §8 "Global ID collapse").
//!
//! A [`GlobalId`] is `(process_id << 32) | local_counter`: unique across every process
//! contributing to one snapshot. Collector stamps every emitted object with one.
//! SnapshotAssembler collapses the (possibly sparse, 64-bit) global ids seen in one
//! snapshot into a dense `1..k` range of 32-bit local ids, since the engine's row
//! format has no room for a 64-bit identifier.

use std::collections::HashMap;

use utils::id::{LocalId, ProcessId};

/// `(process_id << 32) | local_counter`, per spec §4.5.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(pub i64);

impl GlobalId {
    pub fn new(process_id: ProcessId, local_counter: u32) -> Self {
        GlobalId(((process_id.0 as i64) << 32) | local_counter as i64)
    }

    pub fn process_id(&self) -> ProcessId {
        ProcessId((self.0 >> 32) as u32)
    }
}

/// A process-wide generator of the `local_counter` half of [`GlobalId`]s, so that one
/// process's distinct objects (attachments, transactions, statements, calls, stats,
/// ...) never collide even though they share a `process_id`.
#[derive(Default)]
pub struct StatIdGenerator {
    next: std::sync::atomic::AtomicU32,
}

impl StatIdGenerator {
    pub fn next_global_id(&self, process_id: ProcessId) -> GlobalId {
        let counter = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        GlobalId::new(process_id, counter)
    }
}

/// Collapses the 64-bit [`GlobalId`]s seen while decoding one snapshot into a dense
/// `1..k` range of 32-bit local ids. Equal global ids always map to equal local ids;
/// the mapping only grows monotonically as new global ids are seen (spec §8).
#[derive(Default)]
pub struct LocalIdMap {
    assigned: HashMap<GlobalId, LocalId>,
    next: u32,
}

impl LocalIdMap {
    pub fn new() -> Self {
        LocalIdMap {
            assigned: HashMap::new(),
            next: 1,
        }
    }

    pub fn local_id_for(&mut self, global: GlobalId) -> LocalId {
        if let Some(existing) = self.assigned.get(&global) {
            return *existing;
        }
        let id = LocalId(self.next);
        self.next += 1;
        self.assigned.insert(global, id);
        id
    }

    pub fn len(&self) -> usize {
        self.assigned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_id_roundtrips_process_id() {
        let pid = ProcessId(0xBB8);
        let gid = GlobalId::new(pid, 1);
        assert_eq!(gid.0, 0x00000BB800000001);
        assert_eq!(gid.process_id(), pid);
    }

    #[test]
    fn collapse_is_dense_and_stable() {
        let mut map = LocalIdMap::new();
        let a = GlobalId(0x00000BB800000001);
        let b = GlobalId(0x00000BB800000001);
        let c = GlobalId(0x00000FA000000001);

        let la = map.local_id_for(a);
        let lb = map.local_id_for(b);
        let lc = map.local_id_for(c);

        assert_eq!(la, lb);
        assert_eq!(la.0, 1);
        assert_eq!(lc.0, 2);
        assert_eq!(map.len(), 2);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

        /// Spec §8: for any sequence of (possibly duplicated) global ids, the decoded
        /// local ids form a dense `1..k` range where `k` is the number of distinct
        /// inputs, and equal global ids always map to equal local ids.
        #[test]
        fn collapse_is_dense_and_respects_equality(ids in proptest::collection::vec(any::<i64>(), 0..64)) {
            let mut map = LocalIdMap::new();
            let mut first_seen: std::collections::HashMap<i64, u32> = std::collections::HashMap::new();

            for &raw in &ids {
                let local = map.local_id_for(GlobalId(raw));
                match first_seen.get(&raw) {
                    Some(&expected) => prop_assert_eq!(local.0, expected),
                    None => { first_seen.insert(raw, local.0); }
                }
            }

            let distinct: HashSet<i64> = ids.iter().copied().collect();
            prop_assert_eq!(map.len(), distinct.len());

            let mut assigned: Vec<u32> = first_seen.values().copied().collect();
            assigned.sort_unstable();
            let expected_range: Vec<u32> = (1..=assigned.len() as u32).collect();
            prop_assert_eq!(assigned, expected_range);
        }
    }
}
