//! MVCC version manager: per-pointer version chains, snapshot reads, and
//! commit/abort/garbage-collection (spec §4.9).

use dashmap::DashMap;

use crate::pointer::Pointer;

#[derive(Debug, Clone)]
pub struct Version {
    pub data: Vec<u8>,
    pub begin_ts: i64,
    pub end_ts: i64,
    pub txn_id: i64,
    pub prev_version: Option<Box<Version>>,
    pub committed: bool,
}

pub const END_TS_INFINITY: i64 = i64::MAX;

impl Version {
    fn visible_at(&self, read_ts: i64) -> bool {
        self.committed && self.begin_ts <= read_ts && read_ts < self.end_ts
    }
}

/// One chain per logical pointer, newest version first.
pub struct MvccManager {
    chains: DashMap<Pointer, Vec<Version>>,
}

impl MvccManager {
    pub fn new() -> Self {
        Self {
            chains: DashMap::new(),
        }
    }

    /// The newest committed version visible to `read_ts`, if any.
    pub fn read(&self, pointer: &Pointer, read_ts: i64) -> Option<Vec<u8>> {
        let chain = self.chains.get(pointer)?;
        chain
            .iter()
            .rev()
            .find(|v| v.visible_at(read_ts))
            .map(|v| v.data.clone())
    }

    /// Appends an uncommitted version written by `txn_id`, linking back
    /// to whatever currently sits at the head of the chain.
    pub fn write(&self, pointer: Pointer, data: Vec<u8>, txn_id: i64) {
        let mut chain = self.chains.entry(pointer).or_default();
        let prev_version = chain.last().cloned().map(Box::new);
        chain.push(Version {
            data,
            begin_ts: END_TS_INFINITY,
            end_ts: END_TS_INFINITY,
            txn_id,
            prev_version,
            committed: false,
        });
    }

    /// Flips `committed` and rewrites `begin_ts` on every version written
    /// by `txn_id`, closing out the version it superseded.
    pub fn commit(&self, txn_id: i64, commit_ts: i64) {
        for mut chain in self.chains.iter_mut() {
            for version in chain.iter_mut() {
                if version.txn_id == txn_id && !version.committed {
                    version.committed = true;
                    version.begin_ts = commit_ts;
                }
            }
            // Any committed version whose successor is now visible from
            // `commit_ts` has its end_ts closed at that point.
            let mut begin_points: Vec<i64> = chain
                .iter()
                .filter(|v| v.committed)
                .map(|v| v.begin_ts)
                .collect();
            begin_points.sort_unstable();
            for version in chain.iter_mut() {
                if !version.committed {
                    continue;
                }
                if let Some(&next) = begin_points.iter().find(|&&b| b > version.begin_ts) {
                    version.end_ts = next;
                } else {
                    version.end_ts = END_TS_INFINITY;
                }
            }
        }
    }

    /// Removes every uncommitted version written by `txn_id`.
    pub fn abort(&self, txn_id: i64) {
        for mut chain in self.chains.iter_mut() {
            chain.retain(|v| !(v.txn_id == txn_id && !v.committed));
        }
    }

    /// Drops committed versions whose `end_ts` is below the oldest
    /// still-active read timestamp.
    pub fn garbage_collect(&self, min_active_ts: i64) {
        for mut chain in self.chains.iter_mut() {
            chain.retain(|v| !v.committed || v.end_ts >= min_active_ts);
        }
        self.chains.retain(|_, chain| !chain.is_empty());
    }
}

impl Default for MvccManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_sees_only_committed_versions_in_range() {
        let mgr = MvccManager::new();
        let ptr = Pointer::data(1, 0);
        mgr.write(ptr, b"v1".to_vec(), 10);
        assert!(mgr.read(&ptr, 5).is_none());
        mgr.commit(10, 5);
        assert_eq!(mgr.read(&ptr, 5), Some(b"v1".to_vec()));
        assert_eq!(mgr.read(&ptr, 100), Some(b"v1".to_vec()));
    }

    #[test]
    fn newer_commit_closes_out_older_version() {
        let mgr = MvccManager::new();
        let ptr = Pointer::data(1, 0);
        mgr.write(ptr, b"v1".to_vec(), 1);
        mgr.commit(1, 1);
        mgr.write(ptr, b"v2".to_vec(), 2);
        mgr.commit(2, 5);
        assert_eq!(mgr.read(&ptr, 3), Some(b"v1".to_vec()));
        assert_eq!(mgr.read(&ptr, 5), Some(b"v2".to_vec()));
    }

    #[test]
    fn abort_removes_uncommitted_version() {
        let mgr = MvccManager::new();
        let ptr = Pointer::data(1, 0);
        mgr.write(ptr, b"v1".to_vec(), 9);
        mgr.abort(9);
        mgr.commit(9, 1);
        assert!(mgr.read(&ptr, 100).is_none());
    }

    #[test]
    fn garbage_collect_drops_superseded_versions() {
        let mgr = MvccManager::new();
        let ptr = Pointer::data(1, 0);
        mgr.write(ptr, b"v1".to_vec(), 1);
        mgr.commit(1, 1);
        mgr.write(ptr, b"v2".to_vec(), 2);
        mgr.commit(2, 10);
        mgr.garbage_collect(10);
        assert!(mgr.read(&ptr, 3).is_none());
        assert_eq!(mgr.read(&ptr, 10), Some(b"v2".to_vec()));
    }
}
