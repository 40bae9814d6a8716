//! Lock manager: per-resource shared/exclusive state, wait-for graph
//! deadlock detection, and range locks (spec §4.8).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use log::{debug, warn};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Default)]
struct ResourceEntry {
    shared_holders: HashSet<i64>,
    exclusive_holder: Option<i64>,
}

/// A range lock additionally blocks inserts whose key would fall strictly
/// between `low` and `high`.
#[derive(Debug, Clone)]
pub struct RangeMarker {
    pub low: String,
    pub high: String,
}

pub struct LockManager {
    resources: DashMap<String, Arc<AsyncMutex<ResourceEntry>>>,
    /// `txn -> resources it holds`, for `release_all`.
    held_by_txn: DashMap<i64, HashSet<String>>,
    /// `waiter -> holders it is blocked behind`, for cycle detection.
    wait_for: AsyncMutex<HashMap<i64, HashSet<i64>>>,
    /// Transactions a cycle detection picked as victim; each one's own
    /// `acquire` loop notices itself here and aborts on its next tick,
    /// regardless of whose registration closed the cycle.
    aborted: DashSet<i64>,
    range_markers: DashMap<String, RangeMarker>,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            held_by_txn: DashMap::new(),
            wait_for: AsyncMutex::new(HashMap::new()),
            aborted: DashSet::new(),
            range_markers: DashMap::new(),
            poll_interval: Duration::from_millis(2),
        }
    }

    fn entry(&self, resource: &str) -> Arc<AsyncMutex<ResourceEntry>> {
        self.resources
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(ResourceEntry::default())))
            .clone()
    }

    /// Inserts `waiter`'s wait-edge and, if it closes a cycle, marks the
    /// youngest transaction on that cycle as the victim and force-releases
    /// everything it holds. The victim's own `acquire` call notices the
    /// mark and aborts itself — not necessarily `waiter`, since whichever
    /// side happens to register last is the one that runs this method.
    async fn register_wait(&self, waiter: i64, blockers: HashSet<i64>) {
        if blockers.is_empty() {
            return;
        }
        let victim = {
            let mut graph = self.wait_for.lock().await;
            graph.insert(waiter, blockers);
            let victim = detect_cycle(&graph, waiter);
            if let Some(victim) = victim {
                graph.remove(&victim);
            }
            victim
        };
        if let Some(victim) = victim {
            warn!("deadlock detected: aborting txn {victim} as youngest on the wait-for cycle");
            self.aborted.insert(victim);
            self.release_all(victim).await;
        }
    }

    async fn clear_wait(&self, waiter: i64) {
        self.wait_for.lock().await.remove(&waiter);
    }

    /// Blocks (subject to `timeout`) until `txn` holds `mode` on
    /// `resource`. Registers a wait-edge before blocking; a detected cycle
    /// aborts the youngest transaction on it, which may be `txn` itself.
    pub async fn acquire(
        &self,
        resource: &str,
        txn: i64,
        mode: LockMode,
        timeout: Duration,
    ) -> StorageResult<bool> {
        let entry = self.entry(resource);
        let deadline = Instant::now() + timeout;

        loop {
            if self.aborted.remove(&txn).is_some() {
                self.clear_wait(txn).await;
                warn!("txn {txn} aborted as deadlock victim");
                return Err(StorageError::DeadlockVictim { txn_id: txn });
            }
            {
                let mut guard = entry.lock().await;
                match mode {
                    LockMode::Shared => {
                        if guard.exclusive_holder.is_none() || guard.exclusive_holder == Some(txn) {
                            guard.shared_holders.insert(txn);
                            drop(guard);
                            self.record_held(txn, resource).await;
                            self.clear_wait(txn).await;
                            return Ok(true);
                        }
                    }
                    LockMode::Exclusive => {
                        let exclusive_free = guard.exclusive_holder.is_none()
                            || guard.exclusive_holder == Some(txn);
                        let shared_clear = guard.shared_holders.is_empty()
                            || (guard.shared_holders.len() == 1
                                && guard.shared_holders.contains(&txn));
                        if exclusive_free {
                            guard.exclusive_holder = Some(txn);
                        }
                        if guard.exclusive_holder == Some(txn) && shared_clear {
                            drop(guard);
                            self.record_held(txn, resource).await;
                            self.clear_wait(txn).await;
                            return Ok(true);
                        }
                    }
                }
                let blockers: HashSet<i64> = match mode {
                    LockMode::Shared => guard.exclusive_holder.into_iter().collect(),
                    LockMode::Exclusive => guard
                        .shared_holders
                        .iter()
                        .copied()
                        .chain(guard.exclusive_holder)
                        .filter(|id| *id != txn)
                        .collect(),
                };
                drop(guard);
                self.register_wait(txn, blockers).await;
            }

            if Instant::now() >= deadline {
                self.clear_wait(txn).await;
                warn!("lock timeout: txn {txn} on {resource:?} ({mode:?})");
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn record_held(&self, txn: i64, resource: &str) {
        self.held_by_txn
            .entry(txn)
            .or_default()
            .insert(resource.to_string());
    }

    /// Drops every lock `txn` holds.
    pub async fn release_all(&self, txn: i64) {
        if let Some((_, resources)) = self.held_by_txn.remove(&txn) {
            for resource in resources {
                if let Some(entry) = self.resources.get(&resource) {
                    let mut guard = entry.lock().await;
                    guard.shared_holders.remove(&txn);
                    if guard.exclusive_holder == Some(txn) {
                        guard.exclusive_holder = None;
                    }
                }
            }
        }
        self.clear_wait(txn).await;
        debug!("released all locks for txn {txn}");
    }

    /// Takes individual locks on `low` and `high`, then installs a range
    /// marker blocking new inserts strictly between them until released.
    pub async fn acquire_range(
        &self,
        low: &str,
        high: &str,
        txn: i64,
        timeout: Duration,
    ) -> StorageResult<bool> {
        if !self.acquire(low, txn, LockMode::Exclusive, timeout).await? {
            return Ok(false);
        }
        if !self.acquire(high, txn, LockMode::Exclusive, timeout).await? {
            return Ok(false);
        }
        self.range_markers.insert(
            format!("{low}..{high}#{txn}"),
            RangeMarker {
                low: low.to_string(),
                high: high.to_string(),
            },
        );
        Ok(true)
    }

    /// Whether `key` falls inside any currently installed range marker,
    /// meaning an insert there must block.
    pub fn key_in_locked_range(&self, key: &str) -> bool {
        self.range_markers
            .iter()
            .any(|m| m.low.as_str() < key && key < m.high.as_str())
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// DFS from `start` along wait-for edges; if a path leads back to `start`,
/// a deadlock exists and the highest transaction id on that cycle (the
/// youngest participant) is returned as the victim.
fn detect_cycle(graph: &HashMap<i64, HashSet<i64>>, start: i64) -> Option<i64> {
    fn visit(
        graph: &HashMap<i64, HashSet<i64>>,
        start: i64,
        node: i64,
        path: &mut Vec<i64>,
    ) -> Option<i64> {
        path.push(node);
        if let Some(blockers) = graph.get(&node) {
            for &blocker in blockers {
                if blocker == start {
                    return Some(*path.iter().max().unwrap());
                }
                if !path.contains(&blocker) {
                    if let Some(victim) = visit(graph, start, blocker, path) {
                        return Some(victim);
                    }
                }
            }
        }
        path.pop();
        None
    }

    let mut path = Vec::new();
    visit(graph, start, start, &mut path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shared_locks_are_compatible() {
        let mgr = LockManager::new();
        assert!(mgr
            .acquire("r", 1, LockMode::Shared, Duration::from_millis(50))
            .await
            .unwrap());
        assert!(mgr
            .acquire("r", 2, LockMode::Shared, Duration::from_millis(50))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn exclusive_excludes_shared() {
        let mgr = Arc::new(LockManager::new());
        assert!(mgr
            .acquire("r", 1, LockMode::Exclusive, Duration::from_millis(50))
            .await
            .unwrap());
        let got = mgr
            .acquire("r", 2, LockMode::Shared, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!got);
    }

    #[tokio::test]
    async fn release_all_frees_resource_for_others() {
        let mgr = LockManager::new();
        mgr.acquire("r", 1, LockMode::Exclusive, Duration::from_millis(50))
            .await
            .unwrap();
        mgr.release_all(1).await;
        assert!(mgr
            .acquire("r", 2, LockMode::Exclusive, Duration::from_millis(50))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn upgrade_from_sole_shared_holder_succeeds() {
        let mgr = LockManager::new();
        mgr.acquire("r", 1, LockMode::Shared, Duration::from_millis(50))
            .await
            .unwrap();
        let upgraded = mgr
            .acquire("r", 1, LockMode::Exclusive, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(upgraded);
    }
}
