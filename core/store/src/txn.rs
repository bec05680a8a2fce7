use otter_primitives::{TransactionData, MAX_ROW_ID};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one client session. Sessions map 1:1 to at most one open
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Hands out transaction ids (above [`MAX_ROW_ID`]) and commit ids (small,
/// monotonic), and tracks the active transaction set so version cleanup
/// knows what it may touch.
pub struct TransactionManager {
    next_transaction_id: AtomicU64,
    next_commit_id: AtomicU64,
    active: Mutex<HashMap<SessionId, TransactionData>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_transaction_id: AtomicU64::new(MAX_ROW_ID + 1),
            next_commit_id: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Open a transaction for `session`. Its start time is the latest
    /// allocated commit id, so it sees exactly the commits that happened
    /// before it began.
    pub fn begin(&self, session: SessionId) -> TransactionData {
        let mut active = self.active.lock();
        let txn = TransactionData {
            transaction_id: self.next_transaction_id.fetch_add(1, Ordering::AcqRel),
            start_time: self.last_commit_id(),
        };
        active.insert(session, txn);
        txn
    }

    /// The transaction currently open for `session`, if any.
    pub fn get(&self, session: SessionId) -> Option<TransactionData> {
        self.active.lock().get(&session).copied()
    }

    /// Allocate a commit id and close the session's transaction. The caller
    /// hands the id to storage to rewrite tentative markers.
    pub fn commit(&self, session: SessionId) -> Option<u64> {
        let mut active = self.active.lock();
        active.remove(&session)?;
        Some(self.next_commit_id.fetch_add(1, Ordering::AcqRel))
    }

    /// Drop the session's transaction without a commit id. Storage reverts
    /// its tentative markers separately.
    pub fn abort(&self, session: SessionId) -> Option<TransactionData> {
        self.active.lock().remove(&session)
    }

    pub fn last_commit_id(&self) -> u64 {
        self.next_commit_id.load(Ordering::Acquire) - 1
    }

    /// The lower bound of what version cleanup may rewrite: the minimum
    /// start time of any active transaction, or the latest commit id when
    /// none are active.
    pub fn lowest_active_start_time(&self) -> u64 {
        let active = self.active.lock();
        active.values().map(|t| t.start_time).min().unwrap_or_else(|| self.last_commit_id())
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_ids_are_above_the_sentinel() {
        let mgr = TransactionManager::new();
        let txn = mgr.begin(SessionId(1));
        assert!(txn.transaction_id > MAX_ROW_ID);
        assert_eq!(txn.start_time, 0);
    }

    #[test]
    fn commit_ids_are_small_and_monotonic() {
        let mgr = TransactionManager::new();
        mgr.begin(SessionId(1));
        mgr.begin(SessionId(2));
        let c1 = mgr.commit(SessionId(1)).unwrap();
        let c2 = mgr.commit(SessionId(2)).unwrap();
        assert_eq!(c1, 1);
        assert_eq!(c2, 2);
        assert!(c2 < MAX_ROW_ID);
    }

    #[test]
    fn later_transactions_start_after_commits() {
        let mgr = TransactionManager::new();
        mgr.begin(SessionId(1));
        let c1 = mgr.commit(SessionId(1)).unwrap();
        let t2 = mgr.begin(SessionId(2));
        assert_eq!(t2.start_time, c1);
    }

    #[test]
    fn lowest_active_start_time_bounds_cleanup() {
        let mgr = TransactionManager::new();
        assert_eq!(mgr.lowest_active_start_time(), 0);

        mgr.begin(SessionId(1));
        mgr.commit(SessionId(1)).unwrap();
        // no active transactions: latest commit id
        assert_eq!(mgr.lowest_active_start_time(), 1);

        let t2 = mgr.begin(SessionId(2));
        mgr.begin(SessionId(3));
        mgr.commit(SessionId(3)).unwrap();
        // t2 is still active and pins the horizon
        assert_eq!(mgr.lowest_active_start_time(), t2.start_time);

        mgr.abort(SessionId(2));
        assert_eq!(mgr.lowest_active_start_time(), 2);
    }

    #[test]
    fn double_commit_returns_none() {
        let mgr = TransactionManager::new();
        mgr.begin(SessionId(1));
        assert!(mgr.commit(SessionId(1)).is_some());
        assert!(mgr.commit(SessionId(1)).is_none());
    }
}
