//! Priority queue of dispatchable batches.

use cinder_core::agent::Workspace;
use cinder_core::ids::{BatchId, JobId, PoolId};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

/// One batch waiting for an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub job_id: JobId,
    pub batch_id: BatchId,
    pub schedule_priority: i32,
    pub pool_id: PoolId,
    pub workspace: Option<Workspace>,
}

impl QueueItem {
    pub fn key(&self) -> QueueKey {
        QueueKey {
            schedule_priority: self.schedule_priority,
            job_id: self.job_id,
            batch_id: self.batch_id,
        }
    }
}

/// Ordering key: descending priority, then job id, then batch id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub schedule_priority: i32,
    pub job_id: JobId,
    pub batch_id: BatchId,
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .schedule_priority
            .cmp(&self.schedule_priority)
            .then_with(|| self.job_id.cmp(&other.job_id))
            .then_with(|| self.batch_id.cmp(&other.batch_id))
    }
}

#[derive(Debug)]
struct Entry {
    item: QueueItem,
    /// Set while an assignment for this item is in flight.
    assigning: bool,
}

/// Dispatchable batches of every job, with the update index each job was last seen at.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    ordered: BTreeSet<QueueKey>,
    entries: HashMap<(JobId, BatchId), Entry>,
    versions: HashMap<JobId, u64>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a job's items with those derived from the job at `update_index`.
    ///
    /// Returns false, leaving the queue untouched, when a newer version of the job was
    /// already applied.
    pub fn update_job(&mut self, job_id: JobId, update_index: u64, items: Vec<QueueItem>) -> bool {
        if let Some(&seen) = self.versions.get(&job_id)
            && seen > update_index
        {
            return false;
        }
        self.versions.insert(job_id, update_index);
        self.replace_job_items(job_id, items);
        true
    }

    /// Drop every item of a job, e.g. after it was deleted.
    pub fn remove_job(&mut self, job_id: JobId) {
        self.replace_job_items(job_id, Vec::new());
        self.versions.remove(&job_id);
    }

    fn replace_job_items(&mut self, job_id: JobId, items: Vec<QueueItem>) {
        let keep: HashSet<BatchId> = items.iter().map(|i| i.batch_id).collect();
        let stale: Vec<(JobId, BatchId)> = self
            .entries
            .keys()
            .filter(|(j, b)| *j == job_id && !keep.contains(b))
            .copied()
            .collect();
        for key in stale {
            self.remove(key.0, key.1);
        }
        for item in items {
            self.insert(item);
        }
    }

    fn insert(&mut self, item: QueueItem) {
        let key = (item.job_id, item.batch_id);
        let assigning = match self.entries.remove(&key) {
            Some(old) => {
                self.ordered.remove(&old.item.key());
                old.assigning
            }
            None => false,
        };
        self.ordered.insert(item.key());
        self.entries.insert(key, Entry { item, assigning });
    }

    pub fn remove(&mut self, job_id: JobId, batch_id: BatchId) -> Option<QueueItem> {
        let entry = self.entries.remove(&(job_id, batch_id))?;
        self.ordered.remove(&entry.item.key());
        Some(entry.item)
    }

    /// Claim the highest-priority unclaimed item served by one of `pools`.
    pub fn claim(&mut self, pools: &[PoolId]) -> Option<QueueItem> {
        for key in &self.ordered {
            if let Some(entry) = self.entries.get_mut(&(key.job_id, key.batch_id))
                && !entry.assigning
                && pools.contains(&entry.item.pool_id)
            {
                entry.assigning = true;
                return Some(entry.item.clone());
            }
        }
        None
    }

    /// Clear the assignment marker after an assignment did not go through.
    pub fn release(&mut self, job_id: JobId, batch_id: BatchId) {
        if let Some(entry) = self.entries.get_mut(&(job_id, batch_id)) {
            entry.assigning = false;
        }
    }

    pub fn is_assigning(&self, job_id: JobId, batch_id: BatchId) -> bool {
        self.entries
            .get(&(job_id, batch_id))
            .is_some_and(|e| e.assigning)
    }

    /// Unclaimed items in dispatch order.
    pub fn available(&self) -> impl Iterator<Item = &QueueItem> {
        self.ordered
            .iter()
            .filter_map(|key| self.entries.get(&(key.job_id, key.batch_id)))
            .filter(|entry| !entry.assigning)
            .map(|entry| &entry.item)
    }

    /// Every item in dispatch order.
    pub fn items(&self) -> Vec<QueueItem> {
        self.ordered
            .iter()
            .filter_map(|key| self.entries.get(&(key.job_id, key.batch_id)))
            .map(|entry| entry.item.clone())
            .collect()
    }

    pub fn version(&self, job_id: JobId) -> Option<u64> {
        self.versions.get(&job_id).copied()
    }

    /// Rebuild the queue from a full scan of the job store.
    ///
    /// `scanned` holds every dispatchable job found by the scan with the update index it
    /// was read at. Jobs in `touched` were updated while the scan ran; for those the
    /// newer of the live and scanned versions wins. Every other job not in the scan is
    /// dropped. Assignment markers survive for items present after the merge.
    pub fn reconcile(
        &mut self,
        scanned: HashMap<JobId, (u64, Vec<QueueItem>)>,
        touched: &HashSet<JobId>,
    ) {
        let live_jobs: HashSet<JobId> = self.versions.keys().copied().collect();
        for job_id in live_jobs {
            if !scanned.contains_key(&job_id) && !touched.contains(&job_id) {
                self.remove_job(job_id);
            }
        }
        for (job_id, (update_index, items)) in scanned {
            let live = self.versions.get(&job_id).copied();
            let keep_live = touched.contains(&job_id) && live.is_some_and(|v| v > update_index);
            if !keep_live {
                self.versions.insert(job_id, update_index);
                self.replace_job_items(job_id, items);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(job_id: JobId, batch: u16, priority: i32, pool: &str) -> QueueItem {
        QueueItem {
            job_id,
            batch_id: BatchId::new(batch),
            schedule_priority: priority,
            pool_id: PoolId::new(pool),
            workspace: None,
        }
    }

    #[test]
    fn test_priority_ordering() {
        let mut queue = DispatchQueue::new();
        let low = JobId::new();
        let high = JobId::new();
        queue.update_job(low, 1, vec![item(low, 1, 21, "win")]);
        queue.update_job(high, 1, vec![item(high, 1, 43, "win")]);

        let first = queue.claim(&[PoolId::new("win")]).unwrap();
        assert_eq!(first.job_id, high);
        let second = queue.claim(&[PoolId::new("win")]).unwrap();
        assert_eq!(second.job_id, low);
        assert!(queue.claim(&[PoolId::new("win")]).is_none());
    }

    #[test]
    fn test_ties_break_by_job_then_batch() {
        let mut queue = DispatchQueue::new();
        let (x, y) = (JobId::new(), JobId::new());
        let (a, b) = if x < y { (x, y) } else { (y, x) };
        queue.update_job(b, 1, vec![item(b, 1, 10, "win")]);
        queue.update_job(a, 1, vec![item(a, 7, 10, "win"), item(a, 3, 10, "win")]);

        let order: Vec<(JobId, u16)> = queue
            .items()
            .iter()
            .map(|i| (i.job_id, i.batch_id.value()))
            .collect();
        assert_eq!(order, vec![(a, 3), (a, 7), (b, 1)]);
    }

    #[test]
    fn test_claim_respects_pools_and_markers() {
        let mut queue = DispatchQueue::new();
        let job = JobId::new();
        queue.update_job(job, 1, vec![item(job, 1, 10, "linux"), item(job, 2, 5, "win")]);

        let claimed = queue.claim(&[PoolId::new("win")]).unwrap();
        assert_eq!(claimed.batch_id, BatchId::new(2));
        assert!(queue.is_assigning(job, BatchId::new(2)));
        assert!(queue.claim(&[PoolId::new("win")]).is_none());

        queue.release(job, BatchId::new(2));
        assert!(queue.claim(&[PoolId::new("win")]).is_some());
    }

    #[test]
    fn test_stale_updates_are_rejected() {
        let mut queue = DispatchQueue::new();
        let job = JobId::new();
        assert!(queue.update_job(job, 5, vec![item(job, 1, 10, "win")]));
        assert!(!queue.update_job(job, 4, vec![]));
        assert_eq!(queue.len(), 1);

        assert!(queue.update_job(job, 6, vec![]));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_update_keeps_assignment_marker() {
        let mut queue = DispatchQueue::new();
        let job = JobId::new();
        queue.update_job(job, 1, vec![item(job, 1, 10, "win")]);
        queue.claim(&[PoolId::new("win")]).unwrap();

        queue.update_job(job, 2, vec![item(job, 1, 30, "win")]);
        assert!(queue.is_assigning(job, BatchId::new(1)));
        assert_eq!(queue.items()[0].schedule_priority, 30);
    }

    #[test]
    fn test_reconcile_merges_concurrent_updates() {
        let mut queue = DispatchQueue::new();
        let scanned_job = JobId::new();
        let updated_job = JobId::new();
        let gone_job = JobId::new();
        queue.update_job(gone_job, 1, vec![item(gone_job, 1, 10, "win")]);
        // Applied while the scan was running, newer than what the scan read.
        queue.update_job(updated_job, 9, vec![item(updated_job, 2, 50, "win")]);

        let mut scanned = HashMap::new();
        scanned.insert(scanned_job, (3, vec![item(scanned_job, 1, 20, "win")]));
        scanned.insert(updated_job, (8, vec![item(updated_job, 1, 10, "win")]));
        let touched: HashSet<JobId> = [updated_job].into_iter().collect();

        queue.reconcile(scanned, &touched);

        let items = queue.items();
        assert_eq!(items.len(), 2);
        assert_eq!((items[0].job_id, items[0].batch_id), (updated_job, BatchId::new(2)));
        assert_eq!(items[1].job_id, scanned_job);
        assert_eq!(queue.version(updated_job), Some(9));
        assert_eq!(queue.version(gone_job), None);
    }
}
