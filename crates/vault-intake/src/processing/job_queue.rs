//! Multi-tier job queue with at-least-once delivery
//!
//! Each processing category owns its own lanes (three priority tiers plus the
//! background deep lane) behind its own mutex, so queue mutation for one
//! category never waits on another. Dequeue hands out a lease; a lease that is
//! neither acknowledged nor requeued before the visibility timeout is put back
//! by the reaper, so a worker dying between dequeue and ack loses nothing.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::types::{JobId, PathMode, ProcessingCategory, QueueTier};

/// Where an entry waits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    /// Fast-path work in a priority tier
    Tier(QueueTier),
    /// Background deep-path work
    Deep,
}

impl Lane {
    pub fn path(self) -> PathMode {
        match self {
            Lane::Tier(_) => PathMode::Fast,
            Lane::Deep => PathMode::Deep,
        }
    }
}

/// A reference to queued work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub category: ProcessingCategory,
    pub lane: Lane,
    pub enqueued_at: DateTime<Utc>,
}

/// Exclusive claim on one dequeued entry
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: Uuid,
    pub entry: QueueEntry,
    /// 1 on first delivery, incremented on every redelivery
    pub deliveries: u32,
}

impl Lease {
    pub fn path(&self) -> PathMode {
        self.entry.lane.path()
    }
}

#[derive(Debug)]
struct InFlight {
    entry: QueueEntry,
    deadline: Instant,
    deliveries: u32,
}

#[derive(Debug)]
struct Delayed {
    ready_at: Instant,
    entry: QueueEntry,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct CategoryLanes {
    tiers: [VecDeque<(QueueEntry, u32)>; 3],
    deep: VecDeque<(QueueEntry, u32)>,
    delayed: Vec<Delayed>,
    /// Consecutive dispatches from a higher tier while a lower tier was waiting
    starved_dispatches: u32,
}

impl CategoryLanes {
    fn lane_mut(&mut self, lane: Lane) -> &mut VecDeque<(QueueEntry, u32)> {
        match lane {
            Lane::Tier(tier) => &mut self.tiers[tier.index()],
            Lane::Deep => &mut self.deep,
        }
    }

    fn promote_ready(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        let (ready, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.delayed).into_iter().partition(|d| d.ready_at <= now);
        self.delayed = waiting;
        for d in ready {
            let lane = d.entry.lane;
            self.lane_mut(lane).push_back((d.entry, d.deliveries));
        }
    }

    /// Strict priority, except that every `window`-th dispatch goes to the
    /// highest waiting lower tier
    fn select_tier(&mut self, window: Option<u32>) -> Option<usize> {
        let top = self.tiers.iter().position(|t| !t.is_empty())?;
        let lower = (top + 1..self.tiers.len()).find(|&i| !self.tiers[i].is_empty());

        match (lower, window) {
            (Some(lower), Some(window)) if self.starved_dispatches + 1 >= window => {
                self.starved_dispatches = 0;
                Some(lower)
            }
            (Some(_), _) => {
                self.starved_dispatches += 1;
                Some(top)
            }
            (None, _) => {
                self.starved_dispatches = 0;
                Some(top)
            }
        }
    }

    fn remove_job(&mut self, job_id: &JobId) -> usize {
        let mut removed = 0;
        for lane in self.tiers.iter_mut().chain(std::iter::once(&mut self.deep)) {
            let before = lane.len();
            lane.retain(|(e, _)| &e.job_id != job_id);
            removed += before - lane.len();
        }
        let before = self.delayed.len();
        self.delayed.retain(|d| &d.entry.job_id != job_id);
        removed + before - self.delayed.len()
    }
}

/// Queue depth snapshot
#[derive(Debug, Clone, Serialize)]
pub struct QueueDepth {
    pub priority: usize,
    pub normal: usize,
    pub bulk: usize,
    pub deep: usize,
    pub delayed: usize,
    pub in_flight: usize,
}

/// Multi-tier queue shared by intake and all dispatcher loops
#[derive(Debug)]
pub struct JobQueue {
    lanes: Vec<Mutex<CategoryLanes>>,
    notifiers: Vec<Notify>,
    in_flight: DashMap<Uuid, InFlight>,
    fairness_window: Option<u32>,
    visibility_timeout: Duration,
}

impl JobQueue {
    pub fn new(config: &QueueConfig) -> Self {
        let count = ProcessingCategory::ALL.len();
        Self {
            lanes: (0..count).map(|_| Mutex::new(CategoryLanes::default())).collect(),
            notifiers: (0..count).map(|_| Notify::new()).collect(),
            in_flight: DashMap::new(),
            fairness_window: config.fairness_window(),
            visibility_timeout: config.visibility_timeout(),
        }
    }

    /// Append fast-path work to a tier. The tier is never changed afterwards.
    pub fn enqueue(&self, job_id: JobId, category: ProcessingCategory, tier: QueueTier) {
        self.push(job_id, category, Lane::Tier(tier));
    }

    /// Append deep-path work to the background lane
    pub fn enqueue_deep(&self, job_id: JobId, category: ProcessingCategory) {
        self.push(job_id, category, Lane::Deep);
    }

    fn push(&self, job_id: JobId, category: ProcessingCategory, lane: Lane) {
        let entry = QueueEntry {
            job_id,
            category,
            lane,
            enqueued_at: Utc::now(),
        };
        self.lanes[category.index()].lock().lane_mut(lane).push_back((entry, 0));
        self.notifiers[category.index()].notify_one();
    }

    /// Take the highest-priority fast-path entry for `category`
    pub fn dequeue(&self, category: ProcessingCategory) -> Option<Lease> {
        let mut lanes = self.lanes[category.index()].lock();
        lanes.promote_ready(Instant::now());
        let tier = lanes.select_tier(self.fairness_window)?;
        let (entry, deliveries) = lanes.tiers[tier].pop_front()?;
        drop(lanes);
        Some(self.lease(entry, deliveries))
    }

    /// Take the oldest deep-path entry for `category`
    pub fn dequeue_deep(&self, category: ProcessingCategory) -> Option<Lease> {
        let mut lanes = self.lanes[category.index()].lock();
        lanes.promote_ready(Instant::now());
        let (entry, deliveries) = lanes.deep.pop_front()?;
        drop(lanes);
        Some(self.lease(entry, deliveries))
    }

    fn lease(&self, entry: QueueEntry, previous_deliveries: u32) -> Lease {
        let lease = Lease {
            id: Uuid::new_v4(),
            entry: entry.clone(),
            deliveries: previous_deliveries + 1,
        };
        self.in_flight.insert(
            lease.id,
            InFlight {
                entry,
                deadline: Instant::now() + self.visibility_timeout,
                deliveries: lease.deliveries,
            },
        );
        lease
    }

    /// Work finished (or is terminally handled); forget the lease
    pub fn ack(&self, lease: &Lease) -> bool {
        self.in_flight.remove(&lease.id).is_some()
    }

    /// Put leased work back, visible again after `delay`
    pub fn requeue(&self, lease: &Lease, delay: Duration) -> bool {
        let Some((_, in_flight)) = self.in_flight.remove(&lease.id) else {
            // already reaped and redelivered
            return false;
        };
        let category = in_flight.entry.category;
        let mut lanes = self.lanes[category.index()].lock();
        if delay.is_zero() {
            let lane = in_flight.entry.lane;
            lanes.lane_mut(lane).push_back((in_flight.entry, in_flight.deliveries));
        } else {
            lanes.delayed.push(Delayed {
                ready_at: Instant::now() + delay,
                entry: in_flight.entry,
                deliveries: in_flight.deliveries,
            });
        }
        drop(lanes);
        self.notifiers[category.index()].notify_one();
        true
    }

    /// Return expired leases to the front of their lanes
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| *e.key())
            .collect();

        let mut reaped = 0;
        for id in expired {
            if let Some((_, in_flight)) = self.in_flight.remove(&id) {
                let category = in_flight.entry.category;
                tracing::warn!(
                    "Lease {} for job {} expired, redelivering",
                    id,
                    in_flight.entry.job_id.short()
                );
                let lane = in_flight.entry.lane;
                self.lanes[category.index()]
                    .lock()
                    .lane_mut(lane)
                    .push_front((in_flight.entry, in_flight.deliveries));
                self.notifiers[category.index()].notify_one();
                reaped += 1;
            }
        }
        reaped
    }

    /// Drop every pending entry for a job (cancellation before dispatch)
    pub fn remove_job(&self, job_id: &JobId, category: ProcessingCategory) -> usize {
        self.lanes[category.index()].lock().remove_job(job_id)
    }

    /// Pending entries in one tier, across all categories
    pub fn peek_depth(&self, tier: QueueTier) -> usize {
        self.lanes
            .iter()
            .map(|l| l.lock().tiers[tier.index()].len())
            .sum()
    }

    /// Pending entries of any lane for one category
    pub fn depth_for(&self, category: ProcessingCategory) -> usize {
        let lanes = self.lanes[category.index()].lock();
        lanes.tiers.iter().map(VecDeque::len).sum::<usize>() + lanes.deep.len() + lanes.delayed.len()
    }

    pub fn depth(&self) -> QueueDepth {
        let mut depth = QueueDepth {
            priority: 0,
            normal: 0,
            bulk: 0,
            deep: 0,
            delayed: 0,
            in_flight: self.in_flight.len(),
        };
        for lanes in &self.lanes {
            let lanes = lanes.lock();
            depth.priority += lanes.tiers[QueueTier::Priority.index()].len();
            depth.normal += lanes.tiers[QueueTier::Normal.index()].len();
            depth.bulk += lanes.tiers[QueueTier::Bulk.index()].len();
            depth.deep += lanes.deep.len();
            depth.delayed += lanes.delayed.len();
        }
        depth
    }

    /// Resolves when work is pushed for `category`
    pub fn notified(&self, category: ProcessingCategory) -> Notified<'_> {
        self.notifiers[category.index()].notified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn queue(share: f64) -> JobQueue {
        JobQueue::new(&QueueConfig {
            min_dispatch_share: share,
            visibility_timeout_secs: 60,
            ..Default::default()
        })
    }

    fn id(tag: &str) -> JobId {
        JobId::for_bytes(tag.as_bytes())
    }

    const DOCS: ProcessingCategory = ProcessingCategory::Documents;

    #[test]
    fn test_higher_tier_first_then_fifo() {
        let q = queue(0.0);
        q.enqueue(id("n1"), DOCS, QueueTier::Normal);
        q.enqueue(id("b1"), DOCS, QueueTier::Bulk);
        q.enqueue(id("p1"), DOCS, QueueTier::Priority);
        q.enqueue(id("p2"), DOCS, QueueTier::Priority);

        let order: Vec<JobId> = std::iter::from_fn(|| q.dequeue(DOCS))
            .map(|l| l.entry.job_id)
            .collect();
        assert_eq!(order, vec![id("p1"), id("p2"), id("n1"), id("b1")]);
    }

    #[test]
    fn test_strict_priority_starves_lower_tiers() {
        let q = queue(0.0);
        q.enqueue(id("normal"), DOCS, QueueTier::Normal);
        for i in 0..50 {
            q.enqueue(id(&format!("p{}", i)), DOCS, QueueTier::Priority);
        }
        for _ in 0..50 {
            let lease = q.dequeue(DOCS).unwrap();
            assert_eq!(lease.entry.lane, Lane::Tier(QueueTier::Priority));
        }
        assert_eq!(q.dequeue(DOCS).unwrap().entry.job_id, id("normal"));
    }

    #[test]
    fn test_minimum_share_bounds_starvation() {
        let q = queue(0.1);
        for i in 0..3 {
            q.enqueue(id(&format!("n{}", i)), DOCS, QueueTier::Normal);
        }
        for i in 0..30 {
            q.enqueue(id(&format!("p{}", i)), DOCS, QueueTier::Priority);
        }

        let lanes: Vec<Lane> = (0..30).map(|_| q.dequeue(DOCS).unwrap().entry.lane).collect();
        let lower: Vec<usize> = lanes
            .iter()
            .enumerate()
            .filter(|(_, l)| **l != Lane::Tier(QueueTier::Priority))
            .map(|(i, _)| i)
            .collect();
        // every tenth dispatch goes to the waiting normal tier
        assert_eq!(lower, vec![9, 19, 29]);
    }

    #[test]
    fn test_share_only_applies_while_lower_tier_waits() {
        let q = queue(0.5);
        q.enqueue(id("p1"), DOCS, QueueTier::Priority);
        q.enqueue(id("p2"), DOCS, QueueTier::Priority);
        q.enqueue(id("p3"), DOCS, QueueTier::Priority);
        assert!(std::iter::from_fn(|| q.dequeue(DOCS))
            .all(|l| l.entry.lane == Lane::Tier(QueueTier::Priority)));
    }

    #[test]
    fn test_categories_are_isolated() {
        let q = queue(0.1);
        q.enqueue(id("doc"), DOCS, QueueTier::Priority);
        assert!(q.dequeue(ProcessingCategory::Audio).is_none());
        assert!(q.dequeue_deep(DOCS).is_none());
        assert!(q.dequeue(DOCS).is_some());
    }

    #[test]
    fn test_deep_lane_is_separate() {
        let q = queue(0.1);
        q.enqueue_deep(id("deep"), DOCS);
        assert!(q.dequeue(DOCS).is_none());
        let lease = q.dequeue_deep(DOCS).unwrap();
        assert_eq!(lease.path(), PathMode::Deep);
        assert_eq!(q.depth().in_flight, 1);
        assert!(q.ack(&lease));
        assert_eq!(q.depth().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_lease_is_redelivered() {
        let q = queue(0.1);
        q.enqueue(id("a"), DOCS, QueueTier::Normal);
        let first = q.dequeue(DOCS).unwrap();
        assert!(q.dequeue(DOCS).is_none());

        assert_eq!(q.reap_expired(), 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(q.reap_expired(), 1);

        let second = q.dequeue(DOCS).unwrap();
        assert_eq!(second.entry.job_id, first.entry.job_id);
        assert_eq!(second.deliveries, 2);
        // the stale lease can no longer be acknowledged
        assert!(!q.ack(&first));
        assert!(q.ack(&second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_with_delay() {
        let q = queue(0.1);
        q.enqueue(id("a"), DOCS, QueueTier::Bulk);
        let lease = q.dequeue(DOCS).unwrap();
        assert!(q.requeue(&lease, Duration::from_secs(4)));
        assert_eq!(q.depth().delayed, 1);

        assert!(q.dequeue(DOCS).is_none());
        tokio::time::advance(Duration::from_secs(4)).await;
        let again = q.dequeue(DOCS).unwrap();
        assert_eq!(again.entry.lane, Lane::Tier(QueueTier::Bulk));
        assert_eq!(again.deliveries, 2);
    }

    #[test]
    fn test_remove_job_before_dispatch() {
        let q = queue(0.1);
        q.enqueue(id("a"), DOCS, QueueTier::Normal);
        q.enqueue_deep(id("a"), DOCS);
        q.enqueue(id("b"), DOCS, QueueTier::Normal);
        assert_eq!(q.remove_job(&id("a"), DOCS), 2);
        assert_eq!(q.depth_for(DOCS), 1);
        assert_eq!(q.peek_depth(QueueTier::Normal), 1);
    }

    #[test]
    fn test_concurrent_dequeue_never_duplicates() {
        let q = Arc::new(queue(0.1));
        for i in 0..2000 {
            let tier = QueueTier::ALL[i % 3];
            q.enqueue(id(&format!("job-{}", i)), DOCS, tier);
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(lease) = q.dequeue(DOCS) {
                        got.push(lease.entry.job_id);
                    }
                    got
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for job_id in handle.join().unwrap() {
                total += 1;
                assert!(seen.insert(job_id), "job dispatched twice");
            }
        }
        assert_eq!(total, 2000);
    }
}
