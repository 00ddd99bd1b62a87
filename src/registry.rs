//! The rendezvous registry: agent liveness plus the per-agent work and
//! result queues that reunite a waiting scrape handler with its agent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::gauge;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::metrics::ACTIVE_AGENTS;
use crate::wire::{ProxyRequest, ProxyResponse};

/// Capacity of each per-agent queue. Bounded so that an agent that stops
/// consuming applies backpressure instead of growing memory.
pub const QUEUE_CAPACITY: usize = 256;

/// Records are purged once they are this many registration windows old. The
/// gap between the liveness check and the purge horizon guarantees that a
/// handler which just passed `is_available` still finds its queues.
const SWEEP_GRACE_MULTIPLIER: u32 = 5;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct AgentEntry {
    last_seen: Instant,
    /// False until the first heartbeat; records created by `enqueue_work`
    /// exist but are not scrapeable.
    registered: bool,
    work_tx: mpsc::Sender<ProxyRequest>,
    work_rx: Arc<Mutex<mpsc::Receiver<ProxyRequest>>>,
    result_tx: mpsc::Sender<ProxyResponse>,
    result_rx: Arc<Mutex<mpsc::Receiver<ProxyResponse>>>,
}

impl AgentEntry {
    fn new(registered: bool) -> Self {
        let (work_tx, work_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (result_tx, result_rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            last_seen: Instant::now(),
            registered,
            work_tx,
            work_rx: Arc::new(Mutex::new(work_rx)),
            result_tx,
            result_rx: Arc::new(Mutex::new(result_rx)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub deleted: usize,
    pub remaining: usize,
}

/// Shared state of the proxy. All map operations are O(1) and never block;
/// waiting happens on queue handles obtained from the map, outside it.
pub struct Registry {
    agents: DashMap<String, AgentEntry>,
    registration_timeout: Duration,
}

impl Registry {
    pub fn new(registration_timeout: Duration) -> Self {
        Self {
            agents: DashMap::new(),
            registration_timeout,
        }
    }

    /// Record a heartbeat: create the agent's queues if needed and refresh
    /// its liveness window.
    pub fn register(&self, id: &str) {
        let mut entry = self
            .agents
            .entry(id.to_string())
            .or_insert_with(|| AgentEntry::new(true));
        entry.last_seen = Instant::now();
        entry.registered = true;
    }

    /// True iff the agent has heartbeated within the registration window.
    pub fn is_available(&self, id: &str) -> bool {
        self.agents
            .get(id)
            .map(|entry| entry.registered && entry.last_seen.elapsed() <= self.registration_timeout)
            .unwrap_or(false)
    }

    /// Queue a work item for the agent. Non-blocking: a full queue drops the
    /// item with a warning and the monitoring server's next scrape re-drives.
    ///
    /// A missing record is created on the spot; callers are expected to have
    /// checked `is_available` first, so this only covers the race with the
    /// sweeper.
    pub fn enqueue_work(&self, id: &str, work: ProxyRequest) {
        let entry = self
            .agents
            .entry(id.to_string())
            .or_insert_with(|| AgentEntry::new(false));
        match entry.work_tx.try_send(work) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Work queue for client {} is full, dropping scrape request", id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Work queue for client {} is closed, dropping scrape request", id);
            }
        }
    }

    /// Wait for the agent's next work item. Cancellable; no item is lost
    /// when the caller gives up mid-wait. Returns `None` once the record has
    /// been swept away.
    pub async fn next_work(&self, id: &str) -> Option<ProxyRequest> {
        let queue = self.agents.get(id)?.work_rx.clone();
        let mut queue = queue.lock().await;
        queue.recv().await
    }

    /// Hand a scrape result (or error) to whichever handler awaits it.
    /// Non-blocking: returns false when the record is gone or the queue is
    /// full, in which case the result is dropped. Any result refreshes the
    /// agent's liveness window.
    pub fn deliver_result(&self, id: &str, result: ProxyResponse) -> bool {
        match self.agents.get_mut(id) {
            Some(mut entry) => {
                entry.last_seen = Instant::now();
                entry.result_tx.try_send(result).is_ok()
            }
            None => false,
        }
    }

    /// Wait for the next result pushed by the agent. Cancellation is the
    /// caller's future being dropped. Returns `None` once the record has
    /// been swept away.
    pub async fn await_result(&self, id: &str) -> Option<ProxyResponse> {
        let queue = self.agents.get(id)?.result_rx.clone();
        let mut queue = queue.lock().await;
        queue.recv().await
    }

    /// Ids of all agents currently within the registration window.
    pub fn live_agents(&self) -> Vec<String> {
        self.agents
            .iter()
            .filter(|entry| {
                entry.registered && entry.last_seen.elapsed() <= self.registration_timeout
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop records not seen for `SWEEP_GRACE_MULTIPLIER` registration
    /// windows, releasing their queues.
    pub fn sweep(&self) -> SweepStats {
        let horizon = self.registration_timeout * SWEEP_GRACE_MULTIPLIER;
        let mut deleted = 0;

        self.agents.retain(|id, entry| {
            if entry.last_seen.elapsed() > horizon {
                debug!("Removing expired record for client {}", id);
                deleted += 1;
                false
            } else {
                true
            }
        });

        SweepStats {
            deleted,
            remaining: self.agents.len(),
        }
    }
}

/// Spawn the periodic cleanup task for expired agent records.
pub fn start_sweeper(registry: Arc<Registry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);

        loop {
            interval.tick().await;

            let stats = registry.sweep();
            gauge!(ACTIVE_AGENTS).set(registry.live_agents().len() as f64);

            if stats.deleted > 0 {
                info!(
                    "Swept {} expired agent records, {} remaining",
                    stats.deleted, stats.remaining
                );
            } else {
                debug!("Sweep found no expired agent records");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(timeout_ms: u64) -> Registry {
        Registry::new(Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn heartbeat_registers_and_is_idempotent() {
        let registry = registry(500);
        assert!(!registry.is_available("a"));

        registry.register("a");
        registry.register("a");
        registry.register("a");

        assert!(registry.is_available("a"));
        assert_eq!(registry.live_agents(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn liveness_expires_after_registration_timeout() {
        let registry = registry(50);
        registry.register("a");
        assert!(registry.is_available("a"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!registry.is_available("a"));
        assert!(registry.live_agents().is_empty());
    }

    #[tokio::test]
    async fn work_is_delivered_in_order() {
        let registry = registry(500);
        registry.register("a");
        registry.enqueue_work("a", ProxyRequest::for_target("a", "/first"));
        registry.enqueue_work("a", ProxyRequest::for_target("a", "/second"));

        let first = registry.next_work("a").await.unwrap();
        assert_eq!(first.scrape_requests["a"], "/first");
        let second = registry.next_work("a").await.unwrap();
        assert_eq!(second.scrape_requests["a"], "/second");
    }

    #[tokio::test]
    async fn enqueue_before_heartbeat_does_not_mark_live() {
        let registry = registry(500);
        registry.enqueue_work("a", ProxyRequest::for_target("a", "/metrics"));

        assert!(!registry.is_available("a"));
        assert!(registry.live_agents().is_empty());

        // the queued item survives until the agent registers and polls
        registry.register("a");
        assert!(registry.next_work("a").await.is_some());
    }

    #[tokio::test]
    async fn full_work_queue_drops_excess_items() {
        let registry = registry(500);
        registry.register("a");
        for n in 0..QUEUE_CAPACITY + 10 {
            registry.enqueue_work("a", ProxyRequest::for_target("a", &format!("/{n}")));
        }

        for _ in 0..QUEUE_CAPACITY {
            assert!(registry.next_work("a").await.is_some());
        }
        let extra = tokio::time::timeout(Duration::from_millis(50), registry.next_work("a")).await;
        assert!(extra.is_err(), "items beyond the queue capacity must be dropped");
    }

    #[tokio::test]
    async fn results_reach_a_waiting_consumer() {
        let registry = Arc::new(registry(500));
        registry.register("a");

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.await_result("a").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(registry.deliver_result("a", ProxyResponse::success("a", "up 1".into())));
        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.payload["a"], "up 1");
    }

    #[tokio::test]
    async fn results_for_unknown_agents_are_dropped() {
        let registry = registry(500);
        assert!(!registry.deliver_result("ghost", ProxyResponse::success("ghost", "up 1".into())));
    }

    #[tokio::test]
    async fn delivering_a_result_refreshes_liveness() {
        let registry = registry(150);
        registry.register("a");

        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.deliver_result("a", ProxyResponse::success("a", "up 1".into()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // 200ms since the heartbeat but only 100ms since the result
        assert!(registry.is_available("a"));
    }

    #[tokio::test]
    async fn sweep_honours_the_grace_window() {
        // liveness window 40ms, sweep horizon 5x = 200ms
        let registry = registry(40);
        registry.register("stale");

        tokio::time::sleep(Duration::from_millis(80)).await;
        // expired for scraping, but still within the sweep grace window
        assert!(!registry.is_available("stale"));
        assert_eq!(registry.sweep(), SweepStats { deleted: 0, remaining: 1 });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registry.sweep(), SweepStats { deleted: 1, remaining: 0 });
    }

    #[tokio::test]
    async fn sweep_closes_the_work_queue() {
        let registry = Arc::new(registry(10));
        registry.register("a");

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.next_work("a").await })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        registry.sweep();

        // a pending long-poll observes the closed queue instead of hanging
        assert!(waiter.await.unwrap().is_none());
    }
}
