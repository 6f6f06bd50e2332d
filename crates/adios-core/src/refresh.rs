//! Debounced model-refresh timer and its tokio worker.
//!
//! Completions arm the timer with "run at or before T" semantics: arming
//! only ever moves the deadline earlier, so a burst of completions results
//! in a single refresh.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::scheduler::Scheduler;

/// Reduce-only one-shot timer.
#[derive(Debug, Default)]
pub struct RefreshTimer {
    deadline_ns: Mutex<Option<u64>>,
    rearmed: Notify,
}

impl RefreshTimer {
    /// Creates a disarmed timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the timer to fire at or before `at_ns`.
    ///
    /// Returns true if the deadline moved earlier (or the timer was idle).
    pub fn arm_at_or_before(&self, at_ns: u64) -> bool {
        let mut deadline = self.deadline_ns.lock();
        let sooner = deadline.map_or(true, |current| at_ns < current);
        if sooner {
            *deadline = Some(at_ns);
            drop(deadline);
            self.rearmed.notify_one();
        }
        sooner
    }

    /// True if armed and `now_ns` has reached the deadline.
    pub fn due(&self, now_ns: u64) -> bool {
        self.deadline_ns.lock().is_some_and(|at| at <= now_ns)
    }

    /// Disarms the timer if it is due, returning whether it was.
    pub fn take_if_due(&self, now_ns: u64) -> bool {
        let mut deadline = self.deadline_ns.lock();
        match *deadline {
            Some(at) if at <= now_ns => {
                *deadline = None;
                true
            }
            _ => false,
        }
    }

    /// The armed deadline, if any.
    pub fn deadline(&self) -> Option<u64> {
        *self.deadline_ns.lock()
    }

    /// Disarms the timer.
    pub fn disarm(&self) {
        *self.deadline_ns.lock() = None;
    }

    async fn rearmed(&self) {
        self.rearmed.notified().await
    }
}

/// Background task that runs model refreshes when the timer fires.
pub struct RefreshWorker {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl RefreshWorker {
    /// Longest the worker sleeps without re-checking the timer.
    pub const IDLE_POLL: Duration = Duration::from_millis(500);

    /// Spawns the worker on the current tokio runtime.
    pub fn spawn(scheduler: Arc<Scheduler>) -> Self {
        let (tx, mut rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            debug!("Refresh worker started");
            loop {
                let now = scheduler.now_ns();
                let sleep_for = match scheduler.refresh_timer().deadline() {
                    Some(at) => Duration::from_nanos(at.saturating_sub(now)),
                    None => Self::IDLE_POLL,
                };

                tokio::select! {
                    _ = &mut rx => break,
                    _ = scheduler.refresh_timer().rearmed() => continue,
                    _ = tokio::time::sleep(sleep_for) => {}
                }

                let now = scheduler.now_ns();
                if scheduler.refresh_timer().take_if_due(now) {
                    scheduler.refresh(now);
                }
            }
            debug!("Refresh worker stopped");
        });

        Self {
            shutdown: Some(tx),
            handle,
        }
    }

    /// Stops the worker and waits for any in-flight refresh to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.handle).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_timer_not_due() {
        let timer = RefreshTimer::new();
        assert!(!timer.due(u64::MAX));
        assert!(timer.deadline().is_none());
    }

    #[test]
    fn test_arm_only_moves_earlier() {
        let timer = RefreshTimer::new();
        assert!(timer.arm_at_or_before(1_000));
        assert!(!timer.arm_at_or_before(2_000));
        assert_eq!(timer.deadline(), Some(1_000));
        assert!(timer.arm_at_or_before(500));
        assert_eq!(timer.deadline(), Some(500));
    }

    #[test]
    fn test_take_if_due() {
        let timer = RefreshTimer::new();
        timer.arm_at_or_before(100);
        assert!(!timer.take_if_due(99));
        assert!(timer.due(100));
        assert!(timer.take_if_due(100));
        assert!(timer.deadline().is_none());
        assert!(!timer.take_if_due(200));
    }

    #[test]
    fn test_disarm() {
        let timer = RefreshTimer::new();
        timer.arm_at_or_before(100);
        timer.disarm();
        assert!(!timer.due(1_000));
    }

    #[tokio::test]
    async fn test_worker_folds_pending_samples() {
        use crate::category::OpCategory;
        use crate::config::SchedulerConfig;
        use crate::operation::{OpRequest, OperationId};

        let config = SchedulerConfig {
            refresh_debounce_ms: 0,
            ..Default::default()
        };
        let scheduler = Arc::new(Scheduler::new(config).unwrap());
        let worker = RefreshWorker::spawn(Arc::clone(&scheduler));

        // One bootstrap sample, then enough to hit the count trigger.
        for i in 0..1_100u64 {
            let id = OperationId(i);
            scheduler
                .insert(OpRequest::new(id, OpCategory::Read, 4096, 0), false)
                .unwrap();
            scheduler.dispatch().unwrap();
            scheduler.complete(id, Some(0), 100_000);
        }

        let mut folded = false;
        for _ in 0..200 {
            if scheduler.model_params(OpCategory::Read).small_count > 1 {
                folded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(folded, "worker never refreshed the model");
        assert_eq!(scheduler.model_params(OpCategory::Read).base, 100_000);

        // The worker consumes the timer once it has fired.
        let mut disarmed = false;
        for _ in 0..200 {
            if scheduler.refresh_timer().deadline().is_none() {
                disarmed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(disarmed, "worker left a fired timer armed");

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_shutdown_when_idle() {
        let scheduler = Arc::new(Scheduler::new(Default::default()).unwrap());
        let worker = RefreshWorker::spawn(Arc::clone(&scheduler));
        tokio::time::timeout(Duration::from_secs(1), worker.shutdown())
            .await
            .unwrap();
    }
}
