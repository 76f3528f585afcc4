// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{BudgetError, GatewayError, Result};

/// Admission gate every request passes through before it is sent.
#[async_trait]
pub trait AdmissionControl: Send + Sync + 'static {
    /// Wait for a permit, or fail with [`GatewayError::LimiterRejected`] /
    /// [`GatewayError::LimiterCancelled`].
    async fn acquire(&self, cancel: &CancellationToken) -> Result<Permit>;
}

/// Proof of admission. Dropping it marks the request as finished; it never refunds budget.
#[derive(Debug)]
pub struct Permit {
    id: u64,
    granted_at: Instant,
}

impl Permit {
    fn new(id: u64) -> Self {
        Self {
            id,
            granted_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn granted_at(&self) -> Instant {
        self.granted_at
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        trace!(
            target: "discogs",
            permit = self.id,
            held = ?self.granted_at.elapsed(),
            "permit released"
        );
    }
}

/// Limits for the fixed-window limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermitBudget {
    window: Duration,
    permits_per_window: u32,
    max_queue_depth: usize,
}

impl PermitBudget {
    pub fn new(
        window: Duration,
        permits_per_window: u32,
        max_queue_depth: usize,
    ) -> std::result::Result<Self, BudgetError> {
        if permits_per_window == 0 {
            return Err(BudgetError::NoPermits);
        }
        if window.is_zero() {
            return Err(BudgetError::EmptyWindow);
        }
        Ok(Self {
            window,
            permits_per_window,
            max_queue_depth,
        })
    }

    /// Discogs allows 60 authenticated requests per minute; spend them at one per second.
    pub fn discogs_default() -> Self {
        Self {
            window: Duration::from_secs(1),
            permits_per_window: 1,
            max_queue_depth: 1000,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn permits_per_window(&self) -> u32 {
        self.permits_per_window
    }

    pub fn max_queue_depth(&self) -> usize {
        self.max_queue_depth
    }
}

impl Default for PermitBudget {
    fn default() -> Self {
        Self::discogs_default()
    }
}

/// Fixed-window limiter with a bounded FIFO wait queue.
///
/// Up to `permits_per_window` callers are admitted per window. Callers arriving
/// once the window is spent wait in line; a dispatcher task wakes at each window
/// boundary and admits them in arrival order. When the line is full, `acquire`
/// fails immediately instead of growing the backlog.
///
/// Clones share the same budget.
#[derive(Debug, Clone)]
pub struct FixedWindowLimiter {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    budget: PermitBudget,
    state: Mutex<WindowState>,
    next_id: AtomicU64,
}

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    issued: u32,
    waiters: VecDeque<Waiter>,
    /// Cleared by the dispatcher when it drains the queue. A handle that reports
    /// finished while still set belongs to a task that panicked or whose runtime shut down.
    dispatcher: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

impl WindowState {
    /// Moves to the window containing `now`, staying on the initial window grid.
    fn roll(&mut self, now: Instant, window: Duration) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < window {
            return;
        }
        let elapsed_nanos = elapsed.as_nanos();
        let skipped = elapsed_nanos - elapsed_nanos % window.as_nanos();
        self.window_start += Duration::from_nanos(skipped as u64);
        self.issued = 0;
        trace!(target: "discogs", "rate limit window rolled over");
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, WindowState> {
        // The critical sections never panic midway, so a poisoned lock still holds consistent state.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Spawns a dispatcher on the current runtime unless a live one exists.
fn ensure_dispatcher(shared: &Arc<Shared>, state: &mut WindowState) {
    if state
        .dispatcher
        .as_ref()
        .is_some_and(|task| !task.is_finished())
    {
        return;
    }
    if state.dispatcher.is_some() {
        warn!(target: "discogs", "rate limit dispatcher vanished, restarting it");
    }
    state.dispatcher = Some(tokio::spawn(dispatch(Arc::clone(shared))));
}

impl FixedWindowLimiter {
    pub fn new(budget: PermitBudget) -> Self {
        Self {
            shared: Arc::new(Shared {
                budget,
                state: Mutex::new(WindowState {
                    window_start: Instant::now(),
                    issued: 0,
                    waiters: VecDeque::new(),
                    dispatcher: None,
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Limiter with the Discogs defaults (1 request per second, 1000 waiters).
    pub fn discogs_default() -> Self {
        Self::new(PermitBudget::discogs_default())
    }

    pub fn budget(&self) -> PermitBudget {
        self.shared.budget
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.shared.lock().waiters.len()
    }

    #[cfg(test)]
    fn dispatcher_alive(&self) -> bool {
        self.shared
            .lock()
            .dispatcher
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

#[async_trait]
impl AdmissionControl for FixedWindowLimiter {
    async fn acquire(&self, cancel: &CancellationToken) -> Result<Permit> {
        if cancel.is_cancelled() {
            return Err(GatewayError::LimiterCancelled);
        }

        let budget = self.shared.budget;
        let (id, mut granted) = {
            let mut state = self.shared.lock();
            state.roll(Instant::now(), budget.window);

            if state.waiters.is_empty() && state.issued < budget.permits_per_window {
                state.issued += 1;
                return Ok(Permit::new(self.shared.next_id()));
            }

            if state.waiters.len() >= budget.max_queue_depth {
                warn!(
                    target: "discogs",
                    queued = state.waiters.len(),
                    "rate limiter is overloaded, rejecting request"
                );
                return Err(GatewayError::LimiterRejected);
            }

            let id = self.shared.next_id();
            let (grant, granted) = oneshot::channel();
            state.waiters.push_back(Waiter { id, grant });
            debug!(
                target: "discogs",
                permit = id,
                queued = state.waiters.len(),
                "waiting for rate limit permit"
            );

            ensure_dispatcher(&self.shared, &mut state);
            (id, granted)
        };

        let mut slot = QueueSlot {
            shared: &self.shared,
            id,
            armed: true,
        };

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    drop(slot);
                    debug!(target: "discogs", permit = id, "permit wait cancelled");
                    return Err(GatewayError::LimiterCancelled);
                }
                outcome = &mut granted => break outcome,
                // The dispatcher may have lived on a runtime that has since shut down.
                _ = sleep(budget.window) => {
                    let mut state = self.shared.lock();
                    if state.waiters.iter().any(|waiter| waiter.id == id) {
                        ensure_dispatcher(&self.shared, &mut state);
                    }
                }
            }
        };

        slot.armed = false;
        match outcome {
            Ok(()) => Ok(Permit::new(id)),
            Err(_) => Err(GatewayError::LimiterRejected),
        }
    }
}

/// Removes an abandoned waiter from the queue so it does not hold a slot.
struct QueueSlot<'a> {
    shared: &'a Shared,
    id: u64,
    armed: bool,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            let id = self.id;
            self.shared.lock().waiters.retain(|waiter| waiter.id != id);
        }
    }
}

/// Hands out permits to queued callers at each window boundary; exits once the queue is empty.
async fn dispatch(shared: Arc<Shared>) {
    let budget = shared.budget;
    loop {
        let next_window = {
            let mut state = shared.lock();
            state.roll(Instant::now(), budget.window);

            while state.issued < budget.permits_per_window {
                let Some(waiter) = state.waiters.pop_front() else {
                    break;
                };
                // A closed channel means the caller left; its grant goes to the next in line.
                if waiter.grant.send(()).is_ok() {
                    state.issued += 1;
                    trace!(target: "discogs", permit = waiter.id, "queued permit granted");
                }
            }

            if state.waiters.is_empty() {
                state.dispatcher = None;
                return;
            }
            state.window_start.checked_add(budget.window)
        };
        match next_window {
            Some(at) => sleep_until(at).await,
            // Past the end of the clock; `sleep` saturates instead of overflowing.
            None => sleep(budget.window).await,
        }
    }
}

/// Admission control that never waits. For hosts that need no throttling.
#[derive(Debug, Default)]
pub struct UnlimitedAdmission {
    next_id: AtomicU64,
}

impl UnlimitedAdmission {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AdmissionControl for UnlimitedAdmission {
    async fn acquire(&self, cancel: &CancellationToken) -> Result<Permit> {
        if cancel.is_cancelled() {
            return Err(GatewayError::LimiterCancelled);
        }
        Ok(Permit::new(self.next_id.fetch_add(1, Ordering::Relaxed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn limiter(window_ms: u64, permits: u32, depth: usize) -> FixedWindowLimiter {
        FixedWindowLimiter::new(
            PermitBudget::new(Duration::from_millis(window_ms), permits, depth).unwrap(),
        )
    }

    #[test]
    fn test_budget_validation() {
        assert_eq!(
            PermitBudget::new(Duration::from_secs(1), 0, 10),
            Err(BudgetError::NoPermits)
        );
        assert_eq!(
            PermitBudget::new(Duration::ZERO, 1, 10),
            Err(BudgetError::EmptyWindow)
        );
        assert!(PermitBudget::new(Duration::from_secs(1), 1, 0).is_ok());
        assert_eq!(
            FixedWindowLimiter::discogs_default().budget(),
            PermitBudget::default()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_grants_never_exceed_budget() {
        let limiter = limiter(1000, 3, 0);
        let token = CancellationToken::new();

        let mut granted = Vec::new();
        let mut rejected = 0;
        for _ in 0..10 {
            match limiter.acquire(&token).await {
                Ok(permit) => granted.push(permit),
                Err(GatewayError::LimiterRejected) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(granted.len(), 3);
        assert_eq!(rejected, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_depth_rejects_without_waiting() {
        let limiter = limiter(1000, 1, 0);
        let token = CancellationToken::new();
        let start = Instant::now();

        let _first = limiter.acquire(&token).await.unwrap();
        let second = limiter.acquire(&token).await;

        assert!(matches!(second, Err(GatewayError::LimiterRejected)));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_callers_granted_in_fifo_order_one_window_apart() {
        let limiter = limiter(1000, 1, 4);
        let start = Instant::now();
        let grants: Arc<StdMutex<Vec<(usize, Duration)>>> = Arc::new(StdMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for index in 0..5 {
            let limiter = limiter.clone();
            let grants = Arc::clone(&grants);
            handles.push(tokio::spawn(async move {
                let token = CancellationToken::new();
                let _permit = limiter.acquire(&token).await.unwrap();
                grants.lock().unwrap().push((index, start.elapsed()));
            }));
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let grants = grants.lock().unwrap().clone();
        let order: Vec<usize> = grants.iter().map(|(index, _)| *index).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(grants[0].1, Duration::ZERO);
        for pair in grants.windows(2) {
            assert!(
                pair[1].1 - pair[0].1 >= Duration::from_secs(1),
                "grants too close: {:?}",
                grants
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_window_admits_up_to_budget_from_queue() {
        let limiter = limiter(1000, 3, 5);
        let start = Instant::now();
        let grants: Arc<StdMutex<Vec<(usize, Duration)>>> = Arc::new(StdMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for index in 0..8 {
            let limiter = limiter.clone();
            let grants = Arc::clone(&grants);
            handles.push(tokio::spawn(async move {
                let token = CancellationToken::new();
                let _permit = limiter.acquire(&token).await.unwrap();
                grants.lock().unwrap().push((index, start.elapsed()));
            }));
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let grants = grants.lock().unwrap().clone();
        let order: Vec<usize> = grants.iter().map(|(index, _)| *index).collect();
        assert_eq!(order, (0..8).collect::<Vec<_>>());

        let seconds: Vec<u64> = grants.iter().map(|(_, at)| at.as_secs()).collect();
        assert_eq!(seconds, vec![0, 0, 0, 1, 1, 1, 2, 2]);
        assert_eq!(grants[3].1, Duration::from_secs(1));
        assert_eq!(grants[6].1, Duration::from_secs(2));
    }

    #[test]
    fn test_limiter_outlives_runtime_that_started_dispatcher() {
        fn runtime() -> tokio::runtime::Runtime {
            tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap()
        }

        let limiter = limiter(200, 1, 4);

        let first = runtime();
        first.block_on(async {
            let _held = limiter.acquire(&CancellationToken::new()).await.unwrap();
            let _waiting = {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire(&CancellationToken::new()).await })
            };
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            assert_eq!(limiter.queued(), 1);
            assert!(limiter.dispatcher_alive());
        });
        drop(first);

        // Shutting the runtime down drops the queued caller and the dispatcher.
        assert_eq!(limiter.queued(), 0);
        assert!(!limiter.dispatcher_alive());

        let second = runtime();
        second.block_on(async {
            let token = CancellationToken::new();
            for attempt in 0..2 {
                let outcome =
                    tokio::time::timeout(Duration::from_secs(2), limiter.acquire(&token)).await;
                assert!(matches!(outcome, Ok(Ok(_))), "acquire {attempt} hung: {outcome:?}");
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_past_end_of_clock_keeps_dispatcher_alive() {
        let limiter = FixedWindowLimiter::new(PermitBudget::new(Duration::MAX, 1, 1).unwrap());
        let _first = limiter.acquire(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let waiting = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(limiter.queued(), 1);
        assert!(limiter.dispatcher_alive());

        cancel.cancel();
        let outcome = waiting.await.unwrap();
        assert!(matches!(outcome, Err(GatewayError::LimiterCancelled)));
        assert!(limiter.dispatcher_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_frees_its_slot() {
        let limiter = limiter(1000, 1, 1);
        let start = Instant::now();
        let _first = limiter.acquire(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let waiting = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(limiter.queued(), 1);

        cancel.cancel();
        let outcome = waiting.await.unwrap();
        assert!(matches!(outcome, Err(GatewayError::LimiterCancelled)));
        assert_eq!(limiter.queued(), 0);

        let later = limiter.acquire(&CancellationToken::new()).await;
        assert!(later.is_ok());
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_acquire_future_frees_its_slot() {
        let limiter = limiter(1000, 1, 1);
        let token = CancellationToken::new();
        let _first = limiter.acquire(&token).await.unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), limiter.acquire(&token)).await;
        assert!(abandoned.is_err());
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_token_never_queues() {
        let limiter = limiter(1000, 1, 5);
        let token = CancellationToken::new();
        let _first = limiter.acquire(&token).await.unwrap();

        token.cancel();
        let outcome = limiter.acquire(&token).await;
        assert!(matches!(outcome, Err(GatewayError::LimiterCancelled)));
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_releasing_permit_does_not_refund_budget() {
        let limiter = limiter(1000, 1, 0);
        let token = CancellationToken::new();

        drop(limiter.acquire(&token).await.unwrap());
        assert!(matches!(
            limiter.acquire(&token).await,
            Err(GatewayError::LimiterRejected)
        ));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.acquire(&token).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_grid_survives_idle_periods() {
        let limiter = limiter(1000, 2, 0);
        let token = CancellationToken::new();

        tokio::time::advance(Duration::from_millis(3500)).await;
        assert!(limiter.acquire(&token).await.is_ok());
        assert!(limiter.acquire(&token).await.is_ok());
        assert!(limiter.acquire(&token).await.is_err());

        // Next window opens at 4s on the initial grid, not 4.5s.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.acquire(&token).await.is_ok());
    }

    #[tokio::test]
    async fn test_unlimited_admission_never_waits() {
        let admission = UnlimitedAdmission::new();
        let token = CancellationToken::new();
        for _ in 0..100 {
            admission.acquire(&token).await.unwrap();
        }

        token.cancel();
        assert!(matches!(
            admission.acquire(&token).await,
            Err(GatewayError::LimiterCancelled)
        ));
    }
}
