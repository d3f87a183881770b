//! Memory backpressure for decoded buffers
//!
//! Every read step asks the allocator for a byte range `[min, max]` before it
//! decodes anything. The allocator grants the largest amount it can afford
//! within a fair share of the remaining budget, or parks the caller until
//! tickets are released.
//!
//! # Fair Share
//!
//! ```text
//! share = consumed >= total ? 0 : (total - consumed) / fairness_factor
//!
//! share >= max  -> grant max
//! share >= min  -> grant share
//! otherwise     -> wait
//! ```
//!
//! Dividing by the fairness factor leaves room for other concurrent requests
//! instead of letting one large request take the whole budget.
//!
//! # Example
//!
//! ```rust
//! use nexus_engine::allocator::{AllocatorConfig, MemoryAllocator};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let allocator = Arc::new(MemoryAllocator::new(AllocatorConfig {
//!     total_budget: 1024,
//!     fairness_factor: 2,
//!     ..Default::default()
//! }));
//!
//! let ticket = allocator.acquire(100, 1000, &CancellationToken::new()).await.unwrap();
//! assert_eq!(ticket.amount(), 512);
//! ticket.release();
//! # }
//! ```

use crate::config::MemoryConfig;
use crate::error::AllocatorError;
use crate::metrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Called with `(consumed, total)` whenever a caller has to wait
pub type PressureHook = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Largest single allocation that can be addressed
pub const MAX_ALLOCATION: usize = isize::MAX as usize;

/// Configuration for the memory allocator
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Total bytes that may be granted at the same time
    pub total_budget: usize,
    /// Remaining budget is divided by this factor (>= 1)
    pub fairness_factor: usize,
    /// Parked callers re-evaluate the budget at least this often
    pub wait_timeout: Duration,
    /// Overall deadline for one acquire call
    pub max_wait: Option<Duration>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            total_budget: 1024 * 1024 * 1024, // 1 GB
            fairness_factor: 8,
            wait_timeout: Duration::from_secs(60),
            max_wait: None,
        }
    }
}

impl From<&MemoryConfig> for AllocatorConfig {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            total_budget: config.total_buffer_memory,
            fairness_factor: config.fairness_factor,
            wait_timeout: Duration::from_millis(config.wait_timeout_ms),
            max_wait: (config.max_wait_ms > 0).then(|| Duration::from_millis(config.max_wait_ms)),
        }
    }
}

impl AllocatorConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.total_budget == 0 {
            return Err("total_budget must be > 0".to_string());
        }
        if self.fairness_factor == 0 {
            return Err("fairness_factor must be >= 1".to_string());
        }
        if self.wait_timeout.is_zero() {
            return Err("wait_timeout must be > 0".to_string());
        }
        if matches!(self.max_wait, Some(max_wait) if max_wait.is_zero()) {
            return Err("max_wait must be > 0 when set".to_string());
        }
        Ok(())
    }
}

/// Allocator state snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Bytes currently granted
    pub consumed: usize,
    /// Total budget
    pub total: usize,
    /// Callers currently parked
    pub waiters: usize,
    /// Grants since creation
    pub grants: u64,
    /// Times a caller had to park
    pub waits: u64,
}

struct State {
    consumed: usize,
    waiters: HashMap<u64, Arc<Notify>>,
    next_waiter: u64,
}

impl State {
    /// Wake every parked caller; each one re-evaluates availability itself
    fn wake_all(&self) {
        for notify in self.waiters.values() {
            notify.notify_one();
        }
    }
}

/// Budgeted ticket allocator
///
/// Create one per engine and share it through an `Arc`; any number of
/// independent instances can coexist.
pub struct MemoryAllocator {
    config: AllocatorConfig,
    state: Mutex<State>,
    grants: AtomicU64,
    waits: AtomicU64,
    pressure_hook: Option<PressureHook>,
}

impl MemoryAllocator {
    /// Create a new allocator
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                consumed: 0,
                waiters: HashMap::new(),
                next_waiter: 0,
            }),
            grants: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            pressure_hook: None,
        }
    }

    /// Install a callback invoked whenever a caller has to wait
    pub fn with_pressure_hook(mut self, hook: PressureHook) -> Self {
        self.pressure_hook = Some(hook);
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Acquire between `min` and `max` bytes
    ///
    /// Parks until a fair share of at least `min` bytes is available. Fails
    /// immediately if `min` can never be granted, and with
    /// `AllocationTimeout` once `max_wait` elapses.
    pub async fn acquire(
        self: &Arc<Self>,
        min: usize,
        max: usize,
        cancel: &CancellationToken,
    ) -> Result<AllocationTicket, AllocatorError> {
        if min > max {
            return Err(AllocatorError::InvalidRange { min, max });
        }

        let budget = self.config.total_budget.min(MAX_ALLOCATION);
        if min > budget {
            return Err(AllocatorError::RequestExceedsBudget {
                requested: min,
                budget,
            });
        }

        let started = Instant::now();
        let mut slot: Option<WaitSlot<'_>> = None;
        let mut parked = false;

        loop {
            if cancel.is_cancelled() {
                metrics::record_allocation("cancelled");
                return Err(AllocatorError::Cancelled);
            }

            let (granted, consumed, waiters) = {
                let mut state = self.state.lock();
                let share = if state.consumed >= self.config.total_budget {
                    0
                } else {
                    (self.config.total_budget - state.consumed) / self.config.fairness_factor.max(1)
                };

                let amount = if share >= max {
                    Some(max)
                } else if share >= min {
                    Some(share)
                } else {
                    None
                };

                match amount {
                    Some(amount) => {
                        state.consumed += amount;
                        if let Some(slot) = &slot {
                            state.waiters.remove(&slot.id);
                        }
                        state.wake_all();
                    }
                    None if slot.is_none() => {
                        let id = state.next_waiter;
                        state.next_waiter += 1;
                        let notify = Arc::new(Notify::new());
                        state.waiters.insert(id, Arc::clone(&notify));
                        slot = Some(WaitSlot {
                            allocator: self.as_ref(),
                            id,
                            notify,
                            armed: true,
                        });
                    }
                    None => {}
                }

                (amount, state.consumed, state.waiters.len())
            };

            metrics::update_allocator(consumed, waiters);

            if let Some(amount) = granted {
                // already removed from the waiter set under the lock
                if let Some(mut slot) = slot.take() {
                    slot.disarm();
                }

                self.grants.fetch_add(1, Ordering::Relaxed);
                metrics::record_allocation("granted");
                debug!(amount, consumed, "Granted buffer memory");

                return Ok(AllocationTicket {
                    allocator: Arc::clone(self),
                    amount,
                });
            }

            self.waits.fetch_add(1, Ordering::Relaxed);
            metrics::record_allocation("waited");
            if let Some(hook) = &self.pressure_hook {
                hook(consumed, self.config.total_budget);
            }

            let mut wait = self.config.wait_timeout;
            if let Some(max_wait) = self.config.max_wait {
                let remaining = max_wait.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    metrics::record_allocation("timeout");
                    return Err(AllocatorError::AllocationTimeout {
                        min,
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
                wait = wait.min(remaining);
            }

            if !parked {
                warn!(
                    min,
                    max,
                    consumed,
                    total = self.config.total_budget,
                    "Buffer memory exhausted, waiting"
                );
                parked = true;
            } else {
                debug!(min, consumed, "Still waiting for buffer memory");
            }

            let Some(notify) = slot.as_ref().map(|slot| Arc::clone(&slot.notify)) else {
                continue;
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    metrics::record_allocation("cancelled");
                    return Err(AllocatorError::Cancelled);
                }
                _ = notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn release_bytes(&self, amount: usize) {
        let (consumed, waiters) = {
            let mut state = self.state.lock();
            state.consumed = state.consumed.saturating_sub(amount);
            state.wake_all();
            (state.consumed, state.waiters.len())
        };

        metrics::update_allocator(consumed, waiters);
        debug!(amount, consumed, "Released buffer memory");
    }

    /// Current bytes granted
    pub fn consumed(&self) -> usize {
        self.state.lock().consumed
    }

    /// Snapshot of the allocator state
    pub fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        AllocatorStats {
            consumed: state.consumed,
            total: self.config.total_budget,
            waiters: state.waiters.len(),
            grants: self.grants.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for MemoryAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAllocator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Registration in the waiter set, removed on every exit path
struct WaitSlot<'a> {
    allocator: &'a MemoryAllocator,
    id: u64,
    notify: Arc<Notify>,
    armed: bool,
}

impl WaitSlot<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for WaitSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.allocator.state.lock().waiters.remove(&self.id);
        }
    }
}

/// Granted allocation
///
/// Move-only: the bytes return to the budget exactly once, when the ticket
/// is released or dropped.
pub struct AllocationTicket {
    allocator: Arc<MemoryAllocator>,
    amount: usize,
}

impl AllocationTicket {
    /// Granted bytes
    pub fn amount(&self) -> usize {
        self.amount
    }

    /// Return the bytes to the budget
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for AllocationTicket {
    fn drop(&mut self) {
        self.allocator.release_bytes(self.amount);
    }
}

impl fmt::Debug for AllocationTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationTicket")
            .field("amount", &self.amount)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn allocator(total_budget: usize, fairness_factor: usize) -> Arc<MemoryAllocator> {
        Arc::new(MemoryAllocator::new(AllocatorConfig {
            total_budget,
            fairness_factor,
            wait_timeout: Duration::from_millis(50),
            max_wait: None,
        }))
    }

    #[test]
    fn test_config_validation() {
        assert!(AllocatorConfig::default().validate().is_ok());

        let config = AllocatorConfig {
            fairness_factor: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_memory_config() {
        let memory = MemoryConfig {
            total_buffer_memory: 10,
            fairness_factor: 2,
            wait_timeout_ms: 5,
            max_wait_ms: 0,
        };
        let config = AllocatorConfig::from(&memory);
        assert_eq!(config.total_budget, 10);
        assert_eq!(config.max_wait, None);
    }

    #[tokio::test]
    async fn test_grants_max_when_share_allows() {
        let allocator = allocator(1000, 2);
        let ticket = allocator.acquire(10, 100, &CancellationToken::new()).await.unwrap();
        assert_eq!(ticket.amount(), 100);
        assert_eq!(allocator.consumed(), 100);
    }

    #[tokio::test]
    async fn test_grants_fair_share() {
        let allocator = allocator(1000, 8);
        let cancel = CancellationToken::new();

        let first = allocator.acquire(10, 1000, &cancel).await.unwrap();
        assert_eq!(first.amount(), 125);

        // (1000 - 125) / 8
        let second = allocator.acquire(10, 1000, &cancel).await.unwrap();
        assert_eq!(second.amount(), 109);
        assert_eq!(allocator.consumed(), 234);

        first.release();
        assert_eq!(allocator.consumed(), 109);
    }

    #[tokio::test]
    async fn test_request_exceeds_budget() {
        let allocator = allocator(1000, 1);
        let cancel = CancellationToken::new();

        let result = allocator.acquire(1001, 2000, &cancel).await;
        assert!(matches!(result, Err(AllocatorError::RequestExceedsBudget { .. })));

        let result = allocator.acquire(20, 10, &cancel).await;
        assert!(matches!(result, Err(AllocatorError::InvalidRange { .. })));
    }

    #[tokio::test]
    async fn test_waiter_resumes_after_release() {
        let allocator = allocator(100, 1);
        let cancel = CancellationToken::new();

        let held = allocator.acquire(100, 100, &cancel).await.unwrap();

        let waiter = {
            let allocator = Arc::clone(&allocator);
            let cancel = cancel.clone();
            tokio::spawn(async move { allocator.acquire(50, 50, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(allocator.stats().waiters, 1);
        assert!(!waiter.is_finished());

        held.release();
        let ticket = waiter.await.unwrap().unwrap();
        assert_eq!(ticket.amount(), 50);
        assert_eq!(allocator.stats().waiters, 0);
    }

    #[tokio::test]
    async fn test_cancellation_removes_waiter() {
        let allocator = allocator(100, 1);
        let _held = allocator.acquire(100, 100, &CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let allocator = Arc::clone(&allocator);
            let cancel = cancel.clone();
            tokio::spawn(async move { allocator.acquire(10, 10, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(AllocatorError::Cancelled)));
        assert_eq!(allocator.stats().waiters, 0);
        assert_eq!(allocator.consumed(), 100);
    }

    #[tokio::test]
    async fn test_max_wait_times_out() {
        let allocator = Arc::new(MemoryAllocator::new(AllocatorConfig {
            total_budget: 100,
            fairness_factor: 1,
            wait_timeout: Duration::from_millis(10),
            max_wait: Some(Duration::from_millis(40)),
        }));
        let cancel = CancellationToken::new();
        let _held = allocator.acquire(100, 100, &cancel).await.unwrap();

        let result = allocator.acquire(1, 1, &cancel).await;
        assert!(matches!(result, Err(AllocatorError::AllocationTimeout { min: 1, .. })));
        assert_eq!(allocator.stats().waiters, 0);
    }

    #[tokio::test]
    async fn test_pressure_hook_called_on_wait() {
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = Arc::clone(&calls);

        let allocator = Arc::new(
            MemoryAllocator::new(AllocatorConfig {
                total_budget: 100,
                fairness_factor: 1,
                wait_timeout: Duration::from_millis(10),
                max_wait: Some(Duration::from_millis(25)),
            })
            .with_pressure_hook(Arc::new(move |consumed, total| {
                assert_eq!((consumed, total), (100, 100));
                hook_calls.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let cancel = CancellationToken::new();
        let _held = allocator.acquire(100, 100, &cancel).await.unwrap();

        let _ = allocator.acquire(1, 1, &cancel).await;
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_consumed_never_exceeds_budget() {
        let allocator = allocator(1000, 4);
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        for task in 0..16usize {
            let allocator = Arc::clone(&allocator);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                for round in 0..20usize {
                    let min = 1 + (task * 7 + round) % 40;
                    let ticket = allocator.acquire(min, 400, &cancel).await.unwrap();
                    assert!(allocator.consumed() <= 1000);
                    tokio::task::yield_now().await;
                    ticket.release();
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let stats = allocator.stats();
        assert_eq!(stats.consumed, 0);
        assert_eq!(stats.grants, 16 * 20);
    }
}
