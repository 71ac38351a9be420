//! Protection Scope — per-component guarded execution and fallback substitution.
//!
//! A host component owns exactly one scope and delegates risky work to it:
//!
//! - `guard` / `guarded_render`: synchronous execution with containment
//! - `guarded_async` / `guarded_retryable`: asynchronous execution with
//!   mounted-flag checks after every suspension point
//! - `guarded_mutate`: hard gate for state mutation after teardown
//! - `guarded_timer` / `guarded_interval` / `guarded_subscribe`: keyed,
//!   lifetime-bound deferred work
//!
//! Guards never let the underlying fault propagate to the caller — they
//! always resolve to a value (cache, fallback, or placeholder). Every
//! contained fault is forwarded to the scope's [`FaultInterceptor`].

mod resources;

use crate::interceptor::{suppress_hook, FaultInterceptor};
use crate::types::Fault;
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe, Location};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fallback surface for guarded rendering: what to show when a view builder
/// fails and the caller supplied no fallback of its own.
pub trait RenderFallback: Sized {
    /// A generic "protected" placeholder standing in for the failed view.
    fn protected_placeholder() -> Self;
}

impl RenderFallback for String {
    fn protected_placeholder() -> Self {
        "[protected view]".to_string()
    }
}

/// Retry policy for [`ProtectionScope::guarded_retryable_with`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retry attempts after the initial call
    pub max_retries: u32,
    /// Base inter-attempt delay; attempt `n` waits `base_delay * n`
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Policy from the healing configuration.
    pub const fn from_config(config: &crate::config::HealConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_delay(),
        }
    }
}

/// Diagnostic counters for one scope.
#[derive(Debug, Clone)]
pub struct ScopeStats {
    pub component: String,
    pub cached_entries: usize,
    pub reported_sites: usize,
    pub active_timers: usize,
    pub active_subscriptions: usize,
    pub mounted: bool,
}

impl std::fmt::Display for ScopeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Scope '{}': {} cached, {} reported, {} timers, {} subscriptions, {}",
            self.component,
            self.cached_entries,
            self.reported_sites,
            self.active_timers,
            self.active_subscriptions,
            if self.mounted { "mounted" } else { "unmounted" }
        )
    }
}

/// A keyed handle to scope-owned deferred work.
pub(crate) struct TaskEntry {
    pub(crate) id: u64,
    pub(crate) handle: JoinHandle<()>,
}

/// Per-component adapter owning guarded execution, the result cache, and
/// lifetime-bound timers/subscriptions.
///
/// Construct at component initialization, call [`teardown`](Self::teardown)
/// exactly once at component disposal. Dropping a still-mounted scope tears
/// it down as a safety net.
pub struct ProtectionScope {
    component: String,
    interceptor: Arc<FaultInterceptor>,
    mounted: Arc<AtomicBool>,
    cancel: CancellationToken,
    cache: Mutex<HashMap<String, Box<dyn Any + Send>>>,
    reported: Mutex<HashSet<String>>,
    pub(crate) timers: Arc<Mutex<HashMap<String, TaskEntry>>>,
    pub(crate) subscriptions: Arc<Mutex<HashMap<String, TaskEntry>>>,
    pub(crate) next_task_id: AtomicU64,
}

impl ProtectionScope {
    /// Create a scope for one component instance.
    pub fn new(interceptor: Arc<FaultInterceptor>, component: impl Into<String>) -> Self {
        let component = component.into();
        debug!(component = %component, "Protection scope created");
        Self {
            component,
            interceptor,
            mounted: Arc::new(AtomicBool::new(true)),
            cancel: CancellationToken::new(),
            cache: Mutex::new(HashMap::new()),
            reported: Mutex::new(HashSet::new()),
            timers: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_task_id: AtomicU64::new(0),
        }
    }

    /// Whether the owning component is still mounted.
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// The component label this scope was created for.
    pub fn component(&self) -> &str {
        &self.component
    }

    /// The interceptor faults are forwarded to.
    pub fn interceptor(&self) -> &Arc<FaultInterceptor> {
        &self.interceptor
    }

    // ========================================================================
    // Synchronous Guards
    // ========================================================================

    /// Run `op` with containment.
    ///
    /// Success stores the result under `cache_key` (when given) and returns
    /// it. Failure forwards the fault at most once per call site, then
    /// resolves to the cached value under `cache_key` if one exists,
    /// otherwise to `fallback`.
    #[track_caller]
    pub fn guard<T, F>(&self, op: F, fallback: Option<T>, cache_key: Option<&str>) -> Option<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> anyhow::Result<T>,
    {
        let site = Location::caller();
        let outcome = {
            let _shield = suppress_hook();
            catch_unwind(AssertUnwindSafe(op))
        };
        match outcome {
            Ok(Ok(value)) => {
                if let Some(key) = cache_key {
                    self.cache_store(key, value.clone());
                }
                Some(value)
            }
            Ok(Err(err)) => {
                self.report_once(site_key(site), Fault::from_anyhow(&err));
                self.recover(cache_key, fallback)
            }
            Err(payload) => {
                let fault =
                    Fault::from_panic_payload(payload.as_ref(), guard_trace(site, &self.component));
                self.report_once(site_key(site), fault);
                self.recover(cache_key, fallback)
            }
        }
    }

    /// Apply a state mutation only while the scope is mounted.
    ///
    /// Returns whether the mutation ran. This is a hard gate, not
    /// best-effort: after [`teardown`](Self::teardown) the mutation is never
    /// invoked.
    pub fn guarded_mutate<F: FnOnce()>(&self, mutation: F) -> bool {
        if !self.is_mounted() {
            debug!(component = %self.component, "Mutation skipped — scope unmounted");
            return false;
        }
        mutation();
        true
    }

    /// Invoke a view builder with containment.
    ///
    /// Failure reports once per failing fault kind per scope and resolves to
    /// `fallback`, or to [`RenderFallback::protected_placeholder`] when none
    /// was supplied. Never propagates.
    #[track_caller]
    pub fn guarded_render<T, F>(&self, builder: F, fallback: Option<T>) -> T
    where
        T: RenderFallback,
        F: FnOnce() -> anyhow::Result<T>,
    {
        let site = Location::caller();
        let outcome = {
            let _shield = suppress_hook();
            catch_unwind(AssertUnwindSafe(builder))
        };
        let fault = match outcome {
            Ok(Ok(view)) => return view,
            Ok(Err(err)) => Fault::from_anyhow(&err),
            Err(payload) => {
                Fault::from_panic_payload(payload.as_ref(), guard_trace(site, &self.component))
            }
        };
        self.report_once(format!("render:{}", fault.kind), fault);
        fallback.unwrap_or_else(T::protected_placeholder)
    }

    // ========================================================================
    // Asynchronous Guards
    // ========================================================================

    /// Await `op` with containment.
    ///
    /// If the scope unmounts while awaiting, the outcome is discarded and
    /// `fallback` returned. Failures are forwarded and resolve to `fallback`.
    pub async fn guarded_async<T, Fut>(&self, op: Fut, fallback: Option<T>) -> Option<T>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.guarded_async_with(op, fallback, |_| {}).await
    }

    /// [`guarded_async`](Self::guarded_async) with an error callback invoked
    /// on failure (after the fault is forwarded).
    pub async fn guarded_async_with<T, Fut, E>(
        &self,
        op: Fut,
        fallback: Option<T>,
        on_error: E,
    ) -> Option<T>
    where
        Fut: Future<Output = anyhow::Result<T>>,
        E: FnOnce(&anyhow::Error),
    {
        if !self.is_mounted() {
            return fallback;
        }
        let outcome = AssertUnwindSafe(Shielded::new(op)).catch_unwind().await;
        if !self.is_mounted() {
            debug!(component = %self.component, "Async outcome discarded — scope unmounted during await");
            return fallback;
        }
        let err = match outcome {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(err)) => {
                self.interceptor
                    .admit(Fault::from_anyhow(&err).with_origin(&self.component));
                err
            }
            Err(payload) => {
                let fault = Fault::from_panic_payload(
                    payload.as_ref(),
                    format!("async operation in component {}", self.component),
                );
                let err = anyhow::anyhow!("{}", fault.message);
                self.interceptor.admit(fault.with_origin(&self.component));
                err
            }
        };
        on_error(&err);
        fallback
    }

    /// Attempt `op` with linear-backoff retries, using the configured policy.
    ///
    /// Each failure is forwarded; attempt `n` waits `base_delay * n` before
    /// retrying. Unmounting between attempts aborts to `fallback`. Success
    /// caches under `cache_key`; exhaustion prefers a cached value over
    /// `fallback`. No overall deadline is enforced.
    pub async fn guarded_retryable<T, F, Fut>(
        &self,
        op: F,
        fallback: Option<T>,
        cache_key: Option<&str>,
    ) -> Option<T>
    where
        T: Clone + Send + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let policy = RetryPolicy::from_config(self.interceptor.config());
        self.guarded_retryable_with(op, fallback, policy, cache_key)
            .await
    }

    /// [`guarded_retryable`](Self::guarded_retryable) with an explicit policy.
    pub async fn guarded_retryable_with<T, F, Fut>(
        &self,
        mut op: F,
        fallback: Option<T>,
        policy: RetryPolicy,
        cache_key: Option<&str>,
    ) -> Option<T>
    where
        T: Clone + Send + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if !self.is_mounted() {
            return fallback;
        }
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = AssertUnwindSafe(Shielded::new(op())).catch_unwind().await;
            match outcome {
                Ok(Ok(value)) => {
                    if let Some(key) = cache_key {
                        self.cache_store(key, value.clone());
                    }
                    return Some(value);
                }
                Ok(Err(err)) => {
                    self.interceptor
                        .admit(Fault::from_anyhow(&err).with_origin(&self.component));
                }
                Err(payload) => {
                    let fault = Fault::from_panic_payload(
                        payload.as_ref(),
                        format!("retryable operation in component {}", self.component),
                    );
                    self.interceptor.admit(fault.with_origin(&self.component));
                }
            }
            if attempt > policy.max_retries {
                break;
            }
            tokio::time::sleep(policy.base_delay * attempt).await;
            if !self.is_mounted() {
                debug!(component = %self.component, attempt, "Retry abandoned — scope unmounted");
                return fallback;
            }
        }
        self.recover(cache_key, fallback)
    }

    // ========================================================================
    // Diagnostics & Lifecycle
    // ========================================================================

    /// Diagnostic counters for this scope.
    pub fn stats(&self) -> ScopeStats {
        ScopeStats {
            component: self.component.clone(),
            cached_entries: lock(&self.cache).len(),
            reported_sites: lock(&self.reported).len(),
            active_timers: lock(&self.timers).len(),
            active_subscriptions: lock(&self.subscriptions).len(),
            mounted: self.is_mounted(),
        }
    }

    /// Empty the result cache and the reported-site set.
    ///
    /// Timers and subscriptions are unaffected.
    pub fn clear_cache(&self) {
        lock(&self.cache).clear();
        lock(&self.reported).clear();
    }

    /// End the scope's lifetime: flip the mounted flag, then cancel every
    /// managed timer and subscription.
    ///
    /// The flag flips before any cleanup runs, so no callback observes a
    /// mounted scope mid-teardown. Safe to call on an already-torn-down
    /// scope (no-op).
    pub fn teardown(&self) {
        if !self.mounted.swap(false, Ordering::SeqCst) {
            debug!(component = %self.component, "Teardown on already-unmounted scope");
            return;
        }
        self.cancel.cancel();
        let timers: Vec<TaskEntry> = lock(&self.timers).drain().map(|(_, e)| e).collect();
        let subscriptions: Vec<TaskEntry> =
            lock(&self.subscriptions).drain().map(|(_, e)| e).collect();
        for entry in timers.into_iter().chain(subscriptions) {
            entry.handle.abort();
        }
        debug!(component = %self.component, "Scope torn down");
    }

    // ========================================================================
    // Internals (shared with resources.rs)
    // ========================================================================

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn mounted_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.mounted)
    }

    /// Store a successful result under a cache key.
    fn cache_store<T: Clone + Send + 'static>(&self, key: &str, value: T) {
        lock(&self.cache).insert(key.to_string(), Box::new(value));
    }

    /// Last successful result under a cache key, if the type matches.
    fn cached<T: Clone + Send + 'static>(&self, key: &str) -> Option<T> {
        lock(&self.cache)
            .get(key)
            .and_then(|slot| slot.downcast_ref::<T>())
            .cloned()
    }

    /// Cached value preferred over the fallback.
    fn recover<T: Clone + Send + 'static>(
        &self,
        cache_key: Option<&str>,
        fallback: Option<T>,
    ) -> Option<T> {
        cache_key.and_then(|key| self.cached(key)).or(fallback)
    }

    /// Forward a fault unless this identity already reported.
    fn report_once(&self, identity: String, fault: Fault) {
        if lock(&self.reported).insert(identity) {
            self.interceptor
                .admit(fault.with_origin(&self.component));
        } else {
            debug!(component = %self.component, "Recurring failure from known site — not re-forwarded");
        }
    }
}

impl Drop for ProtectionScope {
    fn drop(&mut self) {
        if self.is_mounted() {
            self.teardown();
        }
    }
}

impl std::fmt::Debug for ProtectionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stats())
    }
}

/// Future wrapper holding the panic-hook suppression across each poll, so a
/// panic escaping a guarded async operation is reported by the guard with
/// call-site context instead of by the process hook.
struct Shielded<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> Shielded<F> {
    fn new(inner: F) -> Self {
        Self {
            inner: Box::pin(inner),
        }
    }
}

impl<F: Future> Future for Shielded<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _shield = suppress_hook();
        self.get_mut().inner.as_mut().poll(cx)
    }
}

/// Call-site identity for once-per-site reporting.
fn site_key(site: &Location<'_>) -> String {
    format!("{}:{}:{}", site.file(), site.line(), site.column())
}

/// Trace descriptor for faults caught at a guard boundary.
fn guard_trace(site: &Location<'_>, component: &str) -> String {
    format!(
        "guarded at {}:{}:{}\ncomponent: {component}",
        site.file(),
        site.line(),
        site.column()
    )
}

/// Lock a mutex, recovering the data from a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
