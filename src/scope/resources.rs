//! Scope-owned deferred work: keyed timers and stream subscriptions.
//!
//! Every handle lives in its owning scope's map under a caller-supplied (or
//! auto-generated) key. Registering a new handle under an existing key aborts
//! the predecessor. Teardown aborts everything; each task also watches the
//! scope's cancellation token and mounted flag, so nothing fires after the
//! component is gone.

use super::{lock, ProtectionScope, TaskEntry};
use crate::interceptor::{suppress_hook, FaultInterceptor};
use crate::types::Fault;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

impl ProtectionScope {
    // ========================================================================
    // Timers
    // ========================================================================

    /// Schedule a one-shot callback after `delay`, registered under `key`
    /// (auto-generated when `None`). A prior handle under the same key is
    /// cancelled first.
    ///
    /// The callback fires only if the scope is still mounted at fire time.
    /// Returns the registration key, or `None` on scheduling failure (which
    /// is itself reported).
    pub fn guarded_timer<F>(&self, delay: Duration, callback: F, key: Option<&str>) -> Option<String>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(delay, callback, key, false)
    }

    /// Schedule a periodic callback every `period`, registered under `key`.
    ///
    /// The task self-cancels the moment the scope unmounts; otherwise it
    /// behaves like [`guarded_timer`](Self::guarded_timer).
    pub fn guarded_interval<F>(
        &self,
        period: Duration,
        callback: F,
        key: Option<&str>,
    ) -> Option<String>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(period, callback, key, true)
    }

    fn schedule<F>(
        &self,
        delay: Duration,
        mut callback: F,
        key: Option<&str>,
        periodic: bool,
    ) -> Option<String>
    where
        F: FnMut() + Send + 'static,
    {
        if !self.is_mounted() {
            debug!(component = %self.component(), "Timer not scheduled — scope unmounted");
            return None;
        }
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.interceptor().admit(
                Fault::new(
                    "scheduler",
                    "no async runtime available for deferred execution",
                    format!("component: {}", self.component()),
                )
                .with_origin(self.component()),
            );
            return None;
        };
        let key = key.map_or_else(|| format!("timer-{id}"), str::to_string);

        let mounted = self.mounted_flag();
        let cancel = self.cancel_token();
        let interceptor = Arc::clone(self.interceptor());
        let component = self.component().to_string();
        let timers = Arc::downgrade(&self.timers);
        let task_key = key.clone();

        let handle = runtime.spawn(async move {
            if periodic {
                let start = tokio::time::Instant::now() + delay;
                let mut ticker = tokio::time::interval_at(start, delay);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                    if !mounted.load(Ordering::SeqCst) {
                        break;
                    }
                    fire(&mut callback, &interceptor, &component);
                }
            } else {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
                if mounted.load(Ordering::SeqCst) {
                    fire(&mut callback, &interceptor, &component);
                }
            }
            deregister(&timers, &task_key, id);
        });

        self.register(&self.timers, key.clone(), TaskEntry { id, handle });
        Some(key)
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe to `source`, delivering items to `on_data` while the scope
    /// is mounted. Replaces any existing subscription under `key`.
    ///
    /// Stream errors are forwarded to the interceptor. Natural completion
    /// removes the bookkeeping entry. Returns the registration key, or
    /// `None` on scheduling failure.
    pub fn guarded_subscribe<S, T, D>(
        &self,
        source: S,
        on_data: D,
        key: Option<&str>,
    ) -> Option<String>
    where
        S: Stream<Item = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
        D: FnMut(T) + Send + 'static,
    {
        self.guarded_subscribe_with(source, on_data, |_| {}, || {}, key)
    }

    /// [`guarded_subscribe`](Self::guarded_subscribe) with error and
    /// completion callbacks.
    pub fn guarded_subscribe_with<S, T, D, E, C>(
        &self,
        source: S,
        mut on_data: D,
        mut on_error: E,
        on_done: C,
        key: Option<&str>,
    ) -> Option<String>
    where
        S: Stream<Item = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
        D: FnMut(T) + Send + 'static,
        E: FnMut(&anyhow::Error) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        if !self.is_mounted() {
            debug!(component = %self.component(), "Subscription not started — scope unmounted");
            return None;
        }
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.interceptor().admit(
                Fault::new(
                    "scheduler",
                    "no async runtime available for subscription",
                    format!("component: {}", self.component()),
                )
                .with_origin(self.component()),
            );
            return None;
        };
        let key = key.map_or_else(|| format!("subscription-{id}"), str::to_string);

        let mounted = self.mounted_flag();
        let cancel = self.cancel_token();
        let interceptor = Arc::clone(self.interceptor());
        let component = self.component().to_string();
        let subscriptions = Arc::downgrade(&self.subscriptions);
        let task_key = key.clone();

        let handle = runtime.spawn(async move {
            let mut source = std::pin::pin!(source);
            let mut on_done = Some(on_done);
            loop {
                let item = tokio::select! {
                    () = cancel.cancelled() => return,
                    item = source.next() => item,
                };
                match item {
                    Some(Ok(value)) => {
                        if !mounted.load(Ordering::SeqCst) {
                            break;
                        }
                        let contained = {
                            let _shield = suppress_hook();
                            catch_unwind(AssertUnwindSafe(|| on_data(value)))
                        };
                        if let Err(payload) = contained {
                            interceptor.admit(
                                Fault::from_panic_payload(
                                    payload.as_ref(),
                                    format!("subscription callback in component {component}"),
                                )
                                .with_origin(&component),
                            );
                        }
                    }
                    Some(Err(err)) => {
                        interceptor.admit(Fault::from_anyhow(&err).with_origin(&component));
                        on_error(&err);
                    }
                    None => {
                        if let Some(done) = on_done.take() {
                            done();
                        }
                        break;
                    }
                }
            }
            deregister(&subscriptions, &task_key, id);
        });

        self.register(&self.subscriptions, key.clone(), TaskEntry { id, handle });
        Some(key)
    }

    /// Insert a handle under a key, aborting any predecessor.
    fn register(
        &self,
        map: &Arc<Mutex<HashMap<String, TaskEntry>>>,
        key: String,
        entry: TaskEntry,
    ) {
        let previous = lock(map).insert(key, entry);
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }
}

/// Run a timer callback with containment; panics become forwarded faults.
fn fire<F: FnMut()>(callback: &mut F, interceptor: &FaultInterceptor, component: &str) {
    let contained = {
        let _shield = suppress_hook();
        catch_unwind(AssertUnwindSafe(|| callback()))
    };
    if let Err(payload) = contained {
        interceptor.admit(
            Fault::from_panic_payload(
                payload.as_ref(),
                format!("timer callback in component {component}"),
            )
            .with_origin(component),
        );
    }
}

/// Drop a task's own bookkeeping entry, unless the key was re-registered.
fn deregister(
    map: &std::sync::Weak<Mutex<HashMap<String, TaskEntry>>>,
    key: &str,
    id: u64,
) {
    if let Some(map) = map.upgrade() {
        let mut map = lock(&map);
        if map.get(key).is_some_and(|entry| entry.id == id) {
            map.remove(key);
        }
    }
}
