//! Fault Interceptor — the process-wide fault intake pipeline.
//!
//! Every fault admitted here flows through the same sequence:
//!
//! ```text
//! STEP 1: Fingerprint (kind + leading trace lines)
//! STEP 2: Duplicate suppression (drop silently inside the window)
//! STEP 3: Classification (ordered rule table, first match wins)
//! STEP 4: Healing (registry bookkeeping for recognized categories)
//! STEP 5: Record + publish (append-ordered log, broadcast channel)
//! STEP 6: Deferred presentation (unhealed faults, debug builds only)
//! ```
//!
//! The interceptor is an explicit context object: construct one with
//! [`FaultInterceptor::new`] and inject it into scopes, or install a
//! process-wide instance with [`FaultInterceptor::initialize`], which also
//! registers the panic-hook adapter that routes uncaught panics into
//! [`FaultInterceptor::admit`].

pub mod classify;

use crate::config::HealConfig;
use crate::registry::HealRegistry;
use crate::types::{Fault, InterceptedFault};
use arc_swap::ArcSwapOption;
use chrono::Utc;
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Once, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The installed process-wide interceptor, swapped atomically on re-init.
static CURRENT: ArcSwapOption<FaultInterceptor> = ArcSwapOption::const_empty();

/// One-time installation of the panic-hook adapter.
static HOOK_INSTALLED: Once = Once::new();

thread_local! {
    /// Non-zero while execution is inside a guard's containment section —
    /// the panic hook stays out of the way and lets the guard report with
    /// its richer context.
    static HOOK_SUPPRESS_DEPTH: Cell<u32> = Cell::new(0);
}

/// RAII token marking the current thread as inside a guard boundary.
pub(crate) struct HookSuppression(());

/// Enter a guard boundary; the panic hook ignores panics until the returned
/// token drops. Nests.
pub(crate) fn suppress_hook() -> HookSuppression {
    HOOK_SUPPRESS_DEPTH.with(|depth| depth.set(depth.get() + 1));
    HookSuppression(())
}

impl Drop for HookSuppression {
    fn drop(&mut self) {
        HOOK_SUPPRESS_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn hook_suppressed() -> bool {
    HOOK_SUPPRESS_DEPTH.with(Cell::get) > 0
}

/// Presenter callback for unhealed faults (the framework's own error
/// presentation surface).
type Presenter = Arc<dyn Fn(InterceptedFault) + Send + Sync>;

/// Mutable interceptor state behind one lock, so log order and publication
/// order always match admission order.
struct InterceptorState {
    log: VecDeque<InterceptedFault>,
    /// Active duplicate fingerprints → scheduled expiry (None when no
    /// runtime was reachable; such keys persist until `clear`)
    suppressed: HashMap<String, Option<JoinHandle<()>>>,
    sender: Option<broadcast::Sender<InterceptedFault>>,
    admitted: u64,
    healed: u64,
    disposed: bool,
}

/// Read-only intake statistics.
#[derive(Debug, Clone)]
pub struct InterceptorStats {
    pub intercepted: u64,
    pub healed: u64,
    pub heal_rate: f64,
    pub active_suppressions: usize,
    pub subscribers: usize,
}

impl std::fmt::Display for InterceptorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Interceptor: {} faults ({} healed, {:.0}% heal rate), {} active suppressions, {} subscribers",
            self.intercepted,
            self.healed,
            self.heal_rate * 100.0,
            self.active_suppressions,
            self.subscribers
        )
    }
}

/// The fault intake pipeline.
pub struct FaultInterceptor {
    config: HealConfig,
    registry: Arc<HealRegistry>,
    state: Arc<Mutex<InterceptorState>>,
    presenter: RwLock<Presenter>,
}

impl FaultInterceptor {
    /// Create a fresh, isolated interceptor (not installed process-wide).
    pub fn new(config: HealConfig) -> Self {
        let (sender, _) = broadcast::channel(config.effective_channel_capacity());
        Self {
            config,
            registry: Arc::new(HealRegistry::new()),
            state: Arc::new(Mutex::new(InterceptorState {
                log: VecDeque::new(),
                suppressed: HashMap::new(),
                sender: Some(sender),
                admitted: 0,
                healed: 0,
                disposed: false,
            })),
            presenter: RwLock::new(Arc::new(|record: InterceptedFault| {
                error!(fault = %record, origin = record.origin.as_deref().unwrap_or("unknown"), "Unhealed fault");
            })),
        }
    }

    /// Build a fresh instance and install it as the process-wide sink for
    /// uncaught faults.
    ///
    /// Re-initialization fully replaces the previous instance — no history
    /// carries over. The panic-hook adapter is installed once per process
    /// and always routes to whichever instance is currently installed.
    pub fn initialize(config: HealConfig) -> Arc<Self> {
        let interceptor = Arc::new(Self::new(config));
        install_panic_hook();
        CURRENT.store(Some(Arc::clone(&interceptor)));
        info!("Fault interceptor installed as process-wide sink");
        interceptor
    }

    /// The installed process-wide instance, if any.
    pub fn current() -> Option<Arc<Self>> {
        CURRENT.load_full()
    }

    /// The healing policy this interceptor runs with.
    pub const fn config(&self) -> &HealConfig {
        &self.config
    }

    /// Shared handle to the heal registry.
    pub fn registry(&self) -> Arc<HealRegistry> {
        Arc::clone(&self.registry)
    }

    /// Admit a fault into the pipeline.
    ///
    /// Returns the admitted record, or `None` when the fault was dropped
    /// (duplicate inside its suppression window, or interceptor disposed).
    pub fn admit(&self, fault: Fault) -> Option<InterceptedFault> {
        let fingerprint = self.fingerprint(&fault);
        let mut state = lock(&self.state);

        if state.disposed {
            warn!(message = %fault.message, "Fault discarded — interceptor already disposed");
            return None;
        }

        // STEP 2: duplicate suppression
        if state.suppressed.contains_key(&fingerprint) {
            debug!(fingerprint = %fingerprint, "Duplicate fault suppressed");
            return None;
        }
        let expiry = self.schedule_expiry(fingerprint.clone());
        if expiry.is_none() {
            debug!(
                fingerprint = %fingerprint,
                "No async runtime — fingerprint stays suppressed until clear()"
            );
        }
        state.suppressed.insert(fingerprint.clone(), expiry);

        // STEP 3-4: classification and healing
        let category = classify::classify(&fault.message);
        let healed = category.is_some();
        if let Some(cat) = category {
            self.registry.record_healing(cat);
        }

        // STEP 5: record and publish, in admission order
        let record = InterceptedFault {
            kind: fault.kind,
            message: fault.message,
            trace: fault.trace,
            origin: fault.origin,
            timestamp: Utc::now(),
            category,
            healed,
        };
        state.log.push_back(record.clone());
        if let Some(cap) = self.config.log_cap {
            while state.log.len() > cap {
                state.log.pop_front();
            }
        }
        state.admitted += 1;
        if healed {
            state.healed += 1;
        }
        if let Some(sender) = &state.sender {
            // A send with no receivers is not an error.
            let _ = sender.send(record.clone());
        }
        drop(state);

        debug!(
            fingerprint = %fingerprint,
            healed = healed,
            category = category.map(|c| c.as_str()).unwrap_or("none"),
            "Fault admitted"
        );

        // STEP 6: deferred presentation, never inside the admission path
        if !healed && self.config.forward_unhealed() {
            self.defer_presentation(record.clone());
        }

        Some(record)
    }

    /// Replace the presenter for unhealed faults.
    ///
    /// The default presenter emits a `tracing::error!` event.
    pub fn set_presenter<F>(&self, presenter: F)
    where
        F: Fn(InterceptedFault) + Send + Sync + 'static,
    {
        *write(&self.presenter) = Arc::new(presenter);
    }

    /// Subscribe to fault publications.
    ///
    /// Late subscribers never receive past faults. Returns `None` once the
    /// interceptor is disposed.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<InterceptedFault>> {
        lock(&self.state)
            .sender
            .as_ref()
            .map(broadcast::Sender::subscribe)
    }

    /// Total faults admitted (duplicates excluded).
    pub fn total_intercepted(&self) -> u64 {
        lock(&self.state).admitted
    }

    /// Total admitted faults that were healed.
    pub fn total_healed(&self) -> u64 {
        lock(&self.state).healed
    }

    /// Healed fraction of admitted faults; 0.0 when nothing was admitted.
    pub fn heal_rate(&self) -> f64 {
        let state = lock(&self.state);
        if state.admitted == 0 {
            return 0.0;
        }
        state.healed as f64 / state.admitted as f64
    }

    /// Owned snapshot of the fault log, oldest first.
    pub fn log(&self) -> Vec<InterceptedFault> {
        lock(&self.state).log.iter().cloned().collect()
    }

    /// Read-only intake statistics.
    pub fn stats(&self) -> InterceptorStats {
        let state = lock(&self.state);
        let heal_rate = if state.admitted == 0 {
            0.0
        } else {
            state.healed as f64 / state.admitted as f64
        };
        InterceptorStats {
            intercepted: state.admitted,
            healed: state.healed,
            heal_rate,
            active_suppressions: state.suppressed.len(),
            subscribers: state.sender.as_ref().map_or(0, broadcast::Sender::receiver_count),
        }
    }

    /// Empty the log and counters, drop every active fingerprint, and cancel
    /// all pending expiries.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        for (_, expiry) in state.suppressed.drain() {
            if let Some(handle) = expiry {
                handle.abort();
            }
        }
        state.log.clear();
        state.admitted = 0;
        state.healed = 0;
        debug!("Interceptor cleared");
    }

    /// `clear()` plus channel closure. No publish is possible afterwards;
    /// admission after dispose is discarded with a warning. Call last in the
    /// teardown sequence.
    pub fn dispose(&self) {
        self.clear();
        {
            let mut state = lock(&self.state);
            state.sender = None;
            state.disposed = true;
        }
        let current = CURRENT.load();
        if let Some(current) = current.as_ref() {
            if std::ptr::eq(Arc::as_ptr(current), self) {
                CURRENT.store(None);
            }
        }
        info!("Interceptor disposed");
    }

    /// Fingerprint: error kind + leading trace lines.
    fn fingerprint(&self, fault: &Fault) -> String {
        let head = fault
            .trace
            .lines()
            .take(self.config.fingerprint_trace_lines)
            .collect::<Vec<_>>()
            .join("|");
        format!("{}|{}", fault.kind, head)
    }

    /// Schedule removal of a fingerprint after the suppression window.
    ///
    /// Returns `None` when no runtime is reachable (the caller records the
    /// fingerprint as unexpiring).
    fn schedule_expiry(&self, fingerprint: String) -> Option<JoinHandle<()>> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let state = Arc::downgrade(&self.state);
        let window = self.config.suppression_window();
        Some(handle.spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(state) = state.upgrade() {
                lock(&state).suppressed.remove(&fingerprint);
            }
        }))
    }

    /// Hand an unhealed record to the presenter on the next scheduling tick.
    fn defer_presentation(&self, record: InterceptedFault) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime — skipping deferred presentation");
            return;
        };
        let presenter = Arc::clone(&read(&self.presenter));
        handle.spawn(async move {
            tokio::task::yield_now().await;
            presenter(record);
        });
    }
}

impl std::fmt::Debug for FaultInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("FaultInterceptor")
            .field("intercepted", &stats.intercepted)
            .field("healed", &stats.healed)
            .field("active_suppressions", &stats.active_suppressions)
            .finish_non_exhaustive()
    }
}

/// Install the panic-hook adapter routing uncaught panics into the currently
/// installed interceptor. Panics raised inside a guard boundary are left to
/// the guard, which reports them with call-site context.
fn install_panic_hook() {
    HOOK_INSTALLED.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if hook_suppressed() {
                return;
            }
            let Some(interceptor) = FaultInterceptor::current() else {
                previous(info);
                return;
            };
            let message = crate::types::panic_message(info.payload());
            let mut trace = String::new();
            if let Some(location) = info.location() {
                trace.push_str(&format!(
                    "{}:{}:{}\n",
                    location.file(),
                    location.line(),
                    location.column()
                ));
            }
            trace.push_str(&std::backtrace::Backtrace::force_capture().to_string());
            interceptor.admit(Fault::new("panic", message, trace).with_origin("panic-hook"));
        }));
    });
}

/// Lock a mutex, recovering the data from a poisoned lock.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn read<T>(rwlock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write<T>(rwlock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}
