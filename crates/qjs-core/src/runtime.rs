//! QuickJS runtime: engine instance, owner thread, job queue and event loop

use parking_lot::Mutex;
use rquickjs_sys::*;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use tracing::{debug, trace, warn};

use crate::config::{RuntimeBuilder, RuntimeConfig};
use crate::context::QjsContext;
use crate::error::{QjsError, QjsResult, extract_exception};
use crate::job::{Job, JobQueue, JobSender};
use crate::module::{self, LoaderSlot, ModuleLoader};

/// Shared runtime state
///
/// Contexts hold an `Arc` of this, so the native runtime is freed only after
/// every context (and through them every value) has been released.
pub(crate) struct RuntimeInner {
    rt: *mut JSRuntime,
    owner: ThreadId,
    closed: Arc<AtomicBool>,
    interrupt: Arc<AtomicBool>,
    jobs: JobQueue,
    loader: Mutex<Option<Box<LoaderSlot>>>,
    config: RuntimeConfig,
}

// SAFETY: the raw runtime pointer is only dereferenced on `owner`; every
// entry point checks the current thread first. The remaining fields are
// thread-safe on their own.
unsafe impl Send for RuntimeInner {}
unsafe impl Sync for RuntimeInner {}

impl RuntimeInner {
    pub(crate) fn raw(&self) -> *mut JSRuntime {
        self.rt
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    pub(crate) fn check_thread(&self) -> QjsResult<()> {
        let current = thread::current().id();
        if current != self.owner {
            return Err(QjsError::ThreadAffinity {
                owner: self.owner,
                current,
            });
        }
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> QjsResult<()> {
        if self.is_closed() {
            return Err(QjsError::closed("QjsRuntime"));
        }
        Ok(())
    }

    pub(crate) fn job_sender(&self) -> JobSender {
        self.jobs.sender()
    }

    /// Hand a native release to the owner thread
    ///
    /// `payload` performs the release in its `Drop` impl, so it does the
    /// right thing whether the job runs or is discarded by `close()`.
    pub(crate) fn defer_release<T: Send + 'static>(&self, payload: T) {
        let job: Job = Box::new(move || {
            drop(payload);
            Ok(())
        });
        if let Err(job) = self.jobs.push_internal(job) {
            warn!("Runtime queue unavailable, leaking native handle");
            std::mem::forget(job);
        }
    }

    /// Drop releases queued after `close()`
    ///
    /// Native handles dropped on other threads keep arriving once the runtime
    /// is closed. Dropping their payloads here frees them on the owner thread.
    pub(crate) fn drain_releases(&self) -> usize {
        if !self.is_owner_thread() || !self.is_closed() {
            return 0;
        }
        let released = self.jobs.discard_pending();
        if released > 0 {
            trace!(released, "Late releases drained");
        }
        released
    }

    unsafe fn execute_pending_job(&self) -> QjsResult<bool> {
        let mut ctx: *mut JSContext = ptr::null_mut();
        // SAFETY: called on the owner thread of a live runtime
        let status = unsafe { JS_ExecutePendingJob(self.rt, &mut ctx) };
        if status > 0 {
            Ok(true)
        } else if status == 0 {
            Ok(false)
        } else if ctx.is_null() {
            Err(QjsError::internal("pending job failed without a context"))
        } else {
            // SAFETY: the engine reports the context the failing job ran in
            Err(unsafe { extract_exception(ctx) })
        }
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        if !self.is_owner_thread() {
            warn!("QjsRuntime released off its owner thread, leaking native runtime");
            return;
        }
        self.jobs.discard_pending();
        // SAFETY: owner thread, and no context refers to this runtime anymore
        unsafe { JS_FreeRuntime(self.rt) };
        debug!("QuickJS runtime freed");
    }
}

/// Counters reported by one `run_event_loop` call
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EventLoopStats {
    /// Host jobs drained from the queue
    pub jobs_run: usize,
    /// Host jobs that returned an error or panicked
    pub jobs_failed: usize,
    /// Engine microtasks executed (including ones that threw)
    pub microtasks_run: usize,
}

/// Thread-safe handle for interrupting a runtime from any thread
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    /// Abort the running script at its next interrupt checkpoint
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Allow execution to resume
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

unsafe extern "C" fn interrupt_handler(_rt: *mut JSRuntime, opaque: *mut c_void) -> i32 {
    // SAFETY: opaque is the runtime's interrupt flag, which outlives the native runtime
    let flag = unsafe { &*(opaque as *const AtomicBool) };
    flag.load(Ordering::Relaxed) as i32
}

/// A QuickJS engine instance confined to the thread that created it
///
/// `QjsRuntime` is `Send + Sync` so it can be shared with helper threads,
/// but only [`post`](Self::post), [`interrupt`](Self::interrupt) and
/// [`clear_interrupt`](Self::clear_interrupt) may be called off the owner
/// thread. Everything else fails with [`QjsError::ThreadAffinity`].
///
/// # Example
///
/// ```
/// use qjs_core::QjsRuntime;
///
/// let runtime = QjsRuntime::new().unwrap();
/// let context = runtime.create_context().unwrap();
///
/// let result = context.eval("1 + 2").unwrap();
/// assert_eq!(result.as_integer().unwrap(), 3);
/// ```
pub struct QjsRuntime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for QjsRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QjsRuntime")
            .field("owner", &self.inner.owner)
            .field("closed", &self.inner.is_closed())
            .field("queued_jobs", &self.inner.jobs.len())
            .finish()
    }
}

impl QjsRuntime {
    /// Create a runtime with the default configuration
    pub fn new() -> QjsResult<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a builder for custom limits
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Allocate a runtime on the calling thread, which becomes its owner
    pub fn with_config(config: RuntimeConfig) -> QjsResult<Self> {
        // SAFETY: JS_NewRuntime has no preconditions
        let rt = unsafe { JS_NewRuntime() };
        if rt.is_null() {
            return Err(QjsError::initialization("JS_NewRuntime returned null"));
        }

        let interrupt = Arc::new(AtomicBool::new(false));

        // SAFETY: rt is a fresh runtime; the interrupt flag is kept alive by
        // RuntimeInner until after JS_FreeRuntime
        unsafe {
            if let Some(limit) = config.memory_limit {
                JS_SetMemoryLimit(rt, limit as size_t);
            }
            if let Some(size) = config.max_stack_size {
                JS_SetMaxStackSize(rt, size as size_t);
            }
            JS_SetInterruptHandler(
                rt,
                Some(interrupt_handler),
                Arc::as_ptr(&interrupt) as *mut c_void,
            );
        }

        let closed = Arc::new(AtomicBool::new(false));
        debug!(
            memory_limit = ?config.memory_limit,
            max_stack_size = ?config.max_stack_size,
            std_lib = config.include_standard_library,
            "QuickJS runtime created"
        );

        let owner = thread::current().id();
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                rt,
                owner,
                jobs: JobQueue::new(closed.clone(), owner),
                closed,
                interrupt,
                loader: Mutex::new(None),
                config,
            }),
        })
    }

    pub(crate) fn inner(&self) -> &Arc<RuntimeInner> {
        &self.inner
    }

    /// Get the raw runtime pointer
    pub fn raw(&self) -> *mut JSRuntime {
        self.inner.rt
    }

    /// The configuration this runtime was built with
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Fail with [`QjsError::ThreadAffinity`] unless called on the owner thread
    pub fn check_thread(&self) -> QjsResult<()> {
        self.inner.check_thread()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Create a new execution context
    pub fn create_context(&self) -> QjsResult<QjsContext> {
        self.inner.check_thread()?;
        self.inner.ensure_open()?;
        QjsContext::new(self.inner.clone())
    }

    /// Enqueue a job for the owner thread. Callable from any thread.
    pub fn post<F>(&self, job: F) -> QjsResult<()>
    where
        F: FnOnce() -> QjsResult<()> + Send + 'static,
    {
        self.inner.jobs.sender().post(job)
    }

    /// Get a cloneable job producer for other threads
    pub fn job_sender(&self) -> JobSender {
        self.inner.job_sender()
    }

    /// Drain host jobs, then run engine microtasks until none remain
    ///
    /// Every job queued when this is called runs before the first
    /// microtask step, as do jobs those jobs post. Jobs posted by other
    /// threads during the drain, or while microtasks run, are picked up by
    /// the next call, so fully asynchronous programs poll this repeatedly.
    ///
    /// On a closed runtime this still frees handles released by other
    /// threads, then fails with [`QjsError::Closed`].
    pub fn run_event_loop(&self) -> QjsResult<EventLoopStats> {
        self.inner.check_thread()?;
        if self.inner.is_closed() {
            self.inner.drain_releases();
            return Err(QjsError::closed("QjsRuntime"));
        }

        let mut stats = EventLoopStats::default();

        self.inner.jobs.drain(|job| {
            stats.jobs_run += 1;
            match panic::catch_unwind(AssertUnwindSafe(job)) {
                Ok(Ok(())) => trace!("Host job completed"),
                Ok(Err(error)) => {
                    stats.jobs_failed += 1;
                    warn!(error = %error, "Host job failed");
                }
                Err(_) => {
                    stats.jobs_failed += 1;
                    warn!("Host job panicked");
                }
            }
        });

        // A job may have closed the runtime
        if self.inner.is_closed() {
            return Ok(stats);
        }

        loop {
            // SAFETY: owner thread, runtime open
            match unsafe { self.inner.execute_pending_job() } {
                Ok(true) => stats.microtasks_run += 1,
                Ok(false) => break,
                Err(error) => {
                    stats.microtasks_run += 1;
                    warn!(error = %error, "Microtask threw");
                }
            }
        }

        trace!(
            jobs = stats.jobs_run,
            failed = stats.jobs_failed,
            microtasks = stats.microtasks_run,
            "Event loop drained"
        );
        Ok(stats)
    }

    /// Run a single engine microtask, returning whether one ran
    pub fn execute_pending_job(&self) -> QjsResult<bool> {
        self.inner.check_thread()?;
        self.inner.ensure_open()?;
        // SAFETY: owner thread, runtime open
        unsafe { self.inner.execute_pending_job() }
    }

    /// Whether the engine has microtasks waiting
    pub fn is_job_pending(&self) -> QjsResult<bool> {
        self.inner.check_thread()?;
        self.inner.ensure_open()?;
        // SAFETY: owner thread, runtime open
        Ok(unsafe { JS_IsJobPending(self.inner.rt) })
    }

    /// Abort the running script at its next interrupt checkpoint.
    /// Callable from any thread.
    pub fn interrupt(&self) {
        self.inner.interrupt.store(true, Ordering::SeqCst);
    }

    /// Reset the interrupt flag so scripts can run again
    pub fn clear_interrupt(&self) {
        self.inner.interrupt.store(false, Ordering::SeqCst);
    }

    /// Get a cloneable interrupt handle for watchdog threads
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            flag: self.inner.interrupt.clone(),
        }
    }

    /// Install the hook resolving `import` specifiers to module source
    pub fn set_module_loader<L: ModuleLoader>(&self, loader: L) -> QjsResult<()> {
        self.inner.check_thread()?;
        self.inner.ensure_open()?;

        let slot: Box<LoaderSlot> = Box::new(Box::new(loader));
        let opaque = &*slot as *const LoaderSlot as *mut c_void;

        // SAFETY: owner thread; the slot is stored in RuntimeInner and outlives
        // the registration (it is replaced only after re-registering)
        unsafe {
            JS_SetModuleLoaderFunc(self.inner.rt, None, Some(module::load_module), opaque);
        }
        let previous = self.inner.loader.lock().replace(slot);
        drop(previous);
        debug!("Module loader installed");
        Ok(())
    }

    /// Close the runtime
    ///
    /// Idempotent. Queued jobs are dropped without running; the native
    /// runtime is freed once the last context derived from it is released.
    pub fn close(&self) -> QjsResult<()> {
        self.inner.check_thread()?;
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let discarded = self.inner.jobs.discard_pending();
        debug!(discarded, "QjsRuntime closed");
        Ok(())
    }
}

impl Drop for QjsRuntime {
    fn drop(&mut self) {
        if self.inner.is_owner_thread() {
            let _ = self.close();
            self.inner.drain_releases();
        }
    }
}
