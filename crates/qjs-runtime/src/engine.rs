//! Thread-safe engine for JavaScript execution
//!
//! The Engine owns one QuickJS runtime living on a dedicated thread.
//! Requests are submitted via a thread-safe `EngineHandle` and executed on
//! that thread, which also keeps the runtime's event loop turning.
//!
//! # Example
//!
//! ```no_run
//! use qjs_runtime::Engine;
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = Engine::new().unwrap();
//!     let handle = engine.handle();
//!
//!     // Evaluate JavaScript from any thread
//!     let result = handle.eval("1 + 1").await.unwrap();
//!     assert_eq!(result, serde_json::json!(2));
//!
//!     engine.shutdown().await;
//! }
//! ```

use crate::error::{CoreError, EngineError, EngineResult};
use crate::worker::{Ready, Request, WorkerConfig, run_worker};
use crossbeam_channel::{Sender, bounded, unbounded};
use qjs_core::{EvalMode, EventLoopStats, InterruptHandle, JobSender, ModuleLoader, RuntimeConfig};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;

/// Statistics about engine operation
///
/// All counters are atomic and can be read at any time without locking.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Total number of requests submitted to the engine
    pub jobs_submitted: AtomicU64,
    /// Total number of requests completed (successfully or with error)
    pub jobs_completed: AtomicU64,
    /// Number of requests that failed with an error
    pub jobs_failed: AtomicU64,
}

impl EngineStats {
    /// Create new empty stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Get snapshot of current stats
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
        }
    }

    /// Get the number of requests currently in flight
    pub fn jobs_in_flight(&self) -> u64 {
        let submitted = self.jobs_submitted.load(Ordering::Relaxed);
        let completed = self.jobs_completed.load(Ordering::Relaxed);
        submitted.saturating_sub(completed)
    }
}

/// A point-in-time snapshot of engine statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

/// Builder for creating an Engine with custom configuration
pub struct EngineBuilder {
    config: RuntimeConfig,
    loader: Option<Box<dyn ModuleLoader>>,
    thread_name: String,
    default_timeout: Option<Duration>,
    poll_interval: Duration,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: RuntimeConfig::default(),
            loader: None,
            thread_name: "qjs-engine".to_string(),
            default_timeout: None,
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl EngineBuilder {
    /// Set the runtime limits and standard library options
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Install a module loader for `import` statements
    pub fn module_loader<L: ModuleLoader>(mut self, loader: L) -> Self {
        self.loader = Some(Box::new(loader));
        self
    }

    /// Set the name of the engine thread
    ///
    /// Default is `qjs-engine`.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Abort evaluations that run longer than `timeout`
    ///
    /// Applies to every request without an explicit timeout, including the
    /// time spent waiting for a returned promise to settle. Default is none.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Set how often the idle engine thread drains posted jobs
    ///
    /// Default is 10ms.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Build the engine and start its thread
    pub fn build(self) -> EngineResult<Engine> {
        Engine::new_with_config(self)
    }
}

/// JavaScript execution engine backed by a dedicated runtime thread
///
/// Use `handle()` to get a thread-safe handle for submitting requests.
pub struct Engine {
    request_tx: Sender<Request>,
    worker: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<EngineStats>,
    interrupt: InterruptHandle,
    jobs: JobSender,
    default_timeout: Option<Duration>,
}

impl Engine {
    /// Create a new engine with default configuration
    pub fn new() -> EngineResult<Self> {
        Self::builder().build()
    }

    /// Create a builder for custom configuration
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    fn new_with_config(builder: EngineBuilder) -> EngineResult<Self> {
        let (request_tx, request_rx) = unbounded::<Request>();
        let (ready_tx, ready_rx) = bounded::<EngineResult<Ready>>(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(EngineStats::new());

        let config = WorkerConfig {
            runtime: builder.config,
            loader: builder.loader,
            poll_interval: builder.poll_interval,
        };
        let shutdown_flag = shutdown.clone();
        let worker_stats = stats.clone();

        let worker = std::thread::Builder::new()
            .name(builder.thread_name)
            .spawn(move || run_worker(request_rx, config, ready_tx, shutdown_flag, worker_stats))
            .map_err(|e| EngineError::Thread(format!("Failed to spawn worker: {}", e)))?;

        let ready = match ready_rx.recv() {
            Ok(ready) => ready,
            Err(_) => {
                let _ = worker.join();
                return Err(EngineError::Thread("worker exited during startup".to_string()));
            }
        };
        let ready = match ready {
            Ok(ready) => ready,
            Err(e) => {
                let _ = worker.join();
                return Err(e);
            }
        };

        Ok(Self {
            request_tx,
            worker: Some(worker),
            shutdown,
            stats,
            interrupt: ready.interrupt,
            jobs: ready.jobs,
            default_timeout: builder.default_timeout,
        })
    }

    /// Get a thread-safe handle for submitting requests
    ///
    /// The handle can be cloned and shared across threads.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            request_tx: self.request_tx.clone(),
            stats: self.stats.clone(),
            interrupt: self.interrupt.clone(),
            jobs: self.jobs.clone(),
            default_timeout: self.default_timeout,
        }
    }

    /// Get the engine statistics
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Shutdown the engine and wait for its thread to finish
    ///
    /// Requests still queued are dropped; their callers see
    /// [`EngineError::ShutDown`].
    pub async fn shutdown(mut self) {
        let worker = self.stop();

        // Join on a blocking thread so the async runtime keeps running
        if let Some(worker) = worker {
            tokio::task::spawn_blocking(move || {
                let _ = worker.join();
            })
            .await
            .ok();
        }
    }

    /// Check if the engine is still running
    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
    }

    fn stop(&mut self) -> Option<JoinHandle<()>> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.interrupt.interrupt();
        let _ = self.request_tx.send(Request::Shutdown);
        self.worker.take()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Signal only; the thread exits on its own
        if self.worker.is_some() {
            self.stop();
        }
    }
}

/// Thread-safe handle for submitting JavaScript requests
///
/// This handle is `Send + Sync + Clone` and can be freely shared across
/// threads. All JavaScript execution happens on the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    request_tx: Sender<Request>,
    stats: Arc<EngineStats>,
    interrupt: InterruptHandle,
    jobs: JobSender,
    default_timeout: Option<Duration>,
}

impl EngineHandle {
    /// Evaluate JavaScript code and return the result as JSON
    ///
    /// If the script returns a promise, the reply carries its settled value.
    /// The engine keeps serving other requests while the promise is pending.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn example(handle: qjs_runtime::EngineHandle) {
    /// let result = handle.eval("Promise.resolve(40).then(x => x + 2)").await.unwrap();
    /// assert_eq!(result, serde_json::json!(42));
    /// # }
    /// ```
    pub async fn eval(&self, script: impl Into<String>) -> EngineResult<serde_json::Value> {
        self.eval_source(script.into(), "<eval>".to_string(), EvalMode::Global, self.default_timeout)
            .await
    }

    /// Evaluate JavaScript code with a source URL for error messages
    ///
    /// The source URL appears in stack traces and error messages.
    pub async fn eval_with_source(
        &self,
        script: impl Into<String>,
        source_url: impl Into<String>,
    ) -> EngineResult<serde_json::Value> {
        self.eval_source(script.into(), source_url.into(), EvalMode::Global, self.default_timeout)
            .await
    }

    /// Evaluate JavaScript code, failing with [`EngineError::Timeout`] past `timeout`
    pub async fn eval_with_timeout(
        &self,
        script: impl Into<String>,
        timeout: Duration,
    ) -> EngineResult<serde_json::Value> {
        self.eval_source(script.into(), "<eval>".to_string(), EvalMode::Global, Some(timeout))
            .await
    }

    /// Evaluate an ES module and wait for its evaluation to finish
    ///
    /// Imports go through the loader given to
    /// [`EngineBuilder::module_loader`]. Resolves to `null`.
    pub async fn eval_module(
        &self,
        source: impl Into<String>,
        filename: impl Into<String>,
    ) -> EngineResult<serde_json::Value> {
        self.eval_source(source.into(), filename.into(), EvalMode::Module, self.default_timeout)
            .await
    }

    async fn eval_source(
        &self,
        source: String,
        filename: String,
        mode: EvalMode,
        timeout: Option<Duration>,
    ) -> EngineResult<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        self.submit(Request::Eval {
            source,
            filename,
            mode,
            timeout,
            response: tx,
        })?;
        receive(rx).await
    }

    /// Call a global function with arguments
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn example(handle: qjs_runtime::EngineHandle) {
    /// handle.eval("function add(a, b) { return a + b; }").await.unwrap();
    ///
    /// let result = handle
    ///     .call("add", vec![serde_json::json!(1), serde_json::json!(2)])
    ///     .await
    ///     .unwrap();
    /// assert_eq!(result, serde_json::json!(3));
    /// # }
    /// ```
    pub async fn call(
        &self,
        function: impl Into<String>,
        args: Vec<serde_json::Value>,
    ) -> EngineResult<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        self.submit(Request::Call {
            function: function.into(),
            args,
            timeout: self.default_timeout,
            response: tx,
        })?;
        receive(rx).await
    }

    /// Bind any serializable value to a global name
    pub async fn set_global<T: Serialize + ?Sized>(
        &self,
        name: impl Into<String>,
        value: &T,
    ) -> EngineResult<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| EngineError::Core(CoreError::unsupported_type(e.to_string())))?;
        let (tx, rx) = oneshot::channel();
        self.submit(Request::SetGlobal {
            name: name.into(),
            value,
            response: tx,
        })?;
        receive(rx).await
    }

    /// Drain posted jobs and microtasks now instead of at the next poll
    pub async fn run_event_loop(&self) -> EngineResult<EventLoopStats> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(Request::RunEventLoop { response: tx })
            .map_err(|_| EngineError::ShutDown)?;
        receive(rx).await
    }

    /// Queue a closure on the engine thread without waiting for it
    ///
    /// The closure runs during the engine's next event loop pass.
    pub fn post<F>(&self, job: F) -> EngineResult<()>
    where
        F: FnOnce() -> qjs_core::QjsResult<()> + Send + 'static,
    {
        self.jobs.post(job).map_err(|e| match e {
            CoreError::Closed { .. } => EngineError::ShutDown,
            other => EngineError::Core(other),
        })
    }

    /// Abort the script currently running on the engine thread
    ///
    /// If the engine is idle, the next script to run is aborted instead.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    /// Get access to the engine statistics
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    fn submit(&self, request: Request) -> EngineResult<()> {
        self.stats.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        self.request_tx
            .send(request)
            .map_err(|_| EngineError::ShutDown)
    }
}

async fn receive<T>(rx: oneshot::Receiver<EngineResult<T>>) -> EngineResult<T> {
    rx.await.map_err(|_| EngineError::ShutDown)?
}
