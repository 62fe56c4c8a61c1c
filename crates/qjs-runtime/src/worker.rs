//! Owner thread for the engine's QuickJS runtime
//!
//! The worker creates the runtime and its context on its own thread, so
//! every native call happens where affinity checks expect it. Requests
//! arrive over a crossbeam channel; between requests the worker drains the
//! runtime's event loop so posted jobs and microtasks keep moving.
//!
//! Timeouts are enforced by a watchdog thread that raises the runtime's
//! interrupt flag when the deadline passes. A request whose result is a
//! still-pending promise does not block the thread: its reply is parked and
//! sent from the main loop once the promise settles or its deadline expires.

use crate::engine::EngineStats;
use crate::error::{CoreError, EngineError, EngineResult};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use qjs_core::{
    EvalMode, EventLoopStats, InterruptHandle, JobSender, ModuleLoader, PromiseFuture, QjsContext,
    QjsRuntime, QjsValue, RuntimeConfig,
};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info_span, trace, warn};

type Json = serde_json::Value;

/// Request submitted to the engine thread
pub(crate) enum Request {
    /// Evaluate a script or module and convert the completion value
    Eval {
        source: String,
        filename: String,
        mode: EvalMode,
        timeout: Option<Duration>,
        response: oneshot::Sender<EngineResult<Json>>,
    },
    /// Call a global function with JSON arguments
    Call {
        function: String,
        args: Vec<Json>,
        timeout: Option<Duration>,
        response: oneshot::Sender<EngineResult<Json>>,
    },
    /// Bind a JSON value to a global name
    SetGlobal {
        name: String,
        value: Json,
        response: oneshot::Sender<EngineResult<()>>,
    },
    /// Drain jobs and microtasks once
    RunEventLoop {
        response: oneshot::Sender<EngineResult<EventLoopStats>>,
    },
    /// Shutdown signal
    Shutdown,
}

/// Everything the worker needs to build its runtime
pub(crate) struct WorkerConfig {
    pub runtime: RuntimeConfig,
    pub loader: Option<Box<dyn ModuleLoader>>,
    pub poll_interval: Duration,
}

/// Cross-thread handles published once the runtime exists
pub(crate) struct Ready {
    pub interrupt: InterruptHandle,
    pub jobs: JobSender,
}

/// Run the engine thread until shutdown
///
/// Reports through `ready` whether the runtime could be created, then
/// serves requests until the channel disconnects or shutdown is signaled.
pub(crate) fn run_worker(
    requests: Receiver<Request>,
    config: WorkerConfig,
    ready: Sender<EngineResult<Ready>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<EngineStats>,
) {
    let thread_name = thread::current()
        .name()
        .unwrap_or("qjs-engine")
        .to_string();

    let _span = info_span!("worker", name = %thread_name).entered();
    debug!("Worker starting");

    let (runtime, context) = match setup(config.runtime, config.loader) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "Failed to create QuickJS runtime");
            let _ = ready.send(Err(e));
            return;
        }
    };

    let interrupt = runtime.interrupt_handle();
    let published = Ready {
        interrupt: interrupt.clone(),
        jobs: runtime.job_sender(),
    };
    if ready.send(Ok(published)).is_err() {
        debug!("Engine dropped before the worker was ready");
        return;
    }

    let worker = Worker {
        runtime: &runtime,
        context: &context,
        interrupt,
    };
    let mut pending: Vec<PendingReply> = Vec::new();

    debug!("Worker initialized");

    loop {
        if shutdown.load(Ordering::SeqCst) {
            debug!("Worker shutdown flag set");
            break;
        }

        if let Err(e) = runtime.run_event_loop() {
            warn!(error = %e, "Event loop poll failed");
        }
        poll_pending(&mut pending, &stats);

        // Wake periodically so posted jobs and pending promises keep moving
        match requests.recv_timeout(config.poll_interval) {
            Ok(Request::Shutdown) => {
                debug!("Received shutdown signal");
                break;
            }
            Ok(request) => {
                if let Some(reply) = worker.execute(request, &stats) {
                    pending.push(reply);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Request channel disconnected");
                break;
            }
        }
    }

    if let Err(e) = runtime.run_event_loop() {
        warn!(error = %e, "Final event loop drain failed");
    }
    if !pending.is_empty() {
        debug!(count = pending.len(), "Dropping requests with unsettled promises");
    }
    drop(pending);
    drop(context);
    if let Err(e) = runtime.close() {
        warn!(error = %e, "Failed to close runtime");
    }

    debug!("Worker stopped");
}

fn setup(
    config: RuntimeConfig,
    loader: Option<Box<dyn ModuleLoader>>,
) -> EngineResult<(QjsRuntime, QjsContext)> {
    let runtime = QjsRuntime::with_config(config)?;
    if let Some(loader) = loader {
        runtime.set_module_loader(move |name: &str| loader.load(name))?;
    }
    let context = runtime.create_context()?;
    Ok((runtime, context))
}

struct Worker<'a> {
    runtime: &'a QjsRuntime,
    context: &'a QjsContext,
    interrupt: InterruptHandle,
}

/// Outcome of the synchronous part of a request
enum Completion {
    Ready(Json),
    Pending(PromiseFuture),
}

/// A request waiting for its result promise to settle
///
/// The engine keeps serving other requests meanwhile; the reply is sent
/// from the main loop once the promise settles or the deadline passes.
struct PendingReply {
    future: PromiseFuture,
    deadline: Option<(Instant, Duration)>,
    response: oneshot::Sender<EngineResult<Json>>,
}

impl Worker<'_> {
    /// Execute a request, returning its reply if it waits on a promise
    fn execute(&self, request: Request, stats: &EngineStats) -> Option<PendingReply> {
        match request {
            Request::Shutdown => {
                debug!("Received shutdown signal");
                None
            }
            Request::Eval {
                source,
                filename,
                mode,
                timeout,
                response,
            } => {
                let _span = info_span!("eval", source = %filename, ?mode).entered();
                let started = Instant::now();
                let result = execute_with_panic_handler(|| {
                    self.guarded(timeout, || {
                        let value = self.context.eval_with(&source, &filename, mode)?;
                        self.complete(value)
                    })
                });
                reply_or_defer(result, started, timeout, response, stats)
            }
            Request::Call {
                function,
                args,
                timeout,
                response,
            } => {
                let _span = info_span!("call", function = %function).entered();
                let started = Instant::now();
                let result = execute_with_panic_handler(|| {
                    self.guarded(timeout, || self.call(&function, &args))
                });
                reply_or_defer(result, started, timeout, response, stats)
            }
            Request::SetGlobal {
                name,
                value,
                response,
            } => {
                let result = execute_with_panic_handler(|| {
                    let value = self.context.to_js_value(&value)?;
                    self.context.set_global(&name, &value)?;
                    Ok(())
                });
                let _ = response.send(result);
                None
            }
            Request::RunEventLoop { response } => {
                let result = self.runtime.run_event_loop().map_err(EngineError::from);
                let _ = response.send(result);
                None
            }
        }
    }

    /// Run `f` under an optional deadline, mapping a watchdog interrupt to a timeout
    fn guarded<T>(
        &self,
        timeout: Option<Duration>,
        f: impl FnOnce() -> EngineResult<T>,
    ) -> EngineResult<T> {
        let watchdog = timeout
            .map(|limit| Watchdog::arm(self.interrupt.clone(), limit))
            .transpose()?;

        let outcome = f();

        let fired = watchdog.is_some_and(Watchdog::disarm);
        self.runtime.clear_interrupt();

        match outcome {
            Err(EngineError::Core(CoreError::Interrupted)) if fired => {
                let ms = timeout.map(|t| t.as_millis() as u64).unwrap_or_default();
                warn!(timeout_ms = ms, "Script timed out");
                Err(EngineError::Timeout(ms))
            }
            other => other,
        }
    }

    fn call(&self, function: &str, args: &[Json]) -> EngineResult<Completion> {
        let global = self.context.get_global_object()?;
        let callee = global.get_property(function)?;
        if !callee.is_function()? {
            return Err(CoreError::script_exception(
                "TypeError",
                format!("TypeError: {} is not a function", function),
            )
            .into());
        }

        let args = args
            .iter()
            .map(|arg| self.context.to_js_value(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let refs: Vec<&QjsValue> = args.iter().collect();
        let value = callee.call(None, &refs)?;
        self.complete(value)
    }

    /// Convert the result, or subscribe to it when it is a promise
    ///
    /// Promises settled by the microtasks already queued (`Promise.resolve`,
    /// synchronous `async` bodies) complete here without deferring.
    fn complete(&self, value: QjsValue) -> EngineResult<Completion> {
        if !value.is_promise()? {
            return Ok(Completion::Ready(value.to_json_value()?));
        }

        let mut future = value.to_future()?;
        self.runtime.run_event_loop()?;
        match future.try_result() {
            Some(settlement) => Ok(Completion::Ready(settlement?.to_json_value()?)),
            None => {
                trace!("Result promise pending; deferring reply");
                Ok(Completion::Pending(future))
            }
        }
    }
}

/// Send a finished result, or park the reply until its promise settles
fn reply_or_defer(
    result: EngineResult<Completion>,
    started: Instant,
    timeout: Option<Duration>,
    response: oneshot::Sender<EngineResult<Json>>,
    stats: &EngineStats,
) -> Option<PendingReply> {
    let result = match result {
        Ok(Completion::Pending(future)) => {
            return Some(PendingReply {
                future,
                deadline: timeout.map(|limit| (started + limit, limit)),
                response,
            });
        }
        Ok(Completion::Ready(json)) => Ok(json),
        Err(e) => Err(e),
    };
    update_stats(stats, &result);
    let _ = response.send(result);
    None
}

/// Reply to every request whose promise settled or whose deadline passed
fn poll_pending(pending: &mut Vec<PendingReply>, stats: &EngineStats) {
    let now = Instant::now();
    let mut index = 0;
    while index < pending.len() {
        let entry = &mut pending[index];
        let result = match entry.future.try_result() {
            Some(settlement) => settlement
                .and_then(|value| value.to_json_value())
                .map_err(EngineError::from),
            None => match entry.deadline {
                Some((deadline, limit)) if now >= deadline => {
                    let ms = limit.as_millis() as u64;
                    warn!(timeout_ms = ms, "Result promise timed out");
                    Err(EngineError::Timeout(ms))
                }
                _ => {
                    index += 1;
                    continue;
                }
            },
        };

        let entry = pending.swap_remove(index);
        update_stats(stats, &result);
        let _ = entry.response.send(result);
    }
}

/// Raises the interrupt flag if not disarmed before the deadline
struct Watchdog {
    cancel: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    fired: Arc<AtomicBool>,
}

impl Watchdog {
    fn arm(interrupt: InterruptHandle, limit: Duration) -> EngineResult<Self> {
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        let thread = thread::Builder::new()
            .name("qjs-watchdog".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(limit) {
                    flag.store(true, Ordering::SeqCst);
                    interrupt.interrupt();
                }
            })
            .map_err(|e| EngineError::Thread(format!("Failed to spawn watchdog: {}", e)))?;

        Ok(Self {
            cancel: Some(cancel_tx),
            thread: Some(thread),
            fired,
        })
    }

    /// Stop the watchdog and report whether it fired
    fn disarm(mut self) -> bool {
        self.stop();
        self.fired.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        // Disconnecting wakes the watchdog immediately
        drop(self.cancel.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Execute a closure with panic handling
fn execute_with_panic_handler<T, F>(f: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Worker panic: {}", s)
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Worker panic: {}", s)
            } else {
                "Worker panic: unknown error".to_string()
            };
            error!("{}", message);
            Err(EngineError::internal(message))
        }
    }
}

/// Update engine statistics based on a request result
fn update_stats<T>(stats: &EngineStats, result: &EngineResult<T>) {
    stats.jobs_completed.fetch_add(1, Ordering::Relaxed);
    if result.is_err() {
        stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }
}
