//! Bridge between Rust futures and JavaScript promises
//!
//! Host → engine: [`QjsContext::create_promise`] drives a future off the
//! owner thread and settles the promise through a posted job.
//!
//! Engine → host: [`QjsValue::to_future`] attaches one-shot `then` handlers
//! that complete a [`PromiseFuture`].

use rquickjs_sys::*;
use serde::Serialize;
use std::cell::Cell;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::thread;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::context::QjsContext;
use crate::error::{QjsError, QjsResult};
use crate::value::QjsValue;

/// A promise together with its resolving functions
#[derive(Debug)]
pub struct PromiseCapability {
    pub promise: QjsValue,
    pub resolve: QjsValue,
    pub reject: QjsValue,
}

impl PromiseCapability {
    /// Settle the promise with `outcome` on the owner thread
    fn settle<T, E>(self, outcome: Result<T, E>) -> QjsResult<()>
    where
        T: Serialize,
        E: Display,
    {
        let context = self.promise.context().clone();
        let (settler, argument) = match outcome {
            Ok(value) => match context.to_js_value(&value) {
                Ok(value) => (&self.resolve, value),
                Err(error) => (&self.reject, context.create_error(&error.to_string())?),
            },
            Err(error) => (&self.reject, context.create_error(&error.to_string())?),
        };
        settler.call(None, &[&argument])?;
        trace!("Bridged promise settled");
        Ok(())
    }
}

impl QjsContext {
    /// Create a pending promise and its resolving functions
    pub fn create_promise_capability(&self) -> QjsResult<PromiseCapability> {
        let ctx = self.guard()?;
        let mut funcs = [JS_MKVAL(JS_TAG_UNDEFINED, 0); 2];
        // SAFETY: owner thread; on success the engine fills both slots with
        // owned references
        unsafe {
            let promise = JS_NewPromiseCapability(ctx, funcs.as_mut_ptr());
            let promise = self.wrap(promise)?;
            Ok(PromiseCapability {
                promise,
                resolve: QjsValue::from_raw(self.clone(), funcs[0]),
                reject: QjsValue::from_raw(self.clone(), funcs[1]),
            })
        }
    }

    /// Create a promise settled by a Rust future
    ///
    /// The future runs on the current tokio runtime if it is a multi-thread
    /// runtime, otherwise on a helper thread. Its outcome is posted back to the owner
    /// thread, so script code observes the settlement only after the next
    /// [`QjsRuntime::run_event_loop`](crate::QjsRuntime::run_event_loop).
    /// `Ok` values are converted with [`to_js_value`](Self::to_js_value);
    /// errors reject with an `Error` carrying their message.
    pub fn create_promise<F, T, E>(&self, future: F) -> QjsResult<QjsValue>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        let capability = self.create_promise_capability()?;
        let promise = capability.promise.dup()?;
        let sender = self.job_sender();

        spawn_bridge(async move {
            let outcome = future.await;
            if let Err(error) = sender.post(move || capability.settle(outcome)) {
                debug!(error = %error, "Runtime closed before bridged promise settled");
            }
        })?;

        Ok(promise)
    }
}

fn spawn_bridge<Fut>(task: Fut) -> QjsResult<()>
where
    Fut: Future<Output = ()> + Send + 'static,
{
    // A current-thread scheduler belongs to the owner thread, which is busy
    // polling `run_event_loop` and would never drive the task
    if let Ok(handle) = Handle::try_current() {
        if handle.runtime_flavor() == RuntimeFlavor::MultiThread {
            handle.spawn(task);
            return Ok(());
        }
    }

    thread::Builder::new()
        .name("qjs-promise".into())
        .spawn(move || {
            match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime.block_on(task),
                Err(error) => warn!(error = %error, "Failed to start promise bridge runtime"),
            }
        })?;
    Ok(())
}

type Settlement = QjsResult<QjsValue>;

/// Completion of a JavaScript promise, produced by [`QjsValue::to_future`]
///
/// Completes once the owner thread has run the microtasks that settle the
/// promise. Without an async runtime, poll it with
/// [`try_result`](Self::try_result) between `run_event_loop` calls.
#[derive(Debug)]
pub struct PromiseFuture {
    rx: oneshot::Receiver<Settlement>,
}

impl PromiseFuture {
    /// Take the settlement if it is available
    pub fn try_result(&mut self) -> Option<Settlement> {
        match self.rx.try_recv() {
            Ok(settlement) => Some(settlement),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(abandoned())),
        }
    }
}

impl Future for PromiseFuture {
    type Output = Settlement;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(abandoned())))
    }
}

fn abandoned() -> QjsError {
    QjsError::internal("promise was released before it settled")
}

impl QjsValue {
    /// Attach handlers to a promise (or any thenable) and return its
    /// completion as a future
    ///
    /// Resolves with the fulfilled value or fails with the rejection
    /// reason converted to a [`QjsError`].
    ///
    /// # Example
    ///
    /// ```
    /// use qjs_core::QjsRuntime;
    ///
    /// let runtime = QjsRuntime::new().unwrap();
    /// let context = runtime.create_context().unwrap();
    ///
    /// let promise = context.eval("Promise.resolve(21).then(x => x * 2)").unwrap();
    /// let mut future = promise.to_future().unwrap();
    /// runtime.run_event_loop().unwrap();
    ///
    /// let value = future.try_result().unwrap().unwrap();
    /// assert_eq!(value.as_integer().unwrap(), 42);
    /// ```
    pub fn to_future(&self) -> QjsResult<PromiseFuture> {
        let not_thenable = || -> QjsResult<QjsError> {
            Ok(QjsError::unsupported_type(format!(
                "{} is not a promise",
                self.value_type()?
            )))
        };
        if !self.is_object()? {
            return Err(not_thenable()?);
        }
        let then = self.get_property("then")?;
        if !then.is_function()? {
            return Err(not_thenable()?);
        }

        let (tx, rx) = oneshot::channel::<Settlement>();
        let slot = Rc::new(Cell::new(Some(tx)));

        let on_fulfilled = {
            let slot = slot.clone();
            self.context().create_function(
                move |ctx, _this, args| {
                    if let Some(tx) = slot.take() {
                        let value = match args.first() {
                            Some(value) => value.dup(),
                            None => ctx.create_undefined(),
                        };
                        let _ = tx.send(value);
                    }
                    ctx.create_undefined()
                },
                "",
                1,
            )?
        };

        let on_rejected = self.context().create_function(
            move |ctx, _this, args| {
                if let Some(tx) = slot.take() {
                    let error = match args.first() {
                        Some(reason) => reason.to_error().and_then(Err),
                        None => Err(QjsError::script_exception("Error", "undefined")),
                    };
                    let _ = tx.send(error);
                }
                ctx.create_undefined()
            },
            "",
            1,
        )?;

        then.call(Some(self), &[&on_fulfilled, &on_rejected])?;
        Ok(PromiseFuture { rx })
    }
}
