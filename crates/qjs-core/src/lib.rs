// Raw pointers handed out by `raw()` are for callers doing their own FFI;
// the safe API never dereferences caller-provided pointers.
#![allow(clippy::not_unsafe_ptr_arg_deref)]

//! Safe wrappers for the QuickJS engine.
//!
//! This crate provides RAII handles around the raw QuickJS FFI bindings in
//! `rquickjs-sys`: runtimes, contexts and values with explicit, idempotent
//! `close()` plus release on drop, a cross-thread job queue, host functions,
//! and a bridge between Rust futures and JavaScript promises.
//!
//! # Example
//!
//! ```
//! use qjs_core::QjsRuntime;
//!
//! let runtime = QjsRuntime::new().unwrap();
//! let context = runtime.create_context().unwrap();
//!
//! let array = context.eval("['A', 'B', 'C']").unwrap();
//! assert_eq!(array.length().unwrap(), 3);
//! assert_eq!(array.get_index(1).unwrap().as_string().unwrap(), "B");
//! ```
//!
//! # Thread Affinity
//!
//! A runtime belongs to the thread that created it. Its contexts and values
//! are `Send` so they can be moved into jobs and dropped anywhere, but every
//! operation first checks the current thread and fails with
//! [`QjsError::ThreadAffinity`] elsewhere. Only [`QjsRuntime::post`],
//! [`JobSender`] and [`InterruptHandle`] are meant for other threads.
//!
//! Work from other threads reaches the engine through the job queue:
//!
//! ```
//! use qjs_core::QjsRuntime;
//! use std::thread;
//!
//! let runtime = QjsRuntime::new().unwrap();
//! let sender = runtime.job_sender();
//!
//! thread::spawn(move || {
//!     sender.post(|| Ok(())).unwrap();
//! })
//! .join()
//! .unwrap();
//!
//! let stats = runtime.run_event_loop().unwrap();
//! assert_eq!(stats.jobs_run, 1);
//! ```
//!
//! Dropping a value on a foreign thread never touches the engine; the
//! release is queued and performed by the next `run_event_loop` call.
//!
//! For a handle that can be shared freely across threads and async tasks,
//! use `qjs-runtime`'s `EngineHandle`, which marshals requests to a
//! dedicated engine thread.

mod config;
mod context;
mod convert;
mod error;
mod function;
mod job;
mod module;
mod promise;
mod runtime;
mod value;

pub use config::{RuntimeBuilder, RuntimeConfig};
pub use context::{EvalMode, QjsContext};
pub use convert::MAX_DEPTH;
pub use error::{QjsError, QjsResult, extract_exception};
pub use function::HostFunction;
pub use job::{Job, JobSender};
pub use module::ModuleLoader;
pub use promise::{PromiseCapability, PromiseFuture};
pub use runtime::{EventLoopStats, InterruptHandle, QjsRuntime};
pub use value::{ArrayIter, QjsValue, ValueType};

// Re-export rquickjs-sys for direct FFI access when needed
pub use rquickjs_sys;
