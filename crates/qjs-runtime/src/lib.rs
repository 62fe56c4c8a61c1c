//! qjs-runtime - a QuickJS engine on its own thread.
//!
//! This crate wraps [`qjs_core`] in an [`Engine`] that owns one runtime on a
//! dedicated thread and exposes it through a `Send + Sync` [`EngineHandle`].
//! Async callers submit scripts from any thread; results come back as
//! `serde_json::Value`.
//!
//! # Features
//!
//! - **Thread-safe handle**: clone it freely, evaluate from any task
//! - **Promise results**: replies wait for returned promises without blocking the engine
//! - **Timeouts**: a watchdog interrupts scripts that run past their deadline
//! - **Posted jobs**: closures queued from any thread run on the engine thread
//!
//! # Example
//!
//! ```no_run
//! use qjs_runtime::Engine;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = Engine::builder()
//!         .default_timeout(Duration::from_secs(5))
//!         .build()
//!         .unwrap();
//!     let handle = engine.handle();
//!
//!     handle.set_global("limit", &3).await.unwrap();
//!     let result = handle.eval("[1, 2, 3, 4].filter(x => x <= limit)").await.unwrap();
//!     assert_eq!(result, serde_json::json!([1, 2, 3]));
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ ┌──────────────┐
//! │ EngineHandle │ │ EngineHandle │  ...  (any thread)
//! └──────┬───────┘ └──────┬───────┘
//!        └────────┬───────┘
//!                 ↓ crossbeam channel
//! ┌─────────────────────────────────────────────┐
//! │              engine thread                  │
//! │  QjsRuntime + QjsContext                    │
//! │  - requests (eval, call, set_global)        │
//! │  - run_event_loop between requests          │
//! └─────────────────────────────────────────────┘
//!                 ↑ interrupt flag
//! ┌─────────────────────────────────────────────┐
//! │  watchdog thread (per timed request)        │
//! └─────────────────────────────────────────────┘
//! ```

pub mod engine;
pub mod error;
mod worker;

pub use engine::{Engine, EngineBuilder, EngineHandle, EngineStats, EngineStatsSnapshot};
pub use error::{CoreError, CoreResult, EngineError, EngineResult};
pub use qjs_core::{EventLoopStats, ModuleLoader, RuntimeConfig};
