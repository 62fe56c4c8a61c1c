//! QuickJS context wrapper

use rquickjs_sys::*;
use std::ffi::{CString, c_int, c_void};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::error::{QjsError, QjsResult, error_from_value, extract_exception};
use crate::job::JobSender;
use crate::runtime::RuntimeInner;
use crate::value::QjsValue;

/// How source text passed to [`QjsContext::eval_with`] is compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvalMode {
    /// Classic script; the completion value is returned
    #[default]
    Global,
    /// ES module; `import` goes through the runtime's module loader and the
    /// result is the module's evaluation promise
    Module,
}

impl EvalMode {
    fn flags(self) -> c_int {
        match self {
            EvalMode::Global => JS_EVAL_TYPE_GLOBAL as c_int,
            EvalMode::Module => JS_EVAL_TYPE_MODULE as c_int,
        }
    }
}

pub(crate) struct ContextInner {
    ctx: *mut JSContext,
    /// Back-pointer stored as the native context opaque, read by host functions
    opaque: *mut Weak<ContextInner>,
    runtime: Arc<RuntimeInner>,
    closed: AtomicBool,
}

// SAFETY: the context pointer is only dereferenced on the runtime's owner
// thread; every entry point checks it first.
unsafe impl Send for ContextInner {}
unsafe impl Sync for ContextInner {}

impl ContextInner {
    pub(crate) fn raw(&self) -> *mut JSContext {
        self.ctx
    }

    pub(crate) fn runtime(&self) -> &Arc<RuntimeInner> {
        &self.runtime
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if self.runtime.is_owner_thread() {
            // SAFETY: owner thread; no QjsValue refers to this context anymore
            unsafe { free_context(self.ctx, self.opaque) };
        } else {
            self.runtime.defer_release(ContextRelease {
                ctx: self.ctx,
                opaque: self.opaque,
                runtime: self.runtime.clone(),
            });
        }
    }
}

/// Native context release carried to the owner thread
struct ContextRelease {
    ctx: *mut JSContext,
    opaque: *mut Weak<ContextInner>,
    runtime: Arc<RuntimeInner>,
}

// SAFETY: the pointers are only used in Drop, and only on the owner thread
unsafe impl Send for ContextRelease {}

impl Drop for ContextRelease {
    fn drop(&mut self) {
        if self.runtime.is_owner_thread() {
            // SAFETY: owner thread; ownership of both pointers moved here
            unsafe { free_context(self.ctx, self.opaque) };
        } else {
            warn!("QjsContext release dropped off the owner thread, leaking native context");
        }
    }
}

unsafe fn free_context(ctx: *mut JSContext, opaque: *mut Weak<ContextInner>) {
    // SAFETY: caller guarantees exclusive ownership on the owner thread
    unsafe {
        JS_SetContextOpaque(ctx, std::ptr::null_mut());
        JS_FreeContext(ctx);
        drop(Box::from_raw(opaque));
    }
    debug!("QuickJS context freed");
}

/// A JavaScript execution context
///
/// Cheap to clone; all clones share one native context. The context stays
/// allocated until the last clone and the last value created in it are
/// gone, but [`close`](Self::close) makes every further operation fail.
#[derive(Clone)]
pub struct QjsContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for QjsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QjsContext")
            .field("ctx", &self.inner.ctx)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Drop for QjsContext {
    fn drop(&mut self) {
        // Late releases hold this context alive; free them while the owner
        // thread still has a handle
        self.inner.runtime().drain_releases();
    }
}

impl QjsContext {
    pub(crate) fn new(runtime: Arc<RuntimeInner>) -> QjsResult<Self> {
        let rt = runtime.raw();
        let std_lib = runtime.config().include_standard_library;

        // SAFETY: owner thread, runtime open (checked by the caller)
        let ctx = unsafe {
            if std_lib {
                JS_NewContext(rt)
            } else {
                let ctx = JS_NewContextRaw(rt);
                if !ctx.is_null() {
                    JS_AddIntrinsicBaseObjects(ctx);
                    JS_AddIntrinsicEval(ctx);
                    JS_AddIntrinsicPromise(ctx);
                }
                ctx
            }
        };
        if ctx.is_null() {
            return Err(QjsError::initialization("JS_NewContext returned null"));
        }

        let inner = Arc::new_cyclic(|weak| {
            let opaque = Box::into_raw(Box::new(weak.clone()));
            // SAFETY: fresh context; the box is reclaimed in free_context
            unsafe { JS_SetContextOpaque(ctx, opaque as *mut c_void) };
            ContextInner {
                ctx,
                opaque,
                runtime,
                closed: AtomicBool::new(false),
            }
        });

        debug!(std_lib, "QuickJS context created");
        Ok(Self { inner })
    }

    /// Recover the context a host function is running in
    ///
    /// Returns `None` when every handle to the context has been released.
    ///
    /// # Safety
    /// `ctx` must be a live context created by [`QjsContext::new`], and the
    /// call must happen on its owner thread.
    pub(crate) unsafe fn from_raw(ctx: *mut JSContext) -> Option<Self> {
        // SAFETY: per caller contract the opaque is our Weak or null
        let opaque = unsafe { JS_GetContextOpaque(ctx) } as *const Weak<ContextInner>;
        if opaque.is_null() {
            return None;
        }
        // SAFETY: non-null opaque points at a live Weak owned by the context
        unsafe { &*opaque }.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }

    /// Get the raw context pointer
    pub fn raw(&self) -> *mut JSContext {
        self.inner.ctx
    }

    pub(crate) fn same_context(&self, other: &QjsContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Fail with [`QjsError::ThreadAffinity`] unless called on the owner thread
    pub fn check_thread(&self) -> QjsResult<()> {
        self.inner.runtime.check_thread()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.runtime.is_closed()
    }

    pub(crate) fn ensure_open(&self) -> QjsResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(QjsError::closed("QjsContext"));
        }
        self.inner.runtime.ensure_open()
    }

    /// Thread check, then open check; returns the raw context on success
    pub(crate) fn guard(&self) -> QjsResult<*mut JSContext> {
        self.check_thread()?;
        self.ensure_open()?;
        Ok(self.inner.ctx)
    }

    /// Take ownership of a returned value, turning exceptions into errors
    ///
    /// # Safety
    /// `value` must be an owned value of this context (or the exception
    /// marker), on the owner thread.
    pub(crate) unsafe fn wrap(&self, value: JSValue) -> QjsResult<QjsValue> {
        // SAFETY: per caller contract
        unsafe {
            if JS_IsException(value) {
                return Err(extract_exception(self.inner.ctx));
            }
        }
        Ok(QjsValue::from_raw(self.clone(), value))
    }

    /// Get a cloneable job producer for the owning runtime
    pub fn job_sender(&self) -> JobSender {
        self.inner.runtime.job_sender()
    }

    /// Evaluate a script in global mode with the filename `<input>`
    pub fn eval(&self, source: &str) -> QjsResult<QjsValue> {
        self.eval_with(source, "<input>", EvalMode::Global)
    }

    /// Evaluate source with an explicit filename and mode
    pub fn eval_with(&self, source: &str, filename: &str, mode: EvalMode) -> QjsResult<QjsValue> {
        let ctx = self.guard()?;
        let source = nul_terminated(source);
        let filename = CString::new(filename)
            .map_err(|_| QjsError::unsupported_type("filename contains a NUL byte"))?;

        // SAFETY: owner thread, context open; the buffer holds `len` bytes
        // of source followed by a terminating NUL
        let value = unsafe {
            let value = JS_Eval(
                ctx,
                source.as_ptr().cast(),
                (source.len() - 1) as size_t,
                filename.as_ptr(),
                mode.flags(),
            );
            self.wrap(value)?
        };

        if mode == EvalMode::Module {
            // SAFETY: value is a live value of this context
            unsafe { reject_if_failed(ctx, &value)? };
        }
        Ok(value)
    }

    /// Read a file and evaluate it as a global script named after its path
    pub fn eval_path(&self, path: impl AsRef<Path>) -> QjsResult<QjsValue> {
        self.check_thread()?;
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        self.eval_with(&source, &path.display().to_string(), EvalMode::Global)
    }

    /// Parse JSON text with the engine's parser
    pub fn parse_json(&self, text: &str) -> QjsResult<QjsValue> {
        let ctx = self.guard()?;
        let text = nul_terminated(text);
        // SAFETY: owner thread; the buffer is NUL-terminated
        unsafe {
            let value = JS_ParseJSON(
                ctx,
                text.as_ptr().cast(),
                (text.len() - 1) as size_t,
                c"<json>".as_ptr(),
            );
            self.wrap(value)
        }
    }

    /// Create an integer value
    pub fn create_integer(&self, value: i32) -> QjsResult<QjsValue> {
        self.guard()?;
        Ok(QjsValue::from_raw(self.clone(), JS_MKVAL(JS_TAG_INT, value)))
    }

    /// Create a number value
    pub fn create_double(&self, value: f64) -> QjsResult<QjsValue> {
        self.guard()?;
        Ok(QjsValue::from_raw(self.clone(), JS_NewFloat64(value)))
    }

    /// Create a string value
    pub fn create_string(&self, value: &str) -> QjsResult<QjsValue> {
        let ctx = self.guard()?;
        // SAFETY: owner thread; explicit length, no terminator needed
        unsafe {
            let value = JS_NewStringLen(ctx, value.as_ptr().cast(), value.len() as size_t);
            self.wrap(value)
        }
    }

    /// Create a boolean value
    pub fn create_boolean(&self, value: bool) -> QjsResult<QjsValue> {
        self.guard()?;
        Ok(QjsValue::from_raw(
            self.clone(),
            JS_MKVAL(JS_TAG_BOOL, value as i32),
        ))
    }

    /// Create `null`
    pub fn create_null(&self) -> QjsResult<QjsValue> {
        self.guard()?;
        Ok(QjsValue::from_raw(self.clone(), JS_MKVAL(JS_TAG_NULL, 0)))
    }

    /// Create `undefined`
    pub fn create_undefined(&self) -> QjsResult<QjsValue> {
        self.guard()?;
        Ok(QjsValue::from_raw(self.clone(), JS_MKVAL(JS_TAG_UNDEFINED, 0)))
    }

    /// Create an empty array
    pub fn create_array(&self) -> QjsResult<QjsValue> {
        let ctx = self.guard()?;
        // SAFETY: owner thread, context open
        unsafe { self.wrap(JS_NewArray(ctx)) }
    }

    /// Create an empty plain object
    pub fn create_object(&self) -> QjsResult<QjsValue> {
        let ctx = self.guard()?;
        // SAFETY: owner thread, context open
        unsafe { self.wrap(JS_NewObject(ctx)) }
    }

    /// Create an `Error` instance with the given message
    pub fn create_error(&self, message: &str) -> QjsResult<QjsValue> {
        let ctx = self.guard()?;
        // SAFETY: owner thread, context open
        let error = unsafe { self.wrap(JS_NewError(ctx))? };
        let message = self.create_string(message)?;
        // SAFETY: the property takes over the duplicated message reference
        unsafe {
            let status = JS_DefinePropertyValueStr(
                ctx,
                error.raw(),
                c"message".as_ptr(),
                JS_DupValue(ctx, message.raw()),
                (JS_PROP_CONFIGURABLE | JS_PROP_WRITABLE) as c_int,
            );
            if status < 0 {
                return Err(extract_exception(ctx));
            }
        }
        Ok(error)
    }

    /// Get the global object
    pub fn get_global_object(&self) -> QjsResult<QjsValue> {
        let ctx = self.guard()?;
        // SAFETY: owner thread, context open
        unsafe { self.wrap(JS_GetGlobalObject(ctx)) }
    }

    /// Set a property on the global object
    pub fn set_global(&self, name: &str, value: &QjsValue) -> QjsResult<()> {
        self.get_global_object()?.set_property(name, value)
    }

    /// Mark the context closed
    ///
    /// Idempotent. The native context is released once the last handle and
    /// value referring to it are dropped.
    pub fn close(&self) -> QjsResult<()> {
        self.check_thread()?;
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("QjsContext closed");
        }
        Ok(())
    }
}

/// Surface an already-rejected module evaluation promise as an error
unsafe fn reject_if_failed(ctx: *mut JSContext, value: &QjsValue) -> QjsResult<()> {
    // SAFETY: value belongs to ctx, owner thread
    unsafe {
        let raw = value.raw();
        if !JS_IsPromise(raw) {
            return Ok(());
        }
        if JS_PromiseState(ctx, raw) != JSPromiseStateEnum_JS_PROMISE_REJECTED {
            return Ok(());
        }
        let reason = JS_PromiseResult(ctx, raw);
        let error = error_from_value(ctx, reason);
        JS_FreeValue(ctx, reason);
        Err(error)
    }
}

/// Copy `text` into a NUL-terminated buffer
///
/// The engine reads sources by explicit length, so interior NUL bytes (valid
/// inside string literals) pass through; the trailing NUL is required by its
/// tokenizer.
pub(crate) fn nul_terminated(text: &str) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(text.len() + 1);
    buffer.extend_from_slice(text.as_bytes());
    buffer.push(0);
    buffer
}
