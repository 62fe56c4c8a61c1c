//! Host functions callable from JavaScript

use rquickjs_sys::*;
use std::any::Any;
use std::ffi::{CString, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use tracing::warn;

use crate::context::QjsContext;
use crate::error::{QjsError, QjsResult, ThrowKind, throw_error};
use crate::value::QjsValue;

/// Signature of a host function: `(context, this, arguments) -> result`
pub type HostFunction = dyn Fn(&QjsContext, &QjsValue, &[QjsValue]) -> QjsResult<QjsValue> + 'static;

type CallbackBox = Box<HostFunction>;

impl QjsContext {
    /// Create a JavaScript function backed by a Rust closure
    ///
    /// The closure lives exactly as long as the function object. An `Err`
    /// return is thrown into the script as an `Error` with the error's
    /// message; a panic is thrown as an `InternalError`.
    ///
    /// Closures should reach the engine through the context they are
    /// given rather than capturing this context or its values, which would
    /// keep the context alive for as long as the function is.
    ///
    /// # Example
    ///
    /// ```
    /// use qjs_core::QjsRuntime;
    ///
    /// let runtime = QjsRuntime::new().unwrap();
    /// let context = runtime.create_context().unwrap();
    ///
    /// let add = context
    ///     .create_function(
    ///         |ctx, _this, args| {
    ///             let sum = args.iter().map(|a| a.as_integer()).sum::<Result<i32, _>>()?;
    ///             ctx.create_integer(sum)
    ///         },
    ///         "add",
    ///         2,
    ///     )
    ///     .unwrap();
    /// context.set_global("add", &add).unwrap();
    ///
    /// assert_eq!(context.eval("add(40, 2)").unwrap().as_integer().unwrap(), 42);
    /// ```
    pub fn create_function<F>(&self, callback: F, name: &str, arity: u32) -> QjsResult<QjsValue>
    where
        F: Fn(&QjsContext, &QjsValue, &[QjsValue]) -> QjsResult<QjsValue> + 'static,
    {
        let ctx = self.guard()?;
        let name = CString::new(name)
            .map_err(|_| QjsError::unsupported_type("function name contains a NUL byte"))?;
        let arity = c_int::try_from(arity)
            .map_err(|_| QjsError::unsupported_type("function arity exceeds i32"))?;

        let callback: CallbackBox = Box::new(callback);
        let opaque = Box::into_raw(Box::new(callback)) as *mut c_void;

        // SAFETY: owner thread; ownership of `opaque` passes to the closure
        // record and is reclaimed by `finalize_callback`. If creation fails
        // the engine may or may not have run the finalizer, so the box is
        // left alone.
        unsafe {
            let function = JS_NewCClosure(
                ctx,
                Some(call_trampoline),
                name.as_ptr(),
                Some(finalize_callback),
                arity,
                0,
                opaque,
            );
            self.wrap(function)
        }
    }
}

unsafe extern "C" fn call_trampoline(
    ctx: *mut JSContext,
    this: JSValue,
    argc: c_int,
    argv: *mut JSValue,
    _magic: c_int,
    opaque: *mut c_void,
) -> JSValue {
    // SAFETY: opaque is the CallbackBox installed by create_function and
    // stays alive until the function object is finalized
    let callback = unsafe { &*(opaque as *const CallbackBox) };

    // SAFETY: the engine only calls us on the owner thread with a live context
    let Some(context) = (unsafe { QjsContext::from_raw(ctx) }) else {
        return unsafe { throw_error(ctx, ThrowKind::Internal, "context is closed") };
    };

    // SAFETY: this and argv are borrowed; dup gives each wrapper its own reference
    let (this, args) = unsafe {
        let this = QjsValue::from_raw(context.clone(), JS_DupValue(ctx, this));
        let args: Vec<QjsValue> = (0..argc.max(0) as usize)
            .map(|i| QjsValue::from_raw(context.clone(), JS_DupValue(ctx, *argv.add(i))))
            .collect();
        (this, args)
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| callback(&context, &this, &args)));

    // SAFETY: owner thread; the throw helpers return the exception marker
    unsafe {
        match result {
            Ok(Ok(value)) => {
                if !value.context().same_context(&context) {
                    return throw_error(ctx, ThrowKind::Internal, &QjsError::ContextMismatch.to_string());
                }
                if value.is_closed() {
                    return throw_error(ctx, ThrowKind::Internal, "host function returned a closed value");
                }
                value.into_raw()
            }
            Ok(Err(error)) => throw_error(ctx, ThrowKind::Error, &error.to_string()),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(panic = %message, "Host function panicked");
                throw_error(ctx, ThrowKind::Internal, &format!("host function panicked: {}", message))
            }
        }
    }
}

unsafe extern "C" fn finalize_callback(opaque: *mut c_void) {
    // SAFETY: called exactly once by the engine when the function object dies
    let callback = unsafe { Box::from_raw(opaque as *mut CallbackBox) };
    if panic::catch_unwind(AssertUnwindSafe(move || drop(callback))).is_err() {
        warn!("Host function panicked while being dropped");
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QjsRuntime;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_callback_freed_with_function() {
        struct Flag(Rc<Cell<bool>>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let runtime = QjsRuntime::new().unwrap();
        let context = runtime.create_context().unwrap();
        let dropped = Rc::new(Cell::new(false));

        let flag = Flag(dropped.clone());
        let function = context
            .create_function(
                move |ctx, _, _| {
                    let _ = &flag;
                    ctx.create_undefined()
                },
                "noop",
                0,
            )
            .unwrap();
        assert!(!dropped.get());

        drop(function);
        assert!(dropped.get());
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");

        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
