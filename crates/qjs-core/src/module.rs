//! ES module loading hook

use rquickjs_sys::*;
use std::ffi::{CStr, c_char, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use tracing::{debug, warn};

use crate::context::nul_terminated;
use crate::error::{ThrowKind, throw_error};
use crate::function::panic_message;

/// Resolves `import` specifiers to module source text
///
/// Called synchronously on the runtime's owner thread while a module is
/// being linked, once per distinct specifier. Returning `None` fails the
/// import with `ReferenceError: could not load module '<name>'`.
///
/// Implemented for any `Fn(&str) -> Option<String> + Send`.
///
/// # Example
///
/// ```
/// use qjs_core::{EvalMode, QjsRuntime};
///
/// let runtime = QjsRuntime::new().unwrap();
/// runtime
///     .set_module_loader(|name: &str| {
///         (name == "math").then(|| "export const answer = 42;".to_string())
///     })
///     .unwrap();
///
/// let context = runtime.create_context().unwrap();
/// context
///     .eval_with(
///         "import { answer } from 'math'; globalThis.result = answer;",
///         "main.mjs",
///         EvalMode::Module,
///     )
///     .unwrap();
/// runtime.run_event_loop().unwrap();
///
/// let result = context.get_global_object().unwrap().get_property("result").unwrap();
/// assert_eq!(result.as_integer().unwrap(), 42);
/// ```
pub trait ModuleLoader: Send + 'static {
    fn load(&self, name: &str) -> Option<String>;
}

impl<F> ModuleLoader for F
where
    F: Fn(&str) -> Option<String> + Send + 'static,
{
    fn load(&self, name: &str) -> Option<String> {
        self(name)
    }
}

pub(crate) type LoaderSlot = Box<dyn ModuleLoader>;

/// Engine-facing loader callback; `opaque` is the runtime's `LoaderSlot`
pub(crate) unsafe extern "C" fn load_module(
    ctx: *mut JSContext,
    module_name: *const c_char,
    opaque: *mut c_void,
) -> *mut JSModuleDef {
    // SAFETY: the runtime keeps the slot alive while it is registered
    let loader = unsafe { &*(opaque as *const LoaderSlot) };
    // SAFETY: the engine passes a NUL-terminated specifier
    let name = unsafe { CStr::from_ptr(module_name) }
        .to_string_lossy()
        .into_owned();

    let source = match panic::catch_unwind(AssertUnwindSafe(|| loader.load(&name))) {
        Ok(Some(source)) => source,
        Ok(None) => {
            debug!(module = %name, "Module not found");
            // SAFETY: owner thread, live context
            unsafe {
                throw_error(
                    ctx,
                    ThrowKind::Reference,
                    &format!("could not load module '{}'", name),
                )
            };
            return ptr::null_mut();
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(module = %name, panic = %message, "Module loader panicked");
            // SAFETY: owner thread, live context
            unsafe {
                throw_error(
                    ctx,
                    ThrowKind::Internal,
                    &format!("module loader panicked while loading '{}': {}", name, message),
                )
            };
            return ptr::null_mut();
        }
    };

    let source = nul_terminated(&source);

    debug!(module = %name, "Compiling module");
    // SAFETY: owner thread; compiling leaves the module owned by the
    // runtime, so the function value wrapping it is released right away
    unsafe {
        let compiled = JS_Eval(
            ctx,
            source.as_ptr().cast(),
            (source.len() - 1) as size_t,
            module_name,
            (JS_EVAL_TYPE_MODULE | JS_EVAL_FLAG_COMPILE_ONLY) as c_int,
        );
        if JS_IsException(compiled) {
            return ptr::null_mut();
        }
        let module = JS_VALUE_GET_PTR(compiled) as *mut JSModuleDef;
        JS_FreeValue(ctx, compiled);
        module
    }
}
