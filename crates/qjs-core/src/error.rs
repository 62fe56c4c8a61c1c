//! Core error types for QuickJS operations
//!
//! Every failure that crosses the native boundary is translated into
//! [`QjsError`] here. Thrown script values are classified by their `name`
//! property so callers can tell syntax errors, reference errors and other
//! thrown values apart without parsing messages.

use rquickjs_sys::*;
use std::ffi::CString;
use std::thread::ThreadId;
use thiserror::Error;

/// Result type alias for QuickJS operations
pub type QjsResult<T> = Result<T, QjsError>;

/// Structured error types for QuickJS operations
#[derive(Debug, Error)]
pub enum QjsError {
    /// A runtime, context or value was touched from a thread other than the
    /// one that created the runtime
    #[error("QjsRuntime is owned by thread {owner:?} but was accessed from thread {current:?}")]
    ThreadAffinity { owner: ThreadId, current: ThreadId },

    /// Use of a handle after `close()`
    #[error("{resource} is closed")]
    Closed { resource: &'static str },

    /// Native allocation of a runtime or context failed
    #[error("Initialization failed: {message}")]
    Initialization { message: String },

    /// Host <-> engine conversion of an unrepresentable type
    #[error("Unsupported type: {message}")]
    UnsupportedType { message: String },

    /// Script failed to parse
    #[error("SyntaxError: {message}{}", format_stack(stack))]
    SyntaxError {
        message: String,
        stack: Option<String>,
    },

    /// Script referenced an unbound identifier (or an unresolvable module)
    #[error("ReferenceError: {message}{}", format_stack(stack))]
    ReferenceError {
        message: String,
        stack: Option<String>,
    },

    /// Any other thrown value. `message` is the value's string form.
    #[error("{message}{}", format_stack(stack))]
    ScriptException {
        error_type: String,
        message: String,
        stack: Option<String>,
    },

    /// Execution was aborted by `interrupt()`
    #[error("Script execution interrupted")]
    Interrupted,

    /// A value was used with a context it does not belong to
    #[error("Value belongs to a different context")]
    ContextMismatch,

    /// Reading a script from disk failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal/unexpected error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_stack(stack: &Option<String>) -> String {
    match stack.as_deref().map(str::trim_end) {
        Some(s) if !s.is_empty() => format!("\n{}", s),
        _ => String::new(),
    }
}

impl QjsError {
    /// Create a closed-resource error
    pub fn closed(resource: &'static str) -> Self {
        Self::Closed { resource }
    }

    /// Create an initialization error
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization {
            message: message.into(),
        }
    }

    /// Create an unsupported type error
    pub fn unsupported_type(message: impl Into<String>) -> Self {
        Self::UnsupportedType {
            message: message.into(),
        }
    }

    /// Create a script exception from an error type and the thrown value's string form
    pub fn script_exception(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ScriptException {
            error_type: error_type.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this error originated from script code
    pub fn is_script_error(&self) -> bool {
        matches!(
            self,
            Self::SyntaxError { .. }
                | Self::ReferenceError { .. }
                | Self::ScriptException { .. }
                | Self::Interrupted
        )
    }

    /// Get the stack trace if available
    pub fn stack_trace(&self) -> Option<&str> {
        match self {
            Self::SyntaxError { stack, .. }
            | Self::ReferenceError { stack, .. }
            | Self::ScriptException { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }

    /// Get the error type name (e.g., "TypeError", "ReferenceError")
    pub fn error_type(&self) -> &str {
        match self {
            Self::ThreadAffinity { .. } => "ThreadAffinityError",
            Self::Closed { .. } => "ClosedResourceError",
            Self::Initialization { .. } => "InitializationError",
            Self::UnsupportedType { .. } => "UnsupportedTypeError",
            Self::SyntaxError { .. } => "SyntaxError",
            Self::ReferenceError { .. } => "ReferenceError",
            Self::ScriptException { error_type, .. } => error_type,
            Self::Interrupted => "Interrupted",
            Self::ContextMismatch => "ContextMismatchError",
            Self::Io(_) => "IoError",
            Self::Json(_) => "JsonError",
            Self::Internal(_) => "InternalError",
        }
    }
}

/// Take the pending exception out of `ctx` and convert it into a [`QjsError`]
///
/// # Safety
/// `ctx` must be a live context and the call must happen on its runtime's
/// owner thread.
pub unsafe fn extract_exception(ctx: *mut JSContext) -> QjsError {
    // SAFETY: ctx is valid per caller contract
    unsafe {
        let exception = JS_GetException(ctx);
        let error = error_from_value(ctx, exception);
        JS_FreeValue(ctx, exception);
        error
    }
}

/// Classify a thrown value without taking ownership of it
///
/// # Safety
/// `ctx` must be a live context and `value` a value of that context.
pub(crate) unsafe fn error_from_value(ctx: *mut JSContext, value: JSValue) -> QjsError {
    // SAFETY: ctx and value are valid per caller contract
    unsafe {
        if JS_IsUncatchableError(value) {
            return QjsError::Interrupted;
        }

        if !JS_IsError(value) {
            // throw "string", throw 42, ...
            let message = value_to_string(ctx, value).unwrap_or_else(|| "Unknown error".into());
            return QjsError::script_exception("Error", message);
        }

        let error_type = get_string_property(ctx, value, c"name").unwrap_or_else(|| "Error".into());
        let message = get_string_property(ctx, value, c"message").unwrap_or_default();
        let stack = get_string_property(ctx, value, c"stack").filter(|s| !s.trim().is_empty());

        match error_type.as_str() {
            "SyntaxError" => QjsError::SyntaxError { message, stack },
            "ReferenceError" => QjsError::ReferenceError { message, stack },
            _ => {
                let message = value_to_string(ctx, value)
                    .unwrap_or_else(|| format!("{}: {}", error_type, message));
                QjsError::ScriptException {
                    error_type,
                    message,
                    stack,
                }
            }
        }
    }
}

/// Which engine error constructor to throw with
#[derive(Debug, Clone, Copy)]
pub(crate) enum ThrowKind {
    Error,
    Internal,
    Reference,
    Type,
}

/// Throw a new error into the engine and return the exception marker
///
/// # Safety
/// `ctx` must be a live context on its owner thread.
pub(crate) unsafe fn throw_error(ctx: *mut JSContext, kind: ThrowKind, message: &str) -> JSValue {
    let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
    // SAFETY: the format string consumes exactly one C string argument
    unsafe {
        match kind {
            ThrowKind::Error => JS_ThrowPlainError(ctx, c"%s".as_ptr(), message.as_ptr()),
            ThrowKind::Internal => JS_ThrowInternalError(ctx, c"%s".as_ptr(), message.as_ptr()),
            ThrowKind::Reference => JS_ThrowReferenceError(ctx, c"%s".as_ptr(), message.as_ptr()),
            ThrowKind::Type => JS_ThrowTypeError(ctx, c"%s".as_ptr(), message.as_ptr()),
        }
    }
}

/// Convert a value to a Rust string using engine `toString` semantics
///
/// Returns `None` (and clears the pending exception) if conversion throws.
pub(crate) unsafe fn value_to_string(ctx: *mut JSContext, value: JSValue) -> Option<String> {
    // SAFETY: ctx and value are valid per caller contract
    unsafe {
        let mut len: size_t = 0;
        let ptr = JS_ToCStringLen2(ctx, &mut len, value, false);
        if ptr.is_null() {
            JS_FreeValue(ctx, JS_GetException(ctx));
            return None;
        }
        let bytes = std::slice::from_raw_parts(ptr as *const u8, len as usize);
        let result = String::from_utf8_lossy(bytes).into_owned();
        JS_FreeCString(ctx, ptr);
        Some(result)
    }
}

unsafe fn get_string_property(
    ctx: *mut JSContext,
    object: JSValue,
    name: &std::ffi::CStr,
) -> Option<String> {
    // SAFETY: ctx and object are valid per caller contract
    unsafe {
        let value = JS_GetPropertyStr(ctx, object, name.as_ptr());
        if JS_IsException(value) {
            JS_FreeValue(ctx, JS_GetException(ctx));
            return None;
        }
        let result = if JS_IsUndefined(value) || JS_IsNull(value) {
            None
        } else {
            value_to_string(ctx, value)
        };
        JS_FreeValue(ctx, value);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_exception_display() {
        let err = QjsError::script_exception("Error", "Error: foo");
        assert_eq!(err.to_string(), "Error: foo");
        assert_eq!(err.error_type(), "Error");
        assert!(err.is_script_error());
    }

    #[test]
    fn test_stack_is_appended() {
        let err = QjsError::ScriptException {
            error_type: "Error".into(),
            message: "Error: Inside foo".into(),
            stack: Some("    at foo (<input>:1:23)\n    at bar (<input>:1:55)\n".into()),
        };

        assert_eq!(
            err.to_string(),
            "Error: Inside foo\n    at foo (<input>:1:23)\n    at bar (<input>:1:55)"
        );
        assert_eq!(
            err.stack_trace(),
            Some("    at foo (<input>:1:23)\n    at bar (<input>:1:55)\n")
        );
    }

    #[test]
    fn test_syntax_and_reference_errors() {
        let syntax = QjsError::SyntaxError {
            message: "unexpected token in expression: ';'".into(),
            stack: None,
        };
        assert_eq!(
            syntax.to_string(),
            "SyntaxError: unexpected token in expression: ';'"
        );
        assert_eq!(syntax.error_type(), "SyntaxError");

        let reference = QjsError::ReferenceError {
            message: "unknownVar is not defined".into(),
            stack: Some(String::new()),
        };
        assert_eq!(reference.to_string(), "ReferenceError: unknownVar is not defined");
        assert!(reference.is_script_error());
    }

    #[test]
    fn test_resource_errors() {
        let closed = QjsError::closed("QjsValue");
        assert_eq!(closed.to_string(), "QjsValue is closed");
        assert_eq!(closed.error_type(), "ClosedResourceError");
        assert!(!closed.is_script_error());
        assert!(closed.stack_trace().is_none());

        let owner = std::thread::current().id();
        let current = std::thread::spawn(|| std::thread::current().id())
            .join()
            .unwrap();
        let affinity = QjsError::ThreadAffinity { owner, current };
        assert!(affinity.to_string().contains("thread"));
        assert_eq!(affinity.error_type(), "ThreadAffinityError");
    }

    #[test]
    fn test_interrupted() {
        let err = QjsError::Interrupted;
        assert!(err.to_string().contains("interrupted"));
        assert!(err.is_script_error());
    }

    #[test]
    fn test_internal_error() {
        let err = QjsError::internal("something went wrong");
        assert_eq!(err.to_string(), "Internal error: something went wrong");
    }
}
