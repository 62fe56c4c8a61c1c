//! JavaScript value handles

use rquickjs_sys::*;
use std::ffi::{CString, c_int};
use std::fmt;
use tracing::warn;

use crate::context::{ContextInner, QjsContext};
use crate::error::{QjsError, QjsResult, error_from_value, extract_exception};
use std::sync::Arc;

/// Coarse classification of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Undefined,
    Null,
    Boolean,
    /// Number stored as a 32-bit integer
    Integer,
    /// Number stored as a double
    Float,
    String,
    Symbol,
    BigInt,
    Array,
    Function,
    Object,
    /// Engine-internal values (modules, bytecode, ...)
    Other,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Undefined => "undefined",
            ValueType::Null => "null",
            ValueType::Boolean => "boolean",
            ValueType::Integer => "integer",
            ValueType::Float => "float",
            ValueType::String => "string",
            ValueType::Symbol => "symbol",
            ValueType::BigInt => "bigint",
            ValueType::Array => "array",
            ValueType::Function => "function",
            ValueType::Object => "object",
            ValueType::Other => "internal value",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
thread_local! {
    static RELEASES: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

#[cfg(test)]
pub(crate) fn release_count() -> usize {
    RELEASES.with(|count| count.get())
}

unsafe fn free_value(ctx: *mut JSContext, value: JSValue) {
    #[cfg(test)]
    RELEASES.with(|count| count.set(count.get() + 1));
    // SAFETY: caller owns exactly one reference to value on the owner thread
    unsafe { JS_FreeValue(ctx, value) };
}

/// Value release carried to the owner thread
struct ValueRelease {
    value: JSValue,
    context: Arc<ContextInner>,
}

// SAFETY: the value is only touched in Drop, and only on the owner thread
unsafe impl Send for ValueRelease {}

impl Drop for ValueRelease {
    fn drop(&mut self) {
        if self.context.runtime().is_owner_thread() {
            // SAFETY: owner thread; this payload holds the only reference
            unsafe { free_value(self.context.raw(), self.value) };
        } else {
            warn!("QjsValue release dropped off the owner thread, leaking value");
        }
    }
}

/// An owned reference to a JavaScript value
///
/// Each `QjsValue` holds exactly one engine reference, released on
/// [`close`](Self::close) or drop. Use [`dup`](Self::dup) for a second
/// independent reference.
///
/// The handle is `Send` so it can be moved into jobs and dropped anywhere,
/// but every operation checks the owner thread first. Dropping on another
/// thread hands the release to the runtime's job queue.
pub struct QjsValue {
    value: JSValue,
    ctx: QjsContext,
    closed: bool,
}

// SAFETY: every operation checks the owner thread before touching `value`,
// and foreign-thread drops defer the release to the owner thread.
unsafe impl Send for QjsValue {}
unsafe impl Sync for QjsValue {}

impl QjsValue {
    /// Wrap an owned value
    pub(crate) fn from_raw(ctx: QjsContext, value: JSValue) -> Self {
        Self {
            value,
            ctx,
            closed: false,
        }
    }

    /// Get the raw value without transferring ownership
    pub fn raw(&self) -> JSValue {
        self.value
    }

    /// Give up ownership of the engine reference without releasing it
    pub(crate) fn into_raw(mut self) -> JSValue {
        self.closed = true;
        self.value
    }

    /// The context this value belongs to
    pub fn context(&self) -> &QjsContext {
        &self.ctx
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Thread check, then value, context and runtime open checks
    pub(crate) fn guard(&self) -> QjsResult<*mut JSContext> {
        self.ctx.check_thread()?;
        if self.closed {
            return Err(QjsError::closed("QjsValue"));
        }
        self.ctx.guard()
    }

    /// Check that `other` is usable together with this value
    fn guard_peer(&self, other: &QjsValue) -> QjsResult<()> {
        if !self.ctx.same_context(&other.ctx) {
            return Err(QjsError::ContextMismatch);
        }
        if other.closed {
            return Err(QjsError::closed("QjsValue"));
        }
        Ok(())
    }

    /// Convert a thrown value into a structured error
    pub(crate) fn to_error(&self) -> QjsResult<QjsError> {
        let ctx = self.guard()?;
        // SAFETY: owner thread, value alive
        Ok(unsafe { error_from_value(ctx, self.value) })
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let inner = self.ctx.inner();
        if inner.runtime().is_owner_thread() {
            // SAFETY: owner thread; the context is alive while we hold it
            unsafe { free_value(inner.raw(), self.value) };
        } else {
            inner.runtime().defer_release(ValueRelease {
                value: self.value,
                context: inner.clone(),
            });
        }
    }

    /// Release the engine reference. Idempotent.
    pub fn close(&mut self) -> QjsResult<()> {
        self.ctx.check_thread()?;
        self.release();
        Ok(())
    }

    /// Create a second reference to the same value
    pub fn dup(&self) -> QjsResult<QjsValue> {
        let ctx = self.guard()?;
        // SAFETY: owner thread, value alive
        let value = unsafe { JS_DupValue(ctx, self.value) };
        Ok(QjsValue::from_raw(self.ctx.clone(), value))
    }

    // ---------------------------------------------------------------------
    // Extraction
    // ---------------------------------------------------------------------

    /// Convert using the engine's `ToInt32`
    pub fn as_integer(&self) -> QjsResult<i32> {
        let ctx = self.guard()?;
        let mut out = 0i32;
        // SAFETY: owner thread, value alive
        unsafe {
            if JS_ToInt32(ctx, &mut out, self.value) < 0 {
                return Err(extract_exception(ctx));
            }
        }
        Ok(out)
    }

    /// Convert using the engine's `ToNumber`
    pub fn as_double(&self) -> QjsResult<f64> {
        let ctx = self.guard()?;
        let mut out = 0f64;
        // SAFETY: owner thread, value alive
        unsafe {
            if JS_ToFloat64(ctx, &mut out, self.value) < 0 {
                return Err(extract_exception(ctx));
            }
        }
        Ok(out)
    }

    /// Convert using the engine's `ToBoolean`
    pub fn as_boolean(&self) -> QjsResult<bool> {
        let ctx = self.guard()?;
        // SAFETY: owner thread, value alive
        match unsafe { JS_ToBool(ctx, self.value) } {
            -1 => Err(unsafe { extract_exception(ctx) }),
            0 => Ok(false),
            _ => Ok(true),
        }
    }

    /// Convert using the engine's `toString`
    pub fn as_string(&self) -> QjsResult<String> {
        let ctx = self.guard()?;
        // SAFETY: owner thread, value alive
        unsafe { to_rust_string(ctx, self.value) }
    }

    /// Serialize with the engine's `JSON.stringify`
    pub fn as_json(&self) -> QjsResult<String> {
        let ctx = self.guard()?;
        let undefined = JS_MKVAL(JS_TAG_UNDEFINED, 0);
        // SAFETY: owner thread, value alive
        unsafe {
            let json = JS_JSONStringify(ctx, self.value, undefined, undefined);
            if JS_IsException(json) {
                return Err(extract_exception(ctx));
            }
            if JS_IsUndefined(json) {
                return Err(QjsError::unsupported_type(format!(
                    "{} has no JSON representation",
                    self.value_type()?
                )));
            }
            let result = to_rust_string(ctx, json);
            JS_FreeValue(ctx, json);
            result
        }
    }

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    fn check_tag(&self, predicate: unsafe fn(JSValue) -> bool) -> QjsResult<bool> {
        self.guard()?;
        // SAFETY: tag inspection only
        Ok(unsafe { predicate(self.value) })
    }

    pub fn is_null(&self) -> QjsResult<bool> {
        self.check_tag(JS_IsNull)
    }

    pub fn is_undefined(&self) -> QjsResult<bool> {
        self.check_tag(JS_IsUndefined)
    }

    pub fn is_boolean(&self) -> QjsResult<bool> {
        self.check_tag(JS_IsBool)
    }

    pub fn is_number(&self) -> QjsResult<bool> {
        self.check_tag(JS_IsNumber)
    }

    /// Whether the number is stored as a 32-bit integer
    pub fn is_integer(&self) -> QjsResult<bool> {
        self.check_tag(JS_IsInt)
    }

    pub fn is_string(&self) -> QjsResult<bool> {
        self.check_tag(JS_IsString)
    }

    pub fn is_object(&self) -> QjsResult<bool> {
        self.check_tag(JS_IsObject)
    }

    pub fn is_array(&self) -> QjsResult<bool> {
        self.guard()?;
        // SAFETY: class inspection only
        Ok(unsafe { JS_IsArray(self.value) })
    }

    pub fn is_error(&self) -> QjsResult<bool> {
        self.guard()?;
        // SAFETY: class inspection only
        Ok(unsafe { JS_IsError(self.value) })
    }

    pub fn is_promise(&self) -> QjsResult<bool> {
        self.guard()?;
        // SAFETY: class inspection only
        Ok(unsafe { JS_IsPromise(self.value) })
    }

    pub fn is_function(&self) -> QjsResult<bool> {
        let ctx = self.guard()?;
        // SAFETY: owner thread, value alive
        Ok(unsafe { JS_IsFunction(ctx, self.value) })
    }

    /// Classify the value
    pub fn value_type(&self) -> QjsResult<ValueType> {
        let ctx = self.guard()?;
        // SAFETY: owner thread, value alive
        let ty = unsafe {
            let v = self.value;
            if JS_IsUndefined(v) {
                ValueType::Undefined
            } else if JS_IsNull(v) {
                ValueType::Null
            } else if JS_IsBool(v) {
                ValueType::Boolean
            } else if JS_IsInt(v) {
                ValueType::Integer
            } else if JS_IsNumber(v) {
                ValueType::Float
            } else if JS_IsString(v) {
                ValueType::String
            } else if JS_IsSymbol(v) {
                ValueType::Symbol
            } else if JS_IsBigInt(v) {
                ValueType::BigInt
            } else if JS_IsObject(v) {
                if JS_IsFunction(ctx, v) {
                    ValueType::Function
                } else if JS_IsArray(v) {
                    ValueType::Array
                } else {
                    ValueType::Object
                }
            } else {
                ValueType::Other
            }
        };
        Ok(ty)
    }

    // ---------------------------------------------------------------------
    // Properties
    // ---------------------------------------------------------------------

    /// Get a named property
    pub fn get_property(&self, key: &str) -> QjsResult<QjsValue> {
        let ctx = self.guard()?;
        let key = property_key(key)?;
        // SAFETY: owner thread, value alive
        unsafe {
            let value = JS_GetPropertyStr(ctx, self.value, key.as_ptr());
            self.ctx.wrap(value)
        }
    }

    /// Get an indexed element
    pub fn get_index(&self, index: u32) -> QjsResult<QjsValue> {
        let ctx = self.guard()?;
        // SAFETY: owner thread, value alive
        unsafe {
            let value = JS_GetPropertyUint32(ctx, self.value, index);
            self.ctx.wrap(value)
        }
    }

    /// Set a named property. `value` keeps its own reference.
    pub fn set_property(&self, key: &str, value: &QjsValue) -> QjsResult<()> {
        let ctx = self.guard()?;
        self.guard_peer(value)?;
        let key = property_key(key)?;
        // SAFETY: the engine takes over the duplicated reference
        unsafe {
            let status = JS_SetPropertyStr(
                ctx,
                self.value,
                key.as_ptr(),
                JS_DupValue(ctx, value.value),
            );
            if status < 0 {
                return Err(extract_exception(ctx));
            }
        }
        Ok(())
    }

    /// Set an indexed element. `value` keeps its own reference.
    pub fn set_index(&self, index: u32, value: &QjsValue) -> QjsResult<()> {
        let ctx = self.guard()?;
        self.guard_peer(value)?;
        // SAFETY: the engine takes over the duplicated reference
        unsafe {
            let status = JS_SetPropertyUint32(ctx, self.value, index, JS_DupValue(ctx, value.value));
            if status < 0 {
                return Err(extract_exception(ctx));
            }
        }
        Ok(())
    }

    /// Check for a property, including inherited ones (`key in value`)
    pub fn has(&self, key: &str) -> QjsResult<bool> {
        let ctx = self.guard()?;
        let key = property_key(key)?;
        // SAFETY: owner thread; the atom is released before returning
        unsafe {
            let atom = JS_NewAtom(ctx, key.as_ptr());
            if atom == JS_ATOM_NULL {
                return Err(extract_exception(ctx));
            }
            let result = JS_HasProperty(ctx, self.value, atom);
            JS_FreeAtom(ctx, atom);
            if result < 0 {
                return Err(extract_exception(ctx));
            }
            Ok(result != 0)
        }
    }

    /// Own enumerable string keys, in property order
    pub fn keys(&self) -> QjsResult<Vec<String>> {
        let ctx = self.guard()?;
        let mut tab: *mut JSPropertyEnum = std::ptr::null_mut();
        let mut len: u32 = 0;
        // SAFETY: owner thread; the enumeration is freed before returning
        unsafe {
            let flags = (JS_GPN_STRING_MASK | JS_GPN_ENUM_ONLY) as c_int;
            if JS_GetOwnPropertyNames(ctx, &mut tab, &mut len, self.value, flags) < 0 {
                return Err(extract_exception(ctx));
            }

            let mut keys = Vec::with_capacity(len as usize);
            for entry in std::slice::from_raw_parts(tab, len as usize) {
                let mut key_len: size_t = 0;
                let ptr = JS_AtomToCStringLen(ctx, &mut key_len, entry.atom);
                if ptr.is_null() {
                    JS_FreePropertyEnum(ctx, tab, len);
                    return Err(extract_exception(ctx));
                }
                let bytes = std::slice::from_raw_parts(ptr as *const u8, key_len as usize);
                keys.push(String::from_utf8_lossy(bytes).into_owned());
                JS_FreeCString(ctx, ptr);
            }
            JS_FreePropertyEnum(ctx, tab, len);
            Ok(keys)
        }
    }

    /// The value's `length`
    pub fn length(&self) -> QjsResult<usize> {
        let ctx = self.guard()?;
        let mut len = 0i64;
        // SAFETY: owner thread, value alive
        unsafe {
            if JS_GetLength(ctx, self.value, &mut len) < 0 {
                return Err(extract_exception(ctx));
            }
        }
        Ok(len.max(0) as usize)
    }

    /// Iterate over `0..length` elements
    ///
    /// The length is read once up front.
    pub fn iter(&self) -> QjsResult<ArrayIter<'_>> {
        let len = self.length()?;
        let len = u32::try_from(len)
            .map_err(|_| QjsError::unsupported_type("array length exceeds u32"))?;
        Ok(ArrayIter {
            array: self,
            index: 0,
            len,
        })
    }

    // ---------------------------------------------------------------------
    // Calls
    // ---------------------------------------------------------------------

    /// Call this value as a function
    ///
    /// `this` defaults to `undefined`.
    pub fn call(&self, this: Option<&QjsValue>, args: &[&QjsValue]) -> QjsResult<QjsValue> {
        let ctx = self.guard()?;
        let this = match this {
            Some(this) => {
                self.guard_peer(this)?;
                this.value
            }
            None => JS_MKVAL(JS_TAG_UNDEFINED, 0),
        };
        let mut argv = self.raw_args(args)?;
        // SAFETY: owner thread; JS_Call borrows the arguments
        unsafe {
            let result = JS_Call(ctx, self.value, this, argv.len() as c_int, argv.as_mut_ptr());
            self.ctx.wrap(result)
        }
    }

    /// Call a method on this value (`value[name](...args)`)
    pub fn invoke_member(&self, name: &str, args: &[&QjsValue]) -> QjsResult<QjsValue> {
        let ctx = self.guard()?;
        let name = property_key(name)?;
        let mut argv = self.raw_args(args)?;
        // SAFETY: owner thread; the atom is released before returning
        unsafe {
            let atom = JS_NewAtom(ctx, name.as_ptr());
            if atom == JS_ATOM_NULL {
                return Err(extract_exception(ctx));
            }
            let result = JS_Invoke(ctx, self.value, atom, argv.len() as c_int, argv.as_mut_ptr());
            JS_FreeAtom(ctx, atom);
            self.ctx.wrap(result)
        }
    }

    fn raw_args(&self, args: &[&QjsValue]) -> QjsResult<Vec<JSValue>> {
        args.iter()
            .map(|arg| {
                self.guard_peer(arg)?;
                Ok(arg.value)
            })
            .collect()
    }
}

impl Drop for QjsValue {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for QjsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("QjsValue");
        match self.value_type() {
            Ok(ty) => s.field("type", &ty),
            Err(_) => s.field("closed", &self.closed),
        };
        s.finish()
    }
}

/// Iterator over array elements, yielding owned values
pub struct ArrayIter<'a> {
    array: &'a QjsValue,
    index: u32,
    len: u32,
}

impl Iterator for ArrayIter<'_> {
    type Item = QjsResult<QjsValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.len {
            return None;
        }
        let item = self.array.get_index(self.index);
        self.index += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.len - self.index) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ArrayIter<'_> {}

fn property_key(key: &str) -> QjsResult<CString> {
    CString::new(key).map_err(|_| QjsError::unsupported_type("property key contains a NUL byte"))
}

unsafe fn to_rust_string(ctx: *mut JSContext, value: JSValue) -> QjsResult<String> {
    // SAFETY: ctx and value valid per caller contract
    unsafe {
        let mut len: size_t = 0;
        let ptr = JS_ToCStringLen2(ctx, &mut len, value, false);
        if ptr.is_null() {
            return Err(extract_exception(ctx));
        }
        let bytes = std::slice::from_raw_parts(ptr as *const u8, len as usize);
        let result = String::from_utf8_lossy(bytes).into_owned();
        JS_FreeCString(ctx, ptr);
        Ok(result)
    }
}
