//! Integration tests for value creation, introspection and properties

use qjs_core::{QjsError, QjsRuntime, ValueType};

#[test]
fn test_array_access() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    let array = context.eval("['A', 'B', 'C']").unwrap();
    assert!(array.is_array().unwrap());
    assert_eq!(array.length().unwrap(), 3);
    assert_eq!(array.get_index(1).unwrap().as_string().unwrap(), "B");
    assert!(array.get_index(5).unwrap().is_undefined().unwrap());
}

#[test]
fn test_object_properties() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    let object = context.eval("({ x: 100, y: 200 })").unwrap();
    assert!(object.is_object().unwrap());
    assert!(!object.is_array().unwrap());
    assert_eq!(object.get_property("x").unwrap().as_integer().unwrap(), 100);
    assert_eq!(object.keys().unwrap(), vec!["x".to_string(), "y".to_string()]);
}

#[test]
fn test_keys_skip_non_enumerable() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    let object = context
        .eval("const o = { a: 1 }; Object.defineProperty(o, 'hidden', { value: 2 }); o")
        .unwrap();
    assert_eq!(object.keys().unwrap(), vec!["a".to_string()]);
    assert!(object.has("hidden").unwrap());
}

#[test]
fn test_set_property_and_index() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    let object = context.create_object().unwrap();
    let name = context.create_string("qjs").unwrap();
    object.set_property("name", &name).unwrap();

    let array = context.create_array().unwrap();
    array.set_index(0, &context.create_integer(10).unwrap()).unwrap();
    array.set_index(1, &context.create_boolean(true).unwrap()).unwrap();
    object.set_property("items", &array).unwrap();

    // The caller's handle stays valid after being stored
    assert_eq!(name.as_string().unwrap(), "qjs");
    assert_eq!(object.as_json().unwrap(), r#"{"name":"qjs","items":[10,true]}"#);
}

#[test]
fn test_has_includes_inherited() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    let object = context.eval("({ own: 1 })").unwrap();
    assert!(object.has("own").unwrap());
    assert!(object.has("toString").unwrap());
    assert!(!object.has("missing").unwrap());
}

#[test]
fn test_iter_yields_owned_values() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    let array = context.eval("[1, 2, 3, 4]").unwrap();
    let iter = array.iter().unwrap();
    assert_eq!(iter.len(), 4);

    let sum: i32 = iter.map(|item| item.unwrap().as_integer().unwrap()).sum();
    assert_eq!(sum, 10);
}

#[test]
fn test_call_and_invoke_member() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    let add = context.eval("(function (a, b) { return a + b; })").unwrap();
    assert!(add.is_function().unwrap());
    let a = context.create_integer(40).unwrap();
    let b = context.create_integer(2).unwrap();
    assert_eq!(add.call(None, &[&a, &b]).unwrap().as_integer().unwrap(), 42);

    let this_fn = context.eval("(function () { return this.value; })").unwrap();
    let receiver = context.eval("({ value: 'bound' })").unwrap();
    assert_eq!(
        this_fn.call(Some(&receiver), &[]).unwrap().as_string().unwrap(),
        "bound"
    );

    let text = context.create_string("a,b,c").unwrap();
    let separator = context.create_string(",").unwrap();
    let parts = text.invoke_member("split", &[&separator]).unwrap();
    assert_eq!(parts.length().unwrap(), 3);
}

#[test]
fn test_call_propagates_thrown_error() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    let thrower = context.eval("(function () { throw new TypeError('nope'); })").unwrap();
    let err = thrower.call(None, &[]).unwrap_err();
    assert_eq!(err.error_type(), "TypeError");
    assert!(err.to_string().contains("TypeError: nope"));
}

#[test]
fn test_conversions() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    let number = context.create_double(3.75).unwrap();
    assert!(number.is_number().unwrap());
    assert!(!number.is_integer().unwrap());
    assert_eq!(number.as_double().unwrap(), 3.75);
    assert_eq!(number.as_integer().unwrap(), 3);
    assert_eq!(number.as_string().unwrap(), "3.75");

    let text = context.create_string("42").unwrap();
    assert_eq!(text.as_integer().unwrap(), 42);
    assert!(text.as_boolean().unwrap());

    assert!(context.create_null().unwrap().is_null().unwrap());
    assert!(context.create_undefined().unwrap().is_undefined().unwrap());
    assert!(!context.create_boolean(false).unwrap().as_boolean().unwrap());
}

#[test]
fn test_as_json_without_representation() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    let undefined = context.create_undefined().unwrap();
    assert!(matches!(
        undefined.as_json(),
        Err(QjsError::UnsupportedType { .. })
    ));

    let function = context.eval("(() => 1)").unwrap();
    assert!(matches!(
        function.as_json(),
        Err(QjsError::UnsupportedType { .. })
    ));
}

#[test]
fn test_parse_json() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    let value = context.parse_json(r#"{"list": [1, 2], "ok": true}"#).unwrap();
    assert_eq!(value.get_property("list").unwrap().length().unwrap(), 2);
    assert!(value.get_property("ok").unwrap().as_boolean().unwrap());

    let err = context.parse_json("{ invalid").unwrap_err();
    assert!(matches!(err, QjsError::SyntaxError { .. }));
}

#[test]
fn test_create_error() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    let error = context.create_error("went wrong").unwrap();
    assert!(error.is_error().unwrap());
    assert_eq!(error.as_string().unwrap(), "Error: went wrong");
    assert!(error.keys().unwrap().is_empty());
}

#[test]
fn test_set_global() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    let value = context.create_integer(41).unwrap();
    context.set_global("answer", &value).unwrap();
    assert_eq!(context.eval("answer + 1").unwrap().as_integer().unwrap(), 42);
}

#[test]
fn test_dup_is_independent() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    let mut original = context.eval("({ n: 1 })").unwrap();
    let copy = original.dup().unwrap();
    original.close().unwrap();

    assert!(matches!(original.get_property("n"), Err(QjsError::Closed { .. })));
    assert_eq!(copy.get_property("n").unwrap().as_integer().unwrap(), 1);
}

#[test]
fn test_closed_value_rejects_every_operation() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();
    let mut value = context.eval("[1]").unwrap();
    let other = context.create_integer(1).unwrap();

    value.close().unwrap();
    value.close().unwrap();
    assert!(value.is_closed());

    let closed = |err: QjsError| matches!(err, QjsError::Closed { resource: "QjsValue" });
    assert!(closed(value.as_integer().unwrap_err()));
    assert!(closed(value.as_string().unwrap_err()));
    assert!(closed(value.is_array().unwrap_err()));
    assert!(closed(value.value_type().unwrap_err()));
    assert!(closed(value.get_index(0).unwrap_err()));
    assert!(closed(value.set_index(0, &other).unwrap_err()));
    assert!(closed(value.length().unwrap_err()));
    assert!(closed(value.call(None, &[]).unwrap_err()));
    assert!(closed(value.dup().unwrap_err()));

    // Closed values are also rejected as arguments
    let array = context.create_array().unwrap();
    assert!(closed(array.set_index(0, &value).unwrap_err()));
}

#[test]
fn test_context_mismatch() {
    let runtime = QjsRuntime::new().unwrap();
    let first = runtime.create_context().unwrap();
    let second = runtime.create_context().unwrap();

    let object = first.create_object().unwrap();
    let foreign = second.create_integer(1).unwrap();
    assert!(matches!(
        object.set_property("x", &foreign),
        Err(QjsError::ContextMismatch)
    ));
}

#[test]
fn test_value_type_of_promise() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    let promise = context.eval("Promise.resolve(1)").unwrap();
    assert!(promise.is_promise().unwrap());
    assert_eq!(promise.value_type().unwrap(), ValueType::Object);
}
