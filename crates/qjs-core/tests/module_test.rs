//! Integration tests for ES module evaluation and the loader hook

use qjs_core::{EvalMode, QjsError, QjsRuntime};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn global_int(context: &qjs_core::QjsContext, name: &str) -> i32 {
    context
        .get_global_object()
        .unwrap()
        .get_property(name)
        .unwrap()
        .as_integer()
        .unwrap()
}

#[test]
fn test_import_through_loader() {
    let runtime = QjsRuntime::new().unwrap();
    runtime
        .set_module_loader(|name: &str| {
            (name == "foo").then(|| "export const bar = 42;".to_string())
        })
        .unwrap();
    let context = runtime.create_context().unwrap();

    context
        .eval_with(
            "import { bar } from 'foo'; globalThis.result = bar;",
            "main.mjs",
            EvalMode::Module,
        )
        .unwrap();
    runtime.run_event_loop().unwrap();

    assert_eq!(global_int(&context, "result"), 42);
}

#[test]
fn test_missing_module_fails() {
    let runtime = QjsRuntime::new().unwrap();
    runtime
        .set_module_loader(|_: &str| -> Option<String> { None })
        .unwrap();
    let context = runtime.create_context().unwrap();

    let err = context
        .eval_with("import { x } from 'missing';", "main.mjs", EvalMode::Module)
        .unwrap_err();
    assert!(err.is_script_error());
    assert!(err.to_string().contains("could not load module 'missing'"), "{}", err);
}

#[test]
fn test_loader_called_once_per_module() {
    let calls = Arc::new(AtomicUsize::new(0));
    let sources: HashMap<&'static str, &'static str> = HashMap::from([
        ("shared", "export let count = 1;"),
        ("a", "import { count } from 'shared'; export const a = count + 1;"),
        ("b", "import { count } from 'shared'; export const b = count + 2;"),
    ]);

    let runtime = QjsRuntime::new().unwrap();
    {
        let calls = calls.clone();
        runtime
            .set_module_loader(move |name: &str| {
                calls.fetch_add(1, Ordering::SeqCst);
                sources.get(name).map(|s| s.to_string())
            })
            .unwrap();
    }
    let context = runtime.create_context().unwrap();

    context
        .eval_with(
            "import { a } from 'a'; import { b } from 'b'; globalThis.sum = a + b;",
            "main.mjs",
            EvalMode::Module,
        )
        .unwrap();
    runtime.run_event_loop().unwrap();

    assert_eq!(global_int(&context, "sum"), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_module_evaluation_error() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    let err = context
        .eval_with("throw new RangeError('module failed');", "main.mjs", EvalMode::Module)
        .unwrap_err();
    assert_eq!(err.error_type(), "RangeError");
    assert!(err.to_string().contains("module failed"));
}

#[test]
fn test_module_syntax_error_in_dependency() {
    let runtime = QjsRuntime::new().unwrap();
    runtime
        .set_module_loader(|_: &str| Some("export const = ;".to_string()))
        .unwrap();
    let context = runtime.create_context().unwrap();

    let err = context
        .eval_with("import 'broken';", "main.mjs", EvalMode::Module)
        .unwrap_err();
    assert!(matches!(err, QjsError::SyntaxError { .. }), "{:?}", err);
}

#[test]
fn test_module_source_with_interior_nul() {
    let runtime = QjsRuntime::new().unwrap();
    runtime
        .set_module_loader(|_: &str| Some("export const text = 'a\u{0}b';".to_string()))
        .unwrap();
    let context = runtime.create_context().unwrap();

    context
        .eval_with(
            "import { text } from 'nul'; globalThis.size = text.length;",
            "main.mjs",
            EvalMode::Module,
        )
        .unwrap();
    runtime.run_event_loop().unwrap();
    assert_eq!(global_int(&context, "size"), 3);
}

#[test]
fn test_panicking_loader() {
    let runtime = QjsRuntime::new().unwrap();
    runtime
        .set_module_loader(|_: &str| -> Option<String> { panic!("loader exploded") })
        .unwrap();
    let context = runtime.create_context().unwrap();

    let err = context
        .eval_with("import 'anything';", "main.mjs", EvalMode::Module)
        .unwrap_err();
    assert_eq!(err.error_type(), "InternalError");
    assert!(err.to_string().contains("loader exploded"));
}

#[test]
fn test_replacing_loader() {
    let runtime = QjsRuntime::new().unwrap();
    runtime
        .set_module_loader(|_: &str| Some("export default 1;".to_string()))
        .unwrap();
    runtime
        .set_module_loader(|_: &str| Some("export default 2;".to_string()))
        .unwrap();
    let context = runtime.create_context().unwrap();

    context
        .eval_with(
            "import value from 'x'; globalThis.value = value;",
            "main.mjs",
            EvalMode::Module,
        )
        .unwrap();
    runtime.run_event_loop().unwrap();
    assert_eq!(global_int(&context, "value"), 2);
}

#[test]
fn test_module_result_is_promise() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    let result = context
        .eval_with("export const x = 1;", "main.mjs", EvalMode::Module)
        .unwrap();
    assert!(result.is_promise().unwrap());
}
