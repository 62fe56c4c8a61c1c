//! Integration tests for runtime lifecycle, jobs and limits

use qjs_core::{QjsError, QjsRuntime, RuntimeConfig};
use serial_test::serial;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::filter::EnvFilter;

/// Route engine logs to the test output; set RUST_LOG to see them
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn test_basic_eval() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    let result = context.eval("1 + 2").unwrap();
    assert!(result.is_integer().unwrap());
    assert_eq!(result.as_integer().unwrap(), 3);
}

#[test]
fn test_source_with_interior_nul() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    let result = context.eval("'a\u{0}b'.length").unwrap();
    assert_eq!(result.as_integer().unwrap(), 3);
}

#[test]
fn test_close_is_idempotent() {
    let runtime = QjsRuntime::new().unwrap();
    runtime.close().unwrap();
    runtime.close().unwrap();
    assert!(runtime.is_closed());
}

#[test]
fn test_operations_after_close() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();
    let value = context.eval("({ a: 1 })").unwrap();

    runtime.close().unwrap();

    assert!(matches!(
        runtime.create_context(),
        Err(QjsError::Closed { .. })
    ));
    assert!(matches!(runtime.post(|| Ok(())), Err(QjsError::Closed { .. })));
    assert!(matches!(
        runtime.run_event_loop(),
        Err(QjsError::Closed { .. })
    ));
    assert!(matches!(context.eval("1"), Err(QjsError::Closed { .. })));
    assert!(matches!(
        value.get_property("a"),
        Err(QjsError::Closed { .. })
    ));
}

#[test]
fn test_close_discards_queued_jobs() {
    let runtime = QjsRuntime::new().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let ran = ran.clone();
        runtime
            .post(move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
    }

    runtime.close().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_post_does_not_run_synchronously() {
    let runtime = QjsRuntime::new().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let counter = ran.clone();
    runtime
        .post(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    let stats = runtime.run_event_loop().unwrap();
    assert_eq!(stats.jobs_run, 1);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_posts_all_run_once() {
    const THREADS: usize = 8;
    const POSTS: usize = 250;

    let runtime = QjsRuntime::new().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    thread::scope(|scope| {
        for _ in 0..THREADS {
            let sender = runtime.job_sender();
            let ran = ran.clone();
            scope.spawn(move || {
                for _ in 0..POSTS {
                    let ran = ran.clone();
                    sender
                        .post(move || {
                            ran.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                }
            });
        }
    });

    let stats = runtime.run_event_loop().unwrap();
    assert_eq!(stats.jobs_run, THREADS * POSTS);
    assert_eq!(stats.jobs_failed, 0);
    assert_eq!(ran.load(Ordering::SeqCst), THREADS * POSTS);

    let stats = runtime.run_event_loop().unwrap();
    assert_eq!(stats.jobs_run, 0);
}

#[test]
fn test_failing_jobs_do_not_stop_the_drain() {
    init_tracing();
    let runtime = QjsRuntime::new().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    runtime
        .post(|| Err(QjsError::internal("job failed")))
        .unwrap();
    runtime.post(|| panic!("job panicked")).unwrap();
    let counter = ran.clone();
    runtime
        .post(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    let stats = runtime.run_event_loop().unwrap();
    assert_eq!(stats.jobs_run, 3);
    assert_eq!(stats.jobs_failed, 2);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_drain_runs_jobs_posted_by_jobs() {
    let runtime = QjsRuntime::new().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let owner = runtime.job_sender();
    let foreign = runtime.job_sender();
    let counter = ran.clone();
    runtime
        .post(move || {
            let nested = counter.clone();
            owner.post(move || {
                nested.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })?;
            let late = counter.clone();
            thread::spawn(move || {
                foreign.post(move || {
                    late.fetch_add(10, Ordering::SeqCst);
                    Ok(())
                })
            })
            .join()
            .unwrap()
        })
        .unwrap();

    // The job posted from the owner thread runs in the same call, the one
    // posted from another thread during the drain waits
    let stats = runtime.run_event_loop().unwrap();
    assert_eq!(stats.jobs_run, 2);
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    let stats = runtime.run_event_loop().unwrap();
    assert_eq!(stats.jobs_run, 1);
    assert_eq!(ran.load(Ordering::SeqCst), 11);
}

#[test]
fn test_busy_producer_does_not_starve_microtasks() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    context
        .eval("globalThis.done = false; Promise.resolve().then(() => { done = true; });")
        .unwrap();

    let sender = runtime.job_sender();
    let producer = {
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                if sender.post(|| Ok(())).is_err() {
                    break;
                }
                thread::yield_now();
            }
        })
    };

    thread::sleep(Duration::from_millis(10));

    let stats = runtime.run_event_loop().unwrap();
    stop.store(true, Ordering::SeqCst);
    producer.join().unwrap();

    assert_eq!(stats.microtasks_run, 1);
    assert!(context.eval("done").unwrap().as_boolean().unwrap());
}

#[test]
fn test_jobs_run_before_microtasks() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    context
        .eval("globalThis.order = []; Promise.resolve().then(() => order.push('microtask'));")
        .unwrap();

    let sender = context.job_sender();
    let (tx, rx) = std::sync::mpsc::channel::<()>();
    thread::spawn(move || {
        sender
            .post(move || {
                tx.send(()).unwrap();
                Ok(())
            })
            .unwrap();
    })
    .join()
    .unwrap();

    let stats = runtime.run_event_loop().unwrap();
    assert!(rx.try_recv().is_ok());
    assert_eq!(stats.jobs_run, 1);
    assert_eq!(stats.microtasks_run, 1);

    let order = context.eval("order.join(',')").unwrap();
    assert_eq!(order.as_string().unwrap(), "microtask");
}

#[test]
fn test_throwing_microtask_is_logged_and_loop_continues() {
    init_tracing();
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    context
        .eval(
            "globalThis.done = false;
             Promise.resolve().then(() => { throw new Error('bad'); });
             Promise.resolve().then(() => { done = true; });",
        )
        .unwrap();

    let stats = runtime.run_event_loop().unwrap();
    assert!(stats.microtasks_run >= 2);
    assert!(context.eval("done").unwrap().as_boolean().unwrap());
    assert!(!runtime.is_job_pending().unwrap());
}

#[test]
fn test_execute_pending_job_steps_once() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    context
        .eval("globalThis.n = 0; Promise.resolve().then(() => n++).then(() => n++);")
        .unwrap();

    assert!(runtime.is_job_pending().unwrap());
    assert!(runtime.execute_pending_job().unwrap());
    assert_eq!(context.eval("n").unwrap().as_integer().unwrap(), 1);

    runtime.run_event_loop().unwrap();
    assert_eq!(context.eval("n").unwrap().as_integer().unwrap(), 2);
    assert!(!runtime.execute_pending_job().unwrap());
}

#[test]
#[serial]
fn test_memory_limit() {
    let runtime = QjsRuntime::builder()
        .with_memory_limit(2 * 1024 * 1024)
        .build()
        .unwrap();
    let context = runtime.create_context().unwrap();

    let err = context
        .eval("let s = 'x'.repeat(10 * 1024 * 1024); s.length")
        .unwrap_err();
    assert!(err.is_script_error(), "unexpected error: {}", err);
    assert!(err.to_string().contains("out of memory"), "{}", err);
}

#[test]
#[serial]
fn test_stack_overflow() {
    let runtime = QjsRuntime::with_config(RuntimeConfig::new().max_stack_size(64 * 1024)).unwrap();
    let context = runtime.create_context().unwrap();

    let err = context
        .eval("function recurse(n) { return recurse(n + 1) + 1; } recurse(0)")
        .unwrap_err();
    assert!(err.is_script_error());
    assert_eq!(err.error_type(), "RangeError");
    assert!(err.to_string().contains("stack"), "{}", err);
}

#[test]
#[serial]
fn test_interrupt_from_another_thread() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();
    let handle = runtime.interrupt_handle();

    let watchdog = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        handle.interrupt();
    });

    let started = Instant::now();
    let err = context.eval("while (true) {}").unwrap_err();
    watchdog.join().unwrap();

    assert!(matches!(err, QjsError::Interrupted));
    assert!(started.elapsed() < Duration::from_secs(2));

    runtime.clear_interrupt();
    assert_eq!(context.eval("40 + 2").unwrap().as_integer().unwrap(), 42);
}

#[test]
#[serial]
fn test_interrupt_is_not_catchable() {
    let runtime = QjsRuntime::new().unwrap();
    let context = runtime.create_context().unwrap();

    runtime.interrupt();
    let err = context
        .eval("try { while (true) {} } catch (e) { 'caught' }")
        .unwrap_err();
    assert!(matches!(err, QjsError::Interrupted));
    runtime.clear_interrupt();
}

#[test]
fn test_without_std_lib() {
    let runtime = QjsRuntime::builder().without_std_lib().build().unwrap();
    let context = runtime.create_context().unwrap();

    let ty = context.eval("typeof Date").unwrap();
    assert_eq!(ty.as_string().unwrap(), "undefined");
    assert_eq!(context.eval("1 + 2").unwrap().as_integer().unwrap(), 3);
    assert_eq!(
        context.eval("typeof Promise").unwrap().as_string().unwrap(),
        "function"
    );
}

#[test]
fn test_config_accessor() {
    let config = RuntimeConfig::new().memory_limit(8 * 1024 * 1024);
    let runtime = QjsRuntime::with_config(config.clone()).unwrap();
    assert_eq!(runtime.config(), &config);
}
