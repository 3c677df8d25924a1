//! End-to-end pool behavior: dispatch, backpressure, cancellation,
//! crash recovery, transfer and observability.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use lagoon::{
    AbortToken, Buffer, Job, Movable, Payload, Pool, PoolError, QueueLimit, ResourceLimits,
    module_registry,
};

/// Register a module that blocks until its payload gate receives a unit.
fn gate_module(name: &str) {
    module_registry().register(name, |ctx| {
        let gate = ctx
            .payload
            .downcast::<Receiver<()>>()
            .map_err(|_| "expected a gate receiver".to_string())?;
        let _ = gate.recv();
        Ok(Payload::new(()))
    });
}

/// Register a module that forwards `(value, sender)` payloads in arrival order.
fn order_module(name: &str) {
    module_registry().register(name, |ctx| {
        let (value, out) = ctx
            .payload
            .downcast::<(i64, Sender<i64>)>()
            .map_err(|_| "expected (value, sender)".to_string())?;
        std::thread::sleep(Duration::from_millis(2));
        let _ = out.send(value);
        Ok(Payload::new(()))
    });
}

#[test]
fn test_submit_yields_module_result_and_records_metrics() {
    module_registry().register("itest::double", |ctx| {
        let n = ctx
            .payload
            .downcast::<i64>()
            .map_err(|_| "expected i64".to_string())?;
        Ok(Payload::new(n * 2))
    });

    let pool = Pool::builder()
        .module_name("itest::double")
        .min_threads(1)
        .max_threads(2)
        .build()
        .unwrap();

    let result = pool.submit(Payload::new(2i64)).wait().unwrap();
    assert_eq!(result.downcast::<i64>().ok(), Some(4));
    assert_eq!(pool.completed(), 1);
    assert!(pool.run_time().count >= 1);
    assert!(pool.wait_time().count >= 1);
    assert!(pool.duration() > Duration::ZERO);

    let metrics = pool.metrics();
    assert_eq!(metrics.completed, 1);
    assert_eq!(metrics.queue_size, 0);
    assert_eq!(metrics.threads, pool.thread_count());
}

#[test]
fn test_overflow_queues_then_drains() {
    gate_module("itest::gate-drain");
    let pool = Pool::builder()
        .module_name("itest::gate-drain")
        .min_threads(2)
        .max_threads(2)
        .build()
        .unwrap();

    let drained = Arc::new(AtomicUsize::new(0));
    let drained_clone = drained.clone();
    pool.on_drain().connect(move |_| {
        drained_clone.fetch_add(1, Ordering::SeqCst);
    });

    let (release, gate) = unbounded::<()>();
    let handles: Vec<_> = (0..4)
        .map(|_| pool.submit(Payload::new(gate.clone())))
        .collect();

    std::thread::sleep(Duration::from_millis(100));
    // Two tasks run, two wait; no workers are warming up.
    assert_eq!(pool.queue_size(), 2);

    for _ in 0..4 {
        release.send(()).unwrap();
    }
    for handle in handles {
        handle.wait().unwrap();
    }
    assert!(drained.load(Ordering::SeqCst) >= 1);
    assert_eq!(pool.completed(), 4);
}

#[test]
fn test_zero_queue_rejects_when_worker_busy() {
    gate_module("itest::gate-zero");
    let pool = Pool::builder()
        .module_name("itest::gate-zero")
        .min_threads(1)
        .max_threads(1)
        .max_queue(QueueLimit::Bounded(0))
        .build()
        .unwrap();

    let (release, gate) = unbounded::<()>();
    let first = pool.submit(Payload::new(gate.clone()));
    let second = pool.submit(Payload::new(gate.clone()));

    assert_eq!(second.wait().unwrap_err(), PoolError::NoQueueAvailable);
    release.send(()).unwrap();
    first.wait().unwrap();
}

#[test]
fn test_bounded_queue_rejects_past_capacity() {
    gate_module("itest::gate-bounded");
    let pool = Pool::builder()
        .module_name("itest::gate-bounded")
        .min_threads(1)
        .max_threads(1)
        .max_queue(QueueLimit::Bounded(1))
        .build()
        .unwrap();

    let (release, gate) = unbounded::<()>();
    let first = pool.submit(Payload::new(gate.clone()));
    let second = pool.submit(Payload::new(gate.clone()));
    let third = pool.submit(Payload::new(gate.clone()));

    assert_eq!(third.wait().unwrap_err(), PoolError::QueueAtLimit);
    release.send(()).unwrap();
    release.send(()).unwrap();
    first.wait().unwrap();
    second.wait().unwrap();
}

#[test]
fn test_auto_queue_admits_max_threads_squared() {
    gate_module("itest::gate-auto");
    let pool = Pool::builder()
        .module_name("itest::gate-auto")
        .min_threads(4)
        .max_threads(4)
        .max_queue(QueueLimit::Auto)
        .build()
        .unwrap();

    let (release, gate) = unbounded::<()>();
    // Four run directly, sixteen fill the auto-sized queue.
    let accepted: Vec<_> = (0..20)
        .map(|_| pool.submit(Payload::new(gate.clone())))
        .collect();
    let rejected = pool.submit(Payload::new(gate.clone()));

    assert_eq!(rejected.wait().unwrap_err(), PoolError::QueueAtLimit);
    for _ in 0..20 {
        release.send(()).unwrap();
    }
    for handle in accepted {
        handle.wait().unwrap();
    }
}

#[test]
fn test_single_worker_dispatches_in_submission_order() {
    order_module("itest::order-fifo");
    let pool = Pool::builder()
        .module_name("itest::order-fifo")
        .min_threads(1)
        .max_threads(1)
        .build()
        .unwrap();

    let (out_tx, out_rx) = unbounded::<i64>();
    let handles: Vec<_> = (0..10)
        .map(|value| pool.submit(Payload::new((value, out_tx.clone()))))
        .collect();
    for handle in handles {
        handle.wait().unwrap();
    }

    let received: Vec<i64> = out_rx.try_iter().collect();
    assert_eq!(received, (0..10).collect::<Vec<i64>>());
}

#[test]
fn test_abort_of_queued_task_preserves_queue_order() {
    gate_module("itest::gate-abortq");
    order_module("itest::order-abortq");
    let pool = Pool::builder()
        .module_name("itest::gate-abortq")
        .min_threads(1)
        .max_threads(1)
        .build()
        .unwrap();

    let (release, gate) = unbounded::<()>();
    let (out_tx, out_rx) = unbounded::<i64>();

    let running = pool.submit(Payload::new(gate.clone()));
    let token = AbortToken::new();
    let aborted = pool.submit_job(
        Job::new(Payload::new(gate.clone())).abortable(token.clone()),
    );
    let after: Vec<_> = (0..3)
        .map(|value| {
            pool.submit_job(
                Job::new(Payload::new((value, out_tx.clone()))).module("itest::order-abortq"),
            )
        })
        .collect();

    std::thread::sleep(Duration::from_millis(50));
    token.abort();
    assert_eq!(aborted.wait().unwrap_err(), PoolError::Aborted);

    release.send(()).unwrap();
    for handle in after {
        handle.wait().unwrap();
    }
    let received: Vec<i64> = out_rx.try_iter().collect();
    assert_eq!(received, vec![0, 1, 2]);
    // The queued abort never tears a worker down.
    assert_eq!(pool.thread_count(), 1);
    let _ = running.wait();
}

#[test]
fn test_abort_of_dispatched_task_replaces_worker() {
    gate_module("itest::gate-abort");
    let pool = Pool::builder()
        .module_name("itest::gate-abort")
        .min_threads(1)
        .max_threads(1)
        .build()
        .unwrap();

    let errors = Arc::new(AtomicUsize::new(0));
    let errors_clone = errors.clone();
    pool.on_error().connect(move |_| {
        errors_clone.fetch_add(1, Ordering::SeqCst);
    });

    let (release, gate) = unbounded::<()>();
    let token = AbortToken::new();
    let handle = pool.submit_job(
        Job::new(Payload::new(gate.clone())).abortable(token.clone()),
    );

    std::thread::sleep(Duration::from_millis(10));
    token.abort();
    assert_eq!(handle.wait().unwrap_err(), PoolError::Aborted);

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(pool.thread_count(), pool.min_threads());
    assert_eq!(errors.load(Ordering::SeqCst), 0);

    // The replacement accepts work.
    let (release_next, gate_next) = unbounded::<()>();
    let next = pool.submit(Payload::new(gate_next.clone()));
    release_next.send(()).unwrap();
    next.wait().unwrap();
    drop(release);
}

#[test]
fn test_worker_crash_fails_task_and_replenishes() {
    module_registry().register("itest::boom", |_ctx| -> Result<Payload, String> {
        panic!("boom");
    });
    module_registry().register("itest::boom-echo", |ctx| Ok(ctx.payload));

    let pool = Pool::builder()
        .module_name("itest::boom")
        .min_threads(1)
        .max_threads(1)
        .build()
        .unwrap();

    let failed = pool.submit(Payload::new(()));
    match failed.wait() {
        Err(PoolError::TaskFailed(message)) => assert!(message.contains("boom")),
        other => panic!("expected a crash error, got {other:?}"),
    }

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(pool.thread_count(), 1);

    let next = pool.submit_job(Job::new(Payload::new(7i64)).module("itest::boom-echo"));
    assert_eq!(next.wait().unwrap().downcast::<i64>().ok(), Some(7));
}

#[test]
fn test_transferred_buffer_detaches_and_returns() {
    module_registry().register("itest::reflect", |ctx| {
        let buffer = ctx
            .transfers
            .into_iter()
            .next()
            .ok_or_else(|| "missing transfer".to_string())?;
        Ok(Payload::new(buffer))
    });

    let pool = Pool::builder()
        .module_name("itest::reflect")
        .min_threads(1)
        .max_threads(1)
        .build()
        .unwrap();

    let buffer = Buffer::new(10);
    let movable = Movable::wrap(Payload::new(buffer.clone())).unwrap();
    let result = pool.submit_job(Job::from(movable)).wait().unwrap();

    assert_eq!(buffer.len(), 0);
    assert!(buffer.is_detached());
    let returned = result.downcast::<Buffer>().unwrap();
    assert_eq!(returned.len(), 10);
}

#[test]
fn test_unknown_module_fails_only_that_task() {
    module_registry().register("itest::known", |ctx| Ok(ctx.payload));
    let pool = Pool::builder()
        .module_name("itest::known")
        .min_threads(1)
        .max_threads(1)
        .build()
        .unwrap();

    let missing = pool.submit_job(Job::new(Payload::new(())).module("itest::missing"));
    assert_eq!(
        missing.wait().unwrap_err(),
        PoolError::ModuleNotFound("itest::missing".to_string())
    );

    let ok = pool.submit(Payload::new(5u8));
    assert_eq!(ok.wait().unwrap().downcast::<u8>().ok(), Some(5));
}

#[test]
fn test_pool_fills_to_minimum_and_stays_there() {
    module_registry().register("itest::steady", |ctx| Ok(ctx.payload));
    let pool = Pool::builder()
        .module_name("itest::steady")
        .min_threads(3)
        .max_threads(6)
        .build()
        .unwrap();

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(pool.thread_count(), 3);
}

#[test]
fn test_idle_workers_retire_to_minimum() {
    gate_module("itest::gate-idle");
    let pool = Pool::builder()
        .module_name("itest::gate-idle")
        .min_threads(1)
        .max_threads(3)
        .idle_timeout(Duration::from_millis(50))
        .build()
        .unwrap();

    let (release, gate) = unbounded::<()>();
    let handles: Vec<_> = (0..3)
        .map(|_| pool.submit(Payload::new(gate.clone())))
        .collect();

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(pool.thread_count(), 3);

    for _ in 0..3 {
        release.send(()).unwrap();
    }
    for handle in handles {
        handle.wait().unwrap();
    }

    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(pool.thread_count(), 1);
}

#[test]
fn test_event_pathway_without_atomics() {
    module_registry().register("itest::no-atomics", |ctx| {
        let n = ctx
            .payload
            .downcast::<i64>()
            .map_err(|_| "expected i64".to_string())?;
        Ok(Payload::new(n + 1))
    });

    let pool = Pool::builder()
        .module_name("itest::no-atomics")
        .min_threads(1)
        .max_threads(2)
        .use_atomics(false)
        .build()
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|value| pool.submit(Payload::new(value as i64)))
        .collect();
    for (value, handle) in handles.into_iter().enumerate() {
        assert_eq!(
            handle.wait().unwrap().downcast::<i64>().ok(),
            Some(value as i64 + 1)
        );
    }
}

#[test]
fn test_worker_data_reaches_task_context() {
    module_registry().register("itest::tagged", |ctx| {
        let data = ctx
            .worker_data
            .as_ref()
            .ok_or_else(|| "missing worker data".to_string())?;
        let tag = data
            .downcast_ref::<String>()
            .ok_or_else(|| "wrong worker data type".to_string())?;
        Ok(Payload::new(tag.clone()))
    });

    let pool = Pool::builder()
        .module_name("itest::tagged")
        .min_threads(1)
        .max_threads(1)
        .worker_data(Arc::new("shared-tag".to_string()))
        .resource_limits(ResourceLimits {
            stack_size: Some(512 * 1024),
        })
        .build()
        .unwrap();

    let result = pool.submit(Payload::new(())).wait().unwrap();
    assert_eq!(result.downcast::<String>().ok(), Some("shared-tag".to_string()));
}

#[test]
fn test_destroy_fails_queued_and_running_tasks() {
    gate_module("itest::gate-destroy");
    let pool = Arc::new(
        Pool::builder()
            .module_name("itest::gate-destroy")
            .min_threads(1)
            .max_threads(1)
            .build()
            .unwrap(),
    );

    let (release, gate) = unbounded::<()>();
    let running = pool.submit(Payload::new(gate.clone()));
    let queued = pool.submit(Payload::new(gate.clone()));
    std::thread::sleep(Duration::from_millis(50));

    // Destroy from another thread: it fails both tasks immediately, then
    // blocks joining the worker until the gate opens.
    let destroyer = {
        let pool = pool.clone();
        std::thread::spawn(move || pool.destroy())
    };

    assert_eq!(queued.wait().unwrap_err(), PoolError::ThreadTermination);
    assert_eq!(running.wait().unwrap_err(), PoolError::ThreadTermination);

    release.send(()).unwrap();
    destroyer.join().unwrap();
    assert_eq!(pool.thread_count(), 0);
}

#[test]
fn test_pool_grows_toward_max_under_load() {
    gate_module("itest::gate-grow");
    let pool = Pool::builder()
        .module_name("itest::gate-grow")
        .min_threads(1)
        .max_threads(4)
        .build()
        .unwrap();

    let (release, gate) = unbounded::<()>();
    let handles: Vec<_> = (0..4)
        .map(|_| pool.submit(Payload::new(gate.clone())))
        .collect();

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(pool.thread_count(), pool.max_threads());

    for _ in 0..4 {
        release.send(()).unwrap();
    }
    for handle in handles {
        handle.wait().unwrap();
    }
    assert!(pool.utilization() > 0.0);
}
