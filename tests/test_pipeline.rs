use balanced_pipeline::{
    BoundedQueue, BoxError, CancellationToken, FilterTransform, FlatMapTransform, MapTransform,
    PassthroughTransform, Pipeline, PipelineConfig, PipelineError, Rebalance, Sequenced,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn fast_config() -> PipelineConfig {
    PipelineConfig::new().with_tick_interval(Duration::from_millis(5))
}

type Collected<T> = Arc<Mutex<Vec<Sequenced<T>>>>;

fn collect_into<T: Send + 'static>(
    pipeline: &mut Pipeline,
    name: &str,
    queue: &BoundedQueue<Sequenced<T>>,
) -> Collected<T> {
    let seen: Collected<T> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    pipeline.sink(name, queue, move |item| {
        sink.lock().push(item);
        Ok(())
    });
    seen
}

fn seqs<T>(items: &[Sequenced<T>]) -> Vec<u64> {
    items.iter().map(|item| item.seq()).collect()
}

#[test]
fn test_single_worker_preserves_order() {
    let config = fast_config().with_worker_budget(1);
    let mut pipeline = Pipeline::new(config).unwrap();
    let input = pipeline.queue::<u32>();
    let output = pipeline.queue::<u32>();

    pipeline.source("numbers", &input, |out| {
        for n in 1..=1000 {
            out.emit(n)?;
        }
        Ok(())
    });
    let stage = pipeline.stage("identity", &input, &[&output], PassthroughTransform);
    let seen = collect_into(&mut pipeline, "collect", &output);

    pipeline.run().unwrap();

    let seen = seen.lock();
    assert_eq!(seqs(&seen), (1..=1000).collect::<Vec<_>>());
    let payloads: Vec<u32> = seen.iter().map(|item| *item.payload()).collect();
    assert_eq!(payloads, (1..=1000).collect::<Vec<_>>());
    assert_eq!(stage.metrics().workers_added(), 1);
}

#[test]
fn test_parallel_workers_restore_order() {
    let config = fast_config().with_worker_budget(8);
    let mut pipeline = Pipeline::new(config).unwrap();
    let input = pipeline.queue::<u64>();
    let output = pipeline.queue::<u64>();

    pipeline.source("numbers", &input, |out| {
        for n in 1..=200 {
            out.emit(n)?;
        }
        Ok(())
    });
    // Uneven per-item cost so parallel workers finish out of order.
    let stage = pipeline.stage(
        "jitter",
        &input,
        &[&output],
        MapTransform::new("jitter", |n: u64| {
            thread::sleep(Duration::from_millis(n % 4));
            Ok::<_, BoxError>(n * 10)
        }),
    );
    let seen = collect_into(&mut pipeline, "collect", &output);

    pipeline.run().unwrap();

    let seen = seen.lock();
    assert_eq!(seqs(&seen), (1..=200).collect::<Vec<_>>());
    let payloads: Vec<u64> = seen.iter().map(|item| *item.payload()).collect();
    assert_eq!(payloads, (1..=200).map(|n| n * 10).collect::<Vec<_>>());
    assert!(stage.metrics().workers_added() > 1);
    assert_eq!(stage.metrics().total_processed(), 200);
}

#[test]
fn test_reference_topology_with_fan_out() {
    let mut pipeline = Pipeline::new(fast_config()).unwrap();
    let frames = pipeline.queue::<u32>();
    let full = pipeline.queue::<u32>();
    let for_thumbs = pipeline.queue::<u32>();
    let thumbs = pipeline.queue::<u32>();

    pipeline.source("load", &frames, |out| {
        for frame in 0..300 {
            out.emit(frame)?;
        }
        Ok(())
    });
    pipeline.stage(
        "remove-background",
        &frames,
        &[&full, &for_thumbs],
        MapTransform::new("remove-background", |frame: u32| Ok::<_, BoxError>(frame + 1000)),
    );
    pipeline.stage(
        "thumbnail",
        &for_thumbs,
        &[&thumbs],
        MapTransform::new("thumbnail", |frame: u32| Ok::<_, BoxError>(frame / 10)),
    );
    let saved = collect_into(&mut pipeline, "save-full", &full);
    let saved_thumbs = collect_into(&mut pipeline, "save-thumbnail", &thumbs);

    pipeline.run().unwrap();

    let saved = saved.lock();
    let saved_thumbs = saved_thumbs.lock();
    assert_eq!(seqs(&saved), (1..=300).collect::<Vec<_>>());
    assert_eq!(seqs(&saved_thumbs), (1..=300).collect::<Vec<_>>());
    for (index, item) in saved.iter().enumerate() {
        assert_eq!(*item.payload(), index as u32 + 1000);
    }
    for (index, item) in saved_thumbs.iter().enumerate() {
        assert_eq!(*item.payload(), (index as u32 + 1000) / 10);
    }
}

#[test]
fn test_item_fan_out_and_filter_renumber_contiguously() {
    let config = fast_config().with_worker_budget(6);
    let mut pipeline = Pipeline::new(config).unwrap();
    let input = pipeline.queue::<u32>();
    let doubled = pipeline.queue::<u32>();
    let evens = pipeline.queue::<u32>();

    pipeline.source("numbers", &input, |out| {
        for n in 1..=100 {
            out.emit(n)?;
        }
        Ok(())
    });
    pipeline.stage(
        "split",
        &input,
        &[&doubled],
        FlatMapTransform::new("split", |n: u32| Ok::<_, BoxError>(vec![n * 2, n * 2 + 1])),
    );
    pipeline.stage(
        "evens",
        &doubled,
        &[&evens],
        FilterTransform::new("evens", |n: &u32| n % 2 == 0),
    );
    let seen = collect_into(&mut pipeline, "collect", &evens);

    pipeline.run().unwrap();

    let seen = seen.lock();
    assert_eq!(seqs(&seen), (1..=100).collect::<Vec<_>>());
    let payloads: Vec<u32> = seen.iter().map(|item| *item.payload()).collect();
    assert_eq!(payloads, (1..=100).map(|n| n * 2).collect::<Vec<_>>());
}

#[test]
fn test_empty_input_completes() {
    let mut pipeline = Pipeline::new(fast_config()).unwrap();
    let input = pipeline.queue::<u32>();
    let output = pipeline.queue::<u32>();

    pipeline.source("nothing", &input, |_| Ok(()));
    pipeline.stage("identity", &input, &[&output], PassthroughTransform);
    let seen = collect_into(&mut pipeline, "collect", &output);

    pipeline.run().unwrap();
    assert!(seen.lock().is_empty());
}

#[test]
fn test_transform_failure_is_reported() {
    let mut pipeline = Pipeline::new(fast_config()).unwrap();
    let input = pipeline.queue::<u32>();
    let output = pipeline.queue::<u32>();

    pipeline.source("numbers", &input, |out| {
        for n in 1..=1000 {
            out.emit(n)?;
        }
        Ok(())
    });
    pipeline.stage(
        "picky",
        &input,
        &[&output],
        MapTransform::new("picky", |n: u32| {
            if n == 37 {
                return Err::<u32, BoxError>("cannot decode item 37".into());
            }
            Ok(n)
        }),
    );
    let seen = collect_into(&mut pipeline, "collect", &output);

    let err = pipeline.run().unwrap_err();
    match err {
        PipelineError::Transform {
            stage,
            transform,
            seq,
            ..
        } => {
            assert_eq!(stage, "picky");
            assert_eq!(transform, "picky");
            assert_eq!(seq, 37);
        }
        other => panic!("unexpected error: {other}"),
    }
    // Nothing after the failed item may be released in order.
    assert!(seen.lock().iter().all(|item| item.seq() < 37));
}

#[test]
fn test_sink_failure_is_reported() {
    let mut pipeline = Pipeline::new(fast_config()).unwrap();
    let input = pipeline.queue::<u32>();
    let output = pipeline.queue::<u32>();

    pipeline.source("numbers", &input, |out| {
        for n in 1..=50 {
            out.emit(n)?;
        }
        Ok(())
    });
    pipeline.stage("identity", &input, &[&output], PassthroughTransform);
    pipeline.sink("full-disk", &output, |item| {
        if item.seq() == 5 {
            return Err("no space left".into());
        }
        Ok(())
    });

    let err = pipeline.run().unwrap_err();
    assert!(matches!(err, PipelineError::Sink { seq: 5, ref task, .. } if task == "full-disk"));
}

#[test]
fn test_panicking_transform_is_reported() {
    let mut pipeline = Pipeline::new(fast_config().with_worker_budget(1)).unwrap();
    let input = pipeline.queue::<u32>();
    let output = pipeline.queue::<u32>();

    pipeline.source("numbers", &input, |out| {
        for n in 1..=10 {
            out.emit(n)?;
        }
        Ok(())
    });
    pipeline.stage(
        "fragile",
        &input,
        &[&output],
        MapTransform::new("fragile", |n: u32| {
            if n == 3 {
                panic!("corrupt frame");
            }
            Ok::<_, BoxError>(n)
        }),
    );
    collect_into(&mut pipeline, "collect", &output);

    match pipeline.run() {
        Err(PipelineError::Panicked { task, message }) => {
            assert!(task.starts_with("fragile"));
            assert_eq!(message, "corrupt frame");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_external_cancellation_stops_endless_source() {
    let external = CancellationToken::new();
    let mut pipeline = Pipeline::with_cancellation(fast_config(), &external).unwrap();
    let input = pipeline.queue::<u64>();
    let output = pipeline.queue::<u64>();

    pipeline.source("endless", &input, |out| {
        let mut n = 0;
        while !out.is_cancelled() {
            out.emit(n)?;
            n += 1;
        }
        Ok(())
    });
    pipeline.stage(
        "slow",
        &input,
        &[&output],
        MapTransform::new("slow", |n: u64| {
            thread::sleep(Duration::from_millis(1));
            Ok::<_, BoxError>(n)
        }),
    );
    let seen = collect_into(&mut pipeline, "collect", &output);

    let canceller = {
        let external = external.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            external.cancel();
        })
    };

    let started = Instant::now();
    pipeline.run().unwrap();
    canceller.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    let seen = seen.lock();
    assert_eq!(seqs(&seen), (1..=seen.len() as u64).collect::<Vec<_>>());
}

#[test]
fn test_cancellation_token_handle_stops_run() {
    let mut pipeline = Pipeline::new(fast_config()).unwrap();
    let input = pipeline.queue::<u8>();
    let output = pipeline.queue::<u8>();
    let token = pipeline.cancellation_token();

    pipeline.source("endless", &input, |out| loop {
        out.emit(0)?;
    });
    pipeline.stage("identity", &input, &[&output], PassthroughTransform);
    // Nothing drains `output`, so everything upstream blocks on a full queue.

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        token.cancel();
    });
    assert!(pipeline.run().is_ok());
    canceller.join().unwrap();
}

#[test]
fn test_workers_stay_within_budget() {
    let budget = 4;
    let config = fast_config().with_worker_budget(budget);
    let mut pipeline = Pipeline::new(config).unwrap();
    let a = pipeline.queue::<u32>();
    let b = pipeline.queue::<u32>();
    let c = pipeline.queue::<u32>();
    let d = pipeline.queue::<u32>();

    let source_done = Arc::new(AtomicBool::new(false));
    let done = Arc::clone(&source_done);
    pipeline.source("numbers", &a, move |out| {
        for n in 0..400 {
            out.emit(n)?;
        }
        done.store(true, Ordering::Release);
        Ok(())
    });
    let slow = |name: &'static str, millis: u64| {
        MapTransform::new(name, move |n: u32| {
            thread::sleep(Duration::from_millis(millis));
            Ok::<_, BoxError>(n)
        })
    };
    let stages = vec![
        pipeline.stage("first", &a, &[&b], slow("first", 1)) as Arc<dyn Rebalance>,
        pipeline.stage("second", &b, &[&c], slow("second", 2)) as Arc<dyn Rebalance>,
        pipeline.stage("third", &c, &[&d], slow("third", 1)) as Arc<dyn Rebalance>,
    ];
    collect_into(&mut pipeline, "collect", &d);

    // While the source runs no stage can finish, so each stage holds at
    // least one worker and none may hold more than the rest of the budget.
    let ceiling = budget - (stages.len() - 1);
    let peak = Arc::new(AtomicUsize::new(0));
    let sampler = {
        let peak = Arc::clone(&peak);
        let source_done = Arc::clone(&source_done);
        thread::spawn(move || {
            while !source_done.load(Ordering::Acquire) {
                for stage in &stages {
                    let workers = stage.worker_count();
                    if !source_done.load(Ordering::Acquire) {
                        assert!(workers <= ceiling, "{} had {}", stage.name(), workers);
                        peak.fetch_max(workers, Ordering::Relaxed);
                    }
                }
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    pipeline.run().unwrap();
    sampler.join().unwrap();
    assert!(peak.load(Ordering::Relaxed) >= 1);
}

#[test]
fn test_stage_without_outputs_sees_every_item() {
    let mut pipeline = Pipeline::new(fast_config()).unwrap();
    let input = pipeline.queue::<u32>();
    let total = Arc::new(AtomicUsize::new(0));

    pipeline.source("numbers", &input, |out| {
        for n in 1..=64 {
            out.emit(n)?;
        }
        Ok(())
    });
    let counter = Arc::clone(&total);
    pipeline.stage::<u32, (), _>(
        "write",
        &input,
        &[],
        MapTransform::new("write", move |n: u32| {
            counter.fetch_add(n as usize, Ordering::Relaxed);
            Ok::<_, BoxError>(())
        }),
    );

    pipeline.run().unwrap();
    assert_eq!(total.load(Ordering::Relaxed), (1..=64).sum::<usize>());
}
