//! End-to-end scenarios
//!
//! Pools, pipelines and fan-in wired together the way an application would.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flowq::runtime::flow::{
    fan_in, BoundedQueue, CancellationToken, FlowError, FlowStats, Job, JobError, Outcome,
    Pipeline, PoolState, Stage, WorkerPool,
};

/// Three workers, six one-off jobs, results doubled.
#[test]
fn test_fan_out_three_workers() {
    let jobs = BoundedQueue::new(5).unwrap();
    let results: BoundedQueue<Outcome<u32, String>> = BoundedQueue::new(5).unwrap();
    let token = CancellationToken::new();

    let mut pool = WorkerPool::new(
        3,
        jobs.clone(),
        results.clone(),
        |job: u32| {
            thread::sleep(Duration::from_millis(20));
            Ok(job * 2)
        },
        &token,
    )
    .unwrap();
    pool.start().unwrap();

    for j in 0..=5u32 {
        jobs.put(Job::with_seq(u64::from(j), j)).unwrap();
    }
    jobs.close();

    let mut doubled: Vec<u32> = results.iter().map(|o| o.payload.unwrap()).collect();
    pool.join().unwrap();
    doubled.sort_unstable();
    assert_eq!(doubled, vec![0, 2, 4, 6, 8, 10]);
}

/// Two independent pools merged into one sink.
#[test]
fn test_two_pools_fan_in() {
    let token = CancellationToken::new();
    let mut pools = Vec::new();
    let mut outputs = Vec::new();
    let mut feeders = Vec::new();

    for (pool_id, offset) in [(0u64, 0u64), (1, 1000)] {
        let input = BoundedQueue::new(4).unwrap();
        let output: BoundedQueue<Outcome<u64, String>> = BoundedQueue::new(4).unwrap();
        let mut pool = WorkerPool::builder(2)
            .name(format!("pool-{}", pool_id))
            .token(&token)
            .build(input.clone(), output.clone(), move |x: u64| Ok(x + offset))
            .unwrap();
        pool.start().unwrap();

        feeders.push(thread::spawn(move || {
            for i in 0..50u64 {
                input.put(Job::with_seq(i, i)).unwrap();
            }
            input.close();
        }));
        pools.push(pool);
        outputs.push(output);
    }

    let mut merged = fan_in(outputs, 8, &token).unwrap();
    let values: BTreeSet<u64> = merged
        .output()
        .iter()
        .map(|o| o.payload.unwrap())
        .collect();

    for feeder in feeders {
        feeder.join().unwrap();
    }
    for pool in &mut pools {
        pool.join().unwrap();
        assert_eq!(pool.state(), PoolState::Stopped);
    }
    merged.join().unwrap();

    let expected: BTreeSet<u64> = (0..50).chain(1000..1050).collect();
    assert_eq!(values, expected);
    assert_eq!(merged.output().take(), Err(FlowError::Closed));
}

/// A pipeline's sink feeding a pool: errors flow through as data.
#[test]
fn test_pipeline_into_pool() {
    let token = CancellationToken::new();
    let stats = Arc::new(FlowStats::new());
    let mut pipeline = Pipeline::builder()
        .stage(Stage::try_map("parse", 2, |n: i64| {
            if n < 0 {
                Err(format!("negative: {}", n))
            } else {
                Ok(n)
            }
        }))
        .stage(Stage::map("square", 2, |n: i64| n * n))
        .capacity(4)
        .token(&token)
        .metrics(stats.clone())
        .build()
        .unwrap();

    let sink: BoundedQueue<Outcome<String, String>> = BoundedQueue::new(4).unwrap();
    let mut formatter = WorkerPool::new(
        2,
        pipeline.output().clone(),
        sink.clone(),
        |item: Result<i64, JobError<String>>| match item {
            Ok(n) => Ok(format!("ok {}", n)),
            Err(err) => Err(err.to_string()),
        },
        &token,
    )
    .unwrap();
    formatter.start().unwrap();

    let feeder = {
        let input = pipeline.input().clone();
        thread::spawn(move || {
            for (seq, n) in [-2i64, 1, 2, -1, 3].into_iter().enumerate() {
                input.put(Job::with_seq(seq as u64, Ok(n))).unwrap();
            }
            input.close();
        })
    };

    let mut outcomes: Vec<_> = sink.iter().collect();
    feeder.join().unwrap();
    pipeline.join().unwrap();
    formatter.join().unwrap();

    outcomes.sort_by_key(|o| o.seq);
    let rendered: Vec<String> = outcomes
        .into_iter()
        .map(|o| match o.payload {
            Ok(text) => text,
            Err(JobError::Failed(text)) => format!("err {}", text),
            Err(JobError::Panicked(text)) => format!("panic {}", text),
        })
        .collect();
    assert_eq!(
        rendered,
        vec![
            "err job failed: negative: -2",
            "ok 1",
            "ok 4",
            "err job failed: negative: -1",
            "ok 9",
        ]
    );
    assert_eq!(stats.failed(), 2);
}

/// The ten-job, three-worker timing scenario through the crate root API.
#[test]
fn test_concurrency_beats_sequential() {
    const JOB_MS: u64 = 40;
    let input = flowq::BoundedQueue::new(10).unwrap();
    let output: flowq::BoundedQueue<flowq::Outcome<u64, String>> =
        flowq::BoundedQueue::new(10).unwrap();
    let token = flowq::CancellationToken::new();
    let mut pool = flowq::WorkerPool::new(
        3,
        input.clone(),
        output.clone(),
        |x: u64| {
            thread::sleep(Duration::from_millis(JOB_MS));
            Ok(x * 2)
        },
        &token,
    )
    .unwrap();

    let start = Instant::now();
    pool.start().unwrap();
    for i in 0..10 {
        input.put(flowq::Job::with_seq(i, i)).unwrap();
    }
    input.close();
    let count = output.iter().count();
    pool.join().unwrap();

    assert_eq!(count, 10);
    assert!(start.elapsed() < Duration::from_millis(JOB_MS * 10));
}
