//! Cancellation across components
//!
//! One token shared by producers, pools, pipelines and fan-in; every blocked
//! thread must come back within a bounded window once it fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flowq::runtime::flow::{
    fan_in, BoundedQueue, CancelReason, CancellationToken, FlowError, Job, Outcome, Pipeline,
    PoolState, Stage, WorkerPool,
};

const BOUND: Duration = Duration::from_secs(3);

/// An endless producer and a slow pipeline, stopped only by a deadline.
#[test]
fn test_deadline_stops_endless_pipeline() {
    let token = CancellationToken::with_deadline(Duration::from_millis(100));
    let mut pipeline: Pipeline<u64, String> = Pipeline::compose(
        vec![
            Stage::map("slow", 2, |n: u64| {
                thread::sleep(Duration::from_millis(5));
                n
            }),
            Stage::map("inc", 1, |n: u64| n + 1),
        ],
        2,
        &token,
    )
    .unwrap();

    let start = Instant::now();
    let producer = {
        let input = pipeline.input().clone();
        thread::spawn(move || {
            let mut n = 0u64;
            loop {
                match input.put(Job::with_seq(n, Ok(n))) {
                    Ok(()) => n += 1,
                    Err(err) => return err,
                }
            }
        })
    };

    let delivered = pipeline.collect().len();
    let producer_err = producer.join().unwrap();
    pipeline.join().unwrap();

    assert!(start.elapsed() < BOUND);
    assert_eq!(producer_err, FlowError::Cancelled);
    assert_eq!(
        pipeline.token().reason(),
        Some(CancelReason::DeadlineExceeded)
    );
    assert_eq!(token.reason(), Some(CancelReason::DeadlineExceeded));
    assert!(delivered > 0);
    for (_, state) in pipeline.stage_states() {
        assert_eq!(state, PoolState::Stopped);
    }
}

/// One explicit cancel brings down a pool, a fan-in and their blocked
/// producers together.
#[test]
fn test_shared_token_stops_everything() {
    let token = CancellationToken::new();

    let input = BoundedQueue::with_cancellation(1, &token).unwrap();
    let pool_out: BoundedQueue<Outcome<u32, String>> =
        BoundedQueue::with_cancellation(1, &token).unwrap();
    let idle: BoundedQueue<Outcome<u32, String>> = BoundedQueue::new(1).unwrap();

    let mut pool =
        WorkerPool::new(2, input.clone(), pool_out.clone(), |x: u32| Ok(x), &token).unwrap();
    pool.start().unwrap();
    let mut merged = fan_in(vec![pool_out, idle.clone()], 1, &token).unwrap();

    // Nobody reads the merged queue, so everything backs up.
    let producer_done = Arc::new(AtomicBool::new(false));
    let producer = {
        let input = input.clone();
        let producer_done = producer_done.clone();
        thread::spawn(move || {
            let mut result = Ok(());
            for i in 0..100 {
                result = input.put(Job::with_seq(u64::from(i), i));
                if result.is_err() {
                    break;
                }
            }
            producer_done.store(true, Ordering::SeqCst);
            result
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!producer_done.load(Ordering::SeqCst));

    let start = Instant::now();
    token.cancel();

    assert_eq!(producer.join().unwrap(), Err(FlowError::Cancelled));
    pool.join().unwrap();
    merged.join().unwrap();
    assert!(start.elapsed() < BOUND);

    assert_eq!(pool.state(), PoolState::Stopped);
    assert_eq!(merged.open_sources(), 0);
    assert!(merged.output().is_closed());
    // The idle source was never closed by anyone.
    assert!(!idle.is_closed());
}

/// Stopping one pool leaves a sibling on the same parent token running.
#[test]
fn test_stop_is_scoped_to_one_pool() {
    let token = CancellationToken::new();

    let make = |name: &str| {
        let input = BoundedQueue::new(4).unwrap();
        let output: BoundedQueue<Outcome<u32, String>> = BoundedQueue::new(4).unwrap();
        let pool = WorkerPool::builder(1)
            .name(name)
            .token(&token)
            .build(input.clone(), output.clone(), |x: u32| Ok(x))
            .unwrap();
        (input, output, pool)
    };
    let (_stopped_in, stopped_out, mut stopped) = make("stopped");
    let (live_in, live_out, mut live) = make("live");
    stopped.start().unwrap();
    live.start().unwrap();

    stopped.stop().unwrap();
    assert!(stopped_out.is_closed());

    live_in.put(Job::with_seq(0, 7)).unwrap();
    assert_eq!(
        live_out
            .take_timeout(Duration::from_secs(1))
            .map(|o| o.payload),
        Ok(Ok(7))
    );
    assert_eq!(live.state(), PoolState::Running);

    live_in.close();
    live.join().unwrap();
    assert!(!token.is_done());
}
