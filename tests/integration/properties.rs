//! QuickCheck properties
//!
//! Conservation and ordering laws over random inputs.

use std::thread;

use quickcheck::{quickcheck, TestResult};

use flowq::runtime::flow::{fan_in, BoundedQueue, CancellationToken, Job, Outcome, WorkerPool};

/// Every job produces exactly one outcome, whatever the worker count and
/// queue capacity.
fn pool_conserves_jobs(
    payloads: Vec<u16>,
    workers: u8,
    capacity: u8,
) -> TestResult {
    let workers = usize::from(workers % 8) + 1;
    let capacity = usize::from(capacity % 8) + 1;

    let token = CancellationToken::new();
    let input = BoundedQueue::new(capacity).unwrap();
    let output: BoundedQueue<Outcome<u32, String>> = BoundedQueue::new(capacity).unwrap();
    let mut pool = WorkerPool::new(
        workers,
        input.clone(),
        output.clone(),
        |x: u16| Ok(u32::from(x) * 3),
        &token,
    )
    .unwrap();
    pool.start().unwrap();

    let feeder = {
        let payloads = payloads.clone();
        thread::spawn(move || {
            for (seq, x) in payloads.into_iter().enumerate() {
                input.put(Job::with_seq(seq as u64, x)).unwrap();
            }
            input.close();
        })
    };

    let mut outcomes: Vec<_> = output.iter().collect();
    feeder.join().unwrap();
    pool.join().unwrap();

    outcomes.sort_by_key(|o| o.seq);
    let got: Vec<u32> = outcomes.into_iter().filter_map(|o| o.payload.ok()).collect();
    let expected: Vec<u32> = payloads.iter().map(|&x| u32::from(x) * 3).collect();
    TestResult::from_bool(got == expected)
}

/// Fan-in delivers a permutation of its inputs that keeps each source's
/// order.
fn fan_in_keeps_source_order(sources: Vec<Vec<u8>>) -> TestResult {
    let sources: Vec<Vec<u8>> = sources.into_iter().take(6).collect();
    if sources.is_empty() {
        return TestResult::discard();
    }

    let token = CancellationToken::new();
    let queues: Vec<BoundedQueue<(usize, usize)>> = sources
        .iter()
        .map(|_| BoundedQueue::new(2).unwrap())
        .collect();
    let mut merged = fan_in(queues.clone(), 3, &token).unwrap();

    let feeders: Vec<_> = queues
        .into_iter()
        .zip(sources.iter().map(Vec::len))
        .enumerate()
        .map(|(id, (queue, len))| {
            thread::spawn(move || {
                for i in 0..len {
                    queue.put((id, i)).unwrap();
                }
                queue.close();
            })
        })
        .collect();

    let mut next = vec![0usize; sources.len()];
    let mut ok = true;
    for (id, i) in merged.output().iter() {
        ok &= next[id] == i;
        next[id] += 1;
    }

    for feeder in feeders {
        feeder.join().unwrap();
    }
    merged.join().unwrap();

    let complete = next
        .iter()
        .zip(sources.iter())
        .all(|(&seen, source)| seen == source.len());
    TestResult::from_bool(ok && complete)
}

#[test]
fn quickcheck_pool_conserves_jobs() {
    quickcheck(pool_conserves_jobs as fn(Vec<u16>, u8, u8) -> TestResult);
}

#[test]
fn quickcheck_fan_in_keeps_source_order() {
    quickcheck(fan_in_keeps_source_order as fn(Vec<Vec<u8>>) -> TestResult);
}
