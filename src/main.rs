//! flowq - CLI demos for bounded queues, worker pools and pipelines

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam::thread::ScopedJoinHandle;
use rand::Rng;
use tracing::{debug, info, warn};

use flowq::runtime::flow::{
    BoundedQueue, CancelReason, CancellationToken, FlowError, FlowStats, Job, Pipeline,
    SequenceGenerator, Stage, WorkerPool,
};
use flowq::util::config::FlowConfig;
use flowq::util::logger::{self, LogLevel};
use flowq::{NAME, VERSION};

/// Bounded concurrent work queues with pipelines and cancellation
#[derive(Parser, Debug)]
#[command(name = "flowq")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Cancel the whole run after this many milliseconds
    #[arg(long, global = true, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// TOML file with queue_capacity / workers / timeout_ms / log_level
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Worker pool doubling each job
    Pool {
        /// Number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Number of jobs to submit
        #[arg(long, default_value_t = 10)]
        jobs: u64,

        /// Capacity of the job and result queues
        #[arg(long)]
        capacity: Option<usize>,

        /// Upper bound of the random per-job delay
        #[arg(long, default_value_t = 0, value_name = "MS")]
        delay_ms: u64,
    },

    /// filter(even) -> square -> half over 0..=UPTO
    Pipeline {
        /// Last input value
        #[arg(long, default_value_t = 10)]
        upto: i64,

        /// Workers in the square stage
        #[arg(long)]
        workers: Option<usize>,

        /// Capacity of every inter-stage queue
        #[arg(long)]
        capacity: Option<usize>,
    },

    /// Producers and consumers sharing one bounded queue
    Prodcons {
        /// Number of producer threads
        #[arg(long, default_value_t = 2)]
        producers: usize,

        /// Number of consumer threads
        #[arg(long, default_value_t = 2)]
        consumers: usize,

        /// Items each producer adds
        #[arg(long, default_value_t = 3)]
        items: usize,

        /// Queue capacity
        #[arg(long)]
        capacity: Option<usize>,
    },

    /// Print version information
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => FlowConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => FlowConfig::default(),
    };
    if args.timeout_ms.is_some() {
        config.timeout_ms = args.timeout_ms;
    }
    if args.verbose {
        config.log_level = LogLevel::Debug;
    }
    logger::init_with_level(config.log_level);
    debug!(?config, "configuration resolved");

    let token = CancellationToken::new();
    if let Some(timeout) = config.timeout() {
        token.cancel_after(timeout);
    }

    match args.command {
        Commands::Pool {
            workers,
            jobs,
            capacity,
            delay_ms,
        } => {
            let workers = workers.unwrap_or(config.workers);
            let capacity = capacity.unwrap_or(config.queue_capacity);
            run_pool(workers, jobs, capacity, delay_ms, &token).context("Pool demo failed")?;
        },
        Commands::Pipeline {
            upto,
            workers,
            capacity,
        } => {
            let workers = workers.unwrap_or(config.workers);
            let capacity = capacity.unwrap_or(config.queue_capacity);
            run_pipeline(upto, workers, capacity, &token).context("Pipeline demo failed")?;
        },
        Commands::Prodcons {
            producers,
            consumers,
            items,
            capacity,
        } => {
            let capacity = capacity.unwrap_or(config.queue_capacity);
            run_prodcons(producers, consumers, items, capacity, &token)
                .context("Producer/consumer demo failed")?;
        },
        Commands::Version => {
            println!("{} {}", NAME, VERSION);
        },
    }

    Ok(())
}

/// Fail the run if the shared token fired before the demo finished.
fn check_cancelled(token: &CancellationToken) -> Result<()> {
    match token.reason() {
        Some(CancelReason::DeadlineExceeded) => bail!("stopped early: deadline exceeded"),
        Some(CancelReason::Cancelled) => bail!("stopped early: cancelled"),
        None => Ok(()),
    }
}

fn random_delay(max_ms: u64) {
    if max_ms == 0 {
        return;
    }
    let ms = rand::rng().random_range(0..=max_ms);
    thread::sleep(Duration::from_millis(ms));
}

fn run_pool(
    workers: usize,
    jobs: u64,
    capacity: usize,
    delay_ms: u64,
    token: &CancellationToken,
) -> Result<()> {
    let input = BoundedQueue::with_cancellation(capacity, token)?;
    let output = BoundedQueue::with_cancellation(capacity, token)?;
    let stats = Arc::new(FlowStats::new());

    let mut pool = WorkerPool::builder(workers)
        .name("demo-pool")
        .token(token)
        .metrics(stats.clone())
        .build(input.clone(), output.clone(), move |job: u64| {
            random_delay(delay_ms);
            Ok::<u64, String>(job * 2)
        })?;

    let start = Instant::now();
    pool.start()?;
    info!(workers, jobs, capacity, "pool started");

    let producer = thread::Builder::new()
        .name("demo-producer".to_string())
        .spawn(move || -> Result<(), FlowError> {
            let sequence = SequenceGenerator::new();
            for payload in 1..=jobs {
                input.put(sequence.job(payload))?;
            }
            input.close();
            Ok(())
        })?;

    for outcome in output.iter() {
        match outcome.payload {
            Ok(result) => println!("job {} -> {}", outcome.seq.unwrap_or_default(), result),
            Err(err) => println!("job {} failed: {}", outcome.seq.unwrap_or_default(), err),
        }
    }

    let produced = producer
        .join()
        .map_err(|_| anyhow!("producer thread panicked"))?;
    pool.join()?;

    if let Err(err) = produced {
        if !err.is_terminal() {
            return Err(err.into());
        }
    }
    info!(elapsed = ?start.elapsed(), %stats, "pool finished");
    check_cancelled(token)
}

fn run_pipeline(
    upto: i64,
    workers: usize,
    capacity: usize,
    token: &CancellationToken,
) -> Result<()> {
    let stats = Arc::new(FlowStats::new());
    let mut pipeline = Pipeline::<i64, String>::builder()
        .stage(Stage::filter("even", 1, |n: &i64| n % 2 == 0))
        .stage(Stage::map("square", workers, |n: i64| n * n))
        .stage(Stage::map("half", 1, |n: i64| n / 2))
        .capacity(capacity)
        .token(token)
        .metrics(stats.clone())
        .build()?;
    info!(stages = pipeline.stage_count(), upto, "pipeline started");

    let mut outcomes = crossbeam::scope(|s| {
        let source = &pipeline;
        s.spawn(move |_| {
            for n in 0..=upto {
                if let Err(err) = source.submit(n) {
                    warn!(%err, "stopped feeding pipeline");
                    break;
                }
            }
            source.close_input();
        });
        pipeline.collect()
    })
    .map_err(|_| anyhow!("pipeline feeder panicked"))?;
    pipeline.join()?;

    // The square stage may reorder items when it has more than one worker.
    outcomes.sort_by_key(|job| job.seq);
    for Job { seq, payload } in outcomes {
        match payload {
            Ok(value) => println!("{} -> {}", seq.unwrap_or_default(), value),
            Err(err) => println!("{} failed: {}", seq.unwrap_or_default(), err),
        }
    }

    info!(%stats, "pipeline finished");
    check_cancelled(token)
}

/// Join every handle, returning the values of the threads that finished
/// and the number that panicked.
fn join_counting_panics<T>(handles: Vec<ScopedJoinHandle<'_, T>>) -> (Vec<T>, usize) {
    let mut values = Vec::with_capacity(handles.len());
    let mut panicked = 0;
    for handle in handles {
        match handle.join() {
            Ok(value) => values.push(value),
            Err(_) => panicked += 1,
        }
    }
    (values, panicked)
}

fn run_prodcons(
    producers: usize,
    consumers: usize,
    items: usize,
    capacity: usize,
    token: &CancellationToken,
) -> Result<()> {
    let queue = BoundedQueue::with_cancellation(capacity, token)?;

    let (consumed, failed_producers, failed_consumers) = crossbeam::scope(|s| {
        let producer_handles: Vec<_> = (1..=producers)
            .map(|id| {
                let queue = &queue;
                s.spawn(move |_| {
                    for item in 1..=items {
                        if queue.len() == queue.capacity() {
                            info!(producer = id, item, "queue full, waiting");
                        }
                        if queue.put(item).is_err() {
                            return;
                        }
                        info!(producer = id, item, "added item");
                        random_delay(50);
                    }
                })
            })
            .collect();

        let consumer_handles: Vec<_> = (1..=consumers)
            .map(|id| {
                let queue = &queue;
                s.spawn(move |_| {
                    let mut eaten = 0usize;
                    while let Ok(item) = queue.take() {
                        info!(consumer = id, item, "took item");
                        eaten += 1;
                        random_delay(70);
                    }
                    eaten
                })
            })
            .collect();

        let (_, failed_producers) = join_counting_panics(producer_handles);
        queue.close();

        let (eaten, failed_consumers) = join_counting_panics(consumer_handles);
        let eaten: usize = eaten.into_iter().sum();
        (eaten, failed_producers, failed_consumers)
    })
    .map_err(|_| anyhow!("producer/consumer thread panicked"))?;

    if failed_producers > 0 || failed_consumers > 0 {
        bail!(
            "{} producer(s) and {} consumer(s) panicked",
            failed_producers,
            failed_consumers
        );
    }
    println!("{} of {} items consumed", consumed, producers * items);
    check_cancelled(token)
}
