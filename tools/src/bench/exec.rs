use super::*;
use bounded_executor::Pool;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// Tasks sleep in slices no longer than this, so they notice cancellation
const SLICE: Duration = Duration::from_millis(10);

#[derive(Default)]
struct Counters {
    submitted: AtomicUsize,
    finished: AtomicUsize,
    interrupted: AtomicUsize,
    outstanding: AtomicIsize,
    peak_outstanding: AtomicIsize,
}

/// Travels inside a task and decrements the outstanding count when the task
/// is dropped, whether it ran, panicked or was handed back unstarted.
struct Outstanding(Arc<Counters>);

impl Drop for Outstanding {
    fn drop(&mut self) {
        self.0.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Outcome {
    Completed,
    DeadlineExpired,
    Cancelled,
}

/// Sleeps for `duration` unless cancelled first; returns `false` if cancelled.
fn busy(duration: Duration, cancel: &CancellationToken) -> bool {
    let Some(deadline) = Instant::now().checked_add(duration) else {
        return false;
    };

    loop {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        if cancel.is_cancelled() {
            return false;
        }
        std::thread::sleep((deadline - now).min(SLICE));
    }
}

fn task_duration(args: &Command) -> Duration {
    let duration: Duration = args.duration.into();
    match args.jitter {
        Some(jitter) if !jitter.is_zero() => {
            duration.saturating_add(rand::rng().random_range(Duration::ZERO..=*jitter))
        }
        _ => duration,
    }
}

async fn submitter(index: usize, args: Arc<Command>, pool: Arc<Pool>, counters: Arc<Counters>) {
    for seq_no in (index..args.tasks).step_by(args.submitters()) {
        let duration = task_duration(&args);
        let panics = args.panics(seq_no);
        let cancel = pool.child_token();
        let task_counters = counters.clone();
        let outstanding = Outstanding(counters.clone());

        let task = move || {
            let _outstanding = outstanding;
            if panics {
                panic!("Task {seq_no} panicked on request");
            }
            if busy(duration, &cancel) {
                task_counters.finished.fetch_add(1, Ordering::Relaxed);
            } else {
                task_counters.interrupted.fetch_add(1, Ordering::Relaxed);
            }
        };

        if let Err(e) = pool.submit_async(task).await {
            // The rejected task was dropped without ever being counted
            counters.outstanding.fetch_add(1, Ordering::SeqCst);
            debug!("Submitter {index} stopped at task {seq_no}: {e}");
            return;
        }

        // Counted after admission, so this never overstates the true number
        counters.submitted.fetch_add(1, Ordering::Relaxed);
        let now = counters.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_outstanding.fetch_max(now, Ordering::SeqCst);
    }
}

async fn wait_for_termination(pool: &Pool) {
    while !pool.await_termination(time::Duration::ZERO) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn run_to_completion(submitters: &mut JoinSet<()>, pool: &Pool) -> anyhow::Result<()> {
    while let Some(r) = submitters.join_next().await {
        r.map_err(|e| anyhow::anyhow!("Submitter terminated unexpectedly: {e}"))?;
    }

    pool.shutdown();
    wait_for_termination(pool).await;
    Ok(())
}

async fn exec_async(args: Command, config: Config) -> anyhow::Result<()> {
    let args = Arc::new(args);
    let pool = Arc::new(
        Pool::with_config(config).map_err(|e| anyhow::anyhow!("Failed to start pool: {e}"))?,
    );
    let counters = Arc::new(Counters::default());

    println!(
        "Running {} tasks of {} from {} submitters, {} permits, {}..={} workers",
        args.tasks,
        args.duration,
        args.submitters(),
        config.permits(),
        config.minimum(),
        config.maximum()
    );

    let cancel_token = CancellationToken::new();
    cancel::listen_for_cancel(&cancel_token);

    let start = Instant::now();
    let mut submitters = JoinSet::new();
    for index in 0..args.submitters() {
        submitters.spawn(submitter(
            index,
            args.clone(),
            pool.clone(),
            counters.clone(),
        ));
    }

    let deadline = async {
        match args.deadline {
            Some(deadline) => tokio::time::sleep(*deadline).await,
            None => std::future::pending().await,
        }
    };

    let outcome = tokio::select! {
        r = run_to_completion(&mut submitters, &pool) => {
            r?;
            Outcome::Completed
        }
        _ = deadline => Outcome::DeadlineExpired,
        _ = cancel_token.cancelled() => Outcome::Cancelled,
    };

    let mut unstarted = 0;
    if !matches!(outcome, Outcome::Completed) {
        if matches!(outcome, Outcome::DeadlineExpired) {
            warn!("Deadline expired, stopping pool");
        }
        unstarted = pool.shutdown_now().len();

        // Submitters still waiting for a permit are rejected by the shutdown
        while let Some(r) = submitters.join_next().await {
            r.map_err(|e| anyhow::anyhow!("Submitter terminated unexpectedly: {e}"))?;
        }
        wait_for_termination(&pool).await;
    }
    let elapsed = start.elapsed();

    // Stop waiting for signals
    cancel_token.cancel();

    let stats = pool.stats();
    let permits = config.permits();
    let peak = counters.peak_outstanding.load(Ordering::SeqCst);
    info!("Final pool statistics: {stats:?}");

    println!(
        "Submitted {} of {} tasks in {}",
        counters.submitted.load(Ordering::Relaxed),
        args.tasks,
        humantime::format_duration(Duration::from_millis(elapsed.as_millis() as u64))
    );
    println!(
        "Finished: {}, interrupted: {}, panicked: {}, never started: {unstarted}",
        counters.finished.load(Ordering::Relaxed),
        counters.interrupted.load(Ordering::Relaxed),
        stats.panicked_tasks
    );
    if !elapsed.is_zero() {
        println!(
            "Throughput: {:.1} tasks/s",
            stats.completed_tasks as f64 / elapsed.as_secs_f64()
        );
    }
    println!("Peak outstanding: {peak} of {permits} permits");

    if peak > permits as isize {
        return Err(anyhow::anyhow!(
            "Admission bound violated: {peak} tasks outstanding with {permits} permits"
        ));
    }
    if pool.available_permits() != permits {
        return Err(anyhow::anyhow!(
            "{} admission permits were not released",
            permits - pool.available_permits()
        ));
    }
    Ok(())
}

pub fn exec(args: Command, config: Config) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build tokio runtime: {e}"))?
        .block_on(exec_async(args, config))
}
