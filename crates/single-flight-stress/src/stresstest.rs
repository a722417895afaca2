use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use single_flight::{LockSelector, SelectorConfig};
use sketches_ddsketch::DDSketch;

use crate::workloads::{Workload, WorkloadsConfig, run_round};

pub async fn perform_stresstest(
    selector_config: SelectorConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let selector = LockSelector::new(selector_config);

    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .map(|workload| (Arc::new(workload), Arc::new(AtomicU64::new(0))))
        .collect();

    // warmup: run each workload once to make sure it holds up at all
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(workload, attempts)| {
            let selector = selector.clone();
            let workload = Arc::clone(workload);
            let attempts = Arc::clone(attempts);
            tokio::spawn(async move { run_round(&selector, &workload, &attempts).await })
        });

        for (i, result) in futures::future::join_all(futures).await.into_iter().enumerate() {
            result
                .context("warmup panicked")?
                .with_context(|| format!("warmup of workload {i} failed"))?;
        }

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (workload, attempts) in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let selector = selector.clone();

        let task = tokio::spawn(async move {
            let round_durations = run_workload(&selector, &workload, &attempts, deadline).await?;
            anyhow::Ok((workload, round_durations))
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (workload, round_durations) = task.context("workload panicked")??;

        let ops = round_durations.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!(
            "Workload {i} ({mode:?}, concurrency: {concurrency}): {ops} rounds, {ops_ps:.2} rounds/s",
            mode = workload.mode,
            concurrency = workload.concurrency,
        );
        if ops == 0 {
            continue;
        }

        let avg = Duration::from_secs_f64(round_durations.sum().unwrap_or_default() / ops as f64);
        let p50 = quantile(&round_durations, 0.5);
        let p90 = quantile(&round_durations, 0.9);
        let p99 = quantile(&round_durations, 0.99);
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    Ok(())
}

/// Runs rounds of `workload` until `deadline` and records how long each one took.
///
/// A round in progress when the deadline passes still runs to completion, so no resolver
/// outlives the measurement.
async fn run_workload(
    selector: &LockSelector,
    workload: &Workload,
    attempts: &Arc<AtomicU64>,
    deadline: tokio::time::Instant,
) -> Result<DDSketch> {
    let mut round_durations = DDSketch::default();
    while tokio::time::Instant::now() < deadline {
        let round = run_round(selector, workload, attempts).await?;
        round_durations.add(round.as_secs_f64());
    }
    Ok(round_durations)
}

fn quantile(sketch: &DDSketch, q: f64) -> Duration {
    let secs = sketch.quantile(q).ok().flatten().unwrap_or_default();
    Duration::from_secs_f64(secs)
}
