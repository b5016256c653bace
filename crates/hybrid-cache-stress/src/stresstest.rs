use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use hybrid_cache::caching::HybridCache;
use hybrid_cache::config::Config as CacheConfig;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{WorkloadsConfig, process_payload};

pub async fn perform_stresstest(
    cache_config: CacheConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let cache = HybridCache::from_config(&cache_config).context("failed to create cache")?;
    println!(
        "Cache: distributed tier {}",
        if cache.has_distributed_cache() {
            "enabled"
        } else {
            "disabled"
        }
    );

    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .map(|workload| (workload.concurrency, Arc::new(workload.payload)))
        .collect();

    // warmup: run each workload once to make sure caches are warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(_, workload)| {
            let cache = cache.clone();
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                let computations = Arc::default();
                if let Err(err) = process_payload(&cache, &workload, 0, &computations).await {
                    println!("Warmup failed: {err}");
                }
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, workload) in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let cache = cache.clone();

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let iterations = Arc::new(AtomicUsize::new(0));
            let errors = Arc::new(AtomicUsize::new(0));
            let computations = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let cache = cache.clone();
                        let task_durations = Arc::clone(&task_durations);
                        let errors = Arc::clone(&errors);
                        let computations = Arc::clone(&computations);
                        let iteration = iterations.fetch_add(1, Ordering::Relaxed);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            if process_payload(&cache, &workload, iteration, &computations)
                                .await
                                .is_err() {
                                errors.fetch_add(1, Ordering::Relaxed);
                            }

                            transaction.finish();

                            task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap();
                std::mem::take(&mut task_durations)
            };

            let errors = errors.load(Ordering::Relaxed);
            let computations = computations.load(Ordering::Relaxed);
            (concurrency, task_durations, errors, computations)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, task_durations, errors, computations) = task.unwrap();

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {computations} computations, {errors} errors"
        );
        if ops == 0 {
            continue;
        }

        let avg = Duration::from_secs_f64(task_durations.sum().unwrap() / ops as f64);
        let p50 = Duration::from_secs_f64(task_durations.quantile(0.5).unwrap().unwrap());
        let p90 = Duration::from_secs_f64(task_durations.quantile(0.9).unwrap().unwrap());
        let p99 = Duration::from_secs_f64(task_durations.quantile(0.99).unwrap().unwrap());
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    Ok(())
}
