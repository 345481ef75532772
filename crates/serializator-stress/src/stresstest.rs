use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::Semaphore;

use serializator_service::caching::Serializator;
use serializator_service::config::Config;
use serializator_service::test::Student;

use crate::workloads::{WorkloadsConfig, process_workload, student};

#[derive(Debug, Default)]
struct Counts {
    ops: AtomicUsize,
    errors: AtomicUsize,
}

pub async fn perform_stresstest(
    service_config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let serializator = Serializator::<Student>::new(&service_config)
        .context("failed to create the serializator")?;
    serializator
        .clear_tmp()
        .context("failed to clear temporary files")?;
    let serializator = Arc::new(serializator);

    // warmup: write each key once so readers find a file
    {
        let start = Instant::now();

        let keys: BTreeSet<_> = workloads.workloads.iter().map(|w| w.key.as_str()).collect();
        let futures = keys
            .into_iter()
            .map(|key| serializator.serialize(student(key, 0), key));

        for result in futures::future::join_all(futures).await {
            result.context("warmup failed")?;
        }

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.workloads.len());
    for workload in workloads.workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let serializator = Arc::clone(&serializator);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency.max(1);
            let key: Arc<str> = workload.key.into();
            let operation = workload.operation;
            let counts = Arc::new(Counts::default());
            let semaphore = Arc::new(Semaphore::new(concurrency));
            let mut round = 0;

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let serializator = Arc::clone(&serializator);
                        let counts = Arc::clone(&counts);
                        let key = Arc::clone(&key);
                        round += 1;

                        tokio::spawn(async move {
                            let result = process_workload(&serializator, &key, operation, round).await;

                            counts.ops.fetch_add(1, Ordering::Relaxed);
                            if result.is_err() {
                                counts.errors.fetch_add(1, Ordering::Relaxed);
                            }

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            // outstanding tasks are counted as well
            let ops = counts.ops.load(Ordering::Relaxed);
            let errors = counts.errors.load(Ordering::Relaxed);
            (concurrency, operation, ops, errors)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, operation, ops, errors) = task.context("workload panicked")?;

        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} ({operation:?}, concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {errors} errors"
        );
    }

    Ok(())
}
