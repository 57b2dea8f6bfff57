//! Per-key job queue and entity store commit overhead benchmarking.

use std::fmt;
use std::sync::Arc;

use failover_core::jobs::{
    run_state_machine_job, ActionExecutor, ComponentState, JobItem,
    JobItemCheck, JobItemDescription, JobQueueManager, RecordingFailFast,
    StateMachineAction,
};
use failover_core::store::{EntityStore, MemoryStore};
use failover_core::FailoverError;

use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion,
};

use futures::future::join_all;

use lazy_static::lazy_static;

use tokio::runtime::{Builder, Runtime};
use tokio::time::Duration;

static KEYS: [u64; 4] = [1, 4, 16, 64];
static JOBS_PER_KEY: usize = 64;

struct BenchId(pub u64, pub usize);

impl fmt::Display for BenchId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}keys@{}", self.0, self.1)
    }
}

struct NoopExecutor;

impl ActionExecutor for NoopExecutor {
    fn execute(&self, action: StateMachineAction) {
        black_box(action);
    }
}

lazy_static!(
    /// Runtime shared by all benchmark iterations.
    static ref RUNTIME: Runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(4)
        .build()
        .unwrap();
);

async fn drain_queue(keys: u64) -> Result<(), FailoverError> {
    let jobs = JobQueueManager::new("bench", RecordingFailFast::new());
    let mut completions = Vec::with_capacity(keys as usize * JOBS_PER_KEY);
    for _ in 0..JOBS_PER_KEY {
        for key in 0..keys {
            completions.push(jobs.enqueue(
                key,
                JobItem::new(JobItemDescription::MESSAGE_PROCESSING, async {
                    black_box(Ok(()))
                }),
            ));
        }
    }
    for result in join_all(completions.into_iter().map(|c| c.wait())).await {
        result?;
    }
    Ok(())
}

async fn commit_entities(keys: u64) -> Result<(), FailoverError> {
    let store: EntityStore<u64, u64> = EntityStore::new("bench", MemoryStore::new());
    for key in 0..keys {
        for _ in 0..JOBS_PER_KEY {
            run_state_machine_job(
                &store,
                &key,
                JobItemCheck::Default,
                ComponentState::Open,
                Duration::from_secs(1),
                &NoopExecutor,
                |locked, _| {
                    let next = locked.get().copied().unwrap_or(0) + 1;
                    locked.set(next);
                    Ok(())
                },
            )
            .await?;
        }
    }
    Ok(())
}

fn queue_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_queue");
    for keys in KEYS {
        group.bench_with_input(
            BenchmarkId::from_parameter(BenchId(keys, JOBS_PER_KEY)),
            &keys,
            |b, &keys| b.iter(|| RUNTIME.block_on(drain_queue(keys)).unwrap()),
        );
    }
    group.finish();
}

fn commit_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("entity_commit");
    for keys in KEYS {
        group.bench_with_input(
            BenchmarkId::from_parameter(BenchId(keys, JOBS_PER_KEY)),
            &keys,
            |b, &keys| b.iter(|| RUNTIME.block_on(commit_entities(keys)).unwrap()),
        );
    }
    group.finish();
}

criterion_group!(benches, queue_bench, commit_bench);
criterion_main!(benches);
