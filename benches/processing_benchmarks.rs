//! Performance benchmarks for job processing.
//!
//! Tracks the per-job cost of the hot path so regressions show up before
//! they cap throughput:
//! - retry decision for every outcome class
//! - payload validation and message building per handler
//! - full worker cycles over the in-memory queue

use std::hint::black_box;

use chrono::Utc;
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use missive_core::{DeliveryOutcome, Job, QueueKind, ReceiptHandle};
use missive_testing::{digest_job, email_jobs, EmailJobBuilder, TestEnv};
use missive_worker::{HandlerRegistry, RetryPolicy};
use tokio::runtime::Runtime;

/// Benchmarks the retry decision.
fn bench_retry_decision(c: &mut Criterion) {
    let policy = RetryPolicy::default();
    let outcomes = [
        ("success", DeliveryOutcome::Success),
        ("transient", DeliveryOutcome::transient("connection reset")),
        ("permanent", DeliveryOutcome::permanent("550 mailbox unavailable")),
    ];

    let mut group = c.benchmark_group("retry_decision");
    for (name, outcome) in &outcomes {
        group.bench_with_input(BenchmarkId::from_parameter(name), outcome, |b, outcome| {
            b.iter(|| policy.decide(black_box(2), black_box(outcome)));
        });
    }
    group.finish();
}

/// Benchmarks handler routing and message building.
fn bench_message_building(c: &mut Criterion) {
    let registry = HandlerRegistry::with_builtin("office@school.example");
    let receipt = ReceiptHandle::new(QueueKind::Regular, "bench");

    let mut group = c.benchmark_group("message_building");
    let email = Job::from_envelope(EmailJobBuilder::new().build(), receipt.clone(), Utc::now());
    group.bench_function("send_email", |b| {
        b.iter(|| {
            let handler = registry.resolve(&email.job_type).ok()?;
            handler.build(black_box(&email)).ok()
        });
    });

    for items in [1, 10, 50] {
        let digest = Job::from_envelope(digest_job("bench", items), receipt.clone(), Utc::now());
        group.bench_with_input(BenchmarkId::new("send_digest", items), &digest, |b, job| {
            b.iter(|| {
                let handler = registry.resolve(&job.job_type).ok()?;
                handler.build(black_box(job)).ok()
            });
        });
    }
    group.finish();
}

/// Benchmarks whole cycles: poll, process, ack.
fn bench_worker_cycles(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("worker_cycle");
    for jobs in [10, 100] {
        group.throughput(Throughput::Elements(jobs as u64));
        group.bench_with_input(BenchmarkId::new("drain", jobs), &jobs, |b, &jobs| {
            b.iter_batched(
                || {
                    rt.block_on(async {
                        let env = TestEnv::new().await;
                        env.enqueue_all(QueueKind::Regular, &email_jobs("bench", jobs))
                            .await
                            .unwrap();
                        env
                    })
                },
                |mut env| rt.block_on(async { env.run_until_idle().await.unwrap() }),
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_retry_decision, bench_message_building, bench_worker_cycles);
criterion_main!(benches);
