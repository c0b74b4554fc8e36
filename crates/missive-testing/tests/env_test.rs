//! Tests for TestEnv wiring.

use std::time::Duration;

use anyhow::Result;
use missive_core::{DeliveryOutcome, QueueKind};
use missive_testing::{fixtures::malformed, EmailJobBuilder, TestEnv};
use missive_worker::CycleOutcome;

#[tokio::test]
async fn empty_environment_is_idle() -> Result<()> {
    let mut env = TestEnv::new().await;

    assert!(env.is_idle().await);
    assert_eq!(env.run_cycle().await?, CycleOutcome::Empty);
    let polls = env.polls().await;
    assert_eq!(polls.first(), Some(&QueueKind::Priority));
    assert!(polls[1..].iter().all(|queue| *queue == QueueKind::Regular));
    Ok(())
}

#[tokio::test]
async fn run_until_idle_delivers_enqueued_job() -> Result<()> {
    let mut env = TestEnv::new().await;
    env.enqueue(QueueKind::Regular, &EmailJobBuilder::new().id("job-1").build()).await?;

    env.run_until_idle().await?;

    assert_eq!(env.dispatcher.call_count().await, 1);
    assert_eq!(env.queue.acked().await.len(), 1);
    assert_eq!(env.stats().await.delivered, 1);
    Ok(())
}

#[tokio::test]
async fn scripted_outcomes_are_played_in_order() -> Result<()> {
    let mut env = TestEnv::builder()
        .outcomes([DeliveryOutcome::transient("throttled")])
        .build()
        .await;
    env.enqueue(QueueKind::Priority, &EmailJobBuilder::new().id("job-1").build()).await?;

    env.run_until_idle().await?;

    assert_eq!(env.dispatcher.call_count().await, 2);
    assert_eq!(env.queue.requeued().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn raw_bodies_reach_the_worker() -> Result<()> {
    let mut env = TestEnv::new().await;
    env.enqueue_raw(QueueKind::Regular, malformed::NOT_JSON).await;

    env.run_until_idle().await?;

    assert_eq!(env.dead_letters().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn advance_time_moves_the_shared_clock() {
    let env = TestEnv::new().await;

    env.advance_time(Duration::from_secs(90));

    assert_eq!(env.clock.elapsed(), Duration::from_secs(90));
}
