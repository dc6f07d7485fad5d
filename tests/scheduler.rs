#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use chrono::{TimeDelta, TimeZone, Utc};
use claims::assert_some;
use family_jobs::scheduler::{
    Occurrence, PregenerationPlan, Recurrence, ScheduledJobDefinition, list_scheduled_jobs,
    materialize_due_jobs, pregenerate, register_scheduled_job, set_scheduled_job_enabled,
};
use family_jobs::{BackgroundJob, JobStatus, NewJob, Runner, connect, get_job, setup_database};
use insta::assert_compact_json_snapshot;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Test utilities and common setup
mod test_utils {
    use super::*;

    pub(super) async fn setup_test_db() -> anyhow::Result<SqlitePool> {
        let pool = connect("sqlite::memory:", 1).await?;
        setup_database(&pool).await?;
        Ok(pool)
    }

    pub(super) async fn row_count(pool: &SqlitePool) -> anyhow::Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM background_jobs")
            .fetch_one(pool)
            .await?)
    }

    pub(super) fn hourly_digest(first_run_at: chrono::DateTime<Utc>) -> ScheduledJobDefinition {
        ScheduledJobDefinition::new(
            "hourly-digest",
            "notifications",
            "send_digest",
            json!({ "family_id": 7 }),
            Recurrence::Interval { seconds: 3600 },
            first_run_at,
        )
    }
}

#[tokio::test]
async fn overdue_schedules_materialize_one_job_and_skip_ahead() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;
    let now = Utc::now();
    register_scheduled_job(&pool, &test_utils::hourly_digest(now - TimeDelta::minutes(90)))
        .await?;

    let job_ids = materialize_due_jobs(&pool, now).await?;
    assert_eq!(job_ids.len(), 1);

    let job = assert_some!(get_job(&pool, job_ids[0]).await?);
    assert_eq!(job.queue, "notifications");
    assert_eq!(job.job_type, "send_digest");
    assert_eq!(job.payload, json!({ "family_id": 7 }));
    assert_eq!(job.status, JobStatus::Pending);
    let key = assert_some!(job.idempotency_key);
    assert!(key.starts_with("schedule:hourly-digest:"), "{key}");

    let schedules = list_scheduled_jobs(&pool).await?;
    assert_eq!(schedules.len(), 1);
    assert!(schedules[0].next_run_at > now);
    assert_eq!(
        schedules[0].next_run_at,
        now - TimeDelta::minutes(90) + TimeDelta::hours(2)
    );

    // Nothing is due until the next occurrence.
    assert!(materialize_due_jobs(&pool, now).await?.is_empty());
    assert_eq!(test_utils::row_count(&pool).await?, 1);

    Ok(())
}

#[tokio::test]
async fn re_materializing_an_occurrence_returns_the_same_job() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;
    let now = Utc::now();
    let definition = test_utils::hourly_digest(now - TimeDelta::minutes(5));

    register_scheduled_job(&pool, &definition).await?;
    let first = materialize_due_jobs(&pool, now).await?;

    // Re-registering rewinds next_run_at to the occurrence that already ran.
    register_scheduled_job(&pool, &definition).await?;
    let second = materialize_due_jobs(&pool, now).await?;

    assert_eq!(first, second);
    assert_eq!(test_utils::row_count(&pool).await?, 1);

    Ok(())
}

#[tokio::test]
async fn disabled_schedules_are_skipped() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;
    let now = Utc::now();
    register_scheduled_job(&pool, &test_utils::hourly_digest(now - TimeDelta::minutes(5)))
        .await?;

    assert!(set_scheduled_job_enabled(&pool, "hourly-digest", false).await?);
    assert!(!set_scheduled_job_enabled(&pool, "no-such-schedule", false).await?);
    assert!(materialize_due_jobs(&pool, now).await?.is_empty());

    let schedules = list_scheduled_jobs(&pool).await?;
    assert!(!schedules[0].enabled);

    assert!(set_scheduled_job_enabled(&pool, "hourly-digest", true).await?);
    assert_eq!(materialize_due_jobs(&pool, now).await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn schedules_keep_their_definition() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;
    let first_run_at = Utc.with_ymd_and_hms(2030, 1, 31, 8, 0, 0).unwrap();
    let mut definition = ScheduledJobDefinition::new(
        "monthly-allowance",
        "default",
        "pay_allowance",
        json!({ "amount": 5 }),
        Recurrence::Monthly,
        first_run_at,
    );
    definition.priority = 2;
    definition.max_retries = 5;
    register_scheduled_job(&pool, &definition).await?;

    let schedules = list_scheduled_jobs(&pool).await?;
    let schedule = &schedules[0];
    assert_eq!(schedule.name, "monthly-allowance");
    assert_eq!(schedule.recurrence, Recurrence::Monthly);
    assert_eq!(schedule.priority, 2);
    assert_eq!(schedule.max_retries, 5);
    assert_eq!(schedule.next_run_at, first_run_at);
    assert!(schedule.enabled);

    // Not due yet.
    assert!(materialize_due_jobs(&pool, Utc::now()).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn pregeneration_is_idempotent() -> anyhow::Result<()> {
    let pool = test_utils::setup_test_db().await?;
    let start = Utc.with_ymd_and_hms(2030, 3, 1, 6, 0, 0).unwrap();
    let plan = PregenerationPlan::daily("chores:family-7", start, 7);

    let build = |_: &Occurrence| {
        NewJob::new("task_generation", "generate_task", json!({ "family_id": 7 }))
    };
    let first = pregenerate(&pool, &plan, build).await?;
    let second = pregenerate(&pool, &plan, build).await?;

    assert_eq!(first.len(), 7);
    assert_eq!(first, second);
    assert_eq!(test_utils::row_count(&pool).await?, 7);

    let first_job = assert_some!(get_job(&pool, first[0]).await?);
    assert_eq!(first_job.run_at, start);
    assert_eq!(
        first_job.idempotency_key.as_deref(),
        Some("chores:family-7:2030-03-01")
    );
    let last_job = assert_some!(get_job(&pool, first[6]).await?);
    assert_eq!(last_job.run_at, start + TimeDelta::days(6));

    Ok(())
}

#[tokio::test]
async fn monthly_plans_are_keyed_by_month() -> anyhow::Result<()> {
    let start = Utc.with_ymd_and_hms(2030, 11, 30, 6, 0, 0).unwrap();
    let plan = PregenerationPlan::monthly("allowance", start, 4);

    let keys = plan
        .occurrences()
        .into_iter()
        .map(|occurrence| occurrence.idempotency_key)
        .collect::<Vec<_>>();
    assert_compact_json_snapshot!(keys, @r#"["allowance:2030-11", "allowance:2030-12", "allowance:2031-01", "allowance:2031-02"]"#);

    Ok(())
}

#[tokio::test]
async fn the_runner_materializes_and_runs_scheduled_jobs() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct SendDigest {
        family_id: i64,
    }

    impl BackgroundJob for SendDigest {
        const JOB_TYPE: &'static str = "send_digest";
        const QUEUE: &'static str = "notifications";
        type Context = Arc<AtomicUsize>;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
            assert_eq!(self.family_id, 7);
            ctx.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let pool = test_utils::setup_test_db().await?;
    register_scheduled_job(
        &pool,
        &test_utils::hourly_digest(Utc::now() - TimeDelta::seconds(1)),
    )
    .await?;

    let runs = Arc::new(AtomicUsize::new(0));
    let runner = Runner::new(pool.clone(), runs.clone())
        .poll_interval(Duration::from_millis(10))
        .jitter(Duration::ZERO)
        .scheduler_interval(Duration::from_millis(10))
        .register::<SendDigest>();
    let handle = runner.start();

    tokio::time::timeout(Duration::from_secs(5), async {
        while runs.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    handle.shutdown().await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(test_utils::row_count(&pool).await?, 1);

    Ok(())
}
