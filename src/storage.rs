use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};

use crate::policy::{RetryPolicy, Schedule};
use crate::schema::{QueueJobRow, RepeatableJobRow};

/// Finds the next job on the queue that is unlocked, due, and not yet
/// exhausted. The row stays locked for the lifetime of `tx`.
pub(crate) async fn find_next_unlocked_job_tx(
    tx: &mut Transaction<'_, Postgres>,
    queue: &str,
    job_types: &[String],
    max_attempts: u32,
) -> Result<QueueJobRow, sqlx::Error> {
    sqlx::query_as::<_, QueueJobRow>(
        r"
        SELECT id, queue, job_type, data, priority, retries, last_retry, next_attempt_at, created_at
        FROM queue_jobs
        WHERE queue = $1
          AND job_type = ANY($2)
          AND next_attempt_at <= NOW()
          AND retries < $3
        ORDER BY priority DESC, id ASC
        FOR UPDATE SKIP LOCKED
        LIMIT 1
        ",
    )
    .bind(queue)
    .bind(job_types)
    .bind(max_attempts as i32)
    .fetch_one(&mut **tx)
    .await
}

/// Deletes a job that has successfully completed running.
pub(crate) async fn delete_successful_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM queue_jobs WHERE id = $1")
        .bind(job_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Marks that we just tried and failed to run a job, pushing the next
/// attempt out per the queue's retry policy. Once `retries` reaches the
/// policy ceiling the row is no longer claimable and is kept for diagnosis
/// until the cleaner prunes it.
pub(crate) async fn update_failed_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
    attempts_so_far: u32,
    policy: &RetryPolicy,
) -> Result<(), sqlx::Error> {
    let delay = policy.delay_for_attempt(attempts_so_far + 1);
    sqlx::query(
        r"
        UPDATE queue_jobs
        SET retries = retries + 1,
            last_retry = NOW(),
            next_attempt_at = NOW() + $2::interval
        WHERE id = $1
        ",
    )
    .bind(job_id)
    .bind(format!("{} milliseconds", delay.as_millis()))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Deletes failed queue rows older than the diagnostic window. Backoff
/// never reaches anywhere near the window, so any row still carrying
/// failures by then is exhausted.
pub(crate) async fn prune_failed_jobs(
    pool: &PgPool,
    older_than_days: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r"
        DELETE FROM queue_jobs
        WHERE retries > 0
          AND last_retry < NOW() - make_interval(days => $1::int)
        ",
    )
    .bind(older_than_days as i32)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Materializes every due repeatable registration into a live queue row and
/// advances its `next_run_at` per the stored schedule.
///
/// Runs in a single transaction so two scheduler instances never enqueue
/// the same occurrence twice.
pub(crate) async fn materialize_due_repeatables(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let due = sqlx::query_as::<_, RepeatableJobRow>(
        r"
        SELECT key, queue, job_type, data, schedule, next_run_at, created_at
        FROM repeatable_jobs
        WHERE next_run_at <= NOW()
        FOR UPDATE SKIP LOCKED
        ",
    )
    .fetch_all(&mut *tx)
    .await?;

    let mut enqueued = 0;
    for registration in due {
        // An occurrence is skipped while an identical unstarted one is still
        // waiting, so a slow job never stacks up behind itself. Rows with
        // failures are not "waiting": an exhausted occurrence must not
        // suppress the schedule until the cleaner gets to it.
        let result = sqlx::query(
            r"
            INSERT INTO queue_jobs (queue, job_type, data)
            SELECT $1, $2, $3
            WHERE NOT EXISTS (
                SELECT 1 FROM queue_jobs
                WHERE queue = $1 AND job_type = $2 AND data = $3 AND retries = 0
                FOR UPDATE SKIP LOCKED
            )
            ",
        )
        .bind(&registration.queue)
        .bind(&registration.job_type)
        .bind(&registration.data)
        .execute(&mut *tx)
        .await?;
        enqueued += result.rows_affected();

        let next = serde_json::from_str::<Schedule>(&registration.schedule)
            .ok()
            .filter(Schedule::is_repeating)
            .and_then(|schedule| schedule.next_occurrence(Utc::now()));

        match next {
            Some(next_run_at) => {
                sqlx::query("UPDATE repeatable_jobs SET next_run_at = $2 WHERE key = $1")
                    .bind(&registration.key)
                    .bind(next_run_at)
                    .execute(&mut *tx)
                    .await?;
            }
            // One-shot delays and corrupt schedules fire once and are gone.
            None => {
                sqlx::query("DELETE FROM repeatable_jobs WHERE key = $1")
                    .bind(&registration.key)
                    .execute(&mut *tx)
                    .await?;
            }
        }
    }

    tx.commit().await?;
    Ok(enqueued)
}
