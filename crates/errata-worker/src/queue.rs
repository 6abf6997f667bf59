//! A small Postgres-backed task queue.
//!
//! Tasks are single-shot: a row is dequeued with `FOR UPDATE SKIP
//! LOCKED`, heartbeated while it runs, deleted on success, and
//! rescheduled on failure. Each task type carries its own deadline,
//! enforced with a timeout; the dropped future rolls back whatever
//! transaction was in flight.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use sqlx::types::Json as SqlJson;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// BoxedRaw is a type-erased raw JSON message.
type BoxedRaw = Box<serde_json::value::RawValue>;

/// TaskType is the type of a task, and maps it to an Executor.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
    sqlx::Type,
)]
#[sqlx(transparent)]
pub struct TaskType(pub i16);

/// Executor is the trait implemented by executors of each task type.
pub trait Executor: Send + Sync + 'static {
    const TASK_TYPE: TaskType;

    type Params: DeserializeOwned + Send;

    /// Deadline applied to each execution.
    fn deadline(&self) -> Duration;

    fn execute(
        &self,
        params: Self::Params,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

trait ObjSafe: Send + Sync + 'static {
    fn task_type(&self) -> TaskType;
    fn execute<'s>(&'s self, params: &'s str) -> BoxFuture<'s, anyhow::Result<()>>;
}

impl<E: Executor> ObjSafe for E {
    fn task_type(&self) -> TaskType {
        E::TASK_TYPE
    }

    fn execute<'s>(&'s self, params: &'s str) -> BoxFuture<'s, anyhow::Result<()>> {
        Box::pin(async move {
            let params: E::Params =
                serde_json::from_str(params).context("decoding task params")?;
            tokio::time::timeout(self.deadline(), Executor::execute(self, params))
                .await
                .map_err(|_| anyhow::anyhow!("task deadline exceeded"))?
        })
    }
}

/// Server holds registered Executor implementations and serves them.
pub struct Server(Vec<Arc<dyn ObjSafe>>);

impl Server {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Register an Executor to be served by this Server.
    pub fn register<E: Executor>(mut self, executor: E) -> Self {
        let index = match self
            .0
            .binary_search_by_key(&E::TASK_TYPE, |entry| entry.task_type())
        {
            Ok(_index) => panic!("an Executor for {:?} is already registered", E::TASK_TYPE),
            Err(index) => index,
        };
        self.0.insert(index, Arc::new(executor));
        self
    }

    /// Serve dequeued tasks until `shutdown` resolves, then wait for
    /// the running ones to finish.
    pub async fn serve(
        self,
        permits: u32,
        pool: sqlx::PgPool,
        dequeue_interval: Duration,
        heartbeat_timeout: Duration,
        shutdown: impl std::future::Future<Output = ()>,
    ) {
        let task_types: Vec<i16> = self.0.iter().map(|e| e.task_type().0).collect();
        let semaphore = Arc::new(Semaphore::new(permits as usize));
        tokio::pin!(shutdown);

        loop {
            // Hold off until at least one permit frees up, then claim
            // every available permit and dequeue up to that many tasks.
            if semaphore.available_permits() == 0 {
                let waited = tokio::select! {
                    permit = semaphore.clone().acquire_owned() => permit.expect("semaphore never closes"),
                    () = &mut shutdown => break,
                };
                drop(waited);
            }
            let mut held = semaphore
                .clone()
                .acquire_many_owned(semaphore.available_permits() as u32)
                .await
                .expect("semaphore never closes");

            let dequeued =
                match dequeue_tasks(&task_types, held.num_permits() as i64, heartbeat_timeout, &pool)
                    .await
                {
                    Ok(dequeued) => dequeued,
                    Err(err) => {
                        tracing::error!(?err, "failed to dequeue tasks (will retry)");
                        Vec::new()
                    }
                };
            let idle = dequeued.is_empty();

            for task in dequeued {
                let Ok(index) = task_types.binary_search(&task.task_type.0) else {
                    panic!("dequeued task {} with unexpected {:?}", task.task_id, task.task_type);
                };
                let executor = self.0[index].clone();
                let permit = held.split(1).expect("a permit per dequeued task");
                tokio::spawn(run_task(executor, task, pool.clone(), heartbeat_timeout, permit));
            }
            drop(held);

            if idle {
                // Jitter the idle sleep so concurrent workers spread
                // their dequeue attempts.
                let jitter = 0.9 + rand::random::<f64>() * 0.2;
                tokio::select! {
                    () = tokio::time::sleep(dequeue_interval.mul_f64(jitter)) => (),
                    () = &mut shutdown => break,
                }
            }
        }

        tracing::info!("task loop signaled to stop and is awaiting running tasks");
        let _ = semaphore
            .acquire_many_owned(permits)
            .await
            .expect("semaphore never closes");
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DequeuedTask {
    task_id: i64,
    task_type: TaskType,
    params: SqlJson<BoxedRaw>,
}

async fn dequeue_tasks(
    task_types: &[i16],
    limit: i64,
    heartbeat_timeout: Duration,
    pool: &sqlx::PgPool,
) -> sqlx::Result<Vec<DequeuedTask>> {
    sqlx::query_as(
        r#"
        WITH picked AS (
            SELECT task_id
            FROM tasks
            WHERE task_type = ANY($1)
              AND wake_at <= NOW()
              AND heartbeat < NOW() - make_interval(secs => $2)
            ORDER BY wake_at
            LIMIT $3
            FOR UPDATE SKIP LOCKED
        )
        UPDATE tasks
        SET heartbeat = NOW()
        WHERE task_id IN (SELECT task_id FROM picked)
        RETURNING task_id, task_type, params
        "#,
    )
    .bind(task_types)
    .bind(heartbeat_timeout.as_secs_f64())
    .bind(limit)
    .fetch_all(pool)
    .await
}

async fn run_task(
    executor: Arc<dyn ObjSafe>,
    task: DequeuedTask,
    pool: sqlx::PgPool,
    heartbeat_timeout: Duration,
    permit: OwnedSemaphorePermit,
) {
    let _permit = permit;
    let task_id = task.task_id;
    let task_type = task.task_type;

    let heartbeats = tokio::spawn(heartbeat_loop(
        task_id,
        heartbeat_timeout / 2,
        pool.clone(),
    ));
    let result = executor.execute(task.params.0.get()).await;
    heartbeats.abort();

    match result {
        Ok(()) => {
            if let Err(err) = sqlx::query("DELETE FROM tasks WHERE task_id = $1")
                .bind(task_id)
                .execute(&pool)
                .await
            {
                tracing::error!(task_id, ?err, "failed to delete completed task");
            }
        }
        Err(err) => {
            tracing::warn!(
                task_id,
                ?task_type,
                err = format!("{err:#}"),
                "task failed and will be retried"
            );
            if let Err(err) = sqlx::query(
                r#"
                UPDATE tasks
                SET wake_at = NOW() + make_interval(secs => $2), heartbeat = 'epoch'
                WHERE task_id = $1
                "#,
            )
            .bind(task_id)
            .bind(heartbeat_timeout.as_secs_f64())
            .execute(&pool)
            .await
            {
                tracing::error!(task_id, ?err, "failed to reschedule task");
            }
        }
    }
}

async fn heartbeat_loop(task_id: i64, interval: Duration, pool: sqlx::PgPool) {
    loop {
        tokio::time::sleep(interval).await;
        if let Err(err) = sqlx::query("UPDATE tasks SET heartbeat = NOW() WHERE task_id = $1")
            .bind(task_id)
            .execute(&pool)
            .await
        {
            tracing::warn!(task_id, ?err, "failed to heartbeat task");
        }
    }
}

/// Enqueue a task, waking any idle worker at its next dequeue.
pub async fn enqueue<P: serde::Serialize + Sync>(
    task_type: TaskType,
    params: &P,
    pool: &sqlx::PgPool,
) -> anyhow::Result<i64> {
    let (task_id,): (i64,) = sqlx::query_as(
        "INSERT INTO tasks (task_type, params) VALUES ($1, $2) RETURNING task_id",
    )
    .bind(task_type)
    .bind(SqlJson(params))
    .fetch_one(pool)
    .await
    .context("enqueueing task")?;
    Ok(task_id)
}
