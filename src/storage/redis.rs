//! Redis-backed store for distributed execution.
//!
//! Workers on separate machines share one Redis instance: job records and
//! workflow topology live in plain keys, execution requests flow through a
//! Redis Stream with a consumer group.
//!
//! # Data Structures
//!
//! ## Queue (Streams-based)
//! - `spate:requests` (STREAM): request queue, consumer group `workers`.
//!   Each entry carries one serialized [`ExecutionRequest`]. The Pending
//!   Entries List tracks in-flight deliveries.
//! - `spate:requests:delayed` (ZSET): delayed requests
//!   (score = run_at millis), promoted by the worker maintenance tick.
//! - `spate:request:deliveries` (HASH): delivery count per request id.
//! - `spate:request:entries` (HASH): request id -> claimed stream entry id,
//!   so acknowledgment can XACK the right entry.
//!
//! ## Store
//! - `spate:workflow:{id}` (STRING): JSON job-name order for the workflow.
//! - `spate:workflow:{id}:restarted_from` (STRING): last restart parameter.
//! - `spate:job:{workflow_id}:{name}` (STRING): JSON job record.
//!
//! # Redelivery
//!
//! A claimed entry that is never acknowledged stays in the Pending Entries
//! List; `XAUTOCLAIM` hands it to the next dequeuing worker once it has
//! been idle longer than the stale timeout. That timeout is the queue's
//! redelivery backoff: `nack_request` simply leaves the entry unclaimed.

use super::{error::Result, error::StorageError, ExecutionRequest, Store};
use crate::core::{deserialize_value, serialize_value, Job};
use crate::graph::Workflow;
use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config, Pool, Runtime};
use redis::streams::{StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Stream key for the request queue.
const STREAM_KEY: &str = "spate:requests";

/// ZSET key for delayed requests.
const DELAYED_KEY: &str = "spate:requests:delayed";

/// Hash of delivery counts per request id.
const DELIVERIES_KEY: &str = "spate:request:deliveries";

/// Hash mapping request id to the claimed stream entry id.
const ENTRIES_KEY: &str = "spate:request:entries";

/// Consumer group name for the worker pool.
const CONSUMER_GROUP: &str = "workers";

/// Max stream length (approximate trimming for performance).
const MAX_STREAM_LEN: usize = 100_000;

/// Default idle time before an unacknowledged delivery is handed to
/// another worker (60 seconds).
const DEFAULT_STALE_TIMEOUT_MS: u64 = 60 * 1000;

/// Max delayed requests promoted per maintenance tick.
const PROMOTE_BATCH: isize = 100;

/// Redis store using an async connection pool and a Streams-based queue.
pub struct RedisStore {
    pool: Pool,
    stale_timeout_ms: u64,
}

impl RedisStore {
    /// Creates a Redis store with connection pooling.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use spate::storage::RedisStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let store = RedisStore::new("redis://127.0.0.1:6379").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(redis_url: &str) -> Result<Self> {
        Self::with_stale_timeout(redis_url, Duration::from_millis(DEFAULT_STALE_TIMEOUT_MS)).await
    }

    /// Creates a Redis store with an explicit stale-delivery timeout.
    /// Short timeouts are useful in tests.
    pub async fn with_stale_timeout(redis_url: &str, stale_timeout: Duration) -> Result<Self> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self {
            pool,
            stale_timeout_ms: stale_timeout.as_millis() as u64,
        };
        store.ensure_consumer_group().await?;
        Ok(store)
    }

    async fn get_connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// Ensures the consumer group exists, creating it if necessary.
    async fn ensure_consumer_group(&self) -> Result<()> {
        let mut conn = self.get_connection().await?;

        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(STREAM_KEY)
            .arg(CONSUMER_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut *conn)
            .await;

        match result {
            Ok(()) => {
                debug!("created consumer group '{}' for '{}'", CONSUMER_GROUP, STREAM_KEY);
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(StorageError::Redis(e)),
        }
    }

    fn workflow_key(workflow_id: Uuid) -> String {
        format!("spate:workflow:{}", workflow_id)
    }

    fn restart_key(workflow_id: Uuid) -> String {
        format!("spate:workflow:{}:restarted_from", workflow_id)
    }

    fn job_key(workflow_id: Uuid, name: &str) -> String {
        format!("spate:job:{}:{}", workflow_id, name)
    }

    /// Appends a request to the stream.
    async fn push_request(
        &self,
        conn: &mut deadpool_redis::Connection,
        request: &ExecutionRequest,
    ) -> Result<()> {
        let data = serialize_value(request)?;
        let _: String = redis::cmd("XADD")
            .arg(STREAM_KEY)
            .arg("MAXLEN")
            .arg("~")
            .arg(MAX_STREAM_LEN)
            .arg("*")
            .arg("request")
            .arg(data)
            .query_async(&mut **conn)
            .await?;
        Ok(())
    }

    /// Parses the serialized request out of a stream entry.
    fn parse_entry(entry: &StreamId) -> Result<ExecutionRequest> {
        let data: Vec<u8> = entry.get("request").ok_or_else(|| {
            StorageError::Connection(format!("stream entry {} missing request field", entry.id))
        })?;
        Ok(deserialize_value(&data)?)
    }

    /// Records the claim and returns the request with its delivery count.
    async fn claim_entry(
        &self,
        conn: &mut deadpool_redis::Connection,
        entry: &StreamId,
    ) -> Result<ExecutionRequest> {
        let mut request = Self::parse_entry(entry)?;
        let deliveries: i64 = conn
            .hincr(DELIVERIES_KEY, request.request_id.to_string(), 1)
            .await?;
        let _: () = conn
            .hset(ENTRIES_KEY, request.request_id.to_string(), &entry.id)
            .await?;
        request.deliveries = deliveries as u32;
        Ok(request)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn create_workflow(&self, workflow: &Workflow) -> Result<()> {
        let mut conn = self.get_connection().await?;

        let order: Vec<&str> = workflow.jobs().map(|job| job.name.as_str()).collect();
        let _: () = conn
            .set(Self::workflow_key(workflow.id()), serialize_value(&order)?)
            .await?;

        for job in workflow.jobs() {
            let _: () = conn
                .set(
                    Self::job_key(workflow.id(), &job.name),
                    serialize_value(job)?,
                )
                .await?;
        }
        Ok(())
    }

    async fn find_workflow(&self, workflow_id: Uuid) -> Result<Option<Workflow>> {
        let mut conn = self.get_connection().await?;

        let data: Option<Vec<u8>> = conn.get(Self::workflow_key(workflow_id)).await?;
        let Some(data) = data else {
            return Ok(None);
        };
        let order: Vec<String> = deserialize_value(&data)?;

        let mut jobs = Vec::with_capacity(order.len());
        for name in &order {
            let data: Option<Vec<u8>> = conn.get(Self::job_key(workflow_id, name)).await?;
            let data = data.ok_or_else(|| StorageError::JobNotFound {
                workflow_id,
                name: name.clone(),
            })?;
            jobs.push(deserialize_value(&data)?);
        }
        Ok(Some(Workflow::from_jobs(workflow_id, jobs)))
    }

    async fn find_job(&self, workflow_id: Uuid, name: &str) -> Result<Option<Job>> {
        let mut conn = self.get_connection().await?;
        let data: Option<Vec<u8>> = conn.get(Self::job_key(workflow_id, name)).await?;
        match data {
            Some(data) => Ok(Some(deserialize_value(&data)?)),
            None => Ok(None),
        }
    }

    async fn persist_job(&self, workflow_id: Uuid, job: &Job) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: () = conn
            .set(Self::job_key(workflow_id, &job.name), serialize_value(job)?)
            .await?;
        Ok(())
    }

    async fn enqueue_job(
        &self,
        workflow_id: Uuid,
        job: &Job,
        delay: Option<Duration>,
    ) -> Result<()> {
        let mut enqueued = job.clone();
        enqueued.mark_enqueued();
        self.persist_job(workflow_id, &enqueued).await?;

        let mut conn = self.get_connection().await?;
        match delay {
            Some(delay) if !delay.is_zero() => {
                let request = ExecutionRequest::delayed(workflow_id, &job.name, delay);
                let _: () = conn
                    .zadd(
                        DELAYED_KEY,
                        serialize_value(&request)?,
                        request.run_at.timestamp_millis(),
                    )
                    .await?;
            }
            _ => {
                let request = ExecutionRequest::new(workflow_id, &job.name);
                self.push_request(&mut conn, &request).await?;
            }
        }
        Ok(())
    }

    async fn restart_workflow(&self, workflow_id: Uuid, from: &Value) -> Result<()> {
        let mut conn = self.get_connection().await?;

        let data: Option<Vec<u8>> = conn.get(Self::workflow_key(workflow_id)).await?;
        let data = data.ok_or(StorageError::WorkflowNotFound(workflow_id))?;
        let order: Vec<String> = deserialize_value(&data)?;

        let _: () = conn
            .set(Self::restart_key(workflow_id), serialize_value(from)?)
            .await?;

        let mut initial = Vec::new();
        for name in &order {
            let data: Option<Vec<u8>> = conn.get(Self::job_key(workflow_id, name)).await?;
            let data = data.ok_or_else(|| StorageError::JobNotFound {
                workflow_id,
                name: name.clone(),
            })?;
            let mut job: Job = deserialize_value(&data)?;
            job.reset();
            let _: () = conn
                .set(Self::job_key(workflow_id, name), serialize_value(&job)?)
                .await?;
            if job.incoming.is_empty() {
                initial.push(job);
            }
        }
        drop(conn);

        for job in initial {
            self.enqueue_job(workflow_id, &job, None).await?;
        }
        Ok(())
    }

    async fn dequeue_request(&self, worker_id: &str) -> Result<Option<ExecutionRequest>> {
        let mut conn = self.get_connection().await?;

        // Stale deliveries first: entries another worker claimed but never
        // acknowledged become eligible again after the stale timeout.
        let reclaimed: StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(STREAM_KEY)
            .arg(CONSUMER_GROUP)
            .arg(worker_id)
            .arg(self.stale_timeout_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut *conn)
            .await?;

        if let Some(entry) = reclaimed.claimed.first() {
            debug!("reclaimed stale request entry {}", entry.id);
            return Ok(Some(self.claim_entry(&mut conn, entry).await?));
        }

        let opts = StreamReadOptions::default()
            .group(CONSUMER_GROUP, worker_id)
            .count(1);
        let reply: StreamReadReply = conn.xread_options(&[STREAM_KEY], &[">"], &opts).await?;

        let Some(entry) = reply.keys.first().and_then(|key| key.ids.first()) else {
            return Ok(None);
        };
        Ok(Some(self.claim_entry(&mut conn, entry).await?))
    }

    async fn ack_request(&self, request: &ExecutionRequest) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let request_id = request.request_id.to_string();

        let entry_id: Option<String> = conn.hget(ENTRIES_KEY, &request_id).await?;
        if let Some(entry_id) = entry_id {
            let _: i64 = redis::cmd("XACK")
                .arg(STREAM_KEY)
                .arg(CONSUMER_GROUP)
                .arg(&entry_id)
                .query_async(&mut *conn)
                .await?;
            let _: i64 = redis::cmd("XDEL")
                .arg(STREAM_KEY)
                .arg(&entry_id)
                .query_async(&mut *conn)
                .await?;
        }
        let _: () = conn.hdel(ENTRIES_KEY, &request_id).await?;
        let _: () = conn.hdel(DELIVERIES_KEY, &request_id).await?;
        Ok(())
    }

    async fn nack_request(&self, request: &ExecutionRequest) -> Result<()> {
        // The entry stays in the Pending Entries List; XAUTOCLAIM hands it
        // out again after the stale timeout. That timeout is the backoff.
        debug!(
            "request {} left for redelivery (delivery {})",
            request.request_id, request.deliveries
        );
        Ok(())
    }

    async fn move_ready_delayed_requests(&self) -> Result<usize> {
        let mut conn = self.get_connection().await?;
        let now = Utc::now().timestamp_millis();

        let ready: Vec<Vec<u8>> = redis::cmd("ZRANGEBYSCORE")
            .arg(DELAYED_KEY)
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut *conn)
            .await?;

        let mut moved = 0usize;
        for member in ready {
            let removed: i64 = conn.zrem(DELAYED_KEY, member.as_slice()).await?;
            if removed == 0 {
                // Another worker promoted it between the scan and the
                // remove.
                continue;
            }
            let request: ExecutionRequest = deserialize_value(&member)?;
            self.push_request(&mut conn, &request).await?;
            moved += 1;
        }
        Ok(moved)
    }
}
