use ::redis::{Client, Script, aio::ConnectionManager};
use async_trait::async_trait;
use chrono::Utc;
use std::{fmt, time::Duration};
use tracing::{debug, info, warn};

use super::{QueueError, QueueResult, StalledSweep, WorkQueue};
use crate::{
    error::JobError,
    job::{Job, JobId, JobLease, JobPayload, LeaseToken, ScanReport},
};

const STALLED_REASON: &str = "job stalled more than allowable limit";

/// Moves the oldest waiting id to `active`, locks it and returns it with
/// its payload.
const DEQUEUE_LUA: &str = r#"
local id = redis.call("RPOPLPUSH", KEYS[1], KEYS[2])
if not id then
  return nil
end
local jobKey = ARGV[1] .. id
redis.call("SET", jobKey .. ":lock", ARGV[2], "PX", ARGV[3])
redis.call("HSET", jobKey, "processedOn", ARGV[4])
local data = redis.call("HGET", jobKey, "data")
return {id, data or ""}
"#;

/// Returns -1 when the caller no longer holds the lock.
const SETTLE_LUA: &str = r#"
if redis.call("GET", KEYS[4]) ~= ARGV[2] then
  return -1
end
redis.call("LREM", KEYS[1], -1, ARGV[1])
redis.call("ZADD", KEYS[2], ARGV[5], ARGV[1])
redis.call("HSET", KEYS[3], ARGV[3], ARGV[4], "finishedOn", ARGV[5])
redis.call("HINCRBY", KEYS[3], "attemptsMade", 1)
redis.call("DEL", KEYS[4])
return 0
"#;

const EXTEND_LOCK_LUA: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  redis.call("PEXPIRE", KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

const STALLED_LUA: &str = r#"
local requeued, failed = 0, 0
local ids = redis.call("LRANGE", KEYS[1], 0, -1)
for _, id in ipairs(ids) do
  local jobKey = ARGV[1] .. id
  if redis.call("EXISTS", jobKey .. ":lock") == 0 then
    redis.call("LREM", KEYS[1], 1, id)
    local stalled = redis.call("HINCRBY", jobKey, "stalledCounter", 1)
    if stalled > tonumber(ARGV[2]) then
      redis.call("ZADD", KEYS[3], ARGV[3], id)
      redis.call("HSET", jobKey, "failedReason", ARGV[4], "finishedOn", ARGV[3])
      failed = failed + 1
    else
      redis.call("RPUSH", KEYS[2], id)
      requeued = requeued + 1
    end
  end
end
return {requeued, failed}
"#;

/// Connection and lease settings for [`RedisQueue`].
#[derive(Clone, Debug)]
pub struct RedisQueueConfig {
    /// `redis://` or `rediss://` connection URL.
    pub url: String,
    /// Queue name, shared with producers.
    pub name: String,
    /// Key prefix, `bull` for stock Bull producers.
    pub prefix: String,
    /// Lifetime of a job lock between renewals.
    pub lock_duration: Duration,
    /// Stalls tolerated before a job is failed instead of requeued.
    pub max_stalled_count: u32,
    /// Pause between empty dequeue attempts.
    pub poll_interval: Duration,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            name: "scan".to_string(),
            prefix: "bull".to_string(),
            lock_duration: Duration::from_secs(30),
            max_stalled_count: 1,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Key layout shared with Bull producers: everything lives under
/// `<prefix>:<queue>:`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueueKeys {
    base: String,
}

impl QueueKeys {
    /// Layout for queue `name` under `prefix`.
    pub fn new(prefix: &str, name: &str) -> Self {
        Self {
            base: format!("{prefix}:{name}:"),
        }
    }

    /// Common `<prefix>:<queue>:` prefix.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// List of job ids waiting to be leased.
    pub fn wait(&self) -> String {
        format!("{}wait", self.base)
    }

    /// List of leased job ids.
    pub fn active(&self) -> String {
        format!("{}active", self.base)
    }

    /// Sorted set of completed job ids.
    pub fn completed(&self) -> String {
        format!("{}completed", self.base)
    }

    /// Sorted set of failed job ids.
    pub fn failed(&self) -> String {
        format!("{}failed", self.base)
    }

    /// Hash holding the job payload and its settlement fields.
    pub fn job(&self, id: &JobId) -> String {
        format!("{}{id}", self.base)
    }

    /// Lock key whose value is the current lease token.
    pub fn lock(&self, id: &JobId) -> String {
        format!("{}{id}:lock", self.base)
    }
}

#[derive(Debug)]
struct Scripts {
    dequeue: Script,
    settle: Script,
    extend_lock: Script,
    stalled: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            dequeue: Script::new(DEQUEUE_LUA),
            settle: Script::new(SETTLE_LUA),
            extend_lock: Script::new(EXTEND_LOCK_LUA),
            stalled: Script::new(STALLED_LUA),
        }
    }
}

enum Outcome<'a> {
    Completed(&'a str),
    Failed(&'a str),
}

/// Bull-compatible queue on a shared multiplexed connection.
pub struct RedisQueue {
    conn: ConnectionManager,
    keys: QueueKeys,
    config: RedisQueueConfig,
    scripts: Scripts,
}

impl fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisQueue")
            .field("connection", &"ConnectionManager")
            .field("keys", &self.keys)
            .field("config", &self.config)
            .finish()
    }
}

impl RedisQueue {
    /// Opens the connection and checks it with a `PING`, so an unreachable
    /// backend fails startup instead of the first dequeue.
    pub async fn connect(config: RedisQueueConfig) -> QueueResult<Self> {
        info!(queue = %config.name, "connecting to redis work queue");
        let client = Client::open(config.url.as_str())?;
        let mut conn = ConnectionManager::new(client).await?;
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self {
            conn,
            keys: QueueKeys::new(&config.prefix, &config.name),
            config,
            scripts: Scripts::new(),
        })
    }

    /// Key layout this queue operates on.
    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    fn lock_millis(&self) -> u64 {
        self.config.lock_duration.as_millis() as u64
    }

    async fn try_dequeue(&self) -> QueueResult<Option<JobLease>> {
        let token = LeaseToken::new();
        let mut conn = self.conn.clone();
        let reply: Option<(String, String)> = self
            .scripts
            .dequeue
            .key(self.keys.wait())
            .key(self.keys.active())
            .arg(self.keys.base())
            .arg(token.to_string())
            .arg(self.lock_millis())
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        let Some((id, data)) = reply else {
            return Ok(None);
        };
        let id = JobId::new(id);

        match serde_json::from_str::<JobPayload>(&data) {
            Ok(payload) => Ok(Some(JobLease {
                job: Job::from_payload(id, payload),
                token,
            })),
            Err(err) => {
                warn!(job_id = %id, error = %err, "rejecting job with malformed payload");
                let lease = JobLease {
                    job: Job::new(id, Vec::new()),
                    token,
                };
                let reason = JobError::malformed_payload(&err).to_string();
                self.settle(&lease, Outcome::Failed(&reason)).await?;
                Ok(None)
            }
        }
    }

    async fn settle(&self, lease: &JobLease, outcome: Outcome<'_>) -> QueueResult<()> {
        let id = &lease.job.id;
        let (target, field, value) = match outcome {
            Outcome::Completed(value) => {
                (self.keys.completed(), "returnvalue", value)
            }
            Outcome::Failed(reason) => (self.keys.failed(), "failedReason", reason),
        };

        let mut conn = self.conn.clone();
        let status: i64 = self
            .scripts
            .settle
            .key(self.keys.active())
            .key(target)
            .key(self.keys.job(id))
            .key(self.keys.lock(id))
            .arg(id.as_str())
            .arg(lease.token.to_string())
            .arg(field)
            .arg(value)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        if status < 0 {
            return Err(QueueError::LockLost(id.clone()));
        }
        debug!(job_id = %id, field, "job settled");
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for RedisQueue {
    async fn dequeue(&self, wait: Duration) -> QueueResult<Option<JobLease>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(lease) = self.try_dequeue().await? {
                debug!(job_id = %lease.job.id, "job dequeued");
                return Ok(Some(lease));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let pause = self.config.poll_interval.min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }

    async fn extend_lock(&self, lease: &JobLease) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .scripts
            .extend_lock
            .key(self.keys.lock(&lease.job.id))
            .arg(lease.token.to_string())
            .arg(self.lock_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn resolve(
        &self,
        lease: &JobLease,
        report: &ScanReport,
    ) -> QueueResult<()> {
        let value = serde_json::to_string(report)?;
        self.settle(lease, Outcome::Completed(&value)).await
    }

    async fn reject(&self, lease: &JobLease, reason: &str) -> QueueResult<()> {
        self.settle(lease, Outcome::Failed(reason)).await
    }

    async fn recover_stalled(&self) -> QueueResult<StalledSweep> {
        let mut conn = self.conn.clone();
        let (requeued, failed): (usize, usize) = self
            .scripts
            .stalled
            .key(self.keys.active())
            .key(self.keys.wait())
            .key(self.keys.failed())
            .arg(self.keys.base())
            .arg(self.config.max_stalled_count)
            .arg(Utc::now().timestamp_millis())
            .arg(STALLED_REASON)
            .invoke_async(&mut conn)
            .await?;

        if requeued > 0 || failed > 0 {
            warn!(requeued, failed, "recovered stalled jobs");
        }
        Ok(StalledSweep { requeued, failed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_bull_layout() {
        let keys = QueueKeys::new("bull", "scan");
        let id = JobId::new("42");
        assert_eq!(keys.wait(), "bull:scan:wait");
        assert_eq!(keys.active(), "bull:scan:active");
        assert_eq!(keys.completed(), "bull:scan:completed");
        assert_eq!(keys.failed(), "bull:scan:failed");
        assert_eq!(keys.job(&id), "bull:scan:42");
        assert_eq!(keys.lock(&id), "bull:scan:42:lock");
    }
}
