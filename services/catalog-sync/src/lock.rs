// =============================================================================
// JOB LOCK MODULE
// =============================================================================
// At most one catalog sync may run at a time, across every replica of the
// service. The lock is a Redis key set with NX + PX:
//
//   SET catalog-sync:lock <token> NX PX <ttl>
//
// The random token makes release safe: a run only deletes the key if it still
// holds it, so a run that outlived its TTL can't free someone else's lock.
// While a run is in progress its holder pushes the expiry forward (`extend`),
// so the TTL only matters once the holder has died.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::error::SyncError;

/// Fixed job name the lock key is derived from
pub const SYNC_JOB_NAME: &str = "catalog-sync";

/// Delete the key only if it still holds our token
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Push the expiry forward only if the key still holds our token
const EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Proof of ownership handed back to `release`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
pub trait JobLock: Send + Sync {
    /// `Ok(None)` means someone else holds the lock.
    async fn try_acquire(&self) -> Result<Option<LockToken>, SyncError>;

    /// Renew the TTL. `Ok(false)` means the lock is no longer ours.
    async fn extend(&self, token: &LockToken) -> Result<bool, SyncError>;

    async fn release(&self, token: LockToken) -> Result<(), SyncError>;
}

pub struct RedisJobLock {
    redis: ConnectionManager,
    key: String,
    ttl: Duration,
}

impl RedisJobLock {
    pub fn new(redis: ConnectionManager, job_name: &str, ttl: Duration) -> Self {
        Self {
            redis,
            key: format!("{job_name}:lock"),
            ttl,
        }
    }

    fn ttl_ms(&self) -> u64 {
        u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX)
    }
}

#[async_trait]
impl JobLock for RedisJobLock {
    async fn try_acquire(&self) -> Result<Option<LockToken>, SyncError> {
        let token = LockToken::generate();

        let reply: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(self.ttl_ms())
            .query_async(&mut self.redis.clone())
            .await?;

        if reply.is_some() {
            tracing::debug!(key = %self.key, "Acquired sync lock");
            Ok(Some(token))
        } else {
            tracing::debug!(key = %self.key, "Sync lock held elsewhere");
            Ok(None)
        }
    }

    async fn extend(&self, token: &LockToken) -> Result<bool, SyncError> {
        let extended: i64 = redis::Script::new(EXTEND_SCRIPT)
            .key(&self.key)
            .arg(token.as_str())
            .arg(self.ttl_ms())
            .invoke_async(&mut self.redis.clone())
            .await?;
        Ok(extended == 1)
    }

    async fn release(&self, token: LockToken) -> Result<(), SyncError> {
        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(token.as_str())
            .invoke_async(&mut self.redis.clone())
            .await?;

        if released == 0 {
            tracing::warn!(key = %self.key, "Sync lock expired before release");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(LockToken::generate(), LockToken::generate());
    }

    #[test]
    fn test_scripts_compare_token_before_touching_key() {
        for script in [RELEASE_SCRIPT, EXTEND_SCRIPT] {
            assert!(script.contains("redis.call('GET', KEYS[1]) == ARGV[1]"));
        }
        assert!(EXTEND_SCRIPT.contains("PEXPIRE"));
    }
}
