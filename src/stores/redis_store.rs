//! Redis-backed ephemeral store, lease lock, and event bus.
//!
//! Participant documents are JSON strings with a sibling version key; the
//! atomic read-modify-write is a version-checked Lua compare-and-set, the
//! same pattern the rest of the platform uses for its hot counters. The
//! script only returns success after Redis acknowledges the write, which is
//! the write barrier reconciliation reads rely on.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::RejectReason;
use crate::metrics::CAS_CONFLICTS_TOTAL;
use crate::models::events::QuizEvent;
use crate::models::{AcceptedAnswer, Participant, Session, SessionMeta, SessionStatus};
use crate::utils::retry::RetryPolicy;

use super::{CasExhausted, EventBus, LockManager, ParticipantUpdate, SessionStore};

const CAS_SCRIPT: &str = r#"
    local ver = tonumber(redis.call('GET', KEYS[2]) or '0')
    if ver ~= tonumber(ARGV[1]) then
        return 0
    end
    redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
    redis.call('SET', KEYS[2], ver + 1, 'EX', ARGV[3])
    redis.call('SADD', KEYS[3], ARGV[4])
    redis.call('EXPIRE', KEYS[3], ARGV[3])
    return 1
"#;

pub struct RedisSessionStore {
    redis: ConnectionManager,
    session_ttl_secs: u64,
}

impl RedisSessionStore {
    pub fn new(redis: ConnectionManager, session_ttl_secs: u64) -> Self {
        Self {
            redis,
            session_ttl_secs,
        }
    }

    fn meta_key(quiz_id: &str) -> String {
        format!("quizsession:{}:meta", quiz_id)
    }

    fn participant_key(quiz_id: &str, user_id: &str) -> String {
        format!("quizsession:{}:participant:{}", quiz_id, user_id)
    }

    fn version_key(quiz_id: &str, user_id: &str) -> String {
        format!("quizsession:{}:pver:{}", quiz_id, user_id)
    }

    fn members_key(quiz_id: &str) -> String {
        format!("quizsession:{}:members", quiz_id)
    }

    /// Consistent snapshot of document and version (single MGET).
    async fn load_participant(
        &self,
        quiz_id: &str,
        user_id: &str,
    ) -> Result<(u64, Option<Participant>)> {
        let mut conn = self.redis.clone();
        let (doc_json, version): (Option<String>, Option<u64>) = redis::cmd("MGET")
            .arg(Self::participant_key(quiz_id, user_id))
            .arg(Self::version_key(quiz_id, user_id))
            .query_async(&mut conn)
            .await
            .context("Failed to read participant document")?;

        let doc = match doc_json {
            Some(json) => Some(
                serde_json::from_str(&json).context("Failed to deserialize participant")?,
            ),
            None => None,
        };
        Ok((version.unwrap_or(0), doc))
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create_session(&self, meta: &SessionMeta) -> Result<bool> {
        let mut conn = self.redis.clone();
        let json = serde_json::to_string(meta).context("Failed to serialize session meta")?;
        let created: Option<String> = redis::cmd("SET")
            .arg(Self::meta_key(&meta.quiz_id))
            .arg(json)
            .arg("NX")
            .arg("EX")
            .arg(self.session_ttl_secs)
            .query_async(&mut conn)
            .await
            .context("Failed to create session meta")?;
        Ok(created.is_some())
    }

    async fn session_meta(&self, quiz_id: &str) -> Result<Option<SessionMeta>> {
        let mut conn = self.redis.clone();
        let json: Option<String> = redis::cmd("GET")
            .arg(Self::meta_key(quiz_id))
            .query_async(&mut conn)
            .await
            .context("Failed to read session meta")?;
        match json {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("Failed to deserialize session meta")?,
            )),
            None => Ok(None),
        }
    }

    async fn set_session_status(&self, quiz_id: &str, status: SessionStatus) -> Result<()> {
        let mut meta = self
            .session_meta(quiz_id)
            .await?
            .with_context(|| format!("session {} not found", quiz_id))?;
        meta.status = status;
        let mut conn = self.redis.clone();
        let json = serde_json::to_string(&meta)?;
        redis::cmd("SET")
            .arg(Self::meta_key(quiz_id))
            .arg(json)
            .arg("EX")
            .arg(self.session_ttl_secs)
            .query_async::<()>(&mut conn)
            .await
            .context("Failed to update session status")?;
        Ok(())
    }

    async fn read_session(&self, quiz_id: &str) -> Result<Option<Session>> {
        let meta = match self.session_meta(quiz_id).await? {
            Some(meta) => meta,
            None => return Ok(None),
        };

        let mut conn = self.redis.clone();
        let user_ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(Self::members_key(quiz_id))
            .query_async(&mut conn)
            .await
            .context("Failed to list session participants")?;

        let mut participants = HashMap::with_capacity(user_ids.len());
        for user_id in user_ids {
            if let (_, Some(doc)) = self.load_participant(quiz_id, &user_id).await? {
                participants.insert(user_id, doc);
            }
        }

        Ok(Some(Session { meta, participants }))
    }

    async fn get_participant(&self, quiz_id: &str, user_id: &str) -> Result<Option<Participant>> {
        let (_, doc) = self.load_participant(quiz_id, user_id).await?;
        Ok(doc)
    }

    async fn ensure_participant(
        &self,
        quiz_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let (version, existing) = self.load_participant(quiz_id, user_id).await?;
        if existing.is_some() {
            return Ok(false);
        }

        let doc = Participant::new(user_id, now);
        let json = serde_json::to_string(&doc).context("Failed to serialize participant")?;
        let mut conn = self.redis.clone();
        let committed: i64 = redis::Script::new(CAS_SCRIPT)
            .key(Self::participant_key(quiz_id, user_id))
            .key(Self::version_key(quiz_id, user_id))
            .key(Self::members_key(quiz_id))
            .arg(version)
            .arg(&json)
            .arg(self.session_ttl_secs)
            .arg(user_id)
            .invoke_async(&mut conn)
            .await
            .context("Participant create failed")?;

        // A lost race means someone else created it first, which is fine.
        Ok(committed == 1)
    }

    async fn update_participant(
        &self,
        quiz_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
        apply: ParticipantUpdate<'_>,
    ) -> Result<Result<AcceptedAnswer, RejectReason>> {
        let policy = RetryPolicy::for_cas();
        let mut attempts_left = policy.max_attempts;
        let mut backoff = policy.base_backoff;

        loop {
            let (version, existing) = self.load_participant(quiz_id, user_id).await?;
            let mut doc = existing.unwrap_or_else(|| Participant::new(user_id, now));

            let accepted = match apply(&mut doc) {
                Ok(accepted) => accepted,
                Err(reject) => return Ok(Err(reject)),
            };

            let json = serde_json::to_string(&doc).context("Failed to serialize participant")?;
            let mut conn = self.redis.clone();
            let committed: i64 = redis::Script::new(CAS_SCRIPT)
                .key(Self::participant_key(quiz_id, user_id))
                .key(Self::version_key(quiz_id, user_id))
                .key(Self::members_key(quiz_id))
                .arg(version)
                .arg(&json)
                .arg(self.session_ttl_secs)
                .arg(user_id)
                .invoke_async(&mut conn)
                .await
                .context("Participant compare-and-set failed")?;

            if committed == 1 {
                return Ok(Ok(accepted));
            }

            CAS_CONFLICTS_TOTAL.inc();
            tracing::debug!(
                "Participant CAS conflict: quiz={}, user={}, version={}",
                quiz_id,
                user_id,
                version
            );
            attempts_left = attempts_left.saturating_sub(1);
            if attempts_left == 0 {
                return Err(CasExhausted {
                    quiz_id: quiz_id.to_string(),
                    user_id: user_id.to_string(),
                }
                .into());
            }
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, policy.max_backoff);
        }
    }

    async fn delete_session(&self, quiz_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let user_ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(Self::members_key(quiz_id))
            .query_async(&mut conn)
            .await
            .context("Failed to list participants for delete")?;

        let mut del = redis::cmd("DEL");
        del.arg(Self::meta_key(quiz_id))
            .arg(Self::members_key(quiz_id));
        for user_id in &user_ids {
            del.arg(Self::participant_key(quiz_id, user_id))
                .arg(Self::version_key(quiz_id, user_id));
        }
        del.query_async::<()>(&mut conn)
            .await
            .context("Failed to delete session subtree")?;

        tracing::info!(
            "Deleted ephemeral session: quiz={}, participants={}",
            quiz_id,
            user_ids.len()
        );
        Ok(())
    }

    async fn active_quiz_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut quiz_ids = Vec::new();

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("quizsession:*:meta")
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .context("Failed to scan session keys")?;

            for key in keys {
                if let Some(quiz_id) = key
                    .strip_prefix("quizsession:")
                    .and_then(|rest| rest.strip_suffix(":meta"))
                {
                    quiz_ids.push(quiz_id.to_string());
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        quiz_ids.sort();
        quiz_ids.dedup();
        Ok(quiz_ids)
    }
}

const EXTEND_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('EXPIRE', KEYS[1], ARGV[2])
    end
    return 0
"#;

const RELEASE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

/// Single-node lease lock: SET NX EX with a random token, token-checked
/// extend and release. A crashed holder never blocks anyone; the TTL clears
/// the lease.
pub struct RedisLockManager {
    redis: ConnectionManager,
}

impl RedisLockManager {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(&self, key: &str, ttl_secs: u64) -> Result<Option<String>> {
        let mut conn = self.redis.clone();
        let token = Uuid::new_v4().to_string();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .context("Failed to acquire lease lock")?;
        Ok(acquired.map(|_| token))
    }

    async fn extend(&self, key: &str, token: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.redis.clone();
        let extended: i64 = redis::Script::new(EXTEND_SCRIPT)
            .key(key)
            .arg(token)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await
            .context("Failed to extend lease lock")?;
        Ok(extended == 1)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .context("Failed to release lease lock")?;
        Ok(released == 1)
    }
}

/// Quiz-scoped pub/sub over Redis channels.
pub struct RedisEventBus {
    redis: ConnectionManager,
}

impl RedisEventBus {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, channel: &str, event: &QuizEvent) -> Result<()> {
        let mut conn = self.redis.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(event.to_payload())
            .query_async::<()>(&mut conn)
            .await
            .with_context(|| format!("Failed to publish to {}", channel))?;
        Ok(())
    }
}
