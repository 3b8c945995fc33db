//! Redis-backed sliding-window store.
//!
//! The whole prune/count/record sequence runs inside one Lua script, so a single round
//! trip is one atomic server-side operation. When the caller sends no timestamp the
//! script reads the server's `TIME`, making Redis the only clock that matters.

use crate::error::StoreError;
use crate::rate_limit::store::{WindowRequest, WindowStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};

/// KEYS[1] = window key
/// ARGV = window_ms, threshold, now_ms (empty = server time), nonce
const SLIDING_WINDOW_LUA: &str = r#"
local key = KEYS[1]
local window = tonumber(ARGV[1])
local threshold = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
if now == nil then
  local t = redis.call('TIME')
  now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
end
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count < threshold then
  redis.call('ZADD', key, now, now .. '-' .. ARGV[4])
  redis.call('PEXPIRE', key, window)
  return 1
end
return 0
"#;

/// Window store executing the sliding-window script on Redis.
#[derive(Clone)]
pub struct RedisWindowStore {
    manager: ConnectionManager,
    script: Script,
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore")
            .field("manager", &"<redis::aio::ConnectionManager>")
            .field("script", &self.script.get_hash())
            .finish()
    }
}

impl RedisWindowStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    /// Returns `StoreError::Unavailable` when the URL is invalid or the server cannot be
    /// reached.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid redis url: {}", e)))?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self::from_manager(manager))
    }

    /// Reuse a connection manager the application already owns.
    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self { manager, script: Script::new(SLIDING_WINDOW_LUA) }
    }

    /// Round-trip a `PING`.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

// Any caller timestamp is honoured, zero included; only an absent one defers to `TIME`.
fn timestamp_arg(now_millis: Option<u64>) -> String {
    now_millis.map(|now| now.to_string()).unwrap_or_default()
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn record_if_below(&self, request: &WindowRequest) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        // EVALSHA, falling back to EVAL once if the server has not cached the script.
        let reply: i64 = self
            .script
            .key(&request.key)
            .arg(request.window_millis)
            .arg(request.threshold)
            .arg(timestamp_arg(request.now_millis))
            .arg(request.nonce)
            .invoke_async(&mut conn)
            .await?;

        match reply {
            1 => Ok(true),
            0 => Ok(false),
            other => Err(StoreError::UnexpectedReply(other.to_string())),
        }
    }
}
