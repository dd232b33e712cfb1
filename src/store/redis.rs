//! Redis-backed store.
//!
//! Layout (all keys under `clubrelay:`):
//!
//! ```text
//! seq                      INCR counter for row ids
//! clubs:by_name            hash  name  -> id     (uniqueness index)
//! users:by_email           hash  email -> id     (uniqueness index)
//! club:<id> / user:<id>    hash  data  -> JSON row
//! user_clubs:<user_id>     hash  club_id -> "1" active | "0" cancelled
//! user_clubs_since:<uid>   zset  club_id scored by activation order (from seq)
//! ```
//!
//! Index check, id allocation and row write run in one Lua script so a
//! duplicate is detected atomically.

use async_trait::async_trait;
use deadpool_redis::redis::{cmd, RedisError, Script};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use tracing::{debug, info};

use super::{PlanStatus, Store, StoreError};
use crate::domain::{Club, User};

const KEY_PREFIX: &str = "clubrelay:";

/// KEYS[1] index hash, KEYS[2] sequence; ARGV[1] row key prefix,
/// ARGV[2] natural key, ARGV[3] JSON row. Returns -1 on duplicate.
const INSERT_UNIQUE: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[2]) == 1 then
  return -1
end
local id = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[1], ARGV[2], id)
redis.call('HSET', ARGV[1] .. id, 'data', ARGV[3])
return id
"#;

/// KEYS[1] link hash, KEYS[2] activation zset, KEYS[3] sequence;
/// ARGV[1] club id. Returns 0 if already active.
const LINK: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) == '1' then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], '1')
redis.call('ZADD', KEYS[2], redis.call('INCR', KEYS[3]), ARGV[1])
return 1
"#;

/// KEYS[1] link hash, KEYS[2] activation zset. Returns `{club_id, active}`
/// of the latest active link, else of the latest cancelled one, or nil.
const CURRENT_LINK: &str = r#"
local best, best_active, best_since = nil, -1, -1
local links = redis.call('HGETALL', KEYS[1])
for i = 1, #links, 2 do
  local active = 0
  if links[i + 1] == '1' then active = 1 end
  local since = tonumber(redis.call('ZSCORE', KEYS[2], links[i]) or '0')
  if active > best_active or (active == best_active and since > best_since) then
    best, best_active, best_since = links[i], active, since
  end
end
if best == nil then
  return nil
end
return {tonumber(best), best_active}
"#;

/// KEYS[1] link hash. Returns the number of links deactivated.
const UNLINK_ALL: &str = r#"
local changed = 0
local links = redis.call('HGETALL', KEYS[1])
for i = 1, #links, 2 do
  if links[i + 1] == '1' then
    redis.call('HSET', KEYS[1], links[i], '0')
    changed = changed + 1
  end
end
return changed
"#;

fn key(suffix: impl AsRef<str>) -> String {
    format!("{}{}", KEY_PREFIX, suffix.as_ref())
}

fn redis_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

/// [`Store`] persisting rows in Redis.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let store = Self { pool };

        let mut conn = store.conn().await?;
        let _: String = cmd("PING").query_async(&mut conn).await.map_err(redis_error)?;
        info!("Connected to Redis store");
        Ok(store)
    }

    async fn conn(&self) -> Result<Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn insert_unique(
        &self,
        index: &str,
        row_prefix: &str,
        natural_key: &str,
        row: String,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn().await?;
        let id: i64 = Script::new(INSERT_UNIQUE)
            .key(key(index))
            .key(key("seq"))
            .arg(key(row_prefix))
            .arg(natural_key)
            .arg(row)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;

        if id < 0 {
            return Err(StoreError::DuplicateKey(format!("{} = {}", index, natural_key)));
        }
        debug!(index = %index, id = id, "Row inserted");
        Ok(id)
    }

    async fn index_lookup(&self, index: &str, natural_key: &str, what: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn().await?;
        let id: Option<i64> = cmd("HGET")
            .arg(key(index))
            .arg(natural_key)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        id.ok_or_else(|| StoreError::NotFound(format!("{} {}", what, natural_key)))
    }

    async fn row<T: serde::de::DeserializeOwned>(&self, row_key: String) -> Result<Option<T>, StoreError> {
        let mut conn = self.conn().await?;
        let data: Option<String> = cmd("HGET")
            .arg(&row_key)
            .arg("data")
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        data.map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| StoreError::Backend(format!("corrupt row {}: {}", row_key, e)))
        })
        .transpose()
    }

    async fn club_by_id(&self, id: i64) -> Result<Club, StoreError> {
        let club: Option<Club> = self.row(key(format!("club:{}", id))).await?;
        let club = club.ok_or_else(|| StoreError::NotFound(format!("club id {}", id)))?;
        Ok(Club { id: Some(id), ..club })
    }

    async fn user_by_id(&self, id: i64) -> Result<User, StoreError> {
        let user: Option<User> = self.row(key(format!("user:{}", id))).await?;
        let user = user.ok_or_else(|| StoreError::NotFound(format!("user id {}", id)))?;
        Ok(User { id: Some(id), ..user })
    }
}

fn to_row<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Backend(e.to_string()))
}

#[async_trait]
impl Store for RedisStore {
    async fn insert_club(&self, club: &Club) -> Result<i64, StoreError> {
        let row = to_row(&Club { id: None, ..club.clone() })?;
        self.insert_unique("clubs:by_name", "club:", &club.name, row).await
    }

    async fn insert_user(&self, user: &User) -> Result<i64, StoreError> {
        let row = to_row(&User { id: None, ..user.clone() })?;
        self.insert_unique("users:by_email", "user:", &user.email, row).await
    }

    async fn user_id(&self, email: &str) -> Result<i64, StoreError> {
        self.index_lookup("users:by_email", email, "user").await
    }

    async fn club_id(&self, name: &str) -> Result<i64, StoreError> {
        self.index_lookup("clubs:by_name", name, "club").await
    }

    async fn user_state(&self, user_id: i64) -> Result<bool, StoreError> {
        Ok(self.user_by_id(user_id).await?.active)
    }

    async fn insert_user_club(&self, user_id: i64, club_id: i64) -> Result<(), StoreError> {
        self.user_by_id(user_id).await?;
        self.club_by_id(club_id).await?;

        let mut conn = self.conn().await?;
        let linked: i64 = Script::new(LINK)
            .key(key(format!("user_clubs:{}", user_id)))
            .key(key(format!("user_clubs_since:{}", user_id)))
            .key(key("seq"))
            .arg(club_id)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        if linked == 0 {
            return Err(StoreError::DuplicateKey(format!(
                "user_club = ({}, {})",
                user_id, club_id
            )));
        }
        Ok(())
    }

    async fn cancel_user_club(&self, user_id: i64) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        let changed: u64 = Script::new(UNLINK_ALL)
            .key(key(format!("user_clubs:{}", user_id)))
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(changed)
    }

    async fn user_plan_status(&self, user_id: i64) -> Result<Option<PlanStatus>, StoreError> {
        let current: Option<(i64, i64)> = {
            let mut conn = self.conn().await?;
            Script::new(CURRENT_LINK)
                .key(key(format!("user_clubs:{}", user_id)))
                .key(key(format!("user_clubs_since:{}", user_id)))
                .invoke_async(&mut conn)
                .await
                .map_err(redis_error)?
        };

        let Some((club_id, active)) = current else {
            return Ok(None);
        };
        let club = self.club_by_id(club_id).await?;
        Ok(Some(PlanStatus {
            club_id,
            active: active == 1,
            plan: club.plan_type,
        }))
    }

    async fn user(&self, email: &str) -> Result<User, StoreError> {
        let id = self.user_id(email).await?;
        self.user_by_id(id).await
    }
}
