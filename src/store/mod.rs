//! Persistence capability used by the consumer processors.
//!
//! The pipeline only needs a handful of row operations. What matters is how
//! failures are classified:
//!
//! - [`StoreError::DuplicateKey`]: a uniqueness constraint fired, so the
//!   write was already applied once; consumers treat it as success
//! - [`StoreError::NotFound`]: a referenced user or club does not exist
//! - [`StoreError::Unavailable`]: connectivity trouble, worth retrying
//! - [`StoreError::Backend`]: anything else the backend reports

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::domain::{Club, PlanType, User};

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::DuplicateKey(_))
    }
}

/// A user's club membership as reported by [`Store::user_plan_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStatus {
    pub club_id: i64,
    pub active: bool,
    pub plan: PlanType,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a club; the name is unique. Returns the assigned id.
    async fn insert_club(&self, club: &Club) -> Result<i64, StoreError>;

    /// Insert a user; the email is unique. Returns the assigned id.
    async fn insert_user(&self, user: &User) -> Result<i64, StoreError>;

    async fn user_id(&self, email: &str) -> Result<i64, StoreError>;

    async fn club_id(&self, name: &str) -> Result<i64, StoreError>;

    /// Whether the user is active.
    async fn user_state(&self, user_id: i64) -> Result<bool, StoreError>;

    /// Link a user to a club. An inactive link is reactivated; an active one
    /// is a [`StoreError::DuplicateKey`].
    async fn insert_user_club(&self, user_id: i64, club_id: i64) -> Result<(), StoreError>;

    /// Deactivate every active link of the user. Returns how many changed.
    async fn cancel_user_club(&self, user_id: i64) -> Result<u64, StoreError>;

    /// The user's current club link, if any: the most recently activated
    /// active link, else the most recently activated cancelled one.
    async fn user_plan_status(&self, user_id: i64) -> Result<Option<PlanStatus>, StoreError>;

    async fn user(&self, email: &str) -> Result<User, StoreError>;
}
