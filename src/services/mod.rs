//! Business operations run by the consumer processors and read endpoints.
//!
//! Each service owns a handle to the [`Store`] and the [`Telemetry`]
//! capability. [`Services::apply`] dispatches a decoded [`Event`] to the
//! service that handles its kind.
//!
//! Errors are classified so the consumer can decide between ack, retry and
//! dead-lettering:
//!
//! - [`ServiceError::Precondition`]: the event can never succeed as-is
//!   (inactive user, unknown club)
//! - [`ServiceError::Store`]: whatever the store reported; duplicates and
//!   transient failures are told apart by [`StoreError`]

pub mod club;
pub mod signup;
pub mod user;

use std::sync::Arc;
use thiserror::Error;

use crate::envelope::Event;
use crate::store::{Store, StoreError};
use crate::telemetry::Telemetry;

pub use club::ClubService;
pub use signup::SignupService;
pub use user::UserService;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServiceError {
    /// The write was already applied by an earlier delivery.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, ServiceError::Store(e) if e.is_duplicate())
    }

    /// Worth retrying without limit.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Store(StoreError::Unavailable(_)))
    }
}

/// The three services, sharing one store.
#[derive(Clone)]
pub struct Services {
    pub clubs: ClubService,
    pub users: UserService,
    pub signups: SignupService,
}

impl Services {
    pub fn new(store: Arc<dyn Store>, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            clubs: ClubService::new(store.clone()),
            users: UserService::new(store.clone()),
            signups: SignupService::new(store, telemetry),
        }
    }

    /// Run the business operation for one event.
    pub async fn apply(&self, event: &Event) -> Result<(), ServiceError> {
        match event {
            Event::CreateClub(club) => self.clubs.create(club).await.map(|_| ()),
            Event::CreateUser(user) => self.users.create(user).await.map(|_| ()),
            Event::ClubSignup(signup) => self.signups.handle(signup).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ServiceError::Store(StoreError::DuplicateKey("k".into())).is_duplicate());
        assert!(!ServiceError::Precondition("x".into()).is_duplicate());
        assert!(ServiceError::Store(StoreError::Unavailable("down".into())).is_transient());
        assert!(!ServiceError::Store(StoreError::Backend("bad".into())).is_transient());
    }
}
