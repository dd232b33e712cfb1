use std::sync::Arc;
use tracing::{info, instrument};

use super::ServiceError;
use crate::domain::User;
use crate::store::Store;

#[derive(Clone)]
pub struct UserService {
    store: Arc<dyn Store>,
}

impl UserService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    #[instrument(name = "UserService.create", skip_all, fields(email = %user.email))]
    pub async fn create(&self, user: &User) -> Result<i64, ServiceError> {
        let id = self.store.insert_user(user).await?;
        info!(user_id = id, active = user.active, "User created");
        Ok(id)
    }

    /// Whether the user with this email is active.
    pub async fn state(&self, email: &str) -> Result<bool, ServiceError> {
        Ok(self.store.user(email).await?.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError};

    #[tokio::test]
    async fn test_state() {
        let service = UserService::new(Arc::new(MemoryStore::new()));
        service
            .create(&User {
                id: None,
                name: "Ann".to_string(),
                email: "ann@example.com".to_string(),
                active: false,
            })
            .await
            .unwrap();

        assert!(!service.state("ann@example.com").await.unwrap());
        assert!(matches!(
            service.state("bob@example.com").await,
            Err(ServiceError::Store(StoreError::NotFound(_)))
        ));
    }
}
