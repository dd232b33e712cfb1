use std::sync::Arc;
use tracing::{info, instrument};

use super::ServiceError;
use crate::domain::Club;
use crate::store::Store;

#[derive(Clone)]
pub struct ClubService {
    store: Arc<dyn Store>,
}

impl ClubService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Persist a club. A second club with the same name is a duplicate.
    #[instrument(name = "ClubService.create", skip_all, fields(club = %club.name))]
    pub async fn create(&self, club: &Club) -> Result<i64, ServiceError> {
        let id = self.store.insert_club(club).await?;
        info!(club_id = id, plan = %club.plan_type, "Club created");
        Ok(id)
    }
}
