use std::sync::Arc;
use tracing::{info, instrument};

use super::ServiceError;
use crate::domain::{SignupAction, SignupPayload};
use crate::store::{PlanStatus, Store, StoreError};
use crate::telemetry::{Metric, Telemetry};

/// Missing rows referenced by a signup cannot appear by retrying forever.
fn missing_as_precondition(e: StoreError) -> ServiceError {
    match e {
        StoreError::NotFound(what) => ServiceError::Precondition(format!("{} does not exist", what)),
        other => ServiceError::Store(other),
    }
}

#[derive(Clone)]
pub struct SignupService {
    store: Arc<dyn Store>,
    telemetry: Arc<dyn Telemetry>,
}

impl SignupService {
    pub fn new(store: Arc<dyn Store>, telemetry: Arc<dyn Telemetry>) -> Self {
        Self { store, telemetry }
    }

    pub async fn handle(&self, payload: &SignupPayload) -> Result<(), ServiceError> {
        match payload.action {
            SignupAction::Signup => self.signup(payload).await,
            SignupAction::Cancel => self.cancel(&payload.email).await.map(|_| ()),
        }
    }

    async fn active_user(&self, email: &str) -> Result<i64, ServiceError> {
        let user_id = self.store.user_id(email).await.map_err(missing_as_precondition)?;
        if !self.store.user_state(user_id).await? {
            return Err(ServiceError::Precondition(format!("user {} is not active", user_id)));
        }
        Ok(user_id)
    }

    /// Link an active user to a club. An already active link is a duplicate.
    #[instrument(name = "SignupService.signup", skip_all, fields(email = %payload.email, club = %payload.club_name))]
    pub async fn signup(&self, payload: &SignupPayload) -> Result<(), ServiceError> {
        let user_id = self.active_user(&payload.email).await?;
        let club_id = self
            .store
            .club_id(&payload.club_name)
            .await
            .map_err(missing_as_precondition)?;
        self.store.insert_user_club(user_id, club_id).await?;

        let plan = self.store.user_plan_status(user_id).await?.map(|status| status.plan);
        if let Some(plan) = plan {
            self.telemetry.record(Metric::PlanSignup(plan));
        }
        info!(user_id = user_id, club_id = club_id, plan = ?plan, "User signed up");
        Ok(())
    }

    /// Deactivate every club link of an active user. Returns how many changed.
    #[instrument(name = "SignupService.cancel", skip(self))]
    pub async fn cancel(&self, email: &str) -> Result<u64, ServiceError> {
        let user_id = self.active_user(email).await?;
        let links = self.store.cancel_user_club(user_id).await?;
        if links > 0 {
            self.telemetry.record(Metric::PlanCancelled { links });
        }
        info!(user_id = user_id, links = links, "Club signup cancelled");
        Ok(links)
    }

    /// The user's club plan, `None` if the user never signed up.
    pub async fn plan_status(&self, email: &str) -> Result<Option<PlanStatus>, ServiceError> {
        let user_id = self.store.user_id(email).await?;
        Ok(self.store.user_plan_status(user_id).await?)
    }
}
