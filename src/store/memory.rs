//! In-memory store with the same uniqueness rules as a relational schema.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{PlanStatus, Store, StoreError};
use crate::domain::{Club, User};

#[derive(Debug, Clone, Copy)]
struct Link {
    active: bool,
    /// Activation order across all links.
    since: u64,
}

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    next_link: u64,
    clubs: BTreeMap<i64, Club>,
    users: BTreeMap<i64, User>,
    club_names: HashMap<String, i64>,
    user_emails: HashMap<String, i64>,
    /// (user_id, club_id) -> link
    user_clubs: BTreeMap<(i64, i64), Link>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn next_link(&mut self) -> u64 {
        self.next_link += 1;
        self.next_link
    }
}

/// Thread-safe in-memory [`Store`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn club_count(&self) -> usize {
        self.lock().clubs.len()
    }

    pub fn user_count(&self) -> usize {
        self.lock().users.len()
    }

    /// Number of user/club links, active or not.
    pub fn user_club_count(&self) -> usize {
        self.lock().user_clubs.len()
    }

    /// Flip a user's active flag. Returns false if the user does not exist.
    pub fn set_user_active(&self, email: &str, active: bool) -> bool {
        let mut tables = self.lock();
        let Some(id) = tables.user_emails.get(email).copied() else {
            return false;
        };
        match tables.users.get_mut(&id) {
            Some(user) => {
                user.active = active;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_club(&self, club: &Club) -> Result<i64, StoreError> {
        let mut tables = self.lock();
        if tables.club_names.contains_key(&club.name) {
            return Err(StoreError::DuplicateKey(format!("clubs.name = {}", club.name)));
        }
        let id = tables.next_id();
        tables.club_names.insert(club.name.clone(), id);
        tables.clubs.insert(
            id,
            Club {
                id: Some(id),
                ..club.clone()
            },
        );
        Ok(id)
    }

    async fn insert_user(&self, user: &User) -> Result<i64, StoreError> {
        let mut tables = self.lock();
        if tables.user_emails.contains_key(&user.email) {
            return Err(StoreError::DuplicateKey(format!("users.email = {}", user.email)));
        }
        let id = tables.next_id();
        tables.user_emails.insert(user.email.clone(), id);
        tables.users.insert(
            id,
            User {
                id: Some(id),
                ..user.clone()
            },
        );
        Ok(id)
    }

    async fn user_id(&self, email: &str) -> Result<i64, StoreError> {
        self.lock()
            .user_emails
            .get(email)
            .copied()
            .ok_or_else(|| StoreError::NotFound(format!("user {}", email)))
    }

    async fn club_id(&self, name: &str) -> Result<i64, StoreError> {
        self.lock()
            .club_names
            .get(name)
            .copied()
            .ok_or_else(|| StoreError::NotFound(format!("club {}", name)))
    }

    async fn user_state(&self, user_id: i64) -> Result<bool, StoreError> {
        self.lock()
            .users
            .get(&user_id)
            .map(|user| user.active)
            .ok_or_else(|| StoreError::NotFound(format!("user id {}", user_id)))
    }

    async fn insert_user_club(&self, user_id: i64, club_id: i64) -> Result<(), StoreError> {
        let mut tables = self.lock();
        if !tables.users.contains_key(&user_id) {
            return Err(StoreError::NotFound(format!("user id {}", user_id)));
        }
        if !tables.clubs.contains_key(&club_id) {
            return Err(StoreError::NotFound(format!("club id {}", club_id)));
        }
        if matches!(tables.user_clubs.get(&(user_id, club_id)), Some(link) if link.active) {
            return Err(StoreError::DuplicateKey(format!(
                "user_club = ({}, {})",
                user_id, club_id
            )));
        }
        let since = tables.next_link();
        tables
            .user_clubs
            .insert((user_id, club_id), Link { active: true, since });
        Ok(())
    }

    async fn cancel_user_club(&self, user_id: i64) -> Result<u64, StoreError> {
        let mut tables = self.lock();
        let mut changed = 0;
        for (_, link) in tables
            .user_clubs
            .range_mut((user_id, i64::MIN)..=(user_id, i64::MAX))
        {
            if link.active {
                link.active = false;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn user_plan_status(&self, user_id: i64) -> Result<Option<PlanStatus>, StoreError> {
        let tables = self.lock();
        let current = tables
            .user_clubs
            .range((user_id, i64::MIN)..=(user_id, i64::MAX))
            .max_by_key(|(_, link)| (link.active, link.since));
        let Some((&(_, club_id), &Link { active, .. })) = current else {
            return Ok(None);
        };
        let club = tables
            .clubs
            .get(&club_id)
            .ok_or_else(|| StoreError::Backend(format!("dangling club id {}", club_id)))?;
        Ok(Some(PlanStatus {
            club_id,
            active,
            plan: club.plan_type,
        }))
    }

    async fn user(&self, email: &str) -> Result<User, StoreError> {
        let tables = self.lock();
        tables
            .user_emails
            .get(email)
            .and_then(|id| tables.users.get(id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user {}", email)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AcquisitionChannel, AcquisitionLocation, PlanType};

    fn club(name: &str) -> Club {
        plan_club(name, PlanType::Basic)
    }

    fn plan_club(name: &str, plan_type: PlanType) -> Club {
        Club {
            id: None,
            name: name.to_string(),
            description: "desc".to_string(),
            acquisition_channel: AcquisitionChannel::Offline,
            acquisition_location: AcquisitionLocation::Store,
            plan_type,
        }
    }

    fn user(email: &str) -> User {
        User {
            id: None,
            name: "Ann".to_string(),
            email: email.to_string(),
            active: true,
        }
    }

    #[tokio::test]
    async fn test_duplicate_club_name() {
        let store = MemoryStore::new();
        let id = store.insert_club(&club("Gold")).await.unwrap();
        let err = store.insert_club(&club("Gold")).await.unwrap_err();

        assert!(err.is_duplicate());
        assert_eq!(store.club_count(), 1);
        assert_eq!(store.club_id("Gold").await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_duplicate_user_email() {
        let store = MemoryStore::new();
        store.insert_user(&user("a@b.com")).await.unwrap();
        assert!(store.insert_user(&user("a@b.com")).await.unwrap_err().is_duplicate());
        assert_eq!(store.user_count(), 1);
    }

    #[tokio::test]
    async fn test_lookups_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(store.user_id("x").await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.club_id("x").await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.user_state(42).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_user_club_link_lifecycle() {
        let store = MemoryStore::new();
        let user_id = store.insert_user(&user("a@b.com")).await.unwrap();
        let club_id = store.insert_club(&club("Gold")).await.unwrap();

        store.insert_user_club(user_id, club_id).await.unwrap();
        assert!(store
            .insert_user_club(user_id, club_id)
            .await
            .unwrap_err()
            .is_duplicate());

        let status = store.user_plan_status(user_id).await.unwrap().unwrap();
        assert!(status.active);
        assert_eq!(status.plan, PlanType::Basic);

        assert_eq!(store.cancel_user_club(user_id).await.unwrap(), 1);
        assert_eq!(store.cancel_user_club(user_id).await.unwrap(), 0);
        assert!(!store.user_plan_status(user_id).await.unwrap().unwrap().active);
        assert_eq!(store.user_club_count(), 1);

        // Signing up again reactivates the same row.
        store.insert_user_club(user_id, club_id).await.unwrap();
        assert!(store.user_plan_status(user_id).await.unwrap().unwrap().active);
        assert_eq!(store.user_club_count(), 1);
    }

    #[tokio::test]
    async fn test_plan_status_prefers_active_link() {
        let store = MemoryStore::new();
        let user_id = store.insert_user(&user("a@b.com")).await.unwrap();
        let alpha = store.insert_club(&plan_club("Alpha", PlanType::Basic)).await.unwrap();
        let beta = store.insert_club(&plan_club("Beta", PlanType::Premium)).await.unwrap();

        store.insert_user_club(user_id, alpha).await.unwrap();
        store.cancel_user_club(user_id).await.unwrap();
        store.insert_user_club(user_id, beta).await.unwrap();

        let status = store.user_plan_status(user_id).await.unwrap().unwrap();
        assert_eq!(
            status,
            PlanStatus {
                club_id: beta,
                active: true,
                plan: PlanType::Premium,
            }
        );
    }

    #[tokio::test]
    async fn test_plan_status_falls_back_to_latest_cancelled_link() {
        let store = MemoryStore::new();
        let user_id = store.insert_user(&user("a@b.com")).await.unwrap();
        let alpha = store.insert_club(&plan_club("Alpha", PlanType::Basic)).await.unwrap();
        let beta = store.insert_club(&plan_club("Beta", PlanType::Premium)).await.unwrap();

        store.insert_user_club(user_id, beta).await.unwrap();
        store.cancel_user_club(user_id).await.unwrap();
        store.insert_user_club(user_id, alpha).await.unwrap();
        store.cancel_user_club(user_id).await.unwrap();

        let status = store.user_plan_status(user_id).await.unwrap().unwrap();
        assert_eq!(status.club_id, alpha);
        assert!(!status.active);
        assert_eq!(status.plan, PlanType::Basic);
    }

    #[tokio::test]
    async fn test_user_club_requires_rows() {
        let store = MemoryStore::new();
        let user_id = store.insert_user(&user("a@b.com")).await.unwrap();
        assert!(matches!(
            store.insert_user_club(user_id, 999).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.user_plan_status(user_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_user_active() {
        let store = MemoryStore::new();
        let id = store.insert_user(&user("a@b.com")).await.unwrap();
        assert!(store.set_user_active("a@b.com", false));
        assert!(!store.user_state(id).await.unwrap());
        assert!(!store.set_user_active("nobody@b.com", false));
    }
}
