//! Domain types and ingestion-time validation.
//!
//! HTTP bodies arrive as the loosely typed `*Request` structs. Converting a
//! request into its domain type (`Club::try_from(request)`) is the validation
//! step: it either yields a fully typed value or a [`ValidationError`] whose
//! message is reported back to the caller.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Minimum length of club and user names.
pub const MIN_NAME_LEN: usize = 3;

/// Reasons a request is rejected before it reaches the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{entity} name must not be empty and must be at least 3 characters long")]
    NameTooShort { entity: &'static str },

    #[error("{entity} {field} must not be empty")]
    Empty {
        entity: &'static str,
        field: &'static str,
    },

    #[error("club acquisition channel must be either 'online' or 'offline', got '{0}'")]
    AcquisitionChannel(String),

    #[error("club acquisition location must be either 'store' or 'website', got '{0}'")]
    AcquisitionLocation(String),

    #[error("club plan type must be either 'basic' or 'premium', got '{0}'")]
    PlanType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionChannel {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionLocation {
    Store,
    Website,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    Basic,
    Premium,
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanType::Basic => f.write_str("basic"),
            PlanType::Premium => f.write_str("premium"),
        }
    }
}

/// A discount club. `id` is assigned by storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Club {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub description: String,
    #[serde(alias = "acquisition_channel", alias = "aquisition_channel")]
    pub acquisition_channel: AcquisitionChannel,
    #[serde(alias = "acquisition_location", alias = "aquisition_location")]
    pub acquisition_location: AcquisitionLocation,
    #[serde(alias = "plan_type")]
    pub plan_type: PlanType,
}

/// A user. The email is the natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub email: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Whether a club-signup event creates or deactivates the user/club link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignupAction {
    #[default]
    Signup,
    Cancel,
}

/// A user/club relationship request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupPayload {
    pub email: String,
    #[serde(alias = "club", alias = "club_name", default)]
    pub club_name: String,
    #[serde(default)]
    pub action: SignupAction,
}

/// Raw body of `POST /contrate/discount-club`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClubRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "acquisition_channel", alias = "aquisition_channel")]
    pub acquisition_channel: String,
    #[serde(default, alias = "acquisition_location", alias = "aquisition_location")]
    pub acquisition_location: String,
    #[serde(default, alias = "plan_type")]
    pub plan_type: String,
}

/// Raw body of `POST /contrate/discount-club/user`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub active: Option<bool>,
}

/// Raw body of the signup and cancel endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default, alias = "club", alias = "club_name")]
    pub club_name: String,
}

/// Raw body of the read-only user endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmailRequest {
    #[serde(default)]
    pub email: String,
}

fn check_name(entity: &'static str, name: &str) -> Result<(), ValidationError> {
    if name.chars().count() < MIN_NAME_LEN {
        return Err(ValidationError::NameTooShort { entity });
    }
    Ok(())
}

fn check_present(entity: &'static str, field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { entity, field });
    }
    Ok(())
}

impl TryFrom<ClubRequest> for Club {
    type Error = ValidationError;

    fn try_from(req: ClubRequest) -> Result<Self, Self::Error> {
        check_name("club", &req.name)?;
        check_present("club", "description", &req.description)?;

        let acquisition_channel = match req.acquisition_channel.as_str() {
            "online" => AcquisitionChannel::Online,
            "offline" => AcquisitionChannel::Offline,
            other => return Err(ValidationError::AcquisitionChannel(other.to_string())),
        };
        let acquisition_location = match req.acquisition_location.as_str() {
            "store" => AcquisitionLocation::Store,
            "website" => AcquisitionLocation::Website,
            other => return Err(ValidationError::AcquisitionLocation(other.to_string())),
        };
        let plan_type = match req.plan_type.as_str() {
            "basic" => PlanType::Basic,
            "premium" => PlanType::Premium,
            other => return Err(ValidationError::PlanType(other.to_string())),
        };

        Ok(Club {
            id: None,
            name: req.name,
            description: req.description,
            acquisition_channel,
            acquisition_location,
            plan_type,
        })
    }
}

impl TryFrom<UserRequest> for User {
    type Error = ValidationError;

    fn try_from(req: UserRequest) -> Result<Self, Self::Error> {
        check_name("user", &req.name)?;
        check_present("user", "email", &req.email)?;

        Ok(User {
            id: None,
            name: req.name,
            email: req.email,
            active: req.active.unwrap_or(true),
        })
    }
}

impl SignupRequest {
    /// Validate into a payload carrying the given action.
    ///
    /// Cancellation only needs the email; signup also needs the club name.
    pub fn into_payload(self, action: SignupAction) -> Result<SignupPayload, ValidationError> {
        check_present("signup", "email", &self.email)?;
        if action == SignupAction::Signup {
            check_present("signup", "club", &self.club_name)?;
        }
        Ok(SignupPayload {
            email: self.email,
            club_name: self.club_name,
            action,
        })
    }
}
