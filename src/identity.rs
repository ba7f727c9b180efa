//! Profile lookup at join time.
//!
//! Failures never block joining: [`resolve_or_guest`] falls back to an
//! anonymous display name with the role the client asked for.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ClassroomError, Result};
use crate::model::Role;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub display_name: String,
    pub role: Role,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, participant_id: &str) -> Result<Profile>;
}

/// In-memory directory.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    profiles: HashMap<String, Profile>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, participant_id: impl Into<String>, display_name: impl Into<String>, role: Role) -> Self {
        self.profiles.insert(
            participant_id.into(),
            Profile {
                display_name: display_name.into(),
                role,
            },
        );
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticDirectory {
    async fn resolve(&self, participant_id: &str) -> Result<Profile> {
        self.profiles
            .get(participant_id)
            .cloned()
            .ok_or_else(|| ClassroomError::Identity(format!("unknown participant {participant_id}")))
    }
}

/// `GET {base_url}/profiles/{participant_id}` returning a [`Profile`].
pub struct HttpDirectory {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDirectory {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClassroomError::Identity(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl IdentityProvider for HttpDirectory {
    async fn resolve(&self, participant_id: &str) -> Result<Profile> {
        let url = format!("{}/profiles/{}", self.base_url, urlencoding::encode(participant_id));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ClassroomError::Identity(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ClassroomError::Identity(format!(
                "Profile lookup for {} failed with status {}",
                participant_id,
                response.status()
            )));
        }

        response
            .json::<Profile>()
            .await
            .map_err(|e| ClassroomError::Identity(format!("Failed to parse profile: {}", e)))
    }
}

/// Anonymous display name derived from the participant id.
pub fn guest_name(participant_id: &str) -> String {
    let tail: Vec<char> = participant_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    let suffix: String = if tail.is_empty() {
        uuid::Uuid::new_v4().simple().to_string()[..4].to_string()
    } else {
        tail[tail.len().saturating_sub(4)..].iter().collect()
    };
    format!("Guest-{suffix}")
}

/// Resolves a profile, degrading to a guest name on any failure.
pub async fn resolve_or_guest(provider: &dyn IdentityProvider, participant_id: &str, requested_role: Role) -> Profile {
    match provider.resolve(participant_id).await {
        Ok(profile) => profile,
        Err(e) => {
            tracing::warn!(participant_id = %participant_id, error = %e, "Identity lookup failed, joining as guest");
            Profile {
                display_name: guest_name(participant_id),
                role: requested_role,
            }
        }
    }
}
