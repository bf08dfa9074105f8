use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::CloudCodeClient;
use super::request::{CLIENT_NAME, CLIENT_VERSION};
use crate::error::Result;

/// Tier used when the account reports no default.
pub const FALLBACK_TIER: &str = "legacy-tier";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetadata {
    client_name: &'static str,
    client_version: &'static str,
    platform: &'static str,
}

impl Default for ClientMetadata {
    fn default() -> Self {
        Self {
            client_name: CLIENT_NAME,
            client_version: CLIENT_VERSION,
            platform: "PLATFORM_UNSPECIFIED",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadCodeAssistRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    cloudaicompanion_project: Option<&'a str>,
    metadata: ClientMetadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OnboardUserRequest<'a> {
    tier_id: &'a str,
    cloudaicompanion_project: &'a str,
    metadata: ClientMetadata,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadCodeAssistResponse {
    #[serde(default)]
    cloudaicompanion_project: Option<CloudAIProject>,
    #[serde(default)]
    pub current_tier: Option<TierInfo>,
    #[serde(default)]
    pub allowed_tiers: Vec<TierInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TierInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "isDefault")]
    pub is_default: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CloudAIProject {
    String(String),
    Object { id: String },
}

impl CloudAIProject {
    fn id(&self) -> &str {
        match self {
            CloudAIProject::String(s) => s,
            CloudAIProject::Object { id } => id,
        }
    }
}

impl LoadCodeAssistResponse {
    pub fn project_id(&self) -> Option<&str> {
        self.cloudaicompanion_project
            .as_ref()
            .map(CloudAIProject::id)
            .filter(|id| !id.is_empty())
    }

    /// A reported current tier means the account is already onboarded.
    pub fn is_onboarded(&self) -> bool {
        self.current_tier.is_some()
    }

    pub fn default_tier_id(&self) -> &str {
        self.allowed_tiers
            .iter()
            .find(|t| t.is_default)
            .and_then(|t| t.id.as_deref())
            .unwrap_or(FALLBACK_TIER)
    }
}

/// Long-running operation returned by `onboardUser`.
#[derive(Debug, Default, Deserialize)]
pub struct OnboardOperation {
    #[serde(default)]
    pub done: bool,
}

pub async fn load_code_assist(
    client: &CloudCodeClient,
    access_token: &str,
    project_id: Option<&str>,
) -> Result<LoadCodeAssistResponse> {
    let request = LoadCodeAssistRequest {
        cloudaicompanion_project: project_id,
        metadata: ClientMetadata::default(),
    };

    let response: LoadCodeAssistResponse = client
        .call("loadCodeAssist", &request, access_token)
        .await?;

    debug!(
        project_id = ?response.project_id(),
        onboarded = response.is_onboarded(),
        "loadCodeAssist response"
    );
    Ok(response)
}

pub async fn onboard_user(
    client: &CloudCodeClient,
    access_token: &str,
    tier_id: &str,
    project_id: &str,
) -> Result<OnboardOperation> {
    let request = OnboardUserRequest {
        tier_id,
        cloudaicompanion_project: project_id,
        metadata: ClientMetadata::default(),
    };

    let operation: OnboardOperation = client.call("onboardUser", &request, access_token).await?;
    info!(tier_id, project_id, done = operation.done, "onboardUser submitted");
    Ok(operation)
}
