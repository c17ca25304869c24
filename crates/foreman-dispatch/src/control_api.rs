use async_trait::async_trait;
use foreman_core::CoreError;
use serde::{Deserialize, Serialize};

/// Reactive dispatch payload for an @-mention, fired outside the scheduler's
/// claim/lock bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MentionDispatchRequest {
    pub comment_content: String,
    pub target_persona_id: String,
    pub conversational: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReauthResponse {
    pub ok: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Endpoints the dispatcher calls directly on the external API. Both are
/// best-effort; callers log failures and never abort the cycle over them.
#[async_trait]
pub trait ControlApi: Send + Sync {
    async fn reauthorize(&self) -> Result<ReauthResponse, CoreError>;
    async fn dispatch_mention(&self, request: MentionDispatchRequest) -> Result<(), CoreError>;
}

pub struct HttpControlApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpControlApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }
}

#[async_trait]
impl ControlApi for HttpControlApi {
    async fn reauthorize(&self) -> Result<ReauthResponse, CoreError> {
        let response = self
            .client
            .post(format!("{}/api/agents/reauthorize", self.base_url))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|error| {
                CoreError::DependencyUnavailable(format!("reauthorization request failed: {error}"))
            })?;
        response.json::<ReauthResponse>().await.map_err(|error| {
            CoreError::DependencyUnavailable(format!(
                "reauthorization response was not valid JSON: {error}"
            ))
        })
    }

    async fn dispatch_mention(&self, request: MentionDispatchRequest) -> Result<(), CoreError> {
        self.client
            .post(format!("{}/api/agents/dispatch", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|error| {
                CoreError::DependencyUnavailable(format!("mention dispatch request failed: {error}"))
            })?
            .error_for_status()
            .map_err(|error| {
                CoreError::DependencyUnavailable(format!("mention dispatch rejected: {error}"))
            })?;
        Ok(())
    }
}
