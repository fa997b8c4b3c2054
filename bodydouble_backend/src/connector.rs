//! Gmail OAuth through the Composio connected-accounts API.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::http_client::build_http_client;

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("connector service is not configured")]
    NotConfigured,
    #[error("no Gmail auth config is set")]
    MissingAuthConfig,
    #[error("connection id is required")]
    MissingConnectionId,
    #[error("{code}: {source:#}")]
    Request {
        code: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl ConnectorError {
    pub fn code(&self) -> &'static str {
        match self {
            ConnectorError::NotConfigured => "composio_not_configured",
            ConnectorError::MissingAuthConfig => "missing_gmail_auth_config",
            ConnectorError::MissingConnectionId => "missing_connection_id",
            ConnectorError::Request { code, .. } => code,
        }
    }

    /// Configuration problems are the caller's to fix; anything else is upstream.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, ConnectorError::Request { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GmailConnection {
    pub ok: bool,
    pub user_id: String,
    pub connection_id: String,
    pub redirect_url: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub ok: bool,
    pub connection_id: String,
    pub status: Option<String>,
    pub provider: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectorHealth {
    pub configured: bool,
    pub has_gmail_auth_config: bool,
}

#[derive(Debug, Deserialize)]
struct InitiateResponse {
    id: String,
    #[serde(default, alias = "redirectUrl")]
    redirect_url: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Toolkit {
    #[serde(default)]
    slug: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    toolkit: Option<Toolkit>,
    #[serde(default, alias = "createdAt")]
    created_at: Option<String>,
}

pub struct ConnectorClient {
    base_url: String,
    api_key: Option<String>,
    gmail_auth_config: Option<String>,
    client: reqwest::Client,
}

impl ConnectorClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        gmail_auth_config: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            gmail_auth_config: gmail_auth_config.filter(|id| !id.trim().is_empty()),
            client: build_http_client(Some(timeout))?,
        })
    }

    pub fn health(&self) -> ConnectorHealth {
        ConnectorHealth {
            configured: self.api_key.is_some(),
            has_gmail_auth_config: self.gmail_auth_config.is_some(),
        }
    }

    fn api_key(&self) -> Result<&str, ConnectorError> {
        self.api_key.as_deref().ok_or(ConnectorError::NotConfigured)
    }

    /// Start a Gmail OAuth flow. The user id must be a UUID; a fresh one is
    /// generated otherwise.
    pub async fn initiate_gmail(
        &self,
        user_id: Option<&str>,
    ) -> Result<GmailConnection, ConnectorError> {
        let api_key = self.api_key()?;
        let auth_config = self
            .gmail_auth_config
            .as_deref()
            .ok_or(ConnectorError::MissingAuthConfig)?;
        let user_id = ensure_uuid(user_id);

        let created: InitiateResponse = async {
            let response = self
                .client
                .post(format!("{}/api/v3/connected_accounts", self.base_url))
                .header("x-api-key", api_key)
                .json(&json!({
                    "auth_config": { "id": auth_config },
                    "connection": { "user_id": user_id },
                }))
                .send()
                .await
                .context("Failed to reach connector service")?
                .error_for_status()?;
            response
                .json::<InitiateResponse>()
                .await
                .context("Failed to parse connection response")
        }
        .await
        .map_err(|source| ConnectorError::Request {
            code: "initiate_failed",
            source,
        })?;

        tracing::info!("Started Gmail connection {} for {}", created.id, user_id);
        Ok(GmailConnection {
            ok: true,
            user_id,
            connection_id: created.id,
            redirect_url: created.redirect_url,
            status: created.status,
        })
    }

    pub async fn connection_status(
        &self,
        connection_id: &str,
    ) -> Result<ConnectionStatus, ConnectorError> {
        let api_key = self.api_key()?;
        let connection_id = connection_id.trim();
        if connection_id.is_empty() {
            return Err(ConnectorError::MissingConnectionId);
        }

        let account: AccountResponse = async {
            let response = self
                .client
                .get(format!(
                    "{}/api/v3/connected_accounts/{}",
                    self.base_url, connection_id
                ))
                .header("x-api-key", api_key)
                .send()
                .await
                .context("Failed to reach connector service")?
                .error_for_status()?;
            response
                .json::<AccountResponse>()
                .await
                .context("Failed to parse connection status")
        }
        .await
        .map_err(|source| ConnectorError::Request {
            code: "get_status_failed",
            source,
        })?;

        Ok(ConnectionStatus {
            ok: true,
            connection_id: connection_id.to_string(),
            status: account.status,
            provider: account.toolkit.and_then(|toolkit| toolkit.slug),
            created_at: account.created_at,
        })
    }
}

/// `raw` when it parses as a UUID, else a new random one.
pub fn ensure_uuid(raw: Option<&str>) -> String {
    raw.map(str::trim)
        .filter(|candidate| Uuid::parse_str(candidate).is_ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
