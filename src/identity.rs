//! Identity provider glue (Keycloak, OAuth2/OIDC authorization code + PKCE)
//!
//! The redirect dance itself belongs to the caller (browser/auth-session
//! collaborator); this module covers the contract the client consumes:
//! endpoint derivation, code→token exchange, userinfo, realm-role
//! extraction, and end-session on logout. Role names decide which agent
//! webhook a user talks to.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{AgentRole, KeycloakConfig};
use crate::storage::{KeyValueStore, StorageError};

const TOKENS_KEY: &str = "identity_tokens";
const USER_INFO_KEY: &str = "user_info";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Token exchange failed: {0}")]
    Exchange(String),

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Malformed access token")]
    MalformedToken,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// OIDC endpoints derived from the realm URL.
#[derive(Debug, Clone)]
pub struct KeycloakEndpoints {
    pub authorize: String,
    pub token: String,
    pub userinfo: String,
    pub end_session: String,
}

impl KeycloakEndpoints {
    pub fn from_config(config: &KeycloakConfig) -> Self {
        let base = format!(
            "{}/realms/{}/protocol/openid-connect",
            config.url.trim_end_matches('/'),
            config.realm
        );
        Self {
            authorize: format!("{}/auth", base),
            token: format!("{}/token", base),
            userinfo: format!("{}/userinfo", base),
            end_session: format!("{}/logout", base),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Keycloak client for login/logout and role resolution.
pub struct IdentityClient {
    config: KeycloakConfig,
    endpoints: KeycloakEndpoints,
    client: reqwest::Client,
    store: Arc<dyn KeyValueStore>,
}

impl IdentityClient {
    pub fn new(config: KeycloakConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let endpoints = KeycloakEndpoints::from_config(&config);
        Self { config, endpoints, client: reqwest::Client::new(), store }
    }

    pub fn endpoints(&self) -> &KeycloakEndpoints {
        &self.endpoints
    }

    /// Exchange an authorization code (with its PKCE verifier) for tokens,
    /// fetch userinfo, and persist both.
    pub async fn complete_login(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<Value, IdentityError> {
        let mut form: HashMap<&str, &str> = HashMap::new();
        form.insert("grant_type", "authorization_code");
        form.insert("client_id", &self.config.client_id);
        form.insert("code", code);
        form.insert("redirect_uri", redirect_uri);
        form.insert("code_verifier", code_verifier);

        let mut request = self.client.post(&self.endpoints.token).form(&form);
        if let Some(ref secret) = self.config.client_secret {
            request = request.basic_auth(&self.config.client_id, Some(secret));
        }

        let response = request.send().await.map_err(|e| IdentityError::Request(e.to_string()))?;
        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| IdentityError::Exchange(format!("Invalid token response: {}", e)))?;

        let access_token = match tokens.access_token {
            Some(token) => token,
            None => {
                let detail = tokens
                    .error_description
                    .or(tokens.error)
                    .unwrap_or_else(|| "no access token in response".to_string());
                return Err(IdentityError::Exchange(detail));
            }
        };

        let stored = IdentityTokens { access_token, refresh_token: tokens.refresh_token };
        let json = serde_json::to_string(&stored)
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;
        self.store.set(TOKENS_KEY, &json)?;

        let user_info = self.fetch_user_info(&stored.access_token).await?;
        self.store.set(USER_INFO_KEY, &user_info.to_string())?;

        info!("Identity login completed");
        Ok(user_info)
    }

    async fn fetch_user_info(&self, access_token: &str) -> Result<Value, IdentityError> {
        let response = self
            .client
            .get(&self.endpoints.userinfo)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| IdentityError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(IdentityError::Request(format!(
                "userinfo returned HTTP {}",
                response.status().as_u16()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| IdentityError::Request(format!("Invalid userinfo response: {}", e)))
    }

    pub fn tokens(&self) -> Option<IdentityTokens> {
        let json = self.store.get(TOKENS_KEY).ok().flatten()?;
        serde_json::from_str(&json).ok()
    }

    pub fn is_logged_in(&self) -> bool {
        self.tokens().is_some()
    }

    pub fn user_info(&self) -> Option<Value> {
        let json = self.store.get(USER_INFO_KEY).ok().flatten()?;
        serde_json::from_str(&json).ok()
    }

    /// Realm roles carried by the stored access token.
    pub fn roles(&self) -> Result<Vec<String>, IdentityError> {
        let tokens = self.tokens().ok_or(IdentityError::NotLoggedIn)?;
        realm_roles(&tokens.access_token)
    }

    /// The agent role this user talks to: first recognized realm role, or
    /// General when none match.
    pub fn agent_role(&self) -> AgentRole {
        match self.roles() {
            Ok(roles) => roles
                .iter()
                .find_map(|r| AgentRole::from_key(r))
                .unwrap_or(AgentRole::General),
            Err(_) => AgentRole::General,
        }
    }

    /// Invalidate the server-side session (best effort) and clear local
    /// state unconditionally.
    pub async fn logout(&self) -> Result<(), IdentityError> {
        if let Some(tokens) = self.tokens() {
            if let Some(refresh_token) = tokens.refresh_token {
                let mut form: HashMap<&str, &str> = HashMap::new();
                form.insert("client_id", &self.config.client_id);
                if let Some(ref secret) = self.config.client_secret {
                    form.insert("client_secret", secret);
                }
                form.insert("refresh_token", &refresh_token);

                if let Err(e) = self.client.post(&self.endpoints.end_session).form(&form).send().await {
                    warn!("Failed to invalidate identity session: {}", e);
                }
            }
        }

        self.store.remove(TOKENS_KEY)?;
        self.store.remove(USER_INFO_KEY)?;
        info!("Identity logout completed");
        Ok(())
    }
}

/// Decode the `realm_access.roles` claim from a JWT access token.
///
/// Client-side decode only; the token was just issued to us over TLS, so
/// signature verification belongs to the resource servers, not this client.
pub fn realm_roles(access_token: &str) -> Result<Vec<String>, IdentityError> {
    let payload = access_token.split('.').nth(1).ok_or(IdentityError::MalformedToken)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| IdentityError::MalformedToken)?;
    let claims: Value =
        serde_json::from_slice(&bytes).map_err(|_| IdentityError::MalformedToken)?;

    let roles = claims
        .get("realm_access")
        .and_then(|v| v.get("roles"))
        .and_then(Value::as_array)
        .map(|roles| {
            roles
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(roles)
}
