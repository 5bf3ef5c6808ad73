//! Token lifecycle for the storage provider
//!
//! OAuth2 authorization-code flow with PKCE for Google Drive, and the
//! access/refresh token pair it yields. The manager is the single writer of
//! the credential; everything else reads through the `TokenProvider` trait,
//! which also lets tests run the upload pipeline against a fake credential
//! source.
//!
//! Invariant: an access token is never used past a confirmed 401 without a
//! refresh or a clear.

use async_trait::async_trait;
use oauth2::{
    basic::BasicClient, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken,
    EndpointNotSet, EndpointSet, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken,
    Scope, TokenResponse, TokenUrl,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

use super::types::DriveError;
use crate::config::DriveAuthConfig;
use crate::storage::KeyValueStore;

const TOKENS_KEY: &str = "drive_tokens";

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DRIVE_SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/drive",
    "https://www.googleapis.com/auth/drive.file",
];

/// Configured OAuth2 client with auth and token endpoints set (v5 typestates)
type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Persisted OAuth2 token pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix timestamp
    pub expires_at: Option<i64>,
    pub token_type: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl StoredTokens {
    /// Expired, with a 5 minute buffer. No expiry = assume valid.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= chrono::Utc::now().timestamp() + 300,
            None => false,
        }
    }
}

/// Read-side of the credential, consumed by the folder resolver and the
/// upload orchestrator.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// True iff a token is held in memory and in durable storage.
    fn is_authenticated(&self) -> bool;

    /// A bearer token believed valid, refreshing first when the stored
    /// expiry has passed.
    async fn access_token(&self) -> Result<SecretString, DriveError>;

    /// Exchange the refresh token for a new access token. Fails closed:
    /// any error returns false, never panics.
    async fn refresh(&self) -> bool;

    /// Clear the credential from memory and durable storage. Succeeds even
    /// when storage is already empty.
    fn logout(&self);
}

/// Owner of the Drive credential and the PKCE authorization flow.
pub struct TokenManager {
    config: DriveAuthConfig,
    store: Arc<dyn KeyValueStore>,
    tokens: RwLock<Option<StoredTokens>>,
    /// Pending PKCE verifiers keyed by CSRF state, with the redirect URI
    /// each flow was started with.
    pending: Mutex<HashMap<String, (PkceCodeVerifier, String)>>,
}

impl TokenManager {
    /// Construct and reload any durable credential into memory
    /// (process-start invariant: memory and storage must agree).
    pub fn new(config: DriveAuthConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let tokens = store
            .get(TOKENS_KEY)
            .ok()
            .flatten()
            .and_then(|json| serde_json::from_str(&json).ok());
        Self {
            config,
            store,
            tokens: RwLock::new(tokens),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, redirect_uri: &str) -> Result<ConfiguredClient, DriveError> {
        let auth_url = AuthUrl::new(GOOGLE_AUTH_URL.to_string())
            .map_err(|e| DriveError::Other(format!("Invalid auth URL: {}", e)))?;
        let token_url = TokenUrl::new(GOOGLE_TOKEN_URL.to_string())
            .map_err(|e| DriveError::Other(format!("Invalid token URL: {}", e)))?;
        let redirect_url = RedirectUrl::new(redirect_uri.to_string())
            .map_err(|e| DriveError::Other(format!("Invalid redirect URL: {}", e)))?;

        let mut client = BasicClient::new(ClientId::new(self.config.client_id.clone()))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            .set_redirect_uri(redirect_url);

        if let Some(ref secret) = self.config.client_secret {
            client = client.set_client_secret(ClientSecret::new(secret.clone()));
        }

        Ok(client)
    }

    fn http_client() -> Result<reqwest::Client, DriveError> {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DriveError::Other(format!("HTTP client error: {}", e)))
    }

    /// Start the authorization flow. Returns the URL to open in a browser
    /// and the CSRF state the callback must echo.
    pub fn authorize_url(&self, redirect_uri: &str) -> Result<(String, String), DriveError> {
        let client = self.client(redirect_uri)?;
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let mut auth_builder = client
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(pkce_challenge);
        for scope in DRIVE_SCOPES {
            auth_builder = auth_builder.add_scope(Scope::new(scope.to_string()));
        }
        auth_builder = auth_builder
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent");

        let (auth_url, csrf_token) = auth_builder.url();
        let state = csrf_token.secret().clone();

        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(state.clone(), (pkce_verifier, redirect_uri.to_string()));

        info!("Drive authorization URL generated");
        Ok((auth_url.to_string(), state))
    }

    /// Complete the flow with the authorization code from the callback.
    /// A denied/cancelled flow never reaches this point and stored state is
    /// untouched on failure.
    pub async fn complete_auth(&self, code: &str, state: &str) -> Result<(), DriveError> {
        let (verifier, redirect_uri) = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(state)
            .ok_or_else(|| {
                DriveError::AuthenticationFailed(
                    "Invalid state token - authorization flow expired or invalid".to_string(),
                )
            })?;

        let client = self.client(&redirect_uri)?;
        let token_result = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(verifier)
            .request_async(&Self::http_client()?)
            .await
            .map_err(|e| DriveError::AuthenticationFailed(format!("Token exchange failed: {}", e)))?;

        let tokens = StoredTokens {
            access_token: token_result.access_token().secret().clone(),
            refresh_token: token_result.refresh_token().map(|t| t.secret().clone()),
            expires_at: token_result
                .expires_in()
                .map(|d| chrono::Utc::now().timestamp() + d.as_secs() as i64),
            token_type: "Bearer".to_string(),
            scopes: granted_scopes(&token_result),
        };

        self.persist(tokens);
        info!("Drive tokens obtained");
        Ok(())
    }

    fn persist(&self, tokens: StoredTokens) {
        match serde_json::to_string(&tokens) {
            Ok(json) => {
                if let Err(e) = self.store.set(TOKENS_KEY, &json) {
                    warn!("Failed to persist Drive tokens: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize Drive tokens: {}", e),
        }
        *self.tokens.write().unwrap_or_else(|e| e.into_inner()) = Some(tokens);
    }

    fn current(&self) -> Option<StoredTokens> {
        self.tokens.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl TokenProvider for TokenManager {
    fn is_authenticated(&self) -> bool {
        self.current().is_some() && matches!(self.store.get(TOKENS_KEY), Ok(Some(_)))
    }

    async fn access_token(&self) -> Result<SecretString, DriveError> {
        let tokens = self.current().ok_or(DriveError::NotAuthenticated)?;

        if tokens.is_expired() {
            if !self.refresh().await {
                self.logout();
                return Err(DriveError::SessionExpired);
            }
            let refreshed = self.current().ok_or(DriveError::SessionExpired)?;
            return Ok(SecretString::from(refreshed.access_token));
        }

        Ok(SecretString::from(tokens.access_token))
    }

    async fn refresh(&self) -> bool {
        let Some(tokens) = self.current() else {
            return false;
        };
        let Some(refresh_token) = tokens.refresh_token.clone() else {
            warn!("No refresh token stored, cannot refresh");
            return false;
        };

        // redirect_uri is irrelevant for the refresh grant; any loopback
        // placeholder satisfies the client builder
        let client = match self.client("http://127.0.0.1/callback") {
            Ok(client) => client,
            Err(e) => {
                warn!("Cannot build OAuth client for refresh: {}", e);
                return false;
            }
        };
        let http_client = match Self::http_client() {
            Ok(client) => client,
            Err(e) => {
                warn!("Cannot build HTTP client for refresh: {}", e);
                return false;
            }
        };

        match client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.clone()))
            .request_async(&http_client)
            .await
        {
            Ok(token_result) => {
                let tokens = StoredTokens {
                    access_token: token_result.access_token().secret().clone(),
                    // Keep the old refresh token when the provider omits it
                    refresh_token: token_result
                        .refresh_token()
                        .map(|t| t.secret().clone())
                        .or(Some(refresh_token)),
                    expires_at: token_result
                        .expires_in()
                        .map(|d| chrono::Utc::now().timestamp() + d.as_secs() as i64),
                    token_type: "Bearer".to_string(),
                    scopes: {
                        let granted = granted_scopes(&token_result);
                        if granted.is_empty() { tokens.scopes } else { granted }
                    },
                };
                self.persist(tokens);
                info!("Drive tokens refreshed");
                true
            }
            Err(e) => {
                warn!("Drive token refresh failed: {}", e);
                false
            }
        }
    }

    fn logout(&self) {
        *self.tokens.write().unwrap_or_else(|e| e.into_inner()) = None;
        if let Err(e) = self.store.remove(TOKENS_KEY) {
            warn!("Failed to clear stored Drive tokens: {}", e);
        }
        info!("Drive tokens cleared");
    }
}

fn granted_scopes(token_result: &oauth2::basic::BasicTokenResponse) -> Vec<String> {
    token_result
        .scopes()
        .map(|scopes| scopes.iter().map(|s| s.to_string()).collect())
        .unwrap_or_default()
}

/// Bind the OAuth2 callback listener on an ephemeral loopback port.
/// Returns the listener and the port the OS assigned.
pub async fn bind_callback_listener() -> Result<(tokio::net::TcpListener, u16), DriveError> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| DriveError::Other(format!("Failed to bind callback listener: {}", e)))?;
    let port = listener
        .local_addr()
        .map(|a| a.port())
        .map_err(|e| DriveError::Other(format!("Failed to get local port: {}", e)))?;
    info!("OAuth callback listener bound on port {}", port);
    Ok((listener, port))
}

/// Wait for a single OAuth2 callback request and extract (code, state).
pub async fn wait_for_callback(
    listener: tokio::net::TcpListener,
) -> Result<(String, String), DriveError> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (mut socket, _) = listener
        .accept()
        .await
        .map_err(|e| DriveError::Other(format!("Failed to accept connection: {}", e)))?;

    let mut buffer = vec![0u8; 4096];
    let n = socket
        .read(&mut buffer)
        .await
        .map_err(|e| DriveError::Other(format!("Failed to read request: {}", e)))?;

    let request = String::from_utf8_lossy(&buffer[..n]);
    let result = parse_callback_request(&request);

    let page = match &result {
        Ok(_) => "<h1>Authorization complete</h1><p>You can close this window and return to LexSync.</p>",
        Err(_) => "<h1>Authorization failed</h1><p>You can close this window.</p>",
    };
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nConnection: close\r\n\r\n<!DOCTYPE html><html><head><title>LexSync</title></head><body style=\"font-family:sans-serif;text-align:center;margin-top:20vh\">{}</body></html>",
        page
    );
    let _ = socket.write_all(response.as_bytes()).await;

    result
}

/// Parse the callback request line: `GET /callback?code=..&state=.. HTTP/1.1`.
fn parse_callback_request(request: &str) -> Result<(String, String), DriveError> {
    let first_line = request
        .lines()
        .next()
        .ok_or_else(|| DriveError::AuthenticationFailed("Empty request".to_string()))?;

    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(DriveError::AuthenticationFailed("Invalid request format".to_string()));
    }

    let path = parts[1];
    let query_start = path
        .find('?')
        .ok_or_else(|| DriveError::AuthenticationFailed("No query parameters".to_string()))?;

    let mut code = None;
    let mut state = None;

    for param in path[query_start + 1..].split('&') {
        let mut kv = param.splitn(2, '=');
        let key = kv.next().unwrap_or("");
        let value = kv.next().unwrap_or("");

        match key {
            "code" => code = Some(urlencoding::decode(value).unwrap_or_default().to_string()),
            "state" => state = Some(urlencoding::decode(value).unwrap_or_default().to_string()),
            "error" if value == "access_denied" => return Err(DriveError::UserCancelled),
            "error" => {
                return Err(DriveError::AuthenticationFailed(format!("OAuth error: {}", value)))
            }
            _ => {}
        }
    }

    let code = code.ok_or_else(|| DriveError::AuthenticationFailed("Missing code".to_string()))?;
    let state = state.ok_or_else(|| DriveError::AuthenticationFailed("Missing state".to_string()))?;
    Ok((code, state))
}
