use crate::config::{AppConfig, AuthMode, Secret};
use crate::error::AppError;
use crate::types::Credential;
use async_trait::async_trait;
use oauth2::basic::{BasicClient, BasicErrorResponse};
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet,
    EndpointSet, HttpClientError, PkceCodeChallenge, RedirectUrl, RequestTokenError, Scope,
    TokenResponse, TokenUrl,
};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const REDIRECT_POLL: Duration = Duration::from_millis(250);

const SIGNED_IN_PAGE: &str = "Sign-in complete. You can close this window.";
const SIGN_IN_FAILED_PAGE: &str = "Sign-in failed. Check the terminal for details.";

type AzureOAuthClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Issues bearer credentials for the management API.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Acquires a fresh credential. Interactive providers block until the user finishes.
    ///
    /// # Errors
    /// `AppError::Authentication` when the flow fails or is abandoned,
    /// `AppError::Cancelled` on cancellation.
    async fn acquire_token(&self, cancel: &CancellationToken) -> Result<Credential, AppError>;
}

/// Microsoft identity platform token provider.
///
/// Both auth modes build the same OAuth client; the mode only picks which
/// grant is exchanged on it.
pub struct AzureTokenProvider {
    mode: AuthMode,
    authority: String,
    tenant_id: String,
    client_id: String,
    client_secret: Option<Secret>,
    scopes: Vec<String>,
    redirect_port: u16,
    login_timeout: Duration,
    http: reqwest::Client,
}

impl AzureTokenProvider {
    /// Builds a provider from validated configuration.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        // Token endpoints must not be followed through redirects.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            mode: config.auth.mode,
            authority: config.auth.authority.trim_end_matches('/').to_string(),
            tenant_id: config.tenant_id.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.auth.client_secret.clone(),
            scopes: config.auth.effective_scopes(),
            redirect_port: config.auth.redirect_port,
            login_timeout: config.login_timeout(),
            http,
        })
    }

    fn endpoint(&self, leaf: &str) -> String {
        format!("{}/{}/oauth2/v2.0/{leaf}", self.authority, self.tenant_id)
    }

    fn oauth_client(&self) -> Result<AzureOAuthClient, AppError> {
        let auth_url = AuthUrl::new(self.endpoint("authorize"))
            .map_err(|e| AppError::Config(format!("invalid authority URL: {e}")))?;
        let token_url = TokenUrl::new(self.endpoint("token"))
            .map_err(|e| AppError::Config(format!("invalid authority URL: {e}")))?;

        let mut client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            .set_auth_type(AuthType::RequestBody);
        if let Some(secret) = &self.client_secret {
            client = client.set_client_secret(ClientSecret::new(secret.expose().to_string()));
        }
        Ok(client)
    }

    fn scopes(&self) -> impl Iterator<Item = Scope> + '_ {
        self.scopes.iter().map(|s| Scope::new(s.clone()))
    }

    async fn acquire_interactive(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Credential, AppError> {
        let deadline = Instant::now()
            .checked_add(self.login_timeout)
            .ok_or_else(|| AppError::Config("auth.loginTimeoutSecs is out of range".into()))?;

        let server = tiny_http::Server::http(("127.0.0.1", self.redirect_port)).map_err(|e| {
            AppError::Authentication(format!("failed to start loopback listener: {e}"))
        })?;
        let port = server
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .ok_or_else(|| AppError::Authentication("loopback listener has no port".into()))?;

        let redirect_url = RedirectUrl::new(format!("http://localhost:{port}"))
            .map_err(|e| AppError::Authentication(format!("invalid redirect URL: {e}")))?;
        let client = self.oauth_client()?.set_redirect_uri(redirect_url);

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let (authorize_url, csrf_token) = client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(self.scopes())
            .set_pkce_challenge(pkce_challenge)
            .url();

        info!(port, "Waiting for browser sign-in");
        eprintln!("Sign in to continue. If the browser did not open, visit:\n{authorize_url}");
        if let Err(e) = webbrowser::open(authorize_url.as_str()) {
            warn!(error = %e, "Failed to open browser");
        }

        let expected_state = csrf_token.secret().clone();
        let waiter_cancel = cancel.clone();
        let code = tokio::task::spawn_blocking(move || {
            wait_for_redirect(&server, &expected_state, deadline, &waiter_cancel)
        })
        .await
        .map_err(|e| AppError::Authentication(format!("loopback listener failed: {e}")))??;

        debug!("Authorization code received, exchanging for token");
        let exchange = client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(pkce_verifier)
            .request_async(&self.http);

        let token = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AppError::Cancelled),
            token = exchange => token.map_err(token_error)?,
        };
        Ok(Credential::new(token.access_token().secret().clone()))
    }

    async fn acquire_client_credentials(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Credential, AppError> {
        let client = self.oauth_client()?;
        let exchange = client
            .exchange_client_credentials()
            .add_scopes(self.scopes())
            .request_async(&self.http);

        let token = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AppError::Cancelled),
            token = exchange => token.map_err(token_error)?,
        };
        Ok(Credential::new(token.access_token().secret().clone()))
    }
}

#[async_trait]
impl TokenProvider for AzureTokenProvider {
    async fn acquire_token(&self, cancel: &CancellationToken) -> Result<Credential, AppError> {
        info!(mode = ?self.mode, tenant = %self.tenant_id, "Acquiring access token");
        let credential = match self.mode {
            AuthMode::Interactive => self.acquire_interactive(cancel).await?,
            AuthMode::ClientCredentials => self.acquire_client_credentials(cancel).await?,
        };
        info!("Access token acquired");
        Ok(credential)
    }
}

type TokenRequestError = RequestTokenError<HttpClientError<reqwest::Error>, BasicErrorResponse>;

fn token_error(err: TokenRequestError) -> AppError {
    match err {
        RequestTokenError::ServerResponse(response) => {
            AppError::Authentication(format!("identity provider rejected the request: {response}"))
        }
        RequestTokenError::Request(e) => {
            AppError::Authentication(format!("identity provider unreachable: {e}"))
        }
        other => AppError::Authentication(other.to_string()),
    }
}

/// Serves the loopback listener until the redirect arrives, the deadline passes,
/// or the run is cancelled.
fn wait_for_redirect(
    server: &tiny_http::Server,
    expected_state: &str,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<String, AppError> {
    loop {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        if Instant::now() >= deadline {
            return Err(AppError::Authentication(
                "timed out waiting for browser sign-in".into(),
            ));
        }

        let Some(request) = server
            .recv_timeout(REDIRECT_POLL)
            .map_err(|e| AppError::Authentication(format!("loopback listener error: {e}")))?
        else {
            continue;
        };

        let outcome = parse_redirect(request.url(), expected_state);
        let page = if outcome.is_err() {
            SIGN_IN_FAILED_PAGE
        } else {
            SIGNED_IN_PAGE
        };
        if let Err(e) = request.respond(tiny_http::Response::from_string(page)) {
            debug!(error = %e, "Failed to answer loopback request");
        }

        match outcome {
            Ok(Some(code)) => return Ok(code),
            Ok(None) => {}
            Err(e) => return Err(e),
        }
    }
}

/// Extracts the authorization code from a loopback request target.
///
/// Requests without `code` or `error` (favicon probes and the like) yield `None`.
fn parse_redirect(target: &str, expected_state: &str) -> Result<Option<String>, AppError> {
    let url = Url::parse("http://localhost")
        .and_then(|base| base.join(target))
        .map_err(|e| AppError::Authentication(format!("malformed redirect: {e}")))?;

    let mut code = None;
    let mut state = None;
    let mut error = None;
    let mut description = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            "error_description" => description = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(error) = error {
        let detail = description.map_or_else(String::new, |d| format!(": {d}"));
        return Err(AppError::Authentication(format!("sign-in failed ({error}){detail}")));
    }

    let Some(code) = code else {
        return Ok(None);
    };
    if state.as_deref() != Some(expected_state) {
        return Err(AppError::Authentication(
            "redirect state does not match the sign-in request".into(),
        ));
    }
    Ok(Some(code))
}
