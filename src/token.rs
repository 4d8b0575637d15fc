//! OAuth2 credential lifecycle.
//!
//! [`TokenManager`] owns the credential and performs both grant exchanges
//! against the token endpoint:
//!
//! * `authorization_code`: one-shot, from the user consent callback
//! * `refresh_token`: repeatable, from the durably stored refresh token
//!
//! Renewal is proactive: the access token is considered expired five minutes
//! before the service would reject it, so a renewal always lands while the
//! old token still works. Callers gate renewal attempts through
//! [`TokenManager::renewal_permitted`], which allows at most one attempt per
//! five seconds no matter how often the scheduler ticks.
//!
//! A refresh token returned by the service is persisted through the token
//! store before it is adopted in memory. On any failed exchange nothing is
//! mutated; the failure is reported with the raw status and body.

use std::{io, sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Deserialize;
use thiserror::Error;
use tokio::time::Instant;
use url::form_urlencoded;
use veil::Redact;

use crate::{
    config::Config, events::EventSink, exchange::HttpExchanger, store::TokenStore, transport,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] transport::Error),

    #[error("token endpoint returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("parsing token payload failed: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("token payload has an empty access token")]
    EmptyAccessToken,

    #[error("no refresh token available")]
    NoRefreshToken,

    #[error("persisting refresh token failed: {0}")]
    Store(#[from] io::Error),
}

/// Safety margin subtracted from the service-declared expiry.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(300);

/// Minimum spacing between renewal attempts.
pub const RENEWAL_INTERVAL: Duration = Duration::from_secs(5);

/// OAuth2 credential state.
///
/// The access token is empty until the first successful exchange and is
/// overwritten on every renewal. The refresh token is overwritten only when
/// the service returns a new one.
#[derive(Clone, Redact)]
pub struct Credential {
    #[redact]
    pub access_token: String,
    #[redact]
    pub refresh_token: Option<String>,
    obtained_at: Option<Instant>,
    lifetime: Duration,
}

impl Credential {
    fn empty(refresh_token: Option<String>) -> Self {
        Self {
            access_token: String::new(),
            refresh_token,
            obtained_at: None,
            lifetime: Duration::ZERO,
        }
    }

    /// When the credential stops being usable, with the safety margin
    /// already applied. `None` until a token has been obtained.
    #[must_use]
    pub fn expires_at(&self) -> Option<Instant> {
        self.obtained_at.map(|at| at + self.lifetime)
    }

    /// True when no token has ever been obtained or its lifetime elapsed.
    #[must_use]
    pub fn should_renew(&self, now: Instant) -> bool {
        match self.obtained_at {
            Some(at) => now.saturating_duration_since(at) >= self.lifetime,
            None => true,
        }
    }
}

enum Grant<'a> {
    AuthorizationCode(&'a str),
    RefreshToken(&'a str),
}

/// Owns the OAuth2 credential and drives grant exchanges.
pub struct TokenManager {
    config: Config,
    exchanger: Arc<dyn HttpExchanger>,
    store: Arc<dyn TokenStore>,
    sink: Arc<dyn EventSink>,
    credential: Credential,
    limiter: DefaultDirectRateLimiter,
}

/// Successful token endpoint payload.
#[derive(Deserialize, Redact)]
struct TokenResponse {
    #[redact]
    access_token: String,
    expires_in: u64,
    #[redact]
    refresh_token: Option<String>,
}

impl TokenManager {
    /// Creates a manager, loading any persisted refresh token.
    ///
    /// # Panics
    ///
    /// Panics if the renewal interval constant is zero.
    #[must_use]
    pub fn new(
        config: Config,
        exchanger: Arc<dyn HttpExchanger>,
        store: Arc<dyn TokenStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let credential = Credential::empty(store.load());
        let quota = Quota::with_period(RENEWAL_INTERVAL).expect("renewal interval is zero");

        Self {
            config,
            exchanger,
            store,
            sink,
            credential,
            limiter: RateLimiter::direct(quota),
        }
    }

    #[must_use]
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        (!self.credential.access_token.is_empty()).then_some(&*self.credential.access_token)
    }

    #[must_use]
    pub fn has_refresh_token(&self) -> bool {
        self.credential.refresh_token.is_some()
    }

    /// True when the access token is due for proactive renewal.
    #[must_use]
    pub fn should_renew(&self, now: Instant) -> bool {
        self.credential.should_renew(now)
    }

    /// Gate for renewal attempts: at most one per five-second window.
    ///
    /// Consumes a slot when it returns `true`, so call it only when a
    /// renewal is actually about to be attempted.
    pub fn renewal_permitted(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Exchanges a one-shot authorization code for a credential.
    pub async fn exchange_authorization_code(&mut self, code: &str) -> Result<()> {
        self.grant(Grant::AuthorizationCode(code)).await
    }

    /// Renews the access token from the stored refresh token.
    pub async fn refresh(&mut self) -> Result<()> {
        let refresh_token = self
            .credential
            .refresh_token
            .clone()
            .ok_or(Error::NoRefreshToken)?;
        self.grant(Grant::RefreshToken(&refresh_token)).await
    }

    /// Clears the credential and wipes the persisted refresh token.
    pub fn reset(&mut self) -> io::Result<()> {
        self.credential = Credential::empty(None);
        self.store.clear()
    }

    async fn grant(&mut self, grant: Grant<'_>) -> Result<()> {
        let body = self.grant_body(&grant);
        let head = self.request_head(body.len());

        let response = self
            .exchanger
            .exchange(
                &self.config.accounts_host,
                self.config.accounts_port,
                &head,
                body.as_bytes(),
            )
            .await?;
        let now = Instant::now();

        if response.status_code != 200 {
            let body = response.body_text();
            self.sink
                .error(response.status_code, "token endpoint error", Some(&body));
            return Err(Error::Api {
                status: response.status_code,
                body,
            });
        }

        let payload: TokenResponse = serde_json::from_slice(&response.body).map_err(|e| {
            self.sink.error(
                500,
                "unable to parse token payload",
                Some(&response.body_text()),
            );
            e
        })?;

        if payload.access_token.is_empty() {
            self.sink.error(500, "token payload has no access token", None);
            return Err(Error::EmptyAccessToken);
        }

        // Persist a new refresh token before relying on it.
        if let Some(ref refresh_token) = payload.refresh_token {
            self.store.save(refresh_token)?;
        }

        if let Some(refresh_token) = payload.refresh_token {
            self.credential.refresh_token = Some(refresh_token);
        }
        self.credential.access_token = payload.access_token;
        self.credential.obtained_at = Some(now);
        self.credential.lifetime =
            Duration::from_secs(payload.expires_in.saturating_sub(EXPIRY_MARGIN.as_secs()));

        self.sink.info("access token obtained", None);
        Ok(())
    }

    fn grant_body(&self, grant: &Grant<'_>) -> String {
        let mut body = form_urlencoded::Serializer::new(String::new());
        match grant {
            Grant::AuthorizationCode(code) => body
                .append_pair("grant_type", "authorization_code")
                .append_pair("redirect_uri", &self.config.redirect_uri)
                .append_pair("code", code),
            Grant::RefreshToken(refresh_token) => body
                .append_pair("grant_type", "refresh_token")
                .append_pair("refresh_token", refresh_token),
        };
        body.finish()
    }

    fn request_head(&self, content_length: usize) -> String {
        let basic_auth = BASE64.encode(format!(
            "{}:{}",
            self.config.client_id, self.config.client_secret
        ));

        format!(
            "POST /api/token HTTP/1.1\r\n\
             Host: {}\r\n\
             Authorization: Basic {basic_auth}\r\n\
             Content-Length: {content_length}\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\
             Connection: close\r\n\r\n",
            self.config.accounts_host,
        )
    }
}
