//! # Libby Service Client
//!
//! This module is the integration layer between loancli and the Libby
//! service. It owns the HTTP client, the persisted [`Session`] and the
//! [`Config`] every request is built from.
//!
//! ```text
//! CLI / pipeline
//!        ↓
//! LibbyClient
//!     ├── auth     (device registration, code exchange, sync, liveness)
//!     ├── loans    (catalog, return, renew, export)
//!     ├── formats  (format tags and negotiation)
//!     ├── fulfill  (license documents, open content sessions)
//!     └── media    (descriptive title records)
//!        ↓
//! reqwest
//! ```
//!
//! Requests against the Libby service carry the session identity as a bearer
//! token. Requests against third-party hosts (the open content web host, the
//! media service) never do.
//!
//! Non-2xx responses are turned into [`Error::Status`] carrying the service's
//! own `message` (or `result`) field when the body has one, so callers see a
//! human-readable cause instead of a bare status code.

pub mod auth;
pub mod formats;
pub mod fulfill;
pub mod loans;
pub mod media;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::instrument;

use crate::{
    Error, Res,
    config::Config,
    management::{Session, SessionStore},
    types::{ServiceMessage, SyncResponse},
};

pub use auth::{AuthState, CodePrompt};
pub use formats::{Category, DeliveryMode, LibbyFormat, Plan, Protocol};
pub use fulfill::{Fulfillment, FulfillmentEngine, LicenseDocument, ManifestEntry, OpenContentManifest};
pub use loans::Loan;

pub struct LibbyClient {
    http: Client,
    config: Config,
    store: SessionStore,
    session: Session,
    state: AuthState,
}

impl LibbyClient {
    /// Creates an unauthenticated client. Nothing is read from disk.
    pub fn new(config: Config) -> Res<Self> {
        let http = build_http_client(&config)?;
        let store = SessionStore::new(config.settings_file());
        Ok(Self {
            http,
            config,
            store,
            session: Session::default(),
            state: AuthState::Unregistered,
        })
    }

    /// Loads the persisted session and confirms it is still accepted.
    ///
    /// Fails with [`Error::NotConfigured`] if no usable session exists or the
    /// service no longer accepts it.
    pub async fn connect(config: Config) -> Res<Self> {
        let mut client = Self::new(config)?;
        client.load_session().await?;
        client.check().await?;
        Ok(client)
    }

    /// Reads the session from the store without contacting the service.
    pub async fn load_session(&mut self) -> Res<()> {
        self.session = self.store.load().await?;
        self.state = AuthState::Synced;
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// The underlying HTTP client. Cloning it shares the connection pool
    /// and the cookie jar of the open content session.
    pub fn http(&self) -> &Client {
        &self.http
    }

    pub(crate) fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.config.libby_api_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        if self.session.identity.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.session.identity)
        }
    }

    /// Sends an authenticated request to the Libby service.
    pub(crate) async fn send(&self, builder: RequestBuilder) -> Res<Response> {
        let response = self.authorize(builder).send().await?;
        check_status(response).await
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Res<T> {
        let url = self.api_url(path);
        let response = self.send(self.http.get(&url)).await?;
        Ok(response.json::<T>().await?)
    }

    /// Fetches the account state: linked cards and active loans.
    #[instrument(skip(self))]
    pub async fn sync(&self) -> Res<SyncResponse> {
        let sync: SyncResponse = self.get_json("/chip/sync").await?;
        tracing::debug!(
            cards = sync.cards.len(),
            loans = sync.loans.len(),
            "synced account"
        );
        Ok(sync)
    }
}

fn build_http_client(config: &Config) -> Res<Client> {
    Ok(Client::builder()
        .user_agent(&config.user_agent)
        .timeout(config.request_timeout)
        .cookie_store(true)
        .build()?)
}

/// Passes 2xx responses through and turns everything else into
/// [`Error::Status`] with the service's message.
pub(crate) async fn check_status(response: Response) -> Res<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(Error::Status {
        url,
        status,
        message: service_message(status, &body),
    })
}

fn service_message(status: StatusCode, body: &str) -> String {
    let parsed = serde_json::from_str::<ServiceMessage>(body).ok();
    parsed
        .and_then(|m| m.message.or(m.result))
        .filter(|m| !m.trim().is_empty())
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty() && trimmed.len() <= 200 && !trimmed.starts_with('{'))
                .then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unexpected response")
                .to_string()
        })
}
