//! Device authentication against the Libby service.
//!
//! Linking a device walks through four states:
//!
//! ```text
//! Unregistered ──POST /chip──▶ DeviceRegistered ──code──▶ CodeIssued ──sync──▶ Synced
//! ```
//!
//! Nothing is persisted until the final sync returned at least one library
//! card, so a failed setup never leaves a half-configured store behind.

use serde_json::Value;
use tracing::instrument;

use crate::{
    Error, Res,
    libby::LibbyClient,
    management::Session,
    types::{ChipResponse, CloneCodeResponse},
    utils,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unregistered,
    DeviceRegistered,
    CodeIssued,
    Synced,
}

/// Shows the linking code to the user and collects the code they enter.
///
/// Both calls block; the auth flow waits for them.
pub trait CodePrompt {
    /// Called once before the first `read_code`. `code` is the code issued by
    /// the service for this device, if issuance succeeded.
    fn show_code(&mut self, code: Option<&str>);

    /// Returns the code the user entered, or `None` to give up. `attempt`
    /// starts at 1.
    fn read_code(&mut self, attempt: u32) -> Option<String>;
}

/// A prompt that always answers with the same code. Useful for scripted
/// setups (`loancli auth --code`).
pub struct FixedCode(pub String);

impl CodePrompt for FixedCode {
    fn show_code(&mut self, _code: Option<&str>) {}

    fn read_code(&mut self, _attempt: u32) -> Option<String> {
        Some(self.0.clone())
    }
}

pub fn is_valid_code(code: &str) -> bool {
    code.len() == 8 && code.chars().all(|c| c.is_ascii_digit())
}

impl LibbyClient {
    /// Confirms the current session is still accepted by the service.
    ///
    /// An unauthorized response drops the session and the store and fails
    /// with [`Error::NotConfigured`]. A refreshed identity in the response is
    /// adopted and persisted.
    #[instrument(skip(self))]
    pub async fn check(&mut self) -> Res<AuthState> {
        if !self.session.is_valid() {
            self.state = AuthState::Unregistered;
            return Err(Error::NotConfigured);
        }

        let url = self.api_url("/chip");
        let response = match self.send(self.http.get(&url)).await {
            Ok(response) => response,
            Err(e) if e.is_unauthorized() => {
                tracing::warn!("session rejected by the service");
                self.session = Session::default();
                self.state = AuthState::Unregistered;
                self.store.reset().await?;
                return Err(Error::NotConfigured);
            }
            Err(e) => return Err(e),
        };

        let body: Value = response.json().await.unwrap_or(Value::Null);
        if let Some(identity) = body.get("identity").and_then(Value::as_str) {
            if !identity.is_empty() && identity != self.session.identity {
                tracing::debug!("adopting refreshed identity");
                self.session.identity = identity.to_string();
                self.store.save(&self.session).await?;
            }
        }

        self.state = AuthState::Synced;
        Ok(self.state)
    }

    /// Makes sure the client holds a live session.
    ///
    /// A stored session only gets a liveness check. If it was rejected, or no
    /// session exists, the full setup runs when `reauth` is set; otherwise the
    /// call fails with [`Error::NotConfigured`].
    pub async fn ensure_session(
        &mut self,
        reauth: bool,
        prompt: &mut dyn CodePrompt,
    ) -> Res<AuthState> {
        if self.state != AuthState::Synced && self.store.exists() {
            match self.load_session().await {
                Ok(()) | Err(Error::NotConfigured) => {}
                Err(e) => return Err(e),
            }
        }

        match self.check().await {
            Ok(state) => Ok(state),
            Err(Error::NotConfigured) if reauth => self.setup(prompt).await,
            Err(e) => Err(e),
        }
    }

    /// Registers this device and links it to the user's Libby account with a
    /// code from a device that is already set up.
    #[instrument(skip(self, prompt))]
    pub async fn setup(&mut self, prompt: &mut dyn CodePrompt) -> Res<AuthState> {
        self.state = AuthState::Unregistered;
        self.session = Session::default();

        let chip = self.register_device().await?;
        self.session = Session::new(chip.chip, chip.identity);
        self.state = AuthState::DeviceRegistered;

        let issued = match self.issue_code().await {
            Ok(code) => code,
            Err(e) => {
                tracing::warn!(error = %e, "could not get a linking code for this device");
                None
            }
        };
        prompt.show_code(issued.as_deref());

        let code = self.exchange_code(prompt).await?;
        self.state = AuthState::CodeIssued;

        self.refresh_chip().await?;

        let sync = self.sync().await?;
        if sync.cards.is_empty() {
            self.state = AuthState::Unregistered;
            self.session = Session::default();
            return Err(Error::NoLibraryCard);
        }

        self.session.sync_code = Some(code);
        self.session.cards = sync.cards;
        self.store.save(&self.session).await?;
        self.state = AuthState::Synced;
        tracing::debug!(cards = self.session.cards.len(), "device linked");
        Ok(self.state)
    }

    async fn register_device(&self) -> Res<ChipResponse> {
        let url = self.api_url("/chip?client=dewey");
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| Error::Registration(e.to_string()))?;
        let response = super::check_status(response).await.map_err(|e| match e {
            Error::Status { message, .. } => Error::Registration(message),
            other => Error::Registration(other.to_string()),
        })?;
        let chip: ChipResponse = response
            .json()
            .await
            .map_err(|e| Error::Registration(e.to_string()))?;
        if chip.chip.is_empty() || chip.identity.is_empty() {
            return Err(Error::Registration("service returned an empty chip".into()));
        }
        tracing::debug!("device registered");
        Ok(chip)
    }

    async fn issue_code(&self) -> Res<Option<String>> {
        let response: CloneCodeResponse = self.get_json("/chip/clone/code").await?;
        Ok(response.code)
    }

    /// Polls the prompt until a well-formed code was accepted by the service
    /// or the attempt budget is used up.
    async fn exchange_code(&self, prompt: &mut dyn CodePrompt) -> Res<String> {
        let attempts = self.config.code_attempts.max(1);
        for attempt in 1..=attempts {
            let Some(code) = prompt.read_code(attempt) else {
                break;
            };
            let code = code.trim().to_string();
            if !is_valid_code(&code) {
                tracing::warn!(attempt, "linking code must be 8 digits");
                continue;
            }

            tracing::debug!(code = %utils::redact(&code), "exchanging linking code");
            let url = self.api_url("/chip/clone/code");
            let request = self
                .http
                .post(&url)
                .json(&serde_json::json!({ "code": code }));
            return match self.send(request).await {
                Ok(_) => Ok(code),
                Err(Error::Status { message, .. }) => Err(Error::LoginFailed(message)),
                Err(e) => Err(e),
            };
        }
        Err(Error::LoginFailed("no valid code entered".into()))
    }

    /// Picks up the identity the service issues once the device is linked.
    async fn refresh_chip(&mut self) -> Res<()> {
        let url = self.api_url("/chip");
        let response = self.send(self.http.get(&url)).await?;
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if let Some(identity) = body.get("identity").and_then(Value::as_str) {
            if !identity.is_empty() {
                self.session.identity = identity.to_string();
            }
        }
        Ok(())
    }
}
