//! Bounded, retrying downloader for manifests, pages, images and audio.
//!
//! All downloads of a run go through one [`AssetFetcher`]. Clones share the
//! same permit pool, so loans processed one after another (or side by side)
//! never exceed the configured number of concurrent requests. The pool is a
//! `tokio` semaphore, which hands out permits in FIFO order.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use futures::{AsyncWriteExt, future::join_all};
use indicatif::ProgressBar;
use rand::Rng;
use reqwest::{
    Client, StatusCode,
    header::{HeaderMap, RETRY_AFTER},
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{Error, Res, config::Config, libby::check_status};

/// Longest `Retry-After` delay that is honoured as given.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(120);

/// One resource to download.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// Logical path inside the assembled artifact.
    pub path: String,
    pub url: String,
    pub media_type: String,
    /// A required resource that cannot be fetched fails the whole batch.
    pub required: bool,
    pub headers: HeaderMap,
    /// Stream the body to this file instead of keeping it in memory.
    pub spool: Option<PathBuf>,
}

impl Descriptor {
    pub fn new(path: impl Into<String>, url: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            url: url.into(),
            media_type: media_type.into(),
            required: true,
            headers: HeaderMap::new(),
            spool: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn spool_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.spool = Some(path.into());
        self
    }
}

#[derive(Debug, Clone)]
pub enum FragmentBody {
    Memory(Vec<u8>),
    File(PathBuf),
    /// An optional resource that could not be fetched.
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Fetched,
    Omitted,
}

/// A downloaded resource. Immutable once the batch completed.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub path: String,
    pub media_type: String,
    pub body: FragmentBody,
    pub status: FetchStatus,
}

impl Fragment {
    pub fn is_fetched(&self) -> bool {
        self.status == FetchStatus::Fetched
    }

    /// The in-memory bytes, if the body was not spooled.
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.body {
            FragmentBody::Memory(b) => Some(b),
            _ => None,
        }
    }

    pub fn file(&self) -> Option<&Path> {
        match &self.body {
            FragmentBody::File(p) => Some(p),
            _ => None,
        }
    }

    /// Reads the body regardless of where it is stored.
    pub async fn read(&self) -> Res<Vec<u8>> {
        match &self.body {
            FragmentBody::Memory(b) => Ok(b.clone()),
            FragmentBody::File(p) => async_fs::read(p).await.map_err(|e| Error::io(p, e)),
            FragmentBody::Missing => Err(Error::IncompleteAssembly(format!(
                "{} was not downloaded",
                self.path
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`
    /// plus up to half of that as jitter, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let jitter_ms = (exp.as_millis() as u64 / 2).max(1);
        let jitter = Duration::from_millis(rand::rng().random_range(0..jitter_ms));
        exp.saturating_add(jitter).min(self.cap)
    }
}

impl From<&Config> for RetryPolicy {
    fn from(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: config.backoff_base,
            cap: config.backoff_cap,
        }
    }
}

#[derive(Clone)]
pub struct AssetFetcher {
    http: Client,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    policy: RetryPolicy,
    progress: Option<ProgressBar>,
}

struct AttemptError {
    error: Error,
    retry_after: Option<Duration>,
}

impl From<Error> for AttemptError {
    fn from(error: Error) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

impl AssetFetcher {
    pub fn new(http: Client, config: &Config, cancel: CancellationToken) -> Self {
        Self {
            http,
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
            cancel,
            policy: RetryPolicy::from(config),
            progress: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Ticks `progress` once per finished resource.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Downloads every descriptor and returns the fragments in input order.
    ///
    /// Fails with [`Error::IncompleteAssembly`] naming every required
    /// resource that could not be fetched, or with [`Error::Cancelled`].
    #[instrument(skip(self, descriptors), fields(count = descriptors.len()))]
    pub async fn fetch_all(&self, descriptors: Vec<Descriptor>) -> Res<Vec<Fragment>> {
        if let Some(pb) = &self.progress {
            pb.inc_length(descriptors.len() as u64);
        }

        let results = join_all(descriptors.iter().map(|d| self.fetch_one(d))).await;

        if self.cancel.is_cancelled() {
            cleanup_spooled(&descriptors).await;
            return Err(Error::Cancelled);
        }

        let mut fragments = Vec::with_capacity(results.len());
        let mut failed = Vec::new();
        for (descriptor, result) in descriptors.iter().zip(results) {
            match result {
                Ok(body) => fragments.push(Fragment {
                    path: descriptor.path.clone(),
                    media_type: descriptor.media_type.clone(),
                    body,
                    status: FetchStatus::Fetched,
                }),
                Err(Error::Cancelled) => {
                    cleanup_spooled(&descriptors).await;
                    return Err(Error::Cancelled);
                }
                Err(e) if descriptor.required => {
                    tracing::warn!(path = %descriptor.path, error = %e, "required resource failed");
                    failed.push(format!("{} ({e})", descriptor.path));
                }
                Err(e) => {
                    tracing::warn!(path = %descriptor.path, error = %e, "omitting optional resource");
                    fragments.push(Fragment {
                        path: descriptor.path.clone(),
                        media_type: descriptor.media_type.clone(),
                        body: FragmentBody::Missing,
                        status: FetchStatus::Omitted,
                    });
                }
            }
        }

        if !failed.is_empty() {
            cleanup_spooled(&descriptors).await;
            return Err(Error::IncompleteAssembly(format!(
                "could not download {}",
                failed.join(", ")
            )));
        }
        Ok(fragments)
    }

    /// Downloads a single resource, keeping it in memory.
    pub async fn fetch_bytes(&self, url: &str) -> Res<Vec<u8>> {
        let descriptor = Descriptor::new(url, url, "application/octet-stream");
        match self.fetch_one(&descriptor).await? {
            FragmentBody::Memory(bytes) => Ok(bytes),
            _ => Err(Error::IncompleteAssembly(format!("could not download {url}"))),
        }
    }

    pub async fn fetch_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Res<T> {
        let bytes = self.fetch_bytes(url).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn fetch_one(&self, descriptor: &Descriptor) -> Res<FragmentBody> {
        let result = self.fetch_with_retry(descriptor).await;
        if let Some(pb) = &self.progress {
            pb.inc(1);
        }
        result
    }

    async fn fetch_with_retry(&self, descriptor: &Descriptor) -> Res<FragmentBody> {
        let mut attempt = 0;
        loop {
            // A worker slot is held per attempt, never across a retry delay
            let permit = tokio::select! {
                permit = self.permits.acquire() => permit.map_err(|_| Error::Cancelled)?,
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            };
            let outcome = tokio::select! {
                outcome = self.try_fetch(descriptor) => outcome,
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            };
            drop(permit);

            let failure = match outcome {
                Ok(body) => return Ok(body),
                Err(failure) => failure,
            };

            attempt += 1;
            if !failure.error.is_retryable() || attempt >= self.policy.max_attempts {
                return Err(failure.error);
            }

            let delay = failure
                .retry_after
                .map(|d| d.min(MAX_RETRY_AFTER))
                .unwrap_or_else(|| self.policy.backoff(attempt - 1));
            tracing::debug!(
                url = %descriptor.url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure.error,
                "retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    async fn try_fetch(&self, descriptor: &Descriptor) -> Result<FragmentBody, AttemptError> {
        let response = self
            .http
            .get(&descriptor.url)
            .headers(descriptor.headers.clone())
            .send()
            .await
            .map_err(Error::from)?;

        let retry_after = (response.status() == StatusCode::TOO_MANY_REQUESTS)
            .then(|| parse_retry_after(response.headers()))
            .flatten();
        let mut response = check_status(response).await.map_err(|error| AttemptError {
            error,
            retry_after,
        })?;

        let Some(spool) = &descriptor.spool else {
            let bytes = response.bytes().await.map_err(Error::from)?;
            return Ok(FragmentBody::Memory(bytes.to_vec()));
        };

        if let Some(parent) = spool.parent() {
            async_fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }
        let mut file = async_fs::File::create(spool)
            .await
            .map_err(|e| Error::io(spool, e))?;
        while let Some(chunk) = response.chunk().await.map_err(Error::from)? {
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::io(spool, e))?;
        }
        file.flush().await.map_err(|e| Error::io(spool, e))?;
        Ok(FragmentBody::File(spool.clone()))
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

async fn cleanup_spooled(descriptors: &[Descriptor]) {
    for spool in descriptors.iter().filter_map(|d| d.spool.as_ref()) {
        let _ = async_fs::remove_file(spool).await;
    }
}
