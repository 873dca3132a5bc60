//! Fulfillment of a negotiated loan.
//!
//! A [`Plan`] is fulfilled through exactly one protocol:
//!
//! - **License**: one GET to the per-loan fulfillment endpoint. The body is a
//!   license document (ACSM or ODM) that is kept verbatim. Open EPUB/PDF
//!   formats deliver the book file itself through the same endpoint.
//! - **Open**: one GET to the open-session endpoint, a warm-up HEAD against
//!   the session's web URL, then the `rosters` and `openbook` manifests. The
//!   result is an [`OpenContentManifest`].
//!
//! License endpoints are single-use, so a fulfillment is never re-requested:
//! the engine caches every result per loan and format.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use quick_xml::{Reader, events::Event};
use reqwest::Url;
use tracing::instrument;

use crate::{
    Error, Res,
    fetch::{AssetFetcher, Descriptor},
    libby::{
        LibbyClient,
        formats::{Category, LibbyFormat, Plan, Protocol},
        loans::Loan,
    },
    types::{OpenSession, Openbook, RosterGroup},
    utils,
};

const CONTENT_GROUP: &str = "title-content";
const ASSETS_GROUP: &str = "title-assets";

#[derive(Debug, Clone)]
pub enum Fulfillment {
    License(LicenseDocument),
    Open(OpenContentManifest),
}

/// The raw body of the license endpoint.
#[derive(Debug, Clone)]
pub struct LicenseDocument {
    pub loan_id: String,
    pub format: LibbyFormat,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl LicenseDocument {
    pub fn extension(&self) -> &'static str {
        self.format.license_extension()
    }

    /// `true` when the endpoint delivered the book file instead of a license.
    pub fn is_book_file(&self) -> bool {
        matches!(
            self.format,
            LibbyFormat::EbookEpubOpen | LibbyFormat::EbookPdfOpen
        )
    }
}

/// One entry of an open content manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    /// Path inside the publication, derived from the entry URL.
    pub path: String,
    pub url: String,
    pub media_type: String,
    /// Playing time of an audio part.
    pub duration: Option<Duration>,
}

/// Everything needed to rebuild an open content title.
///
/// For ebooks and magazines `roster` lists the content fragments and `assets`
/// the binary resources, both in roster order. For audiobooks `roster` lists
/// the audio parts in spine order.
#[derive(Debug, Clone)]
pub struct OpenContentManifest {
    pub loan_id: String,
    pub category: Category,
    pub message: Option<String>,
    pub base_url: Url,
    pub roster: Vec<ManifestEntry>,
    pub assets: Vec<ManifestEntry>,
    pub openbook: Openbook,
    /// Logical path of the asset the openbook marks as the cover.
    pub cover: Option<String>,
}

impl OpenContentManifest {
    /// Builds the manifest from the fetched rosters and openbook documents.
    pub fn build(
        loan_id: &str,
        category: Category,
        message: Option<String>,
        base_url: Url,
        rosters: Vec<RosterGroup>,
        openbook: Openbook,
    ) -> Res<Self> {
        let media_types: HashMap<&str, &str> = openbook
            .manifest
            .iter()
            .filter_map(|m| Some((m.path.as_str(), m.media_type.as_deref()?)))
            .collect();
        let mut seen = HashSet::new();
        let mut roster = Vec::new();
        let mut assets = Vec::new();

        if category == Category::Audiobook {
            for item in &openbook.spine {
                let url = base_url.join(&item.original_path).map_err(|e| {
                    Error::malformed_session(loan_id, format!("bad spine path: {e}"))
                })?;
                let path = logical_path(&url, &base_url);
                if !seen.insert(path.clone()) {
                    continue;
                }
                roster.push(ManifestEntry {
                    media_type: item
                        .media_type
                        .clone()
                        .unwrap_or_else(|| "audio/mpeg".to_string()),
                    path,
                    url: url.to_string(),
                    duration: item
                        .audio_duration
                        .filter(|d| d.is_finite() && *d >= 0.0)
                        .map(Duration::from_secs_f64),
                });
            }
            if roster.is_empty() {
                return Err(Error::malformed_session(loan_id, "openbook has no audio parts"));
            }
        } else {
            for group in &rosters {
                let target = match group.group.as_str() {
                    CONTENT_GROUP => &mut roster,
                    ASSETS_GROUP => &mut assets,
                    other => {
                        tracing::debug!(group = other, "ignoring roster group");
                        continue;
                    }
                };
                for entry in &group.entries {
                    let url = base_url.join(&entry.url).map_err(|e| {
                        Error::malformed_session(loan_id, format!("bad roster url: {e}"))
                    })?;
                    let path = logical_path(&url, &base_url);
                    if !seen.insert(path.clone()) {
                        tracing::warn!(%path, "duplicate roster entry");
                        continue;
                    }
                    let media_type = media_types
                        .get(path.as_str())
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| utils::guess_media_type(&path).to_string());
                    target.push(ManifestEntry {
                        path,
                        url: url.to_string(),
                        media_type,
                        duration: None,
                    });
                }
            }
            if roster.is_empty() {
                return Err(Error::malformed_session(loan_id, "roster has no content"));
            }
        }

        let cover = resolve_cover(&openbook, &base_url, &assets);

        Ok(Self {
            loan_id: loan_id.to_string(),
            category,
            message,
            base_url,
            roster,
            assets,
            openbook,
            cover,
        })
    }

    /// Download descriptors for every roster and asset entry, in manifest
    /// order. All of them are required.
    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.roster
            .iter()
            .chain(self.assets.iter())
            .map(|e| Descriptor::new(&e.path, &e.url, &e.media_type))
            .collect()
    }

    pub fn title(&self) -> Option<&str> {
        self.openbook
            .title
            .as_ref()
            .map(|t| t.main.as_str())
            .filter(|t| !t.is_empty())
    }
}

/// The path of `url` inside the publication: the URL path without the
/// leading slash and without the session's base path, if it has one.
pub fn logical_path(url: &Url, base: &Url) -> String {
    let path = url.path();
    let base_path = base.path().trim_end_matches('/');
    let relative = if !base_path.is_empty() && url.host() == base.host() {
        path.strip_prefix(base_path)
            .filter(|rest| rest.starts_with('/'))
            .unwrap_or(path)
    } else {
        path
    };
    relative.trim_start_matches('/').to_string()
}

fn resolve_cover(openbook: &Openbook, base: &Url, assets: &[ManifestEntry]) -> Option<String> {
    let is_asset = |path: &str| assets.iter().any(|a| a.path == path);

    if let Some(cover) = &openbook.cover {
        if let Ok(url) = base.join(&cover.href) {
            let path = logical_path(&url, base);
            if is_asset(&path) {
                return Some(path);
            }
        }
        let href = cover.href.trim_start_matches('/');
        if is_asset(href) {
            return Some(href.to_string());
        }
    }

    openbook
        .manifest
        .iter()
        .find(|m| {
            m.properties
                .as_deref()
                .is_some_and(|p| p.split_whitespace().any(|p| p == "cover-image"))
        })
        .map(|m| m.path.trim_start_matches('/').to_string())
        .filter(|p| is_asset(p))
}

/// Checks that `bytes` is a well-formed XML document with a root element.
pub fn validate_xml(bytes: &[u8]) -> Result<(), String> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();
    let mut has_root = false;
    let mut depth = 0usize;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(_)) => {
                has_root = true;
                depth += 1;
            }
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Empty(_)) => has_root = true,
            Ok(Event::Text(t)) if depth == 0 && !has_root => {
                if !t.iter().all(u8::is_ascii_whitespace) {
                    return Err("text outside of the root element".into());
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
        buf.clear();
    }
    if !has_root {
        return Err("document has no root element".into());
    }
    if depth != 0 {
        return Err("unclosed element".into());
    }
    Ok(())
}

/// Fulfills loans and remembers the results for the rest of the run.
pub struct FulfillmentEngine<'a> {
    client: &'a LibbyClient,
    fetcher: AssetFetcher,
    cache: HashMap<(String, LibbyFormat), Arc<Fulfillment>>,
}

impl<'a> FulfillmentEngine<'a> {
    pub fn new(client: &'a LibbyClient, fetcher: AssetFetcher) -> Self {
        Self {
            client,
            fetcher,
            cache: HashMap::new(),
        }
    }

    pub fn fetcher(&self) -> &AssetFetcher {
        &self.fetcher
    }

    pub fn client(&self) -> &LibbyClient {
        self.client
    }

    pub async fn fulfill(&mut self, loan: &Loan, plan: &Plan) -> Res<Arc<Fulfillment>> {
        let key = (loan.id().to_string(), plan.format);
        if let Some(done) = self.cache.get(&key) {
            tracing::debug!(id = loan.id(), format = %plan.format, "reusing fulfillment");
            return Ok(Arc::clone(done));
        }

        let fulfillment = match plan.protocol {
            Protocol::License => Fulfillment::License(self.acquire_license(loan, plan.format).await?),
            Protocol::Open => Fulfillment::Open(self.open_session(loan, plan.category).await?),
        };
        let fulfillment = Arc::new(fulfillment);
        self.cache.insert(key, Arc::clone(&fulfillment));
        Ok(fulfillment)
    }

    /// Requests the license document. Never retried.
    #[instrument(skip(self, loan), fields(id = loan.id()))]
    async fn acquire_license(&self, loan: &Loan, format: LibbyFormat) -> Res<LicenseDocument> {
        let card = loan.require_card()?;
        let url = self
            .client
            .api_url(&format!("/card/{card}/loan/{}/fulfill/{format}", loan.id()));

        let response = match self.client.send(self.client.http().get(&url)).await {
            Ok(response) => response,
            Err(Error::Status {
                status, message, ..
            }) => {
                return Err(Error::fulfillment(
                    loan.id(),
                    format!("{format} returned {status}: {message}"),
                ));
            }
            Err(e) => return Err(Error::fulfillment(loan.id(), e.to_string())),
        };

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::fulfillment(loan.id(), e.to_string()))?
            .to_vec();

        let document = LicenseDocument {
            loan_id: loan.id().to_string(),
            format,
            content_type,
            bytes,
        };
        if document.bytes.is_empty() {
            return Err(Error::fulfillment(loan.id(), "empty license document"));
        }
        if !document.is_book_file() {
            validate_xml(&document.bytes).map_err(|reason| {
                Error::fulfillment(loan.id(), format!("license is not XML: {reason}"))
            })?;
        }
        tracing::debug!(size = document.bytes.len(), "license acquired");
        Ok(document)
    }

    #[instrument(skip(self, loan), fields(id = loan.id()))]
    async fn open_session(&self, loan: &Loan, category: Category) -> Res<OpenContentManifest> {
        let card = loan.require_card()?;
        let path = format!(
            "/open/{}/card/{card}/title/{}",
            category.open_segment(),
            loan.id()
        );
        let session: OpenSession = self.client.get_json(&path).await?;

        let malformed = |reason: &str| Error::malformed_session(loan.id(), reason);
        let web = session
            .urls
            .web
            .as_deref()
            .ok_or_else(|| malformed("session has no web url"))?;
        let base_url = Url::parse(web).map_err(|e| malformed(&format!("bad web url: {e}")))?;
        let openbook_url = session
            .urls
            .openbook
            .as_deref()
            .ok_or_else(|| malformed("session has no openbook url"))?;
        let rosters_url = match (category, session.urls.rosters.as_deref()) {
            (Category::Audiobook, url) => url,
            (_, Some(url)) => Some(url),
            (_, None) => return Err(malformed("session has no rosters url")),
        };

        match self.client.http().head(base_url.clone()).send().await {
            Ok(r) if r.status().is_success() => {}
            Ok(r) => tracing::warn!(status = %r.status(), "open session warm-up failed"),
            Err(e) => tracing::warn!(error = %e, "open session warm-up failed"),
        }

        let rosters: Vec<RosterGroup> = match rosters_url {
            Some(url) if category != Category::Audiobook => self.fetcher.fetch_json(url).await?,
            _ => Vec::new(),
        };
        let openbook: Openbook = self.fetcher.fetch_json(openbook_url).await?;

        OpenContentManifest::build(
            loan.id(),
            category,
            session.message,
            base_url,
            rosters,
            openbook,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_path_strips_base_prefix() {
        let base = Url::parse("http://localhost/mock").unwrap();
        let url = Url::parse("http://localhost/mock/pages/p1.xhtml").unwrap();
        assert_eq!(logical_path(&url, &base), "pages/p1.xhtml");

        let other = Url::parse("http://localhost/pages/p1.xhtml").unwrap();
        assert_eq!(logical_path(&other, &base), "pages/p1.xhtml");

        let mockish = Url::parse("http://localhost/mockery/a.css").unwrap();
        assert_eq!(logical_path(&mockish, &base), "mockery/a.css");
    }

    #[test]
    fn audio_parts_resolve_against_web_url() {
        let base = Url::parse("http://localhost/mock").unwrap();
        let joined = base.join("{AAA}book.mp3").unwrap();
        assert_eq!(joined.as_str(), "http://localhost/%7BAAA%7Dbook.mp3");
    }

    #[test]
    fn xml_validation() {
        assert!(validate_xml(b"<?xml version=\"1.0\"?><fulfillmentToken/>").is_ok());
        assert!(validate_xml(b"<a><b></b></a>").is_ok());
        assert!(validate_xml(b"{\"result\":\"ok\"}").is_err());
        assert!(validate_xml(b"<a><b></a>").is_err());
        assert!(validate_xml(b"").is_err());
    }
}
