//! ODM license documents for MP3 audiobooks.
//!
//! An ODM names the audio parts and where to get the download license. The
//! parts can only be fetched with that license and the client id it was
//! issued to.

use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use quick_xml::{Reader, events::Event};
use reqwest::{
    Client,
    header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT},
};
use sha1::{Digest, Sha1};
use tracing::instrument;

use crate::{
    Error, Res,
    fetch::Descriptor,
    libby::{check_status, fulfill::validate_xml},
    package::Contributor,
    utils,
};

pub const OMC: &str = "1.2.0";
pub const OS: &str = "10.11.6";
pub const ODM_USER_AGENT: &str = "OverDrive Media Console";
const HASH_SECRET: &str = "ELOSNOC*AIDEM*EVIRDREVO";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OdmMetadata {
    pub title: String,
    pub subtitle: Option<String>,
    pub creators: Vec<Contributor>,
    pub publisher: Option<String>,
    pub description: Option<String>,
    pub series: Option<String>,
    pub language: Option<String>,
    pub cover_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OdmPart {
    pub number: u32,
    pub name: String,
    pub filename: String,
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OdmDocument {
    pub media_id: String,
    pub acquisition_url: Option<String>,
    pub base_url: Option<String>,
    pub metadata: OdmMetadata,
    pub parts: Vec<OdmPart>,
}

/// The part-download license and the client id it belongs to.
#[derive(Debug, Clone)]
pub struct OdmLicense {
    pub client_id: String,
    pub license: String,
}

impl OdmDocument {
    pub fn parse(bytes: &[u8]) -> Res<Self> {
        let mut reader = Reader::from_reader(bytes);
        let mut buf = Vec::new();
        let mut doc = OdmDocument {
            media_id: String::new(),
            acquisition_url: None,
            base_url: None,
            metadata: OdmMetadata::default(),
            parts: Vec::new(),
        };
        let mut in_acquisition = false;
        let mut in_metadata = false;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                    b"OverDriveMedia" => {
                        if let Some(id) = attribute(&e, b"id")? {
                            doc.media_id = id;
                        }
                    }
                    b"AcquisitionUrl" => in_acquisition = true,
                    b"Metadata" => in_metadata = true,
                    b"Protocol" => {
                        let method = attribute(&e, b"method")?;
                        if method.as_deref().is_none_or(|m| m == "download") {
                            if let Some(base) = attribute(&e, b"baseurl")? {
                                doc.base_url.get_or_insert(base);
                            }
                        }
                    }
                    b"Part" => doc.parts.push(OdmPart {
                        number: attribute(&e, b"number")?
                            .and_then(|n| n.parse().ok())
                            .unwrap_or(doc.parts.len() as u32 + 1),
                        name: attribute(&e, b"name")?.unwrap_or_default(),
                        filename: attribute(&e, b"filename")?.unwrap_or_default(),
                        duration: attribute(&e, b"duration")?
                            .as_deref()
                            .and_then(utils::parse_duration),
                    }),
                    _ => {}
                },
                Ok(Event::Text(t)) if in_acquisition => {
                    let url = t.unescape().map_err(|e| Error::xml("ODM", e))?;
                    let url = url.trim();
                    if !url.is_empty() {
                        doc.acquisition_url = Some(url.to_string());
                    }
                }
                Ok(Event::CData(t)) if in_metadata => {
                    let inner = String::from_utf8_lossy(&t).into_owned();
                    doc.metadata = parse_metadata(&inner)?;
                }
                Ok(Event::End(e)) => match e.local_name().as_ref() {
                    b"AcquisitionUrl" => in_acquisition = false,
                    b"Metadata" => in_metadata = false,
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(Error::xml("ODM", e)),
            }
            buf.clear();
        }

        if doc.metadata.title.is_empty() {
            doc.metadata = parse_metadata(&String::from_utf8_lossy(bytes))?;
        }
        doc.parts.sort_by_key(|p| p.number);
        Ok(doc)
    }

    /// Fails if the document can no longer be used to download parts, e.g.
    /// because the loan was returned.
    pub fn ensure_downloadable(&self, loan_id: &str) -> Res<()> {
        if self.acquisition_url.is_none() || self.media_id.is_empty() {
            return Err(Error::fulfillment(loan_id, "ODM has no license acquisition url"));
        }
        if self.base_url.is_none() || self.parts.is_empty() {
            return Err(Error::fulfillment(loan_id, "ODM lists no downloadable parts"));
        }
        Ok(())
    }

    /// Download descriptors for all parts, spooled into `scratch`.
    pub fn part_descriptors(
        &self,
        license: &OdmLicense,
        scratch: &std::path::Path,
    ) -> Res<Vec<Descriptor>> {
        let base = self
            .base_url
            .as_deref()
            .ok_or_else(|| Error::InvalidInput("ODM has no download base url".into()))?;
        let headers = part_headers(license)?;
        Ok(self
            .parts
            .iter()
            .map(|part| {
                let url = format!("{}/{}", base.trim_end_matches('/'), part.filename);
                Descriptor::new(format!("part-{:03}.mp3", part.number), url, "audio/mpeg")
                    .with_headers(headers.clone())
                    .spool_to(scratch.join(format!("part-{:03}.mp3", part.number)))
            })
            .collect())
    }
}

fn attribute(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Res<Option<String>> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == name {
            let value = attr.unescape_value().map_err(|err| Error::xml("ODM", err))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Reads the title metadata block of an ODM.
pub fn parse_metadata(xml: &str) -> Res<OdmMetadata> {
    let mut reader = Reader::from_str(xml);
    let mut meta = OdmMetadata::default();
    let mut current: Option<Vec<u8>> = None;
    let mut role: Option<String> = None;
    let mut file_as: Option<String> = None;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_vec();
                if name == b"Creator" {
                    role = attribute(&e, b"role")?;
                    file_as = attribute(&e, b"file-as")?;
                }
                current = Some(name);
                text.clear();
            }
            Ok(Event::Text(t)) if current.is_some() => {
                let value = t
                    .unescape()
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned());
                text.push_str(&value);
            }
            Ok(Event::CData(t)) if current.is_some() => {
                text.push_str(&String::from_utf8_lossy(&t));
            }
            Ok(Event::End(e)) => {
                let value = text.trim().to_string();
                match e.local_name().as_ref() {
                    b"Title" if meta.title.is_empty() => meta.title = value,
                    b"SubTitle" => meta.subtitle = Some(value).filter(|v| !v.is_empty()),
                    b"Creator" if !value.is_empty() => meta.creators.push(Contributor {
                        name: value,
                        role: role.take(),
                        file_as: file_as.take(),
                    }),
                    b"Publisher" => meta.publisher = Some(value).filter(|v| !v.is_empty()),
                    b"Description" => meta.description = Some(value).filter(|v| !v.is_empty()),
                    b"Series" => meta.series = Some(value).filter(|v| !v.is_empty()),
                    b"Language" if meta.language.is_none() => {
                        meta.language = Some(value).filter(|v| !v.is_empty())
                    }
                    b"CoverUrl" => meta.cover_url = Some(value).filter(|v| !v.is_empty()),
                    _ => {}
                }
                current = None;
                text.clear();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            // Metadata is best-effort; a broken block leaves what was read.
            Err(e) => {
                tracing::warn!(error = %e, "unreadable ODM metadata");
                break;
            }
        }
    }
    Ok(meta)
}

/// A new random client id, as used for license acquisition.
pub fn new_client_id() -> String {
    uuid::Uuid::new_v4().to_string().to_uppercase()
}

/// The request signature expected by the license server:
/// base64 of the SHA-1 of the UTF-16LE encoded `client|OMC|OS|secret`.
pub fn license_hash(client_id: &str) -> String {
    let input = format!("{client_id}|{OMC}|{OS}|{HASH_SECRET}");
    let utf16: Vec<u8> = input.encode_utf16().flat_map(u16::to_le_bytes).collect();
    STANDARD.encode(Sha1::digest(&utf16))
}

/// Requests the part-download license. License servers are single-use, so
/// this is never retried.
#[instrument(skip(http, odm), fields(media_id = %odm.media_id))]
pub async fn acquire_license(http: &Client, odm: &OdmDocument, loan_id: &str) -> Res<OdmLicense> {
    odm.ensure_downloadable(loan_id)?;
    let url = odm.acquisition_url.as_deref().unwrap_or_default();
    let client_id = new_client_id();
    let hash = license_hash(&client_id);

    let response = http
        .get(url)
        .header(USER_AGENT, ODM_USER_AGENT)
        .query(&[
            ("MediaID", odm.media_id.as_str()),
            ("ClientID", client_id.as_str()),
            ("OMC", OMC),
            ("OS", OS),
            ("Hash", hash.as_str()),
        ])
        .send()
        .await?;
    let license = match check_status(response).await {
        Ok(response) => response.text().await?,
        Err(Error::Status {
            status, message, ..
        }) => {
            return Err(Error::fulfillment(
                loan_id,
                format!("license server returned {status}: {message}"),
            ));
        }
        Err(e) => return Err(e),
    };

    validate_xml(license.as_bytes())
        .map_err(|reason| Error::fulfillment(loan_id, format!("license is not XML: {reason}")))?;
    tracing::debug!("part license acquired");
    Ok(OdmLicense { client_id, license })
}

fn part_headers(license: &OdmLicense) -> Res<HeaderMap> {
    let single_line: String = license
        .license
        .chars()
        .filter(|c| *c != '\n' && *c != '\r')
        .collect();
    let value = |v: &str| {
        HeaderValue::from_str(v)
            .map_err(|e| Error::InvalidInput(format!("license cannot be sent as a header: {e}")))
    };

    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("license"), value(&single_line)?);
    headers.insert(HeaderName::from_static("clientid"), value(&license.client_id)?);
    headers.insert(USER_AGENT, HeaderValue::from_static(ODM_USER_AGENT));
    Ok(headers)
}
