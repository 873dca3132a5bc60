use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tabled::Tabled;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChipResponse {
    pub chip: String,
    pub identity: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloneCodeResponse {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub code: Option<String>,
    #[serde(default)]
    pub expiry: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceMessage {
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub cards: Vec<Card>,
    #[serde(default)]
    pub loans: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    #[serde(deserialize_with = "string_or_number")]
    pub card_id: String,
    #[serde(default)]
    pub card_name: Option<String>,
    #[serde(default)]
    pub advantage_key: Option<String>,
    #[serde(default)]
    pub library: Option<NamedRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamedRef {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeRef {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverRef {
    #[serde(default)]
    pub href: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanFormat {
    pub id: String,
    #[serde(default)]
    pub is_locked_in: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedSeries {
    #[serde(default)]
    pub series_name: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub reading_order: Option<String>,
}

/// Typed view of a loan record from the sync response.
///
/// The raw record is kept alongside so exports stay a pass-through of what
/// the service returned.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "type")]
    pub kind: TypeRef,
    #[serde(default)]
    pub formats: Vec<LoanFormat>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub card_id: Option<String>,
    #[serde(default)]
    pub first_creator_name: Option<String>,
    #[serde(default)]
    pub expire_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub checkout_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub covers: HashMap<String, CoverRef>,
    #[serde(default)]
    pub edition: Option<String>,
    #[serde(default)]
    pub detailed_series: Option<DetailedSeries>,
    #[serde(default)]
    pub publisher: Option<NamedRef>,
    #[serde(default)]
    pub is_returnable: Option<bool>,
    #[serde(default)]
    pub is_renewable: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenSession {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub urls: OpenUrls,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenUrls {
    #[serde(default)]
    pub web: Option<String>,
    #[serde(default)]
    pub rosters: Option<String>,
    #[serde(default)]
    pub openbook: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RosterGroup {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub entries: Vec<RosterEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RosterEntry {
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Openbook {
    #[serde(default)]
    pub title: Option<OpenbookTitle>,
    #[serde(default)]
    pub creator: Vec<OpenbookCreator>,
    #[serde(default)]
    pub description: Option<OpenbookDescription>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default, rename = "-odread-buid")]
    pub buid: Option<String>,
    #[serde(default)]
    pub spine: Vec<SpineItem>,
    #[serde(default)]
    pub manifest: Vec<OpenbookManifestItem>,
    #[serde(default)]
    pub nav: Option<OpenbookNav>,
    #[serde(default)]
    pub cover: Option<OpenbookCover>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenbookTitle {
    #[serde(default)]
    pub main: String,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub collection: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenbookCreator {
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenbookDescription {
    #[serde(default)]
    pub full: Option<String>,
    #[serde(default)]
    pub short: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpineItem {
    #[serde(rename = "-odread-original-path")]
    pub original_path: String,
    #[serde(default, rename = "media-type")]
    pub media_type: Option<String>,
    #[serde(default, rename = "audio-duration")]
    pub audio_duration: Option<f64>,
    #[serde(default, rename = "-odread-spine-position")]
    pub position: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenbookManifestItem {
    pub path: String,
    #[serde(default, rename = "media-type")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub properties: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenbookNav {
    #[serde(default)]
    pub toc: Vec<TocEntry>,
    #[serde(default)]
    pub landmarks: Vec<Landmark>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TocEntry {
    pub title: String,
    pub path: String,
    #[serde(default)]
    pub contents: Vec<TocEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Landmark {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenbookCover {
    #[serde(alias = "path")]
    pub href: String,
    #[serde(default, rename = "media-type")]
    pub media_type: Option<String>,
}

/// Descriptive title record from the media service.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub sort_title: Option<String>,
    #[serde(default)]
    pub creators: Vec<MediaCreator>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub publisher: Option<NamedRef>,
    #[serde(default)]
    pub series: Option<String>,
    #[serde(default)]
    pub detailed_series: Option<DetailedSeries>,
    #[serde(default)]
    pub edition: Option<String>,
    #[serde(default)]
    pub languages: Vec<MediaLanguage>,
    #[serde(default)]
    pub subjects: Vec<NamedRef>,
    #[serde(default)]
    pub publish_date: Option<String>,
    #[serde(default)]
    pub covers: HashMap<String, CoverRef>,
    #[serde(default)]
    pub formats: Vec<MediaFormat>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaCreator {
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub sort_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaLanguage {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaFormat {
    pub id: String,
    #[serde(default)]
    pub identifiers: Vec<MediaIdentifier>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaIdentifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Tabled)]
pub struct LoanTableRow {
    #[tabled(rename = "#")]
    pub index: usize,
    pub title: String,
    pub author: String,
    #[tabled(rename = "type")]
    pub kind: String,
    pub expires: String,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}
