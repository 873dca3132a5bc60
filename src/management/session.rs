//! Persisted device session.
//!
//! The session document (`libby.json`) holds the device chip and identity
//! obtained when this client was registered with the lending service, the
//! sync flags of the device and, after linking, the last accepted setup code.
//! Fields this client does not know about are preserved across saves so
//! that a document shared with other tools is never truncated.
//!
//! Older documents stored the setup code under a legacy key. [`migrate`]
//! moves it to the canonical key on load.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Res, types::Card, utils};

pub const CANONICAL_SYNC_CODE_KEY: &str = "__libby_sync_code";
pub const LEGACY_SYNC_CODE_KEY: &str = "__odmpy_sync_code";

/// Device credentials and sync state of this client.
///
/// A session with an empty chip or identity is not configured; see
/// [`Session::is_valid`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    /// Device identifier issued at registration
    #[serde(default, alias = "device_chip")]
    pub chip: String,
    /// Bearer token for the Libby API
    #[serde(default, alias = "device_identity")]
    pub identity: String,
    #[serde(default)]
    pub syncable: bool,
    #[serde(default)]
    pub primary: bool,
    #[serde(
        rename = "__libby_sync_code",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sync_code: Option<String>,
    /// Library cards from the last sync. Not persisted.
    #[serde(skip)]
    pub cards: Vec<Card>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Session {
    pub fn new(chip: String, identity: String) -> Self {
        Self {
            chip,
            identity,
            ..Default::default()
        }
    }

    /// Returns `true` when both the chip and the identity are present.
    pub fn is_valid(&self) -> bool {
        !self.chip.trim().is_empty() && !self.identity.trim().is_empty()
    }
}

/// Persisted session document (`libby.json`).
///
/// The store owns the path only; every call reads or writes the file. Writes
/// go through [`utils::write_atomic`], so a crash never leaves a half-written
/// document behind.
///
/// Single writer: concurrent runs against the same path are not supported.
///
/// # Example
///
/// ```ignore
/// let store = SessionStore::new(config.settings_file());
/// match store.load().await {
///     Ok(session) => println!("device {}", session.chip),
///     Err(Error::NotConfigured) => println!("run `loancli auth` first"),
///     Err(e) => return Err(e),
/// }
/// ```
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Loads the session, migrating legacy keys first.
    ///
    /// A migrated document is written back before the session is returned.
    ///
    /// # Returns
    ///
    /// The stored session, or [`Error::NotConfigured`] when the file is
    /// missing or holds no device chip and identity. A file that is not a
    /// JSON object is [`Error::InvalidInput`].
    pub async fn load(&self) -> Res<Session> {
        if !self.exists() {
            return Err(Error::NotConfigured);
        }

        let content = async_fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::io(&self.path, e))?;
        let mut document = match serde_json::from_str::<Value>(&content)? {
            Value::Object(map) => map,
            _ => {
                return Err(Error::InvalidInput(format!(
                    "{} is not a settings document",
                    self.path.display()
                )));
            }
        };

        if migrate(&mut document) {
            tracing::debug!(path = %self.path.display(), "migrated legacy sync code key");
            self.write_document(&Value::Object(document.clone())).await?;
        }

        let session: Session = serde_json::from_value(Value::Object(document))?;
        if !session.is_valid() {
            return Err(Error::NotConfigured);
        }
        Ok(session)
    }

    /// Writes `session` atomically, creating the settings directory if needed.
    ///
    /// # Arguments
    ///
    /// * `session` - Session to persist; its unknown fields are written back
    ///   unchanged
    pub async fn save(&self, session: &Session) -> Res<()> {
        let value = serde_json::to_value(session)?;
        self.write_document(&value).await
    }

    /// Removes the store. A missing store is not an error.
    pub async fn reset(&self) -> Res<()> {
        match async_fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&self.path, e)),
        }
    }

    async fn write_document(&self, value: &Value) -> Res<()> {
        let json = serde_json::to_string_pretty(value)?;
        utils::write_atomic(&self.path, json.as_bytes()).await
    }
}

/// Renames the legacy sync code key to the canonical one.
///
/// When both keys exist the canonical value wins and the legacy key is
/// dropped. Returns `true` if the document changed.
pub fn migrate(document: &mut Map<String, Value>) -> bool {
    let Some(legacy) = document.remove(LEGACY_SYNC_CODE_KEY) else {
        return false;
    };
    if !document.contains_key(CANONICAL_SYNC_CODE_KEY) {
        document.insert(CANONICAL_SYNC_CODE_KEY.to_string(), legacy);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn migrate_moves_legacy_value() {
        let mut doc = json!({"chip": "1", "identity": "a", "__odmpy_sync_code": "12345678"})
            .as_object()
            .cloned()
            .unwrap();
        assert!(migrate(&mut doc));
        assert_eq!(doc[CANONICAL_SYNC_CODE_KEY], json!("12345678"));
        assert!(!doc.contains_key(LEGACY_SYNC_CODE_KEY));
    }

    #[test]
    fn migrate_keeps_canonical_when_both_present() {
        let mut doc = json!({"__odmpy_sync_code": "old", "__libby_sync_code": "new"})
            .as_object()
            .cloned()
            .unwrap();
        assert!(migrate(&mut doc));
        assert_eq!(doc[CANONICAL_SYNC_CODE_KEY], json!("new"));
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn migrate_is_noop_without_legacy_key() {
        let mut doc = json!({"__libby_sync_code": "new"}).as_object().cloned().unwrap();
        assert!(!migrate(&mut doc));
    }
}
