use std::{
    collections::BTreeSet,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use sha2::{Digest, Sha256};

use crate::{Error, Res};

pub const DEFAULT_BOOK_FOLDER_FORMAT: &str = "%(Title)s - %(Author)s";
pub const DEFAULT_BOOK_FILE_FORMAT: &str = "%(Title)s - %(Author)s";

/// Values available to the `%(Key)s` naming templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateFields {
    pub title: String,
    pub author: String,
    pub series: String,
    pub reading_order: String,
    pub edition: String,
    pub id: String,
}

impl TemplateFields {
    fn lookup(&self, key: &str) -> Option<&str> {
        match key {
            "Title" => Some(&self.title),
            "Author" => Some(&self.author),
            "Series" => Some(&self.series),
            "ReadingOrder" => Some(&self.reading_order),
            "Edition" => Some(&self.edition),
            "ID" => Some(&self.id),
            _ => None,
        }
    }
}

/// Expands `%(Key)s` placeholders and sanitizes the result so it can be used
/// as a single path component. Unknown keys are left untouched.
pub fn format_template(template: &str, fields: &TemplateFields) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("%(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find(")s") {
            Some(end) => {
                let key = &after[..end];
                match fields.lookup(key) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);

    sanitize_path_component(&out)
}

/// Replaces characters that are invalid in file names on common platforms
/// and collapses the whitespace left behind by empty template values.
pub fn sanitize_path_component(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();

    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed
        .trim_matches(|c: char| c == '-' || c == '.' || c.is_whitespace())
        .to_string();

    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed
    }
}

/// Parses durations as written by the service: `HH:MM:SS`, `MM:SS` or
/// plain (fractional) seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if !value.contains(':') {
        let secs = value.parse::<f64>().ok()?;
        return (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs));
    }

    let mut total = 0f64;
    for part in value.split(':') {
        let n = part.parse::<f64>().ok()?;
        if !n.is_finite() || n < 0.0 {
            return None;
        }
        total = total * 60.0 + n;
    }
    total.is_finite().then(|| Duration::from_secs_f64(total))
}

/// Best-effort media type from a path's extension.
pub fn guess_media_type(path: &str) -> &'static str {
    let ext = path
        .rsplit('.')
        .next()
        .map(|e| e.split(['?', '#']).next().unwrap_or(e).to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "xhtml" | "xht" => "application/xhtml+xml",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "mp3" => "audio/mpeg",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        _ => "application/octet-stream",
    }
}

pub fn is_document_type(media_type: &str) -> bool {
    matches!(media_type, "application/xhtml+xml" | "text/html")
}

pub fn is_image_type(media_type: &str) -> bool {
    media_type.starts_with("image/")
}

/// Parses a 1-based loan selection such as `1,3-5`.
///
/// Returns the sorted, de-duplicated indices. Indices outside `1..=max` are
/// rejected.
pub fn parse_selection(input: &str, max: usize) -> Res<Vec<usize>> {
    let mut selected = BTreeSet::new();
    for token in input.split([',', ' ']).filter(|t| !t.trim().is_empty()) {
        let token = token.trim();
        let (start, end) = match token.split_once('-') {
            Some((a, b)) => (parse_index(a)?, parse_index(b)?),
            None => {
                let n = parse_index(token)?;
                (n, n)
            }
        };
        if start == 0 || end < start || end > max {
            return Err(Error::InvalidInput(format!(
                "invalid selection {token}: choose between 1 and {max}"
            )));
        }
        selected.extend(start..=end);
    }
    Ok(selected.into_iter().collect())
}

fn parse_index(raw: &str) -> Res<usize> {
    raw.trim()
        .parse::<usize>()
        .map_err(|_| Error::InvalidInput(format!("not a number: {raw}")))
}

/// Masks all but the last two characters of a secret for log output.
pub fn redact(secret: &str) -> String {
    let count = secret.chars().count();
    if count <= 2 {
        return "*".repeat(count);
    }
    let visible: String = secret.chars().skip(count - 2).collect();
    format!("{}{}", "*".repeat(count - 2), visible)
}

/// Derives a stable `urn:uuid:` identifier from a seed, for publications
/// that come without an ISBN.
pub fn stable_identifier(seed: &str) -> String {
    let hash = Sha256::digest(seed.as_bytes());
    let hex: String = hash.iter().take(16).map(|b| format!("{b:02x}")).collect();
    format!(
        "urn:uuid:{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Writes `bytes` to `path` through a sibling temporary file and a rename,
/// so readers never observe a half-written file. The temporary file is
/// removed on every failure.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Res<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    async_fs::create_dir_all(&parent)
        .await
        .map_err(|e| Error::io(&parent, e))?;

    let dest = path.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || -> Res<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".loancli-")
            .suffix(".tmp")
            .tempfile_in(&parent)
            .map_err(|e| Error::io(&parent, e))?;
        tmp.write_all(&bytes)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| Error::io(tmp.path(), e))?;
        tmp.persist(&dest).map_err(|e| Error::io(&dest, e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| Error::io(path, std::io::Error::other(e)))?
}
