//! EPUB assembly from an open content manifest.
//!
//! An open ebook or magazine session lists its pages (the roster) and its
//! assets. Once every listed file has been fetched, [`assemble`] checks each
//! XHTML page for well-formedness, derives the reading order from the roster,
//! picks a cover image and renders an EPUB 3 navigation document. The result
//! is handed to a [`ContainerWriter`], which decides the on-disk format.
//!
//! Assembly is all or nothing: a missing or malformed page fails the whole
//! publication with [`Error::IncompleteAssembly`] or [`Error::Xml`], and the
//! writer is never finalized.

use std::{collections::HashMap, path::Path};

use quick_xml::{Reader, escape::escape, events::Event};

use crate::{
    Error, Res,
    fetch::Fragment,
    libby::OpenContentManifest,
    package::{
        CoverPolicy, PublicationMetadata,
        epub::{ContainerEntry, ContainerWriter},
    },
    types::TocEntry,
    utils,
};

const NAV_PATH: &str = "nav.xhtml";
const NAV_FALLBACK_PATH: &str = "loancli-nav.xhtml";

/// What went into an assembled container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyReport {
    pub entries: Vec<String>,
    pub reading_order: Vec<String>,
    pub cover: String,
    pub navigation: String,
}

/// A content page and the title found in it.
#[derive(Debug, Clone)]
pub struct Page {
    pub path: String,
    pub title: Option<String>,
}

/// Builds the container for `manifest` from its fetched fragments.
///
/// # Arguments
///
/// * `manifest` - Roster, assets and openbook of the open session
/// * `fragments` - One fetched fragment per roster and asset entry, held in
///   memory
/// * `media_cover` - Optional cover from the media service, used by
///   [`CoverPolicy::MediaCover`]
/// * `metadata` - Title and language for the navigation document
/// * `policy` - How to pick the cover when the session marks none
/// * `writer` - Receives the entries, reading order, cover and navigation
///
/// # Returns
///
/// An [`AssemblyReport`] listing what was handed to `writer`. Nothing is
/// passed to `writer` unless every entry checked out.
///
/// # Errors
///
/// * [`Error::IncompleteAssembly`] - A fragment is missing, no page is
///   readable or no cover image exists
/// * [`Error::Xml`] - A page is not well-formed
pub fn assemble(
    manifest: &OpenContentManifest,
    fragments: &[Fragment],
    media_cover: Option<&Fragment>,
    metadata: &PublicationMetadata,
    policy: CoverPolicy,
    writer: &mut dyn ContainerWriter,
) -> Res<AssemblyReport> {
    let by_path: HashMap<&str, &Fragment> = fragments
        .iter()
        .filter(|f| f.is_fetched())
        .map(|f| (f.path.as_str(), f))
        .collect();

    let mut entries = Vec::new();
    let mut pages = Vec::new();
    for item in manifest.roster.iter().chain(manifest.assets.iter()) {
        let fragment = by_path.get(item.path.as_str()).ok_or_else(|| {
            Error::IncompleteAssembly(format!("{} was not downloaded", item.path))
        })?;
        let bytes = fragment.bytes().ok_or_else(|| {
            Error::IncompleteAssembly(format!("{} is not held in memory", item.path))
        })?;

        if item.media_type == "application/xhtml+xml" {
            let title = check_document(&item.path, bytes)?;
            pages.push(Page {
                path: item.path.clone(),
                title,
            });
        } else if utils::is_document_type(&item.media_type) {
            pages.push(Page {
                path: item.path.clone(),
                title: None,
            });
        }
        entries.push(ContainerEntry {
            path: item.path.clone(),
            media_type: item.media_type.clone(),
            bytes: bytes.to_vec(),
        });
    }

    let reading_order: Vec<String> = manifest
        .roster
        .iter()
        .filter(|e| utils::is_document_type(&e.media_type))
        .map(|e| e.path.clone())
        .collect();
    if reading_order.is_empty() {
        return Err(Error::IncompleteAssembly("no readable pages".into()));
    }

    let cover = choose_cover(manifest, &entries, media_cover, policy)?;
    if let Some(extra) = cover.extra {
        entries.push(extra);
    }

    let nav_path = if entries.iter().any(|e| e.path == NAV_PATH) {
        NAV_FALLBACK_PATH
    } else {
        NAV_PATH
    };
    let toc = manifest
        .openbook
        .nav
        .as_ref()
        .map(|n| n.toc.as_slice())
        .unwrap_or_default();
    let nav = render_nav(&metadata.title, &metadata.language, toc, &pages, &reading_order);
    entries.push(ContainerEntry {
        path: nav_path.to_string(),
        media_type: "application/xhtml+xml".to_string(),
        bytes: nav.into_bytes(),
    });

    let report = AssemblyReport {
        entries: entries.iter().map(|e| e.path.clone()).collect(),
        reading_order: reading_order.clone(),
        cover: cover.path.clone(),
        navigation: nav_path.to_string(),
    };

    for entry in entries {
        writer.add_entry(entry)?;
    }
    writer.set_reading_order(reading_order)?;
    writer.designate_cover(&cover.path)?;
    writer.designate_navigation(nav_path)?;
    Ok(report)
}

/// Assembles and writes the container on a blocking thread.
pub async fn write_epub(
    manifest: &OpenContentManifest,
    fragments: &[Fragment],
    media_cover: Option<&Fragment>,
    metadata: &PublicationMetadata,
    policy: CoverPolicy,
    mut writer: Box<dyn ContainerWriter>,
    dest: &Path,
) -> Res<AssemblyReport> {
    let report = assemble(
        manifest,
        fragments,
        media_cover,
        metadata,
        policy,
        writer.as_mut(),
    )?;
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || writer.finalize(&dest))
        .await
        .map_err(|e| Error::Container(e.to_string()))??;
    Ok(report)
}

struct CoverChoice {
    path: String,
    extra: Option<ContainerEntry>,
}

fn choose_cover(
    manifest: &OpenContentManifest,
    entries: &[ContainerEntry],
    media_cover: Option<&Fragment>,
    policy: CoverPolicy,
) -> Res<CoverChoice> {
    if let Some(marked) = &manifest.cover {
        if entries
            .iter()
            .any(|e| &e.path == marked && utils::is_image_type(&e.media_type))
        {
            return Ok(CoverChoice {
                path: marked.clone(),
                extra: None,
            });
        }
        tracing::warn!(path = %marked, "marked cover is not an image asset");
    }

    if policy == CoverPolicy::MediaCover {
        if let Some(bytes) = media_cover.and_then(|f| f.bytes()) {
            let mut path = "cover.jpg".to_string();
            let mut n = 1;
            while entries.iter().any(|e| e.path == path) {
                n += 1;
                path = format!("cover-{n}.jpg");
            }
            return Ok(CoverChoice {
                path: path.clone(),
                extra: Some(ContainerEntry {
                    path,
                    media_type: "image/jpeg".to_string(),
                    bytes: bytes.to_vec(),
                }),
            });
        }
        tracing::debug!("no media cover, using the first image");
    }

    manifest
        .assets
        .iter()
        .chain(manifest.roster.iter())
        .find(|e| utils::is_image_type(&e.media_type))
        .map(|e| CoverChoice {
            path: e.path.clone(),
            extra: None,
        })
        .ok_or_else(|| Error::IncompleteAssembly("publication has no cover image".into()))
}

/// Verifies a page is well-formed and returns its title: the `<title>`
/// element, or the first heading.
pub fn check_document(path: &str, bytes: &[u8]) -> Res<Option<String>> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();
    let mut capture: Option<Vec<u8>> = None;
    let mut capturing_title = false;
    let mut title: Option<String> = None;
    let mut heading: Option<String> = None;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_ascii_lowercase();
                if capture.is_none() && is_title_element(&name, title.is_none(), heading.is_none()) {
                    capturing_title = name == b"title";
                    capture = Some(name);
                    text.clear();
                }
            }
            Ok(Event::Text(t)) if capture.is_some() => {
                let unescaped = t
                    .unescape()
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned());
                text.push_str(&unescaped);
            }
            Ok(Event::CData(t)) if capture.is_some() => {
                text.push_str(&String::from_utf8_lossy(&t));
            }
            Ok(Event::End(e)) => {
                let name = e.local_name().as_ref().to_ascii_lowercase();
                if capture.as_deref() == Some(name.as_slice()) {
                    let value = text.split_whitespace().collect::<Vec<_>>().join(" ");
                    if !value.is_empty() {
                        if capturing_title {
                            title = Some(value);
                        } else {
                            heading = Some(value);
                        }
                    }
                    capture = None;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::xml(path, e)),
        }
        buf.clear();
    }
    Ok(title.or(heading))
}

fn is_title_element(name: &[u8], want_title: bool, want_heading: bool) -> bool {
    match name {
        b"title" => want_title,
        b"h1" | b"h2" | b"h3" | b"h4" | b"h5" | b"h6" => want_heading,
        _ => false,
    }
}

/// Renders the EPUB 3 navigation document. The openbook's table of contents
/// is used when it has one; otherwise every page gets an entry labeled with
/// its extracted title.
pub fn render_nav(
    title: &str,
    language: &str,
    toc: &[TocEntry],
    pages: &[Page],
    reading_order: &[String],
) -> String {
    let mut body = String::new();
    if toc.is_empty() {
        for (i, path) in reading_order.iter().enumerate() {
            let label = pages
                .iter()
                .find(|p| &p.path == path)
                .and_then(|p| p.title.clone())
                .unwrap_or_else(|| format!("Page {}", i + 1));
            body.push_str(&format!(
                "      <li><a href=\"{}\">{}</a></li>\n",
                escape(path.as_str()),
                escape(label.as_str())
            ));
        }
    } else {
        render_toc(&mut body, toc, 3);
    }

    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
<!DOCTYPE html>\n\
<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" lang=\"{lang}\" xml:lang=\"{lang}\">\n\
  <head>\n    <title>{title}</title>\n  </head>\n\
  <body>\n\
  <nav epub:type=\"toc\" id=\"toc\">\n    <h1>{title}</h1>\n    <ol>\n{body}    </ol>\n  </nav>\n\
  </body>\n\
</html>\n",
        lang = escape(language),
        title = escape(title),
    )
}

fn render_toc(out: &mut String, entries: &[TocEntry], depth: usize) {
    let indent = "  ".repeat(depth);
    for entry in entries {
        let href = entry.path.trim_start_matches('/');
        out.push_str(&format!(
            "{indent}<li><a href=\"{}\">{}</a>",
            escape(href),
            escape(entry.title.as_str())
        ));
        if entry.contents.is_empty() {
            out.push_str("</li>\n");
        } else {
            out.push_str(&format!("\n{indent}  <ol>\n"));
            render_toc(out, &entry.contents, depth + 2);
            out.push_str(&format!("{indent}  </ol>\n{indent}</li>\n"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_title_element_first() {
        let page = br#"<?xml version="1.0"?><html xmlns="http://www.w3.org/1999/xhtml"><head><title>Chapter &amp; One</title></head><body><h1>Heading</h1></body></html>"#;
        assert_eq!(
            check_document("p.xhtml", page).unwrap().as_deref(),
            Some("Chapter & One")
        );
    }

    #[test]
    fn falls_back_to_heading() {
        let page = br#"<html><head><title> </title></head><body><h2>The <em>Real</em> Start</h2></body></html>"#;
        assert_eq!(
            check_document("p.xhtml", page).unwrap().as_deref(),
            Some("The Real Start")
        );
    }

    #[test]
    fn rejects_broken_markup() {
        assert!(matches!(
            check_document("p.xhtml", b"<html><body><p></body></html>"),
            Err(Error::Xml { .. })
        ));
    }
}
