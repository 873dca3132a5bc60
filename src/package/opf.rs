//! OPF rendering.
//!
//! The `<metadata>` block is rendered by [`render_metadata`] alone. The EPUB
//! package document and the standalone sidecar both embed its output, so the
//! two can never disagree.

use std::fmt::Write;

use quick_xml::escape::escape;

use crate::package::PublicationMetadata;

pub const PUBLICATION_ID: &str = "publication-id";

/// A manifest item of an EPUB package document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageItem {
    pub id: String,
    pub href: String,
    pub media_type: String,
    pub properties: Vec<&'static str>,
}

/// MARC relator code for a service role name.
pub fn relator_code(role: Option<&str>) -> &'static str {
    match role.map(str::to_ascii_lowercase).as_deref() {
        None | Some("author") => "aut",
        Some("narrator") => "nrt",
        Some("editor") => "edt",
        Some("translator") => "trl",
        Some("illustrator") => "ill",
        Some("foreword") => "aui",
        Some("photographer") => "pht",
        _ => "oth",
    }
}

pub fn render_metadata(meta: &PublicationMetadata) -> String {
    let mut out = String::new();
    out.push_str(
        "  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\" xmlns:opf=\"http://www.idpf.org/2007/opf\">\n",
    );
    let _ = writeln!(
        out,
        "    <dc:identifier id=\"{PUBLICATION_ID}\">{}</dc:identifier>",
        escape(meta.identifier.as_str())
    );
    let _ = writeln!(
        out,
        "    <dc:title id=\"title\">{}</dc:title>",
        escape(meta.title.as_str())
    );
    out.push_str("    <meta refines=\"#title\" property=\"title-type\">main</meta>\n");
    if let Some(subtitle) = &meta.subtitle {
        let _ = writeln!(
            out,
            "    <dc:title id=\"subtitle\">{}</dc:title>",
            escape(subtitle.as_str())
        );
        out.push_str("    <meta refines=\"#subtitle\" property=\"title-type\">subtitle</meta>\n");
    }
    let _ = writeln!(
        out,
        "    <dc:language>{}</dc:language>",
        escape(meta.language.as_str())
    );

    for (i, creator) in meta.creators.iter().enumerate() {
        let id = format!("creator-{:02}", i + 1);
        let element = if creator.is_author() {
            "dc:creator"
        } else {
            "dc:contributor"
        };
        let _ = writeln!(
            out,
            "    <{element} id=\"{id}\">{}</{element}>",
            escape(creator.name.as_str())
        );
        let _ = writeln!(
            out,
            "    <meta refines=\"#{id}\" property=\"role\" scheme=\"marc:relators\">{}</meta>",
            relator_code(creator.role.as_deref())
        );
        if let Some(file_as) = &creator.file_as {
            let _ = writeln!(
                out,
                "    <meta refines=\"#{id}\" property=\"file-as\">{}</meta>",
                escape(file_as.as_str())
            );
        }
    }

    if let Some(publisher) = &meta.publisher {
        let _ = writeln!(
            out,
            "    <dc:publisher>{}</dc:publisher>",
            escape(publisher.as_str())
        );
    }
    if let Some(published) = &meta.published {
        let _ = writeln!(out, "    <dc:date>{}</dc:date>", escape(published.as_str()));
    }
    if let Some(description) = &meta.description {
        let _ = writeln!(
            out,
            "    <dc:description>{}</dc:description>",
            escape(description.as_str())
        );
    }
    for subject in &meta.subjects {
        let _ = writeln!(out, "    <dc:subject>{}</dc:subject>", escape(subject.as_str()));
    }
    if let Some(series) = &meta.series {
        let _ = writeln!(
            out,
            "    <meta property=\"belongs-to-collection\" id=\"series\">{}</meta>",
            escape(series.as_str())
        );
        out.push_str(
            "    <meta refines=\"#series\" property=\"collection-type\">series</meta>\n",
        );
        if let Some(index) = &meta.series_index {
            let _ = writeln!(
                out,
                "    <meta refines=\"#series\" property=\"group-position\">{}</meta>",
                escape(index.as_str())
            );
        }
    }
    let _ = writeln!(
        out,
        "    <meta property=\"dcterms:modified\">{}</meta>",
        modified_stamp(meta)
    );
    out.push_str("  </metadata>\n");
    out
}

/// A fixed timestamp derived from the publication date, so rebuilding the
/// same title yields the same document.
fn modified_stamp(meta: &PublicationMetadata) -> String {
    meta.published
        .as_deref()
        .and_then(|p| chrono::DateTime::parse_from_rfc3339(p).ok())
        .map(|d| {
            d.with_timezone(&chrono::Utc)
                .format("%Y-%m-%dT%H:%M:%SZ")
                .to_string()
        })
        .unwrap_or_else(|| "2000-01-01T00:00:00Z".to_string())
}

/// The package document of an EPUB.
pub fn render_package(
    meta: &PublicationMetadata,
    items: &[PackageItem],
    spine: &[String],
) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    let _ = writeln!(
        out,
        "<package xmlns=\"http://www.idpf.org/2007/opf\" version=\"3.0\" unique-identifier=\"{PUBLICATION_ID}\">"
    );
    out.push_str(&render_metadata(meta));
    out.push_str("  <manifest>\n");
    for item in items {
        let properties = if item.properties.is_empty() {
            String::new()
        } else {
            format!(" properties=\"{}\"", item.properties.join(" "))
        };
        let _ = writeln!(
            out,
            "    <item id=\"{}\" href=\"{}\" media-type=\"{}\"{properties}/>",
            escape(item.id.as_str()),
            escape(item.href.as_str()),
            escape(item.media_type.as_str())
        );
    }
    out.push_str("  </manifest>\n");
    out.push_str("  <spine>\n");
    for idref in spine {
        let _ = writeln!(out, "    <itemref idref=\"{}\"/>", escape(idref.as_str()));
    }
    out.push_str("  </spine>\n");
    out.push_str("</package>\n");
    out
}

/// The standalone metadata document written next to an artifact.
pub fn render_sidecar(meta: &PublicationMetadata) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    let _ = writeln!(
        out,
        "<package xmlns=\"http://www.idpf.org/2007/opf\" version=\"3.0\" unique-identifier=\"{PUBLICATION_ID}\">"
    );
    out.push_str(&render_metadata(meta));
    out.push_str("</package>\n");
    out
}

/// Extracts the `<metadata>` block from a rendered document.
pub fn metadata_block(document: &str) -> Option<&str> {
    let start = document.find("  <metadata")?;
    let end = document[start..].find("</metadata>\n")? + start + "</metadata>\n".len();
    Some(&document[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::Contributor;

    fn meta() -> PublicationMetadata {
        PublicationMetadata {
            identifier: "urn:isbn:9780000000001".into(),
            title: "Fish & Chips".into(),
            creators: vec![
                Contributor {
                    name: "John Writer".into(),
                    role: Some("Author".into()),
                    file_as: Some("Writer, John".into()),
                },
                Contributor {
                    name: "Jane Narrator".into(),
                    role: Some("Narrator".into()),
                    file_as: None,
                },
            ],
            language: "en".into(),
            series: Some("Series".into()),
            series_index: Some("2".into()),
            ..Default::default()
        }
    }

    #[test]
    fn metadata_is_escaped_and_complete() {
        let block = render_metadata(&meta());
        assert!(block.contains("<dc:title id=\"title\">Fish &amp; Chips</dc:title>"));
        assert!(block.contains("<dc:creator id=\"creator-01\">John Writer</dc:creator>"));
        assert!(block.contains("<dc:contributor id=\"creator-02\">Jane Narrator</dc:contributor>"));
        assert!(block.contains(">nrt</meta>"));
        assert!(block.contains("property=\"group-position\">2</meta>"));
    }

    #[test]
    fn package_and_sidecar_share_metadata() {
        let meta = meta();
        let package = render_package(&meta, &[], &[]);
        let sidecar = render_sidecar(&meta);
        assert_eq!(metadata_block(&package), metadata_block(&sidecar));
        assert_eq!(metadata_block(&sidecar), Some(render_metadata(&meta).as_str()));
    }
}
