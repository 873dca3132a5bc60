use std::path::Path;

use loancli::{
    Error,
    fetch::{FetchStatus, Fragment, FragmentBody},
    libby::{Category, Loan, OpenContentManifest},
    package::{
        CoverPolicy, PublicationMetadata,
        ebook::{self, AssemblyReport},
        epub::{self, ContainerSummary, EpubWriter},
    },
    types::{Openbook, RosterGroup},
};
use reqwest::Url;
use serde_json::{Value, json};

const BASE: &str = "http://localhost/mock/";

fn page(title: &str, heading: &str) -> Vec<u8> {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
<html xmlns=\"http://www.w3.org/1999/xhtml\"><head><title>{title}</title></head>\
<body><h1>{heading}</h1><p>text</p></body></html>"
    )
    .into_bytes()
}

fn untitled_page(heading: &str) -> Vec<u8> {
    format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\"><head></head>\
<body><section><h2>{heading}</h2></section></body></html>"
    )
    .into_bytes()
}

fn fragment(path: &str, media_type: &str, body: Vec<u8>) -> Fragment {
    Fragment {
        path: path.to_string(),
        media_type: media_type.to_string(),
        body: FragmentBody::Memory(body),
        status: FetchStatus::Fetched,
    }
}

fn manifest(category: Category, rosters: Value, openbook: Value) -> OpenContentManifest {
    let rosters: Vec<RosterGroup> = serde_json::from_value(rosters).unwrap();
    let openbook: Openbook = serde_json::from_value(openbook).unwrap();
    OpenContentManifest::build(
        "5001",
        category,
        None,
        Url::parse(BASE).unwrap(),
        rosters,
        openbook,
    )
    .unwrap()
}

fn metadata(type_id: &str, openbook: &OpenContentManifest) -> PublicationMetadata {
    let loan = Loan::from_value(json!({
        "id": "5001",
        "title": "Monthly Review",
        "type": {"id": type_id},
        "cardId": "100",
        "firstCreatorName": "Some Editor",
        "formats": [{"id": format!("{type_id}-overdrive")}],
    }))
    .unwrap();
    PublicationMetadata::from_sources(&loan, None, Some(&openbook.openbook))
}

async fn build(
    manifest: &OpenContentManifest,
    fragments: &[Fragment],
    meta: &PublicationMetadata,
    dest: &Path,
) -> AssemblyReport {
    ebook::write_epub(
        manifest,
        fragments,
        None,
        meta,
        CoverPolicy::FirstImage,
        Box::new(EpubWriter::new(meta.clone())),
        dest,
    )
    .await
    .unwrap()
}

fn pages_only(summary: &ContainerSummary) -> Vec<String> {
    summary
        .documents()
        .into_iter()
        .filter(|i| !i.properties.iter().any(|p| p == "nav"))
        .map(|i| i.href.clone())
        .collect()
}

fn magazine() -> (OpenContentManifest, Vec<Fragment>) {
    let manifest = manifest(
        Category::Magazine,
        json!([
            {"group": "title-content", "entries": [
                {"url": "pages/p1.xhtml"},
                {"url": "pages/p2.xhtml"},
            ]},
            {"group": "title-assets", "entries": [
                {"url": "styles/main.css"},
                {"url": "images/front.jpg"},
                {"url": "images/inside.png"},
            ]},
        ]),
        json!({
            "title": {"main": "Monthly Review"},
            "language": "en",
            "manifest": [
                {"path": "images/front.jpg", "media-type": "image/jpeg", "properties": "cover-image"},
            ],
        }),
    );
    let fragments = vec![
        fragment("pages/p1.xhtml", "application/xhtml+xml", page("Front", "Front")),
        fragment("pages/p2.xhtml", "application/xhtml+xml", page("Letters", "Letters")),
        fragment("styles/main.css", "text/css", b"body { margin: 0 }".to_vec()),
        fragment("images/front.jpg", "image/jpeg", vec![0xFF, 0xD8, 0xFF, 0xE0]),
        fragment("images/inside.png", "image/png", vec![0x89, b'P', b'N', b'G']),
    ];
    (manifest, fragments)
}

#[tokio::test]
async fn test_magazine_uses_marked_cover_and_roster_order() {
    let (manifest, fragments) = magazine();
    assert_eq!(manifest.cover.as_deref(), Some("images/front.jpg"));
    let meta = metadata("magazine", &manifest);
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("magazine.epub");

    let report = build(&manifest, &fragments, &meta, &dest).await;
    assert_eq!(report.cover, "images/front.jpg");
    assert_eq!(report.reading_order, vec!["pages/p1.xhtml", "pages/p2.xhtml"]);

    let summary = epub::inspect(&dest).unwrap();
    assert_eq!(pages_only(&summary), vec!["pages/p1.xhtml", "pages/p2.xhtml"]);
    assert_eq!(summary.spine, vec!["pages/p1.xhtml", "pages/p2.xhtml"]);

    let covers = summary.with_property("cover-image");
    assert_eq!(covers.len(), 1);
    assert_eq!(covers[0].href, "images/front.jpg");
    assert_eq!(summary.with_property("nav").len(), 1);

    // Assets keep their bytes
    assert_eq!(
        epub::read_entry(&dest, "images/inside.png").unwrap(),
        vec![0x89, b'P', b'N', b'G']
    );
}

#[tokio::test]
async fn test_ebook_pages_are_parseable_and_titled_in_nav() {
    let manifest = manifest(
        Category::Ebook,
        json!([
            {"group": "title-content", "entries": [
                {"url": "http://localhost/mock/Text/cover.xhtml"},
                {"url": "Text/ch1.xhtml"},
                {"url": "Text/ch2.xhtml"},
            ]},
            {"group": "title-assets", "entries": [
                {"url": "Images/cover.jpg"},
            ]},
            {"group": "unrelated", "entries": [{"url": "extra.bin"}]},
        ]),
        json!({
            "title": {"main": "The Long Road", "subtitle": "A Novel"},
            "creator": [{"name": "Ann Writer", "role": "author"}],
            "language": "en",
            "cover": {"href": "Images/cover.jpg"},
        }),
    );
    let fragments = vec![
        fragment(
            "Text/cover.xhtml",
            "application/xhtml+xml",
            page("Cover", "The Long Road"),
        ),
        fragment("Text/ch1.xhtml", "application/xhtml+xml", untitled_page("Chapter One")),
        fragment("Text/ch2.xhtml", "application/xhtml+xml", untitled_page("Chapter Two")),
        fragment("Images/cover.jpg", "image/jpeg", vec![0xFF, 0xD8]),
    ];
    let meta = metadata("ebook", &manifest);
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("book.epub");

    let report = build(&manifest, &fragments, &meta, &dest).await;
    assert_eq!(report.cover, "Images/cover.jpg");
    assert!(!report.entries.iter().any(|e| e == "extra.bin"));

    let summary = epub::inspect(&dest).unwrap();
    assert_eq!(summary.spine.len(), 3);
    assert_eq!(summary.spine[0], "Text/cover.xhtml");

    for href in &summary.spine {
        let bytes = epub::read_entry(&dest, href).unwrap();
        assert!(ebook::check_document(href, &bytes).unwrap().is_some());
    }

    let nav = String::from_utf8(epub::read_entry(&dest, &report.navigation).unwrap()).unwrap();
    assert!(nav.contains("Chapter One"));
    assert!(nav.contains("Chapter Two"));
}

#[tokio::test]
async fn test_openbook_toc_drives_navigation() {
    let manifest = manifest(
        Category::Ebook,
        json!([
            {"group": "title-content", "entries": [{"url": "a.xhtml"}, {"url": "b.xhtml"}]},
            {"group": "title-assets", "entries": [{"url": "c.png"}]},
        ]),
        json!({
            "title": {"main": "Toc Book"},
            "nav": {"toc": [
                {"title": "Part I", "path": "a.xhtml", "contents": [
                    {"title": "Section 1.1", "path": "b.xhtml"},
                ]},
            ]},
        }),
    );
    let fragments = vec![
        fragment("a.xhtml", "application/xhtml+xml", page("A", "A")),
        fragment("b.xhtml", "application/xhtml+xml", page("B", "B")),
        fragment("c.png", "image/png", vec![1, 2, 3]),
    ];
    let meta = metadata("ebook", &manifest);
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("toc.epub");

    let report = build(&manifest, &fragments, &meta, &dest).await;
    // No marked cover, so the first image asset is designated
    assert_eq!(report.cover, "c.png");

    let nav = String::from_utf8(epub::read_entry(&dest, &report.navigation).unwrap()).unwrap();
    assert!(nav.contains("Part I"));
    assert!(nav.contains("Section 1.1"));
}

#[tokio::test]
async fn test_assembly_is_deterministic() {
    let (manifest, fragments) = magazine();
    let meta = metadata("magazine", &manifest);
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.epub");
    let second = dir.path().join("second.epub");

    let report_a = build(&manifest, &fragments, &meta, &first).await;
    let report_b = build(&manifest, &fragments, &meta, &second).await;

    assert_eq!(report_a, report_b);
    assert_eq!(epub::inspect(&first).unwrap(), epub::inspect(&second).unwrap());
    assert_eq!(std::fs::read(&first).unwrap(), std::fs::read(&second).unwrap());
}

#[tokio::test]
async fn test_missing_fragment_is_incomplete() {
    let (manifest, mut fragments) = magazine();
    fragments.retain(|f| f.path != "pages/p2.xhtml");
    let meta = metadata("magazine", &manifest);
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("broken.epub");

    let result = ebook::write_epub(
        &manifest,
        &fragments,
        None,
        &meta,
        CoverPolicy::FirstImage,
        Box::new(EpubWriter::new(meta.clone())),
        &dest,
    )
    .await;

    assert!(matches!(result, Err(Error::IncompleteAssembly(_))));
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_malformed_page_is_rejected() {
    let (manifest, mut fragments) = magazine();
    fragments[1] = fragment(
        "pages/p2.xhtml",
        "application/xhtml+xml",
        b"<html><body><p>unclosed</body></html>".to_vec(),
    );
    let meta = metadata("magazine", &manifest);
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("broken.epub");

    let result = ebook::write_epub(
        &manifest,
        &fragments,
        None,
        &meta,
        CoverPolicy::FirstImage,
        Box::new(EpubWriter::new(meta.clone())),
        &dest,
    )
    .await;

    assert!(result.is_err());
    assert!(!dest.exists());
}
