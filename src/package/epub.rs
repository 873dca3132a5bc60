//! EPUB container writing.

use std::{
    collections::HashSet,
    io::{Read, Seek, Write},
    path::Path,
};

use quick_xml::{Reader, events::Event};
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter, write::SimpleFileOptions};

use crate::{
    Error, Res,
    package::{
        PublicationMetadata,
        opf::{self, PackageItem},
    },
    utils,
};

const PACKAGE_DIR: &str = "OEBPS";
const PACKAGE_PATH: &str = "OEBPS/content.opf";

const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#;

/// One file of the publication.
#[derive(Debug, Clone)]
pub struct ContainerEntry {
    pub path: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

/// Writes a publication container.
///
/// Implementations enforce the container invariants in [`finalize`]:
/// unique entry paths, a reading order of document entries only, exactly one
/// cover and at most one navigation document.
///
/// [`finalize`]: ContainerWriter::finalize
pub trait ContainerWriter: Send {
    fn add_entry(&mut self, entry: ContainerEntry) -> Res<()>;

    fn set_reading_order(&mut self, paths: Vec<String>) -> Res<()>;

    fn designate_cover(&mut self, path: &str) -> Res<()>;

    fn designate_navigation(&mut self, path: &str) -> Res<()>;

    /// Writes the container to `dest`. Nothing exists at `dest` unless the
    /// whole container was written.
    fn finalize(self: Box<Self>, dest: &Path) -> Res<()>;
}

/// Zip-based EPUB 3 writer.
///
/// Output is deterministic: entries keep insertion order and carry a fixed
/// timestamp.
pub struct EpubWriter {
    metadata: PublicationMetadata,
    entries: Vec<ContainerEntry>,
    paths: HashSet<String>,
    reading_order: Vec<String>,
    cover: Option<String>,
    navigation: Option<String>,
}

impl EpubWriter {
    pub fn new(metadata: PublicationMetadata) -> Self {
        Self {
            metadata,
            entries: Vec::new(),
            paths: HashSet::new(),
            reading_order: Vec::new(),
            cover: None,
            navigation: None,
        }
    }

    fn entry(&self, path: &str) -> Option<&ContainerEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    fn validate(&self) -> Res<()> {
        let cover = self
            .cover
            .as_deref()
            .ok_or_else(|| Error::Container("no cover designated".into()))?;
        match self.entry(cover) {
            Some(e) if utils::is_image_type(&e.media_type) => {}
            _ => return Err(Error::Container(format!("cover {cover} is not an image entry"))),
        }

        if self.reading_order.is_empty() {
            return Err(Error::Container("reading order is empty".into()));
        }
        let mut seen = HashSet::new();
        for path in &self.reading_order {
            match self.entry(path) {
                Some(e) if utils::is_document_type(&e.media_type) => {}
                Some(e) => {
                    return Err(Error::Container(format!(
                        "{path} ({}) cannot be part of the reading order",
                        e.media_type
                    )));
                }
                None => return Err(Error::Container(format!("{path} is not in the container"))),
            }
            if !seen.insert(path) {
                return Err(Error::Container(format!("{path} appears twice in the reading order")));
            }
        }

        if let Some(nav) = &self.navigation {
            match self.entry(nav) {
                Some(e) if e.media_type == "application/xhtml+xml" => {}
                _ => return Err(Error::Container(format!("navigation {nav} is not an XHTML entry"))),
            }
        }
        Ok(())
    }

    fn package_items(&self) -> (Vec<PackageItem>, Vec<String>) {
        let items: Vec<PackageItem> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let mut properties = Vec::new();
                if self.cover.as_deref() == Some(e.path.as_str()) {
                    properties.push("cover-image");
                }
                if self.navigation.as_deref() == Some(e.path.as_str()) {
                    properties.push("nav");
                }
                PackageItem {
                    id: format!("item-{:04}", i + 1),
                    href: e.path.clone(),
                    media_type: e.media_type.clone(),
                    properties,
                }
            })
            .collect();

        let spine = self
            .reading_order
            .iter()
            .filter_map(|path| items.iter().find(|i| &i.href == path).map(|i| i.id.clone()))
            .collect();
        (items, spine)
    }

    fn write_zip<W: Write + Seek>(&self, out: W) -> Res<W> {
        let (items, spine) = self.package_items();
        let package = opf::render_package(&self.metadata, &items, &spine);

        let stored = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .last_modified_time(DateTime::default());
        let deflated = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default());
        let zip_err = |e: zip::result::ZipError| Error::Container(e.to_string());
        let io_err = |e: std::io::Error| Error::Container(e.to_string());

        let mut zip = ZipWriter::new(out);
        zip.start_file("mimetype", stored).map_err(zip_err)?;
        zip.write_all(b"application/epub+zip").map_err(io_err)?;

        zip.start_file("META-INF/container.xml", deflated).map_err(zip_err)?;
        zip.write_all(CONTAINER_XML.as_bytes()).map_err(io_err)?;

        zip.start_file(PACKAGE_PATH, deflated).map_err(zip_err)?;
        zip.write_all(package.as_bytes()).map_err(io_err)?;

        for entry in &self.entries {
            let options = if utils::is_image_type(&entry.media_type) {
                stored
            } else {
                deflated
            };
            zip.start_file(format!("{PACKAGE_DIR}/{}", entry.path), options)
                .map_err(zip_err)?;
            zip.write_all(&entry.bytes).map_err(io_err)?;
        }
        zip.finish().map_err(zip_err)
    }
}

impl ContainerWriter for EpubWriter {
    fn add_entry(&mut self, entry: ContainerEntry) -> Res<()> {
        if entry.path.is_empty() || entry.path.starts_with('/') || entry.path.contains("..") {
            return Err(Error::Container(format!("invalid entry path {:?}", entry.path)));
        }
        if !self.paths.insert(entry.path.clone()) {
            return Err(Error::Container(format!("duplicate entry {}", entry.path)));
        }
        self.entries.push(entry);
        Ok(())
    }

    fn set_reading_order(&mut self, paths: Vec<String>) -> Res<()> {
        self.reading_order = paths;
        Ok(())
    }

    fn designate_cover(&mut self, path: &str) -> Res<()> {
        if self.cover.is_some() {
            return Err(Error::Container("cover already designated".into()));
        }
        self.cover = Some(path.to_string());
        Ok(())
    }

    fn designate_navigation(&mut self, path: &str) -> Res<()> {
        if self.navigation.is_some() {
            return Err(Error::Container("navigation already designated".into()));
        }
        self.navigation = Some(path.to_string());
        Ok(())
    }

    fn finalize(self: Box<Self>, dest: &Path) -> Res<()> {
        self.validate()?;

        let parent = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        let tmp = tempfile::Builder::new()
            .prefix(".loancli-")
            .suffix(".epub.tmp")
            .tempfile_in(parent)
            .map_err(|e| Error::io(parent, e))?;

        let tmp = self.write_zip(tmp)?;
        tmp.persist(dest).map_err(|e| Error::io(dest, e.error))?;
        tracing::debug!(path = %dest.display(), entries = self.entries.len(), "container written");
        Ok(())
    }
}

/// An item of an existing container's package document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectedItem {
    pub href: String,
    pub media_type: String,
    pub properties: Vec<String>,
}

/// The structure of an EPUB as declared by its package document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub items: Vec<InspectedItem>,
    /// Hrefs in reading order.
    pub spine: Vec<String>,
}

impl ContainerSummary {
    pub fn documents(&self) -> Vec<&InspectedItem> {
        self.items
            .iter()
            .filter(|i| utils::is_document_type(&i.media_type))
            .collect()
    }

    pub fn with_property(&self, property: &str) -> Vec<&InspectedItem> {
        self.items
            .iter()
            .filter(|i| i.properties.iter().any(|p| p == property))
            .collect()
    }
}

/// Reads the package structure of an EPUB written by [`EpubWriter`].
pub fn inspect(path: &Path) -> Res<ContainerSummary> {
    let file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| Error::Container(e.to_string()))?;
    let mut package = String::new();
    archive
        .by_name(PACKAGE_PATH)
        .map_err(|e| Error::Container(e.to_string()))?
        .read_to_string(&mut package)
        .map_err(|e| Error::io(path, e))?;
    parse_package(&package)
}

/// Reads one file of an EPUB by its publication path.
pub fn read_entry(path: &Path, entry: &str) -> Res<Vec<u8>> {
    let file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| Error::Container(e.to_string()))?;
    let mut bytes = Vec::new();
    archive
        .by_name(&format!("{PACKAGE_DIR}/{entry}"))
        .map_err(|e| Error::Container(e.to_string()))?
        .read_to_end(&mut bytes)
        .map_err(|e| Error::io(path, e))?;
    Ok(bytes)
}

fn parse_package(package: &str) -> Res<ContainerSummary> {
    let mut reader = Reader::from_str(package);
    let mut items = Vec::new();
    let mut ids = Vec::new();
    let mut idrefs = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"item" => {
                    let mut item = InspectedItem {
                        href: String::new(),
                        media_type: String::new(),
                        properties: Vec::new(),
                    };
                    let mut id = String::new();
                    for attr in e.attributes().flatten() {
                        let value = attr
                            .unescape_value()
                            .map_err(|err| Error::xml("package document", err))?
                            .to_string();
                        match attr.key.as_ref() {
                            b"id" => id = value,
                            b"href" => item.href = value,
                            b"media-type" => item.media_type = value,
                            b"properties" => {
                                item.properties =
                                    value.split_whitespace().map(str::to_string).collect()
                            }
                            _ => {}
                        }
                    }
                    ids.push(id);
                    items.push(item);
                }
                b"itemref" => {
                    if let Some(attr) = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.as_ref() == b"idref")
                    {
                        let value = attr
                            .unescape_value()
                            .map_err(|err| Error::xml("package document", err))?;
                        idrefs.push(value.to_string());
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::xml("package document", e)),
        }
    }

    let spine = idrefs
        .iter()
        .filter_map(|idref| {
            ids.iter()
                .position(|id| id == idref)
                .map(|i| items[i].href.clone())
        })
        .collect();
    Ok(ContainerSummary { items, spine })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, media_type: &str) -> ContainerEntry {
        ContainerEntry {
            path: path.into(),
            media_type: media_type.into(),
            bytes: b"<html xmlns=\"http://www.w3.org/1999/xhtml\"/>".to_vec(),
        }
    }

    #[test]
    fn rejects_duplicate_paths() {
        let mut writer = EpubWriter::new(PublicationMetadata::default());
        writer.add_entry(entry("a.xhtml", "application/xhtml+xml")).unwrap();
        assert!(writer.add_entry(entry("a.xhtml", "application/xhtml+xml")).is_err());
    }

    #[test]
    fn rejects_second_cover() {
        let mut writer = EpubWriter::new(PublicationMetadata::default());
        writer.designate_cover("a.jpg").unwrap();
        assert!(writer.designate_cover("b.jpg").is_err());
    }

    #[test]
    fn spine_must_hold_documents_only() {
        let mut writer = EpubWriter::new(PublicationMetadata::default());
        writer.add_entry(entry("a.xhtml", "application/xhtml+xml")).unwrap();
        writer.add_entry(entry("c.jpg", "image/jpeg")).unwrap();
        writer.designate_cover("c.jpg").unwrap();
        writer
            .set_reading_order(vec!["a.xhtml".into(), "c.jpg".into()])
            .unwrap();
        assert!(matches!(writer.validate(), Err(Error::Container(_))));
    }

    #[test]
    fn package_round_trips_through_inspection() {
        let mut writer = EpubWriter::new(PublicationMetadata::default());
        writer.add_entry(entry("p/1.xhtml", "application/xhtml+xml")).unwrap();
        writer.add_entry(entry("c.jpg", "image/jpeg")).unwrap();
        writer.add_entry(entry("nav.xhtml", "application/xhtml+xml")).unwrap();
        writer.designate_cover("c.jpg").unwrap();
        writer.designate_navigation("nav.xhtml").unwrap();
        writer.set_reading_order(vec!["p/1.xhtml".into()]).unwrap();

        let (items, spine) = writer.package_items();
        let package = opf::render_package(&writer.metadata, &items, &spine);
        let summary = parse_package(&package).unwrap();
        assert_eq!(summary.spine, vec!["p/1.xhtml".to_string()]);
        assert_eq!(summary.with_property("cover-image")[0].href, "c.jpg");
        assert_eq!(summary.with_property("nav")[0].href, "nav.xhtml");
    }
}
