//! Assembly of downloaded fragments into deliverable artifacts.
//!
//! - [`ebook`] rebuilds an EPUB from an open content manifest through a
//!   [`epub::ContainerWriter`].
//! - [`audio`] merges or tags MP3 parts through the [`audio::AudioMerger`] and
//!   [`audio::AudioTagger`] capabilities.
//! - [`odm`] turns an ODM license document into downloadable audio parts.
//! - [`opf`] renders the publication metadata shared by the EPUB package
//!   document and the standalone `.opf` sidecar.

pub mod audio;
pub mod ebook;
pub mod epub;
pub mod odm;
pub mod opf;

use crate::{
    libby::loans::Loan,
    types::{Media, Openbook},
    utils,
};

/// Which image becomes the cover when the openbook marks none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CoverPolicy {
    /// The first image asset in roster order.
    #[default]
    FirstImage,
    /// The media service's cover, falling back to the first image asset.
    MediaCover,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contributor {
    pub name: String,
    /// Role as named by the service, e.g. `Author` or `Narrator`.
    pub role: Option<String>,
    pub file_as: Option<String>,
}

impl Contributor {
    pub fn is_author(&self) -> bool {
        self.role
            .as_deref()
            .is_none_or(|r| r.eq_ignore_ascii_case("author"))
    }
}

/// Descriptive metadata of one publication.
///
/// Every representation of a title (the EPUB package document, the `.opf`
/// sidecar, the ID3 tags) is rendered from one value of this type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublicationMetadata {
    /// `urn:isbn:…` when the title has an ISBN, a stable `urn:uuid:…`
    /// otherwise.
    pub identifier: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub creators: Vec<Contributor>,
    pub publisher: Option<String>,
    pub description: Option<String>,
    pub language: String,
    pub series: Option<String>,
    pub series_index: Option<String>,
    pub subjects: Vec<String>,
    pub published: Option<String>,
}

impl PublicationMetadata {
    /// Merges what is known about a loan. The media record wins over the
    /// openbook, which wins over the loan record.
    pub fn from_sources(loan: &Loan, media: Option<&Media>, openbook: Option<&Openbook>) -> Self {
        let openbook_title = openbook
            .and_then(|o| o.title.as_ref())
            .map(|t| t.main.clone())
            .filter(|t| !t.is_empty());
        let title = media
            .map(|m| m.title.clone())
            .filter(|t| !t.is_empty())
            .or(openbook_title)
            .unwrap_or_else(|| loan.title().to_string());

        let subtitle = media
            .and_then(|m| m.subtitle.clone())
            .or_else(|| openbook.and_then(|o| o.title.as_ref()?.subtitle.clone()));

        let mut creators: Vec<Contributor> = media
            .map(|m| {
                m.creators
                    .iter()
                    .map(|c| Contributor {
                        name: c.name.clone(),
                        role: c.role.clone(),
                        file_as: c.sort_name.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        if creators.is_empty() {
            creators = openbook
                .map(|o| {
                    o.creator
                        .iter()
                        .map(|c| Contributor {
                            name: c.name.clone(),
                            role: c.role.clone().map(|r| capitalize(&r)),
                            file_as: None,
                        })
                        .collect()
                })
                .unwrap_or_default();
        }
        if creators.is_empty() && !loan.author().is_empty() {
            creators.push(Contributor {
                name: loan.author().to_string(),
                role: Some("Author".to_string()),
                file_as: None,
            });
        }

        let description = media
            .and_then(|m| m.description.clone())
            .or_else(|| {
                let d = openbook?.description.as_ref()?;
                d.full.clone().or_else(|| d.short.clone())
            })
            .filter(|d| !d.trim().is_empty());

        let language = media
            .and_then(|m| m.language())
            .map(str::to_string)
            .or_else(|| openbook.and_then(|o| o.language.clone()))
            .unwrap_or_else(|| "en".to_string());

        let identifier = match media.and_then(|m| m.isbn()) {
            Some(isbn) => format!("urn:isbn:{isbn}"),
            None => utils::stable_identifier(&format!("loancli:{}:{}", loan.id(), title)),
        };

        Self {
            identifier,
            title,
            subtitle,
            creators,
            publisher: media
                .and_then(|m| m.publisher.as_ref()?.name.clone())
                .or_else(|| loan.record.publisher.as_ref()?.name.clone()),
            description,
            language,
            series: media
                .and_then(|m| m.series_name())
                .or(loan.series())
                .map(str::to_string),
            series_index: media
                .and_then(|m| m.reading_order())
                .or(loan.reading_order())
                .map(str::to_string),
            subjects: media
                .map(|m| m.subjects.iter().filter_map(|s| s.name.clone()).collect())
                .unwrap_or_default(),
            published: media.and_then(|m| m.publish_date.clone()),
        }
    }

    pub fn authors(&self) -> Vec<&str> {
        self.creators
            .iter()
            .filter(|c| c.is_author())
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn narrators(&self) -> Vec<&str> {
        self.creators
            .iter()
            .filter(|c| {
                c.role
                    .as_deref()
                    .is_some_and(|r| r.eq_ignore_ascii_case("narrator"))
            })
            .map(|c| c.name.as_str())
            .collect()
    }
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
