//! Format tags and delivery negotiation.
//!
//! A loan advertises a set of format tags. Only some of them can be fulfilled
//! by this client, and each fulfillable tag belongs to exactly one protocol:
//! the legacy license-file protocol or the direct open-content protocol.

use std::{fmt, str::FromStr};

use crate::{Error, Res, libby::loans::Loan};

/// Delivery format tags as used by the Libby service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LibbyFormat {
    AudiobookMp3,
    AudiobookOverdrive,
    EbookEpubAdobe,
    EbookEpubOpen,
    EbookPdfAdobe,
    EbookPdfOpen,
    EbookOverdrive,
    EbookKindle,
    EbookKobo,
    MagazineOverdrive,
}

impl LibbyFormat {
    pub const ALL: [LibbyFormat; 10] = [
        Self::AudiobookMp3,
        Self::AudiobookOverdrive,
        Self::EbookEpubAdobe,
        Self::EbookEpubOpen,
        Self::EbookPdfAdobe,
        Self::EbookPdfOpen,
        Self::EbookOverdrive,
        Self::EbookKindle,
        Self::EbookKobo,
        Self::MagazineOverdrive,
    ];

    /// Formats the fulfillment engine knows how to deliver.
    pub const SUPPORTED: [LibbyFormat; 8] = [
        Self::AudiobookMp3,
        Self::AudiobookOverdrive,
        Self::EbookEpubAdobe,
        Self::EbookEpubOpen,
        Self::EbookPdfAdobe,
        Self::EbookPdfOpen,
        Self::EbookOverdrive,
        Self::MagazineOverdrive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AudiobookMp3 => "audiobook-mp3",
            Self::AudiobookOverdrive => "audiobook-overdrive",
            Self::EbookEpubAdobe => "ebook-epub-adobe",
            Self::EbookEpubOpen => "ebook-epub-open",
            Self::EbookPdfAdobe => "ebook-pdf-adobe",
            Self::EbookPdfOpen => "ebook-pdf-open",
            Self::EbookOverdrive => "ebook-overdrive",
            Self::EbookKindle => "ebook-kindle",
            Self::EbookKobo => "ebook-kobo",
            Self::MagazineOverdrive => "magazine-overdrive",
        }
    }

    pub fn is_supported(&self) -> bool {
        Self::SUPPORTED.contains(self)
    }

    pub fn category(&self) -> Category {
        match self {
            Self::AudiobookMp3 | Self::AudiobookOverdrive => Category::Audiobook,
            Self::MagazineOverdrive => Category::Magazine,
            _ => Category::Ebook,
        }
    }

    /// The protocol a supported format is fulfilled through.
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::AudiobookOverdrive | Self::EbookOverdrive | Self::MagazineOverdrive => {
                Protocol::Open
            }
            _ => Protocol::License,
        }
    }

    /// Formats that deliver the same kind of artifact when `self` is not
    /// advertised, in order of preference.
    pub fn alternates(&self) -> &'static [LibbyFormat] {
        match self {
            Self::EbookEpubAdobe => &[Self::EbookEpubOpen],
            Self::EbookPdfAdobe => &[Self::EbookPdfOpen],
            _ => &[],
        }
    }

    /// File extension of the license document for this format.
    pub fn license_extension(&self) -> &'static str {
        match self {
            Self::AudiobookMp3 => "odm",
            Self::EbookEpubOpen => "epub",
            Self::EbookPdfOpen => "pdf",
            _ => "acsm",
        }
    }
}

impl fmt::Display for LibbyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LibbyFormat {
    type Err = Error;

    fn from_str(s: &str) -> Res<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown format: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Audiobook,
    Ebook,
    Magazine,
}

impl Category {
    pub fn from_type_id(id: &str) -> Option<Self> {
        match id {
            "audiobook" => Some(Self::Audiobook),
            "ebook" => Some(Self::Ebook),
            "magazine" => Some(Self::Magazine),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audiobook => "audiobook",
            Self::Ebook => "ebook",
            Self::Magazine => "magazine",
        }
    }

    /// Path segment of the open-content endpoint for this category.
    pub fn open_segment(&self) -> &'static str {
        match self {
            Self::Audiobook => "audiobook",
            Self::Ebook => "book",
            Self::Magazine => "magazine",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the user asked for: a license file or a finished book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    License,
    Direct,
}

impl DeliveryMode {
    /// The protocol that serves this mode.
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::License => Protocol::License,
            Self::Direct => Protocol::Open,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    License,
    Open,
}

/// Outcome of negotiation for one loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub format: LibbyFormat,
    pub protocol: Protocol,
    pub category: Category,
}

/// Returns the best advertised match for `wanted`: the exact tag first, then
/// a compatible alternate, else `None`.
pub fn get_loan_format(loan: &Loan, wanted: LibbyFormat) -> Option<LibbyFormat> {
    if has_format(loan, wanted) {
        return Some(wanted);
    }
    wanted
        .alternates()
        .iter()
        .copied()
        .find(|alt| has_format(loan, *alt))
}

pub fn has_format(loan: &Loan, tag: LibbyFormat) -> bool {
    loan.format_ids().any(|id| id == tag.as_str())
}

/// Formats both advertised by the loan and supported by the engine.
pub fn fulfillable_formats(loan: &Loan) -> Vec<LibbyFormat> {
    LibbyFormat::SUPPORTED
        .into_iter()
        .filter(|f| has_format(loan, *f))
        .collect()
}

/// Picks a downloadable format when the user did not ask for a specific one.
///
/// A format the service has locked the loan into always wins; if that format
/// cannot be downloaded there is nothing to pick.
pub fn default_format(loan: &Loan, prefer_open: bool) -> Option<LibbyFormat> {
    if let Some(locked) = loan.locked_format() {
        return locked.parse::<LibbyFormat>().ok().filter(|f| f.is_supported());
    }

    let preference: &[LibbyFormat] = match loan.category()? {
        Category::Audiobook if prefer_open => {
            &[LibbyFormat::AudiobookOverdrive, LibbyFormat::AudiobookMp3]
        }
        Category::Audiobook => &[LibbyFormat::AudiobookMp3, LibbyFormat::AudiobookOverdrive],
        Category::Ebook if prefer_open => &[
            LibbyFormat::EbookOverdrive,
            LibbyFormat::EbookEpubOpen,
            LibbyFormat::EbookEpubAdobe,
            LibbyFormat::EbookPdfOpen,
            LibbyFormat::EbookPdfAdobe,
        ],
        Category::Ebook => &[
            LibbyFormat::EbookEpubOpen,
            LibbyFormat::EbookEpubAdobe,
            LibbyFormat::EbookPdfOpen,
            LibbyFormat::EbookPdfAdobe,
            LibbyFormat::EbookOverdrive,
        ],
        Category::Magazine => &[LibbyFormat::MagazineOverdrive],
    };

    preference.iter().copied().find(|f| has_format(loan, *f))
}

/// Selects the concrete format and protocol for a loan.
///
/// Direct and license delivery are never substituted for one another: asking
/// for direct delivery of a loan that only offers a license file fails with
/// [`Error::FormatUnavailable`].
pub fn negotiate(loan: &Loan, category: Category, mode: DeliveryMode) -> Res<Plan> {
    let unavailable = |wanted: &str| Error::FormatUnavailable {
        loan_id: loan.id().to_string(),
        wanted: wanted.to_string(),
    };

    if loan.category() != Some(category) {
        return Err(unavailable(&format!("{category} ({})", loan.type_id())));
    }

    let wanted = match mode {
        DeliveryMode::License => format!("{category} license file"),
        DeliveryMode::Direct => format!("{category} direct download"),
    };

    // A locked format is the only one the service will fulfill
    if let Some(locked) = loan.locked_format() {
        let format = locked
            .parse::<LibbyFormat>()
            .ok()
            .filter(|f| f.is_supported() && f.category() == category)
            .filter(|f| f.protocol() == mode.protocol())
            .ok_or_else(|| unavailable(&format!("{wanted} (loan is locked to {locked})")))?;
        return Ok(Plan {
            format,
            protocol: format.protocol(),
            category,
        });
    }

    let format = match (category, mode) {
        (Category::Audiobook, DeliveryMode::License) => {
            get_loan_format(loan, LibbyFormat::AudiobookMp3)
        }
        (Category::Audiobook, DeliveryMode::Direct) => {
            get_loan_format(loan, LibbyFormat::AudiobookOverdrive)
        }
        (Category::Ebook, DeliveryMode::License) => {
            get_loan_format(loan, LibbyFormat::EbookEpubAdobe)
                .or_else(|| get_loan_format(loan, LibbyFormat::EbookPdfAdobe))
        }
        (Category::Ebook, DeliveryMode::Direct) => {
            get_loan_format(loan, LibbyFormat::EbookOverdrive)
        }
        (Category::Magazine, DeliveryMode::Direct) => {
            get_loan_format(loan, LibbyFormat::MagazineOverdrive)
        }
        (Category::Magazine, DeliveryMode::License) => None,
    };
    let format = format.ok_or_else(|| unavailable(&wanted))?;

    Ok(Plan {
        format,
        protocol: format.protocol(),
        category,
    })
}
