//! Per-loan download orchestration.
//!
//! For every loan the steps run strictly in order: negotiate a [`Plan`],
//! fulfill it, download the fragments and assemble the artifact. Loans of a
//! batch are isolated from one another: a failure that only concerns one loan
//! is recorded in the [`BatchReport`] and the batch moves on.

use std::path::{Path, PathBuf};

use crate::{
    Error, Res,
    fetch::{Descriptor, Fragment},
    libby::{
        Fulfillment, FulfillmentEngine, LicenseDocument, OpenContentManifest,
        formats::{self, Category, DeliveryMode, LibbyFormat, Plan, Protocol},
        loans::Loan,
    },
    package::{
        CoverPolicy, PublicationMetadata,
        audio::{self, AudioAssembler, AudioOptions, AudioSegment, AudioTags},
        ebook,
        epub::EpubWriter,
        odm::{self, OdmDocument, OdmMetadata},
        opf,
    },
    types::Media,
    utils,
};

/// How loans are downloaded and where the artifacts go.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub download_dir: PathBuf,
    /// Template of the per-title folder. `None` writes into `download_dir`.
    pub folder_format: Option<String>,
    pub file_format: String,
    /// Explicit format wish. Takes precedence over `mode`.
    pub format: Option<LibbyFormat>,
    /// Delivery mode. `None` picks the loan's default format.
    pub mode: Option<DeliveryMode>,
    pub prefer_open: bool,
    /// Keep the ODM license file of an MP3 audiobook instead of downloading
    /// its parts.
    pub keep_odm: bool,
    pub audio: AudioOptions,
    /// Write an `.opf` metadata sidecar next to the artifact.
    pub opf: bool,
    /// Save the loan's cover as `cover.jpg` next to the artifact.
    pub keep_cover: bool,
    pub cover_policy: CoverPolicy,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            folder_format: Some(utils::DEFAULT_BOOK_FOLDER_FORMAT.to_string()),
            file_format: utils::DEFAULT_BOOK_FILE_FORMAT.to_string(),
            format: None,
            mode: None,
            prefer_open: false,
            keep_odm: false,
            audio: AudioOptions {
                merge: false,
                chapters: true,
            },
            opf: false,
            keep_cover: false,
            cover_policy: CoverPolicy::default(),
        }
    }
}

impl DownloadOptions {
    fn target(&self, loan: &Loan) -> (PathBuf, String) {
        let fields = loan.template_fields();
        let dir = match &self.folder_format {
            Some(template) => self
                .download_dir
                .join(utils::format_template(template, &fields)),
            None => self.download_dir.clone(),
        };
        let stem = utils::format_template(&self.file_format, &fields);
        let stem = if stem.is_empty() {
            loan.id().to_string()
        } else {
            stem
        };
        (dir, stem)
    }
}

/// The files written for one loan.
#[derive(Debug, Clone)]
pub struct LoanOutcome {
    pub loan_id: String,
    pub title: String,
    pub format: LibbyFormat,
    pub artifacts: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub completed: Vec<LoanOutcome>,
    /// Loans without a matching format.
    pub skipped: Vec<(String, Error)>,
    pub failed: Vec<(String, Error)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Chooses the plan for `loan` from the download options.
pub fn plan_for(loan: &Loan, options: &DownloadOptions) -> Res<Plan> {
    let unavailable = |wanted: String| Error::FormatUnavailable {
        loan_id: loan.id().to_string(),
        wanted,
    };
    let category = loan
        .category()
        .ok_or_else(|| unavailable(format!("unsupported type {}", loan.type_id())))?;

    if let Some(wanted) = options.format {
        if wanted.category() != category {
            return Err(unavailable(format!("{wanted} for a {category}")));
        }
        let mode = match wanted.protocol() {
            Protocol::License => DeliveryMode::License,
            Protocol::Open => DeliveryMode::Direct,
        };
        let plan = formats::negotiate(loan, category, mode)?;
        return match formats::get_loan_format(loan, wanted) {
            Some(format)
                if format.protocol() == plan.protocol
                    && loan.locked_format().is_none_or(|l| l == format.as_str()) =>
            {
                Ok(Plan { format, ..plan })
            }
            _ => Err(unavailable(wanted.to_string())),
        };
    }

    match options.mode {
        Some(mode) => formats::negotiate(loan, category, mode),
        None => formats::default_format(loan, options.prefer_open)
            .filter(|f| f.category() == category)
            .map(|format| Plan {
                format,
                protocol: format.protocol(),
                category,
            })
            .ok_or_else(|| unavailable("a downloadable format".to_string())),
    }
}

/// Downloads one loan.
pub async fn run_loan(
    engine: &mut FulfillmentEngine<'_>,
    assembler: &AudioAssembler,
    loan: &Loan,
    options: &DownloadOptions,
) -> Res<LoanOutcome> {
    let plan = plan_for(loan, options)?;
    tracing::debug!(id = loan.id(), format = %plan.format, "plan negotiated");
    let fulfillment = engine.fulfill(loan, &plan).await?;

    let (dir, stem) = options.target(loan);
    let media = fetch_media(engine, loan).await;

    let mut artifacts = Vec::new();
    let metadata = match fulfillment.as_ref() {
        Fulfillment::License(document)
            if plan.format == LibbyFormat::AudiobookMp3 && !options.keep_odm =>
        {
            let (metadata, files) =
                download_odm(engine, assembler, loan, document, media.as_ref(), options, &dir, &stem)
                    .await?;
            artifacts.extend(files);
            metadata
        }
        Fulfillment::License(document) => {
            let dest = dir.join(format!("{stem}.{}", document.extension()));
            utils::write_atomic(&dest, &document.bytes).await?;
            artifacts.push(dest);
            PublicationMetadata::from_sources(loan, media.as_ref(), None)
        }
        Fulfillment::Open(manifest) if manifest.category == Category::Audiobook => {
            let metadata =
                PublicationMetadata::from_sources(loan, media.as_ref(), Some(&manifest.openbook));
            let files =
                download_open_audio(engine, assembler, loan, manifest, &metadata, media.as_ref(), options, &dir, &stem)
                    .await?;
            artifacts.extend(files);
            metadata
        }
        Fulfillment::Open(manifest) => {
            let metadata =
                PublicationMetadata::from_sources(loan, media.as_ref(), Some(&manifest.openbook));
            let dest = dir.join(format!("{stem}.epub"));
            download_open_ebook(engine, loan, manifest, &metadata, media.as_ref(), options, &dest)
                .await?;
            artifacts.push(dest);
            metadata
        }
    };

    if options.opf {
        let dest = dir.join(format!("{stem}.opf"));
        utils::write_atomic(&dest, opf::render_sidecar(&metadata).as_bytes()).await?;
        artifacts.push(dest);
    }
    if options.keep_cover {
        if let Some(dest) = save_cover(engine, loan, media.as_ref(), &dir).await {
            artifacts.push(dest);
        }
    }

    Ok(LoanOutcome {
        loan_id: loan.id().to_string(),
        title: loan.title().to_string(),
        format: plan.format,
        artifacts,
    })
}

/// Downloads every loan in order, isolating per-loan failures.
///
/// Errors that concern the whole run (cancellation, a lost session, a local
/// I/O failure) stop the batch and are returned as is.
pub async fn run_batch(
    engine: &mut FulfillmentEngine<'_>,
    assembler: &AudioAssembler,
    loans: &[&Loan],
    options: &DownloadOptions,
) -> Res<BatchReport> {
    let mut report = BatchReport::default();
    for loan in loans {
        if engine.fetcher().cancel_token().is_cancelled() {
            return Err(Error::Cancelled);
        }
        match run_loan(engine, assembler, loan, options).await {
            Ok(outcome) => report.completed.push(outcome),
            Err(e @ Error::FormatUnavailable { .. }) => {
                tracing::warn!(id = loan.id(), error = %e, "skipping loan");
                report.skipped.push((loan.title().to_string(), e));
            }
            Err(e) if e.is_per_loan() && !e.is_unauthorized() => {
                tracing::warn!(id = loan.id(), error = %e, "loan failed");
                report.failed.push((loan.title().to_string(), e));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(report)
}

/// The media record is an optional source; a failure only loses metadata.
async fn fetch_media(engine: &FulfillmentEngine<'_>, loan: &Loan) -> Option<Media> {
    match engine.client().media(loan.id()).await {
        Ok(media) => Some(media),
        Err(e) => {
            tracing::warn!(id = loan.id(), error = %e, "media record unavailable");
            None
        }
    }
}

fn cover_source<'m>(loan: &'m Loan, media: Option<&'m Media>) -> Option<&'m str> {
    media.and_then(Media::cover_url).or_else(|| loan.cover_url())
}

async fn fetch_cover(
    engine: &FulfillmentEngine<'_>,
    url: Option<&str>,
) -> Option<Vec<u8>> {
    let url = url?;
    match engine.fetcher().fetch_bytes(url).await {
        Ok(bytes) if !bytes.is_empty() => Some(bytes),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(url, error = %e, "cover unavailable");
            None
        }
    }
}

async fn save_cover(
    engine: &FulfillmentEngine<'_>,
    loan: &Loan,
    media: Option<&Media>,
    dir: &Path,
) -> Option<PathBuf> {
    let bytes = fetch_cover(engine, cover_source(loan, media)).await?;
    let dest = dir.join("cover.jpg");
    match utils::write_atomic(&dest, &bytes).await {
        Ok(()) => Some(dest),
        Err(e) => {
            tracing::warn!(error = %e, "cannot save cover");
            None
        }
    }
}

async fn download_open_ebook(
    engine: &FulfillmentEngine<'_>,
    loan: &Loan,
    manifest: &OpenContentManifest,
    metadata: &PublicationMetadata,
    media: Option<&Media>,
    options: &DownloadOptions,
    dest: &Path,
) -> Res<()> {
    let fragments = engine.fetcher().fetch_all(manifest.descriptors()).await?;

    let media_cover: Option<Fragment> = match (options.cover_policy, cover_source(loan, media)) {
        (CoverPolicy::MediaCover, Some(url)) => engine
            .fetcher()
            .fetch_all(vec![Descriptor::new("cover.jpg", url, "image/jpeg").optional()])
            .await?
            .into_iter()
            .find(Fragment::is_fetched),
        _ => None,
    };

    let parent = dest.parent().unwrap_or(Path::new("."));
    async_fs::create_dir_all(parent)
        .await
        .map_err(|e| Error::io(parent, e))?;
    let report = ebook::write_epub(
        manifest,
        &fragments,
        media_cover.as_ref(),
        metadata,
        options.cover_policy,
        Box::new(EpubWriter::new(metadata.clone())),
        dest,
    )
    .await?;
    tracing::debug!(
        path = %dest.display(),
        entries = report.entries.len(),
        pages = report.reading_order.len(),
        "container written"
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn download_open_audio(
    engine: &FulfillmentEngine<'_>,
    assembler: &AudioAssembler,
    loan: &Loan,
    manifest: &OpenContentManifest,
    metadata: &PublicationMetadata,
    media: Option<&Media>,
    options: &DownloadOptions,
    dir: &Path,
    stem: &str,
) -> Res<Vec<PathBuf>> {
    let scratch = scratch_dir(dir).await?;
    let descriptors: Vec<Descriptor> = manifest
        .descriptors()
        .into_iter()
        .enumerate()
        .map(|(i, d)| d.spool_to(scratch.path().join(format!("part-{:03}.mp3", i + 1))))
        .collect();
    let fragments = engine.fetcher().fetch_all(descriptors).await?;

    let segments = fragments
        .iter()
        .zip(&manifest.roster)
        .map(|(fragment, entry)| {
            Ok(AudioSegment {
                path: spooled(fragment)?,
                title: None,
                duration: entry.duration,
            })
        })
        .collect::<Res<Vec<_>>>()?;

    let mut tags = AudioTags::from_metadata(metadata);
    tags.cover = cover_for_tags(engine, loan, media, None).await;
    assembler
        .assemble(segments, tags, options.audio, dir, stem)
        .await
}

#[allow(clippy::too_many_arguments)]
async fn download_odm(
    engine: &FulfillmentEngine<'_>,
    assembler: &AudioAssembler,
    loan: &Loan,
    document: &LicenseDocument,
    media: Option<&Media>,
    options: &DownloadOptions,
    dir: &Path,
    stem: &str,
) -> Res<(PublicationMetadata, Vec<PathBuf>)> {
    let odm = OdmDocument::parse(&document.bytes)?;
    odm.ensure_downloadable(loan.id())?;
    let license = odm::acquire_license(engine.client().http(), &odm, loan.id()).await?;

    let scratch = scratch_dir(dir).await?;
    let descriptors = odm.part_descriptors(&license, scratch.path())?;
    let fragments = engine.fetcher().fetch_all(descriptors).await?;
    let segments = fragments
        .iter()
        .zip(&odm.parts)
        .map(|(fragment, part)| {
            Ok(AudioSegment {
                path: spooled(fragment)?,
                title: Some(part.name.clone()).filter(|n| !n.trim().is_empty()),
                duration: part.duration,
            })
        })
        .collect::<Res<Vec<_>>>()?;

    let mut metadata = PublicationMetadata::from_sources(loan, media, None);
    fill_from_odm(&mut metadata, &odm.metadata);

    let mut tags = AudioTags::from_metadata(&metadata);
    tags.cover = cover_for_tags(engine, loan, media, odm.metadata.cover_url.as_deref()).await;
    let files = assembler
        .assemble(segments, tags, options.audio, dir, stem)
        .await?;
    Ok((metadata, files))
}

async fn cover_for_tags(
    engine: &FulfillmentEngine<'_>,
    loan: &Loan,
    media: Option<&Media>,
    fallback: Option<&str>,
) -> Option<audio::CoverImage> {
    let url = cover_source(loan, media).or(fallback)?;
    fetch_cover(engine, Some(url))
        .await
        .map(|bytes| audio::cover_image(bytes, url))
}

/// The loan record knows little about an audiobook; the ODM fills the gaps.
fn fill_from_odm(metadata: &mut PublicationMetadata, odm: &OdmMetadata) {
    if metadata.creators.is_empty() {
        metadata.creators = odm.creators.clone();
    }
    if metadata.subtitle.is_none() {
        metadata.subtitle = odm.subtitle.clone();
    }
    if metadata.publisher.is_none() {
        metadata.publisher = odm.publisher.clone();
    }
    if metadata.description.is_none() {
        metadata.description = odm.description.clone();
    }
    if metadata.series.is_none() {
        metadata.series = odm.series.clone();
    }
}

fn spooled(fragment: &Fragment) -> Res<PathBuf> {
    fragment
        .file()
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::IncompleteAssembly(format!("{} was not downloaded", fragment.path)))
}

/// A scratch directory next to the artifact for spooled audio parts. It is
/// removed when dropped, whether the loan succeeded or not.
async fn scratch_dir(dir: &Path) -> Res<tempfile::TempDir> {
    async_fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::io(dir, e))?;
    tempfile::Builder::new()
        .prefix(".loancli-parts-")
        .tempdir_in(dir)
        .map_err(|e| Error::io(dir, e))
}
