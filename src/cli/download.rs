use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use crate::{
    Error,
    config::Config,
    error,
    fetch::AssetFetcher,
    libby::{DeliveryMode, FulfillmentEngine, LibbyFormat},
    package::{CoverPolicy, audio::{AudioAssembler, AudioOptions}},
    pipeline::{self, DownloadOptions},
    success, warning,
};

use super::{Selection, connect, fetch_loans, resolve_selection};

/// Download flags as given on the command line.
#[derive(Debug, Clone)]
pub struct DownloadArgs {
    pub selection: Selection,
    pub download_dir: PathBuf,
    pub folder_format: String,
    pub file_format: String,
    pub no_book_folder: bool,
    pub format: Option<LibbyFormat>,
    pub mode: Option<DeliveryMode>,
    pub prefer_open: bool,
    pub keep_odm: bool,
    pub merge: bool,
    pub no_chapters: bool,
    pub opf: bool,
    pub keep_cover: bool,
    pub media_cover: bool,
    pub hide_progress: bool,
}

impl From<&DownloadArgs> for DownloadOptions {
    fn from(args: &DownloadArgs) -> Self {
        Self {
            download_dir: args.download_dir.clone(),
            folder_format: (!args.no_book_folder).then(|| args.folder_format.clone()),
            file_format: args.file_format.clone(),
            format: args.format,
            mode: args.mode,
            prefer_open: args.prefer_open,
            keep_odm: args.keep_odm,
            audio: AudioOptions {
                merge: args.merge,
                chapters: !args.no_chapters,
            },
            opf: args.opf,
            keep_cover: args.keep_cover,
            cover_policy: if args.media_cover {
                CoverPolicy::MediaCover
            } else {
                CoverPolicy::FirstImage
            },
        }
    }
}

/// Downloads the selected loans. Ctrl-C cancels through `cancel`.
pub async fn download(config: Config, args: DownloadArgs, cancel: CancellationToken) {
    let client = connect(config).await;
    let all = fetch_loans(&client, &args.selection.categories, args.hide_progress).await;
    if all.is_empty() {
        warning!("No loans found.");
        return;
    }
    let chosen = match resolve_selection(&all, &args.selection) {
        Ok(chosen) => chosen,
        Err(e) => error!("{}", e),
    };

    let progress = if args.hide_progress {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(0);
        if let Ok(style) =
            ProgressStyle::with_template("{spinner:.blue} [{bar:30.blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏").progress_chars("=> "));
        }
        pb
    };

    let fetcher = AssetFetcher::new(client.http().clone(), client.config(), cancel)
        .with_progress(progress.clone());
    let mut engine = FulfillmentEngine::new(&client, fetcher);
    let assembler = AudioAssembler::default();
    let options = DownloadOptions::from(&args);

    progress.set_message(format!("{} loan(s)", chosen.len()));
    let result = pipeline::run_batch(&mut engine, &assembler, &chosen, &options).await;
    progress.finish_and_clear();

    let report = match result {
        Ok(report) => report,
        Err(Error::Cancelled) => error!("Download cancelled."),
        Err(e) => error!("Download aborted. Err: {}", e),
    };

    for outcome in &report.completed {
        for artifact in &outcome.artifacts {
            success!("Saved {}", artifact.display());
        }
    }
    for (title, e) in &report.skipped {
        warning!("Skipped \"{}\": {}", title, e);
    }
    for (title, e) in &report.failed {
        warning!("Failed \"{}\": {}", title, e);
    }
    if !report.is_success() {
        error!(
            "{} of {} loan(s) failed.",
            report.failed.len(),
            chosen.len()
        );
    }
}
