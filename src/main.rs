use std::path::PathBuf;

use clap::{
    Args, CommandFactory, Parser, Subcommand,
    builder::{
        Styles,
        styling::{AnsiColor, Effects},
    },
};
use clap_complete::{Shell, generate};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use loancli::{
    cli::{self, DownloadArgs, Selection},
    config::{self, Config},
    error,
    libby::{Category, DeliveryMode, LibbyFormat},
    utils, warning,
};

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::White.on_default() | Effects::BOLD)
        .usage(AnsiColor::White.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightBlue.on_default())
        .placeholder(AnsiColor::BrightGreen.on_default())
}

#[derive(Parser, Debug, Clone)]
#[clap(
  version = env!("CARGO_PKG_VERSION"),
  name=env!("CARGO_PKG_NAME"),
  bin_name=env!("CARGO_PKG_NAME"),
  about=env!("CARGO_PKG_DESCRIPTION"),
  styles=styles(),
)]
struct Cli {
    /// Directory holding the Libby session (libby.json)
    #[clap(long, global = true, value_name = "DIR")]
    settings: Option<PathBuf>,

    /// Number of concurrent downloads
    #[clap(long, global = true)]
    workers: Option<usize>,

    /// Request timeout in seconds
    #[clap(long, global = true)]
    timeout: Option<u64>,

    /// Enable debug logging
    #[clap(short, long, global = true)]
    verbose: bool,

    /// Hide progress bars
    #[clap(long = "hideprogress", global = true)]
    hide_progress: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Link this device to your Libby account
    Auth(AuthOptions),

    /// List your loans
    Loans(LoansOptions),

    /// Download loans
    Download(DownloadOptions),

    /// Return loans
    Return(SelectOptions),

    /// Renew loans
    Renew(SelectOptions),

    /// Get shell completions
    Completions(CompletionsOption),
}

#[derive(Parser, Debug, Clone)]
pub struct AuthOptions {
    /// Only check that the stored session is still valid
    #[clap(long)]
    check: bool,

    /// Remove the stored session
    #[clap(long)]
    reset: bool,

    /// Link with this 8-digit code instead of asking for one
    #[clap(long)]
    code: Option<String>,

    /// Do not open Libby in a browser
    #[clap(long)]
    no_browser: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct CategoryFilter {
    /// Only ebooks
    #[clap(long)]
    ebooks: bool,

    /// Only audiobooks
    #[clap(long)]
    audiobooks: bool,

    /// Only magazines
    #[clap(long)]
    magazines: bool,
}

impl CategoryFilter {
    fn categories(&self) -> Vec<Category> {
        [
            (self.ebooks, Category::Ebook),
            (self.audiobooks, Category::Audiobook),
            (self.magazines, Category::Magazine),
        ]
        .into_iter()
        .filter_map(|(on, c)| on.then_some(c))
        .collect()
    }
}

#[derive(Parser, Debug, Clone)]
#[command(args_conflicts_with_subcommands = true)]
pub struct LoansOptions {
    #[clap(flatten)]
    filter: CategoryFilter,

    #[command(subcommand)]
    command: Option<LoansSubcommand>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum LoansSubcommand {
    /// Export the raw loan records as JSON
    Export(ExportOptions),
}

#[derive(Parser, Debug, Clone)]
pub struct ExportOptions {
    /// Destination file
    path: PathBuf,

    #[clap(flatten)]
    filter: CategoryFilter,
}

#[derive(Args, Debug, Clone)]
pub struct SelectOptions {
    /// Loans to use, as numbered in `loancli loans` (e.g. 1,3-5)
    #[clap(long, conflicts_with = "latest")]
    select: Option<String>,

    /// The N most recently borrowed loans
    #[clap(long)]
    latest: Option<usize>,

    #[clap(flatten)]
    filter: CategoryFilter,
}

impl SelectOptions {
    fn selection(&self) -> Selection {
        Selection {
            select: self.select.clone(),
            latest: self.latest,
            categories: self.filter.categories(),
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct DownloadOptions {
    #[clap(flatten)]
    select: SelectOptions,

    /// Download directory
    #[clap(long = "downloaddir", short = 'd', default_value = ".")]
    download_dir: PathBuf,

    /// Folder name template
    #[clap(long = "bookfolderformat", default_value = utils::DEFAULT_BOOK_FOLDER_FORMAT)]
    folder_format: String,

    /// File name template
    #[clap(long = "bookfileformat", default_value = utils::DEFAULT_BOOK_FILE_FORMAT)]
    file_format: String,

    /// Write directly into the download directory
    #[clap(long = "nobookfolder")]
    no_book_folder: bool,

    /// Download this format (e.g. ebook-epub-adobe)
    #[clap(long, conflicts_with_all = ["direct", "license"])]
    format: Option<LibbyFormat>,

    /// Download the finished book or audio directly
    #[clap(long, conflicts_with = "license")]
    direct: bool,

    /// Download the license file (ACSM or ODM)
    #[clap(long)]
    license: bool,

    /// Prefer direct downloads when choosing a default format
    #[clap(long)]
    prefer_open: bool,

    /// Keep only the ODM of an MP3 audiobook instead of its parts
    #[clap(long)]
    odm: bool,

    /// Merge audiobook parts into one file
    #[clap(long)]
    merge: bool,

    /// Do not write chapter marks
    #[clap(long = "nochapters")]
    no_chapters: bool,

    /// Write an .opf metadata file
    #[clap(long)]
    opf: bool,

    /// Save the cover as cover.jpg
    #[clap(long = "keepcover")]
    keep_cover: bool,

    /// Use the media service's cover when the book marks none
    #[clap(long = "mediacover")]
    media_cover: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct CompletionsOption {
    shell: Shell,
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "loancli=debug" } else { "loancli=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_config(cli: &Cli) -> Config {
    let mut config = Config::from_env();
    if let Some(dir) = &cli.settings {
        config = config.with_settings_dir(dir);
    }
    if let Some(workers) = cli.workers {
        config.workers = workers.max(1);
    }
    if let Some(secs) = cli.timeout {
        config.request_timeout = std::time::Duration::from_secs(secs);
    }
    config
}

#[tokio::main]
async fn main() {
    if let Err(e) = config::load_env().await {
        error!("Cannot load environment. Err: {}", e);
    }

    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = build_config(&cli);
    let hidden = cli.hide_progress;

    match cli.command {
        Command::Auth(opt) => {
            cli::auth(config, opt.check, opt.reset, opt.code, !opt.no_browser).await
        }
        Command::Loans(opt) => match opt.command {
            Some(LoansSubcommand::Export(e)) => {
                let mut categories = opt.filter.categories();
                categories.extend(e.filter.categories());
                cli::export_loans(config, categories, &e.path, hidden).await
            }
            None => cli::list_loans(config, opt.filter.categories(), hidden).await,
        },
        Command::Download(opt) => {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warning!("Cancelling...");
                    on_interrupt.cancel();
                }
            });

            let mode = match (opt.direct, opt.license) {
                (true, _) => Some(DeliveryMode::Direct),
                (_, true) => Some(DeliveryMode::License),
                _ => None,
            };
            let args = DownloadArgs {
                selection: opt.select.selection(),
                download_dir: opt.download_dir,
                folder_format: opt.folder_format,
                file_format: opt.file_format,
                no_book_folder: opt.no_book_folder,
                format: opt.format,
                mode,
                prefer_open: opt.prefer_open,
                keep_odm: opt.odm,
                merge: opt.merge,
                no_chapters: opt.no_chapters,
                opf: opt.opf,
                keep_cover: opt.keep_cover,
                media_cover: opt.media_cover,
                hide_progress: hidden,
            };
            cli::download(config, args, cancel).await
        }
        Command::Return(opt) => cli::return_loans(config, opt.selection(), hidden).await,
        Command::Renew(opt) => cli::renew_loans(config, opt.selection(), hidden).await,
        Command::Completions(opt) => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(opt.shell, &mut cmd, name, &mut std::io::stdout())
        }
    }
}
