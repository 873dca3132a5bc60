//! # CLI Module
//!
//! This module provides the command-line interface layer for loancli. Every
//! command parses nothing itself: the binary hands over already-parsed
//! options and the functions here delegate to [`crate::libby`] and
//! [`crate::pipeline`], translating results into user-facing output.
//!
//! ## Commands
//!
//! - [`auth`] - Links this device to a Libby account, checks or resets it
//! - [`list_loans`] / [`export_loans`] - Shows or exports the current loans
//! - [`download`] - Downloads selected loans as EPUB, MP3 or license file
//! - [`return_loans`] / [`renew_loans`] - Manages selected loans
//!
//! ## Error Presentation
//!
//! Library functions return [`crate::Error`]. Errors that end the run are
//! printed with the `error!` macro, which exits the process. Per-loan
//! failures of a batch are printed as warnings and the batch continues.
//!
//! ## Usage Patterns
//!
//! ```bash
//! loancli auth                          # Link this device
//! loancli loans                         # List loans
//! loancli download --latest 1           # Download the most recent loan
//! loancli download --select 2,4 --opf   # Download loans 2 and 4 with sidecars
//! loancli loans export loans.json       # Export the raw loan records
//! ```

mod auth;
mod download;
mod loans;
mod manage;

use std::{io::Write, time::Duration};

use indicatif::{ProgressBar, ProgressStyle};

pub use auth::{TerminalPrompt, auth};
pub use download::{DownloadArgs, download};
pub use loans::{export_loans, list_loans};
pub use manage::{renew_loans, return_loans};

use crate::{
    Error, Res,
    config::Config,
    error,
    libby::{Category, LibbyClient, Loan, loans as catalog},
    utils,
};

/// Which loans a command works on.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// 1-based positions as shown by `loancli loans`, e.g. `1,3-5`.
    pub select: Option<String>,
    /// The N most recently borrowed loans.
    pub latest: Option<usize>,
    /// Only these categories. Empty means all.
    pub categories: Vec<Category>,
}

/// Connects with the stored session or exits with a hint to run `auth`.
pub(crate) async fn connect(config: Config) -> LibbyClient {
    match LibbyClient::connect(config).await {
        Ok(client) => client,
        Err(Error::NotConfigured) => error!("{}", Error::NotConfigured),
        Err(e) => error!("Cannot reach Libby. Err: {}", e),
    }
}

pub(crate) fn spinner(message: &str, hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    if let Ok(style) = ProgressStyle::with_template("{spinner:.blue} {msg}") {
        pb.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
    }
    pb
}

/// Fetches the loans and narrows them down to the category filter.
pub(crate) async fn fetch_loans(
    client: &LibbyClient,
    categories: &[Category],
    hidden: bool,
) -> Vec<Loan> {
    let pb = spinner("Fetching loans...", hidden);
    let result = client.loans().await;
    pb.finish_and_clear();
    match result {
        Ok(all) => catalog::filter_by_category(all, categories),
        Err(e) => error!("Cannot fetch loans. Err: {}", e),
    }
}

/// Resolves a selection against the loan list. Without `--select` or
/// `--latest` the user is asked interactively.
pub(crate) fn resolve_selection<'a>(all: &'a [Loan], selection: &Selection) -> Res<Vec<&'a Loan>> {
    if let Some(n) = selection.latest {
        return Ok(catalog::latest(all, n));
    }
    let input = match &selection.select {
        Some(input) => input.clone(),
        None => {
            println!("{}", tabled::Table::new(catalog::table_rows(all)));
            print!("Choose from the list (e.g. 1,3-5): ");
            std::io::stdout()
                .flush()
                .map_err(|e| Error::io("stdout", e))?;
            let mut line = String::new();
            std::io::stdin()
                .read_line(&mut line)
                .map_err(|e| Error::io("stdin", e))?;
            line
        }
    };
    let indices = utils::parse_selection(input.trim(), all.len())?;
    catalog::select(all, &indices)
}
