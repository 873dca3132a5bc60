//! Libby Loan Fetcher CLI Library
//!
//! This library provides functionality for fetching the loans of a Libby
//! account: authenticating a device, listing loans, negotiating a delivery
//! format, fulfilling the loan through either the license-file protocol or
//! the direct "open" protocol, and assembling the downloaded fragments into
//! an EPUB, a license file or tagged MP3 audio.
//!
//! # Modules
//!
//! - `cli` - Command-line interface implementations
//! - `config` - Configuration management and environment variables
//! - `error` - Error taxonomy shared by every layer
//! - `fetch` - Bounded, retrying asset downloader
//! - `libby` - Libby service client (auth, loans, formats, fulfillment, media)
//! - `management` - Persisted session state
//! - `package` - EPUB, audio and sidecar assembly
//! - `pipeline` - Per-loan download orchestration
//! - `types` - Data structures and type definitions
//! - `utils` - Utility functions and helpers
//!
//! # Example
//!
//! ```no_run
//! use loancli::{config::Config, libby::LibbyClient};
//!
//! #[tokio::main]
//! async fn main() -> loancli::Res<()> {
//!     let config = Config::from_env();
//!     let client = LibbyClient::connect(config).await?;
//!     let loans = client.loans().await?;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod libby;
pub mod management;
pub mod package;
pub mod pipeline;
pub mod types;
pub mod utils;

pub use error::Error;

/// A convenient Result type alias for operations that may fail.
///
/// Every layer of the crate reports failures through [`Error`], so callers can
/// match on the failure kind (`NotConfigured`, `FormatUnavailable`, ...) and
/// decide whether a run, a single loan or nothing at all has to be abandoned.
///
/// # Type Parameters
///
/// - `T` - The success type returned on successful operations
///
/// # Example
///
/// ```
/// use loancli::Res;
///
/// async fn fetch_data() -> Res<String> {
///     Ok("data".to_string())
/// }
/// ```
pub type Res<T> = std::result::Result<T, Error>;

/// Prints an informational message with a blue bullet point.
///
/// Creates a formatted output line with a distinctive blue "o" indicator
/// followed by the provided message. Used for general information and
/// status updates throughout the application.
///
/// # Example
///
/// ```ignore
/// info!("Found {} loans", count);
/// ```
#[macro_export]
macro_rules! info {
  ($($arg:tt)*) => ({
    use colored::Colorize;
    println!("[{}] {}", "o".blue().bold(), std::format_args!($($arg)*));
  })
}

/// Prints a success message with a green checkmark.
///
/// # Example
///
/// ```ignore
/// success!("Login successful.");
/// success!("Saved {}", path.display());
/// ```
#[macro_export]
macro_rules! success {
  ($($arg:tt)*) => ({
    use colored::Colorize;
    println!("[{}] {}", "✓".green().bold(), std::format_args!($($arg)*));
  })
}

/// Prints an error message with a red exclamation mark and exits the program.
///
/// Creates a formatted error output with a red "!" indicator and immediately
/// terminates the program with exit code 1. Only the binary's command layer
/// uses it; library code returns [`Error`] instead.
///
/// # Example
///
/// ```ignore
/// error!("Libby has not been set up. Run loancli auth");
/// // Program exits here - code after this will not execute
/// ```
#[macro_export]
macro_rules! error {
  ($($arg:tt)*) => ({
    use colored::Colorize;
    eprintln!("[{}] {}", "!".red().bold(), std::format_args!($($arg)*));
    std::process::exit(1);
  })
}

/// Prints a warning message with a yellow exclamation mark.
///
/// Used for recoverable issues, e.g. a loan that was skipped in a batch.
///
/// # Example
///
/// ```ignore
/// warning!("Skipping {}: {}", loan.title, err);
/// ```
#[macro_export]
macro_rules! warning {
  ($($arg:tt)*) => ({
    use colored::Colorize;
    println!("[{}] {}", "!".yellow().bold(), std::format_args!($($arg)*));
  })
}
