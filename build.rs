//! Build script for the loancli CLI.
//!
//! Copies the `.env.example` template into the local data directory, next to
//! where `config::load_env` looks for the real `.env`:
//!
//! - Linux: `~/.local/share/loancli/.env.example`
//! - macOS: `~/Library/Application Support/loancli/.env.example`
//! - Windows: `%LOCALAPPDATA%/loancli/.env.example`
//!
//! A missing template only produces a cargo warning.

use std::{env, fs, path::PathBuf};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=.env.example");

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?);
    let template = manifest_dir.join(".env.example");

    let mut out_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    out_dir.push("loancli");
    fs::create_dir_all(&out_dir)?;

    if template.is_file() {
        fs::copy(&template, out_dir.join(".env.example"))?;
    } else {
        println!(
            "cargo:warning=.env.example not found at {}",
            template.display()
        );
    }

    Ok(())
}
