use std::path::Path;

use tabled::Table;

use crate::{
    config::Config,
    error,
    libby::{Category, loans},
    success, warning,
};

use super::{connect, fetch_loans};

pub async fn list_loans(config: Config, categories: Vec<Category>, hidden: bool) {
    let client = connect(config).await;
    let loans = fetch_loans(&client, &categories, hidden).await;
    if loans.is_empty() {
        warning!("No loans found.");
        return;
    }
    println!("{}", Table::new(loans::table_rows(&loans)));
}

/// Writes the raw loan records as a JSON array.
pub async fn export_loans(config: Config, categories: Vec<Category>, path: &Path, hidden: bool) {
    let client = connect(config).await;
    let loans = fetch_loans(&client, &categories, hidden).await;
    match loans::export(&loans, path).await {
        Ok(()) => success!("Exported {} loan(s) to {}", loans.len(), path.display()),
        Err(e) => error!("Cannot export loans. Err: {}", e),
    }
}
