//! Loan catalog: listing, selection, export, return and renewal.

use std::{collections::HashSet, path::Path};

use serde_json::Value;
use tracing::instrument;

use crate::{
    Error, Res,
    libby::{LibbyClient, formats::Category},
    types::{LoanRecord, LoanTableRow},
    utils,
};

/// A loan as returned by the sync endpoint.
///
/// `record` is the typed view the client works with; `raw` is the record
/// exactly as the service sent it and is what [`export`] writes.
#[derive(Debug, Clone)]
pub struct Loan {
    pub record: LoanRecord,
    pub raw: Value,
}

impl Loan {
    pub fn from_value(raw: Value) -> Res<Self> {
        let record: LoanRecord = serde_json::from_value(raw.clone())?;
        Ok(Self { record, raw })
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn title(&self) -> &str {
        &self.record.title
    }

    /// The raw media type id (`audiobook`, `ebook`, `magazine`).
    pub fn type_id(&self) -> &str {
        &self.record.kind.id
    }

    pub fn category(&self) -> Option<Category> {
        Category::from_type_id(self.type_id())
    }

    pub fn card_id(&self) -> Option<&str> {
        self.record.card_id.as_deref()
    }

    pub fn author(&self) -> &str {
        self.record.first_creator_name.as_deref().unwrap_or_default()
    }

    pub fn format_ids(&self) -> impl Iterator<Item = &str> {
        self.record.formats.iter().map(|f| f.id.as_str())
    }

    /// The format the service locked this loan into, if any.
    pub fn locked_format(&self) -> Option<&str> {
        self.record
            .formats
            .iter()
            .find(|f| f.is_locked_in)
            .map(|f| f.id.as_str())
    }

    /// Largest cover image advertised on the loan record.
    pub fn cover_url(&self) -> Option<&str> {
        ["cover510Wide", "cover300Wide", "cover150Wide", "cover"]
            .iter()
            .find_map(|key| self.record.covers.get(*key))
            .and_then(|c| c.href.as_deref())
    }

    pub fn series(&self) -> Option<&str> {
        self.record
            .detailed_series
            .as_ref()
            .and_then(|s| s.series_name.as_deref())
    }

    pub fn reading_order(&self) -> Option<&str> {
        self.record
            .detailed_series
            .as_ref()
            .and_then(|s| s.reading_order.as_deref())
    }

    pub fn template_fields(&self) -> utils::TemplateFields {
        utils::TemplateFields {
            title: self.title().to_string(),
            author: self.author().to_string(),
            series: self.series().unwrap_or_default().to_string(),
            reading_order: self.reading_order().unwrap_or_default().to_string(),
            edition: self.record.edition.clone().unwrap_or_default(),
            id: self.id().to_string(),
        }
    }

    pub(crate) fn require_card(&self) -> Res<&str> {
        self.card_id()
            .ok_or_else(|| Error::fulfillment(self.id(), "loan has no library card id"))
    }
}

/// Converts the raw loans of a sync response, keeping service order.
///
/// Records that cannot be read are skipped with a warning. A record repeating
/// an id already seen is dropped so ids stay unique within the snapshot.
pub fn parse_loans(raw: Vec<Value>) -> Vec<Loan> {
    let mut seen = HashSet::new();
    let mut loans = Vec::with_capacity(raw.len());
    for value in raw {
        match Loan::from_value(value) {
            Ok(loan) => {
                if seen.insert(loan.id().to_string()) {
                    loans.push(loan);
                } else {
                    tracing::warn!(id = loan.id(), "dropping duplicate loan record");
                }
            }
            Err(e) => tracing::warn!(error = %e, "skipping unreadable loan record"),
        }
    }
    loans
}

/// Keeps the loans of the given categories. An empty filter keeps all.
pub fn filter_by_category(loans: Vec<Loan>, categories: &[Category]) -> Vec<Loan> {
    if categories.is_empty() {
        return loans;
    }
    loans
        .into_iter()
        .filter(|l| l.category().is_some_and(|c| categories.contains(&c)))
        .collect()
}

/// The `n` most recently borrowed loans. The sync order is newest first.
pub fn latest(loans: &[Loan], n: usize) -> Vec<&Loan> {
    loans.iter().take(n).collect()
}

/// Picks loans by their 1-based display index.
pub fn select<'a>(loans: &'a [Loan], indices: &[usize]) -> Res<Vec<&'a Loan>> {
    indices
        .iter()
        .map(|&i| {
            i.checked_sub(1)
                .and_then(|i| loans.get(i))
                .ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "invalid selection {i}: choose between 1 and {}",
                        loans.len()
                    ))
                })
        })
        .collect()
}

/// Serializes the raw loan records as a JSON array.
///
/// Every record must carry an `id`, and ids must be unique.
pub fn export_document(loans: &[Loan]) -> Res<String> {
    let mut seen = HashSet::new();
    for loan in loans {
        let has_id = loan.raw.get("id").is_some_and(|v| !v.is_null());
        if !has_id || !seen.insert(loan.id()) {
            return Err(Error::InvalidInput(format!(
                "cannot export loan without a unique id: {}",
                loan.id()
            )));
        }
    }
    let raw: Vec<&Value> = loans.iter().map(|l| &l.raw).collect();
    Ok(serde_json::to_string_pretty(&raw)?)
}

pub async fn export(loans: &[Loan], path: &Path) -> Res<()> {
    let document = export_document(loans)?;
    utils::write_atomic(path, document.as_bytes()).await
}

pub fn table_rows(loans: &[Loan]) -> Vec<LoanTableRow> {
    loans
        .iter()
        .enumerate()
        .map(|(i, loan)| LoanTableRow {
            index: i + 1,
            title: loan.title().to_string(),
            author: loan.author().to_string(),
            kind: loan.type_id().to_string(),
            expires: loan
                .record
                .expire_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
        })
        .collect()
}

impl LibbyClient {
    /// Lists the borrower's active loans, in service order.
    #[instrument(skip(self))]
    pub async fn loans(&self) -> Res<Vec<Loan>> {
        let sync = self.sync().await?;
        Ok(parse_loans(sync.loans))
    }

    /// Returns a loan to the library.
    #[instrument(skip(self, loan), fields(id = loan.id()))]
    pub async fn return_loan(&self, loan: &Loan) -> Res<()> {
        let card = loan.require_card()?;
        let url = self.api_url(&format!("/card/{card}/loan/{}", loan.id()));
        self.send(self.http().delete(&url)).await?;
        tracing::debug!("loan returned");
        Ok(())
    }

    /// Renews a loan and returns the updated record.
    #[instrument(skip(self, loan), fields(id = loan.id()))]
    pub async fn renew_loan(&self, loan: &Loan) -> Res<Loan> {
        let card = loan.require_card()?;
        let url = self.api_url(&format!("/card/{card}/loan/{}", loan.id()));
        let response = self
            .send(self.http().put(&url).json(&serde_json::json!({
                "cardId": card,
                "title": { "titleId": loan.id() },
            })))
            .await?;
        let value: Value = response.json().await?;
        Loan::from_value(value)
    }
}
