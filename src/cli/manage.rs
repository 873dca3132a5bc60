use crate::{config::Config, error, success, warning};

use super::{Selection, connect, fetch_loans, resolve_selection};

pub async fn return_loans(config: Config, selection: Selection, hidden: bool) {
    let client = connect(config).await;
    let all = fetch_loans(&client, &selection.categories, hidden).await;
    let chosen = match resolve_selection(&all, &selection) {
        Ok(chosen) => chosen,
        Err(e) => error!("{}", e),
    };

    for loan in chosen {
        match client.return_loan(loan).await {
            Ok(()) => success!("Returned \"{}\"", loan.title()),
            Err(e) => warning!("Cannot return \"{}\". Err: {}", loan.title(), e),
        }
    }
}

pub async fn renew_loans(config: Config, selection: Selection, hidden: bool) {
    let client = connect(config).await;
    let all = fetch_loans(&client, &selection.categories, hidden).await;
    let chosen = match resolve_selection(&all, &selection) {
        Ok(chosen) => chosen,
        Err(e) => error!("{}", e),
    };

    for loan in chosen {
        match client.renew_loan(loan).await {
            Ok(renewed) => {
                let expires = renewed
                    .record
                    .expire_date
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                success!("Renewed \"{}\" until {}", loan.title(), expires)
            }
            Err(e) => warning!("Cannot renew \"{}\". Err: {}", loan.title(), e),
        }
    }
}
