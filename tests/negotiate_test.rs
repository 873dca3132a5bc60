use loancli::{
    Error,
    libby::{
        Category, DeliveryMode, LibbyFormat, Loan, Protocol,
        formats::{default_format, fulfillable_formats, get_loan_format, has_format, negotiate},
    },
    pipeline::{DownloadOptions, plan_for},
};
use rstest::rstest;
use serde_json::json;

// Helper function to create a loan advertising the given formats
fn loan(type_id: &str, formats: &[&str]) -> Loan {
    Loan::from_value(json!({
        "id": "1001",
        "title": "Test",
        "type": {"id": type_id},
        "cardId": "9",
        "formats": formats.iter().map(|f| json!({"id": f})).collect::<Vec<_>>(),
    }))
    .unwrap()
}

fn locked_loan(type_id: &str, formats: &[&str], locked: &str) -> Loan {
    Loan::from_value(json!({
        "id": "1002",
        "title": "Locked",
        "type": {"id": type_id},
        "cardId": "9",
        "formats": formats
            .iter()
            .map(|f| json!({"id": f, "isLockedIn": *f == locked}))
            .collect::<Vec<_>>(),
    }))
    .unwrap()
}

#[rstest]
#[case("audiobook", &["audiobook-mp3", "audiobook-overdrive"], DeliveryMode::License, LibbyFormat::AudiobookMp3, Protocol::License)]
#[case("audiobook", &["audiobook-mp3", "audiobook-overdrive"], DeliveryMode::Direct, LibbyFormat::AudiobookOverdrive, Protocol::Open)]
#[case("ebook", &["ebook-epub-adobe", "ebook-overdrive"], DeliveryMode::License, LibbyFormat::EbookEpubAdobe, Protocol::License)]
#[case("ebook", &["ebook-epub-open"], DeliveryMode::License, LibbyFormat::EbookEpubOpen, Protocol::License)]
#[case("ebook", &["ebook-pdf-open"], DeliveryMode::License, LibbyFormat::EbookPdfOpen, Protocol::License)]
#[case("ebook", &["ebook-epub-adobe", "ebook-overdrive"], DeliveryMode::Direct, LibbyFormat::EbookOverdrive, Protocol::Open)]
#[case("magazine", &["magazine-overdrive"], DeliveryMode::Direct, LibbyFormat::MagazineOverdrive, Protocol::Open)]
fn test_negotiation_table(
    #[case] type_id: &str,
    #[case] formats: &[&str],
    #[case] mode: DeliveryMode,
    #[case] expected: LibbyFormat,
    #[case] protocol: Protocol,
) {
    let loan = loan(type_id, formats);
    let category = loan.category().unwrap();

    let plan = negotiate(&loan, category, mode).unwrap();
    assert_eq!(plan.format, expected);
    assert_eq!(plan.protocol, protocol);
    assert_eq!(plan.category, category);
}

#[test]
fn test_license_only_loan_refuses_direct_mode() {
    let loan = loan("audiobook", &["audiobook-mp3"]);

    let direct = negotiate(&loan, Category::Audiobook, DeliveryMode::Direct);
    assert!(matches!(direct, Err(Error::FormatUnavailable { .. })));

    // The license request yields a license plan, never a container
    let plan = negotiate(&loan, Category::Audiobook, DeliveryMode::License).unwrap();
    assert_eq!(plan.protocol, Protocol::License);
    assert_eq!(plan.format, LibbyFormat::AudiobookMp3);
}

#[test]
fn test_magazines_have_no_license_file() {
    let loan = loan("magazine", &["magazine-overdrive"]);
    assert!(matches!(
        negotiate(&loan, Category::Magazine, DeliveryMode::License),
        Err(Error::FormatUnavailable { .. })
    ));
}

#[test]
fn test_category_mismatch_is_unavailable() {
    let loan = loan("ebook", &["ebook-overdrive"]);
    assert!(matches!(
        negotiate(&loan, Category::Audiobook, DeliveryMode::Direct),
        Err(Error::FormatUnavailable { .. })
    ));
}

#[test]
fn test_locked_loan_cannot_switch_format() {
    let loan = locked_loan(
        "ebook",
        &["ebook-epub-adobe", "ebook-overdrive"],
        "ebook-overdrive",
    );
    assert!(matches!(
        negotiate(&loan, Category::Ebook, DeliveryMode::License),
        Err(Error::FormatUnavailable { .. })
    ));
    assert_eq!(
        negotiate(&loan, Category::Ebook, DeliveryMode::Direct)
            .unwrap()
            .format,
        LibbyFormat::EbookOverdrive
    );
}

#[test]
fn test_locked_format_wins_over_preferred_license() {
    let loan = locked_loan(
        "ebook",
        &["ebook-epub-adobe", "ebook-pdf-adobe"],
        "ebook-pdf-adobe",
    );

    let plan = negotiate(&loan, Category::Ebook, DeliveryMode::License).unwrap();
    assert_eq!(plan.format, LibbyFormat::EbookPdfAdobe);
    assert_eq!(plan.protocol, Protocol::License);

    let plan = plan_for(&loan, &DownloadOptions::default()).unwrap();
    assert_eq!(plan.format, LibbyFormat::EbookPdfAdobe);
}

#[test]
fn test_default_download_keeps_the_open_epub() {
    let loan = loan("ebook", &["ebook-epub-adobe", "ebook-epub-open"]);

    let plan = plan_for(&loan, &DownloadOptions::default()).unwrap();
    assert_eq!(plan.format, LibbyFormat::EbookEpubOpen);
    assert_eq!(plan.protocol, Protocol::License);
    assert_eq!(plan.category, Category::Ebook);
}

#[test]
fn test_get_loan_format_prefers_exact_then_alternate() {
    let both = loan("ebook", &["ebook-epub-adobe", "ebook-epub-open"]);
    assert_eq!(
        get_loan_format(&both, LibbyFormat::EbookEpubAdobe),
        Some(LibbyFormat::EbookEpubAdobe)
    );

    let open_only = loan("ebook", &["ebook-epub-open"]);
    assert_eq!(
        get_loan_format(&open_only, LibbyFormat::EbookEpubAdobe),
        Some(LibbyFormat::EbookEpubOpen)
    );
    assert_eq!(get_loan_format(&open_only, LibbyFormat::EbookPdfAdobe), None);

    assert!(has_format(&open_only, LibbyFormat::EbookEpubOpen));
    assert!(!has_format(&open_only, LibbyFormat::EbookEpubAdobe));
}

#[rstest]
#[case(&["audiobook-mp3", "audiobook-overdrive"], false, Some(LibbyFormat::AudiobookMp3))]
#[case(&["audiobook-mp3", "audiobook-overdrive"], true, Some(LibbyFormat::AudiobookOverdrive))]
#[case(&["audiobook-overdrive"], false, Some(LibbyFormat::AudiobookOverdrive))]
fn test_default_format_for_audiobooks(
    #[case] formats: &[&str],
    #[case] prefer_open: bool,
    #[case] expected: Option<LibbyFormat>,
) {
    assert_eq!(default_format(&loan("audiobook", formats), prefer_open), expected);
}

#[test]
fn test_default_format_for_ebooks_and_locks() {
    let ebook = loan("ebook", &["ebook-pdf-adobe", "ebook-epub-adobe", "ebook-overdrive"]);
    assert_eq!(default_format(&ebook, false), Some(LibbyFormat::EbookEpubAdobe));
    assert_eq!(default_format(&ebook, true), Some(LibbyFormat::EbookOverdrive));

    let kindle = locked_loan("ebook", &["ebook-kindle", "ebook-overdrive"], "ebook-kindle");
    assert_eq!(default_format(&kindle, false), None);
    assert_eq!(fulfillable_formats(&kindle), vec![LibbyFormat::EbookOverdrive]);
}
