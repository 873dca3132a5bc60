use std::time::Duration;

use loancli::utils::*;
use rstest::rstest;

// Helper function to create template fields for a title
fn fields(title: &str, author: &str) -> TemplateFields {
    TemplateFields {
        title: title.to_string(),
        author: author.to_string(),
        series: "The Series".to_string(),
        reading_order: "3".to_string(),
        edition: String::new(),
        id: "1234".to_string(),
    }
}

#[rstest]
#[case("%(Title)s - %(Author)s", "Dune - Frank Herbert")]
#[case("%(Series)s %(ReadingOrder)s - %(Title)s", "The Series 3 - Dune")]
#[case("%(ID)s", "1234")]
#[case("%(Title)s %(Edition)s", "Dune")]
#[case("%(Unknown)s %(Title)s", "%(Unknown)s Dune")]
fn test_format_template(#[case] template: &str, #[case] expected: &str) {
    let fields = fields("Dune", "Frank Herbert");
    assert_eq!(format_template(template, &fields), expected);
}

#[test]
fn test_format_template_sanitizes_path_separators() {
    let fields = fields("AC/DC: Live?", "A\\B");
    let result = format_template("%(Title)s - %(Author)s", &fields);

    assert!(!result.contains('/'));
    assert!(!result.contains('\\'));
    assert!(!result.contains(':'));
    assert!(!result.contains('?'));
    assert_eq!(result, "AC-DC- Live- - A-B");
}

#[rstest]
#[case("normal name", "normal name")]
#[case("  spaced   out  ", "spaced out")]
#[case("../etc/passwd", "etc-passwd")]
#[case("", "untitled")]
#[case("...", "untitled")]
fn test_sanitize_path_component(#[case] input: &str, #[case] expected: &str) {
    assert_eq!(sanitize_path_component(input), expected);
}

#[rstest]
#[case("10:00", Some(Duration::from_secs(600)))]
#[case("01:02:03", Some(Duration::from_secs(3723)))]
#[case("12.5", Some(Duration::from_millis(12_500)))]
#[case("", None)]
#[case("abc", None)]
#[case("-5", None)]
fn test_parse_duration(#[case] input: &str, #[case] expected: Option<Duration>) {
    assert_eq!(parse_duration(input), expected);
}

#[test]
fn test_parse_selection() {
    assert_eq!(parse_selection("1,3-5", 5).unwrap(), vec![1, 3, 4, 5]);
    assert_eq!(parse_selection("2 2 1", 3).unwrap(), vec![1, 2]);

    // Out of range and malformed selections are rejected
    assert!(parse_selection("0", 3).is_err());
    assert!(parse_selection("4", 3).is_err());
    assert!(parse_selection("3-1", 3).is_err());
    assert!(parse_selection("x", 3).is_err());
}

#[test]
fn test_redact_keeps_only_last_two_characters() {
    assert_eq!(redact("12345678"), "******78");
    assert_eq!(redact("12"), "**");
}

#[test]
fn test_stable_identifier() {
    let a = stable_identifier("loancli:1:Title");
    assert!(a.starts_with("urn:uuid:"));
    assert_eq!(a, stable_identifier("loancli:1:Title"));
    assert_ne!(a, stable_identifier("loancli:2:Title"));
}

#[rstest]
#[case("OEBPS/page.xhtml", "application/xhtml+xml")]
#[case("images/cover.JPG", "image/jpeg")]
#[case("part.mp3?x=1", "audio/mpeg")]
fn test_guess_media_type(#[case] path: &str, #[case] expected: &str) {
    assert_eq!(guess_media_type(path), expected);
}

#[tokio::test]
async fn test_write_atomic_replaces_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/out.txt");

    write_atomic(&path, b"first").await.unwrap();
    write_atomic(&path, b"second").await.unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), b"second");
    // No temporary files are left behind
    let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_write_atomic_failure_leaves_no_temporary_file() {
    let dir = tempfile::tempdir().unwrap();
    // The destination is a non-empty directory, so the final rename fails
    let path = dir.path().join("taken");
    std::fs::create_dir_all(path.join("inner")).unwrap();

    assert!(write_atomic(&path, b"data").await.is_err());

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, vec!["taken".to_string()]);
}
