//! Drift detection against generated trees.

mod support;

use std::fs;

use assert_matches::assert_matches;
use ggen_sync::error::{EXIT_DRIFT, EXIT_OK};
use ggen_sync::{ReportFormat, VerificationResult, Verifier, VerifyMode, VerifyOptions};
use support::Fixture;

const COMMAND_RS: &str = "src/commands/validate.rs";
const DOCS_MD: &str = "docs/commands.md";

fn verify(fixture: &Fixture, mode: VerifyMode) -> ggen_sync::VerifyReport {
    Verifier::new(fixture.workspace())
        .verify(&VerifyOptions { target: None, mode })
        .unwrap()
}

fn result_for<'a>(report: &'a ggen_sync::VerifyReport, output: &str) -> &'a VerificationResult {
    &report
        .entries
        .iter()
        .find(|e| e.output == output)
        .unwrap_or_else(|| panic!("no entry for {output}"))
        .result
}

#[tokio::test]
async fn fresh_build_verifies_in_both_modes() {
    let fixture = Fixture::new();
    fixture.sync().await;

    for mode in [VerifyMode::Quick, VerifyMode::Thorough] {
        let report = verify(&fixture, mode);
        assert_eq!(report.entries.len(), 2, "{mode}");
        assert!(report.entries.iter().all(|e| e.result.is_valid()), "{mode}");
        assert_eq!(report.exit_code(), EXIT_OK);
    }
}

#[tokio::test]
async fn manual_edit_is_reported_as_drift_then_repaired() {
    let fixture = Fixture::new();
    fixture.sync().await;
    fixture.write(COMMAND_RS, "// hand edited\n");

    let report = verify(&fixture, VerifyMode::Quick);
    assert_matches!(
        result_for(&report, COMMAND_RS),
        VerificationResult::Drifted { expected, actual } if expected != actual
    );
    assert!(result_for(&report, DOCS_MD).is_valid());
    assert_eq!(report.exit_code(), EXIT_DRIFT);
    assert!(report.to_markdown().contains("drifted"));

    fixture.sync().await;
    assert_eq!(verify(&fixture, VerifyMode::Quick).exit_code(), EXIT_OK);
}

#[tokio::test]
async fn deleted_artifact_is_missing() {
    let fixture = Fixture::new();
    fixture.sync().await;
    fs::remove_file(fixture.path(DOCS_MD)).unwrap();

    let report = verify(&fixture, VerifyMode::Quick);
    assert_eq!(result_for(&report, DOCS_MD), &VerificationResult::Missing);
    assert_eq!(report.exit_code(), EXIT_DRIFT);
}

#[tokio::test]
async fn tampered_receipt_is_invalid() {
    let fixture = Fixture::new();
    fixture.sync().await;

    let receipt = fixture.receipt(DOCS_MD);
    let text = fs::read_to_string(&receipt).unwrap();
    fs::write(&receipt, text.replace("\"target\": \"docs\"", "\"target\": \"other\"")).unwrap();

    let report = verify(&fixture, VerifyMode::Quick);
    assert_matches!(result_for(&report, DOCS_MD), VerificationResult::InvalidReceipt { .. });
}

#[tokio::test]
async fn thorough_mode_catches_stale_artifacts() {
    let fixture = Fixture::new();
    fixture.sync().await;

    // The artifact still matches its receipt, but no longer matches what
    // the current inputs would produce.
    fixture.write("templates/docs.md.tera", "# Changed\n");
    assert_eq!(verify(&fixture, VerifyMode::Quick).exit_code(), EXIT_OK);

    let report = verify(&fixture, VerifyMode::Thorough);
    assert!(!result_for(&report, DOCS_MD).is_valid());
    assert!(result_for(&report, COMMAND_RS).is_valid());
}

#[tokio::test]
async fn verify_is_scoped_by_target_and_renders_json() {
    let fixture = Fixture::new();
    fixture.sync().await;

    let report = Verifier::new(fixture.workspace())
        .verify(&VerifyOptions {
            target: Some("docs".into()),
            mode: VerifyMode::Quick,
        })
        .unwrap();
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].output, DOCS_MD);

    let json: serde_json::Value = serde_json::from_str(&report.render(ReportFormat::Json)).unwrap();
    assert_eq!(json["mode"], "quick");
    assert_eq!(json["entries"][0]["result"]["status"], "valid");
}

#[test]
fn verify_before_any_build_reports_nothing() {
    let fixture = Fixture::new();
    let report = verify(&fixture, VerifyMode::Quick);
    assert!(report.entries.is_empty());
    assert_eq!(report.exit_code(), EXIT_OK);
}
