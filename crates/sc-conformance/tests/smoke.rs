use std::fs;

use sc_conformance::{
    CaseStatus, HarnessConfig, HarnessError, SuiteOptions, SuiteReport, load_expected_records,
    run_case_suite, run_case_suite_with_options, verify_files, write_json_report,
};
use sc_match::{MatchPolicy, RowMatcher};
use sc_normalize::{Normalizer, ResultFormat};
use tempfile::tempdir;

#[test]
fn bundled_fixture_suite_is_green() {
    let cfg = HarnessConfig::default_paths();
    let report = run_case_suite(&cfg).expect("suite should run");
    let failures = report
        .results
        .iter()
        .filter_map(|result| result.mismatch.as_deref())
        .collect::<Vec<_>>();
    assert!(report.is_green(), "failures: {failures:?}");
    assert!(report.fixture_count >= 10);
    assert_eq!(report.passed, report.fixture_count);
}

#[test]
fn results_are_sorted_by_case_id() {
    let report = run_case_suite(&HarnessConfig::default_paths()).expect("suite should run");
    let ids = report
        .results
        .iter()
        .map(|result| result.case_id.as_str())
        .collect::<Vec<_>>();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted);
}

#[test]
fn case_filter_selects_one_fixture() {
    let options = SuiteOptions {
        case_filter: Some("policies_subset_extra_row".to_owned()),
    };
    let report = run_case_suite_with_options(&HarnessConfig::default_paths(), &options)
        .expect("suite should run");
    assert_eq!(report.suite, "verification_cases:policies_subset_extra_row");
    assert_eq!(report.fixture_count, 1);
    assert_eq!(report.results[0].policy, MatchPolicy::Subset);
}

#[test]
fn missing_fixture_root_is_never_green() {
    let dir = tempdir().expect("tempdir");
    let cfg = HarnessConfig::with_fixture_root(dir.path().join("absent"));
    let report = run_case_suite(&cfg).expect("suite should run");
    assert_eq!(report.fixture_count, 0);
    assert!(!report.is_green());
}

#[test]
fn wrong_expectation_turns_suite_red() {
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("wrong.json"),
        r#"{
            "case_id": "wrong",
            "format": "json_each_row",
            "records": [{"kind": "flat", "value": {"id": {"kind": "int64", "value": 1}}}],
            "rows": ["{\"id\":2}"],
            "expect": "match"
        }"#,
    )
    .expect("write fixture");

    let report =
        run_case_suite(&HarnessConfig::with_fixture_root(dir.path())).expect("suite should run");
    assert!(!report.is_green());
    assert_eq!(report.failed, 1);
    assert_eq!(report.results[0].status, CaseStatus::Fail);
    assert_eq!(report.results[0].policy, MatchPolicy::Exact);
}

#[test]
fn unreadable_fixture_is_a_format_error() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("broken.json"), "{\"case_id\": 3}").expect("write fixture");
    let err = run_case_suite(&HarnessConfig::with_fixture_root(dir.path()))
        .expect_err("fixture must be rejected");
    assert!(matches!(err, HarnessError::FixtureFormat(_)), "{err}");
    assert!(err.to_string().contains("broken.json"), "{err}");
}

#[test]
fn file_pair_verification_reports_missing_and_unexpected() {
    let dir = tempdir().expect("tempdir");
    let expected = dir.path().join("expected.jsonl");
    let actual = dir.path().join("actual.jsonl");
    fs::write(&expected, "{\"id\":1,\"name\":\"a\"}\n\n{\"id\":2,\"name\":\"b\"}\n")
        .expect("write expected");
    fs::write(&actual, "{\"id\":\"1\",\"name\":\"a\"}\n{\"id\":\"3\",\"name\":\"c\"}\n")
        .expect("write actual");

    assert_eq!(load_expected_records(&expected).expect("records").len(), 2);

    let matcher = RowMatcher::new(
        Normalizer::for_format(ResultFormat::JsonStringsEachRow),
        MatchPolicy::Exact,
    );
    let report = verify_files(&expected, &actual, &matcher).expect("verify");
    assert!(!report.is_match());
    assert_eq!(report.missing_records().count(), 1);
    assert_eq!(report.unexpected_rows().count(), 1);

    let first_row = RowMatcher::new(
        Normalizer::for_format(ResultFormat::JsonStringsEachRow),
        MatchPolicy::FirstRow,
    );
    assert!(verify_files(&expected, &actual, &first_row).expect("verify").is_match());
}

#[cfg(feature = "sql-sqlite")]
#[test]
fn sqlite_table_verification_keeps_store_errors_typed() {
    use sc_conformance::verify_sqlite_table;
    use sc_store::SqliteExecutor;

    let dir = tempdir().expect("tempdir");
    let database = dir.path().join("sink.db");
    SqliteExecutor::open(&database)
        .expect("open")
        .execute_batch(
            "CREATE TABLE events (id INTEGER, tags TEXT);
             INSERT INTO events VALUES (1, 'a b');",
        )
        .expect("seed");
    let expected = dir.path().join("expected.jsonl");
    fs::write(&expected, "{\"id\":1,\"tags\":\"ab\"}\n").expect("write expected");

    let matcher = RowMatcher::new(
        Normalizer::for_format(ResultFormat::JsonStringsEachRow),
        MatchPolicy::Exact,
    );
    let report = verify_sqlite_table(&expected, &database, "events", &matcher).expect("verify");
    assert!(report.is_match(), "{}", report.summary());

    let err = verify_sqlite_table(&expected, &database, "absent", &matcher)
        .expect_err("missing table");
    assert!(matches!(err, HarnessError::Store(_)), "{err}");
}

#[test]
fn reports_round_trip_through_disk() {
    let dir = tempdir().expect("tempdir");
    let report = run_case_suite(&HarnessConfig::default_paths()).expect("suite should run");
    let path = dir.path().join("nested/report.json");
    write_json_report(&path, &report).expect("write report");

    let body = fs::read_to_string(&path).expect("read report");
    let decoded: SuiteReport = serde_json::from_str(&body).expect("decode report");
    assert_eq!(decoded, report);
}
