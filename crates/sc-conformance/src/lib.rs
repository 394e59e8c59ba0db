#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use sc_match::{MatchError, MatchPolicy, MatchReport, RowMatcher};
use sc_normalize::{
    NormalizeOptions, Normalizer, NumericRule, ResultFormat, field_value_from_json,
};
use sc_store::StoreError;
use sc_types::SourceRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures/cases"),
        }
    }

    #[must_use]
    pub fn with_fixture_root(fixture_root: impl Into<PathBuf>) -> Self {
        Self {
            fixture_root: fixture_root.into(),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SuiteOptions {
    pub case_filter: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseExpectation {
    Match,
    NoMatch,
    ParseError,
}

/// One fixture: records the pipeline claims to have written, the raw lines
/// the store returned, and the verdict the matcher must reach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationCase {
    pub case_id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub format: ResultFormat,
    #[serde(default)]
    pub policy: MatchPolicy,
    #[serde(default)]
    pub numeric_rule: NumericRule,
    pub records: Vec<SourceRecord>,
    pub rows: Vec<String>,
    pub expect: CaseExpectation,
}

impl VerificationCase {
    #[must_use]
    pub fn matcher(&self) -> RowMatcher {
        RowMatcher::new(
            Normalizer::new(NormalizeOptions {
                format: self.format,
                numeric_rule: self.numeric_rule,
            }),
            self.policy,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub policy: MatchPolicy,
    pub format: ResultFormat,
    pub status: CaseStatus,
    pub mismatch: Option<String>,
    pub report: Option<MatchReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub suite: String,
    pub fixture_count: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<CaseResult>,
}

impl SuiteReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.failed == 0 && self.fixture_count > 0
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("fixture format error: {0}")]
    FixtureFormat(String),
}

pub fn run_case_suite(config: &HarnessConfig) -> Result<SuiteReport, HarnessError> {
    run_case_suite_with_options(config, &SuiteOptions::default())
}

pub fn run_case_suite_with_options(
    config: &HarnessConfig,
    options: &SuiteOptions,
) -> Result<SuiteReport, HarnessError> {
    let cases = load_cases(config, options.case_filter.as_deref())?;
    let suite = match options.case_filter.as_deref() {
        Some(case_id) => format!("verification_cases:{case_id}"),
        None => "verification_cases".to_owned(),
    };
    Ok(build_report(suite, &cases))
}

pub fn run_case(case: &VerificationCase) -> CaseResult {
    let outcome = case.matcher().match_rows(&case.rows, &case.records);
    let (mismatch, report) = match (outcome, case.expect) {
        (Ok(report), CaseExpectation::Match) if report.is_match() => (None, Some(report)),
        (Ok(report), CaseExpectation::NoMatch) if !report.is_match() => (None, Some(report)),
        (Ok(report), expect) => (
            Some(format!("expected {expect:?} but got {}", report.summary())),
            Some(report),
        ),
        (Err(_), CaseExpectation::ParseError) => (None, None),
        (Err(err), expect) => (Some(format!("expected {expect:?} but got error: {err}")), None),
    };

    if let Some(reason) = &mismatch {
        tracing::warn!(case_id = %case.case_id, reason = %reason, "verification case failed");
    } else {
        tracing::debug!(case_id = %case.case_id, "verification case passed");
    }

    CaseResult {
        case_id: case.case_id.clone(),
        policy: case.policy,
        format: case.format,
        status: if mismatch.is_none() {
            CaseStatus::Pass
        } else {
            CaseStatus::Fail
        },
        mismatch,
        report,
    }
}

/// Matches a JSONL file of expected records against a file of result lines.
pub fn verify_files(
    expected_path: &Path,
    actual_path: &Path,
    matcher: &RowMatcher,
) -> Result<MatchReport, HarnessError> {
    let records = load_expected_records(expected_path)?;
    let lines = fs::read_to_string(actual_path)?;
    Ok(matcher.match_rows(lines.lines(), &records)?)
}

/// Matches a JSONL file of expected records against every row of a SQLite
/// table, read through [`sc_store::Verifier`] with its default timeouts.
#[cfg(feature = "sql-sqlite")]
pub fn verify_sqlite_table(
    expected_path: &Path,
    database: &Path,
    table: &str,
    matcher: &RowMatcher,
) -> Result<MatchReport, HarnessError> {
    let records = load_expected_records(expected_path)?;
    let verifier = sc_store::Verifier::new(sc_store::SqliteExecutor::open(database)?);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(verifier.verify_rows_with(table, &records, matcher))?)
}

/// One record per line: either a tagged `SourceRecord`
/// (`{"kind":"flat"|"structured","value":...}`) or a plain JSON object read as
/// a flat record. Blank lines are skipped.
pub fn load_expected_records(path: &Path) -> Result<Vec<SourceRecord>, HarnessError> {
    let body = fs::read_to_string(path)?;
    let mut records = Vec::new();
    for (idx, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        records.push(parse_expected_record(line).map_err(|err| {
            HarnessError::FixtureFormat(format!("{}:{}: {err}", path.display(), idx + 1))
        })?);
    }
    Ok(records)
}

fn parse_expected_record(line: &str) -> Result<SourceRecord, HarnessError> {
    if let Ok(record) = serde_json::from_str::<SourceRecord>(line) {
        return Ok(record);
    }
    match serde_json::from_str::<Value>(line)? {
        Value::Object(object) => Ok(SourceRecord::Flat(
            object
                .into_iter()
                .map(|(key, value)| (key, field_value_from_json(value)))
                .collect(),
        )),
        _ => Err(HarnessError::FixtureFormat(
            "expected record must be a JSON object".to_owned(),
        )),
    }
}

pub fn write_json_report<T: Serialize>(path: &Path, report: &T) -> Result<(), HarnessError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(report)?)?;
    Ok(())
}

fn build_report(suite: String, cases: &[VerificationCase]) -> SuiteReport {
    let results = cases.iter().map(run_case).collect::<Vec<_>>();
    let failed = results
        .iter()
        .filter(|result| matches!(result.status, CaseStatus::Fail))
        .count();
    let passed = results.len().saturating_sub(failed);
    tracing::info!(suite = %suite, fixtures = results.len(), passed, failed, "suite finished");

    SuiteReport {
        suite,
        fixture_count: results.len(),
        passed,
        failed,
        results,
    }
}

fn load_cases(
    config: &HarnessConfig,
    case_filter: Option<&str>,
) -> Result<Vec<VerificationCase>, HarnessError> {
    let fixture_files = list_fixture_files(&config.fixture_root)?;
    let mut cases = Vec::with_capacity(fixture_files.len());

    for fixture_path in fixture_files {
        let case = load_case(&fixture_path)?;
        if case_filter.is_none_or(|case_id| case.case_id == case_id) {
            cases.push(case);
        }
    }
    cases.sort_by(|a, b| a.case_id.cmp(&b.case_id));
    Ok(cases)
}

fn load_case(path: &Path) -> Result<VerificationCase, HarnessError> {
    let body = fs::read_to_string(path)?;
    serde_json::from_str(&body)
        .map_err(|err| HarnessError::FixtureFormat(format!("{}: {err}", path.display())))
}

fn list_fixture_files(root: &Path) -> Result<Vec<PathBuf>, HarnessError> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(current)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}
