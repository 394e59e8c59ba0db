#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use sc_conformance::{
    HarnessConfig, SuiteOptions, run_case_suite_with_options, verify_files, write_json_report,
};
use sc_match::{MatchPolicy, MatchReport, RowMatcher};
use sc_normalize::{Normalizer, ResultFormat};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| format!("cannot install log subscriber: {err}"))?;

    let mut fixture_root: Option<PathBuf> = None;
    let mut case_filter: Option<String> = None;
    let mut expected: Option<PathBuf> = None;
    let mut actual: Option<PathBuf> = None;
    let mut sqlite: Option<PathBuf> = None;
    let mut table: Option<String> = None;
    let mut format = ResultFormat::JsonStringsEachRow;
    let mut policy = MatchPolicy::default();
    let mut report_path: Option<PathBuf> = None;
    let mut require_green = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--fixtures" => {
                let value = args.next().ok_or("--fixtures requires a directory")?;
                fixture_root = Some(PathBuf::from(value));
            }
            "--case" => {
                let value = args.next().ok_or("--case requires a case id")?;
                case_filter = Some(value);
            }
            "--expected" => {
                let value = args.next().ok_or("--expected requires a JSONL file")?;
                expected = Some(PathBuf::from(value));
            }
            "--actual" => {
                let value = args.next().ok_or("--actual requires a file of result lines")?;
                actual = Some(PathBuf::from(value));
            }
            "--sqlite" => {
                let value = args.next().ok_or("--sqlite requires a database path")?;
                sqlite = Some(PathBuf::from(value));
            }
            "--table" => {
                let value = args.next().ok_or("--table requires a table name")?;
                table = Some(value);
            }
            "--format" => {
                let value = args.next().ok_or("--format requires json or json-strings")?;
                format = match value.as_str() {
                    "json" => ResultFormat::JsonEachRow,
                    "json-strings" => ResultFormat::JsonStringsEachRow,
                    _ => return Err(format!("unsupported format: {value}").into()),
                };
            }
            "--policy" => {
                let value = args
                    .next()
                    .ok_or("--policy requires first-row, subset or exact")?;
                policy = match value.as_str() {
                    "first-row" => MatchPolicy::FirstRow,
                    "subset" => MatchPolicy::Subset,
                    "exact" => MatchPolicy::Exact,
                    _ => return Err(format!("unsupported policy: {value}").into()),
                };
            }
            "--report" => {
                let value = args.next().ok_or("--report requires an output path")?;
                report_path = Some(PathBuf::from(value));
            }
            "--require-green" => {
                require_green = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                return Err(format!("unknown argument: {other}").into());
            }
        }
    }

    let Some(expected) = expected else {
        let config = fixture_root.map_or_else(HarnessConfig::default_paths, |root| {
            HarnessConfig::with_fixture_root(root)
        });
        let report = run_case_suite_with_options(&config, &SuiteOptions { case_filter })?;
        println!(
            "suite={} fixtures={} passed={} failed={} green={}",
            report.suite,
            report.fixture_count,
            report.passed,
            report.failed,
            report.is_green()
        );
        for result in report.results.iter().filter(|result| result.mismatch.is_some()) {
            println!(
                "failed case={} reason={}",
                result.case_id,
                result.mismatch.as_deref().unwrap_or_default()
            );
        }
        if let Some(path) = &report_path {
            write_json_report(path, &report)?;
            println!("wrote report={}", path.display());
        }
        if require_green && !report.is_green() {
            return Err(format!("suite {} is not green", report.suite).into());
        }
        return Ok(());
    };

    let matcher = RowMatcher::new(Normalizer::for_format(format), policy);
    let report = match (actual, sqlite) {
        (Some(actual), None) => verify_files(&expected, &actual, &matcher)?,
        (None, Some(database)) => {
            let table = table.ok_or("--sqlite requires --table")?;
            verify_sqlite(&expected, &database, &table, &matcher)?
        }
        _ => return Err("--expected requires exactly one of --actual or --sqlite".into()),
    };

    println!("{}", report.summary());
    for record in report.missing_records() {
        println!("missing {record}");
    }
    for row in report.unexpected_rows() {
        println!("unexpected {row}");
    }
    if let Some(path) = &report_path {
        write_json_report(path, &report)?;
        println!("wrote report={}", path.display());
    }
    if require_green && !report.is_match() {
        return Err("rows do not match expected records".into());
    }
    Ok(())
}

#[cfg(feature = "sql-sqlite")]
fn verify_sqlite(
    expected: &Path,
    database: &Path,
    table: &str,
    matcher: &RowMatcher,
) -> Result<MatchReport, Box<dyn std::error::Error>> {
    Ok(sc_conformance::verify_sqlite_table(expected, database, table, matcher)?)
}

#[cfg(not(feature = "sql-sqlite"))]
fn verify_sqlite(
    _expected: &Path,
    _database: &Path,
    _table: &str,
    _matcher: &RowMatcher,
) -> Result<MatchReport, Box<dyn std::error::Error>> {
    Err("--sqlite needs the sql-sqlite feature".into())
}

fn print_help() {
    println!(
        "sinkcheck-cli\n\
         Usage:\n\
         \tsinkcheck-cli [--fixtures <dir>] [--case <id>] [--report <path>] [--require-green]\n\
         \tsinkcheck-cli --expected <records.jsonl> --actual <rows.jsonl> [--format json|json-strings] [--policy first-row|subset|exact]\n\
         \tsinkcheck-cli --expected <records.jsonl> --sqlite <db> --table <name> [--policy ...]\n\
         Options:\n\
         \t--fixtures <dir>     Fixture root for the verification suite\n\
         \t--case <id>          Run only one case id\n\
         \t--expected <file>    Expected records, one JSON object per line\n\
         \t--actual <file>      Result lines as returned by the store\n\
         \t--sqlite <db>        Read result rows from a SQLite database\n\
         \t--table <name>       Table to read with --sqlite\n\
         \t--format <fmt>       json or json-strings (default)\n\
         \t--policy <policy>    first-row, subset or exact (default)\n\
         \t--report <path>      Write the JSON report to <path>\n\
         \t--require-green      Fail with non-zero exit on any mismatch\n\
         \t-h, --help           Show this help"
    );
}
