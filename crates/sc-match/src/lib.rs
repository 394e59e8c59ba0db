#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};

use sc_normalize::{CanonicalRecord, NormalizeError, Normalizer, ResultFormat};
use sc_types::SourceRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// The first result row equals some expected record.
    FirstRow,
    /// Every expected record has its own equal result row; extra rows are allowed.
    Subset,
    /// Expected records and result rows are equal as multisets.
    #[default]
    Exact,
}

impl MatchPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FirstRow => "first_row",
            Self::Subset => "subset",
            Self::Exact => "exact",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedPair {
    pub expected_idx: usize,
    pub actual_idx: usize,
}

/// Outcome of one comparison. `expected` and `actual` hold canonical strings
/// in input order; `pairs`, `missing` and `unexpected` index into them and
/// describe what the policy actually inspected.
///
/// Under [`MatchPolicy::FirstRow`] only row 0 is inspected: on a match `pairs`
/// holds the one pair for it, otherwise every expected record is `missing`
/// and row 0 (when present) is `unexpected`. Later rows appear in neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchReport {
    pub policy: MatchPolicy,
    pub format: ResultFormat,
    pub expected: Vec<String>,
    pub actual: Vec<String>,
    pub pairs: Vec<MatchedPair>,
    pub missing: Vec<usize>,
    pub unexpected: Vec<usize>,
    pub matched: bool,
}

impl MatchReport {
    #[must_use]
    pub fn is_match(&self) -> bool {
        self.matched
    }

    pub fn missing_records(&self) -> impl Iterator<Item = &str> {
        self.missing.iter().map(|idx| self.expected[*idx].as_str())
    }

    pub fn unexpected_rows(&self) -> impl Iterator<Item = &str> {
        self.unexpected.iter().map(|idx| self.actual[*idx].as_str())
    }

    /// One-line description used as a mismatch reason.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "policy={} expected={} actual={} paired={} missing={} unexpected={} matched={}",
            self.policy.as_str(),
            self.expected.len(),
            self.actual.len(),
            self.pairs.len(),
            self.missing.len(),
            self.unexpected.len(),
            self.matched
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowMatcher {
    normalizer: Normalizer,
    policy: MatchPolicy,
}

impl RowMatcher {
    #[must_use]
    pub fn new(normalizer: Normalizer, policy: MatchPolicy) -> Self {
        Self { normalizer, policy }
    }

    #[must_use]
    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    #[must_use]
    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Normalizes both sides, then compares. A row that fails to parse is an
    /// error, never a non-match.
    pub fn match_rows<I, S>(
        &self,
        lines: I,
        records: &[SourceRecord],
    ) -> Result<MatchReport, MatchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let expected = records
            .iter()
            .map(|record| self.normalizer.normalize_source(record))
            .collect::<Vec<_>>();
        let actual = self.normalizer.parse_result_lines(lines)?;
        Ok(self.match_canonical(&expected, &actual))
    }

    #[must_use]
    pub fn match_canonical(
        &self,
        expected: &[CanonicalRecord],
        actual: &[CanonicalRecord],
    ) -> MatchReport {
        let expected = expected
            .iter()
            .map(CanonicalRecord::canonical_string)
            .collect::<Vec<_>>();
        let actual = actual
            .iter()
            .map(CanonicalRecord::canonical_string)
            .collect::<Vec<_>>();

        for (idx, text) in expected.iter().enumerate() {
            tracing::debug!(idx, record = %text, "expected record");
        }
        for (idx, text) in actual.iter().enumerate() {
            tracing::debug!(idx, row = %text, "result row");
        }

        let (pairs, missing, unexpected) = match self.policy {
            MatchPolicy::FirstRow => pair_first_row(&expected, &actual),
            MatchPolicy::Subset | MatchPolicy::Exact => pair_multisets(&expected, &actual),
        };
        let matched = match self.policy {
            MatchPolicy::FirstRow => !pairs.is_empty(),
            MatchPolicy::Subset => missing.is_empty(),
            MatchPolicy::Exact => missing.is_empty() && unexpected.is_empty(),
        };
        if self.policy == MatchPolicy::FirstRow {
            for pair in &pairs {
                tracing::info!(record = %expected[pair.expected_idx], "matched record");
                tracing::info!(result = %actual[pair.actual_idx], "matched result");
            }
        }

        for idx in &missing {
            tracing::debug!(record = %expected[*idx], "expected record has no result row");
        }
        for idx in &unexpected {
            tracing::debug!(row = %actual[*idx], "result row has no expected record");
        }
        tracing::info!(
            policy = self.policy.as_str(),
            expected = expected.len(),
            actual = actual.len(),
            missing = missing.len(),
            unexpected = unexpected.len(),
            matched,
            "row match verdict"
        );

        MatchReport {
            policy: self.policy,
            format: self.normalizer.options().format,
            expected,
            actual,
            pairs,
            missing,
            unexpected,
            matched,
        }
    }
}

/// First-row check: true iff the first result row equals some expected record.
pub fn match_rows<I, S>(
    lines: I,
    records: &[SourceRecord],
    format: ResultFormat,
) -> Result<bool, MatchError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let report = verify_rows(lines, records, format, MatchPolicy::FirstRow)?;
    Ok(report.is_match())
}

pub fn verify_rows<I, S>(
    lines: I,
    records: &[SourceRecord],
    format: ResultFormat,
    policy: MatchPolicy,
) -> Result<MatchReport, MatchError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    RowMatcher::new(Normalizer::for_format(format), policy).match_rows(lines, records)
}

/// Pairs row 0 with the first equal expected entry, if any.
fn pair_first_row(
    expected: &[String],
    actual: &[String],
) -> (Vec<MatchedPair>, Vec<usize>, Vec<usize>) {
    let Some(first) = actual.first() else {
        return (Vec::new(), (0..expected.len()).collect(), Vec::new());
    };
    match expected.iter().position(|record| record == first) {
        Some(expected_idx) => (
            vec![MatchedPair {
                expected_idx,
                actual_idx: 0,
            }],
            Vec::new(),
            Vec::new(),
        ),
        None => (Vec::new(), (0..expected.len()).collect(), vec![0]),
    }
}

/// Pairs each expected entry, in order, with the earliest unused equal actual
/// entry. Returns the pairs, unpaired expected indices and unpaired actual
/// indices (both ascending).
fn pair_multisets(
    expected: &[String],
    actual: &[String],
) -> (Vec<MatchedPair>, Vec<usize>, Vec<usize>) {
    let mut available = BTreeMap::<&str, VecDeque<usize>>::new();
    for (idx, text) in actual.iter().enumerate() {
        available.entry(text.as_str()).or_default().push_back(idx);
    }

    let mut pairs = Vec::new();
    let mut missing = Vec::new();
    let mut used = vec![false; actual.len()];
    for (expected_idx, text) in expected.iter().enumerate() {
        match available
            .get_mut(text.as_str())
            .and_then(VecDeque::pop_front)
        {
            Some(actual_idx) => {
                used[actual_idx] = true;
                pairs.push(MatchedPair {
                    expected_idx,
                    actual_idx,
                });
            }
            None => missing.push(expected_idx),
        }
    }

    let unexpected = used
        .iter()
        .enumerate()
        .filter(|(_, used)| !**used)
        .map(|(idx, _)| idx)
        .collect();
    (pairs, missing, unexpected)
}
