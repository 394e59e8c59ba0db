#![forbid(unsafe_code)]

//! Record equivalence for sink-connector tests.
//!
//! Expected records and store result lines are both reduced to canonical
//! field maps, then compared under a [`MatchPolicy`]. [`Verifier`] wraps a
//! [`QueryExecutor`] with the per-call timeouts used by the test harness.

pub use sc_match::{
    MatchError, MatchPolicy, MatchReport, MatchedPair, RowMatcher, match_rows, verify_rows,
};
pub use sc_normalize::{
    CanonicalRecord, ESCAPED_EQUALS, NormalizeError, NormalizeOptions, Normalizer, NumericRule,
    ResultFormat, canonicalize_numeric, cleanup_text, escape_equals, field_value_from_json,
    rewrite_escaped_equals,
};
#[cfg(feature = "sql-sqlite")]
pub use sc_store::SqliteExecutor;
pub use sc_store::{
    EMOJI_PATTERN, QueryExecutor, QueryOptions, StoreError, StoreTimeouts, Verifier, bounded,
    quote_identifier,
};
pub use sc_types::{
    FieldDescriptor, FieldType, FieldValue, Schema, SourceRecord, StructRecord, TypeError,
};
