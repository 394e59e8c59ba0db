#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use sc_types::{FieldValue, SourceRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The escape sequence some stores emit for `=` inside string-quoted output.
pub const ESCAPED_EQUALS: &str = "\u{5c}u003d";

static PLAIN_DECIMAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-?[0-9]+\.[0-9]+$").expect("plain decimal pattern is valid")
});

/// Row serialization requested from the store, one object per line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultFormat {
    /// Values keep their JSON type: `{"a":1,"b":"x"}`.
    JsonEachRow,
    /// Every value is a JSON string: `{"a":"1","b":"x"}`.
    JsonStringsEachRow,
}

impl ResultFormat {
    /// Format name as the store spells it in query settings.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JsonEachRow => "JSONEachRow",
            Self::JsonStringsEachRow => "JSONStringsEachRow",
        }
    }

    /// The string-quoted format escapes `=` inside values; only it needs the
    /// escaped-equals rewrite.
    #[must_use]
    pub fn rewrites_escaped_equals(self) -> bool {
        matches!(self, Self::JsonStringsEachRow)
    }
}

impl fmt::Display for ResultFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericRule {
    /// Strip trailing fractional zeros only from values that are plain decimals.
    #[default]
    ValueScoped,
    /// Remove every `.0` substring from values, numeric or not.
    LegacySubstring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeOptions {
    pub format: ResultFormat,
    #[serde(default)]
    pub numeric_rule: NumericRule,
}

impl NormalizeOptions {
    #[must_use]
    pub fn for_format(format: ResultFormat) -> Self {
        Self {
            format,
            numeric_rule: NumericRule::default(),
        }
    }
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self::for_format(ResultFormat::JsonStringsEachRow)
    }
}

/// Field name to cleaned text value, keys sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalRecord {
    fields: BTreeMap<String, String>,
}

impl CanonicalRecord {
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Compact key-sorted JSON text. Byte-identical for equal records.
    #[must_use]
    pub fn canonical_string(&self) -> String {
        let object = self
            .fields
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect::<serde_json::Map<_, _>>();
        Value::Object(object).to_string()
    }
}

impl fmt::Display for CanonicalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("result row {line} cannot be parsed as an object: {reason}")]
    Parse { line: usize, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Normalizer {
    options: NormalizeOptions,
}

impl Normalizer {
    #[must_use]
    pub fn new(options: NormalizeOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub fn for_format(format: ResultFormat) -> Self {
        Self::new(NormalizeOptions::for_format(format))
    }

    #[must_use]
    pub fn options(&self) -> NormalizeOptions {
        self.options
    }

    /// Never fails: missing or extra fields are the matcher's concern.
    #[must_use]
    pub fn normalize_source(&self, record: &SourceRecord) -> CanonicalRecord {
        self.collect(record.to_canonical_mapping())
    }

    /// `line` is 1-based and only used for error reporting.
    pub fn parse_result_row(
        &self,
        line: usize,
        text: &str,
    ) -> Result<CanonicalRecord, NormalizeError> {
        let value: Value = serde_json::from_str(text).map_err(|err| NormalizeError::Parse {
            line,
            reason: err.to_string(),
        })?;
        let object = match value {
            Value::Object(object) => object,
            other => {
                return Err(NormalizeError::Parse {
                    line,
                    reason: format!("expected a JSON object, found {}", json_kind(&other)),
                });
            }
        };

        Ok(self.collect(
            object
                .into_iter()
                .map(|(key, value)| (key, json_text(value))),
        ))
    }

    /// Blank lines are skipped; numbering still counts them.
    pub fn parse_result_lines<I, S>(
        &self,
        lines: I,
    ) -> Result<Vec<CanonicalRecord>, NormalizeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = Vec::new();
        for (idx, text) in lines.into_iter().enumerate() {
            let text = text.as_ref();
            if text.trim().is_empty() {
                continue;
            }
            out.push(self.parse_result_row(idx + 1, text)?);
        }
        Ok(out)
    }

    /// Field names get the textual rules only; values also get the numeric rule.
    /// Names that collide after cleanup resolve to the value of the greatest raw
    /// name, so column order never decides the outcome.
    fn collect<I>(&self, entries: I) -> CanonicalRecord
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut entries = entries.into_iter().collect::<Vec<_>>();
        entries.sort_by(|left, right| left.0.cmp(&right.0));
        let fields = entries
            .into_iter()
            .map(|(key, value)| (self.clean(&key), self.clean_value(&value)))
            .collect();
        CanonicalRecord { fields }
    }

    fn clean(&self, text: &str) -> String {
        let stripped = cleanup_text(text);
        if self.options.format.rewrites_escaped_equals() {
            rewrite_escaped_equals(&escape_equals(&stripped))
        } else {
            stripped
        }
    }

    fn clean_value(&self, text: &str) -> String {
        let cleaned = self.clean(text);
        match self.options.numeric_rule {
            NumericRule::ValueScoped => canonicalize_numeric(&cleaned).to_owned(),
            NumericRule::LegacySubstring => cleaned.replace(".0", ""),
        }
    }
}

/// Drops space and single-quote characters.
#[must_use]
pub fn cleanup_text(text: &str) -> String {
    text.chars().filter(|ch| *ch != ' ' && *ch != '\'').collect()
}

/// `3.0` -> `3`, `2.50` -> `2.5`, `30.0` -> `30`. Anything that is not a
/// plain decimal is returned untouched.
#[must_use]
pub fn canonicalize_numeric(text: &str) -> &str {
    if !PLAIN_DECIMAL.is_match(text) {
        return text;
    }
    text.trim_end_matches('0').trim_end_matches('.')
}

/// Escapes `=` the way the string-quoted store output does.
#[must_use]
pub fn escape_equals(text: &str) -> String {
    text.replace('=', ESCAPED_EQUALS)
}

#[must_use]
pub fn rewrite_escaped_equals(text: &str) -> String {
    text.replace(ESCAPED_EQUALS, ":")
}

/// Reads a typed JSON value the way a source record would carry it. Integers
/// that fit `i64` stay integers; every other number becomes `Float64`.
#[must_use]
pub fn field_value_from_json(value: Value) -> FieldValue {
    match value {
        Value::Null => FieldValue::Null,
        Value::Bool(v) => FieldValue::Bool(v),
        Value::Number(n) => match n.as_i64() {
            Some(v) => FieldValue::Int64(v),
            None => n.as_f64().map_or(FieldValue::Null, FieldValue::Float64),
        },
        Value::String(v) => FieldValue::Utf8(v),
        Value::Array(items) => {
            FieldValue::Array(items.into_iter().map(field_value_from_json).collect())
        }
        Value::Object(entries) => FieldValue::Map(
            entries
                .into_iter()
                .map(|(key, value)| (key, field_value_from_json(value)))
                .collect(),
        ),
    }
}

/// Scalars keep their JSON spelling; arrays and objects take the source text
/// form (`[a, b]`, `{k=v}`) so composite columns compare like source values.
fn json_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Null => "null".to_owned(),
        Value::Bool(v) => v.to_string(),
        Value::Number(n) => n.to_string(),
        composite @ (Value::Array(_) | Value::Object(_)) => {
            field_value_from_json(composite).to_text()
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;
    use sc_types::{FieldDescriptor, FieldType, FieldValue, Schema, SourceRecord, StructRecord};

    use super::{
        ESCAPED_EQUALS, NormalizeError, NormalizeOptions, Normalizer, NumericRule, ResultFormat,
        canonicalize_numeric, cleanup_text, field_value_from_json,
    };

    fn strings() -> Normalizer {
        Normalizer::for_format(ResultFormat::JsonStringsEachRow)
    }

    fn one_value(normalizer: &Normalizer, value: impl Into<FieldValue>) -> String {
        let record = SourceRecord::flat([("v", value.into())]);
        normalizer
            .normalize_source(&record)
            .get("v")
            .expect("field v")
            .to_owned()
    }

    #[test]
    fn field_order_does_not_change_canonical_string() {
        let left = SourceRecord::flat([("a", "1"), ("b", "2"), ("c", "3")]);
        let right = SourceRecord::flat([("c", "3"), ("a", "1"), ("b", "2")]);
        let normalizer = strings();
        assert_eq!(
            normalizer.normalize_source(&left).canonical_string(),
            normalizer.normalize_source(&right).canonical_string()
        );
    }

    #[test]
    fn flat_and_structured_records_share_canonical_form() {
        let flat = SourceRecord::flat([("a", "1"), ("b", "2")]);
        let schema = Schema::new(vec![
            FieldDescriptor::required("b", FieldType::Int64),
            FieldDescriptor::required("a", FieldType::Int64),
        ])
        .expect("schema");
        let structured: SourceRecord =
            StructRecord::new(schema, vec![FieldValue::Int64(2), FieldValue::Int64(1)])
                .expect("struct")
                .into();

        let normalizer = strings();
        let canonical = normalizer.normalize_source(&flat).canonical_string();
        assert_eq!(canonical, r#"{"a":"1","b":"2"}"#);
        assert_eq!(normalizer.normalize_source(&structured).canonical_string(), canonical);
    }

    #[test]
    fn trailing_zero_rule_is_value_scoped() {
        let normalizer = strings();
        assert_eq!(one_value(&normalizer, "3.0"), one_value(&normalizer, "3"));
        assert_ne!(one_value(&normalizer, "30.0"), one_value(&normalizer, "3"));
        assert_eq!(one_value(&normalizer, "2.50"), "2.5");
        assert_eq!(one_value(&normalizer, "v1.0.3"), "v1.0.3");
        assert_eq!(one_value(&normalizer, "10.05"), "10.05");
    }

    #[test]
    fn legacy_numeric_rule_strips_every_dot_zero() {
        let normalizer = Normalizer::new(NormalizeOptions {
            format: ResultFormat::JsonStringsEachRow,
            numeric_rule: NumericRule::LegacySubstring,
        });
        assert_eq!(one_value(&normalizer, "3.0"), "3");
        assert_eq!(one_value(&normalizer, "v1.0.3"), "v1.3");
    }

    #[test]
    fn canonicalize_numeric_leaves_non_decimals_alone() {
        assert_eq!(canonicalize_numeric("100.000"), "100");
        assert_eq!(canonicalize_numeric("-0.0"), "-0");
        assert_eq!(canonicalize_numeric("1e5"), "1e5");
        assert_eq!(canonicalize_numeric("abc.0"), "abc.0");
        assert_eq!(canonicalize_numeric("7"), "7");
    }

    #[test]
    fn spaces_and_single_quotes_are_stripped() {
        assert_eq!(cleanup_text("{'k': 'v w'}"), "{k:vw}");
        let normalizer = strings();
        assert_eq!(one_value(&normalizer, "it's here"), "itshere");
    }

    #[test]
    fn escaped_equals_rewrite_is_scoped_to_string_format() {
        let mut map = BTreeMap::new();
        map.insert("k".to_owned(), FieldValue::Int64(1));
        let source = SourceRecord::flat([("m", FieldValue::Map(map))]);

        let line = format!(r#"{{"m":"{{'k'{ESCAPED_EQUALS}1}}"}}"#);
        let store_line = r#"{"m":"{'k':1}"}"#;

        let normalizer = strings();
        let expected = normalizer.normalize_source(&source);
        assert_eq!(expected.get("m"), Some("{k:1}"));
        assert_eq!(normalizer.parse_result_row(1, &line).expect("row"), expected);
        assert_eq!(normalizer.parse_result_row(1, store_line).expect("row"), expected);

        let typed = Normalizer::for_format(ResultFormat::JsonEachRow);
        assert_eq!(typed.normalize_source(&source).get("m"), Some("{k=1}"));
    }

    #[test]
    fn result_row_values_are_rendered_as_text() {
        let normalizer = Normalizer::for_format(ResultFormat::JsonEachRow);
        let row = normalizer
            .parse_result_row(1, r#"{"b":2.0,"a":true,"c":null,"d":[1,2],"e":"x y"}"#)
            .expect("row");
        assert_eq!(
            row.canonical_string(),
            r#"{"a":"true","b":"2","c":"null","d":"[1,2]","e":"xy"}"#
        );
    }

    #[test]
    fn colliding_names_resolve_independently_of_column_order() {
        let normalizer = strings();
        let forward = normalizer
            .parse_result_row(1, r#"{"a b":"1","ab":"2"}"#)
            .expect("row");
        let swapped = normalizer
            .parse_result_row(1, r#"{"ab":"2","a b":"1"}"#)
            .expect("row");
        assert_eq!(forward, swapped);
        assert_eq!(forward.get("ab"), Some("2"));

        let source = SourceRecord::flat([("ab", "2"), ("a b", "1")]);
        assert_eq!(normalizer.normalize_source(&source), forward);
    }

    #[test]
    fn typed_composites_take_source_text_form() {
        let typed = Normalizer::for_format(ResultFormat::JsonEachRow);
        let mut map = BTreeMap::new();
        map.insert("k".to_owned(), FieldValue::Float64(3.0));
        map.insert("j".to_owned(), FieldValue::from("x"));
        let source = SourceRecord::flat([
            (
                "xs",
                FieldValue::Array(vec![FieldValue::from("a"), FieldValue::Int64(2)]),
            ),
            ("m", FieldValue::Map(map)),
        ]);
        let row = typed
            .parse_result_row(1, r#"{"m":{"k":3.0,"j":"x"},"xs":["a",2]}"#)
            .expect("row");
        assert_eq!(row.get("xs"), Some("[a,2]"));
        assert_eq!(row.get("m"), Some("{j=x,k=3}"));
        assert_eq!(row, typed.normalize_source(&source));
    }

    #[test]
    fn json_numbers_keep_integer_shape() {
        assert_eq!(field_value_from_json(serde_json::json!(7)), FieldValue::Int64(7));
        assert_eq!(field_value_from_json(serde_json::json!(2.5)), FieldValue::Float64(2.5));
        assert_eq!(field_value_from_json(serde_json::json!(null)), FieldValue::Null);
        let nested = field_value_from_json(serde_json::json!({"k": [1, "x"]}));
        assert_eq!(nested.to_text(), "{k=[1, x]}");
    }

    #[test]
    fn typed_and_string_rows_agree_with_source() {
        let source =
            SourceRecord::flat([("a", FieldValue::Int64(1)), ("b", FieldValue::Float64(2.5))]);
        let typed = Normalizer::for_format(ResultFormat::JsonEachRow);
        let quoted = strings();
        assert_eq!(
            typed.parse_result_row(1, r#"{"a":1,"b":2.5}"#).expect("typed"),
            typed.normalize_source(&source)
        );
        assert_eq!(
            quoted.parse_result_row(1, r#"{"a":"1","b":"2.50"}"#).expect("quoted"),
            quoted.normalize_source(&source)
        );
    }

    #[test]
    fn malformed_row_is_a_parse_error() {
        let err = strings()
            .parse_result_row(4, r#"{"a":"1","b":"2""#)
            .expect_err("unterminated object");
        let NormalizeError::Parse { line, .. } = err;
        assert_eq!(line, 4);

        let err = strings().parse_result_row(1, "[1,2]").expect_err("array");
        assert!(err.to_string().contains("found array"), "{err}");
    }

    #[test]
    fn parse_result_lines_skips_blank_lines_but_keeps_numbering() {
        let lines = [r#"{"a":"1"}"#, "", "  ", "{oops"];
        let err = strings().parse_result_lines(lines).expect_err("line 4 is bad");
        assert!(matches!(err, NormalizeError::Parse { line: 4, .. }), "{err}");

        let rows = strings()
            .parse_result_lines([r#"{"a":"1"}"#, "", r#"{"a":"2"}"#])
            .expect("rows");
        assert_eq!(rows.len(), 2);
    }

    proptest! {
        #[test]
        fn canonical_string_ignores_insertion_order(
            entries in prop::collection::btree_map("[a-z]{1,6}", "[a-z0-9 .']{0,8}", 0..8)
        ) {
            let forward = SourceRecord::flat(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
            let backward =
                SourceRecord::flat(entries.iter().rev().map(|(k, v)| (k.clone(), v.clone())));
            let normalizer = strings();
            prop_assert_eq!(
                normalizer.normalize_source(&forward).canonical_string(),
                normalizer.normalize_source(&backward).canonical_string()
            );
        }

        #[test]
        fn cleanup_is_idempotent(text in ".{0,24}") {
            let once = cleanup_text(&text);
            prop_assert_eq!(cleanup_text(&once), once.clone());
            let numeric = canonicalize_numeric(&once).to_owned();
            prop_assert_eq!(canonicalize_numeric(&numeric), numeric.as_str());
        }
    }
}
