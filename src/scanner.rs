//! Log line scanner: applies a compiled format pattern to raw lines.

use regex::Regex;

use crate::error::Result;
use crate::logformat::{self, FieldDef, FieldKind};
use crate::types::{Record, Schema, Value};

/// Scans log lines using the pattern compiled from a `LogFormat` template.
///
/// The scanner is shared read-only across pool workers; `regex::Regex` is
/// internally reference-counted and safe for concurrent matching.
#[derive(Debug, Clone)]
pub struct Scanner {
    regex: Regex,
    /// Ordered field definitions; this is the record schema.
    pub fields: Vec<FieldDef>,
}

impl Scanner {
    /// Compile a `LogFormat` template into a ready-to-run scanner.
    pub fn from_format(fmt: &str) -> Result<Self> {
        let compiled = logformat::compile(fmt)?;
        let regex = Regex::new(&compiled.pattern)?;
        Ok(Self {
            regex,
            fields: compiled.fields,
        })
    }

    pub fn schema(&self) -> Schema {
        Schema::new(self.fields.clone())
    }

    /// Scan one line. Lines that do not match the pattern yield `None` and
    /// are dropped by the caller.
    ///
    /// Numeric fields are coerced to integers; the `-` arm of `%b` (and any
    /// other unparseable numeric capture) extracts as 0 so a field's value
    /// kind stays stable across the dataset.
    pub fn scan(&self, line: &str) -> Option<Record> {
        let caps = self.regex.captures(line)?;
        let record = self
            .fields
            .iter()
            .map(|f| {
                let text = caps.name(&f.name).map(|m| m.as_str()).unwrap_or_default();
                match f.kind {
                    FieldKind::Int => Value::Int(text.parse().unwrap_or(0)),
                    FieldKind::Str | FieldKind::Date => Value::Str(text.to_string()),
                }
            })
            .collect();
        Some(record)
    }

    /// Scan a chunk of lines, dropping non-matching ones. Runs inside a pool
    /// map stage.
    pub fn scan_chunk(&self, lines: &[String]) -> Vec<Record> {
        lines.iter().filter_map(|line| self.scan(line)).collect()
    }
}
