//! Feed parser and row mapper contracts, with the JSON-lines and delimited-text implementations.
//!
//! The reconciliation core only sees [`FeedParser`] and [`RowMapper`]; any other wire
//! format or field mapping can be swapped in behind them.

use std::collections::BTreeMap;
use std::io::BufRead;

use refsync_core::{Attributes, CandidateEntity, Identity};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "refsync-adapters";

/// One raw row as produced by a parser. `line` is the 1-based physical line in the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRecord {
    pub line: u64,
    pub fields: BTreeMap<String, String>,
}

impl RowRecord {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("line {line}: invalid utf-8")]
    InvalidUtf8 { line: u64 },
    #[error("line {line}: {reason}")]
    Malformed { line: u64, reason: String },
    #[error("line {line}: expected {expected} fields, found {found}")]
    FieldCount {
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("line {line}: read failed: {reason}")]
    Io { line: u64, reason: String },
}

impl ParseError {
    pub fn line(&self) -> u64 {
        match self {
            Self::InvalidUtf8 { line }
            | Self::Malformed { line, .. }
            | Self::FieldCount { line, .. }
            | Self::Io { line, .. } => *line,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("line {line}: missing column `{column}`")]
    MissingColumn { line: u64, column: String },
    #[error("line {line}: column `{column}` is empty")]
    EmptyValue { line: u64, column: String },
}

impl TransformError {
    pub fn line(&self) -> u64 {
        match self {
            Self::MissingColumn { line, .. } | Self::EmptyValue { line, .. } => *line,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("delimited feeds without a header need an explicit `columns` list")]
    MissingColumns,
    #[error("delimiter must not be a newline")]
    InvalidDelimiter,
}

pub type RowIter<'a> = Box<dyn Iterator<Item = Result<RowRecord, ParseError>> + Send + 'a>;

/// Turns feed bytes into a lazy, positionally stable sequence of rows.
///
/// The same bytes must always yield the same sequence: checkpoints count items from
/// this iterator, errors included.
pub trait FeedParser: Send + Sync {
    fn rows<'a>(&'a self, reader: Box<dyn BufRead + Send + 'a>) -> RowIter<'a>;
}

/// Maps a raw row onto the entity shape. Must be pure.
pub trait RowMapper: Send + Sync {
    /// Identity extraction only; used by the pre-check pass.
    fn identity(&self, row: &RowRecord) -> Result<Identity, TransformError>;

    fn map(&self, row: &RowRecord) -> Result<CandidateEntity, TransformError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FeedFormat {
    JsonLines,
    Delimited {
        #[serde(default = "default_delimiter")]
        delimiter: char,
        #[serde(default = "default_has_header")]
        has_header: bool,
    },
}

fn default_delimiter() -> char {
    '|'
}

fn default_has_header() -> bool {
    true
}

/// Where one identity component comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Column { column: String },
    Literal { value: String },
}

impl KeyPart {
    pub fn column(name: &str) -> Self {
        Self::Column {
            column: name.to_string(),
        }
    }

    pub fn literal(value: &str) -> Self {
        Self::Literal {
            value: value.to_string(),
        }
    }

    fn column_name(&self) -> Option<&str> {
        match self {
            Self::Column { column } => Some(column),
            Self::Literal { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySpec {
    pub domain: KeyPart,
    pub code: KeyPart,
    #[serde(default = "default_qualifier")]
    pub qualifier: KeyPart,
}

fn default_qualifier() -> KeyPart {
    KeyPart::literal("")
}

impl Default for IdentitySpec {
    fn default() -> Self {
        Self {
            domain: KeyPart::column("domain"),
            code: KeyPart::column("code"),
            qualifier: default_qualifier(),
        }
    }
}

/// Schema description handed to the parser and mapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSchema {
    pub format: FeedFormat,
    /// Column names for headerless delimited feeds.
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub identity: IdentitySpec,
    /// Attribute columns to keep. `None` keeps every non-identity column.
    #[serde(default)]
    pub attributes: Option<Vec<String>>,
    /// Attribute columns that must be present and non-empty.
    #[serde(default)]
    pub required: Vec<String>,
}

impl Default for FeedSchema {
    fn default() -> Self {
        Self {
            format: FeedFormat::JsonLines,
            columns: Vec::new(),
            identity: IdentitySpec::default(),
            attributes: None,
            required: Vec::new(),
        }
    }
}

impl FeedSchema {
    pub fn validate(&self) -> Result<(), SchemaError> {
        if let FeedFormat::Delimited {
            delimiter,
            has_header,
        } = &self.format
        {
            if *delimiter == '\n' || *delimiter == '\r' {
                return Err(SchemaError::InvalidDelimiter);
            }
            if !has_header && self.columns.is_empty() {
                return Err(SchemaError::MissingColumns);
            }
        }
        Ok(())
    }
}

pub fn parser_for_schema(schema: &FeedSchema) -> Result<Box<dyn FeedParser>, SchemaError> {
    schema.validate()?;
    Ok(match &schema.format {
        FeedFormat::JsonLines => Box::new(JsonLinesParser),
        FeedFormat::Delimited {
            delimiter,
            has_header,
        } => Box::new(DelimitedParser {
            delimiter: *delimiter,
            has_header: *has_header,
            columns: schema.columns.clone(),
        }),
    })
}

/// Non-blank physical lines with their 1-based line numbers. Stops after a hard read error.
struct Lines<'a> {
    reader: Box<dyn BufRead + Send + 'a>,
    line_no: u64,
    buf: Vec<u8>,
    done: bool,
}

impl<'a> Lines<'a> {
    fn new(reader: Box<dyn BufRead + Send + 'a>) -> Self {
        Self {
            reader,
            line_no: 0,
            buf: Vec::new(),
            done: false,
        }
    }
}

impl Iterator for Lines<'_> {
    type Item = (u64, Result<String, ParseError>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {
                    self.line_no += 1;
                    while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
                        self.buf.pop();
                    }
                    let line = self.line_no;
                    match std::str::from_utf8(&self.buf) {
                        Ok(text) if text.trim().is_empty() => continue,
                        Ok(text) => return Some((line, Ok(text.to_string()))),
                        Err(_) => return Some((line, Err(ParseError::InvalidUtf8 { line }))),
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.done = true;
                    self.line_no += 1;
                    return Some((
                        self.line_no,
                        Err(ParseError::Io {
                            line: self.line_no,
                            reason: err.to_string(),
                        }),
                    ));
                }
            }
        }
    }
}

/// One JSON object per line. Scalars become strings; nulls are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesParser;

fn json_scalar_to_string(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        other @ (JsonValue::Array(_) | JsonValue::Object(_)) => Some(other.to_string()),
    }
}

fn parse_json_line(line: u64, text: &str) -> Result<RowRecord, ParseError> {
    let value: JsonValue = serde_json::from_str(text).map_err(|err| ParseError::Malformed {
        line,
        reason: err.to_string(),
    })?;
    let JsonValue::Object(map) = value else {
        return Err(ParseError::Malformed {
            line,
            reason: "expected a JSON object".to_string(),
        });
    };
    let fields = map
        .into_iter()
        .filter_map(|(key, value)| json_scalar_to_string(value).map(|v| (key, v)))
        .collect();
    Ok(RowRecord { line, fields })
}

impl FeedParser for JsonLinesParser {
    fn rows<'a>(&'a self, reader: Box<dyn BufRead + Send + 'a>) -> RowIter<'a> {
        Box::new(
            Lines::new(reader).map(|(line, text)| text.and_then(|t| parse_json_line(line, &t))),
        )
    }
}

/// Delimiter-separated text without quoting, e.g. pipe-separated reference lists.
#[derive(Debug, Clone)]
pub struct DelimitedParser {
    pub delimiter: char,
    pub has_header: bool,
    pub columns: Vec<String>,
}

struct DelimitedRows<'a> {
    lines: Lines<'a>,
    delimiter: char,
    header: Option<Vec<String>>,
    read_header: bool,
}

impl DelimitedRows<'_> {
    fn split(&self, text: &str) -> Vec<String> {
        text.split(self.delimiter)
            .map(|field| field.trim().to_string())
            .collect()
    }
}

impl Iterator for DelimitedRows<'_> {
    type Item = Result<RowRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.read_header {
            self.read_header = false;
            match self.lines.next()? {
                (_, Ok(text)) => self.header = Some(self.split(&text)),
                (line, Err(err)) => {
                    // Without a header no later row can be named; end the stream here.
                    self.lines.done = true;
                    let reason = format!("unreadable header: {err}");
                    return Some(Err(ParseError::Malformed { line, reason }));
                }
            }
        }

        let (line, text) = self.lines.next()?;
        let header = self.header.as_deref().unwrap_or_default();
        Some(text.and_then(|text| {
            let values = self.split(&text);
            if values.len() != header.len() {
                return Err(ParseError::FieldCount {
                    line,
                    expected: header.len(),
                    found: values.len(),
                });
            }
            let fields = header
                .iter()
                .cloned()
                .zip(values)
                .collect();
            Ok(RowRecord { line, fields })
        }))
    }
}

impl FeedParser for DelimitedParser {
    fn rows<'a>(&'a self, reader: Box<dyn BufRead + Send + 'a>) -> RowIter<'a> {
        Box::new(DelimitedRows {
            lines: Lines::new(reader),
            delimiter: self.delimiter,
            header: (!self.has_header).then(|| self.columns.clone()),
            read_header: self.has_header,
        })
    }
}

/// Schema-driven mapper: identity from [`IdentitySpec`], attributes from the remaining columns.
#[derive(Debug, Clone)]
pub struct ColumnMapper {
    identity: IdentitySpec,
    attributes: Option<Vec<String>>,
    required: Vec<String>,
}

impl ColumnMapper {
    pub fn from_schema(schema: &FeedSchema) -> Self {
        Self {
            identity: schema.identity.clone(),
            attributes: schema.attributes.clone(),
            required: schema.required.clone(),
        }
    }

    fn key_part(&self, part: &KeyPart, row: &RowRecord) -> Result<String, TransformError> {
        match part {
            KeyPart::Literal { value } => Ok(value.clone()),
            KeyPart::Column { column } => row
                .get(column)
                .map(|v| v.trim().to_string())
                .ok_or_else(|| TransformError::MissingColumn {
                    line: row.line,
                    column: column.clone(),
                }),
        }
    }

    fn is_identity_column(&self, name: &str) -> bool {
        [&self.identity.domain, &self.identity.code, &self.identity.qualifier]
            .iter()
            .any(|part| part.column_name() == Some(name))
    }
}

impl RowMapper for ColumnMapper {
    fn identity(&self, row: &RowRecord) -> Result<Identity, TransformError> {
        let domain = self.key_part(&self.identity.domain, row)?;
        let code = self.key_part(&self.identity.code, row)?;
        let qualifier = self.key_part(&self.identity.qualifier, row)?;
        if code.is_empty() {
            return Err(TransformError::EmptyValue {
                line: row.line,
                column: self
                    .identity
                    .code
                    .column_name()
                    .unwrap_or("code")
                    .to_string(),
            });
        }
        Ok(Identity::new(domain, code, qualifier))
    }

    fn map(&self, row: &RowRecord) -> Result<CandidateEntity, TransformError> {
        let identity = self.identity(row)?;

        for column in &self.required {
            match row.get(column) {
                None => {
                    return Err(TransformError::MissingColumn {
                        line: row.line,
                        column: column.clone(),
                    })
                }
                Some(value) if value.trim().is_empty() => {
                    return Err(TransformError::EmptyValue {
                        line: row.line,
                        column: column.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        let attributes: Attributes = match &self.attributes {
            Some(selected) => selected
                .iter()
                .filter_map(|column| row.get(column).map(|v| (column.clone(), v.to_string())))
                .collect(),
            None => row
                .fields
                .iter()
                .filter(|(name, _)| !self.is_identity_column(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        };

        Ok(CandidateEntity {
            identity,
            attributes,
            source_line: row.line,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(text: &'static str) -> Box<dyn BufRead + Send + 'static> {
        Box::new(Cursor::new(text.as_bytes()))
    }

    fn collect(parser: &dyn FeedParser, text: &'static str) -> Vec<Result<RowRecord, ParseError>> {
        parser.rows(reader(text)).collect()
    }

    #[test]
    fn json_lines_skip_blank_lines_and_report_bad_ones() {
        let rows = collect(
            &JsonLinesParser,
            "{\"domain\":\"iso\",\"code\":\"USD\",\"minor\":2}\n\n[1,2]\n{\"code\":\"EU",
        );
        assert_eq!(rows.len(), 3);
        let first = rows[0].as_ref().expect("row");
        assert_eq!(first.line, 1);
        assert_eq!(first.get("minor"), Some("2"));
        assert!(matches!(rows[1], Err(ParseError::Malformed { line: 3, .. })));
        assert!(matches!(rows[2], Err(ParseError::Malformed { line: 4, .. })));
    }

    #[test]
    fn json_nulls_are_dropped() {
        let rows = collect(&JsonLinesParser, "{\"code\":\"USD\",\"withdrawn\":null}\n");
        let row = rows[0].as_ref().expect("row");
        assert!(row.get("withdrawn").is_none());
    }

    #[test]
    fn invalid_utf8_is_a_row_error_not_the_end_of_stream() {
        let bytes: &'static [u8] = b"{\"code\":\"A\"}\n\xff\xfe\n{\"code\":\"B\"}\n";
        let rows: Vec<_> = JsonLinesParser.rows(Box::new(Cursor::new(bytes))).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], Err(ParseError::InvalidUtf8 { line: 2 }));
        assert_eq!(rows[2].as_ref().expect("row").get("code"), Some("B"));
    }

    #[test]
    fn delimited_rows_use_header_and_check_arity() {
        let parser = DelimitedParser {
            delimiter: '|',
            has_header: true,
            columns: vec![],
        };
        let rows = collect(&parser, "code|name|minor\r\nUSD|US Dollar|2\r\nEUR|Euro\r\n");
        assert_eq!(rows.len(), 2);
        let usd = rows[0].as_ref().expect("row");
        assert_eq!(usd.line, 2);
        assert_eq!(usd.get("name"), Some("US Dollar"));
        assert_eq!(
            rows[1],
            Err(ParseError::FieldCount {
                line: 3,
                expected: 3,
                found: 2
            })
        );
    }

    #[test]
    fn headerless_delimited_needs_columns() {
        let schema = FeedSchema {
            format: FeedFormat::Delimited {
                delimiter: ',',
                has_header: false,
            },
            ..FeedSchema::default()
        };
        assert_eq!(schema.validate(), Err(SchemaError::MissingColumns));
    }

    #[test]
    fn mapper_splits_identity_and_attributes() {
        let schema = FeedSchema {
            identity: IdentitySpec {
                domain: KeyPart::literal("iso-4217"),
                code: KeyPart::column("code"),
                qualifier: KeyPart::literal(""),
            },
            required: vec!["name".to_string()],
            ..FeedSchema::default()
        };
        let mapper = ColumnMapper::from_schema(&schema);
        let row = RowRecord {
            line: 9,
            fields: BTreeMap::from([
                ("code".to_string(), " USD ".to_string()),
                ("name".to_string(), "US Dollar".to_string()),
            ]),
        };
        let candidate = mapper.map(&row).expect("map");
        assert_eq!(candidate.identity, Identity::new("iso-4217", "USD", ""));
        assert_eq!(candidate.source_line, 9);
        assert_eq!(candidate.attributes.len(), 1);
        assert_eq!(candidate.attributes["name"], "US Dollar");
    }

    #[test]
    fn mapper_rejects_missing_required_and_identity_columns() {
        let mapper = ColumnMapper::from_schema(&FeedSchema {
            required: vec!["name".to_string()],
            ..FeedSchema::default()
        });
        let row = RowRecord {
            line: 4,
            fields: BTreeMap::from([
                ("domain".to_string(), "iso".to_string()),
                ("code".to_string(), "USD".to_string()),
                ("qualifier".to_string(), "".to_string()),
            ]),
        };
        assert_eq!(
            mapper.map(&row),
            Err(TransformError::MissingColumn {
                line: 4,
                column: "name".to_string()
            })
        );

        let no_code = RowRecord {
            line: 5,
            fields: BTreeMap::from([("domain".to_string(), "iso".to_string())]),
        };
        assert!(matches!(
            mapper.identity(&no_code),
            Err(TransformError::MissingColumn { line: 5, .. })
        ));
    }
}
