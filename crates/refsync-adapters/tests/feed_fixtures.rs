use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use refsync_adapters::{parser_for_schema, ColumnMapper, FeedSchema, ParseError, RowMapper};
use refsync_core::Identity;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn load_schema() -> FeedSchema {
    let text = std::fs::read_to_string(fixture("currencies.schema.yaml")).expect("schema file");
    serde_yaml::from_str(&text).expect("schema yaml")
}

#[test]
fn currency_fixture_parses_and_maps() {
    let schema = load_schema();
    let parser = parser_for_schema(&schema).expect("parser");
    let mapper = ColumnMapper::from_schema(&schema);
    let file = File::open(fixture("currencies.psv")).expect("fixture");

    let rows: Vec<_> = parser.rows(Box::new(BufReader::new(file))).collect();
    assert_eq!(rows.len(), 5);
    assert!(matches!(
        rows[3],
        Err(ParseError::FieldCount { line: 5, expected: 5, found: 4 })
    ));

    let candidates: Vec<_> = rows
        .iter()
        .filter_map(|row| row.as_ref().ok())
        .map(|row| mapper.map(row).expect("map"))
        .collect();
    assert_eq!(candidates.len(), 4);
    assert_eq!(candidates[0].identity, Identity::new("iso-4217", "USD", ""));
    assert_eq!(candidates[2].attributes["minor_unit"], "0");
    assert!(!candidates[0].attributes.contains_key("withdrawn"));
}

#[test]
fn parsing_is_positionally_stable() {
    let schema = load_schema();
    let parser = parser_for_schema(&schema).expect("parser");
    let read = || {
        let file = File::open(fixture("currencies.psv")).expect("fixture");
        parser
            .rows(Box::new(BufReader::new(file)))
            .map(|row| row.map(|r| r.line).map_err(|e| e.line()))
            .collect::<Vec<_>>()
    };
    assert_eq!(read(), read());
}
