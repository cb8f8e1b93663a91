//! CSV ingestion into the row-state store.
//!
//! The loader owns schema derivation and row insertion only; it never
//! touches the tracking fields.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::error::{BatchError, Result};
use crate::store::JobStore;

/// Parse the separator flag: one ASCII character, or the literal `\t`.
pub fn parse_separator(s: &str) -> Result<u8> {
    if s == "\\t" {
        return Ok(b'\t');
    }
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii() => Ok(c as u8),
        _ => Err(BatchError::Separator(s.to_string())),
    }
}

/// Open the load input: the given file, or stdin when absent.
pub fn open_input(path: Option<&Path>) -> Result<Box<dyn Read>> {
    match path {
        Some(path) => Ok(Box::new(File::open(path)?)),
        None => Ok(Box::new(io::stdin())),
    }
}

/// Load delimiter-separated records into `store`.
///
/// The first record supplies the header and initializes the schema.
/// With `no_header`, column names `arg0..argN` are synthesized and the
/// first record is inserted as data. Returns the number of records
/// inserted.
pub fn load(store: &JobStore, input: impl Read, separator: u8, no_header: bool) -> Result<usize> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(separator)
        .has_headers(false)
        .from_reader(input);

    let mut inserted = 0usize;
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let values: Vec<String> = record.iter().map(str::to_string).collect();
        if index == 0 {
            let header: Vec<String> = if no_header {
                (0..values.len()).map(|i| format!("arg{i}")).collect()
            } else {
                values.clone()
            };
            store.init_schema(&header)?;
            if !no_header {
                continue;
            }
        }
        store.insert(&values)?;
        inserted += 1;
    }
    tracing::info!(records = inserted, "Load complete");
    Ok(inserted)
}
