//! Startup checks for the sink table: a safe identifier, and a declared
//! column layout the wire format can be written into.
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static TABLE_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .expect("table name regex is valid")
});

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchemaError {
    #[error("invalid table name {0:?}, expected [schema.]table")]
    InvalidTableName(String),
    #[error("invalid column definition {0:?}, expected name:TYPE")]
    InvalidColumn(String),
    #[error("column {0} is declared twice")]
    DuplicateColumn(String),
    #[error("column {0} is missing")]
    MissingColumn(&'static str),
    #[error("column {column} has type {found}, expected one of {expected:?}")]
    IncompatibleType {
        column: &'static str,
        found: String,
        expected: &'static [&'static str],
    },
}

/// A table identifier, optionally schema qualified. Only ever interpolated
/// into SQL after passing validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableName(String);

impl TableName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TableName {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if TABLE_NAME_REGEX.is_match(s) {
            Ok(TableName(s.to_owned()))
        } else {
            Err(SchemaError::InvalidTableName(s.to_owned()))
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const STRING_TYPES: &[&str] = &["STRING", "TEXT", "VARCHAR"];
const FLOAT_TYPES: &[&str] = &["FLOAT", "FLOAT64", "NUMERIC", "DOUBLE"];
const TIMESTAMP_TYPES: &[&str] = &["TIMESTAMP", "TIMESTAMPTZ"];

/// Columns every order row needs, with the types able to hold them.
const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    ("order_id", STRING_TYPES),
    ("user_id", STRING_TYPES),
    ("product_id", STRING_TYPES),
    ("amount", FLOAT_TYPES),
    ("event_time", TIMESTAMP_TYPES),
];

/// Declared layout of the sink table, in `name:TYPE,name:TYPE` form.
///
/// Extra columns are allowed, they are left to their defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSchema {
    columns: Vec<(String, String)>,
}

impl TableSchema {
    pub fn columns(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns.iter().map(|(n, t)| (n.as_str(), t.as_str()))
    }
}

impl FromStr for TableSchema {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut columns: Vec<(String, String)> = Vec::new();
        for definition in s.split(',') {
            let (name, column_type) = definition
                .split_once(':')
                .map(|(n, t)| (n.trim(), t.trim()))
                .filter(|(n, t)| !n.is_empty() && !t.is_empty())
                .ok_or_else(|| SchemaError::InvalidColumn(definition.to_owned()))?;

            if columns.iter().any(|(existing, _)| existing == name) {
                return Err(SchemaError::DuplicateColumn(name.to_owned()));
            }
            columns.push((name.to_owned(), column_type.to_ascii_uppercase()));
        }

        let declared: HashMap<&str, &str> = columns
            .iter()
            .map(|(n, t)| (n.as_str(), t.as_str()))
            .collect();
        for (column, expected) in REQUIRED_COLUMNS {
            match declared.get(column) {
                None => return Err(SchemaError::MissingColumn(column)),
                Some(found) if !expected.contains(found) => {
                    return Err(SchemaError::IncompatibleType {
                        column,
                        found: found.to_string(),
                        expected,
                    })
                }
                Some(_) => {}
            }
        }

        Ok(TableSchema { columns })
    }
}
