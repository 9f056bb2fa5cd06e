// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tagged TOML records
//!
//! Every record in a store or module file is a TOML table with a `tag` key.
//! Decoding parses into a generic [`toml::Table`] first and then maps the tag
//! through a fixed table; anything else is rejected.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BurrowError, Result};

const TAG_KEY: &str = "tag";

/// Record kinds that may appear in a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Config,
    Router,
    CoterieModule,
    Coterie,
}

impl Tag {
    const ALL: [Tag; 4] = [Tag::Config, Tag::Router, Tag::CoterieModule, Tag::Coterie];

    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Config => "config",
            Tag::Router => "router",
            Tag::CoterieModule => "coterie-module",
            Tag::Coterie => "coterie",
        }
    }

    /// Look up a tag string; unknown strings are an error, never a fallback
    pub fn parse(s: &str) -> Result<Tag> {
        Tag::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| BurrowError::UnknownTag { tag: s.to_string() })
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse text into a generic table
pub fn parse_table(text: &str) -> Result<toml::Table> {
    Ok(text.parse::<toml::Table>()?)
}

/// Remove and check the tag of a record
pub fn take_tag(table: &mut toml::Table, expected: Tag) -> Result<()> {
    let found = match table.remove(TAG_KEY) {
        Some(toml::Value::String(s)) => Tag::parse(&s)?,
        Some(other) => {
            return Err(BurrowError::UnknownTag {
                tag: other.to_string(),
            })
        }
        None => {
            return Err(BurrowError::UnexpectedTag {
                expected: expected.to_string(),
                found: "(none)".to_string(),
            })
        }
    };

    if found != expected {
        return Err(BurrowError::UnexpectedTag {
            expected: expected.to_string(),
            found: found.to_string(),
        });
    }
    Ok(())
}

/// Remove an array of tagged child records from a table
pub fn take_records(table: &mut toml::Table, key: &str) -> Result<Vec<toml::Table>> {
    match table.remove(key) {
        None => Ok(Vec::new()),
        Some(toml::Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                toml::Value::Table(t) => Ok(t),
                other => Err(BurrowError::InvalidConfig {
                    message: format!("'{}' entries must be tables, found {}", key, other.type_str()),
                }),
            })
            .collect(),
        Some(other) => Err(BurrowError::InvalidConfig {
            message: format!("'{}' must be an array of tables, found {}", key, other.type_str()),
        }),
    }
}

/// Check the tag and decode a record into its typed form
pub fn decode<T: DeserializeOwned>(mut table: toml::Table, expected: Tag) -> Result<T> {
    take_tag(&mut table, expected)?;
    Ok(toml::Value::Table(table).try_into()?)
}

/// Encode a typed record as a tagged table
pub fn encode<T: Serialize>(value: &T, tag: Tag) -> Result<toml::Table> {
    let body = match toml::Value::try_from(value)? {
        toml::Value::Table(t) => t,
        other => {
            return Err(BurrowError::InvalidConfig {
                message: format!("'{}' record encoded as {}", tag, other.type_str()),
            })
        }
    };
    let mut table = toml::Table::new();
    table.insert(TAG_KEY.to_string(), toml::Value::String(tag.to_string()));
    for (key, value) in body {
        table.insert(key, value);
    }
    Ok(table)
}
