// SPDX-License-Identifier: AGPL-3.0-or-later
//! Placeholder substitution in coterie payloads
//!
//! `{name}` with `name` matching `[a-z_][a-z0-9_]*` is replaced by a built-in
//! credential value or a router attribute. `{{` and `}}` produce literal
//! braces; any other brace is copied through unchanged.

use crate::config::Router;
use crate::credentials;
use crate::error::{BurrowError, Result};

/// Placeholders computed from router credentials rather than attributes
pub const BUILTIN_PLACEHOLDERS: [&str; 3] = [
    "root_shadow_line",
    "authorized_keys_line",
    "http_password_sha256",
];

/// Replace every placeholder in `text` with its value for `router`
pub fn substitute(coterie: &str, text: &str, router: &Router) -> Result<String> {
    let mut shadow_line: Option<String> = None;

    expand(text, |name| {
        if name == "root_shadow_line" {
            if let Some(line) = &shadow_line {
                return Ok(line.clone());
            }
            let line = credentials::shadow_line(&credentials::shadow_hash(&router.root_password)?);
            shadow_line = Some(line.clone());
            return Ok(line);
        }
        resolve(name, router).ok_or_else(|| BurrowError::UnresolvedPlaceholder {
            coterie: coterie.to_string(),
            name: name.to_string(),
        })
    })
}

/// Names of all placeholders in `text`, in order of appearance
pub fn placeholders(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    // The collecting closure never fails.
    let _ = expand(text, |name| {
        names.push(name.to_string());
        Ok(String::new())
    });
    names
}

fn resolve(name: &str, router: &Router) -> Option<String> {
    match name {
        "authorized_keys_line" => Some(credentials::authorized_keys_line(&router.ssh_public_key)),
        "http_password_sha256" => Some(credentials::http_password_sha256(&router.root_password)),
        _ => router.attribute(name),
    }
}

fn expand<F>(text: &str, mut lookup: F) -> Result<String>
where
    F: FnMut(&str) -> Result<String>,
{
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match (bytes[i], bytes.get(i + 1)) {
            (b'{', Some(b'{')) | (b'}', Some(b'}')) => {
                out.push_str(&text[literal_start..i]);
                out.push(bytes[i] as char);
                i += 2;
                literal_start = i;
            }
            (b'{', _) => match placeholder_len(&bytes[i + 1..]) {
                Some(len) => {
                    out.push_str(&text[literal_start..i]);
                    out.push_str(&lookup(&text[i + 1..i + 1 + len])?);
                    i += len + 2;
                    literal_start = i;
                }
                None => i += 1,
            },
            _ => i += 1,
        }
    }

    out.push_str(&text[literal_start..]);
    Ok(out)
}

/// Length of a placeholder name at the start of `rest`, if it is closed by `}`
fn placeholder_len(rest: &[u8]) -> Option<usize> {
    let first = *rest.first()?;
    if !(first.is_ascii_lowercase() || first == b'_') {
        return None;
    }
    let len = rest
        .iter()
        .take_while(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || **b == b'_')
        .count();
    (rest.get(len) == Some(&b'}')).then_some(len)
}
