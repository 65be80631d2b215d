//! Normalisation of the loosely typed form fields sent to `/predict`.
//!
//! Clients submit the drug list either as a JSON array (`["Warfarin", "Clopidogrel"]`)
//! or as a plain comma separated string (`Warfarin, Clopidogrel`).  Parsing is a
//! two-stage policy: anything that looks like an array is parsed as JSON first and
//! any parse failure silently falls back to comma splitting.  The fallback is
//! intentional leniency; a malformed array is still a usable drug name list.

use serde::Serialize;
use serde_json::Value;

/// Values of `enable_llm` that are read as `true`.  Compared after trimming and
/// ASCII lower-casing; everything else is `false`.
pub const TRUTHY_TOKENS: [&str; 4] = ["1", "true", "yes", "on"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Drugs field is required")]
    DrugsRequired,
}

/// Ordered, non-empty list of trimmed drug identifiers.  Only obtainable through
/// [`normalize_drugs`], so holding one means validation already passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DrugList(Vec<String>);

impl DrugList {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for a constructed list; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl<'a> IntoIterator for &'a DrugList {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Parse the raw `drugs` field into a [`DrugList`].
///
/// An absent field, a blank field, or a field that yields no non-empty entries is
/// rejected with [`NormalizeError::DrugsRequired`].
pub fn normalize_drugs(raw: Option<&str>) -> Result<DrugList, NormalizeError> {
    let raw = raw.unwrap_or_default();
    let drugs = if raw.trim_start().starts_with('[') {
        parse_json_list(raw).unwrap_or_else(|| split_delimited(raw))
    } else {
        split_delimited(raw)
    };
    if drugs.is_empty() {
        return Err(NormalizeError::DrugsRequired);
    }
    Ok(DrugList(drugs))
}

/// Read the optional `enable_llm` flag.  Absent means enabled; unrecognised
/// tokens read as `false` rather than being rejected.
pub fn parse_enable_flag(raw: Option<&str>) -> bool {
    match raw {
        None => true,
        Some(value) => {
            let token = value.trim().to_ascii_lowercase();
            TRUTHY_TOKENS.contains(&token.as_str())
        }
    }
}

fn parse_json_list(raw: &str) -> Option<Vec<String>> {
    let items = match serde_json::from_str::<Value>(raw).ok()? {
        Value::Array(items) => items,
        _ => return None,
    };
    Some(
        items
            .iter()
            .filter_map(stringify_element)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    )
}

// Strings contribute their contents, everything else its JSON text, so
// `true` stays `true` rather than a Python-style `True`.  `null` carries no
// name and is dropped like an empty entry instead of becoming `None`.
fn stringify_element(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn split_delimited(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
