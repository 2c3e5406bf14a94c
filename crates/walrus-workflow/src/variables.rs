// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `${workflow.var.<key>}` substitution in step attributes.

use std::collections::{BTreeMap, HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::error::{Error, Result};
use crate::model::{Attributes, WorkflowVariable};

static VARIABLE_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{\s*workflow\.var\.([-\w]+)\s*\}").expect("variable pattern is valid")
});

/// Merge run-time values over the declared variables.
///
/// Only variables declared with `overwrite` accept a run-time value; any
/// other key in `values` is rejected.
pub fn merge_variables(
    values: &HashMap<String, String>,
    declared: &[WorkflowVariable],
) -> Result<BTreeMap<String, String>> {
    let overwritable: HashSet<&str> = declared
        .iter()
        .filter(|v| v.overwrite)
        .map(|v| v.name.as_str())
        .collect();

    let mut rejected: Vec<&str> = values
        .keys()
        .map(String::as_str)
        .filter(|k| !overwritable.contains(k))
        .collect();
    if !rejected.is_empty() {
        rejected.sort_unstable();
        return Err(Error::InvalidVariable(rejected.join(",")));
    }

    Ok(declared
        .iter()
        .map(|v| {
            let value = match values.get(&v.name) {
                Some(value) if v.overwrite => value.clone(),
                _ => v.value.clone(),
            };
            (v.name.clone(), value)
        })
        .collect())
}

/// Replace variable references inside `attributes`.
///
/// Substitution happens on the serialized JSON, so a reference may sit
/// anywhere inside a string value. References to undefined variables are
/// left untouched.
pub fn substitute(
    attributes: &Attributes,
    variables: &BTreeMap<String, String>,
) -> Result<Attributes> {
    if attributes.is_empty() {
        return Ok(Attributes::new());
    }

    let raw = serde_json::to_string(attributes)?;
    let replaced = VARIABLE_REF.replace_all(&raw, |caps: &Captures<'_>| match variables
        .get(caps[1].trim())
    {
        // Escape for the JSON string the reference lives in.
        Some(value) => json_escape(value),
        None => caps[0].to_string(),
    });

    Ok(serde_json::from_str(&replaced)?)
}

fn json_escape(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}
