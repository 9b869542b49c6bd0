//! Matrix expansion: dimensions, include/exclude rows, and the
//! fully-resolved job configurations they produce.

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named build axis with an ordered sequence of discrete values
/// (e.g., `platform: [linux, mac, windows]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dimension {
    /// Axis name
    pub name: String,
    /// Ordered values; declaration order drives expansion order
    pub values: Vec<String>,
}

impl Dimension {
    /// Create a dimension from a name and values.
    pub fn new(name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            name: name.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// A partial assignment merged into (or appended to) the expanded product.
///
/// Keys naming declared dimensions select which product rows the include
/// applies to; any other keys are additive fields (e.g., an extra flag)
/// merged into the matching rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct IncludeRow {
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// A partial assignment removed from the expanded product. Every specified
/// key must name a declared dimension; unspecified keys are wildcards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ExcludeRow {
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// One fully-resolved assignment of dimensions to values: a single
/// schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobConfiguration {
    /// Position within the expanded matrix (stable across runs)
    pub index: usize,
    /// Human-readable label, dimension values in declaration order
    /// joined by `-` (used in artifact names)
    pub label: String,
    /// Dimension name → value
    pub values: BTreeMap<String, String>,
    /// Additive non-dimension fields contributed by include rows
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl JobConfiguration {
    /// Get the value for a dimension, if set.
    pub fn get(&self, dimension: &str) -> Option<&str> {
        self.values.get(dimension).map(String::as_str)
    }

    /// Check whether this configuration matches a partial assignment:
    /// every specified pair must equal this configuration's value.
    pub fn matches(&self, partial: &BTreeMap<String, String>) -> bool {
        partial
            .iter()
            .all(|(k, v)| self.values.get(k).map(|have| have == v).unwrap_or(false))
    }
}

/// Render a YAML/JSON scalar as the string form used for dimension values.
fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Expand dimensions × includes × excludes into a deduplicated, ordered
/// list of job configurations.
///
/// The base set is the Cartesian product of all dimensions (first dimension
/// varies slowest). Include rows are merged or appended, exclude rows are
/// applied last as a set difference. Output order and contents are
/// deterministic for identical inputs.
pub fn expand(
    dimensions: &[Dimension],
    includes: &[IncludeRow],
    excludes: &[ExcludeRow],
) -> Result<Vec<JobConfiguration>> {
    let dim_names: Vec<&str> = dimensions.iter().map(|d| d.name.as_str()).collect();

    // Exclude keys must name declared dimensions; includes may introduce
    // new fields, excludes may not.
    for exclude in excludes {
        for key in exclude.fields.keys() {
            if !dim_names.contains(&key.as_str()) {
                return Err(OrchestratorError::Configuration(format!(
                    "exclude row references unknown dimension '{}'",
                    key
                )));
            }
        }
    }

    // Base Cartesian product, in declaration order.
    let mut rows: Vec<(BTreeMap<String, String>, BTreeMap<String, serde_json::Value>)> =
        vec![(BTreeMap::new(), BTreeMap::new())];
    for dim in dimensions {
        let mut next = Vec::with_capacity(rows.len() * dim.values.len().max(1));
        for (values, extra) in &rows {
            for value in &dim.values {
                let mut values = values.clone();
                values.insert(dim.name.clone(), value.clone());
                next.push((values, extra.clone()));
            }
        }
        rows = next;
    }
    // An empty dimension set with no includes expands to nothing, not to
    // one empty configuration.
    if dimensions.is_empty() {
        rows.clear();
    }

    // Includes: merge into matching rows, or append as new configurations.
    for include in includes {
        let mut match_keys: BTreeMap<String, String> = BTreeMap::new();
        let mut extra_fields: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        for (key, value) in &include.fields {
            if dim_names.contains(&key.as_str()) {
                match_keys.insert(key.clone(), value_to_string(value));
            } else {
                extra_fields.insert(key.clone(), value.clone());
            }
        }

        let mut matched = false;
        for (values, extra) in rows.iter_mut() {
            let hit = match_keys
                .iter()
                .all(|(k, v)| values.get(k).map(|have| have == v).unwrap_or(false));
            if hit {
                matched = true;
                extra.extend(extra_fields.clone());
            }
        }

        if !matched {
            // A combination the base product never produced: append it,
            // unless an identical appended row already exists.
            if let Some((_, extra)) = rows.iter_mut().find(|(values, _)| *values == match_keys) {
                extra.extend(extra_fields.clone());
            } else {
                rows.push((match_keys, extra_fields));
            }
        }
    }

    // Excludes: set difference, order of application irrelevant.
    let exclude_maps: Vec<BTreeMap<String, String>> = excludes
        .iter()
        .map(|e| {
            e.fields
                .iter()
                .map(|(k, v)| (k.clone(), value_to_string(v)))
                .collect()
        })
        .collect();
    rows.retain(|(values, _)| {
        !exclude_maps.iter().any(|exclude| {
            exclude
                .iter()
                .all(|(k, v)| values.get(k).map(|have| have == v).unwrap_or(false))
        })
    });

    // Indices and labels are assigned after filtering so artifact names
    // stay reproducible.
    let configs = rows
        .into_iter()
        .enumerate()
        .map(|(index, (values, extra))| {
            let mut parts: Vec<&str> = Vec::new();
            for name in &dim_names {
                if let Some(v) = values.get(*name) {
                    parts.push(v);
                }
            }
            for (key, value) in &values {
                if !dim_names.contains(&key.as_str()) {
                    parts.push(value);
                }
            }
            JobConfiguration {
                index,
                label: parts.join("-"),
                values,
                extra,
            }
        })
        .collect();

    Ok(configs)
}
