//! Dimension value sets: named enumeration dictionaries that map external
//! vocabulary onto stored enum literals.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{trimmed, OrgId, UserId};
use crate::error::{EntityKind, Error, Result, ValidationRule};

/// A persisted dimension value set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct DimensionValueSet {
    pub id: i64,
    pub oid: OrgId,
    pub name: String,
    /// Stored trimmed; unique per organization (case-sensitive).
    pub code: String,
    pub description: Option<String>,
    /// Canonical literals, in display order.
    pub values: Vec<String>,
    /// Canonical literal → human label. Keys outside `values` are stale.
    pub value_labels: BTreeMap<String, String>,
    pub is_system: bool,
    pub enabled: bool,
    pub create_time: DateTime<Utc>,
    pub update_time: Option<DateTime<Utc>>,
    pub create_by: Option<UserId>,
    pub update_by: Option<UserId>,
}

impl DimensionValueSet {
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// Label keys that no longer name a value in `values`.
    pub fn stale_label_keys(&self) -> Vec<&str> {
        stale_label_keys(&self.values, &self.value_labels)
    }

    /// Human label for a canonical literal, if one is set.
    pub fn label_for(&self, value: &str) -> Option<&str> {
        self.value_labels.get(value).map(String::as_str)
    }

    /// Find the canonical literal for an external word, matching either the
    /// literal itself or its label (case-insensitive).
    pub fn canonical_value(&self, word: &str) -> Option<&str> {
        let needle = word.trim();
        self.values
            .iter()
            .find(|v| {
                v.eq_ignore_ascii_case(needle)
                    || self
                        .value_labels
                        .get(v.as_str())
                        .is_some_and(|label| label.trim().eq_ignore_ascii_case(needle))
            })
            .map(String::as_str)
    }

    pub fn to_summary(&self) -> DimensionSummary {
        DimensionSummary {
            id: self.id,
            name: self.name.clone(),
            code: self.code.clone(),
            description: self.description.clone(),
            enabled: self.enabled,
            value_count: self.value_count(),
        }
    }
}

pub(crate) fn stale_label_keys<'a>(
    values: &[String],
    labels: &'a BTreeMap<String, String>,
) -> Vec<&'a str> {
    labels
        .keys()
        .filter(|k| !values.iter().any(|v| v == *k))
        .map(String::as_str)
        .collect()
}

/// Compact form used by selection widgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct DimensionSummary {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub value_count: usize,
}

/// Filters for paginated dimension listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct DimensionFilter {
    /// Case-insensitive substring match on name.
    pub name: Option<String>,
    /// Case-insensitive substring match on code.
    pub code: Option<String>,
    pub enabled: Option<bool>,
}

impl DimensionFilter {
    pub fn matches(&self, dimension: &DimensionValueSet) -> bool {
        let contains = |haystack: &str, needle: &Option<String>| {
            needle
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map_or(true, |n| {
                    haystack.to_lowercase().contains(&n.to_lowercase())
                })
        };
        contains(&dimension.name, &self.name)
            && contains(&dimension.code, &self.code)
            && self.enabled.map_or(true, |e| dimension.enabled == e)
    }
}

/// Request to create a dimension value set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct CreateDimensionRequest {
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    #[serde(default)]
    pub values: Vec<String>,
    pub value_labels: Option<BTreeMap<String, String>>,
    pub enabled: Option<bool>,
}

impl CreateDimensionRequest {
    /// Check required fields and normalize whitespace.
    pub fn validate(&self) -> Result<NewDimension> {
        let name = trimmed(Some(&self.name))
            .ok_or_else(|| Error::required(EntityKind::Dimension, "name"))?;
        let code = trimmed(Some(&self.code))
            .ok_or_else(|| Error::required(EntityKind::Dimension, "code"))?;

        Ok(NewDimension {
            name,
            code,
            description: trimmed(self.description.as_deref()),
            values: self.values.clone(),
            value_labels: self.value_labels.clone().unwrap_or_default(),
            enabled: self.enabled.unwrap_or(true),
        })
    }
}

/// A validated, normalized dimension ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDimension {
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    pub values: Vec<String>,
    pub value_labels: BTreeMap<String, String>,
    pub enabled: bool,
}

impl NewDimension {
    pub fn stale_label_keys(&self) -> Vec<&str> {
        stale_label_keys(&self.values, &self.value_labels)
    }
}

/// Partial update: only fields that are `Some` change.
///
/// A present-but-blank `description` clears it. A present-but-blank `name`
/// or `code` is rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct UpdateDimensionRequest {
    pub name: Option<String>,
    pub code: Option<String>,
    pub description: Option<String>,
    pub values: Option<Vec<String>>,
    pub value_labels: Option<BTreeMap<String, String>>,
    pub enabled: Option<bool>,
}

/// Result of applying an update to a stored dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionChange {
    pub updated: DimensionValueSet,
    /// True when the stored code differs from the new one; the caller must
    /// re-check uniqueness against other entries before committing.
    pub code_changed: bool,
}

/// Apply a partial update to `existing`.
///
/// Enforces system-code immutability. Code uniqueness depends on other rows
/// and is left to the caller, inside the same transaction as the write.
pub fn apply_dimension_update(
    existing: &DimensionValueSet,
    req: &UpdateDimensionRequest,
    actor: UserId,
    now: DateTime<Utc>,
) -> Result<DimensionChange> {
    let name = match req.name.as_deref() {
        Some(raw) => {
            trimmed(Some(raw)).ok_or_else(|| Error::required(EntityKind::Dimension, "name"))?
        }
        None => existing.name.clone(),
    };

    let code = match req.code.as_deref() {
        Some(raw) => {
            trimmed(Some(raw)).ok_or_else(|| Error::required(EntityKind::Dimension, "code"))?
        }
        None => existing.code.clone(),
    };

    if existing.is_system && code != existing.code {
        return Err(Error::Validation {
            entity: EntityKind::Dimension,
            field: "code",
            rule: ValidationRule::Immutable,
            message: format!("system dimension '{}' cannot change its code", existing.code),
        });
    }

    let description = match req.description.as_deref() {
        Some(raw) => trimmed(Some(raw)),
        None => existing.description.clone(),
    };

    let code_changed = code != existing.code;
    let updated = DimensionValueSet {
        name,
        code,
        description,
        values: req.values.clone().unwrap_or_else(|| existing.values.clone()),
        value_labels: req
            .value_labels
            .clone()
            .unwrap_or_else(|| existing.value_labels.clone()),
        enabled: req.enabled.unwrap_or(existing.enabled),
        update_time: Some(now),
        update_by: Some(actor),
        ..existing.clone()
    };

    Ok(DimensionChange {
        updated,
        code_changed,
    })
}
