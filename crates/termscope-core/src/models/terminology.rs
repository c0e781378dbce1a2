//! Terminology entries: domain vocabulary with definitions, synonyms and a
//! scope that decides where each entry applies.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{trimmed, OrgId, Vector};
use crate::defaults;
use crate::error::{EntityKind, Error, Result};
use crate::scope::{ScopeAssociations, ScopeBinding, ScopeMatcher};
use crate::QueryContext;

/// Granularity at which a terminology entry applies.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum TermScope {
    #[default]
    Global,
    Datasource,
    Table,
    Field,
}

impl TermScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Datasource => "datasource",
            Self::Table => "table",
            Self::Field => "field",
        }
    }
}

impl std::fmt::Display for TermScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TermScope {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "datasource" => Ok(Self::Datasource),
            "table" => Ok(Self::Table),
            "field" => Ok(Self::Field),
            _ => Err(format!("Invalid terminology scope: {}", s)),
        }
    }
}

/// A stored terminology row.
///
/// Synonym rows carry `pid` pointing at their parent and share the parent's
/// description, scope and associations.
#[derive(Debug, Clone)]
pub struct TerminologyEntry {
    pub id: i64,
    pub oid: OrgId,
    pub pid: Option<i64>,
    pub word: String,
    pub description: Option<String>,
    /// Null until computed; a null embedding is never ranked.
    pub embedding: Option<Vector>,
    pub scope: TermScope,
    pub datasource_ids: Option<Vec<i64>>,
    pub table_ids: Option<Vec<i64>>,
    pub field_ids: Option<Vec<i64>>,
    pub enabled: bool,
    pub create_time: DateTime<Utc>,
}

impl TerminologyEntry {
    /// Id of the entry group this row belongs to.
    pub fn root_id(&self) -> i64 {
        self.pid.unwrap_or(self.id)
    }

    pub fn is_synonym(&self) -> bool {
        self.pid.is_some()
    }

    pub fn associations(&self) -> ScopeAssociations<'_> {
        ScopeAssociations {
            datasource_ids: self.datasource_ids.as_deref(),
            table_ids: self.table_ids.as_deref(),
            field_ids: self.field_ids.as_deref(),
        }
    }

    /// Validated binding, or `None` when the stored row violates the scope
    /// invariant.
    pub fn binding(&self) -> Option<ScopeBinding> {
        ScopeBinding::from_parts(
            self.scope,
            self.datasource_ids.as_deref(),
            self.table_ids.as_deref(),
            self.field_ids.as_deref(),
        )
    }

    pub fn applies_to(&self, ctx: &QueryContext) -> bool {
        ScopeMatcher::matches(self.scope, &self.associations(), ctx)
    }

    pub fn embedding_text(&self) -> String {
        embedding_text(&self.word, self.description.as_deref())
    }
}

/// Text fed to the embedding model for a word and its definition.
pub fn embedding_text(word: &str, description: Option<&str>) -> String {
    match description.map(str::trim).filter(|d| !d.is_empty()) {
        Some(desc) => format!("{}: {}", word.trim(), desc),
        None => word.trim().to_string(),
    }
}

/// A row whose embedding is missing, with the text it should be computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingTarget {
    pub id: i64,
    pub oid: OrgId,
    pub word: String,
    pub description: Option<String>,
}

impl EmbeddingTarget {
    pub fn text(&self) -> String {
        embedding_text(&self.word, self.description.as_deref())
    }
}

/// Terminology entry as presented to administrative callers: the parent row
/// with its synonyms folded into `other_words`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct TerminologyInfo {
    pub id: i64,
    pub word: String,
    pub description: Option<String>,
    pub other_words: Vec<String>,
    pub scope: TermScope,
    pub datasource_ids: Option<Vec<i64>>,
    pub table_ids: Option<Vec<i64>>,
    pub field_ids: Option<Vec<i64>>,
    pub enabled: bool,
    /// Every word in the group has an embedding.
    pub embedded: bool,
    pub create_time: DateTime<Utc>,
}

impl TerminologyInfo {
    /// Fold a parent row and its synonym rows into one record.
    pub fn from_group(parent: &TerminologyEntry, synonyms: &[TerminologyEntry]) -> Self {
        let mut children: Vec<&TerminologyEntry> =
            synonyms.iter().filter(|s| s.pid == Some(parent.id)).collect();
        children.sort_by_key(|s| s.id);
        Self {
            id: parent.id,
            word: parent.word.clone(),
            description: parent.description.clone(),
            other_words: children.iter().map(|s| s.word.clone()).collect(),
            scope: parent.scope,
            datasource_ids: parent.datasource_ids.clone(),
            table_ids: parent.table_ids.clone(),
            field_ids: parent.field_ids.clone(),
            enabled: parent.enabled,
            embedded: parent.embedding.is_some() && children.iter().all(|s| s.embedding.is_some()),
            create_time: parent.create_time,
        }
    }

    /// All words of the group, main word first.
    pub fn words(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.word.as_str()).chain(self.other_words.iter().map(String::as_str))
    }
}

/// Filters for paginated terminology listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct TerminologyFilter {
    /// Case-insensitive substring match on the word or any synonym.
    pub word: Option<String>,
    pub scope: Option<TermScope>,
    pub enabled: Option<bool>,
}

impl TerminologyFilter {
    pub fn matches(&self, info: &TerminologyInfo) -> bool {
        let word_ok = match self.word.as_deref().map(str::trim).filter(|w| !w.is_empty()) {
            Some(needle) => {
                let needle = needle.to_lowercase();
                info.words().any(|w| w.to_lowercase().contains(&needle))
            }
            None => true,
        };
        word_ok
            && self.scope.map_or(true, |s| info.scope == s)
            && self.enabled.map_or(true, |e| info.enabled == e)
    }
}

/// Request to create a terminology entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct CreateTerminologyRequest {
    pub word: String,
    pub description: Option<String>,
    #[serde(default)]
    pub other_words: Vec<String>,
    #[serde(default)]
    pub scope: TermScope,
    pub datasource_ids: Option<Vec<i64>>,
    pub table_ids: Option<Vec<i64>>,
    pub field_ids: Option<Vec<i64>>,
    pub enabled: Option<bool>,
}

impl CreateTerminologyRequest {
    pub fn validate(&self) -> Result<NewTerminology> {
        let word = validate_word(&self.word)?;
        let other_words = normalize_synonyms(&word, &self.other_words)?;
        let binding = ScopeBinding::try_new(
            self.scope,
            self.datasource_ids.as_deref(),
            self.table_ids.as_deref(),
            self.field_ids.as_deref(),
        )?;
        Ok(NewTerminology {
            word,
            description: trimmed(self.description.as_deref()),
            other_words,
            binding,
            enabled: self.enabled.unwrap_or(true),
        })
    }
}

/// A validated terminology entry ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTerminology {
    pub word: String,
    pub description: Option<String>,
    pub other_words: Vec<String>,
    pub binding: ScopeBinding,
    pub enabled: bool,
}

/// Partial update: only fields that are `Some` change.
///
/// Changing `scope` (or any association list) rebuilds the binding; lists the
/// resulting scope does not consult are cleared.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct UpdateTerminologyRequest {
    pub word: Option<String>,
    pub description: Option<String>,
    /// Replaces the full synonym list when present.
    pub other_words: Option<Vec<String>>,
    pub scope: Option<TermScope>,
    pub datasource_ids: Option<Vec<i64>>,
    pub table_ids: Option<Vec<i64>>,
    pub field_ids: Option<Vec<i64>>,
    pub enabled: Option<bool>,
}

impl UpdateTerminologyRequest {
    fn touches_scope(&self) -> bool {
        self.scope.is_some()
            || self.datasource_ids.is_some()
            || self.table_ids.is_some()
            || self.field_ids.is_some()
    }
}

/// What an update will write.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminologyChange {
    pub word: String,
    pub description: Option<String>,
    /// New binding, when scope or associations were touched.
    pub binding: Option<ScopeBinding>,
    /// Replacement synonym list, when `other_words` was present.
    pub other_words: Option<Vec<String>>,
    /// Synonym row to delete because the word was renamed onto it and the
    /// synonym list was left as stored.
    pub retired_synonym: Option<String>,
    pub enabled: bool,
    /// Word or description changed: every embedding in the group is stale.
    pub embedding_invalidated: bool,
}

/// Plan an update of the parent row `existing`.
pub fn plan_terminology_update(
    existing: &TerminologyEntry,
    req: &UpdateTerminologyRequest,
) -> Result<TerminologyChange> {
    let word = match req.word.as_deref() {
        Some(raw) => validate_word(raw)?,
        None => existing.word.clone(),
    };
    let description = match req.description.as_deref() {
        Some(raw) => trimmed(Some(raw)),
        None => existing.description.clone(),
    };

    let binding = if req.touches_scope() {
        let scope = req.scope.unwrap_or(existing.scope);
        let pick = |requested: &Option<Vec<i64>>, stored: &Option<Vec<i64>>| -> Option<Vec<i64>> {
            requested.clone().or_else(|| stored.clone())
        };
        let ds = pick(&req.datasource_ids, &existing.datasource_ids);
        let tables = pick(&req.table_ids, &existing.table_ids);
        let fields = pick(&req.field_ids, &existing.field_ids);
        Some(ScopeBinding::try_new(
            scope,
            ds.as_deref(),
            tables.as_deref(),
            fields.as_deref(),
        )?)
    } else {
        None
    };

    let other_words = match &req.other_words {
        Some(words) => Some(normalize_synonyms(&word, words)?),
        None => None,
    };

    let retired_synonym = (other_words.is_none() && word != existing.word).then(|| word.clone());
    let embedding_invalidated = word != existing.word || description != existing.description;

    Ok(TerminologyChange {
        word,
        description,
        binding,
        other_words,
        retired_synonym,
        enabled: req.enabled.unwrap_or(existing.enabled),
        embedding_invalidated,
    })
}

fn validate_word(raw: &str) -> Result<String> {
    let word = trimmed(Some(raw)).ok_or_else(|| Error::required(EntityKind::Terminology, "word"))?;
    if word.chars().count() > defaults::WORD_MAX_LEN {
        return Err(Error::too_long(
            EntityKind::Terminology,
            "word",
            defaults::WORD_MAX_LEN,
        ));
    }
    Ok(word)
}

/// Trim synonyms, drop blanks and duplicates (including the main word).
fn normalize_synonyms(word: &str, raw: &[String]) -> Result<Vec<String>> {
    let mut seen = BTreeSet::from([word.to_string()]);
    let mut out = Vec::new();
    for candidate in raw {
        let Some(synonym) = trimmed(Some(candidate)) else {
            continue;
        };
        if synonym.chars().count() > defaults::WORD_MAX_LEN {
            return Err(Error::too_long(
                EntityKind::Terminology,
                "other_words",
                defaults::WORD_MAX_LEN,
            ));
        }
        if seen.insert(synonym.clone()) {
            out.push(synonym);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, scope: TermScope, table_ids: Option<Vec<i64>>) -> TerminologyEntry {
        TerminologyEntry {
            id,
            oid: 1,
            pid: None,
            word: "status".into(),
            description: Some("Order status".into()),
            embedding: None,
            scope,
            datasource_ids: Some(vec![]),
            table_ids,
            field_ids: Some(vec![]),
            enabled: true,
            create_time: Utc::now(),
        }
    }

    #[test]
    fn test_scope_from_str_roundtrip() {
        for scope in [
            TermScope::Global,
            TermScope::Datasource,
            TermScope::Table,
            TermScope::Field,
        ] {
            assert_eq!(scope.to_string().parse::<TermScope>().unwrap(), scope);
        }
        assert_eq!(" TABLE ".parse::<TermScope>().unwrap(), TermScope::Table);
        assert!("schema".parse::<TermScope>().is_err());
    }

    #[test]
    fn test_scope_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TermScope::Datasource).unwrap(),
            "\"datasource\""
        );
    }

    #[test]
    fn test_create_validates_word() {
        let req = CreateTerminologyRequest {
            word: "  ".into(),
            ..Default::default()
        };
        assert_eq!(
            req.validate().unwrap_err().message_key(),
            "i18n_terminology.word_required"
        );

        let req = CreateTerminologyRequest {
            word: "x".repeat(256),
            ..Default::default()
        };
        assert_eq!(
            req.validate().unwrap_err().message_key(),
            "i18n_terminology.word_too_long"
        );

        let req = CreateTerminologyRequest {
            word: "x".repeat(255),
            ..Default::default()
        };
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_create_normalizes_synonyms() {
        let req = CreateTerminologyRequest {
            word: "GMV".into(),
            other_words: vec![
                " gross merchandise value ".into(),
                "".into(),
                "GMV".into(),
                "gross merchandise value".into(),
                "turnover".into(),
            ],
            ..Default::default()
        };
        let new = req.validate().unwrap();
        assert_eq!(
            new.other_words,
            vec!["gross merchandise value".to_string(), "turnover".to_string()]
        );
    }

    #[test]
    fn test_create_requires_scope_list() {
        let req = CreateTerminologyRequest {
            word: "status".into(),
            scope: TermScope::Table,
            table_ids: Some(vec![]),
            ..Default::default()
        };
        assert_eq!(
            req.validate().unwrap_err().message_key(),
            "i18n_terminology.table_ids_required"
        );
    }

    #[test]
    fn test_update_word_invalidates_embedding() {
        let existing = entry(1, TermScope::Global, Some(vec![]));
        let change = plan_terminology_update(
            &existing,
            &UpdateTerminologyRequest {
                word: Some("state".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(change.embedding_invalidated);
        assert_eq!(change.word, "state");
        assert!(change.binding.is_none());
        assert_eq!(change.retired_synonym.as_deref(), Some("state"));
    }

    #[test]
    fn test_rename_with_synonym_list_retires_nothing() {
        let existing = entry(1, TermScope::Global, Some(vec![]));
        let change = plan_terminology_update(
            &existing,
            &UpdateTerminologyRequest {
                word: Some("state".into()),
                other_words: Some(vec!["state".into(), "status".into()]),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(change.retired_synonym.is_none());
        assert_eq!(change.other_words, Some(vec!["status".to_string()]));
    }

    #[test]
    fn test_update_same_text_keeps_embedding() {
        let existing = entry(1, TermScope::Global, Some(vec![]));
        let change = plan_terminology_update(
            &existing,
            &UpdateTerminologyRequest {
                word: Some(" status ".into()),
                description: Some("Order status".into()),
                enabled: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!change.embedding_invalidated);
        assert!(!change.enabled);
        assert!(change.retired_synonym.is_none());
    }

    #[test]
    fn test_update_scope_change_clears_other_lists() {
        let existing = entry(1, TermScope::Table, Some(vec![42]));
        let change = plan_terminology_update(
            &existing,
            &UpdateTerminologyRequest {
                scope: Some(TermScope::Field),
                field_ids: Some(vec![7]),
                ..Default::default()
            },
        )
        .unwrap();
        let binding = change.binding.unwrap();
        assert_eq!(binding.scope(), TermScope::Field);
        assert!(binding.table_ids().is_empty());
        assert_eq!(binding.field_ids(), vec![7]);
    }

    #[test]
    fn test_update_scope_change_without_list_is_rejected() {
        let existing = entry(1, TermScope::Table, Some(vec![42]));
        let err = plan_terminology_update(
            &existing,
            &UpdateTerminologyRequest {
                scope: Some(TermScope::Datasource),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.message_key(), "i18n_terminology.datasource_ids_required");
    }

    #[test]
    fn test_update_list_only_reuses_stored_scope() {
        let existing = entry(1, TermScope::Table, Some(vec![42]));
        let change = plan_terminology_update(
            &existing,
            &UpdateTerminologyRequest {
                table_ids: Some(vec![42, 43]),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(change.binding.unwrap().table_ids(), vec![42, 43]);
    }

    #[test]
    fn test_update_description_only_on_broken_row_succeeds() {
        // scope=table with no tables: tolerated on read, untouched on write
        let existing = entry(1, TermScope::Table, None);
        let change = plan_terminology_update(
            &existing,
            &UpdateTerminologyRequest {
                description: Some("new".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(change.binding.is_none());
        assert!(change.embedding_invalidated);
    }

    #[test]
    fn test_broken_row_never_applies() {
        let broken = entry(1, TermScope::Table, None);
        assert!(broken.binding().is_none());
        assert!(!broken.applies_to(&QueryContext::new(1).with_tables([42])));
    }

    #[test]
    fn test_embedding_text() {
        assert_eq!(embedding_text("GMV", Some(" Gross value ")), "GMV: Gross value");
        assert_eq!(embedding_text(" GMV ", Some("  ")), "GMV");
        assert_eq!(embedding_text("GMV", None), "GMV");
    }

    #[test]
    fn test_info_from_group() {
        let mut parent = entry(1, TermScope::Global, Some(vec![]));
        parent.embedding = Some(Vector::from(vec![1.0, 0.0]));
        let mut syn_b = entry(3, TermScope::Global, Some(vec![]));
        syn_b.pid = Some(1);
        syn_b.word = "state".into();
        let mut syn_a = entry(2, TermScope::Global, Some(vec![]));
        syn_a.pid = Some(1);
        syn_a.word = "condition".into();
        syn_a.embedding = Some(Vector::from(vec![0.0, 1.0]));

        let info = TerminologyInfo::from_group(&parent, &[syn_b.clone(), syn_a.clone()]);
        assert_eq!(info.other_words, vec!["condition", "state"]);
        assert!(!info.embedded);

        syn_b.embedding = Some(Vector::from(vec![0.5, 0.5]));
        let info = TerminologyInfo::from_group(&parent, &[syn_a, syn_b]);
        assert!(info.embedded);
    }

    #[test]
    fn test_filter_matches_synonyms() {
        let parent = entry(1, TermScope::Global, Some(vec![]));
        let mut syn = entry(2, TermScope::Global, Some(vec![]));
        syn.pid = Some(1);
        syn.word = "Fulfilment".into();
        let info = TerminologyInfo::from_group(&parent, &[syn]);

        let filter = TerminologyFilter {
            word: Some("fulfil".into()),
            ..Default::default()
        };
        assert!(filter.matches(&info));
        let filter = TerminologyFilter {
            scope: Some(TermScope::Table),
            ..Default::default()
        };
        assert!(!filter.matches(&info));
    }
}
