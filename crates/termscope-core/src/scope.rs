//! Scope gate for terminology entries.
//!
//! An entry's scope decides which association list is authoritative. The gate
//! is boolean: no partial scoring, and anything malformed fails closed.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{EntityKind, Error, Result};
use crate::models::{OrgId, TermScope};

/// The query context a resolution request runs under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct QueryContext {
    /// Organization id. Required; a context without one is rejected.
    pub oid: Option<OrgId>,
    pub datasource_id: Option<i64>,
    #[serde(default)]
    pub table_ids: Vec<i64>,
    #[serde(default)]
    pub field_ids: Vec<i64>,
}

impl QueryContext {
    pub fn new(oid: OrgId) -> Self {
        Self {
            oid: Some(oid),
            ..Default::default()
        }
    }

    pub fn with_datasource(mut self, datasource_id: i64) -> Self {
        self.datasource_id = Some(datasource_id);
        self
    }

    pub fn with_tables(mut self, table_ids: impl IntoIterator<Item = i64>) -> Self {
        self.table_ids = table_ids.into_iter().collect();
        self
    }

    pub fn with_fields(mut self, field_ids: impl IntoIterator<Item = i64>) -> Self {
        self.field_ids = field_ids.into_iter().collect();
        self
    }

    /// The organization id, or a validation error when missing.
    pub fn require_oid(&self) -> Result<OrgId> {
        self.oid
            .ok_or_else(|| Error::required(EntityKind::Context, "oid"))
    }
}

/// Borrowed view of an entry's stored association lists.
///
/// `None` (null) and an empty list behave identically in the gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeAssociations<'a> {
    pub datasource_ids: Option<&'a [i64]>,
    pub table_ids: Option<&'a [i64]>,
    pub field_ids: Option<&'a [i64]>,
}

/// Stateless scope gate.
pub struct ScopeMatcher;

impl ScopeMatcher {
    /// Does an entry with `scope` and `associations` apply to `ctx`?
    pub fn matches(scope: TermScope, associations: &ScopeAssociations<'_>, ctx: &QueryContext) -> bool {
        match scope {
            TermScope::Global => true,
            TermScope::Datasource => match (ctx.datasource_id, associations.datasource_ids) {
                (Some(ds), Some(ids)) => ids.contains(&ds),
                _ => false,
            },
            TermScope::Table => intersects(associations.table_ids, &ctx.table_ids),
            TermScope::Field => intersects(associations.field_ids, &ctx.field_ids),
        }
    }
}

fn intersects(entry_ids: Option<&[i64]>, ctx_ids: &[i64]) -> bool {
    match entry_ids {
        Some(ids) if !ids.is_empty() => ids.iter().any(|id| ctx_ids.contains(id)),
        _ => false,
    }
}

/// A scope paired with the association set it requires.
///
/// Construction enforces that non-global scopes carry a non-empty set; lists
/// that the scope does not consult are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeBinding {
    Global,
    Datasource(BTreeSet<i64>),
    Table(BTreeSet<i64>),
    Field(BTreeSet<i64>),
}

impl ScopeBinding {
    /// Build a binding for a write, rejecting an empty authoritative list.
    pub fn try_new(
        scope: TermScope,
        datasource_ids: Option<&[i64]>,
        table_ids: Option<&[i64]>,
        field_ids: Option<&[i64]>,
    ) -> Result<Self> {
        Self::from_parts(scope, datasource_ids, table_ids, field_ids).ok_or_else(|| {
            let field = match scope {
                TermScope::Datasource => "datasource_ids",
                TermScope::Table => "table_ids",
                _ => "field_ids",
            };
            Error::required(EntityKind::Terminology, field)
        })
    }

    /// Build a binding from stored columns; `None` when the row violates the
    /// scope invariant.
    pub fn from_parts(
        scope: TermScope,
        datasource_ids: Option<&[i64]>,
        table_ids: Option<&[i64]>,
        field_ids: Option<&[i64]>,
    ) -> Option<Self> {
        let non_empty = |ids: Option<&[i64]>| -> Option<BTreeSet<i64>> {
            let set: BTreeSet<i64> = ids.unwrap_or_default().iter().copied().collect();
            (!set.is_empty()).then_some(set)
        };
        match scope {
            TermScope::Global => Some(Self::Global),
            TermScope::Datasource => non_empty(datasource_ids).map(Self::Datasource),
            TermScope::Table => non_empty(table_ids).map(Self::Table),
            TermScope::Field => non_empty(field_ids).map(Self::Field),
        }
    }

    pub fn scope(&self) -> TermScope {
        match self {
            Self::Global => TermScope::Global,
            Self::Datasource(_) => TermScope::Datasource,
            Self::Table(_) => TermScope::Table,
            Self::Field(_) => TermScope::Field,
        }
    }

    /// Stored value of `datasource_ids` for this binding (empty unless authoritative).
    pub fn datasource_ids(&self) -> Vec<i64> {
        match self {
            Self::Datasource(ids) => ids.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    pub fn table_ids(&self) -> Vec<i64> {
        match self {
            Self::Table(ids) => ids.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    pub fn field_ids(&self) -> Vec<i64> {
        match self {
            Self::Field(ids) => ids.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    pub fn matches(&self, ctx: &QueryContext) -> bool {
        match self {
            Self::Global => true,
            Self::Datasource(ids) => ctx.datasource_id.is_some_and(|ds| ids.contains(&ds)),
            Self::Table(ids) => ctx.table_ids.iter().any(|id| ids.contains(id)),
            Self::Field(ids) => ctx.field_ids.iter().any(|id| ids.contains(id)),
        }
    }
}
