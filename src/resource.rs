//! Resource shapes and the enumeration queries that list every resource of a kind.
//! Hierarchy is at most two levels below the instance: instance -> parent -> child.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{PermError, PermResult};
use crate::query::{is_reserved_param, QueryFragment};

/// A `(parent, child)` address. Values, never persisted by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Resource {
    pub parent: Option<String>,
    pub child: Option<String>,
}

impl Resource {
    pub fn root() -> Self { Self { parent: None, child: None } }

    pub fn parent<P: Into<String>>(parent: P) -> Self { Self { parent: Some(parent.into()), child: None } }

    pub fn child<P: Into<String>, C: Into<String>>(parent: P, child: C) -> Self {
        Self { parent: Some(parent.into()), child: Some(child.into()) }
    }

    /// Validating constructor: a child without a parent is not addressable.
    pub fn new(parent: Option<String>, child: Option<String>) -> Option<Self> {
        if parent.is_none() && child.is_some() { return None; }
        Some(Self { parent, child })
    }

    /// 0 = root, 1 = parent-only, 2 = parent + child.
    pub fn depth(&self) -> u8 {
        match (&self.parent, &self.child) {
            (None, _) => 0,
            (Some(_), None) => 1,
            (Some(_), Some(_)) => 2,
        }
    }

    /// The enclosing parent-level resource; root stays root.
    pub fn parent_resource(&self) -> Self {
        Self { parent: self.parent.clone(), child: None }
    }
}

impl Display for Resource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (&self.parent, &self.child) {
            (None, _) => write!(f, "/"),
            (Some(p), None) => write!(f, "/{}", p),
            (Some(p), Some(c)) => write!(f, "/{}/{}", p, c),
        }
    }
}

/// A kind of resource. `enumeration` selects `(parent, child)` for every resource of
/// this kind that currently exists; it is re-run on every resolution call.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceModel {
    pub name: String,
    pub parent_name: Option<String>,
    pub enumeration: QueryFragment,
}

impl ResourceModel {
    pub fn new<N: Into<String>>(name: N, parent_name: Option<&str>, enumeration: QueryFragment) -> Self {
        Self { name: name.into(), parent_name: parent_name.map(str::to_string), enumeration }
    }

    pub fn instance() -> Self {
        Self::new(INSTANCE, None, QueryFragment::new("SELECT NULL AS parent, NULL AS child"))
    }

    pub fn database() -> Self {
        Self::new(
            DATABASE,
            Some(INSTANCE),
            QueryFragment::new("SELECT database_name AS parent, NULL AS child FROM catalog_databases"),
        )
    }

    pub fn table() -> Self {
        Self::new(
            TABLE,
            Some(DATABASE),
            QueryFragment::new(
                "SELECT database_name AS parent, table_name AS child FROM catalog_tables \
                 UNION ALL \
                 SELECT database_name AS parent, view_name AS child FROM catalog_views",
            ),
        )
    }

    pub fn query() -> Self {
        Self::new(
            QUERY,
            Some(DATABASE),
            QueryFragment::new("SELECT database_name AS parent, query_name AS child FROM catalog_queries"),
        )
    }
}

pub const INSTANCE: &str = "instance";
pub const DATABASE: &str = "database";
pub const TABLE: &str = "table";
pub const QUERY: &str = "query";

/// Registered model plus its resolved depth in the hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelEntry {
    pub model: ResourceModel,
    pub depth: u8,
}

impl ModelEntry {
    pub fn shape(&self) -> &'static str {
        match self.depth {
            0 => "instance-wide",
            1 => "parent-only",
            _ => "parent+child",
        }
    }

    /// Whether a concrete resource has the shape of this model.
    pub fn accepts(&self, res: &Resource) -> bool { res.depth() == self.depth }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceModels {
    entries: HashMap<String, ModelEntry>,
}

impl ResourceModels {
    pub fn new() -> Self { Self::default() }

    /// Built-in models, parents first.
    pub fn core_models() -> Vec<ResourceModel> {
        vec![ResourceModel::instance(), ResourceModel::database(), ResourceModel::table(), ResourceModel::query()]
    }

    pub fn with_core_models() -> Self {
        let mut m = Self::new();
        for model in Self::core_models() {
            // Core models are registered parent-first, so this cannot fail.
            let _ = m.register(model);
        }
        m
    }

    /// Register a model whose parent (if any) is already registered.
    pub fn register(&mut self, model: ResourceModel) -> PermResult<()> {
        if self.entries.contains_key(&model.name) {
            return Err(PermError::DuplicateResourceModel(model.name));
        }
        if let Some(bad) = model.enumeration.params.keys().find(|k| is_reserved_param(k)) {
            return Err(PermError::InvalidRuleFragment {
                source_name: format!("resource model {}", model.name),
                message: format!("enumeration uses reserved parameter :{}", bad),
            });
        }
        let depth = match &model.parent_name {
            None => 0,
            Some(p) => {
                let parent = self.entries.get(p).ok_or_else(|| PermError::UnknownResourceModel(p.clone()))?;
                if parent.depth >= 2 {
                    return Err(PermError::Config(format!("resource model '{}' nests deeper than parent/child", model.name)));
                }
                parent.depth + 1
            }
        };
        self.entries.insert(model.name.clone(), ModelEntry { model, depth });
        Ok(())
    }

    pub fn get(&self, name: &str) -> PermResult<&ModelEntry> {
        self.entries.get(name).ok_or_else(|| PermError::UnknownResourceModel(name.to_string()))
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}
