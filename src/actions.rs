//! Action registry: append-only while the engine is being built, sealed once it serves.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PermError, PermResult};
use crate::resource::{DATABASE, QUERY, TABLE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub abbr: Option<String>,
    #[serde(default)]
    pub description: String,
    /// `None` means the action is instance-wide.
    #[serde(default)]
    pub resource_model: Option<String>,
    /// Another action that must also be allowed on the resource's parent.
    #[serde(default)]
    pub also_requires: Option<String>,
}

impl Action {
    pub fn new<N: Into<String>, D: Into<String>>(name: N, abbr: Option<&str>, description: D) -> Self {
        Self { name: name.into(), abbr: abbr.map(str::to_string), description: description.into(), resource_model: None, also_requires: None }
    }

    pub fn on(mut self, model: &str) -> Self {
        self.resource_model = Some(model.to_string());
        self
    }

    pub fn also_requires(mut self, action: &str) -> Self {
        self.also_requires = Some(action.to_string());
        self
    }

    /// Full name plus abbreviation, for matching allowlists that may use either.
    pub fn name_variants(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        out.insert(self.name.clone());
        if let Some(a) = &self.abbr { out.insert(a.clone()); }
        out
    }
}

#[derive(Debug, Default)]
pub struct ActionRegistry {
    actions: Vec<Action>,
    by_name: HashMap<String, usize>,
    by_abbr: HashMap<String, usize>,
    sealed: bool,
}

impl ActionRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn with_core_actions() -> Self {
        let mut reg = Self::new();
        for action in core_actions() {
            // Names and abbreviations in the core table are distinct.
            let _ = reg.register(action);
        }
        reg
    }

    pub fn register(&mut self, action: Action) -> PermResult<()> {
        if self.sealed {
            return Err(PermError::RegistrySealed("action registration"));
        }
        if self.by_name.contains_key(&action.name) || self.by_abbr.contains_key(&action.name) {
            return Err(PermError::DuplicateAction(action.name));
        }
        if let Some(abbr) = &action.abbr {
            if self.by_abbr.contains_key(abbr) || self.by_name.contains_key(abbr) {
                return Err(PermError::DuplicateAction(abbr.clone()));
            }
        }
        let idx = self.actions.len();
        debug!(target: "permsql::actions", "register action='{}' abbr={:?} model={:?}", action.name, action.abbr, action.resource_model);
        self.by_name.insert(action.name.clone(), idx);
        if let Some(abbr) = &action.abbr { self.by_abbr.insert(abbr.clone(), idx); }
        self.actions.push(action);
        Ok(())
    }

    /// Look up by full name, falling back to abbreviation.
    pub fn lookup(&self, name: &str) -> PermResult<&Action> {
        self.by_name
            .get(name)
            .or_else(|| self.by_abbr.get(name))
            .map(|&i| &self.actions[i])
            .ok_or_else(|| PermError::UnknownAction(name.to_string()))
    }

    /// Registration order.
    pub fn list(&self) -> &[Action] { &self.actions }

    pub fn seal(&mut self) { self.sealed = true; }

    pub fn is_sealed(&self) -> bool { self.sealed }
}

/// The built-in actions, in registration order.
pub fn core_actions() -> Vec<Action> {
    vec![
        Action::new("view-instance", Some("vi"), "View the instance"),
        Action::new("permissions-debug", Some("pd"), "Access permission debug tool"),
        Action::new("debug-menu", Some("dm"), "View debug menu items"),
        Action::new("view-database", Some("vd"), "View database").on(DATABASE),
        Action::new("view-database-download", Some("vdd"), "Download database file").on(DATABASE).also_requires("view-database"),
        Action::new("execute-sql", Some("es"), "Execute read-only SQL queries").on(DATABASE).also_requires("view-database"),
        Action::new("create-table", Some("ct"), "Create tables").on(DATABASE),
        Action::new("view-table", Some("vt"), "View table").on(TABLE),
        Action::new("insert-row", Some("ir"), "Insert rows").on(TABLE),
        Action::new("delete-row", Some("dr"), "Delete rows").on(TABLE),
        Action::new("update-row", Some("ur"), "Update rows").on(TABLE),
        Action::new("alter-table", Some("at"), "Alter tables").on(TABLE),
        Action::new("drop-table", Some("dt"), "Drop tables").on(TABLE),
        Action::new("view-query", Some("vq"), "View named query results").on(QUERY),
    ]
}
