//! Rules declared in the permissions document.
//!
//! `permissions` blocks name actions explicitly at instance, database, table and query
//! level. `allow` blocks cover the view actions and `allow_sql` covers `execute-sql`;
//! an `allow`/`allow_sql` block that exists but does not match the actor is a deny.
//! Rows deeper than the action's resource model are never emitted.
//!
//! For actors carrying `_r`, allow blocks outside the allowlist are skipped, and a
//! parent- or root-level allow block that denies also denies every allowlisted resource
//! beneath it (the restriction gate), so a child-level `permissions` allow cannot
//! reopen what the block closed.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::actions::Action;
use crate::actor::{actor_matches_allow, Actor, ActorRestrictions};
use crate::config::PermissionsConfig;
use crate::error::PermResult;
use crate::rules::{PermissionRule, RuleContext, RuleRowCollector, RuleSource};

pub struct ConfigRuleSource {
    permissions: PermissionsConfig,
}

impl ConfigRuleSource {
    pub fn new(permissions: PermissionsConfig) -> Self { Self { permissions } }
}

fn object(v: Option<&Value>) -> Option<&Map<String, Value>> {
    v.and_then(Value::as_object)
}

fn present(v: Option<&Value>) -> Option<&Value> {
    v.filter(|v| !v.is_null())
}

/// The actor's `_r` allowlist for one action.
struct Gate {
    global: bool,
    parents: BTreeSet<String>,
    children: BTreeSet<(String, String)>,
}

impl Gate {
    fn for_actor(actor: Option<&Actor>, action: &Action) -> Option<Self> {
        let r = ActorRestrictions::from_actor(actor)?;
        let names = action.name_variants();
        Some(Self {
            global: r.is_globally_allowed(&names),
            parents: r.allowed_parents(&names),
            children: r.allowed_children(&names),
        })
    }

    /// Whether an allow block at this level concerns anything the actor may reach.
    fn admits(&self, parent: Option<&str>, child: Option<&str>) -> bool {
        if self.global {
            return true;
        }
        match (parent, child) {
            (Some(p), _) if self.parents.contains(p) => true,
            (Some(p), Some(c)) => self.children.contains(&(p.to_string(), c.to_string())),
            // A parent-level block matters if any allowlisted child lives under it.
            (Some(p), None) => self.children.iter().any(|(db, _)| db == p),
            (None, _) => !self.parents.is_empty() || !self.children.is_empty(),
        }
    }

    /// Allowlisted resources under `parent` (everything for `None`), parents first.
    fn beneath(&self, parent: Option<&str>) -> Vec<(String, Option<String>)> {
        let mut out = Vec::new();
        if parent.is_none() {
            let mut dbs: BTreeSet<&str> = self.parents.iter().map(String::as_str).collect();
            dbs.extend(self.children.iter().map(|(db, _)| db.as_str()));
            out.extend(dbs.into_iter().map(|db| (db.to_string(), None)));
        }
        for (db, child) in self.children.iter() {
            if parent.map_or(true, |p| p == db) {
                out.push((db.clone(), Some(child.clone())));
            }
        }
        out
    }
}

struct Walker<'a> {
    actor: Option<&'a Actor>,
    action: &'a str,
    max_depth: u8,
    gate: Option<Gate>,
    rows: RuleRowCollector,
}

impl<'a> Walker<'a> {
    fn fits(&self, parent: Option<&str>, child: Option<&str>) -> bool {
        let depth = if child.is_some() { 2 } else if parent.is_some() { 1 } else { 0 };
        depth <= self.max_depth
    }

    fn push(&mut self, parent: Option<&str>, child: Option<&str>, allow: bool, scope: &str) {
        if !self.fits(parent, child) { return; }
        let verdict = if allow { "allow" } else { "deny" };
        self.rows.add(parent, child, allow, format!("config {} {}", verdict, scope));
    }

    fn permissions_block(&mut self, parent: Option<&str>, child: Option<&str>, block: Option<&Value>, scope: &str) {
        let Some(entry) = present(object(block).and_then(|b| b.get(self.action))) else { return };
        let allow = actor_matches_allow(self.actor, entry);
        self.push(parent, child, allow, scope);
    }

    fn allow_block(&mut self, parent: Option<&str>, child: Option<&str>, block: Option<&Value>, scope: &str) {
        let Some(block) = present(block) else { return };
        if self.gate.as_ref().is_some_and(|g| !g.admits(parent, child)) {
            return;
        }
        let allow = actor_matches_allow(self.actor, block);
        self.push(parent, child, allow, scope);
        if !allow && child.is_none() {
            self.gate_denies(parent, scope);
        }
    }

    fn gate_denies(&mut self, parent: Option<&str>, scope: &str) {
        let Some(gate) = &self.gate else { return };
        let reason = format!("config deny {} (restriction gate)", scope);
        for (db, child) in gate.beneath(parent) {
            if self.fits(Some(&db), child.as_deref()) {
                self.rows.add(Some(&db), child.as_deref(), false, reason.clone());
            }
        }
    }

    fn database(&mut self, db: &str, cfg: &Value) {
        let action = self.action;
        self.permissions_block(Some(db), None, cfg.get("permissions"), &format!("permissions for {} on {}", action, db));

        if let Some(tables) = object(cfg.get("tables")) {
            for (table, tcfg) in tables {
                let at = format!("{}/{}", db, table);
                self.permissions_block(Some(db), Some(table.as_str()), tcfg.get("permissions"), &format!("permissions for {} on {}", action, at));
                if action == "view-table" {
                    self.allow_block(Some(db), Some(table.as_str()), tcfg.get("allow"), &format!("allow for {} on {}", action, at));
                }
            }
        }

        if let Some(queries) = object(cfg.get("queries")) {
            // A query given as a bare SQL string carries no permissions.
            for (query, qcfg) in queries.iter().filter(|(_, q)| q.is_object()) {
                let at = format!("{}/{}", db, query);
                self.permissions_block(Some(db), Some(query.as_str()), qcfg.get("permissions"), &format!("permissions for {} on {}", action, at));
                if action == "view-query" {
                    self.allow_block(Some(db), Some(query.as_str()), qcfg.get("allow"), &format!("allow for {} on {}", action, at));
                }
            }
        }

        match action {
            "view-database" | "view-table" | "view-query" => {
                self.allow_block(Some(db), None, cfg.get("allow"), &format!("allow for {} on {}", action, db));
            }
            "execute-sql" => {
                self.allow_block(Some(db), None, cfg.get("allow_sql"), &format!("allow_sql for {}", db));
            }
            _ => {}
        }
    }
}

#[async_trait]
impl RuleSource for ConfigRuleSource {
    fn name(&self) -> &str { "config" }

    async fn provide_rules(&self, ctx: &RuleContext<'_>) -> PermResult<Vec<PermissionRule>> {
        let action = ctx.action.name.as_str();
        let mut w = Walker {
            actor: ctx.actor,
            action,
            max_depth: ctx.model_depth,
            gate: Gate::for_actor(ctx.actor, ctx.action),
            rows: RuleRowCollector::new(),
        };

        w.permissions_block(None, None, self.permissions.get("permissions"), &format!("permissions for {}", action));
        if let Some(dbs) = object(self.permissions.get("databases")) {
            for (db, cfg) in dbs {
                w.database(db, cfg);
            }
        }
        match action {
            "view-instance" | "view-database" | "view-table" | "view-query" => {
                w.allow_block(None, None, self.permissions.get("allow"), &format!("allow for {}", action));
            }
            "execute-sql" => w.allow_block(None, None, self.permissions.get("allow_sql"), "allow_sql"),
            _ => {}
        }
        Ok(w.rows.into_rule().into_iter().collect())
    }
}
