//! Rule fragments and the rule-source contract.
//!
//! A rule source is handed `(actor, action)` and answers with zero or more fragments.
//! An empty answer means "no opinion". Returning `Err` is a fault and fails the whole
//! resolution closed.
//!
//! Fragments come in two bodies:
//! - `Sql`: a query selecting exactly `(parent, child, allow, reason)` with named
//!   parameters the source declares and namespaces itself.
//! - `Rows`: literal rows. The aggregator binds every value under engine-generated
//!   names, so these can never collide or inject.
//!
//! `RuleKind::Restriction` fragments select `(parent, child)` allowlist rows instead;
//! a resource must fall inside every restricting source's allowlist to be allowed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::actions::Action;
use crate::actor::Actor;
use crate::config::EngineConfig;
use crate::error::PermResult;
use crate::query::QueryFragment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Rule,
    Restriction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRow {
    pub parent: Option<String>,
    pub child: Option<String>,
    pub allow: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleBody {
    Sql(QueryFragment),
    Rows(Vec<RuleRow>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRule {
    /// Stamped with the contributing source's name during aggregation.
    #[serde(default)]
    pub source: String,
    pub kind: RuleKind,
    pub body: RuleBody,
}

impl PermissionRule {
    pub fn sql(query: QueryFragment) -> Self {
        Self { source: String::new(), kind: RuleKind::Rule, body: RuleBody::Sql(query) }
    }

    pub fn rows(rows: Vec<RuleRow>) -> Self {
        Self { source: String::new(), kind: RuleKind::Rule, body: RuleBody::Rows(rows) }
    }

    /// Instance-wide allow.
    pub fn allow<S: Into<String>>(reason: S) -> Self {
        Self::rows(vec![RuleRow { parent: None, child: None, allow: true, reason: reason.into() }])
    }

    /// Instance-wide deny.
    pub fn deny<S: Into<String>>(reason: S) -> Self {
        Self::rows(vec![RuleRow { parent: None, child: None, allow: false, reason: reason.into() }])
    }

    /// Allowlist query selecting `(parent, child)`.
    pub fn restriction_sql(query: QueryFragment) -> Self {
        Self { source: String::new(), kind: RuleKind::Restriction, body: RuleBody::Sql(query) }
    }

    /// Allowlist rows; `allow`/`reason` are ignored. An empty list admits nothing.
    pub fn restriction_rows(rows: Vec<(Option<String>, Option<String>)>) -> Self {
        let rows = rows
            .into_iter()
            .map(|(parent, child)| RuleRow { parent, child, allow: true, reason: String::new() })
            .collect();
        Self { source: String::new(), kind: RuleKind::Restriction, body: RuleBody::Rows(rows) }
    }
}

/// Accumulates literal rows and emits one fragment, or nothing when empty.
#[derive(Debug, Default)]
pub struct RuleRowCollector {
    rows: Vec<RuleRow>,
}

impl RuleRowCollector {
    pub fn new() -> Self { Self::default() }

    pub fn add<S: Into<String>>(&mut self, parent: Option<&str>, child: Option<&str>, allow: bool, reason: S) {
        self.rows.push(RuleRow {
            parent: parent.map(str::to_string),
            child: child.map(str::to_string),
            allow,
            reason: reason.into(),
        });
    }

    pub fn is_empty(&self) -> bool { self.rows.is_empty() }

    pub fn into_rule(self) -> Option<PermissionRule> {
        if self.rows.is_empty() { None } else { Some(PermissionRule::rows(self.rows)) }
    }
}

/// What a rule source sees for one resolution call.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub actor: Option<&'a Actor>,
    pub action: &'a Action,
    pub config: &'a EngineConfig,
    /// Depth of the action's resource model (0 for instance-wide actions).
    pub model_depth: u8,
}

#[async_trait]
pub trait RuleSource: Send + Sync {
    fn name(&self) -> &str;

    async fn provide_rules(&self, ctx: &RuleContext<'_>) -> PermResult<Vec<PermissionRule>>;
}

/// Adapter for sources that answer synchronously.
pub struct FnRuleSource<F> {
    name: String,
    f: F,
}

impl<F> FnRuleSource<F>
where
    F: Fn(&RuleContext<'_>) -> PermResult<Vec<PermissionRule>> + Send + Sync,
{
    pub fn new<N: Into<String>>(name: N, f: F) -> Self { Self { name: name.into(), f } }
}

#[async_trait]
impl<F> RuleSource for FnRuleSource<F>
where
    F: Fn(&RuleContext<'_>) -> PermResult<Vec<PermissionRule>> + Send + Sync,
{
    fn name(&self) -> &str { &self.name }

    async fn provide_rules(&self, ctx: &RuleContext<'_>) -> PermResult<Vec<PermissionRule>> { (self.f)(ctx) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_are_root_level_rows() {
        let r = PermissionRule::deny("nope");
        assert_eq!(r.kind, RuleKind::Rule);
        match r.body {
            RuleBody::Rows(rows) => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0], RuleRow { parent: None, child: None, allow: false, reason: "nope".into() });
            }
            _ => panic!("expected rows"),
        }
    }

    #[test]
    fn empty_collector_yields_no_rule() {
        let mut c = RuleRowCollector::new();
        assert!(c.is_empty());
        assert!(RuleRowCollector::new().into_rule().is_none());
        c.add(Some("db"), Some("t"), true, "keep");
        assert!(!c.is_empty());
        let rule = c.into_rule().unwrap();
        assert!(matches!(rule.body, RuleBody::Rows(ref r) if r.len() == 1 && r[0].child.as_deref() == Some("t")));
    }

    #[tokio::test]
    async fn fn_source_passes_context_through() {
        let src = FnRuleSource::new("echo", |ctx: &RuleContext<'_>| Ok(vec![PermissionRule::allow(format!("for {}", ctx.action.name))]));
        let action = Action::new("view-instance", Some("vi"), "");
        let cfg = EngineConfig::default();
        let ctx = RuleContext { actor: None, action: &action, config: &cfg, model_depth: 0 };
        let rules = src.provide_rules(&ctx).await.unwrap();
        assert_eq!(src.name(), "echo");
        assert!(matches!(&rules[0].body, RuleBody::Rows(r) if r[0].reason == "for view-instance"));
    }
}
