//! Rule aggregation: collect fragments from every source, check them, and compose one
//! relational query joining the resource universe against the union of all rules.
//!
//! Composed shape:
//!
//! ```sql
//! WITH base AS (...),            -- enumeration, one constant row, or a constant set
//!      rules AS (... UNION ALL ...),
//!      restrictions AS (...)     -- only when some source restricts
//! SELECT b.parent, b.child, r.allow, r.reason, r.source_rank, r.rule_rank, depth, restricted
//! FROM base b LEFT JOIN rules r ON (r.parent IS NULL OR r.parent = b.parent)
//!                              AND (r.child IS NULL OR r.child = b.child)
//! ORDER BY b.parent, b.child
//! ```
//!
//! The rows come back grouped by resource, so [`Grouper`] can decide each resource as
//! soon as its rows are complete and pagination can stop reading early.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::actions::Action;
use crate::actor::{actor_json, Actor};
use crate::catalog::Snapshot;
use crate::error::{PermError, PermResult};
use crate::precedence::{Decision, Grouper, JoinedRow};
use crate::query::{is_reserved_param, is_valid_param_name, Params, QueryFragment, SqlValue, RESERVED_PARAMS};
use crate::resource::{ModelEntry, Resource};
use crate::rules::{PermissionRule, RuleBody, RuleContext, RuleKind, RuleRow, RuleSource};

/// Rules one source returned for one call. `rank` is the source's registration index.
#[derive(Debug, Clone)]
pub struct SourceRules {
    pub source: String,
    pub rank: usize,
    pub rules: Vec<PermissionRule>,
}

/// Poll every source concurrently and keep their answers in registration order.
/// Any failing source fails the whole call.
pub async fn collect(sources: &[Arc<dyn RuleSource>], ctx: &RuleContext<'_>) -> PermResult<Vec<SourceRules>> {
    let answers = join_all(sources.iter().map(|s| s.provide_rules(ctx))).await;
    let mut out = Vec::with_capacity(sources.len());
    for (rank, (source, answer)) in sources.iter().zip(answers).enumerate() {
        let name = source.name().to_string();
        let mut rules = match answer {
            Ok(r) => r,
            Err(e) => {
                warn!(target: "permsql::aggregate", "rule source '{}' failed for action '{}': {}", name, ctx.action.name, e);
                return Err(match e {
                    PermError::RuleSourceExecution { .. } => e,
                    other => PermError::source_failed(&name, other),
                });
            }
        };
        for rule in rules.iter_mut() { rule.source = name.clone(); }
        out.push(SourceRules { source: name, rank, rules });
    }
    Ok(out)
}

/// Which resources the composed query decides.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// One resource bound as constants; it need not exist in the catalog.
    Point(Resource),
    /// A fixed set of resources bound as constants.
    Set(Vec<Resource>),
    /// Every enumerated resource of the model, optionally under one parent and after a
    /// keyset position.
    Universe { parent: Option<String>, after: Option<Resource> },
}

#[derive(Debug, Clone, Serialize)]
pub struct CombinedQuery {
    pub sql: String,
    pub params: Params,
    /// Contract check over the SQL-bodied rule fragments; `None` when there are none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_sql: Option<String>,
    /// Source names indexed by rank.
    pub sources: Vec<String>,
    pub restricting_sources: usize,
    pub action: String,
    pub model_depth: u8,
    #[serde(skip)]
    restriction_reason: String,
    #[serde(skip)]
    model_shape: &'static str,
}

fn level_name(depth: u8) -> &'static str {
    match depth {
        0 => "root-level",
        1 => "parent-level",
        _ => "child-level",
    }
}

fn invalid<S: Into<String>>(source: &str, message: S) -> PermError {
    PermError::InvalidRuleFragment { source_name: source.to_string(), message: message.into() }
}

/// Named parameters shared by every fragment of one composed query.
struct ParamSpace {
    params: Params,
    owners: HashMap<String, String>,
}

impl ParamSpace {
    fn new() -> Self { Self { params: Params::new(), owners: HashMap::new() } }

    fn engine<V: Into<SqlValue>>(&mut self, name: &str, value: V) {
        self.params.insert(name.to_string(), value.into());
    }

    fn claim(&mut self, name: &str, value: &SqlValue, owner: &str) -> PermResult<()> {
        if let Some(prev) = self.owners.get(name) {
            if prev == owner && self.params.get(name) == Some(value) {
                return Ok(());
            }
            warn!(
                target: "permsql::aggregate",
                "parameter :{} collides between sources '{}' and '{}'", name, prev, owner
            );
            return Err(PermError::RuleParameterCollision {
                param: name.to_string(),
                first: prev.clone(),
                second: owner.to_string(),
            });
        }
        self.owners.insert(name.to_string(), owner.to_string());
        self.params.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn adopt(&mut self, q: &QueryFragment, owner: &str) -> PermResult<()> {
        for (name, value) in q.params.iter() {
            self.claim(name, value, owner)?;
        }
        Ok(())
    }
}

/// Reject fragments that declare bad names, reference parameters they do not own, or
/// smuggle in extra statements.
fn check_fragment(q: &QueryFragment, owner: &str) -> PermResult<()> {
    if q.sql.trim().is_empty() {
        return Err(invalid(owner, "empty SQL"));
    }
    if q.code_text().contains(';') {
        return Err(invalid(owner, "statement separators are not allowed"));
    }
    for name in q.params.keys() {
        if !is_valid_param_name(name) {
            return Err(invalid(owner, format!("invalid parameter name :{}", name)));
        }
        if is_reserved_param(name) {
            return Err(invalid(owner, format!("parameter :{} is reserved", name)));
        }
    }
    for name in q.placeholders() {
        if !q.params.contains_key(&name) && !RESERVED_PARAMS.contains(&name.as_str()) {
            return Err(invalid(owner, format!("references undeclared parameter :{}", name)));
        }
    }
    Ok(())
}

/// Render literal rows as a bound `SELECT ... UNION ALL ...`.
fn rows_sql(rows: &[RuleRow], prefix: &str, space: &mut ParamSpace, with_allow: bool) -> String {
    if rows.is_empty() {
        return if with_allow {
            "SELECT NULL AS parent, NULL AS child, NULL AS allow, NULL AS reason WHERE 0".to_string()
        } else {
            QueryFragment::empty_resources().sql
        };
    }
    let mut parts = Vec::with_capacity(rows.len());
    for (k, row) in rows.iter().enumerate() {
        let p = format!("{}_{}_p", prefix, k);
        let c = format!("{}_{}_c", prefix, k);
        space.engine(&p, row.parent.clone());
        space.engine(&c, row.child.clone());
        if with_allow {
            let why = format!("{}_{}_why", prefix, k);
            space.engine(&why, row.reason.clone());
            parts.push(format!(
                "SELECT :{} AS parent, :{} AS child, {} AS allow, :{} AS reason",
                p,
                c,
                if row.allow { 1 } else { 0 },
                why
            ));
        } else {
            parts.push(format!("SELECT :{} AS parent, :{} AS child", p, c));
        }
    }
    parts.join(" UNION ALL ")
}

fn check_rows(rows: &[RuleRow], source: &str, action: &Action, model: &ModelEntry) -> PermResult<()> {
    for row in rows {
        if row.parent.is_none() && row.child.is_some() {
            return Err(invalid(source, "row has a child but no parent"));
        }
        let depth = if row.child.is_some() { 2 } else if row.parent.is_some() { 1 } else { 0 };
        if depth > model.depth {
            return Err(PermError::RuleContractViolation {
                source_name: source.to_string(),
                action: action.name.clone(),
                level: level_name(depth),
                shape: model.shape(),
            });
        }
    }
    Ok(())
}

fn shape_filter(depth: u8) -> &'static str {
    match depth {
        0 => "1",
        1 => "b.parent IS NOT NULL AND b.child IS NULL",
        _ => "b.parent IS NOT NULL AND b.child IS NOT NULL",
    }
}

/// Keyset predicate strictly after `after` in `(parent, child)` order.
fn cursor_predicate(depth: u8, after: &Resource, space: &mut ParamSpace) -> String {
    space.engine("_cursor_parent", after.parent.clone());
    match depth {
        0 => "0".to_string(),
        1 => "b.parent > :_cursor_parent".to_string(),
        _ => {
            space.engine("_cursor_child", after.child.clone());
            "(b.parent > :_cursor_parent OR (b.parent = :_cursor_parent AND b.child > :_cursor_child))".to_string()
        }
    }
}

fn base_sql(model: &ModelEntry, target: &Target, space: &mut ParamSpace) -> PermResult<String> {
    Ok(match target {
        Target::Point(res) => {
            space.engine("_check_parent", res.parent.clone());
            space.engine("_check_child", res.child.clone());
            "SELECT :_check_parent AS parent, :_check_child AS child".to_string()
        }
        Target::Set(list) if list.is_empty() => QueryFragment::empty_resources().sql,
        Target::Set(list) => list
            .iter()
            .enumerate()
            .map(|(i, res)| {
                let p = format!("_set_{}_p", i);
                let c = format!("_set_{}_c", i);
                space.engine(&p, res.parent.clone());
                space.engine(&c, res.child.clone());
                format!("SELECT :{} AS parent, :{} AS child", p, c)
            })
            .collect::<Vec<_>>()
            .join(" UNION ALL "),
        Target::Universe { parent, after } => {
            let owner = format!("resource model {}", model.model.name);
            let enumeration = &model.model.enumeration;
            check_fragment(enumeration, &owner)?;
            space.adopt(enumeration, &owner)?;
            let mut conds = vec![shape_filter(model.depth).to_string()];
            if let Some(p) = parent {
                space.engine("_filter_parent", p.clone());
                conds.push("b.parent = :_filter_parent".to_string());
            }
            if let Some(after) = after {
                conds.push(cursor_predicate(model.depth, after, space));
            }
            format!(
                "SELECT b.parent AS parent, b.child AS child FROM (\n{}\n) AS b WHERE {}",
                enumeration.sql,
                conds.join(" AND ")
            )
        }
    })
}

/// Compose the combined query for one call. Pure: no I/O, all values bound.
pub fn compose(
    action: &Action,
    model: &ModelEntry,
    actor: Option<&Actor>,
    all_sources: &[String],
    collected: &[SourceRules],
    target: &Target,
) -> PermResult<CombinedQuery> {
    let mut space = ParamSpace::new();
    space.engine("actor", actor_json(actor));
    space.engine("actor_id", actor.and_then(Actor::id));
    space.engine("action", action.name.as_str());

    let mut rule_parts: Vec<String> = Vec::new();
    let mut validation_parts: Vec<String> = Vec::new();
    let mut restriction_parts: Vec<String> = Vec::new();
    let mut restricting: Vec<usize> = Vec::new();

    for sr in collected {
        for (fi, rule) in sr.rules.iter().enumerate() {
            let si = sr.rank;
            let frag_sql = match &rule.body {
                RuleBody::Sql(q) => {
                    check_fragment(q, &sr.source)?;
                    space.adopt(q, &sr.source)?;
                    if rule.kind == RuleKind::Rule {
                        validation_parts.push(format!(
                            "SELECT parent, child, allow, {} AS source_rank FROM (\n{}\n)",
                            si, q.sql
                        ));
                    }
                    q.sql.clone()
                }
                RuleBody::Rows(rows) => {
                    if rule.kind == RuleKind::Rule {
                        if rows.is_empty() { continue; }
                        check_rows(rows, &sr.source, action, model)?;
                    } else if rows.iter().any(|r| r.parent.is_none() && r.child.is_some()) {
                        return Err(invalid(&sr.source, "allowlist row has a child but no parent"));
                    }
                    rows_sql(rows, &format!("_s{}_{}", si, fi), &mut space, rule.kind == RuleKind::Rule)
                }
            };
            match rule.kind {
                RuleKind::Rule => rule_parts.push(format!(
                    "SELECT parent, child, allow, reason, {} AS source_rank, {} AS rule_rank FROM (\n{}\n)",
                    si, fi, frag_sql
                )),
                RuleKind::Restriction => {
                    if !restricting.contains(&si) { restricting.push(si); }
                    restriction_parts.push(format!("SELECT parent, child, {} AS source_rank FROM (\n{}\n)", si, frag_sql));
                }
            }
        }
    }

    let base = base_sql(model, target, &mut space)?;
    let rules = if rule_parts.is_empty() {
        "SELECT NULL AS parent, NULL AS child, NULL AS allow, NULL AS reason, 0 AS source_rank, 0 AS rule_rank WHERE 0"
            .to_string()
    } else {
        rule_parts.join("\nUNION ALL\n")
    };
    let (restrictions_cte, restricted_expr) = if restriction_parts.is_empty() {
        (String::new(), "0".to_string())
    } else {
        (
            format!(",\nrestrictions AS (\n{}\n)", restriction_parts.join("\nUNION ALL\n")),
            format!(
                "(SELECT COUNT(DISTINCT x.source_rank) FROM restrictions x \
                 WHERE (x.parent IS NULL OR x.parent = b.parent) AND (x.child IS NULL OR x.child = b.child)) < {}",
                restricting.len()
            ),
        )
    };
    let sql = format!(
        "WITH base AS (\n{base}\n),\nrules AS (\n{rules}\n){restrictions_cte}\n\
         SELECT b.parent AS parent, b.child AS child, r.allow AS allow, r.reason AS reason, \
         r.source_rank AS source_rank, r.rule_rank AS rule_rank,\n\
         CASE WHEN r.allow IS NULL THEN -1 WHEN r.child IS NOT NULL THEN 2 WHEN r.parent IS NOT NULL THEN 1 ELSE 0 END AS depth,\n\
         {restricted_expr} AS restricted\n\
         FROM base b LEFT JOIN rules r\n\
         ON (r.parent IS NULL OR r.parent = b.parent) AND (r.child IS NULL OR r.child = b.child)\n\
         ORDER BY b.parent, b.child"
    );
    let validation_sql = if validation_parts.is_empty() {
        None
    } else {
        Some(format!(
            "WITH frags AS (\n{}\n)\n\
             SELECT source_rank,\n\
             MAX(CASE WHEN child IS NOT NULL AND parent IS NULL THEN 1 ELSE 0 END) AS orphan,\n\
             MAX(CASE WHEN child IS NOT NULL THEN 2 WHEN parent IS NOT NULL THEN 1 ELSE 0 END) AS deepest,\n\
             MAX(CASE WHEN allow IS NULL OR allow NOT IN (0, 1) THEN 1 ELSE 0 END) AS bad_allow\n\
             FROM frags GROUP BY source_rank ORDER BY source_rank",
            validation_parts.join("\nUNION ALL\n")
        ))
    };
    debug!(
        target: "permsql::aggregate",
        "composed action='{}' rule_fragments={} restriction_fragments={} params={}",
        action.name,
        rule_parts.len(),
        restriction_parts.len(),
        space.params.len()
    );
    Ok(CombinedQuery {
        sql,
        params: space.params,
        validation_sql,
        sources: all_sources.to_vec(),
        restricting_sources: restricting.len(),
        action: action.name.clone(),
        model_depth: model.depth,
        restriction_reason: format!("actor restrictions: {} not in allowlist", action.name),
        model_shape: model.shape(),
    })
}

fn text_of(v: SqlValue) -> Option<String> {
    match v {
        SqlValue::Null => None,
        SqlValue::Text(s) => Some(s),
        SqlValue::Integer(i) => Some(i.to_string()),
        SqlValue::Real(f) => Some(f.to_string()),
    }
}

/// Decode one row of the composed query.
pub fn decode_row(row: &rusqlite::Row<'_>) -> PermResult<JoinedRow> {
    let parent = text_of(SqlValue::from_ref(row.get_ref(0)?));
    let child = text_of(SqlValue::from_ref(row.get_ref(1)?));
    let allow: Option<i64> = row.get(2)?;
    let reason = text_of(SqlValue::from_ref(row.get_ref(3)?));
    let source_rank: Option<i64> = row.get(4)?;
    let rule_rank: Option<i64> = row.get(5)?;
    let depth: i64 = row.get(6)?;
    let restricted: i64 = row.get(7)?;
    Ok(JoinedRow {
        resource: Resource { parent, child },
        allow: allow.map(|a| a != 0),
        reason,
        source_rank: source_rank.unwrap_or_default().max(0) as usize,
        rule_rank: rule_rank.unwrap_or_default().max(0) as usize,
        depth: depth.clamp(0, 2) as u8,
        restricted: restricted != 0,
    })
}

impl CombinedQuery {
    /// Fail the call if any SQL fragment produced rows the action's model cannot have.
    pub fn check_contract(&self, snap: &Snapshot<'_>) -> PermResult<()> {
        let Some(sql) = &self.validation_sql else { return Ok(()) };
        let mut violation: Option<PermError> = None;
        snap.query_each(sql, &self.params, |row| {
            let rank: i64 = row.get(0)?;
            let orphan: i64 = row.get(1)?;
            let deepest: i64 = row.get(2)?;
            let bad_allow: i64 = row.get(3)?;
            let source = self.sources.get(rank.max(0) as usize).cloned().unwrap_or_default();
            violation = if orphan != 0 {
                Some(invalid(&source, "row has a child but no parent"))
            } else if bad_allow != 0 {
                Some(invalid(&source, "allow must be 0 or 1"))
            } else if deepest > i64::from(self.model_depth) {
                Some(PermError::RuleContractViolation {
                    source_name: source,
                    action: self.action.clone(),
                    level: level_name(deepest.clamp(0, 2) as u8),
                    shape: self.model_shape,
                })
            } else {
                None
            };
            Ok(violation.is_none())
        })?;
        match violation {
            Some(e) => {
                warn!(target: "permsql::aggregate", "rejecting rules for '{}': {}", self.action, e);
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Stream decisions in `(parent, child)` order until `visit` returns `Ok(false)`.
    pub fn for_each_decision<F>(&self, snap: &Snapshot<'_>, mut visit: F) -> PermResult<()>
    where
        F: FnMut(Decision) -> PermResult<bool>,
    {
        let mut grouper = Grouper::new(&self.sources, &self.restriction_reason);
        let mut stopped = false;
        snap.query_each(&self.sql, &self.params, |row| {
            let joined = decode_row(row)?;
            if let Some(done) = grouper.push(joined) {
                if !visit(done)? {
                    stopped = true;
                    return Ok(false);
                }
            }
            Ok(true)
        })?;
        if !stopped {
            if let Some(last) = grouper.finish() {
                visit(last)?;
            }
        }
        Ok(())
    }

    /// Decide every target resource, collecting the decisions.
    pub fn decisions(&self, snap: &Snapshot<'_>) -> PermResult<Vec<Decision>> {
        let mut out = Vec::new();
        self.for_each_decision(snap, |d| {
            out.push(d);
            Ok(true)
        })?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::EngineConfig;
    use crate::resource::{ResourceModels, TABLE};
    use crate::rules::FnRuleSource;

    fn view_table() -> Action { Action::new("view-table", Some("vt"), "").on(TABLE) }

    fn table_model() -> ModelEntry { ResourceModels::with_core_models().get(TABLE).unwrap().clone() }

    fn sr(source: &str, rank: usize, rules: Vec<PermissionRule>) -> SourceRules {
        let rules = rules.into_iter().map(|mut r| { r.source = source.to_string(); r }).collect();
        SourceRules { source: source.to_string(), rank, rules }
    }

    async fn decide(collected: Vec<SourceRules>, target: Target) -> PermResult<Vec<Decision>> {
        let cat = Arc::new(Catalog::in_memory()?);
        for (d, t) in [("hr", "payroll"), ("sales", "orders"), ("sales", "leads")] { cat.add_table(d, t)?; }
        let names: Vec<String> = collected.iter().map(|s| s.source.clone()).collect();
        let q = compose(&view_table(), &table_model(), None, &names, &collected, &target)?;
        let guard = cat.read_guard();
        cat.snapshot(&guard, move |snap| {
            q.check_contract(snap)?;
            q.decisions(snap)
        })
        .await
    }

    #[tokio::test]
    async fn parent_rule_beats_root_rule_over_universe() {
        let mut parent_allow = crate::rules::RuleRowCollector::new();
        parent_allow.add(Some("sales"), None, true, "sales team");
        let got = decide(
            vec![sr("a", 0, vec![PermissionRule::deny("deny all")]), sr("b", 1, vec![parent_allow.into_rule().unwrap()])],
            Target::Universe { parent: None, after: None },
        )
        .await
        .unwrap();
        let summary: Vec<(String, bool)> = got.iter().map(|d| (d.resource.to_string(), d.allow)).collect();
        assert_eq!(
            summary,
            vec![("/hr/payroll".to_string(), false), ("/sales/leads".to_string(), true), ("/sales/orders".to_string(), true)]
        );
        assert_eq!(got[1].reason, "sales team");
    }

    #[tokio::test]
    async fn sql_fragments_bind_their_own_params() {
        let q = QueryFragment::new("SELECT :p AS parent, NULL AS child, 1 AS allow, 'by sql' AS reason").bind("p", "hr");
        let got = decide(vec![sr("sql", 0, vec![PermissionRule::sql(q)])], Target::Point(Resource::child("hr", "payroll")))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert!(got[0].allow);
        assert_eq!(got[0].reason, "by sql");
    }

    #[tokio::test]
    async fn cursor_and_parent_filter_narrow_the_universe() {
        let got = decide(
            vec![sr("a", 0, vec![PermissionRule::allow("ok")])],
            Target::Universe { parent: Some("sales".into()), after: Some(Resource::child("sales", "leads")) },
        )
        .await
        .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].resource, Resource::child("sales", "orders"));
    }

    #[tokio::test]
    async fn restrictions_limit_allowed_resources() {
        let allow = sr("a", 0, vec![PermissionRule::allow("ok")]);
        let restrict = sr("r", 1, vec![PermissionRule::restriction_rows(vec![(Some("sales".into()), Some("orders".into()))])]);
        let got = decide(vec![allow, restrict], Target::Universe { parent: None, after: None }).await.unwrap();
        let allowed: Vec<String> = got.iter().filter(|d| d.allow).map(|d| d.resource.to_string()).collect();
        assert_eq!(allowed, vec!["/sales/orders"]);
        let denied = got.iter().find(|d| !d.allow).unwrap();
        assert_eq!(denied.reason, "actor restrictions: view-table not in allowlist");
    }

    #[tokio::test]
    async fn empty_allowlist_admits_nothing() {
        let allow = sr("a", 0, vec![PermissionRule::allow("ok")]);
        let restrict = sr("r", 1, vec![PermissionRule::restriction_rows(vec![])]);
        let got = decide(vec![allow, restrict], Target::Set(vec![Resource::child("sales", "orders")])).await.unwrap();
        assert!(!got[0].allow);
    }

    #[tokio::test]
    async fn deep_sql_rows_violate_contract_for_shallow_models() {
        let cat = Arc::new(Catalog::in_memory().unwrap());
        cat.add_database("sales").unwrap();
        let action = Action::new("view-database", Some("vd"), "").on(crate::resource::DATABASE);
        let model = ResourceModels::with_core_models().get(crate::resource::DATABASE).unwrap().clone();
        let q = QueryFragment::new("SELECT 'sales' AS parent, 'orders' AS child, 1 AS allow, 'x' AS reason");
        let collected = vec![sr("deep", 0, vec![PermissionRule::sql(q)])];
        let combined = compose(&action, &model, None, &["deep".into()], &collected, &Target::Point(Resource::parent("sales"))).unwrap();
        let guard = cat.read_guard();
        let r = cat.snapshot(&guard, move |snap| combined.check_contract(snap)).await;
        match r {
            Err(PermError::RuleContractViolation { source_name, level, .. }) => {
                assert_eq!(source_name, "deep");
                assert_eq!(level, "child-level");
            }
            other => panic!("expected contract violation, got {:?}", other),
        }
    }

    #[test]
    fn literal_rows_deeper_than_model_are_rejected_before_execution() {
        let action = Action::new("view-instance", Some("vi"), "");
        let model = ResourceModels::with_core_models().get(crate::resource::INSTANCE).unwrap().clone();
        let mut c = crate::rules::RuleRowCollector::new();
        c.add(Some("db"), None, true, "db");
        let collected = vec![sr("rows", 0, vec![c.into_rule().unwrap()])];
        let r = compose(&action, &model, None, &["rows".into()], &collected, &Target::Point(Resource::root()));
        assert!(matches!(r, Err(PermError::RuleContractViolation { .. })));
    }

    #[test]
    fn parameter_collisions_between_sources_fail() {
        let a = QueryFragment::new("SELECT :team AS parent, NULL AS child, 1 AS allow, 'a' AS reason").bind("team", "x");
        let b = QueryFragment::new("SELECT :team AS parent, NULL AS child, 0 AS allow, 'b' AS reason").bind("team", "y");
        let collected = vec![sr("alpha", 0, vec![PermissionRule::sql(a.clone())]), sr("beta", 1, vec![PermissionRule::sql(b)])];
        let r = compose(&view_table(), &table_model(), None, &["alpha".into(), "beta".into()], &collected, &Target::Set(vec![]));
        match r {
            Err(PermError::RuleParameterCollision { param, first, second }) => {
                assert_eq!((param.as_str(), first.as_str(), second.as_str()), ("team", "alpha", "beta"));
            }
            other => panic!("expected collision, got {:?}", other),
        }
        let same = vec![sr("alpha", 0, vec![PermissionRule::sql(a.clone()), PermissionRule::sql(a)])];
        assert!(compose(&view_table(), &table_model(), None, &["alpha".into()], &same, &Target::Set(vec![])).is_ok());
    }

    #[test]
    fn fragments_cannot_use_reserved_or_undeclared_params() {
        let names = vec!["s".to_string()];
        for q in [
            QueryFragment::new("SELECT :x AS parent, NULL AS child, 1 AS allow, '' AS reason"),
            QueryFragment::new("SELECT :_check_parent AS parent, NULL AS child, 1 AS allow, '' AS reason"),
            QueryFragment::new("SELECT NULL AS parent, NULL AS child, 1 AS allow, '' AS reason").bind("actor", "x"),
            QueryFragment::new("SELECT NULL AS parent, NULL AS child, 1 AS allow, '' AS reason; DROP TABLE catalog_tables"),
        ] {
            let collected = vec![sr("s", 0, vec![PermissionRule::sql(q)])];
            let r = compose(&view_table(), &table_model(), None, &names, &collected, &Target::Set(vec![]));
            assert!(matches!(r, Err(PermError::InvalidRuleFragment { .. })), "{:?}", r);
        }
        let ok = QueryFragment::new("SELECT NULL AS parent, NULL AS child, 1 AS allow, 'x;y' AS reason WHERE :actor_id IS NOT NULL");
        let collected = vec![sr("s", 0, vec![PermissionRule::sql(ok)])];
        assert!(compose(&view_table(), &table_model(), None, &names, &collected, &Target::Set(vec![])).is_ok());
    }

    #[test]
    fn actor_values_are_bound_never_inlined() {
        let actor = Actor::with_id("x' OR 1=1 --");
        let q = compose(&view_table(), &table_model(), Some(&actor), &[], &[], &Target::Point(Resource::child("a", "b"))).unwrap();
        assert!(!q.sql.contains("OR 1=1"));
        assert_eq!(q.params.get("actor_id"), Some(&SqlValue::Text("x' OR 1=1 --".into())));
        assert_eq!(q.params.get("action"), Some(&SqlValue::Text("view-table".into())));
    }

    #[tokio::test]
    async fn failing_source_fails_collection() {
        let ok: Arc<dyn RuleSource> = Arc::new(FnRuleSource::new("ok", |_: &RuleContext<'_>| Ok(vec![PermissionRule::allow("ok")])));
        let bad: Arc<dyn RuleSource> =
            Arc::new(FnRuleSource::new("bad", |_: &RuleContext<'_>| Err(PermError::Config("broken".into()))));
        let action = view_table();
        let cfg = EngineConfig::default();
        let ctx = RuleContext { actor: None, action: &action, config: &cfg, model_depth: 2 };
        let got = collect(&[ok.clone()], &ctx).await.unwrap();
        assert_eq!(got[0].rules[0].source, "ok");
        match collect(&[ok, bad], &ctx).await {
            Err(PermError::RuleSourceExecution { source_name, .. }) => assert_eq!(source_name, "bad"),
            other => panic!("expected source failure, got {:?}", other),
        }
    }
}
