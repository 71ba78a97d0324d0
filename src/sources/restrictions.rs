use async_trait::async_trait;

use crate::actor::ActorRestrictions;
use crate::error::PermResult;
use crate::rules::{PermissionRule, RuleContext, RuleSource};

/// Turns an actor's `_r` key into an allowlist. Actors without `_r`, or with the action
/// in their global list, get no restriction at all.
pub struct ActorRestrictionSource;

#[async_trait]
impl RuleSource for ActorRestrictionSource {
    fn name(&self) -> &str { "actor_restrictions" }

    async fn provide_rules(&self, ctx: &RuleContext<'_>) -> PermResult<Vec<PermissionRule>> {
        let Some(restrictions) = ActorRestrictions::from_actor(ctx.actor) else {
            return Ok(Vec::new());
        };
        let names = ctx.action.name_variants();
        if restrictions.is_globally_allowed(&names) {
            return Ok(Vec::new());
        }
        let mut rows: Vec<(Option<String>, Option<String>)> = Vec::new();
        for db in restrictions.allowed_parents(&names) {
            rows.push((Some(db), None));
        }
        for (db, child) in restrictions.allowed_children(&names) {
            rows.push((Some(db), Some(child)));
        }
        Ok(vec![PermissionRule::restriction_rows(rows)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Action;
    use crate::actor::Actor;
    use crate::config::EngineConfig;
    use crate::rules::{RuleBody, RuleKind};
    use serde_json::json;

    async fn run(actor: Option<&Actor>) -> Vec<PermissionRule> {
        let action = Action::new("view-table", Some("vt"), "");
        let cfg = EngineConfig::default();
        let ctx = RuleContext { actor, action: &action, config: &cfg, model_depth: 2 };
        ActorRestrictionSource.provide_rules(&ctx).await.unwrap()
    }

    #[tokio::test]
    async fn unrestricted_actors_have_no_opinion() {
        assert!(run(None).await.is_empty());
        assert!(run(Some(&Actor::with_id("a"))).await.is_empty());
        let global = Actor::with_id("a").attr("_r", json!({"a": ["vt"]}));
        assert!(run(Some(&global)).await.is_empty());
    }

    #[tokio::test]
    async fn abbreviations_and_names_build_allowlist() {
        let actor = Actor::with_id("a").attr("_r", json!({"d": {"sales": ["view-table"]}, "r": {"hr": {"staff": ["vt"], "pay": ["dt"]}}}));
        let rules = run(Some(&actor)).await;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].kind, RuleKind::Restriction);
        let RuleBody::Rows(rows) = &rules[0].body else { panic!("expected rows") };
        let pairs: Vec<(Option<&str>, Option<&str>)> = rows.iter().map(|r| (r.parent.as_deref(), r.child.as_deref())).collect();
        assert_eq!(pairs, vec![(Some("sales"), None), (Some("hr"), Some("staff"))]);
    }

    #[tokio::test]
    async fn unrelated_restrictions_admit_nothing() {
        let actor = Actor::with_id("a").attr("_r", json!({"a": ["vi"]}));
        let rules = run(Some(&actor)).await;
        assert!(matches!(&rules[0].body, RuleBody::Rows(r) if r.is_empty()));
    }
}
