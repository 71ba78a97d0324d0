use async_trait::async_trait;

use crate::error::PermResult;
use crate::rules::{PermissionRule, RuleContext, RuleSource};

/// Actions allowed instance-wide unless `default_deny` is set.
pub const DEFAULT_ALLOW_ACTIONS: &[&str] = &[
    "view-instance",
    "view-database",
    "view-database-download",
    "view-table",
    "view-query",
    "execute-sql",
];

/// Instance-wide defaults. `execute-sql` gets a root deny unless `default_allow_sql`,
/// which makes the default allow for it a no-op at equal specificity.
pub struct DefaultRuleSource;

#[async_trait]
impl RuleSource for DefaultRuleSource {
    fn name(&self) -> &str { "defaults" }

    async fn provide_rules(&self, ctx: &RuleContext<'_>) -> PermResult<Vec<PermissionRule>> {
        let name = ctx.action.name.as_str();
        let mut out = Vec::new();
        if name == "execute-sql" && !ctx.config.default_allow_sql {
            out.push(PermissionRule::deny("default_allow_sql is false"));
        }
        if !ctx.config.default_deny && DEFAULT_ALLOW_ACTIONS.contains(&name) {
            out.push(PermissionRule::allow(format!("default allow for {}", name)));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Action;
    use crate::config::EngineConfig;
    use crate::rules::RuleBody;

    async fn reasons(action: &str, config: EngineConfig) -> Vec<(bool, String)> {
        let action = Action::new(action, None, "");
        let ctx = RuleContext { actor: None, action: &action, config: &config, model_depth: 0 };
        DefaultRuleSource
            .provide_rules(&ctx)
            .await
            .unwrap()
            .into_iter()
            .map(|r| match r.body {
                RuleBody::Rows(rows) => (rows[0].allow, rows[0].reason.clone()),
                RuleBody::Sql(_) => panic!("defaults are literal rows"),
            })
            .collect()
    }

    #[tokio::test]
    async fn view_actions_allowed_by_default() {
        assert_eq!(reasons("view-table", EngineConfig::default()).await, vec![(true, "default allow for view-table".to_string())]);
        assert!(reasons("drop-table", EngineConfig::default()).await.is_empty());
        let deny = EngineConfig { default_deny: true, ..Default::default() };
        assert!(reasons("view-table", deny).await.is_empty());
    }

    #[tokio::test]
    async fn execute_sql_needs_opt_in() {
        let got = reasons("execute-sql", EngineConfig::default()).await;
        assert_eq!(got[0], (false, "default_allow_sql is false".to_string()));
        let on = EngineConfig { default_allow_sql: true, ..Default::default() };
        assert_eq!(reasons("execute-sql", on).await, vec![(true, "default allow for execute-sql".to_string())]);
    }
}
