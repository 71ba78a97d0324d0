use async_trait::async_trait;

use crate::error::PermResult;
use crate::rules::{PermissionRule, RuleContext, RuleSource};

/// Instance-wide allow for the actor with id "root" when `root_enabled` is set.
/// Deeper denies from other sources still apply.
pub struct RootUserSource;

#[async_trait]
impl RuleSource for RootUserSource {
    fn name(&self) -> &str { "root" }

    async fn provide_rules(&self, ctx: &RuleContext<'_>) -> PermResult<Vec<PermissionRule>> {
        let is_root = ctx.config.root_enabled && ctx.actor.and_then(|a| a.id()).as_deref() == Some("root");
        Ok(if is_root { vec![PermissionRule::allow("root user")] } else { Vec::new() })
    }
}
