//! Built-in rule sources. Registered ahead of any caller-supplied source, in the order
//! returned by [`default_sources`], so their reasons win ties.

mod config;
mod defaults;
mod restrictions;
mod root;

use std::sync::Arc;

pub use config::ConfigRuleSource;
pub use defaults::{DefaultRuleSource, DEFAULT_ALLOW_ACTIONS};
pub use restrictions::ActorRestrictionSource;
pub use root::RootUserSource;

use crate::config::PermissionsConfig;
use crate::rules::RuleSource;

pub fn default_sources(permissions: PermissionsConfig) -> Vec<Arc<dyn RuleSource>> {
    vec![
        Arc::new(ActorRestrictionSource),
        Arc::new(RootUserSource),
        Arc::new(ConfigRuleSource::new(permissions)),
        Arc::new(DefaultRuleSource),
    ]
}
