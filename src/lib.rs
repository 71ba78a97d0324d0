pub mod error;
pub mod config;
pub mod query;
pub mod actor;
pub mod resource;
pub mod actions;
pub mod rules;
pub mod sources;
pub mod aggregate;
pub mod precedence;
pub mod cursor;
pub mod catalog;
pub mod engine;

pub use actions::{Action, ActionRegistry};
pub use actor::Actor;
pub use catalog::Catalog;
pub use config::{EngineConfig, PermissionsConfig};
pub use engine::{EngineBuilder, Page, PageRequest, PermissionEngine, Visibility};
pub use error::{PermError, PermResult};
pub use precedence::Decision;
pub use query::QueryFragment;
pub use resource::{Resource, ResourceModel};
pub use rules::{PermissionRule, RuleContext, RuleSource};

// Test-only printing helper: expands to eprintln! during tests and debug builds.
// Usage in tests: tprintln!("debug: {}", value);
#[cfg(any(test, debug_assertions))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ( eprintln!($($arg)*) );
}

// In release builds the macro keeps format checking and prints nothing.
#[cfg(not(any(test, debug_assertions)))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ({
        if false { let _ = format!($($arg)*); }
    });
}
