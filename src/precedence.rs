//! Precedence resolution: reduce the `(resource, matching rule)` rows of the composed
//! query to one decision per resource.
//!
//! Per resource: take the most specific level that has a rule (child > parent > root);
//! at that level any deny wins, otherwise allow. Ties on the reported reason go to the
//! first-registered source, then to the fragment it returned first. No rule at all is
//! a deny. A resource outside an actor's restriction allowlist is denied whatever the
//! rules say.

use serde::{Deserialize, Serialize};

use crate::resource::Resource;

pub const NO_MATCHING_RULE: &str = "no matching rule";

/// One row of the joined relation. `allow` is `None` for resources no rule matched.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRow {
    pub resource: Resource,
    pub allow: Option<bool>,
    pub reason: Option<String>,
    pub source_rank: usize,
    pub rule_rank: usize,
    /// 2 = child-specific, 1 = parent-level, 0 = root-wide.
    pub depth: u8,
    pub restricted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub resource: Resource,
    pub allow: bool,
    pub reason: String,
    /// Source whose rule decided, if any rule did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Decision {
    pub fn deny<S: Into<String>>(resource: Resource, reason: S) -> Self {
        Self { resource, allow: false, reason: reason.into(), source: None }
    }
}

/// Resolve the rows of a single resource. `sources` maps source rank to name.
pub fn resolve(resource: &Resource, rows: &[JoinedRow], sources: &[String], restriction_reason: &str) -> Decision {
    let matched = rows.iter().filter(|r| r.allow.is_some());
    let Some(top) = matched.clone().map(|r| r.depth).max() else {
        return Decision::deny(resource.clone(), NO_MATCHING_RULE);
    };
    let level: Vec<&JoinedRow> = matched.filter(|r| r.depth == top).collect();
    let any_deny = level.iter().any(|r| r.allow == Some(false));
    let winner = level
        .iter()
        .filter(|r| r.allow == Some(!any_deny))
        .min_by(|a, b| {
            (a.source_rank, a.rule_rank, a.reason.as_deref()).cmp(&(b.source_rank, b.rule_rank, b.reason.as_deref()))
        });
    // `level` is non-empty and every row in it has the chosen allow value or the opposite.
    let Some(winner) = winner else {
        return Decision::deny(resource.clone(), NO_MATCHING_RULE);
    };
    let decision = Decision {
        resource: resource.clone(),
        allow: !any_deny,
        reason: winner.reason.clone().unwrap_or_default(),
        source: sources.get(winner.source_rank).cloned(),
    };
    if decision.allow && rows.iter().any(|r| r.restricted) {
        return Decision { allow: false, reason: restriction_reason.to_string(), ..decision };
    }
    decision
}

/// Folds rows ordered by resource into decisions, one group at a time.
pub struct Grouper<'a> {
    sources: &'a [String],
    restriction_reason: &'a str,
    current: Vec<JoinedRow>,
}

impl<'a> Grouper<'a> {
    pub fn new(sources: &'a [String], restriction_reason: &'a str) -> Self {
        Self { sources, restriction_reason, current: Vec::new() }
    }

    /// Add a row; returns the finished decision of the previous resource when this row
    /// starts a new one.
    pub fn push(&mut self, row: JoinedRow) -> Option<Decision> {
        let done = match self.current.first() {
            Some(first) if first.resource != row.resource => self.flush(),
            _ => None,
        };
        self.current.push(row);
        done
    }

    pub fn finish(mut self) -> Option<Decision> { self.flush() }

    fn flush(&mut self) -> Option<Decision> {
        let rows = std::mem::take(&mut self.current);
        let first = rows.first()?;
        Some(resolve(&first.resource, &rows, self.sources, self.restriction_reason))
    }
}
