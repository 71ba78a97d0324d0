//! Actors are opaque attribute maps resolved by the caller; `None` is the anonymous actor.
//! This module only reads them: allow-block matching and the `_r` restriction allowlist.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use xxhash_rust::xxh3::xxh3_64;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(pub Map<String, Value>);

impl Actor {
    pub fn new() -> Self { Self(Map::new()) }

    pub fn with_id<S: Into<String>>(id: S) -> Self {
        let mut m = Map::new();
        m.insert("id".into(), Value::String(id.into()));
        Self(m)
    }

    pub fn attr<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> { self.0.get(key) }

    /// `id` as text; numeric ids are rendered.
    pub fn id(&self) -> Option<String> {
        match self.0.get("id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn from_json(v: Value) -> Option<Self> {
        match v { Value::Object(m) => Some(Self(m)), _ => None }
    }
}

/// Canonical JSON for binding as `:actor`. serde_json maps are key-ordered without
/// `preserve_order`, so equal actors serialize identically.
pub fn actor_json(actor: Option<&Actor>) -> Option<String> {
    actor.map(|a| Value::Object(a.0.clone()).to_string())
}

/// Stable fingerprint of the actor used to pin pagination cursors to their caller.
pub fn actor_fingerprint(actor: Option<&Actor>) -> u64 {
    match actor_json(actor) {
        Some(s) => xxh3_64(s.as_bytes()),
        None => 0,
    }
}

/// Evaluate an allow block against an actor.
///
/// `true`/`false` are literal; a missing block allows; `{"unauthenticated": true}` admits
/// the anonymous actor; otherwise any key whose values intersect the actor's values (or
/// `"*"` for any actor carrying that key) matches.
pub fn actor_matches_allow(actor: Option<&Actor>, allow: &Value) -> bool {
    let block = match allow {
        Value::Bool(b) => return *b,
        Value::Null => return true,
        Value::Object(m) => m,
        _ => return false,
    };
    if actor.is_none() && block.get("unauthenticated") == Some(&Value::Bool(true)) {
        return true;
    }
    let empty = Actor::new();
    let actor = actor.unwrap_or(&empty);
    for (key, values) in block.iter() {
        if values == &Value::String("*".into()) && actor.0.contains_key(key) {
            return true;
        }
        let wanted: Vec<&Value> = match values {
            Value::Array(a) => a.iter().collect(),
            other => vec![other],
        };
        let Some(have) = actor.get(key) else { continue };
        let have: Vec<&Value> = match have {
            Value::Array(a) => a.iter().collect(),
            other => vec![other],
        };
        if have.iter().any(|h| wanted.contains(h)) {
            return true;
        }
    }
    false
}

/// Parsed `_r` key: allowlists of actions per scope.
///
/// ```json
/// {"a": ["vi"], "d": {"mydb": ["vt", "es"]}, "r": {"mydb": {"users": ["vt"]}}}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActorRestrictions {
    #[serde(default, rename = "a")]
    pub global_actions: Vec<String>,
    #[serde(default, rename = "d")]
    pub database_actions: BTreeMap<String, Vec<String>>,
    #[serde(default, rename = "r")]
    pub resource_actions: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl ActorRestrictions {
    /// `None` when the actor carries no restrictions; a malformed `_r` restricts everything.
    pub fn from_actor(actor: Option<&Actor>) -> Option<Self> {
        let raw = actor?.get("_r")?;
        Some(serde_json::from_value(raw.clone()).unwrap_or_default())
    }

    fn any_of(names: &BTreeSet<String>, list: &[String]) -> bool { list.iter().any(|a| names.contains(a)) }

    /// `names` holds the action's full name and abbreviation.
    pub fn is_globally_allowed(&self, names: &BTreeSet<String>) -> bool { Self::any_of(names, &self.global_actions) }

    pub fn allowed_parents(&self, names: &BTreeSet<String>) -> BTreeSet<String> {
        self.database_actions
            .iter()
            .filter(|(_, acts)| Self::any_of(names, acts))
            .map(|(db, _)| db.clone())
            .collect()
    }

    pub fn allowed_children(&self, names: &BTreeSet<String>) -> BTreeSet<(String, String)> {
        let mut out = BTreeSet::new();
        for (db, children) in self.resource_actions.iter() {
            for (child, acts) in children.iter() {
                if Self::any_of(names, acts) { out.insert((db.clone(), child.clone())); }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(v: &[&str]) -> BTreeSet<String> { v.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn allow_block_literals_and_missing() {
        let a = Actor::with_id("alice");
        assert!(actor_matches_allow(Some(&a), &json!(true)));
        assert!(!actor_matches_allow(Some(&a), &json!(false)));
        assert!(actor_matches_allow(None, &Value::Null));
    }

    #[test]
    fn allow_block_matching() {
        let a = Actor::with_id("alice").attr("roles", json!(["staff", "ops"]));
        assert!(actor_matches_allow(Some(&a), &json!({"id": "alice"})));
        assert!(actor_matches_allow(Some(&a), &json!({"id": ["bob", "alice"]})));
        assert!(actor_matches_allow(Some(&a), &json!({"roles": "ops"})));
        assert!(actor_matches_allow(Some(&a), &json!({"id": "*"})));
        assert!(!actor_matches_allow(Some(&a), &json!({"team": "*"})));
        assert!(!actor_matches_allow(Some(&a), &json!({"id": "bob"})));
        assert!(!actor_matches_allow(None, &json!({"id": "*"})));
        assert!(actor_matches_allow(None, &json!({"unauthenticated": true})));
    }

    #[test]
    fn restrictions_parse_and_query() {
        let a = Actor::with_id("tok").attr("_r", json!({"a": ["vi"], "d": {"sales": ["vt"]}, "r": {"hr": {"staff": ["view-table"]}}}));
        let r = ActorRestrictions::from_actor(Some(&a)).unwrap();
        assert!(r.is_globally_allowed(&names(&["view-instance", "vi"])));
        assert!(!r.is_globally_allowed(&names(&["view-table", "vt"])));
        assert_eq!(r.allowed_parents(&names(&["view-table", "vt"])), names(&["sales"]));
        let kids = r.allowed_children(&names(&["view-table", "vt"]));
        assert!(kids.contains(&("hr".to_string(), "staff".to_string())));
        assert!(ActorRestrictions::from_actor(Some(&Actor::with_id("x"))).is_none());
        assert!(ActorRestrictions::from_actor(None).is_none());
    }

    #[test]
    fn fingerprint_is_stable_per_actor() {
        let a = Actor::with_id("alice").attr("team", "x");
        let b = Actor::with_id("alice").attr("team", "x");
        assert_eq!(actor_fingerprint(Some(&a)), actor_fingerprint(Some(&b)));
        assert_ne!(actor_fingerprint(Some(&a)), actor_fingerprint(None));
    }
}
