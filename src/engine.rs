//!
//! permsql engine
//! --------------
//! Resolution facade. Each call looks up the action, polls every rule source, composes
//! one query and runs it inside a single catalog snapshot. Nothing is cached between
//! calls, so decisions always reflect the catalog as it is now.
//!
//! Actions may name another action through `also_requires`; that action must also be
//! allowed on the resource truncated to its own model (e.g. `execute-sql` on a database
//! needs `view-database` on it). Registries are sealed by [`EngineBuilder::build`].

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::actions::{Action, ActionRegistry};
use crate::actor::{actor_fingerprint, Actor};
use crate::aggregate::{collect, compose, CombinedQuery, SourceRules, Target};
use crate::catalog::{Catalog, ReadGuard, Snapshot};
use crate::config::{EngineConfig, PermissionsConfig};
use crate::cursor::Cursor;
use crate::error::{PermError, PermResult};
use crate::precedence::{Decision, NO_MATCHING_RULE};
use crate::resource::{ModelEntry, Resource, ResourceModel, ResourceModels, INSTANCE};
use crate::rules::{RuleContext, RuleSource};
use crate::sources::default_sources;

pub struct EngineBuilder {
    catalog: Arc<Catalog>,
    config: EngineConfig,
    models: ResourceModels,
    actions: ActionRegistry,
    sources: Vec<Arc<dyn RuleSource>>,
}

impl EngineBuilder {
    pub fn new(catalog: Arc<Catalog>, config: EngineConfig) -> Self {
        Self { catalog, config, models: ResourceModels::new(), actions: ActionRegistry::new(), sources: Vec::new() }
    }

    /// instance, database, table and query.
    pub fn with_core_models(mut self) -> Self {
        for model in ResourceModels::core_models() {
            if let Err(e) = self.models.register(model) {
                warn!(target: "permsql::engine", "skipping core resource model: {}", e);
            }
        }
        self
    }

    pub fn with_core_actions(mut self) -> Self {
        for action in crate::actions::core_actions() {
            if let Err(e) = self.actions.register(action) {
                warn!(target: "permsql::engine", "skipping core action: {}", e);
            }
        }
        self
    }

    /// Put the built-in sources ahead of anything registered so far.
    pub fn with_default_sources(mut self, permissions: PermissionsConfig) -> Self {
        let registered = std::mem::take(&mut self.sources);
        self.sources = default_sources(permissions);
        self.sources.extend(registered);
        self
    }

    pub fn register_resource_model(&mut self, model: ResourceModel) -> PermResult<&mut Self> {
        self.models.register(model)?;
        Ok(self)
    }

    pub fn register_action(&mut self, action: Action) -> PermResult<&mut Self> {
        self.actions.register(action)?;
        Ok(self)
    }

    pub fn register_rule_source(&mut self, source: Arc<dyn RuleSource>) -> &mut Self {
        self.sources.push(source);
        self
    }

    /// Validate cross references and seal the registries.
    pub fn build(mut self) -> PermResult<PermissionEngine> {
        self.config.validate()?;
        for action in self.actions.list() {
            let depth = model_for(&self.models, action)?.depth;
            let mut seen: BTreeSet<&str> = BTreeSet::new();
            seen.insert(action.name.as_str());
            let (mut cur, mut cur_depth) = (action, depth);
            while let Some(req) = &cur.also_requires {
                let next = self.actions.lookup(req).map_err(|_| {
                    PermError::Config(format!("action '{}' requires unknown action '{}'", cur.name, req))
                })?;
                let next_depth = model_for(&self.models, next)?.depth;
                if next_depth > cur_depth {
                    return Err(PermError::Config(format!(
                        "action '{}' requires '{}', whose resources are more specific",
                        cur.name, next.name
                    )));
                }
                if !seen.insert(next.name.as_str()) {
                    return Err(PermError::Config(format!("also_requires cycle through '{}'", next.name)));
                }
                cur = next;
                cur_depth = next_depth;
            }
        }
        self.actions.seal();
        let source_names: Vec<String> = self.sources.iter().map(|s| s.name().to_string()).collect();
        info!(
            target: "permsql::engine",
            "permission engine ready: actions={} models={} sources=[{}]",
            self.actions.list().len(),
            self.models.len(),
            source_names.join(", ")
        );
        Ok(PermissionEngine {
            catalog: self.catalog,
            config: self.config,
            models: self.models,
            actions: self.actions,
            sources: self.sources,
            source_names,
            checks: Mutex::new(VecDeque::new()),
        })
    }
}

fn model_for(models: &ResourceModels, action: &Action) -> PermResult<ModelEntry> {
    match &action.resource_model {
        Some(name) => models.get(name).cloned(),
        None => Ok(models
            .get(INSTANCE)
            .cloned()
            .unwrap_or_else(|_| ModelEntry { model: ResourceModel::instance(), depth: 0 })),
    }
}

fn truncate(res: &Resource, depth: u8) -> Resource {
    match depth {
        0 => Resource::root(),
        1 => res.parent_resource(),
        _ => res.clone(),
    }
}

/// Collected rules for an action and, recursively, for what it also requires.
struct Plan {
    action: Action,
    model: ModelEntry,
    rules: Vec<SourceRules>,
    requires: Option<Box<Plan>>,
}

/// Decide a set of resources, applying the requirement chain.
fn decide_many(
    plan: &Plan,
    actor: Option<&Actor>,
    resources: &BTreeSet<Resource>,
    names: &[String],
    snap: &Snapshot<'_>,
) -> PermResult<HashMap<Resource, Decision>> {
    let target = match resources.iter().next() {
        Some(only) if resources.len() == 1 => Target::Point(only.clone()),
        _ => Target::Set(resources.iter().cloned().collect()),
    };
    let q = compose(&plan.action, &plan.model, actor, names, &plan.rules, &target)?;
    q.check_contract(snap)?;
    let mut out: HashMap<Resource, Decision> = q.decisions(snap)?.into_iter().map(|d| (d.resource.clone(), d)).collect();
    for r in resources {
        out.entry(r.clone()).or_insert_with(|| Decision::deny(r.clone(), NO_MATCHING_RULE));
    }
    if let Some(req) = &plan.requires {
        let needed: BTreeSet<Resource> =
            out.values().filter(|d| d.allow).map(|d| truncate(&d.resource, req.model.depth)).collect();
        if !needed.is_empty() {
            let verdicts = decide_many(req, actor, &needed, names, snap)?;
            for d in out.values_mut().filter(|d| d.allow) {
                let key = truncate(&d.resource, req.model.depth);
                if let Some(rd) = verdicts.get(&key).filter(|rd| !rd.allow) {
                    *d = Decision {
                        resource: d.resource.clone(),
                        allow: false,
                        reason: format!("requires {}: {}", req.action.name, rd.reason),
                        source: rd.source.clone(),
                    };
                }
            }
        }
    }
    Ok(out)
}

fn decide_one(plan: &Plan, actor: Option<&Actor>, res: &Resource, names: &[String], snap: &Snapshot<'_>) -> PermResult<Decision> {
    let set = BTreeSet::from([res.clone()]);
    let mut out = decide_many(plan, actor, &set, names, snap)?;
    Ok(out.remove(res).unwrap_or_else(|| Decision::deny(res.clone(), NO_MATCHING_RULE)))
}

/// Options for [`PermissionEngine::allowed_resources`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageRequest {
    pub parent: Option<String>,
    pub limit: Option<u32>,
    pub cursor: Option<String>,
    pub include_reasons: bool,
    pub include_is_private: bool,
}

impl PageRequest {
    pub fn new() -> Self { Self::default() }

    pub fn parent<S: Into<String>>(mut self, parent: S) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn cursor<S: Into<String>>(mut self, cursor: S) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn with_reasons(mut self) -> Self {
        self.include_reasons = true;
        self
    }

    pub fn with_is_private(mut self) -> Self {
        self.include_is_private = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllowedResource {
    pub resource: Resource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Whether the anonymous actor is denied; only filled when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    pub resources: Vec<AllowedResource>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Visibility {
    pub visible: bool,
    /// Visible to this actor but not to the anonymous actor.
    pub private: bool,
}

/// One entry of the recent point-check log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckRecord {
    pub when: DateTime<Utc>,
    pub actor_id: Option<String>,
    pub action: String,
    pub resource: Resource,
    pub allowed: bool,
    pub reason: String,
}

pub struct PermissionEngine {
    catalog: Arc<Catalog>,
    config: EngineConfig,
    models: ResourceModels,
    actions: ActionRegistry,
    sources: Vec<Arc<dyn RuleSource>>,
    source_names: Vec<String>,
    checks: Mutex<VecDeque<CheckRecord>>,
}

impl PermissionEngine {
    pub fn config(&self) -> &EngineConfig { &self.config }

    pub fn actions(&self) -> &ActionRegistry { &self.actions }

    pub fn catalog(&self) -> &Arc<Catalog> { &self.catalog }

    /// Source names in registration order.
    pub fn source_names(&self) -> &[String] { &self.source_names }

    fn lookup(&self, action: &str) -> PermResult<(Action, ModelEntry)> {
        let action = self.actions.lookup(action)?.clone();
        let model = model_for(&self.models, &action)?;
        Ok((action, model))
    }

    fn point_resource(action: &Action, model: &ModelEntry, resource: Option<&Resource>) -> PermResult<Resource> {
        let res = resource.cloned().unwrap_or_default();
        if res.parent.is_none() && res.child.is_some() {
            return Err(PermError::InvalidResource { action: action.name.clone(), message: "child without parent".into() });
        }
        if !model.accepts(&res) {
            return Err(PermError::InvalidResource {
                action: action.name.clone(),
                message: format!("expected a {} resource, got {}", model.shape(), res),
            });
        }
        Ok(res)
    }

    async fn plan(&self, actor: Option<&Actor>, action: &Action) -> PermResult<Plan> {
        let mut chain = vec![action.clone()];
        while let Some(next) = chain.last().and_then(|a| a.also_requires.clone()) {
            chain.push(self.actions.lookup(&next)?.clone());
        }
        let mut plan: Option<Plan> = None;
        for action in chain.into_iter().rev() {
            let model = model_for(&self.models, &action)?;
            let ctx = RuleContext { actor, action: &action, config: &self.config, model_depth: model.depth };
            let rules = collect(&self.sources, &ctx).await?;
            plan = Some(Plan { action, model, rules, requires: plan.map(Box::new) });
        }
        plan.ok_or_else(|| PermError::Internal("empty requirement chain".into()))
    }

    /// Bound a call by `resolution_timeout_ms`, cancelling its catalog read on expiry.
    async fn bounded<T, F>(&self, guard: &ReadGuard, fut: F) -> PermResult<T>
    where
        F: Future<Output = PermResult<T>>,
    {
        let ms = self.config.resolution_timeout_ms;
        let result = if ms == 0 {
            fut.await
        } else {
            match tokio::time::timeout(Duration::from_millis(ms), fut).await {
                Ok(r) => r,
                Err(_) => {
                    self.catalog.cancel(guard);
                    Err(PermError::ResolutionTimeout { timeout_ms: ms })
                }
            }
        };
        match result {
            Err(PermError::ResolutionTimeout { .. }) => {
                warn!(target: "permsql::engine", "resolution exceeded {}ms; denying", ms);
                Err(PermError::ResolutionTimeout { timeout_ms: ms })
            }
            other => other,
        }
    }

    fn record(&self, actor: Option<&Actor>, decision: &Decision, action: &str) {
        debug!(
            target: "permsql::engine",
            "check actor={:?} action='{}' resource={} allow={} reason='{}'",
            actor.and_then(Actor::id),
            action,
            decision.resource,
            decision.allow,
            decision.reason
        );
        let cap = self.config.check_log_capacity;
        if cap == 0 { return; }
        let mut log = self.checks.lock();
        while log.len() >= cap { log.pop_front(); }
        log.push_back(CheckRecord {
            when: Utc::now(),
            actor_id: actor.and_then(Actor::id),
            action: action.to_string(),
            resource: decision.resource.clone(),
            allowed: decision.allow,
            reason: decision.reason.clone(),
        });
    }

    /// Most recent point checks, oldest first.
    pub fn recent_checks(&self) -> Vec<CheckRecord> { self.checks.lock().iter().cloned().collect() }

    /// Point check returning the full decision. `resource` defaults to the instance root.
    pub async fn allowed_with_reason(&self, actor: Option<&Actor>, action: &str, resource: Option<&Resource>) -> PermResult<Decision> {
        let (action, model) = self.lookup(action)?;
        let res = Self::point_resource(&action, &model, resource)?;
        let guard = self.catalog.read_guard();
        let decision = self
            .bounded(&guard, async {
                let plan = self.plan(actor, &action).await?;
                let names = self.source_names.clone();
                let owned = actor.cloned();
                let res = res.clone();
                self.catalog.snapshot(&guard, move |snap| decide_one(&plan, owned.as_ref(), &res, &names, snap)).await
            })
            .await?;
        self.record(actor, &decision, &action.name);
        Ok(decision)
    }

    pub async fn allowed(&self, actor: Option<&Actor>, action: &str, resource: Option<&Resource>) -> PermResult<bool> {
        Ok(self.allowed_with_reason(actor, action, resource).await?.allow)
    }

    /// `Err(Forbidden)` on a negative decision.
    pub async fn ensure_permission(&self, actor: Option<&Actor>, action: &str, resource: Option<&Resource>) -> PermResult<()> {
        let d = self.allowed_with_reason(actor, action, resource).await?;
        if d.allow {
            Ok(())
        } else {
            Err(PermError::Forbidden { action: action.to_string(), reason: d.reason })
        }
    }

    pub async fn check_visibility(&self, actor: Option<&Actor>, action: &str, resource: Option<&Resource>) -> PermResult<Visibility> {
        let (action, model) = self.lookup(action)?;
        let res = Self::point_resource(&action, &model, resource)?;
        let guard = self.catalog.read_guard();
        let (decision, anon) = self
            .bounded(&guard, async {
                let plan = self.plan(actor, &action).await?;
                let anon_plan = match actor {
                    Some(_) => Some(self.plan(None, &action).await?),
                    None => None,
                };
                let names = self.source_names.clone();
                let owned = actor.cloned();
                let res = res.clone();
                self.catalog
                    .snapshot(&guard, move |snap| {
                        let d = decide_one(&plan, owned.as_ref(), &res, &names, snap)?;
                        let anon = match (&anon_plan, d.allow) {
                            (Some(p), true) => Some(decide_one(p, None, &res, &names, snap)?.allow),
                            _ => None,
                        };
                        Ok((d, anon))
                    })
                    .await
            })
            .await?;
        self.record(actor, &decision, &action.name);
        Ok(Visibility { visible: decision.allow, private: decision.allow && anon == Some(false) })
    }

    fn page_limit(&self, limit: Option<u32>) -> PermResult<usize> {
        let max = self.config.max_page_size;
        match limit {
            None => Ok(self.config.default_page_size as usize),
            Some(l) if l == 0 || l > max => Err(PermError::InvalidLimit { got: l, max }),
            Some(l) => Ok(l as usize),
        }
    }

    /// Allowed resources in `(parent, child)` order, one page at a time.
    pub async fn allowed_resources(&self, actor: Option<&Actor>, action: &str, req: PageRequest) -> PermResult<Page> {
        let (action, model) = self.lookup(action)?;
        let limit = self.page_limit(req.limit)?;
        if req.parent.is_some() && model.depth == 0 {
            return Err(PermError::InvalidResource {
                action: action.name.clone(),
                message: "instance-wide actions have no parent filter".into(),
            });
        }
        let fingerprint = actor_fingerprint(actor);
        let after = match &req.cursor {
            Some(token) => {
                let last = Cursor::resume(token, &action.name, req.parent.as_deref(), fingerprint)?;
                if !model.accepts(&last) {
                    return Err(PermError::InvalidCursor(format!("position {} does not fit this listing", last)));
                }
                Some(last)
            }
            None => None,
        };
        let guard = self.catalog.read_guard();
        let (decisions, privacy, more) = self
            .bounded(&guard, async {
                let plan = self.plan(actor, &action).await?;
                let anon_plan = match (req.include_is_private, actor) {
                    (true, Some(_)) => Some(self.plan(None, &action).await?),
                    _ => None,
                };
                let names = self.source_names.clone();
                let owned = actor.cloned();
                let target = Target::Universe { parent: req.parent.clone(), after };
                self.catalog
                    .snapshot(&guard, move |snap| list_page(&plan, anon_plan.as_ref(), owned.as_ref(), target, limit, &names, snap))
                    .await
            })
            .await?;

        let next_cursor = match (more, decisions.last()) {
            (true, Some(last)) => {
                Some(Cursor::new(&action.name, req.parent.as_deref(), fingerprint, last.resource.clone()).encode()?)
            }
            _ => None,
        };
        debug!(
            target: "permsql::engine",
            "page action='{}' parent={:?} returned={} more={}",
            action.name,
            req.parent,
            decisions.len(),
            more
        );
        let resources = decisions
            .into_iter()
            .map(|d| {
                let private = if req.include_is_private { Some(privacy.get(&d.resource).copied().unwrap_or(false)) } else { None };
                AllowedResource { reason: req.include_reasons.then(|| d.reason.clone()), private, resource: d.resource }
            })
            .collect();
        Ok(Page { resources, next_cursor })
    }

    /// The composed listing query for this actor and action, without running it.
    pub async fn explain(&self, actor: Option<&Actor>, action: &str, parent: Option<&str>) -> PermResult<CombinedQuery> {
        let (action, _) = self.lookup(action)?;
        let guard = self.catalog.read_guard();
        self.bounded(&guard, async {
            let plan = self.plan(actor, &action).await?;
            let target = Target::Universe { parent: parent.map(str::to_string), after: None };
            compose(&plan.action, &plan.model, actor, &self.source_names, &plan.rules, &target)
        })
        .await
    }
}

type PageRows = (Vec<Decision>, HashMap<Resource, bool>, bool);

/// Stream the universe, keep allowed resources that also pass the requirement chain, and
/// stop one past `limit`. Privacy is decided for the kept resources only.
fn list_page(
    plan: &Plan,
    anon_plan: Option<&Plan>,
    actor: Option<&Actor>,
    target: Target,
    limit: usize,
    names: &[String],
    snap: &Snapshot<'_>,
) -> PermResult<PageRows> {
    let q = compose(&plan.action, &plan.model, actor, names, &plan.rules, &target)?;
    q.check_contract(snap)?;
    let mut page: Vec<Decision> = Vec::new();
    let mut more = false;
    let mut required: HashMap<Resource, bool> = HashMap::new();
    q.for_each_decision(snap, |d| {
        if !d.allow {
            return Ok(true);
        }
        if let Some(req) = &plan.requires {
            let key = truncate(&d.resource, req.model.depth);
            let ok = match required.get(&key) {
                Some(ok) => *ok,
                None => {
                    let ok = decide_one(req, actor, &key, names, snap)?.allow;
                    required.insert(key, ok);
                    ok
                }
            };
            if !ok {
                return Ok(true);
            }
        }
        if page.len() >= limit {
            more = true;
            return Ok(false);
        }
        page.push(d);
        Ok(true)
    })?;

    let mut privacy = HashMap::new();
    if let Some(anon) = anon_plan {
        let set: BTreeSet<Resource> = page.iter().map(|d| d.resource.clone()).collect();
        if !set.is_empty() {
            for (res, d) in decide_many(anon, None, &set, names, snap)? {
                privacy.insert(res, !d.allow);
            }
        }
    }
    Ok((page, privacy, more))
}
