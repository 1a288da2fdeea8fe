//! Version-level traffic routing: canary rollouts and rule-based splits.
//!
//! The router decides which *version* of a service a call should target.
//! An active canary takes precedence; otherwise enabled routes are
//! evaluated in priority order and the first matching rule picks a
//! destination by weighted draw. `None` means "use the caller's default
//! version".

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Global regex cache to avoid recompiling condition patterns per call.
static REGEX_CACHE: Lazy<RwLock<HashMap<String, Arc<Regex>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Gets or compiles a regex pattern, caching the result.
fn get_or_compile_regex(pattern: &str) -> Option<Arc<Regex>> {
    {
        let cache = REGEX_CACHE.read();
        if let Some(regex) = cache.get(pattern) {
            return Some(Arc::clone(regex));
        }
    }

    match Regex::new(pattern) {
        Ok(regex) => {
            let regex = Arc::new(regex);
            let mut cache = REGEX_CACHE.write();
            cache.insert(pattern.to_string(), Arc::clone(&regex));
            Some(regex)
        }
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "invalid regex pattern");
            None
        }
    }
}

/// Per-call attributes that routing rules match against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingContext {
    /// Request headers (already lowercased keys are not assumed).
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Query parameters.
    #[serde(default)]
    pub query: HashMap<String, String>,
    /// Calling user id.
    pub user_id: Option<String>,
    /// Calling user role.
    pub role: Option<String>,
    /// Geographic region of the caller.
    pub region: Option<String>,
}

impl RoutingContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Adds a query parameter.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Sets the user id.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Sets the user role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Sets the region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// A single matching condition. All conditions on a rule are ANDed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteCondition {
    /// Header must have exactly this value.
    Header { name: String, value: String },
    /// Header must match this regex pattern.
    HeaderRegex { name: String, pattern: String },
    /// Query parameter must have exactly this value.
    Query { name: String, value: String },
    /// Caller's user id must be one of these.
    UserId { ids: Vec<String> },
    /// Caller's role must equal this.
    Role { role: String },
    /// Caller's region must equal this.
    Region { region: String },
}

impl RouteCondition {
    /// Checks the condition against a routing context.
    pub fn matches(&self, ctx: &RoutingContext) -> bool {
        match self {
            RouteCondition::Header { name, value } => {
                ctx.headers.get(name).is_some_and(|v| v == value)
            }
            RouteCondition::HeaderRegex { name, pattern } => {
                match (ctx.headers.get(name), get_or_compile_regex(pattern)) {
                    (Some(v), Some(regex)) => regex.is_match(v),
                    _ => false,
                }
            }
            RouteCondition::Query { name, value } => {
                ctx.query.get(name).is_some_and(|v| v == value)
            }
            RouteCondition::UserId { ids } => {
                ctx.user_id.as_ref().is_some_and(|id| ids.contains(id))
            }
            RouteCondition::Role { role } => ctx.role.as_ref().is_some_and(|r| r == role),
            RouteCondition::Region { region } => {
                ctx.region.as_ref().is_some_and(|r| r == region)
            }
        }
    }
}

/// Target version with a proportional weight.
///
/// Weights across a rule's destinations conceptually sum to 100, but the
/// draw is proportional so any positive total works.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDestination {
    /// Target service version.
    pub version: String,
    /// Proportional weight.
    pub weight: u32,
}

impl RouteDestination {
    /// Creates a destination.
    pub fn new(version: impl Into<String>, weight: u32) -> Self {
        Self {
            version: version.into(),
            weight,
        }
    }
}

/// Tag describing what a rule keys on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    /// Pure percentage split.
    #[default]
    Weighted,
    /// Header-driven routing.
    Header,
    /// Query-parameter-driven routing.
    Query,
    /// Per-user routing.
    User,
    /// Geography-driven routing.
    Geo,
}

/// A single routing rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Rule name.
    pub name: String,
    /// What this rule keys on.
    #[serde(default)]
    pub rule_type: RuleType,
    /// Higher priority rules are evaluated first.
    #[serde(default)]
    pub priority: i32,
    /// Candidate versions with weights.
    pub destinations: Vec<RouteDestination>,
    /// Conditions that must all match (none means always match).
    #[serde(default)]
    pub conditions: Vec<RouteCondition>,
}

impl RoutingRule {
    /// Creates a rule with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rule_type: RuleType::default(),
            priority: 0,
            destinations: Vec::new(),
            conditions: Vec::new(),
        }
    }

    /// Sets the rule type tag.
    pub fn with_type(mut self, rule_type: RuleType) -> Self {
        self.rule_type = rule_type;
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Adds a destination.
    pub fn with_destination(mut self, destination: RouteDestination) -> Self {
        self.destinations.push(destination);
        self
    }

    /// Adds a condition.
    pub fn with_condition(mut self, condition: RouteCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Checks whether the rule applies to the given context.
    ///
    /// A rule with no conditions always matches. A rule with conditions
    /// cannot match without a context.
    pub fn matches(&self, ctx: Option<&RoutingContext>) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        match ctx {
            Some(ctx) => self.conditions.iter().all(|c| c.matches(ctx)),
            None => false,
        }
    }

    /// Picks a destination version by weighted draw.
    pub fn pick_destination(&self) -> Option<&str> {
        if self.destinations.is_empty() {
            return None;
        }

        let total: u64 = self.destinations.iter().map(|d| u64::from(d.weight)).sum();
        if total == 0 {
            return Some(&self.destinations[0].version);
        }

        let mut draw = rand::thread_rng().gen_range(0..total);
        for dest in &self.destinations {
            let weight = u64::from(dest.weight);
            if draw < weight {
                return Some(&dest.version);
            }
            draw -= weight;
        }

        self.destinations.last().map(|d| d.version.as_str())
    }
}

/// A named, enable-able rule set bound to one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRoute {
    /// Route name, unique within the router.
    pub name: String,
    /// The service this route applies to.
    pub service: String,
    /// Whether the route participates in evaluation.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Ordered rules.
    pub rules: Vec<RoutingRule>,
}

fn default_enabled() -> bool {
    true
}

impl TrafficRoute {
    /// Creates an enabled route with no rules.
    pub fn new(name: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            enabled: true,
            rules: Vec::new(),
        }
    }

    /// Adds a rule.
    pub fn with_rule(mut self, rule: RoutingRule) -> Self {
        self.rules.push(rule);
        self
    }
}

/// Auto-increment parameters for a canary rollout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoIncrement {
    /// Traffic percentage added per tick.
    pub step: f64,
    /// Interval between increments.
    pub interval_ms: u64,
    /// Ceiling for automatic increments.
    pub max_percent: f64,
}

impl AutoIncrement {
    /// Returns the increment interval as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Configuration for creating a canary deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryConfig {
    /// The service being rolled out.
    pub service: String,
    /// Version receiving the remaining traffic.
    pub stable_version: String,
    /// Version under rollout.
    pub canary_version: String,
    /// Starting traffic percentage (clamped to 0-100).
    pub initial_percent: f64,
    /// Optional automatic traffic increase.
    pub auto_increment: Option<AutoIncrement>,
}

/// A live canary deployment.
#[derive(Debug)]
struct CanaryDeployment {
    stable_version: String,
    canary_version: String,
    traffic_percent: f64,
    auto_increment: Option<AutoIncrement>,
    enabled: bool,
    next_increment_at: Option<Instant>,
}

/// Public snapshot of a canary deployment.
#[derive(Debug, Clone, Serialize)]
pub struct CanaryStatus {
    pub service: String,
    pub stable_version: String,
    pub canary_version: String,
    pub traffic_percent: f64,
    pub enabled: bool,
    pub auto_increment: bool,
}

/// Statistics about routing decisions.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficStats {
    pub canary_picks: u64,
    pub stable_picks: u64,
    pub rule_matches: u64,
    pub no_route: u64,
    pub routes: usize,
    pub canaries: usize,
}

/// Traffic router holding routes and canary deployments.
pub struct TrafficRouter {
    routes: RwLock<Vec<TrafficRoute>>,
    canaries: DashMap<String, CanaryDeployment>,
    canary_picks: AtomicU64,
    stable_picks: AtomicU64,
    rule_matches: AtomicU64,
    no_route: AtomicU64,
}

impl TrafficRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            canaries: DashMap::new(),
            canary_picks: AtomicU64::new(0),
            stable_picks: AtomicU64::new(0),
            rule_matches: AtomicU64::new(0),
            no_route: AtomicU64::new(0),
        }
    }

    /// Adds a route, replacing any existing route with the same name.
    pub fn create_route(&self, route: TrafficRoute) {
        let mut routes = self.routes.write();
        routes.retain(|r| r.name != route.name);
        debug!(route = %route.name, service = %route.service, rules = route.rules.len(), "route created");
        routes.push(route);
    }

    /// Removes a route by name.
    pub fn remove_route(&self, name: &str) -> bool {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|r| r.name != name);
        before != routes.len()
    }

    /// Enables or disables a route. Returns `false` if unknown.
    pub fn set_route_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut routes = self.routes.write();
        match routes.iter_mut().find(|r| r.name == name) {
            Some(route) => {
                route.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Returns all routes bound to a service.
    pub fn routes_for(&self, service: &str) -> Vec<TrafficRoute> {
        self.routes
            .read()
            .iter()
            .filter(|r| r.service == service)
            .cloned()
            .collect()
    }

    /// Creates or replaces the canary deployment for a service.
    pub fn create_canary(&self, config: CanaryConfig) {
        let next_increment_at = config
            .auto_increment
            .as_ref()
            .map(|auto| Instant::now() + auto.interval());

        info!(
            service = %config.service,
            stable = %config.stable_version,
            canary = %config.canary_version,
            percent = config.initial_percent,
            "canary created"
        );

        self.canaries.insert(
            config.service,
            CanaryDeployment {
                stable_version: config.stable_version,
                canary_version: config.canary_version,
                traffic_percent: config.initial_percent.clamp(0.0, 100.0),
                auto_increment: config.auto_increment,
                enabled: true,
                next_increment_at,
            },
        );
    }

    /// Returns the canary status for a service.
    pub fn canary_status(&self, service: &str) -> Option<CanaryStatus> {
        self.canaries.get(service).map(|c| CanaryStatus {
            service: service.to_string(),
            stable_version: c.stable_version.clone(),
            canary_version: c.canary_version.clone(),
            traffic_percent: c.traffic_percent,
            enabled: c.enabled,
            auto_increment: c.auto_increment.is_some(),
        })
    }

    /// Promotes a canary: 100% traffic, then disabled.
    ///
    /// The caller is expected to publish the canary version as the new
    /// stable afterwards. Returns `false` if no canary exists.
    pub fn promote_canary(&self, service: &str) -> bool {
        match self.canaries.get_mut(service) {
            Some(mut canary) => {
                canary.traffic_percent = 100.0;
                canary.enabled = false;
                info!(service = %service, version = %canary.canary_version, "canary promoted");
                true
            }
            None => false,
        }
    }

    /// Rolls a canary back: 0% traffic, then disabled.
    pub fn rollback_canary(&self, service: &str) -> bool {
        match self.canaries.get_mut(service) {
            Some(mut canary) => {
                canary.traffic_percent = 0.0;
                canary.enabled = false;
                warn!(service = %service, version = %canary.canary_version, "canary rolled back");
                true
            }
            None => false,
        }
    }

    /// Removes the canary deployment for a service.
    pub fn remove_canary(&self, service: &str) -> bool {
        self.canaries.remove(service).is_some()
    }

    /// Advances auto-incrementing canaries whose deadline has passed.
    ///
    /// Called periodically by the mesh background task. Returns the
    /// number of canaries advanced.
    pub fn advance_canaries(&self, now: Instant) -> usize {
        let mut advanced = 0;

        for mut entry in self.canaries.iter_mut() {
            let service = entry.key().clone();
            let canary = entry.value_mut();
            if !canary.enabled {
                continue;
            }

            let Some(auto) = canary.auto_increment.clone() else {
                continue;
            };
            let Some(deadline) = canary.next_increment_at else {
                continue;
            };

            if now >= deadline && canary.traffic_percent < auto.max_percent {
                canary.traffic_percent =
                    (canary.traffic_percent + auto.step).min(auto.max_percent);
                canary.next_increment_at = Some(now + auto.interval());
                advanced += 1;

                info!(
                    service = %service,
                    percent = canary.traffic_percent,
                    "canary traffic advanced"
                );
            }
        }

        advanced
    }

    /// Decides which version a call should target.
    ///
    /// Precedence: active canary first, then enabled routes in
    /// descending rule priority. `None` means the caller's default
    /// version applies.
    pub fn route(&self, service: &str, ctx: Option<&RoutingContext>) -> Option<String> {
        if let Some(canary) = self.canaries.get(service) {
            if canary.enabled && canary.traffic_percent > 0.0 {
                let draw = rand::thread_rng().gen_range(0.0..100.0);
                return if draw < canary.traffic_percent {
                    self.canary_picks.fetch_add(1, Ordering::Relaxed);
                    debug!(service = %service, version = %canary.canary_version, "routed to canary");
                    Some(canary.canary_version.clone())
                } else {
                    self.stable_picks.fetch_add(1, Ordering::Relaxed);
                    Some(canary.stable_version.clone())
                };
            }
        }

        let mut rules: Vec<RoutingRule> = {
            let routes = self.routes.read();
            routes
                .iter()
                .filter(|r| r.enabled && r.service == service)
                .flat_map(|r| r.rules.iter().cloned())
                .collect()
        };
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));

        for rule in &rules {
            if rule.matches(ctx) {
                if let Some(version) = rule.pick_destination() {
                    self.rule_matches.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        service = %service,
                        rule = %rule.name,
                        version = %version,
                        "routed by rule"
                    );
                    return Some(version.to_string());
                }
            }
        }

        self.no_route.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Returns routing statistics.
    pub fn stats(&self) -> TrafficStats {
        TrafficStats {
            canary_picks: self.canary_picks.load(Ordering::Relaxed),
            stable_picks: self.stable_picks.load(Ordering::Relaxed),
            rule_matches: self.rule_matches.load(Ordering::Relaxed),
            no_route: self.no_route.load(Ordering::Relaxed),
            routes: self.routes.read().len(),
            canaries: self.canaries.len(),
        }
    }

    /// Resets decision counters. Routes and canaries are untouched.
    pub fn reset_stats(&self) {
        self.canary_picks.store(0, Ordering::Relaxed);
        self.stable_picks.store(0, Ordering::Relaxed);
        self.rule_matches.store(0, Ordering::Relaxed);
        self.no_route.store(0, Ordering::Relaxed);
    }
}

impl Default for TrafficRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Route and canary definitions loadable from a config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteTable {
    /// Route definitions.
    #[serde(default)]
    pub routes: Vec<TrafficRoute>,
    /// Canary definitions.
    #[serde(default)]
    pub canaries: Vec<CanaryConfig>,
}

impl RouteTable {
    /// Loads a route table from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Loads a route table from a JSON string.
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Applies all definitions to a router.
    pub fn apply(self, router: &TrafficRouter) {
        for route in self.routes {
            router.create_route(route);
        }
        for canary in self.canaries {
            router.create_canary(canary);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_rule(name: &str, stable: u32, canary: u32) -> RoutingRule {
        RoutingRule::new(name)
            .with_destination(RouteDestination::new("1.0.0", stable))
            .with_destination(RouteDestination::new("2.0.0", canary))
    }

    #[test]
    fn test_condition_header_exact() {
        let condition = RouteCondition::Header {
            name: "x-beta".to_string(),
            value: "true".to_string(),
        };

        let ctx = RoutingContext::new().with_header("x-beta", "true");
        assert!(condition.matches(&ctx));

        let ctx = RoutingContext::new().with_header("x-beta", "false");
        assert!(!condition.matches(&ctx));
    }

    #[test]
    fn test_condition_header_regex() {
        let condition = RouteCondition::HeaderRegex {
            name: "user-agent".to_string(),
            pattern: r"(?i)mobile".to_string(),
        };

        let ctx = RoutingContext::new().with_header("user-agent", "Mobile Safari");
        assert!(condition.matches(&ctx));

        let ctx = RoutingContext::new().with_header("user-agent", "curl/8.0");
        assert!(!condition.matches(&ctx));
    }

    #[test]
    fn test_condition_user_role_region() {
        let ctx = RoutingContext::new()
            .with_user_id("u-42")
            .with_role("beta-tester")
            .with_region("eu-west");

        assert!(RouteCondition::UserId {
            ids: vec!["u-41".to_string(), "u-42".to_string()]
        }
        .matches(&ctx));
        assert!(RouteCondition::Role {
            role: "beta-tester".to_string()
        }
        .matches(&ctx));
        assert!(!RouteCondition::Region {
            region: "us-east".to_string()
        }
        .matches(&ctx));
    }

    #[test]
    fn test_rule_without_conditions_always_matches() {
        let rule = split_rule("split", 50, 50);
        assert!(rule.matches(None));
        assert!(rule.matches(Some(&RoutingContext::new())));
    }

    #[test]
    fn test_rule_with_conditions_needs_context() {
        let rule = split_rule("beta", 0, 100).with_condition(RouteCondition::Role {
            role: "beta-tester".to_string(),
        });

        assert!(!rule.matches(None));
        assert!(!rule.matches(Some(&RoutingContext::new())));
        assert!(rule.matches(Some(&RoutingContext::new().with_role("beta-tester"))));
    }

    #[test]
    fn test_rule_priority_order() {
        let router = TrafficRouter::new();
        router.create_route(
            TrafficRoute::new("orders-routes", "orders")
                .with_rule(
                    RoutingRule::new("fallback")
                        .with_priority(0)
                        .with_destination(RouteDestination::new("1.0.0", 100)),
                )
                .with_rule(
                    RoutingRule::new("beta")
                        .with_priority(10)
                        .with_destination(RouteDestination::new("2.0.0", 100))
                        .with_condition(RouteCondition::Role {
                            role: "beta-tester".to_string(),
                        }),
                ),
        );

        let beta_ctx = RoutingContext::new().with_role("beta-tester");
        assert_eq!(router.route("orders", Some(&beta_ctx)), Some("2.0.0".to_string()));

        let plain_ctx = RoutingContext::new();
        assert_eq!(router.route("orders", Some(&plain_ctx)), Some("1.0.0".to_string()));
    }

    #[test]
    fn test_weighted_destinations_distribution() {
        let rule = split_rule("split", 70, 30);

        let mut v2 = 0u32;
        let trials = 10_000;
        for _ in 0..trials {
            if rule.pick_destination() == Some("2.0.0") {
                v2 += 1;
            }
        }

        assert!(v2 > 2_500, "v2 picks: {}", v2);
        assert!(v2 < 3_500, "v2 picks: {}", v2);
    }

    #[test]
    fn test_disabled_route_ignored() {
        let router = TrafficRouter::new();
        router.create_route(TrafficRoute::new("r", "orders").with_rule(split_rule("s", 0, 100)));

        assert!(router.set_route_enabled("r", false));
        assert_eq!(router.route("orders", None), None);
        assert_eq!(router.stats().no_route, 1);
    }

    #[test]
    fn test_canary_distribution() {
        let router = TrafficRouter::new();
        router.create_canary(CanaryConfig {
            service: "payments".to_string(),
            stable_version: "1.0.0".to_string(),
            canary_version: "1.1.0".to_string(),
            initial_percent: 30.0,
            auto_increment: None,
        });

        let mut canary_hits = 0u32;
        let trials = 10_000;
        for _ in 0..trials {
            if router.route("payments", None) == Some("1.1.0".to_string()) {
                canary_hits += 1;
            }
        }

        assert!(canary_hits > 2_700, "canary hits: {}", canary_hits);
        assert!(canary_hits < 3_300, "canary hits: {}", canary_hits);
    }

    #[test]
    fn test_canary_takes_precedence_over_rules() {
        let router = TrafficRouter::new();
        router.create_route(
            TrafficRoute::new("r", "payments").with_rule(
                RoutingRule::new("all-v3").with_destination(RouteDestination::new("3.0.0", 100)),
            ),
        );
        router.create_canary(CanaryConfig {
            service: "payments".to_string(),
            stable_version: "1.0.0".to_string(),
            canary_version: "2.0.0".to_string(),
            initial_percent: 100.0,
            auto_increment: None,
        });

        assert_eq!(router.route("payments", None), Some("2.0.0".to_string()));
    }

    #[test]
    fn test_promote_and_rollback() {
        let router = TrafficRouter::new();
        router.create_canary(CanaryConfig {
            service: "payments".to_string(),
            stable_version: "1.0.0".to_string(),
            canary_version: "2.0.0".to_string(),
            initial_percent: 10.0,
            auto_increment: None,
        });

        assert!(router.promote_canary("payments"));
        let status = router.canary_status("payments").unwrap();
        assert_eq!(status.traffic_percent, 100.0);
        assert!(!status.enabled);
        // Disabled canary no longer intervenes in routing.
        assert_eq!(router.route("payments", None), None);

        assert!(router.rollback_canary("payments"));
        let status = router.canary_status("payments").unwrap();
        assert_eq!(status.traffic_percent, 0.0);

        assert!(!router.promote_canary("unknown"));
    }

    #[test]
    fn test_advance_canaries_caps_at_max() {
        let router = TrafficRouter::new();
        router.create_canary(CanaryConfig {
            service: "payments".to_string(),
            stable_version: "1.0.0".to_string(),
            canary_version: "2.0.0".to_string(),
            initial_percent: 40.0,
            auto_increment: Some(AutoIncrement {
                step: 25.0,
                interval_ms: 60_000,
                max_percent: 80.0,
            }),
        });

        // Before the deadline nothing moves.
        assert_eq!(router.advance_canaries(Instant::now()), 0);

        let tick = Instant::now() + Duration::from_secs(61);
        assert_eq!(router.advance_canaries(tick), 1);
        assert_eq!(
            router.canary_status("payments").unwrap().traffic_percent,
            65.0
        );

        let tick = tick + Duration::from_secs(61);
        assert_eq!(router.advance_canaries(tick), 1);
        // Capped at max_percent rather than 90.
        assert_eq!(
            router.canary_status("payments").unwrap().traffic_percent,
            80.0
        );

        // At the cap further ticks are no-ops.
        let tick = tick + Duration::from_secs(61);
        assert_eq!(router.advance_canaries(tick), 0);
    }

    #[test]
    fn test_route_table_from_toml() {
        let table = RouteTable::from_toml(
            r#"
            [[routes]]
            name = "orders-beta"
            service = "orders"

            [[routes.rules]]
            name = "beta-users"
            priority = 5
            destinations = [{ version = "2.0.0", weight = 100 }]
            conditions = [{ type = "role", role = "beta-tester" }]

            [[canaries]]
            service = "payments"
            stable_version = "1.0.0"
            canary_version = "1.1.0"
            initial_percent = 15.0
            "#,
        )
        .unwrap();

        let router = TrafficRouter::new();
        table.apply(&router);

        let ctx = RoutingContext::new().with_role("beta-tester");
        assert_eq!(router.route("orders", Some(&ctx)), Some("2.0.0".to_string()));
        assert_eq!(
            router.canary_status("payments").unwrap().traffic_percent,
            15.0
        );
    }
}
