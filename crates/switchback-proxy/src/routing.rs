//! Provider registry and per-scenario routing.
//!
//! Providers are shared by name: every chain that mentions `backup` holds the
//! same `Arc<Provider>`, so a failure seen through one route is visible to all.

use crate::body::RequestBody;
use crate::error::ProxyError;
use crate::provider::Provider;
use crate::scenario::{detect_scenario, Scenario, DEFAULT_LONG_CONTEXT_THRESHOLD};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use switchback_config::{ProfileConfig, ProviderConfig, SwitchbackConfig};
use tracing::debug;

/// Builds providers from configuration on first use and caches them by name.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    configs: HashMap<String, ProviderConfig>,
    instances: Mutex<HashMap<String, Arc<Provider>>>,
}

impl ProviderRegistry {
    pub fn new(configs: impl IntoIterator<Item = ProviderConfig>) -> Self {
        Self {
            configs: configs
                .into_iter()
                .map(|config| (config.name.clone(), config))
                .collect(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &SwitchbackConfig) -> Self {
        Self::new(config.providers.iter().cloned())
    }

    pub fn get(&self, name: &str) -> Result<Arc<Provider>, ProxyError> {
        let mut instances = self.instances.lock();
        if let Some(provider) = instances.get(name) {
            return Ok(Arc::clone(provider));
        }

        let config = self
            .configs
            .get(name)
            .ok_or_else(|| ProxyError::UnknownProvider(name.to_string()))?;
        let provider = Arc::new(Provider::from_config(config)?);
        debug!(provider = name, "constructed provider");
        instances.insert(name.to_string(), Arc::clone(&provider));
        Ok(provider)
    }

    pub fn get_all<'a>(
        &self,
        names: impl IntoIterator<Item = &'a String>,
    ) -> Result<Vec<Arc<Provider>>, ProxyError> {
        names.into_iter().map(|name| self.get(name)).collect()
    }
}

/// Override chain for one scenario.
#[derive(Debug, Clone, Default)]
pub struct ScenarioRoute {
    pub providers: Vec<Arc<Provider>>,
    /// Model to send, keyed by provider name
    pub model_overrides: HashMap<String, String>,
}

/// The chain to walk for one request.
#[derive(Debug, Clone)]
pub struct ResolvedChain<'a> {
    pub scenario: Scenario,
    pub providers: Vec<Arc<Provider>>,
    model_overrides: Option<&'a HashMap<String, String>>,
}

impl ResolvedChain<'_> {
    pub fn model_override(&self, provider: &str) -> Option<&str> {
        self.model_overrides
            .and_then(|overrides| overrides.get(provider))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RoutingTable {
    default_providers: Vec<Arc<Provider>>,
    scenario_routes: HashMap<Scenario, ScenarioRoute>,
    long_context_threshold: usize,
}

impl RoutingTable {
    pub fn new(default_providers: Vec<Arc<Provider>>) -> Self {
        Self {
            default_providers,
            scenario_routes: HashMap::new(),
            long_context_threshold: DEFAULT_LONG_CONTEXT_THRESHOLD,
        }
    }

    pub fn with_route(mut self, scenario: Scenario, route: ScenarioRoute) -> Self {
        self.scenario_routes.insert(scenario, route);
        self
    }

    pub fn with_long_context_threshold(mut self, threshold: usize) -> Self {
        self.long_context_threshold = threshold;
        self
    }

    /// Build the table for a profile. Only providers the profile names are
    /// constructed; the rest of the registry stays untouched.
    pub fn from_profile(
        profile: &ProfileConfig,
        registry: &ProviderRegistry,
    ) -> Result<Self, ProxyError> {
        let mut table = Self::new(registry.get_all(&profile.providers)?)
            .with_long_context_threshold(profile.long_context_threshold());

        for (name, route) in profile.routing.routes() {
            let scenario: Scenario = name.parse().map_err(ProxyError::Configuration)?;
            table = table.with_route(
                scenario,
                ScenarioRoute {
                    providers: registry.get_all(&route.providers)?,
                    model_overrides: route.models.clone(),
                },
            );
        }

        Ok(table)
    }

    pub fn default_providers(&self) -> &[Arc<Provider>] {
        &self.default_providers
    }

    pub fn long_context_threshold(&self) -> usize {
        self.long_context_threshold
    }

    pub fn detect(&self, body: &RequestBody) -> Scenario {
        detect_scenario(body, self.long_context_threshold)
    }

    /// Scenario providers first, then the default chain. Overrides follow the
    /// provider name, so they apply to every occurrence in the result.
    pub fn resolve(&self, scenario: Scenario) -> ResolvedChain<'_> {
        let route = match scenario {
            Scenario::Default => None,
            other => self.scenario_routes.get(&other),
        };

        match route {
            Some(route) => ResolvedChain {
                scenario,
                providers: route
                    .providers
                    .iter()
                    .chain(self.default_providers.iter())
                    .cloned()
                    .collect(),
                model_overrides: Some(&route.model_overrides),
            },
            None => ResolvedChain {
                scenario,
                providers: self.default_providers.clone(),
                model_overrides: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::WireFormat;
    use switchback_config::{RoutingConfig, ScenarioRouteConfig};

    fn provider(name: &str) -> Arc<Provider> {
        Arc::new(Provider::new(
            name,
            WireFormat::Anthropic,
            "https://example.com",
            "",
        ))
    }

    fn names(chain: &ResolvedChain<'_>) -> Vec<String> {
        chain
            .providers
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    fn provider_config(name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            base_url: format!("https://{}.example.com", name),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_scenario_uses_default_chain() {
        let table = RoutingTable::new(vec![provider("a"), provider("b")]);
        let chain = table.resolve(Scenario::Think);
        assert_eq!(names(&chain), vec!["a", "b"]);
        assert!(chain.model_override("a").is_none());
    }

    #[test]
    fn test_scenario_route_prepends_to_default_chain() {
        let table = RoutingTable::new(vec![provider("dp")]).with_route(
            Scenario::Think,
            ScenarioRoute {
                providers: vec![provider("sp")],
                model_overrides: HashMap::from([("sp".to_string(), "r1".to_string())]),
            },
        );

        let chain = table.resolve(Scenario::Think);
        assert_eq!(names(&chain), vec!["sp", "dp"]);
        assert_eq!(chain.model_override("sp"), Some("r1"));
        assert_eq!(chain.model_override("dp"), None);

        let default_chain = table.resolve(Scenario::Default);
        assert_eq!(names(&default_chain), vec!["dp"]);
    }

    #[test]
    fn test_override_applies_to_every_occurrence() {
        let shared = provider("shared");
        let table = RoutingTable::new(vec![Arc::clone(&shared)]).with_route(
            Scenario::Image,
            ScenarioRoute {
                providers: vec![Arc::clone(&shared)],
                model_overrides: HashMap::from([("shared".to_string(), "vision".to_string())]),
            },
        );

        let chain = table.resolve(Scenario::Image);
        assert_eq!(chain.len(), 2);
        for p in &chain.providers {
            assert_eq!(chain.model_override(p.name()), Some("vision"));
        }
    }

    #[test]
    fn test_registry_shares_instances_by_name() {
        let registry = ProviderRegistry::new(vec![provider_config("a"), provider_config("b")]);
        let first = registry.get("a").unwrap();
        let second = registry.get("a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(matches!(
            registry.get("zzz"),
            Err(ProxyError::UnknownProvider(name)) if name == "zzz"
        ));
    }

    #[test]
    fn test_from_profile_shares_health_across_routes() {
        let registry = ProviderRegistry::new(vec![
            provider_config("dp"),
            provider_config("sp"),
        ]);
        let profile = ProfileConfig {
            providers: vec!["dp".to_string()],
            long_context_threshold: Some(500),
            routing: RoutingConfig {
                think: Some(ScenarioRouteConfig {
                    providers: vec!["sp".to_string()],
                    models: HashMap::new(),
                }),
                long_context: Some(ScenarioRouteConfig {
                    providers: vec!["sp".to_string(), "dp".to_string()],
                    models: HashMap::new(),
                }),
                ..Default::default()
            },
        };

        let table = RoutingTable::from_profile(&profile, &registry).unwrap();
        assert_eq!(table.long_context_threshold(), 500);

        let think = table.resolve(Scenario::Think);
        let long = table.resolve(Scenario::LongContext);
        assert_eq!(names(&long), vec!["sp", "dp", "dp"]);

        think.providers[0].mark_failed();
        assert!(!long.providers[0].health().healthy);
        assert!(!registry.get("sp").unwrap().health().healthy);
    }

    #[test]
    fn test_from_profile_unknown_provider() {
        let registry = ProviderRegistry::new(vec![provider_config("a")]);
        let profile = ProfileConfig {
            providers: vec!["a".to_string(), "missing".to_string()],
            ..Default::default()
        };
        assert!(RoutingTable::from_profile(&profile, &registry).is_err());
    }

    #[test]
    fn test_from_profile_skips_unreferenced_providers() {
        let broken = ProviderConfig {
            format: "gemini".to_string(),
            ..provider_config("broken")
        };
        let registry = ProviderRegistry::new(vec![provider_config("a"), broken]);
        let profile = ProfileConfig {
            providers: vec!["a".to_string()],
            ..Default::default()
        };

        let table = RoutingTable::from_profile(&profile, &registry).unwrap();
        assert_eq!(names(&table.resolve(Scenario::Default)), vec!["a"]);
        assert!(matches!(
            registry.get("broken"),
            Err(ProxyError::UnknownWireFormat(_))
        ));
    }
}
