use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ProviderError;
use crate::provider::{LeadProvider, ProviderCode, ProviderInfo};

/// Immutable provider lookup, assembled once at process start.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderCode, Arc<dyn LeadProvider>>,
}

impl ProviderRegistry {
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    pub fn get(&self, code: ProviderCode) -> Result<Arc<dyn LeadProvider>, ProviderError> {
        self.providers
            .get(&code)
            .cloned()
            .ok_or_else(|| ProviderError::setup(format!("provider `{code}` is not registered")))
    }

    /// Identity of every registered provider, in `ProviderCode::ALL` order.
    pub fn list(&self) -> Vec<ProviderInfo> {
        ProviderCode::ALL
            .into_iter()
            .filter_map(|c| self.providers.get(&c).map(|p| p.info()))
            .collect()
    }
}

impl core::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.list())
            .finish()
    }
}

#[derive(Default)]
pub struct ProviderRegistryBuilder {
    providers: HashMap<ProviderCode, Arc<dyn LeadProvider>>,
}

impl ProviderRegistryBuilder {
    /// Register a provider under its own code. A later registration for the
    /// same code replaces the earlier one.
    pub fn register(mut self, provider: Arc<dyn LeadProvider>) -> Self {
        self.providers.insert(provider.code(), provider);
        self
    }

    pub fn build(self) -> ProviderRegistry {
        ProviderRegistry {
            providers: self.providers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propertyradar::{PropertyRadarConfig, PropertyRadarProvider};

    #[test]
    fn unregistered_provider_is_a_setup_error() {
        let registry = ProviderRegistry::builder().build();
        let err = match registry.get(ProviderCode::PropertyRadar) {
            Err(e) => e,
            Ok(_) => panic!("expected setup error"),
        };
        assert!(matches!(err, ProviderError::Setup(_)));
    }

    #[test]
    fn lists_registered_providers_with_configuration_state() {
        let provider = PropertyRadarProvider::new(PropertyRadarConfig::default()).unwrap();
        let registry = ProviderRegistry::builder()
            .register(Arc::new(provider))
            .build();

        let infos = registry.list();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].code, ProviderCode::PropertyRadar);
        assert_eq!(infos[0].name, "PropertyRadar");
        assert!(!infos[0].is_configured);
        assert!(registry.get(ProviderCode::PropertyRadar).is_ok());
    }
}
