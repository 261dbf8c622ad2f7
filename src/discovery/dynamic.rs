use crate::config::{self, directive::Directive};
use crate::core::{
    error::{DiscoveryError, DiscoveryResult},
    store::Snapshot,
};

use super::{new_provider, DiscoveryProvider, Provider};

/// The object the proxy holds.
///
/// It owns at most one provider, selected once while the configuration is
/// parsed, and forwards every lifecycle and fetch call to it.
#[derive(Default)]
pub struct DynamicDiscovery {
    provider: Option<Provider>,
}

impl DynamicDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the dispatch layer from the `discovery` section of the config.
    pub fn from_config(discovery: &config::Discovery) -> DiscoveryResult<Self> {
        let directives = discovery.directives()?;
        let mut this = Self::new();
        this.select(&discovery.provider, &directives)?;
        Ok(this)
    }

    /// Selects the provider by name and hands it its directive block.
    pub fn select(&mut self, name: &str, directives: &[Directive]) -> DiscoveryResult<()> {
        if self.provider.is_some() {
            return Err(DiscoveryError::InvalidState {
                provider: "dynamic",
                operation: "select a second provider",
                state: "selected",
            });
        }

        let mut provider = new_provider(name)?;
        provider.as_discovery_mut().configure(directives)?;
        log::info!("Selected {name} service discovery provider");
        self.provider = Some(provider);
        Ok(())
    }

    pub fn provider(&self) -> DiscoveryResult<&dyn DiscoveryProvider> {
        self.provider
            .as_ref()
            .map(Provider::as_discovery)
            .ok_or(DiscoveryError::NoProvider)
    }

    pub async fn provision(&self) -> DiscoveryResult<()> {
        self.provider()?.provision().await
    }

    pub fn validate(&self) -> DiscoveryResult<()> {
        self.provider()?.validate()
    }

    pub async fn cleanup(&self) -> DiscoveryResult<()> {
        self.provider()?.cleanup().await
    }

    /// Current upstreams; never an empty list.
    pub fn upstreams(&self) -> DiscoveryResult<Snapshot> {
        self.provider()?.upstreams()
    }
}
