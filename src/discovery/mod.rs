//! Pluggable service discovery.
//!
//! Every backend implements [`DiscoveryProvider`]: it is configured from a
//! directive block, validated, provisioned (which launches its background
//! refresh), queried for the current upstream snapshot on the request path,
//! and cleaned up on shutdown. The set of backends is closed and lives in
//! [`Provider`]; [`new_provider`] is the only place a new backend is
//! registered.

pub mod consul;
pub mod dynamic;
pub mod mdns;
pub mod nacos;

use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::directive::Directive;
use crate::core::{
    error::{DiscoveryError, DiscoveryResult},
    store::{Snapshot, UpstreamStore},
};

use self::{consul::ConsulProvider, mdns::MdnsProvider, nacos::NacosProvider};

/// Lifecycle of a single provider instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Unconfigured,
    Provisioned,
    Running,
    Stopped,
}

impl LifecycleState {
    fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Unconfigured => "unconfigured",
            LifecycleState::Provisioned => "provisioned",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guards the lifecycle transitions of one provider.
///
/// Validate and provision are accepted once; a second call on the same
/// instance is rejected. Cleanup may be called any number of times.
pub struct Lifecycle {
    provider: &'static str,
    state: Mutex<LifecycleState>,
}

impl Lifecycle {
    pub fn new(provider: &'static str) -> Self {
        Self {
            provider,
            state: Mutex::new(LifecycleState::Unconfigured),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    fn invalid(&self, operation: &'static str, state: LifecycleState) -> DiscoveryError {
        DiscoveryError::InvalidState {
            provider: self.provider,
            operation,
            state: state.as_str(),
        }
    }

    /// Unconfigured -> Provisioned, if `check` passes.
    pub fn validate<F>(&self, check: F) -> DiscoveryResult<()>
    where
        F: FnOnce() -> DiscoveryResult<()>,
    {
        let mut state = self.state.lock();
        if *state != LifecycleState::Unconfigured {
            return Err(self.invalid("validate", *state));
        }
        check()?;
        *state = LifecycleState::Provisioned;
        Ok(())
    }

    /// Provisioned -> Running. The caller must call [`Lifecycle::abort_start`]
    /// if launching the background task fails.
    pub fn begin_start(&self) -> DiscoveryResult<()> {
        let mut state = self.state.lock();
        if *state != LifecycleState::Provisioned {
            return Err(self.invalid("provision", *state));
        }
        *state = LifecycleState::Running;
        Ok(())
    }

    pub fn abort_start(&self) {
        *self.state.lock() = LifecycleState::Stopped;
    }

    /// Moves to Stopped and returns the previous state.
    pub fn stop(&self) -> LifecycleState {
        std::mem::replace(&mut *self.state.lock(), LifecycleState::Stopped)
    }
}

/// The uniform contract every discovery backend implements.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// Backend name as used in configuration.
    fn name(&self) -> &'static str;

    fn service_name(&self) -> &str;

    /// Consumes the provider's directive block, one directive at a time.
    fn configure(&mut self, directives: &[Directive]) -> DiscoveryResult<()>;

    /// Checks that every required field is present.
    fn check_config(&self) -> DiscoveryResult<()>;

    fn lifecycle(&self) -> &Lifecycle;

    fn store(&self) -> &UpstreamStore;

    /// Launches the background refresh.
    async fn start(&self) -> DiscoveryResult<()>;

    /// Signals the background refresh to exit and releases backend resources.
    async fn stop(&self) -> DiscoveryResult<()>;

    fn validate(&self) -> DiscoveryResult<()> {
        self.lifecycle().validate(|| self.check_config())
    }

    async fn provision(&self) -> DiscoveryResult<()> {
        if self.lifecycle().state() == LifecycleState::Unconfigured {
            self.validate()?;
        }
        self.lifecycle().begin_start()?;

        log::info!(
            "Provisioning {} service discovery provider for service '{}'",
            self.name(),
            self.service_name()
        );
        if let Err(e) = self.start().await {
            self.lifecycle().abort_start();
            return Err(e);
        }

        // a cleanup that ran while starting found nothing to stop
        let state = self.lifecycle().state();
        if state != LifecycleState::Running {
            log::warn!(
                "{} provider for service '{}' was cleaned up while starting",
                self.name(),
                self.service_name()
            );
            if let Err(e) = self.stop().await {
                log::error!("{e}");
            }
            return Err(self.lifecycle().invalid("provision", state));
        }
        Ok(())
    }

    /// Returns the current snapshot, or an error naming the service when it
    /// is empty.
    fn upstreams(&self) -> DiscoveryResult<Snapshot> {
        let snapshot = self.store().snapshot();
        if snapshot.is_empty() {
            return Err(DiscoveryError::NoUpstreams(self.service_name().to_string()));
        }
        Ok(snapshot)
    }

    async fn cleanup(&self) -> DiscoveryResult<()> {
        match self.lifecycle().stop() {
            LifecycleState::Running => {
                log::info!(
                    "Cleaning up {} provider for service '{}'",
                    self.name(),
                    self.service_name()
                );
                self.stop().await
            }
            _ => Ok(()),
        }
    }
}

/// The closed set of discovery backends.
pub enum Provider {
    Nacos(NacosProvider),
    Consul(ConsulProvider),
    Mdns(MdnsProvider),
}

impl Provider {
    fn nacos() -> Self {
        Provider::Nacos(NacosProvider::new())
    }

    fn consul() -> Self {
        Provider::Consul(ConsulProvider::new())
    }

    fn mdns() -> Self {
        Provider::Mdns(MdnsProvider::new())
    }

    pub fn as_discovery(&self) -> &dyn DiscoveryProvider {
        match self {
            Provider::Nacos(p) => p,
            Provider::Consul(p) => p,
            Provider::Mdns(p) => p,
        }
    }

    pub fn as_discovery_mut(&mut self) -> &mut dyn DiscoveryProvider {
        match self {
            Provider::Nacos(p) => p,
            Provider::Consul(p) => p,
            Provider::Mdns(p) => p,
        }
    }
}

type Constructor = fn() -> Provider;

/// Registered backends, in the order they are reported to users.
const PROVIDERS: [(&str, Constructor); 3] = [
    ("nacos", Provider::nacos),
    ("consul", Provider::consul),
    ("mdns", Provider::mdns),
];

pub fn supported_providers() -> Vec<&'static str> {
    PROVIDERS.iter().map(|(name, _)| *name).collect()
}

/// Creates a fresh, unconfigured provider by name.
pub fn new_provider(name: &str) -> DiscoveryResult<Provider> {
    PROVIDERS
        .iter()
        .find(|(registered, _)| *registered == name)
        .map(|(_, constructor)| constructor())
        .ok_or_else(|| DiscoveryError::UnknownProvider {
            name: name.to_string(),
            supported: supported_providers().join(", "),
        })
}
