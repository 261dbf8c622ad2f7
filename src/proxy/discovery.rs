use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use hickory_resolver::TokioAsyncResolver;
use once_cell::sync::OnceCell;
use pingora::upstreams::peer::HttpPeer;
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};
use pingora_error::{ErrorType::InternalError, OrErr, Result};
use pingora_load_balancing::{discovery::ServiceDiscovery, Backend};

use crate::config::{Upstream, UpstreamScheme};
use crate::core::{
    endpoint::Endpoint,
    error::{DiscoveryError, DiscoveryResult},
};
use crate::discovery::dynamic::DynamicDiscovery;

static GLOBAL_RESOLVER: OnceCell<Arc<TokioAsyncResolver>> = OnceCell::new();

fn global_resolver() -> Result<Arc<TokioAsyncResolver>> {
    GLOBAL_RESOLVER
        .get_or_try_init(|| TokioAsyncResolver::tokio_from_system_conf().map(Arc::new))
        .cloned()
        .or_err(InternalError, "Unable to build DNS resolver from system config")
}

/// Socket addresses for an endpoint. Host names are looked up with the
/// process-wide resolver, built on first use.
async fn resolve(endpoint: &Endpoint) -> Result<Vec<SocketAddr>> {
    if let Some(ip) = endpoint.ip() {
        return Ok(vec![SocketAddr::new(ip, endpoint.port())]);
    }

    let host = endpoint.host();
    log::debug!("Resolving DNS for upstream host: {host}");
    let addrs = global_resolver()?
        .lookup_ip(host)
        .await
        .or_err_with(InternalError, || {
            format!("Dns discovery failed for domain {host}")
        })?
        .iter()
        .map(|ip| SocketAddr::new(ip, endpoint.port()))
        .collect();
    Ok(addrs)
}

/// Feeds the current upstream snapshot into a Pingora `LoadBalancer`.
pub struct UpstreamDiscovery {
    discovery: Arc<DynamicDiscovery>,
    tls: bool,
    sni: String,
}

impl UpstreamDiscovery {
    pub fn new(discovery: Arc<DynamicDiscovery>, upstream: &Upstream) -> Self {
        Self {
            discovery,
            tls: upstream.scheme == UpstreamScheme::HTTPS,
            sni: upstream.sni.clone(),
        }
    }

    async fn backends(&self, endpoint: &Endpoint) -> Result<Vec<Backend>> {
        resolve(endpoint)
            .await?
            .into_iter()
            .map(|addr| -> Result<Backend> {
                let mut backend = Backend::new(&addr.to_string())?;
                let peer = HttpPeer::new(addr, self.tls, self.sni.clone());
                assert!(backend.ext.insert::<HttpPeer>(peer).is_none());
                Ok(backend)
            })
            .collect()
    }
}

#[async_trait]
impl ServiceDiscovery for UpstreamDiscovery {
    async fn discover(&self) -> Result<(BTreeSet<Backend>, HashMap<u64, bool>)> {
        let upstreams = match self.discovery.upstreams() {
            Ok(upstreams) => upstreams,
            // withdrawn endpoints must leave the balancer as well
            Err(DiscoveryError::NoUpstreams(service)) => {
                log::warn!("No upstreams available for service: {service}");
                return Ok((BTreeSet::new(), HashMap::new()));
            }
            Err(e) => return Err(e.into()),
        };

        let resolved = join_all(upstreams.iter().map(|endpoint| self.backends(endpoint))).await;

        let mut backends = BTreeSet::new();
        for (endpoint, result) in upstreams.iter().zip(resolved) {
            match result {
                Ok(found) => backends.extend(found),
                Err(e) => log::warn!("Skipping upstream {endpoint}: {e}"),
            }
        }
        log::debug!("Discovered {} backends", backends.len());

        Ok((backends, HashMap::new()))
    }
}

/// Owns the provider's lifetime inside the server.
///
/// Provisioning happens here rather than before `run_forever`, so provider
/// tasks live on a runtime that exists after daemonizing.
pub struct DiscoveryService {
    discovery: Arc<DynamicDiscovery>,
}

impl DiscoveryService {
    pub fn new(discovery: Arc<DynamicDiscovery>) -> Self {
        Self { discovery }
    }

    /// Provisions the provider, waits for shutdown, then cleans up.
    /// Only a provisioning failure is returned.
    pub async fn run(&self, mut shutdown: ShutdownWatch) -> DiscoveryResult<()> {
        self.discovery.provision().await?;

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        log::info!("Shutdown signal received, stopping service discovery");
        if let Err(e) = self.discovery.cleanup().await {
            log::error!("Failed to clean up service discovery: {e}");
        }
        Ok(())
    }
}

#[async_trait]
impl BackgroundService for DiscoveryService {
    async fn start(&self, shutdown: ShutdownWatch) {
        if let Err(e) = self.run(shutdown).await {
            if e.is_configuration() {
                log::error!("Invalid service discovery configuration: {e}");
            } else {
                log::error!("Failed to provision service discovery: {e}");
            }
            eprintln!("Failed to provision service discovery: {e}");
            std::process::exit(1);
        }
    }
}
