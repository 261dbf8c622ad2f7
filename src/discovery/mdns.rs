//! mDNS / DNS-SD service discovery.
//!
//! A browse task streams advertisements and withdrawals from the local
//! network into a consumer task, which keeps the set of live instances and
//! reinstalls the upstream list after every change.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};

use crate::config::directive::Directive;
use crate::core::{
    endpoint::Endpoint,
    error::{DiscoveryError, DiscoveryResult},
    store::UpstreamStore,
};

use super::{DiscoveryProvider, Lifecycle};

pub const DEFAULT_DOMAIN: &str = "local.";
pub const DEFAULT_BROWSE_TIMEOUT: Duration = Duration::from_secs(5);
const ENTRY_BUFFER: usize = 64;

/// One advertisement or withdrawal seen on the network.
///
/// A `ttl` of zero means the instance left the network.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BrowseEntry {
    pub instance: String,
    pub ttl: u32,
    pub port: u16,
    pub addr_ipv4: Vec<Ipv4Addr>,
    pub addr_ipv6: Vec<Ipv6Addr>,
}

impl BrowseEntry {
    /// First IPv4 address, else first IPv6 address.
    fn endpoint(&self) -> Option<Endpoint> {
        let addr = self
            .addr_ipv4
            .first()
            .map(|ip| IpAddr::V4(*ip))
            .or_else(|| self.addr_ipv6.first().map(|ip| IpAddr::V6(*ip)))?;
        Endpoint::new(&addr.to_string(), self.port).ok()
    }
}

/// A local resolver able to browse for one service type.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Streams entries into `entries` until `stop` fires. Returns an error
    /// only if browsing could not begin.
    async fn browse(
        &self,
        service_type: &str,
        domain: &str,
        entries: mpsc::Sender<BrowseEntry>,
        stop: watch::Receiver<bool>,
    ) -> DiscoveryResult<()>;
}

pub trait ResolverConnector: Send + Sync {
    fn open(&self) -> DiscoveryResult<Arc<dyn Resolver>>;
}

/// Applies one entry to the active set; returns whether the set changed.
fn apply_entry(active: &mut BTreeMap<String, Endpoint>, entry: BrowseEntry) -> bool {
    if entry.ttl == 0 {
        if active.remove(&entry.instance).is_some() {
            log::info!("mDNS service instance left: {}", entry.instance);
            return true;
        }
        return false;
    }

    let Some(endpoint) = entry.endpoint() else {
        return false;
    };
    log::info!(
        "mDNS service instance found/updated: {} at {}",
        entry.instance,
        endpoint
    );
    active.insert(entry.instance, endpoint);
    true
}

async fn consume_entries(mut entries: mpsc::Receiver<BrowseEntry>, store: Arc<UpstreamStore>) {
    let mut active = BTreeMap::new();
    while let Some(entry) = entries.recv().await {
        if apply_entry(&mut active, entry) {
            let upstreams: Vec<Endpoint> = active.values().cloned().collect();
            log::debug!("Updated upstreams from mDNS: {} instances", upstreams.len());
            store.replace(upstreams);
        }
    }
}

struct BrowseContext {
    connector: Arc<dyn ResolverConnector>,
    service_type: String,
    domain: String,
    store: Arc<UpstreamStore>,
}

impl BrowseContext {
    async fn run(self, stop: watch::Receiver<bool>) {
        let resolver = match self.connector.open() {
            Ok(resolver) => resolver,
            Err(e) => {
                log::error!("Failed to initialize mDNS resolver: {e}");
                return;
            }
        };

        let (tx, rx) = mpsc::channel(ENTRY_BUFFER);
        let consumer = tokio::spawn(consume_entries(rx, self.store.clone()));

        log::info!(
            "Starting mDNS browser for {} in {}",
            self.service_type,
            self.domain
        );
        // the sender is dropped when browse returns, which ends the consumer
        if let Err(e) = resolver
            .browse(&self.service_type, &self.domain, tx, stop)
            .await
        {
            log::error!("mDNS browse failed to start: {e}");
        }

        let _ = consumer.await;
        log::info!("mDNS browser for {} stopped", self.service_type);
    }
}

struct BrowseTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Broadcast-listen provider backed by mDNS.
pub struct MdnsProvider {
    service_name: String,
    domain: String,
    browse_timeout: Duration,

    lifecycle: Lifecycle,
    store: Arc<UpstreamStore>,
    connector: Arc<dyn ResolverConnector>,
    task: Mutex<Option<BrowseTask>>,
}

impl Default for MdnsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MdnsProvider {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(MdnsSdConnector))
    }

    pub fn with_connector(connector: Arc<dyn ResolverConnector>) -> Self {
        Self {
            service_name: String::new(),
            domain: DEFAULT_DOMAIN.to_string(),
            browse_timeout: DEFAULT_BROWSE_TIMEOUT,
            lifecycle: Lifecycle::new("mdns"),
            store: Arc::new(UpstreamStore::new()),
            connector,
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl DiscoveryProvider for MdnsProvider {
    fn name(&self) -> &'static str {
        "mdns"
    }

    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn configure(&mut self, directives: &[Directive]) -> DiscoveryResult<()> {
        for directive in directives {
            match directive.name.as_str() {
                "service_name" => self.service_name = directive.single_arg()?.to_string(),
                "domain" => self.domain = directive.single_arg()?.to_string(),
                "browse_timeout" => self.browse_timeout = directive.duration_arg()?,
                _ => {
                    return Err(DiscoveryError::UnknownDirective {
                        provider: "mdns",
                        directive: directive.name.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    fn check_config(&self) -> DiscoveryResult<()> {
        if self.service_name.is_empty() {
            return Err(DiscoveryError::MissingField {
                provider: "mdns",
                field: "service_name",
                hint: " (e.g., '_http._tcp')",
            });
        }
        Ok(())
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn store(&self) -> &UpstreamStore {
        &self.store
    }

    async fn start(&self) -> DiscoveryResult<()> {
        let context = BrowseContext {
            connector: self.connector.clone(),
            service_type: self.service_name.clone(),
            domain: self.domain.clone(),
            store: self.store.clone(),
        };

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(context.run(stop_rx));
        *self.task.lock() = Some(BrowseTask { stop, handle });
        Ok(())
    }

    /// Cancels browsing and waits up to `browse_timeout` for both tasks to
    /// exit before aborting them.
    async fn stop(&self) -> DiscoveryResult<()> {
        let Some(BrowseTask { stop, mut handle }) = self.task.lock().take() else {
            return Ok(());
        };

        let _ = stop.send(true);
        if timeout(self.browse_timeout, &mut handle).await.is_err() {
            log::warn!(
                "mDNS browser for {} did not stop within {:?}, aborting",
                self.service_name,
                self.browse_timeout
            );
            handle.abort();
        }
        Ok(())
    }
}

/// Fully qualified browse target, e.g. `_http._tcp.local.`.
fn service_domain(service_type: &str, domain: &str) -> String {
    let domain = domain.trim_matches('.');
    format!("{}.{}.", service_type.trim_end_matches('.'), domain)
}

fn resolved_entry(info: &ServiceInfo) -> BrowseEntry {
    let mut addr_ipv4 = Vec::new();
    let mut addr_ipv6 = Vec::new();
    for addr in info.get_addresses() {
        match addr {
            IpAddr::V4(ip) => addr_ipv4.push(*ip),
            IpAddr::V6(ip) => addr_ipv6.push(*ip),
        }
    }
    addr_ipv4.sort();
    addr_ipv6.sort();

    BrowseEntry {
        instance: info.get_fullname().to_string(),
        ttl: info.get_host_ttl(),
        port: info.get_port(),
        addr_ipv4,
        addr_ipv6,
    }
}

/// Resolver built on the `mdns-sd` daemon.
struct MdnsSdConnector;

impl ResolverConnector for MdnsSdConnector {
    fn open(&self) -> DiscoveryResult<Arc<dyn Resolver>> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| DiscoveryError::provision("creating mDNS daemon", e))?;
        Ok(Arc::new(MdnsSdResolver { daemon }))
    }
}

struct MdnsSdResolver {
    daemon: ServiceDaemon,
}

#[async_trait]
impl Resolver for MdnsSdResolver {
    async fn browse(
        &self,
        service_type: &str,
        domain: &str,
        entries: mpsc::Sender<BrowseEntry>,
        mut stop: watch::Receiver<bool>,
    ) -> DiscoveryResult<()> {
        let target = service_domain(service_type, domain);
        let events = self
            .daemon
            .browse(&target)
            .map_err(|e| DiscoveryError::provision(format!("browsing for {target}"), e))?;

        loop {
            let entry = tokio::select! {
                _ = stop.changed() => break,
                event = events.recv_async() => match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => resolved_entry(&info),
                    Ok(ServiceEvent::ServiceRemoved(_, fullname)) => BrowseEntry {
                        instance: fullname,
                        ..Default::default()
                    },
                    Ok(_) => continue,
                    Err(_) => break,
                },
            };
            if entries.send(entry).await.is_err() {
                break;
            }
        }

        if let Err(e) = self.daemon.stop_browse(&target) {
            log::warn!("Failed to stop mDNS browse for {target}: {e}");
        }
        if let Err(e) = self.daemon.shutdown() {
            log::warn!("Failed to shut down mDNS daemon: {e}");
        }
        Ok(())
    }
}
