//! Consul service discovery.
//!
//! The provider polls Consul's health endpoint on a fixed interval and
//! replaces the upstream list with whatever the last successful query
//! returned.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Url};
use serde::Deserialize;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};

use crate::config::directive::Directive;
use crate::core::{
    endpoint::Endpoint,
    error::{DiscoveryError, DiscoveryResult},
    store::UpstreamStore,
};

use super::{DiscoveryProvider, Lifecycle};

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:8500";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One healthy service instance as reported by Consul.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceEntry {
    pub service_address: String,
    pub node_address: String,
    pub port: u16,
}

impl ServiceEntry {
    /// Service address when present, node address otherwise.
    fn endpoint(&self) -> DiscoveryResult<Endpoint> {
        let host = if self.service_address.is_empty() {
            &self.node_address
        } else {
            &self.service_address
        };
        Endpoint::new(host, self.port)
    }
}

/// Parameters of a health query.
#[derive(Clone, Debug, PartialEq)]
pub struct HealthQuery {
    pub service_name: String,
    pub tags: Vec<String>,
    pub passing_only: bool,
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn health_service(&self, query: &HealthQuery) -> DiscoveryResult<Vec<ServiceEntry>>;
}

pub trait CatalogConnector: Send + Sync {
    fn connect(&self, address: &str) -> DiscoveryResult<Arc<dyn CatalogClient>>;
}

/// Fetches the service list and installs it.
struct Refresher {
    client: Arc<dyn CatalogClient>,
    query: HealthQuery,
    store: Arc<UpstreamStore>,
}

impl Refresher {
    async fn refresh(&self) -> DiscoveryResult<()> {
        let entries = self.client.health_service(&self.query).await?;

        let upstreams: Vec<Endpoint> = entries
            .iter()
            .filter_map(|entry| match entry.endpoint() {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    log::warn!(
                        "Skipping consul entry of '{}': {e}",
                        self.query.service_name
                    );
                    None
                }
            })
            .collect();

        log::debug!(
            "Updated upstreams from consul for service '{}': {} instances",
            self.query.service_name,
            upstreams.len()
        );
        self.store.replace(upstreams);
        Ok(())
    }

    async fn run(self: Arc<Self>, period: Duration, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        log::error!("Failed to update upstreams from consul: {e}");
                    }
                }
                _ = stop.changed() => {
                    log::info!("Stopping consul service watcher for '{}'", self.query.service_name);
                    return;
                }
            }
        }
    }
}

struct PollTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Registry-poll provider backed by Consul.
pub struct ConsulProvider {
    address: String,
    service_name: String,
    tags: Vec<String>,
    passing_only: bool,
    poll_interval: Duration,

    lifecycle: Lifecycle,
    store: Arc<UpstreamStore>,
    connector: Arc<dyn CatalogConnector>,
    task: Mutex<Option<PollTask>>,
}

impl Default for ConsulProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsulProvider {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(HttpConnector))
    }

    pub fn with_connector(connector: Arc<dyn CatalogConnector>) -> Self {
        Self {
            address: String::new(),
            service_name: String::new(),
            tags: Vec::new(),
            passing_only: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            lifecycle: Lifecycle::new("consul"),
            store: Arc::new(UpstreamStore::new()),
            connector,
            task: Mutex::new(None),
        }
    }

    fn address(&self) -> &str {
        if self.address.is_empty() {
            DEFAULT_ADDRESS
        } else {
            &self.address
        }
    }
}

#[async_trait]
impl DiscoveryProvider for ConsulProvider {
    fn name(&self) -> &'static str {
        "consul"
    }

    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn configure(&mut self, directives: &[Directive]) -> DiscoveryResult<()> {
        for directive in directives {
            match directive.name.as_str() {
                "address" => self.address = directive.single_arg()?.to_string(),
                "service_name" => self.service_name = directive.single_arg()?.to_string(),
                "tags" => self.tags = directive.remaining_args(),
                "passing_only" => self.passing_only = directive.bool_arg()?,
                "poll_interval" => {
                    let interval = directive.duration_arg()?;
                    if interval.is_zero() {
                        return Err(DiscoveryError::invalid_value(
                            &directive.name,
                            "duration",
                            directive.single_arg()?,
                        ));
                    }
                    self.poll_interval = interval;
                }
                _ => {
                    return Err(DiscoveryError::UnknownDirective {
                        provider: "consul",
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
                provider: "consul",
                field: "service_name",
                hint: "",
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
        log::info!("Connecting to consul at {}", self.address());
        let client = self.connector.connect(self.address())?;

        let refresher = Arc::new(Refresher {
            client,
            query: HealthQuery {
                service_name: self.service_name.clone(),
                tags: self.tags.clone(),
                passing_only: self.passing_only,
            },
            store: self.store.clone(),
        });

        // the first request after start should not wait a whole interval
        if let Err(e) = refresher.refresh().await {
            log::error!("Initial fetch from consul failed: {e}");
        }

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(refresher.run(self.poll_interval, stop_rx));
        *self.task.lock() = Some(PollTask { stop, handle });
        Ok(())
    }

    async fn stop(&self) -> DiscoveryResult<()> {
        let Some(PollTask { stop, handle }) = self.task.lock().take() else {
            return Ok(());
        };

        let _ = stop.send(true);
        if let Err(e) = handle.await {
            log::warn!("Consul watcher for '{}' exited abnormally: {e}", self.service_name);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Node")]
    node: HealthNode,
    #[serde(rename = "Service")]
    service: HealthService,
}

#[derive(Debug, Deserialize)]
struct HealthNode {
    #[serde(rename = "Address", default)]
    address: String,
}

#[derive(Debug, Deserialize)]
struct HealthService {
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
}

impl From<HealthEntry> for ServiceEntry {
    fn from(entry: HealthEntry) -> Self {
        ServiceEntry {
            service_address: entry.service.address,
            node_address: entry.node.address,
            port: entry.service.port,
        }
    }
}

/// Consul HTTP API client.
struct HttpConnector;

impl CatalogConnector for HttpConnector {
    fn connect(&self, address: &str) -> DiscoveryResult<Arc<dyn CatalogClient>> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DiscoveryError::provision("creating consul client", e))?;

        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let base_url = Url::parse(&base_url)
            .map_err(|e| DiscoveryError::provision(format!("parsing consul address '{address}'"), e))?;

        Ok(Arc::new(HttpCatalogClient { client, base_url }))
    }
}

struct HttpCatalogClient {
    client: Client,
    base_url: Url,
}

impl HttpCatalogClient {
    /// `<base>/v1/health/service/<name>`, with the name percent-encoded.
    fn health_url(&self, service_name: &str) -> DiscoveryResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DiscoveryError::InvalidEndpoint(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["v1", "health", "service", service_name]);
        Ok(url)
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn health_service(&self, query: &HealthQuery) -> DiscoveryResult<Vec<ServiceEntry>> {
        let context = || format!("querying consul for service '{}'", query.service_name);

        let mut params: Vec<(&str, String)> = query
            .tags
            .iter()
            .map(|tag| ("tag", tag.clone()))
            .collect();
        if query.passing_only {
            params.push(("passing", "true".to_string()));
        }

        let response = self
            .client
            .get(self.health_url(&query.service_name)?)
            .query(&params)
            .send()
            .await
            .map_err(|e| DiscoveryError::refresh(context(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::refresh(
                context(),
                format!("unexpected status {status}"),
            ));
        }

        let entries: Vec<HealthEntry> = response
            .json()
            .await
            .map_err(|e| DiscoveryError::refresh(context(), e))?;
        Ok(entries.into_iter().map(ServiceEntry::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use tokio::time::sleep;

    use super::*;

    /// Replays scripted responses, repeating the last one.
    struct ScriptedClient {
        responses: Mutex<VecDeque<DiscoveryResult<Vec<ServiceEntry>>>>,
        last: Mutex<Vec<ServiceEntry>>,
        calls: AtomicUsize,
        queries: Mutex<Vec<HealthQuery>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<DiscoveryResult<Vec<ServiceEntry>>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                last: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                queries: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CatalogClient for ScriptedClient {
        async fn health_service(
            &self,
            query: &HealthQuery,
        ) -> DiscoveryResult<Vec<ServiceEntry>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().push(query.clone());
            match self.responses.lock().pop_front() {
                Some(Ok(entries)) => {
                    *self.last.lock() = entries.clone();
                    Ok(entries)
                }
                Some(Err(e)) => Err(e),
                None => Ok(self.last.lock().clone()),
            }
        }
    }

    struct ScriptedConnector(Arc<ScriptedClient>);

    impl CatalogConnector for ScriptedConnector {
        fn connect(&self, _address: &str) -> DiscoveryResult<Arc<dyn CatalogClient>> {
            Ok(self.0.clone())
        }
    }

    fn entry(service_address: &str, node_address: &str, port: u16) -> ServiceEntry {
        ServiceEntry {
            service_address: service_address.to_string(),
            node_address: node_address.to_string(),
            port,
        }
    }

    fn provider(client: Arc<ScriptedClient>, interval: &str) -> ConsulProvider {
        let mut provider = ConsulProvider::with_connector(Arc::new(ScriptedConnector(client)));
        provider
            .configure(&[
                Directive::new("service_name", vec!["web".to_string()]),
                Directive::new("poll_interval", vec![interval.to_string()]),
            ])
            .unwrap();
        provider
    }

    fn dials(provider: &ConsulProvider) -> Vec<String> {
        provider
            .upstreams()
            .unwrap()
            .iter()
            .map(|e| e.dial().to_string())
            .collect()
    }

    #[test]
    fn test_configure_defaults() {
        let provider = ConsulProvider::new();
        assert_eq!(provider.address(), DEFAULT_ADDRESS);
        assert!(provider.passing_only);
        assert_eq!(provider.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(
            provider.validate().unwrap_err().to_string(),
            "consul provider: service_name is required"
        );
    }

    #[test]
    fn test_configure_errors() {
        let mut provider = ConsulProvider::new();
        let err = provider
            .configure(&[Directive::new("passing_only", vec!["maybe".to_string()])])
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid boolean for passing_only: 'maybe'");

        let err = provider
            .configure(&[Directive::new("poll_interval", vec!["0s".to_string()])])
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid duration for poll_interval: '0s'");

        let err = provider
            .configure(&[Directive::new("datacenter", vec!["dc1".to_string()])])
            .unwrap_err();
        assert_eq!(err.to_string(), "unrecognized consul subdirective 'datacenter'");
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_address_fallback() {
        let client = ScriptedClient::new(vec![Ok(vec![
            entry("", "10.0.0.5", 9000),
            entry("10.1.0.1", "10.0.0.6", 9001),
        ])]);
        let provider = provider(client.clone(), "10s");
        provider.provision().await.unwrap();

        // installed synchronously by provision
        assert_eq!(dials(&provider), ["10.0.0.5:9000", "10.1.0.1:9001"]);
        assert_eq!(client.calls(), 1);
        assert!(client.queries.lock()[0].passing_only);

        provider.cleanup().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_failure_keeps_previous_snapshot() {
        let client = ScriptedClient::new(vec![
            Ok(vec![entry("", "10.0.0.5", 9000)]),
            Err(DiscoveryError::refresh("querying consul", "connection reset")),
            Ok(vec![entry("", "10.0.0.7", 9000)]),
        ]);
        let provider = provider(client.clone(), "1s");
        provider.provision().await.unwrap();

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(client.calls(), 2);
        assert_eq!(dials(&provider), ["10.0.0.5:9000"]);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(client.calls(), 3);
        assert_eq!(dials(&provider), ["10.0.0.7:9000"]);

        provider.cleanup().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_failure_is_not_fatal() {
        let client = ScriptedClient::new(vec![
            Err(DiscoveryError::refresh("querying consul", "connection refused")),
            Ok(vec![entry("10.0.0.8", "", 80)]),
        ]);
        let provider = provider(client.clone(), "2s");
        provider.provision().await.unwrap();
        assert_eq!(
            provider.upstreams().unwrap_err().to_string(),
            "no upstreams available for service: web"
        );

        sleep(Duration::from_millis(2500)).await;
        assert_eq!(dials(&provider), ["10.0.0.8:80"]);

        provider.cleanup().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_stops_polling() {
        let client = ScriptedClient::new(vec![Ok(vec![entry("", "10.0.0.5", 9000)])]);
        let provider = provider(client.clone(), "1s");
        provider.provision().await.unwrap();
        provider.cleanup().await.unwrap();

        let calls = client.calls();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(client.calls(), calls);

        // a stopped provider cannot be provisioned again
        assert!(provider.provision().await.is_err());
    }

    #[test]
    fn test_decode_health_response() {
        let body = r#"[
            {"Node": {"Node": "n1", "Address": "10.0.0.5"},
             "Service": {"ID": "web-1", "Service": "web", "Address": "", "Port": 9000},
             "Checks": []},
            {"Node": {"Node": "n2", "Address": "10.0.0.6"},
             "Service": {"ID": "web-2", "Service": "web", "Address": "172.16.0.2", "Port": 9001}}
        ]"#;
        let entries: Vec<ServiceEntry> = serde_json::from_str::<Vec<HealthEntry>>(body)
            .unwrap()
            .into_iter()
            .map(ServiceEntry::from)
            .collect();

        assert_eq!(
            entries,
            [entry("", "10.0.0.5", 9000), entry("172.16.0.2", "10.0.0.6", 9001)]
        );
        assert_eq!(entries[0].endpoint().unwrap().dial(), "10.0.0.5:9000");
        assert_eq!(entries[1].endpoint().unwrap().dial(), "172.16.0.2:9001");
    }

    #[test]
    fn test_health_url() {
        assert!(HttpConnector.connect("consul.local:8500/").is_ok());

        assert!(HttpConnector.connect("http://[::1").is_err());

        let http = |base: &str| HttpCatalogClient {
            client: Client::new(),
            base_url: Url::parse(base).unwrap(),
        };
        assert_eq!(
            http("http://consul.local:8500").health_url("web").unwrap().as_str(),
            "http://consul.local:8500/v1/health/service/web"
        );
        assert_eq!(
            http("https://consul.local/proxy/").health_url("web").unwrap().as_str(),
            "https://consul.local/proxy/v1/health/service/web"
        );
    }

    #[test]
    fn test_health_url_encodes_service_name() {
        let http = HttpCatalogClient {
            client: Client::new(),
            base_url: Url::parse("http://127.0.0.1:8500").unwrap(),
        };
        assert_eq!(
            http.health_url("web/admin?x=1").unwrap().as_str(),
            "http://127.0.0.1:8500/v1/health/service/web%2Fadmin%3Fx=1"
        );
        assert_eq!(
            http.health_url("my service").unwrap().path(),
            "/v1/health/service/my%20service"
        );
    }
}
