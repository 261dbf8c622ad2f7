//! Nacos naming service discovery.
//!
//! The registry pushes membership changes to a standing subscription; the
//! listener rebuilds the upstream list from every delivery.

use std::sync::Arc;

use async_trait::async_trait;
use nacos_sdk::api::{
    naming::{
        NamingChangeEvent, NamingEventListener, NamingService, NamingServiceBuilder,
        ServiceInstance,
    },
    props::ClientProps,
};
use parking_lot::Mutex;

use crate::config::directive::Directive;
use crate::core::{
    endpoint::Endpoint,
    error::{DiscoveryError, DiscoveryResult},
    store::UpstreamStore,
};

use super::{DiscoveryProvider, Lifecycle};

pub const DEFAULT_GROUP: &str = "DEFAULT_GROUP";

/// A registered service instance as delivered by the registry.
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub ip: String,
    pub port: u16,
    pub enabled: bool,
    pub healthy: bool,
}

/// Connection parameters for the naming client.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServerConfig {
    pub server_addr: String,
    pub server_port: u16,
    pub namespace_id: String,
}

/// The (service, group, clusters) key of a subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct Subscription {
    pub service_name: String,
    pub group_name: String,
    pub clusters: Vec<String>,
}

/// Receives membership changes from the naming client.
pub trait InstanceListener: Send + Sync {
    fn on_change(&self, instances: DiscoveryResult<Vec<Instance>>);
}

/// A naming client that delivers membership changes itself.
#[async_trait]
pub trait NamingClient: Send + Sync {
    async fn subscribe(
        &self,
        subscription: &Subscription,
        listener: Arc<dyn InstanceListener>,
    ) -> DiscoveryResult<()>;

    async fn unsubscribe(&self, subscription: &Subscription) -> DiscoveryResult<()>;

    /// Releases the underlying connection.
    async fn close(&self);
}

/// Builds naming clients.
pub trait NamingConnector: Send + Sync {
    fn connect(&self, server: &ServerConfig) -> DiscoveryResult<Arc<dyn NamingClient>>;
}

/// Rebuilds the store from every push.
struct UpstreamListener {
    service_name: String,
    store: Arc<UpstreamStore>,
}

impl InstanceListener for UpstreamListener {
    fn on_change(&self, instances: DiscoveryResult<Vec<Instance>>) {
        let instances = match instances {
            Ok(instances) => instances,
            Err(e) => {
                log::error!("nacos subscription callback error: {e}");
                return;
            }
        };

        let upstreams: Vec<Endpoint> = instances
            .iter()
            .filter(|instance| instance.enabled && instance.healthy)
            .filter_map(|instance| match Endpoint::new(&instance.ip, instance.port) {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    log::warn!("Skipping nacos instance of '{}': {e}", self.service_name);
                    None
                }
            })
            .collect();

        log::debug!(
            "Updated upstreams from nacos for service '{}': {} instances",
            self.service_name,
            upstreams.len()
        );
        self.store.replace(upstreams);
    }
}

/// Registry-push provider backed by Nacos.
pub struct NacosProvider {
    server: ServerConfig,
    service_name: String,
    group_name: String,
    clusters: Vec<String>,

    lifecycle: Lifecycle,
    store: Arc<UpstreamStore>,
    connector: Arc<dyn NamingConnector>,
    client: Mutex<Option<Arc<dyn NamingClient>>>,
}

impl Default for NacosProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl NacosProvider {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(SdkConnector))
    }

    pub fn with_connector(connector: Arc<dyn NamingConnector>) -> Self {
        Self {
            server: ServerConfig::default(),
            service_name: String::new(),
            group_name: DEFAULT_GROUP.to_string(),
            clusters: Vec::new(),
            lifecycle: Lifecycle::new("nacos"),
            store: Arc::new(UpstreamStore::new()),
            connector,
            client: Mutex::new(None),
        }
    }

    fn subscription(&self) -> Subscription {
        Subscription {
            service_name: self.service_name.clone(),
            group_name: self.group_name.clone(),
            clusters: self.clusters.clone(),
        }
    }
}

#[async_trait]
impl DiscoveryProvider for NacosProvider {
    fn name(&self) -> &'static str {
        "nacos"
    }

    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn configure(&mut self, directives: &[Directive]) -> DiscoveryResult<()> {
        for directive in directives {
            match directive.name.as_str() {
                "server_addr" => self.server.server_addr = directive.single_arg()?.to_string(),
                "server_port" => self.server.server_port = directive.u16_arg()?,
                "namespace_id" => self.server.namespace_id = directive.single_arg()?.to_string(),
                "service_name" => self.service_name = directive.single_arg()?.to_string(),
                "group_name" => self.group_name = directive.single_arg()?.to_string(),
                "clusters" => self.clusters = directive.remaining_args(),
                _ => {
                    return Err(DiscoveryError::UnknownDirective {
                        provider: "nacos",
                        directive: directive.name.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    fn check_config(&self) -> DiscoveryResult<()> {
        let missing = |field| DiscoveryError::MissingField {
            provider: "nacos",
            field,
            hint: "",
        };
        if self.server.server_addr.is_empty() {
            return Err(missing("server_addr"));
        }
        if self.server.server_port == 0 {
            return Err(missing("server_port"));
        }
        if self.service_name.is_empty() {
            return Err(missing("service_name"));
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
        log::info!(
            "Connecting to nacos at {}:{} (group '{}')",
            self.server.server_addr,
            self.server.server_port,
            self.group_name
        );
        let client = self.connector.connect(&self.server)?;

        let listener = Arc::new(UpstreamListener {
            service_name: self.service_name.clone(),
            store: self.store.clone(),
        });

        if let Err(e) = client.subscribe(&self.subscription(), listener).await {
            client.close().await;
            return Err(e);
        }

        *self.client.lock() = Some(client);
        Ok(())
    }

    async fn stop(&self) -> DiscoveryResult<()> {
        let Some(client) = self.client.lock().take() else {
            return Ok(());
        };

        let result = client.unsubscribe(&self.subscription()).await;
        if let Err(e) = &result {
            log::error!("{e}");
        }
        client.close().await;
        result
    }
}

/// Builds naming clients on top of `nacos-sdk`.
struct SdkConnector;

impl NamingConnector for SdkConnector {
    fn connect(&self, server: &ServerConfig) -> DiscoveryResult<Arc<dyn NamingClient>> {
        let props = ClientProps::new()
            .server_addr(format!("{}:{}", server.server_addr, server.server_port))
            .namespace(server.namespace_id.clone())
            .app_name("pingsd");

        let service = NamingServiceBuilder::new(props)
            .build()
            .map_err(|e| DiscoveryError::provision("creating nacos naming client", e))?;

        Ok(Arc::new(SdkNamingClient {
            service: Mutex::new(Some(Arc::new(service))),
            listener: Mutex::new(None),
        }))
    }
}

struct SdkNamingClient {
    service: Mutex<Option<Arc<dyn NamingService>>>,
    // unsubscribe must hand back the exact listener that was subscribed
    listener: Mutex<Option<Arc<dyn NamingEventListener>>>,
}

impl SdkNamingClient {
    fn service(&self) -> Option<Arc<dyn NamingService>> {
        self.service.lock().clone()
    }
}

struct SdkListener {
    inner: Arc<dyn InstanceListener>,
}

impl NamingEventListener for SdkListener {
    fn event(&self, event: Arc<NamingChangeEvent>) {
        let instances = match &event.instances {
            Some(instances) => Ok(instances.iter().filter_map(to_instance).collect()),
            None => Err(DiscoveryError::refresh(
                format!("nacos push for service '{}'", event.service_name),
                "notification carried no instance list",
            )),
        };
        self.inner.on_change(instances);
    }
}

fn to_instance(instance: &ServiceInstance) -> Option<Instance> {
    let port = u16::try_from(instance.port).ok()?;
    Some(Instance {
        ip: instance.ip.clone(),
        port,
        enabled: instance.enabled,
        healthy: instance.healthy,
    })
}

#[async_trait]
impl NamingClient for SdkNamingClient {
    async fn subscribe(
        &self,
        subscription: &Subscription,
        listener: Arc<dyn InstanceListener>,
    ) -> DiscoveryResult<()> {
        let service = self
            .service()
            .ok_or_else(|| DiscoveryError::provision("subscribing to nacos", "client is closed"))?;

        let listener: Arc<dyn NamingEventListener> = Arc::new(SdkListener { inner: listener });
        service
            .subscribe(
                subscription.service_name.clone(),
                Some(subscription.group_name.clone()),
                subscription.clusters.clone(),
                listener.clone(),
            )
            .await
            .map_err(|e| {
                DiscoveryError::provision(
                    format!("subscribing to nacos service '{}'", subscription.service_name),
                    e,
                )
            })?;

        *self.listener.lock() = Some(listener);
        Ok(())
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> DiscoveryResult<()> {
        let (Some(service), Some(listener)) = (self.service(), self.listener.lock().take()) else {
            return Ok(());
        };

        service
            .unsubscribe(
                subscription.service_name.clone(),
                Some(subscription.group_name.clone()),
                subscription.clusters.clone(),
                listener,
            )
            .await
            .map_err(|e| {
                DiscoveryError::cleanup(
                    format!(
                        "unsubscribing from nacos service '{}'",
                        subscription.service_name
                    ),
                    e,
                )
            })
    }

    async fn close(&self) {
        // dropping the last handle shuts the client's connection down
        self.service.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::Notify;

    use super::*;
    use crate::discovery::LifecycleState;

    #[derive(Default)]
    struct MockClient {
        listener: Mutex<Option<Arc<dyn InstanceListener>>>,
        subscribed: Mutex<Option<Subscription>>,
        fail_subscribe: bool,
        fail_unsubscribe: bool,
        closed: AtomicBool,
        // (entered, release): subscribe parks between the two
        gate: Option<(Arc<Notify>, Arc<Notify>)>,
    }

    impl MockClient {
        fn push(&self, instances: DiscoveryResult<Vec<Instance>>) {
            let listener = self.listener.lock().clone().expect("subscribed");
            listener.on_change(instances);
        }
    }

    #[async_trait]
    impl NamingClient for MockClient {
        async fn subscribe(
            &self,
            subscription: &Subscription,
            listener: Arc<dyn InstanceListener>,
        ) -> DiscoveryResult<()> {
            if self.fail_subscribe {
                return Err(DiscoveryError::provision("subscribing", "connection refused"));
            }
            if let Some((entered, release)) = &self.gate {
                entered.notify_one();
                release.notified().await;
            }
            *self.subscribed.lock() = Some(subscription.clone());
            *self.listener.lock() = Some(listener);
            Ok(())
        }

        async fn unsubscribe(&self, _subscription: &Subscription) -> DiscoveryResult<()> {
            if self.fail_unsubscribe {
                return Err(DiscoveryError::cleanup("unsubscribing", "timeout"));
            }
            self.listener.lock().take();
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct MockConnector(Arc<MockClient>);

    impl NamingConnector for MockConnector {
        fn connect(&self, _server: &ServerConfig) -> DiscoveryResult<Arc<dyn NamingClient>> {
            Ok(self.0.clone())
        }
    }

    struct FailingConnector;

    impl NamingConnector for FailingConnector {
        fn connect(&self, _server: &ServerConfig) -> DiscoveryResult<Arc<dyn NamingClient>> {
            Err(DiscoveryError::provision(
                "creating nacos naming client",
                "bad address",
            ))
        }
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn configured(client: Arc<MockClient>) -> NacosProvider {
        let mut provider = NacosProvider::with_connector(Arc::new(MockConnector(client)));
        provider
            .configure(&[
                Directive::new("server_addr", args(&["127.0.0.1"])),
                Directive::new("server_port", args(&["8848"])),
                Directive::new("service_name", args(&["orders"])),
                Directive::new("clusters", args(&["a", "b"])),
            ])
            .unwrap();
        provider
    }

    fn instance(ip: &str, port: u16, enabled: bool, healthy: bool) -> Instance {
        Instance {
            ip: ip.to_string(),
            port,
            enabled,
            healthy,
        }
    }

    #[test]
    fn test_configure_defaults_and_errors() {
        let provider = configured(Arc::new(MockClient::default()));
        assert_eq!(provider.group_name, DEFAULT_GROUP);
        assert_eq!(provider.clusters, ["a", "b"]);
        assert_eq!(provider.server.server_port, 8848);

        let mut provider = NacosProvider::new();
        let err = provider
            .configure(&[Directive::new("weight", args(&["1"]))])
            .unwrap_err();
        assert_eq!(err.to_string(), "unrecognized nacos subdirective 'weight'");

        let err = provider
            .configure(&[Directive::new("server_port", args(&["http"]))])
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid port for server_port: 'http'");
    }

    #[test]
    fn test_validate_names_missing_field() {
        let mut provider = NacosProvider::new();
        assert_eq!(
            provider.validate().unwrap_err().to_string(),
            "nacos provider: server_addr is required"
        );

        provider
            .configure(&[Directive::new("server_addr", args(&["10.0.0.9"]))])
            .unwrap();
        assert_eq!(
            provider.validate().unwrap_err().to_string(),
            "nacos provider: server_port is required"
        );

        provider
            .configure(&[Directive::new("server_port", args(&["8848"]))])
            .unwrap();
        assert_eq!(
            provider.validate().unwrap_err().to_string(),
            "nacos provider: service_name is required"
        );
    }

    #[tokio::test]
    async fn test_push_keeps_enabled_and_healthy_instances() {
        let client = Arc::new(MockClient::default());
        let provider = configured(client.clone());
        provider.provision().await.unwrap();

        let subscribed = client.subscribed.lock().clone().unwrap();
        assert_eq!(subscribed.service_name, "orders");
        assert_eq!(subscribed.group_name, DEFAULT_GROUP);
        assert_eq!(subscribed.clusters, ["a", "b"]);

        client.push(Ok(vec![
            instance("10.0.0.1", 8080, true, true),
            instance("10.0.0.2", 8080, true, false),
            instance("10.0.0.3", 8080, false, true),
        ]));

        let upstreams = provider.upstreams().unwrap();
        assert_eq!(upstreams.len(), 1);
        assert_eq!(upstreams[0].dial(), "10.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_push_error_keeps_previous_snapshot() {
        let client = Arc::new(MockClient::default());
        let provider = configured(client.clone());
        provider.provision().await.unwrap();

        client.push(Ok(vec![instance("10.0.0.1", 8080, true, true)]));
        client.push(Err(DiscoveryError::refresh("push", "server busy")));

        let upstreams = provider.upstreams().unwrap();
        assert_eq!(upstreams[0].dial(), "10.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_empty_push_reports_unavailable() {
        let client = Arc::new(MockClient::default());
        let provider = configured(client.clone());
        assert_eq!(
            provider.upstreams().unwrap_err().to_string(),
            "no upstreams available for service: orders"
        );

        provider.provision().await.unwrap();
        client.push(Ok(vec![instance("10.0.0.2", 8080, true, false)]));
        assert!(matches!(
            provider.upstreams(),
            Err(DiscoveryError::NoUpstreams(_))
        ));
    }

    #[tokio::test]
    async fn test_start_failures_are_fatal() {
        let client = Arc::new(MockClient {
            fail_subscribe: true,
            ..Default::default()
        });
        let provider = configured(client.clone());
        assert!(provider.provision().await.is_err());
        assert!(client.closed.load(Ordering::SeqCst));

        let mut provider = NacosProvider::with_connector(Arc::new(FailingConnector));
        provider
            .configure(&[
                Directive::new("server_addr", args(&["127.0.0.1"])),
                Directive::new("server_port", args(&["8848"])),
                Directive::new("service_name", args(&["orders"])),
            ])
            .unwrap();
        let err = provider.provision().await.unwrap_err();
        assert_eq!(err.to_string(), "creating nacos naming client: bad address");
    }

    #[tokio::test]
    async fn test_cleanup_closes_client_even_if_unsubscribe_fails() {
        let client = Arc::new(MockClient {
            fail_unsubscribe: true,
            ..Default::default()
        });
        let provider = configured(client.clone());
        provider.provision().await.unwrap();

        assert!(provider.cleanup().await.is_err());
        assert!(client.closed.load(Ordering::SeqCst));

        // second cleanup is a no-op
        assert!(provider.cleanup().await.is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_unsubscribes() {
        let client = Arc::new(MockClient::default());
        let provider = configured(client.clone());
        provider.provision().await.unwrap();
        provider.cleanup().await.unwrap();

        assert!(client.listener.lock().is_none());
        assert!(client.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cleanup_during_start_tears_down_subscription() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let client = Arc::new(MockClient {
            gate: Some((entered.clone(), release.clone())),
            ..Default::default()
        });
        let provider = Arc::new(configured(client.clone()));

        let starting = tokio::spawn({
            let provider = provider.clone();
            async move { provider.provision().await }
        });

        entered.notified().await;
        provider.cleanup().await.unwrap();
        release.notify_one();

        let err = starting.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "nacos provider: cannot provision while stopped");
        assert!(client.listener.lock().is_none());
        assert!(client.closed.load(Ordering::SeqCst));
        assert_eq!(provider.lifecycle().state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_sdk_event_conversion() {
        let (tx, rx) = std::sync::mpsc::channel();
        struct Capture(std::sync::mpsc::Sender<DiscoveryResult<Vec<Instance>>>);
        impl InstanceListener for Capture {
            fn on_change(&self, instances: DiscoveryResult<Vec<Instance>>) {
                self.0.send(instances).unwrap();
            }
        }
        let listener = SdkListener {
            inner: Arc::new(Capture(tx)),
        };

        let sdk_instance = |ip: &str, port: i32, healthy: bool| ServiceInstance {
            ip: ip.to_string(),
            port,
            healthy,
            enabled: true,
            ..Default::default()
        };
        listener.event(Arc::new(NamingChangeEvent {
            service_name: "orders".to_string(),
            group_name: DEFAULT_GROUP.to_string(),
            clusters: String::new(),
            instances: Some(vec![
                sdk_instance("10.0.0.1", 8080, true),
                sdk_instance("10.0.0.2", 70000, true),
                sdk_instance("10.0.0.3", 8080, false),
            ]),
        }));
        let instances = rx.recv().unwrap().unwrap();
        assert_eq!(
            instances,
            [
                instance("10.0.0.1", 8080, true, true),
                instance("10.0.0.3", 8080, true, false),
            ]
        );

        listener.event(Arc::new(NamingChangeEvent {
            service_name: "orders".to_string(),
            group_name: DEFAULT_GROUP.to_string(),
            clusters: String::new(),
            instances: None,
        }));
        let err = rx.recv().unwrap().unwrap_err();
        assert_eq!(
            err.to_string(),
            "nacos push for service 'orders': notification carried no instance list"
        );
    }
}
