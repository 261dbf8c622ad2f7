pub mod discovery;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use pingora::upstreams::peer::HttpPeer;
use pingora_error::{Error, ErrorType::HTTPStatus, Result};
use pingora_load_balancing::{selection::RoundRobin, Backends, LoadBalancer};
use pingora_proxy::{ProxyHttp, Session};

use crate::config::{Upstream, UpstreamScheme};
use crate::discovery::dynamic::DynamicDiscovery;

use self::discovery::UpstreamDiscovery;

/// Builds a round-robin balancer whose backends come from discovery.
///
/// The balancer only refreshes once it runs as a background service.
pub fn build_load_balancer(
    discovery: Arc<DynamicDiscovery>,
    upstream: &Upstream,
) -> LoadBalancer<RoundRobin> {
    let backends = Backends::new(Box::new(UpstreamDiscovery::new(discovery, upstream)));
    let mut lb = LoadBalancer::<RoundRobin>::from_backends(backends);
    lb.update_frequency = Some(Duration::from_secs(upstream.update_frequency));
    lb
}

/// Proxies every request to the next discovered upstream.
pub struct DiscoveryProxy {
    lb: Arc<LoadBalancer<RoundRobin>>,
    discovery: Arc<DynamicDiscovery>,
    tls: bool,
    sni: String,
}

impl DiscoveryProxy {
    pub fn new(
        lb: Arc<LoadBalancer<RoundRobin>>,
        discovery: Arc<DynamicDiscovery>,
        upstream: &Upstream,
    ) -> Self {
        Self {
            lb,
            discovery,
            tls: upstream.scheme == UpstreamScheme::HTTPS,
            sni: upstream.sni.clone(),
        }
    }
}

#[async_trait]
impl ProxyHttp for DiscoveryProxy {
    type CTX = ();

    fn new_ctx(&self) -> Self::CTX {}

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let Some(backend) = self.lb.select(b"", 256) else {
            // report why the balancer is empty
            let reason = match self.discovery.upstreams() {
                Err(e) => e.to_string(),
                Ok(_) => "upstreams are not synced yet".to_string(),
            };
            log::warn!("No upstream selected: {reason}");
            return Err(Error::explain(HTTPStatus(502), reason));
        };

        log::debug!("Selected upstream {}", backend.addr);
        let peer = match backend.ext.get::<HttpPeer>() {
            Some(peer) => peer.clone(),
            None => HttpPeer::new(backend, self.tls, self.sni.clone()),
        };

        Ok(Box::new(peer))
    }
}
