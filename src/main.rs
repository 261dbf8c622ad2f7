use std::sync::Arc;

use pingora_core::apps::HttpServerOptions;
use pingora_core::listeners::tls::TlsSettings;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use pingora_core::services::background::background_service;
use pingora_proxy::http_proxy_service_with_name;

use pingsd::config::{Config, Tls};
use pingsd::discovery::dynamic::DynamicDiscovery;
use pingsd::logging::Logger;
use pingsd::proxy::{build_load_balancer, discovery::DiscoveryService, DiscoveryProxy};

fn main() {
    // Read command-line arguments
    let opt = Opt::parse_args();

    // Load configuration with optional override
    let config = Config::load_yaml_with_opt_override(&opt).expect("Failed to load configuration");

    // Initialize logging
    let logger = config.log.clone().map(Logger::new);
    match &logger {
        Some(logger) => logger.init_env_logger(),
        None => env_logger::init(),
    }

    // Select and validate the discovery provider
    log::info!("Configuring service discovery...");
    let discovery = DynamicDiscovery::from_config(&config.discovery)
        .expect("Failed to configure service discovery");
    discovery
        .validate()
        .expect("Invalid service discovery configuration");
    let discovery = Arc::new(discovery);

    // Create Pingora server with optional configuration
    let mut pingsd_server = Server::new_with_opt_and_conf(Some(opt), config.pingora);

    // Build the balancer fed by discovery
    let lb = background_service(
        "upstream discovery",
        build_load_balancer(discovery.clone(), &config.upstream),
    );
    let proxy = DiscoveryProxy::new(lb.task(), discovery.clone(), &config.upstream);

    // Create HTTP proxy service with name
    let mut http_service =
        http_proxy_service_with_name(&pingsd_server.configuration, proxy, "pingsd");

    // Add listeners from configuration
    log::info!("Adding listeners...");
    for list_cfg in config.listeners {
        match list_cfg.tls {
            Some(Tls {
                cert_path,
                key_path,
            }) => {
                let mut settings = TlsSettings::intermediate(&cert_path, &key_path)
                    .expect("Adding TLS listener shouldn't fail");
                if list_cfg.offer_h2 {
                    settings.enable_h2();
                }
                http_service.add_tls_with_settings(&list_cfg.address.to_string(), None, settings);
            }
            None => {
                if list_cfg.offer_h2c {
                    let http_logic = http_service.app_logic_mut().unwrap();
                    let mut http_server_options = HttpServerOptions::default();
                    http_server_options.h2c = true;
                    http_logic.server_options = Some(http_server_options);
                }
                http_service.add_tcp(&list_cfg.address.to_string());
            }
        }
    }

    // Bootstrapping and server startup
    log::info!("Bootstrapping...");
    pingsd_server.bootstrap();

    log::info!("Bootstrapped. Adding Services...");
    pingsd_server.add_service(lb);
    pingsd_server.add_service(http_service);
    // Provisioned by the service itself, after any daemonizing fork
    pingsd_server.add_service(background_service(
        "service discovery",
        DiscoveryService::new(discovery),
    ));
    if let Some(logger) = logger {
        pingsd_server.add_service(logger);
    }

    log::info!("Starting Server...");
    pingsd_server.run_forever();
}
