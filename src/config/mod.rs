pub mod directive;

use std::fs;
use std::net::SocketAddr;

use log::{debug, trace};
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use validator::{Validate, ValidationError};

use crate::core::error::DiscoveryResult;
use crate::discovery::supported_providers;

use self::directive::{directives_from_yaml, Directive};

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    pub log: Option<Log>,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub listeners: Vec<Listener>,

    #[validate(nested)]
    #[serde(default)]
    pub upstream: Upstream,

    #[validate(nested)]
    pub discovery: Discovery,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Listener::validate_tls_for_offer_h2"))]
pub struct Listener {
    pub address: SocketAddr,
    pub tls: Option<Tls>,
    #[serde(default)]
    pub offer_h2: bool,
    #[serde(default)]
    pub offer_h2c: bool,
}

impl Listener {
    fn validate_tls_for_offer_h2(&self) -> Result<(), ValidationError> {
        if self.offer_h2 && self.tls.is_none() {
            Err(ValidationError::new("tls_required_for_h2"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tls {
    pub cert_path: String,
    pub key_path: String,
}

/// How discovered endpoints are dialed and how often the balancer
/// re-reads them.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Upstream {
    #[serde(default)]
    pub scheme: UpstreamScheme,
    #[serde(default)]
    pub sni: String,
    /// Seconds between two balancer refreshes.
    #[validate(range(min = 1))]
    #[serde(default = "Upstream::default_update_frequency")]
    pub update_frequency: u64,
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            scheme: UpstreamScheme::default(),
            sni: String::new(),
            update_frequency: Self::default_update_frequency(),
        }
    }
}

impl Upstream {
    fn default_update_frequency() -> u64 {
        1
    }
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamScheme {
    #[default]
    HTTP,
    HTTPS,
}

/// The discovery backend and its ordered directive block.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Discovery::validate_provider"))]
pub struct Discovery {
    pub provider: String,
    #[serde(default)]
    pub options: Mapping,
}

impl Discovery {
    fn validate_provider(&self) -> Result<(), ValidationError> {
        if supported_providers().contains(&self.provider.as_str()) {
            Ok(())
        } else {
            let mut err = ValidationError::new("unknown_discovery_provider");
            err.add_param("provider".into(), &self.provider);
            Err(err)
        }
    }

    pub fn directives(&self) -> DiscoveryResult<Vec<Directive>> {
        directives_from_yaml(&self.options)
    }
}
