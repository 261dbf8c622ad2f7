//! Dynamic upstream discovery for a Pingora reverse proxy.
//!
//! A single provider (Nacos, Consul or mDNS) keeps an upstream snapshot
//! current; the proxy reads that snapshot on every balancer refresh.

pub mod config;
pub mod core;
pub mod discovery;
pub mod logging;
pub mod proxy;
