use std::net::SocketAddr;

use envconfig::Envconfig;

use crate::allowlist::Allowlist;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3130")]
    pub address: SocketAddr,

    /// Shared secret required on every call. No default: the broker will
    /// not start without one.
    pub broker_token: String,

    /// `pattern:op,op;pattern:op`, see [`Allowlist`]. No default either.
    pub broker_allowlist: Allowlist,

    #[envconfig(default = "http://127.0.0.1:2375")]
    pub runtime_url: String,

    #[envconfig(default = "10")]
    pub runtime_timeout_secs: u64,

    /// Grace the runtime gives a container between SIGTERM and SIGKILL.
    #[envconfig(default = "10")]
    pub stop_grace_secs: u64,

    #[envconfig(default = "3")]
    pub inspect_cache_ttl_secs: u64,

    #[envconfig(default = "1024")]
    pub inspect_cache_capacity: u64,

    #[envconfig(default = "128")]
    pub audit_recent_capacity: usize,

    // Used for integration tests
    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}
