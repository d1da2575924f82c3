use std::net::SocketAddr;
use std::num::NonZeroU32;

use envconfig::Envconfig;

/// One rotation slot: a logical service replica and the pair of container
/// names it alternates between. Exactly one of the pair is active at any
/// time; the other is the standby candidate for the next cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationSlot {
    pub service: String,
    pub names: [String; 2],
}

/// `service:nameA|nameB;service:nameA|nameB`, e.g. `web:web1|web2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationSlots(pub Vec<RotationSlot>);

impl std::str::FromStr for RotationSlots {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut slots = Vec::new();
        for part in s.split(';').filter(|p| !p.trim().is_empty()) {
            let (service, names) = part
                .split_once(':')
                .ok_or_else(|| format!("rotation slot missing ':' separator: {part}"))?;
            let (a, b) = names
                .split_once('|')
                .ok_or_else(|| format!("rotation slot needs two names split by '|': {part}"))?;
            let (service, a, b) = (service.trim(), a.trim(), b.trim());
            if service.is_empty() || a.is_empty() || b.is_empty() || a == b {
                return Err(format!("invalid rotation slot: {part}"));
            }
            slots.push(RotationSlot {
                service: service.to_string(),
                names: [a.to_string(), b.to_string()],
            });
        }
        if slots.is_empty() {
            return Err("at least one rotation slot is required".to_string());
        }
        Ok(RotationSlots(slots))
    }
}

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3120")]
    pub address: SocketAddr,

    /// Lifecycle broker endpoint and credential. Required: the controller
    /// has no other path to the container runtime.
    pub broker_url: String,
    pub broker_token: String,

    #[envconfig(default = "10")]
    pub broker_timeout_secs: u64,

    /// `service:nameA|nameB;...`, see [`RotationSlots`]. Required.
    pub rotation_slots: RotationSlots,

    #[envconfig(default = "300")]
    pub rotation_interval_secs: u64,

    /// Port every managed container serves on; backends are addressed as
    /// `name:port` on the container network.
    #[envconfig(default = "8080")]
    pub backend_port: u16,

    #[envconfig(default = "/health")]
    pub health_path: String,

    #[envconfig(default = "2")]
    pub probe_interval_secs: u64,

    #[envconfig(default = "30")]
    pub probe_timeout_secs: u64,

    /// Consecutive failing HTTP responses before a standby is declared
    /// unhealthy ahead of the probe deadline.
    #[envconfig(default = "3")]
    pub probe_failure_threshold: u32,

    #[envconfig(default = "15")]
    pub drain_grace_secs: u64,

    /// Pre-stop flush hook on the outgoing container; unset skips the hook.
    pub flush_path: Option<String>,

    #[envconfig(default = "120")]
    pub flush_timeout_secs: u64,

    #[envconfig(default = "/etc/nginx/conf.d/rotor-upstreams.conf")]
    pub upstream_file: String,

    /// Shell command that makes the reverse proxy pick up the new upstream
    /// file; empty skips the reload (useful in development).
    #[envconfig(default = "")]
    pub proxy_reload_command: String,

    #[envconfig(default = "10")]
    pub proxy_reload_timeout_secs: u64,

    #[envconfig(default = "30")]
    pub shutdown_grace_secs: u64,

    #[envconfig(default = "65536")]
    pub report_max_bytes: usize,

    #[envconfig(default = "30")]
    pub reports_per_minute: NonZeroU32,

    #[envconfig(default = "256")]
    pub audit_recent_capacity: usize,

    // Used for integration tests
    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}

#[cfg(test)]
mod tests {
    use super::RotationSlots;

    #[test]
    fn parses_multiple_slots() {
        let slots: RotationSlots = "web:web1|web2;api:api1|api2".parse().unwrap();
        assert_eq!(slots.0.len(), 2);
        assert_eq!(slots.0[0].service, "web");
        assert_eq!(slots.0[0].names, ["web1".to_string(), "web2".to_string()]);
    }

    #[test]
    fn rejects_malformed_slots() {
        assert!("".parse::<RotationSlots>().is_err());
        assert!("web".parse::<RotationSlots>().is_err());
        assert!("web:web1".parse::<RotationSlots>().is_err());
        assert!("web:web1|web1".parse::<RotationSlots>().is_err());
        assert!(":web1|web2".parse::<RotationSlots>().is_err());
    }
}
