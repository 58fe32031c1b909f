use std::env;
use tracing::warn;

use crate::router::RelayPolicy;
use crate::signaling::BroadcastKind;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub ws_path: String,
    /// Broadcast kinds that are echoed back to their sender.
    pub include_sender: Vec<BroadcastKind>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a config from `lookup`, falling back to defaults for unset or
    /// invalid values. `RELAY_PORT` wins over `PORT` only when it parses.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let port = ["RELAY_PORT", "PORT"]
            .into_iter()
            .find_map(|name| lookup(name).and_then(|value| parse_port(name, &value)))
            .unwrap_or(defaults.port);
        let include_sender = lookup("RELAY_INCLUDE_SENDER")
            .map(|value| parse_broadcast_kinds(&value))
            .unwrap_or_default();

        Self {
            host: lookup("RELAY_HOST").unwrap_or(defaults.host),
            port,
            ws_path: lookup("RELAY_WS_PATH")
                .and_then(|value| parse_ws_path(&value))
                .unwrap_or(defaults.ws_path),
            include_sender,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn relay_policy(&self) -> RelayPolicy {
        RelayPolicy::new(self.include_sender.iter().copied())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            ws_path: "/ws".to_string(),
            include_sender: Vec::new(),
        }
    }
}

fn parse_port(name: &str, value: &str) -> Option<u16> {
    match value.trim().parse() {
        Ok(port) => Some(port),
        Err(e) => {
            warn!("Ignoring {}={:?}: {}", name, value, e);
            None
        }
    }
}

fn parse_ws_path(value: &str) -> Option<String> {
    if value.starts_with('/') {
        Some(value.to_string())
    } else {
        warn!("Ignoring RELAY_WS_PATH={:?}: path must start with '/'", value);
        None
    }
}

/// Parses a comma separated list of broadcast event names, skipping (and
/// logging) names that are not broadcast kinds.
pub fn parse_broadcast_kinds(value: &str) -> Vec<BroadcastKind> {
    let mut kinds = Vec::new();
    for name in value.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        match name.parse::<BroadcastKind>() {
            Ok(kind) if !kinds.contains(&kind) => kinds.push(kind),
            Ok(_) => {}
            Err(e) => warn!("Ignoring RELAY_INCLUDE_SENDER entry: {}", e),
        }
    }
    kinds
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test_timeout::timeout]
    fn port_falls_back_past_invalid_values() {
        assert_eq!(config_from(&[]).port, 3000);
        assert_eq!(config_from(&[("RELAY_PORT", "8080"), ("PORT", "9090")]).port, 8080);
        assert_eq!(config_from(&[("RELAY_PORT", "http"), ("PORT", "9090")]).port, 9090);
        assert_eq!(config_from(&[("RELAY_PORT", "70000"), ("PORT", "x")]).port, 3000);
    }

    #[test_timeout::timeout]
    fn ws_path_must_be_absolute() {
        assert_eq!(config_from(&[("RELAY_WS_PATH", "/signal")]).ws_path, "/signal");
        assert_eq!(config_from(&[("RELAY_WS_PATH", "signal")]).ws_path, "/ws");
        assert_eq!(config_from(&[("RELAY_HOST", "127.0.0.1")]).bind_addr(), "127.0.0.1:3000");
    }

    #[test_timeout::timeout]
    fn parses_include_sender_list() {
        assert_eq!(
            parse_broadcast_kinds(" move, camera-frame,,move ,bogus"),
            vec![BroadcastKind::Move, BroadcastKind::CameraFrame]
        );
        assert!(parse_broadcast_kinds("").is_empty());
    }

    #[test_timeout::timeout]
    fn default_policy_excludes_sender_everywhere() {
        let policy = Config::default().relay_policy();
        for kind in BroadcastKind::ALL {
            assert!(!policy.includes_sender(kind));
        }
        assert_eq!(Config::default().bind_addr(), "0.0.0.0:3000");
    }
}
