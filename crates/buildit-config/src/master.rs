//! Master configuration parsing.
//!
//! The master reads a single KDL document:
//!
//! ```kdl
//! listen "0.0.0.0:3330"
//! tls cert="/etc/buildit/master.pem" key="/etc/buildit/master.key" ca="/etc/buildit/ca.pem"
//! heartbeat interval-ms=5000 miss-threshold=3 disconnect-grace-ms=30000
//! dispatch ack-timeout-ms=10000 max-build-secs=3600 max-retries=2
//! queue max-depth=1000
//! ```
//!
//! Every node is optional; omitted values keep their defaults.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete master configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Address the worker channel listens on.
    pub listen: SocketAddr,
    pub tls: TlsPaths,
    pub heartbeat: HeartbeatConfig,
    pub dispatch: DispatchConfig,
    pub queue: QueueConfig,
    pub channel: ChannelConfig,
    /// Finished sessions kept for status queries after eviction.
    pub history_limit: usize,
}

/// Certificate material locations. All three are required to start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsPaths {
    /// PEM certificate chain presented to workers.
    pub cert: Option<PathBuf>,
    /// PEM private key for `cert`.
    pub key: Option<PathBuf>,
    /// PEM bundle of CAs trusted to sign worker certificates.
    pub ca: Option<PathBuf>,
}

impl TlsPaths {
    /// Return all three paths or name the first one missing.
    pub fn require(&self) -> ConfigResult<(&Path, &Path, &Path)> {
        let cert = self
            .cert
            .as_deref()
            .ok_or_else(|| ConfigError::MissingField("tls cert".to_string()))?;
        let key = self
            .key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingField("tls key".to_string()))?;
        let ca = self
            .ca
            .as_deref()
            .ok_or_else(|| ConfigError::MissingField("tls ca".to_string()))?;
        Ok((cert, key, ca))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Expected interval between worker heartbeats.
    pub interval: Duration,
    /// Consecutive missed heartbeats before a worker is disconnected.
    pub miss_threshold: u32,
    /// How long a disconnected worker stays visible before removal.
    pub disconnect_grace: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            miss_threshold: 3,
            disconnect_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Time a worker has to acknowledge a dispatch.
    pub ack_timeout: Duration,
    /// Maximum wall time of a build, measured from dispatch.
    pub max_build_duration: Duration,
    /// Time a worker has to report after a timeout kill.
    pub termination_grace: Duration,
    /// Time a worker has to confirm a cancellation.
    pub cancel_grace: Duration,
    /// Requeues allowed after lost workers, ack timeouts and rejections.
    pub max_retries: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
            max_build_duration: Duration::from_secs(3600),
            termination_grace: Duration::from_secs(15),
            cancel_grace: Duration::from_secs(30),
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Admissions beyond this depth are rejected with backpressure.
    pub max_depth: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_depth: 1000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Bound on TLS handshake plus registration.
    pub handshake_timeout: Duration,
    /// Outbound messages buffered per worker connection.
    pub send_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            send_buffer: 256,
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3330)),
            tls: TlsPaths::default(),
            heartbeat: HeartbeatConfig::default(),
            dispatch: DispatchConfig::default(),
            queue: QueueConfig::default(),
            channel: ChannelConfig::default(),
            history_limit: 256,
        }
    }
}

impl MasterConfig {
    /// Check limits that would make the coordinator misbehave.
    pub fn validate(&self) -> ConfigResult<()> {
        non_zero_duration("heartbeat interval-ms", self.heartbeat.interval)?;
        non_zero_duration("dispatch ack-timeout-ms", self.dispatch.ack_timeout)?;
        non_zero_duration("dispatch max-build-secs", self.dispatch.max_build_duration)?;
        non_zero_duration("channel handshake-timeout-ms", self.channel.handshake_timeout)?;
        if self.heartbeat.miss_threshold == 0 {
            return Err(invalid("heartbeat miss-threshold", "must be at least 1"));
        }
        if self.queue.max_depth == 0 {
            return Err(invalid("queue max-depth", "must be at least 1"));
        }
        if self.channel.send_buffer == 0 {
            return Err(invalid("channel send-buffer", "must be at least 1"));
        }
        Ok(())
    }
}

/// Read and parse a configuration file.
pub fn load_master_config(path: &Path) -> ConfigResult<MasterConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_master_config(&content)
}

/// Parse master configuration from KDL text, starting from defaults.
pub fn parse_master_config(kdl: &str) -> ConfigResult<MasterConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = MasterConfig::default();
    let mut seen = HashSet::new();

    for node in doc.nodes() {
        let name = node.name().value();
        if !seen.insert(name.to_string()) {
            return Err(ConfigError::Duplicate(name.to_string()));
        }

        match name {
            "listen" => {
                let addr = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("listen address".to_string()))?;
                config.listen = addr
                    .parse()
                    .map_err(|e| invalid("listen", &format!("{addr}: {e}")))?;
            }
            "tls" => {
                config.tls = TlsPaths {
                    cert: get_string_prop(node, "cert").map(PathBuf::from),
                    key: get_string_prop(node, "key").map(PathBuf::from),
                    ca: get_string_prop(node, "ca").map(PathBuf::from),
                };
            }
            "heartbeat" => {
                let hb = &mut config.heartbeat;
                if let Some(ms) = get_u64_prop(node, "interval-ms")? {
                    hb.interval = Duration::from_millis(ms);
                }
                if let Some(n) = get_u32_prop(node, "miss-threshold")? {
                    hb.miss_threshold = n;
                }
                if let Some(ms) = get_u64_prop(node, "disconnect-grace-ms")? {
                    hb.disconnect_grace = Duration::from_millis(ms);
                }
            }
            "dispatch" => {
                let d = &mut config.dispatch;
                if let Some(ms) = get_u64_prop(node, "ack-timeout-ms")? {
                    d.ack_timeout = Duration::from_millis(ms);
                }
                if let Some(secs) = get_u64_prop(node, "max-build-secs")? {
                    d.max_build_duration = Duration::from_secs(secs);
                }
                if let Some(ms) = get_u64_prop(node, "termination-grace-ms")? {
                    d.termination_grace = Duration::from_millis(ms);
                }
                if let Some(ms) = get_u64_prop(node, "cancel-grace-ms")? {
                    d.cancel_grace = Duration::from_millis(ms);
                }
                if let Some(n) = get_u32_prop(node, "max-retries")? {
                    d.max_retries = n;
                }
            }
            "queue" => {
                if let Some(n) = get_u64_prop(node, "max-depth")? {
                    config.queue.max_depth = to_usize("queue max-depth", n)?;
                }
            }
            "channel" => {
                if let Some(ms) = get_u64_prop(node, "handshake-timeout-ms")? {
                    config.channel.handshake_timeout = Duration::from_millis(ms);
                }
                if let Some(n) = get_u64_prop(node, "send-buffer")? {
                    config.channel.send_buffer = to_usize("channel send-buffer", n)?;
                }
            }
            "history" => {
                if let Some(n) = get_u64_prop(node, "limit")? {
                    config.history_limit = to_usize("history limit", n)?;
                }
            }
            other => return Err(ConfigError::UnknownNode(other.to_string())),
        }
    }

    config.validate()?;
    Ok(config)
}

/// Render the default configuration as KDL, for `init-config`.
pub fn default_config_kdl() -> String {
    let c = MasterConfig::default();
    format!(
        r#"// BuildIt master configuration.

listen "{listen}"

// Certificate, key and trusted worker CA (all PEM). Required.
tls cert="/etc/buildit/master.pem" key="/etc/buildit/master.key" ca="/etc/buildit/ca.pem"

heartbeat interval-ms={hb_interval} miss-threshold={hb_miss} disconnect-grace-ms={hb_grace}

dispatch ack-timeout-ms={ack} max-build-secs={max_build} termination-grace-ms={term} cancel-grace-ms={cancel} max-retries={retries}

queue max-depth={depth}

channel handshake-timeout-ms={handshake} send-buffer={send_buffer}

history limit={history}
"#,
        listen = c.listen,
        hb_interval = c.heartbeat.interval.as_millis(),
        hb_miss = c.heartbeat.miss_threshold,
        hb_grace = c.heartbeat.disconnect_grace.as_millis(),
        ack = c.dispatch.ack_timeout.as_millis(),
        max_build = c.dispatch.max_build_duration.as_secs(),
        term = c.dispatch.termination_grace.as_millis(),
        cancel = c.dispatch.cancel_grace.as_millis(),
        retries = c.dispatch.max_retries,
        depth = c.queue.max_depth,
        handshake = c.channel.handshake_timeout.as_millis(),
        send_buffer = c.channel.send_buffer,
        history = c.history_limit,
    )
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    let field = format!("{} {}", node.name().value(), name);
    match node.get(name) {
        None => Ok(None),
        Some(value) => {
            let n = value
                .as_integer()
                .ok_or_else(|| invalid(&field, "expected an integer"))?;
            u64::try_from(n)
                .map(Some)
                .map_err(|_| invalid(&field, "must be a non-negative integer"))
        }
    }
}

fn get_u32_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u32>> {
    let field = format!("{} {}", node.name().value(), name);
    get_u64_prop(node, name)?
        .map(|n| u32::try_from(n).map_err(|_| invalid(&field, "value too large")))
        .transpose()
}

fn to_usize(field: &str, n: u64) -> ConfigResult<usize> {
    usize::try_from(n).map_err(|_| invalid(field, "value too large"))
}

fn non_zero_duration(field: &str, d: Duration) -> ConfigResult<()> {
    if d.is_zero() {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(())
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            listen "127.0.0.1:4000"
            tls cert="/certs/master.pem" key="/certs/master.key" ca="/certs/ca.pem"
            heartbeat interval-ms=2000 miss-threshold=5 disconnect-grace-ms=60000
            dispatch ack-timeout-ms=3000 max-build-secs=900 max-retries=4
            queue max-depth=50
        "#;

        let config = parse_master_config(kdl).unwrap();
        assert_eq!(config.listen, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(config.tls.cert, Some(PathBuf::from("/certs/master.pem")));
        assert_eq!(config.heartbeat.interval, Duration::from_secs(2));
        assert_eq!(config.heartbeat.miss_threshold, 5);
        assert_eq!(config.dispatch.ack_timeout, Duration::from_secs(3));
        assert_eq!(config.dispatch.max_build_duration, Duration::from_secs(900));
        assert_eq!(config.dispatch.max_retries, 4);
        assert_eq!(config.queue.max_depth, 50);
        // Untouched values keep their defaults
        assert_eq!(config.dispatch.cancel_grace, Duration::from_secs(30));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_master_config("").unwrap();
        assert_eq!(config, MasterConfig::default());
        assert!(config.tls.require().is_err());
    }

    #[test]
    fn test_default_config_round_trips() {
        let config = parse_master_config(&default_config_kdl()).unwrap();
        assert_eq!(config.heartbeat, HeartbeatConfig::default());
        assert_eq!(config.dispatch, DispatchConfig::default());
        assert!(config.tls.require().is_ok());
    }

    #[test]
    fn test_partial_tls_is_reported() {
        let config = parse_master_config(r#"tls cert="/c.pem" ca="/ca.pem""#).unwrap();
        let err = config.tls.require().unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(ref f) if f == "tls key"));
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let result = parse_master_config("heartbeat miss-threshold=0");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_rejects_negative_values() {
        let result = parse_master_config("queue max-depth=-1");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_rejects_duplicate_and_unknown_nodes() {
        let dup = parse_master_config("queue max-depth=1\nqueue max-depth=2");
        assert!(matches!(dup, Err(ConfigError::Duplicate(_))));

        let unknown = parse_master_config("workers count=3");
        assert!(matches!(unknown, Err(ConfigError::UnknownNode(_))));
    }

    #[test]
    fn test_rejects_bad_listen_address() {
        let result = parse_master_config(r#"listen "not-an-address""#);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
