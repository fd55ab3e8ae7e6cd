use crate::reputation::ReputationConfig;
use clap::Parser;
use peerwire_common::frame::DEFAULT_MAX_FRAME_SIZE;
use rand::rngs::OsRng;
use rand::RngCore;
use std::net::SocketAddr;
use std::time::Duration;

/// CLI arguments for a peerwire node.
#[derive(Parser, Debug, Clone)]
#[command(name = "peerwire")]
#[command(about = "peerwire P2P node")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:30400", env = "PEERWIRE_LISTEN")]
    pub listen: SocketAddr,
    /// Identity announced in HELLO. A random id is generated when omitted.
    #[arg(long, env = "PEERWIRE_NODE_ID")]
    pub node_id: Option<String>,
    /// Peer endpoint (`host:port`) to dial at startup. Repeatable.
    #[arg(long = "peer", env = "PEERWIRE_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,
    /// Handshake plus HELLO deadline in seconds.
    #[arg(long, default_value = "10", env = "PEERWIRE_CONNECT_TIMEOUT")]
    pub connect_timeout: u64,
    /// Read-idle period before a keepalive PING, in seconds.
    #[arg(long, default_value = "15", env = "PEERWIRE_IDLE_TIMEOUT")]
    pub idle_timeout: u64,
    /// How long a pending outbound connect is shared, in seconds.
    #[arg(long, default_value = "30", env = "PEERWIRE_PENDING_CONNECT_TTL")]
    pub pending_connect_ttl: u64,
    /// Delay between sending DISCONNECT and closing, in milliseconds.
    #[arg(long, default_value = "2000", env = "PEERWIRE_DISCONNECT_GRACE_MS")]
    pub disconnect_grace_ms: u64,
    /// Largest accepted frame in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_SIZE, env = "PEERWIRE_MAX_FRAME_SIZE")]
    pub max_frame_size: usize,
    /// Socket address for the metrics endpoint. Disabled when omitted.
    #[arg(long, env = "PEERWIRE_METRICS")]
    pub metrics_addr: Option<SocketAddr>,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Identity announced in HELLO.
    pub node_id: String,
    /// Endpoints dialed at startup.
    pub peers: Vec<String>,
    /// Handshake plus HELLO deadline in seconds.
    pub connect_timeout: u64,
    /// Read-idle period in seconds.
    pub idle_timeout: u64,
    /// Pending outbound connect TTL in seconds.
    pub pending_connect_ttl: u64,
    /// DISCONNECT-to-close delay in milliseconds.
    pub disconnect_grace_ms: u64,
    /// Largest accepted frame in bytes.
    pub max_frame_size: usize,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: Option<SocketAddr>,
    /// Peer scoring policy.
    pub reputation: ReputationConfig,
}

impl NodeConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.node_id.is_empty() {
            return Err("node_id must not be empty".to_string());
        }
        if self.node_id.len() > 256 {
            return Err("node_id exceeds reasonable length (256 bytes)".to_string());
        }

        if self.connect_timeout == 0 {
            return Err("connect_timeout must be greater than 0".to_string());
        }
        if self.connect_timeout > 300 {
            return Err("connect_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.idle_timeout == 0 {
            return Err("idle_timeout must be greater than 0".to_string());
        }
        if self.idle_timeout > 86_400 {
            return Err(
                "idle_timeout exceeds reasonable limit (86400 seconds / 1 day)".to_string(),
            );
        }

        if self.pending_connect_ttl == 0 {
            return Err("pending_connect_ttl must be greater than 0".to_string());
        }
        if self.pending_connect_ttl > 3600 {
            return Err("pending_connect_ttl exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.disconnect_grace_ms > 60_000 {
            return Err("disconnect_grace_ms exceeds reasonable limit (60000 ms)".to_string());
        }

        // Must fit the i32 length field with room for the fixed overhead.
        const MAX_ALLOWED_FRAME: usize = i32::MAX as usize;
        if self.max_frame_size < peerwire_common::frame::FRAME_OVERHEAD {
            return Err("max_frame_size is smaller than the frame header".to_string());
        }
        if self.max_frame_size > MAX_ALLOWED_FRAME {
            return Err(format!(
                "max_frame_size exceeds maximum allowed ({} bytes)",
                MAX_ALLOWED_FRAME
            ));
        }

        if self.peers.iter().any(|p| p.parse::<SocketAddr>().is_err() && !p.contains(':')) {
            return Err("peers must be host:port endpoints".to_string());
        }

        self.reputation
            .validate()
            .map_err(|e| format!("reputation: {e}"))
    }

    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Idle timeout as a [`Duration`].
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    /// Pending connect TTL as a [`Duration`].
    #[must_use]
    pub const fn pending_connect_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_connect_ttl)
    }

    /// Disconnect grace as a [`Duration`].
    #[must_use]
    pub const fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 30400)),
            node_id: random_node_id(),
            peers: Vec::new(),
            connect_timeout: 10,
            idle_timeout: 15,
            pending_connect_ttl: 30,
            disconnect_grace_ms: 2000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            metrics_addr: None,
            reputation: ReputationConfig::default(),
        }
    }
}

impl From<Args> for NodeConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            node_id: args.node_id.unwrap_or_else(random_node_id),
            peers: args.peers,
            connect_timeout: args.connect_timeout,
            idle_timeout: args.idle_timeout,
            pending_connect_ttl: args.pending_connect_ttl,
            disconnect_grace_ms: args.disconnect_grace_ms,
            max_frame_size: args.max_frame_size,
            metrics_addr: args.metrics_addr,
            reputation: ReputationConfig::default(),
        }
    }
}

/// 16 random bytes, hex encoded.
#[must_use]
pub fn random_node_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> NodeConfig {
        NodeConfig {
            listen: "127.0.0.1:30400".parse().unwrap(),
            node_id: "node-a".into(),
            ..NodeConfig::default()
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn default_node_id_is_random_hex() {
        let a = NodeConfig::default().node_id;
        let b = NodeConfig::default().node_id;
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn empty_node_id() {
        let mut c = valid_config();
        c.node_id = String::new();
        assert!(c.validate().unwrap_err().contains("node_id"));
    }

    #[test]
    fn connect_timeout_zero() {
        let mut c = valid_config();
        c.connect_timeout = 0;
        assert!(c.validate().unwrap_err().contains("connect_timeout"));
    }

    #[test]
    fn idle_timeout_too_large() {
        let mut c = valid_config();
        c.idle_timeout = 86_401;
        assert!(c.validate().unwrap_err().contains("idle_timeout"));
    }

    #[test]
    fn pending_connect_ttl_zero() {
        let mut c = valid_config();
        c.pending_connect_ttl = 0;
        assert!(c.validate().unwrap_err().contains("pending_connect_ttl"));
    }

    #[test]
    fn disconnect_grace_too_large() {
        let mut c = valid_config();
        c.disconnect_grace_ms = 60_001;
        assert!(c.validate().unwrap_err().contains("disconnect_grace_ms"));
    }

    #[test]
    fn max_frame_size_below_header() {
        let mut c = valid_config();
        c.max_frame_size = 4;
        assert!(c.validate().unwrap_err().contains("max_frame_size"));
    }

    #[test]
    fn malformed_peer_endpoint() {
        let mut c = valid_config();
        c.peers = vec!["not-an-endpoint".into()];
        assert!(c.validate().unwrap_err().contains("peers"));
    }

    #[test]
    fn hostname_peer_endpoint_is_accepted() {
        let mut c = valid_config();
        c.peers = vec!["seed.example.org:30400".into(), "10.0.0.2:30400".into()];
        assert!(c.validate().is_ok());
    }

    #[test]
    fn args_parse_with_defaults() {
        let args = Args::parse_from(["peerwire", "--node-id", "n1", "--peer", "127.0.0.1:1"]);
        let config = NodeConfig::from(args);
        assert_eq!(config.node_id, "n1");
        assert_eq!(config.peers, vec!["127.0.0.1:1".to_string()]);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.idle_timeout(), Duration::from_secs(15));
        assert_eq!(config.pending_connect_ttl(), Duration::from_secs(30));
        assert_eq!(config.disconnect_grace(), Duration::from_millis(2000));
        assert!(config.validate().is_ok());
    }
}
