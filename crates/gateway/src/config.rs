//! Gateway configuration, read once from the environment.

use crate::codec::WireFormat;
use crate::engine::{
    ErrorReplyOnTimeout, SilentTimeout, TimeoutPolicy, DEFAULT_HEARTBEAT_TIMEOUT,
    DEFAULT_REQUEST_TIMEOUT,
};
use crate::error::{GatewayError, Result};
use crate::protocol::Route;
use serde::Serialize;
use std::net::UdpSocket;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const DEFAULT_BUS_ENDPOINTS: &str = "nats://localhost:4222";
const DEFAULT_SERVER_DOMAIN: &str = "microplatform.io";
const DEFAULT_LEGACY_DESTINATION: &str = "microservice://legacy";

/// Which [`TimeoutPolicy`] to apply to client requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicyKind {
    #[default]
    Silent,
    ErrorReply,
}

impl TimeoutPolicyKind {
    pub fn policy(self) -> Arc<dyn TimeoutPolicy> {
        match self {
            TimeoutPolicyKind::Silent => Arc::new(SilentTimeout),
            TimeoutPolicyKind::ErrorReply => Arc::new(ErrorReplyOnTimeout),
        }
    }
}

impl FromStr for TimeoutPolicyKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "silent" => Ok(TimeoutPolicyKind::Silent),
            "error_reply" | "error" => Ok(TimeoutPolicyKind::ErrorReply),
            other => Err(GatewayError::Config(format!("unknown timeout policy: {}", other))),
        }
    }
}

/// Listener descriptor advertised on `GET /server`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerDescriptor {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub client_args: ClientArgs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientArgs {
    pub upgrade: bool,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bus_endpoints: Vec<String>,
    pub external_ip: String,
    pub hostname: String,
    pub http_port: u16,
    pub https_port: u16,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
    pub client_upgrade: bool,
    pub request_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub metrics_port: u16,
    pub wire_format: WireFormat,
    pub legacy_destination: Route,
    pub server_domain: String,
    pub timeout_policy: TimeoutPolicyKind,
}

impl GatewayConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let bus_endpoints = split_endpoints(
            &get("BUS_ENDPOINTS").unwrap_or_else(|| DEFAULT_BUS_ENDPOINTS.to_string()),
        );
        if bus_endpoints.is_empty() {
            return Err(GatewayError::Config("BUS_ENDPOINTS is empty".to_string()));
        }

        let external_ip = match get("EXTERNAL_IP") {
            Some(ip) => ip.trim().to_string(),
            None => discover_external_ip()?,
        };
        let hostname = get("HOSTNAME").map_or_else(read_hostname, |h| h.trim().to_string());

        Ok(Self {
            bus_endpoints,
            external_ip,
            hostname,
            http_port: parse_or(&get, "PORT_HTTP", 80)?,
            https_port: parse_or(&get, "PORT_HTTPS", 443)?,
            ssl_cert: get("SSL_CERT"),
            ssl_key: get("SSL_KEY"),
            client_upgrade: get("CLIENT_UPGRADE").map_or(true, |v| parse_bool(&v)),
            request_timeout: parse_millis_or(&get, "REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT)?,
            heartbeat_timeout: parse_millis_or(
                &get,
                "HEARTBEAT_TIMEOUT_MS",
                DEFAULT_HEARTBEAT_TIMEOUT,
            )?,
            metrics_port: parse_or(&get, "METRICS_PORT", 9093)?,
            wire_format: get("WIRE_FORMAT").unwrap_or_default().parse()?,
            legacy_destination: Route::new(
                get("LEGACY_DESTINATION")
                    .unwrap_or_else(|| DEFAULT_LEGACY_DESTINATION.to_string()),
            ),
            server_domain: get("SERVER_DOMAIN")
                .unwrap_or_else(|| DEFAULT_SERVER_DOMAIN.to_string()),
            timeout_policy: get("TIMEOUT_POLICY").unwrap_or_default().parse()?,
        })
    }

    /// This gateway's bus identity and reply topic.
    pub fn router_uri(&self) -> String {
        format!("router-{}-{}", self.external_ip, self.hostname)
    }

    /// TLS material, when both halves are configured.
    pub fn tls_pems(&self) -> Option<(&str, &str)> {
        match (&self.ssl_cert, &self.ssl_key) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }

    /// Descriptor advertised by the plain (`secure == false`) or TLS listener.
    pub fn server_descriptor(&self, secure: bool) -> ServerDescriptor {
        let (protocol, port) = if secure {
            ("https", self.https_port)
        } else {
            ("http", self.http_port)
        };
        ServerDescriptor {
            protocol: protocol.to_string(),
            host: format!("{}.{}", self.external_ip.replace('.', "-"), self.server_domain),
            port,
            client_args: ClientArgs {
                upgrade: self.client_upgrade,
            },
        }
    }
}

fn split_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| GatewayError::Config(format!("{}={}: {}", key, raw, e))),
        None => Ok(default),
    }
}

fn parse_millis_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    let millis = parse_or(get, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

fn read_hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|h| h.trim().to_string())
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| {
            warn!("Hostname unknown, using 'localhost'");
            "localhost".to_string()
        })
}

/// Address of the interface used for outbound traffic. No packets are sent.
fn discover_external_ip() -> Result<String> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip().to_string())
}
