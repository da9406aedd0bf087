use crate::model::Destination;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the orchestration engine
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Shared reverse proxy and its Data Plane API
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Local working directories and tools
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Destination engines keyed by id
    #[serde(default)]
    pub destinations: BTreeMap<String, Destination>,
}

/// What to do with an open transaction when a configuration step fails
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Delete the transaction, leaving the proxy untouched
    #[default]
    Discard,
    /// Commit whatever was applied before the failure
    Commit,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Data Plane API base URL (default: http://berth-haproxy:5555)
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_api_user")]
    pub user: String,

    #[serde(default = "default_api_password")]
    pub password: String,

    /// Proxy container name
    #[serde(default = "default_container_name")]
    pub container_name: String,

    /// Proxy image, must ship the Data Plane API
    #[serde(default = "default_proxy_image")]
    pub image: String,

    /// Infrastructure network the proxy container starts on
    #[serde(default = "default_infra_network")]
    pub network: String,

    /// Volume holding TLS certificates
    #[serde(default = "default_certs_volume")]
    pub certs_volume: String,

    /// Name of the HTTP frontend that carries redirect rules
    #[serde(default = "default_http_frontend")]
    pub http_frontend: String,

    /// Host port range published for TCP database routing (e.g. "60000-60100")
    #[serde(default = "default_tcp_port_range")]
    pub tcp_port_range: String,

    /// Per-request timeout for Data Plane API calls (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Terminal action for transactions whose configuration step failed
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Public domain of the control plane itself, routed with forced TLS
    pub control_plane_domain: Option<String>,

    #[serde(default = "default_control_plane_address")]
    pub control_plane_address: String,

    #[serde(default = "default_control_plane_port")]
    pub control_plane_port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            user: default_api_user(),
            password: default_api_password(),
            container_name: default_container_name(),
            image: default_proxy_image(),
            network: default_infra_network(),
            certs_volume: default_certs_volume(),
            http_frontend: default_http_frontend(),
            tcp_port_range: default_tcp_port_range(),
            request_timeout_secs: default_request_timeout(),
            failure_policy: FailurePolicy::default(),
            control_plane_domain: None,
            control_plane_address: default_control_plane_address(),
            control_plane_port: default_control_plane_port(),
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Inclusive bounds of the TCP port range
    pub fn tcp_ports(&self) -> Option<(u16, u16)> {
        let (start, end) = self.tcp_port_range.split_once('-')?;
        let start: u16 = start.trim().parse().ok()?;
        let end: u16 = end.trim().parse().ok()?;
        (start <= end).then_some((start, end))
    }

    /// Append every problem with the proxy section to `errors`
    pub fn validate(&self, errors: &mut Vec<String>) {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            errors.push(format!(
                "proxy: 'api_url' must be an http(s) URL, got '{}'",
                self.api_url
            ));
        }
        if self.tcp_ports().is_none() {
            errors.push(format!(
                "proxy: 'tcp_port_range' must look like '60000-60100', got '{}'",
                self.tcp_port_range
            ));
        }
        if self.request_timeout_secs == 0 {
            errors.push("proxy: 'request_timeout_secs' must be greater than 0".to_string());
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    /// Root of the per-build working directories
    #[serde(default = "default_build_root")]
    pub build_root: PathBuf,

    /// Path to the docker CLI binary
    #[serde(default = "default_docker_path")]
    pub docker_path: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            build_root: default_build_root(),
            docker_path: default_docker_path(),
        }
    }
}

impl WorkspaceConfig {
    /// Working directory of one build
    pub fn build_dir(&self, build_id: &str) -> PathBuf {
        self.build_root.join(build_id)
    }
}

fn default_api_url() -> String {
    "http://berth-haproxy:5555".to_string()
}

fn default_api_user() -> String {
    "haproxy-dataplaneapi".to_string()
}

fn default_api_password() -> String {
    "adminpwd".to_string()
}

fn default_container_name() -> String {
    "berth-haproxy".to_string()
}

fn default_proxy_image() -> String {
    "haproxytech/haproxy-alpine:2.6".to_string()
}

fn default_infra_network() -> String {
    "berth-infra".to_string()
}

fn default_certs_volume() -> String {
    "berth-ssl-certs".to_string()
}

fn default_http_frontend() -> String {
    "http".to_string()
}

fn default_tcp_port_range() -> String {
    "60000-60100".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_control_plane_address() -> String {
    "berth".to_string()
}

fn default_control_plane_port() -> u16 {
    3000
}

fn default_build_root() -> PathBuf {
    std::env::temp_dir().join("berth").join("builds")
}

fn default_docker_path() -> String {
    "docker".to_string()
}

fn validate_destination(id: &str, destination: &Destination, errors: &mut Vec<String>) {
    let engine = destination.engine.as_str();
    if !(engine.is_empty()
        || engine.starts_with("unix://")
        || engine.starts_with("tcp://")
        || engine.starts_with("http://"))
    {
        errors.push(format!(
            "Destination '{}': 'engine' must be 'unix:///path' or 'tcp://host:port', got '{}'",
            id, engine
        ));
    }
    if destination.network.trim().is_empty() {
        errors.push(format!("Destination '{}': 'network' is required", id));
    }
    if let Some(subnet) = &destination.subnet {
        if !subnet.contains('/') {
            errors.push(format!(
                "Destination '{}': 'subnet' must be in CIDR form, got '{}'",
                id, subnet
            ));
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse TOML, fill destination ids from their keys and validate
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        for (id, destination) in config.destinations.iter_mut() {
            destination.id = id.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        self.proxy.validate(&mut errors);
        for (id, destination) in &self.destinations {
            validate_destination(id, destination, &mut errors);
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn destination(&self, id: &str) -> Option<&Destination> {
        self.destinations.get(id)
    }

    /// Networks of the destinations sharing the engine of `destination`, deduplicated
    pub fn destination_networks(&self, destination: &Destination) -> Vec<String> {
        let mut networks: Vec<String> = self
            .destinations
            .values()
            .filter(|d| d.docker_host() == destination.docker_host())
            .map(|d| d.network.clone())
            .collect();
        networks.sort();
        networks.dedup();
        networks
    }
}
