//! Container engine access for destinations
//!
//! Two halves:
//! - [`DockerEngine`] talks to the Docker API through bollard and implements
//!   [`BuildEngine`], sending the build directory as a gzip tar context
//! - [`DockerCli`] runs the docker CLI against a destination (via
//!   `DOCKER_HOST`) and implements [`DestinationRuntime`] for volumes, compose
//!   and the shared proxy container

use crate::builder::{BuildEngine, BuildEvent, BuildRequest};
use crate::config::ProxyConfig;
use crate::deploy::DestinationRuntime;
use crate::error::{DeployError, Result};
use crate::model::Destination;
use async_trait::async_trait;
use bollard::image::BuildImageOptions;
use bollard::Docker;
use bytes::{BufMut, Bytes, BytesMut};
use flate2::{write::GzEncoder, Compression};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Docker API client used for image builds
#[derive(Clone)]
pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Connect to the engine of a destination and verify it answers
    pub async fn connect(destination: &Destination) -> Result<Self> {
        let client = match destination.docker_host() {
            Some(host) => Self::connect_to_host(host)?,
            None => Docker::connect_with_socket_defaults()?,
        };

        client.ping().await?;

        debug!(destination = %destination.id, "Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Ok(Docker::connect_with_socket(
                socket_path,
                120,
                bollard::API_DEFAULT_VERSION,
            )?)
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Ok(Docker::connect_with_http(
                host,
                120,
                bollard::API_DEFAULT_VERSION,
            )?)
        } else {
            Err(DeployError::Configuration(format!(
                "Invalid engine endpoint: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )))
        }
    }
}

/// Pack a directory into a gzip tar build context
fn pack_context(dir: &Path) -> std::io::Result<Bytes> {
    let tar_gz = BytesMut::new().writer();
    let enc = GzEncoder::new(tar_gz, Compression::default());
    let mut tar = tar::Builder::new(enc);
    tar.append_dir_all(".", dir)?;

    let tar_gz = tar.into_inner()?.finish()?;
    Ok(tar_gz.into_inner().freeze())
}

#[async_trait]
impl BuildEngine for DockerEngine {
    async fn build_image(
        &self,
        request: BuildRequest,
    ) -> Result<BoxStream<'static, Result<BuildEvent>>> {
        let context_dir = request.context_dir.clone();
        let context = tokio::task::spawn_blocking(move || pack_context(&context_dir))
            .await
            .map_err(|e| DeployError::Build(format!("failed to pack build context: {}", e)))??;

        info!(
            image = %request.tag,
            dockerfile = %request.dockerfile,
            context_bytes = context.len(),
            "Sending build context to engine"
        );

        let docker = self.client.clone();
        let (tx, rx) = futures::channel::mpsc::unbounded();

        tokio::spawn(async move {
            let options = BuildImageOptions {
                dockerfile: request.dockerfile,
                t: request.tag,
                rm: true,
                ..Default::default()
            };
            let mut stream = docker.build_image(options, None, Some(context));

            while let Some(item) = stream.next().await {
                let event = item.map_err(DeployError::from).map(|info| BuildEvent {
                    stream: info.stream,
                    error: info
                        .error
                        .or_else(|| info.error_detail.and_then(|d| d.message)),
                });
                let stop = event.is_err();
                if tx.unbounded_send(event).is_err() || stop {
                    break;
                }
            }
        });

        Ok(rx.boxed())
    }
}

/// Runs the docker CLI against destination engines
#[derive(Debug, Clone)]
pub struct DockerCli {
    docker_path: String,
    proxy: ProxyConfig,
}

impl DockerCli {
    pub fn new(docker_path: &str, proxy: ProxyConfig) -> Self {
        Self {
            docker_path: docker_path.to_string(),
            proxy,
        }
    }

    async fn run(&self, destination: &Destination, args: &[String]) -> Result<Output> {
        let mut cmd = Command::new(&self.docker_path);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(host) = destination.docker_host() {
            cmd.env("DOCKER_HOST", host);
        }

        debug!(destination = %destination.id, "Running: {:?}", cmd);
        let output = cmd.output().await?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!(target: "docker", "{}", line);
        }
        Ok(output)
    }
}

fn stderr_of(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("exit status {}", output.status.code().unwrap_or(-1))
    } else {
        stderr
    }
}

fn volume_create_args(name: &str) -> Vec<String> {
    vec!["volume".into(), "create".into(), name.into()]
}

fn compose_up_args(compose_file: &Path) -> Vec<String> {
    vec![
        "compose".into(),
        "-f".into(),
        compose_file.display().to_string(),
        "up".into(),
        "-d".into(),
    ]
}

fn proxy_inspect_args(proxy: &ProxyConfig) -> Vec<String> {
    vec![
        "container".into(),
        "inspect".into(),
        "--format".into(),
        "{{.State.Running}}".into(),
        proxy.container_name.clone(),
    ]
}

fn proxy_run_args(proxy: &ProxyConfig) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "--restart".into(),
        "always".into(),
        "--add-host".into(),
        "host.docker.internal:host-gateway".into(),
        "-v".into(),
        format!("{}:/usr/local/etc/haproxy/ssl", proxy.certs_volume),
        "--network".into(),
        proxy.network.clone(),
    ];
    for port in ["80:80", "443:443", "8404:8404", "5555:5555"] {
        args.push("-p".into());
        args.push(port.into());
    }
    args.push("-p".into());
    args.push(format!("{0}:{0}", proxy.tcp_port_range));
    args.extend([
        "--name".into(),
        proxy.container_name.clone(),
        "-d".into(),
        proxy.image.clone(),
    ]);
    args
}

fn network_connect_args(network: &str, container: &str) -> Vec<String> {
    vec![
        "network".into(),
        "connect".into(),
        network.into(),
        container.into(),
    ]
}

#[async_trait]
impl DestinationRuntime for DockerCli {
    async fn create_volume(&self, destination: &Destination, name: &str) -> Result<()> {
        let output = self.run(destination, &volume_create_args(name)).await?;
        if !output.status.success() {
            return Err(DeployError::ComposeApply(stderr_of(&output)));
        }
        Ok(())
    }

    async fn compose_up(&self, destination: &Destination, compose_file: &Path) -> Result<()> {
        let output = self.run(destination, &compose_up_args(compose_file)).await?;
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            debug!(target: "compose", "{}", line);
        }
        if !output.status.success() {
            return Err(DeployError::ComposeApply(stderr_of(&output)));
        }
        Ok(())
    }

    async fn proxy_running(&self, destination: &Destination) -> Result<bool> {
        let output = self.run(destination, &proxy_inspect_args(&self.proxy)).await?;
        Ok(output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    async fn start_proxy(&self, destination: &Destination) -> Result<()> {
        let create = vec![
            "network".into(),
            "create".into(),
            "--attachable".into(),
            self.proxy.network.clone(),
        ];
        let output = self.run(destination, &create).await?;
        if !output.status.success() {
            // usually "already exists"
            debug!(network = %self.proxy.network, error = %stderr_of(&output), "Network not created");
        }

        info!(
            destination = %destination.id,
            container = %self.proxy.container_name,
            image = %self.proxy.image,
            "Starting proxy container"
        );
        let output = self.run(destination, &proxy_run_args(&self.proxy)).await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            warn!(container = %self.proxy.container_name, error = %stderr, "Proxy failed to start");
            return Err(DeployError::Runtime(stderr));
        }
        Ok(())
    }

    async fn connect_network(&self, destination: &Destination, network: &str) -> Result<()> {
        let output = self
            .run(
                destination,
                &network_connect_args(network, &self.proxy.container_name),
            )
            .await?;
        if !output.status.success() {
            return Err(DeployError::Runtime(stderr_of(&output)));
        }
        Ok(())
    }
}
