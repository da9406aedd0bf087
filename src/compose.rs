//! Compose documents for deployed containers
//!
//! A database runs as a single compose service keyed by its id, attached to
//! the destination network and its named volume. Both are declared
//! `external: true`: they are created outside of compose and outlive it.
//! Applications get the same shape without a volume, running the image the
//! builder produced with their runtime secrets as environment.

use crate::error::Result;
use crate::model::{ApplicationDescriptor, DatabaseDescriptor, Destination, Ulimit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name compose documents are written to
pub const COMPOSE_FILE: &str = "docker-compose.yaml";

const COMPOSE_VERSION: &str = "3.8";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComposeSpec {
    pub version: String,
    pub services: BTreeMap<String, ComposeService>,
    pub networks: BTreeMap<String, ExternalResource>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, ExternalResource>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComposeService {
    pub container_name: String,
    pub image: String,
    pub networks: Vec<String>,
    pub environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub ulimits: BTreeMap<String, Ulimit>,
    pub labels: BTreeMap<String, String>,
    pub deploy: DeployPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExternalResource {
    pub external: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeployPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    pub restart_policy: RestartPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_config: Option<UpdateConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_config: Option<UpdateConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestartPolicy {
    pub condition: String,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateConfig {
    pub parallelism: u32,
    pub delay: String,
    pub order: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_action: Option<String>,
}

impl DeployPolicy {
    /// Restart on any exit, at most 6 times; swarm adds rolling updates
    pub fn for_destination(destination: &Destination) -> Self {
        let restart_policy = RestartPolicy {
            condition: "any".to_string(),
            max_attempts: 6,
        };
        if !destination.swarm {
            return Self {
                replicas: None,
                restart_policy,
                update_config: None,
                rollback_config: None,
            };
        }

        let rolling = UpdateConfig {
            parallelism: 1,
            delay: "10s".to_string(),
            order: "start-first".to_string(),
            failure_action: None,
        };
        Self {
            replicas: Some(1),
            restart_policy,
            update_config: Some(rolling.clone()),
            rollback_config: Some(UpdateConfig {
                failure_action: Some("rollback".to_string()),
                ..rolling
            }),
        }
    }
}

#[derive(Serialize)]
struct ConfigurationLabel<'a> {
    id: &'a str,
    kind: String,
    image: &'a str,
    volume: &'a str,
}

/// Labels identifying a managed standalone database
fn labels(database: &DatabaseDescriptor) -> Result<BTreeMap<String, String>> {
    let configuration = serde_json::to_vec(&ConfigurationLabel {
        id: &database.id,
        kind: database.kind.to_string(),
        image: &database.image,
        volume: &database.volume,
    })?;

    let mut labels = BTreeMap::new();
    labels.insert("berth.managed".to_string(), "true".to_string());
    labels.insert(
        "berth.type".to_string(),
        "standalone-database".to_string(),
    );
    labels.insert("berth.database.id".to_string(), database.id.clone());
    labels.insert(
        "berth.configuration".to_string(),
        BASE64.encode(configuration),
    );
    Ok(labels)
}

/// Compose document running `database` on `destination`
pub fn build(database: &DatabaseDescriptor, destination: &Destination) -> Result<ComposeSpec> {
    let service = ComposeService {
        container_name: database.id.clone(),
        image: database.image.clone(),
        networks: vec![destination.network.clone()],
        environment: database.environment.clone(),
        volumes: vec![database.volume.clone()],
        ulimits: database.ulimits.clone(),
        labels: labels(database)?,
        deploy: DeployPolicy::for_destination(destination),
    };

    let mut services = BTreeMap::new();
    services.insert(database.id.clone(), service);

    let mut networks = BTreeMap::new();
    networks.insert(
        destination.network.clone(),
        ExternalResource { external: true },
    );

    let mut volumes = BTreeMap::new();
    volumes.insert(
        database.volume_name().to_string(),
        ExternalResource { external: true },
    );

    Ok(ComposeSpec {
        version: COMPOSE_VERSION.to_string(),
        services,
        networks,
        volumes,
    })
}

/// Compose document running the built `image` of `app` on `destination`
pub fn build_application(
    app: &ApplicationDescriptor,
    image: &str,
    destination: &Destination,
) -> ComposeSpec {
    let environment = app
        .secrets
        .iter()
        .filter(|s| !s.is_build_secret)
        .map(|s| (s.name.clone(), s.value.clone()))
        .collect();

    let mut labels = BTreeMap::new();
    labels.insert("berth.managed".to_string(), "true".to_string());
    labels.insert("berth.type".to_string(), "application".to_string());
    labels.insert("berth.application.id".to_string(), app.id.clone());
    if let Some(domain) = &app.domain {
        labels.insert("berth.application.domain".to_string(), domain.clone());
    }

    let service = ComposeService {
        container_name: app.id.clone(),
        image: image.to_string(),
        networks: vec![destination.network.clone()],
        environment,
        volumes: Vec::new(),
        ulimits: BTreeMap::new(),
        labels,
        deploy: DeployPolicy::for_destination(destination),
    };

    let mut services = BTreeMap::new();
    services.insert(app.id.clone(), service);

    let mut networks = BTreeMap::new();
    networks.insert(
        destination.network.clone(),
        ExternalResource { external: true },
    );

    ComposeSpec {
        version: COMPOSE_VERSION.to_string(),
        services,
        networks,
        volumes: BTreeMap::new(),
    }
}

impl ComposeSpec {
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Write the document to `<dir>/docker-compose.yaml`
    pub async fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(COMPOSE_FILE);
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, self.to_yaml()?).await?;
        Ok(path)
    }
}
