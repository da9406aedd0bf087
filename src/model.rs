//! Descriptors for the entities the engine deploys
//!
//! Descriptors are owned by the persistence layer and are read-only here:
//! every orchestration call receives them by reference.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of commit characters used to tag cache images
pub const COMMIT_PREFIX_LEN: usize = 7;

/// Build pack selected for an application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildPack {
    /// Files served by nginx, optionally produced by a node build step
    #[default]
    Static,
    /// Node.js application started with its own start command
    Node,
}

impl std::fmt::Display for BuildPack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildPack::Static => write!(f, "static"),
            BuildPack::Node => write!(f, "node"),
        }
    }
}

/// Application secret, injected at build time or at run time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub is_build_secret: bool,
}

/// Everything needed to build and route one application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationDescriptor {
    pub id: String,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub commit: Option<String>,
    #[serde(default)]
    pub build_pack: BuildPack,
    pub install_command: Option<String>,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    pub base_directory: Option<String>,
    pub publish_directory: Option<String>,
    pub domain: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub secrets: Vec<Secret>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub previews: bool,
    #[serde(default)]
    pub force_ssl: bool,
    pub destination_id: String,
}

impl ApplicationDescriptor {
    /// Minimal descriptor, mostly useful for tests and the CLI
    pub fn new(id: &str, build_pack: BuildPack, destination_id: &str) -> Self {
        Self {
            id: id.to_string(),
            repository: None,
            branch: None,
            commit: None,
            build_pack,
            install_command: None,
            build_command: None,
            start_command: None,
            base_directory: None,
            publish_directory: None,
            domain: None,
            port: None,
            secrets: Vec::new(),
            debug: false,
            previews: false,
            force_ssl: false,
            destination_id: destination_id.to_string(),
        }
    }

    /// Build command, ignoring blank values
    pub fn build_command(&self) -> Option<&str> {
        non_blank(self.build_command.as_deref())
    }

    pub fn install_command(&self) -> Option<&str> {
        non_blank(self.install_command.as_deref())
    }

    pub fn start_command(&self) -> Option<&str> {
        non_blank(self.start_command.as_deref())
    }

    /// First characters of the commit hash, used to tag cache images
    pub fn commit_prefix(&self) -> Option<&str> {
        let commit = non_blank(self.commit.as_deref())?;
        let end = commit
            .char_indices()
            .nth(COMMIT_PREFIX_LEN)
            .map(|(i, _)| i)
            .unwrap_or(commit.len());
        Some(&commit[..end])
    }

    /// Secrets that must be visible while building
    pub fn build_secrets(&self) -> impl Iterator<Item = &Secret> {
        self.secrets.iter().filter(|s| s.is_build_secret)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Supported database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Mysql,
    Postgresql,
    Mongodb,
    Couchdb,
}

impl std::fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseKind::Mysql => write!(f, "mysql"),
            DatabaseKind::Postgresql => write!(f, "postgresql"),
            DatabaseKind::Mongodb => write!(f, "mongodb"),
            DatabaseKind::Couchdb => write!(f, "couchdb"),
        }
    }
}

impl DatabaseKind {
    pub fn default_image(&self) -> &'static str {
        match self {
            DatabaseKind::Mysql => "bitnami/mysql:8.0",
            DatabaseKind::Postgresql => "bitnami/postgresql:14.2.0",
            DatabaseKind::Mongodb => "bitnami/mongodb:4.4",
            DatabaseKind::Couchdb => "bitnami/couchdb:3.2.1",
        }
    }

    /// Port the engine listens on inside the container network
    pub fn private_port(&self) -> u16 {
        match self {
            DatabaseKind::Mysql => 3306,
            DatabaseKind::Postgresql => 5432,
            DatabaseKind::Mongodb => 27017,
            DatabaseKind::Couchdb => 5984,
        }
    }

    pub fn data_path(&self) -> &'static str {
        match self {
            DatabaseKind::Mysql => "/bitnami/mysql/data",
            DatabaseKind::Postgresql => "/bitnami/postgresql",
            DatabaseKind::Mongodb => "/bitnami/mongodb",
            DatabaseKind::Couchdb => "/bitnami/couchdb",
        }
    }

    /// Container environment derived from the credentials
    pub fn environment(&self, credentials: &DatabaseCredentials) -> BTreeMap<String, String> {
        let pairs: Vec<(&str, &str)> = match self {
            DatabaseKind::Mysql => vec![
                ("MYSQL_USER", &credentials.user),
                ("MYSQL_PASSWORD", &credentials.password),
                ("MYSQL_ROOT_USER", &credentials.root_user),
                ("MYSQL_ROOT_PASSWORD", &credentials.root_password),
                ("MYSQL_DATABASE", &credentials.database),
            ],
            DatabaseKind::Postgresql => vec![
                ("POSTGRESQL_POSTGRES_PASSWORD", &credentials.root_password),
                ("POSTGRESQL_USERNAME", &credentials.user),
                ("POSTGRESQL_PASSWORD", &credentials.password),
                ("POSTGRESQL_DATABASE", &credentials.database),
            ],
            DatabaseKind::Mongodb => vec![
                ("MONGODB_ROOT_USER", &credentials.root_user),
                ("MONGODB_ROOT_PASSWORD", &credentials.root_password),
            ],
            DatabaseKind::Couchdb => vec![
                ("COUCHDB_USER", &credentials.user),
                ("COUCHDB_PASSWORD", &credentials.password),
            ],
        };
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub fn default_ulimits(&self) -> BTreeMap<String, Ulimit> {
        let mut ulimits = BTreeMap::new();
        if *self == DatabaseKind::Couchdb {
            ulimits.insert(
                "nofile".to_string(),
                Ulimit {
                    soft: 65536,
                    hard: 65536,
                },
            );
        }
        ulimits
    }
}

/// Credentials generated when a database is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseCredentials {
    pub user: String,
    pub password: String,
    pub root_user: String,
    pub root_password: String,
    pub database: String,
}

impl DatabaseCredentials {
    pub fn generate(id: &str) -> Self {
        Self {
            user: generate_username(),
            password: generate_password(),
            root_user: "root".to_string(),
            root_password: generate_password(),
            database: id.to_string(),
        }
    }
}

/// Resource limit entry in compose `ulimits`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ulimit {
    pub soft: i64,
    pub hard: i64,
}

/// Everything needed to run and route one database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseDescriptor {
    pub id: String,
    pub kind: DatabaseKind,
    pub image: String,
    /// `volume-name:/mount/path`
    pub volume: String,
    pub private_port: u16,
    /// Port exposed on the proxy when the database is public
    pub public_port: Option<u16>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub ulimits: BTreeMap<String, Ulimit>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub credentials: Option<DatabaseCredentials>,
    pub destination_id: String,
}

impl DatabaseDescriptor {
    /// Descriptor filled with the engine defaults and fresh credentials
    pub fn with_defaults(id: &str, kind: DatabaseKind, destination_id: &str) -> Self {
        let credentials = DatabaseCredentials::generate(id);
        Self {
            id: id.to_string(),
            kind,
            image: kind.default_image().to_string(),
            volume: format!("{}-{}-data:{}", id, kind, kind.data_path()),
            private_port: kind.private_port(),
            public_port: None,
            is_public: false,
            ulimits: kind.default_ulimits(),
            environment: kind.environment(&credentials),
            credentials: Some(credentials),
            destination_id: destination_id.to_string(),
        }
    }

    /// Name part of the `name:mountpath` volume spec
    pub fn volume_name(&self) -> &str {
        self.volume
            .split_once(':')
            .map(|(name, _)| name)
            .unwrap_or(&self.volume)
    }

    /// Connection URL reachable from containers on the destination network
    pub fn connection_url(&self) -> Option<String> {
        let c = self.credentials.as_ref()?;
        let host = &self.id;
        let port = self.private_port;
        Some(match self.kind {
            DatabaseKind::Mysql => format!(
                "mysql://{}:{}@{}:{}/{}",
                c.user, c.password, host, port, c.database
            ),
            DatabaseKind::Postgresql => format!(
                "postgresql://{}:{}@{}:{}/{}",
                c.user, c.password, host, port, c.database
            ),
            DatabaseKind::Mongodb => format!(
                "mongodb://{}:{}@{}:{}/",
                c.root_user, c.root_password, host, port
            ),
            DatabaseKind::Couchdb => {
                format!("http://{}:{}@{}:{}", c.user, c.password, host, port)
            }
        })
    }
}

/// Container engine endpoint plus the network entities are attached to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Filled from the configuration key when loaded
    #[serde(default)]
    pub id: String,
    /// `unix:///var/run/docker.sock` or `tcp://host:port`
    pub engine: String,
    pub network: String,
    #[serde(default)]
    pub swarm: bool,
    /// Subnet allowed to reach private databases (e.g. `10.0.0.0/24`)
    pub subnet: Option<String>,
}

impl Destination {
    /// Value for `DOCKER_HOST`, `None` for the local default socket
    pub fn docker_host(&self) -> Option<&str> {
        if self.engine.is_empty() || self.engine == "unix:///var/run/docker.sock" {
            None
        } else {
            Some(&self.engine)
        }
    }
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

fn generate_username() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("u{}", suffix.to_lowercase())
}
