//! Deployment coordinator
//!
//! Drives one deployment attempt end to end:
//! 1. resolve the destination
//! 2. stage sources into the build's own directory and build (applications),
//!    or write the compose document (databases)
//! 3. bring the containers up on the destination
//! 4. make sure the shared proxy container runs there
//! 5. reconfigure routing
//!
//! Engine and compose failures stop the deployment before routing. Proxy
//! failures are logged and swallowed unless they break something the
//! descriptor explicitly asked for: forced TLS, or a public database.

use crate::builder::{stage_sources, BuildEngine, ImageBuilder};
use crate::buildlog::{BuildContext, BuildLogSink};
use crate::buildpacks;
use crate::compose;
use crate::config::Config;
use crate::error::{DeployError, Result};
use crate::haproxy::{ProxyClient, RoutingOutcome};
use crate::model::{ApplicationDescriptor, DatabaseDescriptor, Destination};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Tag used for final images when the descriptor has no commit
pub const DEFAULT_TAG: &str = "latest";

/// Container runtime operations on a destination
#[async_trait]
pub trait DestinationRuntime: Send + Sync {
    async fn create_volume(&self, destination: &Destination, name: &str) -> Result<()>;

    async fn compose_up(&self, destination: &Destination, compose_file: &Path) -> Result<()>;

    async fn proxy_running(&self, destination: &Destination) -> Result<bool>;

    async fn start_proxy(&self, destination: &Destination) -> Result<()>;

    /// Attach the proxy container to `network`
    async fn connect_network(&self, destination: &Destination, network: &str) -> Result<()>;
}

/// Result of a successful application deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationDeployment {
    pub build_id: String,
    pub image: String,
    pub compose_file: PathBuf,
    /// `None` when the application has no domain or routing failed silently
    pub routing: Option<RoutingOutcome>,
}

/// Result of a successful database deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseDeployment {
    pub build_id: String,
    pub compose_file: PathBuf,
    pub routing: Option<RoutingOutcome>,
    pub connection_url: Option<String>,
}

/// Coordinates builds, container runtime and proxy routing
pub struct DeploymentCoordinator {
    config: Config,
    engines: BTreeMap<String, Arc<dyn BuildEngine>>,
    runtime: Arc<dyn DestinationRuntime>,
    proxy: ProxyClient,
    log: Arc<dyn BuildLogSink>,
}

impl DeploymentCoordinator {
    pub fn new(
        config: Config,
        runtime: Arc<dyn DestinationRuntime>,
        proxy: ProxyClient,
        log: Arc<dyn BuildLogSink>,
    ) -> Self {
        Self {
            config,
            engines: BTreeMap::new(),
            runtime,
            proxy,
            log,
        }
    }

    /// Register the build engine of a destination
    pub fn with_engine(mut self, destination_id: &str, engine: Arc<dyn BuildEngine>) -> Self {
        self.engines.insert(destination_id.to_string(), engine);
        self
    }

    /// Fresh context for one deployment attempt of `entity_id`
    pub fn new_context(&self, entity_id: &str) -> BuildContext {
        BuildContext::generate(entity_id, self.log.clone())
    }

    /// Per-build working directory under the configured build root
    pub fn build_dir(&self, ctx: &BuildContext) -> PathBuf {
        self.config.workspace.build_dir(&ctx.build_id)
    }

    fn destination(&self, id: &str) -> Result<&Destination> {
        self.config
            .destination(id)
            .ok_or_else(|| DeployError::Configuration(format!("unknown destination '{}'", id)))
    }

    fn engine(&self, destination: &Destination) -> Result<Arc<dyn BuildEngine>> {
        self.engines.get(&destination.id).cloned().ok_or_else(|| {
            DeployError::Configuration(format!(
                "no build engine registered for destination '{}'",
                destination.id
            ))
        })
    }

    /// Build, run and route an application whose sources are in `source`
    ///
    /// `source` is only read: sources are copied into [`Self::build_dir`] and
    /// every generated file lands there.
    pub async fn deploy_application(
        &self,
        app: &ApplicationDescriptor,
        ctx: &BuildContext,
        source: &Path,
    ) -> Result<ApplicationDeployment> {
        let result = self.run_application(app, ctx, source).await;
        if let Err(e) = &result {
            ctx.log(format!("[BERTH] - Deployment failed: {}", e));
            error!(app = %app.id, build = %ctx.build_id, code = e.code(), error = %e, "Application deployment failed");
        }
        result
    }

    async fn run_application(
        &self,
        app: &ApplicationDescriptor,
        ctx: &BuildContext,
        source: &Path,
    ) -> Result<ApplicationDeployment> {
        let destination = self.destination(&app.destination_id)?;
        let builder = ImageBuilder::new(self.engine(destination)?);
        let planned = buildpacks::plan(app)?;
        let workdir = self.build_dir(ctx);

        info!(
            app = %app.id,
            build = %ctx.build_id,
            destination = %destination.id,
            build_pack = %app.build_pack,
            "Deploying application"
        );

        let (from, to) = (source.to_path_buf(), workdir.clone());
        let copied = tokio::task::spawn_blocking(move || stage_sources(&from, &to))
            .await
            .map_err(|e| DeployError::Build(format!("failed to stage sources: {}", e)))??;
        ctx.log(format!("[BERTH] - Staged {} source files.", copied));

        if let Some(cache) = &planned.cache {
            let prefix = app.commit_prefix().ok_or_else(|| {
                DeployError::Configuration(format!("application {} has no commit", app.id))
            })?;
            builder
                .build_cache(cache, &workdir, ctx, prefix, app.debug)
                .await?;
        }

        let tag = app.commit_prefix().unwrap_or(DEFAULT_TAG);
        let image = builder
            .build(&planned.final_plan, &workdir, ctx, tag, false, app.debug)
            .await?;

        let spec = compose::build_application(app, &image, destination);
        let compose_file = spec.write(&workdir).await?;
        self.compose_up(destination, &compose_file, ctx).await?;
        ctx.log(format!("[BERTH] - Application {} is running.", app.id));

        let routing = match &app.domain {
            Some(domain) => {
                self.ensure_proxy_logged(destination).await;
                let port = planned.port().or(app.port).ok_or_else(|| {
                    DeployError::Configuration(format!("application {} has no port", app.id))
                })?;
                self.route_application(app, domain, port).await?
            }
            None => None,
        };

        Ok(ApplicationDeployment {
            build_id: ctx.build_id.clone(),
            image,
            compose_file,
            routing,
        })
    }

    async fn route_application(
        &self,
        app: &ApplicationDescriptor,
        domain: &str,
        port: u16,
    ) -> Result<Option<RoutingOutcome>> {
        match self
            .proxy
            .configure_application(domain, &app.id, port, app.force_ssl)
            .await
        {
            Ok(outcome) => {
                info!(app = %app.id, domain, ?outcome, "Application routing done");
                Ok(Some(outcome))
            }
            Err(e) if app.force_ssl => Err(e),
            Err(e) => {
                warn!(app = %app.id, domain, error = %e, "Application routing failed");
                Ok(None)
            }
        }
    }

    /// Run a database and route it when public
    pub async fn deploy_database(
        &self,
        database: &DatabaseDescriptor,
        ctx: &BuildContext,
    ) -> Result<DatabaseDeployment> {
        let result = self.run_database(database, ctx).await;
        if let Err(e) = &result {
            ctx.log(format!("[BERTH] - Deployment failed: {}", e));
            error!(database = %database.id, build = %ctx.build_id, code = e.code(), error = %e, "Database deployment failed");
        }
        result
    }

    async fn run_database(
        &self,
        database: &DatabaseDescriptor,
        ctx: &BuildContext,
    ) -> Result<DatabaseDeployment> {
        let destination = self.destination(&database.destination_id)?;
        let workdir = self.build_dir(ctx);

        info!(
            database = %database.id,
            kind = %database.kind,
            destination = %destination.id,
            "Deploying database"
        );

        let spec = compose::build(database, destination)?;
        let compose_file = spec.write(&workdir).await?;

        let volume = database.volume_name();
        if let Err(e) = self.runtime.create_volume(destination, volume).await {
            warn!(database = %database.id, volume, error = %e, "Volume creation failed");
            ctx.log(format!("[BERTH] - Volume {} not created: {}", volume, e));
        }

        self.compose_up(destination, &compose_file, ctx).await?;
        ctx.log(format!("[BERTH] - Database {} is running.", database.id));

        self.ensure_proxy_logged(destination).await;
        let routing = self.route_database(database, destination).await?;

        Ok(DatabaseDeployment {
            build_id: ctx.build_id.clone(),
            compose_file,
            routing,
            connection_url: database.connection_url(),
        })
    }

    async fn route_database(
        &self,
        database: &DatabaseDescriptor,
        destination: &Destination,
    ) -> Result<Option<RoutingOutcome>> {
        let subnet = destination.subnet.as_deref().unwrap_or_default();

        if database.is_public {
            let public_port = database.public_port.ok_or_else(|| {
                DeployError::Configuration(format!(
                    "public database {} has no public port",
                    database.id
                ))
            })?;

            let outcome = self
                .proxy
                .configure_database(&database.id, public_port, database.private_port)
                .await?;
            if outcome == RoutingOutcome::Skipped {
                return Err(DeployError::ProxyUnreachable(format!(
                    "public database {} cannot be routed",
                    database.id
                )));
            }
            self.proxy
                .set_database_visibility(&database.id, false, subnet)
                .await?;
            return Ok(Some(outcome));
        }

        // private databases only need the accept rule if a frontend was left behind
        if !self.proxy.is_reachable().await {
            return Ok(None);
        }
        match self.proxy.get_frontend(&database.id).await {
            Ok(Some(_)) if subnet.is_empty() => {
                warn!(database = %database.id, destination = %destination.id, "No subnet configured, cannot restrict database");
                Ok(None)
            }
            Ok(Some(_)) => match self
                .proxy
                .set_database_visibility(&database.id, true, subnet)
                .await
            {
                Ok(outcome) => Ok(Some(outcome)),
                Err(e) => {
                    warn!(database = %database.id, error = %e, "Database visibility change failed");
                    Ok(None)
                }
            },
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(database = %database.id, error = %e, "Database frontend lookup failed");
                Ok(None)
            }
        }
    }

    /// Remove an application's routing
    pub async fn undeploy_application(&self, app: &ApplicationDescriptor) -> Result<()> {
        self.destination(&app.destination_id)?;
        if let Some(domain) = &app.domain {
            self.proxy.remove_application(domain).await?;
            info!(app = %app.id, domain = %domain, "Application undeployed from proxy");
        }
        Ok(())
    }

    /// Remove a database's routing
    pub async fn undeploy_database(&self, database: &DatabaseDescriptor) -> Result<()> {
        self.destination(&database.destination_id)?;
        self.proxy.remove_database(&database.id).await?;
        info!(database = %database.id, "Database undeployed from proxy");
        Ok(())
    }

    /// Route the control plane's own domain when one is configured
    pub async fn route_control_plane(&self) -> Result<Option<RoutingOutcome>> {
        let proxy = &self.config.proxy;
        let Some(domain) = proxy.control_plane_domain.as_deref() else {
            return Ok(None);
        };
        let outcome = self
            .proxy
            .configure_self_route(domain, &proxy.control_plane_address, proxy.control_plane_port)
            .await?;
        Ok(Some(outcome))
    }

    /// Start the proxy on `destination` if needed; `true` when it was started
    pub async fn ensure_proxy(&self, destination: &Destination) -> Result<bool> {
        if self.runtime.proxy_running(destination).await? {
            return Ok(false);
        }

        self.runtime.start_proxy(destination).await?;
        for network in self.config.destination_networks(destination) {
            if let Err(e) = self.runtime.connect_network(destination, &network).await {
                warn!(network = %network, error = %e, "Failed to connect proxy to network");
            }
        }
        info!(destination = %destination.id, "Proxy started");
        Ok(true)
    }

    async fn ensure_proxy_logged(&self, destination: &Destination) {
        if let Err(e) = self.ensure_proxy(destination).await {
            warn!(destination = %destination.id, error = %e, "Could not ensure proxy is running");
        }
    }

    async fn compose_up(
        &self,
        destination: &Destination,
        compose_file: &Path,
        ctx: &BuildContext,
    ) -> Result<()> {
        if let Err(e) = self.runtime.compose_up(destination, compose_file).await {
            ctx.log(format!("[BERTH] - {}", e));
            return Err(match e {
                DeployError::ComposeApply(_) => e,
                other => DeployError::ComposeApply(other.to_string()),
            });
        }
        Ok(())
    }
}
