//! berth - run one deployment operation from the command line
//!
//! Usage:
//!   berth <config.toml> deploy-app <app.toml> [source-dir]
//!   berth <config.toml> deploy-db <database.toml>
//!   berth <config.toml> undeploy-app <app.toml>
//!   berth <config.toml> undeploy-db <database.toml>
//!   berth <config.toml> plan <app.toml>
//!   berth <config.toml> self-route
//!   berth <config.toml> reloads

use anyhow::{Context, Result};
use berth::buildlog::{BuildLogSink, FanoutBuildLog, MemoryBuildLog, TracingBuildLog};
use berth::buildpacks;
use berth::config::Config;
use berth::deploy::DeploymentCoordinator;
use berth::docker::{DockerCli, DockerEngine};
use berth::haproxy::ProxyClient;
use berth::model::{ApplicationDescriptor, DatabaseCredentials, DatabaseDescriptor, DatabaseKind};
use berth::{PKG_NAME, VERSION};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Lines of build log printed when a deployment fails
const FAILURE_TAIL: usize = 20;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    DeployApp { descriptor: PathBuf, source: PathBuf },
    DeployDb { descriptor: PathBuf },
    UndeployApp { descriptor: PathBuf },
    UndeployDb { descriptor: PathBuf },
    Plan { descriptor: PathBuf },
    SelfRoute,
    Reloads,
    Help,
    Version,
}

/// Database file as written by hand: engine defaults fill the rest
#[derive(Debug, Deserialize)]
struct DatabaseFile {
    id: String,
    kind: DatabaseKind,
    destination_id: String,
    image: Option<String>,
    public_port: Option<u16>,
    #[serde(default)]
    is_public: bool,
    credentials: Option<DatabaseCredentials>,
}

impl DatabaseFile {
    fn into_descriptor(self) -> DatabaseDescriptor {
        let mut db = DatabaseDescriptor::with_defaults(&self.id, self.kind, &self.destination_id);
        if let Some(image) = self.image {
            db.image = image;
        }
        if let Some(credentials) = self.credentials {
            db.environment = self.kind.environment(&credentials);
            db.credentials = Some(credentials);
        }
        db.public_port = self.public_port;
        db.is_public = self.is_public;
        db
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("berth=debug".parse().expect("valid log directive")),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        match args.get(1).map(String::as_str) {
            Some("version" | "--version" | "-v") => print_version(),
            _ => print_help(),
        }
        return Ok(());
    }

    let config_path = PathBuf::from(&args[1]);
    let command = parse_command(&args[2..])?;

    match command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Version => {
            print_version();
            return Ok(());
        }
        Command::Plan { descriptor } => {
            let app = load_application(&descriptor)?;
            return print_plan(&app);
        }
        _ => {}
    }

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");

    let memory = Arc::new(MemoryBuildLog::new());
    let sink: Arc<dyn BuildLogSink> =
        Arc::new(FanoutBuildLog::new(vec![memory.clone(), Arc::new(TracingBuildLog)]));

    let proxy = ProxyClient::new(&config.proxy).context("Failed to create proxy API client")?;
    let runtime = Arc::new(DockerCli::new(
        &config.workspace.docker_path,
        config.proxy.clone(),
    ));

    match command {
        Command::DeployApp { descriptor, source } => {
            let app = load_application(&descriptor)?;
            let destination = config
                .destination(&app.destination_id)
                .with_context(|| format!("Unknown destination '{}'", app.destination_id))?;
            let engine = DockerEngine::connect(destination)
                .await
                .with_context(|| format!("Failed to connect to destination '{}'", destination.id))?;

            let coordinator = DeploymentCoordinator::new(config.clone(), runtime, proxy, sink)
                .with_engine(&app.destination_id, Arc::new(engine));
            let ctx = coordinator.new_context(&app.id);

            match coordinator.deploy_application(&app, &ctx, &source).await {
                Ok(deployment) => {
                    println!("Deployed {} as {}", app.id, deployment.image);
                    println!("  build:   {}", deployment.build_id);
                    println!("  compose: {}", deployment.compose_file.display());
                    if let Some(outcome) = deployment.routing {
                        println!("  routing: {:?}", outcome);
                    }
                }
                Err(e) => {
                    print_log_tail(&memory, &ctx.build_id);
                    return Err(e).context(format!("Deployment of {} failed", app.id));
                }
            }
        }
        Command::DeployDb { descriptor } => {
            let database = load_database(&descriptor)?;
            let coordinator = DeploymentCoordinator::new(config, runtime, proxy, sink);
            let ctx = coordinator.new_context(&database.id);

            match coordinator.deploy_database(&database, &ctx).await {
                Ok(deployment) => {
                    println!("Deployed database {}", database.id);
                    println!("  compose: {}", deployment.compose_file.display());
                    if let Some(url) = deployment.connection_url {
                        println!("  url:     {}", url);
                    }
                    if let Some(outcome) = deployment.routing {
                        println!("  routing: {:?}", outcome);
                    }
                }
                Err(e) => {
                    print_log_tail(&memory, &ctx.build_id);
                    return Err(e).context(format!("Deployment of {} failed", database.id));
                }
            }
        }
        Command::UndeployApp { descriptor } => {
            let app = load_application(&descriptor)?;
            let coordinator = DeploymentCoordinator::new(config, runtime, proxy, sink);
            coordinator.undeploy_application(&app).await?;
            println!("Removed routing for {}", app.id);
        }
        Command::UndeployDb { descriptor } => {
            let database = load_database(&descriptor)?;
            let coordinator = DeploymentCoordinator::new(config, runtime, proxy, sink);
            coordinator.undeploy_database(&database).await?;
            println!("Removed routing for {}", database.id);
        }
        Command::SelfRoute => {
            let coordinator = DeploymentCoordinator::new(config, runtime, proxy, sink);
            match coordinator.route_control_plane().await? {
                Some(outcome) => println!("Control plane routing: {:?}", outcome),
                None => println!("No control_plane_domain configured"),
            }
        }
        Command::Reloads => {
            for reload in proxy.reload_status().await? {
                println!("{}  {}", reload.id, reload.status);
            }
        }
        Command::Plan { .. } | Command::Help | Command::Version => {}
    }

    Ok(())
}

fn parse_command(args: &[String]) -> Result<Command> {
    let Some(name) = args.first() else {
        return Ok(Command::Help);
    };
    let descriptor = || -> Result<PathBuf> {
        args.get(1)
            .map(PathBuf::from)
            .with_context(|| format!("'{}' needs a descriptor file", name))
    };

    Ok(match name.as_str() {
        "deploy-app" => Command::DeployApp {
            descriptor: descriptor()?,
            source: args.get(2).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
        },
        "deploy-db" => Command::DeployDb {
            descriptor: descriptor()?,
        },
        "undeploy-app" => Command::UndeployApp {
            descriptor: descriptor()?,
        },
        "undeploy-db" => Command::UndeployDb {
            descriptor: descriptor()?,
        },
        "plan" => Command::Plan {
            descriptor: descriptor()?,
        },
        "self-route" => Command::SelfRoute,
        "reloads" => Command::Reloads,
        "version" | "--version" | "-v" => Command::Version,
        "help" | "--help" | "-h" => Command::Help,
        other => anyhow::bail!("Unknown command '{}'. Run 'berth help' for usage.", other),
    })
}

fn load_application(path: &Path) -> Result<ApplicationDescriptor> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Invalid application file {}", path.display()))
}

fn load_database(path: &Path) -> Result<DatabaseDescriptor> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file: DatabaseFile = toml::from_str(&content)
        .with_context(|| format!("Invalid database file {}", path.display()))?;
    Ok(file.into_descriptor())
}

fn print_plan(app: &ApplicationDescriptor) -> Result<()> {
    let planned = buildpacks::plan(app)?;
    if let Some(cache) = &planned.cache {
        println!("# Dockerfile-cache");
        print!("{}", cache.render());
        println!();
    }
    println!("# Dockerfile");
    print!("{}", planned.final_plan.render());
    Ok(())
}

fn print_log_tail(log: &MemoryBuildLog, build_id: &str) {
    let lines = log.text(build_id);
    let start = lines.len().saturating_sub(FAILURE_TAIL);
    if lines.is_empty() {
        return;
    }
    eprintln!("Last build log lines:");
    for line in &lines[start..] {
        eprintln!("  {}", line);
    }
}

fn print_version() {
    println!("{} {}", PKG_NAME, VERSION);
}

fn print_help() {
    println!(
        r#"
berth - deployment and routing orchestration

USAGE:
    berth <config.toml> <command> [args]

COMMANDS:
    deploy-app <app.toml> [source-dir]   Build, run and route an application
    deploy-db <database.toml>            Run a database and route it when public
    undeploy-app <app.toml>              Remove an application's proxy routing
    undeploy-db <database.toml>          Remove a database's proxy routing
    plan <app.toml>                      Print the generated Dockerfiles
    self-route                           Route the control plane's own domain
    reloads                              Show recent proxy reloads
    help                                 Show this help
    version                              Show version

ENVIRONMENT:
    RUST_LOG                             Log filter (e.g. berth=info)
"#
    );
}
