//! Buildpacks - turn an application descriptor into build instructions
//!
//! Planning is a pure function of the descriptor: no filesystem access, no
//! engine calls. Instructions are typed values and only become Dockerfile text
//! when [`BuildPlan::render`] is called at the boundary.
//!
//! Supported build packs:
//! - Static sites served by nginx, optionally built with a node toolchain
//! - Node.js applications started with their own start command
//!
//! When the descriptor carries a build command, planning produces two plans:
//! a cache plan that installs dependencies and runs the build inside
//! `node:lts`, and a final plan that copies the build output out of the cache
//! image (`<id>:<commit[..7]>-cache`).

use crate::error::{DeployError, Result};
use crate::model::{ApplicationDescriptor, BuildPack};
use std::fmt;
use tracing::debug;

const NGINX_IMAGE: &str = "nginx:stable-alpine";
const NGINX_ROOT: &str = "/usr/share/nginx/html";
const NODE_IMAGE: &str = "node:lts";
const NODE_WORKDIR: &str = "/usr/src/app";

/// One Dockerfile instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    From(String),
    Workdir(String),
    Arg { name: String, value: String },
    Copy {
        from: Option<String>,
        src: String,
        dest: String,
    },
    Run(String),
    Expose(u16),
    /// Exec form, rendered as a JSON array
    Cmd(Vec<String>),
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::From(image) => write!(f, "FROM {}", image),
            Instruction::Workdir(dir) => write!(f, "WORKDIR {}", dir),
            Instruction::Arg { name, value } => {
                write!(f, "ARG {}={}", name, quote_arg(value))
            }
            Instruction::Copy { from, src, dest } => match from {
                Some(stage) => write!(f, "COPY --from={} {} {}", stage, src, dest),
                None => write!(f, "COPY {} {}", src, dest),
            },
            Instruction::Run(cmd) => write!(f, "RUN {}", cmd),
            Instruction::Expose(port) => write!(f, "EXPOSE {}", port),
            Instruction::Cmd(args) => {
                let json = serde_json::to_string(args).map_err(|_| fmt::Error)?;
                write!(f, "CMD {}", json)
            }
        }
    }
}

/// Double-quote an ARG default so the Dockerfile lexer reads it back verbatim
fn quote_arg(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Ordered list of instructions for one image
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildPlan {
    pub instructions: Vec<Instruction>,
}

impl BuildPlan {
    fn push(&mut self, instruction: Instruction) -> &mut Self {
        self.instructions.push(instruction);
        self
    }

    /// Port declared by the last `EXPOSE`
    pub fn exposed_port(&self) -> Option<u16> {
        self.instructions.iter().rev().find_map(|i| match i {
            Instruction::Expose(port) => Some(*port),
            _ => None,
        })
    }

    /// Dockerfile text, one instruction per line
    pub fn render(&self) -> String {
        let mut out = String::new();
        for instruction in &self.instructions {
            out.push_str(&instruction.to_string());
            out.push('\n');
        }
        out
    }
}

/// Result of planning: the optional cache stage and the final image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBuild {
    pub cache: Option<BuildPlan>,
    pub final_plan: BuildPlan,
}

impl PlannedBuild {
    /// Port the final image listens on
    pub fn port(&self) -> Option<u16> {
        self.final_plan.exposed_port()
    }
}

/// Image reference of the cache image for a descriptor
pub fn cache_image_ref(app: &ApplicationDescriptor) -> Result<String> {
    let prefix = app.commit_prefix().ok_or_else(|| {
        DeployError::Configuration(format!(
            "application {} has a build command but no commit",
            app.id
        ))
    })?;
    Ok(format!("{}:{}-cache", app.id, prefix))
}

/// Plan the images needed to build an application
pub fn plan(app: &ApplicationDescriptor) -> Result<PlannedBuild> {
    if app.id.trim().is_empty() {
        return Err(DeployError::Configuration(
            "application id is required".to_string(),
        ));
    }

    let cache = match app.build_command() {
        Some(build) => {
            check_build_secrets(app)?;
            Some(cache_plan(app, build))
        }
        None => None,
    };

    let final_plan = match app.build_pack {
        BuildPack::Static => static_plan(app)?,
        BuildPack::Node => node_plan(app)?,
    };

    debug!(
        app = %app.id,
        build_pack = %app.build_pack,
        cached = cache.is_some(),
        steps = final_plan.instructions.len(),
        "Planned build"
    );

    Ok(PlannedBuild { cache, final_plan })
}

/// `./dir/` for a base directory, `./` when unset
fn source_dir(app: &ApplicationDescriptor) -> String {
    match app
        .base_directory
        .as_deref()
        .map(|d| d.trim().trim_matches('/'))
        .filter(|d| !d.is_empty())
    {
        Some(dir) => format!("./{}/", dir),
        None => "./".to_string(),
    }
}

fn publish_dir(app: &ApplicationDescriptor) -> Option<&str> {
    app.publish_directory
        .as_deref()
        .map(|d| d.trim().trim_matches('/'))
        .filter(|d| !d.is_empty())
}

/// ARG defaults are single-line
fn check_build_secrets(app: &ApplicationDescriptor) -> Result<()> {
    match app
        .build_secrets()
        .find(|s| s.value.contains(['\n', '\r']))
    {
        Some(secret) => Err(DeployError::Configuration(format!(
            "build secret {} of {} spans several lines",
            secret.name, app.id
        ))),
        None => Ok(()),
    }
}

fn cache_plan(app: &ApplicationDescriptor, build: &str) -> BuildPlan {
    let base = source_dir(app);
    let mut plan = BuildPlan::default();
    plan.push(Instruction::From(NODE_IMAGE.to_string()))
        .push(Instruction::Workdir(NODE_WORKDIR.to_string()));

    for secret in app.build_secrets() {
        plan.push(Instruction::Arg {
            name: secret.name.clone(),
            value: secret.value.clone(),
        });
    }

    if let Some(install) = app.install_command() {
        plan.push(Instruction::Copy {
            from: None,
            src: format!("{}package*.json", base),
            dest: "./".to_string(),
        })
        .push(Instruction::Run(install.to_string()));
    }

    plan.push(Instruction::Copy {
        from: None,
        src: base,
        dest: "./".to_string(),
    })
    .push(Instruction::Run(build.to_string()));
    plan
}

fn static_plan(app: &ApplicationDescriptor) -> Result<BuildPlan> {
    let mut plan = BuildPlan::default();
    plan.push(Instruction::From(NGINX_IMAGE.to_string()))
        .push(Instruction::Workdir(NGINX_ROOT.to_string()));

    if app.build_command().is_some() {
        let publish = publish_dir(app).ok_or_else(|| {
            DeployError::Configuration(format!(
                "static application {} with a build command needs a publish directory",
                app.id
            ))
        })?;
        plan.push(Instruction::Copy {
            from: Some(cache_image_ref(app)?),
            src: format!("{}/{}", NODE_WORKDIR, publish),
            dest: "./".to_string(),
        });
    } else {
        plan.push(Instruction::Copy {
            from: None,
            src: source_dir(app),
            dest: "./".to_string(),
        });
    }

    plan.push(Instruction::Expose(80)).push(Instruction::Cmd(vec![
        "nginx".to_string(),
        "-g".to_string(),
        "daemon off;".to_string(),
    ]));
    Ok(plan)
}

fn node_plan(app: &ApplicationDescriptor) -> Result<BuildPlan> {
    let start = app.start_command().ok_or_else(|| {
        DeployError::Configuration(format!(
            "node application {} needs a start command",
            app.id
        ))
    })?;
    let port = app.port.ok_or_else(|| {
        DeployError::Configuration(format!("node application {} needs a port", app.id))
    })?;
    let cmd = shell_words::split(start).map_err(|e| {
        DeployError::Configuration(format!("invalid start command for {}: {}", app.id, e))
    })?;
    if cmd.is_empty() {
        return Err(DeployError::Configuration(format!(
            "node application {} needs a start command",
            app.id
        )));
    }

    let mut plan = BuildPlan::default();
    plan.push(Instruction::From(NODE_IMAGE.to_string()))
        .push(Instruction::Workdir(NODE_WORKDIR.to_string()));

    if app.build_command().is_some() {
        let src = match publish_dir(app) {
            Some(publish) => format!("{}/{}", NODE_WORKDIR, publish),
            None => format!("{}/", NODE_WORKDIR),
        };
        plan.push(Instruction::Copy {
            from: Some(cache_image_ref(app)?),
            src,
            dest: "./".to_string(),
        });
    } else {
        let base = source_dir(app);
        if let Some(install) = app.install_command() {
            plan.push(Instruction::Copy {
                from: None,
                src: format!("{}package*.json", base),
                dest: "./".to_string(),
            })
            .push(Instruction::Run(install.to_string()));
        }
        plan.push(Instruction::Copy {
            from: None,
            src: base,
            dest: "./".to_string(),
        });
    }

    plan.push(Instruction::Expose(port))
        .push(Instruction::Cmd(cmd));
    Ok(plan)
}
