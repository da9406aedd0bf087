//! Image builder
//!
//! Writes a rendered [`BuildPlan`] into the build's working directory and
//! drives the build engine, relaying engine output into the build log:
//! - `Dockerfile` for final images, `Dockerfile-cache` for cache images
//! - images are tagged `<application>:<tag>` (`-cache` suffix for cache images)
//! - the first event carrying an error fails the build
//! - the stream ending without an error is the only success signal

use crate::buildlog::BuildContext;
use crate::buildpacks::BuildPlan;
use crate::error::{DeployError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};
use walkdir::WalkDir;

/// Prefix of lines written by the engine itself
pub const ENGINE_PREFIX: &str = "[DOCKER ENGINE] - ";

/// Prefix of lines written by berth
pub const BERTH_PREFIX: &str = "[BERTH] - ";

/// Dockerfile name for final images
pub const DOCKERFILE: &str = "Dockerfile";

/// Dockerfile name for cache images
pub const CACHE_DOCKERFILE: &str = "Dockerfile-cache";

/// A request to build one image from a directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Build context, sent to the engine as a whole
    pub context_dir: PathBuf,
    /// Dockerfile name relative to the context
    pub dockerfile: String,
    /// Full image reference
    pub tag: String,
}

/// One progress event from the build engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildEvent {
    pub stream: Option<String>,
    pub error: Option<String>,
}

impl BuildEvent {
    pub fn stream(text: &str) -> Self {
        Self {
            stream: Some(text.to_string()),
            error: None,
        }
    }

    pub fn error(text: &str) -> Self {
        Self {
            stream: None,
            error: Some(text.to_string()),
        }
    }
}

/// Container build engine
#[async_trait]
pub trait BuildEngine: Send + Sync {
    /// Start a build and return its progress events
    async fn build_image(
        &self,
        request: BuildRequest,
    ) -> Result<BoxStream<'static, Result<BuildEvent>>>;
}

/// Image reference for an application build
pub fn image_ref(application_id: &str, tag: &str, is_cache: bool) -> String {
    if is_cache {
        format!("{}:{}-cache", application_id, tag)
    } else {
        format!("{}:{}", application_id, tag)
    }
}

/// Builds images for applications through a [`BuildEngine`]
#[derive(Clone)]
pub struct ImageBuilder {
    engine: Arc<dyn BuildEngine>,
}

impl ImageBuilder {
    pub fn new(engine: Arc<dyn BuildEngine>) -> Self {
        Self { engine }
    }

    /// Build the cache image `<application>:<commit_prefix>-cache`
    pub async fn build_cache(
        &self,
        plan: &BuildPlan,
        workdir: &Path,
        ctx: &BuildContext,
        commit_prefix: &str,
        debug: bool,
    ) -> Result<String> {
        self.build(plan, workdir, ctx, commit_prefix, true, debug)
            .await
    }

    /// Write the Dockerfile for `plan` and build it, returning the image reference
    pub async fn build(
        &self,
        plan: &BuildPlan,
        workdir: &Path,
        ctx: &BuildContext,
        tag: &str,
        is_cache: bool,
        debug: bool,
    ) -> Result<String> {
        let dockerfile = if is_cache { CACHE_DOCKERFILE } else { DOCKERFILE };
        let image = image_ref(&ctx.application_id, tag, is_cache);

        tokio::fs::create_dir_all(workdir).await?;
        tokio::fs::write(workdir.join(dockerfile), plan.render()).await?;

        if !debug {
            ctx.log(format!("{}Debug turned off.", BERTH_PREFIX));
        }
        ctx.log(format!("{}Building image.", BERTH_PREFIX));

        info!(
            app = %ctx.application_id,
            build = %ctx.build_id,
            image = %image,
            dockerfile = %dockerfile,
            "Building image"
        );

        let request = BuildRequest {
            context_dir: workdir.to_path_buf(),
            dockerfile: dockerfile.to_string(),
            tag: image.clone(),
        };

        let mut events = match self.engine.build_image(request).await {
            Ok(events) => events,
            Err(e) => return Err(fail(ctx, &image, e.to_string())),
        };

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => return Err(fail(ctx, &image, e.to_string())),
            };

            if let Some(message) = event.error {
                return Err(fail(ctx, &image, message));
            }

            if let Some(text) = event.stream {
                let text = text.trim_end_matches(['\n', '\r']);
                if !text.is_empty() {
                    debug!(target: "docker", "{}", text);
                    if debug {
                        ctx.log(format!("{}{}", ENGINE_PREFIX, text));
                    }
                }
            }
        }

        info!(app = %ctx.application_id, image = %image, "Image built");
        Ok(image)
    }
}

/// Copy the application sources into a build's working directory
///
/// The source tree is never written to. A working directory nested inside
/// the sources is skipped. Returns the number of files copied.
pub fn stage_sources(source: &Path, workdir: &Path) -> Result<u64> {
    if !source.is_dir() {
        return Err(DeployError::Configuration(format!(
            "source directory {} does not exist",
            source.display()
        )));
    }
    std::fs::create_dir_all(workdir)?;

    let mut copied = 0;
    let entries = WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !e.path().starts_with(workdir));
    for entry in entries {
        let entry = entry.map_err(std::io::Error::from)?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = workdir.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            // ancestors of the working directory only exist for the walk
            if !workdir.starts_with(entry.path()) {
                std::fs::create_dir_all(&target)?;
            }
        } else if file_type.is_file() || entry.path().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        } else {
            debug!(path = %entry.path().display(), "Skipping special file");
        }
    }
    Ok(copied)
}

fn fail(ctx: &BuildContext, image: &str, message: String) -> DeployError {
    ctx.log(format!("{}{}", ENGINE_PREFIX, message));
    error!(app = %ctx.application_id, image = %image, error = %message, "Image build failed");
    DeployError::Build(message)
}
