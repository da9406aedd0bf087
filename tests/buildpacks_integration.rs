//! Integration tests for build planning
//!
//! These tests plan realistic application descriptors, build them through
//! `ImageBuilder` against a fake engine and check the Dockerfiles written to
//! the build directory.

mod common;

use berth::builder::{BuildEvent, ImageBuilder};
use berth::buildlog::{BuildContext, MemoryBuildLog};
use berth::buildpacks::{self, Instruction};
use berth::error::DeployError;
use berth::model::{ApplicationDescriptor, BuildPack, Secret};
use common::{source_dir, FakeEngine};
use std::fs;
use std::sync::Arc;

fn secret(name: &str, value: &str, is_build_secret: bool) -> Secret {
    Secret {
        name: name.to_string(),
        value: value.to_string(),
        is_build_secret,
    }
}

// ============================================================================
// Static site tests
// ============================================================================

mod static_sites {
    use super::*;

    #[test]
    fn test_plain_html_site() {
        let app = ApplicationDescriptor::new("landing", BuildPack::Static, "local");
        let planned = buildpacks::plan(&app).unwrap();

        assert!(planned.cache.is_none());
        assert_eq!(
            planned.final_plan.render(),
            "FROM nginx:stable-alpine\n\
             WORKDIR /usr/share/nginx/html\n\
             COPY ./ ./\n\
             EXPOSE 80\n\
             CMD [\"nginx\",\"-g\",\"daemon off;\"]\n"
        );
        assert_eq!(planned.port(), Some(80));
    }

    #[test]
    fn test_site_in_monorepo_subdirectory() {
        let mut app = ApplicationDescriptor::new("docs", BuildPack::Static, "local");
        app.base_directory = Some("/packages/docs/".to_string());

        let planned = buildpacks::plan(&app).unwrap();
        assert!(planned
            .final_plan
            .instructions
            .contains(&Instruction::Copy {
                from: None,
                src: "./packages/docs/".to_string(),
                dest: "./".to_string(),
            }));
    }

    #[test]
    fn test_react_app_with_build_step() {
        let mut app = ApplicationDescriptor::new("shop", BuildPack::Static, "local");
        app.commit = Some("9f8e7d6c5b4a".to_string());
        app.install_command = Some("npm ci".to_string());
        app.build_command = Some("npm run build".to_string());
        app.publish_directory = Some("build".to_string());
        app.secrets = vec![
            secret("REACT_APP_API_URL", "https://api.example.com", true),
            secret("SESSION_KEY", "s3cret", false),
        ];

        let planned = buildpacks::plan(&app).unwrap();
        let cache = planned.cache.as_ref().unwrap();

        assert_eq!(
            cache.render(),
            "FROM node:lts\n\
             WORKDIR /usr/src/app\n\
             ARG REACT_APP_API_URL=\"https://api.example.com\"\n\
             COPY ./package*.json ./\n\
             RUN npm ci\n\
             COPY ./ ./\n\
             RUN npm run build\n"
        );
        assert_eq!(
            planned.final_plan.render(),
            "FROM nginx:stable-alpine\n\
             WORKDIR /usr/share/nginx/html\n\
             COPY --from=shop:9f8e7d6-cache /usr/src/app/build ./\n\
             EXPOSE 80\n\
             CMD [\"nginx\",\"-g\",\"daemon off;\"]\n"
        );
    }

    #[test]
    fn test_build_step_needs_publish_directory() {
        let mut app = ApplicationDescriptor::new("shop", BuildPack::Static, "local");
        app.commit = Some("9f8e7d6c5b4a".to_string());
        app.build_command = Some("npm run build".to_string());

        let err = buildpacks::plan(&app).unwrap_err();
        assert!(matches!(err, DeployError::Configuration(ref m) if m.contains("publish directory")));
    }
}

// ============================================================================
// Node.js tests
// ============================================================================

mod nodejs {
    use super::*;

    #[test]
    fn test_express_api() {
        let mut app = ApplicationDescriptor::new("api", BuildPack::Node, "local");
        app.install_command = Some("npm install --production".to_string());
        app.start_command = Some("node src/index.js".to_string());
        app.port = Some(3000);

        let planned = buildpacks::plan(&app).unwrap();

        assert!(planned.cache.is_none());
        assert_eq!(
            planned.final_plan.render(),
            "FROM node:lts\n\
             WORKDIR /usr/src/app\n\
             COPY ./package*.json ./\n\
             RUN npm install --production\n\
             COPY ./ ./\n\
             EXPOSE 3000\n\
             CMD [\"node\",\"src/index.js\"]\n"
        );
    }

    #[test]
    fn test_typescript_api_with_build_step() {
        let mut app = ApplicationDescriptor::new("api", BuildPack::Node, "local");
        app.commit = Some("0123456789".to_string());
        app.install_command = Some("yarn install".to_string());
        app.build_command = Some("yarn build".to_string());
        app.start_command = Some("node dist/server.js".to_string());
        app.port = Some(8080);

        let planned = buildpacks::plan(&app).unwrap();

        assert!(planned.cache.is_some());
        assert_eq!(
            planned.final_plan.instructions[2],
            Instruction::Copy {
                from: Some("api:0123456-cache".to_string()),
                src: "/usr/src/app/".to_string(),
                dest: "./".to_string(),
            }
        );
        assert_eq!(planned.port(), Some(8080));
    }

    #[test]
    fn test_quoted_start_command() {
        let mut app = ApplicationDescriptor::new("worker", BuildPack::Node, "local");
        app.start_command = Some(r#"node -e "require('./worker').run()""#.to_string());
        app.port = Some(9000);

        let planned = buildpacks::plan(&app).unwrap();
        assert_eq!(
            planned.final_plan.instructions.last(),
            Some(&Instruction::Cmd(vec![
                "node".to_string(),
                "-e".to_string(),
                "require('./worker').run()".to_string(),
            ]))
        );
    }

    #[test]
    fn test_missing_port() {
        let mut app = ApplicationDescriptor::new("api", BuildPack::Node, "local");
        app.start_command = Some("npm start".to_string());

        assert!(matches!(
            buildpacks::plan(&app).unwrap_err(),
            DeployError::Configuration(_)
        ));
    }
}

// ============================================================================
// Image build tests
// ============================================================================

mod image_builds {
    use super::*;

    #[tokio::test]
    async fn test_dockerfiles_written_to_build_directory() {
        let (_src, workdir) = source_dir();
        let engine = FakeEngine::succeeding();
        let builder = ImageBuilder::new(engine.clone());
        let log = Arc::new(MemoryBuildLog::new());
        let ctx = BuildContext::new("build-1", "shop", log.clone());

        let mut app = ApplicationDescriptor::new("shop", BuildPack::Static, "local");
        app.commit = Some("9f8e7d6c5b4a".to_string());
        app.build_command = Some("npm run build".to_string());
        app.publish_directory = Some("dist".to_string());
        let planned = buildpacks::plan(&app).unwrap();

        let cache = planned.cache.as_ref().unwrap();
        let cache_image = builder
            .build_cache(cache, &workdir, &ctx, app.commit_prefix().unwrap(), false)
            .await
            .unwrap();
        let image = builder
            .build(&planned.final_plan, &workdir, &ctx, "9f8e7d6", false, false)
            .await
            .unwrap();

        assert_eq!(cache_image, "shop:9f8e7d6-cache");
        assert_eq!(image, "shop:9f8e7d6");
        assert_eq!(
            fs::read_to_string(workdir.join("Dockerfile-cache")).unwrap(),
            cache.render()
        );
        assert_eq!(
            fs::read_to_string(workdir.join("Dockerfile")).unwrap(),
            planned.final_plan.render()
        );
        assert_eq!(engine.requests.lock()[0].context_dir, workdir);
    }

    #[tokio::test]
    async fn test_engine_output_logged_in_debug_mode() {
        let (_src, workdir) = source_dir();
        let engine = FakeEngine::scripted(vec![
            BuildEvent::stream("Step 1/4 : FROM node:lts\n"),
            BuildEvent::stream("\n"),
            BuildEvent::stream("Successfully tagged api:latest\n"),
        ]);
        let builder = ImageBuilder::new(engine);
        let log = Arc::new(MemoryBuildLog::new());
        let ctx = BuildContext::new("build-2", "api", log.clone());

        let mut app = ApplicationDescriptor::new("api", BuildPack::Node, "local");
        app.start_command = Some("npm start".to_string());
        app.port = Some(3000);
        let planned = buildpacks::plan(&app).unwrap();

        builder
            .build(&planned.final_plan, &workdir, &ctx, "latest", false, true)
            .await
            .unwrap();

        assert_eq!(
            log.text("build-2"),
            vec![
                "[BERTH] - Building image.",
                "[DOCKER ENGINE] - Step 1/4 : FROM node:lts",
                "[DOCKER ENGINE] - Successfully tagged api:latest",
            ]
        );
    }
}
