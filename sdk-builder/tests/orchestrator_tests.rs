//! Build lifecycle against an in-memory container runtime

mod common;

use std::fs;

use common::{archive_entries, image_tag, FakeRuntime, Project, TARGET};
use convenient_container::{ContainerError, Mount, INSIDE_CONTAINER_ENV};
use sdk_builder::config::load_env_defaults;
use sdk_builder::layout::{standard_layout, LayoutOptions};
use sdk_builder::orchestrator::{BUILD_PACKAGES_HOOK, PACKAGES_ENV};
use sdk_builder::{
    BuildConfig, BuildError, BuildKind, BuildOrchestrator, BuildSpec, ErrorCategory, OpenWrtSdk, Sdk,
    SdkRegistry,
};

fn orchestrator(
    project: &Project,
    config: BuildConfig,
    inside_container: bool,
    runtime: &FakeRuntime,
) -> BuildOrchestrator {
    let paths = standard_layout(
        &LayoutOptions::new(project.root())
            .container_home(project.home().to_string_lossy())
            .target(Some(TARGET))
            .inside_container(inside_container),
    )
    .unwrap();
    let spec = BuildSpec::load(&project.path("spec/targets/rpi4b/rpi4b_spec.json")).unwrap();
    BuildOrchestrator::new(spec, config, paths, runtime.boxed()).unwrap()
}

fn config(kind: BuildKind) -> BuildConfig {
    BuildConfig {
        kind,
        ..BuildConfig::default()
    }
}

fn home(project: &Project) -> String {
    project.home().to_string_lossy().to_string()
}

#[cfg(unix)]
mod staged {
    use super::*;

    fn staged_project() -> (Project, std::path::PathBuf) {
        let project = Project::new();
        let log = project.path("stages.log");
        for stage in ["prebuild", "build", "postbuild"] {
            project.script(
                &format!("home/base/scripts/{}/10-{}.sh", stage, stage),
                &format!("echo {} >> \"$STAGE_LOG\"", stage),
            );
        }
        (project, log)
    }

    fn staged_config(project: &Project, log: &std::path::Path) -> BuildConfig {
        let mut config = config(BuildKind::Automated);
        config.env_defaults =
            load_env_defaults(&project.path("spec/targets/common/specs/environment.json")).unwrap();
        config
            .env_overrides
            .insert("STAGE_LOG".to_string(), log.to_string_lossy().to_string());
        config
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let (project, log) = staged_project();
        project.script(
            "home/base/scripts/build/20-env.sh",
            "echo \"$SDK_VAR $DEFAULT_VAR $NUM_BUILD_CORES\" >> \"$STAGE_LOG\"",
        );
        let runtime = FakeRuntime::new();
        let mut orchestrator = orchestrator(&project, staged_config(&project, &log), true, &runtime);

        orchestrator.build().await.unwrap();

        assert_eq!(
            fs::read_to_string(&log).unwrap(),
            "prebuild\nbuild\nfrom-spec default 1\npostbuild\n"
        );
        assert_eq!(runtime.state().created, 0);
    }

    #[tokio::test]
    async fn test_failed_stage_stops_the_build() {
        let (project, log) = staged_project();
        project.script("home/base/scripts/build/05-fail.sh", "exit 3");
        let runtime = FakeRuntime::new();
        let mut orchestrator = orchestrator(&project, staged_config(&project, &log), true, &runtime);

        match orchestrator.build().await {
            Err(BuildError::ScriptFailed { script, code }) => {
                assert_eq!(code, 3);
                assert!(script.ends_with("05-fail.sh"));
            }
            other => panic!("Expected ScriptFailed, got {:?}", other.err()),
        }
        assert_eq!(fs::read_to_string(&log).unwrap(), "prebuild\n");
    }

    #[tokio::test]
    async fn test_hook_runs_with_build_environment() {
        let (project, log) = staged_project();
        project.script(
            "home/base/scripts/hooks/prepare_sdk/10-touch.sh",
            "echo \"hook $SDK_TOPDIR\" >> \"$STAGE_LOG\"",
        );
        let runtime = FakeRuntime::new();
        let orchestrator = orchestrator(&project, staged_config(&project, &log), true, &runtime);

        orchestrator.run_hook("prepare_sdk").await.unwrap();

        assert_eq!(
            fs::read_to_string(&log).unwrap(),
            format!("hook {}/openwrt_v23.05.3\n", home(&project))
        );
    }
}

#[tokio::test]
async fn test_restricted_build_needs_an_image() {
    let project = Project::new();
    let runtime = FakeRuntime::new();
    let mut orchestrator = orchestrator(&project, config(BuildKind::Dev), false, &runtime);

    let result = orchestrator.build_only_firmware().await;

    assert!(matches!(
        result,
        Err(BuildError::Container(ContainerError::ImageNotFound(tag))) if tag == image_tag("dev")
    ));
    assert_eq!(runtime.state().constructed, 0);
    assert!(orchestrator.container().is_none());
}

#[tokio::test]
async fn test_package_build_needs_an_image() {
    let project = Project::new();
    let runtime = FakeRuntime::new();
    let mut orchestrator = orchestrator(&project, config(BuildKind::Dev), false, &runtime);

    let result = orchestrator.build_packages(&["luci".to_string()]).await;

    match result {
        Err(e @ BuildError::Container(ContainerError::ImageNotFound(_))) => {
            assert_eq!(e.category(), ErrorCategory::Precondition)
        }
        other => panic!("Expected ImageNotFound, got {:?}", other.err()),
    }
    assert_eq!(runtime.state().constructed, 0);
    assert!(orchestrator.container().is_none());
}

#[tokio::test]
async fn test_firmware_build_and_retrieval() {
    let project = Project::new();
    project.write(".tmp/build.log", "host log\n");
    let runtime = FakeRuntime::with_image(&image_tag("dev"));
    runtime.state().log_lines = vec!["make world".to_string()];
    let mut orchestrator = orchestrator(&project, config(BuildKind::Dev), false, &runtime);

    orchestrator.build_only_firmware().await.unwrap();

    {
        let state = runtime.state();
        assert_eq!(state.created, 1);
        let (spec, mounts, cmd) = &state.started[0];
        assert_eq!(spec.image, image_tag("dev"));
        assert_eq!(spec.env.get(INSIDE_CONTAINER_ENV).map(String::as_str), Some("1"));
        assert_eq!(
            spec.env.get("BUILD_ARTIFACTS_OUTDIR"),
            Some(&format!("{}/out/", home(&project)))
        );
        assert_eq!(
            cmd,
            &vec![
                format!("{}/base/sdk-builder", home(&project)),
                "-t".to_string(),
                "rpi4b".to_string(),
                "--cores=1".to_string(),
            ]
        );
        assert_eq!(mounts.len(), 2);
    }
    let id = orchestrator.container().and_then(|c| c.id()).unwrap().to_string();

    let source = format!("{}/out/", home(&project));
    let archive = orchestrator
        .retrieve_build_artifacts(Some(&source), None)
        .await
        .unwrap();

    assert_eq!(archive, project.path("out/rpi4b-firmware.tar"));
    assert_eq!(
        archive_entries(&archive),
        vec!["out/build.log", "out/firmware.bin", "out/timestamp"]
    );
    assert!(!runtime.state().containers.contains(&id));
    assert!(orchestrator.container().is_none());

    let timestamps = fs::read_to_string(project.path(".tmp/timestamp")).unwrap();
    let lines: Vec<&str> = timestamps.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("Started:"));
    assert!(lines[1].starts_with("Completed:"));
}

#[tokio::test]
async fn test_container_exit_code_is_an_error() {
    let project = Project::new();
    let runtime = FakeRuntime::with_image(&image_tag("dev"));
    runtime.state().exit_code = 2;
    let mut orchestrator = orchestrator(&project, config(BuildKind::Dev), false, &runtime);

    let result = orchestrator.build_only_firmware().await;

    match result {
        Err(e @ BuildError::ContainerExit(2)) => assert_eq!(e.exit_code(), 2),
        other => panic!("Expected ContainerExit(2), got {:?}", other.err()),
    }
    // kept for inspection
    assert!(orchestrator.container().is_some());
    assert_eq!(runtime.state().containers.len(), 1);
}

#[tokio::test]
async fn test_package_build_command() {
    let project = Project::new();
    let runtime = FakeRuntime::with_image(&image_tag("dev"));
    let mut orchestrator = orchestrator(&project, config(BuildKind::Dev), false, &runtime);

    orchestrator
        .build_packages(&["luci".to_string(), "dnsmasq".to_string()])
        .await
        .unwrap();

    let state = runtime.state();
    let (spec, _, cmd) = &state.started[0];
    assert_eq!(spec.env.get(PACKAGES_ENV).map(String::as_str), Some("luci dnsmasq"));
    assert_eq!(cmd[1..], ["--run-hook".to_string(), BUILD_PACKAGES_HOOK.to_string()]);
}

#[tokio::test]
async fn test_dev_mounts() {
    let project = Project::new();
    let runtime = FakeRuntime::new();
    let mut config = config(BuildKind::Dev);
    config.mount_overrides = vec![Mount::bind("/srv/cache/dl", "/home/dev/dl")];
    let orchestrator = orchestrator(&project, config, false, &runtime);

    let mounts = orchestrator.mounts().unwrap();

    let root = project.root().to_string_lossy().to_string();
    assert_eq!(
        mounts,
        vec![
            Mount::bind(
                format!("{}/openwrt_v23.05.3", root),
                format!("{}/openwrt_v23.05.3", home(&project))
            ),
            Mount::bind(format!("{}/staging", root), format!("{}/base", home(&project))),
            Mount::bind("/srv/cache/dl", "/home/dev/dl"),
        ]
    );
}

#[tokio::test]
async fn test_automated_builds_have_no_mounts() {
    let project = Project::new();
    let runtime = FakeRuntime::new();
    let mut config = config(BuildKind::Automated);
    config.mount_overrides = vec![Mount::bind("/srv/cache/dl", "/home/dev/dl")];
    let orchestrator = orchestrator(&project, config, false, &runtime);

    assert!(orchestrator.mounts().unwrap().is_empty());
}

#[tokio::test]
async fn test_environment_priority() {
    let project = Project::new();
    let runtime = FakeRuntime::new();
    let mut config = config(BuildKind::Dev);
    config.cores = 4;
    config.env_defaults.insert("SDK_VAR".to_string(), "default".to_string());
    config.env_defaults.insert("NUM_BUILD_CORES".to_string(), "64".to_string());
    config.env_overrides.insert("VERBOSE".to_string(), "Y".to_string());
    let orchestrator = orchestrator(&project, config, false, &runtime);

    let env = orchestrator.env_vars(false).unwrap();

    assert_eq!(env["SDK_VAR"], "from-spec");
    assert_eq!(env["NUM_BUILD_CORES"], "4");
    assert_eq!(env["VERBOSE"], "Y");
    assert_eq!(env["CONFIGS_DIR"], format!("{}/base/files/", home(&project)));
    assert_eq!(env["PACKAGE_OUTDIR"], format!("{}/out/package/", home(&project)));
    assert!(!env.contains_key(INSIDE_CONTAINER_ENV));
}

#[tokio::test]
async fn test_image_build() {
    let project = Project::new();
    let runtime = FakeRuntime::new();
    let mut config = config(BuildKind::Dev);
    config.clean_start = true;
    config.cores = 2;
    project.write("staging/Dockerfile", "FROM debian:bookworm\n");
    let orchestrator = orchestrator(&project, config, false, &runtime);

    orchestrator.build_container_image().await.unwrap();

    let state = runtime.state();
    assert_eq!(state.calls, vec![format!("build {} no_cache=true", image_tag("dev"))]);
    assert!(state.images.contains(&image_tag("dev")));
    assert_eq!(state.build_args["SDK_DIRNAME"], "openwrt_v23.05.3");
    assert_eq!(state.build_args["TARGET"], "rpi4b");
    assert_eq!(state.build_args["DEV_BUILD_CLI_FLAG"], "-d");
    assert_eq!(state.build_args["NUM_BUILD_CORES_CLI_FLAG"], "--cores=2");
    assert_eq!(state.build_args["QUIET_MODE_CLI_FLAG"], "--quiet");
    assert_eq!(state.build_args["USER"], "dev");
    assert!(state.build_args.contains_key("UID"));
}

#[tokio::test]
async fn test_image_build_needs_a_staged_dockerfile() {
    let project = Project::new();
    let runtime = FakeRuntime::new();
    let orchestrator = orchestrator(&project, config(BuildKind::Automated), false, &runtime);

    match orchestrator.build_container_image().await {
        Err(BuildError::MissingDockerfile(path)) => {
            assert_eq!(path, project.path("staging/Dockerfile"))
        }
        other => panic!("Expected MissingDockerfile, got {:?}", other.err()),
    }
    assert!(runtime.state().calls.is_empty());
}

#[tokio::test]
async fn test_failed_image_build() {
    let project = Project::new();
    let runtime = FakeRuntime::new();
    runtime.state().build_fails = true;
    project.write("staging/Dockerfile", "FROM debian:bookworm\n");
    let orchestrator = orchestrator(&project, config(BuildKind::Automated), false, &runtime);

    let result = orchestrator.build_container_image().await;

    assert!(matches!(result, Err(BuildError::ImageBuild(_))));
    assert!(runtime.state().images.is_empty());
}

#[tokio::test]
async fn test_automated_retrieval_copies_from_image() {
    let project = Project::new();
    let runtime = FakeRuntime::with_image(&image_tag("automated"));
    let mut orchestrator = orchestrator(&project, config(BuildKind::Automated), false, &runtime);

    let archive = orchestrator.retrieve_build_artifacts(None, None).await.unwrap();

    assert_eq!(
        runtime.state().calls,
        vec![format!("copy image {}:{}/out/", image_tag("automated"), home(&project))]
    );
    assert_eq!(archive_entries(&archive), vec!["out/firmware.bin", "out/timestamp"]);
}

#[tokio::test]
async fn test_dev_retrieval_without_container() {
    let project = Project::new();
    let runtime = FakeRuntime::new();
    let mut orchestrator = orchestrator(&project, config(BuildKind::Dev), false, &runtime);

    let archive = orchestrator
        .retrieve_build_artifacts(None, Some("logs"))
        .await
        .unwrap();

    assert!(runtime.state().calls.is_empty());
    assert_eq!(archive_entries(&archive), vec!["logs/timestamp"]);
}

#[tokio::test]
async fn test_interactive_session_returns_shell_code() {
    let project = Project::new();
    let runtime = FakeRuntime::with_image(&image_tag("dev"));
    runtime.state().exit_code = 130;
    let mut orchestrator = orchestrator(&project, config(BuildKind::Dev), false, &runtime);

    let code = orchestrator.interactive_session(true).await.unwrap();

    assert_eq!(code, 130);
    let state = runtime.state();
    let (spec, mounts, cmd) = &state.started[0];
    assert!(spec.interactive);
    assert!(spec.ephemeral);
    assert_eq!(cmd, &vec!["/bin/bash".to_string()]);
    assert_eq!(mounts.len(), 2);
    assert!(state.containers.is_empty());
}

#[tokio::test]
async fn test_registry_without_family() {
    let project = Project::new();
    let runtime = FakeRuntime::new();
    let orchestrator = orchestrator(&project, config(BuildKind::Dev), false, &runtime);

    match SdkRegistry::new().create(orchestrator) {
        Err(BuildError::NoSdkForTarget(target)) => assert_eq!(target, "rpi4b"),
        Err(e) => panic!("Expected NoSdkForTarget, got {:?}", e),
        Ok(_) => panic!("Expected NoSdkForTarget"),
    }
}

fn openwrt(orchestrator: BuildOrchestrator) -> Box<dyn Sdk> {
    Box::new(OpenWrtSdk::new(orchestrator))
}

#[tokio::test]
async fn test_registry_falls_back_to_family() {
    let project = Project::new();
    let runtime = FakeRuntime::new();
    let orchestrator = orchestrator(&project, config(BuildKind::Dev), false, &runtime);

    let mut registry = SdkRegistry::new();
    registry.register_family("openwrt", openwrt);
    let sdk = registry.create(orchestrator).unwrap();

    assert_eq!(sdk.name(), "openwrt");
    assert_eq!(sdk.orchestrator().image_tag(), image_tag("dev"));
}
