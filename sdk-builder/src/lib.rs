//! SDK builder - staged, containerized builds of embedded firmware SDKs
//!
//! The builder runs twice per full build: once on the host, where it checks
//! out the SDK, populates the staging tree and builds the container image,
//! and once inside that image, where it runs the build scripts. Both runs
//! read the same step list; [`dispatcher::dispatch`] picks the steps for
//! the context the process finds itself in.
//!
//! ## Architecture
//!
//! - **convenient-paths**: one label table resolved per context
//!   (`host`, `container`, `staging`), see [`layout`]
//! - **convenient-container**: the runtime contract and a docker/podman
//!   backend
//! - **convenient-git**: SDK checkout
//! - [`orchestrator::BuildOrchestrator`]: the build lifecycle
//! - [`sdk`]: SDK families on top of the orchestrator, chosen per target

pub mod app;
pub mod archive;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod environment;
pub mod error;
pub mod layout;
pub mod logging;
pub mod orchestrator;
pub mod scripts;
pub mod sdk;
pub mod staging;

pub use app::Session;
pub use cli::{Action, BuildAction, Cli};
pub use config::{BuildConfig, BuildKind, BuildSpec, DeveloperConfig, Step, StepList};
pub use dispatcher::{dispatch, BuildTask, TaskRunner};
pub use error::{BuildError, BuildResult, ErrorCategory};
pub use orchestrator::BuildOrchestrator;
pub use sdk::{OpenWrtSdk, Sdk, SdkRegistry};
