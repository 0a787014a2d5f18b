//! sdk-builder - build an embedded firmware SDK inside a container
//!
//! On the host this checks out the SDK, stages the image build context,
//! builds the image and retrieves the artifacts; inside the container (see
//! `INSIDE_CONTAINER`) it runs the build scripts.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use convenient_container::{inside_container, runtime_for};
use sdk_builder::app::print_targets;
use sdk_builder::{logging, Action, BuildError, BuildResult, Cli, ErrorCategory, SdkRegistry, Session};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => exit_code(code),
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            if e.category() == ErrorCategory::Precondition {
                eprintln!("Nothing to resume from. Try a full (or --clean) build first.");
            }
            exit_code(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> BuildResult<i32> {
    let root = match &cli.root {
        Some(root) => root.clone(),
        None => std::env::current_dir()?,
    };
    let root: PathBuf = std::path::absolute(root)?;
    let invocation: Vec<String> = std::env::args().collect();
    let session = Session::new(cli, &root, inside_container())?;

    let mut log_file = None;
    let mut cleaned = Vec::new();
    if let Action::Build(_) = session.cli().action() {
        if let Err(e) = session.target() {
            if let BuildError::UnknownTarget { known, .. } = &e {
                print_targets(known);
            }
            return Err(e);
        }
        cleaned = session.clean_workspace()?;
        log_file = session.log_file();
    }

    logging::init(session.cli().verbose_output(), log_file.as_deref())?;
    info!(" ** Invocation: {:?}", invocation);
    if !cleaned.is_empty() {
        info!(" > Cleaned up {:?}", cleaned);
    }

    session
        .run(
            |tech| Ok(runtime_for(tech)?),
            &SdkRegistry::with_defaults(),
        )
        .await
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
