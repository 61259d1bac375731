use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use facegate_core::{codec, Config, FaceError, FaceService};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "facegate", version, about = "Face enrollment and matching against a reference directory")]
struct Cli {
    /// Reference image directory (overrides FACEGATE_STORE_DIR and the config file)
    #[arg(long, global = true, value_name = "DIR")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a reference image for a resident
    Register {
        resident_id: String,
        /// Base64 image, optionally with a data: URI prefix, or @FILE
        image: String,
    },
    /// Check an image against one resident's reference
    Verify { resident_id: String, image: String },
    /// Search every reference for the best match
    Find { image: String },
    /// Rank every reference by distance to the image
    Search { image: String },
    /// Delete a resident's reference
    Remove { resident_id: String },
    /// List enrolled residents
    List,
}

/// JSON printed on stdout plus the process exit code.
#[derive(Debug)]
struct Outcome {
    body: Value,
    code: u8,
}

impl Outcome {
    fn ok(body: Value) -> Self {
        Self { body, code: 0 }
    }

    fn failed(body: Value) -> Self {
        Self { body, code: 1 }
    }

    fn error(message: impl std::fmt::Display) -> Self {
        Self::failed(json!({ "error": message.to_string() }))
    }
}

fn main() -> ExitCode {
    // stdout carries exactly one JSON object; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            println!("{}", json!({ "error": e.to_string().trim() }));
            return ExitCode::from(2);
        }
    };

    let outcome = match open_service(cli.store) {
        Ok(mut service) => execute(&mut service, cli.command),
        Err(e) => Outcome::error(format!("{e:#}")),
    };
    println!("{}", outcome.body);
    ExitCode::from(outcome.code)
}

impl Command {
    /// Replace `@FILE` image arguments with the file's contents as a data URI.
    fn load_image_files(self) -> Result<Self, FaceError> {
        Ok(match self {
            Command::Register { resident_id, image } => Command::Register {
                resident_id,
                image: read_image_arg(image)?,
            },
            Command::Verify { resident_id, image } => Command::Verify {
                resident_id,
                image: read_image_arg(image)?,
            },
            Command::Find { image } => Command::Find { image: read_image_arg(image)? },
            Command::Search { image } => Command::Search { image: read_image_arg(image)? },
            other => other,
        })
    }
}

fn read_image_arg(arg: String) -> Result<String, FaceError> {
    let Some(path) = arg.strip_prefix('@') else {
        return Ok(arg);
    };
    let bytes = std::fs::read(path)
        .map_err(|e| FaceError::InvalidImage(format!("{path}: {e}")))?;
    tracing::debug!(path, bytes = bytes.len(), "read image file");
    // The decoder sniffs the container, so the mime type is informational.
    Ok(codec::to_data_uri(&bytes, "application/octet-stream"))
}

fn open_service(store: Option<PathBuf>) -> Result<FaceService> {
    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(store) = store {
        config.store_dir = store;
    }
    tracing::debug!(
        store = %config.store_dir.display(),
        model = %config.model,
        "opening face service"
    );
    FaceService::from_config(&config).context("failed to initialize face service")
}

fn execute(service: &mut FaceService, command: Command) -> Outcome {
    let command = match command.load_image_files() {
        Ok(command) => command,
        Err(e) => return Outcome::error(e),
    };
    match command {
        Command::Register { resident_id, image } => match service.enroll(&resident_id, &image) {
            Ok(enrollment) => Outcome::ok(json!({
                "success": true,
                "image_path": enrollment.stored_path.display().to_string(),
            })),
            Err(e) => Outcome::error(e),
        },
        Command::Verify { resident_id, image } => match service.verify(&resident_id, &image) {
            Ok(decision) => Outcome::ok(json!({
                "verified": decision.accepted,
                "confidence": decision.confidence,
                "distance": decision.distance,
                "threshold": service.matcher().policy().threshold(),
            })),
            Err(e @ FaceError::IdentityNotFound(_)) => Outcome::failed(json!({
                "verified": false,
                "confidence": 0.0,
                "error": e.to_string(),
            })),
            Err(e) => Outcome::error(e),
        },
        Command::Find { image } => match service.identify(&image) {
            Ok(decision) if decision.accepted => Outcome::ok(json!({
                "found": true,
                "resident_id": decision.candidate,
                "confidence": decision.confidence,
                "distance": decision.distance,
            })),
            Ok(decision) => Outcome::ok(json!({
                "found": false,
                "confidence": decision.confidence,
            })),
            Err(e) => Outcome::error(e),
        },
        Command::Search { image } => match service.search(&image) {
            Ok(ranked) => {
                let policy = service.matcher().policy();
                let candidates: Vec<Value> = ranked
                    .iter()
                    .map(|c| {
                        json!({
                            "resident_id": c.key,
                            "distance": c.distance,
                            "confidence": policy.confidence(c.distance),
                            "accepted": policy.accepts(c.distance),
                        })
                    })
                    .collect();
                Outcome::ok(json!({ "count": candidates.len(), "candidates": candidates }))
            }
            Err(e) => Outcome::error(e),
        },
        Command::Remove { resident_id } => match service.remove(&resident_id) {
            Ok(removed) => Outcome::ok(json!({ "removed": removed })),
            Err(e) => Outcome::error(e),
        },
        Command::List => match service.residents() {
            Ok(residents) => Outcome::ok(json!({
                "count": residents.len(),
                "residents": residents,
            })),
            Err(e) => Outcome::error(e),
        },
    }
}
