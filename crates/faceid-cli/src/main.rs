use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use faceid_core::{session, store, EnrollOutcome, LockOutcome};
use faceid_hw::Camera;
use tracing_subscriber::EnvFilter;

mod config;
mod terminal;
mod vision;

use config::Config;
use terminal::TerminalFeedback;
use vision::{Models, Vision};

#[derive(Parser)]
#[command(
    name = "faceid",
    about = "Local face enrollment and unlock",
    after_help = "Press Q during a session to quit."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture your face and store the averaged reference embedding
    Enroll,
    /// Stay locked until your face matches the enrolled reference
    Lock,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let command = match Cli::try_parse() {
        Ok(Cli {
            command: Some(command),
        }) => command,
        _ => {
            Cli::command().print_help()?;
            println!();
            return Ok(());
        }
    };

    let config = Config::load().context("failed to load configuration")?;
    tracing::debug!(?config, "configuration loaded");

    match command {
        Commands::Enroll => run_enroll(&config),
        Commands::Lock => run_lock(&config),
    }
}

fn open_vision_parts(config: &Config) -> Result<(Camera, Models)> {
    let device = config.camera_device();
    let camera = Camera::open(&device).with_context(|| format!("failed to open camera {device}"))?;
    let models = Models::load(config).context("failed to load face models")?;
    Ok((camera, models))
}

fn run_enroll(config: &Config) -> Result<()> {
    let (camera, models) = open_vision_parts(config)?;

    let outcome = {
        let mut vision = Vision::new(&camera, models)?;
        let mut feedback = TerminalFeedback::new();
        session::enroll(&mut vision, &mut feedback, &config.enroll_settings())
    };

    match outcome.context("enrollment failed")? {
        EnrollOutcome::Enrolled { frames, .. } => {
            println!(
                "Enrolled successfully ({frames} frames) -> {}",
                config.enroll_path.display()
            );
        }
        EnrollOutcome::Cancelled => println!("Enrollment cancelled."),
    }
    Ok(())
}

fn run_lock(config: &Config) -> Result<()> {
    let reference = store::load(&config.enroll_path)
        .context("no usable enrollment found; run `faceid enroll` first")?;
    tracing::info!(path = %config.enroll_path.display(), dim = reference.dim(), "reference loaded");

    let (camera, models) = open_vision_parts(config)?;

    let outcome = {
        let mut vision = Vision::new(&camera, models)?;
        let mut feedback = TerminalFeedback::new();
        session::lock(&mut vision, &mut feedback, &reference, &config.lock_settings())
    };

    match outcome {
        LockOutcome::Unlocked { .. } => println!("Unlocked."),
        LockOutcome::Cancelled => println!("Lock cancelled."),
        LockOutcome::CaptureEnded { frames } => {
            bail!("camera stream ended after {frames} frames without a match")
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["faceid", "enroll"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Enroll)));
        let cli = Cli::try_parse_from(["faceid", "lock"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Lock)));
    }

    #[test]
    fn test_cli_without_subcommand() {
        let cli = Cli::try_parse_from(["faceid"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_rejects_extra_arguments() {
        assert!(Cli::try_parse_from(["faceid", "unlock"]).is_err());
        assert!(Cli::try_parse_from(["faceid", "enroll", "--label", "me"]).is_err());
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }
}
