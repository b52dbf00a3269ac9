use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use fwgen_core::config::{ArtifactOptions, BaseImageOptions, MediaArtifactOptions, Toolchain};
use fwgen_core::events::{AssemblyEvent, AssemblyObserver, TracingObserver};
use fwgen_core::pipeline::{Assembler, Collaborators, Flow};
use fwgen_core::profile::{DeviceProfile, PROFILES, enabled_profiles, find_profile};
use fwgen_core::progress::TransferProgress;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "FFU firmware image generator", long_about = None)]
struct Args {
    /// Toolchain configuration (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the bootloader and UEFI payloads
    #[arg(long, global = true, default_value = ".")]
    payload_root: PathBuf,

    /// Only process these variants (repeatable)
    #[arg(long = "variant", global = true)]
    variants: Vec<String>,

    /// Process every variant even after one fails
    #[arg(long, global = true)]
    keep_going: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the base OS image from a blank disk
    Base {
        /// Output disk image
        #[arg(short, long)]
        output: PathBuf,
        /// Root of the extracted OS distribution
        #[arg(short, long)]
        source: PathBuf,
        /// Image index inside install.wim
        #[arg(short, long, default_value_t = 1)]
        index: u32,
    },
    /// Build one FFU per variant from a prepared image
    Artifact {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output_dir: PathBuf,
        #[arg(short, long)]
        driver_pack: PathBuf,
        /// OS build version, e.g. 10.0.15063.0
        #[arg(long = "os-version")]
        os_version: String,
    },
    /// Build one FFU per variant straight from the mounted block device
    Media {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output_dir: PathBuf,
        #[arg(long = "os-version")]
        os_version: String,
    },
    /// List known device variants
    Profiles,
    /// Check prerequisites without touching anything
    Check {
        #[arg(value_enum, default_value_t = FlowArg::Artifact)]
        flow: FlowArg,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FlowArg {
    Base,
    Artifact,
    Media,
}

impl From<FlowArg> for Flow {
    fn from(arg: FlowArg) -> Self {
        match arg {
            FlowArg::Base => Flow::BaseImage,
            FlowArg::Artifact => Flow::Artifact,
            FlowArg::Media => Flow::Media,
        }
    }
}

/// Draws the bootloader transfer bar in place; everything else goes to
/// tracing.
struct ConsoleObserver;

impl AssemblyObserver for ConsoleObserver {
    fn on_event(&self, event: &AssemblyEvent) {
        match event {
            AssemblyEvent::Progress {
                current,
                total,
                elapsed,
                ..
            } => {
                let mut progress = TransferProgress::new(*total);
                progress.advance(*current);

                let mut stderr = std::io::stderr().lock();
                let _ = write!(stderr, "\r{}", progress.render_at(*elapsed));
                if current >= total {
                    let _ = writeln!(stderr);
                }
                let _ = stderr.flush();
            }
            other => TracingObserver.on_event(other),
        }
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    if let Command::Profiles = args.command {
        print_profiles();
        return Ok(());
    }

    let toolchain = match &args.config {
        Some(path) => Toolchain::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Toolchain::default(),
    };

    let collaborators = system_collaborators(&toolchain)?;
    let assembler = Assembler::with_observer(toolchain, collaborators, Arc::new(ConsoleObserver))
        .with_profiles(select_profiles(&args.variants)?)
        .with_payload_root(&args.payload_root)
        .keep_going(args.keep_going);

    match args.command {
        Command::Base {
            output,
            source,
            index,
        } => {
            let path = assembler.build_base_image(&BaseImageOptions {
                output,
                source,
                index,
            })?;
            info!("Base image written to {}", path.display());
        }
        Command::Artifact {
            input,
            output_dir,
            driver_pack,
            os_version,
        } => {
            let summary = assembler.build_artifacts(&ArtifactOptions {
                input,
                output_dir,
                driver_pack,
                version: os_version,
            })?;
            for (variant, path) in summary.artifacts {
                info!("{}: {}", variant, path.display());
            }
        }
        Command::Media {
            input,
            output_dir,
            os_version,
        } => {
            let summary = assembler.build_media_artifacts(&MediaArtifactOptions {
                input,
                output_dir,
                version: os_version,
            })?;
            for (variant, path) in summary.artifacts {
                info!("{}: {}", variant, path.display());
            }
        }
        Command::Check { flow } => {
            assembler.verify_prerequisites(flow.into())?;
            info!("All components present");
        }
        Command::Profiles => unreachable!(),
    }

    Ok(())
}

fn select_profiles(names: &[String]) -> Result<Vec<DeviceProfile>> {
    if names.is_empty() {
        return Ok(enabled_profiles().copied().collect());
    }
    names
        .iter()
        .map(|name| match find_profile(name) {
            Some(profile) => Ok(*profile),
            None => bail!("Unknown variant: {}", name),
        })
        .collect()
}

fn print_profiles() {
    for profile in PROFILES {
        println!(
            "{:<12} {:<8} {:<44} bcd commands: {}",
            profile.name,
            if profile.enabled { "enabled" } else { "disabled" },
            profile.platform_id,
            profile.bcd_commands.len()
        );
    }
}

#[cfg(target_os = "linux")]
fn system_collaborators(toolchain: &Toolchain) -> Result<Collaborators> {
    Ok(Collaborators::system(toolchain))
}

#[cfg(not(target_os = "linux"))]
fn system_collaborators(_toolchain: &Toolchain) -> Result<Collaborators> {
    bail!("Raw device access is only implemented for Linux")
}
