use std::{fs, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use espflasher::{
    connection::{connect_port, detect_device, Connection},
    error::Error,
    flasher::pad_to_sector,
    progress::ProgressCallbacks,
    Flasher,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use miette::{bail, Result};

#[derive(Debug, Parser)]
#[clap(about, propagate_version = true, version)]
struct Cli {
    #[clap(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Flash one or more images to a target device
    Flash(FlashArgs),
    /// Reset the target device without flashing
    Reset(ConnectArgs),
}

#[derive(Debug, Args)]
struct ConnectArgs {
    /// Serial port to use; every port is probed when omitted
    #[clap(short, long)]
    port: Option<String>,
}

#[derive(Debug, Args)]
struct FlashArgs {
    #[clap(flatten)]
    connect_args: ConnectArgs,

    /// Only rewrite the flash regions that changed since the last run,
    /// using the `<image>.flashed` copy kept next to each image
    #[clap(long)]
    incremental: bool,

    /// Alternating hex address and image file pairs,
    /// e.g. `0x00000 boot.bin 0x40000 app.bin`
    #[clap(required = true, num_args = 1..)]
    images: Vec<String>,
}

struct FlashTarget {
    address: u32,
    path: PathBuf,
}

fn main() -> Result<()> {
    miette::set_panic_hook();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    match Cli::parse().subcommand {
        Commands::Flash(args) => flash(args),
        Commands::Reset(args) => reset(args),
    }
}

fn connect(args: &ConnectArgs) -> Result<Connection, Error> {
    match &args.port {
        Some(port) => connect_port(port),
        None => detect_device(),
    }
}

fn flash(args: FlashArgs) -> Result<()> {
    let targets = parse_targets(&args.images)?;

    let connection = connect(&args.connect_args)?;
    let mut flasher = Flasher::new(connection);
    let mut progress = FlashProgress::default();

    for target in &targets {
        let data = fs::read(&target.path)
            .map_err(|err| Error::FileOpen(target.path.display().to_string(), err))?;

        let cache = cache_path(&target.path);
        let previous = if args.incremental {
            fs::read(&cache).ok()
        } else {
            None
        };

        info!(
            "flashing {} at {:#010x}",
            target.path.display(),
            target.address
        );
        flasher.flash_image(
            &data,
            target.address,
            previous.as_deref(),
            Some(&mut progress),
        )?;

        if args.incremental {
            if let Err(err) = fs::write(&cache, pad_to_sector(&data)) {
                warn!("failed to update {}: {err}", cache.display());
            }
        }
    }

    flasher.finish(true)?;
    info!("flashing done");

    Ok(())
}

fn reset(args: ConnectArgs) -> Result<()> {
    let mut connection = connect(&args)?;
    connection.hard_reset()?;
    info!("device reset");

    Ok(())
}

/// Parses the positional `ADDRESS IMAGE` pairs.
fn parse_targets(images: &[String]) -> Result<Vec<FlashTarget>> {
    if images.len() % 2 != 0 {
        bail!("each address needs a corresponding image file");
    }

    let mut targets = Vec::with_capacity(images.len() / 2);
    for pair in images.chunks_exact(2) {
        let raw = pair[0].trim_start_matches("0x").trim_start_matches("0X");
        let Ok(address) = u32::from_str_radix(raw, 16) else {
            bail!("{} is not a hex address", pair[0]);
        };
        targets.push(FlashTarget {
            address,
            path: PathBuf::from(&pair[1]),
        });
    }

    Ok(targets)
}

fn cache_path(image: &PathBuf) -> PathBuf {
    let mut cache = image.clone().into_os_string();
    cache.push(".flashed");
    PathBuf::from(cache)
}

#[derive(Default)]
struct FlashProgress {
    bar: Option<ProgressBar>,
}

impl ProgressCallbacks for FlashProgress {
    fn init(&mut self, addr: u32, total: usize) {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template("[{bar:40}] {pos:>4}/{len:4} {msg}")
                .expect("valid progress template")
                .progress_chars("=> "),
        );
        bar.set_message(format!("{addr:#010x}"));
        self.bar = Some(bar);
    }

    fn update(&mut self, current: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
