use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use qdl_core::{
    DeviceRegistry, Mode, ProgressEvent, QdlEvent, QdlObserver, Session, SessionConfig, Status,
    StorageType, TracingObserver,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Qualcomm EDL flashing tool (Pure Rust)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List devices in EDL mode
    List,
    /// Flash images described by rawprogram/patch scripts
    Flash(RunArgs),
    /// Provision storage (e.g. UFS LUN layout) from XML
    Provision(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Firehose programmer (prog_firehose_*.mbn / .elf)
    programmer: Option<PathBuf>,

    /// XML scripts, executed in order
    scripts: Vec<PathBuf>,

    /// Serial of the target device (default: first found)
    #[arg(long)]
    serial: Option<String>,

    /// Storage type: emmc, nand, ufs, nvme, spinor
    #[arg(long)]
    storage: Option<StorageType>,

    /// Directory searched first for images
    #[arg(long = "include", short = 'i')]
    include_dir: Option<PathBuf>,

    /// Skip directives whose image is missing
    #[arg(long)]
    allow_missing: bool,

    /// Transfer chunk size in bytes
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Leave the device in Firehose after a successful run
    #[arg(long)]
    no_reset: bool,

    /// Session defaults from a TOML file; flags override it
    #[arg(long)]
    config: Option<PathBuf>,
}

impl RunArgs {
    fn into_config(self, mode: Mode) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load_from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => SessionConfig::default(),
        };
        config.mode = mode;
        if let Some(programmer) = self.programmer {
            config.programmer = Some(programmer);
        }
        if !self.scripts.is_empty() {
            config.scripts = self.scripts;
        }
        if self.serial.is_some() {
            config.serial = self.serial;
        }
        if let Some(storage) = self.storage {
            config.storage = storage;
        }
        if self.include_dir.is_some() {
            config.include_dir = self.include_dir;
        }
        if self.chunk_size.is_some() {
            config.out_chunk_size = self.chunk_size;
        }
        config.allow_missing |= self.allow_missing;
        if self.no_reset {
            config.reset_on_success = false;
        }
        Ok(config)
    }
}

/// Prints progress to stderr in 10% steps; everything else goes to tracing.
struct ConsoleObserver {
    last: Mutex<Option<(String, u64)>>,
}

impl QdlObserver for ConsoleObserver {
    fn on_event(&self, event: &QdlEvent) {
        match event {
            QdlEvent::Progress(p) if !p.is_advisory() => self.progress(p),
            other => TracingObserver.on_event(other),
        }
    }
}

impl ConsoleObserver {
    fn progress(&self, p: &ProgressEvent) {
        let pct = if p.total > 0 { p.value * 100 / p.total } else { 0 };
        let step = pct / 10;
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let changed = match last.as_ref() {
            Some((task, prev)) => task != &p.task || *prev != step,
            None => true,
        };
        if changed {
            eprintln!("{:>24}: {:>3}% ({}/{})", p.task, pct, p.value, p.total);
            *last = Some((p.task.clone(), step));
        }
    }
}

fn list() -> Result<i32> {
    let devices = DeviceRegistry::usb()
        .list_devices(usize::MAX)
        .context("scanning USB devices")?;
    if devices.is_empty() {
        info!("No devices in EDL mode");
    }
    for device in devices {
        println!("{}\t{}", device.serial, device.product);
    }
    Ok(0)
}

fn run(mode: Mode, args: RunArgs) -> Result<i32> {
    let config = args.into_config(mode)?;
    let observer = Arc::new(ConsoleObserver {
        last: Mutex::new(None),
    });
    let mut session = Session::with_observer(config, DeviceRegistry::usb(), observer);
    match session.run() {
        Ok(summary) => {
            info!(
                completed = summary.completed,
                skipped = summary.skipped,
                bytes = summary.bytes,
                "Done"
            );
            Ok(0)
        }
        Err(e) => {
            let status = e.status(mode);
            error!("Error: {}", e);
            Ok(status.code())
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let result = match cli.command {
        Command::List => list(),
        Command::Flash(args) => run(Mode::Flash, args),
        Command::Provision(args) => run(Mode::Provision, args),
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            error!("Error: {:#}", e);
            Status::Generic.code()
        }
    };
    if code != Status::Ok.code() {
        // Status codes are negative; exit codes are not.
        std::process::exit(code.unsigned_abs() as i32);
    }
}
