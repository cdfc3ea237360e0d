use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the workspace
    Build,
    /// Run all tests
    Test,
    /// Build the bridge library in release mode and collect it with its header
    Dist {
        /// Output directory
        #[arg(long, default_value = "target/dist")]
        out: PathBuf,
    },
    /// Run the CLI, passing the remaining arguments through
    Run {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn cargo(args: &[&str]) -> Result<()> {
    let status = Command::new(std::env::var("CARGO").unwrap_or_else(|_| "cargo".into()))
        .args(args)
        .status()?;
    if !status.success() {
        anyhow::bail!("cargo {} failed", args.join(" "));
    }
    Ok(())
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn dist(out: &Path) -> Result<()> {
    cargo(&["build", "--release", "-p", "qdl-bridge"])?;

    let root = workspace_root();
    let out = root.join(out);
    fs::create_dir_all(&out).with_context(|| format!("creating {}", out.display()))?;

    let release = root.join("target").join("release");
    let candidates = [
        "libqdl_bridge.a",
        "libqdl_bridge.so",
        "libqdl_bridge.dylib",
        "qdl_bridge.dll",
        "qdl_bridge.lib",
    ];
    let mut copied = 0;
    for name in candidates {
        let src = release.join(name);
        if src.is_file() {
            fs::copy(&src, out.join(name)).with_context(|| format!("copying {}", src.display()))?;
            copied += 1;
        }
    }
    if copied == 0 {
        anyhow::bail!("no bridge library found in {}", release.display());
    }

    let header = root.join("crates/qdl-bridge/include/qdl-bridge.h");
    fs::copy(&header, out.join("qdl-bridge.h"))
        .with_context(|| format!("copying {}", header.display()))?;
    println!("Bridge library and header written to {}", out.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            cargo(&["build", "--workspace"])?;
        }
        Commands::Test => {
            println!("Testing project...");
            cargo(&["test", "--workspace"])?;
        }
        Commands::Dist { out } => dist(out)?,
        Commands::Run { args } => {
            println!("Running CLI...");
            let mut full = vec!["run", "-p", "qdl-cli", "--"];
            full.extend(args.iter().map(String::as_str));
            cargo(&full)?;
        }
    }

    Ok(())
}
