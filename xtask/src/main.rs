//! Automation tasks for the dbkeeper workspace.
//!
//! Run with `cargo xtask <command>`.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

#[derive(Parser)]
#[command(name = "xtask", about = "Automation for the dbkeeper workspace")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run formatting, lints, docs and every test suite
    Ci,
    /// Check formatting
    Fmt {
        /// Rewrite files instead of only checking them
        #[arg(long)]
        fix: bool,
    },
    /// Run clippy on every target, denying warnings
    Clippy,
    /// Run tests
    Test {
        /// Restrict to one crate (e.g. `dbkeeper-pool`)
        #[arg(long, short)]
        package: Option<String>,
    },
    /// Run only the pool/executor/lifecycle scenario suites
    Scenarios,
    /// Build documentation, denying broken intra-doc links
    Doc,
    /// Remove build artifacts
    Clean,
}

const CRATES: &[&str] = &[
    "dbkeeper-retry",
    "dbkeeper-pool",
    "dbkeeper-client",
    "dbkeeper-testing",
];

const SCENARIO_SUITES: &[&str] = &["pool", "executor", "lifecycle"];

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;
    sh.change_dir(workspace_root()?);

    match cli.command {
        Command::Ci => {
            let started = Instant::now();
            step("fmt", || fmt(&sh, false))?;
            step("clippy", || clippy(&sh))?;
            step("doc", || doc(&sh))?;
            step("test", || test(&sh, None))?;
            println!("CI passed in {:.1}s", started.elapsed().as_secs_f64());
        }
        Command::Fmt { fix } => fmt(&sh, fix)?,
        Command::Clippy => clippy(&sh)?,
        Command::Test { package } => test(&sh, package.as_deref())?,
        Command::Scenarios => scenarios(&sh)?,
        Command::Doc => doc(&sh)?,
        Command::Clean => cmd!(sh, "cargo clean").run()?,
    }

    Ok(())
}

fn step(name: &str, run: impl FnOnce() -> Result<()>) -> Result<()> {
    println!("==> {name}");
    let started = Instant::now();
    run().with_context(|| format!("step `{name}` failed"))?;
    println!("<== {name} ({:.1}s)", started.elapsed().as_secs_f64());
    Ok(())
}

fn workspace_root() -> Result<PathBuf> {
    let output = std::process::Command::new(env!("CARGO"))
        .args(["locate-project", "--workspace", "--message-format=plain"])
        .output()
        .context("failed to run cargo locate-project")?;

    let manifest = String::from_utf8(output.stdout).context("invalid UTF-8 in cargo output")?;
    PathBuf::from(manifest.trim())
        .parent()
        .map(PathBuf::from)
        .context("workspace manifest has no parent directory")
}

fn fmt(sh: &Shell, fix: bool) -> Result<()> {
    if fix {
        cmd!(sh, "cargo fmt --all").run()?;
    } else {
        cmd!(sh, "cargo fmt --all -- --check").run()?;
    }
    Ok(())
}

fn clippy(sh: &Shell) -> Result<()> {
    cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;
    Ok(())
}

fn test(sh: &Shell, package: Option<&str>) -> Result<()> {
    match package {
        Some(package) => {
            if !CRATES.contains(&package) {
                bail!("unknown crate `{package}`; expected one of {CRATES:?}");
            }
            cmd!(sh, "cargo test -p {package}").run()?;
        }
        None => cmd!(sh, "cargo test --workspace").run()?,
    }
    Ok(())
}

fn scenarios(sh: &Shell) -> Result<()> {
    for suite in SCENARIO_SUITES {
        step(suite, || {
            cmd!(sh, "cargo test -p dbkeeper-testing --test {suite}").run()?;
            Ok(())
        })?;
    }
    Ok(())
}

fn doc(sh: &Shell) -> Result<()> {
    let _rustdocflags = sh.push_env("RUSTDOCFLAGS", "-D rustdoc::broken_intra_doc_links");
    cmd!(sh, "cargo doc --workspace --no-deps").run()?;
    Ok(())
}
