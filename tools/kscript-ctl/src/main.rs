//! kscript-ctl - drive kscript runtimes from the command line
//!
//! Commands:
//! - `kscript-ctl run <script> [--atomic] [--resume N] [ARGS..]` - Spawn a runtime and resume it
//! - `kscript-ctl check <file>` - Compile a script without running it
//! - `kscript-ctl info` - Show the effective configuration

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use colored::Colorize;
use kscript::{Config, Outcome, Registry, Transfer};

#[derive(Parser)]
#[command(name = "kscript-ctl")]
#[command(version)]
#[command(about = "Run and inspect kscript runtimes", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Spawn a runtime from a script and resume its task
    Run {
        /// Script name, resolved as `<script_dir>/<script>.ks`
        script: String,

        /// Run as a non-sleep runtime
        #[arg(short, long)]
        atomic: bool,

        /// Resume the task at most this many times
        #[arg(short, long, default_value_t = 1)]
        resume: usize,

        /// Arguments for the first resume: integers, true, false, nil or strings
        #[arg(allow_negative_numbers = true)]
        args: Vec<String>,
    },

    /// Compile a script and report syntax errors
    Check {
        file: PathBuf,
    },

    /// Show the effective configuration
    Info,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            script,
            atomic,
            resume,
            args,
        } => {
            run_script(&config, &script, atomic, resume, &args)?;
        }

        Commands::Check { file } => {
            check_script(&file)?;
        }

        Commands::Info => {
            show_info(&config)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;
    let config = toml::from_str(&text)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    log::debug!("loaded configuration from {}", path.display());
    Ok(config)
}

fn parse_arg(arg: &str) -> Transfer {
    match arg {
        "nil" => Transfer::Nil,
        "true" => Transfer::Boolean(true),
        "false" => Transfer::Boolean(false),
        _ => arg
            .parse::<i64>()
            .map(Transfer::Integer)
            .unwrap_or_else(|_| Transfer::from(arg)),
    }
}

fn format_values(values: &[Transfer]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\t")
}

fn run_script(
    config: &Config,
    script: &str,
    atomic: bool,
    resumes: usize,
    args: &[String],
) -> anyhow::Result<()> {
    let env = config.environment().with_output(|line| println!("{}", line));
    let memory = env.memory.clone();
    let registry = Registry::new(env)?;

    let sleep = config.sleep && !atomic;
    println!(
        "{} Spawning '{}' ({})",
        "🚀".green(),
        script.bold(),
        if sleep { "sleep" } else { "atomic" }
    );
    registry
        .spawn(script, script, sleep)
        .with_context(|| format!("cannot start '{}'", script))?;

    let mut args: Vec<Transfer> = args.iter().map(|a| parse_arg(a)).collect();
    for i in 1..=resumes {
        match registry.resume(script, &args)? {
            Outcome::Yielded(values) => {
                println!("{} yield {}: {}", "⏸".yellow(), i, format_values(&values));
            }
            Outcome::Returned(values) => {
                println!("{} return: {}", "✅".green(), format_values(&values));
                break;
            }
        }
        args.clear();
    }

    registry.stop(script)?;
    let stats = memory.stats();
    println!(
        "Memory: peak {} bytes, {} allocations, {} failed",
        stats.peak, stats.allocations, stats.failures
    );
    Ok(())
}

fn check_script(file: &Path) -> anyhow::Result<()> {
    let source = fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let chunk = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string());

    match kscript_lang::check(&chunk, &source) {
        Ok(()) => {
            println!("{} {}: ok", "✅".green(), file.display());
            Ok(())
        }
        Err(e) => {
            println!("{} {}", "❌".red(), e);
            anyhow::bail!("{} failed to compile", file.display())
        }
    }
}

fn show_info(config: &Config) -> anyhow::Result<()> {
    println!("{}", "kscript - embedded script runtimes".bold().green());
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("\n{}", "Effective configuration:".italic());
    print!("{}", toml::to_string_pretty(config)?);
    println!("\nCommands:");
    println!("  kscript-ctl run <script>     Spawn a runtime and resume it");
    println!("  kscript-ctl check <file>     Compile a script");
    Ok(())
}
