//! # unxip CLI
//!
//! Command-line interface for extracting XIP software archives.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use unxip_config::path::{normalize_or_original, prepare_destination, resolve_input};
use unxip_config::{init_logging, log_cli_debug, log_cli_info, log_cli_warn, Config};
use unxip_core::{Unxip, UnxipOptions, UnxipStats, XipError};

/// Extract a .xip archive into a directory
#[derive(Parser, Debug)]
#[command(name = "unxip")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Archive to extract, or `-` to read standard input
    #[arg(value_name = "INPUT", required_unless_present = "show_config")]
    input: Option<String>,

    /// Destination directory (created if missing)
    #[arg(value_name = "OUTPUT", default_value = ".")]
    output: PathBuf,

    /// Decoder and writer threads (default: one per CPU)
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Store files with transparent compression (macOS only)
    #[arg(long)]
    compress: bool,

    /// More output; repeat for more detail
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Less output; repeat to silence warnings
    #[arg(short, long, action = clap::ArgAction::Count)]
    quiet: u8,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    show_config: bool,
}

impl Cli {
    /// Layer command-line flags over the loaded configuration.
    fn apply_to(&self, config: &mut Config) {
        if let Some(threads) = self.threads {
            config.extract.threads = Some(threads);
        }
        if self.compress {
            config.extract.compress = true;
        }
    }
}

fn main() -> Result<()> {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let cli = Cli::parse();
    let mut config = Config::load().context("Failed to load configuration")?;
    cli.apply_to(&mut config);

    let delta = i32::from(cli.verbose) - i32::from(cli.quiet);
    init_logging(config.log.level().shifted(delta));

    if cli.show_config {
        print!(
            "{}",
            toml::to_string_pretty(&config).context("Failed to render configuration")?
        );
        return Ok(());
    }

    let input = cli.input.as_deref().unwrap_or("-");
    let destination = prepare_destination(&cli.output)?;
    let options = extract_options(&config);
    log_cli_debug!(
        "Effective options",
        threads = options.threads,
        compress = options.compress,
        chunk_buffer = options.chunk_buffer,
        record_budget = options.record_budget
    );

    let stats = if input == "-" {
        log_cli_info!("Extracting standard input", destination = %destination.display());
        extract(io::stdin(), "standard input", &destination, options)?
    } else {
        let archive = resolve_input(input)?;
        let file = File::open(&archive)
            .with_context(|| format!("Failed to open archive: {}", archive.display()))?;
        log_cli_info!(
            "Extracting",
            input = %archive.display(),
            destination = %destination.display()
        );
        extract(file, &archive.display().to_string(), &destination, options)?
    };

    report(&stats, &destination);
    Ok(())
}

fn extract_options(config: &Config) -> UnxipOptions {
    let defaults = UnxipOptions::default();
    UnxipOptions {
        threads: config.extract.threads.unwrap_or(defaults.threads).max(1),
        chunk_buffer: config.extract.chunk_buffer.max(1),
        record_budget: config.extract.record_budget.max(1),
        compress: config.extract.compress,
        read_size: config.extract.read_size.max(1),
    }
}

fn extract<R: Read + Send + 'static>(
    input: R,
    name: &str,
    destination: &Path,
    options: UnxipOptions,
) -> Result<UnxipStats> {
    Unxip::new(options).run(input, destination).map_err(|err| {
        let damaged = is_damaged_archive(&err);
        let err = anyhow::Error::new(err).context(format!("Failed to extract {}", name));
        if damaged {
            err.context("The archive looks damaged or incomplete; try downloading it again")
        } else {
            err
        }
    })
}

/// Errors caused by the archive bytes rather than the destination.
fn is_damaged_archive(err: &XipError) -> bool {
    matches!(
        err,
        XipError::TruncatedInput { .. }
            | XipError::CapExceeded { .. }
            | XipError::BadMagic { .. }
            | XipError::MissingContentEntry
            | XipError::MalformedToc(_)
            | XipError::CorruptChunk { .. }
            | XipError::CorruptEntry { .. }
    )
}

fn report(stats: &UnxipStats, destination: &Path) {
    let files = &stats.files;
    log_cli_info!(
        "Extraction complete",
        destination = %normalize_or_original(destination).display(),
        records = stats.records,
        directories = files.directories,
        files = files.files,
        symlinks = files.symlinks,
        hardlinks = files.hardlinks,
        bytes = files.bytes_written,
        secs = stats.duration.as_secs_f64(),
        mib_per_sec = stats.throughput_mib()
    );
    if files.compressed_files > 0 {
        log_cli_info!("Stored with transparent compression", files = files.compressed_files);
    }
    if files.failures > 0 {
        log_cli_warn!("Some entries could not be written", failures = files.failures);
    }
}
