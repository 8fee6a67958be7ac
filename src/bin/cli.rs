use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use npmioc::config::{Config, CONFIG_FILE_NAME};
use npmioc::error::ScanError;
use npmioc::output::OutputFormat;
use npmioc::signature::ProfileLoader;
use npmioc::telemetry::{ProgressSink, ScanProgress};
use npmioc::ScanOptions;

#[derive(Parser)]
#[command(
    name = "npmioc",
    about = "Scan projects for npm supply-chain malware indicators",
    version,
    author
)]
struct Cli {
    /// Verbose logging (overridden by RUST_LOG)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan directories for indicators of compromise
    Scan {
        /// Directories or files to scan
        #[arg(default_value = ".")]
        paths: Vec<PathBuf>,

        /// Signature pack id or manifest path
        #[arg(long, short = 'p')]
        profile: Option<String>,

        /// Skip path components containing this substring (repeatable)
        #[arg(long, short = 'e')]
        exclude: Vec<String>,

        /// Worker threads
        #[arg(long, short = 't')]
        threads: Option<usize>,

        /// Maximum directory depth
        #[arg(long)]
        max_depth: Option<usize>,

        /// Bytes read from non-lockfile files above this size
        #[arg(long)]
        max_bytes: Option<u64>,

        /// Output format (console, json)
        #[arg(long, short = 'f')]
        format: Option<String>,

        /// Write output to file instead of stdout
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,

        /// Config file path
        #[arg(long, short = 'c', env = "NPMIOC_CONFIG")]
        config: Option<PathBuf>,

        /// Print progress to stderr
        #[arg(long)]
        progress: bool,
    },

    /// List the built-in signature packs
    ListProfiles,

    /// List the signatures of a resolved profile
    ListSignatures {
        /// Signature pack id or manifest path
        #[arg(long, short = 'p', default_value = "default")]
        profile: String,

        /// Output format (table, json)
        #[arg(long, short = 'f', default_value = "table")]
        format: String,

        /// Config file path
        #[arg(long, short = 'c', env = "NPMIOC_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Generate a starter .npmioc.toml config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
}

struct ScanArgs {
    paths: Vec<PathBuf>,
    profile: Option<String>,
    exclude: Vec<String>,
    threads: Option<usize>,
    max_depth: Option<usize>,
    max_bytes: Option<u64>,
    format: Option<String>,
    output: Option<PathBuf>,
    config: Option<PathBuf>,
    progress: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Scan {
            paths,
            profile,
            exclude,
            threads,
            max_depth,
            max_bytes,
            format,
            output,
            config,
            progress,
        } => cmd_scan(ScanArgs {
            paths,
            profile,
            exclude,
            threads,
            max_depth,
            max_bytes,
            format,
            output,
            config,
            progress,
        }),
        Commands::ListProfiles => cmd_list_profiles(),
        Commands::ListSignatures {
            profile,
            format,
            config,
        } => cmd_list_signatures(profile, format, config),
        Commands::Init { force } => cmd_init(force),
    };

    match result {
        Ok(exit_code) => process::exit(exit_code),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(e.exit_code());
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .init();
}

fn cmd_scan(args: ScanArgs) -> Result<i32, ScanError> {
    let config_path = Config::path_or_default(args.config.clone());
    let config = Config::load(&config_path)?;

    let format = match &args.format {
        Some(s) => OutputFormat::from_str_lenient(s).unwrap_or_else(|| {
            eprintln!("Warning: unknown format '{}', using console", s);
            OutputFormat::Console
        }),
        None => config.report.format,
    };

    let options = ScanOptions {
        roots: args.paths,
        config_path: Some(config_path),
        profile: args.profile,
        excludes: args.exclude,
        threads: args.threads,
        max_depth: args.max_depth,
        max_bytes: args.max_bytes,
        progress: args.progress.then(progress_printer),
    };

    let report = npmioc::scan_with_config(&config, &options)?;
    let rendered = npmioc::render_report(&report, format)?;

    match args.output {
        Some(out) => std::fs::write(&out, &rendered)?,
        None => print!("{}", rendered),
    }

    // Exit code: 0 = clean, 1 = detections, 2 = errors only
    Ok(report.outcome().exit_code())
}

/// Progress lines on stderr, at most four per second.
fn progress_printer() -> ProgressSink {
    let last = Mutex::new(None::<Instant>);
    Arc::new(move |p: &ScanProgress| {
        let Ok(mut last) = last.lock() else {
            return;
        };
        let due = last.map_or(true, |t| t.elapsed() >= Duration::from_millis(250));
        if due || p.in_flight == 0 {
            *last = Some(Instant::now());
            eprintln!(
                "  scanned {} files ({} bytes), {} detections, {} errors, {} busy / {} queued, {:.1}s",
                p.files_scanned,
                p.bytes_read,
                p.detections,
                p.errors,
                p.busy_workers,
                p.queued,
                p.elapsed.as_secs_f64(),
            );
        }
    })
}

fn cmd_list_profiles() -> Result<i32, ScanError> {
    let mut loader = ProfileLoader::new();
    println!("{:<14} TITLE", "ID");
    println!("{}", "-".repeat(60));
    for (id, title) in loader.builtin_profiles() {
        println!("{:<14} {}", id, title.as_deref().unwrap_or("-"));
    }
    Ok(0)
}

fn cmd_list_signatures(
    profile: String,
    format_str: String,
    config: Option<PathBuf>,
) -> Result<i32, ScanError> {
    let config = Config::load(&Config::path_or_default(config))?;
    let mut loader = ProfileLoader::new().with_profile_dirs(config.scan.profile_dirs);
    let compiled = loader.load(&profile)?;
    let signatures = compiled.declared_signatures();

    match format_str.as_str() {
        "json" => {
            let json = serde_json::to_string_pretty(signatures)?;
            println!("{}", json);
        }
        _ => {
            println!(
                "{:<40} {:<10} {:<6} TITLE",
                "ID", "SEVERITY", "IOCS"
            );
            println!("{}", "-".repeat(90));
            for sig in signatures {
                println!(
                    "{:<40} {:<10} {:<6} {}",
                    sig.id,
                    sig.severity.to_string(),
                    sig.indicators.len(),
                    sig.title,
                );
            }
        }
    }

    Ok(0)
}

fn cmd_init(force: bool) -> Result<i32, ScanError> {
    let path = PathBuf::from(CONFIG_FILE_NAME);

    if path.exists() && !force {
        eprintln!("{} already exists. Use --force to overwrite.", CONFIG_FILE_NAME);
        return Ok(1);
    }

    std::fs::write(&path, Config::starter_toml())?;
    println!("Created {}", CONFIG_FILE_NAME);

    Ok(0)
}
