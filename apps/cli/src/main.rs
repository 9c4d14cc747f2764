use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use mexfer_core::{
    Backend, CommPath, FirmwareSource, FlashOptions, RebootOutcome, SessionConfig, TerminalSession,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "ME terminal file transfer and firmware upgrade tool", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Transport backend (overrides the configuration file)
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendArg>,

    /// Terminal communication path, e.g. 10.0.0.5 or 10.0.0.2,1,0,2,10.1.1.5
    #[arg(long = "host", required = true)]
    hosts: Vec<CommPath>,

    /// Continue with terminals that fail validation
    #[arg(long, global = true)]
    ignore_invalid: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum BackendArg {
    Enip,
    Mock,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Enip => Backend::Enip,
            BackendArg::Mock => Backend::Mock,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Show identity, versions and generation
    Info,
    /// Download a runtime file to the terminal
    Download {
        file: PathBuf,
        /// Replace an existing file
        #[arg(long)]
        overwrite: bool,
    },
    /// Upload a runtime file from the terminal
    Upload {
        name: String,
        dest: PathBuf,
        /// Replace an existing local file
        #[arg(long)]
        overwrite: bool,
    },
    /// List the runtime files on the terminal
    List,
    /// Reboot the terminal
    Reboot,
    /// Upgrade the terminal firmware
    Flash(FlashArgs),
}

#[derive(Args, Debug, Clone)]
#[command(group(ArgGroup::new("source").required(true).args(["legacy", "card_image", "dmk"])))]
struct FlashArgs {
    /// Folder with a legacy (ME 5 and older) upgrade
    #[arg(long)]
    legacy: Option<PathBuf>,

    /// SC.IMG card image (ME 6 and newer)
    #[arg(long)]
    card_image: Option<PathBuf>,

    /// DMK card update archive
    #[arg(long)]
    dmk: Option<PathBuf>,

    /// Firmware helper DLL to stage if the terminal lacks one
    #[arg(long)]
    helper: Option<PathBuf>,

    /// Check the package and terminal without writing anything
    #[arg(long)]
    dry_run: bool,
}

impl FlashArgs {
    fn source(&self) -> Option<FirmwareSource> {
        self.legacy
            .clone()
            .map(FirmwareSource::Legacy)
            .or_else(|| self.card_image.clone().map(FirmwareSource::CardImage))
            .or_else(|| self.dmk.clone().map(FirmwareSource::Dmk))
    }
}

struct Report {
    host: CommPath,
    outcome: Result<String>,
    log: Vec<String>,
}

fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load_from_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(backend) = cli.backend {
        config.backend = backend.into();
    }
    if cli.ignore_invalid {
        config.ignore_invalid = true;
    }
    Ok(config)
}

/// Local destination of an upload; one file per terminal when several run.
fn upload_destination(dest: &Path, host: &CommPath, many: bool) -> PathBuf {
    if !many {
        return dest.to_path_buf();
    }
    let prefix: String = host
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect();
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!("{}_{}", prefix, name))
}

fn run_terminal(config: SessionConfig, host: CommPath, command: &Command, many: bool) -> Report {
    let mut session = TerminalSession::connect(config.clone(), host.clone());
    let mut unconfirmed = false;
    let outcome = match command {
        Command::Info => session.info().map(|info| info.to_string()),
        Command::Download { file, overwrite } => session
            .download(file, *overwrite)
            .map(|r| format!("Downloaded {} bytes to {}", r.size, r.remote_path)),
        Command::Upload {
            name,
            dest,
            overwrite,
        } => {
            let dest = upload_destination(dest, &host, many);
            session
                .upload(name, &dest, *overwrite)
                .map(|r| format!("Uploaded {} bytes to {}", r.size, dest.display()))
        }
        Command::List => session.list_files().map(|files| files.join("\n")),
        Command::Reboot => session.reboot().map(|outcome| {
            unconfirmed = matches!(outcome, RebootOutcome::Acknowledged);
            format!("Reboot {}", outcome.status())
        }),
        Command::Flash(args) => match args.source() {
            Some(source) => {
                let options = FlashOptions::from_config(&config)
                    .with_helper(args.helper.clone())
                    .dry_run(args.dry_run);
                session.flash(&source, &options).map(|()| {
                    if args.dry_run {
                        "Dry run finished, nothing written".to_string()
                    } else {
                        format!("Firmware from {} sent", source)
                    }
                })
            }
            None => Ok("No firmware source given".to_string()),
        },
    };
    // An unconfirmed reboot counts as a failure in the batch summary.
    let outcome = outcome.map_err(anyhow::Error::from).and_then(|summary| {
        if unconfirmed {
            Err(anyhow::anyhow!(
                "{}: the terminal replied instead of disconnecting",
                summary
            ))
        } else {
            Ok(summary)
        }
    });
    Report {
        host,
        outcome,
        log: session.log().entries().to_vec(),
    }
}

fn main() -> ExitCode {
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

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {}", e);
    }

    let config = match load_config(&cli).context("loading configuration") {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(terminals = cli.hosts.len(), backend = ?config.backend, "Starting mexfer");

    let many = cli.hosts.len() > 1;
    let reports: Vec<Report> = std::thread::scope(|scope| {
        let workers: Vec<_> = cli
            .hosts
            .iter()
            .map(|host| {
                let config = config.clone();
                let command = &cli.command;
                scope.spawn(move || run_terminal(config, host.clone(), command, many))
            })
            .collect();
        workers
            .into_iter()
            .zip(&cli.hosts)
            .map(|(worker, host)| {
                worker.join().unwrap_or_else(|_| Report {
                    host: host.clone(),
                    outcome: Err(anyhow::anyhow!("worker thread panicked")),
                    log: Vec::new(),
                })
            })
            .collect()
    });

    let mut failed = 0;
    for report in reports {
        println!("=== {} ===", report.host);
        for line in &report.log {
            println!("  {}", line);
        }
        match report.outcome {
            Ok(summary) => println!("{}", summary),
            Err(e) => {
                failed += 1;
                error!(host = %report.host, "{:#}", e);
                println!("FAILED: {:#}", e);
            }
        }
    }

    if failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
