use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use volkey::crypto::Backend;
use volkey::maintenance::{self, HeaderInfo, RestoreSource, UpgradeOutcome};
use volkey::{CipherEngine, CpuFeatures, Detached, FileVolume, KdfAlgorithm, KdfParams};

mod terminal;
use terminal::TerminalPort;

#[derive(Debug, clap::Args)]
struct Argon2Args {
    /// Argon2 memory cost in KiB (default: 65536)
    #[arg(long = "argon-mem")]
    mem_cost_kib: Option<u32>,

    /// Argon2 time cost / iterations (default: 3)
    #[arg(long = "argon-time")]
    time_cost: Option<u32>,

    /// Argon2 parallelism (default: 4)
    #[arg(long = "argon-parallelism")]
    parallelism: Option<u32>,
}

impl Argon2Args {
    fn to_kdf_params(&self) -> Result<KdfParams> {
        let default = KdfParams::default();

        Ok(KdfParams::argon2id(
            self.mem_cost_kib.unwrap_or(default.mem_cost_kib()),
            self.time_cost.unwrap_or(default.time_cost()),
            self.parallelism.unwrap_or(default.parallelism()),
        )?)
    }
}

#[derive(Debug, Parser)]
#[command(name = "volkey")]
#[command(
    version,
    about = "Volume header maintenance: Argon2 key derivation, header backup, restore and KDF upgrade."
)]
struct Cli {
    /// Path to the volume file
    #[arg(long, global = true, value_name = "PATH", env = "VOLKEY_VOLUME")]
    volume: Option<PathBuf>,

    /// Keyfile combined with the password; repeat for several, order matters
    #[arg(long = "keyfile", global = true, value_name = "PATH")]
    keyfiles: Vec<PathBuf>,

    /// Answer yes to every confirmation
    #[arg(short, long, global = true)]
    yes: bool,

    /// Use the portable AES implementation even when AES-NI is available
    #[arg(long, global = true)]
    software_aes: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Creates a new volume file with fresh headers
    Create {
        /// Size of the data area in bytes
        #[arg(long, default_value_t = 1024 * 1024)]
        size: u64,

        #[command(flatten)]
        argon2: Argon2Args,
    },

    /// Shows the cleartext header parameters
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Saves the volume headers to a backup file
    Backup {
        /// Backup file (default: platform data directory)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Restores the volume header from a backup
    Restore {
        /// Restore from an external backup file
        #[arg(long, value_name = "PATH", conflicts_with = "embedded")]
        from_file: Option<PathBuf>,

        /// Restore from the backup header embedded in the volume
        #[arg(long)]
        embedded: bool,
    },

    /// Re-wraps the header key under stronger key derivation parameters
    UpgradeKdf {
        #[command(flatten)]
        argon2: Argon2Args,
    },
}

#[derive(Serialize)]
struct InfoReport<'a> {
    volume: &'a Path,
    data_size: u64,
    aes_backend: Backend,
    #[serde(flatten)]
    header: HeaderInfo,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn install_interrupt_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    let installed = ctrlc::set_handler(move || {
        // a second interrupt leaves immediately
        if handler_flag.swap(true, Ordering::SeqCst) {
            std::process::exit(2);
        }
    });
    if let Err(err) = installed {
        tracing::warn!(%err, "cannot install interrupt handler");
    }
    flag
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if is_cancelled(&err) => {
            eprintln!("cancelled");
            ExitCode::from(2)
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn is_cancelled(err: &anyhow::Error) -> bool {
    err.downcast_ref::<volkey::Error>()
        .is_some_and(volkey::Error::is_cancelled)
}

fn run(cli: Cli) -> Result<()> {
    let engine = if cli.software_aes {
        CipherEngine::software()
    } else {
        CipherEngine::new(CpuFeatures::detect())
    };
    let volume_path = cli
        .volume
        .clone()
        .context("no volume given; use --volume or VOLKEY_VOLUME")?;
    let port = TerminalPort::new(cli.yes, cli.keyfiles, install_interrupt_flag());

    match cli.command {
        Commands::Create { size, argon2 } => {
            let params = argon2.to_kdf_params()?;
            let mut volume = FileVolume::create(&volume_path, size)?;
            let mut port = port;
            if let Err(err) = maintenance::format_volume(&mut port, &mut volume, &engine, params, size) {
                let _ = std::fs::remove_file(&volume_path);
                return Err(err).context("failed to create volume");
            }
            println!("volume created");
        }
        Commands::Info { json } => {
            let mut volume = FileVolume::open(&volume_path)?;
            let header = maintenance::inspect(&mut volume, &KdfParams::default())?;
            let report = InfoReport {
                volume: &volume_path,
                data_size: volume.data_size(),
                aes_backend: engine.backend(),
                header,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_info(&report);
            }
        }
        Commands::Backup { output } => {
            let output = match output {
                Some(path) => path,
                None => default_backup_path(&volume_path)?,
            };
            let mut volume = FileVolume::open(&volume_path)?;
            let mut port = port.with_file(Some(output));
            let saved = maintenance::backup_headers(&mut port, &mut volume, &engine)?;
            println!("header backup saved to {}", saved.display());
        }
        Commands::Restore {
            from_file,
            embedded,
        } => {
            let choice = match (&from_file, embedded) {
                (_, true) => Some(0),
                (Some(_), false) => Some(1),
                (None, false) => None,
            };
            let mut volume = FileVolume::open(&volume_path)?;
            let mut port = port.with_file(from_file).with_choice(choice);
            match maintenance::restore_headers(&mut port, &mut volume, &engine)? {
                RestoreSource::Embedded => println!("header restored from embedded backup"),
                RestoreSource::File(path) => println!("header restored from {}", path.display()),
            }
        }
        Commands::UpgradeKdf { argon2 } => {
            let params = argon2.to_kdf_params()?;
            let mut volume = FileVolume::open(&volume_path)?;
            let mut port = port;
            let outcome =
                maintenance::upgrade_kdf(&mut port, &mut volume, &mut Detached, &engine, &params)?;
            match outcome {
                UpgradeOutcome::NotNeeded { current } => {
                    println!("key derivation already up to date ({current})")
                }
                UpgradeOutcome::Upgraded { from, to, .. } => {
                    println!("header key derivation upgraded: {from} -> {to}")
                }
            }
        }
    }

    Ok(())
}

fn default_backup_path(volume: &Path) -> Result<PathBuf> {
    let dir = volkey::default_backup_dir().context("could not determine platform directories")?;
    let name = volume
        .file_name()
        .context("volume path has no file name")?
        .to_string_lossy();
    Ok(dir.join(format!("{name}.hdr")))
}

fn print_info(report: &InfoReport<'_>) {
    let kdf = &report.header.kdf;
    println!("Volume:         {}", report.volume.display());
    println!("Data size:      {} bytes", report.data_size);
    println!("KDF:            {}", kdf.algorithm());
    if kdf.algorithm() == KdfAlgorithm::Pbkdf2Sha512 {
        println!("Iterations:     {}", kdf.time_cost());
    } else {
        println!("Memory cost:    {} KiB", kdf.mem_cost_kib());
        println!("Time cost:      {}", kdf.time_cost());
        println!("Parallelism:    {}", kdf.parallelism());
    }
    println!(
        "Backup header:  {}",
        match (&report.header.backup_slot, &report.header.backup_kdf) {
            (false, _) => "none".to_string(),
            (true, Some(kdf)) => kdf.to_string(),
            (true, None) => "unreadable".to_string(),
        }
    );
    println!("AES backend:    {:?}", report.aes_backend);
    if report.header.outdated {
        println!("Status:         outdated, run `volkey upgrade-kdf`");
    } else {
        println!("Status:         up to date");
    }
}
