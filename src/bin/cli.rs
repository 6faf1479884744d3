//! objstore CLI
//!
//! Command-line access to a store file: read and write objects, browse
//! scopes, and run maintenance (validate, backup, compact, repair).

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use objstore::{repair, Config, ObjectStore, ReadResult, StoreError};
use tracing_subscriber::{fmt, EnvFilter};

/// objstore CLI
#[derive(Parser, Debug)]
#[command(name = "objstore-cli")]
#[command(about = "Inspect and modify an objstore file")]
#[command(version)]
struct Args {
    /// Directory holding the store
    #[arg(short, long, default_value = "./objstore_data")]
    dir: PathBuf,

    /// Store name (the file is <dir>/<name>.ObjStore)
    #[arg(short, long, default_value = "Store")]
    name: String,

    /// Treat keys that differ only in case as the same key
    #[arg(long)]
    case_insensitive: bool,

    /// Salvage damaged slots while opening instead of failing
    #[arg(long)]
    recovery: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print an object's value
    Get {
        /// Object key, e.g. /settings/ui/window
        key: String,
    },

    /// Add or update an object
    Put {
        key: String,

        /// Value, stored as UTF-8 bytes
        value: String,

        /// Spare bytes to reserve for later growth (new objects only)
        #[arg(short, long, default_value = "0")]
        reserve: u32,
    },

    /// Delete an object
    Del {
        key: String,
    },

    /// List objects directly in a scope
    Ls {
        #[arg(default_value = "/")]
        scope: String,
    },

    /// List the direct sub-scopes of a scope
    Scopes {
        #[arg(default_value = "/")]
        scope: String,
    },

    /// List every object at or below a scope
    Tree {
        #[arg(default_value = "/")]
        scope: String,
    },

    /// Check the store and print a slot-by-slot report
    Validate,

    /// Write a backup next to the store
    Backup,

    /// Rewrite the store without fragmentation
    Compact,

    /// Print store statistics
    Stats,

    /// Salvage intact objects from a damaged file into a new store file
    Repair {
        /// Damaged store file
        src: PathBuf,

        /// New store file to write
        dst: PathBuf,
    },
}

fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,objstore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> objstore::Result<ExitCode> {
    // Repair works on raw files and never opens a store
    if let Commands::Repair { src, dst } = &args.command {
        let report = repair(src, dst, !args.case_insensitive)?;
        println!(
            "recovered {} objects ({} damaged, {} older copies dropped, {} bytes skipped)",
            report.recovered, report.damaged_items, report.duplicates_dropped, report.skipped_bytes
        );
        for line in &report.log {
            println!("  {}", line);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let config = Config::builder()
        .data_dir(&args.dir)
        .store_name(&args.name)
        .case_sensitive(!args.case_insensitive)
        .recovery_mode(args.recovery)
        .build();

    let (store, created) = ObjectStore::open(config)?;
    if created {
        tracing::info!("Created new store {}/{}.ObjStore", args.dir.display(), args.name);
    }

    let mut stdout = io::stdout().lock();
    let mut code = ExitCode::SUCCESS;
    match args.command {
        Commands::Get { key } => match store.read(&key, 0)? {
            ReadResult::NewData { value, version } => {
                stdout.write_all(&value)?;
                writeln!(stdout)?;
                tracing::debug!(key = %key, version, "Read object");
            }
            _ => return Err(StoreError::KeyNotFound { key }),
        },
        Commands::Put { key, value, reserve } => {
            let (is_new, version) = store.add_or_update(&key, value.as_bytes(), reserve)?;
            let action = if is_new { "added" } else { "updated" };
            writeln!(stdout, "{} {} (version {})", action, key, version)?;
        }
        Commands::Del { key } => {
            store.delete(&key)?;
            writeln!(stdout, "deleted {}", key)?;
        }
        Commands::Ls { scope } => {
            for key in store.objects_in_scope(&scope)? {
                writeln!(stdout, "{}", key)?;
            }
        }
        Commands::Scopes { scope } => {
            for sub in store.sub_scopes(&scope)? {
                writeln!(stdout, "{}", sub)?;
            }
        }
        Commands::Tree { scope } => {
            for key in store.all_objects_under(&scope)? {
                writeln!(stdout, "{}", key)?;
            }
        }
        Commands::Validate => {
            let report = store.validate(Some(&mut stdout))?;
            if !report.is_clean() {
                code = ExitCode::FAILURE;
            }
        }
        Commands::Backup => {
            store.backup()?;
            writeln!(stdout, "backup written at {} ms", store.last_backup()?)?;
        }
        Commands::Compact => {
            let before = store.stats()?.file_size;
            store.compact()?;
            let after = store.stats()?.file_size;
            writeln!(stdout, "compacted {} -> {} bytes", before, after)?;
        }
        Commands::Stats => {
            let stats = store.stats()?;
            writeln!(stdout, "objects        {}", stats.objects)?;
            writeln!(stdout, "free slots     {}", stats.free_slots)?;
            writeln!(stdout, "free bytes     {}", stats.free_bytes)?;
            writeln!(stdout, "largest free   {}", stats.largest_free)?;
            writeln!(stdout, "file size      {}", stats.file_size)?;
            writeln!(stdout, "index version  {}", stats.index_version)?;
            writeln!(stdout, "last backup    {}", stats.last_backup)?;
        }
        Commands::Repair { .. } => {}
    }

    store.close()?;
    Ok(code)
}
