use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use mediadedup::core::ids::{IdGenerator, UuidGenerator};
use mediadedup::database::get_database_path;
use mediadedup::database::models::{Content, ContentType, HashType};
use mediadedup::database::repositories::{
    ConfigRepository, ContentRepository, DuplicateGroupRepository, ScanQueueRepository,
};
use mediadedup::{AppConfig, Database, DedupService};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(name = "mediadedup", version, about = "Find duplicate media in a managed library")]
struct Cli {
    /// SQLite database file (default: `<data dir>/mediadedup/mediadedup.db`)
    #[arg(long, global = true, value_name = "FILE")]
    db: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register one file and compute its hashes
    Add {
        /// image, video or audio
        #[arg(long, value_parser = parse_kind)]
        kind: ContentType,
        /// Directory relative to the storage root
        #[arg(long, value_name = "DIR")]
        path: String,
        /// File name inside `path`
        #[arg(long)]
        name: String,
    },

    /// Register every media file under a directory of the storage root
    Import {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    /// Compare pending hashes and update duplicate groups
    Scan,

    /// List duplicate groups
    Groups {
        /// Only groups formed under this hash type
        #[arg(long, value_name = "TYPE")]
        hash_type: Option<String>,
    },

    /// Show hashes waiting for comparison
    Queue,

    /// Forget a content, its hashes and its group membership
    Remove {
        #[arg(value_name = "CONTENT_ID")]
        content_id: String,
    },

    /// Queue every known hash for comparison again
    Requeue,

    /// Read or change settings
    Config {
        #[command(subcommand)]
        command: ConfigCmd,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCmd {
    /// Print every setting
    Show,
    /// Change one setting
    Set { key: String, value: String },
}

fn parse_kind(value: &str) -> Result<ContentType, String> {
    ContentType::try_from(value)
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let db_path = match cli.db {
        Some(path) => path,
        None => get_database_path()?,
    };
    let db = Arc::new(
        Database::open(&db_path)
            .with_context(|| format!("Failed to open database {}", db_path.display()))?,
    );
    let config = {
        let conn = db.lock()?;
        ConfigRepository::new(&conn).get_config()?
    };
    info!("Using database {}", db_path.display());

    match cli.command {
        Commands::Config { command } => run_config(&db, config, command)?,

        Commands::Add { kind, path, name } => {
            let service = DedupService::from_config(db.clone(), &config);
            let content = find_or_save_content(&db, &path, &name, kind)?;
            let location = content.resolve_path(&config.storage_root);
            println!("▶ Registering {} ({})", content.id, location.display());

            let outcome = service.register(content).await?;
            println!("✅ {} hash(es) computed", outcome.hashes.len());
            for hash in &outcome.hashes {
                match &hash.metadata {
                    Some(meta) => println!(
                        "   {} {} @ {:.2}s",
                        hash.hash_type, hash.value, meta.timestamp
                    ),
                    None => println!("   {} {}", hash.hash_type, hash.value),
                }
            }
            if outcome.scan_triggered {
                println!("▶ Batch threshold reached, scanning…");
            }
            service.wait_idle().await;
        }

        Commands::Import { dir } => {
            let service = DedupService::from_config(db.clone(), &config);
            import_directory(&db, &service, &config, &dir).await?;
        }

        Commands::Scan => {
            let service = DedupService::from_config(db.clone(), &config);
            let summary = service.scan().await?;
            println!(
                "✅ Processed {} hash(es): {} group(s) created, {} updated, {} merged",
                summary.processed,
                summary.groups_created,
                summary.groups_updated,
                summary.groups_merged
            );
        }

        Commands::Groups { hash_type } => {
            let hash_type = hash_type.map(HashType::from);
            let conn = db.lock()?;
            let ids = UuidGenerator;
            let groups = DuplicateGroupRepository::new(&conn, &ids).find_all(hash_type.as_ref())?;
            let contents = ContentRepository::new(&conn);

            if groups.is_empty() {
                println!("No duplicates found.");
            } else {
                println!("Found {} duplicate group(s):", groups.len());
                for group in &groups {
                    println!("\n✨ {} [{}]", group.id, group.hash_type);
                    for item in &group.items {
                        let location = contents
                            .find_by_id(&item.content_id)?
                            .map(|c| c.resolve_path(&config.storage_root).display().to_string())
                            .unwrap_or_else(|| "<unregistered>".to_string());
                        println!("   ▶ {} {:.3} {}", item.content_id, item.similarity, location);
                    }
                }
            }
        }

        Commands::Queue => {
            let conn = db.lock()?;
            let entries = ScanQueueRepository::new(&conn).find_with_hash()?;
            println!("🗂️  {} hash(es) pending", entries.len());
            for entry in &entries {
                println!(
                    "[{}] {} {} {}",
                    entry.id, entry.content_id, entry.hash_type, entry.value
                );
            }
        }

        Commands::Remove { content_id } => {
            let service = DedupService::from_config(db.clone(), &config);
            if service.remove_content(&content_id).await? {
                println!("🗑️  Removed {}", content_id);
            } else {
                bail!("No content with id {}", content_id);
            }
        }

        Commands::Requeue => {
            let service = DedupService::from_config(db.clone(), &config);
            let added = service.requeue_all().await?;
            println!("🔄 Requeued {} hash(es)", added);
        }
    }

    Ok(())
}

fn run_config(db: &Database, mut config: AppConfig, command: ConfigCmd) -> Result<()> {
    match command {
        ConfigCmd::Show => {
            for (key, value) in config.entries() {
                println!("{} = {}", key, value);
            }
        }
        ConfigCmd::Set { key, value } => {
            config.set(&key, &value)?;
            let conn = db.lock()?;
            ConfigRepository::new(&conn).save_config(&config)?;
            println!("✅ {} = {}", key, value);
        }
    }
    Ok(())
}

fn find_or_save_content(
    db: &Database,
    path: &str,
    name: &str,
    kind: ContentType,
) -> Result<Content> {
    let conn = db.lock()?;
    let repo = ContentRepository::new(&conn);
    if let Some(existing) = repo.find_by_location(path, name)? {
        return Ok(existing);
    }

    let content = Content {
        id: UuidGenerator.generate("cnt"),
        path: path.to_string(),
        name: name.to_string(),
        content_type: kind,
    };
    repo.save(&content)?;
    Ok(content)
}

/// Media files under `dir` as `(relative dir, file name, kind)`.
fn collect_media(root: &Path, dir: &Path) -> Result<Vec<(String, String, ContentType)>> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message("Scanning for media…");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(kind) = ContentType::from_extension(path) else {
            continue;
        };
        if kind == ContentType::Audio {
            warn!("Skipping {}: audio is not hashed", path.display());
            continue;
        }

        let relative = path
            .parent()
            .and_then(|parent| parent.strip_prefix(root).ok())
            .with_context(|| format!("{} is outside the storage root", path.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        files.push((relative.to_string_lossy().into_owned(), name, kind));
        spinner.tick();
    }
    spinner.finish_with_message(format!("Found {} media file(s)", files.len()));
    Ok(files)
}

async fn import_directory(
    db: &Database,
    service: &DedupService,
    config: &AppConfig,
    dir: &Path,
) -> Result<()> {
    let root = config
        .storage_root
        .canonicalize()
        .with_context(|| format!("Storage root {} not found", config.storage_root.display()))?;
    let dir = root
        .join(dir)
        .canonicalize()
        .with_context(|| format!("Directory {} not found", dir.display()))?;
    if !dir.starts_with(&root) {
        bail!("{} is outside the storage root {}", dir.display(), root.display());
    }

    let files = collect_media(&root, &dir)?;
    let mut replies = Vec::with_capacity(files.len());
    for (path, name, kind) in files {
        let content = find_or_save_content(db, &path, &name, kind)?;
        replies.push((content.name.clone(), service.enqueue_registration(content)));
    }

    let progress = ProgressBar::new(replies.len() as u64);
    progress.set_style(ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")?);

    let mut failed = 0;
    for (name, reply) in replies {
        progress.set_message(name.clone());
        match reply.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                failed += 1;
                progress.println(format!("⚠️  {}: {}", name, e));
            }
            Err(_) => {
                failed += 1;
                progress.println(format!("⚠️  {}: registration was dropped", name));
            }
        }
        progress.inc(1);
    }
    progress.finish_with_message("done");

    service.wait_idle().await;
    println!(
        "✅ Registered {} file(s), {} failed",
        progress.position() as usize - failed,
        failed
    );
    Ok(())
}
