use std::fs;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use blockq::core::{Context, Durability, NewMessage, Queue, QueueConfig};
use blockq::lifecycle::{LifecycleConfig, LifecycleManager};
use blockq::storage::{Compressor, FsStorage, NoCompression, Tiers};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "blockq-cli", version, about = "Block queue tooling")]
struct Cli {
    /// Queue root; every subdirectory is a storage tier
    #[arg(long)]
    root: PathBuf,

    /// JSON file holding a QueueConfig (defaults apply when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Compress block objects with zstd; must match how the queue was written
    #[arg(long)]
    zstd: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append one record per payload argument, or one per stdin line
    Append {
        payloads: Vec<String>,
        #[arg(long, default_value = "")]
        source: String,
        /// Deduplicate on (source, external id); consecutive ids per payload
        #[arg(long)]
        external_id: Option<u64>,
        #[arg(long, default_value = "save-immediate", value_parser = parse_durability)]
        durability: Durability,
    },
    /// Print records after an offset
    Read {
        #[arg(long, default_value_t = 0)]
        from: u64,
        #[arg(long, default_value_t = 100)]
        limit: usize,
        /// Start after this subscriber's last read and advance it
        #[arg(long)]
        subscriber: Option<String>,
    },
    /// Print blocks, versions and subscribers
    Inspect,
    #[command(subcommand)]
    Subscriber(SubscriberCommand),
    /// Run one lifecycle pass
    Maintain {
        /// JSON file holding a LifecycleConfig
        #[arg(long)]
        lifecycle: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SubscriberCommand {
    Get { name: String },
    Set { name: String, id: u64 },
    AddReplica { name: String },
    RemoveReplica { name: String },
}

fn parse_durability(value: &str) -> std::result::Result<Durability, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| format!("expected no-save, save-immediate, save-mark or save-wait, got {value}"))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config: QueueConfig = match &cli.config {
        Some(path) => read_json(path)?,
        None => QueueConfig::default(),
    };
    let ctx = Context::with_timeout(config.lock_timeout);
    let tiers = open_tiers(&cli.root, &config.default_tier)?;
    let compressor = compressor(cli.zstd)?;
    let queue = Queue::builder(config, tiers)
        .compressor(compressor)
        .open(&ctx)
        .with_context(|| format!("opening queue at {}", cli.root.display()))?;

    let mut out = BufWriter::new(io::stdout());
    match cli.command {
        Commands::Append {
            payloads,
            source,
            external_id,
            durability,
        } => {
            let payloads = if payloads.is_empty() {
                io::stdin().lock().lines().collect::<io::Result<Vec<_>>>()?
            } else {
                payloads
            };
            let ids = match external_id {
                Some(first) => {
                    let messages = payloads
                        .into_iter()
                        .zip(first..)
                        .map(|(payload, ext)| NewMessage::new(payload).source(source.as_str()).external_id(ext))
                        .collect();
                    queue.add_unique_list(&ctx, messages, durability)?
                }
                None => {
                    let messages = payloads
                        .into_iter()
                        .map(|payload| NewMessage::new(payload).source(source.as_str()))
                        .collect();
                    queue.add_list(&ctx, messages, durability)?
                }
            };
            if durability == Durability::SaveMark {
                queue.save_all(&ctx)?;
            }
            for id in ids {
                writeln!(out, "{id}")?;
            }
        }
        Commands::Read {
            from,
            limit,
            subscriber,
        } => {
            let from = match &subscriber {
                Some(name) => queue.subscriber_get_last_read(&ctx, name)?.unwrap_or(from),
                None => from,
            };
            let records = queue.get(&ctx, from, limit)?;
            for record in &records {
                let m = &record.message;
                writeln!(
                    out,
                    "{}\t{}\t{}/{}\t{}\t{}",
                    m.id,
                    m.created_at,
                    m.source,
                    m.external_id,
                    if record.is_saved { "saved" } else { "unsaved" },
                    String::from_utf8_lossy(&m.payload)
                )?;
            }
            if let (Some(name), Some(last)) = (&subscriber, records.last()) {
                queue.subscriber_set_last_read(&ctx, name, last.id(), Durability::SaveImmediate)?;
            }
        }
        Commands::Inspect => {
            writeln!(
                out,
                "versions: dirty={} persisted={}",
                queue.dirty_version(),
                queue.persisted_version()
            )?;
            writeln!(out, "tiers: {}", queue.tiers().names().collect::<Vec<_>>().join(","))?;
            let now = queue.now();
            for info in queue.block_infos(&ctx)? {
                writeln!(
                    out,
                    "block {} len={} bytes={} last={} tier={}{} age={:?}{}{}{}",
                    info.id,
                    info.length,
                    info.byte_len,
                    info.last_id,
                    info.current_tier,
                    if info.pending_tier != info.current_tier {
                        format!("->{}", info.pending_tier)
                    } else {
                        String::new()
                    },
                    info.age(now),
                    if info.evicted { " evicted" } else { "" },
                    if info.pending_delete { " pending-delete" } else { "" },
                    if info.is_open { " open" } else { "" },
                )?;
            }
            for name in queue.subscriber_names(&ctx)? {
                let last = queue.subscriber_get_last_read(&ctx, &name)?.unwrap_or(0);
                writeln!(out, "subscriber {name} last={last}")?;
            }
        }
        Commands::Subscriber(command) => match command {
            SubscriberCommand::Get { name } => match queue.subscriber_get_last_read(&ctx, &name)? {
                Some(id) => writeln!(out, "{id}")?,
                None => bail!("unknown subscriber {name}"),
            },
            SubscriberCommand::Set { name, id } => {
                queue.subscriber_set_last_read(&ctx, &name, id, Durability::SaveImmediate)?;
            }
            SubscriberCommand::AddReplica { name } => {
                queue.subscriber_add_replica_member(&ctx, &name)?;
            }
            SubscriberCommand::RemoveReplica { name } => {
                queue.subscriber_remove_replica_member(&ctx, &name)?;
            }
        },
        Commands::Maintain { lifecycle } => {
            let config: LifecycleConfig = match &lifecycle {
                Some(path) => read_json(path)?,
                None => LifecycleConfig::default(),
            };
            let stats = LifecycleManager::new(config).run_once(&ctx, &queue)?;
            writeln!(out, "{}", stats.summary())?;
            for error in &stats.errors {
                writeln!(out, "  {error}")?;
            }
            if stats.has_errors() {
                out.flush()?;
                std::process::exit(2);
            }
        }
    }
    out.flush()?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

fn open_tiers(root: &Path, default_tier: &str) -> Result<Tiers> {
    let default = FsStorage::open(root.join(default_tier))?;
    let mut tiers = Tiers::new(default_tier, Arc::new(default));
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name != default_tier {
            tiers = tiers.with_tier(name, Arc::new(FsStorage::open(entry.path())?));
        }
    }
    Ok(tiers)
}

fn compressor(zstd: bool) -> Result<Arc<dyn Compressor>> {
    if !zstd {
        return Ok(Arc::new(NoCompression));
    }
    #[cfg(feature = "zstd")]
    {
        Ok(Arc::new(blockq::storage::ZstdCompressor::default()))
    }
    #[cfg(not(feature = "zstd"))]
    {
        bail!("built without the zstd feature")
    }
}
