use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use blockvault_dedup::{
    BackupConfig, BackupManifest, BackupService, EnvKeyProvider, FileKeyProvider, KeyProvider,
};
use clap::{Parser, Subcommand};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "blockvault")]
#[command(about = "BlockVault deduplicating backup CLI", long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json)
    #[arg(short, long, env = "BLOCKVAULT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Store root, overriding the configuration
    #[arg(short, long, env = "BLOCKVAULT_STORE")]
    pub store: Option<PathBuf>,

    /// Key file (raw bytes or 64 hex characters); otherwise a hex key is read from BLOCKVAULT_KEY
    #[arg(long, env = "BLOCKVAULT_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Back up a file
    Backup {
        path: PathBuf,
        #[arg(short, long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        retention_days: Option<u32>,
    },
    /// Back up standard input under a source name
    BackupStream {
        source: String,
        #[arg(short, long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        parent: Option<String>,
    },
    /// Restore a backup to a file, or to stdout when no output is given
    Restore {
        id: String,
        output: Option<PathBuf>,
    },
    /// List backups, newest first
    List {
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Delete a backup (blocks are reclaimed by `gc`)
    Delete { id: String },
    /// Verify stored blocks
    Scrub {
        #[arg(long)]
        max_blocks: Option<usize>,
    },
    /// Remove unreferenced blocks past the grace period
    Gc,
    /// Delete backups whose retention has expired
    Retention,
    /// Show deduplication statistics
    Stats,
    /// Print a manifest summary as JSON
    Export { id: String },
}

#[derive(Serialize)]
struct ManifestLine<'a> {
    id: &'a str,
    created_at: String,
    source: &'a str,
    source_size: u64,
    blocks: usize,
    tags: &'a [String],
}

impl<'a> From<&'a BackupManifest> for ManifestLine<'a> {
    fn from(m: &'a BackupManifest) -> Self {
        Self {
            id: &m.id,
            created_at: m.created_at.to_rfc3339(),
            source: &m.source,
            source_size: m.source_size,
            blocks: m.blocks.len(),
            tags: &m.tags,
        }
    }
}

impl Cli {
    /// Resolve configuration: file (or defaults), then the `--store` override.
    pub fn load_config(&self) -> Result<BackupConfig> {
        let mut config = match &self.config {
            Some(path) => BackupConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => BackupConfig::default(),
        };
        if let Some(store) = &self.store {
            config.store_root = store.clone();
        }
        Ok(config)
    }

    fn key_provider(&self) -> Box<dyn KeyProvider> {
        match &self.key_file {
            Some(path) => Box::new(FileKeyProvider::new(path)),
            None => Box::new(EnvKeyProvider::default()),
        }
    }

    pub fn run(self, out: &mut dyn Write) -> Result<()> {
        let config = self.load_config()?;
        let keys = self.key_provider();
        let svc = BackupService::open(config, Some(keys.as_ref()))
            .context("opening backup store")?;

        match self.command {
            Command::Backup {
                ref path,
                ref tags,
                retention_days,
            } => {
                let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
                let manifest = svc.backup_file(path, &tags, retention_days)?;
                print_json(out, &ManifestLine::from(&manifest))
            }
            Command::BackupStream {
                ref source,
                ref tags,
                ref parent,
            } => {
                let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
                let stdin = std::io::stdin().lock();
                let manifest = svc.backup_stream(source, stdin, &tags, parent.as_deref())?;
                print_json(out, &ManifestLine::from(&manifest))
            }
            Command::Restore { ref id, ref output } => restore(&svc, id, output.as_deref(), out),
            Command::List {
                ref source,
                ref tag,
            } => {
                let manifests = svc.list_backups(source.as_deref(), tag.as_deref());
                let lines: Vec<ManifestLine<'_>> = manifests.iter().map(ManifestLine::from).collect();
                print_json(out, &lines)
            }
            Command::Delete { ref id } => {
                if !svc.delete_backup(id)? {
                    anyhow::bail!("Backup not found: {}", id);
                }
                writeln!(out, "deleted {}", id)?;
                Ok(())
            }
            Command::Scrub { max_blocks } => {
                let result = svc.scrub(max_blocks)?;
                print_json(out, &result)?;
                if !result.is_clean() {
                    anyhow::bail!(
                        "{} corrupted and {} missing blocks",
                        result.corrupted.len(),
                        result.missing.len()
                    );
                }
                Ok(())
            }
            Command::Gc => print_json(out, &svc.garbage_collect()?),
            Command::Retention => print_json(out, &svc.apply_retention()?),
            Command::Stats => print_json(out, &svc.dedup_stats()),
            Command::Export { ref id } => print_json(out, &svc.export_manifest(id)?),
        }
    }
}

fn restore(svc: &BackupService, id: &str, output: Option<&Path>, out: &mut dyn Write) -> Result<()> {
    match output {
        Some(path) => {
            let written = svc.restore_to_file(id, path)?;
            tracing::info!(bytes = written, output = %path.display(), "restored");
        }
        None => {
            svc.restore_stream(id)?.copy_to(out)?;
            out.flush()?;
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(out: &mut dyn Write, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}
