use anyhow::{Context, Result};
use arcstore_io::{
    payload_digest, ArchiveConfig, ArchiveReader, ReadPolicy, Record, RecordHeader, RecordType, SerialNumber,
    WriterFactory, WriterPool,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "arcstore")]
#[command(about = "Inspect and write ARC/WARC container files", long_about = None)]
pub struct Cli {
    /// Emit JSON instead of text, logs included.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Read every record and report damage.
    Validate {
        /// Fail on the first damaged record instead of warning.
        #[arg(long)]
        strict: bool,
        /// Expected record count per file, descriptor included.
        #[arg(long)]
        expect: Option<usize>,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// List record headers.
    Dump {
        /// Start at the record beginning at this byte offset.
        #[arg(long, default_value = "0")]
        offset: u64,
        #[arg(long)]
        limit: Option<usize>,
        file: PathBuf,
    },
    /// Store local files as resource records.
    Import {
        #[arg(short, long, env = "ARCSTORE_CONFIG")]
        config: PathBuf,
        #[arg(long, default_value = "application/octet-stream")]
        mimetype: String,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Command::Validate {
                strict,
                expect,
                ref files,
            } => validate(files, strict, expect, self.json),
            Command::Dump {
                offset,
                limit,
                ref file,
            } => dump(file, offset, limit, self.json),
            Command::Import {
                ref config,
                ref mimetype,
                ref paths,
            } => import(config, mimetype, paths, self.json),
        }
    }
}

fn validate(files: &[PathBuf], strict: bool, expect: Option<usize>, json: bool) -> Result<()> {
    let policy = if strict { ReadPolicy::Strict } else { ReadPolicy::Lenient };
    let mut damaged = 0usize;
    for file in files {
        let report = ArchiveReader::open(file)
            .and_then(|r| r.with_policy(policy).validate(expect))
            .with_context(|| format!("validating {}", file.display()))?;
        damaged += usize::from(!report.warnings.is_empty());
        if json {
            println!("{}", serde_json::to_string(&report)?);
            continue;
        }
        for warning in &report.warnings {
            eprintln!("{}: {}", file.display(), warning);
        }
        println!(
            "{}: {} records ({} content), {} warnings",
            file.display(),
            report.records_seen(),
            report.content_records(),
            report.warnings.len()
        );
    }
    if damaged > 0 {
        anyhow::bail!("{} of {} files have damaged records", damaged, files.len());
    }
    Ok(())
}

fn dump(file: &Path, offset: u64, limit: Option<usize>, json: bool) -> Result<()> {
    let mut reader = ArchiveReader::open_at(file, offset)
        .with_context(|| format!("opening {}", file.display()))?
        .with_policy(ReadPolicy::Lenient);
    let mut shown = 0usize;
    while let Some(header) = reader.next_header()? {
        if limit.map(|l| shown >= l).unwrap_or(false) {
            break;
        }
        if json {
            println!("{}", serde_json::to_string(&header)?);
        } else {
            println!("{}", dump_line(&header));
        }
        shown += 1;
    }
    for warning in reader.warnings() {
        eprintln!("{}", warning);
    }
    Ok(())
}

fn dump_line(header: &RecordHeader) -> String {
    format!(
        "{} {} {} {} {}",
        header.offset,
        header.record_type,
        if header.url.is_empty() { "-" } else { header.url.as_str() },
        if header.mimetype.is_empty() { "-" } else { header.mimetype.as_str() },
        header.content_length
    )
}

fn file_url(path: &Path) -> Result<String> {
    let abs = std::fs::canonicalize(path).with_context(|| format!("resolving {}", path.display()))?;
    Ok(format!("file://{}", abs.display()).replace(' ', "%20"))
}

fn import(config: &Path, mimetype: &str, paths: &[PathBuf], json: bool) -> Result<()> {
    let config = ArchiveConfig::from_file(config)?;
    config.validate()?;
    let factory = WriterFactory::new(config.writer.clone(), SerialNumber::default());
    let pool = WriterPool::new(config.pool.clone(), factory)?;

    let mut result = Ok(());
    for path in paths {
        let stored = (|| -> Result<_> {
            let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            let digest = payload_digest(&data);
            let record = Record::from_bytes(RecordType::Resource, file_url(path)?, mimetype, data).with_digest(digest);
            Ok(pool.with_writer(|w| w.write(record))?)
        })();
        match stored {
            Ok(receipt) if json => println!("{}", serde_json::to_string(&receipt)?),
            Ok(receipt) => println!("{} -> {}@{}", path.display(), receipt.path.display(), receipt.offset),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "import failed");
                result = Err(e);
                break;
            }
        }
    }
    pool.close()?;
    result
}
