//! Binary entry point for the Strata administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use strata::storage::{CommitStatsSnapshot, VerifyReport};
use strata::{Tree, TreeOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "strata",
    version,
    about = "Administrative CLI for Strata trees",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "STRATA_DIR",
        default_value = "strata-data",
        value_name = "DIR",
        help = "Directory holding the tree files"
    )]
    dir: PathBuf,

    #[arg(
        long,
        global = true,
        value_name = "FILE",
        help = "TOML file with tree options"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        help = "Keys and values are hex-encoded on input and output"
    )]
    hex: bool,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Write a key and commit")]
    Put {
        #[arg(value_name = "KEY", allow_hyphen_values = true)]
        key: String,
        #[arg(value_name = "VALUE", allow_hyphen_values = true)]
        value: String,
    },

    #[command(about = "Delete a key and commit")]
    Delete {
        #[arg(value_name = "KEY", allow_hyphen_values = true)]
        key: String,
    },

    #[command(about = "Print the committed value of a key")]
    Get {
        #[arg(value_name = "KEY", allow_hyphen_values = true)]
        key: String,
    },

    #[command(about = "Print every committed key and value in order")]
    Dump,

    #[command(about = "Check tree structure, hashes and value-log references")]
    Verify,

    #[command(about = "Print the newest meta record and commit counters")]
    Meta,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct EntryReport {
    key: String,
    value: Option<String>,
}

#[derive(Serialize)]
struct CommitReport {
    tx: u64,
    root: u64,
    root_overflow: u32,
    root_hash: String,
}

#[derive(Serialize)]
struct SubTreeReport {
    name: String,
    root: u64,
    write_seq: u64,
}

#[derive(Serialize)]
struct MetaReport {
    tx: u64,
    root: u64,
    root_overflow: u32,
    sequence: u64,
    root_hash: String,
    meta_versions: usize,
    subtrees: Vec<SubTreeReport>,
    stats: CommitStatsSnapshot,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strata=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let options = match &cli.config {
        Some(path) => TreeOptions::load(path)?,
        None => TreeOptions::default(),
    };
    let codec = Codec { hex: cli.hex };
    let mut tree = Tree::open(&cli.dir, options)?;

    match &cli.command {
        Command::Put { key, value } => {
            tree.put(&codec.decode(key)?, &codec.decode(value)?)?;
            let tx = tree.commit()?;
            let report = commit_report(&tree, tx.0);
            emit(&cli.format, &report, || {
                println!("committed tx={} root={}", report.tx, report.root)
            })?;
        }
        Command::Delete { key } => {
            tree.delete(&codec.decode(key)?)?;
            let tx = tree.commit()?;
            let report = commit_report(&tree, tx.0);
            emit(&cli.format, &report, || {
                println!("committed tx={} root={}", report.tx, report.root)
            })?;
        }
        Command::Get { key } => {
            let raw = codec.decode(key)?;
            let report = EntryReport {
                key: key.clone(),
                value: tree.get(&raw)?.map(|v| codec.encode(&v)),
            };
            emit(&cli.format, &report, || match &report.value {
                Some(value) => println!("{value}"),
                None => println!("(not found)"),
            })?;
            if report.value.is_none() {
                std::process::exit(3);
            }
        }
        Command::Dump => {
            let entries: Vec<EntryReport> = tree
                .scan()?
                .into_iter()
                .map(|(k, v)| EntryReport {
                    key: codec.encode(&k),
                    value: Some(codec.encode(&v)),
                })
                .collect();
            emit(&cli.format, &entries, || {
                for entry in &entries {
                    println!("{}\t{}", entry.key, entry.value.as_deref().unwrap_or(""));
                }
            })?;
        }
        Command::Verify => {
            let report = tree.verify()?;
            emit(&cli.format, &report, || print_verify_text(&report))?;
            if !report.success {
                std::process::exit(2);
            }
        }
        Command::Meta => {
            let meta = tree.meta()?.unwrap_or_default();
            let subtrees = tree
                .subtrees()?
                .into_iter()
                .map(|(name, desc)| SubTreeReport {
                    name: name.to_string(),
                    root: desc.root.page.0,
                    write_seq: desc.write_seq,
                })
                .collect();
            let report = MetaReport {
                tx: meta.tx.0,
                root: meta.root.0,
                root_overflow: meta.root_overflow,
                sequence: meta.sequence,
                root_hash: hex::encode(meta.root_hash),
                meta_versions: tree.meta_versions(),
                subtrees,
                stats: tree.stats(),
            };
            emit(&cli.format, &report, || print_meta_text(&report))?;
        }
    }

    Ok(())
}

struct Codec {
    hex: bool,
}

impl Codec {
    fn decode(&self, text: &str) -> Result<Vec<u8>, Box<dyn Error>> {
        if self.hex {
            Ok(hex::decode(text)?)
        } else {
            Ok(text.as_bytes().to_vec())
        }
    }

    fn encode(&self, bytes: &[u8]) -> String {
        if self.hex {
            hex::encode(bytes)
        } else {
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

fn commit_report(tree: &Tree, tx: u64) -> CommitReport {
    let root = tree.root();
    CommitReport {
        tx,
        root: root.page.0,
        root_overflow: root.overflow,
        root_hash: hex::encode(root.hash),
    }
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_verify_text(report: &VerifyReport) {
    println!(
        "Verify => success={} leaves={} branches={} entries={} \
         indirect_values={} subtrees={} depth={}",
        report.success,
        report.counts.leaves,
        report.counts.branches,
        report.counts.entries,
        report.counts.indirect_values,
        report.counts.subtrees,
        report.counts.depth,
    );
    for finding in &report.findings {
        println!("- {finding}");
    }
}

fn print_meta_text(report: &MetaReport) {
    println!(
        "Meta: tx={} root={} overflow={} sequence={} hash={}",
        report.tx, report.root, report.root_overflow, report.sequence, report.root_hash
    );
    println!("  meta_versions={}", report.meta_versions);
    for sub in &report.subtrees {
        println!("  subtree {} root={} write_seq={}", sub.name, sub.root, sub.write_seq);
    }
    let stats = &report.stats;
    println!(
        "Commits: ok={} aborted={} leaf_pages={} branch_pages={} freed={} \
         vlog_updates={} vlog_deletes={}",
        stats.commits,
        stats.aborted_commits,
        stats.leaf_pages_written,
        stats.branch_pages_written,
        stats.pages_freed,
        stats.vlog_updates,
        stats.vlog_deletes,
    );
}
