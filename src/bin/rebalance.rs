//! Offline tree rebalancer.
//!
//! Deletes never merge pages, so a long-lived tree accumulates underfull
//! and orphaned pages. This tool reads every live pair in leaf-chain
//! order, bulk-loads a fresh, densely packed tree next to the original
//! and atomically swaps the files.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use log::info;

use small_kv::{
    btree::BTree,
    storage::{
        buffer_pool::BufferPool,
        cell::{KeyType, ValueType},
        disk_manager::DiskManager,
    },
    types::KvResult,
    utils::init_log,
    Database, DatabaseConfig, KvError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
enum CodecKind {
    Integer,
    Long,
    String,
    Double,
}

#[derive(Parser, Debug)]
#[command(
    name = "rebalance",
    about = "Rewrite a small-kv tree file as a densely packed tree"
)]
struct Args {
    /// Path of the tree data file to rebalance.
    tree_file_path: PathBuf,

    /// Maximum number of keys per tree node.
    #[arg(long, default_value_t = 32)]
    order: usize,

    /// Buffer pool capacity in pages.
    #[arg(long, default_value_t = 1024)]
    buffer_size: usize,

    /// Key codec of the stored tree.
    #[arg(long, value_enum, default_value = "INTEGER")]
    key_type: CodecKind,

    /// Value codec of the stored tree.
    #[arg(long, value_enum, default_value = "STRING")]
    value_type: CodecKind,

    /// Print tree statistics before and after the rebuild.
    #[arg(long)]
    stats: bool,
}

fn main() {
    init_log();
    let args = Args::parse();

    let result = match (args.key_type, args.value_type) {
        (CodecKind::Integer, CodecKind::String) => run::<i32, String>(&args),
        (CodecKind::Long, CodecKind::String) => run::<i64, String>(&args),
        (key, value) => Err(KvError::precondition(format!(
            "unsupported codec combination {:?} -> {:?}, only INTEGER or LONG keys with STRING values are packaged",
            key, value
        ))),
    };

    if let Err(e) = result {
        eprintln!("rebalance failed: {}", e);
        process::exit(1);
    }
}

fn run<K: KeyType, V: ValueType>(args: &Args) -> KvResult {
    let wal_path = args.tree_file_path.with_extension("wal");
    let config = DatabaseConfig {
        order: args.order,
        buffer_capacity: args.buffer_size,
    };

    // opening runs recovery, so the scan sees every committed pair
    let db: Database<K, V> = Database::open(&args.tree_file_path, &wal_path, config)?;
    if args.stats {
        print_stats("before", db.btree().stats()?);
    }
    let pairs = db.scan_all()?;
    db.close()?;
    info!("scanned {} live pairs", pairs.len());

    // build the packed replacement next to the original
    let rebuilt_path = args.tree_file_path.with_extension("rebalance");
    if rebuilt_path.exists() {
        std::fs::remove_file(&rebuilt_path)?;
    }
    {
        let disk_manager = DiskManager::open(&rebuilt_path)?;
        let pool = Arc::new(BufferPool::new(disk_manager, args.buffer_size));
        let tree = BTree::<K, V>::bulk_load(pool, args.order, &pairs)?;
        tree.check_integrity()?;
        if args.stats {
            print_stats("after", tree.stats()?);
        }
    }

    // the swap point: the packed tree replaces the original atomically,
    // and the log is emptied since everything it described is in the tree
    std::fs::rename(&rebuilt_path, &args.tree_file_path)?;
    let log = small_kv::tx_log::LogManager::open(&wal_path)?;
    log.truncate_before(u64::MAX)?;

    info!("rebalance of {} done", args.tree_file_path.display());
    Ok(())
}

fn print_stats(label: &str, stats: small_kv::TreeStats) {
    println!(
        "{}: depth {}, {} leaf node(s), {} internal node(s), {} key(s), mean leaf fill {:.2}",
        label,
        stats.depth,
        stats.leaf_nodes,
        stats.internal_nodes,
        stats.keys,
        stats.mean_leaf_fill()
    );
}
