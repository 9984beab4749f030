//! Interactive database example: a string-to-string store driven from a
//! small REPL. Exercises the public API only.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use small_kv::{Database, DatabaseConfig, KvResult, Transaction};

#[derive(Parser, Debug)]
#[command(name = "shell", about = "Interactive small-kv session")]
struct Args {
    /// Path of the tree data file. The log lives next to it as .wal.
    #[arg(default_value = "shell.db")]
    tree_file_path: PathBuf,

    /// Maximum number of keys per tree node.
    #[arg(long, default_value_t = 32)]
    order: usize,
}

fn main() {
    small_kv::utils::init_log();
    let args = Args::parse();

    let wal_path = args.tree_file_path.with_extension("wal");
    let config = DatabaseConfig {
        order: args.order,
        ..Default::default()
    };
    let db: Database<String, String> =
        match Database::open(&args.tree_file_path, &wal_path, config) {
            Ok(db) => db,
            Err(e) => {
                eprintln!("cannot open {}: {}", args.tree_file_path.display(), e);
                process::exit(1);
            }
        };

    println!("small-kv shell, {} open", args.tree_file_path.display());
    println!("Type 'help' for commands, '.exit' to quit.");

    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("cannot start the line editor: {}", e);
            process::exit(1);
        }
    };
    let mut tx: Option<Transaction> = None;

    loop {
        let prompt = if tx.is_some() { "kv(tx)> " } else { "kv> " };
        match rl.readline(prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);
                if line == ".exit" {
                    break;
                }
                if let Err(e) = dispatch(&db, &mut tx, line) {
                    eprintln!("error: {}", e);
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("readline error: {}", e);
                break;
            }
        }
    }

    if let Some(tx) = tx.take() {
        eprintln!("rolling back the open transaction");
        let _ = db.rollback_transaction(&tx);
    }
    if let Err(e) = db.close() {
        eprintln!("close failed: {}", e);
        process::exit(1);
    }
    println!("Goodbye!");
}

fn dispatch(
    db: &Database<String, String>,
    tx: &mut Option<Transaction>,
    line: &str,
) -> KvResult {
    let mut parts = line.splitn(4, ' ');
    let command = parts.next().unwrap_or_default();
    let a = parts.next();
    let b = parts.next();
    let c = parts.next();

    match (command, a, b, c) {
        ("help", _, _, _) => {
            println!("  get <k>              look a key up");
            println!("  put <k> <v>          insert or update");
            println!("  del <k>              delete");
            println!("  range <lo> <hi>      inclusive scan");
            println!("  cas <k> <old> <new>  compare-and-set ('-' for absent)");
            println!("  size | stats | draw");
            println!("  begin | commit | rollback");
            println!("  .exit");
        }
        ("get", Some(k), None, None) => {
            let found = match tx {
                Some(tx) => db.get_tx(&k.to_string(), tx)?,
                None => db.get(&k.to_string())?,
            };
            match found {
                Some(v) => println!("{}", v),
                None => println!("(not found)"),
            }
        }
        ("put", Some(k), Some(v), None) => {
            match tx {
                Some(tx) => db.put_tx(&k.to_string(), &v.to_string(), tx)?,
                None => db.put(&k.to_string(), &v.to_string())?,
            }
            println!("ok");
        }
        ("del", Some(k), None, None) => {
            let removed = match tx {
                Some(tx) => db.delete_tx(&k.to_string(), tx)?,
                None => db.delete(&k.to_string())?,
            };
            println!("{}", if removed { "deleted" } else { "(not found)" });
        }
        ("range", Some(lo), Some(hi), None) => {
            let values = match tx {
                Some(tx) => db.range_tx(&lo.to_string(), &hi.to_string(), tx)?,
                None => db.range(&lo.to_string(), &hi.to_string())?,
            };
            for v in &values {
                println!("{}", v);
            }
            println!("({} value(s))", values.len());
        }
        ("cas", Some(k), Some(old), Some(new)) => {
            let expected = if old == "-" { None } else { Some(old.to_string()) };
            let swapped = match tx {
                Some(tx) => db.compare_and_set_tx(
                    &k.to_string(),
                    expected.as_ref(),
                    &new.to_string(),
                    tx,
                )?,
                None => {
                    db.compare_and_set(&k.to_string(), expected.as_ref(), &new.to_string())?
                }
            };
            println!("{}", if swapped { "swapped" } else { "mismatch" });
        }
        ("size", None, None, None) => println!("{}", db.size()?),
        ("stats", None, None, None) => {
            let stats = db.btree().stats()?;
            println!(
                "depth {}, {} leaf node(s), {} internal node(s), {} key(s), mean leaf fill {:.2}",
                stats.depth,
                stats.leaf_nodes,
                stats.internal_nodes,
                stats.keys,
                stats.mean_leaf_fill()
            );
        }
        ("draw", None, None, None) => print!("{}", db.btree().draw()?),
        ("begin", None, None, None) => {
            if tx.is_some() {
                println!("a transaction is already open");
            } else {
                *tx = Some(db.begin_transaction()?);
                println!("begun");
            }
        }
        ("commit", None, None, None) => match tx.take() {
            Some(t) => {
                db.commit_transaction(&t)?;
                println!("committed");
            }
            None => println!("no open transaction"),
        },
        ("rollback", None, None, None) => match tx.take() {
            Some(t) => {
                db.rollback_transaction(&t)?;
                println!("rolled back");
            }
            None => println!("no open transaction"),
        },
        _ => println!("unknown command, try 'help'"),
    }
    Ok(())
}
