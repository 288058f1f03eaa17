//! CLI probe for `slidesafe_core`.
//!
//! # Responsibility
//! - Verify core crate linkage with deterministic output.
//! - Inspect a buffered document snapshot left in an on-disk local store.
//!
//! Usage: `slidesafe_cli [<db_path> <document_id>]`
//!
//! `SLIDESAFE_LOG_DIR` turns on file logging; `SLIDESAFE_LOG_LEVEL` overrides the level.

use slidesafe_core::{LocalBuffer, SqliteKeyValueStore};
use std::process::ExitCode;

fn main() -> ExitCode {
    println!("slidesafe_core ping={}", slidesafe_core::ping());
    println!("slidesafe_core version={}", slidesafe_core::core_version());

    if let Ok(log_dir) = std::env::var("SLIDESAFE_LOG_DIR") {
        let level = std::env::var("SLIDESAFE_LOG_LEVEL")
            .unwrap_or_else(|_| slidesafe_core::default_log_level().to_string());
        if let Err(err) = slidesafe_core::init_logging(&level, &log_dir) {
            eprintln!("logging disabled: {err}");
        }
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => ExitCode::SUCCESS,
        [db_path, document_id] => inspect_snapshot(db_path, document_id),
        _ => {
            eprintln!("usage: slidesafe_cli [<db_path> <document_id>]");
            ExitCode::from(2)
        }
    }
}

fn inspect_snapshot(db_path: &str, document_id: &str) -> ExitCode {
    let store = match SqliteKeyValueStore::open(db_path) {
        Ok(store) => store,
        Err(err) => {
            eprintln!("failed to open local store `{db_path}`: {err}");
            return ExitCode::FAILURE;
        }
    };

    let buffer = LocalBuffer::new(store);
    match buffer.restore::<serde_json::Value>(document_id) {
        Some(snapshot) => {
            println!("snapshot timestamp={}", snapshot.timestamp);
            println!("{}", snapshot.data);
        }
        None => println!("no snapshot for `{document_id}`"),
    }
    ExitCode::SUCCESS
}
