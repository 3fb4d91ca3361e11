//! Command line interface for inspecting Nostr event dumps. Loads
//! NDJSON event files into an in-memory store and answers filter queries
//! against it, applying the same dedup and replaceable-versioning rules
//! applications get from the library.

mod config;

use std::fs;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use config::Settings;
use monstr::{Event, EventStore, Filter};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "monstr",
    author,
    version,
    about = "In-memory Nostr event store"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Load events and print filter matches as NDJSON, newest first.
    Query {
        /// Paths to NDJSON event files to load.
        #[arg(required = true)]
        files: Vec<String>,
        /// Comma-separated event ids.
        #[arg(long)]
        ids: Option<String>,
        /// Comma-separated hex public keys.
        #[arg(long)]
        authors: Option<String>,
        /// Comma-separated kind numbers (e.g. `1,30023`).
        #[arg(long)]
        kinds: Option<String>,
        /// Single `#d` identifier value.
        #[arg(long)]
        d: Option<String>,
        /// Single `#t` topic value.
        #[arg(long)]
        t: Option<String>,
        /// Minimum `created_at` timestamp.
        #[arg(long)]
        since: Option<u64>,
        /// Maximum `created_at` timestamp.
        #[arg(long)]
        until: Option<u64>,
        /// Maximum number of events to print.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Load events and print ingest statistics.
    Stats {
        /// Paths to NDJSON event files to load.
        #[arg(required = true)]
        files: Vec<String>,
    },
}

/// Counts collected while feeding files into the store.
#[derive(Debug, Default)]
struct LoadStats {
    stored: usize,
    duplicates: usize,
    rejected: usize,
}

/// Feed newline-delimited JSON events from `files` into `store`.
fn load(store: &EventStore, files: &[String]) -> Result<LoadStats> {
    let mut stats = LoadStats::default();
    for file in files {
        let data = fs::read_to_string(file).with_context(|| format!("reading {file}"))?;
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = match serde_json::from_str(line) {
                Ok(ev) => ev,
                Err(err) => {
                    warn!(%err, "skipping unparsable line");
                    stats.rejected += 1;
                    continue;
                }
            };
            if store.has_event(&event.id) {
                stats.duplicates += 1;
                continue;
            }
            match store.add(event) {
                Some(_) => stats.stored += 1,
                None => stats.rejected += 1,
            }
        }
    }
    Ok(stats)
}

/// Convert CLI options into a [`Filter`], mirroring Nostr filter fields:
/// comma-separated `ids`/`authors`/`kinds`, single `#d`/`#t` values, and
/// `since`/`until`/`limit` bounds.
#[allow(clippy::too_many_arguments)]
fn args_to_filter(
    ids: Option<String>,
    authors: Option<String>,
    kinds: Option<String>,
    d: Option<String>,
    t: Option<String>,
    since: Option<u64>,
    until: Option<u64>,
    limit: Option<usize>,
) -> Filter {
    let mut obj = serde_json::Map::new();
    if let Some(i) = ids {
        let arr = i.split(',').map(|s| Value::String(s.to_string())).collect();
        obj.insert("ids".into(), Value::Array(arr));
    }
    if let Some(a) = authors {
        let arr = a.split(',').map(|s| Value::String(s.to_string())).collect();
        obj.insert("authors".into(), Value::Array(arr));
    }
    if let Some(k) = kinds {
        let arr = k
            .split(',')
            .filter_map(|v| v.parse::<u32>().ok())
            .map(|v| Value::Number(v.into()))
            .collect();
        obj.insert("kinds".into(), Value::Array(arr));
    }
    if let Some(d) = d {
        obj.insert("#d".into(), Value::Array(vec![Value::String(d)]));
    }
    if let Some(t) = t {
        obj.insert("#t".into(), Value::Array(vec![Value::String(t)]));
    }
    if let Some(s) = since {
        obj.insert("since".into(), Value::Number(s.into()));
    }
    if let Some(u) = until {
        obj.insert("until".into(), Value::Number(u.into()));
    }
    if let Some(l) = limit {
        obj.insert("limit".into(), Value::Number((l as u64).into()));
    }
    Filter::from_value(&Value::Object(obj))
}

fn make_store(cfg: &Settings) -> EventStore {
    if cfg.capacity == 0 {
        EventStore::unbounded()
    } else {
        EventStore::new(cfg.capacity)
    }
}

/// Execute the selected CLI subcommand.
fn run(cli: Cli) -> Result<()> {
    let cfg = Settings::from_env(&cli.env)?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cfg.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .try_init();
    let store = make_store(&cfg);
    match cli.command {
        Commands::Query {
            files,
            ids,
            authors,
            kinds,
            d,
            t,
            since,
            until,
            limit,
        } => {
            load(&store, &files)?;
            let filter = args_to_filter(ids, authors, kinds, d, t, since, until, limit);
            let mut events = store.get_timeline(&[filter]);
            // Drop superseded replaceable versions; the timeline is
            // newest-first, so the first event per address is the
            // authoritative one.
            let mut seen = std::collections::HashSet::new();
            events.retain(|ev| seen.insert(ev.address().to_string()));
            for stored in events {
                println!("{}", serde_json::to_string(stored.event())?);
            }
        }
        Commands::Stats { files } => {
            let stats = load(&store, &files)?;
            println!("stored: {}", stats.stored);
            println!("duplicates: {}", stats.duplicates);
            println!("rejected: {}", stats.rejected);
            println!("resident: {}", store.len());
        }
    }
    Ok(())
}

#[cfg(not(test))]
fn main() -> Result<()> {
    let cli = Cli::parse();
    run(cli)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn event_line(id_fill: char, kind: u32, created_at: u64, tags: Value) -> String {
        serde_json::json!({
            "id": id_fill.to_string().repeat(64),
            "pubkey": "b".repeat(64),
            "kind": kind,
            "created_at": created_at,
            "tags": tags,
            "content": "",
            "sig": "",
        })
        .to_string()
    }

    fn write_events(dir: &TempDir, lines: &[String]) -> String {
        let path = dir.path().join("events.ndjson");
        let mut f = fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn load_counts_rejects_and_duplicates() {
        let dir = TempDir::new().unwrap();
        let valid = event_line('a', 1, 10, serde_json::json!([]));
        let file = write_events(
            &dir,
            &[
                valid.clone(),
                valid,
                "not json".to_string(),
                // parses but fails validity
                serde_json::json!({
                    "id": "short", "pubkey": "b".repeat(64), "kind": 1,
                    "created_at": 10, "tags": [], "content": "", "sig": ""
                })
                .to_string(),
            ],
        );
        let store = EventStore::unbounded();
        let stats = load(&store, &[file]).unwrap();
        assert_eq!(stats.stored, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.rejected, 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn args_build_the_expected_filter() {
        let filter = args_to_filter(
            None,
            Some("p1,p2".into()),
            Some("1,x,30023".into()),
            Some("slug".into()),
            None,
            Some(5),
            None,
            Some(3),
        );
        assert_eq!(
            filter.authors.as_ref().unwrap(),
            &vec!["p1".to_string(), "p2".to_string()]
        );
        assert_eq!(filter.kinds.as_ref().unwrap(), &vec![1, 30023]);
        assert_eq!(filter.tags["d"], vec!["slug".to_string()]);
        assert_eq!(filter.since, Some(5));
        assert_eq!(filter.limit, Some(3));
    }

    #[test]
    fn run_query_and_stats() {
        let _g = config::ENV_MUTEX.lock().unwrap();
        for v in ["MONSTR_CAPACITY", "MONSTR_LOG"] {
            std::env::remove_var(v);
        }
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "MONSTR_CAPACITY=100\n").unwrap();
        let file = write_events(
            &dir,
            &[
                event_line('a', 1, 10, serde_json::json!([["t", "news"]])),
                event_line('c', 7, 20, serde_json::json!([])),
            ],
        );
        run(Cli {
            env: env_path.to_str().unwrap().into(),
            command: Commands::Query {
                files: vec![file.clone()],
                ids: None,
                authors: None,
                kinds: Some("1".into()),
                d: None,
                t: Some("news".into()),
                since: None,
                until: None,
                limit: None,
            },
        })
        .unwrap();
        run(Cli {
            env: env_path.to_str().unwrap().into(),
            command: Commands::Stats { files: vec![file] },
        })
        .unwrap();
    }
}
