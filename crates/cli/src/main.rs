use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_apply::{diff_summary, strip_noisy};
use keel_broker::Broker;
use keel_bus::{Bus, MemoryBus};
use keel_core::{env_or, Error, Event, EventOperation, ObjectKey, Outcome, WILDCARD};
use keel_kv::{BucketConfig, KeyValue, MemoryKv, BUCKET_OBJECTS};
use keel_persist::SqliteJournal;
use keel_store::{collect, Collection, GarbageCollector, GcConfig, Store, StoreService};
use keel_watch::{FnHandler, Watcher, WatcherConfig};
use serde::Deserialize;
use serde_json::Value as Json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel control plane CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite database holding the object bucket
    #[arg(long = "db", env = "KEEL_DB_PATH", global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the store, garbage collector and broker in this process until Ctrl-C.
    /// Holds the db, so other keelctl commands on it fail while this runs.
    Serve {
        /// Also print events for this pattern, e.g. "widget" or "widget.team.*"
        #[arg(long = "watch")]
        watch: Option<String>,
    },
    /// Apply objects from a YAML or JSON file (multi-document YAML allowed)
    Apply {
        #[arg(short = 'f', long = "filename")]
        file: String,
        /// Field manager recorded for the applied fields
        #[arg(long = "manager", default_value = "keelctl")]
        manager: String,
        /// Take ownership of fields held by other managers
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
    },
    /// Print one object, addressed as kind.account.name
    Get { key: String },
    /// List objects matching a pattern ("widget", "widget.team.*", "*")
    List {
        #[arg(default_value = WILDCARD)]
        pattern: String,
    },
    /// Mark an object for deletion and collect it when nothing blocks
    Delete {
        key: String,
        /// Seconds before the object becomes eligible for removal
        #[arg(long = "grace", default_value_t = 0)]
        grace: u64,
    },
    /// Print +/~/- lines for objects matching a pattern until Ctrl-C
    Watch {
        #[arg(default_value = WILDCARD)]
        pattern: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// `widget` means every widget; `*` parts are wildcards.
fn parse_pattern(s: &str) -> Result<ObjectKey> {
    let unstar = |t: &str| if t == WILDCARD { String::new() } else { t.to_string() };
    let key = if s.contains('.') {
        let k = ObjectKey::from_str(s)?;
        ObjectKey::new(unstar(&k.kind), unstar(&k.account), unstar(&k.name))
    } else {
        ObjectKey::kind_pattern(&unstar(s))
    };
    key.validate_pattern()?;
    Ok(key)
}

fn parse_key(s: &str) -> Result<ObjectKey> {
    let key = ObjectKey::from_str(s)?;
    key.validate()?;
    Ok(key)
}

/// Each process keeps its own copy of the bucket, so the journal is held exclusively
/// for as long as the command runs. A second keelctl on the same db fails here.
fn open_objects(db: Option<&str>) -> Result<Arc<dyn KeyValue>> {
    let journal = match db {
        Some(path) => SqliteJournal::open_exclusive(path)?,
        None => SqliteJournal::open_default()?,
    };
    let kv = MemoryKv::with_journal(BucketConfig::new(BUCKET_OBJECTS), Arc::new(journal))
        .context("restoring object bucket")?;
    Ok(Arc::new(kv))
}

/// Split a manifest into documents, skipping empty ones.
fn read_manifests(path: &str) -> Result<Vec<Json>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let mut docs = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(&text) {
        let v = Json::deserialize(doc).with_context(|| format!("parsing {}", path))?;
        match v {
            Json::Null => continue,
            Json::Array(items) => docs.extend(items),
            other => docs.push(other),
        }
    }
    Ok(docs)
}

fn manifest_key(doc: &Json) -> Result<ObjectKey> {
    let field = |v: Option<&Json>, what: &str| {
        v.and_then(Json::as_str).map(str::to_string).ok_or_else(|| anyhow!("manifest is missing {}", what))
    };
    let key = ObjectKey::new(
        field(doc.get("kind"), "kind")?,
        field(doc.pointer("/metadata/account"), "metadata.account")?,
        field(doc.pointer("/metadata/name"), "metadata.name")?,
    );
    key.validate()?;
    Ok(key)
}

fn print_json(v: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let objects = open_objects(cli.db.as_deref())?;
    let store = Store::new(Arc::clone(&objects));

    match cli.command {
        Commands::Serve { watch } => serve(objects, watch.as_deref()).await?,
        Commands::Apply { file, manager, force } => {
            let docs = read_manifests(&file)?;
            info!(file = %file, docs = docs.len(), manager = %manager, force, "apply invoked");
            let mut results = Vec::new();
            for doc in docs {
                let key = manifest_key(&doc)?;
                let before = match store.get(&key).await {
                    Ok(v) => Some(strip_noisy(v)),
                    Err(Error::NotFound(_)) => None,
                    Err(e) => return Err(e.into()),
                };
                let after = store.apply(&key, doc, &manager, force).await.with_context(|| format!("applying {}", key))?;
                match cli.output {
                    Output::Human => match &before {
                        None => println!("{} created", key),
                        Some(b) => {
                            let d = diff_summary(&strip_noisy(after.clone()), b);
                            if d.is_empty() {
                                println!("{} unchanged", key);
                            } else {
                                println!("{} configured (+{} ~{} -{})", key, d.adds, d.updates, d.removes);
                            }
                        }
                    },
                    Output::Json => results.push(after),
                }
            }
            if cli.output == Output::Json {
                print_json(&results)?;
            }
        }
        Commands::Get { key } => {
            let obj = store.get(&parse_key(&key)?).await?;
            match cli.output {
                Output::Human => print!("{}", serde_yaml::to_string(&obj)?),
                Output::Json => print_json(&obj)?,
            }
        }
        Commands::List { pattern } => {
            let items = store.list(&parse_pattern(&pattern)?).await?;
            match cli.output {
                Output::Human => {
                    println!("{:<16} {:<16} {:<24} {:>8}  DELETING", "KIND", "ACCOUNT", "NAME", "REVISION");
                    for item in &items {
                        let s = |p: &str| item.pointer(p).and_then(Json::as_str).unwrap_or("-").to_string();
                        let rev = item.pointer("/metadata/revision").and_then(Json::as_u64).unwrap_or(0);
                        println!(
                            "{:<16} {:<16} {:<24} {:>8}  {}",
                            s("/kind"),
                            s("/metadata/account"),
                            s("/metadata/name"),
                            rev,
                            s("/metadata/deletionTimestamp")
                        );
                    }
                }
                Output::Json => print_json(&items)?,
            }
        }
        Commands::Delete { key, grace } => {
            let key = parse_key(&key)?;
            store.delete(&key, Duration::from_secs(grace)).await?;
            // Nothing else runs in this process; try to finish the cascade now.
            let outcome = collect(&store, &key, GcConfig::from_env().retry).await?;
            let state = match outcome {
                Collection::Purged | Collection::Absent => "deleted".to_string(),
                Collection::Blocked(d) => format!("marked for deletion (blocked, retry in {}s)", d.as_secs()),
                Collection::Live => "still live".to_string(),
            };
            match cli.output {
                Output::Human => println!("{} {}", key, state),
                Output::Json => print_json(&serde_json::json!({ "key": key.to_string(), "state": state }))?,
            }
        }
        Commands::Watch { pattern } => {
            let pattern = parse_pattern(&pattern)?;
            info!(pattern = %pattern, "watch invoked");
            let config = WatcherConfig { pattern, ..WatcherConfig::all_kinds() };
            let output = cli.output;
            let watcher = Watcher::start(objects, config, Arc::new(FnHandler(move |_c: CancellationToken, ev: Event| async move {
                print_event(output, &ev);
                Ok::<_, Error>(Outcome::Done)
            })))
            .await?;
            if signal::ctrl_c().await.is_err() {
                warn!("failed to listen for Ctrl-C");
            }
            info!("Ctrl-C received; shutting down watch");
            watcher.stop().await;
        }
    }

    Ok(())
}

fn print_event(output: Output, ev: &Event) {
    match output {
        Output::Human => {
            let mark = match ev.operation {
                EventOperation::Put => "+",
                EventOperation::Delete => "~",
                EventOperation::Purge => "-",
            };
            println!("{} {} @{}", mark, ev.key, ev.revision);
        }
        Output::Json => match serde_json::to_string(ev) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(key = %ev.key, error = %e, "failed to encode event"),
        },
    }
}

/// Host the store, garbage collector and broker on an in-process bus.
async fn serve(objects: Arc<dyn KeyValue>, watch: Option<&str>) -> Result<()> {
    let cancel = CancellationToken::new();
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
    let store = Store::new(Arc::clone(&objects)).with_bus(Arc::clone(&bus));

    let store_task = StoreService::new(store.clone(), Arc::clone(&bus)).start(cancel.clone()).await?;
    let gc = GarbageCollector::new(store.clone()).start(cancel.clone()).await?;
    let broker_task = Broker::new(Arc::clone(&bus)).start(cancel.clone()).await?;

    let printer = match watch {
        Some(p) => {
            let config = WatcherConfig { pattern: parse_pattern(p)?, ..WatcherConfig::all_kinds() };
            let handler = FnHandler(|_c: CancellationToken, ev: Event| async move {
                print_event(Output::Human, &ev);
                Ok::<_, Error>(Outcome::Done)
            });
            Some(Watcher::start_with_cancel(objects, config, Arc::new(handler), cancel.child_token()).await?)
        }
        None => None,
    };
    gc.wait_until_init().await;
    info!(objects = store.list(&ObjectKey::all()).await?.len(), "keel serving; Ctrl-C to stop");

    if signal::ctrl_c().await.is_err() {
        warn!("failed to listen for Ctrl-C");
    }
    info!("Ctrl-C received; shutting down");
    cancel.cancel();
    let grace = Duration::from_secs(env_or("KEEL_STOP_TIMEOUT_SECS", 30));
    let drained = tokio::time::timeout(grace, async {
        gc.stop().await;
        if let Some(w) = &printer {
            w.stop().await;
        }
        let _ = store_task.await;
        let _ = broker_task.await;
    })
    .await;
    if drained.is_err() {
        warn!(grace_secs = grace.as_secs(), "shutdown grace elapsed with work in flight");
    }
    Ok(())
}
