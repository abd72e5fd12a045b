//! schemapad demo: three simulated collaborators editing one schema.
//!
//! Usage: `schemapad-demo [--data DIR] [--config FILE]`
//!
//! Without `--data` documents live in memory. Set `RUST_LOG=debug` to
//! watch the binding, presence and save pipeline at work.

mod peer;

use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;
use log::{error, info, warn};
use schemapad_collab::{
    CollabConfig, CollabResult, DocumentStore, FilePreferences, LocalHub, MemoryPreferences,
    MemoryStore, Preferences, RocksStore, SessionManager, SessionParams, StoreConfig,
    DEFAULT_SCHEMA,
};
use schemapad_core::TextModel;
use tokio::task::LocalSet;
use tokio::time::{sleep, Duration};

use peer::DemoPeer;

#[derive(Parser, Debug)]
#[command(name = "schemapad-demo")]
#[command(about = "Three simulated collaborators editing one schema")]
#[command(version)]
struct Args {
    /// RocksDB directory (documents stay in memory if omitted)
    #[arg(long, value_name = "DIR")]
    data: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

async fn settle() {
    sleep(Duration::from_millis(20)).await;
}

async fn run<S: DocumentStore + 'static>(store: Rc<S>, config: CollabConfig) -> CollabResult<()> {
    let hub = Rc::new(LocalHub::new(config.hub_capacity));
    let alice_prefs: Rc<dyn Preferences> = match &config.preferences_path {
        Some(path) => Rc::new(FilePreferences::open(path)?),
        None => Rc::new(MemoryPreferences::new()),
    };

    let manager = SessionManager::new(hub.clone(), store.clone(), alice_prefs.clone(), config.clone());
    let record = manager.create("Demo schema", DEFAULT_SCHEMA).await?;
    info!("created schema {} (public, read-only link)", record.id);
    let Some(params) = SessionParams::from_record(&record) else {
        warn!("store returned a read-only record for a new schema");
        return Ok(());
    };

    let alice = DemoPeer::join(
        "alice",
        &hub,
        &store,
        alice_prefs.clone(),
        &config,
        &params,
        DEFAULT_SCHEMA,
    )?;
    sleep(config.cold_start_window() * 2).await;

    let bob = DemoPeer::join(
        "bob",
        &hub,
        &store,
        Rc::new(MemoryPreferences::new()),
        &config,
        &params,
        "",
    )?;
    let carol = DemoPeer::join(
        "carol",
        &hub,
        &store,
        Rc::new(MemoryPreferences::new()),
        &config,
        &params,
        "",
    )?;
    settle().await;

    bob.append("\ntype Product {\n  id: ID!\n  name: String!\n}\n")?;
    carol.type_at(0, "# shared with the team\n")?;
    alice.session.change_name("Alice", alice_prefs.as_ref())?;
    settle().await;

    if let Some(start) = carol.model.value().find("Query") {
        carol.editor.select_offsets(start, start + "Query".len());
    }
    bob.editor.set_caret_offset(bob.model.len());
    settle().await;

    for peer in [&alice, &bob, &carol] {
        peer.report();
    }

    sleep(config.persistence.debounce() * 2).await;
    let saved = manager.load(&params.credential).await?;
    match saved {
        Some(saved) if saved.sdl == alice.session.text().text() => {
            info!("saved copy is current ({} bytes)", saved.sdl.len())
        }
        Some(_) => warn!("saved copy lags behind the session"),
        None => warn!("schema disappeared from the store"),
    }

    for peer in [&alice, &bob, &carol] {
        peer.session.close();
    }
    println!("{}", alice.model.value());
    Ok(())
}

fn main() {
    env_logger::init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => CollabConfig::from_json_file(path),
        None => Ok(CollabConfig::default()),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("bad configuration: {e}");
            std::process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("cannot start runtime: {e}");
            std::process::exit(1);
        }
    };

    info!("Starting schemapad demo...");
    let result = LocalSet::new().block_on(&runtime, async move {
        match args.data {
            Some(path) => {
                let store = RocksStore::open(StoreConfig {
                    path,
                    ..StoreConfig::default()
                })?;
                run(Rc::new(store), config).await
            }
            None => run(Rc::new(MemoryStore::new()), config).await,
        }
    });
    if let Err(e) = result {
        error!("demo failed: {e}");
        std::process::exit(1);
    }
}
