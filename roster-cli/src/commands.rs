//! Subcommands of the `roster` binary.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use roster_collab::{
    CollectionMirror, MemoryProvider, MirrorConfig, MirrorEvent, Registry, ReplicaServer,
    RocksProvider, ServerConfig, StoreConfig, StoreProvider,
};
use roster_core::{Document, Student};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use crate::input::{self, Input, InputError};
use crate::pairing::{self, Roster, RosterArgs, SessionArgs};
use crate::view;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Student roster with local-first storage and replication.
#[derive(Parser, Debug)]
#[command(name = "roster", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a replica server that devices sync with
    Serve {
        /// Address to listen on
        #[clap(long, default_value = "127.0.0.1:9090")]
        bind: String,
        /// RocksDB directory; collections are kept in memory when omitted
        #[clap(long)]
        data: Option<PathBuf>,
    },
    /// Open the student list
    #[command(long_about = r#"Open the student list

Reads commands from stdin and prints the list again after every change.

    $ roster students --data ./roster_data --remote ws://127.0.0.1:9090

Type 'help' for the list of commands."#)]
    Students {
        /// RocksDB directory; the list is kept in memory when omitted
        #[clap(long)]
        data: Option<PathBuf>,
        /// Replica server base URL, e.g. ws://127.0.0.1:9090
        #[clap(long)]
        remote: Option<String>,
        /// Collection to open
        #[clap(long, default_value = "students")]
        collection: String,
    },
    /// Add a tutor to the roster
    Tutor {
        first: String,
        last: String,
        #[command(flatten)]
        roster: RosterArgs,
    },
    /// Suggest a pairing of active students with active tutors
    #[command(long_about = r#"Suggest a pairing of active students with active tutors

Students with the most past sessions are placed first, each with the tutor
that gives the best score against past pairings.

    $ roster pair --date 20130413 --session am_purple --save"#)]
    Pair {
        #[command(flatten)]
        session: SessionArgs,
        /// Record the suggestion as this session's pairing
        #[clap(long)]
        save: bool,
        #[command(flatten)]
        roster: RosterArgs,
    },
    /// Score the pairing used for a past session against a suggestion
    Score {
        #[command(flatten)]
        session: SessionArgs,
        #[command(flatten)]
        roster: RosterArgs,
    },
}

impl Cli {
    pub async fn run(self) -> Result<(), BoxError> {
        match self.command {
            Commands::Serve { bind, data } => serve(bind, data).await,
            Commands::Students {
                data,
                remote,
                collection,
            } => students(data, remote, &collection).await,
            Commands::Tutor {
                first,
                last,
                roster,
            } => {
                let added = pairing::add_tutor(&Roster::open(roster), first, last).await?;
                println!("added tutor {}", added.id().unwrap_or("-"));
                Ok(())
            }
            Commands::Pair {
                session,
                save,
                roster,
            } => {
                let roster = Roster::open(roster);
                let (suggested, attendance) = pairing::suggest(&roster, &session).await?;
                if save {
                    let saved = pairing::save(&roster, &session, &suggested, &attendance).await?;
                    println!("saved {saved} pairs");
                }
                Ok(())
            }
            Commands::Score { session, roster } => {
                pairing::score_past(&Roster::open(roster), &session).await?;
                Ok(())
            }
        }
    }
}

// ─── serve ───────────────────────────────────────────────────────────────────

async fn serve(bind: String, data: Option<PathBuf>) -> Result<(), BoxError> {
    match &data {
        Some(path) => log::info!("Storing collections under {}", path.display()),
        None => log::info!("Storing collections in memory"),
    }
    let server = ReplicaServer::new(ServerConfig {
        bind_addr: bind,
        storage_path: data,
        ..ServerConfig::default()
    });
    println!("replica server on ws://{}", server.bind_addr());

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            log::info!(
                "Shutting down after {} connections ({} docs received, {} sent)",
                stats.total_connections, stats.docs_received, stats.docs_sent
            );
            Ok(())
        }
    }
}

// ─── students ────────────────────────────────────────────────────────────────

pub(crate) fn provider(data: Option<PathBuf>) -> Arc<dyn StoreProvider> {
    match data {
        Some(path) => Arc::new(RocksProvider::new(StoreConfig {
            path,
            ..StoreConfig::default()
        })),
        None => Arc::new(MemoryProvider::new()),
    }
}

async fn students(
    data: Option<PathBuf>,
    remote: Option<String>,
    collection: &str,
) -> Result<(), BoxError> {
    let mut config = MirrorConfig::default();
    if let Some(remote) = remote {
        config = config.with_remote(remote);
    }
    let registry = Registry::new(provider(data), config);
    let mirror = registry.get(collection).await;

    let renderer = tokio::spawn(render_on_change(mirror.clone(), mirror.subscribe()));
    println!("{}", input::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        match input::parse(&line) {
            Ok(Input::Quit) => break,
            Ok(command) => {
                if let Err(e) = execute(&mirror, command).await {
                    eprintln!("error: {e}");
                }
            }
            Err(InputError::Empty) => {}
            Err(e) => eprintln!("{e}"),
        }
    }

    registry.stop_all_sync().await?;
    renderer.abort();
    Ok(())
}

async fn execute(mirror: &CollectionMirror, command: Input) -> Result<(), BoxError> {
    match command {
        Input::Add(name) => {
            let doc = Document::from_record(&Student::named(name))?;
            let added = mirror.add(doc).await?;
            println!("added {}", added.id().unwrap_or("-"));
        }
        Input::Remove(id) => {
            mirror.remove(&id).await?;
            println!("removed {id}");
        }
        Input::Rename { id, name } => {
            // Keep the other fields of the entry being renamed.
            let mut fields = mirror.get(&id).map(|doc| doc.fields).unwrap_or_default();
            fields.insert("name".to_string(), Value::String(name));
            mirror.update(&id, fields).await?;
        }
        Input::Sync => {
            let report = mirror.sync_once().await?;
            println!("synced: {} loaded, {} failed", report.loaded, report.failed.len());
        }
        Input::Online => {
            let status = mirror.start_sync().await?;
            if status.already_active {
                println!("already online");
            }
        }
        Input::Offline => {
            if !mirror.stop_sync().await? {
                println!("already offline");
            }
        }
        Input::List => print!("{}", view::render(mirror.name(), &mirror.items())),
        Input::Help => println!("{}", input::HELP),
        Input::Quit => {}
    }
    Ok(())
}

/// Print the list after every burst of mirror events.
async fn render_on_change(mirror: Arc<CollectionMirror>, mut events: broadcast::Receiver<MirrorEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(line) = view::status(&event) {
                    println!("{line}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::debug!("Renderer skipped {n} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
        // A refresh arrives as Cleared plus one Loaded per document.
        while let Ok(event) = events.try_recv() {
            if let Some(line) = view::status(&event) {
                println!("{line}");
            }
        }
        print!("{}", view::render(mirror.name(), &mirror.items()));
    }
}
