//! p4cache: inspect and repair saved workspace caches
//!
//! Subcommands:
//! - `list`: Workspaces with a saved document
//! - `show`: Open files and queued updates of one workspace
//! - `drop-pending`: Discard the queued updates of one workspace
//! - `forget`: Delete a workspace's saved document

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use p4cache::{ClientLocalServerState, ClientServerId, JsonFileStore, StateStore};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "p4cache")]
#[command(about = "Inspect and repair saved workspace caches", long_about = None)]
struct Cli {
    /// Directory holding the saved workspace documents
    #[arg(long, env = "P4CACHE_STATE_DIR")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List workspaces with a saved document
    List,

    /// Show open files and queued updates
    Show {
        /// Server configuration id (user@port)
        #[arg(long)]
        server: String,

        /// Workspace name
        #[arg(long)]
        client: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Discard queued updates; they will never reach the server
    DropPending {
        #[arg(long)]
        server: String,

        #[arg(long)]
        client: String,
    },

    /// Delete the saved document
    Forget {
        #[arg(long)]
        server: String,

        #[arg(long)]
        client: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "p4cache=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let store = JsonFileStore::open(&cli.state_dir).map_err(|e| miette::miette!("{}", e))?;

    match cli.command {
        Commands::List => {
            for line in list(&store)? {
                println!("{}", line);
            }
            Ok(())
        }
        Commands::Show {
            server,
            client,
            json,
        } => {
            let state = load(&store, &workspace(server, client))?;
            if json {
                println!("{}", show_json(&state)?);
            } else {
                print!("{}", show_text(&state));
            }
            Ok(())
        }
        Commands::DropPending { server, client } => {
            let dropped = drop_pending(&store, &workspace(server, client))?;
            println!("dropped {} queued updates", dropped);
            Ok(())
        }
        Commands::Forget { server, client } => {
            let id = workspace(server, client);
            store.remove(&id).map_err(|e| miette::miette!("{}", e))?;
            info!(client = %id, "saved document deleted");
            Ok(())
        }
    }
}

fn workspace(server: String, client: String) -> ClientServerId {
    ClientServerId::new(server, Some(client))
}

fn list(store: &JsonFileStore) -> Result<Vec<String>> {
    let mut clients = store.list().map_err(|e| miette::miette!("{}", e))?;
    clients.sort();
    Ok(clients.iter().map(ToString::to_string).collect())
}

fn load(store: &JsonFileStore, id: &ClientServerId) -> Result<ClientLocalServerState> {
    let doc = store
        .load(id)
        .map_err(|e| miette::miette!("{}", e))?
        .ok_or_else(|| miette::miette!("no saved document for {}", id))?;
    ClientLocalServerState::from_document(doc).map_err(|e| miette::miette!("{}", e))
}

fn show_text(state: &ClientLocalServerState) -> String {
    let mut out = format!("workspace {}\n", state.client());
    let open = state.open_files();
    out.push_str(&format!("open files: {}\n", open.len()));
    for file in &open {
        let location = file
            .depot_path
            .clone()
            .or_else(|| file.local_path.as_ref().map(ToString::to_string))
            .unwrap_or_else(|| "?".to_string());
        out.push_str(&format!(
            "  {:?} @{} {} ({:?})\n",
            file.action, file.changelist, location, file.status
        ));
    }
    out.push_str(&format!("queued updates: {}\n", state.pending().len()));
    for update in state.pending() {
        let files: Vec<&str> = update.ids.iter().map(String::as_str).collect();
        out.push_str(&format!("  {} {}\n", update.action, files.join(" -> ")));
    }
    out
}

fn show_json(state: &ClientLocalServerState) -> Result<String> {
    let value = serde_json::json!({
        "client": state.client().to_string(),
        "open_files": state.open_files(),
        "pending": state.pending(),
    });
    serde_json::to_string_pretty(&value).map_err(|e| miette::miette!("{}", e))
}

fn drop_pending(store: &JsonFileStore, id: &ClientServerId) -> Result<usize> {
    let mut state = load(store, id)?;
    let dropped = state.clear_pending();
    store
        .save(&state.to_document())
        .map_err(|e| miette::miette!("{}", e))?;
    info!(client = %id, dropped, "queued updates dropped");
    Ok(dropped)
}
