//! # Coderoom
//!
//! Command line front end:
//!
//! ```text
//! coderoom-server serve --bind 0.0.0.0:1234     # collaboration server
//! coderoom-server run snippet.tsx               # sandboxed execution
//! coderoom-server demo                          # two replicas converge
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use coderoom_core::RoomId;
use coderoom_doc::{CursorState, LocalEdit};
use coderoom_sandbox::{Sandbox, SandboxConfig};
use coderoom_sync::{
    EditorBinding, EditorEvent, Hub, MemoryTransport, ServerConfig, Session, SyncConfigBuilder,
    SyncServer,
};
use tracing_subscriber::EnvFilter;

// ─── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "coderoom-server")]
#[command(about = "Collaborative code rooms: sync server and script sandbox")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the WebSocket collaboration server
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:1234")]
        bind: String,
        /// Connections allowed per room
        #[arg(long, default_value_t = 64)]
        max_peers: usize,
    },
    /// Execute a snippet in the sandbox and print what it logs
    Run {
        file: PathBuf,
        /// javascript, typescript, react or html; guessed from the extension when omitted
        #[arg(long, short)]
        language: Option<String>,
        #[arg(long, default_value_t = coderoom_sandbox::config::DEFAULT_TIMEOUT_MS)]
        timeout_ms: u64,
        #[arg(long, default_value_t = coderoom_sandbox::config::DEFAULT_MAX_OUTPUT_BYTES)]
        max_output_bytes: usize,
    },
    /// Two in-memory sessions edit the same room concurrently and converge
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Commands::Serve { bind, max_peers } => serve(bind, max_peers).await,
        Commands::Run {
            file,
            language,
            timeout_ms,
            max_output_bytes,
        } => run(&file, language, timeout_ms, max_output_bytes).await,
        Commands::Demo => demo().await,
    }
}

// ─── serve ─────────────────────────────────────────────────────────────────

async fn serve(bind: String, max_peers: usize) -> Result<()> {
    let config = ServerConfig {
        bind_addr: bind,
        max_peers_per_room: max_peers,
        ..ServerConfig::default()
    };
    let server = SyncServer::new(config);
    tokio::select! {
        result = server.run() => result.context("server stopped"),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(rooms = server.hub().room_count(), "Shutting down");
            Ok(())
        }
    }
}

// ─── run ───────────────────────────────────────────────────────────────────

fn language_from_extension(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()? {
        "js" | "mjs" | "cjs" => Some("javascript"),
        "ts" => Some("typescript"),
        "jsx" | "tsx" => Some("react"),
        "html" | "htm" => Some("html"),
        _ => None,
    }
}

async fn run(
    file: &Path,
    language: Option<String>,
    timeout_ms: u64,
    max_output_bytes: usize,
) -> Result<()> {
    let source = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let tag = match language {
        Some(tag) => tag,
        None => match language_from_extension(file) {
            Some(tag) => tag.to_string(),
            None => bail!("cannot tell the language of {}; pass --language", file.display()),
        },
    };

    let sandbox = Sandbox::new(
        SandboxConfig::default()
            .with_timeout_ms(timeout_ms)
            .with_max_output_bytes(max_output_bytes),
    );
    let result = sandbox.run_detached(source, &tag).await?;

    for line in &result.output {
        if line.starts_with("[Error]") || line.starts_with("[Execution stopped") {
            println!("{}", line.bright_red());
        } else {
            println!("{line}");
        }
    }
    if let Some(markup) = &result.markup {
        println!("{}", "── markup ──".dimmed());
        println!("{markup}");
    }
    if result.truncated {
        println!("{}", "(output truncated)".yellow());
    }
    Ok(())
}

// ─── demo ──────────────────────────────────────────────────────────────────

fn section(text: &str) {
    println!("\n{} {}", "▸".bright_yellow(), text.bold());
}

fn show(name: &str, text: &str) {
    println!("  {} {:<6} {:?}", "•".bright_green(), name, text);
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn demo() -> Result<()> {
    let hub = Arc::new(Hub::default());
    let room = RoomId::new("demo-room");
    let config = || SyncConfigBuilder::new().sync_interval(100).build();
    let alice = Arc::new(Session::with_config(
        room.clone(),
        MemoryTransport::new(hub.clone(), room.clone()),
        config(),
        Default::default(),
    ));
    let bob = Arc::new(Session::with_config(
        room.clone(),
        MemoryTransport::new(hub.clone(), room.clone()),
        config(),
        Default::default(),
    ));
    alice.connect().await?;
    bob.connect().await?;

    section("Concurrent edits at the same position");
    let mut alice_editor = EditorBinding::new(alice.clone());
    let mut bob_editor = EditorBinding::new(bob.clone());
    alice_editor.handle(EditorEvent::Insert {
        position: 0,
        text: "console.log('hi');".into(),
    });
    bob_editor.handle(EditorEvent::Insert {
        position: 0,
        text: "// greeting\n".into(),
    });
    show("alice", &alice.text());
    show("bob", &bob.text());

    let converged = wait_for(|| alice.text() == bob.text() && alice.len() == 30).await;
    section("After sync");
    show("alice", &alice.text());
    show("bob", &bob.text());
    if !converged {
        bail!("replicas did not converge");
    }
    println!("  {} {}", "✓".bright_green().bold(), "converged".bright_green().bold());

    section("Presence");
    alice_editor.handle(EditorEvent::Cursor(Some(CursorState::with_selection(12, 19))));
    wait_for(|| !bob.remote_cursors().is_empty()).await;
    for cursor in bob.remote_cursors() {
        println!(
            "  {} {} ({}) at {} selecting {:?}",
            "•".bright_green(),
            cursor.label.bold(),
            cursor.color,
            cursor.position,
            cursor.selection
        );
    }

    section("Run the shared snippet");
    bob.edit(LocalEdit::Insert {
        position: bob.len(),
        text: "\nconsole.log([1, 2, 3].map(n => n * 2));".into(),
    });
    let result = Sandbox::default().run_detached(bob.text(), "javascript").await?;
    for line in &result.output {
        println!("  {} {}", "›".dimmed(), line);
    }

    alice.leave();
    bob.leave();
    Ok(())
}
