// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use ratatui::{TerminalOptions, Viewport};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, SessionCommands};
use quill_config::{ChatMode, Config};
use quill_core::Engine;
use quill_store::{
    default_db_path, ListOptions, LoggingStore, NullStore, Session, SessionStatus, SessionStore,
    SqliteStore, StoreOptions,
};
use quill_tools::ToolRegistry;
use quill_tui::{wire_persistence, App, AppOptions};

/// Height of the live area in inline mode (streaming block + composer).
const INLINE_VIEWPORT_HEIGHT: u16 = 16;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Writing to stderr corrupts the TUI display; logs go to a file when
    // QUILL_LOG_FILE is set, or to stderr only for subcommands / --verbose.
    let is_tui = cli.command.is_none();
    init_logging(cli.verbose, is_tui);

    let mut config = quill_config::load(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.store.path = Some(db.clone());
    }
    if cli.no_save {
        config.store.disable = true;
    }
    if cli.alt {
        config.tui.inline = false;
    }
    if cli.inline {
        config.tui.inline = true;
    }
    if let Some(model) = &cli.model {
        apply_model_override(&mut config, model);
    }
    let config = Arc::new(config);

    let store = open_store(&config);

    if let Some(Commands::Sessions { command }) = &cli.command {
        return run_sessions_command(store.as_ref(), command);
    }

    run_chat(cli, config, store).await
}

fn init_logging(verbose: bool, is_tui: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    if let Ok(path) = std::env::var("QUILL_LOG_FILE") {
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(file).with_ansi(false))
                .init();
        }
        return;
    }
    if is_tui && !verbose {
        // Discard: nothing may write to the terminal behind ratatui.
        return;
    }
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// `provider` or `provider/model-name`.
fn apply_model_override(config: &mut Config, spec: &str) {
    match spec.split_once('/') {
        Some((provider, name)) => {
            config.model.provider = provider.to_string();
            config.model.name = name.to_string();
        }
        None => config.model.provider = spec.to_string(),
    }
}

/// Open the configured store, degrading to the null store when persistence
/// is disabled or the database cannot be opened.
fn open_store(config: &Config) -> Arc<dyn SessionStore> {
    if config.store.disable {
        return Arc::new(NullStore);
    }
    let path = config
        .store
        .path
        .clone()
        .unwrap_or_else(default_db_path);
    let opts = StoreOptions {
        read_only: false,
        max_age_days: config.store.max_age_days,
        max_count: config.store.max_count,
    };
    match SqliteStore::open(&path, &opts) {
        Ok(store) => Arc::new(LoggingStore::new(store)),
        Err(e) => {
            eprintln!(
                "warning: cannot open session store at {} ({e}); history will not be saved",
                path.display()
            );
            Arc::new(NullStore)
        }
    }
}

fn run_sessions_command(
    store: &dyn SessionStore,
    command: &SessionCommands,
) -> anyhow::Result<()> {
    match command {
        SessionCommands::List { all, limit, tag } => {
            let summaries = store.list(&ListOptions {
                include_archived: *all,
                limit: *limit,
                tag: tag.clone(),
                ..Default::default()
            })?;
            if summaries.is_empty() {
                println!("no sessions");
                return Ok(());
            }
            println!(
                "{:>4}  {:<10} {:<20} {:<12} {:>5}  {}",
                "#", "status", "model", "updated", "msgs", "name"
            );
            for s in summaries {
                println!(
                    "{:>4}  {:<10} {:<20} {:<12} {:>5}  {}",
                    format!("#{}", s.session.number),
                    s.session.status.as_str(),
                    s.session.model,
                    s.session.updated_at.format("%Y-%m-%d"),
                    s.message_count,
                    s.session.name.as_deref().unwrap_or("-"),
                );
            }
        }
        SessionCommands::Search { query, limit } => {
            let hits = store.search(query, *limit)?;
            if hits.is_empty() {
                println!("no matches");
                return Ok(());
            }
            for hit in hits {
                let label = store
                    .get(&hit.session_id)?
                    .map(|s| format!("#{}", s.number))
                    .unwrap_or_else(|| hit.session_id.clone());
                println!("{label}  {}", hit.snippet);
            }
        }
        SessionCommands::Delete { target } => {
            let session = store
                .get_by_prefix(target)?
                .with_context(|| format!("no session matches '{target}'"))?;
            store.delete(&session.id)?;
            println!("deleted session #{}", session.number);
        }
        SessionCommands::Archive { target } => {
            let mut session = store
                .get_by_prefix(target)?
                .with_context(|| format!("no session matches '{target}'"))?;
            session.archived = true;
            store.update(&session)?;
            println!("archived session #{}", session.number);
        }
    }
    Ok(())
}

async fn run_chat(
    cli: Cli,
    config: Arc<Config>,
    store: Arc<dyn SessionStore>,
) -> anyhow::Result<()> {
    let provider = quill_model::from_config(&config.model)?;
    let mode = cli
        .mode
        .as_deref()
        .map(|m| ChatMode::parse(m).with_context(|| format!("unknown mode '{m}'")))
        .transpose()?
        .unwrap_or_default();

    // Resolve the session: explicit resume, --continue, or a fresh one.
    let resume_target = if cli.continue_last {
        store.get_current()?
    } else {
        cli.resume.clone()
    };
    let (session, history) = match resume_target {
        Some(target) => {
            let mut session = store
                .get_by_prefix(&target)?
                .with_context(|| format!("no session matches '{target}'"))?;
            let history = store.get_messages(&session.id, 0, 0)?;
            session.status = SessionStatus::Active;
            store.update_status(&session.id, SessionStatus::Active)?;
            (session, history)
        }
        None => {
            let mut session = Session::new();
            session.provider_label = provider.name();
            session.provider_key = config.model.provider.clone();
            session.model = provider.model_name().to_string();
            session.mode = mode;
            session.cwd = std::env::current_dir()
                .ok()
                .map(|p| p.display().to_string());
            store.create(&mut session)?;
            (session, Vec::new())
        }
    };
    store.set_current(&session.id)?;

    // Tool implementations are registered by integrations; the core carries
    // an empty registry and the reserved names.
    let tools = Arc::new(ToolRegistry::new());

    let mut engine = Engine::new(
        Arc::clone(&provider),
        Arc::clone(&tools),
        &config.engine,
        session.id.clone(),
    );
    if let Some(window) = config.model.context_window {
        engine.set_input_limit(window as usize);
    }
    engine.set_search(session.search_flag, false);
    engine.set_system_prompt(Some(system_prompt(mode)));
    engine.seed_history(history.clone());

    let messages = Arc::new(Mutex::new(history));
    wire_persistence(
        &mut engine,
        Arc::clone(&store),
        session.id.clone(),
        Arc::clone(&messages),
    );

    let (engine_tx, event_rx, interjection, cancel_slot) = App::spawn_engine(engine);

    let inline = config.tui.inline;
    let app = App::new(
        Arc::clone(&config),
        Arc::clone(&store),
        session,
        messages,
        engine_tx.clone(),
        event_rx,
        interjection,
        cancel_slot,
        AppOptions {
            initial_prompt: cli.initial_prompt(),
            inline,
            clipboard: None,
        },
    );

    let mut terminal = if inline {
        ratatui::init_with_options(TerminalOptions {
            viewport: Viewport::Inline(INLINE_VIEWPORT_HEIGHT),
        })
    } else {
        ratatui::init()
    };
    let result = app.run(&mut terminal).await;
    ratatui::restore();

    drop(engine_tx);
    store.close().ok();
    result
}

fn system_prompt(mode: ChatMode) -> String {
    let base = "You are quill, a careful assistant running inside a terminal. \
                Answer in concise markdown; prefer tool calls over guessing \
                when tools are available.";
    let mode_note = match mode {
        ChatMode::Chat => "",
        ChatMode::Ask => "\nAnswer questions only; do not modify anything.",
        ChatMode::Plan => "\nProduce a plan of action before any change is made.",
        ChatMode::Exec => "\nCarry out the requested task directly.",
    };
    format!("{base}{mode_note}")
}
