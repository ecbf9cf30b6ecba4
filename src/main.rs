use std::fs::OpenOptions;
use std::io;
use std::process::{ExitCode, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyEventKind};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod actions;
mod activity;
mod agents;
mod app;
mod config;
mod controller;
mod diff;
mod error;
mod exec;
mod history;
mod instance;
mod store;
mod tmux;

use actions::Action;
use app::App;
use config::Config;
use controller::{Controller, ControllerHandle, ForkTarget};
use diff::GitDiffEngine;
use instance::Backends;
use store::Store;
use tmux::TmuxClient;

const SEARCH_LIMIT: usize = 200;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("asmgr: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = init_logging(&config) {
        eprintln!("asmgr: {e:#}");
        return ExitCode::from(1);
    }
    if !exec::is_available(&config.tmux_binary, "-V").await {
        eprintln!("asmgr: cannot run '{}'; is tmux installed?", config.tmux_binary);
        return ExitCode::from(2);
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "asmgr exited with an error");
            eprintln!("asmgr: {e:#}");
            ExitCode::from(1)
        }
    }
}

/// The terminal belongs to the TUI, so logs go to a file under the root
fn init_logging(config: &Config) -> Result<()> {
    std::fs::create_dir_all(&config.root)
        .with_context(|| format!("creating {}", config.root.display()))?;
    let path = config.log_path();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let store = Store::open(config.root.clone()).context("opening state store")?;
    let backends = Arc::new(Backends {
        mux: Arc::new(TmuxClient::from_config(&config)),
        vcs: Arc::new(GitDiffEngine::from_config(&config)),
        store: Arc::new(store),
        config: config.clone(),
    });
    let (controller, controller_task) = Controller::spawn(backends)?;
    tracing::info!(root = %config.root.display(), "asmgr started");

    // Create event channel
    let (tx, mut rx) = mpsc::unbounded_channel::<Action>();

    // Input is read on its own thread; it stands down while a tmux client
    // owns the terminal.
    let paused = Arc::new(AtomicBool::new(false));
    spawn_input(tx.clone(), paused.clone());

    // Forward published controller state
    let mut state = controller.subscribe();
    let state_tx = tx.clone();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let snapshot = state.borrow_and_update().clone();
            if state_tx.send(Action::SnapshotUpdated(snapshot)).is_err() {
                break;
            }
        }
    });

    let cwd = std::env::current_dir().unwrap_or_else(|_| config::home_dir());
    let mut app = App::new(cwd);
    app.handle_action(Action::SnapshotUpdated(controller.get_snapshot()))?;

    let mut terminal = ratatui::init();

    // Main event loop
    let result = loop {
        if let Err(e) = terminal.draw(|f| app.render(f)) {
            break Err(e.into());
        }

        for pending_action in app.take_pending_actions() {
            match pending_action {
                Action::Attach { id, window } => {
                    match controller.attach(&id, window).await {
                        Ok(instruction) => {
                            if let Ok((cols, rows)) = crossterm::terminal::size() {
                                if let Err(e) = controller.resize_pane(&id, cols, rows).await {
                                    tracing::debug!(error = %e, "resize before attach failed");
                                }
                            }
                            // Suspend TUI and hand the terminal to tmux
                            paused.store(true, Ordering::SeqCst);
                            ratatui::restore();
                            let status = run_foreground(&instruction.argv);
                            terminal = ratatui::init();
                            paused.store(false, Ordering::SeqCst);

                            if let Err(e) = status {
                                app.error(format!("Failed to attach: {}", e));
                            }
                        }
                        Err(e) => app.error(format!("Failed to attach: {}", e)),
                    }
                }
                Action::Search(query) => {
                    let controller = controller.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let action = match controller.search(&query, SEARCH_LIMIT, false).await {
                            Ok(results) => Action::SearchResults(results),
                            Err(e) => Action::Error(format!("Search failed: {}", e)),
                        };
                        let _ = tx.send(action);
                    });
                }
                Action::ListConversations(id) => {
                    let Some(agent) = app.snapshot.instance(&id).map(|i| i.record.agent) else {
                        continue;
                    };
                    let controller = controller.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let action = match controller.list_conversations(agent, &id).await {
                            Ok(conversations) => Action::ConversationsListed { id, conversations },
                            Err(e) => Action::Error(format!("Cannot list conversations: {}", e)),
                        };
                        let _ = tx.send(action);
                    });
                }
                Action::ShowConversation(entry) => {
                    let controller = controller.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let action = match controller.conversation(entry).await {
                            Ok(turns) => Action::ConversationLoaded(turns),
                            Err(e) => Action::Error(format!("Cannot load conversation: {}", e)),
                        };
                        let _ = tx.send(action);
                    });
                }
                other => match dispatch(&controller, other).await {
                    Ok(Some(message)) => app.info(message),
                    Ok(None) => {}
                    Err(e) => app.error(e.to_string()),
                },
            }
        }

        // Handle events from channel
        tokio::select! {
            Some(action) = rx.recv() => {
                match app.handle_action(action) {
                    Ok(true) => break Ok(()),
                    Ok(false) => {}
                    Err(e) => break Err(e),
                }
            }
            else => break Ok(()),
        }
    };

    // Restore terminal; running sessions are left alive
    ratatui::restore();
    controller.shutdown();
    if let Err(e) = controller_task.await {
        tracing::warn!(error = %e, "controller task ended abnormally");
    }
    tracing::info!("asmgr exited");
    result
}

fn spawn_input(tx: mpsc::UnboundedSender<Action>, paused: Arc<AtomicBool>) {
    std::thread::spawn(move || loop {
        if paused.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(50));
            continue;
        }
        if event::poll(Duration::from_millis(100)).unwrap_or(false) {
            if let Ok(Event::Key(key)) = event::read() {
                if key.kind == KeyEventKind::Press && tx.send(Action::KeyPress(key)).is_err() {
                    break;
                }
            }
        }
    });
}

fn run_foreground(argv: &[String]) -> io::Result<ExitStatus> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty attach command"))?;
    std::process::Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
}

/// Run one controller request; returns a message worth showing
async fn dispatch(controller: &ControllerHandle, action: Action) -> error::Result<Option<String>> {
    match action {
        Action::Create(spec) => {
            let name = spec.name.clone();
            controller.create_instance(spec).await?;
            Ok(Some(format!("Session '{}' created", name)))
        }
        Action::Start { id, resume_id } => {
            controller.start(&id, resume_id).await?;
            Ok(None)
        }
        Action::Stop(id) => {
            controller.stop(&id).await?;
            Ok(Some("Session stopped".to_string()))
        }
        Action::Delete(id) => {
            controller.delete(&id).await?;
            Ok(Some("Session deleted".to_string()))
        }
        Action::AddTab { id, spec } => {
            let index = controller.add_window(&id, spec).await?;
            controller.select_window(&id, index).await?;
            Ok(None)
        }
        Action::CloseTab { id, index } => controller.close_window(&id, index).await.map(|_| None),
        Action::SelectTab { id, index } => controller.select_window(&id, index).await.map(|_| None),
        Action::FollowTab { id, index } => {
            controller.follow_window(&id, index).await?;
            Ok(Some(format!("Window {} is now a tab", index)))
        }
        Action::SendPrompt { id, index, text } => {
            controller.send_prompt(&id, index, &text).await?;
            Ok(None)
        }
        Action::Fork { id, name, as_tab } => match controller.fork(&id, &name, as_tab).await? {
            ForkTarget::Tab { index, .. } => Ok(Some(format!("Forked into tab {}", index))),
            ForkTarget::Sibling { instance_id } => {
                controller.select(Some(instance_id));
                Ok(Some(format!("Forked into session '{}'", name)))
            }
        },
        Action::SendKey { id, index, key } => controller.send_key(&id, index, &key).await.map(|_| None),
        Action::RenameTab { id, index, name } => {
            controller.rename_window(&id, index, &name).await.map(|_| None)
        }
        Action::Rename { id, name } => controller.rename(&id, &name).await.map(|_| None),
        Action::SetNotes { id, notes } => controller.set_notes(&id, &notes).await.map(|_| None),
        Action::SetColor { id, color } => controller.set_color(&id, color, None).await.map(|_| None),
        Action::Group { id, name } => assign_group(controller, &id, name).await,
        Action::ImportProject(from) => {
            let moved = controller.import_project(&from).await?;
            Ok(Some(format!("Imported {} session(s)", moved)))
        }
        Action::Reorder(ids) => controller.reorder(ids).await.map(|_| None),
        Action::SwitchProject(id) => controller.switch_project(&id).await.map(|_| None),
        Action::CreateProject(name) => {
            let project = controller.create_project(&name).await?;
            controller.switch_project(&project.id).await?;
            Ok(Some(format!("Project '{}' created", project.name)))
        }
        Action::Select(id) => {
            controller.select(id);
            Ok(None)
        }
        Action::SetPreviewTab(tab) => {
            controller.set_preview_tab(tab);
            Ok(None)
        }
        Action::SetDiffMode(mode) => {
            controller.set_diff_mode(mode);
            Ok(None)
        }
        Action::SetTeaserWidth(width) => {
            controller.set_teaser_width(width);
            Ok(None)
        }
        _ => Ok(None),
    }
}

/// Move `id` into the group called `name`, creating it on first use. A
/// group left without members is removed.
async fn assign_group(
    controller: &ControllerHandle,
    id: &str,
    name: Option<String>,
) -> error::Result<Option<String>> {
    let snapshot = controller.get_snapshot();
    let previous = snapshot
        .groups
        .iter()
        .find(|g| g.members.iter().any(|m| m == id))
        .map(|g| g.id.clone());

    let target = match name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => match snapshot.groups.iter().find(|g| g.name == name) {
            Some(group) => Some(group.id.clone()),
            None => Some(controller.create_group(name).await?.id),
        },
        None => None,
    };
    if target == previous {
        return Ok(None);
    }
    controller.assign_group(id, target.clone()).await?;

    if let Some(previous) = previous {
        let emptied = controller
            .get_snapshot()
            .groups
            .iter()
            .any(|g| g.id == previous && g.members.is_empty());
        if emptied {
            controller.delete_group(&previous).await?;
        }
    }
    Ok(match (name, target) {
        (Some(name), Some(_)) => Some(format!("Moved to group '{}'", name.trim())),
        _ => Some("Removed from group".to_string()),
    })
}
