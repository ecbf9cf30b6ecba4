//! The poller that owns every [`Instance`].
//!
//! One tokio task holds all instance state. User commands and poll ticks
//! arrive on the same task, so a command never races a tick: commands
//! submitted before a tick starts are applied first, and a tick's
//! observations are folded in before the next command runs. Multiplexer
//! polls for one tick fan out on a bounded [`JoinSet`]; diffs and history
//! work run on spawned tasks and report back through an internal channel.

mod handle;
mod snapshot;

pub use handle::ControllerHandle;
pub use snapshot::{InstanceView, PreviewTab, ProjectView, Snapshot};

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::agents::{AgentKind, ConversationSummary, HistoryContext};
use crate::config;
use crate::diff::{DiffMode, DiffStats};
use crate::error::{Error, Result};
use crate::history::{self, ConversationEntry, HistoryIndex, SearchMatch, Turn};
use crate::instance::{
    diff_for, AttachInstruction, Backends, Forked, Instance, NewInstance, WindowSpec,
};
use crate::store::{Group, Project};
use crate::tmux::{Multiplexer, WindowInfo};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Where a fork landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkTarget {
    Tab { instance_id: String, index: u32 },
    Sibling { instance_id: String },
}

/// Requests serialized onto the controller task
pub(crate) enum Command {
    Create { spec: NewInstance, reply: Reply<String> },
    Start { id: String, resume_id: Option<String>, reply: Reply<()> },
    Stop { id: String, reply: Reply<()> },
    Delete { id: String, reply: Reply<()> },
    Attach { id: String, window: Option<u32>, reply: Reply<AttachInstruction> },
    AddWindow { id: String, spec: WindowSpec, reply: Reply<u32> },
    CloseWindow { id: String, index: u32, reply: Reply<()> },
    RenameWindow { id: String, index: u32, name: String, reply: Reply<()> },
    SelectWindow { id: String, index: u32, reply: Reply<()> },
    FollowWindow { id: String, index: u32, reply: Reply<()> },
    SendPrompt { id: String, index: u32, text: String, reply: Reply<()> },
    SendKey { id: String, index: u32, key: String, reply: Reply<()> },
    Fork { id: String, name: String, as_tab: bool, reply: Reply<ForkTarget> },
    Rename { id: String, name: String, reply: Reply<()> },
    SetNotes { id: String, notes: String, reply: Reply<()> },
    SetColor { id: String, color: Option<String>, background: Option<String>, reply: Reply<()> },
    ResizePane { id: String, cols: u16, rows: u16, reply: Reply<()> },
    Reorder { ids: Vec<String>, reply: Reply<()> },
    CreateGroup { name: String, reply: Reply<Group> },
    RenameGroup { id: String, name: String, reply: Reply<()> },
    DeleteGroup { id: String, reply: Reply<()> },
    AssignGroup { id: String, group_id: Option<String>, reply: Reply<()> },
    CreateProject { name: String, reply: Reply<Project> },
    RenameProject { id: String, name: String, reply: Reply<()> },
    DeleteProject { id: String, cascade: bool, reply: Reply<()> },
    SwitchProject { id: String, reply: Reply<()> },
    ImportProject { from: String, reply: Reply<usize> },
    Select { id: Option<String> },
    SetPreviewTab(PreviewTab),
    SetDiffMode(DiffMode),
    SetTeaserWidth(usize),
    Search { query: String, limit: usize, rebuild: bool, reply: Reply<Vec<SearchMatch>> },
    Conversation { entry: ConversationEntry, reply: Reply<Vec<Turn>> },
    ListConversations { agent: AgentKind, id: String, reply: Reply<Vec<ConversationSummary>> },
    Shutdown,
}

/// Results of work the controller spawned off its own task
enum Internal {
    Diff { id: String, mode: DiffMode, stats: DiffStats },
    Index(Arc<HistoryIndex>),
}

struct PollRequest {
    id: String,
    session: String,
    window: u32,
    activity_lines: usize,
    preview_lines: Option<usize>,
}

/// What one tick saw for one instance
struct Poll {
    id: String,
    window: u32,
    present: Result<bool>,
    windows: Option<Result<Vec<WindowInfo>>>,
    capture: Option<Result<String>>,
    preview: Option<Result<String>>,
}

async fn poll_instance(mux: Arc<dyn Multiplexer>, req: PollRequest) -> Poll {
    let present = mux.has_session(&req.session).await;
    let mut poll = Poll {
        id: req.id,
        window: req.window,
        present,
        windows: None,
        capture: None,
        preview: None,
    };
    if matches!(poll.present, Ok(true)) {
        poll.windows = Some(mux.list_windows(&req.session).await);
        poll.capture = Some(
            mux.capture_pane(&req.session, req.window, req.activity_lines)
                .await,
        );
        if let Some(lines) = req.preview_lines {
            poll.preview = Some(mux.capture_pane(&req.session, req.window, lines).await);
        }
    }
    poll
}

pub struct Controller {
    backends: Arc<Backends>,
    project_id: String,
    projects: Vec<ProjectView>,
    instances: Vec<Instance>,
    groups: Vec<Group>,
    selected: Option<String>,
    preview_tab: PreviewTab,
    diff_mode: DiffMode,
    preview: String,
    diff: Option<DiffStats>,
    diff_in_flight: bool,
    teaser_width: usize,
    /// Latest failure per operation, cleared by its next success
    last_errors: BTreeMap<&'static str, String>,
    index: Option<Arc<HistoryIndex>>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    state_tx: watch::Sender<Snapshot>,
}

impl Controller {
    /// Load the active project and start the controller task
    pub fn spawn(backends: Arc<Backends>) -> Result<(ControllerHandle, JoinHandle<()>)> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(Snapshot::default());

        let project_id = backends.store.active_project_id();
        let mut controller = Self {
            teaser_width: usize::from(backends.config.default_cols),
            backends,
            project_id: String::new(),
            projects: Vec::new(),
            instances: Vec::new(),
            groups: Vec::new(),
            selected: None,
            preview_tab: PreviewTab::default(),
            diff_mode: DiffMode::default(),
            preview: String::new(),
            diff: None,
            diff_in_flight: false,
            last_errors: BTreeMap::new(),
            index: None,
            internal_tx,
            state_tx,
        };
        controller.load_project(&project_id)?;
        controller.publish();

        let task = tokio::spawn(controller.run(command_rx, internal_rx));
        Ok((ControllerHandle::new(command_tx, state_rx), task))
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut ticker = tokio::time::interval(self.backends.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(project = %self.project_id, instances = self.instances.len(), "controller started");

        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command).await,
                },
                Some(message) = internal.recv() => self.handle_internal(message),
                _ = ticker.tick() => self.tick().await,
            }
            self.publish();
        }
        // Sessions outlive the manager; nothing is stopped here.
        tracing::info!("controller stopped");
    }

    fn load_project(&mut self, project_id: &str) -> Result<()> {
        let (records, groups) = self.backends.store.load_all(project_id)?;
        self.project_id = project_id.to_string();
        self.instances = records
            .into_iter()
            .map(|r| Instance::from_record(self.backends.clone(), r))
            .collect();
        self.groups = groups;
        self.selected = self.instances.first().map(|i| i.id().to_string());
        self.preview.clear();
        self.diff = None;
        self.refresh_projects();
        Ok(())
    }

    fn refresh_projects(&mut self) {
        let store = &self.backends.store;
        self.projects = store
            .list_projects()
            .into_iter()
            .map(|project| {
                let session_count = store.project_session_count(&project.id).unwrap_or_else(|e| {
                    tracing::warn!(project = %project.id, error = %e, "cannot count sessions");
                    0
                });
                ProjectView {
                    project,
                    session_count,
                }
            })
            .collect();
    }

    fn reload_groups(&mut self) -> Result<()> {
        self.groups = self.backends.store.load_all(&self.project_id)?.1;
        Ok(())
    }

    fn instance(&self, id: &str) -> Result<&Instance> {
        self.instances
            .iter()
            .find(|i| i.id() == id)
            .ok_or_else(|| Error::not_found("instance", id))
    }

    fn instance_mut(&mut self, id: &str) -> Result<&mut Instance> {
        self.instances
            .iter_mut()
            .find(|i| i.id() == id)
            .ok_or_else(|| Error::not_found("instance", id))
    }

    fn history_context(&self) -> HistoryContext {
        HistoryContext {
            home: config::home_dir(),
            project_paths: self
                .instances
                .iter()
                .map(|i| i.record().path.clone())
                .collect(),
        }
    }

    // ── Error slots ─────────────────────────────────────────────────────────

    /// Track the outcome of `op` and hand the result back for the reply
    fn outcome<T>(&mut self, op: &'static str, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => {
                self.last_errors.remove(op);
            }
            Err(e) => self.record_error(op, e),
        }
        result
    }

    /// Publish before replying so the caller's next read sees the effect
    fn respond<T>(&mut self, op: &'static str, reply: Reply<T>, result: Result<T>) {
        let result = self.outcome(op, result);
        self.publish();
        let _ = reply.send(result);
    }

    fn record_error(&mut self, op: &'static str, error: &Error) {
        if error.is_soft() {
            return;
        }
        let message = error.to_string();
        if self.last_errors.get(op) != Some(&message) {
            tracing::warn!(op, kind = ?error.kind(), error = %message, "operation failed");
        }
        self.last_errors.insert(op, message);
    }

    // ── Commands ────────────────────────────────────────────────────────────

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Create { mut spec, reply } => {
                spec.project_id = self.project_id.clone();
                let result = Instance::create(self.backends.clone(), spec).map(|inst| {
                    let id = inst.id().to_string();
                    self.instances.push(inst);
                    self.selected = Some(id.clone());
                    id
                });
                if result.is_ok() {
                    self.refresh_projects();
                }
                self.respond("create", reply, result);
            }
            Command::Start {
                id,
                resume_id,
                reply,
            } => {
                let result = match self.instance_mut(&id) {
                    Ok(inst) => match resume_id {
                        Some(resume_id) => inst.start_with_resume(&resume_id).await,
                        None => inst.start().await,
                    },
                    Err(e) => Err(e),
                };
                self.respond("start", reply, result);
            }
            Command::Stop { id, reply } => {
                let result = match self.instance_mut(&id) {
                    Ok(inst) => inst.stop().await,
                    Err(e) => Err(e),
                };
                self.respond("stop", reply, result);
            }
            Command::Delete { id, reply } => {
                let result = self.delete(&id).await;
                self.respond("delete", reply, result);
            }
            Command::Attach { id, window, reply } => {
                let result = match self.instance(&id) {
                    Ok(inst) => inst.attach(window).await,
                    Err(e) => Err(e),
                };
                self.respond("attach", reply, result);
            }
            Command::AddWindow { id, spec, reply } => {
                let result = match self.instance_mut(&id) {
                    Ok(inst) => inst.add_window(spec).await,
                    Err(e) => Err(e),
                };
                self.respond("window", reply, result);
            }
            Command::CloseWindow { id, index, reply } => {
                let result = match self.instance_mut(&id) {
                    Ok(inst) => inst.close_window(index).await,
                    Err(e) => Err(e),
                };
                self.respond("window", reply, result);
            }
            Command::RenameWindow {
                id,
                index,
                name,
                reply,
            } => {
                let result = match self.instance_mut(&id) {
                    Ok(inst) => inst.rename_window(index, &name).await,
                    Err(e) => Err(e),
                };
                self.respond("window", reply, result);
            }
            Command::SelectWindow { id, index, reply } => {
                let result = match self.instance_mut(&id) {
                    Ok(inst) => inst.select_window(index).await,
                    Err(e) => Err(e),
                };
                if result.is_ok() {
                    self.preview.clear();
                }
                self.respond("window", reply, result);
            }
            Command::FollowWindow { id, index, reply } => {
                let result = self
                    .instance_mut(&id)
                    .and_then(|inst| inst.follow_window(index));
                self.respond("window", reply, result);
            }
            Command::SendPrompt {
                id,
                index,
                text,
                reply,
            } => {
                let result = match self.instance(&id) {
                    Ok(inst) => inst.send_prompt(index, &text).await,
                    Err(e) => Err(e),
                };
                self.respond("send", reply, result);
            }
            Command::SendKey {
                id,
                index,
                key,
                reply,
            } => {
                let result = match self.instance(&id) {
                    Ok(inst) => inst.send_key(index, &key).await,
                    Err(e) => Err(e),
                };
                self.respond("send", reply, result);
            }
            Command::Fork {
                id,
                name,
                as_tab,
                reply,
            } => {
                let result = self.fork(&id, &name, as_tab).await;
                self.respond("fork", reply, result);
            }
            Command::Rename { id, name, reply } => {
                let result = self.instance_mut(&id).and_then(|inst| inst.rename(&name));
                self.respond("edit", reply, result);
            }
            Command::SetNotes { id, notes, reply } => {
                let result = self
                    .instance_mut(&id)
                    .and_then(|inst| inst.set_notes(&notes));
                self.respond("edit", reply, result);
            }
            Command::SetColor {
                id,
                color,
                background,
                reply,
            } => {
                let result = self
                    .instance_mut(&id)
                    .and_then(|inst| inst.set_color(color, background));
                self.respond("edit", reply, result);
            }
            Command::ResizePane {
                id,
                cols,
                rows,
                reply,
            } => {
                let result = match self.instance(&id) {
                    Ok(inst) => inst.resize_pane(cols, rows).await,
                    Err(e) => Err(e),
                };
                self.respond("resize", reply, result);
            }
            Command::Reorder { ids, reply } => {
                let result = self.reorder(&ids);
                self.respond("reorder", reply, result);
            }
            Command::CreateGroup { name, reply } => {
                let result = self.backends.store.create_group(&self.project_id, &name);
                if result.is_ok() {
                    self.log_reload_groups();
                }
                self.respond("group", reply, result);
            }
            Command::RenameGroup { id, name, reply } => {
                let result = self
                    .backends
                    .store
                    .rename_group(&self.project_id, &id, &name);
                if result.is_ok() {
                    self.log_reload_groups();
                }
                self.respond("group", reply, result);
            }
            Command::DeleteGroup { id, reply } => {
                let result = self.backends.store.delete_group(&self.project_id, &id);
                if result.is_ok() {
                    for inst in &mut self.instances {
                        inst.forget_group(&id);
                    }
                    self.log_reload_groups();
                }
                self.respond("group", reply, result);
            }
            Command::AssignGroup {
                id,
                group_id,
                reply,
            } => {
                let result = self
                    .instance_mut(&id)
                    .and_then(|inst| inst.set_group(group_id));
                if result.is_ok() {
                    self.log_reload_groups();
                }
                self.respond("group", reply, result);
            }
            Command::CreateProject { name, reply } => {
                let result = self.backends.store.create_project(&name);
                self.refresh_projects();
                self.respond("project", reply, result);
            }
            Command::RenameProject { id, name, reply } => {
                let result = self.backends.store.rename_project(&id, &name);
                self.refresh_projects();
                self.respond("project", reply, result);
            }
            Command::DeleteProject { id, cascade, reply } => {
                let result = self.delete_project(&id, cascade).await;
                self.respond("project", reply, result);
            }
            Command::SwitchProject { id, reply } => {
                let result = self.switch_project(&id);
                self.respond("project", reply, result);
            }
            Command::ImportProject { from, reply } => {
                let result = self.import(&from);
                self.respond("project", reply, result);
            }
            Command::Select { id } => {
                if self.selected != id {
                    self.selected = id;
                    self.preview.clear();
                    self.diff = None;
                }
            }
            Command::SetPreviewTab(tab) => {
                if self.preview_tab != tab {
                    self.preview_tab = tab;
                    self.diff = None;
                }
            }
            Command::SetDiffMode(mode) => {
                if self.diff_mode != mode {
                    self.diff_mode = mode;
                    self.diff = None;
                }
            }
            Command::SetTeaserWidth(width) => self.teaser_width = width.max(1),
            Command::Search {
                query,
                limit,
                rebuild,
                reply,
            } => self.search(query, limit, rebuild, reply),
            Command::Conversation { entry, reply } => {
                tokio::spawn(async move {
                    let turns = tokio::task::spawn_blocking(move || history::conversation(&entry))
                        .await
                        .map_err(|e| Error::InvariantViolation(format!("history task failed: {e}")));
                    let _ = reply.send(turns);
                });
            }
            Command::ListConversations { agent, id, reply } => {
                let cwd = match self.instance(&id) {
                    Ok(inst) => inst.record().path.clone(),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                let ctx = self.history_context();
                tokio::spawn(async move {
                    let listed = tokio::task::spawn_blocking(move || {
                        agent.profile().list_conversations(&ctx, &cwd)
                    })
                    .await
                    .map_err(|e| Error::InvariantViolation(format!("history task failed: {e}")));
                    let _ = reply.send(listed);
                });
            }
            Command::Shutdown => {}
        }
    }

    fn log_reload_groups(&mut self) {
        if let Err(e) = self.reload_groups() {
            tracing::warn!(error = %e, "failed to reload groups");
        }
    }

    async fn delete(&mut self, id: &str) -> Result<()> {
        let pos = self
            .instances
            .iter()
            .position(|i| i.id() == id)
            .ok_or_else(|| Error::not_found("instance", id))?;
        self.instances[pos].stop().await?;
        self.backends.store.remove_instance(id)?;
        self.instances.remove(pos);
        if self.selected.as_deref() == Some(id) {
            let next = pos.min(self.instances.len().saturating_sub(1));
            self.selected = self.instances.get(next).map(|i| i.id().to_string());
            self.preview.clear();
            self.diff = None;
        }
        self.log_reload_groups();
        self.refresh_projects();
        tracing::info!(instance = %id, "deleted instance");
        Ok(())
    }

    async fn fork(&mut self, id: &str, name: &str, as_tab: bool) -> Result<ForkTarget> {
        let pos = self
            .instances
            .iter()
            .position(|i| i.id() == id)
            .ok_or_else(|| Error::not_found("instance", id))?;
        match self.instances[pos].fork(name, as_tab).await? {
            Forked::Tab(index) => Ok(ForkTarget::Tab {
                instance_id: id.to_string(),
                index,
            }),
            Forked::Sibling(sibling) => {
                let instance_id = sibling.id().to_string();
                self.instances.push(*sibling);
                self.refresh_projects();
                Ok(ForkTarget::Sibling { instance_id })
            }
        }
    }

    fn reorder(&mut self, ids: &[String]) -> Result<()> {
        self.backends.store.reorder_instances(&self.project_id, ids)?;
        self.instances.sort_by_key(|inst| {
            ids.iter()
                .position(|id| id == inst.id())
                .unwrap_or(usize::MAX)
        });
        Ok(())
    }

    async fn delete_project(&mut self, id: &str, cascade: bool) -> Result<()> {
        let removed = self.backends.store.delete_project(id, cascade)?;
        for record in &removed {
            if let Err(e) = self.backends.mux.kill_session(&record.session_name).await {
                tracing::warn!(session = %record.session_name, error = %e, "failed to kill session of deleted project");
            }
        }
        if self.project_id == id {
            let active = self.backends.store.active_project_id();
            self.load_project(&active)?;
        } else {
            self.refresh_projects();
        }
        Ok(())
    }

    /// Running sessions of the previous project keep running
    fn switch_project(&mut self, id: &str) -> Result<()> {
        self.backends.store.set_active_project(id)?;
        self.load_project(id)?;
        tracing::info!(project = %id, "switched project");
        Ok(())
    }

    fn import(&mut self, from: &str) -> Result<usize> {
        if from == self.project_id {
            return Err(Error::InvariantViolation(
                "cannot import a project into itself".into(),
            ));
        }
        let moved = self.backends.store.import(from, &self.project_id)?;
        let selected = self.selected.clone();
        let project_id = self.project_id.clone();
        self.load_project(&project_id)?;
        if selected.is_some() {
            self.selected = selected;
        }
        Ok(moved)
    }

    fn search(&mut self, query: String, limit: usize, rebuild: bool, reply: Reply<Vec<SearchMatch>>) {
        let records: Vec<_> = self.instances.iter().map(|i| i.record().clone()).collect();
        let cached = if rebuild { None } else { self.index.clone() };
        let ctx = self.history_context();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let searched = tokio::task::spawn_blocking(move || {
                let (index, built) = match cached {
                    Some(index) => (index, false),
                    None => (Arc::new(HistoryIndex::build(&ctx)), true),
                };
                let matches = index.search_resolved(&query, &records, limit);
                (index, built, matches)
            })
            .await;
            match searched {
                Ok((index, built, matches)) => {
                    if built {
                        let _ = internal.send(Internal::Index(index));
                    }
                    let _ = reply.send(Ok(matches));
                }
                Err(e) => {
                    let _ = reply.send(Err(Error::InvariantViolation(format!(
                        "history task failed: {e}"
                    ))));
                }
            }
        });
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Diff { id, mode, stats } => {
                self.diff_in_flight = false;
                // A result for an old selection or mode is dropped.
                if self.selected.as_deref() != Some(id.as_str())
                    || self.diff_mode != mode
                    || self.preview_tab != PreviewTab::Diff
                {
                    return;
                }
                if let Some(err) = &stats.err {
                    tracing::debug!(instance = %id, error = %err, "diff failed");
                }
                self.diff = Some(stats);
            }
            Internal::Index(index) => self.index = Some(index),
        }
    }

    // ── Ticks ───────────────────────────────────────────────────────────────

    async fn tick(&mut self) {
        let config = self.backends.config.clone();
        let limit = Arc::new(Semaphore::new(config.max_parallel_polls.max(1)));
        let mut polls = JoinSet::new();
        for inst in &self.instances {
            let selected = self.selected.as_deref() == Some(inst.id());
            let req = PollRequest {
                id: inst.id().to_string(),
                session: inst.session_name().to_string(),
                window: inst.active_window(),
                activity_lines: config.activity_lines,
                preview_lines: selected.then_some(config.preview_lines),
            };
            let mux = self.backends.mux.clone();
            let limit = limit.clone();
            polls.spawn(async move {
                let _permit = limit.acquire_owned().await;
                poll_instance(mux, req).await
            });
        }

        let mut results = Vec::with_capacity(self.instances.len());
        while let Some(joined) = polls.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::warn!(error = %e, "poll task failed"),
            }
        }

        let mut failure = None;
        for result in results {
            if let Err(e) = self.apply_poll(result) {
                failure = Some(e);
            }
        }
        match failure {
            Some(e) => self.record_error("poll", &e),
            None => {
                self.last_errors.remove("poll");
            }
        }
        self.maybe_diff();
    }

    /// Fold one poll into its instance. Transient failures skip the tick
    /// for that instance; anything else is returned.
    fn apply_poll(&mut self, poll: Poll) -> Result<()> {
        let threshold = self.backends.config.missed_ticks_before_stop;
        let width = self.teaser_width;
        let selected = self.selected.as_deref() == Some(poll.id.as_str());
        let Some(inst) = self.instances.iter_mut().find(|i| i.id() == poll.id) else {
            return Ok(());
        };

        let present = match poll.present {
            Ok(present) => present,
            Err(e) if e.is_transient() => {
                tracing::debug!(instance = %poll.id, error = %e, "skipping tick");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        inst.apply_presence(present, threshold)?;
        if !inst.is_running() {
            if selected {
                self.preview.clear();
            }
            return Ok(());
        }

        // Each observation is dropped on its own if the poll saw the window
        // set change underneath it.
        if let Some(windows) = poll.windows {
            match windows {
                Ok(windows) => {
                    inst.reconcile_windows(&windows)?;
                }
                Err(e) if e.is_transient() || matches!(e, Error::NotFound { .. }) => {
                    tracing::debug!(instance = %poll.id, error = %e, "list-windows skipped");
                }
                Err(e) => return Err(e),
            }
        }
        let same_window = inst.active_window() == poll.window;
        if let Some(Ok(capture)) = poll.capture.as_ref().filter(|_| same_window) {
            inst.apply_capture(poll.window, capture, width);
        }
        if selected && same_window {
            match poll.preview {
                Some(Ok(preview)) => self.preview = preview,
                Some(Err(e)) => tracing::debug!(instance = %poll.id, error = %e, "preview capture skipped"),
                None => {}
            }
        }
        Ok(())
    }

    fn maybe_diff(&mut self) {
        if self.preview_tab != PreviewTab::Diff || self.diff_in_flight {
            return;
        }
        let Some(inst) = self
            .selected
            .as_deref()
            .and_then(|id| self.instances.iter().find(|i| i.id() == id))
        else {
            return;
        };
        let id = inst.id().to_string();
        let path = inst.record().path.clone();
        let snapshot = inst.record().start_revision.clone();
        let vcs = self.backends.vcs.clone();
        let mode = self.diff_mode;
        let internal = self.internal_tx.clone();
        self.diff_in_flight = true;
        tokio::spawn(async move {
            let stats = diff_for(vcs, path, mode, snapshot).await;
            let _ = internal.send(Internal::Diff { id, mode, stats });
        });
    }

    // ── Publishing ──────────────────────────────────────────────────────────

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            project_id: self.project_id.clone(),
            projects: self.projects.clone(),
            instances: self
                .instances
                .iter()
                .map(|inst| InstanceView {
                    record: inst.record().clone(),
                    activity: inst
                        .classification(inst.active_window())
                        .map(|c| c.activity)
                        .unwrap_or_default(),
                    teaser: inst.get_last_line(),
                    active_window: inst.active_window(),
                    extra_windows: inst.extra_windows().to_vec(),
                })
                .collect(),
            groups: self.groups.clone(),
            selected: self.selected.clone(),
            preview_tab: self.preview_tab,
            diff_mode: self.diff_mode,
            preview: self.preview.clone(),
            diff: self.diff.clone(),
            last_errors: self
                .last_errors
                .iter()
                .map(|(op, message)| (op.to_string(), message.clone()))
                .collect(),
        }
    }

    /// Notify subscribers only when something visible changed
    fn publish(&self) {
        let next = self.snapshot();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::Activity;
    use crate::instance::tests::Harness;
    use crate::store::Status;
    use std::time::Duration;

    fn spawn(h: &Harness) -> ControllerHandle {
        let (handle, _task) = Controller::spawn(h.backends.clone()).unwrap();
        handle
    }

    /// Wait until a published snapshot satisfies `pred`
    async fn wait_for(handle: &ControllerHandle, pred: impl Fn(&Snapshot) -> bool) -> Snapshot {
        let mut rx = handle.subscribe();
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                if pred(&snapshot) {
                    return snapshot;
                }
                if rx.changed().await.is_err() {
                    panic!("controller stopped");
                }
            }
        })
        .await;
        waited.expect("condition not reached in time")
    }

    #[tokio::test]
    async fn test_commands_update_snapshot() {
        let h = Harness::new();
        let handle = spawn(&h);
        let id = handle
            .create_instance(h.spec("demo", AgentKind::Claude))
            .await
            .unwrap();
        let snapshot = handle.get_snapshot();
        assert_eq!(snapshot.instances.len(), 1);
        assert_eq!(snapshot.selected.as_deref(), Some(id.as_str()));

        handle.start(&id, None).await.unwrap();
        let snapshot = handle.get_snapshot();
        assert_eq!(snapshot.instance(&id).unwrap().record.status, Status::Running);

        handle.rename(&id, "renamed").await.unwrap();
        assert_eq!(handle.get_snapshot().instance(&id).unwrap().record.name, "renamed");

        assert!(matches!(
            handle.start(&id, Some("R1".into())).await,
            Err(Error::AlreadyRunning)
        ));
        // Soft errors are not recorded
        assert!(handle.get_snapshot().last_errors.is_empty());

        handle.stop(&id).await.unwrap();
        handle.delete(&id).await.unwrap();
        let snapshot = handle.get_snapshot();
        assert!(snapshot.instances.is_empty());
        assert!(snapshot.selected.is_none());
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_tick_classifies_and_previews() {
        let h = Harness::new();
        let handle = spawn(&h);
        let id = handle
            .create_instance(h.spec("demo", AgentKind::Claude))
            .await
            .unwrap();
        handle.start(&id, None).await.unwrap();
        let session = h.backends.config.session_name(&id);

        h.mux.set_screen(&session, 0, "Do you want to proceed? (y/N)");
        let snapshot = wait_for(&handle, |s| {
            s.instance(&id)
                .is_some_and(|i| i.teaser == "Do you want to proceed? (y/N)")
        })
        .await;
        assert_eq!(snapshot.preview, "Do you want to proceed? (y/N)");

        // An unchanged screen settles to Idle
        wait_for(&handle, |s| {
            s.instance(&id).is_some_and(|i| i.activity == Activity::Idle)
        })
        .await;
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_missing_session_stops_after_missed_ticks() {
        let h = Harness::new();
        let handle = spawn(&h);
        let id = handle
            .create_instance(h.spec("demo", AgentKind::Claude))
            .await
            .unwrap();
        handle.start(&id, None).await.unwrap();

        h.mux.remove_session(&h.backends.config.session_name(&id));
        let snapshot = wait_for(&handle, |s| {
            s.instance(&id)
                .is_some_and(|i| i.record.status == Status::Stopped)
        })
        .await;
        assert!(snapshot.instance(&id).unwrap().record.windows[0].dead);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_extra_windows_are_surfaced_and_followed() {
        let h = Harness::new();
        let handle = spawn(&h);
        let id = handle
            .create_instance(h.spec("demo", AgentKind::Claude))
            .await
            .unwrap();
        handle.start(&id, None).await.unwrap();
        let session = h.backends.config.session_name(&id);

        let extra = h.mux.open_external_window(&session, "htop").unwrap();
        wait_for(&handle, |s| {
            s.instance(&id).is_some_and(|i| i.extra_windows.len() == 1)
        })
        .await;
        handle.follow_window(&id, extra).await.unwrap();
        let snapshot = handle.get_snapshot();
        let view = snapshot.instance(&id).unwrap();
        assert!(view.extra_windows.is_empty());
        assert_eq!(view.record.windows.len(), 2);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_diff_tab_runs_diff() {
        let h = Harness::new();
        let handle = spawn(&h);
        let id = handle
            .create_instance(h.spec("demo", AgentKind::Claude))
            .await
            .unwrap();
        handle.start(&id, None).await.unwrap();
        handle.set_preview_tab(PreviewTab::Diff);
        handle.set_diff_mode(DiffMode::Session);
        let snapshot = wait_for(&handle, |s| s.diff.is_some()).await;
        let diff = snapshot.diff.unwrap();
        assert_eq!((diff.added, diff.removed), (1, 1));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_fork_and_groups() {
        let h = Harness::new();
        let handle = spawn(&h);
        let id = handle
            .create_instance(h.spec("demo", AgentKind::Claude))
            .await
            .unwrap();
        let target = handle.fork(&id, "copy", false).await.unwrap();
        let ForkTarget::Sibling { instance_id } = target else {
            panic!("expected a sibling");
        };
        assert_eq!(handle.get_snapshot().instances.len(), 2);

        let group = handle.create_group("backend").await.unwrap();
        handle
            .assign_group(&instance_id, Some(group.id.clone()))
            .await
            .unwrap();
        let snapshot = handle.get_snapshot();
        assert_eq!(snapshot.groups[0].members, [instance_id.clone()]);

        handle.delete_group(&group.id).await.unwrap();
        let snapshot = handle.get_snapshot();
        assert!(snapshot.groups.is_empty());
        assert!(snapshot.instance(&instance_id).unwrap().record.group_id.is_none());
        // The in-memory record no longer points at the deleted group
        handle.rename(&instance_id, "copy-2").await.unwrap();
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_projects_switch_and_delete() {
        let h = Harness::new();
        let handle = spawn(&h);
        handle
            .create_instance(h.spec("default-one", AgentKind::Claude))
            .await
            .unwrap();
        let project = handle.create_project("client").await.unwrap();
        handle.switch_project(&project.id).await.unwrap();
        let snapshot = handle.get_snapshot();
        assert_eq!(snapshot.project_id, project.id);
        assert!(snapshot.instances.is_empty());

        let id = handle
            .create_instance(h.spec("client-one", AgentKind::Aider))
            .await
            .unwrap();
        handle.start(&id, None).await.unwrap();
        let session = h.backends.config.session_name(&id);

        assert!(matches!(
            handle.delete_project(&project.id, false).await,
            Err(Error::NotEmpty(_))
        ));
        handle.delete_project(&project.id, true).await.unwrap();
        assert!(h.mux.session(&session).is_none());
        let snapshot = handle.get_snapshot();
        assert_eq!(snapshot.project_id, "");
        assert_eq!(snapshot.instances.len(), 1);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_rename_and_import() {
        let h = Harness::new();
        let handle = spawn(&h);
        let project = handle.create_project("client").await.unwrap();
        handle.rename_project(&project.id, "client-b").await.unwrap();
        let snapshot = handle.get_snapshot();
        let view = snapshot
            .projects
            .iter()
            .find(|p| p.project.id == project.id)
            .unwrap();
        assert_eq!(view.project.name, "client-b");

        handle.switch_project(&project.id).await.unwrap();
        let id = handle
            .create_instance(h.spec("moved", AgentKind::Codex))
            .await
            .unwrap();
        let group = handle.create_group("api").await.unwrap();
        handle.rename_group(&group.id, "web").await.unwrap();
        assert_eq!(handle.get_snapshot().groups[0].name, "web");
        handle.assign_group(&id, Some(group.id.clone())).await.unwrap();

        handle.switch_project("").await.unwrap();
        assert!(matches!(
            handle.import_project("").await,
            Err(Error::InvariantViolation(_))
        ));
        assert_eq!(handle.import_project(&project.id).await.unwrap(), 1);
        let snapshot = handle.get_snapshot();
        assert_eq!(snapshot.instances.len(), 1);
        assert_eq!(snapshot.instances[0].id(), id);
        assert_eq!(snapshot.groups.len(), 1);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_failures_fill_and_clear_error_slot() {
        let h = Harness::new();
        let handle = spawn(&h);
        let id = handle
            .create_instance(h.spec("demo", AgentKind::Claude))
            .await
            .unwrap();
        h.mux.fail_next("new-session", "create window failed");
        assert!(handle.start(&id, None).await.is_err());
        let snapshot = handle.get_snapshot();
        assert_eq!(snapshot.last_errors.len(), 1);
        assert_eq!(snapshot.last_errors[0].0, "start");

        handle.start(&id, None).await.unwrap();
        assert!(handle.get_snapshot().last_errors.is_empty());
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_leaves_sessions_running() {
        let h = Harness::new();
        let (handle, task) = Controller::spawn(h.backends.clone()).unwrap();
        let id = handle
            .create_instance(h.spec("demo", AgentKind::Claude))
            .await
            .unwrap();
        handle.start(&id, None).await.unwrap();
        handle.shutdown();
        task.await.unwrap();
        assert!(h.mux.session(&h.backends.config.session_name(&id)).is_some());
        assert!(handle.start(&id, None).await.is_err());
    }
}
