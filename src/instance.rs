//! One managed session: its persisted record plus the operations that
//! drive the multiplexer on its behalf.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::activity::{Activity, ActivityClassifier, Classification};
use crate::agents::{AgentKind, LaunchSpec};
use crate::config::Config;
use crate::diff::{DiffMode, DiffStats, Vcs};
use crate::error::{Error, Result};
use crate::store::{InstanceRecord, Status, Store, WindowRecord};
use crate::tmux::{Multiplexer, WindowInfo};

const PRIMARY: u32 = 0;

/// Everything an instance talks to
pub struct Backends {
    pub mux: Arc<dyn Multiplexer>,
    pub vcs: Arc<dyn Vcs>,
    pub store: Arc<Store>,
    pub config: Arc<Config>,
}

impl Backends {
    pub fn classifier(&self) -> ActivityClassifier {
        ActivityClassifier::new(self.config.activity_lines)
    }
}

/// User input for a new instance
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub name: String,
    pub path: PathBuf,
    pub agent: AgentKind,
    pub custom_command: Option<String>,
    pub auto_approve: bool,
    pub resume_id: Option<String>,
    pub project_id: String,
    pub group_id: Option<String>,
}

/// What to run in a new tab
#[derive(Debug, Clone)]
pub struct WindowSpec {
    pub agent: AgentKind,
    pub name: String,
    pub custom_command: Option<String>,
    pub auto_approve: bool,
    pub resume_id: Option<String>,
}

impl WindowSpec {
    pub fn terminal(name: &str) -> Self {
        Self {
            agent: AgentKind::Terminal,
            name: name.to_string(),
            custom_command: None,
            auto_approve: false,
            resume_id: None,
        }
    }
}

/// Foreground command the presentation layer runs to attach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachInstruction {
    pub session: String,
    pub argv: Vec<String>,
}

/// Result of [`Instance::fork`]
pub enum Forked {
    Tab(u32),
    Sibling(Box<Instance>),
}

pub struct Instance {
    backends: Arc<Backends>,
    record: InstanceRecord,
    /// Consecutive ticks the session was reported missing while Running
    missed_ticks: u32,
    /// Window whose screen the preview shows
    active_window: u32,
    /// Latest classification per window index
    observed: HashMap<u32, Classification>,
    /// Real windows that have no record (opened from inside the session)
    extra_windows: Vec<WindowInfo>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.record.id)
            .field("status", &self.record.status)
            .field("missed_ticks", &self.missed_ticks)
            .finish_non_exhaustive()
    }
}

impl Instance {
    /// Validate, build and persist a new Stopped instance
    pub fn create(backends: Arc<Backends>, spec: NewInstance) -> Result<Self> {
        let name = spec.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::Config("instance name must not be empty".into()));
        }
        if !spec.path.is_absolute() || !spec.path.is_dir() {
            return Err(Error::Config(format!(
                "{} is not an existing absolute directory",
                spec.path.display()
            )));
        }
        // Surface a missing custom command now rather than at Start.
        spec.agent.profile().launch_argv(&LaunchSpec {
            custom_command: spec.custom_command.as_deref(),
            ..Default::default()
        })?;

        let id = new_id();
        let primary = WindowRecord {
            index: PRIMARY,
            name: spec.agent.as_str().to_string(),
            agent: spec.agent,
            custom_command: spec.custom_command.clone(),
            auto_approve: spec.auto_approve,
            resume_id: spec.resume_id.clone(),
            notes: String::new(),
            dead: false,
        };
        let record = InstanceRecord {
            session_name: backends.config.session_name(&id),
            id,
            name,
            project_id: spec.project_id,
            group_id: spec.group_id,
            path: spec.path,
            agent: spec.agent,
            custom_command: spec.custom_command,
            auto_approve: spec.auto_approve,
            resume_id: spec.resume_id,
            status: Status::Stopped,
            start_revision: None,
            notes: String::new(),
            color: None,
            background_color: None,
            created_at: Utc::now(),
            windows: vec![primary],
        };
        backends.store.add_instance(&record)?;
        tracing::info!(instance = %record.id, name = %record.name, agent = %record.agent, "created instance");
        Ok(Self::from_record(backends, record))
    }

    pub fn from_record(backends: Arc<Backends>, record: InstanceRecord) -> Self {
        Self {
            backends,
            record,
            missed_ticks: 0,
            active_window: PRIMARY,
            observed: HashMap::new(),
            extra_windows: Vec::new(),
        }
    }

    pub fn record(&self) -> &InstanceRecord {
        &self.record
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn session_name(&self) -> &str {
        &self.record.session_name
    }

    pub fn is_running(&self) -> bool {
        self.record.is_running()
    }

    pub fn active_window(&self) -> u32 {
        self.active_window
    }

    pub fn extra_windows(&self) -> &[WindowInfo] {
        &self.extra_windows
    }

    pub fn classification(&self, index: u32) -> Option<&Classification> {
        self.observed.get(&index)
    }

    fn persist(&self) -> Result<()> {
        self.backends.store.update_instance(&self.record)
    }

    fn require_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }

    fn launch_argv(window: &WindowRecord, fork: bool) -> Result<Vec<String>> {
        window.agent.profile().launch_argv(&LaunchSpec {
            resume_id: window.resume_id.as_deref(),
            auto_approve: window.auto_approve,
            custom_command: window.custom_command.as_deref(),
            fork,
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Start the session. Starting a Running instance does nothing; a
    /// session that already exists is adopted.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let mux = self.backends.mux.clone();
        let config = self.backends.config.clone();
        let name = self.record.session_name.clone();

        if mux.has_session(&name).await? {
            tracing::info!(instance = %self.record.id, session = %name, "adopting existing session");
            self.ensure_snapshot().await;
            return self.mark_running();
        }

        let primary = self
            .record
            .window(PRIMARY)
            .cloned()
            .ok_or_else(|| Error::InvariantViolation(format!("{} has no primary window", self.record.id)))?;
        let argv = Self::launch_argv(&primary, false)?;
        mux.new_session(&name, &argv, &self.record.path, config.default_cols, config.default_rows)
            .await?;

        let pattern = format!("{}*", config.session_prefix);
        if let Err(e) = mux.bind_detach(&pattern, &config.detach_key, "detach-client").await {
            tracing::warn!(session = %name, error = %e, "failed to bind detach key");
        }
        if let Err(e) = mux.rename_window(&name, PRIMARY, &primary.name).await {
            tracing::debug!(session = %name, error = %e, "failed to name primary window");
        }

        self.record_snapshot().await;
        self.restore_tabs().await;
        tracing::info!(instance = %self.record.id, session = %name, "started instance");
        self.mark_running()
    }

    /// Start resuming the agent conversation `resume_id`
    pub async fn start_with_resume(&mut self, resume_id: &str) -> Result<()> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }
        self.record.resume_id = Some(resume_id.to_string());
        if let Some(primary) = self.record.window_mut(PRIMARY) {
            primary.resume_id = Some(resume_id.to_string());
        }
        self.start().await
    }

    /// Kill the session. Always issues the kill, even when Stopped.
    pub async fn stop(&mut self) -> Result<()> {
        self.backends.mux.kill_session(&self.record.session_name).await?;
        let was_running = self.is_running();
        self.mark_stopped();
        if was_running {
            tracing::info!(instance = %self.record.id, "stopped instance");
        }
        self.persist()
    }

    async fn record_snapshot(&mut self) {
        match self.backends.vcs.head_revision(&self.record.path).await {
            Ok(revision) => {
                if let Err(e) = self.backends.store.write_snapshot(&self.record.id, &revision) {
                    tracing::warn!(instance = %self.record.id, error = %e, "failed to write start snapshot");
                }
                self.record.start_revision = Some(revision);
            }
            Err(e) => {
                tracing::debug!(instance = %self.record.id, error = %e, "no start snapshot");
                self.record.start_revision = None;
            }
        }
    }

    /// Keep a snapshot written by an earlier start; take one otherwise
    async fn ensure_snapshot(&mut self) {
        match self.backends.store.read_snapshot(&self.record.id) {
            Ok(Some(revision)) => self.record.start_revision = Some(revision),
            Ok(None) => self.record_snapshot().await,
            Err(e) => {
                tracing::warn!(instance = %self.record.id, error = %e, "failed to read start snapshot");
                self.record_snapshot().await;
            }
        }
    }

    /// Recreate recorded tabs after a fresh start, taking the indices tmux
    /// hands out
    async fn restore_tabs(&mut self) {
        let mux = self.backends.mux.clone();
        let name = self.record.session_name.clone();
        let path = self.record.path.clone();
        for window in self.record.windows.iter_mut().filter(|w| w.index != PRIMARY) {
            let created = match Self::launch_argv(window, false) {
                Ok(argv) => mux.new_window(&name, &window.name, &argv, &path).await,
                Err(e) => Err(e),
            };
            match created {
                Ok(index) => {
                    window.index = index;
                    window.dead = false;
                }
                Err(e) => {
                    tracing::warn!(session = %name, tab = %window.name, error = %e, "failed to restore tab");
                    window.dead = true;
                }
            }
        }
        self.record.windows.sort_by_key(|w| w.index);
    }

    fn mark_running(&mut self) -> Result<()> {
        self.record.status = Status::Running;
        self.missed_ticks = 0;
        if let Some(primary) = self.record.window_mut(PRIMARY) {
            primary.dead = false;
        }
        self.persist()
    }

    fn mark_stopped(&mut self) {
        self.record.status = Status::Stopped;
        self.missed_ticks = 0;
        self.active_window = PRIMARY;
        for window in &mut self.record.windows {
            window.dead = true;
        }
        self.observed.clear();
        self.extra_windows.clear();
    }

    pub async fn attach(&self, index: Option<u32>) -> Result<AttachInstruction> {
        self.require_running()?;
        let mux = &self.backends.mux;
        if let Some(index) = index {
            mux.select_window(&self.record.session_name, index).await?;
        }
        Ok(AttachInstruction {
            session: self.record.session_name.clone(),
            argv: mux.attach_command(&self.record.session_name),
        })
    }

    // ── Windows ─────────────────────────────────────────────────────────────

    pub async fn add_window(&mut self, spec: WindowSpec) -> Result<u32> {
        self.open_window(spec, false).await
    }

    async fn open_window(&mut self, spec: WindowSpec, fork: bool) -> Result<u32> {
        self.require_running()?;
        let name = match spec.name.trim() {
            "" => spec.agent.as_str().to_string(),
            name => name.to_string(),
        };
        let mut window = WindowRecord {
            index: 0,
            name,
            agent: spec.agent,
            custom_command: spec.custom_command,
            auto_approve: spec.auto_approve,
            resume_id: spec.resume_id,
            notes: String::new(),
            dead: false,
        };
        let argv = Self::launch_argv(&window, fork)?;
        let index = self
            .backends
            .mux
            .new_window(&self.record.session_name, &window.name, &argv, &self.record.path)
            .await?;
        window.index = index;
        self.extra_windows.retain(|w| w.index != index);
        self.record.windows.retain(|w| w.index != index);
        self.record.windows.push(window);
        self.record.windows.sort_by_key(|w| w.index);
        self.persist()?;
        Ok(index)
    }

    pub async fn close_window(&mut self, index: u32) -> Result<()> {
        if index == PRIMARY {
            return Err(Error::InvariantViolation(
                "the primary window cannot be closed".into(),
            ));
        }
        let recorded = self.record.window(index).is_some();
        let extra = self.extra_windows.iter().any(|w| w.index == index);
        if !recorded && !extra {
            return Err(Error::not_found("window", index.to_string()));
        }
        if self.is_running() {
            self.backends
                .mux
                .kill_window(&self.record.session_name, index)
                .await?;
        }
        self.extra_windows.retain(|w| w.index != index);
        self.observed.remove(&index);
        if self.active_window == index {
            self.active_window = PRIMARY;
        }
        if recorded {
            self.record.windows.retain(|w| w.index != index);
            self.persist()?;
        }
        Ok(())
    }

    pub async fn rename_window(&mut self, index: u32, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Config("window name must not be empty".into()));
        }
        let window = self
            .record
            .window(index)
            .ok_or_else(|| Error::not_found("window", index.to_string()))?;
        if self.is_running() && !window.dead {
            self.backends
                .mux
                .rename_window(&self.record.session_name, index, name)
                .await?;
        }
        if let Some(window) = self.record.window_mut(index) {
            window.name = name.to_string();
        }
        self.persist()
    }

    /// Make `index` the window shown in previews and selected on attach
    pub async fn select_window(&mut self, index: u32) -> Result<()> {
        self.require_running()?;
        self.ensure_window(index)?;
        self.backends
            .mux
            .select_window(&self.record.session_name, index)
            .await?;
        self.active_window = index;
        Ok(())
    }

    /// Start tracking an extra window as a Terminal tab
    pub fn follow_window(&mut self, index: u32) -> Result<()> {
        let pos = self
            .extra_windows
            .iter()
            .position(|w| w.index == index)
            .ok_or_else(|| Error::not_found("window", index.to_string()))?;
        let info = self.extra_windows.remove(pos);
        self.record.windows.push(WindowRecord {
            index: info.index,
            name: info.name,
            agent: AgentKind::Terminal,
            custom_command: None,
            auto_approve: false,
            resume_id: None,
            notes: String::new(),
            dead: info.dead,
        });
        self.record.windows.sort_by_key(|w| w.index);
        self.persist()
    }

    fn ensure_window(&self, index: u32) -> Result<()> {
        if self.record.window(index).is_some() || self.extra_windows.iter().any(|w| w.index == index) {
            Ok(())
        } else {
            Err(Error::not_found("window", index.to_string()))
        }
    }

    pub async fn send_prompt(&self, index: u32, text: &str) -> Result<()> {
        self.require_running()?;
        self.ensure_window(index)?;
        self.backends
            .mux
            .send_keys(&self.record.session_name, index, text)
            .await
    }

    pub async fn send_key(&self, index: u32, key: &str) -> Result<()> {
        self.require_running()?;
        self.ensure_window(index)?;
        self.backends
            .mux
            .send_key(&self.record.session_name, index, key)
            .await
    }

    /// Branch this instance. A tab shares the session and its start
    /// snapshot; a sibling is a new Stopped instance that takes its own
    /// snapshot when started.
    pub async fn fork(&mut self, new_name: &str, as_tab: bool) -> Result<Forked> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(Error::Config("fork name must not be empty".into()));
        }
        if as_tab {
            let spec = WindowSpec {
                agent: self.record.agent,
                name: new_name.to_string(),
                custom_command: self.record.custom_command.clone(),
                auto_approve: self.record.auto_approve,
                resume_id: self.record.resume_id.clone(),
            };
            return self.open_window(spec, true).await.map(Forked::Tab);
        }

        let id = new_id();
        let mut record = self.record.clone();
        record.session_name = self.backends.config.session_name(&id);
        record.id = id;
        record.name = new_name.to_string();
        record.status = Status::Stopped;
        record.start_revision = None;
        record.created_at = Utc::now();
        record.windows.retain(|w| w.index == PRIMARY);
        for window in &mut record.windows {
            window.dead = false;
        }
        self.backends.store.add_instance(&record)?;
        tracing::info!(from = %self.record.id, instance = %record.id, "forked instance");
        Ok(Forked::Sibling(Box::new(Self::from_record(
            self.backends.clone(),
            record,
        ))))
    }

    // ── Metadata ────────────────────────────────────────────────────────────

    pub fn rename(&mut self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Config("instance name must not be empty".into()));
        }
        self.record.name = name.to_string();
        self.persist()
    }

    pub fn set_notes(&mut self, notes: &str) -> Result<()> {
        self.record.notes = notes.to_string();
        self.persist()
    }

    pub fn set_color(&mut self, color: Option<String>, background: Option<String>) -> Result<()> {
        self.record.color = color;
        self.record.background_color = background;
        self.persist()
    }

    pub fn set_group(&mut self, group_id: Option<String>) -> Result<()> {
        self.backends
            .store
            .assign_to_group(&self.record.id, group_id.as_deref())?;
        self.record.group_id = group_id;
        Ok(())
    }

    /// Drop a membership the Store already removed
    pub(crate) fn forget_group(&mut self, group_id: &str) {
        if self.record.group_id.as_deref() == Some(group_id) {
            self.record.group_id = None;
        }
    }

    // ── Observation ─────────────────────────────────────────────────────────

    pub async fn get_preview(&self, lines: usize) -> Result<String> {
        self.require_running()?;
        self.backends
            .mux
            .capture_pane(&self.record.session_name, self.active_window, lines)
            .await
    }

    /// Teaser of the active window, falling back to the primary
    pub fn get_last_line(&self) -> String {
        self.observed
            .get(&self.active_window)
            .or_else(|| self.observed.get(&PRIMARY))
            .map(|c| c.teaser.clone())
            .unwrap_or_default()
    }

    pub async fn resize_pane(&self, cols: u16, rows: u16) -> Result<()> {
        self.require_running()?;
        self.backends
            .mux
            .resize_pane(&self.record.session_name, cols, rows)
            .await
    }

    /// Capture `index` now and classify it against the previous capture
    pub async fn detect_activity_for_window(&mut self, index: u32, width: usize) -> Result<Activity> {
        self.require_running()?;
        self.ensure_window(index)?;
        let capture = self
            .backends
            .mux
            .capture_pane(
                &self.record.session_name,
                index,
                self.backends.config.activity_lines,
            )
            .await?;
        Ok(self.apply_capture(index, &capture, width).activity)
    }

    /// Fold one capture of `index` into the observed state
    pub fn apply_capture(&mut self, index: u32, capture: &str, width: usize) -> &Classification {
        let agent = self
            .record
            .window(index)
            .map_or(AgentKind::Terminal, |w| w.agent);
        let previous = self.observed.get(&index).map(|c| &c.fingerprint);
        let classification = self.backends.classifier().classify(
            &agent.profile().patterns,
            capture,
            previous,
            width,
        );
        match self.observed.entry(index) {
            Entry::Occupied(mut slot) => {
                slot.insert(classification);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(classification),
        }
    }

    /// Fold a `has-session` answer in. Returns whether the status changed.
    ///
    /// A Stopped instance whose session exists is adopted. A Running one is
    /// only stopped after the session has been missing for `threshold`
    /// consecutive ticks.
    pub fn apply_presence(&mut self, present: bool, threshold: u32) -> Result<bool> {
        match (self.is_running(), present) {
            (true, true) => {
                self.missed_ticks = 0;
                Ok(false)
            }
            (false, true) => {
                tracing::info!(instance = %self.record.id, "session found running, adopting");
                self.mark_running()?;
                Ok(true)
            }
            (true, false) => {
                self.missed_ticks += 1;
                if self.missed_ticks < threshold.max(1) {
                    return Ok(false);
                }
                tracing::info!(instance = %self.record.id, "session disappeared, marking stopped");
                self.mark_stopped();
                self.persist()?;
                Ok(true)
            }
            (false, false) => Ok(false),
        }
    }

    /// Fold a `list-windows` answer in. Recorded windows that are dead or
    /// missing get flagged; unknown windows become extras. Returns whether
    /// anything visible changed.
    pub fn reconcile_windows(&mut self, windows: &[WindowInfo]) -> Result<bool> {
        let mut dirty = false;
        for record in &mut self.record.windows {
            let dead = windows
                .iter()
                .find(|w| w.index == record.index)
                .map_or(true, |w| w.dead);
            if record.dead != dead {
                record.dead = dead;
                dirty = true;
            }
        }
        let extras: Vec<WindowInfo> = windows
            .iter()
            .filter(|w| self.record.window(w.index).is_none())
            .cloned()
            .collect();
        let mut changed = dirty || extras != self.extra_windows;
        self.extra_windows = extras;

        let live: Vec<u32> = windows.iter().map(|w| w.index).collect();
        self.observed.retain(|index, _| live.contains(index));
        if !live.contains(&self.active_window) {
            self.active_window = PRIMARY;
            changed = true;
        }
        if dirty {
            self.persist()?;
        }
        Ok(changed)
    }

    /// Diff the working directory in `mode`
    pub async fn diff(&self, mode: DiffMode) -> DiffStats {
        diff_for(
            self.backends.vcs.clone(),
            self.record.path.clone(),
            mode,
            self.record.start_revision.clone(),
        )
        .await
    }
}

/// Owned-argument diff so it can run on a spawned task
pub async fn diff_for(
    vcs: Arc<dyn Vcs>,
    path: PathBuf,
    mode: DiffMode,
    snapshot: Option<String>,
) -> DiffStats {
    vcs.diff(&path, mode, snapshot.as_deref()).await
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}
