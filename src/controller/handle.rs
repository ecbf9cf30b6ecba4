use tokio::sync::{mpsc, oneshot, watch};

use super::{Command, ForkTarget, PreviewTab, Snapshot};
use crate::agents::{AgentKind, ConversationSummary};
use crate::diff::DiffMode;
use crate::error::{Error, Result};
use crate::history::{ConversationEntry, SearchMatch, Turn};
use crate::instance::{AttachInstruction, NewInstance, WindowSpec};
use crate::store::{Group, Project};

/// Everything the presentation layer can ask of the controller.
///
/// Cheap to clone. Every request is queued behind earlier requests and
/// ticks; replies arrive after the resulting state has been published.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<Snapshot>,
}

fn stopped() -> Error {
    Error::InvariantViolation("controller is not running".into())
}

impl ControllerHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Command>, state: watch::Receiver<Snapshot>) -> Self {
        Self { tx, state }
    }

    /// Receiver that is notified each time a visible field changes
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.state.clone()
    }

    pub fn get_snapshot(&self) -> Snapshot {
        self.state.borrow().clone()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    fn post(&self, command: Command) {
        if self.tx.send(command).is_err() {
            tracing::debug!("command dropped, controller is gone");
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Create a Stopped instance in the active project; returns its id
    pub async fn create_instance(&self, spec: NewInstance) -> Result<String> {
        self.request(|reply| Command::Create { spec, reply }).await
    }

    /// Start, resuming conversation `resume_id` when given
    pub async fn start(&self, id: &str, resume_id: Option<String>) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::Start { id, resume_id, reply })
            .await
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::Stop { id, reply }).await
    }

    /// Kill the session and forget the instance
    pub async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::Delete { id, reply }).await
    }

    pub async fn attach(&self, id: &str, window: Option<u32>) -> Result<AttachInstruction> {
        let id = id.to_string();
        self.request(|reply| Command::Attach { id, window, reply })
            .await
    }

    // ── Tabs ────────────────────────────────────────────────────────────────

    pub async fn add_window(&self, id: &str, spec: WindowSpec) -> Result<u32> {
        let id = id.to_string();
        self.request(|reply| Command::AddWindow { id, spec, reply })
            .await
    }

    pub async fn close_window(&self, id: &str, index: u32) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::CloseWindow { id, index, reply })
            .await
    }

    pub async fn rename_window(&self, id: &str, index: u32, name: &str) -> Result<()> {
        let (id, name) = (id.to_string(), name.to_string());
        self.request(|reply| Command::RenameWindow {
            id,
            index,
            name,
            reply,
        })
        .await
    }

    pub async fn select_window(&self, id: &str, index: u32) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::SelectWindow { id, index, reply })
            .await
    }

    pub async fn follow_window(&self, id: &str, index: u32) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::FollowWindow { id, index, reply })
            .await
    }

    pub async fn send_prompt(&self, id: &str, index: u32, text: &str) -> Result<()> {
        let (id, text) = (id.to_string(), text.to_string());
        self.request(|reply| Command::SendPrompt {
            id,
            index,
            text,
            reply,
        })
        .await
    }

    pub async fn send_key(&self, id: &str, index: u32, key: &str) -> Result<()> {
        let (id, key) = (id.to_string(), key.to_string());
        self.request(|reply| Command::SendKey {
            id,
            index,
            key,
            reply,
        })
        .await
    }

    pub async fn fork(&self, id: &str, name: &str, as_tab: bool) -> Result<ForkTarget> {
        let (id, name) = (id.to_string(), name.to_string());
        self.request(|reply| Command::Fork {
            id,
            name,
            as_tab,
            reply,
        })
        .await
    }

    pub async fn resize_pane(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::ResizePane {
            id,
            cols,
            rows,
            reply,
        })
        .await
    }

    // ── Metadata ────────────────────────────────────────────────────────────

    pub async fn rename(&self, id: &str, name: &str) -> Result<()> {
        let (id, name) = (id.to_string(), name.to_string());
        self.request(|reply| Command::Rename { id, name, reply })
            .await
    }

    pub async fn set_notes(&self, id: &str, notes: &str) -> Result<()> {
        let (id, notes) = (id.to_string(), notes.to_string());
        self.request(|reply| Command::SetNotes { id, notes, reply })
            .await
    }

    pub async fn set_color(
        &self,
        id: &str,
        color: Option<String>,
        background: Option<String>,
    ) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::SetColor {
            id,
            color,
            background,
            reply,
        })
        .await
    }

    pub async fn reorder(&self, ids: Vec<String>) -> Result<()> {
        self.request(|reply| Command::Reorder { ids, reply }).await
    }

    pub async fn create_group(&self, name: &str) -> Result<Group> {
        let name = name.to_string();
        self.request(|reply| Command::CreateGroup { name, reply })
            .await
    }

    pub async fn rename_group(&self, id: &str, name: &str) -> Result<()> {
        let (id, name) = (id.to_string(), name.to_string());
        self.request(|reply| Command::RenameGroup { id, name, reply })
            .await
    }

    pub async fn delete_group(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::DeleteGroup { id, reply }).await
    }

    pub async fn assign_group(&self, id: &str, group_id: Option<String>) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::AssignGroup {
            id,
            group_id,
            reply,
        })
        .await
    }

    // ── Projects ────────────────────────────────────────────────────────────

    pub async fn create_project(&self, name: &str) -> Result<Project> {
        let name = name.to_string();
        self.request(|reply| Command::CreateProject { name, reply })
            .await
    }

    pub async fn rename_project(&self, id: &str, name: &str) -> Result<()> {
        let (id, name) = (id.to_string(), name.to_string());
        self.request(|reply| Command::RenameProject { id, name, reply })
            .await
    }

    pub async fn delete_project(&self, id: &str, cascade: bool) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::DeleteProject { id, cascade, reply })
            .await
    }

    pub async fn switch_project(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::SwitchProject { id, reply })
            .await
    }

    /// Move every instance of `from` into the active project
    pub async fn import_project(&self, from: &str) -> Result<usize> {
        let from = from.to_string();
        self.request(|reply| Command::ImportProject { from, reply })
            .await
    }

    // ── View state ──────────────────────────────────────────────────────────

    pub fn select(&self, id: Option<String>) {
        self.post(Command::Select { id });
    }

    pub fn set_preview_tab(&self, tab: PreviewTab) {
        self.post(Command::SetPreviewTab(tab));
    }

    pub fn set_diff_mode(&self, mode: DiffMode) {
        self.post(Command::SetDiffMode(mode));
    }

    /// Column budget for teasers
    pub fn set_teaser_width(&self, width: usize) {
        self.post(Command::SetTeaserWidth(width));
    }

    // ── History ─────────────────────────────────────────────────────────────

    /// Search every agent's history. The index is built on first use and
    /// rebuilt when `rebuild` is set.
    pub async fn search(&self, query: &str, limit: usize, rebuild: bool) -> Result<Vec<SearchMatch>> {
        let query = query.to_string();
        self.request(|reply| Command::Search {
            query,
            limit,
            rebuild,
            reply,
        })
        .await
    }

    pub async fn conversation(&self, entry: ConversationEntry) -> Result<Vec<Turn>> {
        self.request(|reply| Command::Conversation { entry, reply })
            .await
    }

    /// Resumable `agent` conversations recorded for instance `id`'s directory
    pub async fn list_conversations(
        &self,
        agent: AgentKind,
        id: &str,
    ) -> Result<Vec<ConversationSummary>> {
        let id = id.to_string();
        self.request(|reply| Command::ListConversations { agent, id, reply })
            .await
    }

    /// Stop the controller task. Sessions are left running.
    pub fn shutdown(&self) {
        self.post(Command::Shutdown);
    }
}
