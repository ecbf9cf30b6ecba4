use crossterm::event::KeyEvent;

use crate::agents::ConversationSummary;
use crate::controller::{PreviewTab, Snapshot};
use crate::diff::DiffMode;
use crate::history::{ConversationEntry, SearchMatch, Turn};
use crate::instance::{NewInstance, WindowSpec};

/// Actions that can be dispatched through the application
#[derive(Debug, Clone)]
pub enum Action {
    /// A key was pressed
    KeyPress(KeyEvent),
    /// The controller published new state
    SnapshotUpdated(Snapshot),
    /// An error occurred
    Error(String),
    /// Something worth telling the user
    Info(String),
    /// Request to quit the application
    Quit,

    // Requests for the controller, executed by the main loop
    Create(NewInstance),
    Start { id: String, resume_id: Option<String> },
    Stop(String),
    Delete(String),
    Attach { id: String, window: Option<u32> },
    AddTab { id: String, spec: WindowSpec },
    CloseTab { id: String, index: u32 },
    SelectTab { id: String, index: u32 },
    FollowTab { id: String, index: u32 },
    SendPrompt { id: String, index: u32, text: String },
    SendKey { id: String, index: u32, key: String },
    RenameTab { id: String, index: u32, name: String },
    Fork { id: String, name: String, as_tab: bool },
    Rename { id: String, name: String },
    SetNotes { id: String, notes: String },
    SetColor { id: String, color: Option<String> },
    /// Assign to the group with this name, creating it if needed
    Group { id: String, name: Option<String> },
    Reorder(Vec<String>),
    SwitchProject(String),
    CreateProject(String),
    ImportProject(String),
    Select(Option<String>),
    SetPreviewTab(PreviewTab),
    SetDiffMode(DiffMode),
    SetTeaserWidth(usize),
    Search(String),
    ListConversations(String),
    ShowConversation(ConversationEntry),

    // Results of background requests
    SearchResults(Vec<SearchMatch>),
    ConversationsListed { id: String, conversations: Vec<ConversationSummary> },
    ConversationLoaded(Vec<Turn>),
}
