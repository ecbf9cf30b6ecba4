use crate::activity::Activity;
use crate::diff::{DiffMode, DiffStats};
use crate::store::{Group, InstanceRecord, Project};
use crate::tmux::WindowInfo;

/// Which pane the selected instance shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreviewTab {
    #[default]
    Preview,
    Diff,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectView {
    pub project: Project,
    pub session_count: usize,
}

/// An instance as the presentation layer sees it
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceView {
    pub record: InstanceRecord,
    /// Activity of the active window
    pub activity: Activity,
    /// Last meaningful line of the active window, escapes kept
    pub teaser: String,
    pub active_window: u32,
    /// Windows the session has but the record does not
    pub extra_windows: Vec<WindowInfo>,
}

impl InstanceView {
    pub fn id(&self) -> &str {
        &self.record.id
    }
}

/// Consistent read of everything the presentation layer renders
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub project_id: String,
    pub projects: Vec<ProjectView>,
    pub instances: Vec<InstanceView>,
    pub groups: Vec<Group>,
    pub selected: Option<String>,
    pub preview_tab: PreviewTab,
    pub diff_mode: DiffMode,
    /// Capture of the selected instance's active window
    pub preview: String,
    pub diff: Option<DiffStats>,
    /// `(operation, message)` of the latest failure per operation
    pub last_errors: Vec<(String, String)>,
}

impl Snapshot {
    pub fn instance(&self, id: &str) -> Option<&InstanceView> {
        self.instances.iter().find(|i| i.record.id == id)
    }

    pub fn selected_instance(&self) -> Option<&InstanceView> {
        self.selected.as_deref().and_then(|id| self.instance(id))
    }

    pub fn project_name(&self) -> &str {
        self.projects
            .iter()
            .find(|p| p.project.id == self.project_id)
            .map_or("", |p| p.project.name.as_str())
    }
}
