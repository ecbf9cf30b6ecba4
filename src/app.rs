use std::path::PathBuf;

use anyhow::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap},
    Frame,
};

use crate::actions::Action;
use crate::activity::{strip_ansi, Activity};
use crate::agents::{AgentKind, ConversationSummary};
use crate::controller::{InstanceView, PreviewTab, Snapshot};
use crate::history::{Role, SearchMatch, Turn};
use crate::instance::{NewInstance, WindowSpec};
use crate::store::Status;

/// Name colors cycled with 'c'; after the last one the color is cleared
const COLORS: [&str; 6] = ["red", "green", "yellow", "blue", "magenta", "cyan"];

pub struct Theme {
    pub bg: Color,
    pub fg: Color,
    pub accent: Color,
    pub dim: Color,
    pub success: Color,
    pub warning: Color,
    pub error: Color,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            bg: Color::Rgb(30, 30, 30),
            fg: Color::Rgb(220, 220, 220),
            accent: Color::Rgb(217, 119, 87),
            dim: Color::Rgb(100, 100, 100),
            success: Color::Rgb(80, 200, 120),
            warning: Color::Rgb(255, 193, 7),
            error: Color::Rgb(220, 53, 69),
        }
    }
}

/// Input mode for the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Creating,
    Confirming,
    Prompting,
    Renaming,
    Forking { as_tab: bool },
    RenamingTab,
    EditingNotes,
    Grouping,
    NamingProject,
    Importing,
    Searching,
    Resuming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreateField {
    #[default]
    Name,
    Path,
    Command,
}

impl CreateField {
    fn next(self) -> Self {
        match self {
            CreateField::Name => CreateField::Path,
            CreateField::Path => CreateField::Command,
            CreateField::Command => CreateField::Name,
        }
    }
}

/// The new-instance dialog
#[derive(Debug, Clone)]
pub struct CreateForm {
    pub name: String,
    pub path: String,
    pub command: String,
    pub agent: AgentKind,
    pub field: CreateField,
}

impl CreateForm {
    fn new(path: String) -> Self {
        Self {
            name: String::new(),
            path,
            command: String::new(),
            agent: AgentKind::Claude,
            field: CreateField::Name,
        }
    }

    fn focused(&mut self) -> &mut String {
        match self.field {
            CreateField::Name => &mut self.name,
            CreateField::Path => &mut self.path,
            CreateField::Command => &mut self.command,
        }
    }
}

/// Main application state
pub struct App {
    /// Latest state published by the controller
    pub snapshot: Snapshot,
    pub list_state: ListState,
    /// Current message to display (info or error)
    pub message: Option<String>,
    pub message_is_error: bool,
    pub theme: Theme,
    pub input_mode: InputMode,
    pub input_buffer: String,
    pub form: CreateForm,
    default_path: String,
    pub search_results: Vec<SearchMatch>,
    pub search_state: ListState,
    last_query: String,
    /// Turns of the highlighted search hit
    pub conversation_turns: Vec<Turn>,
    pub conversations: Vec<ConversationSummary>,
    pub conversation_state: ListState,
    resume_target: Option<String>,
    teaser_width: usize,
    /// Pending action queue
    pub pending_actions: Vec<Action>,
}

impl App {
    pub fn new(cwd: PathBuf) -> Self {
        let default_path = cwd.to_string_lossy().into_owned();
        Self {
            snapshot: Snapshot::default(),
            list_state: ListState::default(),
            message: None,
            message_is_error: false,
            theme: Theme::default(),
            input_mode: InputMode::Normal,
            input_buffer: String::new(),
            form: CreateForm::new(default_path.clone()),
            default_path,
            search_results: Vec::new(),
            search_state: ListState::default(),
            last_query: String::new(),
            conversation_turns: Vec::new(),
            conversations: Vec::new(),
            conversation_state: ListState::default(),
            resume_target: None,
            teaser_width: 0,
            pending_actions: Vec::new(),
        }
    }

    pub fn selected_instance(&self) -> Option<&InstanceView> {
        self.list_state
            .selected()
            .and_then(|i| self.snapshot.instances.get(i))
    }

    fn selected_id(&self) -> Option<String> {
        self.selected_instance().map(|i| i.id().to_string())
    }

    /// Take pending actions (drains the queue)
    pub fn take_pending_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.pending_actions)
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
        self.message_is_error = false;
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
        self.message_is_error = true;
    }

    /// Handle an action and return whether to quit
    pub fn handle_action(&mut self, action: Action) -> Result<bool> {
        match action {
            Action::KeyPress(key) => self.handle_key(key),
            Action::SnapshotUpdated(snapshot) => {
                self.apply_snapshot(snapshot);
                Ok(false)
            }
            Action::Error(msg) => {
                self.error(msg);
                Ok(false)
            }
            Action::Info(msg) => {
                self.info(msg);
                Ok(false)
            }
            Action::SearchResults(results) => {
                self.search_state
                    .select(if results.is_empty() { None } else { Some(0) });
                if results.is_empty() {
                    self.info(format!("no history matches '{}'", self.last_query));
                }
                self.search_results = results;
                Ok(false)
            }
            Action::ConversationLoaded(turns) => {
                self.conversation_turns = turns;
                Ok(false)
            }
            Action::ConversationsListed { id, conversations } => {
                if conversations.is_empty() {
                    self.info("no previous conversations for this directory");
                } else {
                    self.conversation_state.select(Some(0));
                    self.conversations = conversations;
                    self.resume_target = Some(id);
                    self.input_mode = InputMode::Resuming;
                }
                Ok(false)
            }
            Action::Quit => Ok(true),
            _ => Ok(false),
        }
    }

    /// Follow the controller's selection, or pick the first instance
    fn apply_snapshot(&mut self, snapshot: Snapshot) {
        let position = snapshot
            .selected
            .as_deref()
            .and_then(|id| snapshot.instances.iter().position(|i| i.id() == id));
        self.snapshot = snapshot;
        match position {
            Some(i) => self.list_state.select(Some(i)),
            None if self.snapshot.instances.is_empty() => self.list_state.select(None),
            None => {
                self.list_state.select(Some(0));
                let id = self.selected_id();
                self.pending_actions.push(Action::Select(id));
            }
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> Result<bool> {
        if self.message.is_some() && self.input_mode == InputMode::Normal {
            self.message = None;
        }
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return Ok(true);
        }

        match self.input_mode.clone() {
            InputMode::Normal => self.handle_normal_key(key),
            InputMode::Creating => {
                self.handle_creating_key(key);
                Ok(false)
            }
            InputMode::Confirming => {
                self.handle_confirming_key(key);
                Ok(false)
            }
            InputMode::Searching => {
                self.handle_search_key(key);
                Ok(false)
            }
            InputMode::Resuming => {
                self.handle_resume_key(key);
                Ok(false)
            }
            mode => {
                self.handle_text_key(mode, key);
                Ok(false)
            }
        }
    }

    fn handle_normal_key(&mut self, key: KeyEvent) -> Result<bool> {
        let selected = self.selected_instance().cloned();
        match key.code {
            KeyCode::Char('q') => return Ok(true),
            KeyCode::Char('j') | KeyCode::Down => self.move_selection(1),
            KeyCode::Char('k') | KeyCode::Up => self.move_selection(-1),
            KeyCode::Char('J') => self.move_instance(1),
            KeyCode::Char('K') => self.move_instance(-1),
            KeyCode::Char('n') => {
                self.form = CreateForm::new(self.default_path.clone());
                self.input_mode = InputMode::Creating;
            }
            KeyCode::Char('N') => self.open_text(InputMode::NamingProject, ""),
            KeyCode::Char('i') => self.open_text(InputMode::Importing, ""),
            KeyCode::Char('P') => self.cycle_project(),
            KeyCode::Char('/') => {
                self.input_buffer = self.last_query.clone();
                self.input_mode = InputMode::Searching;
            }
            KeyCode::Tab => {
                let tab = match self.snapshot.preview_tab {
                    PreviewTab::Preview => PreviewTab::Diff,
                    PreviewTab::Diff => PreviewTab::Preview,
                };
                self.pending_actions.push(Action::SetPreviewTab(tab));
            }
            KeyCode::Char('m') => {
                let mode = self.snapshot.diff_mode.toggle();
                self.pending_actions.push(Action::SetDiffMode(mode));
            }
            _ => {
                if let Some(inst) = selected {
                    self.handle_instance_key(&inst, key);
                }
            }
        }
        Ok(false)
    }

    /// Keys that act on the selected instance
    fn handle_instance_key(&mut self, inst: &InstanceView, key: KeyEvent) {
        let id = inst.id().to_string();
        match key.code {
            KeyCode::Enter => self.pending_actions.push(Action::Attach {
                id,
                window: Some(inst.active_window),
            }),
            KeyCode::Char('s') => self
                .pending_actions
                .push(Action::Start { id, resume_id: None }),
            KeyCode::Char('r') => self.pending_actions.push(Action::ListConversations(id)),
            KeyCode::Char('x') => self.pending_actions.push(Action::Stop(id)),
            KeyCode::Char('d') => self.input_mode = InputMode::Confirming,
            KeyCode::Char('p') => self.open_text(InputMode::Prompting, ""),
            KeyCode::Char('R') => {
                let name = inst.record.name.clone();
                self.open_text(InputMode::Renaming, &name);
            }
            KeyCode::Char('e') => {
                let notes = inst.record.notes.clone();
                self.open_text(InputMode::EditingNotes, &notes);
            }
            KeyCode::Char('g') => {
                let current = inst
                    .record
                    .group_id
                    .as_deref()
                    .and_then(|gid| self.snapshot.groups.iter().find(|g| g.id == gid))
                    .map(|g| g.name.clone())
                    .unwrap_or_default();
                self.open_text(InputMode::Grouping, &current);
            }
            KeyCode::Char('c') => {
                let next = match inst.record.color.as_deref() {
                    None => Some(COLORS[0]),
                    Some(current) => COLORS
                        .iter()
                        .position(|c| *c == current)
                        .and_then(|i| COLORS.get(i + 1))
                        .copied(),
                };
                self.pending_actions.push(Action::SetColor {
                    id,
                    color: next.map(str::to_string),
                });
            }
            KeyCode::Char('I') => self.pending_actions.push(Action::SendKey {
                id,
                index: inst.active_window,
                key: "C-c".to_string(),
            }),
            KeyCode::Char('T') => {
                let name = inst
                    .record
                    .window(inst.active_window)
                    .map(|w| w.name.clone())
                    .unwrap_or_default();
                self.open_text(InputMode::RenamingTab, &name);
            }
            KeyCode::Char('f') => self.open_text(InputMode::Forking { as_tab: false }, ""),
            KeyCode::Char('F') => self.open_text(InputMode::Forking { as_tab: true }, ""),
            KeyCode::Char('t') => self.pending_actions.push(Action::AddTab {
                id,
                spec: WindowSpec::terminal("terminal"),
            }),
            KeyCode::Char('w') if inst.active_window != 0 => {
                self.pending_actions.push(Action::CloseTab {
                    id,
                    index: inst.active_window,
                })
            }
            KeyCode::Char('o') => {
                if let Some(extra) = inst.extra_windows.first() {
                    self.pending_actions.push(Action::FollowTab {
                        id,
                        index: extra.index,
                    });
                }
            }
            KeyCode::Char(']') => self.cycle_tab(inst, 1),
            KeyCode::Char('[') => self.cycle_tab(inst, -1),
            _ => {}
        }
    }

    fn open_text(&mut self, mode: InputMode, initial: &str) {
        self.input_buffer = initial.to_string();
        self.input_mode = mode;
    }

    fn handle_creating_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Enter => {
                let form = &self.form;
                if form.name.trim().is_empty() {
                    self.error("name must not be empty");
                    return;
                }
                let command = form.command.trim();
                self.pending_actions.push(Action::Create(NewInstance {
                    name: form.name.trim().to_string(),
                    path: PathBuf::from(form.path.trim()),
                    agent: form.agent,
                    custom_command: (!command.is_empty()).then(|| command.to_string()),
                    auto_approve: false,
                    resume_id: None,
                    project_id: self.snapshot.project_id.clone(),
                    group_id: None,
                }));
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Esc => self.input_mode = InputMode::Normal,
            KeyCode::Tab => self.form.field = self.form.field.next(),
            KeyCode::BackTab => self.form.agent = self.form.agent.next(),
            KeyCode::Char(c) => self.form.focused().push(c),
            KeyCode::Backspace => {
                self.form.focused().pop();
            }
            _ => {}
        }
    }

    fn handle_confirming_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Char('y') | KeyCode::Char('Y') => {
                if let Some(id) = self.selected_id() {
                    self.pending_actions.push(Action::Delete(id));
                }
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                self.input_mode = InputMode::Normal;
            }
            _ => {}
        }
    }

    /// Single-line dialogs: prompt, rename, fork and project name
    fn handle_text_key(&mut self, mode: InputMode, key: KeyEvent) {
        match key.code {
            KeyCode::Enter => {
                let text = std::mem::take(&mut self.input_buffer);
                self.input_mode = InputMode::Normal;
                self.submit_text(mode, text);
            }
            KeyCode::Esc => {
                self.input_buffer.clear();
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Char(c) => self.input_buffer.push(c),
            KeyCode::Backspace => {
                self.input_buffer.pop();
            }
            _ => {}
        }
    }

    /// Turn a confirmed dialog into a request. Notes and groups may be
    /// cleared; everything else needs text.
    fn submit_text(&mut self, mode: InputMode, text: String) {
        let empty = text.trim().is_empty();
        match mode {
            InputMode::NamingProject | InputMode::Importing if empty => return,
            InputMode::NamingProject => {
                self.pending_actions
                    .push(Action::CreateProject(text.trim().to_string()));
                return;
            }
            InputMode::Importing => {
                let name = text.trim();
                match self.snapshot.projects.iter().find(|p| p.project.name == name) {
                    Some(p) => {
                        let id = p.project.id.clone();
                        self.pending_actions.push(Action::ImportProject(id));
                    }
                    None => self.error(format!("no project named '{}'", name)),
                }
                return;
            }
            _ => {}
        }

        let Some(inst) = self.selected_instance().cloned() else {
            return;
        };
        let id = inst.id().to_string();
        let index = inst.active_window;
        let action = match mode {
            InputMode::EditingNotes => Action::SetNotes { id, notes: text },
            InputMode::Grouping => Action::Group {
                id,
                name: Some(text.trim().to_string()).filter(|n| !n.is_empty()),
            },
            _ if empty => return,
            InputMode::RenamingTab => Action::RenameTab {
                id,
                index,
                name: text,
            },
            InputMode::Prompting => Action::SendPrompt { id, index, text },
            InputMode::Renaming => Action::Rename { id, name: text },
            InputMode::Forking { as_tab } => Action::Fork {
                id,
                name: text,
                as_tab,
            },
            _ => return,
        };
        self.pending_actions.push(action);
    }

    fn handle_search_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Enter => {
                let query = self.input_buffer.trim().to_string();
                if query.is_empty() {
                    return;
                }
                if query != self.last_query || self.search_results.is_empty() {
                    self.last_query = query.clone();
                    self.search_results.clear();
                    self.conversation_turns.clear();
                    self.pending_actions.push(Action::Search(query));
                } else {
                    self.jump_to_result();
                }
            }
            KeyCode::Esc => self.input_mode = InputMode::Normal,
            KeyCode::Tab => {
                if let Some(hit) = self
                    .search_state
                    .selected()
                    .and_then(|i| self.search_results.get(i))
                {
                    let entry = hit.entry.clone();
                    self.pending_actions.push(Action::ShowConversation(entry));
                }
            }
            KeyCode::Down => {
                select_step(&mut self.search_state, self.search_results.len(), 1);
                self.conversation_turns.clear();
            }
            KeyCode::Up => {
                select_step(&mut self.search_state, self.search_results.len(), -1);
                self.conversation_turns.clear();
            }
            KeyCode::Char(c) => self.input_buffer.push(c),
            KeyCode::Backspace => {
                self.input_buffer.pop();
            }
            _ => {}
        }
    }

    /// Select the instance (and tab) a search hit resolved to
    fn jump_to_result(&mut self) {
        let Some(hit) = self
            .search_state
            .selected()
            .and_then(|i| self.search_results.get(i))
        else {
            return;
        };
        let Some(id) = hit.instance_id.clone() else {
            self.info("no session in this project matches that conversation");
            return;
        };
        let tab = hit.tab_index;
        self.pending_actions.push(Action::Select(Some(id.clone())));
        if let Some(index) = tab {
            self.pending_actions.push(Action::SelectTab { id, index });
        }
        self.input_mode = InputMode::Normal;
    }

    fn handle_resume_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Enter => {
                let chosen = self
                    .conversation_state
                    .selected()
                    .and_then(|i| self.conversations.get(i))
                    .map(|c| c.id.clone());
                if let (Some(id), Some(resume_id)) = (self.resume_target.take(), chosen) {
                    self.pending_actions.push(Action::Start {
                        id,
                        resume_id: Some(resume_id),
                    });
                }
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Esc => self.input_mode = InputMode::Normal,
            KeyCode::Down | KeyCode::Char('j') => {
                select_step(&mut self.conversation_state, self.conversations.len(), 1)
            }
            KeyCode::Up | KeyCode::Char('k') => {
                select_step(&mut self.conversation_state, self.conversations.len(), -1)
            }
            _ => {}
        }
    }

    fn move_selection(&mut self, step: isize) {
        let len = self.snapshot.instances.len();
        select_step(&mut self.list_state, len, step);
        if len > 0 {
            let id = self.selected_id();
            self.pending_actions.push(Action::Select(id));
        }
    }

    fn move_instance(&mut self, step: isize) {
        let Some(from) = self.list_state.selected() else {
            return;
        };
        let len = self.snapshot.instances.len();
        let to = from as isize + step;
        if to < 0 || to as usize >= len {
            return;
        }
        let mut ids: Vec<String> = self
            .snapshot
            .instances
            .iter()
            .map(|i| i.id().to_string())
            .collect();
        ids.swap(from, to as usize);
        self.pending_actions.push(Action::Reorder(ids));
    }

    fn cycle_project(&mut self) {
        let projects = &self.snapshot.projects;
        if projects.len() < 2 {
            return;
        }
        let current = projects
            .iter()
            .position(|p| p.project.id == self.snapshot.project_id)
            .unwrap_or(0);
        let next = projects[(current + 1) % projects.len()].project.id.clone();
        self.pending_actions.push(Action::SwitchProject(next));
    }

    fn cycle_tab(&mut self, inst: &InstanceView, step: isize) {
        let tabs = tab_indices(inst);
        let Some(pos) = tabs.iter().position(|i| *i == inst.active_window) else {
            return;
        };
        let next = (pos as isize + step).rem_euclid(tabs.len() as isize) as usize;
        if tabs[next] != inst.active_window {
            self.pending_actions.push(Action::SelectTab {
                id: inst.id().to_string(),
                index: tabs[next],
            });
        }
    }

    // ── Rendering ───────────────────────────────────────────────────────────

    pub fn render(&mut self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3),
                Constraint::Min(0),
                Constraint::Length(3),
            ])
            .split(frame.area());

        self.render_header(frame, chunks[0]);
        self.render_main(frame, chunks[1]);
        self.render_footer(frame, chunks[2]);

        match self.input_mode {
            InputMode::Creating => self.render_create_dialog(frame),
            InputMode::Confirming => self.render_confirm_dialog(frame),
            InputMode::Searching => self.render_search(frame),
            InputMode::Resuming => self.render_resume(frame),
            InputMode::Prompting => self.render_text_dialog(frame, " Send Prompt "),
            InputMode::Renaming => self.render_text_dialog(frame, " Rename "),
            InputMode::Forking { as_tab: false } => self.render_text_dialog(frame, " Fork "),
            InputMode::Forking { as_tab: true } => self.render_text_dialog(frame, " Fork Into Tab "),
            InputMode::RenamingTab => self.render_text_dialog(frame, " Rename Tab "),
            InputMode::EditingNotes => self.render_text_dialog(frame, " Notes "),
            InputMode::Grouping => self.render_text_dialog(frame, " Group (empty to ungroup) "),
            InputMode::NamingProject => self.render_text_dialog(frame, " New Project "),
            InputMode::Importing => self.render_text_dialog(frame, " Import Sessions From Project "),
            InputMode::Normal => {}
        }
    }

    fn render_header(&self, frame: &mut Frame, area: Rect) {
        let running = self
            .snapshot
            .instances
            .iter()
            .filter(|i| i.record.status == Status::Running)
            .count();
        let title = Paragraph::new(Line::from(vec![
            Span::styled(
                " asmgr ",
                Style::default()
                    .fg(self.theme.accent)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!(
                    "│ {} │ {} sessions, {} running",
                    self.snapshot.project_name(),
                    self.snapshot.instances.len(),
                    running
                ),
                Style::default().fg(self.theme.dim),
            ),
        ]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(title, area);
    }

    fn render_main(&mut self, frame: &mut Frame, area: Rect) {
        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
            .split(area);

        self.render_instance_list(frame, chunks[0]);
        self.render_detail_pane(frame, chunks[1]);
    }

    fn status_icon(&self, inst: &InstanceView) -> Span<'static> {
        if inst.record.status == Status::Stopped {
            return Span::styled("○ ", Style::default().fg(self.theme.dim));
        }
        match inst.activity {
            Activity::Busy => Span::styled("● ", Style::default().fg(self.theme.warning)),
            Activity::Idle => Span::styled("● ", Style::default().fg(self.theme.success)),
            Activity::Waiting => Span::styled("? ", Style::default().fg(self.theme.accent)),
        }
    }

    fn render_instance_list(&mut self, frame: &mut Frame, area: Rect) {
        // Teasers are fitted by the controller; keep its budget in step.
        let width = usize::from(area.width.saturating_sub(6)).max(1);
        if width != self.teaser_width {
            self.teaser_width = width;
            self.pending_actions.push(Action::SetTeaserWidth(width));
        }

        let items: Vec<ListItem> = if self.snapshot.instances.is_empty() {
            vec![ListItem::new(Line::from(Span::styled(
                "  No sessions yet. Press 'n' to create one.",
                Style::default().fg(self.theme.dim),
            )))]
        } else {
            self.snapshot
                .instances
                .iter()
                .map(|inst| {
                    let name_style = inst
                        .record
                        .color
                        .as_deref()
                        .and_then(|c| c.parse::<Color>().ok())
                        .map_or(Style::default().fg(self.theme.fg), |c| {
                            Style::default().fg(c)
                        });
                    let mut title = vec![
                        self.status_icon(inst),
                        Span::styled(inst.record.name.clone(), name_style),
                        Span::styled(
                            format!("  {}", inst.record.agent.profile().display_name),
                            Style::default().fg(self.theme.dim),
                        ),
                    ];
                    if inst.record.windows.len() + inst.extra_windows.len() > 1 {
                        title.push(Span::styled(
                            format!(" [{}]", inst.record.windows.len() + inst.extra_windows.len()),
                            Style::default().fg(self.theme.dim),
                        ));
                    }
                    let teaser = Line::from(Span::styled(
                        format!("  {}", strip_ansi(&inst.teaser)),
                        Style::default().fg(self.theme.dim),
                    ));
                    ListItem::new(vec![Line::from(title), teaser])
                })
                .collect()
        };

        let list = List::new(items)
            .block(
                Block::default()
                    .title(" Sessions ")
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(self.theme.dim)),
            )
            .highlight_style(
                Style::default()
                    .bg(Color::Rgb(50, 50, 50))
                    .add_modifier(Modifier::BOLD),
            )
            .highlight_symbol("▶ ");

        frame.render_stateful_widget(list, area, &mut self.list_state);
    }

    fn render_detail_pane(&self, frame: &mut Frame, area: Rect) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(3), Constraint::Min(0)])
            .split(area);

        let Some(inst) = self.selected_instance() else {
            let empty = Paragraph::new(Line::from(Span::styled(
                "No session selected",
                Style::default().fg(self.theme.dim),
            )))
            .block(Block::default().borders(Borders::ALL));
            frame.render_widget(empty, area);
            return;
        };

        frame.render_widget(self.tab_bar(inst), chunks[0]);
        let body = match self.snapshot.preview_tab {
            PreviewTab::Preview => self.preview_body(inst, chunks[1]),
            PreviewTab::Diff => self.diff_body(chunks[1]),
        };
        frame.render_widget(body, chunks[1]);
    }

    fn tab_bar(&self, inst: &InstanceView) -> Paragraph<'static> {
        let mut spans = Vec::new();
        for window in &inst.record.windows {
            let active = window.index == inst.active_window;
            let mut style = Style::default().fg(if window.dead {
                self.theme.error
            } else {
                self.theme.fg
            });
            if active {
                style = style.fg(self.theme.accent).add_modifier(Modifier::BOLD);
            }
            let marker = if window.dead { "✗" } else { "" };
            spans.push(Span::styled(
                format!(" {}:{}{} ", window.index, window.name, marker),
                style,
            ));
        }
        for extra in &inst.extra_windows {
            spans.push(Span::styled(
                format!(" +{}:{} ", extra.index, extra.name),
                Style::default().fg(self.theme.dim),
            ));
        }
        Paragraph::new(Line::from(spans)).block(
            Block::default()
                .title(" Tabs ")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        )
    }

    fn preview_body(&self, inst: &InstanceView, area: Rect) -> Paragraph<'static> {
        let lines: Vec<Line> = if inst.record.status == Status::Stopped {
            vec![Line::from(Span::styled(
                "Stopped. Press 's' to start or 'r' to resume a conversation.",
                Style::default().fg(self.theme.dim),
            ))]
        } else {
            let plain = strip_ansi(&self.snapshot.preview);
            let all: Vec<&str> = plain.lines().collect();
            let visible = usize::from(area.height.saturating_sub(2));
            all[all.len().saturating_sub(visible)..]
                .iter()
                .map(|l| Line::from(l.to_string()))
                .collect()
        };
        Paragraph::new(lines).block(
            Block::default()
                .title(" Preview ")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        )
    }

    fn diff_body(&self, area: Rect) -> Paragraph<'static> {
        let mode = self.snapshot.diff_mode.label();
        let Some(diff) = &self.snapshot.diff else {
            return Paragraph::new("computing diff…").block(
                Block::default()
                    .title(format!(" Diff ({mode}) "))
                    .borders(Borders::ALL),
            );
        };
        let mut lines = Vec::new();
        if let Some(err) = &diff.err {
            lines.push(Line::from(Span::styled(
                err.clone(),
                Style::default().fg(self.theme.error),
            )));
        }
        if let Some(note) = &diff.note {
            lines.push(Line::from(Span::styled(
                note.clone(),
                Style::default().fg(self.theme.warning),
            )));
        }
        if diff.is_empty() && diff.err.is_none() {
            lines.push(Line::from(Span::styled(
                "no changes",
                Style::default().fg(self.theme.dim),
            )));
        }
        let budget = usize::from(area.height.saturating_sub(2));
        for line in diff.content.lines().take(budget) {
            let color = if line.starts_with('+') && !line.starts_with("+++") {
                self.theme.success
            } else if line.starts_with('-') && !line.starts_with("---") {
                self.theme.error
            } else if line.starts_with("@@") {
                self.theme.accent
            } else {
                self.theme.fg
            };
            lines.push(Line::from(Span::styled(
                line.to_string(),
                Style::default().fg(color),
            )));
        }
        Paragraph::new(lines).block(
            Block::default()
                .title(format!(" Diff ({mode}) +{} -{} ", diff.added, diff.removed))
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        )
    }

    fn render_footer(&self, frame: &mut Frame, area: Rect) {
        let help_text = " q: Quit │ n: New │ s/x: Start/Stop │ r: Resume │ Enter: Attach │ p: Prompt │ t/w/[/]: Tabs │ f/F: Fork │ /: Search │ Tab: Diff │ P/N: Projects ";

        let content = if let Some(ref msg) = self.message {
            let style = if self.message_is_error {
                Style::default().fg(self.theme.error)
            } else {
                Style::default().fg(self.theme.success)
            };
            Line::from(Span::styled(format!(" {} ", msg), style))
        } else if let Some((op, err)) = self.snapshot.last_errors.first() {
            Line::from(Span::styled(
                format!(" {op}: {err} "),
                Style::default().fg(self.theme.error),
            ))
        } else {
            Line::from(Span::styled(help_text, Style::default().fg(self.theme.dim)))
        };

        let footer = Paragraph::new(content).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(footer, area);
    }

    fn dialog(&self, frame: &mut Frame, title: &str, percent_y: u16, color: Color) -> Rect {
        let area = centered_rect(60, percent_y, frame.area());
        frame.render_widget(Clear, area);
        let block = Block::default()
            .title(title.to_string())
            .borders(Borders::ALL)
            .border_style(Style::default().fg(color));
        let inner = block.inner(area);
        frame.render_widget(block, area);
        inner
    }

    fn render_create_dialog(&self, frame: &mut Frame) {
        let inner = self.dialog(frame, " Create New Session ", 40, self.theme.accent);
        let form = &self.form;
        let field = |label: &str, value: &str, focused: bool| {
            let style = if focused {
                Style::default()
                    .fg(self.theme.accent)
                    .add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(self.theme.fg)
            };
            let cursor = if focused { "_" } else { "" };
            Line::from(vec![
                Span::styled(format!("{label:>9}: "), Style::default().fg(self.theme.dim)),
                Span::styled(format!("{value}{cursor}"), style),
            ])
        };
        let text = vec![
            Line::from(""),
            field("Name", &form.name, form.field == CreateField::Name),
            field("Path", &form.path, form.field == CreateField::Path),
            Line::from(vec![
                Span::styled("    Agent: ", Style::default().fg(self.theme.dim)),
                Span::styled(
                    form.agent.profile().display_name,
                    Style::default().fg(self.theme.fg),
                ),
            ]),
            field("Command", &form.command, form.field == CreateField::Command),
            Line::from(""),
            Line::from(Span::styled(
                "Tab: next field │ Shift-Tab: change agent │ Enter: create │ Esc: cancel",
                Style::default().fg(self.theme.dim),
            )),
        ];
        frame.render_widget(Paragraph::new(text), inner);
    }

    fn render_confirm_dialog(&self, frame: &mut Frame) {
        let inner = self.dialog(frame, " Confirm Delete ", 20, self.theme.error);
        let name = self
            .selected_instance()
            .map(|s| s.record.name.as_str())
            .unwrap_or("unknown");

        let text = vec![
            Line::from(""),
            Line::from(Span::styled(
                format!("Delete session '{}'?", name),
                Style::default().fg(self.theme.fg),
            )),
            Line::from(""),
            Line::from(Span::styled(
                "The tmux session is killed and the record removed.",
                Style::default().fg(self.theme.warning),
            )),
            Line::from(""),
            Line::from(Span::styled(
                "Press 'y' to confirm, 'n' or Esc to cancel",
                Style::default().fg(self.theme.dim),
            )),
        ];
        frame.render_widget(Paragraph::new(text), inner);
    }

    fn render_text_dialog(&self, frame: &mut Frame, title: &str) {
        let inner = self.dialog(frame, title, 20, self.theme.accent);
        let text = vec![
            Line::from(""),
            Line::from(Span::styled(
                format!("▶ {}_", self.input_buffer),
                Style::default()
                    .fg(self.theme.accent)
                    .add_modifier(Modifier::BOLD),
            )),
            Line::from(""),
            Line::from(Span::styled(
                "Press Enter to confirm, Esc to cancel",
                Style::default().fg(self.theme.dim),
            )),
        ];
        frame.render_widget(Paragraph::new(text).wrap(Wrap { trim: false }), inner);
    }

    fn render_search(&mut self, frame: &mut Frame) {
        let inner = self.dialog(frame, " Search History ", 70, self.theme.accent);
        let constraints = if self.conversation_turns.is_empty() {
            vec![Constraint::Length(2), Constraint::Min(0)]
        } else {
            vec![
                Constraint::Length(2),
                Constraint::Percentage(40),
                Constraint::Min(0),
            ]
        };
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints(constraints)
            .split(inner);
        let input = Paragraph::new(Line::from(Span::styled(
            format!("/ {}_", self.input_buffer),
            Style::default()
                .fg(self.theme.accent)
                .add_modifier(Modifier::BOLD),
        )));
        frame.render_widget(input, chunks[0]);

        let items: Vec<ListItem> = self
            .search_results
            .iter()
            .map(|hit| {
                let target = match (&hit.instance_id, hit.tab_index) {
                    (Some(id), Some(tab)) => format!("{} tab {}", self.instance_name(id), tab),
                    (Some(id), None) => self.instance_name(id),
                    _ => "no session".to_string(),
                };
                ListItem::new(vec![
                    Line::from(vec![
                        Span::styled(
                            format!("{} ", hit.entry.timestamp.format("%Y-%m-%d %H:%M")),
                            Style::default().fg(self.theme.dim),
                        ),
                        Span::styled(
                            hit.entry.agent.profile().display_name,
                            Style::default().fg(self.theme.accent),
                        ),
                        Span::styled(format!(" → {target}"), Style::default().fg(self.theme.dim)),
                    ]),
                    Line::from(Span::styled(
                        format!("  {}", hit.excerpt),
                        Style::default().fg(self.theme.fg),
                    )),
                ])
            })
            .collect();
        let list = List::new(items)
            .highlight_style(Style::default().bg(Color::Rgb(50, 50, 50)))
            .highlight_symbol("▶ ");
        frame.render_stateful_widget(list, chunks[1], &mut self.search_state);

        if let Some(area) = chunks.get(2) {
            self.render_turns(frame, *area);
        }
    }

    fn render_turns(&self, frame: &mut Frame, area: Rect) {
        let mut lines = Vec::new();
        for turn in &self.conversation_turns {
            let (label, color) = match turn.role {
                Role::User => ("User", self.theme.accent),
                Role::Assistant => ("Assistant", self.theme.success),
                Role::System => ("System", self.theme.dim),
            };
            lines.push(Line::from(Span::styled(
                label,
                Style::default().fg(color).add_modifier(Modifier::BOLD),
            )));
            for text in turn.content.lines() {
                lines.push(Line::from(Span::styled(
                    format!("  {text}"),
                    Style::default().fg(self.theme.fg),
                )));
            }
            lines.push(Line::default());
        }
        let turns = Paragraph::new(lines)
            .block(
                Block::default()
                    .borders(Borders::TOP)
                    .border_style(Style::default().fg(self.theme.dim))
                    .title(" Conversation "),
            )
            .wrap(Wrap { trim: false });
        frame.render_widget(turns, area);
    }

    fn instance_name(&self, id: &str) -> String {
        self.snapshot
            .instance(id)
            .map_or_else(|| id.to_string(), |i| i.record.name.clone())
    }

    fn render_resume(&mut self, frame: &mut Frame) {
        let inner = self.dialog(frame, " Resume Conversation ", 60, self.theme.accent);
        let items: Vec<ListItem> = self
            .conversations
            .iter()
            .map(|c| {
                ListItem::new(vec![
                    Line::from(vec![
                        Span::styled(
                            format!("{} ", c.updated_at.format("%Y-%m-%d %H:%M")),
                            Style::default().fg(self.theme.dim),
                        ),
                        Span::styled(
                            format!("{} messages", c.message_count),
                            Style::default().fg(self.theme.dim),
                        ),
                    ]),
                    Line::from(Span::styled(
                        format!("  {}", c.first_prompt),
                        Style::default().fg(self.theme.fg),
                    )),
                ])
            })
            .collect();
        let list = List::new(items)
            .highlight_style(Style::default().bg(Color::Rgb(50, 50, 50)))
            .highlight_symbol("▶ ");
        frame.render_stateful_widget(list, inner, &mut self.conversation_state);
    }
}

/// Recorded tabs and extra windows, in index order
fn tab_indices(inst: &InstanceView) -> Vec<u32> {
    let mut tabs: Vec<u32> = inst
        .record
        .windows
        .iter()
        .filter(|w| !w.dead)
        .map(|w| w.index)
        .chain(inst.extra_windows.iter().map(|w| w.index))
        .collect();
    tabs.sort_unstable();
    tabs
}

fn select_step(state: &mut ListState, len: usize, step: isize) {
    if len == 0 {
        state.select(None);
        return;
    }
    let i = match state.selected() {
        Some(i) => (i as isize + step).rem_euclid(len as isize) as usize,
        None => 0,
    };
    state.select(Some(i));
}

/// Helper function to create a centered rectangle
fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ProjectView;
    use crate::store::{InstanceRecord, Project, WindowRecord};
    use chrono::Utc;

    fn view(id: &str, status: Status) -> InstanceView {
        InstanceView {
            record: InstanceRecord {
                id: id.to_string(),
                name: format!("name-{id}"),
                session_name: format!("asmgr-{id}"),
                project_id: String::new(),
                group_id: None,
                path: PathBuf::from("/tmp"),
                agent: AgentKind::Claude,
                custom_command: None,
                auto_approve: false,
                resume_id: None,
                status,
                start_revision: None,
                notes: String::new(),
                color: None,
                background_color: None,
                created_at: Utc::now(),
                windows: vec![WindowRecord {
                    index: 0,
                    name: "claude".into(),
                    agent: AgentKind::Claude,
                    custom_command: None,
                    auto_approve: false,
                    resume_id: None,
                    notes: String::new(),
                    dead: false,
                }],
            },
            activity: Activity::Idle,
            teaser: String::new(),
            active_window: 0,
            extra_windows: Vec::new(),
        }
    }

    fn app_with(instances: Vec<InstanceView>) -> App {
        let mut app = App::new(PathBuf::from("/work"));
        let selected = instances.first().map(|i| i.id().to_string());
        app.handle_action(Action::SnapshotUpdated(Snapshot {
            instances,
            selected,
            ..Default::default()
        }))
        .unwrap();
        app.take_pending_actions();
        app
    }

    fn press(app: &mut App, code: KeyCode) -> bool {
        app.handle_action(Action::KeyPress(KeyEvent::new(code, KeyModifiers::NONE)))
            .unwrap()
    }

    fn type_text(app: &mut App, text: &str) {
        for c in text.chars() {
            press(app, KeyCode::Char(c));
        }
    }

    #[test]
    fn test_create_dialog_builds_request() {
        let mut app = app_with(Vec::new());
        press(&mut app, KeyCode::Char('n'));
        assert_eq!(app.input_mode, InputMode::Creating);
        type_text(&mut app, "api");
        press(&mut app, KeyCode::BackTab);
        press(&mut app, KeyCode::Enter);

        let actions = app.take_pending_actions();
        let [Action::Create(spec)] = actions.as_slice() else {
            panic!("expected a create request, got {actions:?}");
        };
        assert_eq!(spec.name, "api");
        assert_eq!(spec.path, PathBuf::from("/work"));
        assert_eq!(spec.agent, AgentKind::Claude.next());
        assert_eq!(app.input_mode, InputMode::Normal);
    }

    #[test]
    fn test_navigation_selects_in_controller() {
        let mut app = app_with(vec![view("a", Status::Running), view("b", Status::Stopped)]);
        press(&mut app, KeyCode::Char('j'));
        let actions = app.take_pending_actions();
        assert!(matches!(actions.as_slice(), [Action::Select(Some(id))] if id == "b"));
        press(&mut app, KeyCode::Char('j'));
        let actions = app.take_pending_actions();
        assert!(matches!(actions.as_slice(), [Action::Select(Some(id))] if id == "a"));
    }

    #[test]
    fn test_delete_requires_confirmation() {
        let mut app = app_with(vec![view("a", Status::Running)]);
        press(&mut app, KeyCode::Char('d'));
        assert!(app.take_pending_actions().is_empty());
        press(&mut app, KeyCode::Esc);
        assert!(app.take_pending_actions().is_empty());

        press(&mut app, KeyCode::Char('d'));
        press(&mut app, KeyCode::Char('y'));
        let actions = app.take_pending_actions();
        assert!(matches!(actions.as_slice(), [Action::Delete(id)] if id == "a"));
    }

    #[test]
    fn test_prompt_goes_to_active_tab() {
        let mut inst = view("a", Status::Running);
        inst.active_window = 2;
        let mut app = app_with(vec![inst]);
        press(&mut app, KeyCode::Char('p'));
        type_text(&mut app, "run tests");
        press(&mut app, KeyCode::Enter);
        let actions = app.take_pending_actions();
        assert!(matches!(
            actions.as_slice(),
            [Action::SendPrompt { index: 2, text, .. }] if text == "run tests"
        ));
    }

    #[test]
    fn test_snapshot_follows_controller_selection() {
        let mut app = app_with(vec![view("a", Status::Running), view("b", Status::Running)]);
        let mut snapshot = app.snapshot.clone();
        snapshot.selected = Some("b".into());
        app.handle_action(Action::SnapshotUpdated(snapshot)).unwrap();
        assert_eq!(app.list_state.selected(), Some(1));
        assert!(app.take_pending_actions().is_empty());
    }

    #[test]
    fn test_empty_group_name_ungroups() {
        let mut app = app_with(vec![view("a", Status::Stopped)]);
        press(&mut app, KeyCode::Char('g'));
        assert_eq!(app.input_mode, InputMode::Grouping);
        press(&mut app, KeyCode::Enter);
        let actions = app.take_pending_actions();
        assert!(matches!(actions.as_slice(), [Action::Group { name: None, .. }]));
    }

    #[test]
    fn test_import_resolves_project_by_name() {
        let mut app = app_with(Vec::new());
        app.snapshot.projects = vec![ProjectView {
            project: Project {
                id: "p-1234abcd".into(),
                name: "client".into(),
                created_at: Utc::now(),
            },
            session_count: 2,
        }];
        press(&mut app, KeyCode::Char('i'));
        type_text(&mut app, "client");
        press(&mut app, KeyCode::Enter);
        let actions = app.take_pending_actions();
        assert!(matches!(actions.as_slice(), [Action::ImportProject(id)] if id == "p-1234abcd"));

        press(&mut app, KeyCode::Char('i'));
        type_text(&mut app, "missing");
        press(&mut app, KeyCode::Enter);
        assert!(app.take_pending_actions().is_empty());
        assert!(app.message_is_error);
    }

    #[test]
    fn test_quit_keys() {
        let mut app = app_with(Vec::new());
        assert!(press(&mut app, KeyCode::Char('q')));
        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert!(app.handle_action(Action::KeyPress(ctrl_c)).unwrap());
    }
}
