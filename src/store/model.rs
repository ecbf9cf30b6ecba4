use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::AgentKind;

/// Id of the project every installation starts with
pub const DEFAULT_PROJECT_ID: &str = "";

/// A named bucket of sessions and groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn default_project() -> Self {
        Self {
            id: DEFAULT_PROJECT_ID.to_string(),
            name: "Default".to_string(),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn is_default(&self) -> bool {
        self.id == DEFAULT_PROJECT_ID
    }
}

/// A named, ordered cluster of instances within one project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    pub project_id: String,
    #[serde(default)]
    pub members: Vec<String>,
}

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Stopped,
    Running,
}

/// One multiplexer window (tab) of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowRecord {
    pub index: u32,
    pub name: String,
    pub agent: AgentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_command: Option<String>,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
    #[serde(default)]
    pub notes: String,
    /// The process exited but the tab is kept
    #[serde(default)]
    pub dead: bool,
}

/// The persisted session entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub path: PathBuf,
    pub agent: AgentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_command: Option<String>,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
    #[serde(default)]
    pub status: Status,
    pub session_name: String,
    /// VCS revision recorded when the instance was last started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_revision: Option<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub windows: Vec<WindowRecord>,
}

impl InstanceRecord {
    pub fn window(&self, index: u32) -> Option<&WindowRecord> {
        self.windows.iter().find(|w| w.index == index)
    }

    pub fn window_mut(&mut self, index: u32) -> Option<&mut WindowRecord> {
        self.windows.iter_mut().find(|w| w.index == index)
    }

    pub fn is_running(&self) -> bool {
        self.status == Status::Running
    }

    /// Check the window invariants: a primary window at index 0 carrying
    /// the instance's agent, and unique indices.
    pub fn check_windows(&self) -> Result<(), String> {
        match self.window(0) {
            Some(primary) if primary.agent == self.agent => {}
            Some(_) => return Err(format!("primary window of {} has the wrong agent", self.id)),
            None => return Err(format!("instance {} has no primary window", self.id)),
        }
        let mut seen = std::collections::HashSet::new();
        for window in &self.windows {
            if !seen.insert(window.index) {
                return Err(format!(
                    "instance {} has duplicate window index {}",
                    self.id, window.index
                ));
            }
        }
        Ok(())
    }
}

/// Contents of one `sessions-<project>.json` file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectState {
    #[serde(default)]
    pub instances: Vec<InstanceRecord>,
    #[serde(default)]
    pub groups: Vec<Group>,
}

impl ProjectState {
    pub fn instance(&self, id: &str) -> Option<&InstanceRecord> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn group_mut(&mut self, id: &str) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.id == id)
    }

    /// Drop `instance_id` from every group's member list
    pub fn unassign(&mut self, instance_id: &str) {
        for group in &mut self.groups {
            group.members.retain(|m| m != instance_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> InstanceRecord {
        InstanceRecord {
            id: "i1".into(),
            name: "demo".into(),
            project_id: String::new(),
            group_id: None,
            path: PathBuf::from("/tmp/demo"),
            agent: AgentKind::Claude,
            custom_command: None,
            auto_approve: false,
            resume_id: None,
            status: Status::Stopped,
            session_name: "asmgr-i1".into(),
            start_revision: None,
            notes: String::new(),
            color: None,
            background_color: None,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
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
        }
    }

    #[test]
    fn test_window_invariants() {
        let mut rec = record();
        assert!(rec.check_windows().is_ok());

        let mut dup = rec.windows[0].clone();
        dup.agent = AgentKind::Terminal;
        rec.windows.push(dup);
        assert!(rec.check_windows().unwrap_err().contains("duplicate"));

        rec.windows.clear();
        assert!(rec.check_windows().is_err());
    }

    #[test]
    fn test_unknown_keys_are_tolerated() {
        let json = r#"{
            "id": "i1", "name": "demo", "path": "/tmp/demo", "agent": "claude",
            "sessionName": "asmgr-i1", "createdAt": "2024-01-01T00:00:00Z",
            "futureField": {"nested": true}
        }"#;
        let rec: InstanceRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.status, Status::Stopped);
        assert!(rec.windows.is_empty());
    }
}
