//! Persistent, project-partitioned state.
//!
//! Layout under the root directory:
//! - `projects.json`: array of [`Project`]
//! - `active_project`: one line holding the active project id
//! - `sessions-<project>.json`: [`ProjectState`] per project
//! - `snapshots/<instance>`: revision recorded at Start
//!
//! Every write goes to a sibling temp file that is synced and renamed over
//! the target, so readers only ever see a complete file. A process-local
//! mutex is held across each read-modify-write.

mod model;

pub use model::{
    Group, InstanceRecord, Project, ProjectState, Status, WindowRecord, DEFAULT_PROJECT_ID,
};

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;

use crate::agents::AgentKind;
use crate::error::{Error, Result};

const PROJECTS_FILE: &str = "projects.json";
const ACTIVE_FILE: &str = "active_project";
const SNAPSHOT_DIR: &str = "snapshots";

/// Single writer for all persisted state
pub struct Store {
    root: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    projects: Vec<Project>,
    active: String,
    /// Last successfully read or written state per project
    cache: HashMap<String, ProjectState>,
}

impl Store {
    /// Open (or initialize) the store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let projects_path = root.join(PROJECTS_FILE);
        let mut projects: Vec<Project> = match fs::read_to_string(&projects_path) {
            Ok(content) if content.trim().is_empty() => Vec::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|e| Error::Parse {
                path: projects_path.clone(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        if !projects.iter().any(Project::is_default) {
            projects.insert(0, Project::default_project());
        }

        let active = match fs::read_to_string(root.join(ACTIVE_FILE)) {
            Ok(content) => content.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let active = if projects.iter().any(|p| p.id == active) {
            active
        } else {
            tracing::warn!(project = %active, "active project no longer exists, using default");
            DEFAULT_PROJECT_ID.to_string()
        };

        Ok(Self {
            root,
            inner: Mutex::new(Inner {
                projects,
                active,
                cache: HashMap::new(),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sessions_path(&self, project_id: &str) -> PathBuf {
        let stem = if project_id == DEFAULT_PROJECT_ID {
            "default"
        } else {
            project_id
        };
        self.root.join(format!("sessions-{stem}.json"))
    }

    fn snapshot_path(&self, instance_id: &str) -> PathBuf {
        self.root.join(SNAPSHOT_DIR).join(instance_id)
    }

    // ── Projects ────────────────────────────────────────────────────────────

    pub fn list_projects(&self) -> Vec<Project> {
        self.lock().projects.clone()
    }

    pub fn create_project(&self, name: &str) -> Result<Project> {
        let name = non_empty_name(name)?;
        let mut inner = self.lock();
        let project = Project {
            id: format!("p-{}", short_id()),
            name,
            created_at: Utc::now(),
        };
        let mut next = inner.projects.clone();
        next.push(project.clone());
        write_json(&self.root.join(PROJECTS_FILE), &next)?;
        inner.projects = next;
        tracing::info!(project = %project.id, name = %project.name, "created project");
        Ok(project)
    }

    pub fn rename_project(&self, id: &str, name: &str) -> Result<()> {
        let name = non_empty_name(name)?;
        let mut inner = self.lock();
        let mut next = inner.projects.clone();
        let project = next
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::not_found("project", id))?;
        project.name = name;
        write_json(&self.root.join(PROJECTS_FILE), &next)?;
        inner.projects = next;
        Ok(())
    }

    /// Delete a project. Without `cascade` the project must own no
    /// instances. Returns the instances removed by a cascade so the caller
    /// can tear down their sessions.
    pub fn delete_project(&self, id: &str, cascade: bool) -> Result<Vec<InstanceRecord>> {
        if id == DEFAULT_PROJECT_ID {
            return Err(Error::InvariantViolation(
                "the default project cannot be deleted".into(),
            ));
        }
        let mut inner = self.lock();
        if !inner.projects.iter().any(|p| p.id == id) {
            return Err(Error::not_found("project", id));
        }
        let state = self.state_locked(&mut inner, id)?;
        if !state.instances.is_empty() && !cascade {
            return Err(Error::NotEmpty(id.to_string()));
        }

        let mut next = inner.projects.clone();
        next.retain(|p| p.id != id);
        write_json(&self.root.join(PROJECTS_FILE), &next)?;
        inner.projects = next;

        remove_if_exists(&self.sessions_path(id))?;
        for instance in &state.instances {
            remove_if_exists(&self.snapshot_path(&instance.id))?;
        }
        inner.cache.remove(id);
        if inner.active == id {
            write_atomic(&self.root.join(ACTIVE_FILE), b"\n")?;
            inner.active = DEFAULT_PROJECT_ID.to_string();
        }
        tracing::info!(project = %id, removed = state.instances.len(), "deleted project");
        Ok(state.instances)
    }

    pub fn set_active_project(&self, id: &str) -> Result<()> {
        let mut inner = self.lock();
        if !inner.projects.iter().any(|p| p.id == id) {
            return Err(Error::not_found("project", id));
        }
        write_atomic(&self.root.join(ACTIVE_FILE), format!("{id}\n").as_bytes())?;
        inner.active = id.to_string();
        Ok(())
    }

    pub fn active_project_id(&self) -> String {
        self.lock().active.clone()
    }

    pub fn project_session_count(&self, id: &str) -> Result<usize> {
        let mut inner = self.lock();
        if !inner.projects.iter().any(|p| p.id == id) {
            return Err(Error::not_found("project", id));
        }
        Ok(self.state_locked(&mut inner, id)?.instances.len())
    }

    // ── Instances & groups ──────────────────────────────────────────────────

    pub fn load_all(&self, project_id: &str) -> Result<(Vec<InstanceRecord>, Vec<Group>)> {
        let mut inner = self.lock();
        if !inner.projects.iter().any(|p| p.id == project_id) {
            return Err(Error::not_found("project", project_id));
        }
        let state = self.state_locked(&mut inner, project_id)?;
        Ok((state.instances, state.groups))
    }

    pub fn add_instance(&self, record: &InstanceRecord) -> Result<()> {
        record.check_windows().map_err(Error::InvariantViolation)?;
        self.mutate(&record.project_id, |state| {
            if state.instance(&record.id).is_some() {
                return Err(Error::InvariantViolation(format!(
                    "instance {} already exists",
                    record.id
                )));
            }
            state.instances.push(record.clone());
            sync_membership(state, &record.id, record.group_id.as_deref())
        })
    }

    pub fn update_instance(&self, record: &InstanceRecord) -> Result<()> {
        record.check_windows().map_err(Error::InvariantViolation)?;
        self.mutate(&record.project_id, |state| {
            let slot = state
                .instances
                .iter_mut()
                .find(|i| i.id == record.id)
                .ok_or_else(|| Error::not_found("instance", &record.id))?;
            *slot = record.clone();
            sync_membership(state, &record.id, record.group_id.as_deref())
        })
    }

    pub fn remove_instance(&self, id: &str) -> Result<InstanceRecord> {
        let project_id = self.project_of(id)?;
        let removed = self.mutate(&project_id, |state| {
            let pos = state
                .instances
                .iter()
                .position(|i| i.id == id)
                .ok_or_else(|| Error::not_found("instance", id))?;
            state.unassign(id);
            Ok(state.instances.remove(pos))
        })?;
        remove_if_exists(&self.snapshot_path(id))?;
        Ok(removed)
    }

    /// Move the listed instances to the front in the given order; unlisted
    /// instances keep their relative order behind them.
    pub fn reorder_instances(&self, project_id: &str, ids: &[String]) -> Result<()> {
        self.mutate(project_id, |state| {
            let mut remaining = std::mem::take(&mut state.instances);
            let mut ordered = Vec::with_capacity(remaining.len());
            for id in ids {
                let pos = remaining
                    .iter()
                    .position(|i| &i.id == id)
                    .ok_or_else(|| Error::not_found("instance", id))?;
                ordered.push(remaining.remove(pos));
            }
            ordered.extend(remaining);
            state.instances = ordered;
            Ok(())
        })
    }

    pub fn create_group(&self, project_id: &str, name: &str) -> Result<Group> {
        let name = non_empty_name(name)?;
        let group = Group {
            id: format!("g-{}", short_id()),
            name,
            project_id: project_id.to_string(),
            members: Vec::new(),
        };
        self.mutate(project_id, |state| {
            state.groups.push(group.clone());
            Ok(())
        })?;
        Ok(group)
    }

    pub fn rename_group(&self, project_id: &str, group_id: &str, name: &str) -> Result<()> {
        let name = non_empty_name(name)?;
        self.mutate(project_id, |state| {
            state
                .group_mut(group_id)
                .ok_or_else(|| Error::not_found("group", group_id))?
                .name = name;
            Ok(())
        })
    }

    /// Delete a group; its members become ungrouped
    pub fn delete_group(&self, project_id: &str, group_id: &str) -> Result<()> {
        self.mutate(project_id, |state| {
            let pos = state
                .groups
                .iter()
                .position(|g| g.id == group_id)
                .ok_or_else(|| Error::not_found("group", group_id))?;
            state.groups.remove(pos);
            for instance in &mut state.instances {
                if instance.group_id.as_deref() == Some(group_id) {
                    instance.group_id = None;
                }
            }
            Ok(())
        })
    }

    pub fn assign_to_group(&self, instance_id: &str, group_id: Option<&str>) -> Result<()> {
        let project_id = self.project_of(instance_id)?;
        self.mutate(&project_id, |state| {
            let instance = state
                .instances
                .iter_mut()
                .find(|i| i.id == instance_id)
                .ok_or_else(|| Error::not_found("instance", instance_id))?;
            instance.group_id = group_id.map(str::to_string);
            sync_membership(state, instance_id, group_id)
        })
    }

    /// Move every instance and group of `from` into `into`
    pub fn import(&self, from: &str, into: &str) -> Result<usize> {
        if from == into {
            return Err(Error::InvariantViolation(
                "cannot import a project into itself".into(),
            ));
        }
        let mut inner = self.lock();
        for id in [from, into] {
            if !inner.projects.iter().any(|p| p.id == id) {
                return Err(Error::not_found("project", id));
            }
        }
        let source = self.state_locked(&mut inner, from)?;
        let target = self.state_locked(&mut inner, into)?;

        let mut merged = target.clone();
        for mut instance in source.instances.iter().cloned() {
            instance.project_id = into.to_string();
            merged.instances.push(instance);
        }
        for mut group in source.groups.iter().cloned() {
            group.project_id = into.to_string();
            merged.groups.push(group);
        }
        let moved = source.instances.len();

        write_json(&self.sessions_path(into), &merged)?;
        if let Err(e) = write_json(&self.sessions_path(from), &ProjectState::default()) {
            // Keep instances in exactly one project.
            write_json(&self.sessions_path(into), &target)?;
            return Err(e);
        }
        inner.cache.insert(into.to_string(), merged);
        inner.cache.insert(from.to_string(), ProjectState::default());
        tracing::info!(from = %from, into = %into, moved, "imported project");
        Ok(moved)
    }

    // ── Snapshots ───────────────────────────────────────────────────────────

    pub fn write_snapshot(&self, instance_id: &str, revision: &str) -> Result<()> {
        let _guard = self.lock();
        fs::create_dir_all(self.root.join(SNAPSHOT_DIR))?;
        write_atomic(
            &self.snapshot_path(instance_id),
            format!("{revision}\n").as_bytes(),
        )
    }

    pub fn read_snapshot(&self, instance_id: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.snapshot_path(instance_id)) {
            Ok(content) => {
                let revision = content.trim();
                Ok((!revision.is_empty()).then(|| revision.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn project_of(&self, instance_id: &str) -> Result<String> {
        let mut inner = self.lock();
        let ids: Vec<String> = inner.projects.iter().map(|p| p.id.clone()).collect();
        for project_id in ids {
            if self
                .state_locked(&mut inner, &project_id)?
                .instance(instance_id)
                .is_some()
            {
                return Ok(project_id);
            }
        }
        Err(Error::not_found("instance", instance_id))
    }

    fn state_locked(&self, inner: &mut Inner, project_id: &str) -> Result<ProjectState> {
        if let Some(state) = inner.cache.get(project_id) {
            return Ok(state.clone());
        }
        let state = read_project_file(&self.sessions_path(project_id))?;
        inner.cache.insert(project_id.to_string(), state.clone());
        Ok(state)
    }

    /// Read-modify-write one project file. The cached state only changes
    /// once the new file is in place.
    fn mutate<T>(
        &self,
        project_id: &str,
        f: impl FnOnce(&mut ProjectState) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.lock();
        if !inner.projects.iter().any(|p| p.id == project_id) {
            return Err(Error::not_found("project", project_id));
        }
        let mut next = self.state_locked(&mut inner, project_id)?;
        let out = f(&mut next)?;
        write_json(&self.sessions_path(project_id), &next)?;
        inner.cache.insert(project_id.to_string(), next);
        Ok(out)
    }
}

fn read_project_file(path: &Path) -> Result<ProjectState> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ProjectState::default()),
        Err(e) => return Err(e.into()),
    };
    if content.trim().is_empty() {
        return Ok(ProjectState::default());
    }
    let parse_error = |e: serde_json::Error| Error::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let value: serde_json::Value = serde_json::from_str(&content).map_err(parse_error)?;
    check_agent_kinds(path, &value)?;
    serde_json::from_value(value).map_err(parse_error)
}

/// Unknown agent kinds are a configuration problem, not corruption
fn check_agent_kinds(path: &Path, value: &serde_json::Value) -> Result<()> {
    let instances = value
        .get("instances")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten();
    for instance in instances {
        let windows = instance
            .get("windows")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten();
        let kinds = std::iter::once(instance).chain(windows).filter_map(|v| v.get("agent"));
        for kind in kinds {
            let Some(kind) = kind.as_str() else { continue };
            if kind.parse::<AgentKind>().is_err() {
                return Err(Error::Config(format!(
                    "unknown agent kind '{kind}' in {}",
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

fn sync_membership(state: &mut ProjectState, instance_id: &str, group_id: Option<&str>) -> Result<()> {
    match group_id {
        Some(group_id) => {
            let already = state
                .groups
                .iter()
                .any(|g| g.id == group_id && g.members.iter().any(|m| m == instance_id));
            if already {
                return Ok(());
            }
            if state.groups.iter().all(|g| g.id != group_id) {
                return Err(Error::not_found("group", group_id));
            }
            state.unassign(instance_id);
            if let Some(group) = state.group_mut(group_id) {
                group.members.push(instance_id.to_string());
            }
        }
        None => state.unassign(instance_id),
    }
    Ok(())
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|e| Error::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

/// Write-to-temp-then-rename
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = temp_path(path);
    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    sync_parent(path)?;
    Ok(())
}

/// Flush the directory entry so the rename itself survives a power loss
#[cfg(unix)]
fn sync_parent(path: &Path) -> std::io::Result<()> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => File::open(dir)?.sync_all(),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn non_empty_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::InvariantViolation("name must not be empty".into()));
    }
    Ok(name.to_string())
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use tempfile::TempDir;

    fn record(id: &str, project_id: &str) -> InstanceRecord {
        InstanceRecord {
            id: id.into(),
            name: format!("session {id}"),
            project_id: project_id.into(),
            group_id: None,
            path: PathBuf::from("/tmp/demo-repo"),
            agent: AgentKind::Claude,
            custom_command: None,
            auto_approve: false,
            resume_id: None,
            status: Status::Stopped,
            session_name: format!("asmgr-{id}"),
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
    fn test_fresh_store_has_default_project() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let projects = store.list_projects();
        assert_eq!(projects.len(), 1);
        assert!(projects[0].is_default());
        assert_eq!(store.active_project_id(), "");
    }

    #[test]
    fn test_mutations_round_trip_through_disk() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let mut rec = record("a", "");
        store.add_instance(&rec).unwrap();
        rec.status = Status::Running;
        rec.notes = "working on auth".into();
        store.update_instance(&rec).unwrap();
        let group = store.create_group("", "backend").unwrap();
        store.assign_to_group("a", Some(&group.id)).unwrap();

        let before = fs::read(dir.path().join("sessions-default.json")).unwrap();
        let (instances, groups) = store.load_all("").unwrap();

        let reopened = Store::open(dir.path()).unwrap();
        let (instances2, groups2) = reopened.load_all("").unwrap();
        assert_eq!(instances, instances2);
        assert_eq!(groups, groups2);
        assert_eq!(groups2[0].members, vec!["a".to_string()]);
        assert_eq!(instances2[0].group_id.as_deref(), Some(group.id.as_str()));

        // Rewriting the same state reproduces the same bytes.
        reopened.update_instance(&instances2[0]).unwrap();
        let after = fs::read(dir.path().join("sessions-default.json")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_session_counts_match_per_project() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let work = store.create_project("work").unwrap();
        store.add_instance(&record("a", "")).unwrap();
        store.add_instance(&record("b", &work.id)).unwrap();
        store.add_instance(&record("c", &work.id)).unwrap();

        for project in store.list_projects() {
            let (instances, _) = store.load_all(&project.id).unwrap();
            let owned = instances.iter().filter(|i| i.project_id == project.id).count();
            assert_eq!(owned, store.project_session_count(&project.id).unwrap());
        }
        assert_eq!(store.project_session_count(&work.id).unwrap(), 2);
    }

    #[test]
    fn test_delete_project_requires_cascade_when_not_empty() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let work = store.create_project("work").unwrap();
        store.add_instance(&record("a", &work.id)).unwrap();
        store.write_snapshot("a", "abc123").unwrap();
        store.set_active_project(&work.id).unwrap();

        assert!(matches!(
            store.delete_project(&work.id, false),
            Err(Error::NotEmpty(_))
        ));
        let removed = store.delete_project(&work.id, true).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(store.read_snapshot("a").unwrap(), None);
        assert_eq!(store.active_project_id(), "");
        assert_eq!(store.list_projects().len(), 1);
        assert!(matches!(
            store.delete_project("", true),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_interrupted_write_leaves_last_commit() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.add_instance(&record("a", "")).unwrap();

        // A crash between writing the temp file and renaming it.
        let target = dir.path().join("sessions-default.json");
        fs::write(temp_path(&target), br#"{"instances":[{"id":"b","na"#).unwrap();

        let reopened = Store::open(dir.path()).unwrap();
        let (instances, _) = reopened.load_all("").unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, "a");

        // The next write replaces the stale temp file.
        reopened.add_instance(&record("b", "")).unwrap();
        assert!(!temp_path(&target).exists());
        assert_eq!(reopened.load_all("").unwrap().0.len(), 2);
    }

    #[test]
    fn test_atomic_write_replaces_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("projects.json");
        write_atomic(&path, b"[1]").unwrap();
        write_atomic(&path, b"[2]").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "[2]");
        assert!(!temp_path(&path).exists());
        sync_parent(&path).unwrap();
    }

    #[test]
    fn test_corrupt_and_unknown_agent_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("sessions-default.json"), "{ broken").unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(matches!(store.load_all(""), Err(Error::Parse { .. })));

        let mut value = serde_json::to_value(ProjectState {
            instances: vec![record("a", "")],
            groups: vec![],
        })
        .unwrap();
        value["instances"][0]["agent"] = serde_json::json!("cobol-bot");
        fs::write(
            dir.path().join("sessions-default.json"),
            serde_json::to_string(&value).unwrap(),
        )
        .unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(matches!(store.load_all(""), Err(Error::Config(_))));
    }

    #[test]
    fn test_failed_write_keeps_memory_state() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.add_instance(&record("a", "")).unwrap();

        // Block the rename target by turning it into a directory.
        let target = dir.path().join("sessions-default.json");
        fs::remove_file(&target).unwrap();
        fs::create_dir(&target).unwrap();

        assert!(store.add_instance(&record("b", "")).is_err());
        let (instances, _) = store.load_all("").unwrap();
        assert_eq!(instances.len(), 1);
    }

    #[test]
    fn test_group_membership_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.add_instance(&record("a", "")).unwrap();
        let g1 = store.create_group("", "one").unwrap();
        let g2 = store.create_group("", "two").unwrap();

        store.assign_to_group("a", Some(&g1.id)).unwrap();
        store.assign_to_group("a", Some(&g2.id)).unwrap();
        let (_, groups) = store.load_all("").unwrap();
        assert!(groups[0].members.is_empty());
        assert_eq!(groups[1].members, vec!["a".to_string()]);

        store.delete_group("", &g2.id).unwrap();
        let (instances, groups) = store.load_all("").unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(instances[0].group_id, None);
        assert!(store.assign_to_group("a", Some("g-missing")).is_err());
    }

    #[test]
    fn test_reorder_and_remove() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        for id in ["a", "b", "c"] {
            store.add_instance(&record(id, "")).unwrap();
        }
        store.reorder_instances("", &["c".to_string(), "a".to_string()]).unwrap();
        let ids: Vec<_> = store.load_all("").unwrap().0.into_iter().map(|i| i.id).collect();
        assert_eq!(ids, ["c", "a", "b"]);

        store.write_snapshot("a", "deadbeef").unwrap();
        assert_eq!(store.read_snapshot("a").unwrap().as_deref(), Some("deadbeef"));
        store.remove_instance("a").unwrap();
        assert_eq!(store.read_snapshot("a").unwrap(), None);
        assert!(matches!(
            store.remove_instance("a"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_import_moves_instances() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let work = store.create_project("work").unwrap();
        store.add_instance(&record("a", &work.id)).unwrap();
        store.create_group(&work.id, "api").unwrap();

        assert_eq!(store.import(&work.id, "").unwrap(), 1);
        let (instances, groups) = store.load_all("").unwrap();
        assert_eq!(instances[0].project_id, "");
        assert_eq!(groups[0].project_id, "");
        assert_eq!(store.project_session_count(&work.id).unwrap(), 0);
        store.delete_project(&work.id, false).unwrap();
    }

    #[test]
    fn test_project_manifest_persists() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let work = store.create_project("  work ").unwrap();
        store.rename_project(&work.id, "client work").unwrap();
        store.set_active_project(&work.id).unwrap();
        assert!(store.create_project("   ").is_err());

        let reopened = Store::open(dir.path()).unwrap();
        let projects = reopened.list_projects();
        assert_eq!(projects[1].name, "client work");
        assert_eq!(reopened.active_project_id(), work.id);
    }
}
