//! Task storage backends.
//!
//! The orchestration code only needs whole-record load and save. Saving is
//! treated as atomic; no optimistic concurrency control is applied.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::task::Task;

/// Persistent task store.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Loads a task, failing with [`Error::NotFound`] if it does not exist.
    async fn load_task(&self, task_id: &str) -> Result<Task>;

    /// Saves a whole task record, replacing any previous version.
    async fn save_task(&self, task: &Task) -> Result<()>;

    /// Loads every task.
    async fn load_all_tasks(&self) -> Result<Vec<Task>>;
}

/// In-memory backend.
#[derive(Default)]
pub struct MemoryBackend {
    tasks: RwLock<HashMap<String, Task>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend pre-populated with tasks.
    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let tasks = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self {
            tasks: RwLock::new(tasks),
        }
    }

    /// Returns a copy of a task without going through the async API.
    pub fn snapshot(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().get(task_id).cloned()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn load_task(&self, task_id: &str) -> Result<Task> {
        self.snapshot(task_id)
            .ok_or_else(|| Error::NotFound(task_id.to_string()))
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        self.tasks.write().insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn load_all_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }
}

/// Backend storing one YAML file per task in a directory.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Creates a backend rooted at `dir`. The directory is created on first save.
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn task_path(&self, task_id: &str) -> Result<PathBuf> {
        let valid = !task_id.is_empty()
            && task_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::Validation(format!("invalid task id: {:?}", task_id)));
        }
        Ok(self.dir.join(format!("{}.yaml", task_id)))
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn load_task(&self, task_id: &str) -> Result<Task> {
        let path = self.task_path(task_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(task_id.to_string()));
            }
            Err(e) => return Err(Error::Backend(format!("read {}: {}", path.display(), e))),
        };
        Ok(serde_yaml::from_str(&content)?)
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let path = self.task_path(&task.id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        // Write to a sibling file and rename so readers never see a partial record.
        let tmp = path.with_extension("yaml.tmp");
        let content = serde_yaml::to_string(task)?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load_all_tasks(&self) -> Result<Vec<Task>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut tasks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_yaml::from_str::<Task>(&content) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "skipping unreadable task file");
                }
            }
        }
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use tempfile::TempDir;

    #[tokio::test]
    async fn memory_backend_round_trip() {
        let backend = MemoryBackend::new();
        let task = Task::new("TASK-001", "orc/TASK-001").with_status(TaskStatus::Completed);

        backend.save_task(&task).await.unwrap();

        let loaded = backend.load_task("TASK-001").await.unwrap();
        assert_eq!(loaded, task);
        assert!(matches!(
            backend.load_task("TASK-404").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn file_backend_persists_yaml() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path().join("tasks"));

        let task = Task::new("TASK-001", "orc/TASK-001").with_title("Fix auth");
        backend.save_task(&task).await.unwrap();

        let on_disk = std::fs::read_to_string(dir.path().join("tasks/TASK-001.yaml")).unwrap();
        assert!(on_disk.contains("Fix auth"));

        let loaded = backend.load_task("TASK-001").await.unwrap();
        assert_eq!(loaded.title, "Fix auth");
    }

    #[tokio::test]
    async fn file_backend_lists_tasks_sorted() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path().to_path_buf());

        backend.save_task(&Task::new("TASK-002", "b")).await.unwrap();
        backend.save_task(&Task::new("TASK-001", "a")).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let tasks = backend.load_all_tasks().await.unwrap();
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["TASK-001", "TASK-002"]);
    }

    #[tokio::test]
    async fn file_backend_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path().join("absent"));

        assert!(backend.load_all_tasks().await.unwrap().is_empty());
        assert!(matches!(
            backend.load_task("TASK-001").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn file_backend_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path().to_path_buf());

        let err = backend.load_task("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
