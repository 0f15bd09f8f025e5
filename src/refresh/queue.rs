//! Persisted, priority-ordered backlog of entries to re-fetch

use crate::cache::atomic::atomic_write_json;
use crate::cache::types::normalize_key;
use crate::config::RefreshConfig;
use crate::error::Result;
use crate::staleness::{LibraryType, Recommendation, StalenessPolicyManager};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

pub const QUEUE_VERSION: u32 = 1;
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;

/// Priority for entries more than a week past their limit
pub const PRIORITY_VERY_STALE: u8 = 9;
/// Priority for stale entries
pub const PRIORITY_STALE: u8 = 7;
/// Priority for entries approaching their limit
pub const PRIORITY_CONSIDER: u8 = 3;

const VERY_STALE_DAYS: i64 = 7;

/// One backlog item.
///
/// A `None` topic means every cached topic of the library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTask {
    pub library: String,
    pub topic: Option<String>,
    pub priority: u8,
    pub reason: String,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default, rename = "error")]
    pub last_error: Option<String>,
}

impl RefreshTask {
    /// Not scheduled for a later time
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.map_or(true, |at| at <= now)
    }

    fn matches(&self, library: &str, topic: Option<&str>) -> bool {
        self.library == library && self.topic.as_deref() == topic
    }
}

/// Input to [`RefreshQueue::queue_stale_entries`]
#[derive(Debug, Clone, PartialEq)]
pub struct StaleCandidate {
    pub library: String,
    pub topic: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// Queue snapshot counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    /// Tasks that can run now
    pub eligible: usize,
    /// Tasks waiting on a retry backoff or a future schedule
    pub scheduled: usize,
    /// Priority 8 and above
    pub urgent: usize,
    /// Tasks with at least one failed attempt
    pub retrying: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueFile {
    version: u32,
    last_updated: DateTime<Utc>,
    #[serde(default)]
    tasks: Vec<RefreshTask>,
}

#[derive(Debug)]
pub struct RefreshQueue {
    path: PathBuf,
    config: RefreshConfig,
    tasks: Mutex<Vec<RefreshTask>>,
}

impl RefreshQueue {
    /// Load the queue persisted at `path`.
    ///
    /// A missing file is an empty queue. An unreadable one is logged and
    /// replaced on the next write.
    pub fn open(path: impl Into<PathBuf>, config: RefreshConfig) -> Self {
        let path = path.into();
        let tasks = load_tasks(&path);
        if !tasks.is_empty() {
            info!("Loaded {} refresh tasks from {}", tasks.len(), path.display());
        }

        Self {
            path,
            config,
            tasks: Mutex::new(tasks),
        }
    }

    /// Add a task, or raise the priority of the existing task for the
    /// same (library, topic)
    pub fn add_task(
        &self,
        library: &str,
        topic: Option<&str>,
        priority: u8,
        reason: &str,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<RefreshTask> {
        let mut tasks = self.lock();
        let mut next = tasks.clone();
        let task = upsert(&mut next, library, topic, priority, reason, scheduled_for);
        self.save(&next)?;
        *tasks = next;
        Ok(task)
    }

    /// Highest-priority eligible task (oldest first among equals), left
    /// in the queue. `max_priority` restricts the choice to tasks at or
    /// below that priority.
    pub fn get_next_task(&self, max_priority: Option<u8>) -> Option<RefreshTask> {
        let now = Utc::now();
        let cap = max_priority.unwrap_or(MAX_PRIORITY);

        self.lock()
            .iter()
            .filter(|t| t.is_eligible(now) && t.priority <= cap)
            .min_by(|a, b| b.priority.cmp(&a.priority).then(a.added_at.cmp(&b.added_at)))
            .cloned()
    }

    /// Record the outcome of a refresh attempt.
    ///
    /// Success removes the task. Failure bumps `attempts`, records the
    /// error and reschedules with backoff; a task out of attempts is
    /// dropped. Returns whether the task was found.
    pub fn mark_task_completed(
        &self,
        library: &str,
        topic: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool> {
        let library = normalize_key(library);
        let topic = normalize_topic(topic);
        let mut guard = self.lock();

        let Some(pos) = guard.iter().position(|t| t.matches(&library, topic.as_deref())) else {
            return Ok(false);
        };
        let mut tasks = guard.clone();

        match error {
            None => {
                let task = tasks.remove(pos);
                debug!("Refresh completed: {}/{}", task.library, topic_label(&task.topic));
            }
            Some(message) => {
                let now = Utc::now();
                let task = &mut tasks[pos];
                task.attempts += 1;
                task.last_attempt = Some(now);
                task.last_error = Some(message.to_string());

                if task.attempts >= self.config.max_attempts {
                    error!(
                        "Dropping refresh of {}/{} after {} attempts: {}",
                        task.library,
                        topic_label(&task.topic),
                        task.attempts,
                        message
                    );
                    tasks.remove(pos);
                } else {
                    let delay = self.config.retry_delay(task.attempts);
                    task.scheduled_for = chrono::Duration::from_std(delay)
                        .ok()
                        .map(|d| now + d);
                    warn!(
                        "Refresh of {}/{} failed (attempt {}), retrying in {:?}: {}",
                        task.library,
                        topic_label(&task.topic),
                        task.attempts,
                        delay,
                        message
                    );
                }
            }
        }

        self.save(&tasks)?;
        *guard = tasks;
        Ok(true)
    }

    /// Queue every candidate the policy flags, prioritised by how far past
    /// its limit it is. Returns the number of tasks added or raised.
    pub fn queue_stale_entries(
        &self,
        entries: &[StaleCandidate],
        policy: &StalenessPolicyManager,
        library_types: Option<&HashMap<String, LibraryType>>,
        reference: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let reference = reference.unwrap_or_else(Utc::now);
        let mut guard = self.lock();
        let mut tasks = guard.clone();
        let mut queued = 0;

        for entry in entries {
            let declared = library_types.and_then(|m| m.get(&normalize_key(&entry.library)).copied());
            let rec = policy.evaluate(&entry.library, entry.last_updated, declared, Some(reference));

            let (priority, reason) = match rec.recommendation {
                Recommendation::Refresh if -rec.days_until_stale > VERY_STALE_DAYS => (
                    PRIORITY_VERY_STALE,
                    format!("{} days past the {}-day limit", -rec.days_until_stale, rec.policy.max_age_days),
                ),
                Recommendation::Refresh => (
                    PRIORITY_STALE,
                    format!("stale ({}-day limit)", rec.policy.max_age_days),
                ),
                Recommendation::ConsiderRefresh => (
                    PRIORITY_CONSIDER,
                    format!("stale in {} days", rec.days_until_stale),
                ),
                Recommendation::Keep => continue,
            };

            upsert(&mut tasks, &entry.library, entry.topic.as_deref(), priority, &reason, None);
            queued += 1;
        }

        if queued > 0 {
            self.save(&tasks)?;
            *guard = tasks;
            info!("Queued {} entries for refresh", queued);
        }
        Ok(queued)
    }

    pub fn remove_task(&self, library: &str, topic: Option<&str>) -> Result<bool> {
        let library = normalize_key(library);
        let topic = normalize_topic(topic);
        let mut tasks = self.lock();

        let mut next = tasks.clone();
        next.retain(|t| !t.matches(&library, topic.as_deref()));
        if next.len() == tasks.len() {
            return Ok(false);
        }
        self.save(&next)?;
        *tasks = next;
        Ok(true)
    }

    pub fn clear(&self) -> Result<()> {
        let mut tasks = self.lock();
        self.save(&[])?;
        tasks.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of every task
    pub fn tasks(&self) -> Vec<RefreshTask> {
        self.lock().clone()
    }

    pub fn stats(&self) -> QueueStats {
        let now = Utc::now();
        let tasks = self.lock();
        let eligible = tasks.iter().filter(|t| t.is_eligible(now)).count();

        QueueStats {
            total: tasks.len(),
            eligible,
            scheduled: tasks.len() - eligible,
            urgent: tasks.iter().filter(|t| t.priority >= 8).count(),
            retrying: tasks.iter().filter(|t| t.attempts > 0).count(),
        }
    }

    fn save(&self, tasks: &[RefreshTask]) -> Result<()> {
        let file = QueueFile {
            version: QUEUE_VERSION,
            last_updated: Utc::now(),
            tasks: tasks.to_vec(),
        };
        atomic_write_json(&self.path, &file)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RefreshTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn upsert(
    tasks: &mut Vec<RefreshTask>,
    library: &str,
    topic: Option<&str>,
    priority: u8,
    reason: &str,
    scheduled_for: Option<DateTime<Utc>>,
) -> RefreshTask {
    let library = normalize_key(library);
    let topic = normalize_topic(topic);
    let priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);

    if let Some(existing) = tasks.iter_mut().find(|t| t.matches(&library, topic.as_deref())) {
        if priority > existing.priority {
            existing.priority = priority;
            existing.reason = reason.to_string();
        }
        return existing.clone();
    }

    let task = RefreshTask {
        library,
        topic,
        priority,
        reason: reason.to_string(),
        added_at: Utc::now(),
        scheduled_for,
        attempts: 0,
        last_attempt: None,
        last_error: None,
    };
    tasks.push(task.clone());
    task
}

fn normalize_topic(topic: Option<&str>) -> Option<String> {
    topic.map(normalize_key).filter(|t| !t.is_empty())
}

fn topic_label(topic: &Option<String>) -> &str {
    topic.as_deref().unwrap_or("*")
}

fn load_tasks(path: &Path) -> Vec<RefreshTask> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("Failed to read refresh queue {}: {}", path.display(), e);
            return Vec::new();
        }
    };

    match serde_json::from_str::<QueueFile>(&content) {
        Ok(file) => file.tasks,
        Err(e) => {
            warn!("Ignoring unreadable refresh queue {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn queue(tmp: &TempDir) -> RefreshQueue {
        let config = RefreshConfig {
            retry_jitter: 0.0,
            max_attempts: 3,
            ..Default::default()
        };
        RefreshQueue::open(tmp.path().join("refresh_queue.json"), config)
    }

    #[test]
    fn test_add_task_raises_priority_instead_of_duplicating() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp);

        q.add_task("lib", Some("topic"), 5, "first", None).unwrap();
        q.add_task("LIB", Some("Topic"), 8, "second", None).unwrap();
        q.add_task("lib", Some("topic"), 2, "third", None).unwrap();

        let tasks = q.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].priority, 8);
        assert_eq!(tasks[0].reason, "second");
    }

    #[test]
    fn test_priority_is_clamped() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp);
        assert_eq!(q.add_task("a", None, 0, "", None).unwrap().priority, 1);
        assert_eq!(q.add_task("b", None, 42, "", None).unwrap().priority, 10);
    }

    #[test]
    fn test_get_next_task_order() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp);

        q.add_task("low", None, 2, "", None).unwrap();
        q.add_task("high-old", None, 9, "", None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        q.add_task("high-new", None, 9, "", None).unwrap();
        q.add_task("future", None, 10, "", Some(Utc::now() + Duration::hours(1)))
            .unwrap();

        assert_eq!(q.get_next_task(None).unwrap().library, "high-old");
        assert_eq!(q.get_next_task(Some(5)).unwrap().library, "low");
        assert!(q.get_next_task(Some(1)).is_none());
    }

    #[test]
    fn test_mark_completed_success_and_failure() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp);
        q.add_task("react", Some("hooks"), 5, "stale", None).unwrap();

        assert!(q.mark_task_completed("react", Some("hooks"), Some("timeout")).unwrap());
        let task = &q.tasks()[0];
        assert_eq!(task.attempts, 1);
        assert_eq!(task.last_error.as_deref(), Some("timeout"));
        assert!(task.scheduled_for.unwrap() > Utc::now());
        assert!(q.get_next_task(None).is_none());

        assert!(q.mark_task_completed("react", Some("hooks"), None).unwrap());
        assert!(q.is_empty());
        assert!(!q.mark_task_completed("react", Some("hooks"), None).unwrap());
    }

    #[test]
    fn test_task_dropped_after_max_attempts() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp);
        q.add_task("react", None, 5, "", None).unwrap();

        for _ in 0..3 {
            q.mark_task_completed("react", None, Some("down")).unwrap();
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_persistence_roundtrip() {
        let tmp = TempDir::new().unwrap();
        {
            let q = queue(&tmp);
            q.add_task("react", Some("hooks"), 7, "stale", None).unwrap();
            q.add_task("vue", None, 3, "soon", None).unwrap();
        }

        let reopened = queue(&tmp);
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get_next_task(None).unwrap().library, "react");

        let raw = fs::read_to_string(tmp.path().join("refresh_queue.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["version"], 1);
        assert!(json["tasks"][0]["addedAt"].is_string());
        assert!(json["tasks"][0].get("error").is_some());
    }

    #[test]
    fn test_corrupt_queue_file_starts_empty() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("refresh_queue.json"), "[[[").unwrap();
        let q = queue(&tmp);
        assert!(q.is_empty());
        q.add_task("react", None, 5, "", None).unwrap();
        assert_eq!(queue(&tmp).len(), 1);
    }

    #[test]
    fn test_queue_stale_entries_priorities() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp);
        let policy = StalenessPolicyManager::default();
        let now = Utc::now();
        let candidate = |lib: &str, days: i64| StaleCandidate {
            library: lib.to_string(),
            topic: Some("overview".to_string()),
            last_updated: now - Duration::days(days),
        };

        let queued = q
            .queue_stale_entries(
                &[
                    candidate("very-old", 45),
                    candidate("old", 33),
                    candidate("aging", 25),
                    candidate("fresh", 2),
                ],
                &policy,
                None,
                Some(now),
            )
            .unwrap();
        assert_eq!(queued, 3);

        let priority = |lib: &str| q.tasks().into_iter().find(|t| t.library == lib).map(|t| t.priority);
        assert_eq!(priority("very-old"), Some(9));
        assert_eq!(priority("old"), Some(7));
        assert_eq!(priority("aging"), Some(3));
        assert_eq!(priority("fresh"), None);
    }

    #[test]
    fn test_queue_stale_entries_uses_type_map() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp);
        let now = Utc::now();
        let mut types = HashMap::new();
        types.insert("react".to_string(), LibraryType::Critical);

        let entries = [StaleCandidate {
            library: "react".into(),
            topic: None,
            last_updated: now - Duration::days(10),
        }];
        q.queue_stale_entries(&entries, &StalenessPolicyManager::default(), Some(&types), Some(now))
            .unwrap();
        assert_eq!(q.tasks()[0].priority, 7);
    }

    #[test]
    fn test_stats() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp);
        q.add_task("a", None, 9, "", None).unwrap();
        q.add_task("b", None, 3, "", Some(Utc::now() + Duration::hours(1))).unwrap();
        q.mark_task_completed("a", None, Some("err")).unwrap();

        let stats = q.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.eligible, 0);
        assert_eq!(stats.scheduled, 2);
        assert_eq!(stats.urgent, 1);
        assert_eq!(stats.retrying, 1);

        assert!(q.remove_task("a", None).unwrap());
        q.clear().unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn test_failed_save_leaves_tasks_unchanged() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp);
        q.add_task("lib", Some("a"), 5, "first", None).unwrap();

        // A directory where the queue file belongs makes every write fail
        let path = tmp.path().join("refresh_queue.json");
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        assert!(q.add_task("lib", Some("b"), 5, "second", None).is_err());
        assert!(q.add_task("lib", Some("a"), 9, "raised", None).is_err());
        assert!(q.mark_task_completed("lib", Some("a"), None).is_err());
        assert!(q.remove_task("lib", Some("a")).is_err());
        assert!(q.clear().is_err());

        let tasks = q.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].priority, 5);
        assert_eq!(tasks[0].reason, "first");

        fs::remove_dir(&path).unwrap();
        q.add_task("lib", Some("b"), 5, "second", None).unwrap();
        assert_eq!(load_tasks(&path).len(), 2);
    }
}
