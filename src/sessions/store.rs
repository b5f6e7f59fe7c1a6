//! File-backed session store.
//!
//! One JSON file per agent maps session keys to [`SessionEntry`] values.
//! Every write goes through [`update_session_store`]: read → parse → mutate
//! → atomic replace (temp file + rename), serialized by a per-path mutex.
//! Readers reload from disk so the file stays the source of truth.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use super::{alias_session_key, build_agent_main_session_key, SessionEntry};

/// Errors from the session store.
#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("JSON error on {path}: {message}")]
    Json { path: String, message: String },
}

type SessionMap = HashMap<String, SessionEntry>;

/// Per-path write locks, shared process-wide.
static PATH_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    let mut locks = PATH_LOCKS.lock();
    locks
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

fn read_map(path: &Path) -> Result<SessionMap, SessionStoreError> {
    if !path.exists() {
        return Ok(SessionMap::new());
    }
    let text = fs::read_to_string(path).map_err(|e| SessionStoreError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    if text.trim().is_empty() {
        return Ok(SessionMap::new());
    }
    serde_json::from_str(&text).map_err(|e| SessionStoreError::Json {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn write_map(path: &Path, map: &SessionMap) -> Result<(), SessionStoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SessionStoreError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    }
    let content = serde_json::to_string_pretty(map).map_err(|e| SessionStoreError::Json {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content).map_err(|e| SessionStoreError::Io {
        path: temp_path.display().to_string(),
        message: e.to_string(),
    })?;
    fs::rename(&temp_path, path).map_err(|e| SessionStoreError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    Ok(())
}

/// Atomic read-modify-write on one session file.
///
/// The mutator returns the value to hand back to the caller.
pub fn update_session_store<T, F>(path: &Path, mutator: F) -> Result<T, SessionStoreError>
where
    F: FnOnce(&mut SessionMap) -> T,
{
    let lock = lock_for(path);
    let _guard = lock.lock();
    let mut map = read_map(path)?;
    let result = mutator(&mut map);
    write_map(path, &map)?;
    Ok(result)
}

/// Session store rooted at `<base>/sessions`, one file per agent.
#[derive(Debug, Clone)]
pub struct SessionStore {
    base_dir: PathBuf,
}

impl SessionStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of an agent's session file.
    pub fn agent_file(&self, agent_id: &str) -> PathBuf {
        self.base_dir.join(format!("{agent_id}.json"))
    }

    /// Read an agent's full session map (reloads from disk).
    pub fn load(&self, agent_id: &str) -> Result<SessionMap, SessionStoreError> {
        read_map(&self.agent_file(agent_id))
    }

    /// Atomic read-modify-write on one agent's sessions.
    pub fn update<T, F>(&self, agent_id: &str, mutator: F) -> Result<T, SessionStoreError>
    where
        F: FnOnce(&mut SessionMap) -> T,
    {
        update_session_store(&self.agent_file(agent_id), mutator)
    }

    /// Look up a session by key, walking the resolution order:
    /// the key itself, `agent:<default>:<key>`, the aliased form of that,
    /// and finally the default agent's canonical main key.
    pub fn resolve(
        &self,
        default_agent: &str,
        key: &str,
    ) -> Result<Option<SessionEntry>, SessionStoreError> {
        let map = self.load(default_agent)?;
        for candidate in resolution_candidates(default_agent, key) {
            if let Some(entry) = map.get(&candidate) {
                return Ok(Some(entry.clone()));
            }
        }
        Ok(None)
    }

    /// Get or lazily create the session under a key.
    pub fn get_or_create<F>(
        &self,
        agent_id: &str,
        key: &str,
        create: F,
    ) -> Result<SessionEntry, SessionStoreError>
    where
        F: FnOnce() -> SessionEntry,
    {
        self.update(agent_id, |map| {
            map.entry(key.to_string()).or_insert_with(create).clone()
        })
    }

    /// Explicitly destroy a session. Returns the removed entry, if any.
    pub fn reset(
        &self,
        agent_id: &str,
        key: &str,
    ) -> Result<Option<SessionEntry>, SessionStoreError> {
        self.update(agent_id, |map| map.remove(key))
    }
}

/// The candidate keys a lookup walks, in order.
pub fn resolution_candidates(default_agent: &str, key: &str) -> Vec<String> {
    let mut candidates = vec![key.to_string()];
    if !key.starts_with("agent:") {
        candidates.push(format!("agent:{default_agent}:{key}"));
        if let Some(aliased) = alias_session_key(key) {
            candidates.push(format!("agent:{default_agent}:{aliased}"));
        }
    }
    candidates.push(build_agent_main_session_key(default_agent));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::{build_session_key, ChatType};
    use tempfile::TempDir;

    fn store() -> (TempDir, SessionStore) {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));
        (dir, store)
    }

    #[test]
    fn test_get_or_create_is_lazy_and_stable() {
        let (_dir, store) = store();
        let key = build_session_key("main", "dm", "+15551234");
        let created = store
            .get_or_create("main", &key, || SessionEntry::new(ChatType::Direct))
            .unwrap();
        let again = store
            .get_or_create("main", &key, || SessionEntry::new(ChatType::Group))
            .unwrap();
        assert_eq!(created.session_id, again.session_id);
        assert_eq!(again.chat_type, ChatType::Direct);
    }

    #[test]
    fn test_update_round_trips_through_disk() {
        let (_dir, store) = store();
        let key = build_session_key("main", "dm", "alice");
        store
            .update("main", |map| {
                let mut entry = SessionEntry::new(ChatType::Direct);
                entry.set_model_override("anthropic", "claude-opus-4");
                map.insert(key.clone(), entry);
            })
            .unwrap();

        let loaded = store.load("main").unwrap();
        assert_eq!(
            loaded.get(&key).unwrap().model_override.as_deref(),
            Some("claude-opus-4")
        );
    }

    #[test]
    fn test_resolution_order() {
        let (_dir, store) = store();
        store
            .update("main", |map| {
                map.insert(
                    build_agent_main_session_key("main"),
                    SessionEntry::new(ChatType::Direct),
                );
            })
            .unwrap();

        // Unknown key falls back to the canonical main session.
        let resolved = store.resolve("main", "dm:+19998887777").unwrap();
        assert!(resolved.is_some());

        // A direct hit wins over the fallback.
        let key = build_session_key("main", "dm", "+15551234");
        store
            .update("main", |map| {
                let mut entry = SessionEntry::new(ChatType::Direct);
                entry.last_channel = Some("telegram".to_string());
                map.insert(key.clone(), entry);
            })
            .unwrap();
        let resolved = store.resolve("main", &key).unwrap().unwrap();
        assert_eq!(resolved.last_channel.as_deref(), Some("telegram"));
    }

    #[test]
    fn test_resolution_walks_alias() {
        let (_dir, store) = store();
        store
            .update("main", |map| {
                let mut entry = SessionEntry::new(ChatType::Direct);
                entry.last_channel = Some("signal".to_string());
                map.insert("agent:main:direct:+15551234".to_string(), entry);
            })
            .unwrap();

        // "dm:" resolves through the alias to "direct:".
        let resolved = store.resolve("main", "dm:+15551234").unwrap();
        assert_eq!(
            resolved.and_then(|e| e.last_channel),
            Some("signal".to_string())
        );
    }

    #[test]
    fn test_missing_resolves_to_none() {
        let (_dir, store) = store();
        assert!(store.resolve("main", "dm:+15551234").unwrap().is_none());
    }

    #[test]
    fn test_reset_destroys_session() {
        let (_dir, store) = store();
        let key = build_session_key("main", "dm", "bob");
        store
            .get_or_create("main", &key, || SessionEntry::new(ChatType::Direct))
            .unwrap();
        assert!(store.reset("main", &key).unwrap().is_some());
        assert!(store.load("main").unwrap().get(&key).is_none());
        assert!(store.reset("main", &key).unwrap().is_none());
    }

    #[test]
    fn test_candidates_order() {
        let candidates = resolution_candidates("main", "dm:+1555");
        assert_eq!(
            candidates,
            vec![
                "dm:+1555".to_string(),
                "agent:main:dm:+1555".to_string(),
                "agent:main:direct:+1555".to_string(),
                "agent:main:main".to_string(),
            ]
        );
    }

    #[test]
    fn test_concurrent_updates_serialize() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                store
                    .update("main", |map| {
                        let key = format!("agent:main:dm:peer{i}");
                        map.insert(key, SessionEntry::new(ChatType::Direct));
                    })
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.load("main").unwrap().len(), 8);
    }
}
