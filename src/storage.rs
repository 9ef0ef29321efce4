//! Local persistence for sessions and user config.
//!
//! One JSON file in the platform data directory, written atomically via a
//! temp file and rename. Persisted sessions are snapshots: the live copy is
//! owned by its conversation view, never shared with this layer.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::config::UserConfig;
use crate::session::Session;

/// Most recently used sessions kept on disk.
const MAX_SESSIONS: usize = 50;

static STORAGE_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn get_storage_lock() -> &'static Mutex<()> {
    STORAGE_LOCK.get_or_init(|| Mutex::new(()))
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Could not find app data directory")]
    NoAppDir,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppData {
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub config: Option<UserConfig>,
}

fn get_app_dir() -> Result<PathBuf, StorageError> {
    let dir = dirs::data_local_dir()
        .ok_or(StorageError::NoAppDir)?
        .join("polychat");

    if !dir.exists() {
        fs::create_dir_all(&dir)?;
    }

    Ok(dir)
}

fn get_data_path() -> Result<PathBuf, StorageError> {
    Ok(get_app_dir()?.join("data.json"))
}

fn load_data() -> Result<AppData, StorageError> {
    load_data_from(&get_data_path()?)
}

fn save_data(data: &AppData) -> Result<(), StorageError> {
    save_data_to(&get_data_path()?, data)
}

fn load_data_from(path: &std::path::Path) -> Result<AppData, StorageError> {
    if !path.exists() {
        return Ok(AppData::default());
    }

    let content = fs::read_to_string(path)?;
    let data: AppData = serde_json::from_str(&content)?;
    Ok(data)
}

fn save_data_to(path: &std::path::Path, data: &AppData) -> Result<(), StorageError> {
    let dir = path.parent().ok_or(StorageError::NoAppDir)?;
    let content = serde_json::to_string_pretty(data)?;

    // Write to temp file, then atomic rename
    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.write_all(content.as_bytes())?;
    temp_file.persist(path).map_err(|e| StorageError::Io(e.error))?;

    Ok(())
}

pub fn get_local_sessions() -> Result<Vec<Session>, StorageError> {
    let data = load_data()?;
    Ok(data.sessions)
}

/// Upsert one session snapshot: moved to the front, bounded to
/// [`MAX_SESSIONS`].
pub fn update_local_session(session: &Session) -> Result<(), StorageError> {
    let _guard = get_storage_lock().lock().unwrap();
    let mut data = load_data()?;
    upsert_session(&mut data, session);
    save_data(&data)?;
    Ok(())
}

pub fn delete_local_session(session_id: &str) -> Result<(), StorageError> {
    let _guard = get_storage_lock().lock().unwrap();
    let mut data = load_data()?;
    data.sessions.retain(|s| s.session_id != session_id);
    save_data(&data)?;
    Ok(())
}

pub fn load_user_config() -> Result<UserConfig, StorageError> {
    let data = load_data()?;
    Ok(data.config.unwrap_or_default())
}

pub fn save_user_config(config: &UserConfig) -> Result<(), StorageError> {
    let _guard = get_storage_lock().lock().unwrap();
    let mut data = load_data()?;
    data.config = Some(config.clone());
    save_data(&data)?;
    Ok(())
}

fn upsert_session(data: &mut AppData, session: &Session) {
    data.sessions.retain(|s| s.session_id != session.session_id);
    data.sessions.insert(0, session.clone());
    data.sessions.truncate(MAX_SESSIONS);
}
