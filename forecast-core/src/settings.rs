use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::PathBuf};

use crate::model::{ChatId, Coordinate, UserId};

/// Snapshot of everything a run needs to know about one chat.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BotSettings {
    pub admin_id: Option<UserId>,
    pub coordinate: Option<Coordinate>,
    pub schedule_enabled: bool,
}

/// A single write to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingUpdate {
    Admin(UserId),
    Coordinate(Coordinate),
    ScheduleEnabled(bool),
}

/// Persistent key-value settings. Writes are last-write-wins.
pub trait SettingsStore: Send + Sync {
    fn get(&self, chat: ChatId) -> Result<BotSettings>;

    /// Apply every update in one write, so either all of them land or none.
    fn set_all(&self, chat: ChatId, updates: Vec<SettingUpdate>) -> Result<()>;

    fn set(&self, chat: ChatId, update: SettingUpdate) -> Result<()> {
        self.set_all(chat, vec![update])
    }

    /// Every chat that has stored settings.
    fn chats(&self) -> Result<Vec<ChatId>>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ChatEntry {
    #[serde(default)]
    schedule_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    coordinate: Option<Coordinate>,
}

/// On-disk layout. The admin is bot-wide; chats are keyed by their id as a
/// string since TOML table keys must be strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    admin_id: Option<UserId>,
    #[serde(default)]
    chats: BTreeMap<String, ChatEntry>,
}

impl SettingsFile {
    fn snapshot(&self, chat: ChatId) -> BotSettings {
        let entry = self.chats.get(&chat.to_string()).cloned().unwrap_or_default();
        BotSettings {
            admin_id: self.admin_id,
            coordinate: entry.coordinate,
            schedule_enabled: entry.schedule_enabled,
        }
    }

    fn apply(&mut self, chat: ChatId, update: SettingUpdate) {
        match update {
            SettingUpdate::Admin(id) => self.admin_id = Some(id),
            SettingUpdate::Coordinate(c) => {
                self.chats.entry(chat.to_string()).or_default().coordinate = Some(c)
            }
            SettingUpdate::ScheduleEnabled(on) => {
                self.chats.entry(chat.to_string()).or_default().schedule_enabled = on
            }
        }
    }

    fn chat_ids(&self) -> Vec<ChatId> {
        self.chats.keys().filter_map(|k| k.parse().ok()).collect()
    }
}

/// TOML file store. Every call re-reads the file so edits made by another
/// process are picked up on the next run.
#[derive(Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    /// Store at the default platform data location.
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(crate::Config::settings_file_path()?))
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn read(&self) -> Result<SettingsFile> {
        if !self.path.exists() {
            return Ok(SettingsFile::default());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings file: {}", self.path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse settings file: {}", self.path.display()))
    }

    fn write(&self, file: &SettingsFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory: {}", parent.display())
            })?;
        }

        let toml = toml::to_string_pretty(file).context("Failed to serialize settings to TOML")?;

        fs::write(&self.path, toml)
            .with_context(|| format!("Failed to write settings file: {}", self.path.display()))
    }
}

impl SettingsStore for FileSettingsStore {
    fn get(&self, chat: ChatId) -> Result<BotSettings> {
        let _guard = self.lock.lock();
        Ok(self.read()?.snapshot(chat))
    }

    fn set_all(&self, chat: ChatId, updates: Vec<SettingUpdate>) -> Result<()> {
        let _guard = self.lock.lock();
        let mut file = self.read()?;
        for update in updates {
            file.apply(chat, update);
        }
        self.write(&file)
    }

    fn chats(&self) -> Result<Vec<ChatId>> {
        let _guard = self.lock.lock();
        Ok(self.read()?.chat_ids())
    }
}

/// Process-local store, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    inner: Mutex<SettingsFile>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, chat: ChatId) -> Result<BotSettings> {
        Ok(self.inner.lock().snapshot(chat))
    }

    fn set_all(&self, chat: ChatId, updates: Vec<SettingUpdate>) -> Result<()> {
        let mut inner = self.inner.lock();
        for update in updates {
            inner.apply(chat, update);
        }
        Ok(())
    }

    fn chats(&self) -> Result<Vec<ChatId>> {
        Ok(self.inner.lock().chat_ids())
    }
}
