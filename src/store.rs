//! ユーザープロファイルの永続化
//!
//! JSON ファイル1つに小文字名をキーとして全ユーザーを保存する。
//! 書き込みは毎回ファイル全体を一時ファイルに書いてから rename する。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("user already exists: {0}")]
    DuplicateName(String),

    #[error("unknown user: {0}")]
    UnknownUser(String),
}

/// ゲームごとの成績（スコアは 0..=100 の百分率）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GameStats {
    pub mean: f32,
    pub best: f32,
    pub last: f32,
    pub play_count: u32,
}

impl GameStats {
    fn record(&mut self, score: f32) {
        let n = self.play_count as f32;
        self.mean = (self.mean * n + score) / (n + 1.0);
        self.best = if self.play_count == 0 { score } else { self.best.max(score) };
        self.last = score;
        self.play_count += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub facial_vector: Option<Vec<f32>>,
    /// mode → game → stats
    #[serde(default)]
    pub games_stats: BTreeMap<String, BTreeMap<String, GameStats>>,
}

fn default_language() -> String {
    "es".to_string()
}

impl UserProfile {
    pub fn new(name: &str, language: &str, facial_vector: Option<Vec<f32>>) -> Self {
        Self {
            name: name.to_string(),
            language: language.to_string(),
            facial_vector,
            games_stats: BTreeMap::new(),
        }
    }

    pub fn stats(&self, mode: &str, game: &str) -> Option<&GameStats> {
        self.games_stats.get(mode).and_then(|games| games.get(game))
    }
}

pub fn user_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// 状態機械から見た永続化先
pub trait UserStore: Send {
    fn register(
        &mut self,
        name: &str,
        language: &str,
        facial_vector: Option<Vec<f32>>,
    ) -> Result<UserProfile, StoreError>;

    fn exists(&self, name: &str) -> bool;

    fn get(&self, name: &str) -> Option<UserProfile>;

    fn profiles(&self) -> Vec<UserProfile>;

    /// 進捗を保ったまま名前を変える
    fn rename(&mut self, current: &str, new_name: &str) -> Result<UserProfile, StoreError>;

    fn set_language(&mut self, name: &str, language: &str) -> Result<UserProfile, StoreError>;

    fn record_game(
        &mut self,
        name: &str,
        mode: &str,
        game: &str,
        score: f32,
    ) -> Result<GameStats, StoreError>;
}

pub struct JsonUserStore {
    path: PathBuf,
    users: BTreeMap<String, UserProfile>,
}

impl JsonUserStore {
    /// ファイルが無ければ空、壊れていれば警告して空で始める
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let users = if path.exists() {
            let text = fs::read_to_string(&path)?;
            match serde_json::from_str(&text) {
                Ok(users) => users,
                Err(e) => {
                    warn!("user store {} is corrupt, starting empty: {}", path.display(), e);
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };
        info!("user store {}: {} users", path.display(), users.len());
        Ok(Self { path, users })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 変更後の全体を書き、成功した時だけメモリ上にも反映する
    fn commit(&mut self, users: BTreeMap<String, UserProfile>) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&users)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        self.users = users;
        Ok(())
    }

    fn modify<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut UserProfile) -> T,
    ) -> Result<(T, UserProfile), StoreError> {
        let key = user_key(name);
        let mut users = self.users.clone();
        let profile = users.get_mut(&key).ok_or_else(|| StoreError::UnknownUser(name.to_string()))?;
        let out = f(profile);
        let updated = profile.clone();
        self.commit(users)?;
        Ok((out, updated))
    }
}

impl UserStore for JsonUserStore {
    fn register(
        &mut self,
        name: &str,
        language: &str,
        facial_vector: Option<Vec<f32>>,
    ) -> Result<UserProfile, StoreError> {
        let key = user_key(name);
        if self.users.contains_key(&key) {
            return Err(StoreError::DuplicateName(name.to_string()));
        }
        let profile = UserProfile::new(name.trim(), language, facial_vector);
        let mut users = self.users.clone();
        users.insert(key, profile.clone());
        self.commit(users)?;
        info!("registered user {}", profile.name);
        Ok(profile)
    }

    fn exists(&self, name: &str) -> bool {
        self.users.contains_key(&user_key(name))
    }

    fn get(&self, name: &str) -> Option<UserProfile> {
        self.users.get(&user_key(name)).cloned()
    }

    fn profiles(&self) -> Vec<UserProfile> {
        self.users.values().cloned().collect()
    }

    fn rename(&mut self, current: &str, new_name: &str) -> Result<UserProfile, StoreError> {
        let old_key = user_key(current);
        let new_key = user_key(new_name);
        let mut users = self.users.clone();
        let mut profile = users.remove(&old_key).ok_or_else(|| StoreError::UnknownUser(current.to_string()))?;
        if users.contains_key(&new_key) {
            return Err(StoreError::DuplicateName(new_name.to_string()));
        }
        profile.name = new_name.trim().to_string();
        users.insert(new_key, profile.clone());
        self.commit(users)?;
        info!("renamed user {} -> {}", current, profile.name);
        Ok(profile)
    }

    fn set_language(&mut self, name: &str, language: &str) -> Result<UserProfile, StoreError> {
        let ((), profile) = self.modify(name, |p| p.language = language.to_string())?;
        Ok(profile)
    }

    fn record_game(
        &mut self,
        name: &str,
        mode: &str,
        game: &str,
        score: f32,
    ) -> Result<GameStats, StoreError> {
        let (stats, _) = self.modify(name, |p| {
            let stats = p
                .games_stats
                .entry(mode.to_string())
                .or_default()
                .entry(game.to_string())
                .or_default();
            stats.record(score);
            *stats
        })?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, JsonUserStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonUserStore::open(dir.path().join("data").join("usuarios.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_register_and_reload() {
        let (_dir, mut s) = store();
        s.register("Ana", "es", Some(vec![0.1, 0.2])).unwrap();
        assert!(s.exists("ana"), "keys are lowercase");
        assert!(s.exists(" ANA "));

        let reloaded = JsonUserStore::open(s.path()).unwrap();
        let ana = reloaded.get("Ana").expect("persisted");
        assert_eq!(ana.name, "Ana");
        assert_eq!(ana.facial_vector, Some(vec![0.1, 0.2]));
    }

    #[test]
    fn test_duplicate_rejected() {
        let (_dir, mut s) = store();
        s.register("Ana", "es", None).unwrap();
        assert!(matches!(s.register("ana", "en", None), Err(StoreError::DuplicateName(_))));
        assert_eq!(s.profiles().len(), 1);
    }

    #[test]
    fn test_rename_keeps_progress() {
        let (_dir, mut s) = store();
        s.register("Ana", "es", None).unwrap();
        s.register("Luis", "es", None).unwrap();
        s.record_game("Ana", "entrenamiento", "descubre", 50.0).unwrap();

        assert!(matches!(s.rename("Ana", "luis"), Err(StoreError::DuplicateName(_))));
        assert!(s.exists("ana"), "failed rename leaves store untouched");

        s.rename("Ana", "Anita").unwrap();
        assert!(!s.exists("ana"));
        let anita = s.get("anita").unwrap();
        assert_eq!(anita.stats("entrenamiento", "descubre").map(|st| st.play_count), Some(1));
    }

    #[test]
    fn test_record_game_stats() {
        let (_dir, mut s) = store();
        s.register("Ana", "es", None).unwrap();
        s.record_game("Ana", "evaluacion", "memoria", 100.0).unwrap();
        let stats = s.record_game("Ana", "evaluacion", "memoria", 0.0).unwrap();
        assert_eq!(stats.play_count, 2);
        assert_eq!(stats.mean, 50.0);
        assert_eq!(stats.best, 100.0);
        assert_eq!(stats.last, 0.0);
        assert!(matches!(s.record_game("Nadie", "evaluacion", "memoria", 1.0), Err(StoreError::UnknownUser(_))));
    }

    #[test]
    fn test_set_language() {
        let (_dir, mut s) = store();
        s.register("Ana", "es", None).unwrap();
        s.set_language("ANA", "en").unwrap();
        assert_eq!(JsonUserStore::open(s.path()).unwrap().get("ana").unwrap().language, "en");
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usuarios.json");
        fs::write(&path, "{ not json").unwrap();
        let s = JsonUserStore::open(&path).unwrap();
        assert!(s.profiles().is_empty());
    }

    #[test]
    fn test_failed_write_is_not_applied() {
        let dir = tempfile::tempdir().unwrap();
        // 親がファイルなのでディレクトリを作れない
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "x").unwrap();
        let mut s = JsonUserStore::open(blocker.join("usuarios.json")).unwrap();
        assert!(s.register("Ana", "es", None).is_err());
        assert!(!s.exists("ana"), "in-memory state unchanged after failed write");
    }
}
