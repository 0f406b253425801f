use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::internal::data_types::now_millis;
use crate::internal::presence::{LocalProfile, PeerStatus};

/// how many recent rooms are remembered
pub const RECENT_ROOMS: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentRoom {
    pub code: String,
    pub timestamp: u64,
}

/// Local state that outlives a session: read once at start, written on change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    pub label: String,
    pub recent_rooms: Vec<RecentRoom>,
    pub status: PeerStatus,
}

impl LocalSettings {
    /// a missing file yields defaults; a corrupt one is logged and yields defaults too
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("ignoring corrupt settings {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)
            .with_context(|| format!("failed to write settings {}", path.display()))?;
        Ok(())
    }

    /// moves `code` to the front, dropping duplicates and anything past RECENT_ROOMS
    pub fn remember_room(&mut self, code: &str) {
        self.recent_rooms.retain(|r| r.code != code);
        self.recent_rooms.insert(
            0,
            RecentRoom {
                code: code.to_string(),
                timestamp: now_millis(),
            },
        );
        self.recent_rooms.truncate(RECENT_ROOMS);
    }

    pub fn forget_room(&mut self, code: &str) {
        self.recent_rooms.retain(|r| r.code != code);
    }

    pub fn profile(&self) -> LocalProfile {
        LocalProfile {
            label: self.label.clone(),
            room_code: None,
            status: self.status,
        }
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from(".simple-mesh").join("settings.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_ten_most_recent_rooms() {
        let mut s = LocalSettings::default();
        for i in 0..12 {
            s.remember_room(&format!("ROOM{:02}", i));
        }
        assert_eq!(s.recent_rooms.len(), RECENT_ROOMS);
        assert_eq!(s.recent_rooms[0].code, "ROOM11");
        assert_eq!(s.recent_rooms[9].code, "ROOM02");
    }

    #[test]
    fn rejoining_moves_room_to_front() {
        let mut s = LocalSettings::default();
        s.remember_room("AAAAAA");
        s.remember_room("BBBBBB");
        s.remember_room("AAAAAA");
        let codes: Vec<&str> = s.recent_rooms.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, vec!["AAAAAA", "BBBBBB"]);
        s.forget_room("AAAAAA");
        assert_eq!(s.recent_rooms.len(), 1);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut s = LocalSettings {
            label: "Bob".into(),
            status: PeerStatus::Busy,
            ..Default::default()
        };
        s.remember_room("XYZ789");
        s.save(&path).unwrap();
        assert_eq!(LocalSettings::load(&path), s);
    }

    #[test]
    fn missing_or_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            LocalSettings::load(dir.path().join("none.json")),
            LocalSettings::default()
        );
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert_eq!(LocalSettings::load(&bad), LocalSettings::default());
    }
}
