//! Read-only maintenance settings, as seen by services.
//!
//! Loading and layering happens in the `configs` crate; services only ever
//! read a snapshot through [`crate::ports::ConfigProvider`].

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Thread reply count after which new replies no longer bump the thread.
pub const DEFAULT_BUMP_LIMIT: u32 = 1000;

/// Which media-related duties this process performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImagerMode {
    /// Serve boards and process media
    #[default]
    Full,
    /// Only process media; board and thread upkeep is left to other nodes
    ImagerOnly,
    /// Never touch media
    NoImager,
}

impl ImagerMode {
    /// Board, thread and post upkeep runs on this node.
    pub fn handles_boards(self) -> bool {
        self != ImagerMode::ImagerOnly
    }

    /// Media upkeep runs on this node.
    pub fn handles_media(self) -> bool {
        self != ImagerMode::NoImager
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub imager_mode: ImagerMode,
    pub prune_threads: bool,
    /// Lower retention bound for inactive threads, in days
    pub thread_expiry_min: u32,
    /// Upper retention bound for inactive threads, in days
    pub thread_expiry_max: u32,
    pub prune_boards: bool,
    /// Days of inactivity after which a board is deleted
    pub board_expiry: u32,
    pub bump_limit: u32,
    /// Days poster IPs and passwords are kept
    pub identity_retention: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            imager_mode: ImagerMode::Full,
            prune_threads: true,
            thread_expiry_min: 7,
            thread_expiry_max: 14,
            prune_boards: true,
            board_expiry: 7,
            bump_limit: DEFAULT_BUMP_LIMIT,
            identity_retention: 7,
        }
    }
}

impl MaintenanceConfig {
    pub fn board_expiry(&self) -> Duration {
        Duration::days(i64::from(self.board_expiry))
    }

    pub fn identity_retention(&self) -> Duration {
        Duration::days(i64::from(self.identity_retention))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imager_modes_split_duties() {
        assert!(ImagerMode::Full.handles_boards());
        assert!(ImagerMode::Full.handles_media());
        assert!(!ImagerMode::ImagerOnly.handles_boards());
        assert!(ImagerMode::ImagerOnly.handles_media());
        assert!(ImagerMode::NoImager.handles_boards());
        assert!(!ImagerMode::NoImager.handles_media());
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let conf: MaintenanceConfig =
            serde_json::from_str(r#"{"board_expiry": 30, "imager_mode": "no_imager"}"#).unwrap();
        assert_eq!(conf.board_expiry, 30);
        assert_eq!(conf.imager_mode, ImagerMode::NoImager);
        assert_eq!(conf.bump_limit, DEFAULT_BUMP_LIMIT);
        assert_eq!(conf.board_expiry(), Duration::days(30));
    }
}
