use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_PORT: u16 = 9042;
pub const MAP_WIDTH: f32 = 500.0;
pub const MAP_HEIGHT: f32 = 500.0;
pub const PLAYER_WIDTH: f32 = 20.0;
pub const PLAYER_HEIGHT: f32 = 20.0;
pub const PLAYER_SPEED: f32 = 150.0;
pub const TICK_INTERVAL_MS: u64 = 10;
pub const BROADCAST_INTERVAL_MS: u64 = 100;

pub const KEY_UP: u8 = 1 << 0;
pub const KEY_RIGHT: u8 = 1 << 1;
pub const KEY_DOWN: u8 = 1 << 2;
pub const KEY_LEFT: u8 = 1 << 3;

/// One message on the wire, framed as a single JSON object per line.
///
/// The `type` tag and the `newPlayers`/`goneUsernames` field names are part of
/// the protocol and must not change spelling.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Username {
        username: String,
    },
    Keyboard {
        state: u8,
    },
    Close {
        message: String,
    },
    Update {
        lps: u32,
        players: HashMap<String, PlayerView>,
        #[serde(rename = "newPlayers")]
        new_players: HashMap<String, PlayerView>,
        #[serde(rename = "goneUsernames")]
        gone_usernames: Vec<String>,
    },
    Dead,
}

/// The client-visible projection of one player.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerView {
    pub pos: (f32, f32),
    pub color: [u8; 3],
}

/// World geometry and movement parameters, injected at startup.
#[derive(Debug, Clone, Copy)]
pub struct WorldConfig {
    pub map_width: f32,
    pub map_height: f32,
    pub player_width: f32,
    pub player_height: f32,
    pub player_speed: f32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            map_width: MAP_WIDTH,
            map_height: MAP_HEIGHT,
            player_width: PLAYER_WIDTH,
            player_height: PLAYER_HEIGHT,
            player_speed: PLAYER_SPEED,
        }
    }
}

impl WorldConfig {
    /// Largest top-left position at which a player box still fits on the map.
    pub fn spawn_bounds(&self) -> (f32, f32) {
        (
            self.map_width - self.player_width,
            self.map_height - self.player_height,
        )
    }

    pub fn player_size(&self) -> (f32, f32) {
        (self.player_width, self.player_height)
    }
}

/// Applies one movement step to a position for the active direction bits.
///
/// Each axis is handled independently; a diagonal bitmask moves the full step
/// on both axes.
pub fn step_position(pos: (f32, f32), keys: u8, step: f32) -> (f32, f32) {
    let (mut x, mut y) = pos;
    if keys & KEY_LEFT != 0 {
        x -= step;
    }
    if keys & KEY_RIGHT != 0 {
        x += step;
    }
    if keys & KEY_UP != 0 {
        y -= step;
    }
    if keys & KEY_DOWN != 0 {
        y += step;
    }
    (x, y)
}

/// Axis-aligned overlap test for two player boxes given their top-left
/// corners. Boxes that merely touch along an edge do not overlap.
pub fn boxes_overlap(a: (f32, f32), b: (f32, f32), size: (f32, f32)) -> bool {
    a.0 < b.0 + size.0 && b.0 < a.0 + size.0 && a.1 < b.1 + size.1 && b.1 < a.1 + size.1
}
