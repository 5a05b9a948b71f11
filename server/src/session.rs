//! Per-connection session state and message dispatch.
//!
//! A [`PlayerSession`] is created for every accepted socket. It performs the
//! username handshake, gets spawned onto the map, and is then handed over to
//! the world, while the connection task keeps a [`SessionHandle`] to run the
//! input-reading loop and to deliver notifications.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use log::info;
use rand::Rng;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::framing::{FrameError, FramedStream};
use shared::{boxes_overlap, step_position, Message, PlayerView, WorldConfig};

/// Why a session ended, or why an operation on it failed.
///
/// `Frame(Closed)` is the ordinary disconnect path; `Protocol` and
/// `AlreadySpawned` indicate a misbehaving client or a logic error, both fatal
/// to this session only.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("player already spawned")]
    AlreadySpawned,
    #[error("killed by collision")]
    Killed,
}

/// Server-side state for one connected player.
///
/// The keyboard bitmask is written only by this session's reader task and read
/// by the tick loop, so it lives in an explicit atomic rather than relying on
/// any scheduler-level atomicity.
pub struct PlayerSession {
    pub id: u32,
    pub username: String,
    pub pos: Option<(f32, f32)>,
    pub color: [u8; 3],
    pub speed: f32,
    keyboard: Arc<AtomicU8>,
    stream: Arc<FramedStream<TcpStream>>,
    kill: Arc<Notify>,
}

impl PlayerSession {
    pub fn new<R: Rng>(
        id: u32,
        stream: Arc<FramedStream<TcpStream>>,
        speed: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            id,
            username: String::new(),
            pos: None,
            color: [rng.gen(), rng.gen(), rng.gen()],
            speed,
            keyboard: Arc::new(AtomicU8::new(0)),
            stream,
            kill: Arc::new(Notify::new()),
        }
    }

    /// Reads the first message and requires it to name a non-empty username.
    ///
    /// Uniqueness is not checked here; only the world can see every session.
    pub async fn perform_handshake(&mut self) -> Result<(), SessionError> {
        let frame = self.stream.read().await?;
        match decode_message(frame)? {
            Message::Username { username } if !username.is_empty() => {
                info!("session {} identified as {:?}", self.id, username);
                self.username = username;
                Ok(())
            }
            Message::Username { .. } => Err(SessionError::Protocol("empty username".to_string())),
            other => Err(SessionError::Protocol(format!(
                "expected a username message, got {:?}",
                other
            ))),
        }
    }

    /// Places the player at a uniform random position within the map, leaving
    /// room for the player box. Spawning twice is a logic error.
    pub fn spawn<R: Rng>(&mut self, config: &WorldConfig, rng: &mut R) -> Result<(), SessionError> {
        if self.pos.is_some() {
            return Err(SessionError::AlreadySpawned);
        }
        let (max_x, max_y) = config.spawn_bounds();
        self.pos = Some((rng.gen_range(0.0..=max_x), rng.gen_range(0.0..=max_y)));
        Ok(())
    }

    /// A player is on the map once it has a position; only on-map players are
    /// simulated, collided, and broadcast.
    pub fn is_on_map(&self) -> bool {
        self.pos.is_some()
    }

    /// Moves by `speed * dt` along each axis with an active direction bit.
    pub fn apply_movement(&mut self, dt: f32) {
        if let Some(pos) = self.pos {
            let keys = self.keyboard.load(Ordering::Relaxed);
            self.pos = Some(step_position(pos, keys, self.speed * dt));
        }
    }

    /// Axis-aligned bounding-box overlap against another player. Players that
    /// are not on the map never collide.
    pub fn collides_with(&self, other: &PlayerSession, config: &WorldConfig) -> bool {
        match (self.pos, other.pos) {
            (Some(a), Some(b)) => boxes_overlap(a, b, config.player_size()),
            _ => false,
        }
    }

    /// The client-visible projection, present once spawned.
    pub fn view(&self) -> Option<PlayerView> {
        self.pos.map(|pos| PlayerView {
            pos,
            color: self.color,
        })
    }

    /// Clones the shared pieces of this session for use by the connection
    /// task after the session itself moves into the world.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            username: self.username.clone(),
            keyboard: Arc::clone(&self.keyboard),
            stream: Arc::clone(&self.stream),
            kill: Arc::clone(&self.kill),
        }
    }
}

/// The connection task's view of a registered session: enough to read input,
/// deliver messages, and tear the session down, without owning player state.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: u32,
    pub username: String,
    keyboard: Arc<AtomicU8>,
    pub stream: Arc<FramedStream<TcpStream>>,
    kill: Arc<Notify>,
}

impl SessionHandle {
    /// Reads messages until the session ends, updating the keyboard bitmask
    /// for each `keyboard` message. Any other message type is a protocol
    /// violation that terminates the read side. Returns the terminating
    /// condition; it never returns while the session is healthy.
    pub async fn read_input_forever(&self) -> SessionError {
        loop {
            let frame = tokio::select! {
                frame = self.stream.read() => frame,
                _ = self.kill.notified() => return SessionError::Killed,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => return e.into(),
            };
            match decode_message(frame) {
                Ok(Message::Keyboard { state }) => self.keyboard.store(state, Ordering::Relaxed),
                Ok(other) => {
                    return SessionError::Protocol(format!(
                        "expected a keyboard message, got {:?}",
                        other
                    ))
                }
                Err(e) => return e,
            }
        }
    }

    /// Wakes the reader loop with [`SessionError::Killed`]. The permit is
    /// stored, so a kill between reads is not lost.
    pub fn notify_kill(&self) {
        self.kill.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn store_keyboard(&self, state: u8) {
        self.keyboard.store(state, Ordering::Relaxed);
    }
}

fn decode_message(frame: Map<String, Value>) -> Result<Message, SessionError> {
    serde_json::from_value(Value::Object(frame)).map_err(|e| SessionError::Protocol(e.to_string()))
}
