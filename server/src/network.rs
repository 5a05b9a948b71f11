//! Accept loop and game loop coordination for the arena server.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};

use crate::framing::{FrameError, FramedStream};
use crate::game::{SessionSnapshot, World};
use crate::session::{PlayerSession, SessionError};
use shared::{Message, PlayerView, WorldConfig};

/// How many recent tick durations feed the achieved-rate estimate.
const RATE_WINDOW: usize = 10;
/// How long shutdown waits for final notices to flush.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// The authoritative server: owns the listener, the world, and the cadence
/// parameters for simulation and broadcast.
pub struct Server {
    listener: TcpListener,
    world: Arc<Mutex<World>>,
    config: WorldConfig,
    tick_interval: Duration,
    broadcast_interval: Duration,
    next_session_id: AtomicU32,
}

impl Server {
    pub async fn new(
        addr: &str,
        config: WorldConfig,
        tick_interval: Duration,
        broadcast_interval: Duration,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        Ok(Server {
            listener,
            world: Arc::new(Mutex::new(World::new(config))),
            config,
            tick_interval,
            broadcast_interval,
            next_session_id: AtomicU32::new(1),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections forever, spawning one independent task per client.
    /// A failed handshake or a duplicate username affects only that task.
    pub async fn accept_loop(&self) {
        loop {
            match self.listener.accept().await {
                Ok((socket, addr)) => {
                    let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                    debug!("session {} connected from {}", id, addr);
                    let world = Arc::clone(&self.world);
                    let config = self.config;
                    tokio::spawn(handle_connection(socket, id, world, config));
                }
                Err(e) => {
                    warn!("failed to accept connection: {}", e);
                    sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    /// Drives the simulation at the tick interval and the broadcast on its
    /// own slower cadence. The world lock is held for the tick itself, never
    /// across any network write.
    pub async fn game_loop(&self) {
        info!(
            "Starting game loop ({:?} tick, {:?} broadcast)",
            self.tick_interval, self.broadcast_interval
        );

        let mut window: VecDeque<f32> = VecDeque::with_capacity(RATE_WINDOW);
        let mut known_usernames: HashSet<String> = HashSet::new();
        let mut last_tick = Instant::now();
        let mut last_broadcast = Instant::now();
        let mut tick_count: u64 = 0;

        loop {
            sleep(self.tick_interval).await;

            let now = Instant::now();
            let dt = (now - last_tick).as_secs_f32();
            last_tick = now;

            if window.len() == RATE_WINDOW {
                window.pop_front();
            }
            window.push_back(dt);
            let lps = ticks_per_second(&window);

            let (killed, player_count) = {
                let mut world = self.world.lock().await;
                (world.tick(dt, &mut rand::thread_rng()), world.len())
            };

            // the dead notice goes out after the lock is released, and the
            // kill signal cancels exactly that session's reader
            for victim in killed {
                tokio::spawn(async move {
                    let _ = victim.stream.write(&Message::Dead).await;
                    victim.notify_kill();
                });
            }

            tick_count += 1;
            if tick_count % 100 == 0 && player_count > 0 {
                debug!(
                    "tick {}: {} players, {} ticks/s",
                    tick_count, player_count, lps
                );
            }

            if now.duration_since(last_broadcast) >= self.broadcast_interval {
                last_broadcast = now;
                self.broadcast(lps, &mut known_usernames).await;
            }
        }
    }

    /// Snapshots the world, computes the delta against the previous
    /// broadcast, and dispatches one update per session as an independent
    /// task so a stalled client cannot delay the others.
    async fn broadcast(&self, lps: u32, known_usernames: &mut HashSet<String>) {
        let snapshot = { self.world.lock().await.snapshot() };

        let present: Vec<(String, PlayerView)> = snapshot
            .iter()
            .map(|entry| (entry.handle.username.clone(), entry.view.clone()))
            .collect();
        let (update, current) = build_update(lps, &present, known_usernames);
        *known_usernames = current;

        // a world that cannot be serialized is unrecoverable
        let encoded: Arc<str> = serde_json::to_string(&update)
            .expect("world update must serialize")
            .into();

        for entry in snapshot {
            let line = Arc::clone(&encoded);
            tokio::spawn(async move {
                if let Err(e) = entry.handle.stream.write_line(&line).await {
                    debug!("dropping update for {:?}: {}", entry.handle.username, e);
                }
            });
        }
    }

    /// Sends every connected session a close notice, bounded by a grace
    /// period. The process exit that follows tears the sockets down.
    pub async fn shutdown(&self) {
        info!("Shutting down, notifying connected players");
        let snapshot: Vec<SessionSnapshot> = { self.world.lock().await.snapshot() };

        let notice = Message::Close {
            message: "server shutting down".to_string(),
        };
        let encoded: Arc<str> = match serde_json::to_string(&notice) {
            Ok(encoded) => encoded.into(),
            Err(e) => {
                error!("failed to encode shutdown notice: {}", e);
                return;
            }
        };

        let mut flushes = Vec::new();
        for entry in snapshot {
            let line = Arc::clone(&encoded);
            flushes.push(tokio::spawn(async move {
                let _ = entry.handle.stream.write_line(&line).await;
            }));
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        for flush in flushes {
            let remaining = deadline.duration_since(Instant::now());
            if timeout(remaining, flush).await.is_err() {
                warn!("shutdown grace period expired with writes pending");
                break;
            }
        }
    }
}

/// Runs one connection from accept to teardown: handshake, spawn, world
/// registration, then the input loop until the session ends. Every exit path
/// cleans the world and closes the stream; errors here never escape the task.
async fn handle_connection(
    socket: TcpStream,
    id: u32,
    world: Arc<Mutex<World>>,
    config: WorldConfig,
) {
    let stream = Arc::new(FramedStream::new(socket));
    let mut session = PlayerSession::new(
        id,
        Arc::clone(&stream),
        config.player_speed,
        &mut rand::thread_rng(),
    );

    if let Err(e) = session.perform_handshake().await {
        match &e {
            SessionError::Frame(FrameError::Closed) => {
                info!("session {} closed before the handshake", id)
            }
            e => {
                warn!("session {} handshake failed: {}", id, e);
                let _ = stream
                    .write(&Message::Close {
                        message: format!("handshake failed: {}", e),
                    })
                    .await;
            }
        }
        stream.close().await;
        return;
    }

    let spawn_result = session.spawn(&config, &mut rand::thread_rng());
    if let Err(e) = spawn_result {
        error!("session {} could not spawn: {}", id, e);
        stream.close().await;
        return;
    }

    let handle = session.handle();
    let registered = { world.lock().await.register(session) };
    if let Err(e) = registered {
        info!("session {} rejected: {}", id, e);
        let _ = stream
            .write(&Message::Close {
                message: "username already taken".to_string(),
            })
            .await;
        stream.close().await;
        return;
    }

    match handle.read_input_forever().await {
        SessionError::Frame(FrameError::Closed) => {
            info!("player {:?} disconnected", handle.username)
        }
        SessionError::Killed => info!("player {:?} session ended after death", handle.username),
        e => warn!("player {:?} dropped: {}", handle.username, e),
    }

    world.lock().await.remove(&handle.username, handle.id);
    stream.close().await;
}

/// Achieved tick rate over the rolling window, rounded to whole ticks.
fn ticks_per_second(window: &VecDeque<f32>) -> u32 {
    let elapsed: f32 = window.iter().sum();
    if elapsed > 0.0 {
        (window.len() as f32 / elapsed).round() as u32
    } else {
        0
    }
}

/// Builds the periodic update from the current snapshot and the username set
/// of the previous broadcast, returning the new set for next time. `players`
/// carries everyone currently on the map; `newPlayers` and `goneUsernames`
/// carry the delta.
fn build_update(
    lps: u32,
    present: &[(String, PlayerView)],
    known_usernames: &HashSet<String>,
) -> (Message, HashSet<String>) {
    let mut players = HashMap::new();
    let mut new_players = HashMap::new();
    for (username, view) in present {
        players.insert(username.clone(), view.clone());
        if !known_usernames.contains(username) {
            new_players.insert(username.clone(), view.clone());
        }
    }

    let current: HashSet<String> = present.iter().map(|(name, _)| name.clone()).collect();
    let gone_usernames: Vec<String> = known_usernames.difference(&current).cloned().collect();

    (
        Message::Update {
            lps,
            players,
            new_players,
            gone_usernames,
        },
        current,
    )
}
