use std::collections::HashMap;

use log::{info, warn};
use rand::Rng;
use thiserror::Error;

use crate::session::{PlayerSession, SessionHandle};
use shared::{PlayerView, WorldConfig};

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("username {0:?} already taken")]
    DuplicateUsername(String),
}

/// One on-map player as seen by the broadcaster: its view plus the handle
/// needed to push messages without touching the world again.
pub struct SessionSnapshot {
    pub handle: SessionHandle,
    pub view: PlayerView,
}

/// The single source of truth for all on-map players.
///
/// The map is never exposed directly; every mutation goes through `register`,
/// `remove`, or `tick`, and the owner is expected to hold the world behind one
/// mutex for the duration of any of them. Network I/O must happen outside
/// that critical section, which is what `snapshot` and the handles returned
/// by `tick` are for.
pub struct World {
    players: HashMap<String, PlayerSession>,
    config: WorldConfig,
}

impl World {
    pub fn new(config: WorldConfig) -> Self {
        Self {
            players: HashMap::new(),
            config,
        }
    }

    /// Inserts a session, enforcing username uniqueness among on-map players.
    pub fn register(&mut self, session: PlayerSession) -> Result<(), RegisterError> {
        if self.players.contains_key(&session.username) {
            warn!("duplicate username {:?} rejected", session.username);
            return Err(RegisterError::DuplicateUsername(session.username.clone()));
        }
        info!(
            "player {:?} (session {}) joined at {:?}",
            session.username, session.id, session.pos
        );
        self.players.insert(session.username.clone(), session);
        Ok(())
    }

    /// Removes the player holding `username`, but only if it is still the
    /// session identified by `id`. Removing an absent or replaced player is a
    /// no-op: disconnects can be detected on the read and write sides at the
    /// same time, a killed player's session also removes itself on the way
    /// out, and a freed username may already belong to a newer session.
    pub fn remove(&mut self, username: &str, id: u32) -> bool {
        let still_owned = self
            .players
            .get(username)
            .is_some_and(|player| player.id == id);
        if still_owned {
            self.players.remove(username);
            info!("player {:?} left", username);
        }
        still_owned
    }

    /// Advances the simulation one step: movement for every on-map player,
    /// then a pairwise collision scan. Each overlapping pair loses one member,
    /// chosen by coin flip; the losers are removed and their handles returned
    /// so the caller can notify them after releasing the world.
    pub fn tick<R: Rng>(&mut self, dt: f32, rng: &mut R) -> Vec<SessionHandle> {
        for player in self.players.values_mut() {
            player.apply_movement(dt);
        }

        let usernames: Vec<String> = self.players.keys().cloned().collect();
        let mut losers: Vec<String> = Vec::new();
        for i in 0..usernames.len() {
            for j in (i + 1)..usernames.len() {
                // a player that already lost this tick is off the map
                if losers.contains(&usernames[i]) || losers.contains(&usernames[j]) {
                    continue;
                }
                let a = &self.players[&usernames[i]];
                let b = &self.players[&usernames[j]];
                if a.collides_with(b, &self.config) {
                    let victim = if rng.gen_bool(0.5) { i } else { j };
                    losers.push(usernames[victim].clone());
                }
            }
        }

        let mut killed = Vec::with_capacity(losers.len());
        for username in losers {
            if let Some(player) = self.players.remove(&username) {
                info!("player {:?} died in a collision", username);
                killed.push(player.handle());
            }
        }
        killed
    }

    /// An immutable copy of every on-map player's client-visible state along
    /// with its delivery handle, safe to use without holding the world.
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.players
            .values()
            .filter_map(|player| {
                player.view().map(|view| SessionSnapshot {
                    handle: player.handle(),
                    view,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FramedStream;
    use assert_approx_eq::assert_approx_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use shared::KEY_RIGHT;
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Mutex;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    async fn session_at(id: u32, username: &str, pos: (f32, f32)) -> (PlayerSession, TcpStream) {
        let (client, accepted) = tcp_pair().await;
        let stream = Arc::new(FramedStream::new(accepted));
        let mut session =
            PlayerSession::new(id, stream, 150.0, &mut StdRng::seed_from_u64(id as u64));
        session.username = username.to_string();
        session.pos = Some(pos);
        (session, client)
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_username() {
        let mut world = World::new(WorldConfig::default());
        let (first, _c1) = session_at(1, "alice", (10.0, 10.0)).await;
        let (second, _c2) = session_at(2, "alice", (200.0, 200.0)).await;

        world.register(first).unwrap();
        let result = world.register(second);

        assert!(matches!(
            result,
            Err(RegisterError::DuplicateUsername(name)) if name == "alice"
        ));
        assert_eq!(world.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let mut world = World::new(WorldConfig::default());
        let (session, _client) = session_at(1, "alice", (10.0, 10.0)).await;
        world.register(session).unwrap();

        assert!(world.remove("alice", 1));
        assert!(!world.remove("alice", 1));
        assert!(!world.remove("nobody", 9));
        assert!(world.is_empty());
    }

    #[tokio::test]
    async fn test_stale_removal_spares_a_newer_session_with_the_same_name() {
        let mut world = World::new(WorldConfig::default());
        let (old, _c1) = session_at(1, "alice", (10.0, 10.0)).await;
        world.register(old).unwrap();
        world.remove("alice", 1);

        let (reborn, _c2) = session_at(2, "alice", (200.0, 200.0)).await;
        world.register(reborn).unwrap();

        // the first session's late cleanup must not evict the second
        assert!(!world.remove("alice", 1));
        assert_eq!(world.len(), 1);
        assert!(world.remove("alice", 2));
    }

    #[tokio::test]
    async fn test_tick_applies_movement() {
        let mut world = World::new(WorldConfig::default());
        let (session, _client) = session_at(1, "alice", (100.0, 100.0)).await;
        let handle = session.handle();
        world.register(session).unwrap();
        handle.store_keyboard(KEY_RIGHT);

        let killed = world.tick(0.1, &mut StdRng::seed_from_u64(0));
        assert!(killed.is_empty());

        let snapshot = world.snapshot();
        let (x, y) = snapshot[0].view.pos;
        assert_approx_eq!(x, 115.0, 1e-4);
        assert_approx_eq!(y, 100.0, 1e-4);
    }

    #[tokio::test]
    async fn test_overlapping_pair_loses_exactly_one_member() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut world = World::new(WorldConfig::default());
        let (alice, _c1) = session_at(1, "alice", (100.0, 100.0)).await;
        let (bob, _c2) = session_at(2, "bob", (110.0, 110.0)).await;
        world.register(alice).unwrap();
        world.register(bob).unwrap();

        let killed = world.tick(0.0, &mut rng);

        assert_eq!(killed.len(), 1);
        assert_eq!(world.len(), 1);
        let survivor = world.snapshot();
        assert_ne!(survivor[0].handle.username, killed[0].username);
    }

    #[tokio::test]
    async fn test_disjoint_players_never_die() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut world = World::new(WorldConfig::default());
        let (alice, _c1) = session_at(1, "alice", (0.0, 0.0)).await;
        let (bob, _c2) = session_at(2, "bob", (400.0, 400.0)).await;
        world.register(alice).unwrap();
        world.register(bob).unwrap();

        for _ in 0..10 {
            assert!(world.tick(0.0, &mut rng).is_empty());
        }
        assert_eq!(world.len(), 2);
    }

    #[tokio::test]
    async fn test_killed_players_drop_out_of_snapshots() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut world = World::new(WorldConfig::default());
        let (alice, _c1) = session_at(1, "alice", (100.0, 100.0)).await;
        let (bob, _c2) = session_at(2, "bob", (105.0, 105.0)).await;
        let (carol, _c3) = session_at(3, "carol", (400.0, 400.0)).await;
        world.register(alice).unwrap();
        world.register(bob).unwrap();
        world.register(carol).unwrap();

        let killed = world.tick(0.0, &mut rng);
        assert_eq!(killed.len(), 1);

        let snapshot = world.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot
            .iter()
            .all(|entry| entry.handle.username != killed[0].username));
    }

    #[tokio::test]
    async fn test_concurrent_registration_admits_exactly_one() {
        let world = Arc::new(Mutex::new(World::new(WorldConfig::default())));

        let mut attempts = Vec::new();
        for id in 0..8u32 {
            let world = Arc::clone(&world);
            attempts.push(tokio::spawn(async move {
                let (session, client) = session_at(id, "alice", (10.0, 10.0)).await;
                let result = world.lock().await.register(session);
                // keep the socket alive until the registration attempt is done
                drop(client);
                result.is_ok()
            }));
        }

        let mut admitted = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(world.lock().await.len(), 1);
    }
}
