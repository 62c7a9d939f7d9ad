//! Player slot reservations.
//!
//! The server has `max_players` slots numbered `0..max_players`. A connection
//! must hold a reservation from the moment it identifies until it leaves, and
//! each phase of the handshake renews the reservation with a different expiry:
//!
//! | phase        | expiry                                  |
//! |--------------|-----------------------------------------|
//! | connecting   | now + 60s                               |
//! | loading      | now + idle limit, or indefinite         |
//! | playing      | now + online quota, or indefinite       |
//!
//! A background sweep reclaims every finite reservation whose expiry has
//! passed. Indefinite reservations are only removed by [`SlotManager::release`].
//! All mutation happens under one lock, so a slot is never granted twice.
//!
//! Slot ids are reused as soon as a reservation goes away, so holders work
//! with a [`Lease`] rather than the bare id. A lease names one particular
//! reservation; once that reservation is swept or released the lease is dead
//! and every operation on it fails with [`SlotError::NotReserved`], even after
//! the same id has been granted to someone else.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netbeams_config::Config;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::player::Player;
use crate::service::{Service, ServiceError, ServiceStatus, StatusWatch};

/// Index of a player slot, in `0..max_players`.
pub type SlotId = u32;

/// How long a freshly identified connection may hold a slot.
pub const CONNECTION_HOLD: Duration = Duration::from_secs(60);

/// Interval between sweeps of expired reservations.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Ownership of one specific reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lease {
    id: SlotId,
    generation: u64,
}

impl Lease {
    pub fn id(&self) -> SlotId {
        self.id
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.generation)
    }
}

/// When a reservation lapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Never swept.
    Indefinite,
    At(Instant),
}

impl Expiry {
    /// `now + limit`, or [`Expiry::Indefinite`] when there is no limit.
    pub fn after(now: Instant, limit: Option<Duration>) -> Self {
        limit.map_or(Self::Indefinite, |d| Self::At(now + d))
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self, Self::At(at) if *at <= now)
    }
}

/// Errors returned by [`SlotManager`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    #[error("server is full")]
    ServerFull,

    /// The lease's reservation no longer exists.
    #[error("slot {0} is not reserved")]
    NotReserved(SlotId),

    /// Another slot is already bound to a player with the same public key.
    #[error("player is already connected on slot {0}")]
    AlreadyConnected(SlotId),
}

#[derive(Debug)]
struct Reservation {
    generation: u64,
    expiry: Expiry,
    player: Option<Arc<Player>>,
}

#[derive(Debug)]
struct SlotTable {
    slots: Vec<Option<Reservation>>,
    next_generation: u64,
}

impl SlotTable {
    fn new(size: u32) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(size as usize).collect(),
            next_generation: 0,
        }
    }

    fn get(&self, id: SlotId) -> Option<&Reservation> {
        self.slots.get(id as usize)?.as_ref()
    }

    /// The reservation `lease` was issued for, if it is still alive.
    fn held_mut(&mut self, lease: Lease) -> Option<&mut Reservation> {
        self.slots
            .get_mut(lease.id as usize)?
            .as_mut()
            .filter(|r| r.generation == lease.generation)
    }

    fn holds(&self, lease: Lease) -> bool {
        self.get(lease.id)
            .is_some_and(|r| r.generation == lease.generation)
    }

    fn reserve_lowest(&mut self, expiry: Expiry) -> Option<Lease> {
        let (index, entry) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, entry)| entry.is_none())?;

        let generation = self.next_generation;
        self.next_generation += 1;
        *entry = Some(Reservation {
            generation,
            expiry,
            player: None,
        });
        Some(Lease {
            id: index as SlotId,
            generation,
        })
    }

    fn renew(&mut self, lease: Lease, expiry: Expiry) -> Result<Lease, SlotError> {
        let reservation = self
            .held_mut(lease)
            .ok_or(SlotError::NotReserved(lease.id))?;
        reservation.expiry = expiry;
        Ok(lease)
    }

    fn release(&mut self, lease: Lease) -> bool {
        if !self.holds(lease) {
            return false;
        }
        self.slots
            .get_mut(lease.id as usize)
            .is_some_and(|entry| entry.take().is_some())
    }

    fn sweep(&mut self, now: Instant) -> Vec<SlotId> {
        let mut released = Vec::new();
        for (index, entry) in self.slots.iter_mut().enumerate() {
            if entry.as_ref().is_some_and(|r| r.expiry.is_expired(now)) {
                *entry = None;
                released.push(index as SlotId);
            }
        }
        released
    }

    fn reserved(&self) -> impl Iterator<Item = (SlotId, &Reservation)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| entry.as_ref().map(|r| (index as SlotId, r)))
    }

    /// Drop every reservation. Generations keep counting so no old lease
    /// comes back to life.
    fn clear(&mut self) {
        self.slots.iter_mut().for_each(|entry| *entry = None);
    }
}

/// Arbiter of the fixed player-slot space.
pub struct SlotManager {
    table: Arc<Mutex<SlotTable>>,
    max_players: u32,
    idle_limit: Option<Duration>,
    online_quota: Option<Duration>,
    sweep_interval: Duration,
    status: StatusWatch,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SlotManager {
    /// Create a manager with `max_players` slots.
    ///
    /// `idle_limit` bounds the map-load reservation and `online_quota` the
    /// gameplay reservation; `None` makes the respective hold indefinite.
    pub fn new(max_players: u32, idle_limit: Option<Duration>, online_quota: Option<Duration>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            table: Arc::new(Mutex::new(SlotTable::new(max_players))),
            max_players,
            idle_limit,
            online_quota,
            sweep_interval: SWEEP_INTERVAL,
            status: StatusWatch::new(),
            shutdown_tx,
            sweeper: Mutex::new(None),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.general.max_players,
            config.auth.idle.duration(),
            config.auth.online.duration(),
        )
    }

    /// Override how often the background sweep runs.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn max_players(&self) -> u32 {
        self.max_players
    }

    /// Hold a slot for a connection that just identified itself.
    ///
    /// With `Some(lease)` of a live reservation, that reservation is refreshed
    /// to [`CONNECTION_HOLD`]. Otherwise the lowest free slot is reserved under
    /// a new lease.
    pub async fn reserve_for_connection(&self, existing: Option<Lease>) -> Result<Lease, SlotError> {
        let expiry = Expiry::At(Instant::now() + CONNECTION_HOLD);
        let mut table = self.table.lock().await;

        if let Some(lease) = existing
            && let Some(reservation) = table.held_mut(lease)
        {
            reservation.expiry = expiry;
            return Ok(lease);
        }

        let lease = table.reserve_lowest(expiry).ok_or(SlotError::ServerFull)?;
        tracing::debug!(slot = lease.id, "Reserved slot for connection");
        Ok(lease)
    }

    /// Extend a reservation while the client loads the map.
    pub async fn reserve_for_load(&self, lease: Lease) -> Result<Lease, SlotError> {
        let expiry = Expiry::after(Instant::now(), self.idle_limit);
        self.table.lock().await.renew(lease, expiry)
    }

    /// Extend a reservation for the gameplay session.
    pub async fn reserve_for_play(&self, lease: Lease) -> Result<Lease, SlotError> {
        let expiry = Expiry::after(Instant::now(), self.online_quota);
        self.table.lock().await.renew(lease, expiry)
    }

    /// Attach an authenticated player to a held slot.
    pub async fn bind_player(&self, lease: Lease, player: Arc<Player>) -> Result<(), SlotError> {
        let mut table = self.table.lock().await;

        if !player.public_key().is_empty()
            && let Some((other, _)) = table.reserved().find(|(other, r)| {
                *other != lease.id
                    && r.player
                        .as_ref()
                        .is_some_and(|p| p.public_key() == player.public_key())
            })
        {
            return Err(SlotError::AlreadyConnected(other));
        }

        let reservation = table
            .held_mut(lease)
            .ok_or(SlotError::NotReserved(lease.id))?;
        reservation.player = Some(player);
        Ok(())
    }

    /// Drop the lease's reservation and its bound player.
    ///
    /// Returns whether the reservation was still alive. A dead lease never
    /// touches whoever holds the id now.
    pub async fn release(&self, lease: Lease) -> bool {
        let released = self.table.lock().await.release(lease);
        if released {
            tracing::debug!(slot = lease.id, "Released slot");
        }
        released
    }

    /// Release every finite reservation that expired at or before `now`.
    pub async fn sweep_at(&self, now: Instant) -> Vec<SlotId> {
        self.table.lock().await.sweep(now)
    }

    pub async fn sweep(&self) -> Vec<SlotId> {
        self.sweep_at(Instant::now()).await
    }

    pub async fn player(&self, id: SlotId) -> Option<Arc<Player>> {
        self.table.lock().await.get(id)?.player.clone()
    }

    /// Number of slots with a bound player.
    pub async fn player_count(&self) -> usize {
        self.table
            .lock()
            .await
            .reserved()
            .filter(|(_, r)| r.player.is_some())
            .count()
    }

    pub async fn reserved_count(&self) -> usize {
        self.table.lock().await.reserved().count()
    }

    /// Whether anyone holds slot `id`.
    pub async fn is_reserved(&self, id: SlotId) -> bool {
        self.table.lock().await.get(id).is_some()
    }

    /// Whether the reservation behind `lease` is still alive.
    pub async fn holds(&self, lease: Lease) -> bool {
        self.table.lock().await.holds(lease)
    }

    /// Whether a new connection could get a slot right now.
    pub async fn has_capacity(&self) -> bool {
        self.reserved_count().await < self.max_players as usize
    }
}

#[async_trait]
impl Service for SlotManager {
    fn name(&self) -> &str {
        "Player Manager"
    }

    fn status_watch(&self) -> &StatusWatch {
        &self.status
    }

    async fn start(&self) -> Result<ServiceStatus, ServiceError> {
        self.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let table = Arc::clone(&self.table);
        let interval = self.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let released = table.lock().await.sweep(Instant::now());
                        if !released.is_empty() {
                            tracing::info!(?released, "Released expired reservations");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        *self.sweeper.lock().await = Some(handle);
        tracing::info!(slots = self.max_players, "Player Manager started");
        Ok(ServiceStatus::Healthy)
    }

    async fn stop(&self) -> Result<ServiceStatus, ServiceError> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.await?;
        }
        Ok(ServiceStatus::Shutdown)
    }

    async fn cleanup(&self) -> Result<(), ServiceError> {
        self.table.lock().await.clear();
        Ok(())
    }
}
