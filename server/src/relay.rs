//! UDP relay engine handling packet dispatch, authentication, and audio
//! fan-out.

use crate::cache::{AccountCache, ProximityCache};
use crate::priority::{should_filter_voice, PriorityRegistry};
use crate::session::SessionTable;
use crate::slots::SpeakerSlots;
use crate::spatial::SpatialGrid;
use crate::stats::RelayStats;
use crate::world::{AccountSnapshot, BotHandle, DirectoryHandle};
use log::{debug, error, info, warn};
use serde::Serialize;
use shared::{
    control_tag, decode_control_body, decode_uplink, encode_control, encode_downlink,
    AuthRequest, ControlResponse, ControlTag, PlayerId, PrioRequest, SettingCommand, WireError,
    ACCOUNT_CACHE_TTL_MS, DEFAULT_PORT, MAX_SPEAKERS_PER_LISTENER, NEARBY_CACHE_TTL_MS, PONG,
    SESSION_IDLE_SECS, SLOT_STALE_MS, TAG_AUTH_RESPONSE, TAG_PRIO_RESPONSE, VOICE_RANGE,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Errors surfaced by per-packet processing. Each aborts only its own unit
/// of work; the receive loop continues unconditionally.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed packet: {0}")]
    Malformed(#[from] WireError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunables for the relay. Defaults follow the protocol constants.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub voice_range: f32,
    pub max_speakers: usize,
    pub nearby_ttl: Duration,
    pub account_ttl: Duration,
    pub slot_stale: Duration,
    pub session_idle: Duration,
    pub sweep_interval: Duration,
    pub stats_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            voice_range: VOICE_RANGE,
            max_speakers: MAX_SPEAKERS_PER_LISTENER,
            nearby_ttl: Duration::from_millis(NEARBY_CACHE_TTL_MS),
            account_ttl: Duration::from_millis(ACCOUNT_CACHE_TTL_MS),
            slot_stale: Duration::from_millis(SLOT_STALE_MS),
            session_idle: Duration::from_secs(SESSION_IDLE_SECS),
            sweep_interval: Duration::from_secs(60 * 60),
            stats_interval: Duration::from_secs(60),
        }
    }
}

/// Shared relay state: every table is a concurrent map guarded at entry
/// granularity, so packets from different speakers process in parallel.
pub struct RelayState {
    pub sessions: SessionTable,
    pub grid: Arc<SpatialGrid>,
    pub proximity: ProximityCache,
    pub accounts: AccountCache,
    pub slots: SpeakerSlots,
    pub priorities: PriorityRegistry,
    pub stats: RelayStats,
    directory: DirectoryHandle,
    bots: BotHandle,
}

impl RelayState {
    pub fn new(config: &RelayConfig, directory: DirectoryHandle, bots: BotHandle) -> Self {
        let grid = Arc::new(SpatialGrid::new(config.voice_range));
        Self {
            sessions: SessionTable::new(),
            proximity: ProximityCache::new(
                directory.clone(),
                bots.clone(),
                grid.clone(),
                config.nearby_ttl,
                config.voice_range,
            ),
            accounts: AccountCache::new(directory.clone(), config.account_ttl),
            slots: SpeakerSlots::new(config.max_speakers, config.slot_stale),
            priorities: PriorityRegistry::new(),
            stats: RelayStats::new(),
            grid,
            directory,
            bots,
        }
    }

    /// Dispatches one datagram by its 4-byte tag; anything untagged of at
    /// least 2 bytes is audio.
    pub async fn handle_datagram(
        self: &Arc<Self>,
        socket: &Arc<UdpSocket>,
        datagram: &[u8],
        addr: SocketAddr,
    ) -> Result<(), RelayError> {
        self.stats.record_packet();
        match control_tag(datagram) {
            Some(ControlTag::Auth) => self.handle_auth(socket, datagram, addr).await,
            Some(ControlTag::Prio) => self.handle_prio(socket, datagram, addr).await,
            Some(ControlTag::Ping) => self.handle_ping(socket, addr).await,
            None => self.handle_audio(socket, datagram, addr).await,
        }
    }

    async fn handle_auth(
        self: &Arc<Self>,
        socket: &Arc<UdpSocket>,
        datagram: &[u8],
        addr: SocketAddr,
    ) -> Result<(), RelayError> {
        let request: AuthRequest = match decode_control_body(datagram) {
            Ok(request) => request,
            Err(e) => {
                self.stats.record_malformed();
                debug!("Malformed AUTH from {}: {}", addr, e);
                self.reply(
                    socket,
                    addr,
                    TAG_AUTH_RESPONSE,
                    &ControlResponse::error("Malformed AUTH request"),
                )
                .await;
                return Ok(());
            }
        };

        let player_id = match shared::parse_player_id(&request.player_id) {
            Ok(player_id) => player_id,
            Err(_) => {
                self.stats.record_auth(false);
                self.reply(
                    socket,
                    addr,
                    TAG_AUTH_RESPONSE,
                    &ControlResponse::error("Invalid PlayerId"),
                )
                .await;
                return Ok(());
            }
        };

        // Test bots in the reserved id range skip the credential check
        let verdict: Result<(), &str> = if self.bots.is_test_bot(player_id) {
            Ok(())
        } else {
            match self.accounts.snapshot(player_id) {
                Some(account) if account.voice_credential == request.voice_id => {
                    if self.directory.is_session_active(player_id) {
                        Ok(())
                    } else {
                        Err("Not in game")
                    }
                }
                _ => Err("Invalid VoiceID"),
            }
        };

        match verdict {
            Ok(()) => {
                self.sessions.authenticate(player_id, addr);
                self.stats.record_auth(true);
                self.reply(
                    socket,
                    addr,
                    TAG_AUTH_RESPONSE,
                    &ControlResponse::accepted("Voice session established"),
                )
                .await;
            }
            Err(reason) => {
                self.stats.record_auth(false);
                warn!("AUTH rejected for {} from {}: {}", player_id, addr, reason);
                self.reply(
                    socket,
                    addr,
                    TAG_AUTH_RESPONSE,
                    &ControlResponse::rejected(reason),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn handle_prio(
        self: &Arc<Self>,
        socket: &Arc<UdpSocket>,
        datagram: &[u8],
        addr: SocketAddr,
    ) -> Result<(), RelayError> {
        let request: PrioRequest = match decode_control_body(datagram) {
            Ok(request) => request,
            Err(e) => {
                self.stats.record_malformed();
                debug!("Malformed PRIO from {}: {}", addr, e);
                self.reply(
                    socket,
                    addr,
                    TAG_PRIO_RESPONSE,
                    &ControlResponse::error("Malformed PRIO request"),
                )
                .await;
                return Ok(());
            }
        };

        let player_id = match shared::parse_player_id(&request.player_id) {
            Ok(player_id) => player_id,
            Err(_) => {
                self.reply(
                    socket,
                    addr,
                    TAG_PRIO_RESPONSE,
                    &ControlResponse::error("Invalid PlayerId"),
                )
                .await;
                return Ok(());
            }
        };

        self.sessions.touch(player_id, addr);

        // The command applies to whatever world the sender is currently in
        let position = self
            .directory
            .resolve_position(player_id)
            .or_else(|| self.bots.position_of(player_id));
        let Some(position) = position else {
            self.reply(
                socket,
                addr,
                TAG_PRIO_RESPONSE,
                &ControlResponse::error("Unknown player position"),
            )
            .await;
            return Ok(());
        };

        let command = match SettingCommand::try_from(&request) {
            Ok(command) => command,
            Err(e) => {
                self.reply(
                    socket,
                    addr,
                    TAG_PRIO_RESPONSE,
                    &ControlResponse::error(e.to_string()),
                )
                .await;
                return Ok(());
            }
        };

        let reply = match self.priorities.configure(position.world_id, command) {
            Ok(message) => ControlResponse::success(message),
            Err(message) => ControlResponse::error(message),
        };
        self.reply(socket, addr, TAG_PRIO_RESPONSE, &reply).await;
        Ok(())
    }

    async fn handle_ping(
        self: &Arc<Self>,
        socket: &Arc<UdpSocket>,
        addr: SocketAddr,
    ) -> Result<(), RelayError> {
        if let Some(player_id) = self.sessions.find_by_endpoint(addr) {
            self.sessions.touch(player_id, addr);
        }
        socket.send_to(&PONG, addr).await?;
        Ok(())
    }

    async fn handle_audio(
        self: &Arc<Self>,
        socket: &Arc<UdpSocket>,
        datagram: &[u8],
        addr: SocketAddr,
    ) -> Result<(), RelayError> {
        let (speaker, payload) = match decode_uplink(datagram) {
            Ok(frame) => frame,
            Err(_) => {
                self.stats.record_malformed();
                return Ok(());
            }
        };

        if !self.sessions.touch(speaker, addr) {
            debug!("Audio from unauthenticated id {} at {}", speaker, addr);
            return Ok(());
        }
        self.stats.record_audio(speaker);

        let snapshot = self.proximity.nearby(speaker);
        let Some(position) = snapshot.position else {
            return Ok(());
        };

        // One activation decision per packet
        let priority_active = self
            .priorities
            .should_activate(position.world_id, snapshot.candidates.len());
        let speaker_account = self.accounts.snapshot(speaker);

        for candidate in snapshot.candidates.iter() {
            if candidate.player_id == speaker {
                continue;
            }
            let Some(endpoint) = self.sessions.endpoint_of(candidate.player_id) else {
                continue;
            };

            let listener_account = self.accounts.snapshot(candidate.player_id);
            if ignores(speaker_account.as_deref(), candidate.player_id)
                || ignores(listener_account.as_deref(), speaker)
            {
                continue;
            }

            let mut volume = 1.0f32;
            if priority_active {
                let (has_priority, multiplier) =
                    self.priorities.with_settings(position.world_id, |settings| {
                        let has_priority = settings.has_priority(
                            speaker,
                            speaker_account.as_deref(),
                            listener_account.as_deref(),
                        );
                        (has_priority, settings.volume_multiplier(has_priority))
                    });
                if should_filter_voice(has_priority, multiplier) {
                    continue;
                }
                volume = multiplier;
            }

            if !self
                .slots
                .try_claim(candidate.player_id, speaker, candidate.distance)
            {
                self.stats.record_slot_denial();
                continue;
            }

            let frame = match encode_downlink(speaker, volume, payload) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping oversized audio frame from {}: {}", speaker, e);
                    return Ok(());
                }
            };

            // Fire-and-forget: a failed send is superseded by the next frame
            let socket = Arc::clone(socket);
            let state = Arc::clone(self);
            tokio::spawn(async move {
                match socket.send_to(&frame, endpoint).await {
                    Ok(_) => state.stats.record_relayed(),
                    Err(e) => {
                        state.stats.record_send_failure();
                        debug!("Failed to send audio frame to {}: {}", endpoint, e);
                    }
                }
            });
        }

        Ok(())
    }

    /// Removes a session and every piece of derived state for it.
    pub fn purge_player(&self, player_id: PlayerId) {
        self.sessions.remove(player_id);
        self.grid.remove(player_id);
        self.proximity.invalidate(player_id);
        self.accounts.invalidate(player_id);
        self.slots.remove_listener(player_id);
        self.slots.remove_speaker(player_id);
        self.stats.forget_speaker(player_id);
    }

    async fn reply<T: Serialize>(
        &self,
        socket: &UdpSocket,
        addr: SocketAddr,
        tag: [u8; 4],
        body: &T,
    ) {
        match encode_control(tag, body) {
            Ok(data) => {
                if let Err(e) = socket.send_to(&data, addr).await {
                    self.stats.record_send_failure();
                    debug!("Failed to send reply to {}: {}", addr, e);
                }
            }
            Err(e) => error!("Failed to encode reply: {}", e),
        }
    }
}

fn ignores(account: Option<&AccountSnapshot>, other: PlayerId) -> bool {
    account
        .map(|account| account.ignore_list.contains(&other))
        .unwrap_or(false)
}

/// The relay itself: binds the socket and runs the receive, sweep, and stats
/// loops until stopped.
pub struct VoiceRelay {
    config: RelayConfig,
    state: Arc<RelayState>,
    socket: Option<Arc<UdpSocket>>,
    running: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl VoiceRelay {
    pub fn new(config: RelayConfig, directory: DirectoryHandle, bots: BotHandle) -> Self {
        let state = Arc::new(RelayState::new(&config, directory, bots));
        Self {
            config,
            state,
            socket: None,
            running: Arc::new(AtomicBool::new(false)),
            tasks: Vec::new(),
        }
    }

    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Binds the UDP socket and spawns the receive loop, the idle-session
    /// sweep, and the periodic stats log. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, RelayError> {
        let socket = Arc::new(UdpSocket::bind(&self.config.bind_addr).await?);
        let local_addr = socket.local_addr()?;
        info!("Voice relay listening on {}", local_addr);

        self.running.store(true, Ordering::SeqCst);
        self.socket = Some(Arc::clone(&socket));

        self.spawn_receive_loop(Arc::clone(&socket));
        self.spawn_sweep_loop();
        self.spawn_stats_loop();

        Ok(local_addr)
    }

    fn spawn_receive_loop(&mut self, socket: Arc<UdpSocket>) {
        let state = Arc::clone(&self.state);
        let running = Arc::clone(&self.running);

        self.tasks.push(tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            while running.load(Ordering::SeqCst) {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        // Dispatch without blocking the next receive
                        let datagram = buffer[..len].to_vec();
                        let socket = Arc::clone(&socket);
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = state.handle_datagram(&socket, &datagram, addr).await {
                                debug!("Dropped packet from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }));
    }

    fn spawn_sweep_loop(&mut self) {
        let state = Arc::clone(&self.state);
        let running = Arc::clone(&self.running);
        let sweep_interval = self.config.sweep_interval;
        let session_idle = self.config.session_idle;

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.tick().await; // the first tick fires immediately

            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                let swept = state.sessions.sweep_idle(session_idle);
                for player_id in &swept {
                    state.grid.remove(*player_id);
                    state.proximity.invalidate(*player_id);
                    state.accounts.invalidate(*player_id);
                    state.slots.remove_listener(*player_id);
                    state.slots.remove_speaker(*player_id);
                    state.stats.forget_speaker(*player_id);
                }
                state.grid.cleanup_empty_cells();

                if !swept.is_empty() {
                    info!("Swept {} idle voice sessions", swept.len());
                }
            }
        }));
    }

    fn spawn_stats_loop(&mut self) {
        let state = Arc::clone(&self.state);
        let running = Arc::clone(&self.running);
        let stats_interval = self.config.stats_interval;

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(stats_interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                let snap = state.stats.snapshot(
                    state.sessions.len(),
                    state.grid.len(),
                    state.grid.occupied_cells(),
                );
                debug!(
                    "Relay stats: {} sessions, {} active speakers, {} tracked, {} cells, \
                     {} packets in, {} frames relayed, {} slot denials",
                    snap.authenticated_sessions,
                    snap.active_speakers,
                    snap.tracked_players,
                    snap.occupied_cells,
                    snap.packets_received,
                    snap.frames_relayed,
                    snap.slot_denials
                );
            }
        }));
    }

    /// Cooperative shutdown: in-flight sends are not drained, which is
    /// acceptable for loss-tolerant audio.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.socket = None;
        info!("Voice relay stopped");
    }
}

impl Drop for VoiceRelay {
    fn drop(&mut self) {
        self.stop();
    }
}
