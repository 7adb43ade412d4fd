//! # Session Module
//!
//! Per-guild playback state machine.
//!
//! A session is Idle until its first play, then moves between Playing and
//! Paused, and falls back to Idle when the queue runs out with loop off.
//! All commands and backend events for one guild are serialized through a
//! single session-scoped async mutex: queue mutations never interleave.
//!
//! End-of-track dispatch priority: loop=track replay, queue pop, loop=queue
//! re-append, autoplay hint, Idle. Backend playback faults are absorbed
//! here — the session advances and notifies, it never raises.

pub mod effects;
pub mod queue;
pub mod votes;

use std::{collections::HashSet, sync::Arc, time::Instant};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cache::{CachedValue, Namespace, ResultCache},
    cache::prefetch::PrefetchModel,
    config::Config,
    error::PlayerError,
    model::{EndReason, GuildId, QueuedTrack, Track, UserId},
    node::{
        client::{ManagedNode, NodeClient},
        protocol::{NodeEvent, PlayerOp, WireEndReason},
    },
    orchestrator::{PlayHook, PlayerEvent},
    session::{
        effects::{Effect, EffectSet},
        queue::{LoopMode, TrackQueue},
        votes::{SkipVotes, VoteOutcome},
    },
};

/// Estado de reproducción de la sesión
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Idle,
    Playing,
    Paused,
}

/// Contadores acumulados de la sesión
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub tracks_played: u64,
    pub total_play_ms: u64,
    unique_listeners: HashSet<UserId>,
}

impl SessionCounters {
    pub fn unique_listeners(&self) -> usize {
        self.unique_listeners.len()
    }
}

/// Resultado de un intento de encolar
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    /// No había nada sonando: el track arrancó de inmediato
    Started(QueuedTrack),
    /// Quedó en cola en la posición indicada
    Queued { position: usize },
}

/// Resultado de un intento de skip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipResult {
    NoTrack,
    Registered { votes: usize, required: usize },
    Duplicate { votes: usize, required: usize },
    Skipped,
    NotAllowed,
}

#[derive(Debug)]
struct SessionState {
    play_state: PlayState,
    queue: TrackQueue,
    current: Option<QueuedTrack>,
    started_at: Option<Instant>,
    loop_mode: LoopMode,
    shuffle: bool,
    autoplay: bool,
    votes: SkipVotes,
    effects: EffectSet,
    listener_count: usize,
    counters: SessionCounters,
    last_activity: Instant,
    /// Nodo asignado a esta sesión; se elige en el primer play
    node: Option<Arc<ManagedNode>>,
    /// Último track reproducido, semilla del predictor y del autoplay
    last_played: Option<Arc<Track>>,
}

/// Foto del estado de la sesión para reportes
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub guild_id: GuildId,
    pub play_state: PlayState,
    pub current_title: Option<String>,
    pub queue_len: usize,
    pub tracks_played: u64,
    pub total_play_ms: u64,
    pub unique_listeners: usize,
}

/// Sesión de reproducción de un guild
pub struct Session {
    guild_id: GuildId,
    region: Option<String>,
    state: Mutex<SessionState>,
    nodes: Arc<NodeClient>,
    cache: Arc<ResultCache>,
    prefetch: Arc<PrefetchModel>,
    events: broadcast::Sender<PlayerEvent>,
    hook: Arc<dyn PlayHook>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        guild_id: GuildId,
        region: Option<String>,
        config: &Config,
        nodes: Arc<NodeClient>,
        cache: Arc<ResultCache>,
        prefetch: Arc<PrefetchModel>,
        events: broadcast::Sender<PlayerEvent>,
        hook: Arc<dyn PlayHook>,
    ) -> Self {
        Self {
            guild_id,
            region,
            state: Mutex::new(SessionState {
                play_state: PlayState::Idle,
                queue: TrackQueue::new(config.max_queue_size, config.max_history),
                current: None,
                started_at: None,
                loop_mode: LoopMode::Off,
                shuffle: false,
                autoplay: config.enable_autoplay,
                votes: SkipVotes::new(),
                effects: EffectSet::new(),
                listener_count: 0,
                counters: SessionCounters::default(),
                last_activity: Instant::now(),
                node: None,
                last_played: None,
            }),
            nodes,
            cache,
            prefetch,
            events,
            hook,
            cancel: CancellationToken::new(),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Encola un track; si no hay nada sonando arranca de inmediato
    pub async fn enqueue(
        &self,
        track: Arc<Track>,
        requester: UserId,
        position: Option<usize>,
    ) -> Result<EnqueueOutcome, PlayerError> {
        let mut st = self.state.lock().await;
        st.last_activity = Instant::now();

        let item = QueuedTrack::new(track, requester);
        if st.current.is_none() {
            self.start_playback(&mut st, item.clone()).await?;
            Ok(EnqueueOutcome::Started(item))
        } else {
            let position = st.queue.add(item, position)?;
            Ok(EnqueueOutcome::Queued { position })
        }
    }

    /// Reemplaza el track actual de inmediato sin tocar el resto de la
    /// cola. El nodo emite un fin con motivo `Replaced` que no
    /// re-despacha, el reemplazo ya ocurrió acá.
    pub async fn play_now(&self, track: Arc<Track>, requester: UserId) -> Result<(), PlayerError> {
        let mut st = self.state.lock().await;
        st.last_activity = Instant::now();

        if let Some(replaced) = st.current.take() {
            if let Some(started) = st.started_at.take() {
                st.counters.total_play_ms += started.elapsed().as_millis() as u64;
            }
            st.queue.push_history(replaced.clone());
            let _ = self.events.send(PlayerEvent::TrackEnded {
                guild: self.guild_id,
                track: replaced.track.clone(),
                reason: EndReason::Replaced,
            });
        }

        self.start_playback(&mut st, QueuedTrack::new(track, requester))
            .await
    }

    fn ensure_node(&self, st: &mut SessionState) -> Result<Arc<ManagedNode>, PlayerError> {
        if let Some(node) = &st.node {
            if node.is_healthy() {
                return Ok(node.clone());
            }
        }

        let node = self.nodes.get_best_node(self.region.as_deref())?;
        st.node = Some(node.clone());
        Ok(node)
    }

    /// Fija el track actual y lo lanza en el nodo. Cualquier cambio de
    /// track descarta los votos de skip pendientes.
    async fn start_playback(
        &self,
        st: &mut SessionState,
        item: QueuedTrack,
    ) -> Result<(), PlayerError> {
        let node = self.ensure_node(st)?;

        self.nodes
            .update_player(
                &node,
                self.guild_id,
                PlayerOp::Play {
                    uri: item.track.uri.clone(),
                    position_ms: 0,
                },
            )
            .await?;

        st.votes.clear();
        st.play_state = PlayState::Playing;
        st.started_at = Some(Instant::now());
        st.counters.tracks_played += 1;

        self.prefetch
            .record_play(st.last_played.as_deref(), &item.track);
        st.last_played = Some(item.track.clone());

        // El track queda en el caché para autoplay y prefetch
        self.cache.put(
            Namespace::Track,
            item.track.id.clone(),
            CachedValue::Track(item.track.clone()),
            None,
        );

        info!(
            "🎵 Reproduciendo en guild {}: {} (pedido por {})",
            self.guild_id, item.track.title, item.requested_by
        );

        let _ = self.events.send(PlayerEvent::TrackStarted {
            guild: self.guild_id,
            track: item.track.clone(),
        });
        self.hook
            .record_play(self.guild_id, item.requested_by, item.track.clone())
            .await;

        st.current = Some(item);
        Ok(())
    }

    /// Despacha un evento asíncrono del nodo para esta sesión. Las fallas
    /// de reproducción se absorben: avanzan al siguiente track y se
    /// notifican como evento, nunca como error.
    pub async fn handle_node_event(&self, event: NodeEvent) {
        match event {
            NodeEvent::TrackStart { .. } => {
                // El estado ya se fijó en start_playback
            }
            NodeEvent::TrackEnd { reason, .. } => {
                if !reason.may_start_next() {
                    debug!(
                        "Fin de track por {:?} en guild {}: sin re-despacho",
                        reason, self.guild_id
                    );
                } else if reason == WireEndReason::LoadFailed {
                    // Un track incargable avanza como falla: los modos de
                    // repetición no deben volver a intentarlo
                    warn!("⚠️ El nodo no pudo cargar el track en guild {}", self.guild_id);
                    self.advance(EndReason::Fault).await;
                } else {
                    self.advance(EndReason::Finished).await;
                }
            }
            NodeEvent::TrackException { message, .. } => {
                warn!("💥 Excepción de track en guild {}: {}", self.guild_id, message);
                let _ = self.events.send(PlayerEvent::PlaybackFault {
                    guild: self.guild_id,
                    message,
                });
                self.advance(EndReason::Fault).await;
            }
            NodeEvent::TrackStuck { threshold_ms, .. } => {
                warn!(
                    "🧊 Track atascado en guild {} ({} ms sin progreso)",
                    self.guild_id, threshold_ms
                );
                let _ = self.events.send(PlayerEvent::PlaybackFault {
                    guild: self.guild_id,
                    message: format!("track atascado tras {} ms", threshold_ms),
                });
                self.advance(EndReason::Fault).await;
            }
        }
    }

    /// Avanza al siguiente track según la prioridad de modos
    pub async fn advance(&self, reason: EndReason) {
        let mut st = self.state.lock().await;
        self.advance_locked(&mut st, reason).await;
    }

    async fn advance_locked(&self, st: &mut SessionState, reason: EndReason) {
        st.last_activity = Instant::now();
        st.votes.clear();

        let finished = st.current.take();
        if let Some(finished) = &finished {
            if let Some(started) = st.started_at.take() {
                st.counters.total_play_ms += started.elapsed().as_millis() as u64;
            }
            st.queue.push_history(finished.clone());

            // Un track que falló sale del caché: no queremos que el
            // autoplay lo vuelva a sugerir
            if reason == EndReason::Fault {
                self.cache.remove(Namespace::Track, &finished.track.id);
            }

            let _ = self.events.send(PlayerEvent::TrackEnded {
                guild: self.guild_id,
                track: finished.track.clone(),
                reason,
            });
        }

        // Prioridad: loop=track → cola → loop=queue → autoplay → Idle
        let next = match (&finished, reason, st.loop_mode) {
            (Some(finished), EndReason::Finished, LoopMode::Track) => {
                info!("🔂 Repitiendo track en guild {}: {}", self.guild_id, finished.track.title);
                Some(finished.clone())
            }
            _ => {
                if let (Some(finished), EndReason::Finished, LoopMode::Queue) =
                    (&finished, reason, st.loop_mode)
                {
                    debug!("🔁 Track re-encolado al final: {}", finished.track.title);
                    st.queue.push_back(finished.clone());
                }
                st.queue.pop_next()
            }
        };

        match next {
            Some(item) => {
                if let Err(e) = self.start_playback(st, item).await {
                    error!(
                        "❌ No se pudo arrancar el siguiente track en guild {}: {}",
                        self.guild_id, e
                    );
                    self.go_idle(st);
                }
            }
            None if st.autoplay => {
                let requester = finished
                    .as_ref()
                    .map(|f| f.requested_by)
                    .unwrap_or(UserId(0));

                match self.autoplay_candidate(st).await {
                    Some(track) => {
                        let item = QueuedTrack::new(track, requester);
                        if let Err(e) = self.start_playback(st, item).await {
                            error!("❌ Autoplay falló en guild {}: {}", self.guild_id, e);
                            self.go_idle(st);
                        }
                    }
                    None => self.go_idle(st),
                }
            }
            None => self.go_idle(st),
        }
    }

    fn go_idle(&self, st: &mut SessionState) {
        st.play_state = PlayState::Idle;
        st.current = None;
        st.started_at = None;
        info!("📭 Sesión de guild {} en reposo", self.guild_id);
        let _ = self.events.send(PlayerEvent::SessionIdle {
            guild: self.guild_id,
        });
    }

    /// Candidato de autoplay: primero la pista del predictor, después una
    /// búsqueda tipo radio por artista. Best-effort y cancelable; las
    /// fallas se ignoran en silencio.
    async fn autoplay_candidate(&self, st: &SessionState) -> Option<Arc<Track>> {
        let seed = st.last_played.clone()?;

        let fetch = async {
            for prediction in self.prefetch.predict_next(&seed) {
                if let Some(CachedValue::Track(track)) =
                    self.cache.get(Namespace::Track, &prediction.track_id)
                {
                    if track.id != seed.id {
                        debug!("🔮 Autoplay por predictor: {}", track.title);
                        return Some(track);
                    }
                }
            }

            let artist = seed.artist.as_deref()?;
            let next_artist = self
                .prefetch
                .predict_artist(artist)
                .unwrap_or_else(|| artist.to_string());

            match self.nodes.search(&format!("{} mix", next_artist)).await {
                Ok(tracks) => tracks.into_iter().find(|t| t.id != seed.id),
                Err(_) => None,
            }
        };

        // El teardown de la sesión cancela el fetch en vuelo
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            candidate = fetch => candidate,
        }
    }

    /// Voto de skip. El quórum se recalcula con los oyentes vigentes
    /// justo antes de contar; al alcanzarlo el skip se ejecuta
    /// exactamente una vez.
    pub async fn vote_skip(&self, user: UserId) -> Result<SkipResult, PlayerError> {
        let mut st = self.state.lock().await;
        if st.current.is_none() {
            return Ok(SkipResult::NoTrack);
        }

        let listeners = st.listener_count;
        match st.votes.add_vote(user, listeners) {
            VoteOutcome::Passed => {
                info!("🗳️ Quórum de skip alcanzado en guild {}", self.guild_id);
                self.commit_skip(&mut st).await?;
                Ok(SkipResult::Skipped)
            }
            VoteOutcome::Registered { votes, required } => {
                debug!(
                    "🗳️ Voto de skip {}/{} en guild {}",
                    votes, required, self.guild_id
                );
                Ok(SkipResult::Registered { votes, required })
            }
            VoteOutcome::Duplicate { votes, required } => {
                Ok(SkipResult::Duplicate { votes, required })
            }
        }
    }

    /// Skip incondicional: permitido al requester del track actual o a un
    /// usuario privilegiado
    pub async fn force_skip(&self, user: UserId, privileged: bool) -> Result<SkipResult, PlayerError> {
        let mut st = self.state.lock().await;
        let Some(current) = &st.current else {
            return Ok(SkipResult::NoTrack);
        };

        if !privileged && current.requested_by != user {
            return Ok(SkipResult::NotAllowed);
        }

        self.commit_skip(&mut st).await?;
        Ok(SkipResult::Skipped)
    }

    async fn commit_skip(&self, st: &mut SessionState) -> Result<(), PlayerError> {
        st.votes.clear();

        // El Stop genera un TrackEnd(Stopped) del nodo que no re-despacha;
        // el avance lo hacemos nosotros aquí
        if let Some(node) = st.node.clone() {
            if let Err(e) = self
                .nodes
                .update_player(&node, self.guild_id, PlayerOp::Stop)
                .await
            {
                warn!("⚠️ Stop falló en guild {}: {}", self.guild_id, e);
            }
        }

        self.advance_locked(st, EndReason::Skipped).await;
        Ok(())
    }

    pub async fn set_paused(&self, paused: bool) -> Result<(), PlayerError> {
        let mut st = self.state.lock().await;
        if st.current.is_none() {
            return Ok(());
        }

        let node = st.node.clone().ok_or(PlayerError::NodeUnavailable)?;
        self.nodes
            .update_player(&node, self.guild_id, PlayerOp::Pause(paused))
            .await?;

        st.play_state = if paused {
            PlayState::Paused
        } else {
            PlayState::Playing
        };
        st.last_activity = Instant::now();
        info!(
            "{} guild {}",
            if paused { "⏸️ Pausado" } else { "▶️ Reanudado" },
            self.guild_id
        );
        Ok(())
    }

    pub async fn seek(&self, position_ms: u64) -> Result<(), PlayerError> {
        let mut st = self.state.lock().await;
        if st.current.is_none() {
            return Ok(());
        }

        let node = st.node.clone().ok_or(PlayerError::NodeUnavailable)?;
        self.nodes
            .update_player(&node, self.guild_id, PlayerOp::Seek(position_ms))
            .await?;
        st.last_activity = Instant::now();
        Ok(())
    }

    pub async fn set_volume(&self, volume: u16) -> Result<(), PlayerError> {
        let st = self.state.lock().await;
        let node = st.node.clone().ok_or(PlayerError::NodeUnavailable)?;
        self.nodes
            .update_player(&node, self.guild_id, PlayerOp::Volume(volume.min(200)))
            .await
    }

    /// Detiene la reproducción y limpia la cola
    pub async fn stop(&self) -> Result<(), PlayerError> {
        let mut st = self.state.lock().await;
        st.queue.clear();
        st.votes.clear();

        if st.current.take().is_some() {
            if let Some(node) = st.node.clone() {
                let _ = self
                    .nodes
                    .update_player(&node, self.guild_id, PlayerOp::Stop)
                    .await;
            }
        }

        self.go_idle(&mut st);
        info!("⏹️ Reproducción detenida en guild {}", self.guild_id);
        Ok(())
    }

    pub async fn set_loop_mode(&self, mode: LoopMode) {
        let mut st = self.state.lock().await;
        st.loop_mode = mode;
        match mode {
            LoopMode::Off => info!("➡️ Repetición desactivada en guild {}", self.guild_id),
            LoopMode::Track => info!("🔂 Repetir canción en guild {}", self.guild_id),
            LoopMode::Queue => info!("🔁 Repetir cola en guild {}", self.guild_id),
        }
    }

    /// Activar el shuffle mezcla la cola reteniendo el orden previo;
    /// desactivarlo restaura ese orden exacto
    pub async fn set_shuffle(&self, enabled: bool) {
        let mut st = self.state.lock().await;
        if enabled == st.shuffle {
            return;
        }

        st.shuffle = enabled;
        if enabled {
            st.queue.shuffle();
        } else {
            st.queue.restore();
        }
    }

    pub async fn set_autoplay(&self, enabled: bool) {
        let mut st = self.state.lock().await;
        st.autoplay = enabled;
    }

    /// Toggle de un efecto con nombre; el payload de filtros completo se
    /// reenvía al nodo en cada cambio. Retorna `None` si el nombre no
    /// corresponde a ningún efecto.
    pub async fn toggle_effect(&self, name: &str) -> Result<Option<bool>, PlayerError> {
        let Some(effect) = Effect::parse(name) else {
            return Ok(None);
        };

        let mut st = self.state.lock().await;
        let active = st.effects.toggle(effect);
        let filters = st.effects.to_filters();

        if let Some(node) = st.node.clone() {
            self.nodes
                .update_player(&node, self.guild_id, PlayerOp::Filters(filters))
                .await?;
        }

        Ok(Some(active))
    }

    /// Actualiza los oyentes conectados (sin bots); alimenta el quórum de
    /// votos y el contador de oyentes únicos
    pub async fn update_listeners(&self, listeners: &[UserId]) {
        let mut st = self.state.lock().await;
        st.listener_count = listeners.len();
        st.counters.unique_listeners.extend(listeners.iter().copied());
        if !listeners.is_empty() {
            st.last_activity = Instant::now();
        }
    }

    /// Operaciones de edición de cola expuestas a la capa de presentación
    pub async fn queue_remove(&self, position: usize) -> Result<QueuedTrack, PlayerError> {
        let mut st = self.state.lock().await;
        st.queue.remove(position)
    }

    pub async fn queue_move(&self, from: usize, to: usize) -> Result<(), PlayerError> {
        let mut st = self.state.lock().await;
        st.queue.move_track(from, to)
    }

    pub async fn queue_clear(&self) {
        let mut st = self.state.lock().await;
        st.queue.clear();
    }

    /// Purga los duplicados por URI; retorna cuántos se eliminaron
    pub async fn queue_remove_duplicates(&self) -> usize {
        let mut st = self.state.lock().await;
        st.queue.remove_duplicates()
    }

    /// Elimina todo lo encolado por un usuario; retorna cuántos salieron
    pub async fn queue_remove_by_user(&self, user: UserId) -> usize {
        let mut st = self.state.lock().await;
        st.queue.remove_by_user(user)
    }

    /// Página de la cola para listados, junto con el total encolado y la
    /// duración restante
    pub async fn queue_page(&self, page: usize, per_page: usize) -> (Vec<QueuedTrack>, usize, std::time::Duration) {
        let st = self.state.lock().await;
        (st.queue.page(page, per_page), st.queue.len(), st.queue.total_duration())
    }

    /// Una sesión expira cuando lleva el período configurado sin oyentes,
    /// sin track actual y con la cola vacía
    pub async fn idle_expired(&self, max_idle: std::time::Duration) -> bool {
        let st = self.state.lock().await;
        st.current.is_none()
            && st.queue.is_empty()
            && st.listener_count == 0
            && st.last_activity.elapsed() >= max_idle
    }

    /// Destruye la sesión: cancela trabajo en vuelo y libera el player
    /// del nodo
    pub async fn teardown(&self) {
        self.cancel.cancel();

        let mut st = self.state.lock().await;
        if let Some(finished) = st.current.take() {
            let _ = self.events.send(PlayerEvent::TrackEnded {
                guild: self.guild_id,
                track: finished.track.clone(),
                reason: EndReason::Teardown,
            });
        }

        if let Some(node) = st.node.take() {
            let _ = self.nodes.destroy_player(&node, self.guild_id).await;
        }

        st.queue.clear();
        st.votes.clear();
        st.play_state = PlayState::Idle;
        info!("👋 Sesión de guild {} destruida", self.guild_id);
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let st = self.state.lock().await;
        SessionSnapshot {
            guild_id: self.guild_id,
            play_state: st.play_state,
            current_title: st.current.as_ref().map(|c| c.track.title.clone()),
            queue_len: st.queue.len(),
            tracks_played: st.counters.tracks_played,
            total_play_ms: st.counters.total_play_ms,
            unique_listeners: st.counters.unique_listeners(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{prefetch::PrefetchConfig, CacheConfig},
        config::NodeConfig,
        model::Platform,
        node::protocol::WireEndReason,
        node::transport::MockNodeTransport,
        orchestrator::NoopHook,
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn track(id: &str) -> Arc<Track> {
        Arc::new(Track {
            id: id.into(),
            title: format!("Título {}", id),
            artist: Some("Artista".into()),
            duration_ms: Some(120_000),
            platform: Platform::YouTube,
            uri: format!("https://youtube.com/watch?v={}", id),
        })
    }

    async fn test_session() -> (Session, broadcast::Receiver<PlayerEvent>) {
        let mut transport = MockNodeTransport::new();
        transport.expect_connect().returning(|_, _| Ok(()));
        transport.expect_update_player().returning(|_, _, _| Ok(()));
        transport.expect_destroy_player().returning(|_, _| Ok(()));
        transport
            .expect_load_tracks()
            .returning(|_, _| Ok(crate::node::protocol::LoadResult::Empty));

        session_with(transport).await
    }

    async fn session_with(
        transport: MockNodeTransport,
    ) -> (Session, broadcast::Receiver<PlayerEvent>) {
        let mut config = Config::default();
        config.nodes = vec![NodeConfig {
            identifier: "n0".into(),
            host: "localhost".into(),
            port: 2333,
            password: "secreto".into(),
            region: "us".into(),
            ssl: false,
            capacity: 100,
            resume_key: None,
            resume_timeout: Duration::from_secs(60),
            reconnect_attempts: 0,
        }];
        config.connect_timeout = Duration::from_millis(200);
        config.search_timeout = Duration::from_millis(200);

        let nodes = Arc::new(
            NodeClient::connect(Arc::new(config.clone()), Arc::new(transport))
                .await
                .unwrap(),
        );
        let cache = Arc::new(ResultCache::new(CacheConfig::default()));
        let prefetch = Arc::new(PrefetchModel::new(PrefetchConfig::default()));
        let (events, rx) = broadcast::channel(64);

        let session = Session::new(
            GuildId(7),
            None,
            &config,
            nodes,
            cache,
            prefetch,
            events,
            Arc::new(NoopHook),
        );
        (session, rx)
    }

    async fn current_id(session: &Session) -> Option<String> {
        let st = session.state.lock().await;
        st.current.as_ref().map(|c| c.track.id.clone())
    }

    fn end_event(reason: WireEndReason) -> NodeEvent {
        NodeEvent::TrackEnd {
            guild_id: GuildId(7),
            reason,
        }
    }

    #[tokio::test]
    async fn escenario_de_votos_con_quorum_de_dos() {
        let (session, _rx) = test_session().await;

        // Cola [A, B, C]: A arranca, B y C quedan encolados
        session.enqueue(track("a"), UserId(1), None).await.unwrap();
        session.enqueue(track("b"), UserId(1), None).await.unwrap();
        session.enqueue(track("c"), UserId(1), None).await.unwrap();
        assert_eq!(current_id(&session).await, Some("a".into()));

        // 3 oyentes → quórum de 2
        session
            .update_listeners(&[UserId(1), UserId(2), UserId(3)])
            .await;

        let first = session.vote_skip(UserId(2)).await.unwrap();
        assert_eq!(first, SkipResult::Registered { votes: 1, required: 2 });
        assert_eq!(current_id(&session).await, Some("a".into()));
        {
            let st = session.state.lock().await;
            assert_eq!(st.votes.count(), 1);
            assert!(st.votes.has_voted(UserId(2)));
        }

        // Un voto repetido no avanza
        let dup = session.vote_skip(UserId(2)).await.unwrap();
        assert_eq!(dup, SkipResult::Duplicate { votes: 1, required: 2 });

        // Un segundo votante distinto ejecuta el skip exactamente una vez
        let second = session.vote_skip(UserId(3)).await.unwrap();
        assert_eq!(second, SkipResult::Skipped);
        assert_eq!(current_id(&session).await, Some("b".into()));

        let st = session.state.lock().await;
        assert_eq!(st.votes.count(), 0);
        let history: Vec<String> = st
            .queue
            .history()
            .iter()
            .map(|q| q.track.id.clone())
            .collect();
        assert_eq!(history, vec!["a"]);
    }

    #[tokio::test]
    async fn loop_track_repite_el_mismo_track() {
        let (session, _rx) = test_session().await;
        session.enqueue(track("a"), UserId(1), None).await.unwrap();
        session.set_loop_mode(LoopMode::Track).await;

        for _ in 0..3 {
            session.handle_node_event(end_event(WireEndReason::Finished)).await;
            assert_eq!(current_id(&session).await, Some("a".into()));
        }

        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.tracks_played, 4);
        assert_eq!(snapshot.play_state, PlayState::Playing);
    }

    #[tokio::test]
    async fn loop_queue_reencola_al_final_una_vez_por_fin() {
        let (session, _rx) = test_session().await;
        session.enqueue(track("a"), UserId(1), None).await.unwrap();
        session.enqueue(track("b"), UserId(1), None).await.unwrap();
        session.set_loop_mode(LoopMode::Queue).await;

        session.handle_node_event(end_event(WireEndReason::Finished)).await;
        assert_eq!(current_id(&session).await, Some("b".into()));
        {
            let st = session.state.lock().await;
            let queued: Vec<String> = st.queue.iter().map(|q| q.track.id.clone()).collect();
            assert_eq!(queued, vec!["a"]);
        }

        session.handle_node_event(end_event(WireEndReason::Finished)).await;
        assert_eq!(current_id(&session).await, Some("a".into()));
        let st = session.state.lock().await;
        let queued: Vec<String> = st.queue.iter().map(|q| q.track.id.clone()).collect();
        assert_eq!(queued, vec!["b"]);
    }

    #[tokio::test]
    async fn track_atascado_avanza_sin_error() {
        let (session, mut rx) = test_session().await;
        session.enqueue(track("a"), UserId(1), None).await.unwrap();
        session.enqueue(track("b"), UserId(1), None).await.unwrap();

        session
            .handle_node_event(NodeEvent::TrackStuck {
                guild_id: GuildId(7),
                threshold_ms: 10_000,
            })
            .await;

        assert_eq!(current_id(&session).await, Some("b".into()));

        // Se notificó la falla como evento, no como error
        let mut saw_fault = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PlayerEvent::PlaybackFault { .. }) {
                saw_fault = true;
            }
        }
        assert!(saw_fault);

        // El track fallado sale del caché; el vigente se queda
        assert!(session.cache.get(Namespace::Track, "a").is_none());
        assert!(session.cache.get(Namespace::Track, "b").is_some());
    }

    #[tokio::test]
    async fn un_track_incargable_no_se_repite_con_loop_track() {
        let (session, mut rx) = test_session().await;
        session.enqueue(track("a"), UserId(1), None).await.unwrap();
        session.enqueue(track("b"), UserId(1), None).await.unwrap();
        session.set_loop_mode(LoopMode::Track).await;

        // Un fin por carga fallida no debe volver a intentar el mismo
        // track aunque la repetición esté activa
        session
            .handle_node_event(end_event(WireEndReason::LoadFailed))
            .await;
        assert_eq!(current_id(&session).await, Some("b".into()));

        let mut fault_reason = None;
        while let Ok(event) = rx.try_recv() {
            if let PlayerEvent::TrackEnded { reason, .. } = event {
                fault_reason = Some(reason);
            }
        }
        assert_eq!(fault_reason, Some(EndReason::Fault));
    }

    #[tokio::test]
    async fn cola_agotada_sin_autoplay_queda_en_reposo() {
        let (session, mut rx) = test_session().await;
        session.enqueue(track("a"), UserId(1), None).await.unwrap();

        session.handle_node_event(end_event(WireEndReason::Finished)).await;

        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.play_state, PlayState::Idle);
        assert!(snapshot.current_title.is_none());

        let mut saw_idle = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PlayerEvent::SessionIdle { .. }) {
                saw_idle = true;
            }
        }
        assert!(saw_idle);
    }

    #[tokio::test]
    async fn fin_por_stop_no_redespacha() {
        let (session, _rx) = test_session().await;
        session.enqueue(track("a"), UserId(1), None).await.unwrap();
        session.enqueue(track("b"), UserId(1), None).await.unwrap();

        // Un Stopped viene de una acción nuestra: el avance ya ocurrió por
        // otra vía, el evento no debe duplicarlo
        session.handle_node_event(end_event(WireEndReason::Stopped)).await;
        assert_eq!(current_id(&session).await, Some("a".into()));
    }

    #[tokio::test]
    async fn force_skip_respeta_al_requester() {
        let (session, _rx) = test_session().await;
        session.enqueue(track("a"), UserId(1), None).await.unwrap();
        session.enqueue(track("b"), UserId(2), None).await.unwrap();

        // Un usuario cualquiera no puede saltar sin privilegios
        let denied = session.force_skip(UserId(9), false).await.unwrap();
        assert_eq!(denied, SkipResult::NotAllowed);

        // El requester del track actual sí
        let allowed = session.force_skip(UserId(1), false).await.unwrap();
        assert_eq!(allowed, SkipResult::Skipped);
        assert_eq!(current_id(&session).await, Some("b".into()));

        // Y un privilegiado siempre
        let privileged = session.force_skip(UserId(9), true).await.unwrap();
        assert_eq!(privileged, SkipResult::Skipped);
    }

    #[tokio::test]
    async fn play_now_reemplaza_sin_tocar_la_cola() {
        let (session, mut rx) = test_session().await;
        session.enqueue(track("a"), UserId(1), None).await.unwrap();
        session.enqueue(track("b"), UserId(1), None).await.unwrap();

        session.play_now(track("x"), UserId(2)).await.unwrap();
        assert_eq!(current_id(&session).await, Some("x".into()));

        let st = session.state.lock().await;
        let queued: Vec<String> = st.queue.iter().map(|q| q.track.id.clone()).collect();
        assert_eq!(queued, vec!["b"]);
        drop(st);

        let mut saw_replaced = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(
                event,
                PlayerEvent::TrackEnded { reason: EndReason::Replaced, .. }
            ) {
                saw_replaced = true;
            }
        }
        assert!(saw_replaced);
    }

    #[tokio::test]
    async fn shuffle_restaura_el_orden_al_desactivarse() {
        let (session, _rx) = test_session().await;
        session.enqueue(track("a"), UserId(1), None).await.unwrap();
        for i in 0..10 {
            session
                .enqueue(track(&format!("q{}", i)), UserId(1), None)
                .await
                .unwrap();
        }

        let before: Vec<String> = {
            let st = session.state.lock().await;
            st.queue.iter().map(|q| q.track.id.clone()).collect()
        };

        session.set_shuffle(true).await;
        session.set_shuffle(false).await;

        let after: Vec<String> = {
            let st = session.state.lock().await;
            st.queue.iter().map(|q| q.track.id.clone()).collect()
        };
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn la_sesion_expira_solo_sin_oyentes_ni_cola() {
        let (session, _rx) = test_session().await;
        assert!(session.idle_expired(Duration::ZERO).await);

        session.enqueue(track("a"), UserId(1), None).await.unwrap();
        assert!(!session.idle_expired(Duration::ZERO).await);
    }

    #[tokio::test]
    async fn los_comandos_reenvian_las_operaciones_al_nodo() {
        use crate::node::protocol::FilterPayload;

        let ops = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorded = ops.clone();

        let mut transport = MockNodeTransport::new();
        transport.expect_connect().returning(|_, _| Ok(()));
        transport.expect_destroy_player().returning(|_, _| Ok(()));
        transport.expect_update_player().returning(move |_, _, op| {
            recorded.lock().push(op);
            Ok(())
        });

        let (session, _rx) = session_with(transport).await;
        session.enqueue(track("a"), UserId(1), None).await.unwrap();

        // Cada toggle reconstruye y reenvía el payload completo
        assert_eq!(session.toggle_effect("nightcore").await.unwrap(), Some(true));
        assert_eq!(session.toggle_effect("bassboost").await.unwrap(), Some(true));
        assert_eq!(session.toggle_effect("nightcore").await.unwrap(), Some(false));

        // Un nombre desconocido no toca el nodo
        let before = ops.lock().len();
        assert_eq!(session.toggle_effect("reverb").await.unwrap(), None);
        assert_eq!(ops.lock().len(), before);

        session.set_paused(true).await.unwrap();
        assert_eq!(session.snapshot().await.play_state, PlayState::Paused);
        session.set_paused(false).await.unwrap();
        assert_eq!(session.snapshot().await.play_state, PlayState::Playing);

        session.seek(5_000).await.unwrap();
        // El volumen se acota al máximo permitido
        session.set_volume(300).await.unwrap();

        let ops = ops.lock();
        let filters: Vec<&FilterPayload> = ops
            .iter()
            .filter_map(|op| match op {
                PlayerOp::Filters(payload) => Some(payload),
                _ => None,
            })
            .collect();
        assert_eq!(filters.len(), 3);

        let nightcore = filters[0].timescale.as_ref().unwrap();
        assert_eq!(nightcore.speed, 1.2);
        assert_eq!(nightcore.pitch, 1.2);
        assert!(filters[0].equalizer.is_empty());

        assert!(filters[1].timescale.is_some());
        assert_eq!(filters[1].equalizer.len(), 5);

        // Sin nightcore queda solo el ecualizador del bassboost
        assert!(filters[2].timescale.is_none());
        assert_eq!(filters[2].equalizer.len(), 5);

        assert!(ops.contains(&PlayerOp::Pause(true)));
        assert!(ops.contains(&PlayerOp::Pause(false)));
        assert!(ops.contains(&PlayerOp::Seek(5_000)));
        assert!(ops.contains(&PlayerOp::Volume(200)));
    }

    #[tokio::test]
    async fn la_pagina_de_cola_reporta_total_y_duracion() {
        let (session, _rx) = test_session().await;
        session.enqueue(track("a"), UserId(1), None).await.unwrap();
        for i in 0..10 {
            session
                .enqueue(track(&format!("q{}", i)), UserId(1), None)
                .await
                .unwrap();
        }

        let (items, total, remaining) = session.queue_page(2, 4).await;
        let ids: Vec<String> = items.iter().map(|q| q.track.id.clone()).collect();
        assert_eq!(ids, vec!["q4", "q5", "q6", "q7"]);
        assert_eq!(total, 10);
        assert_eq!(remaining, Duration::from_secs(10 * 120));
    }
}
