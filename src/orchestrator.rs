//! # Orchestrator Module
//!
//! Raíz del sistema: posee el pool de nodos, el caché compartido, el
//! predictor y el mapa de sesiones por guild. Bombea los eventos
//! asíncronos de los nodos hacia la sesión correspondiente y corre el
//! mantenimiento periódico en un scheduler consolidado.

use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cache::{
        normalize_query,
        prefetch::{PrefetchConfig, PrefetchModel},
        CacheConfig, CacheStats, CachedValue, Namespace, ResultCache,
    },
    config::Config,
    error::PlayerError,
    model::{EndReason, GuildId, Track, UserId},
    node::{client::NodeClient, protocol::NodeEvent},
    session::{Session, SessionSnapshot},
};

/// Barrido de sesiones inactivas
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Eventos del reproductor para la capa de presentación
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    TrackStarted {
        guild: GuildId,
        track: Arc<Track>,
    },
    TrackEnded {
        guild: GuildId,
        track: Arc<Track>,
        reason: EndReason,
    },
    /// La sesión se quedó sin tracks y quedó en reposo
    SessionIdle { guild: GuildId },
    /// Falla de reproducción absorbida; informativo, nunca fatal
    PlaybackFault { guild: GuildId, message: String },
    /// Ningún nodo de audio saludable: se emite una vez por transición
    /// al estado degradado
    NodeUnavailable,
}

/// Gancho invocado en cada inicio de reproducción. La capa externa lo
/// usa para persistir historiales; el orquestador no persiste nada.
#[async_trait]
pub trait PlayHook: Send + Sync {
    async fn record_play(&self, guild: GuildId, user: UserId, track: Arc<Track>);
}

/// Gancho nulo para despliegues sin persistencia
pub struct NoopHook;

#[async_trait]
impl PlayHook for NoopHook {
    async fn record_play(&self, _guild: GuildId, _user: UserId, _track: Arc<Track>) {}
}

/// Foto agregada del orquestador para reportes
#[derive(Debug, Clone)]
pub struct OrchestratorStats {
    pub uptime: Duration,
    pub sessions: usize,
    pub cache: CacheStats,
    pub prefetch_edges: usize,
}

pub struct Orchestrator {
    config: Arc<Config>,
    nodes: Arc<NodeClient>,
    cache: Arc<ResultCache>,
    prefetch: Arc<PrefetchModel>,
    sessions: DashMap<GuildId, Arc<Session>>,
    events: broadcast::Sender<PlayerEvent>,
    hook: Arc<dyn PlayHook>,
    cancel: CancellationToken,
    started_at: Instant,
    /// El pool quedó sin nodos saludables; evita repetir el evento
    degraded: AtomicBool,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, nodes: Arc<NodeClient>, hook: Arc<dyn PlayHook>) -> Arc<Self> {
        let cache = Arc::new(ResultCache::new(CacheConfig {
            capacity_bytes: config.cache_capacity_bytes,
            search_ttl: config.search_ttl,
            track_ttl: config.track_ttl,
            metadata_ttl: config.metadata_ttl,
            user_ttl: config.user_ttl,
            ..CacheConfig::default()
        }));

        let prefetch = Arc::new(PrefetchModel::new(PrefetchConfig {
            decay_factor: config.prefetch_decay_factor,
            prune_threshold: config.prefetch_prune_threshold,
        }));

        let (events, _) = broadcast::channel(256);

        Arc::new(Self {
            config,
            nodes,
            cache,
            prefetch,
            sessions: DashMap::new(),
            events,
            hook,
            cancel: CancellationToken::new(),
            started_at: Instant::now(),
            degraded: AtomicBool::new(false),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn nodes(&self) -> &Arc<NodeClient> {
        &self.nodes
    }

    /// Obtiene la sesión del guild, creándola si no existe
    pub fn get_or_create_session(&self, guild: GuildId, region: Option<String>) -> Arc<Session> {
        self.sessions
            .entry(guild)
            .or_insert_with(|| {
                info!("🆕 Sesión creada para guild {}", guild);
                Arc::new(Session::new(
                    guild,
                    region,
                    &self.config,
                    self.nodes.clone(),
                    self.cache.clone(),
                    self.prefetch.clone(),
                    self.events.clone(),
                    self.hook.clone(),
                ))
            })
            .clone()
    }

    pub fn session(&self, guild: GuildId) -> Option<Arc<Session>> {
        self.sessions.get(&guild).map(|s| s.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Destruye la sesión del guild y libera su player en el nodo
    pub async fn destroy_session(&self, guild: GuildId) {
        if let Some((_, session)) = self.sessions.remove(&guild) {
            session.teardown().await;
        }
    }

    /// Búsqueda con caché por delante: la clave es la consulta
    /// normalizada, el valor la lista completa de resultados
    pub async fn search(&self, query: &str) -> Result<Vec<Arc<Track>>, PlayerError> {
        let key = normalize_query(query);

        if let Some(CachedValue::Tracks(tracks)) = self.cache.get(Namespace::Search, &key) {
            debug!("🎯 Búsqueda '{}' servida desde caché", key);
            return Ok(tracks);
        }

        let tracks = self.nodes.search(query).await?;
        if !tracks.is_empty() {
            self.cache
                .put(Namespace::Search, key, CachedValue::Tracks(tracks.clone()), None);
        }

        Ok(tracks)
    }

    /// Arranca los loops de fondo: salud de nodos, bomba de eventos y
    /// scheduler de mantenimiento
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(self.nodes.spawn_health_poll(self.cancel.child_token()));
        handles.push(self.spawn_event_pump());
        handles.push(self.spawn_scheduler());

        info!("🚀 Orquestador iniciado");
        handles
    }

    /// Bomba de eventos: drena el stream de los nodos y despacha cada
    /// evento a la sesión de su guild
    fn spawn_event_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let Some(mut events) = orchestrator.nodes.take_events() else {
                warn!("⚠️ El stream de eventos de nodos ya fue tomado");
                return;
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => {
                        match event {
                            Some(event) => orchestrator.dispatch_event(event).await,
                            None => break,
                        }
                    }
                }
            }

            debug!("🛑 Bomba de eventos detenida");
        })
    }

    async fn dispatch_event(&self, event: NodeEvent) {
        let guild = match &event {
            NodeEvent::TrackStart { guild_id }
            | NodeEvent::TrackEnd { guild_id, .. }
            | NodeEvent::TrackException { guild_id, .. }
            | NodeEvent::TrackStuck { guild_id, .. } => *guild_id,
        };

        match self.session(guild) {
            Some(session) => session.handle_node_event(event).await,
            None => debug!("Evento de nodo para guild {} sin sesión, descartado", guild),
        }
    }

    /// Scheduler consolidado: limpieza de caché, reajuste de TTLs,
    /// decaimiento del predictor y barrido de sesiones inactivas
    fn spawn_scheduler(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let mut cleanup = tokio::time::interval(orchestrator.config.cache_cleanup_interval);
            let mut retune = tokio::time::interval(orchestrator.config.cache_retune_interval);
            let mut decay = tokio::time::interval(orchestrator.config.prefetch_decay_interval);
            let mut idle_sweep = tokio::time::interval(IDLE_SWEEP_INTERVAL);

            // El primer tick de un interval es inmediato
            cleanup.tick().await;
            retune.tick().await;
            decay.tick().await;
            idle_sweep.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("🛑 Scheduler detenido");
                        break;
                    }
                    _ = cleanup.tick() => {
                        let removed = orchestrator.cache.cleanup_expired();
                        if removed > 0 {
                            debug!("🧹 Limpieza de caché: {} entradas expiradas", removed);
                        }
                    }
                    _ = retune.tick() => {
                        orchestrator.cache.retune();
                    }
                    _ = decay.tick() => {
                        orchestrator.prefetch.decay();
                    }
                    _ = idle_sweep.tick() => {
                        orchestrator.check_degraded();
                        orchestrator.sweep_idle_sessions().await;
                        orchestrator.log_stats().await;
                    }
                }
            }
        })
    }

    /// Emite `NodeUnavailable` exactamente una vez cada vez que el pool
    /// pasa de tener nodos saludables a no tener ninguno
    pub fn check_degraded(&self) {
        if self.nodes.has_healthy_node() {
            self.degraded.store(false, Ordering::Relaxed);
        } else if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!("🚨 Pool de nodos degradado: sin nodos saludables");
            let _ = self.events.send(PlayerEvent::NodeUnavailable);
        }
    }

    /// Destruye las sesiones que llevan demasiado tiempo sin oyentes,
    /// sin track actual y con la cola vacía
    pub async fn sweep_idle_sessions(&self) -> usize {
        let mut expired = Vec::new();
        for entry in self.sessions.iter() {
            if entry.value().idle_expired(self.config.idle_teardown).await {
                expired.push(*entry.key());
            }
        }

        for guild in &expired {
            info!("💤 Sesión de guild {} expirada por inactividad", guild);
            self.destroy_session(*guild).await;
        }

        expired.len()
    }

    async fn log_stats(&self) {
        let stats = self.stats();
        debug!(
            "📊 Sesiones: {} | Caché: {} hits / {} misses ({:.0}%), {} KiB | Predictor: {} aristas",
            stats.sessions,
            stats.cache.hits,
            stats.cache.misses,
            stats.cache.hit_ratio * 100.0,
            stats.cache.total_bytes / 1024,
            stats.prefetch_edges,
        );
        debug!(
            "📦 Entradas por espacio: {} búsquedas, {} tracks, {} metadata, {} usuario | {} expulsiones",
            stats.cache.search_entries,
            stats.cache.track_entries,
            stats.cache.metadata_entries,
            stats.cache.user_entries,
            stats.cache.evictions,
        );
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            uptime: self.started_at.elapsed(),
            sessions: self.sessions.len(),
            cache: self.cache.stats(),
            prefetch_edges: self.prefetch.edge_count(),
        }
    }

    pub async fn session_snapshots(&self) -> Vec<SessionSnapshot> {
        let mut snapshots = Vec::with_capacity(self.sessions.len());
        for entry in self.sessions.iter() {
            snapshots.push(entry.value().snapshot().await);
        }
        snapshots
    }

    /// Apagado ordenado: detiene los loops de fondo y destruye todas
    /// las sesiones liberando sus players
    pub async fn shutdown(&self) {
        info!("🔻 Apagando orquestador...");
        self.cancel.cancel();

        let guilds: Vec<GuildId> = self.sessions.iter().map(|e| *e.key()).collect();
        for guild in guilds {
            self.destroy_session(guild).await;
        }

        info!("✅ Orquestador apagado ({} s de uptime)", self.started_at.elapsed().as_secs());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::Platform,
        node::protocol::{LoadResult, TrackPayload, WireEndReason},
        node::transport::MockNodeTransport,
        session::PlayState,
    };
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> Arc<Config> {
        let mut config = Config::default();
        config.connect_timeout = Duration::from_millis(200);
        config.search_timeout = Duration::from_millis(200);
        Arc::new(config)
    }

    fn search_payload(id: &str) -> LoadResult {
        LoadResult::Search {
            data: vec![TrackPayload {
                identifier: id.into(),
                title: format!("Título {}", id),
                author: Some("Artista".into()),
                length: Some(90_000),
                source_name: Some("youtube".into()),
                uri: format!("https://youtube.com/watch?v={}", id),
            }],
        }
    }

    async fn test_orchestrator(transport: MockNodeTransport) -> Arc<Orchestrator> {
        let config = test_config();
        let nodes = Arc::new(
            NodeClient::connect(config.clone(), Arc::new(transport))
                .await
                .unwrap(),
        );
        Orchestrator::new(config, nodes, Arc::new(NoopHook))
    }

    #[tokio::test]
    async fn la_busqueda_repetida_se_sirve_desde_cache() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let mut transport = MockNodeTransport::new();
        transport.expect_connect().returning(|_, _| Ok(()));
        transport.expect_load_tracks().returning(|_, _| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(search_payload("abc"))
        });

        let orchestrator = test_orchestrator(transport).await;

        let first = orchestrator.search("Lofi Beats").await.unwrap();
        assert_eq!(first.len(), 1);

        // Misma consulta con distinta capitalización: hit de caché
        let second = orchestrator.search("lofi beats").await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn get_or_create_retorna_la_misma_sesion() {
        let mut transport = MockNodeTransport::new();
        transport.expect_connect().returning(|_, _| Ok(()));

        let orchestrator = test_orchestrator(transport).await;
        let a = orchestrator.get_or_create_session(GuildId(1), None);
        let b = orchestrator.get_or_create_session(GuildId(1), None);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(orchestrator.session_count(), 1);
    }

    #[tokio::test]
    async fn los_eventos_se_despachan_a_la_sesion_del_guild() {
        let mut transport = MockNodeTransport::new();
        transport.expect_connect().returning(|_, _| Ok(()));
        transport.expect_update_player().returning(|_, _, _| Ok(()));

        let orchestrator = test_orchestrator(transport).await;
        let session = orchestrator.get_or_create_session(GuildId(5), None);

        let track = Arc::new(Track {
            id: "a".into(),
            title: "Título a".into(),
            artist: None,
            duration_ms: Some(60_000),
            platform: Platform::YouTube,
            uri: "https://youtube.com/watch?v=a".into(),
        });
        session.enqueue(track, UserId(1), None).await.unwrap();

        orchestrator
            .dispatch_event(NodeEvent::TrackEnd {
                guild_id: GuildId(5),
                reason: WireEndReason::Finished,
            })
            .await;

        assert_eq!(session.snapshot().await.play_state, PlayState::Idle);

        // Un evento de un guild sin sesión no hace nada
        orchestrator
            .dispatch_event(NodeEvent::TrackEnd {
                guild_id: GuildId(99),
                reason: WireEndReason::Finished,
            })
            .await;
    }

    #[tokio::test]
    async fn el_estado_degradado_se_notifica_una_sola_vez() {
        let mut transport = MockNodeTransport::new();
        transport.expect_connect().returning(|_, _| Ok(()));

        let orchestrator = test_orchestrator(transport).await;
        let mut rx = orchestrator.subscribe();

        // Con el nodo saludable no pasa nada
        orchestrator.check_degraded();
        assert!(rx.try_recv().is_err());

        orchestrator.nodes().nodes()[0].stats.write().healthy = false;
        orchestrator.check_degraded();
        orchestrator.check_degraded();

        assert!(matches!(rx.try_recv(), Ok(PlayerEvent::NodeUnavailable)));
        assert!(rx.try_recv().is_err());

        // La recuperación re-arma la notificación
        orchestrator.nodes().nodes()[0].stats.write().healthy = true;
        orchestrator.check_degraded();
        orchestrator.nodes().nodes()[0].stats.write().healthy = false;
        orchestrator.check_degraded();
        assert!(matches!(rx.try_recv(), Ok(PlayerEvent::NodeUnavailable)));
    }

    #[tokio::test]
    async fn el_barrido_destruye_sesiones_inactivas() {
        let mut transport = MockNodeTransport::new();
        transport.expect_connect().returning(|_, _| Ok(()));
        transport.expect_destroy_player().returning(|_, _| Ok(()));

        let config = {
            let mut c = Config::default();
            c.connect_timeout = Duration::from_millis(200);
            c.idle_teardown = Duration::ZERO;
            Arc::new(c)
        };
        let nodes = Arc::new(
            NodeClient::connect(config.clone(), Arc::new(transport))
                .await
                .unwrap(),
        );
        let orchestrator = Orchestrator::new(config, nodes, Arc::new(NoopHook));

        orchestrator.get_or_create_session(GuildId(1), None);
        orchestrator.get_or_create_session(GuildId(2), None);
        assert_eq!(orchestrator.session_count(), 2);

        let swept = orchestrator.sweep_idle_sessions().await;
        assert_eq!(swept, 2);
        assert_eq!(orchestrator.session_count(), 0);
    }
}
