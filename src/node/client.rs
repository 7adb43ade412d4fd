use parking_lot::{Mutex, RwLock};
use std::{sync::Arc, time::Instant};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, NodeConfig},
    error::PlayerError,
    model::{GuildId, NodeId, Track},
    node::{
        protocol::{parse_query, NodeEvent, PlayerOp},
        transport::NodeTransport,
    },
};

/// Fallas de stats consecutivas antes de marcar un nodo como no saludable
const UNHEALTHY_AFTER: u32 = 3;

/// Estado observado de un nodo, mutado solo por el loop de salud
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub players: u32,
    pub playing: u32,
    pub load_pct: u8,
    pub healthy: bool,
    pub last_check: Option<Instant>,
    pub consecutive_failures: u32,
    pub reconnects: u32,
}

impl Default for NodeStats {
    fn default() -> Self {
        Self {
            players: 0,
            playing: 0,
            load_pct: 0,
            healthy: false,
            last_check: None,
            consecutive_failures: 0,
            reconnects: 0,
        }
    }
}

/// Un nodo del pool junto con su estado observado
#[derive(Debug)]
pub struct ManagedNode {
    pub config: NodeConfig,
    pub stats: RwLock<NodeStats>,
}

impl ManagedNode {
    pub fn id(&self) -> NodeId {
        NodeId(self.config.identifier.clone())
    }

    pub fn is_healthy(&self) -> bool {
        self.stats.read().healthy
    }

    pub fn load_pct(&self) -> u8 {
        self.stats.read().load_pct
    }
}

/// Cliente del pool de nodos de audio
pub struct NodeClient {
    nodes: Vec<Arc<ManagedNode>>,
    transport: Arc<dyn NodeTransport>,
    events_tx: mpsc::UnboundedSender<NodeEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<NodeEvent>>>,
    config: Arc<Config>,
}

impl NodeClient {
    /// Conecta con cada nodo configurado. La falla parcial se tolera
    /// (los nodos caídos quedan en el pool, no saludables, y el loop de
    /// salud los reintenta); la falla total es fatal.
    pub async fn connect(
        config: Arc<Config>,
        transport: Arc<dyn NodeTransport>,
    ) -> Result<Self, PlayerError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut nodes = Vec::with_capacity(config.nodes.len());
        let mut connected = 0usize;

        for node_config in &config.nodes {
            let node = Arc::new(ManagedNode {
                config: node_config.clone(),
                stats: RwLock::new(NodeStats::default()),
            });

            match timeout(
                config.connect_timeout,
                transport.connect(node_config, events_tx.clone()),
            )
            .await
            {
                Ok(Ok(())) => {
                    info!(
                        "✅ Nodo {} conectado ({}:{}, región {})",
                        node_config.identifier, node_config.host, node_config.port, node_config.region
                    );
                    node.stats.write().healthy = true;
                    connected += 1;
                }
                Ok(Err(e)) => {
                    warn!("⚠️ Nodo {} rechazó la conexión: {}", node_config.identifier, e);
                }
                Err(_) => {
                    warn!(
                        "⏰ Nodo {} no respondió en {:?}",
                        node_config.identifier, config.connect_timeout
                    );
                }
            }

            nodes.push(node);
        }

        if connected == 0 {
            error!("❌ Ningún nodo de audio disponible al arranque");
            return Err(PlayerError::NodeUnavailable);
        }

        info!("🎼 Pool de nodos listo: {}/{} conectados", connected, nodes.len());

        Ok(Self {
            nodes,
            transport,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            config,
        })
    }

    /// Toma el stream de eventos de los nodos (solo una vez)
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<NodeEvent>> {
        self.events_rx.lock().take()
    }

    pub fn nodes(&self) -> &[Arc<ManagedNode>] {
        &self.nodes
    }

    pub fn has_healthy_node(&self) -> bool {
        self.nodes.iter().any(|n| n.is_healthy())
    }

    /// Retorna el nodo saludable con menor carga observada; con región,
    /// los nodos de esa región tienen preferencia si existen. Con un solo
    /// nodo saludable lo retorna incondicionalmente.
    pub fn get_best_node(&self, region: Option<&str>) -> Result<Arc<ManagedNode>, PlayerError> {
        let healthy: Vec<&Arc<ManagedNode>> =
            self.nodes.iter().filter(|n| n.is_healthy()).collect();

        if healthy.is_empty() {
            return Err(PlayerError::NodeUnavailable);
        }
        if healthy.len() == 1 {
            return Ok(healthy[0].clone());
        }

        let candidates: Vec<&Arc<ManagedNode>> = match region {
            Some(region) => {
                let regional: Vec<&Arc<ManagedNode>> = healthy
                    .iter()
                    .copied()
                    .filter(|n| n.config.region == region)
                    .collect();
                if regional.is_empty() {
                    healthy
                } else {
                    regional
                }
            }
            None => healthy,
        };

        let best = candidates
            .into_iter()
            .min_by_key(|n| n.load_pct())
            .expect("candidatos no vacíos");

        Ok(best.clone())
    }

    /// Busca tracks. Timeout o error del transporte se absorben como
    /// lista vacía; solo la ausencia total de nodos saludables es error.
    pub async fn search(&self, query: &str) -> Result<Vec<Arc<Track>>, PlayerError> {
        let node = self.get_best_node(None)?;
        let parsed = parse_query(query);

        debug!(
            "🔍 Buscando '{}' en nodo {} ({:?})",
            parsed.identifier,
            node.config.identifier,
            parsed.kind
        );

        match timeout(
            self.config.search_timeout,
            self.transport.load_tracks(&node.config, &parsed.identifier),
        )
        .await
        {
            Ok(Ok(result)) => Ok(result.into_tracks()),
            Ok(Err(e)) => {
                warn!("⚠️ Búsqueda falló en {}: {}", node.config.identifier, e);
                Ok(Vec::new())
            }
            Err(_) => {
                warn!(
                    "⏰ Búsqueda excedió {:?} en {}",
                    self.config.search_timeout, node.config.identifier
                );
                Ok(Vec::new())
            }
        }
    }

    pub async fn update_player(
        &self,
        node: &Arc<ManagedNode>,
        guild: GuildId,
        op: PlayerOp,
    ) -> Result<(), PlayerError> {
        self.transport.update_player(&node.config, guild, op).await
    }

    pub async fn destroy_player(
        &self,
        node: &Arc<ManagedNode>,
        guild: GuildId,
    ) -> Result<(), PlayerError> {
        self.transport.destroy_player(&node.config, guild).await
    }

    /// Lanza el loop de salud: refresca stats de cada nodo, marca los
    /// que fallan y reintenta reconexiones acotadas. Un nodo recuperado
    /// rehace el handshake antes de volver al pool.
    pub fn spawn_health_poll(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let client = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.config.health_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("🛑 Loop de salud detenido");
                        break;
                    }
                    _ = ticker.tick() => {
                        client.poll_once().await;
                    }
                }
            }
        })
    }

    /// Una pasada de sondeo de salud sobre todos los nodos
    pub async fn poll_once(&self) {
        for node in &self.nodes {
            let result = timeout(
                self.config.connect_timeout,
                self.transport.node_stats(&node.config),
            )
            .await;

            match result {
                Ok(Ok(payload)) => {
                    let was_healthy = node.stats.read().healthy;

                    // Un nodo caído solo vuelve al pool con un handshake
                    // exitoso: el connect es el único punto que registra
                    // su canal de eventos. Stats sin canal no alcanza.
                    if !was_healthy {
                        let handshake = timeout(
                            self.config.connect_timeout,
                            self.transport.connect(&node.config, self.events_tx.clone()),
                        )
                        .await;

                        if !matches!(handshake, Ok(Ok(()))) {
                            let mut stats = node.stats.write();
                            stats.consecutive_failures += 1;
                            stats.last_check = Some(Instant::now());
                            warn!(
                                "⚠️ Nodo {} responde stats pero rechazó el handshake",
                                node.config.identifier
                            );
                            continue;
                        }

                        info!("💚 Nodo {} recuperado", node.config.identifier);
                    }

                    let mut stats = node.stats.write();
                    stats.players = payload.players;
                    stats.playing = payload.playing_players;
                    stats.load_pct = compute_load(payload.playing_players, node.config.capacity);
                    stats.healthy = true;
                    stats.consecutive_failures = 0;
                    stats.reconnects = 0;
                    stats.last_check = Some(Instant::now());

                    if stats.load_pct >= self.config.overload_threshold {
                        warn!(
                            "⚖️ Nodo {} sobrecargado ({}% ≥ {}%): las selecciones nuevas irán al menos cargado",
                            node.config.identifier, stats.load_pct, self.config.overload_threshold
                        );
                    }
                }
                _ => {
                    let needs_reconnect = {
                        let mut stats = node.stats.write();
                        stats.consecutive_failures += 1;
                        stats.last_check = Some(Instant::now());

                        if stats.healthy && stats.consecutive_failures >= UNHEALTHY_AFTER {
                            stats.healthy = false;
                            warn!(
                                "💔 Nodo {} marcado no saludable tras {} fallas",
                                node.config.identifier, stats.consecutive_failures
                            );
                        }

                        !stats.healthy && stats.reconnects < node.config.reconnect_attempts
                    };

                    // Reintento de handshake acotado; el próximo ciclo
                    // vuelve a sondear de todos modos
                    if needs_reconnect {
                        node.stats.write().reconnects += 1;
                        if let Ok(Ok(())) = timeout(
                            self.config.connect_timeout,
                            self.transport.connect(&node.config, self.events_tx.clone()),
                        )
                        .await
                        {
                            let mut stats = node.stats.write();
                            stats.healthy = true;
                            stats.consecutive_failures = 0;
                            stats.reconnects = 0;
                            info!("🔄 Nodo {} reconectado", node.config.identifier);
                        }
                    }
                }
            }
        }

        if !self.has_healthy_node() {
            error!("❌ Sin nodos saludables: el cliente entra en estado degradado");
        }
    }
}

fn compute_load(playing: u32, capacity: u32) -> u8 {
    if capacity == 0 {
        return 100;
    }
    ((playing.saturating_mul(100)) / capacity).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::protocol::{LoadResult, NodeStatsPayload, TrackPayload};
    use crate::node::transport::MockNodeTransport;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn test_config(node_count: usize) -> Arc<Config> {
        let mut config = Config::default();
        config.nodes = (0..node_count)
            .map(|i| NodeConfig {
                identifier: format!("n{}", i),
                host: "localhost".into(),
                port: 2333 + i as u16,
                password: "secreto".into(),
                region: if i == 0 { "us".into() } else { "eu".into() },
                ssl: false,
                capacity: 100,
                resume_key: None,
                resume_timeout: Duration::from_secs(60),
                reconnect_attempts: 3,
            })
            .collect();
        config.connect_timeout = Duration::from_millis(200);
        config.search_timeout = Duration::from_millis(200);
        Arc::new(config)
    }

    fn set_stats(node: &Arc<ManagedNode>, load_pct: u8, healthy: bool) {
        let mut stats = node.stats.write();
        stats.load_pct = load_pct;
        stats.healthy = healthy;
    }

    async fn connected_client(node_count: usize) -> Arc<NodeClient> {
        let mut transport = MockNodeTransport::new();
        transport.expect_connect().returning(|_, _| Ok(()));
        Arc::new(
            NodeClient::connect(test_config(node_count), Arc::new(transport))
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn elige_el_nodo_con_menor_carga() {
        let client = connected_client(2).await;
        set_stats(&client.nodes()[0], 90, true);
        set_stats(&client.nodes()[1], 30, true);

        let best = client.get_best_node(None).unwrap();
        assert_eq!(best.id(), NodeId("n1".into()));
    }

    #[tokio::test]
    async fn nunca_elige_un_nodo_no_saludable_si_hay_alternativa() {
        let client = connected_client(2).await;
        set_stats(&client.nodes()[0], 10, false);
        set_stats(&client.nodes()[1], 95, true);

        let best = client.get_best_node(None).unwrap();
        assert_eq!(best.id(), NodeId("n1".into()));
    }

    #[tokio::test]
    async fn prefiere_la_region_del_guild() {
        let client = connected_client(3).await;
        // n0=us carga 20, n1=eu carga 50, n2=eu carga 40
        set_stats(&client.nodes()[0], 20, true);
        set_stats(&client.nodes()[1], 50, true);
        set_stats(&client.nodes()[2], 40, true);

        let best = client.get_best_node(Some("eu")).unwrap();
        assert_eq!(best.id(), NodeId("n2".into()));
    }

    #[tokio::test]
    async fn sin_nodos_saludables_retorna_node_unavailable() {
        let client = connected_client(2).await;
        set_stats(&client.nodes()[0], 0, false);
        set_stats(&client.nodes()[1], 0, false);

        assert!(matches!(
            client.get_best_node(None),
            Err(PlayerError::NodeUnavailable)
        ));
    }

    #[tokio::test]
    async fn conexion_parcial_se_tolera_total_es_fatal() {
        let mut transport = MockNodeTransport::new();
        let mut first = true;
        transport.expect_connect().returning(move |_, _| {
            if first {
                first = false;
                Ok(())
            } else {
                Err(PlayerError::SearchTimeout)
            }
        });
        let client = NodeClient::connect(test_config(2), Arc::new(transport))
            .await
            .unwrap();
        assert_eq!(client.nodes().len(), 2);
        assert!(client.nodes()[0].is_healthy());
        assert!(!client.nodes()[1].is_healthy());

        let mut transport = MockNodeTransport::new();
        transport
            .expect_connect()
            .returning(|_, _| Err(PlayerError::SearchTimeout));
        let result = NodeClient::connect(test_config(2), Arc::new(transport)).await;
        assert!(matches!(result, Err(PlayerError::NodeUnavailable)));
    }

    #[tokio::test]
    async fn busqueda_con_error_retorna_lista_vacia() {
        let mut transport = MockNodeTransport::new();
        transport.expect_connect().returning(|_, _| Ok(()));
        transport
            .expect_load_tracks()
            .returning(|_, _| Err(PlayerError::SearchTimeout));

        let client = NodeClient::connect(test_config(1), Arc::new(transport))
            .await
            .unwrap();

        let results = client.search("algo que no existe").await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn busqueda_exitosa_pasa_los_resultados() {
        let mut transport = MockNodeTransport::new();
        transport.expect_connect().returning(|_, _| Ok(()));
        transport.expect_load_tracks().returning(|_, identifier| {
            assert_eq!(identifier, "ytsearch:lofi");
            Ok(LoadResult::Search {
                data: vec![TrackPayload {
                    identifier: "abc".into(),
                    title: "Lofi".into(),
                    author: Some("Beats".into()),
                    length: Some(90_000),
                    source_name: Some("youtube".into()),
                    uri: "https://youtube.com/watch?v=abc".into(),
                }],
            })
        });

        let client = NodeClient::connect(test_config(1), Arc::new(transport))
            .await
            .unwrap();

        let results = client.search("lofi").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Lofi");
    }

    #[tokio::test]
    async fn el_poll_marca_nodos_caidos() {
        let mut transport = MockNodeTransport::new();
        // La conexión inicial funciona; los reintentos posteriores fallan
        let mut initial = true;
        transport.expect_connect().returning(move |_, _| {
            if initial {
                initial = false;
                Ok(())
            } else {
                Err(PlayerError::SearchTimeout)
            }
        });
        transport
            .expect_node_stats()
            .returning(|_| Err(PlayerError::SearchTimeout));

        let client = Arc::new(
            NodeClient::connect(test_config(1), Arc::new(transport))
                .await
                .unwrap(),
        );

        // Tres fallas consecutivas marcan el nodo como no saludable
        for _ in 0..UNHEALTHY_AFTER {
            client.poll_once().await;
        }
        assert!(!client.nodes()[0].is_healthy());
        assert!(matches!(
            client.get_best_node(None),
            Err(PlayerError::NodeUnavailable)
        ));
    }

    #[tokio::test]
    async fn stats_sin_handshake_no_recuperan_un_nodo() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let connects = Arc::new(AtomicUsize::new(0));
        let connects_in = connects.clone();

        // n1 responde stats pero rechaza todo handshake
        let mut transport = MockNodeTransport::new();
        transport.expect_connect().returning(move |node, _| {
            if node.identifier == "n1" {
                connects_in.fetch_add(1, Ordering::SeqCst);
                Err(PlayerError::SearchTimeout)
            } else {
                Ok(())
            }
        });
        transport.expect_node_stats().returning(|_| {
            Ok(NodeStatsPayload {
                players: 1,
                playing_players: 1,
            })
        });

        let client = Arc::new(
            NodeClient::connect(test_config(2), Arc::new(transport))
                .await
                .unwrap(),
        );
        assert!(!client.nodes()[1].is_healthy());
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        client.poll_once().await;

        // El handshake se reintentó y falló: sin canal de eventos el
        // nodo sigue fuera del pool aunque sus stats respondan
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert!(!client.nodes()[1].is_healthy());
    }

    #[tokio::test]
    async fn la_recuperacion_exige_handshake_exitoso() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in = attempts.clone();

        // n1 rechaza el handshake inicial y acepta el siguiente
        let mut transport = MockNodeTransport::new();
        transport.expect_connect().returning(move |node, _| {
            if node.identifier != "n1" {
                return Ok(());
            }
            if attempts_in.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(PlayerError::SearchTimeout)
            } else {
                Ok(())
            }
        });
        transport.expect_node_stats().returning(|_| {
            Ok(NodeStatsPayload {
                players: 2,
                playing_players: 1,
            })
        });

        let client = Arc::new(
            NodeClient::connect(test_config(2), Arc::new(transport))
                .await
                .unwrap(),
        );
        assert!(!client.nodes()[1].is_healthy());

        client.poll_once().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(client.nodes()[1].is_healthy());
    }

    #[tokio::test]
    async fn el_poll_actualiza_la_carga() {
        let mut transport = MockNodeTransport::new();
        transport.expect_connect().returning(|_, _| Ok(()));
        transport.expect_node_stats().returning(|_| {
            Ok(NodeStatsPayload {
                players: 42,
                playing_players: 30,
            })
        });

        let client = Arc::new(
            NodeClient::connect(test_config(1), Arc::new(transport))
                .await
                .unwrap(),
        );
        client.poll_once().await;

        let stats = client.nodes()[0].stats.read().clone();
        assert_eq!(stats.players, 42);
        assert_eq!(stats.playing, 30);
        assert_eq!(stats.load_pct, 30);
        assert!(stats.healthy);
    }

    #[test]
    fn la_carga_se_satura_en_cien() {
        assert_eq!(compute_load(30, 100), 30);
        assert_eq!(compute_load(150, 100), 100);
        assert_eq!(compute_load(1, 0), 100);
    }
}
