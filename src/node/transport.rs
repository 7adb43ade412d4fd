use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::HashMap, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::NodeConfig,
    error::PlayerError,
    model::GuildId,
    node::protocol::{LoadResult, NodeEvent, NodeStatsPayload, PlayerOp},
};

/// Seam de transporte hacia un nodo de audio. Los comandos son
/// petición/respuesta; los eventos del nodo se entregan por el canal
/// registrado en `connect`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Establece (o reanuda) la sesión con el nodo y registra el canal
    /// de eventos
    async fn connect(
        &self,
        node: &NodeConfig,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Result<(), PlayerError>;

    /// Resuelve una consulta ya normalizada a tracks
    async fn load_tracks(
        &self,
        node: &NodeConfig,
        identifier: &str,
    ) -> Result<LoadResult, PlayerError>;

    /// Estadísticas actuales del nodo
    async fn node_stats(&self, node: &NodeConfig) -> Result<NodeStatsPayload, PlayerError>;

    /// Aplica una operación al player de un guild
    async fn update_player(
        &self,
        node: &NodeConfig,
        guild: GuildId,
        op: PlayerOp,
    ) -> Result<(), PlayerError>;

    /// Destruye el player de un guild en el nodo
    async fn destroy_player(&self, node: &NodeConfig, guild: GuildId) -> Result<(), PlayerError>;
}

/// Transporte REST real. Los eventos se materializan con un long-poll
/// por nodo que alimenta el canal registrado en `connect`.
pub struct RestTransport {
    http: reqwest::Client,
    /// Token del poller vigente por nodo; una reconexión cancela el
    /// anterior antes de lanzar el nuevo
    pollers: Mutex<HashMap<String, CancellationToken>>,
}

impl RestTransport {
    pub fn new(request_timeout: Duration) -> Result<Self, PlayerError> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()?,
            pollers: Mutex::new(HashMap::new()),
        })
    }

    fn base_url(node: &NodeConfig) -> String {
        let scheme = if node.ssl { "https" } else { "http" };
        format!("{}://{}:{}/v4", scheme, node.host, node.port)
    }

    fn spawn_event_poll(&self, node: NodeConfig, events: mpsc::UnboundedSender<NodeEvent>) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self
            .pollers
            .lock()
            .insert(node.identifier.clone(), cancel.clone())
        {
            // Un solo consumidor de /events por nodo: el poller anterior
            // duplicaría la entrega tras una reconexión
            previous.cancel();
        }

        let http = self.http.clone();
        let url = format!("{}/events", Self::base_url(&node));

        tokio::spawn(async move {
            loop {
                if events.is_closed() {
                    debug!("📪 Canal de eventos cerrado, terminando poll de {}", node.identifier);
                    break;
                }

                let request = http
                    .get(&url)
                    .header("Authorization", &node.password)
                    .query(&[("wait", "25")])
                    .send();

                let response = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("🛑 Poll de eventos de {} reemplazado", node.identifier);
                        break;
                    }
                    response = request => response,
                };

                match response {
                    Ok(resp) => match resp.json::<Vec<NodeEvent>>().await {
                        Ok(batch) => {
                            for event in batch {
                                if events.send(event).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            debug!("Evento ilegible del nodo {}: {}", node.identifier, e);
                        }
                    },
                    Err(e) => {
                        warn!("⚠️ Poll de eventos falló para {}: {}", node.identifier, e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl NodeTransport for RestTransport {
    async fn connect(
        &self,
        node: &NodeConfig,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Result<(), PlayerError> {
        // Probe de versión como handshake
        self.http
            .get(format!("{}/version", Self::base_url(node)))
            .header("Authorization", &node.password)
            .send()
            .await?
            .error_for_status()?;

        // Reanudación de sesión si hay clave configurada
        if let Some(resume_key) = &node.resume_key {
            let body = serde_json::json!({
                "resuming": { "key": resume_key, "timeout": node.resume_timeout.as_secs() },
            });
            self.http
                .patch(format!("{}/sessions/{}", Self::base_url(node), node.identifier))
                .header("Authorization", &node.password)
                .json(&body)
                .send()
                .await?
                .error_for_status()?;
        }

        self.spawn_event_poll(node.clone(), events);
        Ok(())
    }

    async fn load_tracks(
        &self,
        node: &NodeConfig,
        identifier: &str,
    ) -> Result<LoadResult, PlayerError> {
        let url = format!(
            "{}/loadtracks?identifier={}",
            Self::base_url(node),
            urlencoding::encode(identifier)
        );

        let result = self
            .http
            .get(url)
            .header("Authorization", &node.password)
            .send()
            .await?
            .error_for_status()?
            .json::<LoadResult>()
            .await?;

        Ok(result)
    }

    async fn node_stats(&self, node: &NodeConfig) -> Result<NodeStatsPayload, PlayerError> {
        let stats = self
            .http
            .get(format!("{}/stats", Self::base_url(node)))
            .header("Authorization", &node.password)
            .send()
            .await?
            .error_for_status()?
            .json::<NodeStatsPayload>()
            .await?;

        Ok(stats)
    }

    async fn update_player(
        &self,
        node: &NodeConfig,
        guild: GuildId,
        op: PlayerOp,
    ) -> Result<(), PlayerError> {
        self.http
            .patch(format!("{}/players/{}", Self::base_url(node), guild))
            .header("Authorization", &node.password)
            .json(&op.to_body())
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    async fn destroy_player(&self, node: &NodeConfig, guild: GuildId) -> Result<(), PlayerError> {
        self.http
            .delete(format!("{}/players/{}", Self::base_url(node), guild))
            .header("Authorization", &node.password)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node() -> NodeConfig {
        NodeConfig {
            identifier: "n0".into(),
            host: "localhost".into(),
            port: 1,
            password: "secreto".into(),
            region: "us".into(),
            ssl: false,
            capacity: 100,
            resume_key: None,
            resume_timeout: Duration::from_secs(60),
            reconnect_attempts: 0,
        }
    }

    #[tokio::test]
    async fn reconectar_cancela_el_poller_anterior() {
        let transport = RestTransport::new(Duration::from_millis(100)).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let node = test_node();

        transport.spawn_event_poll(node.clone(), tx.clone());
        let first = transport
            .pollers
            .lock()
            .get(&node.identifier)
            .cloned()
            .unwrap();
        assert!(!first.is_cancelled());

        // Una segunda conexión del mismo nodo reemplaza el poller; el
        // anterior queda cancelado y deja de consumir /events
        transport.spawn_event_poll(node.clone(), tx);
        assert!(first.is_cancelled());

        let second = transport
            .pollers
            .lock()
            .get(&node.identifier)
            .cloned()
            .unwrap();
        assert!(!second.is_cancelled());
    }

    #[tokio::test]
    async fn pollers_de_nodos_distintos_no_se_pisan() {
        let transport = RestTransport::new(Duration::from_millis(100)).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let mut other = test_node();
        other.identifier = "n1".into();

        transport.spawn_event_poll(test_node(), tx.clone());
        transport.spawn_event_poll(other, tx);

        let pollers = transport.pollers.lock();
        assert!(!pollers.get("n0").unwrap().is_cancelled());
        assert!(!pollers.get("n1").unwrap().is_cancelled());
    }
}
