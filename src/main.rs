use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

mod cache;
mod config;
mod error;
mod model;
mod node;
mod orchestrator;
mod session;

use crate::config::Config;
use crate::node::{client::NodeClient, transport::RestTransport};
use crate::orchestrator::{NoopHook, Orchestrator};

fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cadence=debug".parse()?)
                .add_directive("reqwest=info".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Cadence v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Arc::new(Config::load()?);
    info!("{}", config.summary());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Arc<Config>) -> Result<()> {
    // Conectar con el pool de nodos de audio; sin ninguno disponible no
    // tiene sentido arrancar
    let transport = Arc::new(RestTransport::new(config.search_timeout)?);
    let nodes = match NodeClient::connect(config.clone(), transport).await {
        Ok(nodes) => Arc::new(nodes),
        Err(e) => {
            error!("❌ No se pudo conectar con ningún nodo de audio: {}", e);
            return Err(e.into());
        }
    };

    // Arrancar el orquestador con sus loops de fondo
    let orchestrator = Orchestrator::new(config, nodes, Arc::new(NoopHook));
    let handles = orchestrator.start();

    info!("🚀 Orquestador corriendo, Ctrl+C para salir");
    tokio::signal::ctrl_c().await?;
    info!("⚠️ Señal de shutdown recibida, cerrando...");

    // Apagado ordenado: destruye sesiones y libera players en los nodos
    orchestrator.shutdown().await;
    for handle in handles {
        handle.abort();
    }

    Ok(())
}
