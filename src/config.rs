use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Descriptor de conexión de un nodo de audio externo
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    pub identifier: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub region: String,
    pub ssl: bool,
    /// Capacidad nominal de players para el cálculo de carga
    pub capacity: u32,
    pub resume_key: Option<String>,
    pub resume_timeout: Duration,
    pub reconnect_attempts: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Nodos de audio
    pub nodes: Vec<NodeConfig>,
    pub connect_timeout: Duration,
    pub search_timeout: Duration,
    pub health_interval: Duration,
    /// Porcentaje de carga a partir del cual el nodo activo cede el puesto
    pub overload_threshold: u8,

    // Caché
    pub cache_capacity_bytes: usize,
    pub search_ttl: Duration,
    pub track_ttl: Duration,
    pub metadata_ttl: Duration,
    pub user_ttl: Duration,
    pub cache_cleanup_interval: Duration,
    pub cache_retune_interval: Duration,

    // Prefetch (parámetros ajustables, no constantes mágicas)
    pub prefetch_decay_factor: f64,
    pub prefetch_prune_threshold: f64,
    pub prefetch_decay_interval: Duration,

    // Sesiones
    pub max_queue_size: usize,
    pub max_history: usize,
    pub idle_teardown: Duration,
    pub enable_autoplay: bool,

    // Rendimiento
    pub worker_threads: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            nodes: parse_nodes(
                &std::env::var("AUDIO_NODES")
                    .unwrap_or_else(|_| "main@localhost:2333:youshallnotpass:us".to_string()),
            )?,
            connect_timeout: env_secs("NODE_CONNECT_TIMEOUT", 15)?,
            search_timeout: env_secs("SEARCH_TIMEOUT", 20)?,
            health_interval: env_secs("HEALTH_INTERVAL", 30)?,
            overload_threshold: std::env::var("OVERLOAD_THRESHOLD")
                .unwrap_or_else(|_| "80".to_string())
                .parse()?,

            cache_capacity_bytes: std::env::var("CACHE_CAPACITY_BYTES")
                .unwrap_or_else(|_| "8388608".to_string()) // 8 MiB
                .parse()?,
            search_ttl: env_secs("SEARCH_TTL", 1800)?, // 30 minutos
            track_ttl: env_secs("TRACK_TTL", 7200)?,   // 2 horas
            metadata_ttl: env_secs("METADATA_TTL", 3600)?,
            user_ttl: env_secs("USER_TTL", 900)?,
            cache_cleanup_interval: env_secs("CACHE_CLEANUP_INTERVAL", 300)?,
            cache_retune_interval: env_secs("CACHE_RETUNE_INTERVAL", 3600)?,

            prefetch_decay_factor: std::env::var("PREFETCH_DECAY_FACTOR")
                .unwrap_or_else(|_| "0.85".to_string())
                .parse()?,
            prefetch_prune_threshold: std::env::var("PREFETCH_PRUNE_THRESHOLD")
                .unwrap_or_else(|_| "0.05".to_string())
                .parse()?,
            prefetch_decay_interval: env_secs("PREFETCH_DECAY_INTERVAL", 600)?,

            max_queue_size: std::env::var("MAX_QUEUE_SIZE")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()?,
            max_history: std::env::var("MAX_HISTORY")
                .unwrap_or_else(|_| "50".to_string())
                .parse()?,
            idle_teardown: env_secs("IDLE_TEARDOWN", 300)?, // 5 minutos
            enable_autoplay: std::env::var("ENABLE_AUTOPLAY")
                .unwrap_or_else(|_| "false".to_string())
                .parse()?,

            worker_threads: match std::env::var("WORKER_THREADS") {
                Ok(val) if !val.trim().is_empty() => val.parse()?,
                _ => num_cpus::get(),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            anyhow::bail!("Se requiere al menos un nodo de audio en AUDIO_NODES");
        }

        if self.overload_threshold == 0 || self.overload_threshold > 100 {
            anyhow::bail!(
                "El umbral de sobrecarga debe estar entre 1 y 100, recibido: {}",
                self.overload_threshold
            );
        }

        if self.cache_capacity_bytes == 0 {
            anyhow::bail!("La capacidad del caché debe ser mayor a 0");
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("El tamaño máximo de cola debe ser mayor a 0");
        }

        if !(0.0..1.0).contains(&self.prefetch_decay_factor) {
            anyhow::bail!(
                "El factor de decaimiento debe estar en [0, 1), recibido: {}",
                self.prefetch_decay_factor
            );
        }

        if self.prefetch_prune_threshold < 0.0 {
            anyhow::bail!("El umbral de poda no puede ser negativo");
        }

        Ok(())
    }

    /// Resumen seguro para logging (sin credenciales)
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Nodos: {} ({})\n  \
            Caché: {} KiB, TTLs s/t/m/u = {}s/{}s/{}s/{}s\n  \
            Sesiones: cola máx {}, historial {}, idle {}s, autoplay={}\n  \
            Salud: poll {}s, sobrecarga {}%",
            self.nodes.len(),
            self.nodes
                .iter()
                .map(|n| format!("{}@{}:{}", n.identifier, n.host, n.port))
                .collect::<Vec<_>>()
                .join(", "),
            self.cache_capacity_bytes / 1024,
            self.search_ttl.as_secs(),
            self.track_ttl.as_secs(),
            self.metadata_ttl.as_secs(),
            self.user_ttl.as_secs(),
            self.max_queue_size,
            self.max_history,
            self.idle_teardown.as_secs(),
            self.enable_autoplay,
            self.health_interval.as_secs(),
            self.overload_threshold,
        )
    }
}

/// Parsea la lista de nodos: `id@host:puerto:password:region[:capacidad]`,
/// separados por `;`
fn parse_nodes(raw: &str) -> Result<Vec<NodeConfig>> {
    let mut nodes = Vec::new();

    for (idx, desc) in raw.split(';').filter(|s| !s.trim().is_empty()).enumerate() {
        let desc = desc.trim();
        let (identifier, rest) = match desc.split_once('@') {
            Some((id, rest)) => (id.to_string(), rest),
            None => (format!("node-{}", idx), desc),
        };

        let parts: Vec<&str> = rest.split(':').collect();
        if parts.len() < 4 {
            anyhow::bail!(
                "Descriptor de nodo inválido '{}': se espera host:puerto:password:region",
                desc
            );
        }

        nodes.push(NodeConfig {
            identifier,
            host: parts[0].to_string(),
            port: parts[1]
                .parse()
                .map_err(|_| anyhow::anyhow!("Puerto inválido en '{}'", desc))?,
            password: parts[2].to_string(),
            region: parts[3].to_string(),
            ssl: false,
            capacity: parts
                .get(4)
                .map(|c| c.parse())
                .transpose()
                .map_err(|_| anyhow::anyhow!("Capacidad inválida en '{}'", desc))?
                .unwrap_or(100),
            resume_key: std::env::var("NODE_RESUME_KEY").ok(),
            resume_timeout: Duration::from_secs(60),
            reconnect_attempts: 3,
        });
    }

    Ok(nodes)
}

fn env_secs(key: &str, default: u64) -> Result<Duration> {
    let secs: u64 = std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()?;
    Ok(Duration::from_secs(secs))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nodes: vec![NodeConfig {
                identifier: "main".into(),
                host: "localhost".into(),
                port: 2333,
                password: "youshallnotpass".into(),
                region: "us".into(),
                ssl: false,
                capacity: 100,
                resume_key: None,
                resume_timeout: Duration::from_secs(60),
                reconnect_attempts: 3,
            }],
            connect_timeout: Duration::from_secs(15),
            search_timeout: Duration::from_secs(20),
            health_interval: Duration::from_secs(30),
            overload_threshold: 80,

            cache_capacity_bytes: 8 * 1024 * 1024,
            search_ttl: Duration::from_secs(1800),
            track_ttl: Duration::from_secs(7200),
            metadata_ttl: Duration::from_secs(3600),
            user_ttl: Duration::from_secs(900),
            cache_cleanup_interval: Duration::from_secs(300),
            cache_retune_interval: Duration::from_secs(3600),

            prefetch_decay_factor: 0.85,
            prefetch_prune_threshold: 0.05,
            prefetch_decay_interval: Duration::from_secs(600),

            max_queue_size: 1000,
            max_history: 50,
            idle_teardown: Duration::from_secs(300),
            enable_autoplay: false,

            worker_threads: num_cpus::get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parsea_lista_de_nodos() {
        let nodes =
            parse_nodes("main@lava1.local:2333:secreto:us;eu@lava2.local:2333:secreto:eu:50")
                .unwrap();

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].identifier, "main");
        assert_eq!(nodes[0].host, "lava1.local");
        assert_eq!(nodes[0].region, "us");
        assert_eq!(nodes[0].capacity, 100);
        assert_eq!(nodes[1].identifier, "eu");
        assert_eq!(nodes[1].capacity, 50);
    }

    #[test]
    fn rechaza_descriptor_incompleto() {
        assert!(parse_nodes("solo-host:2333").is_err());
    }

    #[test]
    fn valida_umbral_de_sobrecarga() {
        let mut config = Config::default();
        config.overload_threshold = 0;
        assert!(config.validate().is_err());

        config.overload_threshold = 101;
        assert!(config.validate().is_err());

        config.overload_threshold = 80;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn valida_factor_de_decaimiento() {
        let mut config = Config::default();
        config.prefetch_decay_factor = 1.0;
        assert!(config.validate().is_err());

        config.prefetch_decay_factor = 0.85;
        assert!(config.validate().is_ok());
    }
}
