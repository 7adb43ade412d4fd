use thiserror::Error;

/// Errores del núcleo de reproducción
#[derive(Debug, Error)]
pub enum PlayerError {
    /// Ningún nodo de audio saludable disponible
    #[error("ningún nodo de audio disponible")]
    NodeUnavailable,

    /// La búsqueda excedió el tiempo límite (se absorbe como lista vacía)
    #[error("la búsqueda excedió el tiempo límite")]
    SearchTimeout,

    #[error("la cola está llena (máximo {0} canciones)")]
    QueueFull(usize),

    #[error("posición fuera de rango: {0}")]
    PositionOutOfRange(usize),

    #[error("error de red: {0}")]
    Http(#[from] reqwest::Error),

    #[error("error de protocolo: {0}")]
    Protocol(#[from] serde_json::Error),
}
