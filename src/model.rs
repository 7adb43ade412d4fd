use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};

/// Identificador de guild (servidor de chat)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GuildId(pub u64);

/// Identificador de usuario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub u64);

/// Identificador de un nodo de audio
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl fmt::Display for GuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Plataforma de origen de un track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    YouTube,
    SoundCloud,
    Spotify,
    Bandcamp,
    Twitch,
    Http,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::YouTube => "youtube",
            Platform::SoundCloud => "soundcloud",
            Platform::Spotify => "spotify",
            Platform::Bandcamp => "bandcamp",
            Platform::Twitch => "twitch",
            Platform::Http => "http",
        }
    }
}

/// Representa un track de música. Inmutable una vez creado; la propiedad
/// se comparte en solo-lectura (`Arc<Track>`) entre cola e historial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: Option<String>,
    pub duration_ms: Option<u64>,
    pub platform: Platform,
    pub uri: String,
}

impl Track {
    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::from_millis)
    }
}

/// Wrapper de encolado: el requester y el instante de alta se fijan al
/// entrar a la cola, nunca mutando el `Track` compartido.
#[derive(Debug, Clone)]
pub struct QueuedTrack {
    pub track: Arc<Track>,
    pub requested_by: UserId,
    pub added_at: DateTime<Utc>,
}

impl QueuedTrack {
    pub fn new(track: Arc<Track>, requested_by: UserId) -> Self {
        Self {
            track,
            requested_by,
            added_at: Utc::now(),
        }
    }
}

/// Motivo por el que terminó un track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Llegó a su fin de forma natural
    Finished,
    /// Detenido por un skip (votado o forzado)
    Skipped,
    /// Reemplazado por otro `play`
    Replaced,
    /// El nodo reportó una falla y se avanzó automáticamente
    Fault,
    /// La sesión fue destruida
    Teardown,
}
