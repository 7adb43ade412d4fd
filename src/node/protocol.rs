use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

use crate::model::{GuildId, Platform, Track};

/// Clase de consulta detectada
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    /// Enlace directo a una plataforma conocida
    DirectUrl(Platform),
    /// Prefijo explícito de plataforma (`yt:`, `sc:`, `sp:`)
    PlatformSearch(Platform),
    /// Texto libre: búsqueda en la plataforma por defecto
    DefaultSearch,
}

/// Consulta lista para enviarse a un nodo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub identifier: String,
    pub kind: QueryKind,
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^https?://([^/\s]+)").expect("regex de URL inválida"))
}

/// Detecta la fuente de una consulta por su forma: enlace directo,
/// prefijo `plataforma:` explícito, o texto de búsqueda libre.
pub fn parse_query(raw: &str) -> SearchQuery {
    let raw = raw.trim();

    // Prefijos explícitos de plataforma
    for (prefixes, platform, search_tag) in [
        (&["yt:", "ytsearch:"][..], Platform::YouTube, "ytsearch"),
        (&["sc:", "scsearch:"][..], Platform::SoundCloud, "scsearch"),
        (&["sp:", "spsearch:"][..], Platform::Spotify, "spsearch"),
    ] {
        for prefix in prefixes {
            if let Some(rest) = raw.strip_prefix(prefix) {
                return SearchQuery {
                    identifier: format!("{}:{}", search_tag, rest.trim()),
                    kind: QueryKind::PlatformSearch(platform),
                };
            }
        }
    }

    // Enlace directo: la plataforma se deduce del host
    if let Some(caps) = url_regex().captures(raw) {
        let host = caps.get(1).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
        let platform = if host.contains("youtube.com") || host.contains("youtu.be") {
            Platform::YouTube
        } else if host.contains("soundcloud.com") {
            Platform::SoundCloud
        } else if host.contains("spotify.com") {
            Platform::Spotify
        } else if host.contains("bandcamp.com") {
            Platform::Bandcamp
        } else if host.contains("twitch.tv") {
            Platform::Twitch
        } else {
            Platform::Http
        };

        return SearchQuery {
            identifier: raw.to_string(),
            kind: QueryKind::DirectUrl(platform),
        };
    }

    // Texto libre: búsqueda en la plataforma por defecto
    SearchQuery {
        identifier: format!("ytsearch:{}", raw),
        kind: QueryKind::DefaultSearch,
    }
}

/// Track tal como lo serializa el nodo
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackPayload {
    pub identifier: String,
    pub title: String,
    pub author: Option<String>,
    /// Duración en milisegundos
    pub length: Option<u64>,
    pub source_name: Option<String>,
    pub uri: String,
}

impl TrackPayload {
    pub fn into_track(self) -> Track {
        let platform = match self.source_name.as_deref() {
            Some("youtube") => Platform::YouTube,
            Some("soundcloud") => Platform::SoundCloud,
            Some("spotify") => Platform::Spotify,
            Some("bandcamp") => Platform::Bandcamp,
            Some("twitch") => Platform::Twitch,
            _ => Platform::Http,
        };

        Track {
            id: self.identifier,
            title: self.title,
            artist: self.author,
            duration_ms: self.length,
            platform,
            uri: self.uri,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistPayload {
    pub name: String,
    pub tracks: Vec<TrackPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionPayload {
    pub message: Option<String>,
    pub severity: Option<String>,
}

/// Resultado de una carga de tracks, discriminado por `loadType`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "loadType")]
pub enum LoadResult {
    Track { data: TrackPayload },
    Playlist { data: PlaylistPayload },
    Search { data: Vec<TrackPayload> },
    Empty,
    Error { data: ExceptionPayload },
}

impl LoadResult {
    /// Aplana el resultado a una lista de tracks compartibles.
    /// `Empty` y `Error` producen lista vacía: la búsqueda nunca
    /// propaga errores al llamador.
    pub fn into_tracks(self) -> Vec<Arc<Track>> {
        match self {
            LoadResult::Track { data } => vec![Arc::new(data.into_track())],
            LoadResult::Playlist { data } => data
                .tracks
                .into_iter()
                .map(|t| Arc::new(t.into_track()))
                .collect(),
            LoadResult::Search { data } => {
                data.into_iter().map(|t| Arc::new(t.into_track())).collect()
            }
            LoadResult::Empty | LoadResult::Error { .. } => Vec::new(),
        }
    }
}

/// Estadísticas reportadas por un nodo
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatsPayload {
    pub players: u32,
    pub playing_players: u32,
}

/// Parámetros del filtro de escala temporal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timescale {
    pub speed: f64,
    pub pitch: f64,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tremolo {
    pub frequency: f64,
    pub depth: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EqBand {
    pub band: u8,
    pub gain: f32,
}

/// Conjunto completo de filtros. Se reenvía entero al nodo en cada
/// toggle, nunca de forma incremental.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timescale: Option<Timescale>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tremolo: Option<Tremolo>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub equalizer: Vec<EqBand>,
}

/// Operación sobre el player de un guild en el nodo
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerOp {
    Play { uri: String, position_ms: u64 },
    Pause(bool),
    Stop,
    Seek(u64),
    Volume(u16),
    Filters(FilterPayload),
}

impl PlayerOp {
    /// Cuerpo JSON del PATCH al player
    pub fn to_body(&self) -> serde_json::Value {
        match self {
            PlayerOp::Play { uri, position_ms } => serde_json::json!({
                "track": { "encoded": uri },
                "position": position_ms,
            }),
            PlayerOp::Pause(paused) => serde_json::json!({ "paused": paused }),
            PlayerOp::Stop => serde_json::json!({ "track": { "encoded": null } }),
            PlayerOp::Seek(position) => serde_json::json!({ "position": position }),
            PlayerOp::Volume(volume) => serde_json::json!({ "volume": volume }),
            PlayerOp::Filters(filters) => serde_json::json!({ "filters": filters }),
        }
    }
}

/// Motivo de fin de track según el nodo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WireEndReason {
    Finished,
    Stopped,
    Replaced,
    Cleanup,
    LoadFailed,
}

impl WireEndReason {
    /// `Replaced` y `Stopped` vienen de acciones nuestras: el dispatch de
    /// siguiente track ya ocurrió (o va a ocurrir) por otra vía
    pub fn may_start_next(&self) -> bool {
        matches!(self, WireEndReason::Finished | WireEndReason::LoadFailed)
    }
}

/// Evento asíncrono entregado por un nodo
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum NodeEvent {
    #[serde(rename = "TrackStartEvent")]
    TrackStart { guild_id: GuildId },
    #[serde(rename = "TrackEndEvent")]
    TrackEnd {
        guild_id: GuildId,
        reason: WireEndReason,
    },
    #[serde(rename = "TrackExceptionEvent")]
    TrackException {
        guild_id: GuildId,
        message: String,
    },
    #[serde(rename = "TrackStuckEvent")]
    TrackStuck {
        guild_id: GuildId,
        threshold_ms: u64,
    },
}
