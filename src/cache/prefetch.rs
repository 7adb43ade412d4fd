use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use crate::model::Track;

/// Parámetros ajustables del predictor (ver configuración)
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    pub decay_factor: f64,
    pub prune_threshold: f64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            decay_factor: 0.85,
            prune_threshold: 0.05,
        }
    }
}

/// Candidato a siguiente reproducción, ordenado por peso de transición
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub track_id: String,
    pub weight: f64,
}

#[derive(Debug, Default)]
struct TransitionTables {
    /// track id -> (track id siguiente -> conteo decaído)
    tracks: HashMap<String, HashMap<String, f64>>,
    /// artista -> (artista siguiente -> conteo decaído)
    artists: HashMap<String, HashMap<String, f64>>,
}

/// Predictor de prefetch: aprende patrones de transición track→track y
/// artista→artista. Solo es una pista best-effort; nunca bloquea la
/// reproducción y sus fallas se ignoran en silencio.
#[derive(Debug)]
pub struct PrefetchModel {
    tables: Mutex<TransitionTables>,
    config: PrefetchConfig,
}

impl PrefetchModel {
    pub fn new(config: PrefetchConfig) -> Self {
        Self {
            tables: Mutex::new(TransitionTables::default()),
            config,
        }
    }

    /// Registra una reproducción: incrementa la arista desde el track
    /// inmediatamente anterior
    pub fn record_play(&self, previous: Option<&Track>, current: &Track) {
        let Some(previous) = previous else { return };
        if previous.id == current.id {
            return; // loop=track no aporta señal de transición
        }

        let mut tables = self.tables.lock();

        *tables
            .tracks
            .entry(previous.id.clone())
            .or_default()
            .entry(current.id.clone())
            .or_insert(0.0) += 1.0;

        if let (Some(prev_artist), Some(cur_artist)) = (&previous.artist, &current.artist) {
            *tables
                .artists
                .entry(prev_artist.to_lowercase())
                .or_default()
                .entry(cur_artist.to_lowercase())
                .or_insert(0.0) += 1.0;
        }
    }

    /// Rankea los candidatos a siguiente track por peso de transición
    pub fn predict_next(&self, track: &Track) -> Vec<Prediction> {
        let tables = self.tables.lock();
        let mut candidates: Vec<Prediction> = tables
            .tracks
            .get(&track.id)
            .map(|edges| {
                edges
                    .iter()
                    .map(|(id, weight)| Prediction {
                        track_id: id.clone(),
                        weight: *weight,
                    })
                    .collect()
            })
            .unwrap_or_default();

        candidates.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(std::cmp::Ordering::Equal));
        candidates
    }

    /// Artista más probable después del artista dado
    pub fn predict_artist(&self, artist: &str) -> Option<String> {
        let tables = self.tables.lock();
        tables
            .artists
            .get(&artist.to_lowercase())
            .and_then(|edges| {
                edges
                    .iter()
                    .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                    .map(|(artist, _)| artist.clone())
            })
    }

    /// Pasada periódica: multiplica todos los conteos por el factor de
    /// decaimiento y poda las aristas por debajo del umbral
    pub fn decay(&self) {
        let mut tables = self.tables.lock();
        let tables = &mut *tables;
        let factor = self.config.decay_factor;
        let threshold = self.config.prune_threshold;
        let mut pruned = 0usize;

        for table in [&mut tables.tracks, &mut tables.artists] {
            for edges in table.values_mut() {
                edges.retain(|_, weight| {
                    *weight *= factor;
                    if *weight < threshold {
                        pruned += 1;
                        false
                    } else {
                        true
                    }
                });
            }
            table.retain(|_, edges| !edges.is_empty());
        }

        if pruned > 0 {
            debug!("🍂 Decaimiento del predictor: {} aristas podadas", pruned);
        }
    }

    pub fn edge_count(&self) -> usize {
        let tables = self.tables.lock();
        tables.tracks.values().map(|e| e.len()).sum::<usize>()
            + tables.artists.values().map(|e| e.len()).sum::<usize>()
    }
}
