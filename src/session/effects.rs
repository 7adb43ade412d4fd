use std::collections::BTreeSet;
use tracing::info;

use crate::node::protocol::{EqBand, FilterPayload, Timescale, Tremolo};

/// Efectos de audio disponibles como toggles con nombre
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Effect {
    Nightcore,
    Slow,
    Vaporwave,
    Bassboost,
}

impl Effect {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "nightcore" => Some(Effect::Nightcore),
            "slow" => Some(Effect::Slow),
            "vaporwave" => Some(Effect::Vaporwave),
            "bassboost" => Some(Effect::Bassboost),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Nightcore => "nightcore",
            Effect::Slow => "slow",
            Effect::Vaporwave => "vaporwave",
            Effect::Bassboost => "bassboost",
        }
    }
}

/// Conjunto de efectos activos de una sesión. En cada toggle se
/// reconstruye el payload de filtros completo y se reenvía entero al
/// nodo, nunca de forma incremental.
#[derive(Debug, Default)]
pub struct EffectSet {
    active: BTreeSet<Effect>,
}

impl EffectSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activa o desactiva el efecto; retorna si quedó activo
    pub fn toggle(&mut self, effect: Effect) -> bool {
        if self.active.remove(&effect) {
            info!("🎛️ Efecto desactivado: {}", effect.as_str());
            false
        } else {
            self.active.insert(effect);
            info!("🎛️ Efecto activado: {}", effect.as_str());
            true
        }
    }

    pub fn is_active(&self, effect: Effect) -> bool {
        self.active.contains(&effect)
    }

    pub fn active(&self) -> impl Iterator<Item = &Effect> {
        self.active.iter()
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }

    /// Reconstruye el conjunto completo de filtros desde cero. Los
    /// efectos de escala temporal se componen multiplicativamente.
    pub fn to_filters(&self) -> FilterPayload {
        let mut speed: f64 = 1.0;
        let mut pitch: f64 = 1.0;
        let mut tremolo = None;
        let mut equalizer = Vec::new();

        for effect in &self.active {
            match effect {
                Effect::Nightcore => {
                    speed *= 1.2;
                    pitch *= 1.2;
                }
                Effect::Slow => {
                    speed *= 0.8;
                }
                Effect::Vaporwave => {
                    speed *= 0.85;
                    pitch *= 0.8;
                    tremolo = Some(Tremolo {
                        frequency: 14.0,
                        depth: 0.3,
                    });
                }
                Effect::Bassboost => {
                    equalizer = (0..=4u8)
                        .map(|band| EqBand {
                            band,
                            gain: 0.25 - band as f32 * 0.05,
                        })
                        .collect();
                }
            }
        }

        let timescale = if (speed - 1.0).abs() > f64::EPSILON || (pitch - 1.0).abs() > f64::EPSILON
        {
            Some(Timescale {
                speed,
                pitch,
                rate: 1.0,
            })
        } else {
            None
        };

        FilterPayload {
            timescale,
            tremolo,
            equalizer,
        }
    }
}
