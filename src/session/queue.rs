use rand::seq::SliceRandom;
use std::{collections::VecDeque, time::Duration};
use tracing::{debug, info};

use crate::{
    error::PlayerError,
    model::{QueuedTrack, UserId},
};

/// Modo de repetición de la sesión
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    Off,
    Track,
    Queue,
}

/// Cola de reproducción de un guild: FIFO salvo shuffle, con historial
/// acotado de los últimos N tracks
#[derive(Debug)]
pub struct TrackQueue {
    items: VecDeque<QueuedTrack>,
    /// Orden previo al último shuffle, para poder restaurarlo exacto
    saved_order: Option<VecDeque<QueuedTrack>>,
    history: Vec<QueuedTrack>,
    max_size: usize,
    max_history: usize,
}

impl TrackQueue {
    pub fn new(max_size: usize, max_history: usize) -> Self {
        Self {
            items: VecDeque::new(),
            saved_order: None,
            history: Vec::new(),
            max_size,
            max_history,
        }
    }

    /// Agrega un track; sin posición va al final. Retorna la posición
    /// en la que quedó.
    pub fn add(&mut self, item: QueuedTrack, position: Option<usize>) -> Result<usize, PlayerError> {
        if self.items.len() >= self.max_size {
            return Err(PlayerError::QueueFull(self.max_size));
        }

        let position = match position {
            Some(pos) if pos > self.items.len() => {
                return Err(PlayerError::PositionOutOfRange(pos));
            }
            Some(pos) => pos,
            None => self.items.len(),
        };

        info!("➕ Agregado a la cola: {} (posición {})", item.track.title, position);
        self.items.insert(position, item);
        Ok(position)
    }

    /// Obtiene el siguiente track en orden FIFO
    pub fn pop_next(&mut self) -> Option<QueuedTrack> {
        let next = self.items.pop_front();
        if let Some(ref item) = next {
            debug!("➡️ Siguiente en cola: {}", item.track.title);
        }
        next
    }

    /// Re-encola al final (loop de cola)
    pub fn push_back(&mut self, item: QueuedTrack) {
        self.items.push_back(item);
    }

    pub fn remove(&mut self, position: usize) -> Result<QueuedTrack, PlayerError> {
        self.items
            .remove(position)
            .ok_or(PlayerError::PositionOutOfRange(position))
    }

    pub fn move_track(&mut self, from: usize, to: usize) -> Result<(), PlayerError> {
        if from >= self.items.len() {
            return Err(PlayerError::PositionOutOfRange(from));
        }
        if to >= self.items.len() {
            return Err(PlayerError::PositionOutOfRange(to));
        }

        if from != to {
            let item = self
                .items
                .remove(from)
                .ok_or(PlayerError::PositionOutOfRange(from))?;
            self.items.insert(to, item);
            debug!("📍 Track movido de posición {} a {}", from, to);
        }

        Ok(())
    }

    /// Mezcla la cola (Fisher–Yates) reteniendo el orden previo para
    /// que `restore` lo recupere exacto
    pub fn shuffle(&mut self) {
        if self.items.len() < 2 {
            return;
        }

        self.saved_order = Some(self.items.clone());

        let mut items: Vec<QueuedTrack> = self.items.drain(..).collect();
        let mut rng = rand::thread_rng();
        items.shuffle(&mut rng);
        self.items.extend(items);

        info!("🔀 Cola mezclada ({} tracks)", self.items.len());
    }

    /// Restaura el orden previo al último shuffle. Retorna `false` si no
    /// había orden guardado.
    pub fn restore(&mut self) -> bool {
        match self.saved_order.take() {
            Some(saved) => {
                self.items = saved;
                info!("↩️ Orden original de la cola restaurado");
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.saved_order = None;
        info!("🗑️ Cola limpiada");
    }

    /// Elimina tracks duplicados por URI
    pub fn remove_duplicates(&mut self) -> usize {
        let mut seen = std::collections::HashSet::new();
        let original_len = self.items.len();

        self.items.retain(|item| seen.insert(item.track.uri.clone()));

        let removed = original_len - self.items.len();
        if removed > 0 {
            info!("🗑️ Eliminados {} duplicados", removed);
        }
        removed
    }

    /// Elimina los tracks encolados por un usuario específico
    pub fn remove_by_user(&mut self, user_id: UserId) -> usize {
        let original_len = self.items.len();
        self.items.retain(|item| item.requested_by != user_id);

        let removed = original_len - self.items.len();
        if removed > 0 {
            info!("🗑️ Eliminadas {} canciones del usuario {}", removed, user_id);
        }
        removed
    }

    /// Registra un track reproducido en el historial acotado
    pub fn push_history(&mut self, item: QueuedTrack) {
        self.history.push(item);
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }
    }

    pub fn history(&self) -> &[QueuedTrack] {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedTrack> {
        self.items.iter()
    }

    pub fn total_duration(&self) -> Duration {
        self.items
            .iter()
            .filter_map(|item| item.track.duration())
            .sum()
    }

    /// Página de la cola para listados
    pub fn page(&self, page: usize, per_page: usize) -> Vec<QueuedTrack> {
        let page = page.max(1);
        let start = (page - 1) * per_page;
        self.items
            .iter()
            .skip(start)
            .take(per_page)
            .cloned()
            .collect()
    }
}
