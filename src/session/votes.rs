use std::collections::HashSet;

use crate::model::UserId;

/// Resultado de registrar un voto de skip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Voto registrado, aún no alcanza el quórum
    Registered { votes: usize, required: usize },
    /// El usuario ya había votado (idempotente)
    Duplicate { votes: usize, required: usize },
    /// Este voto alcanzó el quórum: el skip debe ejecutarse exactamente
    /// una vez y el conjunto se limpia
    Passed,
}

/// Votación de skip del track actual. El conjunto se limpia en el
/// instante en que se ejecuta el skip o el track cambia por cualquier
/// otro motivo.
#[derive(Debug, Default)]
pub struct SkipVotes {
    voters: HashSet<UserId>,
}

impl SkipVotes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Quórum canónico: `ceil((oyentes + 1) / 2)` en aritmética entera,
    /// es decir mayoría estricta contando al propio reproductor.
    pub fn required_for(listeners: usize) -> usize {
        (listeners + 2) / 2
    }

    /// Registra un voto. El quórum se recalcula con el número de oyentes
    /// vigente justo antes de contar, porque puede cambiar entre votos.
    pub fn add_vote(&mut self, user: UserId, listeners: usize) -> VoteOutcome {
        let required = Self::required_for(listeners);

        if !self.voters.insert(user) {
            return VoteOutcome::Duplicate {
                votes: self.voters.len(),
                required,
            };
        }

        if self.voters.len() >= required {
            self.voters.clear();
            VoteOutcome::Passed
        } else {
            VoteOutcome::Registered {
                votes: self.voters.len(),
                required,
            }
        }
    }

    pub fn clear(&mut self) {
        self.voters.clear();
    }

    pub fn count(&self) -> usize {
        self.voters.len()
    }

    pub fn has_voted(&self, user: UserId) -> bool {
        self.voters.contains(&user)
    }
}
