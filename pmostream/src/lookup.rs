//! Table bornée des jetons éphémères
//!
//! Chaque résultat de recherche publie une URL contenant un jeton opaque de
//! 36 caractères plutôt que la référence du backend. La table garde au plus
//! `max_entries` associations et évince la plus ancienne (FIFO) quand elle est
//! pleine. Une résolution ne retire jamais d'entrée : un transfert très lent
//! peut donc voir son jeton évincé pendant la diffusion.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::trace;
use uuid::Uuid;

/// Capacité par défaut de la table
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Longueur d'un jeton (UUID textuel en majuscules)
pub const TOKEN_LEN: usize = 36;

#[derive(Debug, Default)]
struct LookupInner {
    links: HashMap<String, String>,
    order: VecDeque<String>,
}

/// Association jeton → référence backend, bornée et FIFO
#[derive(Debug)]
pub struct LinkLookup {
    max_entries: usize,
    inner: Mutex<LookupInner>,
}

impl LinkLookup {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            inner: Mutex::new(LookupInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LookupInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enregistre une référence et retourne son nouveau jeton
    ///
    /// Quand la table est pleine, l'entrée la plus ancienne est évincée avant
    /// l'insertion. Ne peut pas échouer.
    pub fn insert(&self, reference: impl Into<String>) -> String {
        let reference = reference.into();
        let mut inner = self.lock();

        let mut token = new_token();
        while inner.links.contains_key(&token) {
            token = new_token();
        }

        // garde exactement max_entries liens, le dernier inclus ; ne pas descendre à max_entries - 1
        while inner.order.len() >= self.max_entries {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.links.remove(&oldest);
                    trace!(sid = %oldest, "Evicted oldest link");
                }
                None => break,
            }
        }

        inner.links.insert(token.clone(), reference);
        inner.order.push_back(token.clone());
        token
    }

    /// Retourne la référence associée au jeton, si elle n'a pas été évincée
    pub fn resolve(&self, token: &str) -> Option<String> {
        self.lock().links.get(token).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }
}

impl Default for LinkLookup {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

fn new_token() -> String {
    Uuid::new_v4().to_string().to_uppercase()
}
