//! Sinal de cancelamento cooperativo compartilhado entre workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Token clonável; cancelar qualquer clone cancela todos.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marca o cancelamento. Retorna `true` só para a primeira chamada.
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
