//! Generation state visible without the session lock.
//!
//! A controlling thread reads [`GenerationController::is_generating`] and
//! calls [`GenerationController::request_stop`] while the generating thread
//! holds the session mutex for the whole decode loop. Neither call touches
//! that mutex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct GenerationController {
    in_progress: AtomicBool,
    /// Token for the current (or most recent) generation.
    current: Mutex<CancellationToken>,
}

impl GenerationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a generation as started and install a fresh stop token.
    ///
    /// The returned guard clears `in_progress` when dropped, on every exit path.
    pub fn begin(&self) -> GenerationGuard<'_> {
        let token = CancellationToken::new();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        self.in_progress.store(true, Ordering::SeqCst);
        GenerationGuard {
            controller: self,
            token,
        }
    }

    /// Ask the current generation to stop. Does not wait for it.
    pub fn request_stop(&self) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    pub fn is_generating(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }
}

/// Scope of one generation call.
pub struct GenerationGuard<'a> {
    controller: &'a GenerationController,
    token: CancellationToken,
}

impl GenerationGuard<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// True once either the session's stop token or `caller` is cancelled.
    pub fn should_stop(&self, caller: &CancellationToken) -> bool {
        self.token.is_cancelled() || caller.is_cancelled()
    }
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        self.controller.in_progress.store(false, Ordering::SeqCst);
    }
}
