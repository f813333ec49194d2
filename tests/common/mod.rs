//! Shared fixtures: scratch model manifests and loaded sessions.
#![allow(dead_code)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use llama_bridge::{Session, SessionConfig};
use llama_runtime::{ModelManifest, ReferenceEngine};
use tempfile::TempDir;

pub fn write_model(dir: &TempDir, manifest: &ModelManifest) -> PathBuf {
    let path = dir.path().join("model.json");
    manifest.write_to(&path).unwrap();
    path
}

/// A session over `engine` with `manifest` loaded at `n_ctx`.
pub fn session_with(engine: ReferenceEngine, manifest: ModelManifest, n_ctx: usize) -> (Session<ReferenceEngine>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_model(&dir, &manifest);
    let session = Session::with_config(engine, SessionConfig::default().with_seed(7));
    session.load(&path, Some(n_ctx), Some(2)).unwrap();
    (session, dir)
}

pub fn loaded_session(manifest: ModelManifest, n_ctx: usize) -> (Session<ReferenceEngine>, TempDir) {
    session_with(ReferenceEngine::new(), manifest, n_ctx)
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
