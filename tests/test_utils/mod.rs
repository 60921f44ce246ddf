use std::{
    path::PathBuf,
    sync::atomic::{AtomicU32, Ordering},
};

use rand::Rng;

static NEXT_DB: AtomicU32 = AtomicU32::new(0);

/// # Conduct the initialization
///
/// - Setting up log configurations.
pub fn setup() {
    dom_db::log::init_log();
}

/// A fresh database path per call, so tests never share a file.
pub fn db_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "dom_db_test_{}_{}_{}.db",
        name,
        std::process::id(),
        NEXT_DB.fetch_add(1, Ordering::Relaxed)
    ));
    if path.exists() {
        std::fs::remove_file(&path).unwrap();
    }
    path
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf[..]);
    buf
}

/// Deterministic payload for a gid, distinguishable across nodes.
pub fn payload(gid: i64, len: usize) -> Vec<u8> {
    (0..len).map(|i| (gid as usize + i) as u8).collect()
}
