//! One-shot memoization and embedded resources.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use log::debug;
use tokio::sync::Mutex as AsyncMutex;

/// A lazily computed value that runs its producer at most once and caches
/// the outcome, value or error alike. Re-reads return the cached outcome
/// without re-running the producer.
#[derive(Debug, Default)]
pub struct Memoized<T, E> {
    cell: AsyncMutex<Option<Result<T, E>>>,
}

impl<T: Clone, E: Clone> Memoized<T, E> {
    pub fn new() -> Self {
        Memoized {
            cell: AsyncMutex::new(None),
        }
    }

    /// Returns the cached outcome, computing it with `producer` on first
    /// use. Concurrent first calls are serialized, so the producer runs
    /// exactly once per instance.
    pub async fn get_or_init<F, Fut>(&self, producer: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut slot = self.cell.lock().await;
        if slot.is_none() {
            *slot = Some(producer().await);
        }
        slot.as_ref().expect("just initialized").clone()
    }
}

/// A blob compiled into the binary, extractable to a file on disk.
///
/// Extraction is lazy and happens under a process-wide temporary root that
/// is itself created lazily. Two resources with the same name share one
/// extracted path, however many `Resource` values refer to it.
#[derive(Clone, Copy, Debug)]
pub struct Resource {
    name: &'static str,
    bytes: &'static [u8],
}

static EXTRACTED: OnceLock<Mutex<HashMap<&'static str, PathBuf>>> = OnceLock::new();
static RESOURCE_ROOT: OnceLock<PathBuf> = OnceLock::new();

impl Resource {
    pub const fn named(name: &'static str, bytes: &'static [u8]) -> Self {
        Resource { name, bytes }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Extracts the resource to a path on disk, reusing the previously
    /// extracted file for this name if there is one.
    pub fn to_path(&self) -> io::Result<PathBuf> {
        let registry = EXTRACTED.get_or_init(|| Mutex::new(HashMap::new()));
        let mut extracted = registry.lock().unwrap();
        if let Some(path) = extracted.get(self.name) {
            return Ok(path.clone());
        }

        let root = resource_root()?;
        let path = root.join(self.name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, self.bytes)?;
        debug!("extracted resource {} to {}", self.name, path.display());
        extracted.insert(self.name, path.clone());
        Ok(path)
    }
}

fn resource_root() -> io::Result<&'static Path> {
    if let Some(root) = RESOURCE_ROOT.get() {
        return Ok(root);
    }
    let dir = tempfile::Builder::new()
        .prefix("resources")
        .tempdir()?
        .keep();
    // A racing initializer may have won; its directory is the shared root
    // and ours is left unused.
    Ok(RESOURCE_ROOT.get_or_init(|| dir))
}
