//! The delta pipeline's pluggable external-tool collaborator (spec.md §4.7,
//! §9): applying the patch itself is out of scope for correctness
//! guarantees, only the plumbing around it is.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::from_io;
use store_core::StoreResult;

/// Applies a binary delta against a known source blob, producing the target
/// file. Real implementations shell out to a format-specific tool; tests
/// substitute a fake.
#[async_trait]
pub trait DeltaApplier: Send + Sync {
    async fn apply(&self, source: &Path, delta: &Path, target: &Path) -> StoreResult<()>;
}

/// Shells out to an external `xdelta3`-compatible binary with
/// `-d -s <source> <delta> <target>` (spec.md §4.7).
pub struct ProcessDeltaApplier {
    binary: PathBuf,
}

impl ProcessDeltaApplier {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for ProcessDeltaApplier {
    fn default() -> Self {
        Self::new("xdelta3")
    }
}

#[async_trait]
impl DeltaApplier for ProcessDeltaApplier {
    async fn apply(&self, source: &Path, delta: &Path, target: &Path) -> StoreResult<()> {
        let status = Command::new(&self.binary)
            .arg("-d")
            .arg("-s")
            .arg(source)
            .arg(delta)
            .arg(target)
            .status()
            .await
            .map_err(from_io)?;

        if !status.success() {
            let _ = tokio::fs::remove_file(target).await;
            return Err(store_core::StoreError::Other(format!(
                "delta tool exited with {status}"
            )));
        }

        Ok(())
    }
}
