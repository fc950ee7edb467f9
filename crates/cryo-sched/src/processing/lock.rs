//! Coordination between workers sharing a run directory.
//!
//! Workers never talk to each other. The only signal is a claim marker
//! file per item in the run directory.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{SchedError, SchedResult};

/// Result of trying to claim an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This worker owns the item until it releases the marker.
    Acquired,
    /// Another worker appears to be working on the item.
    Busy,
}

/// Strategy for claiming an item through a marker path.
#[async_trait]
pub trait ItemLock: Send + Sync {
    async fn try_claim(&self, path: &Path) -> SchedResult<Claim>;

    /// Remove the marker. A missing marker is not an error.
    async fn release(&self, path: &Path) -> SchedResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SchedError::IoError(e)),
        }
    }
}

fn marker_contents() -> String {
    format!(
        "pid {} at {}\n",
        std::process::id(),
        chrono::Utc::now().to_rfc3339()
    )
}

/// Advisory lock: an existing marker means busy, otherwise the marker is
/// written.
///
/// This is not a mutex. Two workers that both check before either writes
/// will both claim the item and both dispatch it. The run registry keeps
/// the outcome consistent (the last commit wins), so the race costs
/// duplicate work only.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExistenceCheck;

#[async_trait]
impl ItemLock for ExistenceCheck {
    async fn try_claim(&self, path: &Path) -> SchedResult<Claim> {
        if fs::try_exists(path).await? {
            return Ok(Claim::Busy);
        }
        fs::write(path, marker_contents()).await?;
        Ok(Claim::Acquired)
    }
}

/// Atomic claim: the marker is created with `O_EXCL`, so exactly one
/// worker wins on a local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateExclusive;

#[async_trait]
impl ItemLock for CreateExclusive {
    async fn try_claim(&self, path: &Path) -> SchedResult<Claim> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(file) => {
                drop(file);
                fs::write(path, marker_contents()).await?;
                Ok(Claim::Acquired)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(Claim::Busy),
            Err(e) => Err(SchedError::IoError(e)),
        }
    }
}

/// Configurable choice of [`ItemLock`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStrategy {
    /// [`ExistenceCheck`]
    #[default]
    Existence,
    /// [`CreateExclusive`]
    Exclusive,
}

impl LockStrategy {
    pub fn build(&self) -> Arc<dyn ItemLock> {
        match self {
            LockStrategy::Existence => Arc::new(ExistenceCheck),
            LockStrategy::Exclusive => Arc::new(CreateExclusive),
        }
    }
}

impl FromStr for LockStrategy {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "existence" => Ok(LockStrategy::Existence),
            "exclusive" => Ok(LockStrategy::Exclusive),
            other => Err(SchedError::ConfigError(format!(
                "Unknown lock strategy '{other}': expected existence or exclusive"
            ))),
        }
    }
}
