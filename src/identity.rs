//! Persistent machine identifier
//!
//! The client id presented to the broker is the configured client name
//! followed by a machine id generated once and cached on disk, so restarts
//! reuse the same identity.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Failed to read machine id from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write machine id to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Return the cached machine id, generating and storing one if needed
///
/// A missing or blank file gets a fresh UUID.
pub fn load_or_create(path: &Path) -> Result<String, IdentityError> {
    if path.exists() {
        let content = std::fs::read_to_string(path).map_err(|source| IdentityError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let machine_id = content.trim();
        if !machine_id.is_empty() {
            return Ok(machine_id.to_string());
        }
    }

    let machine_id = Uuid::new_v4().to_string();
    std::fs::write(path, &machine_id).map_err(|source| IdentityError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), %machine_id, "Generated new machine id");
    Ok(machine_id)
}

/// Client id sent in CONNECT: name immediately followed by the machine id
pub fn client_id(name: &str, machine_id: &str) -> String {
    format!("{name}{machine_id}")
}
