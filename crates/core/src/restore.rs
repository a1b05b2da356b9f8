// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Conductor Contributors
//
// This file is part of Conductor.
//
// Conductor is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Conductor is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Conductor. If not, see <https://www.gnu.org/licenses/>.

//! Restore index and history log
//!
//! The restore file is a best-effort index of `(partition, session)`
//! pairs for the currently running partitions, rewritten after every
//! Initialize and Shutdown. The replacement is atomic (temp file +
//! rename) so a crashed rewrite never corrupts the index. The history
//! log is purely informational: one line per Initialize.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorePartition {
    pub partition_id: String,
    pub session_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreData {
    pub partitions: Vec<RestorePartition>,
}

#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("restore file i/o failure at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("restore file {path} is corrupt: {source}")]
    Corrupt {
        path: String,
        source: serde_json::Error,
    },
}

/// Persistent restore index, addressed by a configurable id.
pub struct RestoreFile {
    id: String,
    dir: PathBuf,
}

impl RestoreFile {
    pub fn new(id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            dir: dir.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("conductor_{}_session.json", self.id))
    }

    /// Read the index; a missing file is an empty index.
    pub fn read(&self) -> Result<RestoreData, RestoreError> {
        let path = self.path();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RestoreData::default())
            }
            Err(source) => {
                return Err(RestoreError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        serde_json::from_str(&raw).map_err(|source| RestoreError::Corrupt {
            path: path.display().to_string(),
            source,
        })
    }

    /// Atomically replace the index.
    pub fn write(&self, data: &RestoreData) -> Result<(), RestoreError> {
        let path = self.path();
        let io_err = |source| RestoreError::Io {
            path: path.display().to_string(),
            source,
        };
        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        let raw = serde_json::to_string_pretty(data).map_err(|source| RestoreError::Corrupt {
            path: path.display().to_string(),
            source,
        })?;
        tmp.write_all(raw.as_bytes()).map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

/// Append one Initialize record to the partition's history log.
pub fn append_history(
    dir: &Path,
    partition_id: &str,
    run_nr: u64,
    session_id: &str,
) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{partition_id}_history.log"));
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(
        file,
        "{} | run {} | session {}",
        chrono::Utc::now().to_rfc3339(),
        run_nr,
        session_id
    )
}
