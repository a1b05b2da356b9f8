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

//! Resource plugins and request triggers
//!
//! A resource plugin is an external executable that expands a
//! `(plugin, resources)` pair into worker-batch descriptors on stdout
//! (JSON array). The builtin `localhost` plugin parses
//! `key=value[,key=value...]` resource strings in-process. Request
//! triggers reuse the same runner: after every executed operation the
//! matching trigger (if registered) runs best-effort.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use crate::deployment::WorkerBatch;
use crate::error::{Error, ErrorCode};
use crate::requests::CommonParams;

/// Name of the builtin resource plugin.
pub const LOCALHOST_PLUGIN: &str = "localhost";

/// Requests a trigger may be registered for.
pub const AVAILABLE_TRIGGERS: &[&str] = &[
    "Initialize",
    "Submit",
    "Activate",
    "Run",
    "Update",
    "Configure",
    "SetProperties",
    "GetState",
    "Start",
    "Stop",
    "Reset",
    "Terminate",
    "Shutdown",
    "Status",
];

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin {0:?} is not registered")]
    NotRegistered(String),
    #[error("failed to run plugin {name:?}: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },
    #[error("plugin {name:?} exited with {code}: {stderr}")]
    NonZeroExit {
        name: String,
        code: i32,
        stderr: String,
    },
    #[error("plugin {0:?} timed out")]
    Timeout(String),
    #[error("plugin {name:?} produced unparsable output: {detail}")]
    Unparsable { name: String, detail: String },
}

/// Registry of external plugin executables.
#[derive(Default)]
pub struct PluginManager {
    plugins: HashMap<String, PathBuf>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.plugins.insert(name.into(), path.into());
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Run a registered plugin and capture its stdout.
    pub async fn execute(
        &self,
        name: &str,
        args: &[String],
        deadline: Duration,
    ) -> Result<String, PluginError> {
        let path = self
            .plugins
            .get(name)
            .ok_or_else(|| PluginError::NotRegistered(name.to_owned()))?;
        let child = tokio::process::Command::new(path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(deadline, child)
            .await
            .map_err(|_| PluginError::Timeout(name.to_owned()))?
            .map_err(|source| PluginError::Spawn {
                name: name.to_owned(),
                source,
            })?;
        if !output.status.success() {
            return Err(PluginError::NonZeroExit {
                name: name.to_owned(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Expand a `(plugin, resources)` pair into worker batches.
pub async fn resource_batches(
    plugins: &PluginManager,
    plugin: &str,
    resources: &str,
    common: &CommonParams,
    deadline: Duration,
) -> Result<Vec<WorkerBatch>, Error> {
    if plugin == LOCALHOST_PLUGIN && !plugins.is_registered(plugin) {
        return localhost_batches(resources)
            .map_err(|detail| Error::new(ErrorCode::ResourcePluginFailed, detail));
    }
    let args = vec![
        "--res".to_owned(),
        resources.to_owned(),
        "--partition-id".to_owned(),
        common.partition_id.clone(),
        "--run-nr".to_owned(),
        common.run_nr.to_string(),
    ];
    let stdout = plugins
        .execute(plugin, &args, deadline)
        .await
        .map_err(|e| Error::new(ErrorCode::ResourcePluginFailed, e.to_string()))?;
    serde_json::from_str::<Vec<WorkerBatch>>(stdout.trim()).map_err(|e| {
        Error::new(
            ErrorCode::ResourcePluginFailed,
            format!("plugin {plugin:?} produced unparsable output: {e}"),
        )
    })
}

/// Parse a `localhost` resource string: `;`-separated batches of
/// `key=value` pairs with keys `n`, `slots`, `zone`, `group`, `cores`.
fn localhost_batches(resources: &str) -> Result<Vec<WorkerBatch>, String> {
    let mut batches = Vec::new();
    for chunk in resources.split(';').filter(|c| !c.trim().is_empty()) {
        let mut batch = WorkerBatch {
            rms: LOCALHOST_PLUGIN.to_owned(),
            zone: String::new(),
            agent_group: String::new(),
            n: 1,
            slots: 1,
            cores: 0,
            config_file: String::new(),
            env_file: String::new(),
            required_slots: 0,
        };
        for pair in chunk.split(',').filter(|p| !p.trim().is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("malformed resource entry {pair:?}"))?;
            let key = key.trim();
            let value = value.trim();
            let parse_num = || {
                value
                    .parse::<u32>()
                    .map_err(|_| format!("invalid value for {key:?}: {value:?}"))
            };
            match key {
                "n" => batch.n = parse_num()?,
                "slots" => batch.slots = parse_num()?,
                "cores" => batch.cores = parse_num()?,
                "zone" => batch.zone = value.to_owned(),
                "group" => batch.agent_group = value.to_owned(),
                other => return Err(format!("unknown resource key {other:?}")),
            }
        }
        batches.push(batch);
    }
    if batches.is_empty() {
        return Err(format!("empty resource description {resources:?}"));
    }
    Ok(batches)
}

/// Best-effort plugins fired after every executed request.
#[derive(Default)]
pub struct TriggerManager {
    plugins: PluginManager,
}

impl TriggerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, request: &str, path: impl Into<PathBuf>) -> Result<(), Error> {
        if !AVAILABLE_TRIGGERS.contains(&request) {
            return Err(Error::runtime(format!(
                "failed to add request trigger {request:?}: invalid request name, valid names are {}",
                AVAILABLE_TRIGGERS.join(", ")
            )));
        }
        self.plugins.register(request, path);
        Ok(())
    }

    /// Run the trigger registered for `request`, if any. Failures are
    /// logged and never propagated.
    pub async fn run(&self, request: &str, partition_id: &str, run_nr: u64) {
        if !self.plugins.is_registered(request) {
            return;
        }
        let args = vec![
            "--partition-id".to_owned(),
            partition_id.to_owned(),
            "--run-nr".to_owned(),
            run_nr.to_string(),
        ];
        match self
            .plugins
            .execute(request, &args, Duration::from_secs(30))
            .await
        {
            Ok(out) => {
                tracing::debug!(partition = partition_id, request, "request trigger done: {}", out.trim())
            }
            Err(err) => {
                tracing::error!(partition = partition_id, request, %err, "request trigger failed")
            }
        }
    }
}
