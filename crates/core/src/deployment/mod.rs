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

//! Deployment-substrate seam
//!
//! The substrate launches worker processes, places tasks on their slots
//! and carries the per-task command bus. Long-running calls (worker
//! submission, topology activation) report through an event stream of
//! informational lines, a progress counter and per-task responses,
//! terminated by a `Done` event; the session adapter bounds every wait
//! with the request's remaining deadline.

pub mod local;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use conductor_topology::{CollectionId, CommandBus, TaskId};

/// Identifier of a worker (host-level agent process).
pub type WorkerId = u64;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session is not running")]
    NotRunning,
    #[error("deployment failure: {0}")]
    Failed(String),
}

/// One cohort of identical workers to bring up.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerBatch {
    #[serde(default = "default_rms")]
    pub rms: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub agent_group: String,
    /// Number of workers.
    pub n: u32,
    /// Task slots per worker.
    pub slots: u32,
    #[serde(default)]
    pub cores: u32,
    #[serde(default)]
    pub config_file: String,
    #[serde(default)]
    pub env_file: String,
    /// Slots that must come up before submission counts as complete;
    /// `0` means `n * slots`.
    #[serde(default)]
    pub required_slots: u32,
}

fn default_rms() -> String {
    "localhost".to_owned()
}

impl WorkerBatch {
    pub fn required_slots(&self) -> u32 {
        if self.required_slots > 0 {
            self.required_slots
        } else {
            self.n * self.slots
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub host: String,
    pub slots: u32,
    pub agent_group: String,
    pub zone: String,
}

/// Placement record of one live task.
#[derive(Clone, Debug)]
pub struct TaskRuntime {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub slot: u32,
    pub path: String,
    pub host: String,
    pub work_dir: String,
    pub collection_id: Option<CollectionId>,
    pub collection_path: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Event stream of a long-running substrate call.
#[derive(Clone, Debug)]
pub enum DeployEvent {
    Message { severity: Severity, text: String },
    Progress { completed: u32, errors: u32, total: u32 },
    TaskActivated(TaskRuntime),
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivationMode {
    Activate,
    Update,
}

/// Answer to a commander-info query.
#[derive(Clone, Debug, Default)]
pub struct CommanderInfo {
    pub active_topology_file: Option<PathBuf>,
}

/// Device exit notification.
#[derive(Clone, Debug)]
pub struct TaskDoneEvent {
    pub task_id: TaskId,
    pub path: String,
    pub exit_code: i32,
    pub host: String,
}

/// Factory for deployment sessions.
#[async_trait]
pub trait Deployment: Send + Sync + 'static {
    async fn create_session(&self) -> Result<Arc<dyn DeploymentSession>, DeployError>;
    async fn attach_session(&self, session_id: &str)
        -> Result<Arc<dyn DeploymentSession>, DeployError>;
}

/// One running substrate session.
#[async_trait]
pub trait DeploymentSession: Send + Sync + 'static {
    fn id(&self) -> String;
    fn is_running(&self) -> bool;
    async fn shutdown(&self) -> Result<(), DeployError>;

    /// Bring a worker batch up; completion is signalled on the stream.
    async fn submit_workers(
        &self,
        batch: WorkerBatch,
    ) -> Result<mpsc::UnboundedReceiver<DeployEvent>, DeployError>;

    /// Activate or update the task layout from a topology description
    /// file; per-task placements arrive as `TaskActivated` events.
    async fn activate_topology(
        &self,
        file: &Path,
        mode: ActivationMode,
    ) -> Result<mpsc::UnboundedReceiver<DeployEvent>, DeployError>;

    async fn commander_info(&self) -> Result<CommanderInfo, DeployError>;
    async fn list_workers(&self) -> Result<Vec<WorkerInfo>, DeployError>;
    async fn list_tasks(&self) -> Result<Vec<TaskRuntime>, DeployError>;
    async fn shutdown_worker(&self, worker: WorkerId) -> Result<(), DeployError>;

    fn subscribe_task_done(&self) -> broadcast::Receiver<TaskDoneEvent>;
    fn command_bus(&self) -> Arc<dyn CommandBus>;
}
