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

//! Session adapter
//!
//! Thin wrapper over one deployment-substrate session. Long-running
//! substrate calls stream `{message, progress, response, done}` events;
//! the adapter consumes the stream under the request's remaining
//! deadline, folds per-task responses into the task and collection
//! caches and surfaces error lines as typed failures.
//!
//! The caches are append-only during an activation and cleared on
//! session shutdown.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;

use conductor_topology::{CollectionId, TaskId};

use crate::deployment::{
    ActivationMode, DeployEvent, DeploymentSession, Severity, TaskRuntime, WorkerBatch,
};
use crate::error::{Error, ErrorCode};
use crate::topo_desc::collection_base_name;

/// Poll period while waiting for worker slots to come up.
const SLOT_POLL_PERIOD: Duration = Duration::from_millis(50);

/// Cached placement of one live collection instance.
#[derive(Clone, Debug)]
pub struct CollectionCacheEntry {
    pub collection_id: CollectionId,
    pub worker_id: crate::deployment::WorkerId,
    pub path: String,
    /// Declared collection name (instance suffix stripped from `path`).
    pub name: String,
    pub host: String,
    pub work_dir: String,
}

#[derive(Default)]
struct Caches {
    tasks: HashMap<TaskId, TaskRuntime>,
    collections: HashMap<CollectionId, CollectionCacheEntry>,
}

/// One deployment session of a partition, plus its cached enumerations.
pub struct Session {
    pub partition_id: String,
    handle: Arc<dyn DeploymentSession>,
    caches: Mutex<Caches>,
}

impl Session {
    pub fn new(partition_id: impl Into<String>, handle: Arc<dyn DeploymentSession>) -> Arc<Self> {
        Arc::new(Self {
            partition_id: partition_id.into(),
            handle,
            caches: Mutex::new(Caches::default()),
        })
    }

    pub fn id(&self) -> String {
        self.handle.id()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub fn handle(&self) -> &Arc<dyn DeploymentSession> {
        &self.handle
    }

    /// Shut the substrate session down and drop the caches.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.clear_caches();
        self.handle
            .shutdown()
            .await
            .map_err(|e| Error::new(ErrorCode::DdsShutdownSessionFailed, e.to_string()))
    }

    /// Submit one worker batch and wait for the substrate's done event.
    pub async fn submit_workers(&self, batch: WorkerBatch, deadline: Duration) -> Result<(), Error> {
        let rx = self
            .handle
            .submit_workers(batch)
            .await
            .map_err(|e| Error::new(ErrorCode::DdsSubmitAgentsFailed, e.to_string()))?;
        self.drain_events(
            rx,
            deadline,
            ErrorCode::DdsSubmitAgentsFailed,
            "agent submission",
            false,
        )
        .await
    }

    /// Activate or update the task layout and populate the caches from
    /// the per-task responses.
    pub async fn activate_topology(
        &self,
        file: &Path,
        mode: ActivationMode,
        deadline: Duration,
    ) -> Result<(), Error> {
        let rx = self
            .handle
            .activate_topology(file, mode)
            .await
            .map_err(|e| Error::new(ErrorCode::DdsActivateTopologyFailed, e.to_string()))?;
        let op = match mode {
            ActivationMode::Activate => "topology activation",
            ActivationMode::Update => "topology update",
        };
        self.drain_events(rx, deadline, ErrorCode::DdsActivateTopologyFailed, op, true)
            .await
    }

    /// Poll the substrate until the number of live slots reaches
    /// `required` or the deadline elapses.
    pub async fn wait_for_slots(&self, required: u32, deadline: Duration) -> Result<(), Error> {
        let poll = async {
            loop {
                let slots: u32 = self
                    .handle
                    .list_workers()
                    .await
                    .map_err(|e| Error::new(ErrorCode::DdsSubmitAgentsFailed, e.to_string()))?
                    .iter()
                    .map(|w| w.slots)
                    .sum();
                if slots >= required {
                    return Ok(());
                }
                tokio::time::sleep(SLOT_POLL_PERIOD).await;
            }
        };
        match tokio::time::timeout(deadline, poll).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "timed out waiting for {required} active slots"
            ))),
        }
    }

    pub fn task_info(&self, task_id: TaskId) -> Option<TaskRuntime> {
        self.lock().tasks.get(&task_id).cloned()
    }

    pub fn collection_info(&self, collection_id: CollectionId) -> Option<CollectionCacheEntry> {
        self.lock().collections.get(&collection_id).cloned()
    }

    /// Hosts currently known from the task cache.
    pub fn cached_hosts(&self) -> BTreeSet<String> {
        self.lock().tasks.values().map(|t| t.host.clone()).collect()
    }

    pub fn clear_caches(&self) {
        let mut caches = self.lock();
        caches.tasks.clear();
        caches.collections.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Caches> {
        self.caches.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add_to_caches(&self, runtime: TaskRuntime) {
        let mut caches = self.lock();
        if let (Some(collection_id), Some(collection_path)) =
            (runtime.collection_id, runtime.collection_path.as_ref())
        {
            caches
                .collections
                .entry(collection_id)
                .or_insert_with(|| CollectionCacheEntry {
                    collection_id,
                    worker_id: runtime.worker_id,
                    path: collection_path.clone(),
                    name: collection_base_name(collection_path).to_owned(),
                    host: runtime.host.clone(),
                    work_dir: runtime.work_dir.clone(),
                });
        }
        caches.tasks.insert(runtime.task_id, runtime);
    }

    /// Consume a substrate event stream until `Done` or the deadline.
    async fn drain_events(
        &self,
        mut rx: mpsc::UnboundedReceiver<DeployEvent>,
        deadline: Duration,
        error_code: ErrorCode,
        op: &str,
        cache_responses: bool,
    ) -> Result<(), Error> {
        let partition = self.partition_id.clone();
        let consume = async {
            let mut first_error: Option<String> = None;
            while let Some(event) = rx.recv().await {
                match event {
                    DeployEvent::Message { severity, text } => match severity {
                        Severity::Error => {
                            tracing::error!(partition = %partition, "{op}: {text}");
                            first_error.get_or_insert(text);
                        }
                        Severity::Warning => tracing::warn!(partition = %partition, "{op}: {text}"),
                        Severity::Info => tracing::info!(partition = %partition, "{op}: {text}"),
                    },
                    DeployEvent::Progress {
                        completed,
                        errors,
                        total,
                    } => {
                        if completed + errors == total {
                            tracing::info!(
                                partition = %partition,
                                completed,
                                errors,
                                total,
                                "{op} progress complete"
                            );
                        }
                    }
                    DeployEvent::TaskActivated(runtime) => {
                        if cache_responses {
                            self.add_to_caches(runtime);
                        }
                    }
                    DeployEvent::Done => break,
                }
            }
            first_error
        };
        match tokio::time::timeout(deadline, consume).await {
            Ok(None) => Ok(()),
            Ok(Some(text)) => Err(Error::new(error_code, format!("{op} failed: {text}"))),
            Err(_) => Err(Error::timeout(format!("timed out waiting for {op}"))),
        }
    }
}
