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

//! Partition controller and controller registry
//!
//! The controller owns the process-wide partition map. Lifecycle
//! requests for one partition are serialized FIFO under the partition's
//! lifecycle mutex; distinct partitions run independently. Every request
//! carries a total timeout, and each inner step derives its remaining
//! budget from it; a step whose budget is exhausted fails with
//! `RequestTimeout` before it starts.
//!
//! Composite operations are sequences of the primitive steps: Run is
//! Initialize + Submit + Activate under one deadline, Configure drives
//! the five-transition init chain (with optional nMin recovery), Update
//! resets, re-activates and re-configures a live topology.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use ulid::Ulid;

use conductor_topology::{
    AggregatedState, ChangeStateResult, CollectionId, OpFailure, StateStats, TaskDescriptor,
    Topology, TopologyState, Transition,
};

use crate::deployment::{ActivationMode, Deployment, WorkerBatch, WorkerId};
use crate::error::{Error, ErrorCode};
use crate::plugin::{resource_batches, PluginManager, TriggerManager};
use crate::requests::{
    CollectionState, CommonParams, DeviceParams, InitializeParams, PartitionStatus, Request,
    RequestBody, RequestResult, RequestStatus, RunParams, SessionStatus, SetPropertiesParams,
    StatusParams, StatusResult, SubmitParams, TopologyParams,
};
use crate::requirements::{extract_requirements, Requirements};
use crate::restore::{append_history, RestoreData, RestoreFile, RestorePartition};
use crate::session::Session;
use crate::topo_desc::TopologyDesc;

/// Worker-count poll cadence and bound used by nMin recovery. The count
/// is monitored, not enforced: after the attempts run out recovery
/// proceeds anyway.
const WORKER_POLL_PERIOD: Duration = Duration::from_millis(50);
const WORKER_POLL_ATTEMPTS: u32 = 400;

const CONFIGURE_CHAIN: [Transition; 5] = [
    Transition::InitDevice,
    Transition::CompleteInit,
    Transition::Bind,
    Transition::Connect,
    Transition::InitTask,
];

/// Per-zone worker configuration merged into submitted batches.
#[derive(Clone, Debug, Default)]
pub struct ZoneConfig {
    pub config_path: String,
    pub env_path: String,
}

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Default request timeout when the header carries `0`.
    pub default_timeout: Duration,
    pub restore_id: Option<String>,
    pub restore_dir: PathBuf,
    pub history_dir: Option<PathBuf>,
    /// nMin recovery switch; off by default.
    pub recovery_enabled: bool,
    pub zone_cfgs: HashMap<String, ZoneConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            restore_id: None,
            restore_dir: std::env::temp_dir().join("conductor"),
            history_dir: None,
            recovery_enabled: false,
            zone_cfgs: HashMap::new(),
        }
    }
}

/// Named logical instance with its own session and topology.
pub struct Partition {
    pub id: String,
    /// Serializes lifecycle requests; waiters are served FIFO.
    lifecycle: tokio::sync::Mutex<()>,
    shared: Mutex<PartitionShared>,
}

#[derive(Default)]
struct PartitionShared {
    session: Option<Arc<Session>>,
    topology: Option<Arc<Topology>>,
    requirements: Option<Requirements>,
    topo_path: Option<PathBuf>,
    run_nr: u64,
}

impl Partition {
    fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            lifecycle: tokio::sync::Mutex::new(()),
            shared: Mutex::new(PartitionShared::default()),
        }
    }

    fn lock_shared(&self) -> MutexGuard<'_, PartitionShared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Intermediate result of one dispatched operation.
struct Outcome {
    error: Option<Error>,
    msg: String,
    aggregated: AggregatedState,
    devices: Option<TopologyState>,
    collections: Option<Vec<CollectionState>>,
    hosts: BTreeSet<String>,
}

impl Outcome {
    fn done(name: &str) -> Self {
        Self {
            error: None,
            msg: format!("{name} done"),
            aggregated: AggregatedState::Undefined,
            devices: None,
            collections: None,
            hosts: BTreeSet::new(),
        }
    }

    fn failed(err: Error) -> Self {
        Self {
            error: Some(err),
            msg: String::new(),
            aggregated: AggregatedState::Undefined,
            devices: None,
            collections: None,
            hosts: BTreeSet::new(),
        }
    }

    fn with_state(mut self, aggregated: AggregatedState) -> Self {
        self.aggregated = aggregated;
        self
    }

    fn with_hosts(mut self, hosts: BTreeSet<String>) -> Self {
        self.hosts = hosts;
        self
    }
}

/// Process-wide controller: partition registry plus status aggregation.
pub struct Controller {
    deployment: Arc<dyn Deployment>,
    config: ControllerConfig,
    plugins: PluginManager,
    triggers: TriggerManager,
    partitions: Mutex<HashMap<String, Arc<Partition>>>,
}

impl Controller {
    pub fn new(
        deployment: Arc<dyn Deployment>,
        config: ControllerConfig,
        plugins: PluginManager,
        triggers: TriggerManager,
    ) -> Self {
        Self {
            deployment,
            config,
            plugins,
            triggers,
            partitions: Mutex::new(HashMap::new()),
        }
    }

    /// Execute one lifecycle request under the partition's mutex.
    pub async fn exec(&self, request: Request) -> RequestResult {
        let partition = self.acquire_partition(&request.common.partition_id);
        if request.common.run_nr > 0 {
            partition.lock_shared().run_nr = request.common.run_nr;
        }
        let name = request.name();
        tracing::info!(
            partition = %request.common.partition_id,
            run = request.common.run_nr,
            timeout = request.common.timeout_secs,
            "processing {name} request"
        );

        let outcome = {
            let _serialized = partition.lifecycle.lock().await;
            let dispatched = match &request.body {
                RequestBody::Initialize(params) => {
                    self.op_initialize(&request, &partition, params).await
                }
                RequestBody::Submit(params) => self.op_submit(&request, &partition, params).await,
                RequestBody::Activate(params) => {
                    self.op_activate(&request, &partition, params).await
                }
                RequestBody::Run(params) => self.op_run(&request, &partition, params).await,
                RequestBody::Update(params) => self.op_update(&request, &partition, params).await,
                RequestBody::Configure(params) => {
                    self.op_configure(&request, &partition, params).await
                }
                RequestBody::Start(params) => {
                    self.op_transition(&request, &partition, Transition::Run, params, "Start")
                        .await
                }
                RequestBody::Stop(params) => {
                    self.op_transition(&request, &partition, Transition::Stop, params, "Stop")
                        .await
                }
                RequestBody::Reset(params) => self.op_reset(&request, &partition, params).await,
                RequestBody::Terminate(params) => {
                    self.op_transition(&request, &partition, Transition::End, params, "Terminate")
                        .await
                }
                RequestBody::SetProperties(params) => {
                    self.op_set_properties(&request, &partition, params).await
                }
                RequestBody::GetState(params) => self.op_get_state(&request, &partition, params),
                RequestBody::Shutdown => self.op_shutdown(&request, &partition).await,
            };
            match dispatched {
                Ok(outcome) => outcome,
                Err(error) => {
                    tracing::error!(
                        partition = %request.common.partition_id,
                        run = request.common.run_nr,
                        "{name} request failed: {error}"
                    );
                    Outcome::failed(error)
                }
            }
        };

        let result = self.build_result(&request, &partition, outcome);
        self.triggers
            .run(name, &request.common.partition_id, request.common.run_nr)
            .await;
        result
    }

    /// Enumerate partitions without blocking their lifecycle requests:
    /// the registry lock is released before each partition is probed.
    pub async fn status(&self, params: &StatusParams) -> StatusResult {
        let started = Instant::now();
        let partitions: Vec<Arc<Partition>> = {
            let registry = self.lock_partitions();
            registry.values().cloned().collect()
        };

        let mut records = Vec::new();
        for partition in partitions {
            let (session, topology) = {
                let shared = partition.lock_shared();
                (shared.session.clone(), shared.topology.clone())
            };
            let (session_id, session_status) = match &session {
                Some(session) => (
                    session.id(),
                    if session.is_running() {
                        SessionStatus::Running
                    } else {
                        SessionStatus::Stopped
                    },
                ),
                None => (String::new(), SessionStatus::Unknown),
            };
            if params.running && session_status != SessionStatus::Running {
                continue;
            }
            let aggregated = topology
                .as_ref()
                .and_then(|t| t.get_state("").ok())
                .map(|(aggregated, _)| aggregated)
                .unwrap_or(AggregatedState::Undefined);
            records.push(PartitionStatus {
                partition_id: partition.id.clone(),
                session_id,
                session_status,
                aggregated,
            });
        }
        self.triggers.run("Status", "", 0).await;
        StatusResult {
            status: RequestStatus::Success,
            msg: "Status done".to_owned(),
            exec_time_ms: started.elapsed().as_millis() as u64,
            partitions: records,
        }
    }

    /// Re-attach the partitions recorded in the restore file. Failures
    /// run the registered Shutdown trigger and never abort the restore.
    pub async fn restore(&self) {
        let Some(restore_id) = self.config.restore_id.clone() else {
            return;
        };
        tracing::info!(%restore_id, "restoring sessions");
        let file = RestoreFile::new(&restore_id, &self.config.restore_dir);
        let data = match file.read() {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(%restore_id, %err, "failed to read restore file");
                return;
            }
        };
        for entry in data.partitions {
            tracing::info!(
                partition = %entry.partition_id,
                session = %entry.session_id,
                "restoring partition"
            );
            let request = Request::new(
                CommonParams::new(entry.partition_id.clone(), 0, 0),
                RequestBody::Initialize(InitializeParams {
                    session_id: entry.session_id.clone(),
                }),
            );
            let result = self.exec(request).await;
            if !result.is_success() {
                tracing::warn!(
                    partition = %entry.partition_id,
                    session = %entry.session_id,
                    "failed to attach during restore, executing Shutdown trigger"
                );
                self.triggers.run("Shutdown", &entry.partition_id, 0).await;
            }
        }
    }

    // ---- operations ------------------------------------------------

    async fn op_initialize(
        &self,
        request: &Request,
        partition: &Arc<Partition>,
        params: &InitializeParams,
    ) -> Result<Outcome, Error> {
        self.close_session(partition).await?;

        if params.session_id.is_empty() {
            let handle = self
                .deployment
                .create_session()
                .await
                .map_err(|e| Error::new(ErrorCode::DdsCreateSessionFailed, e.to_string()))?;
            let session = Session::new(&partition.id, handle);
            tracing::info!(partition = %partition.id, session = %session.id(), "session created");
            self.subscribe_task_done(&session)?;
            partition.lock_shared().session = Some(session);
        } else {
            let handle = self
                .deployment
                .attach_session(&params.session_id)
                .await
                .map_err(|e| Error::new(ErrorCode::DdsAttachToSessionFailed, e.to_string()))?;
            let session = Session::new(&partition.id, handle);
            tracing::info!(partition = %partition.id, session = %session.id(), "attached to session");
            self.subscribe_task_done(&session)?;
            partition.lock_shared().session = Some(session.clone());

            // If the attached session has an active topology, rebuild
            // the topology handle so state requests work right away.
            let info = session
                .handle()
                .commander_info()
                .await
                .map_err(|e| Error::new(ErrorCode::DdsCommanderInfoFailed, e.to_string()))?;
            if let Some(file) = info.active_topology_file {
                let desc = TopologyDesc::load(&file)
                    .map_err(|e| Error::new(ErrorCode::DdsCreateTopologyFailed, e.to_string()))?;
                let requirements = extract_requirements(&desc)
                    .map_err(|e| Error::new(ErrorCode::DdsCreateTopologyFailed, e.to_string()))?;
                let remaining = self.request_timeout(request, "rebuild topology")?;
                let topology = self.build_topology(&session, &desc, remaining).await?;
                let mut shared = partition.lock_shared();
                shared.topo_path = Some(file);
                shared.requirements = Some(requirements);
                shared.topology = Some(topology);
            }
        }

        self.update_restore();
        self.append_history(request, partition);
        Ok(Outcome::done("Initialize"))
    }

    async fn op_submit(
        &self,
        request: &Request,
        partition: &Arc<Partition>,
        params: &SubmitParams,
    ) -> Result<Outcome, Error> {
        let session = self.running_session(partition, ErrorCode::DdsSubmitAgentsFailed)?;
        let deadline = self.request_timeout(request, "resource plugin")?;
        let batches = resource_batches(
            &self.plugins,
            &params.plugin,
            &params.resources,
            &request.common,
            deadline,
        )
        .await?;
        let hosts = self.submit_batches(request, &session, batches).await?;
        Ok(Outcome::done("Submit").with_hosts(hosts))
    }

    async fn op_activate(
        &self,
        request: &Request,
        partition: &Arc<Partition>,
        params: &TopologyParams,
    ) -> Result<Outcome, Error> {
        let aggregated = self
            .activate_impl(request, partition, params, ActivationMode::Activate)
            .await?;
        let hosts = self.live_hosts(partition).await;
        Ok(Outcome::done("Activate")
            .with_state(aggregated)
            .with_hosts(hosts))
    }

    async fn op_run(
        &self,
        request: &Request,
        partition: &Arc<Partition>,
        params: &RunParams,
    ) -> Result<Outcome, Error> {
        // Run always starts from a fresh session.
        if !params.session_id.is_empty() {
            return Err(Error::new(
                ErrorCode::RequestNotSupported,
                "attachment to a running session is not supported by Run",
            ));
        }
        self.op_initialize(request, partition, &InitializeParams::default())
            .await?;

        let (topo_params, batches) = if params.extract_topo_resources {
            // Derive the submission from the topology description.
            let file = self.materialize_topology(request, &params.topology).await?;
            let desc = TopologyDesc::load(&file)
                .map_err(|e| Error::new(ErrorCode::DdsCreateTopologyFailed, e.to_string()))?;
            let requirements = extract_requirements(&desc)
                .map_err(|e| Error::new(ErrorCode::DdsCreateTopologyFailed, e.to_string()))?;
            let topo_params = TopologyParams {
                file: file.display().to_string(),
                ..TopologyParams::default()
            };
            (topo_params, batches_from_requirements(&requirements))
        } else {
            let deadline = self.request_timeout(request, "resource plugin")?;
            let batches = resource_batches(
                &self.plugins,
                &params.plugin,
                &params.resources,
                &request.common,
                deadline,
            )
            .await?;
            (params.topology.clone(), batches)
        };

        let session = self.running_session(partition, ErrorCode::DdsSubmitAgentsFailed)?;
        let hosts = self.submit_batches(request, &session, batches).await?;
        let aggregated = self
            .activate_impl(request, partition, &topo_params, ActivationMode::Activate)
            .await?;
        Ok(Outcome::done("Run").with_state(aggregated).with_hosts(hosts))
    }

    async fn op_update(
        &self,
        request: &Request,
        partition: &Arc<Partition>,
        params: &TopologyParams,
    ) -> Result<Outcome, Error> {
        // Reset the live device set, then swap the topology under it.
        self.change_state_reset(request, partition, "").await?;

        if let Some(topology) = partition.lock_shared().topology.take() {
            topology.detach().await;
        }

        let _ = self
            .activate_impl(request, partition, params, ActivationMode::Update)
            .await?;
        let result = self.change_state_configure(request, partition, "").await?;
        let hosts = self.live_hosts(partition).await;
        Ok(Outcome::done("Update")
            .with_state(result.aggregated)
            .with_hosts(hosts))
    }

    async fn op_configure(
        &self,
        request: &Request,
        partition: &Arc<Partition>,
        params: &DeviceParams,
    ) -> Result<Outcome, Error> {
        let result = self
            .change_state_configure(request, partition, &params.path)
            .await?;
        let hosts = self.live_hosts(partition).await;
        Ok(self
            .device_outcome("Configure", partition, result, params.detailed)
            .with_hosts(hosts))
    }

    async fn op_transition(
        &self,
        request: &Request,
        partition: &Arc<Partition>,
        transition: Transition,
        params: &DeviceParams,
        name: &str,
    ) -> Result<Outcome, Error> {
        let result = self
            .change_state_checked(request, partition, transition, &params.path, false)
            .await?;
        Ok(self.device_outcome(name, partition, result, params.detailed))
    }

    async fn op_reset(
        &self,
        request: &Request,
        partition: &Arc<Partition>,
        params: &DeviceParams,
    ) -> Result<Outcome, Error> {
        let result = self
            .change_state_reset(request, partition, &params.path)
            .await?;
        Ok(self.device_outcome("Reset", partition, result, params.detailed))
    }

    async fn op_set_properties(
        &self,
        request: &Request,
        partition: &Arc<Partition>,
        params: &SetPropertiesParams,
    ) -> Result<Outcome, Error> {
        let topology = self.topology(partition, ErrorCode::DeviceSetPropertiesFailed)?;
        let deadline = self.request_timeout(request, "set properties")?;
        let result = topology
            .set_properties(&params.path, params.properties.clone(), deadline)
            .await
            .map_err(|e| Error::new(ErrorCode::DeviceSetPropertiesFailed, e.to_string()))?;
        match result.failure {
            None => Ok(Outcome::done("SetProperties")),
            Some(failure) => {
                self.log_failed_tasks(partition, "SetProperties", &result.failed);
                Err(match failure {
                    OpFailure::Timeout => Error::timeout("timed out waiting for set property"),
                    OpFailure::DeviceFailed => Error::new(
                        ErrorCode::DeviceSetPropertiesFailed,
                        format!("failed to set properties on {} device(s)", result.failed.len()),
                    ),
                })
            }
        }
    }

    fn op_get_state(
        &self,
        _request: &Request,
        partition: &Arc<Partition>,
        params: &DeviceParams,
    ) -> Result<Outcome, Error> {
        let topology = self.topology(partition, ErrorCode::DeviceGetStateFailed)?;
        let (aggregated, state) = topology
            .get_state(&params.path)
            .map_err(|e| Error::new(ErrorCode::DeviceGetStateFailed, e.to_string()))?;
        let mut outcome = Outcome::done("GetState").with_state(aggregated);
        if params.detailed {
            outcome.collections = Some(self.collection_states(partition, &state));
            outcome.devices = Some(state);
        }
        Ok(outcome)
    }

    async fn op_shutdown(
        &self,
        request: &Request,
        partition: &Arc<Partition>,
    ) -> Result<Outcome, Error> {
        let closed = self.close_session(partition).await;
        self.lock_partitions().remove(&request.common.partition_id);
        self.update_restore();
        closed?;
        Ok(Outcome::done("Shutdown"))
    }

    // ---- composite state changes -----------------------------------

    async fn change_state_configure(
        &self,
        request: &Request,
        partition: &Arc<Partition>,
        path: &str,
    ) -> Result<ChangeStateResult, Error> {
        let mut result = self
            .change_state_checked(request, partition, CONFIGURE_CHAIN[0], path, true)
            .await?;
        for transition in &CONFIGURE_CHAIN[1..] {
            result = self
                .change_state_checked(request, partition, *transition, path, true)
                .await?;
        }
        Ok(result)
    }

    async fn change_state_reset(
        &self,
        request: &Request,
        partition: &Arc<Partition>,
        path: &str,
    ) -> Result<ChangeStateResult, Error> {
        // Reset clears the ignored bits accumulated during the run.
        if let Ok(topology) = self.topology(partition, ErrorCode::DeviceChangeStateFailed) {
            topology.reset_ignored();
        }
        self.change_state_checked(request, partition, Transition::ResetTask, path, false)
            .await?;
        self.change_state_checked(request, partition, Transition::ResetDevice, path, false)
            .await
    }

    /// One transition over the selection, with failure logging and
    /// (when enabled and requested) nMin recovery.
    async fn change_state_checked(
        &self,
        request: &Request,
        partition: &Arc<Partition>,
        transition: Transition,
        path: &str,
        recoverable: bool,
    ) -> Result<ChangeStateResult, Error> {
        let topology = self.topology(partition, ErrorCode::DeviceChangeStateFailed)?;
        let deadline = self.request_timeout(request, transition.as_str())?;
        let result = topology
            .change_state(transition, path, deadline)
            .await
            .map_err(|e| Error::new(ErrorCode::DeviceChangeStateFailed, e.to_string()))?;

        let stats = StateStats::new(result.state.iter(), result.expected);
        tracing::info!(
            partition = %partition.id,
            transition = %transition,
            aggregated = %result.aggregated,
            "{}",
            stats.tasks_summary()
        );

        let Some(failure) = result.failure else {
            return Ok(result);
        };

        self.log_failure_summary(partition, &result);
        let original = match failure {
            OpFailure::Timeout => {
                Error::timeout(format!("timed out waiting for {transition} transition"))
            }
            OpFailure::DeviceFailed => Error::new(
                ErrorCode::DeviceChangeStateFailed,
                format!(
                    "{} device(s) failed to reach {} via {}",
                    result.failed.len(),
                    result.expected,
                    transition
                ),
            ),
        };

        if !(recoverable && self.config.recovery_enabled) {
            return Err(original);
        }
        match self.attempt_recovery(request, partition, &result).await {
            Ok(()) => {
                tracing::info!(partition = %partition.id, %transition, "recovery succeeded");
                // The surviving devices passed the transition already;
                // report the rebuilt topology instead of retrying.
                let topology = self.topology(partition, ErrorCode::DeviceChangeStateFailed)?;
                let (aggregated, state) = topology
                    .get_state(path)
                    .map_err(|e| Error::new(ErrorCode::DeviceChangeStateFailed, e.to_string()))?;
                Ok(ChangeStateResult {
                    aggregated,
                    state,
                    failed: Vec::new(),
                    failure: None,
                    expected: result.expected,
                })
            }
            Err(recovery_err) => {
                tracing::error!(partition = %partition.id, %transition, %recovery_err, "recovery failed");
                Err(Error::new(
                    original.code,
                    format!("{}; recovery failed: {}", original.details, recovery_err),
                ))
            }
        }
    }

    // ---- nMin recovery ---------------------------------------------

    /// Try to shrink the topology around failed collections per the nMin
    /// rules: attribute failures, verify minima, shut the owning workers
    /// down, rewrite the description and issue an update activation.
    async fn attempt_recovery(
        &self,
        request: &Request,
        partition: &Arc<Partition>,
        result: &ChangeStateResult,
    ) -> Result<(), Error> {
        let session = self.running_session(partition, ErrorCode::TopologyFailed)?;
        let requirements = partition
            .lock_shared()
            .requirements
            .clone()
            .ok_or_else(|| Error::new(ErrorCode::TopologyFailed, "no requirements available"))?;
        if requirements.nmin.is_empty() {
            return Err(Error::new(
                ErrorCode::TopologyFailed,
                "recovery not applicable: no nMin rules declared",
            ));
        }

        // Attribute failed tasks to collections via the task cache.
        let mut failed_collections = BTreeMap::new();
        for task_id in &result.failed {
            let collection_id = result
                .state
                .iter()
                .find(|s| s.task_id == *task_id)
                .and_then(|s| s.collection_id);
            let Some(collection_id) = collection_id else {
                return Err(Error::new(
                    ErrorCode::TopologyFailed,
                    format!("recovery not applicable: failed task {task_id} is not in a collection"),
                ));
            };
            let info = session.collection_info(collection_id).ok_or_else(|| {
                Error::new(
                    ErrorCode::TopologyFailed,
                    format!("collection {collection_id} is not in the collection cache"),
                )
            })?;
            failed_collections.insert(collection_id, info);
        }
        if failed_collections.is_empty() {
            return Err(Error::new(
                ErrorCode::TopologyFailed,
                "recovery not applicable: no failed collections",
            ));
        }

        // Count failures per parent group and verify the minima.
        let mut failed_per_group: BTreeMap<String, i32> = BTreeMap::new();
        for info in failed_collections.values() {
            let Some(ninfo) = requirements.nmin.get(&info.name) else {
                return Err(Error::new(
                    ErrorCode::TopologyFailed,
                    format!(
                        "failed collection {:?} is not in a group with an nMin parameter",
                        info.name
                    ),
                ));
            };
            if ninfo.n_min < 0 {
                return Err(Error::new(
                    ErrorCode::TopologyFailed,
                    format!("collection {:?} has no nMin set", info.name),
                ));
            }
            *failed_per_group.entry(ninfo.agent_group.clone()).or_default() += 1;
        }

        let mut remaining_per_group: BTreeMap<String, i32> = BTreeMap::new();
        for (group, failed_count) in &failed_per_group {
            let ninfo = requirements
                .nmin
                .values()
                .find(|n| &n.agent_group == group)
                .ok_or_else(|| {
                    Error::new(
                        ErrorCode::TopologyFailed,
                        format!("no nMin rule for group {group:?}"),
                    )
                })?;
            let remaining = ninfo.n_original - failed_count;
            tracing::info!(
                partition = %partition.id,
                group = %group,
                n = ninfo.n_original,
                nmin = ninfo.n_min,
                failed = failed_count,
                "checking nMin rule"
            );
            if remaining < ninfo.n_min {
                return Err(Error::new(
                    ErrorCode::TopologyFailed,
                    format!(
                        "remaining collections in group {group:?} ({remaining}) below nMin ({})",
                        ninfo.n_min
                    ),
                ));
            }
            remaining_per_group.insert(group.clone(), remaining);
        }

        // Shut down the workers owning the failed collections and watch
        // the worker count drop towards the expectation.
        let workers: BTreeSet<WorkerId> =
            failed_collections.values().map(|c| c.worker_id).collect();
        let current = self.worker_count(&session).await?;
        let expected = current.saturating_sub(workers.len());
        for worker in &workers {
            tracing::info!(partition = %partition.id, worker, "shutting down worker of failed collection");
            if let Err(err) = session.handle().shutdown_worker(*worker).await {
                tracing::warn!(partition = %partition.id, worker, %err, "worker shutdown failed");
            }
        }
        let mut attempts = 0;
        loop {
            let count = self.worker_count(&session).await?;
            if count == expected {
                tracing::info!(partition = %partition.id, count, "worker count reduced");
                break;
            }
            attempts += 1;
            if attempts >= WORKER_POLL_ATTEMPTS {
                tracing::warn!(
                    partition = %partition.id,
                    count,
                    expected,
                    "could not confirm reduced worker count, continuing"
                );
                break;
            }
            tokio::time::sleep(WORKER_POLL_PERIOD).await;
        }

        // Rewrite the description with the reduced multiplicities; the
        // nMin variables ride along unchanged.
        let topo_path = partition.lock_shared().topo_path.clone().ok_or_else(|| {
            Error::new(ErrorCode::TopologyFailed, "no topology description in effect")
        })?;
        let mut desc = TopologyDesc::load(&topo_path)
            .map_err(|e| Error::new(ErrorCode::TopologyFailed, e.to_string()))?;
        for (group, remaining) in &remaining_per_group {
            if !desc.set_group_n(group, *remaining) {
                return Err(Error::new(
                    ErrorCode::TopologyFailed,
                    format!("group {group:?} not found in topology description"),
                ));
            }
        }
        let reduced_dir = std::env::temp_dir()
            .join("conductor")
            .join(Ulid::new().to_string());
        std::fs::create_dir_all(&reduced_dir)
            .map_err(|e| Error::new(ErrorCode::TopologyFailed, e.to_string()))?;
        let reduced_path = reduced_dir.join(format!("topo_{}_reduced.yaml", partition.id));
        desc.save(&reduced_path)
            .map_err(|e| Error::new(ErrorCode::TopologyFailed, e.to_string()))?;
        tracing::info!(partition = %partition.id, path = %reduced_path.display(), "saved reduced topology");

        // Update activation of the reduced description, then rebuild
        // the requirements and the topology handle.
        let params = TopologyParams {
            file: reduced_path.display().to_string(),
            ..TopologyParams::default()
        };
        self.activate_impl(request, partition, &params, ActivationMode::Update)
            .await
            .map_err(|e| {
                Error::new(
                    ErrorCode::TopologyFailed,
                    format!("recovery of the remaining collections failed: {e}"),
                )
            })?;
        Ok(())
    }

    // ---- shared plumbing -------------------------------------------

    async fn activate_impl(
        &self,
        request: &Request,
        partition: &Arc<Partition>,
        params: &TopologyParams,
        mode: ActivationMode,
    ) -> Result<AggregatedState, Error> {
        let session = self.running_session(partition, ErrorCode::DdsActivateTopologyFailed)?;
        let file = self.materialize_topology(request, params).await?;
        let desc = TopologyDesc::load(&file)
            .map_err(|e| Error::new(ErrorCode::DdsCreateTopologyFailed, e.to_string()))?;
        let requirements = extract_requirements(&desc)
            .map_err(|e| Error::new(ErrorCode::DdsCreateTopologyFailed, e.to_string()))?;
        for (group, ninfo) in &requirements.nmin {
            tracing::info!(
                partition = %partition.id,
                collection = %group,
                n = ninfo.n_original,
                nmin = ninfo.n_min,
                "collection minimum declared"
            );
        }

        let remaining = self.request_timeout(request, "topology activation")?;
        session.activate_topology(&file, mode, remaining).await?;

        if let Some(topology) = partition.lock_shared().topology.take() {
            topology.detach().await;
        }
        let remaining = self.request_timeout(request, "topology attach")?;
        let topology = self.build_topology(&session, &desc, remaining).await?;
        let aggregated = topology
            .get_state("")
            .map(|(aggregated, _)| aggregated)
            .unwrap_or(AggregatedState::Undefined);

        let mut shared = partition.lock_shared();
        shared.topo_path = Some(file);
        shared.requirements = Some(requirements);
        shared.topology = Some(topology);
        Ok(aggregated)
    }

    /// Build the topology handle from the substrate's live task list,
    /// carrying the expendable flags of the declared description.
    async fn build_topology(
        &self,
        session: &Arc<Session>,
        desc: &TopologyDesc,
        deadline: Duration,
    ) -> Result<Arc<Topology>, Error> {
        let expendable = desc
            .expendable_paths()
            .map_err(|e| Error::new(ErrorCode::DdsCreateTopologyFailed, e.to_string()))?;
        let tasks = session
            .handle()
            .list_tasks()
            .await
            .map_err(|e| Error::new(ErrorCode::TopologyFailed, e.to_string()))?;
        let descriptors: Vec<TaskDescriptor> = tasks
            .iter()
            .map(|t| TaskDescriptor {
                id: t.task_id,
                path: t.path.clone(),
                collection_id: t.collection_id,
                expendable: expendable.get(&t.path).copied().unwrap_or(false),
            })
            .collect();
        Topology::attach(session.handle().command_bus(), descriptors, deadline)
            .await
            .map_err(|e| {
                Error::new(
                    ErrorCode::TopologyFailed,
                    format!("failed to initialize device topology: {e}"),
                )
            })
    }

    /// Materialize the topology description to a file: exactly one of
    /// file, inline content or generator script must be provided.
    async fn materialize_topology(
        &self,
        request: &Request,
        params: &TopologyParams,
    ) -> Result<PathBuf, Error> {
        let set = [&params.file, &params.content, &params.script]
            .iter()
            .filter(|v| !v.is_empty())
            .count();
        if set != 1 {
            return Err(Error::new(
                ErrorCode::TopologyFailed,
                "either topology file, content or script has to be set",
            ));
        }
        if !params.file.is_empty() {
            return Ok(PathBuf::from(&params.file));
        }

        let content = if !params.content.is_empty() {
            params.content.clone()
        } else {
            let deadline = self.request_timeout(request, "topology script")?;
            let output = tokio::time::timeout(
                deadline,
                tokio::process::Command::new("bash")
                    .arg("-c")
                    .arg(&params.script)
                    .output(),
            )
            .await
            .map_err(|_| Error::timeout("topology generation script timed out"))?
            .map_err(|e| {
                Error::new(
                    ErrorCode::TopologyFailed,
                    format!("failed to run topology script: {e}"),
                )
            })?;
            if !output.status.success() {
                return Err(Error::new(
                    ErrorCode::TopologyFailed,
                    format!(
                        "topology generation script failed with {}: {}",
                        output.status.code().unwrap_or(-1),
                        String::from_utf8_lossy(&output.stderr)
                    ),
                ));
            }
            String::from_utf8_lossy(&output.stdout).into_owned()
        };

        let dir = std::env::temp_dir()
            .join("conductor")
            .join(Ulid::new().to_string());
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::new(ErrorCode::TopologyFailed, e.to_string()))?;
        let path = dir.join("topology.yaml");
        std::fs::write(&path, content)
            .map_err(|e| Error::new(ErrorCode::TopologyFailed, e.to_string()))?;
        tracing::info!(partition = %request.common.partition_id, path = %path.display(), "materialized topology description");
        Ok(path)
    }

    async fn submit_batches(
        &self,
        request: &Request,
        session: &Arc<Session>,
        batches: Vec<WorkerBatch>,
    ) -> Result<BTreeSet<String>, Error> {
        tracing::info!(
            partition = %session.partition_id,
            configurations = batches.len(),
            "preparing worker submission"
        );
        let mut total_slots = 0u32;
        for mut batch in batches {
            if let Some(zone_cfg) = self.config.zone_cfgs.get(&batch.zone) {
                if batch.config_file.is_empty() {
                    batch.config_file = zone_cfg.config_path.clone();
                }
                if batch.env_file.is_empty() {
                    batch.env_file = zone_cfg.env_path.clone();
                }
            }
            total_slots += batch.required_slots();
            let remaining = self.request_timeout(request, "agent submission")?;
            session.submit_workers(batch, remaining).await?;
        }
        tracing::info!(partition = %session.partition_id, total_slots, "waiting for active slots");
        let remaining = self.request_timeout(request, "waiting for slots")?;
        session.wait_for_slots(total_slots, remaining).await?;

        let hosts: BTreeSet<String> = session
            .handle()
            .list_workers()
            .await
            .map_err(|e| Error::new(ErrorCode::DdsSubmitAgentsFailed, e.to_string()))?
            .into_iter()
            .map(|w| w.host)
            .collect();
        Ok(hosts)
    }

    async fn close_session(&self, partition: &Arc<Partition>) -> Result<(), Error> {
        let (topology, session) = {
            let mut shared = partition.lock_shared();
            shared.requirements = None;
            shared.topo_path = None;
            (shared.topology.take(), shared.session.take())
        };
        if let Some(topology) = topology {
            topology.detach().await;
        }
        if let Some(session) = session {
            session.shutdown().await?;
            tracing::info!(partition = %partition.id, "session shut down");
        }
        Ok(())
    }

    fn subscribe_task_done(&self, session: &Arc<Session>) -> Result<(), Error> {
        if !session.is_running() {
            return Err(Error::new(
                ErrorCode::DdsSubscribeToSessionFailed,
                "failed to subscribe to task done events: session is not running",
            ));
        }
        let mut rx = session.handle().subscribe_task_done();
        let partition = session.partition_id.clone();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if event.exit_code != 0 {
                    tracing::error!(
                        partition = %partition,
                        task = event.task_id,
                        path = %event.path,
                        exit_code = event.exit_code,
                        host = %event.host,
                        "task exited abnormally"
                    );
                } else {
                    tracing::debug!(
                        partition = %partition,
                        task = event.task_id,
                        path = %event.path,
                        "task exited"
                    );
                }
            }
        });
        Ok(())
    }

    fn device_outcome(
        &self,
        name: &str,
        partition: &Arc<Partition>,
        result: ChangeStateResult,
        detailed: bool,
    ) -> Outcome {
        let mut outcome = Outcome::done(name).with_state(result.aggregated);
        if detailed {
            outcome.collections = Some(self.collection_states(partition, &result.state));
            outcome.devices = Some(result.state);
        }
        outcome
    }

    /// Per-collection aggregation of a device report.
    fn collection_states(
        &self,
        partition: &Arc<Partition>,
        state: &TopologyState,
    ) -> Vec<CollectionState> {
        let session = partition.lock_shared().session.clone();
        let mut by_collection: BTreeMap<CollectionId, Vec<&conductor_topology::DeviceStatus>> =
            BTreeMap::new();
        for status in state {
            if let Some(collection_id) = status.collection_id {
                by_collection.entry(collection_id).or_default().push(status);
            }
        }
        by_collection
            .into_iter()
            .map(|(collection_id, members)| {
                let path = session
                    .as_ref()
                    .and_then(|s| s.collection_info(collection_id))
                    .map(|c| c.path)
                    .unwrap_or_else(|| {
                        members[0]
                            .path
                            .rsplit_once('/')
                            .map(|(parent, _)| parent.to_owned())
                            .unwrap_or_default()
                    });
                CollectionState {
                    collection_id,
                    path,
                    aggregated: conductor_topology::aggregate_status(members),
                }
            })
            .collect()
    }

    fn log_failure_summary(&self, partition: &Arc<Partition>, result: &ChangeStateResult) {
        let session = partition.lock_shared().session.clone();
        for status in result.state.iter().filter(|s| s.state != result.expected) {
            let placement = session
                .as_ref()
                .and_then(|s| s.task_info(status.task_id))
                .map(|t| format!(" on {} ({})", t.host, t.work_dir))
                .unwrap_or_default();
            tracing::error!(
                partition = %partition.id,
                task = status.task_id,
                path = %status.path,
                state = %status.state,
                last_state = %status.last_state,
                subscribed = status.subscribed,
                "device failed to reach {}{placement}",
                result.expected
            );
        }
        let stats = StateStats::new(result.state.iter(), result.expected);
        if !stats.failed_collections.is_empty() {
            tracing::error!(
                partition = %partition.id,
                collections = ?stats.failed_collections,
                "collections failed to reach {}",
                result.expected
            );
        }
    }

    fn log_failed_tasks(&self, partition: &Arc<Partition>, op: &str, failed: &[u64]) {
        let session = partition.lock_shared().session.clone();
        for task_id in failed {
            let placement = session
                .as_ref()
                .and_then(|s| s.task_info(*task_id))
                .map(|t| format!("{} ({})", t.path, t.host))
                .unwrap_or_else(|| "unknown task".to_owned());
            tracing::error!(partition = %partition.id, task = task_id, "{op} failed for {placement}");
        }
    }

    async fn live_hosts(&self, partition: &Arc<Partition>) -> BTreeSet<String> {
        let session = partition.lock_shared().session.clone();
        match session {
            Some(session) => session
                .handle()
                .list_workers()
                .await
                .map(|workers| workers.into_iter().map(|w| w.host).collect())
                .unwrap_or_default(),
            None => BTreeSet::new(),
        }
    }

    async fn worker_count(&self, session: &Arc<Session>) -> Result<usize, Error> {
        session
            .handle()
            .list_workers()
            .await
            .map(|w| w.len())
            .map_err(|e| Error::new(ErrorCode::TopologyFailed, e.to_string()))
    }

    fn topology(
        &self,
        partition: &Arc<Partition>,
        code: ErrorCode,
    ) -> Result<Arc<Topology>, Error> {
        partition
            .lock_shared()
            .topology
            .clone()
            .ok_or_else(|| Error::new(code, "device topology is not initialized"))
    }

    fn running_session(
        &self,
        partition: &Arc<Partition>,
        code: ErrorCode,
    ) -> Result<Arc<Session>, Error> {
        let session = partition.lock_shared().session.clone().ok_or_else(|| {
            Error::new(code, "session is not running, use Initialize or Run first")
        })?;
        if !session.is_running() {
            return Err(Error::new(
                code,
                "session is not running, use Initialize or Run first",
            ));
        }
        Ok(session)
    }

    /// Remaining budget of the request: configured timeout minus the
    /// time elapsed since acceptance.
    fn request_timeout(&self, request: &Request, op: &str) -> Result<Duration, Error> {
        let configured = if request.common.timeout_secs == 0 {
            self.config.default_timeout
        } else {
            Duration::from_secs(request.common.timeout_secs)
        };
        let elapsed = request.accepted.elapsed();
        match configured.checked_sub(elapsed) {
            Some(remaining) if !remaining.is_zero() => {
                tracing::debug!(
                    partition = %request.common.partition_id,
                    configured_ms = configured.as_millis() as u64,
                    remaining_ms = remaining.as_millis() as u64,
                    "{op}: deriving step deadline"
                );
                Ok(remaining)
            }
            _ => Err(Error::timeout(format!(
                "request timeout before {op}: configured {}ms, elapsed {}ms",
                configured.as_millis(),
                elapsed.as_millis()
            ))),
        }
    }

    fn acquire_partition(&self, id: &str) -> Arc<Partition> {
        let mut registry = self.lock_partitions();
        registry
            .entry(id.to_owned())
            .or_insert_with(|| {
                tracing::debug!(partition = id, "created partition");
                Arc::new(Partition::new(id))
            })
            .clone()
    }

    fn lock_partitions(&self) -> MutexGuard<'_, HashMap<String, Arc<Partition>>> {
        self.partitions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rewrite the restore index from the running partitions. Performed
    /// under the registry mutex so parallel rewrites cannot interleave.
    fn update_restore(&self) {
        let Some(restore_id) = &self.config.restore_id else {
            return;
        };
        let registry = self.lock_partitions();
        let mut data = RestoreData::default();
        for partition in registry.values() {
            let shared = partition.lock_shared();
            if let Some(session) = &shared.session {
                if session.is_running() {
                    data.partitions.push(RestorePartition {
                        partition_id: partition.id.clone(),
                        session_id: session.id(),
                    });
                }
            }
        }
        let file = RestoreFile::new(restore_id, &self.config.restore_dir);
        if let Err(err) = file.write(&data) {
            tracing::error!(%err, "failed to update restore file");
        }
    }

    fn append_history(&self, request: &Request, partition: &Arc<Partition>) {
        let Some(history_dir) = &self.config.history_dir else {
            return;
        };
        let session_id = partition
            .lock_shared()
            .session
            .as_ref()
            .map(|s| s.id())
            .unwrap_or_default();
        if let Err(err) = append_history(
            history_dir,
            &partition.id,
            request.common.run_nr,
            &session_id,
        ) {
            tracing::warn!(partition = %partition.id, %err, "failed to append history");
        }
    }

    fn build_result(
        &self,
        request: &Request,
        partition: &Arc<Partition>,
        outcome: Outcome,
    ) -> RequestResult {
        let (session_id, run_nr) = {
            let shared = partition.lock_shared();
            let session_id = shared
                .session
                .as_ref()
                .map(|s| s.id())
                .unwrap_or_default();
            let run_nr = if request.common.run_nr > 0 {
                request.common.run_nr
            } else {
                shared.run_nr
            };
            (session_id, run_nr)
        };
        let status = if outcome.error.is_some() {
            RequestStatus::Error
        } else {
            RequestStatus::Success
        };
        let result = RequestResult {
            status,
            msg: outcome.msg,
            exec_time_ms: request.elapsed_ms(),
            error: outcome.error,
            partition_id: request.common.partition_id.clone(),
            run_nr,
            session_id,
            aggregated: outcome.aggregated,
            devices: outcome.devices,
            collections: outcome.collections,
            hosts: outcome.hosts,
        };
        tracing::info!(
            partition = %result.partition_id,
            run = result.run_nr,
            status = ?result.status,
            aggregated = %result.aggregated,
            exec_time_ms = result.exec_time_ms,
            "{} request finished",
            request.name()
        );
        result
    }
}

/// Derive one worker batch per agent group of the requirements summary.
fn batches_from_requirements(requirements: &Requirements) -> Vec<WorkerBatch> {
    requirements
        .agent_groups
        .values()
        .map(|group| WorkerBatch {
            rms: "localhost".to_owned(),
            zone: group.zone.clone(),
            agent_group: group.name.clone(),
            n: group.num_agents.max(1) as u32,
            slots: group.num_slots.max(1) as u32,
            cores: group.num_cores.max(0) as u32,
            config_file: String::new(),
            env_file: String::new(),
            required_slots: 0,
        })
        .collect()
}
