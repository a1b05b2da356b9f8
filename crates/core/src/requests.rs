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

//! Request and reply model of the control plane
//!
//! All lifecycle requests share a common header (partition id, run
//! number, timeout) and a timer started at acceptance; the controller
//! derives every inner deadline from it. The shapes are wire-neutral:
//! any ingress that maps its messages onto [`Request`] satisfies the
//! control plane.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use conductor_topology::{AggregatedState, TopologyState};

use crate::error::Error;
use crate::CollectionId;

/// Common request header.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommonParams {
    pub partition_id: String,
    pub run_nr: u64,
    /// Request timeout in seconds; `0` means "controller default".
    pub timeout_secs: u64,
}

impl CommonParams {
    pub fn new(partition_id: impl Into<String>, run_nr: u64, timeout_secs: u64) -> Self {
        Self {
            partition_id: partition_id.into(),
            run_nr,
            timeout_secs,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InitializeParams {
    /// Session to attach to; empty creates a fresh session.
    pub session_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubmitParams {
    /// Resource plugin name; must be `localhost` or a registered plugin.
    pub plugin: String,
    /// Parsable description of the requested resources.
    pub resources: String,
}

/// Exactly one of `file`, `content` and `script` must be set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TopologyParams {
    pub file: String,
    pub content: String,
    pub script: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunParams {
    /// Run never attaches; a non-empty session id is rejected with
    /// `RequestNotSupported`.
    pub session_id: String,
    pub plugin: String,
    pub resources: String,
    pub topology: TopologyParams,
    /// Derive the worker submission from the topology description
    /// instead of the resource plugin.
    pub extract_topo_resources: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceParams {
    /// Topology path selection; empty selects every task.
    pub path: String,
    /// Include the per-device report in the reply.
    pub detailed: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SetPropertiesParams {
    pub path: String,
    pub properties: Vec<(String, String)>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatusParams {
    /// Restrict the report to partitions with a running session.
    pub running: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RequestBody {
    Initialize(InitializeParams),
    Submit(SubmitParams),
    Activate(TopologyParams),
    Run(RunParams),
    Update(TopologyParams),
    Configure(DeviceParams),
    Start(DeviceParams),
    Stop(DeviceParams),
    Reset(DeviceParams),
    Terminate(DeviceParams),
    SetProperties(SetPropertiesParams),
    GetState(DeviceParams),
    Shutdown,
}

impl RequestBody {
    pub fn name(&self) -> &'static str {
        match self {
            RequestBody::Initialize(_) => "Initialize",
            RequestBody::Submit(_) => "Submit",
            RequestBody::Activate(_) => "Activate",
            RequestBody::Run(_) => "Run",
            RequestBody::Update(_) => "Update",
            RequestBody::Configure(_) => "Configure",
            RequestBody::Start(_) => "Start",
            RequestBody::Stop(_) => "Stop",
            RequestBody::Reset(_) => "Reset",
            RequestBody::Terminate(_) => "Terminate",
            RequestBody::SetProperties(_) => "SetProperties",
            RequestBody::GetState(_) => "GetState",
            RequestBody::Shutdown => "Shutdown",
        }
    }
}

/// One lifecycle request, stamped with its acceptance time.
#[derive(Clone, Debug)]
pub struct Request {
    pub common: CommonParams,
    pub body: RequestBody,
    pub accepted: Instant,
}

impl Request {
    pub fn new(common: CommonParams, body: RequestBody) -> Self {
        Self {
            common,
            body,
            accepted: Instant::now(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.body.name()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.accepted.elapsed().as_millis() as u64
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    #[default]
    Unknown,
    Success,
    Error,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    #[default]
    Unknown,
    Running,
    Stopped,
}

/// Aggregated state of one collection instance, reported in detailed
/// replies.
#[derive(Clone, Debug, Serialize)]
pub struct CollectionState {
    pub collection_id: CollectionId,
    pub path: String,
    pub aggregated: AggregatedState,
}

/// Reply to every lifecycle request.
#[derive(Clone, Debug, Serialize)]
pub struct RequestResult {
    pub status: RequestStatus,
    pub msg: String,
    pub exec_time_ms: u64,
    pub error: Option<Error>,
    pub partition_id: String,
    pub run_nr: u64,
    pub session_id: String,
    pub aggregated: AggregatedState,
    /// Per-device report, present when `detailed` was requested.
    pub devices: Option<TopologyState>,
    /// Per-collection report, present when `detailed` was requested.
    pub collections: Option<Vec<CollectionState>>,
    pub hosts: BTreeSet<String>,
}

impl RequestResult {
    pub fn is_success(&self) -> bool {
        self.status == RequestStatus::Success
    }
}

/// Per-partition record of a Status reply.
#[derive(Clone, Debug, Serialize)]
pub struct PartitionStatus {
    pub partition_id: String,
    pub session_id: String,
    pub session_status: SessionStatus,
    pub aggregated: AggregatedState,
}

/// Reply to a Status request.
#[derive(Clone, Debug, Serialize)]
pub struct StatusResult {
    pub status: RequestStatus,
    pub msg: String,
    pub exec_time_ms: u64,
    pub partitions: Vec<PartitionStatus>,
}
