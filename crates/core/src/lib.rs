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

//! Conductor core: the stateful control plane for dynamic compute
//! clusters of long-running processing devices.
//!
//! The [`controller::Controller`] mediates between an experiment-control
//! caller and a deployment substrate, exposing an ordered set of
//! lifecycle operations per named partition: create/attach a session,
//! submit worker hosts, activate a topology of tasks, drive the tasks
//! through the device state machine, rescale the topology live and tear
//! it down. The device-topology state machine itself lives in
//! `conductor-topology`; this crate adds request orchestration, the
//! session adapter, requirements extraction and nMin-based recovery.

#![warn(clippy::all)]

pub mod controller;
pub mod deployment;
pub mod error;
pub mod plugin;
pub mod requests;
pub mod requirements;
pub mod restore;
pub mod session;
pub mod topo_desc;

pub use conductor_topology::{CollectionId, TaskId};

pub use controller::{Controller, ControllerConfig, Partition, ZoneConfig};
pub use deployment::{Deployment, DeploymentSession, WorkerBatch, WorkerId};
pub use error::{Error, ErrorCode};
pub use plugin::{PluginManager, TriggerManager, LOCALHOST_PLUGIN};
pub use requests::{
    CommonParams, DeviceParams, InitializeParams, PartitionStatus, Request, RequestBody,
    RequestResult, RequestStatus, RunParams, SessionStatus, SetPropertiesParams, StatusParams,
    StatusResult, SubmitParams, TopologyParams,
};
pub use requirements::{extract_requirements, Requirements};
pub use session::Session;
pub use topo_desc::TopologyDesc;
