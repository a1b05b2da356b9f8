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

//! Device-topology state machine and collective command engine
//!
//! This crate drives many long-running processing devices in parallel
//! through a finite state graph. The [`engine::Topology`] fans typed
//! commands out over a [`bus::CommandBus`], tracks per-device status,
//! aggregates states and enforces per-operation deadlines; partial
//! failures are recorded per task so a controller can attribute and
//! recover them.

#![warn(clippy::all)]

pub mod bus;
pub mod command;
pub mod engine;
pub mod ops;
pub mod state;

/// Runtime identifier of a deployed task, assigned by the deployment
/// substrate on activation.
pub type TaskId = u64;

/// Runtime identifier of a deployed collection instance.
pub type CollectionId = u64;

pub use bus::{BusError, CommandBus};
pub use command::{CmdResult, DeviceCommand, DeviceReply};
pub use engine::{AttachError, ChangeStateResult, EngineError, TaskDescriptor, Topology};
pub use ops::{GetPropertiesResult, OpFailure, SetPropertiesResult};
pub use state::{
    aggregate_states, aggregate_status, AggregatedState, DeviceState, DeviceStatus, StateStats,
    TopologyState, Transition,
};
