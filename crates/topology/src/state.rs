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

//! Device state machine: states, transitions and state aggregation
//!
//! Every processing device moves through the same finite state graph:
//! `Idle → InitializingDevice → Initialized → Bound → DeviceReady → Ready
//! → Running → Ready → ... → Exiting`. Transitions are requested by the
//! topology engine; each transition has exactly one expected post-state,
//! and a device that settles anywhere else has failed the transition.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{CollectionId, TaskId};

/// State of a single device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceState {
    #[default]
    Undefined,
    Ok,
    Error,
    Idle,
    InitializingDevice,
    Initialized,
    Binding,
    Bound,
    Connecting,
    DeviceReady,
    Ready,
    Running,
    ResettingTask,
    ResettingDevice,
    Exiting,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Undefined => "UNDEFINED",
            DeviceState::Ok => "OK",
            DeviceState::Error => "ERROR",
            DeviceState::Idle => "IDLE",
            DeviceState::InitializingDevice => "INITIALIZING DEVICE",
            DeviceState::Initialized => "INITIALIZED",
            DeviceState::Binding => "BINDING",
            DeviceState::Bound => "BOUND",
            DeviceState::Connecting => "CONNECTING",
            DeviceState::DeviceReady => "DEVICE READY",
            DeviceState::Ready => "READY",
            DeviceState::Running => "RUNNING",
            DeviceState::ResettingTask => "RESETTING TASK",
            DeviceState::ResettingDevice => "RESETTING DEVICE",
            DeviceState::Exiting => "EXITING",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collapse of many device states into one value.
///
/// Identical to [`DeviceState`] plus `Mixed`, which is produced iff the
/// non-ignored devices of a selection occupy more than one state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregatedState {
    #[default]
    Undefined,
    Ok,
    Error,
    Idle,
    InitializingDevice,
    Initialized,
    Binding,
    Bound,
    Connecting,
    DeviceReady,
    Ready,
    Running,
    ResettingTask,
    ResettingDevice,
    Exiting,
    Mixed,
}

impl From<DeviceState> for AggregatedState {
    fn from(state: DeviceState) -> Self {
        match state {
            DeviceState::Undefined => AggregatedState::Undefined,
            DeviceState::Ok => AggregatedState::Ok,
            DeviceState::Error => AggregatedState::Error,
            DeviceState::Idle => AggregatedState::Idle,
            DeviceState::InitializingDevice => AggregatedState::InitializingDevice,
            DeviceState::Initialized => AggregatedState::Initialized,
            DeviceState::Binding => AggregatedState::Binding,
            DeviceState::Bound => AggregatedState::Bound,
            DeviceState::Connecting => AggregatedState::Connecting,
            DeviceState::DeviceReady => AggregatedState::DeviceReady,
            DeviceState::Ready => AggregatedState::Ready,
            DeviceState::Running => AggregatedState::Running,
            DeviceState::ResettingTask => AggregatedState::ResettingTask,
            DeviceState::ResettingDevice => AggregatedState::ResettingDevice,
            DeviceState::Exiting => AggregatedState::Exiting,
        }
    }
}

impl fmt::Display for AggregatedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregatedState::Mixed => f.write_str("MIXED"),
            other => f.write_str(device_state_of(*other).as_str()),
        }
    }
}

fn device_state_of(state: AggregatedState) -> DeviceState {
    match state {
        AggregatedState::Undefined => DeviceState::Undefined,
        AggregatedState::Ok => DeviceState::Ok,
        AggregatedState::Error => DeviceState::Error,
        AggregatedState::Idle => DeviceState::Idle,
        AggregatedState::InitializingDevice => DeviceState::InitializingDevice,
        AggregatedState::Initialized => DeviceState::Initialized,
        AggregatedState::Binding => DeviceState::Binding,
        AggregatedState::Bound => DeviceState::Bound,
        AggregatedState::Connecting => DeviceState::Connecting,
        AggregatedState::DeviceReady => DeviceState::DeviceReady,
        AggregatedState::Ready => DeviceState::Ready,
        AggregatedState::Running => DeviceState::Running,
        AggregatedState::ResettingTask => DeviceState::ResettingTask,
        AggregatedState::ResettingDevice => DeviceState::ResettingDevice,
        AggregatedState::Exiting => DeviceState::Exiting,
        AggregatedState::Mixed => DeviceState::Undefined,
    }
}

/// Atomic event moving a device between two states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transition {
    InitDevice,
    CompleteInit,
    Bind,
    Connect,
    InitTask,
    Run,
    Stop,
    ResetTask,
    ResetDevice,
    End,
}

impl Transition {
    /// The single state a device is expected to settle in after the
    /// transition completes. Any other settled state is a failure.
    pub fn expected_state(&self) -> DeviceState {
        match self {
            Transition::InitDevice => DeviceState::InitializingDevice,
            Transition::CompleteInit => DeviceState::Initialized,
            Transition::Bind => DeviceState::Bound,
            Transition::Connect => DeviceState::DeviceReady,
            Transition::InitTask => DeviceState::Ready,
            Transition::Run => DeviceState::Running,
            Transition::Stop => DeviceState::Ready,
            Transition::ResetTask => DeviceState::DeviceReady,
            Transition::ResetDevice => DeviceState::Idle,
            Transition::End => DeviceState::Exiting,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::InitDevice => "INIT DEVICE",
            Transition::CompleteInit => "COMPLETE INIT",
            Transition::Bind => "BIND",
            Transition::Connect => "CONNECT",
            Transition::InitTask => "INIT TASK",
            Transition::Run => "RUN",
            Transition::Stop => "STOP",
            Transition::ResetTask => "RESET TASK",
            Transition::ResetDevice => "RESET DEVICE",
            Transition::End => "END",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "InitDevice" => Ok(Transition::InitDevice),
            "CompleteInit" => Ok(Transition::CompleteInit),
            "Bind" => Ok(Transition::Bind),
            "Connect" => Ok(Transition::Connect),
            "InitTask" => Ok(Transition::InitTask),
            "Run" => Ok(Transition::Run),
            "Stop" => Ok(Transition::Stop),
            "ResetTask" => Ok(Transition::ResetTask),
            "ResetDevice" => Ok(Transition::ResetDevice),
            "End" => Ok(Transition::End),
            other => Err(format!("unknown transition: {other}")),
        }
    }
}

/// Live status of a single device within a topology.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceStatus {
    pub task_id: TaskId,
    pub collection_id: Option<CollectionId>,
    /// Runtime path of the task within the topology tree.
    pub path: String,
    pub state: DeviceState,
    pub last_state: DeviceState,
    /// Whether the device acknowledged the state-change subscription.
    pub subscribed: bool,
    /// Dropped from aggregation and fan-out after a tolerated failure.
    pub ignored: bool,
    /// A failure of this device must not fail the partition.
    pub expendable: bool,
}

/// Per-device report of a topology selection.
pub type TopologyState = Vec<DeviceStatus>;

/// Aggregate an iterator of device states.
///
/// Empty selection yields `Undefined`; a single distinct state yields that
/// state; two or more distinct states yield `Mixed`. Callers are expected
/// to have filtered ignored devices out already.
pub fn aggregate_states<I>(states: I) -> AggregatedState
where
    I: IntoIterator<Item = DeviceState>,
{
    let mut first: Option<DeviceState> = None;
    for state in states {
        match first {
            None => first = Some(state),
            Some(seen) if seen == state => {}
            Some(_) => return AggregatedState::Mixed,
        }
    }
    first.map_or(AggregatedState::Undefined, AggregatedState::from)
}

/// Aggregate the non-ignored devices of a status selection.
pub fn aggregate_status<'a, I>(statuses: I) -> AggregatedState
where
    I: IntoIterator<Item = &'a DeviceStatus>,
{
    aggregate_states(
        statuses
            .into_iter()
            .filter(|s| !s.ignored)
            .map(|s| s.state),
    )
}

/// Task and collection tallies logged after every state change.
#[derive(Debug, Default)]
pub struct StateStats {
    pub task_counts: BTreeMap<DeviceState, usize>,
    pub total_tasks: usize,
    pub failed_tasks: usize,
    pub failed_collections: Vec<CollectionId>,
}

impl StateStats {
    /// Tally a selection against the state it was expected to reach.
    pub fn new<'a, I>(statuses: I, expected: DeviceState) -> Self
    where
        I: IntoIterator<Item = &'a DeviceStatus>,
    {
        let mut stats = StateStats::default();
        let mut by_collection: BTreeMap<CollectionId, bool> = BTreeMap::new();
        for status in statuses {
            stats.total_tasks += 1;
            *stats.task_counts.entry(status.state).or_default() += 1;
            let failed = !status.ignored && status.state != expected;
            if failed {
                stats.failed_tasks += 1;
            }
            if let Some(collection) = status.collection_id {
                *by_collection.entry(collection).or_default() |= failed;
            }
        }
        stats.failed_collections = by_collection
            .into_iter()
            .filter_map(|(id, failed)| failed.then_some(id))
            .collect();
        stats
    }

    pub fn tasks_summary(&self) -> String {
        let mut parts = Vec::with_capacity(self.task_counts.len());
        for (state, count) in &self.task_counts {
            parts.push(format!("{state}: {count}"));
        }
        format!(
            "tasks total: {}, failed: {} [{}]",
            self.total_tasks,
            self.failed_tasks,
            parts.join(", ")
        )
    }
}
