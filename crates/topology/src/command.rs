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

//! Typed device commands and replies
//!
//! The device-command client speaks a small typed protocol over the
//! per-task command bus: state changes, property access and state-change
//! subscriptions. On the wire every message is a JSON object tagged with
//! its variant name, so any device runtime able to emit JSON can take
//! part.

use serde::{Deserialize, Serialize};

use crate::state::{DeviceState, Transition};
use crate::TaskId;

/// Outcome reported by a device for a single command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmdResult {
    Ok,
    Failure,
}

/// Command sent from the topology engine to one or more devices.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DeviceCommand {
    /// Ask the device to report its current state.
    CheckState,
    /// Request a state-machine transition.
    ChangeState { transition: Transition },
    /// Subscribe to state-change events; the device confirms with
    /// [`DeviceReply::StateChangeSubscription`] and then reports every
    /// state mutation.
    SubscribeToStateChange { interval_ms: u64 },
    UnsubscribeFromStateChange,
    /// Query device properties matching `query` (empty selects all).
    GetProperties { request_id: u64, query: String },
    /// Set device properties.
    SetProperties {
        request_id: u64,
        properties: Vec<(String, String)>,
    },
}

/// Reply or event published by a device on the command bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum DeviceReply {
    /// Echo of a [`DeviceCommand::ChangeState`]: carries the settled
    /// state so the engine can validate it against the expectation.
    TransitionStatus {
        device_id: String,
        task_id: TaskId,
        result: CmdResult,
        transition: Transition,
        current_state: DeviceState,
    },
    /// Spontaneous state report (subscription event or answer to
    /// [`DeviceCommand::CheckState`]).
    StateChange {
        device_id: String,
        task_id: TaskId,
        last_state: DeviceState,
        current_state: DeviceState,
    },
    StateChangeSubscription {
        device_id: String,
        task_id: TaskId,
        result: CmdResult,
    },
    StateChangeUnsubscription {
        device_id: String,
        task_id: TaskId,
        result: CmdResult,
    },
    Properties {
        device_id: String,
        task_id: TaskId,
        request_id: u64,
        result: CmdResult,
        properties: Vec<(String, String)>,
    },
    PropertiesSet {
        device_id: String,
        task_id: TaskId,
        request_id: u64,
        result: CmdResult,
    },
}

impl DeviceReply {
    /// The task the reply originates from.
    pub fn task_id(&self) -> TaskId {
        match self {
            DeviceReply::TransitionStatus { task_id, .. }
            | DeviceReply::StateChange { task_id, .. }
            | DeviceReply::StateChangeSubscription { task_id, .. }
            | DeviceReply::StateChangeUnsubscription { task_id, .. }
            | DeviceReply::Properties { task_id, .. }
            | DeviceReply::PropertiesSet { task_id, .. } => *task_id,
        }
    }
}

/// Encode a command for the wire.
pub fn encode_command(cmd: &DeviceCommand) -> Result<String, serde_json::Error> {
    serde_json::to_string(cmd)
}

/// Decode a command from the wire.
pub fn decode_command(raw: &str) -> Result<DeviceCommand, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Encode a reply for the wire.
pub fn encode_reply(reply: &DeviceReply) -> Result<String, serde_json::Error> {
    serde_json::to_string(reply)
}

/// Decode a reply from the wire.
pub fn decode_reply(raw: &str) -> Result<DeviceReply, serde_json::Error> {
    serde_json::from_str(raw)
}
