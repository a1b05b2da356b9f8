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

//! Stable error taxonomy
//!
//! Every failed operation reports one of these codes plus a free-form
//! detail string. The labels are part of the control-plane contract and
//! never change; callers are expected to match on them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable, human-readable error labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    RequestTimeout,
    RequestNotSupported,
    DdsCreateSessionFailed,
    DdsAttachToSessionFailed,
    DdsShutdownSessionFailed,
    DdsSubmitAgentsFailed,
    DdsActivateTopologyFailed,
    DdsCreateTopologyFailed,
    DdsCommanderInfoFailed,
    DdsSubscribeToSessionFailed,
    ResourcePluginFailed,
    TopologyFailed,
    DeviceChangeStateFailed,
    DeviceGetStateFailed,
    DeviceSetPropertiesFailed,
    DeviceGetPropertiesFailed,
    RuntimeError,
}

impl ErrorCode {
    /// Canonical wire label of the code.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCode::RequestTimeout => "RequestTimeout",
            ErrorCode::RequestNotSupported => "RequestNotSupported",
            ErrorCode::DdsCreateSessionFailed => "DDSCreateSessionFailed",
            ErrorCode::DdsAttachToSessionFailed => "DDSAttachToSessionFailed",
            ErrorCode::DdsShutdownSessionFailed => "DDSShutdownSessionFailed",
            ErrorCode::DdsSubmitAgentsFailed => "DDSSubmitAgentsFailed",
            ErrorCode::DdsActivateTopologyFailed => "DDSActivateTopologyFailed",
            ErrorCode::DdsCreateTopologyFailed => "DDSCreateTopologyFailed",
            ErrorCode::DdsCommanderInfoFailed => "DDSCommanderInfoFailed",
            ErrorCode::DdsSubscribeToSessionFailed => "DDSSubscribeToSessionFailed",
            ErrorCode::ResourcePluginFailed => "ResourcePluginFailed",
            ErrorCode::TopologyFailed => "TopologyFailed",
            ErrorCode::DeviceChangeStateFailed => "DeviceChangeStateFailed",
            ErrorCode::DeviceGetStateFailed => "DeviceGetStateFailed",
            ErrorCode::DeviceSetPropertiesFailed => "DeviceSetPropertiesFailed",
            ErrorCode::DeviceGetPropertiesFailed => "DeviceGetPropertiesFailed",
            ErrorCode::RuntimeError => "RuntimeError",
        }
    }

    /// Numeric companion of the label, grouped by failure domain.
    pub fn code(&self) -> u32 {
        match self {
            ErrorCode::RequestTimeout => 100,
            ErrorCode::RequestNotSupported => 101,
            ErrorCode::DdsCreateSessionFailed => 200,
            ErrorCode::DdsAttachToSessionFailed => 201,
            ErrorCode::DdsShutdownSessionFailed => 202,
            ErrorCode::DdsSubmitAgentsFailed => 203,
            ErrorCode::DdsActivateTopologyFailed => 204,
            ErrorCode::DdsCreateTopologyFailed => 205,
            ErrorCode::DdsCommanderInfoFailed => 206,
            ErrorCode::DdsSubscribeToSessionFailed => 207,
            ErrorCode::ResourcePluginFailed => 300,
            ErrorCode::TopologyFailed => 301,
            ErrorCode::DeviceChangeStateFailed => 400,
            ErrorCode::DeviceGetStateFailed => 401,
            ErrorCode::DeviceSetPropertiesFailed => 402,
            ErrorCode::DeviceGetPropertiesFailed => 403,
            ErrorCode::RuntimeError => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Error record carried by every failed reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {details}")]
pub struct Error {
    pub code: ErrorCode,
    pub details: String,
}

impl Error {
    pub fn new(code: ErrorCode, details: impl Into<String>) -> Self {
        Self {
            code,
            details: details.into(),
        }
    }

    /// Timeout helper used by every deadline-bounded wait.
    pub fn timeout(details: impl Into<String>) -> Self {
        Self::new(ErrorCode::RequestTimeout, details)
    }

    pub fn runtime(details: impl Into<String>) -> Self {
        Self::new(ErrorCode::RuntimeError, details)
    }
}
