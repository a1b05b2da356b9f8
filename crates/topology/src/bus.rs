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

//! Command-bus seam between the topology engine and the deployment
//! substrate's per-task transport.
//!
//! The engine publishes a command to a set of tasks and consumes replies
//! as an unordered event stream. Reply order across devices carries no
//! meaning; the collective-operation records are order-independent.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::command::{DeviceCommand, DeviceReply};
use crate::TaskId;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("command bus is closed")]
    Closed,
    #[error("command transport failure: {0}")]
    Transport(String),
}

/// Per-task custom-command transport of one deployment session.
#[async_trait]
pub trait CommandBus: Send + Sync + 'static {
    /// Deliver `cmd` to every task in `targets`. Delivery is best-effort
    /// per task; devices answer asynchronously on the reply stream.
    async fn publish(&self, targets: &HashSet<TaskId>, cmd: DeviceCommand) -> Result<(), BusError>;

    /// Subscribe to the session-wide reply stream.
    fn replies(&self) -> broadcast::Receiver<DeviceReply>;
}
