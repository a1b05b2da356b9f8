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

//! Topology engine
//!
//! Fans typed commands out to a set of tasks, collects the asynchronous
//! replies, aggregates device states and enforces a per-operation
//! deadline. One mutex guards the status map and the operation table;
//! reply arrival, timer fire and caller threads all acquire it before
//! mutating a record, and completion callbacks run after it is released.
//! Late replies for completed operations are discarded silently.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bus::{BusError, CommandBus};
use crate::command::{CmdResult, DeviceCommand, DeviceReply};
use crate::ops::{
    ChangeStateOp, CheckStateOp, Completion, GetPropertiesOp, GetPropertiesResult, OpFailure,
    SetPropertiesOp, SetPropertiesResult, SubscribeOp, WaitForStateOp,
};
use crate::state::{
    aggregate_states, AggregatedState, DeviceState, DeviceStatus, TopologyState, Transition,
};
use crate::TaskId;

/// Default heartbeat interval requested with state-change subscriptions.
const SUBSCRIPTION_INTERVAL_MS: u64 = 60_000;

/// Static description of one task handed to [`Topology::attach`].
#[derive(Clone, Debug)]
pub struct TaskDescriptor {
    pub id: TaskId,
    pub path: String,
    pub collection_id: Option<crate::CollectionId>,
    pub expendable: bool,
}

/// Result of a collective state change.
#[derive(Debug)]
pub struct ChangeStateResult {
    pub aggregated: AggregatedState,
    pub state: TopologyState,
    pub failed: Vec<TaskId>,
    pub failure: Option<OpFailure>,
    pub expected: DeviceState,
}

impl ChangeStateResult {
    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no tasks found matching the path {0:?}")]
    NoMatch(String),
    #[error("timed out waiting for state")]
    Timeout,
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("topology engine was shut down")]
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("timed out while synchronizing with devices")]
    Timeout,
    #[error("devices rejected the state-change subscription: {0:?}")]
    SubscriptionFailed(Vec<TaskId>),
    #[error("devices did not report an initial state: {0:?}")]
    MissingState(Vec<TaskId>),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("topology engine was shut down")]
    Shutdown,
}

#[derive(Clone, Copy, Debug)]
enum OpKind {
    ChangeState,
    WaitForState,
    CheckState,
    Subscribe,
    GetProperties,
    SetProperties,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, DeviceStatus>,
    change_ops: HashMap<u64, ChangeStateOp>,
    wait_ops: HashMap<u64, WaitForStateOp>,
    check_ops: HashMap<u64, CheckStateOp>,
    subscribe_ops: HashMap<u64, SubscribeOp>,
    get_prop_ops: HashMap<u64, GetPropertiesOp>,
    set_prop_ops: HashMap<u64, SetPropertiesOp>,
    next_op: u64,
    next_request: u64,
    router: Option<JoinHandle<()>>,
}

impl Inner {
    fn next_op(&mut self) -> u64 {
        self.next_op += 1;
        self.next_op
    }

    fn next_request(&mut self) -> u64 {
        self.next_request += 1;
        self.next_request
    }
}

/// The live device set of one partition.
pub struct Topology {
    bus: Arc<dyn CommandBus>,
    inner: Mutex<Inner>,
}

impl Topology {
    /// Attach to a live device set: subscribe every device to
    /// state-change reporting and synchronize the initial states. All
    /// tasks must report within `deadline`.
    pub async fn attach(
        bus: Arc<dyn CommandBus>,
        descriptors: Vec<TaskDescriptor>,
        deadline: Duration,
    ) -> Result<Arc<Self>, AttachError> {
        let mut tasks = HashMap::with_capacity(descriptors.len());
        for desc in descriptors {
            tasks.insert(
                desc.id,
                DeviceStatus {
                    task_id: desc.id,
                    collection_id: desc.collection_id,
                    path: desc.path,
                    state: DeviceState::Undefined,
                    last_state: DeviceState::Undefined,
                    subscribed: false,
                    ignored: false,
                    expendable: desc.expendable,
                },
            );
        }
        let topology = Arc::new(Self {
            bus,
            inner: Mutex::new(Inner {
                tasks,
                ..Inner::default()
            }),
        });
        topology.start_router();

        let started = Instant::now();
        topology.subscribe_state_changes(deadline).await?;
        let remaining = deadline.saturating_sub(started.elapsed());
        topology.sync_states(remaining).await?;
        Ok(topology)
    }

    /// Drive the devices matching `path` through one transition and wait
    /// until every selected device settled or the deadline elapsed.
    pub async fn change_state(
        self: &Arc<Self>,
        transition: Transition,
        path: &str,
        deadline: Duration,
    ) -> Result<ChangeStateResult, EngineError> {
        let (selection, op_id, rx) = {
            let mut inner = self.lock();
            let selection = Self::select_active(&inner.tasks, path)?;
            if selection.is_empty() {
                return Ok(ChangeStateResult {
                    aggregated: AggregatedState::Undefined,
                    state: Vec::new(),
                    failed: Vec::new(),
                    failure: None,
                    expected: transition.expected_state(),
                });
            }
            let (tx, rx) = oneshot::channel();
            let op_id = inner.next_op();
            inner
                .change_ops
                .insert(op_id, ChangeStateOp::new(transition, selection.clone(), tx));
            (selection, op_id, rx)
        };
        self.spawn_timeout(OpKind::ChangeState, op_id, deadline);
        tracing::debug!(%transition, tasks = selection.len(), "requesting state change");
        if let Err(err) = self
            .bus
            .publish(&selection, DeviceCommand::ChangeState { transition })
            .await
        {
            self.lock().change_ops.remove(&op_id);
            return Err(err.into());
        }
        let outcome = rx.await.map_err(|_| EngineError::Shutdown)?;

        let inner = self.lock();
        let state = Self::snapshot(&inner.tasks, &selection);
        let aggregated = Self::aggregate_selection(&inner.tasks, &selection);
        Ok(ChangeStateResult {
            aggregated,
            state,
            failed: outcome.failed,
            failure: outcome.failure,
            expected: transition.expected_state(),
        })
    }

    /// Block until the aggregation of `path` matches `target`.
    pub async fn wait_for_state(
        self: &Arc<Self>,
        path: &str,
        target: AggregatedState,
        deadline: Duration,
    ) -> Result<(), EngineError> {
        let (op_id, rx) = {
            let mut inner = self.lock();
            let selection = Self::select(&inner.tasks, path)?;
            if Self::aggregate_selection(&inner.tasks, &selection) == target {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let op_id = inner.next_op();
            inner
                .wait_ops
                .insert(op_id, WaitForStateOp::new(selection, target, tx));
            (op_id, rx)
        };
        self.spawn_timeout(OpKind::WaitForState, op_id, deadline);
        match rx.await.map_err(|_| EngineError::Shutdown)? {
            Ok(()) => Ok(()),
            Err(_) => Err(EngineError::Timeout),
        }
    }

    /// Snapshot of the selection: aggregated state plus per-task report.
    pub fn get_state(&self, path: &str) -> Result<(AggregatedState, TopologyState), EngineError> {
        let inner = self.lock();
        let selection = Self::select(&inner.tasks, path)?;
        let state = Self::snapshot(&inner.tasks, &selection);
        let aggregated = Self::aggregate_selection(&inner.tasks, &selection);
        Ok((aggregated, state))
    }

    /// Query device properties over the selection.
    pub async fn get_properties(
        self: &Arc<Self>,
        path: &str,
        query: &str,
        deadline: Duration,
    ) -> Result<GetPropertiesResult, EngineError> {
        let (selection, request_id, rx) = {
            let mut inner = self.lock();
            let selection = Self::select_active(&inner.tasks, path)?;
            if selection.is_empty() {
                tracing::warn!(path, "get-properties initiated on an empty set of tasks");
                return Ok(GetPropertiesResult::default());
            }
            let (tx, rx) = oneshot::channel();
            let request_id = inner.next_request();
            inner
                .get_prop_ops
                .insert(request_id, GetPropertiesOp::new(selection.clone(), tx));
            (selection, request_id, rx)
        };
        self.spawn_timeout(OpKind::GetProperties, request_id, deadline);
        let cmd = DeviceCommand::GetProperties {
            request_id,
            query: query.to_owned(),
        };
        if let Err(err) = self.bus.publish(&selection, cmd).await {
            self.lock().get_prop_ops.remove(&request_id);
            return Err(err.into());
        }
        rx.await.map_err(|_| EngineError::Shutdown)
    }

    /// Set device properties over the selection.
    pub async fn set_properties(
        self: &Arc<Self>,
        path: &str,
        properties: Vec<(String, String)>,
        deadline: Duration,
    ) -> Result<SetPropertiesResult, EngineError> {
        let (selection, request_id, rx) = {
            let mut inner = self.lock();
            let selection = Self::select_active(&inner.tasks, path)?;
            if selection.is_empty() {
                tracing::warn!(path, "set-properties initiated on an empty set of tasks");
                return Ok(SetPropertiesResult::default());
            }
            let (tx, rx) = oneshot::channel();
            let request_id = inner.next_request();
            inner
                .set_prop_ops
                .insert(request_id, SetPropertiesOp::new(selection.clone(), tx));
            (selection, request_id, rx)
        };
        self.spawn_timeout(OpKind::SetProperties, request_id, deadline);
        let cmd = DeviceCommand::SetProperties {
            request_id,
            properties,
        };
        if let Err(err) = self.bus.publish(&selection, cmd).await {
            self.lock().set_prop_ops.remove(&request_id);
            return Err(err.into());
        }
        rx.await.map_err(|_| EngineError::Shutdown)
    }

    /// Subscribe every non-ignored device to state-change reporting.
    pub async fn subscribe_state_changes(
        self: &Arc<Self>,
        deadline: Duration,
    ) -> Result<(), AttachError> {
        let (selection, op_id, rx) = {
            let mut inner = self.lock();
            let selection: HashSet<TaskId> = inner
                .tasks
                .values()
                .filter(|s| !s.ignored)
                .map(|s| s.task_id)
                .collect();
            if selection.is_empty() {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let op_id = inner.next_op();
            inner
                .subscribe_ops
                .insert(op_id, SubscribeOp::new(selection.clone(), tx));
            (selection, op_id, rx)
        };
        self.spawn_timeout(OpKind::Subscribe, op_id, deadline);
        let cmd = DeviceCommand::SubscribeToStateChange {
            interval_ms: SUBSCRIPTION_INTERVAL_MS,
        };
        if let Err(err) = self.bus.publish(&selection, cmd).await {
            self.lock().subscribe_ops.remove(&op_id);
            return Err(err.into());
        }
        let outcome = rx.await.map_err(|_| AttachError::Shutdown)?;
        match outcome.failure {
            None => Ok(()),
            Some(OpFailure::Timeout) => Err(AttachError::Timeout),
            Some(OpFailure::DeviceFailed) => Err(AttachError::SubscriptionFailed(outcome.failed)),
        }
    }

    /// Drop the state-change subscription on all devices, best-effort.
    pub async fn unsubscribe(&self) {
        let selection: HashSet<TaskId> = {
            let inner = self.lock();
            inner.tasks.keys().copied().collect()
        };
        if selection.is_empty() {
            return;
        }
        if let Err(err) = self
            .bus
            .publish(&selection, DeviceCommand::UnsubscribeFromStateChange)
            .await
        {
            tracing::debug!(%err, "unsubscribe broadcast failed");
        }
    }

    /// Detach from the device set: unsubscribe and stop the reply router.
    /// Outstanding operations complete with [`EngineError::Shutdown`].
    pub async fn detach(&self) {
        self.unsubscribe().await;
        let mut inner = self.lock();
        if let Some(router) = inner.router.take() {
            router.abort();
        }
        inner.change_ops.clear();
        inner.wait_ops.clear();
        inner.check_ops.clear();
        inner.subscribe_ops.clear();
        inner.get_prop_ops.clear();
        inner.set_prop_ops.clear();
    }

    /// Clear the `ignored` bit on every device. Performed by Reset and
    /// Update before the device set is driven again.
    pub fn reset_ignored(&self) {
        let mut inner = self.lock();
        for status in inner.tasks.values_mut() {
            status.ignored = false;
        }
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        let inner = self.lock();
        let mut ids: Vec<TaskId> = inner.tasks.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    // Internal plumbing.

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means a panic elsewhere; the data is a
        // plain status/op table and stays usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_router(self: &Arc<Self>) {
        let mut rx = self.bus.replies();
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(reply) => {
                        let Some(topology) = weak.upgrade() else { break };
                        topology.handle_reply(reply);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "device reply stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.lock().router = Some(handle);
    }

    fn spawn_timeout(self: &Arc<Self>, kind: OpKind, id: u64, deadline: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(topology) = weak.upgrade() {
                topology.on_timeout(kind, id);
            }
        });
    }

    fn on_timeout(&self, kind: OpKind, id: u64) {
        // A completed operation has already been removed from its table;
        // the timer fire is then a no-op.
        let completion: Option<Completion> = {
            let mut inner = self.lock();
            match kind {
                OpKind::ChangeState => inner.change_ops.remove(&id).and_then(|mut op| op.timeout()),
                OpKind::WaitForState => inner.wait_ops.remove(&id).and_then(|mut op| op.timeout()),
                OpKind::CheckState => inner.check_ops.remove(&id).and_then(|mut op| op.timeout()),
                OpKind::Subscribe => inner
                    .subscribe_ops
                    .remove(&id)
                    .and_then(|mut op| op.timeout()),
                OpKind::GetProperties => inner
                    .get_prop_ops
                    .remove(&id)
                    .and_then(|mut op| op.timeout()),
                OpKind::SetProperties => inner
                    .set_prop_ops
                    .remove(&id)
                    .and_then(|mut op| op.timeout()),
            }
        };
        if let Some(complete) = completion {
            complete();
        }
    }

    fn handle_reply(&self, reply: DeviceReply) {
        let mut completions: Vec<Completion> = Vec::new();
        {
            let mut inner = self.lock();
            let inner = &mut *inner;
            match reply {
                DeviceReply::TransitionStatus {
                    task_id,
                    result,
                    transition,
                    current_state,
                    ..
                } => {
                    let expendable = inner
                        .tasks
                        .get(&task_id)
                        .map(|s| s.expendable)
                        .unwrap_or(false);
                    if let Some(status) = inner.tasks.get_mut(&task_id) {
                        status.last_state = status.state;
                        status.state = current_state;
                    }
                    let mut finished = Vec::new();
                    for (id, op) in inner.change_ops.iter_mut() {
                        if op.transition != transition || !op.contains(task_id) {
                            continue;
                        }
                        let ok = result == CmdResult::Ok && current_state == op.expected;
                        let completion = if !ok && expendable {
                            if let Some(status) = inner.tasks.get_mut(&task_id) {
                                tracing::info!(
                                    task_id,
                                    "expendable device failed {transition}, ignoring it"
                                );
                                status.ignored = true;
                            }
                            op.ignore(task_id)
                        } else {
                            op.update(task_id, ok)
                        };
                        if let Some(c) = completion {
                            completions.push(c);
                            finished.push(*id);
                        }
                    }
                    for id in finished {
                        inner.change_ops.remove(&id);
                    }
                    Self::drive_check_ops(&mut inner.check_ops, task_id, &mut completions);
                    Self::drive_wait_ops(&inner.tasks, &mut inner.wait_ops, &mut completions);
                }
                DeviceReply::StateChange {
                    task_id,
                    last_state,
                    current_state,
                    ..
                } => {
                    if let Some(status) = inner.tasks.get_mut(&task_id) {
                        status.last_state = last_state;
                        status.state = current_state;
                    }
                    Self::drive_check_ops(&mut inner.check_ops, task_id, &mut completions);
                    Self::drive_wait_ops(&inner.tasks, &mut inner.wait_ops, &mut completions);
                }
                DeviceReply::StateChangeSubscription {
                    task_id, result, ..
                } => {
                    let ok = result == CmdResult::Ok;
                    if let Some(status) = inner.tasks.get_mut(&task_id) {
                        status.subscribed = ok;
                    }
                    let mut finished = Vec::new();
                    for (id, op) in inner.subscribe_ops.iter_mut() {
                        if let Some(c) = op.update(task_id, ok) {
                            completions.push(c);
                            finished.push(*id);
                        }
                    }
                    for id in finished {
                        inner.subscribe_ops.remove(&id);
                    }
                }
                DeviceReply::StateChangeUnsubscription { task_id, .. } => {
                    if let Some(status) = inner.tasks.get_mut(&task_id) {
                        status.subscribed = false;
                    }
                }
                DeviceReply::Properties {
                    task_id,
                    request_id,
                    result,
                    properties,
                    ..
                } => {
                    let ok = result == CmdResult::Ok;
                    let done = inner
                        .get_prop_ops
                        .get_mut(&request_id)
                        .and_then(|op| op.update(task_id, ok, properties));
                    if let Some(c) = done {
                        completions.push(c);
                        inner.get_prop_ops.remove(&request_id);
                    }
                }
                DeviceReply::PropertiesSet {
                    task_id,
                    request_id,
                    result,
                    ..
                } => {
                    let ok = result == CmdResult::Ok;
                    let done = inner
                        .set_prop_ops
                        .get_mut(&request_id)
                        .and_then(|op| op.update(task_id, ok));
                    if let Some(c) = done {
                        completions.push(c);
                        inner.set_prop_ops.remove(&request_id);
                    }
                }
            }
        }
        for complete in completions {
            complete();
        }
    }

    fn drive_check_ops(
        check_ops: &mut HashMap<u64, CheckStateOp>,
        task_id: TaskId,
        completions: &mut Vec<Completion>,
    ) {
        let mut finished = Vec::new();
        for (id, op) in check_ops.iter_mut() {
            if let Some(c) = op.update(task_id) {
                completions.push(c);
                finished.push(*id);
            }
        }
        for id in finished {
            check_ops.remove(&id);
        }
    }

    fn drive_wait_ops(
        tasks: &HashMap<TaskId, DeviceStatus>,
        wait_ops: &mut HashMap<u64, WaitForStateOp>,
        completions: &mut Vec<Completion>,
    ) {
        let mut finished = Vec::new();
        for (id, op) in wait_ops.iter_mut() {
            let aggregated = Self::aggregate_selection(tasks, &op.selection);
            if let Some(c) = op.complete_if(aggregated) {
                completions.push(c);
                finished.push(*id);
            }
        }
        for id in finished {
            wait_ops.remove(&id);
        }
    }

    async fn sync_states(self: &Arc<Self>, deadline: Duration) -> Result<(), AttachError> {
        let (selection, op_id, rx) = {
            let mut inner = self.lock();
            let selection: HashSet<TaskId> = inner.tasks.keys().copied().collect();
            if selection.is_empty() {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let op_id = inner.next_op();
            inner
                .check_ops
                .insert(op_id, CheckStateOp::new(selection.clone(), tx));
            (selection, op_id, rx)
        };
        self.spawn_timeout(OpKind::CheckState, op_id, deadline);
        if let Err(err) = self
            .bus
            .publish(&selection, DeviceCommand::CheckState)
            .await
        {
            self.lock().check_ops.remove(&op_id);
            return Err(err.into());
        }
        let outcome = rx.await.map_err(|_| AttachError::Shutdown)?;
        match outcome.failure {
            None => Ok(()),
            Some(_) => Err(AttachError::MissingState(outcome.missing)),
        }
    }

    /// Resolve a path to the matching task set. Empty path and `*`
    /// select all tasks; otherwise the path selects every task at or
    /// under that node of the topology tree (an exact task path selects
    /// that single task). The prefix must end on a segment boundary so
    /// `Processors_1` does not also capture `Processors_10`.
    fn select(
        tasks: &HashMap<TaskId, DeviceStatus>,
        path: &str,
    ) -> Result<HashSet<TaskId>, EngineError> {
        if path.is_empty() || path == "*" {
            return Ok(tasks.keys().copied().collect());
        }
        let matches = |s: &str| {
            s.starts_with(path) && (s.len() == path.len() || s.as_bytes()[path.len()] == b'/')
        };
        let matched: HashSet<TaskId> = tasks
            .values()
            .filter(|s| matches(&s.path))
            .map(|s| s.task_id)
            .collect();
        if matched.is_empty() {
            return Err(EngineError::NoMatch(path.to_owned()));
        }
        Ok(matched)
    }

    /// Like [`Self::select`] but drops ignored devices, for fan-out.
    fn select_active(
        tasks: &HashMap<TaskId, DeviceStatus>,
        path: &str,
    ) -> Result<HashSet<TaskId>, EngineError> {
        let mut selection = Self::select(tasks, path)?;
        selection.retain(|id| tasks.get(id).map(|s| !s.ignored).unwrap_or(false));
        Ok(selection)
    }

    fn snapshot(tasks: &HashMap<TaskId, DeviceStatus>, selection: &HashSet<TaskId>) -> TopologyState {
        let mut state: TopologyState = selection
            .iter()
            .filter_map(|id| tasks.get(id))
            .cloned()
            .collect();
        state.sort_by_key(|s| s.task_id);
        state
    }

    fn aggregate_selection(
        tasks: &HashMap<TaskId, DeviceStatus>,
        selection: &HashSet<TaskId>,
    ) -> AggregatedState {
        aggregate_states(
            selection
                .iter()
                .filter_map(|id| tasks.get(id))
                .filter(|s| !s.ignored)
                .map(|s| s.state),
        )
    }
}

impl Drop for Topology {
    fn drop(&mut self) {
        if let Some(router) = self.lock().router.take() {
            router.abort();
        }
    }
}
