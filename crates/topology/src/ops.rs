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

//! Collective operation records
//!
//! Every outstanding collective operation is an in-memory record with a
//! pending task set, a results accumulator and a completion sender. Three
//! methods advance a record: `update` (a task delivered its result),
//! `ignore` (a task was dropped without a result) and `try_complete`
//! (fires the completion once the pending set drains). When the deadline
//! timer fires, all still-pending tasks are synthetically failed and the
//! record completes with `Timeout`.
//!
//! All records are mutated under the engine mutex; the returned
//! [`Completion`] closures are fired after the mutex is released.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tokio::sync::oneshot;

use crate::state::{AggregatedState, DeviceState, Transition};
use crate::TaskId;

/// Why a collective operation did not complete cleanly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OpFailure {
    #[error("operation timed out")]
    Timeout,
    #[error("one or more devices failed")]
    DeviceFailed,
}

/// Deferred completion callback, run outside the engine mutex.
pub(crate) type Completion = Box<dyn FnOnce() + Send>;

/// Outcome of a collective state change.
#[derive(Debug)]
pub(crate) struct ChangeOutcome {
    pub failed: Vec<TaskId>,
    pub failure: Option<OpFailure>,
}

/// Drives a set of devices through one transition.
pub(crate) struct ChangeStateOp {
    pub transition: Transition,
    pub expected: DeviceState,
    pending: HashSet<TaskId>,
    failed: BTreeSet<TaskId>,
    done: Option<oneshot::Sender<ChangeOutcome>>,
}

impl ChangeStateOp {
    pub fn new(
        transition: Transition,
        pending: HashSet<TaskId>,
        done: oneshot::Sender<ChangeOutcome>,
    ) -> Self {
        Self {
            transition,
            expected: transition.expected_state(),
            pending,
            failed: BTreeSet::new(),
            done: Some(done),
        }
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.pending.contains(&task_id)
    }

    pub fn update(&mut self, task_id: TaskId, ok: bool) -> Option<Completion> {
        if !self.pending.remove(&task_id) {
            return None;
        }
        if !ok {
            self.failed.insert(task_id);
        }
        self.try_complete()
    }

    pub fn ignore(&mut self, task_id: TaskId) -> Option<Completion> {
        self.pending.remove(&task_id);
        self.try_complete()
    }

    pub fn timeout(&mut self) -> Option<Completion> {
        self.failed.extend(self.pending.drain());
        self.finish(Some(OpFailure::Timeout))
    }

    fn try_complete(&mut self) -> Option<Completion> {
        if !self.pending.is_empty() {
            return None;
        }
        let failure = (!self.failed.is_empty()).then_some(OpFailure::DeviceFailed);
        self.finish(failure)
    }

    fn finish(&mut self, failure: Option<OpFailure>) -> Option<Completion> {
        let done = self.done.take()?;
        let outcome = ChangeOutcome {
            failed: self.failed.iter().copied().collect(),
            failure,
        };
        Some(Box::new(move || {
            let _ = done.send(outcome);
        }))
    }
}

/// Blocks until the aggregation of a selection matches a target state.
pub(crate) struct WaitForStateOp {
    pub selection: HashSet<TaskId>,
    pub target: AggregatedState,
    done: Option<oneshot::Sender<Result<(), OpFailure>>>,
}

impl WaitForStateOp {
    pub fn new(
        selection: HashSet<TaskId>,
        target: AggregatedState,
        done: oneshot::Sender<Result<(), OpFailure>>,
    ) -> Self {
        Self {
            selection,
            target,
            done: Some(done),
        }
    }

    pub fn complete_if(&mut self, aggregated: AggregatedState) -> Option<Completion> {
        if aggregated != self.target {
            return None;
        }
        let done = self.done.take()?;
        Some(Box::new(move || {
            let _ = done.send(Ok(()));
        }))
    }

    pub fn timeout(&mut self) -> Option<Completion> {
        let done = self.done.take()?;
        Some(Box::new(move || {
            let _ = done.send(Err(OpFailure::Timeout));
        }))
    }
}

/// Outcome of the initial state synchronization after attach.
#[derive(Debug)]
pub(crate) struct CheckOutcome {
    pub missing: Vec<TaskId>,
    pub failure: Option<OpFailure>,
}

/// Waits until every task of the selection reported a state.
pub(crate) struct CheckStateOp {
    pending: HashSet<TaskId>,
    done: Option<oneshot::Sender<CheckOutcome>>,
}

impl CheckStateOp {
    pub fn new(pending: HashSet<TaskId>, done: oneshot::Sender<CheckOutcome>) -> Self {
        Self {
            pending,
            done: Some(done),
        }
    }

    pub fn update(&mut self, task_id: TaskId) -> Option<Completion> {
        self.pending.remove(&task_id);
        if !self.pending.is_empty() {
            return None;
        }
        let done = self.done.take()?;
        Some(Box::new(move || {
            let _ = done.send(CheckOutcome {
                missing: Vec::new(),
                failure: None,
            });
        }))
    }

    pub fn timeout(&mut self) -> Option<Completion> {
        let done = self.done.take()?;
        let missing = self.pending.drain().collect();
        Some(Box::new(move || {
            let _ = done.send(CheckOutcome {
                missing,
                failure: Some(OpFailure::Timeout),
            });
        }))
    }
}

/// Outcome of a collective subscription request.
#[derive(Debug)]
pub(crate) struct SubscribeOutcome {
    pub failed: Vec<TaskId>,
    pub failure: Option<OpFailure>,
}

/// Waits for every task to acknowledge a state-change subscription.
pub(crate) struct SubscribeOp {
    pending: HashSet<TaskId>,
    failed: BTreeSet<TaskId>,
    done: Option<oneshot::Sender<SubscribeOutcome>>,
}

impl SubscribeOp {
    pub fn new(pending: HashSet<TaskId>, done: oneshot::Sender<SubscribeOutcome>) -> Self {
        Self {
            pending,
            failed: BTreeSet::new(),
            done: Some(done),
        }
    }

    pub fn update(&mut self, task_id: TaskId, ok: bool) -> Option<Completion> {
        if !self.pending.remove(&task_id) {
            return None;
        }
        if !ok {
            self.failed.insert(task_id);
        }
        self.try_complete()
    }

    pub fn timeout(&mut self) -> Option<Completion> {
        self.failed.extend(self.pending.drain());
        self.finish(Some(OpFailure::Timeout))
    }

    fn try_complete(&mut self) -> Option<Completion> {
        if !self.pending.is_empty() {
            return None;
        }
        let failure = (!self.failed.is_empty()).then_some(OpFailure::DeviceFailed);
        self.finish(failure)
    }

    fn finish(&mut self, failure: Option<OpFailure>) -> Option<Completion> {
        let done = self.done.take()?;
        let outcome = SubscribeOutcome {
            failed: self.failed.iter().copied().collect(),
            failure,
        };
        Some(Box::new(move || {
            let _ = done.send(outcome);
        }))
    }
}

/// Per-device property query result.
#[derive(Debug, Default)]
pub struct GetPropertiesResult {
    pub devices: BTreeMap<TaskId, Vec<(String, String)>>,
    pub failed: Vec<TaskId>,
    pub failure: Option<OpFailure>,
}

pub(crate) struct GetPropertiesOp {
    pending: HashSet<TaskId>,
    failed: BTreeSet<TaskId>,
    devices: BTreeMap<TaskId, Vec<(String, String)>>,
    done: Option<oneshot::Sender<GetPropertiesResult>>,
}

impl GetPropertiesOp {
    pub fn new(pending: HashSet<TaskId>, done: oneshot::Sender<GetPropertiesResult>) -> Self {
        Self {
            pending,
            failed: BTreeSet::new(),
            devices: BTreeMap::new(),
            done: Some(done),
        }
    }

    pub fn update(
        &mut self,
        task_id: TaskId,
        ok: bool,
        properties: Vec<(String, String)>,
    ) -> Option<Completion> {
        if !self.pending.remove(&task_id) {
            return None;
        }
        if ok {
            self.devices.insert(task_id, properties);
        } else {
            self.failed.insert(task_id);
        }
        self.try_complete()
    }

    pub fn ignore(&mut self, task_id: TaskId) -> Option<Completion> {
        self.pending.remove(&task_id);
        self.try_complete()
    }

    pub fn timeout(&mut self) -> Option<Completion> {
        self.failed.extend(self.pending.drain());
        self.finish(Some(OpFailure::Timeout))
    }

    fn try_complete(&mut self) -> Option<Completion> {
        if !self.pending.is_empty() {
            return None;
        }
        let failure = (!self.failed.is_empty()).then_some(OpFailure::DeviceFailed);
        self.finish(failure)
    }

    fn finish(&mut self, failure: Option<OpFailure>) -> Option<Completion> {
        let done = self.done.take()?;
        let result = GetPropertiesResult {
            devices: std::mem::take(&mut self.devices),
            failed: self.failed.iter().copied().collect(),
            failure,
        };
        Some(Box::new(move || {
            let _ = done.send(result);
        }))
    }
}

/// Result of a collective property update.
#[derive(Debug, Default)]
pub struct SetPropertiesResult {
    pub failed: Vec<TaskId>,
    pub failure: Option<OpFailure>,
}

pub(crate) struct SetPropertiesOp {
    pending: HashSet<TaskId>,
    failed: BTreeSet<TaskId>,
    done: Option<oneshot::Sender<SetPropertiesResult>>,
}

impl SetPropertiesOp {
    pub fn new(pending: HashSet<TaskId>, done: oneshot::Sender<SetPropertiesResult>) -> Self {
        Self {
            pending,
            failed: BTreeSet::new(),
            done: Some(done),
        }
    }

    pub fn update(&mut self, task_id: TaskId, ok: bool) -> Option<Completion> {
        if !self.pending.remove(&task_id) {
            return None;
        }
        if !ok {
            self.failed.insert(task_id);
        }
        self.try_complete()
    }

    pub fn ignore(&mut self, task_id: TaskId) -> Option<Completion> {
        self.pending.remove(&task_id);
        self.try_complete()
    }

    pub fn timeout(&mut self) -> Option<Completion> {
        self.failed.extend(self.pending.drain());
        self.finish(Some(OpFailure::Timeout))
    }

    fn try_complete(&mut self) -> Option<Completion> {
        if !self.pending.is_empty() {
            return None;
        }
        let failure = (!self.failed.is_empty()).then_some(OpFailure::DeviceFailed);
        self.finish(failure)
    }

    fn finish(&mut self, failure: Option<OpFailure>) -> Option<Completion> {
        let done = self.done.take()?;
        let result = SetPropertiesResult {
            failed: self.failed.iter().copied().collect(),
            failure,
        };
        Some(Box::new(move || {
            let _ = done.send(result);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(completion: Option<Completion>) -> bool {
        match completion {
            Some(f) => {
                f();
                true
            }
            None => false,
        }
    }

    #[tokio::test]
    async fn change_state_completes_when_pending_drains() {
        let (tx, rx) = oneshot::channel();
        let mut op = ChangeStateOp::new(Transition::Run, HashSet::from([1, 2]), tx);
        assert!(!run(op.update(1, true)));
        // Unknown task: no effect.
        assert!(!run(op.update(99, true)));
        assert!(run(op.update(2, true)));
        let outcome = rx.await.unwrap();
        assert!(outcome.failure.is_none());
        assert!(outcome.failed.is_empty());
    }

    #[tokio::test]
    async fn change_state_reports_failed_tasks() {
        let (tx, rx) = oneshot::channel();
        let mut op = ChangeStateOp::new(Transition::Bind, HashSet::from([1, 2]), tx);
        assert!(!run(op.update(2, false)));
        assert!(run(op.update(1, true)));
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.failure, Some(OpFailure::DeviceFailed));
        assert_eq!(outcome.failed, vec![2]);
    }

    #[tokio::test]
    async fn ignored_task_does_not_count_as_failed() {
        let (tx, rx) = oneshot::channel();
        let mut op = ChangeStateOp::new(Transition::Bind, HashSet::from([1, 2]), tx);
        assert!(!run(op.ignore(2)));
        assert!(run(op.update(1, true)));
        let outcome = rx.await.unwrap();
        assert!(outcome.failure.is_none());
    }

    #[tokio::test]
    async fn timeout_fails_all_pending_tasks() {
        let (tx, rx) = oneshot::channel();
        let mut op = ChangeStateOp::new(Transition::Run, HashSet::from([1, 2, 3]), tx);
        assert!(!run(op.update(1, true)));
        assert!(run(op.timeout()));
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.failure, Some(OpFailure::Timeout));
        assert_eq!(outcome.failed, vec![2, 3]);
        // A late completion attempt is a no-op.
        assert!(op.update(2, true).is_none());
    }

    #[tokio::test]
    async fn get_properties_accumulates_per_device() {
        let (tx, rx) = oneshot::channel();
        let mut op = GetPropertiesOp::new(HashSet::from([1, 2]), tx);
        assert!(!run(op.update(1, true, vec![("k".into(), "v".into())])));
        assert!(run(op.update(2, false, Vec::new())));
        let result = rx.await.unwrap();
        assert_eq!(result.failure, Some(OpFailure::DeviceFailed));
        assert_eq!(result.devices.len(), 1);
        assert_eq!(result.failed, vec![2]);
    }
}
