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

//! Topology engine tests against a scripted in-memory command bus.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use conductor_topology::{
    AggregatedState, BusError, CmdResult, CommandBus, DeviceCommand, DeviceReply, DeviceState,
    EngineError, OpFailure, TaskDescriptor, TaskId, Topology, Transition,
};

const DEADLINE: Duration = Duration::from_secs(10);

/// Scripted stand-in for a session's device-command transport.
struct ScriptedBus {
    replies: broadcast::Sender<DeviceReply>,
    devices: Mutex<HashMap<TaskId, DeviceSim>>,
}

#[derive(Clone, Default)]
struct DeviceSim {
    device_id: String,
    state: DeviceState,
    properties: HashMap<String, String>,
    /// Reply `Failure` (and go to ERROR) on this transition.
    fail_on: Option<Transition>,
    /// Reply `Ok` but stay in the current state on this transition.
    stuck_on: Option<Transition>,
    /// Do not reply at all on this transition.
    silent_on: Option<Transition>,
    fail_properties: bool,
}

impl ScriptedBus {
    fn new(devices: HashMap<TaskId, DeviceSim>) -> Arc<Self> {
        let (replies, _) = broadcast::channel(1024);
        Arc::new(Self {
            replies,
            devices: Mutex::new(devices),
        })
    }

    fn send(&self, reply: DeviceReply) {
        let _ = self.replies.send(reply);
    }

    fn handle(&self, task_id: TaskId, cmd: &DeviceCommand) {
        let mut devices = self.devices.lock().unwrap();
        let Some(device) = devices.get_mut(&task_id) else {
            return;
        };
        let device_id = device.device_id.clone();
        match cmd {
            DeviceCommand::CheckState => {
                self.send(DeviceReply::StateChange {
                    device_id,
                    task_id,
                    last_state: device.state,
                    current_state: device.state,
                });
            }
            DeviceCommand::ChangeState { transition } => {
                if device.silent_on == Some(*transition) {
                    return;
                }
                let last = device.state;
                let (result, state) = if device.fail_on == Some(*transition) {
                    (CmdResult::Failure, DeviceState::Error)
                } else if device.stuck_on == Some(*transition) {
                    (CmdResult::Ok, device.state)
                } else {
                    (CmdResult::Ok, transition.expected_state())
                };
                device.state = state;
                self.send(DeviceReply::TransitionStatus {
                    device_id: device_id.clone(),
                    task_id,
                    result,
                    transition: *transition,
                    current_state: state,
                });
                if state != last {
                    self.send(DeviceReply::StateChange {
                        device_id,
                        task_id,
                        last_state: last,
                        current_state: state,
                    });
                }
            }
            DeviceCommand::SubscribeToStateChange { .. } => {
                self.send(DeviceReply::StateChangeSubscription {
                    device_id,
                    task_id,
                    result: CmdResult::Ok,
                });
            }
            DeviceCommand::UnsubscribeFromStateChange => {
                self.send(DeviceReply::StateChangeUnsubscription {
                    device_id,
                    task_id,
                    result: CmdResult::Ok,
                });
            }
            DeviceCommand::GetProperties { request_id, query } => {
                let result = if device.fail_properties {
                    CmdResult::Failure
                } else {
                    CmdResult::Ok
                };
                let properties: Vec<(String, String)> = device
                    .properties
                    .iter()
                    .filter(|(k, _)| query.is_empty() || k.starts_with(query.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                self.send(DeviceReply::Properties {
                    device_id,
                    task_id,
                    request_id: *request_id,
                    result,
                    properties,
                });
            }
            DeviceCommand::SetProperties {
                request_id,
                properties,
            } => {
                let result = if device.fail_properties {
                    CmdResult::Failure
                } else {
                    for (k, v) in properties {
                        device.properties.insert(k.clone(), v.clone());
                    }
                    CmdResult::Ok
                };
                self.send(DeviceReply::PropertiesSet {
                    device_id,
                    task_id,
                    request_id: *request_id,
                    result,
                });
            }
        }
    }
}

#[async_trait]
impl CommandBus for ScriptedBus {
    async fn publish(
        &self,
        targets: &HashSet<TaskId>,
        cmd: DeviceCommand,
    ) -> Result<(), BusError> {
        let mut ordered: Vec<TaskId> = targets.iter().copied().collect();
        ordered.sort_unstable();
        for task_id in ordered {
            self.handle(task_id, &cmd);
        }
        Ok(())
    }

    fn replies(&self) -> broadcast::Receiver<DeviceReply> {
        self.replies.subscribe()
    }
}

fn device(name: &str) -> DeviceSim {
    DeviceSim {
        device_id: name.to_owned(),
        state: DeviceState::Idle,
        ..DeviceSim::default()
    }
}

/// Two collections ("Samplers" with one task, "Processors" with two) plus
/// descriptors matching the scripted devices.
fn fixture() -> (HashMap<TaskId, DeviceSim>, Vec<TaskDescriptor>) {
    let devices = HashMap::from([
        (1, device("sampler-0")),
        (2, device("processor-0")),
        (3, device("processor-1")),
    ]);
    let descriptors = vec![
        TaskDescriptor {
            id: 1,
            path: "main/Samplers_0/sampler_0".into(),
            collection_id: Some(100),
            expendable: false,
        },
        TaskDescriptor {
            id: 2,
            path: "main/Processors_0/processor_0".into(),
            collection_id: Some(101),
            expendable: false,
        },
        TaskDescriptor {
            id: 3,
            path: "main/Processors_0/processor_1".into(),
            collection_id: Some(101),
            expendable: false,
        },
    ];
    (devices, descriptors)
}

async fn attach(
    devices: HashMap<TaskId, DeviceSim>,
    descriptors: Vec<TaskDescriptor>,
) -> (Arc<ScriptedBus>, Arc<Topology>) {
    let bus = ScriptedBus::new(devices);
    let topology = Topology::attach(bus.clone(), descriptors, DEADLINE)
        .await
        .expect("attach failed");
    (bus, topology)
}

#[tokio::test]
async fn attach_synchronizes_initial_states() {
    let (devices, descriptors) = fixture();
    let (_bus, topology) = attach(devices, descriptors).await;

    let (aggregated, state) = topology.get_state("").unwrap();
    assert_eq!(aggregated, AggregatedState::Idle);
    assert_eq!(state.len(), 3);
    assert!(state.iter().all(|s| s.subscribed));
}

#[tokio::test]
async fn configure_chain_reaches_ready() {
    let (devices, descriptors) = fixture();
    let (_bus, topology) = attach(devices, descriptors).await;

    for transition in [
        Transition::InitDevice,
        Transition::CompleteInit,
        Transition::Bind,
        Transition::Connect,
        Transition::InitTask,
    ] {
        let result = topology.change_state(transition, "", DEADLINE).await.unwrap();
        assert!(result.is_ok(), "transition {transition} failed");
        assert_eq!(result.aggregated, AggregatedState::from(transition.expected_state()));
    }
    let (aggregated, _) = topology.get_state("").unwrap();
    assert_eq!(aggregated, AggregatedState::Ready);
}

#[tokio::test]
async fn partial_selection_produces_mixed_aggregate() {
    let (devices, descriptors) = fixture();
    let (_bus, topology) = attach(devices, descriptors).await;

    let result = topology
        .change_state(Transition::InitDevice, "main/Processors_0", DEADLINE)
        .await
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(result.state.len(), 2);

    let (aggregated, _) = topology.get_state("").unwrap();
    assert_eq!(aggregated, AggregatedState::Mixed);
    // The untouched collection still aggregates cleanly.
    let (aggregated, state) = topology.get_state("main/Samplers_0").unwrap();
    assert_eq!(aggregated, AggregatedState::Idle);
    assert_eq!(state.len(), 1);
}

#[tokio::test]
async fn exact_path_selects_a_single_task() {
    let (devices, descriptors) = fixture();
    let (_bus, topology) = attach(devices, descriptors).await;

    let (_, state) = topology.get_state("main/Processors_0/processor_1").unwrap();
    assert_eq!(state.len(), 1);
    assert_eq!(state[0].task_id, 3);

    assert!(matches!(
        topology.get_state("main/NoSuchCollection"),
        Err(EngineError::NoMatch(_))
    ));
}

#[tokio::test]
async fn instance_selection_stops_at_segment_boundaries() {
    // Eleven-plus instances produce sibling paths where one name is a
    // string prefix of another (`Processors_1` vs `Processors_10`).
    let mut devices = HashMap::new();
    let mut descriptors = Vec::new();
    for (task_id, instance) in [(1, 1), (2, 1), (3, 10), (4, 10)] {
        let j = (task_id - 1) % 2;
        devices.insert(task_id, device(&format!("processor-{instance}-{j}")));
        descriptors.push(TaskDescriptor {
            id: task_id,
            path: format!("main/online/Processors_{instance}/processor_{j}"),
            collection_id: Some(100 + instance),
            expendable: false,
        });
    }
    let (_bus, topology) = attach(devices, descriptors).await;

    let (_, state) = topology.get_state("main/online/Processors_1").unwrap();
    let selected: Vec<TaskId> = state.iter().map(|s| s.task_id).collect();
    assert_eq!(selected, vec![1, 2]);

    let result = topology
        .change_state(Transition::InitDevice, "main/online/Processors_1", DEADLINE)
        .await
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(result.state.len(), 2);

    // The decimal sibling was left untouched.
    let (aggregated, state) = topology.get_state("main/online/Processors_10").unwrap();
    assert_eq!(aggregated, AggregatedState::Idle);
    assert_eq!(state.len(), 2);
}

#[tokio::test]
async fn failed_device_is_recorded_and_reported() {
    let (mut devices, descriptors) = fixture();
    devices.get_mut(&2).unwrap().fail_on = Some(Transition::InitDevice);
    let (_bus, topology) = attach(devices, descriptors).await;

    let result = topology
        .change_state(Transition::InitDevice, "", DEADLINE)
        .await
        .unwrap();
    assert_eq!(result.failure, Some(OpFailure::DeviceFailed));
    assert_eq!(result.failed, vec![2]);
    assert_eq!(result.aggregated, AggregatedState::Mixed);
    let failed = result.state.iter().find(|s| s.task_id == 2).unwrap();
    assert_eq!(failed.state, DeviceState::Error);
}

#[tokio::test]
async fn settling_in_the_wrong_state_counts_as_failure() {
    let (mut devices, descriptors) = fixture();
    devices.get_mut(&3).unwrap().stuck_on = Some(Transition::InitDevice);
    let (_bus, topology) = attach(devices, descriptors).await;

    let result = topology
        .change_state(Transition::InitDevice, "", DEADLINE)
        .await
        .unwrap();
    assert_eq!(result.failure, Some(OpFailure::DeviceFailed));
    assert_eq!(result.failed, vec![3]);
}

#[tokio::test]
async fn expendable_failure_is_ignored_not_failed() {
    let (mut devices, mut descriptors) = fixture();
    devices.get_mut(&3).unwrap().fail_on = Some(Transition::InitDevice);
    descriptors[2].expendable = true;
    let (_bus, topology) = attach(devices, descriptors).await;

    let result = topology
        .change_state(Transition::InitDevice, "", DEADLINE)
        .await
        .unwrap();
    assert!(result.is_ok(), "expendable failure must not fail the operation");
    assert_eq!(result.aggregated, AggregatedState::InitializingDevice);

    let (aggregated, state) = topology.get_state("").unwrap();
    assert_eq!(aggregated, AggregatedState::InitializingDevice);
    assert!(state.iter().find(|s| s.task_id == 3).unwrap().ignored);

    // Ignored devices are excluded from subsequent fan-outs.
    let result = topology
        .change_state(Transition::CompleteInit, "", DEADLINE)
        .await
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(result.state.len(), 2);

    // Until the ignored bit is cleared again.
    topology.reset_ignored();
    let (aggregated, _) = topology.get_state("").unwrap();
    assert_eq!(aggregated, AggregatedState::Mixed);
}

#[tokio::test(start_paused = true)]
async fn deadline_fails_all_pending_tasks() {
    let (mut devices, descriptors) = fixture();
    devices.get_mut(&1).unwrap().silent_on = Some(Transition::InitDevice);
    let (_bus, topology) = attach(devices, descriptors).await;

    let result = topology
        .change_state(Transition::InitDevice, "", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(result.failure, Some(OpFailure::Timeout));
    assert_eq!(result.failed, vec![1]);
}

#[tokio::test(start_paused = true)]
async fn late_replies_are_discarded_silently() {
    let (mut devices, descriptors) = fixture();
    devices.get_mut(&1).unwrap().silent_on = Some(Transition::InitDevice);
    let (bus, topology) = attach(devices, descriptors).await;

    let result = topology
        .change_state(Transition::InitDevice, "", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(result.failure, Some(OpFailure::Timeout));

    // The straggler answers after the operation completed.
    bus.send(DeviceReply::TransitionStatus {
        device_id: "sampler-0".into(),
        task_id: 1,
        result: CmdResult::Ok,
        transition: Transition::InitDevice,
        current_state: DeviceState::InitializingDevice,
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Only the status map picked the report up; no operation fired.
    let (aggregated, _) = topology.get_state("").unwrap();
    assert_eq!(aggregated, AggregatedState::InitializingDevice);
}

#[tokio::test(start_paused = true)]
async fn wait_for_state_completes_on_events() {
    let (devices, descriptors) = fixture();
    let (bus, topology) = attach(devices, descriptors).await;

    let waiter = {
        let topology = topology.clone();
        tokio::spawn(async move {
            topology
                .wait_for_state("", AggregatedState::Ready, Duration::from_secs(30))
                .await
        })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    for task_id in [1, 2, 3] {
        bus.send(DeviceReply::StateChange {
            device_id: format!("dev-{task_id}"),
            task_id,
            last_state: DeviceState::DeviceReady,
            current_state: DeviceState::Ready,
        });
    }
    waiter.await.unwrap().expect("wait_for_state failed");
}

#[tokio::test(start_paused = true)]
async fn wait_for_state_times_out() {
    let (devices, descriptors) = fixture();
    let (_bus, topology) = attach(devices, descriptors).await;

    let err = topology
        .wait_for_state("", AggregatedState::Running, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Timeout));
}

#[tokio::test]
async fn property_round_trip_returns_values_just_set() {
    let (devices, descriptors) = fixture();
    let (_bus, topology) = attach(devices, descriptors).await;

    let set = topology
        .set_properties(
            "",
            vec![("output-rate".into(), "25".into())],
            DEADLINE,
        )
        .await
        .unwrap();
    assert!(set.failure.is_none());

    let got = topology
        .get_properties("", "output-rate", DEADLINE)
        .await
        .unwrap();
    assert!(got.failure.is_none());
    assert_eq!(got.devices.len(), 3);
    for properties in got.devices.values() {
        assert_eq!(properties, &vec![("output-rate".into(), "25".into())]);
    }
}

#[tokio::test]
async fn failed_property_updates_are_attributed() {
    let (mut devices, descriptors) = fixture();
    devices.get_mut(&2).unwrap().fail_properties = true;
    let (_bus, topology) = attach(devices, descriptors).await;

    let set = topology
        .set_properties("", vec![("k".into(), "v".into())], DEADLINE)
        .await
        .unwrap();
    assert_eq!(set.failure, Some(OpFailure::DeviceFailed));
    assert_eq!(set.failed, vec![2]);
}
