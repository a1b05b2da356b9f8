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

//! Local in-process deployment backend
//!
//! An in-memory substrate with simulated workers and devices. Each task
//! instance runs as a spawned device loop that speaks the full
//! device-command protocol; collections are co-placed on a single worker
//! so worker shutdown takes a whole collection down, exactly as the nMin
//! recovery path expects. Latencies and transition crashes are
//! configurable, which makes the backend double as the development mode
//! behind the CLI and as the deployment stub of the integration tests.
//!
//! A task whose `exe` carries a `--crash-on=<Transition>` marker fails
//! that transition and settles in ERROR; an additional
//! `--crash-path=<substring>` marker restricts the failure to instances
//! whose runtime path contains the substring.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use ulid::Ulid;

use conductor_topology::{
    BusError, CmdResult, CollectionId, CommandBus, DeviceCommand, DeviceReply, DeviceState, TaskId,
    Transition,
};

use super::{
    ActivationMode, CommanderInfo, DeployError, DeployEvent, Deployment, DeploymentSession,
    Severity, TaskDoneEvent, TaskRuntime, WorkerBatch, WorkerId, WorkerInfo,
};
use crate::topo_desc::{TaskInstance, TopologyDesc};

const CRASH_MARKER: &str = "--crash-on=";
const CRASH_PATH_MARKER: &str = "--crash-path=";

/// Injected latencies of the simulated substrate.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalConfig {
    pub submit_delay: Duration,
    pub activation_delay: Duration,
    pub transition_delay: Duration,
}

/// In-process deployment service; sessions survive detach and can be
/// re-attached by id until they are shut down.
pub struct LocalDeployment {
    config: LocalConfig,
    sessions: Mutex<HashMap<String, Arc<LocalSession>>>,
}

impl LocalDeployment {
    pub fn new(config: LocalConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl Deployment for LocalDeployment {
    async fn create_session(&self) -> Result<Arc<dyn DeploymentSession>, DeployError> {
        let session = LocalSession::new(self.config);
        lock(&self.sessions).insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn attach_session(
        &self,
        session_id: &str,
    ) -> Result<Arc<dyn DeploymentSession>, DeployError> {
        let session = lock(&self.sessions)
            .get(session_id)
            .cloned()
            .ok_or_else(|| DeployError::SessionNotFound(session_id.to_owned()))?;
        if !session.is_running() {
            return Err(DeployError::NotRunning);
        }
        Ok(session)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct LocalWorker {
    info: WorkerInfo,
    used_slots: u32,
}

struct LocalTask {
    runtime: TaskRuntime,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SessionState {
    workers: BTreeMap<WorkerId, LocalWorker>,
    tasks: BTreeMap<TaskId, LocalTask>,
    collection_ids: HashMap<String, CollectionId>,
    active_topology: Option<PathBuf>,
    next_worker: WorkerId,
    next_task: TaskId,
    next_collection: CollectionId,
}

pub struct LocalSession {
    id: String,
    config: LocalConfig,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<SessionState>>,
    bus: Arc<LocalBus>,
    task_done: broadcast::Sender<TaskDoneEvent>,
}

impl LocalSession {
    fn new(config: LocalConfig) -> Arc<Self> {
        let (task_done, _) = broadcast::channel(256);
        Arc::new(Self {
            id: Ulid::new().to_string(),
            config,
            running: Arc::new(AtomicBool::new(true)),
            state: Arc::new(Mutex::new(SessionState::default())),
            bus: LocalBus::new(),
            task_done,
        })
    }

    fn ensure_running(&self) -> Result<(), DeployError> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DeployError::NotRunning)
        }
    }
}

#[async_trait]
impl DeploymentSession for LocalSession {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) -> Result<(), DeployError> {
        self.running.store(false, Ordering::SeqCst);
        let mut state = lock(&self.state);
        for (_, task) in std::mem::take(&mut state.tasks) {
            task.handle.abort();
        }
        state.workers.clear();
        state.collection_ids.clear();
        state.active_topology = None;
        self.bus.clear();
        Ok(())
    }

    async fn submit_workers(
        &self,
        batch: WorkerBatch,
    ) -> Result<mpsc::UnboundedReceiver<DeployEvent>, DeployError> {
        self.ensure_running()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let state = self.state.clone();
        let delay = self.config.submit_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = lock(&state);
                for _ in 0..batch.n {
                    state.next_worker += 1;
                    let id = state.next_worker;
                    state.workers.insert(
                        id,
                        LocalWorker {
                            info: WorkerInfo {
                                id,
                                host: format!("node{id:03}"),
                                slots: batch.slots,
                                agent_group: batch.agent_group.clone(),
                                zone: batch.zone.clone(),
                            },
                            used_slots: 0,
                        },
                    );
                }
            }
            let _ = tx.send(DeployEvent::Message {
                severity: Severity::Info,
                text: format!(
                    "submitted {} worker(s) with {} slot(s) each (group {:?})",
                    batch.n, batch.slots, batch.agent_group
                ),
            });
            let _ = tx.send(DeployEvent::Done);
        });
        Ok(rx)
    }

    async fn activate_topology(
        &self,
        file: &Path,
        mode: ActivationMode,
    ) -> Result<mpsc::UnboundedReceiver<DeployEvent>, DeployError> {
        self.ensure_running()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let file = file.to_path_buf();
        let state = self.state.clone();
        let bus = self.bus.clone();
        let task_done = self.task_done.clone();
        let config = self.config;
        tokio::spawn(async move {
            tokio::time::sleep(config.activation_delay).await;
            let desc = match TopologyDesc::load(&file) {
                Ok(desc) => desc,
                Err(err) => {
                    let _ = tx.send(DeployEvent::Message {
                        severity: Severity::Error,
                        text: format!("invalid topology description: {err}"),
                    });
                    let _ = tx.send(DeployEvent::Done);
                    return;
                }
            };
            let instances = match desc.instances() {
                Ok(instances) => instances,
                Err(err) => {
                    let _ = tx.send(DeployEvent::Message {
                        severity: Severity::Error,
                        text: format!("inconsistent topology description: {err}"),
                    });
                    let _ = tx.send(DeployEvent::Done);
                    return;
                }
            };
            activate(
                &state, &bus, &task_done, &config, &file, mode, instances, &tx,
            );
        });
        Ok(rx)
    }

    async fn commander_info(&self) -> Result<CommanderInfo, DeployError> {
        self.ensure_running()?;
        Ok(CommanderInfo {
            active_topology_file: lock(&self.state).active_topology.clone(),
        })
    }

    async fn list_workers(&self) -> Result<Vec<WorkerInfo>, DeployError> {
        self.ensure_running()?;
        Ok(lock(&self.state)
            .workers
            .values()
            .map(|w| w.info.clone())
            .collect())
    }

    async fn list_tasks(&self) -> Result<Vec<TaskRuntime>, DeployError> {
        self.ensure_running()?;
        Ok(lock(&self.state)
            .tasks
            .values()
            .map(|t| t.runtime.clone())
            .collect())
    }

    async fn shutdown_worker(&self, worker: WorkerId) -> Result<(), DeployError> {
        self.ensure_running()?;
        let mut state = lock(&self.state);
        state.workers.remove(&worker);
        let dead: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| t.runtime.worker_id == worker)
            .map(|t| t.runtime.task_id)
            .collect();
        for task_id in dead {
            if let Some(task) = state.tasks.remove(&task_id) {
                task.handle.abort();
                self.bus.remove(task_id);
                let _ = self.task_done.send(TaskDoneEvent {
                    task_id,
                    path: task.runtime.path.clone(),
                    exit_code: 137,
                    host: task.runtime.host.clone(),
                });
            }
        }
        Ok(())
    }

    fn subscribe_task_done(&self) -> broadcast::Receiver<TaskDoneEvent> {
        self.task_done.subscribe()
    }

    fn command_bus(&self) -> Arc<dyn CommandBus> {
        self.bus.clone()
    }
}

/// Place the expanded instances on workers and start device loops.
#[allow(clippy::too_many_arguments)]
fn activate(
    state: &Arc<Mutex<SessionState>>,
    bus: &Arc<LocalBus>,
    task_done: &broadcast::Sender<TaskDoneEvent>,
    config: &LocalConfig,
    file: &Path,
    mode: ActivationMode,
    instances: Vec<TaskInstance>,
    tx: &mpsc::UnboundedSender<DeployEvent>,
) {
    let mut completed = 0u32;
    let mut errors = 0u32;
    let mut events: Vec<DeployEvent> = Vec::new();
    {
        let mut state = lock(state);
        let desired_paths: HashSet<&str> = instances.iter().map(|i| i.path.as_str()).collect();

        if mode == ActivationMode::Update {
            let stale: Vec<TaskId> = state
                .tasks
                .values()
                .filter(|t| !desired_paths.contains(t.runtime.path.as_str()))
                .map(|t| t.runtime.task_id)
                .collect();
            for task_id in stale {
                if let Some(task) = state.tasks.remove(&task_id) {
                    task.handle.abort();
                    bus.remove(task_id);
                    if let Some(worker) = state.workers.get_mut(&task.runtime.worker_id) {
                        worker.used_slots = worker.used_slots.saturating_sub(1);
                    }
                }
            }
        }

        let existing: HashSet<String> =
            state.tasks.values().map(|t| t.runtime.path.clone()).collect();

        // Keep collection instances on one worker each.
        let mut units: Vec<(Option<String>, Vec<&TaskInstance>)> = Vec::new();
        for instance in &instances {
            if existing.contains(&instance.path) {
                completed += 1;
                continue;
            }
            match &instance.collection_path {
                None => units.push((None, vec![instance])),
                Some(cpath) => match units.iter_mut().find(|(c, _)| c.as_deref() == Some(cpath)) {
                    Some((_, members)) => members.push(instance),
                    None => units.push((Some(cpath.clone()), vec![instance])),
                },
            }
        }

        for (collection_path, members) in units {
            let needed = members.len() as u32;
            let group = members[0].agent_group.as_str();
            let picked = pick_worker(&state.workers, group, needed);
            let placement = picked.and_then(|id| {
                state.workers.get_mut(&id).map(|worker| {
                    let base_slot = worker.used_slots;
                    worker.used_slots += needed;
                    (id, worker.info.host.clone(), base_slot)
                })
            });
            let Some((worker_id, host, base_slot)) = placement else {
                errors += needed;
                events.push(DeployEvent::Message {
                    severity: Severity::Error,
                    text: format!(
                        "no worker with {needed} free slot(s) for {:?} (group {group:?})",
                        collection_path.as_deref().unwrap_or(members[0].path.as_str())
                    ),
                });
                continue;
            };
            let collection_id = collection_path.as_ref().map(|cpath| {
                if let Some(id) = state.collection_ids.get(cpath) {
                    *id
                } else {
                    state.next_collection += 1;
                    let id = state.next_collection;
                    state.collection_ids.insert(cpath.clone(), id);
                    id
                }
            });
            let work_dir = format!("/var/tmp/conductor/{worker_id}");
            for (k, instance) in members.into_iter().enumerate() {
                state.next_task += 1;
                let task_id = state.next_task;
                let slot = base_slot + 1 + k as u32;
                let runtime = TaskRuntime {
                    task_id,
                    worker_id,
                    slot,
                    path: instance.path.clone(),
                    host: host.clone(),
                    work_dir: work_dir.clone(),
                    collection_id,
                    collection_path: collection_path.clone(),
                };
                let handle = spawn_device(
                    bus,
                    task_done,
                    task_id,
                    &instance.path,
                    &host,
                    crash_marker(&instance.exe, &instance.path),
                    config.transition_delay,
                );
                state.tasks.insert(
                    task_id,
                    LocalTask {
                        runtime: runtime.clone(),
                        handle,
                    },
                );
                completed += 1;
                events.push(DeployEvent::TaskActivated(runtime));
            }
        }

        if errors == 0 {
            state.active_topology = Some(file.to_path_buf());
        }
    }

    let total = completed + errors;
    for event in events {
        let _ = tx.send(event);
    }
    let _ = tx.send(DeployEvent::Progress {
        completed,
        errors,
        total,
    });
    let _ = tx.send(DeployEvent::Done);
}

/// First worker of the requested agent group with enough free slots;
/// falls back to any worker when the group has none.
fn pick_worker(
    workers: &BTreeMap<WorkerId, LocalWorker>,
    agent_group: &str,
    needed: u32,
) -> Option<WorkerId> {
    let fits = |w: &&LocalWorker| w.info.slots.saturating_sub(w.used_slots) >= needed;
    workers
        .values()
        .find(|w| w.info.agent_group == agent_group && fits(w))
        .or_else(|| workers.values().find(|w| fits(w)))
        .map(|w| w.info.id)
}

fn crash_marker(exe: &str, path: &str) -> Option<Transition> {
    let mut scoped = false;
    let mut matched = false;
    for token in exe.split_whitespace() {
        if let Some(substring) = token.strip_prefix(CRASH_PATH_MARKER) {
            scoped = true;
            matched |= path.contains(substring);
        }
    }
    if scoped && !matched {
        return None;
    }
    exe.split_whitespace()
        .find_map(|token| token.strip_prefix(CRASH_MARKER))
        .and_then(|name| Transition::from_str(name).ok())
}

/// Session-wide command transport backed by per-device inboxes.
pub struct LocalBus {
    inboxes: Mutex<HashMap<TaskId, mpsc::UnboundedSender<DeviceCommand>>>,
    replies: broadcast::Sender<DeviceReply>,
}

impl LocalBus {
    fn new() -> Arc<Self> {
        let (replies, _) = broadcast::channel(4096);
        Arc::new(Self {
            inboxes: Mutex::new(HashMap::new()),
            replies,
        })
    }

    fn insert(&self, task_id: TaskId, tx: mpsc::UnboundedSender<DeviceCommand>) {
        lock(&self.inboxes).insert(task_id, tx);
    }

    fn remove(&self, task_id: TaskId) {
        lock(&self.inboxes).remove(&task_id);
    }

    fn clear(&self) {
        lock(&self.inboxes).clear();
    }
}

#[async_trait]
impl CommandBus for LocalBus {
    async fn publish(
        &self,
        targets: &HashSet<TaskId>,
        cmd: DeviceCommand,
    ) -> Result<(), BusError> {
        let inboxes = lock(&self.inboxes);
        for task_id in targets {
            if let Some(tx) = inboxes.get(task_id) {
                // A closed inbox means the device just exited; the
                // collective operation handles the missing reply.
                let _ = tx.send(cmd.clone());
            }
        }
        Ok(())
    }

    fn replies(&self) -> broadcast::Receiver<DeviceReply> {
        self.replies.subscribe()
    }
}

fn spawn_device(
    bus: &Arc<LocalBus>,
    task_done: &broadcast::Sender<TaskDoneEvent>,
    task_id: TaskId,
    path: &str,
    host: &str,
    crash_on: Option<Transition>,
    transition_delay: Duration,
) -> JoinHandle<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    bus.insert(task_id, tx);
    let device = DeviceLoop {
        device_id: path.rsplit('/').next().unwrap_or(path).to_owned(),
        task_id,
        path: path.to_owned(),
        host: host.to_owned(),
        crash_on,
        transition_delay,
        replies: bus.replies.clone(),
        task_done: task_done.clone(),
    };
    tokio::spawn(device.run(rx))
}

struct DeviceLoop {
    device_id: String,
    task_id: TaskId,
    path: String,
    host: String,
    crash_on: Option<Transition>,
    transition_delay: Duration,
    replies: broadcast::Sender<DeviceReply>,
    task_done: broadcast::Sender<TaskDoneEvent>,
}

impl DeviceLoop {
    async fn run(self, mut inbox: mpsc::UnboundedReceiver<DeviceCommand>) {
        let mut state = DeviceState::Idle;
        let mut subscribed = false;
        let mut properties: HashMap<String, String> = HashMap::new();

        while let Some(cmd) = inbox.recv().await {
            match cmd {
                DeviceCommand::CheckState => {
                    self.send(DeviceReply::StateChange {
                        device_id: self.device_id.clone(),
                        task_id: self.task_id,
                        last_state: state,
                        current_state: state,
                    });
                }
                DeviceCommand::ChangeState { transition } => {
                    tokio::time::sleep(self.transition_delay).await;
                    let last = state;
                    let result = if self.crash_on == Some(transition) {
                        state = DeviceState::Error;
                        CmdResult::Failure
                    } else {
                        state = transition.expected_state();
                        CmdResult::Ok
                    };
                    self.send(DeviceReply::TransitionStatus {
                        device_id: self.device_id.clone(),
                        task_id: self.task_id,
                        result,
                        transition,
                        current_state: state,
                    });
                    if subscribed && state != last {
                        self.send(DeviceReply::StateChange {
                            device_id: self.device_id.clone(),
                            task_id: self.task_id,
                            last_state: last,
                            current_state: state,
                        });
                    }
                    if transition == Transition::End && result == CmdResult::Ok {
                        let _ = self.task_done.send(TaskDoneEvent {
                            task_id: self.task_id,
                            path: self.path.clone(),
                            exit_code: 0,
                            host: self.host.clone(),
                        });
                        break;
                    }
                }
                DeviceCommand::SubscribeToStateChange { .. } => {
                    subscribed = true;
                    self.send(DeviceReply::StateChangeSubscription {
                        device_id: self.device_id.clone(),
                        task_id: self.task_id,
                        result: CmdResult::Ok,
                    });
                }
                DeviceCommand::UnsubscribeFromStateChange => {
                    subscribed = false;
                    self.send(DeviceReply::StateChangeUnsubscription {
                        device_id: self.device_id.clone(),
                        task_id: self.task_id,
                        result: CmdResult::Ok,
                    });
                }
                DeviceCommand::GetProperties { request_id, query } => {
                    let selected: Vec<(String, String)> = properties
                        .iter()
                        .filter(|(k, _)| query.is_empty() || k.starts_with(query.as_str()))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    self.send(DeviceReply::Properties {
                        device_id: self.device_id.clone(),
                        task_id: self.task_id,
                        request_id,
                        result: CmdResult::Ok,
                        properties: selected,
                    });
                }
                DeviceCommand::SetProperties {
                    request_id,
                    properties: update,
                } => {
                    for (k, v) in update {
                        properties.insert(k, v);
                    }
                    self.send(DeviceReply::PropertiesSet {
                        device_id: self.device_id.clone(),
                        task_id: self.task_id,
                        request_id,
                        result: CmdResult::Ok,
                    });
                }
            }
        }
    }

    fn send(&self, reply: DeviceReply) {
        let _ = self.replies.send(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_markers_are_parsed_from_exe_strings() {
        assert_eq!(
            crash_marker("processor --crash-on=InitDevice --rate 1", "main/p"),
            Some(Transition::InitDevice)
        );
        assert_eq!(crash_marker("processor --rate 1", "main/p"), None);
        assert_eq!(crash_marker("processor --crash-on=Bogus", "main/p"), None);
    }

    #[test]
    fn crash_path_markers_scope_the_failure() {
        let exe = "processor --crash-on=InitDevice --crash-path=Processors_1";
        assert_eq!(
            crash_marker(exe, "main/online/Processors_1/processor_0"),
            Some(Transition::InitDevice)
        );
        assert_eq!(crash_marker(exe, "main/online/Processors_0/processor_0"), None);
    }

    #[tokio::test]
    async fn submit_creates_workers_with_slots() {
        let deployment = LocalDeployment::new(LocalConfig::default());
        let session = deployment.create_session().await.unwrap();
        let mut rx = session
            .submit_workers(WorkerBatch {
                rms: "localhost".into(),
                zone: String::new(),
                agent_group: String::new(),
                n: 2,
                slots: 6,
                cores: 0,
                config_file: String::new(),
                env_file: String::new(),
                required_slots: 0,
            })
            .await
            .unwrap();
        while let Some(event) = rx.recv().await {
            if matches!(event, DeployEvent::Done) {
                break;
            }
        }
        let workers = session.list_workers().await.unwrap();
        assert_eq!(workers.len(), 2);
        assert!(workers.iter().all(|w| w.slots == 6));
    }
}
