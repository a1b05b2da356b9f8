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

//! End-to-end controller scenarios over the local backend.

mod support;

use std::sync::Arc;
use std::time::Duration;

use conductor_core::controller::ControllerConfig;
use conductor_core::deployment::local::{LocalConfig, LocalDeployment};
use conductor_core::deployment::Deployment;
use conductor_core::error::ErrorCode;
use conductor_core::requests::{
    DeviceParams, InitializeParams, RequestBody, RunParams, SessionStatus, SetPropertiesParams,
    StatusParams, SubmitParams, TopologyParams,
};
use conductor_core::restore::RestoreFile;
use conductor_topology::AggregatedState;

use support::*;

fn submit_localhost(resources: &str) -> RequestBody {
    RequestBody::Submit(SubmitParams {
        plugin: "localhost".into(),
        resources: resources.into(),
    })
}

fn activate_file(path: &std::path::Path) -> RequestBody {
    RequestBody::Activate(TopologyParams {
        file: path.display().to_string(),
        ..TopologyParams::default()
    })
}

fn device(path: &str) -> RequestBody {
    RequestBody::GetState(DeviceParams {
        path: path.into(),
        detailed: true,
    })
}

#[tokio::test]
async fn happy_path_drives_the_full_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let topo = write_topology(dir.path(), "simple.yaml", SIMPLE_TOPOLOGY);
    let (controller, _deployment) = local_controller(LocalConfig::default());

    let steps: Vec<RequestBody> = vec![
        RequestBody::Initialize(InitializeParams::default()),
        submit_localhost("n=1,slots=12"),
        activate_file(&topo),
        RequestBody::Configure(DeviceParams::default()),
        RequestBody::Start(DeviceParams::default()),
        RequestBody::Stop(DeviceParams::default()),
        RequestBody::Reset(DeviceParams::default()),
        RequestBody::Terminate(DeviceParams::default()),
        RequestBody::Shutdown,
    ];

    let mut aggregated = Vec::new();
    for body in steps {
        let result = exec(&controller, "alpha", body).await;
        assert_success(&result);
        assert!(
            result.exec_time_ms <= 30_000,
            "request exceeded its own deadline: {}ms",
            result.exec_time_ms
        );
        aggregated.push(result.aggregated);
    }

    use AggregatedState::*;
    assert_eq!(
        aggregated,
        vec![Undefined, Undefined, Idle, Ready, Running, Ready, Idle, Exiting, Undefined]
    );

    // Shutdown removed the partition from the registry.
    let status = controller.status(&StatusParams { running: false }).await;
    assert!(status.partitions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn activate_times_out_against_a_slow_substrate() {
    let dir = tempfile::tempdir().unwrap();
    let topo = write_topology(dir.path(), "simple.yaml", SIMPLE_TOPOLOGY);
    let (controller, _deployment) = local_controller(LocalConfig {
        activation_delay: Duration::from_secs(5),
        ..LocalConfig::default()
    });

    assert_success(&exec(&controller, "alpha", RequestBody::Initialize(InitializeParams::default())).await);
    assert_success(&exec(&controller, "alpha", submit_localhost("n=1,slots=12")).await);

    let result = exec_with_timeout(&controller, "alpha", 1, activate_file(&topo)).await;
    assert!(!result.is_success());
    let error = result.error.expect("expected an error");
    assert_eq!(error.code, ErrorCode::RequestTimeout);

    // No topology handle was created.
    let state = exec(&controller, "alpha", device("")).await;
    assert!(!state.is_success());
    assert_eq!(
        state.error.expect("expected an error").code,
        ErrorCode::DeviceGetStateFailed
    );
}

#[tokio::test]
async fn run_rejects_a_session_id() {
    let (controller, _deployment) = local_controller(LocalConfig::default());
    let result = exec(
        &controller,
        "alpha",
        RequestBody::Run(RunParams {
            session_id: "some-session".into(),
            ..RunParams::default()
        }),
    )
    .await;
    assert!(!result.is_success());
    assert_eq!(
        result.error.expect("expected an error").code,
        ErrorCode::RequestNotSupported
    );
}

#[tokio::test]
async fn run_is_initialize_submit_activate() {
    let dir = tempfile::tempdir().unwrap();
    let topo = write_topology(dir.path(), "simple.yaml", SIMPLE_TOPOLOGY);
    let (controller, _deployment) = local_controller(LocalConfig::default());

    let result = exec(
        &controller,
        "alpha",
        RequestBody::Run(RunParams {
            plugin: "localhost".into(),
            resources: "n=1,slots=12".into(),
            topology: TopologyParams {
                file: topo.display().to_string(),
                ..TopologyParams::default()
            },
            ..RunParams::default()
        }),
    )
    .await;
    assert_success(&result);
    assert_eq!(result.aggregated, AggregatedState::Idle);
    assert!(!result.session_id.is_empty());
    assert_eq!(result.hosts.len(), 1);

    // Same observable state as the three-step sequence.
    let state = exec(&controller, "alpha", device("")).await;
    assert_success(&state);
    assert_eq!(state.aggregated, AggregatedState::Idle);
    assert_eq!(state.devices.as_ref().map(Vec::len), Some(12));
}

#[tokio::test]
async fn run_can_extract_resources_from_the_topology() {
    let dir = tempfile::tempdir().unwrap();
    let topo = write_topology(dir.path(), "grouped.yaml", GROUPED_TOPOLOGY);
    let (controller, _deployment) = local_controller(LocalConfig::default());

    let result = exec(
        &controller,
        "alpha",
        RequestBody::Run(RunParams {
            topology: TopologyParams {
                file: topo.display().to_string(),
                ..TopologyParams::default()
            },
            extract_topo_resources: true,
            ..RunParams::default()
        }),
    )
    .await;
    assert_success(&result);
    assert_eq!(result.aggregated, AggregatedState::Idle);
    // One calibration worker plus four online workers.
    assert_eq!(result.hosts.len(), 5);
}

#[tokio::test]
async fn attach_rebuilds_the_topology_handle() {
    let dir = tempfile::tempdir().unwrap();
    let topo = write_topology(dir.path(), "simple.yaml", SIMPLE_TOPOLOGY);
    let deployment = LocalDeployment::new(LocalConfig::default());
    let first = controller_with(deployment.clone(), ControllerConfig::default());

    assert_success(&exec(&first, "phys", RequestBody::Initialize(InitializeParams::default())).await);
    assert_success(&exec(&first, "phys", submit_localhost("n=1,slots=12")).await);
    let activated = exec(&first, "phys", activate_file(&topo)).await;
    assert_success(&activated);
    let session_id = activated.session_id.clone();

    // A second controller instance attaches to the live session and
    // serves state without re-activation.
    let second = controller_with(deployment.clone(), ControllerConfig::default());
    let attached = exec(
        &second,
        "phys",
        RequestBody::Initialize(InitializeParams {
            session_id: session_id.clone(),
        }),
    )
    .await;
    assert_success(&attached);
    assert_eq!(attached.session_id, session_id);

    let state = exec(&second, "phys", device("")).await;
    assert_success(&state);
    assert_eq!(state.aggregated, AggregatedState::Idle);
    assert_eq!(state.devices.as_ref().map(Vec::len), Some(12));
}

#[tokio::test]
async fn parallel_partitions_run_independently() {
    let dir = tempfile::tempdir().unwrap();
    let topo = write_topology(dir.path(), "simple.yaml", SIMPLE_TOPOLOGY);
    let (controller, _deployment) = local_controller(LocalConfig::default());
    let controller = Arc::new(controller);

    let run = |partition: &'static str| {
        let controller = controller.clone();
        let file = topo.display().to_string();
        async move {
            exec(
                &controller,
                partition,
                RequestBody::Run(RunParams {
                    plugin: "localhost".into(),
                    resources: "n=1,slots=12".into(),
                    topology: TopologyParams {
                        file,
                        ..TopologyParams::default()
                    },
                    ..RunParams::default()
                }),
            )
            .await
        }
    };

    let (a, b) = tokio::join!(run("left"), run("right"));
    assert_success(&a);
    assert_success(&b);
    assert_ne!(a.session_id, b.session_id);

    let status = controller.status(&StatusParams { running: true }).await;
    assert_eq!(status.partitions.len(), 2);
    assert!(status
        .partitions
        .iter()
        .all(|p| p.session_status == SessionStatus::Running));
}

#[tokio::test]
async fn status_running_filter_reports_a_subset() {
    let (controller, deployment) = local_controller(LocalConfig::default());

    assert_success(&exec(&controller, "a", RequestBody::Initialize(InitializeParams::default())).await);
    let b = exec(&controller, "b", RequestBody::Initialize(InitializeParams::default())).await;
    assert_success(&b);

    // Stop partition b's session behind the controller's back.
    let session = deployment.attach_session(&b.session_id).await.unwrap();
    session.shutdown().await.unwrap();

    let all = controller.status(&StatusParams { running: false }).await;
    let running = controller.status(&StatusParams { running: true }).await;
    assert_eq!(all.partitions.len(), 2);
    assert_eq!(running.partitions.len(), 1);
    for record in &running.partitions {
        assert!(all
            .partitions
            .iter()
            .any(|p| p.partition_id == record.partition_id));
    }
}

#[tokio::test]
async fn configure_reset_round_trip_returns_to_idle() {
    let dir = tempfile::tempdir().unwrap();
    let topo = write_topology(dir.path(), "simple.yaml", SIMPLE_TOPOLOGY);
    let (controller, _deployment) = local_controller(LocalConfig::default());

    assert_success(&exec(&controller, "alpha", RequestBody::Initialize(InitializeParams::default())).await);
    assert_success(&exec(&controller, "alpha", submit_localhost("n=1,slots=12")).await);
    assert_success(&exec(&controller, "alpha", activate_file(&topo)).await);
    let baseline = exec(&controller, "alpha", device("")).await;
    assert_success(&baseline);
    assert_eq!(baseline.aggregated, AggregatedState::Idle);

    let configured = exec(&controller, "alpha", RequestBody::Configure(DeviceParams::default())).await;
    assert_success(&configured);
    assert_eq!(configured.aggregated, AggregatedState::Ready);

    assert_success(
        &exec(
            &controller,
            "alpha",
            RequestBody::SetProperties(SetPropertiesParams {
                path: String::new(),
                properties: vec![("output-rate".into(), "25".into())],
            }),
        )
        .await,
    );

    let reset = exec(&controller, "alpha", RequestBody::Reset(DeviceParams::default())).await;
    assert_success(&reset);
    assert_eq!(reset.aggregated, AggregatedState::Idle);

    let round_trip = exec(&controller, "alpha", device("")).await;
    assert_success(&round_trip);
    assert_eq!(round_trip.aggregated, baseline.aggregated);
    assert_eq!(
        round_trip.devices.as_ref().map(Vec::len),
        baseline.devices.as_ref().map(Vec::len)
    );
}

#[tokio::test]
async fn update_rescales_a_live_topology() {
    let dir = tempfile::tempdir().unwrap();
    let topo = write_topology(dir.path(), "grouped.yaml", GROUPED_TOPOLOGY);
    let reduced = write_topology(
        dir.path(),
        "grouped-reduced.yaml",
        &GROUPED_TOPOLOGY.replace("n: 4", "n: 3"),
    );
    let (controller, _deployment) = local_controller(LocalConfig::default());

    assert_success(&exec(&controller, "alpha", RequestBody::Initialize(InitializeParams::default())).await);
    assert_success(&exec(&controller, "alpha", submit_localhost(GROUPED_RESOURCES)).await);
    assert_success(&exec(&controller, "alpha", activate_file(&topo)).await);
    let configured = exec(&controller, "alpha", RequestBody::Configure(DeviceParams::default())).await;
    assert_success(&configured);
    assert_eq!(configured.aggregated, AggregatedState::Ready);

    let updated = exec(
        &controller,
        "alpha",
        RequestBody::Update(TopologyParams {
            file: reduced.display().to_string(),
            ..TopologyParams::default()
        }),
    )
    .await;
    assert_success(&updated);
    assert_eq!(updated.aggregated, AggregatedState::Ready);

    let state = exec(&controller, "alpha", device("")).await;
    assert_success(&state);
    // 2 calibration tasks + 3 surviving processor collections of 2.
    assert_eq!(state.devices.as_ref().map(Vec::len), Some(8));
}

#[tokio::test]
async fn initialize_and_shutdown_maintain_the_restore_file() {
    let dir = tempfile::tempdir().unwrap();
    let deployment = LocalDeployment::new(LocalConfig::default());
    let config = ControllerConfig {
        restore_id: Some("itest".into()),
        restore_dir: dir.path().to_path_buf(),
        ..ControllerConfig::default()
    };
    let controller = controller_with(deployment.clone(), config.clone());
    let restore_file = RestoreFile::new("itest", dir.path());

    let init = exec(&controller, "alpha", RequestBody::Initialize(InitializeParams::default())).await;
    assert_success(&init);
    let data = restore_file.read().unwrap();
    assert_eq!(data.partitions.len(), 1);
    assert_eq!(data.partitions[0].partition_id, "alpha");
    assert_eq!(data.partitions[0].session_id, init.session_id);

    // A fresh controller restores the partition from the index.
    let restored = controller_with(deployment.clone(), config.clone());
    restored.restore().await;
    let status = restored.status(&StatusParams { running: true }).await;
    assert_eq!(status.partitions.len(), 1);
    assert_eq!(status.partitions[0].session_id, init.session_id);

    // Shutdown leaves no partition state and no restore entry.
    assert_success(&exec(&controller, "alpha", RequestBody::Shutdown).await);
    assert!(restore_file.read().unwrap().partitions.is_empty());
    let status = controller.status(&StatusParams { running: false }).await;
    assert!(status.partitions.is_empty());
}
