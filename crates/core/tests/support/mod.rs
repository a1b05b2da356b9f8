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

//! Shared fixtures for the controller integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use conductor_core::controller::{Controller, ControllerConfig};
use conductor_core::deployment::local::{LocalConfig, LocalDeployment};
use conductor_core::plugin::{PluginManager, TriggerManager};
use conductor_core::requests::{CommonParams, Request, RequestBody, RequestResult};

/// A 12-task collection without zones or minima.
pub const SIMPLE_TOPOLOGY: &str = r#"
name: ex-topo-infinite
tasks:
  - { name: processor, exe: processor }
collections:
  - name: EPNCollection
    tasks:
      [processor, processor, processor, processor, processor, processor,
       processor, processor, processor, processor, processor, processor]
main:
  collections: [EPNCollection]
"#;

/// Two agent groups: one calibration collection plus four processor
/// collections with an nMin of two.
pub const GROUPED_TOPOLOGY: &str = r#"
name: ex-topo-groupname
vars:
  odc_nmin_Processors: "2"
tasks:
  - { name: sampler, exe: sampler }
  - { name: sink, exe: sink }
  - { name: processor, exe: processor }
collections:
  - { name: SamplersSinks, tasks: [sampler, sink] }
  - { name: Processors, tasks: [processor, processor] }
main:
  groups:
    - { name: calib, n: 1, collections: [SamplersSinks] }
    - { name: online, n: 4, collections: [Processors] }
"#;

/// Worker resources matching [`GROUPED_TOPOLOGY`].
pub const GROUPED_RESOURCES: &str = "n=1,slots=2,group=calib,zone=calib;n=4,slots=2,group=online,zone=online";

pub fn write_topology(dir: &Path, name: &str, yaml: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, yaml).expect("failed to write topology fixture");
    path
}

pub fn local_controller(config: LocalConfig) -> (Controller, Arc<LocalDeployment>) {
    let deployment = LocalDeployment::new(config);
    let controller = Controller::new(
        deployment.clone(),
        ControllerConfig::default(),
        PluginManager::new(),
        TriggerManager::new(),
    );
    (controller, deployment)
}

pub fn controller_with(
    deployment: Arc<LocalDeployment>,
    config: ControllerConfig,
) -> Controller {
    Controller::new(
        deployment,
        config,
        PluginManager::new(),
        TriggerManager::new(),
    )
}

/// Execute one request with a 30 s header timeout.
pub async fn exec(controller: &Controller, partition: &str, body: RequestBody) -> RequestResult {
    exec_with_timeout(controller, partition, 30, body).await
}

pub async fn exec_with_timeout(
    controller: &Controller,
    partition: &str,
    timeout_secs: u64,
    body: RequestBody,
) -> RequestResult {
    controller
        .exec(Request::new(
            CommonParams::new(partition, 1, timeout_secs),
            body,
        ))
        .await
}

pub fn assert_success(result: &RequestResult) {
    assert!(
        result.is_success(),
        "request failed: {:?}",
        result.error
    );
}
