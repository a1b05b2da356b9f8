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

//! Requirements-extraction cases against reference topologies.

use conductor_core::requirements::{
    extract_requirements, AgentGroupInfo, CollectionReq, Requirements, ZoneGroup,
};
use conductor_core::topo_desc::{CollectionDecl, TaskDecl, TopologyDesc};

fn check_zone_group(zg: &ZoneGroup, n: i32, ncores: i32, agent_group: &str) {
    assert_eq!(zg.n, n);
    assert_eq!(zg.ncores, ncores);
    assert_eq!(zg.agent_group, agent_group);
}

#[allow(clippy::too_many_arguments)]
fn check_collection(
    req: &Requirements,
    index: usize,
    name: &str,
    zone: &str,
    agent_group: &str,
    n_original: i32,
    n_min: i32,
    n_cores: i32,
    num_tasks: usize,
    total_tasks: usize,
) {
    let col: &CollectionReq = &req.collections[index];
    assert_eq!(col.name, name);
    assert_eq!(col.zone, zone);
    assert_eq!(col.agent_group, agent_group);
    assert_eq!(col.n_original, n_original);
    assert_eq!(col.n_min, n_min);
    assert_eq!(col.n_cores, n_cores);
    assert_eq!(col.num_tasks, num_tasks);
    assert_eq!(col.total_tasks, total_tasks);
}

fn check_agent_group(
    req: &Requirements,
    name: &str,
    zone: &str,
    num_agents: i32,
    min_agents: i32,
    num_slots: usize,
    num_cores: i32,
) {
    let agi: &AgentGroupInfo = req
        .agent_groups
        .get(name)
        .unwrap_or_else(|| panic!("agent group {name:?} missing"));
    assert_eq!(agi.name, name);
    assert_eq!(agi.zone, zone);
    assert_eq!(agi.num_agents, num_agents);
    assert_eq!(agi.min_agents, min_agents);
    assert_eq!(agi.num_slots, num_slots);
    assert_eq!(agi.num_cores, num_cores);
}

#[test]
fn simple_ungrouped_collection() {
    // One 12-task collection, no zones, no minima.
    let mut desc = TopologyDesc {
        name: "ex-topo-infinite".into(),
        ..TopologyDesc::default()
    };
    desc.tasks.push(TaskDecl {
        name: "processor".into(),
        exe: "processor".into(),
        expendable: false,
    });
    desc.collections.push(CollectionDecl {
        name: "EPNCollection".into(),
        tasks: vec!["processor".into(); 12],
    });
    desc.main.collections.push("EPNCollection".into());

    let req = extract_requirements(&desc).unwrap();

    assert!(req.zones.is_empty());
    assert!(req.nmin.is_empty());
    assert_eq!(req.collections.len(), 1);
    check_collection(&req, 0, "EPNCollection", "", "", 1, -1, 0, 12, 12);
    assert_eq!(req.agent_groups.len(), 1);
    check_agent_group(&req, "", "", 1, -1, 12, 0);
}

#[test]
fn zones_derived_from_agent_group_names() {
    let desc = TopologyDesc::from_str(
        r#"
name: ex-topo-groupname
tasks:
  - { name: sampler, exe: sampler }
  - { name: sink, exe: sink }
  - { name: processor, exe: processor }
collections:
  - { name: SamplersSinks, tasks: [sampler, sink] }
  - { name: Processors, tasks: [processor] }
main:
  groups:
    - { name: calib, n: 1, collections: [SamplersSinks] }
    - { name: online, n: 4, collections: [Processors] }
"#,
    )
    .unwrap();

    let req = extract_requirements(&desc).unwrap();

    assert_eq!(req.zones.len(), 2);
    assert_eq!(req.zones["calib"].len(), 1);
    check_zone_group(&req.zones["calib"][0], 1, 0, "calib");
    assert_eq!(req.zones["online"].len(), 1);
    check_zone_group(&req.zones["online"][0], 4, 0, "online");

    assert_eq!(req.collections.len(), 2);
    check_collection(&req, 0, "SamplersSinks", "calib", "calib", 1, -1, 0, 2, 2);
    check_collection(&req, 1, "Processors", "online", "online", 4, -1, 0, 1, 4);

    assert_eq!(req.agent_groups.len(), 2);
    check_agent_group(&req, "online", "online", 4, -1, 1, 0);
    check_agent_group(&req, "calib", "calib", 1, -1, 2, 0);
}

#[test]
fn zones_with_ncores() {
    let desc = TopologyDesc::from_str(
        r#"
name: ex-topo-groupname-ncores
tasks:
  - { name: sampler, exe: sampler }
  - { name: sink, exe: sink }
  - { name: processor, exe: processor }
collections:
  - { name: Samplers, tasks: [sampler] }
  - { name: Sinks, tasks: [sink] }
  - { name: Processors, tasks: [processor] }
main:
  groups:
    - { name: calib1, zone: calib, n: 1, ncores: 2, collections: [Samplers] }
    - { name: calib2, zone: calib, n: 1, ncores: 1, collections: [Sinks] }
    - { name: online, n: 4, collections: [Processors] }
"#,
    )
    .unwrap();

    let req = extract_requirements(&desc).unwrap();

    assert_eq!(req.zones.len(), 2);
    assert_eq!(req.zones["calib"].len(), 2);
    check_zone_group(&req.zones["calib"][0], 1, 2, "calib1");
    check_zone_group(&req.zones["calib"][1], 1, 1, "calib2");
    assert_eq!(req.zones["online"].len(), 1);
    check_zone_group(&req.zones["online"][0], 4, 0, "online");

    assert_eq!(req.collections.len(), 3);
    check_collection(&req, 0, "Samplers", "calib", "calib1", 1, -1, 2, 1, 1);
    check_collection(&req, 1, "Sinks", "calib", "calib2", 1, -1, 1, 1, 1);
    check_collection(&req, 2, "Processors", "online", "online", 4, -1, 0, 1, 4);

    assert_eq!(req.agent_groups.len(), 3);
    check_agent_group(&req, "online", "online", 4, -1, 1, 0);
    check_agent_group(&req, "calib1", "calib", 1, -1, 1, 2);
    check_agent_group(&req, "calib2", "calib", 1, -1, 1, 1);
}

#[test]
fn nmin_variables_attach_to_collections() {
    let desc = TopologyDesc::from_str(
        r#"
name: ex-topo-groupname-crashing
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
"#,
    )
    .unwrap();

    let req = extract_requirements(&desc).unwrap();

    assert_eq!(req.zones.len(), 2);
    check_zone_group(&req.zones["calib"][0], 1, 0, "calib");
    check_zone_group(&req.zones["online"][0], 4, 0, "online");

    assert_eq!(req.nmin.len(), 1);
    let ninfo = &req.nmin["Processors"];
    assert_eq!(ninfo.n_original, 4);
    assert_eq!(ninfo.n_min, 2);
    assert_eq!(ninfo.agent_group, "online");

    assert_eq!(req.collections.len(), 2);
    check_collection(&req, 0, "SamplersSinks", "calib", "calib", 1, -1, 0, 2, 2);
    check_collection(&req, 1, "Processors", "online", "online", 4, 2, 0, 2, 8);

    assert_eq!(req.agent_groups.len(), 2);
    check_agent_group(&req, "online", "online", 4, 2, 2, 0);
    check_agent_group(&req, "calib", "calib", 1, -1, 2, 0);
}

#[test]
fn epn_scale_topology() {
    // 50 reconstruction collections with 223 tasks each, one 17-task
    // calibration collection pinned to 128 cores.
    let mut desc = TopologyDesc {
        name: "ex-epn".into(),
        ..TopologyDesc::default()
    };
    desc.vars
        .insert("odc_nmin_RecoCollection".into(), "50".into());
    desc.tasks.push(TaskDecl {
        name: "reco".into(),
        exe: "reco".into(),
        expendable: false,
    });
    desc.tasks.push(TaskDecl {
        name: "calibdev".into(),
        exe: "calibdev".into(),
        expendable: false,
    });
    desc.collections.push(CollectionDecl {
        name: "wf11.dds".into(),
        tasks: vec!["calibdev".into(); 17],
    });
    desc.collections.push(CollectionDecl {
        name: "RecoCollection".into(),
        tasks: vec!["reco".into(); 223],
    });
    desc.main.groups.push(conductor_core::topo_desc::GroupDecl {
        name: "calib1".into(),
        zone: "calib".into(),
        n: 1,
        ncores: 128,
        collections: vec!["wf11.dds".into()],
    });
    desc.main.groups.push(conductor_core::topo_desc::GroupDecl {
        name: "online".into(),
        zone: String::new(),
        n: 50,
        ncores: 0,
        collections: vec!["RecoCollection".into()],
    });

    let req = extract_requirements(&desc).unwrap();

    assert_eq!(req.zones.len(), 2);
    check_zone_group(&req.zones["calib"][0], 1, 128, "calib1");
    check_zone_group(&req.zones["online"][0], 50, 0, "online");

    assert_eq!(req.nmin.len(), 1);
    let ninfo = &req.nmin["RecoCollection"];
    assert_eq!(ninfo.n_original, 50);
    assert_eq!(ninfo.n_min, 50);
    assert_eq!(ninfo.agent_group, "online");

    assert_eq!(req.collections.len(), 2);
    check_collection(&req, 0, "wf11.dds", "calib", "calib1", 1, -1, 128, 17, 17);
    check_collection(
        &req,
        1,
        "RecoCollection",
        "online",
        "online",
        50,
        50,
        0,
        223,
        11150,
    );

    assert_eq!(req.agent_groups.len(), 2);
    check_agent_group(&req, "online", "online", 50, 50, 223, 0);
    check_agent_group(&req, "calib1", "calib", 1, -1, 17, 128);
}
