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

//! Requirements extraction
//!
//! Pure summary view of a topology description: zones, agent groups,
//! collections and per-collection minima. The partition controller uses
//! it for worker submission sizing and for nMin recovery decisions.

use std::collections::BTreeMap;

use crate::topo_desc::{TopoDescError, TopologyDesc};

/// One group's capacity contribution to a zone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneGroup {
    pub n: i32,
    pub ncores: i32,
    pub agent_group: String,
}

/// Per-collection minimum rule. `n_min == -1` means "not set".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionNInfo {
    pub n_original: i32,
    pub n_min: i32,
    pub agent_group: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionReq {
    pub name: String,
    pub zone: String,
    pub agent_group: String,
    pub n_original: i32,
    pub n_min: i32,
    pub n_cores: i32,
    pub num_tasks: usize,
    pub total_tasks: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentGroupInfo {
    pub name: String,
    pub zone: String,
    pub num_agents: i32,
    pub min_agents: i32,
    pub num_slots: usize,
    pub num_cores: i32,
}

/// Summary view of a topology description.
#[derive(Clone, Debug, Default)]
pub struct Requirements {
    /// Zone name → contributing groups, in declaration order.
    pub zones: BTreeMap<String, Vec<ZoneGroup>>,
    /// Collection name → minimum rule, for collections with a
    /// `odc_nmin_<collection>` variable.
    pub nmin: BTreeMap<String, CollectionNInfo>,
    /// Collections in traversal order of `main`.
    pub collections: Vec<CollectionReq>,
    /// Tasks instantiated outside any collection.
    pub standalone_tasks: Vec<String>,
    pub agent_groups: BTreeMap<String, AgentGroupInfo>,
}

impl Requirements {
    pub fn collection(&self, name: &str) -> Option<&CollectionReq> {
        self.collections.iter().find(|c| c.name == name)
    }
}

/// Extract the requirements summary from a parsed topology description.
pub fn extract_requirements(desc: &TopologyDesc) -> Result<Requirements, TopoDescError> {
    let mut req = Requirements::default();
    let nmin_vars = desc.nmin_vars()?;

    for group in &desc.main.groups {
        let zone = if group.zone.is_empty() {
            group.name.clone()
        } else {
            group.zone.clone()
        };
        req.zones.entry(zone).or_default().push(ZoneGroup {
            n: group.n,
            ncores: group.ncores,
            agent_group: group.name.clone(),
        });
    }

    // nMin rules attach to the group the collection is instantiated in.
    for (collection, n_min) in &nmin_vars {
        let (n_original, agent_group) = match desc.group_of_collection(collection) {
            Some(group) => (group.n, group.name.clone()),
            None => (1, String::new()),
        };
        req.nmin.insert(
            collection.clone(),
            CollectionNInfo {
                n_original,
                n_min: *n_min,
                agent_group,
            },
        );
    }

    req.standalone_tasks = desc.main.tasks.clone();

    // Collections in traversal order: ungrouped first, then per group.
    for collection in &desc.main.collections {
        push_collection(desc, collection, 1, "", "", 0, &nmin_vars, &mut req)?;
    }
    for group in &desc.main.groups {
        let zone = if group.zone.is_empty() {
            group.name.clone()
        } else {
            group.zone.clone()
        };
        for collection in &group.collections {
            push_collection(
                desc,
                collection,
                group.n,
                &zone,
                &group.name,
                group.ncores,
                &nmin_vars,
                &mut req,
            )?;
        }
    }

    // Aggregate per agent group.
    for collection in &req.collections {
        let entry = req
            .agent_groups
            .entry(collection.agent_group.clone())
            .or_insert_with(|| AgentGroupInfo {
                name: collection.agent_group.clone(),
                zone: collection.zone.clone(),
                num_agents: 0,
                min_agents: -1,
                num_slots: 0,
                num_cores: collection.n_cores,
            });
        entry.num_agents = if collection.agent_group.is_empty() {
            entry.num_agents + collection.n_original
        } else {
            collection.n_original
        };
        entry.num_slots = entry.num_slots.max(collection.num_tasks);
        entry.min_agents = entry.min_agents.max(collection.n_min);
        entry.num_cores = entry.num_cores.max(collection.n_cores);
    }

    // Standalone tasks run on the anonymous agent group.
    if !req.standalone_tasks.is_empty() {
        let count = req.standalone_tasks.len();
        let entry = req
            .agent_groups
            .entry(String::new())
            .or_insert_with(|| AgentGroupInfo {
                name: String::new(),
                zone: String::new(),
                num_agents: 0,
                min_agents: -1,
                num_slots: 0,
                num_cores: 0,
            });
        entry.num_agents = entry.num_agents.max(1);
        entry.num_slots = entry.num_slots.max(count);
    }

    Ok(req)
}

#[allow(clippy::too_many_arguments)]
fn push_collection(
    desc: &TopologyDesc,
    name: &str,
    n_original: i32,
    zone: &str,
    agent_group: &str,
    ncores: i32,
    nmin_vars: &BTreeMap<String, i32>,
    req: &mut Requirements,
) -> Result<(), TopoDescError> {
    let decl = desc
        .collection_decl(name)
        .ok_or_else(|| TopoDescError::UnknownCollection(name.to_owned()))?;
    let num_tasks = decl.tasks.len();
    let n_min = nmin_vars.get(name).copied().unwrap_or(-1);
    req.collections.push(CollectionReq {
        name: name.to_owned(),
        zone: zone.to_owned(),
        agent_group: agent_group.to_owned(),
        n_original,
        n_min,
        n_cores: ncores,
        num_tasks,
        total_tasks: n_original.max(0) as usize * num_tasks,
    });
    Ok(())
}
