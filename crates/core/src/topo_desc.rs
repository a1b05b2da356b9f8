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

//! Topology description model
//!
//! A topology description is a YAML tree of task and collection
//! declarations plus a `main` group instantiating them, optionally under
//! named agent groups with a multiplicity `n`. The deployment substrate
//! treats the file as opaque; the controller parses it for the
//! requirements summary, for expendable-task flags and for the nMin
//! recovery rewrite.
//!
//! Per-collection minima are carried as variables named
//! `odc_nmin_<collection>`; recovery preserves them when it rewrites the
//! group multiplicities.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Prefix of the per-collection minimum variables.
pub const NMIN_VAR_PREFIX: &str = "odc_nmin_";

#[derive(Debug, thiserror::Error)]
pub enum TopoDescError {
    #[error("failed to read topology description {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse topology description: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("collection {collection:?} references undeclared task {task:?}")]
    UnknownTask { collection: String, task: String },
    #[error("main group references undeclared collection {0:?}")]
    UnknownCollection(String),
    #[error("main group references undeclared task {0:?}")]
    UnknownStandaloneTask(String),
    #[error("invalid value for variable {var:?}: {value:?}")]
    BadVar { var: String, value: String },
}

/// Declared task: the unit a worker slot executes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskDecl {
    pub name: String,
    #[serde(default)]
    pub exe: String,
    /// A failure of instances of this task must not fail the partition.
    #[serde(default)]
    pub expendable: bool,
}

/// Declared collection: a bundle of tasks co-scheduled on one worker.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CollectionDecl {
    pub name: String,
    pub tasks: Vec<String>,
}

/// A named agent group inside `main`, instantiated `n` times.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GroupDecl {
    pub name: String,
    /// Zone of the group; defaults to the group name when empty.
    #[serde(default)]
    pub zone: String,
    pub n: i32,
    #[serde(default)]
    pub ncores: i32,
    #[serde(default)]
    pub collections: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MainGroup {
    /// Standalone task instances.
    #[serde(default)]
    pub tasks: Vec<String>,
    /// Ungrouped collection instances (multiplicity 1).
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub groups: Vec<GroupDecl>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TopologyDesc {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub tasks: Vec<TaskDecl>,
    #[serde(default)]
    pub collections: Vec<CollectionDecl>,
    #[serde(default)]
    pub main: MainGroup,
}

/// One expanded task instance with its runtime path.
#[derive(Clone, Debug)]
pub struct TaskInstance {
    pub path: String,
    pub task: String,
    pub exe: String,
    pub expendable: bool,
    /// Path of the owning collection instance, if any.
    pub collection_path: Option<String>,
    pub collection_name: Option<String>,
    /// Agent group the instance belongs to; empty when ungrouped.
    pub agent_group: String,
}

impl TopologyDesc {
    pub fn from_str(raw: &str) -> Result<Self, TopoDescError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, TopoDescError> {
        let raw = std::fs::read_to_string(path).map_err(|source| TopoDescError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&raw)
    }

    pub fn to_yaml(&self) -> Result<String, TopoDescError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), TopoDescError> {
        let raw = self.to_yaml()?;
        std::fs::write(path, raw).map_err(|source| TopoDescError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn task_decl(&self, name: &str) -> Option<&TaskDecl> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn collection_decl(&self, name: &str) -> Option<&CollectionDecl> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// The group a collection is instantiated under, if any.
    pub fn group_of_collection(&self, collection: &str) -> Option<&GroupDecl> {
        self.main
            .groups
            .iter()
            .find(|g| g.collections.iter().any(|c| c == collection))
    }

    /// Per-collection minima from the `odc_nmin_<collection>` variables.
    pub fn nmin_vars(&self) -> Result<BTreeMap<String, i32>, TopoDescError> {
        let mut out = BTreeMap::new();
        for (var, value) in &self.vars {
            if let Some(collection) = var.strip_prefix(NMIN_VAR_PREFIX) {
                let nmin: i32 = value.parse().map_err(|_| TopoDescError::BadVar {
                    var: var.clone(),
                    value: value.clone(),
                })?;
                out.insert(collection.to_owned(), nmin);
            }
        }
        Ok(out)
    }

    /// Replace the multiplicity of a group (the nMin recovery rewrite).
    pub fn set_group_n(&mut self, group: &str, n: i32) -> bool {
        match self.main.groups.iter_mut().find(|g| g.name == group) {
            Some(g) => {
                g.n = n;
                true
            }
            None => false,
        }
    }

    /// Expand the main group into concrete task instances with runtime
    /// paths. Standalone task: `main/<task>`. Collection instance `i`:
    /// `main[/<group>]/<collection>_<i>/<task>_<j>`.
    pub fn instances(&self) -> Result<Vec<TaskInstance>, TopoDescError> {
        let mut out = Vec::new();

        for task in &self.main.tasks {
            let decl = self
                .task_decl(task)
                .ok_or_else(|| TopoDescError::UnknownStandaloneTask(task.clone()))?;
            out.push(TaskInstance {
                path: format!("main/{task}"),
                task: task.clone(),
                exe: decl.exe.clone(),
                expendable: decl.expendable,
                collection_path: None,
                collection_name: None,
                agent_group: String::new(),
            });
        }

        for collection in &self.main.collections {
            self.expand_collection(collection, "main", 1, "", &mut out)?;
        }

        for group in &self.main.groups {
            let parent = format!("main/{}", group.name);
            for collection in &group.collections {
                self.expand_collection(collection, &parent, group.n, &group.name, &mut out)?;
            }
        }

        Ok(out)
    }

    /// Expendable flags by runtime path, for building the topology
    /// handle from the substrate's live task list.
    pub fn expendable_paths(&self) -> Result<HashMap<String, bool>, TopoDescError> {
        Ok(self
            .instances()?
            .into_iter()
            .map(|i| (i.path, i.expendable))
            .collect())
    }

    fn expand_collection(
        &self,
        collection: &str,
        parent: &str,
        n: i32,
        agent_group: &str,
        out: &mut Vec<TaskInstance>,
    ) -> Result<(), TopoDescError> {
        let decl = self
            .collection_decl(collection)
            .ok_or_else(|| TopoDescError::UnknownCollection(collection.to_owned()))?;
        for i in 0..n.max(0) {
            let collection_path = format!("{parent}/{collection}_{i}");
            for (j, task) in decl.tasks.iter().enumerate() {
                let task_decl =
                    self.task_decl(task)
                        .ok_or_else(|| TopoDescError::UnknownTask {
                            collection: collection.to_owned(),
                            task: task.clone(),
                        })?;
                out.push(TaskInstance {
                    path: format!("{collection_path}/{task}_{j}"),
                    task: task.clone(),
                    exe: task_decl.exe.clone(),
                    expendable: task_decl.expendable,
                    collection_path: Some(collection_path.clone()),
                    collection_name: Some(collection.to_owned()),
                    agent_group: agent_group.to_owned(),
                });
            }
        }
        Ok(())
    }
}

/// Base collection name of a collection-instance path
/// (`main/online/Processors_2` → `Processors`).
pub fn collection_base_name(collection_path: &str) -> &str {
    let last = collection_path
        .rsplit('/')
        .next()
        .unwrap_or(collection_path);
    match last.rsplit_once('_') {
        Some((name, idx)) if idx.chars().all(|c| c.is_ascii_digit()) => name,
        _ => last,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPO: &str = r#"
name: grouped
vars:
  odc_nmin_Processors: "2"
tasks:
  - name: sampler
    exe: "sampler --rate 10"
  - name: processor
    exe: "processor"
collections:
  - name: SamplersSinks
    tasks: [sampler, sampler]
  - name: Processors
    tasks: [processor]
main:
  collections: [SamplersSinks]
  groups:
    - name: online
      n: 4
      collections: [Processors]
"#;

    #[test]
    fn expansion_assigns_runtime_paths() {
        let desc = TopologyDesc::from_str(TOPO).unwrap();
        let instances = desc.instances().unwrap();
        assert_eq!(instances.len(), 2 + 4);
        assert_eq!(instances[0].path, "main/SamplersSinks_0/sampler_0");
        assert_eq!(instances[1].path, "main/SamplersSinks_0/sampler_1");
        let grouped: Vec<&TaskInstance> =
            instances.iter().filter(|i| i.agent_group == "online").collect();
        assert_eq!(grouped.len(), 4);
        assert_eq!(grouped[3].path, "main/online/Processors_3/processor_0");
        assert_eq!(grouped[0].collection_name.as_deref(), Some("Processors"));
    }

    #[test]
    fn nmin_vars_are_parsed() {
        let desc = TopologyDesc::from_str(TOPO).unwrap();
        let nmin = desc.nmin_vars().unwrap();
        assert_eq!(nmin.get("Processors"), Some(&2));
    }

    #[test]
    fn group_rewrite_preserves_vars() {
        let mut desc = TopologyDesc::from_str(TOPO).unwrap();
        assert!(desc.set_group_n("online", 2));
        let raw = desc.to_yaml().unwrap();
        let reparsed = TopologyDesc::from_str(&raw).unwrap();
        assert_eq!(reparsed.main.groups[0].n, 2);
        assert_eq!(reparsed.nmin_vars().unwrap().get("Processors"), Some(&2));
    }

    #[test]
    fn unknown_references_are_rejected() {
        let raw = "name: broken\nmain:\n  collections: [Nope]\n";
        let desc = TopologyDesc::from_str(raw).unwrap();
        assert!(matches!(
            desc.instances(),
            Err(TopoDescError::UnknownCollection(_))
        ));
    }

    #[test]
    fn collection_base_names_strip_instance_suffixes() {
        assert_eq!(collection_base_name("main/online/Processors_2"), "Processors");
        assert_eq!(collection_base_name("main/SamplersSinks_0"), "SamplersSinks");
        assert_eq!(collection_base_name("main/wf11.dds_0"), "wf11.dds");
    }
}
