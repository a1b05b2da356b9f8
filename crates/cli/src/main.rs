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

//! Conductor client: an interactive line-oriented frontend embedding
//! the partition controller over the local in-process backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use conductor_core::controller::{Controller, ControllerConfig, ZoneConfig};
use conductor_core::deployment::local::{LocalConfig, LocalDeployment};
use conductor_core::plugin::{PluginManager, TriggerManager};

mod repl;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Conductor control-plane client", long_about = None)]
struct Cli {
    /// Default request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Enable nMin-based recovery of failed collections
    #[arg(long)]
    recovery: bool,

    /// Restore id; on startup the controller re-attaches the sessions
    /// recorded under this id
    #[arg(long)]
    restore: Option<String>,

    /// Directory for restore files
    #[arg(long)]
    restore_dir: Option<PathBuf>,

    /// Directory for history files
    #[arg(long)]
    history_dir: Option<PathBuf>,

    /// Register a resource plugin as NAME:PATH (repeatable)
    #[arg(long = "rp", value_name = "NAME:PATH")]
    resource_plugins: Vec<String>,

    /// Register a request trigger as REQUEST:PATH (repeatable)
    #[arg(long = "rt", value_name = "REQUEST:PATH")]
    request_triggers: Vec<String>,

    /// Zone configuration as NAME:CFG_PATH:ENV_PATH (repeatable)
    #[arg(long = "zones", value_name = "NAME:CFG:ENV")]
    zones: Vec<String>,

    /// Commands to execute sequentially instead of the interactive
    /// prompt; the process exits afterwards
    #[arg(long, value_name = "CMD")]
    cmds: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .init();

    let mut config = ControllerConfig {
        default_timeout: Duration::from_secs(cli.timeout),
        recovery_enabled: cli.recovery,
        restore_id: cli.restore.clone(),
        ..ControllerConfig::default()
    };
    if let Some(dir) = &cli.restore_dir {
        config.restore_dir = dir.clone();
    }
    config.history_dir = cli.history_dir.clone();
    for spec in &cli.zones {
        let mut parts = spec.splitn(3, ':');
        let (name, cfg, env) = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(cfg), Some(env)) => (name, cfg, env),
            _ => bail!("invalid zone configuration {spec:?}, expected NAME:CFG:ENV"),
        };
        config.zone_cfgs.insert(
            name.to_owned(),
            ZoneConfig {
                config_path: cfg.to_owned(),
                env_path: env.to_owned(),
            },
        );
    }

    let mut plugins = PluginManager::new();
    for spec in &cli.resource_plugins {
        let (name, path) = spec
            .split_once(':')
            .with_context(|| format!("invalid resource plugin {spec:?}, expected NAME:PATH"))?;
        plugins.register(name, path);
    }

    let mut triggers = TriggerManager::new();
    for spec in &cli.request_triggers {
        let (name, path) = spec
            .split_once(':')
            .with_context(|| format!("invalid request trigger {spec:?}, expected REQUEST:PATH"))?;
        triggers.register(name, path)?;
    }

    let deployment = LocalDeployment::new(LocalConfig::default());
    let controller = Arc::new(Controller::new(deployment, config, plugins, triggers));
    controller.restore().await;

    repl::run(controller, cli.cmds).await
}
