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

//! Line protocol of the interactive client
//!
//! Every command starts with a dot and carries its own option set,
//! parsed with clap. The command set mirrors the lifecycle operations
//! one to one, plus `.batch`, `.sleep`, `.help` and `.quit`.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser};
use tokio::io::{AsyncBufReadExt, BufReader};

use conductor_core::controller::Controller;
use conductor_core::requests::{
    CommonParams, DeviceParams, InitializeParams, Request, RequestBody, RequestResult,
    RequestStatus, RunParams, SetPropertiesParams, StatusParams, StatusResult, SubmitParams,
    TopologyParams,
};

const HELP: &str = "\
Available commands:
  .init     [--id P] [--sid SESSION]            create or attach a session
  .submit   [--id P] --res RESOURCES            submit workers (--plugin localhost)
  .activate [--id P] --topo FILE                activate a topology
  .run      [--id P] --res R --topo FILE        initialize + submit + activate
  .update   [--id P] --topo FILE                rescale the live topology
  .prop     [--id P] --prop KEY=VALUE ...       set device properties
  .state    [--id P] [--path S] [--detailed]    aggregated (and detailed) state
  .config   [--id P] [--path S]                 InitDevice..InitTask chain
  .start    [--id P] [--path S]                 Run transition
  .stop     [--id P] [--path S]                 Stop transition
  .reset    [--id P] [--path S]                 ResetTask, ResetDevice
  .term     [--id P] [--path S]                 End transition
  .down     [--id P]                            shut the session down
  .status   [--running]                         report all partitions
  .batch                                        re-run the startup command list
  .sleep    --ms N                              pause between batch steps
  .help                                         this text
  .quit                                         exit";

#[derive(Args)]
struct Common {
    /// Partition id
    #[arg(long = "id", default_value = "default")]
    id: String,
    /// Run number
    #[arg(long = "run-nr", default_value_t = 0)]
    run_nr: u64,
    /// Request timeout in seconds; 0 uses the controller default
    #[arg(long, default_value_t = 0)]
    timeout: u64,
}

impl Common {
    fn params(&self) -> CommonParams {
        CommonParams::new(&self.id, self.run_nr, self.timeout)
    }
}

#[derive(Parser)]
struct InitArgs {
    #[command(flatten)]
    common: Common,
    /// Session id to attach to; omit to create a new session
    #[arg(long = "sid", default_value = "")]
    session_id: String,
}

#[derive(Parser)]
struct SubmitArgs {
    #[command(flatten)]
    common: Common,
    /// Resource plugin name
    #[arg(long, default_value = "localhost")]
    plugin: String,
    /// Resource description, e.g. "n=1,slots=12"
    #[arg(long = "res", default_value = "n=1,slots=12")]
    resources: String,
}

#[derive(Args)]
struct TopologySelector {
    /// Path to the topology description file
    #[arg(long = "topo", default_value = "")]
    file: String,
    /// Inline topology description
    #[arg(long, default_value = "")]
    content: String,
    /// Script generating the topology description on stdout
    #[arg(long, default_value = "")]
    script: String,
}

impl TopologySelector {
    fn params(&self) -> TopologyParams {
        TopologyParams {
            file: self.file.clone(),
            content: self.content.clone(),
            script: self.script.clone(),
        }
    }
}

#[derive(Parser)]
struct TopologyArgs {
    #[command(flatten)]
    common: Common,
    #[command(flatten)]
    topology: TopologySelector,
}

#[derive(Parser)]
struct RunArgs {
    #[command(flatten)]
    common: Common,
    #[command(flatten)]
    topology: TopologySelector,
    /// Resource plugin name
    #[arg(long, default_value = "localhost")]
    plugin: String,
    /// Resource description
    #[arg(long = "res", default_value = "n=1,slots=12")]
    resources: String,
    /// Derive the submission from the topology description
    #[arg(long)]
    extract_topo_resources: bool,
}

#[derive(Parser)]
struct DeviceArgs {
    #[command(flatten)]
    common: Common,
    /// Topology path selection; empty selects all tasks
    #[arg(long, default_value = "")]
    path: String,
    /// Include the per-device report
    #[arg(long)]
    detailed: bool,
}

impl DeviceArgs {
    fn params(&self) -> DeviceParams {
        DeviceParams {
            path: self.path.clone(),
            detailed: self.detailed,
        }
    }
}

#[derive(Parser)]
struct PropArgs {
    #[command(flatten)]
    common: Common,
    #[arg(long, default_value = "")]
    path: String,
    /// Property as KEY=VALUE, repeatable
    #[arg(long = "prop", value_name = "KEY=VALUE", required = true)]
    properties: Vec<String>,
}

#[derive(Parser)]
struct DownArgs {
    #[command(flatten)]
    common: Common,
}

#[derive(Parser)]
struct StatusArgs {
    /// Report only partitions with a running session
    #[arg(long)]
    running: bool,
}

#[derive(Parser)]
struct SleepArgs {
    /// Milliseconds to sleep
    #[arg(long, default_value_t = 1000)]
    ms: u64,
}

pub async fn run(controller: Arc<Controller>, cmds: Vec<String>) -> Result<()> {
    println!("Conductor client. Use \".help\" to list available commands.");
    let repl = Repl {
        controller,
        batch: cmds.clone(),
    };

    if !cmds.is_empty() {
        for cmd in &cmds {
            if !repl.process(cmd).await {
                break;
            }
        }
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!(">> ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        let line = line.trim().to_owned();
        if line.is_empty() {
            continue;
        }
        if !repl.process(&line).await {
            break;
        }
    }
    Ok(())
}

struct Repl {
    controller: Arc<Controller>,
    batch: Vec<String>,
}

impl Repl {
    /// Execute one command line; returns `false` on `.quit`.
    async fn process(&self, line: &str) -> bool {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.first().copied() {
            Some(".batch") => {
                if self.batch.is_empty() {
                    println!("no batch commands were given at startup (--cmds)");
                    return true;
                }
                for cmd in self.batch.clone() {
                    let tokens: Vec<&str> = cmd.split_whitespace().collect();
                    if !self.dispatch(&tokens).await {
                        return false;
                    }
                }
                true
            }
            Some(_) => self.dispatch(&tokens).await,
            None => true,
        }
    }

    /// Execute one non-batch command; returns `false` on `.quit`.
    async fn dispatch(&self, tokens: &[&str]) -> bool {
        let Some(cmd) = tokens.first().copied() else {
            return true;
        };
        let tokens = tokens.to_vec();
        match cmd {
            ".quit" => return false,
            ".help" => println!("{HELP}"),
            ".sleep" => {
                if let Some(args) = parse::<SleepArgs>(&tokens) {
                    tokio::time::sleep(Duration::from_millis(args.ms)).await;
                }
            }
            ".batch" => println!("nested .batch is not supported"),
            ".status" => {
                if let Some(args) = parse::<StatusArgs>(&tokens) {
                    let result = self
                        .controller
                        .status(&StatusParams {
                            running: args.running,
                        })
                        .await;
                    print_status(&result);
                }
            }
            ".init" => {
                if let Some(args) = parse::<InitArgs>(&tokens) {
                    let body = RequestBody::Initialize(InitializeParams {
                        session_id: args.session_id.clone(),
                    });
                    self.request(args.common.params(), body).await;
                }
            }
            ".submit" => {
                if let Some(args) = parse::<SubmitArgs>(&tokens) {
                    let body = RequestBody::Submit(SubmitParams {
                        plugin: args.plugin.clone(),
                        resources: args.resources.clone(),
                    });
                    self.request(args.common.params(), body).await;
                }
            }
            ".activate" => {
                if let Some(args) = parse::<TopologyArgs>(&tokens) {
                    let body = RequestBody::Activate(args.topology.params());
                    self.request(args.common.params(), body).await;
                }
            }
            ".update" => {
                if let Some(args) = parse::<TopologyArgs>(&tokens) {
                    let body = RequestBody::Update(args.topology.params());
                    self.request(args.common.params(), body).await;
                }
            }
            ".run" => {
                if let Some(args) = parse::<RunArgs>(&tokens) {
                    let body = RequestBody::Run(RunParams {
                        session_id: String::new(),
                        plugin: args.plugin.clone(),
                        resources: args.resources.clone(),
                        topology: args.topology.params(),
                        extract_topo_resources: args.extract_topo_resources,
                    });
                    self.request(args.common.params(), body).await;
                }
            }
            ".prop" => {
                if let Some(args) = parse::<PropArgs>(&tokens) {
                    let mut properties = Vec::new();
                    for spec in &args.properties {
                        match spec.split_once('=') {
                            Some((key, value)) => {
                                properties.push((key.to_owned(), value.to_owned()))
                            }
                            None => {
                                println!("invalid property {spec:?}, expected KEY=VALUE");
                                return true;
                            }
                        }
                    }
                    let body = RequestBody::SetProperties(SetPropertiesParams {
                        path: args.path.clone(),
                        properties,
                    });
                    self.request(args.common.params(), body).await;
                }
            }
            ".state" => {
                if let Some(args) = parse::<DeviceArgs>(&tokens) {
                    let body = RequestBody::GetState(args.params());
                    self.request(args.common.params(), body).await;
                }
            }
            ".config" => self.device_request(&tokens, RequestBody::Configure).await,
            ".start" => self.device_request(&tokens, RequestBody::Start).await,
            ".stop" => self.device_request(&tokens, RequestBody::Stop).await,
            ".reset" => self.device_request(&tokens, RequestBody::Reset).await,
            ".term" => self.device_request(&tokens, RequestBody::Terminate).await,
            ".down" => {
                if let Some(args) = parse::<DownArgs>(&tokens) {
                    self.request(args.common.params(), RequestBody::Shutdown).await;
                }
            }
            other => println!("unknown command {other:?}, use .help"),
        }
        true
    }

    async fn device_request(&self, tokens: &[&str], make: fn(DeviceParams) -> RequestBody) {
        if let Some(args) = parse::<DeviceArgs>(tokens) {
            self.request(args.common.params(), make(args.params())).await;
        }
    }

    async fn request(&self, common: CommonParams, body: RequestBody) {
        let result = self.controller.exec(Request::new(common, body)).await;
        print_result(&result);
    }
}

fn parse<T: Parser>(tokens: &[&str]) -> Option<T> {
    match T::try_parse_from(tokens.iter().copied()) {
        Ok(args) => Some(args),
        Err(err) => {
            println!("{err}");
            None
        }
    }
}

fn print_result(result: &RequestResult) {
    let status = match result.status {
        RequestStatus::Success => "SUCCESS",
        RequestStatus::Error => "ERROR",
        RequestStatus::Unknown => "UNKNOWN",
    };
    println!(
        "  {status}: {} ({} ms) partition: {}, run: {}, session: {}, state: {}",
        result.msg,
        result.exec_time_ms,
        result.partition_id,
        result.run_nr,
        if result.session_id.is_empty() {
            "-"
        } else {
            result.session_id.as_str()
        },
        result.aggregated,
    );
    if let Some(error) = &result.error {
        println!("  error: {error}");
    }
    if !result.hosts.is_empty() {
        let hosts: Vec<&str> = result.hosts.iter().map(String::as_str).collect();
        println!("  hosts: {}", hosts.join(", "));
    }
    if let Some(devices) = &result.devices {
        println!("  devices ({}):", devices.len());
        for device in devices {
            println!(
                "    {:>8}  {:<18} {:<40} {}",
                device.task_id,
                device.state.to_string(),
                device.path,
                if device.ignored { "ignored" } else { "" }
            );
        }
    }
    if let Some(collections) = &result.collections {
        println!("  collections ({}):", collections.len());
        for collection in collections {
            println!(
                "    {:>8}  {:<18} {}",
                collection.collection_id,
                collection.aggregated.to_string(),
                collection.path
            );
        }
    }
}

fn print_status(result: &StatusResult) {
    println!(
        "  {}: {} ({} ms), partitions: {}",
        match result.status {
            RequestStatus::Success => "SUCCESS",
            RequestStatus::Error => "ERROR",
            RequestStatus::Unknown => "UNKNOWN",
        },
        result.msg,
        result.exec_time_ms,
        result.partitions.len()
    );
    for partition in &result.partitions {
        println!(
            "    {:<16} session: {:<28} {:?} state: {}",
            partition.partition_id,
            if partition.session_id.is_empty() {
                "-"
            } else {
                partition.session_id.as_str()
            },
            partition.session_status,
            partition.aggregated
        );
    }
}
