// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kubewatch")]
#[command(
    author,
    version,
    about = "Watch Kubernetes resources and forward change events to a handler"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Config file (default: $KW_CONFIG/.kubewatch.yaml or ~/.kubewatch.yaml)
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Kubernetes context to use (default: in-cluster, then current context)
    #[arg(long, value_name = "CONTEXT", global = true)]
    pub context: Option<String>,

    /// Namespace to watch; repeatable. Overrides the config file
    #[arg(short, long = "namespace", value_name = "NAMESPACE", global = true)]
    pub namespaces: Vec<String>,

    /// Seconds to wait for each initial cache sync
    #[arg(long, value_name = "SECS", default_value_t = 120, global = true)]
    pub sync_timeout: u64,

    /// Concurrent workers per watched collection
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..), global = true)]
    pub workers: u16,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to rotating files in this directory
    #[arg(long, value_name = "DIR", global = true)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Watch resources and forward events (default)
    Run,

    /// Inspect or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigAction {
    /// Print the effective configuration
    View,

    /// Write a config file listing every resource
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
