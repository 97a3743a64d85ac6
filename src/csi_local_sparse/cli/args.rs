/*
 * Copyright (C) 2025 The csi-local-sparse Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::path::PathBuf;

use clap::Parser;

/// CSI driver provisioning node-local volumes backed by sparse image files.
#[derive(Parser, Debug)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct DriverArgs {
    /// Log level: panic, fatal, warn or warning, info, debug
    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable force log format JSON
    #[arg(long = "log-json", env = "LOG_JSON")]
    pub log_json: bool,

    /// Listening socket of grpc-server (only unix socket supported)
    #[arg(long = "grpc-listen-socket", env = "GRPC_LISTEN_SOCKET")]
    pub grpc_listen_socket: String,

    /// Path where sparse files will be stored (must exist)
    #[arg(long = "images-dir", env = "IMAGES_DIR")]
    pub images_dir: PathBuf,

    /// Identifier of the node where this instance is running
    #[arg(long = "node", env = "NODE_ID")]
    pub node: String,

    /// Kubernetes node label that will be used for accessible topology
    #[arg(long = "node-name-topology-key", env = "NODE_NAME_TOPOLOGY_KEY")]
    pub node_name_topology_key: String,

    /// Use direct-io on loop devices
    #[arg(long = "direct-io", env = "DIRECT_IO")]
    pub direct_io: bool,
}
