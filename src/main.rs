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

use std::future::Future;
use std::panic;
use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};

use csi_local_sparse::csi_local_sparse::cli::DriverArgs;
use csi_local_sparse::csi_local_sparse::csi::Plugin;
use csi_local_sparse::csi_local_sparse::logger::{
    log_error, log_info, parse_level, set_log_format, set_log_level, LogFormat,
};
use csi_local_sparse::csi_local_sparse::util::error::{with_context, DynError};
use csi_local_sparse::csi_local_sparse::volumes::{LinuxMounter, SparseFileVolumeController};

const COMPONENT: &str = "main";

#[tokio::main]
async fn main() {
    let args = DriverArgs::parse();

    set_log_format(if args.log_json {
        LogFormat::Json
    } else {
        LogFormat::Text
    });
    match parse_level(&args.log_level) {
        Ok(level) => set_log_level(level),
        Err(err) => {
            log_error(
                COMPONENT,
                "Failed to parse config",
                &[("error", &err.to_string())],
            );
            exit(1);
        }
    }

    panic::set_hook(Box::new(|info| {
        log_error(
            COMPONENT,
            "recovered from panic, but application will be terminated",
            &[("panic", &info.to_string())],
        );
    }));

    if !args.images_dir.is_dir() {
        log_error(
            COMPONENT,
            "Images directory must be an existing directory",
            &[("images_dir", &args.images_dir.display().to_string())],
        );
        exit(1);
    }

    let volumes = Arc::new(SparseFileVolumeController::new(
        args.images_dir.clone(),
        args.direct_io,
    ));
    let mounter = Arc::new(LinuxMounter::new());
    let plugin = Plugin::new(
        args.node.clone(),
        args.node_name_topology_key.clone(),
        volumes,
        mounter,
    );

    let shutdown = match shutdown_signal() {
        Ok(shutdown) => shutdown,
        Err(err) => {
            log_error(
                COMPONENT,
                "Failed to install signal handlers",
                &[("error", &err.to_string())],
            );
            exit(1);
        }
    };

    if let Err(err) = plugin.serve(&args.grpc_listen_socket, shutdown).await {
        log_error(COMPONENT, "Error run plugin", &[("error", &err.to_string())]);
        exit(1);
    }
}

/// Resolves once the process receives SIGINT, SIGTERM or SIGQUIT; the
/// server then drains in-flight RPCs and stops.
fn shutdown_signal() -> Result<impl Future<Output = ()> + Send, DynError> {
    let mut interrupt =
        signal(SignalKind::interrupt()).map_err(|e| with_context(e, "register SIGINT handler"))?;
    let mut terminate =
        signal(SignalKind::terminate()).map_err(|e| with_context(e, "register SIGTERM handler"))?;
    let mut quit =
        signal(SignalKind::quit()).map_err(|e| with_context(e, "register SIGQUIT handler"))?;

    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
            _ = quit.recv() => {}
        }
        log_info(
            COMPONENT,
            "Received exit signal! Initialize graceful shutdown",
            &[],
        );
    })
}
