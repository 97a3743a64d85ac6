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
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tonic::Status;

use super::proto::{ControllerServer, IdentityServer, NodeServer};
use crate::csi_local_sparse::logger::{log_error, log_info};
use crate::csi_local_sparse::util::error::{new_error, with_context, DynError};
use crate::csi_local_sparse::volumes::{Mounter, VolumeController};

const COMPONENT: &str = "plugin";

/// CSI plugin serving the identity, controller and node services over one
/// unix domain socket. Holds no volume state of its own: everything is
/// delegated to the volume controller and the mounter, which re-query the
/// kernel on each call.
#[derive(Clone)]
pub struct Plugin {
    pub(super) node_id: String,
    pub(super) node_name_topology_key: String,
    pub(super) volumes: Arc<dyn VolumeController>,
    pub(super) mounter: Arc<dyn Mounter>,
}

impl Plugin {
    pub fn new(
        node_id: String,
        node_name_topology_key: String,
        volumes: Arc<dyn VolumeController>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            node_id,
            node_name_topology_key,
            volumes,
            mounter,
        }
    }

    /// Binds the listen socket and serves until `shutdown` resolves, then
    /// drains in-flight RPCs before returning.
    pub async fn serve(
        self,
        socket_url: &str,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), DynError> {
        let socket_path = socket_path_from_url(socket_url)?;

        // A previous run may have left its socket file behind.
        match std::fs::remove_file(&socket_path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(with_context(
                    err,
                    format!(
                        "failed to remove unix socket ({})",
                        socket_path.display()
                    ),
                ))
            }
        }

        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| with_context(e, "failed to listen socket"))?;

        log_info(
            COMPONENT,
            "Serving CSI services",
            &[("socket", &socket_path.display().to_string())],
        );

        Server::builder()
            .add_service(IdentityServer::new(self.clone()))
            .add_service(ControllerServer::new(self.clone()))
            .add_service(NodeServer::new(self))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
            .await
            .map_err(|e| with_context(e, "grpc server failed"))
    }
}

/// Logs a failed RPC before it is returned to the caller. Every handler
/// routes its error statuses through here, which stands in for a
/// server-wide unary interceptor.
pub(super) fn fail(method: &str, status: Status) -> Status {
    log_error(
        COMPONENT,
        "method failed",
        &[
            ("method", method),
            ("code", &format!("{:?}", status.code())),
            ("error", status.message()),
        ],
    );
    status
}

/// Extracts the filesystem path from a `unix://` socket URL. Any other
/// scheme is rejected.
pub fn socket_path_from_url(socket_url: &str) -> Result<PathBuf, DynError> {
    let path = socket_url.strip_prefix("unix://").ok_or_else(|| {
        new_error(format!(
            "only unix domain sockets are supported, but {socket_url} given"
        ))
    })?;
    if path.is_empty() {
        return Err(new_error("grpc listen socket path can't be empty"));
    }
    Ok(PathBuf::from(path))
}
