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

use std::collections::HashMap;

use tonic::{Request, Response, Status};

use super::constants::{DEFAULT_FS_TYPE, MAX_VOLUMES_PER_NODE};
use super::controller::calculate_volume_size;
use super::plugin::{fail, Plugin};
use super::proto::{
    node_service_capability, volume_capability, volume_usage, Node, NodeExpandVolumeRequest,
    NodeExpandVolumeResponse, NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse,
    NodeGetInfoRequest, NodeGetInfoResponse, NodeGetVolumeStatsRequest,
    NodeGetVolumeStatsResponse, NodePublishVolumeRequest, NodePublishVolumeResponse,
    NodeServiceCapability, NodeStageVolumeRequest, NodeStageVolumeResponse,
    NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest,
    NodeUnstageVolumeResponse, Topology, VolumeUsage,
};
use crate::csi_local_sparse::logger::{log_debug, log_info};
use crate::csi_local_sparse::volumes::{
    is_not_found, is_out_of_capacity, is_unsupported_filesystem,
};

const COMPONENT: &str = "node";

#[tonic::async_trait]
impl Node for Plugin {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let request = request.into_inner();
        let volume_id = request.volume_id;
        log_debug(
            COMPONENT,
            "NodeStageVolume called",
            &[("volume_id", &volume_id)],
        );

        if volume_id.is_empty() {
            return Err(fail(
                "NodeStageVolume",
                Status::invalid_argument("NodeStageVolume invalid argument: volumeId"),
            ));
        }
        if request.staging_target_path.is_empty() {
            return Err(fail(
                "NodeStageVolume",
                Status::invalid_argument(format!(
                    "NodeStageVolume ({volume_id}) invalid argument: stagingTargetPath"
                )),
            ));
        }
        let Some(capability) = request.volume_capability else {
            return Err(fail(
                "NodeStageVolume",
                Status::invalid_argument(format!(
                    "NodeStageVolume ({volume_id}) invalid argument: volumeCapability"
                )),
            ));
        };

        let mount = match capability.access_type {
            Some(volume_capability::AccessType::Mount(mount)) => mount,
            // Block volumes are reserved for a future version.
            _ => {
                return Err(fail(
                    "NodeStageVolume",
                    Status::unimplemented(format!(
                        "NodeStageVolume ({volume_id}) unsupported access type"
                    )),
                ))
            }
        };

        let fs_type = if mount.fs_type.is_empty() {
            DEFAULT_FS_TYPE.to_string()
        } else {
            mount.fs_type
        };

        if let Err(err) = self.volumes.format_if_needed(&volume_id, &fs_type).await {
            let status = if is_not_found(err.as_ref()) {
                Status::not_found(format!(
                    "NodeStageVolume error format volume: volume ({volume_id}) not found"
                ))
            } else if is_unsupported_filesystem(err.as_ref()) {
                Status::invalid_argument(format!(
                    "NodeStageVolume ({volume_id}) error format volume: {err}"
                ))
            } else {
                Status::internal(format!(
                    "NodeStageVolume ({volume_id}) error format volume: {err}"
                ))
            };
            return Err(fail("NodeStageVolume", status));
        }

        let device = match self.volumes.attach_device(&volume_id).await {
            Ok(device) => device,
            Err(err) => {
                let status = if is_not_found(err.as_ref()) {
                    Status::not_found(format!(
                        "NodeStageVolume error attach device: volume ({volume_id}) not found"
                    ))
                } else {
                    Status::internal(format!(
                        "NodeStageVolume ({volume_id}) error attach device: {err}"
                    ))
                };
                return Err(fail("NodeStageVolume", status));
            }
        };

        if let Err(err) = self
            .mounter
            .mount(&device, &request.staging_target_path, &mount.mount_flags)
            .await
        {
            return Err(fail(
                "NodeStageVolume",
                Status::internal(format!(
                    "NodeStageVolume ({volume_id}) error mount target: {err}"
                )),
            ));
        }

        log_info(
            COMPONENT,
            "NodeStageVolume volume was formatted, attached and mounted to staging path",
            &[("volume_id", &volume_id), ("device", &device)],
        );
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let request = request.into_inner();
        let volume_id = request.volume_id;
        log_debug(
            COMPONENT,
            "NodeUnstageVolume called",
            &[("volume_id", &volume_id)],
        );

        if volume_id.is_empty() {
            return Err(fail(
                "NodeUnstageVolume",
                Status::invalid_argument("NodeUnstageVolume invalid argument: volumeId"),
            ));
        }
        if request.staging_target_path.is_empty() {
            return Err(fail(
                "NodeUnstageVolume",
                Status::invalid_argument(format!(
                    "NodeUnstageVolume ({volume_id}) invalid argument: stagingTargetPath"
                )),
            ));
        }

        // Unmount before detach, otherwise the loop device stays busy.
        if let Err(err) = self.mounter.unmount(&request.staging_target_path).await {
            return Err(fail(
                "NodeUnstageVolume",
                Status::internal(format!(
                    "NodeUnstageVolume ({volume_id}) error unmount staging target: {err}"
                )),
            ));
        }

        if let Err(err) = self.volumes.detach_device(&volume_id).await {
            // The image may already be gone when the operator deleted the
            // volume first; the retry path must still converge.
            if is_not_found(err.as_ref()) {
                log_debug(
                    COMPONENT,
                    "Volume image already absent, nothing to detach",
                    &[("volume_id", &volume_id)],
                );
            } else {
                return Err(fail(
                    "NodeUnstageVolume",
                    Status::internal(format!(
                        "NodeUnstageVolume ({volume_id}) error detach device: {err}"
                    )),
                ));
            }
        }

        log_info(
            COMPONENT,
            "NodeUnstageVolume volume was unmounted and detached",
            &[("volume_id", &volume_id)],
        );
        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let request = request.into_inner();
        let volume_id = request.volume_id;
        log_debug(
            COMPONENT,
            "NodePublishVolume called",
            &[("volume_id", &volume_id)],
        );

        if volume_id.is_empty() {
            return Err(fail(
                "NodePublishVolume",
                Status::invalid_argument("NodePublishVolume invalid argument: volumeId"),
            ));
        }
        if request.staging_target_path.is_empty() {
            return Err(fail(
                "NodePublishVolume",
                Status::invalid_argument(format!(
                    "NodePublishVolume ({volume_id}) invalid argument: stagingTargetPath"
                )),
            ));
        }
        if request.target_path.is_empty() {
            return Err(fail(
                "NodePublishVolume",
                Status::invalid_argument(format!(
                    "NodePublishVolume ({volume_id}) invalid argument: targetPath"
                )),
            ));
        }
        let Some(capability) = request.volume_capability else {
            return Err(fail(
                "NodePublishVolume",
                Status::invalid_argument(format!(
                    "NodePublishVolume ({volume_id}) invalid argument: volumeCapability"
                )),
            ));
        };

        let mount = match capability.access_type {
            Some(volume_capability::AccessType::Mount(mount)) => mount,
            _ => {
                return Err(fail(
                    "NodePublishVolume",
                    Status::invalid_argument(format!(
                        "NodePublishVolume ({volume_id}) unsupported access type"
                    )),
                ))
            }
        };

        let mut options = vec!["bind".to_string()];
        if request.readonly {
            options.push("ro".to_string());
        }
        options.extend(mount.mount_flags);

        if let Err(err) = self
            .mounter
            .mount(&request.staging_target_path, &request.target_path, &options)
            .await
        {
            return Err(fail(
                "NodePublishVolume",
                Status::internal(format!(
                    "NodePublishVolume ({volume_id}) error mount volume: {err}"
                )),
            ));
        }

        log_info(
            COMPONENT,
            "NodePublishVolume volume was mounted to target path",
            &[("volume_id", &volume_id)],
        );
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let request = request.into_inner();
        let volume_id = request.volume_id;
        log_debug(
            COMPONENT,
            "NodeUnpublishVolume called",
            &[("volume_id", &volume_id)],
        );

        if volume_id.is_empty() {
            return Err(fail(
                "NodeUnpublishVolume",
                Status::invalid_argument("NodeUnpublishVolume invalid argument: volumeId"),
            ));
        }
        if request.target_path.is_empty() {
            return Err(fail(
                "NodeUnpublishVolume",
                Status::invalid_argument(format!(
                    "NodeUnpublishVolume ({volume_id}) invalid argument: targetPath"
                )),
            ));
        }

        if let Err(err) = self.mounter.unmount(&request.target_path).await {
            return Err(fail(
                "NodeUnpublishVolume",
                Status::internal(format!(
                    "NodeUnpublishVolume ({volume_id}) error unmount volume: {err}"
                )),
            ));
        }

        log_info(
            COMPONENT,
            "NodeUnpublishVolume target path was unmounted",
            &[("volume_id", &volume_id)],
        );
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        let request = request.into_inner();
        let volume_id = request.volume_id;
        log_debug(
            COMPONENT,
            "NodeGetVolumeStats called",
            &[("volume_id", &volume_id)],
        );

        if volume_id.is_empty() {
            return Err(fail(
                "NodeGetVolumeStats",
                Status::invalid_argument("NodeGetVolumeStats invalid argument: volumeId"),
            ));
        }
        let path = request.volume_path;
        if path.is_empty() {
            return Err(fail(
                "NodeGetVolumeStats",
                Status::invalid_argument("NodeGetVolumeStats invalid argument: volumePath"),
            ));
        }

        let is_mounted = self.mounter.is_mounted(&path).await.map_err(|err| {
            fail(
                "NodeGetVolumeStats",
                Status::internal(format!(
                    "NodeGetVolumeStats ({volume_id}) error check if volume is mounted: {err}"
                )),
            )
        })?;
        if !is_mounted {
            return Err(fail(
                "NodeGetVolumeStats",
                Status::not_found(format!("NodeGetVolumeStats path ({path}) is not mounted")),
            ));
        }

        let stats = self.volumes.volume_stats(&path).await.map_err(|err| {
            fail(
                "NodeGetVolumeStats",
                Status::internal(format!(
                    "NodeGetVolumeStats ({volume_id}) error get volume stats: {err}"
                )),
            )
        })?;

        log_info(
            COMPONENT,
            "NodeGetVolumeStats send volume statistics",
            &[("volume_id", &volume_id)],
        );
        Ok(Response::new(NodeGetVolumeStatsResponse {
            usage: vec![
                VolumeUsage {
                    available: stats.available_bytes,
                    total: stats.total_bytes,
                    used: stats.used_bytes,
                    unit: volume_usage::Unit::Bytes as i32,
                },
                VolumeUsage {
                    available: stats.available_inodes,
                    total: stats.total_inodes,
                    used: stats.used_inodes,
                    unit: volume_usage::Unit::Inodes as i32,
                },
            ],
        }))
    }

    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        let request = request.into_inner();
        let volume_id = request.volume_id;
        log_debug(
            COMPONENT,
            "NodeExpandVolume called",
            &[("volume_id", &volume_id)],
        );

        if volume_id.is_empty() {
            return Err(fail(
                "NodeExpandVolume",
                Status::invalid_argument("NodeExpandVolume invalid argument: volumeId"),
            ));
        }

        // The capability is optional on expand; when present it must be a
        // mount volume.
        if let Some(capability) = &request.volume_capability {
            match capability.access_type {
                Some(volume_capability::AccessType::Mount(_)) => {}
                _ => {
                    return Err(fail(
                        "NodeExpandVolume",
                        Status::unimplemented(format!(
                            "NodeExpandVolume ({volume_id}) unsupported access type"
                        )),
                    ))
                }
            }
        }

        let size = calculate_volume_size(request.capacity_range.as_ref()).map_err(|err| {
            fail(
                "NodeExpandVolume",
                Status::out_of_range(format!(
                    "NodeExpandVolume ({volume_id}) invalid argument: capacityRange: {err}"
                )),
            )
        })?;

        if let Err(err) = self.volumes.expand_volume_size(&volume_id, size).await {
            let status = if is_not_found(err.as_ref()) {
                Status::not_found(format!(
                    "NodeExpandVolume error expand volume size: volume ({volume_id}) not found"
                ))
            } else if is_out_of_capacity(err.as_ref()) {
                Status::resource_exhausted(format!(
                    "NodeExpandVolume ({volume_id}) error expand volume size: {err}"
                ))
            } else {
                Status::internal(format!(
                    "NodeExpandVolume ({volume_id}) error expand volume size: {err}"
                ))
            };
            return Err(fail("NodeExpandVolume", status));
        }

        if let Err(err) = self.volumes.resize_device_filesystem(&volume_id).await {
            let status = if is_not_found(err.as_ref()) {
                Status::not_found(format!(
                    "NodeExpandVolume error resize filesystem: volume ({volume_id}) not found"
                ))
            } else {
                Status::internal(format!(
                    "NodeExpandVolume ({volume_id}) error resize filesystem: {err}"
                ))
            };
            return Err(fail("NodeExpandVolume", status));
        }

        log_info(
            COMPONENT,
            "NodeExpandVolume volume was expanded",
            &[("volume_id", &volume_id), ("size", &size.to_string())],
        );
        Ok(Response::new(NodeExpandVolumeResponse {
            capacity_bytes: size,
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        log_debug(COMPONENT, "NodeGetCapabilities called", &[]);

        let rpc_capability = |rpc_type: node_service_capability::rpc::Type| NodeServiceCapability {
            r#type: Some(node_service_capability::Type::Rpc(
                node_service_capability::Rpc {
                    r#type: rpc_type as i32,
                },
            )),
        };

        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: vec![
                rpc_capability(node_service_capability::rpc::Type::StageUnstageVolume),
                rpc_capability(node_service_capability::rpc::Type::ExpandVolume),
                rpc_capability(node_service_capability::rpc::Type::GetVolumeStats),
            ],
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        log_debug(COMPONENT, "NodeGetInfo called", &[]);

        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: MAX_VOLUMES_PER_NODE,
            accessible_topology: Some(Topology {
                segments: HashMap::from([(
                    self.node_name_topology_key.clone(),
                    self.node_id.clone(),
                )]),
            }),
        }))
    }
}
