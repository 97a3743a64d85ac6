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

use super::constants::{DEFAULT_VOLUME_SIZE, MAXIMUM_VOLUME_SIZE, MINIMUM_VOLUME_SIZE};
use super::plugin::{fail, Plugin};
use super::proto::{
    controller_service_capability, volume_capability, CapacityRange, Controller,
    ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerServiceCapability, CreateVolumeRequest, CreateVolumeResponse, DeleteVolumeRequest,
    DeleteVolumeResponse, GetCapacityRequest, GetCapacityResponse, Topology, Volume,
};
use crate::csi_local_sparse::logger::{log_debug, log_error, log_info, log_warn};
use crate::csi_local_sparse::util::error::{new_error, DynError};
use crate::csi_local_sparse::volumes::is_not_found;

const COMPONENT: &str = "controller";

/// Resolves a capacity range to a concrete byte count. Fields are treated
/// as set only when positive; the limit wins when both bounds are set and
/// differ, being the tightest size that still satisfies the request.
pub(super) fn calculate_volume_size(range: Option<&CapacityRange>) -> Result<i64, DynError> {
    let Some(range) = range else {
        return Ok(DEFAULT_VOLUME_SIZE);
    };

    let required = range.required_bytes;
    let required_set = required > 0;
    let limit = range.limit_bytes;
    let limit_set = limit > 0;

    if !required_set && !limit_set {
        return Ok(DEFAULT_VOLUME_SIZE);
    }

    if required_set && limit_set && limit < required {
        return Err(new_error(format!(
            "limit ({limit}) can't be less than required ({required}) size"
        )));
    }

    if required_set && required < MINIMUM_VOLUME_SIZE {
        return Err(new_error(format!(
            "required ({required}) can't be less than minimum supported volume size ({MINIMUM_VOLUME_SIZE})"
        )));
    }

    if limit_set && limit < MINIMUM_VOLUME_SIZE {
        return Err(new_error(format!(
            "limit ({limit}) can't be less than minimum supported volume size ({MINIMUM_VOLUME_SIZE})"
        )));
    }

    if required_set && required > MAXIMUM_VOLUME_SIZE {
        return Err(new_error(format!(
            "required ({required}) can't be greater than maximum supported volume size ({MAXIMUM_VOLUME_SIZE})"
        )));
    }

    if limit_set && limit > MAXIMUM_VOLUME_SIZE {
        return Err(new_error(format!(
            "limit ({limit}) can't be greater than maximum supported volume size ({MAXIMUM_VOLUME_SIZE})"
        )));
    }

    if required_set && limit_set && required == limit {
        return Ok(limit);
    }

    if limit_set {
        return Ok(limit);
    }

    if required_set {
        return Ok(required);
    }

    Ok(DEFAULT_VOLUME_SIZE)
}

#[tonic::async_trait]
impl Controller for Plugin {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let request = request.into_inner();
        let volume_id = request.name.clone();
        log_debug(COMPONENT, "CreateVolume called", &[("volume_id", &volume_id)]);

        if volume_id.is_empty() {
            return Err(fail(
                "CreateVolume",
                Status::invalid_argument("CreateVolume invalid argument: name"),
            ));
        }

        if request.volume_capabilities.is_empty() {
            return Err(fail(
                "CreateVolume",
                Status::invalid_argument(format!(
                    "CreateVolume ({volume_id}) invalid argument: volumeCapabilities"
                )),
            ));
        }

        for capability in &request.volume_capabilities {
            // Only ReadWriteOnce volumes are supported.
            let mode = capability
                .access_mode
                .as_ref()
                .map(|access_mode| access_mode.mode())
                .unwrap_or(volume_capability::access_mode::Mode::Unknown);
            if mode != volume_capability::access_mode::Mode::SingleNodeWriter {
                return Err(fail(
                    "CreateVolume",
                    Status::invalid_argument(format!(
                        "CreateVolume ({volume_id}) unsupported access mode: {}",
                        mode.as_str_name()
                    )),
                ));
            }

            match capability.access_type {
                Some(volume_capability::AccessType::Mount(_)) => {}
                // Block volumes are reserved for a future version.
                _ => {
                    return Err(fail(
                        "CreateVolume",
                        Status::invalid_argument(format!(
                            "CreateVolume ({volume_id}) unsupported access type"
                        )),
                    ))
                }
            }
        }

        // In strict topology mode the external-provisioner pins preferred,
        // requisite and the selected node to the same single segment.
        let preferred = request
            .accessibility_requirements
            .as_ref()
            .map(|requirements| requirements.preferred.as_slice())
            .unwrap_or(&[]);
        if preferred.is_empty() {
            log_error(
                COMPONENT,
                "No preferred topology set. Make sure that external-provisioner runs with --strict-topology flag.",
                &[("volume_id", &volume_id)],
            );
            return Err(fail(
                "CreateVolume",
                Status::invalid_argument(format!(
                    "CreateVolume ({volume_id}) invalid argument: no preferred topology set"
                )),
            ));
        }

        let node_name = match preferred[0].segments.get(&self.node_name_topology_key) {
            Some(node_name) => node_name.clone(),
            None => {
                return Err(fail(
                    "CreateVolume",
                    Status::invalid_argument(format!(
                        "CreateVolume ({volume_id}) topology key ({}) not found",
                        self.node_name_topology_key
                    )),
                ))
            }
        };

        // Volumes are node-local; a preferred segment naming another node
        // can never be served from here.
        if node_name != self.node_id {
            return Err(fail(
                "CreateVolume",
                Status::invalid_argument(format!(
                    "CreateVolume ({volume_id}) topology key ({}) selects node ({node_name}), but this instance runs on node ({})",
                    self.node_name_topology_key, self.node_id
                )),
            ));
        }

        let size = calculate_volume_size(request.capacity_range.as_ref()).map_err(|err| {
            fail(
                "CreateVolume",
                Status::out_of_range(format!(
                    "CreateVolume ({volume_id}) invalid argument: capacityRange: {err}"
                )),
            )
        })?;

        if let Err(err) = self.volumes.create(&volume_id, size).await {
            return Err(fail(
                "CreateVolume",
                Status::internal(format!(
                    "CreateVolume ({volume_id}) error create volume: {err}"
                )),
            ));
        }

        log_info(COMPONENT, "Volume was created", &[("volume_id", &volume_id)]);
        Ok(Response::new(CreateVolumeResponse {
            volume: Some(Volume {
                capacity_bytes: size,
                volume_id,
                volume_context: HashMap::new(),
                accessible_topology: vec![Topology {
                    segments: HashMap::from([(
                        self.node_name_topology_key.clone(),
                        node_name,
                    )]),
                }],
            }),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let request = request.into_inner();
        let volume_id = request.volume_id;
        log_debug(COMPONENT, "DeleteVolume called", &[("volume_id", &volume_id)]);

        if volume_id.is_empty() {
            return Err(fail(
                "DeleteVolume",
                Status::invalid_argument("DeleteVolume invalid argument: volumeId"),
            ));
        }

        // The orchestrator unstages before deleting; if a loop device is
        // still bound the image is removed anyway and the association dies
        // with the kernel object.
        match self.volumes.device_by_volume_id(&volume_id).await {
            Ok(device) if !device.is_empty() => {
                log_warn(
                    COMPONENT,
                    "Deleting volume that still has an attached loop device",
                    &[("volume_id", &volume_id), ("device", &device)],
                );
            }
            _ => {}
        }

        if let Err(err) = self.volumes.delete(&volume_id).await {
            if is_not_found(err.as_ref()) {
                log_info(
                    COMPONENT,
                    "Assuming volume is already deleted because it does not exist",
                    &[("volume_id", &volume_id)],
                );
                return Ok(Response::new(DeleteVolumeResponse {}));
            }

            return Err(fail(
                "DeleteVolume",
                Status::internal(format!(
                    "DeleteVolume ({volume_id}) error delete volume: {err}"
                )),
            ));
        }

        log_info(COMPONENT, "Volume was deleted", &[("volume_id", &volume_id)]);
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    async fn get_capacity(
        &self,
        _request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        log_debug(COMPONENT, "GetCapacity called", &[]);

        let available_capacity = self.volumes.capacity().await.map_err(|err| {
            fail(
                "GetCapacity",
                Status::internal(format!("GetCapacity error get capacity: {err}")),
            )
        })?;

        log_info(
            COMPONENT,
            "Send available capacity",
            &[("available_capacity", &available_capacity.to_string())],
        );
        Ok(Response::new(GetCapacityResponse {
            available_capacity,
            maximum_volume_size: Some(MAXIMUM_VOLUME_SIZE),
            minimum_volume_size: Some(MINIMUM_VOLUME_SIZE),
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        log_debug(COMPONENT, "ControllerGetCapabilities called", &[]);

        let rpc_capability = |rpc_type: controller_service_capability::rpc::Type| {
            ControllerServiceCapability {
                r#type: Some(controller_service_capability::Type::Rpc(
                    controller_service_capability::Rpc {
                        r#type: rpc_type as i32,
                    },
                )),
            }
        };

        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: vec![
                rpc_capability(controller_service_capability::rpc::Type::CreateDeleteVolume),
                rpc_capability(controller_service_capability::rpc::Type::GetCapacity),
                rpc_capability(controller_service_capability::rpc::Type::ExpandVolume),
            ],
        }))
    }

    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        let request = request.into_inner();
        let volume_id = request.volume_id;
        log_debug(
            COMPONENT,
            "ControllerExpandVolume called",
            &[("volume_id", &volume_id)],
        );

        if volume_id.is_empty() {
            return Err(fail(
                "ControllerExpandVolume",
                Status::invalid_argument("ControllerExpandVolume invalid argument: volumeId"),
            ));
        }

        let size = calculate_volume_size(request.capacity_range.as_ref()).map_err(|err| {
            fail(
                "ControllerExpandVolume",
                Status::out_of_range(format!(
                    "ControllerExpandVolume ({volume_id}) invalid argument: capacityRange: {err}"
                )),
            )
        })?;

        // The image itself grows on the node; this side only acknowledges
        // the new size and requests node expansion.
        Ok(Response::new(ControllerExpandVolumeResponse {
            capacity_bytes: size,
            node_expansion_required: true,
        }))
    }
}
