//! Conformance tests driving the RPC façade through the generated service
//! traits. Host interactions run against a scratch images directory where
//! they are root-free (create/delete/expand); loop attachment and the
//! mount table go through the in-memory fakes.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use tempfile::TempDir;
use tonic::{Code, Request};

use csi_local_sparse::csi_local_sparse::csi::constants::{
    DEFAULT_VOLUME_SIZE, MAXIMUM_VOLUME_SIZE, MAX_VOLUMES_PER_NODE, MINIMUM_VOLUME_SIZE,
    PLUGIN_NAME, PLUGIN_VERSION,
};
use csi_local_sparse::csi_local_sparse::csi::proto::{
    controller_service_capability, node_service_capability, plugin_capability, volume_capability,
    volume_usage, CapacityRange, Controller, ControllerExpandVolumeRequest,
    ControllerGetCapabilitiesRequest, CreateVolumeRequest, DeleteVolumeRequest,
    GetCapacityRequest, GetPluginCapabilitiesRequest, GetPluginInfoRequest, Identity, Node,
    NodeExpandVolumeRequest, NodeGetCapabilitiesRequest, NodeGetInfoRequest,
    NodeGetVolumeStatsRequest, NodePublishVolumeRequest, NodeStageVolumeRequest,
    NodeUnpublishVolumeRequest, NodeUnstageVolumeRequest, ProbeRequest, Topology,
    TopologyRequirement, VolumeCapability,
};
use csi_local_sparse::csi_local_sparse::csi::Plugin;
use csi_local_sparse::csi_local_sparse::volumes::{
    Mounter, SparseFileVolumeController, VolumeController,
};

use crate::support::{FakeVolumeController, RecordingMounter};

const NODE_ID: &str = "n1";
const TOPOLOGY_KEY: &str = "kubernetes.io/hostname";
const GIB: i64 = 1 << 30;

fn plugin(volumes: Arc<dyn VolumeController>, mounter: Arc<dyn Mounter>) -> Plugin {
    Plugin::new(NODE_ID.to_string(), TOPOLOGY_KEY.to_string(), volumes, mounter)
}

fn mount_capability(fs_type: &str) -> VolumeCapability {
    VolumeCapability {
        access_type: Some(volume_capability::AccessType::Mount(
            volume_capability::MountVolume {
                fs_type: fs_type.to_string(),
                ..Default::default()
            },
        )),
        access_mode: Some(volume_capability::AccessMode {
            mode: volume_capability::access_mode::Mode::SingleNodeWriter as i32,
        }),
    }
}

fn block_capability() -> VolumeCapability {
    VolumeCapability {
        access_type: Some(volume_capability::AccessType::Block(
            volume_capability::BlockVolume {},
        )),
        access_mode: Some(volume_capability::AccessMode {
            mode: volume_capability::access_mode::Mode::SingleNodeWriter as i32,
        }),
    }
}

fn preferred_topology(node: &str) -> TopologyRequirement {
    TopologyRequirement {
        preferred: vec![Topology {
            segments: HashMap::from([(TOPOLOGY_KEY.to_string(), node.to_string())]),
        }],
        ..Default::default()
    }
}

fn create_request(name: &str, node: &str) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: name.to_string(),
        volume_capabilities: vec![mount_capability("")],
        accessibility_requirements: Some(preferred_topology(node)),
        ..Default::default()
    }
}

#[tokio::test]
async fn create_volume_defaults_to_one_gib_and_pins_topology() {
    let dir = TempDir::new().expect("tempdir");
    let volumes = Arc::new(SparseFileVolumeController::new(
        dir.path().to_path_buf(),
        false,
    ));
    let plugin = plugin(volumes, Arc::new(RecordingMounter::new()));

    let response = plugin
        .create_volume(Request::new(create_request("vol-a", NODE_ID)))
        .await
        .expect("create volume")
        .into_inner();

    let volume = response.volume.expect("volume in response");
    assert_eq!(volume.volume_id, "vol-a");
    assert_eq!(volume.capacity_bytes, 1_073_741_824);
    assert_eq!(volume.accessible_topology.len(), 1);
    assert_eq!(
        volume.accessible_topology[0].segments.get(TOPOLOGY_KEY),
        Some(&NODE_ID.to_string())
    );

    let image = dir.path().join("vol-a.img");
    assert_eq!(fs::metadata(image).expect("image").len(), 1_073_741_824);
}

#[tokio::test]
async fn create_volume_is_idempotent() {
    let dir = TempDir::new().expect("tempdir");
    let volumes = Arc::new(SparseFileVolumeController::new(
        dir.path().to_path_buf(),
        false,
    ));
    let plugin = plugin(volumes, Arc::new(RecordingMounter::new()));

    for _ in 0..3 {
        let response = plugin
            .create_volume(Request::new(create_request("vol-a", NODE_ID)))
            .await
            .expect("create volume")
            .into_inner();
        assert_eq!(
            response.volume.expect("volume").capacity_bytes,
            DEFAULT_VOLUME_SIZE
        );
    }

    let entries: Vec<_> = fs::read_dir(dir.path())
        .expect("read images dir")
        .collect();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn create_volume_rejects_foreign_topology() {
    let plugin = plugin(
        Arc::new(FakeVolumeController::new(GIB)),
        Arc::new(RecordingMounter::new()),
    );

    let status = plugin
        .create_volume(Request::new(create_request("vol-a", "n2")))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains(TOPOLOGY_KEY));
}

#[tokio::test]
async fn create_volume_requires_name_capabilities_and_topology() {
    let plugin = plugin(
        Arc::new(FakeVolumeController::new(GIB)),
        Arc::new(RecordingMounter::new()),
    );

    let status = plugin
        .create_volume(Request::new(create_request("", NODE_ID)))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let mut no_capabilities = create_request("vol-a", NODE_ID);
    no_capabilities.volume_capabilities.clear();
    let status = plugin
        .create_volume(Request::new(no_capabilities))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let mut no_topology = create_request("vol-a", NODE_ID);
    no_topology.accessibility_requirements = None;
    let status = plugin
        .create_volume(Request::new(no_topology))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("preferred topology"));
}

#[tokio::test]
async fn create_volume_rejects_block_and_shared_access() {
    let plugin = plugin(
        Arc::new(FakeVolumeController::new(GIB)),
        Arc::new(RecordingMounter::new()),
    );

    let mut block = create_request("vol-a", NODE_ID);
    block.volume_capabilities = vec![block_capability()];
    let status = plugin.create_volume(Request::new(block)).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let mut shared = create_request("vol-a", NODE_ID);
    shared.volume_capabilities = vec![VolumeCapability {
        access_mode: Some(volume_capability::AccessMode {
            mode: volume_capability::access_mode::Mode::MultiNodeMultiWriter as i32,
        }),
        ..mount_capability("")
    }];
    let status = plugin.create_volume(Request::new(shared)).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("access mode"));
}

#[tokio::test]
async fn create_volume_honors_capacity_range() {
    let dir = TempDir::new().expect("tempdir");
    let volumes = Arc::new(SparseFileVolumeController::new(
        dir.path().to_path_buf(),
        false,
    ));
    let plugin = plugin(volumes, Arc::new(RecordingMounter::new()));

    let mut request = create_request("vol-big", NODE_ID);
    request.capacity_range = Some(CapacityRange {
        required_bytes: 5 * GIB,
        limit_bytes: 0,
    });
    let response = plugin
        .create_volume(Request::new(request))
        .await
        .expect("create volume")
        .into_inner();
    assert_eq!(response.volume.expect("volume").capacity_bytes, 5 * GIB);
    assert_eq!(
        fs::metadata(dir.path().join("vol-big.img"))
            .expect("image")
            .len(),
        (5 * GIB) as u64
    );
}

#[tokio::test]
async fn create_volume_rejects_invalid_capacity_range() {
    let plugin = plugin(
        Arc::new(FakeVolumeController::new(GIB)),
        Arc::new(RecordingMounter::new()),
    );

    let mut request = create_request("vol-a", NODE_ID);
    request.capacity_range = Some(CapacityRange {
        required_bytes: 2 * GIB,
        limit_bytes: GIB,
    });
    let status = plugin
        .create_volume(Request::new(request))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::OutOfRange);
}

#[tokio::test]
async fn delete_volume_is_idempotent() {
    let dir = TempDir::new().expect("tempdir");
    let volumes = Arc::new(SparseFileVolumeController::new(
        dir.path().to_path_buf(),
        false,
    ));
    let plugin = plugin(volumes, Arc::new(RecordingMounter::new()));

    plugin
        .create_volume(Request::new(create_request("vol-a", NODE_ID)))
        .await
        .expect("create volume");

    for _ in 0..2 {
        plugin
            .delete_volume(Request::new(DeleteVolumeRequest {
                volume_id: "vol-a".to_string(),
                ..Default::default()
            }))
            .await
            .expect("delete volume");
        assert!(!dir.path().join("vol-a.img").exists());
    }
}

#[tokio::test]
async fn delete_volume_succeeds_while_staged_and_unstage_still_converges() {
    let volumes = Arc::new(
        FakeVolumeController::new(GIB)
            .with_image("vol-a", GIB)
            .with_attached("vol-a", "/dev/loop0"),
    );
    let mounter = Arc::new(RecordingMounter::new());
    mounter
        .mount("/dev/loop0", "/stage/vol-a", &[])
        .await
        .expect("seed staging mount");
    let plugin = plugin(volumes.clone(), mounter.clone());

    // Deleting out of order is allowed: the image goes away even though
    // the loop device is still bound.
    plugin
        .delete_volume(Request::new(DeleteVolumeRequest {
            volume_id: "vol-a".to_string(),
            ..Default::default()
        }))
        .await
        .expect("delete while staged");
    assert!(volumes.images.lock().unwrap().is_empty());
    assert!(volumes.attached.lock().unwrap().contains_key("vol-a"));

    // The late unstage unmounts the staging path and treats the missing
    // image as already detached.
    plugin
        .node_unstage_volume(Request::new(NodeUnstageVolumeRequest {
            volume_id: "vol-a".to_string(),
            staging_target_path: "/stage/vol-a".to_string(),
        }))
        .await
        .expect("unstage after delete");
    assert!(!mounter.is_mounted("/stage/vol-a").await.expect("query"));
}

#[tokio::test]
async fn get_capacity_reports_pool_and_size_bounds() {
    let dir = TempDir::new().expect("tempdir");
    let volumes = Arc::new(SparseFileVolumeController::new(
        dir.path().to_path_buf(),
        false,
    ));
    let plugin = plugin(volumes, Arc::new(RecordingMounter::new()));

    let response = plugin
        .get_capacity(Request::new(GetCapacityRequest::default()))
        .await
        .expect("get capacity")
        .into_inner();
    assert!(response.available_capacity > 0);
    assert_eq!(response.minimum_volume_size, Some(MINIMUM_VOLUME_SIZE));
    assert_eq!(response.maximum_volume_size, Some(MAXIMUM_VOLUME_SIZE));
}

#[tokio::test]
async fn controller_expand_acknowledges_and_defers_to_node() {
    let plugin = plugin(
        Arc::new(FakeVolumeController::new(GIB)),
        Arc::new(RecordingMounter::new()),
    );

    let response = plugin
        .controller_expand_volume(Request::new(ControllerExpandVolumeRequest {
            volume_id: "vol-a".to_string(),
            capacity_range: Some(CapacityRange {
                required_bytes: 5 * GIB,
                limit_bytes: 0,
            }),
            ..Default::default()
        }))
        .await
        .expect("controller expand")
        .into_inner();
    assert_eq!(response.capacity_bytes, 5 * GIB);
    assert!(response.node_expansion_required);
}

#[tokio::test]
async fn controller_capabilities_cover_create_capacity_and_expand() {
    let plugin = plugin(
        Arc::new(FakeVolumeController::new(GIB)),
        Arc::new(RecordingMounter::new()),
    );

    let response = plugin
        .controller_get_capabilities(Request::new(ControllerGetCapabilitiesRequest::default()))
        .await
        .expect("capabilities")
        .into_inner();

    let mut advertised: Vec<i32> = response
        .capabilities
        .iter()
        .filter_map(|capability| match &capability.r#type {
            Some(controller_service_capability::Type::Rpc(rpc)) => Some(rpc.r#type),
            None => None,
        })
        .collect();
    advertised.sort();
    let mut expected = vec![
        controller_service_capability::rpc::Type::CreateDeleteVolume as i32,
        controller_service_capability::rpc::Type::GetCapacity as i32,
        controller_service_capability::rpc::Type::ExpandVolume as i32,
    ];
    expected.sort();
    assert_eq!(advertised, expected);
}

#[tokio::test]
async fn stage_and_publish_are_idempotent() {
    let volumes = Arc::new(FakeVolumeController::new(GIB).with_image("vol-a", GIB));
    let mounter = Arc::new(RecordingMounter::new());
    let plugin = plugin(volumes.clone(), mounter.clone());

    for _ in 0..2 {
        plugin
            .node_stage_volume(Request::new(NodeStageVolumeRequest {
                volume_id: "vol-a".to_string(),
                staging_target_path: "/stage/vol-a".to_string(),
                volume_capability: Some(mount_capability("")),
                ..Default::default()
            }))
            .await
            .expect("stage");
    }
    for _ in 0..2 {
        plugin
            .node_publish_volume(Request::new(NodePublishVolumeRequest {
                volume_id: "vol-a".to_string(),
                staging_target_path: "/stage/vol-a".to_string(),
                target_path: "/pub/vol-a".to_string(),
                volume_capability: Some(mount_capability("")),
                ..Default::default()
            }))
            .await
            .expect("publish");
    }

    assert_eq!(
        mounter.mounted_targets(),
        vec!["/pub/vol-a".to_string(), "/stage/vol-a".to_string()]
    );
    assert_eq!(mounter.executed_mounts.lock().unwrap().len(), 2);
    assert_eq!(volumes.attached.lock().unwrap().len(), 1);
    assert!(volumes.formatted.lock().unwrap().contains("vol-a"));
}

#[tokio::test]
async fn publish_readonly_prepends_bind_and_ro() {
    let volumes = Arc::new(FakeVolumeController::new(GIB).with_image("vol-a", GIB));
    let mounter = Arc::new(RecordingMounter::new());
    let plugin = plugin(volumes, mounter.clone());

    plugin
        .node_publish_volume(Request::new(NodePublishVolumeRequest {
            volume_id: "vol-a".to_string(),
            staging_target_path: "/stage/vol-a".to_string(),
            target_path: "/pub/vol-a".to_string(),
            readonly: true,
            volume_capability: Some(VolumeCapability {
                access_type: Some(volume_capability::AccessType::Mount(
                    volume_capability::MountVolume {
                        mount_flags: vec!["noatime".to_string()],
                        ..Default::default()
                    },
                )),
                access_mode: Some(volume_capability::AccessMode {
                    mode: volume_capability::access_mode::Mode::SingleNodeWriter as i32,
                }),
            }),
            ..Default::default()
        }))
        .await
        .expect("publish");

    assert_eq!(
        mounter.options_for("/pub/vol-a"),
        Some(vec![
            "bind".to_string(),
            "ro".to_string(),
            "noatime".to_string()
        ])
    );
}

#[tokio::test]
async fn stage_rejects_block_access_as_unimplemented() {
    let volumes = Arc::new(FakeVolumeController::new(GIB).with_image("vol-a", GIB));
    let plugin = plugin(volumes, Arc::new(RecordingMounter::new()));

    let status = plugin
        .node_stage_volume(Request::new(NodeStageVolumeRequest {
            volume_id: "vol-a".to_string(),
            staging_target_path: "/stage/vol-a".to_string(),
            volume_capability: Some(block_capability()),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);
}

#[tokio::test]
async fn stage_rejects_unsupported_filesystem() {
    let volumes = Arc::new(FakeVolumeController::new(GIB).with_image("vol-a", GIB));
    let plugin = plugin(volumes, Arc::new(RecordingMounter::new()));

    let status = plugin
        .node_stage_volume(Request::new(NodeStageVolumeRequest {
            volume_id: "vol-a".to_string(),
            staging_target_path: "/stage/vol-a".to_string(),
            volume_capability: Some(mount_capability("xfs")),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("xfs"));
}

#[tokio::test]
async fn stage_of_absent_volume_is_not_found() {
    let plugin = plugin(
        Arc::new(FakeVolumeController::new(GIB)),
        Arc::new(RecordingMounter::new()),
    );

    let status = plugin
        .node_stage_volume(Request::new(NodeStageVolumeRequest {
            volume_id: "missing".to_string(),
            staging_target_path: "/stage/missing".to_string(),
            volume_capability: Some(mount_capability("")),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
}

#[tokio::test]
async fn unstage_unmounts_then_detaches() {
    let volumes = Arc::new(
        FakeVolumeController::new(GIB)
            .with_image("vol-a", GIB)
            .with_attached("vol-a", "/dev/loop0"),
    );
    let mounter = Arc::new(RecordingMounter::new());
    mounter
        .mount("/dev/loop0", "/stage/vol-a", &[])
        .await
        .expect("seed staging mount");
    let plugin = plugin(volumes.clone(), mounter.clone());

    plugin
        .node_unstage_volume(Request::new(NodeUnstageVolumeRequest {
            volume_id: "vol-a".to_string(),
            staging_target_path: "/stage/vol-a".to_string(),
        }))
        .await
        .expect("unstage");

    assert!(!mounter.is_mounted("/stage/vol-a").await.expect("query"));
    assert!(volumes.attached.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unstage_tolerates_already_deleted_image() {
    let volumes = Arc::new(FakeVolumeController::new(GIB));
    let mounter = Arc::new(RecordingMounter::new());
    mounter
        .mount("/dev/loop0", "/stage/vol-a", &[])
        .await
        .expect("seed staging mount");
    let plugin = plugin(volumes, mounter.clone());

    plugin
        .node_unstage_volume(Request::new(NodeUnstageVolumeRequest {
            volume_id: "vol-a".to_string(),
            staging_target_path: "/stage/vol-a".to_string(),
        }))
        .await
        .expect("unstage after delete");
    assert!(!mounter.is_mounted("/stage/vol-a").await.expect("query"));
}

#[tokio::test]
async fn node_expand_grows_image_and_resizes_filesystem() {
    let volumes = Arc::new(
        FakeVolumeController::new(200 * GIB)
            .with_image("vol-a", GIB)
            .with_attached("vol-a", "/dev/loop0"),
    );
    let plugin = plugin(volumes.clone(), Arc::new(RecordingMounter::new()));

    let response = plugin
        .node_expand_volume(Request::new(NodeExpandVolumeRequest {
            volume_id: "vol-a".to_string(),
            capacity_range: Some(CapacityRange {
                required_bytes: 5 * GIB,
                limit_bytes: 0,
            }),
            ..Default::default()
        }))
        .await
        .expect("node expand")
        .into_inner();

    assert_eq!(response.capacity_bytes, 5 * GIB);
    assert_eq!(volumes.image_size("vol-a"), Some(5 * GIB));
    assert_eq!(volumes.resized.lock().unwrap().as_slice(), ["vol-a"]);
}

#[tokio::test]
async fn node_expand_beyond_pool_is_resource_exhausted() {
    let volumes = Arc::new(
        FakeVolumeController::new(GIB)
            .with_image("vol-a", GIB)
            .with_attached("vol-a", "/dev/loop0"),
    );
    let plugin = plugin(volumes.clone(), Arc::new(RecordingMounter::new()));

    let status = plugin
        .node_expand_volume(Request::new(NodeExpandVolumeRequest {
            volume_id: "vol-a".to_string(),
            capacity_range: Some(CapacityRange {
                required_bytes: 200 * GIB,
                limit_bytes: 0,
            }),
            ..Default::default()
        }))
        .await
        .unwrap_err();

    assert_eq!(status.code(), Code::ResourceExhausted);
    assert_eq!(volumes.image_size("vol-a"), Some(GIB));
}

#[tokio::test]
async fn node_expand_of_absent_volume_is_not_found() {
    let plugin = plugin(
        Arc::new(FakeVolumeController::new(GIB)),
        Arc::new(RecordingMounter::new()),
    );

    let status = plugin
        .node_expand_volume(Request::new(NodeExpandVolumeRequest {
            volume_id: "missing".to_string(),
            capacity_range: Some(CapacityRange {
                required_bytes: 5 * GIB,
                limit_bytes: 0,
            }),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
}

#[tokio::test]
async fn volume_stats_require_a_mounted_path() {
    let plugin = plugin(
        Arc::new(FakeVolumeController::new(GIB)),
        Arc::new(RecordingMounter::new()),
    );

    let status = plugin
        .node_get_volume_stats(Request::new(NodeGetVolumeStatsRequest {
            volume_id: "vol-a".to_string(),
            volume_path: "/not/mounted".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
}

#[tokio::test]
async fn volume_stats_report_bytes_and_inodes() {
    let volumes = Arc::new(FakeVolumeController::new(GIB));
    let mounter = Arc::new(RecordingMounter::new());
    mounter
        .mount("/dev/loop0", "/stage/vol-a", &[])
        .await
        .expect("seed staging mount");
    let plugin = plugin(volumes, mounter);

    let response = plugin
        .node_get_volume_stats(Request::new(NodeGetVolumeStatsRequest {
            volume_id: "vol-a".to_string(),
            volume_path: "/stage/vol-a".to_string(),
            ..Default::default()
        }))
        .await
        .expect("stats")
        .into_inner();

    assert_eq!(response.usage.len(), 2);
    assert_eq!(response.usage[0].unit, volume_usage::Unit::Bytes as i32);
    assert_eq!(response.usage[0].total, 1000);
    assert_eq!(response.usage[1].unit, volume_usage::Unit::Inodes as i32);
    assert_eq!(response.usage[1].total, 100);
}

#[tokio::test]
async fn node_info_advertises_identity_and_topology() {
    let plugin = plugin(
        Arc::new(FakeVolumeController::new(GIB)),
        Arc::new(RecordingMounter::new()),
    );

    let response = plugin
        .node_get_info(Request::new(NodeGetInfoRequest::default()))
        .await
        .expect("node info")
        .into_inner();

    assert_eq!(response.node_id, NODE_ID);
    assert_eq!(response.max_volumes_per_node, MAX_VOLUMES_PER_NODE);
    let topology = response.accessible_topology.expect("topology");
    assert_eq!(
        topology.segments.get(TOPOLOGY_KEY),
        Some(&NODE_ID.to_string())
    );
}

#[tokio::test]
async fn node_capabilities_cover_stage_expand_and_stats() {
    let plugin = plugin(
        Arc::new(FakeVolumeController::new(GIB)),
        Arc::new(RecordingMounter::new()),
    );

    let response = plugin
        .node_get_capabilities(Request::new(NodeGetCapabilitiesRequest::default()))
        .await
        .expect("capabilities")
        .into_inner();

    let mut advertised: Vec<i32> = response
        .capabilities
        .iter()
        .filter_map(|capability| match &capability.r#type {
            Some(node_service_capability::Type::Rpc(rpc)) => Some(rpc.r#type),
            None => None,
        })
        .collect();
    advertised.sort();
    let mut expected = vec![
        node_service_capability::rpc::Type::StageUnstageVolume as i32,
        node_service_capability::rpc::Type::ExpandVolume as i32,
        node_service_capability::rpc::Type::GetVolumeStats as i32,
    ];
    expected.sort();
    assert_eq!(advertised, expected);
}

#[tokio::test]
async fn identity_reports_fixed_name_and_crate_version() {
    let plugin = plugin(
        Arc::new(FakeVolumeController::new(GIB)),
        Arc::new(RecordingMounter::new()),
    );

    let info = plugin
        .get_plugin_info(Request::new(GetPluginInfoRequest::default()))
        .await
        .expect("plugin info")
        .into_inner();
    assert_eq!(info.name, PLUGIN_NAME);
    assert_eq!(info.vendor_version, PLUGIN_VERSION);

    let probe = plugin
        .probe(Request::new(ProbeRequest::default()))
        .await
        .expect("probe")
        .into_inner();
    assert_eq!(probe.ready, Some(true));
}

#[tokio::test]
async fn identity_advertises_controller_topology_and_online_expansion() {
    let plugin = plugin(
        Arc::new(FakeVolumeController::new(GIB)),
        Arc::new(RecordingMounter::new()),
    );

    let response = plugin
        .get_plugin_capabilities(Request::new(GetPluginCapabilitiesRequest::default()))
        .await
        .expect("plugin capabilities")
        .into_inner();

    let has_controller_service = response.capabilities.iter().any(|capability| {
        matches!(
            &capability.r#type,
            Some(plugin_capability::Type::Service(service))
                if service.r#type == plugin_capability::service::Type::ControllerService as i32
        )
    });
    let has_online_expansion = response.capabilities.iter().any(|capability| {
        matches!(
            &capability.r#type,
            Some(plugin_capability::Type::VolumeExpansion(expansion))
                if expansion.r#type == plugin_capability::volume_expansion::Type::Online as i32
        )
    });
    assert!(has_controller_service);
    assert!(has_online_expansion);
}

#[tokio::test]
async fn full_lifecycle_round_trip_converges_to_empty_state() {
    let volumes = Arc::new(FakeVolumeController::new(200 * GIB));
    let mounter = Arc::new(RecordingMounter::new());
    let plugin = plugin(volumes.clone(), mounter.clone());

    plugin
        .create_volume(Request::new(create_request("vol-a", NODE_ID)))
        .await
        .expect("create");
    plugin
        .node_stage_volume(Request::new(NodeStageVolumeRequest {
            volume_id: "vol-a".to_string(),
            staging_target_path: "/stage/vol-a".to_string(),
            volume_capability: Some(mount_capability("")),
            ..Default::default()
        }))
        .await
        .expect("stage");
    plugin
        .node_publish_volume(Request::new(NodePublishVolumeRequest {
            volume_id: "vol-a".to_string(),
            staging_target_path: "/stage/vol-a".to_string(),
            target_path: "/pub/vol-a".to_string(),
            volume_capability: Some(mount_capability("")),
            ..Default::default()
        }))
        .await
        .expect("publish");
    plugin
        .node_unpublish_volume(Request::new(NodeUnpublishVolumeRequest {
            volume_id: "vol-a".to_string(),
            target_path: "/pub/vol-a".to_string(),
        }))
        .await
        .expect("unpublish");
    plugin
        .node_unstage_volume(Request::new(NodeUnstageVolumeRequest {
            volume_id: "vol-a".to_string(),
            staging_target_path: "/stage/vol-a".to_string(),
        }))
        .await
        .expect("unstage");
    plugin
        .delete_volume(Request::new(DeleteVolumeRequest {
            volume_id: "vol-a".to_string(),
            ..Default::default()
        }))
        .await
        .expect("delete");

    assert!(volumes.images.lock().unwrap().is_empty());
    assert!(volumes.attached.lock().unwrap().is_empty());
    assert!(mounter.mounted_targets().is_empty());
}
