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

mod controller;
pub mod exec;
mod mounter;

pub use controller::SparseFileVolumeController;
pub use mounter::{LinuxMounter, MountPropagationError};

use std::error::Error;
use std::fmt;

use crate::csi_local_sparse::util::error::DynError;

/// Sentinel failures raised by the storage engine. The RPC façade inspects
/// these through [`is_not_found`] and friends to pick a status code; anything
/// else is an internal failure.
#[derive(Debug)]
pub enum VolumeError {
    NotFound,
    OutOfCapacity { additional: i64, available: i64 },
    UnsupportedFilesystem(String),
}

impl fmt::Display for VolumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeError::NotFound => f.write_str("volume not found"),
            VolumeError::OutOfCapacity {
                additional,
                available,
            } => write!(
                f,
                "additional space ({additional}) is not available, {available} bytes available on storage"
            ),
            VolumeError::UnsupportedFilesystem(fs_type) => {
                write!(f, "given filesystem type ({fs_type}) not supported")
            }
        }
    }
}

impl Error for VolumeError {}

fn find_volume_error<'a>(err: &'a (dyn Error + 'static)) -> Option<&'a VolumeError> {
    let mut current: Option<&'a (dyn Error + 'static)> = Some(err);
    while let Some(candidate) = current {
        if let Some(found) = candidate.downcast_ref::<VolumeError>() {
            return Some(found);
        }
        current = candidate.source();
    }
    None
}

pub fn is_not_found(err: &(dyn Error + 'static)) -> bool {
    matches!(find_volume_error(err), Some(VolumeError::NotFound))
}

pub fn is_out_of_capacity(err: &(dyn Error + 'static)) -> bool {
    matches!(find_volume_error(err), Some(VolumeError::OutOfCapacity { .. }))
}

pub fn is_unsupported_filesystem(err: &(dyn Error + 'static)) -> bool {
    matches!(
        find_volume_error(err),
        Some(VolumeError::UnsupportedFilesystem(_))
    )
}

/// Capacity statistics of a mounted volume, in bytes and inodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeStatistics {
    pub available_bytes: i64,
    pub used_bytes: i64,
    pub total_bytes: i64,
    pub available_inodes: i64,
    pub used_inodes: i64,
    pub total_inodes: i64,
}

/// Low-level lifecycle operations over node-local volumes.
///
/// Implementations must ensure idempotence of every operation: the
/// orchestrator retries whole RPCs and the kernel-owned state (file
/// presence, loop associations) is re-queried on each call.
#[tonic::async_trait]
pub trait VolumeController: Send + Sync {
    /// Creates a new volume with the given size. Succeeds if the volume
    /// already exists.
    async fn create(&self, volume_id: &str, size_bytes: i64) -> Result<(), DynError>;

    /// Deletes a volume by id. Succeeds if the volume is already absent.
    async fn delete(&self, volume_id: &str) -> Result<(), DynError>;

    /// Returns capacity statistics for a mounted path.
    async fn volume_stats(&self, path: &str) -> Result<VolumeStatistics, DynError>;

    /// Returns free space of the storage pool in bytes.
    async fn capacity(&self) -> Result<i64, DynError>;

    /// Returns the current size of a volume in bytes.
    async fn volume_size(&self, volume_id: &str) -> Result<i64, DynError>;

    /// Grows the volume to satisfy the requested size. Does nothing when
    /// the requested size does not exceed the current one.
    async fn expand_volume_size(&self, volume_id: &str, new_size_bytes: i64)
        -> Result<(), DynError>;

    /// Refreshes the loop device capacity and grows the filesystem of the
    /// device attached to the given volume.
    async fn resize_device_filesystem(&self, volume_id: &str) -> Result<(), DynError>;

    /// Attaches the volume to a loop device and returns the device path.
    async fn attach_device(&self, volume_id: &str) -> Result<String, DynError>;

    /// Detaches the volume from its loop device. Succeeds if no device is
    /// attached.
    async fn detach_device(&self, volume_id: &str) -> Result<(), DynError>;

    /// Returns the device path attached to the given volume, or an empty
    /// string when no device is attached.
    async fn device_by_volume_id(&self, volume_id: &str) -> Result<String, DynError>;

    /// Formats the volume with the given filesystem type unless it already
    /// carries it.
    async fn format_if_needed(&self, volume_id: &str, fs_type: &str) -> Result<(), DynError>;
}

/// Low-level mount operations over the kernel mount table.
///
/// Implementations must ensure idempotence of every operation.
#[tonic::async_trait]
pub trait Mounter: Send + Sync {
    /// Mounts `source` at `target` with the given options. Succeeds if the
    /// target is already mounted.
    async fn mount(&self, source: &str, target: &str, options: &[String]) -> Result<(), DynError>;

    /// Unmounts `target`. Succeeds if the target is not mounted.
    async fn unmount(&self, target: &str) -> Result<(), DynError>;

    /// Returns true if `target` is currently a mount point.
    async fn is_mounted(&self, target: &str) -> Result<bool, DynError>;
}
