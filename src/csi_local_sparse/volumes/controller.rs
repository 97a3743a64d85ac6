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

use std::fs;
use std::path::{Path, PathBuf};

use nix::sys::statfs::statfs;

use super::exec::{run_tool, run_tool_checked};
use super::{VolumeController, VolumeError, VolumeStatistics};
use crate::csi_local_sparse::logger::{log_debug, log_warn};
use crate::csi_local_sparse::util::error::{new_error, with_context, DynError};

const COMPONENT: &str = "volume-controller";

/// The only filesystem provisioned on sparse images in v1.
const SUPPORTED_FS_TYPE: &str = "ext4";

/// Volume controller working with Linux sparse files.
///
/// Volumes are plain files named `<volume-id>.img` under the images
/// directory; their presence on disk is the only persisted state. Loop
/// associations are discovered from the kernel on every call rather than
/// cached, which keeps each operation idempotent across retries and
/// restarts.
pub struct SparseFileVolumeController {
    images_dir: PathBuf,
    direct_io: bool,
}

impl SparseFileVolumeController {
    pub fn new(images_dir: PathBuf, direct_io: bool) -> Self {
        Self {
            images_dir,
            direct_io,
        }
    }

    fn image_path(&self, volume_id: &str) -> PathBuf {
        self.images_dir.join(format!("{volume_id}.img"))
    }

    fn image_exists(path: &Path) -> bool {
        fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
    }

    async fn truncate(&self, filename: &str, size_bytes: i64) -> Result<(), DynError> {
        log_debug(
            COMPONENT,
            "truncate called",
            &[("filename", filename), ("size", &size_bytes.to_string())],
        );

        run_tool_checked("truncate", &["-s", &size_bytes.to_string(), filename]).await?;

        log_debug(
            COMPONENT,
            "Truncated file successfully",
            &[("filename", filename), ("size", &size_bytes.to_string())],
        );
        Ok(())
    }

    async fn expand_loop_device(&self, device: &str) -> Result<(), DynError> {
        log_debug(COMPONENT, "expandLoopDevice called", &[("device", device)]);
        run_tool_checked("losetup", &["--set-capacity", device]).await?;
        log_debug(
            COMPONENT,
            "Expanded loop device successfully",
            &[("device", device)],
        );
        Ok(())
    }

    async fn resize_fs(&self, filename: &str) -> Result<(), DynError> {
        log_debug(COMPONENT, "resizeFs called", &[("filename", filename)]);
        run_tool_checked("resize2fs", &[filename]).await?;
        log_debug(
            COMPONENT,
            "Resized sparse file filesystem successfully",
            &[("filename", filename)],
        );
        Ok(())
    }

    /// Probes the current filesystem of the image. `blkid` exits with code
    /// 2 when no recognizable filesystem is present; that maps to an empty
    /// type, not an error.
    async fn current_filesystem(&self, filename: &str) -> Result<String, DynError> {
        log_debug(
            COMPONENT,
            "currentFilesystem called",
            &[("filename", filename)],
        );

        let output = run_tool("blkid", &["-o", "value", "-s", "TYPE", filename]).await?;
        if !output.success {
            if output.exit_code == Some(2) {
                log_debug(
                    COMPONENT,
                    "Blkid returned code 2, assume file has no filesystem",
                    &[("filename", filename)],
                );
                return Ok(String::new());
            }
            return Err(new_error(format!(
                "error exec command (blkid): exit code {:?}: {}",
                output.exit_code,
                output.combined()
            )));
        }

        Ok(output.stdout.trim().to_string())
    }
}

/// Extracts the device path from `losetup --associated` output. The first
/// line looks like `/dev/loop3: []: (/data/vol.img)`; an empty report means
/// no association.
fn parse_associated_device(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    trimmed
        .lines()
        .next()
        .and_then(|line| line.split(':').next())
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn parse_size(output: &str) -> Result<i64, DynError> {
    output
        .trim()
        .parse::<i64>()
        .map_err(|e| with_context(e, "error parse stat output"))
}

#[tonic::async_trait]
impl VolumeController for SparseFileVolumeController {
    async fn create(&self, volume_id: &str, size_bytes: i64) -> Result<(), DynError> {
        log_debug(
            COMPONENT,
            "Create called",
            &[
                ("volume_id", volume_id),
                ("size_bytes", &size_bytes.to_string()),
            ],
        );

        if volume_id.is_empty() {
            return Err(new_error("volumeId can't be empty"));
        }
        if size_bytes <= 0 {
            return Err(new_error("size can't be less or equal 0"));
        }

        let path = self.image_path(volume_id);
        let filename = path.display().to_string();
        if Self::image_exists(&path) {
            log_debug(
                COMPONENT,
                "File already exists, skip creating",
                &[("volume_id", volume_id), ("filename", &filename)],
            );
            return Ok(());
        }

        if let Err(err) = self.truncate(&filename, size_bytes).await {
            // Leave no partially created image behind.
            if Self::image_exists(&path) {
                let _ = fs::remove_file(&path);
            }
            return Err(with_context(err, "error truncate file"));
        }

        log_debug(
            COMPONENT,
            "Volume file was created successfully",
            &[("volume_id", volume_id), ("filename", &filename)],
        );
        Ok(())
    }

    async fn delete(&self, volume_id: &str) -> Result<(), DynError> {
        log_debug(COMPONENT, "Delete called", &[("volume_id", volume_id)]);

        if volume_id.is_empty() {
            return Err(new_error("volumeId can't be empty"));
        }

        let path = self.image_path(volume_id);
        let filename = path.display().to_string();
        if !Self::image_exists(&path) {
            log_debug(
                COMPONENT,
                "File does not exist, assume it was already deleted",
                &[("volume_id", volume_id), ("filename", &filename)],
            );
            return Ok(());
        }

        run_tool_checked("rm", &["-f", &filename]).await?;

        log_debug(
            COMPONENT,
            "Volume file was deleted successfully",
            &[("volume_id", volume_id), ("filename", &filename)],
        );
        Ok(())
    }

    async fn volume_stats(&self, path: &str) -> Result<VolumeStatistics, DynError> {
        log_debug(COMPONENT, "GetVolumeStats called", &[("path", path)]);

        if path.is_empty() {
            return Err(new_error("path can't be empty"));
        }

        let fs_stats = statfs(Path::new(path))
            .map_err(|e| with_context(e, "error get volume capacity stats"))?;

        let block_size = fs_stats.block_size() as i64;
        let stats = VolumeStatistics {
            available_bytes: fs_stats.blocks_available() as i64 * block_size,
            total_bytes: fs_stats.blocks() as i64 * block_size,
            used_bytes: (fs_stats.blocks() as i64 - fs_stats.blocks_free() as i64) * block_size,
            available_inodes: fs_stats.files_free() as i64,
            total_inodes: fs_stats.files() as i64,
            used_inodes: fs_stats.files() as i64 - fs_stats.files_free() as i64,
        };

        log_debug(
            COMPONENT,
            "Finish calculate volume stats",
            &[
                ("path", path),
                ("avail_bytes", &stats.available_bytes.to_string()),
                ("used_bytes", &stats.used_bytes.to_string()),
                ("total_bytes", &stats.total_bytes.to_string()),
            ],
        );
        Ok(stats)
    }

    async fn capacity(&self) -> Result<i64, DynError> {
        log_debug(COMPONENT, "GetCapacity called", &[]);

        let fs_stats = statfs(self.images_dir.as_path())
            .map_err(|e| with_context(e, "error get storage capacity stats"))?;
        let available = fs_stats.blocks_free() as i64 * fs_stats.block_size() as i64;

        log_debug(
            COMPONENT,
            "Finish calculate storage available capacity",
            &[
                ("storage_path", &self.images_dir.display().to_string()),
                ("available_bytes", &available.to_string()),
            ],
        );
        Ok(available)
    }

    async fn volume_size(&self, volume_id: &str) -> Result<i64, DynError> {
        log_debug(COMPONENT, "GetVolumeSize called", &[("volume_id", volume_id)]);

        if volume_id.is_empty() {
            return Err(new_error("volumeId can't be empty"));
        }

        let path = self.image_path(volume_id);
        if !Self::image_exists(&path) {
            return Err(VolumeError::NotFound.into());
        }

        let output =
            run_tool_checked("stat", &["-c", "%s", &path.display().to_string()]).await?;
        let size = parse_size(&output)?;

        log_debug(
            COMPONENT,
            "Finish calculate volume size",
            &[("volume_id", volume_id), ("size_bytes", &size.to_string())],
        );
        Ok(size)
    }

    async fn expand_volume_size(
        &self,
        volume_id: &str,
        new_size_bytes: i64,
    ) -> Result<(), DynError> {
        log_debug(
            COMPONENT,
            "ExpandVolumeSize called",
            &[
                ("volume_id", volume_id),
                ("new_size", &new_size_bytes.to_string()),
            ],
        );

        if volume_id.is_empty() {
            return Err(new_error("volumeId can't be empty"));
        }
        if new_size_bytes <= 0 {
            return Err(new_error("size can't be less or equal 0"));
        }

        let path = self.image_path(volume_id);
        if !Self::image_exists(&path) {
            return Err(VolumeError::NotFound.into());
        }

        let current_size = self
            .volume_size(volume_id)
            .await
            .map_err(|e| with_context(e, "error get current volume size"))?;
        let available = self
            .capacity()
            .await
            .map_err(|e| with_context(e, "error get storage capacity"))?;

        let additional = new_size_bytes - current_size;
        if additional >= available {
            return Err(VolumeError::OutOfCapacity {
                additional,
                available,
            }
            .into());
        }

        // Shrinking is not supported; a smaller request is a no-op.
        if additional > 0 {
            self.truncate(&path.display().to_string(), new_size_bytes)
                .await
                .map_err(|e| with_context(e, "error truncate file"))?;
        }

        log_debug(
            COMPONENT,
            "Volume size was expanded successfully",
            &[
                ("volume_id", volume_id),
                ("add_size_bytes", &additional.to_string()),
            ],
        );
        Ok(())
    }

    async fn resize_device_filesystem(&self, volume_id: &str) -> Result<(), DynError> {
        log_debug(
            COMPONENT,
            "ResizeDeviceFileSystem called",
            &[("volume_id", volume_id)],
        );

        if volume_id.is_empty() {
            return Err(new_error("volumeId can't be empty"));
        }

        let path = self.image_path(volume_id);
        if !Self::image_exists(&path) {
            return Err(VolumeError::NotFound.into());
        }

        let device = self
            .device_by_volume_id(volume_id)
            .await
            .map_err(|e| with_context(e, "error get loop device"))?;
        if device.is_empty() {
            return Err(VolumeError::NotFound.into());
        }

        self.expand_loop_device(&device)
            .await
            .map_err(|e| with_context(e, "error expand loop device"))?;
        self.resize_fs(&path.display().to_string())
            .await
            .map_err(|e| with_context(e, "error resize filesystem"))?;

        log_debug(
            COMPONENT,
            "Device filesystem was resized successfully",
            &[("volume_id", volume_id)],
        );
        Ok(())
    }

    async fn attach_device(&self, volume_id: &str) -> Result<String, DynError> {
        log_debug(COMPONENT, "AttachDevice called", &[("volume_id", volume_id)]);

        if volume_id.is_empty() {
            return Err(new_error("volumeId can't be empty"));
        }

        let path = self.image_path(volume_id);
        if !Self::image_exists(&path) {
            return Err(VolumeError::NotFound.into());
        }

        let device = self
            .device_by_volume_id(volume_id)
            .await
            .map_err(|e| with_context(e, "error get device by volumeId"))?;
        if !device.is_empty() {
            log_debug(
                COMPONENT,
                "Device already attached, skip it",
                &[("volume_id", volume_id), ("device", &device)],
            );
            return Ok(device);
        }

        let filename = path.display().to_string();
        let mut args = vec!["--find", "--show"];
        if self.direct_io {
            args.push("--direct-io=on");
        }
        args.push(&filename);

        let device = run_tool_checked("losetup", &args).await?;

        log_debug(
            COMPONENT,
            "Device was attached successfully",
            &[("volume_id", volume_id), ("device", &device)],
        );
        Ok(device)
    }

    async fn detach_device(&self, volume_id: &str) -> Result<(), DynError> {
        log_debug(COMPONENT, "DetachDevice called", &[("volume_id", volume_id)]);

        if volume_id.is_empty() {
            return Err(new_error("volumeId can't be empty"));
        }

        let path = self.image_path(volume_id);
        if !Self::image_exists(&path) {
            return Err(VolumeError::NotFound.into());
        }

        run_tool_checked("losetup", &["--detach-all", &path.display().to_string()]).await?;

        log_debug(
            COMPONENT,
            "Device was detached successfully",
            &[("volume_id", volume_id)],
        );
        Ok(())
    }

    async fn device_by_volume_id(&self, volume_id: &str) -> Result<String, DynError> {
        log_debug(
            COMPONENT,
            "GetDeviceByVolumeId called",
            &[("volume_id", volume_id)],
        );

        if volume_id.is_empty() {
            return Err(new_error("volumeId can't be empty"));
        }

        let path = self.image_path(volume_id);
        if !Self::image_exists(&path) {
            return Err(VolumeError::NotFound.into());
        }

        let output =
            run_tool_checked("losetup", &["--associated", &path.display().to_string()]).await?;
        let device = parse_associated_device(&output);

        if device.is_empty() {
            log_debug(
                COMPONENT,
                "No device associated with volume",
                &[("volume_id", volume_id)],
            );
        } else {
            log_debug(
                COMPONENT,
                "Found device by volumeId",
                &[("volume_id", volume_id), ("device", &device)],
            );
        }
        Ok(device)
    }

    async fn format_if_needed(&self, volume_id: &str, fs_type: &str) -> Result<(), DynError> {
        log_debug(
            COMPONENT,
            "FormatIfNeeded called",
            &[("volume_id", volume_id), ("fs_type", fs_type)],
        );

        if volume_id.is_empty() {
            return Err(new_error("volumeId can't be empty"));
        }
        if fs_type != SUPPORTED_FS_TYPE {
            return Err(VolumeError::UnsupportedFilesystem(fs_type.to_string()).into());
        }

        let path = self.image_path(volume_id);
        if !Self::image_exists(&path) {
            return Err(VolumeError::NotFound.into());
        }

        let filename = path.display().to_string();
        let current_fs = self
            .current_filesystem(&filename)
            .await
            .map_err(|e| with_context(e, "error get current filesystem"))?;
        if current_fs == fs_type {
            log_debug(
                COMPONENT,
                "Sparse file already formatted, skip formatting",
                &[("filename", &filename), ("fs_type", fs_type)],
            );
            return Ok(());
        }
        if !current_fs.is_empty() {
            log_warn(
                COMPONENT,
                "Reformatting image that carries another filesystem",
                &[("filename", &filename), ("current_fs_type", &current_fs)],
            );
        }

        run_tool_checked(&format!("mkfs.{fs_type}"), &[&filename]).await?;

        log_debug(
            COMPONENT,
            "Sparse file was formatted successfully",
            &[
                ("volume_id", volume_id),
                ("filename", &filename),
                ("fs_type", fs_type),
            ],
        );
        Ok(())
    }
}
