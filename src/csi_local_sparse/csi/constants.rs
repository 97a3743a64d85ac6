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

/// Registered CSI plugin name.
pub const PLUGIN_NAME: &str = "local-sparse.csi.reinstall.ru";

/// Vendor version advertised through GetPluginInfo.
pub const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

const GIB: i64 = 1 << 30;

/// Size used when no capacity range is requested.
pub const DEFAULT_VOLUME_SIZE: i64 = GIB;

/// Minimal supported volume size.
pub const MINIMUM_VOLUME_SIZE: i64 = GIB;

/// Maximum supported volume size.
pub const MAXIMUM_VOLUME_SIZE: i64 = 200 * GIB;

/// Maximum count of volumes that can be created per node.
pub const MAX_VOLUMES_PER_NODE: i64 = 200;

/// Filesystem used when the caller does not request one.
pub const DEFAULT_FS_TYPE: &str = "ext4";
