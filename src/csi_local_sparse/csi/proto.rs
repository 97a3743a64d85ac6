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

/// Generated gRPC bindings for the CSI services.
#[allow(clippy::all)]
pub mod generated {
    tonic::include_proto!("csi.v1");
}

pub use generated::controller_server::{Controller, ControllerServer};
pub use generated::identity_server::{Identity, IdentityServer};
pub use generated::node_server::{Node, NodeServer};
pub use generated::*;
