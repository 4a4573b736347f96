/*
 * Copyright (C) 2025 The PMEM-CSI Authors
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

pub mod controller;
pub mod driver;
pub mod identity;
pub mod node;
pub mod server;

pub use driver::{AccessType, CsiDriver};

#[allow(
    clippy::struct_excessive_bools,
    clippy::enum_variant_names,
    clippy::doc_markdown,
    clippy::missing_const_for_fn,
    clippy::trivially_copy_pass_by_ref
)]
pub mod proto {
    tonic::include_proto!("csi.v1");
}

/// The server refuses requests whose encoded size exceeds this, matching
/// the gRPC default so clients see the documented behavior instead of a
/// transport-level reset.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Guard called at the top of every service method. The transport layer
/// enforces the same limit during decoding; this keeps the error message
/// stable for clients that depend on it.
pub fn reject_oversized<M: prost::Message>(message: &M) -> Result<(), tonic::Status> {
    let encoded = message.encoded_len();
    if encoded > MAX_MESSAGE_SIZE {
        return Err(tonic::Status::resource_exhausted(format!(
            "received message larger than max ({} vs. {})",
            encoded, MAX_MESSAGE_SIZE
        )));
    }
    Ok(())
}

/// Check a requested capability and translate it into the driver's access
/// representation. Only single-node writers are supported.
pub fn validate_capability(
    capability: &proto::VolumeCapability,
) -> Result<AccessType, tonic::Status> {
    use proto::volume_capability::access_mode::Mode;

    let mode = capability
        .access_mode
        .as_ref()
        .map(|m| m.mode())
        .unwrap_or(Mode::Unknown);
    if mode != Mode::SingleNodeWriter {
        return Err(tonic::Status::invalid_argument(format!(
            "access mode {:?} is not supported, only SINGLE_NODE_WRITER volumes are",
            mode
        )));
    }

    match capability.access_type.as_ref() {
        Some(proto::volume_capability::AccessType::Block(_)) => Ok(AccessType::Block),
        Some(proto::volume_capability::AccessType::Mount(mount)) => Ok(AccessType::Mount {
            fs_type: mount.fs_type.clone(),
            mount_flags: mount.mount_flags.clone(),
        }),
        None => Err(tonic::Status::invalid_argument(
            "volume access type missing in request",
        )),
    }
}
