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

use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Code, Request, Response, Status};

use crate::pmem_csi::csi::driver::CsiDriver;
use crate::pmem_csi::csi::proto;
use crate::pmem_csi::csi::proto::controller_server::Controller;
use crate::pmem_csi::csi::{reject_oversized, validate_capability};
use crate::pmem_csi::volume::{Origin, VolumeParameters};

pub struct ControllerService {
    driver: Arc<CsiDriver>,
}

impl ControllerService {
    pub fn new(driver: Arc<CsiDriver>) -> Self {
        Self { driver }
    }

    /// All client-visible errors carry the node identity so cluster-wide
    /// logs can be correlated.
    fn status(&self, code: Code, message: impl Into<String>) -> Status {
        Status::new(
            code,
            format!("{} (node {})", message.into(), self.driver.node_id()),
        )
    }

    fn node_topology(&self) -> proto::Topology {
        let mut segments = HashMap::new();
        segments.insert(
            self.driver.topology_key(),
            self.driver.node_id().to_string(),
        );
        proto::Topology { segments }
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<proto::CreateVolumeRequest>,
    ) -> Result<Response<proto::CreateVolumeResponse>, Status> {
        let request = request.into_inner();
        reject_oversized(&request)?;

        if request.name.is_empty() {
            return Err(self.status(Code::InvalidArgument, "name missing in request"));
        }
        if request.volume_capabilities.is_empty() {
            return Err(self.status(
                Code::InvalidArgument,
                "volume capabilities missing in request",
            ));
        }
        for capability in &request.volume_capabilities {
            validate_capability(capability)?;
        }

        let params = VolumeParameters::parse(Origin::CreateVolume, &request.parameters)
            .map_err(|err| {
                self.status(Code::InvalidArgument, format!("persistent volume: {}", err))
            })?;

        let required = request
            .capacity_range
            .as_ref()
            .map(|range| range.required_bytes)
            .unwrap_or(0);
        if required < 0 {
            return Err(self.status(
                Code::InvalidArgument,
                "required_bytes must not be negative",
            ));
        }

        let (volume_id, size, volume_context) = self
            .driver
            .create_volume(&request.name, required, params)
            .await?;

        Ok(Response::new(proto::CreateVolumeResponse {
            volume: Some(proto::Volume {
                volume_id,
                capacity_bytes: size,
                volume_context,
                accessible_topology: vec![self.node_topology()],
            }),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<proto::DeleteVolumeRequest>,
    ) -> Result<Response<proto::DeleteVolumeResponse>, Status> {
        let request = request.into_inner();
        reject_oversized(&request)?;

        if request.volume_id.is_empty() {
            return Err(self.status(Code::InvalidArgument, "volume id missing in request"));
        }
        self.driver.delete_volume(&request.volume_id).await?;
        Ok(Response::new(proto::DeleteVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<proto::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<proto::ValidateVolumeCapabilitiesResponse>, Status> {
        use proto::volume_capability::access_mode::Mode;

        let request = request.into_inner();
        reject_oversized(&request)?;

        if request.volume_id.is_empty() {
            return Err(self.status(Code::InvalidArgument, "volume id missing in request"));
        }
        if request.volume_capabilities.is_empty() {
            return Err(self.status(
                Code::InvalidArgument,
                "volume capabilities missing in request",
            ));
        }
        self.driver.validate_known_volume(&request.volume_id)?;

        for capability in &request.volume_capabilities {
            let mode = capability
                .access_mode
                .as_ref()
                .map(|m| m.mode())
                .unwrap_or(Mode::Unknown);
            if mode != Mode::SingleNodeWriter {
                return Ok(Response::new(proto::ValidateVolumeCapabilitiesResponse {
                    confirmed: None,
                    message: format!("driver does not support {:?} mode", mode),
                }));
            }
        }

        Ok(Response::new(proto::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(proto::validate_volume_capabilities_response::Confirmed {
                volume_context: request.volume_context,
                volume_capabilities: request.volume_capabilities,
                parameters: request.parameters,
            }),
            message: String::new(),
        }))
    }

    async fn list_volumes(
        &self,
        request: Request<proto::ListVolumesRequest>,
    ) -> Result<Response<proto::ListVolumesResponse>, Status> {
        let request = request.into_inner();
        reject_oversized(&request)?;

        if request.max_entries < 0 {
            return Err(self.status(
                Code::InvalidArgument,
                "max_entries must not be negative",
            ));
        }

        let volumes = self.driver.volumes_snapshot();
        let total = volumes.len() as u32;

        // Tokens are stringified offsets. Anything that does not fit a
        // 32-bit offset never came from us.
        let starting_token: u32 = if request.starting_token.is_empty() {
            0
        } else {
            request.starting_token.parse().map_err(|_| {
                self.status(
                    Code::Aborted,
                    format!("invalid starting token {:?}", request.starting_token),
                )
            })?
        };
        if starting_token > total {
            return Err(self.status(
                Code::Aborted,
                format!("starting token {} beyond {} volumes", starting_token, total),
            ));
        }

        let remaining = total - starting_token;
        let max_entries = request.max_entries as u32;
        let page = if max_entries == 0 || max_entries > remaining {
            remaining
        } else {
            max_entries
        };

        let entries: Vec<proto::list_volumes_response::Entry> = volumes
            .iter()
            .skip(starting_token as usize)
            .take(page as usize)
            .map(|record| proto::list_volumes_response::Entry {
                volume: Some(proto::Volume {
                    volume_id: record.id.clone(),
                    capacity_bytes: record.size,
                    volume_context: HashMap::new(),
                    accessible_topology: Vec::new(),
                }),
            })
            .collect();

        let consumed = starting_token + entries.len() as u32;
        let next_token = if consumed < total {
            consumed.to_string()
        } else {
            String::new()
        };

        Ok(Response::new(proto::ListVolumesResponse {
            entries,
            next_token,
        }))
    }

    async fn get_capacity(
        &self,
        request: Request<proto::GetCapacityRequest>,
    ) -> Result<Response<proto::GetCapacityResponse>, Status> {
        let request = request.into_inner();
        reject_oversized(&request)?;

        // Capacity requests scoped to some other node report nothing; the
        // segments filter this node out.
        if let Some(topology) = request.accessible_topology.as_ref() {
            if let Some(node) = topology.segments.get(&self.driver.topology_key()) {
                if node != self.driver.node_id() {
                    return Ok(Response::new(proto::GetCapacityResponse {
                        available_capacity: 0,
                        maximum_volume_size: Some(0),
                    }));
                }
            }
        }

        let capacity = self.driver.capacity().await?;
        Ok(Response::new(proto::GetCapacityResponse {
            available_capacity: capacity.available as i64,
            maximum_volume_size: Some(capacity.max_volume_size as i64),
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<proto::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<proto::ControllerGetCapabilitiesResponse>, Status> {
        use proto::controller_service_capability::rpc::Type;
        use proto::controller_service_capability::Rpc;

        let capabilities = [Type::CreateDeleteVolume, Type::ListVolumes, Type::GetCapacity]
            .into_iter()
            .map(|capability| proto::ControllerServiceCapability {
                r#type: Some(proto::controller_service_capability::Type::Rpc(Rpc {
                    r#type: capability as i32,
                })),
            })
            .collect();
        Ok(Response::new(proto::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }
}
