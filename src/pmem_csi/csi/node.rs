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
use crate::pmem_csi::csi::proto::node_server::Node;
use crate::pmem_csi::csi::{reject_oversized, validate_capability};

pub struct NodeService {
    driver: Arc<CsiDriver>,
}

impl NodeService {
    pub fn new(driver: Arc<CsiDriver>) -> Self {
        Self { driver }
    }

    fn invalid(&self, message: &str) -> Status {
        Status::new(
            Code::InvalidArgument,
            format!("{} (node {})", message, self.driver.node_id()),
        )
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<proto::NodeStageVolumeRequest>,
    ) -> Result<Response<proto::NodeStageVolumeResponse>, Status> {
        let request = request.into_inner();
        reject_oversized(&request)?;

        if request.volume_id.is_empty() {
            return Err(self.invalid("volume id missing in request"));
        }
        if request.staging_target_path.is_empty() {
            return Err(self.invalid("target path missing in request"));
        }
        let capability = request
            .volume_capability
            .as_ref()
            .ok_or_else(|| self.invalid("volume capability missing in request"))?;
        let access = validate_capability(capability)?;

        self.driver
            .stage_volume(
                &request.volume_id,
                &request.staging_target_path,
                &access,
                &request.volume_context,
            )
            .await?;
        Ok(Response::new(proto::NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<proto::NodeUnstageVolumeRequest>,
    ) -> Result<Response<proto::NodeUnstageVolumeResponse>, Status> {
        let request = request.into_inner();
        reject_oversized(&request)?;

        if request.volume_id.is_empty() {
            return Err(self.invalid("volume id missing in request"));
        }
        if request.staging_target_path.is_empty() {
            return Err(self.invalid("target path missing in request"));
        }

        self.driver
            .unstage_volume(&request.volume_id, &request.staging_target_path)
            .await?;
        Ok(Response::new(proto::NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<proto::NodePublishVolumeRequest>,
    ) -> Result<Response<proto::NodePublishVolumeResponse>, Status> {
        let request = request.into_inner();
        reject_oversized(&request)?;

        let capability = request
            .volume_capability
            .as_ref()
            .ok_or_else(|| self.invalid("volume capability missing in request"))?;
        if request.volume_id.is_empty() {
            return Err(self.invalid("volume id missing in request"));
        }
        if request.target_path.is_empty() {
            return Err(self.invalid("target path missing in request"));
        }
        let access = validate_capability(capability)?;

        self.driver
            .publish_volume(
                &request.volume_id,
                &request.staging_target_path,
                &request.target_path,
                &access,
                request.readonly,
                &request.volume_context,
            )
            .await?;
        Ok(Response::new(proto::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<proto::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<proto::NodeUnpublishVolumeResponse>, Status> {
        let request = request.into_inner();
        reject_oversized(&request)?;

        if request.volume_id.is_empty() {
            return Err(self.invalid("volume id missing in request"));
        }
        if request.target_path.is_empty() {
            return Err(self.invalid("target path missing in request"));
        }

        self.driver
            .unpublish_volume(&request.volume_id, &request.target_path)
            .await?;
        Ok(Response::new(proto::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<proto::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<proto::NodeGetCapabilitiesResponse>, Status> {
        use proto::node_service_capability::rpc::Type;
        use proto::node_service_capability::Rpc;

        Ok(Response::new(proto::NodeGetCapabilitiesResponse {
            capabilities: vec![proto::NodeServiceCapability {
                r#type: Some(proto::node_service_capability::Type::Rpc(Rpc {
                    r#type: Type::StageUnstageVolume as i32,
                })),
            }],
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<proto::NodeGetInfoRequest>,
    ) -> Result<Response<proto::NodeGetInfoResponse>, Status> {
        let mut segments = HashMap::new();
        segments.insert(
            self.driver.topology_key(),
            self.driver.node_id().to_string(),
        );
        Ok(Response::new(proto::NodeGetInfoResponse {
            node_id: self.driver.node_id().to_string(),
            max_volumes_per_node: 0,
            accessible_topology: Some(proto::Topology { segments }),
        }))
    }
}
