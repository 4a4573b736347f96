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

use std::fs;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use log::warn;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

use crate::pmem_csi::csi::controller::ControllerService;
use crate::pmem_csi::csi::driver::CsiDriver;
use crate::pmem_csi::csi::identity::IdentityService;
use crate::pmem_csi::csi::node::NodeService;
use crate::pmem_csi::csi::proto::controller_server::ControllerServer;
use crate::pmem_csi::csi::proto::identity_server::IdentityServer;
use crate::pmem_csi::csi::proto::node_server::NodeServer;
use crate::pmem_csi::csi::MAX_MESSAGE_SIZE;
use crate::pmem_csi::logger::log_info;
use crate::pmem_csi::util::error::{with_context, DynError};

const COMPONENT: &str = "server";

/// Transport-level backstop above the service-level limit: messages between
/// the two bounds are decoded just far enough to be refused with the
/// documented "received message larger than max" status, anything bigger is
/// cut off during decoding.
const DECODE_HARD_LIMIT: usize = 4 * MAX_MESSAGE_SIZE;

/// Serve the Identity, Controller and Node services on one unix socket
/// until `shutdown` resolves. The co-located provisioner drives the
/// controller service through the same socket the orchestrator uses for
/// the node service.
pub async fn run_server(
    socket_path: &Path,
    driver: Arc<CsiDriver>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), DynError> {
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            with_context(
                err,
                format!("Failed to create socket directory {}", parent.display()),
            )
        })?;
    }
    // A previous lifetime of the driver may have left its socket behind.
    match fs::remove_file(socket_path) {
        Ok(()) => {
            warn!(
                target: COMPONENT,
                "Removed stale socket {} left by an earlier driver instance",
                socket_path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(with_context(
                err,
                format!("Failed to remove stale socket {}", socket_path.display()),
            ));
        }
    }

    let listener = UnixListener::bind(socket_path).map_err(|err| {
        with_context(
            err,
            format!("Failed to bind unix socket {}", socket_path.display()),
        )
    })?;
    let incoming = UnixListenerStream::new(listener);

    log_info(
        COMPONENT,
        "Serving CSI services",
        &[
            ("endpoint", &socket_path.display().to_string()),
            ("driver", driver.driver_name()),
            ("node-id", driver.node_id()),
        ],
    );

    Server::builder()
        .add_service(
            IdentityServer::new(IdentityService::new(Arc::clone(&driver)))
                .max_decoding_message_size(DECODE_HARD_LIMIT),
        )
        .add_service(
            ControllerServer::new(ControllerService::new(Arc::clone(&driver)))
                .max_decoding_message_size(DECODE_HARD_LIMIT),
        )
        .add_service(
            NodeServer::new(NodeService::new(Arc::clone(&driver)))
                .max_decoding_message_size(DECODE_HARD_LIMIT),
        )
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await
        .map_err(|err| with_context(err, "CSI server failed"))?;

    log_info(COMPONENT, "CSI server stopped", &[]);
    Ok(())
}
