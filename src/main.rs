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

use std::process::exit;
use std::sync::Arc;

use pmem_csi::pmem_csi::config::{Config, DriverConfig};
use pmem_csi::pmem_csi::csi::driver::CsiDriver;
use pmem_csi::pmem_csi::csi::server::run_server;
use pmem_csi::pmem_csi::device::lvm::check_percentage_marker;
use pmem_csi::pmem_csi::device::{CliLvm, DeviceManagerFactory, ManagerRegistry};
use pmem_csi::pmem_csi::logger::{init as init_logger, log_error, log_info};
use pmem_csi::pmem_csi::pmem::NdctlProbe;
use pmem_csi::pmem_csi::state::FileState;
use pmem_csi::pmem_csi::util::error::DynError;

const COMPONENT: &str = "main";

async fn run() -> Result<(), DynError> {
    let config = DriverConfig::from_env()?;
    init_logger(config.log_format);

    let state_dir = Config::StateDir.verify()?;
    let mount_dir = Config::MountDir.verify()?;
    let socket_path = Config::Socket.get_path();

    check_percentage_marker(&state_dir, config.pmem_percentage)?;

    let registry = ManagerRegistry::new(
        Arc::new(NdctlProbe::new()),
        Arc::new(CliLvm),
        config.pmem_percentage,
    );
    let manager = registry.manager_for(config.device_manager).await?;

    let state = FileState::new(&state_dir)?;
    let driver = CsiDriver::new(
        config.driver_name.clone(),
        config.node_id.clone(),
        manager,
        registry,
        state,
        mount_dir,
    )
    .await;

    log_info(
        COMPONENT,
        "Driver initialized",
        &[
            ("driver", &config.driver_name),
            ("node-id", &config.node_id),
            ("device-manager", config.device_manager.as_str()),
            ("state-dir", &state_dir.display().to_string()),
        ],
    );

    run_server(&socket_path, driver, shutdown_signal()).await
}

async fn shutdown_signal() {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    log_info(COMPONENT, "Caught termination signal, draining", &[]);
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        log_error(COMPONENT, "Driver failed", &[("error", &err.to_string())]);
        exit(1);
    }
}
