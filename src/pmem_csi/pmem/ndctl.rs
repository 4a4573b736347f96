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

use serde::Deserialize;
use serde_json::Value;

use crate::pmem_csi::logger::log_info;
use crate::pmem_csi::pmem::{
    Bus, CreateNamespaceRequest, Namespace, NamespaceMode, PmemProbe, ProbeError, ProbeFuture,
    ProbeResult, Region,
};
use crate::pmem_csi::util::command::run_command;
use crate::pmem_csi::util::error::with_context;

const COMPONENT: &str = "ndctl";

/// Probe backed by the `ndctl` command-line tool. All listings use the JSON
/// output mode; `ndctl` prints a single object instead of an array when
/// exactly one entry matches, so every listing goes through
/// `parse_listing`.
pub struct NdctlProbe;

#[derive(Debug, Deserialize)]
struct BusListing {
    dev: String,
    #[serde(default)]
    provider: String,
}

#[derive(Debug, Deserialize)]
struct RegionListing {
    dev: String,
    size: u64,
    #[serde(default)]
    available_size: u64,
    #[serde(default)]
    max_available_extent: u64,
    #[serde(default = "default_region_align")]
    align: u64,
    #[serde(default, rename = "type")]
    region_type: String,
}

fn default_region_align() -> u64 {
    // Interleave-set alignment on x86.
    16 * 1024 * 1024
}

#[derive(Debug, Deserialize)]
struct NamespaceListing {
    dev: String,
    #[serde(default)]
    name: String,
    mode: String,
    size: u64,
    #[serde(default)]
    blockdev: String,
    #[serde(default)]
    region: Option<String>,
}

fn parse_listing<T: serde::de::DeserializeOwned>(output: &str) -> ProbeResult<Vec<T>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|err| ProbeError::Io(with_context(err, "Failed to parse ndctl output")))?;
    let entries = match value {
        Value::Array(entries) => entries,
        object => vec![object],
    };
    entries
        .into_iter()
        .map(|entry| {
            serde_json::from_value(entry)
                .map_err(|err| ProbeError::Io(with_context(err, "Failed to decode ndctl entry")))
        })
        .collect()
}

fn listing_to_namespace(listing: NamespaceListing) -> ProbeResult<Namespace> {
    let mode: NamespaceMode = listing.mode.parse().map_err(ProbeError::Io)?;
    Ok(Namespace {
        name: listing.name,
        dev: listing.dev,
        mode,
        size: listing.size,
        region: listing.region,
        device: std::path::PathBuf::from(format!("/dev/{}", listing.blockdev)),
    })
}

async fn ndctl(args: Vec<String>) -> ProbeResult<String> {
    run_command("ndctl", &args)
        .await
        .map_err(|err| ProbeError::Io(with_context(err, "ndctl invocation failed")))
}

impl NdctlProbe {
    pub fn new() -> Self {
        NdctlProbe
    }

    async fn list_regions(bus: String) -> ProbeResult<Vec<Region>> {
        let output = ndctl(vec![
            "list".to_string(),
            "-R".to_string(),
            "-b".to_string(),
            bus.clone(),
        ])
        .await?;
        let listings: Vec<RegionListing> = parse_listing(&output)?;
        Ok(listings
            .into_iter()
            .filter(|r| r.region_type.is_empty() || r.region_type == "pmem")
            .map(|r| Region {
                bus: bus.clone(),
                dev: r.dev,
                size: r.size,
                available: r.available_size,
                max_available_extent: r.max_available_extent,
                align: r.align,
            })
            .collect())
    }

    async fn find_namespace(name: String) -> ProbeResult<Namespace> {
        let output = ndctl(vec!["list".to_string(), "-N".to_string()]).await?;
        let listings: Vec<NamespaceListing> = parse_listing(&output)?;
        for listing in listings {
            if listing.name == name {
                return listing_to_namespace(listing);
            }
        }
        Err(ProbeError::DeviceNotFound(format!("namespace '{}'", name)))
    }
}

impl Default for NdctlProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl PmemProbe for NdctlProbe {
    fn buses(&self) -> ProbeFuture<Vec<Bus>> {
        Box::pin(async move {
            let output = ndctl(vec!["list".to_string(), "-B".to_string()]).await?;
            let listings: Vec<BusListing> = parse_listing(&output)?;
            Ok(listings
                .into_iter()
                .map(|b| Bus {
                    dev: b.dev,
                    provider: b.provider,
                })
                .collect())
        })
    }

    fn active_regions(&self, bus: &str) -> ProbeFuture<Vec<Region>> {
        let bus = bus.to_string();
        Box::pin(Self::list_regions(bus))
    }

    fn max_available_extent(&self, region: &str) -> ProbeFuture<u64> {
        let region = region.to_string();
        Box::pin(async move {
            let output = ndctl(vec![
                "list".to_string(),
                "-R".to_string(),
                "-r".to_string(),
                region.clone(),
            ])
            .await?;
            let listings: Vec<RegionListing> = parse_listing(&output)?;
            listings
                .into_iter()
                .next()
                .map(|r| r.max_available_extent)
                .ok_or_else(|| ProbeError::DeviceNotFound(format!("region '{}'", region)))
        })
    }

    fn create_namespace(&self, request: CreateNamespaceRequest) -> ProbeFuture<Namespace> {
        Box::pin(async move {
            let mut args = vec![
                "create-namespace".to_string(),
                "--name".to_string(),
                request.name.clone(),
                "--size".to_string(),
                request.size.to_string(),
                "--mode".to_string(),
                request.mode.as_str().to_string(),
                "--align".to_string(),
                request.align.to_string(),
            ];
            if let Some(region) = request.region.as_ref() {
                args.push("--region".to_string());
                args.push(region.clone());
            }
            let output = ndctl(args).await?;
            let listings: Vec<NamespaceListing> = parse_listing(&output)?;
            let listing = listings.into_iter().next().ok_or_else(|| {
                ProbeError::Io(format!("no namespace reported for '{}'", request.name).into())
            })?;
            let namespace = listing_to_namespace(listing)?;
            log_info(
                COMPONENT,
                "Namespace created",
                &[
                    ("name", &namespace.name),
                    ("dev", &namespace.dev),
                    ("size", &namespace.size.to_string()),
                ],
            );
            Ok(namespace)
        })
    }

    fn destroy_namespace_by_name(&self, name: &str) -> ProbeFuture<()> {
        let name = name.to_string();
        Box::pin(async move {
            let namespace = Self::find_namespace(name.clone()).await?;
            ndctl(vec![
                "disable-namespace".to_string(),
                namespace.dev.clone(),
            ])
            .await?;
            ndctl(vec!["destroy-namespace".to_string(), namespace.dev.clone()]).await?;
            log_info(COMPONENT, "Namespace destroyed", &[("name", &name)]);
            Ok(())
        })
    }

    fn get_namespace_by_name(&self, name: &str) -> ProbeFuture<Namespace> {
        let name = name.to_string();
        Box::pin(Self::find_namespace(name))
    }

    fn active_namespaces(&self) -> ProbeFuture<Vec<Namespace>> {
        Box::pin(async move {
            let output = ndctl(vec!["list".to_string(), "-N".to_string()]).await?;
            let listings: Vec<NamespaceListing> = parse_listing(&output)?;
            listings.into_iter().map(listing_to_namespace).collect()
        })
    }
}
