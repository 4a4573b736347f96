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

mod ndctl;

pub use ndctl::NdctlProbe;

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;

use crate::pmem_csi::util::error::DynError;

pub const KIB: u64 = 1024;
pub const MIB: u64 = KIB * 1024;
pub const GIB: u64 = MIB * 1024;

/// Errors reported by the probe. Everything the platform tooling can fail
/// with collapses into these two kinds; callers never see tool-specific
/// failures.
#[derive(Debug)]
pub enum ProbeError {
    DeviceNotFound(String),
    Io(DynError),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::DeviceNotFound(what) => write!(f, "device not found: {}", what),
            ProbeError::Io(err) => write!(f, "pmem i/o error: {}", err),
        }
    }
}

impl Error for ProbeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProbeError::DeviceNotFound(_) => None,
            ProbeError::Io(err) => Some(err.as_ref()),
        }
    }
}

impl ProbeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProbeError::DeviceNotFound(_))
    }
}

pub type ProbeResult<T> = Result<T, ProbeError>;
pub type ProbeFuture<T> = Pin<Box<dyn Future<Output = ProbeResult<T>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceMode {
    Fsdax,
    Sector,
    Raw,
}

impl NamespaceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NamespaceMode::Fsdax => "fsdax",
            NamespaceMode::Sector => "sector",
            NamespaceMode::Raw => "raw",
        }
    }
}

impl fmt::Display for NamespaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NamespaceMode {
    type Err = DynError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "fsdax" => Ok(NamespaceMode::Fsdax),
            "sector" => Ok(NamespaceMode::Sector),
            "raw" => Ok(NamespaceMode::Raw),
            other => Err(format!("unknown namespace mode '{}'", other).into()),
        }
    }
}

/// An NVDIMM bus, e.g. `ndbus0`.
#[derive(Debug, Clone)]
pub struct Bus {
    pub dev: String,
    pub provider: String,
}

/// An interleave set on a bus that namespaces are carved from.
#[derive(Debug, Clone)]
pub struct Region {
    pub bus: String,
    pub dev: String,
    pub size: u64,
    pub available: u64,
    /// Largest contiguous free extent. Less than `available` once the
    /// region is fragmented.
    pub max_available_extent: u64,
    pub align: u64,
}

/// A named, region-backed block device.
#[derive(Debug, Clone)]
pub struct Namespace {
    pub name: String,
    pub dev: String,
    pub mode: NamespaceMode,
    pub size: u64,
    pub region: Option<String>,
    /// Block device node, `/dev/pmemN[.M][s]` on real hardware.
    pub device: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CreateNamespaceRequest {
    pub name: String,
    pub size: u64,
    pub mode: NamespaceMode,
    pub align: u64,
    /// Restrict creation to one region; any region with room otherwise.
    pub region: Option<String>,
}

/// Hardware access boundary. The probe is the only component that knows how
/// NVDIMMs are enumerated and namespaces are created; everything above it
/// works with the types in this module.
pub trait PmemProbe: Send + Sync {
    fn buses(&self) -> ProbeFuture<Vec<Bus>>;

    fn active_regions(&self, bus: &str) -> ProbeFuture<Vec<Region>>;

    fn max_available_extent(&self, region: &str) -> ProbeFuture<u64>;

    fn create_namespace(&self, request: CreateNamespaceRequest) -> ProbeFuture<Namespace>;

    fn destroy_namespace_by_name(&self, name: &str) -> ProbeFuture<()>;

    fn get_namespace_by_name(&self, name: &str) -> ProbeFuture<Namespace>;

    fn active_namespaces(&self) -> ProbeFuture<Vec<Namespace>>;
}
