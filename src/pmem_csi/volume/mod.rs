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

pub mod parameters;

pub use parameters::{Origin, Persistency, VolumeParameters};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};

/// The persisted form of a volume: everything needed to find and manage its
/// device again after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub id: String,
    pub size: i64,
    #[serde(rename = "parameters")]
    pub params: HashMap<String, String>,
}

/// Derive the stable volume ID from the orchestrator-chosen name.
///
/// The name itself cannot be the ID: it may be up to 128 characters and may
/// contain characters that LVM and namespace names reject, while namespace
/// names cap out at 63. Hashing gives a deterministic, collision-resistant
/// ID; the leading characters of the name are kept to help humans reading
/// logs.
pub fn generate_volume_id(name: &str) -> String {
    let mut hasher = Sha224::new();
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let hash: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    let prefix: String = name.chars().take(6).collect();
    format!("{}-{}", prefix, hash)
}
