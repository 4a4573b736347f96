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

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

const DEFAULT_SLOTS: usize = 64;

/// Hashed keyed mutex. Operations on the same key are serialized, distinct
/// keys usually proceed in parallel (two keys may share a slot, which only
/// costs throughput, never correctness). A handler holds at most one key at
/// a time, so slot sharing cannot deadlock.
pub struct KeyMutex {
    slots: Vec<Mutex<()>>,
}

impl Default for KeyMutex {
    fn default() -> Self {
        Self::new(DEFAULT_SLOTS)
    }
}

impl KeyMutex {
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            slots: (0..slots).map(|_| Mutex::new(())).collect(),
        }
    }

    fn slot(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.slots.len()
    }

    pub async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        self.slots[self.slot(key)].lock().await
    }
}
