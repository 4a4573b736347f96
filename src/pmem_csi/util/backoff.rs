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

use std::time::{Duration, Instant};

/// Capped exponential backoff: 1s initial delay, doubling up to a 10s cap.
/// After 30s without a `next()` call the sequence starts over from the
/// initial delay.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    cap: Duration,
    reset_after: Duration,
    factor: u32,
    current: Duration,
    last_step: Option<Instant>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(1),
            Duration::from_secs(10),
            Duration::from_secs(30),
            2,
        )
    }
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, cap: Duration, reset_after: Duration, factor: u32) -> Self {
        Self {
            initial,
            cap,
            reset_after,
            factor,
            current: initial,
            last_step: None,
        }
    }

    /// Returns the delay to sleep before the next attempt.
    pub fn next(&mut self) -> Duration {
        let now = Instant::now();
        if let Some(last) = self.last_step {
            if now.duration_since(last) >= self.reset_after {
                self.current = self.initial;
            }
        }
        self.last_step = Some(now);

        let delay = self.current;
        self.current = (self.current * self.factor).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.last_step = None;
    }
}
