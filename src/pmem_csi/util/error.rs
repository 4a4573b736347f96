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

use std::error::Error;
use std::fmt;

/// Error type used throughout the crate wherever no CSI status code has to
/// be derived from the failure. The layers feeding the RPC surface use
/// their own typed enums (`DeviceError`, `MountError`, `ProbeError`) and
/// keep a `DynError` as the source.
pub type DynError = Box<dyn Error + Send + Sync>;

/// The one concrete error this crate creates itself: the operation that
/// failed, plus whatever lower-level failure triggered it. Everything else
/// flowing through a `DynError` comes from std or a dependency.
#[derive(Debug)]
struct OpFailure {
    operation: String,
    source: Option<DynError>,
}

impl fmt::Display for OpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source.as_ref() {
            Some(source) => write!(f, "{}: {}", self.operation, source),
            None => f.write_str(&self.operation),
        }
    }
}

impl Error for OpFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|source| {
            let source: &(dyn Error + 'static) = source.as_ref();
            source
        })
    }
}

/// Annotate a lower-level failure with the operation that ran into it.
pub fn with_context<E>(error: E, context: impl Into<String>) -> DynError
where
    E: Into<DynError>,
{
    Box::new(OpFailure {
        operation: context.into(),
        source: Some(error.into()),
    })
}

/// A failure that originates here, with nothing underneath it.
pub fn new_error(message: impl Into<String>) -> DynError {
    Box::new(OpFailure {
        operation: message.into(),
        source: None,
    })
}
