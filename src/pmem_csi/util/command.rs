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

use std::env;
use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;

use humantime::parse_duration;
use tokio::process::Command;
use tokio::time;

use crate::pmem_csi::logger::{log_debug, log_warn};
use crate::pmem_csi::util::error::{new_error, with_context, DynError};

const COMPONENT: &str = "exec";
const DEFAULT_TIMEOUT_SECS: u64 = 90;

/// Overall limit for a single external tool invocation. `shred` on large
/// volumes is the slowest caller, so the default is generous.
fn command_timeout() -> Duration {
    match env::var("PMEM_CSI_COMMAND_TIMEOUT") {
        Ok(value) => parse_duration(value.trim()).unwrap_or_else(|err| {
            log_warn(
                COMPONENT,
                "Failed to parse PMEM_CSI_COMMAND_TIMEOUT, using default",
                &[("error", &err.to_string())],
            );
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        }),
        Err(_) => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
    }
}

/// Run an external tool and return its combined stdout/stderr.
///
/// The child has `kill_on_drop` set, so cancelling the calling future (for
/// example because the RPC deadline expired) terminates the process instead
/// of leaking it. A non-zero exit becomes an error that carries the output.
pub async fn run_command<I, S>(program: &str, args: I) -> Result<String, DynError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_command_with_timeout(program, args, command_timeout()).await
}

pub async fn run_command_with_timeout<I, S>(
    program: &str,
    args: I,
    timeout: Duration,
) -> Result<String, DynError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<String> = args
        .into_iter()
        .map(|a| a.as_ref().to_string_lossy().into_owned())
        .collect();
    let argv = format!("{} {}", program, args.join(" "));
    log_debug(COMPONENT, "Running command", &[("argv", &argv)]);

    let mut command = Command::new(program);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match time::timeout(timeout, command.output()).await {
        Ok(result) => {
            result.map_err(|err| with_context(err, format!("Failed to run '{}'", argv)))?
        }
        Err(_) => {
            return Err(new_error(format!(
                "Command '{}' timed out after {:?}",
                argv, timeout
            )));
        }
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        return Err(new_error(format!(
            "Command '{}' failed with {}: {}",
            argv,
            output.status,
            combined.trim()
        )));
    }

    Ok(combined)
}
