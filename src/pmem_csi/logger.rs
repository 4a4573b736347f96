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

//! Structured logging for the driver. Operational code calls the
//! `log_*` helpers with a component tag and key/value metadata; the module
//! also installs itself as the `log` facade backend, so `log::warn!` style
//! output from this crate and from dependencies lands in the same format
//! (the record target becomes the component).

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU8, Ordering};
#[cfg(test)]
use std::sync::{Mutex, OnceLock};

use chrono::{SecondsFormat, Utc};
use log::{Level, LevelFilter, Log, Metadata, Record};
use serde_json::Value;

const SERVICE_NAME: &str = "pmem-csi";

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text = 0,
    Json = 1,
}

static LOG_FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Text as u8);

pub fn set_log_format(format: LogFormat) {
    LOG_FORMAT.store(format as u8, Ordering::Relaxed);
}

pub fn current_log_format() -> LogFormat {
    match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

/// Bridge from the `log` facade into the structured output.
struct FacadeLogger;

static FACADE: FacadeLogger = FacadeLogger;

impl Log for FacadeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        emit(
            record.level(),
            record.target(),
            &record.args().to_string(),
            &[],
        );
    }

    fn flush(&self) {}
}

/// Select the output format and install the facade backend. Called once at
/// startup; later calls only switch the format (the facade can be
/// registered a single time per process).
pub fn init(format: LogFormat) {
    set_log_format(format);
    if log::set_logger(&FACADE).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

/// Values that would confuse key=value parsing are emitted as JSON
/// strings, which also settles escaping.
fn quote_value(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_graphic() && !matches!(c, '"' | '\\' | '=' | ','));
    if plain {
        value.to_string()
    } else {
        Value::String(value.to_string()).to_string()
    }
}

fn emit(level: Level, component: &str, message: &str, metadata: &[(&str, &str)]) {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let pid = std::process::id().to_string();
    let level_str = level.to_string();
    let base: [(&str, &str); 6] = [
        ("ts", timestamp.as_str()),
        ("level", level_str.as_str()),
        ("service", SERVICE_NAME),
        ("component", component),
        ("pid", pid.as_str()),
        ("msg", message),
    ];

    let fields = base
        .iter()
        .chain(metadata.iter())
        .filter(|(key, _)| !key.is_empty());

    let line = match current_log_format() {
        LogFormat::Text => {
            let mut line = String::new();
            for (key, value) in fields {
                if !line.is_empty() {
                    line.push(' ');
                }
                let _ = write!(line, "{}={}", key, quote_value(value));
            }
            line
        }
        LogFormat::Json => {
            let mut payload = serde_json::Map::new();
            for (key, value) in fields {
                payload.insert((*key).to_string(), Value::String((*value).to_string()));
            }
            Value::Object(payload).to_string()
        }
    };

    write_line(level, &line);
}

pub fn log_debug(component: &str, message: &str, metadata: &[(&str, &str)]) {
    emit(Level::Debug, component, message, metadata);
}

pub fn log_info(component: &str, message: &str, metadata: &[(&str, &str)]) {
    emit(Level::Info, component, message, metadata);
}

pub fn log_warn(component: &str, message: &str, metadata: &[(&str, &str)]) {
    emit(Level::Warn, component, message, metadata);
}

pub fn log_error(component: &str, message: &str, metadata: &[(&str, &str)]) {
    emit(Level::Error, component, message, metadata);
}

#[cfg(not(test))]
fn write_line(level: Level, line: &str) {
    use std::io::Write;
    // Warnings and errors go to stderr, everything else to stdout.
    if level <= Level::Warn {
        let _ = writeln!(std::io::stderr().lock(), "{}", line);
    } else {
        let _ = writeln!(std::io::stdout().lock(), "{}", line);
    }
}

#[cfg(test)]
fn write_line(level: Level, line: &str) {
    captured_logs().lock().unwrap().push((level, line.to_string()));
}

#[cfg(test)]
fn captured_logs() -> &'static Mutex<Vec<(Level, String)>> {
    static STORE: OnceLock<Mutex<Vec<(Level, String)>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(Vec::new()))
}

#[cfg(test)]
pub fn take_test_logs() -> Vec<(Level, String)> {
    captured_logs().lock().unwrap().drain(..).collect()
}
