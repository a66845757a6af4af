// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Runtime configuration and configuration file parsing

use crate::error::{self, ErrorKind};

use serde::Deserialize;

use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/bosllm.toml";

/// Default weight container location
pub const DEFAULT_MODEL_PATH: &str = "model.pt.bin";

/// Default sysfs name of the accelerator UIO device
pub const DEFAULT_UIO_NAME: &str = "llm-accel";

/// Default per-generation token budget
pub const DEFAULT_MAX_TOKENS: u32 = 50;

/// Default pause between status polls while generating
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// One host/device shared DDR window
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RegionSpec {
    pub phys: u64,
    pub size: u64,
}

/// Physical layout of all DDR reservations
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct MemoryLayout {
    pub weights: RegionSpec,
    pub kv_cache: RegionSpec,
    pub input_buffer: RegionSpec,
    pub output_buffer: RegionSpec,
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            weights: RegionSpec {
                phys: 0x1000_0000,
                size: 256 * 1024 * 1024,
            },
            kv_cache: RegionSpec {
                phys: 0x3000_0000,
                size: 512 * 1024 * 1024,
            },
            input_buffer: RegionSpec {
                phys: 0x2000_0000,
                size: 16 * 1024,
            },
            output_buffer: RegionSpec {
                phys: 0x2000_4000,
                size: 16 * 1024,
            },
        }
    }
}

impl MemoryLayout {
    /// Scaled-down reservations for the heap-backed simulation backend
    pub fn simulation() -> Self {
        Self {
            weights: RegionSpec {
                phys: 0x1000_0000,
                size: 64 * 1024 * 1024,
            },
            kv_cache: RegionSpec {
                phys: 0x3000_0000,
                size: 16 * 1024 * 1024,
            },
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub model_path: String,
    pub uio_name: String,
    /// Run against the in-process simulated backend instead of hardware
    pub simulation: bool,
    /// Treat a bad weight container as a fatal startup error instead of
    /// degrading to simulation without weights
    pub strict_weights: bool,
    pub max_tokens: u32,
    pub poll_interval_ms: u64,
    pub memory: MemoryLayout,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_path: DEFAULT_MODEL_PATH.to_string(),
            uio_name: DEFAULT_UIO_NAME.to_string(),
            simulation: false,
            strict_weights: false,
            max_tokens: DEFAULT_MAX_TOKENS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            memory: MemoryLayout::default(),
        }
    }
}

impl Config {
    /// Registers command line overrides for the configuration values
    pub fn add_args<'a, 'b>(app: clap::App<'a, 'b>) -> clap::App<'a, 'b> {
        app.arg(
            clap::Arg::with_name("model")
                .short("m")
                .long("model")
                .value_name("PATH")
                .help("Weight container to stage into DDR")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("uio")
                .long("uio")
                .value_name("NAME")
                .help("Sysfs name of the accelerator UIO device")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("sim")
                .long("sim")
                .help("Run against the simulated accelerator backend")
                .required(false),
        )
        .arg(
            clap::Arg::with_name("strict-weights")
                .long("strict-weights")
                .help("Fail startup when the weight container is invalid")
                .required(false),
        )
        .arg(
            clap::Arg::with_name("max-tokens")
                .long("max-tokens")
                .value_name("N")
                .help("Token budget per generation")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("poll-interval")
                .long("poll-interval")
                .value_name("MS")
                .help("Pause between status polls while generating")
                .required(false)
                .takes_value(true),
        )
    }

    /// Parse the configuration file at `config_path`. A missing file is
    /// an error only when the user named it explicitly.
    pub fn parse(config_path: &str, required: bool) -> error::Result<Self> {
        if !Path::new(config_path).exists() {
            if required {
                Err(ErrorKind::General(format!(
                    "configuration file {} not found",
                    config_path
                )))?
            }
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(config_path)?;
        let config = toml::from_str(&raw).map_err(|e| {
            ErrorKind::General(format!("configuration file {}: {}", config_path, e))
        })?;
        Ok(config)
    }

    /// Applies command line overrides on top of file/default values
    pub fn apply_args(&mut self, matches: &clap::ArgMatches) {
        if let Some(value) = matches.value_of("model") {
            self.model_path = value.to_string();
        }
        if let Some(value) = matches.value_of("uio") {
            self.uio_name = value.to_string();
        }
        if matches.is_present("sim") {
            self.simulation = true;
        }
        if matches.is_present("strict-weights") {
            self.strict_weights = true;
        }
        if let Some(value) = matches.value_of("max-tokens") {
            self.max_tokens = value.parse::<u32>().expect("not a number");
        }
        if let Some(value) = matches.value_of("poll-interval") {
            self.poll_interval_ms = value.parse::<u64>().expect("not a number");
        }
    }

    /// Shrinks the default DDR reservations when the simulated backend
    /// was selected and the user did not lay memory out explicitly
    pub fn resolve(&mut self) {
        if self.simulation && self.memory == MemoryLayout::default() {
            self.memory = MemoryLayout::simulation();
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
