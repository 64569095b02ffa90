/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration as specified by the operator.
//!
//! A [`Configuration`] can be built with its builder:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .state_dir("/var/lib/habitat/state")
//!     .backnet_data_dir("/var/lib/habitat/ipfs")
//!     .backnet_config_dir("/var/lib/habitat/config")
//!     .snapshot_interval(50)
//!     .log_events(true)
//!     .build()
//! ```
//!
//! or read from the environment with [`Configuration::from_env`]. It is split up into smaller, subsystem
//! specific configuration structs before being passed to components.

use std::{
    env,
    fmt::{self, Display, Formatter},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use typed_builder::TypedBuilder;

pub const STATE_DIR_VAR: &str = "HABITAT_STATE_DIR";
pub const BACKNET_DATA_DIR_VAR: &str = "IPFS_DIR";
pub const BACKNET_CONFIG_DIR_VAR: &str = "CONFIG_DIR";
pub const SNAPSHOT_INTERVAL_VAR: &str = "HABITAT_SNAPSHOT_INTERVAL";
pub const START_PORT_VAR: &str = "HABITAT_START_PORT";
pub const PORTS_PER_BACKNET_VAR: &str = "HABITAT_PORTS_PER_BACKNET";
pub const IPFS_BINARY_VAR: &str = "HABITAT_IPFS_BIN";

pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 100;
pub const DEFAULT_START_PORT: u16 = 4000;
/// Swarm, API and gateway.
pub const MIN_PORTS_PER_BACKNET: u16 = 3;

/// Stores the user-defined parameters of a host node.
///
/// ## Directories
///
/// State machines keep their logs and snapshots under `state_dir`: the host's in `host/`, and each
/// community's in `communities/<community id>/`. Backnets keep their data in
/// `backnet_data_dir/<community id>/`, and their generated configuration files in
/// `backnet_config_dir/<community id>/`.
///
/// ## Ports
///
/// Every backnet is given a block of `ports_per_backnet` consecutive ports, the first block starting at
/// `start_port`. A port is never handed out twice while the host runs.
#[derive(TypedBuilder, Clone, Debug)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.state_dir(...)`
    - `.backnet_data_dir(...)`
    - `.backnet_config_dir(...)`

    Optional:
    - `.snapshot_interval(...)`
    - `.start_port(...)`
    - `.ports_per_backnet(...)`
    - `.ipfs_binary(...)`
    - `.startup_timeout(...)`
    - `.shutdown_grace(...)`
    - `.failure_channel_capacity(...)`
    - `.launch_backnets(...)`
    - `.log_events(...)`
"))]
pub struct Configuration {
    #[builder(setter(into, doc = "Set the directory that logs and snapshots are stored in. Required."))]
    pub state_dir: PathBuf,
    #[builder(setter(into, doc = "Set the directory that backnets store their data in. Required."))]
    pub backnet_data_dir: PathBuf,
    #[builder(setter(into, doc = "Set the directory that generated backnet configuration files are written to. Required."))]
    pub backnet_config_dir: PathBuf,
    #[builder(default = DEFAULT_SNAPSHOT_INTERVAL, setter(doc = "Set how many transitions are applied between snapshots. Must be at least 1. Defaults to 100."))]
    pub snapshot_interval: u64,
    #[builder(default = DEFAULT_START_PORT, setter(doc = "Set the first port handed out to backnets. Defaults to 4000."))]
    pub start_port: u16,
    #[builder(default = MIN_PORTS_PER_BACKNET, setter(doc = "Set the size of the block of ports given to each backnet. Must be at least 3. Defaults to 3."))]
    pub ports_per_backnet: u16,
    #[builder(default = PathBuf::from("ipfs"), setter(into, doc = "Set the IPFS executable used to run backnets. Defaults to `ipfs`, looked up in `PATH`."))]
    pub ipfs_binary: PathBuf,
    #[builder(default = Duration::from_secs(60), setter(doc = "Set how long a backnet may take to report that it is ready. Defaults to 60 seconds."))]
    pub startup_timeout: Duration,
    #[builder(default = Duration::from_secs(10), setter(doc = "Set how long a stopping backnet may take to exit before it is killed. Defaults to 10 seconds."))]
    pub shutdown_grace: Duration,
    #[builder(default = 64, setter(doc = "Set the capacity of the channel that process failures are aggregated on. Defaults to 64."))]
    pub failure_channel_capacity: usize,
    #[builder(default = true, setter(doc = "Start backnets for hosted communities? Defaults to true."))]
    pub launch_backnets: bool,
    #[builder(default = false, setter(doc = "Enable logging of events? Defaults to false."))]
    pub log_events: bool,
}

impl Configuration {
    /// Read a configuration from the environment.
    ///
    /// `HABITAT_STATE_DIR`, `IPFS_DIR` and `CONFIG_DIR` are required. `HABITAT_SNAPSHOT_INTERVAL`,
    /// `HABITAT_START_PORT`, `HABITAT_PORTS_PER_BACKNET` and `HABITAT_IPFS_BIN` are optional.
    pub fn from_env() -> Result<Configuration, ConfigError> {
        let configuration = Configuration::builder()
            .state_dir(required(STATE_DIR_VAR)?)
            .backnet_data_dir(required(BACKNET_DATA_DIR_VAR)?)
            .backnet_config_dir(required(BACKNET_CONFIG_DIR_VAR)?)
            .snapshot_interval(parsed(SNAPSHOT_INTERVAL_VAR, DEFAULT_SNAPSHOT_INTERVAL)?)
            .start_port(parsed(START_PORT_VAR, DEFAULT_START_PORT)?)
            .ports_per_backnet(parsed(PORTS_PER_BACKNET_VAR, MIN_PORTS_PER_BACKNET)?)
            .ipfs_binary(env::var(IPFS_BINARY_VAR).unwrap_or_else(|_| "ipfs".to_string()))
            .build();
        configuration.validate()?;
        Ok(configuration)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.snapshot_interval == 0 {
            return Err(ConfigError::Invalid {
                field: "snapshot_interval",
                reason: "must be at least 1",
            });
        }
        if self.ports_per_backnet < MIN_PORTS_PER_BACKNET {
            return Err(ConfigError::Invalid {
                field: "ports_per_backnet",
                reason: "must be at least 3",
            });
        }
        Ok(())
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVariable { name })
}

fn parsed<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidVariable { name, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration related to state machines.
#[derive(Clone, Debug)]
pub struct StateMachineConfiguration {
    pub snapshot_interval: u64,
}

impl StateMachineConfiguration {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.snapshot_interval == 0 {
            return Err(ConfigError::Invalid {
                field: "snapshot_interval",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

/// Configuration related to the process supervisor and the backnets it runs.
#[derive(Clone, Debug)]
pub struct SupervisorConfiguration {
    pub backnet_data_dir: PathBuf,
    pub backnet_config_dir: PathBuf,
    pub start_port: u16,
    pub ports_per_backnet: u16,
    pub ipfs_binary: PathBuf,
    pub startup_timeout: Duration,
    pub shutdown_grace: Duration,
    pub failure_channel_capacity: usize,
}

impl Into<(StateMachineConfiguration, SupervisorConfiguration)> for Configuration {
    fn into(self) -> (StateMachineConfiguration, SupervisorConfiguration) {
        let state_machine_config = StateMachineConfiguration {
            snapshot_interval: self.snapshot_interval,
        };

        let supervisor_config = SupervisorConfiguration {
            backnet_data_dir: self.backnet_data_dir,
            backnet_config_dir: self.backnet_config_dir,
            start_port: self.start_port,
            ports_per_backnet: self.ports_per_backnet,
            ipfs_binary: self.ipfs_binary,
            startup_timeout: self.startup_timeout,
            shutdown_grace: self.shutdown_grace,
            failure_channel_capacity: self.failure_channel_capacity,
        };

        (state_machine_config, supervisor_config)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable { name: &'static str },
    InvalidVariable { name: &'static str, value: String },
    Invalid { field: &'static str, reason: &'static str },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingVariable { name } => {
                write!(f, "environment variable {} is not set", name)
            }
            ConfigError::InvalidVariable { name, value } => {
                write!(f, "environment variable {} has invalid value {:?}", name, value)
            }
            ConfigError::Invalid { field, reason } => write!(f, "{} {}", field, reason),
        }
    }
}

impl std::error::Error for ConfigError {}
