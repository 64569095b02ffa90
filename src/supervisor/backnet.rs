/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Drivers that materialize and launch the backnet of one community.
//!
//! A [`BacknetDriver`] knows how to turn a community's [`Backnet`] into an on-disk configuration, and how
//! to launch the backnet program and wait until it is serving. Only IPFS is implemented ([`IpfsDriver`]).
//!
//! ## IPFS
//!
//! The IPFS driver expects an `ipfs` executable that:
//! - Reads its data directory from the `IPFS_PATH` environment variable.
//! - Initializes a new data directory with `ipfs init <config file>`.
//! - Replaces the configuration of an existing data directory with `ipfs config replace <config file>`.
//! - Runs with `ipfs daemon`, printing `Daemon is ready` on its own line once it is serving.

use std::{
    fmt::{self, Display, Formatter},
    fs,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::mpsc::{self, RecvTimeoutError},
    thread,
    time::Duration,
};

use crate::types::{
    basic::CommunityID,
    community::{Backnet, BacknetType},
};

use super::{
    ipfs_config::{IpfsConfig, IpfsConfigError},
    ports::PortBlock,
    process::ProcessStartupError,
};

pub const IPFS_READY_LINE: &str = "Daemon is ready";
pub const IPFS_CONFIG_FILE: &str = "ipfs_config.json";

pub trait BacknetDriver: Send {
    fn backnet_type(&self) -> BacknetType;

    /// Write the configuration for `backnet` listening on `ports`, initializing the backnet's data if this
    /// is the first time it is configured. An existing backnet keeps its identity.
    fn configure(&mut self, backnet: &Backnet, ports: PortBlock) -> Result<(), BacknetError>;

    /// Launch the backnet and block until it reports that it is ready.
    fn launch(&mut self) -> Result<Child, ProcessStartupError>;
}

pub struct IpfsDriver {
    community_id: CommunityID,
    binary: PathBuf,
    data_dir: PathBuf,
    config_dir: PathBuf,
    startup_timeout: Duration,
}

impl IpfsDriver {
    /// Create a driver that keeps the community's data in `data_dir/<community id>` and its generated
    /// configuration in `config_dir/<community id>`.
    pub fn new(
        community_id: CommunityID,
        binary: PathBuf,
        data_dir: &Path,
        config_dir: &Path,
        startup_timeout: Duration,
    ) -> IpfsDriver {
        IpfsDriver {
            data_dir: data_dir.join(community_id.as_str()),
            config_dir: config_dir.join(community_id.as_str()),
            community_id,
            binary,
            startup_timeout,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(IPFS_CONFIG_FILE)
    }

    /// Whether `ipfs init` has already run on the data directory.
    pub fn is_initialized(&self) -> bool {
        self.data_dir.join("config").is_file()
    }

    fn run(&self, args: &[&str]) -> Result<(), BacknetError> {
        log::debug!(
            "running {} {} for {}",
            self.binary.display(),
            args.join(" "),
            self.community_id
        );
        let output = Command::new(&self.binary)
            .args(args)
            .env("IPFS_PATH", &self.data_dir)
            .stdin(Stdio::null())
            .output()
            .map_err(BacknetError::Io)?;

        if !output.status.success() {
            return Err(BacknetError::Command {
                command: args.join(" "),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

impl BacknetDriver for IpfsDriver {
    fn backnet_type(&self) -> BacknetType {
        BacknetType::Ipfs
    }

    fn configure(&mut self, backnet: &Backnet, ports: PortBlock) -> Result<(), BacknetError> {
        if backnet.backnet_type != BacknetType::Ipfs {
            return Err(BacknetError::WrongType {
                expected: BacknetType::Ipfs,
                found: backnet.backnet_type,
            });
        }

        create_private_dir(&self.data_dir)?;
        create_private_dir(&self.config_dir)?;

        let is_new = !self.is_initialized();
        let mut config = if is_new {
            IpfsConfig::generate()
        } else {
            IpfsConfig::from_file(&self.data_dir.join("config"))?
        };
        config.set_addresses(ports);
        config.set_bootstrap(backnet.bootstrap.clone());

        let config_path = self.config_path();
        config.write(&config_path)?;

        let config_path = config_path.to_string_lossy();
        if is_new {
            self.run(&["init", &config_path])
        } else {
            self.run(&["config", "replace", &config_path])
        }
    }

    fn launch(&mut self) -> Result<Child, ProcessStartupError> {
        let mut child = Command::new(&self.binary)
            .arg("daemon")
            .env("IPFS_PATH", &self.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(ProcessStartupError::Spawn)?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                stop_child(&mut child);
                return Err(ProcessStartupError::StartupFailed {
                    reason: "standard output was not captured".to_string(),
                });
            }
        };

        // The reader keeps draining stdout after the ready line, so the daemon never blocks on a full pipe.
        let (ready, ready_receiver) = mpsc::channel();
        let community_id = self.community_id.clone();
        thread::spawn(move || {
            let mut ready = Some(ready);
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                log::trace!("[{}] {}", community_id, line);
                if line.trim() == IPFS_READY_LINE {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(());
                    }
                }
            }
        });

        match ready_receiver.recv_timeout(self.startup_timeout) {
            Ok(()) => Ok(child),
            Err(RecvTimeoutError::Timeout) => {
                stop_child(&mut child);
                Err(ProcessStartupError::StartupTimeout {
                    after: self.startup_timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                stop_child(&mut child);
                Err(ProcessStartupError::StartupFailed {
                    reason: format!("output ended without {:?}", IPFS_READY_LINE),
                })
            }
        }
    }
}

fn stop_child(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn create_private_dir(dir: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

#[derive(Debug)]
pub enum BacknetError {
    /// The driver was asked to configure a backnet of another type.
    WrongType {
        expected: BacknetType,
        found: BacknetType,
    },
    Config(IpfsConfigError),
    /// An initialization or reconfiguration command exited unsuccessfully.
    Command {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    Io(io::Error),
}

impl Display for BacknetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BacknetError::WrongType { expected, found } => {
                write!(f, "expected a {} backnet, got a {} backnet", expected, found)
            }
            BacknetError::Config(err) => Display::fmt(err, f),
            BacknetError::Command {
                command,
                status,
                stderr,
            } => write!(
                f,
                "`{}` exited with status {:?}: {}",
                command, status, stderr
            ),
            BacknetError::Io(err) => write!(f, "backnet i/o failed: {}", err),
        }
    }
}

impl std::error::Error for BacknetError {}

impl From<IpfsConfigError> for BacknetError {
    fn from(value: IpfsConfigError) -> Self {
        BacknetError::Config(value)
    }
}

impl From<io::Error> for BacknetError {
    fn from(value: io::Error) -> Self {
        BacknetError::Io(value)
    }
}
