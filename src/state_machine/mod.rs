/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Owns one entity's in-memory state, and sequences, durably logs, applies, and snapshots the transitions
//! that change it.
//!
//! ## Lifecycle
//!
//! A [`StateMachine`] starts [`Uninitialized`](MachineStatus::Uninitialized). [`StateMachine::restart`]
//! moves it through [`Replaying`](MachineStatus::Replaying) to [`Ready`](MachineStatus::Ready), after which
//! every [`StateMachine::apply`] passes through [`Applying`](MachineStatus::Applying) and back. A machine
//! that fails to restart, or whose log fails to accept an append, falls back to `Uninitialized` and refuses
//! transitions until it is restarted.
//!
//! ## Apply
//!
//! Applying an envelope:
//! 1. Checks that its kind belongs to this machine's [category](Entity::CATEGORY).
//! 2. Checks that its sequence number immediately follows the machine's.
//! 3. Reduces it over the current state. A rejected transition leaves log, sequence number and state
//!    untouched.
//! 4. Appends it to the write-ahead log. Only once the append is durable are the new sequence number and
//!    state published.
//! 5. Every `snapshot_interval` transitions, archives the current snapshot, writes a new one, and rotates
//!    the log. Failures here are logged and do not fail the apply.
//!
//! ## On-disk layout
//!
//! Each machine owns a directory containing:
//! - `wal`: the live [write-ahead log](crate::wal).
//! - `snapshot`: the current [snapshot](crate::snapshot), if one has been taken.
//! - `snapshot-<seq>-<unix secs>`: archived snapshots.
//! - `wal-<seq>-<unix secs>`: archived logs, holding the entries up to the snapshot at `<seq>`.

pub mod entity;

use std::{
    fmt::{self, Display, Formatter},
    fs, io,
    path::{Path, PathBuf},
    sync::{mpsc::Sender, Arc, Mutex, RwLock},
    time::SystemTime,
};

use chrono::Utc;

use crate::{
    config::{ConfigError, StateMachineConfiguration},
    events::*,
    snapshot::{SnapshotError, SnapshotStore},
    subscriber::{ReceiveError, TransitionSubscriber},
    transitions::{
        envelope::TransitionEnvelope, registry::TransitionRegistry, ReduceError,
        SubscriptionCategory, TransitionKind,
    },
    types::basic::{CommunityID, SequenceNumber},
    wal::{LogTail, WalError, WriteAheadLog},
};

pub use entity::{CommunityState, Entity};

const WAL_FILE: &str = "wal";

/// Directory of the host state machine under `state_dir`.
pub fn host_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("host")
}

/// Directory holding one subdirectory per community state machine under `state_dir`.
pub fn communities_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("communities")
}

pub fn community_dir(state_dir: &Path, community: &CommunityID) -> PathBuf {
    communities_dir(state_dir).join(community.as_str())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineStatus {
    Uninitialized,
    Replaying,
    Ready,
    Applying,
}

impl Display for MachineStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MachineStatus::Uninitialized => f.write_str("uninitialized"),
            MachineStatus::Replaying => f.write_str("replaying"),
            MachineStatus::Ready => f.write_str("ready"),
            MachineStatus::Applying => f.write_str("applying"),
        }
    }
}

pub struct StateMachine<E: Entity> {
    name: String,
    dir: PathBuf,
    registry: Arc<TransitionRegistry>,
    config: StateMachineConfiguration,
    status: Mutex<MachineStatus>,
    // Also serializes apply and restart.
    inner: Mutex<Inner>,
    // Replaced wholesale, never modified in place.
    state: RwLock<Arc<E>>,
}

struct Inner {
    wal: WriteAheadLog,
    snapshots: SnapshotStore,
    sequence_number: SequenceNumber,
    event_publisher: Option<Sender<Event>>,
}

impl<E: Entity> StateMachine<E> {
    /// Open the machine stored in `dir`, creating the directory if needed. The machine holds the default
    /// entity until it is [restarted](Self::restart).
    pub fn open(
        name: impl Into<String>,
        dir: impl Into<PathBuf>,
        registry: Arc<TransitionRegistry>,
        config: StateMachineConfiguration,
        event_publisher: Option<Sender<Event>>,
    ) -> Result<StateMachine<E>, StateMachineError> {
        config.validate().map_err(StateMachineError::Config)?;
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let wal = WriteAheadLog::open(dir.join(WAL_FILE), registry.clone()).map_err(StateMachineError::Log)?;
        let snapshots = SnapshotStore::open(&dir, E::CATEGORY)?;

        Ok(StateMachine {
            name: name.into(),
            dir,
            registry,
            config,
            status: Mutex::new(MachineStatus::Uninitialized),
            inner: Mutex::new(Inner {
                wal,
                snapshots,
                sequence_number: SequenceNumber::init(),
                event_publisher,
            }),
            state: RwLock::new(Arc::new(E::default())),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn wal_path(&self) -> PathBuf {
        self.dir.join(WAL_FILE)
    }

    pub fn category(&self) -> SubscriptionCategory {
        E::CATEGORY
    }

    pub fn status(&self) -> MachineStatus {
        *self.status.lock().unwrap()
    }

    /// The current state. Readers hold on to the returned value for a consistent view; applies publish a
    /// new value rather than modify this one.
    pub fn state(&self) -> Arc<E> {
        self.state.read().unwrap().clone()
    }

    /// The sequence number of the last applied transition, or 0 if none has been applied.
    pub fn sequence_number(&self) -> SequenceNumber {
        self.inner.lock().unwrap().sequence_number
    }

    /// Reconstruct state from the current snapshot and the write-ahead log, and become ready.
    ///
    /// Returns the sequence number reached. A log that cannot be replayed leaves the machine uninitialized.
    pub fn restart(&self) -> Result<SequenceNumber, StateMachineError> {
        let mut inner = self.inner.lock().unwrap();
        self.set_status(MachineStatus::Replaying);
        match self.replay(&mut inner) {
            Ok(sequence_number) => {
                self.set_status(MachineStatus::Ready);
                Ok(sequence_number)
            }
            Err(err) => {
                log::error!("{} failed to restart: {}", self.name, err);
                self.set_status(MachineStatus::Uninitialized);
                Err(err)
            }
        }
    }

    fn replay(&self, inner: &mut Inner) -> Result<SequenceNumber, StateMachineError> {
        // 1. Start from the current snapshot, if any.
        let (mut entity, baseline) = match inner.snapshots.load::<E>()? {
            Some((entity, metadata)) => (entity, metadata.sequence_number),
            None => (E::default(), SequenceNumber::init()),
        };

        // 2. Read back the log, dropping a torn tail left by an append that never returned.
        let contents = inner.wal.read_all().map_err(StateMachineError::Log)?;
        match contents.tail {
            LogTail::Clean => (),
            LogTail::Torn { line, error } => {
                log::warn!(
                    "{} has a torn log tail at line {} ({}), truncating it",
                    self.name,
                    line,
                    error
                );
                inner
                    .wal
                    .truncate_to(contents.valid_len)
                    .map_err(StateMachineError::Log)?;
            }
            LogTail::Corrupted { line, error } => {
                return Err(StateMachineError::CorruptLog { line, error })
            }
        }

        // 3. Fold the entries that follow the snapshot over it, in order and without gaps.
        let mut sequence_number = baseline;
        let mut replayed = 0;
        for entry in contents.entries {
            // A leading run of entries at or below the baseline survives a rotation that failed after its
            // snapshot succeeded. Past that run the log must keep increasing.
            if replayed == 0 && entry.sequence_number <= baseline {
                continue;
            }
            if entry.sequence_number != sequence_number.next() {
                return Err(StateMachineError::SequenceDiscontinuity {
                    expected: sequence_number.next(),
                    found: entry.sequence_number,
                });
            }
            entity = entity
                .reduce(&entry.transition)
                .map_err(|error| StateMachineError::Replay {
                    sequence_number: entry.sequence_number,
                    error,
                })?;
            sequence_number = entry.sequence_number;
            replayed += 1;
        }

        // 4. Publish the result.
        inner.sequence_number = sequence_number;
        *self.state.write().unwrap() = Arc::new(entity);

        log::debug!(
            "{} restarted at sequence number {} ({} replayed over baseline {})",
            self.name,
            sequence_number,
            replayed,
            baseline
        );
        Event::publish(
            &inner.event_publisher,
            Event::Restart(RestartEvent {
                timestamp: SystemTime::now(),
                category: E::CATEGORY,
                entity: self.name.clone(),
                baseline,
                sequence_number,
                replayed,
            }),
        );

        Ok(sequence_number)
    }

    /// Apply one sequenced transition. Returns the envelope as committed to the log.
    pub fn apply(&self, envelope: &TransitionEnvelope) -> Result<TransitionEnvelope, StateMachineError> {
        let kind = envelope.kind();
        let category = self
            .registry
            .category(kind)
            .ok_or(StateMachineError::UnregisteredKind { kind })?;
        if category != E::CATEGORY {
            return Err(StateMachineError::CategoryMismatch {
                expected: E::CATEGORY,
                found: category,
            });
        }

        let mut inner = self.inner.lock().unwrap();
        let status = self.status();
        if status != MachineStatus::Ready {
            return Err(StateMachineError::NotReady { status });
        }

        let expected = inner.sequence_number.next();
        if envelope.sequence_number != expected {
            return Err(StateMachineError::SequenceGap {
                expected,
                found: envelope.sequence_number,
            });
        }

        self.set_status(MachineStatus::Applying);
        let result = self.commit(&mut inner, envelope);
        match &result {
            Err(StateMachineError::Durability(err)) => {
                log::error!(
                    "{} failed to log {} #{}: {}",
                    self.name,
                    kind,
                    envelope.sequence_number,
                    err
                );
                self.set_status(MachineStatus::Uninitialized);
            }
            _ => self.set_status(MachineStatus::Ready),
        }
        result
    }

    fn commit(
        &self,
        inner: &mut Inner,
        envelope: &TransitionEnvelope,
    ) -> Result<TransitionEnvelope, StateMachineError> {
        let new_state = match self.state().reduce(&envelope.transition) {
            Ok(new_state) => new_state,
            Err(err) => {
                Event::publish(
                    &inner.event_publisher,
                    Event::RejectTransition(RejectTransitionEvent {
                        timestamp: SystemTime::now(),
                        category: E::CATEGORY,
                        entity: self.name.clone(),
                        kind: envelope.kind(),
                        sequence_number: envelope.sequence_number,
                        reason: err.to_string(),
                    }),
                );
                return Err(StateMachineError::Reduce(err));
            }
        };

        let committed = inner
            .wal
            .append(envelope)
            .map_err(StateMachineError::Durability)?;
        inner.sequence_number = committed.sequence_number;
        *self.state.write().unwrap() = Arc::new(new_state);

        Event::publish(
            &inner.event_publisher,
            Event::ApplyTransition(ApplyTransitionEvent {
                timestamp: SystemTime::now(),
                category: E::CATEGORY,
                entity: self.name.clone(),
                kind: committed.kind(),
                sequence_number: committed.sequence_number,
            }),
        );

        if committed.sequence_number.int() % self.config.snapshot_interval == 0 {
            self.take_snapshot(inner);
        }

        Ok(committed)
    }

    /// Archive the current snapshot, write a new one, and start a fresh log. Best-effort.
    fn take_snapshot(&self, inner: &mut Inner) {
        let sequence_number = inner.sequence_number;
        let state = self.state();

        match inner.snapshots.archive() {
            Ok(Some(archive)) => Event::publish(
                &inner.event_publisher,
                Event::ArchiveSnapshot(ArchiveSnapshotEvent {
                    timestamp: SystemTime::now(),
                    category: E::CATEGORY,
                    entity: self.name.clone(),
                    archive,
                }),
            ),
            Ok(None) => (),
            Err(err) => log::warn!("{} failed to archive its snapshot: {}", self.name, err),
        }

        if let Err(err) = inner.snapshots.save(state.as_ref(), sequence_number) {
            log::warn!(
                "{} failed to take a snapshot at sequence number {}: {}",
                self.name,
                sequence_number,
                err
            );
            return;
        }
        Event::publish(
            &inner.event_publisher,
            Event::TakeSnapshot(TakeSnapshotEvent {
                timestamp: SystemTime::now(),
                category: E::CATEGORY,
                entity: self.name.clone(),
                sequence_number,
            }),
        );

        let archive = self.dir.join(format!(
            "{}-{}-{}",
            WAL_FILE,
            sequence_number,
            Utc::now().timestamp()
        ));
        match inner.wal.rotate(&archive) {
            Ok(()) => Event::publish(
                &inner.event_publisher,
                Event::RotateLog(RotateLogEvent {
                    timestamp: SystemTime::now(),
                    category: E::CATEGORY,
                    entity: self.name.clone(),
                    archive,
                }),
            ),
            Err(err) => log::warn!("{} failed to rotate its log: {}", self.name, err),
        }
    }

    fn set_status(&self, status: MachineStatus) {
        *self.status.lock().unwrap() = status;
    }
}

impl<E: Entity> TransitionSubscriber for StateMachine<E> {
    fn receive(&self, envelope: &TransitionEnvelope) -> Result<(), ReceiveError> {
        self.apply(envelope)?;
        Ok(())
    }
}

/// Enumerates the ways applying or restarting a state machine can fail.
///
/// See [`is_fatal`](Self::is_fatal) for which of these require the machine to stop serving its entity.
#[derive(Debug)]
pub enum StateMachineError {
    /// The machine was opened with an unusable configuration.
    Config(ConfigError),

    /// The transition belongs in a log of another category.
    CategoryMismatch {
        expected: SubscriptionCategory,
        found: SubscriptionCategory,
    },

    /// The registry knows no category for the transition's kind.
    UnregisteredKind { kind: TransitionKind },

    NotReady { status: MachineStatus },

    /// The envelope's sequence number does not immediately follow the machine's.
    SequenceGap {
        expected: SequenceNumber,
        found: SequenceNumber,
    },

    /// The log does not continue contiguously from the snapshot.
    SequenceDiscontinuity {
        expected: SequenceNumber,
        found: SequenceNumber,
    },

    /// The reducer rejected the transition. Nothing was logged.
    Reduce(ReduceError),

    /// The log failed to accept an append. The transition was not committed.
    Durability(WalError),

    /// The log could not be read, or a torn tail could not be dropped.
    Log(WalError),

    /// A line in the middle of the log fails to decode.
    CorruptLog { line: usize, error: WalError },

    /// A logged transition cannot be reduced over the state it follows.
    Replay {
        sequence_number: SequenceNumber,
        error: ReduceError,
    },

    /// The current snapshot could not be loaded.
    Snapshot(SnapshotError),

    Io(io::Error),
}

impl StateMachineError {
    /// Whether this error means that the log and the state may have diverged, so that the machine must not
    /// continue serving its entity without operator intervention.
    pub fn is_fatal(&self) -> bool {
        match self {
            StateMachineError::Config(_)
            | StateMachineError::CategoryMismatch { .. }
            | StateMachineError::UnregisteredKind { .. }
            | StateMachineError::NotReady { .. }
            | StateMachineError::Reduce(_) => false,
            StateMachineError::SequenceGap { .. }
            | StateMachineError::SequenceDiscontinuity { .. }
            | StateMachineError::Durability(_)
            | StateMachineError::Log(_)
            | StateMachineError::CorruptLog { .. }
            | StateMachineError::Replay { .. }
            | StateMachineError::Snapshot(_)
            | StateMachineError::Io(_) => true,
        }
    }
}

impl Display for StateMachineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StateMachineError::Config(err) => write!(f, "invalid configuration: {}", err),
            StateMachineError::CategoryMismatch { expected, found } => write!(
                f,
                "state machine accepts {} transitions, got a {} transition",
                expected, found
            ),
            StateMachineError::UnregisteredKind { kind } => {
                write!(f, "no category is registered for {} transitions", kind)
            }
            StateMachineError::NotReady { status } => {
                write!(f, "state machine is {}, not ready", status)
            }
            StateMachineError::SequenceGap { expected, found } => write!(
                f,
                "expected sequence number {}, got {}",
                expected, found
            ),
            StateMachineError::SequenceDiscontinuity { expected, found } => write!(
                f,
                "log skips from sequence number {} to {}",
                expected, found
            ),
            StateMachineError::Reduce(err) => Display::fmt(err, f),
            StateMachineError::Durability(err) => write!(f, "transition was not committed: {}", err),
            StateMachineError::Log(err) => Display::fmt(err, f),
            StateMachineError::CorruptLog { line, error } => {
                write!(f, "log is corrupt at line {}: {}", line, error)
            }
            StateMachineError::Replay {
                sequence_number,
                error,
            } => write!(
                f,
                "logged transition #{} cannot be replayed: {}",
                sequence_number, error
            ),
            StateMachineError::Snapshot(err) => Display::fmt(err, f),
            StateMachineError::Io(err) => write!(f, "state directory i/o failed: {}", err),
        }
    }
}

impl std::error::Error for StateMachineError {}

impl From<ReduceError> for StateMachineError {
    fn from(value: ReduceError) -> Self {
        StateMachineError::Reduce(value)
    }
}

impl From<SnapshotError> for StateMachineError {
    fn from(value: SnapshotError) -> Self {
        StateMachineError::Snapshot(value)
    }
}

impl From<io::Error> for StateMachineError {
    fn from(value: io::Error) -> Self {
        StateMachineError::Io(value)
    }
}
