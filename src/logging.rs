/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the host's
//! [configuration](crate::config::Configuration::log_events).
//!
//! Habitat-rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages printed
//! onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations), for example
//! with [`setup_logger`].
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet is
//! how an [ApplyTransition](crate::events::ApplyTransitionEvent) is printed:
//!
//! ```text
//! ApplyTransition, 1701329264, COMMUNITY, c0, ADD_MEMBER, 2
//! ```
//!
//! In the snippet:
//! - The third value is the category of the state machine that applied the transition.
//! - The fourth value names the entity the state machine holds.
//! - The fifth value is the kind tag of the transition.
//! - The sixth value is its sequence number.

use std::{io, sync::Once, thread, time::SystemTime};

use log::LevelFilter;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const APPLY_TRANSITION: &str = "ApplyTransition";
pub const REJECT_TRANSITION: &str = "RejectTransition";
pub const TAKE_SNAPSHOT: &str = "TakeSnapshot";
pub const ARCHIVE_SNAPSHOT: &str = "ArchiveSnapshot";
pub const ROTATE_LOG: &str = "RotateLog";
pub const RESTART: &str = "Restart";

pub const START_PROCESS: &str = "StartProcess";
pub const STOP_PROCESS: &str = "StopProcess";
pub const PROCESS_FAILURE: &str = "ProcessFailure";
pub const RECONFIGURE_BACKNET: &str = "ReconfigureBacknet";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for ApplyTransitionEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |apply_transition_event: &ApplyTransitionEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                APPLY_TRANSITION,
                secs_since_unix_epoch(apply_transition_event.timestamp),
                apply_transition_event.category,
                apply_transition_event.entity,
                apply_transition_event.kind,
                apply_transition_event.sequence_number
            )
        };
        Box::new(logger)
    }
}

impl Logger for RejectTransitionEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |reject_transition_event: &RejectTransitionEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                REJECT_TRANSITION,
                secs_since_unix_epoch(reject_transition_event.timestamp),
                reject_transition_event.category,
                reject_transition_event.entity,
                reject_transition_event.kind,
                reject_transition_event.sequence_number,
                reject_transition_event.reason
            )
        };
        Box::new(logger)
    }
}

impl Logger for TakeSnapshotEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |take_snapshot_event: &TakeSnapshotEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                TAKE_SNAPSHOT,
                secs_since_unix_epoch(take_snapshot_event.timestamp),
                take_snapshot_event.category,
                take_snapshot_event.entity,
                take_snapshot_event.sequence_number
            )
        };
        Box::new(logger)
    }
}

impl Logger for ArchiveSnapshotEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |archive_snapshot_event: &ArchiveSnapshotEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                ARCHIVE_SNAPSHOT,
                secs_since_unix_epoch(archive_snapshot_event.timestamp),
                archive_snapshot_event.category,
                archive_snapshot_event.entity,
                archive_snapshot_event.archive.display()
            )
        };
        Box::new(logger)
    }
}

impl Logger for RotateLogEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |rotate_log_event: &RotateLogEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                ROTATE_LOG,
                secs_since_unix_epoch(rotate_log_event.timestamp),
                rotate_log_event.category,
                rotate_log_event.entity,
                rotate_log_event.archive.display()
            )
        };
        Box::new(logger)
    }
}

impl Logger for RestartEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |restart_event: &RestartEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                RESTART,
                secs_since_unix_epoch(restart_event.timestamp),
                restart_event.category,
                restart_event.entity,
                restart_event.baseline,
                restart_event.sequence_number,
                restart_event.replayed
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartProcessEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_process_event: &StartProcessEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                START_PROCESS,
                secs_since_unix_epoch(start_process_event.timestamp),
                start_process_event.process,
                start_process_event.community,
                start_process_event.pid,
                start_process_event.ports
            )
        };
        Box::new(logger)
    }
}

impl Logger for StopProcessEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |stop_process_event: &StopProcessEvent| {
            log::info!(
                "{}, {}, {}, {}",
                STOP_PROCESS,
                secs_since_unix_epoch(stop_process_event.timestamp),
                stop_process_event.process,
                stop_process_event.community
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProcessFailureEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |process_failure_event: &ProcessFailureEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PROCESS_FAILURE,
                secs_since_unix_epoch(process_failure_event.timestamp),
                process_failure_event
                    .process
                    .map(|process| process.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                process_failure_event.community,
                process_failure_event.error
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReconfigureBacknetEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |reconfigure_backnet_event: &ReconfigureBacknetEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RECONFIGURE_BACKNET,
                secs_since_unix_epoch(reconfigure_backnet_event.timestamp),
                reconfigure_backnet_event.community,
                reconfigure_backnet_event.ports
            )
        };
        Box::new(logger)
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

static LOGGER_INIT: Once = Once::new();

/// Install a [fern](https://docs.rs/fern) logger that prints every message at `level` and above to
/// standard output. Only the first call has an effect, and only if no other logger was installed before it.
pub fn setup_logger(level: LevelFilter) {
    LOGGER_INIT.call_once(|| {
        let _ = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{:?}][{}][{}] {}",
                    thread::current().id(),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .level(level)
            .chain(io::stdout())
            .apply();
    })
}
