/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The thread that fires event handlers.
//!
//! Components publish [events](crate::events) on a channel. The event bus thread receives them and calls,
//! in registration order, the default logging handler for the event (if
//! [`log_events`](crate::config::Configuration::log_events) is set) and then the user's handler (if one was
//! registered on the [`HostSpec`](crate::node::HostSpec)).

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{events::*, logging::Logger};

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Default)]
pub(crate) struct EventHandlers {
    pub(crate) apply_transition_handlers: Vec<HandlerPtr<ApplyTransitionEvent>>,
    pub(crate) reject_transition_handlers: Vec<HandlerPtr<RejectTransitionEvent>>,
    pub(crate) take_snapshot_handlers: Vec<HandlerPtr<TakeSnapshotEvent>>,
    pub(crate) archive_snapshot_handlers: Vec<HandlerPtr<ArchiveSnapshotEvent>>,
    pub(crate) rotate_log_handlers: Vec<HandlerPtr<RotateLogEvent>>,
    pub(crate) restart_handlers: Vec<HandlerPtr<RestartEvent>>,
    pub(crate) start_process_handlers: Vec<HandlerPtr<StartProcessEvent>>,
    pub(crate) stop_process_handlers: Vec<HandlerPtr<StopProcessEvent>>,
    pub(crate) process_failure_handlers: Vec<HandlerPtr<ProcessFailureEvent>>,
    pub(crate) reconfigure_backnet_handlers: Vec<HandlerPtr<ReconfigureBacknetEvent>>,
}

/// The user-defined handlers registered on a [`HostSpec`](crate::node::HostSpec).
#[derive(Default)]
pub(crate) struct UserHandlers {
    pub(crate) on_apply_transition: Option<HandlerPtr<ApplyTransitionEvent>>,
    pub(crate) on_reject_transition: Option<HandlerPtr<RejectTransitionEvent>>,
    pub(crate) on_take_snapshot: Option<HandlerPtr<TakeSnapshotEvent>>,
    pub(crate) on_archive_snapshot: Option<HandlerPtr<ArchiveSnapshotEvent>>,
    pub(crate) on_rotate_log: Option<HandlerPtr<RotateLogEvent>>,
    pub(crate) on_restart: Option<HandlerPtr<RestartEvent>>,
    pub(crate) on_start_process: Option<HandlerPtr<StartProcessEvent>>,
    pub(crate) on_stop_process: Option<HandlerPtr<StopProcessEvent>>,
    pub(crate) on_process_failure: Option<HandlerPtr<ProcessFailureEvent>>,
    pub(crate) on_reconfigure_backnet: Option<HandlerPtr<ReconfigureBacknetEvent>>,
}

fn handlers<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    handlers.extend(user_handler);
    handlers
}

impl EventHandlers {
    pub(crate) fn new(log_events: bool, user: UserHandlers) -> EventHandlers {
        EventHandlers {
            apply_transition_handlers: handlers(log_events, user.on_apply_transition),
            reject_transition_handlers: handlers(log_events, user.on_reject_transition),
            take_snapshot_handlers: handlers(log_events, user.on_take_snapshot),
            archive_snapshot_handlers: handlers(log_events, user.on_archive_snapshot),
            rotate_log_handlers: handlers(log_events, user.on_rotate_log),
            restart_handlers: handlers(log_events, user.on_restart),
            start_process_handlers: handlers(log_events, user.on_start_process),
            stop_process_handlers: handlers(log_events, user.on_stop_process),
            process_failure_handlers: handlers(log_events, user.on_process_failure),
            reconfigure_backnet_handlers: handlers(log_events, user.on_reconfigure_backnet),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.apply_transition_handlers.is_empty()
            && self.reject_transition_handlers.is_empty()
            && self.take_snapshot_handlers.is_empty()
            && self.archive_snapshot_handlers.is_empty()
            && self.rotate_log_handlers.is_empty()
            && self.restart_handlers.is_empty()
            && self.start_process_handlers.is_empty()
            && self.stop_process_handlers.is_empty()
            && self.process_failure_handlers.is_empty()
            && self.reconfigure_backnet_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::ApplyTransition(apply_transition_event) => self
                .apply_transition_handlers
                .iter()
                .for_each(|handler| handler(&apply_transition_event)),

            Event::RejectTransition(reject_transition_event) => self
                .reject_transition_handlers
                .iter()
                .for_each(|handler| handler(&reject_transition_event)),

            Event::TakeSnapshot(take_snapshot_event) => self
                .take_snapshot_handlers
                .iter()
                .for_each(|handler| handler(&take_snapshot_event)),

            Event::ArchiveSnapshot(archive_snapshot_event) => self
                .archive_snapshot_handlers
                .iter()
                .for_each(|handler| handler(&archive_snapshot_event)),

            Event::RotateLog(rotate_log_event) => self
                .rotate_log_handlers
                .iter()
                .for_each(|handler| handler(&rotate_log_event)),

            Event::Restart(restart_event) => self
                .restart_handlers
                .iter()
                .for_each(|handler| handler(&restart_event)),

            Event::StartProcess(start_process_event) => self
                .start_process_handlers
                .iter()
                .for_each(|handler| handler(&start_process_event)),

            Event::StopProcess(stop_process_event) => self
                .stop_process_handlers
                .iter()
                .for_each(|handler| handler(&stop_process_event)),

            Event::ProcessFailure(process_failure_event) => self
                .process_failure_handlers
                .iter()
                .for_each(|handler| handler(&process_failure_event)),

            Event::ReconfigureBacknet(reconfigure_backnet_event) => self
                .reconfigure_backnet_handlers
                .iter()
                .for_each(|handler| handler(&reconfigure_backnet_event)),
        }
    }
}

/// Start the event bus thread. It runs until `shutdown_signal` fires or every publisher is dropped, and
/// drains the events already published before returning.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => {
                while let Ok(event) = event_subscriber.try_recv() {
                    event_handlers.fire_handlers(event)
                }
                return;
            }
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.recv_timeout(POLL_INTERVAL) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}
