//! Per-command lifecycle tracking.
//!
//! Every tracked command owns a [`CommandTracker`]: a small state machine
//! that starts out pending and ends in exactly one terminal state.
//! Inbound events are fed to the tracker by the correlator; callers
//! suspend on [`CommandTracker::completion`] or
//! [`CommandTracker::any_response`] until the tracker resolves.
//!
//! A watchdog task links each tracker to its deadline and cancellation
//! token, so no waiter is ever left unresolved — timeout, cancellation
//! and connection loss all force a terminal outcome.

use crate::frame::{CommandFrame, EventFrame};
use crate::Error;
use core::time::Duration;
use log::{debug, trace, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Callback invoked with every inbound event routed to a command,
/// including non-terminal ones.
///
/// The callback runs while the tracker's internal lock is held and must
/// not call back into the tracker.
pub type ResponseCallback = Box<dyn Fn(&EventFrame) + Send + Sync>;

/// Terminal outcome of a tracked command.
///
/// `Ok` carries the final event (which may itself report a device-level
/// failure); `Err` carries a synthesized abort, timeout or transport error.
pub type CommandOutcome = crate::Result<EventFrame>;

/// Lifecycle state of a [`CommandTracker`].
///
/// All states except [`Pending`](TrackerState::Pending) are terminal.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum TrackerState {
    /// Awaiting a terminal response.
    Pending,
    /// Completed with a successful final response.
    Succeeded,
    /// Completed with a device-reported failure.
    Failed,
    /// Aborted because the deadline elapsed.
    TimedOut,
    /// Aborted by cancellation or connection loss.
    Cancelled,
}

struct Shared {
    state: TrackerState,
    outcome: Option<CommandOutcome>,
    /// Response that arrived before anyone was waiting for it; consumed
    /// by the next [`CommandTracker::any_response`] call so the event is
    /// not lost to a wakeup race.
    unobserved: Option<EventFrame>,
    callback: Option<ResponseCallback>,
}

/// Bookkeeping for a single in-flight command.
pub struct CommandTracker {
    id: u16,
    timeout: Duration,
    issued_at: Instant,
    command: Mutex<CommandFrame>,
    shared: Mutex<Shared>,
    deadline: watch::Sender<Instant>,
    done: watch::Sender<bool>,
    response: Notify,
    cancel: CancellationToken,
}

impl core::fmt::Debug for CommandTracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandTracker")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

impl CommandTracker {
    /// Creates a pending tracker and spawns its watchdog task.
    ///
    /// Must be called within a tokio runtime.
    pub(crate) fn new(
        id: u16,
        command: CommandFrame,
        timeout: Duration,
        cancel: CancellationToken,
        callback: Option<ResponseCallback>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let (deadline, _) = watch::channel(now + timeout);
        let (done, _) = watch::channel(false);

        let tracker = Arc::new(Self {
            id,
            timeout,
            issued_at: now,
            command: Mutex::new(command),
            shared: Mutex::new(Shared {
                state: TrackerState::Pending,
                outcome: None,
                unobserved: None,
                callback,
            }),
            deadline,
            done,
            response: Notify::new(),
            cancel,
        });

        tokio::spawn(Self::watchdog(Arc::clone(&tracker)));

        tracker
    }

    /// Returns the command's correlation id.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Returns a copy of the command frame as it would currently be sent.
    #[must_use]
    pub fn command(&self) -> CommandFrame {
        self.command.lock().unwrap().clone()
    }

    /// Returns the instant the command was issued.
    #[must_use]
    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TrackerState {
        self.shared.lock().unwrap().state
    }

    /// Whether the tracker has reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.shared.lock().unwrap().outcome.is_some()
    }

    /// Replaces the command payload in place.
    ///
    /// Used by the block-transfer engine to reuse one command id for
    /// every chunk of a transfer.
    pub fn rewrite_payload(&self, payload: Vec<u8>) {
        self.command.lock().unwrap().payload = payload;
    }

    /// Re-arms the timeout with the tracker's own duration.
    ///
    /// Called on every resend so an in-flight retransmission is not
    /// spuriously timed out.
    pub fn reset_timer(&self) {
        self.reset_timer_with(self.timeout);
    }

    /// Re-arms the timeout with an explicit duration.
    pub fn reset_timer_with(&self, timeout: Duration) {
        self.deadline.send_replace(Instant::now() + timeout);
        trace!("command {:#06x}: deadline re-armed for {timeout:?}", self.id);
    }

    /// Processes an inbound event routed to this command.
    ///
    /// The response callback (if any) observes every event. The tracker
    /// resolves terminally when `force_complete` is set or the event
    /// carries the completion flag; otherwise the event is cached for the
    /// next [`CommandTracker::any_response`] waiter.
    ///
    /// Returns whether the tracker is terminal after the call. Once
    /// terminal, further calls are logged and do not change the
    /// resolved outcome.
    pub fn process_response(&self, event: EventFrame, force_complete: bool) -> bool {
        let mut shared = self.shared.lock().unwrap();

        if shared.outcome.is_some() {
            debug!(
                "command {:#06x}: response after completion ignored ({:?})",
                self.id, event.kind
            );
            return true;
        }

        if let Some(callback) = &shared.callback {
            callback(&event);
        }

        let terminal = force_complete || event.response.is_completed();

        if terminal {
            shared.state = if event.failure_code().is_some() {
                TrackerState::Failed
            } else {
                TrackerState::Succeeded
            };
            shared.outcome = Some(Ok(event));
            shared.callback = None;
            drop(shared);

            self.finish();
        } else {
            shared.unobserved = Some(event);
            drop(shared);

            self.response.notify_waiters();
        }

        terminal
    }

    /// Forces the tracker into a terminal aborted state.
    ///
    /// No-op if the tracker is already terminal. Resolves every waiter
    /// with the given error.
    pub fn abort(&self, error: Error) {
        let mut shared = self.shared.lock().unwrap();

        if shared.outcome.is_some() {
            return;
        }

        shared.state = match error {
            Error::CommandTimeout => TrackerState::TimedOut,
            _ => TrackerState::Cancelled,
        };
        shared.outcome = Some(Err(error));
        shared.callback = None;
        drop(shared);

        self.finish();
    }

    /// Suspends until the command reaches a terminal state.
    pub async fn completion(&self) -> CommandOutcome {
        let mut done = self.done.subscribe();

        loop {
            if let Some(outcome) = &self.shared.lock().unwrap().outcome {
                return outcome.clone();
            }

            if done.changed().await.is_err() {
                // Unreachable while `self` is alive; resolve anyway.
                return Err(Error::CommandAborted);
            }
        }
    }

    /// Suspends until any response arrives, terminal or not.
    ///
    /// A response that arrived before this call returns immediately from
    /// the tracker's cache slot, so events are never lost to the race
    /// between arrival and the first waiter.
    pub async fn any_response(&self) -> CommandOutcome {
        loop {
            let notified = self.response.notified();

            {
                let mut shared = self.shared.lock().unwrap();

                if let Some(event) = shared.unobserved.take() {
                    return Ok(event);
                }

                if let Some(outcome) = &shared.outcome {
                    return outcome.clone();
                }
            }

            notified.await;
        }
    }

    fn finish(&self) {
        self.done.send_replace(true);
        self.response.notify_waiters();
    }

    /// Forces a terminal state when the deadline elapses or the
    /// cancellation token fires, whichever comes first.
    async fn watchdog(tracker: Arc<Self>) {
        let mut deadline = tracker.deadline.subscribe();
        let mut done = tracker.done.subscribe();

        loop {
            let at = *deadline.borrow_and_update();

            tokio::select! {
                () = sleep_until(at) => {
                    warn!(
                        "command {:#06x}: timed out after {:?}",
                        tracker.id,
                        tracker.issued_at.elapsed()
                    );
                    tracker.abort(Error::CommandTimeout);
                    break;
                }
                res = deadline.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
                _ = done.changed() => break,
                () = tracker.cancel.cancelled() => {
                    tracker.abort(Error::CommandAborted);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CommandKind, EventKind, ResponseCode, ResponseType};
    use crate::tests::init_logger;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TIMEOUT: Duration = Duration::from_secs(8);

    fn tracker(callback: Option<ResponseCallback>) -> Arc<CommandTracker> {
        CommandTracker::new(
            0x0001,
            CommandFrame::new(CommandKind::GetGatewayInformation, vec![]),
            TIMEOUT,
            CancellationToken::new(),
            callback,
        )
    }

    fn event(code: ResponseCode, completed: bool) -> EventFrame {
        EventFrame::new(
            EventKind::CommandStatus,
            0x0001,
            ResponseType::new(code, completed),
            vec![],
        )
    }

    #[tokio::test]
    async fn completion_resolves_on_final_event() {
        init_logger();

        let tracker = tracker(None);

        assert!(
            tracker.process_response(event(ResponseCode::Success, true), false),
            "final event should be terminal"
        );
        assert_eq!(
            tracker.state(),
            TrackerState::Succeeded,
            "state should be succeeded"
        );

        let outcome = tracker.completion().await.unwrap();

        assert!(
            outcome.response.is_completed(),
            "outcome should carry the final event"
        );
    }

    #[tokio::test]
    async fn non_final_event_is_cached_for_late_waiter() {
        init_logger();

        let tracker = tracker(None);

        assert!(
            !tracker.process_response(event(ResponseCode::TransferStarted, false), false),
            "non-final event should not be terminal"
        );
        assert_eq!(
            tracker.state(),
            TrackerState::Pending,
            "tracker should stay pending"
        );

        // The event arrived before anyone waited; it must not be lost.
        let response = tracker.any_response().await.unwrap();

        assert_eq!(
            response.response.code(),
            Some(ResponseCode::TransferStarted),
            "cached event should be returned"
        );
    }

    #[tokio::test]
    async fn terminal_outcome_is_idempotent() {
        init_logger();

        let tracker = tracker(None);
        let failure = EventFrame::new(
            EventKind::CommandStatus,
            0x0001,
            ResponseType::new(ResponseCode::Failure, true),
            vec![0x05],
        );

        tracker.process_response(failure, false);

        assert_eq!(tracker.state(), TrackerState::Failed, "state should be failed");

        // A late duplicate must not change the resolved value.
        assert!(
            tracker.process_response(event(ResponseCode::Success, true), false),
            "late event should still report terminal"
        );

        let outcome = tracker.completion().await.unwrap();

        assert_eq!(
            outcome.failure_code(),
            Some(0x05),
            "resolved value should be the first terminal event"
        );
        assert_eq!(tracker.state(), TrackerState::Failed, "state should be unchanged");
    }

    #[tokio::test]
    async fn callback_observes_every_event() {
        init_logger();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let tracker = tracker(Some(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        tracker.process_response(event(ResponseCode::TransferStarted, false), false);
        tracker.process_response(event(ResponseCode::TransferData, false), false);
        tracker.process_response(event(ResponseCode::Success, true), false);
        tracker.process_response(event(ResponseCode::Success, true), false);

        assert_eq!(
            seen.load(Ordering::SeqCst),
            3,
            "callback should see every event up to and including the terminal one"
        );
    }

    #[tokio::test]
    async fn abort_resolves_waiters() {
        init_logger();

        let tracker = tracker(None);

        tracker.abort(Error::CommandAborted);

        assert_eq!(
            tracker.completion().await.unwrap_err(),
            Error::CommandAborted,
            "completion should resolve with the abort error"
        );
        assert_eq!(
            tracker.any_response().await.unwrap_err(),
            Error::CommandAborted,
            "any-response waiters should resolve too"
        );
        assert_eq!(
            tracker.state(),
            TrackerState::Cancelled,
            "state should be cancelled"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_forces_timeout() {
        init_logger();

        let tracker = tracker(None);

        tokio::time::sleep(TIMEOUT + Duration::from_secs(1)).await;

        assert_eq!(
            tracker.completion().await.unwrap_err(),
            Error::CommandTimeout,
            "tracker should time out"
        );
        assert_eq!(
            tracker.state(),
            TrackerState::TimedOut,
            "state should be timed out"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reset_timer_defers_timeout() {
        init_logger();

        let tracker = tracker(None);

        tokio::time::sleep(Duration::from_secs(5)).await;
        tracker.reset_timer();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(
            !tracker.is_terminal(),
            "tracker should survive past the original deadline"
        );

        tokio::time::sleep(Duration::from_secs(4)).await;

        assert_eq!(
            tracker.state(),
            TrackerState::TimedOut,
            "tracker should time out at the re-armed deadline"
        );
    }

    #[tokio::test]
    async fn cancellation_token_aborts() {
        init_logger();

        let cancel = CancellationToken::new();
        let tracker = CommandTracker::new(
            0x0002,
            CommandFrame::new(CommandKind::GetRealTimeClock, vec![]),
            TIMEOUT,
            cancel.clone(),
            None,
        );

        cancel.cancel();

        assert_eq!(
            tracker.completion().await.unwrap_err(),
            Error::CommandAborted,
            "cancellation should abort the command"
        );
        assert_eq!(
            tracker.state(),
            TrackerState::Cancelled,
            "state should be cancelled"
        );
    }
}
