//! Connection gate, send paths and inbound event correlation.
//!
//! A [`Connection`] ties the command machinery together: it gates every
//! send behind the session state, allocates trackers through the
//! [`registry`](crate::registry), pushes encoded frames into the
//! [`Transport`], and routes inbound events back to the commands that
//! caused them.
//!
//! The crate does not own the physical link. The embedder implements
//! [`Transport`] for outgoing frames and calls
//! [`Connection::handle_frame`] with each inbound frame from whatever
//! task owns the socket, serial port or BLE link. Device discovery,
//! payload codecs and version negotiation likewise stay outside, behind
//! the [`DeviceDirectory`], [`MetricsSink`] and [`VersionGate`] traits.

use crate::frame::{
    CommandFrame, CommandKind, DeviceAddress, EventFrame, EventKind, ResponseCode, ResponseType,
    NO_RESPONSE_COMMAND_ID,
};
use crate::registry::{CommandRegistry, Lookup};
use crate::throttle::SerialQueue;
use crate::tracker::{CommandTracker, ResponseCallback};
use crate::Error;
use async_trait::async_trait;
use core::time::Duration;
use log::{debug, info, trace, warn};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Byte-stream sink for outgoing frames.
///
/// Implementations frame and deliver the bytes however the physical
/// link requires; the engine treats a returned error as a dropped send.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one encoded frame.
    async fn send_raw(&self, frame: &[u8]) -> std::io::Result<()>;
}

/// Read-only view of the gateway's device table.
///
/// Consulted before block transfers and while waiting for a device to
/// drop into its bootloader.
pub trait DeviceDirectory: Send + Sync {
    /// Whether the device is currently present and online.
    fn is_online(&self, target: DeviceAddress) -> bool;
}

/// Device directory that reports every device as online.
pub struct AlwaysOnline;

impl DeviceDirectory for AlwaysOnline {
    fn is_online(&self, _target: DeviceAddress) -> bool {
        true
    }
}

/// Observer for per-session protocol counters.
///
/// All methods default to no-ops so embedders only implement what they
/// record.
pub trait MetricsSink: Send + Sync {
    /// A command was handed to the transport.
    fn command_sent(&self, kind: CommandKind) {
        let _ = kind;
    }

    /// A command failed to send or reported a device-level failure.
    fn command_failed(&self, kind: CommandKind) {
        let _ = kind;
    }

    /// An event frame was decoded.
    fn event_received(&self, kind: EventKind) {
        let _ = kind;
    }

    /// A new session began; per-session counters should restart.
    fn session_reset(&self) {}
}

/// Metrics sink that records nothing.
pub struct NullMetrics;

impl MetricsSink for NullMetrics {}

/// Result of the external protocol-version negotiation.
pub trait VersionGate: Send + Sync {
    /// Whether the minimum protocol version has been negotiated.
    ///
    /// Until this returns `true`, only bootstrap event kinds are
    /// processed; everything else is dropped silently.
    fn is_minimum_version_met(&self) -> bool;
}

/// Version gate that lets every event through.
pub struct NoVersionGate;

impl VersionGate for NoVersionGate {
    fn is_minimum_version_met(&self) -> bool {
        true
    }
}

/// Tunables of a [`Connection`].
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Deadline for ordinary commands.
    pub command_timeout: Duration,
    /// Deadline for block-transfer start and finish commands.
    pub transfer_timeout: Duration,
    /// Backoff before retransmitting a failed transfer chunk.
    pub retry_backoff: Duration,
    /// Poll interval while draining a transfer's reply queue.
    pub poll_interval: Duration,
    /// Minimum gap between parameter reads/writes.
    pub parameter_gap: Duration,
    /// Minimum gap between trouble-code fetches.
    pub trouble_code_gap: Duration,
    /// Ceiling on retransmissions of a single chunk; `None` retries
    /// until the command times out.
    pub max_chunk_retries: Option<u32>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(8),
            transfer_timeout: Duration::from_secs(16),
            retry_backoff: Duration::from_millis(200),
            poll_interval: Duration::from_millis(5),
            parameter_gap: Duration::from_millis(100),
            trouble_code_gap: Duration::from_millis(500),
            max_chunk_retries: None,
        }
    }
}

/// A session with one gateway.
pub struct Connection {
    transport: Arc<dyn Transport>,
    registry: CommandRegistry,
    directory: Arc<dyn DeviceDirectory>,
    metrics: Arc<dyn MetricsSink>,
    versions: Arc<dyn VersionGate>,
    config: ConnectionConfig,
    clock: Mutex<Option<u32>>,
    parameter_queue: SerialQueue,
    trouble_code_queue: SerialQueue,
}

impl Connection {
    /// Constructs a connection in the stopped, disconnected state.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        Self {
            transport,
            registry: CommandRegistry::new(),
            directory: Arc::new(AlwaysOnline),
            metrics: Arc::new(NullMetrics),
            versions: Arc::new(NoVersionGate),
            parameter_queue: SerialQueue::new(config.parameter_gap),
            trouble_code_queue: SerialQueue::new(config.trouble_code_gap),
            config,
            clock: Mutex::new(None),
        }
    }

    /// Replaces the device directory collaborator.
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn DeviceDirectory>) -> Self {
        self.directory = directory;
        self
    }

    /// Replaces the metrics sink collaborator.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replaces the version-gate collaborator.
    #[must_use]
    pub fn with_version_gate(mut self, versions: Arc<dyn VersionGate>) -> Self {
        self.versions = versions;
        self
    }

    /// Returns the connection tunables.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Marks the engine as started or stopped.
    pub fn set_started(&self, started: bool) {
        self.registry.set_started(started);
    }

    /// Marks the link as connected or dropped.
    ///
    /// Dropping the link synchronously aborts every active command and
    /// clears the cached real-time clock. Re-connecting resets the
    /// per-session metric counters and performs no automatic resend;
    /// in-flight callers must re-issue.
    pub fn set_connected(&self, connected: bool) {
        self.registry.set_connected(connected);

        if connected {
            self.metrics.session_reset();
        } else {
            *self.clock.lock().unwrap() = None;
        }
    }

    /// Whether the session is both started and connected.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.registry.is_online()
    }

    /// Number of currently active commands.
    #[must_use]
    pub fn active_commands(&self) -> usize {
        self.registry.active_count()
    }

    /// Returns the most recently reported real-time clock value.
    ///
    /// `None` until the gateway reports one, and again after a disconnect.
    #[must_use]
    pub fn real_time_clock(&self) -> Option<u32> {
        *self.clock.lock().unwrap()
    }

    pub(crate) fn directory(&self) -> &dyn DeviceDirectory {
        self.directory.as_ref()
    }

    pub(crate) fn flush_finished(&self) {
        self.registry.flush_finished();
    }

    /// Sends a tracked command and returns its tracker.
    ///
    /// A command with an unassigned id receives a fresh one. The
    /// callback, if any, observes every event routed to the command.
    ///
    /// # Errors
    ///
    /// - [`Error::Offline`] if the session is offline or the active
    ///   command cap has been reached.
    /// - [`Error::InvalidCommand`] if the id is the fire-and-forget
    ///   sentinel.
    /// - [`Error::CommandAlreadyRunning`] if the id is already active.
    /// - [`Error::NoCommandIdsAvailable`] if no free id exists.
    /// - [`Error::Transport`] if the transport rejected the frame; the
    ///   tracker is aborted before this returns.
    pub async fn submit(
        &self,
        command: CommandFrame,
        timeout: Duration,
        cancel: &CancellationToken,
        callback: Option<ResponseCallback>,
    ) -> crate::Result<Arc<CommandTracker>> {
        let kind = command.kind;
        let tracker = self.registry.admit(command.id, move |id| {
            let mut command = command;

            command.id = id;

            CommandTracker::new(id, command, timeout, cancel.child_token(), callback)
        })?;

        debug!("command {:#06x}: sending {kind:?}", tracker.id());
        self.metrics.command_sent(kind);

        if let Err(err) = self.transport.send_raw(&tracker.command().encode()).await {
            warn!("command {:#06x}: send failed: {err}", tracker.id());
            self.metrics.command_failed(kind);
            tracker.abort(Error::Transport(err.to_string()));
            self.registry.flush_finished();

            return Err(Error::Transport(err.to_string()));
        }

        Ok(tracker)
    }

    /// Retransmits an active command on its existing id.
    ///
    /// Re-arms the tracker's deadline and reissues the command's current
    /// bytes. Never allocates a new id.
    ///
    /// # Errors
    ///
    /// - [`Error::Offline`] if the session is offline.
    /// - [`Error::InvalidCommand`] if the tracker is no longer the
    ///   active entry for its id.
    /// - [`Error::Transport`] if the transport rejected the frame; the
    ///   tracker is aborted before this returns.
    pub async fn resend(&self, tracker: &Arc<CommandTracker>) -> crate::Result<()> {
        if !self.registry.is_online() {
            return Err(Error::Offline);
        }

        self.registry.flush_finished();

        let Lookup::Active(entry) = self.registry.lookup(tracker.id()) else {
            return Err(Error::InvalidCommand);
        };

        if !Arc::ptr_eq(&entry, tracker) {
            return Err(Error::InvalidCommand);
        }

        tracker.reset_timer();

        if let Err(err) = self.transport.send_raw(&tracker.command().encode()).await {
            warn!("command {:#06x}: resend failed: {err}", tracker.id());
            tracker.abort(Error::Transport(err.to_string()));
            self.registry.flush_finished();

            return Err(Error::Transport(err.to_string()));
        }

        Ok(())
    }

    /// Sends a command without tracking it.
    ///
    /// # Errors
    ///
    /// - [`Error::Offline`] if the session is offline.
    /// - [`Error::Transport`] if the transport rejected the frame.
    pub async fn fire_and_forget(&self, command: &CommandFrame) -> crate::Result<()> {
        if !self.registry.is_online() {
            return Err(Error::Offline);
        }

        self.metrics.command_sent(command.kind);

        self.transport.send_raw(&command.encode()).await.map_err(|err| {
            warn!("fire-and-forget {:?}: send failed: {err}", command.kind);
            Error::Transport(err.to_string())
        })
    }

    /// Sends a command and awaits its terminal outcome.
    ///
    /// A command carrying the fire-and-forget sentinel id is sent
    /// untracked and yields an immediate synthetic success. A terminal
    /// failure event maps to [`Error::CommandFailed`] with the
    /// device-reported code.
    pub async fn execute(
        &self,
        command: CommandFrame,
        cancel: &CancellationToken,
    ) -> crate::Result<EventFrame> {
        if command.id == NO_RESPONSE_COMMAND_ID {
            self.fire_and_forget(&command).await?;

            return Ok(EventFrame::new(
                EventKind::CommandStatus,
                NO_RESPONSE_COMMAND_ID,
                ResponseType::new(ResponseCode::Success, true),
                vec![],
            ));
        }

        let timeout = match command.kind {
            CommandKind::StartBlockTransfer => self.config.transfer_timeout,
            _ => self.config.command_timeout,
        };
        let kind = command.kind;
        let tracker = self.submit(command, timeout, cancel, None).await?;
        let outcome = tracker.completion().await;

        self.registry.flush_finished();

        let event = outcome?;

        if let Some(code) = event.failure_code() {
            self.metrics.command_failed(kind);

            return Err(Error::CommandFailed(code));
        }

        Ok(event)
    }

    /// Reads a device parameter (PID) through the parameter serial queue.
    ///
    /// Consecutive parameter operations are spaced by the configured gap
    /// to respect device-side rate limits. The payload layout is owned
    /// by the device-family codec.
    pub async fn read_parameter(
        &self,
        payload: Vec<u8>,
        cancel: &CancellationToken,
    ) -> crate::Result<EventFrame> {
        self.parameter_queue
            .run(self.execute(CommandFrame::new(CommandKind::ReadParameter, payload), cancel))
            .await
    }

    /// Writes a device parameter (PID) through the parameter serial queue.
    pub async fn write_parameter(
        &self,
        payload: Vec<u8>,
        cancel: &CancellationToken,
    ) -> crate::Result<EventFrame> {
        self.parameter_queue
            .run(self.execute(CommandFrame::new(CommandKind::WriteParameter, payload), cancel))
            .await
    }

    /// Fetches diagnostic trouble codes.
    ///
    /// Fetches are throttled through a single-slot queue; a fetch
    /// attempted while another one is running fails with
    /// [`Error::TooManyCommandsRunning`] instead of queueing.
    pub async fn fetch_trouble_codes(
        &self,
        payload: Vec<u8>,
        cancel: &CancellationToken,
    ) -> crate::Result<EventFrame> {
        self.trouble_code_queue
            .try_run(self.execute(CommandFrame::new(CommandKind::GetTroubleCodes, payload), cancel))
            .await?
    }

    /// Routes one inbound frame.
    ///
    /// Undecodable frames are logged and dropped; events for finished or
    /// unknown commands are logged and ignored. Never panics on
    /// malformed input.
    pub fn handle_frame(&self, frame: &[u8]) {
        let Ok(event) = EventFrame::decode(frame) else {
            warn!("dropping undecodable frame: {frame:02x?}");
            return;
        };

        self.metrics.event_received(event.kind);

        if !event.kind.is_bootstrap() && !self.versions.is_minimum_version_met() {
            trace!(
                "dropping {:?} event, minimum protocol version not negotiated",
                event.kind
            );
            return;
        }

        if event.kind == EventKind::RealTimeClock {
            self.update_clock(&event);
        }

        match event.command_id {
            0 | NO_RESPONSE_COMMAND_ID => {
                debug!("unsolicited {:?} event", event.kind);
            }
            id => match self.registry.lookup(id) {
                Lookup::Active(tracker) => {
                    if event.failure_code().is_some() {
                        self.metrics.command_failed(tracker.command().kind);
                    }

                    if tracker.process_response(event, false) {
                        self.registry.flush_finished();
                    }
                }
                Lookup::Finished(_) => {
                    info!("event for already-finished command {id:#06x}");
                }
                Lookup::Unknown => {
                    warn!("event for unknown command {id:#06x}");
                }
            },
        }
    }

    fn update_clock(&self, event: &EventFrame) {
        if let Some(bytes) = event.payload.first_chunk::<4>() {
            let value = u32::from_be_bytes(*bytes);

            *self.clock.lock().unwrap() = Some(value);
            trace!("real-time clock updated to {value}");
        } else {
            warn!(
                "real-time clock event with short payload: {:02x?}",
                event.payload
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MAX_ACTIVE_COMMANDS;
    use crate::tests::init_logger;
    use crate::tracker::TrackerState;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex as StdMutex, OnceLock, Weak};

    type Script = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

    /// Transport double that records every sent frame and can feed
    /// scripted replies straight back into the connection.
    struct MockTransport {
        sent: StdMutex<Vec<Vec<u8>>>,
        conn: OnceLock<Weak<Connection>>,
        script: StdMutex<Option<Script>>,
        fail_sends: AtomicBool,
    }

    impl MockTransport {
        fn new(script: Option<Script>) -> Self {
            Self {
                sent: StdMutex::new(Vec::new()),
                conn: OnceLock::new(),
                script: StdMutex::new(script),
                fail_sends: AtomicBool::new(false),
            }
        }

        fn attach(&self, conn: &Arc<Connection>) {
            let _ = self.conn.set(Arc::downgrade(conn));
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_raw(&self, frame: &[u8]) -> std::io::Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("port closed"));
            }

            self.sent.lock().unwrap().push(frame.to_vec());

            let replies = match self.script.lock().unwrap().as_mut() {
                Some(script) => script(frame),
                None => vec![],
            };

            if let Some(conn) = self.conn.get().and_then(Weak::upgrade) {
                for reply in replies {
                    conn.handle_frame(&reply);
                }
            }

            Ok(())
        }
    }

    fn online(script: Option<Script>) -> (Arc<Connection>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new(script));
        let conn = Arc::new(Connection::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            ConnectionConfig::default(),
        ));

        transport.attach(&conn);
        conn.set_started(true);
        conn.set_connected(true);

        (conn, transport)
    }

    fn reply(kind: EventKind, id: u16, code: ResponseCode, completed: bool, payload: Vec<u8>) -> Vec<u8> {
        EventFrame::new(kind, id, ResponseType::new(code, completed), payload).encode()
    }

    fn echo_success(frame: &[u8]) -> Vec<Vec<u8>> {
        let cmd = CommandFrame::decode(frame).unwrap();

        vec![reply(
            EventKind::CommandStatus,
            cmd.id,
            ResponseCode::Success,
            true,
            vec![],
        )]
    }

    #[tokio::test]
    async fn execute_round_trip() {
        init_logger();

        let (conn, transport) = online(Some(Box::new(echo_success)));
        let event = conn
            .execute(
                CommandFrame::new(CommandKind::GetGatewayInformation, vec![0x01]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(event.response.is_completed(), "response should be final");
        assert_eq!(conn.active_commands(), 0, "command should have been flushed");

        let sent = transport.sent();

        assert_eq!(sent.len(), 1, "exactly one frame should have been sent");

        let cmd = CommandFrame::decode(&sent[0]).unwrap();

        assert_eq!(
            cmd.kind,
            CommandKind::GetGatewayInformation,
            "sent frame should carry the command type"
        );
        assert_ne!(cmd.id, 0, "a fresh id should have been assigned");
    }

    #[tokio::test]
    async fn execute_maps_device_failure() {
        init_logger();

        let (conn, _) = online(Some(Box::new(|frame: &[u8]| {
            let cmd = CommandFrame::decode(frame).unwrap();

            vec![reply(
                EventKind::CommandStatus,
                cmd.id,
                ResponseCode::Failure,
                true,
                vec![0x2a],
            )]
        })));

        assert_eq!(
            conn.execute(
                CommandFrame::new(CommandKind::WriteParameter, vec![]),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err(),
            Error::CommandFailed(0x2a),
            "device-reported failure should surface with its code"
        );
    }

    #[tokio::test]
    async fn sentinel_id_bypasses_tracking() {
        init_logger();

        let (conn, transport) = online(None);
        let event = conn
            .execute(
                CommandFrame::fire_and_forget(CommandKind::WriteParameter, vec![0x05]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(event.response.is_completed(), "synthetic success should be final");
        assert_eq!(conn.active_commands(), 0, "nothing should be tracked");
        assert_eq!(
            &transport.sent()[0][..2],
            [0xff, 0xff],
            "sentinel id should go out on the wire"
        );
    }

    #[tokio::test]
    async fn offline_connection_rejects_sends() {
        init_logger();

        let transport = Arc::new(MockTransport::new(None));
        let conn = Connection::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            ConnectionConfig::default(),
        );

        conn.set_started(true);

        assert_eq!(
            conn.execute(
                CommandFrame::new(CommandKind::GetRealTimeClock, vec![]),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err(),
            Error::Offline,
            "disconnected session should reject sends"
        );
        assert!(transport.sent().is_empty(), "nothing should reach the transport");
    }

    #[tokio::test]
    async fn disconnect_aborts_pending_and_clears_clock() {
        init_logger();

        let (conn, _) = online(None);
        let cancel = CancellationToken::new();
        let mut trackers = vec![];

        for _ in 0..3 {
            trackers.push(
                conn.submit(
                    CommandFrame::new(CommandKind::ReadParameter, vec![]),
                    Duration::from_secs(8),
                    &cancel,
                    None,
                )
                .await
                .unwrap(),
            );
        }

        conn.handle_frame(&reply(
            EventKind::RealTimeClock,
            0,
            ResponseCode::Success,
            false,
            vec![0x12, 0x34, 0x56, 0x78],
        ));

        assert_eq!(
            conn.real_time_clock(),
            Some(0x1234_5678),
            "clock should be cached"
        );

        conn.set_connected(false);

        for tracker in trackers {
            assert_eq!(
                tracker.completion().await.unwrap_err(),
                Error::CommandAborted,
                "disconnect should abort pending commands"
            );
        }

        assert_eq!(
            conn.real_time_clock(),
            None,
            "clock should be cleared on disconnect"
        );
    }

    #[tokio::test]
    async fn command_cap_rejects_excess_sends() {
        init_logger();

        let (conn, _) = online(None);
        let cancel = CancellationToken::new();

        for _ in 0..MAX_ACTIVE_COMMANDS {
            conn.submit(
                CommandFrame::new(CommandKind::ReadParameter, vec![]),
                Duration::from_secs(8),
                &cancel,
                None,
            )
            .await
            .unwrap();
        }

        assert_eq!(
            conn.submit(
                CommandFrame::new(CommandKind::ReadParameter, vec![]),
                Duration::from_secs(8),
                &cancel,
                None,
            )
            .await
            .unwrap_err(),
            Error::Offline,
            "sends beyond the cap should be rejected, not queued"
        );
    }

    #[tokio::test]
    async fn resend_reuses_id_and_bytes() {
        init_logger();

        let (conn, transport) = online(None);
        let tracker = conn
            .submit(
                CommandFrame::new(CommandKind::WriteBlockData, vec![0x01, 0x02]),
                Duration::from_secs(8),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();

        conn.resend(&tracker).await.unwrap();

        let sent = transport.sent();

        assert_eq!(sent.len(), 2, "two frames should have been sent");
        assert_eq!(
            sent[0], sent[1],
            "resend should reissue the identical bytes on the same id"
        );

        // A terminal tracker is no longer the active entry for its id.
        conn.handle_frame(&reply(
            EventKind::CommandStatus,
            tracker.id(),
            ResponseCode::Success,
            true,
            vec![],
        ));

        assert_eq!(
            conn.resend(&tracker).await.unwrap_err(),
            Error::InvalidCommand,
            "finished command should not be resendable"
        );
    }

    #[tokio::test]
    async fn version_gate_filters_events() {
        init_logger();

        struct FlipGate {
            open: AtomicBool,
        }

        impl VersionGate for FlipGate {
            fn is_minimum_version_met(&self) -> bool {
                self.open.load(Ordering::SeqCst)
            }
        }

        let gate = Arc::new(FlipGate {
            open: AtomicBool::new(false),
        });
        let transport = Arc::new(MockTransport::new(None));
        let conn = Arc::new(
            Connection::new(
                Arc::clone(&transport) as Arc<dyn Transport>,
                ConnectionConfig::default(),
            )
            .with_version_gate(Arc::clone(&gate) as Arc<dyn VersionGate>),
        );

        transport.attach(&conn);
        conn.set_started(true);
        conn.set_connected(true);

        let tracker = conn
            .submit(
                CommandFrame::new(CommandKind::ReadParameter, vec![]),
                Duration::from_secs(8),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        let value = reply(
            EventKind::ParameterValue,
            tracker.id(),
            ResponseCode::Success,
            true,
            vec![0x07],
        );

        conn.handle_frame(&value);

        assert_eq!(
            tracker.state(),
            TrackerState::Pending,
            "non-bootstrap event should be dropped before negotiation"
        );

        gate.open.store(true, Ordering::SeqCst);
        conn.handle_frame(&value);

        assert_eq!(
            tracker.state(),
            TrackerState::Succeeded,
            "event should be processed once the version is negotiated"
        );
    }

    #[tokio::test]
    async fn stray_events_are_ignored() {
        init_logger();

        let (conn, _) = online(Some(Box::new(echo_success)));
        let event = conn
            .execute(
                CommandFrame::new(CommandKind::GetRealTimeClock, vec![]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // Late duplicate for a finished command, an unknown id, and an
        // undecodable frame must all be swallowed.
        conn.handle_frame(&reply(
            EventKind::CommandStatus,
            event.command_id,
            ResponseCode::Success,
            true,
            vec![],
        ));
        conn.handle_frame(&reply(
            EventKind::CommandStatus,
            0x4242,
            ResponseCode::Success,
            true,
            vec![],
        ));
        conn.handle_frame(&[0xa0]);
        conn.handle_frame(&[]);

        assert_eq!(conn.active_commands(), 0, "no tracker should have appeared");
    }

    #[tokio::test]
    async fn transport_failure_aborts_command() {
        init_logger();

        let (conn, transport) = online(None);

        transport.fail_sends.store(true, Ordering::SeqCst);

        let err = conn
            .submit(
                CommandFrame::new(CommandKind::GetGatewayInformation, vec![]),
                Duration::from_secs(8),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap_err();

        assert!(
            matches!(err, Error::Transport(_)),
            "transport failure should surface, got {err:?}"
        );
        assert_eq!(
            conn.active_commands(),
            0,
            "failed command should not stay active"
        );
    }

    #[tokio::test]
    async fn read_parameter_round_trip() {
        init_logger();

        let (conn, transport) = online(Some(Box::new(|frame: &[u8]| {
            let cmd = CommandFrame::decode(frame).unwrap();

            vec![reply(
                EventKind::ParameterValue,
                cmd.id,
                ResponseCode::Success,
                true,
                vec![0xaa, 0xbb],
            )]
        })));
        let event = conn
            .read_parameter(vec![0x01, 0x04, 0x00, 0x10], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(event.payload, [0xaa, 0xbb], "parameter value should come back");
        assert_eq!(
            CommandFrame::decode(&transport.sent()[0]).unwrap().kind,
            CommandKind::ReadParameter,
            "read-parameter command should have been sent"
        );
    }
}
