//! Chunked, CRC32-verified block transfers.
//!
//! A block transfer pushes an image into addressed device memory through
//! the gateway: one start command, then the data in chunks of at most
//! 128 bytes, then a finish marker. Every chunk is acknowledged with the
//! device-computed CRC32 of the bytes received so far; the engine chains
//! the same CRC locally and retransmits any chunk whose acknowledgement
//! disagrees. All chunks of one transfer reuse a single command id by
//! rewriting the tracked command in place.

use crate::connection::Connection;
use crate::frame::{
    chunk_crc32, BlockWriteData, CommandFrame, CommandKind, DeviceAddress, EventFrame,
    ResponseCode, StartTransfer, TransferFlags, MAX_CHUNK_SIZE,
};
use crate::tracker::{CommandTracker, ResponseCallback};
use crate::Error;
use core::fmt::{Display, Formatter};
use core::time::Duration;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Phase of a block transfer.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum TransferState {
    /// No transfer in progress.
    Idle,
    /// Start command in flight.
    Starting,
    /// Data chunks being written.
    Writing,
    /// Finish marker in flight.
    Finishing,
    /// Transfer finished successfully.
    Completed,
    /// Transfer ended with an error.
    Failed,
    /// Transfer cancelled by the caller or a dropped connection.
    Cancelled,
}

/// Running counters of a block transfer.
///
/// Handed to the progress callback before every chunk attempt and
/// returned (or embedded in the error) when the transfer ends.
#[derive(Clone, Debug)]
pub struct TransferProgress {
    /// Bytes acknowledged by the device so far.
    pub bytes_sent: usize,
    /// Total size of the image.
    pub total_bytes: usize,
    /// Retransmissions of the chunk currently in flight.
    pub chunk_retries: u32,
    /// Retransmissions over the whole transfer.
    pub total_retries: u32,
    /// Time since the transfer started.
    pub elapsed: Duration,
}

/// A failed or cancelled block transfer.
#[derive(Debug)]
pub struct TransferError {
    /// The underlying error.
    pub error: Error,
    /// Terminal state: [`TransferState::Failed`] or
    /// [`TransferState::Cancelled`].
    pub state: TransferState,
    /// Counters at the moment the transfer ended.
    pub progress: TransferProgress,
}

impl Display for TransferError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let verb = if self.state == TransferState::Cancelled {
            "cancelled"
        } else {
            "failed"
        };

        write!(
            f,
            "block transfer {verb} after {}/{} bytes: {}",
            self.progress.bytes_sent, self.progress.total_bytes, self.error
        )
    }
}

impl core::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        Some(&self.error)
    }
}

enum TransferReply {
    Started,
    Data { crc: u32 },
    Failed { code: u8, completed: bool },
    Unexpected,
}

fn classify(event: &EventFrame) -> TransferReply {
    match event.response.code() {
        Some(ResponseCode::TransferStarted) => TransferReply::Started,
        Some(ResponseCode::TransferData) => event
            .payload
            .first_chunk::<4>()
            .map_or(TransferReply::Unexpected, |bytes| TransferReply::Data {
                crc: u32::from_be_bytes(*bytes),
            }),
        Some(ResponseCode::Failure) => TransferReply::Failed {
            code: event.payload.first().copied().unwrap_or_default(),
            completed: event.response.is_completed(),
        },
        _ => TransferReply::Unexpected,
    }
}

enum Verdict {
    Advance,
    Retransmit,
    Backoff,
    Fatal(Error),
}

/// Drives chunked block writes over a [`Connection`].
pub struct BlockTransferEngine<'a> {
    conn: &'a Connection,
}

impl<'a> BlockTransferEngine<'a> {
    /// Constructs an engine over the given connection.
    #[must_use]
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Writes an image into a device memory block.
    ///
    /// The progress callback runs before every chunk attempt and once
    /// more after completion; returning `false` cancels the transfer
    /// immediately. CRC mismatches and transient chunk failures are
    /// retried invisibly (200 ms backoff, bounded by
    /// [`max_chunk_retries`](crate::connection::ConnectionConfig::max_chunk_retries)
    /// when set); structural errors end the transfer at once.
    ///
    /// Cancellation — via the token, the callback or a dropped
    /// connection — ends in [`TransferState::Cancelled`], never
    /// [`TransferState::Failed`].
    pub async fn write_block<F>(
        &self,
        target: DeviceAddress,
        block: u16,
        start: u32,
        data: &[u8],
        mut progress: F,
        cancel: &CancellationToken,
    ) -> Result<TransferProgress, TransferError>
    where
        F: FnMut(&TransferProgress) -> bool + Send,
    {
        let started_at = Instant::now();
        let mut prog = TransferProgress {
            bytes_sent: 0,
            total_bytes: data.len(),
            chunk_retries: 0,
            total_retries: 0,
            elapsed: Duration::ZERO,
        };

        // Starting
        if !self.conn.directory().is_online(target) {
            return Err(fail(Error::Offline, prog, started_at));
        }

        let request = StartTransfer {
            target,
            block,
            flags: TransferFlags::WRITE
                | TransferFlags::ERASE
                | TransferFlags::START_ADDRESS
                | TransferFlags::SIZE,
            start,
            size: data.len() as u32,
        };
        let command = CommandFrame::new(CommandKind::StartBlockTransfer, request.encode());

        if let Err(err) = self.conn.execute(command, cancel).await {
            return Err(fail(err, prog, started_at));
        }

        info!(
            "block transfer to {target:?} block {block:#06x} started, {} bytes",
            data.len()
        );

        // Writing. All chunks reuse one tracked command; the callback
        // feeds every event for it into a local reply queue.
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<EventFrame>();
        let mut tracker: Option<Arc<CommandTracker>> = None;
        let mut crc_state: Option<u32> = None;
        let mut offset = start;

        while prog.bytes_sent < data.len() {
            let chunk_len = MAX_CHUNK_SIZE.min(data.len() - prog.bytes_sent);
            let chunk = &data[prog.bytes_sent..prog.bytes_sent + chunk_len];
            let expected = chunk_crc32(crc_state, chunk);

            loop {
                prog.elapsed = started_at.elapsed();

                if !progress(&prog) || cancel.is_cancelled() {
                    if let Some(tracker) = &tracker {
                        tracker.abort(Error::CommandAborted);
                        self.conn.flush_finished();
                    }

                    return Err(fail(Error::CommandAborted, prog, started_at));
                }

                // Anything still queued predates this attempt.
                while reply_rx.try_recv().is_ok() {}

                let payload = BlockWriteData {
                    target,
                    block,
                    offset,
                    data: chunk.to_vec(),
                }
                .encode();

                match &tracker {
                    None => {
                        let tx = reply_tx.clone();
                        let callback: ResponseCallback = Box::new(move |event| {
                            let _ = tx.send(event.clone());
                        });
                        let command = CommandFrame::new(CommandKind::WriteBlockData, payload);

                        match self
                            .conn
                            .submit(
                                command,
                                self.conn.config().command_timeout,
                                cancel,
                                Some(callback),
                            )
                            .await
                        {
                            Ok(fresh) => tracker = Some(fresh),
                            Err(err) => return Err(fail(err, prog, started_at)),
                        }
                    }
                    Some(active) => {
                        active.rewrite_payload(payload);

                        if let Err(err) = self.conn.resend(active).await {
                            debug!("chunk at {offset:#010x}: stale id ({err}), reissuing");
                            prog.total_retries += 1;
                            tracker = None;
                            sleep(self.conn.config().retry_backoff).await;
                            continue;
                        }
                    }
                }

                let Some(active) = &tracker else {
                    continue;
                };

                match self.chunk_verdict(active, &mut reply_rx, expected).await {
                    Verdict::Advance => {
                        crc_state = Some(expected);
                        prog.bytes_sent += chunk_len;
                        prog.chunk_retries = 0;
                        offset += chunk_len as u32;
                        break;
                    }
                    Verdict::Retransmit => {
                        warn!("chunk at {offset:#010x}: CRC mismatch, retransmitting");

                        if let Err(err) = self.bump_retries(&mut prog) {
                            abort_tracker(self.conn, &tracker);
                            return Err(fail(err, prog, started_at));
                        }
                    }
                    Verdict::Backoff => {
                        debug!("chunk at {offset:#010x}: transient failure, backing off");

                        if let Err(err) = self.bump_retries(&mut prog) {
                            abort_tracker(self.conn, &tracker);
                            return Err(fail(err, prog, started_at));
                        }

                        sleep(self.conn.config().retry_backoff).await;
                    }
                    Verdict::Fatal(err) => {
                        abort_tracker(self.conn, &tracker);
                        return Err(fail(err, prog, started_at));
                    }
                }
            }
        }

        // Finishing
        let marker = BlockWriteData::finish_marker(target, block).encode();
        let finish = match tracker {
            Some(active) => {
                active.rewrite_payload(marker);

                if let Err(err) = self.conn.resend(&active).await {
                    return Err(fail(err, prog, started_at));
                }

                active.reset_timer_with(self.conn.config().transfer_timeout);
                active
            }
            // Empty image: no chunk command exists to reuse.
            None => {
                let command = CommandFrame::new(CommandKind::WriteBlockData, marker);

                match self
                    .conn
                    .submit(command, self.conn.config().transfer_timeout, cancel, None)
                    .await
                {
                    Ok(fresh) => fresh,
                    Err(err) => return Err(fail(err, prog, started_at)),
                }
            }
        };

        let outcome = finish.completion().await;

        self.conn.flush_finished();

        let event = match outcome {
            Ok(event) => event,
            Err(err) => return Err(fail(err, prog, started_at)),
        };

        if let Some(code) = event.failure_code() {
            return Err(fail(Error::CommandFailed(code), prog, started_at));
        }

        // Completed
        prog.elapsed = started_at.elapsed();
        progress(&prog);
        info!(
            "block transfer to {target:?} block {block:#06x} completed, {} bytes in {:?} ({} retries)",
            prog.bytes_sent, prog.elapsed, prog.total_retries
        );

        Ok(prog)
    }

    /// Waits for the device to drop out of the directory, as it does
    /// when rebooting into its bootloader after a firmware write.
    ///
    /// # Errors
    ///
    /// - [`Error::CommandTimeout`] if the device stays online past the
    ///   timeout.
    /// - [`Error::CommandAborted`] if cancelled while waiting.
    pub async fn wait_for_offline(
        &self,
        target: DeviceAddress,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            if !self.conn.directory().is_online(target) {
                return Ok(());
            }

            if cancel.is_cancelled() {
                return Err(Error::CommandAborted);
            }

            if Instant::now() >= deadline {
                return Err(Error::CommandTimeout);
            }

            sleep(self.conn.config().poll_interval).await;
        }
    }

    /// Awaits the device's verdict on the chunk currently in flight.
    async fn chunk_verdict(
        &self,
        tracker: &Arc<CommandTracker>,
        replies: &mut mpsc::UnboundedReceiver<EventFrame>,
        expected_crc: u32,
    ) -> Verdict {
        loop {
            let Ok(event) = replies.try_recv() else {
                if tracker.is_terminal() {
                    let err = match tracker.completion().await {
                        Ok(event) => event
                            .failure_code()
                            .map_or(Error::InvalidResponse, Error::CommandFailed),
                        Err(err) => err,
                    };

                    return Verdict::Fatal(err);
                }

                sleep(self.conn.config().poll_interval).await;
                continue;
            };

            match classify(&event) {
                TransferReply::Started => tracker.reset_timer(),
                TransferReply::Data { crc } if crc == expected_crc => return Verdict::Advance,
                TransferReply::Data { crc } => {
                    debug!("chunk CRC {crc:#010x} != expected {expected_crc:#010x}");
                    return Verdict::Retransmit;
                }
                TransferReply::Failed {
                    code,
                    completed: true,
                } => return Verdict::Fatal(Error::CommandFailed(code)),
                TransferReply::Failed { .. } => return Verdict::Backoff,
                TransferReply::Unexpected => return Verdict::Fatal(Error::InvalidResponse),
            }
        }
    }

    fn bump_retries(&self, prog: &mut TransferProgress) -> crate::Result<()> {
        prog.chunk_retries += 1;
        prog.total_retries += 1;

        match self.conn.config().max_chunk_retries {
            Some(limit) if prog.chunk_retries > limit => Err(Error::Other(format!(
                "chunk retry limit of {limit} exceeded"
            ))),
            _ => Ok(()),
        }
    }
}

fn fail(error: Error, mut progress: TransferProgress, started_at: Instant) -> TransferError {
    let state = if error == Error::CommandAborted {
        TransferState::Cancelled
    } else {
        TransferState::Failed
    };

    progress.elapsed = started_at.elapsed();

    TransferError {
        error,
        state,
        progress,
    }
}

fn abort_tracker(conn: &Connection, tracker: &Option<Arc<CommandTracker>>) {
    if let Some(tracker) = tracker {
        tracker.abort(Error::CommandAborted);
        conn.flush_finished();
    }
}
