//! Command/event transport engine for the MyRvLink RV gateway protocol.
//!
//! # Overview
//!
//! The `rvlink` crate implements the transport layer of the proprietary
//! MyRvLink protocol spoken between an application and RV gateway hardware
//! over an arbitrary byte-stream connection.
//!
//! It owns the coordination logic of the protocol and nothing else:
//!
//! - Correlation-id allocation and per-command lifecycle tracking
//!   (pending, timeout, cancellation, completion) via the
//!   [`tracker`] and [`registry`] modules.
//! - Routing of asynchronous inbound events back to the command that
//!   caused them, including late and duplicate events ([`connection`]).
//! - The chunked, CRC32-verified block-transfer protocol used for
//!   firmware flashing and addressed memory access ([`transfer`]).
//!
//! Payload codecs for specific device families, device discovery and
//! firmware-version negotiation live outside this crate; they are consumed
//! through the collaborator traits on [`Connection`](connection::Connection).
//!
//! # Getting started
//!
//! The physical transport is abstracted behind the
//! [`Transport`](connection::Transport) trait: the crate hands it raw
//! outgoing frames, and the embedder feeds raw inbound frames to
//! [`Connection::handle_frame`](connection::Connection::handle_frame)
//! from whatever task owns the socket, serial port or BLE link.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rvlink::connection::{Connection, ConnectionConfig, Transport};
//! use rvlink::frame::{CommandFrame, CommandKind};
//! use tokio_util::sync::CancellationToken;
//!
//! # struct Pipe;
//! # #[async_trait::async_trait]
//! # impl Transport for Pipe {
//! #     async fn send_raw(&self, _frame: &[u8]) -> std::io::Result<()> {
//! #         Ok(())
//! #     }
//! # }
//! #
//! # #[tokio::main]
//! # async fn main() -> rvlink::Result<()> {
//! let conn = Arc::new(Connection::new(
//!     Arc::new(Pipe),
//!     ConnectionConfig::default(),
//! ));
//!
//! conn.set_started(true);
//! conn.set_connected(true);
//!
//! let cmd = CommandFrame::new(CommandKind::GetGatewayInformation, vec![]);
//! let event = conn.execute(cmd, &CancellationToken::new()).await?;
//!
//! println!("Gateway information: {:02x?}", event.payload);
//! # Ok(())
//! # }
//! ```
//!
//! # Flashing firmware
//!
//! Block transfers are built on top of the same command machinery:
//!
//! ```no_run
//! use rvlink::frame::DeviceAddress;
//! use rvlink::transfer::BlockTransferEngine;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(conn: &rvlink::connection::Connection, image: &[u8]) {
//! let engine = BlockTransferEngine::new(conn);
//! let target = DeviceAddress::new(1, 4);
//!
//! let res = engine
//!     .write_block(
//!         target,
//!         0x0100,
//!         0x0000_0000,
//!         image,
//!         |progress| {
//!             println!("{}/{} bytes", progress.bytes_sent, progress.total_bytes);
//!             true // keep going
//!         },
//!         &CancellationToken::new(),
//!     )
//!     .await;
//!
//! match res {
//!     Ok(progress) => println!("flashed in {:?}", progress.elapsed),
//!     Err(err) => eprintln!("transfer failed: {err}"),
//! }
//! # }
//! ```
//!
//! # Protocol details
//!
//! Commands are framed as `[command id: u16][command type: u8][payload]`;
//! events as `[event type: u8][command id: u16][response type: u8][payload]`,
//! with the high bit of the response type marking "command fully completed".
//! Command id `0xffff` is a fire-and-forget sentinel that expects no
//! response and bypasses tracking entirely. At most 20 commands may be
//! in flight at once; sends beyond the cap are rejected, never queued.

#![warn(missing_docs)]

pub mod connection;
pub mod frame;
pub mod registry;
pub mod throttle;
pub mod tracker;
pub mod transfer;

use core::fmt::{Display, Formatter};

/// A specialized [`Result`] type for transport operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error type for transport operations.
///
/// Every awaited send resolves to either a success value or one of these
/// variants; operations are never left hanging on timeout, cancellation
/// or connection loss.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Error {
    /// The command is malformed and cannot be sent.
    InvalidCommand,
    /// The connection is not started/connected, or the admission cap
    /// of concurrently active commands has been reached.
    Offline,
    /// A command with the same id is already active.
    CommandAlreadyRunning(u16),
    /// The command did not receive a terminal response before its deadline.
    CommandTimeout,
    /// The command was cancelled, or the connection dropped while it
    /// was in flight.
    CommandAborted,
    /// The gateway does not support the command.
    CommandNotSupported,
    /// The gateway returned a response that could not be interpreted.
    InvalidResponse,
    /// The gateway reported a device-level failure with the given code.
    CommandFailed(u8),
    /// A rate-limited operation was attempted while another one was
    /// still occupying its serial queue slot.
    TooManyCommandsRunning,
    /// Every command id is currently in use.
    NoCommandIdsAvailable,
    /// The underlying transport failed to send.
    Transport(String),
    /// Any other error.
    Other(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidCommand => write!(f, "invalid command"),
            Self::Offline => write!(f, "not connected or too many commands active"),
            Self::CommandAlreadyRunning(id) => write!(f, "command {id:#06x} already running"),
            Self::CommandTimeout => write!(f, "command timed out"),
            Self::CommandAborted => write!(f, "command aborted"),
            Self::CommandNotSupported => write!(f, "command not supported"),
            Self::InvalidResponse => write!(f, "invalid response"),
            Self::CommandFailed(code) => write!(f, "command failed with code {code}"),
            Self::TooManyCommandsRunning => write!(f, "too many commands running"),
            Self::NoCommandIdsAvailable => write!(f, "no command ids available"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl core::error::Error for Error {}
