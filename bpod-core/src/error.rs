//! Error surface shared by every stage of the compile/run/reconstruct pipeline.
//!
//! Naming and reference failures are raised while a state machine is being
//! assembled or finalized, before anything reaches the device. Protocol and
//! transport failures abort a running trial immediately; no partial trial is
//! ever reconstructed from a truncated stream.

use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Top-level error returned by the public API.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Naming(#[from] NamingError),

    #[error("state `{state}` was referenced by `{referenced_by}` but never declared")]
    UnresolvedReference { state: String, referenced_by: String },

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Self::Transport(TransportError::Io(error))
    }
}

/// A symbolic name that does not exist in the channel map or state table.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NamingError {
    #[error("error creating state `{state}`: `{event}` is an invalid event name")]
    UnknownEvent { state: String, event: String },

    #[error("error creating state `{state}`: `{channel}` is an invalid output name")]
    UnknownOutput { state: String, channel: String },

    #[error("`{channel}` is an invalid output channel name")]
    UnknownOutputChannel { channel: String },

    #[error("`{channel}` is an invalid input channel name")]
    UnknownInputChannel { channel: String },

    #[error("`{event}` is an invalid event name")]
    UnknownEventName { event: String },

    #[error("meta output `{meta}` requires channel `{channel}`, which this device does not have")]
    MissingMetaChannel { meta: &'static str, channel: String },

    #[error("manually overriding input channel `{channel}` is not supported")]
    InputOverride { channel: String },
}

/// Requests that exceed what the device (or the wire format) can hold.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CapacityError {
    #[error("state machine declares no states")]
    NoStates,

    #[error("state machine declares {declared} states, device maximum is {max}")]
    TooManyStates { declared: usize, max: usize },

    #[error("{kind} index {index} is outside 1..={available}")]
    IndexOutOfRange {
        kind: &'static str,
        index: usize,
        available: usize,
    },

    #[error("state `{state}` holds {count} {table} entries, the wire format allows 255")]
    TableOverflow {
        state: String,
        table: &'static str,
        count: usize,
    },

    #[error("{what} of {seconds}s does not fit a 32-bit tick count at {frequency}Hz")]
    DurationOutOfRange {
        what: &'static str,
        seconds: f64,
        frequency: f64,
    },

    #[error("value {value} for `{channel}` does not fit a byte")]
    ValueOutOfRange { channel: String, value: u32 },

    #[error("device reports {events} event codes, at most 255 fit below the termination code")]
    TooManyEvents { events: usize },

    #[error("{len} {kind} channels do not fit a count byte")]
    TooManyChannels { kind: &'static str, len: usize },

    #[error("serial message of {len} bytes exceeds the 3-byte limit")]
    SerialMessageTooLong { len: usize },

    #[error("input enable mask has {found} entries, device has {expected} inputs")]
    MaskLength { expected: usize, found: usize },
}

/// The device (or a scripted stream) violated the wire protocol.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unexpected opcode {opcode} in trial event stream")]
    UnexpectedOpcode { opcode: u8 },

    #[error("handshake expected byte {expected:#04x}, received {received:#04x}")]
    HandshakeMismatch { expected: u8, received: u8 },

    #[error("firmware version {found} is older than the required {required}")]
    FirmwareTooOld { found: u32, required: u32 },

    #[error("device did not acknowledge {command}")]
    MissingAcknowledgment { command: &'static str },

    #[error("event code {code} is outside the device's {event_count} events")]
    UnknownEventCode { code: u8, event_count: usize },

    #[error("received {timestamps} timestamps for {events} logged events")]
    TimestampMismatch { events: usize, timestamps: usize },

    #[error("device reported a zero cycle period")]
    ZeroCyclePeriod,

    #[error("truncated {what}: expected {expected} bytes, found {found}")]
    Truncated {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("malformed {what}")]
    Malformed { what: &'static str },

    #[error("program image starts with {found:#04x}, expected {expected:#04x}")]
    BadCommandTag { expected: u8, found: u8 },

    #[error("{count} trailing bytes after {what}")]
    TrailingBytes { what: &'static str, count: usize },

    #[error("no state machine has been sent to the device")]
    NoProgram,
}

/// Failures surfaced unchanged from the byte-stream collaborator.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial port timed out: {received} bytes read, expected {expected}")]
    ShortRead { expected: usize, received: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_state() {
        let error = Error::from(NamingError::UnknownEvent {
            state: "WaitForPoke".to_string(),
            event: "Port9In".to_string(),
        });
        let message = error.to_string();
        assert!(message.contains("WaitForPoke"));
        assert!(message.contains("Port9In"));
    }

    #[test]
    fn io_errors_become_transport_errors() {
        let error = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(error, Error::Transport(TransportError::Io(_))));
    }

    #[test]
    fn short_reads_report_byte_counts() {
        let error = TransportError::ShortRead {
            expected: 4,
            received: 1,
        };
        assert_eq!(
            error.to_string(),
            "serial port timed out: 1 bytes read, expected 4"
        );
    }
}
