//! Typed little-endian reads and writes over the device byte stream.
//!
//! The link owns no retry or reconnect policy. A read that cannot be filled
//! fails with the number of bytes that did arrive, so callers can surface the
//! truncation instead of misaligning later fields.

use std::io::{ErrorKind, Read, Write};

use winnow::binary::{le_u16, le_u32};
use winnow::combinator::repeat;
use winnow::error::ContextError;
use winnow::prelude::*;

use crate::error::{ProtocolError, Result, TransportError};

/// Byte stream wrapper exposing the typed primitives the protocol is written in.
#[derive(Debug)]
pub struct TypedLink<S> {
    stream: S,
}

impl<S> TypedLink<S> {
    #[must_use]
    pub const fn new(stream: S) -> Self {
        Self { stream }
    }

    #[must_use]
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Releases the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Write> TypedLink<S> {
    /// Writes `bytes` as one contiguous message.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Fills `buffer` completely or fails with a [`TransportError::ShortRead`].
    pub fn read_into(&mut self, buffer: &mut [u8]) -> Result<()> {
        let expected = buffer.len();
        let mut received = 0;
        while received < expected {
            match self.stream.read(&mut buffer[received..]) {
                Ok(0) => return Err(TransportError::ShortRead { expected, received }.into()),
                Ok(count) => received += count,
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error)
                    if matches!(error.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) =>
                {
                    return Err(TransportError::ShortRead { expected, received }.into());
                }
                Err(error) => return Err(TransportError::Io(error).into()),
            }
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0; count];
        self.read_into(&mut buffer)?;
        Ok(buffer)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buffer = [0; 1];
        self.read_into(&mut buffer)?;
        Ok(buffer[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut buffer = [0; 2];
        self.read_into(&mut buffer)?;
        decode_exact("u16", &buffer, le_u16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buffer = [0; 4];
        self.read_into(&mut buffer)?;
        decode_exact("u32", &buffer, le_u32)
    }

    /// Reads `count` consecutive little-endian `u32` values.
    pub fn read_u32_array(&mut self, count: usize) -> Result<Vec<u32>> {
        let buffer = self.read_bytes(count * 4)?;
        decode_exact("u32 array", &buffer, repeat(count, le_u32))
    }
}

/// Runs `parser` over the whole of `bytes`, rejecting short or over-long input.
pub(crate) fn decode_exact<'a, O>(
    what: &'static str,
    bytes: &'a [u8],
    mut parser: impl Parser<&'a [u8], O, ContextError>,
) -> Result<O> {
    let mut input = bytes;
    let value = parser
        .parse_next(&mut input)
        .map_err(|_: ContextError| ProtocolError::Malformed { what })?;
    if !input.is_empty() {
        return Err(ProtocolError::TrailingBytes {
            what,
            count: input.len(),
        }
        .into());
    }
    Ok(value)
}


#[cfg(test)]
mod tests {
    use super::testing::Scripted;
    use super::*;
    use crate::Error;

    fn link(bytes: &[u8]) -> TypedLink<Scripted> {
        TypedLink::new(Scripted::new(bytes))
    }

    #[test]
    fn reads_are_little_endian() {
        let mut link = link(&[0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 7]);
        assert_eq!(link.read_u16().unwrap(), 0x1234);
        assert_eq!(link.read_u32().unwrap(), 0x1234_5678);
        assert_eq!(link.read_u8().unwrap(), 7);
    }

    #[test]
    fn arrays_decode_every_element() {
        let mut link = link(&[1, 0, 0, 0, 2, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(link.read_u32_array(3).unwrap(), vec![1, 2, u32::MAX]);
    }

    #[test]
    fn short_reads_report_what_arrived() {
        let mut link = link(&[1, 2]);
        let error = link.read_u32().unwrap_err();
        assert!(matches!(
            error,
            Error::Transport(TransportError::ShortRead {
                expected: 4,
                received: 2
            })
        ));
    }

    #[test]
    fn writes_reach_the_stream_unchanged() {
        let mut link = link(&[]);
        link.write_bytes(b"R").unwrap();
        link.write_bytes(&[1, 2, 3]).unwrap();
        assert_eq!(link.get_ref().written, vec![b'R', 1, 2, 3]);
    }
}
