extern crate alloc;

use bytes::Bytes;
use nom::{bytes::complete::take, number::complete::be_u8};

use crate::{DecodeError, IResult};

/// Forward-only reader over a shared byte buffer.
///
/// Reads never go past the end of the buffer; running out of input is
/// reported as [`DecodeError::OutOfBuffer`]. Slices handed out by the
/// cursor share the underlying allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    buffer: Bytes,
    position: usize,
}

impl Cursor {
    #[must_use]
    pub fn new(buffer: Bytes) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Number of bytes consumed so far.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    #[must_use]
    pub fn remaining(&self) -> &[u8] {
        &self.buffer[self.position..]
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.position >= self.buffer.len()
    }

    pub fn next_byte(&mut self) -> Result<u8, DecodeError> {
        let remaining = self.remaining().len();
        self.parse(|input| be_u8(input)).map_err(|_| DecodeError::OutOfBuffer {
            needed: 1,
            remaining,
        })
    }

    pub fn take(&mut self, count: usize) -> Result<Bytes, DecodeError> {
        let remaining = self.remaining().len();
        self.parse_shared(|input| {
            let (rest, taken) = take::<usize, &[u8], DecodeError>(count)(input)?;
            Ok((rest, ((), taken)))
        })
        .map(|((), taken)| taken)
        .map_err(|_| DecodeError::OutOfBuffer {
            needed: count as u64,
            remaining,
        })
    }

    /// Runs `parser` on the remaining input and moves past the consumed bytes.
    pub fn parse<T, F>(&mut self, parser: F) -> Result<T, DecodeError>
    where
        F: for<'i> FnOnce(&'i [u8]) -> IResult<&'i [u8], T>,
    {
        let input = self.remaining();
        let (rest, parsed) = parser(input)?;
        self.position += input.len() - rest.len();
        Ok(parsed)
    }

    /// Like [`Cursor::parse`], for parsers that also return a sub-slice of
    /// their input. The sub-slice is handed out as a shared [`Bytes`].
    pub fn parse_shared<T, F>(&mut self, parser: F) -> Result<(T, Bytes), DecodeError>
    where
        F: for<'i> FnOnce(&'i [u8]) -> IResult<&'i [u8], (T, &'i [u8])>,
    {
        let input = self.remaining();
        let (rest, (parsed, slice)) = parser(input)?;
        let consumed = input.len() - rest.len();
        let shared = self.buffer.slice_ref(slice);
        self.position += consumed;
        Ok((parsed, shared))
    }
}
