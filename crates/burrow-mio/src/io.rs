use std::io::{ErrorKind, Read, Write};

use bytes::BytesMut;

/// Fold `WouldBlock` into `Ok(None)`.
pub fn check_io<T>(value: Result<T, std::io::Error>) -> Result<Option<T>, std::io::Error> {
    match value {
        Ok(value) => Ok(Some(value)),
        Err(error) => {
            // WouldBlock just means we've run out of things to handle
            if error.kind() == ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(error)
            }
        }
    }
}

/// Result of draining a non-blocking reader.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes appended to the buffer.
    pub bytes: usize,
    /// The reader reached end-of-stream.
    pub closed: bool,
    /// Reading stopped at the byte limit, more may be waiting.
    pub limited: bool,
}

/// Drain a non-blocking reader into `buffer` until it would block or reaches end-of-stream.
///
/// Readiness is edge-triggered, so this must always be called until it stops, or the source
/// won't be woken again.
pub fn read_available<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    chunk: usize,
) -> Result<ReadOutcome, std::io::Error>
where
    R: Read + ?Sized,
{
    read_bounded(reader, buffer, chunk, usize::MAX)
}

/// Like `read_available`, but stops once `limit` bytes were read.
///
/// When `limited` is set on the outcome the source may still hold data, and the caller has to
/// read again before waiting on readiness.
pub fn read_bounded<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    chunk: usize,
    limit: usize,
) -> Result<ReadOutcome, std::io::Error>
where
    R: Read + ?Sized,
{
    let mut outcome = ReadOutcome::default();
    let mut scratch = vec![0; chunk.clamp(1, limit.max(1))];

    loop {
        if outcome.bytes >= limit {
            outcome.limited = true;
            break;
        }

        let want = scratch.len().min(limit - outcome.bytes);
        match reader.read(&mut scratch[..want]) {
            Ok(0) => {
                // Read of zero means the stream has been closed
                outcome.closed = true;
                break;
            }
            Ok(len) => {
                buffer.extend_from_slice(&scratch[..len]);
                outcome.bytes += len;
            }
            Err(error) => match error.kind() {
                ErrorKind::WouldBlock => break,
                ErrorKind::Interrupted => continue,
                _ => return Err(error),
            },
        }
    }

    Ok(outcome)
}

/// Write as much of `data` as the non-blocking writer accepts, returning the amount written.
pub fn write_available<W>(writer: &mut W, data: &[u8]) -> Result<usize, std::io::Error>
where
    W: Write + ?Sized,
{
    let mut written = 0;

    while written < data.len() {
        match writer.write(&data[written..]) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(len) => written += len,
            Err(error) => match error.kind() {
                ErrorKind::WouldBlock => break,
                ErrorKind::Interrupted => continue,
                _ => return Err(error),
            },
        }
    }

    Ok(written)
}
