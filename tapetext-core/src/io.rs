//! Raw sample and packet stream framing.
//!
//! `.vbi` files are headerless unsigned samples cut into frames of
//! `samples_per_line`; `.t42` files are headerless 42-byte packet records.
//! End of file is end of stream in both.

use std::io::{ErrorKind, Read, Write};

use crate::config::LINE_BYTES;
use crate::deconvolver::SampleFrame;
use crate::errors::{InputError, Result, TapeError};

/// Cuts a raw sample stream into indexed frames.
pub struct FrameReader<R: Read> {
    reader: R,
    samples_per_line: usize,
    next_index: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, samples_per_line: usize) -> Self {
        Self {
            reader,
            samples_per_line,
            next_index: 0,
        }
    }

    /// Next frame, or `None` at end of stream. A trailing partial frame is
    /// discarded; frame boundaries are defined by the line configuration,
    /// not the file.
    pub fn next_frame(&mut self) -> std::io::Result<Option<SampleFrame>> {
        let mut samples = vec![0u8; self.samples_per_line];
        let mut filled = 0usize;
        while filled < samples.len() {
            match self.reader.read(&mut samples[filled..]) {
                Ok(0) => {
                    return Ok(None);
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(SampleFrame { index, samples }))
    }
}

/// Read a whole `.t42` stream, enforcing the 42-byte record structure.
pub fn read_t42<R: Read>(mut reader: R) -> Result<Vec<[u8; LINE_BYTES]>> {
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer)?;
    if buffer.len() % LINE_BYTES != 0 {
        return Err(TapeError::from(InputError::BadPacketStreamLength {
            len: buffer.len(),
        }));
    }
    Ok(buffer
        .chunks_exact(LINE_BYTES)
        .map(|chunk| {
            let mut record = [0u8; LINE_BYTES];
            record.copy_from_slice(chunk);
            record
        })
        .collect())
}

/// Write packet records back out; each record is written whole.
pub fn write_t42<W: Write>(writer: &mut W, records: &[[u8; LINE_BYTES]]) -> std::io::Result<()> {
    for record in records {
        writer.write_all(record)?;
    }
    Ok(())
}
