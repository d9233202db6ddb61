//! Object-file loading and saving.
//!
//! An object file is a raw dump of machine words, loaded verbatim into
//! machine memory, optionally preceded by a `#!` interpreter line which is
//! skipped. There is no header beyond that; the image length is the file
//! length.

use std::io::{Read, Write};

use crate::vm::Machine;
use crate::{UWord, WORD_BYTES};
use stackvm_derive::Error;

/// Errors from reading or writing an object file.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The underlying stream failed.
    #[error("i/o error: {0}")]
    Io(std::io::Error),
    /// The load or save address is not word-aligned.
    #[error("address is not word-aligned")]
    Unaligned,
    /// The image does not fit in machine memory.
    #[error("object does not fit in memory")]
    TooBig,
    /// The image ends in a partial word.
    #[error("object ends in a partial word")]
    Truncated,
}

impl From<std::io::Error> for LoadError {
    fn from(err: std::io::Error) -> Self {
        LoadError::Io(err)
    }
}

/// Loads an object file into memory at the word-aligned byte address
/// `addr`, returning the number of words loaded.
pub fn load_object<R: Read>(m: &mut Machine, mut source: R, addr: UWord) -> Result<UWord, LoadError> {
    if addr % WORD_BYTES != 0 {
        return Err(LoadError::Unaligned);
    }
    let mut image = Vec::new();
    source.read_to_end(&mut image)?;

    // Skip an optional #! interpreter line.
    let mut start = 0;
    if image.starts_with(b"#!") {
        start = match image.iter().position(|&b| b == b'\n') {
            Some(newline) => newline + 1,
            None => image.len(),
        };
    }
    let body = &image[start..];

    if body.len() % WORD_BYTES != 0 {
        return Err(LoadError::Truncated);
    }
    let end = addr.checked_add(body.len()).ok_or(LoadError::TooBig)?;
    let dest = m
        .memory_mut()
        .get_mut(addr..end)
        .ok_or(LoadError::TooBig)?;
    dest.copy_from_slice(body);
    Ok(body.len() / WORD_BYTES)
}

/// Writes `words` words of memory starting at `addr` as an object file.
pub fn save_object<W: Write>(
    m: &Machine,
    mut sink: W,
    addr: UWord,
    words: UWord,
) -> Result<(), LoadError> {
    if addr % WORD_BYTES != 0 {
        return Err(LoadError::Unaligned);
    }
    let len = words.checked_mul(WORD_BYTES).ok_or(LoadError::TooBig)?;
    let end = addr.checked_add(len).ok_or(LoadError::TooBig)?;
    let body = m.memory().get(addr..end).ok_or(LoadError::TooBig)?;
    sink.write_all(body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa;
    use crate::Word;
    use std::io::Cursor;

    #[test]
    fn round_trip() {
        let mut m = Machine::with_defaults(64);
        m.store_word(0, isa::encode_pushi(17)).unwrap();
        m.store_word(WORD_BYTES, isa::encode_pushi(-1)).unwrap();

        let mut image = Vec::new();
        save_object(&m, &mut image, 0, 2).unwrap();
        assert_eq!(image.len(), 2 * WORD_BYTES);

        let mut fresh = Machine::with_defaults(64);
        assert_eq!(load_object(&mut fresh, Cursor::new(&image), 0).unwrap(), 2);
        assert_eq!(fresh.load_word(0).unwrap(), isa::encode_pushi(17));
        assert_eq!(fresh.load_word(WORD_BYTES).unwrap(), isa::encode_pushi(-1));
    }

    #[test]
    fn shebang_line_is_skipped() {
        let mut image = b"#!/usr/bin/env stackvm\n".to_vec();
        image.extend_from_slice(&(42 as Word).to_ne_bytes());

        let mut m = Machine::with_defaults(64);
        assert_eq!(load_object(&mut m, Cursor::new(&image), 0).unwrap(), 1);
        assert_eq!(m.load_word(0).unwrap(), 42);
    }

    #[test]
    fn partial_word_is_rejected() {
        let mut m = Machine::with_defaults(64);
        let image = vec![0u8; WORD_BYTES + 1];
        assert!(matches!(
            load_object(&mut m, Cursor::new(&image), 0),
            Err(LoadError::Truncated)
        ));
    }

    #[test]
    fn unaligned_address_is_rejected() {
        let mut m = Machine::with_defaults(64);
        assert!(matches!(
            load_object(&mut m, Cursor::new(&[]), 1),
            Err(LoadError::Unaligned)
        ));
    }

    #[test]
    fn oversized_image_is_rejected() {
        let mut m = Machine::with_defaults(2);
        let image = vec![0u8; 3 * WORD_BYTES];
        assert!(matches!(
            load_object(&mut m, Cursor::new(&image), 0),
            Err(LoadError::TooBig)
        ));
    }
}
