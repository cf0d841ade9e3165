// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Notarization tickets stapled to containers.

Stapling attaches an Apple issued notarization ticket to the entity that
was notarized. Mach-O binaries and disk images carry the ticket in the
signature superblob's ticket slot. Installer archives append a chain of
`t8lr` trailers to the end of the file: reading backwards from the end, each
trailer describes the `length` bytes that precede it.
*/

use {
    crate::error::AppleCodeIdentityError,
    log::debug,
    scroll::{IOread, IOwrite, Pread, Pwrite, SizeWith},
    std::io::{Read, Seek, SeekFrom, Write},
};

/// Magic header for the trailer struct.
///
/// `t8lr`.
const NOTARIZATION_TRAILER_MAGIC: [u8; 4] = [0x74, 0x38, 0x6c, 0x72];

const NOTARIZATION_TRAILER_SIZE: u64 = 16;

#[derive(Clone, Copy, Debug, IOread, IOwrite, Pread, Pwrite, SizeWith)]
pub struct NotarizationTrailer {
    /// "t8lr"
    pub magic: [u8; 4],
    pub version: u16,
    pub typ: u16,
    pub length: u32,
    pub unused: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum NotarizationTrailerType {
    Invalid = 0,
    Terminator = 1,
    Ticket = 2,
}

impl NotarizationTrailer {
    fn new(typ: NotarizationTrailerType, length: u32) -> Self {
        Self {
            magic: NOTARIZATION_TRAILER_MAGIC,
            version: 1,
            typ: typ as u16,
            length,
            unused: 0,
        }
    }
}

/// Obtain the notarization trailer data to append to an archive.
///
/// The trailer data consists of a [NotarizationTrailer] of type `Terminator`
/// to denote the end of archive content followed by the raw ticket data followed by a
/// [NotarizationTrailer] with type `Ticket`. Essentially, a reader can look for
/// a ticket trailer at the end of the file then quickly seek to the beginning of
/// ticket data.
pub fn notarization_trailer(ticket_data: &[u8]) -> Result<Vec<u8>, AppleCodeIdentityError> {
    let terminator = NotarizationTrailer::new(NotarizationTrailerType::Terminator, 0);
    let ticket = NotarizationTrailer::new(
        NotarizationTrailerType::Ticket,
        u32::try_from(ticket_data.len())
            .map_err(|_| AppleCodeIdentityError::BadNotarizationTrailer("ticket too large"))?,
    );

    let mut cursor = std::io::Cursor::new(Vec::new());
    cursor.iowrite_with(terminator, scroll::LE)?;
    cursor.write_all(ticket_data)?;
    cursor.iowrite_with(ticket, scroll::LE)?;

    Ok(cursor.into_inner())
}

/// Find a ticket stapled to the end of a stream.
///
/// Trailers are walked backwards from the end of the stream. Returns `None`
/// if the stream doesn't end with a trailer or a terminator is reached
/// before a ticket.
pub fn read_stapled_ticket<R: Read + Seek>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, AppleCodeIdentityError> {
    let mut end = reader.seek(SeekFrom::End(0))?;

    loop {
        if end < NOTARIZATION_TRAILER_SIZE {
            return Ok(None);
        }

        reader.seek(SeekFrom::Start(end - NOTARIZATION_TRAILER_SIZE))?;
        let trailer = reader.ioread_with::<NotarizationTrailer>(scroll::LE)?;

        if trailer.magic != NOTARIZATION_TRAILER_MAGIC {
            return Ok(None);
        }

        let start = end - NOTARIZATION_TRAILER_SIZE;
        let length = trailer.length as u64;

        if length > start {
            return Err(AppleCodeIdentityError::BadNotarizationTrailer(
                "trailer length exceeds file size",
            ));
        }

        match trailer.typ {
            x if x == NotarizationTrailerType::Ticket as u16 => {
                reader.seek(SeekFrom::Start(start - length))?;
                let mut ticket = vec![0u8; length as usize];
                reader.read_exact(&mut ticket)?;

                debug!("found {} byte stapled ticket", length);

                return Ok(Some(ticket));
            }
            x if x == NotarizationTrailerType::Terminator as u16 => {
                return Ok(None);
            }
            typ => {
                debug!("skipping {} byte notarization trailer of type {}", length, typ);
                end = start - length;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::io::Cursor};

    #[test]
    fn trailer_roundtrip() -> Result<(), AppleCodeIdentityError> {
        let mut data = b"xar!archive content".to_vec();
        data.extend(notarization_trailer(b"ticket data")?);

        assert_eq!(data.len(), 19 + 16 + 11 + 16);
        assert_eq!(
            read_stapled_ticket(&mut Cursor::new(&data))?,
            Some(b"ticket data".to_vec())
        );

        Ok(())
    }

    #[test]
    fn no_trailer() -> Result<(), AppleCodeIdentityError> {
        assert_eq!(read_stapled_ticket(&mut Cursor::new(b"short"))?, None);
        assert_eq!(read_stapled_ticket(&mut Cursor::new(vec![0u8; 64]))?, None);

        // A bare terminator means nothing is stapled.
        let mut terminator: Vec<u8> = vec![];
        terminator.iowrite_with(
            NotarizationTrailer::new(NotarizationTrailerType::Terminator, 0),
            scroll::LE,
        )?;
        assert_eq!(read_stapled_ticket(&mut Cursor::new(terminator))?, None);

        Ok(())
    }

    #[test]
    fn skips_other_trailers() -> Result<(), AppleCodeIdentityError> {
        let mut data = b"content".to_vec();
        data.extend(notarization_trailer(b"ticket")?);
        data.extend_from_slice(b"opaque");
        data.iowrite_with(
            NotarizationTrailer::new(NotarizationTrailerType::Invalid, 6),
            scroll::LE,
        )?;

        assert_eq!(
            read_stapled_ticket(&mut Cursor::new(&data))?,
            Some(b"ticket".to_vec())
        );

        Ok(())
    }

    #[test]
    fn oversized_length() -> Result<(), AppleCodeIdentityError> {
        let mut data: Vec<u8> = vec![];
        data.iowrite_with(
            NotarizationTrailer::new(NotarizationTrailerType::Ticket, 1000),
            scroll::LE,
        )?;

        assert!(matches!(
            read_stapled_ticket(&mut Cursor::new(&data)),
            Err(AppleCodeIdentityError::BadNotarizationTrailer(_))
        ));

        Ok(())
    }
}
