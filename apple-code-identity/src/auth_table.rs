// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Auth tables of encrypted disk images.

An auth table immediately follows the encrypted image header. It is a
big-endian `u32` entry count followed by that many 20 byte records of
`{u32 mechanism; u64 offset; u64 length}`. Offsets are absolute file offsets
and point into the region between the end of the table and the start of the
data fork. One entry, tagged with [AUTH_MECHANISM_SIGNATURE], may hold the
code signature superblob.

Entry payloads are read from the file only when first requested.
*/

use {
    crate::error::AppleCodeIdentityError,
    once_cell::sync::OnceCell,
    scroll::{IOread, Pread, Pwrite, SizeWith},
    std::io::{Read, Seek, SeekFrom},
};

/// Maximum number of entries accepted in an auth table.
pub const AUTH_TABLE_MAX_ENTRIES: u32 = 1024;

/// Mechanism tag of the entry holding the code signature.
pub const AUTH_MECHANISM_SIGNATURE: u32 = 3;

const RECORD_SIZE: u64 = 20;

/// On-disk form of an auth table entry.
#[derive(Clone, Copy, Debug, Pread, Pwrite, SizeWith)]
struct AuthTableRecord {
    mechanism: u32,
    offset: u64,
    length: u64,
}

/// An entry in an [AuthTable].
#[derive(Clone, Debug)]
pub struct AuthTableEntry {
    mechanism: u32,
    offset: u64,
    length: u64,
    data: OnceCell<Vec<u8>>,
}

impl AuthTableEntry {
    /// Construct a new entry holding `data`.
    ///
    /// The entry has no file offset until [AuthTable::prepare_entries] assigns one.
    pub fn new(mechanism: u32, data: Vec<u8>) -> Self {
        let cell = OnceCell::new();
        let length = data.len() as u64;
        // A fresh cell always accepts its first value.
        let _ = cell.set(data);

        Self {
            mechanism,
            offset: 0,
            length,
            data: cell,
        }
    }

    fn from_record(record: AuthTableRecord) -> Result<Self, AppleCodeIdentityError> {
        if (record.offset == 0) != (record.length == 0) {
            return Err(AppleCodeIdentityError::AuthTableOffsetLengthMismatch(
                record.mechanism,
            ));
        }

        Ok(Self {
            mechanism: record.mechanism,
            offset: record.offset,
            length: record.length,
            data: OnceCell::new(),
        })
    }

    fn record(&self) -> AuthTableRecord {
        AuthTableRecord {
            mechanism: self.mechanism,
            offset: self.offset,
            length: self.length,
        }
    }

    pub fn mechanism(&self) -> u32 {
        self.mechanism
    }

    /// Absolute file offset of the payload. 0 for empty entries.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn is_signature(&self) -> bool {
        self.mechanism == AUTH_MECHANISM_SIGNATURE
    }

    /// The payload, if it has been loaded already.
    pub fn loaded_data(&self) -> Option<&[u8]> {
        self.data.get().map(|data| data.as_slice())
    }

    /// Obtain the payload, reading it from `reader` on first access.
    pub fn data<R: Read + Seek>(&self, reader: &mut R) -> Result<&[u8], AppleCodeIdentityError> {
        let data = self.data.get_or_try_init(|| {
            if self.length == 0 {
                return Ok(vec![]);
            }

            reader.seek(SeekFrom::Start(self.offset))?;
            let mut data = Vec::with_capacity(self.length.min(1 << 20) as usize);
            reader.take(self.length).read_to_end(&mut data)?;

            if data.len() as u64 != self.length {
                return Err(AppleCodeIdentityError::EncryptedImageTruncated);
            }

            Ok(data)
        })?;

        Ok(data.as_slice())
    }
}

/// The directory of entries following an encrypted image header.
#[derive(Clone, Debug, Default)]
pub struct AuthTable {
    entries: Vec<AuthTableEntry>,
}

impl AuthTable {
    /// Parse an auth table starting at `table_offset`.
    ///
    /// Payloads are not read.
    pub fn parse<R: Read + Seek>(
        reader: &mut R,
        table_offset: u64,
    ) -> Result<Self, AppleCodeIdentityError> {
        reader.seek(SeekFrom::Start(table_offset))?;

        let count = reader
            .ioread_with::<u32>(scroll::BE)
            .map_err(|_| AppleCodeIdentityError::EncryptedImageTruncated)?;

        if count > AUTH_TABLE_MAX_ENTRIES {
            return Err(AppleCodeIdentityError::AuthTableTooManyEntries(count));
        }

        let mut data = vec![0u8; count as usize * RECORD_SIZE as usize];
        reader
            .read_exact(&mut data)
            .map_err(|_| AppleCodeIdentityError::EncryptedImageTruncated)?;

        let mut entries = Vec::with_capacity(count as usize);
        let offset = &mut 0;
        let mut have_signature = false;

        for _ in 0..count {
            let entry =
                AuthTableEntry::from_record(data.gread_with::<AuthTableRecord>(offset, scroll::BE)?)?;

            if entry.is_signature() {
                if have_signature {
                    return Err(AppleCodeIdentityError::AuthTableDuplicateSignature);
                }
                have_signature = true;
            }

            entries.push(entry);
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[AuthTableEntry] {
        &self.entries
    }

    pub fn signature_entry(&self) -> Option<&AuthTableEntry> {
        self.entries.iter().find(|entry| entry.is_signature())
    }

    /// Replace the signature entry, appending one if absent.
    pub fn set_signature(&mut self, data: Vec<u8>) {
        let entry = AuthTableEntry::new(AUTH_MECHANISM_SIGNATURE, data);

        match self.entries.iter_mut().find(|entry| entry.is_signature()) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Read every payload not yet loaded.
    pub fn load_all<R: Read + Seek>(&self, reader: &mut R) -> Result<(), AppleCodeIdentityError> {
        for entry in &self.entries {
            entry.data(reader)?;
        }

        Ok(())
    }

    /// Size of the serialized table itself.
    pub fn serialized_size(&self) -> u64 {
        4 + RECORD_SIZE * self.entries.len() as u64
    }

    /// Assign payload offsets, packing entries contiguously after the table.
    ///
    /// Empty entries get offset 0.
    pub fn prepare_entries(&mut self, table_offset: u64) {
        let mut offset = table_offset + self.serialized_size();

        for entry in self.entries.iter_mut() {
            if entry.length == 0 {
                entry.offset = 0;
            } else {
                entry.offset = offset;
                offset += entry.length;
            }
        }
    }

    /// First file offset past the table and every payload.
    pub fn find_first_empty_data_offset(&self, table_offset: u64) -> u64 {
        self.entries
            .iter()
            .filter(|entry| entry.length != 0)
            .map(|entry| entry.offset + entry.length)
            .fold(table_offset + self.serialized_size(), u64::max)
    }

    /// Ensure the table and its payloads end at or before the data fork.
    pub fn check_fits(
        &self,
        table_offset: u64,
        data_offset: u64,
    ) -> Result<(), AppleCodeIdentityError> {
        let end = self.find_first_empty_data_offset(table_offset);

        if end > data_offset {
            Err(AppleCodeIdentityError::AuthTableOverlapsData { end, data_offset })
        } else {
            Ok(())
        }
    }

    /// Serialize the count and entry records.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AppleCodeIdentityError> {
        let mut data = vec![0u8; self.serialized_size() as usize];
        let offset = &mut 0;

        data.gwrite_with(self.entries.len() as u32, offset, scroll::BE)?;
        for entry in &self.entries {
            data.gwrite_with(entry.record(), offset, scroll::BE)?;
        }

        Ok(data)
    }
}
