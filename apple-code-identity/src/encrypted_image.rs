// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Encrypted disk image disk representation.

Encrypted images start with a fixed 72 byte big-endian header
([EncryptedImageHeader]) whose two magic words spell `encrcdsa`. An
[AuthTable] follows the header. The encrypted data fork starts at the
header's `data_offset` and runs to the end of the file.

Only version 2 headers are understood. Anything else is rejected.
*/

use {
    crate::{
        auth_table::AuthTable,
        disk_rep::{validate_signature_region, DiskRepresentation},
        error::AppleCodeIdentityError,
    },
    log::{info, warn},
    scroll::{Pread, Pwrite, SizeWith},
    std::{
        fs::{File, OpenOptions},
        io::{Read, Seek, SeekFrom, Write},
        path::{Path, PathBuf},
    },
};

/// The two header magic words.
pub const ENCRYPTED_IMAGE_SIGNATURE: &[u8; 8] = b"encrcdsa";

/// The only supported header version.
pub const ENCRYPTED_IMAGE_VERSION: u32 = 2;

/// Size of [EncryptedImageHeader] on disk. The auth table starts here.
pub const ENCRYPTED_IMAGE_HEADER_SIZE: u64 = 72;

/// Fixed header of an encrypted disk image.
///
/// Encryption parameters are carried but not interpreted.
#[derive(Clone, Debug, Eq, PartialEq, Pread, Pwrite, SizeWith)]
pub struct EncryptedImageHeader {
    /// "encr"
    pub signature1: [u8; 4],
    /// "cdsa"
    pub signature2: [u8; 4],
    pub version: u32,
    pub enc_iv_size: u32,
    pub enc_mode: u32,
    pub enc_algorithm: u32,
    pub key_bits: u32,
    pub prng_algorithm: u32,
    pub prng_key_bits: u32,
    pub uuid: [u8; 16],
    pub block_size: u32,
    pub data_size: u64,
    pub data_offset: u64,
}

impl EncryptedImageHeader {
    /// Read and validate the header at the start of a stream.
    pub fn read_from<R: Read + Seek>(reader: &mut R) -> Result<Self, AppleCodeIdentityError> {
        reader.seek(SeekFrom::Start(0))?;

        let mut data = [0u8; ENCRYPTED_IMAGE_HEADER_SIZE as usize];
        reader
            .read_exact(&mut data)
            .map_err(|_| AppleCodeIdentityError::EncryptedImageTruncated)?;

        let header = data.pread_with::<EncryptedImageHeader>(0, scroll::BE)?;

        if &header.signature1 != b"encr" || &header.signature2 != b"cdsa" {
            return Err(AppleCodeIdentityError::BadMagic("encrypted image header"));
        }

        if header.version != ENCRYPTED_IMAGE_VERSION {
            warn!(
                "rejecting encrypted image header version {}",
                header.version
            );
            return Err(AppleCodeIdentityError::EncryptedImageUnsupportedVersion(
                header.version,
            ));
        }

        Ok(header)
    }
}

/// Whether a file starts with a supported encrypted image header.
pub fn path_is_encrypted_image(path: impl AsRef<Path>) -> Result<bool, AppleCodeIdentityError> {
    let mut fh = File::open(path.as_ref())?;

    Ok(EncryptedImageHeader::read_from(&mut fh).is_ok())
}

/// An encrypted disk image on disk.
#[derive(Debug)]
pub struct EncryptedImage {
    path: PathBuf,
    header: EncryptedImageHeader,
    table: AuthTable,
    file_length: u64,
    signature: Option<Vec<u8>>,
}

impl EncryptedImage {
    /// Open an encrypted image.
    ///
    /// The header and auth table are validated before the signature entry,
    /// if any, is read and strictly parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AppleCodeIdentityError> {
        let path = path.as_ref();
        let mut fh = File::open(path)?;

        let header = EncryptedImageHeader::read_from(&mut fh)?;
        let table = AuthTable::parse(&mut fh, ENCRYPTED_IMAGE_HEADER_SIZE)?;
        let file_length = fh.seek(SeekFrom::End(0))?;

        let signature = match table.signature_entry() {
            Some(entry) if entry.length() > 0 => Some(validate_signature_region(
                entry.data(&mut fh)?.to_vec(),
            )?),
            _ => None,
        };

        Ok(Self {
            path: path.to_path_buf(),
            header,
            table,
            file_length,
            signature,
        })
    }

    pub fn header(&self) -> &EncryptedImageHeader {
        &self.header
    }

    pub fn auth_table(&self) -> &AuthTable {
        &self.table
    }

    /// Store a new signature superblob in the auth table.
    ///
    /// All entries are repacked after the table. The file is left untouched
    /// if the repacked table would extend into the data fork.
    pub fn write_signature(&mut self, signature: Vec<u8>) -> Result<(), AppleCodeIdentityError> {
        let mut fh = OpenOptions::new().read(true).write(true).open(&self.path)?;

        let mut table = self.table.clone();
        table.load_all(&mut fh)?;
        table.set_signature(signature);
        table.prepare_entries(ENCRYPTED_IMAGE_HEADER_SIZE);
        table.check_fits(ENCRYPTED_IMAGE_HEADER_SIZE, self.header.data_offset)?;

        let mut payloads = Vec::with_capacity(table.entries().len());
        for entry in table.entries() {
            if entry.length() > 0 {
                payloads.push((entry.offset(), entry.data(&mut fh)?.to_vec()));
            }
        }

        info!(
            "writing auth table with {} entries to {}",
            table.entries().len(),
            self.path.display()
        );

        fh.seek(SeekFrom::Start(ENCRYPTED_IMAGE_HEADER_SIZE))?;
        fh.write_all(&table.to_bytes()?)?;

        for (offset, data) in payloads {
            fh.seek(SeekFrom::Start(offset))?;
            fh.write_all(&data)?;
        }

        fh.flush()?;

        self.flush()
    }
}

impl DiskRepresentation for EncryptedImage {
    fn format(&self) -> String {
        "encrypted disk image".into()
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn signature_data(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    fn signing_base(&self) -> u64 {
        self.header.data_offset
    }

    fn signing_limit(&self) -> u64 {
        self.file_length.saturating_sub(self.header.data_offset)
    }

    /// The container UUID from the header.
    fn identification(&self) -> Result<Vec<u8>, AppleCodeIdentityError> {
        let mut res = b"UUID".to_vec();
        res.extend_from_slice(&self.header.uuid);

        Ok(res)
    }

    fn flush(&mut self) -> Result<(), AppleCodeIdentityError> {
        *self = Self::open(&self.path)?;

        Ok(())
    }
}
