// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! UDIF (DMG) disk representation.

The last 512 bytes of a DMG are a "koly" structure, which we represent by
[KolyTrailer]. Within the [KolyTrailer] are a pair of [u64] denoting the
file offset and size of an embedded code signature superblob.

The signed content is the file up to the superblob. Stapled notarization
tickets live in the superblob's ticket slot.
*/

use {
    crate::{
        disk_rep::{validate_signature_region, DiskRepresentation},
        embedded_signature::DigestType,
        error::AppleCodeIdentityError,
    },
    log::debug,
    scroll::{Pread, Pwrite, SizeWith},
    std::{
        fs::File,
        io::{Read, Seek, SeekFrom},
        path::{Path, PathBuf},
    },
};

/// Size of the [KolyTrailer] at the end of the file.
pub const KOLY_SIZE: u64 = 512;

/// DMG trailer describing file content.
///
/// This is the main structure defining a DMG.
#[derive(Clone, Debug, Pread, PartialEq, Pwrite, SizeWith)]
pub struct KolyTrailer {
    /// "koly"
    pub signature: [u8; 4],
    pub version: u32,
    pub header_size: u32,
    pub flags: u32,
    pub running_data_fork_offset: u64,
    pub data_fork_offset: u64,
    pub data_fork_length: u64,
    pub rsrc_fork_offset: u64,
    pub rsrc_fork_length: u64,
    pub segment_number: u32,
    pub segment_count: u32,
    pub segment_id: [u32; 4],
    pub data_fork_digest_type: u32,
    pub data_fork_digest_size: u32,
    pub data_fork_digest: [u32; 32],
    pub plist_offset: u64,
    pub plist_length: u64,
    pub reserved1: [u64; 8],
    pub code_signature_offset: u64,
    pub code_signature_size: u64,
    pub reserved2: [u64; 5],
    pub main_digest_type: u32,
    pub main_digest_size: u32,
    pub main_digest: [u32; 32],
    pub image_variant: u32,
    pub sector_count: u64,
}

impl KolyTrailer {
    /// Read the raw trailer bytes at the end of a seekable reader.
    fn read_raw<R: Read + Seek>(reader: &mut R) -> Result<Vec<u8>, AppleCodeIdentityError> {
        let len = reader.seek(SeekFrom::End(0))?;
        if len < KOLY_SIZE {
            return Err(AppleCodeIdentityError::BadMagic("DMG koly trailer"));
        }

        reader.seek(SeekFrom::Start(len - KOLY_SIZE))?;

        // We can't use IOread with structs larger than 256 bytes.
        let mut data = vec![];
        reader.read_to_end(&mut data)?;

        Ok(data)
    }

    fn parse(data: &[u8]) -> Result<Self, AppleCodeIdentityError> {
        let koly = data.pread_with::<KolyTrailer>(0, scroll::BE)?;

        if &koly.signature != b"koly" {
            return Err(AppleCodeIdentityError::BadMagic("DMG koly trailer"));
        }

        Ok(koly)
    }

    /// Construct an instance by reading from a seekable reader.
    ///
    /// The trailer is the final 512 bytes of the seekable stream.
    pub fn read_from<R: Read + Seek>(reader: &mut R) -> Result<Self, AppleCodeIdentityError> {
        Self::parse(&Self::read_raw(reader)?)
    }
}

/// Determines whether a filesystem path is a DMG.
///
/// Returns true if the path has a DMG trailer.
pub fn path_is_dmg(path: impl AsRef<Path>) -> Result<bool, AppleCodeIdentityError> {
    let mut fh = File::open(path.as_ref())?;

    Ok(KolyTrailer::read_from(&mut fh).is_ok())
}

/// A DMG on disk.
#[derive(Debug)]
pub struct DmgFile {
    path: PathBuf,
    koly: KolyTrailer,
    koly_data: Vec<u8>,
    file_length: u64,
    signature: Option<Vec<u8>>,
}

impl DmgFile {
    /// Open a DMG, reading its trailer and code signature.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AppleCodeIdentityError> {
        let path = path.as_ref();
        let mut fh = File::open(path)?;

        let koly_data = KolyTrailer::read_raw(&mut fh)?;
        let koly = KolyTrailer::parse(&koly_data)?;
        let file_length = fh.seek(SeekFrom::End(0))?;

        let offset = koly.code_signature_offset;
        let size = koly.code_signature_size;

        let signature = if offset != 0 && size != 0 {
            let end = offset.checked_add(size).ok_or_else(|| {
                AppleCodeIdentityError::SignatureInvalid(format!(
                    "DMG code signature at {} with size {} overflows",
                    offset, size
                ))
            })?;

            if end > file_length.saturating_sub(KOLY_SIZE) {
                return Err(AppleCodeIdentityError::SignatureInvalid(format!(
                    "DMG code signature {}..{} overlaps trailer",
                    offset, end
                )));
            }

            fh.seek(SeekFrom::Start(offset))?;
            let mut data = vec![];
            fh.take(size).read_to_end(&mut data)?;

            Some(validate_signature_region(data)?)
        } else {
            None
        };

        debug!(
            "{}: DMG version {}; signature {} bytes at {}",
            path.display(),
            koly.version,
            size,
            offset
        );

        Ok(Self {
            path: path.to_path_buf(),
            koly,
            koly_data,
            file_length,
            signature,
        })
    }

    /// Obtain the main data structure describing this DMG.
    pub fn koly(&self) -> &KolyTrailer {
        &self.koly
    }
}

impl DiskRepresentation for DmgFile {
    fn format(&self) -> String {
        "disk image".into()
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn signature_data(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    fn signing_base(&self) -> u64 {
        0
    }

    /// Content up to the code signature or, when unsigned, the trailer.
    fn signing_limit(&self) -> u64 {
        if self.koly.code_signature_offset != 0 {
            self.koly.code_signature_offset
        } else {
            self.file_length.saturating_sub(KOLY_SIZE)
        }
    }

    /// SHA-1 of the raw trailer.
    fn identification(&self) -> Result<Vec<u8>, AppleCodeIdentityError> {
        DigestType::Sha1.digest_data(&self.koly_data)
    }

    fn flush(&mut self) -> Result<(), AppleCodeIdentityError> {
        *self = Self::open(&self.path)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::embedded_signature_builder::EmbeddedSignatureBuilder};

    const CODE_SIGNATURE_OFFSET: usize = 296;

    fn dmg_bytes(content: &[u8], signature: Option<&[u8]>) -> Vec<u8> {
        let mut data = content.to_vec();

        let mut koly = vec![0u8; KOLY_SIZE as usize];
        koly[0..4].copy_from_slice(b"koly");
        koly[4..8].copy_from_slice(&4u32.to_be_bytes());
        koly[8..12].copy_from_slice(&512u32.to_be_bytes());

        if let Some(signature) = signature {
            let offset = data.len() as u64;
            data.extend_from_slice(signature);

            koly[CODE_SIGNATURE_OFFSET..CODE_SIGNATURE_OFFSET + 8]
                .copy_from_slice(&offset.to_be_bytes());
            koly[CODE_SIGNATURE_OFFSET + 8..CODE_SIGNATURE_OFFSET + 16]
                .copy_from_slice(&(signature.len() as u64).to_be_bytes());
        }

        data.extend_from_slice(&koly);
        data
    }

    #[test]
    fn koly_layout() {
        let mut data = dmg_bytes(b"", None);
        data[CODE_SIGNATURE_OFFSET..CODE_SIGNATURE_OFFSET + 8]
            .copy_from_slice(&0x1122u64.to_be_bytes());

        let koly = KolyTrailer::parse(&data).unwrap();
        assert_eq!(koly.version, 4);
        assert_eq!(koly.code_signature_offset, 0x1122);
    }

    #[test]
    fn unsigned() -> Result<(), AppleCodeIdentityError> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("image.dmg");
        std::fs::write(&path, dmg_bytes(&[0x42; 1000], None))?;

        assert!(path_is_dmg(&path)?);

        let dmg = DmgFile::open(&path)?;
        assert!(dmg.signature_data().is_none());
        assert_eq!(dmg.signing_base(), 0);
        assert_eq!(dmg.signing_limit(), 1000);
        assert_eq!(dmg.identification()?.len(), 20);

        Ok(())
    }

    #[test]
    fn signed() -> Result<(), AppleCodeIdentityError> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("image.dmg");

        let mut builder = EmbeddedSignatureBuilder::default();
        builder.add_cms_signature(vec![])?;
        let superblob = builder.create_superblob()?;

        std::fs::write(&path, dmg_bytes(&[0x42; 1000], Some(&superblob)))?;

        let dmg = DmgFile::open(&path)?;
        assert_eq!(dmg.signature_data(), Some(superblob.as_slice()));
        assert_eq!(dmg.signing_limit(), 1000);
        assert!(dmg.stapled_ticket()?.is_none());

        Ok(())
    }

    #[test]
    fn bad_trailer() -> Result<(), AppleCodeIdentityError> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("image.dmg");
        std::fs::write(&path, vec![0u8; 1024])?;

        assert!(!path_is_dmg(&path)?);
        assert!(matches!(
            DmgFile::open(&path),
            Err(AppleCodeIdentityError::BadMagic(_))
        ));

        Ok(())
    }

    #[test]
    fn hostile_signature_bounds() -> Result<(), AppleCodeIdentityError> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("image.dmg");

        let hostile = |offset: u64, size: u64| {
            let mut data = dmg_bytes(&[0x42; 512], None);
            let koly = data.len() - KOLY_SIZE as usize;
            data[koly + CODE_SIGNATURE_OFFSET..koly + CODE_SIGNATURE_OFFSET + 8]
                .copy_from_slice(&offset.to_be_bytes());
            data[koly + CODE_SIGNATURE_OFFSET + 8..koly + CODE_SIGNATURE_OFFSET + 16]
                .copy_from_slice(&size.to_be_bytes());
            data
        };

        // offset + size wraps around.
        std::fs::write(&path, hostile(u64::MAX - 8, 16))?;
        assert!(matches!(
            DmgFile::open(&path),
            Err(AppleCodeIdentityError::SignatureInvalid(_))
        ));

        // Runs into the trailer.
        std::fs::write(&path, hostile(500, 16))?;
        assert!(matches!(
            DmgFile::open(&path),
            Err(AppleCodeIdentityError::SignatureInvalid(_))
        ));

        Ok(())
    }
}
