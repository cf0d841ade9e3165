// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Format-independent access to code on disk.

A disk representation locates the signature superblob inside one container
format and describes the byte range the signature covers. Everything that
evaluates code identity works against the [DiskRepresentation] trait.

The superblob is read once when the representation is opened and retained
until [DiskRepresentation::flush] re-reads the file.
*/

use {
    crate::{
        archive::ArchiveFile,
        dmg::{DmgFile, KOLY_SIZE},
        embedded_signature::{CodeSigningSlot, EmbeddedSignature},
        encrypted_image::{EncryptedImage, ENCRYPTED_IMAGE_SIGNATURE},
        error::AppleCodeIdentityError,
        macho::MachOFile,
        verification_settings::VerificationSettings,
    },
    log::debug,
    std::{
        fmt::Debug,
        fs::File,
        io::{Read, Seek, SeekFrom},
        path::Path,
    },
};

/// Code stored in some container format.
pub trait DiskRepresentation: Debug + Send + Sync {
    /// Human readable description of the format.
    fn format(&self) -> String;

    /// Path of the file backing this representation.
    fn path(&self) -> &Path;

    /// Raw superblob bytes, if the code is signed.
    fn signature_data(&self) -> Option<&[u8]>;

    /// File offset at which signed content begins.
    fn signing_base(&self) -> u64;

    /// Length of the signed content starting at [Self::signing_base].
    fn signing_limit(&self) -> u64;

    /// Identifies the code independently of its signature.
    fn identification(&self) -> Result<Vec<u8>, AppleCodeIdentityError>;

    /// Re-read the file, discarding cached signature data.
    fn flush(&mut self) -> Result<(), AppleCodeIdentityError>;

    /// The parsed superblob, if the code is signed.
    fn signature(&self) -> Result<Option<EmbeddedSignature<'_>>, AppleCodeIdentityError> {
        match self.signature_data() {
            Some(data) => Ok(Some(EmbeddedSignature::from_bytes(data)?)),
            None => Ok(None),
        }
    }

    /// Raw blob of a superblob slot.
    fn component(&self, slot: CodeSigningSlot) -> Result<Option<Vec<u8>>, AppleCodeIdentityError> {
        Ok(self
            .signature()?
            .and_then(|sig| sig.component(slot))
            .map(|data| data.to_vec()))
    }

    /// The Info.plist associated with the code.
    fn info_plist(&self) -> Result<Option<plist::Dictionary>, AppleCodeIdentityError> {
        Ok(None)
    }

    /// A notarization ticket stapled to the container.
    fn stapled_ticket(&self) -> Result<Option<Vec<u8>>, AppleCodeIdentityError> {
        match self.signature()? {
            Some(sig) => Ok(sig.ticket_data()?.map(|data| data.to_vec())),
            None => Ok(None),
        }
    }
}

/// Strictly validate superblob bytes read from a container.
///
/// The region holding the superblob may be padded. The returned bytes are
/// trimmed to the superblob's declared length. Validation failures are
/// reported as [AppleCodeIdentityError::SignatureInvalid] so they can't be
/// mistaken for unsigned code.
pub(crate) fn validate_signature_region(
    mut data: Vec<u8>,
) -> Result<Vec<u8>, AppleCodeIdentityError> {
    let length = match EmbeddedSignature::from_container_bytes(&data) {
        Ok(sig) => sig.length as usize,
        Err(e) => return Err(AppleCodeIdentityError::SignatureInvalid(e.to_string())),
    };

    data.truncate(length);

    Ok(data)
}

/// Container formats recognized by [open_disk_representation].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiskFormat {
    MachO,
    EncryptedImage,
    Dmg,
    Archive,
}

const MACHO_MAGICS: [u32; 6] = [
    0xfeedface, 0xfeedfacf, 0xcefaedfe, 0xcffaedfe, 0xcafebabe, 0xcafebabf,
];

/// Sniff the container format of a file.
///
/// Returns `Ok(None)` for unrecognized content.
pub fn detect_format(path: &Path) -> Result<Option<DiskFormat>, AppleCodeIdentityError> {
    let mut fh = File::open(path)?;

    let mut header = [0u8; 8];
    let count = fh.read(&mut header)?;

    if count >= 4 {
        let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);

        if MACHO_MAGICS.contains(&magic) {
            return Ok(Some(DiskFormat::MachO));
        }
        if &header[0..4] == b"xar!" {
            return Ok(Some(DiskFormat::Archive));
        }
    }

    if count == 8 && &header == ENCRYPTED_IMAGE_SIGNATURE {
        return Ok(Some(DiskFormat::EncryptedImage));
    }

    let len = fh.seek(SeekFrom::End(0))?;
    if len >= KOLY_SIZE {
        fh.seek(SeekFrom::End(-(KOLY_SIZE as i64)))?;
        let mut magic = [0u8; 4];
        fh.read_exact(&mut magic)?;

        if &magic == b"koly" {
            return Ok(Some(DiskFormat::Dmg));
        }
    }

    Ok(None)
}

/// Open the disk representation of a file, picking the format by content.
pub fn open_disk_representation(
    path: impl AsRef<Path>,
    settings: &VerificationSettings,
) -> Result<Box<dyn DiskRepresentation>, AppleCodeIdentityError> {
    let path = path.as_ref();

    let format = detect_format(path)?
        .ok_or_else(|| AppleCodeIdentityError::UnrecognizedFormat(path.to_path_buf()))?;

    debug!("opening {} as {:?}", path.display(), format);

    Ok(match format {
        DiskFormat::MachO => Box::new(MachOFile::open(path, settings.preferred_architecture())?),
        DiskFormat::EncryptedImage => Box::new(EncryptedImage::open(path)?),
        DiskFormat::Dmg => Box::new(DmgFile::open(path)?),
        DiskFormat::Archive => {
            let provider = settings.archive_signature_provider().ok_or_else(|| {
                AppleCodeIdentityError::ArchiveSignature(
                    "no archive signature provider is configured".into(),
                )
            })?;

            Box::new(ArchiveFile::open(path, provider)?)
        }
    })
}
