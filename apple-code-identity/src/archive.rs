// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Installer archive disk representation.

Installer packages are xar archives. Their signatures live in the archive's
table of contents, which this crate doesn't parse. Instead an
[ArchiveSignatureProvider] extracts the superblob, the table of contents
checksum and the signed byte range. Stapled notarization tickets are read
from the `t8lr` trailer chain at the end of the file.
*/

use {
    crate::{
        disk_rep::{validate_signature_region, DiskRepresentation},
        error::AppleCodeIdentityError,
        stapling::read_stapled_ticket,
    },
    log::debug,
    std::{
        fmt::Debug,
        fs::File,
        io::Read,
        path::{Path, PathBuf},
        sync::Arc,
    },
};

/// Magic at the start of xar archives.
pub const XAR_MAGIC: &[u8; 4] = b"xar!";

/// Extracts signature data from installer archives.
pub trait ArchiveSignatureProvider: Debug + Send + Sync {
    /// The superblob embedded in the archive, if signed.
    fn signature(&self, path: &Path) -> Result<Option<Vec<u8>>, AppleCodeIdentityError>;

    /// Checksum of the archive's table of contents.
    fn checksum(&self, path: &Path) -> Result<Vec<u8>, AppleCodeIdentityError>;

    /// File offset and length of the signed content.
    fn signing_range(&self, path: &Path) -> Result<(u64, u64), AppleCodeIdentityError>;
}

/// An installer archive on disk.
#[derive(Debug)]
pub struct ArchiveFile {
    path: PathBuf,
    provider: Arc<dyn ArchiveSignatureProvider>,
    signature: Option<Vec<u8>>,
    checksum: Vec<u8>,
    signing_range: (u64, u64),
}

impl ArchiveFile {
    /// Open an archive, consulting `provider` for its signature.
    pub fn open(
        path: impl AsRef<Path>,
        provider: Arc<dyn ArchiveSignatureProvider>,
    ) -> Result<Self, AppleCodeIdentityError> {
        let path = path.as_ref();

        let mut magic = [0u8; 4];
        File::open(path)?
            .read_exact(&mut magic)
            .map_err(|_| AppleCodeIdentityError::BadMagic("xar archive"))?;
        if &magic != XAR_MAGIC {
            return Err(AppleCodeIdentityError::BadMagic("xar archive"));
        }

        let signature = match provider.signature(path)? {
            Some(data) => Some(validate_signature_region(data)?),
            None => None,
        };
        let checksum = provider.checksum(path)?;
        let signing_range = provider.signing_range(path)?;

        debug!(
            "{}: archive signing range {:?}; signed: {}",
            path.display(),
            signing_range,
            signature.is_some()
        );

        Ok(Self {
            path: path.to_path_buf(),
            provider,
            signature,
            checksum,
            signing_range,
        })
    }
}

impl DiskRepresentation for ArchiveFile {
    fn format(&self) -> String {
        "installer archive".into()
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn signature_data(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    fn signing_base(&self) -> u64 {
        self.signing_range.0
    }

    fn signing_limit(&self) -> u64 {
        self.signing_range.1
    }

    /// The table of contents checksum.
    fn identification(&self) -> Result<Vec<u8>, AppleCodeIdentityError> {
        Ok(self.checksum.clone())
    }

    fn flush(&mut self) -> Result<(), AppleCodeIdentityError> {
        *self = Self::open(&self.path, self.provider.clone())?;

        Ok(())
    }

    fn stapled_ticket(&self) -> Result<Option<Vec<u8>>, AppleCodeIdentityError> {
        read_stapled_ticket(&mut File::open(&self.path)?)
    }
}
