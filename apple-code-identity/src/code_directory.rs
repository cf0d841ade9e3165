// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code directory data structure and related types.
//!
//! The code directory is the hashed manifest of a signed image. Its digest,
//! truncated to 20 bytes, is the *cdhash* that identifies the code everywhere
//! else: trust caches, notarization tickets and the kernel's view of a running
//! process.

use {
    crate::{
        embedded_signature::{
            read_and_validate_blob_header, Blob, CodeSigningMagic, CodeSigningSlot, Digest,
            DigestType,
        },
        error::AppleCodeIdentityError,
    },
    scroll::{IOwrite, Pread},
    std::{borrow::Cow, collections::HashMap, io::Write},
};

/// Length of a cdhash in bytes.
pub const CDHASH_LENGTH: usize = 20;

bitflags::bitflags! {
    /// Code signature flags.
    ///
    /// These flags are embedded in the Code Directory and govern use of the embedded
    /// signature.
    pub struct CodeSignatureFlags: u32 {
        /// Code may act as a host that controls and supervises guest code.
        const HOST = 0x0001;
        /// The code has been sealed without a signing identity.
        const ADHOC = 0x0002;
        /// Set the "hard" status bit for the code when it starts running.
        const FORCE_HARD = 0x0100;
        /// Implicitly set the "kill" status bit for the code when it starts running.
        const FORCE_KILL = 0x0200;
        /// Force certificate expiration checks.
        const FORCE_EXPIRATION = 0x0400;
        /// Restrict dyld loading.
        const RESTRICT = 0x0800;
        /// Enforce code signing.
        const ENFORCEMENT = 0x1000;
        /// Library validation required.
        const LIBRARY_VALIDATION = 0x2000;
        /// Apply runtime hardening policies.
        const RUNTIME = 0x10000;
        /// The code was automatically signed by the linker.
        const LINKER_SIGNED = 0x20000;
    }
}

bitflags::bitflags! {
    /// Flags that influence behavior of executable segment.
    pub struct ExecutableSegmentFlags: u64 {
        /// Executable segment belongs to main binary.
        const MAIN_BINARY = 0x0001;
        /// Allow unsigned pages (for debugging).
        const ALLOW_UNSIGNED = 0x0010;
        /// Main binary is debugger.
        const DEBUGGER = 0x0020;
        /// JIT enabled.
        const JIT = 0x0040;
        /// Skip library validation (obsolete).
        const SKIP_LIBRARY_VALIDATION = 0x0080;
        /// Can bless code directory hash for execution.
        const CAN_LOAD_CD_HASH = 0x0100;
        /// Can execute blessed code directory hash.
        const CAN_EXEC_CD_HASH = 0x0200;
    }
}

/// Version of Code Directory data structure.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u32)]
pub enum CodeDirectoryVersion {
    Initial = 0x20000,
    SupportsScatter = 0x20100,
    SupportsTeamId = 0x20200,
    SupportsCodeLimit64 = 0x20300,
    SupportsExecutableSegment = 0x20400,
    SupportsRuntime = 0x20500,
    SupportsLinkage = 0x20600,
}

fn get_hashes(
    data: &[u8],
    offset: usize,
    count: usize,
    hash_size: usize,
) -> Result<Vec<Digest<'_>>, AppleCodeIdentityError> {
    if hash_size == 0 {
        return if count == 0 {
            Ok(vec![])
        } else {
            Err(AppleCodeIdentityError::BlobMalformed("code directory hash size"))
        };
    }

    let end = count
        .checked_mul(hash_size)
        .and_then(|len| offset.checked_add(len))
        .ok_or(AppleCodeIdentityError::BlobMalformed("code directory hashes"))?;

    let hashes = data
        .get(offset..end)
        .ok_or(AppleCodeIdentityError::BlobMalformed("code directory hashes"))?;

    Ok(hashes
        .chunks(hash_size)
        .map(|data| Digest { data: data.into() })
        .collect())
}

fn read_c_string<'a>(
    data: &'a [u8],
    offset: usize,
    what: &'static str,
) -> Result<Cow<'a, str>, AppleCodeIdentityError> {
    let tail = data
        .get(offset..)
        .ok_or(AppleCodeIdentityError::BlobMalformed(what))?;

    let end = tail
        .iter()
        .position(|b| *b == 0)
        .ok_or(AppleCodeIdentityError::BlobMalformed(what))?;

    std::str::from_utf8(&tail[0..end])
        .map(Cow::from)
        .map_err(|_| AppleCodeIdentityError::BlobMalformed(what))
}

/// Represents a code directory blob entry.
///
/// This struct is versioned and has been extended over time. The struct here
/// represents a superset of all fields in all versions; fields introduced after
/// the parsed version are `None`.
#[derive(Debug)]
pub struct CodeDirectoryBlob<'a> {
    /// Compatibility version.
    pub version: u32,
    /// Setup and mode flags.
    pub flags: CodeSignatureFlags,
    /// Limit to main image signature range.
    pub code_limit: u32,
    /// Size of each hash in bytes.
    pub hash_size: u8,
    /// Type of hash.
    pub hash_type: DigestType,
    /// Platform identifier. 0 if not platform binary.
    pub platform: u8,
    /// Page size in bytes. (stored as log u8)
    pub page_size: u32,
    /// Unused (must be 0).
    pub spare2: u32,
    // Version 0x20100
    /// Offset of optional scatter vector.
    pub scatter_offset: Option<u32>,
    // Version 0x20300
    pub spare3: Option<u32>,
    /// Limit to main image signature range, 64 bits.
    pub code_limit_64: Option<u64>,
    // Version 0x20400
    pub exec_seg_base: Option<u64>,
    pub exec_seg_limit: Option<u64>,
    pub exec_seg_flags: Option<ExecutableSegmentFlags>,
    // Version 0x20500
    pub runtime: Option<u32>,
    pub pre_encrypt_offset: Option<u32>,

    pub ident: Cow<'a, str>,
    pub team_name: Option<Cow<'a, str>>,
    pub code_hashes: Vec<Digest<'a>>,
    pub special_hashes: HashMap<CodeSigningSlot, Digest<'a>>,

    /// The blob exactly as it was read, header included.
    ///
    /// The cdhash is computed over these bytes so a re-serialization that
    /// differs from the original cannot change the identity.
    raw: Option<Cow<'a, [u8]>>,
}

impl<'a> Blob<'a> for CodeDirectoryBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::CodeDirectory)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, AppleCodeIdentityError> {
        let payload = read_and_validate_blob_header(data, Self::magic(), "code directory blob")?;
        let data = &data[0..payload.len() + 8];

        let offset = &mut 8;

        let version = data.gread_with(offset, scroll::BE)?;
        let flags = CodeSignatureFlags::from_bits_truncate(data.gread_with::<u32>(offset, scroll::BE)?);
        let hash_offset = data.gread_with::<u32>(offset, scroll::BE)?;
        let ident_offset = data.gread_with::<u32>(offset, scroll::BE)?;
        let n_special_slots = data.gread_with::<u32>(offset, scroll::BE)?;
        let n_code_slots = data.gread_with::<u32>(offset, scroll::BE)?;
        let code_limit = data.gread_with(offset, scroll::BE)?;
        let hash_size = data.gread_with(offset, scroll::BE)?;
        let hash_type = data.gread_with::<u8>(offset, scroll::BE)?.into();
        let platform = data.gread_with(offset, scroll::BE)?;
        let page_size = data.gread_with::<u8>(offset, scroll::BE)?;
        let page_size = 2u32
            .checked_pow(page_size as u32)
            .ok_or(AppleCodeIdentityError::BlobMalformed("code directory page size"))?;
        let spare2 = data.gread_with(offset, scroll::BE)?;

        let scatter_offset = if version >= CodeDirectoryVersion::SupportsScatter as u32 {
            Some(data.gread_with::<u32>(offset, scroll::BE)?).filter(|v| *v != 0)
        } else {
            None
        };
        let team_offset = if version >= CodeDirectoryVersion::SupportsTeamId as u32 {
            Some(data.gread_with::<u32>(offset, scroll::BE)?).filter(|v| *v != 0)
        } else {
            None
        };

        let (spare3, code_limit_64) = if version >= CodeDirectoryVersion::SupportsCodeLimit64 as u32
        {
            (
                Some(data.gread_with(offset, scroll::BE)?),
                Some(data.gread_with(offset, scroll::BE)?),
            )
        } else {
            (None, None)
        };

        let (exec_seg_base, exec_seg_limit, exec_seg_flags) =
            if version >= CodeDirectoryVersion::SupportsExecutableSegment as u32 {
                (
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(ExecutableSegmentFlags::from_bits_truncate(
                        data.gread_with::<u64>(offset, scroll::BE)?,
                    )),
                )
            } else {
                (None, None, None)
            };

        let (runtime, pre_encrypt_offset) =
            if version >= CodeDirectoryVersion::SupportsRuntime as u32 {
                (
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                )
            } else {
                (None, None)
            };

        let ident = read_c_string(data, ident_offset as usize, "code directory identifier")?;

        let team_name = match team_offset {
            Some(team_offset) => Some(read_c_string(
                data,
                team_offset as usize,
                "code directory team identifier",
            )?),
            None => None,
        };

        let code_hashes = get_hashes(
            data,
            hash_offset as usize,
            n_code_slots as usize,
            hash_size as usize,
        )?;

        let specials_offset = (hash_offset as usize)
            .checked_sub(hash_size as usize * n_special_slots as usize)
            .ok_or(AppleCodeIdentityError::BlobMalformed(
                "code directory special hashes",
            ))?;

        let special_hashes = get_hashes(
            data,
            specials_offset,
            n_special_slots as usize,
            hash_size as usize,
        )?
        .into_iter()
        .enumerate()
        .map(|(i, h)| (CodeSigningSlot::from(n_special_slots - i as u32), h))
        .collect();

        Ok(Self {
            version,
            flags,
            code_limit,
            hash_size,
            hash_type,
            platform,
            page_size,
            spare2,
            scatter_offset,
            spare3,
            code_limit_64,
            exec_seg_base,
            exec_seg_limit,
            exec_seg_flags,
            runtime,
            pre_encrypt_offset,
            ident,
            team_name,
            code_hashes,
            special_hashes,
            raw: Some(Cow::Borrowed(data)),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, AppleCodeIdentityError> {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());

        // Offsets are unknown until the variable length data is written, so
        // placeholders are patched at the end.
        cursor.iowrite_with(self.version, scroll::BE)?;
        cursor.iowrite_with(self.flags.bits(), scroll::BE)?;
        let hash_offset_cursor_position = cursor.position();
        cursor.iowrite_with(0u32, scroll::BE)?;
        let ident_offset_cursor_position = cursor.position();
        cursor.iowrite_with(0u32, scroll::BE)?;

        // Special hashes are indexed negatively from the code hashes by slot
        // number, so missing slots below the highest one are zero filled.
        let highest_slot = self
            .special_hashes
            .keys()
            .map(|slot| u32::from(*slot))
            .max()
            .unwrap_or(0);

        if highest_slot > u32::from(CodeSigningSlot::EntitlementsDer) {
            return Err(AppleCodeIdentityError::BlobMalformed(
                "special slot not expressible in code directory",
            ));
        }

        cursor.iowrite_with(highest_slot, scroll::BE)?;
        cursor.iowrite_with(self.code_hashes.len() as u32, scroll::BE)?;
        cursor.iowrite_with(self.code_limit, scroll::BE)?;
        cursor.iowrite_with(self.hash_size, scroll::BE)?;
        cursor.iowrite_with(u8::from(self.hash_type), scroll::BE)?;
        cursor.iowrite_with(self.platform, scroll::BE)?;
        cursor.iowrite_with(self.page_size.trailing_zeros() as u8, scroll::BE)?;
        cursor.iowrite_with(self.spare2, scroll::BE)?;

        let mut team_offset_cursor_position = None;

        if self.version >= CodeDirectoryVersion::SupportsScatter as u32 {
            cursor.iowrite_with(self.scatter_offset.unwrap_or(0), scroll::BE)?;
        }
        if self.version >= CodeDirectoryVersion::SupportsTeamId as u32 {
            team_offset_cursor_position = Some(cursor.position());
            cursor.iowrite_with(0u32, scroll::BE)?;
        }
        if self.version >= CodeDirectoryVersion::SupportsCodeLimit64 as u32 {
            cursor.iowrite_with(self.spare3.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.code_limit_64.unwrap_or(0), scroll::BE)?;
        }
        if self.version >= CodeDirectoryVersion::SupportsExecutableSegment as u32 {
            cursor.iowrite_with(self.exec_seg_base.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.exec_seg_limit.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(
                self.exec_seg_flags
                    .unwrap_or_else(ExecutableSegmentFlags::empty)
                    .bits(),
                scroll::BE,
            )?;
        }
        if self.version >= CodeDirectoryVersion::SupportsRuntime as u32 {
            cursor.iowrite_with(self.runtime.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.pre_encrypt_offset.unwrap_or(0), scroll::BE)?;
        }

        let identity_offset = cursor.position();
        cursor.write_all(self.ident.as_bytes())?;
        cursor.write_all(b"\0")?;

        let team_offset = cursor.position();
        if team_offset_cursor_position.is_some() {
            if let Some(team_name) = &self.team_name {
                cursor.write_all(team_name.as_bytes())?;
                cursor.write_all(b"\0")?;
            }
        }

        for slot_index in (1..highest_slot + 1).rev() {
            if let Some(hash) = self.special_hashes.get(&CodeSigningSlot::from(slot_index)) {
                cursor.write_all(&hash.data)?;
            } else {
                cursor.write_all(&b"\0".repeat(self.hash_size as usize))?;
            }
        }

        let code_hashes_start_offset = cursor.position();

        for hash in &self.code_hashes {
            cursor.write_all(&hash.data)?;
        }

        // Offsets are relative to the blob header, which isn't in this buffer.
        cursor.set_position(hash_offset_cursor_position);
        cursor.iowrite_with(code_hashes_start_offset as u32 + 8, scroll::BE)?;

        cursor.set_position(ident_offset_cursor_position);
        cursor.iowrite_with(identity_offset as u32 + 8, scroll::BE)?;

        if let Some(offset) = team_offset_cursor_position {
            if self.team_name.is_some() {
                cursor.set_position(offset);
                cursor.iowrite_with(team_offset as u32 + 8, scroll::BE)?;
            }
        }

        Ok(cursor.into_inner())
    }
}

impl<'a> CodeDirectoryBlob<'a> {
    /// Construct a minimal code directory with the given identifier.
    ///
    /// The result carries no page hashes. It is mostly useful for assembling
    /// signatures of synthetic content.
    pub fn new(ident: impl Into<Cow<'a, str>>, hash_type: DigestType) -> Result<Self, AppleCodeIdentityError> {
        Ok(Self {
            version: CodeDirectoryVersion::SupportsTeamId as u32,
            flags: CodeSignatureFlags::empty(),
            code_limit: 0,
            hash_size: hash_type.hash_len()? as u8,
            hash_type,
            platform: 0,
            page_size: 4096,
            spare2: 0,
            scatter_offset: None,
            spare3: None,
            code_limit_64: None,
            exec_seg_base: None,
            exec_seg_limit: None,
            exec_seg_flags: None,
            runtime: None,
            pre_encrypt_offset: None,
            ident: ident.into(),
            team_name: None,
            code_hashes: vec![],
            special_hashes: HashMap::new(),
            raw: None,
        })
    }

    /// Compute the cdhash of this code directory.
    ///
    /// This is the digest of the serialized blob using the directory's own
    /// hash type, truncated to [CDHASH_LENGTH] bytes.
    pub fn cdhash(&self) -> Result<Vec<u8>, AppleCodeIdentityError> {
        let mut digest = match &self.raw {
            Some(raw) => self.hash_type.digest_data(raw)?,
            None => self.hash_type.digest_data(&self.to_blob_bytes()?)?,
        };

        digest.truncate(CDHASH_LENGTH);

        Ok(digest)
    }

    /// Obtain the recorded digest of a special slot, if any.
    ///
    /// All-zero digests denote an unused slot and are treated as absent.
    pub fn special_hash(&self, slot: CodeSigningSlot) -> Option<&Digest<'a>> {
        self.special_hashes.get(&slot).filter(|d| !d.is_null())
    }

    /// Whether the code directory claims to belong to a platform binary.
    pub fn is_platform_binary(&self) -> bool {
        self.platform != 0
    }

    /// Obtain the effective code limit, preferring the 64-bit field.
    pub fn effective_code_limit(&self) -> u64 {
        match self.code_limit_64 {
            Some(v) if v != 0 => v,
            _ => self.code_limit as u64,
        }
    }

    pub fn to_owned(&self) -> CodeDirectoryBlob<'static> {
        CodeDirectoryBlob {
            version: self.version,
            flags: self.flags,
            code_limit: self.code_limit,
            hash_size: self.hash_size,
            hash_type: self.hash_type,
            platform: self.platform,
            page_size: self.page_size,
            spare2: self.spare2,
            scatter_offset: self.scatter_offset,
            spare3: self.spare3,
            code_limit_64: self.code_limit_64,
            exec_seg_base: self.exec_seg_base,
            exec_seg_limit: self.exec_seg_limit,
            exec_seg_flags: self.exec_seg_flags,
            runtime: self.runtime,
            pre_encrypt_offset: self.pre_encrypt_offset,
            ident: Cow::Owned(self.ident.clone().into_owned()),
            team_name: self
                .team_name
                .as_ref()
                .map(|x| Cow::Owned(x.clone().into_owned())),
            code_hashes: self
                .code_hashes
                .iter()
                .map(|h| h.to_owned())
                .collect::<Vec<_>>(),
            special_hashes: self
                .special_hashes
                .iter()
                .map(|(k, v)| (*k, v.to_owned()))
                .collect::<HashMap<_, _>>(),
            raw: self
                .raw
                .as_ref()
                .map(|raw| Cow::Owned(raw.clone().into_owned())),
        }
    }
}
