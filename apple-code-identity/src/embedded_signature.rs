// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signature superblobs and the blobs they contain.
//!
//! Every container format that carries an Apple code signature stores it as a
//! *superblob*: a header with a magic, a total length and a count, followed by
//! an index of `(slot, offset)` pairs and then the blobs themselves. All
//! integers are big-endian. Offsets are relative to the start of the superblob.
//!
//! Each blob begins with its own `u32` magic and `u32` length (the length
//! includes the 8 byte blob header). The *slot* of an index entry declares the
//! role of the blob (code directory, requirements, entitlements, CMS
//! signature, ...) while the blob magic declares its format.
//!
//! [EmbeddedSignature::from_bytes] performs a strict parse. The declared
//! superblob length must equal the length of the buffer, every slot must be
//! unique and every blob must lie entirely within the buffer. Container
//! formats often pad the region that holds the superblob, so
//! [EmbeddedSignature::from_container_bytes] first trims the region to the
//! declared length.
//!
//! The constants in here are derived from Apple's `cs_blobs.h`.

use {
    crate::{
        code_directory::CodeDirectoryBlob,
        code_requirement::RequirementType,
        error::AppleCodeIdentityError,
    },
    cryptographic_message_syntax::SignedData,
    scroll::{IOwrite, Pread},
    std::{
        borrow::Cow,
        cmp::Ordering,
        collections::{BTreeMap, HashSet},
        io::Write,
    },
};

/// Defines header magic for various payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodeSigningMagic {
    /// Code requirement blob.
    Requirement,
    /// Code requirements blob.
    RequirementSet,
    /// CodeDirectory blob.
    CodeDirectory,
    /// Embedded signature.
    ///
    /// This is the magic of the superblob.
    EmbeddedSignature,
    /// Old embedded signature.
    EmbeddedSignatureOld,
    /// Entitlements blob.
    Entitlements,
    /// DER encoded entitlements blob.
    EntitlementsDer,
    /// Multi-arch collection of embedded signatures.
    DetachedSignature,
    /// Generic blob wrapper.
    ///
    /// The CMS signature is stored in this type.
    BlobWrapper,
    /// Unknown magic.
    Unknown(u32),
}

impl From<u32> for CodeSigningMagic {
    fn from(v: u32) -> Self {
        match v {
            0xfade0c00 => Self::Requirement,
            0xfade0c01 => Self::RequirementSet,
            0xfade0c02 => Self::CodeDirectory,
            0xfade0cc0 => Self::EmbeddedSignature,
            0xfade0b02 => Self::EmbeddedSignatureOld,
            0xfade7171 => Self::Entitlements,
            0xfade7172 => Self::EntitlementsDer,
            0xfade0cc1 => Self::DetachedSignature,
            0xfade0b01 => Self::BlobWrapper,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningMagic> for u32 {
    fn from(magic: CodeSigningMagic) -> u32 {
        match magic {
            CodeSigningMagic::Requirement => 0xfade0c00,
            CodeSigningMagic::RequirementSet => 0xfade0c01,
            CodeSigningMagic::CodeDirectory => 0xfade0c02,
            CodeSigningMagic::EmbeddedSignature => 0xfade0cc0,
            CodeSigningMagic::EmbeddedSignatureOld => 0xfade0b02,
            CodeSigningMagic::Entitlements => 0xfade7171,
            CodeSigningMagic::EntitlementsDer => 0xfade7172,
            CodeSigningMagic::DetachedSignature => 0xfade0cc1,
            CodeSigningMagic::BlobWrapper => 0xfade0b01,
            CodeSigningMagic::Unknown(v) => v,
        }
    }
}

/// A well-known slot within code signing data.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeSigningSlot {
    CodeDirectory,
    Info,
    RequirementSet,
    ResourceDir,
    Application,
    Entitlements,
    RepSpecific,
    EntitlementsDer,
    AlternateCodeDirectory0,
    AlternateCodeDirectory1,
    AlternateCodeDirectory2,
    AlternateCodeDirectory3,
    AlternateCodeDirectory4,
    Signature,
    Identification,
    Ticket,
    Unknown(u32),
}

impl std::fmt::Debug for CodeSigningSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::CodeDirectory => "CodeDirectory",
            Self::Info => "Info",
            Self::RequirementSet => "RequirementSet",
            Self::ResourceDir => "Resources",
            Self::Application => "Application",
            Self::Entitlements => "Entitlements",
            Self::RepSpecific => "Rep Specific",
            Self::EntitlementsDer => "DER Entitlements",
            Self::AlternateCodeDirectory0 => "CodeDirectory Alternate #0",
            Self::AlternateCodeDirectory1 => "CodeDirectory Alternate #1",
            Self::AlternateCodeDirectory2 => "CodeDirectory Alternate #2",
            Self::AlternateCodeDirectory3 => "CodeDirectory Alternate #3",
            Self::AlternateCodeDirectory4 => "CodeDirectory Alternate #4",
            Self::Signature => "CMS Signature",
            Self::Identification => "Identification",
            Self::Ticket => "Ticket",
            Self::Unknown(_) => "Unknown",
        };

        f.write_fmt(format_args!("{} ({})", name, u32::from(*self)))
    }
}

impl From<u32> for CodeSigningSlot {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::CodeDirectory,
            1 => Self::Info,
            2 => Self::RequirementSet,
            3 => Self::ResourceDir,
            4 => Self::Application,
            5 => Self::Entitlements,
            6 => Self::RepSpecific,
            7 => Self::EntitlementsDer,
            0x1000 => Self::AlternateCodeDirectory0,
            0x1001 => Self::AlternateCodeDirectory1,
            0x1002 => Self::AlternateCodeDirectory2,
            0x1003 => Self::AlternateCodeDirectory3,
            0x1004 => Self::AlternateCodeDirectory4,
            0x10000 => Self::Signature,
            0x10001 => Self::Identification,
            0x10002 => Self::Ticket,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningSlot> for u32 {
    fn from(v: CodeSigningSlot) -> Self {
        match v {
            CodeSigningSlot::CodeDirectory => 0,
            CodeSigningSlot::Info => 1,
            CodeSigningSlot::RequirementSet => 2,
            CodeSigningSlot::ResourceDir => 3,
            CodeSigningSlot::Application => 4,
            CodeSigningSlot::Entitlements => 5,
            CodeSigningSlot::RepSpecific => 6,
            CodeSigningSlot::EntitlementsDer => 7,
            CodeSigningSlot::AlternateCodeDirectory0 => 0x1000,
            CodeSigningSlot::AlternateCodeDirectory1 => 0x1001,
            CodeSigningSlot::AlternateCodeDirectory2 => 0x1002,
            CodeSigningSlot::AlternateCodeDirectory3 => 0x1003,
            CodeSigningSlot::AlternateCodeDirectory4 => 0x1004,
            CodeSigningSlot::Signature => 0x10000,
            CodeSigningSlot::Identification => 0x10001,
            CodeSigningSlot::Ticket => 0x10002,
            CodeSigningSlot::Unknown(v) => v,
        }
    }
}

impl PartialOrd for CodeSigningSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CodeSigningSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        u32::from(*self).cmp(&u32::from(*other))
    }
}

impl CodeSigningSlot {
    /// Whether this slot holds a code directory.
    pub fn is_code_directory(&self) -> bool {
        matches!(
            self,
            Self::CodeDirectory
                | Self::AlternateCodeDirectory0
                | Self::AlternateCodeDirectory1
                | Self::AlternateCodeDirectory2
                | Self::AlternateCodeDirectory3
                | Self::AlternateCodeDirectory4
        )
    }
}

#[repr(C)]
#[derive(Clone, Pread)]
struct BlobIndex {
    /// Corresponds to a [CodeSigningSlot] variant.
    typ: u32,
    offset: u32,
}

impl std::fmt::Debug for BlobIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BlobIndex")
            .field("type", &CodeSigningSlot::from(self.typ))
            .field("offset", &self.offset)
            .finish()
    }
}

/// Represents a digest type encountered in code signature data structures.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DigestType {
    None,
    Sha1,
    Sha256,
    Sha256Truncated,
    Sha384,
    Sha512,
    Unknown(u8),
}

impl From<u8> for DigestType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::Sha1,
            2 => Self::Sha256,
            3 => Self::Sha256Truncated,
            4 => Self::Sha384,
            5 => Self::Sha512,
            _ => Self::Unknown(v),
        }
    }
}

impl From<DigestType> for u8 {
    fn from(v: DigestType) -> u8 {
        match v {
            DigestType::None => 0,
            DigestType::Sha1 => 1,
            DigestType::Sha256 => 2,
            DigestType::Sha256Truncated => 3,
            DigestType::Sha384 => 4,
            DigestType::Sha512 => 5,
            DigestType::Unknown(v) => v,
        }
    }
}

impl DigestType {
    /// Obtain the size of hashes for this hash type.
    pub fn hash_len(&self) -> Result<usize, AppleCodeIdentityError> {
        Ok(self.digest_data(&[])?.len())
    }

    /// Obtain a hasher for this digest type.
    pub fn as_hasher(&self) -> Result<ring::digest::Context, AppleCodeIdentityError> {
        match self {
            Self::None => Err(AppleCodeIdentityError::DigestUnknownAlgorithm),
            Self::Sha1 => Ok(ring::digest::Context::new(
                &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
            )),
            Self::Sha256 | Self::Sha256Truncated => {
                Ok(ring::digest::Context::new(&ring::digest::SHA256))
            }
            Self::Sha384 => Ok(ring::digest::Context::new(&ring::digest::SHA384)),
            Self::Sha512 => Ok(ring::digest::Context::new(&ring::digest::SHA512)),
            Self::Unknown(_) => Err(AppleCodeIdentityError::DigestUnknownAlgorithm),
        }
    }

    /// Digest data given the configured hasher.
    pub fn digest_data(&self, data: &[u8]) -> Result<Vec<u8>, AppleCodeIdentityError> {
        let mut hasher = self.as_hasher()?;

        hasher.update(data);
        let mut hash = hasher.finish().as_ref().to_vec();

        if matches!(self, Self::Sha256Truncated) {
            hash.truncate(20);
        }

        Ok(hash)
    }

    /// Relative strength used to pick among alternate code directories.
    ///
    /// Unsupported types rank lowest.
    pub fn strength(&self) -> u8 {
        match self {
            Self::Sha1 => 1,
            Self::Sha256Truncated => 2,
            Self::Sha256 => 3,
            Self::Sha384 => 4,
            Self::Sha512 => 5,
            Self::None | Self::Unknown(_) => 0,
        }
    }
}

pub struct Digest<'a> {
    pub data: Cow<'a, [u8]>,
}

impl<'a> Digest<'a> {
    /// Whether this is the null hash (all 0s).
    pub fn is_null(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn to_owned(&self) -> Digest<'static> {
        Digest {
            data: Cow::Owned(self.data.clone().into_owned()),
        }
    }
}

impl<'a> std::fmt::Debug for Digest<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.data))
    }
}

impl<'a> From<Vec<u8>> for Digest<'a> {
    fn from(v: Vec<u8>) -> Self {
        Self { data: v.into() }
    }
}

/// Read the header from a Blob.
///
/// Blobs begin with a u32 magic and u32 length, inclusive.
pub(crate) fn read_blob_header(data: &[u8]) -> Result<(u32, usize, &[u8]), scroll::Error> {
    let magic = data.pread_with(0, scroll::BE)?;
    let length = data.pread_with::<u32>(4, scroll::BE)?;

    Ok((magic, length as usize, &data[8..]))
}

/// Read a blob header and verify its magic and declared length.
///
/// Returns the payload following the header, bounded by the declared length.
pub(crate) fn read_and_validate_blob_header<'a>(
    data: &'a [u8],
    expected_magic: u32,
    what: &'static str,
) -> Result<&'a [u8], AppleCodeIdentityError> {
    let (magic, length, _) = read_blob_header(data)?;

    if magic != expected_magic {
        return Err(AppleCodeIdentityError::BadMagic(what));
    }

    if length < 8 || length > data.len() {
        return Err(AppleCodeIdentityError::BlobMalformed(what));
    }

    Ok(&data[8..length])
}

/// Create the binary content for a SuperBlob.
///
/// Blobs are written in iteration order.
pub fn create_superblob<'a>(
    magic: CodeSigningMagic,
    blobs: impl Iterator<Item = &'a (CodeSigningSlot, Vec<u8>)>,
) -> Result<Vec<u8>, AppleCodeIdentityError> {
    // Makes offset calculation easier.
    let blobs = blobs.collect::<Vec<_>>();

    let mut cursor = std::io::Cursor::new(Vec::<u8>::new());

    let mut blob_data = Vec::new();
    // magic + total length + blob count.
    let mut total_length: u32 = 4 + 4 + 4;
    // 8 bytes for each blob index.
    total_length += 8 * blobs.len() as u32;

    let mut indices = Vec::with_capacity(blobs.len());

    for (slot, blob) in blobs {
        blob_data.push(blob);

        indices.push(BlobIndex {
            typ: u32::from(*slot),
            offset: total_length,
        });

        total_length += blob.len() as u32;
    }

    cursor.iowrite_with(u32::from(magic), scroll::BE)?;
    cursor.iowrite_with(total_length, scroll::BE)?;
    cursor.iowrite_with(indices.len() as u32, scroll::BE)?;
    for index in indices {
        cursor.iowrite_with(index.typ, scroll::BE)?;
        cursor.iowrite_with(index.offset, scroll::BE)?;
    }
    for data in blob_data {
        cursor.write_all(data)?;
    }

    Ok(cursor.into_inner())
}

/// Represents a single blob as defined by a SuperBlob index entry.
///
/// The blob data is unparsed in this type. [BlobData::from_blob_bytes]
/// parses it.
#[derive(Clone)]
pub struct BlobEntry<'a> {
    /// Our blob index within the `SuperBlob`.
    pub index: usize,

    /// The slot type.
    pub slot: CodeSigningSlot,

    /// Our start offset within the `SuperBlob`.
    ///
    /// First byte is start of our magic.
    pub offset: usize,

    /// The magic value appearing at the beginning of the blob.
    pub magic: CodeSigningMagic,

    /// The length of the blob, including its header.
    pub length: usize,

    /// The raw data in this blob, including magic and length.
    pub data: &'a [u8],
}

impl<'a> std::fmt::Debug for BlobEntry<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BlobEntry")
            .field("index", &self.index)
            .field("slot", &self.slot)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("magic", &self.magic)
            .finish()
    }
}

impl<'a> BlobEntry<'a> {
    /// Obtain the payload of this blob.
    ///
    /// This is the data in the blob without the blob header.
    pub fn payload(&self) -> Result<&'a [u8], AppleCodeIdentityError> {
        Ok(read_blob_header(self.data)?.2)
    }
}

/// Provides common features for a parsed blob type.
pub trait Blob<'a>
where
    Self: Sized,
{
    /// The header magic that identifies this format.
    fn magic() -> u32;

    /// Attempt to construct an instance by parsing a bytes slice.
    ///
    /// The slice begins with the 8 byte blob header denoting the magic
    /// and length.
    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, AppleCodeIdentityError>;

    /// Serialize the payload of this blob to bytes.
    ///
    /// Does not include the magic or length header fields common to blobs.
    fn serialize_payload(&self) -> Result<Vec<u8>, AppleCodeIdentityError>;

    /// Serialize this blob to bytes.
    ///
    /// This is [Blob::serialize_payload] with the blob magic and length
    /// prepended.
    fn to_blob_bytes(&self) -> Result<Vec<u8>, AppleCodeIdentityError> {
        let mut res = Vec::new();
        res.iowrite_with(Self::magic(), scroll::BE)?;

        let payload = self.serialize_payload()?;
        // Length includes our own header.
        res.iowrite_with(payload.len() as u32 + 8, scroll::BE)?;

        res.extend(payload);

        Ok(res)
    }
}

/// Represents a Requirement blob.
///
/// `csreq -b` will emit instances of this blob, header magic and all.
pub struct RequirementBlob<'a> {
    pub data: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for RequirementBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::Requirement)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, AppleCodeIdentityError> {
        let data = read_and_validate_blob_header(data, Self::magic(), "requirement blob")?;

        Ok(Self { data: data.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, AppleCodeIdentityError> {
        Ok(self.data.to_vec())
    }
}

impl<'a> std::fmt::Debug for RequirementBlob<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("RequirementBlob({})", hex::encode(&self.data)))
    }
}

/// Represents a Requirement set blob.
///
/// A Requirement set blob contains nested Requirement blobs.
#[derive(Debug, Default)]
pub struct RequirementSetBlob<'a> {
    pub requirements: BTreeMap<RequirementType, RequirementBlob<'a>>,
}

impl<'a> Blob<'a> for RequirementSetBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::RequirementSet)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, AppleCodeIdentityError> {
        let payload = read_and_validate_blob_header(data, Self::magic(), "requirement set blob")?;
        let data = &data[0..payload.len() + 8];

        // There are other blobs nested within. A u32 denotes how many there are.
        // Then there is an array of N (u32, u32) denoting the type and
        // offset of each.
        let offset = &mut 8;
        let count = data.gread_with::<u32>(offset, scroll::BE)?;

        if count as usize > data.len() / 8 {
            return Err(AppleCodeIdentityError::BlobMalformed(
                "requirement set blob",
            ));
        }

        let mut indices = Vec::with_capacity(count as usize);
        for _ in 0..count {
            indices.push((
                data.gread_with::<u32>(offset, scroll::BE)?,
                data.gread_with::<u32>(offset, scroll::BE)?,
            ));
        }

        let mut requirements = BTreeMap::new();

        for (flavor, offset) in indices {
            let typ = RequirementType::from(flavor);

            let requirement_data = data
                .get(offset as usize..)
                .ok_or(AppleCodeIdentityError::BlobMalformed(
                    "requirement set blob",
                ))?;

            requirements.insert(typ, RequirementBlob::from_blob_bytes(requirement_data)?);
        }

        Ok(Self { requirements })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, AppleCodeIdentityError> {
        let mut res = Vec::new();

        // The index contains blob relative offsets. To know what the start offset will
        // be, we calculate the total index size.
        let data_start_offset = 8 + 4 + (8 * self.requirements.len() as u32);
        let mut written_requirements_data = 0;

        res.iowrite_with(self.requirements.len() as u32, scroll::BE)?;

        for (typ, requirement) in &self.requirements {
            res.iowrite_with(u32::from(*typ), scroll::BE)?;
            res.iowrite_with(data_start_offset + written_requirements_data, scroll::BE)?;
            written_requirements_data += requirement.to_blob_bytes()?.len() as u32;
        }

        for requirement in self.requirements.values() {
            res.write_all(&requirement.to_blob_bytes()?)?;
        }

        Ok(res)
    }
}

impl<'a> RequirementSetBlob<'a> {
    /// Set the requirements for a given [RequirementType].
    pub fn set_requirements(&mut self, slot: RequirementType, blob: RequirementBlob<'a>) {
        self.requirements.insert(slot, blob);
    }

    /// Obtain the requirement of a given [RequirementType], if present.
    pub fn requirement(&self, typ: RequirementType) -> Option<&RequirementBlob<'a>> {
        self.requirements.get(&typ)
    }
}

/// Represents an Entitlements blob.
///
/// An entitlements blob contains an XML plist with a dict.
#[derive(Debug)]
pub struct EntitlementsBlob<'a> {
    plist: Cow<'a, str>,
}

impl<'a> Blob<'a> for EntitlementsBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::Entitlements)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, AppleCodeIdentityError> {
        let data = read_and_validate_blob_header(data, Self::magic(), "entitlements blob")?;
        let s = std::str::from_utf8(data).map_err(AppleCodeIdentityError::EntitlementsBadUtf8)?;

        Ok(Self { plist: s.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, AppleCodeIdentityError> {
        Ok(self.plist.as_bytes().to_vec())
    }
}

impl<'a> EntitlementsBlob<'a> {
    /// Construct an instance using any string as the payload.
    pub fn from_string(s: &(impl ToString + ?Sized)) -> Self {
        Self {
            plist: s.to_string().into(),
        }
    }

    /// Parse the plist into a dictionary.
    pub fn dictionary(&self) -> Result<plist::Dictionary, AppleCodeIdentityError> {
        match plist::Value::from_reader_xml(self.plist.as_bytes())? {
            plist::Value::Dictionary(d) => Ok(d),
            _ => Err(AppleCodeIdentityError::BlobMalformed(
                "entitlements plist is not a dictionary",
            )),
        }
    }
}

/// Represents a generic blob wrapper.
pub struct BlobWrapperBlob<'a> {
    data: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for BlobWrapperBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::BlobWrapper)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, AppleCodeIdentityError> {
        Ok(Self {
            data: read_and_validate_blob_header(data, Self::magic(), "blob wrapper blob")?.into(),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, AppleCodeIdentityError> {
        Ok(self.data.to_vec())
    }
}

impl<'a> std::fmt::Debug for BlobWrapperBlob<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", hex::encode(&self.data)))
    }
}

impl BlobWrapperBlob<'static> {
    /// Construct an instance with payload data.
    pub fn from_data_owned(data: Vec<u8>) -> BlobWrapperBlob<'static> {
        Self { data: data.into() }
    }
}

/// Represents an unknown blob type.
pub struct OtherBlob<'a> {
    pub magic: u32,
    pub data: &'a [u8],
}

impl<'a> Blob<'a> for OtherBlob<'a> {
    fn magic() -> u32 {
        // Use a placeholder magic value because there is no self bind here.
        u32::MAX
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, AppleCodeIdentityError> {
        let (magic, _, data) = read_blob_header(data)?;

        Ok(Self { magic, data })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, AppleCodeIdentityError> {
        Ok(self.data.to_vec())
    }

    // We need to implement this for custom magic serialization.
    fn to_blob_bytes(&self) -> Result<Vec<u8>, AppleCodeIdentityError> {
        let mut res = Vec::with_capacity(self.data.len() + 8);
        res.iowrite_with(self.magic, scroll::BE)?;
        res.iowrite_with(self.data.len() as u32 + 8, scroll::BE)?;
        res.write_all(self.data)?;

        Ok(res)
    }
}

impl<'a> std::fmt::Debug for OtherBlob<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", hex::encode(self.data)))
    }
}

/// Represents a single, parsed Blob entry/slot.
///
/// Each variant corresponds to a [CodeSigningMagic] blob type.
#[derive(Debug)]
pub enum BlobData<'a> {
    Requirement(Box<RequirementBlob<'a>>),
    RequirementSet(Box<RequirementSetBlob<'a>>),
    CodeDirectory(Box<CodeDirectoryBlob<'a>>),
    Entitlements(Box<EntitlementsBlob<'a>>),
    BlobWrapper(Box<BlobWrapperBlob<'a>>),
    Other(Box<OtherBlob<'a>>),
}

impl<'a> Blob<'a> for BlobData<'a> {
    fn magic() -> u32 {
        u32::MAX
    }

    /// Parse blob data by reading its magic and feeding into magic-specific parser.
    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, AppleCodeIdentityError> {
        let (magic, length, _) = read_blob_header(data)?;

        let data = data
            .get(0..length)
            .ok_or(AppleCodeIdentityError::SuperblobMalformed)?;

        Ok(match CodeSigningMagic::from(magic) {
            CodeSigningMagic::Requirement => {
                Self::Requirement(Box::new(RequirementBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::RequirementSet => {
                Self::RequirementSet(Box::new(RequirementSetBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::CodeDirectory => {
                Self::CodeDirectory(Box::new(CodeDirectoryBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::Entitlements => {
                Self::Entitlements(Box::new(EntitlementsBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::BlobWrapper => {
                Self::BlobWrapper(Box::new(BlobWrapperBlob::from_blob_bytes(data)?))
            }
            _ => Self::Other(Box::new(OtherBlob::from_blob_bytes(data)?)),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, AppleCodeIdentityError> {
        match self {
            Self::Requirement(b) => b.serialize_payload(),
            Self::RequirementSet(b) => b.serialize_payload(),
            Self::CodeDirectory(b) => b.serialize_payload(),
            Self::Entitlements(b) => b.serialize_payload(),
            Self::BlobWrapper(b) => b.serialize_payload(),
            Self::Other(b) => b.serialize_payload(),
        }
    }

    fn to_blob_bytes(&self) -> Result<Vec<u8>, AppleCodeIdentityError> {
        match self {
            Self::Requirement(b) => b.to_blob_bytes(),
            Self::RequirementSet(b) => b.to_blob_bytes(),
            Self::CodeDirectory(b) => b.to_blob_bytes(),
            Self::Entitlements(b) => b.to_blob_bytes(),
            Self::BlobWrapper(b) => b.to_blob_bytes(),
            Self::Other(b) => b.to_blob_bytes(),
        }
    }
}

impl<'a> From<RequirementSetBlob<'a>> for BlobData<'a> {
    fn from(b: RequirementSetBlob<'a>) -> Self {
        Self::RequirementSet(Box::new(b))
    }
}

impl<'a> From<EntitlementsBlob<'a>> for BlobData<'a> {
    fn from(b: EntitlementsBlob<'a>) -> Self {
        Self::Entitlements(Box::new(b))
    }
}

/// A strictly validated signature superblob.
pub struct EmbeddedSignature<'a> {
    /// Magic value from header.
    pub magic: CodeSigningMagic,
    /// Length of this super blob.
    pub length: u32,
    /// Number of blobs in this super blob.
    pub count: u32,

    /// Raw data backing this super blob.
    pub data: &'a [u8],

    /// All the blobs within this super blob, in index order.
    pub blobs: Vec<BlobEntry<'a>>,
}

impl<'a> std::fmt::Debug for EmbeddedSignature<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SuperBlob")
            .field("magic", &self.magic)
            .field("length", &self.length)
            .field("count", &self.count)
            .field("blobs", &self.blobs)
            .finish()
    }
}

impl<'a> EmbeddedSignature<'a> {
    /// Strictly parse a superblob occupying all of `data`.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, AppleCodeIdentityError> {
        let offset = &mut 0;

        let magic = data.gread_with::<u32>(offset, scroll::BE)?.into();

        if magic != CodeSigningMagic::EmbeddedSignature {
            return Err(AppleCodeIdentityError::BadMagic(
                "embedded signature super blob",
            ));
        }

        let length = data.gread_with::<u32>(offset, scroll::BE)?;
        let count = data.gread_with::<u32>(offset, scroll::BE)?;

        if length as usize != data.len() {
            return Err(AppleCodeIdentityError::SuperblobLengthMismatch {
                declared: length as usize,
                actual: data.len(),
            });
        }

        let header_end = 12usize + 8 * count as usize;
        if header_end > data.len() {
            return Err(AppleCodeIdentityError::SuperblobMalformed);
        }

        let mut blob_indices = Vec::with_capacity(count as usize);
        for _ in 0..count {
            blob_indices.push(data.gread_with::<BlobIndex>(offset, scroll::BE)?);
        }

        let mut seen = HashSet::with_capacity(blob_indices.len());
        let mut blobs = Vec::with_capacity(blob_indices.len());

        for (i, index) in blob_indices.iter().enumerate() {
            if !seen.insert(index.typ) {
                return Err(AppleCodeIdentityError::SuperblobDuplicateSlot(index.typ));
            }

            let start = index.offset as usize;
            if start < header_end || start + 8 > data.len() {
                return Err(AppleCodeIdentityError::SuperblobSlotOutOfBounds(index.typ));
            }

            let (magic, blob_length, _) = read_blob_header(&data[start..])?;

            if blob_length < 8 || start + blob_length > data.len() {
                return Err(AppleCodeIdentityError::SuperblobSlotOutOfBounds(index.typ));
            }

            blobs.push(BlobEntry {
                index: i,
                slot: index.typ.into(),
                offset: start,
                magic: magic.into(),
                length: blob_length,
                data: &data[start..start + blob_length],
            });
        }

        Ok(Self {
            magic,
            length,
            count,
            data,
            blobs,
        })
    }

    /// Parse a superblob at the start of a possibly padded container region.
    ///
    /// The region is trimmed to the length declared in the superblob header
    /// before the strict parse. A declared length exceeding the region is an
    /// error.
    pub fn from_container_bytes(data: &'a [u8]) -> Result<Self, AppleCodeIdentityError> {
        let (_, length, _) = read_blob_header(data)?;

        if length > data.len() {
            return Err(AppleCodeIdentityError::SuperblobLengthMismatch {
                declared: length,
                actual: data.len(),
            });
        }

        Self::from_bytes(&data[0..length])
    }

    /// Find the blob occupying the specified slot.
    pub fn find_slot(&self, slot: CodeSigningSlot) -> Option<&BlobEntry<'a>> {
        self.blobs.iter().find(|e| e.slot == slot)
    }

    /// Obtain the raw bytes (blob header included) of a slot.
    pub fn component(&self, slot: CodeSigningSlot) -> Option<&'a [u8]> {
        self.find_slot(slot).map(|entry| entry.data)
    }

    /// Parse the blob occupying a slot according to its magic.
    pub fn slot_blob(
        &self,
        slot: CodeSigningSlot,
    ) -> Result<Option<BlobData<'a>>, AppleCodeIdentityError> {
        self.find_slot(slot)
            .map(|entry| BlobData::from_blob_bytes(entry.data))
            .transpose()
    }

    /// Attempt to resolve the primary `CodeDirectoryBlob`.
    ///
    /// Returns `Ok(None)` if there is no code directory slot.
    pub fn code_directory(
        &self,
    ) -> Result<Option<Box<CodeDirectoryBlob<'a>>>, AppleCodeIdentityError> {
        self.code_directory_in(CodeSigningSlot::CodeDirectory)
    }

    fn code_directory_in(
        &self,
        slot: CodeSigningSlot,
    ) -> Result<Option<Box<CodeDirectoryBlob<'a>>>, AppleCodeIdentityError> {
        match self.slot_blob(slot)? {
            Some(BlobData::CodeDirectory(cd)) => Ok(Some(cd)),
            Some(_) => Err(AppleCodeIdentityError::BadMagic("code directory blob")),
            None => Ok(None),
        }
    }

    /// Obtain every code directory, primary first and then alternates.
    pub fn code_directories(
        &self,
    ) -> Result<Vec<(CodeSigningSlot, Box<CodeDirectoryBlob<'a>>)>, AppleCodeIdentityError> {
        let mut res = vec![];

        for entry in self.blobs.iter().filter(|e| e.slot.is_code_directory()) {
            if let Some(cd) = self.code_directory_in(entry.slot)? {
                res.push((entry.slot, cd));
            }
        }

        res.sort_by_key(|(slot, _)| *slot);

        Ok(res)
    }

    /// Obtain the code directory using the strongest supported digest.
    ///
    /// Ties go to the lowest slot.
    pub fn preferred_code_directory(
        &self,
    ) -> Result<Option<Box<CodeDirectoryBlob<'a>>>, AppleCodeIdentityError> {
        let mut best: Option<Box<CodeDirectoryBlob<'a>>> = None;

        for (_, cd) in self.code_directories()? {
            let better = match &best {
                Some(current) => cd.hash_type.strength() > current.hash_type.strength(),
                None => true,
            };

            if better {
                best = Some(cd);
            }
        }

        Ok(best)
    }

    /// Attempt to resolve a parsed [EntitlementsBlob] for this signature data.
    ///
    /// Returns `Ok(None)` if there is no entitlements slot.
    pub fn entitlements(
        &self,
    ) -> Result<Option<Box<EntitlementsBlob<'a>>>, AppleCodeIdentityError> {
        match self.slot_blob(CodeSigningSlot::Entitlements)? {
            Some(BlobData::Entitlements(entitlements)) => Ok(Some(entitlements)),
            Some(_) => Err(AppleCodeIdentityError::BadMagic("entitlements blob")),
            None => Ok(None),
        }
    }

    /// Attempt to resolve a parsed [RequirementSetBlob] for this signature data.
    ///
    /// Returns `Ok(None)` if there is no requirements slot.
    pub fn code_requirements(
        &self,
    ) -> Result<Option<Box<RequirementSetBlob<'a>>>, AppleCodeIdentityError> {
        match self.slot_blob(CodeSigningSlot::RequirementSet)? {
            Some(BlobData::RequirementSet(reqs)) => Ok(Some(reqs)),
            Some(_) => Err(AppleCodeIdentityError::BadMagic("requirements blob")),
            None => Ok(None),
        }
    }

    /// Attempt to resolve raw CMS signature data.
    ///
    /// The returned data is likely DER PKCS#7 with the root object
    /// pkcs7-signedData (1.2.840.113549.1.7.2).
    pub fn signature_data(&self) -> Result<Option<&'a [u8]>, AppleCodeIdentityError> {
        match self.find_slot(CodeSigningSlot::Signature) {
            Some(entry) => {
                BlobWrapperBlob::from_blob_bytes(entry.data)?;

                Ok(Some(entry.payload()?))
            }
            None => Ok(None),
        }
    }

    /// Obtain the parsed CMS [SignedData].
    pub fn signed_data(&self) -> Result<Option<SignedData>, AppleCodeIdentityError> {
        if let Some(data) = self.signature_data()? {
            // Ad-hoc signatures carry an empty wrapper.
            if data.is_empty() {
                Ok(None)
            } else {
                let signed_data = SignedData::parse_ber(data)?;

                Ok(Some(signed_data))
            }
        } else {
            Ok(None)
        }
    }

    /// Obtain the raw payload of a stapled notarization ticket, if present.
    pub fn ticket_data(&self) -> Result<Option<&'a [u8]>, AppleCodeIdentityError> {
        match self.find_slot(CodeSigningSlot::Ticket) {
            Some(entry) => Ok(Some(entry.payload()?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(magic: u32, payload: &[u8]) -> Vec<u8> {
        let mut res = Vec::new();
        res.extend_from_slice(&magic.to_be_bytes());
        res.extend_from_slice(&(payload.len() as u32 + 8).to_be_bytes());
        res.extend_from_slice(payload);
        res
    }

    #[test]
    fn superblob_roundtrip() -> Result<(), AppleCodeIdentityError> {
        let entries = vec![
            (
                CodeSigningSlot::RequirementSet,
                blob(0xfade0c01, &[0, 0, 0, 0]),
            ),
            (CodeSigningSlot::Entitlements, blob(0xfade7171, b"<dict/>")),
            (CodeSigningSlot::Unknown(42), blob(0x12345678, b"opaque")),
        ];

        let data = create_superblob(CodeSigningMagic::EmbeddedSignature, entries.iter())?;
        let sig = EmbeddedSignature::from_bytes(&data)?;

        assert_eq!(sig.count, 3);
        assert_eq!(sig.length as usize, data.len());

        for (slot, bytes) in &entries {
            assert_eq!(sig.component(*slot), Some(bytes.as_slice()));
        }
        assert!(sig.component(CodeSigningSlot::CodeDirectory).is_none());

        let reserialized = create_superblob(
            CodeSigningMagic::EmbeddedSignature,
            sig.blobs
                .iter()
                .map(|b| (b.slot, b.data.to_vec()))
                .collect::<Vec<_>>()
                .iter(),
        )?;
        assert_eq!(reserialized, data);

        Ok(())
    }

    #[test]
    fn length_mismatch_rejected() -> Result<(), AppleCodeIdentityError> {
        let entries = vec![(CodeSigningSlot::Entitlements, blob(0xfade7171, b"x"))];
        let mut data = create_superblob(CodeSigningMagic::EmbeddedSignature, entries.iter())?;
        data.push(0);

        assert!(matches!(
            EmbeddedSignature::from_bytes(&data),
            Err(AppleCodeIdentityError::SuperblobLengthMismatch { .. })
        ));

        // The padded container form tolerates trailing bytes.
        let sig = EmbeddedSignature::from_container_bytes(&data)?;
        assert_eq!(sig.count, 1);

        Ok(())
    }

    #[test]
    fn duplicate_slot_rejected() -> Result<(), AppleCodeIdentityError> {
        let entries = vec![
            (CodeSigningSlot::Entitlements, blob(0xfade7171, b"a")),
            (CodeSigningSlot::Entitlements, blob(0xfade7171, b"b")),
        ];
        let data = create_superblob(CodeSigningMagic::EmbeddedSignature, entries.iter())?;

        let err = EmbeddedSignature::from_bytes(&data).unwrap_err();
        assert!(matches!(
            err,
            AppleCodeIdentityError::SuperblobDuplicateSlot(5)
        ));
        assert!(err.is_format_error());

        Ok(())
    }

    #[test]
    fn out_of_bounds_blob_rejected() -> Result<(), AppleCodeIdentityError> {
        let entries = vec![(CodeSigningSlot::Entitlements, blob(0xfade7171, b"abcd"))];
        let mut data = create_superblob(CodeSigningMagic::EmbeddedSignature, entries.iter())?;

        // Inflate the blob's self-declared length beyond the superblob.
        let blob_start = 12 + 8;
        data[blob_start + 4..blob_start + 8].copy_from_slice(&100u32.to_be_bytes());

        assert!(matches!(
            EmbeddedSignature::from_bytes(&data),
            Err(AppleCodeIdentityError::SuperblobSlotOutOfBounds(5))
        ));

        Ok(())
    }

    #[test]
    fn bad_magic_rejected() {
        let data = blob(0xfade0c02, &[0; 4]);

        assert!(matches!(
            EmbeddedSignature::from_bytes(&data),
            Err(AppleCodeIdentityError::BadMagic(_))
        ));
    }

    #[test]
    fn digest_strength_ordering() {
        assert!(DigestType::Sha256.strength() > DigestType::Sha1.strength());
        assert!(DigestType::Sha384.strength() > DigestType::Sha256.strength());
        assert_eq!(DigestType::Unknown(9).strength(), 0);
        assert_eq!(DigestType::Sha256Truncated.hash_len().unwrap(), 20);
    }
}
