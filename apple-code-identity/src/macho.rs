// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Mach-O disk representation.

The signature superblob of a Mach-O binary is located by the
`LC_CODE_SIGNATURE` load command, whose `dataoff` and `datasize` fields
describe a region of the binary (normally at the end of `__LINKEDIT`). The
region may be padded after the superblob.

Universal binaries contain multiple architecture slices, each signed
independently. A [MachOFile] represents exactly one slice.
*/

use {
    crate::{
        disk_rep::{validate_signature_region, DiskRepresentation},
        embedded_signature::{CodeSigningSlot, DigestType},
        error::AppleCodeIdentityError,
    },
    goblin::mach::{
        constants::SEG_TEXT,
        cputype::{get_arch_name_from_types, CpuSubType, CpuType},
        load_command::CommandVariant,
        Mach, MachO,
    },
    log::{debug, warn},
    std::{
        io::Cursor,
        path::{Path, PathBuf},
    },
};

/// Size of the leading Mach-O header fields included in identification.
const IDENTIFICATION_HEADER_SIZE: usize = 28;

/// How to pick an architecture slice out of a universal binary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SliceSelector {
    /// The first slice.
    First,
    /// The slice for a CPU type.
    CpuType(CpuType),
    /// The slice starting at a file offset.
    Offset(u64),
}

impl From<Option<CpuType>> for SliceSelector {
    fn from(cpu_type: Option<CpuType>) -> Self {
        match cpu_type {
            Some(cpu_type) => Self::CpuType(cpu_type),
            None => Self::First,
        }
    }
}

struct Slice {
    offset: u64,
    cpu_type: CpuType,
    cpu_subtype: CpuSubType,
    data: Vec<u8>,
}

fn architecture_not_found(selector: SliceSelector) -> AppleCodeIdentityError {
    AppleCodeIdentityError::MachOArchitectureNotFound(match selector {
        SliceSelector::First => "any architecture".to_string(),
        SliceSelector::CpuType(cpu_type) => format!("CPU type {}", cpu_type),
        SliceSelector::Offset(offset) => format!("offset {}", offset),
    })
}

/// Resolve the selected slice of Mach-O data and whether the data is universal.
fn select_slice(
    data: &[u8],
    selector: SliceSelector,
) -> Result<(Slice, bool), AppleCodeIdentityError> {
    match Mach::parse(data)? {
        Mach::Binary(macho) => {
            let matches = match selector {
                SliceSelector::First => true,
                SliceSelector::CpuType(cpu_type) => macho.header.cputype == cpu_type,
                SliceSelector::Offset(offset) => offset == 0,
            };

            if !matches {
                return Err(architecture_not_found(selector));
            }

            Ok((
                Slice {
                    offset: 0,
                    cpu_type: macho.header.cputype,
                    cpu_subtype: macho.header.cpusubtype,
                    data: data.to_vec(),
                },
                false,
            ))
        }
        Mach::Fat(multi) => {
            let arches = multi.iter_arches().collect::<Result<Vec<_>, _>>()?;

            let arch = match selector {
                SliceSelector::First => arches.first(),
                SliceSelector::CpuType(cpu_type) => {
                    arches.iter().find(|arch| arch.cputype == cpu_type)
                }
                SliceSelector::Offset(offset) => {
                    arches.iter().find(|arch| arch.offset as u64 == offset)
                }
            }
            .ok_or_else(|| architecture_not_found(selector))?;

            let start = arch.offset as usize;
            let end = start + arch.size as usize;
            if end > data.len() {
                return Err(goblin::error::Error::Malformed(format!(
                    "architecture slice {}..{} exceeds file length {}",
                    start,
                    end,
                    data.len()
                ))
                .into());
            }

            Ok((
                Slice {
                    offset: arch.offset as u64,
                    cpu_type: arch.cputype,
                    cpu_subtype: arch.cpusubtype,
                    data: data[start..end].to_vec(),
                },
                true,
            ))
        }
    }
}

/// Locate and validate the superblob within a single Mach-O slice.
fn find_signature(
    macho: &MachO,
    data: &[u8],
) -> Result<Option<(u64, Vec<u8>)>, AppleCodeIdentityError> {
    let command = macho.load_commands.iter().find_map(|lc| {
        if let CommandVariant::CodeSignature(command) = lc.command {
            Some(command)
        } else {
            None
        }
    });

    let command = match command {
        Some(command) => command,
        None => return Ok(None),
    };

    let start = command.dataoff as usize;
    let end = start + command.datasize as usize;

    if end > data.len() {
        return Err(AppleCodeIdentityError::SignatureInvalid(format!(
            "LC_CODE_SIGNATURE region {}..{} extends past end of binary ({} bytes)",
            start,
            end,
            data.len()
        )));
    }

    let signature = validate_signature_region(data[start..end].to_vec())?;

    Ok(Some((command.dataoff as u64, signature)))
}

/// The end of signable content in a slice lacking a signature.
fn unsigned_code_limit(macho: &MachO, data: &[u8]) -> u64 {
    macho
        .segments
        .iter()
        .map(|segment| segment.fileoff + segment.filesize)
        .max()
        .unwrap_or(data.len() as u64)
}

/// A single architecture of a Mach-O binary on disk.
#[derive(Debug)]
pub struct MachOFile {
    path: PathBuf,
    selector: SliceSelector,
    universal: bool,
    offset: u64,
    cpu_type: CpuType,
    cpu_subtype: CpuSubType,
    data: Vec<u8>,
    signing_limit: u64,
    signature: Option<Vec<u8>>,
}

impl MachOFile {
    /// Open a Mach-O file, optionally preferring an architecture.
    pub fn open(
        path: impl AsRef<Path>,
        cpu_type: Option<CpuType>,
    ) -> Result<Self, AppleCodeIdentityError> {
        Self::open_slice(path, cpu_type.into())
    }

    /// Open the slice of a universal binary starting at a file offset.
    pub fn open_at_offset(
        path: impl AsRef<Path>,
        offset: u64,
    ) -> Result<Self, AppleCodeIdentityError> {
        Self::open_slice(path, SliceSelector::Offset(offset))
    }

    /// Open the slice chosen by a [SliceSelector].
    pub fn open_slice(
        path: impl AsRef<Path>,
        selector: SliceSelector,
    ) -> Result<Self, AppleCodeIdentityError> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;

        let (slice, universal) = select_slice(&data, selector)?;
        let macho = MachO::parse(&slice.data, 0)?;

        let (signing_limit, signature) = match find_signature(&macho, &slice.data)? {
            Some((dataoff, signature)) => (dataoff, Some(signature)),
            None => (unsigned_code_limit(&macho, &slice.data), None),
        };

        debug!(
            "{}: using Mach-O slice at offset {} (CPU type {}); signed: {}",
            path.display(),
            slice.offset,
            slice.cpu_type,
            signature.is_some()
        );

        Ok(Self {
            path: path.to_path_buf(),
            selector,
            universal,
            offset: slice.offset,
            cpu_type: slice.cpu_type,
            cpu_subtype: slice.cpu_subtype,
            data: slice.data,
            signing_limit,
            signature,
        })
    }

    /// CPU type of the selected slice.
    pub fn cpu_type(&self) -> CpuType {
        self.cpu_type
    }

    /// Whether the file is a universal binary.
    pub fn is_universal(&self) -> bool {
        self.universal
    }

    fn parse(&self) -> Result<MachO<'_>, AppleCodeIdentityError> {
        Ok(MachO::parse(&self.data, 0)?)
    }

    /// Raw content of the `__TEXT,__info_plist` section.
    pub fn info_plist_data(&self) -> Result<Option<Vec<u8>>, AppleCodeIdentityError> {
        let macho = self.parse()?;

        for segment in &macho.segments {
            if !matches!(segment.name(), Ok(SEG_TEXT)) {
                continue;
            }

            for (section, data) in segment.sections()? {
                if matches!(section.name(), Ok("__info_plist")) {
                    return Ok(Some(data.to_vec()));
                }
            }
        }

        Ok(None)
    }
}

impl DiskRepresentation for MachOFile {
    fn format(&self) -> String {
        let arch = get_arch_name_from_types(self.cpu_type, self.cpu_subtype)
            .map(|name| name.to_string())
            .unwrap_or_else(|| format!("CPU type {}", self.cpu_type));

        if self.universal {
            format!("Mach-O universal ({})", arch)
        } else {
            format!("Mach-O thin ({})", arch)
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn signature_data(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    fn signing_base(&self) -> u64 {
        self.offset
    }

    fn signing_limit(&self) -> u64 {
        self.signing_limit
    }

    /// Identify the binary by its `LC_UUID`.
    ///
    /// Binaries without a UUID are identified by the SHA-1 of their header
    /// and load commands.
    fn identification(&self) -> Result<Vec<u8>, AppleCodeIdentityError> {
        let macho = self.parse()?;

        for lc in &macho.load_commands {
            if let CommandVariant::Uuid(command) = lc.command {
                if command.cmdsize != 24 {
                    return Err(AppleCodeIdentityError::SignatureInvalid(format!(
                        "LC_UUID has unexpected size {}",
                        command.cmdsize
                    )));
                }

                let mut res = b"UUID".to_vec();
                res.extend_from_slice(&command.uuid);

                return Ok(res);
            }
        }

        let header_size = if macho.is_64 { 32 } else { 28 };
        let commands_end = header_size + macho.header.sizeofcmds as usize;

        if commands_end > self.data.len() {
            return Err(AppleCodeIdentityError::SignatureInvalid(
                "load commands extend past end of binary".into(),
            ));
        }

        let mut hasher = DigestType::Sha1.as_hasher()?;
        hasher.update(&self.data[0..IDENTIFICATION_HEADER_SIZE]);
        hasher.update(&self.data[header_size..commands_end]);

        Ok(hasher.finish().as_ref().to_vec())
    }

    fn flush(&mut self) -> Result<(), AppleCodeIdentityError> {
        *self = Self::open_slice(&self.path, self.selector)?;

        Ok(())
    }

    /// Raw component data.
    ///
    /// The info slot is backed by the `__TEXT,__info_plist` section. Every
    /// other slot comes from the superblob.
    fn component(&self, slot: CodeSigningSlot) -> Result<Option<Vec<u8>>, AppleCodeIdentityError> {
        if slot == CodeSigningSlot::Info {
            return self.info_plist_data();
        }

        Ok(self
            .signature()?
            .and_then(|sig| sig.component(slot))
            .map(|data| data.to_vec()))
    }

    /// The Info.plist embedded in the `__TEXT,__info_plist` section.
    fn info_plist(&self) -> Result<Option<plist::Dictionary>, AppleCodeIdentityError> {
        let data = match self.info_plist_data()? {
            Some(data) => data,
            None => return Ok(None),
        };

        match plist::Value::from_reader(Cursor::new(data))?.into_dictionary() {
            Some(dict) => Ok(Some(dict)),
            None => {
                warn!("{}: __info_plist is not a dictionary", self.path.display());
                Ok(None)
            }
        }
    }
}
