// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Code requirement programs.

A code requirement is a small program answering "does this code satisfy
this policy". It is stored in a requirement blob whose payload begins with a
u32 *kind*. Kind 1 programs are a binary encoded expression tree; kind 2
programs use a compact "lightweight" encoding that is opaque to this crate and
handed to a [crate::LightweightRequirementEvaluator].

# Binary Encoding

Expressions consist of opcodes. An opcode is defined by a u32 where the high
byte contains flags and the lower 3 bytes denote the opcode value.

Some opcodes have payloads and the payload varies by opcode. A common pattern
is to length encode arbitrary data via a u32 denoting the length and N bytes
to follow. Variable length data is padded with NULL bytes so the next opcode
is always aligned on a 4 byte boundary.

Opcodes not known to this crate are only accepted if they carry one of the
generic flags. Both flags promise that a length prefixed payload follows the
opcode. [OPCODE_FLAG_DEFAULT_FALSE] makes the opcode evaluate to false;
[OPCODE_FLAG_SKIP] makes evaluation continue with the expression that follows
the payload.
*/

use {
    crate::{
        embedded_signature::{read_and_validate_blob_header, CodeSigningMagic, RequirementBlob},
        error::AppleCodeIdentityError,
    },
    bcder::Oid,
    chrono::TimeZone,
    scroll::{IOwrite, Pread},
    std::{
        borrow::Cow,
        cmp::Ordering,
        fmt::{Debug, Display},
        io::Write,
    },
};

const OPCODE_FLAG_MASK: u32 = 0xff000000;
const OPCODE_VALUE_MASK: u32 = 0x00ffffff;

/// Opcode flag meaning has size field, okay to default to false.
pub const OPCODE_FLAG_DEFAULT_FALSE: u32 = 0x80000000;

/// Opcode flag meaning has size field, skip and continue.
pub const OPCODE_FLAG_SKIP: u32 = 0x40000000;

/// Maximum nesting of expressions accepted by the parser.
pub const MAX_PARSE_DEPTH: usize = 1000;

fn read_data(data: &[u8]) -> Result<(&[u8], &[u8]), AppleCodeIdentityError> {
    let length = data.pread_with::<u32>(0, scroll::BE)? as usize;

    let value = data
        .get(4..4 + length)
        .ok_or(AppleCodeIdentityError::RequirementMalformed(
            "data length exceeds requirement",
        ))?;

    // Next element is aligned on next 4 byte boundary.
    let offset = 4 + length;

    let offset = match offset % 4 {
        0 => offset,
        extra => offset + 4 - extra,
    };

    let remaining = data
        .get(offset..)
        .ok_or(AppleCodeIdentityError::RequirementMalformed(
            "data padding exceeds requirement",
        ))?;

    Ok((value, remaining))
}

fn read_str<'a>(
    data: &'a [u8],
    what: &'static str,
) -> Result<(&'a str, &'a [u8]), AppleCodeIdentityError> {
    let (value, data) = read_data(data)?;

    let s = std::str::from_utf8(value)
        .map_err(|_| AppleCodeIdentityError::RequirementMalformed(what))?;

    Ok((s, data))
}

fn read_i32(data: &[u8]) -> Result<(i32, &[u8]), AppleCodeIdentityError> {
    Ok((data.pread_with::<i32>(0, scroll::BE)?, &data[4..]))
}

fn read_timestamp(
    data: &[u8],
) -> Result<(chrono::DateTime<chrono::Utc>, &[u8]), AppleCodeIdentityError> {
    let value = data.pread_with::<i64>(0, scroll::BE)?;

    let ts = chrono::Utc.timestamp_opt(value, 0).single().ok_or(
        AppleCodeIdentityError::RequirementMalformed("timestamp out of range"),
    )?;

    Ok((ts, &data[8..]))
}

fn write_data(dest: &mut impl Write, data: &[u8]) -> Result<(), AppleCodeIdentityError> {
    dest.iowrite_with(data.len() as u32, scroll::BE)?;
    dest.write_all(data)?;

    match data.len() % 4 {
        0 => {}
        pad => {
            for _ in 0..4 - pad {
                dest.iowrite(0u8)?;
            }
        }
    }

    Ok(())
}

/// Format a certificate slot's value to human form.
fn format_certificate_slot(slot: i32) -> String {
    match slot {
        -1 => "root".to_string(),
        0 => "leaf".to_string(),
        _ => format!("{}", slot),
    }
}

/// Identifies the purpose of a requirement within a requirement set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequirementType {
    /// What hosts may run this code.
    Host,
    /// What guests this code may run.
    Guest,
    /// Designated requirement.
    Designated,
    /// What libraries this code may link against.
    Library,
    /// What plug-ins this code may load.
    Plugin,
    Unknown(u32),
}

impl From<u32> for RequirementType {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::Host,
            2 => Self::Guest,
            3 => Self::Designated,
            4 => Self::Library,
            5 => Self::Plugin,
            _ => Self::Unknown(v),
        }
    }
}

impl From<RequirementType> for u32 {
    fn from(t: RequirementType) -> Self {
        match t {
            RequirementType::Host => 1,
            RequirementType::Guest => 2,
            RequirementType::Designated => 3,
            RequirementType::Library => 4,
            RequirementType::Plugin => 5,
            RequirementType::Unknown(v) => v,
        }
    }
}

impl PartialOrd for RequirementType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RequirementType {
    fn cmp(&self, other: &Self) -> Ordering {
        u32::from(*self).cmp(&u32::from(*other))
    }
}

/// A value in a code requirement expression.
///
/// Printable ASCII data is presented as a string; anything else as bytes.
#[derive(Clone, Debug, PartialEq)]
pub enum CodeRequirementValue<'a> {
    String(Cow<'a, str>),
    Bytes(Cow<'a, [u8]>),
}

impl<'a> From<&'a [u8]> for CodeRequirementValue<'a> {
    fn from(value: &'a [u8]) -> Self {
        let is_ascii_printable = |c: &u8| -> bool {
            c.is_ascii_alphanumeric() || c.is_ascii_whitespace() || c.is_ascii_punctuation()
        };

        match std::str::from_utf8(value) {
            Ok(s) if value.iter().all(is_ascii_printable) => Self::String(s.into()),
            _ => Self::Bytes(value.into()),
        }
    }
}

impl<'a> From<&'a str> for CodeRequirementValue<'a> {
    fn from(s: &'a str) -> Self {
        Self::String(s.into())
    }
}

impl<'a> From<Cow<'a, str>> for CodeRequirementValue<'a> {
    fn from(v: Cow<'a, str>) -> Self {
        Self::String(v)
    }
}

impl From<String> for CodeRequirementValue<'static> {
    fn from(v: String) -> Self {
        Self::String(Cow::Owned(v))
    }
}

impl<'a> Display for CodeRequirementValue<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Bytes(data) => f.write_fmt(format_args!("{}", hex::encode(data))),
        }
    }
}

impl<'a> CodeRequirementValue<'a> {
    /// Obtain the raw bytes of this value.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::String(s) => s.as_bytes(),
            Self::Bytes(b) => b,
        }
    }

    /// Obtain the value as a string, if it is valid UTF-8.
    pub fn to_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
        }
    }

    /// Write the encoded version of this value somewhere.
    ///
    /// Binary encoding is u32 of length, then raw bytes, then NULL padding to next u32.
    fn write_encoded(&self, dest: &mut impl Write) -> Result<(), AppleCodeIdentityError> {
        write_data(dest, self.as_bytes())
    }
}

/// An opcode representing a code requirement expression.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u32)]
enum RequirementOpCode {
    False = 0,
    True = 1,
    Identifier = 2,
    AnchorApple = 3,
    AnchorCertificateHash = 4,
    InfoKeyValueLegacy = 5,
    And = 6,
    Or = 7,
    CodeDirectoryHash = 8,
    Not = 9,
    InfoPlistExpression = 10,
    CertificateField = 11,
    CertificateTrusted = 12,
    AnchorTrusted = 13,
    CertificateGeneric = 14,
    AnchorAppleGeneric = 15,
    EntitlementsField = 16,
    CertificatePolicy = 17,
    NamedAnchor = 18,
    NamedCode = 19,
    Platform = 20,
    Notarized = 21,
    CertificateFieldDate = 22,
    LegacyDeveloperId = 23,
}

impl TryFrom<u32> for RequirementOpCode {
    type Error = AppleCodeIdentityError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::False),
            1 => Ok(Self::True),
            2 => Ok(Self::Identifier),
            3 => Ok(Self::AnchorApple),
            4 => Ok(Self::AnchorCertificateHash),
            5 => Ok(Self::InfoKeyValueLegacy),
            6 => Ok(Self::And),
            7 => Ok(Self::Or),
            8 => Ok(Self::CodeDirectoryHash),
            9 => Ok(Self::Not),
            10 => Ok(Self::InfoPlistExpression),
            11 => Ok(Self::CertificateField),
            12 => Ok(Self::CertificateTrusted),
            13 => Ok(Self::AnchorTrusted),
            14 => Ok(Self::CertificateGeneric),
            15 => Ok(Self::AnchorAppleGeneric),
            16 => Ok(Self::EntitlementsField),
            17 => Ok(Self::CertificatePolicy),
            18 => Ok(Self::NamedAnchor),
            19 => Ok(Self::NamedCode),
            20 => Ok(Self::Platform),
            21 => Ok(Self::Notarized),
            22 => Ok(Self::CertificateFieldDate),
            23 => Ok(Self::LegacyDeveloperId),
            _ => Err(AppleCodeIdentityError::RequirementUnknownOpcode(v)),
        }
    }
}

impl RequirementOpCode {
    /// Parse the payload of an opcode.
    ///
    /// On successful parse, returns an [CodeRequirementExpression] and remaining data in
    /// the input slice.
    fn parse_payload<'a>(
        &self,
        data: &'a [u8],
        depth: usize,
    ) -> Result<(CodeRequirementExpression<'a>, &'a [u8]), AppleCodeIdentityError> {
        let nested = |data: &'a [u8]| CodeRequirementExpression::parse_at_depth(data, depth + 1);

        match self {
            Self::False => Ok((CodeRequirementExpression::False, data)),
            Self::True => Ok((CodeRequirementExpression::True, data)),
            Self::Identifier => {
                let (s, data) = read_str(data, "identifier value not a UTF-8 string")?;

                Ok((CodeRequirementExpression::Identifier(Cow::from(s)), data))
            }
            Self::AnchorApple => Ok((CodeRequirementExpression::AnchorApple, data)),
            Self::AnchorCertificateHash => {
                let (slot, data) = read_i32(data)?;
                let (digest, data) = read_data(data)?;

                Ok((
                    CodeRequirementExpression::AnchorCertificateHash(slot, digest.into()),
                    data,
                ))
            }
            Self::InfoKeyValueLegacy => {
                let (key, data) = read_str(data, "info key not a UTF-8 string")?;
                let (value, data) = read_str(data, "info value not a UTF-8 string")?;

                Ok((
                    CodeRequirementExpression::InfoKeyValueLegacy(key.into(), value.into()),
                    data,
                ))
            }
            Self::And => {
                let (a, data) = nested(data)?;
                let (b, data) = nested(data)?;

                Ok((
                    CodeRequirementExpression::And(Box::new(a), Box::new(b)),
                    data,
                ))
            }
            Self::Or => {
                let (a, data) = nested(data)?;
                let (b, data) = nested(data)?;

                Ok((
                    CodeRequirementExpression::Or(Box::new(a), Box::new(b)),
                    data,
                ))
            }
            Self::CodeDirectoryHash => {
                let (value, data) = read_data(data)?;

                Ok((
                    CodeRequirementExpression::CodeDirectoryHash(value.into()),
                    data,
                ))
            }
            Self::Not => {
                let (expr, data) = nested(data)?;

                Ok((CodeRequirementExpression::Not(Box::new(expr)), data))
            }
            Self::InfoPlistExpression => {
                let (key, data) = read_str(data, "key is not valid UTF-8")?;
                let (expr, data) = CodeRequirementMatchExpression::from_bytes(data)?;

                Ok((
                    CodeRequirementExpression::InfoPlistKeyField(key.into(), expr),
                    data,
                ))
            }
            Self::CertificateField => {
                let (slot, data) = read_i32(data)?;
                let (field, data) = read_str(data, "certificate field is not valid UTF-8")?;
                let (expr, data) = CodeRequirementMatchExpression::from_bytes(data)?;

                Ok((
                    CodeRequirementExpression::CertificateField(slot, field.into(), expr),
                    data,
                ))
            }
            Self::CertificateTrusted => {
                let (slot, data) = read_i32(data)?;

                Ok((CodeRequirementExpression::CertificateTrusted(slot), data))
            }
            Self::AnchorTrusted => Ok((CodeRequirementExpression::AnchorTrusted, data)),
            Self::CertificateGeneric => {
                let (slot, data) = read_i32(data)?;
                let (oid, data) = read_data(data)?;
                let (expr, data) = CodeRequirementMatchExpression::from_bytes(data)?;

                Ok((
                    CodeRequirementExpression::CertificateGeneric(slot, Oid(oid), expr),
                    data,
                ))
            }
            Self::AnchorAppleGeneric => Ok((CodeRequirementExpression::AnchorAppleGeneric, data)),
            Self::EntitlementsField => {
                let (key, data) = read_str(data, "entitlement key is not UTF-8")?;
                let (expr, data) = CodeRequirementMatchExpression::from_bytes(data)?;

                Ok((
                    CodeRequirementExpression::EntitlementsKey(key.into(), expr),
                    data,
                ))
            }
            Self::CertificatePolicy => {
                let (slot, data) = read_i32(data)?;
                let (oid, data) = read_data(data)?;
                let (expr, data) = CodeRequirementMatchExpression::from_bytes(data)?;

                Ok((
                    CodeRequirementExpression::CertificatePolicy(slot, Oid(oid), expr),
                    data,
                ))
            }
            Self::NamedAnchor => {
                let (name, data) = read_str(data, "named anchor isn't UTF-8")?;

                Ok((CodeRequirementExpression::NamedAnchor(name.into()), data))
            }
            Self::NamedCode => {
                let (name, data) = read_str(data, "named code isn't UTF-8")?;

                Ok((CodeRequirementExpression::NamedCode(name.into()), data))
            }
            Self::Platform => {
                let value = data.pread_with::<u32>(0, scroll::BE)?;

                Ok((CodeRequirementExpression::Platform(value), &data[4..]))
            }
            Self::Notarized => Ok((CodeRequirementExpression::Notarized, data)),
            Self::CertificateFieldDate => {
                let (slot, data) = read_i32(data)?;
                let (oid, data) = read_data(data)?;
                let (expr, data) = CodeRequirementMatchExpression::from_bytes(data)?;

                Ok((
                    CodeRequirementExpression::CertificateFieldDate(slot, Oid(oid), expr),
                    data,
                ))
            }
            Self::LegacyDeveloperId => Ok((CodeRequirementExpression::LegacyDeveloperId, data)),
        }
    }
}

/// Defines a code requirement expression.
#[derive(Clone, Debug, PartialEq)]
pub enum CodeRequirementExpression<'a> {
    /// False
    ///
    /// `never`
    False,

    /// True
    ///
    /// `always`
    True,

    /// Signing identifier.
    ///
    /// `identifier <string>`
    ///
    /// 4 bytes length followed by C string.
    Identifier(Cow<'a, str>),

    /// The certificate chain must lead to an Apple root.
    ///
    /// `anchor apple`
    AnchorApple,

    /// The certificate at a slot must have the specified SHA-1 hash.
    ///
    /// `anchor <slot> H"<hash>"`
    ///
    /// 4 bytes slot number, 4 bytes hash length, hash value.
    AnchorCertificateHash(i32, Cow<'a, [u8]>),

    /// Info.plist key value (legacy).
    ///
    /// `info[<key>] = <value>`
    InfoKeyValueLegacy(Cow<'a, str>, Cow<'a, str>),

    /// Logical and.
    ///
    /// `expr0 and expr1`
    And(
        Box<CodeRequirementExpression<'a>>,
        Box<CodeRequirementExpression<'a>>,
    ),

    /// Logical or.
    ///
    /// `expr0 or expr1`
    Or(
        Box<CodeRequirementExpression<'a>>,
        Box<CodeRequirementExpression<'a>>,
    ),

    /// Code directory hash.
    ///
    /// `cdhash H"<hash>"`
    CodeDirectoryHash(Cow<'a, [u8]>),

    /// Logical not.
    ///
    /// `!expr`
    Not(Box<CodeRequirementExpression<'a>>),

    /// Info plist key field.
    ///
    /// `info [key] match expression`
    InfoPlistKeyField(Cow<'a, str>, CodeRequirementMatchExpression<'a>),

    /// Certificate field matches.
    ///
    /// `certificate <slot> [<field>] match expression`
    CertificateField(i32, Cow<'a, str>, CodeRequirementMatchExpression<'a>),

    /// Certificate in position is trusted for code signing.
    ///
    /// `certificate <position> trusted`
    CertificateTrusted(i32),

    /// The certificate chain must lead to a trusted root.
    ///
    /// `anchor trusted`
    AnchorTrusted,

    /// Certificate extension matches by OID.
    ///
    /// `certificate <slot> [field.<oid>] match expression`
    CertificateGeneric(i32, Oid<&'a [u8]>, CodeRequirementMatchExpression<'a>),

    /// For code signed by Apple, including from code signing certificates issued by Apple.
    ///
    /// `anchor apple generic`
    AnchorAppleGeneric,

    /// Value associated with specified key in signature's embedded entitlements dictionary.
    ///
    /// `entitlement [<key>] match expression`
    EntitlementsKey(Cow<'a, str>, CodeRequirementMatchExpression<'a>),

    /// Certificate policy OID associated with certificate in a given slot.
    ///
    /// `certificate <slot> [policy.<oid>] match expression`
    CertificatePolicy(i32, Oid<&'a [u8]>, CodeRequirementMatchExpression<'a>),

    /// A named Apple anchor.
    ///
    /// `anchor apple <name>`
    NamedAnchor(Cow<'a, str>),

    /// Named code.
    ///
    /// `(<name>)`
    NamedCode(Cow<'a, str>),

    /// Platform value.
    ///
    /// `platform = <value>`
    Platform(u32),

    /// Binary is notarized.
    ///
    /// `notarized`
    Notarized,

    /// Certificate date field by OID.
    ///
    /// `certificate <slot> [timestamp.<oid>] match expression`
    CertificateFieldDate(i32, Oid<&'a [u8]>, CodeRequirementMatchExpression<'a>),

    /// Legacy developer ID used.
    LegacyDeveloperId,

    /// Unknown opcode flagged [OPCODE_FLAG_DEFAULT_FALSE].
    ///
    /// Evaluates to false. The raw opcode and payload are retained.
    UnknownDefaultFalse(u32, Cow<'a, [u8]>),

    /// Unknown opcode flagged [OPCODE_FLAG_SKIP].
    ///
    /// Evaluates to the expression that follows it.
    UnknownSkipped(u32, Cow<'a, [u8]>, Box<CodeRequirementExpression<'a>>),
}

impl<'a> Display for CodeRequirementExpression<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::False => f.write_str("never"),
            Self::True => f.write_str("always"),
            Self::Identifier(value) => f.write_fmt(format_args!("identifier \"{}\"", value)),
            Self::AnchorApple => f.write_str("anchor apple"),
            Self::AnchorCertificateHash(slot, digest) => f.write_fmt(format_args!(
                "certificate {} = H\"{}\"",
                format_certificate_slot(*slot),
                hex::encode(digest)
            )),
            Self::InfoKeyValueLegacy(key, value) => {
                f.write_fmt(format_args!("info[{}] = \"{}\"", key, value))
            }
            Self::And(a, b) => f.write_fmt(format_args!("({}) and ({})", a, b)),
            Self::Or(a, b) => f.write_fmt(format_args!("({}) or ({})", a, b)),
            Self::CodeDirectoryHash(digest) => {
                f.write_fmt(format_args!("cdhash H\"{}\"", hex::encode(digest)))
            }
            Self::Not(expr) => f.write_fmt(format_args!("!({})", expr)),
            Self::InfoPlistKeyField(key, expr) => {
                f.write_fmt(format_args!("info [{}] {}", key, expr))
            }
            Self::CertificateField(slot, field, expr) => f.write_fmt(format_args!(
                "certificate {}[{}] {}",
                format_certificate_slot(*slot),
                field,
                expr
            )),
            Self::CertificateTrusted(slot) => f.write_fmt(format_args!(
                "certificate {} trusted",
                format_certificate_slot(*slot)
            )),
            Self::AnchorTrusted => f.write_str("anchor trusted"),
            Self::CertificateGeneric(slot, oid, expr) => f.write_fmt(format_args!(
                "certificate {}[field.{}] {}",
                format_certificate_slot(*slot),
                oid,
                expr
            )),
            Self::AnchorAppleGeneric => f.write_str("anchor apple generic"),
            Self::EntitlementsKey(key, expr) => {
                f.write_fmt(format_args!("entitlement [{}] {}", key, expr))
            }
            Self::CertificatePolicy(slot, oid, expr) => f.write_fmt(format_args!(
                "certificate {}[policy.{}] {}",
                format_certificate_slot(*slot),
                oid,
                expr
            )),
            Self::NamedAnchor(name) => f.write_fmt(format_args!("anchor apple {}", name)),
            Self::NamedCode(name) => f.write_fmt(format_args!("({})", name)),
            Self::Platform(platform) => f.write_fmt(format_args!("platform = {}", platform)),
            Self::Notarized => f.write_str("notarized"),
            Self::CertificateFieldDate(slot, oid, expr) => f.write_fmt(format_args!(
                "certificate {}[timestamp.{}] {}",
                format_certificate_slot(*slot),
                oid,
                expr
            )),
            Self::LegacyDeveloperId => f.write_str("legacy"),
            Self::UnknownDefaultFalse(opcode, _) => {
                f.write_fmt(format_args!("/* opcode {:#x} */ never", opcode))
            }
            Self::UnknownSkipped(opcode, _, next) => {
                f.write_fmt(format_args!("/* opcode {:#x} */ {}", opcode, next))
            }
        }
    }
}

impl<'a> CodeRequirementExpression<'a> {
    /// Construct an expression element by reading from a slice.
    ///
    /// Returns the newly constructed element and remaining data in the slice.
    pub fn from_bytes(data: &'a [u8]) -> Result<(Self, &'a [u8]), AppleCodeIdentityError> {
        Self::parse_at_depth(data, 0)
    }

    fn parse_at_depth(
        data: &'a [u8],
        depth: usize,
    ) -> Result<(Self, &'a [u8]), AppleCodeIdentityError> {
        if depth >= MAX_PARSE_DEPTH {
            return Err(AppleCodeIdentityError::RequirementTooDeep(MAX_PARSE_DEPTH));
        }

        let opcode_raw = data.pread_with::<u32>(0, scroll::BE)?;

        let flags = opcode_raw & OPCODE_FLAG_MASK;
        let opcode = opcode_raw & OPCODE_VALUE_MASK;

        let data = &data[4..];

        match RequirementOpCode::try_from(opcode) {
            Ok(opcode) => opcode.parse_payload(data, depth),
            Err(_) if flags & OPCODE_FLAG_DEFAULT_FALSE != 0 => {
                let (payload, data) = read_data(data)?;

                Ok((Self::UnknownDefaultFalse(opcode_raw, payload.into()), data))
            }
            Err(_) if flags & OPCODE_FLAG_SKIP != 0 => {
                let (payload, data) = read_data(data)?;
                let (next, data) = Self::parse_at_depth(data, depth + 1)?;

                Ok((
                    Self::UnknownSkipped(opcode_raw, payload.into(), Box::new(next)),
                    data,
                ))
            }
            Err(e) => Err(e),
        }
    }

    fn opcode(&self) -> u32 {
        let op = match self {
            Self::False => RequirementOpCode::False,
            Self::True => RequirementOpCode::True,
            Self::Identifier(_) => RequirementOpCode::Identifier,
            Self::AnchorApple => RequirementOpCode::AnchorApple,
            Self::AnchorCertificateHash(_, _) => RequirementOpCode::AnchorCertificateHash,
            Self::InfoKeyValueLegacy(_, _) => RequirementOpCode::InfoKeyValueLegacy,
            Self::And(_, _) => RequirementOpCode::And,
            Self::Or(_, _) => RequirementOpCode::Or,
            Self::CodeDirectoryHash(_) => RequirementOpCode::CodeDirectoryHash,
            Self::Not(_) => RequirementOpCode::Not,
            Self::InfoPlistKeyField(_, _) => RequirementOpCode::InfoPlistExpression,
            Self::CertificateField(_, _, _) => RequirementOpCode::CertificateField,
            Self::CertificateTrusted(_) => RequirementOpCode::CertificateTrusted,
            Self::AnchorTrusted => RequirementOpCode::AnchorTrusted,
            Self::CertificateGeneric(_, _, _) => RequirementOpCode::CertificateGeneric,
            Self::AnchorAppleGeneric => RequirementOpCode::AnchorAppleGeneric,
            Self::EntitlementsKey(_, _) => RequirementOpCode::EntitlementsField,
            Self::CertificatePolicy(_, _, _) => RequirementOpCode::CertificatePolicy,
            Self::NamedAnchor(_) => RequirementOpCode::NamedAnchor,
            Self::NamedCode(_) => RequirementOpCode::NamedCode,
            Self::Platform(_) => RequirementOpCode::Platform,
            Self::Notarized => RequirementOpCode::Notarized,
            Self::CertificateFieldDate(_, _, _) => RequirementOpCode::CertificateFieldDate,
            Self::LegacyDeveloperId => RequirementOpCode::LegacyDeveloperId,
            Self::UnknownDefaultFalse(raw, _) | Self::UnknownSkipped(raw, _, _) => return *raw,
        };

        op as u32
    }

    /// Write binary representation of this expression to a destination.
    pub fn write_to(&self, dest: &mut impl Write) -> Result<(), AppleCodeIdentityError> {
        dest.iowrite_with(self.opcode(), scroll::BE)?;

        match self {
            Self::False
            | Self::True
            | Self::AnchorApple
            | Self::AnchorTrusted
            | Self::AnchorAppleGeneric
            | Self::Notarized
            | Self::LegacyDeveloperId => {}
            Self::Identifier(s) => {
                write_data(dest, s.as_bytes())?;
            }
            Self::AnchorCertificateHash(slot, hash) => {
                dest.iowrite_with(*slot, scroll::BE)?;
                write_data(dest, hash)?;
            }
            Self::InfoKeyValueLegacy(key, value) => {
                write_data(dest, key.as_bytes())?;
                write_data(dest, value.as_bytes())?;
            }
            Self::And(a, b) | Self::Or(a, b) => {
                a.write_to(dest)?;
                b.write_to(dest)?;
            }
            Self::CodeDirectoryHash(hash) => {
                write_data(dest, hash)?;
            }
            Self::Not(expr) => {
                expr.write_to(dest)?;
            }
            Self::InfoPlistKeyField(key, m) | Self::EntitlementsKey(key, m) => {
                write_data(dest, key.as_bytes())?;
                m.write_to(dest)?;
            }
            Self::CertificateField(slot, field, m) => {
                dest.iowrite_with(*slot, scroll::BE)?;
                write_data(dest, field.as_bytes())?;
                m.write_to(dest)?;
            }
            Self::CertificateTrusted(slot) => {
                dest.iowrite_with(*slot, scroll::BE)?;
            }
            Self::CertificateGeneric(slot, oid, m)
            | Self::CertificatePolicy(slot, oid, m)
            | Self::CertificateFieldDate(slot, oid, m) => {
                dest.iowrite_with(*slot, scroll::BE)?;
                write_data(dest, oid.as_ref())?;
                m.write_to(dest)?;
            }
            Self::NamedAnchor(value) | Self::NamedCode(value) => {
                write_data(dest, value.as_bytes())?;
            }
            Self::Platform(value) => {
                dest.iowrite_with(*value, scroll::BE)?;
            }
            Self::UnknownDefaultFalse(_, payload) => {
                write_data(dest, payload)?;
            }
            Self::UnknownSkipped(_, payload, next) => {
                write_data(dest, payload)?;
                next.write_to(dest)?;
            }
        }

        Ok(())
    }

    /// Produce the binary serialization of this expression.
    ///
    /// The blob header/magic and program kind are not included.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AppleCodeIdentityError> {
        let mut res = vec![];

        self.write_to(&mut res)?;

        Ok(res)
    }

    /// Nesting depth of this expression tree. A leaf has depth 1.
    pub fn depth(&self) -> usize {
        match self {
            Self::And(a, b) | Self::Or(a, b) => 1 + a.depth().max(b.depth()),
            Self::Not(e) | Self::UnknownSkipped(_, _, e) => 1 + e.depth(),
            _ => 1,
        }
    }
}

/// A code requirement match expression type.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u32)]
enum MatchType {
    Exists = 0,
    Equal = 1,
    Contains = 2,
    BeginsWith = 3,
    EndsWith = 4,
    LessThan = 5,
    GreaterThan = 6,
    LessThanEqual = 7,
    GreaterThanEqual = 8,
    On = 9,
    Before = 10,
    After = 11,
    OnOrBefore = 12,
    OnOrAfter = 13,
    Absent = 14,
}

impl TryFrom<u32> for MatchType {
    type Error = AppleCodeIdentityError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Exists),
            1 => Ok(Self::Equal),
            2 => Ok(Self::Contains),
            3 => Ok(Self::BeginsWith),
            4 => Ok(Self::EndsWith),
            5 => Ok(Self::LessThan),
            6 => Ok(Self::GreaterThan),
            7 => Ok(Self::LessThanEqual),
            8 => Ok(Self::GreaterThanEqual),
            9 => Ok(Self::On),
            10 => Ok(Self::Before),
            11 => Ok(Self::After),
            12 => Ok(Self::OnOrBefore),
            13 => Ok(Self::OnOrAfter),
            14 => Ok(Self::Absent),
            _ => Err(AppleCodeIdentityError::RequirementUnknownMatchExpression(v)),
        }
    }
}

impl MatchType {
    /// Parse the payload of a match expression.
    fn parse_payload<'a>(
        &self,
        data: &'a [u8],
    ) -> Result<(CodeRequirementMatchExpression<'a>, &'a [u8]), AppleCodeIdentityError> {
        type M<'b> = CodeRequirementMatchExpression<'b>;

        let value = |data: &'a [u8], f: fn(CodeRequirementValue<'a>) -> M<'a>| {
            let (value, data) = read_data(data)?;
            Ok::<_, AppleCodeIdentityError>((f(value.into()), data))
        };
        let timestamp = |data: &'a [u8], f: fn(chrono::DateTime<chrono::Utc>) -> M<'a>| {
            let (ts, data) = read_timestamp(data)?;
            Ok::<_, AppleCodeIdentityError>((f(ts), data))
        };

        match self {
            Self::Exists => Ok((M::Exists, data)),
            Self::Equal => value(data, M::Equal),
            Self::Contains => value(data, M::Contains),
            Self::BeginsWith => value(data, M::BeginsWith),
            Self::EndsWith => value(data, M::EndsWith),
            Self::LessThan => value(data, M::LessThan),
            Self::GreaterThan => value(data, M::GreaterThan),
            Self::LessThanEqual => value(data, M::LessThanEqual),
            Self::GreaterThanEqual => value(data, M::GreaterThanEqual),
            Self::On => timestamp(data, M::On),
            Self::Before => timestamp(data, M::Before),
            Self::After => timestamp(data, M::After),
            Self::OnOrBefore => timestamp(data, M::OnOrBefore),
            Self::OnOrAfter => timestamp(data, M::OnOrAfter),
            Self::Absent => Ok((M::Absent, data)),
        }
    }
}

/// An instance of a match expression in a [CodeRequirementExpression].
#[derive(Clone, Debug, PartialEq)]
pub enum CodeRequirementMatchExpression<'a> {
    /// Entity exists and is not boolean false.
    ///
    /// `exists`
    Exists,

    /// Equality.
    ///
    /// `= <value>`
    Equal(CodeRequirementValue<'a>),

    /// Contains.
    ///
    /// `~ <value>`
    Contains(CodeRequirementValue<'a>),

    /// Begins with.
    ///
    /// `= <value>*`
    BeginsWith(CodeRequirementValue<'a>),

    /// Ends with.
    ///
    /// `= *<value>`
    EndsWith(CodeRequirementValue<'a>),

    /// Less than.
    ///
    /// `< <value>`
    LessThan(CodeRequirementValue<'a>),

    /// Greater than.
    ///
    /// `> <value>`
    GreaterThan(CodeRequirementValue<'a>),

    /// Less than or equal to.
    ///
    /// `<= <value>`
    LessThanEqual(CodeRequirementValue<'a>),

    /// Greater than or equal to.
    ///
    /// `>= <value>`
    GreaterThanEqual(CodeRequirementValue<'a>),

    /// Timestamp value equivalent.
    ///
    /// `= timestamp "<timestamp>"`
    On(chrono::DateTime<chrono::Utc>),

    /// Timestamp value before.
    ///
    /// `< timestamp "<timestamp>"`
    Before(chrono::DateTime<chrono::Utc>),

    /// Timestamp value after.
    ///
    /// `> timestamp "<timestamp>"`
    After(chrono::DateTime<chrono::Utc>),

    /// Timestamp value equivalent or before.
    ///
    /// `<= timestamp "<timestamp>"`
    OnOrBefore(chrono::DateTime<chrono::Utc>),

    /// Timestamp value equivalent or after.
    ///
    /// `>= timestamp "<timestamp>"`
    OnOrAfter(chrono::DateTime<chrono::Utc>),

    /// Value is absent.
    Absent,
}

impl<'a> Display for CodeRequirementMatchExpression<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exists => f.write_str("/* exists */"),
            Self::Equal(value) => f.write_fmt(format_args!("= \"{}\"", value)),
            Self::Contains(value) => f.write_fmt(format_args!("~ \"{}\"", value)),
            Self::BeginsWith(value) => f.write_fmt(format_args!("= \"{}*\"", value)),
            Self::EndsWith(value) => f.write_fmt(format_args!("= \"*{}\"", value)),
            Self::LessThan(value) => f.write_fmt(format_args!("< \"{}\"", value)),
            Self::GreaterThan(value) => f.write_fmt(format_args!("> \"{}\"", value)),
            Self::LessThanEqual(value) => f.write_fmt(format_args!("<= \"{}\"", value)),
            Self::GreaterThanEqual(value) => f.write_fmt(format_args!(">= \"{}\"", value)),
            Self::On(value) => f.write_fmt(format_args!("= timestamp \"{}\"", value)),
            Self::Before(value) => f.write_fmt(format_args!("< timestamp \"{}\"", value)),
            Self::After(value) => f.write_fmt(format_args!("> timestamp \"{}\"", value)),
            Self::OnOrBefore(value) => f.write_fmt(format_args!("<= timestamp \"{}\"", value)),
            Self::OnOrAfter(value) => f.write_fmt(format_args!(">= timestamp \"{}\"", value)),
            Self::Absent => f.write_str("absent"),
        }
    }
}

impl<'a> From<&CodeRequirementMatchExpression<'a>> for MatchType {
    fn from(m: &CodeRequirementMatchExpression<'a>) -> Self {
        match m {
            CodeRequirementMatchExpression::Exists => MatchType::Exists,
            CodeRequirementMatchExpression::Equal(_) => MatchType::Equal,
            CodeRequirementMatchExpression::Contains(_) => MatchType::Contains,
            CodeRequirementMatchExpression::BeginsWith(_) => MatchType::BeginsWith,
            CodeRequirementMatchExpression::EndsWith(_) => MatchType::EndsWith,
            CodeRequirementMatchExpression::LessThan(_) => MatchType::LessThan,
            CodeRequirementMatchExpression::GreaterThan(_) => MatchType::GreaterThan,
            CodeRequirementMatchExpression::LessThanEqual(_) => MatchType::LessThanEqual,
            CodeRequirementMatchExpression::GreaterThanEqual(_) => MatchType::GreaterThanEqual,
            CodeRequirementMatchExpression::On(_) => MatchType::On,
            CodeRequirementMatchExpression::Before(_) => MatchType::Before,
            CodeRequirementMatchExpression::After(_) => MatchType::After,
            CodeRequirementMatchExpression::OnOrBefore(_) => MatchType::OnOrBefore,
            CodeRequirementMatchExpression::OnOrAfter(_) => MatchType::OnOrAfter,
            CodeRequirementMatchExpression::Absent => MatchType::Absent,
        }
    }
}

impl<'a> CodeRequirementMatchExpression<'a> {
    /// Parse a match expression from bytes.
    ///
    /// The slice should begin with the match type u32.
    pub fn from_bytes(data: &'a [u8]) -> Result<(Self, &'a [u8]), AppleCodeIdentityError> {
        let typ = data.pread_with::<u32>(0, scroll::BE)?;

        let typ = MatchType::try_from(typ)?;

        typ.parse_payload(&data[4..])
    }

    /// Write binary representation of this match expression to a destination.
    pub fn write_to(&self, dest: &mut impl Write) -> Result<(), AppleCodeIdentityError> {
        dest.iowrite_with(MatchType::from(self) as u32, scroll::BE)?;

        match self {
            Self::Exists | Self::Absent => {}
            Self::Equal(value)
            | Self::Contains(value)
            | Self::BeginsWith(value)
            | Self::EndsWith(value)
            | Self::LessThan(value)
            | Self::GreaterThan(value)
            | Self::LessThanEqual(value)
            | Self::GreaterThanEqual(value) => value.write_encoded(dest)?,
            Self::On(value)
            | Self::Before(value)
            | Self::After(value)
            | Self::OnOrBefore(value)
            | Self::OnOrAfter(value) => dest.iowrite_with(value.timestamp(), scroll::BE)?,
        }

        Ok(())
    }
}

/// The form a requirement program is encoded in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequirementKind {
    /// Binary expression tree.
    Expression,
    /// Compact encoding evaluated by an external evaluator.
    Lightweight,
}

impl From<RequirementKind> for u32 {
    fn from(k: RequirementKind) -> Self {
        match k {
            RequirementKind::Expression => 1,
            RequirementKind::Lightweight => 2,
        }
    }
}

impl TryFrom<u32> for RequirementKind {
    type Error = AppleCodeIdentityError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Expression),
            2 => Ok(Self::Lightweight),
            _ => Err(AppleCodeIdentityError::RequirementUnknownKind(v)),
        }
    }
}

/// A parsed requirement program.
#[derive(Clone, Debug, PartialEq)]
pub enum RequirementProgram<'a> {
    Expression(CodeRequirementExpression<'a>),
    /// Lightweight programs are retained as raw bytes following the kind.
    Lightweight(Cow<'a, [u8]>),
}

impl<'a> Display for RequirementProgram<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Expression(expr) => Display::fmt(expr, f),
            Self::Lightweight(data) => {
                f.write_fmt(format_args!("/* lightweight requirement: {} bytes */", data.len()))
            }
        }
    }
}

impl<'a> From<CodeRequirementExpression<'a>> for RequirementProgram<'a> {
    fn from(expr: CodeRequirementExpression<'a>) -> Self {
        Self::Expression(expr)
    }
}

impl<'a> RequirementProgram<'a> {
    /// Parse the payload of a requirement blob, which begins with the kind.
    pub fn parse_payload(data: &'a [u8]) -> Result<Self, AppleCodeIdentityError> {
        let kind = RequirementKind::try_from(data.pread_with::<u32>(0, scroll::BE)?)?;
        let data = &data[4..];

        match kind {
            RequirementKind::Expression => {
                let (expr, _) = CodeRequirementExpression::from_bytes(data)?;

                Ok(Self::Expression(expr))
            }
            RequirementKind::Lightweight => Ok(Self::Lightweight(data.into())),
        }
    }

    /// Parse a requirement blob, which begins with header magic.
    ///
    /// This can be used to parse the output generated by `csreq -b`.
    pub fn parse_blob(data: &'a [u8]) -> Result<Self, AppleCodeIdentityError> {
        let data = read_and_validate_blob_header(
            data,
            u32::from(CodeSigningMagic::Requirement),
            "code requirement blob",
        )
        .map_err(|_| AppleCodeIdentityError::RequirementMalformed("blob header"))?;

        Self::parse_payload(data)
    }

    pub fn kind(&self) -> RequirementKind {
        match self {
            Self::Expression(_) => RequirementKind::Expression,
            Self::Lightweight(_) => RequirementKind::Lightweight,
        }
    }

    /// Obtain the expression tree, if this is an expression program.
    pub fn expression(&self) -> Option<&CodeRequirementExpression<'a>> {
        match self {
            Self::Expression(expr) => Some(expr),
            Self::Lightweight(_) => None,
        }
    }

    /// Write the blob payload (kind plus program) to a destination.
    pub fn write_to(&self, dest: &mut impl Write) -> Result<(), AppleCodeIdentityError> {
        dest.iowrite_with(u32::from(self.kind()), scroll::BE)?;

        match self {
            Self::Expression(expr) => expr.write_to(dest),
            Self::Lightweight(data) => Ok(dest.write_all(data)?),
        }
    }

    /// Obtain the blob representation of this program.
    ///
    /// The generated data should be equivalent to what `csreq -b` would produce.
    pub fn to_blob_data(&self) -> Result<Vec<u8>, AppleCodeIdentityError> {
        let mut payload = vec![];
        self.write_to(&mut payload)?;

        let mut dest = Vec::with_capacity(payload.len() + 8);
        dest.iowrite_with(u32::from(CodeSigningMagic::Requirement), scroll::BE)?;
        dest.iowrite_with(payload.len() as u32 + 8, scroll::BE)?;
        dest.write_all(&payload)?;

        Ok(dest)
    }
}

impl<'a> TryFrom<&RequirementProgram<'a>> for RequirementBlob<'static> {
    type Error = AppleCodeIdentityError;

    fn try_from(program: &RequirementProgram<'a>) -> Result<Self, Self::Error> {
        let mut data = Vec::<u8>::new();
        program.write_to(&mut data)?;

        Ok(Self {
            data: Cow::Owned(data),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(source: &[u8]) -> CodeRequirementExpression<'_> {
        match RequirementProgram::parse_payload(source).unwrap() {
            RequirementProgram::Expression(expr) => expr,
            RequirementProgram::Lightweight(_) => panic!("expected expression program"),
        }
    }

    fn verify_roundtrip(expr: CodeRequirementExpression<'_>, source: &[u8]) {
        let program = RequirementProgram::Expression(expr);
        let mut dest = vec![];
        program.write_to(&mut dest).unwrap();
        assert_eq!(dest.as_slice(), source);
    }

    #[test]
    fn parse_false() {
        let source = hex::decode("0000000100000000").unwrap();

        let expr = parse(&source);
        assert_eq!(expr, CodeRequirementExpression::False);
        verify_roundtrip(expr, &source);
    }

    #[test]
    fn parse_true() {
        let source = hex::decode("0000000100000001").unwrap();

        let expr = parse(&source);
        assert_eq!(expr, CodeRequirementExpression::True);
        verify_roundtrip(expr, &source);
    }

    #[test]
    fn parse_identifier() {
        let source = hex::decode("000000010000000200000007666f6f2e62617200").unwrap();

        let expr = parse(&source);
        assert_eq!(expr, CodeRequirementExpression::Identifier("foo.bar".into()));
        assert_eq!(expr.to_string(), "identifier \"foo.bar\"");
        verify_roundtrip(expr, &source);
    }

    #[test]
    fn parse_identifier_truncated() {
        let source = hex::decode("000000010000000200000007666f6f").unwrap();

        assert!(matches!(
            RequirementProgram::parse_payload(&source),
            Err(AppleCodeIdentityError::RequirementMalformed(_))
        ));
    }

    #[test]
    fn parse_anchor_certificate_hash() {
        let source =
            hex::decode("0000000100000004ffffffff00000014deadbeefdeadbeefdeadbeefdeadbeefdeadbeef")
                .unwrap();

        let expr = parse(&source);
        assert_eq!(
            expr,
            CodeRequirementExpression::AnchorCertificateHash(
                -1,
                hex::decode("deadbeefdeadbeefdeadbeefdeadbeefdeadbeef")
                    .unwrap()
                    .into()
            )
        );
        assert_eq!(
            expr.to_string(),
            "certificate root = H\"deadbeefdeadbeefdeadbeefdeadbeefdeadbeef\""
        );
        verify_roundtrip(expr, &source);
    }

    #[test]
    fn parse_and_or_not() {
        let source = hex::decode("00000001000000060000000100000000").unwrap();
        let expr = parse(&source);
        assert_eq!(
            expr,
            CodeRequirementExpression::And(
                Box::new(CodeRequirementExpression::True),
                Box::new(CodeRequirementExpression::False)
            )
        );
        assert_eq!(expr.to_string(), "(always) and (never)");
        verify_roundtrip(expr, &source);

        let source = hex::decode("00000001000000070000000100000000").unwrap();
        let expr = parse(&source);
        assert_eq!(
            expr,
            CodeRequirementExpression::Or(
                Box::new(CodeRequirementExpression::True),
                Box::new(CodeRequirementExpression::False)
            )
        );
        verify_roundtrip(expr, &source);

        let source = hex::decode("000000010000000900000001").unwrap();
        let expr = parse(&source);
        assert_eq!(
            expr,
            CodeRequirementExpression::Not(Box::new(CodeRequirementExpression::True))
        );
        verify_roundtrip(expr, &source);
    }

    #[test]
    fn parse_code_directory_hash() {
        let source =
            hex::decode("000000010000000800000014deadbeefdeadbeefdeadbeefdeadbeefdeadbeef")
                .unwrap();

        let expr = parse(&source);
        assert_eq!(
            expr,
            CodeRequirementExpression::CodeDirectoryHash(
                hex::decode("deadbeefdeadbeefdeadbeefdeadbeefdeadbeef")
                    .unwrap()
                    .into()
            )
        );
        verify_roundtrip(expr, &source);
    }

    #[test]
    fn parse_info_plist_key_field() {
        let source = hex::decode("000000010000000a000000036b65790000000000").unwrap();

        let expr = parse(&source);
        assert_eq!(
            expr,
            CodeRequirementExpression::InfoPlistKeyField(
                "key".into(),
                CodeRequirementMatchExpression::Exists
            )
        );
        verify_roundtrip(expr, &source);
    }

    #[test]
    fn parse_certificate_field() {
        let source =
            hex::decode("000000010000000bffffffff0000000a7375626a6563742e434e000000000000")
                .unwrap();

        let expr = parse(&source);
        assert_eq!(
            expr,
            CodeRequirementExpression::CertificateField(
                -1,
                "subject.CN".into(),
                CodeRequirementMatchExpression::Exists
            )
        );
        assert_eq!(
            expr.to_string(),
            "certificate root[subject.CN] /* exists */"
        );
        verify_roundtrip(expr, &source);
    }

    #[test]
    fn parse_certificate_trusted() {
        let source = hex::decode("000000010000000cffffffff").unwrap();

        let expr = parse(&source);
        assert_eq!(expr, CodeRequirementExpression::CertificateTrusted(-1));
        verify_roundtrip(expr, &source);
    }

    #[test]
    fn parse_certificate_generic() {
        let source = hex::decode("000000010000000effffffff000000035504030000000000").unwrap();

        let expr = parse(&source);
        assert_eq!(
            expr,
            CodeRequirementExpression::CertificateGeneric(
                -1,
                Oid(&[0x55, 4, 3]),
                CodeRequirementMatchExpression::Exists
            )
        );
        verify_roundtrip(expr, &source);
    }

    #[test]
    fn parse_certificate_policy() {
        let source = hex::decode("0000000100000011ffffffff000000035504030000000000").unwrap();

        let expr = parse(&source);
        assert_eq!(
            expr,
            CodeRequirementExpression::CertificatePolicy(
                -1,
                Oid(&[0x55, 4, 3]),
                CodeRequirementMatchExpression::Exists
            )
        );
        verify_roundtrip(expr, &source);
    }

    #[test]
    fn parse_entitlements_key() {
        let source = hex::decode("0000000100000010000000036b65790000000000").unwrap();

        let expr = parse(&source);
        assert_eq!(
            expr,
            CodeRequirementExpression::EntitlementsKey(
                "key".into(),
                CodeRequirementMatchExpression::Exists
            )
        );
        verify_roundtrip(expr, &source);
    }

    #[test]
    fn parse_named() {
        let source = hex::decode("000000010000001200000003666f6f00").unwrap();
        let expr = parse(&source);
        assert_eq!(expr, CodeRequirementExpression::NamedAnchor("foo".into()));
        assert_eq!(expr.to_string(), "anchor apple foo");
        verify_roundtrip(expr, &source);

        let source = hex::decode("000000010000001300000003666f6f00").unwrap();
        let expr = parse(&source);
        assert_eq!(expr, CodeRequirementExpression::NamedCode("foo".into()));
        assert_eq!(expr.to_string(), "(foo)");
        verify_roundtrip(expr, &source);
    }

    #[test]
    fn parse_platform_notarized_legacy() {
        let source = hex::decode("000000010000001400000010").unwrap();
        let expr = parse(&source);
        assert_eq!(expr, CodeRequirementExpression::Platform(16));
        verify_roundtrip(expr, &source);

        let source = hex::decode("0000000100000015").unwrap();
        let expr = parse(&source);
        assert_eq!(expr, CodeRequirementExpression::Notarized);
        verify_roundtrip(expr, &source);

        let source = hex::decode("0000000100000017").unwrap();
        let expr = parse(&source);
        assert_eq!(expr, CodeRequirementExpression::LegacyDeveloperId);
        verify_roundtrip(expr, &source);
    }

    #[test]
    fn parse_certificate_field_date() {
        let source = hex::decode(
            "0000000100000016ffffffff000000035504030000000009000000000000000a",
        )
        .unwrap();

        let expr = parse(&source);
        assert_eq!(
            expr,
            CodeRequirementExpression::CertificateFieldDate(
                -1,
                Oid(&[0x55, 4, 3]),
                CodeRequirementMatchExpression::On(chrono::Utc.timestamp_opt(10, 0).unwrap())
            )
        );
        verify_roundtrip(expr, &source);
    }

    #[test]
    fn parse_match_values() {
        let source = hex::decode("000000010000000a000000036b65790000000001000000036261720000000000")
            .unwrap();
        // Trailing data after the expression is tolerated.
        let expr = parse(&source);
        assert_eq!(
            expr,
            CodeRequirementExpression::InfoPlistKeyField(
                "key".into(),
                CodeRequirementMatchExpression::Equal("bar".into())
            )
        );
        assert_eq!(expr.to_string(), "info [key] = \"bar\"");

        for (typ, expected) in [
            (2u32, CodeRequirementMatchExpression::Contains("bar".into())),
            (3, CodeRequirementMatchExpression::BeginsWith("bar".into())),
            (4, CodeRequirementMatchExpression::EndsWith("bar".into())),
            (5, CodeRequirementMatchExpression::LessThan("bar".into())),
            (6, CodeRequirementMatchExpression::GreaterThan("bar".into())),
            (7, CodeRequirementMatchExpression::LessThanEqual("bar".into())),
            (8, CodeRequirementMatchExpression::GreaterThanEqual("bar".into())),
        ] {
            let mut data = vec![];
            data.extend_from_slice(&typ.to_be_bytes());
            data.extend_from_slice(&hex::decode("0000000362617200").unwrap());

            let (m, rest) = CodeRequirementMatchExpression::from_bytes(&data).unwrap();
            assert_eq!(m, expected);
            assert!(rest.is_empty());

            let mut dest = vec![];
            m.write_to(&mut dest).unwrap();
            assert_eq!(dest, data);
        }

        assert!(matches!(
            CodeRequirementMatchExpression::from_bytes(&hex::decode("0000000f").unwrap()),
            Err(AppleCodeIdentityError::RequirementUnknownMatchExpression(15))
        ));
    }

    #[test]
    fn parse_blob() {
        let source = hex::decode("fade0c00000000100000000100000000").unwrap();

        let program = RequirementProgram::parse_blob(&source).unwrap();
        assert_eq!(
            program,
            RequirementProgram::Expression(CodeRequirementExpression::False)
        );
        assert_eq!(program.to_blob_data().unwrap(), source);
    }

    #[test]
    fn lightweight_program_is_opaque() {
        let source = hex::decode("00000002deadbeef").unwrap();

        let program = RequirementProgram::parse_payload(&source).unwrap();
        assert_eq!(program.kind(), RequirementKind::Lightweight);
        assert_eq!(
            program,
            RequirementProgram::Lightweight(hex::decode("deadbeef").unwrap().into())
        );
        assert!(program.expression().is_none());

        let mut dest = vec![];
        program.write_to(&mut dest).unwrap();
        assert_eq!(dest, source);
    }

    #[test]
    fn unknown_kind_rejected() {
        let source = hex::decode("0000000300000001").unwrap();

        assert!(matches!(
            RequirementProgram::parse_payload(&source),
            Err(AppleCodeIdentityError::RequirementUnknownKind(3))
        ));
    }

    #[test]
    fn unknown_opcode_without_flags_rejected() {
        let source = hex::decode("0000000100000063").unwrap();

        assert!(matches!(
            RequirementProgram::parse_payload(&source),
            Err(AppleCodeIdentityError::RequirementUnknownOpcode(0x63))
        ));
    }

    #[test]
    fn unknown_opcode_default_false() {
        // opcode 0x63 with default-false flag, 3 byte payload padded to 4.
        let source = hex::decode("000000018000006300000003aabbcc00").unwrap();

        let expr = parse(&source);
        assert_eq!(
            expr,
            CodeRequirementExpression::UnknownDefaultFalse(
                0x80000063,
                vec![0xaa, 0xbb, 0xcc].into()
            )
        );
        verify_roundtrip(expr, &source);
    }

    #[test]
    fn unknown_opcode_skip() {
        let source = hex::decode("000000014000006300000004aabbccdd00000001").unwrap();

        let expr = parse(&source);
        assert_eq!(
            expr,
            CodeRequirementExpression::UnknownSkipped(
                0x40000063,
                vec![0xaa, 0xbb, 0xcc, 0xdd].into(),
                Box::new(CodeRequirementExpression::True)
            )
        );
        assert_eq!(expr.depth(), 2);
        verify_roundtrip(expr, &source);
    }

    #[test]
    fn known_opcode_ignores_flags() {
        let source = hex::decode("0000000180000001").unwrap();

        assert_eq!(parse(&source), CodeRequirementExpression::True);
    }

    #[test]
    fn excessive_nesting_rejected() {
        let mut source = 1u32.to_be_bytes().to_vec();
        for _ in 0..MAX_PARSE_DEPTH + 5 {
            source.extend_from_slice(&9u32.to_be_bytes());
        }
        source.extend_from_slice(&1u32.to_be_bytes());

        // Unoptimized builds need more than the default test thread stack.
        let too_deep = std::thread::Builder::new()
            .stack_size(64 * 1024 * 1024)
            .spawn(move || {
                matches!(
                    RequirementProgram::parse_payload(&source),
                    Err(AppleCodeIdentityError::RequirementTooDeep(MAX_PARSE_DEPTH))
                )
            })
            .unwrap()
            .join()
            .unwrap();
        assert!(too_deep);

        let mut source = 1u32.to_be_bytes().to_vec();
        for _ in 0..10 {
            source.extend_from_slice(&9u32.to_be_bytes());
        }
        source.extend_from_slice(&1u32.to_be_bytes());
        assert_eq!(parse(&source).depth(), 11);
    }

    #[test]
    fn requirement_type_ordering() {
        assert!(RequirementType::Host < RequirementType::Designated);
        assert!(RequirementType::Designated < RequirementType::Unknown(9));
        assert_eq!(RequirementType::from(3), RequirementType::Designated);
        assert_eq!(u32::from(RequirementType::Unknown(42)), 42);
    }

    #[test]
    fn value_display() {
        assert_eq!(CodeRequirementValue::from(&b"foo"[..]).to_string(), "foo");
        assert_eq!(
            CodeRequirementValue::from(&[0u8, 1][..]).to_string(),
            "0001"
        );
    }
}
