// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code identity and trust evaluation for Apple platforms.
//!
//! This crate answers the question "is this code what it claims to be, and
//! does it satisfy a given policy?" for code signed with Apple's code signing
//! scheme. It does so without a dependency on an Apple operating system.
//!
//! # Features and Capabilities
//!
//! This crate can:
//!
//! * Parse and construct the signature superblob embedded in signed code.
//!   (See [EmbeddedSignature] and [EmbeddedSignatureBuilder].)
//! * Locate signatures inside several container formats: Mach-O binaries
//!   (thin and universal), encrypted disk images carrying an authentication
//!   table, UDIF disk images and installer archives. (See the
//!   [DiskRepresentation] trait and [open_disk_representation()].)
//! * Rewrite the signature of an encrypted disk image in place, repacking
//!   its authentication table. (See [EncryptedImage::write_signature].)
//! * Evaluate compiled code requirement programs against signed code,
//!   including certificate field and policy OID checks, entitlement and
//!   Info.plist matching, Apple anchor checks and notarization checks.
//!   (See [EvaluationContext] and [RequirementValidator].)
//! * Resolve named requirement fragments from disk or the built-in
//!   execution policy. (See [FragmentCache].)
//! * Resolve running guests (processes and the kernel) to their code on
//!   disk and compare kernel and computed cdhashes. (See
//!   [GuestIdentityResolver].)
//! * Read notarization tickets stapled to code and look tickets up online.
//!   (See [NotarizationChecker] and [read_stapled_ticket()].)
//!
//! Things this crate does not do:
//!
//! * Sign code. Signatures are consumed and validated, never produced (the
//!   superblob builder exists to assemble signature data, not to sign it).
//! * Verify the cryptographic digests of code pages. Identity is derived
//!   from the code directory and its hash.
//! * Compile the code requirements DSL. Programs are consumed in binary form
//!   and can be rendered back to the DSL.
//!
//! # Crate Layout
//!
//! [VerificationSettings] carries every knob consulted while opening and
//! evaluating code. [StaticCode] binds a disk representation to the views
//! requirement evaluation needs. The remaining modules are organized by
//! the container format or signature component they deal with.

pub mod archive;
pub use archive::*;
pub mod auth_table;
pub use auth_table::{AuthTable, AuthTableEntry};
mod certificate;
pub use certificate::*;
mod code_directory;
pub use code_directory::*;
pub mod code_requirement;
pub use code_requirement::*;
mod disk_rep;
pub use disk_rep::*;
pub mod dmg;
pub use dmg::DmgFile;
pub mod embedded_signature;
pub use embedded_signature::*;
mod embedded_signature_builder;
pub use embedded_signature_builder::*;
pub mod encrypted_image;
pub use encrypted_image::{EncryptedImage, EncryptedImageHeader};
mod error;
pub use error::*;
mod fragments;
pub use fragments::*;
pub mod guest;
pub use guest::*;
pub mod macho;
pub use macho::{MachOFile, SliceSelector};
pub mod notarization;
pub use notarization::*;
mod policy;
pub use policy::*;
mod requirement_interpreter;
pub use requirement_interpreter::*;
mod requirement_match;
pub use requirement_match::*;
pub mod stapling;
pub use stapling::read_stapled_ticket;
mod static_code;
pub use static_code::*;
pub mod ticket_lookup;
mod verification_settings;
pub use verification_settings::*;

#[cfg(test)]
mod testutil;
