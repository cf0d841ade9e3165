// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Incremental construction of signature superblobs.

use {
    crate::{
        code_directory::CodeDirectoryBlob,
        embedded_signature::{
            create_superblob, Blob, BlobData, BlobWrapperBlob, CodeSigningMagic, CodeSigningSlot,
        },
        error::AppleCodeIdentityError,
    },
    std::collections::BTreeMap,
};

/// Accumulates `(slot, blob)` pairs and serializes them as a superblob.
///
/// There can only be a single blob per slot; last write wins. Blobs are
/// emitted in ascending slot order so identical inputs always produce
/// identical bytes.
#[derive(Debug, Default)]
pub struct EmbeddedSignatureBuilder {
    blobs: BTreeMap<CodeSigningSlot, Vec<u8>>,
}

impl EmbeddedSignatureBuilder {
    /// Register serialized blob bytes (blob header included) into a slot.
    pub fn add_raw(&mut self, slot: CodeSigningSlot, data: Vec<u8>) {
        self.blobs.insert(slot, data);
    }

    /// Register a parsed blob into a slot.
    pub fn add_blob(
        &mut self,
        slot: CodeSigningSlot,
        blob: &BlobData<'_>,
    ) -> Result<(), AppleCodeIdentityError> {
        self.add_raw(slot, blob.to_blob_bytes()?);

        Ok(())
    }

    /// Register a code directory.
    ///
    /// Digests of every blob registered so far are recorded in the code
    /// directory's special slots before it is serialized.
    pub fn add_code_directory(
        &mut self,
        slot: CodeSigningSlot,
        mut cd: CodeDirectoryBlob<'_>,
    ) -> Result<Vec<u8>, AppleCodeIdentityError> {
        if !slot.is_code_directory() {
            return Err(AppleCodeIdentityError::BlobMalformed(
                "code directory registered in non code directory slot",
            ));
        }

        for (existing, data) in &self.blobs {
            if u32::from(*existing) <= u32::from(CodeSigningSlot::EntitlementsDer)
                && !existing.is_code_directory()
            {
                cd.special_hashes
                    .insert(*existing, cd.hash_type.digest_data(data)?.into());
            }
        }

        let cdhash = cd.cdhash()?;
        self.add_raw(slot, cd.to_blob_bytes()?);

        Ok(cdhash)
    }

    /// Add CMS signature data.
    ///
    /// Empty data denotes an ad-hoc signature.
    pub fn add_cms_signature(&mut self, der_data: Vec<u8>) -> Result<(), AppleCodeIdentityError> {
        self.add_raw(
            CodeSigningSlot::Signature,
            BlobWrapperBlob::from_data_owned(der_data).to_blob_bytes()?,
        );

        Ok(())
    }

    /// Whether no blobs have been registered.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Create the embedded signature "superblob" data.
    pub fn create_superblob(&self) -> Result<Vec<u8>, AppleCodeIdentityError> {
        let blobs = self
            .blobs
            .iter()
            .map(|(slot, data)| (*slot, data.clone()))
            .collect::<Vec<_>>();

        create_superblob(CodeSigningMagic::EmbeddedSignature, blobs.iter())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::embedded_signature::{DigestType, EmbeddedSignature, EntitlementsBlob},
    };

    #[test]
    fn slots_emitted_in_ascending_order() -> Result<(), AppleCodeIdentityError> {
        let mut builder = EmbeddedSignatureBuilder::default();
        builder.add_cms_signature(vec![])?;
        builder.add_blob(
            CodeSigningSlot::Entitlements,
            &BlobData::from(EntitlementsBlob::from_string("<dict/>")),
        )?;
        let cdhash = builder.add_code_directory(
            CodeSigningSlot::CodeDirectory,
            CodeDirectoryBlob::new("com.example", DigestType::Sha256)?,
        )?;

        let data = builder.create_superblob()?;
        let sig = EmbeddedSignature::from_bytes(&data)?;

        let slots = sig.blobs.iter().map(|b| b.slot).collect::<Vec<_>>();
        assert_eq!(
            slots,
            vec![
                CodeSigningSlot::CodeDirectory,
                CodeSigningSlot::Entitlements,
                CodeSigningSlot::Signature
            ]
        );

        let cd = sig.code_directory()?.expect("code directory present");
        assert_eq!(cd.cdhash()?, cdhash);
        assert!(cd.special_hash(CodeSigningSlot::Entitlements).is_some());
        assert_eq!(sig.signed_data()?.map(|_| ()), None);

        // Same input, same bytes.
        assert_eq!(builder.create_superblob()?, data);

        Ok(())
    }
}
