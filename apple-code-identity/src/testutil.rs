// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixtures shared by unit tests.

use x509_certificate::{
    CapturedX509Certificate, EcdsaCurve, InMemorySigningKeyPair, KeyAlgorithm,
    X509CertificateBuilder,
};

/// Self-signed RSA certificate.
///
/// Subject and issuer are `C=US, ST=California, O=testing, OU=unit, CN=Unit Tester`.
const UNIT_TESTER_CERTIFICATE: &str = "-----BEGIN CERTIFICATE-----\n\
        MIIDkzCCAnugAwIBAgIUDNhjvv6ol8EZG5YhNniO4pAiUQEwDQYJKoZIhvcNAQEL\n\
        BQAwWTELMAkGA1UEBhMCVVMxEzARBgNVBAgMCkNhbGlmb3JuaWExEDAOBgNVBAoM\n\
        B3Rlc3RpbmcxDTALBgNVBAsMBHVuaXQxFDASBgNVBAMMC1VuaXQgVGVzdGVyMB4X\n\
        DTIxMDMxNjE2MDkyOFoXDTI2MDkwNjE2MDkyOFowWTELMAkGA1UEBhMCVVMxEzAR\n\
        BgNVBAgMCkNhbGlmb3JuaWExEDAOBgNVBAoMB3Rlc3RpbmcxDTALBgNVBAsMBHVu\n\
        aXQxFDASBgNVBAMMC1VuaXQgVGVzdGVyMIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8A\n\
        MIIBCgKCAQEAtqxfPHnHz95bJ4ttY5xpuyKjBuEchuZ7l5cqpo2XbzlubY6J0co8\n\
        RSbnKfBsqaSsLLBFbhuKIZg2IqTXR3DI1cdazKZROhWU70Qu0bhYJhWNDy3XQxbR\n\
        alItmdUQpFv/kPHm0UZYa+D4/6hrCg8xyIHJgAzl8yKs5TvpQPcaHcQn0+mstHIx\n\
        tVi9fgIH+54Muzr1a/wg3+KW76KB2fXvkmZk7Nf4F1UA7xGXApO4R9dhwW+yPzRw\n\
        7nDhBO5CZJV1RrsG+fjIcP4CqCxHGeuOCuiWnPAB/TVTOjHTTMcmbeqUdKtPKKnq\n\
        Mz/mKCIQ67ZUS5ETM8N1Utv79dMYfu0g8wIDAQABo1MwUTAdBgNVHQ4EFgQUkiWC\n\
        PwIRoykbi6mtOjWNR0X1eFEwHwYDVR0jBBgwFoAUkiWCPwIRoykbi6mtOjWNR0X1\n\
        eFEwDwYDVR0TAQH/BAUwAwEB/zANBgkqhkiG9w0BAQsFAAOCAQEAAN4plkAcXZIx\n\
        4KqM5AueYqYtR1y8HAaVz+5BKAWyiQJxhktAJJr7o8Yafde7SrUMfEVGDvPa2xuG\n\
        xhx5d2L3G/FDUhHbsmM3Yp3XTGkS5VwH2nHi6x4HBEpLJZfTbbTDQgS1AdtrQg0V\n\
        VY4ph7n/F0sjJL9pmpTdRx1Z2OrwYpJfWOEIA3NDflYvby9Ubb29uVRsFWrgBijl\n\
        3NIzXHvoJ2Fd+Crkc43+wWZ55hcbwSgkC1/T1mFNzd4klwncH4Rqw2KDkEFdWKmM\n\
        CiRnpyZ52+8FW64s952/SGtMs4P3fFNnWpL3njNDnfxa+r+aWDtz12PJc5FyzlkC\n\
        P4ysBX3CuA==\n\
        -----END CERTIFICATE-----";

pub fn unit_tester_certificate() -> CapturedX509Certificate {
    CapturedX509Certificate::from_pem(UNIT_TESTER_CERTIFICATE.as_bytes()).unwrap()
}

/// Generate an ECDSA certificate and its key pair.
///
/// The certificate names `issuer` as its issuer when given but is always
/// signed by its own key.
pub fn generated_certificate(
    common_name: &str,
    organization: Option<&str>,
    issuer: Option<&CapturedX509Certificate>,
) -> (CapturedX509Certificate, InMemorySigningKeyPair) {
    let mut builder = X509CertificateBuilder::new(KeyAlgorithm::Ecdsa(EcdsaCurve::Secp256r1));
    builder
        .subject()
        .append_common_name_utf8_string(common_name)
        .unwrap();
    if let Some(organization) = organization {
        builder
            .subject()
            .append_organization_utf8_string(organization)
            .unwrap();
    }
    if let Some(issuer) = issuer {
        *builder.issuer() = issuer.subject_name().clone();
    }

    let (cert, key_pair, _) = builder.create_with_random_keypair().unwrap();

    (cert, key_pair)
}

/// Build a minimal little-endian arm64 Mach-O executable.
///
/// The binary has no segments. An `LC_UUID` command is emitted when `uuid` is
/// given. An `LC_CODE_SIGNATURE` command pointing at `signature`, appended at
/// the next 16 byte boundary, is emitted when `signature` is given.
pub fn synthetic_macho(uuid: Option<[u8; 16]>, signature: Option<&[u8]>) -> Vec<u8> {
    synthetic_macho_with_info_plist(uuid, None, signature)
}

fn name16(name: &str) -> [u8; 16] {
    let mut res = [0u8; 16];
    res[..name.len()].copy_from_slice(name.as_bytes());
    res
}

/// Like [synthetic_macho], optionally with a `__TEXT` segment holding an
/// `__info_plist` section.
///
/// The section data follows the load commands at the next 16 byte boundary.
pub fn synthetic_macho_with_info_plist(
    uuid: Option<[u8; 16]>,
    info_plist: Option<&[u8]>,
    signature: Option<&[u8]>,
) -> Vec<u8> {
    let mut commands = Vec::new();
    let mut ncmds = 0u32;

    if let Some(uuid) = uuid {
        commands.extend_from_slice(&0x1bu32.to_le_bytes());
        commands.extend_from_slice(&24u32.to_le_bytes());
        commands.extend_from_slice(&uuid);
        ncmds += 1;
    }

    let segment_size = if info_plist.is_some() { 72 + 80 } else { 0 };
    let sizeofcmds =
        (commands.len() + segment_size) as u32 + if signature.is_some() { 16 } else { 0 };
    let commands_end = 32 + sizeofcmds as usize;
    let plist_offset = (commands_end + 15) & !15;
    let plist_end = plist_offset + info_plist.map(|data| data.len()).unwrap_or(0);
    let dataoff = (plist_end + 15) & !15;

    if let Some(info_plist) = info_plist {
        // LC_SEGMENT_64
        commands.extend_from_slice(&0x19u32.to_le_bytes());
        commands.extend_from_slice(&(segment_size as u32).to_le_bytes());
        commands.extend_from_slice(&name16("__TEXT"));
        commands.extend_from_slice(&0u64.to_le_bytes());
        commands.extend_from_slice(&(plist_end as u64).to_le_bytes());
        commands.extend_from_slice(&0u64.to_le_bytes());
        commands.extend_from_slice(&(plist_end as u64).to_le_bytes());
        commands.extend_from_slice(&5u32.to_le_bytes());
        commands.extend_from_slice(&5u32.to_le_bytes());
        commands.extend_from_slice(&1u32.to_le_bytes());
        commands.extend_from_slice(&0u32.to_le_bytes());

        // section_64
        commands.extend_from_slice(&name16("__info_plist"));
        commands.extend_from_slice(&name16("__TEXT"));
        commands.extend_from_slice(&(plist_offset as u64).to_le_bytes());
        commands.extend_from_slice(&(info_plist.len() as u64).to_le_bytes());
        commands.extend_from_slice(&(plist_offset as u32).to_le_bytes());
        commands.extend_from_slice(&[0u8; 28]);
        ncmds += 1;
    }

    if let Some(signature) = signature {
        commands.extend_from_slice(&0x1du32.to_le_bytes());
        commands.extend_from_slice(&16u32.to_le_bytes());
        commands.extend_from_slice(&(dataoff as u32).to_le_bytes());
        commands.extend_from_slice(&(signature.len() as u32).to_le_bytes());
        ncmds += 1;
    }

    let mut data = Vec::new();
    data.extend_from_slice(&0xfeedfacfu32.to_le_bytes());
    data.extend_from_slice(&0x0100000cu32.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&2u32.to_le_bytes());
    data.extend_from_slice(&ncmds.to_le_bytes());
    data.extend_from_slice(&sizeofcmds.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&commands);

    if let Some(info_plist) = info_plist {
        data.resize(plist_offset, 0);
        data.extend_from_slice(info_plist);
    }

    if let Some(signature) = signature {
        data.resize(dataoff, 0);
        data.extend_from_slice(signature);
    } else {
        let len = data.len().max(64);
        data.resize(len, 0);
    }

    data
}

/// Route log output through the test harness.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
