// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code verification settings.

use {
    crate::{
        archive::ArchiveSignatureProvider,
        fragments::{DirectoryFragmentSource, FragmentCache, FragmentSource},
        policy::ExecutionPolicyFragmentSource,
    },
    goblin::mach::cputype::{
        CpuType, CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_ARM64_32, CPU_TYPE_X86, CPU_TYPE_X86_64,
    },
    log::{info, warn},
    once_cell::sync::OnceCell,
    std::{
        collections::BTreeSet,
        path::{Path, PathBuf},
        sync::Arc,
    },
};

/// Default limit on requirement expression nesting during evaluation.
pub const DEFAULT_MAX_REQUIREMENT_DEPTH: usize = 1000;

/// Environment variable holding additional trusted anchors.
///
/// The value is a comma-delimited list of hex encoded SHA-1 certificate hashes.
pub const ADDITIONAL_ANCHORS_ENV: &str = "APPLE_CODE_IDENTITY_ADDITIONAL_ANCHORS";

static ADDITIONAL_TRUSTED_ANCHORS: OnceCell<BTreeSet<Vec<u8>>> = OnceCell::new();

fn parse_anchor_list(value: &str) -> BTreeSet<Vec<u8>> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| match hex::decode(s) {
            Ok(hash) if hash.len() == 20 => Some(hash),
            _ => {
                warn!("ignoring malformed additional trusted anchor {}", s);
                None
            }
        })
        .collect()
}

/// Install the process-wide additional trusted anchors.
///
/// This can only happen once and must happen before the first evaluation
/// consulting the anchors. Otherwise the anchors are read from
/// [ADDITIONAL_ANCHORS_ENV] on first use. Returns the rejected set if anchors
/// were already installed.
pub fn install_additional_trusted_anchors(
    anchors: impl IntoIterator<Item = Vec<u8>>,
) -> Result<(), BTreeSet<Vec<u8>>> {
    ADDITIONAL_TRUSTED_ANCHORS.set(anchors.into_iter().collect())
}

/// The process-wide additional trusted anchors.
pub fn additional_trusted_anchors() -> &'static BTreeSet<Vec<u8>> {
    ADDITIONAL_TRUSTED_ANCHORS.get_or_init(|| match std::env::var(ADDITIONAL_ANCHORS_ENV) {
        Ok(value) => {
            let anchors = parse_anchor_list(&value);
            info!(
                "loaded {} additional trusted anchors from {}",
                anchors.len(),
                ADDITIONAL_ANCHORS_ENV
            );
            anchors
        }
        Err(_) => BTreeSet::new(),
    })
}

/// Resolve a Mach-O architecture name to its CPU type.
pub fn cpu_type_from_name(name: &str) -> Option<CpuType> {
    match name {
        "arm" => Some(CPU_TYPE_ARM),
        "arm64" | "arm64e" => Some(CPU_TYPE_ARM64),
        "arm64_32" => Some(CPU_TYPE_ARM64_32),
        "i386" | "x86" => Some(CPU_TYPE_X86),
        "x86_64" => Some(CPU_TYPE_X86_64),
        _ => None,
    }
}

/// Represents code verification settings.
///
/// An instance is handed to every operation that opens or evaluates code.
/// All collections are empty and online services disabled by default.
#[derive(Clone, Debug)]
pub struct VerificationSettings {
    max_requirement_depth: usize,
    preferred_architecture: Option<CpuType>,
    trust_cache: BTreeSet<Vec<u8>>,
    additional_trusted_anchors: Option<BTreeSet<Vec<u8>>>,
    trusted_certificates: BTreeSet<Vec<u8>>,
    legacy_developer_ids: BTreeSet<Vec<u8>>,
    fragment_directory: Option<PathBuf>,
    online_notarization: bool,
    archive_signature_provider: Option<Arc<dyn ArchiveSignatureProvider>>,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            max_requirement_depth: DEFAULT_MAX_REQUIREMENT_DEPTH,
            preferred_architecture: None,
            trust_cache: BTreeSet::new(),
            additional_trusted_anchors: None,
            trusted_certificates: BTreeSet::new(),
            legacy_developer_ids: BTreeSet::new(),
            fragment_directory: None,
            online_notarization: false,
            archive_signature_provider: None,
        }
    }
}

impl VerificationSettings {
    /// Maximum nesting of requirement expressions during evaluation.
    pub fn max_requirement_depth(&self) -> usize {
        self.max_requirement_depth
    }

    /// Set the maximum nesting of requirement expressions during evaluation.
    pub fn set_max_requirement_depth(&mut self, depth: usize) {
        self.max_requirement_depth = depth;
    }

    /// The Mach-O architecture to select from universal binaries.
    ///
    /// When `None`, the first architecture is used.
    pub fn preferred_architecture(&self) -> Option<CpuType> {
        self.preferred_architecture
    }

    pub fn set_preferred_architecture(&mut self, cpu_type: CpuType) {
        info!("preferring Mach-O CPU type {}", cpu_type);
        self.preferred_architecture = Some(cpu_type);
    }

    /// Set the preferred architecture from a name like `arm64` or `x86_64`.
    ///
    /// Returns false if the name isn't recognized.
    pub fn set_preferred_architecture_name(&mut self, name: &str) -> bool {
        match cpu_type_from_name(name) {
            Some(cpu_type) => {
                self.set_preferred_architecture(cpu_type);
                true
            }
            None => false,
        }
    }

    /// Whether a cdhash is in the local trust cache.
    ///
    /// Code in the trust cache satisfies `anchor apple`.
    pub fn trust_cache_contains(&self, cdhash: &[u8]) -> bool {
        self.trust_cache.contains(cdhash)
    }

    pub fn add_trust_cache_cdhash(&mut self, cdhash: impl Into<Vec<u8>>) {
        self.trust_cache.insert(cdhash.into());
    }

    /// The additional trusted anchors consulted by `anchor apple`.
    ///
    /// Anchors set on these settings take precedence over the process-wide
    /// set from [additional_trusted_anchors()].
    pub fn additional_trusted_anchors(&self) -> &BTreeSet<Vec<u8>> {
        match &self.additional_trusted_anchors {
            Some(anchors) => anchors,
            None => additional_trusted_anchors(),
        }
    }

    /// Add an additional trusted anchor by its SHA-1 certificate hash.
    pub fn add_additional_trusted_anchor(&mut self, hash: impl Into<Vec<u8>>) {
        self.additional_trusted_anchors
            .get_or_insert_with(BTreeSet::new)
            .insert(hash.into());
    }

    /// SHA-1 hashes of certificates trusted for code signing.
    pub fn trusted_certificates(&self) -> &BTreeSet<Vec<u8>> {
        &self.trusted_certificates
    }

    pub fn add_trusted_certificate(&mut self, hash: impl Into<Vec<u8>>) {
        self.trusted_certificates.insert(hash.into());
    }

    /// Whether a cdhash is on the legacy Developer ID allow list.
    pub fn is_legacy_developer_id(&self, cdhash: &[u8]) -> bool {
        self.legacy_developer_ids.contains(cdhash)
    }

    pub fn add_legacy_developer_id(&mut self, cdhash: impl Into<Vec<u8>>) {
        self.legacy_developer_ids.insert(cdhash.into());
    }

    /// Directory holding `.subreq` and `.anchorreq` requirement fragments.
    pub fn fragment_directory(&self) -> Option<&Path> {
        self.fragment_directory.as_deref()
    }

    pub fn set_fragment_directory(&mut self, path: impl AsRef<Path>) {
        self.fragment_directory = Some(path.as_ref().to_path_buf());
    }

    /// Obtain the fragment cache to evaluate requirements with.
    ///
    /// The first caller to resolve the process-wide cache determines its
    /// sources. If a fragment directory is configured after that, it is
    /// ignored with a warning.
    pub fn fragment_cache(&self) -> &'static FragmentCache {
        if let Some(dir) = &self.fragment_directory {
            let sources: Vec<Box<dyn FragmentSource>> = vec![
                Box::new(DirectoryFragmentSource::new(dir)),
                Box::new(ExecutionPolicyFragmentSource::default()),
            ];

            if FragmentCache::install_global(FragmentCache::new(sources)).is_err() {
                warn!(
                    "fragment cache already initialized; ignoring fragment directory {}",
                    dir.display()
                );
            }
        }

        FragmentCache::global()
    }

    /// Whether notarization tickets may be looked up online.
    pub fn online_notarization(&self) -> bool {
        self.online_notarization
    }

    pub fn set_online_notarization(&mut self, enabled: bool) {
        self.online_notarization = enabled;
    }

    /// Collaborator reading signatures of installer archives.
    ///
    /// Archives can't be opened without one.
    pub fn archive_signature_provider(&self) -> Option<Arc<dyn ArchiveSignatureProvider>> {
        self.archive_signature_provider.clone()
    }

    pub fn set_archive_signature_provider(&mut self, provider: Arc<dyn ArchiveSignatureProvider>) {
        self.archive_signature_provider = Some(provider);
    }
}
