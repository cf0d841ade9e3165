// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Named requirement fragments.

Requirements can refer to other requirements by name: `anchor apple <name>`
resolves a named anchor requirement and `(<name>)` a named sub-requirement.
Fragments are requirement blobs, header magic and all.

Resolved fragments are memoized in a [FragmentCache]. Misses are cached too,
so an absent fragment is only probed once.
*/

use {
    crate::{code_requirement::RequirementProgram, error::AppleCodeIdentityError},
    log::{debug, warn},
    once_cell::sync::OnceCell,
    std::{
        collections::HashMap,
        fmt::Debug,
        path::{Path, PathBuf},
        sync::{Arc, Mutex, MutexGuard, PoisonError},
    },
};

/// The flavor of a named fragment.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FragmentKind {
    /// A named sub-requirement, `(<name>)`.
    SubRequirement,
    /// A named anchor requirement, `anchor apple <name>`.
    AnchorRequirement,
}

impl FragmentKind {
    /// File extension used by on-disk fragments.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::SubRequirement => "subreq",
            Self::AnchorRequirement => "anchorreq",
        }
    }
}

/// Something that can produce requirement fragment bytes by name.
pub trait FragmentSource: Debug + Send + Sync {
    /// Load the raw blob of a fragment.
    ///
    /// Returns `Ok(None)` if this source doesn't have the fragment.
    fn load(&self, name: &str, kind: FragmentKind)
        -> Result<Option<Vec<u8>>, AppleCodeIdentityError>;
}

/// Loads fragments from `<root>/<name>.subreq` and `<root>/<name>.anchorreq`.
#[derive(Clone, Debug)]
pub struct DirectoryFragmentSource {
    root: PathBuf,
}

impl DirectoryFragmentSource {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FragmentSource for DirectoryFragmentSource {
    fn load(
        &self,
        name: &str,
        kind: FragmentKind,
    ) -> Result<Option<Vec<u8>>, AppleCodeIdentityError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            warn!("refusing to resolve fragment with unsafe name {:?}", name);
            return Ok(None);
        }

        let path = self.root.join(format!("{}.{}", name, kind.extension()));

        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Fragments held in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryFragmentSource {
    fragments: HashMap<(String, FragmentKind), Vec<u8>>,
}

impl MemoryFragmentSource {
    /// Register a fragment from its requirement blob bytes.
    pub fn insert(&mut self, name: impl ToString, kind: FragmentKind, blob: Vec<u8>) {
        self.fragments.insert((name.to_string(), kind), blob);
    }

    /// Register a fragment from a parsed program.
    pub fn insert_program(
        &mut self,
        name: impl ToString,
        kind: FragmentKind,
        program: &RequirementProgram<'_>,
    ) -> Result<(), AppleCodeIdentityError> {
        self.insert(name, kind, program.to_blob_data()?);

        Ok(())
    }
}

impl FragmentSource for MemoryFragmentSource {
    fn load(
        &self,
        name: &str,
        kind: FragmentKind,
    ) -> Result<Option<Vec<u8>>, AppleCodeIdentityError> {
        Ok(self.fragments.get(&(name.to_string(), kind)).cloned())
    }
}

type FragmentKey = (String, FragmentKind);

/// Memoizes fragment resolution over an ordered list of sources.
///
/// The first source having a fragment wins.
#[derive(Debug)]
pub struct FragmentCache {
    sources: Vec<Box<dyn FragmentSource>>,
    entries: Mutex<HashMap<FragmentKey, Option<Arc<Vec<u8>>>>>,
}

static GLOBAL: OnceCell<FragmentCache> = OnceCell::new();

impl FragmentCache {
    pub fn new(sources: Vec<Box<dyn FragmentSource>>) -> Self {
        Self {
            sources,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Install the process-wide cache.
    ///
    /// Fails, handing the cache back, if one is already installed.
    pub fn install_global(cache: FragmentCache) -> Result<(), FragmentCache> {
        GLOBAL.set(cache)
    }

    /// The process-wide cache.
    ///
    /// Unless another cache was installed first, this resolves the built-in
    /// execution policy anchors only.
    pub fn global() -> &'static FragmentCache {
        GLOBAL.get_or_init(|| {
            Self::new(vec![Box::new(
                crate::policy::ExecutionPolicyFragmentSource::default(),
            )])
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FragmentKey, Option<Arc<Vec<u8>>>>> {
        // Entries are only ever inserted whole, so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(
        &self,
        name: &str,
        kind: FragmentKind,
    ) -> Result<Option<Arc<Vec<u8>>>, AppleCodeIdentityError> {
        for source in &self.sources {
            if let Some(data) = source.load(name, kind)? {
                return Ok(match RequirementProgram::parse_blob(&data) {
                    Ok(_) => Some(Arc::new(data)),
                    Err(e) => {
                        warn!("ignoring malformed {} fragment {}: {}", kind.extension(), name, e);
                        None
                    }
                });
            }
        }

        Ok(None)
    }

    /// Resolve a fragment to its validated requirement blob.
    ///
    /// The returned bytes are known to parse as a requirement program.
    pub fn get(
        &self,
        name: &str,
        kind: FragmentKind,
    ) -> Result<Option<Arc<Vec<u8>>>, AppleCodeIdentityError> {
        let key = (name.to_string(), kind);

        if let Some(entry) = self.lock().get(&key) {
            return Ok(entry.clone());
        }

        let loaded = self.load(name, kind)?;

        if loaded.is_none() {
            debug!("no {} fragment named {}", kind.extension(), name);
        }

        // A concurrent resolution may have won the race; keep the first result.
        Ok(self.lock().entry(key).or_insert(loaded).clone())
    }

    /// Whether resolution of a fragment has been attempted.
    pub fn contains(&self, name: &str, kind: FragmentKind) -> bool {
        self.lock().contains_key(&(name.to_string(), kind))
    }

    /// Forget everything resolved so far.
    pub fn clear(&self) {
        self.lock().clear();
    }
}
