// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Resolution of running code to code on disk.

A [Guest] is a running process or the kernel. The [GuestIdentityResolver]
asks a [KernelHost] where a guest's executable lives, opens it as
[StaticCode] and reports the cdhash computed from disk next to the cdhash
the kernel has for the running image. The two may differ if the file was
replaced after it was loaded. Callers decide what a mismatch means.
*/

use {
    crate::{
        error::AppleCodeIdentityError, macho::MachOFile, static_code::StaticCode,
        verification_settings::VerificationSettings,
    },
    log::{debug, warn},
    once_cell::sync::OnceCell,
    std::{
        fmt::{Debug, Display},
        path::PathBuf,
        sync::Arc,
    },
};

/// Running code whose identity can be resolved.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Guest {
    Process {
        pid: i32,
        audit_token: Option<[u8; 32]>,
    },
    Kernel,
}

impl Guest {
    pub fn process(pid: i32) -> Self {
        Self::Process {
            pid,
            audit_token: None,
        }
    }

    /// Process identifier. The kernel is pid 0.
    pub fn pid(&self) -> i32 {
        match self {
            Self::Process { pid, .. } => *pid,
            Self::Kernel => 0,
        }
    }
}

impl Display for Guest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process { pid, .. } => f.write_fmt(format_args!("process {}", pid)),
            Self::Kernel => f.write_str("kernel"),
        }
    }
}

bitflags::bitflags! {
    /// Dynamic code signing status of a running guest.
    pub struct GuestStatus: u32 {
        /// Dynamically valid.
        const VALID = 0x0001;
        /// Ad-hoc signed.
        const ADHOC = 0x0002;
        const GET_TASK_ALLOW = 0x0004;
        const INSTALLER = 0x0008;
        /// Don't load invalid pages.
        const HARD = 0x0100;
        /// Kill the process if it becomes invalid.
        const KILL = 0x0200;
        const CHECK_EXPIRATION = 0x0400;
        const RESTRICT = 0x0800;
        const ENFORCEMENT = 0x1000;
        const REQUIRE_LV = 0x2000;
        const RUNTIME = 0x10000;
        const PLATFORM_BINARY = 0x4000000;
        const DEBUGGED = 0x10000000;
    }
}

/// A change to the dynamic status of a guest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusChange {
    /// Clear the valid bit.
    Invalidate,
    /// Set the hard bit.
    MarkHard,
    /// Set the kill bit.
    MarkKill,
}

/// The kernel's view of running code.
pub trait KernelHost: Debug + Send + Sync {
    /// Path of the executable backing a guest.
    fn executable_path(&self, guest: &Guest) -> Result<PathBuf, AppleCodeIdentityError>;

    /// File offset of the architecture slice the guest is running.
    fn load_offset(&self, guest: &Guest) -> Result<u64, AppleCodeIdentityError>;

    /// The cdhash the kernel recorded for the running image.
    fn cdhash(&self, guest: &Guest) -> Result<Option<Vec<u8>>, AppleCodeIdentityError>;

    fn status(&self, guest: &Guest) -> Result<GuestStatus, AppleCodeIdentityError>;

    fn change_status(
        &self,
        guest: &Guest,
        change: StatusChange,
    ) -> Result<(), AppleCodeIdentityError>;
}

/// The resolved identity of a guest.
#[derive(Clone, Debug)]
pub struct GuestIdentity {
    pub static_code: Arc<StaticCode>,
    /// cdhash reported by the kernel.
    pub kernel_cdhash: Option<Vec<u8>>,
    /// cdhash computed from the file on disk.
    pub computed_cdhash: Option<Vec<u8>>,
}

impl GuestIdentity {
    /// Whether the kernel and on-disk hashes agree.
    ///
    /// `None` if either hash is unavailable.
    pub fn hashes_match(&self) -> Option<bool> {
        match (&self.kernel_cdhash, &self.computed_cdhash) {
            (Some(kernel), Some(computed)) => Some(kernel == computed),
            _ => None,
        }
    }
}

/// Maps guests to their code on disk.
#[derive(Debug)]
pub struct GuestIdentityResolver {
    host: Box<dyn KernelHost>,
    settings: VerificationSettings,
    kernel: OnceCell<Arc<StaticCode>>,
}

impl GuestIdentityResolver {
    pub fn new(host: Box<dyn KernelHost>, settings: VerificationSettings) -> Self {
        Self {
            host,
            settings,
            kernel: OnceCell::new(),
        }
    }

    fn open(&self, guest: &Guest, offset: Option<u64>) -> Result<StaticCode, AppleCodeIdentityError> {
        let path = self.host.executable_path(guest)?;

        let file = match offset {
            Some(offset) => MachOFile::open_at_offset(&path, offset),
            None => MachOFile::open(&path, self.settings.preferred_architecture()),
        }
        .map_err(|e| match e {
            AppleCodeIdentityError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                AppleCodeIdentityError::GuestUnresolvable(format!(
                    "{} ({} not found)",
                    guest,
                    path.display()
                ))
            }
            e => e,
        })?;

        Ok(StaticCode::new(Box::new(file)))
    }

    /// The kernel's code on disk.
    ///
    /// Constructed once and shared afterwards.
    pub fn kernel_code(&self) -> Result<Arc<StaticCode>, AppleCodeIdentityError> {
        self.kernel
            .get_or_try_init(|| self.open(&Guest::Kernel, None).map(Arc::new))
            .map(Arc::clone)
    }

    /// Resolve a guest to its code on disk.
    ///
    /// Processes are resolved anew on every call. The kernel reports no
    /// cdhash for itself, so no hashes are reported for it.
    pub fn resolve(&self, guest: &Guest) -> Result<GuestIdentity, AppleCodeIdentityError> {
        if let Guest::Kernel = guest {
            return Ok(GuestIdentity {
                static_code: self.kernel_code()?,
                kernel_cdhash: None,
                computed_cdhash: None,
            });
        }

        let offset = self.host.load_offset(guest)?;
        let static_code = self.open(guest, Some(offset))?;
        let computed_cdhash = static_code.cdhash()?;

        let kernel_cdhash = match self.host.cdhash(guest) {
            Ok(hash) => hash,
            Err(e) if computed_cdhash.is_none() => {
                debug!("{} is unsigned; no kernel cdhash: {}", guest, e);
                None
            }
            Err(e) => return Err(e),
        };

        let identity = GuestIdentity {
            static_code: Arc::new(static_code),
            kernel_cdhash,
            computed_cdhash,
        };

        if identity.hashes_match() == Some(false) {
            warn!(
                "{}: kernel cdhash {} differs from {} on disk",
                guest,
                hex::encode(identity.kernel_cdhash.as_deref().unwrap_or_default()),
                hex::encode(identity.computed_cdhash.as_deref().unwrap_or_default())
            );
        }

        Ok(identity)
    }

    /// The dynamic status of a guest, as reported by the kernel.
    pub fn status(&self, guest: &Guest) -> Result<GuestStatus, AppleCodeIdentityError> {
        self.host.status(guest)
    }

    /// Ask the kernel to change the dynamic status of a guest.
    pub fn change_status(
        &self,
        guest: &Guest,
        change: StatusChange,
    ) -> Result<(), AppleCodeIdentityError> {
        debug!("requesting {:?} for {}", change, guest);
        self.host.change_status(guest, change)
    }
}
