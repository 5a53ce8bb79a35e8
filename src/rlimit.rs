//! Process resource limits
//!
//! A replay with many workers and an OPEN-heavy trace can hold a lot of
//! descriptors at once. Limits are raised best-effort before the pool
//! starts; failing to raise them is a warning, not an error.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{SET_RLIMIT_NOFILE, SET_RLIMIT_NPROC};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RlimitConfig {
    /// Raise limits at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Max open files
    #[serde(default = "default_nofile")]
    pub nofile: u64,

    /// Max processes/threads
    #[serde(default = "default_nproc")]
    pub nproc: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_nofile() -> u64 {
    SET_RLIMIT_NOFILE
}

fn default_nproc() -> u64 {
    SET_RLIMIT_NPROC
}

impl Default for RlimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            nofile: SET_RLIMIT_NOFILE,
            nproc: SET_RLIMIT_NPROC,
        }
    }
}

/// Resulting soft limits (`None` where unknown or unsupported)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedLimits {
    pub nofile: Option<u64>,
    pub nproc: Option<u64>,
}

pub fn raise_limits(cfg: &RlimitConfig) -> AppliedLimits {
    if !cfg.enabled {
        debug!("Resource limit adjustment disabled");
        return AppliedLimits::default();
    }
    imp::raise_limits(cfg)
}

#[cfg(unix)]
mod imp {
    use super::*;
    use std::io;

    pub fn raise_limits(cfg: &RlimitConfig) -> AppliedLimits {
        AppliedLimits {
            nofile: raise(libc::RLIMIT_NOFILE as i32, "RLIMIT_NOFILE", cfg.nofile),
            nproc: raise(libc::RLIMIT_NPROC as i32, "RLIMIT_NPROC", cfg.nproc),
        }
    }

    fn get(resource: i32) -> io::Result<libc::rlimit> {
        let mut lim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: `lim` is a valid, writable rlimit
        let rc = unsafe { libc::getrlimit(resource as _, &mut lim) };
        if rc == 0 {
            Ok(lim)
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn set(resource: i32, lim: &libc::rlimit) -> io::Result<()> {
        // SAFETY: `lim` points to a valid rlimit
        let rc = unsafe { libc::setrlimit(resource as _, lim) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Raise the soft limit to `wanted`, lifting the hard limit too when
    /// permitted. Falls back to the hard limit as the soft limit.
    fn raise(resource: i32, name: &str, wanted: u64) -> Option<u64> {
        let current = match get(resource) {
            Ok(l) => l,
            Err(e) => {
                warn!("getrlimit({}) failed: {}", name, e);
                return None;
            }
        };
        let wanted = wanted as libc::rlim_t;
        if current.rlim_cur >= wanted {
            debug!("{} already {} (wanted {})", name, current.rlim_cur, wanted);
            return Some(current.rlim_cur as u64);
        }

        let both = libc::rlimit {
            rlim_cur: wanted,
            rlim_max: current.rlim_max.max(wanted),
        };
        if set(resource, &both).is_ok() {
            debug!("{} raised to {}", name, wanted);
            return Some(wanted as u64);
        }

        let capped = libc::rlimit {
            rlim_cur: wanted.min(current.rlim_max),
            rlim_max: current.rlim_max,
        };
        match set(resource, &capped) {
            Ok(()) => {
                if capped.rlim_cur < wanted {
                    warn!(
                        "{} capped at hard limit {} (wanted {})",
                        name, capped.rlim_cur, wanted
                    );
                }
                Some(capped.rlim_cur as u64)
            }
            Err(e) => {
                warn!("setrlimit({}) failed: {}", name, e);
                Some(current.rlim_cur as u64)
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::*;

    pub fn raise_limits(_cfg: &RlimitConfig) -> AppliedLimits {
        debug!("Resource limits are not adjustable on this platform");
        AppliedLimits::default()
    }
}
