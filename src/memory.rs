//! Memory size handling and resident-set sampling.
//!
//! The worker restart threshold is given on the command line in KiB; the
//! sampler reports the process's maximum resident set size in the same
//! units so the two can be compared directly.

use std::fmt;

/// A memory size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemorySize(u64);

impl MemorySize {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    pub const fn as_kib(&self) -> u64 {
        self.0 / 1024
    }

    pub const fn as_mib(&self) -> u64 {
        self.0 / (1024 * 1024)
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 && self.0 % (1024 * 1024) == 0 {
            write!(f, "{}MiB", self.as_mib())
        } else {
            write!(f, "{}KiB", self.as_kib())
        }
    }
}

/// Sample this process's maximum resident set size.
///
/// `getrusage()` reports `ru_maxrss` in kilobytes on Linux and in bytes on
/// macOS.
pub fn max_rss() -> MemorySize {
    use nix::sys::resource::{getrusage, UsageWho};

    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let max_rss = usage.max_rss().max(0) as u64;

            #[cfg(target_os = "macos")]
            {
                MemorySize::from_bytes(max_rss)
            }

            #[cfg(not(target_os = "macos"))]
            {
                MemorySize::from_kib(max_rss)
            }
        }
        Err(_) => MemorySize::from_bytes(0),
    }
}
