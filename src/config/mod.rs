//! # Log Configuration Module
//!
//! Centralizes all configuration for the log: compile-time constants with
//! documented interdependencies live in [`constants`], runtime knobs live on
//! [`LogConfig`]. Interdependent values are co-located and enforced through
//! compile-time assertions so a change to one cannot silently invalidate
//! another.

pub mod constants;

pub use constants::*;

use std::path::{Path, PathBuf};

/// Deletion timing for purged log files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PurgePolicy {
    /// Unlink files inside the `purge()` call.
    #[default]
    Immediate,
    /// Queue files and unlink them at the end of the next flush.
    AtNextFlush,
}

/// Runtime configuration for a [`Log`](crate::Log) instance.
///
/// Page size, sector size, and buffer geometry are compile-time constants
/// (see [`constants`]); everything that can vary per deployment is here.
/// The file size cap can additionally be changed on a live log via
/// [`Log::set_file_max_size`](crate::Log::set_file_max_size).
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory holding the `translog.NNNNNN` files.
    pub dir: PathBuf,
    /// Maximum size of one log file in bytes. Must be a multiple of
    /// [`PAGE_SIZE`] and at least [`MIN_FILE_MAX_SIZE`].
    pub file_max_size: u32,
    /// Store a CRC32 over each finalized page.
    pub use_crc: bool,
    /// Store per-sector write-generation bytes to detect torn writes.
    pub use_sector_protection: bool,
    /// Fsync the log directory after a flush that created a new file.
    pub sync_directory: bool,
    /// Capacity of the read-side page cache, in pages.
    pub cache_pages: usize,
    /// When purged files are actually unlinked.
    pub purge_policy: PurgePolicy,
    /// Engine instance id stamped into every file header.
    pub server_id: u32,
}

impl LogConfig {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            file_max_size: DEFAULT_FILE_MAX_SIZE,
            use_crc: true,
            use_sector_protection: true,
            sync_directory: true,
            cache_pages: DEFAULT_CACHE_PAGES,
            purge_policy: PurgePolicy::Immediate,
            server_id: 1,
        }
    }

    pub fn file_max_size(mut self, bytes: u32) -> Self {
        self.file_max_size = bytes;
        self
    }

    pub fn crc(mut self, enabled: bool) -> Self {
        self.use_crc = enabled;
        self
    }

    pub fn sector_protection(mut self, enabled: bool) -> Self {
        self.use_sector_protection = enabled;
        self
    }

    pub fn sync_directory(mut self, enabled: bool) -> Self {
        self.sync_directory = enabled;
        self
    }

    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    pub fn purge_policy(mut self, policy: PurgePolicy) -> Self {
        self.purge_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_sane() {
        let config = LogConfig::new("/tmp/log");
        assert_eq!(config.file_max_size, DEFAULT_FILE_MAX_SIZE);
        assert!(config.use_crc);
        assert!(config.use_sector_protection);
        assert_eq!(config.purge_policy, PurgePolicy::Immediate);
    }

    #[test]
    fn config_builders_chain() {
        let config = LogConfig::new("/tmp/log")
            .file_max_size(MIN_FILE_MAX_SIZE)
            .crc(false)
            .sector_protection(false)
            .purge_policy(PurgePolicy::AtNextFlush);
        assert_eq!(config.file_max_size, MIN_FILE_MAX_SIZE);
        assert!(!config.use_crc);
        assert!(!config.use_sector_protection);
        assert_eq!(config.purge_policy, PurgePolicy::AtNextFlush);
    }
}
