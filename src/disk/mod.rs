//! Apple IIgs disk subsystem core.
//!
//! Six cooperating layers, dependencies flowing leaves-first:
//! [`gcr`] (L1) < [`nibble`] (L2) < [`img2mg`]/[`woz`] (L3/L4) < [`asset`] (L5) < [`storage`] (L6).

pub mod gcr;
pub mod nibble;
pub mod img2mg;
pub mod woz;
pub mod asset;
pub mod storage;

use thiserror::Error;

/// The five enumerated error kinds the disk core can report. Errors are values, not
/// panics: a failed mount or save always leaves the rest of the system in a known state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid disk image: {0}")]
    InvalidImage(String),
    #[error("image not supported: {0}")]
    ImageNotSupported(String),
    #[error("version not supported: {0}")]
    VersionNotSupported(String),
    #[error("mount failed: {0}")]
    MountFailed(String),
    #[error("save failed: {0}")]
    SaveFailed(String),
}

impl Error {
    pub fn mount_failed_io(e: &std::io::Error) -> Self {
        Error::MountFailed(e.to_string())
    }
    pub fn save_failed_io(e: &std::io::Error) -> Self {
        Error::SaveFailed(e.to_string())
    }
}

pub type DiskResult<T> = Result<T, Error>;

/// Physical disk format. `None` means an uninitialized/absent slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskType {
    None,
    D525,
    D35,
    Hdd,
}

impl Default for DiskType {
    fn default() -> Self {
        DiskType::None
    }
}

/// Quarter-track limit shared by both 5.25" and 3.5" nibble disks.
pub const LIMIT_QTR_TRACKS: usize = 160;

/// Byte value used to mark a quarter-track as having no real track behind it.
pub const UNINITIALIZED_TRACK: u8 = 0xFF;
