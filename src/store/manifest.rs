use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::raft::message::NodeId;

/// Manifest file magic bytes: "FMAN".
pub const MANIFEST_MAGIC: [u8; 4] = [0x46, 0x4D, 0x41, 0x4E];

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// Manifest file size (32 bytes).
pub const MANIFEST_SIZE: usize = 32;

/// Sentinel value for "no vote cast".
pub const NO_VOTE: u32 = u32::MAX;

/// The Raft hard state that must survive a restart.
///
/// INVARIANT: `(current_term, voted_for)` must be on disk before any RPC
/// response that depends on the new value is sent. Granting a vote and then
/// forgetting it across a crash is a double-vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

impl HardState {
    /// Serialize to the fixed-size on-disk record.
    ///
    /// Layout: magic (0..4), version (4..8), current_term (8..16),
    /// voted_for (16..20), reserved (20..24), crc32c of bytes 0..24
    /// (24..28), reserved (28..32).
    pub fn to_bytes(&self) -> [u8; MANIFEST_SIZE] {
        let mut bytes = [0u8; MANIFEST_SIZE];
        bytes[0..4].copy_from_slice(&MANIFEST_MAGIC);
        bytes[4..8].copy_from_slice(&MANIFEST_VERSION.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.current_term.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.voted_for.unwrap_or(NO_VOTE).to_le_bytes());
        let checksum = crc32c::crc32c(&bytes[0..24]);
        bytes[24..28].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    /// Deserialize from the on-disk record.
    /// Returns `None` if magic, version, or checksum validation fails.
    pub fn from_bytes(bytes: &[u8; MANIFEST_SIZE]) -> Option<Self> {
        if bytes[0..4] != MANIFEST_MAGIC {
            return None;
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != MANIFEST_VERSION {
            return None;
        }
        let stored_checksum = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
        if stored_checksum != crc32c::crc32c(&bytes[0..24]) {
            return None;
        }
        let current_term = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let voted = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        Some(HardState {
            current_term,
            voted_for: (voted != NO_VOTE).then_some(voted),
        })
    }
}

/// Manifest file manager with atomic persistence.
///
/// Updates use the write-tmp-fdatasync-rename-fsync-dir pattern so a crash
/// at any point leaves either the old record or the new one, never a torn
/// mix.
#[derive(Debug)]
pub struct VoteManifest {
    path: PathBuf,
    state: HardState,
}

impl VoteManifest {
    /// Open an existing manifest or create an empty one.
    pub fn open(path: &Path) -> io::Result<Self> {
        if path.exists() {
            let mut file = File::open(path)?;
            let mut bytes = [0u8; MANIFEST_SIZE];
            file.read_exact(&mut bytes)?;
            let state = HardState::from_bytes(&bytes).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "vote manifest corrupted: bad magic, version, or checksum",
                )
            })?;
            Ok(VoteManifest {
                path: path.to_path_buf(),
                state,
            })
        } else {
            let manifest = VoteManifest {
                path: path.to_path_buf(),
                state: HardState::default(),
            };
            manifest.persist()?;
            Ok(manifest)
        }
    }

    pub fn state(&self) -> HardState {
        self.state
    }

    /// Record a new hard state, durably, before the caller replies to
    /// anything.
    pub fn set(&mut self, current_term: u64, voted_for: Option<NodeId>) -> io::Result<()> {
        // Terms never move backwards.
        assert!(
            current_term >= self.state.current_term,
            "term regression: {} -> {}",
            self.state.current_term,
            current_term
        );
        let new = HardState {
            current_term,
            voted_for,
        };
        if new == self.state {
            return Ok(());
        }
        self.state = new;
        self.persist()
    }

    fn persist(&self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("tmp");

        {
            let mut tmp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            tmp_file.write_all(&self.state.to_bytes())?;
            fdatasync(&tmp_file)?;
        }

        fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                // SAFETY: fsync is a standard POSIX syscall.
                unsafe { libc::fsync(dir.as_raw_fd()) };
            }
        }

        Ok(())
    }
}

/// fdatasync a file, surfacing the OS error.
pub(crate) fn fdatasync(file: &File) -> io::Result<()> {
    // SAFETY: fdatasync is a standard POSIX syscall.
    let result = unsafe { libc::fdatasync(file.as_raw_fd()) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
