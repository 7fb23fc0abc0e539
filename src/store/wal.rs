//! Append-only log file.
//!
//! Each record is a length-prefixed, checksummed bincode frame holding one
//! log entry. Appends are fdatasync'd before returning; a truncation caused
//! by a log conflict rewrites the whole file atomically (the log stays
//! small enough for this — compaction is out of scope).

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::raft::log::LogEntry;

use super::manifest::fdatasync;

/// Frame header: payload length (u32) + crc32c of the payload (u32).
const FRAME_HEADER: usize = 8;

/// Upper bound on a single frame payload; anything larger is corruption.
const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// How the recovery scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Every frame decoded; the file ends on a record boundary.
    Clean { entries: u64 },
    /// A torn write at the tail was discarded.
    Truncated { entries: u64, dropped_bytes: u64 },
}

/// The write half of the on-disk log.
#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    file: File,
    /// Number of entries currently in the file.
    entries: u64,
    /// Byte offset of the next frame.
    offset: u64,
}

impl Wal {
    /// Open (or create) the log file, scanning existing frames.
    ///
    /// Returns the recovered entries alongside the writer. A torn final
    /// frame — the only damage a crash mid-append can cause — is truncated
    /// away and reported in the outcome.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<LogEntry>, RecoveryOutcome)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let file_len = file.metadata()?.len();
        let mut entries = Vec::new();
        let mut offset = 0u64;

        loop {
            match read_frame(&mut file, offset, file_len)? {
                FrameResult::Entry { entry, next_offset } => {
                    entries.push(entry);
                    offset = next_offset;
                }
                FrameResult::End => break,
                FrameResult::Torn => {
                    let dropped = file_len - offset;
                    log::warn!(
                        "wal: torn tail at offset {} ({} bytes dropped)",
                        offset,
                        dropped
                    );
                    file.set_len(offset)?;
                    fdatasync(&file)?;
                    file.seek(SeekFrom::Start(offset))?;
                    let count = entries.len() as u64;
                    let wal = Wal {
                        path: path.to_path_buf(),
                        file,
                        entries: count,
                        offset,
                    };
                    return Ok((
                        wal,
                        entries,
                        RecoveryOutcome::Truncated {
                            entries: count,
                            dropped_bytes: dropped,
                        },
                    ));
                }
            }
        }

        file.seek(SeekFrom::Start(offset))?;
        let count = entries.len() as u64;
        let wal = Wal {
            path: path.to_path_buf(),
            file,
            entries: count,
            offset,
        };
        Ok((wal, entries, RecoveryOutcome::Clean { entries: count }))
    }

    pub fn len(&self) -> u64 {
        self.entries
    }

    /// Append a batch of entries and make them durable.
    ///
    /// `from_index` is the log index of the first entry; it must line up
    /// with what the file already holds.
    pub fn append(&mut self, from_index: u64, entries: &[LogEntry]) -> io::Result<()> {
        assert_eq!(
            from_index, self.entries,
            "wal append out of sequence: file has {} entries, append starts at {}",
            self.entries, from_index
        );
        let mut buf = Vec::new();
        for entry in entries {
            push_frame(&mut buf, entry);
        }
        self.file.write_all(&buf)?;
        fdatasync(&self.file)?;
        self.entries += entries.len() as u64;
        self.offset += buf.len() as u64;
        Ok(())
    }

    /// Replace the file contents with `entries`, atomically.
    ///
    /// Used when a conflicting suffix was truncated from the in-memory log:
    /// the file is rebuilt via write-tmp-fdatasync-rename so a crash leaves
    /// either the old log or the new one.
    pub fn rewrite(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        let mut buf = Vec::new();
        for entry in entries {
            push_frame(&mut buf, entry);
        }

        {
            let mut tmp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            tmp_file.write_all(&buf)?;
            fdatasync(&tmp_file)?;
        }

        fs::rename(&tmp_path, &self.path)?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                // SAFETY: fsync is a standard POSIX syscall.
                unsafe { libc::fsync(dir.as_raw_fd()) };
            }
        }

        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.file.seek(SeekFrom::End(0))?;
        self.entries = entries.len() as u64;
        self.offset = buf.len() as u64;
        Ok(())
    }
}

fn push_frame(buf: &mut Vec<u8>, entry: &LogEntry) {
    let payload = bincode::serialize(entry).expect("log entry serialization should not fail");
    let checksum = crc32c::crc32c(&payload);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&checksum.to_le_bytes());
    buf.extend_from_slice(&payload);
}

enum FrameResult {
    Entry { entry: LogEntry, next_offset: u64 },
    End,
    Torn,
}

fn read_frame(file: &mut File, offset: u64, file_len: u64) -> io::Result<FrameResult> {
    if offset == file_len {
        return Ok(FrameResult::End);
    }
    if file_len - offset < FRAME_HEADER as u64 {
        return Ok(FrameResult::Torn);
    }

    file.seek(SeekFrom::Start(offset))?;
    let mut header = [0u8; FRAME_HEADER];
    file.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let checksum = u32::from_le_bytes(header[4..8].try_into().unwrap());

    if len > MAX_FRAME || file_len - offset - (FRAME_HEADER as u64) < len as u64 {
        return Ok(FrameResult::Torn);
    }

    let mut payload = vec![0u8; len as usize];
    file.read_exact(&mut payload)?;
    if crc32c::crc32c(&payload) != checksum {
        return Ok(FrameResult::Torn);
    }
    let entry: LogEntry = match bincode::deserialize(&payload) {
        Ok(entry) => entry,
        Err(_) => return Ok(FrameResult::Torn),
    };
    Ok(FrameResult::Entry {
        entry,
        next_offset: offset + FRAME_HEADER as u64 + len as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestPath(PathBuf);

    impl TestPath {
        fn new(name: &str) -> Self {
            let path = PathBuf::from(format!("/tmp/floe_wal_{}.log", name));
            let _ = fs::remove_file(&path);
            TestPath(path)
        }
    }

    impl Drop for TestPath {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.0);
        }
    }

    fn entry(term: u64, tag: &str) -> LogEntry {
        LogEntry::new(term, tag.as_bytes().to_vec())
    }

    #[test]
    fn append_and_recover() {
        let path = TestPath::new("append");
        {
            let (mut wal, recovered, outcome) = Wal::open(&path.0).unwrap();
            assert!(recovered.is_empty());
            assert_eq!(outcome, RecoveryOutcome::Clean { entries: 0 });
            wal.append(0, &[entry(1, "a"), entry(1, "b")]).unwrap();
            wal.append(2, &[entry(2, "c")]).unwrap();
            assert_eq!(wal.len(), 3);
        }
        {
            let (wal, recovered, outcome) = Wal::open(&path.0).unwrap();
            assert_eq!(wal.len(), 3);
            assert_eq!(outcome, RecoveryOutcome::Clean { entries: 3 });
            assert_eq!(recovered, vec![entry(1, "a"), entry(1, "b"), entry(2, "c")]);
        }
    }

    #[test]
    fn rewrite_replaces_contents() {
        let path = TestPath::new("rewrite");
        {
            let (mut wal, _, _) = Wal::open(&path.0).unwrap();
            wal.append(0, &[entry(1, "a"), entry(1, "b"), entry(2, "c")])
                .unwrap();
            wal.rewrite(&[entry(1, "a"), entry(3, "x")]).unwrap();
            assert_eq!(wal.len(), 2);
            // Appends continue from the rewritten state.
            wal.append(2, &[entry(3, "y")]).unwrap();
        }
        let (_, recovered, outcome) = Wal::open(&path.0).unwrap();
        assert_eq!(outcome, RecoveryOutcome::Clean { entries: 3 });
        assert_eq!(recovered, vec![entry(1, "a"), entry(3, "x"), entry(3, "y")]);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let path = TestPath::new("torn");
        {
            let (mut wal, _, _) = Wal::open(&path.0).unwrap();
            wal.append(0, &[entry(1, "a"), entry(1, "b")]).unwrap();
        }
        // Simulate a crash mid-append: half a frame header at the tail.
        {
            let mut file = OpenOptions::new().append(true).open(&path.0).unwrap();
            file.write_all(&[0x05, 0x00, 0x00]).unwrap();
        }
        let (mut wal, recovered, outcome) = Wal::open(&path.0).unwrap();
        assert_eq!(recovered, vec![entry(1, "a"), entry(1, "b")]);
        assert_eq!(
            outcome,
            RecoveryOutcome::Truncated {
                entries: 2,
                dropped_bytes: 3
            }
        );
        // The file is usable again after truncation.
        wal.append(2, &[entry(2, "c")]).unwrap();
        let (_, recovered, outcome) = Wal::open(&path.0).unwrap();
        assert_eq!(outcome, RecoveryOutcome::Clean { entries: 3 });
        assert_eq!(recovered.len(), 3);
    }

    #[test]
    fn corrupted_payload_truncates_from_there() {
        let path = TestPath::new("corrupt");
        let payload_flip_offset;
        {
            let (mut wal, _, _) = Wal::open(&path.0).unwrap();
            wal.append(0, &[entry(1, "a")]).unwrap();
            payload_flip_offset = wal.offset + FRAME_HEADER as u64 + 2;
            wal.append(1, &[entry(1, "b"), entry(1, "c")]).unwrap();
        }
        {
            let mut file = OpenOptions::new().write(true).open(&path.0).unwrap();
            file.seek(SeekFrom::Start(payload_flip_offset)).unwrap();
            file.write_all(&[0xFF]).unwrap();
        }
        let (_, recovered, outcome) = Wal::open(&path.0).unwrap();
        assert_eq!(recovered, vec![entry(1, "a")]);
        assert!(matches!(outcome, RecoveryOutcome::Truncated { entries: 1, .. }));
    }
}
