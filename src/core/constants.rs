use std::time::Duration;

/// Logical sequence number assigned by the WAL to every appended record.
pub type Lsn = u64;

/// Identifier of an entry inside one partition.
pub type EntryId = u64;

/// LSN of "nothing logged yet". Real LSNs start at 1.
pub const UNKNOWN_LSN: Lsn = 0;

pub const VERSION: u32 = 1;

pub const WAL_MAGIC: [u8; 4] = *b"DTXW";

pub const WAL_HEADER_SIZE: usize = 32;

/// lsn (8) + payload length (4) + salt1 (4) + salt2 (4)
pub const WAL_RECORD_HEADER_SIZE: usize = 20;

pub const WAL_RECORD_TRAILER_SIZE: usize = 4;

/// Largest payload a single WAL record may carry.
pub const MAX_WAL_RECORD_SIZE: usize = 16 * 1024 * 1024;

pub const WAL_BUFFER_SIZE: usize = 64 * 1024;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

pub const DEFAULT_FLUSH_THRESHOLD: usize = 256;

pub const DEFAULT_CURSOR_TIMEOUT: Duration = Duration::from_secs(1);

pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_millis(250);
