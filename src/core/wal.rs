
use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::metrics::Metrics;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

/// The durable, append-only log the transaction engine writes through.
///
/// Every record gets a strictly increasing LSN; that order is the only clock
/// the engine uses.
pub trait WriteAheadLog: Send + Sync {
    /// Appends a record. With `sync` the record is durable when this returns.
    fn log(&self, record: &[u8], sync: bool) -> Result<Lsn>;

    /// Every record with an LSN greater than `lsn`, in LSN order.
    fn read_after(&self, lsn: Lsn) -> Result<Vec<WalRecord>>;

    fn sync(&self) -> Result<()>;

    /// LSN of the newest record, or `UNKNOWN_LSN` if none was ever written.
    fn last_lsn(&self) -> Lsn;

    /// Drops every record if none is newer than `through`. Returns whether the
    /// log was truncated. LSNs keep increasing across a checkpoint.
    fn checkpoint(&self, through: Lsn) -> Result<bool>;

    fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub lsn: Lsn,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct WALHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub salt1: u32,
    pub salt2: u32,
    /// LSN of the last record dropped by a checkpoint.
    pub base_lsn: Lsn,
}

struct WALInner {
    file: File,
    writer: BufWriter<File>,
    header: WALHeader,
    last_lsn: Lsn,
    record_count: u64,
    end_offset: u64,
    file_position: i64,
}

/// File-backed WAL: a 32-byte header followed by checksummed record frames.
///
/// Frame layout: `lsn u64 | len u32 | salt1 u32 | salt2 u32 | payload | crc u32`.
/// On open the frames are scanned; the first torn or corrupt frame marks the end
/// of the log and everything after it is cut off.
pub struct FileWal {
    inner: Mutex<WALInner>,
    metrics: OnceLock<Arc<Metrics>>,
}

impl FileWal {
    #[cfg_attr(not(unix), allow(unused_variables))]
    pub fn open(path: &Path, permissions: u32) -> Result<Self> {
        let is_new = !path.exists()
            || std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);

        #[cfg(unix)]
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(permissions)
            .open(path)?;

        #[cfg(not(unix))]
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let writer_file = file.try_clone()?;
        let writer = BufWriter::with_capacity(WAL_BUFFER_SIZE, writer_file);

        let mut inner = WALInner {
            file,
            writer,
            header: WALHeader {
                magic: WAL_MAGIC,
                version: VERSION,
                salt1: generate_salt(),
                salt2: generate_salt().rotate_left(16) ^ 0x5bd1_e995,
                base_lsn: UNKNOWN_LSN,
            },
            last_lsn: UNKNOWN_LSN,
            record_count: 0,
            end_offset: WAL_HEADER_SIZE as u64,
            file_position: -1,
        };

        if is_new {
            inner.write_header()?;
        } else {
            inner.header = inner.read_header()?;
            inner.recover_tail()?;
        }

        Ok(FileWal {
            inner: Mutex::new(inner),
            metrics: OnceLock::new(),
        })
    }

    /// Attaches engine counters; only the first call takes effect.
    pub(crate) fn set_metrics(&self, metrics: Arc<Metrics>) {
        let _ = self.metrics.set(metrics);
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, WALInner>> {
        self.inner.lock().map_err(|_| Error::LockPoisoned {
            lock_name: "file_wal.inner".to_string(),
        })
    }

    pub fn record_count(&self) -> u64 {
        self.inner.lock().recover_poison().record_count
    }

    fn record_metrics(&self, bytes: u64) {
        if let Some(metrics) = self.metrics.get() {
            metrics.on_wal_append(bytes);
        }
    }
}

impl WriteAheadLog for FileWal {
    fn log(&self, record: &[u8], sync: bool) -> Result<Lsn> {
        if record.len() > MAX_WAL_RECORD_SIZE {
            return Err(Error::WALRecordTooLarge {
                size: record.len(),
                limit: MAX_WAL_RECORD_SIZE,
            });
        }

        let mut inner = self.lock_inner()?;

        let lsn = inner.last_lsn + 1;
        let frame = encode_frame(lsn, record, inner.header.salt1, inner.header.salt2);
        let offset = inner.end_offset;

        // Only seek if a read moved the file position since the last append.
        if inner.file_position != offset as i64 {
            inner.writer.flush()?;
            inner.writer.get_mut().seek(SeekFrom::Start(offset))?;
        }

        inner.writer.write_all(&frame)?;
        inner.end_offset = offset + frame.len() as u64;
        inner.file_position = inner.end_offset as i64;
        inner.last_lsn = lsn;
        inner.record_count += 1;

        if sync {
            inner.writer.flush()?;
            inner.file.sync_data()?;
        }

        // metrics after the inner lock is released
        drop(inner);
        self.record_metrics(frame.len() as u64);

        Ok(lsn)
    }

    fn read_after(&self, lsn: Lsn) -> Result<Vec<WalRecord>> {
        let mut inner = self.lock_inner()?;
        inner.writer.flush()?;

        let salt1 = inner.header.salt1;
        let salt2 = inner.header.salt2;
        let end = inner.end_offset;

        inner.file.seek(SeekFrom::Start(WAL_HEADER_SIZE as u64))?;
        inner.file_position = -1;

        let mut records = Vec::new();
        let mut reader = BufReader::with_capacity(WAL_BUFFER_SIZE, &mut inner.file);
        let mut offset = WAL_HEADER_SIZE as u64;
        while offset < end {
            match read_frame(&mut reader, salt1, salt2)? {
                FrameRead::Record(record, size) => {
                    offset += size;
                    if record.lsn > lsn {
                        records.push(record);
                    }
                }
                FrameRead::End => {
                    return Err(Error::WALCorrupted);
                }
            }
        }

        Ok(records)
    }

    fn sync(&self) -> Result<()> {
        let mut inner = self.lock_inner()?;
        inner.writer.flush()?;
        inner.file.sync_all()?;
        Ok(())
    }

    fn last_lsn(&self) -> Lsn {
        self.inner.lock().recover_poison().last_lsn
    }

    fn checkpoint(&self, through: Lsn) -> Result<bool> {
        let mut inner = self.lock_inner()?;

        if inner.last_lsn > through {
            return Ok(false);
        }

        inner.writer.flush()?;
        inner.header.base_lsn = inner.last_lsn;
        inner.header.salt1 = inner.header.salt1.wrapping_add(1);
        inner.header.salt2 = generate_salt() ^ inner.header.salt2.rotate_left(7);
        inner.write_header()?;

        inner.file.set_len(WAL_HEADER_SIZE as u64)?;
        inner.file.sync_all()?;
        inner.end_offset = WAL_HEADER_SIZE as u64;
        inner.record_count = 0;
        inner.file_position = -1;

        tracing::debug!(base_lsn = inner.header.base_lsn, "WAL checkpointed");
        Ok(true)
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.lock_inner()?;
        inner.writer.flush()?;
        inner.file.sync_all()?;
        Ok(())
    }
}

impl WALInner {
    fn write_header(&mut self) -> Result<()> {
        let mut data = vec![0u8; WAL_HEADER_SIZE];

        data[0..4].copy_from_slice(&self.header.magic);
        data[4..8].copy_from_slice(&self.header.version.to_le_bytes());
        data[8..12].copy_from_slice(&self.header.salt1.to_le_bytes());
        data[12..16].copy_from_slice(&self.header.salt2.to_le_bytes());
        data[16..24].copy_from_slice(&self.header.base_lsn.to_le_bytes());

        self.writer.flush()?;
        self.writer.get_mut().seek(SeekFrom::Start(0))?;
        self.writer.write_all(&data)?;
        self.file_position = data.len() as i64;

        self.writer.flush()?;
        self.file.sync_all()?;

        Ok(())
    }

    fn read_header(&mut self) -> Result<WALHeader> {
        let mut data = vec![0u8; WAL_HEADER_SIZE];

        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut data)
            .map_err(|_| Error::WALCorrupted)?;
        self.file_position = data.len() as i64;

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[0..4]);
        if magic != WAL_MAGIC {
            return Err(Error::InvalidMagic);
        }

        let header = WALHeader {
            magic,
            version: u32::from_le_bytes(data[4..8].try_into()?),
            salt1: u32::from_le_bytes(data[8..12].try_into()?),
            salt2: u32::from_le_bytes(data[12..16].try_into()?),
            base_lsn: u64::from_le_bytes(data[16..24].try_into()?),
        };

        if header.version != VERSION {
            return Err(Error::InvalidVersion);
        }

        Ok(header)
    }

    /// Counts valid frames and cuts the file after the last one.
    fn recover_tail(&mut self) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        let salt1 = self.header.salt1;
        let salt2 = self.header.salt2;

        self.file.seek(SeekFrom::Start(WAL_HEADER_SIZE as u64))?;
        self.file_position = -1;

        let mut offset = WAL_HEADER_SIZE as u64;
        let mut last_lsn = self.header.base_lsn;
        let mut count = 0u64;
        {
            let mut reader = BufReader::with_capacity(WAL_BUFFER_SIZE, &mut self.file);
            while offset < file_len {
                match read_frame(&mut reader, salt1, salt2) {
                    Ok(FrameRead::Record(record, size)) => {
                        if record.lsn <= last_lsn {
                            break;
                        }
                        last_lsn = record.lsn;
                        offset += size;
                        count += 1;
                    }
                    Ok(FrameRead::End) | Err(_) => break,
                }
            }
        }

        if offset < file_len {
            tracing::warn!(
                valid_bytes = offset,
                file_bytes = file_len,
                "WAL has a torn or corrupt tail, truncating"
            );
            self.file.set_len(offset)?;
            self.file.sync_all()?;
        }

        self.last_lsn = last_lsn;
        self.record_count = count;
        self.end_offset = offset;
        Ok(())
    }
}

/// Volatile WAL keeping records in memory. Same LSN contract as `FileWal`.
#[derive(Default)]
pub struct MemoryWal {
    inner: Mutex<MemoryWalInner>,
}

#[derive(Default)]
struct MemoryWalInner {
    records: Vec<WalRecord>,
    last_lsn: Lsn,
    syncs: u64,
}

impl MemoryWal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.inner.lock().recover_poison().records.len()
    }

    /// Number of records appended with `sync` or followed by `sync()`.
    pub fn sync_count(&self) -> u64 {
        self.inner.lock().recover_poison().syncs
    }
}

impl WriteAheadLog for MemoryWal {
    fn log(&self, record: &[u8], sync: bool) -> Result<Lsn> {
        if record.len() > MAX_WAL_RECORD_SIZE {
            return Err(Error::WALRecordTooLarge {
                size: record.len(),
                limit: MAX_WAL_RECORD_SIZE,
            });
        }
        let mut inner = self.inner.lock().recover_poison();
        inner.last_lsn += 1;
        let lsn = inner.last_lsn;
        inner.records.push(WalRecord { lsn, payload: record.to_vec() });
        if sync {
            inner.syncs += 1;
        }
        Ok(lsn)
    }

    fn read_after(&self, lsn: Lsn) -> Result<Vec<WalRecord>> {
        let inner = self.inner.lock().recover_poison();
        Ok(inner.records.iter().filter(|r| r.lsn > lsn).cloned().collect())
    }

    fn sync(&self) -> Result<()> {
        self.inner.lock().recover_poison().syncs += 1;
        Ok(())
    }

    fn last_lsn(&self) -> Lsn {
        self.inner.lock().recover_poison().last_lsn
    }

    fn checkpoint(&self, through: Lsn) -> Result<bool> {
        let mut inner = self.inner.lock().recover_poison();
        if inner.last_lsn > through {
            return Ok(false);
        }
        inner.records.clear();
        Ok(true)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

enum FrameRead {
    Record(WalRecord, u64),
    End,
}

fn encode_frame(lsn: Lsn, payload: &[u8], salt1: u32, salt2: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(WAL_RECORD_HEADER_SIZE + payload.len() + WAL_RECORD_TRAILER_SIZE);
    data.extend_from_slice(&lsn.to_le_bytes());
    data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    data.extend_from_slice(&salt1.to_le_bytes());
    data.extend_from_slice(&salt2.to_le_bytes());
    data.extend_from_slice(payload);
    let checksum = calculate_checksum(lsn, payload, salt1, salt2);
    data.extend_from_slice(&checksum.to_le_bytes());
    data
}

fn calculate_checksum(lsn: Lsn, payload: &[u8], salt1: u32, salt2: u32) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&lsn.to_le_bytes());
    hasher.update(&(payload.len() as u32).to_le_bytes());
    hasher.update(payload);
    hasher.finalize() ^ salt1 ^ salt2
}

/// Reads one frame. A short read or a frame from another WAL generation is
/// `End`; a bad checksum is an error.
fn read_frame<R: Read>(reader: &mut R, salt1: u32, salt2: u32) -> Result<FrameRead> {
    let mut header = [0u8; WAL_RECORD_HEADER_SIZE];
    if reader.read_exact(&mut header).is_err() {
        return Ok(FrameRead::End);
    }

    let lsn = u64::from_le_bytes(header[0..8].try_into()?);
    let len = u32::from_le_bytes(header[8..12].try_into()?) as usize;
    let frame_salt1 = u32::from_le_bytes(header[12..16].try_into()?);
    let frame_salt2 = u32::from_le_bytes(header[16..20].try_into()?);

    if frame_salt1 != salt1 || frame_salt2 != salt2 || len > MAX_WAL_RECORD_SIZE {
        return Ok(FrameRead::End);
    }

    let mut payload = vec![0u8; len];
    if reader.read_exact(&mut payload).is_err() {
        return Ok(FrameRead::End);
    }

    let mut trailer = [0u8; WAL_RECORD_TRAILER_SIZE];
    if reader.read_exact(&mut trailer).is_err() {
        return Ok(FrameRead::End);
    }

    let checksum = u32::from_le_bytes(trailer);
    if checksum != calculate_checksum(lsn, &payload, salt1, salt2) {
        return Err(Error::WALChecksumFail);
    }

    let size = (WAL_RECORD_HEADER_SIZE + len + WAL_RECORD_TRAILER_SIZE) as u64;
    Ok(FrameRead::Record(WalRecord { lsn, payload }, size))
}

fn generate_salt() -> u32 {
    use std::time::SystemTime;
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(n) => n.as_secs() as u32 ^ n.subsec_nanos(),
        Err(_) => 12345,
    }
}
