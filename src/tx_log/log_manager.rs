use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use log::{debug, info};

use crate::{
    error::KvError,
    tx_log::record::LogRecord,
    types::KvResult,
};

struct LogInner {
    file: File,
    /// The next sequence number to assign. Initialized from the highest
    /// sequence found in the file on open.
    next_sequence: u64,
}

/// The write-ahead log: an append-only file of length-framed records.
///
/// The WAL is the sole source of truth during recovery. A record counts
/// as durable only once `flush` has returned after its append. One lock
/// serializes append, flush and truncation so frames land atomically and
/// sequence numbers are gap-free in on-disk order.
pub struct LogManager {
    inner: Mutex<LogInner>,
    path: PathBuf,
}

impl LogManager {
    pub fn open<P: AsRef<Path>>(path: P) -> KvResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let (records, valid_len) = Self::read_complete_frames(&mut file)?;
        let next_sequence = records.last().map(|r| r.sequence + 1).unwrap_or(1);

        // A torn frame at the tail is the footprint of a crashed append.
        // Cut it off so later appends continue from a clean boundary.
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            info!(
                "dropping {} torn byte(s) at the log tail",
                file_len - valid_len
            );
            file.set_len(valid_len)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::End(0))?;
        info!(
            "log opened, {} records, next sequence: {}",
            records.len(),
            next_sequence
        );

        Ok(Self {
            inner: Mutex::new(LogInner {
                file,
                next_sequence,
            }),
            path,
        })
    }

    /// Append the record, assigning it the next sequence number. The
    /// record is not durable until the next `flush`.
    pub fn append(&self, record: &mut LogRecord) -> KvResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        record.sequence = inner.next_sequence;
        inner.next_sequence += 1;

        let body = record.encode_body();
        inner.file.seek(SeekFrom::End(0))?;
        inner.file.write_all(&(body.len() as u32).to_be_bytes())?;
        inner.file.write_all(&body)?;
        debug!(
            "log append, sequence: {}, tx: {}, op: {:?}",
            record.sequence, record.tx_id, record.op
        );
        Ok(record.sequence)
    }

    /// fsync the log file data.
    pub fn flush(&self) -> KvResult {
        let inner = self.inner.lock().unwrap();
        inner.file.sync_data()?;
        Ok(())
    }

    pub fn read_all(&self) -> KvResult<Vec<LogRecord>> {
        let mut inner = self.inner.lock().unwrap();
        let (records, _) = Self::read_complete_frames(&mut inner.file)?;
        inner.file.seek(SeekFrom::End(0))?;
        Ok(records)
    }

    pub fn read_from_sequence(&self, sequence: u64) -> KvResult<Vec<LogRecord>> {
        let mut records = self.read_all()?;
        records.retain(|r| r.sequence >= sequence);
        Ok(records)
    }

    /// Keep only records with `sequence >= s` by rewriting the surviving
    /// records to a fresh file and atomically replacing the old one.
    /// Needed only by offline compaction.
    pub fn truncate_before(&self, sequence: u64) -> KvResult {
        let mut inner = self.inner.lock().unwrap();
        let survivors = {
            let (records, _) = Self::read_complete_frames(&mut inner.file)?;
            records
                .into_iter()
                .filter(|r| r.sequence >= sequence)
                .collect::<Vec<_>>()
        };

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            for record in &survivors {
                let body = record.encode_body();
                tmp.write_all(&(body.len() as u32).to_be_bytes())?;
                tmp.write_all(&body)?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;
        inner.file = file;
        info!(
            "log truncated before sequence {}, {} records kept",
            sequence,
            survivors.len()
        );
        Ok(())
    }

    /// Current value of the sequence counter (the next to be assigned).
    pub fn next_sequence(&self) -> u64 {
        self.inner.lock().unwrap().next_sequence
    }

    /// Flush and release. The file handle closes when the manager drops.
    pub fn close(&self) -> KvResult {
        self.flush()
    }

    /// Render the log record by record, for debugging.
    pub fn describe(&self) -> KvResult<String> {
        let records = self.read_all()?;
        let mut out = String::new();
        for r in &records {
            out.push_str(&format!(
                "├── [seq {}] tx {} {:?}, key: {} bytes, new: {} bytes, old: {} bytes\n",
                r.sequence,
                r.tx_id,
                r.op,
                r.key.len(),
                r.new_value.len(),
                r.old_value.len(),
            ));
        }
        Ok(out)
    }

    /// Sequentially read every complete frame from the start of the
    /// file. Returns the records and the byte offset just past the last
    /// complete frame.
    ///
    /// A frame cut off at the tail is the footprint of a crashed append:
    /// it is ignored and reading stops. A malformed body inside a
    /// complete frame is corruption and fails the read.
    fn read_complete_frames(file: &mut File) -> KvResult<(Vec<LogRecord>, u64)> {
        file.seek(SeekFrom::Start(0))?;
        let mut records = Vec::new();
        let mut last_sequence = 0u64;
        let mut valid_len = 0u64;
        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(KvError::Io(e)),
            }
            let len = u32::from_be_bytes(len_buf) as usize;

            let mut body = vec![0u8; len];
            match file.read_exact(&mut body) {
                Ok(()) => {}
                Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => {
                    debug!("truncated frame at log tail, ignoring");
                    break;
                }
                Err(e) => return Err(KvError::Io(e)),
            }

            let record = LogRecord::decode_body(&body)?;
            if record.sequence <= last_sequence && !records.is_empty() {
                return Err(KvError::corruption(format!(
                    "log sequence {} after {} breaks monotonic order",
                    record.sequence, last_sequence
                )));
            }
            last_sequence = record.sequence;
            valid_len += 4 + len as u64;
            records.push(record);
        }
        Ok((records, valid_len))
    }
}
