use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Largest payload a frame may declare. A bigger length prefix is treated as
/// corruption instead of being allocated.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "event too large"));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Outcome of reading one framed entry.
enum Frame {
    /// A decoded event and the number of bytes its frame took on disk.
    Event(Event, u64),
    End,
    /// Partial or corrupt entry. Everything from here on is discarded.
    Broken(&'static str),
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    match read_full(reader, &mut len_buf)? {
        0 => return Ok(Frame::End),
        4 => {}
        _ => return Ok(Frame::Broken("truncated length prefix")),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(Frame::Broken("length prefix out of range"));
    }

    let mut payload = vec![0u8; len];
    if read_full(reader, &mut payload)? != len {
        return Ok(Frame::Broken("truncated payload"));
    }
    let mut crc_buf = [0u8; 4];
    if read_full(reader, &mut crc_buf)? != 4 {
        return Ok(Frame::Broken("truncated checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::Broken("checksum mismatch"));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Frame::Event(event, (len + 8) as u64)),
        Err(_) => Ok(Frame::Broken("undecodable payload")),
    }
}

/// Like `read_exact`, but reports how many bytes were read before EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Append-only write-ahead log of ledger events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A truncated or corrupt tail (crash mid-write) is dropped on replay.
///
/// Every append is flushed and fsynced before it returns; the engine only
/// applies an event to memory once it is durable.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append one event durably.
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `events`, the minimal set that recreates the
    /// current state. Written to a temp file first, then renamed over the log.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                encode_event(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every valid event from disk. A missing file is an empty log.
    /// The file itself is never modified.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::scan(path)?.0)
    }

    /// Like [`Wal::replay`], but also cuts a torn or corrupt tail off the
    /// file, so frames appended afterwards follow the last good one.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, broken_at) = Self::scan(path)?;
        if let Some(valid_len) = broken_at {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
            warn!("wal {}: truncated to {valid_len} bytes", path.display());
        }
        Ok(events)
    }

    /// Valid events, plus the byte offset of the first broken frame if any.
    fn scan(path: &Path) -> io::Result<(Vec<Event>, Option<u64>)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), None)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut offset = 0u64;

        loop {
            match read_frame(&mut reader)? {
                Frame::Event(event, size) => {
                    events.push(event);
                    offset += size;
                }
                Frame::End => return Ok((events, None)),
                Frame::Broken(reason) => {
                    warn!(
                        "wal {}: {reason} after {} events, discarding tail",
                        path.display(),
                        events.len()
                    );
                    return Ok((events, Some(offset)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HolidayKind, RequestKind, RequestStatus, Role};
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("leavebook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn member(name: &str) -> Event {
        Event::MemberUpserted {
            name: name.into(),
            role: Role::Functional,
            vacation_balance: 22,
            hour_balance: 40,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let id = Ulid::new();
        let events = vec![
            member("ana"),
            Event::RequestCreated {
                id,
                member: "ana".into(),
                role: Role::Functional,
                kind: RequestKind::Vacation,
                date: NaiveDate::from_ymd_opt(2024, 7, 15).unwrap(),
                hours: 0,
                comment: None,
            },
            Event::RequestApproved {
                id,
                status: RequestStatus::Approved,
                comment: Some("enjoy".into()),
                debit: 1,
                reflagged: vec![],
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 3);
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_drops_truncated_tail() {
        let path = tmp_path("truncated.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&member("ana")).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![member("ana")]);
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("bad_crc.wal");
        let good = member("ana");
        let bad = Event::HolidayRemoved { id: Ulid::new() };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("never_written.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compact_shrinks_and_keeps_appending() {
        let path = tmp_path("compact.wal");
        let holiday = Event::HolidayAdded {
            id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2024, 12, 25).unwrap(),
            label: "Christmas".into(),
            kind: HolidayKind::National,
        };

        let mut wal = Wal::open(&path).unwrap();
        for i in 0..20 {
            wal.append(&member(&format!("temp{i}"))).unwrap();
            wal.append(&Event::MemberRemoved { name: format!("temp{i}") }).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(&[member("ana")]).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        wal.append(&holiday).unwrap();
        drop(wal);

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![member("ana"), holiday]);
    }

    #[test]
    fn recover_truncates_broken_tail() {
        let path = tmp_path("recover.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&member("ana")).unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(Wal::recover(&path).unwrap(), vec![member("ana")]);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&member("luis")).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![member("ana"), member("luis")]);
    }

    #[test]
    fn oversized_length_prefix_is_corruption() {
        let path = tmp_path("huge_len.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&member("ana")).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 16]).unwrap();
        }

        assert_eq!(Wal::recover(&path).unwrap(), vec![member("ana")]);
        assert_eq!(Wal::replay(&path).unwrap(), vec![member("ana")]);
    }
}
