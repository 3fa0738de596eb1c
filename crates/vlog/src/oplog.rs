//! Write-ahead operation log
//!
//! Layout of the backing storage:
//!
//! ```text
//! [0, 4096)      header slot 0   crc32 | len u32 | version u64 | payload
//! [4096, 8192)   header slot 1
//! [8192, ..)     entries         crc32 | (len << 2 | slot << 1 | partial) u32 | payload
//! ```
//!
//! The header with the higher valid version wins. Entries carry the slot bit
//! of the header they were written against, so entries left behind by an
//! interrupted flush are recognised as stale. A multi-entry append marks all
//! but its last entry partial and is only replayed when complete.

use tracing::{debug, warn};

use crate::storage::RandomAccess;
use crate::{Error, Result};

/// Size of one header slot
pub const HEADER_SLOT_SIZE: u64 = 4096;
/// Framing bytes in front of every entry
pub const ENTRY_FRAME_SIZE: u64 = 8;

const ENTRIES_OFFSET: u64 = 2 * HEADER_SLOT_SIZE;
const SLOT_FRAME_SIZE: usize = 16;
const MAX_HEADER_LEN: usize = HEADER_SLOT_SIZE as usize - SLOT_FRAME_SIZE;
const MAX_ENTRY_LEN: usize = (u32::MAX >> 2) as usize;

/// What a freshly opened oplog holds.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct OplogState {
    /// Latest flushed header, `None` for a fresh log
    pub header: Option<Vec<u8>>,
    /// Complete entries appended since that header, in order
    pub entries: Vec<Vec<u8>>,
}

pub struct Oplog<S: RandomAccess> {
    storage: S,
    /// Slot holding the current header
    slot: u8,
    version: u64,
    length: u64,
    byte_length: u64,
    /// Entries past `byte_length` from before the last flush are still on
    /// disk. They carry the slot bit of the next flush, so that flush must
    /// not happen until they are gone.
    stale_tail: bool,
}

impl<S: RandomAccess> Oplog<S> {
    pub fn open(storage: S) -> Result<(Self, OplogState)> {
        let slots = storage.read(0, ENTRIES_OFFSET)?;

        let mut oplog = Self {
            storage,
            slot: 1,
            version: 0,
            length: 0,
            byte_length: 0,
            stale_tail: false,
        };
        let mut state = OplogState::default();

        if slots.iter().any(|b| *b != 0) {
            let (slot, version, header) = pick_header(&slots)?;
            oplog.slot = slot;
            oplog.version = version;
            state.header = Some(header);
        }

        state.entries = oplog.replay()?;

        debug!(
            version = oplog.version,
            slot = oplog.slot,
            entries = state.entries.len(),
            byte_length = oplog.byte_length,
            "opened oplog"
        );

        Ok((oplog, state))
    }

    /// Entries appended since the last flush.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Bytes of entries appended since the last flush.
    pub fn byte_length(&self) -> u64 {
        self.byte_length
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Append `entries` as one group. After a crash either all of them
    /// replay or none do.
    pub fn append(&mut self, entries: &[Vec<u8>]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            if entry.len() > MAX_ENTRY_LEN {
                return Err(Error::InvalidOperation(format!(
                    "oplog entry of {} bytes is too large",
                    entry.len()
                )));
            }
            let partial = i + 1 < entries.len();
            encode_entry(&mut buf, entry, self.slot, partial);
        }

        self.storage.write(ENTRIES_OFFSET + self.byte_length, &buf)?;

        self.length += entries.len() as u64;
        self.byte_length += buf.len() as u64;
        Ok(())
    }

    /// Refuse headers larger than a slot.
    pub fn check_header(header: &[u8]) -> Result<()> {
        if header.len() > MAX_HEADER_LEN {
            return Err(Error::InvalidOperation(format!(
                "oplog header of {} bytes does not fit a slot",
                header.len()
            )));
        }
        Ok(())
    }

    /// Persist `header` into the inactive slot and drop all entries.
    pub fn flush(&mut self, header: &[u8]) -> Result<()> {
        Self::check_header(header)?;

        if self.stale_tail {
            self.storage.truncate(ENTRIES_OFFSET + self.byte_length)?;
            self.stale_tail = false;
        }

        let slot = 1 - self.slot;
        let version = self.version + 1;

        let mut buf = Vec::with_capacity(SLOT_FRAME_SIZE + header.len());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&(header.len() as u32).to_le_bytes());
        buf.extend_from_slice(&version.to_le_bytes());
        buf.extend_from_slice(header);
        let crc = crc32fast::hash(&buf[4..]);
        buf[..4].copy_from_slice(&crc.to_le_bytes());

        self.storage.write(u64::from(slot) * HEADER_SLOT_SIZE, &buf)?;

        // Old entries now carry a stale slot bit, so they are dead even if
        // the truncation below does not land.
        self.slot = slot;
        self.version = version;
        self.length = 0;
        self.byte_length = 0;

        if let Err(err) = self.storage.truncate(ENTRIES_OFFSET) {
            warn!(version, %err, "could not drop folded oplog entries");
            self.stale_tail = true;
        }

        debug!(version, slot, "flushed oplog header");
        Ok(())
    }

    fn replay(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut entries = Vec::new();
        let mut group = Vec::new();
        let mut offset = ENTRIES_OFFSET;
        let end = self.storage.len()?;

        while offset + ENTRY_FRAME_SIZE <= end {
            let frame = self.storage.read(offset, ENTRY_FRAME_SIZE)?;
            let crc = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
            let word = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);

            let len = u64::from(word >> 2);
            let slot = ((word >> 1) & 1) as u8;
            let partial = word & 1 == 1;

            if offset + ENTRY_FRAME_SIZE + len > end {
                break;
            }
            let payload = self.storage.read(offset + ENTRY_FRAME_SIZE, len)?;

            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&frame[4..]);
            hasher.update(&payload);
            if hasher.finalize() != crc || slot != self.slot {
                break;
            }

            offset += ENTRY_FRAME_SIZE + len;
            group.push(payload);

            if !partial {
                self.length += group.len() as u64;
                self.byte_length = offset - ENTRIES_OFFSET;
                entries.append(&mut group);
            }
        }

        if offset < end {
            warn!(
                offset,
                end,
                dropped = group.len(),
                "dropping torn or stale oplog tail"
            );
            self.storage.truncate(ENTRIES_OFFSET + self.byte_length)?;
        }

        Ok(entries)
    }
}

fn encode_entry(buf: &mut Vec<u8>, entry: &[u8], slot: u8, partial: bool) {
    let word = ((entry.len() as u32) << 2) | (u32::from(slot) << 1) | u32::from(partial);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&word.to_le_bytes());
    hasher.update(entry);

    buf.extend_from_slice(&hasher.finalize().to_le_bytes());
    buf.extend_from_slice(&word.to_le_bytes());
    buf.extend_from_slice(entry);
}

fn decode_slot(buf: &[u8]) -> Option<(u64, Vec<u8>)> {
    if buf.len() < SLOT_FRAME_SIZE {
        return None;
    }

    let crc = u32::from_le_bytes(buf[0..4].try_into().ok()?);
    let len = u32::from_le_bytes(buf[4..8].try_into().ok()?) as usize;
    let version = u64::from_le_bytes(buf[8..16].try_into().ok()?);

    if len > MAX_HEADER_LEN || SLOT_FRAME_SIZE + len > buf.len() || version == 0 {
        return None;
    }
    if crc32fast::hash(&buf[4..SLOT_FRAME_SIZE + len]) != crc {
        return None;
    }

    Some((version, buf[SLOT_FRAME_SIZE..SLOT_FRAME_SIZE + len].to_vec()))
}

fn pick_header(slots: &[u8]) -> Result<(u8, u64, Vec<u8>)> {
    let size = HEADER_SLOT_SIZE as usize;
    let first = decode_slot(&slots[..size.min(slots.len())]);
    let second = if slots.len() > size {
        decode_slot(&slots[size..])
    } else {
        None
    };

    match (first, second) {
        (Some((v0, h0)), Some((v1, h1))) => Ok(if v1 > v0 { (1, v1, h1) } else { (0, v0, h0) }),
        (Some((v0, h0)), None) => {
            debug!("oplog header slot 1 is empty or invalid, using slot 0");
            Ok((0, v0, h0))
        }
        (None, Some((v1, h1))) => {
            debug!("oplog header slot 0 is empty or invalid, using slot 1");
            Ok((1, v1, h1))
        }
        (None, None) => Err(Error::Corruption("no valid oplog header".into())),
    }
}
