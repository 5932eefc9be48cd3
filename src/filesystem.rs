//! L2 partitioned append log over a raw block device (`spec.md` §4.4).
//! The original's `filesystem_lib.c`/`.h` aren't in this source tree —
//! only their call sites (`storer_lib.c`'s `filesystem_register_partition`/
//! `filesystem_store_element`/`filesystem_find_element_before_timestamp`)
//! — so this is grounded on that usage plus `eeprom_lib.c`'s notion of a
//! word-aligned, sector-wrapping store underneath it.
//!
//! A [`Filesystem`] owns a [`BlockDevice`] and up to [`MAX_PARTITIONS`]
//! independently ring-wrapping regions. Each partition is either *static*
//! (every element the same length) or *dynamic* (length-prefixed, chained
//! via `prev_len XOR cur_len` so a cursor can walk either direction without
//! a separate index). Partition bookkeeping (latest offset, latest
//! record-id, wrap count) is kept in RAM, not re-derived from the device on
//! boot — rebuilding that from a power-cycle is real firmware's job and is
//! out of scope here (`spec.md` §1's board-bring-up boundary).

use crate::config::{MAX_ELEMENT_HEADER_BYTES, MAX_ELEMENT_PAYLOAD_BYTES, MAX_PARTITIONS};
use crate::crc16;
use crate::error::{Error, Result};
use crate::hal::BlockDevice;
use heapless::Vec as HVec;

/// Static: every element is exactly `element_len` bytes. Dynamic: elements
/// carry their own length, up to `max_element_len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    Static { element_len: u16 },
    Dynamic { max_element_len: u16 },
}

/// Registration-time description of one partition (`spec.md` §4.4's
/// metadata header, minus the on-device persistence noted above).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionConfig {
    pub kind: PartitionKind,
    pub has_crc: bool,
    pub start_addr: u32,
    pub end_addr: u32,
}

impl PartitionConfig {
    fn region_len(&self) -> u32 {
        self.end_addr - self.start_addr
    }

    fn header_len(&self) -> u32 {
        let base = match self.kind {
            PartitionKind::Static { .. } => 2,
            PartitionKind::Dynamic { .. } => 6,
        };
        base + if self.has_crc { 2 } else { 0 }
    }

    fn max_payload_len(&self) -> u16 {
        match self.kind {
            PartitionKind::Static { element_len } => element_len,
            PartitionKind::Dynamic { max_element_len } => max_element_len,
        }
    }

    fn stride(&self, payload_len: u16) -> u32 {
        self.header_len() + payload_len as u32
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PartitionState {
    has_element: bool,
    latest_offset: u32,
    latest_record_id: u16,
    latest_len: u16,
    wrap_count: u32,
    /// Bumped on every append; a [`Cursor`] taken before the bump is stale.
    version: u32,
}

struct Partition {
    config: PartitionConfig,
    state: PartitionState,
}

/// Opaque handle returned by [`Filesystem::register_partition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionHandle(usize);

/// A position within one partition's element chain. Cheap to copy; becomes
/// stale (all reads return [`Error::InvalidState`]) the moment the owning
/// partition is appended to again (`spec.md` §4.4's iterator-invalidation
/// rule).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    offset: u32,
    len: u16,
    version: u32,
}

pub struct Filesystem<D: BlockDevice> {
    device: D,
    partitions: HVec<Partition, MAX_PARTITIONS>,
}

impl<D: BlockDevice> Filesystem<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            partitions: HVec::new(),
        }
    }

    pub fn register_partition(&mut self, config: PartitionConfig) -> Result<PartitionHandle> {
        let handle = PartitionHandle(self.partitions.len());
        self.partitions
            .push(Partition {
                config,
                state: PartitionState::default(),
            })
            .map_err(|_| Error::NoMemory)?;
        Ok(handle)
    }

    fn partition(&self, handle: PartitionHandle) -> Result<&Partition> {
        self.partitions.get(handle.0).ok_or(Error::InvalidParameter)
    }

    fn partition_mut(&mut self, handle: PartitionHandle) -> Result<&mut Partition> {
        self.partitions
            .get_mut(handle.0)
            .ok_or(Error::InvalidParameter)
    }

    /// Appends one element. `Err(Error::InvalidParameter)` if `payload`
    /// doesn't match the partition's static length, or exceeds a dynamic
    /// partition's declared max.
    pub fn append(&mut self, handle: PartitionHandle, payload: &[u8]) -> Result<()> {
        let part = self.partition_mut(handle)?;
        let cfg = part.config;
        match cfg.kind {
            PartitionKind::Static { element_len } => {
                if payload.len() != element_len as usize {
                    return Err(Error::InvalidParameter);
                }
            }
            PartitionKind::Dynamic { max_element_len } => {
                if payload.len() > max_element_len as usize {
                    return Err(Error::InvalidParameter);
                }
            }
        }
        if payload.len() > MAX_ELEMENT_PAYLOAD_BYTES {
            return Err(Error::InvalidParameter);
        }

        let prev_len = part.state.latest_len;
        let record_id = part.state.latest_record_id.wrapping_add(1);
        let stride = cfg.stride(payload.len() as u16);

        let mut offset = if !part.state.has_element {
            0
        } else {
            part.state.latest_offset + cfg.stride(prev_len)
        };
        let mut wrapped = false;
        if offset + stride > cfg.region_len() {
            offset = 0;
            wrapped = true;
        }

        let mut buf = [0u8; MAX_ELEMENT_HEADER_BYTES + MAX_ELEMENT_PAYLOAD_BYTES];
        let header_len = cfg.header_len() as usize;
        let mut pos = 0usize;
        buf[pos..pos + 2].copy_from_slice(&record_id.to_le_bytes());
        pos += 2;
        if let PartitionKind::Dynamic { .. } = cfg.kind {
            let cur_len = payload.len() as u16;
            buf[pos..pos + 2].copy_from_slice(&cur_len.to_le_bytes());
            pos += 2;
            let prev_xor_cur = prev_len ^ cur_len;
            buf[pos..pos + 2].copy_from_slice(&prev_xor_cur.to_le_bytes());
            pos += 2;
        }
        if cfg.has_crc {
            let crc = crc16::crc16(payload);
            buf[pos..pos + 2].copy_from_slice(&crc.to_le_bytes());
            pos += 2;
        }
        debug_assert_eq!(pos, header_len);
        buf[header_len..header_len + payload.len()].copy_from_slice(payload);

        self.device
            .store(cfg.start_addr + offset, &buf[..header_len + payload.len()])?;

        let part = self.partition_mut(handle)?;
        part.state.has_element = true;
        part.state.latest_offset = offset;
        part.state.latest_record_id = record_id;
        part.state.latest_len = payload.len() as u16;
        part.state.version = part.state.version.wrapping_add(1);
        if wrapped {
            part.state.wrap_count += 1;
        }
        Ok(())
    }

    /// A cursor positioned at the most recently appended element.
    /// `Err(Error::InvalidState)` if the partition has never been written.
    pub fn latest_cursor(&self, handle: PartitionHandle) -> Result<Cursor> {
        let part = self.partition(handle)?;
        if !part.state.has_element {
            return Err(Error::InvalidState);
        }
        Ok(Cursor {
            offset: part.state.latest_offset,
            len: part.state.latest_len,
            version: part.state.version,
        })
    }

    fn check_cursor(&self, handle: PartitionHandle, cursor: &Cursor) -> Result<()> {
        let part = self.partition(handle)?;
        if cursor.version != part.state.version {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    /// Decodes the element's payload at `cursor` into `buf`, returning the
    /// payload length. `Err(Error::InvalidData)` on a CRC mismatch (the
    /// caller's iteration loop skips and continues per `spec.md` §4.4's
    /// corruption policy); `Err(Error::InvalidState)` if `cursor` was
    /// invalidated by an intervening append.
    pub fn read_element(
        &mut self,
        handle: PartitionHandle,
        cursor: &Cursor,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.check_cursor(handle, cursor)?;
        let part = self.partition(handle)?;
        let cfg = part.config;
        let header_len = cfg.header_len() as usize;
        if cursor.len as usize > buf.len() {
            return Err(Error::InvalidParameter);
        }
        let mut hdr = [0u8; MAX_ELEMENT_HEADER_BYTES];
        self.device
            .read(cfg.start_addr + cursor.offset, &mut hdr[..header_len])?;
        self.device.read(
            cfg.start_addr + cursor.offset + header_len as u32,
            &mut buf[..cursor.len as usize],
        )?;
        if cfg.has_crc {
            let crc_stored = u16::from_le_bytes([hdr[header_len - 2], hdr[header_len - 1]]);
            let crc_computed = crc16::crc16(&buf[..cursor.len as usize]);
            if crc_stored != crc_computed {
                return Err(Error::InvalidData);
            }
        }
        Ok(cursor.len as usize)
    }

    fn read_header_len_at(&mut self, handle: PartitionHandle, offset: u32) -> Result<u16> {
        let part = self.partition(handle)?;
        let cfg = part.config;
        match cfg.kind {
            PartitionKind::Static { element_len } => Ok(element_len),
            PartitionKind::Dynamic { max_element_len } => {
                let mut hdr = [0u8; 4];
                self.device.read(cfg.start_addr + offset + 2, &mut hdr[..2])?;
                let cur_len = u16::from_le_bytes([hdr[0], hdr[1]]);
                if cur_len > max_element_len {
                    return Err(Error::InvalidData);
                }
                Ok(cur_len)
            }
        }
    }

    /// The oldest element still present (the slot right after the write
    /// head once the ring has wrapped at least once; offset 0 otherwise).
    fn oldest_offset(&self, handle: PartitionHandle) -> Result<u32> {
        let part = self.partition(handle)?;
        let cfg = part.config;
        if part.state.wrap_count == 0 {
            Ok(0)
        } else {
            let next = part.state.latest_offset + cfg.stride(part.state.latest_len);
            Ok(next % cfg.region_len())
        }
    }

    /// Advances to the next (more recent) element, or `Ok(None)` if
    /// `cursor` is already the latest.
    pub fn next_cursor(&mut self, handle: PartitionHandle, cursor: &Cursor) -> Result<Option<Cursor>> {
        self.check_cursor(handle, cursor)?;
        let part = self.partition(handle)?;
        if cursor.offset == part.state.latest_offset {
            return Ok(None);
        }
        let cfg = part.config;
        let version = part.state.version;
        let mut next_offset = cursor.offset + cfg.stride(cursor.len);
        if next_offset >= cfg.region_len() {
            next_offset = 0;
        }
        let next_len = self.read_header_len_at(handle, next_offset)?;
        Ok(Some(Cursor {
            offset: next_offset,
            len: next_len,
            version,
        }))
    }

    /// Steps to the previous (older) element, or `Ok(None)` once `cursor`
    /// is already the oldest surviving element.
    pub fn prev_cursor(&mut self, handle: PartitionHandle, cursor: &Cursor) -> Result<Option<Cursor>> {
        self.check_cursor(handle, cursor)?;
        let oldest = self.oldest_offset(handle)?;
        if cursor.offset == oldest {
            return Ok(None);
        }
        let part = self.partition(handle)?;
        let cfg = part.config;
        let version = part.state.version;
        let prev_len = match cfg.kind {
            PartitionKind::Static { element_len } => element_len,
            PartitionKind::Dynamic { .. } => {
                let header_len = cfg.header_len() as usize;
                let mut hdr = [0u8; MAX_ELEMENT_HEADER_BYTES];
                self.device
                    .read(cfg.start_addr + cursor.offset, &mut hdr[..header_len])?;
                let cur_len = u16::from_le_bytes([hdr[2], hdr[3]]);
                let prev_xor_cur = u16::from_le_bytes([hdr[4], hdr[5]]);
                prev_xor_cur ^ cur_len
            }
        };
        let stride_back = cfg.header_len() + prev_len as u32;
        let prev_offset = if stride_back > cursor.offset {
            cfg.region_len() - (stride_back - cursor.offset)
        } else {
            cursor.offset - stride_back
        };
        Ok(Some(Cursor {
            offset: prev_offset,
            len: prev_len,
            version,
        }))
    }

    /// Forward iteration with the corruption policy applied: a corrupt
    /// element is skipped, iteration continues with the next one.
    /// `Ok(None)` once there is nothing newer left to skip to.
    pub fn read_next_skipping_corrupt(
        &mut self,
        handle: PartitionHandle,
        cursor: &Cursor,
        buf: &mut [u8],
    ) -> Result<Option<(Cursor, usize)>> {
        let mut current = *cursor;
        loop {
            match self.next_cursor(handle, &current)? {
                None => return Ok(None),
                Some(next) => match self.read_element(handle, &next, buf) {
                    Ok(n) => return Ok(Some((next, n))),
                    Err(Error::InvalidData) => {
                        current = next;
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            }
        }
    }

    /// `find_chunk_from_timestamp` (`spec.md` §4.4): seeks to the latest
    /// element, then steps backward decoding each element's timestamp
    /// (via `decode_timestamp`, which returns `None` for a
    /// structurally-corrupt element), until one with `timestamp <= target`
    /// is found or the partition beginning is reached. Returns the cursor
    /// to resume forward iteration from with `read_next_skipping_corrupt`.
    pub fn find_from_timestamp<F>(
        &mut self,
        handle: PartitionHandle,
        target: crate::messages::Timestamp,
        mut decode_timestamp: F,
        buf: &mut [u8],
    ) -> Result<Option<Cursor>>
    where
        F: FnMut(&[u8]) -> Option<crate::messages::Timestamp>,
    {
        let mut cursor = match self.latest_cursor(handle) {
            Ok(c) => c,
            Err(Error::InvalidState) => return Ok(None),
            Err(e) => return Err(e),
        };
        loop {
            let ts = match self.read_element(handle, &cursor, buf) {
                Ok(n) => decode_timestamp(&buf[..n]),
                Err(Error::InvalidData) => None,
                Err(e) => return Err(e),
            };
            if let Some(ts) = ts {
                if ts <= target {
                    return Ok(Some(cursor));
                }
            }
            match self.prev_cursor(handle, &cursor)? {
                Some(prev) => cursor = prev,
                None => return Ok(Some(cursor)),
            }
        }
    }

    pub fn wrap_count(&self, handle: PartitionHandle) -> Result<u32> {
        Ok(self.partition(handle)?.state.wrap_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Timestamp;

    struct MemDevice {
        bytes: HVec<u8, 4096>,
    }

    impl MemDevice {
        fn new(size: usize) -> Self {
            let mut bytes = HVec::new();
            for _ in 0..size {
                bytes.push(0).unwrap();
            }
            Self { bytes }
        }
    }

    impl BlockDevice for MemDevice {
        fn capacity_bytes(&self) -> u32 {
            self.bytes.len() as u32
        }
        fn sector_size(&self) -> u32 {
            256
        }
        fn word_size(&self) -> u32 {
            4
        }
        fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
            let addr = addr as usize;
            buf.copy_from_slice(&self.bytes[addr..addr + buf.len()]);
            Ok(())
        }
        fn store(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
            let addr = addr as usize;
            self.bytes[addr..addr + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
        fn is_ready(&self) -> bool {
            true
        }
    }

    fn static_partition(fs: &mut Filesystem<MemDevice>, element_len: u16, has_crc: bool, len: u32) -> PartitionHandle {
        fs.register_partition(PartitionConfig {
            kind: PartitionKind::Static { element_len },
            has_crc,
            start_addr: 0,
            end_addr: len,
        })
        .unwrap()
    }

    #[test]
    fn append_and_read_latest_round_trips() {
        let mut fs = Filesystem::new(MemDevice::new(1024));
        let h = static_partition(&mut fs, 4, true, 1024);
        fs.append(h, &[1, 2, 3, 4]).unwrap();
        let cursor = fs.latest_cursor(h).unwrap();
        let mut buf = [0u8; 8];
        let n = fs.read_element(h, &cursor, &mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3, 4]);
    }

    #[test]
    fn forward_iteration_visits_append_order() {
        let mut fs = Filesystem::new(MemDevice::new(1024));
        let h = static_partition(&mut fs, 2, false, 1024);
        for i in 0u8..5 {
            fs.append(h, &[i, i]).unwrap();
        }
        // Walk back to the oldest, then forward.
        let mut cursor = fs.latest_cursor(h).unwrap();
        while let Some(prev) = fs.prev_cursor(h, &cursor).unwrap() {
            cursor = prev;
        }
        let mut buf = [0u8; 4];
        let n = fs.read_element(h, &cursor, &mut buf).unwrap();
        assert_eq!(buf[..n], [0, 0]);
        let mut seen = heapless::Vec::<u8, 8>::new();
        seen.push(buf[0]).unwrap();
        let mut c = cursor;
        while let Some((next, n)) = fs.read_next_skipping_corrupt(h, &c, &mut buf).unwrap() {
            seen.push(buf[0]).unwrap();
            c = next;
            let _ = n;
        }
        assert_eq!(seen.as_slice(), &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn stale_cursor_after_append_is_invalid_state() {
        let mut fs = Filesystem::new(MemDevice::new(1024));
        let h = static_partition(&mut fs, 2, false, 1024);
        fs.append(h, &[1, 1]).unwrap();
        let cursor = fs.latest_cursor(h).unwrap();
        fs.append(h, &[2, 2]).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            fs.read_element(h, &cursor, &mut buf),
            Err(Error::InvalidState)
        );
    }

    #[test]
    fn corrupt_crc_is_invalid_data_and_skippable() {
        let mut fs = Filesystem::new(MemDevice::new(1024));
        let h = static_partition(&mut fs, 2, true, 1024);
        fs.append(h, &[9, 9]).unwrap();
        fs.append(h, &[8, 8]).unwrap();
        // Corrupt the first element's payload in place (device-level
        // poke — out of band with the filesystem API, simulating bit rot).
        // Header is record_id(2) + crc(2) = 4 bytes; payload starts at 4.
        fs.device.bytes[4] ^= 0xFF;
        let mut cursor = fs.latest_cursor(h).unwrap();
        while let Some(prev) = fs.prev_cursor(h, &cursor).unwrap() {
            cursor = prev;
        }
        let mut buf = [0u8; 4];
        assert_eq!(
            fs.read_element(h, &cursor, &mut buf),
            Err(Error::InvalidData)
        );
        // Skipping forward past the corrupt element still finds the next.
        let (_, n) = fs.read_next_skipping_corrupt(h, &cursor, &mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], &[8, 8]);
    }

    #[test]
    fn dynamic_partition_chains_lengths_both_directions() {
        let mut fs = Filesystem::new(MemDevice::new(1024));
        let h = fs
            .register_partition(PartitionConfig {
                kind: PartitionKind::Dynamic {
                    max_element_len: 16,
                },
                has_crc: true,
                start_addr: 0,
                end_addr: 1024,
            })
            .unwrap();
        fs.append(h, &[1, 2, 3]).unwrap();
        fs.append(h, &[4, 5]).unwrap();
        fs.append(h, &[6, 7, 8, 9]).unwrap();

        let mut cursor = fs.latest_cursor(h).unwrap();
        let mut buf = [0u8; 16];
        let n = fs.read_element(h, &cursor, &mut buf).unwrap();
        assert_eq!(&buf[..n], &[6, 7, 8, 9]);

        cursor = fs.prev_cursor(h, &cursor).unwrap().unwrap();
        let n = fs.read_element(h, &cursor, &mut buf).unwrap();
        assert_eq!(&buf[..n], &[4, 5]);

        cursor = fs.prev_cursor(h, &cursor).unwrap().unwrap();
        let n = fs.read_element(h, &cursor, &mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);

        assert!(fs.prev_cursor(h, &cursor).unwrap().is_none());
    }

    #[test]
    fn wrap_around_overwrites_oldest_ring_style() {
        // Region fits exactly 3 elements of (header 2 + payload 2) = 4
        // bytes each; the 4th append must wrap and overwrite the first.
        let mut fs = Filesystem::new(MemDevice::new(12));
        let h = static_partition(&mut fs, 2, false, 12);
        fs.append(h, &[1, 1]).unwrap();
        fs.append(h, &[2, 2]).unwrap();
        fs.append(h, &[3, 3]).unwrap();
        assert_eq!(fs.wrap_count(h).unwrap(), 0);
        fs.append(h, &[4, 4]).unwrap();
        assert_eq!(fs.wrap_count(h).unwrap(), 1);

        let mut cursor = fs.latest_cursor(h).unwrap();
        let mut buf = [0u8; 4];
        let n = fs.read_element(h, &cursor, &mut buf).unwrap();
        assert_eq!(&buf[..n], &[4, 4]);
        // Oldest surviving element is now [2,2] (the one after the wrapped
        // write head), not [1,1] (overwritten).
        while let Some(prev) = fs.prev_cursor(h, &cursor).unwrap() {
            cursor = prev;
        }
        let n = fs.read_element(h, &cursor, &mut buf).unwrap();
        assert_eq!(&buf[..n], &[2, 2]);
    }

    fn encode_stamp(seconds: u32, ms: u16) -> [u8; 6] {
        let mut out = [0u8; 6];
        out[..4].copy_from_slice(&seconds.to_le_bytes());
        out[4..].copy_from_slice(&ms.to_le_bytes());
        out
    }

    fn decode_stamp(bytes: &[u8]) -> Option<Timestamp> {
        if bytes.len() < 6 {
            return None;
        }
        let seconds = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let ms = u16::from_le_bytes([bytes[4], bytes[5]]);
        Some(Timestamp { seconds, ms })
    }

    #[test]
    fn find_from_timestamp_lands_on_closest_not_after_target() {
        let mut fs = Filesystem::new(MemDevice::new(1024));
        let h = static_partition(&mut fs, 6, false, 1024);
        for s in [10u32, 20, 30, 40] {
            fs.append(h, &encode_stamp(s, 0)).unwrap();
        }
        let found = fs
            .find_from_timestamp(
                h,
                Timestamp { seconds: 25, ms: 0 },
                decode_stamp,
                &mut [0u8; 8],
            )
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 8];
        let n = fs.read_element(h, &found, &mut buf).unwrap();
        assert_eq!(decode_stamp(&buf[..n]).unwrap().seconds, 20);
    }
}
