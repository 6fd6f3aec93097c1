//! On-disk object record format (§6 EXTERNAL INTERFACES):
//! `[u32 object_size][object_hdr][payload]`, `object_size = sizeof(hdr) +
//! payload_size`. All integers little-endian; cross-endian portability is
//! not a goal.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::error::{BpError, Result};

/// `{ i32 handle; u64 sid; u32 size; }`, persisted.
pub const OBJECT_HDR_LEN: usize = 4 + 8 + 4;

/// Written into the on-disk header's `sid` field at enqueue time. `dequeue`
/// and `retrieve` overwrite `sid` in the object they hand back, so a
/// consumer that reads the persisted value instead gets this sentinel
/// rather than a real storage id (§9 Open Question (b)).
pub const SID_VACANT: u64 = 0;

#[derive(Debug, Clone, Copy)]
pub struct ObjectHeader {
    pub handle: i32,
    pub sid: u64,
    pub size: u32,
}

impl ObjectHeader {
    pub fn encode(&self) -> [u8; OBJECT_HDR_LEN] {
        let mut buf = [0u8; OBJECT_HDR_LEN];
        buf[0..4].copy_from_slice(&self.handle.to_le_bytes());
        buf[4..12].copy_from_slice(&self.sid.to_le_bytes());
        buf[12..16].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            handle: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            sid: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            size: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        }
    }
}

/// Re-sync helper for cursor recovery after a flagged I/O error (§4.3, §9
/// Open Question (a)): seek to the chapter's start and walk forward
/// `count` size-prefixed records, returning the position just past the
/// last one walked. Does not validate record contents beyond the leading
/// size prefix and does not truncate a malformed trailing record left by
/// an interrupted write — the source tolerates this silently and so does
/// this crate.
pub fn walk_records(file: &mut File, count: u32) -> Result<u64> {
    file.seek(SeekFrom::Start(0))?;
    for _ in 0..count {
        let mut size_buf = [0u8; 4];
        file.read_exact(&mut size_buf)
            .map_err(|e| BpError::failed_store(format!("re-sync: short record header: {e}")))?;
        let size = u32::from_le_bytes(size_buf) as i64;
        file.seek(SeekFrom::Current(size))?;
    }
    Ok(file.stream_position()?)
}

/// Read one `[u32 size][object_hdr][payload]` record at the cursor's
/// current position.
pub fn read_record(file: &mut File) -> Result<(ObjectHeader, Vec<u8>)> {
    let mut size_buf = [0u8; 4];
    file.read_exact(&mut size_buf)
        .map_err(|e| BpError::failed_store(format!("short read: {e}")))?;
    let object_size = u32::from_le_bytes(size_buf) as usize;
    if object_size < OBJECT_HDR_LEN {
        return Err(BpError::failed_store("corrupt record: size smaller than header"));
    }
    let mut body = vec![0u8; object_size];
    file.read_exact(&mut body)
        .map_err(|e| BpError::failed_store(format!("short read: {e}")))?;
    let hdr = ObjectHeader::decode(&body[..OBJECT_HDR_LEN]);
    let payload = body[OBJECT_HDR_LEN..].to_vec();
    Ok((hdr, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn header_roundtrips_through_encode_decode() {
        let hdr = ObjectHeader { handle: -7, sid: 42, size: 100 };
        let decoded = ObjectHeader::decode(&hdr.encode());
        assert_eq!(decoded.handle, -7);
        assert_eq!(decoded.sid, 42);
        assert_eq!(decoded.size, 100);
    }

    #[test]
    fn walk_records_lands_past_the_nth_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chapter.dat");
        {
            let mut f = File::create(&path).unwrap();
            for i in 0..3u32 {
                let hdr = ObjectHeader { handle: 0, sid: SID_VACANT, size: 1 };
                let object_size = (OBJECT_HDR_LEN + 1) as u32;
                f.write_all(&object_size.to_le_bytes()).unwrap();
                f.write_all(&hdr.encode()).unwrap();
                f.write_all(&[i as u8]).unwrap();
            }
        }
        let mut f = std::fs::OpenOptions::new().read(true).open(&path).unwrap();
        let pos_after_2 = walk_records(&mut f, 2).unwrap();
        f.seek(SeekFrom::Start(pos_after_2)).unwrap();
        let (_, payload) = read_record(&mut f).unwrap();
        assert_eq!(payload, vec![2u8]);
    }
}
