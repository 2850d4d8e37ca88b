//! L4: the WOZ1/WOZ2 container — chunked file format wrapping a [`NibbleDisk`].
//!
//! Chunk IDs, CRC32 table, and the chunk-scan loop are grounded on
//! `img/woz.rs` (`INFO_ID`/`TMAP_ID`/`TRKS_ID`/`get_next_chunk`/`crc32`); the INFO/TMAP/
//! TRKS field layouts are grounded on `original_source/clem_woz.h`'s `ClemensWOZDisk`.

use super::nibble::NibbleDisk;
use super::{DiskResult, DiskType, Error, LIMIT_QTR_TRACKS, UNINITIALIZED_TRACK};

pub const INFO_ID: u32 = 0x4f464e49;
pub const TMAP_ID: u32 = 0x50414d54;
pub const TRKS_ID: u32 = 0x534b5254;
pub const WRIT_ID: u32 = 0x54495257;
pub const META_ID: u32 = 0x4154454d;

const MAGIC_WOZ1: [u8; 4] = *b"WOZ1";
const MAGIC_WOZ2: [u8; 4] = *b"WOZ2";
const FIXED_HEADER: [u8; 4] = [0xff, 0x0a, 0x0d, 0x0a];
const TRK_ENTRY_SIZE: usize = 8;
const TRKS_TABLE_BYTES: usize = LIMIT_QTR_TRACKS * TRK_ENTRY_SIZE;
const BLOCK_SIZE: usize = 512;

const CRC32_TAB: [u32; 256] = [
    0x00000000, 0x77073096, 0xee0e612c, 0x990951ba, 0x076dc419, 0x706af48f, 0xe963a535, 0x9e6495a3,
    0x0edb8832, 0x79dcb8a4, 0xe0d5e91e, 0x97d2d988, 0x09b64c2b, 0x7eb17cbd, 0xe7b82d07, 0x90bf1d91,
    0x1db71064, 0x6ab020f2, 0xf3b97148, 0x84be41de, 0x1adad47d, 0x6ddde4eb, 0xf4d4b551, 0x83d385c7,
    0x136c9856, 0x646ba8c0, 0xfd62f97a, 0x8a65c9ec, 0x14015c4f, 0x63066cd9, 0xfa0f3d63, 0x8d080df5,
    0x3b6e20c8, 0x4c69105e, 0xd56041e4, 0xa2677172, 0x3c03e4d1, 0x4b04d447, 0xd20d85fd, 0xa50ab56b,
    0x35b5a8fa, 0x42b2986c, 0xdbbbc9d6, 0xacbcf940, 0x32d86ce3, 0x45df5c75, 0xdcd60dcf, 0xabd13d59,
    0x26d930ac, 0x51de003a, 0xc8d75180, 0xbfd06116, 0x21b4f4b5, 0x56b3c423, 0xcfba9599, 0xb8bda50f,
    0x2802b89e, 0x5f058808, 0xc60cd9b2, 0xb10be924, 0x2f6f7c87, 0x58684c11, 0xc1611dab, 0xb6662d3d,
    0x76dc4190, 0x01db7106, 0x98d220bc, 0xefd5102a, 0x71b18589, 0x06b6b51f, 0x9fbfe4a5, 0xe8b8d433,
    0x7807c9a2, 0x0f00f934, 0x9609a88e, 0xe10e9818, 0x7f6a0dbb, 0x086d3d2d, 0x91646c97, 0xe6635c01,
    0x6b6b51f4, 0x1c6c6162, 0x856530d8, 0xf262004e, 0x6c0695ed, 0x1b01a57b, 0x8208f4c1, 0xf50fc457,
    0x65b0d9c6, 0x12b7e950, 0x8bbeb8ea, 0xfcb9887c, 0x62dd1ddf, 0x15da2d49, 0x8cd37cf3, 0xfbd44c65,
    0x4db26158, 0x3ab551ce, 0xa3bc0074, 0xd4bb30e2, 0x4adfa541, 0x3dd895d7, 0xa4d1c46d, 0xd3d6f4fb,
    0x4369e96a, 0x346ed9fc, 0xad678846, 0xda60b8d0, 0x44042d73, 0x33031de5, 0xaa0a4c5f, 0xdd0d7cc9,
    0x5005713c, 0x270241aa, 0xbe0b1010, 0xc90c2086, 0x5768b525, 0x206f85b3, 0xb966d409, 0xce61e49f,
    0x5edef90e, 0x29d9c998, 0xb0d09822, 0xc7d7a8b4, 0x59b33d17, 0x2eb40d81, 0xb7bd5c3b, 0xc0ba6cad,
    0xedb88320, 0x9abfb3b6, 0x03b6e20c, 0x74b1d29a, 0xead54739, 0x9dd277af, 0x04db2615, 0x73dc1683,
    0xe3630b12, 0x94643b84, 0x0d6d6a3e, 0x7a6a5aa8, 0xe40ecf0b, 0x9309ff9d, 0x0a00ae27, 0x7d079eb1,
    0xf00f9344, 0x8708a3d2, 0x1e01f268, 0x6906c2fe, 0xf762575d, 0x806567cb, 0x196c3671, 0x6e6b06e7,
    0xfed41b76, 0x89d32be0, 0x10da7a5a, 0x67dd4acc, 0xf9b9df6f, 0x8ebeeff9, 0x17b7be43, 0x60b08ed5,
    0xd6d6a3e8, 0xa1d1937e, 0x38d8c2c4, 0x4fdff252, 0xd1bb67f1, 0xa6bc5767, 0x3fb506dd, 0x48b2364b,
    0xd80d2bda, 0xaf0a1b4c, 0x36034af6, 0x41047a60, 0xdf60efc3, 0xa867df55, 0x316e8eef, 0x4669be79,
    0xcb61b38c, 0xbc66831a, 0x256fd2a0, 0x5268e236, 0xcc0c7795, 0xbb0b4703, 0x220216b9, 0x5505262f,
    0xc5ba3bbe, 0xb2bd0b28, 0x2bb45a92, 0x5cb36a04, 0xc2d7ffa7, 0xb5d0cf31, 0x2cd99e8b, 0x5bdeae1d,
    0x9b64c2b0, 0xec63f226, 0x756aa39c, 0x026d930a, 0x9c0906a9, 0xeb0e363f, 0x72076785, 0x05005713,
    0x95bf4a82, 0xe2b87a14, 0x7bb12bae, 0x0cb61b38, 0x92d28e9b, 0xe5d5be0d, 0x7cdcefb7, 0x0bdbdf21,
    0x86d3d2d4, 0xf1d4e242, 0x68ddb3f8, 0x1fda836e, 0x81be16cd, 0xf6b9265b, 0x6fb077e1, 0x18b74777,
    0x88085ae6, 0xff0f6a70, 0x66063bca, 0x11010b5c, 0x8f659eff, 0xf862ae69, 0x616bffd3, 0x166ccf45,
    0xa00ae278, 0xd70dd2ee, 0x4e048354, 0x3903b3c2, 0xa7672661, 0xd06016f7, 0x4969474d, 0x3e6e77db,
    0xaed16a4a, 0xd9d65adc, 0x40df0b66, 0x37d83bf0, 0xa9bcae53, 0xdebb9ec5, 0x47b2cf7f, 0x30b5ffe9,
    0xbdbdf21c, 0xcabac28a, 0x53b39330, 0x24b4a3a6, 0xbad03605, 0xcdd70693, 0x54de5729, 0x23d967bf,
    0xb3667a2e, 0xc4614ab8, 0x5d681b02, 0x2a6f2b94, 0xb40bbe37, 0xc30c8ea1, 0x5a05df1b, 0x2d02ef8d,
];

pub fn crc32(crc_seed: u32, buf: &[u8]) -> u32 {
    let mut crc = crc_seed ^ !0u32;
    for &b in buf {
        crc = CRC32_TAB[((crc ^ b as u32) & 0xff) as usize] ^ (crc >> 8);
    }
    crc ^ !0u32
}

/// Returns `(next_ptr, id, Some(chunk_bytes_including_id_and_size))`, or
/// `(0, id, None)` for a truncated chunk header or a chunk whose declared size runs
/// past EOF. Every well-formed chunk's bytes are returned regardless of id, so an
/// unrecognized chunk type can still be preserved by the caller.
fn get_next_chunk(ptr: usize, buf: &[u8]) -> (usize, u32, Option<Vec<u8>>) {
    if ptr + 8 > buf.len() {
        return (0, 0, None);
    }
    let id = u32::from_le_bytes(buf[ptr..ptr + 4].try_into().unwrap());
    let size = u32::from_le_bytes(buf[ptr + 4..ptr + 8].try_into().unwrap());
    let end = ptr + 8 + size as usize;
    if end > buf.len() {
        return (0, 0, None);
    }
    let mut next = end;
    if next + 8 > buf.len() {
        next = 0;
    }
    (next, id, Some(buf[ptr..end].to_vec()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WozVersion {
    V1,
    V2,
}

#[derive(Debug, Clone)]
pub struct WozInfo {
    pub version: u8,
    pub disk_type: DiskType,
    pub write_protected: bool,
    pub synchronized: bool,
    pub cleaned: bool,
    pub creator: [u8; 32],
    pub disk_sides: u8,
    pub boot_sector_format: u8,
    pub optimal_bit_timing: u8,
    pub compatible_hardware: u16,
    pub required_ram_kb: u16,
    pub largest_track_blocks: u16,
}

impl Default for WozInfo {
    fn default() -> Self {
        let mut creator = [0x20u8; 32];
        let name = b"clem-disk";
        creator[..name.len()].copy_from_slice(name);
        Self {
            version: 2,
            disk_type: DiskType::D525,
            write_protected: false,
            synchronized: false,
            cleaned: false,
            creator,
            disk_sides: 1,
            boot_sector_format: 0,
            optimal_bit_timing: 32,
            compatible_hardware: 0,
            required_ram_kb: 0,
            largest_track_blocks: 13,
        }
    }
}

/// A parsed or in-construction WOZ container: the INFO/TMAP/TRKS chunks plus any
/// unrecognized chunks, preserved byte-for-byte so a round trip doesn't drop data.
#[derive(Debug, Clone)]
pub struct WozImage {
    pub version: WozVersion,
    pub info: WozInfo,
    pub disk: NibbleDisk,
    pub meta: Option<Vec<u8>>,
    pub other_chunks: Vec<(u32, Vec<u8>)>,
}

fn parse_info(chunk: &[u8]) -> DiskResult<WozInfo> {
    let body = &chunk[8..];
    if body.len() < 37 {
        return Err(Error::InvalidImage("INFO chunk too short".into()));
    }
    let version = body[0];
    if version == 0 || version > 2 {
        return Err(Error::VersionNotSupported(format!("WOZ INFO version {version}")));
    }
    let disk_type = match body[1] {
        1 => DiskType::D525,
        2 => DiskType::D35,
        other => return Err(Error::InvalidImage(format!("unknown WOZ disk type {other}"))),
    };
    let write_protected = body[2] != 0;
    let synchronized = body[3] != 0;
    let cleaned = body[4] != 0;
    let mut creator = [0u8; 32];
    creator.copy_from_slice(&body[5..37]);
    let disk_sides = if body.len() > 37 { body[37] } else { 1 };
    let boot_sector_format = if body.len() > 38 { body[38] } else { 0 };
    let optimal_bit_timing = if body.len() > 39 { body[39] } else { 32 };
    let compatible_hardware = if body.len() > 41 { u16::from_le_bytes([body[40], body[41]]) } else { 0 };
    let required_ram_kb = if body.len() > 43 { u16::from_le_bytes([body[42], body[43]]) } else { 0 };
    let largest_track_blocks = if body.len() > 45 { u16::from_le_bytes([body[44], body[45]]) } else { 13 };
    Ok(WozInfo {
        version,
        disk_type,
        write_protected,
        synchronized,
        cleaned,
        creator,
        disk_sides,
        boot_sector_format,
        optimal_bit_timing,
        compatible_hardware,
        required_ram_kb,
        largest_track_blocks,
    })
}

fn serialize_info(info: &WozInfo) -> Vec<u8> {
    let mut body = vec![0u8; 60];
    body[0] = info.version;
    body[1] = match info.disk_type {
        DiskType::D525 => 1,
        DiskType::D35 => 2,
        _ => 1,
    };
    body[2] = info.write_protected as u8;
    body[3] = info.synchronized as u8;
    body[4] = info.cleaned as u8;
    body[5..37].copy_from_slice(&info.creator);
    body[37] = info.disk_sides;
    body[38] = info.boot_sector_format;
    body[39] = info.optimal_bit_timing;
    body[40..42].copy_from_slice(&info.compatible_hardware.to_le_bytes());
    body[42..44].copy_from_slice(&info.required_ram_kb.to_le_bytes());
    body[44..46].copy_from_slice(&info.largest_track_blocks.to_le_bytes());
    wrap_chunk(INFO_ID, &body)
}

fn wrap_chunk(id: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Parses a complete `.woz` file per §4.4/§6.2.
pub fn parse(buf: &[u8]) -> DiskResult<WozImage> {
    if buf.len() < 12 {
        return Err(Error::InvalidImage("file shorter than WOZ fixed header".into()));
    }
    let version = if buf[0..4] == MAGIC_WOZ1 {
        WozVersion::V1
    } else if buf[0..4] == MAGIC_WOZ2 {
        WozVersion::V2
    } else {
        return Err(Error::InvalidImage("bad WOZ magic".into()));
    };
    if buf[4..8] != FIXED_HEADER {
        return Err(Error::InvalidImage("bad WOZ fixed trailer bytes".into()));
    }
    let stored_crc = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    if stored_crc != 0 {
        let computed = crc32(0, &buf[12..]);
        if computed != stored_crc {
            return Err(Error::InvalidImage("WOZ CRC32 mismatch".into()));
        }
    }

    let mut info: Option<WozInfo> = None;
    let mut tmap: Option<[u8; LIMIT_QTR_TRACKS]> = None;
    let mut trks_chunk: Option<Vec<u8>> = None;
    let mut meta = None;
    let mut other_chunks = Vec::new();

    let mut ptr = 12usize;
    let mut first = true;
    loop {
        let (next, id, chunk) = get_next_chunk(ptr, buf);
        let Some(c) = chunk else { break };
        if first {
            if id != INFO_ID {
                return Err(Error::InvalidImage("INFO chunk must be the first chunk".into()));
            }
            first = false;
        }
        match id {
            INFO_ID => info = Some(parse_info(&c)?),
            TMAP_ID => {
                let body = &c[8..];
                if body.len() < LIMIT_QTR_TRACKS {
                    return Err(Error::InvalidImage("TMAP chunk too short".into()));
                }
                let mut arr = [UNINITIALIZED_TRACK; LIMIT_QTR_TRACKS];
                arr.copy_from_slice(&body[..LIMIT_QTR_TRACKS]);
                tmap = Some(arr);
            }
            TRKS_ID => trks_chunk = Some(c),
            META_ID => meta = Some(c[8..].to_vec()),
            other_id => other_chunks.push((other_id, c)),
        }
        if next == 0 {
            break;
        }
        ptr = next;
    }

    let info = info.ok_or_else(|| Error::InvalidImage("WOZ file missing INFO chunk".into()))?;
    let tmap = tmap.ok_or_else(|| Error::InvalidImage("WOZ file missing TMAP chunk".into()))?;
    let trks_chunk = trks_chunk.ok_or_else(|| Error::InvalidImage("WOZ file missing TRKS chunk".into()))?;

    let mut disk = NibbleDisk::empty(info.disk_type);
    disk.is_write_protected = info.write_protected;
    disk.is_double_sided = info.disk_sides > 1;
    disk.meta_track_map = tmap;

    let body = &trks_chunk[8..];
    if body.len() < TRKS_TABLE_BYTES {
        return Err(Error::InvalidImage("TRKS chunk table too short".into()));
    }
    let mut track_count = 0u32;
    for q in 0..LIMIT_QTR_TRACKS {
        if disk.meta_track_map[q] == UNINITIALIZED_TRACK {
            continue;
        }
        let phys = disk.meta_track_map[q] as usize;
        if phys != q {
            continue; // alias entries resolve through the physical slot, installed below
        }
        let entry = &body[phys * TRK_ENTRY_SIZE..phys * TRK_ENTRY_SIZE + TRK_ENTRY_SIZE];
        let starting_block = u16::from_le_bytes([entry[0], entry[1]]) as usize;
        let block_count = u16::from_le_bytes([entry[2], entry[3]]) as usize;
        let bit_count = u32::from_le_bytes(entry[4..8].try_into().unwrap());
        let byte_start = starting_block * BLOCK_SIZE;
        let byte_len = block_count * BLOCK_SIZE;
        if byte_start + byte_len > body.len() {
            return Err(Error::InvalidImage("TRKS track data runs past chunk end".into()));
        }
        let bytes = body[byte_start..byte_start + byte_len].to_vec();
        disk.track_byte_offset[phys] = disk.bits_data.len() as u32;
        disk.track_byte_count[phys] = bytes.len() as u32;
        disk.track_bits_count[phys] = bit_count;
        disk.track_initialized[phys] = 1;
        disk.bits_data.extend_from_slice(&bytes);
        track_count += 1;
    }
    disk.track_count = track_count;

    Ok(WozImage { version, info, disk, meta, other_chunks })
}

/// Serializes a [`WozImage`] back to bytes, rebuilding TMAP/TRKS from the current
/// `disk` state and recomputing the CRC32 over everything after the fixed header.
pub fn serialize(img: &WozImage) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&serialize_info(&img.info));

    let mut tmap_body = vec![UNINITIALIZED_TRACK; LIMIT_QTR_TRACKS];
    tmap_body.copy_from_slice(&img.disk.meta_track_map);
    body.extend_from_slice(&wrap_chunk(TMAP_ID, &tmap_body));

    let mut trk_table = vec![0u8; TRKS_TABLE_BYTES];
    let mut trk_data = Vec::new();
    let mut next_block = ((TRKS_TABLE_BYTES + BLOCK_SIZE - 1) / BLOCK_SIZE) as u16;
    for phys in 0..LIMIT_QTR_TRACKS {
        if img.disk.track_initialized[phys] == 0 {
            continue;
        }
        let off = img.disk.track_byte_offset[phys] as usize;
        let len = img.disk.track_byte_count[phys] as usize;
        let bytes = &img.disk.bits_data[off..off + len];
        let blocks = ((len + BLOCK_SIZE - 1) / BLOCK_SIZE) as u16;
        let entry = &mut trk_table[phys * TRK_ENTRY_SIZE..phys * TRK_ENTRY_SIZE + TRK_ENTRY_SIZE];
        entry[0..2].copy_from_slice(&next_block.to_le_bytes());
        entry[2..4].copy_from_slice(&blocks.to_le_bytes());
        entry[4..8].copy_from_slice(&img.disk.track_bits_count[phys].to_le_bytes());
        trk_data.extend_from_slice(bytes);
        trk_data.resize(trk_data.len() + (blocks as usize * BLOCK_SIZE - len), 0);
        next_block += blocks;
    }
    let mut trks_body = trk_table;
    trks_body.extend_from_slice(&trk_data);
    body.extend_from_slice(&wrap_chunk(TRKS_ID, &trks_body));

    if let Some(meta) = &img.meta {
        body.extend_from_slice(&wrap_chunk(META_ID, meta));
    }
    for (_id, chunk) in &img.other_chunks {
        body.extend_from_slice(chunk);
    }

    let magic = match img.version {
        WozVersion::V1 => MAGIC_WOZ1,
        WozVersion::V2 => MAGIC_WOZ2,
    };
    let crc = crc32(0, &body);
    let mut out = Vec::with_capacity(12 + body.len());
    out.extend_from_slice(&magic);
    out.extend_from_slice(&FIXED_HEADER);
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_disk() -> NibbleDisk {
        let mut d = NibbleDisk::empty(DiskType::D525);
        for t in 0..35usize {
            let bytes = vec![0xaau8; 6400];
            d.install_track(t * 4, bytes, 51200, 4);
        }
        d.track_count = 35;
        d
    }

    #[test]
    fn serialize_then_parse_round_trips() {
        let img = WozImage {
            version: WozVersion::V2,
            info: WozInfo::default(),
            disk: sample_disk(),
            meta: Some(b"title\tTest Disk".to_vec()),
            other_chunks: Vec::new(),
        };
        let bytes = serialize(&img);
        assert_eq!(&bytes[0..4], &MAGIC_WOZ2);
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed.version, WozVersion::V2);
        assert_eq!(parsed.disk.track_count, 35);
        assert_eq!(parsed.meta.as_deref(), Some(&b"title\tTest Disk"[..]));
        for t in 0..35usize {
            let (bits, bit_count) = parsed.disk.get_track_bits(t * 4).unwrap();
            assert_eq!(bit_count, 51200);
            assert_eq!(bits.len(), 6400);
            assert!(bits.iter().all(|&b| b == 0xaa));
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = serialize(&WozImage {
            version: WozVersion::V1,
            info: WozInfo::default(),
            disk: sample_disk(),
            meta: None,
            other_chunks: Vec::new(),
        });
        bytes[0] = b'X';
        assert!(matches!(parse(&bytes), Err(Error::InvalidImage(_))));
    }

    #[test]
    fn rejects_corrupted_crc() {
        let mut bytes = serialize(&WozImage {
            version: WozVersion::V2,
            info: WozInfo::default(),
            disk: sample_disk(),
            meta: None,
            other_chunks: Vec::new(),
        });
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(parse(&bytes), Err(Error::InvalidImage(_))));
    }

    #[test]
    fn unknown_chunk_survives_round_trip() {
        const XTRA_ID: u32 = 0x41525458; // "XTRA"
        let img = WozImage {
            version: WozVersion::V2,
            info: WozInfo::default(),
            disk: sample_disk(),
            meta: None,
            other_chunks: vec![(XTRA_ID, wrap_chunk(XTRA_ID, b"hello"))],
        };
        let bytes = serialize(&img);
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed.other_chunks, vec![(XTRA_ID, wrap_chunk(XTRA_ID, b"hello"))]);
    }

    #[test]
    fn rejects_info_not_first() {
        let img = WozImage {
            version: WozVersion::V2,
            info: WozInfo::default(),
            disk: sample_disk(),
            meta: None,
            other_chunks: Vec::new(),
        };
        let mut bytes = serialize(&img);
        // swap the INFO chunk (at byte 12) and TMAP chunk so TMAP comes first.
        let info_len = 8 + u32::from_le_bytes(bytes[16..20].try_into().unwrap()) as usize;
        let tmap_start = 12 + info_len;
        let tmap_len = 8 + u32::from_le_bytes(bytes[tmap_start + 4..tmap_start + 8].try_into().unwrap()) as usize;
        let mut body = bytes[12..].to_vec();
        body[0..tmap_len + info_len].rotate_left(info_len);
        bytes.truncate(12);
        bytes.extend_from_slice(&body);
        let crc = crc32(0, &bytes[12..]);
        bytes[8..12].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(parse(&bytes), Err(Error::InvalidImage(_))));
    }

    #[test]
    fn rejects_version_above_2() {
        let mut img = WozImage {
            version: WozVersion::V2,
            info: WozInfo::default(),
            disk: sample_disk(),
            meta: None,
            other_chunks: Vec::new(),
        };
        img.info.version = 3;
        let bytes = serialize(&img);
        assert!(matches!(parse(&bytes), Err(Error::VersionNotSupported(_))));
    }
}
