//! L3: the 2MG (`2IMG`) container — header parse/generate, and nibblize/decode
//! against an [`NibbleDisk`](super::nibble::NibbleDisk).
//!
//! Header state machine and the 3.5" checksum pipeline are grounded on
//! `original_source/clem_2img.c` (`clem_2img_parse_header`, `_clem_nib_encode_data_35`,
//! `clem_2img_nibblize_data`). The 5.25" field encoding is the standard Apple DOS
//! 3.3/ProDOS 4-and-4/6-and-2 scheme (see `DESIGN.md`), since the source detail for
//! that path was not part of the material reviewed for this crate.

use super::gcr::{self, GcrBuilder};
use super::nibble::{zone_for_track, NibbleDisk, ZONE_SECTORS};
use super::{DiskResult, DiskType, Error};

pub const HEADER_LEN: usize = 64;
pub const MAGIC: &[u8; 4] = b"2IMG";
pub const MAX_DATA_LENGTH: u32 = 0x000C_8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectorFormat {
    Dos,
    ProDos,
    Raw,
}

/// The parsed 2MG header plus the preserved opaque byte ranges (§3.2).
#[derive(Debug, Clone)]
pub struct TwoImgHeader {
    pub creator: [u8; 4],
    pub version: u16,
    pub format: SectorFormat,
    pub dos_volume: u32,
    pub block_count: u32,
    pub is_write_protected: bool,
    pub image_data_offset: u32,
    pub image_data_length: u32,
    pub creator_data: Vec<u8>,
    pub comment: Vec<u8>,
}

fn slice_checked(buf: &[u8], offset: u32, length: u32) -> DiskResult<Vec<u8>> {
    if length == 0 {
        return Ok(Vec::new());
    }
    let start = offset as usize;
    let end = start.checked_add(length as usize).ok_or_else(|| Error::InvalidImage("overflow in 2IMG offset/length".into()))?;
    if end > buf.len() {
        return Err(Error::InvalidImage("2IMG offset/length out of range".into()));
    }
    Ok(buf[start..end].to_vec())
}

/// Strict state-machine header parse (§4.3.1): each step validates and advances.
pub fn parse_header(buf: &[u8]) -> DiskResult<TwoImgHeader> {
    if buf.len() < HEADER_LEN {
        return Err(Error::InvalidImage("file shorter than 2IMG header".into()));
    }
    if &buf[0..4] != MAGIC {
        return Err(Error::InvalidImage("bad 2IMG magic".into()));
    }
    let creator = [buf[4], buf[5], buf[6], buf[7]];
    let header_size = u16::from_le_bytes([buf[8], buf[9]]);
    if header_size != 0x0040 {
        return Err(Error::InvalidImage(format!("header size {header_size:#06x} != 0x0040")));
    }
    let version = u16::from_le_bytes([buf[10], buf[11]]);
    let format_raw = u32::from_le_bytes(buf[12..16].try_into().unwrap());
    let format = match format_raw {
        0 => SectorFormat::Dos,
        1 => SectorFormat::ProDos,
        2 => SectorFormat::Raw,
        _ => return Err(Error::InvalidImage(format!("unknown 2IMG format {format_raw}"))),
    };
    let flags = u32::from_le_bytes(buf[16..20].try_into().unwrap());
    let is_write_protected = flags & 0x8000_0000 != 0;
    let dos_volume = if flags & 0x100 != 0 { flags & 0xff } else { 0 };
    let block_count = u32::from_le_bytes(buf[20..24].try_into().unwrap());
    let image_data_offset = u32::from_le_bytes(buf[24..28].try_into().unwrap());
    let mut image_data_length = u32::from_le_bytes(buf[28..32].try_into().unwrap());
    if image_data_length == 0 {
        image_data_length = block_count.saturating_mul(512);
    }
    if image_data_length > MAX_DATA_LENGTH {
        return Err(Error::InvalidImage("2IMG data length exceeds 0x000C8000".into()));
    }
    let comment_offset = u32::from_le_bytes(buf[32..36].try_into().unwrap());
    let comment_length = u32::from_le_bytes(buf[36..40].try_into().unwrap());
    let creator_data_offset = u32::from_le_bytes(buf[40..44].try_into().unwrap());
    let creator_data_length = u32::from_le_bytes(buf[44..48].try_into().unwrap());
    // bytes 48..64 are reserved padding, skipped.
    let creator_data = slice_checked(buf, creator_data_offset, creator_data_length)?;
    let comment = slice_checked(buf, comment_offset, comment_length)?;
    Ok(TwoImgHeader {
        creator,
        version,
        format,
        dos_volume,
        block_count,
        is_write_protected,
        image_data_offset,
        image_data_length,
        creator_data,
        comment,
    })
}

/// Produces a fresh 64-byte 2MG header plus trailing creator-data/comment bytes for
/// `data` of the given length. `creator_data_end` is always `creator_data_offset +
/// creator_data_length` — never the apparent-typo variant noted in SPEC_FULL.md §9.
pub fn generate_header(h: &TwoImgHeader, data_len: u32) -> Vec<u8> {
    let mut out = vec![0u8; HEADER_LEN];
    out[0..4].copy_from_slice(MAGIC);
    out[4..8].copy_from_slice(&h.creator);
    out[8..10].copy_from_slice(&0x0040u16.to_le_bytes());
    out[10..12].copy_from_slice(&h.version.to_le_bytes());
    let format_raw: u32 = match h.format {
        SectorFormat::Dos => 0,
        SectorFormat::ProDos => 1,
        SectorFormat::Raw => 2,
    };
    out[12..16].copy_from_slice(&format_raw.to_le_bytes());
    let mut flags = 0u32;
    if h.is_write_protected {
        flags |= 0x8000_0000;
    }
    if matches!(h.format, SectorFormat::Dos) {
        flags |= 0x100 | (h.dos_volume & 0xff);
    }
    out[16..20].copy_from_slice(&flags.to_le_bytes());
    out[20..24].copy_from_slice(&h.block_count.to_le_bytes());
    let creator_data_offset = HEADER_LEN as u32 + data_len;
    let creator_data_length = h.creator_data.len() as u32;
    let comment_offset = creator_data_offset + creator_data_length;
    let comment_length = h.comment.len() as u32;
    out[24..28].copy_from_slice(&(HEADER_LEN as u32).to_le_bytes());
    out[28..32].copy_from_slice(&data_len.to_le_bytes());
    out[32..36].copy_from_slice(&comment_offset.to_le_bytes());
    out[36..40].copy_from_slice(&comment_length.to_le_bytes());
    out[40..44].copy_from_slice(&creator_data_offset.to_le_bytes());
    out[44..48].copy_from_slice(&creator_data_length.to_le_bytes());
    out.extend_from_slice(&h.creator_data);
    out.extend_from_slice(&h.comment);
    out
}

/// Geometry implied purely by the decoded data length (§8 boundary cases): 140 KB is
/// 5.25" DOS/ProDOS, 400 KB is 3.5" single-sided, 800 KB is 3.5" double-sided.
pub fn geometry_from_length(data_len: usize) -> DiskResult<(DiskType, bool)> {
    match data_len {
        143_360 => Ok((DiskType::D525, false)),
        409_600 => Ok((DiskType::D35, false)),
        819_200 => Ok((DiskType::D35, true)),
        _ => Err(Error::ImageNotSupported(format!("no known disk geometry for {data_len} bytes"))),
    }
}

// ---------------------------------------------------------------------------
// Sector interleave tables (§4.3.2 step 2)
// ---------------------------------------------------------------------------

pub const PRODOS_525_INTERLEAVE: [usize; 16] = [0, 8, 1, 9, 2, 10, 3, 11, 4, 12, 5, 13, 6, 14, 7, 15];

/// `-1` marks an unused slot (rows shorter than 12 entries).
pub const PRODOS_35_INTERLEAVE: [[i8; 12]; 5] = [
    [0, 6, 1, 7, 2, 8, 3, 9, 4, 10, 5, 11],
    [0, 6, 1, 7, 2, 8, 3, 9, 4, 10, 5, -1],
    [0, 5, 1, 6, 2, 7, 3, 8, 4, 9, -1, -1],
    [0, 5, 1, 6, 2, 7, 3, 8, 4, -1, -1, -1],
    [0, 4, 1, 5, 2, 6, 3, 7, -1, -1, -1, -1],
];

// ---------------------------------------------------------------------------
// 4-and-4 encoding (5.25" address field bytes)
// ---------------------------------------------------------------------------

fn encode_44(builder: &mut GcrBuilder, value: u8) {
    let odd = (value >> 1) | 0xaa;
    let even = value | 0xaa;
    builder.write(odd, 8, 1);
    builder.write(even, 8, 1);
}

fn decode_44(odd: u8, even: u8) -> u8 {
    ((odd << 1) | 0x01) & even
}

// ---------------------------------------------------------------------------
// 3.5" three-way checksum pipeline (§4.3.3)
// ---------------------------------------------------------------------------

fn rotate_left_8(v: u8) -> u8 {
    let shifted = (v as u16) << 1;
    let mut r = (shifted & 0xff) as u8;
    if shifted & 0x100 != 0 {
        r = r.wrapping_add(1);
    }
    r
}

fn add_carry(acc: u8, val: u8) -> u8 {
    let (sum, carry) = acc.overflowing_add(val);
    if carry {
        sum.wrapping_add(1)
    } else {
        sum
    }
}

/// `payload` is the 524-byte (12-byte zero tag + 512 data bytes) 3.5" sector body.
/// Returns the 703 GCR-6-2-encoded bytes of the data field (§4.3.3).
fn encode_data_35(payload: &[u8]) -> Vec<u8> {
    debug_assert_eq!(payload.len(), 524);
    let n = payload.len();
    let num_triples = (n + 2) / 3;
    let mut s0 = vec![0u8; num_triples];
    let mut s1 = vec![0u8; num_triples];
    let mut s2 = vec![0u8; num_triples];
    let mut has_s2 = vec![false; num_triples];
    let (mut c0, mut c1, mut c2) = (0u8, 0u8, 0u8);
    for i in 0..num_triples {
        let base = i * 3;
        let d0 = payload[base];
        c0 = rotate_left_8(c0);
        s0[i] = d0 ^ c0;
        c2 = add_carry(c2, d0);

        let d1 = payload[base + 1];
        s1[i] = d1 ^ c2;
        c1 = add_carry(c1, d1);

        if base + 2 < n {
            let d2 = payload[base + 2];
            s2[i] = d2 ^ c1;
            c0 = add_carry(c0, d2);
            has_s2[i] = true;
        }
    }
    let mut out = Vec::with_capacity(703);
    for i in 0..num_triples {
        let pack = ((s0[i] >> 6) << 4) | ((s1[i] >> 6) << 2) | (if has_s2[i] { s2[i] >> 6 } else { 0 });
        out.push(gcr::encode_6b(pack));
        out.push(gcr::encode_6b(s0[i]));
        out.push(gcr::encode_6b(s1[i]));
        if has_s2[i] {
            out.push(gcr::encode_6b(s2[i]));
        }
    }
    let pack_final = ((c0 >> 6) << 4) | ((c1 >> 6) << 2) | (c2 >> 6);
    out.push(gcr::encode_6b(pack_final));
    out.push(gcr::encode_6b(c2));
    out.push(gcr::encode_6b(c1));
    out.push(gcr::encode_6b(c0));
    out
}

/// Inverse of [`encode_data_35`]. Returns the 524-byte decoded payload.
fn decode_data_35(raw: &[u8]) -> DiskResult<Vec<u8>> {
    let bad = || Error::InvalidImage("3.5\" sector: GCR symbol out of table".into());
    let mut six = Vec::with_capacity(raw.len());
    for &b in raw {
        six.push(gcr::decode_6b(b).ok_or_else(bad)?);
    }
    let num_triples = 174usize; // 524 = 174*3 + 2
    let mut pos = 0usize;
    let mut payload = vec![0u8; 524];
    let (mut c0, mut c1, mut c2) = (0u8, 0u8, 0u8);
    for i in 0..=num_triples {
        let base = i * 3;
        let has_s2 = base + 2 < 524;
        let pack = *six.get(pos).ok_or_else(bad)?;
        pos += 1;
        let s0 = *six.get(pos).ok_or_else(bad)? | (((pack >> 4) & 0x3) << 6);
        pos += 1;
        let s1 = *six.get(pos).ok_or_else(bad)? | (((pack >> 2) & 0x3) << 6);
        pos += 1;
        let s2 = if has_s2 {
            let v = *six.get(pos).ok_or_else(bad)? | ((pack & 0x3) << 6);
            pos += 1;
            Some(v)
        } else {
            None
        };

        c0 = rotate_left_8(c0);
        let d0 = s0 ^ c0;
        payload[base] = d0;
        c2 = add_carry(c2, d0);

        let d1 = s1 ^ c2;
        payload[base + 1] = d1;
        c1 = add_carry(c1, d1);

        if let Some(s2) = s2 {
            let d2 = s2 ^ c1;
            payload[base + 2] = d2;
            c0 = add_carry(c0, d2);
        }
    }
    let pack_final = *six.get(pos).ok_or_else(bad)?;
    pos += 1;
    let chk_c2 = *six.get(pos).ok_or_else(bad)? | (((pack_final >> 4) & 0x3) << 6);
    pos += 1;
    let chk_c1 = *six.get(pos).ok_or_else(bad)? | (((pack_final >> 2) & 0x3) << 6);
    pos += 1;
    let chk_c0 = *six.get(pos).ok_or_else(bad)? | ((pack_final & 0x3) << 6);
    if (chk_c0, chk_c1, chk_c2) != (c0, c1, c2) {
        return Err(Error::InvalidImage("3.5\" sector checksum mismatch".into()));
    }
    Ok(payload)
}

// ---------------------------------------------------------------------------
// 5.25" standard 6-and-2 data encoding (§4.3.3b)
// ---------------------------------------------------------------------------

fn secondary_buffer_525(data: &[u8; 256]) -> [u8; 342] {
    let mut buf = [0u8; 342];
    for i in 0..86 {
        let b0 = data[i] & 3;
        let b1 = data[i + 86] & 3;
        let b2 = if i + 172 < 256 { data[i + 172] & 3 } else { 0 };
        buf[i] = (b2 << 4) | (b1 << 2) | b0;
    }
    for i in 0..256 {
        buf[86 + i] = data[i] >> 2;
    }
    buf
}

fn encode_data_525(data: &[u8; 256]) -> Vec<u8> {
    let buf = secondary_buffer_525(data);
    let mut prev = 0u8;
    let mut out = Vec::with_capacity(343);
    for &b in buf.iter() {
        out.push(gcr::encode_6b(b ^ prev));
        prev = b;
    }
    out.push(gcr::encode_6b(prev));
    out
}

fn decode_data_525(raw: &[u8]) -> DiskResult<[u8; 256]> {
    let bad = || Error::InvalidImage("5.25\" sector: GCR symbol out of table".into());
    if raw.len() != 343 {
        return Err(bad());
    }
    let mut buf = [0u8; 342];
    let mut prev = 0u8;
    for i in 0..342 {
        let six = gcr::decode_6b(raw[i]).ok_or_else(bad)?;
        buf[i] = six ^ prev;
        prev = buf[i];
    }
    let checksum = gcr::decode_6b(raw[342]).ok_or_else(bad)?;
    if checksum != prev {
        return Err(Error::InvalidImage("5.25\" sector checksum mismatch".into()));
    }
    let mut data = [0u8; 256];
    for i in 0..256 {
        data[i] = buf[86 + i] << 2;
    }
    for i in 0..86 {
        data[i] |= buf[i] & 3;
        data[i + 86] |= (buf[i] >> 2) & 3;
        if i + 172 < 256 {
            data[i + 172] |= (buf[i] >> 4) & 3;
        }
    }
    Ok(data)
}

// ---------------------------------------------------------------------------
// Per-track nibblization
// ---------------------------------------------------------------------------

const GAP1_525: usize = 48;
const GAP2_525: usize = 6;
const GAP3_525: usize = 27;
// CLEM_DISK_35_BYTES_TRACK_GAP_1-derived sync counts (floor(bytes*8/10)).
const GAP1_35: usize = 10;
const GAP2_35: usize = 5;

fn write_address_field_525(b: &mut GcrBuilder, volume: u8, track: u8, sector: u8) {
    b.write(0xff, 8, 1);
    b.write(0xd5, 8, 1);
    b.write(0xaa, 8, 1);
    b.write(0x96, 8, 1);
    let checksum = volume ^ track ^ sector;
    encode_44(b, volume);
    encode_44(b, track);
    encode_44(b, sector);
    encode_44(b, checksum);
    b.write(0xde, 8, 1);
    b.write(0xaa, 8, 1);
    b.write(0xeb, 8, 1);
    b.write_sync(1);
}

fn write_address_field_35(b: &mut GcrBuilder, track: u8, sector: u8, side: u8, format_byte: u8) {
    b.write(0xff, 8, 1);
    b.write(0xd5, 8, 1);
    b.write(0xaa, 8, 1);
    b.write(0x96, 8, 1);
    let checksum = track ^ sector ^ side ^ format_byte;
    b.encode_6b(track & 0x3f);
    b.encode_6b(sector);
    b.encode_6b(side);
    b.encode_6b(format_byte);
    b.encode_6b(checksum);
    b.write(0xde, 8, 1);
    b.write(0xaa, 8, 1);
    b.write(0xff, 8, 1);
    b.write_sync(4);
    b.write(0xff, 8, 1);
}

/// Nibblizes one 5.25" track (`sector_count` is always 16 for ProDOS/DOS format).
fn nibblize_track_525(data: &[u8], volume: u8, track: u8) -> (Vec<u8>, usize) {
    let mut b = GcrBuilder::new();
    b.write(0xff, 8, 1);
    for (sector_index, &in_sector) in PRODOS_525_INTERLEAVE.iter().enumerate() {
        b.write_sync(if sector_index == 0 { GAP1_525 } else { GAP2_525 });
        write_address_field_525(&mut b, volume, track, in_sector as u8);
        b.write(0xd5, 8, 1);
        b.write(0xaa, 8, 1);
        b.write(0xad, 8, 1);
        let start = in_sector * 256;
        let mut payload = [0u8; 256];
        payload.copy_from_slice(&data[start..start + 256]);
        for byte in encode_data_525(&payload) {
            b.write(byte, 8, 1);
        }
        b.write(0xde, 8, 1);
        b.write(0xaa, 8, 1);
        b.write(0xeb, 8, 1);
    }
    b.write_sync(GAP3_525);
    b.finish()
}

/// Nibblizes one 3.5" track. `data` spans exactly `sector_count * 512` bytes.
fn nibblize_track_35(data: &[u8], sector_count: usize, region: usize, track_index: usize) -> (Vec<u8>, usize) {
    let interleave = &PRODOS_35_INTERLEAVE[region];
    let mut b = GcrBuilder::new();
    b.write(0xff, 8, 1);
    let side = ((track_index & 1) as u8) << 5 | ((track_index >> 6) as u8);
    for sector_index in 0..sector_count {
        b.write_sync(if sector_index == 0 { GAP1_35 } else { GAP2_35 });
        let in_sector = interleave[sector_index] as usize;
        write_address_field_35(&mut b, track_index as u8, in_sector as u8, side, 0x24);
        b.write(0xd5, 8, 1);
        b.write(0xaa, 8, 1);
        b.write(0xad, 8, 1);
        b.encode_6b(in_sector as u8);
        let start = in_sector * 512;
        let mut payload = [0u8; 524];
        payload[12..524].copy_from_slice(&data[start..start + 512]);
        for byte in encode_data_35(&payload) {
            b.write(byte, 8, 1);
        }
        b.write(0xde, 8, 1);
        b.write(0xaa, 8, 1);
        if sector_index + 1 != sector_count {
            b.write(0xff, 8, 1);
            b.write(0xff, 8, 1);
            b.write(0xff, 8, 1);
        }
    }
    b.finish()
}

/// Nibblizes a full 2IMG-shaped sector image per §4.3.2. `data` is the logical sector
/// stream (ProDOS block order); `header.format` selects the interleave table.
pub fn nibblize(header: &TwoImgHeader, data: &[u8]) -> DiskResult<NibbleDisk> {
    if matches!(header.format, SectorFormat::Dos) {
        let (disk_type, _) = geometry_from_length(data.len())?;
        if disk_type == DiskType::D525 {
            return Err(Error::InvalidImage("DOS-format 5.25\" nibblization is not implemented".into()));
        }
    }
    let (disk_type, double_sided) = geometry_from_length(data.len())?;
    match disk_type {
        DiskType::D525 => nibblize_525(data, header.dos_volume as u8),
        DiskType::D35 => nibblize_35(data, double_sided),
        _ => Err(Error::ImageNotSupported("unsupported 2IMG geometry".into())),
    }
}

fn nibblize_525(data: &[u8], volume: u8) -> DiskResult<NibbleDisk> {
    if data.len() != 143_360 {
        return Err(Error::InvalidImage("5.25\" image is not 140KB".into()));
    }
    let mut disk = NibbleDisk::empty(DiskType::D525);
    let volume = if volume == 0 { 0xfe } else { volume };
    for track in 0..35u8 {
        let qtr = track as usize * 4;
        let start = track as usize * 16 * 256;
        let (bytes, bit_count) = nibblize_track_525(&data[start..start + 16 * 256], volume, track);
        disk.install_track(qtr, bytes, bit_count, 4);
    }
    disk.track_count = 35;
    Ok(disk)
}

fn nibblize_35(data: &[u8], double_sided: bool) -> DiskResult<NibbleDisk> {
    let mut disk = NibbleDisk::empty(DiskType::D35);
    disk.is_double_sided = double_sided;
    let increment = if double_sided { 1 } else { 2 };
    let mut logical_base = 0usize;
    let mut q = 0usize;
    let mut installed = 0u32;
    while q < 160 {
        let region = zone_for_track(q);
        let sector_count = ZONE_SECTORS[region];
        let end = (logical_base + sector_count) * 512;
        if end > data.len() {
            break;
        }
        let (bytes, bit_count) = nibblize_track_35(&data[logical_base * 512..end], sector_count, region, q);
        disk.install_track(q, bytes, bit_count, increment);
        installed += 1;
        logical_base += sector_count;
        q += increment;
    }
    disk.track_count = installed;
    Ok(disk)
}

// ---------------------------------------------------------------------------
// Decode: nibble disk -> logical sector stream (§4.3.4)
// ---------------------------------------------------------------------------

/// Scans forward (circularly, at most one full revolution) from `start` for `pattern`
/// read byte-aligned-at-each-candidate-bit-offset. Returns the bit position right
/// after the match.
fn find_pattern(bits: &[u8], bit_len: usize, start: usize, pattern: &[u8]) -> Option<usize> {
    if bit_len == 0 {
        return None;
    }
    for step in 0..bit_len {
        let pos = (start + step) % bit_len;
        let mut ok = true;
        for (i, &p) in pattern.iter().enumerate() {
            if gcr::read_byte(bits, bit_len, (pos + i * 8) % bit_len) != p {
                ok = false;
                break;
            }
        }
        if ok {
            return Some((pos + pattern.len() * 8) % bit_len);
        }
    }
    None
}

fn read_bytes(bits: &[u8], bit_len: usize, pos: usize, n: usize) -> (Vec<u8>, usize) {
    let mut out = Vec::with_capacity(n);
    let mut p = pos;
    for _ in 0..n {
        out.push(gcr::read_byte(bits, bit_len, p));
        p = (p + 8) % bit_len;
    }
    (out, p)
}

pub fn decode(disk: &NibbleDisk, out: &mut Vec<u8>) -> DiskResult<()> {
    match disk.disk_type {
        DiskType::D525 => decode_525(disk, out),
        DiskType::D35 => decode_35(disk, out),
        _ => Err(Error::ImageNotSupported("decode requires a 5.25\" or 3.5\" nibble disk".into())),
    }
}

fn decode_525(disk: &NibbleDisk, out: &mut Vec<u8>) -> DiskResult<()> {
    out.clear();
    out.resize(143_360, 0);
    for (track_num, qtr) in NibbleDisk::real_quarter_tracks_525().enumerate() {
        let (bits, bit_count) = disk
            .get_track_bits(qtr)
            .ok_or_else(|| Error::InvalidImage(format!("track {track_num} not initialized")))?;
        decode_track_525(bits, bit_count as usize, track_num * 16 * 256, out)?;
    }
    Ok(())
}

fn decode_track_525(bits: &[u8], bit_len: usize, sector_base: usize, out: &mut [u8]) -> DiskResult<()> {
    let mut pos = 0usize;
    for _ in 0..16 {
        let addr_end = find_pattern(bits, bit_len, pos, &[0xd5, 0xaa, 0x96]).ok_or_else(|| Error::InvalidImage("5.25\" address prolog not found".into()))?;
        let (addr_bytes, after_addr) = read_bytes(bits, bit_len, addr_end, 8);
        let volume = decode_44(addr_bytes[0], addr_bytes[1]);
        let _track = decode_44(addr_bytes[2], addr_bytes[3]);
        let sector = decode_44(addr_bytes[4], addr_bytes[5]);
        let checksum = decode_44(addr_bytes[6], addr_bytes[7]);
        if volume ^ _track ^ sector != checksum {
            return Err(Error::InvalidImage("5.25\" address checksum mismatch".into()));
        }
        let data_end = find_pattern(bits, bit_len, after_addr, &[0xd5, 0xaa, 0xad]).ok_or_else(|| Error::InvalidImage("5.25\" data prolog not found".into()))?;
        let (raw, after_data) = read_bytes(bits, bit_len, data_end, 343);
        let payload = decode_data_525(&raw)?;
        let slot = sector_base + sector as usize * 256;
        out[slot..slot + 256].copy_from_slice(&payload);
        pos = after_data;
    }
    Ok(())
}

fn decode_35(disk: &NibbleDisk, out: &mut Vec<u8>) -> DiskResult<()> {
    let total_len = if disk.is_double_sided { 819_200 } else { 409_600 };
    out.clear();
    out.resize(total_len, 0);
    let increment = if disk.is_double_sided { 1 } else { 2 };
    let mut logical_base = 0usize;
    let mut q = 0usize;
    while q < 160 {
        let region = zone_for_track(q);
        let sector_count = ZONE_SECTORS[region];
        match disk.get_track_bits(q) {
            Some((bits, bit_count)) => {
                decode_track_35(bits, bit_count as usize, sector_count, logical_base * 512, out)?;
            }
            None => break,
        }
        logical_base += sector_count;
        q += increment;
    }
    Ok(())
}

fn decode_track_35(bits: &[u8], bit_len: usize, sector_count: usize, base_offset: usize, out: &mut [u8]) -> DiskResult<()> {
    let mut pos = 0usize;
    for _ in 0..sector_count {
        let addr_end = find_pattern(bits, bit_len, pos, &[0xd5, 0xaa, 0x96]).ok_or_else(|| Error::InvalidImage("3.5\" address prolog not found".into()))?;
        let (addr_six, after_addr) = read_bytes(bits, bit_len, addr_end, 5);
        let decode_or_err = |b: u8| gcr::decode_6b(b).ok_or_else(|| Error::InvalidImage("3.5\" address field: GCR symbol out of table".into()));
        let track = decode_or_err(addr_six[0])?;
        let sector = decode_or_err(addr_six[1])?;
        let side = decode_or_err(addr_six[2])?;
        let format_byte = decode_or_err(addr_six[3])?;
        let checksum = decode_or_err(addr_six[4])?;
        if (track ^ sector ^ side ^ format_byte) != checksum {
            return Err(Error::InvalidImage("3.5\" address checksum mismatch".into()));
        }
        let data_end = find_pattern(bits, bit_len, after_addr, &[0xd5, 0xaa, 0xad]).ok_or_else(|| Error::InvalidImage("3.5\" data prolog not found".into()))?;
        let (sector_num_raw, after_secnum) = read_bytes(bits, bit_len, data_end, 1);
        let in_sector = gcr::decode_6b(sector_num_raw[0]).ok_or_else(|| Error::InvalidImage("3.5\" sector number: GCR symbol out of table".into()))? as usize;
        let (raw, after_payload) = read_bytes(bits, bit_len, after_secnum, 703);
        let payload = decode_data_35(&raw)?;
        let slot = base_offset + in_sector * 512;
        out[slot..slot + 512].copy_from_slice(&payload[12..524]);
        pos = after_payload;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(format: SectorFormat, block_count: u32) -> TwoImgHeader {
        TwoImgHeader {
            creator: *b"TEST",
            version: 1,
            format,
            dos_volume: 254,
            block_count,
            is_write_protected: false,
            image_data_offset: HEADER_LEN as u32,
            image_data_length: block_count * 512,
            creator_data: Vec::new(),
            comment: Vec::new(),
        }
    }

    #[test]
    fn parse_header_roundtrips_generate_header() {
        let h = sample_header(SectorFormat::ProDos, 1600);
        let bytes = generate_header(&h, 1600 * 512);
        let parsed = parse_header(&bytes).unwrap();
        assert_eq!(parsed.block_count, 1600);
        assert_eq!(parsed.format, SectorFormat::ProDos);
        assert!(!parsed.is_write_protected);
    }

    #[test]
    fn zero_data_length_infers_from_block_count() {
        let mut h = sample_header(SectorFormat::ProDos, 100);
        h.image_data_length = 0;
        let mut bytes = generate_header(&h, 100 * 512);
        bytes[28..32].copy_from_slice(&0u32.to_le_bytes());
        let parsed = parse_header(&bytes).unwrap();
        assert_eq!(parsed.image_data_length, 100 * 512);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = generate_header(&sample_header(SectorFormat::ProDos, 10), 10 * 512);
        bytes[0] = b'X';
        assert!(matches!(parse_header(&bytes), Err(Error::InvalidImage(_))));
    }

    #[test]
    fn data_35_checksum_round_trips() {
        let mut payload = [0u8; 524];
        for (i, b) in payload.iter_mut().enumerate().skip(12) {
            *b = (i * 7 + 3) as u8;
        }
        let encoded = encode_data_35(&payload);
        assert_eq!(encoded.len(), 703);
        let decoded = decode_data_35(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn data_525_checksum_round_trips() {
        let mut payload = [0u8; 256];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = (i * 13 + 5) as u8;
        }
        let encoded = encode_data_525(&payload);
        assert_eq!(encoded.len(), 343);
        let decoded = decode_data_525(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn nibblize_then_decode_525_round_trips() {
        let mut data = vec![0u8; 143_360];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let header = sample_header(SectorFormat::ProDos, 0);
        let disk = nibblize(&header, &data).unwrap();
        assert_eq!(disk.track_count, 35);
        let mut out = Vec::new();
        decode(&disk, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn nibblize_then_decode_35_single_sided_round_trips() {
        let mut data = vec![0u8; 409_600];
        for (i, b) in data.iter_mut().enumerate() {
            *b = ((i * 31 + 17) % 256) as u8;
        }
        let header = sample_header(SectorFormat::ProDos, 800);
        let disk = nibblize(&header, &data).unwrap();
        assert!(!disk.is_double_sided);
        let mut out = Vec::new();
        decode(&disk, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn dos_format_525_is_rejected() {
        let data = vec![0u8; 143_360];
        let header = sample_header(SectorFormat::Dos, 0);
        assert!(matches!(nibblize(&header, &data), Err(Error::InvalidImage(_))));
    }
}
