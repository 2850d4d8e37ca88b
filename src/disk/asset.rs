//! L5: a disk asset — one mountable image on the host filesystem, bound to its
//! container format and decoded [`NibbleDisk`], plus the snapshot shape (§6.3).
//!
//! Grounded on `original_source/host/core/clem_disk_asset.cpp`: extension-based
//! format detection (`fromAssetPathUsingExtension`), the decode/encode pair, and
//! blank-disk synthesis.

use std::path::{Path, PathBuf};

use log::{info, warn};

use super::img2mg::{self, SectorFormat, TwoImgHeader};
use super::nibble::NibbleDisk;
use super::woz::{self, WozImage, WozInfo, WozVersion};
use super::{DiskResult, DiskType, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageType {
    Dsk,
    Do,
    Po,
    TwoImg,
    Woz,
}

/// Picks a format purely from the file extension (§4.5), the same dispatch the host
/// uses before ever reading the file's contents.
pub fn image_type_from_extension(path: &Path) -> DiskResult<ImageType> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_ascii_lowercase())
        .ok_or_else(|| Error::ImageNotSupported("path has no extension".into()))?;
    match ext.as_str() {
        "dsk" => Ok(ImageType::Dsk),
        "do" => Ok(ImageType::Do),
        "po" => Ok(ImageType::Po),
        "2mg" | "2img" => Ok(ImageType::TwoImg),
        "woz" => Ok(ImageType::Woz),
        other => Err(Error::ImageNotSupported(format!("unrecognized disk image extension \".{other}\""))),
    }
}

/// A mounted disk image: its format, the decoded track data, and enough of the
/// original container to re-encode it faithfully on save.
pub struct DiskAsset {
    pub image_type: ImageType,
    pub path: PathBuf,
    pub disk: NibbleDisk,
    two_img_header: Option<TwoImgHeader>,
    woz: Option<WozImage>,
}

impl DiskAsset {
    pub fn disk_type(&self) -> DiskType {
        self.disk.disk_type
    }

    /// Rough on-disk footprint of the re-encoded container, used by the storage
    /// layer to size its decode scratch buffer ahead of a save.
    pub fn estimated_encoded_size(&self) -> usize {
        match self.image_type {
            ImageType::Woz => 1536 + self.disk.bits_data.len(),
            ImageType::TwoImg => 64 + self.raw_data_len(),
            ImageType::Dsk | ImageType::Do | ImageType::Po => self.raw_data_len(),
        }
    }

    fn raw_data_len(&self) -> usize {
        match self.disk.disk_type {
            DiskType::D525 => 143_360,
            DiskType::D35 if self.disk.is_double_sided => 819_200,
            DiskType::D35 => 409_600,
            _ => 0,
        }
    }

    /// Decodes `bytes` (the raw file contents at `path`) into a mounted asset,
    /// dispatched by `image_type` (§4.5).
    pub fn open(path: &Path, image_type: ImageType, bytes: &[u8]) -> DiskResult<DiskAsset> {
        let result = match image_type {
            ImageType::Woz => {
                let woz = woz::parse(bytes)?;
                Ok(DiskAsset { image_type, path: path.to_path_buf(), disk: woz.disk.clone(), two_img_header: None, woz: Some(woz) })
            }
            ImageType::TwoImg => {
                let header = img2mg::parse_header(bytes)?;
                let data_start = header.image_data_offset as usize;
                let data_end = data_start + header.image_data_length as usize;
                if data_end > bytes.len() {
                    return Err(Error::InvalidImage("2IMG data range exceeds file length".into()));
                }
                let disk = img2mg::nibblize(&header, &bytes[data_start..data_end])?;
                Ok(DiskAsset { image_type, path: path.to_path_buf(), disk, two_img_header: Some(header), woz: None })
            }
            ImageType::Do | ImageType::Dsk => {
                let header = synthetic_header(SectorFormat::Dos, bytes.len())?;
                let disk = img2mg::nibblize(&header, bytes)?;
                Ok(DiskAsset { image_type, path: path.to_path_buf(), disk, two_img_header: Some(header), woz: None })
            }
            ImageType::Po => {
                let header = synthetic_header(SectorFormat::ProDos, bytes.len())?;
                let disk = img2mg::nibblize(&header, bytes)?;
                Ok(DiskAsset { image_type, path: path.to_path_buf(), disk, two_img_header: Some(header), woz: None })
            }
        };
        match &result {
            Ok(asset) => info!("mounted {:?} image at {} ({:?})", image_type, path.display(), asset.disk_type()),
            Err(e) => warn!("failed to mount {} as {:?}: {e}", path.display(), image_type),
        }
        result
    }

    /// Opens `path`, detecting its format from the extension.
    pub fn open_from_path(path: &Path, bytes: &[u8]) -> DiskResult<DiskAsset> {
        let image_type = image_type_from_extension(path)?;
        Self::open(path, image_type, bytes)
    }

    /// Re-encodes the current `disk` state back into file bytes for `path` (§4.6 save).
    pub fn save_bytes(&self) -> DiskResult<Vec<u8>> {
        info!("encoding {:?} image for {}", self.image_type, self.path.display());
        match self.image_type {
            ImageType::Woz => {
                let mut woz = self.woz.clone().ok_or_else(|| Error::SaveFailed("asset has no WOZ container state".into()))?;
                woz.disk = self.disk.clone();
                Ok(woz::serialize(&woz))
            }
            ImageType::TwoImg => {
                let header = self.two_img_header.clone().ok_or_else(|| Error::SaveFailed("asset has no 2IMG header state".into()))?;
                let mut data = Vec::new();
                img2mg::decode(&self.disk, &mut data)?;
                let header_bytes = img2mg::generate_header(&header, data.len() as u32);
                let mut out = header_bytes;
                out.extend_from_slice(&data);
                out.extend_from_slice(&header.creator_data);
                out.extend_from_slice(&header.comment);
                Ok(out)
            }
            ImageType::Do | ImageType::Dsk | ImageType::Po => {
                let mut data = Vec::new();
                img2mg::decode(&self.disk, &mut data)?;
                Ok(data)
            }
        }
    }

    /// Synthesizes a freshly formatted, all-zero-sector blank disk of the given
    /// geometry (§4.5), the asset-layer counterpart to `createBlankDiskImage`.
    /// `double_sided` only affects 3.5" geometry (400 KB vs 800 KB).
    pub fn create_blank(path: &Path, image_type: ImageType, disk_type: DiskType, double_sided: bool) -> DiskResult<DiskAsset> {
        let d35_len = if double_sided { 819_200usize } else { 409_600usize };
        let (format, data_len) = match (image_type, disk_type) {
            (ImageType::Woz, DiskType::D525) => (SectorFormat::ProDos, 143_360usize),
            (ImageType::Do, DiskType::D525) | (ImageType::Dsk, DiskType::D525) => (SectorFormat::Dos, 143_360usize),
            (ImageType::Woz, DiskType::D35) | (ImageType::TwoImg, DiskType::D35) | (ImageType::Po, DiskType::D35) => (SectorFormat::ProDos, d35_len),
            (ImageType::TwoImg, DiskType::D525) | (ImageType::Po, DiskType::D525) => (SectorFormat::ProDos, 143_360usize),
            _ => return Err(Error::ImageNotSupported("no blank-disk recipe for this image/disk type combination".into())),
        };
        if matches!(format, SectorFormat::Dos) && disk_type == DiskType::D525 {
            return Err(Error::ImageNotSupported("blank DOS-format 5.25\" disks are not supported".into()));
        }
        let data = vec![0u8; data_len];
        let mut header = synthetic_header(format, data_len)?;
        header.comment = format!("Created {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S")).into_bytes();
        info!("creating blank {:?} disk ({} bytes) at {}", disk_type, data_len, path.display());
        let disk = img2mg::nibblize(&header, &data)?;
        match image_type {
            ImageType::Woz => {
                let woz = WozImage {
                    version: WozVersion::V2,
                    info: WozInfo { disk_type, ..WozInfo::default() },
                    disk,
                    meta: None,
                    other_chunks: Vec::new(),
                };
                Ok(DiskAsset { image_type, path: path.to_path_buf(), disk: woz.disk.clone(), two_img_header: None, woz: Some(woz) })
            }
            _ => Ok(DiskAsset { image_type, path: path.to_path_buf(), disk, two_img_header: Some(header), woz: None }),
        }
    }
}

fn synthetic_header(format: SectorFormat, data_len: usize) -> DiskResult<TwoImgHeader> {
    Ok(TwoImgHeader {
        creator: *b"CLEM",
        version: 1,
        format,
        dos_volume: 254,
        block_count: (data_len / 512) as u32,
        is_write_protected: false,
        image_data_offset: img2mg::HEADER_LEN as u32,
        image_data_length: data_len as u32,
        creator_data: Vec::new(),
        comment: Vec::new(),
    })
}

// ---------------------------------------------------------------------------
// Snapshot shape (§6.3): asset metadata tagged "woz" | "2img" | "none"
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind")]
pub enum AssetMetadata {
    #[serde(rename = "woz")]
    Woz { version: u8 },
    #[serde(rename = "2img")]
    TwoImg { format: SectorFormat, dos_volume: u32 },
    #[serde(rename = "none")]
    None,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AssetSnapshot {
    pub image_type: ImageType,
    pub disk_type: DiskType,
    pub error_type: Option<String>,
    pub estimated_encoded_size: u32,
    pub path: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub metadata: AssetMetadata,
}

impl DiskAsset {
    pub fn to_snapshot(&self) -> DiskResult<AssetSnapshot> {
        let data = self.save_bytes()?;
        let metadata = match (&self.woz, &self.two_img_header) {
            (Some(w), _) => AssetMetadata::Woz { version: w.info.version },
            (None, Some(h)) => AssetMetadata::TwoImg { format: h.format, dos_volume: h.dos_volume },
            (None, None) => AssetMetadata::None,
        };
        Ok(AssetSnapshot {
            image_type: self.image_type,
            disk_type: self.disk_type(),
            error_type: None,
            estimated_encoded_size: self.estimated_encoded_size() as u32,
            path: self.path.to_string_lossy().into_owned(),
            data,
            metadata,
        })
    }

    pub fn from_snapshot(snap: &AssetSnapshot) -> DiskResult<DiskAsset> {
        Self::open(Path::new(&snap.path), snap.image_type, &snap.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_type_from_extension_covers_known_kinds() {
        assert_eq!(image_type_from_extension(Path::new("disk.woz")).unwrap(), ImageType::Woz);
        assert_eq!(image_type_from_extension(Path::new("disk.2mg")).unwrap(), ImageType::TwoImg);
        assert_eq!(image_type_from_extension(Path::new("disk.PO")).unwrap(), ImageType::Po);
        assert!(image_type_from_extension(Path::new("disk.bin")).is_err());
    }

    #[test]
    fn blank_525_dos_is_unsupported() {
        let err = DiskAsset::create_blank(Path::new("blank.dsk"), ImageType::Dsk, DiskType::D525, false);
        assert!(matches!(err, Err(Error::ImageNotSupported(_))));
    }

    #[test]
    fn blank_po_525_round_trips_through_save() {
        let asset = DiskAsset::create_blank(Path::new("blank.po"), ImageType::Po, DiskType::D525, false).unwrap();
        assert_eq!(asset.disk.track_count, 35);
        let bytes = asset.save_bytes().unwrap();
        assert_eq!(bytes.len(), 143_360);
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn blank_woz_525_uses_prodos_format() {
        let asset = DiskAsset::create_blank(Path::new("blank.woz"), ImageType::Woz, DiskType::D525, false).unwrap();
        let bytes = asset.save_bytes().unwrap();
        let reopened = DiskAsset::open(Path::new("blank.woz"), ImageType::Woz, &bytes).unwrap();
        assert_eq!(reopened.disk.track_count, 35);
    }

    #[test]
    fn blank_d35_respects_double_sided_flag() {
        let single = DiskAsset::create_blank(Path::new("blank.2mg"), ImageType::TwoImg, DiskType::D35, false).unwrap();
        let double = DiskAsset::create_blank(Path::new("blank2.2mg"), ImageType::TwoImg, DiskType::D35, true).unwrap();
        assert_eq!(single.raw_data_len(), 409_600);
        assert_eq!(double.raw_data_len(), 819_200);
    }

    #[test]
    fn open_do_then_save_round_trips_data() {
        let mut data = vec![0u8; 143_360];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 200) as u8;
        }
        let asset = DiskAsset::open(Path::new("game.do"), ImageType::Do, &data).unwrap();
        let saved = asset.save_bytes().unwrap();
        assert_eq!(saved, data);
    }

    #[test]
    fn snapshot_round_trips_through_open() {
        let asset = DiskAsset::create_blank(Path::new("blank.po"), ImageType::Po, DiskType::D525, false).unwrap();
        let snap = asset.to_snapshot().unwrap();
        assert!(matches!(snap.metadata, AssetMetadata::TwoImg { .. }));
        let reopened = DiskAsset::from_snapshot(&snap).unwrap();
        assert_eq!(reopened.disk.track_count, asset.disk.track_count);
    }
}
