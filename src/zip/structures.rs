//! On-disk ZIP records and the unified entry description used by the extractor.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Parse failures inside this module are plain reasons; the caller decides whether an
/// invalid structure is fatal or triggers recovery.
pub type Parsed<T> = std::result::Result<T, String>;

pub const LFH_SIGNATURE: &[u8; 4] = b"PK\x03\x04";
pub const CDFH_SIGNATURE: &[u8; 4] = b"PK\x01\x02";
pub const EOCD_SIGNATURE: &[u8; 4] = b"PK\x05\x06";
pub const ZIP64_EOCD_SIGNATURE: &[u8; 4] = b"PK\x06\x06";
pub const ZIP64_LOCATOR_SIGNATURE: &[u8; 4] = b"PK\x06\x07";
pub const DATA_DESCRIPTOR_SIGNATURE: &[u8; 4] = b"PK\x07\x08";

/// Every record signature that may legitimately follow a payload.
pub const FOLLOWING_SIGNATURES: [&[u8; 4]; 5] = [
    LFH_SIGNATURE,
    CDFH_SIGNATURE,
    EOCD_SIGNATURE,
    ZIP64_EOCD_SIGNATURE,
    DATA_DESCRIPTOR_SIGNATURE,
];

pub const LFH_SIZE: usize = 30;
pub const CDFH_MIN_SIZE: usize = 46;

/// General purpose flag bits.
pub const FLAG_ENCRYPTED: u16 = 0x0001;
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
pub const FLAG_STRONG_ENCRYPTION: u16 = 0x0040;

/// 32-bit fields saturated to this value defer to the ZIP64 extra field.
pub const ZIP64_SENTINEL: u32 = 0xFFFF_FFFF;
const ZIP64_EXTRA_ID: u16 = 0x0001;

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Zstd,
    /// WinZip AES; the real method is hidden in the extra field.
    Aes,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            93 => CompressionMethod::Zstd,
            99 => CompressionMethod::Aes,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Zstd => 93,
            CompressionMethod::Aes => 99,
            CompressionMethod::Unknown(v) => *v,
        }
    }

    pub fn name(&self) -> String {
        match self {
            CompressionMethod::Stored => "stored".into(),
            CompressionMethod::Deflate => "deflate".into(),
            CompressionMethod::Zstd => "zstd".into(),
            CompressionMethod::Aes => "aes".into(),
            CompressionMethod::Unknown(v) => format!("method {v}"),
        }
    }
}

/// End of Central Directory (EOCD) - 22 bytes minimum
#[derive(Debug, Clone)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const SIZE: usize = 22;

    pub fn from_bytes(data: &[u8]) -> Parsed<Self> {
        if data.len() < Self::SIZE || &data[0..4] != EOCD_SIGNATURE {
            return Err("invalid end of central directory record".into());
        }
        let mut cursor = Cursor::new(&data[4..]);
        let mut parse = || -> std::io::Result<Self> {
            Ok(Self {
                disk_number: cursor.read_u16::<LittleEndian>()?,
                disk_with_cd: cursor.read_u16::<LittleEndian>()?,
                disk_entries: cursor.read_u16::<LittleEndian>()?,
                total_entries: cursor.read_u16::<LittleEndian>()?,
                cd_size: cursor.read_u32::<LittleEndian>()?,
                cd_offset: cursor.read_u32::<LittleEndian>()?,
                comment_len: cursor.read_u16::<LittleEndian>()?,
            })
        };
        parse().map_err(|e| e.to_string())
    }

    pub fn is_zip64(&self) -> bool {
        self.disk_entries == 0xFFFF
            || self.total_entries == 0xFFFF
            || self.cd_size == ZIP64_SENTINEL
            || self.cd_offset == ZIP64_SENTINEL
    }
}

/// ZIP64 End of Central Directory Locator - 20 bytes
#[derive(Debug, Clone)]
pub struct Zip64EocdLocator {
    pub disk_with_eocd64: u32,
    pub eocd64_offset: u64,
    pub total_disks: u32,
}

impl Zip64EocdLocator {
    pub const SIZE: usize = 20;

    pub fn from_bytes(data: &[u8]) -> Parsed<Self> {
        if data.len() < Self::SIZE || &data[0..4] != ZIP64_LOCATOR_SIGNATURE {
            return Err("missing ZIP64 end of central directory locator".into());
        }
        let mut cursor = Cursor::new(&data[4..]);
        let mut parse = || -> std::io::Result<Self> {
            Ok(Self {
                disk_with_eocd64: cursor.read_u32::<LittleEndian>()?,
                eocd64_offset: cursor.read_u64::<LittleEndian>()?,
                total_disks: cursor.read_u32::<LittleEndian>()?,
            })
        };
        parse().map_err(|e| e.to_string())
    }
}

/// ZIP64 End of Central Directory - 56 bytes minimum
#[derive(Debug, Clone)]
pub struct Zip64Eocd {
    pub eocd64_size: u64,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub disk_with_cd: u32,
    pub disk_entries: u64,
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64Eocd {
    pub const MIN_SIZE: usize = 56;

    pub fn from_bytes(data: &[u8]) -> Parsed<Self> {
        if data.len() < Self::MIN_SIZE || &data[0..4] != ZIP64_EOCD_SIGNATURE {
            return Err("invalid ZIP64 end of central directory record".into());
        }
        let mut cursor = Cursor::new(&data[4..]);
        let mut parse = || -> std::io::Result<Self> {
            Ok(Self {
                eocd64_size: cursor.read_u64::<LittleEndian>()?,
                version_made_by: cursor.read_u16::<LittleEndian>()?,
                version_needed: cursor.read_u16::<LittleEndian>()?,
                disk_number: cursor.read_u32::<LittleEndian>()?,
                disk_with_cd: cursor.read_u32::<LittleEndian>()?,
                disk_entries: cursor.read_u64::<LittleEndian>()?,
                total_entries: cursor.read_u64::<LittleEndian>()?,
                cd_size: cursor.read_u64::<LittleEndian>()?,
                cd_offset: cursor.read_u64::<LittleEndian>()?,
            })
        };
        parse().map_err(|e| e.to_string())
    }
}

/// Local File Header (LFH) - 30 bytes plus name and extra field.
#[derive(Debug, Clone)]
pub struct LocalFileHeader {
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub mod_time: u16,
    pub mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub name_len: u16,
    pub extra_len: u16,
}

impl LocalFileHeader {
    /// Parses the fixed part at the start of `data`.
    pub fn from_bytes(data: &[u8]) -> Parsed<Self> {
        if data.len() < LFH_SIZE || &data[0..4] != LFH_SIGNATURE {
            return Err("invalid local file header".into());
        }
        let mut cursor = Cursor::new(&data[4..LFH_SIZE]);
        let mut parse = || -> std::io::Result<Self> {
            Ok(Self {
                version_needed: cursor.read_u16::<LittleEndian>()?,
                flags: cursor.read_u16::<LittleEndian>()?,
                method: cursor.read_u16::<LittleEndian>()?,
                mod_time: cursor.read_u16::<LittleEndian>()?,
                mod_date: cursor.read_u16::<LittleEndian>()?,
                crc32: cursor.read_u32::<LittleEndian>()?,
                compressed_size: cursor.read_u32::<LittleEndian>()? as u64,
                uncompressed_size: cursor.read_u32::<LittleEndian>()? as u64,
                name_len: cursor.read_u16::<LittleEndian>()?,
                extra_len: cursor.read_u16::<LittleEndian>()?,
            })
        };
        parse().map_err(|e| e.to_string())
    }

    /// Length of the header including name and extra field.
    pub fn total_len(&self) -> u64 {
        LFH_SIZE as u64 + self.name_len as u64 + self.extra_len as u64
    }

    /// Applies a ZIP64 extra field. In a local header both sizes are present whenever
    /// either is saturated.
    pub fn apply_zip64_extra(&mut self, extra: &[u8]) {
        if self.compressed_size != ZIP64_SENTINEL as u64 && self.uncompressed_size != ZIP64_SENTINEL as u64 {
            return;
        }
        if let Some(field) = find_extra_field(extra, ZIP64_EXTRA_ID) {
            if field.len() >= 16 {
                let mut cursor = Cursor::new(field);
                if let (Ok(uncompressed), Ok(compressed)) = (
                    cursor.read_u64::<LittleEndian>(),
                    cursor.read_u64::<LittleEndian>(),
                ) {
                    self.uncompressed_size = uncompressed;
                    self.compressed_size = compressed;
                }
            }
        }
    }
}

/// Returns the body of the first extra-field block with `id`.
pub fn find_extra_field(extra: &[u8], id: u16) -> Option<&[u8]> {
    let mut pos = 0usize;
    while pos + 4 <= extra.len() {
        let header_id = u16::from_le_bytes([extra[pos], extra[pos + 1]]);
        let size = u16::from_le_bytes([extra[pos + 2], extra[pos + 3]]) as usize;
        let body_start = pos + 4;
        let body_end = body_start + size;
        if body_end > extra.len() {
            return None;
        }
        if header_id == id {
            return Some(&extra[body_start..body_end]);
        }
        pos = body_end;
    }
    None
}

/// Resolves saturated central-directory fields from the ZIP64 extra field. Values are
/// present in fixed order, each only if its 32-bit field is saturated.
pub fn apply_central_zip64_extra(
    extra: &[u8],
    uncompressed_size: &mut u64,
    compressed_size: &mut u64,
    header_offset: &mut u64,
) {
    let Some(field) = find_extra_field(extra, ZIP64_EXTRA_ID) else {
        return;
    };
    let mut cursor = Cursor::new(field);
    for value in [uncompressed_size, compressed_size, header_offset] {
        if *value == ZIP64_SENTINEL as u64 {
            match cursor.read_u64::<LittleEndian>() {
                Ok(v) => *value = v,
                Err(_) => return,
            }
        }
    }
}

/// Where an entry description came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySource {
    CentralDirectory,
    /// Rebuilt from a local header by the recovery scan.
    Recovered,
}

/// One archive member, from either parse path.
#[derive(Debug, Clone)]
pub struct ZipEntry {
    pub name: String,
    pub method: CompressionMethod,
    pub flags: u16,
    pub crc32: u32,
    /// False when a recovered entry deferred its CRC to a data descriptor that was not found.
    pub crc_known: bool,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    /// Offset of the local file header.
    pub header_offset: u64,
    /// Offset of the first payload byte.
    pub data_offset: u64,
    pub mod_time: u16,
    pub mode: Option<u32>,
    pub source: EntrySource,
    pub warnings: Vec<String>,
}

impl ZipEntry {
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/') || self.name.ends_with('\\')
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    pub fn has_data_descriptor(&self) -> bool {
        self.flags & FLAG_DATA_DESCRIPTOR != 0
    }

    /// Byte range of the stored payload.
    pub fn payload_range(&self) -> std::ops::Range<usize> {
        self.data_offset as usize..(self.data_offset + self.compressed_size) as usize
    }

    /// The byte the last decrypted header byte must equal for a correct password.
    pub fn password_check_byte(&self) -> u8 {
        if self.has_data_descriptor() {
            (self.mod_time >> 8) as u8
        } else {
            (self.crc32 >> 24) as u8
        }
    }
}

/// Decodes an entry name: UTF-8 when valid, otherwise lossily.
pub fn decode_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

/// True when `data[pos..]` starts with one of [`FOLLOWING_SIGNATURES`].
pub fn starts_with_known_signature(data: &[u8], pos: usize) -> bool {
    data.get(pos..pos + 4)
        .is_some_and(|sig| FOLLOWING_SIGNATURES.iter().any(|known| sig == known.as_slice()))
}
