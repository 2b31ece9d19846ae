//! Central-directory parser.
//!
//! ZIP files are designed to be read from the end:
//! 1. Find the End of Central Directory (EOCD) at the file's end
//! 2. If ZIP64, read the ZIP64 EOCD for large file support
//! 3. Read the Central Directory to get metadata for all files
//! 4. Check each file's Local File Header to locate its data
//!
//! Any inconsistency makes the whole directory invalid; the caller then decides between
//! failing and the recovery scan.

use super::structures::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

/// Maximum ZIP comment size allowed by the format (65535 bytes).
///
/// This limits the search area when looking for EOCD with a comment.
const MAX_COMMENT_SIZE: usize = 65535;

/// "Made by" host system for Unix in the upper byte of `version_made_by`.
const HOST_UNIX: u16 = 3;

/// Find and parse the End of Central Directory record.
///
/// Searches backwards over at most the record size plus the longest comment. A candidate
/// only counts when its comment length reaches exactly to the end of the file.
pub fn find_eocd(data: &[u8]) -> Parsed<(EndOfCentralDirectory, usize)> {
    if data.len() < EndOfCentralDirectory::SIZE {
        return Err("file is too small to hold an end of central directory record".into());
    }
    let search_size = (MAX_COMMENT_SIZE + EndOfCentralDirectory::SIZE).min(data.len());
    let search_start = data.len() - search_size;
    let last_candidate = data.len() - EndOfCentralDirectory::SIZE;

    for i in (search_start..=last_candidate).rev() {
        if &data[i..i + 4] != EOCD_SIGNATURE {
            continue;
        }
        let comment_len = u16::from_le_bytes([data[i + 20], data[i + 21]]) as usize;
        if comment_len == data.len() - i - EndOfCentralDirectory::SIZE {
            let eocd = EndOfCentralDirectory::from_bytes(&data[i..i + EndOfCentralDirectory::SIZE])?;
            return Ok((eocd, i));
        }
    }
    Err("end of central directory record not found".into())
}

/// Read the ZIP64 End of Central Directory record through the locator that sits
/// immediately before the regular EOCD.
///
/// Returns the record and its offset.
pub fn read_zip64_eocd(data: &[u8], eocd_offset: usize) -> Parsed<(Zip64Eocd, usize)> {
    let locator_offset = eocd_offset
        .checked_sub(Zip64EocdLocator::SIZE)
        .ok_or("no room for a ZIP64 locator")?;
    let locator = Zip64EocdLocator::from_bytes(&data[locator_offset..eocd_offset])?;
    let offset = usize::try_from(locator.eocd64_offset)
        .ok()
        .filter(|o| o.checked_add(Zip64Eocd::MIN_SIZE).is_some_and(|end| end <= locator_offset))
        .ok_or("ZIP64 end of central directory offset out of bounds")?;
    let record = Zip64Eocd::from_bytes(&data[offset..offset + Zip64Eocd::MIN_SIZE])?;
    Ok((record, offset))
}

struct CentralRecord {
    version_made_by: u16,
    flags: u16,
    method: u16,
    mod_time: u16,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    external_attrs: u32,
    header_offset: u64,
    name: String,
}

/// Parse a Central Directory File Header from a cursor.
fn parse_cdfh(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Option<CentralRecord>> {
    let mut sig = [0u8; 4];
    cursor.read_exact(&mut sig)?;
    if &sig != CDFH_SIGNATURE {
        return Ok(None);
    }

    let version_made_by = cursor.read_u16::<LittleEndian>()?;
    let _version_needed = cursor.read_u16::<LittleEndian>()?;
    let flags = cursor.read_u16::<LittleEndian>()?;
    let method = cursor.read_u16::<LittleEndian>()?;
    let mod_time = cursor.read_u16::<LittleEndian>()?;
    let _mod_date = cursor.read_u16::<LittleEndian>()?;
    let crc32 = cursor.read_u32::<LittleEndian>()?;
    let mut compressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let mut uncompressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let name_len = cursor.read_u16::<LittleEndian>()? as usize;
    let extra_len = cursor.read_u16::<LittleEndian>()? as usize;
    let comment_len = cursor.read_u16::<LittleEndian>()? as u64;
    let _disk_number_start = cursor.read_u16::<LittleEndian>()?;
    let _internal_attrs = cursor.read_u16::<LittleEndian>()?;
    let external_attrs = cursor.read_u32::<LittleEndian>()?;
    let mut header_offset = cursor.read_u32::<LittleEndian>()? as u64;

    let mut name_bytes = vec![0u8; name_len];
    cursor.read_exact(&mut name_bytes)?;
    let mut extra = vec![0u8; extra_len];
    cursor.read_exact(&mut extra)?;
    apply_central_zip64_extra(
        &extra,
        &mut uncompressed_size,
        &mut compressed_size,
        &mut header_offset,
    );

    // Skip over the file comment (we don't use it)
    let mut comment = vec![0u8; comment_len as usize];
    cursor.read_exact(&mut comment)?;

    Ok(Some(CentralRecord {
        version_made_by,
        flags,
        method,
        mod_time,
        crc32,
        compressed_size,
        uncompressed_size,
        external_attrs,
        header_offset,
        name: decode_name(&name_bytes),
    }))
}

fn unix_mode(record: &CentralRecord) -> Option<u32> {
    if record.version_made_by >> 8 != HOST_UNIX {
        return None;
    }
    let mode = (record.external_attrs >> 16) & 0o7777;
    (mode != 0).then_some(mode)
}

/// Parses and validates the central directory of `data`.
///
/// Checks that the directory lies inside the file before the end record, that it holds
/// exactly the advertised number of records, and that every local header and payload
/// it points to is in bounds.
pub fn read_central_directory(data: &[u8]) -> Parsed<Vec<ZipEntry>> {
    let (eocd, eocd_offset) = find_eocd(data)?;

    let (cd_offset, cd_size, total_entries, cd_limit) = if eocd.is_zip64() {
        let (eocd64, eocd64_offset) = read_zip64_eocd(data, eocd_offset)?;
        (eocd64.cd_offset, eocd64.cd_size, eocd64.total_entries, eocd64_offset)
    } else {
        (
            eocd.cd_offset as u64,
            eocd.cd_size as u64,
            eocd.total_entries as u64,
            eocd_offset,
        )
    };

    let cd_end = cd_offset
        .checked_add(cd_size)
        .filter(|end| *end <= cd_limit as u64)
        .ok_or_else(|| {
            format!("central directory ({cd_size} bytes at {cd_offset}) extends past its end record")
        })?;
    if total_entries.saturating_mul(CDFH_MIN_SIZE as u64) > cd_size {
        return Err(format!(
            "central directory of {cd_size} bytes cannot hold {total_entries} records"
        ));
    }

    let cd_data = &data[cd_offset as usize..cd_end as usize];
    let mut cursor = Cursor::new(cd_data);
    let mut entries = Vec::with_capacity(total_entries as usize);

    for index in 0..total_entries {
        let record = match parse_cdfh(&mut cursor) {
            Ok(Some(record)) => record,
            Ok(None) => return Err(format!("central directory record {index} has a bad signature")),
            Err(_) => return Err(format!("central directory record {index} is truncated")),
        };
        entries.push(locate_payload(data, record, cd_offset)?);
    }
    if cursor.position() != cd_size {
        return Err(format!(
            "central directory holds {} unexpected trailing bytes",
            cd_size - cursor.position()
        ));
    }
    Ok(entries)
}

/// Reads the local header a central record points to and derives the payload range.
fn locate_payload(data: &[u8], record: CentralRecord, cd_offset: u64) -> Parsed<ZipEntry> {
    let header_offset = record.header_offset;
    let header_end = header_offset
        .checked_add(LFH_SIZE as u64)
        .filter(|end| *end <= cd_offset)
        .ok_or_else(|| format!("local header of '{}' is out of bounds", record.name))?;
    let header = LocalFileHeader::from_bytes(&data[header_offset as usize..header_end as usize])
        .map_err(|_| format!("local header of '{}' is missing", record.name))?;

    let data_offset = header_offset + header.total_len();
    data_offset
        .checked_add(record.compressed_size)
        .filter(|end| *end <= cd_offset)
        .ok_or_else(|| format!("payload of '{}' is out of bounds", record.name))?;

    let mode = unix_mode(&record);
    Ok(ZipEntry {
        method: CompressionMethod::from_u16(record.method),
        flags: record.flags,
        crc32: record.crc32,
        crc_known: true,
        compressed_size: record.compressed_size,
        uncompressed_size: record.uncompressed_size,
        header_offset,
        data_offset,
        mod_time: record.mod_time,
        mode,
        source: EntrySource::CentralDirectory,
        warnings: Vec::new(),
        name: record.name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zip::testutil::ZipBuilder;

    #[test]
    fn parses_a_well_formed_archive() {
        let zip = ZipBuilder::new()
            .stored("a.txt", b"alpha")
            .stored("dir/", b"")
            .stored("dir/b.txt", b"bravo")
            .finish();
        let entries = read_central_directory(&zip).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(&zip[entries[0].payload_range()], b"alpha");
        assert!(entries[1].is_dir());
        assert_eq!(entries[2].mode, Some(0o644));
    }

    #[test]
    fn comment_is_skipped() {
        let zip = ZipBuilder::new()
            .stored("a", b"1")
            .comment(b"PK\x05\x06 looks like an EOCD but is part of the comment")
            .finish();
        let entries = read_central_directory(&zip).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn zeroed_directory_is_invalid() {
        let mut zip = ZipBuilder::new().stored("a", b"1").stored("b", b"2").finish();
        let (eocd, offset) = find_eocd(&zip).unwrap();
        let start = eocd.cd_offset as usize;
        for byte in &mut zip[start..offset] {
            *byte = 0;
        }
        assert!(read_central_directory(&zip).is_err());
    }

    #[test]
    fn out_of_bounds_directory_is_invalid() {
        let mut zip = ZipBuilder::new().stored("a", b"1").finish();
        let (_, offset) = find_eocd(&zip).unwrap();
        // cd_offset field
        zip[offset + 16..offset + 20].copy_from_slice(&0x00FF_FFFFu32.to_le_bytes());
        let err = read_central_directory(&zip).unwrap_err();
        assert!(err.contains("central directory"), "{err}");
    }

    #[test]
    fn wrong_header_offset_is_invalid() {
        let mut zip = ZipBuilder::new().stored("a", b"1").stored("b", b"2").finish();
        let (eocd, _) = find_eocd(&zip).unwrap();
        let first_record = eocd.cd_offset as usize;
        // Point the first record at the second byte of the file.
        zip[first_record + 42..first_record + 46].copy_from_slice(&1u32.to_le_bytes());
        assert!(read_central_directory(&zip).is_err());
    }

    #[test]
    fn missing_eocd_is_reported() {
        assert!(find_eocd(b"PK\x03\x04 truncated and no directory").is_err());
        assert!(find_eocd(b"tiny").is_err());
    }
}
