//! Recovery scan over local file headers.
//!
//! Used when the central directory is missing or inconsistent. The scan walks the file
//! front to back looking for `PK\x03\x04`, trusts the fixed header fields only as far as
//! they agree with the bytes around them, and records every guess as an entry warning.
//!
//! ## Payload delimiting:
//! - The advertised compressed size is used when it is plausible. If the bytes after it
//!   are neither a known record signature nor end of file, the entry is kept with an
//!   "unconfirmed size" warning and the scan resumes inside its payload.
//! - Otherwise the payload runs to the next record signature or end of file. A data
//!   descriptor found there (signed, or unsigned just before the next header) supplies
//!   the CRC and sizes.

use super::structures::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

const DESCRIPTOR_SIZE: usize = 12;
const DESCRIPTOR64_SIZE: usize = 20;

struct Descriptor {
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    /// Bytes occupied, signature included.
    len: usize,
}

fn find_from(data: &[u8], from: usize, pred: impl Fn(&[u8]) -> bool) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(4)
        .position(|w| pred(w))
        .map(|p| from + p)
}

fn next_local_header(data: &[u8], from: usize) -> Option<usize> {
    find_from(data, from, |w| w == LFH_SIGNATURE.as_slice())
}

fn next_record(data: &[u8], from: usize) -> Option<usize> {
    find_from(data, from, |w| {
        FOLLOWING_SIGNATURES.iter().any(|sig| w == sig.as_slice())
    })
}

/// Reads the fields after a descriptor signature at `at`, accepting the 32-bit or 64-bit
/// layout whose compressed size equals `payload_len`.
fn signed_descriptor(data: &[u8], at: usize, payload_len: u64) -> Option<Descriptor> {
    let body = data.get(at + 4..)?;
    let mut cursor = Cursor::new(body);
    let crc32 = cursor.read_u32::<LittleEndian>().ok()?;

    let short = (
        cursor.read_u32::<LittleEndian>().ok(),
        cursor.read_u32::<LittleEndian>().ok(),
    );
    if let (Some(compressed), Some(uncompressed)) = short {
        if compressed as u64 == payload_len {
            return Some(Descriptor {
                crc32,
                compressed_size: compressed as u64,
                uncompressed_size: uncompressed as u64,
                len: 4 + DESCRIPTOR_SIZE,
            });
        }
    }

    let mut cursor = Cursor::new(body.get(4..)?);
    let compressed = cursor.read_u64::<LittleEndian>().ok()?;
    let uncompressed = cursor.read_u64::<LittleEndian>().ok()?;
    (compressed == payload_len).then_some(Descriptor {
        crc32,
        compressed_size: compressed,
        uncompressed_size: uncompressed,
        len: 4 + DESCRIPTOR64_SIZE,
    })
}

/// Looks for a descriptor without signature ending exactly at `end`.
fn unsigned_descriptor(data: &[u8], data_offset: usize, end: usize) -> Option<(usize, Descriptor)> {
    for len in [DESCRIPTOR_SIZE, DESCRIPTOR64_SIZE] {
        let Some(start) = end.checked_sub(len).filter(|s| *s >= data_offset) else {
            continue;
        };
        let mut cursor = Cursor::new(&data[start..end]);
        let crc32 = cursor.read_u32::<LittleEndian>().ok()?;
        let (compressed, uncompressed) = if len == DESCRIPTOR_SIZE {
            (
                cursor.read_u32::<LittleEndian>().ok()? as u64,
                cursor.read_u32::<LittleEndian>().ok()? as u64,
            )
        } else {
            (
                cursor.read_u64::<LittleEndian>().ok()?,
                cursor.read_u64::<LittleEndian>().ok()?,
            )
        };
        if compressed == (start - data_offset) as u64 {
            return Some((
                start,
                Descriptor {
                    crc32,
                    compressed_size: compressed,
                    uncompressed_size: uncompressed,
                    len,
                },
            ));
        }
    }
    None
}

struct Delimited {
    compressed_size: u64,
    descriptor: Option<Descriptor>,
    /// Where the scan continues.
    resume_at: usize,
    warnings: Vec<String>,
}

fn delimit(data: &[u8], header: &LocalFileHeader, data_offset: usize) -> Delimited {
    let streamed = header.flags & FLAG_DATA_DESCRIPTOR != 0;
    let advertised = header.compressed_size;
    let plausible = advertised != ZIP64_SENTINEL as u64
        && !(advertised == 0 && streamed)
        && (data_offset as u64).saturating_add(advertised) <= data.len() as u64;

    if plausible {
        let end = data_offset + advertised as usize;
        let mut warnings = Vec::new();
        let mut resume_at = end;
        let mut descriptor = None;
        if streamed && data.get(end..end + 4) == Some(DATA_DESCRIPTOR_SIGNATURE.as_slice()) {
            descriptor = signed_descriptor(data, end, advertised);
            if let Some(d) = &descriptor {
                resume_at = end + d.len;
            }
        }
        if end != data.len() && !starts_with_known_signature(data, end) {
            warnings.push(format!(
                "unconfirmed size: {advertised} bytes advertised but no record follows the payload"
            ));
            resume_at = data_offset;
        }
        return Delimited {
            compressed_size: advertised,
            descriptor,
            resume_at,
            warnings,
        };
    }

    // Scan to the next record, skipping descriptor signatures whose sizes disagree with
    // the distance travelled (those are payload bytes).
    let mut from = data_offset;
    let end = loop {
        match next_record(data, from) {
            Some(at) if data[at..at + 4] == *DATA_DESCRIPTOR_SIGNATURE => {
                if let Some(d) = signed_descriptor(data, at, (at - data_offset) as u64) {
                    return Delimited {
                        compressed_size: d.compressed_size,
                        resume_at: at + d.len,
                        descriptor: Some(d),
                        warnings: vec!["payload delimited by its data descriptor".into()],
                    };
                }
                from = at + 1;
            }
            Some(at) => break at,
            None => break data.len(),
        }
    };

    if streamed {
        if let Some((start, d)) = unsigned_descriptor(data, data_offset, end) {
            return Delimited {
                compressed_size: d.compressed_size,
                resume_at: start + d.len,
                descriptor: Some(d),
                warnings: vec!["payload delimited by an unsigned data descriptor".into()],
            };
        }
    }
    Delimited {
        compressed_size: (end - data_offset) as u64,
        descriptor: None,
        resume_at: end,
        warnings: vec![format!(
            "size not trustworthy; payload delimited by scanning to byte {end}"
        )],
    }
}

/// Rebuilds entry descriptions from the local headers of `data`, in file order.
///
/// Never fails: a header that cannot be parsed is skipped and the scan moves on.
pub fn scan_local_headers(data: &[u8]) -> Vec<ZipEntry> {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    while let Some(at) = next_local_header(data, pos) {
        let Ok(mut header) = LocalFileHeader::from_bytes(&data[at..]) else {
            break;
        };
        let name_start = at + LFH_SIZE;
        let extra_start = name_start + header.name_len as usize;
        let data_offset = extra_start + header.extra_len as usize;
        if data_offset > data.len() {
            tracing::debug!("local header at {at} is truncated");
            pos = at + 4;
            continue;
        }
        header.apply_zip64_extra(&data[extra_start..data_offset]);
        let name = decode_name(&data[name_start..extra_start]);

        let delimited = delimit(data, &header, data_offset);
        let (crc32, crc_known, uncompressed_size) = match &delimited.descriptor {
            Some(d) => (d.crc32, true, d.uncompressed_size),
            None => (
                header.crc32,
                header.flags & FLAG_DATA_DESCRIPTOR == 0,
                header.uncompressed_size,
            ),
        };
        tracing::debug!(
            "recovered '{}' at {} ({} bytes)",
            name,
            at,
            delimited.compressed_size
        );

        entries.push(ZipEntry {
            name,
            method: CompressionMethod::from_u16(header.method),
            flags: header.flags,
            crc32,
            crc_known,
            compressed_size: delimited.compressed_size,
            uncompressed_size,
            header_offset: at as u64,
            data_offset: data_offset as u64,
            mod_time: header.mod_time,
            mode: None,
            source: EntrySource::Recovered,
            warnings: delimited.warnings,
        });
        pos = delimited.resume_at.max(at + 4);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zip::testutil::{wipe_central_directory, ZipBuilder};

    #[test]
    fn recovers_entries_after_the_directory_is_wiped() {
        let mut zip = ZipBuilder::new()
            .stored("a.txt", b"alpha")
            .deflated("b.txt", &b"bravo ".repeat(100))
            .finish();
        wipe_central_directory(&mut zip);

        let entries = scan_local_headers(&zip);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(&zip[entries[0].payload_range()], b"alpha");
        assert_eq!(entries[0].source, EntrySource::Recovered);
        assert!(entries[0].warnings.is_empty(), "{:?}", entries[0].warnings);
        assert_eq!(entries[1].method, CompressionMethod::Deflate);
        assert!(entries[1].crc_known);
    }

    #[test]
    fn descriptor_supplies_crc_and_sizes() {
        let zip = ZipBuilder::new()
            .streamed("s.bin", b"streamed payload")
            .stored("after", b"x")
            .finish();
        let entries = scan_local_headers(&zip);
        assert_eq!(entries.len(), 2);
        let streamed = &entries[0];
        assert_eq!(&zip[streamed.payload_range()], b"streamed payload");
        assert_eq!(streamed.crc32, crc32fast::hash(b"streamed payload"));
        assert_eq!(streamed.uncompressed_size, 16);
        assert!(streamed.crc_known);
        assert_eq!(entries[1].name, "after");
    }

    #[test]
    fn inflated_size_falls_back_to_scanning() {
        let mut zip = ZipBuilder::new().stored("a", b"12345").stored("b", b"6").finish();
        // Compressed size of "a" claims to run past the end of the file.
        zip[18..22].copy_from_slice(&0x00FF_0000u32.to_le_bytes());
        let entries = scan_local_headers(&zip);
        assert_eq!(entries.len(), 2);
        assert_eq!(&zip[entries[0].payload_range()], b"12345");
        assert!(entries[0].warnings[0].contains("scanning"));
    }

    #[test]
    fn wrong_but_plausible_size_is_flagged() {
        let mut zip = ZipBuilder::new().stored("a", b"12345").stored("b", b"6").finish();
        zip[18..22].copy_from_slice(&3u32.to_le_bytes());
        let entries = scan_local_headers(&zip);
        assert_eq!(entries[0].compressed_size, 3);
        assert!(entries[0].warnings[0].starts_with("unconfirmed size"));
        assert!(entries.iter().any(|e| e.name == "b"));
    }

    #[test]
    fn garbage_yields_nothing() {
        assert!(scan_local_headers(b"no zip here at all").is_empty());
        assert!(scan_local_headers(b"PK\x03\x04short").is_empty());
    }
}
