//! Byte-level ZIP assembly for unit tests.

use super::crypto;
use byteorder::{LittleEndian, WriteBytesExt};
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::Write;

const MOD_TIME: u16 = 0x6C20;
const MOD_DATE: u16 = 0x5821;
const VERSION: u16 = 20;
const MADE_BY_UNIX: u16 = (3 << 8) | VERSION;

struct Member {
    name: String,
    method: u16,
    flags: u16,
    crc: u32,
    payload: Vec<u8>,
    uncompressed_len: u32,
    external_attrs: u32,
}

#[derive(Default)]
pub struct ZipBuilder {
    members: Vec<Member>,
    comment: Vec<u8>,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, name: &str, data: &[u8], method: u16, flags: u16, payload: Vec<u8>) -> Self {
        let external_attrs = if name.ends_with('/') {
            0o40755 << 16
        } else {
            0o100644 << 16
        };
        self.members.push(Member {
            name: name.to_string(),
            method,
            flags,
            crc: crc32fast::hash(data),
            payload,
            uncompressed_len: data.len() as u32,
            external_attrs,
        });
        self
    }

    pub fn stored(self, name: &str, data: &[u8]) -> Self {
        self.push(name, data, 0, 0, data.to_vec())
    }

    pub fn deflated(self, name: &str, data: &[u8]) -> Self {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        let payload = encoder.finish().unwrap();
        self.push(name, data, 8, 0, payload)
    }

    pub fn zstd(self, name: &str, data: &[u8]) -> Self {
        let payload = zstd::stream::encode_all(data, 3).unwrap();
        self.push(name, data, 93, 0, payload)
    }

    /// Stored entry whose CRC and sizes follow the payload in a data descriptor.
    pub fn streamed(self, name: &str, data: &[u8]) -> Self {
        self.push(name, data, 0, 0x0008, data.to_vec())
    }

    /// Stored entry sealed with ZipCrypto.
    pub fn encrypted(self, name: &str, data: &[u8], password: &str) -> Self {
        let check = (crc32fast::hash(data) >> 24) as u8;
        let payload = crypto::seal(password.as_bytes(), check, data);
        self.push(name, data, 0, 0x0001, payload)
    }

    /// Sealed entry with a data descriptor, so the check byte comes from the time field.
    pub fn encrypted_streamed(self, name: &str, data: &[u8], password: &str) -> Self {
        let payload = crypto::seal(password.as_bytes(), (MOD_TIME >> 8) as u8, data);
        self.push(name, data, 0, 0x0009, payload)
    }

    /// Entry with an arbitrary method code and raw payload.
    pub fn raw(self, name: &str, method: u16, flags: u16, payload: &[u8]) -> Self {
        let mut builder = self.push(name, payload, method, flags, payload.to_vec());
        if let Some(last) = builder.members.last_mut() {
            last.uncompressed_len = payload.len() as u32;
        }
        builder
    }

    pub fn comment(mut self, comment: &[u8]) -> Self {
        self.comment = comment.to_vec();
        self
    }

    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut central = Vec::new();

        for m in &self.members {
            let offset = out.len() as u32;
            let descriptor = m.flags & 0x0008 != 0;
            let (crc, csize, usize_) = if descriptor {
                (0, 0, 0)
            } else {
                (m.crc, m.payload.len() as u32, m.uncompressed_len)
            };

            out.extend_from_slice(b"PK\x03\x04");
            out.write_u16::<LittleEndian>(VERSION).unwrap();
            out.write_u16::<LittleEndian>(m.flags).unwrap();
            out.write_u16::<LittleEndian>(m.method).unwrap();
            out.write_u16::<LittleEndian>(MOD_TIME).unwrap();
            out.write_u16::<LittleEndian>(MOD_DATE).unwrap();
            out.write_u32::<LittleEndian>(crc).unwrap();
            out.write_u32::<LittleEndian>(csize).unwrap();
            out.write_u32::<LittleEndian>(usize_).unwrap();
            out.write_u16::<LittleEndian>(m.name.len() as u16).unwrap();
            out.write_u16::<LittleEndian>(0).unwrap();
            out.extend_from_slice(m.name.as_bytes());
            out.extend_from_slice(&m.payload);
            if descriptor {
                out.extend_from_slice(b"PK\x07\x08");
                out.write_u32::<LittleEndian>(m.crc).unwrap();
                out.write_u32::<LittleEndian>(m.payload.len() as u32).unwrap();
                out.write_u32::<LittleEndian>(m.uncompressed_len).unwrap();
            }

            central.extend_from_slice(b"PK\x01\x02");
            central.write_u16::<LittleEndian>(MADE_BY_UNIX).unwrap();
            central.write_u16::<LittleEndian>(VERSION).unwrap();
            central.write_u16::<LittleEndian>(m.flags).unwrap();
            central.write_u16::<LittleEndian>(m.method).unwrap();
            central.write_u16::<LittleEndian>(MOD_TIME).unwrap();
            central.write_u16::<LittleEndian>(MOD_DATE).unwrap();
            central.write_u32::<LittleEndian>(m.crc).unwrap();
            central.write_u32::<LittleEndian>(m.payload.len() as u32).unwrap();
            central.write_u32::<LittleEndian>(m.uncompressed_len).unwrap();
            central.write_u16::<LittleEndian>(m.name.len() as u16).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u32::<LittleEndian>(m.external_attrs).unwrap();
            central.write_u32::<LittleEndian>(offset).unwrap();
            central.extend_from_slice(m.name.as_bytes());
        }

        let cd_offset = out.len() as u32;
        out.extend_from_slice(&central);
        out.extend_from_slice(b"PK\x05\x06");
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(self.members.len() as u16).unwrap();
        out.write_u16::<LittleEndian>(self.members.len() as u16).unwrap();
        out.write_u32::<LittleEndian>(central.len() as u32).unwrap();
        out.write_u32::<LittleEndian>(cd_offset).unwrap();
        out.write_u16::<LittleEndian>(self.comment.len() as u16).unwrap();
        out.extend_from_slice(&self.comment);
        out
    }
}

/// Overwrites the whole central directory and end record with zeros.
pub fn wipe_central_directory(zip: &mut [u8]) {
    let (eocd, offset) = super::parser::find_eocd(zip).unwrap();
    let end = offset + super::structures::EndOfCentralDirectory::SIZE;
    for byte in &mut zip[eocd.cd_offset as usize..end] {
        *byte = 0;
    }
}
