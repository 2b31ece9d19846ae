//! Traditional PKWARE encryption ("ZipCrypto").
//!
//! Three 32-bit keys are seeded from the password and updated with every plaintext byte.
//! Each encrypted payload starts with a 12-byte header whose last decrypted byte must
//! match a check byte taken from the entry metadata; that is the only password check the
//! format offers.

use std::io::{self, Read};

/// Size of the encryption header that precedes every encrypted payload.
pub const ENCRYPTION_HEADER_SIZE: usize = 12;

const CRC_TABLE: [u32; 256] = build_crc_table();

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

#[inline]
fn crc32_byte(crc: u32, byte: u8) -> u32 {
    (crc >> 8) ^ CRC_TABLE[((crc ^ byte as u32) & 0xFF) as usize]
}

/// The running key state.
#[derive(Debug, Clone)]
pub struct ZipCryptoKeys {
    key0: u32,
    key1: u32,
    key2: u32,
}

impl ZipCryptoKeys {
    /// Seeds the keys from `password`.
    pub fn new(password: &[u8]) -> Self {
        let mut keys = Self {
            key0: 0x1234_5678,
            key1: 0x2345_6789,
            key2: 0x3456_7890,
        };
        for &byte in password {
            keys.update(byte);
        }
        keys
    }

    fn update(&mut self, plain: u8) {
        self.key0 = crc32_byte(self.key0, plain);
        self.key1 = self
            .key1
            .wrapping_add(self.key0 & 0xFF)
            .wrapping_mul(134_775_813)
            .wrapping_add(1);
        self.key2 = crc32_byte(self.key2, (self.key1 >> 24) as u8);
    }

    fn stream_byte(&self) -> u8 {
        let temp = (self.key2 | 2) as u16;
        (temp.wrapping_mul(temp ^ 1) >> 8) as u8
    }

    pub fn decrypt_byte(&mut self, cipher: u8) -> u8 {
        let plain = cipher ^ self.stream_byte();
        self.update(plain);
        plain
    }

    pub fn encrypt_byte(&mut self, plain: u8) -> u8 {
        let cipher = plain ^ self.stream_byte();
        self.update(plain);
        cipher
    }

    pub fn decrypt_in_place(&mut self, buf: &mut [u8]) {
        for byte in buf {
            *byte = self.decrypt_byte(*byte);
        }
    }
}

/// Decrypts the 12-byte header with `password` and compares its last byte against
/// `check_byte`. Returns the keys positioned at the first payload byte on success.
pub fn open(password: &[u8], header: &[u8], check_byte: u8) -> Option<ZipCryptoKeys> {
    if header.len() < ENCRYPTION_HEADER_SIZE {
        return None;
    }
    let mut keys = ZipCryptoKeys::new(password);
    let mut last = 0u8;
    for &byte in &header[..ENCRYPTION_HEADER_SIZE] {
        last = keys.decrypt_byte(byte);
    }
    (last == check_byte).then_some(keys)
}

/// A reader that decrypts the bytes of its inner reader.
pub struct DecryptingReader<R> {
    inner: R,
    keys: ZipCryptoKeys,
}

impl<R: Read> DecryptingReader<R> {
    pub fn new(inner: R, keys: ZipCryptoKeys) -> Self {
        Self { inner, keys }
    }
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.keys.decrypt_in_place(&mut buf[..n]);
        Ok(n)
    }
}

/// Encrypts `payload` behind a header whose last byte is `check_byte`.
///
/// The extractor never writes archives; this exists so fixtures with a known password
/// can be assembled. The header filler is fixed rather than random.
pub fn seal(password: &[u8], check_byte: u8, payload: &[u8]) -> Vec<u8> {
    let mut keys = ZipCryptoKeys::new(password);
    let mut out = Vec::with_capacity(ENCRYPTION_HEADER_SIZE + payload.len());
    for i in 0..ENCRYPTION_HEADER_SIZE - 1 {
        out.push(keys.encrypt_byte(0xA5 ^ i as u8));
    }
    out.push(keys.encrypt_byte(check_byte));
    for &byte in payload {
        out.push(keys.encrypt_byte(byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_standard_crc32() {
        let mut crc = 0xFFFF_FFFFu32;
        for &b in b"123456789" {
            crc = crc32_byte(crc, b);
        }
        assert_eq!(!crc, 0xCBF4_3926);
        assert_eq!(!crc, crc32fast::hash(b"123456789"));
    }

    #[test]
    fn sealed_payload_opens_with_the_right_password() {
        let sealed = seal(b"secret", 0x5A, b"attack at dawn");
        let (header, body) = sealed.split_at(ENCRYPTION_HEADER_SIZE);

        let keys = open(b"secret", header, 0x5A).expect("password accepted");
        let mut plain = Vec::new();
        DecryptingReader::new(body, keys).read_to_end(&mut plain).unwrap();
        assert_eq!(plain, b"attack at dawn");
    }

    #[test]
    fn wrong_password_fails_the_check_byte() {
        let sealed = seal(b"secret", 0x5A, b"x");
        let header = &sealed[..ENCRYPTION_HEADER_SIZE];
        // A wrong password passes the one-byte check with probability 1/256; these do not.
        assert!(open(b"Secret", header, 0x5A).is_none());
        assert!(open(b"", header, 0x5A).is_none());
        assert!(open(b"secret", &header[..4], 0x5A).is_none());
    }
}
