use crate::hexstring::HexData;
use aes::Aes128;
use binrw::{BinRead, BinWrite};
use cipher::generic_array::GenericArray;
use ctr::Ctr128BE;
use hex::FromHexError;
use snafu::Snafu;
use std::str::FromStr;
use xts_mode::Xts128;

pub mod arena;
pub mod keyset;
pub mod signature;

pub use arena::{CryptoArena, CRYPTO_SCRATCH_SIZE};

pub const AES_BLOCK_SIZE: usize = 0x10;
pub const XTS_SECTOR_SIZE: usize = 0x200;
pub const SHA256_HASH_SIZE: usize = 0x20;

#[derive(Snafu, Debug)]
pub enum KeyParseError {
    InvalidLength { expected: usize, actual: usize },
    InvalidChar { char: char, index: usize },
}

/// Represents an encrypted AES-128 title key.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TitleKey(pub HexData<0x10>);
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AesKey(pub HexData<0x10>);
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AesXtsKey(pub HexData<0x20>);

/// RSA-2048 public modulus for the NCA header main signature.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RsaModulus(pub HexData<0x100>);

fn parse_key(s: &str, result: &mut [u8]) -> Result<(), KeyParseError> {
    hex::decode_to_slice(s, result).map_err(|e| match e {
        FromHexError::InvalidHexCharacter { c, index } => {
            KeyParseError::InvalidChar { char: c, index }
        }
        FromHexError::OddLength | FromHexError::InvalidStringLength => {
            KeyParseError::InvalidLength {
                expected: result.len() * 2,
                actual: s.len(),
            }
        }
    })?;
    Ok(())
}

impl FromStr for AesKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x10];
        parse_key(s, &mut result).map(|_| AesKey(HexData(result)))
    }
}

impl FromStr for AesXtsKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x20];
        parse_key(s, &mut result).map(|_| AesXtsKey(HexData(result)))
    }
}

impl FromStr for TitleKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x10];
        parse_key(s, &mut result).map(|_| TitleKey(HexData(result)))
    }
}

impl FromStr for RsaModulus {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x100];
        parse_key(s, &mut result).map(|_| RsaModulus(HexData(result)))
    }
}

impl TitleKey {
    pub fn decrypt(&self, title_kek: AesKey) -> AesKey {
        title_kek.decrypt_block(&self.0 .0)
    }
}

impl From<[u8; 0x10]> for TitleKey {
    fn from(data: [u8; 0x10]) -> Self {
        TitleKey(HexData(data))
    }
}

impl From<[u8; 0x10]> for AesKey {
    fn from(data: [u8; 0x10]) -> Self {
        AesKey(HexData(data))
    }
}

impl AesKey {
    /// Decrypt a single block in ECB mode.
    pub fn decrypt_block(&self, source: &[u8; 0x10]) -> AesKey {
        use cipher::{BlockDecrypt, KeyInit};
        let mut newkey = *source;

        let crypter = Aes128::new(GenericArray::from_slice(&self.0 .0));
        crypter.decrypt_block(GenericArray::from_mut_slice(&mut newkey));

        AesKey(HexData(newkey))
    }

    /// Encrypt a single block in ECB mode.
    pub fn encrypt_block(&self, source: &[u8; 0x10]) -> AesKey {
        use cipher::{BlockEncrypt, KeyInit};
        let mut newkey = *source;

        let crypter = Aes128::new(GenericArray::from_slice(&self.0 .0));
        crypter.encrypt_block(GenericArray::from_mut_slice(&mut newkey));

        AesKey(HexData(newkey))
    }

    /// Apply the AES-128-CTR keystream for the given counter. Decryption and
    /// encryption are the same operation.
    pub fn apply_ctr(&self, buf: &mut [u8], ctr: &[u8; 0x10]) {
        use cipher::{KeyIvInit, StreamCipher};

        if buf.len() % AES_BLOCK_SIZE != 0 {
            panic!("Length must be multiple of AES blocks!")
        }

        let key = GenericArray::from_slice(&self.0 .0);
        let iv = GenericArray::from_slice(ctr);
        let mut crypter = Ctr128BE::<Aes128>::new(key, iv);
        crypter.apply_keystream(buf);
    }
}

fn get_tweak(mut sector: u64) -> [u8; 0x10] {
    let mut tweak = [0; 0x10];
    for tweak in tweak.iter_mut().rev() {
        /* Nintendo big-endian custom tweak... */
        *tweak = (sector & 0xFF) as u8;
        sector >>= 8;
    }
    tweak
}

impl AesXtsKey {
    #[inline]
    fn to_crypter(&self) -> Xts128<Aes128> {
        use cipher::KeyInit;

        let key1 = Aes128::new(GenericArray::from_slice(&self.0 .0[0x00..0x10]));
        let key2 = Aes128::new(GenericArray::from_slice(&self.0 .0[0x10..0x20]));
        Xts128::<Aes128>::new(key1, key2)
    }

    pub fn decrypt(&self, data: &mut [u8], mut sector: u64, sector_size: usize) {
        if data.len() % sector_size != 0 {
            panic!("Length must be multiple of sectors!")
        }

        let crypter = self.to_crypter();

        for i in (0..data.len()).step_by(sector_size) {
            let tweak = get_tweak(sector);

            crypter.decrypt_sector(&mut data[i..i + sector_size], tweak);
            sector += 1;
        }
    }

    pub fn encrypt(&self, data: &mut [u8], mut sector: u64, sector_size: usize) {
        if data.len() % sector_size != 0 {
            panic!("Length must be multiple of sectors!")
        }

        let crypter = self.to_crypter();

        for i in (0..data.len()).step_by(sector_size) {
            let tweak = get_tweak(sector);

            crypter.encrypt_sector(&mut data[i..i + sector_size], tweak);
            sector += 1;
        }
    }
}

/// The upper half of a section's AES-CTR counter, as stored in the FS header.
///
/// The low 32 bits form the generation word, which CTR-EX and sparse-layer
/// counters override before the offset half is assembled.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, BinRead, BinWrite)]
pub struct AesCtrUpperIv(pub u64);

impl AesCtrUpperIv {
    /// Assemble the full 16-byte counter for an absolute content offset.
    pub fn partial_ctr(&self, content_offset: u64) -> [u8; 0x10] {
        let mut ctr = [0; 0x10];
        ctr[..8].copy_from_slice(&self.0.to_be_bytes());
        ctr[8..].copy_from_slice(&(content_offset >> 4).to_be_bytes());
        ctr
    }

    /// Assemble a counter whose generation word is replaced by `ctr_val`.
    pub fn partial_ctr_ex(&self, ctr_val: u32, content_offset: u64) -> [u8; 0x10] {
        let mut ctr = self.partial_ctr(content_offset);
        ctr[4..8].copy_from_slice(&ctr_val.to_be_bytes());
        ctr
    }

    /// Derive the upper IV used for a sparse-layer bucket table.
    pub fn with_sparse_generation(&self, generation: u16) -> AesCtrUpperIv {
        AesCtrUpperIv((self.0 & !0xFFFF_FFFF) | ((generation as u64) << 16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nintendo_tweak() {
        let tweak = get_tweak(0x0102);
        let mut expected = [0; 0x10];
        expected[0xe] = 0x01;
        expected[0xf] = 0x02;
        assert_eq!(tweak, expected);
    }

    #[test]
    fn partial_ctr_assembly() {
        let iv = AesCtrUpperIv(0x0011223344556677);
        let ctr = iv.partial_ctr(0x1230);
        assert_eq!(&ctr[..8], &[0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);
        assert_eq!(&ctr[8..], &0x123u64.to_be_bytes());
    }

    #[test]
    fn partial_ctr_ex_overrides_generation_word() {
        let iv = AesCtrUpperIv(0x0011223344556677);
        let ctr = iv.partial_ctr_ex(0xAABBCCDD, 0x40);
        assert_eq!(&ctr[..4], &[0x00, 0x11, 0x22, 0x33]);
        assert_eq!(&ctr[4..8], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(&ctr[8..], &0x4u64.to_be_bytes());
    }

    #[test]
    fn sparse_generation_shift() {
        let iv = AesCtrUpperIv(0xDEADBEEF_00000000);
        assert_eq!(iv.with_sparse_generation(2).0, 0xDEADBEEF_00020000);
    }

    #[test]
    fn ecb_round_trip() {
        let kek: AesKey = "2113433c80d3e45bb9bc0e1ab8f86f33".parse().unwrap();
        let plain = [0x42u8; 0x10];
        let enc = kek.encrypt_block(&plain);
        let dec = kek.decrypt_block(&enc.0 .0);
        assert_eq!(dec.0 .0, plain);
        assert_ne!(enc.0 .0, plain);
    }

    #[test]
    fn xts_round_trip() {
        let key: AesXtsKey =
            "a0a1a2a3a4a5a6a7a8a9aaabacadaeafb0b1b2b3b4b5b6b7b8b9babbbcbdbebf"
                .parse()
                .unwrap();
        let mut data = vec![0x5au8; XTS_SECTOR_SIZE * 2];
        let orig = data.clone();
        key.encrypt(&mut data, 2, XTS_SECTOR_SIZE);
        assert_ne!(data, orig);
        key.decrypt(&mut data, 2, XTS_SECTOR_SIZE);
        assert_eq!(data, orig);
    }

    #[test]
    fn ctr_round_trip_is_symmetric() {
        let key: AesKey = "00112233445566778899aabbccddeeff".parse().unwrap();
        let ctr = AesCtrUpperIv(7).partial_ctr(0xC00);
        let mut data = vec![0x11u8; 0x40];
        let orig = data.clone();
        key.apply_ctr(&mut data, &ctr);
        assert_ne!(data, orig);
        key.apply_ctr(&mut data, &ctr);
        assert_eq!(data, orig);
    }
}
