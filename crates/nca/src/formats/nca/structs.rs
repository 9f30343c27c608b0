use crate::crypto::keyset::KeyAreaKeyIndex;
use crate::crypto::{AesCtrUpperIv, AesKey, AesXtsKey};
use crate::hexstring::HexData;
use crate::ids::RightsId;
use binrw::{BinRead, BinWrite};
use std::io::Cursor;

pub const NCA_HEADER_SIZE: usize = 0x400;
pub const NCA_FS_HEADER_SIZE: usize = 0x200;
pub const NCA_FULL_HEADER_SIZE: usize = 0xc00;
pub const NCA_FS_HEADER_COUNT: usize = 4;
pub const NCA_SIGNATURE_AREA_SIZE: usize = 0x200;
pub const NCA_USED_KEY_AREA_SIZE: usize = 0x40;
pub const NCA_HIERARCHICAL_SHA256_MAX_REGION_COUNT: usize = 5;
pub const NCA_IVFC_LEVEL_COUNT: usize = 6;
pub const NCA_BKTR_MAGIC: &[u8; 4] = b"BKTR";
pub const NCA_BKTR_VERSION: u32 = 1;

/// Section offsets in the main header count in media sectors of this size.
pub const NCA_FS_SECTOR_SIZE: u64 = 0x200;

#[inline]
pub const fn nca_fs_sector_offset(sector: u32) -> u64 {
    sector as u64 * NCA_FS_SECTOR_SIZE
}

/// Format generation, straight from the header magic.
#[derive(Debug, Clone, Copy, Eq, PartialEq, BinRead, BinWrite)]
pub enum NcaVersion {
    #[brw(magic = b"NCA0")]
    Nca0,
    #[brw(magic = b"NCA2")]
    Nca2,
    #[brw(magic = b"NCA3")]
    Nca3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum DistributionType {
    Download,
    GameCard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum NcaContentType {
    Program,
    Meta,
    Control,
    Manual,
    Data,
    PublicData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum NcaFsType {
    RomFs,
    PartitionFs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum NcaHashType {
    Auto,
    None,
    HierarchicalSha256,
    HierarchicalIntegrity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum NcaEncryptionType {
    Auto,
    None,
    AesXts,
    AesCtr,
    AesCtrEx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct NcaSignature(pub HexData<0x100>);

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct Sha256Hash(pub HexData<0x20>);

impl Sha256Hash {
    pub fn compute(data: &[u8]) -> Self {
        use digest::Digest;
        let mut hasher = sha2::Sha256::default();
        hasher.update(data);
        Sha256Hash(HexData(hasher.finalize().into()))
    }

    pub fn verify(&self, data: &[u8]) -> Result<(), ()> {
        (Self::compute(data) == *self).then_some(()).ok_or(())
    }
}

/// One of the four section placement records in the main header.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, BinRead, BinWrite)]
pub struct NcaFsInfo {
    pub start_sector: u32,
    pub end_sector: u32,
    pub hash_sector_count: u32,
    pub reserved: u32,
}

impl NcaFsInfo {
    /// An all-zero entry marks an absent section.
    pub fn is_populated(&self) -> bool {
        *self != NcaFsInfo::default()
    }
}

/// The used portion of the key area: four AES-128 slots. Slots 0 and 1 form
/// the XTS key pair, slot 2 is the CTR key, slot 3 the (unused) CTR-EX key.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, BinRead, BinWrite)]
pub struct NcaKeyArea(pub HexData<NCA_USED_KEY_AREA_SIZE>);

impl NcaKeyArea {
    pub const KEY_COUNT: usize = 4;
    pub const NCA0_KEY_COUNT: usize = 2;

    pub fn slot(&self, index: usize) -> [u8; 0x10] {
        let mut key = [0; 0x10];
        key.copy_from_slice(&self.0 .0[index * 0x10..(index + 1) * 0x10]);
        key
    }

    pub fn set_slot(&mut self, index: usize, key: [u8; 0x10]) {
        self.0 .0[index * 0x10..(index + 1) * 0x10].copy_from_slice(&key);
    }

    pub fn xts_key(&self) -> AesXtsKey {
        let mut key = [0; 0x20];
        key.copy_from_slice(&self.0 .0[..0x20]);
        AesXtsKey(HexData(key))
    }

    pub fn ctr_key(&self) -> AesKey {
        AesKey(HexData(self.slot(2)))
    }

    pub fn set_ctr_key(&mut self, key: AesKey) {
        self.set_slot(2, key.0 .0);
    }

    pub fn ctr_ex_key(&self) -> AesKey {
        AesKey(HexData(self.slot(3)))
    }
}

/// NCA header, corresponding to the first 0x400 bytes of the decrypted NCA
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct NcaHeader {
    pub main_signature: NcaSignature,
    pub acid_signature: NcaSignature,
    pub magic: NcaVersion,
    pub distribution_type: DistributionType,
    pub content_type: NcaContentType,
    pub key_generation_old: u8,
    pub kaek_index: KeyAreaKeyIndex,
    pub content_size: u64,
    pub program_id: u64,
    pub content_index: u32,
    pub sdk_addon_version: u32,
    pub key_generation: u8,
    #[brw(pad_after = 0xe)]
    pub main_signature_key_generation: u8,
    pub rights_id: RightsId,
    pub fs_info: [NcaFsInfo; NCA_FS_HEADER_COUNT],
    pub fs_header_hash: [Sha256Hash; NCA_FS_HEADER_COUNT],
    #[brw(pad_after = 0xc0)]
    pub encrypted_key_area: NcaKeyArea,
}

impl NcaHeader {
    /// The effective key generation: the larger of the two header fields.
    pub fn key_generation(&self) -> u8 {
        std::cmp::max(self.key_generation, self.key_generation_old)
    }

    pub fn from_bytes(data: &[u8; NCA_HEADER_SIZE]) -> Result<Self, binrw::Error> {
        let mut cur = Cursor::new(&data[..]);
        let res = NcaHeader::read(&mut cur)?;
        assert_eq!(cur.position(), NCA_HEADER_SIZE as u64);
        Ok(res)
    }

    pub fn to_bytes(&self) -> Result<[u8; NCA_HEADER_SIZE], binrw::Error> {
        let mut cur = Cursor::new(Vec::with_capacity(NCA_HEADER_SIZE));
        self.write(&mut cur)?;
        let buf = cur.into_inner();
        assert_eq!(buf.len(), NCA_HEADER_SIZE);
        let mut out = [0; NCA_HEADER_SIZE];
        out.copy_from_slice(&buf);
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BinRead, BinWrite)]
pub struct HashRegion {
    pub offset: u64,
    pub size: u64,
}

/// HierarchicalSha256 layout: a single block size shared by every region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct HierarchicalSha256Data {
    pub master_hash: Sha256Hash,
    pub hash_block_size: u32,
    pub hash_region_count: u32,
    pub hash_region: [HashRegion; NCA_HIERARCHICAL_SHA256_MAX_REGION_COUNT],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BinRead, BinWrite)]
pub struct IntegrityLevelInfo {
    pub offset: u64,
    pub size: u64,
    /// log2 of this level's hash block size.
    #[brw(pad_after = 4)]
    pub block_order: u32,
}

impl IntegrityLevelInfo {
    pub fn block_size(&self) -> u64 {
        1 << self.block_order
    }
}

/// IVFC layout: six verification levels below the FS-header master hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(magic = b"IVFC")]
pub struct IntegrityMetaInfo {
    pub version: u32,
    pub master_hash_size: u32,
    pub max_level_count: u32,
    pub level_info: [IntegrityLevelInfo; NCA_IVFC_LEVEL_COUNT],
    pub signature_salt: HexData<0x20>,
    pub master_hash: Sha256Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[br(import(hash_type: NcaHashType))]
pub enum NcaHashData {
    #[br(pre_assert(matches!(hash_type, NcaHashType::Auto | NcaHashType::None)))]
    None,
    #[br(pre_assert(hash_type == NcaHashType::HierarchicalSha256))]
    HierarchicalSha256(HierarchicalSha256Data),
    #[br(pre_assert(hash_type == NcaHashType::HierarchicalIntegrity))]
    Integrity(IntegrityMetaInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BinRead, BinWrite)]
pub struct NcaPatchInfo {
    pub relocation_tree_offset: u64,
    pub relocation_tree_size: u64,
    pub relocation_tree_header: HexData<0x10>,
    pub encryption_tree_offset: u64,
    pub encryption_tree_size: u64,
    pub encryption_tree_header: HexData<0x10>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BinRead, BinWrite)]
pub struct NcaBucketTreeHeader {
    pub magic: HexData<4>,
    pub version: u32,
    pub entry_count: u32,
    pub reserved: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BinRead, BinWrite)]
pub struct NcaBucketInfo {
    pub offset: u64,
    pub size: u64,
    pub header: NcaBucketTreeHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BinRead, BinWrite)]
pub struct NcaSparseInfo {
    pub bucket: NcaBucketInfo,
    pub physical_offset: u64,
    #[brw(pad_after = 0x6)]
    pub generation: u16,
}

impl NcaSparseInfo {
    pub fn exists(&self) -> bool {
        self.generation != 0
    }
}

/// NCA FS section header, one 0x200-byte record per section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct NcaFsHeader {
    pub version: u16,
    pub fs_type: NcaFsType,
    pub hash_type: NcaHashType,
    #[brw(pad_after = 0x3)]
    pub encryption_type: NcaEncryptionType,
    #[br(args(hash_type))]
    #[brw(pad_size_to = 0xf8)]
    pub hash_data: NcaHashData,
    pub patch_info: NcaPatchInfo,
    pub aes_ctr_upper_iv: AesCtrUpperIv,
    #[brw(pad_after = 0x88)]
    pub sparse_info: NcaSparseInfo,
}

impl NcaFsHeader {
    pub fn is_patch_section(&self) -> bool {
        self.patch_info.relocation_tree_size != 0
    }

    pub fn from_bytes(data: &[u8; NCA_FS_HEADER_SIZE]) -> Result<Self, binrw::Error> {
        let mut cur = Cursor::new(&data[..]);
        let res = NcaFsHeader::read(&mut cur)?;
        assert_eq!(cur.position(), NCA_FS_HEADER_SIZE as u64);
        Ok(res)
    }

    pub fn to_bytes(&self) -> Result<[u8; NCA_FS_HEADER_SIZE], binrw::Error> {
        let mut cur = Cursor::new(Vec::with_capacity(NCA_FS_HEADER_SIZE));
        self.write(&mut cur)?;
        let buf = cur.into_inner();
        assert_eq!(buf.len(), NCA_FS_HEADER_SIZE);
        let mut out = [0; NCA_FS_HEADER_SIZE];
        out.copy_from_slice(&buf);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fs_header() -> NcaFsHeader {
        NcaFsHeader {
            version: 2,
            fs_type: NcaFsType::PartitionFs,
            hash_type: NcaHashType::HierarchicalSha256,
            encryption_type: NcaEncryptionType::AesCtr,
            hash_data: NcaHashData::HierarchicalSha256(HierarchicalSha256Data {
                master_hash: Sha256Hash(HexData([0xAA; 0x20])),
                hash_block_size: 0x1000,
                hash_region_count: 2,
                hash_region: [
                    HashRegion {
                        offset: 0,
                        size: 0x20,
                    },
                    HashRegion {
                        offset: 0x1000,
                        size: 0x4000,
                    },
                    HashRegion::default(),
                    HashRegion::default(),
                    HashRegion::default(),
                ],
            }),
            patch_info: NcaPatchInfo::default(),
            aes_ctr_upper_iv: AesCtrUpperIv(0x1122334455667788),
            sparse_info: NcaSparseInfo::default(),
        }
    }

    #[test]
    fn fs_header_layout_is_0x200() {
        let header = sample_fs_header();
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), NCA_FS_HEADER_SIZE);
        // upper counter sits at 0x140, little-endian
        assert_eq!(&bytes[0x140..0x148], &0x1122334455667788u64.to_le_bytes());

        let reparsed = NcaFsHeader::from_bytes(&bytes).unwrap();
        assert_eq!(reparsed, header);
    }

    #[test]
    fn ivfc_hash_data_round_trips() {
        let mut header = sample_fs_header();
        header.fs_type = NcaFsType::RomFs;
        header.hash_type = NcaHashType::HierarchicalIntegrity;
        header.hash_data = NcaHashData::Integrity(IntegrityMetaInfo {
            version: 0x20000,
            master_hash_size: 0x20,
            max_level_count: 7,
            level_info: [IntegrityLevelInfo {
                offset: 0,
                size: 0x4000,
                block_order: 14,
            }; NCA_IVFC_LEVEL_COUNT],
            signature_salt: HexData([0; 0x20]),
            master_hash: Sha256Hash(HexData([0x55; 0x20])),
        });

        let bytes = header.to_bytes().unwrap();
        assert_eq!(&bytes[0x8..0xc], b"IVFC");
        assert_eq!(NcaFsHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn key_area_slots() {
        let mut ka = NcaKeyArea::default();
        ka.set_slot(0, [1; 0x10]);
        ka.set_slot(1, [2; 0x10]);
        ka.set_ctr_key(AesKey(HexData([3; 0x10])));
        assert_eq!(&ka.xts_key().0 .0[..0x10], &[1; 0x10]);
        assert_eq!(&ka.xts_key().0 .0[0x10..], &[2; 0x10]);
        assert_eq!(ka.ctr_key().0 .0, [3; 0x10]);
        assert!(ka.ctr_ex_key().0 .0 == [0; 0x10]);
    }
}
