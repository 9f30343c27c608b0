//! In-memory construction of small but fully valid NCA images: encrypted
//! headers, key areas, section bodies and hash trees.

use num_integer::Integer;

use crate::crypto::keyset::{KeySet, KeyAreaKeyIndex};
use crate::crypto::{AesCtrUpperIv, AesKey, XTS_SECTOR_SIZE};
use crate::formats::nca::structs::*;
use crate::formats::nca::ContentInfo;
use crate::hexstring::HexData;
use crate::ids::{ContentId, RightsId};

pub(crate) const HEADER_KEY_HEX: &str =
    "c2caaff089b9aed55694876055271c7d42ac78a7e0f2e5d1ab2b33290a8e3d2c";
pub(crate) const KAEK_HEX: &str = "2113433c80d3e45bb9bc0e1ab8f86f33";
pub(crate) const TITLEKEK_HEX: &str = "b4e2b3a5c6d8190c4d5e6f708192a3b4";

pub(crate) fn test_keys() -> KeySet {
    test_keys_with_title_keys("")
}

pub(crate) fn test_keys_with_title_keys(title_keys: &str) -> KeySet {
    KeySet::from_file_contents(
        &format!(
            "header_key = {HEADER_KEY_HEX}\n\
             key_area_key_application_00 = {KAEK_HEX}\n\
             titlekek_00 = {TITLEKEK_HEX}\n"
        ),
        title_keys,
    )
    .unwrap()
}

pub(crate) fn test_content_info(id_byte: u8) -> ContentInfo {
    ContentInfo {
        content_id: ContentId([id_byte; 0x10]),
        content_type: NcaContentType::Program,
    }
}

/// A key area whose XTS and CTR slots are filled with fixed test keys.
pub(crate) fn test_key_area() -> NcaKeyArea {
    let mut key_area = NcaKeyArea::default();
    key_area.set_slot(0, [0x31; 0x10]);
    key_area.set_slot(1, [0x32; 0x10]);
    key_area.set_slot(2, [0x33; 0x10]);
    key_area
}

pub(crate) struct SectionSpec {
    pub fs_header: NcaFsHeader,
    /// Plaintext body covering the whole section, in 0x200 multiples.
    pub body: Vec<u8>,
    /// Copy the body verbatim instead of encrypting it (CTR-EX tests
    /// pre-encrypt their ranges).
    pub raw: bool,
}

pub(crate) struct ArchiveSpec {
    pub version: NcaVersion,
    pub first_sector: u32,
    pub rights_id: Option<RightsId>,
    pub titlekey_plain: Option<AesKey>,
    pub key_area_plain: NcaKeyArea,
    pub distribution: DistributionType,
    pub sections: Vec<Option<SectionSpec>>,
    /// Extra bytes appended after the last section (sparse-table room).
    pub tail_space: u64,
}

impl ArchiveSpec {
    pub fn nca3(sections: Vec<Option<SectionSpec>>) -> Self {
        Self {
            version: NcaVersion::Nca3,
            first_sector: 6,
            rights_id: None,
            titlekey_plain: None,
            key_area_plain: test_key_area(),
            distribution: DistributionType::GameCard,
            sections,
            tail_space: 0,
        }
    }
}

pub(crate) fn build_archive(spec: &ArchiveSpec, keys: &KeySet) -> Vec<u8> {
    build_archive_with(spec, keys, |_| {})
}

/// Assemble a complete encrypted archive. `tweak` runs on the finished
/// plaintext main header right before it is hashed into the image, so tests
/// can inject signatures or corruption.
pub(crate) fn build_archive_with(
    spec: &ArchiveSpec,
    keys: &KeySet,
    tweak: impl FnOnce(&mut NcaHeader),
) -> Vec<u8> {
    let kaek = keys
        .key_area_key(KeyAreaKeyIndex::Application, 0)
        .unwrap();

    let mut fs_info = [NcaFsInfo::default(); NCA_FS_HEADER_COUNT];
    let mut fs_header_hash = [Sha256Hash(HexData([0; 0x20])); NCA_FS_HEADER_COUNT];

    let mut cursor = spec.first_sector;
    for (i, section) in spec.sections.iter().enumerate() {
        let Some(section) = section else { continue };
        assert_eq!(section.body.len() % NCA_FS_SECTOR_SIZE as usize, 0);
        let sectors = (section.body.len() as u64 / NCA_FS_SECTOR_SIZE) as u32;
        fs_info[i] = NcaFsInfo {
            start_sector: cursor,
            end_sector: cursor + sectors,
            hash_sector_count: 0,
            reserved: 0,
        };
        fs_header_hash[i] = Sha256Hash::compute(&section.fs_header.to_bytes().unwrap());
        cursor += sectors;
    }

    let content_size = (nca_fs_sector_offset(cursor) + spec.tail_space)
        .max(NCA_FULL_HEADER_SIZE as u64);

    // rights-ID archives ship a zeroed key area
    let encrypted_key_area = if spec.rights_id.is_some() {
        NcaKeyArea::default()
    } else {
        let mut encrypted = NcaKeyArea::default();
        for slot in 0..NcaKeyArea::KEY_COUNT {
            let src = spec.key_area_plain.slot(slot);
            if src == [0; 0x10] {
                continue;
            }
            encrypted.set_slot(slot, kaek.encrypt_block(&src).0 .0);
        }
        encrypted
    };

    let mut header = NcaHeader {
        main_signature: NcaSignature(HexData([0; 0x100])),
        acid_signature: NcaSignature(HexData([0; 0x100])),
        magic: spec.version,
        distribution_type: spec.distribution,
        content_type: NcaContentType::Program,
        key_generation_old: 0,
        kaek_index: KeyAreaKeyIndex::Application,
        content_size,
        program_id: 0x0100_0000_0000_4242,
        content_index: 0,
        sdk_addon_version: 0x000c_0000,
        key_generation: 0,
        main_signature_key_generation: 0,
        rights_id: spec.rights_id.unwrap_or(RightsId(HexData([0; 0x10]))),
        fs_info,
        fs_header_hash,
        encrypted_key_area,
    };
    tweak(&mut header);

    let mut image = vec![0u8; content_size as usize];

    // section bodies
    for (i, section) in spec.sections.iter().enumerate() {
        let Some(section) = section else { continue };
        let offset = nca_fs_sector_offset(fs_info[i].start_sector);
        let mut body = section.body.clone();

        if !section.raw {
            let encryption_type = if spec.version == NcaVersion::Nca0 {
                NcaEncryptionType::AesXts
            } else {
                section.fs_header.encryption_type
            };
            match encryption_type {
                NcaEncryptionType::None => {}
                NcaEncryptionType::AesXts => {
                    let sector = (offset - NCA_HEADER_SIZE as u64) / XTS_SECTOR_SIZE as u64;
                    spec.key_area_plain
                        .xts_key()
                        .encrypt(&mut body, sector, XTS_SECTOR_SIZE);
                }
                NcaEncryptionType::AesCtr | NcaEncryptionType::AesCtrEx => {
                    let key = match spec.titlekey_plain {
                        Some(titlekey) => titlekey,
                        None => spec.key_area_plain.ctr_key(),
                    };
                    let ctr = section.fs_header.aes_ctr_upper_iv.partial_ctr(offset);
                    key.apply_ctr(&mut body, &ctr);
                }
                NcaEncryptionType::Auto => panic!("unresolved encryption type"),
            }
        }

        image[offset as usize..offset as usize + body.len()].copy_from_slice(&body);
    }

    // FS headers, placed and numbered per format generation
    for (i, section) in spec.sections.iter().enumerate() {
        let Some(section) = section else { continue };
        let mut fs_bytes = section.fs_header.to_bytes().unwrap();
        let (key, sector, placement) = match spec.version {
            NcaVersion::Nca3 => (
                keys.header_key().unwrap(),
                2 + i as u64,
                NCA_HEADER_SIZE + i * NCA_FS_HEADER_SIZE,
            ),
            NcaVersion::Nca2 => (
                keys.header_key().unwrap(),
                0,
                NCA_HEADER_SIZE + i * NCA_FS_HEADER_SIZE,
            ),
            NcaVersion::Nca0 => (
                spec.key_area_plain.xts_key(),
                fs_info[i].start_sector as u64 - 2,
                nca_fs_sector_offset(fs_info[i].start_sector) as usize,
            ),
        };
        key.encrypt(&mut fs_bytes, sector, XTS_SECTOR_SIZE);
        image[placement..placement + NCA_FS_HEADER_SIZE].copy_from_slice(&fs_bytes);
    }

    // main header
    let mut header_bytes = header.to_bytes().unwrap();
    keys.header_key()
        .unwrap()
        .encrypt(&mut header_bytes, 0, XTS_SECTOR_SIZE);
    image[..NCA_HEADER_SIZE].copy_from_slice(&header_bytes);

    image
}

fn div_ceil(a: usize, b: usize) -> usize {
    Integer::div_ceil(&a, &b)
}

fn base_fs_header(
    fs_type: NcaFsType,
    hash_type: NcaHashType,
    encryption_type: NcaEncryptionType,
    upper_iv: u64,
    hash_data: NcaHashData,
) -> NcaFsHeader {
    NcaFsHeader {
        version: 2,
        fs_type,
        hash_type,
        encryption_type,
        hash_data,
        patch_info: NcaPatchInfo::default(),
        aes_ctr_upper_iv: AesCtrUpperIv(upper_iv),
        sparse_info: NcaSparseInfo::default(),
    }
}

/// Build a PartitionFs section with a three-region HierarchicalSha256 tree:
/// region 0 (master), region 1 (block digests) and region 2 (data).
pub(crate) fn make_sha256_section(
    data: &[u8],
    hash_block_size: usize,
    encryption_type: NcaEncryptionType,
    upper_iv: u64,
) -> SectionSpec {
    let r1_size = div_ceil(data.len(), hash_block_size) * 0x20;
    let r0_size = div_ceil(r1_size, hash_block_size) * 0x20;
    let r0_offset = 0usize;
    let r1_offset = 0x200usize;
    let r2_offset = ((r1_offset + r1_size + 0xfff) / 0x1000) * 0x1000;
    assert!(r0_offset + r0_size <= r1_offset);

    let section_size = ((r2_offset + data.len() + 0x1ff) / 0x200) * 0x200;
    let mut body = vec![0u8; section_size];
    body[r2_offset..r2_offset + data.len()].copy_from_slice(data);

    // hash regions follow the truncation rule: the final sub-block digests
    // only the remaining bytes
    for (k, chunk) in data.chunks(hash_block_size).enumerate() {
        let digest = Sha256Hash::compute(chunk);
        body[r1_offset + k * 0x20..r1_offset + (k + 1) * 0x20].copy_from_slice(&digest.0 .0);
    }
    let r1 = body[r1_offset..r1_offset + r1_size].to_vec();
    for (k, chunk) in r1.chunks(hash_block_size).enumerate() {
        let digest = Sha256Hash::compute(chunk);
        body[r0_offset + k * 0x20..r0_offset + (k + 1) * 0x20].copy_from_slice(&digest.0 .0);
    }
    let master_hash = Sha256Hash::compute(&body[r0_offset..r0_offset + r0_size]);

    let mut hash_region = [HashRegion::default(); NCA_HIERARCHICAL_SHA256_MAX_REGION_COUNT];
    hash_region[0] = HashRegion {
        offset: r0_offset as u64,
        size: r0_size as u64,
    };
    hash_region[1] = HashRegion {
        offset: r1_offset as u64,
        size: r1_size as u64,
    };
    hash_region[2] = HashRegion {
        offset: r2_offset as u64,
        size: data.len() as u64,
    };

    let hash_data = NcaHashData::HierarchicalSha256(HierarchicalSha256Data {
        master_hash,
        hash_block_size: hash_block_size as u32,
        hash_region_count: 3,
        hash_region,
    });

    SectionSpec {
        fs_header: base_fs_header(
            NcaFsType::PartitionFs,
            NcaHashType::HierarchicalSha256,
            encryption_type,
            upper_iv,
            hash_data,
        ),
        body,
        raw: false,
    }
}

/// Digest one IVFC block: short blocks are zero-padded to the full block
/// size before hashing.
fn ivfc_block_digest(chunk: &[u8], block_size: usize) -> Sha256Hash {
    if chunk.len() == block_size {
        Sha256Hash::compute(chunk)
    } else {
        let mut padded = vec![0u8; block_size];
        padded[..chunk.len()].copy_from_slice(chunk);
        Sha256Hash::compute(&padded)
    }
}

/// Build a RomFs section with a six-level HierarchicalIntegrity tree over
/// `data` (IVFC level 6). With `data_first` the data level sits at section
/// offset 0 and the hash levels follow it.
pub(crate) fn make_ivfc_section(
    data: &[u8],
    block_order: u32,
    encryption_type: NcaEncryptionType,
    upper_iv: u64,
    data_first: bool,
) -> SectionSpec {
    let block_size = 1usize << block_order;

    let mut sizes = [0usize; NCA_IVFC_LEVEL_COUNT];
    sizes[NCA_IVFC_LEVEL_COUNT - 1] = data.len();
    for i in (0..NCA_IVFC_LEVEL_COUNT - 1).rev() {
        sizes[i] = div_ceil(sizes[i + 1], block_size) * 0x20;
    }

    let mut offsets = [0u64; NCA_IVFC_LEVEL_COUNT];
    let mut cursor = 0usize;
    if data_first {
        offsets[NCA_IVFC_LEVEL_COUNT - 1] = 0;
        cursor = ((data.len() + 0x1ff) / 0x200) * 0x200;
        for i in 0..NCA_IVFC_LEVEL_COUNT - 1 {
            offsets[i] = cursor as u64;
            cursor += ((sizes[i] + 0x3f) / 0x40) * 0x40;
        }
    } else {
        for i in 0..NCA_IVFC_LEVEL_COUNT - 1 {
            offsets[i] = cursor as u64;
            cursor += ((sizes[i] + 0x3f) / 0x40) * 0x40;
        }
        cursor = ((cursor + 0x1ff) / 0x200) * 0x200;
        offsets[NCA_IVFC_LEVEL_COUNT - 1] = cursor as u64;
        cursor += data.len();
    }

    let section_size = ((cursor + 0x1ff) / 0x200) * 0x200;
    let mut body = vec![0u8; section_size];

    let data_offset = offsets[NCA_IVFC_LEVEL_COUNT - 1] as usize;
    body[data_offset..data_offset + data.len()].copy_from_slice(data);

    // each level holds the padded digests of the level below it
    for i in (0..NCA_IVFC_LEVEL_COUNT - 1).rev() {
        let child = body[offsets[i + 1] as usize..offsets[i + 1] as usize + sizes[i + 1]].to_vec();
        for (k, chunk) in child.chunks(block_size).enumerate() {
            let digest = ivfc_block_digest(chunk, block_size);
            let at = offsets[i] as usize + k * 0x20;
            body[at..at + 0x20].copy_from_slice(&digest.0 .0);
        }
    }

    let master_hash = Sha256Hash::compute(&body[offsets[0] as usize..offsets[0] as usize + sizes[0]]);

    let mut level_info = [IntegrityLevelInfo::default(); NCA_IVFC_LEVEL_COUNT];
    for i in 0..NCA_IVFC_LEVEL_COUNT {
        level_info[i] = IntegrityLevelInfo {
            offset: offsets[i],
            size: sizes[i] as u64,
            block_order,
        };
    }

    let hash_data = NcaHashData::Integrity(IntegrityMetaInfo {
        version: 0x20000,
        master_hash_size: 0x20,
        max_level_count: (NCA_IVFC_LEVEL_COUNT + 1) as u32,
        level_info,
        signature_salt: HexData([0; 0x20]),
        master_hash,
    });

    SectionSpec {
        fs_header: base_fs_header(
            NcaFsType::RomFs,
            NcaHashType::HierarchicalIntegrity,
            encryption_type,
            upper_iv,
            hash_data,
        ),
        body,
        raw: false,
    }
}
