use snafu::{ResultExt, Snafu};
use std::sync::Arc;

use crate::crypto::{AesCtrUpperIv, AesKey, AesXtsKey, AES_BLOCK_SIZE, XTS_SECTOR_SIZE};
use crate::formats::nca::structs::{
    nca_fs_sector_offset, NcaEncryptionType, NcaFsHeader, NcaFsInfo, NcaFsType, NcaHashType,
    NcaKeyArea, NcaVersion, NCA_BKTR_MAGIC, NCA_BKTR_VERSION, NCA_FS_HEADER_SIZE, NCA_HEADER_SIZE,
};
use crate::formats::nca::Nca;
use crate::storage::{ReadableStorage, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaSectionType {
    PartitionFs,
    RomFs,
    PatchRomFs,
    Nca0RomFs,
}

#[derive(Snafu, Debug)]
pub enum SectionError {
    #[snafu(display("Section {} is absent or failed validation", index))]
    SectionDisabled { index: usize },
    #[snafu(display(
        "Range 0x{:x}+0x{:x} exceeds the bounds (0x{:x})",
        offset,
        size,
        bounds
    ))]
    OutOfBounds { offset: u64, size: u64, bounds: u64 },
    #[snafu(display("Section {} needs a titlekey that was not retrieved", index))]
    MissingSectionKeys { index: usize },
    #[snafu(display("Underlying storage read failed: {}", source))]
    Storage { source: StorageError },
    #[snafu(display("Section {} is not a CTR-EX patch RomFS", index))]
    NotPatchRomFs { index: usize },
    #[snafu(display("Section {} has no sparse layer", index))]
    NoSparseLayer { index: usize },
    #[snafu(display("Operation not supported for section {}'s layout", index))]
    Unsupported { index: usize },
}

/// Per-call cipher keys resolved at init from the key area or the titlekey.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SectionKeys {
    Xts(AesXtsKey),
    Ctr(AesKey),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SparseLayer {
    pub table_offset: u64,
    pub table_size: u64,
    pub upper_iv: AesCtrUpperIv,
}

/// One valid FS section of an archive. Sections live inside their [`Nca`];
/// all I/O goes through archive methods taking the section index.
#[derive(Debug)]
pub struct NcaFsSection {
    index: usize,
    header: NcaFsHeader,
    encrypted_header: [u8; NCA_FS_HEADER_SIZE],
    section_type: NcaSectionType,
    encryption_type: NcaEncryptionType,
    offset: u64,
    size: u64,
    ctr_upper_iv: AesCtrUpperIv,
    sparse: Option<SparseLayer>,
    keys: Option<SectionKeys>,
    header_written: bool,
}

impl NcaFsSection {
    /// Validate one populated FS entry and build its context. Returns `None`
    /// to skip the section (init carries on with the rest).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn build(
        index: usize,
        header: NcaFsHeader,
        encrypted_header: [u8; NCA_FS_HEADER_SIZE],
        fs_info: &NcaFsInfo,
        format_version: NcaVersion,
        content_size: u64,
        rights_id_available: bool,
        titlekey: Option<AesKey>,
        key_area: &NcaKeyArea,
    ) -> Option<NcaFsSection> {
        let offset = nca_fs_sector_offset(fs_info.start_sector);
        let size = nca_fs_sector_offset(fs_info.end_sector).saturating_sub(offset);
        if offset < NCA_HEADER_SIZE as u64 || size == 0 {
            tracing::warn!("Section {index} has an invalid extent, skipping");
            return None;
        }

        // NCA0 sections are always XTS; Auto resolves by section index.
        let mut encryption_type = if format_version == NcaVersion::Nca0 {
            NcaEncryptionType::AesXts
        } else {
            header.encryption_type
        };
        if encryption_type == NcaEncryptionType::Auto {
            encryption_type = match index {
                0 | 1 => NcaEncryptionType::AesCtr,
                2 => NcaEncryptionType::None,
                _ => NcaEncryptionType::Auto,
            };
        }
        if encryption_type == NcaEncryptionType::Auto {
            tracing::warn!("Section {index} has an unresolvable encryption type, skipping");
            return None;
        }

        let section_type = match (header.fs_type, header.hash_type) {
            (NcaFsType::PartitionFs, NcaHashType::HierarchicalSha256) => {
                NcaSectionType::PartitionFs
            }
            (NcaFsType::RomFs, NcaHashType::HierarchicalIntegrity) => {
                if encryption_type == NcaEncryptionType::AesCtrEx {
                    NcaSectionType::PatchRomFs
                } else {
                    NcaSectionType::RomFs
                }
            }
            (NcaFsType::RomFs, NcaHashType::HierarchicalSha256)
                if format_version == NcaVersion::Nca0 =>
            {
                NcaSectionType::Nca0RomFs
            }
            _ => {
                tracing::warn!("Section {index} has an invalid FS/hash type combo, skipping");
                return None;
            }
        };

        let sparse = if header.sparse_info.exists() {
            let sparse_info = &header.sparse_info;
            let bucket = &sparse_info.bucket;
            let raw_storage_offset = sparse_info.physical_offset;
            let raw_storage_size = bucket.offset + bucket.size;

            if &bucket.header.magic.0 != NCA_BKTR_MAGIC
                || bucket.header.version != NCA_BKTR_VERSION
                || raw_storage_offset < NCA_HEADER_SIZE as u64
                || raw_storage_size == 0
                || raw_storage_offset + raw_storage_size > content_size
                || bucket.header.entry_count == 0
            {
                tracing::warn!("Section {index} has an invalid sparse bucket, skipping");
                return None;
            }

            Some(SparseLayer {
                table_offset: sparse_info.physical_offset + bucket.offset,
                table_size: bucket.size,
                upper_iv: header
                    .aes_ctr_upper_iv
                    .with_sparse_generation(sparse_info.generation),
            })
        } else {
            if offset + size > content_size {
                tracing::warn!("Section {index} exceeds the archive, skipping");
                return None;
            }
            None
        };

        let keys = derive_section_keys(encryption_type, rights_id_available, titlekey, key_area);

        Some(NcaFsSection {
            index,
            header,
            encrypted_header,
            section_type,
            encryption_type,
            offset,
            size,
            ctr_upper_iv: header.aes_ctr_upper_iv,
            sparse,
            keys,
            header_written: false,
        })
    }

    /// Pick up the post-titlekey-removal key area.
    pub(crate) fn rederive_keys(&mut self, key_area: &NcaKeyArea) {
        self.keys = derive_section_keys(self.encryption_type, false, None, key_area);
    }

    pub fn section_type(&self) -> NcaSectionType {
        self.section_type
    }

    pub fn encryption_type(&self) -> NcaEncryptionType {
        self.encryption_type
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn has_sparse_layer(&self) -> bool {
        self.sparse.is_some()
    }

    pub fn sparse_table_size(&self) -> Option<u64> {
        self.sparse.as_ref().map(|s| s.table_size)
    }

    pub fn header(&self) -> &NcaFsHeader {
        &self.header
    }

    pub(crate) fn header_mut(&mut self) -> &mut NcaFsHeader {
        &mut self.header
    }

    pub(crate) fn sparse(&self) -> Option<&SparseLayer> {
        self.sparse.as_ref()
    }

    pub(crate) fn encrypted_header(&self) -> &[u8; NCA_FS_HEADER_SIZE] {
        &self.encrypted_header
    }

    pub(crate) fn set_encrypted_header(&mut self, data: [u8; NCA_FS_HEADER_SIZE]) {
        self.encrypted_header = data;
    }

    pub(crate) fn header_written(&self) -> bool {
        self.header_written
    }

    pub(crate) fn set_header_written(&mut self, written: bool) {
        self.header_written = written;
    }
}

fn derive_section_keys(
    encryption_type: NcaEncryptionType,
    rights_id_available: bool,
    titlekey: Option<AesKey>,
    key_area: &NcaKeyArea,
) -> Option<SectionKeys> {
    match encryption_type {
        NcaEncryptionType::Auto | NcaEncryptionType::None => None,
        NcaEncryptionType::AesXts if rights_id_available => {
            // titlekey crypto never pairs with XTS sections
            None
        }
        _ if rights_id_available => titlekey.map(SectionKeys::Ctr),
        NcaEncryptionType::AesXts => Some(SectionKeys::Xts(key_area.xts_key())),
        NcaEncryptionType::AesCtr | NcaEncryptionType::AesCtrEx => {
            // Patch RomFS sections also use the CTR key from the decrypted
            // key area; the dedicated aes_ctr_ex slot is never selected.
            // (An alternative using key_area.ctr_ex_key() for CTR-EX exists
            // upstream only as dead code.)
            Some(SectionKeys::Ctr(key_area.ctr_key()))
        }
    }
}

#[inline]
fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

#[inline]
fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CipherDir {
    Decrypt,
    Encrypt,
}

/// A freshly encrypted, cipher-sector-aligned block and its absolute archive
/// offset.
#[derive(Debug)]
pub struct EncryptedBlock {
    pub data: Vec<u8>,
    pub offset: u64,
}

impl<S: ReadableStorage> Nca<S> {
    /// Read `buf.len()` plaintext bytes starting `offset` bytes into the
    /// section, transparently removing the section cipher.
    pub fn read_section(
        &self,
        index: usize,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<(), SectionError> {
        let arena = Arc::clone(&self.arena);
        let mut scratch = arena.lock();
        self.read_section_impl(index, buf, offset, &mut scratch, None)
    }

    /// Read from a BKTR patch RomFS using an explicit generation value for
    /// the counter's top word.
    pub fn read_ctr_ex_section(
        &self,
        index: usize,
        buf: &mut [u8],
        offset: u64,
        ctr_val: u32,
    ) -> Result<(), SectionError> {
        let section = self.section_ctx(index)?;
        if section.section_type != NcaSectionType::PatchRomFs
            || section.encryption_type != NcaEncryptionType::AesCtrEx
        {
            return Err(SectionError::NotPatchRomFs { index });
        }

        let arena = Arc::clone(&self.arena);
        let mut scratch = arena.lock();
        self.read_section_impl(index, buf, offset, &mut scratch, Some(ctr_val))
    }

    /// Decrypt a range of the sparse-layer bucket table. The table uses its
    /// own counter whose generation word is `sparse.generation << 16`.
    pub fn read_sparse_table(
        &self,
        index: usize,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<(), SectionError> {
        let section = self.section_ctx(index)?;
        let sparse = *section
            .sparse()
            .ok_or(SectionError::NoSparseLayer { index })?;

        if buf.is_empty() {
            return Ok(());
        }
        if offset + buf.len() as u64 > sparse.table_size {
            return Err(SectionError::OutOfBounds {
                offset,
                size: buf.len() as u64,
                bounds: sparse.table_size,
            });
        }

        let arena = Arc::clone(&self.arena);
        let mut scratch = arena.lock();
        self.crypt_region(
            section,
            buf,
            sparse.table_offset + offset,
            sparse.upper_iv,
            None,
            CipherDir::Decrypt,
            &mut scratch,
        )
    }

    /// Produce the ciphertext of `data` as it would appear at `data_offset`
    /// bytes into the section, extended to cipher-sector alignment.
    pub fn generate_encrypted_section_block(
        &self,
        index: usize,
        data: &[u8],
        data_offset: u64,
    ) -> Result<EncryptedBlock, SectionError> {
        let arena = Arc::clone(&self.arena);
        let mut scratch = arena.lock();
        self.generate_encrypted_block_impl(index, data, data_offset, &mut scratch)
    }

    pub(crate) fn section_ctx(&self, index: usize) -> Result<&NcaFsSection, SectionError> {
        self.sections
            .get(index)
            .and_then(|s| s.as_ref())
            .ok_or(SectionError::SectionDisabled { index })
    }

    pub(crate) fn read_section_impl(
        &self,
        index: usize,
        buf: &mut [u8],
        offset: u64,
        scratch: &mut [u8],
        ctr_val: Option<u32>,
    ) -> Result<(), SectionError> {
        if buf.is_empty() {
            return Ok(());
        }

        let section = self.section_ctx(index)?;
        if offset + buf.len() as u64 > section.size {
            return Err(SectionError::OutOfBounds {
                offset,
                size: buf.len() as u64,
                bounds: section.size,
            });
        }

        let content_offset = section.offset + offset;
        if content_offset + buf.len() as u64 > self.content_size {
            return Err(SectionError::OutOfBounds {
                offset: content_offset,
                size: buf.len() as u64,
                bounds: self.content_size,
            });
        }

        if section.encryption_type == NcaEncryptionType::None {
            return self.storage.read(content_offset, buf).context(StorageSnafu);
        }

        self.crypt_region(
            section,
            buf,
            content_offset,
            section.ctr_upper_iv,
            ctr_val,
            CipherDir::Decrypt,
            scratch,
        )
    }

    /// Fast/slow path dispatch shared by the section, CTR-EX and sparse-table
    /// readers: aligned ranges are processed in place, everything else is
    /// staged through the scratch buffer in cipher-sector-aligned chunks.
    fn crypt_region(
        &self,
        section: &NcaFsSection,
        buf: &mut [u8],
        content_offset: u64,
        upper_iv: AesCtrUpperIv,
        ctr_val: Option<u32>,
        dir: CipherDir,
        scratch: &mut [u8],
    ) -> Result<(), SectionError> {
        let align = cipher_alignment(section.encryption_type);

        if content_offset % align == 0 && buf.len() as u64 % align == 0 {
            self.storage.read(content_offset, buf).context(StorageSnafu)?;
            return self.apply_section_cipher(section, buf, content_offset, upper_iv, ctr_val, dir);
        }

        let mut produced = 0;
        while produced < buf.len() {
            let remaining = (buf.len() - produced) as u64;
            let cur_offset = content_offset + produced as u64;

            let block_start = align_down(cur_offset, align);
            let block_end = align_up(cur_offset + remaining, align);
            let block_size = block_end - block_start;

            let data_start = (cur_offset - block_start) as usize;
            let chunk_size = block_size.min(scratch.len() as u64) as usize;
            let out_chunk_size = if block_size > scratch.len() as u64 {
                chunk_size - data_start
            } else {
                remaining as usize
            };

            let stage = &mut scratch[..chunk_size];
            self.storage.read(block_start, stage).context(StorageSnafu)?;
            self.apply_section_cipher(section, stage, block_start, upper_iv, ctr_val, dir)?;

            buf[produced..produced + out_chunk_size]
                .copy_from_slice(&stage[data_start..data_start + out_chunk_size]);
            produced += out_chunk_size;
        }

        Ok(())
    }

    fn apply_section_cipher(
        &self,
        section: &NcaFsSection,
        buf: &mut [u8],
        content_offset: u64,
        upper_iv: AesCtrUpperIv,
        ctr_val: Option<u32>,
        dir: CipherDir,
    ) -> Result<(), SectionError> {
        let keys = section.keys.as_ref().ok_or(SectionError::MissingSectionKeys {
            index: section.index,
        })?;

        match keys {
            SectionKeys::Xts(key) => {
                let sector = self.xts_sector_number(section, content_offset);
                match dir {
                    CipherDir::Decrypt => key.decrypt(buf, sector, XTS_SECTOR_SIZE),
                    CipherDir::Encrypt => key.encrypt(buf, sector, XTS_SECTOR_SIZE),
                }
            }
            SectionKeys::Ctr(key) => {
                // every call re-assembles the counter, so reads stay truly
                // random-access
                let ctr = match ctr_val {
                    Some(ctr_val) => upper_iv.partial_ctr_ex(ctr_val, content_offset),
                    None => upper_iv.partial_ctr(content_offset),
                };
                key.apply_ctr(buf, &ctr);
            }
        }

        Ok(())
    }

    /// NCA0 numbers XTS sectors from the end of the main header; later
    /// generations restart at zero per section.
    fn xts_sector_number(&self, section: &NcaFsSection, content_offset: u64) -> u64 {
        let base = match self.format_version {
            NcaVersion::Nca0 => NCA_HEADER_SIZE as u64,
            _ => section.offset,
        };
        (content_offset - base) / XTS_SECTOR_SIZE as u64
    }

    pub(crate) fn generate_encrypted_block_impl(
        &self,
        index: usize,
        data: &[u8],
        data_offset: u64,
        scratch: &mut [u8],
    ) -> Result<EncryptedBlock, SectionError> {
        let section = self.section_ctx(index)?;

        // CTR-EX bodies can't be re-authored through this path, and neither
        // can sparse sections.
        if section.sparse.is_some()
            || section.encryption_type == NcaEncryptionType::AesCtrEx
        {
            return Err(SectionError::Unsupported { index });
        }

        if data.is_empty() || data_offset + data.len() as u64 > section.size {
            return Err(SectionError::OutOfBounds {
                offset: data_offset,
                size: data.len() as u64,
                bounds: section.size,
            });
        }

        let content_offset = section.offset + data_offset;
        if content_offset + data.len() as u64 > self.content_size {
            return Err(SectionError::OutOfBounds {
                offset: content_offset,
                size: data.len() as u64,
                bounds: self.content_size,
            });
        }

        if section.encryption_type == NcaEncryptionType::None {
            return Ok(EncryptedBlock {
                data: data.to_vec(),
                offset: content_offset,
            });
        }

        let align = cipher_alignment(section.encryption_type);

        if content_offset % align == 0 && data.len() as u64 % align == 0 {
            let mut out = data.to_vec();
            self.apply_section_cipher(
                section,
                &mut out,
                content_offset,
                section.ctr_upper_iv,
                None,
                CipherDir::Encrypt,
            )?;
            return Ok(EncryptedBlock {
                data: out,
                offset: content_offset,
            });
        }

        let block_start = align_down(data_offset, align);
        let block_end = align_up(data_offset + data.len() as u64, align);
        let block_size = (block_end - block_start) as usize;
        let plain_chunk_offset = (data_offset - block_start) as usize;

        // read the enclosing block as plaintext, splice, re-encrypt
        let mut out = vec![0; block_size];
        self.read_section_impl(index, &mut out, block_start, scratch, None)?;
        out[plain_chunk_offset..plain_chunk_offset + data.len()].copy_from_slice(data);

        let block_content_offset = section.offset + block_start;
        self.apply_section_cipher(
            section,
            &mut out,
            block_content_offset,
            section.ctr_upper_iv,
            None,
            CipherDir::Encrypt,
        )?;

        Ok(EncryptedBlock {
            data: out,
            offset: block_content_offset,
        })
    }
}

fn cipher_alignment(encryption_type: NcaEncryptionType) -> u64 {
    match encryption_type {
        NcaEncryptionType::AesXts => XTS_SECTOR_SIZE as u64,
        _ => AES_BLOCK_SIZE as u64,
    }
}
