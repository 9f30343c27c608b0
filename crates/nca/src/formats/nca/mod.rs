mod patch;
mod section;
mod structs;
#[cfg(test)]
mod testutil;

use hex_literal::hex;
use snafu::{ResultExt, Snafu};
use std::sync::Arc;

use crate::crypto::keyset::{KeySet, MissingKeyError};
use crate::crypto::{signature, AesKey, CryptoArena, XTS_SECTOR_SIZE};
use crate::formats::ticket::Ticket;
use crate::gamecard::{GameCardHfsPartition, GameCardReader, GameCardStorage};
use crate::ids::ContentId;
use crate::storage::{ReadableStorage, StorageError};

pub use patch::{
    HashDataPatch, HierarchicalIntegrityPatch, HierarchicalSha256Patch, PatchError,
};
pub use section::{EncryptedBlock, NcaFsSection, NcaSectionType, SectionError};
pub use structs::*;

/// Fingerprint of the well-known plaintext key area shipped in NCA0 archives.
const NCA0_KEY_AREA_HASH: [u8; 0x20] = hex!(
    "9abbd211 8600219d 7adc5b43 95f84efd"
    "ff6b25ef 9f968528 189e76b0 92f06acb"
);

#[derive(Snafu, Debug)]
pub enum NcaError {
    /// NCA: Failed to read from the storage
    Storage { source: StorageError },
    /// NCA: Missing a crypto key
    MissingKey { source: MissingKeyError },
    /// NCA: Failed to parse the NCA header
    HeaderParsing { source: binrw::Error },
    /// NCA: Failed to re-serialize a header
    HeaderWriting { source: binrw::Error },
    #[snafu(display("Content size 0x{:x} can't even hold the headers", size))]
    InvalidContentSize { size: u64 },
    #[snafu(display(
        "Invalid size: header claims 0x{:x}, storage has 0x{:x}",
        expected,
        actual
    ))]
    ContentSizeMismatch { expected: u64, actual: u64 },
    /// NCA: Unable to identify any valid FS section
    NoValidSections,
    #[snafu(display("No gamecard hash-FS entry named {}", name))]
    GameCardEntryMissing { name: String },
}

/// Where the archive bytes come from. Gamecard archives are read through the
/// raw gamecard driver; everything else goes through a managed content store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOrigin {
    GameCard,
    Managed,
}

/// The externally-known identity of a content blob.
#[derive(Debug, Clone, Copy)]
pub struct ContentInfo {
    pub content_id: ContentId,
    pub content_type: NcaContentType,
}

impl ContentInfo {
    /// Filename of this content inside a gamecard hash-FS partition.
    pub fn nca_filename(&self) -> String {
        match self.content_type {
            NcaContentType::Meta => format!("{}.cnmt.nca", self.content_id),
            _ => format!("{}.nca", self.content_id),
        }
    }
}

/// A parsed and decrypted NCA: headers, key material and section contexts.
///
/// All mutations stay inside this context; they reach the archive bytes only
/// as patch overlays spliced by the caller.
#[derive(Debug)]
pub struct Nca<S: ReadableStorage> {
    pub(crate) storage: S,
    origin: StorageOrigin,
    pub(crate) arena: Arc<CryptoArena>,
    pub(crate) content_id: ContentId,
    pub(crate) content_size: u64,
    pub(crate) format_version: NcaVersion,
    key_generation: u8,
    encrypted_header: [u8; NCA_HEADER_SIZE],
    pub(crate) header: NcaHeader,
    header_hash: Sha256Hash,
    valid_main_signature: bool,
    rights_id_available: bool,
    titlekey: Option<AesKey>,
    decrypted_key_area: NcaKeyArea,
    header_written: bool,
    pub(crate) sections: [Option<NcaFsSection>; NCA_FS_HEADER_COUNT],
}

impl<S: ReadableStorage> Nca<S> {
    /// Open an archive from a managed content store (or any other storage).
    pub fn new(
        keys: &KeySet,
        arena: Arc<CryptoArena>,
        storage: S,
        content_info: ContentInfo,
        ticket: Option<&Ticket>,
    ) -> Result<Self, NcaError> {
        Self::with_origin(
            keys,
            arena,
            storage,
            StorageOrigin::Managed,
            content_info,
            ticket,
        )
    }

    fn with_origin(
        keys: &KeySet,
        arena: Arc<CryptoArena>,
        storage: S,
        origin: StorageOrigin,
        content_info: ContentInfo,
        ticket: Option<&Ticket>,
    ) -> Result<Self, NcaError> {
        let content_size = storage.get_size();
        if content_size < NCA_FULL_HEADER_SIZE as u64 {
            return Err(NcaError::InvalidContentSize { size: content_size });
        }

        let header_key = keys.header_key().context(MissingKeySnafu)?;

        let mut encrypted_header = [0; NCA_HEADER_SIZE];
        storage
            .read(0, &mut encrypted_header)
            .context(StorageSnafu)?;

        let mut plain_header = encrypted_header;
        header_key.decrypt(&mut plain_header, 0, XTS_SECTOR_SIZE);

        let header = NcaHeader::from_bytes(&plain_header).context(HeaderParsingSnafu)?;
        if header.content_size != content_size {
            return Err(NcaError::ContentSizeMismatch {
                expected: header.content_size,
                actual: content_size,
            });
        }

        let format_version = header.magic;
        let key_generation = header.key_generation();
        let rights_id_available = !header.rights_id.is_empty();
        let header_hash = Sha256Hash::compute(&plain_header);

        let valid_main_signature = match keys
            .main_signature_modulus(header.main_signature_key_generation)
        {
            Some(modulus) => signature::verify_main_signature(
                modulus,
                &plain_header[0x200..0x200 + NCA_SIGNATURE_AREA_SIZE],
                &header.main_signature.0 .0,
            ),
            None => false,
        };

        // The key area stays zeroed for rights-ID archives; the titlekey
        // replaces it wholesale.
        let decrypted_key_area = if rights_id_available {
            NcaKeyArea::default()
        } else {
            decrypt_key_area(keys, &header, format_version, key_generation)?
        };

        let mut titlekey = None;
        if rights_id_available {
            let encrypted_titlekey = ticket
                .filter(|t| t.matches_rights_id(&header.rights_id))
                .map(|t| t.title_key())
                .or_else(|| keys.title_key(&header.rights_id).ok());

            match encrypted_titlekey {
                Some(tk) => match keys.title_kek(key_generation) {
                    Ok(kek) => titlekey = Some(tk.decrypt(kek)),
                    Err(e) => {
                        tracing::warn!("Can't decrypt titlekey for NCA \"{}\": {}", content_info.content_id, e)
                    }
                },
                None => tracing::warn!(
                    "Error retrieving ticket for NCA \"{}\"",
                    content_info.content_id
                ),
            }
        }

        let mut sections: [Option<NcaFsSection>; NCA_FS_HEADER_COUNT] = Default::default();
        for (i, section) in sections.iter_mut().enumerate() {
            let fs_info = header.fs_info[i];
            if !fs_info.is_populated() {
                continue;
            }

            // NCA2/NCA3 place the FS headers right after the main header;
            // NCA0 places each one at its section's start sector.
            let fs_header_offset = match format_version {
                NcaVersion::Nca0 => nca_fs_sector_offset(fs_info.start_sector),
                _ => (NCA_HEADER_SIZE + i * NCA_FS_HEADER_SIZE) as u64,
            };

            let mut encrypted_fs_header = [0; NCA_FS_HEADER_SIZE];
            storage
                .read(fs_header_offset, &mut encrypted_fs_header)
                .context(StorageSnafu)?;

            let mut plain_fs_header = encrypted_fs_header;
            let (xts_key, sector) = match format_version {
                NcaVersion::Nca3 => (header_key, 2 + i as u64),
                NcaVersion::Nca2 => (header_key, 0),
                NcaVersion::Nca0 => (
                    decrypted_key_area.xts_key(),
                    (fs_info.start_sector as u64).wrapping_sub(2),
                ),
            };
            xts_key.decrypt(&mut plain_fs_header, sector, XTS_SECTOR_SIZE);

            if header.fs_header_hash[i].verify(&plain_fs_header).is_err() {
                tracing::warn!("FS header hash mismatch for section {i}, skipping");
                continue;
            }

            let fs_header = match NcaFsHeader::from_bytes(&plain_fs_header) {
                Ok(fs_header) => fs_header,
                Err(e) => {
                    tracing::warn!("Failed to parse FS header for section {i}: {e}, skipping");
                    continue;
                }
            };

            *section = NcaFsSection::build(
                i,
                fs_header,
                encrypted_fs_header,
                &fs_info,
                format_version,
                content_size,
                rights_id_available,
                titlekey,
                &decrypted_key_area,
            );
        }

        if sections.iter().all(Option::is_none) {
            return Err(NcaError::NoValidSections);
        }

        Ok(Self {
            storage,
            origin,
            arena,
            content_id: content_info.content_id,
            content_size,
            format_version,
            key_generation,
            encrypted_header,
            header,
            header_hash,
            valid_main_signature,
            rights_id_available,
            titlekey,
            decrypted_key_area,
            header_written: false,
            sections,
        })
    }
}

impl<G: GameCardReader> Nca<GameCardStorage<G>> {
    /// Open an archive straight from a gamecard hash-FS partition, resolving
    /// `{content_id}.nca` (or `.cnmt.nca` for meta content) to its extent.
    pub fn from_gamecard(
        keys: &KeySet,
        arena: Arc<CryptoArena>,
        reader: G,
        partition: GameCardHfsPartition,
        content_info: ContentInfo,
        ticket: Option<&Ticket>,
    ) -> Result<Self, NcaError> {
        let name = content_info.nca_filename();
        let entry = reader
            .find_entry(partition, &name)
            .ok_or(NcaError::GameCardEntryMissing { name })?;
        Self::with_origin(
            keys,
            arena,
            GameCardStorage::new(reader, entry),
            StorageOrigin::GameCard,
            content_info,
            ticket,
        )
    }
}

impl<S: ReadableStorage> Nca<S> {
    pub fn origin(&self) -> StorageOrigin {
        self.origin
    }

    pub fn content_id(&self) -> ContentId {
        self.content_id
    }

    pub fn content_size(&self) -> u64 {
        self.content_size
    }

    pub fn format_version(&self) -> NcaVersion {
        self.format_version
    }

    pub fn key_generation(&self) -> u8 {
        self.key_generation
    }

    pub fn rights_id_available(&self) -> bool {
        self.rights_id_available
    }

    pub fn titlekey_retrieved(&self) -> bool {
        self.titlekey.is_some()
    }

    pub fn valid_main_signature(&self) -> bool {
        self.valid_main_signature
    }

    pub fn header(&self) -> &NcaHeader {
        &self.header
    }

    pub fn header_hash(&self) -> Sha256Hash {
        self.header_hash
    }

    pub fn decrypted_key_area(&self) -> &NcaKeyArea {
        &self.decrypted_key_area
    }

    pub fn section(&self, index: usize) -> Option<&NcaFsSection> {
        self.sections.get(index).and_then(|s| s.as_ref())
    }

    pub fn section_count(&self) -> usize {
        self.sections.iter().flatten().count()
    }

    /// Human-readable name of a section, following platform conventions.
    pub fn section_display_name(&self, index: usize) -> &'static str {
        let Some(section) = self.section(index) else {
            return "Invalid";
        };
        match section.section_type() {
            NcaSectionType::PartitionFs => {
                if self.header.content_type == NcaContentType::Program && index == 0 {
                    "ExeFS"
                } else {
                    "Partition FS"
                }
            }
            NcaSectionType::RomFs => "RomFS",
            NcaSectionType::PatchRomFs => "Patch RomFS [BKTR]",
            NcaSectionType::Nca0RomFs => "NCA0 RomFS",
        }
    }

    /// Whether the in-memory header deviates from the bytes the archive was
    /// opened with.
    pub fn is_header_dirty(&self) -> bool {
        match self.header.to_bytes() {
            Ok(bytes) => Sha256Hash::compute(&bytes) != self.header_hash,
            Err(_) => true,
        }
    }

    /// Flag the content for download distribution.
    pub fn set_download_distribution(&mut self) {
        self.header.distribution_type = DistributionType::Download;
    }

    /// Repoint the context at the hash of the modified content.
    pub fn update_content_id(&mut self, hash: &Sha256Hash) {
        let mut id = [0; 0x10];
        id.copy_from_slice(&hash.0 .0[..0x10]);
        self.content_id = ContentId(id);
    }

    /// Rewrite the key area so the archive decrypts without its ticket: the
    /// decrypted titlekey moves into the CTR slot, the key area is
    /// re-encrypted under the KAEK and the rights ID is wiped.
    pub fn remove_titlekey_crypto(&mut self, keys: &KeySet) -> Result<(), NcaError> {
        if !self.rights_id_available {
            return Ok(());
        }
        let titlekey = match self.titlekey {
            Some(titlekey) => titlekey,
            None => return Ok(()),
        };

        // AES-128-XTS is not used in FS sections from NCAs with titlekey
        // crypto, and patch RomFS sections share the CTR slot, so one slot
        // covers every section.
        self.decrypted_key_area.set_ctr_key(titlekey);
        self.encrypt_key_area(keys)?;

        self.header.rights_id.clear();
        self.rights_id_available = false;

        // Section cipher contexts were created from the titlekey; re-derive
        // them from the rewritten key area so later reads keep working.
        for section in self.sections.iter_mut().flatten() {
            section.rederive_keys(&self.decrypted_key_area);
        }

        tracing::debug!("Removed titlekey crypto from NCA \"{}\"", self.content_id);

        Ok(())
    }

    /// Re-encrypt the main header and every valid FS header. A no-op while
    /// the header is unchanged.
    pub fn encrypt_header(&mut self, keys: &KeySet) -> Result<(), NcaError> {
        if !self.is_header_dirty() {
            return Ok(());
        }

        let header_key = keys.header_key().context(MissingKeySnafu)?;

        let mut header_bytes = self.header.to_bytes().context(HeaderWritingSnafu)?;
        header_key.encrypt(&mut header_bytes, 0, XTS_SECTOR_SIZE);
        self.encrypted_header = header_bytes;

        for i in 0..NCA_FS_HEADER_COUNT {
            let fs_info = self.header.fs_info[i];
            let section = match self.sections[i].as_mut() {
                Some(section) => section,
                None => continue,
            };

            // The FS-header sector number depends on the format generation,
            // same table as the decrypt pass.
            let (xts_key, sector) = match self.format_version {
                NcaVersion::Nca3 => (header_key, 2 + i as u64),
                NcaVersion::Nca2 => (header_key, 0),
                NcaVersion::Nca0 => (
                    self.decrypted_key_area.xts_key(),
                    (fs_info.start_sector as u64).wrapping_sub(2),
                ),
            };

            let mut fs_bytes = section.header().to_bytes().context(HeaderWritingSnafu)?;
            xts_key.encrypt(&mut fs_bytes, sector, XTS_SECTOR_SIZE);
            section.set_encrypted_header(fs_bytes);
        }

        Ok(())
    }

    /// Splice the encrypted headers into a caller buffer window. Each header
    /// is written at most once across successive windows.
    pub fn write_encrypted_header_to_buffer(&mut self, buf: &mut [u8], buf_offset: u64) {
        if self.header_written
            || buf.is_empty()
            || buf_offset + buf.len() as u64 > self.content_size
        {
            return;
        }

        self.header_written = true;

        if buf_offset < NCA_HEADER_SIZE as u64
            && !patch::write_patch_to_buffer(&self.encrypted_header, 0, buf, buf_offset)
        {
            self.header_written = false;
            return;
        }

        for i in 0..NCA_FS_HEADER_COUNT {
            let format_version = self.format_version;
            let section = match self.sections[i].as_mut() {
                Some(section) => section,
                None => continue,
            };
            if section.header_written() {
                continue;
            }

            let fs_header_offset = match format_version {
                NcaVersion::Nca0 => section.offset(),
                _ => (NCA_HEADER_SIZE + i * NCA_FS_HEADER_SIZE) as u64,
            };
            let written = patch::write_patch_to_buffer(
                section.encrypted_header(),
                fs_header_offset,
                buf,
                buf_offset,
            );
            section.set_header_written(written);
            if !written {
                self.header_written = false;
            }
        }
    }

    fn encrypt_key_area(&mut self, keys: &KeySet) -> Result<(), NcaError> {
        let key_count = key_area_key_count(self.format_version);

        // NCA0 archives may carry their key area in plaintext.
        if is_nca0_key_area_plaintext(self.format_version, &self.header.encrypted_key_area) {
            self.header.encrypted_key_area = self.decrypted_key_area;
            return Ok(());
        }

        let kaek = keys
            .key_area_key(self.header.kaek_index, self.key_generation)
            .context(MissingKeySnafu)?;

        let mut encrypted = NcaKeyArea::default();
        for i in 0..key_count {
            let src = self.decrypted_key_area.slot(i);
            if src == [0; 0x10] {
                continue;
            }
            encrypted.set_slot(i, kaek.encrypt_block(&src).0 .0);
        }
        self.header.encrypted_key_area = encrypted;

        Ok(())
    }
}

fn key_area_key_count(format_version: NcaVersion) -> usize {
    match format_version {
        NcaVersion::Nca0 => NcaKeyArea::NCA0_KEY_COUNT,
        _ => NcaKeyArea::KEY_COUNT,
    }
}

fn is_nca0_key_area_plaintext(format_version: NcaVersion, key_area: &NcaKeyArea) -> bool {
    format_version == NcaVersion::Nca0
        && Sha256Hash::compute(&key_area.0 .0) == Sha256Hash(NCA0_KEY_AREA_HASH.into())
}

fn decrypt_key_area(
    keys: &KeySet,
    header: &NcaHeader,
    format_version: NcaVersion,
    key_generation: u8,
) -> Result<NcaKeyArea, NcaError> {
    if is_nca0_key_area_plaintext(format_version, &header.encrypted_key_area) {
        return Ok(header.encrypted_key_area);
    }

    let kaek = keys
        .key_area_key(header.kaek_index, key_generation)
        .context(MissingKeySnafu)?;

    let mut decrypted = NcaKeyArea::default();
    for i in 0..key_area_key_count(format_version) {
        let src = header.encrypted_key_area.slot(i);
        if src == [0; 0x10] {
            continue;
        }
        decrypted.set_slot(i, kaek.decrypt_block(&src).0 .0);
    }

    Ok(decrypted)
}
