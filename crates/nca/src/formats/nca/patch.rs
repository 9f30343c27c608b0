use num_integer::Integer;
use snafu::{ResultExt, Snafu};
use std::sync::Arc;

use crate::formats::nca::section::SectionError;
use crate::formats::nca::structs::{
    NcaHashData, Sha256Hash, NCA_HIERARCHICAL_SHA256_MAX_REGION_COUNT, NCA_IVFC_LEVEL_COUNT,
};
use crate::formats::nca::Nca;
use crate::ids::ContentId;
use crate::storage::ReadableStorage;

const DIGEST_SIZE: usize = 0x20;

#[derive(Snafu, Debug)]
pub enum PatchError {
    #[snafu(display(
        "Patching is not supported for section {} (sparse layer or wrong hash type)",
        index
    ))]
    Unsupported { index: usize },
    #[snafu(display("Section {} has invalid hierarchical layer geometry", index))]
    InvalidLayout { index: usize },
    #[snafu(display(
        "Edit range 0x{:x}+0x{:x} exceeds the data layer (0x{:x})",
        offset,
        size,
        bounds
    ))]
    EditOutOfBounds { offset: u64, size: u64, bounds: u64 },
    #[snafu(display("Failed to read the section being patched: {}", source))]
    Read { source: SectionError },
    #[snafu(display("Failed to re-serialize the FS header: {}", source))]
    HeaderWriting { source: binrw::Error },
    #[snafu(display("Patch was generated for archive {}, not {}", expected, actual))]
    ContentIdMismatch {
        expected: ContentId,
        actual: ContentId,
    },
    #[snafu(display("Patch has already been applied"))]
    AlreadyWritten,
    #[snafu(display("Patch carries an invalid overlay count"))]
    MalformedPatch,
    #[snafu(display(
        "Buffer window 0x{:x}+0x{:x} exceeds the archive (0x{:x})",
        offset,
        size,
        bounds
    ))]
    BufferOutOfBounds { offset: u64, size: u64, bounds: u64 },
}

/// One ciphertext overlay at a hash-tree level, addressed by absolute archive
/// offset. The buffer is owned by the patch and freed with it.
#[derive(Debug)]
pub struct HashDataPatch {
    pub offset: u64,
    pub data: Vec<u8>,
    pub written: bool,
}

/// Overlays rebuilding a HierarchicalSha256 tree after a data-layer edit:
/// one per hash region, innermost last.
#[derive(Debug)]
pub struct HierarchicalSha256Patch {
    pub content_id: ContentId,
    pub written: bool,
    pub hash_region_patch: Vec<HashDataPatch>,
}

/// Overlays rebuilding a HierarchicalIntegrity (IVFC) tree: exactly one per
/// verification level, the data level last.
#[derive(Debug)]
pub struct HierarchicalIntegrityPatch {
    pub content_id: ContentId,
    pub written: bool,
    pub hash_level_patch: [HashDataPatch; NCA_IVFC_LEVEL_COUNT],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashLayerKind {
    Sha256,
    Integrity,
}

#[derive(Debug, Clone, Copy)]
struct HashLayer {
    offset: u64,
    size: u64,
    block_size: u64,
}

#[inline]
fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

#[inline]
fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

impl<S: ReadableStorage> Nca<S> {
    /// Rebuild a HierarchicalSha256 tree around a plaintext edit of the data
    /// layer, producing one ciphertext overlay per hash region and updating
    /// the FS header's master hash.
    pub fn generate_hierarchical_sha256_patch(
        &mut self,
        index: usize,
        data: &[u8],
        data_offset: u64,
    ) -> Result<HierarchicalSha256Patch, PatchError> {
        let overlays = self.generate_hash_data_patch(index, data, data_offset, HashLayerKind::Sha256)?;
        Ok(HierarchicalSha256Patch {
            content_id: self.content_id,
            written: false,
            hash_region_patch: overlays,
        })
    }

    /// Rebuild a HierarchicalIntegrity tree around a plaintext edit of the
    /// data level (IVFC level 6), producing one overlay per level.
    pub fn generate_hierarchical_integrity_patch(
        &mut self,
        index: usize,
        data: &[u8],
        data_offset: u64,
    ) -> Result<HierarchicalIntegrityPatch, PatchError> {
        let overlays =
            self.generate_hash_data_patch(index, data, data_offset, HashLayerKind::Integrity)?;
        let hash_level_patch: [HashDataPatch; NCA_IVFC_LEVEL_COUNT] = overlays
            .try_into()
            .map_err(|_| PatchError::InvalidLayout { index })?;
        Ok(HierarchicalIntegrityPatch {
            content_id: self.content_id,
            written: false,
            hash_level_patch,
        })
    }

    /// Shared recurrence: walk the layers from the data layer to the master
    /// layer, splicing the incoming edit, recomputing the parent digests and
    /// re-encrypting the touched segment of every layer.
    fn generate_hash_data_patch(
        &mut self,
        index: usize,
        data: &[u8],
        data_offset: u64,
        kind: HashLayerKind,
    ) -> Result<Vec<HashDataPatch>, PatchError> {
        let layers = {
            let section = self.section_ctx(index).context(ReadSnafu)?;
            if section.has_sparse_layer() {
                return Err(PatchError::Unsupported { index });
            }
            collect_hash_layers(&section.header().hash_data, kind)
                .ok_or(PatchError::Unsupported { index })?
        };

        let layer_count = layers.len();
        let last_layer_size = layers[layer_count - 1].size;
        if data.is_empty() || data_offset + data.len() as u64 > last_layer_size {
            return Err(PatchError::EditOutOfBounds {
                offset: data_offset,
                size: data.len() as u64,
                bounds: last_layer_size,
            });
        }

        let section_size = self.section_ctx(index).context(ReadSnafu)?.size();

        let arena = Arc::clone(&self.arena);
        let mut scratch = arena.lock();

        let mut cur_data = data.to_vec();
        let mut cur_data_offset = data_offset;
        let mut cur_data_size = data.len() as u64;

        let mut overlays: Vec<Option<HashDataPatch>> = (0..layer_count).map(|_| None).collect();
        let mut new_master_hash = None;

        for i in (1..=layer_count).rev() {
            let layer = layers[i - 1];
            let block_size = layer.block_size;

            if block_size <= 1 || layer.size == 0 || layer.offset + layer.size > section_size {
                return Err(PatchError::InvalidLayout { index });
            }
            if i > 1 {
                let parent = layers[i - 2];
                if parent.size == 0 || parent.offset + parent.size > section_size {
                    return Err(PatchError::InvalidLayout { index });
                }
            }

            // The smallest block-aligned span of this layer covering the
            // dirty range; the master layer is always rebuilt whole.
            let (read_start, read_end_aligned) = if i > 1 {
                (
                    layer.offset + align_down(cur_data_offset, block_size),
                    layer.offset + align_up(cur_data_offset + cur_data_size, block_size),
                )
            } else {
                (layer.offset, layer.offset + layer.size)
            };
            let patch_offset = (cur_data_offset - align_down(cur_data_offset, block_size)) as usize;

            // The buffer keeps the aligned size; the read stops at the
            // layer's tail, leaving zeroes behind it for the IVFC padding
            // rule.
            let alloc_size = (read_end_aligned - read_start) as usize;
            let read_end = read_end_aligned.min(layer.offset + layer.size);
            let read_size = (read_end - read_start) as usize;

            let mut cur_block = vec![0; alloc_size];
            self.read_section_impl(index, &mut cur_block[..read_size], read_start, &mut scratch, None)
                .context(ReadSnafu)?;

            cur_block[patch_offset..patch_offset + cur_data_size as usize]
                .copy_from_slice(&cur_data);

            let mut next_layer_data = None;
            if i > 1 {
                let parent = layers[i - 2];
                let parent_read_start = cur_data_offset / block_size * DIGEST_SIZE as u64;
                let parent_read_size =
                    Integer::div_ceil(&(read_size as u64), &block_size) * DIGEST_SIZE as u64;

                let mut parent_block = vec![0; parent_read_size as usize];
                self.read_section_impl(
                    index,
                    &mut parent_block,
                    parent.offset + parent_read_start,
                    &mut scratch,
                    None,
                )
                .context(ReadSnafu)?;

                // HierarchicalSha256 truncates the final sub-block;
                // HierarchicalIntegrity hashes a full zero-padded block.
                let mut pos = 0;
                let mut digest = 0;
                while pos < read_size {
                    let chunk = match kind {
                        HashLayerKind::Sha256 => (block_size as usize).min(read_size - pos),
                        HashLayerKind::Integrity => block_size as usize,
                    };
                    let hash = Sha256Hash::compute(&cur_block[pos..pos + chunk]);
                    parent_block[digest * DIGEST_SIZE..(digest + 1) * DIGEST_SIZE]
                        .copy_from_slice(&hash.0 .0);
                    pos += block_size as usize;
                    digest += 1;
                }

                next_layer_data = Some((parent_block, parent_read_start, parent_read_size));
            } else {
                new_master_hash = Some(Sha256Hash::compute(&cur_block[..read_size]));
            }

            // Only the segment the edit touched is re-encrypted and emitted
            // as this layer's overlay.
            let block = self
                .generate_encrypted_block_impl(
                    index,
                    &cur_block[patch_offset..patch_offset + cur_data_size as usize],
                    layer.offset + cur_data_offset,
                    &mut scratch,
                )
                .context(ReadSnafu)?;

            overlays[i - 1] = Some(HashDataPatch {
                offset: block.offset,
                data: block.data,
                written: false,
            });

            if let Some((parent_block, parent_read_start, parent_read_size)) = next_layer_data {
                cur_data = parent_block;
                cur_data_offset = parent_read_start;
                cur_data_size = parent_read_size;
            }
        }

        drop(scratch);

        let master_hash = new_master_hash.ok_or(PatchError::InvalidLayout { index })?;
        let section = match self.sections[index].as_mut() {
            Some(section) => section,
            None => return Err(PatchError::InvalidLayout { index }),
        };
        match &mut section.header_mut().hash_data {
            NcaHashData::HierarchicalSha256(data) => data.master_hash = master_hash,
            NcaHashData::Integrity(meta) => meta.master_hash = master_hash,
            NcaHashData::None => return Err(PatchError::Unsupported { index }),
        }

        let fs_header_bytes = section.header().to_bytes().context(HeaderWritingSnafu)?;
        self.header.fs_header_hash[index] = Sha256Hash::compute(&fs_header_bytes);

        overlays
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or(PatchError::InvalidLayout { index })
    }
}

fn collect_hash_layers(hash_data: &NcaHashData, kind: HashLayerKind) -> Option<Vec<HashLayer>> {
    match (hash_data, kind) {
        (NcaHashData::HierarchicalSha256(data), HashLayerKind::Sha256) => {
            let count = data.hash_region_count as usize;
            if data.hash_block_size == 0
                || count == 0
                || count > NCA_HIERARCHICAL_SHA256_MAX_REGION_COUNT
            {
                return None;
            }
            Some(
                data.hash_region[..count]
                    .iter()
                    .map(|region| HashLayer {
                        offset: region.offset,
                        size: region.size,
                        block_size: data.hash_block_size as u64,
                    })
                    .collect(),
            )
        }
        (NcaHashData::Integrity(meta), HashLayerKind::Integrity) => {
            let layer_count = meta.max_level_count.checked_sub(1)? as usize;
            if layer_count != NCA_IVFC_LEVEL_COUNT {
                return None;
            }
            Some(
                meta.level_info
                    .iter()
                    .map(|level| HashLayer {
                        offset: level.offset,
                        size: level.size,
                        block_size: level.block_size(),
                    })
                    .collect(),
            )
        }
        _ => None,
    }
}

/// Splice `patch` into the part of `buf` it intersects. Returns whether the
/// write reached the end of the patch data.
pub(crate) fn write_patch_to_buffer(
    patch: &[u8],
    patch_offset: u64,
    buf: &mut [u8],
    buf_offset: u64,
) -> bool {
    let patch_size = patch.len() as u64;
    let buf_size = buf.len() as u64;

    if patch.is_empty()
        || buf.is_empty()
        || buf_offset + buf_size <= patch_offset
        || patch_offset + patch_size <= buf_offset
    {
        return false;
    }

    let patch_block_offset = patch_offset.max(buf_offset) - patch_offset;
    let patch_remaining_size = patch_size - patch_block_offset;

    let buf_block_offset = buf_offset.max(patch_offset) - buf_offset;
    let buf_remaining_size = buf_size - buf_block_offset;

    let block_size = buf_remaining_size.min(patch_remaining_size) as usize;

    buf[buf_block_offset as usize..buf_block_offset as usize + block_size].copy_from_slice(
        &patch[patch_block_offset as usize..patch_block_offset as usize + block_size],
    );

    patch_block_offset + block_size as u64 == patch_size
}

impl<S: ReadableStorage> Nca<S> {
    /// Apply a HierarchicalSha256 patch to the window of the raw archive the
    /// caller holds in `buf`. Overlays that don't fit the window stay
    /// pending; call again with the next window.
    pub fn write_hierarchical_sha256_patch_to_buffer(
        &self,
        patch: &mut HierarchicalSha256Patch,
        buf: &mut [u8],
        buf_offset: u64,
    ) -> Result<(), PatchError> {
        let region_count = patch.hash_region_patch.len();
        if region_count == 0 || region_count > NCA_HIERARCHICAL_SHA256_MAX_REGION_COUNT {
            return Err(PatchError::MalformedPatch);
        }
        self.check_patch_window(patch.content_id, patch.written, buf, buf_offset)?;

        patch.written = true;
        for overlay in &mut patch.hash_region_patch {
            if overlay.written {
                continue;
            }
            overlay.written = write_patch_to_buffer(&overlay.data, overlay.offset, buf, buf_offset);
            if !overlay.written {
                patch.written = false;
            }
        }
        Ok(())
    }

    /// Apply a HierarchicalIntegrity patch; same windowing contract as the
    /// Sha256 variant.
    pub fn write_hierarchical_integrity_patch_to_buffer(
        &self,
        patch: &mut HierarchicalIntegrityPatch,
        buf: &mut [u8],
        buf_offset: u64,
    ) -> Result<(), PatchError> {
        self.check_patch_window(patch.content_id, patch.written, buf, buf_offset)?;

        patch.written = true;
        for overlay in &mut patch.hash_level_patch {
            if overlay.written {
                continue;
            }
            overlay.written = write_patch_to_buffer(&overlay.data, overlay.offset, buf, buf_offset);
            if !overlay.written {
                patch.written = false;
            }
        }
        Ok(())
    }

    /// The content-ID brand is the only guard against applying a patch to
    /// the wrong archive; refuse on mismatch and on double application.
    fn check_patch_window(
        &self,
        content_id: ContentId,
        written: bool,
        buf: &[u8],
        buf_offset: u64,
    ) -> Result<(), PatchError> {
        if written {
            return Err(PatchError::AlreadyWritten);
        }
        if content_id != self.content_id {
            return Err(PatchError::ContentIdMismatch {
                expected: content_id,
                actual: self.content_id,
            });
        }
        if buf.is_empty() || buf_offset + buf.len() as u64 > self.content_size {
            return Err(PatchError::BufferOutOfBounds {
                offset: buf_offset,
                size: buf.len() as u64,
                bounds: self.content_size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_splice_windows() {
        let patch = [1u8, 2, 3, 4, 5, 6, 7, 8];

        // fully inside the window
        let mut buf = [0u8; 0x10];
        assert!(write_patch_to_buffer(&patch, 4, &mut buf, 0));
        assert_eq!(&buf[4..12], &patch);

        // split across two windows
        let mut first = [0u8; 6];
        let mut second = [0u8; 6];
        assert!(!write_patch_to_buffer(&patch, 4, &mut first, 0));
        assert_eq!(&first[4..], &patch[..2]);
        assert!(write_patch_to_buffer(&patch, 4, &mut second, 6));
        assert_eq!(&second[..6], &patch[2..]);

        // no intersection
        let mut far = [0u8; 4];
        assert!(!write_patch_to_buffer(&patch, 0x100, &mut far, 0));
        assert_eq!(far, [0; 4]);
    }
}
