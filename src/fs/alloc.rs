use std::io::{Read, Seek, Write};

use log::debug;

use super::context::VolumeContext;
use super::geometry::{DIR_ENTRY_SIZE, FAT32_MASK};
use crate::error::VolumeError;

/// Clusters appended to a chain by [`VolumeContext::slots_for`], kept so the
/// caller can undo the growth if a later step fails.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Growth {
    /// Chain length before the growth.
    pub old_len: usize,
    /// FAT entry of the old tail before it was linked onward.
    pub old_tail_entry: u32,
    /// Newly linked clusters, in chain order.
    pub clusters: Vec<u32>,
}

impl Growth {
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

/// Whether a directory slot can be reused.
fn slot_is_free(first_byte: u8) -> bool {
    first_byte == 0x00 || first_byte == 0xE5
}

impl<D: Read + Write + Seek> VolumeContext<D> {
    /// Find `count` consecutive free directory slots within `chain`.
    ///
    /// Returns the absolute byte offset of each slot. A run may continue from
    /// the end of one cluster into the start of the next.
    pub fn find_free_slots(
        &mut self,
        chain: &[u32],
        count: usize,
    ) -> Result<Option<Vec<u64>>, VolumeError> {
        if count == 0 {
            return Ok(Some(Vec::new()));
        }
        let mut run: Vec<u64> = Vec::with_capacity(count);
        for &cluster in chain {
            let data = self.read_cluster(cluster)?;
            let base = self.geometry().cluster_offset(cluster);
            for (i, slot) in data.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
                if slot_is_free(slot[0]) {
                    run.push(base + (i * DIR_ENTRY_SIZE) as u64);
                    if run.len() == count {
                        return Ok(Some(run));
                    }
                } else {
                    run.clear();
                }
            }
        }
        Ok(None)
    }

    /// Link enough fresh clusters onto `chain` to hold `needed_entries`
    /// directory records.
    ///
    /// A cluster qualifies only when its FAT entry is 0 and its content is all
    /// zero bytes. Nothing is written unless all clusters are found.
    pub fn reserve_clusters(
        &mut self,
        chain: &mut Vec<u32>,
        needed_entries: usize,
    ) -> Result<Vec<u32>, VolumeError> {
        let per_cluster = self.geometry().entries_per_cluster() as usize;
        if per_cluster == 0 {
            return Err(VolumeError::InvalidGeometry(format!(
                "cluster of {} bytes holds no directory record",
                self.geometry().cluster_size()
            )));
        }
        let needed = needed_entries.max(1).div_ceil(per_cluster);

        let limit = self.geometry().cluster_limit();
        let mut found = Vec::with_capacity(needed);
        for cluster in 2..limit {
            if self.fat_entry(cluster)? & FAT32_MASK != 0 {
                continue;
            }
            if self.read_cluster(cluster)?.iter().any(|&b| b != 0) {
                continue;
            }
            found.push(cluster);
            if found.len() == needed {
                break;
            }
        }
        if found.len() < needed {
            return Err(VolumeError::NoSpace {
                needed: needed as u32,
                available: found.len() as u32,
            });
        }

        // New tail first, then the internal links, then the old tail, so the
        // existing chain never points at an unterminated run.
        let eoc = self.geometry().eoc_sentinel;
        if let Some(&tail) = found.last() {
            self.set_fat_entry(tail, eoc)?;
        }
        for pair in found.windows(2).rev() {
            self.set_fat_entry(pair[0], pair[1])?;
        }
        if let Some(&old_tail) = chain.last() {
            self.set_fat_entry(old_tail, found[0])?;
        }

        chain.extend_from_slice(&found);
        self.adjust_free_clusters(-(found.len() as i64))?;
        debug!("reserved cluster(s) {found:?}");
        Ok(found)
    }

    /// Find `count` consecutive free slots in the directory `chain`, growing
    /// it when no run is long enough.
    pub fn slots_for(
        &mut self,
        chain: &mut Vec<u32>,
        count: usize,
    ) -> Result<(Vec<u64>, Growth), VolumeError> {
        if let Some(slots) = self.find_free_slots(chain, count)? {
            return Ok((slots, Growth::default()));
        }

        let old_len = chain.len();
        let old_tail_entry = match chain.last() {
            Some(&tail) => self.fat_entry(tail)?,
            None => 0,
        };
        let clusters = self.reserve_clusters(chain, count)?;
        let growth = Growth {
            old_len,
            old_tail_entry,
            clusters,
        };
        match self.find_free_slots(chain, count)? {
            Some(slots) => Ok((slots, growth)),
            None => {
                self.release_growth(chain, growth)?;
                Err(VolumeError::NoSpace {
                    needed: 0,
                    available: 0,
                })
            }
        }
    }

    /// Undo a [`Growth`]: restore the old tail's FAT entry, free the added
    /// clusters and restore the free-cluster count.
    pub fn release_growth(
        &mut self,
        chain: &mut Vec<u32>,
        growth: Growth,
    ) -> Result<(), VolumeError> {
        if growth.is_empty() {
            return Ok(());
        }
        if growth.old_len > 0 {
            self.set_fat_entry(chain[growth.old_len - 1], growth.old_tail_entry)?;
        }
        for &cluster in &growth.clusters {
            self.set_fat_entry(cluster, 0)?;
        }
        chain.truncate(growth.old_len);
        self.adjust_free_clusters(growth.clusters.len() as i64)?;
        debug!("released cluster(s) {:?}", growth.clusters);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::format::{format_volume, FormatOptions};
    use std::io::Cursor;

    /// 512-byte clusters, 16 slots each.
    fn make_ctx(total_bytes: u64) -> VolumeContext<Cursor<Vec<u8>>> {
        let mut cursor = Cursor::new(Vec::new());
        let opts = FormatOptions {
            total_bytes,
            sectors_per_cluster: 1,
            ..FormatOptions::default()
        };
        format_volume(&mut cursor, 0, &opts).unwrap();
        VolumeContext::open(cursor, 0).unwrap()
    }

    fn occupy(ctx: &mut VolumeContext<Cursor<Vec<u8>>>, offset: u64) {
        let mut rec = [b' '; DIR_ENTRY_SIZE];
        rec[0] = b'A';
        ctx.write_record(offset, &rec).unwrap();
    }

    #[test]
    fn test_free_slots_in_empty_root() {
        let mut ctx = make_ctx(1024 * 1024);
        let base = ctx.geometry().cluster_offset(2);
        let slots = ctx.find_free_slots(&[2], 3).unwrap().unwrap();
        assert_eq!(slots, vec![base, base + 32, base + 64]);
    }

    #[test]
    fn test_occupied_slot_resets_run() {
        let mut ctx = make_ctx(1024 * 1024);
        let base = ctx.geometry().cluster_offset(2);
        occupy(&mut ctx, base + 32);
        let slots = ctx.find_free_slots(&[2], 2).unwrap().unwrap();
        assert_eq!(slots, vec![base + 64, base + 96]);
    }

    #[test]
    fn test_deleted_slot_counts_as_free() {
        let mut ctx = make_ctx(1024 * 1024);
        let base = ctx.geometry().cluster_offset(2);
        for i in 0..16 {
            occupy(&mut ctx, base + i * 32);
        }
        let mut deleted = [b' '; DIR_ENTRY_SIZE];
        deleted[0] = 0xE5;
        ctx.write_record(base + 5 * 32, &deleted).unwrap();
        assert_eq!(
            ctx.find_free_slots(&[2], 1).unwrap(),
            Some(vec![base + 5 * 32])
        );
        assert_eq!(ctx.find_free_slots(&[2], 2).unwrap(), None);
    }

    #[test]
    fn test_growth_and_run_across_clusters() {
        let mut ctx = make_ctx(1024 * 1024);
        let free_before = ctx.free_clusters();
        let base = ctx.geometry().cluster_offset(2);
        for i in 0..15 {
            occupy(&mut ctx, base + i * 32);
        }

        let mut chain = vec![2];
        let (slots, growth) = ctx.slots_for(&mut chain, 3).unwrap();
        assert_eq!(growth.old_len, 1);
        assert_eq!(growth.clusters.len(), 1);
        assert_eq!(chain.len(), 2);
        let next = chain[1];
        // last slot of cluster 2 followed by the start of the new cluster
        assert_eq!(slots[0], base + 15 * 32);
        assert_eq!(slots[1], ctx.geometry().cluster_offset(next));
        assert_eq!(ctx.free_clusters(), free_before - 1);
        assert_eq!(ctx.chain_of(2).unwrap(), chain);
    }

    #[test]
    fn test_reserve_skips_dirty_clusters() {
        let mut ctx = make_ctx(1024 * 1024);
        let off = ctx.geometry().cluster_offset(3);
        ctx.write_at(off + 100, &[1]).unwrap();
        let mut chain = Vec::new();
        let got = ctx.reserve_clusters(&mut chain, 1).unwrap();
        assert_eq!(got, vec![4]);
        assert_eq!(ctx.chain_of(4).unwrap(), vec![4]);
    }

    #[test]
    fn test_reserve_multiple_links_in_order() {
        let mut ctx = make_ctx(1024 * 1024);
        let mut chain = vec![2];
        let got = ctx.reserve_clusters(&mut chain, 40).unwrap();
        assert_eq!(got, vec![3, 4, 5]);
        assert_eq!(ctx.chain_of(2).unwrap(), vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_no_space_writes_nothing() {
        let mut ctx = make_ctx(64 * 1024);
        let limit = ctx.geometry().cluster_limit();
        let eoc = ctx.geometry().eoc_sentinel;
        for cluster in 3..limit {
            ctx.set_fat_entry(cluster, eoc).unwrap();
        }
        let before = ctx.into_inner().into_inner();
        let mut ctx = VolumeContext::open(Cursor::new(before.clone()), 0).unwrap();

        let mut chain = vec![2];
        let err = ctx.reserve_clusters(&mut chain, 1).unwrap_err();
        assert!(matches!(err, VolumeError::NoSpace { needed: 1, available: 0 }));
        assert_eq!(chain, vec![2]);
        assert_eq!(ctx.into_inner().into_inner(), before);
    }

    #[test]
    fn test_release_growth_restores_image() {
        let mut ctx = make_ctx(1024 * 1024);
        let before = ctx.into_inner().into_inner();
        let mut ctx = VolumeContext::open(Cursor::new(before.clone()), 0).unwrap();

        let mut chain = vec![2];
        let old_tail_entry = ctx.fat_entry(2).unwrap();
        ctx.reserve_clusters(&mut chain, 20).unwrap();
        let growth = Growth {
            old_len: 1,
            old_tail_entry,
            clusters: chain[1..].to_vec(),
        };
        ctx.release_growth(&mut chain, growth).unwrap();
        assert_eq!(chain, vec![2]);
        assert_eq!(ctx.into_inner().into_inner(), before);
    }
}
