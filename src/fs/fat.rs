use std::io::{Read, Seek, Write};

use log::debug;

use super::context::VolumeContext;
use super::geometry::{is_end_of_chain, FAT32_BAD, FAT32_MASK};
use crate::error::VolumeError;

impl<D: Read + Write + Seek> VolumeContext<D> {
    /// Follow the FAT from `first` and collect every cluster of the chain.
    ///
    /// The end-of-chain value is not part of the result. A chain longer than
    /// the number of addressable clusters must loop back on itself.
    pub fn chain_of(&mut self, first: u32) -> Result<Vec<u32>, VolumeError> {
        let mut chain = Vec::new();
        if first == 0 {
            return Ok(chain);
        }

        let limit = self.geometry().cluster_limit();
        let max_len = limit.saturating_sub(2) as usize;
        let mut cluster = first;
        loop {
            if cluster < 2 || cluster >= limit {
                return Err(VolumeError::Corruption(format!(
                    "chain starting at cluster {first} links to out-of-range cluster {cluster}"
                )));
            }
            if chain.len() >= max_len {
                return Err(VolumeError::Corruption(format!(
                    "chain starting at cluster {first} is cyclic"
                )));
            }
            chain.push(cluster);

            let next = self.fat_entry(cluster)? & FAT32_MASK;
            if is_end_of_chain(next) {
                break;
            }
            match next {
                0 => {
                    return Err(VolumeError::Corruption(format!(
                        "chain starting at cluster {first} runs into free cluster {cluster}"
                    )))
                }
                FAT32_BAD => {
                    return Err(VolumeError::Corruption(format!(
                        "chain starting at cluster {first} links to bad cluster after {cluster}"
                    )))
                }
                _ => cluster = next,
            }
        }

        debug!("chain from cluster {first}: {} cluster(s)", chain.len());
        Ok(chain)
    }

    /// Concatenate the contents of every cluster in `chain`.
    pub(crate) fn read_chain_data(&mut self, chain: &[u32]) -> Result<Vec<u8>, VolumeError> {
        let cluster_size = self.geometry().cluster_size() as usize;
        let mut data = Vec::with_capacity(chain.len() * cluster_size);
        for &cluster in chain {
            data.extend_from_slice(&self.read_cluster(cluster)?);
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::format::{format_volume, FormatOptions};
    use std::io::Cursor;

    fn make_ctx() -> VolumeContext<Cursor<Vec<u8>>> {
        let mut cursor = Cursor::new(Vec::new());
        let opts = FormatOptions {
            total_bytes: 1024 * 1024,
            sectors_per_cluster: 1,
            ..FormatOptions::default()
        };
        format_volume(&mut cursor, 0, &opts).unwrap();
        VolumeContext::open(cursor, 0).unwrap()
    }

    #[test]
    fn test_zero_first_cluster_is_empty_chain() {
        let mut ctx = make_ctx();
        assert!(ctx.chain_of(0).unwrap().is_empty());
    }

    #[test]
    fn test_root_chain_is_single_cluster() {
        let mut ctx = make_ctx();
        assert_eq!(ctx.chain_of(2).unwrap(), vec![2]);
    }

    #[test]
    fn test_chain_reproduces_fat_links() {
        let mut ctx = make_ctx();
        let eoc = ctx.geometry().eoc_sentinel;
        ctx.set_fat_entry(5, 9).unwrap();
        ctx.set_fat_entry(9, 7).unwrap();
        ctx.set_fat_entry(7, eoc).unwrap();
        assert_eq!(ctx.chain_of(5).unwrap(), vec![5, 9, 7]);

        // append then rewalk
        ctx.set_fat_entry(12, eoc).unwrap();
        ctx.set_fat_entry(7, 12).unwrap();
        assert_eq!(ctx.chain_of(5).unwrap(), vec![5, 9, 7, 12]);
    }

    #[test]
    fn test_fat_copies_stay_mirrored() {
        let mut ctx = make_ctx();
        ctx.set_fat_entry(4, 0x0FFF_FFF8).unwrap();
        let geo = ctx.geometry().clone();
        let img = ctx.into_inner().into_inner();
        for copy in 0..geo.num_fats {
            let off = geo.fat_entry_offset(copy, 4) as usize;
            assert_eq!(
                u32::from_le_bytes(img[off..off + 4].try_into().unwrap()),
                0x0FFF_FFF8
            );
        }
    }

    #[test]
    fn test_reserved_top_bits_preserved() {
        let mut ctx = make_ctx();
        let off = ctx.geometry().fat_entry_offset(0, 6);
        ctx.write_at(off, &0xA000_0000u32.to_le_bytes()).unwrap();
        ctx.set_fat_entry(6, 0x0FFF_FFFF).unwrap();
        assert_eq!(ctx.fat_entry(6).unwrap(), 0xAFFF_FFFF);
    }

    #[test]
    fn test_cyclic_chain_is_corruption() {
        let mut ctx = make_ctx();
        ctx.set_fat_entry(3, 4).unwrap();
        ctx.set_fat_entry(4, 3).unwrap();
        assert!(matches!(ctx.chain_of(3), Err(VolumeError::Corruption(_))));
    }

    #[test]
    fn test_free_link_is_corruption() {
        let mut ctx = make_ctx();
        ctx.set_fat_entry(3, 4).unwrap();
        assert!(matches!(ctx.chain_of(3), Err(VolumeError::Corruption(_))));
    }

    #[test]
    fn test_out_of_range_link_is_corruption() {
        let mut ctx = make_ctx();
        ctx.set_fat_entry(3, 0x00FF_FFFF).unwrap();
        assert!(matches!(ctx.chain_of(3), Err(VolumeError::Corruption(_))));
    }
}
