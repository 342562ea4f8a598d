use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info, warn};

use super::geometry::{
    is_end_of_chain, Geometry, DIR_ENTRY_SIZE, FAT32_EOC, FAT32_MASK, FREE_COUNT_UNKNOWN,
    FSINFO_FREE_COUNT, FSINFO_LEAD_SIG, FSINFO_STRUCT_SIG,
};
use crate::error::VolumeError;

/// One raw 32-byte directory record.
pub type RecordBytes = [u8; DIR_ENTRY_SIZE];

/// Open image plus everything derived from its boot sector.
///
/// Every engine component goes through this value for I/O; there is no
/// process-wide state.
pub struct VolumeContext<D> {
    dev: D,
    geo: Geometry,
    /// Advisory free-cluster count mirrored from FSInfo.
    free_clusters: u32,
    /// Whether FSInfo carried valid signatures at open time.
    fsinfo_valid: bool,
}

impl<D: Read + Write + Seek> VolumeContext<D> {
    /// Read the boot sector at `partition_offset` and derive the geometry.
    pub fn open(mut dev: D, partition_offset: u64) -> Result<Self, VolumeError> {
        dev.seek(SeekFrom::Start(partition_offset))?;
        let mut bpb = [0u8; 512];
        dev.read_exact(&mut bpb)
            .map_err(|e| VolumeError::InvalidGeometry(format!("cannot read boot sector: {e}")))?;
        let geo = Geometry::parse(&bpb, partition_offset)?;

        let mut ctx = Self {
            dev,
            geo,
            free_clusters: FREE_COUNT_UNKNOWN,
            fsinfo_valid: false,
        };

        let fat0 = ctx.fat_entry(0)?;
        if is_end_of_chain(fat0) {
            ctx.geo.eoc_sentinel = fat0 & FAT32_MASK;
        } else {
            warn!("FAT[0] = 0x{fat0:08X} is not an end-of-chain marker, using 0x{FAT32_EOC:08X}");
        }

        ctx.load_fsinfo()?;

        info!(
            "opened FAT32 volume: {} B/sector, {} sector(s)/cluster, {} FAT(s), {} clusters, root cluster {}, EOC 0x{:08X}",
            ctx.geo.bytes_per_sector,
            ctx.geo.sectors_per_cluster,
            ctx.geo.num_fats,
            ctx.geo.total_clusters,
            ctx.geo.root_cluster,
            ctx.geo.eoc_sentinel,
        );
        Ok(ctx)
    }

    fn load_fsinfo(&mut self) -> Result<(), VolumeError> {
        if !self.geo.has_fsinfo() {
            warn!("volume has no FSInfo sector, free-cluster count unknown");
            return Ok(());
        }
        let base = self.geo.fsinfo_offset();
        self.dev.seek(SeekFrom::Start(base))?;
        let lead = self.dev.read_u32::<LittleEndian>()?;
        self.dev.seek(SeekFrom::Start(base + 484))?;
        let sig = self.dev.read_u32::<LittleEndian>()?;
        if lead != FSINFO_LEAD_SIG || sig != FSINFO_STRUCT_SIG {
            warn!("FSInfo signatures invalid (0x{lead:08X}/0x{sig:08X}), free-cluster count unknown");
            return Ok(());
        }
        self.free_clusters = self.dev.read_u32::<LittleEndian>()?;
        self.fsinfo_valid = true;
        Ok(())
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    /// Advisory free-cluster count (`0xFFFFFFFF` when unknown).
    pub fn free_clusters(&self) -> u32 {
        self.free_clusters
    }

    /// Give back the underlying device.
    pub fn into_inner(self) -> D {
        self.dev
    }

    pub(crate) fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        self.dev.seek(SeekFrom::Start(offset))?;
        self.dev.read_exact(buf)?;
        Ok(())
    }

    pub(crate) fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), VolumeError> {
        self.dev.seek(SeekFrom::Start(offset))?;
        self.dev.write_all(buf)?;
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<(), VolumeError> {
        self.dev.flush()?;
        Ok(())
    }

    /// Read the full contents of one cluster.
    pub(crate) fn read_cluster(&mut self, cluster: u32) -> Result<Vec<u8>, VolumeError> {
        let mut buf = vec![0u8; self.geo.cluster_size() as usize];
        let offset = self.geo.cluster_offset(cluster);
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Read one 32-byte directory record at an absolute offset.
    pub fn read_record(&mut self, offset: u64) -> Result<RecordBytes, VolumeError> {
        let mut rec = [0u8; DIR_ENTRY_SIZE];
        self.read_at(offset, &mut rec)?;
        Ok(rec)
    }

    pub(crate) fn write_record(&mut self, offset: u64, rec: &RecordBytes) -> Result<(), VolumeError> {
        self.write_at(offset, rec)
    }

    /// Overwrite one directory slot with zero bytes.
    pub(crate) fn zero_record(&mut self, offset: u64) -> Result<(), VolumeError> {
        self.write_at(offset, &[0u8; DIR_ENTRY_SIZE])
    }

    /// Read the raw entry for `cluster` from the first FAT copy.
    pub(crate) fn fat_entry(&mut self, cluster: u32) -> Result<u32, VolumeError> {
        let offset = self.geo.fat_entry_offset(0, cluster);
        self.dev.seek(SeekFrom::Start(offset))?;
        Ok(self.dev.read_u32::<LittleEndian>()?)
    }

    /// Write `value` for `cluster` into every FAT copy, keeping the reserved
    /// top four bits of each existing entry.
    pub(crate) fn set_fat_entry(&mut self, cluster: u32, value: u32) -> Result<(), VolumeError> {
        for copy in 0..self.geo.num_fats {
            let offset = self.geo.fat_entry_offset(copy, cluster);
            self.dev.seek(SeekFrom::Start(offset))?;
            let old = self.dev.read_u32::<LittleEndian>()?;
            let new = (old & !FAT32_MASK) | (value & FAT32_MASK);
            self.dev.seek(SeekFrom::Start(offset))?;
            self.dev.write_u32::<LittleEndian>(new)?;
        }
        Ok(())
    }

    /// Apply `delta` to the advisory free-cluster count and persist it.
    ///
    /// An unknown count stays unknown; the count never drives allocation.
    pub(crate) fn adjust_free_clusters(&mut self, delta: i64) -> Result<(), VolumeError> {
        if self.free_clusters == FREE_COUNT_UNKNOWN {
            return Ok(());
        }
        let updated = (self.free_clusters as i64 + delta).clamp(0, u32::MAX as i64 - 1) as u32;
        debug!("free clusters: {} -> {}", self.free_clusters, updated);
        self.free_clusters = updated;
        if self.fsinfo_valid {
            let offset = self.geo.fsinfo_offset() + FSINFO_FREE_COUNT;
            self.dev.seek(SeekFrom::Start(offset))?;
            self.dev.write_u32::<LittleEndian>(updated)?;
        }
        Ok(())
    }
}
