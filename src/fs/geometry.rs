use crate::error::VolumeError;

/// Size of one directory record in bytes.
pub const DIR_ENTRY_SIZE: usize = 32;

/// Size of one FAT32 table entry in bytes.
pub const FAT_ENTRY_SIZE: u64 = 4;

/// Mask for the 28 significant bits of a FAT32 entry.
pub const FAT32_MASK: u32 = 0x0FFF_FFFF;

/// Smallest value that terminates a FAT32 cluster chain.
pub const FAT32_EOC_MIN: u32 = 0x0FFF_FFF8;

/// Canonical end-of-chain value, used when FAT[0] carries no usable marker.
pub const FAT32_EOC: u32 = 0x0FFF_FFFF;

/// Marker for a bad cluster.
pub const FAT32_BAD: u32 = 0x0FFF_FFF7;

pub const FSINFO_LEAD_SIG: u32 = 0x4161_5252;
pub const FSINFO_STRUCT_SIG: u32 = 0x6141_7272;
/// Offset of the free-cluster count within the FSInfo sector.
pub const FSINFO_FREE_COUNT: u64 = 488;
/// Offset of the next-free hint within the FSInfo sector.
pub const FSINFO_NEXT_FREE: u64 = 492;

/// Advisory counter value meaning "not known".
pub const FREE_COUNT_UNKNOWN: u32 = 0xFFFF_FFFF;

/// FAT32 volume layout derived from the boot sector. Read once at open.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    /// Byte offset of the volume within the image.
    pub partition_offset: u64,
    /// Bytes per sector (typically 512).
    pub bytes_per_sector: u64,
    /// Sectors per cluster.
    pub sectors_per_cluster: u64,
    /// Number of reserved sectors before the first FAT.
    pub reserved_sectors: u64,
    /// Number of FAT copies (typically 2).
    pub num_fats: u64,
    /// Sectors per FAT copy.
    pub sectors_per_fat: u64,
    /// Total sectors on the volume.
    pub total_sectors: u64,
    /// First cluster of the root directory.
    pub root_cluster: u32,
    /// FSInfo sector number, relative to the volume start.
    pub fsinfo_sector: u64,
    /// Number of data clusters.
    pub total_clusters: u64,
    /// Value written into the FAT to terminate a chain.
    pub eoc_sentinel: u32,
}

impl Geometry {
    /// Parse a 512-byte FAT32 boot sector.
    ///
    /// The end-of-chain sentinel defaults to [`FAT32_EOC`]; the volume replaces
    /// it with the value found in FAT[0] once the table is readable.
    pub fn parse(bpb: &[u8; 512], partition_offset: u64) -> Result<Self, VolumeError> {
        // Validate jump instruction (EB xx 90 or E9 xx xx)
        if bpb[0] != 0xEB && bpb[0] != 0xE9 {
            return Err(VolumeError::InvalidGeometry(
                "bad jump instruction in boot sector".into(),
            ));
        }
        if bpb[510] != 0x55 || bpb[511] != 0xAA {
            return Err(VolumeError::InvalidGeometry(
                "missing 0x55AA boot signature".into(),
            ));
        }

        let bytes_per_sector = u16::from_le_bytes([bpb[11], bpb[12]]) as u64;
        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(VolumeError::InvalidGeometry(format!(
                "invalid bytes per sector: {bytes_per_sector}"
            )));
        }

        let sectors_per_cluster = bpb[13] as u64;
        if sectors_per_cluster == 0 {
            return Err(VolumeError::InvalidGeometry(
                "invalid sectors per cluster: 0".into(),
            ));
        }

        let reserved_sectors = u16::from_le_bytes([bpb[14], bpb[15]]) as u64;
        let num_fats = bpb[16] as u64;
        if num_fats == 0 {
            return Err(VolumeError::InvalidGeometry("FAT count is 0".into()));
        }

        let root_entry_count = u16::from_le_bytes([bpb[17], bpb[18]]);
        let sectors_per_fat_16 = u16::from_le_bytes([bpb[22], bpb[23]]);
        if root_entry_count != 0 || sectors_per_fat_16 != 0 {
            return Err(VolumeError::Unsupported(
                "boot sector describes a FAT12/16 volume".into(),
            ));
        }

        let total_sectors_16 = u16::from_le_bytes([bpb[19], bpb[20]]) as u64;
        let total_sectors_32 = u32::from_le_bytes([bpb[32], bpb[33], bpb[34], bpb[35]]) as u64;
        let total_sectors = if total_sectors_16 != 0 {
            total_sectors_16
        } else {
            total_sectors_32
        };

        let sectors_per_fat = u32::from_le_bytes([bpb[36], bpb[37], bpb[38], bpb[39]]) as u64;
        if sectors_per_fat == 0 {
            return Err(VolumeError::InvalidGeometry("FAT size is 0".into()));
        }

        let root_cluster = u32::from_le_bytes([bpb[44], bpb[45], bpb[46], bpb[47]]);
        let fsinfo_sector = u16::from_le_bytes([bpb[48], bpb[49]]) as u64;

        let data_start_sector = reserved_sectors + num_fats * sectors_per_fat;
        if data_start_sector >= total_sectors {
            return Err(VolumeError::InvalidGeometry(format!(
                "data region starts at sector {data_start_sector}, past the volume end ({total_sectors})"
            )));
        }
        let total_clusters = (total_sectors - data_start_sector) / sectors_per_cluster;

        let geometry = Self {
            partition_offset,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            sectors_per_fat,
            total_sectors,
            root_cluster,
            fsinfo_sector,
            total_clusters,
            eoc_sentinel: FAT32_EOC,
        };

        if root_cluster < 2 || root_cluster as u64 >= geometry.cluster_limit() as u64 {
            return Err(VolumeError::InvalidGeometry(format!(
                "root cluster {root_cluster} is outside the data region"
            )));
        }

        Ok(geometry)
    }

    /// Bytes per cluster.
    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    /// Directory records that fit in one cluster.
    pub fn entries_per_cluster(&self) -> u64 {
        self.cluster_size() / DIR_ENTRY_SIZE as u64
    }

    /// Absolute byte offset of the first FAT copy.
    pub fn fat_start(&self) -> u64 {
        self.partition_offset + self.reserved_sectors * self.bytes_per_sector
    }

    /// Size of one FAT copy in bytes.
    pub fn fat_size(&self) -> u64 {
        self.sectors_per_fat * self.bytes_per_sector
    }

    /// Absolute byte offset of the data region (cluster 2).
    pub fn data_start(&self) -> u64 {
        self.fat_start() + self.num_fats * self.fat_size()
    }

    /// Absolute byte offset of the FSInfo sector.
    pub fn fsinfo_offset(&self) -> u64 {
        self.partition_offset + self.fsinfo_sector * self.bytes_per_sector
    }

    /// Whether the BPB points at a usable FSInfo sector.
    pub fn has_fsinfo(&self) -> bool {
        self.fsinfo_sector > 0 && self.fsinfo_sector < self.reserved_sectors
    }

    /// Absolute byte offset of the start of a cluster's data.
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_start() + (cluster as u64 - 2) * self.cluster_size()
    }

    /// Absolute byte offset of a cluster's entry in the given FAT copy.
    pub fn fat_entry_offset(&self, copy: u64, cluster: u32) -> u64 {
        self.fat_start() + copy * self.fat_size() + cluster as u64 * FAT_ENTRY_SIZE
    }

    /// One past the highest addressable cluster index.
    ///
    /// Bounded both by the data region and by the number of entries one FAT
    /// copy can hold.
    pub fn cluster_limit(&self) -> u32 {
        let by_data = self.total_clusters + 2;
        let by_fat = self.fat_size() / FAT_ENTRY_SIZE;
        by_data.min(by_fat).min(FAT32_MASK as u64) as u32
    }
}

/// Whether a (masked) FAT entry terminates a chain.
pub fn is_end_of_chain(entry: u32) -> bool {
    entry & FAT32_MASK >= FAT32_EOC_MIN
}
