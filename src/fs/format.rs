//! Writing a fresh, empty FAT32 volume.

use std::io::{Seek, SeekFrom, Write};

use log::info;

use super::geometry::{
    FAT32_EOC, FSINFO_FREE_COUNT, FSINFO_LEAD_SIG, FSINFO_NEXT_FREE, FSINFO_STRUCT_SIG,
};
use crate::error::VolumeError;

const CHUNK_SIZE: usize = 256 * 1024; // 256 KB I/O buffer

/// Sector holding the backup boot sector.
const BACKUP_BOOT_SECTOR: u64 = 6;
const FSINFO_SECTOR: u64 = 1;
const ROOT_CLUSTER: u32 = 2;

/// Layout parameters for [`format_volume`].
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// Volume size in bytes (rounded down to whole sectors).
    pub total_bytes: u64,
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    /// BPB media byte (0xF8 for fixed disks).
    pub media: u8,
    pub volume_id: u32,
    /// Up to 11 characters; padded with spaces.
    pub label: String,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            total_bytes: 64 * 1024 * 1024,
            bytes_per_sector: 512,
            sectors_per_cluster: 2,
            reserved_sectors: 32,
            num_fats: 2,
            media: 0xF8,
            volume_id: 0x1234_5678,
            label: "NO NAME".into(),
        }
    }
}

impl FormatOptions {
    pub fn with_size(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            ..Self::default()
        }
    }
}

/// Result of [`format_volume`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FormatSummary {
    pub total_clusters: u32,
    pub sectors_per_fat: u32,
    pub free_clusters: u32,
}

/// Write an empty FAT32 volume at `partition_offset`.
///
/// The whole volume range is zero-filled first, so every free cluster is
/// immediately usable as directory space.
pub fn format_volume<W: Write + Seek>(
    dev: &mut W,
    partition_offset: u64,
    opts: &FormatOptions,
) -> Result<FormatSummary, VolumeError> {
    let bps = opts.bytes_per_sector as u64;
    if !matches!(opts.bytes_per_sector, 512 | 1024 | 2048 | 4096) {
        return Err(VolumeError::InvalidGeometry(format!(
            "invalid bytes per sector: {}",
            opts.bytes_per_sector
        )));
    }
    if opts.sectors_per_cluster == 0 || !opts.sectors_per_cluster.is_power_of_two() {
        return Err(VolumeError::InvalidGeometry(format!(
            "invalid sectors per cluster: {}",
            opts.sectors_per_cluster
        )));
    }
    if opts.num_fats == 0 {
        return Err(VolumeError::InvalidGeometry("FAT count is 0".into()));
    }
    if (opts.reserved_sectors as u64) <= FSINFO_SECTOR {
        return Err(VolumeError::InvalidGeometry(format!(
            "need more than {FSINFO_SECTOR} reserved sector(s), got {}",
            opts.reserved_sectors
        )));
    }

    let total_sectors = opts.total_bytes / bps;
    if total_sectors > u32::MAX as u64 {
        return Err(VolumeError::InvalidGeometry(format!(
            "{total_sectors} sectors do not fit a FAT32 BPB"
        )));
    }
    let total_sectors = total_sectors as u32;
    let reserved = opts.reserved_sectors as u32;
    let spc = opts.sectors_per_cluster as u32;
    let num_fats = opts.num_fats as u32;

    let sectors_per_fat = compute_fat_sectors(
        total_sectors,
        reserved,
        num_fats,
        spc,
        opts.bytes_per_sector,
    );
    let data_start = reserved + num_fats * sectors_per_fat;
    if data_start >= total_sectors {
        return Err(VolumeError::InvalidGeometry(format!(
            "{} bytes is too small for a FAT32 volume",
            opts.total_bytes
        )));
    }
    let total_clusters = (total_sectors - data_start) / spc;
    if total_clusters == 0 {
        return Err(VolumeError::InvalidGeometry(
            "volume has no room for a root cluster".into(),
        ));
    }

    zero_fill(dev, partition_offset, total_sectors as u64 * bps)?;

    // --- Boot sector (+ backup) ---
    let bpb = build_bpb(opts, total_sectors, sectors_per_fat);
    write_bpb(dev, partition_offset, &bpb, reserved as u64, bps)?;

    // --- FSInfo (+ backup) ---
    // Root directory occupies the first cluster.
    let free_clusters = total_clusters - 1;
    let fsinfo = build_fsinfo(free_clusters, ROOT_CLUSTER + 1, bps as usize);
    dev.seek(SeekFrom::Start(partition_offset + FSINFO_SECTOR * bps))?;
    dev.write_all(&fsinfo)?;
    if reserved as u64 > BACKUP_BOOT_SECTOR + FSINFO_SECTOR {
        dev.seek(SeekFrom::Start(
            partition_offset + (BACKUP_BOOT_SECTOR + FSINFO_SECTOR) * bps,
        ))?;
        dev.write_all(&fsinfo)?;
    }

    // --- FAT copies ---
    // FAT32: entry 0 = media | 0x0FFFFF00, entry 1 = 0x0FFFFFFF (EOC + clean flags)
    let entry0 = 0x0FFF_FF00u32 | opts.media as u32;
    let mut head = Vec::with_capacity(12);
    head.extend_from_slice(&entry0.to_le_bytes());
    head.extend_from_slice(&FAT32_EOC.to_le_bytes());
    head.extend_from_slice(&FAT32_EOC.to_le_bytes()); // root directory chain
    for copy in 0..num_fats as u64 {
        let fat_pos =
            partition_offset + reserved as u64 * bps + copy * sectors_per_fat as u64 * bps;
        dev.seek(SeekFrom::Start(fat_pos))?;
        dev.write_all(&head)?;
    }

    dev.flush()?;
    info!(
        "formatted FAT32 volume: {total_sectors} sectors, {total_clusters} clusters, {sectors_per_fat} sectors per FAT"
    );

    Ok(FormatSummary {
        total_clusters,
        sectors_per_fat,
        free_clusters,
    })
}

/// Number of sectors one FAT copy needs for the given layout.
fn compute_fat_sectors(
    total_sectors: u32,
    reserved: u32,
    num_fats: u32,
    sectors_per_cluster: u32,
    bytes_per_sector: u16,
) -> u32 {
    let avail = total_sectors.saturating_sub(reserved) as u64;
    let bps = bytes_per_sector as u64;
    let spc = sectors_per_cluster as u64;
    let n = num_fats as u64;

    // FAT32: 4 bytes per entry
    let num = 4 * (avail + 2 * spc);
    let den = bps * spc + 4 * n;
    ((num + den - 1) / den).max(1) as u32
}

fn build_bpb(opts: &FormatOptions, total_sectors: u32, sectors_per_fat: u32) -> [u8; 512] {
    let mut bpb = [0u8; 512];
    bpb[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
    bpb[3..11].copy_from_slice(b"RUSTYFAT");
    bpb[11..13].copy_from_slice(&opts.bytes_per_sector.to_le_bytes());
    bpb[13] = opts.sectors_per_cluster;
    bpb[14..16].copy_from_slice(&opts.reserved_sectors.to_le_bytes());
    bpb[16] = opts.num_fats;
    // root entry count, 16-bit total sectors and 16-bit FAT size stay zero
    bpb[21] = opts.media;
    bpb[24..26].copy_from_slice(&32u16.to_le_bytes()); // sectors per track
    bpb[26..28].copy_from_slice(&64u16.to_le_bytes()); // heads
    bpb[32..36].copy_from_slice(&total_sectors.to_le_bytes());
    bpb[36..40].copy_from_slice(&sectors_per_fat.to_le_bytes());
    bpb[44..48].copy_from_slice(&ROOT_CLUSTER.to_le_bytes());
    bpb[48..50].copy_from_slice(&(FSINFO_SECTOR as u16).to_le_bytes());
    bpb[50..52].copy_from_slice(&(BACKUP_BOOT_SECTOR as u16).to_le_bytes());
    bpb[64] = 0x80; // drive number
    bpb[66] = 0x29; // extended boot signature
    bpb[67..71].copy_from_slice(&opts.volume_id.to_le_bytes());

    let mut label = [b' '; 11];
    for (dst, src) in label.iter_mut().zip(opts.label.bytes()) {
        *dst = src.to_ascii_uppercase();
    }
    bpb[71..82].copy_from_slice(&label);
    bpb[82..90].copy_from_slice(b"FAT32   ");
    bpb[510] = 0x55;
    bpb[511] = 0xAA;
    bpb
}

fn build_fsinfo(free_clusters: u32, next_free: u32, sector_size: usize) -> Vec<u8> {
    let mut fsinfo = vec![0u8; sector_size];
    fsinfo[0..4].copy_from_slice(&FSINFO_LEAD_SIG.to_le_bytes());
    fsinfo[484..488].copy_from_slice(&FSINFO_STRUCT_SIG.to_le_bytes());
    let free = FSINFO_FREE_COUNT as usize;
    let next = FSINFO_NEXT_FREE as usize;
    fsinfo[free..free + 4].copy_from_slice(&free_clusters.to_le_bytes());
    fsinfo[next..next + 4].copy_from_slice(&next_free.to_le_bytes());
    fsinfo[508..512].copy_from_slice(&0xAA55_0000u32.to_le_bytes());
    fsinfo
}

/// Write a BPB to the primary boot sector and, when the reserved area is large
/// enough, to the backup at sector 6.
fn write_bpb<W: Write + Seek>(
    dev: &mut W,
    partition_offset: u64,
    bpb: &[u8; 512],
    reserved_sectors: u64,
    bytes_per_sector: u64,
) -> Result<(), VolumeError> {
    dev.seek(SeekFrom::Start(partition_offset))?;
    dev.write_all(bpb)?;
    if reserved_sectors > BACKUP_BOOT_SECTOR {
        let backup = partition_offset + BACKUP_BOOT_SECTOR * bytes_per_sector;
        dev.seek(SeekFrom::Start(backup))?;
        dev.write_all(bpb)?;
    }
    Ok(())
}

fn zero_fill<W: Write + Seek>(dev: &mut W, start: u64, len: u64) -> Result<(), VolumeError> {
    let zeros = vec![0u8; CHUNK_SIZE];
    let mut remaining = len;
    dev.seek(SeekFrom::Start(start))?;
    while remaining > 0 {
        let n = (remaining as usize).min(CHUNK_SIZE);
        dev.write_all(&zeros[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}
