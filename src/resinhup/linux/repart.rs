use log::{debug, info};
use std::path::Path;

use crate::{
    common::{call, UpdError, UpdErrorKind},
    defs::MIB_SIZE,
    linux::{
        blk_dev::{drive_from_partition, parse_device_index, DeviceApi},
        linux_defs::{FATRESIZE_CMD, PARTED_CMD, PARTPROBE_CMD},
    },
};

// Makes sure the boot partition can hold current boot files. Old images
// shipped with a boot partition too small for the kernels of today; the
// partition is grown in place before anything is fetched.
pub(crate) fn ensure_boot_partition_size(
    device_api: &dyn DeviceApi,
    min_mib: u64,
) -> Result<(), UpdError> {
    let boot_dev = device_api.get_boot_partition()?;
    let size = device_api.get_size(&boot_dev)?;

    if size >= min_mib * MIB_SIZE {
        debug!(
            "Boot partition '{}' is {} bytes, no resize needed",
            boot_dev.display(),
            size
        );
        return Ok(());
    }

    info!(
        "Increasing boot partition '{}' to {} MiB",
        boot_dev.display(),
        min_mib
    );

    let drive = drive_from_partition(&boot_dev)?;
    let part_num = if let Some((_prefix, index)) = parse_device_index(&boot_dev) {
        index
    } else {
        return Err(UpdError::from_remark(
            UpdErrorKind::InvParam,
            &format!(
                "Failed to parse partition index from '{}'",
                boot_dev.display()
            ),
        ));
    };

    let start_mib = partition_start_mib(&drive, part_num)?;
    let end_mib = start_mib + min_mib;

    let drive_str = drive.to_string_lossy();
    let part_str = part_num.to_string();
    let end_str = format!("{}MiB", end_mib);

    let cmd_res = call(
        PARTED_CMD,
        &[
            "-s", &drive_str, "unit", "MiB", "resizepart", &part_str, &end_str,
        ],
        true,
    )?;
    if !cmd_res.status.success() {
        return Err(UpdError::from_remark(
            UpdErrorKind::ExecProcess,
            &format!(
                "Failed to resize partition {} on '{}': {}",
                part_num, drive_str, cmd_res.stderr
            ),
        ));
    }

    let _res = call(PARTPROBE_CMD, &[&drive_str], true);

    // grow the filesystem into the new partition end
    let boot_str = boot_dev.to_string_lossy();
    let cmd_res = call(FATRESIZE_CMD, &["-s", "max", &boot_str], true)?;
    if !cmd_res.status.success() {
        return Err(UpdError::from_remark(
            UpdErrorKind::ExecProcess,
            &format!(
                "Failed to grow the boot filesystem on '{}': {}",
                boot_str, cmd_res.stderr
            ),
        ));
    }

    info!("Boot partition grown to {} MiB", min_mib);
    Ok(())
}

// start offset of the partition in MiB, from parted machine output
fn partition_start_mib(drive: &Path, part_num: u32) -> Result<u64, UpdError> {
    let drive_str = drive.to_string_lossy();
    let cmd_res = call(
        PARTED_CMD,
        &["-s", "-m", &drive_str, "unit", "MiB", "print"],
        true,
    )?;
    if !cmd_res.status.success() {
        return Err(UpdError::from_remark(
            UpdErrorKind::ExecProcess,
            &format!(
                "Failed to read the partition table of '{}': {}",
                drive_str, cmd_res.stderr
            ),
        ));
    }

    parse_partition_start(&cmd_res.stdout, part_num).ok_or_else(|| {
        UpdError::from_remark(
            UpdErrorKind::NotFound,
            &format!(
                "Partition {} not found in the partition table of '{}'",
                part_num, drive_str
            ),
        )
    })
}

// machine readable parted lines: number:start:end:size:fstype:name:flags
fn parse_partition_start(parted_output: &str, part_num: u32) -> Option<u64> {
    for line in parted_output.lines() {
        let mut fields = line.trim_end_matches(';').split(':');
        if let Some(num) = fields.next() {
            if num.parse::<u32>() != Ok(part_num) {
                continue;
            }
            if let Some(start) = fields.next() {
                if let Ok(start_mib) = start.trim_end_matches("MiB").parse::<f64>() {
                    return Some(start_mib as u64);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::parse_partition_start;

    const PARTED_OUTPUT: &str = r##"BYT;
/dev/mmcblk0:30543MiB:sd/mmc:512:512:msdos:SD SC32G:;
1:4.00MiB:24.0MiB:20.0MiB:fat16::lba;
2:24.0MiB:204MiB:180MiB:ext3::;
3:204MiB:384MiB:180MiB:ext3::;
"##;

    #[test]
    fn parse_start_of_boot_partition() {
        assert_eq!(parse_partition_start(PARTED_OUTPUT, 1), Some(4));
        assert_eq!(parse_partition_start(PARTED_OUTPUT, 3), Some(204));
    }

    #[test]
    fn parse_missing_partition() {
        assert_eq!(parse_partition_start(PARTED_OUTPUT, 5), None);
    }
}
