use std::ops::Range;

// Default configuration file
pub const DEFAULT_CONF_FILE: &str = "/etc/resinhup.conf";

// Canonical partition labels - one device must exist for each after an
// update has gone through
pub const RESIN_BOOT_LABEL: &str = "resin-boot";
pub const RESIN_ROOT_LABEL: &str = "resin-root";
pub const RESIN_UPDT_LABEL: &str = "resin-updt";
pub const RESIN_DATA_LABEL: &str = "resin-data";

// where do disk labels live ?
pub const DISK_BY_LABEL_PATH: &str = "/dev/disk/by-label";

// deleting this file on the state partition makes the host OS regenerate
// its persistent state on next boot
pub const STATE_SENTINEL_FILE: &str = "remove_me_to_reset";

// bootloader environment file written on the boot partition during hand-off
pub const UENV_FILE_NAME: &str = "resinOS_uEnv.txt";

// md5 manifest shipped on the boot partition
pub const FINGERPRINT_FILE_NAME: &str = "resinhup.fingerprints";

// colliding text files in the boot partition are backed up under this suffix
pub const BACKUP_SUFFIX: &str = ".hup.old";

// root filesystem banks are formatted with this filesystem type
pub const ROOTFS_FS_TYPE: &str = "ext3";

// temporary mountpoints, created below the fetcher workspace
pub const ROOT_TEMP_MOUNT_DIR: &str = "root-tempmountpoint";
pub const BOOT_TEMP_MOUNT_DIR: &str = "boot-tempmountpoint";
pub const STATE_TEMP_MOUNT_DIR: &str = "state-tempmountpoint";

pub const DEFAULT_WORKSPACE: &str = "/mnt/data/resinhup";

// total fetch attempts and the jitter range slept before attempts 2..n
pub const FETCH_ATTEMPTS: u32 = 3;
pub const FETCH_BACKOFF_SECS: Range<u64> = 30..120;

// old devices ship with a boot partition too small for current images
pub const BOOT_PART_MIN_MIB: u64 = 40;

pub const MIB_SIZE: u64 = 1024 * 1024;
