pub const ROOT_PATH: &str = "/";
pub const BOOT_DIR: &str = "boot";

pub const PROC_MODULES_PATH: &str = "/proc/modules";
pub const DEVICE_TREE_MODEL_PATH: &str = "/proc/device-tree/model";
pub const DMI_PRODUCT_NAME_PATH: &str = "/sys/devices/virtual/dmi/id/product_name";
pub const OS_RELEASE_FILE: &str = "etc/os-release";

pub const NIX_NONE: Option<&'static [u8]> = None;

pub const WHEREIS_CMD: &str = "whereis";
pub const FILE_CMD: &str = "file";
pub const FINDMNT_CMD: &str = "findmnt";
pub const LSBLK_CMD: &str = "lsblk";
pub const MKFS_EXT3_CMD: &str = "mkfs.ext3";
pub const E2LABEL_CMD: &str = "e2label";
pub const FATLABEL_CMD: &str = "fatlabel";
pub const PARTED_CMD: &str = "parted";
pub const FATRESIZE_CMD: &str = "fatresize";
pub const PARTPROBE_CMD: &str = "partprobe";
pub const DOCKER_CMD: &str = "docker";
