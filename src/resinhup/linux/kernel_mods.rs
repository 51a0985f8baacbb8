use failure::ResultExt;
use log::trace;
use std::fs::read_to_string;

use crate::{
    common::{UpdErrCtx, UpdError, UpdErrorKind},
    linux::linux_defs::PROC_MODULES_PATH,
};

// taint markers of modules the shipped images do not carry:
// out-of-tree (O), proprietary (P) and unsigned (E)
const CUSTOM_TAINTS: &[char] = &['O', 'P', 'E'];

// Names of loaded kernel modules that do not belong to the stock kernel.
// A system running such modules cannot be updated safely - the modules
// would be gone after the rootfs swap.
pub(crate) fn custom_loaded_modules() -> Result<Vec<String>, UpdError> {
    trace!("custom_loaded_modules: entered");

    let modules = read_to_string(PROC_MODULES_PATH).context(UpdErrCtx::from_remark(
        UpdErrorKind::Upstream,
        &format!("Failed to read from file: '{}'", PROC_MODULES_PATH),
    ))?;

    Ok(parse_modules(&modules))
}

fn parse_modules(modules: &str) -> Vec<String> {
    let mut custom: Vec<String> = Vec::new();

    for line in modules.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // name size refcount deps state address [(taints)]
        if fields.len() < 7 {
            continue;
        }
        let taints = fields[6].trim_matches(|c| c == '(' || c == ')');
        if taints.chars().any(|c| CUSTOM_TAINTS.contains(&c)) {
            custom.push(String::from(fields[0]));
        }
    }

    custom
}

#[cfg(test)]
mod tests {
    use super::parse_modules;

    const PROC_MODULES: &str = r##"brcmfmac 186858 0 - Live 0x7f0b3000
cfg80211 428270 1 brcmfmac, Live 0x7f027000
wlspy 16384 0 - Live 0x7f022000 (OE)
snd_bcm2835 20511 0 - Live 0x7f00e000
"##;

    #[test]
    fn flags_out_of_tree_modules() {
        let custom = parse_modules(PROC_MODULES);
        assert_eq!(custom, vec!["wlspy"]);
    }

    #[test]
    fn clean_module_list() {
        let custom = parse_modules("snd_bcm2835 20511 0 - Live 0x7f00e000\n");
        assert!(custom.is_empty());
    }
}
