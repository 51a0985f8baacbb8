use clap::{App, Arg};
use failure::ResultExt;
use log::{debug, warn};
use std::collections::HashMap;
use std::env;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};

use crate::{
    common::{file_exists, logger::Logger, UpdErrCtx, UpdError, UpdErrorKind},
    defs::DEFAULT_CONF_FILE,
};

pub(crate) type Sections = HashMap<String, HashMap<String, String>>;

#[derive(Debug)]
pub(crate) struct Config {
    sections: Sections,
    config_path: PathBuf,
    pub version: Option<String>,
    pub remote: Option<String>,
    pub device: Option<String>,
    pub force: bool,
    pub allow_downgrades: bool,
    pub staging: bool,
}

impl Config {
    pub fn new() -> Result<Config, UpdError> {
        let arg_matches = App::new("resinhup")
            .version("0.1")
            .about("Updates a device to a new resin host OS version")
            .arg(
                Arg::with_name("debug")
                    .short("d")
                    .long("debug")
                    .help("Run in debug/verbose mode"),
            )
            .arg(
                Arg::with_name("no-colors")
                    .short("n")
                    .long("no-colors")
                    .help("Don't use any colors"),
            )
            .arg(
                Arg::with_name("device")
                    .long("device")
                    .value_name("DEVICE")
                    .help("Force the device name and skip device detection"),
            )
            .arg(
                Arg::with_name("config")
                    .short("c")
                    .long("configuration-file")
                    .value_name("FILE")
                    .help("Configuration file to be used"),
            )
            .arg(
                Arg::with_name("force")
                    .short("f")
                    .long("force")
                    .help("Force update while avoiding fingerprint checks. Do it on your own risk."),
            )
            .arg(
                Arg::with_name("allow-downgrades")
                    .long("allow-downgrades")
                    .help("Allow downgrading to an older version"),
            )
            .arg(
                Arg::with_name("staging")
                    .short("s")
                    .long("staging")
                    .help("Fetch update bundles from the staging registry"),
            )
            .arg(
                Arg::with_name("version")
                    .short("u")
                    .long("update-to-version")
                    .value_name("VERSION")
                    .help("Use this version to update the device to"),
            )
            .arg(
                Arg::with_name("remote")
                    .short("r")
                    .long("remote")
                    .value_name("REMOTE")
                    .help("Remote to be used when searching for update bundles"),
            )
            .get_matches();

        Logger::initialise(
            arg_matches.is_present("debug"),
            !arg_matches.is_present("no-colors"),
        )?;

        if arg_matches.is_present("debug") {
            debug!("Running in debug/verbose mode.");
        }

        let mut version = arg_matches.value_of("version").map(String::from);
        let mut remote = arg_matches.value_of("remote").map(String::from);
        let mut staging = arg_matches.is_present("staging");
        let mut force = arg_matches.is_present("force");
        let mut allow_downgrades = arg_matches.is_present("allow-downgrades");

        // allow things to be overwritten from the environment
        if let Ok(env_remote) = env::var("REMOTE") {
            remote = Some(env_remote);
        }
        if let Ok(env_version) = env::var("VERSION") {
            version = Some(env_version);
        }
        if env::var("RESINHUP_STAGING").is_ok() {
            staging = true;
        }
        if env::var("RESINHUP_FORCE").is_ok() {
            force = true;
        }
        if env::var("ALLOW_DOWNGRADES").is_ok() {
            allow_downgrades = true;
        }

        let config_path = if let Some(path) = arg_matches.value_of("config") {
            PathBuf::from(path)
        } else {
            PathBuf::from(DEFAULT_CONF_FILE)
        };

        let sections = if file_exists(&config_path) {
            Config::read_sections(&config_path)?
        } else {
            warn!(
                "Configuration file {} not found, using defaults",
                config_path.display()
            );
            Sections::new()
        };

        Ok(Config {
            sections,
            config_path,
            version,
            remote,
            device: arg_matches.value_of("device").map(String::from),
            force,
            allow_downgrades,
            staging,
        })
    }

    fn read_sections(config_path: &Path) -> Result<Sections, UpdError> {
        let config_str = read_to_string(config_path).context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!(
                "read_sections: failed to read configuration file '{}'",
                config_path.display()
            ),
        ))?;

        Config::from_string(&config_str)
    }

    pub fn from_string(config_str: &str) -> Result<Sections, UpdError> {
        Ok(
            serde_yaml::from_str(config_str).context(UpdErrCtx::from_remark(
                UpdErrorKind::InvParam,
                "from_string: failed to parse configuration",
            ))?,
        )
    }

    // the configuration contract: a (section, key) lookup returning an
    // optional string
    pub fn get_item(&self, section: &str, key: &str) -> Option<&str> {
        if let Some(section) = self.sections.get(section) {
            if let Some(value) = section.get(key) {
                return Some(value.as_str());
            }
        }
        None
    }

    pub fn get_path(&self) -> &Path {
        &self.config_path
    }

    #[cfg(test)]
    pub fn from_sections(sections: Sections) -> Config {
        Config {
            sections,
            config_path: PathBuf::from(DEFAULT_CONF_FILE),
            version: None,
            remote: None,
            device: None,
            force: false,
            allow_downgrades: false,
            staging: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    const CONFIG_STR: &str = r##"
General:
  host_bind_mount: /host
  supported_machines: raspberry-pi raspberry-pi2 raspberrypi3 beaglebone-black
rootfs:
  to_keep_files: "/etc/config.json /etc/dropbear:/etc/dropbear"
FingerPrintScanner:
  boot_whitelist: "config.txt uEnv.txt"
"##;

    #[test]
    fn lookup_present_item() {
        let config = Config::from_sections(Config::from_string(CONFIG_STR).unwrap());
        assert_eq!(config.get_item("General", "host_bind_mount"), Some("/host"));
        assert_eq!(
            config.get_item("FingerPrintScanner", "boot_whitelist"),
            Some("config.txt uEnv.txt")
        );
    }

    #[test]
    fn lookup_absent_item() {
        let config = Config::from_sections(Config::from_string(CONFIG_STR).unwrap());
        assert_eq!(config.get_item("General", "no_such_key"), None);
        assert_eq!(config.get_item("no_such_section", "host_bind_mount"), None);
    }
}
