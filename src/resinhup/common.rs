use failure::ResultExt;
use log::{debug, error, trace};
use std::fs::metadata;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

pub(crate) mod upd_error;

pub(crate) mod config;

pub(crate) mod logger;

pub(crate) mod file_digest;

pub(crate) mod retry;

pub(crate) use self::config::Config;
pub use self::upd_error::{UpdErrCtx, UpdError, UpdErrorKind};

#[derive(Debug)]
pub(crate) struct CmdRes {
    pub stdout: String,
    pub stderr: String,
    pub status: ExitStatus,
}

pub(crate) fn call(cmd: &str, args: &[&str], trim_stdout: bool) -> Result<CmdRes, UpdError> {
    trace!("call: '{}' called with {:?}, {}", cmd, args, trim_stdout);

    match Command::new(cmd)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
    {
        Ok(output) => {
            debug!("call: output: {:?}", output);
            Ok(CmdRes {
                stdout: if trim_stdout {
                    String::from(String::from_utf8_lossy(&output.stdout).trim())
                } else {
                    String::from(String::from_utf8_lossy(&output.stdout))
                },
                stderr: String::from(String::from_utf8_lossy(&output.stderr)),
                status: output.status,
            })
        }
        Err(why) => {
            error!("call: output failed: {:?}", why);
            Err(UpdError::from_remark(
                UpdErrorKind::Upstream,
                &format!("call: failed to execute: command {} '{:?}'", cmd, args),
            ))
        }
    }
}

pub(crate) fn path_append<P1: AsRef<Path>, P2: AsRef<Path>>(base: P1, append: P2) -> PathBuf {
    let base = base.as_ref();
    let append = append.as_ref();

    if append.is_absolute() {
        let mut components = append.components();
        let mut curr = PathBuf::from(base);
        components.next();
        for comp in components {
            curr = curr.join(comp);
        }
        curr
    } else {
        base.join(append)
    }
}

pub(crate) fn file_exists<P: AsRef<Path>>(file: P) -> bool {
    file.as_ref().exists()
}

pub(crate) fn dir_exists<P: AsRef<Path>>(name: P) -> Result<bool, UpdError> {
    let path = name.as_ref();
    if path.exists() {
        Ok(metadata(path)
            .context(UpdErrCtx::from_remark(
                UpdErrorKind::Upstream,
                &format!(
                    "dir_exists: failed to retrieve metadata for path: '{}'",
                    path.display()
                ),
            ))?
            .file_type()
            .is_dir())
    } else {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::path_append;
    use std::path::PathBuf;

    #[test]
    fn append_relative() {
        assert_eq!(path_append("/mnt/boot", "config.txt"), PathBuf::from("/mnt/boot/config.txt"));
    }

    #[test]
    fn append_absolute() {
        assert_eq!(
            path_append("/tmp/root-tempmountpoint", "/etc/resolv.conf"),
            PathBuf::from("/tmp/root-tempmountpoint/etc/resolv.conf")
        );
    }
}
