use digest::Digest;
use failure::ResultExt;
use md5::Md5;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::common::{UpdErrCtx, UpdError, UpdErrorKind};

const BUFFER_SIZE: usize = 1024 * 1024;

pub(crate) fn md5_digest<P: AsRef<Path>>(path: P) -> Result<String, UpdError> {
    process_digest::<Md5, _>(path)
}

fn process_digest<D: Digest + Default, P: AsRef<Path>>(path: P) -> Result<String, UpdError> {
    let path = path.as_ref();
    let mut file = File::open(path).context(UpdErrCtx::from_remark(
        UpdErrorKind::Upstream,
        &format!("Failed to open file '{}'", path.display()),
    ))?;

    let mut sh = D::default();
    let mut buffer = [0u8; BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer).context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            &format!("Failed to read from file '{}'", path.display()),
        ))?;
        if n == 0 {
            break;
        }
        sh.input(&buffer[..n]);
    }
    let digest = sh.result();
    let mut res = String::from("");
    for byte in &digest {
        res.push_str(&format!("{:02x}", byte));
    }
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::md5_digest;
    use std::fs::write;

    #[test]
    fn digest_known_content() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let file = tmp_dir.path().join("config.txt");
        write(&file, b"gpu_mem=16\n").unwrap();
        // md5sum of "gpu_mem=16\n"
        assert_eq!(md5_digest(&file).unwrap(), "96d151be762f8b8d6a856348ea7b5c04");
    }
}
