#[cfg(target_os = "linux")]
mod linux;

mod common;
mod defs;

pub use common::upd_error::{UpdErrCtx, UpdError, UpdErrorKind};

#[cfg(target_os = "linux")]
pub fn upgrade() -> Result<(), UpdError> {
    linux::upgrade()
}
