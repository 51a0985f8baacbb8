use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Display};

#[derive(Copy, Clone, Eq, PartialEq, Debug, Fail)]
pub enum UpdErrorKind {
    #[fail(display = "An error occured in an upstream function")]
    Upstream,
    #[fail(display = "An error has already been displayed")]
    Displayed,
    #[fail(display = "A required item could not be found")]
    NotFound,
    #[fail(display = "An invalid value was encountered")]
    InvParam,
    #[fail(display = "An invalid state was encountered")]
    InvState,
    #[fail(display = "A spawned process returned an error status")]
    ExecProcess,
    #[fail(display = "No update target device could be determined")]
    NoUpdateTarget,
    #[fail(display = "Failed to format the update target device")]
    FormatFailed,
    #[fail(display = "Failed to mount a required filesystem")]
    MountFailed,
    #[fail(display = "Failed to unpack the new root filesystem")]
    UnpackFailed,
    #[fail(display = "Failed to overlay files into the new root filesystem")]
    OverlayFailed,
    #[fail(display = "Failed to back up a boot partition file")]
    BackupFailed,
    #[fail(display = "Failed to copy a file to the boot partition")]
    BootCopyFailed,
    #[fail(display = "A canonical partition label is missing")]
    MissingLabel,
    #[fail(display = "Failed to reset the state partition")]
    StateResetFailed,
    #[fail(display = "Failed to configure the bootloader")]
    BootloaderConfigFailed,
    #[fail(display = "All fetch attempts have been exhausted")]
    FetchExhausted,
}

pub struct UpdErrCtx {
    kind: UpdErrorKind,
    descr: String,
}

impl UpdErrCtx {
    pub fn from_remark(kind: UpdErrorKind, descr: &str) -> UpdErrCtx {
        UpdErrCtx {
            kind,
            descr: String::from(descr),
        }
    }
}

impl From<UpdErrorKind> for UpdErrCtx {
    fn from(kind: UpdErrorKind) -> UpdErrCtx {
        UpdErrCtx {
            kind,
            descr: String::new(),
        }
    }
}

impl Display for UpdErrCtx {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.descr.is_empty() {
            write!(f, "Error: {}", self.kind)
        } else {
            write!(f, "Error: {}, {}", self.kind, self.descr)
        }
    }
}

#[derive(Debug)]
pub struct UpdError {
    inner: Context<UpdErrCtx>,
}

impl Fail for UpdError {
    fn name(&self) -> Option<&str> {
        self.inner.name()
    }

    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for UpdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl UpdError {
    pub fn kind(&self) -> UpdErrorKind {
        self.inner.get_context().kind
    }

    pub fn from_remark(kind: UpdErrorKind, remark: &str) -> UpdError {
        UpdError {
            inner: Context::new(UpdErrCtx::from_remark(kind, remark)),
        }
    }

    // for errors that have already been reported through the logger
    pub fn displayed() -> UpdError {
        UpdError {
            inner: Context::new(UpdErrCtx::from(UpdErrorKind::Displayed)),
        }
    }
}

impl From<UpdErrorKind> for UpdError {
    fn from(kind: UpdErrorKind) -> UpdError {
        UpdError {
            inner: Context::new(UpdErrCtx::from(kind)),
        }
    }
}

impl From<UpdErrCtx> for UpdError {
    fn from(upd_ctx: UpdErrCtx) -> UpdError {
        UpdError {
            inner: Context::new(upd_ctx),
        }
    }
}

impl From<Context<UpdErrCtx>> for UpdError {
    fn from(inner: Context<UpdErrCtx>) -> UpdError {
        UpdError { inner }
    }
}

impl fmt::Debug for UpdErrCtx {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}
