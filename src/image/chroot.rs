//! Scoped chroot entry.

use std::path::Path;
use std::process::ExitStatus;

use tracing::error;

use super::ImageContext;
use crate::error::Result;
use crate::host::Host;

/// Special filesystems bound into an [`ImageContext`] for as long as this
/// guard lives.
///
/// Call [`leave`](Self::leave) to see unbind errors; dropping the guard
/// unbinds too but can only log them.
pub struct ChrootGuard<'a> {
    host: &'a dyn Host,
    ctx: &'a mut ImageContext,
    active: bool,
}

impl<'a> ChrootGuard<'a> {
    pub fn enter(host: &'a dyn Host, ctx: &'a mut ImageContext) -> Result<Self> {
        ctx.enter_chroot(host)?;
        Ok(Self {
            host,
            ctx,
            active: true,
        })
    }

    pub fn root(&self) -> &Path {
        self.ctx.root()
    }

    pub fn context(&self) -> &ImageContext {
        self.ctx
    }

    pub fn host(&self) -> &'a dyn Host {
        self.host
    }

    /// Run `argv` inside the chroot.
    pub fn run(&self, argv: &[&str], env: &[(&str, &str)]) -> anyhow::Result<ExitStatus> {
        self.host.chroot(self.ctx.root(), argv, env)
    }

    pub fn leave(mut self) -> Result<()> {
        self.active = false;
        self.ctx.leave_chroot(self.host)
    }
}

impl Drop for ChrootGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.active = false;
            if let Err(e) = self.ctx.leave_chroot(self.host) {
                error!("Failed to leave chroot: {}", e);
            }
        }
    }
}
