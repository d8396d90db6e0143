//! Sink backend: swallows writes, never produces input.

use crate::chardev::{Chardev, Frontend, FrontendSlot};
use crate::error::Result;

#[derive(Default)]
pub struct NullChardev {
    frontend: FrontendSlot,
}

impl NullChardev {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Chardev for NullChardev {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(buf.len())
    }

    fn set_frontend(&mut self, frontend: Box<dyn Frontend>) -> Result<()> {
        self.frontend.set(frontend);
        Ok(())
    }
}
