//! Serial bridge trait.
//!
//! The radio tunnels its CI-V serial port over a separate UDP stream. The
//! bridge that exposes it to host applications (usually a pseudo-terminal)
//! is an external collaborator; the control stream only starts and stops it.

use async_trait::async_trait;

use crate::error::Result;

/// Virtual serial port exposed to host applications.
#[async_trait]
pub trait SerialBridge: Send {
    /// Start the bridge for the named radio (e.g. `"IC-705"`).
    async fn init(&mut self, device_name: &str) -> Result<()>;

    /// Stop the bridge. Must be safe to call when `init()` never ran.
    async fn deinit(&mut self);
}
