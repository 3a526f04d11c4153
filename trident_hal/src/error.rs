//! HAL error types.

use thiserror::Error;

/// Errors raised by peripheral bring-up and DMA machinery.
///
/// Pin-level operations never fail (null pins are silent); everything here
/// happens at init or inside the DMA engine.
#[derive(Debug, Error)]
pub enum HalError {
    /// `/dev/mem` could not be opened or a peripheral window failed to map.
    #[error("failed to map {peripheral} via /dev/mem: {source}")]
    PeripheralMap {
        peripheral: &'static str,
        source: std::io::Error,
    },

    /// Effective UID is not root; `/dev/mem` needs it.
    #[error("process must run as root for /dev/mem access")]
    NotRoot,

    /// Page-aligned allocation for a DMA page failed.
    #[error("DMA page allocation failed")]
    PageAlloc,

    /// `mlock` refused to pin a DMA page.
    #[error("mlock failed: {0}")]
    PageLock(std::io::Error),

    /// `/proc/self/pagemap` could not be read or decoded.
    #[error("pagemap read failed: {0}")]
    Pagemap(String),

    /// The pagemap entry reports the page as not present.
    #[error("DMA page not resident according to pagemap")]
    PageNotPresent,

    /// DMA channel or ring construction failed.
    #[error("DMA setup failed: {0}")]
    DmaSetup(String),

    /// The DMA DEBUG register latched a bus error.
    #[error("DMA bus fault (DEBUG={bits:#x})")]
    BusFault { bits: u32 },
}
