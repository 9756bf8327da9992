//! Process-wide default heap.
//!
//! Prefer passing an `Arc<HphaSchema>` around; this exists for code that has
//! no handle to thread through.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::{Descriptor, HeapError, HphaSchema, Result};

static DEFAULT_HEAP: RwLock<Option<Arc<HphaSchema>>> = RwLock::new(None);

/// Builds and installs the default heap. Fails with
/// [`HeapError::AlreadyInstalled`] while another one is installed.
pub fn install(desc: Descriptor) -> Result<Arc<HphaSchema>> {
    let mut slot = DEFAULT_HEAP.write();
    if slot.is_some() {
        return Err(HeapError::AlreadyInstalled);
    }

    let heap = Arc::new(HphaSchema::new(desc)?);
    *slot = Some(Arc::clone(&heap));

    log::debug!("Default heap installed");

    Ok(heap)
}

/// The installed default heap, if any.
pub fn get() -> Option<Arc<HphaSchema>> {
    DEFAULT_HEAP.read().clone()
}

/// Uninstalls the default heap and hands it back. The heap itself is dropped
/// once the last outstanding handle goes away.
pub fn teardown() -> Option<Arc<HphaSchema>> {
    let heap = DEFAULT_HEAP.write().take();
    if heap.is_some() {
        log::debug!("Default heap torn down");
    }
    heap
}
