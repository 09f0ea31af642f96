//! The virtual filesystem: vnodes, the page cache, path resolution,
//! pipes, file descriptors, and the block capability.

pub mod block;
pub mod dirent;
pub mod file;
pub mod memfs;
pub mod page_cache;
pub mod path;
pub mod pipe;
pub mod vnode;

use alloc::sync::Arc;
use spin::Mutex;

use self::vnode::Vnode;

static ROOT: Mutex<Option<Arc<Vnode>>> = Mutex::new(None);

/// Install the system root vnode (the boot filesystem's root
/// directory)
pub fn set_root(root: Arc<Vnode>) {
    *ROOT.lock() = Some(root);
}

/// The system root vnode
pub fn root() -> Option<Arc<Vnode>> {
    ROOT.lock().clone()
}

pub fn init() {
    // The root arrives from the boot filesystem adapter; nothing else
    // to build eagerly. Page cache and descriptor tables are lazy.
    log::debug!("vfs ready");
}
