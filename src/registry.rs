//! Process-wide open registry.
//!
//! fcntl locks do not nest across file descriptors: a second handle on the
//! same file inside one process would silently release the first handle's
//! locks on close. Every open registers its (device, inode) here and a
//! duplicate is refused with EBUSY.

use hashbrown::HashSet;
use parking_lot::Mutex;

static OPEN_FILES: Mutex<Option<HashSet<(u64, u64)>>> = Mutex::new(None);

/// Claim (dev, ino) for this process. Returns false if some other handle
/// already owns it.
pub fn register(dev: u64, ino: u64) -> bool {
    OPEN_FILES
        .lock()
        .get_or_insert_with(HashSet::new)
        .insert((dev, ino))
}

pub fn unregister(dev: u64, ino: u64) {
    if let Some(set) = OPEN_FILES.lock().as_mut() {
        set.remove(&(dev, ino));
    }
}
