//! Mount table. spec.md's `VfsMount { mount_point, root, mount_device,
//! private, fs_name, next }` forms a singly-linked list the original walks
//! front-to-back to find the longest matching prefix; a `Vec` sorted
//! longest-mount-point-first gives the same "most specific wins" lookup
//! without hand-rolled list splicing.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::fs::vfs::VfsNode;

pub struct Mount {
    pub mount_point: String,
    pub root: Arc<dyn VfsNode>,
    pub fs_name: &'static str,
}

static MOUNTS: Mutex<Vec<Mount>> = Mutex::new(Vec::new());

/// Installs `root` at `mount_point`, prepending like the original's
/// singly-linked list so the most recently mounted filesystem at a given
/// path shadows an earlier one, then re-sorts so the longest mount point
/// is tried first (the same effect as always searching "most specific
/// first" that a hand-walked list gets implicitly from mount order when
/// mounts are always at distinct, non-overlapping points).
pub fn mount(mount_point: &str, root: Arc<dyn VfsNode>, fs_name: &'static str) {
    let mut mounts = MOUNTS.lock();
    mounts.push(Mount { mount_point: String::from(mount_point), root, fs_name });
    mounts.sort_by(|a, b| b.mount_point.len().cmp(&a.mount_point.len()));
}

/// The mount whose `mount_point` is the longest prefix of `path`, along
/// with the remainder of `path` relative to that mount's root.
pub fn resolve_mount(path: &str) -> Option<(Arc<dyn VfsNode>, String)> {
    let mounts = MOUNTS.lock();
    for m in mounts.iter() {
        if m.mount_point == "/" {
            return Some((m.root.clone(), String::from(path.trim_start_matches('/'))));
        }
        if let Some(rest) = path.strip_prefix(m.mount_point.as_str()) {
            if rest.is_empty() || rest.starts_with('/') {
                return Some((m.root.clone(), String::from(rest.trim_start_matches('/'))));
            }
        }
    }
    None
}

pub fn list() -> Vec<(String, &'static str)> {
    MOUNTS.lock().iter().map(|m| (m.mount_point.clone(), m.fs_name)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::vfs::testing::null_node;

    #[test_case]
    fn longest_mount_point_wins() {
        mount("/", null_node(), "initramfs");
        mount("/dev", null_node(), "devfs");
        let (_, rest) = resolve_mount("/dev/tty0").unwrap();
        assert_eq!(rest, "tty0");
    }
}
