//! Locked, self-wiping buffers for decrypted vault fragments.
//!
//! Audit tooling is the only reader of decrypted fragments. The plaintext is pinned in RAM
//! (`mlock` / `VirtualLock`) while alive and overwritten before the allocation is released.

/// Pins or unpins `[ptr, ptr+len)`. Returns false when the OS refused.
fn pin(ptr: *mut u8, len: usize, lock: bool) -> bool {
    if len == 0 {
        return true;
    }
    #[cfg(unix)]
    {
        let addr = ptr as *const libc::c_void;
        // SAFETY: `ptr` points at `len` initialized bytes owned by the caller's Vec.
        unsafe {
            if lock {
                libc::mlock(addr, len) == 0
            } else {
                libc::munlock(addr, len) == 0
            }
        }
    }
    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Memory::{VirtualLock, VirtualUnlock};
        let addr = ptr as *const core::ffi::c_void;
        // SAFETY: as above.
        unsafe {
            if lock {
                VirtualLock(addr, len) != 0
            } else {
                VirtualUnlock(addr, len) != 0
            }
        }
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (ptr, len, lock);
        true
    }
}

/// Plaintext that is pinned while alive and zeroed on drop.
pub struct LockedBuf {
    bytes: Vec<u8>,
    pinned: bool,
}

impl LockedBuf {
    pub fn new(mut bytes: Vec<u8>) -> Self {
        let pinned = pin(bytes.as_mut_ptr(), bytes.len(), true);
        if !pinned {
            tracing::warn!(
                target: "memtrust::secure_memory",
                len = bytes.len(),
                "could not pin decrypted fragment; it may reach swap"
            );
        }
        Self { bytes, pinned }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Borrow as UTF-8 if the fragment is valid text.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }
}

impl AsRef<[u8]> for LockedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for LockedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LockedBuf({} bytes)", self.bytes.len())
    }
}

impl Drop for LockedBuf {
    fn drop(&mut self) {
        for b in self.bytes.iter_mut() {
            // SAFETY: `b` is a valid, exclusively borrowed byte.
            unsafe { std::ptr::write_volatile(b, 0) };
        }
        std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
        if self.pinned {
            pin(self.bytes.as_mut_ptr(), self.bytes.len(), false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_contents_and_hides_them_from_debug() {
        let buf = LockedBuf::new(b"fragment".to_vec());
        assert_eq!(buf.as_str(), Some("fragment"));
        assert_eq!(buf.len(), 8);
        assert_eq!(format!("{:?}", buf), "LockedBuf(8 bytes)");
    }

    #[test]
    fn empty_buffer_is_fine() {
        let buf = LockedBuf::new(Vec::new());
        assert!(buf.is_empty());
    }
}
