// SPDX-License-Identifier: MIT

//! I/O primitives shared by the rcow disk-image stack: scatter/gather
//! vectors, big-endian slice accessors, 32-bit bit-scan helpers and a
//! positional file backend.

// === Core modules ===
pub mod bits;
pub mod error;
pub mod iovec;
mod macros;

// === Backend modules ===
mod file;

/// Big-endian element accessors over byte slices.
///
/// On-disk integers are big-endian throughout the stack; these helpers are
/// the only sanctioned way to move them in and out of table buffers.
pub mod be {
    crate::be_impl_element_rw!(u16, u32, u64);
}

// === Prelude re-exports (central entrypoint) ===
pub mod prelude {
    pub use super::be::*;
    pub use super::bits::*;
    pub use super::error::*;
    pub use super::file::{FileBackend, OpenMode};
    pub use super::iovec::{IOV_MAX, IoVec, IoVecMut};
}

pub use file::{FileBackend, OpenMode};
pub use iovec::{IOV_MAX, IoVec, IoVecMut};

#[cfg(test)]
mod be_tests {
    use super::be::*;

    #[test]
    fn test_element_indexing() {
        let mut buf = [0u8; 16];
        store_u64_be(&mut buf, 1, 0x0102_0304_0506_0708);
        assert_eq!(&buf[8..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(load_u64_be(&buf, 1), 0x0102_0304_0506_0708);
        assert_eq!(load_u64_be(&buf, 0), 0);

        store_u16_be(&mut buf, 0, 0xBEEF);
        assert_eq!(buf[0], 0xBE);
        assert_eq!(buf[1], 0xEF);
        assert_eq!(load_u16_be(&buf, 0), 0xBEEF);
    }
}
