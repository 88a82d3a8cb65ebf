//! The key hash family.
//!
//! The table's placement math consumes a plain `usize`, and the hash of a
//! given key is part of the map's observable behavior (two keys collide or
//! they don't), so hashing goes through a dedicated trait rather than a
//! randomized [`std::hash::BuildHasher`]. The provided impls mirror the
//! family the table was designed around: integers hash to themselves,
//! pointers to their address, pairs to the xor of their halves, and strings
//! with the DJB2 multiply-by-33 loop.
//!
//! Custom key types implement [`LayerHash`] directly:
//!
//! ```
//! use layermap::LayerHash;
//!
//! struct OrderId(u64);
//!
//! impl LayerHash for OrderId {
//!     fn layer_hash(&self) -> usize {
//!         self.0.layer_hash()
//!     }
//! }
//! ```

/// A hash usable as a raw table index.
pub trait LayerHash {
    /// The key's hash value. Equal keys must hash equally.
    fn layer_hash(&self) -> usize;
}

macro_rules! identity_hash {
    ($($t:ty),*) => {
        $(
            impl LayerHash for $t {
                #[inline]
                fn layer_hash(&self) -> usize {
                    *self as usize
                }
            }
        )*
    };
}

identity_hash!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, char, bool);

impl<T> LayerHash for *const T {
    #[inline]
    fn layer_hash(&self) -> usize {
        *self as usize
    }
}

impl<T> LayerHash for *mut T {
    #[inline]
    fn layer_hash(&self) -> usize {
        *self as usize
    }
}

impl<A: LayerHash, B: LayerHash> LayerHash for (A, B) {
    #[inline]
    fn layer_hash(&self) -> usize {
        self.0.layer_hash() ^ self.1.layer_hash()
    }
}

impl LayerHash for str {
    /// DJB2 over the UTF-8 code units: `h = (h + c) * 33`, seeded with 5381.
    fn layer_hash(&self) -> usize {
        let mut hash = 5381usize;
        for &byte in self.as_bytes() {
            hash = hash.wrapping_add(byte as usize);
            hash = (hash << 5).wrapping_add(hash);
        }
        hash
    }
}

impl LayerHash for String {
    fn layer_hash(&self) -> usize {
        self.as_str().layer_hash()
    }
}

impl<T: LayerHash + ?Sized> LayerHash for &T {
    #[inline]
    fn layer_hash(&self) -> usize {
        (**self).layer_hash()
    }
}
