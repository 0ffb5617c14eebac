//! ABI shared between the host daemon and compiled transformer plug-ins.
//!
//! A transformer plug-in is a `cdylib` exporting `mysync_transform` and
//! (optionally) `mysync_free`. Entities cross the boundary as UTF-8 JSON
//! so plug-in authors never touch host-side types directly.

use std::os::raw::c_void;
use std::slice::from_raw_parts;
use std::str::from_utf8_unchecked;

/// A borrowed or owned byte view into a JSON document.
///
/// Mirrors `pgdog_plugin::bindings::PdStr`'s data/len pair so plug-in
/// authors who have used pgDog's plugin ABI find this familiar.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PdJson {
    pub data: *mut c_void,
    pub len: usize,
    /// Non-zero when `data` is a null entity (a delete).
    pub is_null: u8,
}

impl PdJson {
    pub fn null() -> Self {
        Self {
            data: std::ptr::null_mut(),
            len: 0,
            is_null: 1,
        }
    }
}

impl From<&str> for PdJson {
    fn from(value: &str) -> Self {
        Self {
            data: value.as_ptr() as *mut c_void,
            len: value.len(),
            is_null: 0,
        }
    }
}

impl From<&String> for PdJson {
    fn from(value: &String) -> Self {
        Self::from(value.as_str())
    }
}

impl PdJson {
    /// # Safety
    ///
    /// `data` must point at `len` valid, initialized UTF-8 bytes that
    /// outlive this borrow, or `is_null` must be non-zero.
    pub unsafe fn as_str(&self) -> Option<&str> {
        if self.is_null != 0 || self.data.is_null() {
            return None;
        }
        let slice = from_raw_parts(self.data as *const u8, self.len);
        Some(from_utf8_unchecked(slice))
    }
}

/// Context passed to a transformer plug-in for a single entity.
#[repr(C)]
pub struct TransformCtx {
    /// Peer name the entity originated from (outbound: this node's name).
    pub source: PdJson,
    /// Peer name the entity is headed to (inbound: this node's name).
    pub target: PdJson,
    /// Table the entity belongs to.
    pub table: PdJson,
    /// String form of the row's primary key.
    pub id: PdJson,
    /// The untransformed entity, JSON-encoded. `is_null` means a delete.
    pub entity: PdJson,
}

/// Function signature every transformer plug-in exports as
/// `mysync_transform`.
///
/// Returns the transformed entity (JSON-encoded) or a null `PdJson` for
/// "delete this row". The returned buffer, if non-null, must stay valid
/// until the host calls `mysync_free` on it (if the plug-in exports one).
pub type TransformFn = unsafe extern "C" fn(TransformCtx) -> PdJson;

/// Optional function signature a transformer plug-in exports as
/// `mysync_free` to reclaim a `PdJson` returned from `mysync_transform`.
pub type FreeFn = unsafe extern "C" fn(PdJson);

/// Current ABI version, bumped whenever `TransformCtx` or `PdJson`
/// change shape. Plug-ins export this as `mysync_abi_version`.
pub const ABI_VERSION: u32 = 1;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_str() {
        let s = String::from(r#"{"id":"u1"}"#);
        let json = PdJson::from(&s);
        let back = unsafe { json.as_str() }.unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn null_has_no_str() {
        let json = PdJson::null();
        assert!(unsafe { json.as_str() }.is_none());
    }
}
