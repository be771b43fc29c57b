//! # Internal Macros
//!
//! Accessor generation for zerocopy header structs that store multi-byte
//! fields as little-endian wrapper types (U32, U64).
//!
//! ## zerocopy_accessors!
//!
//! ```ignore
//! use zerocopy::little_endian::{U32, U64};
//!
//! #[repr(C)]
//! struct FileHeader {
//!     file_no: U32,
//!     max_lsn: U64,
//! }
//!
//! impl FileHeader {
//!     zerocopy_accessors! {
//!         file_no: u32,
//!         max_lsn: u64,
//!     }
//! }
//!
//! // Generates:
//! // pub fn file_no(&self) -> u32 { self.file_no.get() }
//! // pub fn set_file_no(&mut self, val: u32) { self.file_no = U32::new(val); }
//! // pub fn max_lsn(&self) -> u64 { self.max_lsn.get() }
//! // pub fn set_max_lsn(&mut self, val: u64) { self.max_lsn = U64::new(val); }
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
