// SPDX-License-Identifier: CC0-1.0

#![allow(non_camel_case_types)]

/// The C signed 32 bit integer type.
pub type c_int = i32;
/// The C unsigned 8 bit integer type.
pub type c_uchar = u8;
/// The C unsigned 32 bit integer type.
pub type c_uint = u32;
