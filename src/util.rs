//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

pub mod bitmap;
pub mod index_vec;

/// Marks the error branch as unlikely.
#[cold]
#[inline]
pub fn cold_path() {}
