//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//--------------------------------------------------------------------------------------------------

/// Dense row-major bit matrix.
pub struct Bitmap {
	pub rows: usize,
	pub words_per_row: usize,
	pub data: Vec<usize>,
}

#[allow(clippy::indexing_slicing)]
impl Bitmap {
	const WORD_BITS: usize = usize::BITS as usize;

	pub fn new(rows: usize, cols: usize) -> Self {
		let words_per_row = cols.div_ceil(Self::WORD_BITS);
		Self {
			rows,
			words_per_row,
			data: vec![0; rows * words_per_row],
		}
	}

	pub fn row(&self, row: usize) -> &[usize] {
		let offset = row * self.words_per_row;
		&self.data[offset..offset + self.words_per_row]
	}

	pub fn set_bit(&mut self, row: usize, col: usize) {
		let word_index = col / Self::WORD_BITS;
		let bit_index = col % Self::WORD_BITS;
		self.data[row * self.words_per_row + word_index] |= 1 << bit_index;
	}

	pub fn get_bit(&self, row: usize, col: usize) -> bool {
		let word_index = col / Self::WORD_BITS;
		let bit_index = col % Self::WORD_BITS;
		(self.data[row * self.words_per_row + word_index] >> bit_index) & 1 != 0
	}

	/// Sets both `(a, b)` and `(b, a)`.
	pub fn set_symmetric(&mut self, a: usize, b: usize) {
		self.set_bit(a, b);
		self.set_bit(b, a);
	}

	/// A row-sized mask with the first `cols` bits set.
	pub fn full_mask(&self, cols: usize) -> Vec<usize> {
		let mut mask = vec![0; self.words_per_row];
		for col in 0..cols {
			mask[col / Self::WORD_BITS] |= 1 << (col % Self::WORD_BITS);
		}
		mask
	}

	pub fn mask_bit(mask: &[usize], col: usize) -> bool {
		(mask[col / Self::WORD_BITS] >> (col % Self::WORD_BITS)) & 1 != 0
	}

	pub fn clear_mask_bit(mask: &mut [usize], col: usize) {
		mask[col / Self::WORD_BITS] &= !(1 << (col % Self::WORD_BITS));
	}

	/// `mask &= row`
	pub fn and_row_into(&self, row: usize, mask: &mut [usize]) {
		for (m, r) in mask.iter_mut().zip(self.row(row)) {
			*m &= *r;
		}
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_symmetric_bits() {
		let mut bm = Bitmap::new(70, 70);
		bm.set_symmetric(3, 68);
		assert!(bm.get_bit(3, 68));
		assert!(bm.get_bit(68, 3));
		assert!(!bm.get_bit(3, 67));

		let mut mask = vec![usize::MAX; bm.words_per_row];
		bm.and_row_into(3, &mut mask);
		assert_eq!(mask[0], 0);
		assert_eq!(mask[1], 1 << (68 - 64));

		let mut full = bm.full_mask(70);
		assert!(Bitmap::mask_bit(&full, 69));
		Bitmap::clear_mask_bit(&mut full, 69);
		assert!(!Bitmap::mask_bit(&full, 69));
		assert!(Bitmap::mask_bit(&full, 0));
	}
}
