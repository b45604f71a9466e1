//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use smallvec::SmallVec;

use crate::error::PlanError;
use crate::operator::OpIndex;
use crate::signal::{AliasCache, SignalIndex};
use crate::util::bitmap::Bitmap;
use crate::util::index_vec::IndexVec;
use crate::ErrPack;

//--------------------------------------------------------------------------------------------------

pub type WriteSet = SmallVec<[SignalIndex; 2]>;

/// True if no write target of `a` aliases a write target of `b`.
pub fn writes_compatible(
	a: &[SignalIndex],
	b: &[SignalIndex],
	alias: &mut AliasCache,
) -> Result<bool, ErrPack<PlanError>> {
	for &wa in a {
		for &wb in b {
			if alias.shares_memory(wa, wb)? {
				return Ok(false);
			}
		}
	}
	Ok(true)
}

/// Splits `ops` into groups whose members have pairwise alias-free write sets.
///
/// `ops` is processed in blocks of `chunk_size`; groups never span two blocks.
/// Within a block, each group is seeded with the smallest remaining operator and
/// then takes every later operator compatible with all members so far.
pub fn group_by_concurrent_writes(
	ops: &[OpIndex],
	writes: &IndexVec<OpIndex, WriteSet>,
	alias: &mut AliasCache,
	chunk_size: usize,
) -> Result<Vec<Vec<OpIndex>>, ErrPack<PlanError>> {
	let mut groups = Vec::new();
	for chunk in ops.chunks(chunk_size.max(1)) {
		group_chunk(chunk, writes, alias, &mut groups)?;
	}
	Ok(groups)
}

fn group_chunk(
	chunk: &[OpIndex],
	writes: &IndexVec<OpIndex, WriteSet>,
	alias: &mut AliasCache,
	groups: &mut Vec<Vec<OpIndex>>,
) -> Result<(), ErrPack<PlanError>> {
	let n = chunk.len();
	let mut compatible = Bitmap::new(n, n);
	for i in 0..n {
		for j in i + 1..n {
			if writes_compatible(&writes[chunk[i]], &writes[chunk[j]], alias)? {
				compatible.set_symmetric(i, j);
			}
		}
	}

	let mut remaining = compatible.full_mask(n);
	for seed in 0..n {
		if !Bitmap::mask_bit(&remaining, seed) {
			continue;
		}
		Bitmap::clear_mask_bit(&mut remaining, seed);
		let mut candidates = remaining.clone();
		compatible.and_row_into(seed, &mut candidates);

		let mut group = vec![chunk[seed]];
		for j in seed + 1..n {
			if Bitmap::mask_bit(&candidates, j) {
				group.push(chunk[j]);
				Bitmap::clear_mask_bit(&mut remaining, j);
				compatible.and_row_into(j, &mut candidates);
			}
		}
		groups.push(group);
	}
	Ok(())
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use smallvec::smallvec;

	use super::*;
	use crate::config::SimConfig;
	use crate::signal::SignalRegistry;

	#[test]
	fn test_rows_group_together() {
		let mut reg = SignalRegistry::new();
		let m = reg.zeros("m", &[4, 3]).unwrap();
		let rows: Vec<SignalIndex> = (0..4).map(|i| reg.row(m, i).unwrap()).collect();
		let v = reg.zeros("v", &[3]).unwrap();

		// op 0..4 write rows, op 4 writes the whole matrix, op 5 writes row 0 again
		let mut writes: IndexVec<OpIndex, WriteSet> = IndexVec::new();
		for &r in &rows {
			writes.push(smallvec![r]);
		}
		writes.push(smallvec![m]);
		writes.push(smallvec![rows[0], v]);
		let ops: Vec<OpIndex> = writes.indexes().collect();

		let config = SimConfig::default();
		let mut alias = AliasCache::new(&reg, &config);
		let groups = group_by_concurrent_writes(&ops, &writes, &mut alias, 256).unwrap();
		let raw: Vec<Vec<usize>> =
			groups.iter().map(|g| g.iter().map(|op| op.raw).collect()).collect();
		assert_eq!(raw, vec![vec![0, 1, 2, 3], vec![4], vec![5]]);

		// blocks of two: {0, 1} {2, 3} {4} {5}
		let groups = group_by_concurrent_writes(&ops, &writes, &mut alias, 2).unwrap();
		assert_eq!(groups.len(), 4);
		assert!(groups.iter().all(|g| g.len() <= 2));
	}
}
