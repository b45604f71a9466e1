//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::collections::HashMap;

use bit_set::BitSet;

use crate::config::{AliasPolicy, SimConfig};
use crate::error::PlanError;
use crate::signal::{BaseIndex, SignalIndex, SignalRegistry, View, View2};
use crate::util::cold_path;
use crate::ErrPack;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Overlap {
	No,
	Yes,
	Unknown,
}

/// Does any element of `a` coincide with an element of `b`?
///
/// Both views must be on the same base.
/// Strided views are compared element by element only while
/// `a.size() + b.size() <= exact_limit`.
pub fn view_overlap(a: &View, b: &View, exact_limit: usize) -> Overlap {
	let (a, b) = (a.as_2d(), b.as_2d());
	let (Some((a_lo, a_hi)), Some((b_lo, b_hi))) = (a.extent(), b.extent()) else {
		return Overlap::No;
	};
	if a_hi < b_lo || b_hi < a_lo {
		return Overlap::No;
	}
	if a == b {
		return Overlap::Yes;
	}
	if a.is_dense() {
		return hits_range(&b, a_lo, a_hi);
	}
	if b.is_dense() {
		return hits_range(&a, b_lo, b_hi);
	}
	if a.size() + b.size() > exact_limit {
		return Overlap::Unknown;
	}

	let lo = a_lo.max(b_lo);
	let hi = a_hi.min(b_hi);
	let mut touched = BitSet::with_capacity(hi - lo + 1);
	for_each_elem(&a, |e| {
		if (lo..=hi).contains(&e) {
			touched.insert(e - lo);
		}
		false
	});
	let found = for_each_elem(&b, |e| (lo..=hi).contains(&e) && touched.contains(e - lo));
	if found { Overlap::Yes } else { Overlap::No }
}

/// Calls `f` for every element offset. Stops early and returns true once `f` does.
fn for_each_elem(v: &View2, mut f: impl FnMut(usize) -> bool) -> bool {
	for i in 0..v.shape[0] {
		for j in 0..v.shape[1] {
			if f(v.elem(i, j)) {
				return true;
			}
		}
	}
	false
}

/// Does `v` touch any element in `lo..=hi`? Checked row by row without visiting every element.
fn hits_range(v: &View2, lo: usize, hi: usize) -> Overlap {
	// iterate over the dimension with the bigger stride, solve the inner one directly
	let (outer, inner) = if v.strides[0] >= v.strides[1] { (0, 1) } else { (1, 0) };
	let (n_inner, s_inner) = (v.shape[inner], v.strides[inner]);
	for k in 0..v.shape[outer] {
		let start = v.offset + k * v.strides[outer];
		if start > hi {
			break;
		}
		if n_inner == 0 {
			continue;
		}
		let first = if start >= lo {
			0
		} else if s_inner == 0 {
			continue;
		} else {
			(lo - start).div_ceil(s_inner)
		};
		if first < n_inner && start + first * s_inner <= hi {
			return Overlap::Yes;
		}
	}
	Overlap::No
}

//--------------------------------------------------------------------------------------------------

/// Memoized "may these two signals share memory" test.
///
/// Answers are symmetric. Both orders of a pair are cached when the first one is computed.
pub struct AliasCache<'r> {
	registry: &'r SignalRegistry,
	policy: AliasPolicy,
	exact_limit: usize,
	memo: HashMap<(BaseIndex, View, View), bool>,

	/// Number of pairs whose overlap could not be decided.
	pub ambiguous: usize,
}

impl<'r> AliasCache<'r> {
	pub fn new(registry: &'r SignalRegistry, config: &SimConfig) -> Self {
		Self {
			registry,
			policy: config.alias_policy,
			exact_limit: config.exact_overlap_limit,
			memo: HashMap::new(),
			ambiguous: 0,
		}
	}

	pub fn registry(&self) -> &'r SignalRegistry {
		self.registry
	}

	pub fn shares_memory(
		&mut self,
		a: SignalIndex,
		b: SignalIndex,
	) -> Result<bool, ErrPack<PlanError>> {
		let registry = self.registry;
		let sa = registry.signal(a)?;
		let sb = registry.signal(b)?;
		if sa.base != sb.base {
			return Ok(false);
		}
		if a == b {
			return Ok(sa.size() > 0);
		}
		let key = (sa.base, sa.view.clone(), sb.view.clone());
		if let Some(&answer) = self.memo.get(&key) {
			return Ok(answer);
		}
		let answer = match view_overlap(&sa.view, &sb.view, self.exact_limit) {
			Overlap::No => false,
			Overlap::Yes => true,
			Overlap::Unknown => {
				cold_path();
				self.ambiguous += 1;
				match self.policy {
					AliasPolicy::Conservative => {
						log::debug!(
							"AliasCache: overlap of '{}' and '{}' is unknown, assuming they alias",
							sa.name,
							sb.name
						);
						true
					},
					AliasPolicy::Strict => {
						return Err(ErrPack::new(
							PlanError::AliasingAmbiguity,
							format!("cannot decide whether '{}' and '{}' overlap", sa.name, sb.name),
						));
					},
				}
			},
		};
		self.memo.insert((sa.base, sb.view.clone(), sa.view.clone()), answer);
		self.memo.insert(key, answer);
		Ok(answer)
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	fn view(offset: usize, shape: &[usize], strides: &[usize]) -> View {
		View {
			offset,
			shape: shape.iter().copied().collect(),
			strides: strides.iter().copied().collect(),
		}
	}

	#[test]
	fn test_disjoint_and_identical() {
		let a = view(0, &[4], &[1]);
		let b = view(4, &[4], &[1]);
		assert_eq!(view_overlap(&a, &b, 100), Overlap::No);
		assert_eq!(view_overlap(&a, &a, 100), Overlap::Yes);
	}

	#[test]
	fn test_empty_never_aliases() {
		let a = view(0, &[0], &[1]);
		let b = view(0, &[4], &[1]);
		assert_eq!(view_overlap(&a, &b, 100), Overlap::No);
		assert_eq!(view_overlap(&b, &a, 100), Overlap::No);
	}

	#[test]
	fn test_interleaved() {
		// even and odd elements of the same vector
		let even = view(0, &[5], &[2]);
		let odd = view(1, &[5], &[2]);
		assert_eq!(view_overlap(&even, &odd, 100), Overlap::No);
		assert_eq!(view_overlap(&odd, &even, 100), Overlap::No);
		assert_eq!(view_overlap(&even, &odd, 4), Overlap::Unknown);

		let every_third = view(0, &[4], &[3]);
		assert_eq!(view_overlap(&even, &every_third, 100), Overlap::Yes);
	}

	#[test]
	fn test_dense_against_strided() {
		// column 1 of a 3x4 matrix against row 1
		let col = view(1, &[3], &[4]);
		let row = view(4, &[4], &[1]);
		assert_eq!(view_overlap(&col, &row, 0), Overlap::Yes);
		assert_eq!(view_overlap(&row, &col, 0), Overlap::Yes);

		// column 1 against elements 6..8 (gap between column entries)
		let mid = view(6, &[2], &[1]);
		assert_eq!(view_overlap(&col, &mid, 0), Overlap::No);
	}

	#[test]
	fn test_cache_is_symmetric() {
		let mut reg = SignalRegistry::new();
		let m = reg.zeros("m", &[3, 4]).unwrap();
		let r0 = reg.row(m, 0).unwrap();
		let r2 = reg.row(m, 2).unwrap();
		let t = reg.transpose(m).unwrap();
		let other = reg.zeros("other", &[12]).unwrap();
		let config = SimConfig::default();
		let mut cache = AliasCache::new(&reg, &config);
		for (a, b, expected) in [(r0, r2, false), (r0, t, true), (m, other, false), (r2, m, true)] {
			assert_eq!(cache.shares_memory(a, b).unwrap(), expected);
			assert_eq!(cache.shares_memory(b, a).unwrap(), expected);
		}
	}

	#[test]
	fn test_strict_policy_rejects_unknown() {
		let mut reg = SignalRegistry::new();
		let v = reg.zeros("v", &[10]).unwrap();
		let even = reg.add_view("even", v, 0, &[5], &[2]).unwrap();
		let odd = reg.add_view("odd", v, 1, &[5], &[2]).unwrap();
		let mut config = SimConfig::default().with_alias_policy(AliasPolicy::Strict);
		config.exact_overlap_limit = 4;
		let mut cache = AliasCache::new(&reg, &config);
		let err = cache.shares_memory(even, odd).unwrap_err();
		assert_eq!(err.code, PlanError::AliasingAmbiguity);

		let config = SimConfig { exact_overlap_limit: 4, ..SimConfig::default() };
		let mut cache = AliasCache::new(&reg, &config);
		assert!(cache.shares_memory(even, odd).unwrap());
		assert_eq!(cache.ambiguous, 1);
	}
}
