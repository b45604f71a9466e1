//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::collections::HashMap;

use smallvec::{SmallVec, smallvec};
use thin_vec::{ThinVec, thin_vec};

use crate::define_index_type;
use crate::error::PlanError;
use crate::signal::{AliasCache, SignalIndex};
use crate::ErrPack;

//--------------------------------------------------------------------------------------------------

define_index_type!(OpIndex);

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Beta {
	Const(f64),

	/// Rank-1 signal with the same shape as `Y`, gathered every step.
	Signal(SignalIndex),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Dot {
	pub A: SignalIndex,
	pub X: SignalIndex,

	/// Use `X` transposed.
	pub x_t: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
	/// `Y <- gamma + beta * Y_in + alpha * sum(A_j . X_j)`
	Gemv {
		Y: SignalIndex,
		Y_in: SignalIndex,
		alpha: f64,
		beta: Beta,
		gamma: f64,
		as_update: bool,
		dots: SmallVec<[Dot; 2]>,
	},

	/// `Y += A * X` with size-1 broadcasting.
	ElementwiseInc { A: SignalIndex, X: SignalIndex, Y: SignalIndex },

	/// `step += 1; time = step * dt`
	TimeUpdate { step: SignalIndex, time: SignalIndex },

	Lif {
		J: SignalIndex,
		voltage: SignalIndex,
		refractory_time: SignalIndex,
		output: SignalIndex,
		tau_rc: f64,
		tau_ref: f64,
	},

	LifRate { J: SignalIndex, output: SignalIndex, tau_rc: f64, tau_ref: f64 },
}

/// Kind of an operator without its data. Only operators of the same type share a group.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpType {
	Gemv,
	ElementwiseInc,
	TimeUpdate,
	Lif,
	LifRate,
}

/// What an operator does to each signal it touches.
#[derive(Debug, Default, Clone)]
pub struct Intents {
	pub reads: ThinVec<SignalIndex>,
	pub sets: ThinVec<SignalIndex>,
	pub incs: ThinVec<SignalIndex>,
	pub updates: ThinVec<SignalIndex>,
}

impl Intents {
	/// Everything the operator writes: `sets`, `incs` and `updates`.
	pub fn writes(&self) -> impl Iterator<Item = SignalIndex> + '_ {
		self.sets.iter().chain(self.incs.iter()).chain(self.updates.iter()).copied()
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operator {
	pub kind: OpKind,
	pub tag: String,
}

impl Operator {
	pub fn new(kind: OpKind) -> Self {
		Self { kind, tag: String::new() }
	}

	pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
		self.tag = tag.into();
		self
	}

	/// Scales the dot products of a `Gemv`. Other kinds are returned unchanged.
	pub fn with_alpha(mut self, value: f64) -> Self {
		if let OpKind::Gemv { alpha, .. } = &mut self.kind {
			*alpha = value;
		}
		self
	}

	/// `dst <- value`
	pub fn reset(dst: SignalIndex, value: f64) -> Self {
		Self::new(OpKind::Gemv {
			Y: dst,
			Y_in: dst,
			alpha: 1.0,
			beta: Beta::Const(0.0),
			gamma: value,
			as_update: false,
			dots: SmallVec::new(),
		})
	}

	/// `dst <- src`. With `as_update`, the copy is visible only in the next step.
	pub fn copy(src: SignalIndex, dst: SignalIndex, as_update: bool) -> Self {
		Self::new(OpKind::Gemv {
			Y: dst,
			Y_in: src,
			alpha: 1.0,
			beta: Beta::Const(1.0),
			gamma: 0.0,
			as_update,
			dots: SmallVec::new(),
		})
	}

	/// `Y += A . X`
	pub fn dot_inc(A: SignalIndex, X: SignalIndex, Y: SignalIndex, x_t: bool) -> Self {
		Self::new(OpKind::Gemv {
			Y,
			Y_in: Y,
			alpha: 1.0,
			beta: Beta::Const(1.0),
			gamma: 0.0,
			as_update: false,
			dots: smallvec![Dot { A, X, x_t }],
		})
	}

	/// `Y <- beta * Y + A . X`, visible in the next step.
	pub fn prod_update(A: SignalIndex, X: SignalIndex, beta: Beta, Y: SignalIndex) -> Self {
		Self::new(OpKind::Gemv {
			Y,
			Y_in: Y,
			alpha: 1.0,
			beta,
			gamma: 0.0,
			as_update: true,
			dots: smallvec![Dot { A, X, x_t: false }],
		})
	}

	pub fn elementwise_inc(A: SignalIndex, X: SignalIndex, Y: SignalIndex) -> Self {
		Self::new(OpKind::ElementwiseInc { A, X, Y })
	}

	pub fn time_update(step: SignalIndex, time: SignalIndex) -> Self {
		Self::new(OpKind::TimeUpdate { step, time })
	}

	pub fn lif(
		J: SignalIndex,
		voltage: SignalIndex,
		refractory_time: SignalIndex,
		output: SignalIndex,
		tau_rc: f64,
		tau_ref: f64,
	) -> Self {
		Self::new(OpKind::Lif { J, voltage, refractory_time, output, tau_rc, tau_ref })
	}

	pub fn lif_rate(J: SignalIndex, output: SignalIndex, tau_rc: f64, tau_ref: f64) -> Self {
		Self::new(OpKind::LifRate { J, output, tau_rc, tau_ref })
	}

	pub fn op_type(&self) -> OpType {
		match self.kind {
			OpKind::Gemv { .. } => OpType::Gemv,
			OpKind::ElementwiseInc { .. } => OpType::ElementwiseInc,
			OpKind::TimeUpdate { .. } => OpType::TimeUpdate,
			OpKind::Lif { .. } => OpType::Lif,
			OpKind::LifRate { .. } => OpType::LifRate,
		}
	}

	/// A `Gemv` that only adds to `Y`.
	pub fn incs_y(&self) -> bool {
		match &self.kind {
			OpKind::Gemv { Y, Y_in, beta, as_update, .. } => {
				*beta == Beta::Const(1.0) && Y_in == Y && !as_update
			},
			_ => false,
		}
	}

	pub fn intents(&self) -> Intents {
		let mut result = Intents::default();
		match &self.kind {
			OpKind::Gemv { Y, Y_in, beta, as_update, dots, .. } => {
				result.reads.extend(dots.iter().map(|d| d.A));
				result.reads.extend(dots.iter().map(|d| d.X));
				if self.incs_y() {
					result.incs.push(*Y);
					return result;
				}
				match beta {
					Beta::Const(b) => {
						if *b != 0.0 && Y_in != Y {
							result.reads.push(*Y_in);
						}
					},
					Beta::Signal(b) => {
						result.reads.push(*b);
						if Y_in != Y {
							result.reads.push(*Y_in);
						}
					},
				}
				if *as_update {
					result.updates.push(*Y);
				} else {
					result.sets.push(*Y);
				}
			},
			OpKind::ElementwiseInc { A, X, Y } => {
				result.reads = thin_vec![*A, *X];
				result.incs.push(*Y);
			},
			OpKind::TimeUpdate { step, time } => {
				result.sets = thin_vec![*step, *time];
			},
			OpKind::Lif { J, voltage, refractory_time, output, .. } => {
				result.reads.push(*J);
				result.sets.push(*output);
				result.updates = thin_vec![*voltage, *refractory_time];
			},
			OpKind::LifRate { J, output, .. } => {
				result.reads.push(*J);
				result.sets.push(*output);
			},
		}
		result
	}
}

impl std::fmt::Display for Operator {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{:?}", self.op_type())?;
		if !self.tag.is_empty() {
			write!(f, "({})", self.tag)?;
		}
		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------

/// Folds every dot-increment of `Y` into the only non-update `Gemv` that sets `Y`.
///
/// Only increments with the setter's `alpha` are folded. A setter without dots takes
/// the `alpha` of the first foldable increment.
/// An increment whose `A` or `X` shares memory with `Y` must see the freshly set value,
/// so it stays a separate operator.
/// Ops keep their relative order; folded increments are removed.
/// When `Y` has more than one setter nothing is folded, the graph builder reports the conflict.
#[allow(clippy::float_cmp)]
pub fn compress_gemv(
	ops: Vec<Operator>,
	alias: &mut AliasCache,
) -> Result<Vec<Operator>, ErrPack<PlanError>> {
	let mut setters: HashMap<SignalIndex, Vec<usize>> = HashMap::new();
	let mut incs: HashMap<SignalIndex, Vec<usize>> = HashMap::new();
	for (i, op) in ops.iter().enumerate() {
		if let OpKind::Gemv { Y, as_update: false, .. } = op.kind {
			if op.incs_y() {
				incs.entry(Y).or_default().push(i);
			} else {
				setters.entry(Y).or_default().push(i);
			}
		}
	}

	let mut ops: Vec<Option<Operator>> = ops.into_iter().map(Some).collect();
	let mut folded = 0;
	let mut kept = 0;
	let mut keys: Vec<SignalIndex> = setters.keys().copied().collect();
	keys.sort_unstable();
	for y in keys {
		let (Some([setter]), Some(inc_list)) = (setters.get(&y).map(Vec::as_slice), incs.get(&y))
		else {
			continue;
		};

		let mut foldable: Vec<(usize, f64)> = Vec::with_capacity(inc_list.len());
		for &i in inc_list {
			let Some(Operator { kind: OpKind::Gemv { alpha, dots, .. }, .. }) = &ops[i] else {
				continue;
			};
			let mut reads_y = false;
			for dot in dots {
				if alias.shares_memory(dot.A, y)? || alias.shares_memory(dot.X, y)? {
					reads_y = true;
					break;
				}
			}
			if reads_y {
				kept += 1;
			} else {
				foldable.push((i, *alpha));
			}
		}

		let Some(Operator { kind: OpKind::Gemv { alpha: setter_alpha, dots: setter_dots, .. }, .. }) =
			&ops[*setter]
		else {
			continue;
		};
		let target_alpha = match foldable.first() {
			Some(&(_, first_alpha)) if setter_dots.is_empty() => first_alpha,
			_ => *setter_alpha,
		};

		let mut extra_dots: SmallVec<[Dot; 2]> = SmallVec::new();
		let mut extra_gamma = 0.0;
		for &(i, alpha) in &foldable {
			if alpha != target_alpha {
				continue;
			}
			if let Some(Operator { kind: OpKind::Gemv { dots, gamma, .. }, .. }) = ops[i].take() {
				extra_dots.extend(dots);
				extra_gamma += gamma;
				folded += 1;
			}
		}
		if let Some(Operator { kind: OpKind::Gemv { alpha, dots, gamma, .. }, .. }) = &mut ops[*setter] {
			if !extra_dots.is_empty() {
				*alpha = target_alpha;
			}
			dots.extend(extra_dots);
			*gamma += extra_gamma;
		}
	}
	if folded > 0 || kept > 0 {
		log::debug!(
			"compress_gemv: folded {folded} dot increments into their setters, {kept} read their own target"
		);
	}
	Ok(ops.into_iter().flatten().collect())
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::SimConfig;
	use crate::signal::SignalRegistry;

	fn sig(i: usize) -> SignalIndex {
		SignalIndex::new(i)
	}

	/// `n` unrelated scalars, so `sig(i)` never aliases `sig(j)` for `i != j`.
	fn scalars(n: usize) -> SignalRegistry {
		let mut reg = SignalRegistry::new();
		for i in 0..n {
			reg.scalar(format!("s{i}"), 0.0);
		}
		reg
	}

	fn compress(reg: &SignalRegistry, ops: Vec<Operator>) -> Vec<Operator> {
		let config = SimConfig::default();
		let mut alias = AliasCache::new(reg, &config);
		compress_gemv(ops, &mut alias).unwrap()
	}

	#[test]
	fn test_gemv_intents() {
		let reset = Operator::reset(sig(0), 1.5).intents();
		assert!(reset.reads.is_empty());
		assert_eq!(reset.sets.as_slice(), &[sig(0)]);

		let copy = Operator::copy(sig(1), sig(0), false).intents();
		assert_eq!(copy.reads.as_slice(), &[sig(1)]);
		assert_eq!(copy.sets.as_slice(), &[sig(0)]);

		let update = Operator::copy(sig(1), sig(0), true).intents();
		assert!(update.sets.is_empty());
		assert_eq!(update.updates.as_slice(), &[sig(0)]);

		let inc = Operator::dot_inc(sig(2), sig(3), sig(0), false).intents();
		assert_eq!(inc.reads.as_slice(), &[sig(2), sig(3)]);
		assert_eq!(inc.incs.as_slice(), &[sig(0)]);
		assert!(inc.sets.is_empty());

		let prod = Operator::prod_update(sig(2), sig(3), Beta::Signal(sig(4)), sig(0)).intents();
		assert_eq!(prod.reads.as_slice(), &[sig(2), sig(3), sig(4)]);
		assert_eq!(prod.updates.as_slice(), &[sig(0)]);
	}

	#[test]
	fn test_neuron_intents() {
		let lif = Operator::lif(sig(0), sig(1), sig(2), sig(3), 0.02, 0.002).intents();
		assert_eq!(lif.reads.as_slice(), &[sig(0)]);
		assert_eq!(lif.sets.as_slice(), &[sig(3)]);
		assert_eq!(lif.updates.as_slice(), &[sig(1), sig(2)]);
		assert_eq!(lif.writes().count(), 3);
	}

	#[test]
	fn test_compress_gemv() {
		let ops = vec![
			Operator::reset(sig(0), 0.0).with_tag("reset"),
			Operator::dot_inc(sig(1), sig(2), sig(0), false),
			Operator::time_update(sig(5), sig(6)),
			Operator::dot_inc(sig(3), sig(4), sig(0), true),
			Operator::dot_inc(sig(3), sig(4), sig(7), false),
		];
		let ops = compress(&scalars(8), ops);
		assert_eq!(ops.len(), 3);
		assert_eq!(ops[0].tag, "reset");
		let OpKind::Gemv { dots, .. } = &ops[0].kind else {
			panic!("expected gemv");
		};
		assert_eq!(dots.len(), 2);
		assert!(dots[1].x_t);
		assert_eq!(ops[1].op_type(), OpType::TimeUpdate);
		assert!(ops[2].incs_y());
	}

	#[test]
	fn test_compress_keeps_alpha() {
		let ops = vec![
			Operator::reset(sig(0), 0.5),
			Operator::dot_inc(sig(1), sig(2), sig(0), false).with_alpha(2.0),
			Operator::dot_inc(sig(3), sig(4), sig(0), false),
		];
		let ops = compress(&scalars(5), ops);
		assert_eq!(ops.len(), 2);
		let OpKind::Gemv { alpha, dots, gamma, .. } = &ops[0].kind else {
			panic!("expected gemv");
		};
		assert_eq!(*alpha, 2.0);
		assert_eq!(dots.len(), 1);
		assert_eq!(*gamma, 0.5);
		assert!(ops[1].incs_y());
	}

	#[test]
	fn test_compress_skips_double_setters() {
		let ops = vec![
			Operator::reset(sig(0), 0.0),
			Operator::reset(sig(0), 1.0),
			Operator::dot_inc(sig(1), sig(2), sig(0), false),
		];
		assert_eq!(compress(&scalars(3), ops).len(), 3);
	}

	#[test]
	fn test_compress_keeps_increments_reading_target() {
		let mut reg = SignalRegistry::new();
		let m = reg.zeros("m", &[2, 2]).unwrap();
		let r0 = reg.row(m, 0).unwrap();
		let a = reg.scalar("a", 2.0);
		let x = reg.vector("x", &[1.0, 1.0]);
		let ops = vec![
			Operator::reset(m, 1.0),
			Operator::dot_inc(a, m, m, false),
			Operator::dot_inc(r0, x, m, false).with_alpha(3.0),
		];
		let ops = compress(&reg, ops);
		assert_eq!(ops.len(), 3);
		let OpKind::Gemv { dots, alpha, .. } = &ops[0].kind else {
			panic!("expected gemv");
		};
		assert!(dots.is_empty());
		assert_eq!(*alpha, 1.0);
		assert!(ops[1..].iter().all(Operator::incs_y));
	}
}
