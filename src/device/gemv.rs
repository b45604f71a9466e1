//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use smallvec::SmallVec;

use crate::device::Kernel;
use crate::error::{PlanError, RaggedIndexError};
use crate::operator::{Beta, Dot, OpKind, Operator};
use crate::ragged::{RaggedArray, ViewBuilder};
use crate::signal::{SignalIndex, View2};
use crate::util::cold_path;
use crate::ErrPack;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum BetaView {
	Const(f64),
	Signal(View2),
}

/// One `A_j . X_j` term, already oriented so that `Y = A . X` (or a scalar product).
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum DotTerm {
	/// `A` is a single element at this offset.
	ScaleX { a: usize, x: View2 },

	/// `X` is a single element at this offset.
	ScaleA { a: View2, x: usize },

	MatMul { a: View2, x: View2 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GemvItem {
	pub y: View2,
	pub y_in: View2,
	pub alpha: f64,
	pub beta: BetaView,
	pub gamma: f64,
	pub dots: SmallVec<[DotTerm; 2]>,
}

fn end(v: &View2) -> usize {
	v.extent().map_or(0, |(_, last)| last + 1)
}

impl GemvItem {
	pub fn elems_needed(&self) -> usize {
		let mut result = end(&self.y).max(end(&self.y_in));
		if let BetaView::Signal(b) = &self.beta {
			result = result.max(end(b));
		}
		for dot in &self.dots {
			let dot_end = match dot {
				DotTerm::ScaleX { a, x } => (a + 1).max(end(x)),
				DotTerm::ScaleA { a, x } => end(a).max(x + 1),
				DotTerm::MatMul { a, x } => end(a).max(end(x)),
			};
			result = result.max(dot_end);
		}
		result
	}

	/// `y <- gamma + beta * y_in + alpha * sum(dots)`
	///
	/// The whole result is computed before anything is written,
	/// so `y` may overlap the inputs.
	#[allow(clippy::indexing_slicing)]
	pub fn run(&self, buf: &mut [f64], scratch: &mut Vec<f64>) {
		let [m, n] = self.y.shape;
		scratch.clear();
		scratch.resize(m * n, 0.0);
		for dot in &self.dots {
			match dot {
				DotTerm::ScaleX { a, x } => {
					let a = buf[*a];
					for i in 0..m {
						for j in 0..n {
							scratch[i * n + j] += a * buf[x.elem(i, j)];
						}
					}
				},
				DotTerm::ScaleA { a, x } => {
					let x = buf[*x];
					for i in 0..m {
						for j in 0..n {
							scratch[i * n + j] += buf[a.elem(i, j)] * x;
						}
					}
				},
				DotTerm::MatMul { a, x } => {
					let inner = a.shape[1];
					for i in 0..m {
						for j in 0..n {
							let mut sum = 0.0;
							for k in 0..inner {
								sum += buf[a.elem(i, k)] * buf[x.elem(k, j)];
							}
							scratch[i * n + j] += sum;
						}
					}
				},
			}
		}
		for i in 0..m {
			for j in 0..n {
				let beta = match self.beta {
					BetaView::Const(b) => b,
					BetaView::Signal(b) => buf[b.elem(i, j)],
				};
				let mut y = self.gamma + self.alpha * scratch[i * n + j];
				if beta != 0.0 {
					y += beta * buf[self.y_in.elem(i, j)];
				}
				scratch[i * n + j] = y;
			}
		}
		for i in 0..m {
			for j in 0..n {
				buf[self.y.elem(i, j)] = scratch[i * n + j];
			}
		}
	}
}

pub fn run_gemv(items: &[GemvItem], buf: &mut [f64]) {
	let mut scratch = Vec::new();
	for item in items {
		item.run(buf, &mut scratch);
	}
}

//--------------------------------------------------------------------------------------------------

/// Operands of a group of `Gemv` operators as item indexes into the data array.
///
/// The dot terms of operator `i` are `A_js[i][k] . X_js[i][k]`.
pub struct GemvPlan {
	pub Y: Vec<u32>,
	pub Y_in: Vec<u32>,
	pub alpha: Vec<f64>,
	pub beta: Vec<Option<u32>>,
	pub beta_const: Vec<f64>,
	pub gamma: Vec<f64>,
	pub A_js: RaggedArray<u32>,
	pub X_js: RaggedArray<u32>,
}

fn item_u32(item: usize) -> Result<u32, ErrPack<PlanError>> {
	u32::try_from(item).map_err(|_| {
		cold_path();
		ErrPack::from(RaggedIndexError)
	})
}

fn shape_error(op: &Operator, what: &str) -> ErrPack<PlanError> {
	cold_path();
	ErrPack::new(PlanError::Shape, format!("{op}: {what}"))
}

/// Orients one dot term and returns the data items of its operands.
fn orient_dot(
	op: &Operator,
	dot: &Dot,
	Y: SignalIndex,
	views: &mut ViewBuilder,
) -> Result<(usize, usize), ErrPack<PlanError>> {
	let registry = views.registry();
	let a_ndim = registry.signal(dot.A)?.ndim();
	let x_ndim = registry.signal(dot.X)?.ndim();
	let mut a = views.view2(dot.A)?;
	let mut x = views.view2(dot.X)?;
	let y = views.view2(Y)?;
	if dot.x_t {
		x = x.transposed();
	}

	if a.is_scalar() {
		if x.shape != y.shape {
			return Err(shape_error(
				op,
				&format!("scalar A needs X {:?} to match Y {:?}", x.shape, y.shape),
			));
		}
	} else if x.is_scalar() {
		if a.shape != y.shape {
			return Err(shape_error(
				op,
				&format!("scalar X needs A {:?} to match Y {:?}", a.shape, y.shape),
			));
		}
	} else {
		match (a_ndim, x_ndim, dot.x_t) {
			// vector . vector
			(1, 1, false) => a = a.transposed(),
			// vector . matrix == matrix.T . vector
			(1, 2, _) => (a, x) = (x.transposed(), a),
			_ => {},
		}
		if a.shape[1] != x.shape[0] || y.shape != [a.shape[0], x.shape[1]] {
			return Err(shape_error(
				op,
				&format!(
					"cannot multiply A {:?} by X {:?} into Y {:?}",
					a.shape, x.shape, y.shape
				),
			));
		}
	}

	let a_name = format!("{}{:?}", registry.name(dot.A), a.shape);
	let x_name = format!("{}{:?}", registry.name(dot.X), x.shape);
	Ok((views.derived(a_name, a)?, views.derived(x_name, x)?))
}

impl GemvPlan {
	pub fn new(ops: &[&Operator], views: &mut ViewBuilder) -> Result<Self, ErrPack<PlanError>> {
		let mut plan = Self {
			Y: Vec::with_capacity(ops.len()),
			Y_in: Vec::with_capacity(ops.len()),
			alpha: Vec::with_capacity(ops.len()),
			beta: Vec::with_capacity(ops.len()),
			beta_const: Vec::with_capacity(ops.len()),
			gamma: Vec::with_capacity(ops.len()),
			A_js: RaggedArray::new(),
			X_js: RaggedArray::new(),
		};
		for &op in ops {
			let OpKind::Gemv { Y, Y_in, alpha, beta, gamma, dots, .. } = &op.kind else {
				cold_path();
				return Err(ErrPack::new(
					PlanError::InvalidSignal,
					format!("{op} cannot run in a gemv group"),
				));
			};
			let registry = views.registry();
			let y_sig = registry.signal(*Y)?;
			let y_in_sig = registry.signal(*Y_in)?;
			if y_sig.shape() != y_in_sig.shape() {
				return Err(shape_error(
					op,
					&format!("Y_in {:?} does not match Y {:?}", y_in_sig.shape(), y_sig.shape()),
				));
			}
			match beta {
				Beta::Const(b) => {
					plan.beta.push(None);
					plan.beta_const.push(*b);
				},
				Beta::Signal(b) => {
					let b_sig = registry.signal(*b)?;
					if b_sig.ndim() != 1 || b_sig.shape() != y_sig.shape() {
						return Err(shape_error(
							op,
							&format!(
								"signal beta {:?} must be a vector shaped like Y {:?}",
								b_sig.shape(),
								y_sig.shape()
							),
						));
					}
					plan.beta.push(Some(item_u32(views.item(*b)?)?));
					plan.beta_const.push(0.0);
				},
			}
			plan.Y.push(item_u32(views.item(*Y)?)?);
			plan.Y_in.push(item_u32(views.item(*Y_in)?)?);
			plan.alpha.push(*alpha);
			plan.gamma.push(*gamma);

			let mut a_list: SmallVec<[u32; 4]> = SmallVec::new();
			let mut x_list: SmallVec<[u32; 4]> = SmallVec::new();
			for dot in dots {
				let (a, x) = orient_dot(op, dot, *Y, views)?;
				a_list.push(item_u32(a)?);
				x_list.push(item_u32(x)?);
			}
			plan.A_js.push_list(op.tag.as_str(), &a_list);
			plan.X_js.push_list(op.tag.as_str(), &x_list);
		}
		Ok(plan)
	}

	/// Looks up every index in `data` and classifies the dot terms.
	pub fn resolve(&self, data: &RaggedArray<f64>) -> Result<Vec<GemvItem>, ErrPack<PlanError>> {
		let view = |item: u32| data.item(item as usize);
		let mut items = Vec::with_capacity(self.Y.len());
		for i in 0..self.Y.len() {
			let beta = match self.beta[i] {
				Some(b) => BetaView::Signal(view(b)?),
				None => BetaView::Const(self.beta_const[i]),
			};
			let a_list = self.A_js.get_list(i)?;
			let x_list = self.X_js.get_list(i)?;
			let mut dots = SmallVec::new();
			for (&a, &x) in a_list.iter().zip(&x_list) {
				let (a, x) = (view(a)?, view(x)?);
				dots.push(if a.is_scalar() {
					DotTerm::ScaleX { a: a.offset, x }
				} else if x.is_scalar() {
					DotTerm::ScaleA { a, x: x.offset }
				} else {
					DotTerm::MatMul { a, x }
				});
			}
			items.push(GemvItem {
				y: view(self.Y[i])?,
				y_in: view(self.Y_in[i])?,
				alpha: self.alpha[i],
				beta,
				gamma: self.gamma[i],
				dots,
			});
		}
		Ok(items)
	}
}

pub fn plan_gemv(ops: &[&Operator], views: &mut ViewBuilder) -> Result<Kernel, ErrPack<PlanError>> {
	let plan = GemvPlan::new(ops, views)?;
	Ok(Kernel::Gemv(plan.resolve(views.data())?))
}

//--------------------------------------------------------------------------------------------------
