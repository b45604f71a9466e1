//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::ops::Range;

use arrayvec::ArrayVec;
use ndarray::ArrayD;

use crate::define_index_type;
use crate::error::PlanError;
use crate::util::cold_path;
use crate::util::index_vec::IndexVec;
use crate::ErrPack;

pub mod alias;

pub use alias::{AliasCache, Overlap};

//--------------------------------------------------------------------------------------------------

pub const MAX_DIMS: usize = 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DType {
	F32,
	F64,
	I32,
}

define_index_type!(SignalIndex);
define_index_type!(BaseIndex);

//--------------------------------------------------------------------------------------------------

/// Where the elements of a signal live inside its base.
///
/// `offset` and `strides` are in elements of the base.
/// No element is visited twice; `SignalRegistry::add_view` rejects views that would.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct View {
	pub offset: usize,
	pub shape: ArrayVec<usize, MAX_DIMS>,
	pub strides: ArrayVec<usize, MAX_DIMS>,
}

impl View {
	/// Row-major contiguous view.
	pub fn contiguous(offset: usize, shape: &[usize]) -> Self {
		let mut strides = ArrayVec::new();
		match *shape {
			[] => {},
			[_] => strides.push(1),
			[_, cols] => {
				strides.push(cols.max(1));
				strides.push(1);
			},
			_ => unreachable!("contiguous(): shape rank checked by caller"),
		}
		Self {
			offset,
			shape: shape.iter().copied().collect(),
			strides,
		}
	}

	pub fn ndim(&self) -> usize {
		self.shape.len()
	}

	pub fn size(&self) -> usize {
		self.shape.iter().product()
	}

	/// Returns the view as 2-D: `()` is `(1, 1)` and `(n,)` is the column `(n, 1)`.
	pub fn as_2d(&self) -> View2 {
		match (self.shape.as_slice(), self.strides.as_slice()) {
			([m], [s0]) => View2 { offset: self.offset, shape: [*m, 1], strides: [*s0, 1] },
			([m, n], [s0, s1]) => View2 {
				offset: self.offset,
				shape: [*m, *n],
				strides: [*s0, *s1],
			},
			_ => View2 { offset: self.offset, shape: [1, 1], strides: [1, 1] },
		}
	}

	/// First and last element touched, or `None` for an empty view.
	pub fn extent(&self) -> Option<(usize, usize)> {
		self.as_2d().extent()
	}
}

/// A view seen as a (possibly strided) matrix. This is the form stored in ragged arrays.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct View2 {
	pub offset: usize,
	pub shape: [usize; 2],
	pub strides: [usize; 2],
}

impl View2 {
	pub fn size(&self) -> usize {
		self.shape[0] * self.shape[1]
	}

	pub fn is_scalar(&self) -> bool {
		self.shape == [1, 1]
	}

	pub fn transposed(&self) -> Self {
		Self {
			offset: self.offset,
			shape: [self.shape[1], self.shape[0]],
			strides: [self.strides[1], self.strides[0]],
		}
	}

	pub fn elem(&self, i: usize, j: usize) -> usize {
		self.offset + i * self.strides[0] + j * self.strides[1]
	}

	pub fn extent(&self) -> Option<(usize, usize)> {
		if self.size() == 0 {
			return None;
		}
		let last = self.elem(self.shape[0] - 1, self.shape[1] - 1);
		Some((self.offset, last))
	}

	/// True if two different `(i, j)` map to the same element.
	pub fn self_overlaps(&self) -> bool {
		let [m, n] = self.shape;
		let [s0, s1] = self.strides;
		if m <= 1 || n <= 1 {
			return (m > 1 && s0 == 0) || (n > 1 && s1 == 0);
		}
		if s0 == 0 || s1 == 0 {
			return true;
		}
		// smallest `di * s0 == dj * s1` with `di, dj > 0`
		let g = gcd(s0, s1);
		s1 / g < m && s0 / g < n
	}

	/// True if the view touches every element between its first and last one.
	pub fn is_dense(&self) -> bool {
		let mut dims: ArrayVec<(usize, usize), 2> = ArrayVec::new();
		for d in 0..2 {
			if self.shape[d] > 1 {
				dims.push((self.strides[d], self.shape[d]));
			}
		}
		match dims.as_slice() {
			[] => true,
			[(stride, _)] => *stride == 1,
			[a, b] => {
				let (inner, outer) = if a.0 <= b.0 { (a, b) } else { (b, a) };
				inner.0 == 1 && outer.0 == inner.1
			},
			_ => false,
		}
	}
}

fn gcd(mut a: usize, mut b: usize) -> usize {
	while b != 0 {
		(a, b) = (b, a % b);
	}
	a
}

//--------------------------------------------------------------------------------------------------

pub struct Signal {
	pub name: String,
	pub base: BaseIndex,
	pub view: View,
	pub dtype: DType,
}

impl Signal {
	pub fn shape(&self) -> &[usize] {
		&self.view.shape
	}

	pub fn ndim(&self) -> usize {
		self.view.ndim()
	}

	pub fn size(&self) -> usize {
		self.view.size()
	}
}

pub struct Base {
	/// The signal that owns the storage.
	pub signal: SignalIndex,
	pub elems: usize,
	pub initial: Vec<f64>,
}

/// Owns all base storage and describes every view into it.
#[derive(Default)]
pub struct SignalRegistry {
	signals: IndexVec<SignalIndex, Signal>,
	bases: IndexVec<BaseIndex, Base>,
}

impl SignalRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds a signal that owns `initial.len()` elements.
	pub fn add_base(
		&mut self,
		name: impl Into<String>,
		shape: &[usize],
		dtype: DType,
		initial: Vec<f64>,
	) -> Result<SignalIndex, ErrPack<PlanError>> {
		let name = name.into();
		if shape.len() > MAX_DIMS {
			cold_path();
			return Err(ErrPack::new(
				PlanError::Shape,
				format!("signal '{name}': rank {} is not supported", shape.len()),
			));
		}
		let elems: usize = shape.iter().product();
		if elems != initial.len() {
			cold_path();
			return Err(ErrPack::new(
				PlanError::Shape,
				format!(
					"signal '{name}': shape {shape:?} needs {elems} values, got {}",
					initial.len()
				),
			));
		}
		let signal = self.signals.next_index();
		let base = self.bases.push(Base { signal, elems, initial });
		self.signals.push(Signal {
			name,
			base,
			view: View::contiguous(0, shape),
			dtype,
		});
		Ok(signal)
	}

	pub fn add_array(
		&mut self,
		name: impl Into<String>,
		value: &ArrayD<f64>,
	) -> Result<SignalIndex, ErrPack<PlanError>> {
		let initial = value.iter().copied().collect();
		self.add_base(name, value.shape(), DType::F64, initial)
	}

	pub fn zeros(
		&mut self,
		name: impl Into<String>,
		shape: &[usize],
	) -> Result<SignalIndex, ErrPack<PlanError>> {
		let elems = shape.iter().product();
		self.add_base(name, shape, DType::F64, vec![0.0; elems])
	}

	pub fn scalar(&mut self, name: impl Into<String>, value: f64) -> SignalIndex {
		let signal = self.signals.next_index();
		let base = self.bases.push(Base { signal, elems: 1, initial: vec![value] });
		self.signals.push(Signal {
			name: name.into(),
			base,
			view: View::contiguous(0, &[]),
			dtype: DType::F64,
		})
	}

	pub fn vector(&mut self, name: impl Into<String>, values: &[f64]) -> SignalIndex {
		let signal = self.signals.next_index();
		let base = self.bases.push(Base {
			signal,
			elems: values.len(),
			initial: values.to_vec(),
		});
		self.signals.push(Signal {
			name: name.into(),
			base,
			view: View::contiguous(0, &[values.len()]),
			dtype: DType::F64,
		})
	}

	/// Adds a view with `offset` and `strides` counted in elements of `parent`'s base.
	pub fn add_view(
		&mut self,
		name: impl Into<String>,
		parent: SignalIndex,
		offset: usize,
		shape: &[usize],
		strides: &[usize],
	) -> Result<SignalIndex, ErrPack<PlanError>> {
		let name = name.into();
		let parent = self.signal(parent)?;
		if shape.len() > MAX_DIMS || shape.len() != strides.len() {
			cold_path();
			return Err(ErrPack::new(
				PlanError::InvalidView,
				format!("view '{name}': shape {shape:?} does not match strides {strides:?}"),
			));
		}
		let view = View {
			offset,
			shape: shape.iter().copied().collect(),
			strides: strides.iter().copied().collect(),
		};
		if view.as_2d().self_overlaps() {
			cold_path();
			return Err(ErrPack::new(
				PlanError::InvalidView,
				format!("view '{name}': strides {strides:?} would visit elements twice"),
			));
		}
		let base = parent.base;
		let dtype = parent.dtype;
		let elems = self.bases[base].elems;
		let last = view.extent().map_or(0, |(_, last)| last + 1);
		if last > elems {
			cold_path();
			return Err(ErrPack::new(
				PlanError::InvalidView,
				format!("view '{name}': element {} is outside of a base with {elems} elements", last - 1),
			));
		}
		Ok(self.signals.push(Signal { name, base, view, dtype }))
	}

	/// `parent[range]` of a 1-D signal.
	pub fn slice(
		&mut self,
		parent: SignalIndex,
		range: Range<usize>,
	) -> Result<SignalIndex, ErrPack<PlanError>> {
		let p = self.signal(parent)?;
		let ([len], [stride]) = (p.view.shape.as_slice(), p.view.strides.as_slice()) else {
			cold_path();
			return Err(ErrPack::new(
				PlanError::InvalidView,
				format!("slice(): signal '{}' is not 1-D", p.name),
			));
		};
		if range.start > range.end || range.end > *len {
			cold_path();
			return Err(ErrPack::new(
				PlanError::InvalidView,
				format!("slice(): range {range:?} out of bounds for '{}' of length {len}", p.name),
			));
		}
		let name = format!("{}[{}:{}]", p.name, range.start, range.end);
		let offset = p.view.offset + range.start * stride;
		let stride = *stride;
		self.add_view(name, parent, offset, &[range.len()], &[stride])
	}

	/// Row `i` of a 2-D signal.
	pub fn row(&mut self, parent: SignalIndex, i: usize) -> Result<SignalIndex, ErrPack<PlanError>> {
		let p = self.signal(parent)?;
		let ([rows, cols], [s0, s1]) = (p.view.shape.as_slice(), p.view.strides.as_slice()) else {
			cold_path();
			return Err(ErrPack::new(
				PlanError::InvalidView,
				format!("row(): signal '{}' is not 2-D", p.name),
			));
		};
		if i >= *rows {
			cold_path();
			return Err(ErrPack::new(
				PlanError::InvalidView,
				format!("row(): row {i} out of bounds for '{}' with {rows} rows", p.name),
			));
		}
		let name = format!("{}[{i}]", p.name);
		let (offset, cols, s1) = (p.view.offset + i * s0, *cols, *s1);
		self.add_view(name, parent, offset, &[cols], &[s1])
	}

	pub fn transpose(&mut self, parent: SignalIndex) -> Result<SignalIndex, ErrPack<PlanError>> {
		let p = self.signal(parent)?;
		let ([rows, cols], [s0, s1]) = (p.view.shape.as_slice(), p.view.strides.as_slice()) else {
			cold_path();
			return Err(ErrPack::new(
				PlanError::InvalidView,
				format!("transpose(): signal '{}' is not 2-D", p.name),
			));
		};
		let name = format!("{}.T", p.name);
		let (offset, shape, strides) = (p.view.offset, [*cols, *rows], [*s1, *s0]);
		self.add_view(name, parent, offset, &shape, &strides)
	}

	/// Reinterprets a dense row-major signal with a new shape.
	pub fn reshape(
		&mut self,
		parent: SignalIndex,
		shape: &[usize],
	) -> Result<SignalIndex, ErrPack<PlanError>> {
		let p = self.signal(parent)?;
		let v = p.view.as_2d();
		let row_major = v.shape[1] <= 1 || v.strides[1] == 1;
		if !v.is_dense() || !row_major || shape.iter().product::<usize>() != p.size() {
			cold_path();
			return Err(ErrPack::new(
				PlanError::InvalidView,
				format!("reshape(): cannot view '{}' {:?} as {shape:?}", p.name, p.shape()),
			));
		}
		if shape.len() > MAX_DIMS {
			cold_path();
			return Err(ErrPack::new(
				PlanError::Shape,
				format!("reshape(): rank {} is not supported", shape.len()),
			));
		}
		let name = format!("{}.reshape({shape:?})", p.name);
		let view = View::contiguous(p.view.offset, shape);
		let strides: ArrayVec<usize, MAX_DIMS> = view.strides;
		self.add_view(name, parent, view.offset, shape, &strides)
	}

	pub fn signal(&self, index: SignalIndex) -> Result<&Signal, ErrPack<PlanError>> {
		match self.signals.get(index) {
			Some(signal) => Ok(signal),
			None => {
				cold_path();
				Err(ErrPack::new(PlanError::InvalidSignal, format!("unknown signal {index}")))
			},
		}
	}

	pub fn name(&self, index: SignalIndex) -> &str {
		self.signals.get(index).map_or("<invalid>", |s| s.name.as_str())
	}

	pub fn is_view(&self, index: SignalIndex) -> bool {
		match self.signals.get(index) {
			Some(signal) => self.bases[signal.base].signal != index,
			None => false,
		}
	}

	pub fn signals(&self) -> &IndexVec<SignalIndex, Signal> {
		&self.signals
	}

	pub fn bases(&self) -> &IndexVec<BaseIndex, Base> {
		&self.bases
	}

	pub fn base(&self, index: BaseIndex) -> &Base {
		&self.bases[index]
	}

	pub fn len(&self) -> usize {
		self.signals.len()
	}

	pub fn is_empty(&self) -> bool {
		self.signals.is_empty()
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_views_stay_inside_base() {
		let mut reg = SignalRegistry::new();
		let m = reg.zeros("m", &[3, 4]).unwrap();
		let r = reg.row(m, 2).unwrap();
		assert_eq!(reg.signal(r).unwrap().view.offset, 8);
		assert!(reg.is_view(r));
		assert!(!reg.is_view(m));

		let t = reg.transpose(m).unwrap();
		assert_eq!(reg.signal(t).unwrap().shape(), &[4, 3]);
		assert_eq!(reg.signal(t).unwrap().view.as_2d().strides, [1, 4]);

		let err = reg.add_view("bad", m, 10, &[3], &[1]).unwrap_err();
		assert_eq!(err.code, PlanError::InvalidView);
		assert!(reg.row(m, 3).is_err());
	}

	#[test]
	fn test_self_overlapping_views_are_rejected() {
		let mut reg = SignalRegistry::new();
		let v = reg.zeros("v", &[16]).unwrap();
		for (shape, strides) in [([2, 2], [1, 1]), ([3, 2], [1, 2]), ([2, 2], [0, 1])] {
			let err = reg.add_view("bad", v, 0, &shape, &strides).unwrap_err();
			assert_eq!(err.code, PlanError::InvalidView);
		}
		assert!(reg.add_view("zero", v, 0, &[3], &[0]).is_err());

		// strides 2 and 3 first meet at element 6, outside a 2x3 view
		assert!(reg.add_view("skew", v, 0, &[2, 3], &[2, 3]).is_ok());
		assert!(reg.add_view("skew", v, 0, &[4, 3], &[2, 3]).is_err());
		assert!(reg.add_view("bcast", v, 0, &[1, 4], &[0, 1]).is_ok());
		assert!(reg.add_view("cols", v, 0, &[4, 2], &[2, 1]).is_ok());
	}

	#[test]
	fn test_rank_limit() {
		let mut reg = SignalRegistry::new();
		let err = reg.zeros("cube", &[2, 2, 2]).unwrap_err();
		assert_eq!(err.code, PlanError::Shape);
	}

	#[test]
	fn test_dense() {
		let v = View2 { offset: 0, shape: [3, 4], strides: [4, 1] };
		assert!(v.is_dense());
		assert!(v.transposed().is_dense());
		let v = View2 { offset: 0, shape: [3, 2], strides: [4, 1] };
		assert!(!v.is_dense());
		let v = View2 { offset: 5, shape: [1, 1], strides: [1, 1] };
		assert!(v.is_dense());
	}

	#[test]
	fn test_reshape() {
		let mut reg = SignalRegistry::new();
		let v = reg.vector("v", &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
		let m = reg.reshape(v, &[2, 3]).unwrap();
		assert_eq!(reg.signal(m).unwrap().view.as_2d().strides, [3, 1]);
		let t = reg.transpose(m).unwrap();
		assert!(reg.reshape(t, &[6]).is_err());
	}
}
