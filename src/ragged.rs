//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::collections::HashMap;

use ndarray::{Array2, ArrayView2};

use crate::device::{BufferId, Device};
use crate::error::{PlanError, RaggedIndexError};
use crate::signal::{BaseIndex, SignalIndex, SignalRegistry, View2};
use crate::util::cold_path;
use crate::util::index_vec::IndexVec;
use crate::ErrPack;

//--------------------------------------------------------------------------------------------------

/// Many matrices of different shapes packed into one buffer.
///
/// Item `i` is the strided matrix at `starts[i]` with shape `(shape0s[i], shape1s[i])`
/// and strides `(stride0s[i], stride1s[i])`. `stride0s` is the leading dimension.
/// Items may overlap. Appending never moves existing items.
#[derive(Debug, Clone, Default)]
pub struct RaggedArray<T: Copy + Default> {
	pub buf: Vec<T>,
	pub starts: Vec<usize>,
	pub shape0s: Vec<usize>,
	pub shape1s: Vec<usize>,
	pub stride0s: Vec<usize>,
	pub stride1s: Vec<usize>,
	pub names: Vec<String>,
}

impl<T: Copy + Default> RaggedArray<T> {
	pub fn new() -> Self {
		Self {
			buf: Vec::new(),
			starts: Vec::new(),
			shape0s: Vec::new(),
			shape1s: Vec::new(),
			stride0s: Vec::new(),
			stride1s: Vec::new(),
			names: Vec::new(),
		}
	}

	/// Copies every item, row-major and back to back, into a new buffer.
	pub fn pack<'a, I>(items: I) -> Self
	where
		I: IntoIterator<Item = ArrayView2<'a, T>>,
		T: 'a,
	{
		let mut result = Self::new();
		for item in items {
			let name = format!("item{}", result.len());
			result.push(name, item);
		}
		result
	}

	/// Appends a copy of `data` and returns its item index.
	pub fn push(&mut self, name: impl Into<String>, data: ArrayView2<T>) -> usize {
		let (rows, cols) = data.dim();
		let start = self.buf.len();
		self.buf.extend(data.iter().copied());
		self.add_item(name.into(), View2 {
			offset: start,
			shape: [rows, cols],
			strides: [cols, 1],
		})
	}

	/// Appends a list as an `(n, 1)` column.
	pub fn push_list(&mut self, name: impl Into<String>, data: &[T]) -> usize {
		let start = self.buf.len();
		self.buf.extend_from_slice(data);
		self.add_item(name.into(), View2 {
			offset: start,
			shape: [data.len(), 1],
			strides: [1, 1],
		})
	}

	/// Registers an item over data that is already in the buffer. Nothing is copied.
	pub fn append_view(&mut self, name: impl Into<String>, view: View2) -> Result<usize, RaggedIndexError> {
		if let Some((_, last)) = view.extent() {
			if last >= self.buf.len() {
				cold_path();
				return Err(RaggedIndexError);
			}
		}
		Ok(self.add_item(name.into(), view))
	}

	fn add_item(&mut self, name: String, view: View2) -> usize {
		let index = self.starts.len();
		self.starts.push(view.offset);
		self.shape0s.push(view.shape[0]);
		self.shape1s.push(view.shape[1]);
		self.stride0s.push(view.strides[0]);
		self.stride1s.push(view.strides[1]);
		self.names.push(name);
		index
	}

	pub fn item(&self, i: usize) -> Result<View2, RaggedIndexError> {
		if i >= self.len() {
			cold_path();
			return Err(RaggedIndexError);
		}
		Ok(View2 {
			offset: self.starts[i],
			shape: [self.shape0s[i], self.shape1s[i]],
			strides: [self.stride0s[i], self.stride1s[i]],
		})
	}

	/// Owned copy of item `i`.
	pub fn get(&self, i: usize) -> Result<Array2<T>, ErrPack<PlanError>> {
		let v = self.item(i)?;
		let data: Vec<T> = (0..v.shape[0])
			.flat_map(|r| (0..v.shape[1]).map(move |c| v.elem(r, c)))
			.map(|e| self.buf.get(e).copied().ok_or(RaggedIndexError))
			.collect::<Result<_, _>>()?;
		Ok(Array2::from_shape_vec((v.shape[0], v.shape[1]), data)?)
	}

	/// Item `i` flattened in row-major order.
	pub fn get_list(&self, i: usize) -> Result<Vec<T>, ErrPack<PlanError>> {
		Ok(self.get(i)?.iter().copied().collect())
	}

	pub fn set(&mut self, i: usize, value: ArrayView2<T>) -> Result<(), ErrPack<PlanError>> {
		let v = self.item(i)?;
		if value.dim() != (v.shape[0], v.shape[1]) {
			cold_path();
			return Err(ErrPack::new(
				PlanError::Shape,
				format!(
					"ragged item '{}' has shape {:?}, got {:?}",
					self.names[i],
					v.shape,
					value.shape()
				),
			));
		}
		for ((r, c), &x) in value.indexed_iter() {
			let e = v.elem(r, c);
			let Some(slot) = self.buf.get_mut(e) else {
				cold_path();
				return Err(RaggedIndexError.into());
			};
			*slot = x;
		}
		Ok(())
	}

	pub fn name(&self, i: usize) -> &str {
		self.names.get(i).map_or("", String::as_str)
	}

	pub fn len(&self) -> usize {
		self.starts.len()
	}

	pub fn is_empty(&self) -> bool {
		self.starts.is_empty()
	}
}

impl RaggedArray<f64> {
	/// Host to device.
	pub fn upload(&self, device: &dyn Device, buffer: BufferId) -> Result<(), ErrPack<PlanError>> {
		device.upload(buffer, 0, &self.buf)
	}

	/// Device to host.
	pub fn download(&mut self, device: &dyn Device, buffer: BufferId) -> Result<(), ErrPack<PlanError>> {
		device.download(buffer, 0, &mut self.buf)
	}
}

//--------------------------------------------------------------------------------------------------

/// Gives every signal (and every derived view kernels need) an item in the data array.
///
/// Bases are packed first, one item per base. Views are appended on demand and
/// deduplicated by their position in memory.
pub struct ViewBuilder<'a> {
	registry: &'a SignalRegistry,
	data: &'a mut RaggedArray<f64>,
	base_starts: IndexVec<BaseIndex, usize>,
	sidx: HashMap<SignalIndex, usize>,
	by_view: HashMap<View2, usize>,
}

impl<'a> ViewBuilder<'a> {
	/// Packs the initial value of every base into `data`, which must be empty.
	pub fn new(registry: &'a SignalRegistry, data: &'a mut RaggedArray<f64>) -> Self {
		let mut base_starts = IndexVec::with_capacity(registry.bases().len());
		let mut sidx = HashMap::new();
		let mut by_view = HashMap::new();
		for base in registry.bases() {
			let start = data.buf.len();
			base_starts.push(start);
			data.buf.extend_from_slice(&base.initial);

			let signal = &registry.signals()[base.signal];
			let mut view = signal.view.as_2d();
			view.offset += start;
			let item = data.add_item(signal.name.clone(), view);
			sidx.insert(base.signal, item);
			by_view.entry(view).or_insert(item);
		}
		Self { registry, data, base_starts, sidx, by_view }
	}

	/// Absolute position of a signal in the data buffer.
	pub fn view2(&self, sig: SignalIndex) -> Result<View2, ErrPack<PlanError>> {
		let signal = self.registry.signal(sig)?;
		let mut view = signal.view.as_2d();
		view.offset += self.base_starts[signal.base];
		Ok(view)
	}

	/// Item index of `sig`, appending a zero-copy view on first use.
	pub fn item(&mut self, sig: SignalIndex) -> Result<usize, ErrPack<PlanError>> {
		if let Some(&item) = self.sidx.get(&sig) {
			return Ok(item);
		}
		let view = self.view2(sig)?;
		let name = self.registry.name(sig).to_string();
		let item = self.derived(name, view)?;
		self.sidx.insert(sig, item);
		Ok(item)
	}

	/// Item index of an arbitrary view, such as a transposed signal.
	pub fn derived(&mut self, name: String, view: View2) -> Result<usize, ErrPack<PlanError>> {
		if let Some(&item) = self.by_view.get(&view) {
			return Ok(item);
		}
		let item = self.data.append_view(name, view)?;
		self.by_view.insert(view, item);
		Ok(item)
	}

	pub fn data(&self) -> &RaggedArray<f64> {
		self.data
	}

	pub fn registry(&self) -> &'a SignalRegistry {
		self.registry
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use ndarray::array;

	use super::*;

	#[test]
	fn test_round_trip() {
		let a = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
		let b = array![[7.0]];
		let c = Array2::<f64>::zeros((0, 4));
		let ra = RaggedArray::pack([a.view(), b.view(), c.view()]);
		assert_eq!(ra.len(), 3);
		assert_eq!(ra.get(0).unwrap(), a);
		assert_eq!(ra.get(1).unwrap(), b);
		assert_eq!(ra.get(2).unwrap().dim(), (0, 4));
		assert_eq!(ra.stride0s, vec![3, 1, 4]);

		let empty = RaggedArray::<f64>::pack(std::iter::empty());
		assert!(empty.is_empty());
		assert!(empty.get(0).is_err());
	}

	#[test]
	fn test_set_and_views() {
		let mut ra = RaggedArray::pack([array![[1.0, 2.0], [3.0, 4.0]].view()]);
		let t = ra
			.append_view("t", View2 { offset: 0, shape: [2, 2], strides: [1, 2] })
			.unwrap();
		assert_eq!(ra.get(t).unwrap(), array![[1.0, 3.0], [2.0, 4.0]]);

		ra.set(0, array![[5.0, 6.0], [7.0, 8.0]].view()).unwrap();
		assert_eq!(ra.get(t).unwrap(), array![[5.0, 7.0], [6.0, 8.0]]);

		let err = ra.set(0, array![[1.0, 2.0]].view()).unwrap_err();
		assert_eq!(err.code, PlanError::Shape);
		assert!(ra.append_view("oob", View2 { offset: 3, shape: [2, 1], strides: [1, 1] }).is_err());
	}

	#[test]
	fn test_index_lists() {
		let mut lists = RaggedArray::<u32>::new();
		let a = lists.push_list("a", &[3, 1, 4]);
		let b = lists.push_list("b", &[]);
		assert_eq!(lists.get_list(a).unwrap(), vec![3, 1, 4]);
		assert!(lists.get_list(b).unwrap().is_empty());
	}

	#[test]
	fn test_view_builder_dedups() {
		let mut reg = SignalRegistry::new();
		let x = reg.vector("x", &[1.0, 2.0]);
		let m = reg.add_array("m", &array![[1.0, 2.0], [3.0, 4.0]].into_dyn()).unwrap();
		let r1 = reg.row(m, 1).unwrap();
		let r1_again = reg.row(m, 1).unwrap();
		let mut data = RaggedArray::new();
		let mut vb = ViewBuilder::new(&reg, &mut data);
		assert_eq!(vb.item(x).unwrap(), 0);
		assert_eq!(vb.item(m).unwrap(), 1);
		let i = vb.item(r1).unwrap();
		assert_eq!(vb.item(r1_again).unwrap(), i);
		assert_eq!(vb.view2(r1).unwrap().offset, 4);
		assert_eq!(vb.data().get_list(i).unwrap(), vec![3.0, 4.0]);
	}
}
