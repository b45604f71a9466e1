//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use ndarray::Array2;

use crate::device::Device;
use crate::device::cpu::CPUDevice;
use crate::ragged::RaggedArray;
use crate::signal::View2;
use crate::{ErrPack, PlanError};

//--------------------------------------------------------------------------------------------------

#[allow(clippy::cast_precision_loss)]
fn item(n: usize) -> Array2<f64> {
	Array2::from_shape_fn((n, n + 1), |(i, j)| (100 * n + 10 * i + j) as f64)
}

#[test]
fn test_pack_and_read_back() -> Result<(), ErrPack<PlanError>> {
	for count in 0..5 {
		let items: Vec<Array2<f64>> = (0..count).map(item).collect();
		let ragged = RaggedArray::pack(items.iter().map(Array2::view));
		assert_eq!(ragged.len(), count);
		assert_eq!(ragged.buf.len(), items.iter().map(Array2::len).sum::<usize>());
		for (i, expected) in items.iter().enumerate() {
			assert_eq!(&ragged.get(i)?, expected);
		}
		assert_eq!(ragged.get(count).err().map(|e| e.code), Some(PlanError::InvalidView));
	}
	Ok(())
}

#[test]
fn test_device_round_trip() -> Result<(), ErrPack<PlanError>> {
	let mut ragged = RaggedArray::pack([item(2).view(), item(3).view()]);
	let column = ragged.append_view("col1", View2 { offset: 1, shape: [2, 1], strides: [3, 1] })?;

	let dev = CPUDevice::new("cpu".to_string());
	let buffer = dev.new_buffer(ragged.buf.len())?;
	ragged.upload(dev.as_ref(), buffer)?;

	ragged.set(0, Array2::zeros((2, 3)).view())?;
	assert_eq!(ragged.get_list(column)?, vec![0.0, 0.0]);

	ragged.download(dev.as_ref(), buffer)?;
	assert_eq!(ragged.get(0)?, item(2));
	assert_eq!(ragged.get_list(column)?, vec![201.0, 211.0]);
	Ok(())
}
