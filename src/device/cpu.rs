//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::device::{BufferId, CompletionToken, Device, ExecutableId, Kernel, gemv, neurons};
use crate::error::{DeviceAllocError, PlanError};
use crate::util::cold_path;
use crate::util::index_vec::IndexVec;
use crate::ErrPack;

//--------------------------------------------------------------------------------------------------

struct Executable {
	kernel: Kernel,
	elems_needed: usize,
}

/// Reference backend. Kernels run synchronously inside `dispatch()`.
pub struct CPUDevice {
	name: String,
	buffers: RefCell<IndexVec<BufferId, Vec<f64>>>,
	executables: RefCell<IndexVec<ExecutableId, Executable>>,
	dispatched: Cell<u64>,
	completed: Cell<u64>,
}

impl CPUDevice {
	pub fn new(name: String) -> Rc<Self> {
		Rc::new(Self {
			name,
			buffers: RefCell::new(IndexVec::new()),
			executables: RefCell::new(IndexVec::new()),
			dispatched: Cell::new(0),
			completed: Cell::new(0),
		})
	}

	fn range_error(&self, buffer: BufferId, offset: usize, len: usize) -> ErrPack<PlanError> {
		cold_path();
		ErrPack::new(
			PlanError::Execution,
			format!("{}: range {offset}..{} is outside of {buffer}", self.name, offset + len),
		)
	}
}

impl Device for CPUDevice {
	fn name(&self) -> &str {
		&self.name
	}

	fn new_buffer(&self, elems: usize) -> Result<BufferId, DeviceAllocError> {
		let mut data = Vec::new();
		if data.try_reserve_exact(elems).is_err() {
			cold_path();
			return Err(DeviceAllocError);
		}
		data.resize(elems, 0.0);
		Ok(self.buffers.borrow_mut().push(data))
	}

	fn upload(&self, buffer: BufferId, offset: usize, src: &[f64]) -> Result<(), ErrPack<PlanError>> {
		let mut buffers = self.buffers.borrow_mut();
		let dst = buffers
			.raw
			.get_mut(buffer.raw)
			.and_then(|b| b.get_mut(offset..offset + src.len()));
		let Some(dst) = dst else {
			return Err(self.range_error(buffer, offset, src.len()));
		};
		dst.copy_from_slice(src);
		Ok(())
	}

	fn download(
		&self,
		buffer: BufferId,
		offset: usize,
		dst: &mut [f64],
	) -> Result<(), ErrPack<PlanError>> {
		let buffers = self.buffers.borrow();
		let src = buffers.get(buffer).and_then(|b| b.get(offset..offset + dst.len()));
		let Some(src) = src else {
			return Err(self.range_error(buffer, offset, dst.len()));
		};
		dst.copy_from_slice(src);
		Ok(())
	}

	fn compile(&self, kernel: Kernel) -> Result<ExecutableId, ErrPack<PlanError>> {
		let elems_needed = kernel.elems_needed();
		log::debug!("{}: compiled {} with {} items", self.name, kernel.name(), kernel.len());
		Ok(self.executables.borrow_mut().push(Executable { kernel, elems_needed }))
	}

	fn dispatch(
		&self,
		exe: ExecutableId,
		buffer: BufferId,
	) -> Result<CompletionToken, ErrPack<PlanError>> {
		let executables = self.executables.borrow();
		let Some(executable) = executables.get(exe) else {
			cold_path();
			return Err(ErrPack::new(
				PlanError::Execution,
				format!("{}: unknown executable {exe}", self.name),
			));
		};
		let mut buffers = self.buffers.borrow_mut();
		let Some(buf) = buffers.raw.get_mut(buffer.raw) else {
			return Err(self.range_error(buffer, 0, executable.elems_needed));
		};
		if executable.elems_needed > buf.len() {
			return Err(self.range_error(buffer, 0, executable.elems_needed));
		}

		match &executable.kernel {
			Kernel::Gemv(items) => gemv::run_gemv(items, buf),
			Kernel::ElementwiseInc(items) => neurons::run_elementwise_inc(items, buf),
			Kernel::TimeUpdate { dt, items } => neurons::run_time_update(items, *dt, buf),
			Kernel::Lif { dt, items } => neurons::run_lif(items, *dt, buf),
			Kernel::LifRate(items) => neurons::run_lif_rate(items, buf),
		}

		let seq = self.dispatched.get() + 1;
		self.dispatched.set(seq);
		Ok(CompletionToken { exe, seq })
	}

	fn wait(&self, token: CompletionToken) -> Result<(), ErrPack<PlanError>> {
		if token.seq == 0 || token.seq > self.dispatched.get() {
			cold_path();
			return Err(ErrPack::new(
				PlanError::Execution,
				format!("{}: token {} of {} was never dispatched", self.name, token.seq, token.exe),
			));
		}
		self.completed.set(self.completed.get().max(token.seq));
		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------
