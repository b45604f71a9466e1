//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use crate::define_index_type;
use crate::error::{DeviceAllocError, PlanError};
use crate::operator::{OpType, Operator};
use crate::ragged::ViewBuilder;
use crate::signal::View2;
use crate::ErrPack;

pub mod cpu;
pub mod gemv;
pub mod neurons;

use gemv::GemvItem;
use neurons::{ElementwiseItem, LifItem, LifRateItem, TimeItem};

//--------------------------------------------------------------------------------------------------

define_index_type!(BufferId);
define_index_type!(ExecutableId);

/// Returned by `dispatch()`. The results are visible only after `wait()`.
#[derive(Debug)]
#[must_use]
pub struct CompletionToken {
	pub exe: ExecutableId,
	pub seq: u64,
}

/// Everything a backend needs to run one group: one item per operator,
/// all addresses resolved to absolute element offsets in the data buffer.
#[derive(Debug, Clone)]
pub enum Kernel {
	Gemv(Vec<GemvItem>),
	ElementwiseInc(Vec<ElementwiseItem>),
	TimeUpdate { dt: f64, items: Vec<TimeItem> },
	Lif { dt: f64, items: Vec<LifItem> },
	LifRate(Vec<LifRateItem>),
}

impl Kernel {
	pub fn name(&self) -> &'static str {
		match self {
			Self::Gemv(_) => "gemv",
			Self::ElementwiseInc(_) => "elementwise_inc",
			Self::TimeUpdate { .. } => "time_update",
			Self::Lif { .. } => "lif",
			Self::LifRate(_) => "lif_rate",
		}
	}

	pub fn len(&self) -> usize {
		match self {
			Self::Gemv(items) => items.len(),
			Self::ElementwiseInc(items) => items.len(),
			Self::TimeUpdate { items, .. } => items.len(),
			Self::Lif { items, .. } => items.len(),
			Self::LifRate(items) => items.len(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// One past the largest element offset any item touches.
	pub fn elems_needed(&self) -> usize {
		fn end(v: &View2) -> usize {
			v.extent().map_or(0, |(_, last)| last + 1)
		}
		match self {
			Self::Gemv(items) => items.iter().map(GemvItem::elems_needed).max(),
			Self::ElementwiseInc(items) => items.iter().map(|i| end(&i.a).max(end(&i.x)).max(end(&i.y))).max(),
			Self::TimeUpdate { items, .. } => items.iter().map(|i| i.step.max(i.time) + 1).max(),
			Self::Lif { items, .. } => items
				.iter()
				.map(|i| end(&i.j).max(end(&i.voltage)).max(end(&i.refractory)).max(end(&i.output)))
				.max(),
			Self::LifRate(items) => items.iter().map(|i| end(&i.j).max(end(&i.output))).max(),
		}
		.unwrap_or(0)
	}

	/// Resolves the operands of a group of same-type operators.
	pub fn build(
		op_type: OpType,
		ops: &[&Operator],
		views: &mut ViewBuilder,
		dt: f64,
	) -> Result<Self, ErrPack<PlanError>> {
		match op_type {
			OpType::Gemv => gemv::plan_gemv(ops, views),
			OpType::ElementwiseInc => neurons::plan_elementwise_inc(ops, views),
			OpType::TimeUpdate => neurons::plan_time_update(ops, views, dt),
			OpType::Lif => neurons::plan_lif(ops, views, dt),
			OpType::LifRate => neurons::plan_lif_rate(ops, views),
		}
	}
}

//--------------------------------------------------------------------------------------------------

/// A backend that owns data buffers and runs compiled kernels over them.
///
/// `dispatch()` may return before the kernel finishes. Callers must `wait()` on the
/// token before dispatching anything that depends on the results.
pub trait Device {
	fn name(&self) -> &str;

	/// Allocates a zeroed buffer of `elems` values.
	fn new_buffer(&self, elems: usize) -> Result<BufferId, DeviceAllocError>;

	fn upload(&self, buffer: BufferId, offset: usize, src: &[f64]) -> Result<(), ErrPack<PlanError>>;

	fn download(
		&self,
		buffer: BufferId,
		offset: usize,
		dst: &mut [f64],
	) -> Result<(), ErrPack<PlanError>>;

	fn compile(&self, kernel: Kernel) -> Result<ExecutableId, ErrPack<PlanError>>;

	fn dispatch(
		&self,
		exe: ExecutableId,
		buffer: BufferId,
	) -> Result<CompletionToken, ErrPack<PlanError>>;

	fn wait(&self, token: CompletionToken) -> Result<(), ErrPack<PlanError>>;
}
