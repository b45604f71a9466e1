//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::fmt::Write as _;
use std::rc::Rc;
use std::time::{Duration, Instant};

use ndarray::{ArrayD, IxDyn};

use crate::config::SimConfig;
use crate::device::{BufferId, Device, ExecutableId, Kernel};
use crate::error::{PlanError, execution_error};
use crate::graph::DepGraph;
use crate::operator::{OpIndex, Operator, compress_gemv};
use crate::planner::{OpGroup, Schedule};
use crate::ragged::{RaggedArray, ViewBuilder};
use crate::signal::{AliasCache, SignalIndex, SignalRegistry, View2};
use crate::util::cold_path;
use crate::util::index_vec::IndexVec;
use crate::ErrPack;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct GroupProfile {
	pub kernel: &'static str,
	pub items: usize,
	pub calls: u64,
	pub total: Duration,
}

/// A frozen plan plus the device state it runs on.
pub struct Simulator {
	config: SimConfig,
	registry: SignalRegistry,
	ops: IndexVec<OpIndex, Operator>,
	schedule: Schedule,
	device: Rc<dyn Device>,

	/// Host mirror of the device buffer.
	data: RaggedArray<f64>,
	host_stale: bool,

	/// Absolute position of every signal in the data buffer.
	signal_views: IndexVec<SignalIndex, View2>,

	buffer: BufferId,
	executables: Vec<ExecutableId>,
	profile: Vec<GroupProfile>,
	n_steps: u64,
}

impl Simulator {
	/// Builds the dependency graph, the schedule and one kernel per group,
	/// then uploads the initial signal values.
	pub fn new(
		registry: SignalRegistry,
		operators: Vec<Operator>,
		device: Rc<dyn Device>,
		config: SimConfig,
	) -> Result<Self, ErrPack<PlanError>> {
		if !(config.dt > 0.0 && config.dt.is_finite()) {
			cold_path();
			return Err(ErrPack::new(
				PlanError::InvalidConfig,
				format!("time step must be positive, got dt = {}", config.dt),
			));
		}

		let (ops, schedule) = {
			let mut alias = AliasCache::new(&registry, &config);
			let operators = if config.compress_gemv {
				compress_gemv(operators, &mut alias)?
			} else {
				operators
			};
			let ops: IndexVec<OpIndex, Operator> = IndexVec::from_vec(operators);

			let graph = DepGraph::build(&ops, &mut alias)?;
			let schedule =
				Schedule::plan(config.planner, &ops, &graph, &mut alias, config.chunk_size)?;
			if cfg!(debug_assertions) {
				schedule.validate(&graph, &ops, &mut alias)?;
			}
			if alias.ambiguous > 0 {
				log::warn!(
					"Simulator: overlap of {} signal pairs could not be decided, treated them as aliased",
					alias.ambiguous
				);
			}
			(ops, schedule)
		};

		let mut data = RaggedArray::new();
		let mut kernels = Vec::with_capacity(schedule.len());
		let mut signal_views = IndexVec::with_capacity(registry.len());
		{
			let mut views = ViewBuilder::new(&registry, &mut data);
			for group in &schedule.groups {
				let group_ops: Vec<&Operator> = group.ops.iter().map(|&op| &ops[op]).collect();
				kernels.push(Kernel::build(group.op_type, &group_ops, &mut views, config.dt)?);
			}
			for sig in registry.signals().indexes() {
				signal_views.push(views.view2(sig)?);
			}
		}

		let buffer = device.new_buffer(data.buf.len())?;
		data.upload(device.as_ref(), buffer)?;

		let mut executables = Vec::with_capacity(kernels.len());
		let mut profile = Vec::with_capacity(kernels.len());
		for kernel in kernels {
			profile.push(GroupProfile {
				kernel: kernel.name(),
				items: kernel.len(),
				..GroupProfile::default()
			});
			executables.push(device.compile(kernel)?);
		}

		log::info!(
			"Simulator: {} operators, {} groups, {} data items, {} values on {}",
			ops.len(),
			schedule.len(),
			data.len(),
			data.buf.len(),
			device.name()
		);

		Ok(Self {
			config,
			registry,
			ops,
			schedule,
			device,
			data,
			host_stale: false,
			signal_views,
			buffer,
			executables,
			profile,
			n_steps: 0,
		})
	}

	/// Runs every group once, waiting for each before dispatching the next.
	pub fn step(&mut self) -> Result<(), ErrPack<PlanError>> {
		let profiling = self.config.profiling;
		for (g, &exe) in self.executables.iter().enumerate() {
			let t0 = profiling.then(Instant::now);
			self.host_stale = true;
			let result = self
				.device
				.dispatch(exe, self.buffer)
				.and_then(|token| self.device.wait(token));
			if let Err(err) = result {
				cold_path();
				return Err(execution_error(
					format!(
						"step {}: group {g} ({}) failed",
						self.n_steps,
						self.profile.get(g).map_or("?", |p| p.kernel)
					),
					err,
				));
			}
			if let (Some(t0), Some(p)) = (t0, self.profile.get_mut(g)) {
				p.calls += 1;
				p.total += t0.elapsed();
			}
		}
		self.n_steps += 1;
		Ok(())
	}

	pub fn run_steps(&mut self, n: usize) -> Result<(), ErrPack<PlanError>> {
		for _ in 0..n {
			self.step()?;
		}
		Ok(())
	}

	/// Runs for `seconds` of simulated time, rounded to whole steps.
	#[allow(clippy::cast_possible_truncation)]
	#[allow(clippy::cast_sign_loss)]
	pub fn run(&mut self, seconds: f64) -> Result<(), ErrPack<PlanError>> {
		let steps = (seconds / self.config.dt).round().max(0.0) as usize;
		log::debug!("Simulator: running {steps} steps");
		self.run_steps(steps)
	}

	fn sync_host(&mut self) -> Result<(), ErrPack<PlanError>> {
		if self.host_stale {
			self.data.download(self.device.as_ref(), self.buffer)?;
			self.host_stale = false;
		}
		Ok(())
	}

	/// Current value of a signal, copied out after the last completed step.
	pub fn signal(&mut self, sig: SignalIndex) -> Result<ArrayD<f64>, ErrPack<PlanError>> {
		self.sync_host()?;
		let shape = self.registry.signal(sig)?.shape().to_vec();
		let v = self.signal_views[sig];
		let mut values = Vec::with_capacity(v.size());
		for i in 0..v.shape[0] {
			for j in 0..v.shape[1] {
				let Some(&x) = self.data.buf.get(v.elem(i, j)) else {
					cold_path();
					return Err(ErrPack::new(
						PlanError::InvalidView,
						format!("signal '{}' is outside of the data buffer", self.registry.name(sig)),
					));
				};
				values.push(x);
			}
		}
		Ok(ArrayD::from_shape_vec(IxDyn(&shape), values)?)
	}

	/// Overwrites a signal on the host and uploads the result.
	pub fn set_signal(&mut self, sig: SignalIndex, values: &ArrayD<f64>) -> Result<(), ErrPack<PlanError>> {
		let shape = self.registry.signal(sig)?.shape();
		if values.shape() != shape {
			cold_path();
			return Err(ErrPack::new(
				PlanError::Shape,
				format!(
					"signal '{}' has shape {shape:?}, got {:?}",
					self.registry.name(sig),
					values.shape()
				),
			));
		}
		self.sync_host()?;
		let v = self.signal_views[sig];
		let targets = (0..v.shape[0]).flat_map(|i| (0..v.shape[1]).map(move |j| v.elem(i, j)));
		for (e, &x) in targets.zip(values.iter()) {
			let Some(slot) = self.data.buf.get_mut(e) else {
				cold_path();
				return Err(ErrPack::new(
					PlanError::InvalidView,
					format!("signal '{}' is outside of the data buffer", self.registry.name(sig)),
				));
			};
			*slot = x;
		}
		self.data.upload(self.device.as_ref(), self.buffer)
	}

	pub fn n_steps(&self) -> u64 {
		self.n_steps
	}

	#[allow(clippy::cast_precision_loss)]
	pub fn time(&self) -> f64 {
		self.n_steps as f64 * self.config.dt
	}

	pub fn dt(&self) -> f64 {
		self.config.dt
	}

	pub fn op_groups(&self) -> &[OpGroup] {
		&self.schedule.groups
	}

	pub fn operators(&self) -> &IndexVec<OpIndex, Operator> {
		&self.ops
	}

	pub fn registry(&self) -> &SignalRegistry {
		&self.registry
	}

	pub fn profile(&self) -> &[GroupProfile] {
		&self.profile
	}

	/// One line per group, slowest first.
	pub fn profiling_report(&self) -> String {
		let mut order: Vec<usize> = (0..self.profile.len()).collect();
		order.sort_by(|&a, &b| self.profile[b].total.cmp(&self.profile[a].total));
		let mut report = String::new();
		let total: Duration = self.profile.iter().map(|p| p.total).sum();
		let _ = writeln!(
			report,
			"{} steps, {} groups, {:.6}s in kernels",
			self.n_steps,
			self.profile.len(),
			total.as_secs_f64()
		);
		for g in order {
			let p = &self.profile[g];
			if p.calls == 0 {
				continue;
			}
			let _ = writeln!(
				report,
				"group {g:4} {:16} items {:6} calls {:8} total {:.6}s",
				p.kernel,
				p.items,
				p.calls,
				p.total.as_secs_f64()
			);
		}
		report
	}
}
