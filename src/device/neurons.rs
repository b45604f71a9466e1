//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use crate::device::Kernel;
use crate::error::PlanError;
use crate::operator::{OpKind, Operator};
use crate::ragged::ViewBuilder;
use crate::signal::{SignalIndex, View2};
use crate::util::cold_path;
use crate::ErrPack;

//--------------------------------------------------------------------------------------------------

/// `y += a * x`, where a size-1 dimension of `a` or `x` is broadcast.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ElementwiseItem {
	pub a: View2,
	pub x: View2,
	pub y: View2,
}

/// Offsets of the `step` and `time` scalars.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimeItem {
	pub step: usize,
	pub time: usize,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct LifItem {
	pub j: View2,
	pub voltage: View2,
	pub refractory: View2,
	pub output: View2,
	pub tau_rc: f64,
	pub tau_ref: f64,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct LifRateItem {
	pub j: View2,
	pub output: View2,
	pub tau_rc: f64,
	pub tau_ref: f64,
}

//--------------------------------------------------------------------------------------------------

fn wrong_group(op: &Operator, group: &str) -> ErrPack<PlanError> {
	cold_path();
	ErrPack::new(PlanError::InvalidSignal, format!("{op} cannot run in a {group} group"))
}

fn shape_error(op: &Operator, what: String) -> ErrPack<PlanError> {
	cold_path();
	ErrPack::new(PlanError::Shape, format!("{op}: {what}"))
}

/// The view of `sig`, registered in the data array so it is packed with the plan.
fn operand(views: &mut ViewBuilder, sig: SignalIndex) -> Result<View2, ErrPack<PlanError>> {
	views.item(sig)?;
	views.view2(sig)
}

/// Same shape as `reference`.
fn check_same(
	op: &Operator,
	name: &str,
	v: &View2,
	reference: &View2,
) -> Result<(), ErrPack<PlanError>> {
	if v.shape != reference.shape {
		return Err(shape_error(
			op,
			format!("{name} {:?} does not match {:?}", v.shape, reference.shape),
		));
	}
	Ok(())
}

pub fn plan_elementwise_inc(
	ops: &[&Operator],
	views: &mut ViewBuilder,
) -> Result<Kernel, ErrPack<PlanError>> {
	let mut items = Vec::with_capacity(ops.len());
	for &op in ops {
		let OpKind::ElementwiseInc { A, X, Y } = op.kind else {
			return Err(wrong_group(op, "elementwise_inc"));
		};
		let item = ElementwiseItem {
			a: operand(views, A)?,
			x: operand(views, X)?,
			y: operand(views, Y)?,
		};
		for (name, v) in [("A", &item.a), ("X", &item.x)] {
			for d in 0..2 {
				if v.shape[d] != 1 && v.shape[d] != item.y.shape[d] {
					return Err(shape_error(
						op,
						format!("{name} {:?} cannot broadcast to Y {:?}", v.shape, item.y.shape),
					));
				}
			}
		}
		items.push(item);
	}
	Ok(Kernel::ElementwiseInc(items))
}

pub fn plan_time_update(
	ops: &[&Operator],
	views: &mut ViewBuilder,
	dt: f64,
) -> Result<Kernel, ErrPack<PlanError>> {
	let mut items = Vec::with_capacity(ops.len());
	for &op in ops {
		let OpKind::TimeUpdate { step, time } = op.kind else {
			return Err(wrong_group(op, "time_update"));
		};
		let step = operand(views, step)?;
		let time = operand(views, time)?;
		if step.size() != 1 || time.size() != 1 {
			return Err(shape_error(op, "step and time must be scalars".to_string()));
		}
		items.push(TimeItem { step: step.offset, time: time.offset });
	}
	Ok(Kernel::TimeUpdate { dt, items })
}

pub fn plan_lif(
	ops: &[&Operator],
	views: &mut ViewBuilder,
	dt: f64,
) -> Result<Kernel, ErrPack<PlanError>> {
	let mut items = Vec::with_capacity(ops.len());
	for &op in ops {
		let OpKind::Lif { J, voltage, refractory_time, output, tau_rc, tau_ref } = op.kind else {
			return Err(wrong_group(op, "lif"));
		};
		let item = LifItem {
			j: operand(views, J)?,
			voltage: operand(views, voltage)?,
			refractory: operand(views, refractory_time)?,
			output: operand(views, output)?,
			tau_rc,
			tau_ref,
		};
		check_same(op, "voltage", &item.voltage, &item.j)?;
		check_same(op, "refractory_time", &item.refractory, &item.j)?;
		check_same(op, "output", &item.output, &item.j)?;
		items.push(item);
	}
	Ok(Kernel::Lif { dt, items })
}

pub fn plan_lif_rate(ops: &[&Operator], views: &mut ViewBuilder) -> Result<Kernel, ErrPack<PlanError>> {
	let mut items = Vec::with_capacity(ops.len());
	for &op in ops {
		let OpKind::LifRate { J, output, tau_rc, tau_ref } = op.kind else {
			return Err(wrong_group(op, "lif_rate"));
		};
		let item = LifRateItem {
			j: operand(views, J)?,
			output: operand(views, output)?,
			tau_rc,
			tau_ref,
		};
		check_same(op, "output", &item.output, &item.j)?;
		items.push(item);
	}
	Ok(Kernel::LifRate(items))
}

//--------------------------------------------------------------------------------------------------

fn broadcast(v: &View2, i: usize, j: usize) -> usize {
	let i = if v.shape[0] == 1 { 0 } else { i };
	let j = if v.shape[1] == 1 { 0 } else { j };
	v.elem(i, j)
}

#[allow(clippy::indexing_slicing)]
pub fn run_elementwise_inc(items: &[ElementwiseItem], buf: &mut [f64]) {
	for item in items {
		let [m, n] = item.y.shape;
		for i in 0..m {
			for j in 0..n {
				let inc = buf[broadcast(&item.a, i, j)] * buf[broadcast(&item.x, i, j)];
				buf[item.y.elem(i, j)] += inc;
			}
		}
	}
}

#[allow(clippy::indexing_slicing)]
pub fn run_time_update(items: &[TimeItem], dt: f64, buf: &mut [f64]) {
	for item in items {
		let step = buf[item.step] + 1.0;
		buf[item.step] = step;
		buf[item.time] = step * dt;
	}
}

/// One step of a leaky integrate-and-fire neuron.
///
/// Returns the new voltage, the new refractory time and whether it spiked.
pub fn lif_step(j: f64, v: f64, w: f64, dt: f64, tau_rc: f64, tau_ref: f64) -> (f64, f64, bool) {
	let dv = -(-dt / tau_rc).exp_m1() * (j - v);
	let mut v = v + dv;
	let mut w = w - dt;

	if v < 0.0 || w > dt {
		v = 0.0;
	} else if w >= 0.0 {
		v *= 1.0 - w / dt;
	}

	if v > 1.0 {
		let overshoot = dt * (v - 1.0) / dv;
		w = tau_ref - overshoot + dt;
		return (0.0, w, true);
	}
	(v, w, false)
}

/// Steady-state firing rate of a LIF neuron driven by a constant current.
pub fn lif_rate(j: f64, tau_rc: f64, tau_ref: f64) -> f64 {
	let j = (j - 1.0).max(0.0);
	1.0 / (tau_ref + tau_rc * (1.0 / j).ln_1p())
}

#[allow(clippy::indexing_slicing)]
pub fn run_lif(items: &[LifItem], dt: f64, buf: &mut [f64]) {
	for item in items {
		let [m, n] = item.j.shape;
		for r in 0..m {
			for c in 0..n {
				let (v, w, spiked) = lif_step(
					buf[item.j.elem(r, c)],
					buf[item.voltage.elem(r, c)],
					buf[item.refractory.elem(r, c)],
					dt,
					item.tau_rc,
					item.tau_ref,
				);
				buf[item.voltage.elem(r, c)] = v;
				buf[item.refractory.elem(r, c)] = w;
				buf[item.output.elem(r, c)] = if spiked { 1.0 / dt } else { 0.0 };
			}
		}
	}
}

#[allow(clippy::indexing_slicing)]
pub fn run_lif_rate(items: &[LifRateItem], buf: &mut [f64]) {
	for item in items {
		let [m, n] = item.j.shape;
		for r in 0..m {
			for c in 0..n {
				buf[item.output.elem(r, c)] = lif_rate(buf[item.j.elem(r, c)], item.tau_rc, item.tau_ref);
			}
		}
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use assert_approx_eq::assert_approx_eq;

	use super::*;

	#[test]
	fn test_lif_below_threshold() {
		let (v, w, spiked) = lif_step(0.5, 0.0, 0.0, 0.001, 0.02, 0.002);
		assert!(!spiked);
		assert_approx_eq!(v, 0.5 * -(-0.05f64).exp_m1());
		assert_approx_eq!(w, -0.001);
	}

	#[test]
	fn test_lif_spikes_and_rests() {
		let (v, w, spiked) = lif_step(10.0, 0.99, 0.0, 0.001, 0.02, 0.002);
		assert!(spiked);
		assert_approx_eq!(v, 0.0);
		assert!(w > 0.002 && w <= 0.003);

		// refractory: voltage is clamped to zero while w > dt
		let (v, _, spiked) = lif_step(10.0, 0.0, w, 0.001, 0.02, 0.002);
		assert!(!spiked);
		assert_approx_eq!(v, 0.0);
	}

	#[test]
	fn test_lif_rate() {
		assert_approx_eq!(lif_rate(0.5, 0.02, 0.002), 0.0);
		assert_approx_eq!(lif_rate(1.0, 0.02, 0.002), 0.0);
		let r = lif_rate(2.0, 0.02, 0.002);
		assert_approx_eq!(r, 1.0 / (0.002 + 0.02 * 2f64.ln()));
	}

	#[test]
	fn test_broadcast_inc() {
		// y (2x2) += a (1x2) * x (2x1)
		let mut buf = vec![1.0, 2.0, 10.0, 20.0, 0.0, 0.0, 0.0, 0.0];
		let item = ElementwiseItem {
			a: View2 { offset: 0, shape: [1, 2], strides: [2, 1] },
			x: View2 { offset: 2, shape: [2, 1], strides: [1, 1] },
			y: View2 { offset: 4, shape: [2, 2], strides: [2, 1] },
		};
		run_elementwise_inc(&[item], &mut buf);
		assert_eq!(&buf[4..], &[10.0, 20.0, 20.0, 40.0]);
	}

	#[test]
	fn test_time_update() {
		let mut buf = vec![4.0, 0.0];
		run_time_update(&[TimeItem { step: 0, time: 1 }], 0.5, &mut buf);
		assert_eq!(buf, vec![5.0, 2.5]);
	}
}
