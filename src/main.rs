//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use ndarray::{Array1, Array2};

use sigplan::device::cpu::CPUDevice;
use sigplan::operator::Beta;
use sigplan::{ErrPack, Operator, PlanError, SignalRegistry, SimConfig, Simulator};

const NEURONS: usize = 50;

#[allow(clippy::cast_precision_loss)]
fn main() -> Result<(), ErrPack<PlanError>> {
	stderrlog::new().module(module_path!()).module("sigplan").verbosity(2usize).init().ok();

	let mut reg = SignalRegistry::new();
	let step = reg.scalar("step", 0.0);
	let time = reg.scalar("time", 0.0);
	let u = reg.vector("u", &[0.5]);

	// spread of encoders and biases over the population
	let encoders = Array2::from_shape_fn((NEURONS, 1), |(i, _)| if i % 2 == 0 { 1.0 } else { -1.0 });
	let bias = Array1::from_shape_fn(NEURONS, |i| 1.0 + i as f64 / NEURONS as f64);
	let decoders = Array2::from_elem((1, NEURONS), 1.0 / (NEURONS as f64 * 100.0));

	let enc = reg.add_array("encoders", &encoders.into_dyn())?;
	let bias = reg.add_array("bias", &bias.into_dyn())?;
	let dec = reg.add_array("decoders", &decoders.into_dyn())?;
	let j = reg.zeros("J", &[NEURONS])?;
	let v = reg.zeros("voltage", &[NEURONS])?;
	let w = reg.zeros("refractory", &[NEURONS])?;
	let s = reg.zeros("spikes", &[NEURONS])?;
	let rates = reg.zeros("rates", &[NEURONS])?;
	let y = reg.zeros("y", &[1])?;

	let ops = vec![
		Operator::time_update(step, time).with_tag("clock"),
		Operator::copy(bias, j, false).with_tag("bias"),
		Operator::dot_inc(enc, u, j, false).with_tag("encode"),
		Operator::lif(j, v, w, s, 0.02, 0.002).with_tag("ensemble"),
		Operator::lif_rate(j, rates, 0.02, 0.002).with_tag("rates"),
		Operator::prod_update(dec, s, Beta::Const(0.0), y).with_tag("decode"),
	];

	let config = SimConfig::from_env();
	let profiling = config.profiling;
	let dev = CPUDevice::new("CPU".to_string());
	let mut sim = Simulator::new(reg, ops, dev, config)?;
	for group in sim.op_groups() {
		println!("{:?} x{}", group.op_type, group.ops.len());
	}

	sim.run(1.0)?;
	println!("t = {:.3}s after {} steps", sim.time(), sim.n_steps());
	println!("time = {}", sim.signal(time)?);
	println!("y = {}", sim.signal(y)?);
	println!("mean rate = {:.2} Hz", sim.signal(rates)?.mean().unwrap_or(0.0));
	if profiling {
		print!("{}", sim.profiling_report());
	}
	Ok(())
}
