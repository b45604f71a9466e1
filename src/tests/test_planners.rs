//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use assert_approx_eq::assert_approx_eq;
use ndarray::array;

use crate::device::cpu::CPUDevice;
use crate::operator::Beta;
use crate::{
	AliasPolicy, ErrPack, Operator, PlanError, PlannerKind, SignalIndex, SignalRegistry, SimConfig,
	Simulator,
};

//--------------------------------------------------------------------------------------------------

const CHAINS: usize = 3;

/// Three independent chains `u -> a -> b -> c`, plus a shared clock and a running sum.
fn chains() -> Result<(SignalRegistry, Vec<Operator>, Vec<SignalIndex>), ErrPack<PlanError>> {
	let mut reg = SignalRegistry::new();
	let step = reg.scalar("step", 0.0);
	let time = reg.scalar("time", 0.0);
	let one = reg.scalar("one", 1.0);
	let mut ops = vec![Operator::time_update(step, time)];
	let mut outputs = vec![step, time];
	for i in 0..CHAINS {
		#[allow(clippy::cast_precision_loss)]
		let k = i as f64 + 1.0;
		let u = reg.vector(format!("u{i}"), &[k, -k]);
		let w = reg.add_array(format!("W{i}"), &array![[1.0, k], [0.5, 2.0]].into_dyn())?;
		let a = reg.zeros(format!("a{i}"), &[2])?;
		let b = reg.zeros(format!("b{i}"), &[2])?;
		let c = reg.zeros(format!("c{i}"), &[2])?;
		let sum = reg.scalar(format!("sum{i}"), 0.0);
		ops.push(Operator::copy(u, a, false));
		ops.push(Operator::reset(b, 0.25));
		ops.push(Operator::dot_inc(w, a, b, false));
		ops.push(Operator::elementwise_inc(a, b, c));
		ops.push(Operator::prod_update(one, one, Beta::Const(1.0), sum));
		outputs.extend([a, b, c, sum]);
	}
	Ok((reg, ops, outputs))
}

fn run_chains(planner: PlannerKind) -> Result<(Simulator, Vec<Vec<f64>>), ErrPack<PlanError>> {
	let (reg, ops, outputs) = chains()?;
	let config = SimConfig::default().with_planner(planner);
	let mut sim = Simulator::new(reg, ops, CPUDevice::new("cpu".to_string()), config)?;
	sim.run_steps(4)?;
	let mut values = Vec::with_capacity(outputs.len());
	for sig in outputs {
		values.push(sim.signal(sig)?.iter().copied().collect());
	}
	Ok((sim, values))
}

#[test]
fn test_planners_agree() -> Result<(), ErrPack<PlanError>> {
	let (seq, expected) = run_chains(PlannerKind::Sequential)?;
	assert_eq!(seq.op_groups().len(), seq.operators().len());

	for planner in [PlannerKind::Depth, PlannerKind::GlobalGreedy] {
		let (sim, got) = run_chains(planner)?;
		assert!(sim.op_groups().len() < seq.op_groups().len(), "{planner:?} did not batch");
		for (g, e) in got.iter().zip(&expected) {
			assert_eq!(g.len(), e.len());
			for (&g, &e) in g.iter().zip(e) {
				assert_approx_eq!(g, e);
			}
		}
	}

	// c = 4 steps of a * (0.25 + W . a) for the first chain
	let c0 = &expected[4];
	assert_approx_eq!(c0[0], 4.0 * (0.25 + 1.0 - 1.0));
	assert_approx_eq!(c0[1], 4.0 * -(0.25 + 0.5 - 2.0));
	Ok(())
}

#[test]
fn test_grouping_is_deterministic() -> Result<(), ErrPack<PlanError>> {
	for planner in [PlannerKind::Sequential, PlannerKind::Depth, PlannerKind::GlobalGreedy] {
		let (first, _) = run_chains(planner)?;
		let (second, _) = run_chains(planner)?;
		assert_eq!(first.op_groups(), second.op_groups());
	}
	Ok(())
}

#[test]
fn test_same_type_ops_share_groups() -> Result<(), ErrPack<PlanError>> {
	let (sim, _) = run_chains(PlannerKind::GlobalGreedy)?;
	for group in sim.op_groups() {
		for &op in &group.ops {
			assert_eq!(sim.operators()[op].op_type(), group.op_type);
		}
	}
	let biggest = sim.op_groups().iter().map(|g| g.ops.len()).max().unwrap_or(0);
	assert!(biggest >= CHAINS);
	Ok(())
}

//--------------------------------------------------------------------------------------------------

#[test]
fn test_cycle_is_rejected() {
	let mut reg = SignalRegistry::new();
	let a = reg.scalar("a", 1.0);
	let b = reg.scalar("b", 2.0);
	let ops = vec![Operator::copy(a, b, false), Operator::copy(b, a, false)];
	let result = Simulator::new(reg, ops, CPUDevice::new("cpu".to_string()), SimConfig::default());
	assert_eq!(result.err().map(|e| e.code), Some(PlanError::CyclicDependency));
}

#[test]
fn test_overlapping_sets_are_rejected() -> Result<(), ErrPack<PlanError>> {
	let mut reg = SignalRegistry::new();
	let m = reg.zeros("m", &[2, 3])?;
	let r0 = reg.row(m, 0)?;
	let ops = vec![Operator::reset(m, 1.0), Operator::reset(r0, 2.0)];
	let result = Simulator::new(reg, ops, CPUDevice::new("cpu".to_string()), SimConfig::default());
	assert_eq!(result.err().map(|e| e.code), Some(PlanError::ConflictingWrite));
	Ok(())
}

/// Even and odd elements of one base. Disjoint, but only an exact check can tell.
fn interleaved(config: SimConfig) -> Result<(Simulator, SignalIndex), ErrPack<PlanError>> {
	let mut reg = SignalRegistry::new();
	let v = reg.zeros("v", &[8])?;
	let even = reg.add_view("even", v, 0, &[4], &[2])?;
	let odd = reg.add_view("odd", v, 1, &[4], &[2])?;
	let ops = vec![Operator::reset(even, 1.0), Operator::reset(odd, 2.0)];
	let sim = Simulator::new(reg, ops, CPUDevice::new("cpu".to_string()), config)?;
	Ok((sim, v))
}

#[test]
fn test_alias_policy() -> Result<(), ErrPack<PlanError>> {
	let (mut sim, v) = interleaved(SimConfig::default())?;
	assert_eq!(sim.op_groups().len(), 1);
	sim.step()?;
	assert_eq!(sim.signal(v)?, array![1.0, 2.0, 1.0, 2.0, 1.0, 2.0, 1.0, 2.0].into_dyn());

	let small = SimConfig { exact_overlap_limit: 4, ..SimConfig::default() };
	let err = interleaved(small.clone()).err().map(|e| e.code);
	assert_eq!(err, Some(PlanError::ConflictingWrite));

	let strict = small.with_alias_policy(AliasPolicy::Strict);
	let err = interleaved(strict).err().map(|e| e.code);
	assert_eq!(err, Some(PlanError::AliasingAmbiguity));
	Ok(())
}
