//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::collections::HashMap;

use bit_set::BitSet;

use crate::config::PlannerKind;
use crate::error::PlanError;
use crate::graph::DepGraph;
use crate::operator::{OpIndex, OpType, Operator};
use crate::signal::AliasCache;
use crate::util::cold_path;
use crate::util::index_vec::IndexVec;
use crate::ErrPack;

pub mod grouper;

use grouper::{WriteSet, group_by_concurrent_writes, writes_compatible};

//--------------------------------------------------------------------------------------------------

/// Operators of one type that run together as one batched dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpGroup {
	pub op_type: OpType,
	pub ops: Vec<OpIndex>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
	pub groups: Vec<OpGroup>,
}

struct Planner<'p, 'r> {
	ops: &'p IndexVec<OpIndex, Operator>,
	graph: &'p DepGraph,
	alias: &'p mut AliasCache<'r>,
	writes: IndexVec<OpIndex, WriteSet>,
	chunk_size: usize,
}

impl Planner<'_, '_> {
	fn group(&mut self, ops: &[OpIndex]) -> Result<Vec<Vec<OpIndex>>, ErrPack<PlanError>> {
		group_by_concurrent_writes(ops, &self.writes, self.alias, self.chunk_size)
	}

	fn sequential(&self) -> Schedule {
		let groups = self
			.graph
			.order()
			.iter()
			.map(|&op| OpGroup { op_type: self.ops[op].op_type(), ops: vec![op] })
			.collect();
		Schedule { groups }
	}

	fn by_depth(&mut self) -> Result<Schedule, ErrPack<PlanError>> {
		let n_depths = self.graph.max_depth().map_or(0, |d| d + 1);
		let mut buckets: Vec<Vec<OpIndex>> = vec![Vec::new(); n_depths];
		for op in self.ops.indexes() {
			buckets[self.graph.depth(op)].push(op);
		}

		let mut schedule = Schedule::default();
		for bucket in buckets {
			// types in order of first appearance within the bucket
			let mut by_type: Vec<(OpType, Vec<OpIndex>)> = Vec::new();
			for op in bucket {
				let op_type = self.ops[op].op_type();
				match by_type.iter_mut().find(|(t, _)| *t == op_type) {
					Some((_, list)) => list.push(op),
					None => by_type.push((op_type, vec![op])),
				}
			}
			for (op_type, list) in by_type {
				for ops in self.group(&list)? {
					schedule.groups.push(OpGroup { op_type, ops });
				}
			}
		}
		Ok(schedule)
	}

	fn global_greedy(&mut self) -> Result<Schedule, ErrPack<PlanError>> {
		let mut pending = self.graph.ancestors();
		let mut done = BitSet::with_capacity(self.ops.len());
		let mut schedule = Schedule::default();
		while done.len() < self.ops.len() {
			let frontier: Vec<OpIndex> = self
				.ops
				.indexes()
				.filter(|op| !done.contains(op.raw) && pending[*op].is_empty())
				.collect();

			// the most common type on the frontier, ties go to the type seen first
			let mut counts: HashMap<OpType, (usize, OpIndex)> = HashMap::new();
			for &op in &frontier {
				counts.entry(self.ops[op].op_type()).or_insert((0, op)).0 += 1;
			}
			let Some((op_type, _)) = counts
				.into_iter()
				.max_by(|(_, (ca, fa)), (_, (cb, fb))| ca.cmp(cb).then(fb.cmp(fa)))
			else {
				cold_path();
				return Err(ErrPack::new(
					PlanError::CyclicDependency,
					format!(
						"no operator is ready, {} remain unscheduled",
						self.ops.len() - done.len()
					),
				));
			};

			let candidates: Vec<OpIndex> =
				frontier.into_iter().filter(|&op| self.ops[op].op_type() == op_type).collect();
			let mut best: Vec<OpIndex> = Vec::new();
			for group in self.group(&candidates)? {
				if group.len() > best.len() {
					best = group;
				}
			}

			let mut chosen = BitSet::with_capacity(self.ops.len());
			for op in &best {
				chosen.insert(op.raw);
			}
			done.union_with(&chosen);
			for set in pending.iter_mut() {
				set.difference_with(&chosen);
			}
			schedule.groups.push(OpGroup { op_type, ops: best });
		}
		Ok(schedule)
	}
}

//--------------------------------------------------------------------------------------------------

impl Schedule {
	pub fn plan(
		kind: PlannerKind,
		ops: &IndexVec<OpIndex, Operator>,
		graph: &DepGraph,
		alias: &mut AliasCache,
		chunk_size: usize,
	) -> Result<Self, ErrPack<PlanError>> {
		let writes: IndexVec<OpIndex, WriteSet> =
			IndexVec::from_vec(ops.iter().map(|op| op.intents().writes().collect()).collect());
		let mut planner = Planner { ops, graph, alias, writes, chunk_size };
		let schedule = match kind {
			PlannerKind::Sequential => planner.sequential(),
			PlannerKind::Depth => planner.by_depth()?,
			PlannerKind::GlobalGreedy => planner.global_greedy()?,
		};
		log::info!(
			"Schedule: {kind:?} planner put {} operators into {} groups",
			ops.len(),
			schedule.groups.len()
		);
		Ok(schedule)
	}

	pub fn len(&self) -> usize {
		self.groups.len()
	}

	pub fn is_empty(&self) -> bool {
		self.groups.is_empty()
	}

	/// Checks that every operator appears once, after all of its predecessors,
	/// and that no group mixes types or has members writing aliased memory.
	pub fn validate(
		&self,
		graph: &DepGraph,
		ops: &IndexVec<OpIndex, Operator>,
		alias: &mut AliasCache,
	) -> Result<(), ErrPack<PlanError>> {
		let mut position: IndexVec<OpIndex, Option<usize>> =
			IndexVec::from_vec(vec![None; ops.len()]);
		for (g, group) in self.groups.iter().enumerate() {
			for &op in &group.ops {
				if position.get(op).copied().flatten().is_some() || !ops.contains(op) {
					cold_path();
					return Err(ErrPack::new(
						PlanError::InvalidSignal,
						format!("operator {op} is scheduled twice or does not exist"),
					));
				}
				if ops[op].op_type() != group.op_type {
					cold_path();
					return Err(ErrPack::new(
						PlanError::InvalidSignal,
						format!("operator {op} ({}) is in a {:?} group", ops[op], group.op_type),
					));
				}
				position[op] = Some(g);
			}
		}

		for op in ops.indexes() {
			let Some(pos) = position[op] else {
				cold_path();
				return Err(ErrPack::new(
					PlanError::InvalidSignal,
					format!("operator {op} ({}) is not scheduled", ops[op]),
				));
			};
			for &next in graph.successors(op) {
				if position[next].is_none_or(|next_pos| next_pos <= pos) {
					cold_path();
					return Err(ErrPack::new(
						PlanError::CyclicDependency,
						format!("operator {next} is scheduled before its dependency {op}"),
					));
				}
			}
		}

		for group in &self.groups {
			let writes: Vec<WriteSet> =
				group.ops.iter().map(|&op| ops[op].intents().writes().collect()).collect();
			for i in 0..writes.len() {
				for j in i + 1..writes.len() {
					if !writes_compatible(&writes[i], &writes[j], alias)? {
						cold_path();
						return Err(ErrPack::new(
							PlanError::ConflictingWrite,
							format!(
								"operators {} and {} write aliased memory in one group",
								group.ops[i], group.ops[j]
							),
						));
					}
				}
			}
		}
		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------
