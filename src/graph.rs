//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use bit_set::BitSet;
use smallvec::SmallVec;

use crate::error::PlanError;
use crate::operator::{Intents, OpIndex, Operator};
use crate::signal::{AliasCache, BaseIndex, SignalIndex};
use crate::util::cold_path;
use crate::util::index_vec::IndexVec;
use crate::ErrPack;

//--------------------------------------------------------------------------------------------------

type OpList = SmallVec<[OpIndex; 2]>;

/// Operators indexed by the signal they touch and how.
#[derive(Default)]
struct SignalUsers {
	reads: HashMap<SignalIndex, OpList>,
	sets: HashMap<SignalIndex, OpList>,
	incs: HashMap<SignalIndex, OpList>,
	updates: HashMap<SignalIndex, OpList>,

	/// Distinct signals set or incremented, per base.
	base_writes: HashMap<BaseIndex, Vec<SignalIndex>>,

	/// Distinct signals read, per base.
	base_reads: HashMap<BaseIndex, Vec<SignalIndex>>,
}

fn push_unique(list: &mut Vec<SignalIndex>, sig: SignalIndex) {
	if !list.contains(&sig) {
		list.push(sig);
	}
}

fn sorted_keys<V>(map: &HashMap<SignalIndex, V>) -> Vec<SignalIndex> {
	let mut keys: Vec<SignalIndex> = map.keys().copied().collect();
	keys.sort_unstable();
	keys
}

fn users<'a>(map: &'a HashMap<SignalIndex, OpList>, sig: SignalIndex) -> &'a [OpIndex] {
	map.get(&sig).map_or(&[][..], |list| list.as_slice())
}

impl SignalUsers {
	fn collect(
		intents: &IndexVec<OpIndex, Intents>,
		alias: &AliasCache,
	) -> Result<Self, ErrPack<PlanError>> {
		let registry = alias.registry();
		let mut result = Self::default();
		for (op, it) in intents.enumerate() {
			for &sig in it.sets.iter().chain(it.incs.iter()) {
				let base = registry.signal(sig)?.base;
				push_unique(result.base_writes.entry(base).or_default(), sig);
			}
			for &sig in &it.reads {
				let base = registry.signal(sig)?.base;
				push_unique(result.base_reads.entry(base).or_default(), sig);
				result.reads.entry(sig).or_default().push(op);
			}
			for &sig in &it.sets {
				result.sets.entry(sig).or_default().push(op);
			}
			for &sig in &it.incs {
				result.incs.entry(sig).or_default().push(op);
			}
			for &sig in &it.updates {
				result.updates.entry(sig).or_default().push(op);
			}
		}
		Ok(result)
	}
}

/// Every signal in `map` has exactly one writer and no two of them alias.
fn check_exclusive(
	what: &str,
	map: &HashMap<SignalIndex, OpList>,
	ops: &IndexVec<OpIndex, Operator>,
	alias: &mut AliasCache,
) -> Result<(), ErrPack<PlanError>> {
	let registry = alias.registry();
	let keys = sorted_keys(map);
	let mut by_base: HashMap<BaseIndex, Vec<SignalIndex>> = HashMap::new();
	for &sig in &keys {
		let writers = users(map, sig);
		if let [first, second, ..] = writers {
			cold_path();
			return Err(ErrPack::new(
				PlanError::ConflictingWrite,
				format!(
					"signal '{}' {what} by both {} ({}) and {} ({})",
					registry.name(sig),
					first,
					ops[*first],
					second,
					ops[*second]
				),
			));
		}
		by_base.entry(registry.signal(sig)?.base).or_default().push(sig);
	}
	for sig in keys {
		let base = registry.signal(sig)?.base;
		let Some(same_base) = by_base.get(&base) else { continue };
		for &other in same_base.iter().filter(|&&other| other > sig) {
			if alias.shares_memory(sig, other)? {
				cold_path();
				return Err(ErrPack::new(
					PlanError::ConflictingWrite,
					format!(
						"aliased signals '{}' and '{}' are both {what} in one step",
						registry.name(sig),
						registry.name(other)
					),
				));
			}
		}
	}
	Ok(())
}

//--------------------------------------------------------------------------------------------------

/// "Must happen before" relation between operators.
pub struct DepGraph {
	succs: IndexVec<OpIndex, Vec<OpIndex>>,
	preds: IndexVec<OpIndex, Vec<OpIndex>>,
	edge_count: usize,

	/// Kahn order, ties broken by the smaller operator index.
	order: Vec<OpIndex>,

	depth: IndexVec<OpIndex, usize>,
}

impl DepGraph {
	pub fn build(
		ops: &IndexVec<OpIndex, Operator>,
		alias: &mut AliasCache,
	) -> Result<Self, ErrPack<PlanError>> {
		let intents: IndexVec<OpIndex, Intents> =
			IndexVec::from_vec(ops.iter().map(Operator::intents).collect());
		let u = SignalUsers::collect(&intents, alias)?;
		let mut edges: Vec<(OpIndex, OpIndex)> = Vec::new();

		check_exclusive("set", &u.sets, ops, alias)?;

		// incs after the sets of anything they alias
		let set_keys = sorted_keys(&u.sets);
		for inc_sig in sorted_keys(&u.incs) {
			for &set_sig in &set_keys {
				if alias.shares_memory(inc_sig, set_sig)? {
					for &p in users(&u.sets, set_sig) {
						edges.extend(users(&u.incs, inc_sig).iter().map(|&q| (p, q)));
					}
				}
			}
		}

		// reads after sets and incs of anything they alias
		for read_sig in sorted_keys(&u.reads) {
			let base = alias.registry().signal(read_sig)?.base;
			let Some(writes) = u.base_writes.get(&base) else { continue };
			for &w in writes {
				if alias.shares_memory(read_sig, w)? {
					for &p in users(&u.sets, w).iter().chain(users(&u.incs, w)) {
						edges.extend(users(&u.reads, read_sig).iter().map(|&q| (p, q)));
					}
				}
			}
		}

		check_exclusive("updated", &u.updates, ops, alias)?;

		// updates after every read, set and inc of anything they alias
		for up_sig in sorted_keys(&u.updates) {
			let base = alias.registry().signal(up_sig)?.base;
			let writes = u.base_writes.get(&base).map_or(&[][..], Vec::as_slice);
			let reads = u.base_reads.get(&base).map_or(&[][..], Vec::as_slice);
			for &other in writes.iter().chain(reads) {
				if alias.shares_memory(up_sig, other)? {
					let pre = users(&u.sets, other)
						.iter()
						.chain(users(&u.incs, other))
						.chain(users(&u.reads, other));
					for &p in pre {
						edges.extend(users(&u.updates, up_sig).iter().map(|&q| (p, q)));
					}
				}
			}
		}

		edges.retain(|(p, q)| p != q);
		edges.sort_unstable();
		edges.dedup();

		let mut succs: IndexVec<OpIndex, Vec<OpIndex>> =
			IndexVec::from_vec(vec![Vec::new(); ops.len()]);
		let mut preds: IndexVec<OpIndex, Vec<OpIndex>> =
			IndexVec::from_vec(vec![Vec::new(); ops.len()]);
		for &(p, q) in &edges {
			succs[p].push(q);
			preds[q].push(p);
		}

		let mut graph = Self {
			succs,
			preds,
			edge_count: edges.len(),
			order: Vec::new(),
			depth: IndexVec::new(),
		};
		graph.order = graph.toposort(ops)?;
		graph.depth = graph.compute_depths();
		log::debug!(
			"DepGraph: {} operators, {} edges, max depth {}",
			ops.len(),
			graph.edge_count,
			graph.depth.iter().max().copied().unwrap_or(0)
		);
		Ok(graph)
	}

	/// Kahn's algorithm. Among ready operators, the smallest index goes first.
	fn toposort(&self, ops: &IndexVec<OpIndex, Operator>) -> Result<Vec<OpIndex>, ErrPack<PlanError>> {
		let mut in_degree: IndexVec<OpIndex, usize> =
			IndexVec::from_vec(self.preds.iter().map(Vec::len).collect());
		let mut ready: BinaryHeap<Reverse<OpIndex>> =
			in_degree.enumerate().filter(|(_, d)| **d == 0).map(|(op, _)| Reverse(op)).collect();
		let mut order = Vec::with_capacity(self.len());
		while let Some(Reverse(op)) = ready.pop() {
			order.push(op);
			for &next in &self.succs[op] {
				in_degree[next] -= 1;
				if in_degree[next] == 0 {
					ready.push(Reverse(next));
				}
			}
		}
		if order.len() < self.len() {
			cold_path();
			let stuck: Vec<String> = in_degree
				.enumerate()
				.filter(|(_, d)| **d > 0)
				.take(8)
				.map(|(op, _)| format!("{op} {}", ops[op]))
				.collect();
			return Err(ErrPack::new(
				PlanError::CyclicDependency,
				format!(
					"{} operators are part of or behind a cycle: {}",
					self.len() - order.len(),
					stuck.join(", ")
				),
			));
		}
		Ok(order)
	}

	fn compute_depths(&self) -> IndexVec<OpIndex, usize> {
		let mut depth: IndexVec<OpIndex, usize> = IndexVec::from_vec(vec![0; self.len()]);
		for &op in &self.order {
			depth[op] = self.preds[op].iter().map(|&p| depth[p] + 1).max().unwrap_or(0);
		}
		depth
	}

	/// Transitive predecessors of every operator, propagated in topological order.
	pub fn ancestors(&self) -> IndexVec<OpIndex, BitSet> {
		let mut result: IndexVec<OpIndex, BitSet> =
			IndexVec::from_vec(vec![BitSet::with_capacity(self.len()); self.len()]);
		for &op in &self.order {
			let mut acc = BitSet::with_capacity(self.len());
			for &p in &self.preds[op] {
				acc.union_with(&result[p]);
				acc.insert(p.raw);
			}
			result[op] = acc;
		}
		result
	}

	pub fn len(&self) -> usize {
		self.succs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.succs.is_empty()
	}

	pub fn edge_count(&self) -> usize {
		self.edge_count
	}

	pub fn successors(&self, op: OpIndex) -> &[OpIndex] {
		&self.succs[op]
	}

	pub fn predecessors(&self, op: OpIndex) -> &[OpIndex] {
		&self.preds[op]
	}

	pub fn has_edge(&self, from: OpIndex, to: OpIndex) -> bool {
		self.succs[from].binary_search(&to).is_ok()
	}

	pub fn order(&self) -> &[OpIndex] {
		&self.order
	}

	pub fn depth(&self, op: OpIndex) -> usize {
		self.depth[op]
	}

	pub fn max_depth(&self) -> Option<usize> {
		self.depth.iter().max().copied()
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::SimConfig;
	use crate::signal::SignalRegistry;

	fn op(i: usize) -> OpIndex {
		OpIndex::new(i)
	}

	#[test]
	fn test_set_inc_read_update_chain() {
		let mut reg = SignalRegistry::new();
		let x = reg.vector("x", &[1.0, 2.0]);
		let a = reg.zeros("a", &[2, 2]).unwrap();
		let y = reg.zeros("y", &[2]).unwrap();
		let z = reg.zeros("z", &[2]).unwrap();
		let ops: IndexVec<OpIndex, Operator> = IndexVec::from_vec(vec![
			Operator::copy(z, x, true),
			Operator::copy(y, z, false),
			Operator::dot_inc(a, x, y, false),
			Operator::reset(y, 0.0),
		]);
		let config = SimConfig::default();
		let mut alias = AliasCache::new(&reg, &config);
		let g = DepGraph::build(&ops, &mut alias).unwrap();

		// reset y -> inc y -> read y -> ... ; every read of x happens before its update
		assert!(g.has_edge(op(3), op(2)));
		assert!(g.has_edge(op(3), op(1)));
		assert!(g.has_edge(op(2), op(1)));
		assert!(g.has_edge(op(2), op(0)));
		assert!(g.has_edge(op(1), op(0)));
		assert_eq!(g.order(), &[op(3), op(2), op(1), op(0)]);
		assert_eq!(g.depth(op(0)), 3);

		let anc = g.ancestors();
		assert_eq!(anc[op(0)].len(), 3);
		assert!(anc[op(3)].is_empty());
	}

	#[test]
	fn test_write_exclusivity() {
		let mut reg = SignalRegistry::new();
		let m = reg.zeros("m", &[2, 3]).unwrap();
		let r = reg.row(m, 1).unwrap();
		let ops: IndexVec<OpIndex, Operator> =
			IndexVec::from_vec(vec![Operator::reset(m, 0.0), Operator::reset(r, 1.0)]);
		let config = SimConfig::default();
		let mut alias = AliasCache::new(&reg, &config);
		let err = DepGraph::build(&ops, &mut alias).err().unwrap();
		assert_eq!(err.code, PlanError::ConflictingWrite);

		let ops: IndexVec<OpIndex, Operator> =
			IndexVec::from_vec(vec![Operator::reset(m, 0.0), Operator::reset(m, 1.0)]);
		let err = DepGraph::build(&ops, &mut alias).err().unwrap();
		assert_eq!(err.code, PlanError::ConflictingWrite);
	}

	#[test]
	fn test_update_exclusivity() {
		let mut reg = SignalRegistry::new();
		let m = reg.zeros("m", &[2, 3]).unwrap();
		let r0 = reg.row(m, 0).unwrap();
		let r1 = reg.row(m, 1).unwrap();
		let src = reg.zeros("src", &[2, 3]).unwrap();
		let row = reg.zeros("row", &[3]).unwrap();
		let config = SimConfig::default();
		let mut alias = AliasCache::new(&reg, &config);

		let ops: IndexVec<OpIndex, Operator> =
			IndexVec::from_vec(vec![Operator::copy(src, m, true), Operator::copy(row, r0, true)]);
		let err = DepGraph::build(&ops, &mut alias).err().unwrap();
		assert_eq!(err.code, PlanError::ConflictingWrite);

		// disjoint rows may be updated by different operators
		let ops: IndexVec<OpIndex, Operator> =
			IndexVec::from_vec(vec![Operator::copy(row, r0, true), Operator::copy(row, r1, true)]);
		assert!(DepGraph::build(&ops, &mut alias).is_ok());
	}

	#[test]
	fn test_cycle_is_reported() {
		let mut reg = SignalRegistry::new();
		let a = reg.vector("a", &[1.0]);
		let b = reg.vector("b", &[2.0]);
		let ops: IndexVec<OpIndex, Operator> =
			IndexVec::from_vec(vec![Operator::copy(a, b, false), Operator::copy(b, a, false)]);
		let config = SimConfig::default();
		let mut alias = AliasCache::new(&reg, &config);
		let err = DepGraph::build(&ops, &mut alias).err().unwrap();
		assert_eq!(err.code, PlanError::CyclicDependency);
		assert!(err.message().contains("2 operators"));
	}
}
