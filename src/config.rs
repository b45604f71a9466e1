//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use crate::util::cold_path;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PlannerKind {
	/// One operator per group, in topological order. No batching.
	Sequential,

	/// Depth buckets, split by type, then by concurrent writes.
	Depth,

	/// Repeatedly schedules the largest same-type group from the ready frontier.
	GlobalGreedy,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct UnknownPlannerError;

impl std::str::FromStr for PlannerKind {
	type Err = UnknownPlannerError;

	fn from_str(s: &str) -> Result<Self, UnknownPlannerError> {
		match s {
			"sequential" => Ok(Self::Sequential),
			"depth" => Ok(Self::Depth),
			"greedy" | "global_greedy" => Ok(Self::GlobalGreedy),
			_ => {
				cold_path();
				Err(UnknownPlannerError)
			},
		}
	}
}

/// What to do when the overlap of two views cannot be decided.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AliasPolicy {
	/// Treat "unknown" as "may alias".
	Conservative,

	/// Fail the build with `PlanError::AliasingAmbiguity`.
	Strict,
}

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SimConfig {
	/// Simulation time step in seconds.
	pub dt: f64,

	pub planner: PlannerKind,

	/// Operators are grouped by concurrent writes in blocks of this size.
	/// Bigger blocks give bigger groups, but the pairwise check is quadratic.
	pub chunk_size: usize,

	pub alias_policy: AliasPolicy,

	/// Two strided views whose combined element count exceeds this limit
	/// are not compared element by element and their overlap is "unknown".
	pub exact_overlap_limit: usize,

	/// Fold dot-increments into the operator that sets the same view.
	pub compress_gemv: bool,

	/// Collect per-group timings while stepping.
	pub profiling: bool,
}

impl Default for SimConfig {
	fn default() -> Self {
		Self {
			dt: 0.001,
			planner: PlannerKind::Depth,
			chunk_size: 256,
			alias_policy: AliasPolicy::Conservative,
			exact_overlap_limit: 1 << 20,
			compress_gemv: true,
			profiling: false,
		}
	}
}

impl SimConfig {
	pub const PROFILING_VAR: &'static str = "SIGPLAN_PROFILING";
	pub const PLANNER_VAR: &'static str = "SIGPLAN_PLANNER";

	/// Default config with overrides from the environment.
	pub fn from_env() -> Self {
		let mut config = Self::default();
		config.apply_env();
		config
	}

	pub fn apply_env(&mut self) {
		if let Ok(value) = std::env::var(Self::PROFILING_VAR) {
			self.profiling = matches!(value.trim(), "1" | "true" | "yes" | "on");
		}
		if let Ok(value) = std::env::var(Self::PLANNER_VAR) {
			match value.trim().parse() {
				Ok(planner) => self.planner = planner,
				Err(UnknownPlannerError) => {
					cold_path();
					log::warn!(
						"SimConfig: unknown planner '{value}' in {}, keeping {:?}",
						Self::PLANNER_VAR,
						self.planner
					);
				},
			}
		}
	}

	pub fn with_dt(mut self, dt: f64) -> Self {
		self.dt = dt;
		self
	}

	pub fn with_planner(mut self, planner: PlannerKind) -> Self {
		self.planner = planner;
		self
	}

	pub fn with_alias_policy(mut self, alias_policy: AliasPolicy) -> Self {
		self.alias_policy = alias_policy;
		self
	}
}

//--------------------------------------------------------------------------------------------------
