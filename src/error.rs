//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::borrow::Cow;

use crate::{ErrExtra, ErrPack};

//--------------------------------------------------------------------------------------------------

/// Everything that can go wrong while building or running a plan.
///
/// All codes except `Execution` are raised during the one-time plan construction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PlanError {
	/// Two operators set (or update) aliased memory in the same step.
	ConflictingWrite,

	/// The dependency graph has a cycle.
	CyclicDependency,

	/// Operand shapes of some operator cannot be combined.
	Shape,

	/// Overlap of two views could not be decided and the alias policy is strict.
	AliasingAmbiguity,

	InvalidSignal,
	InvalidView,
	DeviceAlloc,

	/// A `SimConfig` value is out of range.
	InvalidConfig,

	/// A backend dispatch or wait failed while stepping.
	Execution,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct DeviceAllocError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct RaggedIndexError;

//--------------------------------------------------------------------------------------------------

impl From<DeviceAllocError> for ErrPack<PlanError> {
	fn from(_: DeviceAllocError) -> Self {
		Self {
			code: PlanError::DeviceAlloc,
			extra: None,
		}
	}
}

impl From<RaggedIndexError> for ErrPack<PlanError> {
	fn from(_: RaggedIndexError) -> Self {
		Self {
			code: PlanError::InvalidView,
			extra: Some(Box::new(ErrExtra {
				message: Cow::from("ragged array element out of range"),
				nested: None,
			})),
		}
	}
}

impl From<ndarray::ShapeError> for ErrPack<PlanError> {
	fn from(err: ndarray::ShapeError) -> Self {
		Self {
			code: PlanError::Shape,
			extra: Some(Box::new(ErrExtra {
				message: Cow::from("array shape does not match the signal"),
				nested: Some(Box::new(err)),
			})),
		}
	}
}

/// Wraps a build-time error as a run-time one, keeping the original as `nested`.
pub fn execution_error(message: impl Into<Cow<'static, str>>, cause: ErrPack<PlanError>) -> ErrPack<PlanError> {
	crate::util::cold_path();
	ErrPack {
		code: PlanError::Execution,
		extra: Some(Box::new(ErrExtra {
			message: message.into(),
			nested: Some(Box::new(cause)),
		})),
	}
}

//--------------------------------------------------------------------------------------------------
