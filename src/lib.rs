//! Crate root: public surface, solver options, and pipeline-wide invariants
//!
//! This module is the single canonical entry-point for downstream users of
//! the library. It centralizes the solver option struct, the wire-stable
//! error taxonomy, the final solve-output record, and re-exports the main
//! submodules of the three-stage pipeline:
//!
//! **raw recurrence → normalize → classify & dispatch →
//! {Master | Akra–Bazzi | Linear | Mutual} → refine → annotated result.**
//!
//! ## Invariants
//!
//! - **Immutability.** Every entity flowing through the pipeline is
//!   immutable; a transform returns a new value. No stage takes a mutable
//!   reference to its input.
//! - **Determinism.** Stage order is strictly sequential; the output of
//!   stage `k` depends only on earlier stages and the immutable input.
//! - **Recoverables never abort.** Symbolic residues, indeterminate
//!   regularity and similar degradations ride inside the result as warnings
//!   with reduced confidence. Only malformed input, cancellation and broken
//!   internal invariants surface as errors.
//! - **No global state.** Solvers and refiners are plain values passed
//!   explicitly; nothing in the crate touches files, the network, or a
//!   process-wide singleton. The optional CAS bridge is the single external
//!   boundary.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use serde::{Deserialize, Serialize};

/// Expression algebra: AST, substitution, numeric evaluation.
pub mod expr;
/// Rewrites, Big-O normalization, asymptotic comparison, classification.
pub mod simplify;
/// Recurrence shapes, validation, Master/Akra–Bazzi predicates.
pub mod recurrence;
/// Newton solver for the Akra–Bazzi critical exponent.
pub mod exponent;
/// Table-driven driving-integral evaluation with special-function fallback.
pub mod integral;
/// Master Case 3 regularity condition (analytical + sampled).
pub mod regularity;
/// Characteristic-polynomial solver for linear recurrences.
pub mod linear;
/// Mutual-recursion cycle reduction.
pub mod mutual;
/// Theorem driver: classify & dispatch to the right solver.
pub mod solver;
/// Refinement engine: boundary cases, perturbation, slack tightening,
/// induction verification, confidence scoring.
pub mod refine;
/// Optional out-of-process CAS bridge (contract + subprocess transport).
pub mod bridge;
/// Progress contract, stage records, cancellation.
pub mod progress;
/// Builders, one-shot helpers, and JSON wire I/O.
pub mod api;

// ============================================================================
// Canonical re-exports (centralization)
// ============================================================================

pub use crate::expr::{Expr, Symbol, VarKind};
pub use crate::progress::{CancelToken, Cancelled, NoopProgress, ProgressSink, StageRecord};
pub use crate::recurrence::{Recurrence, RecurrenceError};
pub use crate::refine::{RefinementResult, Refiner, VerificationResult};
pub use crate::simplify::{compare_asymptotic, simplify, AsymptoticOrd};
pub use crate::solver::{RawSolution, Solver};

// ============================================================================
// Options
// ============================================================================

/// Every configurable threshold of the pipeline, with the documented
/// defaults. Passed explicitly; there is no process-wide instance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    /// Newton residual tolerance for the critical exponent.
    pub epsilon: f64,
    /// Newton iteration budget.
    pub max_iterations: usize,
    /// Minimal polynomial separation `ε_min` for Master Cases 1 and 3.
    pub epsilon_min: f64,
    /// `|k − p|` below this counts as equality in the integral table and
    /// related tie-breaks.
    pub equality_tolerance: f64,
    /// The ε in the regularity acceptance `c < 1 − ε`.
    pub regularity_tolerance: f64,
    /// Boundary detection: distance to a critical value below which a
    /// refinement stage flags the solution.
    pub near_boundary: f64,
    /// Taylor order for the perturbation expansion at boundaries.
    pub taylor_order: usize,
    /// Slack tightening rejects the bound when `c₂/c₁` exceeds this.
    pub slack_ratio_limit: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            epsilon: exponent::DEFAULT_EPSILON,
            max_iterations: exponent::DEFAULT_MAX_ITERATIONS,
            epsilon_min: 0.01,
            equality_tolerance: 1e-9,
            regularity_tolerance: 1e-9,
            near_boundary: 0.1,
            taylor_order: 3,
            slack_ratio_limit: 2.0,
        }
    }
}

// ============================================================================
// Wire-stable error taxonomy
// ============================================================================

/// Terminal pipeline failures. Everything else is a recoverable degradation
/// reported inside the result.
#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    #[error("malformed recurrence: {0}")]
    MalformedRecurrence(#[from] RecurrenceError),
    #[error("mutual cycle never reduces its argument")]
    NonReducingCycle,
    #[error("solver failed to converge: {0}")]
    SolverNonConvergence(String),
    #[error("no applicable theorem; suggestions: {}", suggestions.join("; "))]
    TheoremNotApplicable { suggestions: Vec<String> },
    #[error("external CAS bridge unavailable")]
    BridgeUnavailable,
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    #[error("internal invariant violated: {0}")]
    InternalInvariantViolated(String),
}

impl SolverError {
    /// Stable machine-readable code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            SolverError::MalformedRecurrence(_) => "MalformedRecurrence",
            SolverError::NonReducingCycle => "NonReducingCycle",
            SolverError::SolverNonConvergence(_) => "SolverNonConvergence",
            SolverError::TheoremNotApplicable { .. } => "TheoremNotApplicable",
            SolverError::BridgeUnavailable => "BridgeUnavailable",
            SolverError::Cancelled(_) => "Cancelled",
            SolverError::InternalInvariantViolated(_) => "InternalInvariantViolated",
        }
    }
}

// ============================================================================
// Final output record
// ============================================================================

/// The annotated solve result: closed-form bound, provenance, confidence,
/// and the full ordered derivation trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveOutput {
    /// The asymptotic bound (Big-Θ where tight, Big-O otherwise).
    pub solution: Expr,
    /// Provenance tag, e.g. `"Master:Case2"`, `"AkraBazzi"`, `"Linear"`.
    pub theorem: String,
    /// Whether the bound is tight (Θ) or only an upper bound (O).
    pub tight: bool,
    /// Critical exponent / Master exponent, when one was computed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<f64>,
    /// Driving-integral record, when Akra–Bazzi ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integral: Option<integral::IntegralEvaluationResult>,
    /// Combined confidence in [0, 1].
    pub confidence: f64,
    /// Set when confidence dropped below the review threshold or a symbolic
    /// residue survived refinement.
    pub requires_review: bool,
    /// Ordered refinement-stage records.
    pub stages: Vec<StageRecord>,
    /// Human-readable derivation.
    pub explanation: String,
    /// Recoverable degradations encountered along the way.
    pub warnings: Vec<String>,
    /// For mutual systems: every component name the solution applies to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}
