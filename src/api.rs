//! Happy-path crate API
//!
//! Wraps the pipeline with a small, ergonomic surface:
//! - `SolverBuilder` / `RefinerBuilder` hide option plumbing (safe defaults)
//! - one-shot `solve_recurrence` / `verify_bound` helpers
//! - `wire`: §-schema JSON input/output for recurrences and solve reports
//!
//! Everything delegates to `solver::Solver` and `refine::Refiner`; nothing
//! here adds semantics.

#![forbid(unsafe_code)]

use crate::integral::TableIntegralEvaluator;
use crate::progress::{CancelToken, NoopProgress, ProgressSink};
use crate::recurrence::Recurrence;
use crate::refine::{BoundKind, Refiner, VerificationResult};
use crate::solver::Solver;
use crate::{SolveOutput, SolverError, SolverOptions};

// ===============================================================================================
// Builders
// ===============================================================================================

/// Ergonomic constructor for a [`Solver`] with the table-driven integral
/// evaluator.
pub struct SolverBuilder {
    options: SolverOptions,
}

impl SolverBuilder {
    pub fn new() -> Self {
        Self { options: SolverOptions::default() }
    }
    /// Newton tolerance for the critical exponent.
    pub fn epsilon(mut self, e: f64) -> Self {
        self.options.epsilon = e;
        self
    }
    /// Master separation threshold ε_min.
    pub fn epsilon_min(mut self, e: f64) -> Self {
        self.options.epsilon_min = e;
        self
    }
    /// Boundary-detection distance.
    pub fn near_boundary(mut self, d: f64) -> Self {
        self.options.near_boundary = d;
        self
    }
    /// Replace the whole option set.
    pub fn options(mut self, options: SolverOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the solver. The evaluator is leaked once per builder call,
    /// giving the `'static` lifetime the one-shot helpers want.
    pub fn build(self) -> Solver<'static> {
        let table = Box::leak(Box::new(TableIntegralEvaluator {
            equality_tolerance: self.options.equality_tolerance,
        }));
        Solver::new(self.options, table)
    }
}

impl Default for SolverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Ergonomic constructor for a [`Refiner`].
pub struct RefinerBuilder {
    options: SolverOptions,
}

impl RefinerBuilder {
    pub fn new() -> Self {
        Self { options: SolverOptions::default() }
    }
    pub fn taylor_order(mut self, order: usize) -> Self {
        self.options.taylor_order = order;
        self
    }
    pub fn slack_ratio_limit(mut self, limit: f64) -> Self {
        self.options.slack_ratio_limit = limit;
        self
    }
    pub fn options(mut self, options: SolverOptions) -> Self {
        self.options = options;
        self
    }
    pub fn build(self) -> Refiner {
        Refiner::new(self.options)
    }
}

impl Default for RefinerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ===============================================================================================
/* One-shot helpers */
// ===============================================================================================

/// Solve and refine a recurrence with default options and no progress sink.
pub fn solve_recurrence(rec: &Recurrence) -> Result<SolveOutput, SolverError> {
    solve_recurrence_with(rec, SolverOptions::default(), &CancelToken::new(), &NoopProgress)
}

/// Solve and refine with explicit options, cancellation and progress.
pub fn solve_recurrence_with(
    rec: &Recurrence,
    options: SolverOptions,
    cancel: &CancelToken,
    progress: &dyn ProgressSink,
) -> Result<SolveOutput, SolverError> {
    let solver = SolverBuilder::new().options(options).build();
    let raw = solver.solve(rec, cancel, progress)?;
    let refined = Refiner::new(options).refine(rec, raw, cancel, progress)?;
    Ok(refined.output)
}

/// Verify a proposed bound against a recurrence (numerical induction).
pub fn verify_bound(
    rec: &Recurrence,
    proposed: &crate::expr::Expr,
    bound: BoundKind,
) -> VerificationResult {
    Refiner::default().verify(rec, proposed, bound)
}

/// Verify through the CAS bridge, falling back to the numerical path when
/// the bridge is unavailable or misses its deadline.
pub async fn verify_bound_symbolic(
    rec: &Recurrence,
    proposed: &crate::expr::Expr,
    bridge: &dyn crate::bridge::CasBridge,
    deadline: std::time::Duration,
    cancel: &CancelToken,
) -> VerificationResult {
    match bridge.verify(proposed, rec, &[1.0], deadline, cancel).await {
        Ok(accepted) => {
            let mut v = Refiner::default().verify(rec, proposed, BoundKind::Theta);
            v.accepted = accepted && v.accepted;
            v.induction.mode = "symbolic".to_string();
            v.explanation = format!("CAS verdict: {accepted}; {}", v.explanation);
            v
        }
        Err(e) => {
            tracing::warn!(error = %e, "bridge unavailable; numerical verification fallback");
            Refiner::default().verify(rec, proposed, BoundKind::Theta)
        }
    }
}

// ===============================================================================================
/* Wire I/O (§-schema JSON) */
// ===============================================================================================

pub mod wire {
    //! JSON schemas for recurrences and solve reports.
    //!
    //! A divide-and-conquer recurrence reads as
    //! `{ "variable": "n", "terms": [{"a": 2, "b": 0.5}], "g": …, "base": … }`,
    //! a linear one as `{ "variable": "n", "coeffs": [1, 1], "f": … }`,
    //! a mutual system as `{ "variable": "n", "components": [...] }`.

    use serde::{Deserialize, Serialize};

    use crate::expr::{Expr, Symbol};
    use crate::recurrence::{
        recurrence_digest, DivideAndConquer, LinearRecurrence, MutualComponent, MutualSystem,
        Recurrence, Term,
    };
    use crate::SolveOutput;

    /// Untagged input shapes; the field names discriminate.
    #[derive(Debug, Deserialize)]
    #[serde(untagged)]
    enum WireRecurrence {
        DivideAndConquer {
            variable: String,
            terms: Vec<Term>,
            g: Expr,
            #[serde(default)]
            base: Option<Expr>,
        },
        Linear {
            variable: String,
            coeffs: Vec<f64>,
            f: Expr,
        },
        Mutual {
            variable: String,
            components: Vec<MutualComponent>,
        },
    }

    /// Parse a recurrence from its wire JSON.
    pub fn parse_recurrence(json: &str) -> anyhow::Result<Recurrence> {
        let w: WireRecurrence =
            serde_json::from_str(json).map_err(|e| anyhow::anyhow!("parse recurrence: {e}"))?;
        let rec = match w {
            WireRecurrence::DivideAndConquer { variable, terms, g, base } => {
                Recurrence::DivideAndConquer(DivideAndConquer::new(
                    terms,
                    g,
                    base.unwrap_or_else(Expr::one),
                    Symbol::input(&variable),
                )?)
            }
            WireRecurrence::Linear { variable, coeffs, f } => {
                Recurrence::Linear(LinearRecurrence::new(coeffs, f, Symbol::input(&variable))?)
            }
            WireRecurrence::Mutual { variable, components } => {
                Recurrence::Mutual(MutualSystem::new(components, Symbol::input(&variable))?)
            }
        };
        Ok(rec)
    }

    /// Read a recurrence from a JSON file.
    pub fn read_recurrence(path: &std::path::Path) -> anyhow::Result<Recurrence> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read {}: {e}", path.display()))?;
        parse_recurrence(&text)
    }

    /// The solve report written by the CLI: the output record plus
    /// provenance metadata.
    #[derive(Debug, Serialize)]
    pub struct SolveReport {
        /// Hex digest of the solved recurrence.
        pub recurrence_digest: String,
        /// RFC3339 timestamp.
        pub generated_at: String,
        #[serde(flatten)]
        pub output: SolveOutput,
    }

    /// Assemble a report for an output.
    pub fn report(rec: &Recurrence, output: SolveOutput) -> SolveReport {
        SolveReport {
            recurrence_digest: hex::encode(recurrence_digest(rec)),
            generated_at: chrono::Utc::now().to_rfc3339(),
            output,
        }
    }

    /// Pretty-printed report JSON.
    pub fn render_report(report: &SolveReport) -> anyhow::Result<String> {
        serde_json::to_string_pretty(report).map_err(|e| anyhow::anyhow!("serialize report: {e}"))
    }
}

// ===============================================================================================
// Tests
// ===============================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::simplify::{classify, GrowthForm};

    #[test]
    fn wire_to_report_end_to_end() {
        // S1 as it arrives from the extractor.
        let json = r#"{
            "variable": "n",
            "terms": [ {"a": 2, "b": 0.5} ],
            "g": {"kind": "Linear", "k": 1.0, "var": "n"},
            "base": {"kind": "Constant", "k": 1.0}
        }"#;
        let rec = wire::parse_recurrence(json).unwrap();
        let out = solve_recurrence(&rec).unwrap();
        assert_eq!(out.theorem, "Master:Case2");
        let c = classify(&out.solution, "n");
        assert_eq!(c.form, GrowthForm::PolyLog);

        let rendered = wire::render_report(&wire::report(&rec, out)).unwrap();
        assert!(rendered.contains("\"theorem\""));
        assert!(rendered.contains("\"recurrence_digest\""));
        assert!(rendered.contains("\"stages\""));
    }

    #[test]
    fn wire_linear_shape_parses() {
        let json = r#"{
            "variable": "n",
            "coeffs": [1.0, 1.0],
            "f": {"kind": "Constant", "k": 0.0}
        }"#;
        let rec = wire::parse_recurrence(json).unwrap();
        assert!(rec.is_linear());
        let out = solve_recurrence(&rec).unwrap();
        let c = classify(&out.solution, "n");
        assert_eq!(c.form, GrowthForm::Exponential);
    }

    #[test]
    fn wire_rejects_malformed_scale() {
        let json = r#"{
            "variable": "n",
            "terms": [ {"a": 2, "b": 1.5} ],
            "g": {"kind": "Constant", "k": 1.0}
        }"#;
        assert!(wire::parse_recurrence(json).is_err());
    }

    #[test]
    fn builders_apply_overrides() {
        let solver = SolverBuilder::new().epsilon_min(0.05).build();
        assert!((solver.options.epsilon_min - 0.05).abs() < 1e-12);
        let refiner = RefinerBuilder::new().taylor_order(5).build();
        assert_eq!(refiner.options.taylor_order, 5);
    }

    #[test]
    fn verify_bound_helper_accepts_s2() {
        // T(n) = T(n/2) + 1 vs Θ(log n).
        let json = r#"{
            "variable": "n",
            "terms": [ {"a": 1, "b": 0.5} ],
            "g": {"kind": "Constant", "k": 1.0}
        }"#;
        let rec = wire::parse_recurrence(json).unwrap();
        let v = verify_bound(&rec, &Expr::log(1.0, "n", 2.0), BoundKind::Theta);
        assert!(v.accepted, "{}", v.explanation);
    }
}
