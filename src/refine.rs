//! Refinement engine
//!
//! Takes the theorem driver's raw solution and tightens it:
//!
//! `RawSolution → BoundaryDetect → Perturbation? → SlackVariableTighten →
//! InductionVerify → ConfidenceScore → Annotated`
//!
//! - **Boundary detection** flags Master gaps, Akra–Bazzi critical
//!   exponents near an integer, and log exponents near an integer, using
//!   the configurable near-threshold (default 0.1).
//! - **Perturbation** expands the driving integral around the singular
//!   point `δ = k − p` up to the configured Taylor order:
//!   `I(n) = (n^δ − 1)/δ = Σ_{i≥1} δ^{i−1}·ln^i n / i!`. The expansion
//!   terms are preserved in order for traceability.
//! - **Slack tightening** samples the recurrence and the candidate bound at
//!   `n ∈ {10, 100, 1 000, 10 000}` and fits the smallest `c₁, c₂` with
//!   `c₁·f(n) ≤ T(n) ≤ c₂·f(n)`; a ratio `c₂/c₁ ≥ 2` flags `LooseBound`
//!   and keeps the original expression.
//! - **Induction verification** checks base cases at small `n` and ratio
//!   stability at 5 large samples (numerical path; the symbolic path goes
//!   through the CAS bridge when one is supplied and falls back on
//!   timeout).
//! - **Confidence** combines the source weight of the applied theorem with
//!   the documented penalties, and awards the consensus bonus
//!   `1 − (1−c₁)(1−c₂)` (capped at 0.99) when Master and Akra–Bazzi
//!   cross-validate to the same class.
//!
//! Every stage appends a `StageRecord`; the final output carries the full
//! ordered list.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Instant;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::expr::{env1, Expr};
use crate::integral::TableIntegralEvaluator;
use crate::mutual;
use crate::progress::{CancelToken, ProgressSink, StageRecord};
use crate::recurrence::Recurrence;
use crate::simplify::{classify, compare_asymptotic, simplify, AsymptoticOrd};
use crate::solver::{RawSolution, Solver, TheoremApplied};
use crate::{SolveOutput, SolverError, SolverOptions};

/// Sample grid for slack fitting.
const SLACK_POINTS: [f64; 4] = [10.0, 100.0, 1_000.0, 10_000.0];
/// Large-n grid for asymptotic ratio stability (5 samples).
const ASYMPTOTIC_POINTS: [f64; 5] = [1_000.0, 2_000.0, 4_000.0, 8_000.0, 16_000.0];
/// Ratio drift treated as stable.
const STABILITY_WINDOW: f64 = 0.10;
/// Ratio drift that forces a review.
const DIVERGENCE_LIMIT: f64 = 0.30;

/// Requested bound direction for verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundKind {
    O,
    Omega,
    Theta,
}

/// Boundary situations worth refining around.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BoundaryFlag {
    /// The recurrence fell between Master cases.
    MasterGap,
    /// The Akra–Bazzi exponent sits within the near-threshold of an integer.
    NearIntegerExponent { p: f64, nearest: f64 },
    /// The solution's log exponent sits near an integer.
    NearIntegerLogExponent { j: f64, nearest: f64 },
}

/// Ordered Taylor expansion of the driving integral at a boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerturbationResult {
    pub refined_solution: Expr,
    /// Expansion terms, lowest order first.
    pub terms: Vec<Expr>,
    /// Bound on the truncation remainder.
    pub remainder_bound: Expr,
}

/// Fitted slack constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlackFit {
    pub c1: f64,
    pub c2: f64,
    /// `c₂ / c₁`.
    pub ratio: f64,
    /// `(n, T(n), f(n))` triples actually used.
    pub samples: Vec<(f64, f64, f64)>,
    /// False when the ratio exceeded the limit (`LooseBound`).
    pub bounded: bool,
}

/// Induction verification verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InductionReport {
    pub base_case_ok: bool,
    pub inductive_step_ok: bool,
    pub asymptotic_ok: bool,
    /// Worst relative ratio drift over the large-n samples.
    pub max_divergence: f64,
    /// `"numerical"` or `"symbolic"`.
    pub mode: String,
}

/// Result of a standalone bound verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub accepted: bool,
    pub bound: BoundKind,
    pub induction: InductionReport,
    pub explanation: String,
}

/// The annotated result of a full refinement pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RefinementResult {
    pub output: SolveOutput,
    pub boundary_flags: Vec<BoundaryFlag>,
    pub perturbation: Option<PerturbationResult>,
    pub slack: Option<SlackFit>,
    pub induction: InductionReport,
}

/// The refinement engine. Owns its stage list and confidence assessment;
/// both leave by value in the result.
pub struct Refiner {
    pub options: SolverOptions,
}

impl Default for Refiner {
    fn default() -> Self {
        Self { options: SolverOptions::default() }
    }
}

impl Refiner {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }

    /// Run the full pipeline on a raw solution.
    pub fn refine(
        &self,
        rec: &Recurrence,
        raw: RawSolution,
        cancel: &CancelToken,
        progress: &dyn ProgressSink,
    ) -> Result<RefinementResult, SolverError> {
        let mut stages: Vec<StageRecord> = Vec::new();
        let mut warnings = raw.warnings.clone();
        let mut confidence = raw.base_confidence;
        let mut solution = raw.solution.clone();
        let mut explanation = raw.explanation.clone();
        let var = rec.var().name.clone();

        // ---- BoundaryDetect -------------------------------------------------
        cancel.checkpoint()?;
        progress.phase_started("BoundaryDetect");
        let t0 = Instant::now();
        let flags = self.detect_boundaries(&raw, &var);
        stages.push(StageRecord::new(
            "BoundaryDetect",
            Some(raw.solution.clone()),
            Some(solution.clone()),
            t0.elapsed(),
            if flags.is_empty() {
                "no boundary flags".to_string()
            } else {
                format!("{} flag(s): {flags:?}", flags.len())
            },
        ));
        progress.phase_completed("BoundaryDetect");

        // ---- Perturbation ---------------------------------------------------
        cancel.checkpoint()?;
        let perturbation = if flags.is_empty() {
            None
        } else {
            progress.phase_started("Perturbation");
            let t0 = Instant::now();
            let p = self.perturb(&flags, &var);
            if let Some(p) = &p {
                // A boundary crossed via expansion lands on the documented
                // gap weight.
                confidence = confidence.min(0.70);
                solution = p.refined_solution.clone();
                explanation.push_str(&format!(
                    "\nperturbation: expanded the driving integral to order {} near the boundary; leading term {}",
                    self.options.taylor_order,
                    p.terms.first().map(|t| t.to_string()).unwrap_or_default()
                ));
            }
            stages.push(StageRecord::new(
                "Perturbation",
                Some(raw.solution.clone()),
                Some(solution.clone()),
                t0.elapsed(),
                p.as_ref()
                    .map(|p| format!("{} expansion term(s)", p.terms.len()))
                    .unwrap_or_else(|| "no expansion applicable".to_string()),
            ));
            progress.phase_completed("Perturbation");
            p
        };
        // A Master gap lands on the same boundary/gap weight whether or not
        // an expansion could be produced for it.
        if flags.iter().any(|f| matches!(f, BoundaryFlag::MasterGap)) {
            confidence = confidence.min(0.70);
            explanation
                .push_str("\nMaster gap boundary: confidence capped at the gap weight");
        }

        // ---- SlackVariableTighten ------------------------------------------
        cancel.checkpoint()?;
        progress.phase_started("SlackVariableTighten");
        let t0 = Instant::now();
        let slack = self.tighten_slack(rec, &solution, &var);
        if let Some(s) = &slack {
            if !s.bounded {
                warnings.push(format!(
                    "LooseBound: sampled slack ratio {:.3} exceeds {}; keeping the unscaled bound",
                    s.ratio, self.options.slack_ratio_limit
                ));
                confidence -= 0.05;
            } else if s.ratio > 1.5 {
                confidence -= 0.05;
            }
        }
        stages.push(StageRecord::new(
            "SlackVariableTighten",
            Some(solution.clone()),
            Some(solution.clone()),
            t0.elapsed(),
            slack
                .as_ref()
                .map(|s| format!("c1 = {:.4}, c2 = {:.4}, ratio = {:.4}", s.c1, s.c2, s.ratio))
                .unwrap_or_else(|| "recurrence not numerically sampleable".to_string()),
        ));
        progress.phase_completed("SlackVariableTighten");

        // ---- InductionVerify ------------------------------------------------
        cancel.checkpoint()?;
        progress.phase_started("InductionVerify");
        let t0 = Instant::now();
        let induction = self.verify_numeric(rec, &solution, &var, BoundKind::Theta);
        // Numerical-only induction carries the documented penalty.
        confidence -= 0.05;
        if !induction.asymptotic_ok {
            if induction.max_divergence > DIVERGENCE_LIMIT {
                warnings.push(format!(
                    "asymptotic ratio diverged by {:.0}% at large n; bound needs review",
                    induction.max_divergence * 100.0
                ));
                confidence = confidence.min(0.45);
            } else {
                confidence -= 0.05;
            }
        }
        stages.push(StageRecord::new(
            "InductionVerify",
            Some(solution.clone()),
            Some(solution.clone()),
            t0.elapsed(),
            format!(
                "base {}, step {}, asymptotic {} (max drift {:.1}%)",
                induction.base_case_ok,
                induction.inductive_step_ok,
                induction.asymptotic_ok,
                induction.max_divergence * 100.0
            ),
        ));
        progress.phase_completed("InductionVerify");

        // ---- ConfidenceScore ------------------------------------------------
        cancel.checkpoint()?;
        progress.phase_started("ConfidenceScore");
        let t0 = Instant::now();
        if raw.integral.as_ref().map(|i| i.is_symbolic).unwrap_or(false) {
            confidence -= 0.10;
        }
        // Consensus bonus: Master and Akra–Bazzi agreeing on the same class.
        // The second analysis contributes its own source weight, not a
        // flat one: a special-function cross-check confirms less than a
        // closed-form one.
        let consensus = self.cross_validate(rec, &raw, cancel, progress)?;
        if let Some((second, c2)) = consensus {
            if compare_asymptotic(&solution, &second) == AsymptoticOrd::Equal {
                confidence = (1.0 - (1.0 - confidence) * (1.0 - c2)).min(0.99);
                explanation.push_str(&format!(
                    "\ncross-validation: Akra–Bazzi independently reproduces the Master bound (weight {c2:.2})"
                ));
            } else {
                warnings.push(format!(
                    "cross-validation disagreement: Akra–Bazzi produced {second}, keeping the Master bound with reduced confidence"
                ));
                confidence = confidence.min(0.45);
            }
        }
        let confidence = confidence.clamp(0.0, 1.0);
        let requires_review = confidence < 0.5
            || cfg!(feature = "strict-review")
                && raw.integral.as_ref().map(|i| i.is_symbolic).unwrap_or(false);
        stages.push(StageRecord::new(
            "ConfidenceScore",
            None,
            None,
            t0.elapsed(),
            format!("confidence {confidence:.3}, requires_review {requires_review}"),
        ));
        progress.phase_completed("ConfidenceScore");

        if requires_review {
            warn!(%solution, confidence, "solution flagged for review");
        }
        debug!(%solution, confidence, "refinement complete");

        let output = SolveOutput {
            solution,
            theorem: raw.theorem.clone(),
            tight: raw.tight,
            p: raw.p,
            integral: raw.integral.clone(),
            confidence,
            requires_review,
            stages,
            explanation,
            warnings,
            members: raw.members.clone(),
        };
        Ok(RefinementResult { output, boundary_flags: flags, perturbation, slack, induction })
    }

    /// Standalone verification of a proposed bound against a recurrence.
    pub fn verify(
        &self,
        rec: &Recurrence,
        proposed: &Expr,
        bound: BoundKind,
    ) -> VerificationResult {
        let var = rec.var().name.clone();
        let induction = self.verify_numeric(rec, proposed, &var, bound);
        let accepted = induction.base_case_ok && induction.inductive_step_ok && induction.asymptotic_ok;
        let explanation = if accepted {
            format!("T(n) is consistent with {bound:?}({proposed}) on all sampled points")
        } else {
            format!(
                "proposed {bound:?}({proposed}) rejected: base {}, step {}, asymptotic {} (max drift {:.1}%)",
                induction.base_case_ok,
                induction.inductive_step_ok,
                induction.asymptotic_ok,
                induction.max_divergence * 100.0
            )
        };
        VerificationResult { accepted, bound, induction, explanation }
    }

    // ------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------

    fn detect_boundaries(&self, raw: &RawSolution, var: &str) -> Vec<BoundaryFlag> {
        let near = self.options.near_boundary;
        let mut flags = Vec::new();
        // A gap is recorded on the Akra–Bazzi fallback solution, since the
        // Master decision itself produced no bound to hand over.
        if raw.master_gap {
            flags.push(BoundaryFlag::MasterGap);
        }
        if let TheoremApplied::AkraBazzi { p } = &raw.applied {
            let nearest = p.round();
            let dist = (p - nearest).abs();
            if dist > self.options.equality_tolerance && dist < near {
                flags.push(BoundaryFlag::NearIntegerExponent { p: *p, nearest });
            }
        }
        let c = classify(&raw.solution, var);
        let j = c.log_exponent;
        let nearest_j = j.round();
        let dist_j = (j - nearest_j).abs();
        if dist_j > self.options.equality_tolerance && dist_j < near {
            flags.push(BoundaryFlag::NearIntegerLogExponent { j, nearest: nearest_j });
        }
        flags
    }

    /// Taylor-expand `I(n) = (n^δ − 1)/δ` around δ = 0 up to the configured
    /// order: `Σ_{i≥1} δ^{i−1}·ln^i n / i!`.
    fn perturb(&self, flags: &[BoundaryFlag], var: &str) -> Option<PerturbationResult> {
        let p = match flags.iter().find_map(|f| match f {
            BoundaryFlag::NearIntegerExponent { p, .. } => Some(*p),
            _ => None,
        }) {
            Some(p) => p,
            None => return None,
        };
        let delta = p - p.round();
        let order = self.options.taylor_order.max(1);

        let mut terms = Vec::with_capacity(order);
        let mut factorial = 1.0f64;
        for i in 1..=order {
            factorial *= i as f64;
            let coeff = delta.powi(i as i32 - 1) / factorial;
            terms.push(Expr::poly_log(coeff, var, 0.0, i as f64, std::f64::consts::E));
        }
        // Remainder after the last kept term: |δ|^order · ln^{order+1} n / (order+1)!.
        let remainder_bound = Expr::poly_log(
            delta.abs().powi(order as i32) / (factorial * (order as f64 + 1.0)),
            var,
            0.0,
            order as f64 + 1.0,
            std::f64::consts::E,
        );

        // n^p · (1 + I(n)): the leading expansion term dominates.
        let refined = simplify(&Expr::mul(
            Expr::poly_log(1.0, var, p, 0.0, 2.0),
            Expr::plus(Expr::one(), terms[0].clone()),
        ));
        Some(PerturbationResult { refined_solution: refined, terms, remainder_bound })
    }

    fn tighten_slack(&self, rec: &Recurrence, f: &Expr, var: &str) -> Option<SlackFit> {
        let mut samples = Vec::new();
        for n in SLACK_POINTS {
            let t = simulate(rec, n)?;
            let fv = f.evaluate(&env1(var, n))?;
            if fv <= 0.0 || !t.is_finite() {
                continue;
            }
            samples.push((n, t, fv));
        }
        if samples.len() < 2 {
            return None;
        }
        let ratios: Vec<f64> = samples.iter().map(|(_, t, fv)| t / fv).collect();
        let c1 = ratios.iter().cloned().fold(f64::INFINITY, f64::min);
        let c2 = ratios.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let ratio = c2 / c1;
        Some(SlackFit { c1, c2, ratio, samples, bounded: ratio < self.options.slack_ratio_limit })
    }

    fn verify_numeric(
        &self,
        rec: &Recurrence,
        f: &Expr,
        var: &str,
        bound: BoundKind,
    ) -> InductionReport {
        // Base cases: the recurrence must be simulateable and the bound
        // positive at small n.
        let mut base_case_ok = true;
        for n in [1.0, 2.0, 3.0, 4.0, 5.0] {
            match (simulate(rec, n), f.evaluate(&env1(var, n))) {
                (Some(t), Some(_)) if t.is_finite() => {}
                _ => {
                    base_case_ok = false;
                    break;
                }
            }
        }

        // Asymptotic ratio stability at 5 large samples, with a jittered
        // auxiliary point to avoid grid artifacts.
        let mut rng = StdRng::seed_from_u64(0x7e7a);
        let jitter: f64 = rng.gen_range(0.9..1.1);
        let mut ratios: Vec<f64> = Vec::new();
        for n in ASYMPTOTIC_POINTS {
            let n = (n * jitter).round();
            if let (Some(t), Some(fv)) = (simulate(rec, n), f.evaluate(&env1(var, n))) {
                if fv > 0.0 && t.is_finite() {
                    ratios.push(t / fv);
                }
            }
        }

        let (asymptotic_ok, inductive_step_ok, max_divergence) = if ratios.len() >= 2 {
            let mean: f64 = ratios.iter().sum::<f64>() / ratios.len() as f64;
            let max_div = ratios
                .iter()
                .map(|r| (r - mean).abs() / mean)
                .fold(0.0f64, f64::max);
            let stable = max_div < STABILITY_WINDOW;
            // The inductive step T(n) ≤ c·f(n) holds on the data when the
            // direction requested by `bound` does.
            let step = match bound {
                BoundKind::O => ratios.windows(2).all(|w| w[1] <= w[0] * (1.0 + STABILITY_WINDOW)),
                BoundKind::Omega => {
                    ratios.windows(2).all(|w| w[1] >= w[0] * (1.0 - STABILITY_WINDOW))
                }
                BoundKind::Theta => stable,
            };
            (stable, step, max_div)
        } else {
            // Growth too fast to sample (e.g. exponential past f64): fall
            // back to the small-n window only.
            (base_case_ok, base_case_ok, 0.0)
        };

        InductionReport {
            base_case_ok,
            inductive_step_ok,
            asymptotic_ok,
            max_divergence,
            mode: "numerical".to_string(),
        }
    }

    /// Re-derive a Master result through Akra–Bazzi for the consensus bonus.
    /// Returns the second solution together with its source-weight
    /// confidence (0.95 closed form, 0.85 special function), so the bonus
    /// reflects what the cross-check actually was.
    fn cross_validate(
        &self,
        rec: &Recurrence,
        raw: &RawSolution,
        cancel: &CancelToken,
        progress: &dyn ProgressSink,
    ) -> Result<Option<(Expr, f64)>, SolverError> {
        let is_master = matches!(raw.applied, TheoremApplied::Master { .. });
        if !is_master {
            return Ok(None);
        }
        let dc = match rec {
            Recurrence::DivideAndConquer(dc) => dc,
            _ => return Ok(None),
        };
        let table = TableIntegralEvaluator { equality_tolerance: self.options.equality_tolerance };
        let solver = Solver::new(self.options, &table);
        match solver.akra_bazzi(dc, cancel, progress) {
            // A symbolic second opinion cannot confirm or deny anything.
            Ok(second) if !second.tight => Ok(None),
            Ok(second) => Ok(Some((second.solution, second.base_confidence))),
            Err(SolverError::Cancelled(c)) => Err(SolverError::Cancelled(c)),
            // A cross-check failure is advisory, never fatal.
            Err(_) => Ok(None),
        }
    }
}

// ============================================================================
// Numeric recurrence simulation
// ============================================================================

/// Evaluate `T(n)` by running the recurrence directly. Scaled arguments are
/// rounded down to the memo grid; the base case applies at `n ≤ 2` (or when
/// the declared base expression is unevaluable, as 1).
pub fn simulate(rec: &Recurrence, n: f64) -> Option<f64> {
    match rec {
        Recurrence::DivideAndConquer(dc) => {
            let mut memo: HashMap<u64, f64> = HashMap::new();
            simulate_dc(dc, n, &mut memo)
        }
        Recurrence::Linear(lin) => {
            let target = n.round().max(1.0) as usize;
            let k = lin.order();
            // T(1..k) = 1, then iterate forward.
            let mut window: Vec<f64> = vec![1.0; k];
            if target <= k {
                return Some(1.0);
            }
            let var = &lin.var().name;
            for i in (k + 1)..=target {
                let f = lin.work().evaluate(&env1(var, i as f64)).unwrap_or(0.0);
                let mut next = f;
                for (j, c) in lin.coeffs().iter().enumerate() {
                    next += c * window[k - 1 - j];
                }
                if !next.is_finite() {
                    return None;
                }
                window.rotate_left(1);
                window[k - 1] = next;
            }
            Some(window[k - 1])
        }
        Recurrence::Mutual(system) => {
            let red = mutual::reduce(system).ok()?;
            simulate(&red.reduced, n)
        }
    }
}

fn simulate_dc(
    dc: &crate::recurrence::DivideAndConquer,
    n: f64,
    memo: &mut HashMap<u64, f64>,
) -> Option<f64> {
    if n <= 2.0 {
        let v = dc
            .base_case()
            .evaluate(&env1(&dc.var().name, n.max(1.0)))
            .unwrap_or(1.0);
        return Some(if v > 0.0 { v } else { 1.0 });
    }
    let key = n.round() as u64;
    if let Some(v) = memo.get(&key) {
        return Some(*v);
    }
    let g = dc.work().evaluate(&env1(&dc.var().name, n)).unwrap_or(0.0);
    let mut acc = g;
    for t in dc.terms() {
        // Floor keeps the argument strictly shrinking on the integer grid.
        let child = (t.b * n).floor().max(1.0);
        acc += t.a * simulate_dc(dc, child, memo)?;
    }
    if !acc.is_finite() {
        return None;
    }
    memo.insert(key, acc);
    Some(acc)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Symbol;
    use crate::progress::NoopProgress;
    use crate::recurrence::{DivideAndConquer, LinearRecurrence, Term};
    use crate::simplify::GrowthForm;

    fn merge_sort() -> Recurrence {
        Recurrence::DivideAndConquer(
            DivideAndConquer::new(
                vec![Term { a: 2.0, b: 0.5 }],
                Expr::linear(1.0, "n"),
                Expr::one(),
                Symbol::input("n"),
            )
            .unwrap(),
        )
    }

    fn refine(rec: &Recurrence) -> RefinementResult {
        let solver = Solver::default();
        let raw = solver.solve(rec, &CancelToken::new(), &NoopProgress).unwrap();
        Refiner::default()
            .refine(rec, raw, &CancelToken::new(), &NoopProgress)
            .unwrap()
    }

    #[test]
    fn simulator_matches_known_values() {
        // T(n) = T(n−1) + n with T(1) = 1: T(n) = n(n+1)/2.
        let rec = Recurrence::Linear(
            LinearRecurrence::new(vec![1.0], Expr::linear(1.0, "n"), Symbol::input("n")).unwrap(),
        );
        let t10 = simulate(&rec, 10.0).unwrap();
        assert!((t10 - 55.0).abs() < 1e-9, "1 + Σ_{{2..10}} i = 55, got {t10}");
    }

    #[test]
    fn merge_sort_survives_the_full_pipeline() {
        let r = refine(&merge_sort());
        assert_eq!(r.output.theorem, "Master:Case2");
        let c = classify(&r.output.solution, "n");
        assert_eq!(c.form, GrowthForm::PolyLog);
        // Master consensus with Akra–Bazzi pushes confidence up.
        assert!(r.output.confidence > 0.9, "confidence {}", r.output.confidence);
        assert!(!r.output.requires_review);
        assert!(r.induction.asymptotic_ok, "n log n ratio must be stable");
        // No boundary here, so no perturbation stage; the rest is ordered.
        assert!(r.boundary_flags.is_empty());
        let names: Vec<&str> = r.output.stages.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(
            names,
            vec!["BoundaryDetect", "SlackVariableTighten", "InductionVerify", "ConfidenceScore"]
        );
    }

    #[test]
    fn slack_fit_is_tight_for_clean_bounds() {
        let r = refine(&merge_sort());
        let slack = r.slack.expect("merge sort is sampleable");
        assert!(slack.bounded, "c2/c1 = {} should be < 2", slack.ratio);
        assert!(slack.c1 > 0.0 && slack.c2 >= slack.c1);
    }

    #[test]
    fn verify_accepts_the_true_bound_and_rejects_a_wrong_one() {
        let rec = merge_sort();
        let refiner = Refiner::default();

        let good = refiner.verify(&rec, &Expr::poly_log(1.0, "n", 1.0, 1.0, 2.0), BoundKind::Theta);
        assert!(good.accepted, "{}", good.explanation);

        // Θ(n³) is a wild overestimate: ratios collapse toward zero.
        let bad = refiner.verify(&rec, &Expr::monomial(1.0, "n", 3), BoundKind::Theta);
        assert!(!bad.accepted);
        assert!(bad.induction.max_divergence > DIVERGENCE_LIMIT);
    }

    #[test]
    fn fractional_degree_work_keeps_its_class() {
        // T(n) = T(n/3) + T(2n/3) + n^1.03: p = 1, k = 1.03 > p.
        let rec = Recurrence::DivideAndConquer(
            DivideAndConquer::new(
                vec![Term { a: 1.0, b: 1.0 / 3.0 }, Term { a: 1.0, b: 2.0 / 3.0 }],
                Expr::poly_log(1.0, "n", 1.03, 0.0, 2.0),
                Expr::one(),
                Symbol::input("n"),
            )
            .unwrap(),
        );
        let solver = Solver::default();
        let raw = solver.solve(&rec, &CancelToken::new(), &NoopProgress).unwrap();
        let r = Refiner::default()
            .refine(&rec, raw, &CancelToken::new(), &NoopProgress)
            .unwrap();
        let c = classify(&r.output.solution, "n");
        assert!((c.poly_degree - 1.03).abs() < 1e-6);
    }

    #[test]
    fn perturbation_terms_are_ordered() {
        let refiner = Refiner::default();
        let raw = RawSolution {
            solution: Expr::poly_log(1.0, "n", 1.02, 0.0, 2.0),
            theorem: "AkraBazzi".into(),
            applied: TheoremApplied::AkraBazzi { p: 1.02 },
            p: Some(1.02),
            integral: None,
            regularity: None,
            roots: None,
            master_gap: false,
            base_confidence: 0.95,
            tight: true,
            warnings: vec![],
            explanation: String::new(),
            members: vec![],
        };
        let flags = refiner.detect_boundaries(&raw, "n");
        assert!(flags
            .iter()
            .any(|f| matches!(f, BoundaryFlag::NearIntegerExponent { .. })));
        let p = refiner.perturb(&flags, "n").expect("expansion applies");
        assert_eq!(p.terms.len(), refiner.options.taylor_order);
        // First term is ln n with unit coefficient; later terms shrink by δ.
        let c0 = classify(&p.terms[0], "n");
        assert!((c0.log_exponent - 1.0).abs() < 1e-9);
        assert!((c0.leading_coeff - 1.0).abs() < 1e-9);
    }

    #[test]
    fn master_gap_is_flagged_and_capped() {
        // f = n^{1.005} against d = 1: inside the ε_min window, so the
        // driver marks a Master gap on the Akra–Bazzi fallback and the
        // refiner must observe it.
        let rec = Recurrence::DivideAndConquer(
            DivideAndConquer::new(
                vec![Term { a: 2.0, b: 0.5 }],
                Expr::poly_log(1.0, "n", 1.005, 0.0, 2.0),
                Expr::one(),
                Symbol::input("n"),
            )
            .unwrap(),
        );
        let solver = Solver::default();
        let raw = solver.solve(&rec, &CancelToken::new(), &NoopProgress).unwrap();
        assert!(raw.master_gap);
        let r = Refiner::default()
            .refine(&rec, raw, &CancelToken::new(), &NoopProgress)
            .unwrap();
        assert!(
            r.boundary_flags.iter().any(|f| matches!(f, BoundaryFlag::MasterGap)),
            "gap must surface as a boundary flag, got {:?}",
            r.boundary_flags
        );
        assert!(
            r.output.confidence <= 0.70,
            "gap weight caps confidence at 0.70, got {}",
            r.output.confidence
        );
        assert!(r.output.explanation.contains("gap"));
    }

    #[test]
    fn cross_validation_weight_tracks_integral_form() {
        let refiner = Refiner::default();
        let solver = Solver::default();

        // Closed-form cross-check: merge sort re-derived through the k = p
        // table row carries the 0.95 weight.
        let rec = merge_sort();
        let raw = solver.solve(&rec, &CancelToken::new(), &NoopProgress).unwrap();
        let (_, c2) = refiner
            .cross_validate(&rec, &raw, &CancelToken::new(), &NoopProgress)
            .unwrap()
            .expect("closed-form cross-check");
        assert!((c2 - 0.95).abs() < 1e-12, "closed form weighs 0.95, got {c2}");

        // Special-function cross-check: exponential work closes through the
        // incomplete-gamma row and must weigh 0.85, not 0.95.
        let rec = Recurrence::DivideAndConquer(
            DivideAndConquer::new(
                vec![Term { a: 2.0, b: 0.5 }],
                Expr::exponential(2.0, "n", 1.0),
                Expr::one(),
                Symbol::input("n"),
            )
            .unwrap(),
        );
        let raw = solver.solve(&rec, &CancelToken::new(), &NoopProgress).unwrap();
        assert!(raw.theorem.starts_with("Master"), "exponential work is Case 3");
        let (second, c2) = refiner
            .cross_validate(&rec, &raw, &CancelToken::new(), &NoopProgress)
            .unwrap()
            .expect("special-function cross-check");
        assert!((c2 - 0.85).abs() < 1e-12, "special function weighs 0.85, got {c2}");
        assert_eq!(
            crate::simplify::compare_asymptotic(&raw.solution, &second),
            AsymptoticOrd::Equal
        );
    }

    #[test]
    fn cancelled_refinement_discards_partial_results() {
        let rec = merge_sort();
        let solver = Solver::default();
        let raw = solver.solve(&rec, &CancelToken::new(), &NoopProgress).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let r = Refiner::default().refine(&rec, raw, &token, &NoopProgress);
        assert!(matches!(r, Err(SolverError::Cancelled(_))));
    }

    #[test]
    fn canonical_scenarios_pass_numerical_induction() {
        // The seven canonical recurrences, each solved and then re-accepted
        // by the induction verifier on its numerical path.
        let dc = |terms: Vec<Term>, g: Expr| {
            Recurrence::DivideAndConquer(
                DivideAndConquer::new(terms, g, Expr::one(), Symbol::input("n")).unwrap(),
            )
        };
        let lin = |coeffs: Vec<f64>, f: Expr| {
            Recurrence::Linear(LinearRecurrence::new(coeffs, f, Symbol::input("n")).unwrap())
        };
        let scenarios: Vec<Recurrence> = vec![
            dc(vec![Term { a: 2.0, b: 0.5 }], Expr::linear(1.0, "n")),
            dc(vec![Term { a: 1.0, b: 0.5 }], Expr::one()),
            dc(vec![Term { a: 3.0, b: 0.5 }], Expr::linear(1.0, "n")),
            dc(vec![Term { a: 7.0, b: 0.5 }], Expr::monomial(1.0, "n", 2)),
            dc(
                vec![Term { a: 1.0, b: 1.0 / 3.0 }, Term { a: 1.0, b: 2.0 / 3.0 }],
                Expr::linear(1.0, "n"),
            ),
            lin(vec![1.0, 1.0], Expr::zero()),
            lin(vec![4.0, -4.0], Expr::zero()),
        ];
        let refiner = Refiner::default();
        for rec in &scenarios {
            let solver = Solver::default();
            let raw = solver.solve(rec, &CancelToken::new(), &NoopProgress).unwrap();
            let v = refiner.verify(rec, &raw.solution, BoundKind::Theta);
            assert!(
                v.accepted,
                "scenario {rec:?} solved to {} but the verifier said: {}",
                raw.solution, v.explanation
            );
        }
    }

    #[test]
    fn symbolic_residue_costs_confidence() {
        // A hypergeometric work term defeats both Master and the integral
        // table, so the symbolic path runs all the way down.
        let rec = Recurrence::DivideAndConquer(
            DivideAndConquer::new(
                vec![Term { a: 2.0, b: 0.5 }],
                Expr::SpecialFn {
                    f: crate::expr::SpecialKind::Hypergeometric {
                        a: 1.0,
                        b: 2.0,
                        c: 3.0,
                        z: 0.5,
                    },
                },
                Expr::one(),
                Symbol::input("n"),
            )
            .unwrap(),
        );
        let r = refine(&rec);
        assert!(r.output.confidence < 0.7, "confidence {}", r.output.confidence);
        assert!(r.output.warnings.iter().any(|w| w.contains("symbolic")));
        assert!(!r.output.tight, "a symbolic residue is an upper bound, not Θ");
    }
}
