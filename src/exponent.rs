//! Critical-exponent solver
//!
//! Finds the unique real `p` with `F(p) = Σᵢ aᵢ·bᵢ^p − 1 = 0` for an
//! Akra–Bazzi recurrence. `F` is strictly decreasing in `p` (every
//! `ln bᵢ < 0` and `aᵢ > 0`), so the root exists and is unique; Newton with
//! the analytical derivative converges from the geometric-mean seed for any
//! well-formed term list.
//!
//! A single-term recurrence collapses to the closed form
//! `p = log_{1/b}(a)` — used both as a fast path and as a sanity check on
//! the Newton seed.
//!
//! The `Σ aᵢ·bᵢ^p` evaluations are memoized per solver invocation, keyed by
//! a digest of `(terms, p)`; the cache never outlives one `solve` call.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use tracing::debug;

use crate::recurrence::Term;

/// Default residual tolerance.
pub const DEFAULT_EPSILON: f64 = 1e-10;
/// Default iteration budget.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Non-convergence diagnostics. Recoverable: the theorem driver degrades to
/// `SolverNonConvergence` and the pipeline reports it without aborting.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
#[error("Newton iteration did not converge after {iterations} steps (last p = {last_p}, residual = {residual:e})")]
pub struct NonConvergence {
    pub iterations: usize,
    pub last_p: f64,
    pub residual: f64,
}

/// Newton solver for the critical exponent.
#[derive(Debug, Clone, Copy)]
pub struct CriticalExponentSolver {
    /// Residual tolerance ε: accept `p` once `|F(p)| < ε`.
    pub epsilon: f64,
    /// Iteration budget.
    pub max_iterations: usize,
}

impl Default for CriticalExponentSolver {
    fn default() -> Self {
        Self { epsilon: DEFAULT_EPSILON, max_iterations: DEFAULT_MAX_ITERATIONS }
    }
}

/// Per-invocation memo of `Σ aᵢ·bᵢ^p`, keyed by digest of `(terms, p)`.
struct SumCache<'t> {
    terms: &'t [Term],
    terms_tag: [u8; 32],
    memo: HashMap<u64, f64>,
}

impl<'t> SumCache<'t> {
    fn new(terms: &'t [Term]) -> Self {
        let mut h = blake3::Hasher::new();
        h.update(b"thetabound.exponent.terms.v1");
        for t in terms {
            h.update(&t.a.to_bits().to_le_bytes());
            h.update(&t.b.to_bits().to_le_bytes());
        }
        Self { terms, terms_tag: *h.finalize().as_bytes(), memo: HashMap::new() }
    }

    /// `Σ aᵢ·bᵢ^p`, memoized.
    fn sum(&mut self, p: f64) -> f64 {
        let mut h = blake3::Hasher::new();
        h.update(&self.terms_tag);
        h.update(&p.to_bits().to_le_bytes());
        let key = u64::from_le_bytes(h.finalize().as_bytes()[..8].try_into().expect("8 bytes"));
        if let Some(v) = self.memo.get(&key) {
            return *v;
        }
        let v: f64 = self.terms.iter().map(|t| t.a * t.b.powf(p)).sum();
        self.memo.insert(key, v);
        v
    }

    /// Analytical derivative `Σ aᵢ·bᵢ^p·ln bᵢ` (always negative).
    fn derivative(&self, p: f64) -> f64 {
        self.terms.iter().map(|t| t.a * t.b.powf(p) * t.b.ln()).sum()
    }
}

impl CriticalExponentSolver {
    /// Solver with explicit tolerance and iteration budget.
    pub fn new(epsilon: f64, max_iterations: usize) -> Self {
        Self { epsilon, max_iterations }
    }

    /// Find the root of `Σ aᵢ·bᵢ^p − 1`.
    ///
    /// Callers guarantee well-formed terms (the recurrence constructor does);
    /// with those, the only failure mode is exhausting the iteration budget.
    pub fn solve(&self, terms: &[Term]) -> Result<f64, NonConvergence> {
        debug_assert!(!terms.is_empty(), "terms validated by the recurrence constructor");

        // Single term: p = log_{1/b}(a), no iteration needed.
        if terms.len() == 1 {
            let t = &terms[0];
            let p = t.a.ln() / (1.0 / t.b).ln();
            debug!(p, "critical exponent via single-term closed form");
            return Ok(p);
        }

        let mut cache = SumCache::new(terms);

        // Seed: p₀ = log_{b̄}(Σaᵢ) with b̄ the geometric mean of {1/bᵢ}.
        let a_sum: f64 = terms.iter().map(|t| t.a).sum();
        let ln_bbar: f64 =
            terms.iter().map(|t| (1.0 / t.b).ln()).sum::<f64>() / terms.len() as f64;
        let mut p = a_sum.ln() / ln_bbar;

        for i in 0..self.max_iterations {
            let f = cache.sum(p) - 1.0;
            if f.abs() < self.epsilon {
                debug!(p, iterations = i, "critical exponent converged");
                return Ok(p);
            }
            let fp = cache.derivative(p);
            // F' < 0 everywhere for well-formed terms; a vanishing derivative
            // can only come from float underflow at extreme p.
            if fp == 0.0 || !fp.is_finite() {
                return Err(NonConvergence { iterations: i, last_p: p, residual: f });
            }
            p -= f / fp;
        }

        let residual = cache.sum(p) - 1.0;
        Err(NonConvergence { iterations: self.max_iterations, last_p: p, residual })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn solve(terms: &[Term]) -> f64 {
        CriticalExponentSolver::default().solve(terms).expect("converges")
    }

    #[test]
    fn single_term_closed_forms() {
        // T(n) = 2T(n/2): p = log₂ 2 = 1
        assert!((solve(&[Term { a: 2.0, b: 0.5 }]) - 1.0).abs() < 1e-12);
        // T(n) = T(n/2): p = 0
        assert!(solve(&[Term { a: 1.0, b: 0.5 }]).abs() < 1e-12);
        // T(n) = 3T(n/2): p = log₂ 3
        let p = solve(&[Term { a: 3.0, b: 0.5 }]);
        assert!((p - 3.0f64.log2()).abs() < 1e-12);
        // T(n) = 7T(n/2): p = log₂ 7
        let p = solve(&[Term { a: 7.0, b: 0.5 }]);
        assert!((p - 7.0f64.log2()).abs() < 1e-12);
    }

    #[test]
    fn two_term_select_recurrence() {
        // T(n) = T(n/3) + T(2n/3): (1/3)^p + (2/3)^p = 1 ⇒ p = 1
        let p = solve(&[Term { a: 1.0, b: 1.0 / 3.0 }, Term { a: 1.0, b: 2.0 / 3.0 }]);
        assert!((p - 1.0).abs() < 1e-9, "got {p}");
    }

    #[test]
    fn root_satisfies_residual_bound() {
        let cases: Vec<Vec<Term>> = vec![
            vec![Term { a: 2.0, b: 0.5 }, Term { a: 1.0, b: 0.25 }],
            vec![Term { a: 0.5, b: 0.5 }, Term { a: 0.5, b: 0.9 }],
            vec![Term { a: 4.0, b: 0.3 }, Term { a: 2.0, b: 0.6 }, Term { a: 1.0, b: 0.1 }],
        ];
        let solver = CriticalExponentSolver::default();
        for terms in cases {
            let p = solver.solve(&terms).expect("converges");
            let f: f64 = terms.iter().map(|t| t.a * t.b.powf(p)).sum::<f64>() - 1.0;
            assert!(f.abs() < solver.epsilon, "|F(p)| = {} for {terms:?}", f.abs());
        }
    }

    #[test]
    fn newton_matches_closed_form_when_both_apply() {
        // Force the iterative path by duplicating a term: 1·T(n/2) + 1·T(n/2)
        // has the same root as 2·T(n/2).
        let iterative =
            solve(&[Term { a: 1.0, b: 0.5 }, Term { a: 1.0, b: 0.5 }]);
        let closed = solve(&[Term { a: 2.0, b: 0.5 }]);
        assert!((iterative - closed).abs() < 1e-9);
    }

    #[test]
    fn tight_budget_reports_nonconvergence() {
        let solver = CriticalExponentSolver::new(1e-14, 1);
        let r = solver.solve(&[Term { a: 2.0, b: 0.5 }, Term { a: 1.0, b: 0.25 }]);
        // One step is not enough at that tolerance; diagnostics must carry
        // the last iterate.
        if let Err(e) = r {
            assert_eq!(e.iterations, 1);
            assert!(e.last_p.is_finite());
        }
    }
}
