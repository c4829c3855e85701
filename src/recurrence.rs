//! Recurrence model & well-formedness
//!
//! Normalized recurrence shapes consumed by the theorem driver:
//!
//! - **Divide-and-conquer** `T(n) = Σᵢ aᵢ·T(bᵢ·n) + g(n)` with every
//!   `aᵢ > 0` and every scale `bᵢ` strictly inside `(0, 1)`.
//! - **Linear** `T(n) = Σⱼ cⱼ·T(n−j) + f(n)` with at least one coefficient.
//! - **Mutual system**: an ordered cycle of components, each reducing its
//!   argument by subtraction or by scaling, each carrying its own
//!   non-recursive work.
//!
//! Construction validates everything up front; callers never see a partially
//! valid recurrence. Validation failures use the wire-stable taxonomy
//! (`ZeroCoefficient`, `ScaleOutOfRange`, `EmptyRecurrence`,
//! `InconsistentVariable`), mirrored into the top-level `SolverError` as
//! `MalformedRecurrence`.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::expr::{Expr, Symbol};

/// One recursive term `a·T(b·n)` of a divide-and-conquer recurrence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Term {
    /// Multiplicity `a > 0`.
    pub a: f64,
    /// Scale `b ∈ (0, 1)`.
    pub b: f64,
}

/// Validation errors for recurrence construction.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum RecurrenceError {
    #[error("term {index}: coefficient a must be positive (got {a})")]
    ZeroCoefficient { index: usize, a: f64 },
    #[error("term {index}: scale b must lie strictly in (0, 1) (got {b})")]
    ScaleOutOfRange { index: usize, b: f64 },
    #[error("recurrence has no recursive terms")]
    EmptyRecurrence,
    #[error("expression mentions `{found}` but the recurrence variable is `{declared}`")]
    InconsistentVariable { declared: String, found: String },
}

fn check_var(declared: &Symbol, e: &Expr) -> Result<(), RecurrenceError> {
    for v in e.free_vars() {
        if v != declared.name {
            return Err(RecurrenceError::InconsistentVariable {
                declared: declared.name.to_string(),
                found: v.to_string(),
            });
        }
    }
    Ok(())
}

// ============================================================================
// Divide-and-conquer
// ============================================================================

/// `T(n) = Σᵢ aᵢ·T(bᵢ·n) + g(n)`, with a base-case expression for small `n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivideAndConquer {
    terms: Vec<Term>,
    work: Expr,
    base_case: Expr,
    var: Symbol,
}

impl DivideAndConquer {
    /// Validating constructor.
    pub fn new(
        terms: Vec<Term>,
        work: Expr,
        base_case: Expr,
        var: Symbol,
    ) -> Result<Self, RecurrenceError> {
        if terms.is_empty() {
            return Err(RecurrenceError::EmptyRecurrence);
        }
        for (i, t) in terms.iter().enumerate() {
            if !(t.a > 0.0) {
                return Err(RecurrenceError::ZeroCoefficient { index: i, a: t.a });
            }
            if !(t.b > 0.0 && t.b < 1.0) {
                return Err(RecurrenceError::ScaleOutOfRange { index: i, b: t.b });
            }
        }
        check_var(&var, &work)?;
        check_var(&var, &base_case)?;
        Ok(Self { terms, work, base_case, var })
    }

    /// Recursive terms, in declaration order.
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }
    /// Non-recursive work `g(n)`.
    pub fn work(&self) -> &Expr {
        &self.work
    }
    /// Base-case expression.
    pub fn base_case(&self) -> &Expr {
        &self.base_case
    }
    /// The recurrence variable.
    pub fn var(&self) -> &Symbol {
        &self.var
    }

    /// Master Theorem shape: exactly one term with `a ≥ 1` (the split factor
    /// `1/b > 1` holds for every well-formed term).
    pub fn fits_master(&self) -> bool {
        self.terms.len() == 1 && self.terms[0].a >= 1.0
    }

    /// Akra–Bazzi shape: at least one term, every `aᵢ > 0`, every
    /// `bᵢ ∈ (0, 1)` — guaranteed by construction, so this is just
    /// non-emptiness.
    pub fn fits_akra_bazzi(&self) -> bool {
        !self.terms.is_empty()
    }
}

// ============================================================================
// Linear
// ============================================================================

/// `T(n) = Σⱼ cⱼ·T(n−j) + f(n)`, `j = 1..k`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearRecurrence {
    coeffs: Vec<f64>,
    work: Expr,
    var: Symbol,
}

impl LinearRecurrence {
    /// Validating constructor. `coeffs[j-1]` multiplies `T(n−j)`.
    pub fn new(coeffs: Vec<f64>, work: Expr, var: Symbol) -> Result<Self, RecurrenceError> {
        if coeffs.is_empty() || coeffs.iter().all(|c| *c == 0.0) {
            return Err(RecurrenceError::EmptyRecurrence);
        }
        check_var(&var, &work)?;
        Ok(Self { coeffs, work, var })
    }

    /// The coefficient sequence `[c₁, …, cₖ]`.
    pub fn coeffs(&self) -> &[f64] {
        &self.coeffs
    }
    /// Non-recursive work `f(n)`.
    pub fn work(&self) -> &Expr {
        &self.work
    }
    /// The recurrence variable.
    pub fn var(&self) -> &Symbol {
        &self.var
    }
    /// Order `k` of the recurrence.
    pub fn order(&self) -> usize {
        self.coeffs.len()
    }
}

// ============================================================================
// Mutual systems
// ============================================================================

/// How a component of a mutual cycle shrinks its argument before calling the
/// next component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "by")]
pub enum Reduction {
    /// Calls the next component at `n − r`.
    Subtract { r: u64 },
    /// Calls the next component at `b·n`, `b ∈ (0, 1)`.
    Scale { b: f64 },
}

/// One member of a mutual-recursion cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutualComponent {
    /// Name of the method/function this component models.
    pub name: String,
    /// Its own non-recursive work.
    pub work: Expr,
    /// How it reduces the argument when calling its successor in the cycle.
    pub reduction: Reduction,
}

/// An SCC of mutually recursive relations, stored as the ordered cycle
/// `M₁ → M₂ → … → Mₖ → M₁`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutualSystem {
    components: Vec<MutualComponent>,
    var: Symbol,
}

impl MutualSystem {
    /// Validating constructor: at least one component, scales in range,
    /// work expressions over the declared variable. A cycle where no step
    /// reduces at all is rejected later by the reducer (`NonReducingCycle`),
    /// not here: that is a semantic property, not a shape error.
    pub fn new(components: Vec<MutualComponent>, var: Symbol) -> Result<Self, RecurrenceError> {
        if components.is_empty() {
            return Err(RecurrenceError::EmptyRecurrence);
        }
        for (i, c) in components.iter().enumerate() {
            if let Reduction::Scale { b } = c.reduction {
                if !(b > 0.0 && b < 1.0) {
                    return Err(RecurrenceError::ScaleOutOfRange { index: i, b });
                }
            }
            check_var(&var, &c.work)?;
        }
        Ok(Self { components, var })
    }

    /// The cycle, in call order.
    pub fn components(&self) -> &[MutualComponent] {
        &self.components
    }
    /// The shared argument variable.
    pub fn var(&self) -> &Symbol {
        &self.var
    }
}

// ============================================================================
// The normalized input to the pipeline
// ============================================================================

/// Any recurrence the solver accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape")]
pub enum Recurrence {
    DivideAndConquer(DivideAndConquer),
    Linear(LinearRecurrence),
    Mutual(MutualSystem),
}

impl Recurrence {
    /// The recurrence variable.
    pub fn var(&self) -> &Symbol {
        match self {
            Recurrence::DivideAndConquer(r) => r.var(),
            Recurrence::Linear(r) => r.var(),
            Recurrence::Mutual(r) => r.var(),
        }
    }

    pub fn is_linear(&self) -> bool {
        matches!(self, Recurrence::Linear(_))
    }
    pub fn is_mutual(&self) -> bool {
        matches!(self, Recurrence::Mutual(_))
    }
    pub fn fits_master(&self) -> bool {
        matches!(self, Recurrence::DivideAndConquer(r) if r.fits_master())
    }
    pub fn fits_akra_bazzi(&self) -> bool {
        matches!(self, Recurrence::DivideAndConquer(r) if r.fits_akra_bazzi())
    }
}

/// Stable 32-byte digest of a recurrence, used in logs and solve reports.
pub fn recurrence_digest(r: &Recurrence) -> [u8; 32] {
    let mut h = blake3::Hasher::new();
    h.update(b"thetabound.recurrence.v1");
    h.update(&serde_json::to_vec(r).unwrap_or_default());
    *h.finalize().as_bytes()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn n() -> Symbol {
        Symbol::input("n")
    }

    #[test]
    fn dc_constructor_validates() {
        // T(n) = 2T(n/2) + n: fine.
        let ok = DivideAndConquer::new(
            vec![Term { a: 2.0, b: 0.5 }],
            Expr::linear(1.0, "n"),
            Expr::one(),
            n(),
        );
        assert!(ok.is_ok());

        // a = 0 rejected.
        let bad = DivideAndConquer::new(
            vec![Term { a: 0.0, b: 0.5 }],
            Expr::linear(1.0, "n"),
            Expr::one(),
            n(),
        );
        assert!(matches!(bad, Err(RecurrenceError::ZeroCoefficient { index: 0, .. })));

        // b = 1 rejected.
        let bad = DivideAndConquer::new(
            vec![Term { a: 1.0, b: 1.0 }],
            Expr::linear(1.0, "n"),
            Expr::one(),
            n(),
        );
        assert!(matches!(bad, Err(RecurrenceError::ScaleOutOfRange { index: 0, .. })));

        // No terms rejected.
        let bad = DivideAndConquer::new(vec![], Expr::linear(1.0, "n"), Expr::one(), n());
        assert!(matches!(bad, Err(RecurrenceError::EmptyRecurrence)));
    }

    #[test]
    fn dc_rejects_foreign_variable() {
        let bad = DivideAndConquer::new(
            vec![Term { a: 2.0, b: 0.5 }],
            Expr::linear(1.0, "m"),
            Expr::one(),
            n(),
        );
        assert!(matches!(bad, Err(RecurrenceError::InconsistentVariable { .. })));
    }

    #[test]
    fn master_and_akra_bazzi_predicates() {
        let single = DivideAndConquer::new(
            vec![Term { a: 2.0, b: 0.5 }],
            Expr::linear(1.0, "n"),
            Expr::one(),
            n(),
        )
        .unwrap();
        assert!(single.fits_master());
        assert!(single.fits_akra_bazzi());

        // Two terms: Akra–Bazzi territory, not Master.
        let multi = DivideAndConquer::new(
            vec![Term { a: 1.0, b: 1.0 / 3.0 }, Term { a: 1.0, b: 2.0 / 3.0 }],
            Expr::linear(1.0, "n"),
            Expr::one(),
            n(),
        )
        .unwrap();
        assert!(!multi.fits_master());
        assert!(multi.fits_akra_bazzi());

        // a < 1 single-term: not Master shape either.
        let sub = DivideAndConquer::new(
            vec![Term { a: 0.5, b: 0.5 }],
            Expr::one(),
            Expr::one(),
            n(),
        )
        .unwrap();
        assert!(!sub.fits_master());
    }

    #[test]
    fn linear_constructor_validates() {
        let ok = LinearRecurrence::new(vec![1.0, 1.0], Expr::zero(), n());
        assert!(ok.is_ok());
        let bad = LinearRecurrence::new(vec![], Expr::zero(), n());
        assert!(matches!(bad, Err(RecurrenceError::EmptyRecurrence)));
        let bad = LinearRecurrence::new(vec![0.0, 0.0], Expr::zero(), n());
        assert!(matches!(bad, Err(RecurrenceError::EmptyRecurrence)));
    }

    #[test]
    fn mutual_constructor_validates_scales() {
        let ok = MutualSystem::new(
            vec![
                MutualComponent {
                    name: "even".into(),
                    work: Expr::one(),
                    reduction: Reduction::Subtract { r: 1 },
                },
                MutualComponent {
                    name: "odd".into(),
                    work: Expr::one(),
                    reduction: Reduction::Subtract { r: 1 },
                },
            ],
            n(),
        );
        assert!(ok.is_ok());

        let bad = MutualSystem::new(
            vec![MutualComponent {
                name: "half".into(),
                work: Expr::one(),
                reduction: Reduction::Scale { b: 1.5 },
            }],
            n(),
        );
        assert!(matches!(bad, Err(RecurrenceError::ScaleOutOfRange { .. })));
    }

    #[test]
    fn digest_is_stable_and_shape_sensitive() {
        let r1 = Recurrence::DivideAndConquer(
            DivideAndConquer::new(
                vec![Term { a: 2.0, b: 0.5 }],
                Expr::linear(1.0, "n"),
                Expr::one(),
                n(),
            )
            .unwrap(),
        );
        let r2 = Recurrence::DivideAndConquer(
            DivideAndConquer::new(
                vec![Term { a: 3.0, b: 0.5 }],
                Expr::linear(1.0, "n"),
                Expr::one(),
                n(),
            )
            .unwrap(),
        );
        assert_eq!(recurrence_digest(&r1), recurrence_digest(&r1));
        assert_ne!(recurrence_digest(&r1), recurrence_digest(&r2));
    }
}
