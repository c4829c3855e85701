//! Mutual-recursion reducer
//!
//! Collapses an SCC cycle `M₁ → M₂ → … → Mₖ → M₁` into a single
//! recurrence the theorem driver can solve:
//!
//! - **Subtraction cycle** (every step reduces by a constant): one trip
//!   around the cycle shrinks the argument by `R = Σ rᵢ` and performs
//!   `G(n) = Σ workᵢ(n)`, so the cycle is `T(n) = T(n−R) + G(n)`.
//! - **Division cycle** (every step scales): the compound scale is
//!   `b = Π bᵢ ∈ (0, 1)`, so the cycle is `T(n) = T(b·n) + G(n)`.
//! - **Mixed cycle**: the constant subtractions vanish against the
//!   multiplicative shrink (`b·n − R ~ b·n`), so the division reduction is
//!   used with the scale steps alone and the result is flagged for reduced
//!   confidence.
//!
//! Every member of the cycle shares the resulting asymptotic class (they
//! differ by constants only); the caller applies the one solution to all
//! component names.
//!
//! A cycle where no step reduces anything is rejected as `NonReducingCycle`.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::expr::Expr;
use crate::recurrence::{
    DivideAndConquer, LinearRecurrence, MutualSystem, Recurrence, RecurrenceError, Reduction, Term,
};
use crate::simplify::simplify;

/// How the cycle reduces its argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleKind {
    Subtraction,
    Division,
    Mixed,
}

/// Reduction failures.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum MutualError {
    #[error("cycle never reduces its argument; the system does not terminate")]
    NonReducingCycle,
    #[error(transparent)]
    Malformed(#[from] RecurrenceError),
}

/// Result of collapsing a mutual system.
#[derive(Debug, Clone, PartialEq)]
pub struct MutualReduction {
    pub kind: CycleKind,
    /// The single equivalent recurrence (linear for subtraction cycles,
    /// divide-and-conquer otherwise).
    pub reduced: Recurrence,
    /// Component names the final solution applies to, in cycle order.
    pub members: Vec<String>,
    pub explanation: String,
}

/// Collapse the cycle into one recurrence.
pub fn reduce(system: &MutualSystem) -> Result<MutualReduction, MutualError> {
    let comps = system.components();
    let var = system.var().clone();
    let members: Vec<String> = comps.iter().map(|c| c.name.clone()).collect();

    let mut total_sub: u64 = 0;
    let mut compound_scale = 1.0f64;
    let mut saw_sub = false;
    let mut saw_scale = false;
    for c in comps {
        match c.reduction {
            Reduction::Subtract { r } => {
                saw_sub = true;
                total_sub += r;
            }
            Reduction::Scale { b } => {
                saw_scale = true;
                compound_scale *= b;
            }
        }
    }

    // Combined per-cycle work.
    let work = simplify(
        &comps
            .iter()
            .map(|c| c.work.clone())
            .reduce(Expr::plus)
            .unwrap_or_else(Expr::zero),
    );

    let (kind, reduced, explanation) = match (saw_sub && total_sub > 0, saw_scale) {
        (true, false) => {
            // T(n) = T(n − R) + G(n) as an order-R linear recurrence with a
            // single unit coefficient at lag R.
            let mut coeffs = vec![0.0; total_sub as usize];
            coeffs[total_sub as usize - 1] = 1.0;
            let rec = LinearRecurrence::new(coeffs, work.clone(), var)?;
            (
                CycleKind::Subtraction,
                Recurrence::Linear(rec),
                format!(
                    "subtraction cycle of {} components, total reduction R = {total_sub}: T(n) = T(n−{total_sub}) + {work}",
                    comps.len()
                ),
            )
        }
        (false, true) => {
            let rec = DivideAndConquer::new(
                vec![Term { a: 1.0, b: compound_scale }],
                work.clone(),
                Expr::one(),
                var,
            )?;
            (
                CycleKind::Division,
                Recurrence::DivideAndConquer(rec),
                format!(
                    "division cycle of {} components, compound scale b = {compound_scale:.6}: T(n) = T({compound_scale:.6}·n) + {work}",
                    comps.len()
                ),
            )
        }
        (true, true) => {
            // Constant subtractions are swallowed by the multiplicative
            // shrink; approximate by the scale steps alone.
            let rec = DivideAndConquer::new(
                vec![Term { a: 1.0, b: compound_scale }],
                work.clone(),
                Expr::one(),
                var,
            )?;
            (
                CycleKind::Mixed,
                Recurrence::DivideAndConquer(rec),
                format!(
                    "mixed cycle: {total_sub} subtracted per trip is dominated by compound scale b = {compound_scale:.6}; approximating by the division reduction"
                ),
            )
        }
        (false, false) => return Err(MutualError::NonReducingCycle),
    };

    debug!(?kind, members = ?members, "mutual cycle reduced");
    Ok(MutualReduction { kind, reduced, members, explanation })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Symbol;
    use crate::recurrence::MutualComponent;

    fn sys(components: Vec<MutualComponent>) -> MutualSystem {
        MutualSystem::new(components, Symbol::input("n")).expect("well-formed")
    }

    fn comp(name: &str, work: Expr, reduction: Reduction) -> MutualComponent {
        MutualComponent { name: name.into(), work, reduction }
    }

    #[test]
    fn subtraction_cycle_collapses_to_linear() {
        // isEven/isOdd: each subtracts 1, constant work.
        let s = sys(vec![
            comp("is_even", Expr::one(), Reduction::Subtract { r: 1 }),
            comp("is_odd", Expr::one(), Reduction::Subtract { r: 1 }),
        ]);
        let r = reduce(&s).unwrap();
        assert_eq!(r.kind, CycleKind::Subtraction);
        assert_eq!(r.members, vec!["is_even", "is_odd"]);
        match &r.reduced {
            Recurrence::Linear(l) => {
                // T(n) = T(n−2) + 2
                assert_eq!(l.coeffs(), &[0.0, 1.0]);
                assert_eq!(l.work().as_constant(), Some(2.0));
            }
            other => panic!("expected linear reduction, got {other:?}"),
        }
    }

    #[test]
    fn division_cycle_collapses_to_divide_and_conquer() {
        let s = sys(vec![
            comp("outer", Expr::linear(1.0, "n"), Reduction::Scale { b: 0.5 }),
            comp("inner", Expr::one(), Reduction::Scale { b: 0.5 }),
        ]);
        let r = reduce(&s).unwrap();
        assert_eq!(r.kind, CycleKind::Division);
        match &r.reduced {
            Recurrence::DivideAndConquer(d) => {
                assert_eq!(d.terms().len(), 1);
                assert!((d.terms()[0].b - 0.25).abs() < 1e-12, "compound scale (1/2)·(1/2)");
                assert!((d.terms()[0].a - 1.0).abs() < 1e-12);
            }
            other => panic!("expected divide-and-conquer reduction, got {other:?}"),
        }
    }

    #[test]
    fn mixed_cycle_is_flagged() {
        let s = sys(vec![
            comp("halve", Expr::one(), Reduction::Scale { b: 0.5 }),
            comp("trim", Expr::one(), Reduction::Subtract { r: 1 }),
        ]);
        let r = reduce(&s).unwrap();
        assert_eq!(r.kind, CycleKind::Mixed);
        assert!(matches!(r.reduced, Recurrence::DivideAndConquer(_)));
    }

    #[test]
    fn non_reducing_cycle_rejected() {
        let s = sys(vec![
            comp("spin", Expr::one(), Reduction::Subtract { r: 0 }),
            comp("yield", Expr::one(), Reduction::Subtract { r: 0 }),
        ]);
        assert!(matches!(reduce(&s), Err(MutualError::NonReducingCycle)));
    }

    #[test]
    fn works_accumulate_over_the_cycle() {
        // n + n = 2n of work per trip.
        let s = sys(vec![
            comp("a", Expr::linear(1.0, "n"), Reduction::Subtract { r: 1 }),
            comp("b", Expr::linear(1.0, "n"), Reduction::Subtract { r: 1 }),
        ]);
        let r = reduce(&s).unwrap();
        match &r.reduced {
            Recurrence::Linear(l) => {
                assert_eq!(l.work(), &Expr::linear(2.0, "n"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
