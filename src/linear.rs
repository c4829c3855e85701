//! Linear-recurrence solver
//!
//! Solves `T(n) = Σⱼ cⱼ·T(n−j) + f(n)` through the characteristic
//! polynomial `x^k − c₁·x^{k−1} − … − cₖ`:
//!
//! 1. Pure summation `T(n) = T(n−1) + f(n)` short-circuits to
//!    `Θ(n·f(n))` (the `Σ f(i)` bound for monotone `f`).
//! 2. Otherwise the polynomial's roots are the eigenvalues of its companion
//!    matrix; degree 2 goes through the discriminant, higher degrees through
//!    Weierstrass simultaneous iteration (same spectrum, no matrix
//!    factorization needed).
//! 3. Roots are grouped at tolerance 1e-7 to recover multiplicities.
//! 4. The dominant group `(r, m)` gives `Θ(n^{m−1}·|r|^n)` for `|r| > 1`,
//!    `Θ(n^m)` for `|r| = 1`, and a dominated homogeneous part otherwise.
//! 5. The particular solution induced by `f` joins by asymptotic max.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::expr::Expr;
use crate::recurrence::LinearRecurrence;
use crate::simplify::{compare_asymptotic, simplify, AsymptoticOrd};

/// Tolerance for grouping equal roots (multiplicity detection).
pub const ROOT_GROUP_TOLERANCE: f64 = 1e-7;
/// Magnitude window treated as "on the unit circle".
const UNIT_TOLERANCE: f64 = 1e-9;

/// Root-finding failure. Recoverable at the pipeline level.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum LinearError {
    #[error("root iteration did not converge (max residual {residual:e} after {iterations} steps)")]
    RootsDidNotConverge { iterations: usize, residual: f64 },
}

/// A characteristic root with its recovered multiplicity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RootGroup {
    pub re: f64,
    pub im: f64,
    pub multiplicity: usize,
}

impl RootGroup {
    /// `|r|`.
    pub fn magnitude(&self) -> f64 {
        self.re.hypot(self.im)
    }
    /// True when the imaginary part is negligible.
    pub fn is_real(&self) -> bool {
        self.im.abs() < ROOT_GROUP_TOLERANCE * (1.0 + self.re.abs())
    }
}

/// Solution of a linear recurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearSolution {
    /// The combined Θ bound.
    pub solution: Expr,
    /// All root groups, dominant first.
    pub roots: Vec<RootGroup>,
    /// Whether the dominant root is real and unique at its magnitude.
    pub single_real_dominant: bool,
    pub explanation: String,
}

// ============================================================================
// Complex scalar (private to the root finder)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
struct Cx {
    re: f64,
    im: f64,
}

impl Cx {
    const ZERO: Cx = Cx { re: 0.0, im: 0.0 };

    fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }
    fn real(re: f64) -> Self {
        Self { re, im: 0.0 }
    }
    fn add(self, o: Cx) -> Cx {
        Cx::new(self.re + o.re, self.im + o.im)
    }
    fn sub(self, o: Cx) -> Cx {
        Cx::new(self.re - o.re, self.im - o.im)
    }
    fn mul(self, o: Cx) -> Cx {
        Cx::new(self.re * o.re - self.im * o.im, self.re * o.im + self.im * o.re)
    }
    fn div(self, o: Cx) -> Cx {
        let d = o.re * o.re + o.im * o.im;
        Cx::new((self.re * o.re + self.im * o.im) / d, (self.im * o.re - self.re * o.im) / d)
    }
    fn abs(self) -> f64 {
        self.re.hypot(self.im)
    }
}

/// Evaluate the monic polynomial with the given coefficients
/// (`coeffs[i]` multiplies `x^{k−1−i}` after the leading 1) at `z`.
fn poly_eval(monic_tail: &[f64], z: Cx) -> Cx {
    let mut acc = Cx::real(1.0);
    for c in monic_tail {
        acc = acc.mul(z).add(Cx::real(*c));
    }
    acc
}

/// All complex roots of `x^k + t₁·x^{k−1} + … + tₖ` by Weierstrass
/// (Durand–Kerner) simultaneous iteration.
fn weierstrass_roots(monic_tail: &[f64]) -> Result<Vec<Cx>, LinearError> {
    let k = monic_tail.len();
    debug_assert!(k >= 1);

    // Radius guess from the coefficient bound, spread initial iterates on a
    // non-real ray so symmetric configurations cannot stall.
    let radius = 1.0
        + monic_tail
            .iter()
            .map(|c| c.abs())
            .fold(0.0, f64::max);
    let seed = Cx::new(0.4, 0.9);
    let mut z: Vec<Cx> = Vec::with_capacity(k);
    let mut acc = Cx::real(1.0);
    for _ in 0..k {
        acc = acc.mul(seed);
        z.push(acc.mul(Cx::real(radius)));
    }

    const MAX_ITER: usize = 300;
    const TOL: f64 = 1e-12;
    for iter in 0..MAX_ITER {
        let mut delta_max = 0.0f64;
        for i in 0..k {
            let mut denom = Cx::real(1.0);
            for j in 0..k {
                if i != j {
                    denom = denom.mul(z[i].sub(z[j]));
                }
            }
            if denom == Cx::ZERO {
                // Collided iterates: nudge and retry next sweep.
                z[i] = z[i].add(Cx::new(1e-8, 1e-8));
                continue;
            }
            let step = poly_eval(monic_tail, z[i]).div(denom);
            z[i] = z[i].sub(step);
            delta_max = delta_max.max(step.abs());
        }
        if delta_max < TOL {
            debug!(iterations = iter, "characteristic roots converged");
            return Ok(z);
        }
    }

    let residual = z.iter().map(|zi| poly_eval(monic_tail, *zi).abs()).fold(0.0, f64::max);
    // Accept a slightly loose fixpoint; reject a genuinely stuck one.
    if residual < 1e-6 {
        return Ok(z);
    }
    Err(LinearError::RootsDidNotConverge { iterations: MAX_ITER, residual })
}

/// Companion matrix of `x^k − c₁·x^{k−1} − … − cₖ` (row-major). Its
/// eigenvalues are exactly the characteristic roots; kept for diagnostics
/// and cross-checks.
pub fn companion_matrix(coeffs: &[f64]) -> Vec<Vec<f64>> {
    let k = coeffs.len();
    let mut m = vec![vec![0.0; k]; k];
    for (j, c) in coeffs.iter().enumerate() {
        m[0][j] = *c;
    }
    for i in 1..k {
        m[i][i - 1] = 1.0;
    }
    m
}

fn group_roots(mut roots: Vec<Cx>) -> Vec<RootGroup> {
    roots.sort_by(|a, b| {
        b.abs()
            .partial_cmp(&a.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.re.partial_cmp(&b.re).unwrap_or(std::cmp::Ordering::Equal))
    });
    let mut groups: Vec<(Cx, usize)> = Vec::new();
    'outer: for r in roots {
        for (rep, count) in groups.iter_mut() {
            if rep.sub(r).abs() < ROOT_GROUP_TOLERANCE * (1.0 + rep.abs()) {
                *count += 1;
                continue 'outer;
            }
        }
        groups.push((r, 1));
    }
    groups
        .into_iter()
        .map(|(r, m)| RootGroup { re: r.re, im: r.im, multiplicity: m })
        .collect()
}

// ============================================================================
// Solver
// ============================================================================

/// Solve a linear recurrence into a Θ bound.
pub fn solve_linear(rec: &LinearRecurrence) -> Result<LinearSolution, LinearError> {
    let var = rec.var().name.clone();
    let f = simplify(rec.work());
    let coeffs = rec.coeffs();

    // Pure summation T(n) = T(n−1) + f(n).
    if coeffs.len() == 1 && (coeffs[0] - 1.0).abs() < UNIT_TOLERANCE {
        let solution = if f.is_zero() {
            Expr::one()
        } else {
            simplify(&Expr::mul(Expr::linear(1.0, &var), f.clone()))
        };
        return Ok(LinearSolution {
            solution: solution.clone(),
            roots: vec![RootGroup { re: 1.0, im: 0.0, multiplicity: 1 }],
            single_real_dominant: true,
            explanation: format!(
                "pure summation T(n) = T(n−1) + f(n): Σ f(i) is bounded by n·f(n), giving Θ({solution})"
            ),
        });
    }

    // Characteristic roots.
    let roots = if coeffs.len() == 1 {
        vec![Cx::real(coeffs[0])]
    } else if coeffs.len() == 2 {
        // x² − c₁x − c₂ through the discriminant.
        let (c1, c2) = (coeffs[0], coeffs[1]);
        let disc = c1 * c1 + 4.0 * c2;
        if disc >= 0.0 {
            let s = disc.sqrt();
            vec![Cx::real((c1 + s) / 2.0), Cx::real((c1 - s) / 2.0)]
        } else {
            let s = (-disc).sqrt() / 2.0;
            vec![Cx::new(c1 / 2.0, s), Cx::new(c1 / 2.0, -s)]
        }
    } else {
        let monic_tail: Vec<f64> = coeffs.iter().map(|c| -c).collect();
        weierstrass_roots(&monic_tail)?
    };

    let groups = group_roots(roots);
    let dominant = groups[0];
    let mag = dominant.magnitude();
    let m = dominant.multiplicity;
    let single_real_dominant = dominant.is_real()
        && groups
            .iter()
            .skip(1)
            .all(|g| g.magnitude() < mag - ROOT_GROUP_TOLERANCE);

    // Homogeneous asymptotics from the dominant group.
    let homogeneous = if mag > 1.0 + UNIT_TOLERANCE {
        let poly_part = Expr::poly_log(1.0, &var, (m - 1) as f64, 0.0, 2.0);
        simplify(&Expr::mul(poly_part, Expr::exponential(mag, &var, 1.0)))
    } else if (mag - 1.0).abs() <= UNIT_TOLERANCE {
        simplify(&Expr::poly_log(1.0, &var, m as f64, 0.0, 2.0))
    } else {
        Expr::one()
    };

    // Particular solution induced by f; resonance with a unit root costs one
    // extra factor of n.
    let particular = if f.is_zero() {
        Expr::zero()
    } else if (mag - 1.0).abs() <= UNIT_TOLERANCE {
        simplify(&Expr::mul(Expr::linear(1.0, &var), f.clone()))
    } else {
        f.clone()
    };

    let solution = match compare_asymptotic(&homogeneous, &particular) {
        AsymptoticOrd::Less => particular.clone(),
        AsymptoticOrd::Incomparable => {
            simplify(&Expr::max(homogeneous.clone(), particular.clone()))
        }
        _ => homogeneous.clone(),
    };

    let explanation = format!(
        "dominant characteristic root |r| = {:.6}{} with multiplicity {}: homogeneous part Θ({}), particular part Θ({}); the max dominates",
        mag,
        if dominant.is_real() { "" } else { " (complex pair)" },
        m,
        homogeneous,
        particular
    );
    debug!(%solution, mag, multiplicity = m, "linear recurrence solved");

    Ok(LinearSolution { solution, roots: groups, single_real_dominant, explanation })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Symbol;
    use crate::simplify::{classify, GrowthForm};

    fn rec(coeffs: Vec<f64>, f: Expr) -> LinearRecurrence {
        LinearRecurrence::new(coeffs, f, Symbol::input("n")).expect("well-formed")
    }

    #[test]
    fn summation_of_polynomial_gains_a_degree() {
        // T(n) = T(n−1) + n² → Θ(n³)
        let s = solve_linear(&rec(vec![1.0], Expr::monomial(1.0, "n", 2))).unwrap();
        let c = classify(&s.solution, "n");
        assert_eq!(c.form, GrowthForm::Polynomial);
        assert!((c.poly_degree - 3.0).abs() < 1e-9);
    }

    #[test]
    fn fibonacci_finds_the_golden_ratio() {
        // T(n) = T(n−1) + T(n−2) → Θ(φⁿ)
        let s = solve_linear(&rec(vec![1.0, 1.0], Expr::zero())).unwrap();
        let phi = (1.0 + 5.0f64.sqrt()) / 2.0;
        let c = classify(&s.solution, "n");
        assert_eq!(c.form, GrowthForm::Exponential);
        assert!((c.exp_base - phi).abs() < 1e-9, "base {} vs φ {}", c.exp_base, phi);
        assert!(s.single_real_dominant);
    }

    #[test]
    fn repeated_root_gains_polynomial_factor() {
        // T(n) = 4T(n−1) − 4T(n−2): (x−2)² → Θ(n·2ⁿ)
        let s = solve_linear(&rec(vec![4.0, -4.0], Expr::zero())).unwrap();
        assert_eq!(s.roots[0].multiplicity, 2);
        assert!((s.roots[0].re - 2.0).abs() < 1e-6);
        let c = classify(&s.solution, "n");
        assert_eq!(c.form, GrowthForm::Exponential);
        assert!((c.exp_base - 2.0).abs() < 1e-9);
        assert!((c.poly_degree - 1.0).abs() < 1e-9, "n¹ factor from multiplicity 2");
    }

    #[test]
    fn geometric_growth_single_coefficient() {
        // T(n) = 2T(n−1) → Θ(2ⁿ)
        let s = solve_linear(&rec(vec![2.0], Expr::zero())).unwrap();
        let c = classify(&s.solution, "n");
        assert_eq!(c.form, GrowthForm::Exponential);
        assert!((c.exp_base - 2.0).abs() < 1e-12);
    }

    #[test]
    fn work_term_can_dominate() {
        // T(n) = 0.5·T(n−1) + n²: contracting homogeneous part, Θ(n²) overall.
        let s = solve_linear(&rec(vec![0.5], Expr::monomial(1.0, "n", 2))).unwrap();
        let c = classify(&s.solution, "n");
        assert_eq!(c.form, GrowthForm::Polynomial);
        assert!((c.poly_degree - 2.0).abs() < 1e-9);
    }

    #[test]
    fn cubic_characteristic_roots_via_weierstrass() {
        // T(n) = 6T(n−1) − 11T(n−2) + 6T(n−3): roots 1, 2, 3 → Θ(3ⁿ)
        let s = solve_linear(&rec(vec![6.0, -11.0, 6.0], Expr::zero())).unwrap();
        let c = classify(&s.solution, "n");
        assert_eq!(c.form, GrowthForm::Exponential);
        assert!((c.exp_base - 3.0).abs() < 1e-6, "dominant root 3, got {}", c.exp_base);
    }

    #[test]
    fn companion_matrix_shape() {
        // x³ − 6x² + 11x − 6 from coeffs [6, −11, 6].
        let m = companion_matrix(&[6.0, -11.0, 6.0]);
        assert_eq!(m[0], vec![6.0, -11.0, 6.0]);
        assert_eq!(m[1], vec![1.0, 0.0, 0.0]);
        assert_eq!(m[2], vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn companion_eigenvector_check() {
        // For root r, the Vandermonde vector (r², r, 1) is an eigenvector of
        // the companion matrix with eigenvalue r.
        let coeffs = [6.0f64, -11.0, 6.0];
        let m = companion_matrix(&coeffs);
        for r in [1.0f64, 2.0, 3.0] {
            let v = [r * r, r, 1.0];
            for (i, row) in m.iter().enumerate() {
                let mv: f64 = row.iter().zip(v.iter()).map(|(a, b)| a * b).sum();
                assert!(
                    (mv - r * v[i]).abs() < 1e-9,
                    "row {i}: M·v = {mv}, expected {}",
                    r * v[i]
                );
            }
        }
    }

    #[test]
    fn complex_dominant_pair_uses_modulus() {
        // T(n) = 2T(n−1) − 2T(n−2): roots 1 ± i, |r| = √2.
        let s = solve_linear(&rec(vec![2.0, -2.0], Expr::zero())).unwrap();
        let c = classify(&s.solution, "n");
        assert_eq!(c.form, GrowthForm::Exponential);
        assert!((c.exp_base - 2.0f64.sqrt()).abs() < 1e-9);
        assert!(!s.single_real_dominant);
    }
}
