//! Algebraic rewrites, asymptotic comparison & classification
//!
//! Three families of pure transforms over [`crate::expr::Expr`]:
//!
//! - `simplify` — idempotent algebraic cleanup: drop zero terms, fold
//!   constants, collapse nested `Plus`/`Mul`, canonicalize `PolyLog`,
//!   combine like terms (`a·f + b·f → (a+b)·f`). Simplification never
//!   changes the Big-Θ class of an expression.
//! - `drop_constant_factors` / `drop_lower_order_terms` — normalization to
//!   Big-O canonical form: strip multiplicative constants, keep only the
//!   maxima of comparable `Plus`/`Max` operands.
//! - `compare_asymptotic` / `classify` — the total order over growth
//!   equivalence classes, derived from the lexicographic key
//!   `(growth tier, poly degree, log exponent, base)`, and the single
//!   classification entry point every downstream theorem stage calls.
//!
//! `compare_asymptotic` returns `Incomparable` rather than guessing:
//! expressions over different free-variable sets, and special-function
//! residues without a recorded bound, do not get an invented order.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::expr::{BinOpKind, Expr, SpecialKind, Symbol};

/// Tolerance for "the same real exponent" in comparison keys.
const KEY_EPS: f64 = 1e-9;

// ============================================================================
// Asymptotic ordering
// ============================================================================

/// Outcome of an asymptotic comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsymptoticOrd {
    Less,
    Equal,
    Greater,
    Incomparable,
}

impl AsymptoticOrd {
    /// Flip the direction (`Less` ↔ `Greater`).
    pub fn reverse(self) -> Self {
        match self {
            AsymptoticOrd::Less => AsymptoticOrd::Greater,
            AsymptoticOrd::Greater => AsymptoticOrd::Less,
            other => other,
        }
    }
}

/// Growth tiers of the total order: `O(1) < polylog family < exponential <
/// factorial`. Special residues sit outside the order unless they carry a
/// recorded bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GrowthForm {
    Constant,
    Logarithmic,
    Polynomial,
    PolyLog,
    Exponential,
    Factorial,
    Special,
    Unknown,
}

/// Dominant-form summary of an expression along one variable.
///
/// This is the single point downstream stages consult to decide theorem
/// cases; everything a Master/Akra–Bazzi case split needs is here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub form: GrowthForm,
    /// Polynomial degree `d` of the dominant `n^d log^j n` part (real).
    pub poly_degree: f64,
    /// Log exponent `j` of the dominant part (real).
    pub log_exponent: f64,
    /// Base of the dominant exponential (1.0 for sub-exponential forms).
    pub exp_base: f64,
    /// Leading multiplicative constant.
    pub leading_coeff: f64,
    /// Classifier confidence in [0, 1].
    pub confidence: f64,
}

impl Classification {
    fn exact(form: GrowthForm, d: f64, j: f64, base: f64, k: f64) -> Self {
        Self {
            form,
            poly_degree: d,
            log_exponent: j,
            exp_base: base,
            leading_coeff: k,
            confidence: 1.0,
        }
    }

    /// Constant classification (what anything not mentioning the variable
    /// collapses to).
    pub fn constant(k: f64) -> Self {
        Self::exact(GrowthForm::Constant, 0.0, 0.0, 1.0, k)
    }

    /// Rebuild the canonical expression this classification denotes.
    ///
    /// Round-trip property: `classify(PolyLog(k, v, d, j, b), v).to_poly_log(v)`
    /// reproduces the input up to `simplify`.
    pub fn to_poly_log(&self, var: &str) -> Expr {
        match self.form {
            GrowthForm::Constant => Expr::constant(self.leading_coeff),
            GrowthForm::Exponential => {
                let core = Expr::exponential(self.exp_base, var, self.leading_coeff);
                if self.poly_degree.abs() < KEY_EPS && self.log_exponent.abs() < KEY_EPS {
                    core
                } else {
                    Expr::mul(
                        Expr::poly_log(1.0, var, self.poly_degree, self.log_exponent, 2.0),
                        core,
                    )
                }
            }
            GrowthForm::Factorial => Expr::factorial(var, self.leading_coeff),
            _ => simplify(&Expr::poly_log(
                self.leading_coeff,
                var,
                self.poly_degree,
                self.log_exponent,
                2.0,
            )),
        }
    }

    /// Lexicographic comparison key `(tier, degree, log exponent, base)`.
    fn key(&self) -> (u8, f64, f64, f64) {
        let tier = match self.form {
            GrowthForm::Constant => 0,
            GrowthForm::Logarithmic | GrowthForm::Polynomial | GrowthForm::PolyLog => 1,
            GrowthForm::Exponential => 2,
            GrowthForm::Factorial => 3,
            GrowthForm::Special | GrowthForm::Unknown => 4,
        };
        (tier, self.poly_degree, self.log_exponent, self.exp_base)
    }
}

fn cmp_real(a: f64, b: f64) -> AsymptoticOrd {
    if (a - b).abs() < KEY_EPS {
        AsymptoticOrd::Equal
    } else if a < b {
        AsymptoticOrd::Less
    } else {
        AsymptoticOrd::Greater
    }
}

/// Compare two classifications by the lexicographic growth key.
pub fn compare_classifications(l: &Classification, r: &Classification) -> AsymptoticOrd {
    let (lt, ld, lj, lb) = l.key();
    let (rt, rd, rj, rb) = r.key();
    if lt == 4 || rt == 4 {
        // Unresolvable special residue on either side.
        return AsymptoticOrd::Incomparable;
    }
    if lt != rt {
        return if lt < rt { AsymptoticOrd::Less } else { AsymptoticOrd::Greater };
    }
    match lt {
        0 => AsymptoticOrd::Equal,
        1 => match cmp_real(ld, rd) {
            AsymptoticOrd::Equal => cmp_real(lj, rj),
            other => other,
        },
        2 => match cmp_real(lb, rb) {
            AsymptoticOrd::Equal => match cmp_real(ld, rd) {
                AsymptoticOrd::Equal => cmp_real(lj, rj),
                other => other,
            },
            other => other,
        },
        _ => cmp_real(ld, rd),
    }
}

/// Compare `l` and `r` asymptotically.
///
/// Expressions with different free-variable sets are incomparable unless one
/// side is variable-free (a constant is dominated by any growing class).
pub fn compare_asymptotic(l: &Expr, r: &Expr) -> AsymptoticOrd {
    let lv = l.free_vars();
    let rv = r.free_vars();

    if lv.is_empty() && rv.is_empty() {
        return AsymptoticOrd::Equal;
    }
    if lv.is_empty() {
        // Constant vs growing: dominated unless the right side is itself O(1).
        let var = rv.iter().next().expect("non-empty").clone();
        let rc = classify(r, &var);
        return match rc.form {
            GrowthForm::Constant => AsymptoticOrd::Equal,
            GrowthForm::Special | GrowthForm::Unknown => AsymptoticOrd::Incomparable,
            _ => AsymptoticOrd::Less,
        };
    }
    if rv.is_empty() {
        return compare_asymptotic(r, l).reverse();
    }
    if lv != rv {
        return AsymptoticOrd::Incomparable;
    }

    // Same variable set: the order must agree along every shared variable.
    let mut agreed: Option<AsymptoticOrd> = None;
    for var in &lv {
        let o = compare_classifications(&classify(l, var), &classify(r, var));
        if o == AsymptoticOrd::Incomparable {
            return AsymptoticOrd::Incomparable;
        }
        match agreed {
            None => agreed = Some(o),
            Some(prev) if prev == o || o == AsymptoticOrd::Equal => {}
            Some(AsymptoticOrd::Equal) => agreed = Some(o),
            Some(_) => return AsymptoticOrd::Incomparable,
        }
    }
    agreed.unwrap_or(AsymptoticOrd::Equal)
}

// ============================================================================
// Classification
// ============================================================================

/// Classify `e` along `var`: pick the dominant growth form.
pub fn classify(e: &Expr, var: &str) -> Classification {
    match e {
        Expr::Constant { k } => Classification::constant(*k),
        Expr::Var { var: v } => {
            if &*v.name == var {
                Classification::exact(GrowthForm::Polynomial, 1.0, 0.0, 1.0, 1.0)
            } else {
                // Some other symbol: constant along `var`, flagged softer.
                let mut c = Classification::constant(1.0);
                c.confidence = 0.8;
                c
            }
        }
        Expr::Linear { k, var: v } => {
            if &*v.name == var {
                Classification::exact(GrowthForm::Polynomial, 1.0, 0.0, 1.0, *k)
            } else {
                let mut c = Classification::constant(*k);
                c.confidence = 0.8;
                c
            }
        }
        Expr::Polynomial { var: v, coeffs } => {
            if &*v.name != var {
                let mut c = Classification::constant(1.0);
                c.confidence = 0.8;
                return c;
            }
            match coeffs.iter().rev().find(|(_, c)| **c != 0.0) {
                Some((d, c)) => {
                    let form =
                        if *d == 0 { GrowthForm::Constant } else { GrowthForm::Polynomial };
                    Classification::exact(form, *d as f64, 0.0, 1.0, *c)
                }
                None => Classification::constant(0.0),
            }
        }
        Expr::Logarithmic { k, var: v, base: _ } => {
            if &*v.name == var {
                Classification::exact(GrowthForm::Logarithmic, 0.0, 1.0, 1.0, *k)
            } else {
                let mut c = Classification::constant(*k);
                c.confidence = 0.8;
                c
            }
        }
        Expr::PolyLog { k, var: v, poly_deg, log_exp, base: _ } => {
            if &*v.name != var {
                let mut c = Classification::constant(*k);
                c.confidence = 0.8;
                return c;
            }
            let form = match (poly_deg.abs() < KEY_EPS, log_exp.abs() < KEY_EPS) {
                (true, true) => GrowthForm::Constant,
                (true, false) => GrowthForm::Logarithmic,
                (false, true) => GrowthForm::Polynomial,
                (false, false) => GrowthForm::PolyLog,
            };
            Classification::exact(form, *poly_deg, *log_exp, 1.0, *k)
        }
        Expr::Exponential { base, var: v, k } => {
            if &*v.name == var {
                Classification::exact(GrowthForm::Exponential, 0.0, 0.0, *base, *k)
            } else {
                let mut c = Classification::constant(*k);
                c.confidence = 0.8;
                c
            }
        }
        Expr::Factorial { var: v, k } => {
            if &*v.name == var {
                Classification::exact(GrowthForm::Factorial, 0.0, 0.0, 1.0, *k)
            } else {
                let mut c = Classification::constant(*k);
                c.confidence = 0.8;
                c
            }
        }
        Expr::Power { base, exponent } => {
            let mut inner = classify(base, var);
            match inner.form {
                GrowthForm::Constant => {
                    inner.leading_coeff = inner.leading_coeff.powf(*exponent);
                    inner
                }
                GrowthForm::Polynomial | GrowthForm::Logarithmic | GrowthForm::PolyLog => {
                    // (n^d log^j n)^r = n^{dr} log^{jr} n
                    inner.poly_degree *= exponent;
                    inner.log_exponent *= exponent;
                    inner.leading_coeff = inner.leading_coeff.powf(*exponent);
                    inner.form = polylog_form(inner.poly_degree, inner.log_exponent);
                    inner
                }
                GrowthForm::Exponential => {
                    // (b^n)^r = (b^r)^n
                    inner.exp_base = inner.exp_base.powf(*exponent);
                    inner.leading_coeff = inner.leading_coeff.powf(*exponent);
                    inner.confidence *= 0.95;
                    inner
                }
                _ => {
                    inner.confidence *= 0.7;
                    inner
                }
            }
        }
        Expr::LogOf { inner, base: _ } => {
            let c = classify(inner, var);
            match c.form {
                GrowthForm::Constant => Classification::constant(1.0),
                GrowthForm::Polynomial | GrowthForm::PolyLog => {
                    // log(n^d log^j n) = Θ(log n)
                    let mut out = Classification::exact(
                        GrowthForm::Logarithmic,
                        0.0,
                        1.0,
                        1.0,
                        c.poly_degree.max(1.0),
                    );
                    out.confidence = c.confidence;
                    out
                }
                GrowthForm::Logarithmic => {
                    // log log n: genuinely sub-logarithmic, handed to the
                    // special tier with a polylogarithm marker downstream.
                    let mut out = Classification::exact(GrowthForm::Logarithmic, 0.0, 0.0, 1.0, 1.0);
                    out.confidence = c.confidence * 0.9;
                    out
                }
                GrowthForm::Exponential => {
                    // log(b^n) = n ln b
                    let mut out = Classification::exact(
                        GrowthForm::Polynomial,
                        1.0,
                        0.0,
                        1.0,
                        c.exp_base.ln(),
                    );
                    out.confidence = c.confidence;
                    out
                }
                _ => {
                    let mut out = c;
                    out.confidence *= 0.7;
                    out
                }
            }
        }
        Expr::ExpOf { base, inner } => {
            let c = classify(inner, var);
            match c.form {
                GrowthForm::Constant => Classification::constant(base.powf(c.leading_coeff)),
                GrowthForm::Polynomial if (c.poly_degree - 1.0).abs() < KEY_EPS => {
                    // b^{k·n} = (b^k)^n
                    Classification::exact(
                        GrowthForm::Exponential,
                        0.0,
                        0.0,
                        base.powf(c.leading_coeff),
                        1.0,
                    )
                }
                GrowthForm::Logarithmic => {
                    // b^{k·log_c n} = n^{k·ln b / ln c}. The log base is read
                    // off the inner node; non-leaf log shapes fall back to
                    // natural log.
                    let log_base = match inner.as_ref() {
                        Expr::Logarithmic { base: lb, .. } => *lb,
                        Expr::PolyLog { base: lb, .. } => *lb,
                        _ => std::f64::consts::E,
                    };
                    let mut out = Classification::exact(
                        GrowthForm::Polynomial,
                        c.leading_coeff * base.ln() / log_base.ln(),
                        0.0,
                        1.0,
                        1.0,
                    );
                    out.confidence = c.confidence * 0.9;
                    out
                }
                _ => {
                    let mut out =
                        Classification::exact(GrowthForm::Exponential, c.poly_degree, 0.0, *base, 1.0);
                    out.confidence = c.confidence * 0.8;
                    out
                }
            }
        }
        Expr::FactOf { inner } => {
            let c = classify(inner, var);
            let mut out = Classification::exact(GrowthForm::Factorial, c.poly_degree, 0.0, 1.0, 1.0);
            out.confidence = c.confidence * if c.form == GrowthForm::Polynomial { 1.0 } else { 0.8 };
            out
        }
        Expr::BinOp { left, op, right } => {
            let lc = classify(left, var);
            let rc = classify(right, var);
            match op {
                BinOpKind::Plus | BinOpKind::Max => {
                    match compare_classifications(&lc, &rc) {
                        AsymptoticOrd::Less => rc,
                        AsymptoticOrd::Greater | AsymptoticOrd::Equal => lc,
                        AsymptoticOrd::Incomparable => {
                            let mut out = if lc.form >= rc.form { lc } else { rc };
                            out.confidence *= 0.7;
                            out
                        }
                    }
                }
                BinOpKind::Min => match compare_classifications(&lc, &rc) {
                    AsymptoticOrd::Greater => rc,
                    AsymptoticOrd::Less | AsymptoticOrd::Equal => lc,
                    AsymptoticOrd::Incomparable => {
                        let mut out = if lc.form <= rc.form { lc } else { rc };
                        out.confidence *= 0.7;
                        out
                    }
                },
                BinOpKind::Mul => mul_classifications(lc, rc),
            }
        }
        Expr::Conditional { when_true, when_false, .. } => {
            let lc = classify(when_true, var);
            let rc = classify(when_false, var);
            match compare_classifications(&lc, &rc) {
                AsymptoticOrd::Less => rc,
                _ => lc,
            }
        }
        Expr::SpecialFn { f } => match f {
            SpecialKind::SymbolicIntegral { asymptotic_bound, .. } => {
                let mut c = classify(asymptotic_bound, var);
                c.confidence *= 0.8;
                c
            }
            _ => {
                let mut c = Classification::exact(GrowthForm::Special, 0.0, 0.0, 1.0, 1.0);
                c.confidence = 0.6;
                c
            }
        },
        Expr::Probabilistic { worst, .. } => classify(worst, var),
        Expr::Amortized { worst_case, .. } => classify(worst_case, var),
    }
}

fn polylog_form(d: f64, j: f64) -> GrowthForm {
    match (d.abs() < KEY_EPS, j.abs() < KEY_EPS) {
        (true, true) => GrowthForm::Constant,
        (true, false) => GrowthForm::Logarithmic,
        (false, true) => GrowthForm::Polynomial,
        (false, false) => GrowthForm::PolyLog,
    }
}

fn mul_classifications(l: Classification, r: Classification) -> Classification {
    use GrowthForm::*;
    let conf = l.confidence.min(r.confidence);
    let k = l.leading_coeff * r.leading_coeff;
    let out = match (l.form, r.form) {
        (Constant, _) => Classification { leading_coeff: k, confidence: conf, ..r },
        (_, Constant) => Classification { leading_coeff: k, confidence: conf, ..l },
        (Factorial, _) | (_, Factorial) => Classification {
            form: Factorial,
            poly_degree: l.poly_degree + r.poly_degree,
            log_exponent: 0.0,
            exp_base: 1.0,
            leading_coeff: k,
            confidence: conf,
        },
        (Exponential, Exponential) => Classification {
            form: Exponential,
            poly_degree: l.poly_degree + r.poly_degree,
            log_exponent: l.log_exponent + r.log_exponent,
            exp_base: l.exp_base * r.exp_base,
            leading_coeff: k,
            confidence: conf,
        },
        (Exponential, _) => Classification {
            form: Exponential,
            poly_degree: l.poly_degree + r.poly_degree,
            log_exponent: l.log_exponent + r.log_exponent,
            exp_base: l.exp_base,
            leading_coeff: k,
            confidence: conf,
        },
        (_, Exponential) => Classification {
            form: Exponential,
            poly_degree: l.poly_degree + r.poly_degree,
            log_exponent: l.log_exponent + r.log_exponent,
            exp_base: r.exp_base,
            leading_coeff: k,
            confidence: conf,
        },
        _ => {
            let d = l.poly_degree + r.poly_degree;
            let j = l.log_exponent + r.log_exponent;
            Classification {
                form: polylog_form(d, j),
                poly_degree: d,
                log_exponent: j,
                exp_base: 1.0,
                leading_coeff: k,
                confidence: conf,
            }
        }
    };
    out
}

// ============================================================================
// Simplification
// ============================================================================

/// Algebraic simplification. Idempotent; never changes the asymptotic class.
pub fn simplify(e: &Expr) -> Expr {
    let mut cur = e.clone();
    // Rewrites strictly shrink or canonicalize; a handful of passes reaches
    // the fixed point on any realistic tree.
    for _ in 0..8 {
        let next = simplify_once(&cur);
        if next == cur {
            return cur;
        }
        cur = next;
    }
    cur
}

fn simplify_once(e: &Expr) -> Expr {
    match e {
        Expr::Constant { .. } | Expr::Var { .. } => e.clone(),
        Expr::Linear { k, var } => {
            if *k == 0.0 {
                Expr::zero()
            } else {
                Expr::Linear { k: *k, var: var.clone() }
            }
        }
        Expr::Polynomial { var, coeffs } => {
            let nz: BTreeMap<u32, f64> =
                coeffs.iter().filter(|(_, c)| **c != 0.0).map(|(d, c)| (*d, *c)).collect();
            match (nz.len(), nz.iter().next()) {
                (0, _) => Expr::zero(),
                (1, Some((&0, &c))) => Expr::constant(c),
                (1, Some((&1, &c))) => Expr::Linear { k: c, var: var.clone() },
                _ => Expr::Polynomial { var: var.clone(), coeffs: nz },
            }
        }
        Expr::Logarithmic { k, var, base } => {
            if *k == 0.0 {
                Expr::zero()
            } else {
                Expr::Logarithmic { k: *k, var: var.clone(), base: *base }
            }
        }
        Expr::PolyLog { k, var, poly_deg, log_exp, base } => {
            if *k == 0.0 {
                return Expr::zero();
            }
            let d0 = poly_deg.abs() < KEY_EPS;
            let j0 = log_exp.abs() < KEY_EPS;
            if d0 && j0 {
                Expr::constant(*k)
            } else if j0 && (poly_deg.fract().abs() < KEY_EPS || (1.0 - poly_deg.fract()).abs() < KEY_EPS)
            {
                let d = poly_deg.round() as u32;
                if d == 1 {
                    Expr::Linear { k: *k, var: var.clone() }
                } else {
                    let mut coeffs = BTreeMap::new();
                    coeffs.insert(d, *k);
                    Expr::Polynomial { var: var.clone(), coeffs }
                }
            } else if d0 && (*log_exp - 1.0).abs() < KEY_EPS {
                Expr::Logarithmic { k: *k, var: var.clone(), base: *base }
            } else {
                e.clone()
            }
        }
        Expr::Exponential { base, var, k } => {
            if *k == 0.0 {
                Expr::zero()
            } else {
                Expr::Exponential { base: *base, var: var.clone(), k: *k }
            }
        }
        Expr::Factorial { .. } => e.clone(),
        Expr::Power { base, exponent } => {
            let b = simplify_once(base);
            if let Some(c) = b.as_constant() {
                return Expr::constant(c.powf(*exponent));
            }
            if (*exponent - 1.0).abs() < KEY_EPS {
                return b;
            }
            if exponent.abs() < KEY_EPS {
                return Expr::one();
            }
            // Collapse a power of a pure growth shape into PolyLog.
            match &b {
                Expr::Var { var } => Expr::PolyLog {
                    k: 1.0,
                    var: var.clone(),
                    poly_deg: *exponent,
                    log_exp: 0.0,
                    base: 2.0,
                },
                Expr::Linear { k, var } => Expr::PolyLog {
                    k: k.powf(*exponent),
                    var: var.clone(),
                    poly_deg: *exponent,
                    log_exp: 0.0,
                    base: 2.0,
                },
                Expr::Logarithmic { k, var, base: lb } => Expr::PolyLog {
                    k: k.powf(*exponent),
                    var: var.clone(),
                    poly_deg: 0.0,
                    log_exp: *exponent,
                    base: *lb,
                },
                Expr::PolyLog { k, var, poly_deg, log_exp, base: lb } => Expr::PolyLog {
                    k: k.powf(*exponent),
                    var: var.clone(),
                    poly_deg: poly_deg * exponent,
                    log_exp: log_exp * exponent,
                    base: *lb,
                },
                _ => Expr::Power { base: Arc::new(b), exponent: *exponent },
            }
        }
        Expr::LogOf { inner, base } => {
            let i = simplify_once(inner);
            if let Some(c) = i.as_constant() {
                if c > 0.0 {
                    return Expr::constant(c.ln() / base.ln());
                }
            }
            match &i {
                // log_b(n) is a leaf shape already.
                Expr::Var { var } => Expr::Logarithmic { k: 1.0, var: var.clone(), base: *base },
                _ => Expr::LogOf { inner: Arc::new(i), base: *base },
            }
        }
        Expr::ExpOf { base, inner } => {
            let i = simplify_once(inner);
            if let Some(c) = i.as_constant() {
                return Expr::constant(base.powf(c));
            }
            match &i {
                Expr::Var { var } => Expr::Exponential { base: *base, var: var.clone(), k: 1.0 },
                Expr::Linear { k, var } => {
                    Expr::Exponential { base: base.powf(*k), var: var.clone(), k: 1.0 }
                }
                _ => Expr::ExpOf { base: *base, inner: Arc::new(i) },
            }
        }
        Expr::FactOf { inner } => {
            let i = simplify_once(inner);
            match &i {
                Expr::Var { var } => Expr::Factorial { var: var.clone(), k: 1.0 },
                _ => Expr::FactOf { inner: Arc::new(i) },
            }
        }
        Expr::BinOp { left, op, right } => simplify_binop(left, *op, right),
        Expr::Conditional { label, when_true, when_false } => {
            let t = simplify_once(when_true);
            let f = simplify_once(when_false);
            if t == f {
                t
            } else {
                Expr::Conditional {
                    label: label.clone(),
                    when_true: Arc::new(t),
                    when_false: Arc::new(f),
                }
            }
        }
        Expr::SpecialFn { .. } => e.clone(),
        Expr::Probabilistic {
            expected,
            worst,
            best,
            source,
            distribution,
            variance,
            high_prob_bound,
            assumptions,
        } => Expr::Probabilistic {
            expected: Arc::new(simplify_once(expected)),
            worst: Arc::new(simplify_once(worst)),
            best: best.as_ref().map(|b| Arc::new(simplify_once(b))),
            source: source.clone(),
            distribution: distribution.clone(),
            variance: *variance,
            high_prob_bound: high_prob_bound.as_ref().map(|h| Arc::new(simplify_once(h))),
            assumptions: assumptions.clone(),
        },
        Expr::Amortized { amortized, worst_case, method, potential } => Expr::Amortized {
            amortized: Arc::new(simplify_once(amortized)),
            worst_case: Arc::new(simplify_once(worst_case)),
            method: *method,
            potential: potential.as_ref().map(|p| Arc::new(simplify_once(p))),
        },
    }
}

/// Flatten nested `Plus`/`Mul` chains of the same operator.
fn flatten(e: &Expr, op: BinOpKind, out: &mut Vec<Expr>) {
    match e {
        Expr::BinOp { left, op: o, right } if *o == op => {
            flatten(left, op, out);
            flatten(right, op, out);
        }
        other => out.push(simplify_once(other)),
    }
}

/// Split `e` into `(coefficient, unit-coefficient core)`.
fn split_coeff(e: &Expr) -> (f64, Expr) {
    match e {
        Expr::Constant { k } => (*k, Expr::one()),
        Expr::Linear { k, var } => (*k, Expr::Linear { k: 1.0, var: var.clone() }),
        Expr::Logarithmic { k, var, base } => {
            (*k, Expr::Logarithmic { k: 1.0, var: var.clone(), base: *base })
        }
        Expr::PolyLog { k, var, poly_deg, log_exp, base } => (
            *k,
            Expr::PolyLog {
                k: 1.0,
                var: var.clone(),
                poly_deg: *poly_deg,
                log_exp: *log_exp,
                base: *base,
            },
        ),
        Expr::Exponential { base, var, k } => {
            (*k, Expr::Exponential { base: *base, var: var.clone(), k: 1.0 })
        }
        Expr::Factorial { var, k } => (*k, Expr::Factorial { var: var.clone(), k: 1.0 }),
        Expr::Polynomial { var, coeffs } if coeffs.len() == 1 => {
            let (d, c) = coeffs.iter().next().expect("single term");
            let mut unit = BTreeMap::new();
            unit.insert(*d, 1.0);
            (*c, Expr::Polynomial { var: var.clone(), coeffs: unit })
        }
        Expr::BinOp { left, op: BinOpKind::Mul, right } => {
            if let Some(c) = left.as_constant() {
                let (ik, core) = split_coeff(right);
                (c * ik, core)
            } else if let Some(c) = right.as_constant() {
                let (ik, core) = split_coeff(left);
                (c * ik, core)
            } else {
                (1.0, e.clone())
            }
        }
        other => (1.0, other.clone()),
    }
}

/// Reattach a coefficient to a unit core.
fn with_coeff(k: f64, core: Expr) -> Expr {
    if k == 0.0 {
        return Expr::zero();
    }
    match core {
        Expr::Constant { k: c } => Expr::constant(k * c),
        Expr::Linear { var, .. } => Expr::Linear { k, var },
        Expr::Logarithmic { var, base, .. } => Expr::Logarithmic { k, var, base },
        Expr::PolyLog { var, poly_deg, log_exp, base, .. } => {
            Expr::PolyLog { k, var, poly_deg, log_exp, base }
        }
        Expr::Exponential { base, var, .. } => Expr::Exponential { base, var, k },
        Expr::Factorial { var, .. } => Expr::Factorial { var, k },
        Expr::Polynomial { var, coeffs } if coeffs.len() == 1 => {
            let (d, c) = coeffs.into_iter().next().expect("single term");
            let mut m = BTreeMap::new();
            m.insert(d, k * c);
            Expr::Polynomial { var, coeffs: m }
        }
        other => {
            if (k - 1.0).abs() < KEY_EPS {
                other
            } else {
                Expr::mul(Expr::constant(k), other)
            }
        }
    }
}

fn rebuild(op: BinOpKind, mut terms: Vec<Expr>) -> Expr {
    let identity = match op {
        BinOpKind::Plus => Expr::zero(),
        BinOpKind::Mul => Expr::one(),
        _ => unreachable!("rebuild only handles Plus/Mul"),
    };
    match terms.len() {
        0 => identity,
        1 => terms.pop().expect("len 1"),
        _ => {
            let mut acc = terms.remove(0);
            for t in terms {
                acc = Expr::BinOp { left: Arc::new(acc), op, right: Arc::new(t) };
            }
            acc
        }
    }
}

fn simplify_binop(left: &Expr, op: BinOpKind, right: &Expr) -> Expr {
    match op {
        BinOpKind::Plus => {
            let mut terms = Vec::new();
            flatten(&Expr::BinOp { left: left.clone().into(), op, right: right.clone().into() }, op, &mut terms);

            // Merge polynomials over the same variable, combine like cores,
            // fold constants.
            let mut constant = 0.0;
            let mut polys: BTreeMap<Arc<str>, BTreeMap<u32, f64>> = BTreeMap::new();
            let mut combined: Vec<(String, f64, Expr)> = Vec::new();
            for t in terms {
                if t.is_zero() {
                    continue;
                }
                if let Some(c) = t.as_constant() {
                    constant += c;
                    continue;
                }
                match &t {
                    Expr::Polynomial { var, coeffs } => {
                        let slot = polys.entry(var.name.clone()).or_default();
                        for (d, c) in coeffs {
                            *slot.entry(*d).or_insert(0.0) += c;
                        }
                        continue;
                    }
                    Expr::Linear { k, var } => {
                        *polys.entry(var.name.clone()).or_default().entry(1).or_insert(0.0) += k;
                        continue;
                    }
                    _ => {}
                }
                let (k, core) = split_coeff(&t);
                let key = serde_json::to_string(&core).unwrap_or_default();
                if let Some(slot) = combined.iter_mut().find(|(ck, _, _)| *ck == key) {
                    slot.1 += k;
                } else {
                    combined.push((key, k, core));
                }
            }

            let mut out: Vec<Expr> = Vec::new();
            for (name, coeffs) in polys {
                let p = simplify_once(&Expr::Polynomial { var: Symbol::input(&name), coeffs });
                if !p.is_zero() {
                    out.push(p);
                }
            }
            combined.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, k, core) in combined {
                let t = with_coeff(k, core);
                if !t.is_zero() {
                    out.push(t);
                }
            }
            if constant != 0.0 {
                out.push(Expr::constant(constant));
            }
            rebuild(BinOpKind::Plus, out)
        }
        BinOpKind::Mul => {
            let mut factors = Vec::new();
            flatten(&Expr::BinOp { left: left.clone().into(), op, right: right.clone().into() }, op, &mut factors);

            let mut constant = 1.0;
            // Per-variable poly-log accumulation: (degree, log exponent, base).
            let mut polylogs: BTreeMap<Arc<str>, (f64, f64, f64)> = BTreeMap::new();
            let mut rest: Vec<Expr> = Vec::new();
            for f in factors {
                if f.is_zero() {
                    return Expr::zero();
                }
                if let Some(c) = f.as_constant() {
                    constant *= c;
                    continue;
                }
                match &f {
                    Expr::Var { var } => {
                        let e = polylogs.entry(var.name.clone()).or_insert((0.0, 0.0, 2.0));
                        e.0 += 1.0;
                    }
                    Expr::Linear { k, var } => {
                        constant *= k;
                        let e = polylogs.entry(var.name.clone()).or_insert((0.0, 0.0, 2.0));
                        e.0 += 1.0;
                    }
                    Expr::Polynomial { var, coeffs } if coeffs.len() == 1 => {
                        let (d, c) = coeffs.iter().next().expect("single term");
                        constant *= c;
                        let e = polylogs.entry(var.name.clone()).or_insert((0.0, 0.0, 2.0));
                        e.0 += *d as f64;
                    }
                    Expr::Logarithmic { k, var, base } => {
                        constant *= k;
                        let e = polylogs.entry(var.name.clone()).or_insert((0.0, 0.0, *base));
                        e.1 += 1.0;
                        e.2 = *base;
                    }
                    Expr::PolyLog { k, var, poly_deg, log_exp, base } => {
                        constant *= k;
                        let e = polylogs.entry(var.name.clone()).or_insert((0.0, 0.0, *base));
                        e.0 += poly_deg;
                        e.1 += log_exp;
                        e.2 = *base;
                    }
                    Expr::Exponential { .. } | Expr::Factorial { .. } => rest.push(f.clone()),
                    _ => rest.push(f.clone()),
                }
            }
            if constant == 0.0 {
                return Expr::zero();
            }

            let mut out: Vec<Expr> = Vec::new();
            for (name, (d, j, b)) in polylogs {
                let pl = simplify_once(&Expr::PolyLog {
                    k: 1.0,
                    var: Symbol::input(&name),
                    poly_deg: d,
                    log_exp: j,
                    base: b,
                });
                if !pl.is_one() {
                    out.push(pl);
                }
            }
            rest.sort_by_key(|e| serde_json::to_string(e).unwrap_or_default());
            out.extend(rest);

            if out.is_empty() {
                return Expr::constant(constant);
            }
            // Fold the constant into the first factor's coefficient slot.
            if (constant - 1.0).abs() >= KEY_EPS {
                let first = out.remove(0);
                let (k0, core) = split_coeff(&first);
                out.insert(0, with_coeff(constant * k0, core));
            }
            rebuild(BinOpKind::Mul, out)
        }
        BinOpKind::Max | BinOpKind::Min => {
            let l = simplify_once(left);
            let r = simplify_once(right);
            if l == r {
                return l;
            }
            let ord = compare_asymptotic(&l, &r);
            let pick_left = match (op, ord) {
                (BinOpKind::Max, AsymptoticOrd::Greater | AsymptoticOrd::Equal) => Some(true),
                (BinOpKind::Max, AsymptoticOrd::Less) => Some(false),
                (BinOpKind::Min, AsymptoticOrd::Less | AsymptoticOrd::Equal) => Some(true),
                (BinOpKind::Min, AsymptoticOrd::Greater) => Some(false),
                (_, AsymptoticOrd::Incomparable) => None,
                _ => None,
            };
            match pick_left {
                Some(true) => l,
                Some(false) => r,
                None => Expr::BinOp { left: Arc::new(l), op, right: Arc::new(r) },
            }
        }
    }
}

// ============================================================================
// Big-O canonical form
// ============================================================================

/// Strip multiplicative constants everywhere: `Θ(3·n log n) → n log n`.
pub fn drop_constant_factors(e: &Expr) -> Expr {
    let s = simplify(e);
    let stripped = strip_constants(&s);
    simplify(&stripped)
}

fn strip_constants(e: &Expr) -> Expr {
    match e {
        Expr::Constant { k } => {
            if *k == 0.0 {
                Expr::zero()
            } else {
                Expr::one()
            }
        }
        Expr::Linear { var, .. } => Expr::Linear { k: 1.0, var: var.clone() },
        Expr::Polynomial { var, coeffs } => {
            let unit: BTreeMap<u32, f64> =
                coeffs.iter().filter(|(_, c)| **c != 0.0).map(|(d, _)| (*d, 1.0)).collect();
            Expr::Polynomial { var: var.clone(), coeffs: unit }
        }
        Expr::Logarithmic { var, base, .. } => {
            Expr::Logarithmic { k: 1.0, var: var.clone(), base: *base }
        }
        Expr::PolyLog { var, poly_deg, log_exp, base, .. } => Expr::PolyLog {
            k: 1.0,
            var: var.clone(),
            poly_deg: *poly_deg,
            log_exp: *log_exp,
            base: *base,
        },
        Expr::Exponential { base, var, .. } => {
            Expr::Exponential { base: *base, var: var.clone(), k: 1.0 }
        }
        Expr::Factorial { var, .. } => Expr::Factorial { var: var.clone(), k: 1.0 },
        Expr::Power { base, exponent } => {
            Expr::Power { base: Arc::new(strip_constants(base)), exponent: *exponent }
        }
        Expr::LogOf { inner, base } => {
            Expr::LogOf { inner: Arc::new(strip_constants(inner)), base: *base }
        }
        Expr::ExpOf { base, inner } => {
            Expr::ExpOf { base: *base, inner: Arc::new(strip_constants(inner)) }
        }
        Expr::FactOf { inner } => Expr::FactOf { inner: Arc::new(strip_constants(inner)) },
        Expr::BinOp { left, op, right } => Expr::BinOp {
            left: Arc::new(strip_constants(left)),
            op: *op,
            right: Arc::new(strip_constants(right)),
        },
        Expr::Conditional { label, when_true, when_false } => Expr::Conditional {
            label: label.clone(),
            when_true: Arc::new(strip_constants(when_true)),
            when_false: Arc::new(strip_constants(when_false)),
        },
        Expr::SpecialFn { .. } => e.clone(),
        Expr::Probabilistic { .. } | Expr::Amortized { .. } => e.clone(),
        Expr::Var { .. } => e.clone(),
    }
}

/// Keep only the maxima of comparable `Plus`/`Max` operands:
/// `n² + n log n + 7 → n²`. Incomparable survivors stay summed.
pub fn drop_lower_order_terms(e: &Expr) -> Expr {
    let s = simplify(e);
    match &s {
        Expr::BinOp { op: op @ (BinOpKind::Plus | BinOpKind::Max), .. } => {
            let mut terms = Vec::new();
            flatten(&s, *op, &mut terms);
            let terms: Vec<Expr> = terms.iter().map(drop_lower_order_terms).collect();

            let mut keep: Vec<Expr> = Vec::new();
            'next: for t in terms {
                if t.is_zero() {
                    continue;
                }
                let mut i = 0;
                while i < keep.len() {
                    match compare_asymptotic(&t, &keep[i]) {
                        AsymptoticOrd::Less | AsymptoticOrd::Equal => continue 'next,
                        AsymptoticOrd::Greater => {
                            keep.remove(i);
                        }
                        AsymptoticOrd::Incomparable => i += 1,
                    }
                }
                keep.push(t);
            }
            if keep.is_empty() {
                return Expr::zero();
            }
            simplify(&rebuild_any(*op, keep))
        }
        Expr::BinOp { left, op: BinOpKind::Mul, right } => {
            let l = drop_lower_order_terms(left);
            let r = drop_lower_order_terms(right);
            simplify(&Expr::BinOp { left: Arc::new(l), op: BinOpKind::Mul, right: Arc::new(r) })
        }
        Expr::Conditional { when_true, when_false, .. } => {
            // Worst-case: fold the branch split into a max, then reduce.
            drop_lower_order_terms(&Expr::max(
                when_true.as_ref().clone(),
                when_false.as_ref().clone(),
            ))
        }
        _ => s,
    }
}

fn rebuild_any(op: BinOpKind, mut terms: Vec<Expr>) -> Expr {
    match terms.len() {
        0 => Expr::zero(),
        1 => terms.pop().expect("len 1"),
        _ => {
            let mut acc = terms.remove(0);
            for t in terms {
                acc = Expr::BinOp { left: Arc::new(acc), op, right: Arc::new(t) };
            }
            acc
        }
    }
}

/// Full Big-O normalization: strip constants, then keep dominant terms.
pub fn to_big_o(e: &Expr) -> Expr {
    drop_lower_order_terms(&drop_constant_factors(e))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::env1;

    #[test]
    fn simplify_is_idempotent() {
        let exprs = vec![
            Expr::plus(Expr::monomial(2.0, "n", 2), Expr::monomial(3.0, "n", 2)),
            Expr::mul(Expr::constant(2.0), Expr::mul(Expr::var("n"), Expr::log(1.0, "n", 2.0))),
            Expr::plus(Expr::zero(), Expr::plus(Expr::linear(1.0, "n"), Expr::constant(5.0))),
            Expr::poly_log(3.0, "n", 0.0, 0.0, 2.0),
            Expr::max(Expr::monomial(1.0, "n", 2), Expr::linear(1.0, "n")),
        ];
        for e in exprs {
            let once = simplify(&e);
            let twice = simplify(&once);
            assert_eq!(once, twice, "not idempotent for {e}");
        }
    }

    #[test]
    fn simplify_preserves_class() {
        let e = Expr::plus(Expr::monomial(2.0, "n", 2), Expr::linear(5.0, "n"));
        let s = simplify(&e);
        assert_eq!(compare_asymptotic(&s, &e), AsymptoticOrd::Equal);
    }

    #[test]
    fn zero_and_one_identities() {
        let e = Expr::plus(Expr::zero(), Expr::linear(1.0, "n"));
        assert_eq!(simplify(&e), Expr::linear(1.0, "n"));

        let e = Expr::mul(Expr::one(), Expr::log(1.0, "n", 2.0));
        assert_eq!(simplify(&e), Expr::log(1.0, "n", 2.0));

        let e = Expr::mul(Expr::zero(), Expr::factorial("n", 1.0));
        assert!(simplify(&e).is_zero());
    }

    #[test]
    fn like_terms_combine() {
        // 2n² + 3n² = 5n²
        let e = Expr::plus(Expr::monomial(2.0, "n", 2), Expr::monomial(3.0, "n", 2));
        let s = simplify(&e);
        assert_eq!(s, Expr::monomial(5.0, "n", 2));

        // 2·log n + 3·log n = 5·log n
        let e = Expr::plus(Expr::log(2.0, "n", 2.0), Expr::log(3.0, "n", 2.0));
        assert_eq!(simplify(&e), Expr::log(5.0, "n", 2.0));
    }

    #[test]
    fn polylog_canonicalization() {
        // d=0, j=0 → constant
        assert_eq!(simplify(&Expr::poly_log(4.0, "n", 0.0, 0.0, 2.0)), Expr::constant(4.0));
        // j=0, integer d → polynomial
        assert_eq!(simplify(&Expr::poly_log(2.0, "n", 3.0, 0.0, 2.0)), Expr::monomial(2.0, "n", 3));
        // d=0, j=1 → logarithmic
        assert_eq!(simplify(&Expr::poly_log(1.0, "n", 0.0, 1.0, 2.0)), Expr::log(1.0, "n", 2.0));
    }

    #[test]
    fn mul_builds_polylog() {
        // n · log n → n^1 log^1 n
        let e = Expr::mul(Expr::var("n"), Expr::log(1.0, "n", 2.0));
        let s = simplify(&e);
        let c = classify(&s, "n");
        assert_eq!(c.form, GrowthForm::PolyLog);
        assert!((c.poly_degree - 1.0).abs() < 1e-12);
        assert!((c.log_exponent - 1.0).abs() < 1e-12);
    }

    #[test]
    fn compare_total_order_on_common_classes() {
        let one = Expr::one();
        let logn = Expr::log(1.0, "n", 2.0);
        let n = Expr::linear(1.0, "n");
        let nlogn = Expr::poly_log(1.0, "n", 1.0, 1.0, 2.0);
        let n2 = Expr::monomial(1.0, "n", 2);
        let exp = Expr::exponential(2.0, "n", 1.0);
        let fact = Expr::factorial("n", 1.0);

        let chain = [&one, &logn, &n, &nlogn, &n2, &exp, &fact];
        for w in chain.windows(2) {
            assert_eq!(
                compare_asymptotic(w[0], w[1]),
                AsymptoticOrd::Less,
                "{} should be < {}",
                w[0],
                w[1]
            );
        }
        // Constants compare equal regardless of magnitude.
        assert_eq!(
            compare_asymptotic(&Expr::constant(7.0), &Expr::constant(1.0)),
            AsymptoticOrd::Equal
        );
    }

    #[test]
    fn exponential_bases_ordered() {
        let e2 = Expr::exponential(2.0, "n", 1.0);
        let e3 = Expr::exponential(3.0, "n", 1.0);
        assert_eq!(compare_asymptotic(&e2, &e3), AsymptoticOrd::Less);
    }

    #[test]
    fn different_var_sets_incomparable() {
        let n = Expr::linear(1.0, "n");
        let m = Expr::linear(1.0, "m");
        assert_eq!(compare_asymptotic(&n, &m), AsymptoticOrd::Incomparable);
        // A constant is below any growing class, shared variables or not.
        assert_eq!(compare_asymptotic(&Expr::constant(9.0), &n), AsymptoticOrd::Less);
    }

    #[test]
    fn classification_round_trip() {
        let e = Expr::poly_log(1.0, "n", 2.0, 3.0, 2.0);
        let c = classify(&e, "n");
        let back = c.to_poly_log("n");
        assert_eq!(simplify(&back), simplify(&e));
    }

    #[test]
    fn classify_exp_of_log_is_polynomial() {
        // 2^(log2 n) = n
        let e = Expr::ExpOf {
            base: 2.0,
            inner: Arc::new(Expr::log(1.0, "n", 2.0)),
        };
        let c = classify(&e, "n");
        assert_eq!(c.form, GrowthForm::Polynomial);
        assert!((c.poly_degree - 1.0).abs() < 1e-9, "2^(lg n) = n, degree 1, got {}", c.poly_degree);
    }

    #[test]
    fn drop_constant_factors_strips_leading() {
        let e = Expr::mul(Expr::constant(42.0), Expr::poly_log(3.0, "n", 1.0, 1.0, 2.0));
        let o = drop_constant_factors(&e);
        let c = classify(&o, "n");
        assert!((c.leading_coeff - 1.0).abs() < 1e-12);
        assert_eq!(c.form, GrowthForm::PolyLog);
    }

    #[test]
    fn drop_lower_order_keeps_dominant() {
        // n² + n log n + 7 → n²
        let e = Expr::plus(
            Expr::plus(Expr::monomial(1.0, "n", 2), Expr::poly_log(1.0, "n", 1.0, 1.0, 2.0)),
            Expr::constant(7.0),
        );
        let o = drop_lower_order_terms(&e);
        assert_eq!(o, Expr::monomial(1.0, "n", 2));
    }

    #[test]
    fn drop_lower_order_keeps_incomparable_pair() {
        let e = Expr::plus(Expr::linear(1.0, "n"), Expr::linear(1.0, "m"));
        let o = drop_lower_order_terms(&e);
        let fv = o.free_vars();
        assert_eq!(fv.len(), 2, "incomparable terms must both survive: {o}");
    }

    #[test]
    fn max_collapses_when_comparable() {
        let e = Expr::max(Expr::monomial(1.0, "n", 2), Expr::linear(1.0, "n"));
        assert_eq!(simplify(&e), Expr::monomial(1.0, "n", 2));
    }

    #[test]
    fn simplify_agrees_numerically_on_plus() {
        // Value-level sanity on a pure Plus/Mul tree.
        let e = Expr::plus(
            Expr::mul(Expr::constant(2.0), Expr::monomial(1.0, "n", 2)),
            Expr::monomial(3.0, "n", 2),
        );
        let s = simplify(&e);
        let env = env1("n", 10.0);
        assert_eq!(e.evaluate(&env), s.evaluate(&env));
    }
}
