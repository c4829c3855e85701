//! Complexity-expression AST
//!
//! The algebra every pipeline stage speaks: an immutable tagged union over
//! the standard growth classes (constant, polynomial, logarithmic, poly-log,
//! exponential, factorial, special functions) plus compositional operators.
//!
//! ## Invariants
//! - Nodes are deeply immutable; subtrees are shared via `Arc` and every
//!   "mutation" returns a new tree. Structural equality defines identity.
//! - `Constant(0)` is the additive identity, `Constant(1)` the multiplicative
//!   identity; `simplify` (in [`crate::simplify`]) enforces both.
//! - `PolyLog` is the canonical carrier for `k · v^d · log_b(v)^j`; its
//!   degenerate shapes collapse per the rules in [`crate::simplify`].
//! - Worst-case evaluation convention: `Conditional` evaluates as the max of
//!   its branches, `Probabilistic` as its worst-case member, `Amortized` as
//!   its per-operation worst case.
//!
//! Numeric evaluation is total in the sense that it never panics: missing
//! variables, overflow, and non-representable special values all surface as
//! `None`.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Semantic kind of a variable. Kinds carry no algebraic meaning; they exist
/// so diagnostics can say "vertex count" instead of "v".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarKind {
    InputSize,
    VertexCount,
    EdgeCount,
    TreeHeight,
    ProcessorCount,
    SecondarySize,
    Custom,
}

/// A named symbol with a semantic kind.
///
/// On the wire a plain input-size symbol is just its name (`"n"`); symbols
/// with a diagnostic kind serialize as `{ "name": …, "vk": … }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Variable name, e.g. `"n"`.
    pub name: Arc<str>,
    /// Diagnostic kind (no algebraic meaning).
    pub kind: VarKind,
}

impl Serialize for Symbol {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        if self.kind == VarKind::InputSize {
            ser.serialize_str(&self.name)
        } else {
            use serde::ser::SerializeStruct;
            let mut s = ser.serialize_struct("Symbol", 2)?;
            s.serialize_field("name", &*self.name)?;
            s.serialize_field("vk", &self.kind)?;
            s.end()
        }
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bare(String),
            Tagged { name: String, vk: VarKind },
        }
        Ok(match Repr::deserialize(de)? {
            Repr::Bare(name) => Symbol::input(&name),
            Repr::Tagged { name, vk } => Symbol::with_kind(&name, vk),
        })
    }
}

impl Symbol {
    /// Input-size symbol with the given name (the common case).
    pub fn input(name: &str) -> Self {
        Self { name: Arc::from(name), kind: VarKind::InputSize }
    }
    /// Symbol with an explicit kind.
    pub fn with_kind(name: &str, kind: VarKind) -> Self {
        Self { name: Arc::from(name), kind }
    }
}

/// Binary operators over expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOpKind {
    Plus,
    Mul,
    Max,
    Min,
}

/// Method tag for an amortized bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmortizedMethod {
    Aggregate,
    Accounting,
    Potential,
}

/// Special functions that show up as Akra–Bazzi integral residues.
///
/// Each variant records enough structure to be rendered and, where a cheap
/// series exists, numerically approximated. `SymbolicIntegral` additionally
/// carries a heuristic asymptotic bound obtained by dominant-term analysis;
/// comparison uses that bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fn")]
pub enum SpecialKind {
    /// Polylogarithm `Li_s(z)`.
    Polylogarithm { s: f64, z: f64 },
    /// Lower incomplete gamma `γ(s, x)` with `x` the recurrence variable.
    IncompleteGamma { s: f64, var: Symbol },
    /// Incomplete beta `B(x; a, b)` with `x` the recurrence variable.
    IncompleteBeta { a: f64, b: f64, var: Symbol },
    /// Gauss hypergeometric `₂F₁(a, b; c; z)`.
    Hypergeometric { a: f64, b: f64, c: f64, z: f64 },
    /// An integral we could not close; keeps the integrand for later CAS
    /// tightening and a heuristic bound for comparison.
    SymbolicIntegral {
        integrand: Arc<Expr>,
        var: Symbol,
        lower: f64,
        upper: Arc<Expr>,
        asymptotic_bound: Arc<Expr>,
    },
}

/// The expression AST. One JSON object per variant on the wire, with the
/// discriminator `"kind"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Expr {
    /// Non-negative constant `k`.
    Constant { k: f64 },
    /// A free variable.
    Var { var: Symbol },
    /// `k · v`.
    Linear { k: f64, var: Symbol },
    /// Sparse polynomial over integer degrees: absent key ⇔ zero coefficient;
    /// the highest present key is the degree.
    Polynomial { var: Symbol, coeffs: BTreeMap<u32, f64> },
    /// `k · log_base(v)`, base > 1.
    Logarithmic { k: f64, var: Symbol, base: f64 },
    /// `k · v^poly_deg · log_base(v)^log_exp`; degrees and exponents may be
    /// real. The canonical form for `O(n^d log^j n)`.
    PolyLog { k: f64, var: Symbol, poly_deg: f64, log_exp: f64, base: f64 },
    /// `k · base^v`, base > 1.
    Exponential { base: f64, var: Symbol, k: f64 },
    /// `k · v!`.
    Factorial { var: Symbol, k: f64 },
    /// `e^r` lifting a real power over a subexpression.
    Power { base: Arc<Expr>, exponent: f64 },
    /// `log_base(e)` over a subexpression.
    LogOf { inner: Arc<Expr>, base: f64 },
    /// `base^e` over a subexpression.
    ExpOf { base: f64, inner: Arc<Expr> },
    /// `e!` over a subexpression.
    FactOf { inner: Arc<Expr> },
    /// Binary node; `Max`/`Min` behave as arithmetic max/min.
    BinOp { left: Arc<Expr>, op: BinOpKind, right: Arc<Expr> },
    /// Runtime-dependent branch; worst-case evaluation takes the max.
    Conditional { label: String, when_true: Arc<Expr>, when_false: Arc<Expr> },
    /// Special-function residue.
    SpecialFn { f: SpecialKind },
    /// Distribution-annotated bound; worst-case evaluation falls through to
    /// `worst`.
    Probabilistic {
        expected: Arc<Expr>,
        worst: Arc<Expr>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        best: Option<Arc<Expr>>,
        source: String,
        distribution: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variance: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        high_prob_bound: Option<Arc<Expr>>,
        #[serde(default)]
        assumptions: Vec<String>,
    },
    /// Amortized bound with its method tag.
    Amortized {
        amortized: Arc<Expr>,
        worst_case: Arc<Expr>,
        method: AmortizedMethod,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        potential: Option<Arc<Expr>>,
    },
}

// ============================================================================
// Constructors
// ============================================================================

impl Expr {
    /// `Constant(k)`. Negative inputs are clamped to zero: growth classes
    /// have non-negative magnitudes.
    pub fn constant(k: f64) -> Self {
        Expr::Constant { k: if k < 0.0 { 0.0 } else { k } }
    }
    /// The additive identity.
    pub fn zero() -> Self {
        Expr::Constant { k: 0.0 }
    }
    /// The multiplicative identity.
    pub fn one() -> Self {
        Expr::Constant { k: 1.0 }
    }
    /// A bare input-size variable.
    pub fn var(name: &str) -> Self {
        Expr::Var { var: Symbol::input(name) }
    }
    /// `k · v`.
    pub fn linear(k: f64, name: &str) -> Self {
        Expr::Linear { k, var: Symbol::input(name) }
    }
    /// Monomial `k · v^d` (integer degree).
    pub fn monomial(k: f64, name: &str, degree: u32) -> Self {
        let mut coeffs = BTreeMap::new();
        coeffs.insert(degree, k);
        Expr::Polynomial { var: Symbol::input(name), coeffs }
    }
    /// `k · log_base(v)`.
    pub fn log(k: f64, name: &str, base: f64) -> Self {
        debug_assert!(base > 1.0, "log base must exceed 1");
        Expr::Logarithmic { k, var: Symbol::input(name), base }
    }
    /// `k · v^d · log_base(v)^j`.
    pub fn poly_log(k: f64, name: &str, poly_deg: f64, log_exp: f64, base: f64) -> Self {
        Expr::PolyLog { k, var: Symbol::input(name), poly_deg, log_exp, base }
    }
    /// `k · base^v`.
    pub fn exponential(base: f64, name: &str, k: f64) -> Self {
        debug_assert!(base > 1.0, "exponential base must exceed 1");
        Expr::Exponential { base, var: Symbol::input(name), k }
    }
    /// `k · v!`.
    pub fn factorial(name: &str, k: f64) -> Self {
        Expr::Factorial { var: Symbol::input(name), k }
    }
    /// `l + r`.
    pub fn plus(l: Expr, r: Expr) -> Self {
        Expr::BinOp { left: Arc::new(l), op: BinOpKind::Plus, right: Arc::new(r) }
    }
    /// `l · r`.
    pub fn mul(l: Expr, r: Expr) -> Self {
        Expr::BinOp { left: Arc::new(l), op: BinOpKind::Mul, right: Arc::new(r) }
    }
    /// `max(l, r)`.
    pub fn max(l: Expr, r: Expr) -> Self {
        Expr::BinOp { left: Arc::new(l), op: BinOpKind::Max, right: Arc::new(r) }
    }
    /// `min(l, r)`.
    pub fn min(l: Expr, r: Expr) -> Self {
        Expr::BinOp { left: Arc::new(l), op: BinOpKind::Min, right: Arc::new(r) }
    }

    /// True iff this node is `Constant(0)`.
    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Constant { k } if *k == 0.0)
    }
    /// True iff this node is `Constant(1)`.
    pub fn is_one(&self) -> bool {
        matches!(self, Expr::Constant { k } if *k == 1.0)
    }
    /// Constant payload, if this node is a constant.
    pub fn as_constant(&self) -> Option<f64> {
        match self {
            Expr::Constant { k } => Some(*k),
            _ => None,
        }
    }
}

// ============================================================================
// Free variables
// ============================================================================

impl Expr {
    /// The set of variable names reachable in this tree.
    pub fn free_vars(&self) -> BTreeSet<Arc<str>> {
        let mut out = BTreeSet::new();
        self.collect_free(&mut out);
        out
    }

    fn collect_free(&self, out: &mut BTreeSet<Arc<str>>) {
        match self {
            Expr::Constant { .. } => {}
            Expr::Var { var }
            | Expr::Linear { var, .. }
            | Expr::Polynomial { var, .. }
            | Expr::Logarithmic { var, .. }
            | Expr::PolyLog { var, .. }
            | Expr::Exponential { var, .. }
            | Expr::Factorial { var, .. } => {
                out.insert(var.name.clone());
            }
            Expr::Power { base, .. } => base.collect_free(out),
            Expr::LogOf { inner, .. } | Expr::ExpOf { inner, .. } | Expr::FactOf { inner } => {
                inner.collect_free(out)
            }
            Expr::BinOp { left, right, .. } => {
                left.collect_free(out);
                right.collect_free(out);
            }
            Expr::Conditional { when_true, when_false, .. } => {
                when_true.collect_free(out);
                when_false.collect_free(out);
            }
            Expr::SpecialFn { f } => match f {
                SpecialKind::Polylogarithm { .. } | SpecialKind::Hypergeometric { .. } => {}
                SpecialKind::IncompleteGamma { var, .. }
                | SpecialKind::IncompleteBeta { var, .. } => {
                    out.insert(var.name.clone());
                }
                SpecialKind::SymbolicIntegral { integrand, upper, asymptotic_bound, var, .. } => {
                    // The integration variable is bound inside the integrand.
                    let mut inner = BTreeSet::new();
                    integrand.collect_free(&mut inner);
                    inner.remove(&var.name);
                    out.extend(inner);
                    upper.collect_free(out);
                    asymptotic_bound.collect_free(out);
                }
            },
            Expr::Probabilistic { expected, worst, best, high_prob_bound, .. } => {
                expected.collect_free(out);
                worst.collect_free(out);
                if let Some(b) = best {
                    b.collect_free(out);
                }
                if let Some(h) = high_prob_bound {
                    h.collect_free(out);
                }
            }
            Expr::Amortized { amortized, worst_case, potential, .. } => {
                amortized.collect_free(out);
                worst_case.collect_free(out);
                if let Some(p) = potential {
                    p.collect_free(out);
                }
            }
        }
    }

    /// True iff the tree mentions no variable at all.
    pub fn is_variable_free(&self) -> bool {
        self.free_vars().is_empty()
    }
}

// ============================================================================
// Substitution
// ============================================================================

impl Expr {
    /// Capture-free replacement of every occurrence of `name` by
    /// `replacement`.
    ///
    /// Leaf growth classes (`Linear`, `Polynomial`, …) are *shapes over a
    /// variable*; replacing their variable by a non-variable expression lifts
    /// them to the compositional forms (`Power`, `LogOf`, …) so the shape is
    /// preserved rather than silently lost.
    pub fn substitute(&self, name: &str, replacement: &Expr) -> Expr {
        match self {
            Expr::Constant { .. } => self.clone(),
            Expr::Var { var } => {
                if &*var.name == name {
                    replacement.clone()
                } else {
                    self.clone()
                }
            }
            Expr::Linear { k, var } => {
                if &*var.name == name {
                    match replacement {
                        Expr::Var { var: v } => Expr::Linear { k: *k, var: v.clone() },
                        other => Expr::mul(Expr::constant(*k), other.clone()),
                    }
                } else {
                    self.clone()
                }
            }
            Expr::Polynomial { var, coeffs } => {
                if &*var.name == name {
                    match replacement {
                        Expr::Var { var: v } => {
                            Expr::Polynomial { var: v.clone(), coeffs: coeffs.clone() }
                        }
                        other => {
                            // Σ c_d · (repl)^d, rebuilt with Power nodes.
                            let mut acc = Expr::zero();
                            for (d, c) in coeffs {
                                let term = Expr::mul(
                                    Expr::constant(*c),
                                    Expr::Power {
                                        base: Arc::new(other.clone()),
                                        exponent: *d as f64,
                                    },
                                );
                                acc = Expr::plus(acc, term);
                            }
                            acc
                        }
                    }
                } else {
                    self.clone()
                }
            }
            Expr::Logarithmic { k, var, base } => {
                if &*var.name == name {
                    match replacement {
                        Expr::Var { var: v } => {
                            Expr::Logarithmic { k: *k, var: v.clone(), base: *base }
                        }
                        other => Expr::mul(
                            Expr::constant(*k),
                            Expr::LogOf { inner: Arc::new(other.clone()), base: *base },
                        ),
                    }
                } else {
                    self.clone()
                }
            }
            Expr::PolyLog { k, var, poly_deg, log_exp, base } => {
                if &*var.name == name {
                    match replacement {
                        Expr::Var { var: v } => Expr::PolyLog {
                            k: *k,
                            var: v.clone(),
                            poly_deg: *poly_deg,
                            log_exp: *log_exp,
                            base: *base,
                        },
                        other => {
                            let poly = Expr::Power {
                                base: Arc::new(other.clone()),
                                exponent: *poly_deg,
                            };
                            let logp = Expr::Power {
                                base: Arc::new(Expr::LogOf {
                                    inner: Arc::new(other.clone()),
                                    base: *base,
                                }),
                                exponent: *log_exp,
                            };
                            Expr::mul(Expr::constant(*k), Expr::mul(poly, logp))
                        }
                    }
                } else {
                    self.clone()
                }
            }
            Expr::Exponential { base, var, k } => {
                if &*var.name == name {
                    match replacement {
                        Expr::Var { var: v } => {
                            Expr::Exponential { base: *base, var: v.clone(), k: *k }
                        }
                        other => Expr::mul(
                            Expr::constant(*k),
                            Expr::ExpOf { base: *base, inner: Arc::new(other.clone()) },
                        ),
                    }
                } else {
                    self.clone()
                }
            }
            Expr::Factorial { var, k } => {
                if &*var.name == name {
                    match replacement {
                        Expr::Var { var: v } => Expr::Factorial { var: v.clone(), k: *k },
                        other => Expr::mul(
                            Expr::constant(*k),
                            Expr::FactOf { inner: Arc::new(other.clone()) },
                        ),
                    }
                } else {
                    self.clone()
                }
            }
            Expr::Power { base, exponent } => Expr::Power {
                base: Arc::new(base.substitute(name, replacement)),
                exponent: *exponent,
            },
            Expr::LogOf { inner, base } => Expr::LogOf {
                inner: Arc::new(inner.substitute(name, replacement)),
                base: *base,
            },
            Expr::ExpOf { base, inner } => Expr::ExpOf {
                base: *base,
                inner: Arc::new(inner.substitute(name, replacement)),
            },
            Expr::FactOf { inner } => {
                Expr::FactOf { inner: Arc::new(inner.substitute(name, replacement)) }
            }
            Expr::BinOp { left, op, right } => Expr::BinOp {
                left: Arc::new(left.substitute(name, replacement)),
                op: *op,
                right: Arc::new(right.substitute(name, replacement)),
            },
            Expr::Conditional { label, when_true, when_false } => Expr::Conditional {
                label: label.clone(),
                when_true: Arc::new(when_true.substitute(name, replacement)),
                when_false: Arc::new(when_false.substitute(name, replacement)),
            },
            Expr::SpecialFn { f } => match f {
                SpecialKind::Polylogarithm { .. } | SpecialKind::Hypergeometric { .. } => {
                    self.clone()
                }
                SpecialKind::IncompleteGamma { .. } | SpecialKind::IncompleteBeta { .. } => {
                    // The argument variable of γ/B is structural; renaming it
                    // is the only substitution that keeps the shape.
                    match (f, replacement) {
                        (SpecialKind::IncompleteGamma { s, var }, Expr::Var { var: v })
                            if &*var.name == name =>
                        {
                            Expr::SpecialFn {
                                f: SpecialKind::IncompleteGamma { s: *s, var: v.clone() },
                            }
                        }
                        (SpecialKind::IncompleteBeta { a, b, var }, Expr::Var { var: v })
                            if &*var.name == name =>
                        {
                            Expr::SpecialFn {
                                f: SpecialKind::IncompleteBeta { a: *a, b: *b, var: v.clone() },
                            }
                        }
                        _ => self.clone(),
                    }
                }
                SpecialKind::SymbolicIntegral { integrand, var, lower, upper, asymptotic_bound } => {
                    // The integration variable shadows `name` inside the integrand.
                    let integrand = if &*var.name == name {
                        integrand.clone()
                    } else {
                        Arc::new(integrand.substitute(name, replacement))
                    };
                    Expr::SpecialFn {
                        f: SpecialKind::SymbolicIntegral {
                            integrand,
                            var: var.clone(),
                            lower: *lower,
                            upper: Arc::new(upper.substitute(name, replacement)),
                            asymptotic_bound: Arc::new(
                                asymptotic_bound.substitute(name, replacement),
                            ),
                        },
                    }
                }
            },
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
                expected: Arc::new(expected.substitute(name, replacement)),
                worst: Arc::new(worst.substitute(name, replacement)),
                best: best.as_ref().map(|b| Arc::new(b.substitute(name, replacement))),
                source: source.clone(),
                distribution: distribution.clone(),
                variance: *variance,
                high_prob_bound: high_prob_bound
                    .as_ref()
                    .map(|h| Arc::new(h.substitute(name, replacement))),
                assumptions: assumptions.clone(),
            },
            Expr::Amortized { amortized, worst_case, method, potential } => Expr::Amortized {
                amortized: Arc::new(amortized.substitute(name, replacement)),
                worst_case: Arc::new(worst_case.substitute(name, replacement)),
                method: *method,
                potential: potential.as_ref().map(|p| Arc::new(p.substitute(name, replacement))),
            },
        }
    }
}

// ============================================================================
// Numeric evaluation (worst-case convention)
// ============================================================================

/// Variable environment for numeric evaluation.
pub type Env = BTreeMap<Arc<str>, f64>;

/// Build an environment binding a single variable.
pub fn env1(name: &str, value: f64) -> Env {
    let mut e = Env::new();
    e.insert(Arc::from(name), value);
    e
}

impl Expr {
    /// Evaluate numerically under `env`. Returns `None` when a free variable
    /// is missing, a computation overflows to non-finite, or a special
    /// function has no representable value at the point.
    pub fn evaluate(&self, env: &Env) -> Option<f64> {
        let v = match self {
            Expr::Constant { k } => *k,
            Expr::Var { var } => *env.get(&var.name)?,
            Expr::Linear { k, var } => k * *env.get(&var.name)?,
            Expr::Polynomial { var, coeffs } => {
                let x = *env.get(&var.name)?;
                let mut acc = 0.0;
                for (d, c) in coeffs {
                    acc += c * x.powi(*d as i32);
                }
                acc
            }
            Expr::Logarithmic { k, var, base } => {
                let x = *env.get(&var.name)?;
                if x <= 0.0 {
                    return None;
                }
                k * x.ln() / base.ln()
            }
            Expr::PolyLog { k, var, poly_deg, log_exp, base } => {
                let x = *env.get(&var.name)?;
                if x <= 0.0 {
                    return None;
                }
                let lg = x.ln() / base.ln();
                if lg < 0.0 && log_exp.fract() != 0.0 {
                    return None;
                }
                k * x.powf(*poly_deg) * lg.powf(*log_exp)
            }
            Expr::Exponential { base, var, k } => k * base.powf(*env.get(&var.name)?),
            Expr::Factorial { var, k } => k * gamma_fact(*env.get(&var.name)?)?,
            Expr::Power { base, exponent } => base.evaluate(env)?.powf(*exponent),
            Expr::LogOf { inner, base } => {
                let x = inner.evaluate(env)?;
                if x <= 0.0 {
                    return None;
                }
                x.ln() / base.ln()
            }
            Expr::ExpOf { base, inner } => base.powf(inner.evaluate(env)?),
            Expr::FactOf { inner } => gamma_fact(inner.evaluate(env)?)?,
            Expr::BinOp { left, op, right } => {
                let l = left.evaluate(env)?;
                let r = right.evaluate(env)?;
                match op {
                    BinOpKind::Plus => l + r,
                    BinOpKind::Mul => l * r,
                    BinOpKind::Max => l.max(r),
                    BinOpKind::Min => l.min(r),
                }
            }
            Expr::Conditional { when_true, when_false, .. } => {
                let t = when_true.evaluate(env)?;
                let f = when_false.evaluate(env)?;
                t.max(f)
            }
            Expr::SpecialFn { f } => special_eval(f, env)?,
            Expr::Probabilistic { worst, .. } => worst.evaluate(env)?,
            Expr::Amortized { worst_case, .. } => worst_case.evaluate(env)?,
        };
        if v.is_finite() {
            Some(v)
        } else {
            None
        }
    }
}

/// `x!` extended over the reals: `Γ(x + 1)` via `exp(lnΓ)`. Overflow → `None`.
fn gamma_fact(x: f64) -> Option<f64> {
    if x < 0.0 {
        return None;
    }
    let v = ln_gamma(x + 1.0).exp();
    if v.is_finite() {
        Some(v)
    } else {
        None
    }
}

/// Lanczos approximation of `ln Γ(x)` for `x > 0`.
pub(crate) fn ln_gamma(x: f64) -> f64 {
    // g = 7, n = 9 coefficient set.
    const COEF: [f64; 9] = [
        0.999_999_999_999_809_93,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_13,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_571_6e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        // Reflection: Γ(x)Γ(1−x) = π / sin(πx)
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut acc = COEF[0];
    for (i, c) in COEF.iter().enumerate().skip(1) {
        acc += c / (x + i as f64);
    }
    let t = x + 7.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
}

fn special_eval(f: &SpecialKind, env: &Env) -> Option<f64> {
    match f {
        SpecialKind::Polylogarithm { s, z } => {
            // Series Σ z^k / k^s, valid for |z| < 1.
            if z.abs() >= 1.0 {
                return None;
            }
            let mut acc = 0.0;
            let mut zk = *z;
            for k in 1..200u32 {
                let term = zk / (k as f64).powf(*s);
                acc += term;
                if term.abs() < 1e-15 {
                    break;
                }
                zk *= z;
            }
            Some(acc)
        }
        SpecialKind::IncompleteGamma { s, var } => {
            let x = *env.get(&var.name)?;
            if x < 0.0 || *s <= 0.0 {
                return None;
            }
            // Series: γ(s, x) = x^s e^{-x} Σ_{k≥0} x^k / (s (s+1) … (s+k)).
            let mut denom = *s;
            let mut term = 1.0 / denom;
            let mut acc = term;
            for k in 1..500u32 {
                denom = *s + k as f64;
                term *= x / denom;
                acc += term;
                if term.abs() < 1e-15 * acc.abs() {
                    break;
                }
            }
            let v = x.powf(*s) * (-x).exp() * acc;
            if v.is_finite() {
                Some(v)
            } else {
                None
            }
        }
        // No cheap, robust scalar scheme here; callers fall back to the
        // recorded asymptotic bound instead of a point value.
        SpecialKind::IncompleteBeta { .. } | SpecialKind::Hypergeometric { .. } => None,
        SpecialKind::SymbolicIntegral { asymptotic_bound, .. } => asymptotic_bound.evaluate(env),
    }
}

// ============================================================================
// Digest & display
// ============================================================================

/// Stable 32-byte digest of an expression, used in logs and memo keys.
pub fn expr_digest(e: &Expr) -> [u8; 32] {
    let mut h = blake3::Hasher::new();
    h.update(b"thetabound.expr.v1");
    let bytes = serde_json::to_vec(e).unwrap_or_default();
    h.update(&bytes);
    *h.finalize().as_bytes()
}

fn fmt_coeff(k: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if (k - 1.0).abs() > 1e-12 {
        write!(f, "{k}·")?;
    }
    Ok(())
}

fn fmt_real_pow(f: &mut fmt::Formatter<'_>, e: f64) -> fmt::Result {
    if (e - e.round()).abs() < 1e-9 {
        write!(f, "{}", e.round() as i64)
    } else {
        write!(f, "{e:.4}")
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Constant { k } => write!(f, "{k}"),
            Expr::Var { var } => write!(f, "{}", var.name),
            Expr::Linear { k, var } => {
                fmt_coeff(*k, f)?;
                write!(f, "{}", var.name)
            }
            Expr::Polynomial { var, coeffs } => {
                let mut first = true;
                for (d, c) in coeffs.iter().rev() {
                    if !first {
                        write!(f, " + ")?;
                    }
                    first = false;
                    match d {
                        0 => write!(f, "{c}")?,
                        1 => {
                            fmt_coeff(*c, f)?;
                            write!(f, "{}", var.name)?;
                        }
                        _ => {
                            fmt_coeff(*c, f)?;
                            write!(f, "{}^{}", var.name, d)?;
                        }
                    }
                }
                if first {
                    write!(f, "0")?;
                }
                Ok(())
            }
            Expr::Logarithmic { k, var, base } => {
                fmt_coeff(*k, f)?;
                if (*base - 2.0).abs() < 1e-12 {
                    write!(f, "lg {}", var.name)
                } else if (*base - std::f64::consts::E).abs() < 1e-12 {
                    write!(f, "ln {}", var.name)
                } else {
                    write!(f, "log_{base}({})", var.name)
                }
            }
            Expr::PolyLog { k, var, poly_deg, log_exp, base } => {
                fmt_coeff(*k, f)?;
                if *poly_deg != 0.0 {
                    write!(f, "{}^", var.name)?;
                    fmt_real_pow(f, *poly_deg)?;
                    if *log_exp != 0.0 {
                        write!(f, "·")?;
                    }
                }
                if *log_exp != 0.0 {
                    let _ = base;
                    write!(f, "log^")?;
                    fmt_real_pow(f, *log_exp)?;
                    write!(f, " {}", var.name)?;
                }
                if *poly_deg == 0.0 && *log_exp == 0.0 {
                    write!(f, "1")?;
                }
                Ok(())
            }
            Expr::Exponential { base, var, k } => {
                fmt_coeff(*k, f)?;
                write!(f, "{base}^{}", var.name)
            }
            Expr::Factorial { var, k } => {
                fmt_coeff(*k, f)?;
                write!(f, "{}!", var.name)
            }
            Expr::Power { base, exponent } => {
                write!(f, "({base})^")?;
                fmt_real_pow(f, *exponent)
            }
            Expr::LogOf { inner, base } => write!(f, "log_{base}({inner})"),
            Expr::ExpOf { base, inner } => write!(f, "{base}^({inner})"),
            Expr::FactOf { inner } => write!(f, "({inner})!"),
            Expr::BinOp { left, op, right } => match op {
                BinOpKind::Plus => write!(f, "{left} + {right}"),
                BinOpKind::Mul => write!(f, "({left})·({right})"),
                BinOpKind::Max => write!(f, "max({left}, {right})"),
                BinOpKind::Min => write!(f, "min({left}, {right})"),
            },
            Expr::Conditional { label, when_true, when_false } => {
                write!(f, "[{label} ? {when_true} : {when_false}]")
            }
            Expr::SpecialFn { f: sf } => match sf {
                SpecialKind::Polylogarithm { s, z } => write!(f, "Li_{s}({z})"),
                SpecialKind::IncompleteGamma { s, var } => write!(f, "γ({s}, {})", var.name),
                SpecialKind::IncompleteBeta { a, b, var } => {
                    write!(f, "B({}; {a}, {b})", var.name)
                }
                SpecialKind::Hypergeometric { a, b, c, z } => {
                    write!(f, "₂F₁({a}, {b}; {c}; {z})")
                }
                SpecialKind::SymbolicIntegral { integrand, var, lower, upper, .. } => {
                    write!(f, "∫_{lower}^{upper} {integrand} d{}", var.name)
                }
            },
            Expr::Probabilistic { expected, worst, .. } => {
                write!(f, "E[{expected}] (worst {worst})")
            }
            Expr::Amortized { amortized, worst_case, .. } => {
                write!(f, "amortized {amortized} (worst {worst_case})")
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitution_identity() {
        // substitute(e, v, Var(v)) = e
        let e = Expr::plus(Expr::poly_log(1.0, "n", 2.0, 1.0, 2.0), Expr::log(3.0, "n", 2.0));
        let same = e.substitute("n", &Expr::var("n"));
        assert_eq!(e, same);
    }

    #[test]
    fn substitution_free_var_contract() {
        // free(result) = (free(e) \ {v}) ∪ free(repl) when v ∈ free(e)
        let e = Expr::plus(Expr::linear(2.0, "n"), Expr::var("m"));
        let r = e.substitute("n", &Expr::var("k"));
        let fv = r.free_vars();
        assert!(fv.iter().any(|v| &**v == "k"));
        assert!(fv.iter().any(|v| &**v == "m"));
        assert!(!fv.iter().any(|v| &**v == "n"));
    }

    #[test]
    fn substitution_lifts_leaf_shapes() {
        // log(n)[n := n/2] keeps a logarithmic shape via LogOf.
        let e = Expr::log(1.0, "n", 2.0);
        let half = Expr::linear(0.5, "n");
        let s = e.substitute("n", &half);
        // evaluates to log2(n/2)
        let env = env1("n", 16.0);
        let v = s.evaluate(&env).unwrap();
        assert!((v - 3.0).abs() < 1e-12, "log2(8) = 3, got {v}");
    }

    #[test]
    fn evaluate_missing_var_is_none() {
        let e = Expr::linear(2.0, "n");
        assert_eq!(e.evaluate(&Env::new()), None);
    }

    #[test]
    fn evaluate_worst_case_conventions() {
        let cond = Expr::Conditional {
            label: "balanced".into(),
            when_true: Arc::new(Expr::constant(4.0)),
            when_false: Arc::new(Expr::constant(9.0)),
        };
        assert_eq!(cond.evaluate(&Env::new()), Some(9.0));

        let prob = Expr::Probabilistic {
            expected: Arc::new(Expr::log(1.0, "n", 2.0)),
            worst: Arc::new(Expr::linear(1.0, "n")),
            best: None,
            source: "pivot".into(),
            distribution: "uniform".into(),
            variance: None,
            high_prob_bound: None,
            assumptions: vec![],
        };
        assert_eq!(prob.evaluate(&env1("n", 32.0)), Some(32.0));
    }

    #[test]
    fn evaluate_overflow_is_none() {
        // 10^(10^4) overflows f64.
        let e = Expr::exponential(10.0, "n", 1.0);
        assert_eq!(e.evaluate(&env1("n", 1.0e4)), None);
    }

    #[test]
    fn factorial_matches_small_cases() {
        let e = Expr::factorial("n", 1.0);
        let v = e.evaluate(&env1("n", 5.0)).unwrap();
        assert!((v - 120.0).abs() < 1e-6, "5! = 120, got {v}");
    }

    #[test]
    fn ln_gamma_half_integer() {
        // Γ(1/2) = √π
        let v = ln_gamma(0.5).exp();
        assert!((v - std::f64::consts::PI.sqrt()).abs() < 1e-10);
    }

    #[test]
    fn incomplete_gamma_series_sane() {
        // γ(1, x) = 1 − e^{−x}
        let f = SpecialKind::IncompleteGamma { s: 1.0, var: Symbol::input("n") };
        let env = env1("n", 2.0);
        let v = special_eval(&f, &env).unwrap();
        assert!((v - (1.0 - (-2.0f64).exp())).abs() < 1e-10);
    }

    #[test]
    fn wire_roundtrip_tagged_kind() {
        let e = Expr::poly_log(1.0, "n", 1.0, 1.0, 2.0);
        let js = serde_json::to_string(&e).unwrap();
        assert!(js.contains("\"kind\":\"PolyLog\""));
        let back: Expr = serde_json::from_str(&js).unwrap();
        assert_eq!(e, back);
    }

    #[test]
    fn symbolic_integral_binds_its_variable() {
        let integrand = Expr::poly_log(1.0, "u", 1.0, 0.0, 2.0);
        let e = Expr::SpecialFn {
            f: SpecialKind::SymbolicIntegral {
                integrand: Arc::new(integrand),
                var: Symbol::input("u"),
                lower: 1.0,
                upper: Arc::new(Expr::var("n")),
                asymptotic_bound: Arc::new(Expr::monomial(1.0, "n", 2)),
            },
        };
        let fv = e.free_vars();
        assert!(fv.iter().any(|v| &**v == "n"));
        assert!(!fv.iter().any(|v| &**v == "u"));
    }
}
