//! External-CAS bridge
//!
//! The optional out-of-process symbolic backend. The core never requires
//! it: its presence changes only confidence and the symbolic-vs-numerical
//! verification path.
//!
//! Three pieces:
//!
//! - [`CasBridge`] — the contract. Four asynchronous, cancellable
//!   operations; every call carries a deadline. I/O, parsing and process
//!   management are entirely the bridge's concern.
//! - [`parse_cas_expr`] — the strict response parser. CAS output is *not*
//!   trusted as a general expression: only the recognized grammar
//!   (numbers, one variable, `log(v)`, powers, products, sums) is
//!   accepted; anything else is a protocol error.
//! - [`SubprocessBridge`] — a line-oriented transport over a configured
//!   command (feature `cas-bridge`). One JSON request per line out, one
//!   reply line back, deadline enforced with `tokio::time::timeout`.
//!   Expiry is reported as `Unavailable` so the pipeline falls back to the
//!   numerical path.

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;

use crate::expr::Expr;
use crate::progress::CancelToken;
use crate::recurrence::Recurrence;
use crate::refine::BoundKind;

/// Bridge failures. `Unavailable` (including deadline expiry) makes the
/// pipeline fall back to numerics; `Protocol` means the reply was rejected
/// by the strict parser.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge unavailable: {0}")]
    Unavailable(String),
    #[error("bridge call exceeded its deadline")]
    DeadlineExpired,
    #[error("bridge call cancelled")]
    Cancelled,
    #[error("unparseable CAS reply: {0}")]
    Protocol(String),
}

/// The conforming-bridge contract.
#[async_trait]
pub trait CasBridge: Send + Sync {
    /// Solve `T(n) = Σ cⱼ·T(n−j) + f(n)` with the given initial values.
    async fn solve_linear(
        &self,
        coeffs: &[f64],
        initial: &[f64],
        f: &Expr,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<Expr, BridgeError>;

    /// Solve `T(n) = a·T(b·n) + f(n)`.
    async fn solve_divide_and_conquer(
        &self,
        a: f64,
        b: f64,
        f: &Expr,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<Expr, BridgeError>;

    /// Pose the induction `T(n) ≤ c·f(n)` for the proposed solution.
    async fn verify(
        &self,
        proposed: &Expr,
        recurrence: &Recurrence,
        initial: &[f64],
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<bool, BridgeError>;

    /// Ask whether `f` relates to `g` under the requested bound kind.
    async fn compare_asymptotic(
        &self,
        f: &Expr,
        g: &Expr,
        bound: BoundKind,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<bool, BridgeError>;
}

// ============================================================================
// Strict response parser
// ============================================================================

/// Parse a CAS reply into an expression, accepting only the recognized
/// grammar:
///
/// ```text
/// expr    := term ('+' term)*
/// term    := factor ('*' factor)*
/// factor  := atom ('^' number)?
/// atom    := number | ident | 'log' '(' expr ')' | '(' expr ')'
/// ```
///
/// `ident^number` becomes a polynomial power, `number^ident` an
/// exponential, `log(ident)` a base-e logarithm. Anything outside the
/// grammar is a [`BridgeError::Protocol`].
pub fn parse_cas_expr(input: &str) -> Result<Expr, BridgeError> {
    let tokens = tokenize(input)?;
    let mut p = Parser { tokens, pos: 0 };
    let e = p.expr()?;
    if p.pos != p.tokens.len() {
        return Err(BridgeError::Protocol(format!(
            "trailing input at token {} of {:?}",
            p.pos, p.tokens
        )));
    }
    Ok(crate::simplify::simplify(&e))
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Ident(String),
    Plus,
    Star,
    Caret,
    LParen,
    RParen,
}

fn tokenize(s: &str) -> Result<Vec<Tok>, BridgeError> {
    let mut out = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '+' => {
                chars.next();
                out.push(Tok::Plus);
            }
            '*' => {
                chars.next();
                out.push(Tok::Star);
            }
            '^' => {
                chars.next();
                out.push(Tok::Caret);
            }
            '(' => {
                chars.next();
                out.push(Tok::LParen);
            }
            ')' => {
                chars.next();
                out.push(Tok::RParen);
            }
            '0'..='9' | '.' | '-' => {
                let mut buf = String::new();
                if c == '-' {
                    buf.push(c);
                    chars.next();
                }
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        buf.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let v: f64 = buf
                    .parse()
                    .map_err(|_| BridgeError::Protocol(format!("bad number `{buf}`")))?;
                out.push(Tok::Num(v));
            }
            c if c.is_ascii_alphabetic() => {
                let mut buf = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        buf.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push(Tok::Ident(buf));
            }
            other => {
                return Err(BridgeError::Protocol(format!("unexpected character `{other}`")))
            }
        }
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }
    fn bump(&mut self) -> Option<Tok> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }
    fn expect(&mut self, t: Tok) -> Result<(), BridgeError> {
        match self.bump() {
            Some(got) if got == t => Ok(()),
            got => Err(BridgeError::Protocol(format!("expected {t:?}, got {got:?}"))),
        }
    }

    fn expr(&mut self) -> Result<Expr, BridgeError> {
        let mut acc = self.term()?;
        while self.peek() == Some(&Tok::Plus) {
            self.bump();
            acc = Expr::plus(acc, self.term()?);
        }
        Ok(acc)
    }

    fn term(&mut self) -> Result<Expr, BridgeError> {
        let mut acc = self.factor()?;
        while self.peek() == Some(&Tok::Star) {
            self.bump();
            acc = Expr::mul(acc, self.factor()?);
        }
        Ok(acc)
    }

    fn factor(&mut self) -> Result<Expr, BridgeError> {
        let base = self.atom()?;
        if self.peek() == Some(&Tok::Caret) {
            self.bump();
            return match (base, self.bump()) {
                // v^r: polynomial power.
                (Expr::Var { var }, Some(Tok::Num(r))) => Ok(Expr::PolyLog {
                    k: 1.0,
                    var,
                    poly_deg: r,
                    log_exp: 0.0,
                    base: 2.0,
                }),
                // c^v: exponential.
                (Expr::Constant { k }, Some(Tok::Ident(v))) if k > 1.0 => {
                    Ok(Expr::exponential(k, &v, 1.0))
                }
                (Expr::Constant { k }, Some(Tok::Num(r))) => Ok(Expr::constant(k.powf(r))),
                // log(v)^j
                (e @ Expr::Logarithmic { .. }, Some(Tok::Num(r))) => {
                    Ok(Expr::Power { base: std::sync::Arc::new(e), exponent: r })
                }
                (b, e) => Err(BridgeError::Protocol(format!(
                    "unsupported power combination {b:?} ^ {e:?}"
                ))),
            };
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr, BridgeError> {
        match self.bump() {
            Some(Tok::Num(v)) => Ok(Expr::constant(v)),
            Some(Tok::Ident(name)) if name == "log" => {
                self.expect(Tok::LParen)?;
                let inner = self.expr()?;
                self.expect(Tok::RParen)?;
                Ok(match inner {
                    Expr::Var { var } => {
                        Expr::Logarithmic { k: 1.0, var, base: std::f64::consts::E }
                    }
                    other => Expr::LogOf {
                        inner: std::sync::Arc::new(other),
                        base: std::f64::consts::E,
                    },
                })
            }
            Some(Tok::Ident(name)) => Ok(Expr::var(&name)),
            Some(Tok::LParen) => {
                let e = self.expr()?;
                self.expect(Tok::RParen)?;
                Ok(e)
            }
            other => Err(BridgeError::Protocol(format!("unexpected token {other:?}"))),
        }
    }
}

// ============================================================================
// Subprocess transport
// ============================================================================

/// Configuration for the line-oriented subprocess transport.
#[cfg(feature = "cas-bridge")]
#[derive(Debug, Clone)]
pub struct SubprocessBridgeConfig {
    /// The CAS launcher, e.g. `"maxima-batch"`.
    pub command: String,
    pub args: Vec<String>,
}

/// A bridge that spawns the configured command per call, writes one JSON
/// request line, and reads one reply line.
#[cfg(feature = "cas-bridge")]
pub struct SubprocessBridge {
    config: SubprocessBridgeConfig,
}

#[cfg(feature = "cas-bridge")]
#[derive(serde::Serialize)]
struct WireRequest<'a> {
    op: &'a str,
    payload: serde_json::Value,
}

#[cfg(feature = "cas-bridge")]
impl SubprocessBridge {
    pub fn new(config: SubprocessBridgeConfig) -> Self {
        Self { config }
    }

    async fn roundtrip(
        &self,
        req: WireRequest<'_>,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<String, BridgeError> {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        let fut = async {
            let mut child = tokio::process::Command::new(&self.config.command)
                .args(&self.config.args)
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::null())
                .spawn()
                .map_err(|e| BridgeError::Unavailable(format!("spawn: {e}")))?;

            let mut stdin = child.stdin.take().ok_or_else(|| {
                BridgeError::Unavailable("child stdin unavailable".to_string())
            })?;
            let stdout = child.stdout.take().ok_or_else(|| {
                BridgeError::Unavailable("child stdout unavailable".to_string())
            })?;

            let line = serde_json::to_string(&req)
                .map_err(|e| BridgeError::Protocol(e.to_string()))?;
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| BridgeError::Unavailable(format!("write: {e}")))?;
            stdin
                .write_all(b"\n")
                .await
                .map_err(|e| BridgeError::Unavailable(format!("write: {e}")))?;
            drop(stdin);

            let mut reply = String::new();
            BufReader::new(stdout)
                .read_line(&mut reply)
                .await
                .map_err(|e| BridgeError::Unavailable(format!("read: {e}")))?;
            let _ = child.wait().await;
            Ok::<String, BridgeError>(reply.trim().to_string())
        };

        match tokio::time::timeout(deadline, fut).await {
            Ok(r) => {
                if cancel.is_cancelled() {
                    return Err(BridgeError::Cancelled);
                }
                r
            }
            Err(_) => Err(BridgeError::DeadlineExpired),
        }
    }
}

#[cfg(feature = "cas-bridge")]
#[async_trait]
impl CasBridge for SubprocessBridge {
    async fn solve_linear(
        &self,
        coeffs: &[f64],
        initial: &[f64],
        f: &Expr,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<Expr, BridgeError> {
        let reply = self
            .roundtrip(
                WireRequest {
                    op: "solve_linear",
                    payload: serde_json::json!({
                        "coeffs": coeffs,
                        "initial": initial,
                        "f": f,
                    }),
                },
                deadline,
                cancel,
            )
            .await?;
        parse_cas_expr(&reply)
    }

    async fn solve_divide_and_conquer(
        &self,
        a: f64,
        b: f64,
        f: &Expr,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<Expr, BridgeError> {
        let reply = self
            .roundtrip(
                WireRequest {
                    op: "solve_dc",
                    payload: serde_json::json!({ "a": a, "b": b, "f": f }),
                },
                deadline,
                cancel,
            )
            .await?;
        parse_cas_expr(&reply)
    }

    async fn verify(
        &self,
        proposed: &Expr,
        recurrence: &Recurrence,
        initial: &[f64],
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<bool, BridgeError> {
        let reply = self
            .roundtrip(
                WireRequest {
                    op: "verify",
                    payload: serde_json::json!({
                        "proposed": proposed,
                        "recurrence": recurrence,
                        "initial": initial,
                    }),
                },
                deadline,
                cancel,
            )
            .await?;
        match reply.as_str() {
            "true" | "holds" => Ok(true),
            "false" | "fails" => Ok(false),
            other => Err(BridgeError::Protocol(format!("verify reply `{other}`"))),
        }
    }

    async fn compare_asymptotic(
        &self,
        f: &Expr,
        g: &Expr,
        bound: BoundKind,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<bool, BridgeError> {
        let reply = self
            .roundtrip(
                WireRequest {
                    op: "compare",
                    payload: serde_json::json!({ "f": f, "g": g, "bound": bound }),
                },
                deadline,
                cancel,
            )
            .await?;
        match reply.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(BridgeError::Protocol(format!("compare reply `{other}`"))),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simplify::{classify, GrowthForm};

    #[test]
    fn parser_accepts_the_recognized_grammar() {
        let e = parse_cas_expr("n * log(n)").unwrap();
        let c = classify(&e, "n");
        assert_eq!(c.form, GrowthForm::PolyLog);

        let e = parse_cas_expr("n^1.585").unwrap();
        let c = classify(&e, "n");
        assert!((c.poly_degree - 1.585).abs() < 1e-9);

        let e = parse_cas_expr("2^n + n^2").unwrap();
        let c = classify(&e, "n");
        assert_eq!(c.form, GrowthForm::Exponential);

        let e = parse_cas_expr("3 * n + 7").unwrap();
        let c = classify(&e, "n");
        assert_eq!(c.form, GrowthForm::Polynomial);
    }

    #[test]
    fn parser_rejects_everything_else() {
        assert!(parse_cas_expr("system(\"rm\")").is_err());
        assert!(parse_cas_expr("n /").is_err());
        assert!(parse_cas_expr("@").is_err());
        assert!(parse_cas_expr("log(").is_err());
        assert!(parse_cas_expr("n n").is_err());
    }

    #[test]
    fn parsed_replies_are_simplified() {
        // 1 * n + 0 collapses to the bare variable class.
        let e = parse_cas_expr("1 * n + 0").unwrap();
        let c = classify(&e, "n");
        assert_eq!(c.form, GrowthForm::Polynomial);
        assert!((c.poly_degree - 1.0).abs() < 1e-12);
    }
}
