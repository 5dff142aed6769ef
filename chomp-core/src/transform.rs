//! The transformer engine (spec.md §4.5): atomic value transformers, windowed
//! series transformers, and the `{target::op(lookback)}` expression language
//! used to compose them. Grounded on
//! `examples/original_source/src/actions/transform.py`'s `BASE_TRANSFORMERS`,
//! `SERIES_TRANSFORMERS`, and `apply_transformer`.
//!
//! The original resolves a transformer by `str.format`-substituting computed
//! values into the transformer text and handing the result to a restricted
//! `eval`. SPEC_FULL.md §3 resolves this into a parsed AST instead: each
//! transformer string is tokenized once into literals, field references, and
//! series calls, and the resulting arithmetic expression is evaluated by a
//! small recursive-descent evaluator rather than by evaluating arbitrary
//! source text.

use chrono::{DateTime, Duration as ChronoDuration, Months, Utc};
use thiserror::Error;

use crate::interval::Interval;
use crate::model::FieldValue;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("unknown transformer: {0}")]
    UnknownTransformer(String),
    #[error("malformed transformer expression: {0}")]
    Malformed(String),
    #[error("invalid lookback window: {0}")]
    InvalidLookback(String),
    #[error("unknown transformer target field: {0}")]
    UnknownTarget(String),
    #[error("transformer applied to incompatible value: {0}")]
    TypeMismatch(String),
    #[error("transformer timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("arithmetic error evaluating expression: {0}")]
    Arithmetic(String),
}

pub const TRANSFORMER_DEADLINE: std::time::Duration = std::time::Duration::from_secs(2);

/// Looks a value up by field name so expression tokens like `{other_field}`
/// can resolve against sibling fields already computed this tick, and
/// fetches a windowed series for `{target::op(lookback)}` tokens. Implemented
/// downstream by the ingestion runtime, which has both the in-flight tick
/// state and the TSDB adapter the series read goes through.
#[async_trait::async_trait]
pub trait TransformContext: Send + Sync {
    fn field_value(&self, name: &str) -> Option<&FieldValue>;

    async fn load_series(
        &self,
        target: &str,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FieldValue>, TransformError>;

    fn interval(&self) -> Interval;

    fn now(&self) -> DateTime<Utc>;
}

/// Applies an atomic (single-word) transformer to a value. Mirrors
/// `BASE_TRANSFORMERS` one-to-one.
pub fn apply_atomic(name: &str, value: &FieldValue) -> Result<FieldValue, TransformError> {
    use FieldValue::*;

    let as_str = || value.to_string();
    let as_f64 = |v: &FieldValue| v.as_f64().ok_or_else(|| TransformError::TypeMismatch(name.to_string()));

    let result = match name {
        "lower" => String(as_str().to_lowercase()),
        "upper" => String(as_str().to_uppercase()),
        "capitalize" => String(capitalize(&as_str())),
        "title" => String(title_case(&as_str())),
        "int" => Int(as_f64(value)? as i64),
        "float" => Float(as_f64(value)?),
        "str" => String(as_str()),
        "bool" => Bool(match value {
            Bool(b) => *b,
            Int(i) => *i != 0,
            Float(f) => *f != 0.0,
            String(s) => !s.is_empty(),
            _ => true,
        }),
        "to_json" => {
            let json = field_value_to_json(value);
            String(serde_json::to_string_pretty(&json).map_err(|e| TransformError::Malformed(e.to_string()))?)
        }
        "to_snake" => String(as_str().to_lowercase().split_whitespace().collect::<Vec<_>>().join("_")),
        "to_kebab" | "slugify" => String(as_str().to_lowercase().split_whitespace().collect::<Vec<_>>().join("-")),
        "to_camel" | "to_pascal" => String(as_str().split_whitespace().map(capitalize).collect::<Vec<_>>().join("")),
        "strip" => String(as_str().trim().to_string()),
        "shorten_address" => {
            let s = as_str();
            if s.chars().count() < 10 {
                String(s)
            } else {
                let head: String = s.chars().take(6).collect();
                let tail: String = s.chars().rev().take(4).collect::<String>().chars().rev().collect();
                String(format!("{head}...{tail}"))
            }
        }
        "remove_punctuation" => String(as_str().chars().filter(|c| !c.is_ascii_punctuation()).collect()),
        "reverse" => String(as_str().chars().rev().collect()),
        "bin" => String(format!("{:b}", as_f64(value)? as i64)),
        "hex" => String(format!("{:x}", as_f64(value)? as i64)),
        "sha256digest" => {
            use sha2::{Digest, Sha256};
            String(hex::encode(Sha256::digest(as_str().as_bytes())))
        }
        "md5digest" => {
            use md5::{Digest, Md5};
            String(hex::encode(Md5::digest(as_str().as_bytes())))
        }
        "round" => Int(as_f64(value)?.round() as i64),
        "round2" => Float(round_to(as_f64(value)?, 2)),
        "round4" => Float(round_to(as_f64(value)?, 4)),
        "round6" => Float(round_to(as_f64(value)?, 6)),
        "round8" => Float(round_to(as_f64(value)?, 8)),
        "round10" => Float(round_to(as_f64(value)?, 10)),
        other => return Err(TransformError::UnknownTransformer(other.to_string())),
    };
    Ok(result)
}

fn round_to(v: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (v * factor).round() / factor
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        None => String::new(),
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
    }
}

fn title_case(s: &str) -> String {
    s.split_whitespace().map(capitalize).collect::<Vec<_>>().join(" ")
}

fn field_value_to_json(value: &FieldValue) -> serde_json::Value {
    use serde_json::Value as J;
    match value {
        FieldValue::Int(i) => J::from(*i),
        FieldValue::UInt(u) => J::from(*u),
        FieldValue::Float(f) => J::from(*f),
        FieldValue::Bool(b) => J::from(*b),
        FieldValue::Timestamp(t) => J::from(t.to_rfc3339()),
        FieldValue::String(s) => J::from(s.clone()),
        FieldValue::Binary(b) => J::from(hex::encode(b)),
    }
}

/// Applies a series (windowed) transformer, matching `SERIES_TRANSFORMERS`.
/// `cumsum` is the one multi-valued series op (the rest reduce to a scalar);
/// callers that need a scalar should take the last element.
pub fn apply_series(name: &str, series: &[f64]) -> Result<Vec<f64>, TransformError> {
    if series.is_empty() {
        return Err(TransformError::Malformed(format!("{name}: empty series")));
    }
    let result = match name {
        "median" => vec![median(series)],
        "mean" => vec![series.iter().sum::<f64>() / series.len() as f64],
        "std" => vec![std_dev(series)],
        "var" => vec![variance(series)],
        "min" => vec![series.iter().cloned().fold(f64::INFINITY, f64::min)],
        "max" => vec![series.iter().cloned().fold(f64::NEG_INFINITY, f64::max)],
        "sum" => vec![series.iter().sum()],
        "prod" => vec![series.iter().product()],
        "cumsum" => {
            let mut acc = 0.0;
            series
                .iter()
                .map(|v| {
                    acc += v;
                    acc
                })
                .collect()
        }
        other => return Err(TransformError::UnknownTransformer(other.to_string())),
    };
    Ok(result)
}

fn mean(series: &[f64]) -> f64 {
    series.iter().sum::<f64>() / series.len() as f64
}

fn variance(series: &[f64]) -> f64 {
    let m = mean(series);
    series.iter().map(|v| (v - m).powi(2)).sum::<f64>() / series.len() as f64
}

fn std_dev(series: &[f64]) -> f64 {
    variance(series).sqrt()
}

fn median(series: &[f64]) -> f64 {
    let mut sorted: Vec<f64> = series.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// A lookback window like `D1`, `m10`, `h6` -- unit letter plus a count,
/// matching `interval_to_delta`'s `([smhDWMY])(\d+)` pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookback {
    pub unit: char,
    pub amount: i64,
}

impl Lookback {
    pub fn parse(s: &str) -> Result<Self, TransformError> {
        let mut chars = s.chars();
        let unit = chars.next().ok_or_else(|| TransformError::InvalidLookback(s.to_string()))?;
        let digits: String = chars.collect();
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(TransformError::InvalidLookback(s.to_string()));
        }
        if !"smhDWMY".contains(unit) {
            return Err(TransformError::InvalidLookback(s.to_string()));
        }
        let amount: i64 = digits.parse().map_err(|_| TransformError::InvalidLookback(s.to_string()))?;
        Ok(Self { unit, amount })
    }

    /// The `from` instant this lookback refers back to, relative to `now`.
    pub fn from_instant(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.unit {
            's' => now - ChronoDuration::seconds(self.amount),
            'm' => now - ChronoDuration::minutes(self.amount),
            'h' => now - ChronoDuration::hours(self.amount),
            'D' => now - ChronoDuration::days(self.amount),
            'W' => now - ChronoDuration::weeks(self.amount),
            'M' => now - Months::new(self.amount as u32),
            'Y' => now - Months::new(self.amount as u32 * 12),
            _ => now,
        }
    }
}

#[derive(Debug, Clone)]
enum Token {
    Literal(String),
    FieldRef(String),
    SeriesCall { target: String, op: String, lookback: String },
}

/// Tokenizes a transformer expression into literal text, `{field}`
/// references, and `{target::op(lookback)}` series calls.
fn tokenize(expr: &str) -> Result<Vec<Token>, TransformError> {
    let mut tokens = Vec::new();
    let mut rest = expr;
    while let Some(open) = rest.find('{') {
        if open > 0 {
            tokens.push(Token::Literal(rest[..open].to_string()));
        }
        let after_open = &rest[open + 1..];
        let close = after_open
            .find('}')
            .ok_or_else(|| TransformError::Malformed(expr.to_string()))?;
        let inner = &after_open[..close];

        if let Some(sep) = inner.find("::") {
            let target = inner[..sep].to_string();
            let after_sep = &inner[sep + 2..];
            let paren_open = after_sep
                .find('(')
                .ok_or_else(|| TransformError::Malformed(expr.to_string()))?;
            let paren_close = after_sep
                .find(')')
                .ok_or_else(|| TransformError::Malformed(expr.to_string()))?;
            let op = after_sep[..paren_open].to_string();
            let lookback = after_sep[paren_open + 1..paren_close].to_string();
            if target.is_empty() || op.is_empty() || lookback.is_empty() {
                return Err(TransformError::Malformed(expr.to_string()));
            }
            tokens.push(Token::SeriesCall { target, op, lookback });
        } else {
            tokens.push(Token::FieldRef(inner.to_string()));
        }

        rest = &after_open[close + 1..];
    }
    if !rest.is_empty() {
        tokens.push(Token::Literal(rest.to_string()));
    }
    Ok(tokens)
}

/// True for a single-word transformer name with no injected variables, i.e.
/// an atomic transformer rather than an expression.
fn is_atomic_name(expr: &str) -> bool {
    !expr.is_empty() && !expr.chars().any(|c| c.is_whitespace() || c == '{' || c == '}')
}

/// Resolves one transformer string against `field` (the field currently
/// being transformed) and `ctx` (sibling field values + series access), then
/// applies it. Matches `apply_transformer`'s three cases: bare atomic name,
/// a series-windowed expression, or a self/sibling substitution, evaluated
/// here as arithmetic over the substituted values instead of through `eval`.
pub async fn apply_transformer(
    expr: &str,
    field_value: &FieldValue,
    ctx: &dyn TransformContext,
) -> Result<FieldValue, TransformError> {
    if expr.is_empty() {
        return Ok(field_value.clone());
    }
    if is_atomic_name(expr) {
        return apply_atomic(expr, field_value);
    }

    let tokens = tokenize(expr)?;
    let mut rendered = String::new();
    for token in &tokens {
        match token {
            Token::Literal(s) => rendered.push_str(s),
            Token::FieldRef(name) => {
                let value = if name == "self" {
                    field_value.clone()
                } else {
                    ctx.field_value(name)
                        .cloned()
                        .ok_or_else(|| TransformError::UnknownTarget(name.clone()))?
                };
                rendered.push_str(&value.to_string());
            }
            Token::SeriesCall { target, op, lookback } => {
                let lb = Lookback::parse(lookback)?;
                let now = ctx.now();
                let from = lb.from_instant(now);
                let series = ctx.load_series(target, ctx.interval(), from, now).await?;
                let numeric: Vec<f64> = series
                    .iter()
                    .map(|v| v.as_f64().ok_or_else(|| TransformError::TypeMismatch(target.clone())))
                    .collect::<Result<_, _>>()?;
                let reduced = apply_series(op, &numeric)?;
                let scalar = reduced.last().copied().unwrap_or_default();
                rendered.push_str(&format_f64(scalar));
            }
        }
    }

    eval_arithmetic(&rendered).map(FieldValue::Float)
}

fn format_f64(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// Minimal recursive-descent evaluator over `+ - * / ( )` and float
/// literals -- the arithmetic surface `safe_eval` restricted expressions to
/// in practice once the substitutions above have been made.
fn eval_arithmetic(src: &str) -> Result<f64, TransformError> {
    let tokens: Vec<char> = src.chars().filter(|c| !c.is_whitespace()).collect();
    let mut pos = 0usize;
    let value = parse_expr(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(TransformError::Arithmetic(src.to_string()));
    }
    Ok(value)
}

fn parse_expr(tokens: &[char], pos: &mut usize) -> Result<f64, TransformError> {
    let mut value = parse_term(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some('+') => {
                *pos += 1;
                value += parse_term(tokens, pos)?;
            }
            Some('-') => {
                *pos += 1;
                value -= parse_term(tokens, pos)?;
            }
            _ => break,
        }
    }
    Ok(value)
}

fn parse_term(tokens: &[char], pos: &mut usize) -> Result<f64, TransformError> {
    let mut value = parse_factor(tokens, pos)?;
    loop {
        match tokens.get(*pos) {
            Some('*') => {
                *pos += 1;
                value *= parse_factor(tokens, pos)?;
            }
            Some('/') => {
                *pos += 1;
                let divisor = parse_factor(tokens, pos)?;
                if divisor == 0.0 {
                    return Err(TransformError::Arithmetic("division by zero".to_string()));
                }
                value /= divisor;
            }
            _ => break,
        }
    }
    Ok(value)
}

fn parse_factor(tokens: &[char], pos: &mut usize) -> Result<f64, TransformError> {
    match tokens.get(*pos) {
        Some('-') => {
            *pos += 1;
            Ok(-parse_factor(tokens, pos)?)
        }
        Some('(') => {
            *pos += 1;
            let value = parse_expr(tokens, pos)?;
            match tokens.get(*pos) {
                Some(')') => {
                    *pos += 1;
                    Ok(value)
                }
                _ => Err(TransformError::Arithmetic("unbalanced parentheses".to_string())),
            }
        }
        _ => {
            let start = *pos;
            while matches!(tokens.get(*pos), Some(c) if c.is_ascii_digit() || *c == '.') {
                *pos += 1;
            }
            if *pos == start {
                return Err(TransformError::Arithmetic(format!(
                    "unexpected token at {}",
                    start
                )));
            }
            let literal: String = tokens[start..*pos].iter().collect();
            literal.parse().map_err(|_| TransformError::Arithmetic(literal))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopContext;

    #[async_trait::async_trait]
    impl TransformContext for NoopContext {
        fn field_value(&self, _name: &str) -> Option<&FieldValue> {
            None
        }
        async fn load_series(
            &self,
            _target: &str,
            _interval: Interval,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> Result<Vec<FieldValue>, TransformError> {
            Ok(vec![])
        }
        fn interval(&self) -> Interval {
            Interval::M5
        }
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    #[test]
    fn shorten_address_matches_head_and_tail() {
        let v = FieldValue::String("0xABCDEF1234567890".to_string());
        let out = apply_atomic("shorten_address", &v).unwrap();
        assert_eq!(out, FieldValue::String("0xABCD...7890".to_string()));
    }

    #[test]
    fn sha256digest_is_lowercase_hex() {
        let v = FieldValue::String("hello".to_string());
        let out = apply_atomic("sha256digest", &v).unwrap();
        match out {
            FieldValue::String(s) => {
                assert_eq!(s.len(), 64);
                assert_eq!(s, s.to_lowercase());
            }
            _ => panic!("expected string"),
        }
    }

    #[test]
    fn round2_rounds_to_two_decimals() {
        let v = FieldValue::Float(3.14159);
        let out = apply_atomic("round2", &v).unwrap();
        assert_eq!(out, FieldValue::Float(3.14));
    }

    #[test]
    fn unknown_transformer_is_rejected() {
        let v = FieldValue::Int(1);
        assert!(apply_atomic("nope", &v).is_err());
    }

    #[test]
    fn lookback_parses_unit_and_amount() {
        let lb = Lookback::parse("D1").unwrap();
        assert_eq!(lb.unit, 'D');
        assert_eq!(lb.amount, 1);
        assert!(Lookback::parse("").is_err());
        assert!(Lookback::parse("Q5").is_err());
    }

    #[test]
    fn series_mean_and_cumsum() {
        let data = vec![1.0, 2.0, 3.0];
        assert_eq!(apply_series("mean", &data).unwrap(), vec![2.0]);
        assert_eq!(apply_series("cumsum", &data).unwrap(), vec![1.0, 3.0, 6.0]);
    }

    #[tokio::test]
    async fn atomic_expression_roundtrips() {
        let ctx = NoopContext;
        let v = FieldValue::String("Hello World".to_string());
        let out = apply_transformer("upper", &v, &ctx).await.unwrap();
        assert_eq!(out, FieldValue::String("HELLO WORLD".to_string()));
    }

    #[tokio::test]
    async fn self_reference_arithmetic_expression() {
        let ctx = NoopContext;
        let v = FieldValue::Int(4);
        let out = apply_transformer("{self}*2", &v, &ctx).await.unwrap();
        assert_eq!(out, FieldValue::Float(8.0));
    }

    use proptest::prelude::*;

    /// Atomic transformers whose domain is any string (no numeric coercion),
    /// used by the purity property below.
    const STRING_DOMAIN_TRANSFORMERS: &[&str] = &[
        "lower",
        "upper",
        "capitalize",
        "title",
        "str",
        "bool",
        "to_json",
        "to_snake",
        "to_kebab",
        "slugify",
        "to_camel",
        "to_pascal",
        "strip",
        "shorten_address",
        "remove_punctuation",
        "reverse",
        "sha256digest",
        "md5digest",
    ];

    proptest! {
        /// Calling the same atomic transformer twice on the same value always
        /// yields the same result (spec.md §8 "transformer purity"): none of
        /// these reach outside the function for hidden state.
        #[test]
        fn atomic_transformer_is_pure(s in ".*", name_idx in 0usize..STRING_DOMAIN_TRANSFORMERS.len()) {
            let name = STRING_DOMAIN_TRANSFORMERS[name_idx];
            let v = FieldValue::String(s);
            let first = apply_atomic(name, &v);
            let second = apply_atomic(name, &v);
            prop_assert_eq!(first.is_ok(), second.is_ok());
            if let (Ok(a), Ok(b)) = (first, second) {
                prop_assert_eq!(a, b);
            }
        }

        /// `round_to`-backed transformers never panic on finite floats and
        /// are deterministic.
        #[test]
        fn round_transformer_is_pure_over_finite_floats(f in -1.0e9f64..1.0e9f64) {
            let v = FieldValue::Float(f);
            let a = apply_atomic("round4", &v).unwrap();
            let b = apply_atomic("round4", &v).unwrap();
            prop_assert_eq!(a, b);
        }

        /// Series reducers are pure and never panic over a non-empty finite
        /// series.
        #[test]
        fn series_transformer_is_pure(values in proptest::collection::vec(-1.0e6f64..1.0e6f64, 1..32)) {
            for name in ["median", "mean", "std", "var", "min", "max", "sum", "prod", "cumsum"] {
                let a = apply_series(name, &values).unwrap();
                let b = apply_series(name, &values).unwrap();
                prop_assert_eq!(a, b);
            }
        }
    }
}
