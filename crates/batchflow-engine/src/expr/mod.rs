//! Sandboxed expression evaluation for formulas, filters, and conditions.
//!
//! Expressions like `price * 1.2` or `upper(name) == 'ACME'` are parsed
//! into an AST and evaluated against a record — never delegated to any
//! host-language eval. Functions come from a closed, documented table;
//! anything outside the whitelist is rejected.

mod functions;
mod parser;
mod token;

pub use parser::{BinaryOp, Expr, UnaryOp};

use serde_json::Value;

use batchflow_types::record::Record;

/// Expression failure: lexing, parsing, or evaluation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("lex error at {position}: {message}")]
    Lex { position: usize, message: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("eval error: {0}")]
    Eval(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
}

/// Parse an expression source string into an AST.
///
/// # Errors
///
/// Returns an [`ExprError`] if the source fails to lex or parse.
pub fn parse(source: &str) -> Result<Expr, ExprError> {
    let tokens = token::tokenize(source)?;
    parser::parse(&tokens)
}

/// Evaluate a parsed expression against a record.
///
/// Bare identifiers resolve into the record by dotted path; the reserved
/// `vars` root resolves into the pipeline variables. Missing fields
/// evaluate to `null` rather than erroring, so conditions can probe
/// optional fields.
///
/// # Errors
///
/// Returns an [`ExprError`] on type mismatches, division by zero, or
/// calls outside the function whitelist.
pub fn evaluate(
    expr: &Expr,
    record: &Record,
    variables: Option<&serde_json::Map<String, Value>>,
) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Field(path) => Ok(resolve_field(path, record, variables)),
        Expr::Unary(op, inner) => {
            let value = evaluate(inner, record, variables)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                UnaryOp::Neg => {
                    let n = value
                        .as_f64()
                        .ok_or_else(|| ExprError::Eval(format!("cannot negate {value}")))?;
                    Ok(number(-n))
                }
            }
        }
        Expr::Binary(op, lhs, rhs) => evaluate_binary(*op, lhs, rhs, record, variables),
        Expr::Call(name, args) => {
            let values = args
                .iter()
                .map(|arg| evaluate(arg, record, variables))
                .collect::<Result<Vec<_>, _>>()?;
            functions::call(name, &values)
        }
    }
}

/// Truthiness used by conditions: `null` and `false` are false, zero and
/// the empty string are false, everything else is true.
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn evaluate_binary(
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    record: &Record,
    variables: Option<&serde_json::Map<String, Value>>,
) -> Result<Value, ExprError> {
    // Short-circuit logic first.
    if matches!(op, BinaryOp::And | BinaryOp::Or) {
        let left = truthy(&evaluate(lhs, record, variables)?);
        return match (op, left) {
            (BinaryOp::And, false) => Ok(Value::Bool(false)),
            (BinaryOp::Or, true) => Ok(Value::Bool(true)),
            _ => Ok(Value::Bool(truthy(&evaluate(rhs, record, variables)?))),
        };
    }

    let left = evaluate(lhs, record, variables)?;
    let right = evaluate(rhs, record, variables)?;

    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let (a, b) = numeric_pair(op, &left, &right)?;
            if b == 0.0 && matches!(op, BinaryOp::Div | BinaryOp::Rem) {
                return Err(ExprError::Eval("division by zero".into()));
            }
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Rem => a % b,
                _ => unreachable!(),
            };
            Ok(number(result))
        }
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(&left, &right))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(&left, &right))),
        BinaryOp::Lt | BinaryOp::Lte | BinaryOp::Gt | BinaryOp::Gte => {
            let ordering = compare(&left, &right).ok_or_else(|| {
                ExprError::Eval(format!("cannot compare {left} with {right}"))
            })?;
            let result = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Lte => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::Gte => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn numeric_pair(op: BinaryOp, left: &Value, right: &Value) -> Result<(f64, f64), ExprError> {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(ExprError::Eval(format!(
            "{op:?} expects numbers, got {left} and {right}"
        ))),
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        // Numbers compare numerically so 1 == 1.0.
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => {
            let (a, b) = (left.as_f64()?, right.as_f64()?);
            a.partial_cmp(&b)
        }
    }
}

fn resolve_field(
    path: &[String],
    record: &Record,
    variables: Option<&serde_json::Map<String, Value>>,
) -> Value {
    // `vars.*` reaches pipeline variables; anything else reads the record.
    if path.first().map(String::as_str) == Some("vars") {
        let Some(vars) = variables else {
            return Value::Null;
        };
        return lookup(&Value::Object(vars.clone()), &path[1..]);
    }
    lookup(record, path)
}

fn lookup(root: &Value, path: &[String]) -> Value {
    let mut current = root;
    for segment in path {
        match current.as_object().and_then(|map| map.get(segment)) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval_str(source: &str, record: &Value) -> Result<Value, ExprError> {
        evaluate(&parse(source)?, record, None)
    }

    #[test]
    fn arithmetic_over_record_fields() {
        let record = json!({"price": 10.0, "qty": 3});
        assert_eq!(eval_str("price * 1.2", &record).unwrap(), json!(12.0));
        assert_eq!(eval_str("price * qty + 1", &record).unwrap(), json!(31.0));
    }

    #[test]
    fn conditions_and_short_circuit() {
        let record = json!({"status": "open", "qty": 0});
        assert_eq!(
            eval_str("status == 'open' && qty < 5", &record).unwrap(),
            json!(true)
        );
        // Rhs would error (string arithmetic) but is never evaluated.
        assert_eq!(
            eval_str("false && (status + 1) > 0", &record).unwrap(),
            json!(false)
        );
    }

    #[test]
    fn missing_fields_are_null_not_errors() {
        let record = json!({"a": 1});
        assert_eq!(eval_str("missing", &record).unwrap(), json!(null));
        assert_eq!(eval_str("missing == null", &record).unwrap(), json!(true));
        assert_eq!(eval_str("!missing", &record).unwrap(), json!(true));
    }

    #[test]
    fn variables_resolve_under_vars_root() {
        let record = json!({"region": "us"});
        let mut vars = serde_json::Map::new();
        vars.insert("region".into(), json!("eu"));
        let expr = parse("vars.region == 'eu' && region == 'us'").unwrap();
        assert_eq!(evaluate(&expr, &record, Some(&vars)).unwrap(), json!(true));
    }

    #[test]
    fn function_calls_whitelisted_only() {
        let record = json!({"name": "acme"});
        assert_eq!(eval_str("upper(name)", &record).unwrap(), json!("ACME"));
        assert!(matches!(
            eval_str("exec('rm')", &record),
            Err(ExprError::UnknownFunction(_))
        ));
    }

    #[test]
    fn division_by_zero_errors() {
        let record = json!({"n": 0});
        assert!(eval_str("1 / n", &record).is_err());
        assert!(eval_str("1 % n", &record).is_err());
    }

    #[test]
    fn loose_numeric_equality() {
        let record = json!({"a": 1, "b": 1.0});
        assert_eq!(eval_str("a == b", &record).unwrap(), json!(true));
        assert_eq!(eval_str("'1' == 1", &record).unwrap(), json!(false));
    }

    #[test]
    fn string_comparison_is_lexicographic() {
        let record = json!({"a": "apple", "b": "banana"});
        assert_eq!(eval_str("a < b", &record).unwrap(), json!(true));
    }

    #[test]
    fn unary_negation() {
        let record = json!({"n": 5});
        assert_eq!(eval_str("-n + 1", &record).unwrap(), json!(-4.0));
    }
}
