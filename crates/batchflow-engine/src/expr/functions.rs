//! The closed function table available to expressions.
//!
//! Anything outside this whitelist is rejected at evaluation time. The
//! table covers math, string, date, logic, and conversion helpers — no
//! I/O, no host access.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use super::ExprError;

/// Invoke a whitelisted function.
///
/// # Errors
///
/// [`ExprError::UnknownFunction`] for names outside the table,
/// [`ExprError::Eval`] for arity or argument-type violations.
pub fn call(name: &str, args: &[Value]) -> Result<Value, ExprError> {
    match name {
        // math
        "abs" => unary_number(name, args, f64::abs),
        "floor" => unary_number(name, args, f64::floor),
        "ceil" => unary_number(name, args, f64::ceil),
        "round" => unary_number(name, args, f64::round),
        "min" => fold_numbers(name, args, f64::min),
        "max" => fold_numbers(name, args, f64::max),

        // string
        "upper" => unary_string(name, args, |s| s.to_uppercase()),
        "lower" => unary_string(name, args, |s| s.to_lowercase()),
        "trim" => unary_string(name, args, |s| s.trim().to_string()),
        "length" => {
            let [arg] = expect_arity::<1>(name, args)?;
            let len = match arg {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                other => {
                    return Err(eval_error(format!(
                        "length() expects a string or array, got {other}"
                    )))
                }
            };
            Ok(number(len as f64))
        }
        "concat" => {
            let mut out = String::new();
            for arg in args {
                out.push_str(&stringify(arg));
            }
            Ok(Value::String(out))
        }
        "substring" => {
            if args.len() != 2 && args.len() != 3 {
                return Err(arity_error(name, "2 or 3", args.len()));
            }
            let text = as_string(name, &args[0])?;
            let start = as_index(name, &args[1])?;
            let chars: Vec<char> = text.chars().collect();
            let start = start.min(chars.len());
            let end = match args.get(2) {
                Some(len_arg) => (start + as_index(name, len_arg)?).min(chars.len()),
                None => chars.len(),
            };
            Ok(Value::String(chars[start..end].iter().collect()))
        }
        "contains" => binary_string(name, args, |s, t| s.contains(t)),
        "starts_with" => binary_string(name, args, |s, t| s.starts_with(t)),
        "ends_with" => binary_string(name, args, |s, t| s.ends_with(t)),
        "replace" => {
            let [text, from, to] = expect_arity::<3>(name, args)?;
            let text = as_string(name, text)?;
            let from = as_string(name, from)?;
            let to = as_string(name, to)?;
            Ok(Value::String(text.replace(from, to)))
        }

        // date
        "now" => {
            expect_arity::<0>(name, args)?;
            Ok(Value::String(Utc::now().to_rfc3339()))
        }
        "parse_date" => {
            let [text, fmt] = expect_arity::<2>(name, args)?;
            let text = as_string(name, text)?;
            let fmt = as_string(name, fmt)?;
            let parsed = NaiveDateTime::parse_from_str(text, fmt)
                .map_err(|e| eval_error(format!("parse_date('{text}', '{fmt}'): {e}")))?;
            Ok(Value::String(parsed.and_utc().to_rfc3339()))
        }
        "format_date" => {
            let [text, fmt] = expect_arity::<2>(name, args)?;
            let text = as_string(name, text)?;
            let fmt = as_string(name, fmt)?;
            let parsed = DateTime::parse_from_rfc3339(text)
                .map_err(|e| eval_error(format!("format_date('{text}'): {e}")))?;
            Ok(Value::String(parsed.format(fmt).to_string()))
        }

        // logic
        "if" => {
            let [cond, then, otherwise] = expect_arity::<3>(name, args)?;
            Ok(if super::truthy(cond) {
                then.clone()
            } else {
                otherwise.clone()
            })
        }
        "coalesce" => Ok(args
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null)),

        // conversion
        "to_number" => {
            let [arg] = expect_arity::<1>(name, args)?;
            match arg {
                Value::Number(n) => Ok(Value::Number(n.clone())),
                Value::Bool(b) => Ok(number(if *b { 1.0 } else { 0.0 })),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(number)
                    .map_err(|_| eval_error(format!("to_number('{s}'): not a number"))),
                other => Err(eval_error(format!("to_number({other}): unsupported"))),
            }
        }
        "to_string" => {
            let [arg] = expect_arity::<1>(name, args)?;
            Ok(Value::String(stringify(arg)))
        }
        "to_bool" => {
            let [arg] = expect_arity::<1>(name, args)?;
            Ok(Value::Bool(super::truthy(arg)))
        }

        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

fn eval_error(message: String) -> ExprError {
    ExprError::Eval(message)
}

fn arity_error(name: &str, expected: &str, got: usize) -> ExprError {
    eval_error(format!("{name}() expects {expected} argument(s), got {got}"))
}

fn expect_arity<'a, const N: usize>(name: &str, args: &'a [Value]) -> Result<&'a [Value; N], ExprError> {
    args.try_into()
        .map_err(|_| arity_error(name, &N.to_string(), args.len()))
}

fn as_number(name: &str, value: &Value) -> Result<f64, ExprError> {
    value
        .as_f64()
        .ok_or_else(|| eval_error(format!("{name}() expects a number, got {value}")))
}

fn as_string<'a>(name: &str, value: &'a Value) -> Result<&'a str, ExprError> {
    value
        .as_str()
        .ok_or_else(|| eval_error(format!("{name}() expects a string, got {value}")))
}

fn as_index(name: &str, value: &Value) -> Result<usize, ExprError> {
    let n = as_number(name, value)?;
    if n < 0.0 {
        return Err(eval_error(format!("{name}() index must be >= 0")));
    }
    Ok(n as usize)
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
}

fn unary_number(name: &str, args: &[Value], f: fn(f64) -> f64) -> Result<Value, ExprError> {
    let [arg] = expect_arity::<1>(name, args)?;
    Ok(number(f(as_number(name, arg)?)))
}

fn fold_numbers(name: &str, args: &[Value], f: fn(f64, f64) -> f64) -> Result<Value, ExprError> {
    if args.is_empty() {
        return Err(arity_error(name, "at least 1", 0));
    }
    let mut acc = as_number(name, &args[0])?;
    for arg in &args[1..] {
        acc = f(acc, as_number(name, arg)?);
    }
    Ok(number(acc))
}

fn unary_string(
    name: &str,
    args: &[Value],
    f: impl Fn(&str) -> String,
) -> Result<Value, ExprError> {
    let [arg] = expect_arity::<1>(name, args)?;
    Ok(Value::String(f(as_string(name, arg)?)))
}

fn binary_string(
    name: &str,
    args: &[Value],
    f: impl Fn(&str, &str) -> bool,
) -> Result<Value, ExprError> {
    let [lhs, rhs] = expect_arity::<2>(name, args)?;
    Ok(Value::Bool(f(as_string(name, lhs)?, as_string(name, rhs)?)))
}

/// Render a value the way string functions see it.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn math_functions() {
        assert_eq!(call("abs", &[json!(-3.5)]).unwrap(), json!(3.5));
        assert_eq!(call("round", &[json!(2.5)]).unwrap(), json!(3.0));
        assert_eq!(call("min", &[json!(4), json!(2), json!(9)]).unwrap(), json!(2.0));
        assert_eq!(call("max", &[json!(4), json!(9)]).unwrap(), json!(9.0));
    }

    #[test]
    fn string_functions() {
        assert_eq!(call("upper", &[json!("abc")]).unwrap(), json!("ABC"));
        assert_eq!(call("trim", &[json!("  x ")]).unwrap(), json!("x"));
        assert_eq!(
            call("concat", &[json!("a"), json!(1), json!(null)]).unwrap(),
            json!("a1")
        );
        assert_eq!(
            call("substring", &[json!("hello"), json!(1), json!(3)]).unwrap(),
            json!("ell")
        );
        assert_eq!(
            call("replace", &[json!("a-b"), json!("-"), json!("_")]).unwrap(),
            json!("a_b")
        );
        assert_eq!(
            call("starts_with", &[json!("order-1"), json!("order")]).unwrap(),
            json!(true)
        );
        assert_eq!(call("length", &[json!([1, 2, 3])]).unwrap(), json!(3.0));
    }

    #[test]
    fn logic_and_conversion() {
        assert_eq!(
            call("if", &[json!(true), json!("a"), json!("b")]).unwrap(),
            json!("a")
        );
        assert_eq!(
            call("coalesce", &[json!(null), json!(null), json!(7)]).unwrap(),
            json!(7)
        );
        assert_eq!(call("to_number", &[json!(" 42 ")]).unwrap(), json!(42.0));
        assert_eq!(call("to_string", &[json!(5)]).unwrap(), json!("5"));
        assert_eq!(call("to_bool", &[json!("")]).unwrap(), json!(false));
    }

    #[test]
    fn date_functions() {
        let formatted = call(
            "format_date",
            &[json!("2025-06-01T08:30:00+00:00"), json!("%Y-%m-%d")],
        )
        .unwrap();
        assert_eq!(formatted, json!("2025-06-01"));

        let parsed = call(
            "parse_date",
            &[json!("2025-06-01 08:30:00"), json!("%Y-%m-%d %H:%M:%S")],
        )
        .unwrap();
        assert!(parsed.as_str().unwrap().starts_with("2025-06-01T08:30:00"));
    }

    #[test]
    fn whitelist_is_closed() {
        assert!(matches!(
            call("system", &[]),
            Err(ExprError::UnknownFunction(_))
        ));
        assert!(matches!(call("eval", &[]), Err(ExprError::UnknownFunction(_))));
    }

    #[test]
    fn arity_violations() {
        assert!(call("abs", &[]).is_err());
        assert!(call("substring", &[json!("x")]).is_err());
        assert!(call("now", &[json!(1)]).is_err());
    }
}
