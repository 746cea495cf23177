//! Condition-expression evaluation for exclusive/inclusive gateways.
//! Conditions are compiled into bytecode comparison opcodes elsewhere in
//! this codebase; since this core interprets the graph directly there is no
//! bytecode stage, so conditions are small hand-parsed comparisons evaluated
//! straight against a token's variables, matching the preference for
//! compact hand-rolled grammars over a general expression-language
//! dependency seen elsewhere in this crate (see `timerspec::TimerSpec::parse`).

use serde_json::Value as Json;

use crate::vars::Variables;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ExprError {
    #[error("malformed condition expression: {0}")]
    Malformed(String),
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Evaluates a condition of the shape `<variable> <op> <literal>`, e.g.
/// `amount > 1000`, `status == "APPROVED"`, `flag == true`. Missing
/// variables evaluate to `false` rather than erroring, so an exclusive
/// gateway silently falls through to its default flow instead of faulting.
pub fn evaluate(condition: &str, variables: &Variables) -> Result<bool, ExprError> {
    let condition = condition.trim();
    if condition.is_empty() {
        return Err(ExprError::Malformed("empty condition".into()));
    }
    let (lhs, op, rhs) = split_operator(condition)?;
    let lhs_value = match variables.get(lhs.trim()) {
        Some(v) => v.clone(),
        None => return Ok(false),
    };
    let rhs_value = parse_literal(rhs.trim());
    compare(&lhs_value, op, &rhs_value)
}

fn split_operator(condition: &str) -> Result<(&str, Op, &str), ExprError> {
    const OPERATORS: [(&str, Op); 6] = [
        ("==", Op::Eq),
        ("!=", Op::Ne),
        (">=", Op::Ge),
        ("<=", Op::Le),
        (">", Op::Gt),
        ("<", Op::Lt),
    ];
    for (token, op) in OPERATORS {
        if let Some(idx) = condition.find(token) {
            return Ok((&condition[..idx], op, &condition[idx + token.len()..]));
        }
    }
    Err(ExprError::Malformed(condition.to_string()))
}

/// Parses a bare literal (string/number/bool/null) for script-task
/// assignment, without a comparison operator.
pub fn evaluate_literal(raw: &str) -> Result<Json, ExprError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ExprError::Malformed("empty literal".into()));
    }
    Ok(parse_literal(raw))
}

fn parse_literal(raw: &str) -> Json {
    if let Some(stripped) = raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Json::String(stripped.to_string());
    }
    match raw {
        "true" => Json::Bool(true),
        "false" => Json::Bool(false),
        "null" => Json::Null,
        _ => raw
            .parse::<f64>()
            .ok()
            .and_then(|n| serde_json::Number::from_f64(n).map(Json::Number))
            .unwrap_or_else(|| Json::String(raw.to_string())),
    }
}

fn compare(lhs: &Json, op: Op, rhs: &Json) -> Result<bool, ExprError> {
    if matches!(op, Op::Eq | Op::Ne) {
        let eq = lhs == rhs;
        return Ok(if op == Op::Eq { eq } else { !eq });
    }
    let (l, r) = match (lhs.as_f64(), rhs.as_f64()) {
        (Some(l), Some(r)) => (l, r),
        _ => return Err(ExprError::UnsupportedOperator(format!("{op:?} on non-numeric operands"))),
    };
    Ok(match op {
        Op::Gt => l > r,
        Op::Ge => l >= r,
        Op::Lt => l < r,
        Op::Le => l <= r,
        Op::Eq | Op::Ne => unreachable!(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars_with(key: &str, value: Json) -> Variables {
        let mut v = Variables::new();
        v.set(key, value);
        v
    }

    #[test]
    fn evaluates_numeric_comparison() {
        let vars = vars_with("amount", json!(1500));
        assert!(evaluate("amount > 1000", &vars).unwrap());
        assert!(!evaluate("amount < 1000", &vars).unwrap());
    }

    #[test]
    fn evaluates_string_equality() {
        let vars = vars_with("status", json!("APPROVED"));
        assert!(evaluate(r#"status == "APPROVED""#, &vars).unwrap());
        assert!(evaluate(r#"status != "REJECTED""#, &vars).unwrap());
    }

    #[test]
    fn missing_variable_evaluates_false_not_error() {
        let vars = Variables::new();
        assert_eq!(evaluate("amount > 1000", &vars).unwrap(), false);
    }

    #[test]
    fn malformed_condition_errors() {
        assert!(evaluate("garbage-no-operator", &Variables::new()).is_err());
    }
}
