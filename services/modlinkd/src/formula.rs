//! Formula sandbox
//!
//! Formulas are evalexpr expressions over the decoded raw value `x`.
//! `sf(address)` returns the latest scale factor decoded from `address` on
//! the same device. The context is immutable during evaluation, so
//! assignments fail and no host state is reachable.

use std::collections::HashMap;
use std::sync::Arc;

use evalexpr::{
    ContextWithMutableFunctions, ContextWithMutableVariables, EvalexprError, Function,
    HashMapContext, Node, Value,
};

use crate::error::{LinkError, Result};

/// Latest scale-factor values of one device, keyed by register address
pub type ScaleFactorTable = HashMap<u16, f64>;

/// A parsed formula, ready to evaluate many times
#[derive(Debug, Clone)]
pub struct Formula {
    source: String,
    tree: Node,
}

fn to_f64(value: &Value) -> std::result::Result<f64, EvalexprError> {
    match value {
        Value::Float(f) => Ok(*f),
        Value::Int(i) => Ok(*i as f64),
        Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        _ => Err(EvalexprError::expected_number(value.clone())),
    }
}

/// Register address passed to `sf()`
fn to_address(value: &Value) -> std::result::Result<u16, EvalexprError> {
    let n = to_f64(value)?;
    if n.fract() != 0.0 || !(0.0..=f64::from(u16::MAX)).contains(&n) {
        return Err(EvalexprError::CustomMessage(format!(
            "sf() expects a register address, got {}",
            value
        )));
    }
    Ok(n as u16)
}

fn context(
    x: f64,
    scale_factors: &Arc<ScaleFactorTable>,
) -> std::result::Result<HashMapContext, EvalexprError> {
    let mut context = HashMapContext::new();
    context.set_value("x".to_string(), Value::Float(x))?;
    let table = Arc::clone(scale_factors);
    context.set_function(
        "sf".to_string(),
        Function::new(move |arg| {
            let address = to_address(arg)?;
            table.get(&address).copied().map(Value::Float).ok_or_else(|| {
                EvalexprError::CustomMessage(format!("no scale factor at address {}", address))
            })
        }),
    )?;
    Ok(context)
}

impl Formula {
    /// Parse `source` and dry-run it once. An expression that only fails
    /// for missing data (an absent scale factor, a non-numeric result,
    /// an assignment) compiles; a dangling operator or an unknown name
    /// does not.
    pub fn compile(source: &str) -> Result<Self> {
        let tree = evalexpr::build_operator_tree(source)
            .map_err(|e| LinkError::formula(source, e))?;
        let empty = Arc::new(ScaleFactorTable::new());
        let trial = context(0.0, &empty).and_then(|ctx| tree.eval_with_context(&ctx));
        if let Err(
            e @ (EvalexprError::WrongOperatorArgumentAmount { .. }
            | EvalexprError::WrongFunctionArgumentAmount { .. }
            | EvalexprError::VariableIdentifierNotFound(_)
            | EvalexprError::FunctionIdentifierNotFound(_)),
        ) = trial
        {
            return Err(LinkError::formula(source, e));
        }
        Ok(Self {
            source: source.to_string(),
            tree,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate with raw value `x` and the device's scale factors
    pub fn eval(&self, x: f64, scale_factors: &Arc<ScaleFactorTable>) -> Result<f64> {
        let result = context(x, scale_factors)
            .and_then(|ctx| self.tree.eval_with_context(&ctx))
            .map_err(|e| LinkError::formula(&self.source, e))?;
        let value = to_f64(&result).map_err(|e| LinkError::formula(&self.source, e))?;
        if !value.is_finite() {
            return Err(LinkError::formula(&self.source, "result is not finite"));
        }
        Ok(value)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic() {
        let f = Formula::compile("x * 0.1 + 5").unwrap();
        assert!((f.eval(100.0, &Arc::default()).unwrap() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_scale_factor_lookup() {
        let f = Formula::compile("x / sf(40010)").unwrap();
        let mut table = ScaleFactorTable::new();
        table.insert(40010, 100.0);
        assert!((f.eval(1234.0, &Arc::new(table)).unwrap() - 12.34).abs() < 1e-9);
    }

    #[test]
    fn test_missing_scale_factor_fails() {
        let f = Formula::compile("x * sf(7)").unwrap();
        assert!(matches!(
            f.eval(1.0, &Arc::default()),
            Err(LinkError::Formula { .. })
        ));
    }

    #[test]
    fn test_syntax_error_at_compile() {
        assert!(Formula::compile("x * (2").is_err());
    }

    #[test]
    fn test_incomplete_expression_at_compile() {
        for source in ["x *", "y * 2", "foo(x)"] {
            assert!(
                matches!(Formula::compile(source), Err(LinkError::Formula { .. })),
                "{} compiled",
                source
            );
        }
        assert!(Formula::compile("x * sf(3) + 1").is_ok());
    }

    #[test]
    fn test_bad_scale_factor_address_rejected() {
        let mut table = ScaleFactorTable::new();
        table.insert(0, 2.0);
        table.insert(u16::MAX, 2.0);
        let table = Arc::new(table);
        for source in ["x * sf(-1)", "x * sf(65536)", "x * sf(1.5)"] {
            let f = Formula::compile(source).unwrap();
            assert!(f.eval(1.0, &table).is_err(), "{} evaluated", source);
        }
        let f = Formula::compile("x * sf(65535)").unwrap();
        assert_eq!(f.eval(3.0, &table).unwrap(), 6.0);
    }

    #[test]
    fn test_assignment_rejected() {
        let f = Formula::compile("x = 5").unwrap();
        assert!(f.eval(1.0, &Arc::default()).is_err());
    }

    #[test]
    fn test_non_numeric_result_rejected() {
        let f = Formula::compile("\"text\"").unwrap();
        assert!(f.eval(1.0, &Arc::default()).is_err());
    }
}
