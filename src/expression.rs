//! Formula-tied parameter expressions.
//!
//! [`FitParameter::Formula`](crate::fit_parameter::FitParameter::Formula)
//! values are small arithmetic expressions referencing other declared
//! parameters by name (optionally indexed, `name[#k]`), evaluated on
//! every unpack pass (spec §3, §4.2). This module provides the grammar
//! (`expression.pest`) and a tree-walking evaluator behind a small
//! `Expression` trait, so the rest of the crate depends only on
//! "given a variable lookup, produce a value" rather than on `pest`
//! directly — consistent with §9's guidance to treat formula
//! evaluation as an injected dependency.

use std::collections::HashMap;

use pest::iterators::Pairs;
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser;

use crate::errors::FitError;

#[derive(Parser)]
#[grammar = "expression.pest"]
struct FormulaParser;

/// A variable reference appearing in a formula: a parameter name, with
/// an optional explicit dataset index (`name[#k]`); `index = None`
/// means "the parameter as seen in the current evaluation context"
/// (typically resolved to the same dataset as the formula parameter
/// itself, or to the global entry).
#[derive(Debug, Clone, PartialEq)]
pub struct VarRef {
    pub name: String,
    pub index: Option<usize>,
}

/// Something that can evaluate a formula against a variable lookup.
/// Kept as a trait so the evaluator implementation can be swapped
/// without touching `FitParameter`.
pub trait Expression: std::fmt::Debug {
    /// All variable references appearing in the expression, in no
    /// particular order, possibly with duplicates.
    fn variables(&self) -> &[VarRef];

    /// Evaluate the expression given a value for each variable
    /// reference (looked up by name and optional index).
    fn evaluate(&self, vars: &dyn Fn(&VarRef) -> Option<f64>) -> Result<f64, FitError>;

    fn source(&self) -> &str;
}

/// A parsed arithmetic expression tree.
#[derive(Debug, Clone)]
pub enum Node {
    Number(f64),
    Var(VarRef),
    Neg(Box<Node>),
    Add(Box<Node>, Box<Node>),
    Sub(Box<Node>, Box<Node>),
    Mul(Box<Node>, Box<Node>),
    Div(Box<Node>, Box<Node>),
    Pow(Box<Node>, Box<Node>),
    Call(String, Vec<Node>),
}

#[derive(Debug, Clone)]
pub struct Formula {
    source: String,
    root: Node,
    variables: Vec<VarRef>,
}

fn pratt() -> PrattParser<Rule> {
    PrattParser::new()
        .op(Op::infix(Rule::add, Assoc::Left) | Op::infix(Rule::subtract, Assoc::Left))
        .op(Op::infix(Rule::multiply, Assoc::Left) | Op::infix(Rule::divide, Assoc::Left))
        .op(Op::infix(Rule::power, Assoc::Right))
}

impl Formula {
    /// Parse a formula source string (the part after the leading `=`
    /// in a parameter file, per §6).
    pub fn parse(source: &str) -> Result<Self, FitError> {
        let pairs = FormulaParser::parse(Rule::formula, source)
            .map_err(|e| FitError::runtime(format!("cannot parse formula '{source}': {e}")))?;
        let expr_pair = pairs
            .into_iter()
            .next()
            .and_then(|p| p.into_inner().next())
            .ok_or_else(|| FitError::runtime(format!("empty formula '{source}'")))?;
        let mut variables = Vec::new();
        let root = parse_expr(expr_pair.into_inner(), &mut variables)?;
        Ok(Formula {
            source: source.to_string(),
            root,
            variables,
        })
    }
}

fn parse_expr(pairs: Pairs<Rule>, vars: &mut Vec<VarRef>) -> Result<Node, FitError> {
    pratt()
        .map_primary(|primary| parse_atom(primary, vars))
        .map_infix(|lhs, op, rhs| {
            let lhs = lhs?;
            let rhs = rhs?;
            Ok(match op.as_rule() {
                Rule::add => Node::Add(Box::new(lhs), Box::new(rhs)),
                Rule::subtract => Node::Sub(Box::new(lhs), Box::new(rhs)),
                Rule::multiply => Node::Mul(Box::new(lhs), Box::new(rhs)),
                Rule::divide => Node::Div(Box::new(lhs), Box::new(rhs)),
                Rule::power => Node::Pow(Box::new(lhs), Box::new(rhs)),
                r => return Err(FitError::runtime(format!("unexpected operator {r:?}"))),
            })
        })
        .parse(pairs)
}

fn parse_atom(pair: pest::iterators::Pair<Rule>, vars: &mut Vec<VarRef>) -> Result<Node, FitError> {
    match pair.as_rule() {
        Rule::atom => {
            let mut negations = 0usize;
            let mut inner = None;
            for p in pair.into_inner() {
                match p.as_rule() {
                    Rule::unary_minus => negations += 1,
                    _ => inner = Some(parse_primary(p, vars)?),
                }
            }
            let mut node = inner.ok_or_else(|| FitError::runtime("empty atom"))?;
            for _ in 0..negations {
                node = Node::Neg(Box::new(node));
            }
            Ok(node)
        }
        _ => parse_primary(pair, vars),
    }
}

fn parse_primary(pair: pest::iterators::Pair<Rule>, vars: &mut Vec<VarRef>) -> Result<Node, FitError> {
    match pair.as_rule() {
        Rule::number => pair
            .as_str()
            .parse::<f64>()
            .map(Node::Number)
            .map_err(|_| FitError::runtime(format!("bad number literal '{}'", pair.as_str()))),
        Rule::param_ref => {
            let mut inner = pair.into_inner();
            let name = inner.next().unwrap().as_str().to_string();
            let index = inner.next().map(|p| p.as_str().parse::<usize>().unwrap());
            let v = VarRef { name, index };
            vars.push(v.clone());
            Ok(Node::Var(v))
        }
        Rule::function_call => {
            let mut inner = pair.into_inner();
            let name = inner.next().unwrap().as_str().to_string();
            let mut args = Vec::new();
            for arg in inner {
                args.push(parse_expr(arg.into_inner(), vars)?);
            }
            Ok(Node::Call(name, args))
        }
        Rule::expr => parse_expr(pair.into_inner(), vars),
        r => Err(FitError::runtime(format!("unexpected primary rule {r:?}"))),
    }
}

fn eval_node(node: &Node, vars: &dyn Fn(&VarRef) -> Option<f64>) -> Result<f64, FitError> {
    Ok(match node {
        Node::Number(n) => *n,
        Node::Var(v) => vars(v).ok_or_else(|| {
            FitError::runtime(format!(
                "unresolved variable '{}' in formula",
                describe_var(v)
            ))
        })?,
        Node::Neg(n) => -eval_node(n, vars)?,
        Node::Add(a, b) => eval_node(a, vars)? + eval_node(b, vars)?,
        Node::Sub(a, b) => eval_node(a, vars)? - eval_node(b, vars)?,
        Node::Mul(a, b) => eval_node(a, vars)? * eval_node(b, vars)?,
        Node::Div(a, b) => eval_node(a, vars)? / eval_node(b, vars)?,
        Node::Pow(a, b) => eval_node(a, vars)?.powf(eval_node(b, vars)?),
        Node::Call(name, args) => eval_call(name, args, vars)?,
    })
}

fn eval_call(name: &str, args: &[Node], vars: &dyn Fn(&VarRef) -> Option<f64>) -> Result<f64, FitError> {
    let a = |i: usize| eval_node(&args[i], vars);
    match name {
        "exp" if args.len() == 1 => Ok(a(0)?.exp()),
        "log" | "ln" if args.len() == 1 => Ok(a(0)?.ln()),
        "log10" if args.len() == 1 => Ok(a(0)?.log10()),
        "sqrt" if args.len() == 1 => Ok(a(0)?.sqrt()),
        "abs" if args.len() == 1 => Ok(a(0)?.abs()),
        "sin" if args.len() == 1 => Ok(a(0)?.sin()),
        "cos" if args.len() == 1 => Ok(a(0)?.cos()),
        "tan" if args.len() == 1 => Ok(a(0)?.tan()),
        "min" if args.len() == 2 => Ok(a(0)?.min(a(1)?)),
        "max" if args.len() == 2 => Ok(a(0)?.max(a(1)?)),
        _ => Err(FitError::runtime(format!(
            "unknown function '{name}' with {} argument(s)",
            args.len()
        ))),
    }
}

fn describe_var(v: &VarRef) -> String {
    match v.index {
        Some(i) => format!("{}[#{}]", v.name, i),
        None => v.name.clone(),
    }
}

impl Expression for Formula {
    fn variables(&self) -> &[VarRef] {
        &self.variables
    }

    fn evaluate(&self, vars: &dyn Fn(&VarRef) -> Option<f64>) -> Result<f64, FitError> {
        eval_node(&self.root, vars)
    }

    fn source(&self) -> &str {
        &self.source
    }
}

/// Convenience lookup adaptor: resolves a [`VarRef`] against a flat
/// `name -> value` map, ignoring any explicit index (used by simple
/// single-dataset callers and in tests).
pub fn flat_lookup(map: &HashMap<String, f64>) -> impl Fn(&VarRef) -> Option<f64> + '_ {
    move |v: &VarRef| map.get(&v.name).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars_of(values: &[(&str, f64)]) -> HashMap<String, f64> {
        values.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_simple_arithmetic() {
        let f = Formula::parse("1 + 2 * 3").unwrap();
        let lookup = |_: &VarRef| None;
        assert_eq!(f.evaluate(&lookup).unwrap(), 7.0);
    }

    #[test]
    fn test_reciprocal_formula() {
        let f = Formula::parse("1/tau").unwrap();
        let m = vars_of(&[("tau", 10.0)]);
        let lookup = flat_lookup(&m);
        assert!((f.evaluate(&lookup).unwrap() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_parenthesisation_and_power() {
        let f = Formula::parse("(a + b) ^ 2").unwrap();
        let m = vars_of(&[("a", 2.0), ("b", 3.0)]);
        let lookup = flat_lookup(&m);
        assert_eq!(f.evaluate(&lookup).unwrap(), 25.0);
    }

    #[test]
    fn test_unary_minus_and_functions() {
        let f = Formula::parse("-exp(-k*x)").unwrap();
        let m = vars_of(&[("k", 1.0), ("x", 0.0)]);
        let lookup = flat_lookup(&m);
        assert_eq!(f.evaluate(&lookup).unwrap(), -1.0);
    }

    #[test]
    fn test_indexed_variable_reference() {
        let f = Formula::parse("amplitude[#2] * 2").unwrap();
        assert_eq!(f.variables().len(), 1);
        assert_eq!(f.variables()[0].index, Some(2));
        let lookup = |v: &VarRef| {
            if v.name == "amplitude" && v.index == Some(2) {
                Some(4.0)
            } else {
                None
            }
        };
        assert_eq!(f.evaluate(&lookup).unwrap(), 8.0);
    }

    #[test]
    fn test_unresolved_variable_errors() {
        let f = Formula::parse("missing + 1").unwrap();
        let lookup = |_: &VarRef| None;
        assert!(f.evaluate(&lookup).is_err());
    }

    #[test]
    fn test_unknown_function_errors() {
        assert!(Formula::parse("bogus(1)").is_ok());
        let f = Formula::parse("bogus(1)").unwrap();
        let lookup = |_: &VarRef| None;
        assert!(f.evaluate(&lookup).is_err());
    }
}
