//! Expression evaluation: operators, functions, constants, and the
//! extension registry.
//!
//! The evaluator keeps no state between expressions; everything it needs
//! (symbols, addresses, pass counters, RNG, staged output) comes from the
//! driver it is handed. Forward references are re-resolved on later
//! passes, never patched in place.

use std::collections::HashMap;
use std::rc::Rc;

use crate::assembler::{DirectiveHost, Driver};
use crate::lexer::Tok;
use crate::value::Value;

/// A user-registered operator.
pub struct OperatorSpec {
    /// Binding power; the built-in `*` sits at 90, `+` at 80.
    pub precedence: u8,
    pub unary: bool,
    pub right_assoc: bool,
    pub apply: Rc<dyn Fn(&[Value]) -> Result<Value, String>>,
}

pub(crate) struct FunctionSpec {
    /// Exact argument count, or -1 for one-or-more.
    pub arity: i32,
    pub apply: Rc<dyn Fn(&[Value]) -> Result<Value, String>>,
}

pub(crate) type DirectiveFn = dyn Fn(&mut dyn DirectiveHost, &[Tok]) -> Result<(), String>;

/// Custom operators, functions, constants and directives. Built-in names
/// cannot be overridden.
#[derive(Default)]
pub struct Registry {
    pub(crate) operators: HashMap<String, OperatorSpec>,
    pub(crate) functions: HashMap<String, FunctionSpec>,
    pub(crate) constants: HashMap<String, Value>,
    pub(crate) directives: HashMap<String, Rc<DirectiveFn>>,
}

impl Registry {
    pub(crate) fn add_operator(&mut self, name: &str, spec: OperatorSpec) -> Result<(), String> {
        let key = name.to_ascii_uppercase();
        if is_builtin_operator(&key) {
            return Err(format!("cannot override built-in operator {name}"));
        }
        self.operators.insert(key, spec);
        Ok(())
    }

    pub(crate) fn add_function(
        &mut self,
        name: &str,
        arity: i32,
        apply: Rc<dyn Fn(&[Value]) -> Result<Value, String>>,
    ) -> Result<(), String> {
        let key = name.to_ascii_uppercase();
        if is_builtin_function(&key) {
            return Err(format!("cannot override built-in function {name}"));
        }
        self.functions.insert(key, FunctionSpec { arity, apply });
        Ok(())
    }

    pub(crate) fn add_constant(&mut self, name: &str, value: f64) -> Result<(), String> {
        let key = name.to_ascii_uppercase();
        if is_builtin_constant(&key) {
            return Err(format!("cannot override built-in constant {name}"));
        }
        self.constants.insert(key, Value::Float(value));
        Ok(())
    }

    pub(crate) fn add_directive(&mut self, name: &str, handler: Rc<DirectiveFn>) -> Result<(), String> {
        let key = name.to_ascii_uppercase();
        if crate::directives::is_builtin_directive(&key) {
            return Err(format!("cannot override built-in directive {name}"));
        }
        self.directives.insert(key, handler);
        Ok(())
    }
}

fn is_builtin_operator(upper: &str) -> bool {
    matches!(
        upper,
        "+" | "-" | "*" | "/" | "%" | "<<" | ">>" | "<" | "<=" | ">" | ">=" | "==" | "!=" | "&"
            | "^" | "|" | "&&" | "||" | "~" | "!" | "?" | ":" | "MOD" | "SHL" | "SHR" | "LT"
            | "LE" | "GT" | "GE" | "EQ" | "NE" | "AND" | "OR" | "XOR" | "NOT"
    )
}

fn is_builtin_constant(upper: &str) -> bool {
    matches!(upper, "TRUE" | "FALSE" | "MATH_PI" | "MATH_E")
}

fn is_builtin_function(upper: &str) -> bool {
    matches!(
        upper,
        "HIGH" | "LOW" | "CHR" | "STR" | "VAL" | "SUBSTR" | "ABS" | "SGN" | "MIN" | "MAX"
            | "SQRT" | "POW" | "LOG" | "LOG2" | "LOG10" | "EXP" | "SIN" | "COS" | "TAN" | "ASIN"
            | "ACOS" | "ATAN" | "ATAN2" | "SINH" | "COSH" | "TANH" | "FLOOR" | "CEIL" | "ROUND"
            | "TRUNC" | "RAND" | "RND" | "RRND" | "ISSTRING" | "ISNUMBER"
    )
}

/// Binary operator description: precedence and whether it binds right.
fn binary_op(token: &Tok) -> Option<(&'static str, u8, bool)> {
    let name = match token {
        Tok::Punct(p) => *p,
        Tok::Ident(word) => match word.to_ascii_uppercase().as_str() {
            "MOD" => "%",
            "SHL" => "<<",
            "SHR" => ">>",
            "LT" => "<",
            "LE" => "<=",
            "GT" => ">",
            "GE" => ">=",
            "EQ" => "==",
            "NE" => "!=",
            "AND" => "&",
            "OR" => "|",
            "XOR" => "^",
            _ => return None,
        },
        _ => return None,
    };
    let (prec, right) = match name {
        "*" | "/" | "%" | "<<" | ">>" => (90, false),
        "+" | "-" => (80, false),
        "<" | "<=" | ">" | ">=" => (70, false),
        "==" | "!=" => (60, false),
        "&" => (50, false),
        "^" => (45, false),
        "|" => (40, false),
        "&&" => (30, false),
        "||" => (20, false),
        "?" => (10, true),
        _ => return None,
    };
    Some((name, prec, right))
}

struct Parser<'d, 'c, 't> {
    driver: &'d mut Driver<'c>,
    toks: &'t [Tok],
    pos: usize,
}

impl Parser<'_, '_, '_> {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<&Tok> {
        let tok = self.toks.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), String> {
        match self.peek() {
            Some(tok) if tok.is_punct(p) => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(format!("expected {p}")),
        }
    }

    fn custom_binary(&self, token: &Tok) -> Option<(String, u8, bool)> {
        let key = match token {
            Tok::Punct(p) => (*p).to_string(),
            Tok::Ident(word) => word.to_ascii_uppercase(),
            _ => return None,
        };
        let spec = self.driver.registry.operators.get(&key)?;
        (!spec.unary).then(|| (key, spec.precedence, spec.right_assoc))
    }

    fn parse_expr(&mut self, min_prec: u8) -> Result<Value, String> {
        let mut left = self.parse_unary()?;
        loop {
            let Some(token) = self.peek() else { break };
            // Custom operators win only for names the builtin table does
            // not claim.
            let (name, prec, right) = match binary_op(token) {
                Some((name, prec, right)) => (name.to_string(), prec, right),
                None => match self.custom_binary(token) {
                    Some(op) => op,
                    None => break,
                },
            };
            if prec < min_prec {
                break;
            }
            self.pos += 1;

            if name == "?" {
                let then_value = self.parse_expr(0)?;
                self.expect_punct(":")?;
                let else_value = self.parse_expr(prec)?;
                left = if left.truthy()? { then_value } else { else_value };
                continue;
            }

            let next_min = if right { prec } else { prec + 1 };
            let right_value = self.parse_expr(next_min)?;
            left = apply_binary(&name, &left, &right_value, self.driver)?;
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Value, String> {
        match self.peek() {
            Some(Tok::Punct("+")) => {
                self.pos += 1;
                self.parse_unary()
            }
            Some(Tok::Punct("-")) => {
                self.pos += 1;
                let value = self.parse_unary()?;
                Value::Int(0).sub(&value)
            }
            Some(Tok::Punct("~")) => {
                self.pos += 1;
                let value = self.parse_unary()?;
                Ok(Value::Int(!value.as_int()?))
            }
            Some(Tok::Punct("!")) => {
                self.pos += 1;
                let value = self.parse_unary()?;
                Ok(Value::Int(i64::from(!value.truthy()?)))
            }
            Some(Tok::Ident(word)) if word.eq_ignore_ascii_case("NOT") => {
                self.pos += 1;
                let value = self.parse_unary()?;
                Ok(Value::Int(!value.as_int()?))
            }
            Some(token) => {
                // Custom unary operators, word or punctuation form.
                let key = match token {
                    Tok::Punct(p) => Some((*p).to_string()),
                    Tok::Ident(word) => Some(word.to_ascii_uppercase()),
                    _ => None,
                };
                if let Some(key) = key
                    && let Some(spec) = self.driver.registry.operators.get(&key)
                    && spec.unary
                {
                    let apply = Rc::clone(&spec.apply);
                    self.pos += 1;
                    let value = self.parse_unary()?;
                    return apply(&[value]);
                }
                self.parse_primary()
            }
            None => Err("expected operand".to_string()),
        }
    }

    fn parse_primary(&mut self) -> Result<Value, String> {
        let Some(token) = self.next().cloned() else {
            return Err("expected operand".to_string());
        };
        match token {
            Tok::Int(value) => Ok(Value::Int(value)),
            Tok::Float(value) => Ok(Value::Float(value)),
            Tok::Str(text) => Ok(Value::Str(text)),
            Tok::Dollar => Ok(Value::Int(i64::from(self.driver.stmt_logical))),
            Tok::DollarDollar => Ok(Value::Int(i64::from(self.driver.physical))),
            Tok::Punct("(") => {
                let value = self.parse_expr(0)?;
                self.expect_punct(")")?;
                Ok(value)
            }
            // {expr}: peek the staged byte at the address.
            Tok::Punct("{") => {
                let address = self.parse_expr(0)?.as_int()?;
                self.expect_punct("}")?;
                let byte = if self.driver.emitting {
                    self.driver.staging.peek(address as u16)
                } else {
                    0
                };
                Ok(Value::Int(i64::from(byte)))
            }
            Tok::Ident(name) => self.parse_ident(&name),
            Tok::Punct(p) => Err(format!("unexpected {p} in expression")),
        }
    }

    fn parse_ident(&mut self, name: &str) -> Result<Value, String> {
        let upper = name.to_ascii_uppercase();
        match upper.as_str() {
            "$PHASE" => return Ok(Value::Int(self.driver.phase_var)),
            "$PASS" => return Ok(Value::Int(self.driver.pass_var)),
            "TRUE" => return Ok(Value::Int(1)),
            "FALSE" => return Ok(Value::Int(0)),
            "MATH_PI" => return Ok(Value::Float(std::f64::consts::PI)),
            "MATH_E" => return Ok(Value::Float(std::f64::consts::E)),
            _ => {}
        }

        // Function call
        if self.peek().is_some_and(|tok| tok.is_punct("(")) {
            let is_custom = self.driver.registry.functions.contains_key(&upper);
            if is_builtin_function(&upper) || is_custom {
                self.pos += 1;
                let mut args = Vec::new();
                if !self.peek().is_some_and(|tok| tok.is_punct(")")) {
                    loop {
                        args.push(self.parse_expr(0)?);
                        if self.peek().is_some_and(|tok| tok.is_punct(",")) {
                            self.pos += 1;
                            continue;
                        }
                        break;
                    }
                }
                self.expect_punct(")")?;
                if is_custom {
                    let spec = &self.driver.registry.functions[&upper];
                    if spec.arity >= 0 && args.len() != spec.arity as usize {
                        return Err(format!(
                            "{upper} expects {} arguments, got {}",
                            spec.arity,
                            args.len()
                        ));
                    }
                    if spec.arity < 0 && args.is_empty() {
                        return Err(format!("{upper} expects at least one argument"));
                    }
                    let apply = Rc::clone(&spec.apply);
                    return apply(&args);
                }
                return builtin_function(self.driver, &upper, &args);
            }
        }

        // Custom constants
        if let Some(value) = self.driver.registry.constants.get(&upper) {
            return Ok(value.clone());
        }

        // Symbol reference
        match self.driver.resolve_name(name) {
            Some(qualified) => {
                let (value, unresolved, stable) = {
                    let symbol = self.driver.symbols.get(&qualified).expect("resolved");
                    (symbol.value.clone(), symbol.unresolved, symbol.stable)
                };
                if !stable {
                    self.driver.eval_tentative.push(qualified.clone());
                }
                if unresolved {
                    self.driver.eval_shaky.push(qualified);
                }
                Ok(value)
            }
            None => {
                self.driver.saw_unresolved = true;
                self.driver.eval_undefined.push(name.to_string());
                if self.driver.emitting {
                    Err(format!("undefined symbol {name}"))
                } else {
                    Ok(Value::Int(0))
                }
            }
        }
    }
}

fn apply_binary(
    name: &str,
    left: &Value,
    right: &Value,
    driver: &Driver<'_>,
) -> Result<Value, String> {
    let int = |value: bool| Ok(Value::Int(i64::from(value)));
    match name {
        "+" => left.add(right),
        "-" => left.sub(right),
        "*" => left.mul(right),
        "/" => left.div(right),
        "%" => left.rem(right),
        "<<" => Ok(Value::Int(left.as_int()?.wrapping_shl(right.as_int()? as u32))),
        ">>" => Ok(Value::Int(((left.as_int()? as u64) >> (right.as_int()? as u32 & 63)) as i64)),
        "<" => int(left.compare(right)? == std::cmp::Ordering::Less),
        "<=" => int(left.compare(right)? != std::cmp::Ordering::Greater),
        ">" => int(left.compare(right)? == std::cmp::Ordering::Greater),
        ">=" => int(left.compare(right)? != std::cmp::Ordering::Less),
        "==" => int(left.eq_value(right)),
        "!=" => int(!left.eq_value(right)),
        "&" => Ok(Value::Int(left.as_int()? & right.as_int()?)),
        "^" => Ok(Value::Int(left.as_int()? ^ right.as_int()?)),
        "|" => Ok(Value::Int(left.as_int()? | right.as_int()?)),
        "&&" => int(left.truthy()? && right.truthy()?),
        "||" => int(left.truthy()? || right.truthy()?),
        custom => {
            let spec = driver
                .registry
                .operators
                .get(custom)
                .ok_or_else(|| format!("unknown operator {custom}"))?;
            (spec.apply)(&[left.clone(), right.clone()])
        }
    }
}

fn builtin_function(driver: &mut Driver<'_>, name: &str, args: &[Value]) -> Result<Value, String> {
    let want = |n: usize| -> Result<(), String> {
        if args.len() == n {
            Ok(())
        } else {
            Err(format!("{name} expects {n} arguments, got {}", args.len()))
        }
    };
    let float1 = |f: fn(f64) -> f64| -> Result<Value, String> {
        want(1)?;
        Ok(Value::Float(f(args[0].as_float()?)))
    };

    match name {
        "HIGH" => {
            want(1)?;
            Ok(Value::Int((args[0].as_int()? >> 8) & 0xFF))
        }
        "LOW" => {
            want(1)?;
            Ok(Value::Int(args[0].as_int()? & 0xFF))
        }
        "CHR" => {
            want(1)?;
            let code = args[0].as_int()? as u8;
            Ok(Value::Str(char::from(code).to_string()))
        }
        "STR" => {
            want(1)?;
            Ok(Value::Str(args[0].to_string()))
        }
        "VAL" => {
            want(1)?;
            let Value::Str(text) = &args[0] else {
                return Err("VAL expects a string".to_string());
            };
            text.trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| format!("VAL: not a number: {text}"))
        }
        "SUBSTR" => {
            want(3)?;
            let Value::Str(text) = &args[0] else {
                return Err("SUBSTR expects a string".to_string());
            };
            let start = args[1].as_int()?.max(0) as usize;
            let length = args[2].as_int()?.max(0) as usize;
            Ok(Value::Str(text.chars().skip(start).take(length).collect()))
        }
        "ABS" => {
            want(1)?;
            match &args[0] {
                Value::Float(value) => Ok(Value::Float(value.abs())),
                other => Ok(Value::Int(other.as_int()?.wrapping_abs())),
            }
        }
        "SGN" => {
            want(1)?;
            let value = args[0].as_float()?;
            Ok(Value::Int(if value > 0.0 {
                1
            } else if value < 0.0 {
                -1
            } else {
                0
            }))
        }
        "MIN" | "MAX" => {
            if args.len() < 2 {
                return Err(format!("{name} expects at least two arguments"));
            }
            let mut best = args[0].clone();
            for arg in &args[1..] {
                let replace = if name == "MIN" {
                    arg.as_float()? < best.as_float()?
                } else {
                    arg.as_float()? > best.as_float()?
                };
                if replace {
                    best = arg.clone();
                }
            }
            Ok(best)
        }
        "SQRT" => float1(f64::sqrt),
        "POW" => {
            want(2)?;
            Ok(Value::Float(args[0].as_float()?.powf(args[1].as_float()?)))
        }
        "LOG" => float1(f64::ln),
        "LOG2" => float1(f64::log2),
        "LOG10" => float1(f64::log10),
        "EXP" => float1(f64::exp),
        "SIN" => float1(f64::sin),
        "COS" => float1(f64::cos),
        "TAN" => float1(f64::tan),
        "ASIN" => float1(f64::asin),
        "ACOS" => float1(f64::acos),
        "ATAN" => float1(f64::atan),
        "ATAN2" => {
            want(2)?;
            Ok(Value::Float(args[0].as_float()?.atan2(args[1].as_float()?)))
        }
        "SINH" => float1(f64::sinh),
        "COSH" => float1(f64::cosh),
        "TANH" => float1(f64::tanh),
        "FLOOR" => {
            want(1)?;
            Ok(Value::Int(args[0].as_float()?.floor() as i64))
        }
        "CEIL" => {
            want(1)?;
            Ok(Value::Int(args[0].as_float()?.ceil() as i64))
        }
        "ROUND" => {
            want(1)?;
            Ok(Value::Int(args[0].as_float()?.round() as i64))
        }
        "TRUNC" => {
            want(1)?;
            Ok(Value::Int(args[0].as_float()?.trunc() as i64))
        }
        "RAND" | "RRND" => {
            want(2)?;
            let low = args[0].as_int()?;
            let high = args[1].as_int()?;
            if high < low {
                return Err(format!("{name}: empty range"));
            }
            let span = (high - low) as u64 + 1;
            let raw = driver.next_random();
            Ok(Value::Int(low + (raw % span) as i64))
        }
        "RND" => {
            want(0)?;
            let raw = driver.next_random() >> 11;
            Ok(Value::Float(raw as f64 / (1u64 << 53) as f64))
        }
        "ISSTRING" => {
            want(1)?;
            Ok(Value::Int(i64::from(args[0].is_string())))
        }
        "ISNUMBER" => {
            want(1)?;
            Ok(Value::Int(i64::from(args[0].is_number())))
        }
        _ => Err(format!("unknown function {name}")),
    }
}

impl Driver<'_> {
    /// Evaluate a full token slice as one expression.
    pub(crate) fn eval_tokens(&mut self, toks: &[Tok]) -> Result<Value, String> {
        let mut parser = Parser { driver: self, toks, pos: 0 };
        let value = parser.parse_expr(0)?;
        if parser.pos != toks.len() {
            return Err("trailing tokens after expression".to_string());
        }
        Ok(value)
    }

    pub(crate) fn eval_int_tokens(&mut self, toks: &[Tok]) -> Result<i64, String> {
        self.eval_tokens(toks).and_then(|value| value.as_int())
    }

    /// xorshift64*; seeded from the configuration so compiles reproduce.
    pub(crate) fn next_random(&mut self) -> u64 {
        let mut x = self.rng;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

impl DirectiveHost for Driver<'_> {
    fn emit_code(&mut self, bytes: &[u8]) {
        self.emit_bytes(bytes, true);
    }

    fn emit_data(&mut self, bytes: &[u8]) {
        self.emit_bytes(bytes, false);
    }

    fn eval_int(&mut self, toks: &[Tok]) -> Result<i64, String> {
        self.eval_int_tokens(toks)
    }

    fn logical_address(&self) -> u16 {
        self.logical
    }
}

// Kept here so the registry and evaluator stay in one compilation unit.
pub(crate) fn split_commas(toks: &[Tok]) -> Vec<&[Tok]> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (index, tok) in toks.iter().enumerate() {
        match tok {
            Tok::Punct("(" | "{" | "[") => depth += 1,
            Tok::Punct(")" | "}" | "]") => depth = depth.saturating_sub(1),
            Tok::Punct(",") if depth == 0 => {
                parts.push(&toks[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    if start < toks.len() || !parts.is_empty() {
        parts.push(&toks[start..]);
    }
    parts
}
