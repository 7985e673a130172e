//! Runtime values of the interpreter.

use crate::ast::FunctionDef;
use crate::interp::{Env, Flow, Interpreter};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Signature of built-in functions: interpreter, `this`, arguments.
pub type NativeFn = fn(&mut Interpreter, &Value, &[Value]) -> Flow<Value>;

/// Built-in that carries its own captured state.
pub type HostFn = Rc<dyn Fn(&mut Interpreter, &Value, &[Value]) -> Flow<Value>>;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<RefCell<Object>>),
    Function(Rc<Function>),
}

pub enum FunctionKind {
    Closure { def: Rc<FunctionDef>, env: Env },
    Native(NativeFn),
    Host(HostFn),
}

pub struct Function {
    pub name: Rc<str>,
    pub kind: FunctionKind,
    /// Static members, e.g. `Array.isArray`.
    pub props: RefCell<Object>,
}

impl Function {
    pub fn native(name: &str, f: NativeFn) -> Value {
        Value::Function(Rc::new(Function {
            name: name.into(),
            kind: FunctionKind::Native(f),
            props: RefCell::new(Object::default()),
        }))
    }

    pub fn host(
        name: &str,
        f: impl Fn(&mut Interpreter, &Value, &[Value]) -> Flow<Value> + 'static,
    ) -> Value {
        Value::Function(Rc::new(Function {
            name: name.into(),
            kind: FunctionKind::Host(Rc::new(f)),
            props: RefCell::new(Object::default()),
        }))
    }

    pub fn is_arrow(&self) -> bool {
        matches!(&self.kind, FunctionKind::Closure { def, .. } if def.is_arrow)
    }
}

/// Property bag preserving JavaScript key order: integer keys ascending,
/// then string keys in insertion order.
#[derive(Clone, Default)]
pub struct Object {
    pub props: Vec<(Rc<str>, Value)>,
    /// Constructor name for error objects and `new`-created instances.
    pub class: Option<Rc<str>>,
    pub frozen: bool,
}

impl Object {
    pub fn with_props(props: Vec<(Rc<str>, Value)>) -> Self {
        let mut object = Self::default();
        for (key, value) in props {
            object.set(key, value);
        }
        object
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.props
            .iter()
            .find(|(k, _)| &**k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn has(&self, key: &str) -> bool {
        self.props.iter().any(|(k, _)| &**k == key)
    }

    pub fn set(&mut self, key: Rc<str>, value: Value) {
        if self.frozen {
            return;
        }
        if let Some(slot) = self.props.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
            return;
        }
        match array_index(&key) {
            Some(index) => {
                let at = self
                    .props
                    .iter()
                    .position(|(k, _)| array_index(k).map_or(true, |other| other > index))
                    .unwrap_or(self.props.len());
                self.props.insert(at, (key, value));
            }
            None => self.props.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        if self.frozen {
            return false;
        }
        let before = self.props.len();
        self.props.retain(|(k, _)| &**k != key);
        before != self.props.len()
    }

    pub fn keys(&self) -> Vec<Rc<str>> {
        self.props.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn is_error(&self) -> bool {
        self.class.as_deref().is_some_and(is_error_class)
    }
}

pub fn is_error_class(name: &str) -> bool {
    matches!(
        name,
        "Error" | "TypeError" | "RangeError" | "SyntaxError" | "ReferenceError"
    )
}

/// Canonical array index: digits without a leading zero.
pub fn array_index(key: &str) -> Option<usize> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    if !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

impl Value {
    pub fn str(s: impl Into<Rc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn object(object: Object) -> Value {
        Value::Object(Rc::new(RefCell::new(object)))
    }

    pub fn from_pairs<K: Into<Rc<str>>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Value {
        Value::object(Object::with_props(
            pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn error(class: &str, message: &str) -> Value {
        let mut object = Object::with_props(vec![
            ("name".into(), Value::str(class)),
            ("message".into(), Value::str(message)),
        ]);
        object.class = Some(class.into());
        Value::object(object)
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) | Value::Object(_) => "object",
            Value::Function(_) => "function",
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => *n,
            Value::Str(s) => string_to_number(s),
            Value::Array(_) => string_to_number(&self.to_js_string()),
            Value::Object(_) | Value::Function(_) => f64::NAN,
        }
    }

    pub fn to_int32(&self) -> i32 {
        to_int32(self.to_number())
    }

    /// `String(value)`.
    pub fn to_js_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".into(),
            Value::Null => "null".into(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => number_to_string(*n),
            Value::Str(s) => s.to_string(),
            Value::Array(items) => array_to_string(items, &mut Vec::new()),
            Value::Object(object) => {
                let object = object.borrow();
                if object.is_error() {
                    let name = object
                        .get("name")
                        .map(|v| v.to_js_string())
                        .unwrap_or_else(|| "Error".into());
                    let message = object
                        .get("message")
                        .map(|v| v.to_js_string())
                        .unwrap_or_default();
                    if message.is_empty() {
                        name
                    } else {
                        format!("{name}: {message}")
                    }
                } else {
                    "[object Object]".into()
                }
            }
            Value::Function(f) => {
                if f.name.is_empty() {
                    "[Function (anonymous)]".into()
                } else {
                    format!("[Function: {}]", f.name)
                }
            }
        }
    }

    pub fn to_property_key(&self) -> Rc<str> {
        match self {
            Value::Str(s) => s.clone(),
            other => other.to_js_string().into(),
        }
    }

    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// `===` except that `NaN` equals itself (`Array.prototype.includes`).
    pub fn same_value_zero(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) if a.is_nan() && b.is_nan() => true,
            _ => self.strict_equals(other),
        }
    }

    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (a, b) if a.is_nullish() || b.is_nullish() => false,
            (Value::Number(_), Value::Str(_)) | (Value::Str(_), Value::Number(_)) => {
                self.to_number() == other.to_number()
            }
            (Value::Bool(_), _) => Value::Number(self.to_number()).loose_equals(other),
            (_, Value::Bool(_)) => self.loose_equals(&Value::Number(other.to_number())),
            (Value::Array(_) | Value::Object(_), Value::Number(_) | Value::Str(_)) => {
                Value::str(self.to_js_string()).loose_equals(other)
            }
            (Value::Number(_) | Value::Str(_), Value::Array(_) | Value::Object(_)) => {
                self.loose_equals(&Value::str(other.to_js_string()))
            }
            _ => self.strict_equals(other),
        }
    }

    /// Whether `+` concatenates rather than adds.
    pub fn is_string_like(&self) -> bool {
        matches!(
            self,
            Value::Str(_) | Value::Array(_) | Value::Object(_) | Value::Function(_)
        )
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s:?}"),
            other => f.write_str(&other.to_js_string()),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::str(s)
    }
}

pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let wrapped = n.trunc().rem_euclid(4_294_967_296.0);
    wrapped as u32 as i32
}

pub fn to_uint32(n: f64) -> u32 {
    to_int32(n) as u32
}

pub fn string_to_number(s: &str) -> f64 {
    let t = s.trim();
    if t.is_empty() {
        return 0.0;
    }
    let radix = match t.get(..2) {
        Some("0x" | "0X") => Some(16),
        Some("0o" | "0O") => Some(8),
        Some("0b" | "0B") => Some(2),
        _ => None,
    };
    if let Some(radix) = radix {
        return u64::from_str_radix(&t[2..], radix)
            .map(|n| n as f64)
            .unwrap_or(f64::NAN);
    }
    match t {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        // Rust accepts spellings JavaScript rejects.
        _ if t.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E') => f64::NAN,
        _ => t.parse().unwrap_or(f64::NAN),
    }
}

/// `Number.prototype.toString()` for radix 10.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".into();
    }
    if n == 0.0 {
        return "0".into();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.into();
    }
    let sign = if n < 0.0 { "-" } else { "" };

    // Shortest round-trip digits and exponent, e.g. "1.2345e-7".
    let formatted = format!("{:e}", n.abs());
    let (mantissa, exponent) = formatted.split_once('e').unwrap_or((&formatted, "0"));
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let k = digits.len() as i32;
    let point = exponent + 1;

    let body = if k <= point && point <= 21 {
        format!("{digits}{}", "0".repeat((point - k) as usize))
    } else if 0 < point && point <= 21 {
        let (int, frac) = digits.split_at(point as usize);
        format!("{int}.{frac}")
    } else if -6 < point && point <= 0 {
        format!("0.{}{digits}", "0".repeat((-point) as usize))
    } else {
        let e = point - 1;
        let exp = if e >= 0 {
            format!("e+{e}")
        } else {
            format!("e{e}")
        };
        if k == 1 {
            format!("{digits}{exp}")
        } else {
            format!("{}.{}{exp}", &digits[..1], &digits[1..])
        }
    };
    format!("{sign}{body}")
}

/// `Number.prototype.toString(radix)` for integral and fractional values.
pub fn number_to_radix(n: f64, radix: u32) -> String {
    if radix == 10 || !n.is_finite() {
        return number_to_string(n);
    }
    let negative = n < 0.0;
    let mut int = n.abs().trunc();
    let mut frac = n.abs().fract();
    let mut out = Vec::new();
    if int == 0.0 {
        out.push('0');
    }
    while int >= 1.0 {
        let digit = (int % f64::from(radix)) as u32;
        out.push(std::char::from_digit(digit, radix).unwrap_or('0'));
        int = (int / f64::from(radix)).trunc();
    }
    out.reverse();
    if frac > 0.0 {
        out.push('.');
        for _ in 0..20 {
            frac *= f64::from(radix);
            let digit = frac.trunc() as u32;
            out.push(std::char::from_digit(digit, radix).unwrap_or('0'));
            frac = frac.fract();
            if frac == 0.0 {
                break;
            }
        }
    }
    let body: String = out.into_iter().collect();
    if negative {
        format!("-{body}")
    } else {
        body
    }
}

/// Nesting beyond this is not rendered by `String()` or `JSON.stringify`.
const MAX_RENDER_DEPTH: usize = 1000;

/// Comma-joined elements; cyclic or too-deep entries render empty.
fn array_to_string(items: &Rc<RefCell<Vec<Value>>>, seen: &mut Vec<*const ()>) -> String {
    let ptr = Rc::as_ptr(items) as *const ();
    if seen.contains(&ptr) || seen.len() >= MAX_RENDER_DEPTH {
        return String::new();
    }
    seen.push(ptr);
    let out = items
        .borrow()
        .iter()
        .map(|item| match item {
            Value::Undefined | Value::Null => String::new(),
            Value::Array(inner) => array_to_string(inner, seen),
            other => other.to_js_string(),
        })
        .collect::<Vec<_>>()
        .join(",");
    seen.pop();
    out
}

/// Convert to JSON for `JSON.stringify` and console output. `None` means the
/// value has no JSON form (undefined, functions).
pub fn to_json(value: &Value) -> Result<Option<serde_json::Value>, String> {
    let mut stack: Vec<*const ()> = Vec::new();
    to_json_inner(value, &mut stack)
}

fn to_json_inner(
    value: &Value,
    stack: &mut Vec<*const ()>,
) -> Result<Option<serde_json::Value>, String> {
    use serde_json::Value as Json;
    Ok(Some(match value {
        Value::Undefined | Value::Function(_) => return Ok(None),
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Number(n) => number_to_json(*n),
        Value::Str(s) => Json::String(s.to_string()),
        Value::Array(items) => {
            let ptr = Rc::as_ptr(items) as *const ();
            enter(stack, ptr)?;
            let items = items.borrow();
            let mut out = Vec::with_capacity(items.len());
            for item in items.iter() {
                out.push(to_json_inner(item, stack)?.unwrap_or(Json::Null));
            }
            stack.pop();
            Json::Array(out)
        }
        Value::Object(object) => {
            let ptr = Rc::as_ptr(object) as *const ();
            enter(stack, ptr)?;
            let object = object.borrow();
            let mut map = serde_json::Map::new();
            if !object.is_error() {
                for (key, value) in &object.props {
                    if let Some(json) = to_json_inner(value, stack)? {
                        map.insert(key.to_string(), json);
                    }
                }
            }
            stack.pop();
            Json::Object(map)
        }
    }))
}

fn enter(stack: &mut Vec<*const ()>, ptr: *const ()) -> Result<(), String> {
    if stack.contains(&ptr) {
        return Err("Converting circular structure to JSON".into());
    }
    if stack.len() >= MAX_RENDER_DEPTH {
        return Err("Maximum call stack size exceeded".into());
    }
    stack.push(ptr);
    Ok(())
}

fn number_to_json(n: f64) -> serde_json::Value {
    if !n.is_finite() {
        serde_json::Value::Null
    } else if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Value::from(n)
    }
}

pub fn from_json(json: &serde_json::Value) -> Value {
    use serde_json::Value as Json;
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        Json::String(s) => Value::str(s.as_str()),
        Json::Array(items) => Value::array(items.iter().map(from_json).collect()),
        Json::Object(map) => Value::from_pairs(
            map.iter()
                .map(|(k, v)| (Rc::<str>::from(k.as_str()), from_json(v))),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_formatting() {
        assert_eq!(number_to_string(1.0), "1");
        assert_eq!(number_to_string(-2.5), "-2.5");
        assert_eq!(number_to_string(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(number_to_string(1e21), "1e+21");
        assert_eq!(number_to_string(123456789012345680000.0), "123456789012345680000");
        assert_eq!(number_to_string(0.000001), "0.000001");
        assert_eq!(number_to_string(1.5e-7), "1.5e-7");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn test_radix() {
        assert_eq!(number_to_radix(255.0, 16), "ff");
        assert_eq!(number_to_radix(-5.0, 2), "-101");
        assert_eq!(number_to_radix(0.5, 2), "0.1");
    }

    #[test]
    fn test_string_to_number() {
        assert_eq!(string_to_number("  42 "), 42.0);
        assert_eq!(string_to_number(""), 0.0);
        assert_eq!(string_to_number("0x1f"), 31.0);
        assert!(string_to_number("12px").is_nan());
        assert!(string_to_number("inf").is_nan());
        assert_eq!(string_to_number("-Infinity"), f64::NEG_INFINITY);
    }

    #[test]
    fn test_loose_equality() {
        assert!(Value::Null.loose_equals(&Value::Undefined));
        assert!(Value::Number(1.0).loose_equals(&Value::str("1")));
        assert!(Value::Bool(true).loose_equals(&Value::Number(1.0)));
        assert!(!Value::Null.loose_equals(&Value::Number(0.0)));
        assert!(!Value::Number(f64::NAN).strict_equals(&Value::Number(f64::NAN)));
    }

    #[test]
    fn test_integer_keys_come_first() {
        let mut object = Object::default();
        object.set("b".into(), Value::Number(1.0));
        object.set("2".into(), Value::Number(2.0));
        object.set("a".into(), Value::Number(3.0));
        object.set("1".into(), Value::Number(4.0));
        let keys: Vec<String> = object.keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["1", "2", "b", "a"]);
    }

    #[test]
    fn test_json_conversion() {
        let inner = Value::array(vec![Value::Number(1.0), Value::Undefined, Value::Number(1.5)]);
        let object = Value::from_pairs([("list", inner), ("skip", Value::Undefined)]);
        let json = to_json(&object).unwrap().unwrap();
        assert_eq!(json.to_string(), r#"{"list":[1,null,1.5]}"#);
    }

    #[test]
    fn test_circular_json_is_rejected() {
        let list = Value::array(Vec::new());
        if let Value::Array(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        assert!(to_json(&list).is_err());
        if let Value::Array(items) = &list {
            items.borrow_mut().clear();
        }
    }

    #[test]
    fn test_error_to_string() {
        assert_eq!(
            Value::error("TypeError", "bad").to_js_string(),
            "TypeError: bad"
        );
    }
}
