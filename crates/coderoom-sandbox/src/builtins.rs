//! Global objects and the methods of built-in value types.

use crate::interp::{own_keys, Env, Flow, Interpreter};
use crate::markup;
use crate::value::*;
use serde::Serialize;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

/// Long native loops check the deadline once per this many steps.
const TICK_EVERY: usize = 1 << 16;

pub(crate) fn install(interp: &mut Interpreter, globals: &Env) {
    let console = native_object(&[
        ("log", console_log),
        ("info", console_log),
        ("warn", console_log),
        ("error", console_log),
        ("debug", console_log),
    ]);
    globals.define("console", console, false);
    globals.define("Math", math(), false);
    globals.define("JSON", native_object(&[("stringify", json_stringify), ("parse", json_parse)]), false);

    let number = Function::native("Number", |_, _, args| {
        Ok(Value::Number(args.first().map_or(0.0, Value::to_number)))
    });
    with_statics(
        &number,
        vec![
            ("isInteger", Function::native("isInteger", number_is_integer)),
            ("isFinite", Function::native("isFinite", number_is_finite)),
            ("isNaN", Function::native("isNaN", number_is_nan)),
            ("parseFloat", Function::native("parseFloat", parse_float)),
            ("parseInt", Function::native("parseInt", parse_int)),
            ("MAX_SAFE_INTEGER", Value::Number(9_007_199_254_740_991.0)),
            ("MIN_SAFE_INTEGER", Value::Number(-9_007_199_254_740_991.0)),
            ("EPSILON", Value::Number(f64::EPSILON)),
            ("MAX_VALUE", Value::Number(f64::MAX)),
            ("MIN_VALUE", Value::Number(5e-324)),
            ("POSITIVE_INFINITY", Value::Number(f64::INFINITY)),
            ("NEGATIVE_INFINITY", Value::Number(f64::NEG_INFINITY)),
            ("NaN", Value::Number(f64::NAN)),
        ],
    );
    globals.define("Number", number, false);

    let string = Function::native("String", |_, _, args| {
        Ok(Value::from(
            args.first().map(Value::to_js_string).unwrap_or_default(),
        ))
    });
    with_statics(
        &string,
        vec![("fromCharCode", Function::native("fromCharCode", string_from_char_code))],
    );
    globals.define("String", string, false);
    globals.define(
        "Boolean",
        Function::native("Boolean", |_, _, args| {
            Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
        }),
        false,
    );

    let array = Function::native("Array", array_constructor);
    with_statics(
        &array,
        vec![
            ("isArray", Function::native("isArray", |_, _, args| {
                Ok(Value::Bool(matches!(args.first(), Some(Value::Array(_)))))
            })),
            ("from", Function::native("from", array_from)),
            ("of", Function::native("of", |_, _, args| Ok(Value::array(args.to_vec())))),
        ],
    );
    globals.define("Array", array, false);

    let object = Function::native("Object", |_, _, args| {
        Ok(match args.first() {
            Some(value @ (Value::Object(_) | Value::Array(_) | Value::Function(_))) => value.clone(),
            _ => Value::object(Object::default()),
        })
    });
    with_statics(
        &object,
        vec![
            ("keys", Function::native("keys", object_keys)),
            ("values", Function::native("values", object_values)),
            ("entries", Function::native("entries", object_entries)),
            ("assign", Function::native("assign", object_assign)),
            ("freeze", Function::native("freeze", object_freeze)),
            ("isFrozen", Function::native("isFrozen", |_, _, args| {
                Ok(Value::Bool(match args.first() {
                    Some(Value::Object(o)) => o.borrow().frozen,
                    _ => true,
                }))
            })),
            ("fromEntries", Function::native("fromEntries", object_from_entries)),
        ],
    );
    globals.define("Object", object, false);

    for class in ["Error", "TypeError", "RangeError", "SyntaxError", "ReferenceError"] {
        let constructor = Function::host(class, move |_, _, args| {
            let message = match args.first() {
                None | Some(Value::Undefined) => String::new(),
                Some(value) => value.to_js_string(),
            };
            Ok(Value::error(class, &message))
        });
        globals.define(class, constructor, false);
    }

    globals.define("parseInt", Function::native("parseInt", parse_int), false);
    globals.define("parseFloat", Function::native("parseFloat", parse_float), false);
    globals.define(
        "isNaN",
        Function::native("isNaN", |_, _, args| {
            Ok(Value::Bool(args.first().map_or(f64::NAN, Value::to_number).is_nan()))
        }),
        false,
    );
    globals.define(
        "isFinite",
        Function::native("isFinite", |_, _, args| {
            Ok(Value::Bool(args.first().map_or(f64::NAN, Value::to_number).is_finite()))
        }),
        false,
    );
    globals.define("NaN", Value::Number(f64::NAN), false);
    globals.define("Infinity", Value::Number(f64::INFINITY), false);

    globals.define("setTimeout", Function::native("setTimeout", set_timeout), false);
    globals.define("setInterval", Function::native("setInterval", set_interval), false);
    globals.define("clearTimeout", Function::native("clearTimeout", clear_timer), false);
    globals.define("clearInterval", Function::native("clearInterval", clear_timer), false);

    markup::install(interp, globals);
}

// === Helpers ===

pub(crate) fn native_object(methods: &[(&str, NativeFn)]) -> Value {
    Value::from_pairs(
        methods
            .iter()
            .map(|(name, f)| (*name, Function::native(name, *f))),
    )
}

fn with_statics(function: &Value, statics: Vec<(&str, Value)>) {
    if let Value::Function(function) = function {
        let mut props = function.props.borrow_mut();
        for (name, value) in statics {
            props.set(name.into(), value);
        }
    }
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or_default()
}

fn number_arg(args: &[Value], index: usize) -> f64 {
    args.get(index).map_or(f64::NAN, Value::to_number)
}

/// `ToIntegerOrInfinity`, with `default` for a missing argument.
fn integer_arg(args: &[Value], index: usize, default: f64) -> f64 {
    match args.get(index) {
        None | Some(Value::Undefined) => default,
        Some(value) => {
            let n = value.to_number();
            if n.is_nan() {
                0.0
            } else {
                n.trunc()
            }
        }
    }
}

/// Resolve a possibly negative index against `len`, clamped to `0..=len`.
fn relative_index(args: &[Value], index: usize, len: usize, default: f64) -> usize {
    let n = integer_arg(args, index, default);
    if n < 0.0 {
        (len as f64 + n).max(0.0) as usize
    } else {
        n.min(len as f64) as usize
    }
}

fn this_array(interp: &Interpreter, this: &Value) -> Flow<Rc<RefCell<Vec<Value>>>> {
    match this {
        Value::Array(items) => Ok(items.clone()),
        other => Err(interp.throw(
            "TypeError",
            format!("{} is not an array", other.to_js_string()),
        )),
    }
}

fn this_string(this: &Value) -> Rc<str> {
    match this {
        Value::Str(s) => s.clone(),
        other => other.to_js_string().into(),
    }
}

fn callback(interp: &Interpreter, args: &[Value]) -> Flow<Value> {
    match args.first() {
        Some(f @ Value::Function(_)) => Ok(f.clone()),
        other => Err(interp.throw(
            "TypeError",
            format!(
                "{} is not a function",
                other.cloned().unwrap_or_default().to_js_string()
            ),
        )),
    }
}

fn item_at(items: &Rc<RefCell<Vec<Value>>>, index: usize) -> Option<Value> {
    items.borrow().get(index).cloned()
}

// === console / JSON ===

/// Objects and arrays print as indented JSON, everything else as its string.
pub(crate) fn format_console_arg(value: &Value) -> String {
    match value {
        Value::Object(object) if object.borrow().is_error() => value.to_js_string(),
        Value::Array(_) | Value::Object(_) => match to_json(value) {
            Ok(Some(json)) => json_text(&json, "  "),
            _ => value.to_js_string(),
        },
        other => other.to_js_string(),
    }
}

fn console_log(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let line = args
        .iter()
        .map(format_console_arg)
        .collect::<Vec<_>>()
        .join(" ");
    interp.print(line)?;
    Ok(Value::Undefined)
}

pub(crate) fn json_text(json: &serde_json::Value, indent: &str) -> String {
    if indent.is_empty() {
        return json.to_string();
    }
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    match json.serialize(&mut serializer) {
        Ok(()) => String::from_utf8(buf).unwrap_or_else(|_| json.to_string()),
        Err(_) => json.to_string(),
    }
}

fn json_stringify(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let indent = match args.get(2) {
        Some(Value::Number(n)) => " ".repeat(n.clamp(0.0, 10.0) as usize),
        Some(Value::Str(s)) => s.chars().take(10).collect(),
        _ => String::new(),
    };
    match to_json(&arg(args, 0)) {
        Ok(Some(json)) => Ok(Value::from(json_text(&json, &indent))),
        Ok(None) => Ok(Value::Undefined),
        Err(message) => Err(interp.throw("TypeError", message)),
    }
}

fn json_parse(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let text = arg(args, 0).to_js_string();
    serde_json::from_str::<serde_json::Value>(&text)
        .map(|json| from_json(&json))
        .map_err(|err| interp.throw("SyntaxError", format!("Unexpected token in JSON: {err}")))
}

// === Math ===

fn math() -> Value {
    let mut props: Vec<(&str, Value)> = vec![
        ("PI", Value::Number(std::f64::consts::PI)),
        ("E", Value::Number(std::f64::consts::E)),
        ("LN2", Value::Number(std::f64::consts::LN_2)),
        ("LN10", Value::Number(std::f64::consts::LN_10)),
        ("LOG2E", Value::Number(std::f64::consts::LOG2_E)),
        ("LOG10E", Value::Number(std::f64::consts::LOG10_E)),
        ("SQRT2", Value::Number(std::f64::consts::SQRT_2)),
        ("SQRT1_2", Value::Number(std::f64::consts::FRAC_1_SQRT_2)),
    ];
    let unary: [(&str, fn(f64) -> f64); 22] = [
        ("abs", f64::abs),
        ("floor", f64::floor),
        ("ceil", f64::ceil),
        ("round", |x| (x + 0.5).floor()),
        ("trunc", f64::trunc),
        ("sign", |x| if x.is_nan() || x == 0.0 { x } else { x.signum() }),
        ("sqrt", f64::sqrt),
        ("cbrt", f64::cbrt),
        ("sin", f64::sin),
        ("cos", f64::cos),
        ("tan", f64::tan),
        ("asin", f64::asin),
        ("acos", f64::acos),
        ("atan", f64::atan),
        ("sinh", f64::sinh),
        ("cosh", f64::cosh),
        ("tanh", f64::tanh),
        ("exp", f64::exp),
        ("log", f64::ln),
        ("log2", f64::log2),
        ("log10", f64::log10),
        ("fround", |x| f64::from(x as f32)),
    ];
    for (name, f) in unary {
        props.push((
            name,
            Function::host(name, move |_, _, args| Ok(Value::Number(f(number_arg(args, 0))))),
        ));
    }
    props.push(("pow", Function::native("pow", |_, _, args| {
        let exp = number_arg(args, 1);
        Ok(Value::Number(if exp.is_nan() {
            f64::NAN
        } else {
            number_arg(args, 0).powf(exp)
        }))
    })));
    props.push(("atan2", Function::native("atan2", |_, _, args| {
        Ok(Value::Number(number_arg(args, 0).atan2(number_arg(args, 1))))
    })));
    props.push(("hypot", Function::native("hypot", |_, _, args| {
        Ok(Value::Number(
            args.iter().map(|v| v.to_number().powi(2)).sum::<f64>().sqrt(),
        ))
    })));
    props.push(("max", Function::native("max", |_, _, args| {
        Ok(Value::Number(args.iter().map(Value::to_number).fold(
            f64::NEG_INFINITY,
            |acc, n| if n.is_nan() || acc.is_nan() { f64::NAN } else { acc.max(n) },
        )))
    })));
    props.push(("min", Function::native("min", |_, _, args| {
        Ok(Value::Number(args.iter().map(Value::to_number).fold(
            f64::INFINITY,
            |acc, n| if n.is_nan() || acc.is_nan() { f64::NAN } else { acc.min(n) },
        )))
    })));
    props.push(("random", Function::native("random", |_, _, _| {
        Ok(Value::Number(rand::random::<f64>()))
    })));
    Value::from_pairs(props)
}

// === Number ===

fn number_is_integer(_: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    Ok(Value::Bool(
        matches!(args.first(), Some(Value::Number(n)) if n.is_finite() && n.fract() == 0.0),
    ))
}

fn number_is_finite(_: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    Ok(Value::Bool(
        matches!(args.first(), Some(Value::Number(n)) if n.is_finite()),
    ))
}

fn number_is_nan(_: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    Ok(Value::Bool(
        matches!(args.first(), Some(Value::Number(n)) if n.is_nan()),
    ))
}

fn parse_int(_: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let text = arg(args, 0).to_js_string();
    let mut s = text.trim_start();
    let negative = s.starts_with('-');
    if s.starts_with('-') || s.starts_with('+') {
        s = &s[1..];
    }
    let mut radix = integer_arg(args, 1, 0.0) as u32;
    if (radix == 0 || radix == 16) && (s.starts_with("0x") || s.starts_with("0X")) {
        s = &s[2..];
        radix = 16;
    }
    if radix == 0 {
        radix = 10;
    }
    if !(2..=36).contains(&radix) {
        return Ok(Value::Number(f64::NAN));
    }
    let mut result: Option<f64> = None;
    for c in s.chars() {
        let Some(digit) = c.to_digit(radix) else { break };
        result = Some(result.unwrap_or(0.0) * f64::from(radix) + f64::from(digit));
    }
    Ok(Value::Number(match result {
        Some(n) if negative => -n,
        Some(n) => n,
        None => f64::NAN,
    }))
}

fn parse_float(_: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let text = arg(args, 0).to_js_string();
    let s = text.trim_start();
    let unsigned = s.trim_start_matches(['+', '-']);
    if unsigned.starts_with("Infinity") {
        let negative = s.starts_with('-');
        return Ok(Value::Number(if negative {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        }));
    }
    // Longest prefix that parses as a decimal literal.
    let bytes = s.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end = 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if end > digits_start && end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && matches!(bytes[exp_end], b'+' | b'-') {
            exp_end += 1;
        }
        let exp_digits = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits {
            end = exp_end;
        }
    }
    Ok(Value::Number(s[..end].parse().unwrap_or(f64::NAN)))
}

pub(crate) fn number_method(name: &str) -> Option<NativeFn> {
    let f: NativeFn = match name {
        "toFixed" => number_to_fixed,
        "toString" => number_to_string_method,
        "toPrecision" => number_to_precision,
        "toLocaleString" => number_to_locale_string,
        "valueOf" => |_, this, _| Ok(this.clone()),
        _ => return None,
    };
    Some(f)
}

fn to_fixed(n: f64, digits: usize) -> String {
    if !n.is_finite() || n.abs() >= 1e21 {
        return number_to_string(n);
    }
    let factor = 10f64.powi(digits as i32);
    let rounded = (n * factor).round() / factor;
    format!("{rounded:.digits$}")
}

fn number_to_fixed(interp: &mut Interpreter, this: &Value, args: &[Value]) -> Flow<Value> {
    let digits = integer_arg(args, 0, 0.0);
    if !(0.0..=100.0).contains(&digits) {
        return Err(interp.throw("RangeError", "toFixed() digits argument must be between 0 and 100"));
    }
    Ok(Value::from(to_fixed(this.to_number(), digits as usize)))
}

fn number_to_string_method(interp: &mut Interpreter, this: &Value, args: &[Value]) -> Flow<Value> {
    let radix = integer_arg(args, 0, 10.0);
    if !(2.0..=36.0).contains(&radix) {
        return Err(interp.throw("RangeError", "toString() radix must be between 2 and 36"));
    }
    Ok(Value::from(number_to_radix(this.to_number(), radix as u32)))
}

fn number_to_precision(interp: &mut Interpreter, this: &Value, args: &[Value]) -> Flow<Value> {
    let n = this.to_number();
    if matches!(args.first(), None | Some(Value::Undefined)) || !n.is_finite() {
        return Ok(Value::from(number_to_string(n)));
    }
    let precision = integer_arg(args, 0, 1.0);
    if !(1.0..=100.0).contains(&precision) {
        return Err(interp.throw("RangeError", "toPrecision() argument must be between 1 and 100"));
    }
    let precision = precision as i32;
    if n == 0.0 {
        return Ok(Value::from(to_fixed(0.0, (precision - 1) as usize)));
    }
    let exponent = n.abs().log10().floor() as i32;
    if exponent < -6 || exponent >= precision {
        let formatted = format!("{:.*e}", (precision - 1) as usize, n);
        let (mantissa, exp) = formatted.split_once('e').unwrap_or((&formatted, "0"));
        let sign = if exp.starts_with('-') { "" } else { "+" };
        return Ok(Value::from(format!("{mantissa}e{sign}{exp}")));
    }
    Ok(Value::from(to_fixed(n, (precision - 1 - exponent).max(0) as usize)))
}

fn number_to_locale_string(_: &mut Interpreter, this: &Value, _: &[Value]) -> Flow<Value> {
    let n = this.to_number();
    if !n.is_finite() {
        return Ok(Value::from(number_to_string(n)));
    }
    let fixed = to_fixed(n.abs(), 3);
    let (int, frac) = fixed.split_once('.').unwrap_or((&fixed, ""));
    let mut grouped = String::new();
    for (i, c) in int.chars().enumerate() {
        if i > 0 && (int.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    let frac = frac.trim_end_matches('0');
    let sign = if n < 0.0 { "-" } else { "" };
    Ok(Value::from(if frac.is_empty() {
        format!("{sign}{grouped}")
    } else {
        format!("{sign}{grouped}.{frac}")
    }))
}

// === Object ===

pub(crate) fn object_method(name: &str) -> Option<NativeFn> {
    let f: NativeFn = match name {
        "hasOwnProperty" => |_, this, args| {
            let key = arg(args, 0).to_property_key();
            Ok(Value::Bool(own_keys(this).contains(&key)))
        },
        "toString" => |_, this, _| Ok(Value::from(this.to_js_string())),
        "valueOf" => |_, this, _| Ok(this.clone()),
        _ => return None,
    };
    Some(f)
}

fn object_keys(_: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    Ok(Value::array(
        own_keys(&arg(args, 0)).into_iter().map(Value::Str).collect(),
    ))
}

fn object_values(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let target = arg(args, 0);
    let mut values = Vec::new();
    for key in own_keys(&target) {
        values.push(interp.get_property(&target, &key)?);
    }
    Ok(Value::array(values))
}

fn object_entries(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let target = arg(args, 0);
    let mut entries = Vec::new();
    for key in own_keys(&target) {
        let value = interp.get_property(&target, &key)?;
        entries.push(Value::array(vec![Value::Str(key), value]));
    }
    Ok(Value::array(entries))
}

fn object_assign(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let target = arg(args, 0);
    if target.is_nullish() {
        return Err(interp.throw("TypeError", "Cannot convert undefined or null to object"));
    }
    for source in args.iter().skip(1) {
        for key in own_keys(source) {
            let value = interp.get_property(source, &key)?;
            interp.set_property(&target, key, value)?;
        }
    }
    Ok(target)
}

fn object_freeze(_: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let target = arg(args, 0);
    if let Value::Object(object) = &target {
        object.borrow_mut().frozen = true;
    }
    Ok(target)
}

fn object_from_entries(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let entries = interp.iterate(&arg(args, 0))?;
    let mut object = Object::default();
    for entry in entries {
        let pair = interp.iterate(&entry)?;
        let key = pair.first().cloned().unwrap_or_default().to_property_key();
        object.set(key, pair.get(1).cloned().unwrap_or_default());
    }
    Ok(Value::object(object))
}

// === Function ===

pub(crate) fn function_method(name: &str) -> Option<NativeFn> {
    let f: NativeFn = match name {
        "call" => |interp, this, args| {
            let rest = args.get(1..).unwrap_or_default();
            interp.call(this, arg(args, 0), rest)
        },
        "apply" => |interp, this, args| {
            let list = match args.get(1) {
                None | Some(Value::Undefined | Value::Null) => Vec::new(),
                Some(list) => interp.iterate(list)?,
            };
            interp.call(this, arg(args, 0), &list)
        },
        "bind" => function_bind,
        "toString" => |_, this, _| Ok(Value::from(this.to_js_string())),
        _ => return None,
    };
    Some(f)
}

fn function_bind(_: &mut Interpreter, this: &Value, args: &[Value]) -> Flow<Value> {
    let target = this.clone();
    let bound_this = arg(args, 0);
    let bound_args = args.get(1..).map(<[Value]>::to_vec).unwrap_or_default();
    let name = match &target {
        Value::Function(f) => format!("bound {}", f.name),
        _ => "bound".into(),
    };
    Ok(Function::host(&name, move |interp, _, rest| {
        let mut all = bound_args.clone();
        all.extend_from_slice(rest);
        interp.call(&target, bound_this.clone(), &all)
    }))
}

// === Timers ===

fn schedule(interp: &mut Interpreter, args: &[Value], repeat: bool) -> Flow<Value> {
    let callback = callback(interp, args)?;
    let delay = args.get(1).map_or(0.0, Value::to_number);
    let extra = args.get(2..).map(<[Value]>::to_vec).unwrap_or_default();
    let id = interp.timers.schedule(callback, delay, extra, repeat);
    Ok(Value::Number(id as f64))
}

fn set_timeout(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    schedule(interp, args, false)
}

fn set_interval(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    schedule(interp, args, true)
}

fn clear_timer(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let id = number_arg(args, 0);
    if id.is_finite() && id >= 0.0 {
        interp.timers.cancel(id as u64);
    }
    Ok(Value::Undefined)
}

// === String ===

pub(crate) fn string_method(name: &str) -> Option<NativeFn> {
    let f: NativeFn = match name {
        "charAt" => |_, this, args| {
            let s = this_string(this);
            let index = integer_arg(args, 0, 0.0);
            Ok(Value::from(if index < 0.0 {
                String::new()
            } else {
                s.chars().nth(index as usize).map(String::from).unwrap_or_default()
            }))
        },
        "charCodeAt" | "codePointAt" => |_, this, args| {
            let s = this_string(this);
            let index = integer_arg(args, 0, 0.0);
            Ok(Value::Number(if index < 0.0 {
                f64::NAN
            } else {
                s.chars()
                    .nth(index as usize)
                    .map_or(f64::NAN, |c| f64::from(u32::from(c)))
            }))
        },
        "at" => |_, this, args| {
            let chars: Vec<char> = this_string(this).chars().collect();
            let index = integer_arg(args, 0, 0.0);
            let index = if index < 0.0 { chars.len() as f64 + index } else { index };
            Ok(if index < 0.0 {
                Value::Undefined
            } else {
                chars
                    .get(index as usize)
                    .map(|c| Value::from(c.to_string()))
                    .unwrap_or_default()
            })
        },
        "indexOf" => |_, this, args| {
            let s = this_string(this);
            let needle = arg(args, 0).to_js_string();
            let chars: Vec<char> = s.chars().collect();
            let from = (integer_arg(args, 1, 0.0).max(0.0) as usize).min(chars.len());
            let haystack: String = chars[from..].iter().collect();
            Ok(Value::Number(match haystack.find(&needle) {
                Some(byte) => (from + haystack[..byte].chars().count()) as f64,
                None => -1.0,
            }))
        },
        "lastIndexOf" => |_, this, args| {
            let s = this_string(this);
            let needle = arg(args, 0).to_js_string();
            Ok(Value::Number(match s.rfind(&needle) {
                Some(byte) => s[..byte].chars().count() as f64,
                None => -1.0,
            }))
        },
        "includes" => |_, this, args| {
            let needle = arg(args, 0).to_js_string();
            Ok(Value::Bool(this_string(this).contains(&needle)))
        },
        "startsWith" => |_, this, args| {
            let needle = arg(args, 0).to_js_string();
            let s: String = this_string(this)
                .chars()
                .skip(integer_arg(args, 1, 0.0).max(0.0) as usize)
                .collect();
            Ok(Value::Bool(s.starts_with(&needle)))
        },
        "endsWith" => |_, this, args| {
            let needle = arg(args, 0).to_js_string();
            let chars: Vec<char> = this_string(this).chars().collect();
            let end = relative_index(args, 1, chars.len(), chars.len() as f64);
            let s: String = chars[..end].iter().collect();
            Ok(Value::Bool(s.ends_with(&needle)))
        },
        "slice" => |_, this, args| {
            let chars: Vec<char> = this_string(this).chars().collect();
            let start = relative_index(args, 0, chars.len(), 0.0);
            let end = relative_index(args, 1, chars.len(), chars.len() as f64);
            Ok(Value::from(if start < end {
                chars[start..end].iter().collect::<String>()
            } else {
                String::new()
            }))
        },
        "substring" => |_, this, args| {
            let chars: Vec<char> = this_string(this).chars().collect();
            let len = chars.len() as f64;
            let a = integer_arg(args, 0, 0.0).clamp(0.0, len) as usize;
            let b = integer_arg(args, 1, len).clamp(0.0, len) as usize;
            let (start, end) = (a.min(b), a.max(b));
            Ok(Value::from(chars[start..end].iter().collect::<String>()))
        },
        "substr" => |_, this, args| {
            let chars: Vec<char> = this_string(this).chars().collect();
            let start = relative_index(args, 0, chars.len(), 0.0);
            let count = integer_arg(args, 1, chars.len() as f64).max(0.0) as usize;
            let end = (start + count).min(chars.len());
            Ok(Value::from(chars[start..end].iter().collect::<String>()))
        },
        "toUpperCase" | "toLocaleUpperCase" => {
            |_, this, _| Ok(Value::from(this_string(this).to_uppercase()))
        }
        "toLowerCase" | "toLocaleLowerCase" => {
            |_, this, _| Ok(Value::from(this_string(this).to_lowercase()))
        }
        "trim" => |_, this, _| Ok(Value::from(this_string(this).trim())),
        "trimStart" => |_, this, _| Ok(Value::from(this_string(this).trim_start())),
        "trimEnd" => |_, this, _| Ok(Value::from(this_string(this).trim_end())),
        "padStart" => |interp, this, args| pad(interp, this, args, true),
        "padEnd" => |interp, this, args| pad(interp, this, args, false),
        "repeat" => |interp, this, args| {
            let count = integer_arg(args, 0, 0.0);
            if !(0.0..).contains(&count) || count.is_infinite() {
                return Err(interp.throw("RangeError", format!("Invalid count value: {count}")));
            }
            let s = this_string(this);
            if s.is_empty() {
                return Ok(Value::Str(s));
            }
            interp.check_string_length_f64(s.len() as f64 * count)?;
            let chars: Vec<char> = s.chars().collect();
            let total = chars.len() * count as usize;
            Ok(Value::from(cycle_chars(interp, &chars, total)?))
        },
        "split" => string_split,
        "replace" => |interp, this, args| string_replace(interp, this, args, false),
        "replaceAll" => |interp, this, args| string_replace(interp, this, args, true),
        "concat" => |interp, this, args| {
            let mut s = this_string(this).to_string();
            for value in args {
                s.push_str(&value.to_js_string());
                interp.check_string_length(s.len())?;
            }
            Ok(Value::from(s))
        },
        "localeCompare" => |_, this, args| {
            let other = arg(args, 0).to_js_string();
            Ok(Value::Number(match (*this_string(this)).cmp(other.as_str()) {
                Ordering::Less => -1.0,
                Ordering::Equal => 0.0,
                Ordering::Greater => 1.0,
            }))
        },
        "toString" | "valueOf" => |_, this, _| Ok(Value::Str(this_string(this))),
        _ => return None,
    };
    Some(f)
}

fn pad(interp: &mut Interpreter, this: &Value, args: &[Value], start: bool) -> Flow<Value> {
    let s = this_string(this);
    let target = integer_arg(args, 0, 0.0).max(0.0);
    let filler: Vec<char> = match args.get(1) {
        None | Some(Value::Undefined) => vec![' '],
        Some(value) => value.to_js_string().chars().collect(),
    };
    let len = s.chars().count();
    if target <= len as f64 || filler.is_empty() {
        return Ok(Value::Str(s));
    }
    let widest = filler.iter().map(|c| c.len_utf8()).max().unwrap_or(1);
    interp.check_string_length_f64(s.len() as f64 + (target - len as f64) * widest as f64)?;
    let padding = cycle_chars(interp, &filler, target as usize - len)?;
    Ok(Value::from(if start {
        format!("{padding}{s}")
    } else {
        format!("{s}{padding}")
    }))
}

/// Builds `count` chars by cycling `chars`, checking the deadline as it goes.
fn cycle_chars(interp: &mut Interpreter, chars: &[char], count: usize) -> Flow<String> {
    let mut out = String::with_capacity(count);
    let mut source = chars.iter().cycle();
    let mut written = 0;
    while written < count {
        interp.tick()?;
        let chunk = (count - written).min(TICK_EVERY);
        out.extend(source.by_ref().take(chunk));
        written += chunk;
    }
    Ok(out)
}

fn string_from_char_code(_: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    Ok(Value::from(
        args.iter()
            .map(|code| char::from_u32(to_uint32(code.to_number()) & 0xFFFF).unwrap_or('\u{FFFD}'))
            .collect::<String>(),
    ))
}

fn string_split(_: &mut Interpreter, this: &Value, args: &[Value]) -> Flow<Value> {
    let s = this_string(this);
    let limit = match args.get(1) {
        None | Some(Value::Undefined) => usize::MAX,
        Some(value) => to_uint32(value.to_number()) as usize,
    };
    let parts: Vec<Value> = match args.first() {
        None | Some(Value::Undefined) => vec![Value::Str(s.clone())],
        Some(separator) => {
            let separator = separator.to_js_string();
            if separator.is_empty() {
                s.chars().map(|c| Value::from(c.to_string())).collect()
            } else {
                s.split(separator.as_str()).map(Value::from).collect()
            }
        }
    };
    Ok(Value::array(parts.into_iter().take(limit).collect()))
}

fn string_replace(interp: &mut Interpreter, this: &Value, args: &[Value], all: bool) -> Flow<Value> {
    let s = this_string(this);
    let pattern = arg(args, 0).to_js_string();
    let replacement = arg(args, 1);

    let mut out = String::new();
    let mut rest = 0;
    let mut search_from = 0;
    while search_from <= s.len() {
        let Some(found) = s[search_from..].find(&pattern).map(|i| i + search_from) else {
            break;
        };
        out.push_str(&s[rest..found]);
        let text = match &replacement {
            Value::Function(_) => {
                let offset = s[..found].chars().count() as f64;
                interp
                    .call(
                        &replacement,
                        Value::Undefined,
                        &[Value::from(pattern.as_str()), Value::Number(offset), Value::Str(s.clone())],
                    )?
                    .to_js_string()
            }
            other => other.to_js_string().replace("$&", &pattern),
        };
        out.push_str(&text);
        interp.check_string_length(out.len())?;
        interp.tick()?;
        rest = found + pattern.len();
        if !all {
            break;
        }
        // Empty patterns match between every character.
        search_from = if pattern.is_empty() {
            match s[found..].chars().next() {
                Some(c) => {
                    out.push(c);
                    rest = found + c.len_utf8();
                    found + c.len_utf8()
                }
                None => break,
            }
        } else {
            rest
        };
    }
    out.push_str(&s[rest.min(s.len())..]);
    Ok(Value::from(out))
}

// === Array ===

fn array_constructor(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    match args {
        [Value::Number(n)] => {
            if *n < 0.0 || n.fract() != 0.0 || *n > 1e7 {
                return Err(interp.throw("RangeError", "Invalid array length"));
            }
            Ok(Value::array(vec![Value::Undefined; *n as usize]))
        }
        _ => Ok(Value::array(args.to_vec())),
    }
}

fn array_from(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let source = arg(args, 0);
    let items = match &source {
        Value::Array(_) | Value::Str(_) => interp.iterate(&source)?,
        Value::Object(object) => {
            let len = object.borrow().get("length").map_or(0.0, |v| v.to_number());
            let len = if len.is_finite() && len > 0.0 { len.min(1e7) as usize } else { 0 };
            let mut items = Vec::with_capacity(len);
            for index in 0..len {
                items.push(interp.get_property(&source, &index.to_string())?);
            }
            items
        }
        _ => Vec::new(),
    };
    match args.get(1) {
        Some(map @ Value::Function(_)) => {
            let mut out = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                out.push(interp.call(map, Value::Undefined, &[item, Value::Number(index as f64)])?);
            }
            Ok(Value::array(out))
        }
        _ => Ok(Value::array(items)),
    }
}

pub(crate) fn array_method(name: &str) -> Option<NativeFn> {
    let f: NativeFn = match name {
        "push" => |interp, this, args| {
            let items = this_array(interp, this)?;
            let mut items = items.borrow_mut();
            items.extend_from_slice(args);
            Ok(Value::Number(items.len() as f64))
        },
        "pop" => |interp, this, _| {
            let items = this_array(interp, this)?;
            let popped = items.borrow_mut().pop();
            Ok(popped.unwrap_or_default())
        },
        "shift" => |interp, this, _| {
            let items = this_array(interp, this)?;
            let mut items = items.borrow_mut();
            Ok(if items.is_empty() {
                Value::Undefined
            } else {
                items.remove(0)
            })
        },
        "unshift" => |interp, this, args| {
            let items = this_array(interp, this)?;
            let mut items = items.borrow_mut();
            items.splice(0..0, args.iter().cloned());
            Ok(Value::Number(items.len() as f64))
        },
        "slice" => |interp, this, args| {
            let items = this_array(interp, this)?;
            let items = items.borrow();
            let start = relative_index(args, 0, items.len(), 0.0);
            let end = relative_index(args, 1, items.len(), items.len() as f64);
            Ok(Value::array(if start < end {
                items[start..end].to_vec()
            } else {
                Vec::new()
            }))
        },
        "splice" => array_splice,
        "concat" => |interp, this, args| {
            let items = this_array(interp, this)?;
            let mut out = items.borrow().clone();
            for value in args {
                match value {
                    Value::Array(more) => out.extend(more.borrow().iter().cloned()),
                    other => out.push(other.clone()),
                }
            }
            Ok(Value::array(out))
        },
        "join" => |interp, this, args| {
            let items = this_array(interp, this)?;
            let separator = match args.first() {
                None | Some(Value::Undefined) => ",".to_string(),
                Some(value) => value.to_js_string(),
            };
            let items = items.borrow().clone();
            join(interp, &items, &separator)
        },
        "toString" => |interp, this, _| {
            let items = this_array(interp, this)?;
            let items = items.borrow().clone();
            join(interp, &items, ",")
        },
        "reverse" => |interp, this, _| {
            this_array(interp, this)?.borrow_mut().reverse();
            Ok(this.clone())
        },
        "indexOf" => |interp, this, args| {
            let items = this_array(interp, this)?;
            let items = items.borrow();
            let needle = arg(args, 0);
            let from = relative_index(args, 1, items.len(), 0.0);
            Ok(Value::Number(
                items
                    .iter()
                    .skip(from)
                    .position(|item| item.strict_equals(&needle))
                    .map_or(-1.0, |i| (i + from) as f64),
            ))
        },
        "lastIndexOf" => |interp, this, args| {
            let items = this_array(interp, this)?;
            let needle = arg(args, 0);
            let found = items
                .borrow()
                .iter()
                .rposition(|item| item.strict_equals(&needle))
                .map_or(-1.0, |i| i as f64);
            Ok(Value::Number(found))
        },
        "includes" => |interp, this, args| {
            let items = this_array(interp, this)?;
            let needle = arg(args, 0);
            let found = items.borrow().iter().any(|item| item.same_value_zero(&needle));
            Ok(Value::Bool(found))
        },
        "at" => |interp, this, args| {
            let items = this_array(interp, this)?;
            let len = items.borrow().len() as f64;
            let index = integer_arg(args, 0, 0.0);
            let index = if index < 0.0 { len + index } else { index };
            Ok(if index < 0.0 {
                Value::Undefined
            } else {
                item_at(&items, index as usize).unwrap_or_default()
            })
        },
        "fill" => |interp, this, args| {
            let items = this_array(interp, this)?;
            let mut items = items.borrow_mut();
            let len = items.len();
            let start = relative_index(args, 1, len, 0.0);
            let end = relative_index(args, 2, len, len as f64);
            let value = arg(args, 0);
            for slot in items.iter_mut().take(end).skip(start) {
                *slot = value.clone();
            }
            Ok(this.clone())
        },
        "keys" => |interp, this, _| {
            let len = this_array(interp, this)?.borrow().len();
            Ok(Value::array((0..len).map(|i| Value::Number(i as f64)).collect()))
        },
        "values" => |interp, this, _| {
            let items = this_array(interp, this)?;
            let copy = items.borrow().clone();
            Ok(Value::array(copy))
        },
        "entries" => |interp, this, _| {
            let items = this_array(interp, this)?;
            let entries = items
                .borrow()
                .iter()
                .enumerate()
                .map(|(i, item)| Value::array(vec![Value::Number(i as f64), item.clone()]))
                .collect();
            Ok(Value::array(entries))
        },
        "forEach" => |interp, this, args| {
            visit(interp, this, args, |_, _, _| Ok(None))?;
            Ok(Value::Undefined)
        },
        "map" => |interp, this, args| {
            let mut out = Vec::new();
            visit(interp, this, args, |_, _, result| {
                out.push(result);
                Ok(None)
            })?;
            Ok(Value::array(out))
        },
        "filter" => |interp, this, args| {
            let mut out = Vec::new();
            visit(interp, this, args, |item, _, result| {
                if result.truthy() {
                    out.push(item);
                }
                Ok(None)
            })?;
            Ok(Value::array(out))
        },
        "find" => |interp, this, args| {
            let found = visit(interp, this, args, |item, _, result| {
                Ok(result.truthy().then_some(item))
            })?;
            Ok(found.unwrap_or_default())
        },
        "findIndex" => |interp, this, args| {
            let found = visit(interp, this, args, |_, index, result| {
                Ok(result.truthy().then(|| Value::Number(index as f64)))
            })?;
            Ok(found.unwrap_or(Value::Number(-1.0)))
        },
        "findLast" => |interp, this, args| find_last(interp, this, args, false),
        "findLastIndex" => |interp, this, args| find_last(interp, this, args, true),
        "some" => |interp, this, args| {
            let found = visit(interp, this, args, |_, _, result| {
                Ok(result.truthy().then_some(Value::Bool(true)))
            })?;
            Ok(found.unwrap_or(Value::Bool(false)))
        },
        "every" => |interp, this, args| {
            let found = visit(interp, this, args, |_, _, result| {
                Ok((!result.truthy()).then_some(Value::Bool(false)))
            })?;
            Ok(found.unwrap_or(Value::Bool(true)))
        },
        "flatMap" => |interp, this, args| {
            let mut out = Vec::new();
            visit(interp, this, args, |_, _, result| {
                match result {
                    Value::Array(inner) => out.extend(inner.borrow().iter().cloned()),
                    other => out.push(other),
                }
                Ok(None)
            })?;
            Ok(Value::array(out))
        },
        "reduce" => |interp, this, args| reduce(interp, this, args, false),
        "reduceRight" => |interp, this, args| reduce(interp, this, args, true),
        "sort" => |interp, this, args| {
            let items = this_array(interp, this)?;
            let comparator = arg(args, 0);
            let snapshot = items.borrow().clone();
            let sorted = merge_sort(interp, snapshot, &comparator)?;
            *items.borrow_mut() = sorted;
            Ok(this.clone())
        },
        "flat" => |interp, this, args| {
            let items = this_array(interp, this)?;
            let depth = integer_arg(args, 0, 1.0);
            let mut out = Vec::new();
            flatten(&items.borrow(), depth, &mut out);
            Ok(Value::array(out))
        },
        _ => return None,
    };
    Some(f)
}

fn join(interp: &mut Interpreter, items: &[Value], separator: &str) -> Flow<Value> {
    let mut out = String::new();
    for (index, item) in items.iter().enumerate() {
        if index % TICK_EVERY == 0 {
            interp.tick()?;
        }
        if index > 0 {
            out.push_str(separator);
        }
        match item {
            Value::Undefined | Value::Null => {}
            other => out.push_str(&other.to_js_string()),
        }
        interp.check_string_length(out.len())?;
    }
    Ok(Value::from(out))
}

/// Call the callback on each element in order. `step` sees the element, its
/// index and the callback result; returning `Some` stops early.
fn visit(
    interp: &mut Interpreter,
    this: &Value,
    args: &[Value],
    mut step: impl FnMut(Value, usize, Value) -> Flow<Option<Value>>,
) -> Flow<Option<Value>> {
    let items = this_array(interp, this)?;
    let callback = callback(interp, args)?;
    let this_arg = arg(args, 1);
    let mut index = 0;
    while let Some(item) = item_at(&items, index) {
        let result = interp.call(
            &callback,
            this_arg.clone(),
            &[item.clone(), Value::Number(index as f64), this.clone()],
        )?;
        if let Some(done) = step(item, index, result)? {
            return Ok(Some(done));
        }
        index += 1;
    }
    Ok(None)
}

fn find_last(interp: &mut Interpreter, this: &Value, args: &[Value], want_index: bool) -> Flow<Value> {
    let items = this_array(interp, this)?;
    let callback = callback(interp, args)?;
    let len = items.borrow().len();
    for index in (0..len).rev() {
        let item = item_at(&items, index).unwrap_or_default();
        let hit = interp
            .call(
                &callback,
                Value::Undefined,
                &[item.clone(), Value::Number(index as f64), this.clone()],
            )?
            .truthy();
        if hit {
            return Ok(if want_index {
                Value::Number(index as f64)
            } else {
                item
            });
        }
    }
    Ok(if want_index {
        Value::Number(-1.0)
    } else {
        Value::Undefined
    })
}

fn reduce(interp: &mut Interpreter, this: &Value, args: &[Value], right: bool) -> Flow<Value> {
    let items = this_array(interp, this)?;
    let callback = callback(interp, args)?;
    let len = items.borrow().len();
    let mut order: Box<dyn Iterator<Item = usize>> = if right {
        Box::new((0..len).rev())
    } else {
        Box::new(0..len)
    };
    let mut acc = match args.get(1) {
        Some(initial) => initial.clone(),
        None => match order.next() {
            Some(first) => item_at(&items, first).unwrap_or_default(),
            None => {
                return Err(interp.throw(
                    "TypeError",
                    "Reduce of empty array with no initial value",
                ))
            }
        },
    };
    for index in order {
        let Some(item) = item_at(&items, index) else { continue };
        acc = interp.call(
            &callback,
            Value::Undefined,
            &[acc, item, Value::Number(index as f64), this.clone()],
        )?;
    }
    Ok(acc)
}

fn array_splice(interp: &mut Interpreter, this: &Value, args: &[Value]) -> Flow<Value> {
    let items = this_array(interp, this)?;
    let mut items = items.borrow_mut();
    let len = items.len();
    let start = relative_index(args, 0, len, 0.0);
    let delete = match args.get(1) {
        None => len - start,
        Some(_) => (integer_arg(args, 1, 0.0).max(0.0) as usize).min(len - start),
    };
    let inserted = args.get(2..).unwrap_or_default().iter().cloned();
    let removed: Vec<Value> = items.splice(start..start + delete, inserted).collect();
    Ok(Value::array(removed))
}

fn flatten(items: &[Value], depth: f64, out: &mut Vec<Value>) {
    for item in items {
        match item {
            Value::Array(inner) if depth >= 1.0 => flatten(&inner.borrow(), depth - 1.0, out),
            other => out.push(other.clone()),
        }
    }
}

fn sort_compare(interp: &mut Interpreter, a: &Value, b: &Value, comparator: &Value) -> Flow<Ordering> {
    match (a, b) {
        (Value::Undefined, Value::Undefined) => return Ok(Ordering::Equal),
        (Value::Undefined, _) => return Ok(Ordering::Greater),
        (_, Value::Undefined) => return Ok(Ordering::Less),
        _ => {}
    }
    if let Value::Function(_) = comparator {
        let result = interp
            .call(comparator, Value::Undefined, &[a.clone(), b.clone()])?
            .to_number();
        return Ok(if result < 0.0 {
            Ordering::Less
        } else if result > 0.0 {
            Ordering::Greater
        } else {
            Ordering::Equal
        });
    }
    Ok(a.to_js_string().cmp(&b.to_js_string()))
}

/// Stable merge sort that tolerates inconsistent comparators.
fn merge_sort(interp: &mut Interpreter, mut items: Vec<Value>, comparator: &Value) -> Flow<Vec<Value>> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(interp, items, comparator)?;
    let right = merge_sort(interp, right, comparator)?;

    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    loop {
        let take_right = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => sort_compare(interp, r, l, comparator)? == Ordering::Less,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (None, None) => break,
        };
        let next = if take_right { right.next() } else { left.next() };
        merged.extend(next);
    }
    Ok(merged)
}
