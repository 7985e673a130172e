//! Minimal `React`, `ReactDOM` and `document` globals rendering to static HTML.
//!
//! Elements are plain objects tagged with the `ReactElement` class. Hook state
//! lives on the interpreter and is addressed by call order across the whole
//! tree, so every render must call hooks in the same order.

use crate::builtins::native_object;
use crate::interp::{own_keys, Env, Flow, Interpreter};
use crate::value::*;
use tree_sitter::{Node, Parser};

const ELEMENT_CLASS: &str = "ReactElement";
/// Value of `React.Fragment`.
const FRAGMENT: &str = "#fragment";
/// Re-renders allowed before state updates are considered runaway.
const MAX_RENDERS: usize = 25;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

const UNITLESS: &[&str] = &[
    "flex", "flexGrow", "flexShrink", "fontWeight", "lineHeight", "opacity", "order",
    "zIndex", "zoom",
];

#[derive(Default)]
struct Slot {
    value: Value,
    deps: Option<Vec<Value>>,
}

#[derive(Default)]
pub(crate) struct Hooks {
    slots: Vec<Slot>,
    cursor: usize,
    effects: Vec<Value>,
    dirty: bool,
    rendering: bool,
    root: Option<Value>,
}

pub(crate) fn install(_interp: &mut Interpreter, globals: &Env) {
    let hooks: [(&str, NativeFn); 7] = [
        ("useState", use_state),
        ("useReducer", use_reducer),
        ("useRef", use_ref),
        ("useMemo", use_memo),
        ("useCallback", use_callback),
        ("useEffect", use_effect),
        ("useLayoutEffect", use_effect),
    ];
    let mut react = vec![
        ("createElement", Function::native("createElement", create_element)),
        ("Fragment", Value::str(FRAGMENT)),
    ];
    for (name, f) in hooks {
        let hook = Function::native(name, f);
        // Imports are stripped, so hooks are reachable unqualified too.
        globals.define(name, hook.clone(), false);
        react.push((name, hook));
    }
    globals.define("React", Value::from_pairs(react), false);
    globals.define("Fragment", Value::str(FRAGMENT), false);
    globals.define(
        "ReactDOM",
        native_object(&[("createRoot", create_root), ("render", render_legacy)]),
        false,
    );
    globals.define(
        "document",
        native_object(&[("getElementById", get_element_by_id), ("querySelector", query_selector)]),
        false,
    );
}

/// `<script>` bodies in document order. Tag names match case-insensitively
/// and an unclosed script runs to the end of the document.
pub(crate) fn extract_scripts(html: &str) -> Vec<String> {
    let mut parser = Parser::new();
    if parser.set_language(&tree_sitter_html::LANGUAGE.into()).is_err() {
        return Vec::new();
    }
    let Some(tree) = parser.parse(html, None) else {
        return Vec::new();
    };

    let mut scripts = Vec::new();
    let mut cursor = tree.walk();
    loop {
        let node = cursor.node();
        if node.kind() == "script_element" {
            scripts.extend(script_body(html, node));
        } else if cursor.goto_first_child() {
            continue;
        }
        while !cursor.goto_next_sibling() {
            if !cursor.goto_parent() {
                return scripts;
            }
        }
    }
}

fn script_body(html: &str, element: Node<'_>) -> Option<String> {
    let mut cursor = element.walk();
    let parts: Vec<Node<'_>> = element.children(&mut cursor).collect();
    let start = parts.iter().find(|part| part.kind() == "start_tag")?;
    let end = parts
        .iter()
        .find(|part| part.kind() == "end_tag" && !part.is_missing())
        .map_or(element.end_byte(), |tag| tag.start_byte());
    html.get(start.end_byte()..end).map(str::to_string)
}

// === Elements ===

fn create_element(_: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let element_type = args.first().cloned().unwrap_or_default();
    let mut props = match args.get(1) {
        Some(Value::Object(object)) => object.borrow().clone(),
        _ => Object::default(),
    };
    props.class = None;
    props.frozen = false;
    let key = props.get("key").unwrap_or(Value::Null);
    match args.get(2..).unwrap_or_default() {
        [] => {}
        [child] => props.set("children".into(), child.clone()),
        children => props.set("children".into(), Value::array(children.to_vec())),
    }
    let mut element = Object::with_props(vec![
        ("type".into(), element_type),
        ("props".into(), Value::object(props)),
        ("key".into(), key),
    ]);
    element.class = Some(ELEMENT_CLASS.into());
    Ok(Value::object(element))
}

fn element_parts(node: &Value) -> Option<(Value, Value)> {
    let Value::Object(object) = node else { return None };
    let object = object.borrow();
    if object.class.as_deref() != Some(ELEMENT_CLASS) {
        return None;
    }
    Some((
        object.get("type").unwrap_or_default(),
        object.get("props").unwrap_or_default(),
    ))
}

fn render(interp: &mut Interpreter, node: &Value) -> Flow<String> {
    interp.tick()?;
    match node {
        Value::Undefined | Value::Null | Value::Bool(_) => Ok(String::new()),
        Value::Number(_) | Value::Str(_) => Ok(escape(&node.to_js_string())),
        Value::Array(items) => {
            let items = items.borrow().clone();
            let mut html = String::new();
            for item in &items {
                html.push_str(&render(interp, item)?);
            }
            Ok(html)
        }
        Value::Function(_) => Ok(String::new()),
        Value::Object(_) => match element_parts(node) {
            Some((element_type, props)) => render_element(interp, &element_type, &props),
            None => Ok(escape(&node.to_js_string())),
        },
    }
}

fn render_element(interp: &mut Interpreter, element_type: &Value, props: &Value) -> Flow<String> {
    let children = interp.get_property(props, "children")?;
    let tag = match element_type {
        Value::Function(_) => {
            let rendered = interp.call(element_type, Value::Undefined, &[props.clone()])?;
            return render(interp, &rendered);
        }
        Value::Str(tag) if &**tag == FRAGMENT => return render(interp, &children),
        Value::Str(tag) => tag.clone(),
        other => {
            return Err(interp.throw(
                "TypeError",
                format!("Element type is invalid: {}", other.to_js_string()),
            ))
        }
    };

    let mut html = format!("<{tag}");
    let mut inner_html = None;
    for key in own_keys(props) {
        let value = interp.get_property(props, &key)?;
        match &*key {
            "children" | "key" | "ref" => continue,
            "dangerouslySetInnerHTML" => {
                inner_html = Some(interp.get_property(&value, "__html")?.to_js_string());
                continue;
            }
            name if is_event_handler(name) => continue,
            _ => {}
        }
        let name = match &*key {
            "className" => "class",
            "htmlFor" => "for",
            other => other,
        };
        match &value {
            Value::Undefined | Value::Null | Value::Bool(false) | Value::Function(_) => {}
            Value::Bool(true) => {
                html.push(' ');
                html.push_str(name);
            }
            Value::Object(_) if name == "style" => {
                let style = style_text(interp, &value)?;
                if !style.is_empty() {
                    html.push_str(&format!(" style=\"{}\"", escape(&style)));
                }
            }
            other => html.push_str(&format!(" {name}=\"{}\"", escape(&other.to_js_string()))),
        }
    }

    if VOID_ELEMENTS.contains(&&*tag) {
        html.push_str("/>");
        return Ok(html);
    }
    html.push('>');
    match inner_html {
        Some(raw) => html.push_str(&raw),
        None => html.push_str(&render(interp, &children)?),
    }
    html.push_str(&format!("</{tag}>"));
    Ok(html)
}

fn is_event_handler(name: &str) -> bool {
    name.len() > 2 && name.starts_with("on") && name[2..].starts_with(|c: char| c.is_ascii_uppercase())
}

fn style_text(interp: &mut Interpreter, style: &Value) -> Flow<String> {
    let mut rules = Vec::new();
    for key in own_keys(style) {
        let value = interp.get_property(style, &key)?;
        let text = match &value {
            Value::Undefined | Value::Null | Value::Bool(_) => continue,
            Value::Number(n) if *n != 0.0 && !UNITLESS.contains(&&*key) => {
                format!("{}px", number_to_string(*n))
            }
            other => other.to_js_string(),
        };
        rules.push(format!("{}:{}", kebab_case(&key), text));
    }
    Ok(rules.join(";"))
}

fn kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            out.push('-');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

pub(crate) fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
    out
}

// === Roots ===

/// Containers are inert; only their identifying attribute is kept.
fn get_element_by_id(_: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let id = args.first().cloned().unwrap_or_default();
    Ok(Value::from_pairs([("id", id)]))
}

fn query_selector(_: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let selector = args.first().cloned().unwrap_or_default();
    Ok(Value::from_pairs([("selector", selector)]))
}

fn create_root(_: &mut Interpreter, _: &Value, _: &[Value]) -> Flow<Value> {
    Ok(native_object(&[("render", root_render), ("unmount", root_unmount)]))
}

fn root_render(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    mount(interp, args.first().cloned().unwrap_or_default())?;
    Ok(Value::Undefined)
}

fn root_unmount(interp: &mut Interpreter, _: &Value, _: &[Value]) -> Flow<Value> {
    interp.hooks = Hooks::default();
    interp.markup = Some(String::new());
    Ok(Value::Undefined)
}

fn render_legacy(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    mount(interp, args.first().cloned().unwrap_or_default())?;
    Ok(Value::Undefined)
}

fn mount(interp: &mut Interpreter, element: Value) -> Flow<()> {
    interp.hooks = Hooks::default();
    interp.hooks.root = Some(element);
    render_root(interp)
}

/// Render the mounted tree, then run effects, repeating while state changed.
fn render_root(interp: &mut Interpreter) -> Flow<()> {
    let Some(root) = interp.hooks.root.clone() else {
        return Ok(());
    };
    interp.hooks.rendering = true;
    let result = render_loop(interp, &root);
    interp.hooks.rendering = false;
    result
}

fn render_loop(interp: &mut Interpreter, root: &Value) -> Flow<()> {
    for _ in 0..MAX_RENDERS {
        interp.hooks.cursor = 0;
        interp.hooks.dirty = false;
        let html = render(interp, root)?;
        interp.markup = Some(html);
        for effect in std::mem::take(&mut interp.hooks.effects) {
            interp.call(&effect, Value::Undefined, &[])?;
        }
        if !interp.hooks.dirty {
            return Ok(());
        }
    }
    Err(interp.throw(
        "Error",
        "Too many re-renders. React limits the number of renders to prevent an infinite loop.",
    ))
}

// === Hooks ===

/// Claim the next hook slot; `true` when it was created by this call.
fn next_slot(interp: &mut Interpreter) -> (usize, bool) {
    let hooks = &mut interp.hooks;
    let index = hooks.cursor;
    hooks.cursor += 1;
    let fresh = index >= hooks.slots.len();
    if fresh {
        hooks.slots.push(Slot::default());
    }
    (index, fresh)
}

fn slot_value(interp: &Interpreter, index: usize) -> Value {
    interp
        .hooks
        .slots
        .get(index)
        .map(|slot| slot.value.clone())
        .unwrap_or_default()
}

fn set_slot(interp: &mut Interpreter, index: usize, value: Value) -> Flow<()> {
    let Some(slot) = interp.hooks.slots.get_mut(index) else {
        return Ok(());
    };
    if slot.value.same_value_zero(&value) {
        return Ok(());
    }
    slot.value = value;
    interp.hooks.dirty = true;
    if !interp.hooks.rendering {
        render_root(interp)?;
    }
    Ok(())
}

fn use_state(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let (index, fresh) = next_slot(interp);
    if fresh {
        let initial = match args.first() {
            Some(init @ Value::Function(_)) => interp.call(init, Value::Undefined, &[])?,
            Some(value) => value.clone(),
            None => Value::Undefined,
        };
        interp.hooks.slots[index].value = initial;
    }
    let setter = Function::host("setState", move |interp, _, args| {
        let next = match args.first() {
            Some(update @ Value::Function(_)) => {
                let current = slot_value(interp, index);
                interp.call(update, Value::Undefined, &[current])?
            }
            Some(value) => value.clone(),
            None => Value::Undefined,
        };
        set_slot(interp, index, next)?;
        Ok(Value::Undefined)
    });
    Ok(Value::array(vec![slot_value(interp, index), setter]))
}

fn use_reducer(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let (index, fresh) = next_slot(interp);
    let reducer = args.first().cloned().unwrap_or_default();
    if fresh {
        let initial = args.get(1).cloned().unwrap_or_default();
        let initial = match args.get(2) {
            Some(init @ Value::Function(_)) => interp.call(init, Value::Undefined, &[initial])?,
            _ => initial,
        };
        interp.hooks.slots[index].value = initial;
    }
    let dispatch = Function::host("dispatch", move |interp, _, args| {
        let current = slot_value(interp, index);
        let action = args.first().cloned().unwrap_or_default();
        let next = interp.call(&reducer, Value::Undefined, &[current, action])?;
        set_slot(interp, index, next)?;
        Ok(Value::Undefined)
    });
    Ok(Value::array(vec![slot_value(interp, index), dispatch]))
}

fn use_ref(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let (index, fresh) = next_slot(interp);
    if fresh {
        let initial = args.first().cloned().unwrap_or_default();
        interp.hooks.slots[index].value = Value::from_pairs([("current", initial)]);
    }
    Ok(slot_value(interp, index))
}

/// Record `deps` in the slot and report whether they differ from last render.
fn deps_changed(interp: &mut Interpreter, index: usize, deps: Option<&Value>) -> Flow<bool> {
    let next = match deps {
        None | Some(Value::Undefined) => None,
        Some(list) => Some(interp.iterate(list)?),
    };
    let slot = &mut interp.hooks.slots[index];
    let changed = match (&slot.deps, &next) {
        (Some(old), Some(new)) => {
            old.len() != new.len() || old.iter().zip(new).any(|(a, b)| !a.same_value_zero(b))
        }
        _ => true,
    };
    slot.deps = next;
    Ok(changed)
}

fn use_memo(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let (index, fresh) = next_slot(interp);
    if deps_changed(interp, index, args.get(1))? || fresh {
        let factory = args.first().cloned().unwrap_or_default();
        let value = interp.call(&factory, Value::Undefined, &[])?;
        interp.hooks.slots[index].value = value;
    }
    Ok(slot_value(interp, index))
}

fn use_callback(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let (index, fresh) = next_slot(interp);
    if deps_changed(interp, index, args.get(1))? || fresh {
        interp.hooks.slots[index].value = args.first().cloned().unwrap_or_default();
    }
    Ok(slot_value(interp, index))
}

fn use_effect(interp: &mut Interpreter, _: &Value, args: &[Value]) -> Flow<Value> {
    let (index, _) = next_slot(interp);
    if deps_changed(interp, index, args.get(1))? {
        if let Some(effect @ Value::Function(_)) = args.first() {
            interp.hooks.effects.push(effect.clone());
        }
    }
    Ok(Value::Undefined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_scripts_case_insensitive() {
        let html = "<p>hi</p><SCRIPT type=\"text/javascript\">a()</SCRIPT><script>b()</script>";
        assert_eq!(extract_scripts(html), vec!["a()".to_string(), "b()".into()]);
    }

    #[test]
    fn test_unclosed_script_runs_to_end() {
        assert_eq!(extract_scripts("<script>x = 1"), vec!["x = 1".to_string()]);
        assert!(extract_scripts("<p>no scripts</p>").is_empty());
    }

    #[test]
    fn test_commented_and_nested_scripts() {
        let html = "<!-- <script>skipped()</script> --><div><section><script>\nrun()\n</script></section></div>";
        assert_eq!(extract_scripts(html), vec!["\nrun()\n".to_string()]);
    }

    #[test]
    fn test_escape_and_kebab() {
        assert_eq!(escape("<a href=\"x\">&</a>"), "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;");
        assert_eq!(kebab_case("backgroundColor"), "background-color");
        assert!(is_event_handler("onClick"));
        assert!(!is_event_handler("one"));
    }
}
