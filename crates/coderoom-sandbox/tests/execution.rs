//! End-to-end runs through the public sandbox API.

use coderoom_sandbox::{ExecutionResult, Sandbox, SandboxConfig, SandboxError};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn run(source: &str, tag: &str) -> ExecutionResult {
    Sandbox::default().run(source, tag).unwrap()
}

fn lines(source: &str) -> Vec<String> {
    run(source, "javascript").output
}

#[test]
fn test_unsupported_language_runs_nothing() {
    let err = Sandbox::default().run("print(1)", "python").unwrap_err();
    assert_eq!(err, SandboxError::UnsupportedLanguage("python".into()));
}

#[test]
fn test_console_joins_arguments() {
    assert_eq!(
        lines("console.log(1 + 1); console.log('a', 2, true, null, undefined);"),
        vec!["2", "a 2 true null undefined"]
    );
}

#[test]
fn test_console_pretty_prints_objects() {
    let out = lines("console.log({ a: 1, b: [1, 2] });");
    assert_eq!(out, vec!["{\n  \"a\": 1,\n  \"b\": [\n    1,\n    2\n  ]\n}"]);

    let out = lines("console.log('list:', []); console.log(new Error('x'));");
    assert_eq!(out, vec!["list: []", "Error: x"]);
}

#[test]
fn test_language_features() {
    let source = r#"
        function counter() {
            let n = 0;
            return () => ++n;
        }
        const next = counter();
        next(); next();
        const { a, ...rest } = { a: 1, b: 2, c: 3 };
        const label = `n=${next()} a=${a} rest=${Object.keys(rest).join(",")}`;
        console.log(label);

        let total = 0;
        for (const x of [1, 2, 3, 4]) {
            if (x % 2 === 0) continue;
            total += x;
        }
        switch (total) {
            case 4: console.log("four"); break;
            default: console.log("other");
        }
        console.log(typeof null, typeof next, [1, [2, [3]]].flat(2).length);
    "#;
    assert_eq!(lines(source), vec!["n=3 a=1 rest=b,c", "four", "object function 3"]);
}

#[test]
fn test_builtin_helpers() {
    let source = r#"
        console.log([3, 1, 2].sort().map(x => x * 2).join("-"));
        console.log([1, 2, 3, 4].filter(n => n % 2 === 0).reduce((a, b) => a + b, 0));
        console.log(JSON.stringify({ a: [1, { b: null }] }));
        console.log((3.14159).toFixed(2), (255).toString(16), parseInt("42px"));
        console.log("a-b-c".split("-").reverse().join(""), "abc".toUpperCase().padStart(5, "*"));
        console.log(0.1 + 0.2, Math.max(1, 7, 3), Number.isInteger(5));
    "#;
    assert_eq!(
        lines(source),
        vec![
            "2-4-6",
            "6",
            r#"{"a":[1,{"b":null}]}"#,
            "3.14 ff 42",
            "cba **ABC",
            "0.30000000000000004 7 true",
        ]
    );
}

#[test]
fn test_uncaught_error_ends_run() {
    let out = lines("console.log('before'); throw new Error('boom'); console.log('after');");
    assert_eq!(out, vec!["before", "[Error] boom"]);

    let out = lines("const o = undefined; o.x;");
    assert_eq!(out, vec!["[Error] Cannot read properties of undefined (reading 'x')"]);
}

#[test]
fn test_caught_errors_keep_running() {
    let source = r#"
        try {
            null.f();
        } catch (e) {
            console.log(e instanceof TypeError, e.name);
        } finally {
            console.log("done");
        }
    "#;
    assert_eq!(lines(source), vec!["true TypeError", "done"]);
}

#[test]
fn test_runaway_recursion_raises_range_error() {
    let out = lines("function f() { return f(); } f();");
    assert_eq!(out, vec!["[Error] Maximum call stack size exceeded"]);

    let out = lines("function f() { return f(); } try { f(); } catch (e) { console.log(e.name); }");
    assert_eq!(out, vec!["RangeError"]);
}

#[test]
fn test_oversized_strings_raise_range_error() {
    let sandbox = Sandbox::new(SandboxConfig::default().with_timeout_ms(100));
    let started = Instant::now();
    let result = sandbox
        .run("console.log('x'.padStart(400000000).length);", "js")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!result.timed_out);
    assert_eq!(result.output, vec!["[Error] Invalid string length"]);

    let out = lines(
        r#"
        for (const grow of [
            () => "ab".repeat(1e9),
            () => "-".padEnd(Infinity),
            () => { let s = "x"; for (;;) s += s; },
            () => "ab".repeat(-1),
        ]) {
            try { grow(); } catch (e) { console.log(e.name, e.message); }
        }
        "#,
    );
    assert_eq!(
        out,
        vec![
            "RangeError Invalid string length",
            "RangeError Invalid string length",
            "RangeError Invalid string length",
            "RangeError Invalid count value: -1",
        ]
    );
}

#[test]
fn test_cyclic_array_prints_empty() {
    let out = lines("const a = [1]; a.push(a); console.log(`${a}|`);");
    assert_eq!(out, vec!["1,|"]);
}

#[test]
fn test_deeply_nested_source_is_rejected() {
    let depth = 200_000;
    let source = format!("console.log({}1{});", "(".repeat(depth), ")".repeat(depth));
    match Sandbox::default().run(&source, "js").unwrap_err() {
        SandboxError::Syntax { message, .. } => assert_eq!(message, "nesting too deep"),
        other => panic!("unexpected error: {other:?}"),
    }

    let source = format!("const x: number[] = {}0{};", "[".repeat(depth), "]".repeat(depth));
    match Sandbox::default().run(&source, "ts").unwrap_err() {
        SandboxError::Translation(message) => assert!(message.contains("nesting too deep")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_infinite_loop_times_out() {
    let sandbox = Sandbox::new(SandboxConfig::default().with_timeout_ms(100));
    let started = Instant::now();
    let result = sandbox.run("console.log('start'); while (true) {}", "js").unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(result.timed_out);
    assert_eq!(
        result.output,
        vec!["start", "[Execution stopped: timeout exceeded 100ms]"]
    );
}

#[test]
fn test_cancel_flag_stops_run() {
    let cancel = Arc::new(AtomicBool::new(true));
    let result = Sandbox::default()
        .run_with_cancel("while (true) {}", "js", cancel)
        .unwrap();
    assert!(result.timed_out);
}

#[test]
fn test_output_cap_is_exact() {
    let sandbox = Sandbox::new(SandboxConfig::default().with_max_output_bytes(12));
    let result = sandbox
        .run("for (let i = 0; i < 100; i++) console.log('abcd');", "js")
        .unwrap();

    assert!(result.truncated);
    assert!(!result.timed_out);
    assert_eq!(result.output, vec!["abcd", "abcd", "a"]);
    let bytes: usize = result.output.iter().map(|line| line.len() + 1).sum();
    assert_eq!(bytes, 12);
}

#[test]
fn test_timers_run_in_virtual_time_order() {
    let source = r#"
        setTimeout(() => console.log("late"), 20);
        setTimeout((word) => console.log(word), 10, "early");
        const id = setTimeout(() => console.log("never"), 5);
        clearTimeout(id);
        let ticks = 0;
        const interval = setInterval(() => {
            ticks++;
            if (ticks === 3) { clearInterval(interval); console.log("ticks", ticks); }
        }, 1);
        console.log("now");
    "#;
    assert_eq!(lines(source), vec!["now", "ticks 3", "early", "late"]);
}

#[test]
fn test_typescript_is_erased() {
    let source = r#"
        interface User { name: string; age?: number }
        type Id = string | number;
        enum Color { Red, Green = 5, Blue }
        function greet<T extends User>(user: T): string {
            return `hi ${user.name}`;
        }
        const n = (42 as unknown) as number;
        const id: Id = "u1";
        console.log(greet({ name: "ada" }), Color.Green, Color.Blue, Color[0], n!, id);
    "#;
    assert_eq!(run(source, "typescript").output, vec!["hi ada 5 6 Red 42 u1"]);
}

#[test]
fn test_translation_errors() {
    let err = Sandbox::default().run("let x: = 5;", "ts").unwrap_err();
    match err {
        SandboxError::Translation(message) => assert!(message.starts_with("Transpile Error:")),
        other => panic!("unexpected error: {other:?}"),
    }

    let err = Sandbox::default().run("console.log(1 +);", "js").unwrap_err();
    assert!(matches!(err, SandboxError::Syntax { line: 1, .. }));
}

#[test]
fn test_react_render_produces_markup() {
    let source = r#"
        import React, { useState, useEffect } from "react";

        function Badge({ label }: { label: string }) {
            return <span style={{ fontSize: 12, opacity: 0.5 }}>{label}</span>;
        }

        function App() {
            const [count, setCount] = useState(1);
            useEffect(() => {
                if (count < 3) setCount(count + 1);
            }, [count]);
            return (
                <div className="app">
                    <p>Count: {count}</p>
                    <Badge label="new" />
                    <input disabled onChange={() => {}} />
                </div>
            );
        }

        ReactDOM.createRoot(document.getElementById("root")).render(<App />);
        console.log("rendered");
    "#;
    let result = run(source, "react");
    assert_eq!(result.output, vec!["rendered"]);
    assert_eq!(
        result.markup.as_deref(),
        Some(
            "<div class=\"app\"><p>Count: 3</p>\
             <span style=\"font-size:12px;opacity:0.5\">new</span>\
             <input disabled/></div>"
        )
    );
}

#[test]
fn test_html_modes() {
    let blank = run("  \n ", "html");
    assert!(blank.is_empty());

    let passive = run("<h1>Hello</h1>", "html");
    assert!(passive.output.is_empty());
    assert_eq!(passive.markup.as_deref(), Some("<h1>Hello</h1>"));

    let inline = run("console.log('hi from html')", "html");
    assert_eq!(inline.output, vec!["hi from html"]);

    let page = "<p>x</p><script>console.log('a')</script>\
                <SCRIPT>throw new Error('bad')</SCRIPT><script>console.log('b')</script>";
    let scripted = run(page, "html");
    assert_eq!(scripted.output, vec!["a", "[Error] bad", "b"]);
    assert_eq!(scripted.markup.as_deref(), Some(page));
}

#[tokio::test]
async fn test_run_detached() {
    let sandbox = Sandbox::new(SandboxConfig::default().with_timeout_ms(200));
    let result = sandbox
        .run_detached("console.log('x'.repeat(3))".into(), "js")
        .await
        .unwrap();
    assert_eq!(result.output, vec!["xxx"]);

    let result = sandbox.run_detached("for (;;) {}".into(), "js").await.unwrap();
    assert!(result.timed_out);
    assert_eq!(
        result.output.last().map(String::as_str),
        Some("[Execution stopped: timeout exceeded 200ms]")
    );
}
