//! Tree-walking evaluator.
//!
//! Every statement, loop iteration and call goes through [`Interpreter::tick`],
//! which stops the run once the deadline passes or the cancel flag is raised.
//! Abrupt completions travel as [`Control`] in the error channel.

use crate::ast::*;
use crate::builtins;
use crate::config::SandboxConfig;
use crate::markup::Hooks;
use crate::output::OutputBuffer;
use crate::value::*;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a run stopped before completing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Halt {
    /// Deadline passed or the run was cancelled.
    Timeout,
    /// The output cap was reached.
    OutputLimit,
}

pub enum Control {
    Break,
    Continue,
    Return(Value),
    Throw(Value),
    Halt(Halt),
    /// A nullish `?.` link; caught at the enclosing chain boundary.
    ShortCircuit,
}

pub type Flow<T> = Result<T, Control>;

#[derive(Clone)]
pub struct Env(Rc<RefCell<Scope>>);

#[derive(Default)]
pub struct Scope {
    vars: HashMap<Rc<str>, Binding>,
    parent: Option<Env>,
    /// Function bodies and the global scope host `var` declarations.
    function: bool,
}

struct Binding {
    value: Value,
    mutable: bool,
}

enum Assigned {
    Done,
    Constant,
    Missing,
}

impl Env {
    fn root() -> Env {
        Env(Rc::new(RefCell::new(Scope {
            function: true,
            ..Scope::default()
        })))
    }

    pub fn define(&self, name: &str, value: Value, mutable: bool) {
        self.0
            .borrow_mut()
            .vars
            .insert(name.into(), Binding { value, mutable });
    }

    pub fn has_own(&self, name: &str) -> bool {
        self.0.borrow().vars.contains_key(name)
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut current = self.clone();
        loop {
            let next = {
                let scope = current.0.borrow();
                if let Some(binding) = scope.vars.get(name) {
                    return Some(binding.value.clone());
                }
                scope.parent.clone()
            };
            current = next?;
        }
    }

    fn assign(&self, name: &str, value: Value) -> Assigned {
        let mut current = self.clone();
        loop {
            let next = {
                let mut scope = current.0.borrow_mut();
                if let Some(binding) = scope.vars.get_mut(name) {
                    if !binding.mutable {
                        return Assigned::Constant;
                    }
                    binding.value = value;
                    return Assigned::Done;
                }
                scope.parent.clone()
            };
            match next {
                Some(parent) => current = parent,
                None => return Assigned::Missing,
            }
        }
    }

    fn function_scope(&self) -> Env {
        let mut current = self.clone();
        loop {
            let next = {
                let scope = current.0.borrow();
                if scope.function {
                    None
                } else {
                    scope.parent.clone()
                }
            };
            match next {
                Some(parent) => current = parent,
                None => return current,
            }
        }
    }
}

#[derive(Clone, Copy)]
enum BindMode {
    Declare(VarKind),
    Assign,
}

enum Reference {
    Name(String),
    Property(Value, Rc<str>),
}

pub(crate) struct Timer {
    id: u64,
    due: f64,
    seq: u64,
    callback: Value,
    args: Vec<Value>,
    interval: Option<f64>,
}

/// Virtual-time timer queue, drained after the main script.
#[derive(Default)]
pub(crate) struct Timers {
    queue: Vec<Timer>,
    next_id: u64,
    seq: u64,
    now: f64,
}

impl Timers {
    pub fn schedule(&mut self, callback: Value, delay: f64, args: Vec<Value>, repeat: bool) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.push(id, callback, delay, args, repeat.then_some(delay));
        id
    }

    fn push(&mut self, id: u64, callback: Value, delay: f64, args: Vec<Value>, interval: Option<f64>) {
        self.seq += 1;
        let delay = if delay.is_nan() { 0.0 } else { delay.max(0.0) };
        self.queue.push(Timer {
            id,
            due: self.now + delay,
            seq: self.seq,
            callback,
            args,
            interval,
        });
    }

    pub fn cancel(&mut self, id: u64) {
        self.queue.retain(|timer| timer.id != id);
    }

    fn pop_next(&mut self) -> Option<Timer> {
        let index = self
            .queue
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.due
                    .partial_cmp(&b.due)
                    .unwrap_or(Ordering::Equal)
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|(index, _)| index)?;
        Some(self.queue.swap_remove(index))
    }
}

pub struct Interpreter {
    pub(crate) globals: Env,
    output: OutputBuffer,
    deadline: Instant,
    cancel: Arc<AtomicBool>,
    max_depth: usize,
    depth: usize,
    /// Native recursion of `eval`/`exec`, across calls.
    nesting: usize,
    /// Every scope created, so closure cycles can be broken on drop.
    scopes: Vec<Weak<RefCell<Scope>>>,
    prune_at: usize,
    pub(crate) timers: Timers,
    pub(crate) hooks: Hooks,
    pub(crate) markup: Option<String>,
}

impl Interpreter {
    pub fn new(config: &SandboxConfig, cancel: Arc<AtomicBool>) -> Self {
        let mut interp = Self {
            globals: Env::root(),
            output: OutputBuffer::new(config.max_output_bytes),
            deadline: Instant::now() + Duration::from_millis(config.timeout_ms),
            cancel,
            max_depth: config.max_call_depth,
            depth: 0,
            nesting: 0,
            scopes: Vec::new(),
            prune_at: 1024,
            timers: Timers::default(),
            hooks: Hooks::default(),
            markup: None,
        };
        let globals = interp.globals.clone();
        builtins::install(&mut interp, &globals);
        interp
    }

    /// Run a parsed program in the global scope.
    pub fn run_program(&mut self, program: &[Stmt]) -> Flow<()> {
        let globals = self.globals.clone();
        match self.exec_block(program, &globals) {
            Err(Control::Break | Control::Continue | Control::Return(_) | Control::ShortCircuit) => {
                Ok(())
            }
            other => other,
        }
    }

    /// Fire pending timers in virtual-time order.
    pub fn run_timers(&mut self) -> Flow<()> {
        while let Some(timer) = self.timers.pop_next() {
            self.tick()?;
            self.timers.now = timer.due;
            if let Some(interval) = timer.interval {
                self.timers.push(
                    timer.id,
                    timer.callback.clone(),
                    interval.max(1.0),
                    timer.args.clone(),
                    Some(interval),
                );
            }
            self.call(&timer.callback, Value::Undefined, &timer.args)?;
        }
        Ok(())
    }

    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut OutputBuffer {
        &mut self.output
    }

    pub fn take_output(&mut self) -> OutputBuffer {
        std::mem::replace(&mut self.output, OutputBuffer::new(0))
    }

    pub fn print(&mut self, line: String) -> Flow<()> {
        if self.output.push(line) {
            Ok(())
        } else {
            Err(Control::Halt(Halt::OutputLimit))
        }
    }

    pub fn tick(&mut self) -> Flow<()> {
        if self.cancel.load(AtomicOrdering::Relaxed) || Instant::now() >= self.deadline {
            Err(Control::Halt(Halt::Timeout))
        } else {
            Ok(())
        }
    }

    pub fn throw(&self, class: &str, message: impl AsRef<str>) -> Control {
        Control::Throw(Value::error(class, message.as_ref()))
    }

    /// Strings longer than [`MAX_STRING_LENGTH`] bytes raise `RangeError`.
    pub(crate) fn check_string_length(&self, len: usize) -> Flow<()> {
        if len > MAX_STRING_LENGTH {
            Err(self.throw("RangeError", "Invalid string length"))
        } else {
            Ok(())
        }
    }

    pub(crate) fn check_string_length_f64(&self, len: f64) -> Flow<()> {
        if len.is_nan() || len > MAX_STRING_LENGTH as f64 {
            Err(self.throw("RangeError", "Invalid string length"))
        } else {
            Ok(())
        }
    }

    fn enter(&mut self) -> Flow<()> {
        if self.nesting >= MAX_NESTING {
            return Err(self.throw("RangeError", "Maximum call stack size exceeded"));
        }
        self.nesting += 1;
        Ok(())
    }

    pub(crate) fn scope(&mut self, parent: &Env, function: bool) -> Env {
        let env = Env(Rc::new(RefCell::new(Scope {
            vars: HashMap::new(),
            parent: Some(parent.clone()),
            function,
        })));
        self.scopes.push(Rc::downgrade(&env.0));
        if self.scopes.len() >= self.prune_at {
            self.scopes.retain(|scope| scope.strong_count() > 0);
            self.prune_at = (self.scopes.len() * 2).max(1024);
        }
        env
    }

    // === Statements ===

    fn exec_block(&mut self, stmts: &[Stmt], env: &Env) -> Flow<()> {
        for stmt in stmts {
            if let Stmt::Function(def) = stmt {
                let name = def.name.clone().unwrap_or_default();
                let closure = self.make_closure(def, env);
                env.define(&name, closure, true);
            }
        }
        for stmt in stmts {
            self.exec(stmt, env)?;
        }
        Ok(())
    }

    /// Run a loop body; `Ok(false)` when the loop should stop.
    fn loop_body(&mut self, body: &Stmt, env: &Env) -> Flow<bool> {
        match self.exec(body, env) {
            Ok(()) | Err(Control::Continue) => Ok(true),
            Err(Control::Break) => Ok(false),
            Err(other) => Err(other),
        }
    }

    fn exec(&mut self, stmt: &Stmt, env: &Env) -> Flow<()> {
        self.tick()?;
        self.enter()?;
        let result = self.exec_stmt(stmt, env);
        self.nesting -= 1;
        result
    }

    fn exec_stmt(&mut self, stmt: &Stmt, env: &Env) -> Flow<()> {
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr, env)?;
            }
            Stmt::Var { kind, decls } => {
                for (pattern, init) in decls {
                    let value = match init {
                        Some(expr) => self.eval(expr, env)?,
                        None => {
                            // `var x;` keeps an existing value.
                            if let (VarKind::Var, Pattern::Ident(name)) = (kind, pattern) {
                                if env.function_scope().has_own(name) {
                                    continue;
                                }
                            }
                            Value::Undefined
                        }
                    };
                    self.bind_pattern(pattern, value, env, BindMode::Declare(*kind))?;
                }
            }
            Stmt::Function(_) | Stmt::Empty => {}
            Stmt::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, env)?,
                    None => Value::Undefined,
                };
                return Err(Control::Return(value));
            }
            Stmt::If {
                test,
                then,
                otherwise,
            } => {
                if self.eval(test, env)?.truthy() {
                    self.exec(then, env)?;
                } else if let Some(otherwise) = otherwise {
                    self.exec(otherwise, env)?;
                }
            }
            Stmt::Block(body) => {
                let scope = self.scope(env, false);
                self.exec_block(body, &scope)?;
            }
            Stmt::While { test, body } => loop {
                self.tick()?;
                if !self.eval(test, env)?.truthy() || !self.loop_body(body, env)? {
                    break;
                }
            },
            Stmt::DoWhile { body, test } => loop {
                self.tick()?;
                if !self.loop_body(body, env)? || !self.eval(test, env)?.truthy() {
                    break;
                }
            },
            Stmt::For {
                init,
                test,
                update,
                body,
            } => self.exec_for(init.as_deref(), test.as_ref(), update.as_ref(), body, env)?,
            Stmt::ForOf {
                kind,
                pattern,
                iterable,
                body,
            } => {
                let iterable = self.eval(iterable, env)?;
                let items = self.iterate(&iterable)?;
                for item in items {
                    self.tick()?;
                    let scope = self.scope(env, false);
                    self.bind_pattern(pattern, item, &scope, BindMode::Declare(*kind))?;
                    if !self.loop_body(body, &scope)? {
                        break;
                    }
                }
            }
            Stmt::ForIn {
                kind,
                pattern,
                object,
                body,
            } => {
                let object = self.eval(object, env)?;
                for key in own_keys(&object) {
                    self.tick()?;
                    let scope = self.scope(env, false);
                    self.bind_pattern(pattern, Value::Str(key), &scope, BindMode::Declare(*kind))?;
                    if !self.loop_body(body, &scope)? {
                        break;
                    }
                }
            }
            Stmt::Break => return Err(Control::Break),
            Stmt::Continue => return Err(Control::Continue),
            Stmt::Throw(expr) => {
                let value = self.eval(expr, env)?;
                return Err(Control::Throw(value));
            }
            Stmt::Try {
                block,
                param,
                handler,
                finalizer,
            } => {
                let scope = self.scope(env, false);
                let result = match (self.exec_block(block, &scope), handler) {
                    (Err(Control::Throw(error)), Some(handler)) => {
                        let scope = self.scope(env, false);
                        match param {
                            Some(param) => self
                                .bind_pattern(param, error, &scope, BindMode::Declare(VarKind::Let))
                                .and_then(|()| self.exec_block(handler, &scope)),
                            None => self.exec_block(handler, &scope),
                        }
                    }
                    (other, _) => other,
                };
                if let Some(finalizer) = finalizer {
                    if !matches!(result, Err(Control::Halt(_))) {
                        let scope = self.scope(env, false);
                        self.exec_block(finalizer, &scope)?;
                    }
                }
                result?;
            }
            Stmt::Switch {
                discriminant,
                cases,
            } => {
                let value = self.eval(discriminant, env)?;
                let scope = self.scope(env, false);
                let mut start = None;
                for (index, case) in cases.iter().enumerate() {
                    if let Some(test) = &case.test {
                        if self.eval(test, &scope)?.strict_equals(&value) {
                            start = Some(index);
                            break;
                        }
                    }
                }
                let start = start.or_else(|| cases.iter().position(|case| case.test.is_none()));
                if let Some(start) = start {
                    for case in &cases[start..] {
                        match self.exec_block(&case.body, &scope) {
                            Ok(()) => {}
                            Err(Control::Break) => break,
                            Err(other) => return Err(other),
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn exec_for(
        &mut self,
        init: Option<&Stmt>,
        test: Option<&Expr>,
        update: Option<&Expr>,
        body: &Stmt,
        env: &Env,
    ) -> Flow<()> {
        let scope = self.scope(env, false);
        // `let` bindings get a fresh copy per iteration so closures capture
        // the value of their own iteration.
        let mut per_iteration: Vec<String> = Vec::new();
        if let Some(init) = init {
            if let Stmt::Var {
                kind: VarKind::Let | VarKind::Const,
                decls,
            } = init
            {
                for (pattern, _) in decls {
                    pattern_names(pattern, &mut per_iteration);
                }
            }
            self.exec(init, &scope)?;
        }

        loop {
            self.tick()?;
            if let Some(test) = test {
                if !self.eval(test, &scope)?.truthy() {
                    break;
                }
            }
            let keep_going = if per_iteration.is_empty() {
                self.loop_body(body, &scope)?
            } else {
                let iteration = self.scope(&scope, false);
                for name in &per_iteration {
                    let value = scope.lookup(name).unwrap_or_default();
                    iteration.define(name, value, true);
                }
                let keep_going = self.loop_body(body, &iteration)?;
                for name in &per_iteration {
                    if let Some(value) = iteration.lookup(name) {
                        scope.assign(name, value);
                    }
                }
                keep_going
            };
            if !keep_going {
                break;
            }
            if let Some(update) = update {
                self.eval(update, &scope)?;
            }
        }
        Ok(())
    }

    // === Bindings ===

    fn bind_pattern(&mut self, pattern: &Pattern, value: Value, env: &Env, mode: BindMode) -> Flow<()> {
        match pattern {
            Pattern::Ident(name) => self.bind_name(name, value, env, mode),
            Pattern::Object { props, rest } => {
                if value.is_nullish() {
                    return Err(self.throw(
                        "TypeError",
                        format!("Cannot destructure '{}' as it is {}.", value.to_js_string(), value.to_js_string()),
                    ));
                }
                let mut used = Vec::new();
                for prop in props {
                    let key = self.prop_key(&prop.key, env)?;
                    let mut item = self.get_property(&value, &key)?;
                    if let (Value::Undefined, Some(default)) = (&item, &prop.default) {
                        item = self.eval(default, env)?;
                    }
                    self.bind_pattern(&prop.value, item, env, mode)?;
                    used.push(key);
                }
                if let Some(rest) = rest {
                    let mut remaining = Object::default();
                    for key in own_keys(&value) {
                        if !used.contains(&key) {
                            let item = self.get_property(&value, &key)?;
                            remaining.set(key, item);
                        }
                    }
                    self.bind_name(rest, Value::object(remaining), env, mode)?;
                }
                Ok(())
            }
            Pattern::Array { elems, rest } => {
                let items = self.iterate(&value)?;
                for (index, elem) in elems.iter().enumerate() {
                    let Some(elem) = elem else { continue };
                    let mut item = items.get(index).cloned().unwrap_or_default();
                    if let (Value::Undefined, Some(default)) = (&item, &elem.default) {
                        item = self.eval(default, env)?;
                    }
                    self.bind_pattern(&elem.pattern, item, env, mode)?;
                }
                if let Some(rest) = rest {
                    let tail = items.get(elems.len()..).map(<[Value]>::to_vec).unwrap_or_default();
                    self.bind_pattern(rest, Value::array(tail), env, mode)?;
                }
                Ok(())
            }
        }
    }

    fn bind_name(&mut self, name: &str, value: Value, env: &Env, mode: BindMode) -> Flow<()> {
        match mode {
            BindMode::Declare(VarKind::Var) => env.function_scope().define(name, value, true),
            BindMode::Declare(VarKind::Let) => env.define(name, value, true),
            BindMode::Declare(VarKind::Const) => env.define(name, value, false),
            BindMode::Assign => return self.assign_name(name, value, env),
        }
        Ok(())
    }

    fn assign_name(&mut self, name: &str, value: Value, env: &Env) -> Flow<()> {
        match env.assign(name, value.clone()) {
            Assigned::Done => Ok(()),
            Assigned::Constant => Err(self.throw("TypeError", "Assignment to constant variable.")),
            Assigned::Missing => {
                self.globals.define(name, value, true);
                Ok(())
            }
        }
    }

    fn prop_key(&mut self, key: &PropKey, env: &Env) -> Flow<Rc<str>> {
        match key {
            PropKey::Static(name) => Ok(name.as_str().into()),
            PropKey::Computed(expr) => Ok(self.eval(expr, env)?.to_property_key()),
        }
    }

    fn resolve(&mut self, target: &Expr, env: &Env) -> Flow<Reference> {
        match target {
            Expr::Ident(name) => Ok(Reference::Name(name.clone())),
            Expr::Member {
                object, property, ..
            } => {
                let object = self.eval(object, env)?;
                let key = self.member_key(property, env)?;
                Ok(Reference::Property(object, key))
            }
            _ => Err(self.throw("SyntaxError", "Invalid left-hand side in assignment")),
        }
    }

    fn read(&mut self, reference: &Reference, env: &Env) -> Flow<Value> {
        match reference {
            Reference::Name(name) => self.lookup(name, env),
            Reference::Property(object, key) => self.get_property(object, key),
        }
    }

    fn write(&mut self, reference: &Reference, value: Value, env: &Env) -> Flow<()> {
        match reference {
            Reference::Name(name) => self.assign_name(name, value, env),
            Reference::Property(object, key) => self.set_property(object, key.clone(), value),
        }
    }

    fn lookup(&self, name: &str, env: &Env) -> Flow<Value> {
        env.lookup(name)
            .ok_or_else(|| self.throw("ReferenceError", format!("{name} is not defined")))
    }

    fn member_key(&mut self, property: &MemberProp, env: &Env) -> Flow<Rc<str>> {
        match property {
            MemberProp::Static(name) => Ok(name.as_str().into()),
            MemberProp::Computed(expr) => Ok(self.eval(expr, env)?.to_property_key()),
        }
    }

    pub(crate) fn make_closure(&mut self, def: &Rc<FunctionDef>, env: &Env) -> Value {
        Value::Function(Rc::new(Function {
            name: def.name.as_deref().unwrap_or_default().into(),
            kind: FunctionKind::Closure {
                def: def.clone(),
                env: env.clone(),
            },
            props: RefCell::new(Object::default()),
        }))
    }

    // === Expressions ===

    pub(crate) fn eval(&mut self, expr: &Expr, env: &Env) -> Flow<Value> {
        self.enter()?;
        let result = self.eval_expr(expr, env);
        self.nesting -= 1;
        result
    }

    fn eval_expr(&mut self, expr: &Expr, env: &Env) -> Flow<Value> {
        Ok(match expr {
            Expr::Num(n) => Value::Number(*n),
            Expr::Str(s) => Value::str(s.as_str()),
            Expr::Template { quasis, exprs } => {
                let mut out = String::new();
                for (index, quasi) in quasis.iter().enumerate() {
                    out.push_str(quasi);
                    if let Some(expr) = exprs.get(index) {
                        out.push_str(&self.eval(expr, env)?.to_js_string());
                        self.check_string_length(out.len())?;
                    }
                }
                Value::from(out)
            }
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Null => Value::Null,
            Expr::Undefined => Value::Undefined,
            Expr::Ident(name) => self.lookup(name, env)?,
            Expr::This => env.lookup("this").unwrap_or_default(),
            Expr::Array(elems) => Value::array(self.eval_elems(elems, env)?),
            Expr::Object(props) => {
                let mut object = Object::default();
                for prop in props {
                    match prop {
                        Prop::KeyValue(key, value) => {
                            let key = self.prop_key(key, env)?;
                            let value = self.eval(value, env)?;
                            object.set(key, value);
                        }
                        Prop::Spread(source) => {
                            let source = self.eval(source, env)?;
                            for key in own_keys(&source) {
                                let value = self.get_property(&source, &key)?;
                                object.set(key, value);
                            }
                        }
                    }
                }
                Value::object(object)
            }
            Expr::Function(def) => self.make_closure(def, env),
            Expr::Unary(op, operand) => self.eval_unary(*op, operand, env)?,
            Expr::Update {
                increment,
                prefix,
                target,
            } => {
                let reference = self.resolve(target, env)?;
                let old = self.read(&reference, env)?.to_number();
                let new = if *increment { old + 1.0 } else { old - 1.0 };
                self.write(&reference, Value::Number(new), env)?;
                Value::Number(if *prefix { new } else { old })
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left, env)?;
                let right = self.eval(right, env)?;
                self.binary(*op, &left, &right)?
            }
            Expr::Logical(op, left, right) => {
                let left = self.eval(left, env)?;
                let short = match op {
                    LogicalOp::And => !left.truthy(),
                    LogicalOp::Or => left.truthy(),
                    LogicalOp::Nullish => !left.is_nullish(),
                };
                if short {
                    left
                } else {
                    self.eval(right, env)?
                }
            }
            Expr::Assign { op, target, value } => {
                let reference = self.resolve(target, env)?;
                let value = match op {
                    None => self.eval(value, env)?,
                    Some(op) => {
                        let current = self.read(&reference, env)?;
                        let rhs = self.eval(value, env)?;
                        self.binary(*op, &current, &rhs)?
                    }
                };
                self.write(&reference, value.clone(), env)?;
                value
            }
            Expr::LogicalAssign { op, target, value } => {
                let reference = self.resolve(target, env)?;
                let current = self.read(&reference, env)?;
                let assign = match op {
                    LogicalOp::And => current.truthy(),
                    LogicalOp::Or => !current.truthy(),
                    LogicalOp::Nullish => current.is_nullish(),
                };
                if assign {
                    let value = self.eval(value, env)?;
                    self.write(&reference, value.clone(), env)?;
                    value
                } else {
                    current
                }
            }
            Expr::Destructure { pattern, value } => {
                let value = self.eval(value, env)?;
                self.bind_pattern(pattern, value.clone(), env, BindMode::Assign)?;
                value
            }
            Expr::Conditional(test, then, otherwise) => {
                if self.eval(test, env)?.truthy() {
                    self.eval(then, env)?
                } else {
                    self.eval(otherwise, env)?
                }
            }
            Expr::Call {
                callee,
                args,
                optional,
            } => {
                let (function, this) = match callee.as_ref() {
                    Expr::Member {
                        object,
                        property,
                        optional: member_optional,
                    } => {
                        let object = self.eval(object, env)?;
                        if *member_optional && object.is_nullish() {
                            return Err(Control::ShortCircuit);
                        }
                        let key = self.member_key(property, env)?;
                        (self.get_property(&object, &key)?, object)
                    }
                    other => (self.eval(other, env)?, Value::Undefined),
                };
                if *optional && function.is_nullish() {
                    return Err(Control::ShortCircuit);
                }
                let args = self.eval_elems(args, env)?;
                if !matches!(function, Value::Function(_)) {
                    return Err(self.throw(
                        "TypeError",
                        format!("{} is not a function", describe(callee)),
                    ));
                }
                self.call(&function, this, &args)?
            }
            Expr::New { callee, args } => {
                let constructor = self.eval(callee, env)?;
                let args = self.eval_elems(args, env)?;
                self.construct(&constructor, &args, callee)?
            }
            Expr::Member {
                object,
                property,
                optional,
            } => {
                let object = self.eval(object, env)?;
                if *optional && object.is_nullish() {
                    return Err(Control::ShortCircuit);
                }
                if let (Value::Array(items), MemberProp::Computed(key)) = (&object, property) {
                    let key = self.eval(key, env)?;
                    if let Some(index) = key.as_f64().and_then(as_index) {
                        return Ok(items.borrow().get(index).cloned().unwrap_or_default());
                    }
                    return self.get_property(&object, &key.to_property_key());
                }
                let key = self.member_key(property, env)?;
                self.get_property(&object, &key)?
            }
            Expr::OptionalChain(inner) => match self.eval(inner, env) {
                Err(Control::ShortCircuit) => Value::Undefined,
                other => other?,
            },
            Expr::Sequence(exprs) => {
                let mut last = Value::Undefined;
                for expr in exprs {
                    last = self.eval(expr, env)?;
                }
                last
            }
        })
    }

    fn eval_elems(&mut self, elems: &[Elem], env: &Env) -> Flow<Vec<Value>> {
        let mut out = Vec::with_capacity(elems.len());
        for elem in elems {
            match elem {
                Elem::Expr(expr) => out.push(self.eval(expr, env)?),
                Elem::Spread(expr) => {
                    let value = self.eval(expr, env)?;
                    out.extend(self.iterate(&value)?);
                }
                Elem::Hole => out.push(Value::Undefined),
            }
        }
        Ok(out)
    }

    fn eval_unary(&mut self, op: UnaryOp, operand: &Expr, env: &Env) -> Flow<Value> {
        match op {
            UnaryOp::Typeof => {
                if let Expr::Ident(name) = operand {
                    if env.lookup(name).is_none() {
                        return Ok(Value::str("undefined"));
                    }
                }
                Ok(Value::str(self.eval(operand, env)?.type_of()))
            }
            UnaryOp::Delete => {
                if let Expr::Member {
                    object, property, ..
                } = operand
                {
                    let object = self.eval(object, env)?;
                    let key = self.member_key(property, env)?;
                    return Ok(Value::Bool(match &object {
                        Value::Object(o) => {
                            let mut o = o.borrow_mut();
                            !o.frozen && {
                                o.remove(&key);
                                true
                            }
                        }
                        Value::Array(items) => {
                            if let Some(index) = array_index(&key) {
                                if let Some(slot) = items.borrow_mut().get_mut(index) {
                                    *slot = Value::Undefined;
                                }
                            }
                            true
                        }
                        _ => true,
                    }));
                }
                self.eval(operand, env)?;
                Ok(Value::Bool(true))
            }
            _ => {
                let value = self.eval(operand, env)?;
                Ok(match op {
                    UnaryOp::Neg => Value::Number(-value.to_number()),
                    UnaryOp::Plus => Value::Number(value.to_number()),
                    UnaryOp::Not => Value::Bool(!value.truthy()),
                    UnaryOp::BitNot => Value::Number(f64::from(!value.to_int32())),
                    _ => Value::Undefined,
                })
            }
        }
    }

    pub(crate) fn binary(&mut self, op: BinOp, a: &Value, b: &Value) -> Flow<Value> {
        let number = |n: f64| Ok(Value::Number(n));
        match op {
            BinOp::Add => {
                if a.is_string_like() || b.is_string_like() {
                    let (mut s, tail) = (a.to_js_string(), b.to_js_string());
                    self.check_string_length(s.len() + tail.len())?;
                    s.push_str(&tail);
                    Ok(Value::from(s))
                } else {
                    number(a.to_number() + b.to_number())
                }
            }
            BinOp::Sub => number(a.to_number() - b.to_number()),
            BinOp::Mul => number(a.to_number() * b.to_number()),
            BinOp::Div => number(a.to_number() / b.to_number()),
            BinOp::Rem => number(a.to_number() % b.to_number()),
            BinOp::Exp => {
                let (base, exp) = (a.to_number(), b.to_number());
                if exp.is_nan() {
                    number(f64::NAN)
                } else {
                    number(base.powf(exp))
                }
            }
            BinOp::Eq => Ok(Value::Bool(a.loose_equals(b))),
            BinOp::NotEq => Ok(Value::Bool(!a.loose_equals(b))),
            BinOp::StrictEq => Ok(Value::Bool(a.strict_equals(b))),
            BinOp::StrictNotEq => Ok(Value::Bool(!a.strict_equals(b))),
            BinOp::Lt => Ok(Value::Bool(compare(a, b) == Some(Ordering::Less))),
            BinOp::Gt => Ok(Value::Bool(compare(a, b) == Some(Ordering::Greater))),
            BinOp::LtEq => Ok(Value::Bool(matches!(
                compare(a, b),
                Some(Ordering::Less | Ordering::Equal)
            ))),
            BinOp::GtEq => Ok(Value::Bool(matches!(
                compare(a, b),
                Some(Ordering::Greater | Ordering::Equal)
            ))),
            BinOp::BitAnd => number(f64::from(a.to_int32() & b.to_int32())),
            BinOp::BitOr => number(f64::from(a.to_int32() | b.to_int32())),
            BinOp::BitXor => number(f64::from(a.to_int32() ^ b.to_int32())),
            BinOp::Shl => number(f64::from(a.to_int32().wrapping_shl(to_uint32(b.to_number()) & 31))),
            BinOp::Shr => number(f64::from(a.to_int32() >> (to_uint32(b.to_number()) & 31))),
            BinOp::UShr => number(f64::from(
                to_uint32(a.to_number()) >> (to_uint32(b.to_number()) & 31),
            )),
            BinOp::In => {
                let key = a.to_property_key();
                match b {
                    Value::Object(o) => Ok(Value::Bool(o.borrow().has(&key))),
                    Value::Array(items) => Ok(Value::Bool(
                        &*key == "length"
                            || array_index(&key).is_some_and(|i| i < items.borrow().len()),
                    )),
                    Value::Function(f) => Ok(Value::Bool(f.props.borrow().has(&key))),
                    other => Err(self.throw(
                        "TypeError",
                        format!(
                            "Cannot use 'in' operator to search for '{key}' in {}",
                            other.to_js_string()
                        ),
                    )),
                }
            }
            BinOp::InstanceOf => {
                let Value::Function(constructor) = b else {
                    return Err(self.throw(
                        "TypeError",
                        "Right-hand side of 'instanceof' is not callable",
                    ));
                };
                let name = &*constructor.name;
                Ok(Value::Bool(match a {
                    Value::Array(_) => name == "Array" || name == "Object",
                    Value::Function(_) => name == "Function" || name == "Object",
                    Value::Object(o) => {
                        let o = o.borrow();
                        match o.class.as_deref() {
                            _ if name == "Object" => true,
                            Some(class) if name == "Error" => is_error_class(class) || class == name,
                            Some(class) => class == name,
                            None => false,
                        }
                    }
                    _ => false,
                }))
            }
        }
    }

    // === Calls ===

    pub fn call(&mut self, callee: &Value, this: Value, args: &[Value]) -> Flow<Value> {
        let Value::Function(function) = callee else {
            return Err(self.throw(
                "TypeError",
                format!("{} is not a function", callee.to_js_string()),
            ));
        };
        let function = function.clone();
        self.tick()?;
        if self.depth >= self.max_depth {
            return Err(self.throw("RangeError", "Maximum call stack size exceeded"));
        }
        self.depth += 1;
        let result = match &function.kind {
            FunctionKind::Closure { def, env } => {
                self.call_closure(&function, def, env, this, args)
            }
            FunctionKind::Native(native) => native(self, &this, args),
            FunctionKind::Host(host) => host(self, &this, args),
        };
        self.depth -= 1;
        result
    }

    fn call_closure(
        &mut self,
        function: &Rc<Function>,
        def: &FunctionDef,
        env: &Env,
        this: Value,
        args: &[Value],
    ) -> Flow<Value> {
        let scope = self.scope(env, true);
        if let Some(name) = &def.name {
            scope.define(name, Value::Function(function.clone()), true);
        }
        if !def.is_arrow {
            scope.define("this", this, false);
        }
        for (index, param) in def.params.iter().enumerate() {
            let mut value = if param.rest {
                Value::array(args.get(index..).map(<[Value]>::to_vec).unwrap_or_default())
            } else {
                args.get(index).cloned().unwrap_or_default()
            };
            if let (Value::Undefined, Some(default)) = (&value, &param.default) {
                value = self.eval(default, &scope)?;
            }
            self.bind_pattern(&param.pattern, value, &scope, BindMode::Declare(VarKind::Let))?;
        }
        match &def.body {
            FunctionBody::Expr(expr) => self.eval(expr, &scope),
            FunctionBody::Block(body) => match self.exec_block(body, &scope) {
                Ok(()) => Ok(Value::Undefined),
                Err(Control::Return(value)) => Ok(value),
                Err(Control::Break | Control::Continue | Control::ShortCircuit) => {
                    Ok(Value::Undefined)
                }
                Err(other) => Err(other),
            },
        }
    }

    fn construct(&mut self, constructor: &Value, args: &[Value], callee: &Expr) -> Flow<Value> {
        let Value::Function(function) = constructor else {
            return Err(self.throw(
                "TypeError",
                format!("{} is not a constructor", describe(callee)),
            ));
        };
        match &function.kind {
            FunctionKind::Closure { def, .. } if def.is_arrow => Err(self.throw(
                "TypeError",
                format!("{} is not a constructor", describe(callee)),
            )),
            FunctionKind::Closure { .. } => {
                let instance = Value::object(Object {
                    class: Some(function.name.clone()),
                    ..Object::default()
                });
                let result = self.call(constructor, instance.clone(), args)?;
                Ok(match result {
                    Value::Object(_) | Value::Array(_) | Value::Function(_) => result,
                    _ => instance,
                })
            }
            FunctionKind::Native(_) | FunctionKind::Host(_) => {
                self.call(constructor, Value::Undefined, args)
            }
        }
    }

    // === Properties ===

    pub fn get_property(&mut self, target: &Value, key: &str) -> Flow<Value> {
        match target {
            Value::Undefined | Value::Null => Err(self.throw(
                "TypeError",
                format!(
                    "Cannot read properties of {} (reading '{key}')",
                    target.to_js_string()
                ),
            )),
            Value::Str(s) => Ok(if key == "length" {
                Value::Number(s.chars().count() as f64)
            } else if let Some(index) = array_index(key) {
                s.chars()
                    .nth(index)
                    .map(|c| Value::from(c.to_string()))
                    .unwrap_or_default()
            } else {
                builtins::string_method(key)
                    .map(|f| Function::native(key, f))
                    .unwrap_or_default()
            }),
            Value::Array(items) => Ok(if key == "length" {
                Value::Number(items.borrow().len() as f64)
            } else if let Some(index) = array_index(key) {
                items.borrow().get(index).cloned().unwrap_or_default()
            } else {
                builtins::array_method(key)
                    .map(|f| Function::native(key, f))
                    .unwrap_or_default()
            }),
            Value::Object(object) => Ok(match object.borrow().get(key) {
                Some(value) => value,
                None => builtins::object_method(key)
                    .map(|f| Function::native(key, f))
                    .unwrap_or_default(),
            }),
            Value::Function(function) => Ok(match function.props.borrow().get(key) {
                Some(value) => value,
                None if key == "name" => Value::Str(function.name.clone()),
                None => builtins::function_method(key)
                    .map(|f| Function::native(key, f))
                    .unwrap_or_default(),
            }),
            Value::Number(_) => Ok(builtins::number_method(key)
                .map(|f| Function::native(key, f))
                .unwrap_or_default()),
            Value::Bool(_) => Ok(builtins::object_method(key)
                .map(|f| Function::native(key, f))
                .unwrap_or_default()),
        }
    }

    pub fn set_property(&mut self, target: &Value, key: Rc<str>, value: Value) -> Flow<()> {
        match target {
            Value::Undefined | Value::Null => Err(self.throw(
                "TypeError",
                format!(
                    "Cannot set properties of {} (setting '{key}')",
                    target.to_js_string()
                ),
            )),
            Value::Array(items) => {
                if &*key == "length" {
                    let len = value.to_number();
                    let Some(len) = as_index(len) else {
                        return Err(self.throw("RangeError", "Invalid array length"));
                    };
                    items.borrow_mut().resize(len, Value::Undefined);
                } else if let Some(index) = array_index(&key) {
                    let mut items = items.borrow_mut();
                    if index >= items.len() {
                        if index > items.len() + MAX_ARRAY_GROWTH {
                            drop(items);
                            return Err(self.throw("RangeError", "Invalid array length"));
                        }
                        items.resize(index + 1, Value::Undefined);
                    }
                    items[index] = value;
                }
                Ok(())
            }
            Value::Object(object) => {
                object.borrow_mut().set(key, value);
                Ok(())
            }
            Value::Function(function) => {
                function.props.borrow_mut().set(key, value);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Values produced by iterating `value` (arrays and strings).
    pub fn iterate(&mut self, value: &Value) -> Flow<Vec<Value>> {
        match value {
            Value::Array(items) => Ok(items.borrow().clone()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::from(c.to_string())).collect()),
            other => Err(self.throw(
                "TypeError",
                format!("{} is not iterable", other.to_js_string()),
            )),
        }
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        // Closures and their scopes reference each other; empty every scope so
        // the cycles fall apart.
        for scope in self.scopes.drain(..) {
            if let Some(scope) = scope.upgrade() {
                let vars = std::mem::take(&mut scope.borrow_mut().vars);
                drop(vars);
            }
        }
        let vars = std::mem::take(&mut self.globals.0.borrow_mut().vars);
        drop(vars);
    }
}

/// Sparse writes beyond this many slots past the end are rejected.
const MAX_ARRAY_GROWTH: usize = 1 << 20;

/// Longest string a script may build, in bytes.
pub(crate) const MAX_STRING_LENGTH: usize = 1 << 27;

/// Deepest `eval`/`exec` recursion before `RangeError`.
const MAX_NESTING: usize = 10_000;

fn as_index(n: f64) -> Option<usize> {
    (n >= 0.0 && n.fract() == 0.0 && n < 4_294_967_295.0).then_some(n as usize)
}

pub(crate) fn own_keys(value: &Value) -> Vec<Rc<str>> {
    match value {
        Value::Object(object) => object.borrow().keys(),
        Value::Array(items) => (0..items.borrow().len())
            .map(|i| Rc::from(i.to_string()))
            .collect(),
        Value::Str(s) => (0..s.chars().count()).map(|i| Rc::from(i.to_string())).collect(),
        Value::Function(function) => function.props.borrow().keys(),
        _ => Vec::new(),
    }
}

pub(crate) fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    let primitive = |v: &Value| match v {
        Value::Array(_) | Value::Object(_) | Value::Function(_) => Value::from(v.to_js_string()),
        other => other.clone(),
    };
    match (primitive(a), primitive(b)) {
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(&y)),
        (x, y) => x.to_number().partial_cmp(&y.to_number()),
    }
}

fn pattern_names(pattern: &Pattern, out: &mut Vec<String>) {
    match pattern {
        Pattern::Ident(name) => out.push(name.clone()),
        Pattern::Object { props, rest } => {
            for prop in props {
                pattern_names(&prop.value, out);
            }
            out.extend(rest.iter().cloned());
        }
        Pattern::Array { elems, rest } => {
            for elem in elems.iter().flatten() {
                pattern_names(&elem.pattern, out);
            }
            if let Some(rest) = rest {
                pattern_names(rest, out);
            }
        }
    }
}

/// Source-like rendering of a callee for error messages.
fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Ident(name) => name.clone(),
        Expr::This => "this".into(),
        Expr::Member {
            object,
            property: MemberProp::Static(name),
            ..
        } => format!("{}.{name}", describe(object)),
        Expr::Member { object, .. } => format!("{}[...]", describe(object)),
        Expr::Call { callee, .. } => format!("{}(...)", describe(callee)),
        Expr::OptionalChain(inner) => describe(inner),
        _ => "expression".into(),
    }
}
