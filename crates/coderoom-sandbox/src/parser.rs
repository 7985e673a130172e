//! Lowers tree-sitter syntax trees into the interpreter's AST.
//!
//! Plain scripts use the JavaScript grammar (which also accepts JSX),
//! TypeScript the TypeScript grammar and React its TSX variant. Type-only
//! syntax lowers to nothing, `enum` becomes a plain object, and JSX elements
//! become `React.createElement(type, props, ...children)` calls.

use crate::ast::*;
use crate::language::Dialect;
use crate::literal;
use crate::value::number_to_string;
use std::rc::Rc;
use tree_sitter::{Language, Node, Parser};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

type PResult<T> = Result<T, ParseError>;

/// Deepest nesting of statements, expressions and patterns that is lowered.
const MAX_NESTING: usize = 1000;

pub(crate) fn parse_program(source: &str, dialect: Dialect) -> PResult<Vec<Stmt>> {
    let language: Language = match (dialect.typescript, dialect.jsx) {
        (false, _) => tree_sitter_javascript::LANGUAGE.into(),
        (true, false) => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        (true, true) => tree_sitter_typescript::LANGUAGE_TSX.into(),
    };
    let at_start = |message: String| ParseError {
        message,
        line: 1,
        column: 1,
    };
    let mut parser = Parser::new();
    parser
        .set_language(&language)
        .map_err(|err| at_start(err.to_string()))?;
    let tree = parser
        .parse(source, None)
        .ok_or_else(|| at_start("Parser produced no syntax tree".into()))?;

    let root = tree.root_node();
    let mut lower = Lower { source, depth: 0 };
    if root.has_error() {
        return Err(lower.syntax_error(root));
    }
    lower.block(root)
}

/// Named children, skipping comments.
fn named<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor)
        .filter(|child| !child.is_extra())
        .collect()
}

/// Every child including punctuation and keywords, skipping comments.
fn children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children(&mut cursor)
        .filter(|child| !child.is_extra())
        .collect()
}

fn has_token(node: Node<'_>, token: &str) -> bool {
    children(node)
        .iter()
        .any(|child| !child.is_named() && child.kind() == token)
}

struct Lower<'s> {
    source: &'s str,
    depth: usize,
}

impl<'s> Lower<'s> {
    fn text(&self, node: Node<'_>) -> &'s str {
        self.source.get(node.byte_range()).unwrap_or_default()
    }

    fn error_at(&self, node: Node<'_>, message: impl Into<String>) -> ParseError {
        let point = node.start_position();
        let line_start = node.start_byte().saturating_sub(point.column);
        let column = self
            .source
            .get(line_start..node.start_byte())
            .map_or(point.column, |prefix| prefix.chars().count());
        ParseError {
            message: message.into(),
            line: point.row + 1,
            column: column + 1,
        }
    }

    fn unsupported(&self, node: Node<'_>, what: &str) -> ParseError {
        self.error_at(node, format!("{what} are not supported"))
    }

    fn unexpected(&self, node: Node<'_>) -> ParseError {
        let token: String = self
            .text(node)
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .chars()
            .take(24)
            .collect();
        if token.is_empty() {
            self.error_at(node, "Unexpected end of input")
        } else {
            self.error_at(node, format!("Unexpected token '{token}'"))
        }
    }

    /// Report the first `ERROR` or `MISSING` node in document order.
    fn syntax_error(&self, root: Node<'_>) -> ParseError {
        let mut cursor = root.walk();
        loop {
            let node = cursor.node();
            if node.is_missing() {
                return self.error_at(node, format!("Missing '{}'", node.kind()));
            }
            if node.is_error() {
                let first = children(node).into_iter().next().unwrap_or(node);
                return self.unexpected(first);
            }
            if !(node.has_error() && cursor.goto_first_child()) {
                while !cursor.goto_next_sibling() {
                    if !cursor.goto_parent() {
                        return self.error_at(root, "Invalid or unexpected token");
                    }
                }
            }
        }
    }

    fn enter(&mut self, node: Node<'_>) -> PResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error_at(node, "nesting too deep"));
        }
        Ok(())
    }

    fn field<'t>(&self, node: Node<'t>, name: &str) -> PResult<Node<'t>> {
        node.child_by_field_name(name)
            .ok_or_else(|| self.unexpected(node))
    }

    /// First named child, for wrappers such as `(expr)` or `...expr`.
    fn only<'t>(&self, node: Node<'t>) -> PResult<Node<'t>> {
        named(node)
            .into_iter()
            .next()
            .ok_or_else(|| self.unexpected(node))
    }

    fn name(&self, node: Node<'_>) -> String {
        self.text(node).to_string()
    }

    // === Statements ===

    fn block(&mut self, node: Node<'_>) -> PResult<Vec<Stmt>> {
        named(node)
            .into_iter()
            .filter(|child| child.kind() != "hash_bang_line")
            .map(|child| self.stmt(child))
            .collect()
    }

    fn stmt(&mut self, node: Node<'_>) -> PResult<Stmt> {
        self.enter(node)?;
        let stmt = self.stmt_kind(node);
        self.depth -= 1;
        stmt
    }

    fn stmt_kind(&mut self, node: Node<'_>) -> PResult<Stmt> {
        Ok(match node.kind() {
            "expression_statement" => {
                let inner = self.only(node)?;
                if inner.kind() == "internal_module" {
                    return Ok(Stmt::Empty);
                }
                Stmt::Expr(self.expr(inner)?)
            }
            "variable_declaration" => self.declaration(node, VarKind::Var)?,
            "lexical_declaration" => {
                let keyword = node
                    .child_by_field_name("kind")
                    .or_else(|| children(node).into_iter().next());
                let kind = match keyword.map(|k| self.text(k)) {
                    Some("const") => VarKind::Const,
                    _ => VarKind::Let,
                };
                self.declaration(node, kind)?
            }
            "function_declaration" => Stmt::Function(self.function(node)?),
            "generator_function_declaration" => return Err(self.unsupported(node, "Generators")),
            "class_declaration" | "abstract_class_declaration" => {
                return Err(self.unsupported(node, "Classes"))
            }
            "statement_block" => Stmt::Block(self.block(node)?),
            "if_statement" => {
                let condition = self.field(node, "condition")?;
                let consequence = self.field(node, "consequence")?;
                let test = self.expr(condition)?;
                let then = Box::new(self.stmt(consequence)?);
                let otherwise = match node.child_by_field_name("alternative") {
                    Some(clause) => {
                        let inner = if clause.kind() == "else_clause" {
                            self.only(clause)?
                        } else {
                            clause
                        };
                        Some(Box::new(self.stmt(inner)?))
                    }
                    None => None,
                };
                Stmt::If {
                    test,
                    then,
                    otherwise,
                }
            }
            "while_statement" => {
                let condition = self.field(node, "condition")?;
                let body = self.field(node, "body")?;
                Stmt::While {
                    test: self.expr(condition)?,
                    body: Box::new(self.stmt(body)?),
                }
            }
            "do_statement" => {
                let body = self.field(node, "body")?;
                let condition = self.field(node, "condition")?;
                Stmt::DoWhile {
                    body: Box::new(self.stmt(body)?),
                    test: self.expr(condition)?,
                }
            }
            "for_statement" => self.for_loop(node)?,
            "for_in_statement" => self.for_each(node)?,
            "return_statement" => Stmt::Return(match named(node).into_iter().next() {
                Some(value) => Some(self.expr(value)?),
                None => None,
            }),
            "throw_statement" => {
                let value = self.only(node)?;
                Stmt::Throw(self.expr(value)?)
            }
            "break_statement" | "continue_statement" => {
                if !named(node).is_empty() {
                    return Err(self.unsupported(node, "Labels"));
                }
                if node.kind() == "break_statement" {
                    Stmt::Break
                } else {
                    Stmt::Continue
                }
            }
            "labeled_statement" => return Err(self.unsupported(node, "Labels")),
            "try_statement" => self.try_catch(node)?,
            "switch_statement" => self.switch(node)?,
            "export_statement" => {
                if let Some(declaration) = node.child_by_field_name("declaration") {
                    return self.stmt(declaration);
                }
                match node.child_by_field_name("value") {
                    Some(value) => Stmt::Expr(self.expr(value)?),
                    // Re-export lists carry no runtime meaning in a single script.
                    None => Stmt::Empty,
                }
            }
            "enum_declaration" => self.enumeration(node)?,
            "with_statement" => return Err(self.unsupported(node, "With statements")),
            "empty_statement" | "debugger_statement" | "import_statement" | "interface_declaration"
            | "type_alias_declaration" | "ambient_declaration" | "module" | "internal_module"
            | "import_alias" | "function_signature" => Stmt::Empty,
            _ => return Err(self.unexpected(node)),
        })
    }

    fn declaration(&mut self, node: Node<'_>, kind: VarKind) -> PResult<Stmt> {
        let mut decls = Vec::new();
        for declarator in named(node) {
            if declarator.kind() != "variable_declarator" {
                continue;
            }
            let name = self.field(declarator, "name")?;
            let pattern = self.pattern(name)?;
            let init = match declarator.child_by_field_name("value") {
                Some(value) => Some(self.expr(value)?),
                None => None,
            };
            decls.push((pattern, init));
        }
        Ok(Stmt::Var { kind, decls })
    }

    /// An expression slot that may hold `;`, an empty statement or an
    /// expression statement depending on the grammar revision.
    fn optional_expr(&mut self, node: Node<'_>) -> PResult<Option<Expr>> {
        match node.kind() {
            "empty_statement" => Ok(None),
            "expression_statement" => {
                let inner = self.only(node)?;
                Ok(Some(self.expr(inner)?))
            }
            _ if !node.is_named() => Ok(None),
            _ => Ok(Some(self.expr(node)?)),
        }
    }

    fn for_loop(&mut self, node: Node<'_>) -> PResult<Stmt> {
        let init = match node.child_by_field_name("initializer") {
            Some(init) if matches!(init.kind(), "lexical_declaration" | "variable_declaration") => {
                Some(Box::new(self.stmt(init)?))
            }
            Some(init) => self.optional_expr(init)?.map(|expr| Box::new(Stmt::Expr(expr))),
            None => None,
        };
        let test = match node.child_by_field_name("condition") {
            Some(test) => self.optional_expr(test)?,
            None => None,
        };
        let update = match node.child_by_field_name("increment") {
            Some(update) => self.optional_expr(update)?,
            None => None,
        };
        let body = self.field(node, "body")?;
        Ok(Stmt::For {
            init,
            test,
            update,
            body: Box::new(self.stmt(body)?),
        })
    }

    /// `for (x in o)` and `for (x of xs)`.
    fn for_each(&mut self, node: Node<'_>) -> PResult<Stmt> {
        if has_token(node, "await") {
            return Err(self.unsupported(node, "Async iteration"));
        }
        let kind = match node.child_by_field_name("kind").map(|k| self.text(k)) {
            Some("const") => VarKind::Const,
            Some("let") => VarKind::Let,
            _ => VarKind::Var,
        };
        let is_of = match node.child_by_field_name("operator") {
            Some(operator) => self.text(operator) == "of",
            None => has_token(node, "of"),
        };
        let left = self.field(node, "left")?;
        let pattern = self.pattern(left)?;
        let right = self.field(node, "right")?;
        let source = self.expr(right)?;
        let body = self.field(node, "body")?;
        let body = Box::new(self.stmt(body)?);
        Ok(if is_of {
            Stmt::ForOf {
                kind,
                pattern,
                iterable: source,
                body,
            }
        } else {
            Stmt::ForIn {
                kind,
                pattern,
                object: source,
                body,
            }
        })
    }

    fn try_catch(&mut self, node: Node<'_>) -> PResult<Stmt> {
        let body = self.field(node, "body")?;
        let block = self.block(body)?;
        let (mut param, mut handler, mut finalizer) = (None, None, None);
        if let Some(clause) = node.child_by_field_name("handler") {
            if let Some(parameter) = clause.child_by_field_name("parameter") {
                param = Some(self.pattern(parameter)?);
            }
            let body = self.field(clause, "body")?;
            handler = Some(self.block(body)?);
        }
        if let Some(clause) = node.child_by_field_name("finalizer") {
            let body = self.field(clause, "body")?;
            finalizer = Some(self.block(body)?);
        }
        if handler.is_none() && finalizer.is_none() {
            return Err(self.error_at(node, "Missing catch or finally after try"));
        }
        Ok(Stmt::Try {
            block,
            param,
            handler,
            finalizer,
        })
    }

    fn switch(&mut self, node: Node<'_>) -> PResult<Stmt> {
        let value = self.field(node, "value")?;
        let discriminant = self.expr(value)?;
        let body = self.field(node, "body")?;
        let mut cases = Vec::new();
        for case in named(body) {
            let test_node = case.child_by_field_name("value");
            let test = match (case.kind(), test_node) {
                ("switch_case", Some(test)) => Some(self.expr(test)?),
                ("switch_default", _) => None,
                _ => return Err(self.unexpected(case)),
            };
            let mut stmts = Vec::new();
            for child in named(case) {
                if Some(child.id()) != test_node.map(|n| n.id()) {
                    stmts.push(self.stmt(child)?);
                }
            }
            cases.push(SwitchCase { test, body: stmts });
        }
        Ok(Stmt::Switch {
            discriminant,
            cases,
        })
    }

    /// `enum E { A, B = 5 }` becomes `const E = { A: 0, "0": "A", B: 5, "5": "B" }`.
    fn enumeration(&mut self, node: Node<'_>) -> PResult<Stmt> {
        let name = self.field(node, "name")?;
        let name = self.name(name);
        let body = self.field(node, "body")?;
        let mut props = Vec::new();
        let mut next: Option<f64> = Some(0.0);
        for member in named(body) {
            let (key_node, value) = match member.kind() {
                "enum_assignment" => {
                    let key = self.field(member, "name")?;
                    let value = self.field(member, "value")?;
                    (key, Some(self.expr(value)?))
                }
                _ => (member, None),
            };
            let PropKey::Static(key) = self.prop_key(key_node)? else {
                return Err(self.unexpected(key_node));
            };
            let value = match (value, next) {
                (Some(value), _) => value,
                (None, Some(n)) => Expr::Num(n),
                (None, None) => {
                    return Err(self.error_at(member, "Enum member must have initializer"))
                }
            };
            let number = match &value {
                Expr::Num(n) => Some(*n),
                Expr::Unary(UnaryOp::Neg, inner) => match inner.as_ref() {
                    Expr::Num(n) => Some(-n),
                    _ => None,
                },
                _ => None,
            };
            next = number.map(|n| n + 1.0);
            props.push(Prop::KeyValue(PropKey::Static(key.clone()), value));
            if let Some(n) = number {
                props.push(Prop::KeyValue(
                    PropKey::Static(number_to_string(n)),
                    Expr::Str(key),
                ));
            }
        }
        Ok(Stmt::Var {
            kind: VarKind::Const,
            decls: vec![(Pattern::Ident(name), Some(Expr::Object(props)))],
        })
    }

    // === Functions ===

    fn function(&mut self, node: Node<'_>) -> PResult<Rc<FunctionDef>> {
        if has_token(node, "async") {
            return Err(self.unsupported(node, "Async functions"));
        }
        if has_token(node, "*") {
            return Err(self.unsupported(node, "Generators"));
        }
        let name = node.child_by_field_name("name").map(|n| self.name(n));
        let parameters = self.field(node, "parameters")?;
        let params = self.params(parameters)?;
        let body = self.field(node, "body")?;
        Ok(Rc::new(FunctionDef {
            name,
            params,
            body: FunctionBody::Block(self.block(body)?),
            is_arrow: false,
        }))
    }

    fn arrow(&mut self, node: Node<'_>) -> PResult<Expr> {
        if has_token(node, "async") {
            return Err(self.unsupported(node, "Async functions"));
        }
        let params = match node.child_by_field_name("parameter") {
            Some(param) => vec![Param {
                pattern: Pattern::Ident(self.name(param)),
                default: None,
                rest: false,
            }],
            None => {
                let parameters = self.field(node, "parameters")?;
                self.params(parameters)?
            }
        };
        let body = self.field(node, "body")?;
        let body = if body.kind() == "statement_block" {
            FunctionBody::Block(self.block(body)?)
        } else {
            FunctionBody::Expr(Box::new(self.expr(body)?))
        };
        Ok(Expr::Function(Rc::new(FunctionDef {
            name: None,
            params,
            body,
            is_arrow: true,
        })))
    }

    fn params(&mut self, node: Node<'_>) -> PResult<Vec<Param>> {
        let mut params = Vec::new();
        for child in named(node) {
            let param = match child.kind() {
                // TypeScript wraps each parameter together with its annotation.
                "required_parameter" | "optional_parameter" => {
                    let pattern = self.field(child, "pattern")?;
                    if pattern.kind() == "this" {
                        continue;
                    }
                    let default = match child.child_by_field_name("value") {
                        Some(value) => Some(self.expr(value)?),
                        None => None,
                    };
                    self.param(pattern, default)?
                }
                "decorator" => continue,
                _ => self.param(child, None)?,
            };
            params.push(param);
        }
        Ok(params)
    }

    fn param(&mut self, node: Node<'_>, default: Option<Expr>) -> PResult<Param> {
        if node.kind() == "rest_pattern" {
            let inner = self.only(node)?;
            return Ok(Param {
                pattern: self.pattern(inner)?,
                default: None,
                rest: true,
            });
        }
        let (pattern, inline) = self.pattern_with_default(node)?;
        Ok(Param {
            pattern,
            default: inline.or(default),
            rest: false,
        })
    }

    // === Patterns ===

    fn pattern(&mut self, node: Node<'_>) -> PResult<Pattern> {
        self.enter(node)?;
        let pattern = self.pattern_kind(node);
        self.depth -= 1;
        pattern
    }

    fn pattern_kind(&mut self, node: Node<'_>) -> PResult<Pattern> {
        match node.kind() {
            "identifier" | "shorthand_property_identifier_pattern" => {
                Ok(Pattern::Ident(self.name(node)))
            }
            "parenthesized_expression" => {
                let inner = self.only(node)?;
                self.pattern(inner)
            }
            "object_pattern" => {
                let mut props = Vec::new();
                let mut rest = None;
                for child in named(node) {
                    match child.kind() {
                        "pair_pattern" => {
                            let key = self.field(child, "key")?;
                            let key = self.prop_key(key)?;
                            let value = self.field(child, "value")?;
                            let (value, default) = self.pattern_with_default(value)?;
                            props.push(PatternProp {
                                key,
                                value,
                                default,
                            });
                        }
                        "shorthand_property_identifier_pattern" => {
                            let name = self.name(child);
                            props.push(PatternProp {
                                key: PropKey::Static(name.clone()),
                                value: Pattern::Ident(name),
                                default: None,
                            });
                        }
                        "object_assignment_pattern" => {
                            let left = self.field(child, "left")?;
                            let right = self.field(child, "right")?;
                            let name = self.name(left);
                            props.push(PatternProp {
                                key: PropKey::Static(name.clone()),
                                value: Pattern::Ident(name),
                                default: Some(self.expr(right)?),
                            });
                        }
                        "rest_pattern" => {
                            let inner = self.only(child)?;
                            if inner.kind() != "identifier" {
                                return Err(self.invalid_target(inner));
                            }
                            rest = Some(self.name(inner));
                        }
                        _ => return Err(self.invalid_target(child)),
                    }
                }
                Ok(Pattern::Object { props, rest })
            }
            "array_pattern" => {
                let mut elems = Vec::new();
                let mut rest = None;
                let mut filled = false;
                for child in children(node) {
                    match child.kind() {
                        "," => {
                            if !filled {
                                elems.push(None);
                            }
                            filled = false;
                        }
                        "rest_pattern" => {
                            let inner = self.only(child)?;
                            rest = Some(Box::new(self.pattern(inner)?));
                            filled = true;
                        }
                        _ if child.is_named() => {
                            let (pattern, default) = self.pattern_with_default(child)?;
                            elems.push(Some(PatternElem { pattern, default }));
                            filled = true;
                        }
                        _ => {}
                    }
                }
                Ok(Pattern::Array { elems, rest })
            }
            _ => Err(self.invalid_target(node)),
        }
    }

    fn pattern_with_default(&mut self, node: Node<'_>) -> PResult<(Pattern, Option<Expr>)> {
        if node.kind() != "assignment_pattern" {
            return Ok((self.pattern(node)?, None));
        }
        let left = self.field(node, "left")?;
        let right = self.field(node, "right")?;
        Ok((self.pattern(left)?, Some(self.expr(right)?)))
    }

    fn invalid_target(&self, node: Node<'_>) -> ParseError {
        self.error_at(node, "Invalid destructuring assignment target")
    }

    fn prop_key(&mut self, node: Node<'_>) -> PResult<PropKey> {
        Ok(match node.kind() {
            "property_identifier" | "identifier" | "private_property_identifier" => {
                PropKey::Static(self.name(node))
            }
            "string" => PropKey::Static(self.string(node)),
            "number" => PropKey::Static(number_to_string(self.number(node)?)),
            "computed_property_name" => {
                let inner = self.only(node)?;
                PropKey::Computed(Box::new(self.expr(inner)?))
            }
            _ => return Err(self.unexpected(node)),
        })
    }

    // === Expressions ===

    fn expr(&mut self, node: Node<'_>) -> PResult<Expr> {
        self.enter(node)?;
        let expr = self.expr_kind(node);
        self.depth -= 1;
        expr
    }

    fn expr_kind(&mut self, node: Node<'_>) -> PResult<Expr> {
        Ok(match node.kind() {
            "number" => Expr::Num(self.number(node)?),
            "string" => Expr::Str(self.string(node)),
            "template_string" => self.template(node)?,
            "true" => Expr::Bool(true),
            "false" => Expr::Bool(false),
            "null" => Expr::Null,
            "undefined" => Expr::Undefined,
            "this" => Expr::This,
            "identifier" | "shorthand_property_identifier" => Expr::Ident(self.name(node)),
            "parenthesized_expression" => {
                let inner = self.only(node)?;
                self.expr(inner)?
            }
            "sequence_expression" => {
                let mut exprs = Vec::new();
                for part in named(node) {
                    match self.expr(part)? {
                        Expr::Sequence(inner) => exprs.extend(inner),
                        other => exprs.push(other),
                    }
                }
                Expr::Sequence(exprs)
            }
            "array" => Expr::Array(self.elements(node)?),
            "object" => self.object(node)?,
            "function_expression" | "function" => Expr::Function(self.function(node)?),
            "arrow_function" => self.arrow(node)?,
            "unary_expression" => {
                let operator = self.field(node, "operator")?;
                let op = match self.text(operator) {
                    "!" => UnaryOp::Not,
                    "-" => UnaryOp::Neg,
                    "+" => UnaryOp::Plus,
                    "~" => UnaryOp::BitNot,
                    "typeof" => UnaryOp::Typeof,
                    "void" => UnaryOp::Void,
                    "delete" => UnaryOp::Delete,
                    _ => return Err(self.unexpected(operator)),
                };
                let argument = self.field(node, "argument")?;
                Expr::Unary(op, Box::new(self.expr(argument)?))
            }
            "update_expression" => {
                let operator = self.field(node, "operator")?;
                let argument = self.field(node, "argument")?;
                let target = self.expr(argument)?;
                check_simple_target(&target).map_err(|m| self.error_at(argument, m))?;
                Expr::Update {
                    increment: self.text(operator) == "++",
                    prefix: operator.start_byte() < argument.start_byte(),
                    target: Box::new(target),
                }
            }
            "binary_expression" => {
                let operator = self.field(node, "operator")?;
                let op = binary_op(self.text(operator)).ok_or_else(|| self.unexpected(operator))?;
                let left = self.field(node, "left")?;
                let right = self.field(node, "right")?;
                let (left, right) = (Box::new(self.expr(left)?), Box::new(self.expr(right)?));
                match op {
                    BinOrLogical::Bin(op) => Expr::Binary(op, left, right),
                    BinOrLogical::Logic(op) => Expr::Logical(op, left, right),
                }
            }
            "assignment_expression" => {
                let left = self.field(node, "left")?;
                let right = self.field(node, "right")?;
                if matches!(left.kind(), "object_pattern" | "array_pattern") {
                    let pattern = self.pattern(left)?;
                    return Ok(Expr::Destructure {
                        pattern,
                        value: Box::new(self.expr(right)?),
                    });
                }
                let target = self.expr(left)?;
                check_simple_target(&target).map_err(|m| self.error_at(left, m))?;
                Expr::Assign {
                    op: None,
                    target: Box::new(target),
                    value: Box::new(self.expr(right)?),
                }
            }
            "augmented_assignment_expression" => self.compound_assign(node)?,
            "ternary_expression" => {
                let condition = self.field(node, "condition")?;
                let consequence = self.field(node, "consequence")?;
                let alternative = self.field(node, "alternative")?;
                Expr::Conditional(
                    Box::new(self.expr(condition)?),
                    Box::new(self.expr(consequence)?),
                    Box::new(self.expr(alternative)?),
                )
            }
            "member_expression" | "subscript_expression" | "call_expression" => {
                let (expr, optional) = self.chain(node)?;
                if optional {
                    Expr::OptionalChain(Box::new(expr))
                } else {
                    expr
                }
            }
            "new_expression" => {
                let constructor = self.field(node, "constructor")?;
                let callee = Box::new(self.expr(constructor)?);
                let args = match node.child_by_field_name("arguments") {
                    Some(arguments) => self.elements(arguments)?,
                    None => Vec::new(),
                };
                Expr::New { callee, args }
            }
            "jsx_element" | "jsx_self_closing_element" => self.jsx(node)?,
            // TypeScript-only wrappers around a runtime expression.
            "as_expression" | "satisfies_expression" | "non_null_expression"
            | "instantiation_expression" => {
                let inner = self.only(node)?;
                self.expr(inner)?
            }
            "type_assertion" => {
                let inner = named(node)
                    .into_iter()
                    .last()
                    .ok_or_else(|| self.unexpected(node))?;
                self.expr(inner)?
            }
            "class" | "super" => return Err(self.unsupported(node, "Classes")),
            "generator_function" | "yield_expression" => {
                return Err(self.unsupported(node, "Generators"))
            }
            "await_expression" => return Err(self.unsupported(node, "Await expressions")),
            "regex" => return Err(self.unsupported(node, "Regular expressions")),
            "meta_property" => return Err(self.unsupported(node, "Meta properties")),
            "import" => return Err(self.unsupported(node, "Dynamic imports")),
            _ => return Err(self.unexpected(node)),
        })
    }

    fn compound_assign(&mut self, node: Node<'_>) -> PResult<Expr> {
        let operator = self.field(node, "operator")?;
        let left = self.field(node, "left")?;
        let right = self.field(node, "right")?;
        let target = self.expr(left)?;
        check_simple_target(&target).map_err(|m| self.error_at(left, m))?;
        let (target, value) = (Box::new(target), Box::new(self.expr(right)?));
        let logical = match self.text(operator) {
            "&&=" => Some(LogicalOp::And),
            "||=" => Some(LogicalOp::Or),
            "??=" => Some(LogicalOp::Nullish),
            _ => None,
        };
        if let Some(op) = logical {
            return Ok(Expr::LogicalAssign { op, target, value });
        }
        let op = self
            .text(operator)
            .strip_suffix('=')
            .and_then(binary_op)
            .and_then(|op| match op {
                BinOrLogical::Bin(op) => Some(op),
                BinOrLogical::Logic(_) => None,
            })
            .ok_or_else(|| self.unexpected(operator))?;
        Ok(Expr::Assign {
            op: Some(op),
            target,
            value,
        })
    }

    fn number(&self, node: Node<'_>) -> PResult<f64> {
        literal::number(self.text(node)).ok_or_else(|| self.error_at(node, "Invalid number literal"))
    }

    fn string(&self, node: Node<'_>) -> String {
        let raw = self.text(node);
        let body = raw.get(1..raw.len().saturating_sub(1)).unwrap_or_default();
        literal::unescape(body)
    }

    fn template(&mut self, node: Node<'_>) -> PResult<Expr> {
        let mut quasis = Vec::new();
        let mut exprs = Vec::new();
        let mut chunk_start = node.start_byte() + 1;
        for child in named(node) {
            if child.kind() != "template_substitution" {
                continue;
            }
            let raw = self.source.get(chunk_start..child.start_byte()).unwrap_or_default();
            quasis.push(literal::unescape(raw));
            let inner = self.only(child)?;
            exprs.push(self.expr(inner)?);
            chunk_start = child.end_byte();
        }
        let end = node.end_byte().saturating_sub(1);
        quasis.push(literal::unescape(self.source.get(chunk_start..end).unwrap_or_default()));
        Ok(Expr::Template { quasis, exprs })
    }

    /// Array elements or call arguments; elided array slots become holes.
    fn elements(&mut self, node: Node<'_>) -> PResult<Vec<Elem>> {
        let mut elems = Vec::new();
        let mut filled = false;
        for child in children(node) {
            match child.kind() {
                "," => {
                    if !filled {
                        elems.push(Elem::Hole);
                    }
                    filled = false;
                }
                "spread_element" => {
                    let inner = self.only(child)?;
                    elems.push(Elem::Spread(self.expr(inner)?));
                    filled = true;
                }
                _ if child.is_named() => {
                    elems.push(Elem::Expr(self.expr(child)?));
                    filled = true;
                }
                _ => {}
            }
        }
        Ok(elems)
    }

    fn object(&mut self, node: Node<'_>) -> PResult<Expr> {
        let mut props = Vec::new();
        for child in named(node) {
            match child.kind() {
                "pair" => {
                    let key = self.field(child, "key")?;
                    let value = self.field(child, "value")?;
                    props.push(Prop::KeyValue(self.prop_key(key)?, self.expr(value)?));
                }
                "spread_element" => {
                    let inner = self.only(child)?;
                    props.push(Prop::Spread(self.expr(inner)?));
                }
                "shorthand_property_identifier" => {
                    let name = self.name(child);
                    props.push(Prop::KeyValue(PropKey::Static(name.clone()), Expr::Ident(name)));
                }
                "method_definition" => {
                    if ["get", "set", "async"].iter().any(|word| has_token(child, word)) {
                        return Err(self.unsupported(child, "Accessors and async methods"));
                    }
                    if has_token(child, "*") {
                        return Err(self.unsupported(child, "Generators"));
                    }
                    let key = self.field(child, "name")?;
                    let key = self.prop_key(key)?;
                    let name = match &key {
                        PropKey::Static(name) => Some(name.clone()),
                        PropKey::Computed(_) => None,
                    };
                    let parameters = self.field(child, "parameters")?;
                    let params = self.params(parameters)?;
                    let body = self.field(child, "body")?;
                    let method = FunctionDef {
                        name,
                        params,
                        body: FunctionBody::Block(self.block(body)?),
                        is_arrow: false,
                    };
                    props.push(Prop::KeyValue(key, Expr::Function(Rc::new(method))));
                }
                _ => return Err(self.unexpected(child)),
            }
        }
        Ok(Expr::Object(props))
    }

    /// Lower a member or call chain. The flag reports whether any link is
    /// `?.`, in which case the caller wraps the outermost link.
    fn chain(&mut self, node: Node<'_>) -> PResult<(Expr, bool)> {
        self.enter(node)?;
        let chain = self.chain_link(node);
        self.depth -= 1;
        chain
    }

    fn chain_link(&mut self, node: Node<'_>) -> PResult<(Expr, bool)> {
        let optional = node.child_by_field_name("optional_chain").is_some()
            || children(node)
                .iter()
                .any(|c| c.kind() == "optional_chain" || c.kind() == "?.");
        match node.kind() {
            "member_expression" => {
                let object = self.field(node, "object")?;
                let property = self.field(node, "property")?;
                let (object, inner) = self.chain_object(object)?;
                let expr = Expr::Member {
                    object: Box::new(object),
                    property: MemberProp::Static(self.name(property)),
                    optional,
                };
                Ok((expr, inner || optional))
            }
            "subscript_expression" => {
                let object = self.field(node, "object")?;
                let index = self.field(node, "index")?;
                let (object, inner) = self.chain_object(object)?;
                let expr = Expr::Member {
                    object: Box::new(object),
                    property: MemberProp::Computed(Box::new(self.expr(index)?)),
                    optional,
                };
                Ok((expr, inner || optional))
            }
            "call_expression" => {
                let function = self.field(node, "function")?;
                let arguments = self.field(node, "arguments")?;
                if arguments.kind() == "template_string" {
                    return Err(self.unsupported(node, "Tagged templates"));
                }
                let (callee, inner) = self.chain_object(function)?;
                let expr = Expr::Call {
                    callee: Box::new(callee),
                    args: self.elements(arguments)?,
                    optional,
                };
                Ok((expr, inner || optional))
            }
            _ => Ok((self.expr(node)?, false)),
        }
    }

    fn chain_object(&mut self, node: Node<'_>) -> PResult<(Expr, bool)> {
        match node.kind() {
            "member_expression" | "subscript_expression" | "call_expression" => self.chain(node),
            "non_null_expression" => {
                let inner = self.only(node)?;
                self.chain_object(inner)
            }
            _ => Ok((self.expr(node)?, false)),
        }
    }

    // === JSX ===

    fn jsx(&mut self, node: Node<'_>) -> PResult<Expr> {
        self.enter(node)?;
        let element = self.jsx_element(node);
        self.depth -= 1;
        element
    }

    fn jsx_element(&mut self, node: Node<'_>) -> PResult<Expr> {
        let (open, contents) = if node.kind() == "jsx_self_closing_element" {
            (node, Vec::new())
        } else {
            let open = self.field(node, "open_tag")?;
            let close = self.field(node, "close_tag")?;
            let open_name = open.child_by_field_name("name").map(|n| self.text(n));
            let close_name = close.child_by_field_name("name").map(|n| self.text(n));
            if open_name != close_name {
                return Err(self.error_at(
                    close,
                    format!(
                        "Expected corresponding JSX closing tag for <{}>",
                        open_name.unwrap_or_default()
                    ),
                ));
            }
            (open, self.jsx_children(node, open, close)?)
        };

        let tag = match open.child_by_field_name("name") {
            Some(name) => jsx_type(self.text(name)),
            None => Expr::member(Expr::Ident("React".into()), "Fragment"),
        };
        let mut props = Vec::new();
        for attribute in named(open) {
            match attribute.kind() {
                "jsx_attribute" => props.push(self.jsx_attribute(attribute)?),
                "jsx_expression" => {
                    let inner = self.only(attribute)?;
                    let inner = if inner.kind() == "spread_element" {
                        self.only(inner)?
                    } else {
                        inner
                    };
                    props.push(Prop::Spread(self.expr(inner)?));
                }
                _ => {}
            }
        }

        let props = if props.is_empty() {
            Expr::Null
        } else {
            Expr::Object(props)
        };
        let mut args = vec![tag, props];
        args.extend(contents);
        Ok(Expr::call(
            Expr::member(Expr::Ident("React".into()), "createElement"),
            args,
        ))
    }

    fn jsx_attribute(&mut self, node: Node<'_>) -> PResult<Prop> {
        let parts = named(node);
        let Some(&name) = parts.first() else {
            return Err(self.unexpected(node));
        };
        let value = match parts.get(1).copied() {
            None => Expr::Bool(true),
            Some(value) if value.kind() == "string" => {
                let raw = self.text(value);
                Expr::Str(decode_entities(
                    raw.get(1..raw.len().saturating_sub(1)).unwrap_or_default(),
                ))
            }
            Some(value) if value.kind() == "jsx_expression" => match named(value).first() {
                Some(&inner) => self.expr(inner)?,
                None => {
                    return Err(self.error_at(
                        value,
                        "JSX attributes must only be assigned a non-empty expression",
                    ))
                }
            },
            Some(value) => self.jsx(value)?,
        };
        Ok(Prop::KeyValue(PropKey::Static(self.name(name)), value))
    }

    /// Children between the tags. Text runs are cut from the source so
    /// entities and whitespace collapse the same way however the grammar
    /// splits them.
    fn jsx_children(
        &mut self,
        node: Node<'_>,
        open: Node<'_>,
        close: Node<'_>,
    ) -> PResult<Vec<Expr>> {
        let mut out = Vec::new();
        let mut text_start = open.end_byte();
        for child in named(node) {
            if child.id() == open.id() || child.id() == close.id() {
                continue;
            }
            let kind = child.kind();
            if !matches!(kind, "jsx_expression" | "jsx_element" | "jsx_self_closing_element") {
                continue;
            }
            let raw = self.source.get(text_start..child.start_byte()).unwrap_or_default();
            out.extend(jsx_text(raw).map(Expr::Str));
            if kind == "jsx_expression" {
                if let Some(&inner) = named(child).first() {
                    out.push(self.expr(inner)?);
                }
            } else {
                out.push(self.jsx(child)?);
            }
            text_start = child.end_byte();
        }
        let raw = self.source.get(text_start..close.start_byte()).unwrap_or_default();
        out.extend(jsx_text(raw).map(Expr::Str));
        Ok(out)
    }
}

enum BinOrLogical {
    Bin(BinOp),
    Logic(LogicalOp),
}

fn binary_op(op: &str) -> Option<BinOrLogical> {
    use BinOrLogical::{Bin, Logic};
    Some(match op {
        "??" => Logic(LogicalOp::Nullish),
        "||" => Logic(LogicalOp::Or),
        "&&" => Logic(LogicalOp::And),
        "|" => Bin(BinOp::BitOr),
        "^" => Bin(BinOp::BitXor),
        "&" => Bin(BinOp::BitAnd),
        "==" => Bin(BinOp::Eq),
        "!=" => Bin(BinOp::NotEq),
        "===" => Bin(BinOp::StrictEq),
        "!==" => Bin(BinOp::StrictNotEq),
        "<" => Bin(BinOp::Lt),
        "<=" => Bin(BinOp::LtEq),
        ">" => Bin(BinOp::Gt),
        ">=" => Bin(BinOp::GtEq),
        "<<" => Bin(BinOp::Shl),
        ">>" => Bin(BinOp::Shr),
        ">>>" => Bin(BinOp::UShr),
        "+" => Bin(BinOp::Add),
        "-" => Bin(BinOp::Sub),
        "*" => Bin(BinOp::Mul),
        "/" => Bin(BinOp::Div),
        "%" => Bin(BinOp::Rem),
        "**" => Bin(BinOp::Exp),
        "in" => Bin(BinOp::In),
        "instanceof" => Bin(BinOp::InstanceOf),
        _ => return None,
    })
}

fn check_simple_target(expr: &Expr) -> Result<(), String> {
    match expr {
        Expr::Ident(_) | Expr::Member { optional: false, .. } => Ok(()),
        _ => Err("Invalid left-hand side in assignment".to_string()),
    }
}

/// Lowercase and dashed names are host elements; anything else names a
/// component binding, dotted names a member chain.
fn jsx_type(name: &str) -> Expr {
    if name.contains('.') {
        let mut parts = name.split('.');
        let first = parts.next().unwrap_or_default();
        parts.fold(Expr::Ident(first.to_string()), |acc, part| {
            Expr::member(acc, part)
        })
    } else if name.starts_with(|c: char| c.is_ascii_lowercase()) || name.contains('-') {
        Expr::Str(name.to_string())
    } else {
        Expr::Ident(name.to_string())
    }
}

/// Collapse JSX text the way JSX compilers do: trim each line, drop blank
/// lines, join the rest with single spaces.
fn jsx_text(raw: &str) -> Option<String> {
    if !raw.contains('\n') {
        return (!raw.is_empty()).then(|| decode_entities(raw));
    }
    let lines: Vec<&str> = raw.split('\n').collect();
    let last = lines.len() - 1;
    let mut parts = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let mut line = line.trim_end_matches('\r');
        if i != 0 {
            line = line.trim_start();
        }
        if i != last {
            line = line.trim_end();
        }
        if !line.is_empty() {
            parts.push(line);
        }
    }
    (!parts.is_empty()).then(|| decode_entities(&parts.join(" ")))
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&nbsp;", "\u{a0}")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: Dialect = Dialect {
        typescript: true,
        jsx: false,
    };
    const TSX: Dialect = Dialect {
        typescript: true,
        jsx: true,
    };

    fn js(source: &str) -> Vec<Stmt> {
        parse_program(source, Dialect::default()).unwrap()
    }

    fn ts(source: &str) -> Vec<Stmt> {
        parse_program(source, TS).unwrap()
    }

    fn tsx(source: &str) -> Vec<Stmt> {
        parse_program(source, TSX).unwrap()
    }

    #[test]
    fn test_precedence() {
        let body = js("1 + 2 * 3 ** 2;");
        match &body[0] {
            Stmt::Expr(Expr::Binary(BinOp::Add, _, right)) => {
                assert!(matches!(right.as_ref(), Expr::Binary(BinOp::Mul, _, _)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_asi() {
        let body = js("let a = 1\nlet b = 2\na\n++b");
        assert_eq!(body.len(), 4);
        assert!(matches!(
            body[3],
            Stmt::Expr(Expr::Update { prefix: true, .. })
        ));
    }

    #[test]
    fn test_arrow_functions() {
        let body = js("const f = (a, {b, c = 2}, ...rest) => a + b; const g = x => ({x});");
        match &body[0] {
            Stmt::Var { decls, .. } => match &decls[0].1 {
                Some(Expr::Function(def)) => {
                    assert!(def.is_arrow);
                    assert_eq!(def.params.len(), 3);
                    assert!(def.params[2].rest);
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn test_parenthesized_is_not_arrow() {
        let body = js("(1 + 2) * 3");
        assert!(matches!(body[0], Stmt::Expr(Expr::Binary(BinOp::Mul, _, _))));
    }

    #[test]
    fn test_destructuring_assignment() {
        let body = js("[a, b] = [b, a]");
        assert!(matches!(body[0], Stmt::Expr(Expr::Destructure { .. })));
    }

    #[test]
    fn test_array_holes() {
        let body = js("[, a, , b,]");
        let Stmt::Expr(Expr::Array(elems)) = &body[0] else {
            panic!("expected array");
        };
        assert_eq!(elems.len(), 4);
        assert!(matches!(elems[0], Elem::Hole));
        assert!(matches!(elems[2], Elem::Hole));
    }

    #[test]
    fn test_optional_chain() {
        let body = js("a?.b.c");
        assert!(matches!(body[0], Stmt::Expr(Expr::OptionalChain(_))));
        let body = js("(a?.b).c");
        assert!(matches!(body[0], Stmt::Expr(Expr::Member { .. })));
    }

    #[test]
    fn test_template_chunks() {
        let body = js(r"`a\n${x + 1}b${y}`");
        let Stmt::Expr(Expr::Template { quasis, exprs }) = &body[0] else {
            panic!("expected template");
        };
        assert_eq!(quasis, &vec!["a\n".to_string(), "b".into(), "".into()]);
        assert_eq!(exprs.len(), 2);
    }

    #[test]
    fn test_for_variants() {
        let body = js("for (let i = 0; i < 3; i++) {} for (const x of xs) {} for (k in o) {}");
        assert!(matches!(body[0], Stmt::For { .. }));
        assert!(matches!(body[1], Stmt::ForOf { kind: VarKind::Const, .. }));
        assert!(matches!(body[2], Stmt::ForIn { kind: VarKind::Var, .. }));
    }

    #[test]
    fn test_typescript_annotations_are_erased() {
        let body = ts(r#"
            interface User { name: string; age?: number }
            type Id = string | number;
            declare const VERSION: string;
            function greet<T extends User>(user: T, greeting: string = "hi"): string {
                return `${greeting} ${user.name}`;
            }
            const id = (value as unknown) as Id;
            let total!: number;
            const pick = <T,>(items: T[]): T | undefined => items[0];
            const name = users.find((u): u is User => u.age! > 3)?.name;
        "#);
        let kinds: Vec<bool> = body.iter().map(|s| matches!(s, Stmt::Empty)).collect();
        assert_eq!(kinds, vec![true, true, true, false, false, false, false, false]);
    }

    #[test]
    fn test_enum_lowering() {
        let body = ts("enum Color { Red, Green = 5, Blue }");
        match &body[0] {
            Stmt::Var { kind, decls } => {
                assert_eq!(*kind, VarKind::Const);
                match &decls[0].1 {
                    Some(Expr::Object(props)) => assert_eq!(props.len(), 6),
                    other => panic!("unexpected {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_enum_needs_initializer_after_string_member() {
        let err = parse_program(r#"enum E { A = "a", B }"#, TS).unwrap_err();
        assert!(err.message.contains("initializer"));
    }

    #[test]
    fn test_jsx_lowering() {
        let body = tsx(r#"const el = <div className="box" id={id}>
            Hello {name}!
            <br />
        </div>;"#);
        let Stmt::Var { decls, .. } = &body[0] else {
            panic!("expected declaration");
        };
        let Some(Expr::Call { callee, args, .. }) = &decls[0].1 else {
            panic!("expected call");
        };
        assert_eq!(
            **callee,
            Expr::member(Expr::Ident("React".into()), "createElement")
        );
        assert_eq!(args[0], Elem::Expr(Expr::Str("div".into())));
        assert_eq!(args[2], Elem::Expr(Expr::Str("Hello ".into())));
        assert_eq!(args[3], Elem::Expr(Expr::Ident("name".into())));
        assert_eq!(args[4], Elem::Expr(Expr::Str("!".into())));
        assert!(matches!(args[5], Elem::Expr(Expr::Call { .. })));
        assert_eq!(args.len(), 6);
    }

    #[test]
    fn test_jsx_fragment_and_components() {
        let body = tsx("const el = <><App title='x' /><ui.Button disabled /></>");
        let Stmt::Var { decls, .. } = &body[0] else {
            panic!("expected declaration");
        };
        let Some(Expr::Call { args, .. }) = &decls[0].1 else {
            panic!("expected call");
        };
        assert_eq!(
            args[0],
            Elem::Expr(Expr::member(Expr::Ident("React".into()), "Fragment"))
        );
        assert_eq!(args[1], Elem::Expr(Expr::Null));
        assert_eq!(args.len(), 4);
    }

    #[test]
    fn test_mismatched_jsx_tag() {
        let err = parse_program("const el = <div></span>;", TSX).unwrap_err();
        assert!(err.message.contains("closing tag"));
    }

    #[test]
    fn test_syntax_error_reports_its_line() {
        let err = parse_program("let a = 1;\nlet b = (;\n", Dialect::default()).unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.column >= 1);
    }

    #[test]
    fn test_plain_javascript_rejects_annotations() {
        assert!(parse_program("let x: number = 1;", Dialect::default()).is_err());
    }

    #[test]
    fn test_unsupported_constructs_are_named() {
        for (source, what) in [
            ("class A {}", "Classes"),
            ("async function f() {}", "Async functions"),
            ("const r = /ab+c/;", "Regular expressions"),
            ("tag`x`", "Tagged templates"),
            ("outer: for (;;) {}", "Labels"),
        ] {
            let err = parse_program(source, Dialect::default()).unwrap_err();
            assert_eq!(err.message, format!("{what} are not supported"), "{source}");
        }
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        // Lowering recurses up to the nesting cap; give it the worker's room.
        let worker = std::thread::Builder::new()
            .stack_size(64 * 1024 * 1024)
            .spawn(|| {
                let depth = 200_000;
                let parens = format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
                let arrays = format!("x = {}0{};", "[".repeat(depth), "]".repeat(depth));
                [parens, arrays].map(|source| parse_program(&source, Dialect::default()).map(|_| ()))
            })
            .unwrap();
        for outcome in worker.join().unwrap() {
            assert_eq!(outcome.unwrap_err().message, "nesting too deep");
        }
    }

    #[test]
    fn test_moderate_nesting_is_accepted() {
        let source = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        assert_eq!(js(&source), vec![Stmt::Expr(Expr::Num(1.0))]);
    }
}
