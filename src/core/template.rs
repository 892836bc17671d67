//! Liquid-compatible template engine: lenient rendering plus free-variable
//! analysis.
//!
//! The contract the pipeline needs is deliberately forgiving: undefined
//! variables render as empty, undefined filters are no-ops, and the analyzer
//! reports exactly the set of undefined root variables a template references.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::core::error::{AgentError, Result};

// ---------- Values ----------

#[derive(Debug, Clone, PartialEq)]
pub enum TmplValue {
    Nil,
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<TmplValue>),
    Map(BTreeMap<String, TmplValue>),
}

pub type VarMap = BTreeMap<String, TmplValue>;

impl TmplValue {
    fn truthy(&self) -> bool {
        !matches!(self, TmplValue::Nil | TmplValue::Bool(false))
    }

    fn to_display(&self) -> String {
        match self {
            TmplValue::Nil => String::new(),
            TmplValue::Bool(b) => b.to_string(),
            TmplValue::Num(n) => format_num(*n),
            TmplValue::Str(s) => s.clone(),
            TmplValue::List(items) => {
                items.iter().map(TmplValue::to_display).collect::<String>()
            }
            TmplValue::Map(_) => String::new(),
        }
    }
}

fn format_num(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Convert a YAML value (front matter) into a template value.
pub fn yaml_to_value(value: &serde_yaml::Value) -> TmplValue {
    match value {
        serde_yaml::Value::Null => TmplValue::Nil,
        serde_yaml::Value::Bool(b) => TmplValue::Bool(*b),
        serde_yaml::Value::Number(n) => TmplValue::Num(n.as_f64().unwrap_or(0.0)),
        serde_yaml::Value::String(s) => TmplValue::Str(s.clone()),
        serde_yaml::Value::Sequence(seq) => {
            TmplValue::List(seq.iter().map(yaml_to_value).collect())
        }
        serde_yaml::Value::Mapping(map) => {
            let mut out = BTreeMap::new();
            for (k, v) in map {
                if let Some(key) = k.as_str() {
                    out.insert(key.to_string(), yaml_to_value(v));
                }
            }
            TmplValue::Map(out)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_value(&tagged.value),
    }
}

// ---------- AST ----------

#[derive(Debug, Clone)]
enum Node {
    Text(String),
    Output(OutputExpr),
    If {
        branches: Vec<(Expr, Vec<Node>)>,
        else_body: Option<Vec<Node>>,
    },
    Unless {
        cond: Expr,
        body: Vec<Node>,
        else_body: Option<Vec<Node>>,
    },
    For {
        var: String,
        collection: Expr,
        body: Vec<Node>,
    },
    Case {
        subject: Expr,
        whens: Vec<(Vec<Expr>, Vec<Node>)>,
        else_body: Option<Vec<Node>>,
    },
    Assign {
        target: String,
        value: OutputExpr,
    },
    Capture {
        target: String,
        body: Vec<Node>,
    },
    Increment {
        target: String,
    },
}

#[derive(Debug, Clone)]
struct OutputExpr {
    expr: Expr,
    filters: Vec<FilterCall>,
}

#[derive(Debug, Clone)]
struct FilterCall {
    name: String,
    args: Vec<Expr>,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(TmplValue),
    Var(Vec<String>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
    Contains,
}

const KEYWORDS: &[&str] = &[
    "true", "false", "nil", "null", "empty", "blank", "and", "or", "not",
    "contains", "in", "forloop",
];

// ---------- Template ----------

#[derive(Debug, Clone)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    /// Parse template source. Parse failures are fatal template errors.
    pub fn parse(src: &str) -> Result<Template> {
        let toks = lex(src).map_err(AgentError::Template)?;
        let mut parser = Parser {
            toks,
            pos: 0,
        };
        let nodes = parser.parse_nodes(&[]).map_err(AgentError::Template)?;
        Ok(Template { nodes })
    }

    /// Substitute variables and evaluate control flow. Lenient: undefined
    /// variables render as empty, undefined filters are no-ops.
    pub fn render(&self, vars: &VarMap) -> String {
        let mut env = Env {
            globals: vars,
            assigns: BTreeMap::new(),
            loop_stack: Vec::new(),
            counters: BTreeMap::new(),
        };
        let mut out = String::new();
        render_nodes(&self.nodes, &mut env, &mut out);
        out
    }

    /// The set of undefined root-variable names the template references,
    /// excluding names bound by `assign`, `capture`, `for`, or `increment`.
    pub fn free_variables(&self) -> BTreeSet<String> {
        let mut bound: HashSet<String> = HashSet::new();
        collect_bound(&self.nodes, &mut bound);
        let mut free = BTreeSet::new();
        collect_free(&self.nodes, &bound, &mut free);
        free
    }
}

/// Render with a one-shot parse, falling back to the source text when the
/// input is not a valid template. Used for inline command substitution.
pub fn render_lenient(src: &str, vars: &VarMap) -> String {
    match Template::parse(src) {
        Ok(t) => t.render(vars),
        Err(_) => src.to_string(),
    }
}

// ---------- Lexer ----------

#[derive(Debug, Clone)]
enum Tok {
    Text(String),
    Output(String),
    Tag(String),
}

fn lex(src: &str) -> std::result::Result<Vec<Tok>, String> {
    let mut toks = Vec::new();
    let mut rest = src;
    let mut trim_next = false;

    while !rest.is_empty() {
        let next_out = rest.find("{{");
        let next_tag = rest.find("{%");
        let (start, is_tag) = match (next_out, next_tag) {
            (Some(o), Some(t)) if t < o => (t, true),
            (Some(o), _) => (o, false),
            (None, Some(t)) => (t, true),
            (None, None) => {
                push_text(&mut toks, &rest[..], trim_next, false);
                break;
            }
        };

        let closer = if is_tag { "%}" } else { "}}" };
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find(closer) else {
            return Err(format!(
                "unterminated `{}` near byte {start}",
                if is_tag { "{%" } else { "{{" }
            ));
        };

        let mut inner = &after_open[..end];
        let mut trim_before = false;
        if let Some(stripped) = inner.strip_prefix('-') {
            inner = stripped;
            trim_before = true;
        }
        let mut trims_after = false;
        if let Some(stripped) = inner.strip_suffix('-') {
            inner = stripped;
            trims_after = true;
        }
        let inner = inner.trim().to_string();

        push_text(&mut toks, &rest[..start], trim_next, trim_before);
        trim_next = trims_after;
        rest = &after_open[end + closer.len()..];

        if is_tag && inner == "raw" {
            let (raw_text, after) = take_until_end_tag(rest, "endraw")?;
            // The wrapper's own newlines are not content: one newline after
            // `{% raw %}` and one before `{% endraw %}` are dropped
            let raw_text = raw_text
                .strip_prefix("\r\n")
                .or_else(|| raw_text.strip_prefix('\n'))
                .unwrap_or(raw_text);
            let raw_text = raw_text
                .strip_suffix("\r\n")
                .or_else(|| raw_text.strip_suffix('\n'))
                .unwrap_or(raw_text);
            toks.push(Tok::Text(raw_text.to_string()));
            rest = after;
            trim_next = false;
        } else if is_tag && inner == "comment" {
            let (_, after) = take_until_end_tag(rest, "endcomment")?;
            rest = after;
            trim_next = false;
        } else if is_tag {
            toks.push(Tok::Tag(inner));
        } else {
            toks.push(Tok::Output(inner));
        }
    }

    Ok(toks)
}

fn push_text(toks: &mut Vec<Tok>, text: &str, trim_start: bool, trim_end: bool) {
    let mut t = text;
    if trim_start {
        t = t.trim_start();
    }
    let owned = if trim_end {
        t.trim_end().to_string()
    } else {
        t.to_string()
    };
    if !owned.is_empty() {
        toks.push(Tok::Text(owned));
    }
}

/// Scan forward for `{% endraw %}` / `{% endcomment %}`, returning the text
/// before it and the remainder after it.
fn take_until_end_tag<'a>(
    src: &'a str,
    end_name: &str,
) -> std::result::Result<(&'a str, &'a str), String> {
    let mut search = 0usize;
    while let Some(open) = src[search..].find("{%") {
        let abs = search + open;
        if let Some(close) = src[abs + 2..].find("%}") {
            let inner = src[abs + 2..abs + 2 + close]
                .trim_matches('-')
                .trim();
            if inner == end_name {
                return Ok((&src[..abs], &src[abs + 2 + close + 2..]));
            }
            search = abs + 2;
        } else {
            break;
        }
    }
    Err(format!("missing {{% {end_name} %}}"))
}

// ---------- Expression lexer ----------

#[derive(Debug, Clone, PartialEq)]
enum ETok {
    Path(Vec<String>),
    Num(f64),
    Str(String),
    Op(String),
    Pipe,
    Colon,
    Comma,
}

fn lex_expr(src: &str) -> std::result::Result<Vec<ETok>, String> {
    let mut toks = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '|' => {
                toks.push(ETok::Pipe);
                i += 1;
            }
            ':' => {
                toks.push(ETok::Colon);
                i += 1;
            }
            ',' => {
                toks.push(ETok::Comma);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i == chars.len() {
                    return Err(format!("unterminated string in `{src}`"));
                }
                i += 1;
                toks.push(ETok::Str(s));
            }
            '=' | '!' | '<' | '>' => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                if two == "==" || two == "!=" || two == "<=" || two == ">=" || two == "<>" {
                    toks.push(ETok::Op(two));
                    i += 2;
                } else if c == '<' || c == '>' {
                    toks.push(ETok::Op(c.to_string()));
                    i += 1;
                } else {
                    return Err(format!("unexpected `{c}` in `{src}`"));
                }
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || chars[i] == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| format!("bad number `{text}` in `{src}`"))?;
                toks.push(ETok::Num(num));
            }
            c if is_ident_start(c) => {
                let mut segments = Vec::new();
                loop {
                    let start = i;
                    while i < chars.len() && is_ident_char(chars[i]) {
                        i += 1;
                    }
                    segments.push(chars[start..i].iter().collect::<String>());
                    // Continue the path on `.segment` or `[n]`
                    if i < chars.len()
                        && chars[i] == '.'
                        && chars.get(i + 1).is_some_and(|n| is_ident_char(*n))
                    {
                        i += 1;
                        continue;
                    }
                    if i < chars.len() && chars[i] == '[' {
                        let close = chars[i..].iter().position(|c| *c == ']');
                        if let Some(off) = close {
                            let idx: String = chars[i + 1..i + off]
                                .iter()
                                .filter(|c| **c != '\'' && **c != '"')
                                .collect();
                            segments.push(idx);
                            i += off + 1;
                            if i < chars.len()
                                && chars[i] == '.'
                                && chars.get(i + 1).is_some_and(|n| is_ident_char(*n))
                            {
                                i += 1;
                                continue;
                            }
                        }
                    }
                    break;
                }
                toks.push(ETok::Path(segments));
            }
            other => return Err(format!("unexpected `{other}` in `{src}`")),
        }
    }

    Ok(toks)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '$'
}

// ---------- Expression parser ----------

struct ExprParser {
    toks: Vec<ETok>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&ETok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<ETok> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(ETok::Path(p)) if p.len() == 1 && p[0] == kw)
    }

    /// condition := comparison ((and|or) comparison)*
    fn parse_condition(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = if self.at_keyword("and") {
                BinOp::And
            } else if self.at_keyword("or") {
                BinOp::Or
            } else {
                break;
            };
            self.next();
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> std::result::Result<Expr, String> {
        let lhs = self.parse_primary()?;
        let op = match self.peek() {
            Some(ETok::Op(op)) => match op.as_str() {
                "==" => Some(BinOp::Eq),
                "!=" | "<>" => Some(BinOp::Ne),
                "<" => Some(BinOp::Lt),
                ">" => Some(BinOp::Gt),
                "<=" => Some(BinOp::Le),
                ">=" => Some(BinOp::Ge),
                _ => None,
            },
            Some(ETok::Path(p)) if p.len() == 1 && p[0] == "contains" => {
                Some(BinOp::Contains)
            }
            _ => None,
        };
        if let Some(op) = op {
            self.next();
            let rhs = self.parse_primary()?;
            return Ok(Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> std::result::Result<Expr, String> {
        match self.next() {
            Some(ETok::Num(n)) => Ok(Expr::Literal(TmplValue::Num(n))),
            Some(ETok::Str(s)) => Ok(Expr::Literal(TmplValue::Str(s))),
            Some(ETok::Path(p)) => {
                if p.len() == 1 {
                    match p[0].as_str() {
                        "true" => return Ok(Expr::Literal(TmplValue::Bool(true))),
                        "false" => return Ok(Expr::Literal(TmplValue::Bool(false))),
                        "nil" | "null" => return Ok(Expr::Literal(TmplValue::Nil)),
                        "empty" | "blank" => {
                            return Ok(Expr::Literal(TmplValue::Str(String::new())));
                        }
                        _ => {}
                    }
                }
                Ok(Expr::Var(p))
            }
            other => Err(format!("expected expression, found {other:?}")),
        }
    }

    /// output := primary filters*
    fn parse_output(&mut self) -> std::result::Result<OutputExpr, String> {
        let expr = self.parse_primary()?;
        let mut filters = Vec::new();
        while matches!(self.peek(), Some(ETok::Pipe)) {
            self.next();
            let name = match self.next() {
                Some(ETok::Path(p)) if p.len() == 1 => p[0].clone(),
                other => return Err(format!("expected filter name, found {other:?}")),
            };
            let mut args = Vec::new();
            if matches!(self.peek(), Some(ETok::Colon)) {
                self.next();
                loop {
                    args.push(self.parse_primary()?);
                    if matches!(self.peek(), Some(ETok::Comma)) {
                        self.next();
                    } else {
                        break;
                    }
                }
            }
            filters.push(FilterCall { name, args });
        }
        Ok(OutputExpr { expr, filters })
    }
}

fn parse_output_expr(src: &str) -> std::result::Result<OutputExpr, String> {
    let mut p = ExprParser {
        toks: lex_expr(src)?,
        pos: 0,
    };
    let out = p.parse_output()?;
    if p.pos != p.toks.len() {
        return Err(format!("trailing tokens in `{src}`"));
    }
    Ok(out)
}

fn parse_condition_expr(src: &str) -> std::result::Result<Expr, String> {
    let mut p = ExprParser {
        toks: lex_expr(src)?,
        pos: 0,
    };
    let out = p.parse_condition()?;
    if p.pos != p.toks.len() {
        return Err(format!("trailing tokens in `{src}`"));
    }
    Ok(out)
}

// ---------- Block parser ----------

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    /// Parse nodes until one of the `stop` tag names. The stop tag is left
    /// unconsumed (its name is available through `peek_tag_name`).
    fn parse_nodes(&mut self, stop: &[&str]) -> std::result::Result<Vec<Node>, String> {
        let mut nodes = Vec::new();
        while self.pos < self.toks.len() {
            match &self.toks[self.pos] {
                Tok::Text(t) => {
                    nodes.push(Node::Text(t.clone()));
                    self.pos += 1;
                }
                Tok::Output(inner) => {
                    nodes.push(Node::Output(parse_output_expr(inner)?));
                    self.pos += 1;
                }
                Tok::Tag(inner) => {
                    let (name, rest) = split_tag(inner);
                    if stop.contains(&name) {
                        return Ok(nodes);
                    }
                    let (name, rest) = (name.to_string(), rest.to_string());
                    self.pos += 1;
                    nodes.push(self.parse_tag(&name, &rest)?);
                }
            }
        }
        if stop.is_empty() {
            Ok(nodes)
        } else {
            Err(format!("missing closing tag (expected one of {stop:?})"))
        }
    }

    fn peek_tag(&self) -> Option<(&str, &str)> {
        match self.toks.get(self.pos) {
            Some(Tok::Tag(inner)) => Some(split_tag(inner)),
            _ => None,
        }
    }

    fn consume_tag(&mut self) -> Option<(String, String)> {
        let out = self
            .peek_tag()
            .map(|(n, r)| (n.to_string(), r.to_string()));
        if out.is_some() {
            self.pos += 1;
        }
        out
    }

    fn parse_tag(&mut self, name: &str, rest: &str) -> std::result::Result<Node, String> {
        match name {
            "if" | "unless" => self.parse_conditional(name, rest),
            "for" => self.parse_for(rest),
            "case" => self.parse_case(rest),
            "assign" => {
                let (target, expr) = rest
                    .split_once('=')
                    .ok_or_else(|| format!("assign without `=`: `{rest}`"))?;
                Ok(Node::Assign {
                    target: target.trim().to_string(),
                    value: parse_output_expr(expr.trim())?,
                })
            }
            "capture" => {
                let target = rest.trim().to_string();
                let body = self.parse_nodes(&["endcapture"])?;
                self.consume_tag();
                Ok(Node::Capture { target, body })
            }
            "increment" => Ok(Node::Increment {
                target: rest.trim().to_string(),
            }),
            // Unknown tags are lenient no-ops rendered as nothing
            _ => Ok(Node::Text(String::new())),
        }
    }

    fn parse_conditional(
        &mut self,
        kind: &str,
        rest: &str,
    ) -> std::result::Result<Node, String> {
        let endtag: &str = if kind == "if" { "endif" } else { "endunless" };
        let first_cond = parse_condition_expr(rest)?;
        let stops = ["elsif", "else", endtag];

        let mut branches = vec![(first_cond, self.parse_nodes(&stops)?)];
        let mut else_body = None;
        loop {
            let Some((name, tag_rest)) = self.consume_tag() else {
                return Err(format!("missing {{% {endtag} %}}"));
            };
            match name.as_str() {
                "elsif" => {
                    let cond = parse_condition_expr(&tag_rest)?;
                    branches.push((cond, self.parse_nodes(&stops)?));
                }
                "else" => {
                    else_body = Some(self.parse_nodes(&[endtag])?);
                    self.consume_tag();
                    break;
                }
                n if n == endtag => break,
                other => return Err(format!("unexpected {{% {other} %}}")),
            }
        }

        if kind == "if" {
            Ok(Node::If {
                branches,
                else_body,
            })
        } else {
            let (cond, body) = branches.remove(0);
            Ok(Node::Unless {
                cond,
                body,
                else_body,
            })
        }
    }

    fn parse_for(&mut self, rest: &str) -> std::result::Result<Node, String> {
        let (var, collection) = rest
            .split_once(" in ")
            .ok_or_else(|| format!("for without `in`: `{rest}`"))?;
        let collection = parse_condition_expr(collection.trim())?;
        let body = self.parse_nodes(&["endfor"])?;
        self.consume_tag();
        Ok(Node::For {
            var: var.trim().to_string(),
            collection,
            body,
        })
    }

    fn parse_case(&mut self, rest: &str) -> std::result::Result<Node, String> {
        let subject = parse_condition_expr(rest.trim())?;
        // Anything before the first `when` is discarded (whitespace)
        let _ = self.parse_nodes(&["when", "else", "endcase"])?;

        let mut whens = Vec::new();
        let mut else_body = None;
        loop {
            let Some((name, tag_rest)) = self.consume_tag() else {
                return Err("missing {% endcase %}".to_string());
            };
            match name.as_str() {
                "when" => {
                    let mut values = Vec::new();
                    for part in tag_rest.split(',').flat_map(|p| p.split(" or ")) {
                        let part = part.trim();
                        if !part.is_empty() {
                            values.push(
                                parse_condition_expr(part)
                                    .map_err(|e| format!("bad when value: {e}"))?,
                            );
                        }
                    }
                    let body = self.parse_nodes(&["when", "else", "endcase"])?;
                    whens.push((values, body));
                }
                "else" => {
                    else_body = Some(self.parse_nodes(&["endcase"])?);
                    self.consume_tag();
                    break;
                }
                "endcase" => break,
                other => return Err(format!("unexpected {{% {other} %}} in case")),
            }
        }

        Ok(Node::Case {
            subject,
            whens,
            else_body,
        })
    }
}

fn split_tag(inner: &str) -> (&str, &str) {
    match inner.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (inner, ""),
    }
}

// ---------- Renderer ----------

struct Env<'a> {
    globals: &'a VarMap,
    assigns: BTreeMap<String, TmplValue>,
    loop_stack: Vec<(String, TmplValue)>,
    counters: BTreeMap<String, i64>,
}

impl Env<'_> {
    fn lookup(&self, path: &[String]) -> TmplValue {
        let root = &path[0];
        let base = self
            .loop_stack
            .iter()
            .rev()
            .find(|(name, _)| name == root)
            .map(|(_, v)| v.clone())
            .or_else(|| self.assigns.get(root).cloned())
            .or_else(|| self.globals.get(root).cloned())
            .unwrap_or(TmplValue::Nil);

        path[1..].iter().fold(base, |acc, seg| match acc {
            TmplValue::Map(map) => map.get(seg).cloned().unwrap_or(TmplValue::Nil),
            TmplValue::List(items) => seg
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i).cloned())
                .unwrap_or(TmplValue::Nil),
            _ => TmplValue::Nil,
        })
    }
}

fn render_nodes(nodes: &[Node], env: &mut Env, out: &mut String) {
    for node in nodes {
        render_node(node, env, out);
    }
}

fn render_node(node: &Node, env: &mut Env, out: &mut String) {
    match node {
        Node::Text(t) => out.push_str(t),
        Node::Output(expr) => {
            let value = eval_output(expr, env);
            out.push_str(&value.to_display());
        }
        Node::If {
            branches,
            else_body,
        } => {
            for (cond, body) in branches {
                if eval_expr(cond, env).truthy() {
                    render_nodes(body, env, out);
                    return;
                }
            }
            if let Some(body) = else_body {
                render_nodes(body, env, out);
            }
        }
        Node::Unless {
            cond,
            body,
            else_body,
        } => {
            if !eval_expr(cond, env).truthy() {
                render_nodes(body, env, out);
            } else if let Some(body) = else_body {
                render_nodes(body, env, out);
            }
        }
        Node::For {
            var,
            collection,
            body,
        } => {
            let items = match eval_expr(collection, env) {
                TmplValue::List(items) => items,
                TmplValue::Map(map) => map.into_values().collect(),
                TmplValue::Nil => Vec::new(),
                other => vec![other],
            };
            let len = items.len();
            for (i, item) in items.into_iter().enumerate() {
                let mut forloop = BTreeMap::new();
                forloop.insert("index".to_string(), TmplValue::Num((i + 1) as f64));
                forloop.insert("index0".to_string(), TmplValue::Num(i as f64));
                forloop.insert("first".to_string(), TmplValue::Bool(i == 0));
                forloop.insert("last".to_string(), TmplValue::Bool(i + 1 == len));
                forloop.insert("length".to_string(), TmplValue::Num(len as f64));
                env.loop_stack.push((var.clone(), item));
                env.loop_stack
                    .push(("forloop".to_string(), TmplValue::Map(forloop)));
                render_nodes(body, env, out);
                env.loop_stack.pop();
                env.loop_stack.pop();
            }
        }
        Node::Case {
            subject,
            whens,
            else_body,
        } => {
            let subject = eval_expr(subject, env);
            for (values, body) in whens {
                if values
                    .iter()
                    .any(|v| values_equal(&subject, &eval_expr(v, env)))
                {
                    render_nodes(body, env, out);
                    return;
                }
            }
            if let Some(body) = else_body {
                render_nodes(body, env, out);
            }
        }
        Node::Assign { target, value } => {
            let v = eval_output(value, env);
            env.assigns.insert(target.clone(), v);
        }
        Node::Capture { target, body } => {
            let mut captured = String::new();
            render_nodes(body, env, &mut captured);
            env.assigns.insert(target.clone(), TmplValue::Str(captured));
        }
        Node::Increment { target } => {
            let counter = env.counters.entry(target.clone()).or_insert(0);
            out.push_str(&counter.to_string());
            *counter += 1;
        }
    }
}

fn eval_output(expr: &OutputExpr, env: &Env) -> TmplValue {
    let mut value = eval_expr(&expr.expr, env);
    for filter in &expr.filters {
        let args: Vec<TmplValue> =
            filter.args.iter().map(|a| eval_expr(a, env)).collect();
        value = apply_filter(&filter.name, value, &args);
    }
    value
}

fn eval_expr(expr: &Expr, env: &Env) -> TmplValue {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Var(path) => env.lookup(path),
        Expr::Binary { op, lhs, rhs } => {
            let l = eval_expr(lhs, env);
            match op {
                BinOp::And => {
                    return TmplValue::Bool(l.truthy() && eval_expr(rhs, env).truthy());
                }
                BinOp::Or => {
                    return TmplValue::Bool(l.truthy() || eval_expr(rhs, env).truthy());
                }
                _ => {}
            }
            let r = eval_expr(rhs, env);
            let result = match op {
                BinOp::Eq => values_equal(&l, &r),
                BinOp::Ne => !values_equal(&l, &r),
                BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => compare(&l, &r, *op),
                BinOp::Contains => contains(&l, &r),
                BinOp::And | BinOp::Or => unreachable!(),
            };
            TmplValue::Bool(result)
        }
    }
}

fn values_equal(l: &TmplValue, r: &TmplValue) -> bool {
    match (l, r) {
        (TmplValue::Num(a), TmplValue::Num(b)) => a == b,
        (TmplValue::Str(a), TmplValue::Str(b)) => a == b,
        (TmplValue::Bool(a), TmplValue::Bool(b)) => a == b,
        (TmplValue::Nil, TmplValue::Nil) => true,
        _ => false,
    }
}

fn compare(l: &TmplValue, r: &TmplValue, op: BinOp) -> bool {
    let ord = match (l, r) {
        (TmplValue::Num(a), TmplValue::Num(b)) => a.partial_cmp(b),
        (TmplValue::Str(a), TmplValue::Str(b)) => Some(a.cmp(b)),
        _ => None,
    };
    let Some(ord) = ord else { return false };
    match op {
        BinOp::Lt => ord.is_lt(),
        BinOp::Gt => ord.is_gt(),
        BinOp::Le => ord.is_le(),
        BinOp::Ge => ord.is_ge(),
        _ => false,
    }
}

fn contains(l: &TmplValue, r: &TmplValue) -> bool {
    match l {
        TmplValue::Str(s) => s.contains(&r.to_display()),
        TmplValue::List(items) => items.iter().any(|i| values_equal(i, r)),
        _ => false,
    }
}

fn apply_filter(name: &str, value: TmplValue, args: &[TmplValue]) -> TmplValue {
    match name {
        "default" => {
            let is_blank = matches!(
                &value,
                TmplValue::Nil | TmplValue::Bool(false)
            ) || matches!(&value, TmplValue::Str(s) if s.is_empty());
            if is_blank {
                args.first().cloned().unwrap_or(TmplValue::Nil)
            } else {
                value
            }
        }
        "upcase" => TmplValue::Str(value.to_display().to_uppercase()),
        "downcase" => TmplValue::Str(value.to_display().to_lowercase()),
        "truncate" => {
            let len = match args.first() {
                Some(TmplValue::Num(n)) => *n as usize,
                _ => 50,
            };
            let ellipsis = match args.get(1) {
                Some(TmplValue::Str(s)) => s.clone(),
                _ => "...".to_string(),
            };
            let s = value.to_display();
            if s.chars().count() <= len {
                TmplValue::Str(s)
            } else {
                let keep = len.saturating_sub(ellipsis.chars().count());
                let truncated: String = s.chars().take(keep).collect();
                TmplValue::Str(format!("{truncated}{ellipsis}"))
            }
        }
        "append" => {
            let suffix = args.first().map(TmplValue::to_display).unwrap_or_default();
            TmplValue::Str(format!("{}{suffix}", value.to_display()))
        }
        "prepend" => {
            let prefix = args.first().map(TmplValue::to_display).unwrap_or_default();
            TmplValue::Str(format!("{prefix}{}", value.to_display()))
        }
        "strip" => TmplValue::Str(value.to_display().trim().to_string()),
        "size" => {
            let n = match &value {
                TmplValue::Str(s) => s.chars().count(),
                TmplValue::List(items) => items.len(),
                TmplValue::Map(map) => map.len(),
                _ => 0,
            };
            TmplValue::Num(n as f64)
        }
        "join" => {
            let sep = args.first().map(TmplValue::to_display).unwrap_or_else(|| " ".to_string());
            match value {
                TmplValue::List(items) => TmplValue::Str(
                    items
                        .iter()
                        .map(TmplValue::to_display)
                        .collect::<Vec<_>>()
                        .join(&sep),
                ),
                other => other,
            }
        }
        "split" => {
            let sep = args.first().map(TmplValue::to_display).unwrap_or_default();
            if sep.is_empty() {
                return value;
            }
            TmplValue::List(
                value
                    .to_display()
                    .split(&sep)
                    .map(|s| TmplValue::Str(s.to_string()))
                    .collect(),
            )
        }
        "replace" => {
            let from = args.first().map(TmplValue::to_display).unwrap_or_default();
            let to = args.get(1).map(TmplValue::to_display).unwrap_or_default();
            if from.is_empty() {
                return value;
            }
            TmplValue::Str(value.to_display().replace(&from, &to))
        }
        // Undefined filters are no-ops
        _ => value,
    }
}

// ---------- Free-variable analysis ----------

fn collect_bound(nodes: &[Node], bound: &mut HashSet<String>) {
    for node in nodes {
        match node {
            Node::Assign { target, .. }
            | Node::Capture { target, .. }
            | Node::Increment { target } => {
                bound.insert(target.clone());
            }
            Node::For { var, body, .. } => {
                bound.insert(var.clone());
                collect_bound(body, bound);
            }
            Node::If {
                branches,
                else_body,
            } => {
                for (_, body) in branches {
                    collect_bound(body, bound);
                }
                if let Some(body) = else_body {
                    collect_bound(body, bound);
                }
            }
            Node::Unless {
                body, else_body, ..
            } => {
                collect_bound(body, bound);
                if let Some(body) = else_body {
                    collect_bound(body, bound);
                }
            }
            Node::Case {
                whens, else_body, ..
            } => {
                for (_, body) in whens {
                    collect_bound(body, bound);
                }
                if let Some(body) = else_body {
                    collect_bound(body, bound);
                }
            }
            Node::Text(_) | Node::Output(_) => {}
        }
    }
    // Capture bodies may themselves bind
    for node in nodes {
        if let Node::Capture { body, .. } = node {
            collect_bound(body, bound);
        }
    }
}

fn collect_free(nodes: &[Node], bound: &HashSet<String>, free: &mut BTreeSet<String>) {
    for node in nodes {
        match node {
            Node::Text(_) | Node::Increment { .. } => {}
            Node::Output(expr) => collect_free_output(expr, bound, free),
            Node::Assign { value, .. } => collect_free_output(value, bound, free),
            Node::Capture { body, .. } => collect_free(body, bound, free),
            Node::If {
                branches,
                else_body,
            } => {
                for (cond, body) in branches {
                    collect_free_expr(cond, bound, free);
                    collect_free(body, bound, free);
                }
                if let Some(body) = else_body {
                    collect_free(body, bound, free);
                }
            }
            Node::Unless {
                cond,
                body,
                else_body,
            } => {
                collect_free_expr(cond, bound, free);
                collect_free(body, bound, free);
                if let Some(body) = else_body {
                    collect_free(body, bound, free);
                }
            }
            Node::For {
                collection, body, ..
            } => {
                collect_free_expr(collection, bound, free);
                collect_free(body, bound, free);
            }
            Node::Case {
                subject,
                whens,
                else_body,
            } => {
                collect_free_expr(subject, bound, free);
                for (values, body) in whens {
                    for v in values {
                        collect_free_expr(v, bound, free);
                    }
                    collect_free(body, bound, free);
                }
                if let Some(body) = else_body {
                    collect_free(body, bound, free);
                }
            }
        }
    }
}

fn collect_free_output(expr: &OutputExpr, bound: &HashSet<String>, free: &mut BTreeSet<String>) {
    collect_free_expr(&expr.expr, bound, free);
    for filter in &expr.filters {
        for arg in &filter.args {
            collect_free_expr(arg, bound, free);
        }
    }
}

fn collect_free_expr(expr: &Expr, bound: &HashSet<String>, free: &mut BTreeSet<String>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Var(path) => {
            let root = &path[0];
            if !bound.contains(root) && !KEYWORDS.contains(&root.as_str()) {
                free.insert(root.clone());
            }
        }
        Expr::Binary { lhs, rhs, .. } => {
            collect_free_expr(lhs, bound, free);
            collect_free_expr(rhs, bound, free);
        }
    }
}
