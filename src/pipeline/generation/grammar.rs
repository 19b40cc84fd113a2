//! Token-acceptance automaton compiled from a JSON Schema.
//!
//! The automaton consumes text one character at a time and tracks every
//! parse configuration that is still a valid prefix of *some* document
//! conforming to the schema. A decoder asks [`SchemaAutomaton::admits`]
//! before emitting a piece and [`SchemaAutomaton::advance`] after; a
//! document the automaton reports [`SchemaAutomaton::is_complete`] on is
//! both valid JSON and schema-conforming.
//!
//! Supported draft-7 subset: `type` (single or list), `properties`,
//! `required`, `additionalProperties` (bool or schema), `items`,
//! `minItems`/`maxItems`, `enum`, `const`, `anyOf`/`oneOf` (treated as a
//! union), single-member `allOf`, and local `$ref` (`#/definitions/..`,
//! `#/$defs/..`, `#`). Anything else fails compilation so the caller can
//! fall back to unconstrained decoding.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

type NodeId = usize;

/// Arena slot 0 is always the unconstrained value.
const ANY: NodeId = 0;

const NO_PROPERTIES: &[(String, NodeId)] = &[];
const NO_REQUIRED: &[String] = &[];

const MAX_EXPANSION_DEPTH: usize = 32;
const MAX_CONFIGURATIONS: usize = 256;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GrammarError {
    #[error("Unsupported schema construct: {0}")]
    Unsupported(String),

    #[error("Unresolvable $ref: {0}")]
    BadRef(String),

    #[error("Text rejected by schema grammar at offset {offset}: {excerpt:?}")]
    Rejected { offset: usize, excerpt: String },
}

// ═══════════════════════════════════════════════════════════
// Compilation
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
enum Node {
    Any,
    Null,
    Boolean,
    Integer,
    Number,
    String,
    /// Exact compact JSON text of an `enum`/`const` member.
    Const(Arc<str>),
    Object {
        properties: Vec<(String, NodeId)>,
        required: Vec<String>,
        /// `None` when `additionalProperties: false`.
        additional: Option<NodeId>,
    },
    Array {
        items: NodeId,
        min_items: usize,
        max_items: Option<usize>,
    },
    Union(Vec<NodeId>),
    Ref(NodeId),
}

/// A schema compiled into a node arena. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct CompiledSchema {
    nodes: Vec<Node>,
    root: NodeId,
    document: Value,
}

impl CompiledSchema {
    pub fn compile(document: &Value) -> Result<Self, GrammarError> {
        let mut compiler = Compiler {
            nodes: vec![Node::Any],
            refs: HashMap::new(),
            document,
        };
        let root = compiler.compile(document)?;
        Ok(Self {
            nodes: compiler.nodes,
            root,
            document: document.clone(),
        })
    }

    /// The schema document this grammar was compiled from.
    pub fn document(&self) -> &Value {
        &self.document
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    fn object_spec(&self, id: NodeId) -> (&[(String, NodeId)], &[String], Option<NodeId>) {
        match self.node(id) {
            Node::Object {
                properties,
                required,
                additional,
            } => (properties.as_slice(), required.as_slice(), *additional),
            _ => (NO_PROPERTIES, NO_REQUIRED, Some(ANY)),
        }
    }

    fn array_spec(&self, id: NodeId) -> (NodeId, usize, Option<usize>) {
        match self.node(id) {
            Node::Array {
                items,
                min_items,
                max_items,
            } => (*items, *min_items, *max_items),
            _ => (ANY, 0, None),
        }
    }

    fn property_node(&self, object: NodeId, key: &str) -> Option<NodeId> {
        let (properties, _, additional) = self.object_spec(object);
        properties
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, id)| *id)
            .or(additional)
    }

    fn can_add_key(&self, object: NodeId, seen: &[String]) -> bool {
        let (properties, _, additional) = self.object_spec(object);
        additional.is_some() || properties.iter().any(|(name, _)| !seen.contains(name))
    }

    fn key_prefix_allowed(&self, object: NodeId, seen: &[String], prefix: &str) -> bool {
        let (properties, _, additional) = self.object_spec(object);
        additional.is_some()
            || properties
                .iter()
                .any(|(name, _)| !seen.contains(name) && name.starts_with(prefix))
    }

    fn key_allowed(&self, object: NodeId, seen: &[String], key: &str) -> bool {
        if seen.iter().any(|s| s == key) {
            return false;
        }
        let (properties, _, additional) = self.object_spec(object);
        additional.is_some() || properties.iter().any(|(name, _)| name == key)
    }

    fn required_satisfied(&self, object: NodeId, seen: &[String]) -> bool {
        let (_, required, _) = self.object_spec(object);
        required.iter().all(|r| seen.contains(r))
    }
}

struct Compiler<'a> {
    nodes: Vec<Node>,
    refs: HashMap<String, NodeId>,
    document: &'a Value,
}

impl Compiler<'_> {
    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn compile(&mut self, schema: &Value) -> Result<NodeId, GrammarError> {
        let obj = match schema {
            Value::Bool(true) => return Ok(ANY),
            Value::Bool(false) => {
                return Err(GrammarError::Unsupported("schema `false`".into()));
            }
            Value::Object(obj) => obj,
            _ => {
                return Err(GrammarError::Unsupported(
                    "schema must be an object or boolean".into(),
                ));
            }
        };

        if let Some(reference) = obj.get("$ref") {
            let reference = reference
                .as_str()
                .ok_or_else(|| GrammarError::BadRef(reference.to_string()))?;
            return self.compile_ref(reference);
        }

        if let Some(value) = obj.get("const") {
            return Ok(self.push(Node::Const(Arc::from(value.to_string()))));
        }

        if let Some(values) = obj.get("enum") {
            let values = values
                .as_array()
                .ok_or_else(|| GrammarError::Unsupported("`enum` must be an array".into()))?;
            let members = values
                .iter()
                .map(|v| self.push(Node::Const(Arc::from(v.to_string()))))
                .collect();
            return Ok(self.push(Node::Union(members)));
        }

        for keyword in ["anyOf", "oneOf"] {
            if let Some(options) = obj.get(keyword) {
                let options = options.as_array().ok_or_else(|| {
                    GrammarError::Unsupported(format!("`{keyword}` must be an array"))
                })?;
                let members = options
                    .iter()
                    .map(|s| self.compile(s))
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(self.push(Node::Union(members)));
            }
        }

        if let Some(all) = obj.get("allOf") {
            return match all.as_array().map(Vec::as_slice) {
                Some([single]) => self.compile(single),
                _ => Err(GrammarError::Unsupported(
                    "`allOf` with more than one member".into(),
                )),
            };
        }

        match obj.get("type") {
            Some(Value::String(ty)) => self.compile_typed(ty, obj),
            Some(Value::Array(types)) => {
                let mut members = Vec::with_capacity(types.len());
                for ty in types {
                    let ty = ty.as_str().ok_or_else(|| {
                        GrammarError::Unsupported(format!("type entry {ty}"))
                    })?;
                    members.push(self.compile_typed(ty, obj)?);
                }
                Ok(self.push(Node::Union(members)))
            }
            Some(other) => Err(GrammarError::Unsupported(format!("type {other}"))),
            None if obj.contains_key("properties")
                || obj.contains_key("required")
                || obj.contains_key("additionalProperties") =>
            {
                self.compile_typed("object", obj)
            }
            None if obj.contains_key("items") => self.compile_typed("array", obj),
            None => Ok(ANY),
        }
    }

    fn compile_typed(&mut self, ty: &str, obj: &Map<String, Value>) -> Result<NodeId, GrammarError> {
        let node = match ty {
            "null" => Node::Null,
            "boolean" => Node::Boolean,
            "integer" => Node::Integer,
            "number" => Node::Number,
            "string" => Node::String,
            "object" => return self.compile_object(obj),
            "array" => return self.compile_array(obj),
            other => return Err(GrammarError::Unsupported(format!("type '{other}'"))),
        };
        Ok(self.push(node))
    }

    fn compile_object(&mut self, obj: &Map<String, Value>) -> Result<NodeId, GrammarError> {
        let mut properties = Vec::new();
        if let Some(props) = obj.get("properties") {
            let props = props
                .as_object()
                .ok_or_else(|| GrammarError::Unsupported("`properties` must be an object".into()))?;
            for (name, schema) in props {
                let id = self.compile(schema)?;
                properties.push((name.clone(), id));
            }
        }

        let required: Vec<String> = match obj.get("required") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(_) => {
                return Err(GrammarError::Unsupported("`required` must be an array".into()));
            }
        };

        let additional = match obj.get("additionalProperties") {
            None | Some(Value::Bool(true)) => Some(ANY),
            Some(Value::Bool(false)) => None,
            Some(schema) => Some(self.compile(schema)?),
        };

        if additional.is_none() {
            if let Some(missing) = required
                .iter()
                .find(|r| !properties.iter().any(|(name, _)| name == *r))
            {
                return Err(GrammarError::Unsupported(format!(
                    "required property '{missing}' is not declared and additional properties are forbidden"
                )));
            }
        }

        Ok(self.push(Node::Object {
            properties,
            required,
            additional,
        }))
    }

    fn compile_array(&mut self, obj: &Map<String, Value>) -> Result<NodeId, GrammarError> {
        let items = match obj.get("items") {
            None => ANY,
            Some(Value::Array(_)) => {
                return Err(GrammarError::Unsupported("tuple-form `items`".into()));
            }
            Some(schema) => self.compile(schema)?,
        };
        let min_items = obj.get("minItems").and_then(Value::as_u64).unwrap_or(0) as usize;
        let max_items = obj.get("maxItems").and_then(Value::as_u64).map(|m| m as usize);
        if max_items.is_some_and(|max| max < min_items) {
            return Err(GrammarError::Unsupported("maxItems below minItems".into()));
        }
        Ok(self.push(Node::Array {
            items,
            min_items,
            max_items,
        }))
    }

    fn compile_ref(&mut self, reference: &str) -> Result<NodeId, GrammarError> {
        if let Some(&id) = self.refs.get(reference) {
            return Ok(id);
        }
        let pointer = reference
            .strip_prefix('#')
            .ok_or_else(|| GrammarError::BadRef(reference.to_string()))?;
        let document = self.document;
        let target = document
            .pointer(pointer)
            .ok_or_else(|| GrammarError::BadRef(reference.to_string()))?;

        let placeholder = self.push(Node::Any);
        self.refs.insert(reference.to_string(), placeholder);
        let resolved = self.compile(target)?;

        // A chain of refs that loops back without consuming input would
        // never terminate at decode time.
        let mut cursor = resolved;
        for _ in 0..=self.nodes.len() {
            if cursor == placeholder {
                return Err(GrammarError::BadRef(format!("{reference} refers to itself")));
            }
            match self.nodes[cursor] {
                Node::Ref(next) => cursor = next,
                _ => break,
            }
        }

        self.nodes[placeholder] = Node::Ref(resolved);
        Ok(placeholder)
    }
}

// ═══════════════════════════════════════════════════════════
// Automaton
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
enum Frame {
    /// Expecting the start of a value.
    Value(NodeId),
    Object {
        node: NodeId,
        seen: Vec<String>,
        state: ObjectState,
    },
    Array {
        node: NodeId,
        count: usize,
        state: ArrayState,
    },
    /// Inside a string; `key` holds the decoded text when it is an object key.
    Str { key: Option<String>, escape: Escape },
    Number { state: NumberState, integer: bool },
    Literal { text: Arc<str>, pos: usize },
}

#[derive(Debug, Clone, PartialEq)]
enum ObjectState {
    Open,
    AfterComma,
    AfterKey(String),
    InValue,
    AfterValue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ArrayState {
    Open,
    AfterComma,
    InValue,
    AfterValue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Escape {
    None,
    Backslash,
    Unicode { digits: u8, code: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum NumberState {
    Minus,
    Zero,
    Int,
    Dot,
    Frac,
    Exp,
    ExpSign,
    ExpDigits,
}

impl NumberState {
    fn start(c: char) -> Option<Self> {
        match c {
            '-' => Some(Self::Minus),
            '0' => Some(Self::Zero),
            '1'..='9' => Some(Self::Int),
            _ => None,
        }
    }

    fn next(self, c: char, integer: bool) -> Option<Self> {
        use NumberState::*;
        match (self, c) {
            (Minus, '0') => Some(Zero),
            (Minus, '1'..='9') => Some(Int),
            (Int, '0'..='9') => Some(Int),
            (Zero | Int, '.') if !integer => Some(Dot),
            (Zero | Int | Frac, 'e' | 'E') if !integer => Some(Exp),
            (Dot | Frac, '0'..='9') => Some(Frac),
            (Exp, '+' | '-') => Some(ExpSign),
            (Exp | ExpSign | ExpDigits, '0'..='9') => Some(ExpDigits),
            _ => None,
        }
    }

    fn is_accepting(self) -> bool {
        matches!(self, Self::Zero | Self::Int | Self::Frac | Self::ExpDigits)
    }
}

fn is_ws(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r')
}

/// Notify the parent frame that the value it was waiting for is finished.
fn complete_value(stack: &mut [Frame]) {
    match stack.last_mut() {
        Some(Frame::Object { state, .. }) => *state = ObjectState::AfterValue,
        Some(Frame::Array { count, state, .. }) => {
            *count += 1;
            *state = ArrayState::AfterValue;
        }
        _ => {}
    }
}

/// Incremental recognizer for documents conforming to a [`CompiledSchema`].
#[derive(Debug, Clone)]
pub struct SchemaAutomaton {
    schema: Arc<CompiledSchema>,
    configs: Vec<Vec<Frame>>,
    consumed: usize,
}

impl SchemaAutomaton {
    pub fn new(schema: Arc<CompiledSchema>) -> Self {
        let root = schema.root;
        Self {
            schema,
            configs: vec![vec![Frame::Value(root)]],
            consumed: 0,
        }
    }

    pub fn schema(&self) -> &Arc<CompiledSchema> {
        &self.schema
    }

    /// Characters accepted so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Would `piece` keep the output a valid prefix? Does not change state.
    pub fn admits(&self, piece: &str) -> bool {
        !self.run(piece).is_empty()
    }

    /// Consume `piece`. On rejection the automaton is left unchanged.
    pub fn advance(&mut self, piece: &str) -> Result<(), GrammarError> {
        let next = self.run(piece);
        if next.is_empty() {
            return Err(GrammarError::Rejected {
                offset: self.consumed,
                excerpt: piece.chars().take(40).collect(),
            });
        }
        self.configs = next;
        self.consumed += piece.chars().count();
        Ok(())
    }

    /// True when the text consumed so far is a complete conforming document.
    pub fn is_complete(&self) -> bool {
        self.configs.iter().any(|stack| match stack.as_slice() {
            [] => true,
            [Frame::Number { state, .. }] => state.is_accepting(),
            _ => false,
        })
    }

    fn run(&self, piece: &str) -> Vec<Vec<Frame>> {
        let mut current = self.configs.clone();
        for c in piece.chars() {
            let mut next = Vec::new();
            for stack in current {
                self.step(stack, c, &mut next);
            }
            current = Vec::with_capacity(next.len());
            for stack in next {
                if !current.contains(&stack) {
                    current.push(stack);
                }
            }
            current.truncate(MAX_CONFIGURATIONS);
            if current.is_empty() {
                break;
            }
        }
        current
    }

    fn step(&self, mut stack: Vec<Frame>, c: char, out: &mut Vec<Vec<Frame>>) {
        let Some(top) = stack.pop() else {
            // Root value finished: only trailing whitespace is allowed.
            if is_ws(c) {
                out.push(stack);
            }
            return;
        };

        match top {
            Frame::Value(node) => {
                if is_ws(c) {
                    stack.push(Frame::Value(node));
                    out.push(stack);
                } else {
                    self.start_value(stack, node, c, out, 0);
                }
            }
            Frame::Literal { text, pos } => {
                if text[pos..].starts_with(c) {
                    let pos = pos + c.len_utf8();
                    if pos == text.len() {
                        complete_value(&mut stack);
                    } else {
                        stack.push(Frame::Literal { text, pos });
                    }
                    out.push(stack);
                }
            }
            Frame::Number { state, integer } => match state.next(c, integer) {
                Some(next) => {
                    stack.push(Frame::Number {
                        state: next,
                        integer,
                    });
                    out.push(stack);
                }
                None if state.is_accepting() => {
                    complete_value(&mut stack);
                    self.step(stack, c, out);
                }
                None => {}
            },
            Frame::Str { key, escape } => self.step_string(stack, key, escape, c, out),
            Frame::Object { node, seen, state } => self.step_object(stack, node, seen, state, c, out),
            Frame::Array { node, count, state } => self.step_array(stack, node, count, state, c, out),
        }
    }

    fn start_value(
        &self,
        stack: Vec<Frame>,
        node: NodeId,
        c: char,
        out: &mut Vec<Vec<Frame>>,
        depth: usize,
    ) {
        if depth > MAX_EXPANSION_DEPTH {
            return;
        }
        match self.schema.node(node) {
            Node::Ref(target) => self.start_value(stack, *target, c, out, depth + 1),
            Node::Union(options) => {
                for &option in options {
                    self.start_value(stack.clone(), option, c, out, depth + 1);
                }
            }
            Node::Any => match c {
                '{' | '[' | '"' => self.open_container(stack, node, c, out),
                '-' | '0'..='9' => self.start_number(stack, c, false, out),
                't' => self.start_literal(stack, "true".into(), c, out),
                'f' => self.start_literal(stack, "false".into(), c, out),
                'n' => self.start_literal(stack, "null".into(), c, out),
                _ => {}
            },
            Node::Object { .. } if c == '{' => self.open_container(stack, node, c, out),
            Node::Array { .. } if c == '[' => self.open_container(stack, node, c, out),
            Node::String if c == '"' => self.open_container(stack, node, c, out),
            Node::Integer => self.start_number(stack, c, true, out),
            Node::Number => self.start_number(stack, c, false, out),
            Node::Boolean => match c {
                't' => self.start_literal(stack, "true".into(), c, out),
                'f' => self.start_literal(stack, "false".into(), c, out),
                _ => {}
            },
            Node::Null => self.start_literal(stack, "null".into(), c, out),
            Node::Const(text) => self.start_literal(stack, text.clone(), c, out),
            _ => {}
        }
    }

    fn open_container(&self, mut stack: Vec<Frame>, node: NodeId, c: char, out: &mut Vec<Vec<Frame>>) {
        let frame = match c {
            '{' => Frame::Object {
                node,
                seen: Vec::new(),
                state: ObjectState::Open,
            },
            '[' => Frame::Array {
                node,
                count: 0,
                state: ArrayState::Open,
            },
            _ => Frame::Str {
                key: None,
                escape: Escape::None,
            },
        };
        stack.push(frame);
        out.push(stack);
    }

    fn start_number(&self, mut stack: Vec<Frame>, c: char, integer: bool, out: &mut Vec<Vec<Frame>>) {
        if let Some(state) = NumberState::start(c) {
            stack.push(Frame::Number { state, integer });
            out.push(stack);
        }
    }

    fn start_literal(&self, mut stack: Vec<Frame>, text: Arc<str>, c: char, out: &mut Vec<Vec<Frame>>) {
        if !text.starts_with(c) {
            return;
        }
        let pos = c.len_utf8();
        if pos == text.len() {
            complete_value(&mut stack);
        } else {
            stack.push(Frame::Literal { text, pos });
        }
        out.push(stack);
    }

    fn step_string(
        &self,
        mut stack: Vec<Frame>,
        key: Option<String>,
        escape: Escape,
        c: char,
        out: &mut Vec<Vec<Frame>>,
    ) {
        match escape {
            Escape::None => match c {
                '"' => match key {
                    None => {
                        complete_value(&mut stack);
                        out.push(stack);
                    }
                    Some(name) => {
                        let allowed = match stack.last() {
                            Some(Frame::Object { node, seen, .. }) => {
                                self.schema.key_allowed(*node, seen, &name)
                            }
                            _ => false,
                        };
                        if allowed {
                            if let Some(Frame::Object { state, .. }) = stack.last_mut() {
                                *state = ObjectState::AfterKey(name);
                            }
                            out.push(stack);
                        }
                    }
                },
                '\\' => {
                    stack.push(Frame::Str {
                        key,
                        escape: Escape::Backslash,
                    });
                    out.push(stack);
                }
                c if (c as u32) < 0x20 => {}
                c => self.push_string_char(stack, key, c, out),
            },
            Escape::Backslash => {
                let decoded = match c {
                    '"' => '"',
                    '\\' => '\\',
                    '/' => '/',
                    'b' => '\u{8}',
                    'f' => '\u{c}',
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    'u' => {
                        stack.push(Frame::Str {
                            key,
                            escape: Escape::Unicode { digits: 0, code: 0 },
                        });
                        out.push(stack);
                        return;
                    }
                    _ => return,
                };
                self.push_string_char(stack, key, decoded, out);
            }
            Escape::Unicode { digits, code } => {
                let Some(digit) = c.to_digit(16) else {
                    return;
                };
                let code = code * 16 + digit;
                if digits + 1 < 4 {
                    stack.push(Frame::Str {
                        key,
                        escape: Escape::Unicode {
                            digits: digits + 1,
                            code,
                        },
                    });
                    out.push(stack);
                } else {
                    let decoded = char::from_u32(code).unwrap_or('\u{FFFD}');
                    self.push_string_char(stack, key, decoded, out);
                }
            }
        }
    }

    fn push_string_char(
        &self,
        mut stack: Vec<Frame>,
        key: Option<String>,
        decoded: char,
        out: &mut Vec<Vec<Frame>>,
    ) {
        let key = match key {
            None => None,
            Some(mut name) => {
                name.push(decoded);
                let allowed = match stack.last() {
                    Some(Frame::Object { node, seen, .. }) => {
                        self.schema.key_prefix_allowed(*node, seen, &name)
                    }
                    _ => false,
                };
                if !allowed {
                    return;
                }
                Some(name)
            }
        };
        stack.push(Frame::Str {
            key,
            escape: Escape::None,
        });
        out.push(stack);
    }

    fn step_object(
        &self,
        mut stack: Vec<Frame>,
        node: NodeId,
        seen: Vec<String>,
        state: ObjectState,
        c: char,
        out: &mut Vec<Vec<Frame>>,
    ) {
        if is_ws(c) && !matches!(state, ObjectState::InValue) {
            stack.push(Frame::Object { node, seen, state });
            out.push(stack);
            return;
        }

        match state {
            ObjectState::Open | ObjectState::AfterComma => {
                if c == '"' && self.schema.can_add_key(node, &seen) {
                    stack.push(Frame::Object { node, seen, state });
                    stack.push(Frame::Str {
                        key: Some(String::new()),
                        escape: Escape::None,
                    });
                    out.push(stack);
                } else if c == '}'
                    && state == ObjectState::Open
                    && self.schema.required_satisfied(node, &seen)
                {
                    complete_value(&mut stack);
                    out.push(stack);
                }
            }
            ObjectState::AfterKey(key) => {
                if c != ':' {
                    return;
                }
                let Some(child) = self.schema.property_node(node, &key) else {
                    return;
                };
                let mut seen = seen;
                seen.push(key);
                stack.push(Frame::Object {
                    node,
                    seen,
                    state: ObjectState::InValue,
                });
                stack.push(Frame::Value(child));
                out.push(stack);
            }
            ObjectState::InValue => {}
            ObjectState::AfterValue => match c {
                ',' if self.schema.can_add_key(node, &seen) => {
                    stack.push(Frame::Object {
                        node,
                        seen,
                        state: ObjectState::AfterComma,
                    });
                    out.push(stack);
                }
                '}' if self.schema.required_satisfied(node, &seen) => {
                    complete_value(&mut stack);
                    out.push(stack);
                }
                _ => {}
            },
        }
    }

    fn step_array(
        &self,
        mut stack: Vec<Frame>,
        node: NodeId,
        count: usize,
        state: ArrayState,
        c: char,
        out: &mut Vec<Vec<Frame>>,
    ) {
        let (items, min_items, max_items) = self.schema.array_spec(node);

        if is_ws(c) && state != ArrayState::InValue {
            stack.push(Frame::Array { node, count, state });
            out.push(stack);
            return;
        }

        match state {
            ArrayState::Open if c == ']' => {
                if count >= min_items {
                    complete_value(&mut stack);
                    out.push(stack);
                }
            }
            ArrayState::Open | ArrayState::AfterComma => {
                if max_items.is_some_and(|max| count >= max) {
                    return;
                }
                stack.push(Frame::Array {
                    node,
                    count,
                    state: ArrayState::InValue,
                });
                self.start_value(stack, items, c, out, 0);
            }
            ArrayState::InValue => {}
            ArrayState::AfterValue => match c {
                ',' if max_items.map_or(true, |max| count < max) => {
                    stack.push(Frame::Array {
                        node,
                        count,
                        state: ArrayState::AfterComma,
                    });
                    out.push(stack);
                }
                ']' if count >= min_items => {
                    complete_value(&mut stack);
                    out.push(stack);
                }
                _ => {}
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
