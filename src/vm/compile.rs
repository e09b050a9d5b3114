use std::collections::BTreeMap;

use thiserror::Error;

use super::lexer::{lex_source, Keyword, Lex, Lexeme, Oper};
use super::{
    state_name, Assignable, BlockKind, BlockNode, ByteCode, CallTarget, Cmd, ContractInfo,
    FieldInfo, FuncInfo, InitItem, ObjInfo, RaiseKind, Value, ValueType, VarLoc, VM,
};

#[derive(Debug, Error)]
#[error("{message} [Ln:{line} Col:{column}]")]
pub struct CompileError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl CompileError {
    pub fn at(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            message: message.into(),
            line,
            column,
        }
    }

    fn here(message: impl Into<String>, lexeme: &Lexeme) -> Self {
        Self::at(message, lexeme.line, lexeme.column)
    }
}

/// Output of compiling one source unit, before it is flushed into the VM.
pub struct CompileUnit {
    pub nodes: Vec<BlockNode>,
    /// Top-level (name, unit node index) pairs; contract names are already
    /// ecosystem-qualified.
    pub top_level: Vec<(String, usize)>,
}

/// Rebases one node's arena references by `offset` when a compile unit is
/// appended to the VM arena.
pub fn shift_node(node: &mut BlockNode, offset: usize) {
    node.parent = node.parent.map(|p| p + offset);
    for child in &mut node.children {
        *child += offset;
    }
    for object in node.objects.values_mut() {
        match object {
            ObjInfo::Func { block } | ObjInfo::Contract { block } => *block += offset,
            _ => {}
        }
    }
    for code in &mut node.code {
        shift_cmd(&mut code.cmd, offset);
    }
}

fn shift_cmd(cmd: &mut Cmd, offset: usize) {
    match cmd {
        Cmd::Var(loc) => loc.block += offset,
        Cmd::AssignVar(targets) => {
            for target in targets {
                shift_assignable(target, offset);
            }
        }
        Cmd::Call { target, .. } | Cmd::CallVari { target, .. } => {
            if let CallTarget::Unit(index) = target {
                *target = CallTarget::Vm(*index + offset);
            }
        }
        Cmd::If(block) | Cmd::Else(block) | Cmd::While(block) => *block += offset,
        Cmd::Index { target } | Cmd::SetIndex { target } => shift_assignable(target, offset),
        Cmd::MapInit(entries) => {
            for (_, item) in entries {
                shift_init_item(item, offset);
            }
        }
        Cmd::ArrayInit(items) => {
            for item in items {
                shift_init_item(item, offset);
            }
        }
        _ => {}
    }
}

fn shift_assignable(target: &mut Assignable, offset: usize) {
    if let Assignable::Var(loc) = target {
        loc.block += offset;
    }
}

fn shift_init_item(item: &mut InitItem, offset: usize) {
    match item {
        InitItem::Var(loc) => loc.block += offset,
        InitItem::Array(items) => {
            for item in items {
                shift_init_item(item, offset);
            }
        }
        InitItem::Map(entries) => {
            for (_, item) in entries {
                shift_init_item(item, offset);
            }
        }
        _ => {}
    }
}

/// Top-level contract and function names declared in a source unit, without
/// compiling it. Used when registering sources.
pub fn contracts_list(source: &str) -> Result<Vec<String>, CompileError> {
    let lexemes = lex_source(source)?;
    let mut names = Vec::new();
    let mut level = 0usize;
    for (i, lexeme) in lexemes.iter().enumerate() {
        match &lexeme.lex {
            Lex::LCurly => level += 1,
            Lex::RCurly => level = level.saturating_sub(1),
            Lex::Keyword(Keyword::Contract) | Lex::Keyword(Keyword::Func) if level == 0 => {
                if let Some(Lexeme {
                    lex: Lex::Ident(name),
                    ..
                }) = lexemes.get(i + 1)
                {
                    names.push(name.clone());
                }
            }
            _ => {}
        }
    }
    Ok(names)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Root,
    Body,
    Block,
    Contract,
    Func,
    FParams,
    FParam,
    FParamType,
    FTail,
    FResult,
    Var,
    VarType,
    AssignEval,
    Assign,
    Tx,
    Settings,
    Consts,
    ConstsAssign,
    ConstsValue,
    Fields,
    Eval,
}

const F_PUSH: u32 = 1;
const F_POP: u32 = 1 << 1;
const F_STAY: u32 = 1 << 2;
const F_TO_BLOCK: u32 = 1 << 3;
const F_TO_BODY: u32 = 1 << 4;
const F_FORK: u32 = 1 << 5;
const F_TO_FORK: u32 = 1 << 6;
const F_LABEL: u32 = 1 << 7;
const F_MUST_EVAL: u32 = 1 << 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    None,
    NameBlock,
    NamedSection(&'static str),
    FResult,
    Return,
    If,
    Else,
    While,
    Continue,
    Break,
    FParam,
    FType,
    FTail,
    AssignVar,
    AssignStart,
    DataSection,
    SettingsSection,
    ConstName,
    ConstValue,
    Field,
    FieldType,
    FieldTag,
    FieldsDone,
    Raise(RaiseKind),
}

struct Trans {
    next: State,
    flags: u32,
    action: Action,
}

fn t(next: State, flags: u32, action: Action) -> Result<Trans, &'static str> {
    Ok(Trans {
        next,
        flags,
        action,
    })
}

/// The compiler's finite state machine: `(state, lexeme) -> transition`.
fn transition(state: State, lexeme: &Lexeme) -> Result<Trans, &'static str> {
    use Action as A;
    use State as S;
    match state {
        S::Root => match &lexeme.lex {
            Lex::NewLine => t(S::Root, 0, A::None),
            Lex::Keyword(Keyword::Contract) => t(S::Contract, F_PUSH, A::None),
            Lex::Keyword(Keyword::Func) => t(S::Func, F_PUSH, A::None),
            _ => Err("unknown command"),
        },
        S::Body => match &lexeme.lex {
            Lex::NewLine => t(S::Body, 0, A::None),
            Lex::Keyword(Keyword::Func) => t(S::Func, F_PUSH, A::None),
            Lex::Keyword(Keyword::Return) => t(S::Eval, 0, A::Return),
            Lex::Keyword(Keyword::Continue) => t(S::Body, 0, A::Continue),
            Lex::Keyword(Keyword::Break) => t(S::Body, 0, A::Break),
            Lex::Keyword(Keyword::If) => {
                t(S::Eval, F_PUSH | F_TO_BLOCK | F_MUST_EVAL, A::If)
            }
            Lex::Keyword(Keyword::While) => t(
                S::Eval,
                F_PUSH | F_TO_BLOCK | F_LABEL | F_MUST_EVAL,
                A::While,
            ),
            Lex::Keyword(Keyword::Else) => t(S::Block, F_PUSH, A::Else),
            Lex::Keyword(Keyword::Var) => t(S::Var, 0, A::None),
            Lex::Keyword(Keyword::Data) => t(S::Tx, 0, A::DataSection),
            Lex::Keyword(Keyword::Settings) => t(S::Settings, 0, A::SettingsSection),
            Lex::Keyword(Keyword::Conditions) => {
                t(S::Block, F_PUSH, A::NamedSection("conditions"))
            }
            Lex::Keyword(Keyword::Action) => t(S::Block, F_PUSH, A::NamedSection("action")),
            Lex::Keyword(Keyword::Error) => t(S::Eval, 0, A::Raise(RaiseKind::Error)),
            Lex::Keyword(Keyword::Warning) => t(S::Eval, 0, A::Raise(RaiseKind::Warning)),
            Lex::Keyword(Keyword::Info) => t(S::Eval, 0, A::Raise(RaiseKind::Info)),
            Lex::Ident(_) | Lex::Extend(_) => t(S::AssignEval, F_FORK, A::None),
            Lex::RCurly => t(S::Body, F_POP, A::None),
            _ => Err("must be '}'"),
        },
        S::Block => match &lexeme.lex {
            Lex::NewLine => t(S::Block, 0, A::None),
            Lex::LCurly => t(S::Body, 0, A::None),
            _ => Err("must be '{'"),
        },
        S::Contract => match &lexeme.lex {
            Lex::NewLine => t(S::Contract, 0, A::None),
            Lex::Ident(_) => t(S::Block, 0, A::NameBlock),
            _ => Err("must be the name"),
        },
        S::Func => match &lexeme.lex {
            Lex::NewLine => t(S::Func, 0, A::None),
            Lex::Ident(_) => t(S::FParams, 0, A::NameBlock),
            _ => Err("must be the name"),
        },
        S::FParams => match &lexeme.lex {
            Lex::NewLine => t(S::FParams, 0, A::None),
            Lex::LPar => t(S::FParam, 0, A::None),
            _ => t(S::FResult, F_STAY, A::None),
        },
        S::FParam => match &lexeme.lex {
            Lex::NewLine => t(S::FParam, 0, A::None),
            Lex::Ident(_) => t(S::FParamType, 0, A::FParam),
            Lex::Comma => t(S::FParam, 0, A::None),
            Lex::RPar => t(S::FResult, 0, A::None),
            _ => Err("wrong parameters"),
        },
        S::FParamType => match &lexeme.lex {
            Lex::Ident(_) => t(S::FParamType, 0, A::FParam),
            Lex::Type(_) => t(S::FParam, 0, A::FType),
            Lex::Keyword(Keyword::Tail) => t(S::FTail, 0, A::FTail),
            Lex::Comma => t(S::FParamType, 0, A::None),
            _ => Err("must be type"),
        },
        S::FTail => match &lexeme.lex {
            Lex::NewLine => t(S::FTail, 0, A::None),
            Lex::RPar => t(S::FResult, 0, A::None),
            _ => Err("wrong parameters"),
        },
        S::FResult => match &lexeme.lex {
            Lex::NewLine => t(S::FResult, 0, A::None),
            Lex::Type(_) => t(S::FResult, 0, A::FResult),
            Lex::Comma => t(S::FResult, 0, A::None),
            _ => t(S::Block, F_STAY, A::None),
        },
        S::Var => match &lexeme.lex {
            Lex::NewLine => t(S::Body, 0, A::None),
            Lex::Ident(_) => t(S::VarType, 0, A::FParam),
            Lex::RCurly => t(S::Body, F_STAY, A::None),
            Lex::Comma => t(S::Var, 0, A::None),
            _ => Err("wrong variables"),
        },
        S::VarType => match &lexeme.lex {
            Lex::Ident(_) => t(S::VarType, 0, A::FParam),
            Lex::Type(_) => t(S::Var, 0, A::FType),
            Lex::Comma => t(S::VarType, 0, A::None),
            _ => Err("must be type"),
        },
        S::AssignEval => match &lexeme.lex {
            Lex::LPar | Lex::LBrack => t(S::Eval, F_TO_FORK | F_TO_BODY, A::None),
            _ => t(S::Assign, F_TO_FORK | F_STAY, A::None),
        },
        S::Assign => match &lexeme.lex {
            Lex::Comma => t(S::Assign, 0, A::None),
            Lex::Ident(_) | Lex::Extend(_) => t(S::Assign, 0, A::AssignVar),
            Lex::Assign => t(S::Eval, F_TO_BODY, A::AssignStart),
            _ => Err("must be '='"),
        },
        S::Tx => match &lexeme.lex {
            Lex::NewLine => t(S::Tx, 0, A::None),
            Lex::LCurly => t(S::Fields, 0, A::None),
            _ => Err("must be '{'"),
        },
        S::Settings => match &lexeme.lex {
            Lex::NewLine => t(S::Settings, 0, A::None),
            Lex::LCurly => t(S::Consts, 0, A::None),
            _ => Err("must be '{'"),
        },
        S::Consts => match &lexeme.lex {
            Lex::NewLine | Lex::Comma => t(S::Consts, 0, A::None),
            Lex::Ident(_) => t(S::ConstsAssign, 0, A::ConstName),
            Lex::RCurly => t(S::Body, 0, A::None),
            _ => Err("must be '}'"),
        },
        S::ConstsAssign => match &lexeme.lex {
            Lex::Assign => t(S::ConstsValue, 0, A::None),
            _ => Err("must be '='"),
        },
        S::ConstsValue => match &lexeme.lex {
            Lex::Str(_) | Lex::Number(_) => t(S::Consts, 0, A::ConstValue),
            _ => Err("must be number or string"),
        },
        S::Fields => match &lexeme.lex {
            Lex::NewLine | Lex::Comma => t(S::Fields, 0, A::None),
            Lex::Ident(_) => t(S::Fields, 0, A::Field),
            Lex::Type(_) => t(S::Fields, 0, A::FieldType),
            Lex::Str(_) => t(S::Fields, 0, A::FieldTag),
            Lex::RCurly => t(S::Body, 0, A::FieldsDone),
            _ => Err("must be '}'"),
        },
        S::Eval => unreachable!("eval is handled inline"),
    }
}

struct Compiler<'vm> {
    vm: &'vm VM,
    ecosystem_id: i64,
    nodes: Vec<BlockNode>,
    block_stack: Vec<usize>,
    pending_names: Vec<String>,
    pending_assign: Option<Vec<Assignable>>,
    pending_const: Option<String>,
    data_fields: Vec<(String, Option<ValueType>, bool)>,
}

enum Resolved {
    Var(VarLoc),
    Func { target: CallTarget, variadic: bool, can_write: bool },
    Contract { name: String, can_write: bool },
    ExtFunc { name: String, min_args: usize, variadic: bool, can_write: bool },
}

/// Compiles one source unit into a private arena. Node 0 is the unit root
/// whose objects are the unit's top-level declarations.
pub fn compile_unit(
    vm: &VM,
    source: &str,
    ecosystem_id: i64,
) -> Result<CompileUnit, CompileError> {
    let lexemes = lex_source(source)?;
    let mut compiler = Compiler {
        vm,
        ecosystem_id,
        nodes: vec![BlockNode::new(BlockKind::Root { ecosystem_id }, None)],
        block_stack: vec![0],
        pending_names: Vec::new(),
        pending_assign: None,
        pending_const: None,
        data_fields: Vec::new(),
    };
    compiler.run(&lexemes)?;
    compiler.check_conditions_write(&lexemes)?;

    let top_level = compiler.nodes[0]
        .objects
        .iter()
        .filter_map(|(name, object)| match object {
            ObjInfo::Func { block } | ObjInfo::Contract { block } => {
                Some((name.clone(), *block))
            }
            _ => None,
        })
        .collect();
    Ok(CompileUnit {
        nodes: compiler.nodes,
        top_level,
    })
}

impl<'vm> Compiler<'vm> {
    fn top(&self) -> usize {
        *self.block_stack.last().expect("block stack")
    }

    fn parent(&self) -> usize {
        self.block_stack[self.block_stack.len() - 2]
    }

    fn emit(&mut self, node: usize, cmd: Cmd, line: u32) {
        self.nodes[node].code.push(ByteCode { cmd, line });
    }

    fn run(&mut self, lexemes: &[Lexeme]) -> Result<(), CompileError> {
        let mut state_stack: Vec<State> = Vec::new();
        let mut state = State::Root;
        let mut fork = 0usize;
        let mut i = 0usize;

        while i < lexemes.len() {
            let mut index = i;
            let trans = transition(state, &lexemes[index])
                .map_err(|message| CompileError::here(message, &lexemes[index]))?;

            if trans.flags & F_FORK != 0 {
                fork = index;
            }
            if trans.flags & F_TO_FORK != 0 {
                index = fork;
            }
            if trans.flags & F_STAY != 0 {
                state = trans.next;
                i = index;
                continue;
            }

            let mut next = trans.next;
            if next == State::Eval {
                if trans.flags & F_LABEL != 0 {
                    let top = self.top();
                    self.emit(top, Cmd::Label, lexemes[index].line);
                }
                // The trigger token (`if`, `while`, `return`, `=`, ...) is not
                // part of the expression; a fork rewind starts on the operand.
                if trans.flags & F_TO_FORK == 0 {
                    index += 1;
                }
                let before = self.nodes[self.top()].code.len();
                self.compile_eval(lexemes, &mut index)?;
                if trans.flags & F_MUST_EVAL != 0
                    && self.nodes[self.top()].code.len() == before
                {
                    return Err(CompileError::here(
                        "there is no eval expression",
                        &lexemes[index.min(lexemes.len() - 1)],
                    ));
                }
                if let Some(targets) = self.pending_assign.take() {
                    let top = self.top();
                    self.emit(top, Cmd::AssignVar(targets), lexemes[index.min(lexemes.len() - 1)].line);
                }
                next = state;
            }

            if trans.flags & F_PUSH != 0 {
                state_stack.push(state);
                let parent = self.top();
                let child = self.nodes.len();
                self.nodes.push(BlockNode::new(BlockKind::Body, Some(parent)));
                self.nodes[parent].children.push(child);
                self.block_stack.push(child);
            }
            if trans.flags & F_POP != 0 {
                let Some(previous) = state_stack.pop() else {
                    return Err(CompileError::here("must be '{'", &lexemes[index]));
                };
                next = previous;
                // A while body loops by ending in Continue: the jump emitted
                // next to While moves inside the finished block.
                if self.block_stack.len() >= 2 {
                    let parent = self.parent();
                    if matches!(
                        self.nodes[parent].code.last().map(|code| &code.cmd),
                        Some(Cmd::Continue)
                    ) {
                        let code = self.nodes[parent].code.pop().expect("continue");
                        let top = self.top();
                        self.nodes[top].code.push(code);
                    }
                }
                self.block_stack.pop();
            }
            if trans.flags & F_TO_BLOCK != 0 {
                next = State::Block;
            }
            if trans.flags & F_TO_BODY != 0 {
                next = State::Body;
            }

            self.apply_action(trans.action, next, &lexemes[index.min(lexemes.len() - 1)])?;
            state = next;
            i = index + 1;
        }

        if !state_stack.is_empty() {
            let last = lexemes.last().expect("lexemes");
            return Err(CompileError::here("must be '}'", last));
        }
        Ok(())
    }

    fn apply_action(
        &mut self,
        action: Action,
        state: State,
        lexeme: &Lexeme,
    ) -> Result<(), CompileError> {
        match action {
            Action::None => {}
            Action::NameBlock => self.name_block(state, lexeme)?,
            Action::NamedSection(section) => self.named_section(section, lexeme)?,
            Action::FResult => {
                let Lex::Type(value_type) = &lexeme.lex else {
                    return Err(CompileError::here("must be type", lexeme));
                };
                let top = self.top();
                match &mut self.nodes[top].kind {
                    BlockKind::Func(info) => info.results.push(*value_type),
                    _ => return Err(CompileError::here("result outside function", lexeme)),
                }
            }
            Action::Return => {
                let top = self.top();
                self.emit(top, Cmd::Return, lexeme.line);
            }
            Action::If => {
                let child = self.top();
                let parent = self.parent();
                self.emit(parent, Cmd::If(child), lexeme.line);
            }
            Action::Else => {
                let child = self.top();
                let parent = self.parent();
                if !matches!(
                    self.nodes[parent].code.last().map(|code| &code.cmd),
                    Some(Cmd::If(_))
                ) {
                    return Err(CompileError::here("there is no if before else", lexeme));
                }
                self.emit(parent, Cmd::Else(child), lexeme.line);
            }
            Action::While => {
                let child = self.top();
                let parent = self.parent();
                self.emit(parent, Cmd::While(child), lexeme.line);
                self.emit(parent, Cmd::Continue, lexeme.line);
            }
            Action::Continue => {
                let top = self.top();
                self.emit(top, Cmd::Continue, lexeme.line);
            }
            Action::Break => {
                let top = self.top();
                self.emit(top, Cmd::Break, lexeme.line);
            }
            Action::FParam => {
                let Lex::Ident(name) = &lexeme.lex else {
                    return Err(CompileError::here("must be the name", lexeme));
                };
                self.pending_names.push(name.clone());
            }
            Action::FType => {
                let Lex::Type(value_type) = &lexeme.lex else {
                    return Err(CompileError::here("must be type", lexeme));
                };
                self.declare_pending(*value_type, state == State::FParam, lexeme)?;
            }
            Action::FTail => {
                self.declare_pending(ValueType::Array, true, lexeme)?;
                let top = self.top();
                match &mut self.nodes[top].kind {
                    BlockKind::Func(info) => info.variadic = true,
                    _ => return Err(CompileError::here("'...' outside function", lexeme)),
                }
            }
            Action::AssignVar => {
                let target = match &lexeme.lex {
                    Lex::Ident(name) => match self.find_var(name) {
                        Some(loc) => Assignable::Var(loc),
                        None => {
                            return Err(CompileError::here(
                                format!("unknown variable {name}"),
                                lexeme,
                            ));
                        }
                    },
                    Lex::Extend(name) => Assignable::Extend(name.clone()),
                    _ => return Err(CompileError::here("must be the name", lexeme)),
                };
                self.pending_assign
                    .get_or_insert_with(Vec::new)
                    .push(target);
            }
            Action::AssignStart => {
                if self.pending_assign.is_none() {
                    return Err(CompileError::here("nothing to assign", lexeme));
                }
            }
            Action::DataSection | Action::SettingsSection => {
                let top = self.top();
                if !matches!(self.nodes[top].kind, BlockKind::Contract(_)) {
                    return Err(CompileError::here(
                        "data can only be in contract",
                        lexeme,
                    ));
                }
                if action == Action::DataSection {
                    self.data_fields.clear();
                }
            }
            Action::ConstName => {
                let Lex::Ident(name) = &lexeme.lex else {
                    return Err(CompileError::here("must be the name", lexeme));
                };
                self.pending_const = Some(name.clone());
            }
            Action::ConstValue => {
                let name = self
                    .pending_const
                    .take()
                    .ok_or_else(|| CompileError::here("must be the name", lexeme))?;
                let value = match &lexeme.lex {
                    Lex::Str(text) => Value::Str(text.clone()),
                    Lex::Number(number) => Value::Int(*number),
                    _ => return Err(CompileError::here("must be number or string", lexeme)),
                };
                let top = self.top();
                match &mut self.nodes[top].kind {
                    BlockKind::Contract(info) => {
                        info.settings.insert(name, value);
                    }
                    _ => {
                        return Err(CompileError::here(
                            "settings can only be in contract",
                            lexeme,
                        ));
                    }
                }
            }
            Action::Field => {
                let Lex::Ident(name) = &lexeme.lex else {
                    return Err(CompileError::here("must be the name", lexeme));
                };
                if matches!(self.data_fields.last(), Some((_, None, _))) {
                    return Err(CompileError::here("must be type", lexeme));
                }
                self.data_fields.push((name.clone(), None, false));
            }
            Action::FieldType => {
                let Lex::Type(value_type) = &lexeme.lex else {
                    return Err(CompileError::here("must be type", lexeme));
                };
                if !matches!(self.data_fields.last(), Some((_, None, _))) {
                    return Err(CompileError::here("must be the name", lexeme));
                }
                for field in self.data_fields.iter_mut() {
                    if field.1.is_none() {
                        field.1 = Some(*value_type);
                    }
                }
            }
            Action::FieldTag => {
                let Lex::Str(tag) = &lexeme.lex else {
                    return Err(CompileError::here("must be string", lexeme));
                };
                match self.data_fields.last_mut() {
                    Some((_, Some(_), optional)) => {
                        if tag == "optional" {
                            *optional = true;
                        }
                    }
                    _ => return Err(CompileError::here("tag before type", lexeme)),
                }
            }
            Action::FieldsDone => {
                if matches!(self.data_fields.last(), Some((_, None, _))) {
                    return Err(CompileError::here("must be type", lexeme));
                }
                let fields: Vec<FieldInfo> = self
                    .data_fields
                    .drain(..)
                    .map(|(name, value_type, optional)| FieldInfo {
                        name,
                        field_type: value_type.expect("typed field"),
                        optional,
                    })
                    .collect();
                let top = self.top();
                match &mut self.nodes[top].kind {
                    BlockKind::Contract(info) => info.tx_fields = fields,
                    _ => {
                        return Err(CompileError::here(
                            "data can only be in contract",
                            lexeme,
                        ));
                    }
                }
            }
            Action::Raise(kind) => {
                let top = self.top();
                self.emit(top, Cmd::Raise(kind), lexeme.line);
            }
        }
        Ok(())
    }

    fn name_block(&mut self, state: State, lexeme: &Lexeme) -> Result<(), CompileError> {
        let Lex::Ident(name) = &lexeme.lex else {
            return Err(CompileError::here("must be the name", lexeme));
        };
        let top = self.top();
        let parent = self.parent();
        if state == State::Block {
            let qualified = state_name(self.ecosystem_id, name);
            self.nodes[top].kind = BlockKind::Contract(ContractInfo {
                id: 0,
                name: qualified.clone(),
                tx_fields: Vec::new(),
                settings: BTreeMap::new(),
                used: Default::default(),
                can_write: false,
            });
            self.nodes[parent]
                .objects
                .insert(qualified, ObjInfo::Contract { block: top });
        } else {
            self.nodes[top].kind = BlockKind::Func(FuncInfo::default());
            self.nodes[parent]
                .objects
                .insert(name.clone(), ObjInfo::Func { block: top });
        }
        Ok(())
    }

    fn named_section(
        &mut self,
        section: &'static str,
        lexeme: &Lexeme,
    ) -> Result<(), CompileError> {
        let top = self.top();
        let parent = self.parent();
        if !matches!(self.nodes[parent].kind, BlockKind::Contract(_)) {
            return Err(CompileError::here(
                format!("{section} can only be in contract"),
                lexeme,
            ));
        }
        self.nodes[top].kind = BlockKind::Func(FuncInfo::default());
        self.nodes[parent]
            .objects
            .insert(section.to_string(), ObjInfo::Func { block: top });
        Ok(())
    }

    /// Declares all names collected since the last type lexeme as variables
    /// of `value_type`, and as function parameters when in a parameter list.
    fn declare_pending(
        &mut self,
        value_type: ValueType,
        as_params: bool,
        lexeme: &Lexeme,
    ) -> Result<(), CompileError> {
        if self.pending_names.is_empty() {
            return Err(CompileError::here("must be the name", lexeme));
        }
        let top = self.top();
        for name in std::mem::take(&mut self.pending_names) {
            let index = self.nodes[top].vars.len();
            self.nodes[top]
                .objects
                .insert(name, ObjInfo::Var { index });
            self.nodes[top].vars.push(value_type);
            if as_params {
                match &mut self.nodes[top].kind {
                    BlockKind::Func(info) => info.params.push(value_type),
                    _ => {
                        return Err(CompileError::here(
                            "parameters outside function",
                            lexeme,
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn find_var(&self, name: &str) -> Option<VarLoc> {
        for block in self.block_stack.iter().rev() {
            if let Some(ObjInfo::Var { index }) = self.nodes[*block].objects.get(name) {
                return Some(VarLoc {
                    block: *block,
                    index: *index,
                });
            }
        }
        None
    }

    /// Resolution order: local scopes, then the unit's qualified names, then
    /// the VM-global object table.
    fn find_obj(&self, name: &str) -> Option<Resolved> {
        if let Some(loc) = self.find_var(name) {
            return Some(Resolved::Var(loc));
        }
        let qualified = state_name(self.ecosystem_id, name);
        for block in self.block_stack.iter().rev() {
            let objects = &self.nodes[*block].objects;
            if let Some(object) = objects.get(name).or_else(|| objects.get(&qualified)) {
                match object {
                    ObjInfo::Func { block } => {
                        let info = self.nodes[*block].func_info().cloned().unwrap_or_default();
                        return Some(Resolved::Func {
                            target: CallTarget::Unit(*block),
                            variadic: info.variadic,
                            can_write: info.can_write,
                        });
                    }
                    ObjInfo::Contract { block } => {
                        let info = self.nodes[*block].contract_info()?;
                        return Some(Resolved::Contract {
                            name: info.name.clone(),
                            can_write: info.can_write,
                        });
                    }
                    ObjInfo::Var { index } => {
                        return Some(Resolved::Var(VarLoc {
                            block: *self.block_stack.last().expect("stack"),
                            index: *index,
                        }));
                    }
                    ObjInfo::ExtFunc { .. } => {}
                }
            }
        }
        let global = self
            .vm
            .objects
            .get(name)
            .or_else(|| self.vm.objects.get(&qualified))?;
        match global {
            ObjInfo::Func { block } => {
                let info = self.vm.nodes[*block].func_info().cloned().unwrap_or_default();
                Some(Resolved::Func {
                    target: CallTarget::Vm(*block),
                    variadic: info.variadic,
                    can_write: info.can_write,
                })
            }
            ObjInfo::Contract { block } => {
                let info = self.vm.nodes[*block].contract_info()?;
                Some(Resolved::Contract {
                    name: info.name.clone(),
                    can_write: info.can_write,
                })
            }
            ObjInfo::ExtFunc { name } => {
                let info = super::extend::ext_func(name)?;
                Some(Resolved::ExtFunc {
                    name: info.name.to_string(),
                    min_args: info.min_args,
                    variadic: info.variadic,
                    can_write: info.can_write,
                })
            }
            ObjInfo::Var { .. } => None,
        }
    }

    /// Marks every enclosing function and contract as writing state.
    fn set_writable(&mut self) {
        for block in self.block_stack.clone() {
            match &mut self.nodes[block].kind {
                BlockKind::Func(info) => info.can_write = true,
                BlockKind::Contract(info) => info.can_write = true,
                _ => {}
            }
        }
    }

    /// Records `callee` in the `used` set of every enclosing contract, and
    /// rejects direct self-recursion at compile time.
    fn record_used(&mut self, callee: &str, lexeme: &Lexeme) -> Result<(), CompileError> {
        for block in self.block_stack.clone() {
            if let BlockKind::Contract(info) = &mut self.nodes[block].kind {
                if info.name == callee {
                    return Err(CompileError::here(
                        format!("recursive contract call {callee}"),
                        lexeme,
                    ));
                }
                info.used.insert(callee.to_string());
            }
        }
        Ok(())
    }

    fn check_conditions_write(&self, lexemes: &[Lexeme]) -> Result<(), CompileError> {
        for child in &self.nodes[0].children {
            if !matches!(self.nodes[*child].kind, BlockKind::Contract(_)) {
                continue;
            }
            if let Some(ObjInfo::Func { block }) = self.nodes[*child].objects.get("conditions") {
                if self.nodes[*block]
                    .func_info()
                    .map(|info| info.can_write)
                    .unwrap_or(false)
                {
                    let last = lexemes.last().expect("lexemes");
                    return Err(CompileError::here(
                        "conditions cannot perform writes",
                        last,
                    ));
                }
            }
        }
        Ok(())
    }
}

// --- expression compilation (shunting-yard) ---

enum BufEntry {
    Oper { cmd: Cmd, priority: u16 },
    Sys,
    Call(PendingCall),
    Index(Assignable),
}

struct PendingCall {
    kind: CallKind,
    variadic: bool,
}

enum CallKind {
    Func(CallTarget),
    Ext { name: String, min_args: usize },
    Contract,
}

const PRIORITY_UNARY: u16 = 50;

fn oper_info(oper: Oper) -> (Cmd, u16) {
    match oper {
        Oper::Or => (Cmd::Or, 10),
        Oper::And => (Cmd::And, 15),
        Oper::EqEq => (Cmd::Eq, 20),
        Oper::NotEq => (Cmd::NotEq, 20),
        Oper::Less => (Cmd::Less, 22),
        Oper::GreatEq => (Cmd::NotLess, 22),
        Oper::Great => (Cmd::Great, 22),
        Oper::LessEq => (Cmd::NotGreat, 22),
        Oper::Add => (Cmd::Add, 25),
        Oper::Sub => (Cmd::Sub, 25),
        Oper::Mul => (Cmd::Mul, 30),
        Oper::Div => (Cmd::Div, 30),
        Oper::Not => (Cmd::Not, PRIORITY_UNARY),
    }
}

fn is_operand_end(lex: &Lex) -> bool {
    matches!(
        lex,
        Lex::Number(_)
            | Lex::Ident(_)
            | Lex::Extend(_)
            | Lex::Str(_)
            | Lex::RCurly
            | Lex::RBrack
            | Lex::RPar
            | Lex::Keyword(Keyword::True)
            | Lex::Keyword(Keyword::False)
    )
}

impl<'vm> Compiler<'vm> {
    fn compile_eval(
        &mut self,
        lexemes: &[Lexeme],
        index: &mut usize,
    ) -> Result<(), CompileError> {
        let mut buffer: Vec<BufEntry> = Vec::new();
        let mut bytecode: Vec<ByteCode> = Vec::new();
        let mut parcount: Vec<usize> = Vec::new();
        let mut set_index: Option<Assignable> = None;
        let mut no_map = false;
        let mut prev: Option<Lex> = None;
        let mut i = *index;

        'main: while i < lexemes.len() {
            let lexeme = &lexemes[i];
            let line = lexeme.line;

            if !no_map {
                if lexeme.lex == Lex::LCurly {
                    let entries = self.init_map(lexemes, &mut i, false)?;
                    bytecode.push(ByteCode {
                        cmd: Cmd::MapInit(entries),
                        line,
                    });
                    prev = Some(Lex::RCurly);
                    i += 1;
                    continue;
                }
                if lexeme.lex == Lex::LBrack {
                    let items = self.init_array(lexemes, &mut i)?;
                    bytecode.push(ByteCode {
                        cmd: Cmd::ArrayInit(items),
                        line,
                    });
                    prev = Some(Lex::RBrack);
                    i += 1;
                    continue;
                }
            }
            no_map = false;

            match &lexeme.lex {
                Lex::RCurly | Lex::LCurly => {
                    if matches!(prev, Some(Lex::Comma) | Some(Lex::Oper(_))) {
                        return Err(CompileError::here("unexpected end of expression", lexeme));
                    }
                    i -= 1;
                    break 'main;
                }
                Lex::NewLine => {
                    if matches!(prev, Some(Lex::Comma) | Some(Lex::Oper(_))) {
                        i += 1;
                        continue 'main;
                    }
                    if buffer.iter().any(|entry| matches!(entry, BufEntry::Sys)) {
                        i += 1;
                        continue 'main;
                    }
                    break 'main;
                }
                Lex::LPar | Lex::LBrack => {
                    buffer.push(BufEntry::Sys);
                }
                Lex::Comma => {
                    if let Some(count) = parcount.last_mut() {
                        *count += 1;
                    }
                    while let Some(entry) = buffer.last() {
                        match entry {
                            BufEntry::Sys => break,
                            BufEntry::Oper { .. } => {
                                if let BufEntry::Oper { cmd, .. } = buffer.pop().expect("oper") {
                                    bytecode.push(ByteCode { cmd, line });
                                }
                            }
                            _ => break,
                        }
                    }
                }
                Lex::RPar => {
                    no_map = true;
                    loop {
                        match buffer.pop() {
                            None => {
                                return Err(CompileError::here("there is no pair", lexeme));
                            }
                            Some(BufEntry::Sys) => break,
                            Some(BufEntry::Oper { cmd, .. }) => {
                                bytecode.push(ByteCode { cmd, line })
                            }
                            Some(_) => {
                                return Err(CompileError::here("there is no pair", lexeme));
                            }
                        }
                    }
                    if matches!(buffer.last(), Some(BufEntry::Call(_))) {
                        let Some(BufEntry::Call(call)) = buffer.pop() else {
                            unreachable!()
                        };
                        let count = parcount.pop().expect("parcount");
                        match call.kind {
                            CallKind::Func(target) => {
                                let cmd = if call.variadic {
                                    Cmd::CallVari { target, count }
                                } else {
                                    Cmd::Call { target, count }
                                };
                                bytecode.push(ByteCode { cmd, line });
                            }
                            CallKind::Ext { name, min_args } => {
                                if count < min_args || (!call.variadic && count != min_args) {
                                    return Err(CompileError::here(
                                        format!("wrong count of parameters for {name}"),
                                        lexeme,
                                    ));
                                }
                                bytecode.push(ByteCode {
                                    cmd: Cmd::CallExtend { name, count },
                                    line,
                                });
                            }
                            CallKind::Contract => {
                                bytecode.push(ByteCode {
                                    cmd: Cmd::CallExtend {
                                        name: "ExecContract".into(),
                                        count,
                                    },
                                    line,
                                });
                            }
                        }
                    }
                }
                Lex::RBrack => {
                    no_map = true;
                    loop {
                        match buffer.pop() {
                            None => {
                                return Err(CompileError::here("there is no pair", lexeme));
                            }
                            Some(BufEntry::Sys) => break,
                            Some(BufEntry::Oper { cmd, .. }) => {
                                bytecode.push(ByteCode { cmd, line })
                            }
                            Some(_) => {
                                return Err(CompileError::here("there is no pair", lexeme));
                            }
                        }
                    }
                    if matches!(buffer.last(), Some(BufEntry::Index(_))) {
                        let Some(BufEntry::Index(target)) = buffer.pop() else {
                            unreachable!()
                        };
                        if lexemes.get(i + 1).map(|next| &next.lex) == Some(&Lex::Assign) {
                            i += 1;
                            set_index = Some(target);
                            no_map = false;
                            prev = Some(Lex::Assign);
                            i += 1;
                            continue 'main;
                        }
                        bytecode.push(ByteCode {
                            cmd: Cmd::Index { target },
                            line,
                        });
                    }
                    if lexemes.get(i + 1).map(|next| &next.lex) == Some(&Lex::LBrack) {
                        return Err(CompileError::here(
                            "multi-index is not supported",
                            lexeme,
                        ));
                    }
                }
                Lex::Oper(oper) => {
                    let (mut cmd, mut priority) = oper_info(*oper);
                    let unary_minus = matches!(cmd, Cmd::Sub)
                        && !prev.as_ref().map(is_operand_end).unwrap_or(false);
                    if unary_minus {
                        cmd = Cmd::SignMinus;
                        priority = PRIORITY_UNARY;
                    } else if matches!(prev, Some(Lex::Oper(_))) && priority != PRIORITY_UNARY {
                        return Err(CompileError::here("unexpected operator", lexeme));
                    }
                    loop {
                        match buffer.last() {
                            Some(BufEntry::Oper {
                                priority: top_priority,
                                ..
                            }) if *top_priority >= priority && priority != PRIORITY_UNARY => {
                                if *top_priority == PRIORITY_UNARY {
                                    // Unary operators pop right to left.
                                    while matches!(
                                        buffer.last(),
                                        Some(BufEntry::Oper { priority, .. })
                                            if *priority == PRIORITY_UNARY
                                    ) {
                                        if let Some(BufEntry::Oper { cmd, .. }) = buffer.pop() {
                                            bytecode.push(ByteCode { cmd, line });
                                        }
                                    }
                                } else if let Some(BufEntry::Oper { cmd, .. }) = buffer.pop() {
                                    bytecode.push(ByteCode { cmd, line });
                                }
                            }
                            _ => {
                                buffer.push(BufEntry::Oper { cmd, priority });
                                break;
                            }
                        }
                    }
                }
                Lex::Number(value) => {
                    no_map = true;
                    bytecode.push(ByteCode {
                        cmd: Cmd::Push(Value::Int(*value)),
                        line,
                    });
                }
                Lex::Str(text) => {
                    no_map = true;
                    bytecode.push(ByteCode {
                        cmd: Cmd::Push(Value::Str(text.clone())),
                        line,
                    });
                }
                Lex::Keyword(Keyword::True) => {
                    no_map = true;
                    bytecode.push(ByteCode {
                        cmd: Cmd::Push(Value::Bool(true)),
                        line,
                    });
                }
                Lex::Keyword(Keyword::False) => {
                    no_map = true;
                    bytecode.push(ByteCode {
                        cmd: Cmd::Push(Value::Bool(false)),
                        line,
                    });
                }
                Lex::Keyword(Keyword::Tail) => {
                    bytecode.push(ByteCode {
                        cmd: Cmd::UnwrapArr,
                        line,
                    });
                }
                Lex::Extend(name) => {
                    no_map = true;
                    if lexemes.get(i + 1).map(|next| &next.lex) == Some(&Lex::LPar) {
                        let info = super::extend::ext_func(name).ok_or_else(|| {
                            CompileError::here(format!("unknown function ${name}"), lexeme)
                        })?;
                        if info.can_write {
                            self.set_writable();
                        }
                        let initial =
                            usize::from(lexemes.get(i + 2).map(|next| &next.lex) != Some(&Lex::RPar));
                        parcount.push(initial);
                        buffer.push(BufEntry::Call(PendingCall {
                            kind: CallKind::Ext {
                                name: info.name.to_string(),
                                min_args: info.min_args,
                            },
                            variadic: info.variadic,
                        }));
                        buffer.push(BufEntry::Sys);
                        i += 2;
                        prev = Some(Lex::LPar);
                        no_map = false;
                        continue 'main;
                    }
                    bytecode.push(ByteCode {
                        cmd: Cmd::ExtendVal(name.clone()),
                        line,
                    });
                    if lexemes.get(i + 1).map(|next| &next.lex) == Some(&Lex::LBrack) {
                        bytecode.pop();
                        buffer.push(BufEntry::Index(Assignable::Extend(name.clone())));
                    }
                }
                Lex::Ident(name) => {
                    no_map = true;
                    let next_lex = lexemes.get(i + 1).map(|next| &next.lex);
                    let resolved = self.find_obj(name);
                    if next_lex == Some(&Lex::LPar) {
                        let resolved = resolved.ok_or_else(|| {
                            CompileError::here(format!("unknown identifier {name}"), lexeme)
                        })?;
                        let initial =
                            usize::from(lexemes.get(i + 2).map(|next| &next.lex) != Some(&Lex::RPar));
                        match resolved {
                            Resolved::Func {
                                target,
                                variadic,
                                can_write,
                            } => {
                                if can_write {
                                    self.set_writable();
                                }
                                parcount.push(initial);
                                buffer.push(BufEntry::Call(PendingCall {
                                    kind: CallKind::Func(target),
                                    variadic,
                                }));
                            }
                            Resolved::ExtFunc {
                                name,
                                min_args,
                                variadic,
                                can_write,
                            } => {
                                if can_write {
                                    self.set_writable();
                                }
                                parcount.push(initial);
                                buffer.push(BufEntry::Call(PendingCall {
                                    kind: CallKind::Ext { name, min_args },
                                    variadic,
                                }));
                            }
                            Resolved::Contract {
                                name: qualified,
                                can_write,
                            } => {
                                self.record_used(&qualified, lexeme)?;
                                if can_write {
                                    self.set_writable();
                                }
                                bytecode.push(ByteCode {
                                    cmd: Cmd::Push(Value::Str(qualified)),
                                    line,
                                });
                                let mut count = initial + 1;
                                if initial == 0 {
                                    // No declared params: names CSV and a
                                    // filler value keep the arity fixed.
                                    bytecode.push(ByteCode {
                                        cmd: Cmd::Push(Value::Str(String::new())),
                                        line,
                                    });
                                    bytecode.push(ByteCode {
                                        cmd: Cmd::Push(Value::Str(String::new())),
                                        line,
                                    });
                                    count = 3;
                                }
                                parcount.push(count);
                                buffer.push(BufEntry::Call(PendingCall {
                                    kind: CallKind::Contract,
                                    variadic: true,
                                }));
                            }
                            Resolved::Var(_) => {
                                return Err(CompileError::here(
                                    format!("{name} is not callable"),
                                    lexeme,
                                ));
                            }
                        }
                        buffer.push(BufEntry::Sys);
                        i += 2;
                        prev = Some(Lex::LPar);
                        no_map = false;
                        continue 'main;
                    }
                    let Some(Resolved::Var(loc)) = resolved else {
                        return Err(CompileError::here(
                            format!("unknown variable {name}"),
                            lexeme,
                        ));
                    };
                    if next_lex == Some(&Lex::LBrack) {
                        buffer.push(BufEntry::Index(Assignable::Var(loc)));
                    } else {
                        bytecode.push(ByteCode {
                            cmd: Cmd::Var(loc),
                            line,
                        });
                    }
                }
                other => {
                    return Err(CompileError::here(
                        format!("unexpected token in expression: {other:?}"),
                        lexeme,
                    ));
                }
            }
            if lexeme.lex != Lex::NewLine {
                prev = Some(lexeme.lex.clone());
            }
            i += 1;
        }

        if matches!(prev, Some(Lex::Oper(_))) {
            let last = &lexemes[(i).min(lexemes.len() - 1)];
            return Err(CompileError::here("unexpected end of expression", last));
        }
        while let Some(entry) = buffer.pop() {
            match entry {
                BufEntry::Oper { cmd, .. } => bytecode.push(ByteCode { cmd, line: 0 }),
                _ => {
                    let last = &lexemes[(i).min(lexemes.len() - 1)];
                    return Err(CompileError::here("there is no pair", last));
                }
            }
        }
        if let Some(target) = set_index {
            bytecode.push(ByteCode {
                cmd: Cmd::SetIndex { target },
                line: 0,
            });
        }
        let top = self.top();
        self.nodes[top].code.extend(bytecode);
        *index = i.min(lexemes.len().saturating_sub(1));
        Ok(())
    }

    fn init_value(
        &mut self,
        lexemes: &[Lexeme],
        index: &mut usize,
    ) -> Result<InitItem, CompileError> {
        let lexeme = &lexemes[*index];
        Ok(match &lexeme.lex {
            Lex::LBrack => InitItem::Array(self.init_array(lexemes, index)?),
            Lex::LCurly => InitItem::Map(self.init_map(lexemes, index, false)?),
            Lex::Extend(name) => InitItem::Extend(name.clone()),
            Lex::Ident(name) => match self.find_var(name) {
                Some(loc) => InitItem::Var(loc),
                None => {
                    return Err(CompileError::here(
                        format!("unknown identifier {name}"),
                        lexeme,
                    ));
                }
            },
            Lex::Number(value) => InitItem::Const(Value::Int(*value)),
            Lex::Str(text) => InitItem::Const(Value::Str(text.clone())),
            Lex::Keyword(Keyword::True) => InitItem::Const(Value::Bool(true)),
            Lex::Keyword(Keyword::False) => InitItem::Const(Value::Bool(false)),
            _ => return Err(CompileError::here("unexpected value", lexeme)),
        })
    }

    fn init_map(
        &mut self,
        lexemes: &[Lexeme],
        index: &mut usize,
        one_item: bool,
    ) -> Result<Vec<(String, InitItem)>, CompileError> {
        let mut i = *index + usize::from(!one_item);
        let mut entries: Vec<(String, InitItem)> = Vec::new();
        let mut key: Option<String> = None;
        #[derive(PartialEq)]
        enum Expect {
            Key,
            Colon,
            Value,
            Comma,
        }
        let mut expect = Expect::Key;
        while i < lexemes.len() {
            let lexeme = &lexemes[i];
            match &lexeme.lex {
                Lex::NewLine => {
                    i += 1;
                    continue;
                }
                Lex::RCurly => break,
                Lex::Comma | Lex::RBrack if one_item => {
                    *index = i - 1;
                    return Ok(entries);
                }
                _ => {}
            }
            match expect {
                Expect::Comma => {
                    if lexeme.lex != Lex::Comma {
                        return Err(CompileError::here("unexpected comma", lexeme));
                    }
                    expect = Expect::Key;
                }
                Expect::Colon => {
                    if lexeme.lex != Lex::Colon {
                        return Err(CompileError::here("unexpected colon", lexeme));
                    }
                    expect = Expect::Value;
                }
                Expect::Key => {
                    key = Some(match &lexeme.lex {
                        Lex::Ident(name) => name.clone(),
                        Lex::Str(text) => text.clone(),
                        Lex::Extend(name) => format!("${name}"),
                        _ => return Err(CompileError::here("unexpected map key", lexeme)),
                    });
                    expect = Expect::Colon;
                }
                Expect::Value => {
                    let item = self.init_value(lexemes, &mut i)?;
                    entries.push((key.take().expect("map key"), item));
                    expect = Expect::Comma;
                }
            }
            i += 1;
        }
        if i >= lexemes.len() {
            let last = lexemes.last().expect("lexemes");
            return Err(CompileError::here("unclosed map", last));
        }
        *index = i;
        Ok(entries)
    }

    fn init_array(
        &mut self,
        lexemes: &[Lexeme],
        index: &mut usize,
    ) -> Result<Vec<InitItem>, CompileError> {
        let mut i = *index + 1;
        let mut items: Vec<InitItem> = Vec::new();
        let mut expect_value = true;
        while i < lexemes.len() {
            let lexeme = &lexemes[i];
            match &lexeme.lex {
                Lex::NewLine => {
                    i += 1;
                    continue;
                }
                Lex::RBrack => break,
                _ => {}
            }
            if expect_value {
                if lexemes.get(i + 1).map(|next| &next.lex) == Some(&Lex::Colon) {
                    let entries = self.init_map(lexemes, &mut i, true)?;
                    items.push(InitItem::Map(entries));
                } else {
                    let item = self.init_value(lexemes, &mut i)?;
                    items.push(item);
                }
                expect_value = false;
            } else {
                if lexeme.lex != Lex::Comma {
                    return Err(CompileError::here("unexpected comma", lexeme));
                }
                expect_value = true;
            }
            i += 1;
        }
        if i >= lexemes.len() {
            let last = lexemes.last().expect("lexemes");
            return Err(CompileError::here("unclosed array", last));
        }
        *index = i;
        Ok(items)
    }
}
