//! Contract virtual machine: a small contract language compiled to bytecode
//! blocks and executed on a typed stack with fuel accounting. Compiled
//! contracts live in an arena of block nodes addressed by index; the mutable
//! registry can be snapshotted so VM-visible state follows the database
//! through savepoints and rollbacks.

mod compile;
mod extend;
mod lexer;
mod run;

pub use compile::{contracts_list, CompileError};
pub use extend::SmartCtx;
pub use run::{calc_mem, RunTime};

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::{Mutex, RwLock};
use serde_json::Value as Json;
use thiserror::Error;

use crate::types::TxParam;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("unknown contract {0}")]
    UnknownContract(String),
    #[error("unknown identifier {0}")]
    UnknownIdentifier(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("index out of range")]
    IndexOutOfRange,
    #[error("fuel exhausted")]
    FuelExhausted,
    #[error("call depth exceeded")]
    DepthExceeded,
    #[error("recursive contract call {0}")]
    Recursion(String),
    #[error("wrong number of arguments for {0}")]
    WrongArgCount(String),
    #[error("contract error: {0}")]
    Raised(String),
    #[error("contract warning: {0}")]
    Warning(String),
    #[error("contract info: {0}")]
    Info(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("{0}")]
    Runtime(String),
}

/// Runtime value. `money` in source maps onto `Int` micro-units.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Int(v) => *v != 0,
            Value::Bool(v) => *v,
            Value::Str(v) => !v.is_empty(),
            Value::Bytes(v) => !v.is_empty(),
            Value::Array(v) => !v.is_empty(),
            Value::Map(v) => !v.is_empty(),
        }
    }

    pub fn zero_of(value_type: ValueType) -> Value {
        match value_type {
            ValueType::Int | ValueType::Money => Value::Int(0),
            ValueType::Bool => Value::Bool(false),
            ValueType::Str => Value::Str(String::new()),
            ValueType::Bytes => Value::Bytes(Vec::new()),
            ValueType::Array => Value::Array(Vec::new()),
            ValueType::Map => Value::Map(BTreeMap::new()),
        }
    }

    pub fn from_tx_param(param: &TxParam) -> Value {
        match param {
            TxParam::Int(v) => Value::Int(*v),
            TxParam::Bool(v) => Value::Bool(*v),
            TxParam::Str(v) => Value::Str(v.clone()),
            TxParam::Bytes(v) => Value::Bytes(v.clone()),
            TxParam::Money(v) => Value::Str(v.clone()),
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Value::Int(v) => Json::from(*v),
            Value::Bool(v) => Json::from(*v),
            Value::Str(v) => Json::from(v.clone()),
            Value::Bytes(v) => Json::from(hex::encode(v)),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(entries) => Json::Object(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Str(String::new()),
            Json::Bool(v) => Value::Bool(*v),
            Json::Number(v) => Value::Int(v.as_i64().unwrap_or(0)),
            Json::String(v) => Value::Str(v.clone()),
            Json::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            Json::Object(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), Value::from_json(value)))
                    .collect(),
            ),
        }
    }

    pub fn matches(&self, value_type: ValueType) -> bool {
        matches!(
            (self, value_type),
            (Value::Int(_), ValueType::Int)
                | (Value::Int(_), ValueType::Money)
                | (Value::Bool(_), ValueType::Bool)
                | (Value::Str(_), ValueType::Str)
                | (Value::Str(_), ValueType::Money)
                | (Value::Bytes(_), ValueType::Bytes)
                | (Value::Array(_), ValueType::Array)
                | (Value::Map(_), ValueType::Map)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    Int,
    Bool,
    Str,
    Bytes,
    Array,
    Map,
    Money,
}

impl ValueType {
    pub fn parse(name: &str) -> Option<ValueType> {
        Some(match name {
            "int" => ValueType::Int,
            "bool" => ValueType::Bool,
            "string" => ValueType::Str,
            "bytes" => ValueType::Bytes,
            "array" => ValueType::Array,
            "map" => ValueType::Map,
            "money" => ValueType::Money,
            _ => return None,
        })
    }
}

/// Location of a local variable: owning block node plus slot index.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VarLoc {
    pub block: usize,
    pub index: usize,
}

#[derive(Clone, Debug)]
pub enum Assignable {
    Var(VarLoc),
    Extend(String),
}

#[derive(Clone, Debug)]
pub enum InitItem {
    Const(Value),
    Var(VarLoc),
    Extend(String),
    Array(Vec<InitItem>),
    Map(Vec<(String, InitItem)>),
}

/// Call target: `Unit` indices are local to a compile unit and rewritten to
/// `Vm` indices when the unit is flushed into the registry.
#[derive(Clone, Copy, Debug)]
pub enum CallTarget {
    Unit(usize),
    Vm(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaiseKind {
    Error,
    Warning,
    Info,
}

#[derive(Clone, Debug)]
pub enum Cmd {
    Push(Value),
    Var(VarLoc),
    ExtendVal(String),
    AssignVar(Vec<Assignable>),
    Call { target: CallTarget, count: usize },
    CallVari { target: CallTarget, count: usize },
    CallExtend { name: String, count: usize },
    Return,
    If(usize),
    Else(usize),
    While(usize),
    Continue,
    Break,
    Label,
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    NotEq,
    Less,
    NotLess,
    Great,
    NotGreat,
    And,
    Or,
    Not,
    SignMinus,
    Index { target: Assignable },
    SetIndex { target: Assignable },
    MapInit(Vec<(String, InitItem)>),
    ArrayInit(Vec<InitItem>),
    UnwrapArr,
    Raise(RaiseKind),
}

#[derive(Clone, Debug)]
pub struct ByteCode {
    pub cmd: Cmd,
    pub line: u32,
}

#[derive(Clone, Debug)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: ValueType,
    pub optional: bool,
}

#[derive(Clone, Debug)]
pub struct ContractInfo {
    pub id: u32,
    pub name: String,
    pub tx_fields: Vec<FieldInfo>,
    pub settings: BTreeMap<String, Value>,
    pub used: HashSet<String>,
    pub can_write: bool,
}

#[derive(Clone, Debug, Default)]
pub struct FuncInfo {
    pub params: Vec<ValueType>,
    pub results: Vec<ValueType>,
    pub variadic: bool,
    pub can_write: bool,
}

#[derive(Clone, Debug)]
pub enum BlockKind {
    Root { ecosystem_id: i64 },
    Contract(ContractInfo),
    Func(FuncInfo),
    Body,
}

/// One node of the arena-allocated block tree. Parent and children are
/// arena indices, which keeps the cyclic parent/child references out of the
/// ownership graph.
#[derive(Clone, Debug)]
pub struct BlockNode {
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub objects: HashMap<String, ObjInfo>,
    pub kind: BlockKind,
    pub vars: Vec<ValueType>,
    pub code: Vec<ByteCode>,
}

impl BlockNode {
    pub fn new(kind: BlockKind, parent: Option<usize>) -> Self {
        Self {
            parent,
            children: Vec::new(),
            objects: HashMap::new(),
            kind,
            vars: Vec::new(),
            code: Vec::new(),
        }
    }

    pub fn func_info(&self) -> Option<&FuncInfo> {
        match &self.kind {
            BlockKind::Func(info) => Some(info),
            _ => None,
        }
    }

    pub fn contract_info(&self) -> Option<&ContractInfo> {
        match &self.kind {
            BlockKind::Contract(info) => Some(info),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum ObjInfo {
    Var { index: usize },
    Func { block: usize },
    Contract { block: usize },
    ExtFunc { name: String },
}

/// Qualifies a contract name with its ecosystem: `Foo` in ecosystem 2 is
/// registered as `@2Foo`; an explicit `@` prefix is kept as written.
pub fn state_name(ecosystem_id: i64, name: &str) -> String {
    if name.starts_with('@') {
        name.to_string()
    } else {
        format!("@{ecosystem_id}{name}")
    }
}

/// The compiled-contract registry.
#[derive(Clone, Debug)]
pub struct VM {
    pub nodes: Vec<BlockNode>,
    pub objects: HashMap<String, ObjInfo>,
    next_contract_id: u32,
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

impl VM {
    pub fn new() -> Self {
        let root = BlockNode::new(BlockKind::Root { ecosystem_id: 0 }, None);
        let mut vm = Self {
            nodes: vec![root],
            objects: HashMap::new(),
            next_contract_id: 1,
        };
        extend::register_standard(&mut vm);
        vm
    }

    pub fn node(&self, index: usize) -> &BlockNode {
        &self.nodes[index]
    }

    /// Compiles a source unit and merges it into the registry.
    pub fn compile(&mut self, source: &str, ecosystem_id: i64) -> Result<(), CompileError> {
        let unit = compile::compile_unit(self, source, ecosystem_id)?;
        self.flush_unit(unit);
        Ok(())
    }

    /// Attaches a compiled unit: nodes move into the arena with their indices
    /// shifted, top-level names land in the global object table, and a
    /// recompiled contract keeps its previous id.
    fn flush_unit(&mut self, unit: compile::CompileUnit) {
        let offset = self.nodes.len();
        let top_level = unit.top_level;
        for mut node in unit.nodes {
            compile::shift_node(&mut node, offset);
            self.nodes.push(node);
        }
        for (name, local_index) in top_level {
            let index = local_index + offset;
            let is_contract = matches!(self.nodes[index].kind, BlockKind::Contract(_));
            let object = if is_contract {
                let prev_id = match self.objects.get(&name) {
                    Some(ObjInfo::Contract { block }) => {
                        self.nodes[*block].contract_info().map(|info| info.id)
                    }
                    _ => None,
                };
                let id = match prev_id {
                    Some(id) => id,
                    None => {
                        let id = self.next_contract_id;
                        self.next_contract_id += 1;
                        id
                    }
                };
                if let BlockKind::Contract(info) = &mut self.nodes[index].kind {
                    info.id = id;
                }
                ObjInfo::Contract { block: index }
            } else {
                ObjInfo::Func { block: index }
            };
            self.nodes[index].parent = Some(0);
            self.nodes[0].children.push(index);
            self.objects.insert(name, object);
        }
    }

    pub fn contract(&self, ecosystem_id: i64, name: &str) -> Option<usize> {
        match self.objects.get(&state_name(ecosystem_id, name)) {
            Some(ObjInfo::Contract { block }) => Some(*block),
            _ => None,
        }
    }

    pub fn contract_child(&self, contract: usize, name: &str) -> Option<usize> {
        match self.nodes[contract].objects.get(name) {
            Some(ObjInfo::Func { block }) => Some(*block),
            _ => None,
        }
    }
}

/// Executes a contract entrypoint for one transaction: binds the declared
/// `data` fields from the supplied parameters as `$name` values, then runs
/// `conditions` followed by `action`.
pub fn execute_contract(
    vm: &VM,
    ecosystem_id: i64,
    name: &str,
    params: &BTreeMap<String, TxParam>,
    ctx: &mut SmartCtx<'_, '_>,
) -> Result<(), VmError> {
    let node = vm
        .contract(ecosystem_id, name)
        .ok_or_else(|| VmError::UnknownContract(name.to_string()))?;
    let info = vm.nodes[node]
        .contract_info()
        .ok_or_else(|| VmError::UnknownContract(name.to_string()))?;
    let qualified = info.name.clone();
    if ctx.contract_stack.iter().any(|entry| entry == &qualified) {
        return Err(VmError::Recursion(qualified));
    }
    let mut extend: BTreeMap<String, Value> = BTreeMap::new();
    for field in &info.tx_fields {
        match params.get(&field.name) {
            Some(param) => {
                let value = Value::from_tx_param(param);
                if !value.matches(field.field_type) {
                    return Err(VmError::TypeMismatch(format!(
                        "field {} expects {:?}",
                        field.name, field.field_type
                    )));
                }
                extend.insert(field.name.clone(), value);
            }
            None if field.optional => {
                extend.insert(field.name.clone(), Value::zero_of(field.field_type));
            }
            None => {
                return Err(VmError::Runtime(format!(
                    "missing required field {}",
                    field.name
                )));
            }
        }
    }
    extend.insert("key_id".into(), Value::Int(ctx.key_id));
    extend.insert("ecosystem_id".into(), Value::Int(ctx.ecosystem_id));
    extend.insert("time".into(), Value::Int(ctx.time));
    extend.insert("block".into(), Value::Int(ctx.block_id as i64));
    extend.insert(
        "txhash".into(),
        Value::Bytes(ctx.tx_hash.to_vec()),
    );

    ctx.contract_stack.push(qualified);
    let result = run_contract_sections(vm, node, &mut extend, ctx);
    ctx.contract_stack.pop();
    result
}

fn run_contract_sections(
    vm: &VM,
    node: usize,
    extend: &mut BTreeMap<String, Value>,
    ctx: &mut SmartCtx<'_, '_>,
) -> Result<(), VmError> {
    for section in ["conditions", "action"] {
        if let Some(func) = vm.contract_child(node, section) {
            let mut runtime = RunTime::new(vm, ctx, extend);
            runtime.run_func(func, Vec::new())?;
        }
    }
    Ok(())
}

/// Shared registry handle with savepoint support. `savepoint` snapshots the
/// whole registry; `rollback` restores the snapshot and `release` drops it.
/// Snapshots nest, mirroring the storage savepoint stack.
pub struct SmartVM {
    vm: RwLock<VM>,
    snapshots: Mutex<Vec<VM>>,
}

impl Default for SmartVM {
    fn default() -> Self {
        Self::new()
    }
}

impl SmartVM {
    pub fn new() -> Self {
        Self {
            vm: RwLock::new(VM::new()),
            snapshots: Mutex::new(Vec::new()),
        }
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, VM> {
        self.vm.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, VM> {
        self.vm.write()
    }

    pub fn savepoint(&self) {
        let snapshot = self.vm.read().clone();
        self.snapshots.lock().push(snapshot);
    }

    pub fn release(&self) {
        self.snapshots.lock().pop();
    }

    pub fn rollback(&self) {
        if let Some(snapshot) = self.snapshots.lock().pop() {
            *self.vm.write() = snapshot;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_name_prefixes_ecosystem() {
        assert_eq!(state_name(1, "Foo"), "@1Foo");
        assert_eq!(state_name(7, "@1Foo"), "@1Foo");
    }

    #[test]
    fn smart_vm_savepoint_round_trip() {
        let smart = SmartVM::new();
        smart
            .write()
            .compile("contract First { action { } }", 1)
            .expect("compile");
        smart.savepoint();
        smart
            .write()
            .compile("contract Second { action { } }", 1)
            .expect("compile");
        assert!(smart.read().contract(1, "Second").is_some());
        smart.rollback();
        assert!(smart.read().contract(1, "Second").is_none());
        assert!(smart.read().contract(1, "First").is_some());
    }

    #[test]
    fn recompiled_contract_keeps_its_id() {
        let mut vm = VM::new();
        vm.compile("contract Keep { action { } }", 1).expect("compile");
        let first = vm.contract(1, "Keep").unwrap();
        let id = vm.nodes[first].contract_info().unwrap().id;
        vm.compile("contract Keep { action { var x int } }", 1)
            .expect("recompile");
        let second = vm.contract(1, "Keep").unwrap();
        assert_ne!(first, second);
        assert_eq!(vm.nodes[second].contract_info().unwrap().id, id);
    }
}
