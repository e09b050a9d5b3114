use std::collections::BTreeMap;

use super::extend::{call_ext, SmartCtx, EXT_FUEL};
use super::{
    Assignable, CallTarget, Cmd, InitItem, RaiseKind, Value, VarLoc, VmError, VM,
};
use crate::types::TxParam;

const MAX_CALL_DEPTH: usize = 64;

/// Approximate heap footprint of a value, charged against the fuel budget on
/// every allocation the executor performs.
pub fn calc_mem(value: &Value) -> i64 {
    match value {
        Value::Int(_) => 8,
        Value::Bool(_) => 1,
        Value::Str(text) => text.len() as i64,
        Value::Bytes(bytes) => bytes.len() as i64,
        Value::Array(items) => 12 + items.iter().map(calc_mem).sum::<i64>(),
        Value::Map(entries) => {
            33 + entries
                .iter()
                .map(|(key, value)| key.len() as i64 + calc_mem(value))
                .sum::<i64>()
        }
    }
}

enum Flow {
    Normal,
    Continue,
    Break,
    Return,
}

struct Frame {
    node: usize,
    vars: Vec<Value>,
}

/// Stack interpreter for one entrypoint invocation. Execution is strictly
/// deterministic; the only host interaction goes through [`SmartCtx`].
pub struct RunTime<'a, 'b, 'c> {
    vm: &'a VM,
    ctx: &'a mut SmartCtx<'b, 'c>,
    extend: &'a mut BTreeMap<String, Value>,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    depth: usize,
}

impl<'a, 'b, 'c> RunTime<'a, 'b, 'c> {
    pub fn new(
        vm: &'a VM,
        ctx: &'a mut SmartCtx<'b, 'c>,
        extend: &'a mut BTreeMap<String, Value>,
    ) -> Self {
        Self {
            vm,
            ctx,
            extend,
            stack: Vec::new(),
            frames: Vec::new(),
            depth: 0,
        }
    }

    fn charge(&mut self, amount: i64) -> Result<(), VmError> {
        self.ctx.charge(amount)
    }

    /// Runs a function node with the given arguments, leaving its declared
    /// results on the stack.
    pub fn run_func(&mut self, node: usize, mut args: Vec<Value>) -> Result<(), VmError> {
        self.depth += 1;
        if self.depth > MAX_CALL_DEPTH {
            return Err(VmError::DepthExceeded);
        }
        let info = self.vm.nodes[node]
            .func_info()
            .cloned()
            .ok_or_else(|| VmError::Runtime("call target is not a function".into()))?;
        if info.variadic {
            let fixed = info.params.len().saturating_sub(1);
            if args.len() < fixed {
                return Err(VmError::WrongArgCount(format!("function@{node}")));
            }
            let rest: Vec<Value> = args.split_off(fixed);
            args.push(Value::Array(rest));
        } else if args.len() != info.params.len() {
            return Err(VmError::WrongArgCount(format!("function@{node}")));
        }

        let mut vars: Vec<Value> = self.vm.nodes[node]
            .vars
            .iter()
            .map(|value_type| Value::zero_of(*value_type))
            .collect();
        for (slot, value) in args.into_iter().enumerate() {
            if slot < vars.len() {
                vars[slot] = value;
            }
        }
        let base = self.stack.len();
        self.frames.push(Frame { node, vars });
        let result = self.run_code(node);
        self.frames.pop();
        self.depth -= 1;
        result?;

        let expected = info.results.len();
        let available = self.stack.len().saturating_sub(base);
        if available < expected {
            return Err(VmError::Runtime("missing return value".into()));
        }
        // Drop intermediate statement values, keep the declared results.
        let extra = available - expected;
        self.stack.drain(base..base + extra);
        Ok(())
    }

    fn run_child(&mut self, node: usize) -> Result<Flow, VmError> {
        let vars: Vec<Value> = self.vm.nodes[node]
            .vars
            .iter()
            .map(|value_type| Value::zero_of(*value_type))
            .collect();
        self.frames.push(Frame { node, vars });
        let flow = self.run_code(node);
        self.frames.pop();
        flow
    }

    fn run_code(&mut self, node: usize) -> Result<Flow, VmError> {
        let vm = self.vm;
        let code = &vm.nodes[node].code;
        let mut labels: Vec<usize> = Vec::new();
        let mut last_cond = false;
        let mut ip = 0usize;

        while ip < code.len() {
            self.charge(1)?;
            match &code[ip].cmd {
                Cmd::Push(value) => {
                    self.charge(calc_mem(value))?;
                    self.stack.push(value.clone());
                }
                Cmd::Var(loc) => {
                    let value = self.var_value(loc)?;
                    self.stack.push(value);
                }
                Cmd::ExtendVal(name) => {
                    let value = self
                        .extend
                        .get(name)
                        .cloned()
                        .ok_or_else(|| VmError::UnknownIdentifier(format!("${name}")))?;
                    self.stack.push(value);
                }
                Cmd::AssignVar(targets) => {
                    let value = self.pop()?;
                    for target in targets {
                        self.assign(target, value.clone())?;
                    }
                }
                Cmd::Call { target, count } | Cmd::CallVari { target, count } => {
                    let CallTarget::Vm(callee) = target else {
                        return Err(VmError::Runtime("unflushed call target".into()));
                    };
                    let args = self.pop_args(*count)?;
                    self.run_func(*callee, args)?;
                }
                Cmd::CallExtend { name, count } => {
                    self.charge(EXT_FUEL)?;
                    let args = self.pop_args(*count)?;
                    if name == "ExecContract" {
                        self.exec_contract(args)?;
                        self.stack.push(Value::Bool(true));
                    } else {
                        let result = call_ext(name, self.ctx, args)?;
                        self.charge(calc_mem(&result))?;
                        self.stack.push(result);
                    }
                }
                Cmd::Return => return Ok(Flow::Return),
                Cmd::If(block) => {
                    let cond = self.pop()?;
                    if cond.truthy() {
                        last_cond = true;
                        match self.run_child(*block)? {
                            Flow::Normal => {}
                            other => return Ok(other),
                        }
                    } else {
                        last_cond = false;
                    }
                }
                Cmd::Else(block) => {
                    if !last_cond {
                        match self.run_child(*block)? {
                            Flow::Normal => {}
                            other => return Ok(other),
                        }
                    }
                }
                Cmd::While(block) => {
                    let cond = self.pop()?;
                    if cond.truthy() {
                        match self.run_child(*block)? {
                            Flow::Normal | Flow::Continue => {
                                // Loop again from the label: re-evaluate the
                                // condition bytecode.
                                let Some(label) = labels.pop() else {
                                    return Err(VmError::Runtime("while without label".into()));
                                };
                                ip = label;
                                continue;
                            }
                            Flow::Break => {}
                            Flow::Return => return Ok(Flow::Return),
                        }
                    }
                }
                Cmd::Continue => return Ok(Flow::Continue),
                Cmd::Break => return Ok(Flow::Break),
                Cmd::Label => labels.push(ip),
                Cmd::Add => self.binary_op(|a, b| match (a, b) {
                    (Value::Int(a), Value::Int(b)) => a
                        .checked_add(b)
                        .map(Value::Int)
                        .ok_or_else(|| VmError::Runtime("integer overflow".into())),
                    (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
                    (a, b) => Err(type_error("+", &a, &b)),
                })?,
                Cmd::Sub => self.int_op("-", |a, b| {
                    a.checked_sub(b)
                        .ok_or_else(|| VmError::Runtime("integer overflow".into()))
                })?,
                Cmd::Mul => self.int_op("*", |a, b| {
                    a.checked_mul(b)
                        .ok_or_else(|| VmError::Runtime("integer overflow".into()))
                })?,
                Cmd::Div => self.int_op("/", |a, b| {
                    if b == 0 {
                        Err(VmError::DivisionByZero)
                    } else {
                        Ok(a / b)
                    }
                })?,
                Cmd::Eq => self.compare_op(|ord| ord == std::cmp::Ordering::Equal)?,
                Cmd::NotEq => self.compare_op(|ord| ord != std::cmp::Ordering::Equal)?,
                Cmd::Less => self.compare_op(|ord| ord == std::cmp::Ordering::Less)?,
                Cmd::NotLess => self.compare_op(|ord| ord != std::cmp::Ordering::Less)?,
                Cmd::Great => self.compare_op(|ord| ord == std::cmp::Ordering::Greater)?,
                Cmd::NotGreat => self.compare_op(|ord| ord != std::cmp::Ordering::Greater)?,
                Cmd::And => self.binary_op(|a, b| Ok(Value::Bool(a.truthy() && b.truthy())))?,
                Cmd::Or => self.binary_op(|a, b| Ok(Value::Bool(a.truthy() || b.truthy())))?,
                Cmd::Not => {
                    let value = self.pop()?;
                    self.stack.push(Value::Bool(!value.truthy()));
                }
                Cmd::SignMinus => {
                    let value = self.pop()?;
                    match value {
                        Value::Int(v) => self.stack.push(Value::Int(
                            v.checked_neg()
                                .ok_or_else(|| VmError::Runtime("integer overflow".into()))?,
                        )),
                        other => {
                            return Err(VmError::TypeMismatch(format!(
                                "cannot negate {}",
                                other.type_name()
                            )));
                        }
                    }
                }
                Cmd::Index { target } => {
                    let key = self.pop()?;
                    let container = self.read_target(target)?;
                    let value = index_value(&container, &key)?;
                    self.stack.push(value);
                }
                Cmd::SetIndex { target } => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.charge(calc_mem(&value))?;
                    let mut container = self.read_target(target)?;
                    set_index_value(&mut container, &key, value)?;
                    self.assign(target, container)?;
                }
                Cmd::MapInit(entries) => {
                    let mut map = BTreeMap::new();
                    for (key, item) in entries {
                        map.insert(key.clone(), self.init_item(item)?);
                    }
                    let value = Value::Map(map);
                    self.charge(calc_mem(&value))?;
                    self.stack.push(value);
                }
                Cmd::ArrayInit(items) => {
                    let mut array = Vec::with_capacity(items.len());
                    for item in items {
                        array.push(self.init_item(item)?);
                    }
                    let value = Value::Array(array);
                    self.charge(calc_mem(&value))?;
                    self.stack.push(value);
                }
                Cmd::UnwrapArr => {
                    let value = self.pop()?;
                    match value {
                        Value::Array(items) => self.stack.extend(items),
                        other => self.stack.push(other),
                    }
                }
                Cmd::Raise(kind) => {
                    let message = match self.pop()? {
                        Value::Str(text) => text,
                        other => format!("{other:?}"),
                    };
                    return Err(match kind {
                        RaiseKind::Error => VmError::Raised(message),
                        RaiseKind::Warning => VmError::Warning(message),
                        RaiseKind::Info => VmError::Info(message),
                    });
                }
            }
            ip += 1;
        }
        Ok(Flow::Normal)
    }

    fn exec_contract(&mut self, args: Vec<Value>) -> Result<(), VmError> {
        if args.len() < 2 {
            return Err(VmError::WrongArgCount("ExecContract".into()));
        }
        let mut iter = args.into_iter();
        let name = match iter.next() {
            Some(Value::Str(name)) => name,
            _ => return Err(VmError::TypeMismatch("contract name must be string".into())),
        };
        let names_csv = match iter.next() {
            Some(Value::Str(csv)) => csv,
            _ => {
                return Err(VmError::TypeMismatch(
                    "parameter names must be string".into(),
                ));
            }
        };
        let names: Vec<&str> = names_csv
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .collect();
        let values: Vec<Value> = iter.collect();
        if !names.is_empty() && names.len() != values.len() {
            return Err(VmError::WrongArgCount("ExecContract".into()));
        }
        let mut params = BTreeMap::new();
        for (field, value) in names.iter().zip(values) {
            params.insert(field.to_string(), value_to_tx_param(value)?);
        }
        let ecosystem_id = self.ctx.ecosystem_id;
        super::execute_contract(self.vm, ecosystem_id, &name, &params, self.ctx)
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack
            .pop()
            .ok_or_else(|| VmError::Runtime("stack underflow".into()))
    }

    fn pop_args(&mut self, count: usize) -> Result<Vec<Value>, VmError> {
        if self.stack.len() < count {
            return Err(VmError::Runtime("stack underflow".into()));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn binary_op(
        &mut self,
        op: impl FnOnce(Value, Value) -> Result<Value, VmError>,
    ) -> Result<(), VmError> {
        let right = self.pop()?;
        let left = self.pop()?;
        let result = op(left, right)?;
        self.stack.push(result);
        Ok(())
    }

    fn int_op(
        &mut self,
        name: &'static str,
        op: impl FnOnce(i64, i64) -> Result<i64, VmError>,
    ) -> Result<(), VmError> {
        self.binary_op(|a, b| match (a, b) {
            (Value::Int(a), Value::Int(b)) => op(a, b).map(Value::Int),
            (a, b) => Err(type_error(name, &a, &b)),
        })
    }

    fn compare_op(
        &mut self,
        decide: impl FnOnce(std::cmp::Ordering) -> bool,
    ) -> Result<(), VmError> {
        self.binary_op(|a, b| {
            let ordering = match (&a, &b) {
                (Value::Int(a), Value::Int(b)) => a.cmp(b),
                (Value::Str(a), Value::Str(b)) => a.cmp(b),
                (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
                (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
                _ => return Err(type_error("compare", &a, &b)),
            };
            Ok(Value::Bool(decide(ordering)))
        })
    }

    fn var_value(&self, loc: &VarLoc) -> Result<Value, VmError> {
        for frame in self.frames.iter().rev() {
            if frame.node == loc.block {
                return frame
                    .vars
                    .get(loc.index)
                    .cloned()
                    .ok_or_else(|| VmError::Runtime("variable slot out of range".into()));
            }
        }
        Err(VmError::Runtime("variable frame not found".into()))
    }

    fn assign(&mut self, target: &Assignable, value: Value) -> Result<(), VmError> {
        match target {
            Assignable::Var(loc) => {
                for frame in self.frames.iter_mut().rev() {
                    if frame.node == loc.block {
                        let slot = frame
                            .vars
                            .get_mut(loc.index)
                            .ok_or_else(|| VmError::Runtime("variable slot out of range".into()))?;
                        *slot = value;
                        return Ok(());
                    }
                }
                Err(VmError::Runtime("variable frame not found".into()))
            }
            Assignable::Extend(name) => {
                self.extend.insert(name.clone(), value);
                Ok(())
            }
        }
    }

    fn read_target(&self, target: &Assignable) -> Result<Value, VmError> {
        match target {
            Assignable::Var(loc) => self.var_value(loc),
            Assignable::Extend(name) => self
                .extend
                .get(name)
                .cloned()
                .ok_or_else(|| VmError::UnknownIdentifier(format!("${name}"))),
        }
    }

    fn init_item(&mut self, item: &InitItem) -> Result<Value, VmError> {
        Ok(match item {
            InitItem::Const(value) => value.clone(),
            InitItem::Var(loc) => self.var_value(loc)?,
            InitItem::Extend(name) => self
                .extend
                .get(name)
                .cloned()
                .ok_or_else(|| VmError::UnknownIdentifier(format!("${name}")))?,
            InitItem::Array(items) => {
                let mut array = Vec::with_capacity(items.len());
                for item in items {
                    array.push(self.init_item(item)?);
                }
                Value::Array(array)
            }
            InitItem::Map(entries) => {
                let mut map = BTreeMap::new();
                for (key, item) in entries {
                    map.insert(key.clone(), self.init_item(item)?);
                }
                Value::Map(map)
            }
        })
    }
}

fn type_error(op: &str, a: &Value, b: &Value) -> VmError {
    VmError::TypeMismatch(format!(
        "operator {op} is not defined for {} and {}",
        a.type_name(),
        b.type_name()
    ))
}

fn index_value(container: &Value, key: &Value) -> Result<Value, VmError> {
    match (container, key) {
        (Value::Array(items), Value::Int(index)) => items
            .get(usize::try_from(*index).map_err(|_| VmError::IndexOutOfRange)?)
            .cloned()
            .ok_or(VmError::IndexOutOfRange),
        (Value::Map(entries), Value::Str(key)) => {
            Ok(entries.get(key).cloned().unwrap_or(Value::Str(String::new())))
        }
        (container, key) => Err(VmError::TypeMismatch(format!(
            "cannot index {} with {}",
            container.type_name(),
            key.type_name()
        ))),
    }
}

fn set_index_value(container: &mut Value, key: &Value, value: Value) -> Result<(), VmError> {
    match (container, key) {
        (Value::Array(items), Value::Int(index)) => {
            let index = usize::try_from(*index).map_err(|_| VmError::IndexOutOfRange)?;
            if index < items.len() {
                items[index] = value;
                Ok(())
            } else if index == items.len() {
                items.push(value);
                Ok(())
            } else {
                Err(VmError::IndexOutOfRange)
            }
        }
        (Value::Map(entries), Value::Str(key)) => {
            entries.insert(key.clone(), value);
            Ok(())
        }
        (container, key) => Err(VmError::TypeMismatch(format!(
            "cannot index {} with {}",
            container.type_name(),
            key.type_name()
        ))),
    }
}

fn value_to_tx_param(value: Value) -> Result<TxParam, VmError> {
    Ok(match value {
        Value::Int(v) => TxParam::Int(v),
        Value::Bool(v) => TxParam::Bool(v),
        Value::Str(v) => TxParam::Str(v),
        Value::Bytes(v) => TxParam::Bytes(v),
        other => {
            return Err(VmError::TypeMismatch(format!(
                "{} cannot be passed to a contract",
                other.type_name()
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calc_mem_matches_expected_sizes() {
        let cases: Vec<(Value, i64)> = vec![
            (Value::Bool(true), 1),
            (Value::Int(1), 8),
            (Value::Str("test".into()), 4),
            (Value::Bytes(vec![0; 10]), 10),
            (Value::Array(vec![Value::Int(1), Value::Int(2)]), 12 + 16),
        ];
        for (value, expected) in cases {
            assert_eq!(calc_mem(&value), expected, "{value:?}");
        }
    }

    #[test]
    fn index_helpers_cover_arrays_and_maps() {
        let array = Value::Array(vec![Value::Int(5), Value::Int(6)]);
        assert_eq!(
            index_value(&array, &Value::Int(1)).unwrap(),
            Value::Int(6)
        );
        assert!(matches!(
            index_value(&array, &Value::Int(9)),
            Err(VmError::IndexOutOfRange)
        ));

        let mut map = Value::Map(BTreeMap::new());
        set_index_value(&mut map, &Value::Str("k".into()), Value::Int(3)).unwrap();
        assert_eq!(
            index_value(&map, &Value::Str("k".into())).unwrap(),
            Value::Int(3)
        );
    }
}
