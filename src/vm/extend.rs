use serde_json::{Map as JsonMap, Value as Json};

use super::{ObjInfo, Value, VmError, VM};
use crate::storage::{RollbackTxRow, StorageTx};

/// Fuel charged for any host-function call on top of its own costs.
pub const EXT_FUEL: i64 = 10;
/// Fuel charged per storage access performed by a host function.
const DB_FUEL: i64 = 100;

/// Host context for one transaction execution: the savepointed storage
/// transaction, the identity of the running transaction, the fuel budget and
/// the rollback-log entries written so far.
pub struct SmartCtx<'a, 'b> {
    pub tx: &'a mut StorageTx<'b>,
    pub block_id: u64,
    pub tx_hash: [u8; 32],
    pub key_id: i64,
    pub ecosystem_id: i64,
    pub time: i64,
    pub fuel_left: i64,
    pub rollback_entries: Vec<RollbackTxRow>,
    pub contract_stack: Vec<String>,
}

impl<'a, 'b> SmartCtx<'a, 'b> {
    pub fn new(
        tx: &'a mut StorageTx<'b>,
        block_id: u64,
        tx_hash: [u8; 32],
        key_id: i64,
        ecosystem_id: i64,
        time: i64,
        fuel: i64,
    ) -> Self {
        Self {
            tx,
            block_id,
            tx_hash,
            key_id,
            ecosystem_id,
            time,
            fuel_left: fuel,
            rollback_entries: Vec::new(),
            contract_stack: Vec::new(),
        }
    }

    pub fn charge(&mut self, amount: i64) -> Result<(), VmError> {
        self.fuel_left -= amount.max(0);
        if self.fuel_left < 0 {
            return Err(VmError::FuelExhausted);
        }
        Ok(())
    }

    pub fn fuel_spent(&self, initial: i64) -> i64 {
        initial - self.fuel_left
    }

    fn table_name(&self, table: &str) -> String {
        if table.chars().next().map(|ch| ch.is_ascii_digit()) == Some(true) {
            table.to_string()
        } else {
            format!("{}_{}", self.ecosystem_id, table)
        }
    }
}

pub type ExtFn = fn(&mut SmartCtx<'_, '_>, Vec<Value>) -> Result<Value, VmError>;

pub struct ExtFuncInfo {
    pub name: &'static str,
    pub min_args: usize,
    pub variadic: bool,
    pub can_write: bool,
    pub func: ExtFn,
}

static EXT_FUNCS: &[ExtFuncInfo] = &[
    ExtFuncInfo {
        name: "DBInsert",
        min_args: 3,
        variadic: false,
        can_write: true,
        func: db_insert,
    },
    ExtFuncInfo {
        name: "DBUpdate",
        min_args: 3,
        variadic: false,
        can_write: true,
        func: db_update,
    },
    ExtFuncInfo {
        name: "DBRow",
        min_args: 2,
        variadic: false,
        can_write: false,
        func: db_row,
    },
    ExtFuncInfo {
        name: "Len",
        min_args: 1,
        variadic: false,
        can_write: false,
        func: len_fn,
    },
    ExtFuncInfo {
        name: "Str",
        min_args: 1,
        variadic: false,
        can_write: false,
        func: str_fn,
    },
    ExtFuncInfo {
        name: "Int",
        min_args: 1,
        variadic: false,
        can_write: false,
        func: int_fn,
    },
    ExtFuncInfo {
        name: "Sprintf",
        min_args: 1,
        variadic: true,
        can_write: false,
        func: sprintf_fn,
    },
    ExtFuncInfo {
        name: "Contains",
        min_args: 2,
        variadic: false,
        can_write: false,
        func: contains_fn,
    },
    ExtFuncInfo {
        name: "Join",
        min_args: 2,
        variadic: false,
        can_write: false,
        func: join_fn,
    },
    ExtFuncInfo {
        name: "ExecContract",
        min_args: 2,
        variadic: true,
        can_write: true,
        func: exec_contract_stub,
    },
];

pub fn ext_func(name: &str) -> Option<&'static ExtFuncInfo> {
    EXT_FUNCS.iter().find(|info| info.name == name)
}

/// Registers the host functions in the VM's global object table so the
/// compiler can resolve them by name.
pub fn register_standard(vm: &mut VM) {
    for info in EXT_FUNCS {
        vm.objects.insert(
            info.name.to_string(),
            ObjInfo::ExtFunc {
                name: info.name.to_string(),
            },
        );
    }
}

pub fn call_ext(
    name: &str,
    ctx: &mut SmartCtx<'_, '_>,
    args: Vec<Value>,
) -> Result<Value, VmError> {
    let info =
        ext_func(name).ok_or_else(|| VmError::UnknownIdentifier(name.to_string()))?;
    (info.func)(ctx, args)
}

fn exec_contract_stub(_ctx: &mut SmartCtx<'_, '_>, _args: Vec<Value>) -> Result<Value, VmError> {
    // Dispatched inside the executor, which owns the VM reference.
    Err(VmError::Runtime("ExecContract outside executor".into()))
}

fn row_id_arg(value: &Value) -> Result<String, VmError> {
    match value {
        Value::Str(text) => Ok(text.clone()),
        Value::Int(number) => Ok(number.to_string()),
        other => Err(VmError::TypeMismatch(format!(
            "row id must be string or int, got {}",
            other.type_name()
        ))),
    }
}

fn map_arg(value: Value) -> Result<JsonMap<String, Json>, VmError> {
    match value {
        Value::Map(entries) => Ok(entries
            .into_iter()
            .map(|(key, value)| (key, value.to_json()))
            .collect()),
        other => Err(VmError::TypeMismatch(format!(
            "row value must be map, got {}",
            other.type_name()
        ))),
    }
}

/// DBInsert(table, id, row-map): creates the row; the previous-absence
/// before-image goes to the rollback log.
fn db_insert(ctx: &mut SmartCtx<'_, '_>, mut args: Vec<Value>) -> Result<Value, VmError> {
    ctx.charge(DB_FUEL)?;
    let row = map_arg(args.pop().expect("arity checked"))?;
    let row_id = row_id_arg(&args[1])?;
    let table = match &args[0] {
        Value::Str(table) => ctx.table_name(table),
        other => {
            return Err(VmError::TypeMismatch(format!(
                "table name must be string, got {}",
                other.type_name()
            )));
        }
    };
    let existing = ctx
        .tx
        .state_row(&table, &row_id)
        .map_err(|err| VmError::Storage(err.to_string()))?;
    if existing.is_some() {
        return Err(VmError::Runtime(format!(
            "row {row_id} already exists in {table}"
        )));
    }
    let entry = ctx
        .tx
        .put_state_row_logged(
            ctx.block_id,
            ctx.tx_hash,
            &table,
            &row_id,
            &Json::Object(row),
        )
        .map_err(|err| VmError::Storage(err.to_string()))?;
    ctx.rollback_entries.push(entry);
    Ok(Value::Str(row_id))
}

/// DBUpdate(table, id, row-map): merges the map into an existing row.
fn db_update(ctx: &mut SmartCtx<'_, '_>, mut args: Vec<Value>) -> Result<Value, VmError> {
    ctx.charge(DB_FUEL)?;
    let patch = map_arg(args.pop().expect("arity checked"))?;
    let row_id = row_id_arg(&args[1])?;
    let table = match &args[0] {
        Value::Str(table) => ctx.table_name(table),
        other => {
            return Err(VmError::TypeMismatch(format!(
                "table name must be string, got {}",
                other.type_name()
            )));
        }
    };
    let existing = ctx
        .tx
        .state_row(&table, &row_id)
        .map_err(|err| VmError::Storage(err.to_string()))?;
    let Some(Json::Object(mut row)) = existing else {
        return Err(VmError::Runtime(format!(
            "row {row_id} does not exist in {table}"
        )));
    };
    for (key, value) in patch {
        row.insert(key, value);
    }
    let entry = ctx
        .tx
        .put_state_row_logged(
            ctx.block_id,
            ctx.tx_hash,
            &table,
            &row_id,
            &Json::Object(row),
        )
        .map_err(|err| VmError::Storage(err.to_string()))?;
    ctx.rollback_entries.push(entry);
    Ok(Value::Str(row_id))
}

/// DBRow(table, id): the row as a map, empty when absent.
fn db_row(ctx: &mut SmartCtx<'_, '_>, args: Vec<Value>) -> Result<Value, VmError> {
    ctx.charge(DB_FUEL)?;
    let row_id = row_id_arg(&args[1])?;
    let table = match &args[0] {
        Value::Str(table) => ctx.table_name(table),
        other => {
            return Err(VmError::TypeMismatch(format!(
                "table name must be string, got {}",
                other.type_name()
            )));
        }
    };
    let row = ctx
        .tx
        .state_row(&table, &row_id)
        .map_err(|err| VmError::Storage(err.to_string()))?;
    Ok(match row {
        Some(json) => Value::from_json(&json),
        None => Value::Map(Default::default()),
    })
}

fn len_fn(_ctx: &mut SmartCtx<'_, '_>, args: Vec<Value>) -> Result<Value, VmError> {
    let length = match &args[0] {
        Value::Str(text) => text.len(),
        Value::Bytes(bytes) => bytes.len(),
        Value::Array(items) => items.len(),
        Value::Map(entries) => entries.len(),
        other => {
            return Err(VmError::TypeMismatch(format!(
                "Len is not defined for {}",
                other.type_name()
            )));
        }
    };
    Ok(Value::Int(length as i64))
}

fn to_display(value: &Value) -> String {
    match value {
        Value::Int(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Str(text) => text.clone(),
        Value::Bytes(bytes) => hex::encode(bytes),
        other => other.to_json().to_string(),
    }
}

fn str_fn(_ctx: &mut SmartCtx<'_, '_>, args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::Str(to_display(&args[0])))
}

fn int_fn(_ctx: &mut SmartCtx<'_, '_>, args: Vec<Value>) -> Result<Value, VmError> {
    let value = match &args[0] {
        Value::Int(number) => *number,
        Value::Bool(flag) => i64::from(*flag),
        Value::Str(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                0
            } else {
                trimmed
                    .parse()
                    .map_err(|_| VmError::Runtime(format!("cannot convert {text:?} to int")))?
            }
        }
        other => {
            return Err(VmError::TypeMismatch(format!(
                "Int is not defined for {}",
                other.type_name()
            )));
        }
    };
    Ok(Value::Int(value))
}

/// Sequentially substitutes `%s`, `%d` and `%v` placeholders.
fn sprintf_fn(_ctx: &mut SmartCtx<'_, '_>, args: Vec<Value>) -> Result<Value, VmError> {
    let Value::Str(format) = &args[0] else {
        return Err(VmError::TypeMismatch("format must be string".into()));
    };
    let mut out = String::with_capacity(format.len());
    let mut values = args[1..].iter();
    let mut chars = format.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('s') | Some('d') | Some('v') => match values.next() {
                Some(value) => out.push_str(&to_display(value)),
                None => return Err(VmError::WrongArgCount("Sprintf".into())),
            },
            Some(other) => {
                return Err(VmError::Runtime(format!("unknown format verb %{other}")));
            }
            None => return Err(VmError::Runtime("dangling % in format".into())),
        }
    }
    Ok(Value::Str(out))
}

fn contains_fn(_ctx: &mut SmartCtx<'_, '_>, args: Vec<Value>) -> Result<Value, VmError> {
    match (&args[0], &args[1]) {
        (Value::Str(haystack), Value::Str(needle)) => {
            Ok(Value::Bool(haystack.contains(needle)))
        }
        (a, b) => Err(VmError::TypeMismatch(format!(
            "Contains is not defined for {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn join_fn(_ctx: &mut SmartCtx<'_, '_>, args: Vec<Value>) -> Result<Value, VmError> {
    match (&args[0], &args[1]) {
        (Value::Array(items), Value::Str(sep)) => {
            let parts: Vec<String> = items.iter().map(to_display).collect();
            Ok(Value::Str(parts.join(sep)))
        }
        (a, b) => Err(VmError::TypeMismatch(format!(
            "Join is not defined for {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::types::TxParam;
    use crate::vm::execute_contract;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn with_ctx<T>(fuel: i64, run: impl FnOnce(&mut SmartCtx<'_, '_>) -> T) -> T {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let mut tx = storage.begin();
        let mut ctx = SmartCtx::new(&mut tx, 3, [9u8; 32], 42, 1, 1_700_000_000, fuel);
        run(&mut ctx)
    }

    #[test]
    fn db_insert_update_row_round_trip() {
        with_ctx(1_000_000, |ctx| {
            let inserted = db_insert(
                ctx,
                vec![
                    Value::Str("keys".into()),
                    Value::Int(7),
                    Value::Map(BTreeMap::from([("amount".to_string(), Value::Int(10))])),
                ],
            )
            .expect("insert");
            assert_eq!(inserted, Value::Str("7".into()));

            db_update(
                ctx,
                vec![
                    Value::Str("keys".into()),
                    Value::Int(7),
                    Value::Map(BTreeMap::from([("amount".to_string(), Value::Int(20))])),
                ],
            )
            .expect("update");

            let row = db_row(ctx, vec![Value::Str("keys".into()), Value::Int(7)]).expect("row");
            assert_eq!(
                row,
                Value::Map(BTreeMap::from([("amount".to_string(), Value::Int(20))]))
            );
            assert_eq!(ctx.rollback_entries.len(), 2);
            assert_eq!(ctx.rollback_entries[0].data, None);
            assert_eq!(
                ctx.rollback_entries[1].data.as_deref(),
                Some(json!({"amount": 10}).to_string().as_str())
            );
            assert_eq!(ctx.rollback_entries[0].table, "1_keys");
        });
    }

    #[test]
    fn duplicate_insert_fails() {
        with_ctx(1_000_000, |ctx| {
            let args = || {
                vec![
                    Value::Str("keys".into()),
                    Value::Int(1),
                    Value::Map(BTreeMap::new()),
                ]
            };
            db_insert(ctx, args()).expect("first insert");
            assert!(db_insert(ctx, args()).is_err());
        });
    }

    #[test]
    fn builtins_behave() {
        with_ctx(1_000_000, |ctx| {
            assert_eq!(
                len_fn(ctx, vec![Value::Str("abcd".into())]).unwrap(),
                Value::Int(4)
            );
            assert_eq!(
                int_fn(ctx, vec![Value::Str(" 42 ".into())]).unwrap(),
                Value::Int(42)
            );
            assert_eq!(
                sprintf_fn(
                    ctx,
                    vec![
                        Value::Str("%s has %d".into()),
                        Value::Str("node".into()),
                        Value::Int(3),
                    ],
                )
                .unwrap(),
                Value::Str("node has 3".into())
            );
            assert_eq!(
                join_fn(
                    ctx,
                    vec![
                        Value::Array(vec![Value::Int(1), Value::Int(2)]),
                        Value::Str(",".into()),
                    ],
                )
                .unwrap(),
                Value::Str("1,2".into())
            );
        });
    }

    #[test]
    fn contract_execution_writes_state_and_charges_fuel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let mut vm = VM::new();
        vm.compile(
            r#"contract Credit {
    data {
        Id int
        Amount int
    }
    conditions {
        if $Amount <= 0 {
            error "non-positive amount"
        }
    }
    action {
        var row map
        row = DBRow("keys", $Id)
        if Len(row) == 0 {
            DBInsert("keys", $Id, {"amount": $Amount})
        } else {
            var total int
            total = row["amount"] + $Amount
            DBUpdate("keys", $Id, {"amount": total})
        }
    }
}"#,
            1,
        )
        .expect("compile");

        let mut params = BTreeMap::new();
        params.insert("Id".to_string(), TxParam::Int(5));
        params.insert("Amount".to_string(), TxParam::Int(100));

        let mut tx = storage.begin();
        let mut ctx = SmartCtx::new(&mut tx, 2, [1u8; 32], 9, 1, 1_700_000_000, 1_000_000);
        execute_contract(&vm, 1, "Credit", &params, &mut ctx).expect("run");
        assert!(ctx.fuel_spent(1_000_000) > 0);
        assert_eq!(ctx.rollback_entries.len(), 1);
        tx.commit().expect("commit");
        assert_eq!(
            storage.state_row("1_keys", "5").expect("read"),
            Some(json!({"amount": 100}))
        );

        // Apply again: the update path merges the balance.
        let mut tx = storage.begin();
        let mut ctx = SmartCtx::new(&mut tx, 3, [2u8; 32], 9, 1, 1_700_000_001, 1_000_000);
        execute_contract(&vm, 1, "Credit", &params, &mut ctx).expect("run again");
        tx.commit().expect("commit");
        assert_eq!(
            storage.state_row("1_keys", "5").expect("read"),
            Some(json!({"amount": 200}))
        );
    }

    #[test]
    fn conditions_error_aborts_execution() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let mut vm = VM::new();
        vm.compile(
            r#"contract Guard {
    data {
        Amount int
    }
    conditions {
        if $Amount <= 0 {
            error Sprintf("bad amount %d", $Amount)
        }
    }
    action {
        DBInsert("log", 1, {"ok": true})
    }
}"#,
            1,
        )
        .expect("compile");
        let mut params = BTreeMap::new();
        params.insert("Amount".to_string(), TxParam::Int(-1));
        let mut tx = storage.begin();
        let mut ctx = SmartCtx::new(&mut tx, 2, [1u8; 32], 9, 1, 0, 1_000_000);
        let err = execute_contract(&vm, 1, "Guard", &params, &mut ctx).expect_err("must fail");
        assert!(matches!(err, VmError::Raised(message) if message.contains("bad amount")));
        assert!(ctx.rollback_entries.is_empty());
    }

    #[test]
    fn fuel_exhaustion_stops_loops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let mut vm = VM::new();
        vm.compile(
            r#"contract Spin {
    action {
        var i int
        while true {
            i = i + 1
        }
    }
}"#,
            1,
        )
        .expect("compile");
        let mut tx = storage.begin();
        let mut ctx = SmartCtx::new(&mut tx, 2, [1u8; 32], 9, 1, 0, 10_000);
        let err =
            execute_contract(&vm, 1, "Spin", &BTreeMap::new(), &mut ctx).expect_err("must stop");
        assert!(matches!(err, VmError::FuelExhausted));
    }

    #[test]
    fn functions_and_loops_compute() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let mut vm = VM::new();
        vm.compile(
            r#"func sum(upto int) int {
    var total, i int
    i = 1
    while i <= upto {
        total = total + i
        i = i + 1
    }
    return total
}

contract Tally {
    action {
        DBInsert("tallies", 1, {"value": sum(10)})
    }
}"#,
            1,
        )
        .expect("compile");
        let mut tx = storage.begin();
        let mut ctx = SmartCtx::new(&mut tx, 2, [1u8; 32], 9, 1, 0, 1_000_000);
        execute_contract(&vm, 1, "Tally", &BTreeMap::new(), &mut ctx).expect("run");
        tx.commit().expect("commit");
        assert_eq!(
            storage.state_row("1_tallies", "1").expect("read"),
            Some(json!({"value": 55}))
        );
    }

    #[test]
    fn nested_contract_call_is_cycle_checked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let mut vm = VM::new();
        vm.compile("contract Inner { data { N int } action { DBInsert(\"inner\", $N, {\"n\": $N}) } }", 1)
            .expect("inner");
        vm.compile(
            "contract Outer { action { Inner(\"N\", 4) } }",
            1,
        )
        .expect("outer");
        let mut tx = storage.begin();
        let mut ctx = SmartCtx::new(&mut tx, 2, [1u8; 32], 9, 1, 0, 1_000_000);
        execute_contract(&vm, 1, "Outer", &BTreeMap::new(), &mut ctx).expect("run");
        tx.commit().expect("commit");
        assert_eq!(
            storage.state_row("1_inner", "4").expect("read"),
            Some(json!({"n": 4}))
        );
    }
}
