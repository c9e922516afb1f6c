//! Calling conventions between JSON arguments and wasm exports.
//!
//! A method `m` is dispatched through one of two conventions:
//!
//! - **JSON** -- an export named `json:m` with type `(i32, i32) -> i64`.  The
//!   host allocates a buffer through the plugin's `alloc(len) -> ptr` export,
//!   writes the UTF-8 JSON argument array into it, and calls `json:m(ptr,
//!   len)`.  The result packs the pointer of the JSON result in the high 32
//!   bits and its length in the low 32 bits.
//! - **Numeric** -- an export named `m` whose parameters and results are all
//!   `i32`/`i64`/`f32`/`f64`.  JSON numbers (and booleans, as 0/1) are
//!   converted per parameter type.
//!
//! When both exports exist the JSON convention wins.

use serde_json::{Number, Value};
use wasmtime::{AsContextMut, Func, Instance, Val, ValType};

use super::host::{HostState, MAX_GUEST_BUFFER, read_guest, write_guest};

/// Export-name prefix of JSON-convention methods.
pub const JSON_EXPORT_PREFIX: &str = "json:";

/// Why a dispatch did not produce a result.
#[derive(Debug)]
pub(crate) enum AbiError {
    /// The arguments do not fit the export's signature.
    InvalidArguments(String),
    /// The export exists but cannot be called through either convention.
    Unsupported(String),
    /// The guest trapped or a host import failed.
    Trap(wasmtime::Error),
}

impl From<wasmtime::Error> for AbiError {
    fn from(err: wasmtime::Error) -> Self {
        Self::Trap(err)
    }
}

/// How a method name resolved against the instance's exports.
pub(crate) enum Target {
    Json(Func),
    Numeric(Func),
}

pub(crate) fn resolve(
    instance: &Instance,
    mut store: impl AsContextMut<Data = HostState>,
    method: &str,
) -> Option<Target> {
    if let Some(func) = instance.get_func(&mut store, &format!("{JSON_EXPORT_PREFIX}{method}")) {
        return Some(Target::Json(func));
    }
    instance.get_func(&mut store, method).map(Target::Numeric)
}

pub(crate) fn invoke(
    instance: &Instance,
    mut store: impl AsContextMut<Data = HostState>,
    target: Target,
    args: &[Value],
) -> Result<Value, AbiError> {
    match target {
        Target::Json(func) => call_json(instance, &mut store, func, args),
        Target::Numeric(func) => call_numeric(&mut store, func, args),
    }
}

// ---------------------------------------------------------------------------
// JSON convention
// ---------------------------------------------------------------------------

fn call_json(
    instance: &Instance,
    mut store: impl AsContextMut<Data = HostState>,
    func: Func,
    args: &[Value],
) -> Result<Value, AbiError> {
    let typed = func
        .typed::<(i32, i32), i64>(&store)
        .map_err(|_| AbiError::Unsupported("JSON methods must have type (i32, i32) -> i64".into()))?;
    let alloc = instance
        .get_typed_func::<i32, i32>(&mut store, "alloc")
        .map_err(|_| {
            AbiError::Unsupported("JSON methods require an `alloc: (i32) -> i32` export".into())
        })?;
    let memory = instance
        .get_memory(&mut store, "memory")
        .ok_or_else(|| AbiError::Unsupported("plugin does not export `memory`".into()))?;

    let input = serde_json::to_vec(args)
        .map_err(|e| AbiError::InvalidArguments(format!("arguments are not serializable: {e}")))?;
    if input.len() > MAX_GUEST_BUFFER {
        return Err(AbiError::InvalidArguments(format!(
            "arguments of {} bytes exceed the {MAX_GUEST_BUFFER} byte limit",
            input.len()
        )));
    }
    let len = input.len() as i32;

    let ptr = alloc.call(&mut store, len)?;
    write_guest(&memory, &mut store, ptr, &input)?;
    let packed = typed.call(&mut store, (ptr, len))? as u64;

    let (out_ptr, out_len) = ((packed >> 32) as u32 as i32, (packed & 0xffff_ffff) as u32 as i32);
    if out_len == 0 {
        return Ok(Value::Null);
    }
    let output = read_guest(&memory, &store, out_ptr, out_len)?;
    serde_json::from_slice(&output)
        .map_err(|e| AbiError::Trap(anyhow::anyhow!("plugin returned malformed JSON: {e}")))
}

// ---------------------------------------------------------------------------
// Numeric convention
// ---------------------------------------------------------------------------

fn call_numeric(
    mut store: impl AsContextMut<Data = HostState>,
    func: Func,
    args: &[Value],
) -> Result<Value, AbiError> {
    let ty = func.ty(&store);
    let params: Vec<ValType> = ty.params().collect();
    let results: Vec<ValType> = ty.results().collect();

    if let Some(bad) = results.iter().find(|ty| !is_numeric(ty)) {
        return Err(AbiError::Unsupported(format!("unsupported result type {bad}")));
    }
    if args.len() != params.len() {
        return Err(AbiError::InvalidArguments(format!(
            "expected {} argument(s), got {}",
            params.len(),
            args.len()
        )));
    }

    let inputs = args
        .iter()
        .zip(&params)
        .enumerate()
        .map(|(i, (arg, ty))| {
            json_to_val(arg, ty).map_err(|reason| format!("argument {i}: {reason}"))
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(AbiError::InvalidArguments)?;

    let mut outputs = vec![Val::I32(0); results.len()];
    func.call(&mut store, &inputs, &mut outputs)?;

    Ok(match outputs.as_slice() {
        [] => Value::Null,
        [single] => val_to_json(single),
        many => Value::Array(many.iter().map(val_to_json).collect()),
    })
}

fn is_numeric(ty: &ValType) -> bool {
    matches!(ty, ValType::I32 | ValType::I64 | ValType::F32 | ValType::F64)
}

fn as_integer(arg: &Value) -> Result<i64, String> {
    match arg {
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(i);
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
                    Ok(f as i64)
                }
                _ => Err(format!("{n} is not an integer")),
            }
        }
        other => Err(format!("expected a number, got {}", type_name(other))),
    }
}

fn as_float(arg: &Value) -> Result<f64, String> {
    match arg {
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("{n} is not representable")),
        other => Err(format!("expected a number, got {}", type_name(other))),
    }
}

/// Convert one JSON argument to a wasm value of type `ty`.
pub(crate) fn json_to_val(arg: &Value, ty: &ValType) -> Result<Val, String> {
    match ty {
        ValType::I32 => {
            let i = as_integer(arg)?;
            i32::try_from(i)
                .map(Val::I32)
                .map_err(|_| format!("{i} does not fit in i32"))
        }
        ValType::I64 => as_integer(arg).map(Val::I64),
        ValType::F32 => as_float(arg).map(|f| Val::F32((f as f32).to_bits())),
        ValType::F64 => as_float(arg).map(|f| Val::F64(f.to_bits())),
        other => Err(format!("parameter type {other} is not supported")),
    }
}

/// Convert one wasm result to JSON.  Non-finite floats become `null`.
pub(crate) fn val_to_json(val: &Val) -> Value {
    match val {
        Val::I32(i) => Value::from(*i),
        Val::I64(i) => Value::from(*i),
        Val::F32(bits) => float_to_json(f64::from(f32::from_bits(*bits))),
        Val::F64(bits) => float_to_json(f64::from_bits(*bits)),
        _ => Value::Null,
    }
}

fn float_to_json(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn integers_convert_by_parameter_type() {
        assert!(matches!(json_to_val(&json!(7), &ValType::I32), Ok(Val::I32(7))));
        assert!(matches!(json_to_val(&json!(-7), &ValType::I64), Ok(Val::I64(-7))));
        assert!(matches!(json_to_val(&json!(3.0), &ValType::I32), Ok(Val::I32(3))));
        assert!(matches!(json_to_val(&json!(true), &ValType::I32), Ok(Val::I32(1))));
    }

    #[test]
    fn out_of_range_integer_is_rejected() {
        let err = json_to_val(&json!(i64::MAX), &ValType::I32).unwrap_err();
        assert!(err.contains("does not fit in i32"));
    }

    #[test]
    fn fractional_number_is_not_an_integer() {
        assert!(json_to_val(&json!(1.5), &ValType::I64).is_err());
    }

    #[test]
    fn non_numbers_are_rejected() {
        let err = json_to_val(&json!("2"), &ValType::I32).unwrap_err();
        assert_eq!(err, "expected a number, got string");
        assert!(json_to_val(&json!({"a": 1}), &ValType::F64).is_err());
    }

    #[test]
    fn floats_keep_their_bits() {
        match json_to_val(&json!(1.5), &ValType::F64) {
            Ok(Val::F64(bits)) => assert_eq!(f64::from_bits(bits), 1.5),
            other => panic!("unexpected {other:?}"),
        }
        match json_to_val(&json!(0.25), &ValType::F32) {
            Ok(Val::F32(bits)) => assert_eq!(f32::from_bits(bits), 0.25),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn results_convert_to_json() {
        assert_eq!(val_to_json(&Val::I32(5)), json!(5));
        assert_eq!(val_to_json(&Val::I64(-9)), json!(-9));
        assert_eq!(val_to_json(&Val::F64(2.5f64.to_bits())), json!(2.5));
        assert_eq!(val_to_json(&Val::F32(f32::NAN.to_bits())), Value::Null);
    }
}
