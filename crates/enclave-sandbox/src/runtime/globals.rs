//! Host imports visible to a plugin.
//!
//! The linker is the plugin's entire global scope.  Only imports defined here
//! can be resolved; anything else fails instantiation with an unknown-import
//! error, which is how an ungranted capability manifests.
//!
//! - **`env`** -- always present: `log`, `set_timeout`, `clear_timeout`,
//!   `process_info`.
//! - **`buffer`** -- `buffer:access`: base64 and hex transcoding.
//! - **`crypto`** -- `crypto:access`: SHA-256, HMAC-SHA256, random bytes.
//! - **Host-control namespaces** -- functions imported from
//!   [`HOST_CONTROL_MODULES`] resolve to stubs that trap on call.

use std::time::Instant;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ring::rand::SecureRandom;
use serde_json::Value;
use wasmtime::{Caller, Engine, Extern, ExternType, Linker, Memory, Module};

use crate::capability::{CapabilityPolicy, CapabilityToken};
use crate::protocol::{Envelope, LogLevel};

use super::host::{HostState, ProcessInfo, read_guest, write_guest};

/// Import namespaces that would let a plugin control the host process.
pub const HOST_CONTROL_MODULES: [&str; 5] = [
    "child_process",
    "cluster",
    "worker_threads",
    "process_control",
    "vm",
];

/// Import namespace of the always-present host functions.
pub const ENV_MODULE: &str = "env";

const ENV_IMPORTS: [&str; 4] = ["log", "set_timeout", "clear_timeout", "process_info"];
const BUFFER_IMPORTS: [&str; 4] = ["base64_encode", "base64_decode", "hex_encode", "hex_decode"];
const CRYPTO_IMPORTS: [&str; 3] = ["sha256", "hmac_sha256", "random_bytes"];

const SHA256_LEN: usize = 32;
const MAX_RANDOM_BYTES: i32 = 65_536;

/// Raised when a plugin calls into a host-control namespace.
#[derive(Debug, Clone, thiserror::Error)]
#[error("`{module}::{name}` is not allowed inside the plugin sandbox")]
pub(crate) struct HostControlDenied {
    pub module: String,
    pub name: String,
}

/// Build the linker for one plugin under `policy`.
pub(crate) fn build_linker(
    engine: &Engine,
    module: &Module,
    policy: &CapabilityPolicy,
) -> wasmtime::Result<Linker<HostState>> {
    let mut linker = Linker::new(engine);
    define_env(&mut linker)?;
    if policy.allows(CapabilityToken::BufferAccess) {
        define_buffer(&mut linker)?;
    }
    if policy.allows(CapabilityToken::CryptoAccess) {
        define_crypto(&mut linker)?;
    }
    define_host_control_stubs(&mut linker, module)?;
    Ok(linker)
}

/// Whether an import namespace is a host-control namespace.
pub fn is_host_control(module: &str) -> bool {
    HOST_CONTROL_MODULES.contains(&module)
}

/// Whether `module::name` is a host function some capability set provides.
pub fn is_provided(module: &str, name: &str) -> bool {
    match module {
        ENV_MODULE => ENV_IMPORTS.contains(&name),
        "buffer" => BUFFER_IMPORTS.contains(&name),
        "crypto" => CRYPTO_IMPORTS.contains(&name),
        _ => false,
    }
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> wasmtime::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow::anyhow!("plugin does not export its linear memory as `memory`"))
}

fn read(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> wasmtime::Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    read_guest(&memory, &*caller, ptr, len)
}

fn write(caller: &mut Caller<'_, HostState>, ptr: i32, bytes: &[u8]) -> wasmtime::Result<()> {
    let memory = guest_memory(caller)?;
    write_guest(&memory, &mut *caller, ptr, bytes)
}

/// Copy `bytes` to the guest's output buffer if it fits.  Returns the full
/// length either way so the guest can retry with a larger buffer.
fn write_bounded(
    caller: &mut Caller<'_, HostState>,
    out_ptr: i32,
    out_cap: i32,
    bytes: &[u8],
) -> wasmtime::Result<i32> {
    let len = i32::try_from(bytes.len())
        .map_err(|_| anyhow::anyhow!("host result of {} bytes is too large", bytes.len()))?;
    if len <= out_cap {
        write(caller, out_ptr, bytes)?;
    }
    Ok(len)
}

/// Interpret a logged buffer: a JSON array is the argument list, any other
/// JSON value is a single argument, and non-JSON text is one string.
pub(crate) fn log_args(raw: &[u8]) -> Vec<Value> {
    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Array(args)) => args,
        Ok(value) => vec![value],
        Err(_) => vec![Value::String(String::from_utf8_lossy(raw).into_owned())],
    }
}

// ---------------------------------------------------------------------------
// env
// ---------------------------------------------------------------------------

fn define_env(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        ENV_MODULE,
        "log",
        |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let raw = read(&mut caller, ptr, len)?;
            let state = caller.data();
            let args = state.sanitizer.sanitize_args(&log_args(&raw));
            state.send(Envelope::console(LogLevel::from_guest(level), args));
            Ok(())
        },
    )?;

    linker.func_wrap(
        ENV_MODULE,
        "set_timeout",
        |mut caller: Caller<'_, HostState>, delay_ms: i64, token: i32| -> wasmtime::Result<i32> {
            let id = caller
                .data_mut()
                .timers
                .schedule(delay_ms, token, Instant::now())?;
            Ok(id)
        },
    )?;

    linker.func_wrap(
        ENV_MODULE,
        "clear_timeout",
        |mut caller: Caller<'_, HostState>, id: i32| -> i32 {
            i32::from(caller.data_mut().timers.cancel(id))
        },
    )?;

    linker.func_wrap(
        ENV_MODULE,
        "process_info",
        |mut caller: Caller<'_, HostState>,
         key_ptr: i32,
         key_len: i32,
         out_ptr: i32,
         out_cap: i32|
         -> wasmtime::Result<i32> {
            let key = read(&mut caller, key_ptr, key_len)?;
            let info: &ProcessInfo = &caller.data().process_info;
            let Some(value) = std::str::from_utf8(&key)
                .ok()
                .and_then(|key| info.get(key))
                .map(str::to_owned)
            else {
                return Ok(-1);
            };
            write_bounded(&mut caller, out_ptr, out_cap, value.as_bytes())
        },
    )?;

    Ok(())
}

// ---------------------------------------------------------------------------
// buffer
// ---------------------------------------------------------------------------

type Transcode = fn(&[u8]) -> Option<Vec<u8>>;

fn define_buffer(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    let transcoders: [(&str, Transcode); 4] = [
        ("base64_encode", |src| Some(BASE64.encode(src).into_bytes())),
        ("base64_decode", |src| BASE64.decode(src).ok()),
        ("hex_encode", |src| Some(hex::encode(src).into_bytes())),
        ("hex_decode", |src| hex::decode(src).ok()),
    ];

    for (name, transcode) in transcoders {
        linker.func_wrap(
            "buffer",
            name,
            move |mut caller: Caller<'_, HostState>,
                  src_ptr: i32,
                  src_len: i32,
                  out_ptr: i32,
                  out_cap: i32|
                  -> wasmtime::Result<i32> {
                let src = read(&mut caller, src_ptr, src_len)?;
                match transcode(&src) {
                    Some(out) => write_bounded(&mut caller, out_ptr, out_cap, &out),
                    None => Ok(-1),
                }
            },
        )?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// crypto
// ---------------------------------------------------------------------------

fn define_crypto(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        "crypto",
        "sha256",
        |mut caller: Caller<'_, HostState>,
         src_ptr: i32,
         src_len: i32,
         out_ptr: i32|
         -> wasmtime::Result<i32> {
            let src = read(&mut caller, src_ptr, src_len)?;
            let digest = ring::digest::digest(&ring::digest::SHA256, &src);
            write(&mut caller, out_ptr, digest.as_ref())?;
            Ok(SHA256_LEN as i32)
        },
    )?;

    linker.func_wrap(
        "crypto",
        "hmac_sha256",
        |mut caller: Caller<'_, HostState>,
         key_ptr: i32,
         key_len: i32,
         msg_ptr: i32,
         msg_len: i32,
         out_ptr: i32|
         -> wasmtime::Result<i32> {
            let key = read(&mut caller, key_ptr, key_len)?;
            let msg = read(&mut caller, msg_ptr, msg_len)?;
            let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, &key);
            let tag = ring::hmac::sign(&key, &msg);
            write(&mut caller, out_ptr, tag.as_ref())?;
            Ok(SHA256_LEN as i32)
        },
    )?;

    linker.func_wrap(
        "crypto",
        "random_bytes",
        |mut caller: Caller<'_, HostState>, out_ptr: i32, len: i32| -> wasmtime::Result<i32> {
            if !(0..=MAX_RANDOM_BYTES).contains(&len) {
                return Ok(-1);
            }
            let mut buf = vec![0u8; len as usize];
            ring::rand::SystemRandom::new()
                .fill(&mut buf)
                .map_err(|_| anyhow::anyhow!("system random source unavailable"))?;
            write(&mut caller, out_ptr, &buf)?;
            Ok(len)
        },
    )?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Host-control stubs
// ---------------------------------------------------------------------------

fn define_host_control_stubs(
    linker: &mut Linker<HostState>,
    module: &Module,
) -> wasmtime::Result<()> {
    for import in module.imports() {
        if !is_host_control(import.module()) {
            continue;
        }
        // Non-function imports from these namespaces stay unresolved and
        // fail instantiation.
        let ExternType::Func(ty) = import.ty() else {
            continue;
        };
        let denied = HostControlDenied {
            module: import.module().to_owned(),
            name: import.name().to_owned(),
        };
        linker.func_new(import.module(), import.name(), ty, move |_caller, _params, _results| {
            tracing::warn!(module = %denied.module, name = %denied.name, "plugin attempted a host-control call");
            Err(denied.clone().into())
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn json_array_payload_is_the_argument_list() {
        assert_eq!(log_args(br#"["a", 1]"#), vec![json!("a"), json!(1)]);
    }

    #[test]
    fn json_scalar_payload_is_a_single_argument() {
        assert_eq!(log_args(br#"{"k": 1}"#), vec![json!({"k": 1})]);
    }

    #[test]
    fn plain_text_payload_is_a_string() {
        assert_eq!(log_args(b"hello world"), vec![json!("hello world")]);
    }

    #[test]
    fn host_control_namespaces() {
        assert!(is_host_control("child_process"));
        assert!(is_host_control("vm"));
        assert!(!is_host_control("env"));
        assert!(!is_host_control("crypto"));
    }

    #[test]
    fn provided_imports_are_cataloged() {
        assert!(is_provided("env", "log"));
        assert!(is_provided("crypto", "hmac_sha256"));
        assert!(is_provided("buffer", "hex_decode"));
        assert!(!is_provided("env", "exec"));
        assert!(!is_provided("fs", "read"));
    }

    #[test]
    fn denial_message_names_the_import() {
        let err = HostControlDenied {
            module: "child_process".into(),
            name: "spawn".into(),
        };
        assert_eq!(
            err.to_string(),
            "`child_process::spawn` is not allowed inside the plugin sandbox"
        );
    }
}
