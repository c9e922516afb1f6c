//! CLI entry point for Enclave.
//!
//! This binary provides the `enclave` command with subcommands for calling
//! a plugin method inside the sandbox and inspecting a plugin's imports.

mod cli;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use enclave_sandbox::{
    IsolationMode, LogLevel, PluginReport, SandboxConfig, Supervisor, describe_plugin,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Call {
            plugin,
            method,
            args,
            caps,
            timeout_ms,
            config,
            process,
            plugin_id,
        } => {
            cmd_call(CallOptions {
                plugin: &plugin,
                method: &method,
                args: &args,
                caps: &caps,
                timeout_ms,
                config: config.as_deref(),
                process,
                plugin_id,
            })
            .await
        }
        Commands::Inspect { plugin, json } => cmd_inspect(&plugin, json),
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Subcommand: call
// ---------------------------------------------------------------------------

struct CallOptions<'a> {
    plugin: &'a Path,
    method: &'a str,
    args: &'a [String],
    caps: &'a [String],
    timeout_ms: Option<u64>,
    config: Option<&'a Path>,
    process: bool,
    plugin_id: Option<String>,
}

/// Parse one command-line argument as JSON, falling back to a string.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

fn default_plugin_id(plugin: &Path) -> String {
    plugin
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "plugin".to_owned())
}

async fn cmd_call(opts: CallOptions<'_>) -> Result<()> {
    init_tracing("warn");

    let mut config = match opts.config {
        Some(path) => SandboxConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SandboxConfig::default(),
    };
    if opts.process {
        config = config.with_isolation(IsolationMode::Process);
    }
    let timeout = Duration::from_millis(opts.timeout_ms.unwrap_or(config.call_timeout_ms));

    let supervisor = Supervisor::new(config).context("invalid sandbox configuration")?;
    let plugin_id = opts
        .plugin_id
        .unwrap_or_else(|| default_plugin_id(opts.plugin));
    let session = supervisor
        .create(&plugin_id, opts.plugin, opts.caps)
        .await
        .with_context(|| format!("failed to start plugin {}", opts.plugin.display()))?;

    session.on_log(|level: LogLevel, args: &[Value]| {
        let line = args
            .iter()
            .map(|arg| match arg {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ");
        eprintln!("[{level:?}] {line}");
    })?;

    let args: Vec<Value> = opts.args.iter().map(|raw| parse_arg(raw)).collect();
    let outcome = session.call_with_timeout(opts.method, args, timeout).await;
    supervisor.shutdown(&session).await?;

    let result = outcome.with_context(|| format!("call to `{}` failed", opts.method))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: inspect
// ---------------------------------------------------------------------------

fn cmd_inspect(plugin: &Path, json: bool) -> Result<()> {
    init_tracing("warn");

    let report = describe_plugin(plugin)
        .with_context(|| format!("failed to inspect {}", plugin.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(plugin, &report);
    }
    Ok(())
}

fn print_report(plugin: &Path, report: &PluginReport) {
    println!();
    println!("  Plugin: {}", plugin.display());
    println!();

    println!("  Methods:");
    if report.methods.is_empty() {
        println!("    (none)");
    }
    for method in &report.methods {
        println!("    {method}");
    }
    println!();

    println!("  Imports:");
    if report.imports.is_empty() {
        println!("    (none)");
    }
    for import in &report.imports {
        let note = if import.host_control {
            "denied (traps when called)".to_owned()
        } else if import.unresolvable {
            "unresolvable".to_owned()
        } else if let Some(token) = import.capability {
            format!("requires {token}")
        } else {
            "always available".to_owned()
        };
        println!("    {}::{:<20} {note}", import.module, import.name);
    }
    println!();

    let required = report.required_capabilities().to_strings();
    if required.is_empty() {
        println!("  Required capabilities: none");
    } else {
        println!("  Required capabilities: {}", required.join(", "));
    }
    println!(
        "  Lifecycle: constructor={} cleanup={} on_timer={}",
        report.has_constructor, report.has_cleanup, report.has_timer_handler
    );
    println!();
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn arguments_parse_as_json_or_string() {
        assert_eq!(parse_arg("2"), json!(2));
        assert_eq!(parse_arg("[1,2]"), json!([1, 2]));
        assert_eq!(parse_arg(r#"{"a":true}"#), json!({"a": true}));
        assert_eq!(parse_arg("hello"), json!("hello"));
    }

    #[test]
    fn plugin_id_defaults_to_file_stem() {
        assert_eq!(default_plugin_id(Path::new("/tmp/hasher.wasm")), "hasher");
        assert_eq!(default_plugin_id(Path::new("")), "plugin");
    }

    #[test]
    fn cli_parses_call_flags() {
        let cli = Cli::try_parse_from([
            "enclave", "call", "p.wat", "add", "2", "3", "--cap", "crypto:access", "--timeout-ms",
            "500", "--process",
        ])
        .unwrap();
        match cli.command {
            Commands::Call {
                method,
                args,
                caps,
                timeout_ms,
                process,
                ..
            } => {
                assert_eq!(method, "add");
                assert_eq!(args, vec!["2", "3"]);
                assert_eq!(caps, vec!["crypto:access"]);
                assert_eq!(timeout_ms, Some(500));
                assert!(process);
            }
            Commands::Inspect { .. } => panic!("expected call"),
        }
    }
}
