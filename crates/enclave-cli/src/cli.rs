//! CLI argument definitions for Enclave.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Enclave -- run untrusted WebAssembly plugins in a capability sandbox.
#[derive(Parser)]
#[command(
    name = "enclave",
    version,
    about = "Enclave -- capability-gated WebAssembly plugin sandbox",
    long_about = "Loads a plugin into an isolated worker, grants only the capabilities \
                  named on the command line, and calls its methods with JSON arguments."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a session, call one method, print the JSON result, shut down.
    Call {
        /// Path of the plugin module (`.wasm` or `.wat`).
        plugin: PathBuf,

        /// Method to invoke.
        method: String,

        /// Call arguments, each a JSON value.  Text that is not valid JSON is
        /// passed as a string.
        args: Vec<String>,

        /// Capability to grant (repeatable), e.g. `crypto:access`.
        #[arg(long = "cap", value_name = "TOKEN")]
        caps: Vec<String>,

        /// Call timeout in milliseconds (defaults to the configured value).
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Sandbox configuration file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Run the plugin in a separate worker process.
        #[arg(long)]
        process: bool,

        /// Plugin id reported to the plugin (defaults to the file stem).
        #[arg(long)]
        plugin_id: Option<String>,
    },

    /// List a plugin's callable methods and the imports it requires.
    Inspect {
        /// Path of the plugin module (`.wasm` or `.wat`).
        plugin: PathBuf,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}
