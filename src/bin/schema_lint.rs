//! Operator schema lint
//!
//! # Usage
//!
//! ```bash
//! # Load a declaration file and report what was found
//! schema-lint check native_functions.yaml --tag pointwise --tag inplace_view
//!
//! # Inspect a single schema
//! schema-lint parse "add_.Tensor(Tensor(a!) self, Tensor other, *, Scalar alpha=1) -> Tensor(a!)"
//! ```
//!
//! Set `RUST_LOG=opschema=debug` to trace each record as it is loaded.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

use opschema::{DispatchKey, FunctionSchema, NativeFunctionsRegistry};

#[derive(Parser)]
#[command(name = "schema-lint")]
#[command(version)]
#[command(about = "Validate operator schema declarations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "text", value_enum)]
    format: OutputFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a declaration file and validate every record and family
    Check {
        file: PathBuf,

        /// Tag allowed in the `tags` field (repeatable)
        #[arg(long = "tag", env = "OPSCHEMA_TAGS", value_delimiter = ',')]
        tags: Vec<String>,

        /// Dispatch key whose kernels are dropped (repeatable)
        #[arg(long = "ignore-key")]
        ignore_keys: Vec<String>,
    },

    /// Parse one schema and print its kind and signature
    Parse { schema: String },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Check {
            file,
            tags,
            ignore_keys,
        } => cmd_check(file, tags, ignore_keys, cli.format),
        Commands::Parse { schema } => cmd_parse(&schema, cli.format),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.format == OutputFormat::Json {
                println!("{}", json!({ "error": format!("{e:#}") }));
            } else {
                eprintln!("error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

fn cmd_check(
    file: PathBuf,
    tags: Vec<String>,
    ignore_keys: Vec<String>,
    format: OutputFormat,
) -> Result<()> {
    let valid_tags: HashSet<String> = tags.into_iter().collect();
    let ignore = ignore_keys
        .iter()
        .map(|k| DispatchKey::parse(k).ok_or_else(|| anyhow!("unknown dispatch key {k}")))
        .collect::<Result<HashSet<_>>>()?;

    let registry = if ignore.is_empty() {
        NativeFunctionsRegistry::load_file(&file, &valid_tags)?
    } else {
        let source = std::fs::read_to_string(&file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        NativeFunctionsRegistry::from_yaml_str_with(
            &source,
            &file.display().to_string(),
            &valid_tags,
            Some(&ignore),
        )?
    };

    let summary = registry.summary();
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Text => print!("{summary}"),
    }
    Ok(())
}

fn cmd_parse(schema: &str, format: OutputFormat) -> Result<()> {
    let func = FunctionSchema::parse(schema)?;
    let kind = func.kind();
    let signature = func.signature();
    match format {
        OutputFormat::Json => {
            let out = json!({
                "schema": func,
                "name": func.name,
                "kind": kind.as_str(),
                "signature": signature,
                "kernel": func.kernel_name(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => {
            println!("kind:      {kind}");
            println!("signature: {signature}");
            println!("kernel:    {}", func.kernel_name());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_names_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        for ignore in [vec![], vec!["CUDA".to_string()]] {
            let err = cmd_check(missing.clone(), vec![], ignore, OutputFormat::Text).unwrap_err();
            let message = format!("{err:#}");
            assert!(message.contains("Failed to read"), "{message}");
            assert!(message.contains("missing.yaml"), "{message}");
        }
    }
}
