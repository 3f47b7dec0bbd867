//! The `pchain run` command.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, bail};
use serde_json::Value;

use promptchain_core::pipeline::load_pipeline;
use promptchain_core::{RunOptions, Runner};
use promptchain_infra::ProviderFactory;

use super::RunArgs;

pub async fn execute(args: RunArgs) -> anyhow::Result<()> {
    let params = parse_params(&args.params)?;
    let pipeline = load_pipeline(&args.pipeline)
        .with_context(|| format!("failed to load pipeline {}", args.pipeline.display()))?;

    let runner = Runner::new(args.runs_root.clone(), Arc::new(ProviderFactory::new()));
    let options = RunOptions {
        run_dir: args.run_dir.clone(),
        stage: args.stage.clone(),
        from_stage: args.from_stage.clone(),
        stop_after: args.stop_after.clone(),
        max_in_flight: args.max_in_flight,
    };

    let outcome = runner.run(&pipeline, params, options).await?;
    println!(
        "  {} Run {} finished with status: {}",
        console::style("✓").green(),
        console::style(&outcome.run_id).cyan(),
        outcome.status
    );
    Ok(())
}

/// Parse trailing `--name value` / `--name=value` pairs into user
/// parameters. Values are bound as JSON strings.
fn parse_params(raw: &[String]) -> anyhow::Result<BTreeMap<String, Value>> {
    let mut params = BTreeMap::new();
    let mut idx = 0;
    while idx < raw.len() {
        let token = &raw[idx];
        let key = match token.strip_prefix("--") {
            Some(key) if !key.is_empty() => key,
            _ => bail!("unexpected argument: {token}"),
        };
        if let Some((name, value)) = key.split_once('=') {
            if name.is_empty() {
                bail!("parameter name cannot be empty: {token}");
            }
            params.insert(name.to_string(), Value::String(value.to_string()));
            idx += 1;
            continue;
        }
        let value = raw
            .get(idx + 1)
            .ok_or_else(|| anyhow::anyhow!("missing value for parameter: {key}"))?;
        params.insert(key.to_string(), Value::String(value.clone()));
        idx += 2;
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_space_separated_pairs() {
        let params = parse_params(&strings(&["--topic", "chess", "--count", "5"])).unwrap();
        assert_eq!(params["topic"], Value::String("chess".into()));
        assert_eq!(params["count"], Value::String("5".into()));
    }

    #[test]
    fn parses_equals_pairs() {
        let params = parse_params(&strings(&["--topic=chess"])).unwrap();
        assert_eq!(params["topic"], Value::String("chess".into()));
    }

    #[test]
    fn rejects_bare_values() {
        assert!(parse_params(&strings(&["chess"])).is_err());
    }

    #[test]
    fn rejects_missing_value() {
        let err = parse_params(&strings(&["--topic"])).unwrap_err();
        assert!(err.to_string().contains("missing value"));
    }

    #[test]
    fn rejects_empty_name() {
        assert!(parse_params(&strings(&["--=x"])).is_err());
    }
}
