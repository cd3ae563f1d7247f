//! Terraform CLI step backend
//!
//! Drives the `terraform` binary inside a step directory: prior step
//! outputs are injected through a generated `*.auto.tfvars.json` file, and
//! published outputs are read back with `terraform output -json` and
//! coerced to opaque strings for the engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};

use super::runner::{ExecContext, Runner, StepOutput, StepTestOutput};
use crate::config::RegionDeployType;

/// File name of the generated variable-injection file
const INPUT_VARS_FILE: &str = "runner-inputs.auto.tfvars.json";

/// Relative path of a step's test executable
const TESTS_FILE: &str = "tests/tests.test";

/// Runner for steps laid out as terraform root modules
pub struct TerraformRunner;

impl TerraformRunner {
    /// Regional executions run against the step's `regional/` sub-module.
    fn working_dir(ctx: &ExecContext) -> PathBuf {
        match ctx.region_deploy_type {
            RegionDeployType::Primary => ctx.step_dir.clone(),
            RegionDeployType::Regional => ctx.step_dir.join("regional"),
        }
    }

    /// Flatten prior step outputs into terraform input variables. Step key
    /// and variable name are joined with `_`, and `-` is normalized to `_`
    /// to form valid terraform identifiers.
    fn input_variables(ctx: &ExecContext) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("region".to_string(), ctx.region.clone());
        for (step_key, step_vars) in &ctx.output_variables {
            for (name, value) in step_vars {
                let key = format!("{}_{}", step_key, name).replace('-', "_");
                vars.insert(key, value.clone());
            }
        }
        vars
    }

    async fn run_terraform(dir: &Path, args: &[&str]) -> Result<String> {
        debug!(dir = %dir.display(), ?args, "running terraform");
        let output = Command::new("terraform")
            .args(args)
            .arg("-no-color")
            .current_dir(dir)
            .output()
            .await
            .with_context(|| {
                format!("failed to spawn terraform {:?} in {}", args, dir.display())
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "terraform {:?} exited with {}: {}",
                args,
                output.status,
                stderr.trim()
            );
        }
        Ok(stdout)
    }

    async fn read_output_variables(dir: &Path) -> Result<HashMap<String, String>> {
        let raw = Self::run_terraform(dir, &["output", "-json"]).await?;
        let parsed: Value =
            serde_json::from_str(&raw).context("failed to parse terraform output json")?;

        let mut vars = HashMap::new();
        if let Value::Object(entries) = parsed {
            for (name, entry) in entries {
                // `terraform output -json` wraps each value in {value, type, sensitive}
                let value = entry.get("value").unwrap_or(&Value::Null);
                vars.insert(name, output_to_string(value));
            }
        }
        Ok(vars)
    }

    async fn apply(ctx: &ExecContext) -> Result<(String, HashMap<String, String>)> {
        let dir = Self::working_dir(ctx);
        if ctx.dry_run {
            let stream = Self::run_terraform(&dir, &["plan", "-input=false"]).await?;
            return Ok((stream, HashMap::new()));
        }

        let stream = Self::run_terraform(&dir, &["apply", "-input=false", "-auto-approve"]).await?;
        let vars = Self::read_output_variables(&dir).await?;
        Ok((stream, vars))
    }

    async fn destroy(ctx: &ExecContext) -> Result<String> {
        let dir = Self::working_dir(ctx);
        if ctx.dry_run {
            return Self::run_terraform(&dir, &["plan", "-destroy", "-input=false"]).await;
        }
        Self::run_terraform(&dir, &["destroy", "-input=false", "-auto-approve"]).await
    }
}

/// Coerce a terraform output value to the engine's opaque string form:
/// strings verbatim, everything else as compact JSON.
fn output_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Runner for TerraformRunner {
    async fn pre_execute(&self, ctx: ExecContext) -> Result<ExecContext> {
        let dir = Self::working_dir(&ctx);
        let vars = Self::input_variables(&ctx);
        let json = serde_json::to_string_pretty(&vars)
            .context("failed to serialize terraform input variables")?;

        tokio::fs::write(dir.join(INPUT_VARS_FILE), json)
            .await
            .with_context(|| format!("failed to write {} in {}", INPUT_VARS_FILE, dir.display()))?;

        Self::run_terraform(&dir, &["init", "-input=false"]).await?;
        Ok(ctx)
    }

    async fn execute(&self, ctx: ExecContext) -> StepOutput {
        info!(step = %ctx.step_name, region = %ctx.region, "applying step");
        match Self::apply(&ctx).await {
            Ok((stream, vars)) => StepOutput::success(
                &ctx.step_name,
                &ctx.region,
                ctx.region_deploy_type,
                stream,
                vars,
            ),
            Err(e) => StepOutput::fail(
                &ctx.step_name,
                &ctx.region,
                ctx.region_deploy_type,
                format!("{e:#}"),
            ),
        }
    }

    async fn execute_destroy(&self, ctx: ExecContext) -> StepOutput {
        info!(step = %ctx.step_name, region = %ctx.region, "destroying step");
        match Self::destroy(&ctx).await {
            Ok(stream) => StepOutput::success(
                &ctx.step_name,
                &ctx.region,
                ctx.region_deploy_type,
                stream,
                HashMap::new(),
            ),
            Err(e) => StepOutput::fail(
                &ctx.step_name,
                &ctx.region,
                ctx.region_deploy_type,
                format!("{e:#}"),
            ),
        }
    }

    async fn execute_tests(&self, ctx: ExecContext) -> StepTestOutput {
        let dir = Self::working_dir(&ctx);
        let tests_path = dir.join(TESTS_FILE);
        info!(step = %ctx.step_name, tests = %tests_path.display(), "running step tests");

        let mut cmd = Command::new(&tests_path);
        cmd.current_dir(&dir);
        for (key, value) in Self::input_variables(&ctx) {
            cmd.env(key.to_uppercase(), value);
        }

        match cmd.output().await {
            Ok(out) => {
                let mut stream = String::from_utf8_lossy(&out.stdout).into_owned();
                stream.push_str(&String::from_utf8_lossy(&out.stderr));
                let error = if out.status.success() {
                    None
                } else {
                    Some(format!("step tests exited with {}", out.status))
                };
                StepTestOutput {
                    step_name: ctx.step_name,
                    stream_output: stream,
                    error,
                }
            }
            Err(e) => StepTestOutput {
                step_name: ctx.step_name,
                stream_output: String::new(),
                error: Some(format!("failed to run {}: {}", tests_path.display(), e)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::steps::runner::VariableMap;

    fn context(deploy_type: RegionDeployType) -> ExecContext {
        let mut output_variables = VariableMap::new();
        output_variables.insert(
            "network-regional".to_string(),
            HashMap::from([("vpc_id".to_string(), "vpc-123".to_string())]),
        );
        ExecContext {
            project: "proj".to_string(),
            track_name: "core".to_string(),
            step_name: "network".to_string(),
            step_dir: PathBuf::from("/tmp/steps/step1_network"),
            progression_level: 1,
            region: "us-east-1".to_string(),
            region_deploy_type: deploy_type,
            dry_run: false,
            output_variables,
        }
    }

    #[test]
    fn test_output_to_string_passes_strings_verbatim() {
        assert_eq!(output_to_string(&json!("plain")), "plain");
    }

    #[test]
    fn test_output_to_string_encodes_other_values_as_json() {
        assert_eq!(output_to_string(&json!(42)), "42");
        assert_eq!(output_to_string(&json!(true)), "true");
        assert_eq!(output_to_string(&json!(["a", "b"])), r#"["a","b"]"#);
    }

    #[test]
    fn test_input_variables_flatten_with_identifier_normalization() {
        let vars = TerraformRunner::input_variables(&context(RegionDeployType::Primary));
        assert_eq!(vars.get("region"), Some(&"us-east-1".to_string()));
        assert_eq!(
            vars.get("network_regional_vpc_id"),
            Some(&"vpc-123".to_string())
        );
    }

    #[test]
    fn test_working_dir_selects_regional_submodule() {
        let primary = TerraformRunner::working_dir(&context(RegionDeployType::Primary));
        let regional = TerraformRunner::working_dir(&context(RegionDeployType::Regional));
        assert_eq!(primary, PathBuf::from("/tmp/steps/step1_network"));
        assert_eq!(regional, PathBuf::from("/tmp/steps/step1_network/regional"));
    }
}
