//! Runner selection by step directory contents

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use super::runner::{ExecContext, Runner, StepOutput, StepTestOutput};
use super::terraform::TerraformRunner;

/// Select the runner for a step directory. Layouts with terraform root
/// files get the terraform backend; unknown layouts get a runner whose
/// execution immediately fails, so the problem surfaces at deploy time
/// instead of silently dropping the step from the plan.
pub fn determine_runner(step_dir: &Path) -> Arc<dyn Runner> {
    if has_terraform_files(step_dir) {
        return Arc::new(TerraformRunner);
    }

    warn!(
        dir = %step_dir.display(),
        "no supported IaC files found in step directory"
    );
    Arc::new(UnsupportedRunner)
}

fn has_terraform_files(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries.flatten().any(|e| {
                let path = e.path();
                path.is_file() && path.extension().and_then(|ext| ext.to_str()) == Some("tf")
            })
        })
        .unwrap_or(false)
}

/// Fallback runner for step directories with no recognized layout
struct UnsupportedRunner;

impl UnsupportedRunner {
    fn failure(ctx: &ExecContext) -> String {
        format!(
            "no supported IaC files found in {}",
            ctx.step_dir.display()
        )
    }
}

#[async_trait]
impl Runner for UnsupportedRunner {
    async fn pre_execute(&self, ctx: ExecContext) -> Result<ExecContext> {
        Ok(ctx)
    }

    async fn execute(&self, ctx: ExecContext) -> StepOutput {
        let error = Self::failure(&ctx);
        StepOutput::fail(&ctx.step_name, &ctx.region, ctx.region_deploy_type, error)
    }

    async fn execute_destroy(&self, ctx: ExecContext) -> StepOutput {
        let error = Self::failure(&ctx);
        StepOutput::fail(&ctx.step_name, &ctx.region, ctx.region_deploy_type, error)
    }

    async fn execute_tests(&self, ctx: ExecContext) -> StepTestOutput {
        StepTestOutput {
            error: Some(Self::failure(&ctx)),
            step_name: ctx.step_name,
            stream_output: String::new(),
        }
    }
}
