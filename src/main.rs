use clap::{Parser, Subcommand};
use iac_track_runner::runner::{run_deploy, DeployArgs, RegionDeployType, Stage};
use std::path::PathBuf;

#[derive(Parser, Clone)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Subcommand)]
enum Command {
    Deploy {
        /// Root of the deployment repository
        #[arg(short, long, default_value = ".")]
        root: PathBuf,

        /// Project name, used in stable step identifiers
        #[arg(short, long)]
        project: String,

        /// Region for primary executions
        #[arg(long)]
        primary_region: String,

        /// Regions for regional executions (comma separated)
        #[arg(long, value_delimiter = ',')]
        regional_regions: Vec<String>,

        /// Step identifiers to target, e.g. "#project#track#step" (comma separated)
        #[arg(short, long, value_delimiter = ',')]
        steps: Vec<String>,

        /// Target every discovered step, bypassing the step whitelist
        #[arg(long)]
        target_all: bool,

        /// Destroy all deployed resources after the deploy pass (e.g. during PRs)
        #[arg(long)]
        self_destroy: bool,

        /// Plan only - disables step tests and the destroy pass
        #[arg(long)]
        dry_run: bool,

        /// Quiet mode - minimal output, only show summary
        #[arg(short, long)]
        quiet: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Deploy {
            root,
            project,
            primary_region,
            regional_regions,
            steps,
            target_all,
            self_destroy,
            dry_run,
            quiet,
        } => {
            run_runner(
                root,
                project,
                primary_region,
                regional_regions,
                steps,
                target_all,
                self_destroy,
                dry_run,
                quiet,
            )
            .await?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_runner(
    root: PathBuf,
    project: String,
    primary_region: String,
    regional_regions: Vec<String>,
    steps: Vec<String>,
    target_all: bool,
    self_destroy: bool,
    dry_run: bool,
    quiet: bool,
) -> anyhow::Result<()> {
    // Initialize tracing based on quiet mode
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let filter = if quiet {
        EnvFilter::new("iac_track_runner=warn")
    } else {
        EnvFilter::new("iac_track_runner=info")
    };
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    if !quiet {
        println!("IaC Track Runner");
        println!("================");
        println!("Project: {}", project);
        println!("Primary region: {}", primary_region);
        if !regional_regions.is_empty() {
            println!("Regional regions: {}", regional_regions.join(", "));
        }
        if dry_run {
            println!("Mode: dry run (no changes, no tests, no destroy)");
        }
        println!();
    }

    let stage = run_deploy(DeployArgs {
        root,
        project,
        primary_region,
        regional_regions,
        steps,
        target_all,
        self_destroy,
        dry_run,
    })
    .await?;

    print_summary(&stage);

    if stage.has_failures() {
        anyhow::bail!("deployment completed with failures");
    }
    Ok(())
}

fn print_summary(stage: &Stage) {
    println!();
    println!("Stage Summary");
    println!("=============");

    let mut names: Vec<_> = stage.tracks.keys().collect();
    names.sort();

    for name in names {
        let state = &stage.tracks[name];
        if state.skipped {
            println!("Track {}: skipped (pre-track failed)", name);
            continue;
        }

        println!("Track {}:", name);
        for (label, output) in [("deploy", &state.output), ("destroy", &state.destroy_output)] {
            let Some(output) = output else { continue };
            for execution in &output.executions {
                let scope = match execution.region_deploy_type {
                    RegionDeployType::Primary => format!("primary/{}", execution.region),
                    RegionDeployType::Regional => format!("regional/{}", execution.region),
                };
                println!(
                    "  {} {}: {} executed, {} skipped, {} not applicable, {} failed, {} failed tests",
                    label,
                    scope,
                    execution.output.executed_count,
                    execution.output.skipped_count,
                    execution.output.not_applicable_count,
                    execution.output.failure_count,
                    execution.output.failed_test_count,
                );
                for failed in &execution.output.failed_steps {
                    if let Some(error) = &failed.output.error {
                        println!("    {} failed: {}", failed.step.name, error);
                    } else {
                        println!("    {} failed", failed.step.name);
                    }
                }
            }
        }
    }
}
