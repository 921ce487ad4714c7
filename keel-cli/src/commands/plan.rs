use crate::output;

use std::path::PathBuf;

use build_service::{Plan, PublicPlan};
use clap::Args;
use color_eyre::Result;

/// Validate a plan file
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Path to the plan YAML file
    pub plan: PathBuf,
}

pub fn execute(args: PlanArgs) -> Result<()> {
    output::status("Validating", &format!("{}", args.plan.display()));

    let plan = match Plan::from_file(&args.plan).and_then(|plan| plan.validate().map(|()| plan)) {
        Ok(plan) => plan,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    };

    let puts = plan.puts();
    output::success(&format!("Plan is valid ({} put steps)", puts.len()));
    for put in puts {
        output::dim(&format!("    {} ({})", put.name, put.resource_type));
    }

    let public = PublicPlan {
        schema: "exec".to_string(),
        plan: plan.public(),
    };
    println!("{}", serde_json::to_string_pretty(&public)?);

    Ok(())
}
