pub mod config;
pub mod error;
pub mod executor;
pub mod modules;
pub mod planner;
pub mod workspace;

use std::sync::Arc;

pub use error::{Error, Result};

/// Plan and execute one stage of the build definition.
pub fn run_stage(
    doc: &config::ConfigDoc,
    select: planner::StageSelect,
    dry_run: bool,
    sink: Arc<dyn executor::ExecSink>,
) -> Result<()> {
    let plan = planner::build_plan(doc, select)?;
    let reg = executor::builtin_registry()?;
    let mut ctx = executor::ExecCtx::new(dry_run, sink);
    executor::execute_plan(doc, &plan, &reg, &mut ctx)
}
