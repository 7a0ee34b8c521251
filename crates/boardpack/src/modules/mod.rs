use crate::config::ConfigDoc;
use crate::error::Result;
use crate::planner::{Plan, Stage};

pub mod core;
pub mod package;
pub mod setup;
pub mod util;

pub trait Module {
    fn id(&self) -> &'static str;
    /// `None` for modules that take part in every stage.
    fn stage(&self) -> Option<Stage>;
    fn detect(&self, doc: &ConfigDoc) -> bool;
    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()>;
}

pub fn builtin_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(core::CoreModule),
        Box::new(setup::SetupModule),
        Box::new(package::PackageModule),
    ]
}
