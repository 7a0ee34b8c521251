use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::modules::Module;
use crate::planner::{Plan, Stage, Task};

const KNOWN_TABLES: &[&str] = &["workspace", "upstream", "board", "overlay", "package", "setup"];

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn stage(&self) -> Option<Stage> {
        None
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        let Some(root) = doc.value.as_table() else {
            return Err(Error::msg("build definition must be a TOML table"));
        };
        for (key, value) in root {
            if !value.is_table() || !KNOWN_TABLES.contains(&key.as_str()) {
                return Err(Error::msg(format!(
                    "unsupported top-level key '{key}' in {}; expected tables: {}",
                    doc.path.display(),
                    KNOWN_TABLES.join(", ")
                )));
            }
        }

        plan.add(Task {
            id: "core.init".into(),
            label: "Init workspace".into(),
            module: self.id().into(),
            phase: "init".into(),
            after: vec![],
            provides: vec!["core:initialized".into()],
        })
    }
}
