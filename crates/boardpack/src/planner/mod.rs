use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};

pub type TaskId = String;

/// Which operator invocation a module belongs to. Core tasks run in both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Package,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Setup => "setup",
            Stage::Package => "package",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage filter used when building a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageSelect {
    Only(Stage),
    #[default]
    All,
}

impl StageSelect {
    pub fn includes(self, stage: Option<Stage>) -> bool {
        match (self, stage) {
            (_, None) | (StageSelect::All, _) => true,
            (StageSelect::Only(want), Some(have)) => want == have,
        }
    }
}

impl FromStr for StageSelect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "setup" => Ok(StageSelect::Only(Stage::Setup)),
            "build" | "package" => Ok(StageSelect::Only(Stage::Package)),
            "all" => Ok(StageSelect::All),
            other => Err(Error::msg(format!(
                "unknown stage '{other}' (expected setup, build or all)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: String,
    pub after: Vec<TaskId>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, task) in &self.tasks {
            for p in &task.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::msg(format!(
                        "provide token '{p}' is produced by both '{existing}' and '{id}'"
                    )));
                }
            }
        }
        Ok(out)
    }

    // A trailing '?' marks a dependency that may be absent from this plan
    // (e.g. package tasks ordering after setup tokens in a build-only run).
    fn resolve_dep<'a>(
        &'a self,
        provides: &BTreeMap<&'a str, &'a str>,
        dep: &'a str,
    ) -> Result<Option<&'a str>> {
        let (dep, optional) = match dep.strip_suffix('?') {
            Some(d) => (d, true),
            None => (dep, false),
        };
        if let Some((id, _)) = self.tasks.get_key_value(dep) {
            return Ok(Some(id.as_str()));
        }
        if let Some(&provider) = provides.get(dep) {
            return Ok(Some(provider));
        }
        if optional {
            Ok(None)
        } else {
            Err(Error::msg(format!("unknown dependency '{dep}'")))
        }
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn edges(&self) -> Result<Vec<(&str, &str)>> {
        let provides = self.provides_index()?;
        let mut out = Vec::new();
        for (id, task) in &self.tasks {
            for dep in &task.after {
                let dep_id = self.resolve_dep(&provides, dep).map_err(|e| {
                    Error::msg(format!("task '{id}' has invalid dependency '{dep}': {e}"))
                })?;
                if let Some(dep_id) = dep_id {
                    out.push((dep_id, id.as_str()));
                }
            }
        }
        Ok(out)
    }

    /// Topological order; ties are broken by task id so the order is stable.
    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let mut incoming: BTreeMap<&str, usize> =
            self.tasks.keys().map(|k| (k.as_str(), 0)).collect();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (from, to) in self.edges()? {
            if outgoing.entry(from).or_default().insert(to)
                && let Some(slot) = incoming.get_mut(to)
            {
                *slot += 1;
            }
        }

        let mut q: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&Task> = Vec::with_capacity(self.tasks.len());

        while let Some(n) = q.pop_front() {
            if let Some(task) = self.tasks.get(n) {
                out.push(task);
            }
            for &m in outgoing.get(n).into_iter().flatten() {
                if let Some(slot) = incoming.get_mut(m) {
                    *slot -= 1;
                    if *slot == 0 {
                        q.push_back(m);
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::msg(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }
        Ok(out)
    }

    pub fn to_dot(&self) -> Result<String> {
        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.module, task.phase
            ));
        }
        for (from, to) in self.edges()? {
            out.push_str(&format!("  \"{from}\" -> \"{to}\";\n"));
        }
        out.push_str("}\n");
        Ok(out)
    }
}

/// Plan every detected module that belongs to `select`.
pub fn build_plan(doc: &ConfigDoc, select: StageSelect) -> Result<Plan> {
    let mut plan = Plan::default();
    for m in crate::modules::builtin_modules() {
        if select.includes(m.stage()) && m.detect(doc) {
            m.plan(doc, &mut plan)?;
        }
    }
    if let StageSelect::Only(stage) = select
        && !plan.tasks().any(|t| t.module == stage.as_str())
    {
        return Err(Error::msg(format!(
            "build definition {} has nothing to do for the {stage} stage",
            doc.path.display()
        )));
    }
    Ok(plan)
}
