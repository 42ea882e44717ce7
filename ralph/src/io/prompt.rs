//! Agent prompt rendering for both invocation modes.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::backlog::{Backlog, Item};
use crate::core::types::InvocationMode;

const FULL_BACKLOG_TEMPLATE: &str = include_str!("prompts/full_backlog.md");
const PER_ITEM_TEMPLATE: &str = include_str!("prompts/per_item.md");

/// Item fields as the templates see them.
#[derive(Debug, Clone, Serialize)]
struct ItemContext<'a> {
    id: &'a str,
    title: &'a str,
    description: &'a str,
    criteria: &'a [String],
    passes: bool,
}

impl<'a> ItemContext<'a> {
    fn from_item(item: &'a Item) -> Self {
        Self {
            id: &item.id,
            title: &item.title,
            description: item.description.trim(),
            criteria: &item.acceptance_criteria,
            passes: item.passes,
        }
    }
}

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_keep_trailing_newline(true);
        env.add_template("full_backlog", FULL_BACKLOG_TEMPLATE)
            .context("load full_backlog template")?;
        env.add_template("per_item", PER_ITEM_TEMPLATE)
            .context("load per_item template")?;
        Ok(Self { env })
    }

    fn render_full_backlog(&self, workdir: &Path, backlog: &Backlog) -> Result<String> {
        let items: Vec<ItemContext<'_>> = backlog.items.iter().map(ItemContext::from_item).collect();
        let template = self.env.get_template("full_backlog")?;
        Ok(template.render(context! {
            workdir => workdir.display().to_string(),
            name => backlog.name.as_str(),
            description => backlog.description.trim(),
            items => items,
        })?)
    }

    fn render_per_item(&self, workdir: &Path, backlog: &Backlog, item: &Item) -> Result<String> {
        let template = self.env.get_template("per_item")?;
        Ok(template.render(context! {
            workdir => workdir.display().to_string(),
            name => backlog.name.as_str(),
            description => backlog.description.trim(),
            progress => backlog.progress_label(),
            item => ItemContext::from_item(item),
        })?)
    }
}

/// Render the agent prompt for one iteration.
///
/// `PerItem` targets the first incomplete item and fails if there is none;
/// `FullBacklog` lists every item and leaves the choice to the agent.
pub fn render_prompt(mode: InvocationMode, workdir: &Path, backlog: &Backlog) -> Result<String> {
    let engine = PromptEngine::new()?;
    match mode {
        InvocationMode::FullBacklog => engine.render_full_backlog(workdir, backlog),
        InvocationMode::PerItem => {
            let item = backlog
                .first_incomplete()
                .ok_or_else(|| anyhow!("backlog has no incomplete item to target"))?;
            engine.render_per_item(workdir, backlog, item)
        }
    }
}
