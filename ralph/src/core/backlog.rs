//! Task backlog model and the pure queries the run loop makes against it.
//!
//! The backlog is persisted as `.ralph/prd.json`; the JSON field names are a
//! stable contract shared with the external agent, which flips `passes` on the
//! items it finishes.

use serde::{Deserialize, Serialize};

/// Ordered collection of work items for one feature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backlog {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "userStories", default)]
    pub items: Vec<Item>,
}

/// One unit of work with acceptance criteria and a completion flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub passes: bool,
}

impl Item {
    /// New incomplete item with no id; [`Backlog::append`] assigns one.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

impl Backlog {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            items: Vec::new(),
        }
    }

    /// First item, in stored order, that has not passed yet.
    ///
    /// Selection is strictly positional: there is no priority field.
    pub fn first_incomplete(&self) -> Option<&Item> {
        self.items.iter().find(|item| !item.passes)
    }

    /// Title of the current item, or `"none"` once everything passes.
    pub fn current_title(&self) -> &str {
        self.first_incomplete()
            .map(|item| item.title.as_str())
            .unwrap_or("none")
    }

    /// `(done, total)` item counts.
    pub fn progress(&self) -> (usize, usize) {
        let done = self.items.iter().filter(|item| item.passes).count();
        (done, self.items.len())
    }

    /// Progress rendered as `done/total`.
    pub fn progress_label(&self) -> String {
        let (done, total) = self.progress();
        format!("{done}/{total}")
    }

    /// Completion percentage, floored. An empty backlog reports 0.
    pub fn progress_percent(&self) -> usize {
        let (done, total) = self.progress();
        if total == 0 {
            return 0;
        }
        done * 100 / total
    }

    /// True iff the backlog has items and all of them pass.
    ///
    /// An empty backlog is not complete, even though its percentage is 0 and
    /// not 100: there is nothing to publish.
    pub fn is_complete(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(|item| item.passes)
    }

    /// Append an item, assigning `count + 1` as its id when none was supplied.
    ///
    /// Returns the id the item ended up with.
    pub fn append(&mut self, mut item: Item) -> String {
        if item.id.is_empty() {
            item.id = (self.items.len() + 1).to_string();
        }
        let id = item.id.clone();
        self.items.push(item);
        id
    }

    pub fn find(&self, id: &str) -> Option<&Item> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Mark an item as passing. Returns false if no item has that id.
    pub fn mark_passed(&mut self, id: &str) -> bool {
        match self.items.iter_mut().find(|item| item.id == id) {
            Some(item) => {
                item.passes = true;
                true
            }
            None => false,
        }
    }
}

/// Items that pass in `after` but did not pass in `before`, in `after` order.
///
/// Items that only exist in `after` count as newly passed when they pass.
pub fn newly_passed<'a>(before: &Backlog, after: &'a Backlog) -> Vec<&'a Item> {
    after
        .items
        .iter()
        .filter(|item| item.passes)
        .filter(|item| !before.find(&item.id).is_some_and(|prev| prev.passes))
        .collect()
}
