use std::collections::{BTreeMap, VecDeque};

use crate::truncate::preview;

const OUTCOME_PREVIEW_CHARS: usize = 160;

#[derive(Clone, Debug, PartialEq)]
pub struct RecentOutcome {
    pub tool: String,
    pub is_error: bool,
    pub preview: String,
}

/// Short-term memory rendered into the system prompt: the last few tool
/// outcomes plus facts tools reported under a `knowledge` key.
#[derive(Clone, Debug)]
pub struct WorkingContext {
    recent: VecDeque<RecentOutcome>,
    capacity: usize,
    knowledge: BTreeMap<String, String>,
}

impl WorkingContext {
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(capacity),
            capacity,
            knowledge: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, tool: &str, output: &str, is_error: bool) {
        if self.capacity > 0 {
            if self.recent.len() == self.capacity {
                self.recent.pop_front();
            }
            self.recent.push_back(RecentOutcome {
                tool: tool.to_string(),
                is_error,
                preview: preview(output.trim(), OUTCOME_PREVIEW_CHARS),
            });
        }
        if !is_error {
            self.absorb_knowledge(output);
        }
    }

    fn absorb_knowledge(&mut self, output: &str) {
        let Ok(serde_json::Value::Object(obj)) = serde_json::from_str::<serde_json::Value>(output) else {
            return;
        };
        let Some(serde_json::Value::Object(facts)) = obj.get("knowledge") else {
            return;
        };
        for (key, value) in facts {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.knowledge.insert(key.clone(), text);
        }
    }

    pub fn remember(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.knowledge.insert(key.into(), value.into());
    }

    pub fn recent(&self) -> impl Iterator<Item = &RecentOutcome> {
        self.recent.iter()
    }

    pub fn knowledge(&self) -> &BTreeMap<String, String> {
        &self.knowledge
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty() && self.knowledge.is_empty()
    }

    /// Prompt section, or `None` when there is nothing to say.
    pub fn render(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let mut out = String::from("## Working context\n");
        if !self.recent.is_empty() {
            out.push_str("\nRecent tool results:\n");
            for r in &self.recent {
                let status = if r.is_error { "error" } else { "ok" };
                out.push_str(&format!("- {} ({status}): {}\n", r.tool, r.preview));
            }
        }
        if !self.knowledge.is_empty() {
            out.push_str("\nKnown facts:\n");
            for (k, v) in &self.knowledge {
                out.push_str(&format!("- {k}: {v}\n"));
            }
        }
        Some(out)
    }
}
