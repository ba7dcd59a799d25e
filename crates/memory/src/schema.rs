use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Directed edge categories between memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Solution,
    Pattern,
    Technology,
    Debugging,
    Progression,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Solution => "solution",
            LinkType::Pattern => "pattern",
            LinkType::Technology => "technology",
            LinkType::Debugging => "debugging",
            LinkType::Progression => "progression",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "solution" => Some(LinkType::Solution),
            "pattern" => Some(LinkType::Pattern),
            "technology" => Some(LinkType::Technology),
            "debugging" => Some(LinkType::Debugging),
            "progression" => Some(LinkType::Progression),
            _ => None,
        }
    }
}

/// A directed, weighted edge stored on its source memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLink {
    pub target_id: String,
    pub link_type: LinkType,
    /// Similarity-derived weight in `[0, 1]`.
    pub strength: f32,
    pub reason: String,
}

/// Outcome of attaching a link to a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Created,
    /// An existing `(target, type)` link was replaced by a stronger one.
    Strengthened,
    /// Self-link, or a weaker duplicate of an existing link.
    Rejected,
}

/// The primary entity: a code snippet with its derived metadata, embedding,
/// and outgoing links.  Content and embedding are immutable after creation;
/// context, tags, and links are mutated only by the evolution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub content: String,
    /// One-sentence derived summary.
    pub context: String,
    /// 3–7 short strings ordered by salience; never empty.
    pub keywords: Vec<String>,
    /// 3–6 broad categories; never empty.
    pub tags: Vec<String>,
    pub workspace_id: String,
    /// Optional hint; empty string means unknown.
    pub code_type: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub links: Vec<MemoryLink>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Open-ended extras, preserved round-trip through the store.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Memory {
    /// Attach a link, enforcing the no-self-link and `(target, type)`
    /// uniqueness invariants.  On a duplicate pair the stronger link wins.
    pub fn add_link(&mut self, link: MemoryLink) -> LinkOutcome {
        if link.target_id == self.id {
            return LinkOutcome::Rejected;
        }
        if let Some(existing) = self
            .links
            .iter_mut()
            .find(|candidate| {
                candidate.target_id == link.target_id && candidate.link_type == link.link_type
            })
        {
            if link.strength > existing.strength {
                *existing = link;
                return LinkOutcome::Strengthened;
            }
            return LinkOutcome::Rejected;
        }
        self.links.push(link);
        LinkOutcome::Created
    }

    /// Replace the tag list, treating it as a set.  Returns `true` when the
    /// set actually changed.
    pub fn replace_tags(&mut self, tags: Vec<String>) -> bool {
        let mut incoming: Vec<String> = tags
            .into_iter()
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect();
        incoming.sort();
        incoming.dedup();

        let mut current = self.tags.clone();
        current.sort();
        current.dedup();

        if incoming.is_empty() || incoming == current {
            return false;
        }
        self.tags = incoming;
        true
    }
}

/// The note-construction analysis shape returned by the LLM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryAnalysis {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl MemoryAnalysis {
    /// Inject the documented defaults for any field the model left empty.
    pub fn with_defaults(mut self) -> Self {
        if self.keywords.is_empty() {
            self.keywords = vec!["code".to_string(), "programming".to_string()];
        }
        if self.context.trim().is_empty() {
            self.context = "Code snippet or programming concept".to_string();
        }
        if self.tags.is_empty() {
            self.tags = vec!["general".to_string(), "code".to_string()];
        }
        self
    }
}
