//! Thoughts and Lexemes.
//!
//! A Thought is a node in the outline tree. A Lexeme groups every Thought
//! whose value normalizes to the same key; its `contexts` are the ids of
//! those Thoughts.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use ulid::Ulid;

/// Root of the outline.
pub const ROOT: &str = "__ROOT__";
/// Root of the absolute context view.
pub const ABSOLUTE: &str = "__ABSOLUTE__";
/// Holds meta settings.
pub const EM: &str = "__EM__";
/// Parent of the well-known roots. Never stored as a Thought.
pub const ROOT_PARENT_ID: &str = "__ROOT_PARENT_ID__";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThoughtId(String);

impl ThoughtId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn root() -> Self {
        Self::new(ROOT)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the well-known roots and their virtual parent.
    pub fn is_well_known(&self) -> bool {
        matches!(self.0.as_str(), ROOT | ABSOLUTE | EM | ROOT_PARENT_ID)
    }
}

impl fmt::Display for ThoughtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ThoughtId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ThoughtId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Thought,
    Lexeme,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Thought => write!(f, "thought"),
            EntityKind::Lexeme => write!(f, "lexeme"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thought {
    pub id: ThoughtId,
    pub value: String,
    pub rank: f64,
    pub parent_id: ThoughtId,
    /// Child key -> child id.
    #[serde(default)]
    pub children_map: BTreeMap<String, ThoughtId>,
    #[serde(default)]
    pub last_updated: String,
    #[serde(default)]
    pub updated_by: String,
}

impl Thought {
    pub fn new(
        id: impl Into<ThoughtId>,
        value: impl Into<String>,
        rank: f64,
        parent_id: impl Into<ThoughtId>,
    ) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
            rank,
            parent_id: parent_id.into(),
            children_map: BTreeMap::new(),
            last_updated: timestamp(),
            updated_by: String::new(),
        }
    }

    pub fn with_child(mut self, child: &Thought) -> Self {
        self.add_child(child);
        self
    }

    pub fn add_child(&mut self, child: &Thought) {
        self.children_map.insert(child.child_key(), child.id.clone());
    }

    /// Key under which this Thought appears in its parent's children map.
    pub fn child_key(&self) -> String {
        child_key(&self.id, &self.value)
    }

    pub fn children(&self) -> impl Iterator<Item = &ThoughtId> {
        self.children_map.values()
    }

    /// Normalized Lexeme key of this Thought's value.
    pub fn lexeme_key(&self) -> String {
        normalize(&self.value)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lexeme {
    #[serde(default)]
    pub key: String,
    pub lemma: String,
    #[serde(default)]
    pub contexts: Vec<ThoughtId>,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub last_updated: String,
    #[serde(default)]
    pub updated_by: String,
}

impl Lexeme {
    pub fn new(lemma: impl Into<String>, contexts: Vec<ThoughtId>) -> Self {
        let lemma = lemma.into();
        let now = timestamp();
        Self {
            key: normalize(&lemma),
            lemma,
            contexts,
            created: now.clone(),
            last_updated: now,
            updated_by: String::new(),
        }
    }

    pub fn has_context(&self, id: &ThoughtId) -> bool {
        self.contexts.contains(id)
    }

    pub fn with_context(mut self, id: ThoughtId) -> Self {
        if !self.contexts.contains(&id) {
            self.contexts.push(id);
        }
        self
    }

    pub fn without_context(mut self, id: &ThoughtId) -> Self {
        self.contexts.retain(|cx| cx != id);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Entity {
    Thought(Thought),
    Lexeme(Lexeme),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Thought(_) => EntityKind::Thought,
            Entity::Lexeme(_) => EntityKind::Lexeme,
        }
    }

    pub fn into_thought(self) -> Option<Thought> {
        match self {
            Entity::Thought(thought) => Some(thought),
            Entity::Lexeme(_) => None,
        }
    }

    pub fn into_lexeme(self) -> Option<Lexeme> {
        match self {
            Entity::Lexeme(lexeme) => Some(lexeme),
            Entity::Thought(_) => None,
        }
    }
}

/// Meta attributes (values starting with `=`) are keyed by value so that a
/// parent holds at most one of each. Everything else is keyed by id.
pub fn child_key(id: &ThoughtId, value: &str) -> String {
    if value.starts_with('=') {
        value.to_string()
    } else {
        id.to_string()
    }
}

/// Lexeme key of a value: trimmed, lowercased, diacritics stripped.
pub fn normalize(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .chars()
        .filter_map(fold_diacritic)
        .collect()
}

fn fold_diacritic(c: char) -> Option<char> {
    let folded = match c {
        // combining marks
        '\u{0300}'..='\u{036f}' => return None,
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => 'a',
        'ç' | 'ć' | 'ĉ' | 'ċ' | 'č' => 'c',
        'ď' | 'đ' => 'd',
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ĕ' | 'ė' | 'ę' | 'ě' => 'e',
        'ĝ' | 'ğ' | 'ġ' | 'ģ' => 'g',
        'ĥ' | 'ħ' => 'h',
        'ì' | 'í' | 'î' | 'ï' | 'ĩ' | 'ī' | 'ĭ' | 'į' | 'ı' => 'i',
        'ĵ' => 'j',
        'ķ' => 'k',
        'ĺ' | 'ļ' | 'ľ' | 'ŀ' | 'ł' => 'l',
        'ñ' | 'ń' | 'ņ' | 'ň' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ŏ' | 'ő' => 'o',
        'ŕ' | 'ŗ' | 'ř' => 'r',
        'ś' | 'ŝ' | 'ş' | 'š' => 's',
        'ţ' | 'ť' | 'ŧ' => 't',
        'ù' | 'ú' | 'û' | 'ü' | 'ũ' | 'ū' | 'ŭ' | 'ů' | 'ű' | 'ų' => 'u',
        'ŵ' => 'w',
        'ý' | 'ÿ' | 'ŷ' => 'y',
        'ź' | 'ż' | 'ž' => 'z',
        other => other,
    };
    Some(folded)
}

/// The well-known Thoughts a fresh or cleared thoughtspace starts with.
pub fn initial_thoughts() -> Vec<Thought> {
    [ROOT, ABSOLUTE, EM]
        .into_iter()
        .map(|id| Thought::new(id, id, 0.0, ROOT_PARENT_ID))
        .collect()
}

pub(crate) fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Work "), "work");
        assert_eq!(normalize("Café"), "cafe");
        assert_eq!(normalize("NAÏVE Ångström"), "naive angstrom");
        // decomposed accents are dropped too
        assert_eq!(normalize("e\u{0301}cole"), "ecole");
    }

    #[test]
    fn test_child_key() {
        let thought = Thought::new("t1", "Work", 1.0, ROOT);
        assert_eq!(thought.child_key(), "t1");

        let meta = Thought::new("t2", "=pin", 1.0, ROOT);
        assert_eq!(meta.child_key(), "=pin");
    }

    #[test]
    fn test_thought_serializes_camel_case() {
        let child = Thought::new("c1", "x", 0.0, "p1");
        let parent = Thought::new("p1", "Parent", 2.5, ROOT).with_child(&child);

        let json = serde_json::to_value(&parent).unwrap();
        assert_eq!(json["parentId"], "__ROOT__");
        assert_eq!(json["childrenMap"]["c1"], "c1");
        assert_eq!(json["rank"], 2.5);
    }

    #[test]
    fn test_lexeme_contexts() {
        let lexeme = Lexeme::new("Work", vec![])
            .with_context("t1".into())
            .with_context("t1".into())
            .with_context("t2".into());
        assert_eq!(lexeme.key, "work");
        assert_eq!(lexeme.contexts.len(), 2);

        let lexeme = lexeme.without_context(&"t1".into());
        assert!(!lexeme.has_context(&"t1".into()));
        assert!(lexeme.has_context(&"t2".into()));
    }

    #[test]
    fn test_initial_thoughts() {
        let thoughts = initial_thoughts();
        assert_eq!(thoughts.len(), 3);
        assert!(thoughts.iter().all(|t| t.parent_id.as_str() == ROOT_PARENT_ID));
        assert!(thoughts.iter().all(|t| t.id.is_well_known()));
    }
}
