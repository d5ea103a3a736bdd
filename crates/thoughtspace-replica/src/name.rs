//! Document naming.
//!
//! Every replicated document has a name of the form `{tsid}/{kind}/{id}`,
//! which doubles as its key in the local store and on the relay. The
//! doclog is `{tsid}/doclog` and its replication cursors live beside it
//! under `{tsid}/doclog/{key}`.

use crate::entity::ThoughtId;
use crate::error::{ReplicaError, Result};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Thought(ThoughtId),
    Lexeme(String),
    Doclog,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentName {
    tsid: String,
    kind: DocumentKind,
}

impl DocumentName {
    pub fn thought(tsid: impl Into<String>, id: &ThoughtId) -> Self {
        Self {
            tsid: tsid.into(),
            kind: DocumentKind::Thought(id.clone()),
        }
    }

    pub fn lexeme(tsid: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            tsid: tsid.into(),
            kind: DocumentKind::Lexeme(key.into()),
        }
    }

    pub fn doclog(tsid: impl Into<String>) -> Self {
        Self {
            tsid: tsid.into(),
            kind: DocumentKind::Doclog,
        }
    }

    /// Key of a metadata entry stored next to the doclog.
    pub fn doclog_meta(tsid: &str, key: &str) -> String {
        format!("{}/doclog/{}", tsid, key)
    }

    pub fn tsid(&self) -> &str {
        &self.tsid
    }

    pub fn kind(&self) -> &DocumentKind {
        &self.kind
    }

    pub fn parse(name: &str) -> Result<Self> {
        let invalid = || ReplicaError::InvalidDocumentName(name.to_string());
        let mut parts = name.splitn(3, '/');
        let tsid = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let kind = match (parts.next(), parts.next()) {
            (Some("doclog"), None) => DocumentKind::Doclog,
            (Some("thought"), Some(id)) if !id.is_empty() => {
                DocumentKind::Thought(ThoughtId::new(id))
            }
            (Some("lexeme"), Some(key)) if !key.is_empty() => DocumentKind::Lexeme(key.to_string()),
            _ => return Err(invalid()),
        };
        Ok(Self {
            tsid: tsid.to_string(),
            kind,
        })
    }
}

impl fmt::Display for DocumentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DocumentKind::Thought(id) => write!(f, "{}/thought/{}", self.tsid, id),
            DocumentKind::Lexeme(key) => write!(f, "{}/lexeme/{}", self.tsid, key),
            DocumentKind::Doclog => write!(f, "{}/doclog", self.tsid),
        }
    }
}
