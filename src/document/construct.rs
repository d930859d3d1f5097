//! Constructs, the smallest addressable units of a document

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ops::{OpId, OperationMeta};
use crate::position::Position;

pub type ConstructId = String;

/// Semantic classification of a construct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstructKind {
    Content,
    Documentation,
    Test,
    Configuration,
    ReviewComment,
    Discussion,
    Decision,
    Question,
    Intent,
    Context,
    Reference,
    Whitespace,
    Newline,
}

impl ConstructKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConstructKind::Content => "content",
            ConstructKind::Documentation => "documentation",
            ConstructKind::Test => "test",
            ConstructKind::Configuration => "configuration",
            ConstructKind::ReviewComment => "review_comment",
            ConstructKind::Discussion => "discussion",
            ConstructKind::Decision => "decision",
            ConstructKind::Question => "question",
            ConstructKind::Intent => "intent",
            ConstructKind::Context => "context",
            ConstructKind::Reference => "reference",
            ConstructKind::Whitespace => "whitespace",
            ConstructKind::Newline => "newline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "content" => Some(ConstructKind::Content),
            "documentation" => Some(ConstructKind::Documentation),
            "test" => Some(ConstructKind::Test),
            "configuration" => Some(ConstructKind::Configuration),
            "review_comment" => Some(ConstructKind::ReviewComment),
            "discussion" => Some(ConstructKind::Discussion),
            "decision" => Some(ConstructKind::Decision),
            "question" => Some(ConstructKind::Question),
            "intent" => Some(ConstructKind::Intent),
            "context" => Some(ConstructKind::Context),
            "reference" => Some(ConstructKind::Reference),
            "whitespace" => Some(ConstructKind::Whitespace),
            "newline" => Some(ConstructKind::Newline),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstructMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
}

/// A live fragment of rendered content at a given position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Construct {
    pub id: ConstructId,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: ConstructKind,
    pub position: Position,
    pub created_by: OpId,
    pub modified_by: OpId,
    #[serde(default)]
    pub metadata: ConstructMeta,
}

/// Classify content from an operation's text and metadata.
///
/// Pure so it can be re-run deterministically when persisted operations are
/// re-applied: explicit intent wins, then the `type` context key, then the
/// newline/whitespace shape of the content itself.
pub fn infer_kind(content: &str, metadata: &OperationMeta) -> ConstructKind {
    if let Some(intent) = metadata.intent.as_deref() {
        match intent {
            "documentation" | "comment" | "doc" => return ConstructKind::Documentation,
            "test" | "testing" => return ConstructKind::Test,
            "config" | "configuration" => return ConstructKind::Configuration,
            "review" => return ConstructKind::ReviewComment,
            "discussion" => return ConstructKind::Discussion,
            "decision" => return ConstructKind::Decision,
            "question" => return ConstructKind::Question,
            "intent" => return ConstructKind::Intent,
            "context" => return ConstructKind::Context,
            "reference" => return ConstructKind::Reference,
            _ => {}
        }
    }

    if let Some(kind) = metadata.context.get("type") {
        match kind.as_str() {
            "documentation" => return ConstructKind::Documentation,
            "test" => return ConstructKind::Test,
            "configuration" => return ConstructKind::Configuration,
            "review_comment" => return ConstructKind::ReviewComment,
            "discussion" => return ConstructKind::Discussion,
            "decision" => return ConstructKind::Decision,
            "question" => return ConstructKind::Question,
            _ => {}
        }
    }

    if content == "\n" || content == "\r\n" {
        return ConstructKind::Newline;
    }

    if !content.is_empty() && content.chars().all(|c| c == ' ' || c == '\t') {
        return ConstructKind::Whitespace;
    }

    ConstructKind::Content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OperationMeta;

    #[test]
    fn test_infer_kind_precedence() {
        let plain = OperationMeta::default();
        assert_eq!(infer_kind("let x = 1;", &plain), ConstructKind::Content);

        let doc = OperationMeta::default().with_intent("documentation");
        assert_eq!(infer_kind("// note", &doc), ConstructKind::Documentation);

        let test = OperationMeta::default().with_intent("test");
        assert_eq!(infer_kind("assert!(true)", &test), ConstructKind::Test);

        // Intent wins over content shape.
        let question = OperationMeta::default().with_intent("question");
        assert_eq!(infer_kind("\n", &question), ConstructKind::Question);
    }

    #[test]
    fn test_infer_kind_from_context_type() {
        let mut meta = OperationMeta::default();
        meta.context
            .insert("type".to_string(), "decision".to_string());
        assert_eq!(infer_kind("use warp", &meta), ConstructKind::Decision);
    }

    #[test]
    fn test_infer_kind_whitespace_shapes() {
        let plain = OperationMeta::default();
        assert_eq!(infer_kind("\n", &plain), ConstructKind::Newline);
        assert_eq!(infer_kind("\r\n", &plain), ConstructKind::Newline);
        assert_eq!(infer_kind("    ", &plain), ConstructKind::Whitespace);
        assert_eq!(infer_kind("\t\t", &plain), ConstructKind::Whitespace);
        assert_eq!(infer_kind("", &plain), ConstructKind::Content);
    }

    #[test]
    fn test_unknown_intent_falls_through() {
        let meta = OperationMeta::default().with_intent("refactor");
        assert_eq!(infer_kind("x", &meta), ConstructKind::Content);
    }
}
