//! Method finder result records.
//!
//! A [`MethodRecord`] is built from one header line and then refined by the
//! comment and argument lines that follow it, until the next header or
//! sentinel.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::SessionError;
use crate::patterns::{ARGUMENTS, METHOD_HEADER, PARAMETER_COMMENT, RETURN_COMMENT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Basic,
    Advanced,
    Restricted,
    Deprecated,
    Debug,
}

impl Level {
    /// The order in which level directives are written to the method finder.
    pub const ALL: [Level; 5] = [
        Level::Basic,
        Level::Advanced,
        Level::Restricted,
        Level::Deprecated,
        Level::Debug,
    ];

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "A" => Some(Level::Advanced),
            "B" => Some(Level::Basic),
            "Restr" => Some(Level::Restricted),
            "Depr" => Some(Level::Deprecated),
            "Debug" => Some(Level::Debug),
            _ => None,
        }
    }

    pub fn directive(self) -> &'static str {
        match self {
            Level::Basic => "basic",
            Level::Advanced => "advanced",
            Level::Restricted => "restricted",
            Level::Deprecated => "deprecated",
            Level::Debug => "debug",
        }
    }

    pub fn from_directive(name: &str) -> Option<Self> {
        Level::ALL.into_iter().find(|l| l.directive() == name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    #[default]
    Method,
    Variable,
    Constant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Comment {
    Text {
        text: String,
    },
    Parameter {
        class: String,
        parameter: String,
        description: Option<String>,
    },
    Return {
        class: String,
        description: Option<String>,
    },
}

impl Comment {
    /// Classifies the body of a `##` comment line.
    pub fn parse(raw: &str) -> Self {
        let body = strip_comment_marker(raw);

        if let Some(c) = PARAMETER_COMMENT.captures(body) {
            return Comment::Parameter {
                class: capture(&c, "class").unwrap_or_default(),
                parameter: capture(&c, "parameter").unwrap_or_default(),
                description: capture(&c, "description"),
            };
        }
        if let Some(c) = RETURN_COMMENT.captures(body) {
            return Comment::Return {
                class: capture(&c, "class").unwrap_or_default(),
                description: capture(&c, "description"),
            };
        }
        Comment::Text {
            text: body.to_string(),
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Comment::Text { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arguments {
    pub required: Vec<String>,
    pub optional: Vec<String>,
    pub gather: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodRecord {
    pub name: String,
    pub class: String,
    pub package: String,
    pub level: Option<Level>,
    pub kind: Kind,
    pub private: bool,
    pub subclassable: bool,
    pub redefinable: bool,
    pub iterator: bool,
    pub topics: BTreeSet<String>,
    pub comments: Vec<Comment>,
    pub arguments: Arguments,
    pub raw: String,
}

impl MethodRecord {
    /// Parses a method finder header line.
    ///
    /// Header shape: `<name> IN <package>:<class> [A|B|Restr] [S] [Redef]
    /// [Depr|Debug] [iter] [private] [classvar|classconst] [topics...]`.
    pub fn parse_header(line: &str, default_package: &str) -> Result<Self, SessionError> {
        let c = METHOD_HEADER
            .captures(line)
            .ok_or_else(|| SessionError::desync("method header", line))?;

        let level = c
            .name("level1")
            .filter(|m| !m.as_str().is_empty())
            .or_else(|| c.name("level2"))
            .and_then(|m| Level::from_token(m.as_str()));

        let kind = match c.name("kind").map(|m| m.as_str()) {
            Some("classvar") => Kind::Variable,
            Some("classconst") => Kind::Constant,
            _ => Kind::Method,
        };

        let topics = c
            .name("topics")
            .map(|m| {
                m.as_str()
                    .split_whitespace()
                    .map(str::to_string)
                    .collect::<BTreeSet<_>>()
            })
            .unwrap_or_default();

        Ok(Self {
            name: capture(&c, "method").unwrap_or_default(),
            class: capture(&c, "class").unwrap_or_default(),
            package: capture(&c, "package").unwrap_or_else(|| default_package.to_string()),
            level,
            kind,
            private: c.name("private").is_some(),
            subclassable: c.name("subclassable").is_some(),
            redefinable: c.name("redefinable").is_some(),
            iterator: c.name("iterator").is_some(),
            topics,
            comments: Vec::new(),
            arguments: Arguments::default(),
            raw: line.to_string(),
        })
    }

    /// Adds a comment line. Parameter and return comments are only kept when
    /// arguments are being shown; plain text is always kept.
    pub fn append_comment(&mut self, raw: &str, show_args: bool) {
        let comment = Comment::parse(raw);
        if comment.is_text() || show_args {
            self.comments.push(comment);
        }
    }

    /// Applies an argument list line: `required... [OPT optional...] [GATH name]`.
    pub fn set_arguments(&mut self, raw: &str) -> Result<(), SessionError> {
        let trimmed = raw.trim();
        let c = ARGUMENTS
            .captures(trimmed)
            .ok_or_else(|| SessionError::desync("argument list", raw))?;

        if let Some(required) = c.name("required") {
            self.arguments.required = split_names(required.as_str());
        }
        if let Some(optional) = c.name("optional") {
            self.arguments.optional = split_names(optional.as_str());
        }
        if let Some(gather) = c.name("gather").map(|m| m.as_str().trim()) {
            if !gather.is_empty() {
                self.arguments.gather = Some(gather.to_string());
            }
        }
        Ok(())
    }

    pub fn qualified_class(&self) -> String {
        format!("{}:{}", self.package, self.class)
    }
}

fn strip_comment_marker(raw: &str) -> &str {
    let trimmed = raw.trim_start();
    trimmed.strip_prefix("##").unwrap_or(trimmed).trim()
}

fn split_names(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

fn capture(c: &regex::Captures, name: &str) -> Option<String> {
    c.name(name)
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
