//! Line patterns for both external protocols.
//!
//! Session output is matched by a set of independent highlighters (see
//! [`crate::style`]) plus the exclusive global-creation prompt. Method finder
//! output goes through [`classify_browser_line`], which applies a fixed
//! precedence so a method header is never mistaken for an argument list.

use regex::Regex;
use std::sync::LazyLock;

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid regex")
}

pub static ERROR: LazyLock<Regex> = LazyLock::new(|| compile(r"(?i)^\*\*\*\* error.*"));
pub static WARNING: LazyLock<Regex> = LazyLock::new(|| compile(r"(?i)^\*\*\*\* warning.*"));
pub static TRACEBACK: LazyLock<Regex> = LazyLock::new(|| compile(r"(?i)^---- traceback.*"));
pub static TRACEBACK_PATH: LazyLock<Regex> =
    LazyLock::new(|| compile(r"\(\s*[^()]+\s*:\s*\d+\s*\)"));
pub static GLOBAL: LazyLock<Regex> = LazyLock::new(|| compile(r"![\w?]*?!"));
pub static STRING: LazyLock<Regex> = LazyLock::new(|| compile(r#"".*?""#));
pub static APROPOS: LazyLock<Regex> = LazyLock::new(|| {
    compile(
        r"(?i)(method|iter method|class constant|class variable|CORRUPT) ([\w?!(), <^\[\]]*?) in ([\w?]*)",
    )
});
pub static APROPOS_NAME_HEAD: LazyLock<Regex> =
    LazyLock::new(|| compile(r"(?i)^[a-z0-9_?!\[\]]+"));
pub static TODO: LazyLock<Regex> = LazyLock::new(|| compile(r"(?i)todo"));

static GLOBAL_CREATION_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| compile(r"^(Global .* does not exist: create it\?) \(Y\)$"));

static HEADER_SHAPE: LazyLock<Regex> = LazyLock::new(|| compile(r"^\S+ +IN +\S"));
static COMMENT: LazyLock<Regex> = LazyLock::new(|| compile(r"^\s*##"));
static TOTAL: LazyLock<Regex> = LazyLock::new(|| compile(r"^>?(?P<count>\d+)$"));
static INFO: LazyLock<Regex> = LazyLock::new(|| compile(r"^\s*\*\*\* "));

pub static METHOD_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    compile(concat!(
        r"^(?P<method>[\w?!(),<^\[\]]+) *IN *",
        r"(?:(?P<package>[\w?!]+):)?(?P<class><?[\w?!]+>?) *",
        r"(?:(?P<level1>A|B|Restr)\b ?)?",
        r"(?:(?P<subclassable>S)\b ?)?",
        r"(?:(?P<redefinable>Redef)\b ?)?",
        r"(?:(?P<level2>Depr|Debug)\b ?)?",
        r"(?:(?P<iterator>iter)\b ?)?",
        r"(?:(?P<private>private)\b ?)?",
        r"(?:(?P<kind>classvar|classconst)\b ?)?",
        r"(?P<topics>.+)?$",
    ))
});
pub static PARAMETER_COMMENT: LazyLock<Regex> = LazyLock::new(|| {
    compile(r"^@param +\{*(?P<class>.*)?\} +(?P<parameter>[\w?!]*) *(?P<description>\S.*)?")
});
pub static RETURN_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| compile(r"^@return +\{*(?P<class>.*)?\} *(?P<description>\S.*)?"));
pub static ARGUMENTS: LazyLock<Regex> = LazyLock::new(|| {
    compile(concat!(
        r"^(?P<required>.*?)",
        r"(?:\s*\bOPT\b\s*(?P<optional>.*?))?",
        r"(?:\s*\bGATH\b\s*(?P<gather>.*?))?$",
    ))
});
pub static RESOURCE: LazyLock<Regex> = LazyLock::new(|| {
    compile(concat!(
        r"^\x13(?P<path>[\w:$/\\.\- ]*?\.magik) ",
        r"(?P<method>[\w?!(),<^\[\]]+) ",
        r"(?:(?P<package>[\w?!]+):)?(?P<class><?[\w?!]+>?)",
    ))
});

/// Leading byte of a method finder topic line.
pub const TOPIC_MARKER: char = '\x14';
/// Leading byte of a method finder source-location reply.
pub const RESOURCE_MARKER: char = '\x13';

/// Returns the question text when `line` is the session's global-creation prompt.
pub fn confirmation_question(line: &str) -> Option<&str> {
    GLOBAL_CREATION_PROMPT
        .captures(line.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// One method finder output line, classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserLine<'a> {
    Resource(&'a str),
    Topic(&'a str),
    Header(&'a str),
    Comment(&'a str),
    Total(u64),
    Info(&'a str),
    Arguments(&'a str),
    Blank,
}

/// Classifies a method finder line. The order of checks is part of the
/// protocol: topic, header, comment, total, info, then anything non-blank is
/// an argument list.
pub fn classify_browser_line(line: &str) -> BrowserLine<'_> {
    if line.starts_with(RESOURCE_MARKER) {
        return BrowserLine::Resource(line);
    }
    if let Some(topic) = line.strip_prefix(TOPIC_MARKER) {
        return BrowserLine::Topic(topic);
    }
    if HEADER_SHAPE.is_match(line) {
        return BrowserLine::Header(line);
    }
    if COMMENT.is_match(line) {
        return BrowserLine::Comment(line);
    }
    if let Some(count) = TOTAL
        .captures(line.trim_end())
        .and_then(|c| c.name("count"))
        .and_then(|m| m.as_str().parse::<u64>().ok())
    {
        return BrowserLine::Total(count);
    }
    if INFO.is_match(line) {
        return BrowserLine::Info(line);
    }
    if line.trim().is_empty() {
        return BrowserLine::Blank;
    }
    BrowserLine::Arguments(line)
}
