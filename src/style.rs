//! ANSI highlighting of session output lines.

use regex::Captures;

use crate::patterns::{
    APROPOS, APROPOS_NAME_HEAD, ERROR, GLOBAL, STRING, TODO, TRACEBACK, TRACEBACK_PATH, WARNING,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Reset = 0,
    Underline = 4,
    Red = 31,
    Green = 32,
    Yellow = 33,
    Blue = 34,
    Cyan = 36,
    Grey = 90,
}

/// Wraps `text` in SGR sequences, resetting before and after.
pub fn apply_style(text: &str, styles: &[Style]) -> String {
    let codes = styles
        .iter()
        .map(|s| (*s as u8).to_string())
        .collect::<Vec<_>>()
        .join(";");
    let reset = Style::Reset as u8;
    format!("\x1b[{reset}m\x1b[{codes}m{text}\x1b[{reset}m")
}

/// Runs the highlighting pass over one output line.
///
/// Rules run in a fixed order, each over the output of the previous one, so
/// a string literal inside an error line is marked twice.
pub fn style_line(line: &str) -> String {
    let mut out = ERROR
        .replace_all(line, |c: &Captures| {
            apply_style(&c[0], &[Style::Red, Style::Underline])
        })
        .into_owned();
    out = WARNING
        .replace_all(&out, |c: &Captures| apply_style(&c[0], &[Style::Yellow]))
        .into_owned();
    out = TRACEBACK
        .replace_all(&out, |c: &Captures| apply_style(&c[0], &[Style::Red]))
        .into_owned();
    out = TRACEBACK_PATH
        .replace_all(&out, |c: &Captures| apply_style(&c[0], &[Style::Grey]))
        .into_owned();
    out = GLOBAL
        .replace_all(&out, |c: &Captures| apply_style(&c[0], &[Style::Green]))
        .into_owned();
    out = STRING
        .replace_all(&out, |c: &Captures| apply_style(&c[0], &[Style::Yellow]))
        .into_owned();
    out = APROPOS.replace_all(&out, style_apropos).into_owned();
    TODO.replace_all(&out, |c: &Captures| apply_style(&c[0], &[Style::Red]))
        .into_owned()
}

fn style_apropos(c: &Captures) -> String {
    let kind = &c[1];
    let name = &c[2];
    let class = &c[3];

    let mut styled_name = APROPOS_NAME_HEAD
        .replace(name, |h: &Captures| apply_style(&h[0], &[Style::Yellow]))
        .into_owned();
    for keyword in [" optional ", " gather "] {
        styled_name = styled_name.replacen(keyword, &apply_style(keyword, &[Style::Cyan]), 1);
    }

    let kind_style = if kind == "CORRUPT" {
        Style::Red
    } else {
        Style::Blue
    };
    format!(
        "{} {} {} {}",
        apply_style(kind, &[kind_style]),
        styled_name,
        apply_style("in", &[Style::Grey]),
        apply_style(class, &[Style::Green])
    )
}
