//! Search parameters for the method finder and their wire encoding.

use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;

use crate::error::SessionError;
use crate::method::Level;

pub const DEFAULT_MAX_RESULTS: NonZeroU32 = match NonZeroU32::new(200) {
    Some(n) => n,
    None => unreachable!(),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelFilter {
    pub basic: bool,
    pub advanced: bool,
    pub restricted: bool,
    pub deprecated: bool,
    pub debug: bool,
}

impl Default for LevelFilter {
    fn default() -> Self {
        Self {
            basic: true,
            advanced: true,
            restricted: true,
            deprecated: true,
            debug: true,
        }
    }
}

impl LevelFilter {
    pub fn get(&self, level: Level) -> bool {
        match level {
            Level::Basic => self.basic,
            Level::Advanced => self.advanced,
            Level::Restricted => self.restricted,
            Level::Deprecated => self.deprecated,
            Level::Debug => self.debug,
        }
    }

    pub fn set(&mut self, level: Level, shown: bool) {
        let slot = match level {
            Level::Basic => &mut self.basic,
            Level::Advanced => &mut self.advanced,
            Level::Restricted => &mut self.restricted,
            Level::Deprecated => &mut self.deprecated,
            Level::Debug => &mut self.debug,
        };
        *slot = shown;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParameters {
    pub class_name: String,
    pub method_name: String,
    pub local_only: bool,
    pub show_args: bool,
    pub show_comments: bool,
    pub levels: LevelFilter,
    pub max_results: NonZeroU32,
}

impl Default for SearchParameters {
    fn default() -> Self {
        Self {
            class_name: String::new(),
            method_name: String::new(),
            local_only: false,
            show_args: false,
            show_comments: false,
            levels: LevelFilter::default(),
            max_results: DEFAULT_MAX_RESULTS,
        }
    }
}

impl SearchParameters {
    /// Encodes the parameters as method finder directives. The tool reads
    /// them positionally, so the order never changes.
    pub fn encode(&self) -> String {
        let mut lines = vec![
            "unadd class".to_string(),
            with_value("add class", &self.class_name),
            with_value("method_name", &self.method_name),
            switch(self.show_args, "print_args", "dont_print_args").to_string(),
            switch(self.show_comments, "print_comments", "dont_print_comments").to_string(),
            "show_topics".to_string(),
            "override_flags".to_string(),
            switch(self.local_only, "local_only", "inherit_all").to_string(),
        ];
        for level in Level::ALL {
            let verb = switch(self.levels.get(level), "add", "unadd");
            lines.push(format!("{verb} {}", level.directive()));
        }
        lines.push(format!("method_cut_off {}", self.max_results));
        lines.push("print_curr_methods".to_string());

        let mut encoded = lines.join("\n");
        encoded.push('\n');
        encoded
    }

    /// Reads an encoded query back. Directives that only reset state are
    /// accepted and ignored.
    pub fn from_query(query: &str) -> Result<Self, SessionError> {
        let mut params = Self::default();

        for line in query.lines() {
            if let Some(class) = line.strip_prefix("add class ") {
                params.class_name = class.to_string();
                continue;
            }
            if let Some(method) = line.strip_prefix("method_name ") {
                params.method_name = method.to_string();
                continue;
            }
            if let Some(limit) = line.strip_prefix("method_cut_off ") {
                params.max_results = limit
                    .trim()
                    .parse::<NonZeroU32>()
                    .map_err(|_| SessionError::desync("positive result cutoff", line))?;
                continue;
            }

            match line.trim_end() {
                "" | "unadd class" | "add class" | "method_name" | "show_topics"
                | "override_flags" | "print_curr_methods" => {}
                "print_args" => params.show_args = true,
                "dont_print_args" => params.show_args = false,
                "print_comments" => params.show_comments = true,
                "dont_print_comments" => params.show_comments = false,
                "local_only" => params.local_only = true,
                "inherit_all" => params.local_only = false,
                other => {
                    let (shown, name) = if let Some(name) = other.strip_prefix("add ") {
                        (true, name)
                    } else if let Some(name) = other.strip_prefix("unadd ") {
                        (false, name)
                    } else {
                        return Err(SessionError::desync("query directive", line));
                    };
                    let level = Level::from_directive(name)
                        .ok_or_else(|| SessionError::desync("visibility level", line))?;
                    params.levels.set(level, shown);
                }
            }
        }

        Ok(params)
    }
}

fn with_value(directive: &str, value: &str) -> String {
    if value.is_empty() {
        directive.to_string()
    } else {
        format!("{directive} {value}")
    }
}

fn switch(on: bool, yes: &'static str, no: &'static str) -> &'static str {
    if on { yes } else { no }
}
