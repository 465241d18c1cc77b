// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Path-to-regex compilation with named captures. There is no dedicated
//! path-matching crate in play here, so patterns compile straight to
//! `regex::Regex` with named groups for `:name` segments.

use std::collections::HashMap;

use regex::Regex;

/// A compiled route pattern plus the capture names in declaration order.
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    regex: Regex,
    param_names: Vec<String>,
    pattern: String,
}

/// `src` is built from escaped literals and a fixed `[^/]+` capture class, so
/// it is valid by construction. On the unreachable failure path, fall back
/// to a regex that matches nothing rather than taking the process down over
/// a single bad route registration.
fn compile_or_unreachable(src: &str, pattern: &str) -> Regex {
    Regex::new(src).unwrap_or_else(|e| {
        tracing::error!(pattern, err = %e, "route pattern failed to compile, route is now unreachable");
        Regex::new("$.^").unwrap_or_else(|_| unreachable!("constant pattern is always valid"))
    })
}

impl CompiledRoute {
    /// Compile a pattern such as `/x/:id` into a regex with a named group
    /// per `:name` segment.
    pub fn compile(pattern: &str) -> Self {
        let mut param_names = Vec::new();
        let mut regex_src = String::from("^");
        for (i, segment) in pattern.split('/').enumerate() {
            if i > 0 {
                regex_src.push('/');
            }
            if let Some(name) = segment.strip_prefix(':') {
                param_names.push(name.to_owned());
                regex_src.push_str(&format!("(?P<{name}>[^/]+)"));
            } else {
                regex_src.push_str(&regex::escape(segment));
            }
        }
        regex_src.push('$');
        let regex = compile_or_unreachable(&regex_src, pattern);
        Self { regex, param_names, pattern: pattern.to_owned() }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    /// Match a concrete path, returning captured params by name if the
    /// pattern accepts it.
    pub fn match_path(&self, path: &str) -> Option<HashMap<String, String>> {
        let caps = self.regex.captures(path)?;
        let mut params = HashMap::with_capacity(self.param_names.len());
        for name in &self.param_names {
            if let Some(m) = caps.name(name) {
                params.insert(name.clone(), m.as_str().to_owned());
            }
        }
        Some(params)
    }

    /// Positional parameter vector for a concrete path, in pattern-declared
    /// order. Used for subscription equality, which is positional rather
    /// than name-keyed (see router broadcast fan-out).
    pub fn positional_params(&self, path: &str) -> Option<Vec<String>> {
        let params = self.match_path(path)?;
        Some(self.param_names.iter().map(|n| params.get(n).cloned().unwrap_or_default()).collect())
    }
}

/// Routes a client sends over the wire (not server-declared patterns) must
/// consist only of this character set; `:` is rejected explicitly since it
/// would otherwise be ambiguous with pattern syntax.
pub fn validate_client_route(route: &str) -> Result<(), String> {
    let ok = !route.is_empty()
        && route.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '/' | '-'));
    if ok {
        Ok(())
    } else {
        Err("route must match [a-zA-Z0-9_/-]+".to_owned())
    }
}
