//! # Agent selector: does a test apply to this agent?
//!
//! A pure predicate over the agent's runtime identity, evaluated during
//! reconciliation without any coordination:
//!
//! 1. With `watch_own_namespace_only`, the test's namespace must equal the
//!    agent's.
//! 2. A non-empty `node_selector` must glob-match the agent's node name.
//! 3. Every pair in `pod_label_selector` must be present, with equal value,
//!    in the agent's pod labels.
//!
//! Glob matching is shell-style: `*` (any run), `?` (any one character), and
//! `[a-z]` / `[^abc]` character classes. A malformed pattern (unclosed
//! class) yields an error; the reconciler logs it and skips the test.

use tracing::debug;

use crate::config::RunTimeInfo;
use crate::error::AgentError;
use crate::syntest::SynTestConfig;

/// Returns whether `config` applies to the agent described by `runtime`.
pub fn agent_selector_matches(
    config: &SynTestConfig,
    runtime: &RunTimeInfo,
    watch_own_namespace_only: bool,
) -> Result<bool, AgentError> {
    if watch_own_namespace_only && config.namespace != runtime.namespace {
        debug!(test = %config.name, "syntest not in same namespace as agent, ignoring");
        return Ok(false);
    }

    if !config.node_selector.is_empty()
        && !wildcard_match(&config.node_selector, &runtime.node_name)?
    {
        debug!(
            selector = %config.node_selector,
            node = %runtime.node_name,
            "nodeSelector didn't match"
        );
        return Ok(false);
    }

    for (k, v) in &config.pod_label_selector {
        if runtime.pod_labels.get(k) != Some(v) {
            debug!(label = %k, "podLabelSelector didn't match");
            return Ok(false);
        }
    }

    Ok(true)
}

/// Shell-style wildcard match of `text` against `pattern`.
pub fn wildcard_match(pattern: &str, text: &str) -> Result<bool, AgentError> {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    validate(&p).map_err(|()| AgentError::MalformedSelector {
        pattern: pattern.to_string(),
    })?;

    // Iterative matcher with single-star backtracking.
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        let step = if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    true
                }
                '[' => {
                    let (matched, next) = match_class(&p, pi, t[ti]);
                    if matched {
                        pi = next;
                        ti += 1;
                    }
                    matched
                }
                c => {
                    let eq = c == t[ti];
                    if eq {
                        pi += 1;
                        ti += 1;
                    }
                    eq
                }
            }
        } else {
            false
        };

        if !step {
            match star {
                // Re-anchor the most recent star one character further.
                Some((spi, sti)) => {
                    pi = spi + 1;
                    ti = sti + 1;
                    star = Some((spi, sti + 1));
                }
                None => return Ok(false),
            }
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    Ok(pi == p.len())
}

/// Rejects patterns with an unclosed character class.
fn validate(p: &[char]) -> Result<(), ()> {
    let mut i = 0;
    while i < p.len() {
        if p[i] == '[' {
            i = scan_class(p, i)?;
        } else {
            i += 1;
        }
    }
    Ok(())
}

/// Returns the index just past the class starting at `p[start] == '['`.
fn scan_class(p: &[char], start: usize) -> Result<usize, ()> {
    let mut i = start + 1;
    if p.get(i) == Some(&'^') {
        i += 1;
    }
    let mut first = true;
    loop {
        match p.get(i) {
            None => return Err(()),
            Some(']') if !first => return Ok(i + 1),
            Some(_) => {
                first = false;
                i += 1;
            }
        }
    }
}

/// Matches `ch` against the (validated) class at `p[start] == '['`.
///
/// Returns the outcome and the index just past the class.
fn match_class(p: &[char], start: usize, ch: char) -> (bool, usize) {
    let mut i = start + 1;
    let negate = p.get(i) == Some(&'^');
    if negate {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    loop {
        match p.get(i) {
            None => break,
            Some(']') if !first => {
                i += 1;
                break;
            }
            Some(&lo) => {
                first = false;
                if p.get(i + 1) == Some(&'-') && p.get(i + 2).is_some_and(|c| *c != ']') {
                    let hi = p[i + 2];
                    if lo <= ch && ch <= hi {
                        matched = true;
                    }
                    i += 3;
                } else {
                    if ch == lo {
                        matched = true;
                    }
                    i += 1;
                }
            }
        }
    }
    (matched != negate, i)
}
