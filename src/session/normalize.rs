//! Terminal output cleanup.
//!
//! Device consoles emit colour codes, cursor movements, backspace-based line
//! editing and carriage-return progress bars. The pipeline below turns such a
//! byte stream into plain text, one step at a time, each step working on the
//! full output of the previous one.

use std::collections::BTreeSet;

use log::trace;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

const ESC: char = '\u{1b}';
const BEL: char = '\u{7}';
const BACKSPACE: char = '\u{8}';

/// A cleanup step that can be enabled on a session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CleanupAction {
    /// Remove ANSI escape sequences and control characters.
    StripAnsiCodes,
    /// A backspace erases the previous character.
    ProcessBackspaces,
    /// A carriage return rewinds to the line start and overwrites it.
    ProcessCarriageReturns,
    /// `\r\n` becomes `\n`.
    NormalizeLineEndings,
    /// Remove the matched expect pattern from the returned output.
    StripPrompt,
}

/// Set of enabled cleanup actions.
///
/// Membership only: the steps always run in the fixed pipeline order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct CleanupActions(BTreeSet<CleanupAction>);

impl Default for CleanupActions {
    fn default() -> Self {
        Self::from_iter([
            CleanupAction::StripAnsiCodes,
            CleanupAction::StripPrompt,
            CleanupAction::ProcessBackspaces,
            CleanupAction::ProcessCarriageReturns,
        ])
    }
}

impl FromIterator<CleanupAction> for CleanupActions {
    fn from_iter<T: IntoIterator<Item = CleanupAction>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl CleanupActions {
    pub fn none() -> Self {
        Self(BTreeSet::new())
    }

    pub fn contains(&self, action: CleanupAction) -> bool {
        self.0.contains(&action)
    }

    pub fn insert(&mut self, action: CleanupAction) {
        self.0.insert(action);
    }

    pub fn remove(&mut self, action: CleanupAction) {
        self.0.remove(&action);
    }

    /// Enables or disables one action.
    pub fn set(&mut self, action: CleanupAction, enabled: bool) {
        if enabled {
            self.insert(action);
        } else {
            self.remove(action);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = CleanupAction> + '_ {
        self.0.iter().copied()
    }

    /// Runs the enabled normalization steps over `text` and returns the result.
    pub fn apply(&self, text: &str) -> String {
        normalize(text, self)
    }
}

/// Applies the enabled steps, in pipeline order, to a copy of `text`.
pub fn normalize(text: &str, actions: &CleanupActions) -> String {
    trace!("Normalizing {} chars with {:?}", text.len(), actions);
    let mut buffer: Vec<char> = text.chars().collect();
    if actions.contains(CleanupAction::StripAnsiCodes) {
        buffer = strip_ansi_codes(&buffer);
    }
    if actions.contains(CleanupAction::ProcessBackspaces) {
        buffer = process_backspaces(&buffer);
    }
    if actions.contains(CleanupAction::ProcessCarriageReturns) {
        process_carriage_returns(&mut buffer);
    }
    if actions.contains(CleanupAction::NormalizeLineEndings) {
        buffer = normalize_line_endings(&buffer);
    }
    buffer.into_iter().collect()
}

fn is_stripped_control(ch: char) -> bool {
    // \b, \t, \n and \r survive: later steps or the reader need them.
    matches!(ch, '\u{0}'..='\u{7}' | '\u{b}'..='\u{c}' | '\u{e}'..='\u{1f}' | '\u{7f}')
}

/// CSI sequences end with a letter in `@`..=`Z` or `a`..=`z`.
fn is_csi_final(ch: char) -> bool {
    matches!(ch, '@'..='Z' | 'a'..='z')
}

fn strip_ansi_codes(input: &[char]) -> Vec<char> {
    let len = input.len();
    let mut out = Vec::with_capacity(len);
    let mut i = 0;
    while i < len {
        let ch = input[i];
        if ch == ESC {
            if i + 1 >= len {
                break;
            }
            match input[i + 1] {
                '[' => {
                    let mut end = i + 2;
                    while end < len {
                        let c = input[end];
                        end += 1;
                        if is_csi_final(c) {
                            break;
                        }
                    }
                    i = end;
                }
                ']' => {
                    let mut end = i + 2;
                    while end < len {
                        if input[end] == BEL {
                            end += 1;
                            break;
                        }
                        if input[end] == ESC && end + 1 < len && input[end + 1] == '\\' {
                            end += 2;
                            break;
                        }
                        end += 1;
                    }
                    i = end;
                }
                // Charset selection: ESC ( X / ESC ) X
                '(' | ')' if i + 2 < len => i += 3,
                // Keypad modes and every other two-char sequence.
                _ => i += 2,
            }
            continue;
        }
        if !is_stripped_control(ch) {
            out.push(ch);
        }
        i += 1;
    }
    out
}

fn process_backspaces(input: &[char]) -> Vec<char> {
    let mut out: Vec<char> = Vec::with_capacity(input.len());
    for &ch in input {
        if ch == BACKSPACE && out.last().is_some_and(|&prev| prev != BACKSPACE) {
            out.pop();
        } else {
            out.push(ch);
        }
    }
    out
}

fn process_carriage_returns(buffer: &mut Vec<char>) {
    let mut i = 0;
    let mut line_start = 0;
    while i < buffer.len() {
        match buffer[i] {
            '\n' => {
                line_start = i + 1;
                i += 1;
            }
            '\r' => {
                let cr_start = i;
                while i < buffer.len() && buffer[i] == '\r' {
                    i += 1;
                }
                let cr_count = i - cr_start;

                let content_start = i;
                let mut content_end = content_start;
                while content_end < buffer.len()
                    && buffer[content_end] != '\r'
                    && buffer[content_end] != '\n'
                {
                    content_end += 1;
                }
                let content_len = content_end - content_start;

                if content_len > 0 {
                    let line_len = cr_start - line_start;
                    let mut rewritten = buffer[content_start..content_end].to_vec();
                    if line_len > content_len {
                        rewritten.extend_from_slice(&buffer[line_start + content_len..cr_start]);
                    }
                    let rewritten_len = rewritten.len();
                    buffer.splice(line_start..content_end, rewritten);
                    i = line_start + rewritten_len;
                } else if cr_count > 1 {
                    buffer.drain(cr_start..cr_start + cr_count);
                    i = cr_start;
                }
                // A single \r before \n or at the end is left for line-ending handling.
            }
            _ => i += 1,
        }
    }
}

fn normalize_line_endings(input: &[char]) -> Vec<char> {
    let multiline = input.contains(&'\n');
    let len = input.len();
    let mut out = Vec::with_capacity(len);
    for (i, &ch) in input.iter().enumerate() {
        if ch == '\r' {
            if i + 1 < len && input[i + 1] == '\n' {
                continue;
            }
            if i + 1 == len && multiline {
                continue;
            }
        }
        out.push(ch);
    }
    out
}
