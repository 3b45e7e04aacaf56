//! Interpreter for TextFSM-style structured-text extraction templates,
//! covering the subset the template store actually uses. Templates using
//! anything else fail to parse and are skipped by the engine.

use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template has no Value definitions")]
    NoValues,
    #[error("template has no Start state")]
    NoStartState,
    #[error("unknown value flag `{0}`")]
    UnknownFlag(String),
    #[error("malformed value definition: `{0}`")]
    BadValue(String),
    #[error("malformed rule: `{0}`")]
    BadRule(String),
    #[error("rule references undefined value `{0}`")]
    UnknownValue(String),
    #[error("state change is not allowed with Continue: `{0}`")]
    ContinueWithState(String),
    #[error("rule transitions to undefined state `{0}`")]
    UnknownState(String),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("template raised Error{}", .0.as_ref().map(|m| format!(": {m}")).unwrap_or_default())]
    Raised(Option<String>),
}

/// A parsed cell. `List`-flagged values accumulate; everything else holds
/// the last match.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Scalar(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Scalar(s) => s.trim().is_empty(),
            FieldValue::List(items) => items.is_empty(),
        }
    }
}

pub type Record = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone)]
struct ValueDef {
    name: String,
    pattern: String,
    required: bool,
    filldown: bool,
    list: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LineOp {
    Next,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RecordOp {
    NoRecord,
    Record,
    Clear,
    Clearall,
}

#[derive(Debug)]
struct Rule {
    regex: Regex,
    /// Values that can capture in this rule.
    value_names: Vec<String>,
    line_op: LineOp,
    record_op: RecordOp,
    new_state: Option<String>,
    error: Option<Option<String>>,
}

#[derive(Debug)]
pub struct TextFsmTemplate {
    values: Vec<ValueDef>,
    states: HashMap<String, Vec<Rule>>,
}

impl TextFsmTemplate {
    pub fn parse(text: &str) -> Result<Self, TemplateError> {
        let mut values: Vec<ValueDef> = Vec::new();
        let mut states: HashMap<String, Vec<Rule>> = HashMap::new();
        let mut current_state: Option<String> = None;

        for raw_line in text.lines() {
            let line = raw_line.trim_end();
            if line.trim().starts_with('#') {
                continue;
            }

            if current_state.is_none() && line.starts_with("Value ") {
                values.push(parse_value(line)?);
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }

            if !line.starts_with(' ') && !line.starts_with('\t') {
                // State header.
                let name = line.trim().to_string();
                states.entry(name.clone()).or_default();
                current_state = Some(name);
                continue;
            }

            let state = current_state
                .clone()
                .ok_or_else(|| TemplateError::BadRule(line.trim().to_string()))?;
            let rule = parse_rule(line.trim(), &values)?;
            states.get_mut(&state).expect("state exists").push(rule);
        }

        if values.is_empty() {
            return Err(TemplateError::NoValues);
        }
        if !states.contains_key("Start") {
            return Err(TemplateError::NoStartState);
        }

        // Transitions must point at defined states (End is implicit).
        for rules in states.values() {
            for rule in rules {
                if let Some(target) = &rule.new_state {
                    if target != "End" && !states.contains_key(target) {
                        return Err(TemplateError::UnknownState(target.clone()));
                    }
                }
            }
        }

        Ok(Self { values, states })
    }

    /// Runs the template over the input and returns the extracted records.
    pub fn run(&self, input: &str) -> Result<Vec<Record>, TemplateError> {
        let mut machine = Machine::new(self);
        for line in input.lines() {
            if !machine.feed(line)? {
                break;
            }
        }
        machine.finish()?;
        Ok(machine.records)
    }
}

struct Machine<'t> {
    template: &'t TextFsmTemplate,
    state: String,
    slots: HashMap<String, FieldValue>,
    records: Vec<Record>,
    ended: bool,
}

impl<'t> Machine<'t> {
    fn new(template: &'t TextFsmTemplate) -> Self {
        Self {
            template,
            state: "Start".to_string(),
            slots: HashMap::new(),
            records: Vec::new(),
            ended: false,
        }
    }

    /// Applies the current state's rules to one line. Returns `false` once
    /// the machine reaches `End`.
    fn feed(&mut self, line: &str) -> Result<bool, TemplateError> {
        let rules = match self.template.states.get(&self.state) {
            Some(rules) => rules,
            None => return Ok(false),
        };

        let mut idx = 0;
        while idx < rules.len() {
            let rule = &rules[idx];
            let Some(caps) = rule.regex.captures(line) else {
                idx += 1;
                continue;
            };

            if let Some(message) = &rule.error {
                return Err(TemplateError::Raised(message.clone()));
            }

            for name in &rule.value_names {
                if let Some(m) = caps.name(name) {
                    self.assign(name, m.as_str());
                }
            }

            match rule.record_op {
                RecordOp::Record => self.try_record(),
                RecordOp::Clear => self.clear(false),
                RecordOp::Clearall => self.clear(true),
                RecordOp::NoRecord => {}
            }

            if let Some(target) = rule.new_state.clone() {
                if target == "End" {
                    self.ended = true;
                    return Ok(false);
                }
                self.state = target;
            }

            match rule.line_op {
                LineOp::Next => return Ok(true),
                LineOp::Continue => idx += 1,
            }
        }
        Ok(true)
    }

    fn finish(&mut self) -> Result<(), TemplateError> {
        if self.ended {
            return Ok(());
        }
        // An explicit EOF state replaces the implicit end-of-input record;
        // its rules run once against an empty line.
        if self.template.states.contains_key("EOF") {
            self.state = "EOF".to_string();
            self.feed("")?;
        } else {
            self.try_record();
        }
        Ok(())
    }

    fn assign(&mut self, name: &str, captured: &str) {
        let def = self
            .template
            .values
            .iter()
            .find(|v| v.name == name)
            .expect("value checked at parse");
        if def.list {
            match self.slots.get_mut(name) {
                Some(FieldValue::List(items)) => items.push(captured.to_string()),
                _ => {
                    self.slots
                        .insert(name.to_string(), FieldValue::List(vec![captured.to_string()]));
                }
            }
        } else {
            self.slots
                .insert(name.to_string(), FieldValue::Scalar(captured.to_string()));
        }
    }

    fn try_record(&mut self) {
        if self.slots.is_empty() {
            return;
        }
        let missing_required = self
            .template
            .values
            .iter()
            .any(|v| v.required && !self.slots.contains_key(&v.name));
        if missing_required {
            self.clear(false);
            return;
        }

        let mut record = Record::new();
        for def in &self.template.values {
            let cell = self.slots.get(&def.name).cloned().unwrap_or_else(|| {
                if def.list {
                    FieldValue::List(Vec::new())
                } else {
                    FieldValue::Scalar(String::new())
                }
            });
            record.insert(def.name.clone(), cell);
        }
        self.records.push(record);
        self.clear(false);
    }

    fn clear(&mut self, include_filldown: bool) {
        let retain: Vec<String> = if include_filldown {
            Vec::new()
        } else {
            self.template
                .values
                .iter()
                .filter(|v| v.filldown)
                .map(|v| v.name.clone())
                .collect()
        };
        self.slots.retain(|name, _| retain.contains(name));
    }
}

fn parse_value(line: &str) -> Result<ValueDef, TemplateError> {
    // Value [flag[,flag]] NAME (pattern)
    let rest = line.strip_prefix("Value ").unwrap_or(line).trim();
    let open = rest
        .find('(')
        .ok_or_else(|| TemplateError::BadValue(line.to_string()))?;
    if !rest.ends_with(')') {
        return Err(TemplateError::BadValue(line.to_string()));
    }
    let pattern = rest[open + 1..rest.len() - 1].to_string();

    let head: Vec<&str> = rest[..open].split_whitespace().collect();
    let (name, flags) = match head.split_last() {
        Some((name, flags)) => (name.to_string(), flags),
        None => return Err(TemplateError::BadValue(line.to_string())),
    };

    let mut def = ValueDef {
        name,
        pattern,
        required: false,
        filldown: false,
        list: false,
    };
    for flag_group in flags {
        for flag in flag_group.split(',') {
            match flag {
                "Required" => def.required = true,
                "Filldown" => def.filldown = true,
                "List" => def.list = true,
                // Uniqueness is a concern for exports, not for scoring.
                "Key" => {}
                other => return Err(TemplateError::UnknownFlag(other.to_string())),
            }
        }
    }
    Ok(def)
}

fn parse_rule(line: &str, values: &[ValueDef]) -> Result<Rule, TemplateError> {
    if !line.starts_with('^') {
        return Err(TemplateError::BadRule(line.to_string()));
    }

    let (pattern_part, action_part) = match line.split_once(" -> ") {
        Some((p, a)) => (p.trim_end(), Some(a.trim())),
        None => (line, None),
    };

    let (expanded, value_names) = expand_pattern(pattern_part, values)?;
    let regex = Regex::new(&expanded)?;

    let mut rule = Rule {
        regex,
        value_names,
        line_op: LineOp::Next,
        record_op: RecordOp::NoRecord,
        new_state: None,
        error: None,
    };

    let Some(action) = action_part else {
        return Ok(rule);
    };

    let mut tokens = action.splitn(2, ' ');
    let op = tokens.next().unwrap_or_default();
    let remainder = tokens.next().map(str::trim);

    let mut op_recognized = true;
    match op {
        "Next" => {}
        "Continue" => rule.line_op = LineOp::Continue,
        "Record" => rule.record_op = RecordOp::Record,
        "NoRecord" => {}
        "Clear" => rule.record_op = RecordOp::Clear,
        "Clearall" => rule.record_op = RecordOp::Clearall,
        "Next.Record" => rule.record_op = RecordOp::Record,
        "Next.NoRecord" => {}
        "Next.Clear" => rule.record_op = RecordOp::Clear,
        "Next.Clearall" => rule.record_op = RecordOp::Clearall,
        "Continue.Record" => {
            rule.line_op = LineOp::Continue;
            rule.record_op = RecordOp::Record;
        }
        "Continue.NoRecord" => rule.line_op = LineOp::Continue,
        "Error" => {
            rule.error = Some(remainder.map(|m| m.trim_matches('"').to_string()));
            return Ok(rule);
        }
        _ => op_recognized = false,
    }

    if op_recognized {
        if let Some(state) = remainder {
            if rule.line_op == LineOp::Continue {
                return Err(TemplateError::ContinueWithState(line.to_string()));
            }
            rule.new_state = Some(state.to_string());
        }
    } else {
        // Bare state name: transition with default ops.
        if op.contains('.') || remainder.is_some() {
            return Err(TemplateError::BadRule(line.to_string()));
        }
        rule.new_state = Some(op.to_string());
    }

    Ok(rule)
}

/// Substitutes `${NAME}` / `$NAME` with named capture groups and `$$` with a
/// literal `$` (which is how templates write the end-of-line anchor).
fn expand_pattern(
    pattern: &str,
    values: &[ValueDef],
) -> Result<(String, Vec<String>), TemplateError> {
    let mut out = String::new();
    let mut used = Vec::new();
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '$' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        // "$$" is a literal dollar, i.e. the regex end anchor.
        if i + 1 < chars.len() && chars[i + 1] == '$' {
            out.push('$');
            i += 2;
            continue;
        }

        let (name, consumed) = if i + 1 < chars.len() && chars[i + 1] == '{' {
            let close = chars[i + 2..]
                .iter()
                .position(|c| *c == '}')
                .ok_or_else(|| TemplateError::BadRule(pattern.to_string()))?;
            let name: String = chars[i + 2..i + 2 + close].iter().collect();
            (name, close + 3)
        } else {
            let name: String = chars[i + 1..]
                .iter()
                .take_while(|c| c.is_ascii_alphanumeric() || **c == '_')
                .collect();
            let len = name.len();
            (name, len + 1)
        };

        if name.is_empty() {
            out.push('$');
            i += 1;
            continue;
        }

        let def = values
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| TemplateError::UnknownValue(name.clone()))?;
        out.push_str(&format!("(?P<{}>{})", def.name, def.pattern));
        used.push(def.name.clone());
        i += consumed;
    }

    Ok((out, used))
}
