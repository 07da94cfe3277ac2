//! GDB Machine Interface (MI) Parser
//!
//! Classifies GDB/MI output lines into records and parses the `key=value`
//! tail of each record into [`MiValue`] trees.

use crate::gdb::error::ParseError;
use crate::gdb::tokenizer::{find_matching, scan_quoted, unescape};
use crate::gdb::types::*;
use regex::Regex;
use tracing::debug;

/// GDB/MI Parser
pub struct MiParser {
    result_pattern: Regex,
    async_pattern: Regex,
    notification_pattern: Regex,
    stream_pattern: Regex,
}

impl MiParser {
    pub fn new() -> Self {
        Self {
            // Result record: 12^done,...
            result_pattern: Regex::new(r"^(\d*)\^([\w-]+)(.*)$").expect("result pattern"),
            // Async record: *stopped, *running
            async_pattern: Regex::new(r"^(\d*)\*([\w-]+)(.*)$").expect("async pattern"),
            // Notification: =thread-group-exited, etc.
            notification_pattern: Regex::new(r"^(\d*)=([\w-]+)(.*)$").expect("notify pattern"),
            // Stream output: ~"..." console, @"..." target, &"..." log
            stream_pattern: Regex::new(r#"^([~@&])(".*")$"#).expect("stream pattern"),
        }
    }

    /// Parse a single line of GDB/MI output.
    ///
    /// Blank lines and the `(gdb)` prompt yield `None`. Lines that are not MI
    /// at all are inferior output sharing the debugger's terminal.
    pub fn parse_line(&self, line: &str) -> Result<Option<MiOutputRecord>, ParseError> {
        let line = line.trim_end();
        if line.trim().is_empty() || line.trim() == "(gdb)" {
            return Ok(None);
        }

        if let Some(caps) = self.result_pattern.captures(line) {
            let token = caps[1].parse::<u64>().ok();
            let class = ResultClass::from(&caps[2]);
            let results = parse_results(&caps[3])?;
            return Ok(Some(MiOutputRecord::Result { token, class, results }));
        }

        if let Some(caps) = self.async_pattern.captures(line) {
            let token = caps[1].parse::<u64>().ok();
            let class = AsyncClass::from(&caps[2]);
            let results = parse_results(&caps[3])?;
            return Ok(Some(MiOutputRecord::Async { token, class, results }));
        }

        if let Some(caps) = self.notification_pattern.captures(line) {
            let class = NotificationClass::from(&caps[2]);
            let results = parse_results(&caps[3])?;
            return Ok(Some(MiOutputRecord::Notification { class, results }));
        }

        if let Some(caps) = self.stream_pattern.captures(line) {
            let quoted = &caps[2];
            if scan_quoted(quoted, 0)? != quoted.len() {
                return Err(ParseError::Unexpected {
                    found: '"',
                    pos: 1,
                });
            }
            let content = unescape(&quoted[1..quoted.len() - 1]);
            return Ok(Some(match &caps[1] {
                "~" => MiOutputRecord::Console(content),
                "@" => MiOutputRecord::Target(content),
                _ => MiOutputRecord::Log(content),
            }));
        }

        Ok(Some(MiOutputRecord::Target(line.to_string())))
    }
}

impl Default for MiParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the results tail of a record, e.g. `,bkpt={number="1"}`.
pub fn parse_results(input: &str) -> Result<MiTuple, ParseError> {
    let mut tuple = MiTuple::new();
    let bytes = input.as_bytes();
    let mut pos = skip_ws(input, 0);
    if bytes.get(pos) == Some(&b',') {
        pos += 1;
    }

    let mut last_key: Option<String> = None;

    loop {
        pos = skip_ws(input, pos);
        if pos >= bytes.len() {
            break;
        }

        let next = if matches!(bytes[pos], b'{' | b'[' | b'"') {
            // mi2 prints extra breakpoint locations as bare tuples after
            // `bkpt={..}`
            let key = last_key.as_deref().ok_or(ParseError::ExpectedEqual(pos))?;
            let (value, next) = parse_value(input, pos)?;
            fold_extra_value(&mut tuple, key, value);
            next
        } else {
            let key_end = input[pos..]
                .find('=')
                .map(|i| pos + i)
                .ok_or(ParseError::ExpectedEqual(pos))?;
            let key = input[pos..key_end].trim();
            if key.is_empty() || !is_identifier(key) {
                return Err(ParseError::ExpectedEqual(pos));
            }

            let (value, next) = parse_value(input, key_end + 1)?;
            tuple.insert(key, value);
            last_key = Some(key.to_string());
            next
        };

        pos = skip_ws(input, next);
        match bytes.get(pos) {
            None => break,
            Some(b',') => pos += 1,
            Some(&other) => {
                return Err(ParseError::Unexpected {
                    found: char::from(other),
                    pos,
                })
            }
        }
    }

    Ok(tuple)
}

/// Attach a bare value to the result before it.
///
/// Tuples gain a `locations` list, the shape GDB uses once multi-location
/// output is fixed; any other value turns into a list.
fn fold_extra_value(tuple: &mut MiTuple, key: &str, extra: MiValue) {
    match tuple.get_mut(key) {
        Some(MiValue::Object(first)) => {
            if let Some(MiValue::List(locations)) = first.get_mut("locations") {
                locations.push(extra);
            } else {
                first.insert("locations", MiValue::List(vec![extra]));
            }
        }
        Some(MiValue::List(items)) => items.push(extra),
        Some(other) => {
            let first = std::mem::replace(other, MiValue::List(Vec::new()));
            *other = MiValue::List(vec![first, extra]);
        }
        None => tuple.insert(key, extra),
    }
}

/// Parse one value starting at `pos`; returns it with the offset after it.
fn parse_value(input: &str, pos: usize) -> Result<(MiValue, usize), ParseError> {
    let pos = skip_ws(input, pos);
    match input.as_bytes().get(pos) {
        Some(b'"') => {
            let end = scan_quoted(input, pos)?;
            Ok((MiValue::Scalar(unescape(&input[pos + 1..end - 1])), end))
        }
        Some(b'{') => {
            let close = find_matching(input, pos)?;
            let inner = parse_results(&input[pos + 1..close])?;
            Ok((MiValue::Object(inner), close + 1))
        }
        Some(b'[') => {
            let close = find_matching(input, pos)?;
            let items = split_top_level(&input[pos + 1..close])?
                .into_iter()
                .map(parse_list_item)
                .collect::<Result<Vec<_>, _>>()?;
            Ok((MiValue::List(items), close + 1))
        }
        _ => {
            // Bare scalar, up to the next separator
            let end = input[pos..]
                .find([',', '}', ']'])
                .map(|i| pos + i)
                .unwrap_or(input.len());
            Ok((MiValue::Scalar(input[pos..end].trim().to_string()), end))
        }
    }
}

/// A list item is either a plain value or a `name=value` result.
///
/// Results become one-entry objects, so `[frame={..},frame={..}]` parses to a
/// list of `{frame: {..}}` objects.
fn parse_list_item(item: &str) -> Result<MiValue, ParseError> {
    if let Some(eq) = item.find('=') {
        let key = &item[..eq];
        if is_identifier(key) {
            let (value, _) = parse_value(item, eq + 1)?;
            let mut tuple = MiTuple::new();
            tuple.insert(key, value);
            return Ok(MiValue::Object(tuple));
        }
    }
    parse_value(item, 0).map(|(value, _)| value)
}

/// Split a bracket interior on top-level commas.
fn split_top_level(inner: &str) -> Result<Vec<&str>, ParseError> {
    let bytes = inner.as_bytes();
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i = scan_quoted(inner, i)?;
                continue;
            }
            b'{' | b'[' => depth += 1,
            b'}' | b']' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                items.push(inner[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    items.push(inner[start..].trim());
    items.retain(|item| !item.is_empty());

    Ok(items)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn skip_ws(input: &str, pos: usize) -> usize {
    let bytes = input.as_bytes();
    let mut i = pos;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// Quote a string as an MI C-string.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

impl MiValue {
    /// Render as MI text.
    pub fn to_mi(&self) -> String {
        match self {
            MiValue::Scalar(s) => quote(s),
            MiValue::Object(tuple) => format!("{{{}}}", tuple.to_mi()),
            MiValue::List(items) => {
                let items: Vec<String> = items.iter().map(MiValue::to_mi).collect();
                format!("[{}]", items.join(","))
            }
        }
    }
}

impl MiTuple {
    /// Render as an MI results list (`a="1",b={...}`).
    pub fn to_mi(&self) -> String {
        let parts: Vec<String> = self
            .iter()
            .map(|(k, v)| format!("{}={}", k, v.to_mi()))
            .collect();
        parts.join(",")
    }
}

/// The `msg` of an error reply.
pub fn error_message(results: &MiTuple) -> String {
    results
        .get_str("msg")
        .map(str::to_string)
        .unwrap_or_else(|| "Unknown error".to_string())
}

/// Parse breakpoint from a `break-insert` reply
pub fn parse_breakpoint(results: &MiTuple) -> Option<Breakpoint> {
    results.get_tuple("bkpt").and_then(parse_breakpoint_from_tuple)
}

fn parse_breakpoint_from_tuple(tuple: &MiTuple) -> Option<Breakpoint> {
    // `<MULTIPLE>` breakpoints carry their source position on each location
    let location = tuple
        .get_list("locations")
        .and_then(|locations| locations.first())
        .and_then(MiValue::as_tuple);
    let field = |key: &str| tuple.get_str(key).or_else(|| location?.get_str(key));

    Some(Breakpoint {
        number: tuple.get_str("number")?.to_string(),
        file: field("file").unwrap_or_default().to_string(),
        line: field("line").and_then(|s| s.parse().ok()).unwrap_or(0),
        func: field("func").map(str::to_string),
        addr: tuple.get_str("addr").map(str::to_string),
    })
}

/// Parse the rows of a `break-list` BreakpointTable
pub fn parse_breakpoint_list(results: &MiTuple) -> Vec<Breakpoint> {
    let Some(body) = results
        .get_tuple("BreakpointTable")
        .and_then(|table| table.get_list("body"))
    else {
        return Vec::new();
    };

    let breakpoints: Vec<Breakpoint> = body
        .iter()
        .filter_map(MiValue::as_tuple)
        .filter_map(|row| row.get_tuple("bkpt").or(Some(row)))
        .filter_map(parse_breakpoint_from_tuple)
        .collect();

    debug!("Parsed {} breakpoints", breakpoints.len());
    breakpoints
}

/// Parse a frame tuple
pub fn parse_frame(tuple: &MiTuple) -> Frame {
    Frame {
        level: tuple.get_str("level").and_then(|s| s.parse().ok()).unwrap_or(0),
        function: tuple.get_str("func").map(str::to_string),
        file: tuple.get_str("file").map(str::to_string),
        fullname: tuple.get_str("fullname").map(str::to_string),
        line: tuple.get_str("line").and_then(|s| s.parse().ok()),
        addr: tuple.get_str("addr").map(str::to_string),
    }
}

/// Parse stack frames from a `stack-list-frames` reply
pub fn parse_stack_frames(results: &MiTuple) -> Vec<Frame> {
    results
        .get_list("stack")
        .unwrap_or_default()
        .iter()
        .filter_map(MiValue::as_tuple)
        .map(|item| item.get_tuple("frame").unwrap_or(item))
        .map(parse_frame)
        .collect()
}

/// A global symbol reported by `symbol-info-variables`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolVariable {
    pub name: String,
    pub type_name: Option<String>,
    pub file: Option<String>,
}

/// Parse debug symbols from a `symbol-info-variables` reply
pub fn parse_symbol_variables(results: &MiTuple) -> Vec<SymbolVariable> {
    let Some(files) = results
        .get_tuple("symbols")
        .and_then(|symbols| symbols.get_list("debug"))
    else {
        return Vec::new();
    };

    let mut variables = Vec::new();
    for file in files.iter().filter_map(MiValue::as_tuple) {
        let filename = file.get_str("filename").map(str::to_string);
        for symbol in file
            .get_list("symbols")
            .unwrap_or_default()
            .iter()
            .filter_map(MiValue::as_tuple)
        {
            if let Some(name) = symbol.get_str("name") {
                variables.push(SymbolVariable {
                    name: name.to_string(),
                    type_name: symbol.get_str("type").map(str::to_string),
                    file: filename.clone(),
                });
            }
        }
    }
    variables
}
