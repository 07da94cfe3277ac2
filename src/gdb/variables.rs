//! Trees from GDB's pretty-printed values
//!
//! `print`, `output` and `info locals` produce C-like text such as
//! `{x = 1, y = {a = 2, b = 3}}` or `{1, 2, 3}` rather than MI records. This
//! module turns that text into [`VariableNode`] trees.

use crate::gdb::error::ParseError;
use crate::gdb::tokenizer::{next_token, Token, TokenKind};
use crate::gdb::types::VariableNode;
use tracing::debug;

/// Build the tree for one value.
///
/// Text without a top-level `{` is a leaf. Malformed aggregates also come back
/// as a leaf so one odd value cannot spoil a whole refresh.
pub fn build_tree(name: &str, value: &str) -> VariableNode {
    let value = value.trim();
    let mut node = VariableNode::leaf(name, value);

    let children = find_top_level_brace(value).and_then(|open| match open {
        Some(open) => aggregate_children(value, open).map(Some),
        None => Ok(None),
    });
    match children {
        Ok(Some((children, _))) => node.children = children,
        Ok(None) => {}
        Err(e) => debug!("Keeping `{}` as a leaf: {}", name, e),
    }

    node
}

/// Children of the group at `open`, or none when the group is only a type
/// prefix such as `{int (void)} 0x401126 <main>`.
fn aggregate_children(text: &str, open: usize) -> Result<(Vec<VariableNode>, usize), ParseError> {
    let (children, after) = parse_aggregate(text, open)?;
    if is_type_prefix(text, open, after)? {
        return Ok((Vec::new(), after));
    }
    Ok((children, after))
}

/// A group of bare text followed by more text on the same value.
fn is_type_prefix(text: &str, open: usize, after: usize) -> Result<bool, ParseError> {
    match next_token(text, after)? {
        Some((token, _)) if token.kind == TokenKind::String => {}
        _ => return Ok(false),
    }

    let mut pos = open + 1;
    while let Some((token, next)) = next_token(text, pos)? {
        match token.kind {
            TokenKind::CloseBrace => return Ok(true),
            TokenKind::String if !token.is_quoted(text) => pos = next,
            _ => return Ok(false),
        }
    }
    Ok(false)
}

/// Parse the aggregate whose `{` sits at `open`.
///
/// Returns its fields in encounter order and the offset just past the matching
/// `}`, so a caller can resume scanning its own fields from there.
pub fn parse_aggregate(text: &str, open: usize) -> Result<(Vec<VariableNode>, usize), ParseError> {
    let unbalanced = ParseError::UnbalancedBracket { open: '{', start: open };
    let mut children = Vec::new();
    let mut positional = 0;
    let mut pos = open + 1;

    // GDB elides groups past `max-depth` as `{...}`
    if let Some((token, next)) = next_token(text, pos)? {
        if token.kind == TokenKind::String && token.text(text) == "..." {
            if let Some((close, after)) = next_token(text, next)? {
                if close.kind == TokenKind::CloseBrace {
                    return Ok((children, after));
                }
            }
        }
    }

    loop {
        let Some((token, next)) = next_token(text, pos)? else {
            return Err(unbalanced);
        };

        match token.kind {
            TokenKind::CloseBrace => return Ok((children, next)),
            TokenKind::Comma => pos = next,
            TokenKind::Equal => {
                return Err(ParseError::Unexpected {
                    found: '=',
                    pos: token.start,
                })
            }
            TokenKind::String if !token.is_quoted(text) => match next_token(text, next)? {
                Some((eq, value_start)) if eq.kind == TokenKind::Equal => {
                    let (child, after) = read_field(text, token.text(text), value_start)?;
                    children.push(child);
                    pos = after;
                }
                _ => {
                    let (child, after) = read_positional(text, &mut positional, token)?;
                    children.push(child);
                    pos = after;
                }
            },
            TokenKind::String | TokenKind::OpenBrace => {
                let (child, after) = read_positional(text, &mut positional, token)?;
                children.push(child);
                pos = after;
            }
        }
    }
}

fn read_positional(
    text: &str,
    positional: &mut usize,
    first: Token,
) -> Result<(VariableNode, usize), ParseError> {
    let name = format!("[{}]", *positional);
    *positional += 1;
    read_field(text, &name, first.start)
}

/// Read one field value starting at `start`.
///
/// Stops in front of the `,` or `}` that ends the field; a nested group is
/// parsed recursively and scanning resumes after its closing brace.
fn read_field(text: &str, name: &str, start: usize) -> Result<(VariableNode, usize), ParseError> {
    let mut children = Vec::new();
    let mut value_start = None;
    let mut value_end = start;
    let mut pos = start;

    while let Some((token, next)) = next_token(text, pos)? {
        match token.kind {
            TokenKind::CloseBrace => break,
            TokenKind::Comma => {
                if comma_ends_field(text, next)? {
                    break;
                }
                value_end = token.end;
                pos = next;
            }
            TokenKind::OpenBrace => {
                let (nested, after) = aggregate_children(text, token.start)?;
                children = nested;
                value_start.get_or_insert(token.start);
                value_end = after;
                pos = after;
            }
            TokenKind::String | TokenKind::Equal => {
                value_start.get_or_insert(token.start);
                value_end = token.end;
                pos = next;
            }
        }
    }

    let value = value_start.map_or("", |s| text[s..value_end].trim());
    Ok((
        VariableNode {
            name: name.to_string(),
            value: value.to_string(),
            var_type: None,
            children,
        },
        pos,
    ))
}

/// A comma separates fields only when a closing brace, a `name =` field or
/// another value follows it. Printer summaries such as
/// `std::vector of length 3, capacity 3 = {..}` keep going until their group.
fn comma_ends_field(text: &str, after_comma: usize) -> Result<bool, ParseError> {
    let Some((token, next)) = next_token(text, after_comma)? else {
        return Ok(true);
    };
    if token.kind != TokenKind::String || token.is_quoted(text) {
        return Ok(true);
    }

    let named = matches!(next_token(text, next)?, Some((eq, _)) if eq.kind == TokenKind::Equal);
    if named && is_field_name(token.text(text)) {
        return Ok(true);
    }
    Ok(!reaches_group(text, next)?)
}

/// Field names: identifiers, `[index]` and `<Base>` subobjects.
fn is_field_name(name: &str) -> bool {
    let bracketed = |open, close| name.starts_with(open) && name.ends_with(close);
    if bracketed('[', ']') || bracketed('<', '>') {
        return true;
    }

    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '.' | ':'))
}

/// Whether a `{` comes before the next top-level `,` or `}`.
fn reaches_group(text: &str, mut pos: usize) -> Result<bool, ParseError> {
    while let Some((token, next)) = next_token(text, pos)? {
        match token.kind {
            TokenKind::OpenBrace => return Ok(true),
            TokenKind::Comma | TokenKind::CloseBrace => return Ok(false),
            TokenKind::String | TokenKind::Equal => pos = next,
        }
    }
    Ok(false)
}

fn find_top_level_brace(text: &str) -> Result<Option<usize>, ParseError> {
    let mut pos = 0;
    while let Some((token, next)) = next_token(text, pos)? {
        if token.kind == TokenKind::OpenBrace {
            return Ok(Some(token.start));
        }
        pos = next;
    }
    Ok(None)
}

/// Split console output into entries on newlines outside quotes, char
/// literals and braces.
pub fn split_top_level_lines(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut lines = Vec::new();
    let mut start = 0;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut in_char = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        // Char literals never span lines; a stray apostrophe must not
        // swallow the rest of the block.
        if in_char && b == b'\n' {
            in_char = false;
        }

        if in_string || in_char {
            match b {
                b'\\' => {
                    i += 2;
                    continue;
                }
                b'"' if in_string => in_string = false,
                b'\'' if in_char => in_char = false,
                _ => {}
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'\'' => in_char = true,
                b'{' => depth += 1,
                b'}' => depth = depth.saturating_sub(1),
                b'\n' if depth == 0 => {
                    push_line(&mut lines, &text[start..i]);
                    start = i + 1;
                }
                _ => {}
            }
        }
        i += 1;
    }
    push_line(&mut lines, &text[start.min(text.len())..]);

    lines
}

fn push_line<'a>(lines: &mut Vec<&'a str>, line: &'a str) {
    let line = line.trim();
    if !line.is_empty() {
        lines.push(line);
    }
}

/// Split a `name = value` entry at its first top-level `=`.
pub fn parse_name_value(line: &str) -> Option<(&str, &str)> {
    let (name, next) = next_token(line, 0).ok()??;
    if name.kind != TokenKind::String || name.is_quoted(line) {
        return None;
    }
    let (eq, value_start) = next_token(line, next).ok()??;
    if eq.kind != TokenKind::Equal {
        return None;
    }
    Some((name.text(line), line[value_start..].trim()))
}

/// Parse an `info locals` / `info args` block into trees.
///
/// Lines that are not `name = value` entries (`No locals.`) are skipped.
pub fn parse_variable_block(text: &str) -> Vec<VariableNode> {
    split_top_level_lines(text)
        .into_iter()
        .filter_map(parse_name_value)
        .map(|(name, value)| build_tree(name, value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(node: &VariableNode) -> Vec<&str> {
        node.children.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn test_scalar_is_leaf() {
        let node = build_tree("n", "42");
        assert_eq!(node.value, "42");
        assert!(node.children.is_empty());

        let node = build_tree("p", "0x4006f4 \"{not, a = struct}\"");
        assert!(node.children.is_empty());

        let node = build_tree("f", "(int (*)(int)) 0x401136 <square(int)>");
        assert!(node.children.is_empty());
    }

    #[test]
    fn test_named_fields() {
        let node = build_tree("p", "{a = 1, b = 2}");
        assert_eq!(names(&node), vec!["a", "b"]);
        assert_eq!(node.children[0].value, "1");
        assert_eq!(node.children[1].value, "2");
        assert_eq!(node.value, "{a = 1, b = 2}");
    }

    #[test]
    fn test_positional_elements() {
        let node = build_tree("arr", "{1, 2, 3}");
        assert_eq!(names(&node), vec!["[0]", "[1]", "[2]"]);
        assert_eq!(node.children[2].value, "3");
    }

    #[test]
    fn test_nested_aggregate_resumes_after_group() {
        let node = build_tree("s", "{a = {x = 1, y = 2}, b = 3}");
        assert_eq!(names(&node), vec!["a", "b"]);
        assert_eq!(names(&node.children[0]), vec!["x", "y"]);
        assert_eq!(node.children[0].value, "{x = 1, y = 2}");
        assert_eq!(node.children[1].value, "3");
        assert!(node.children[1].children.is_empty());
    }

    #[test]
    fn test_positional_aggregates() {
        let node = build_tree("pts", "{{x = 1, y = 2}, {x = 3, y = 4}}");
        assert_eq!(names(&node), vec!["[0]", "[1]"]);
        assert_eq!(names(&node.children[1]), vec!["x", "y"]);
        assert_eq!(node.children[1].children[0].value, "3");
    }

    #[test]
    fn test_embedded_commas_do_not_split() {
        let node = build_tree(
            "w",
            r#"{s = "a, b = c", c = 44 ',', t = std::pair<int, int>, f = 0x1 <f(int, int)>}"#,
        );
        assert_eq!(names(&node), vec!["s", "c", "t", "f"]);
        assert_eq!(node.children[0].value, r#""a, b = c""#);
        assert_eq!(node.children[1].value, "44 ','");
        assert_eq!(node.children[2].value, "std::pair<int, int>");
        assert_eq!(node.children[3].value, "0x1 <f(int, int)>");
    }

    #[test]
    fn test_container_printer_output() {
        let node = build_tree("v", "std::vector of length 3, capacity 4 = {10, 20, 30}");
        assert_eq!(names(&node), vec!["[0]", "[1]", "[2]"]);
        assert_eq!(node.value, "std::vector of length 3, capacity 4 = {10, 20, 30}");

        let node = build_tree("m", "std::map with 2 elements = {[1] = \"one\", [2] = \"two\"}");
        assert_eq!(names(&node), vec!["[1]", "[2]"]);
        assert_eq!(node.children[1].value, "\"two\"");
    }

    #[test]
    fn test_container_printers_as_members() {
        let node = build_tree("s", "{v = std::vector of length 3, capacity 3 = {1, 2, 3}, k = 2}");
        assert_eq!(names(&node), vec!["v", "k"]);
        assert_eq!(node.children[0].value, "std::vector of length 3, capacity 3 = {1, 2, 3}");
        assert_eq!(names(&node.children[0]), vec!["[0]", "[1]", "[2]"]);
        assert_eq!(node.children[1].value, "2");

        let node = build_tree(
            "t",
            "{m = std::map with 2 elements = {[1] = \"one\", [2] = \"two\"}, vs = {std::vector of length 1, capacity 1 = {7}, std::vector of length 2, capacity 2 = {8, 9}}, n = 0}",
        );
        assert_eq!(names(&node), vec!["m", "vs", "n"]);
        assert_eq!(names(&node.children[0]), vec!["[1]", "[2]"]);
        assert_eq!(names(&node.children[1]), vec!["[0]", "[1]"]);
        assert_eq!(names(&node.children[1].children[1]), vec!["[0]", "[1]"]);
        assert_eq!(node.children[2].value, "0");
    }

    #[test]
    fn test_function_value_is_leaf() {
        let node = build_tree("main", "{int (void)} 0x401126 <main>");
        assert_eq!(node.value, "{int (void)} 0x401126 <main>");
        assert!(node.children.is_empty());

        let node = build_tree("ops", "{cb = {void (int)} 0x401136 <on_event(int)>, n = 1}");
        assert_eq!(names(&node), vec!["cb", "n"]);
        assert_eq!(node.children[0].value, "{void (int)} 0x401136 <on_event(int)>");
        assert!(node.children[0].children.is_empty());
    }

    #[test]
    fn test_repeats_and_truncation() {
        let node = build_tree("buf", r#"{0 <repeats 15 times>, 7}"#);
        assert_eq!(names(&node), vec!["[0]", "[1]"]);
        assert_eq!(node.children[0].value, "0 <repeats 15 times>");

        let node = build_tree("s", r#"{name = "abcdefgh"..., len = 300}"#);
        assert_eq!(node.children[0].value, r#""abcdefgh"..."#);
        assert_eq!(node.children[1].value, "300");
    }

    #[test]
    fn test_base_class_and_elided_group() {
        let node = build_tree("d", "{<Base> = {id = 7}, deep = {...}, z = 0}");
        assert_eq!(names(&node), vec!["<Base>", "deep", "z"]);
        assert_eq!(names(&node.children[0]), vec!["id"]);
        assert_eq!(node.children[1].value, "{...}");
        assert!(node.children[1].children.is_empty());
    }

    #[test]
    fn test_empty_aggregate() {
        let node = build_tree("e", "{}");
        assert_eq!(node.value, "{}");
        assert!(node.children.is_empty());
    }

    #[test]
    fn test_unbalanced_aggregate_degrades_to_leaf() {
        let node = build_tree("bad", "{a = 1, b = {c = 2}");
        assert_eq!(node.value, "{a = 1, b = {c = 2}");
        assert!(node.children.is_empty());
    }

    #[test]
    fn test_parse_aggregate_returns_offset() {
        let text = "{a = 1} trailing";
        let (children, after) = parse_aggregate(text, 0).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(&text[after..], " trailing");
    }

    #[test]
    fn test_split_lines_with_embedded_newline() {
        let block = "x = 1\ny = \"he said \\\"hi\\\"\nbye\"\n";
        let lines = split_top_level_lines(block);
        assert_eq!(lines.len(), 2);

        let entries: Vec<_> = lines.iter().filter_map(|l| parse_name_value(l)).collect();
        assert_eq!(entries[0], ("x", "1"));
        assert_eq!(entries[1].0, "y");
        assert_eq!(entries[1].1, "\"he said \\\"hi\\\"\nbye\"");
    }

    #[test]
    fn test_split_lines_respects_braces_and_stray_apostrophes() {
        let block = "p = {\n  x = 1,\n  y = 2\n}\nmsg = <error: can't read>\nq = 3\n";
        let lines = split_top_level_lines(block);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("p = {"));
        assert_eq!(lines[2], "q = 3");
    }

    #[test]
    fn test_parse_variable_block() {
        let nodes = parse_variable_block("No locals.\n");
        assert!(nodes.is_empty());

        let nodes = parse_variable_block("count = 3\npt = {x = 1, y = 2}\n");
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "count");
        assert_eq!(names(&nodes[1]), vec!["x", "y"]);
    }

    #[test]
    fn test_parse_is_deterministic() {
        let text = "a = {b = {c = {1, 2}}, d = \"x\"}\nz = 0\n";
        assert_eq!(parse_variable_block(text), parse_variable_block(text));
    }
}
