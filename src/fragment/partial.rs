//! Tolerant parsing of a JSON document that is still being streamed.
//!
//! The repaired document keeps the longest prefix that ends on a complete
//! value (or inside a string value) and closes whatever is still open.
//! Dangling keys, colons, commas and half-written literals are dropped.

use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Frame {
    Object,
    Array,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Expect {
    Value,
    Key,
    Colon,
    Separator,
}

struct Cut {
    end: usize,
    frames: Vec<Frame>,
    open_string: bool,
}

impl Cut {
    fn at(end: usize, frames: &[Frame], open_string: bool) -> Self {
        Self {
            end,
            frames: frames.to_vec(),
            open_string,
        }
    }
}

enum StringEnd {
    /// Index just past the closing quote.
    Closed(usize),
    /// Input ended inside the string; index of the last safe byte boundary.
    Open(usize),
}

/// Parse `input` as JSON, repairing a truncated tail if needed.
pub fn parse_partial_json(input: &str) -> Option<Value> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }
    let repaired = repair(trimmed)?;
    serde_json::from_str(&repaired).ok()
}

fn scan_string(bytes: &[u8], start: usize) -> StringEnd {
    let mut j = start;
    while j < bytes.len() {
        match bytes[j] {
            b'"' => return StringEnd::Closed(j + 1),
            b'\\' => {
                if j + 1 >= bytes.len() {
                    return StringEnd::Open(j);
                }
                if bytes[j + 1] == b'u' {
                    if j + 6 > bytes.len() {
                        return StringEnd::Open(j);
                    }
                    j += 6;
                } else {
                    j += 2;
                }
            }
            _ => j += 1,
        }
    }
    StringEnd::Open(bytes.len())
}

fn is_scalar(token: &str) -> bool {
    serde_json::from_str::<Value>(token)
        .is_ok_and(|v| v.is_number() || v.is_boolean() || v.is_null())
}

fn is_delimiter(b: u8) -> bool {
    matches!(b, b',' | b'}' | b']' | b' ' | b'\t' | b'\n' | b'\r')
}

/// Close a truncated JSON document. Returns `None` when no complete value
/// has started yet.
pub fn repair(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut stack: Vec<Frame> = Vec::new();
    let mut expect = Expect::Value;
    let mut cut: Option<Cut> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b' ' | b'\t' | b'\n' | b'\r' => i += 1,
            b'{' | b'[' if expect == Expect::Value => {
                if b == b'{' {
                    stack.push(Frame::Object);
                    expect = Expect::Key;
                } else {
                    stack.push(Frame::Array);
                    expect = Expect::Value;
                }
                i += 1;
                cut = Some(Cut::at(i, &stack, false));
            }
            b'}' | b']' => {
                let want = if b == b'}' { Frame::Object } else { Frame::Array };
                if stack.last() != Some(&want) || expect == Expect::Colon {
                    break;
                }
                stack.pop();
                i += 1;
                expect = Expect::Separator;
                cut = Some(Cut::at(i, &stack, false));
                if stack.is_empty() {
                    break;
                }
            }
            b'"' if matches!(expect, Expect::Key | Expect::Value) => {
                let is_key = expect == Expect::Key;
                match scan_string(bytes, i + 1) {
                    StringEnd::Closed(end) => {
                        i = end;
                        if is_key {
                            expect = Expect::Colon;
                        } else {
                            expect = Expect::Separator;
                            cut = Some(Cut::at(i, &stack, false));
                        }
                    }
                    StringEnd::Open(safe_end) => {
                        if !is_key {
                            cut = Some(Cut::at(safe_end, &stack, true));
                        }
                        break;
                    }
                }
                if stack.is_empty() {
                    break;
                }
            }
            b':' if expect == Expect::Colon => {
                expect = Expect::Value;
                i += 1;
            }
            b',' if expect == Expect::Separator => {
                expect = match stack.last() {
                    Some(Frame::Object) => Expect::Key,
                    _ => Expect::Value,
                };
                i += 1;
            }
            _ if expect == Expect::Value => {
                let start = i;
                while i < bytes.len() && !is_delimiter(bytes[i]) {
                    i += 1;
                }
                if !is_scalar(&input[start..i]) {
                    break;
                }
                expect = Expect::Separator;
                cut = Some(Cut::at(i, &stack, false));
                if stack.is_empty() {
                    break;
                }
            }
            _ => break,
        }
    }

    let cut = cut?;
    let mut out = String::with_capacity(cut.end + cut.frames.len() + 1);
    out.push_str(&input[..cut.end]);
    if cut.open_string {
        out.push('"');
    }
    for frame in cut.frames.iter().rev() {
        out.push(match frame {
            Frame::Object => '}',
            Frame::Array => ']',
        });
    }
    Some(out)
}
