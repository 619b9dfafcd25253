//! Just enough of the XML property list format for job definitions.

use crate::scheduler::{escape_xml, unescape_xml};

const HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
"#;

/// Keys keep their insertion order so rendered files are stable.
pub type Dict = Vec<(String, Value)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    Integer(i64),
    Bool(bool),
    Array(Vec<Value>),
    Dict(Dict),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(dict) => Some(dict),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

pub fn get<'a>(dict: &'a Dict, key: &str) -> Option<&'a Value> {
    dict.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

/// Render a top-level dictionary as a complete plist document.
pub fn to_document(root: &Dict) -> String {
    let mut out = String::from(HEADER);
    render_dict(&mut out, root, 0);
    out.push_str("</plist>\n");
    out
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push('\t');
    }
}

fn render_dict(out: &mut String, dict: &Dict, depth: usize) {
    indent(out, depth);
    out.push_str("<dict>\n");
    for (key, value) in dict {
        indent(out, depth + 1);
        out.push_str(&format!("<key>{}</key>\n", escape_xml(key)));
        render_value(out, value, depth + 1);
    }
    indent(out, depth);
    out.push_str("</dict>\n");
}

fn render_value(out: &mut String, value: &Value, depth: usize) {
    match value {
        Value::Dict(dict) => render_dict(out, dict, depth),
        Value::Array(items) => {
            indent(out, depth);
            out.push_str("<array>\n");
            for item in items {
                render_value(out, item, depth + 1);
            }
            indent(out, depth);
            out.push_str("</array>\n");
        }
        Value::String(s) => {
            indent(out, depth);
            out.push_str(&format!("<string>{}</string>\n", escape_xml(s)));
        }
        Value::Integer(i) => {
            indent(out, depth);
            out.push_str(&format!("<integer>{}</integer>\n", i));
        }
        Value::Bool(b) => {
            indent(out, depth);
            out.push_str(if *b { "<true/>\n" } else { "<false/>\n" });
        }
    }
}

/// Parse a plist document whose root is a dictionary.
pub fn parse(content: &str) -> Result<Dict, String> {
    let mut reader = Reader { text: content, pos: 0 };
    loop {
        let tag = reader.next_tag().ok_or("no <plist> element")?;
        if tag.name == "plist" {
            break;
        }
    }
    let tag = reader.next_tag().ok_or("empty <plist> element")?;
    match reader.value(tag)? {
        Value::Dict(dict) => Ok(dict),
        _ => Err("the root element is not a <dict>".to_string()),
    }
}

struct Tag<'a> {
    name: &'a str,
    empty: bool,
}

struct Reader<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Next element tag, skipping text, declarations and comments.
    fn next_tag(&mut self) -> Option<Tag<'a>> {
        let text = self.text;
        loop {
            let start = self.pos + text[self.pos..].find('<')?;
            let end = start + text[start..].find('>')?;
            self.pos = end + 1;
            let inner = text[start + 1..end].trim();
            if inner.starts_with('?') || inner.starts_with('!') {
                continue;
            }
            let (inner, empty) = match inner.strip_suffix('/') {
                Some(inner) => (inner.trim_end(), true),
                None => (inner, false),
            };
            let name = inner.split_whitespace().next().unwrap_or_default();
            return Some(Tag { name, empty });
        }
    }

    /// Raw text up to the closing tag of `name`, which is consumed.
    fn text_until(&mut self, name: &str) -> Result<String, String> {
        let close = format!("</{}>", name);
        let end = self.text[self.pos..]
            .find(&close)
            .ok_or_else(|| format!("unterminated <{}>", name))?;
        let raw = &self.text[self.pos..self.pos + end];
        self.pos += end + close.len();
        Ok(unescape_xml(raw))
    }

    fn value(&mut self, tag: Tag<'a>) -> Result<Value, String> {
        match (tag.name, tag.empty) {
            ("true", _) => Ok(Value::Bool(true)),
            ("false", _) => Ok(Value::Bool(false)),
            ("string", true) => Ok(Value::String(String::new())),
            ("string", false) => self.text_until("string").map(Value::String),
            ("integer", false) => {
                let text = self.text_until("integer")?;
                text.trim()
                    .parse()
                    .map(Value::Integer)
                    .map_err(|_| format!("invalid integer {:?}", text))
            }
            ("array", true) => Ok(Value::Array(Vec::new())),
            ("array", false) => {
                let mut items = Vec::new();
                loop {
                    let tag = self.next_tag().ok_or("unterminated <array>")?;
                    if tag.name == "/array" {
                        return Ok(Value::Array(items));
                    }
                    items.push(self.value(tag)?);
                }
            }
            ("dict", true) => Ok(Value::Dict(Vec::new())),
            ("dict", false) => {
                let mut dict = Vec::new();
                loop {
                    let tag = self.next_tag().ok_or("unterminated <dict>")?;
                    match tag.name {
                        "/dict" => return Ok(Value::Dict(dict)),
                        "key" => {
                            let key = self.text_until("key")?;
                            let tag = self.next_tag().ok_or_else(|| format!("no value for key {:?}", key))?;
                            dict.push((key, self.value(tag)?));
                        }
                        other => return Err(format!("expected <key>, found <{}>", other)),
                    }
                }
            }
            (other, _) => Err(format!("unsupported element <{}>", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dict {
        vec![
            ("Label".to_string(), Value::from("resticsched.backup.home")),
            (
                "ProgramArguments".to_string(),
                Value::Array(vec![Value::from("/usr/local/bin/resticprofile"), Value::from("--name")]),
            ),
            (
                "EnvironmentVariables".to_string(),
                Value::Dict(vec![("RESTIC_PASSWORD".to_string(), Value::from("a<b&c"))]),
            ),
            ("Nice".to_string(), Value::Integer(-5)),
            ("LowPriorityIO".to_string(), Value::Bool(true)),
            ("StartCalendarInterval".to_string(), Value::Array(Vec::new())),
        ]
    }

    #[test]
    fn test_document_layout() {
        let document = to_document(&sample());
        assert!(document.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<!DOCTYPE plist"));
        assert!(document.contains("<plist version=\"1.0\">\n<dict>\n\t<key>Label</key>\n\t<string>resticsched.backup.home</string>\n"));
        assert!(document.contains("\t<array>\n\t\t<string>/usr/local/bin/resticprofile</string>\n"));
        assert!(document.contains("<string>a&lt;b&amp;c</string>"));
        assert!(document.contains("<integer>-5</integer>"));
        assert!(document.contains("<true/>"));
        assert!(document.ends_with("</dict>\n</plist>\n"));
    }

    #[test]
    fn test_parse_reads_back_rendered_document() {
        assert_eq!(parse(&to_document(&sample())).unwrap(), sample());
    }

    #[test]
    fn test_parse_foreign_layout() {
        let content = r#"<?xml version="1.0" encoding="UTF-8"?>
<!-- edited by hand -->
<plist version="1.0"><dict><key>Label</key><string>x</string><key>Disabled</key><false /><key>Empty</key><string/><key>KeepAlive</key><dict/></dict></plist>"#;
        let dict = parse(content).unwrap();
        assert_eq!(get(&dict, "Label").and_then(Value::as_str), Some("x"));
        assert_eq!(get(&dict, "Disabled").and_then(Value::as_bool), Some(false));
        assert_eq!(get(&dict, "Empty").and_then(Value::as_str), Some(""));
        assert_eq!(get(&dict, "KeepAlive").and_then(Value::as_dict).map(Vec::len), Some(0));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("<plist><array></array></plist>").is_err());
        assert!(parse("<plist><dict><key>Nice</key><integer>x</integer></dict></plist>").is_err());
        assert!(parse("<plist><dict><key>Label</key><string>x</dict></plist>").is_err());
        assert!(parse("<plist><dict><key>Data</key><data>AA==</data></dict></plist>").is_err());
    }
}
