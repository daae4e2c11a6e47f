//! Apache `LogFormat` template compiler.
//!
//! Turns a `LogFormat` directive string like `%h %l %u %t "%r" %>s %b` into
//! an anchored regex whose named captures become the record schema.

use crate::error::{Error, Result};

/// Built-in log types selectable with `-t/--type`.
pub const PRESETS: &[(&str, &str)] = &[
    ("apache-common", "%h %l %u %t \"%r\" %>s %b"),
    ("apache-common-vhost", "%v %h %l %u %t \"%r\" %>s %b"),
    (
        "ncsa-combined",
        "%h %l %u %t \"%r\" %>s %b \"%{Referer}i\" \"%{User-agent}i\"",
    ),
    ("referer", "%{Referer}i -> %U"),
    ("agent", "%{User-agent}i"),
    ("syslog", "%{%b %d %H:%M:%S}t %h %v[%P]: %M"),
];

/// Look up a preset template by name.
pub fn preset(name: &str) -> Option<&'static str> {
    PRESETS.iter().find(|(n, _)| *n == name).map(|(_, t)| *t)
}

/// Value kind of an extracted field. Decided by the directive table, not by
/// content sniffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Str,
    Int,
    /// Raw timestamp text. Kept as a string: strptime-style parsing during
    /// extraction is a large throughput hit.
    Date,
}

/// One column of the record schema: a snake_case name plus its value kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
}

/// Output of the compiler: an anchored pattern matching a whole log line and
/// the ordered capture list that becomes the schema.
#[derive(Debug, Clone)]
pub struct CompiledFormat {
    pub pattern: String,
    pub fields: Vec<FieldDef>,
}

/// Value classes a directive can match.
#[derive(Debug, Clone, Copy)]
enum Class {
    Host,
    Number,
    NumberOrNil,
    Str,
    CommonTime,
    ConnStatus,
    Any,
}

impl Class {
    fn kind(self) -> FieldKind {
        match self {
            Class::Number | Class::NumberOrNil => FieldKind::Int,
            Class::CommonTime => FieldKind::Date,
            _ => FieldKind::Str,
        }
    }

    /// Emit the named capture for this class. The date class keeps its
    /// surrounding brackets outside the capture.
    fn capture(self, name: &str) -> String {
        match self {
            Class::Host => format!(r"(?P<{}>[A-Za-z0-9.\-]+)", name),
            Class::Number => format!(r"(?P<{}>\d+)", name),
            Class::NumberOrNil => format!(r"(?P<{}>\d+|-)", name),
            Class::Str => format!(r"(?P<{}>\S+)", name),
            Class::CommonTime => format!(r"\[(?P<{}>[^\]]+)]", name),
            Class::ConnStatus => format!(r"(?P<{}>[X+\-])", name),
            Class::Any => format!(r"(?P<{}>.*)", name),
        }
    }
}

/// Directive table: format letter to value class and default field name.
fn directive(letter: char) -> Option<(Class, &'static str)> {
    let entry = match letter {
        'a' => (Class::Host, "remote_ip"),
        'A' => (Class::Host, "local_ip"),
        'B' => (Class::Number, "body_size"),
        'b' => (Class::NumberOrNil, "body_size"),
        'C' => (Class::Str, "cookie"),
        'D' => (Class::Number, "response_time_us"),
        'e' => (Class::Str, "environment_var"),
        'f' => (Class::Str, "filename"),
        'h' => (Class::Host, "remote_host"),
        'H' => (Class::Str, "protocol"),
        'i' => (Class::Str, "input_header"),
        'l' => (Class::Str, "logname"),
        'm' => (Class::Str, "method"),
        'M' => (Class::Any, "message"),
        'n' => (Class::Str, "note"),
        'o' => (Class::Str, "output_header"),
        'p' => (Class::Number, "port"),
        'P' => (Class::Number, "pid"),
        'q' => (Class::Str, "query_string"),
        'r' => (Class::Str, "request"),
        's' => (Class::Number, "status_code"),
        't' => (Class::CommonTime, "date_time"),
        'T' => (Class::Number, "response_time_s"),
        'u' => (Class::Str, "auth_user"),
        'U' => (Class::Str, "url"),
        'v' => (Class::Host, "server_name"),
        'V' => (Class::Host, "canonical_server_name"),
        'X' => (Class::ConnStatus, "conn_status"),
        'I' => (Class::Number, "bytes_received"),
        'O' => (Class::Number, "bytes_sent"),
        _ => return None,
    };
    Some(entry)
}

/// A `%{name}X` override becomes a capture name only if the mapped form is a
/// valid group identifier; the strftime form `%{%b %d ...}t` is not and falls
/// through to the directive's default name.
fn valid_capture_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Escape a delimiter for use inside a `[^...]` character class.
fn class_escape(q: char) -> String {
    match q {
        '\\' | ']' | '^' | '-' => format!(r"\{}", q),
        _ => regex::escape(&q.to_string()),
    }
}

/// Backslash-aware delimited-string capture: matches `Q ... Q` while
/// honouring `\Q` escapes inside, so `"... \" ..."` stays one field.
fn delimited(q: char, name: &str) -> String {
    let lit = regex::escape(&q.to_string());
    let cls = class_escape(q);
    format!(
        r"{lit}(?P<{name}>[^{cls}\\]*(?:\\.[^{cls}\\]*)*){lit}",
        lit = lit,
        name = name,
        cls = cls,
    )
}

fn push_literal(out: &mut String, c: char) {
    if c == ' ' || c == '\t' {
        out.push(c);
    } else {
        out.push_str(&regex::escape(&c.to_string()));
    }
}

/// Compile a `LogFormat` template into `(pattern, fields)`.
///
/// The compiler is pure: equal inputs produce equal outputs, and the emitted
/// pattern is anchored at both ends.
pub fn compile(fmt: &str) -> Result<CompiledFormat> {
    let bytes = fmt.as_bytes();
    let len = bytes.len();
    let mut out = String::with_capacity(fmt.len() * 2);
    out.push('^');
    let mut fields: Vec<FieldDef> = Vec::new();
    // A literal immediately before a `%` is held back: it may be the opening
    // delimiter of a quoted field like `"%r"`.
    let mut pending_quote: Option<char> = None;
    let mut i = 0usize;

    while i < len {
        let c = bytes[i] as char;
        if c != '%' {
            let next = bytes.get(i + 1).map(|&b| b as char);
            if next == Some('%') && c != ' ' && c != '\t' {
                pending_quote = Some(c);
            } else {
                push_literal(&mut out, c);
            }
            i += 1;
            continue;
        }

        // Directive: consume modifiers until the format letter.
        i += 1;
        let mut capname: Option<String> = None;
        let letter = loop {
            let d = match bytes.get(i) {
                Some(&b) => b as char,
                None => {
                    return Err(Error::Format(format!(
                        "format string ends inside a directive: {}",
                        fmt
                    )));
                }
            };
            if d == '{' {
                let close = fmt[i + 1..].find('}').ok_or_else(|| {
                    Error::Format(format!("unterminated '%{{' in format: {}", fmt))
                })?;
                let raw = &fmt[i + 1..i + 1 + close];
                let mapped = raw.to_lowercase().replace('-', "_");
                if valid_capture_name(&mapped) {
                    capname = Some(mapped);
                }
                i += close + 2;
            } else if d == '>' || d == '<' {
                // Apache original/final-request modifiers carry no meaning here.
                i += 1;
            } else if d == '!' || d == ',' || d == '\\' || d.is_ascii_digit() {
                // Conditional prefix like `!404,500`; the directive still
                // matches normally.
                while let Some(&b) = bytes.get(i) {
                    let m = b as char;
                    if m == '!' || m == ',' || m == '\\' || m.is_ascii_digit() {
                        i += 1;
                    } else {
                        break;
                    }
                }
            } else {
                break d;
            }
        };

        let (class, default_name) = directive(letter)
            .ok_or_else(|| Error::Format(format!("unknown directive '%{}'", letter)))?;
        let name = capname.unwrap_or_else(|| default_name.to_string());
        if fields.iter().any(|f| f.name == name) {
            return Err(Error::Format(format!(
                "duplicate field '{}'; use %{{name}}{} to disambiguate",
                name, letter
            )));
        }

        let next = bytes.get(i + 1).map(|&b| b as char);
        let mut quoted = false;
        if let Some(q) = pending_quote.take() {
            if next == Some(q) {
                out.push_str(&delimited(q, &name));
                i += 2; // skip the letter and the closing delimiter
                quoted = true;
            } else {
                // Not a delimited field after all; the held-back literal is
                // emitted in its original position.
                push_literal(&mut out, q);
            }
        }
        if !quoted {
            out.push_str(&class.capture(&name));
            i += 1;
        }
        fields.push(FieldDef {
            name,
            kind: class.kind(),
        });
    }

    out.push('$');
    log::debug!("compiled format {:?} -> {}", fmt, out);
    Ok(CompiledFormat {
        pattern: out,
        fields,
    })
}

/// Extract a `LogFormat` stanza named `ctype` from an httpd.conf, stripping
/// the surrounding quotes and unescaping `\'` and `\"`.
pub fn from_config(config: &str, ctype: &str) -> Result<String> {
    let re = regex::Regex::new(&format!(
        r"(?im)^logformat\s+(.*)\s+{}",
        regex::escape(ctype)
    ))?;
    let caps = re.captures(config).ok_or_else(|| {
        Error::Config(format!("LogFormat {} not found in config", ctype))
    })?;
    let mut fmt = caps[1].trim().to_string();
    if (fmt.starts_with('\'') || fmt.starts_with('"'))
        && (fmt.ends_with('\'') || fmt.ends_with('"'))
        && fmt.len() >= 2
    {
        fmt = fmt[1..fmt.len() - 1].to_string();
    }
    Ok(fmt.replace("\\'", "'").replace("\\\"", "\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn capture<'a>(fmt: &str, line: &'a str) -> Vec<(String, String)> {
        let compiled = compile(fmt).unwrap();
        let re = Regex::new(&compiled.pattern).unwrap();
        let caps = re.captures(line).expect("line should match");
        compiled
            .fields
            .iter()
            .map(|f| {
                (
                    f.name.clone(),
                    caps.name(&f.name).unwrap().as_str().to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn test_apache_common_round_trip() {
        let line = r#"127.0.0.1 - frank [10/Oct/2000:13:55:36 -0700] "GET /a HTTP/1.0" 200 2326"#;
        let got = capture(preset("apache-common").unwrap(), line);
        let want = [
            ("remote_host", "127.0.0.1"),
            ("logname", "-"),
            ("auth_user", "frank"),
            ("date_time", "10/Oct/2000:13:55:36 -0700"),
            ("request", "GET /a HTTP/1.0"),
            ("status_code", "200"),
            ("body_size", "2326"),
        ];
        assert_eq!(got.len(), want.len());
        for ((name, value), (wname, wvalue)) in got.iter().zip(want) {
            assert_eq!(name.as_str(), wname);
            assert_eq!(value.as_str(), wvalue);
        }
    }

    #[test]
    fn test_ncsa_combined_round_trip() {
        let line = r#"10.0.0.9 - - [01/Jan/2024:00:00:01 +0000] "GET /x HTTP/1.1" 404 12 "http://ref.example/" "Mozilla/5.0 (X11)""#;
        let got = capture(preset("ncsa-combined").unwrap(), line);
        assert_eq!(got[7], ("referer".into(), "http://ref.example/".into()));
        assert_eq!(got[8], ("user_agent".into(), "Mozilla/5.0 (X11)".into()));
    }

    #[test]
    fn test_referer_and_agent_round_trip() {
        let got = capture(preset("referer").unwrap(), "http://a.example/ -> /landing");
        assert_eq!(got[0], ("referer".into(), "http://a.example/".into()));
        assert_eq!(got[1], ("url".into(), "/landing".into()));

        let got = capture(preset("agent").unwrap(), "curl/8.4.0");
        assert_eq!(got[0], ("user_agent".into(), "curl/8.4.0".into()));
    }

    #[test]
    fn test_syslog_round_trip() {
        let line = "[Oct 10 13:55:36] web01 cron[812]: session opened for root";
        let got = capture(preset("syslog").unwrap(), line);
        assert_eq!(got[0], ("date_time".into(), "Oct 10 13:55:36".into()));
        assert_eq!(got[1], ("remote_host".into(), "web01".into()));
        assert_eq!(got[2], ("server_name".into(), "cron".into()));
        assert_eq!(got[3], ("pid".into(), "812".into()));
        assert_eq!(got[4], ("message".into(), "session opened for root".into()));
    }

    #[test]
    fn test_quoted_field_honours_escapes() {
        let compiled = compile("\"%r\"").unwrap();
        let re = Regex::new(&compiled.pattern).unwrap();
        let caps = re.captures(r#""GET /a?q=\"x\" HTTP/1.0""#).unwrap();
        assert_eq!(caps.name("request").unwrap().as_str(), r#"GET /a?q=\"x\" HTTP/1.0"#);
    }

    #[test]
    fn test_body_size_nil() {
        let compiled = compile("%b").unwrap();
        let re = Regex::new(&compiled.pattern).unwrap();
        assert!(re.is_match("-"));
        assert!(re.is_match("512"));
        assert_eq!(compiled.fields[0].kind, FieldKind::Int);
    }

    #[test]
    fn test_name_override_and_mapping() {
        let compiled = compile("%{X-Forwarded-For}i").unwrap();
        assert_eq!(compiled.fields[0].name, "x_forwarded_for");
    }

    #[test]
    fn test_conditional_prefix_ignored() {
        let compiled = compile("%!404,500s").unwrap();
        assert_eq!(compiled.fields[0].name, "status_code");
        let re = Regex::new(&compiled.pattern).unwrap();
        assert!(re.is_match("200"));
    }

    #[test]
    fn test_modifiers_ignored() {
        let a = compile("%>s").unwrap();
        let b = compile("%<s").unwrap();
        assert_eq!(a.pattern, b.pattern);
    }

    #[test]
    fn test_unknown_directive_is_error() {
        assert!(matches!(compile("%Z"), Err(Error::Format(_))));
    }

    #[test]
    fn test_unterminated_brace_is_error() {
        assert!(matches!(compile("%{Referer"), Err(Error::Format(_))));
    }

    #[test]
    fn test_duplicate_field_is_error() {
        assert!(matches!(compile("%h %h"), Err(Error::Format(_))));
    }

    #[test]
    fn test_deterministic() {
        let a = compile(preset("ncsa-combined").unwrap()).unwrap();
        let b = compile(preset("ncsa-combined").unwrap()).unwrap();
        assert_eq!(a.pattern, b.pattern);
        assert_eq!(a.fields, b.fields);
    }

    #[test]
    fn test_from_config() {
        let conf = "ServerName example.org\nLogFormat \"%h %l %u %t \\\"%r\\\" %>s %b\" common\n";
        let fmt = from_config(conf, "common").unwrap();
        assert_eq!(fmt, "%h %l %u %t \"%r\" %>s %b");
        assert!(compile(&fmt).is_ok());
    }

    #[test]
    fn test_from_config_missing() {
        assert!(matches!(
            from_config("LogFormat \"%h\" other", "common"),
            Err(Error::Config(_))
        ));
    }
}
