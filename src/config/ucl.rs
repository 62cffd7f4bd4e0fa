//! UCL config file parsing
//!
//! Parses the flat `key = value;` subset of UCL that legacy `config` files
//! use. Values may be bare words, quoted strings or numbers; comments
//! start with `#` or `//`. Rendering writes the same shape back.

use crate::error::{Error, Result};
use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take_while1},
    character::complete::{char, space0},
    combinator::{map, opt},
    sequence::{delimited, preceded},
    Parser,
};
use std::collections::BTreeMap;

/// Parse a UCL document into an ordered key/value map
pub fn parse(content: &str) -> Result<BTreeMap<String, String>> {
    let mut entries = BTreeMap::new();

    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }

        match parse_line(line) {
            Ok((_, (key, value))) => {
                entries.insert(key.to_string(), value);
            }
            Err(_) => {
                return Err(Error::InvalidConfigValue {
                    property: format!("line {}", number + 1),
                    reason: format!("unparsable UCL line '{}'", line),
                });
            }
        }
    }

    Ok(entries)
}

/// Render a key/value map as a UCL document
pub fn render(entries: &BTreeMap<String, String>) -> String {
    let mut output = String::new();
    for (key, value) in entries {
        output.push_str(&format!("{} = \"{}\";\n", key, value.replace('"', "\\\"")));
    }
    output
}

fn parse_key(input: &str) -> nom::IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
        .parse(input)
}

fn parse_quoted(input: &str) -> nom::IResult<&str, String> {
    map(
        delimited(char('"'), opt(is_not("\"")), char('"')),
        |inner: Option<&str>| inner.unwrap_or("").replace("\\\"", "\""),
    )
    .parse(input)
}

fn parse_bare(input: &str) -> nom::IResult<&str, String> {
    map(is_not(";#\n"), |s: &str| s.trim().to_string()).parse(input)
}

fn parse_line(input: &str) -> nom::IResult<&str, (&str, String)> {
    let (input, key) = parse_key(input)?;
    let (input, _) = preceded(space0, opt(alt((tag("="), tag(":"))))).parse(input)?;
    let (input, value) = preceded(space0, alt((parse_quoted, parse_bare))).parse(input)?;
    let (input, _) = opt(preceded(space0, char(';'))).parse(input)?;
    Ok((input, (key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignments() {
        let content = r#"
# legacy config
release = "13.2-RELEASE";
vnet = "yes";
priority = 10;
"#;
        let entries = parse(content).unwrap();
        assert_eq!(entries["release"], "13.2-RELEASE");
        assert_eq!(entries["vnet"], "yes");
        assert_eq!(entries["priority"], "10");
    }

    #[test]
    fn test_parse_colon_and_bare_values() {
        let entries = parse("host_hostname: web01\nboot = on;\n").unwrap();
        assert_eq!(entries["host_hostname"], "web01");
        assert_eq!(entries["boot"], "on");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("!!! not ucl").is_err());
    }

    #[test]
    fn test_round_trip() {
        let mut entries = BTreeMap::new();
        entries.insert("release".to_string(), "13.2-RELEASE".to_string());
        entries.insert("vnet".to_string(), "yes".to_string());

        let rendered = render(&entries);
        assert_eq!(parse(&rendered).unwrap(), entries);
    }

    #[test]
    fn test_empty_quoted_value() {
        let entries = parse("resolver = \"\";\n").unwrap();
        assert_eq!(entries["resolver"], "");
    }
}
