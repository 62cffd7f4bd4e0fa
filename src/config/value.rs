//! Typed config values and user input normalisation
//!
//! Values arriving from files or API calls are strings most of the time;
//! this module parses them into the tagged [`Value`] type: `yes/no/on/off`
//! style booleans, `none`/`-`/empty-string null, strict integers and
//! floats, and comma separated lists with `\,` escapes.

use std::fmt;

/// A typed configuration value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<String>),
    Null,
}

/// Parse boolean words; returns None when the input is not a boolean
pub fn parse_bool(data: &str) -> Option<bool> {
    match data.to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Some(true),
        "no" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// True when the input denotes an absent value
pub fn parse_none(data: &str) -> bool {
    matches!(data.trim(), "" | "-" | "none")
}

/// Split a comma separated list, honouring `\,` escapes
pub fn split_list(data: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut chars = data.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&',') => {
                chars.next();
                current.push(',');
            }
            ',' => {
                items.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(c),
        }
    }
    items.push(current.trim().to_string());
    items.retain(|item| !item.is_empty());
    items
}

/// Join list items, escaping embedded commas
pub fn join_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| item.replace(',', "\\,"))
        .collect::<Vec<_>>()
        .join(",")
}

impl Value {
    /// Normalise user input: booleans, none, strict numbers, else string
    pub fn parse_user_input(data: &str) -> Value {
        if let Some(b) = parse_bool(data) {
            return Value::Bool(b);
        }
        if parse_none(data) {
            return Value::Null;
        }
        if let Ok(n) = data.parse::<i64>() {
            return Value::Int(n);
        }
        if let Ok(f) = data.parse::<f64>() {
            return Value::Float(f);
        }
        Value::String(data.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Boolean interpretation, if this value has one
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::String(s) => parse_bool(s),
            Value::Int(0) => Some(false),
            Value::Int(1) => Some(true),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// String rendering used inside config files (`yes`/`no` for booleans)
    pub fn to_config_string(&self) -> String {
        match self {
            Value::Bool(true) => "yes".to_string(),
            Value::Bool(false) => "no".to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::List(items) => join_list(items),
            Value::Null => String::new(),
        }
    }

    /// Convert to the JSON representation used by config.json
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(b) => serde_json::Value::String(if *b { "yes" } else { "no" }.into()),
            Value::Int(n) => serde_json::Value::Number((*n).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::String(join_list(items)),
            Value::Null => serde_json::Value::Null,
        }
    }

    /// Convert from a JSON value read out of config.json
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::parse_user_input(s),
            other => Value::String(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_config_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_words() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("no"), Some(false));
        assert_eq!(parse_bool("OFF"), Some(false));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("notfalse"), None);
    }

    #[test]
    fn test_parse_none_markers() {
        assert!(parse_none(""));
        assert!(parse_none("-"));
        assert!(parse_none("none"));
        assert!(!parse_none("nonempty"));
    }

    #[test]
    fn test_parse_user_input() {
        assert_eq!(Value::parse_user_input("yes"), Value::Bool(true));
        assert_eq!(Value::parse_user_input("none"), Value::Null);
        assert_eq!(Value::parse_user_input("42"), Value::Int(42));
        assert_eq!(Value::parse_user_input("2.5"), Value::Float(2.5));
        assert_eq!(
            Value::parse_user_input("notfalse"),
            Value::String("notfalse".into())
        );
    }

    #[test]
    fn test_list_escaped_commas() {
        let items = split_list(r"a,b\,c, d");
        assert_eq!(items, vec!["a", "b,c", "d"]);
        assert_eq!(
            join_list(&items.iter().map(|s| s.to_string()).collect::<Vec<_>>()),
            r"a,b\,c,d"
        );
    }

    #[test]
    fn test_config_string_round_trip() {
        assert_eq!(Value::Bool(true).to_config_string(), "yes");
        assert_eq!(Value::parse_user_input("yes"), Value::Bool(true));
        assert_eq!(Value::Int(7).to_config_string(), "7");
    }

    #[test]
    fn test_json_round_trip() {
        let value = Value::Bool(false);
        assert_eq!(Value::from_json(&value.to_json()), value);

        let value = Value::Int(99);
        assert_eq!(Value::from_json(&value.to_json()), value);

        let json = serde_json::Value::String("vnet0:bridge0".into());
        assert_eq!(
            Value::from_json(&json),
            Value::String("vnet0:bridge0".into())
        );
    }
}
