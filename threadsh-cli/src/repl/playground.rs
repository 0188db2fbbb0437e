//! Ready-made Person fixtures, reachable in arguments as `@schema`, `@adam`,
//! `@eve`, `@query` and `@model`

use serde_json::{json, Value};

pub const MODEL: &str = "Person";

pub fn schema() -> Value {
    json!({
        "$id": "https://example.com/person.schema.json",
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "Person",
        "type": "object",
        "properties": {
            "firstName": {
                "type": "string",
                "description": "The person's first name."
            },
            "lastName": {
                "type": "string",
                "description": "The person's last name."
            },
            "age": {
                "description": "Age in years which must be equal to or greater than zero.",
                "type": "integer",
                "minimum": 0
            }
        }
    })
}

pub fn adam() -> Value {
    json!({ "firstName": "Adam", "lastName": "Doe", "age": 21 })
}

pub fn eve() -> Value {
    json!({ "firstName": "Eve", "lastName": "Doe", "age": 21 })
}

/// Equality filter matching Adam
pub fn query() -> Value {
    json!({ "firstName": "Adam" })
}

fn lookup(name: &str) -> Option<Value> {
    match name {
        "schema" => Some(schema()),
        "adam" => Some(adam()),
        "eve" => Some(eve()),
        "query" => Some(query()),
        "model" => Some(Value::String(MODEL.to_string())),
        _ => None,
    }
}

/// Replace every known `@name` with its JSON text
///
/// Unknown references are left alone so the JSON parser reports them.
/// Text inside JSON string literals is never expanded.
pub fn expand(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some((i, c)) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            continue;
        }
        if c != '@' {
            out.push(c);
            continue;
        }

        let start = i + 1;
        let mut end = start;
        while let Some(&(j, n)) = chars.peek() {
            if !(n.is_ascii_alphanumeric() || n == '_') {
                break;
            }
            end = j + n.len_utf8();
            chars.next();
        }
        match lookup(&input[start..end]) {
            Some(value) => out.push_str(&value.to_string()),
            None => out.push_str(&input[i..end]),
        }
    }
    out
}

/// Resolve a bare word such as a collection name; `@model` becomes `Person`
pub fn resolve_name(word: &str) -> String {
    match word {
        "@model" => MODEL.to_string(),
        other => other.to_string(),
    }
}

/// Listing printed by the `playground` command
pub fn describe() -> String {
    let entries = [
        ("@model", Value::String(MODEL.to_string())),
        ("@schema", schema()),
        ("@adam", adam()),
        ("@eve", eve()),
        ("@query", query()),
    ];
    entries
        .iter()
        .map(|(name, value)| {
            let pretty = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
            format!("{} = {}", name, pretty)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_fixtures_inside_arrays() {
        let expanded = expand("[@adam, @eve]");
        let value: Value = serde_json::from_str(&expanded).unwrap();
        assert_eq!(value, json!([adam(), eve()]));
    }

    #[test]
    fn leaves_unknown_references() {
        assert_eq!(expand("@nobody"), "@nobody");
        assert_eq!(expand("user@example.com"), "user@example.com");
        assert_eq!(expand("no refs"), "no refs");
    }

    #[test]
    fn leaves_references_inside_strings() {
        let text = r#"{"email": "x@eve", "note": "say \"@adam\""}"#;
        assert_eq!(expand(text), text);
        let value: Value = serde_json::from_str(&expand(text)).unwrap();
        assert_eq!(value["email"], "x@eve");

        let mixed = expand(r#"{"friend": @eve, "handle": "@eve"}"#);
        let value: Value = serde_json::from_str(&mixed).unwrap();
        assert_eq!(value["friend"], eve());
        assert_eq!(value["handle"], "@eve");
    }

    #[test]
    fn model_resolves_to_person() {
        assert_eq!(resolve_name("@model"), "Person");
        assert_eq!(resolve_name("Notes"), "Notes");
        assert_eq!(expand("@model"), "\"Person\"");
    }
}
