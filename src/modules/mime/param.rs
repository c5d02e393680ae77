// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

/// One attribute/value pair on a MIME header field.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub attribute: String,
    pub value: String,
}

/// An ordered parameter list. Attribute lookup is case-insensitive;
/// insertion order is preserved for wire output.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamList {
    entries: Vec<Parameter>,
}

impl ParamList {
    pub fn new() -> Self {
        ParamList::default()
    }

    pub fn get(&self, attribute: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|p| p.attribute.eq_ignore_ascii_case(attribute))
            .map(|p| p.value.as_str())
    }

    /// Replace an existing attribute in place or append a new one.
    pub fn set(&mut self, attribute: &str, value: &str) {
        match self
            .entries
            .iter_mut()
            .find(|p| p.attribute.eq_ignore_ascii_case(attribute))
        {
            Some(existing) => existing.value = value.to_string(),
            None => self.entries.push(Parameter {
                attribute: attribute.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn remove(&mut self, attribute: &str) {
        self.entries
            .retain(|p| !p.attribute.eq_ignore_ascii_case(attribute));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Quote a parameter value when it contains tspecials.
    pub fn format_value(value: &str) -> String {
        let needs_quoting = value.is_empty()
            || value
                .chars()
                .any(|c| c.is_whitespace() || "()<>@,;:\\\"/[]?=".contains(c));
        if !needs_quoting {
            return value.to_string();
        }
        let mut out = String::with_capacity(value.len() + 2);
        out.push('"');
        for c in value.chars() {
            if c == '"' || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
        out.push('"');
        out
    }
}

impl FromIterator<(String, String)> for ParamList {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut list = ParamList::new();
        for (attribute, value) in iter {
            list.set(&attribute, &value);
        }
        list
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut params = ParamList::new();
        params.set("Charset", "utf-8");
        assert_eq!(params.get("charset"), Some("utf-8"));
        assert_eq!(params.get("CHARSET"), Some("utf-8"));
    }

    #[test]
    fn set_preserves_insertion_order() {
        let mut params = ParamList::new();
        params.set("charset", "utf-8");
        params.set("boundary", "b1");
        params.set("CHARSET", "us-ascii");
        let order: Vec<&str> = params.iter().map(|p| p.attribute.as_str()).collect();
        assert_eq!(order, vec!["charset", "boundary"]);
        assert_eq!(params.get("charset"), Some("us-ascii"));
    }

    #[test]
    fn quoting_only_when_needed() {
        assert_eq!(ParamList::format_value("plain"), "plain");
        assert_eq!(ParamList::format_value("two words"), "\"two words\"");
        assert_eq!(ParamList::format_value("a\"b"), "\"a\\\"b\"");
    }
}
