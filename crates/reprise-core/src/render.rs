//! Values the author hands to `write`.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::delta::Payload;
use crate::error::ScriptError;
use crate::Value;

/// Types that know how to render themselves as HTML.
pub trait ReprHtml {
    fn repr_html(&self) -> String;
}

/// A written value, classified once by the capability it offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Renderable {
    /// Output of a custom HTML renderer.
    Custom(String),
    /// String conversion, shown as markdown.
    Display(String),
    /// Anything else, shown as structured data.
    Plain(Value),
}

impl Renderable {
    pub fn custom<T: ReprHtml + ?Sized>(value: &T) -> Self {
        Renderable::Custom(value.repr_html())
    }

    pub fn display<T: Display + ?Sized>(value: &T) -> Self {
        Renderable::Display(value.to_string())
    }

    #[track_caller]
    pub fn plain<T: Serialize + ?Sized>(value: &T) -> Result<Self, ScriptError> {
        serde_json::to_value(value)
            .map(Renderable::Plain)
            .map_err(|err| ScriptError::from_error(&err))
    }

    pub(crate) fn into_payload(self) -> Payload {
        match self {
            Renderable::Custom(body) => Payload::Html { body },
            Renderable::Display(body) => Payload::Markdown { body },
            Renderable::Plain(value) => Payload::Json { value },
        }
    }

    pub(crate) fn into_html(self) -> String {
        match self {
            Renderable::Custom(body) | Renderable::Display(body) => body,
            Renderable::Plain(value) => value.to_string(),
        }
    }
}

impl From<&str> for Renderable {
    fn from(text: &str) -> Self {
        Renderable::Display(text.to_string())
    }
}

impl From<String> for Renderable {
    fn from(text: String) -> Self {
        Renderable::Display(text)
    }
}

impl From<Value> for Renderable {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => Renderable::Display(text),
            other => Renderable::Plain(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Badge(&'static str);

    impl ReprHtml for Badge {
        fn repr_html(&self) -> String {
            format!("<span class=\"badge\">{}</span>", self.0)
        }
    }

    #[test]
    fn capabilities_map_to_payloads() {
        assert_eq!(
            Renderable::custom(&Badge("new")).into_payload(),
            Payload::Html {
                body: "<span class=\"badge\">new</span>".to_string()
            }
        );
        assert_eq!(Renderable::display(&42).into_payload(), Payload::markdown("42"));
        assert_eq!(
            Renderable::plain(&vec![1, 2]).unwrap().into_payload(),
            Payload::Json { value: json!([1, 2]) }
        );
    }

    #[test]
    fn json_strings_render_as_text() {
        assert_eq!(Renderable::from(json!("hi")), Renderable::Display("hi".to_string()));
        assert_eq!(Renderable::from(json!({"a": 1})), Renderable::Plain(json!({"a": 1})));
    }
}
