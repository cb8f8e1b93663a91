//! Command template rendering.
//!
//! A template is expanded once per row snapshot: `{name}` substitutes
//! the row field `name`, `{{` and `}}` emit literal braces.

use serde_json::Value;

use crate::error::{BatchError, Result};
use crate::store::RowSnapshot;

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Field(String),
}

/// A parsed command template.
#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(input: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = input.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut field = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => field.push(c),
                            None => {
                                return Err(BatchError::TemplateParse(format!(
                                    "unterminated '{{' in '{input}'"
                                )))
                            }
                        }
                    }
                    let field = field.trim().to_string();
                    if field.is_empty() {
                        return Err(BatchError::TemplateParse(format!(
                            "empty field reference in '{input}'"
                        )));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(field));
                }
                '}' => {
                    return Err(BatchError::TemplateParse(format!(
                        "unmatched '}}' in '{input}'"
                    )))
                }
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self { segments })
    }

    /// Expand this template against one row.
    pub fn render(&self, row: &RowSnapshot) -> Result<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) => {
                    let value = row
                        .get(name)
                        .ok_or_else(|| BatchError::TemplateField(name.clone()))?;
                    out.push_str(&field_text(value));
                }
            }
        }
        Ok(out)
    }
}

/// Render `template` once per row, preserving row order so the output
/// zips with the parallel primary-key vector from a filter.
///
/// A parse failure aborts before any row renders; a reference to an
/// absent field aborts the whole batch rather than skipping the row.
pub fn render_all(template: &str, rows: &[RowSnapshot]) -> Result<Vec<String>> {
    let template = Template::parse(template)?;
    rows.iter().map(|row| template.render(row)).collect()
}

fn field_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
