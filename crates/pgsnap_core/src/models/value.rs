//! Cell values and SQL literal rendering.

use serde::Serialize;

/// One decoded column value of a row.
///
/// `Number`, `Timestamp` and `Json` keep the server's textual form so no
/// precision, key order or duplicate key is lost between the server and the
/// dump.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Cell {
    Null,
    Bool(bool),
    Number(String),
    Text(String),
    Timestamp(String),
    Json(String),
}

impl Cell {
    /// Number cell from a float; non-finite values become quoted text.
    pub fn from_f64(value: f64) -> Self {
        if value.is_finite() {
            Cell::Number(value.to_string())
        } else {
            Cell::Text(non_finite_text(value))
        }
    }

    /// Number cell from a single-precision float.
    pub fn from_f32(value: f32) -> Self {
        if value.is_finite() {
            Cell::Number(value.to_string())
        } else {
            Cell::Text(non_finite_text(f64::from(value)))
        }
    }

    /// Render as a SQL literal for an `INSERT` statement.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Cell::Null => "NULL".to_string(),
            Cell::Bool(true) => "true".to_string(),
            Cell::Bool(false) => "false".to_string(),
            Cell::Number(n) => n.clone(),
            Cell::Text(s) | Cell::Timestamp(s) | Cell::Json(s) => quote_literal(s),
        }
    }
}

fn non_finite_text(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_sign_positive() {
        "Infinity".to_string()
    } else {
        "-Infinity".to_string()
    }
}

/// Single-quote a string literal, doubling embedded quotes.
///
/// Relies on `standard_conforming_strings = on`, which the dump header sets.
pub fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push('\'');
        }
        out.push(ch);
    }
    out.push('\'');
    out
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote and join a list of identifiers with `, `.
pub fn quote_ident_list<S: AsRef<str>>(names: &[S]) -> String {
    names.iter().map(|n| quote_ident(n.as_ref())).collect::<Vec<_>>().join(", ")
}
