//! Request parameter normalization.
//!
//! The control plane takes flat form/query fields; structured values are
//! flattened into bracketed literals the server parses back out: lists
//! become `[v1, v2]` with strings quoted, maps become `{"k":v, ...}`, and
//! nulls inside a container encode as `null`. A top-level null means
//! "leave this parameter out entirely".

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<ParamValue>),
    Map(Vec<(String, ParamValue)>),
    Null,
}

impl ParamValue {
    /// Encode for use as a top-level field value. Strings pass through
    /// unquoted; quoting only applies inside containers.
    pub fn encode(&self) -> String {
        match self {
            ParamValue::Str(s) => s.clone(),
            _ => self.encode_element(),
        }
    }

    fn encode_element(&self) -> String {
        match self {
            ParamValue::Str(s) => format!("\"{}\"", s),
            ParamValue::Int(i) => i.to_string(),
            ParamValue::Float(x) => x.to_string(),
            ParamValue::Bool(b) => b.to_string(),
            ParamValue::Null => "null".to_string(),
            ParamValue::List(items) => {
                let inner: Vec<String> = items.iter().map(|v| v.encode_element()).collect();
                format!("[{}]", inner.join(", "))
            }
            ParamValue::Map(entries) => {
                let inner: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("\"{}\":{}", k, v.encode_element()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Str(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Str(s)
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        ParamValue::Int(i)
    }
}

impl From<f64> for ParamValue {
    fn from(x: f64) -> Self {
        ParamValue::Float(x)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

/// Flatten a parameter set to wire fields, dropping top-level nulls.
pub fn normalize(params: &[(&str, ParamValue)]) -> Vec<(String, String)> {
    params
        .iter()
        .filter(|(_, v)| *v != ParamValue::Null)
        .map(|(k, v)| (k.to_string(), v.encode()))
        .collect()
}
