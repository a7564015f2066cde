use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::http::{HeaderMap, PathParams, Request};

/// One offending field with a machine-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

/// Validation failure listing every offending field.
#[derive(Debug, Error)]
#[error("validation failed for {} field(s)", .errors.len())]
pub struct ValidationError {
    pub errors: Vec<FieldError>,
}

impl ValidationError {
    fn single(field: &str, reason: impl Into<String>) -> Self {
        ValidationError {
            errors: vec![FieldError {
                field: field.to_string(),
                reason: reason.into(),
            }],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Str,
    Int,
    Float,
    Bool,
}

/// One declared field: type, optionality, and constraint evaluators.
/// Regex patterns compile once, when the schema is built.
#[derive(Debug)]
pub struct Field {
    name: String,
    kind: FieldKind,
    required: bool,
    min: Option<f64>,
    max: Option<f64>,
    min_len: Option<usize>,
    max_len: Option<usize>,
    pattern: Option<Regex>,
    one_of: Option<Vec<String>>,
}

impl Field {
    fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Field {
            name: name.into(),
            kind,
            required: false,
            min: None,
            max: None,
            min_len: None,
            max_len: None,
            pattern: None,
            one_of: None,
        }
    }

    pub fn str(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Str)
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Int)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Float)
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Bool)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Inclusive numeric lower bound.
    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    /// Inclusive numeric upper bound.
    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn min_len(mut self, len: usize) -> Self {
        self.min_len = Some(len);
        self
    }

    pub fn max_len(mut self, len: usize) -> Self {
        self.max_len = Some(len);
        self
    }

    /// Anchored regex constraint. Invalid patterns fail schema build.
    pub fn pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.pattern = Some(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.one_of = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }

    /// Coerce a raw string (query, header, form, path) to the declared
    /// type, then apply constraints.
    fn coerce_str(&self, raw: &str) -> Result<Value, String> {
        let value = match self.kind {
            FieldKind::Str => Value::String(raw.to_string()),
            FieldKind::Int => raw
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| "expected an integer".to_string())?,
            FieldKind::Float => raw
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| "expected a number".to_string())?,
            FieldKind::Bool => match raw {
                "true" | "1" => Value::Bool(true),
                "false" | "0" => Value::Bool(false),
                _ => return Err("expected a boolean".to_string()),
            },
        };
        self.check(&value)?;
        Ok(value)
    }

    /// Accept an already-typed JSON value. JSON sources are strict:
    /// no string-to-number coercion.
    fn coerce_json(&self, value: &Value) -> Result<Value, String> {
        let value = match (self.kind, value) {
            (FieldKind::Str, Value::String(s)) => Value::String(s.clone()),
            (FieldKind::Int, Value::Number(n)) if n.as_i64().is_some() => value.clone(),
            (FieldKind::Float, Value::Number(_)) => value.clone(),
            (FieldKind::Bool, Value::Bool(_)) => value.clone(),
            (kind, _) => {
                let expected = match kind {
                    FieldKind::Str => "a string",
                    FieldKind::Int => "an integer",
                    FieldKind::Float => "a number",
                    FieldKind::Bool => "a boolean",
                };
                return Err(format!("expected {}", expected));
            }
        };
        self.check(&value)?;
        Ok(value)
    }

    fn check(&self, value: &Value) -> Result<(), String> {
        match value {
            Value::String(s) => {
                if let Some(min_len) = self.min_len {
                    if s.chars().count() < min_len {
                        return Err(format!("shorter than {} characters", min_len));
                    }
                }
                if let Some(max_len) = self.max_len {
                    if s.chars().count() > max_len {
                        return Err(format!("longer than {} characters", max_len));
                    }
                }
                if let Some(pattern) = &self.pattern {
                    if !pattern.is_match(s) {
                        return Err(format!("does not match pattern {}", pattern.as_str()));
                    }
                }
                if let Some(allowed) = &self.one_of {
                    if !allowed.iter().any(|a| a == s) {
                        return Err(format!("not one of [{}]", allowed.join(", ")));
                    }
                }
            }
            Value::Number(n) => {
                let v = n.as_f64().unwrap_or(f64::NAN);
                if let Some(min) = self.min {
                    if v < min {
                        return Err(format!("below minimum {}", min));
                    }
                }
                if let Some(max) = self.max {
                    if v > max {
                        return Err(format!("above maximum {}", max));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// A compiled validation schema: a set of named fields, each with a
/// type, optionality, and constraints. Validation is side-effect free
/// and deterministic; output is a JSON object of coerced values.
#[derive(Debug, Default)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new() -> Self {
        Schema { fields: Vec::new() }
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Validate string key/value pairs (query, form, headers, path).
    /// Repeated keys use the first occurrence.
    pub fn validate_pairs<'a, I>(&self, pairs: I) -> Result<Map<String, Value>, ValidationError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let pairs: Vec<(&str, &str)> = pairs.into_iter().collect();
        let mut out = Map::new();
        let mut errors = Vec::new();

        for field in &self.fields {
            let raw = pairs.iter().find(|(k, _)| *k == field.name).map(|(_, v)| *v);
            match raw {
                Some(raw) => match field.coerce_str(raw) {
                    Ok(value) => {
                        out.insert(field.name.clone(), value);
                    }
                    Err(reason) => errors.push(FieldError {
                        field: field.name.clone(),
                        reason,
                    }),
                },
                None if field.required => errors.push(FieldError {
                    field: field.name.clone(),
                    reason: "required".to_string(),
                }),
                None => {}
            }
        }

        if errors.is_empty() {
            Ok(out)
        } else {
            Err(ValidationError { errors })
        }
    }

    pub fn validate_query(&self, request: &Request) -> Result<Map<String, Value>, ValidationError> {
        let pairs = request.query_pairs();
        self.validate_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    pub fn validate_headers(&self, headers: &HeaderMap) -> Result<Map<String, Value>, ValidationError> {
        self.validate_pairs(headers.iter())
    }

    pub fn validate_form(&self, request: &Request) -> Result<Map<String, Value>, ValidationError> {
        let pairs = request
            .form()
            .map_err(|_| ValidationError::single("body", "invalid form encoding"))?;
        self.validate_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    pub fn validate_path(&self, params: &PathParams) -> Result<Map<String, Value>, ValidationError> {
        let mut out = Map::new();
        let mut errors = Vec::new();

        for field in &self.fields {
            match params.get(&field.name) {
                Some(value) => {
                    // Router-extracted params are already typed; re-check
                    // through the JSON path so constraints still apply.
                    match field.coerce_json(&value.to_json()) {
                        Ok(value) => {
                            out.insert(field.name.clone(), value);
                        }
                        Err(reason) => errors.push(FieldError {
                            field: field.name.clone(),
                            reason,
                        }),
                    }
                }
                None if field.required => errors.push(FieldError {
                    field: field.name.clone(),
                    reason: "required".to_string(),
                }),
                None => {}
            }
        }

        if errors.is_empty() {
            Ok(out)
        } else {
            Err(ValidationError { errors })
        }
    }

    /// Validate a JSON body. The body must be a JSON object.
    pub fn validate_json(&self, request: &Request) -> Result<Map<String, Value>, ValidationError> {
        let parsed: Value = serde_json::from_slice(&request.body)
            .map_err(|_| ValidationError::single("body", "invalid JSON"))?;
        let object = parsed
            .as_object()
            .ok_or_else(|| ValidationError::single("body", "expected a JSON object"))?;

        let mut out = Map::new();
        let mut errors = Vec::new();

        for field in &self.fields {
            match object.get(&field.name) {
                Some(value) if !value.is_null() => match field.coerce_json(value) {
                    Ok(value) => {
                        out.insert(field.name.clone(), value);
                    }
                    Err(reason) => errors.push(FieldError {
                        field: field.name.clone(),
                        reason,
                    }),
                },
                _ if field.required => errors.push(FieldError {
                    field: field.name.clone(),
                    reason: "required".to_string(),
                }),
                _ => {}
            }
        }

        if errors.is_empty() {
            Ok(out)
        } else {
            Err(ValidationError { errors })
        }
    }
}
