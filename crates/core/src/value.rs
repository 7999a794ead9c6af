//! The `Value` tagged union (spec §3) and its printed representation.

use crate::object::{ObjData, ObjRef};

#[derive(Clone, Copy)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Obj(ObjRef),
}

impl Value {
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_truthy(&self) -> bool {
        !self.is_falsey()
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(o) => Some(*o),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Obj(o) => o.as_str(),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Obj(o) => o.type_tag(),
        }
    }
}

/// Primitives compare by value; objects compare by identity. String identity
/// equals string value because of interning (spec §3/§4.5), so no special
/// case is needed here.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format_value(self))
    }
}

/// `%g`-equivalent number formatting: shortest round-trippable form, no
/// trailing `.0` for integral values. See SPEC_FULL §6.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// The printed form used by `print`/`println`/`string()` (spec §6).
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => format_number(*n),
        Value::Obj(o) => format_obj(o),
    }
}

fn format_obj(obj: &ObjRef) -> String {
    match obj.data() {
        ObjData::Str(s) => s.as_str().to_string(),
        ObjData::Function(f) => match f.name {
            Some(name) => format!("<fn {}>", name.as_str().unwrap_or("?")),
            None => "<script>".to_string(),
        },
        ObjData::Closure(c) => format_obj(&c.function),
        ObjData::Upvalue(_) => "<upvalue>".to_string(),
        ObjData::Native(n) => format!("<native fn {}>", n.name),
        ObjData::Class(c) => c.name.as_str().unwrap_or("?").to_string(),
        ObjData::Instance(i) => {
            let class_name = match i.class.data() {
                ObjData::Class(c) => c.name.as_str().unwrap_or("?"),
                _ => "?",
            };
            format!("{} instance", class_name)
        }
        ObjData::BoundMethod(b) => format_obj(&b.method),
        ObjData::NativeInstance(n) => n.borrow().type_tag().to_string(),
    }
}
