use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A node of the shared data tree.
///
/// Containers are persistent ([`im`]) so cloning a whole tree for a point-in-time snapshot is
/// O(1); mutations on the clone never show through to the original.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
  List(im::Vector<Value>),
  Map(im::OrdMap<String, Value>),
}
impl Value {
  pub fn map() -> Value {
    Value::Map(im::OrdMap::new())
  }

  pub fn list() -> Value {
    Value::List(im::Vector::new())
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Value::Null => "null",
      Value::Bool(_) => "bool",
      Value::Int(_) => "int",
      Value::Float(_) => "float",
      Value::Str(_) => "str",
      Value::List(_) => "list",
      Value::Map(_) => "map",
    }
  }

  pub fn is_null(&self) -> bool {
    matches!(self, Value::Null)
  }

  pub fn as_map(&self) -> Option<&im::OrdMap<String, Value>> {
    match self {
      Value::Map(m) => Some(m),
      _ => None,
    }
  }

  pub fn as_list(&self) -> Option<&im::Vector<Value>> {
    match self {
      Value::List(l) => Some(l),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::Str(s) => Some(s.as_str()),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Value::Int(i) => Some(*i),
      Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
      _ => None,
    }
  }

  pub fn as_f64(&self) -> Option<f64> {
    match self {
      Value::Int(i) => Some(*i as f64),
      Value::Float(f) => Some(*f),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Value::Bool(b) => Some(*b),
      _ => None,
    }
  }

  /// Looks up a key of a mapping. `None` for missing keys and for non-mappings.
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.as_map().and_then(|m| m.get(key))
  }

  pub fn to_json(&self) -> serde_json::Value {
    match self {
      Value::Null => serde_json::Value::Null,
      Value::Bool(b) => serde_json::Value::Bool(*b),
      Value::Int(i) => serde_json::Value::from(*i),
      Value::Float(f) => serde_json::Number::from_f64(*f)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null),
      Value::Str(s) => serde_json::Value::String(s.clone()),
      Value::List(l) => serde_json::Value::Array(l.iter().map(Value::to_json).collect()),
      Value::Map(m) => serde_json::Value::Object(
        m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
      ),
    }
  }

  /// Reads a typed record out of the tree.
  pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
    serde_json::from_value(self.to_json())
  }

  /// Stores a typed record into the tree.
  pub fn encode<T: Serialize>(item: &T) -> Result<Value, serde_json::Error> {
    serde_json::to_value(item).map(Value::from)
  }
}
impl Default for Value {
  fn default() -> Self {
    Value::Null
  }
}
impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.to_json())
  }
}
impl From<serde_json::Value> for Value {
  fn from(json: serde_json::Value) -> Self {
    match json {
      serde_json::Value::Null => Value::Null,
      serde_json::Value::Bool(b) => Value::Bool(b),
      serde_json::Value::Number(n) => match n.as_i64() {
        Some(i) => Value::Int(i),
        None => Value::Float(n.as_f64().unwrap_or(0.0)),
      },
      serde_json::Value::String(s) => Value::Str(s),
      serde_json::Value::Array(a) => Value::List(a.into_iter().map(Value::from).collect()),
      serde_json::Value::Object(o) => {
        Value::Map(o.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
      }
    }
  }
}
impl From<bool> for Value {
  fn from(b: bool) -> Self {
    Value::Bool(b)
  }
}
impl From<i64> for Value {
  fn from(i: i64) -> Self {
    Value::Int(i)
  }
}
impl From<i32> for Value {
  fn from(i: i32) -> Self {
    Value::Int(i as i64)
  }
}
impl From<u32> for Value {
  fn from(i: u32) -> Self {
    Value::Int(i as i64)
  }
}
impl From<f64> for Value {
  fn from(f: f64) -> Self {
    Value::Float(f)
  }
}
impl From<&str> for Value {
  fn from(s: &str) -> Self {
    Value::Str(s.to_string())
  }
}
impl From<String> for Value {
  fn from(s: String) -> Self {
    Value::Str(s)
  }
}
impl From<Vec<Value>> for Value {
  fn from(v: Vec<Value>) -> Self {
    Value::List(v.into_iter().collect())
  }
}
impl From<im::OrdMap<String, Value>> for Value {
  fn from(m: im::OrdMap<String, Value>) -> Self {
    Value::Map(m)
  }
}
impl<T: Into<Value>> From<Option<T>> for Value {
  fn from(o: Option<T>) -> Self {
    o.map(Into::into).unwrap_or(Value::Null)
  }
}

/// Builds a [`Value::Map`] from `key => value` pairs.
#[macro_export]
macro_rules! vmap {
  () => { $crate::core::Value::map() };
  ($($k:expr => $v:expr),+ $(,)?) => {{
    let mut m = ::im::OrdMap::<String, $crate::core::Value>::new();
    $( m.insert(::std::string::String::from($k), $crate::core::Value::from($v)); )+
    $crate::core::Value::Map(m)
  }};
}

#[test]
fn test_value_json_conversions() {
  let json = serde_json::json!({
    "avail": "up",
    "frozen": 0,
    "updated": 1.5,
    "scope": ["n1", "n2"],
    "provisioned": null,
  });
  let value = Value::from(json.clone());
  assert_eq!(value.get("avail").and_then(Value::as_str), Some("up"));
  assert_eq!(value.get("frozen"), Some(&Value::Int(0)));
  assert_eq!(value.get("updated").and_then(Value::as_f64), Some(1.5));
  assert_eq!(value.get("scope").and_then(Value::as_list).map(|l| l.len()), Some(2));
  assert!(value.get("provisioned").map(Value::is_null).unwrap_or(false));
  assert_eq!(value.to_json(), json);
}

#[test]
fn test_value_untagged_serde() {
  let value = vmap! {
    "a" => 1,
    "b" => vmap! { "c" => "x" },
    "d" => Value::from(vec![Value::from(true), Value::Null]),
  };
  let bytes = serde_cbor::to_vec(&value).unwrap();
  let back: Value = serde_cbor::from_slice(&bytes).unwrap();
  assert_eq!(value, back);
}
