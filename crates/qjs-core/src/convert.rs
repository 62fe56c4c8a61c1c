//! Conversion between Rust data and JavaScript values
//!
//! Both directions go through [`serde_json::Value`], so anything that
//! implements `Serialize`/`Deserialize` crosses the boundary as plain data:
//! numbers, strings, booleans, null, arrays and plain objects.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value as Json};

use crate::context::QjsContext;
use crate::error::{QjsError, QjsResult};
use crate::value::{QjsValue, ValueType};

/// Maximum nesting depth in either direction; deeper (or cyclic) data fails
pub const MAX_DEPTH: usize = 100;

impl QjsContext {
    /// Build a JavaScript value from any serializable Rust value
    ///
    /// Integers that fit in 32 bits become integer values, every other
    /// number becomes a double. Map keys must serialize as strings.
    pub fn to_js_value<T: Serialize + ?Sized>(&self, value: &T) -> QjsResult<QjsValue> {
        self.guard()?;
        let json = serde_json::to_value(value)
            .map_err(|e| QjsError::unsupported_type(e.to_string()))?;
        self.build_value(&json, 0)
    }

    fn build_value(&self, json: &Json, depth: usize) -> QjsResult<QjsValue> {
        if depth > MAX_DEPTH {
            return Err(too_deep());
        }
        match json {
            Json::Null => self.create_null(),
            Json::Bool(b) => self.create_boolean(*b),
            Json::Number(n) => match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                Some(i) => self.create_integer(i),
                None => self.create_double(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => self.create_string(s),
            Json::Array(items) => {
                let array = self.create_array()?;
                for (index, item) in items.iter().enumerate() {
                    let index = u32::try_from(index)
                        .map_err(|_| QjsError::unsupported_type("array longer than u32"))?;
                    let element = self.build_value(item, depth + 1)?;
                    array.set_index(index, &element)?;
                }
                Ok(array)
            }
            Json::Object(map) => {
                let object = self.create_object()?;
                for (key, item) in map {
                    let property = self.build_value(item, depth + 1)?;
                    object.set_property(key, &property)?;
                }
                Ok(object)
            }
        }
    }
}

impl QjsValue {
    /// Convert this value into a Rust type
    ///
    /// `undefined`, `null` and non-finite numbers map to JSON `null`.
    /// Functions, symbols and bigints fail with
    /// [`QjsError::UnsupportedType`], as does a shape `T` cannot accept.
    pub fn to_host_object<T: DeserializeOwned>(&self) -> QjsResult<T> {
        let json = self.to_json_value()?;
        serde_json::from_value(json).map_err(|e| QjsError::unsupported_type(e.to_string()))
    }

    /// Convert this value into a [`serde_json::Value`]
    pub fn to_json_value(&self) -> QjsResult<Json> {
        self.guard()?;
        to_json(self, 0)
    }
}

fn to_json(value: &QjsValue, depth: usize) -> QjsResult<Json> {
    if depth > MAX_DEPTH {
        return Err(too_deep());
    }
    let json = match value.value_type()? {
        ValueType::Undefined | ValueType::Null => Json::Null,
        ValueType::Boolean => Json::Bool(value.as_boolean()?),
        ValueType::Integer => Json::Number(value.as_integer()?.into()),
        ValueType::Float => Number::from_f64(value.as_double()?)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        ValueType::String => Json::String(value.as_string()?),
        ValueType::Array => {
            let mut items = Vec::with_capacity(value.length()?);
            for item in value.iter()? {
                items.push(to_json(&item?, depth + 1)?);
            }
            Json::Array(items)
        }
        ValueType::Object => {
            let mut map = Map::new();
            for key in value.keys()? {
                let property = value.get_property(&key)?;
                map.insert(key, to_json(&property, depth + 1)?);
            }
            Json::Object(map)
        }
        other @ (ValueType::Function | ValueType::Symbol | ValueType::BigInt | ValueType::Other) => {
            return Err(QjsError::unsupported_type(format!(
                "cannot convert {} to a host value",
                other
            )));
        }
    };
    Ok(json)
}

fn too_deep() -> QjsError {
    QjsError::unsupported_type(format!("value nested deeper than {} levels", MAX_DEPTH))
}
