//! TypeSchema: reflection of a declared parameter or data model into a
//! JSON-Schema fragment, plus the matching `value -> typed value` coercion.
//!
//! Two idioms are supported side by side:
//!
//! - a typed builder (`TypeDescriptor`, `DataModelDescriptor`) that any tool
//!   author can construct by hand and that the bit-exact rules below act on
//!   directly;
//! - a `schemars`-backed bridge (`json_schema_for::<T>()`) for types that
//!   already derive `JsonSchema`, for callers who'd rather not hand-write a
//!   descriptor.
//!
//! Tool parameter schemas in this crate go through `TypeDescriptor` so the
//! bit-exact shapes in the emission rules are guaranteed; a host embedding
//! its own typed structs can reach for `json_schema_for` instead.

use schemars::JsonSchema;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Int,
    Float,
    Bool,
    String,
}

impl ScalarKind {
    fn json_type(&self) -> &'static str {
        match self {
            ScalarKind::Int => "integer",
            ScalarKind::Float => "number",
            ScalarKind::Bool => "boolean",
            ScalarKind::String => "string",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    pub name: String,
    pub type_desc: TypeDescriptor,
    pub nullable: bool,
    pub default: Option<Value>,
    pub description: Option<String>,
    pub exclude_from_schema: bool,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, type_desc: TypeDescriptor) -> Self {
        Self {
            name: name.into(),
            type_desc,
            nullable: false,
            default: None,
            description: None,
            exclude_from_schema: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn excluded_from_schema(mut self) -> Self {
        self.exclude_from_schema = true;
        self
    }

    /// Nullable/defaulted fields are excluded from `required`.
    fn is_required(&self) -> bool {
        !self.nullable && self.default.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataModelDescriptor {
    pub name: String,
    pub fields: Vec<FieldSchema>,
}

impl DataModelDescriptor {
    pub fn new(name: impl Into<String>, fields: Vec<FieldSchema>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeDescriptor {
    Scalar(ScalarKind),
    /// Untyped array; emits the bare `{"type":"array"}` form rather than
    /// an `items.anyOf` union over scalar types.
    Array(Box<TypeDescriptor>),
    BackedEnumInt { values: Vec<i64> },
    BackedEnumString { values: Vec<String> },
    UnitEnum { cases: Vec<String> },
    DataModel(DataModelDescriptor),
    /// Union of N>1 non-null arms. A `null` arm is never represented here —
    /// nullability is conveyed purely through `FieldSchema::nullable`.
    Union(Vec<TypeDescriptor>),
    /// Ordered collection of DataModels, polymorphic over a discriminator
    /// field mapped to an allowed variant set. See `DataModelArrayDescriptor`.
    DataModelArray(DataModelArrayDescriptor),
}

/// Describes a `DataModelArray`'s variant set: each element of the runtime
/// array is coerced against whichever `DataModelDescriptor` its
/// `discriminator_field` value selects.
#[derive(Debug, Clone, PartialEq)]
pub struct DataModelArrayDescriptor {
    pub discriminator_field: String,
    pub variants: Vec<(String, DataModelDescriptor)>,
}

impl DataModelArrayDescriptor {
    /// Discriminator defaults to `"type"`, matching the common wire
    /// convention; override with `with_discriminator_field`.
    pub fn new(variants: Vec<(String, DataModelDescriptor)>) -> Self {
        Self {
            discriminator_field: "type".to_string(),
            variants,
        }
    }

    pub fn with_discriminator_field(mut self, field: impl Into<String>) -> Self {
        self.discriminator_field = field.into();
        self
    }
}

/// Ordered collection of DataModel instances (each a coerced
/// `serde_json::Value` object, consistent with `coerce`'s "typed value is a
/// normalised Value" contract — there is no single concrete `DataModel`
/// struct in this crate for the same reason).
#[derive(Debug, Clone, PartialEq)]
pub struct DataModelArray {
    items: Vec<Value>,
}

impl DataModelArray {
    /// Builds directly from an already-flat list. No single-nested-list
    /// unwrapping here; that heuristic lives only in `from_value`, on the
    /// deserialisation path.
    pub fn new(items: Vec<Value>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Value> {
        self.items
    }

    /// Accepts either a bare list, or — for backward compatibility with
    /// previously serialised payloads — a single-element list whose sole
    /// element is itself a list (`count==1 && is_list`), which is unwrapped
    /// one level. Discouraged for new callers; see `new`.
    pub fn from_value(value: &Value) -> Result<Self, CoerceError> {
        let items = match value {
            Value::Array(items) if items.len() == 1 && items[0].is_array() => {
                items[0].as_array().expect("checked is_array above").clone()
            }
            Value::Array(items) => items.clone(),
            other => {
                return Err(CoerceError::TypeMismatch {
                    expected: "array",
                    actual: value_kind(other).into(),
                })
            }
        };
        Ok(Self { items })
    }
}

/// Process-wide, read-mostly cache keyed by an explicit type identifier.
/// Lock-on-write is sufficient since writes are rare relative to reads.
#[derive(Default)]
pub struct SchemaCache {
    entries: RwLock<HashMap<String, Value>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compute(&self, key: &str, compute: impl FnOnce() -> Value) -> Value {
        if let Some(v) = self.entries.read().unwrap().get(key) {
            return v.clone();
        }
        let v = compute();
        self.entries.write().unwrap().insert(key.to_string(), v.clone());
        v
    }

    /// Explicit invalidation, needed for testing.
    pub fn reset(&self) {
        self.entries.write().unwrap().clear();
    }
}

/// `schemaFor(type) -> JsonSchema`, applying the bit-exact emission rules
/// for scalars, nullability, enums, nested models, and tagged unions.
pub fn schema_for(td: &TypeDescriptor) -> Value {
    match td {
        TypeDescriptor::Scalar(kind) => {
            serde_json::json!({ "type": kind.json_type() })
        }
        TypeDescriptor::Array(_inner) => {
            serde_json::json!({ "type": "array" })
        }
        TypeDescriptor::BackedEnumInt { values } => {
            serde_json::json!({ "type": "integer", "enum": values })
        }
        TypeDescriptor::BackedEnumString { values } => {
            serde_json::json!({ "type": "string", "enum": values })
        }
        TypeDescriptor::UnitEnum { cases } => {
            serde_json::json!({ "type": "string", "enum": cases })
        }
        TypeDescriptor::DataModel(model) => schema_for_data_model(model),
        TypeDescriptor::Union(arms) => schema_for_union(arms),
        TypeDescriptor::DataModelArray(descriptor) => schema_for_data_model_array(descriptor),
    }
}

/// `{type:"array", items:{oneOf:[...]}}`, one arm per variant, each arm's
/// schema carrying the discriminator field pinned to that variant's tag via
/// `const` so a consumer can tell the arms apart without trying each one.
fn schema_for_data_model_array(descriptor: &DataModelArrayDescriptor) -> Value {
    let arms: Vec<Value> = descriptor
        .variants
        .iter()
        .map(|(tag, model)| {
            let mut arm = schema_for_data_model(model);
            if let Some(obj) = arm.as_object_mut() {
                if let Some(props) = obj.get_mut("properties").and_then(Value::as_object_mut) {
                    props.insert(
                        descriptor.discriminator_field.clone(),
                        serde_json::json!({ "type": "string", "const": tag }),
                    );
                }
                if let Some(required) = obj.get_mut("required").and_then(Value::as_array_mut) {
                    required.push(Value::String(descriptor.discriminator_field.clone()));
                }
            }
            arm
        })
        .collect();
    serde_json::json!({
        "type": "array",
        "items": { "oneOf": arms },
    })
}

fn schema_for_data_model(model: &DataModelDescriptor) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for field in &model.fields {
        if field.exclude_from_schema {
            continue;
        }
        let mut field_schema = schema_for(&field.type_desc);
        if let Some(obj) = field_schema.as_object_mut() {
            if let Some(desc) = &field.description {
                obj.insert("description".into(), Value::String(desc.clone()));
            }
            if let Some(default) = &field.default {
                obj.insert("default".into(), default.clone());
            }
        }
        properties.insert(field.name.clone(), field_schema);
        if field.is_required() {
            required.push(Value::String(field.name.clone()));
        }
    }

    serde_json::json!({
        "type": "object",
        "properties": Value::Object(properties),
        "required": Value::Array(required),
    })
}

/// Union emission: `{oneOf:[...]}` for N>1 arms; a single remaining arm
/// (after the null arm has already been dropped upstream, see
/// `FieldSchema::nullable`) is emitted directly rather than wrapped.
fn schema_for_union(arms: &[TypeDescriptor]) -> Value {
    match arms.len() {
        0 => serde_json::json!({}),
        1 => schema_for(&arms[0]),
        _ => {
            let one_of: Vec<Value> = arms.iter().map(schema_for).collect();
            serde_json::json!({ "oneOf": one_of })
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoerceError {
    #[error("expected {expected}, got {actual}")]
    TypeMismatch { expected: &'static str, actual: String },
    #[error("no union arm accepted the value")]
    NoUnionArmMatched,
    #[error("missing required field '{0}'")]
    MissingField(String),
}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// `coerce(value, type) -> typed value | error`. The "typed value" here is a normalised `serde_json::Value` — the
/// caller (a tool invoker or `DataModel::from_map`) is responsible for the
/// final move into a concrete Rust type, since this module has no
/// compile-time knowledge of arbitrary host types.
pub fn coerce(value: &Value, td: &TypeDescriptor) -> Result<Value, CoerceError> {
    match td {
        TypeDescriptor::Scalar(kind) => coerce_scalar(value, *kind),
        TypeDescriptor::Array(inner) => match value {
            Value::Array(items) => {
                let coerced: Result<Vec<Value>, CoerceError> =
                    items.iter().map(|item| coerce(item, inner)).collect();
                Ok(Value::Array(coerced?))
            }
            other => Err(CoerceError::TypeMismatch {
                expected: "array",
                actual: value_kind(other).into(),
            }),
        },
        TypeDescriptor::BackedEnumInt { values } => match value {
            Value::Number(n) if n.as_i64().is_some_and(|v| values.contains(&v)) => Ok(value.clone()),
            // try_from failed: leave the raw value, the receiving callback decides.
            other => Ok(other.clone()),
        },
        TypeDescriptor::BackedEnumString { values } => match value {
            Value::String(s) if values.contains(s) => Ok(value.clone()),
            other => Ok(other.clone()),
        },
        TypeDescriptor::UnitEnum { cases } => match value {
            Value::String(s) if cases.contains(s) => Ok(value.clone()),
            other => Ok(other.clone()),
        },
        TypeDescriptor::DataModel(model) => coerce_data_model(value, model),
        TypeDescriptor::Union(arms) => coerce_union(value, arms),
        TypeDescriptor::DataModelArray(descriptor) => coerce_data_model_array(value, descriptor),
    }
}

/// Unwraps `value` via `DataModelArray::from_value`, then coerces each
/// element against the variant its discriminator field selects.
fn coerce_data_model_array(value: &Value, descriptor: &DataModelArrayDescriptor) -> Result<Value, CoerceError> {
    let array = DataModelArray::from_value(value)?;
    let mut out = Vec::with_capacity(array.items.len());
    for item in array.items {
        let tag = item
            .as_object()
            .and_then(|obj| obj.get(&descriptor.discriminator_field))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CoerceError::MissingField(descriptor.discriminator_field.clone()))?;
        let model = descriptor
            .variants
            .iter()
            .find(|(variant_tag, _)| *variant_tag == tag)
            .map(|(_, model)| model)
            .ok_or_else(|| CoerceError::TypeMismatch {
                expected: "a known discriminator variant",
                actual: tag.clone(),
            })?;
        out.push(coerce_data_model(&item, model)?);
    }
    Ok(Value::Array(out))
}

fn coerce_scalar(value: &Value, kind: ScalarKind) -> Result<Value, CoerceError> {
    let ok = match kind {
        ScalarKind::Int => value.is_i64() || value.is_u64(),
        ScalarKind::Float => value.is_number(),
        ScalarKind::Bool => value.is_boolean(),
        ScalarKind::String => value.is_string(),
    };
    if ok {
        Ok(value.clone())
    } else {
        Err(CoerceError::TypeMismatch {
            expected: kind.json_type(),
            actual: value_kind(value).into(),
        })
    }
}

fn coerce_data_model(value: &Value, model: &DataModelDescriptor) -> Result<Value, CoerceError> {
    let obj = match value {
        Value::Object(o) => o,
        other => {
            return Err(CoerceError::TypeMismatch {
                expected: "object",
                actual: value_kind(other).into(),
            })
        }
    };

    let mut out = Map::new();
    let mut extras = Map::new();
    let known: std::collections::HashSet<&str> =
        model.fields.iter().map(|f| f.name.as_str()).collect();

    for field in &model.fields {
        match obj.get(&field.name) {
            Some(v) => {
                out.insert(field.name.clone(), coerce(v, &field.type_desc)?);
            }
            None => {
                if let Some(default) = &field.default {
                    out.insert(field.name.clone(), default.clone());
                } else if field.is_required() {
                    return Err(CoerceError::MissingField(field.name.clone()));
                }
            }
        }
    }

    for (k, v) in obj {
        if !known.contains(k.as_str()) {
            extras.insert(k.clone(), v.clone());
        }
    }
    if !extras.is_empty() {
        out.insert("extras".into(), Value::Object(extras));
    }

    Ok(Value::Object(out))
}

/// Try each non-null arm in listed order, skipping arms that cannot accept
/// the runtime type; the first arm whose coercion succeeds wins. For a map
/// against a union of data models, prefer the arm whose required-key set
/// matches exactly, falling back to the first arm that merely coerces.
fn coerce_union(value: &Value, arms: &[TypeDescriptor]) -> Result<Value, CoerceError> {
    if let Value::Object(obj) = value {
        let keys: std::collections::HashSet<&str> = obj.keys().map(String::as_str).collect();
        let mut first_success: Option<Value> = None;
        for arm in arms {
            if let TypeDescriptor::DataModel(model) = arm {
                let required: std::collections::HashSet<&str> = model
                    .fields
                    .iter()
                    .filter(|f| f.is_required())
                    .map(|f| f.name.as_str())
                    .collect();
                if required == keys.iter().copied().collect() {
                    if let Ok(c) = coerce_data_model(value, model) {
                        return Ok(c);
                    }
                }
                if first_success.is_none() {
                    if let Ok(c) = coerce_data_model(value, model) {
                        first_success = Some(c);
                    }
                }
            }
        }
        if let Some(v) = first_success {
            return Ok(v);
        }
    }

    for arm in arms {
        if arm_can_accept(value, arm) {
            if let Ok(c) = coerce(value, arm) {
                return Ok(c);
            }
        }
    }
    Err(CoerceError::NoUnionArmMatched)
}

fn arm_can_accept(value: &Value, arm: &TypeDescriptor) -> bool {
    matches!(
        (value, arm),
        (Value::String(_), TypeDescriptor::Scalar(ScalarKind::String))
            | (Value::Bool(_), TypeDescriptor::Scalar(ScalarKind::Bool))
            | (Value::Number(_), TypeDescriptor::Scalar(ScalarKind::Int))
            | (Value::Number(_), TypeDescriptor::Scalar(ScalarKind::Float))
            | (Value::Array(_), TypeDescriptor::Array(_))
            | (Value::Object(_), TypeDescriptor::DataModel(_))
            | (Value::String(_), TypeDescriptor::BackedEnumString { .. })
            | (Value::Number(_), TypeDescriptor::BackedEnumInt { .. })
            | (Value::String(_), TypeDescriptor::UnitEnum { .. })
    )
}

/// `schemars`-backed bridge for hosts that already derive `JsonSchema` on
/// their own types, rather than building a `TypeDescriptor` by hand.
pub fn json_schema_for<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_emit_bit_exact_shapes() {
        assert_eq!(schema_for(&TypeDescriptor::Scalar(ScalarKind::Int)), serde_json::json!({"type":"integer"}));
        assert_eq!(schema_for(&TypeDescriptor::Scalar(ScalarKind::Float)), serde_json::json!({"type":"number"}));
        assert_eq!(schema_for(&TypeDescriptor::Scalar(ScalarKind::Bool)), serde_json::json!({"type":"boolean"}));
        assert_eq!(schema_for(&TypeDescriptor::Scalar(ScalarKind::String)), serde_json::json!({"type":"string"}));
    }

    #[test]
    fn untyped_array_emits_bare_shape() {
        let td = TypeDescriptor::Array(Box::new(TypeDescriptor::Scalar(ScalarKind::String)));
        assert_eq!(schema_for(&td), serde_json::json!({"type":"array"}));
    }

    #[test]
    fn backed_enums_emit_enum_values() {
        let int_enum = TypeDescriptor::BackedEnumInt { values: vec![1, 2, 3] };
        assert_eq!(schema_for(&int_enum), serde_json::json!({"type":"integer","enum":[1,2,3]}));

        let str_enum = TypeDescriptor::BackedEnumString { values: vec!["a".into(), "b".into()] };
        assert_eq!(schema_for(&str_enum), serde_json::json!({"type":"string","enum":["a","b"]}));
    }

    #[test]
    fn unit_enum_emits_case_names() {
        let td = TypeDescriptor::UnitEnum { cases: vec!["Red".into(), "Green".into()] };
        assert_eq!(schema_for(&td), serde_json::json!({"type":"string","enum":["Red","Green"]}));
    }

    #[test]
    fn nullable_field_excluded_from_required() {
        let model = DataModelDescriptor::new(
            "Widget",
            vec![
                FieldSchema::new("name", TypeDescriptor::Scalar(ScalarKind::String)),
                FieldSchema::new("note", TypeDescriptor::Scalar(ScalarKind::String)).nullable(),
            ],
        );
        let schema = schema_for(&TypeDescriptor::DataModel(model));
        let required: Vec<&str> = schema["required"].as_array().unwrap().iter().map(|v| v.as_str().unwrap()).collect();
        assert_eq!(required, vec!["name"]);
    }

    #[test]
    fn union_of_two_arms_emits_one_of() {
        let td = TypeDescriptor::Union(vec![
            TypeDescriptor::Scalar(ScalarKind::Int),
            TypeDescriptor::Scalar(ScalarKind::String),
        ]);
        let schema = schema_for(&td);
        assert!(schema["oneOf"].is_array());
        assert_eq!(schema["oneOf"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn union_with_single_remaining_arm_collapses() {
        let td = TypeDescriptor::Union(vec![TypeDescriptor::Scalar(ScalarKind::Int)]);
        assert_eq!(schema_for(&td), serde_json::json!({"type":"integer"}));
    }

    #[test]
    fn data_model_coercion_deposits_unknown_keys_in_extras() {
        let model = DataModelDescriptor::new(
            "Widget",
            vec![FieldSchema::new("name", TypeDescriptor::Scalar(ScalarKind::String))],
        );
        let value = serde_json::json!({"name": "gizmo", "color": "red"});
        let coerced = coerce(&value, &TypeDescriptor::DataModel(model)).unwrap();
        assert_eq!(coerced["name"], "gizmo");
        assert_eq!(coerced["extras"]["color"], "red");
    }

    fn shape_variants() -> DataModelArrayDescriptor {
        let circle = DataModelDescriptor::new(
            "Circle",
            vec![FieldSchema::new("radius", TypeDescriptor::Scalar(ScalarKind::Float))],
        );
        let square = DataModelDescriptor::new(
            "Square",
            vec![FieldSchema::new("side", TypeDescriptor::Scalar(ScalarKind::Float))],
        );
        DataModelArrayDescriptor::new(vec![("circle".into(), circle), ("square".into(), square)])
    }

    #[test]
    fn data_model_array_schema_pins_the_discriminator_per_variant() {
        let schema = schema_for(&TypeDescriptor::DataModelArray(shape_variants()));
        assert_eq!(schema["type"], "array");
        let arms = schema["items"]["oneOf"].as_array().unwrap();
        assert_eq!(arms.len(), 2);
        assert_eq!(arms[0]["properties"]["type"]["const"], "circle");
        assert_eq!(arms[1]["properties"]["type"]["const"], "square");
    }

    #[test]
    fn data_model_array_coerces_each_element_by_discriminator() {
        let value = serde_json::json!([
            {"type": "circle", "radius": 2.0},
            {"type": "square", "side": 3.0},
        ]);
        let coerced = coerce(&value, &TypeDescriptor::DataModelArray(shape_variants())).unwrap();
        let items = coerced.as_array().unwrap();
        assert_eq!(items[0]["radius"], 2.0);
        assert_eq!(items[1]["side"], 3.0);
    }

    #[test]
    fn data_model_array_rejects_unknown_discriminator_value() {
        let value = serde_json::json!([{"type": "triangle", "radius": 1.0}]);
        let err = coerce(&value, &TypeDescriptor::DataModelArray(shape_variants())).unwrap_err();
        assert!(matches!(err, CoerceError::TypeMismatch { .. }));
    }

    #[test]
    fn data_model_array_from_value_unwraps_single_nested_list() {
        let nested = serde_json::json!([[{"type": "circle", "radius": 1.0}]]);
        let array = DataModelArray::from_value(&nested).unwrap();
        assert_eq!(array.items().len(), 1);

        let flat = serde_json::json!([{"type": "circle", "radius": 1.0}]);
        let array = DataModelArray::from_value(&flat).unwrap();
        assert_eq!(array.items().len(), 1);
    }

    #[test]
    fn data_model_array_new_does_not_apply_the_unwrap_heuristic() {
        let nested = vec![serde_json::json!([{"type": "circle", "radius": 1.0}])];
        let array = DataModelArray::new(nested.clone());
        assert_eq!(array.into_items(), nested);
    }

    #[test]
    fn schema_cache_returns_same_value_without_recompute() {
        let cache = SchemaCache::new();
        let mut calls = 0;
        let a = cache.get_or_compute("Widget", || {
            calls += 1;
            serde_json::json!({"type":"object"})
        });
        let b = cache.get_or_compute("Widget", || {
            calls += 1;
            serde_json::json!({"type":"object"})
        });
        assert_eq!(a, b);
        assert_eq!(calls, 1);
        cache.reset();
        cache.get_or_compute("Widget", || {
            calls += 1;
            serde_json::json!({"type":"object"})
        });
        assert_eq!(calls, 2);
    }
}
