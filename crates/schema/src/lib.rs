//! cfgsync schema: translate source objects into the canonical store schema.
//!
//! Field names are rewritten to snake_case, `spec` members are hoisted to the
//! top level, reference sections become `<type>_refs` edge lists, and every
//! list/map property gets an explicit empty marker.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use cfgsync_core::{TranslateError, Translated, Translator, Uid};
use serde_json::{Map, Value};

/// Convert a camelCase / PascalCase name to snake_case.
///
/// A `_` is inserted before an uppercase letter when the previous char is a
/// lowercase letter or digit, or when the previous char is uppercase and the
/// next one is lowercase (end of an acronym run). All letters are then
/// lowercased, non-ASCII ones included. Digits never start a new word on their
/// own, so leading digits stay attached: `3dModel` -> `3d_model`. Input without
/// uppercase letters is returned unchanged, which makes the conversion
/// idempotent.
pub fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).map_or(false, |n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower) {
                out.push('_');
            }
        }
        out.extend(c.to_lowercase());
    }
    out
}

/// Recursively rewrite object keys; scalars are copied verbatim.
pub fn convert_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, child) in map.iter() {
                out.insert(snake_case(k), convert_value(child));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(convert_value).collect()),
        other => other.clone(),
    }
}

/// Returns the target-type prefix if `key` names a reference section.
fn reference_prefix(key: &str) -> Option<&str> {
    if key == "references" {
        return Some("");
    }
    key.strip_suffix("References")
        .or_else(|| key.strip_suffix("Reference"))
}

fn push_edges(
    key: &str,
    prefix: &str,
    section: &Value,
    refs: &mut BTreeMap<String, Vec<Value>>,
) -> Result<(), TranslateError> {
    let elements: Vec<&Value> = match section {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![section],
        Value::Null => Vec::new(),
        _ => {
            return Err(TranslateError::InvalidField {
                field: key.to_string(),
                reason: "reference section must be an object or array".into(),
            })
        }
    };
    if elements.is_empty() && !prefix.is_empty() {
        // keep the (empty) edge list so the empty marker is recorded
        refs.entry(format!("{}_refs", snake_case(prefix))).or_default();
    }
    for el in elements {
        let obj = el.as_object().ok_or_else(|| TranslateError::InvalidField {
            field: key.to_string(),
            reason: "reference entry must be an object".into(),
        })?;
        let target = match obj.get("kind").and_then(Value::as_str) {
            Some(kind) if !kind.is_empty() => snake_case(kind),
            _ if !prefix.is_empty() => snake_case(prefix),
            _ => {
                return Err(TranslateError::InvalidField {
                    field: key.to_string(),
                    reason: "reference entry without kind".into(),
                })
            }
        };
        let mut edge = Map::new();
        if let Some(name) = obj.get("name").and_then(Value::as_str) {
            let mut to = Vec::with_capacity(2);
            if let Some(ns) = obj.get("namespace").and_then(Value::as_str) {
                to.push(Value::String(ns.to_string()));
            }
            to.push(Value::String(name.to_string()));
            edge.insert("to".into(), Value::Array(to));
        }
        if let Some(uid) = obj.get("uid").and_then(Value::as_str) {
            edge.insert("uuid".into(), Value::String(uid.to_string()));
        }
        if let Some(attr) = obj.get("attributes") {
            edge.insert("attr".into(), convert_value(attr));
        }
        refs.entry(format!("{}_refs", target)).or_default().push(Value::Object(edge));
    }
    Ok(())
}

fn required_str<'a>(v: Option<&'a Value>, field: &'static str) -> Result<&'a str, TranslateError> {
    match v {
        None | Some(Value::Null) => Err(TranslateError::MissingField(field)),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.as_str()),
        Some(_) => Err(TranslateError::InvalidField {
            field: field.to_string(),
            reason: "expected a non-empty string".into(),
        }),
    }
}

/// Translate one source object into its canonical record.
pub fn translate_object(raw: &Value) -> Result<Translated, TranslateError> {
    let obj = raw.as_object().ok_or(TranslateError::NotAnObject)?;
    let meta = obj
        .get("metadata")
        .and_then(Value::as_object)
        .ok_or(TranslateError::MissingField("metadata"))?;
    let uid = required_str(meta.get("uid"), "metadata.uid")?;
    let kind = required_str(obj.get("kind"), "kind")?;

    let mut props = Map::new();
    let mut refs: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for (key, value) in obj.iter() {
        match key.as_str() {
            "apiVersion" | "kind" | "metadata" => {}
            "spec" => match value {
                Value::Object(spec) => {
                    for (member, v) in spec.iter() {
                        match reference_prefix(member) {
                            Some(prefix) => push_edges(member, prefix, v, &mut refs)?,
                            None => {
                                props.insert(snake_case(member), convert_value(v));
                            }
                        }
                    }
                }
                other => {
                    props.insert("spec".into(), convert_value(other));
                }
            },
            _ => {
                props.insert(snake_case(key), convert_value(value));
            }
        }
    }
    for (edge_key, edges) in refs {
        props.insert(edge_key, Value::Array(edges));
    }

    let mut empty_props = BTreeMap::new();
    for (k, v) in props.iter() {
        match v {
            Value::Array(a) => {
                empty_props.insert(k.clone(), a.is_empty());
            }
            Value::Object(m) => {
                empty_props.insert(k.clone(), m.is_empty());
            }
            _ => {}
        }
    }

    // Identity fields are written last so they win over same-named spec members.
    let mut record = props;
    record.insert("uuid".into(), Value::String(uid.to_string()));
    record.insert("type".into(), Value::String(snake_case(kind)));
    if let Some(name) = meta.get("name").and_then(Value::as_str) {
        let mut fq_name = Vec::with_capacity(2);
        if let Some(ns) = meta.get("namespace").and_then(Value::as_str) {
            fq_name.push(Value::String(ns.to_string()));
        }
        fq_name.push(Value::String(name.to_string()));
        record.insert("name".into(), Value::String(name.to_string()));
        record.insert("fq_name".into(), Value::Array(fq_name));
    }
    if let Some(rv) = meta.get("resourceVersion").and_then(Value::as_str) {
        record.insert("resource_version".into(), Value::String(rv.to_string()));
    }

    Ok(Translated { record: Value::Object(record), empty_props })
}

/// Default translator used by the partition pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaTranslator;

impl Translator for SchemaTranslator {
    fn translate(&self, uid: &Uid, raw: &Value) -> Result<Translated, TranslateError> {
        let out = translate_object(raw)?;
        let record_uid = out.record.get("uuid").and_then(Value::as_str).unwrap_or("");
        if record_uid != uid.as_str() {
            return Err(TranslateError::InvalidField {
                field: "metadata.uid".into(),
                reason: format!("object uid {} does not match request uid {}", record_uid, uid),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snake_case_examples() {
        assert_eq!(snake_case("someMixedCASEName"), "some_mixed_case_name");
        assert_eq!(snake_case("virtualNetwork"), "virtual_network");
        assert_eq!(snake_case("VirtualNetwork"), "virtual_network");
        assert_eq!(snake_case("HTTPServer"), "http_server");
        assert_eq!(snake_case("ID"), "id");
        assert_eq!(snake_case("ipv4Address"), "ipv4_address");
        assert_eq!(snake_case("v1Alpha1"), "v1_alpha1");
        assert_eq!(snake_case("3dModel"), "3d_model");
        assert_eq!(snake_case("podIDs"), "pod_i_ds");
        assert_eq!(snake_case(""), "");
    }

    #[test]
    fn snake_case_is_idempotent() {
        for name in ["someMixedCASEName", "already_snake", "HTTPServer", "a1B2c3", "foo_Bar", "x"] {
            let once = snake_case(name);
            assert_eq!(snake_case(&once), once, "not idempotent for {}", name);
        }
        assert_eq!(snake_case("foo_Bar"), "foo_bar");
        assert_eq!(snake_case("_private"), "_private");
    }

    #[test]
    fn snake_case_lowercases_non_ascii_letters() {
        assert_eq!(snake_case("ÜberName"), "über_name");
        assert_eq!(snake_case("straßeÄnderung"), "straße_änderung");
        assert_eq!(snake_case("über_name"), "über_name");
    }

    #[test]
    fn translates_object_and_hoists_spec() {
        let raw = json!({
            "apiVersion": "core.example.io/v1",
            "kind": "VirtualNetwork",
            "metadata": { "name": "vn1", "namespace": "default", "uid": "u-1", "resourceVersion": "42" },
            "spec": {
                "forwardingMode": "l3",
                "subnetIpamList": [{ "ipamSubnets": [{ "defaultGateway": "10.0.0.1" }] }],
                "routeTargets": []
            },
            "status": { "lastState": "ok" }
        });
        let out = translate_object(&raw).expect("translate");
        let rec = &out.record;
        assert_eq!(rec["uuid"], "u-1");
        assert_eq!(rec["type"], "virtual_network");
        assert_eq!(rec["fq_name"], json!(["default", "vn1"]));
        assert_eq!(rec["resource_version"], "42");
        assert_eq!(rec["forwarding_mode"], "l3");
        assert_eq!(rec["subnet_ipam_list"][0]["ipam_subnets"][0]["default_gateway"], "10.0.0.1");
        assert_eq!(rec["status"]["last_state"], "ok");
        assert!(rec.get("spec").is_none());
        assert!(rec.get("api_version").is_none());
        assert_eq!(out.empty_props.get("route_targets"), Some(&true));
        assert_eq!(out.empty_props.get("subnet_ipam_list"), Some(&false));
        assert_eq!(out.empty_props.get("forwarding_mode"), None);
    }

    #[test]
    fn references_become_edges() {
        let raw = json!({
            "kind": "VirtualMachineInterface",
            "metadata": { "name": "vmi", "uid": "u-2" },
            "spec": {
                "virtualNetworkReferences": [
                    { "name": "vn1", "namespace": "default", "uid": "u-1", "attributes": { "vlanTag": 7 } }
                ],
                "parentReference": { "kind": "Project", "name": "p", "uid": "u-0" },
                "securityGroupReferences": []
            }
        });
        let out = translate_object(&raw).expect("translate");
        let rec = &out.record;
        assert_eq!(
            rec["virtual_network_refs"],
            json!([{ "to": ["default", "vn1"], "uuid": "u-1", "attr": { "vlan_tag": 7 } }])
        );
        assert_eq!(rec["project_refs"], json!([{ "to": ["p"], "uuid": "u-0" }]));
        assert_eq!(rec["security_group_refs"], json!([]));
        assert_eq!(out.empty_props.get("security_group_refs"), Some(&true));
        assert_eq!(out.empty_props.get("virtual_network_refs"), Some(&false));
        assert!(rec.get("virtual_network_references").is_none());
    }

    #[test]
    fn missing_required_fields_fail() {
        assert_eq!(translate_object(&json!([])), Err(TranslateError::NotAnObject));
        assert_eq!(
            translate_object(&json!({ "kind": "A" })),
            Err(TranslateError::MissingField("metadata"))
        );
        assert_eq!(
            translate_object(&json!({ "kind": "A", "metadata": {} })),
            Err(TranslateError::MissingField("metadata.uid"))
        );
        assert_eq!(
            translate_object(&json!({ "metadata": { "uid": "u" } })),
            Err(TranslateError::MissingField("kind"))
        );
        assert!(matches!(
            translate_object(&json!({ "kind": "A", "metadata": { "uid": "u" }, "spec": { "fooReference": 3 } })),
            Err(TranslateError::InvalidField { .. })
        ));
    }

    #[test]
    fn translator_checks_request_identity() {
        let raw = json!({ "kind": "A", "metadata": { "uid": "u-9" } });
        assert!(SchemaTranslator.translate(&Uid::parse("u-9"), &raw).is_ok());
        assert!(SchemaTranslator.translate(&Uid::parse("other"), &raw).is_err());
    }
}
