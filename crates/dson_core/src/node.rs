//! Node assets: the spatial entries of a document's `node_library`.

use crate::asset::{current_value, value_to_f32, Asset, AssetData, AssetId, InstanceId};
use crate::error::Result;
use crate::formula::Formula;
use crate::refs::{get_id, get_ref};
use crate::session::{FileContext, Session};
use dson_math::{RotationOrder, Vec3};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum NodeKind {
    #[default]
    Node,
    Figure,
    LegacyFigure,
    Bone,
    Camera,
    Light,
}

impl NodeKind {
    pub fn parse(type_name: Option<&str>) -> NodeKind {
        match type_name {
            Some("figure") => NodeKind::Figure,
            Some("legacy_figure") => NodeKind::LegacyFigure,
            Some("bone") => NodeKind::Bone,
            Some("camera") => NodeKind::Camera,
            Some("light") => NodeKind::Light,
            _ => NodeKind::Node,
        }
    }
}

/// The spatial attributes of a node. Angles are in degrees, as declared.
#[derive(Clone, Debug, PartialEq)]
pub struct Attributes {
    pub center_point: Vec3,
    pub end_point: Vec3,
    pub orientation: Vec3,
    pub translation: Vec3,
    pub rotation: Vec3,
    pub scale: Vec3,
    pub general_scale: f32,
}

impl Default for Attributes {
    fn default() -> Self {
        Attributes {
            center_point: Vec3::ZERO,
            end_point: Vec3::ZERO,
            orientation: Vec3::ZERO,
            translation: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
            general_scale: 1.0,
        }
    }
}

pub(crate) fn component_index(id: &str) -> Option<usize> {
    match id {
        "x" => Some(0),
        "y" => Some(1),
        "z" => Some(2),
        _ => None,
    }
}

impl Attributes {
    pub const CHANNELS: [&'static str; 7] = [
        "center_point",
        "end_point",
        "orientation",
        "translation",
        "rotation",
        "scale",
        "general_scale",
    ];

    /// Apply one named channel from a document struct. Vector channels
    /// arrive as a list of `{id: "x", value}` components; `current_value`
    /// overrides `value` per component.
    pub fn set_channel(&mut self, channel: &str, data: &Value) {
        if channel == "general_scale" {
            if let Some(v) = channel_value(data) {
                self.general_scale = v;
            }
            return;
        }
        let field = match channel {
            "center_point" => &mut self.center_point,
            "end_point" => &mut self.end_point,
            "orientation" => &mut self.orientation,
            "translation" => &mut self.translation,
            "rotation" => &mut self.rotation,
            "scale" => &mut self.scale,
            _ => return,
        };
        if let Some(comps) = data.as_array() {
            for comp in comps {
                let Some(obj) = comp.as_object() else { continue };
                let idx = obj
                    .get("id")
                    .and_then(Value::as_str)
                    .and_then(component_index);
                let value = current_value(obj).and_then(value_to_f32);
                if let (Some(idx), Some(value)) = (idx, value) {
                    field[idx] = value;
                }
            }
        }
    }
}

/// A scalar channel struct or a bare number.
fn channel_value(data: &Value) -> Option<f32> {
    match data {
        Value::Object(obj) => current_value(obj).and_then(value_to_f32),
        _ => value_to_f32(data),
    }
}

/// Payload of a node asset. `attributes` is the live template copied
/// into each instance; `orig_attributes` is the as-declared state the
/// template reverts to after a placement consumes it.
#[derive(Debug, Default)]
pub struct NodeData {
    pub kind: NodeKind,
    pub rotation_order: RotationOrder,
    pub attributes: Attributes,
    pub orig_attributes: Attributes,
    pub instances: BTreeMap<String, InstanceId>,
}

impl Session {
    /// Parse one `node_library` entry into a node asset.
    pub(crate) fn parse_node(
        &mut self,
        cx: &FileContext,
        s: &Map<String, Value>,
    ) -> Result<AssetId> {
        let mut data = NodeData {
            kind: NodeKind::parse(s.get("type").and_then(Value::as_str)),
            ..Default::default()
        };
        if let Some(order) = s.get("rotation_order").and_then(Value::as_str) {
            match RotationOrder::parse(order) {
                Some(order) => data.rotation_order = order,
                None => self.report(format!("Unknown rotation order: {order}"), (2, 4))?,
            }
        }
        for channel in Attributes::CHANNELS {
            if let Some(value) = s.get(channel) {
                data.attributes.set_channel(channel, value);
            }
        }
        data.orig_attributes = data.attributes.clone();

        let mut asset = Asset::new(&cx.fileref, AssetData::Node(data));
        asset.parse_common(s);
        asset.formulas = Formula::parse_list(s.get("formulas"));
        let declared = s.get("id").and_then(Value::as_str).unwrap_or("");
        let rid = get_id(declared, &cx.fileref);
        asset.id = rid.clone();
        let aid = self.alloc_asset(asset);
        self.save_asset(&rid, aid)?;

        if let Some(pref) = s.get("parent").and_then(Value::as_str) {
            if get_ref(pref, &cx.fileref) == rid {
                self.report(format!("Node {rid} cannot be its own parent"), (2, 3))?;
            } else if let Some(parent) = self.get_asset(cx, pref, false)? {
                self.asset_mut(aid).parent = Some(parent);
                self.asset_mut(parent).children.push(aid);
            }
        }
        if let Some(url) = s.get("source").and_then(Value::as_str) {
            self.apply_source(cx, aid, url)?;
        }
        Ok(aid)
    }

    /// Merge a scene-placement struct into an already-parsed node asset.
    /// Scene nodes restate channels (pose values) on top of the library
    /// definition.
    pub(crate) fn update_node(&mut self, aid: AssetId, s: &Map<String, Value>) {
        let asset = self.asset_mut(aid);
        asset.parse_common(s);
        if let Some(node) = asset.node_mut() {
            for channel in Attributes::CHANNELS {
                if let Some(value) = s.get(channel) {
                    node.attributes.set_channel(channel, value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_vector_channel() {
        let mut attrs = Attributes::default();
        attrs.set_channel(
            "center_point",
            &json!([
                { "id": "x", "value": 1.0 },
                { "id": "y", "value": 2.0, "current_value": 5.0 },
                { "id": "z", "value": 3.0 }
            ]),
        );
        assert_eq!(attrs.center_point, Vec3::new(1.0, 5.0, 3.0));
    }

    #[test]
    fn test_set_general_scale() {
        let mut attrs = Attributes::default();
        attrs.set_channel("general_scale", &json!({ "value": 2.0 }));
        assert_eq!(attrs.general_scale, 2.0);
        attrs.set_channel("general_scale", &json!(0.5));
        assert_eq!(attrs.general_scale, 0.5);
    }

    #[test]
    fn test_unknown_channel_ignored() {
        let mut attrs = Attributes::default();
        attrs.set_channel("point_at", &json!([{ "id": "x", "value": 9.0 }]));
        assert_eq!(attrs, Attributes::default());
    }

    #[test]
    fn test_node_kind() {
        assert_eq!(NodeKind::parse(Some("figure")), NodeKind::Figure);
        assert_eq!(NodeKind::parse(Some("bone")), NodeKind::Bone);
        assert_eq!(NodeKind::parse(None), NodeKind::Node);
        assert_eq!(NodeKind::parse(Some("prop")), NodeKind::Node);
    }
}
