//! Asset identity and the closed set of asset kinds.
//!
//! Assets live in a flat arena owned by the [`Session`](crate::Session);
//! all cross-links (parent, children, source) are arena indices. The
//! per-kind payload is a tagged union rather than dynamic dispatch, so
//! every consumer states exactly which kinds it accepts.

use crate::formula::Formula;
use crate::node::NodeData;
use crate::refs::{unquote, Ref};
use dson_math::Vec3;
use serde_json::{Map, Value};

/// Index of an [`Asset`] in the session arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default)]
pub struct AssetId(pub(crate) u32);

impl AssetId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of an [`Instance`](crate::instance::Instance) in the session arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct InstanceId(pub(crate) u32);

impl InstanceId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// One parsed library entry (or file, or scene node definition).
#[derive(Debug)]
pub struct Asset {
    /// The asset's own normalized reference.
    pub id: Ref,
    /// The file this asset was defined in.
    pub fileref: String,
    pub url: Option<String>,
    pub name: String,
    pub label: Option<String>,
    pub type_name: Option<String>,
    pub visible: bool,
    pub parent: Option<AssetId>,
    pub children: Vec<AssetId>,
    /// Delegation target: this asset is a live alias of another.
    pub source: Option<AssetId>,
    /// Back-link from a delegation target to the asset aliasing it.
    pub sourcing: Option<AssetId>,
    pub formulas: Vec<Formula>,
    pub data: AssetData,
}

/// Per-kind payload.
#[derive(Debug)]
pub enum AssetData {
    File(FileData),
    Node(NodeData),
    /// Geometry, UV sets, images and materials are consumed by external
    /// builders; the core only tracks their identity for resolution.
    Geometry,
    UvSet,
    Image,
    Material,
    SkinBinding,
    Channel(ChannelData),
    Morph(MorphData),
    Alias(AliasData),
}

#[derive(Debug, Default)]
pub struct FileData {
    pub toplevel: bool,
    /// Scene node placements declared by this file, in document order.
    pub nodes: Vec<(AssetId, InstanceId)>,
    /// Scene modifier references declared by this file.
    pub modifiers: Vec<AssetId>,
}

/// A scalar channel asset (a morph slider or custom property).
#[derive(Clone, Debug)]
pub struct ChannelData {
    pub channel_type: String,
    /// Live value; starts at the declared value, mutated by direct
    /// formula application.
    pub value: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Default for ChannelData {
    fn default() -> Self {
        ChannelData {
            channel_type: "float".to_string(),
            value: 0.0,
            min: None,
            max: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct MorphData {
    pub channel: ChannelData,
    pub vertex_count: i64,
}

#[derive(Debug, Default)]
pub struct AliasData {
    pub target: Option<AssetId>,
}

impl Asset {
    pub fn new(fileref: &str, data: AssetData) -> Asset {
        Asset {
            id: Ref::normalize(fileref),
            fileref: fileref.to_string(),
            url: None,
            name: String::new(),
            label: None,
            type_name: None,
            visible: true,
            parent: None,
            children: Vec::new(),
            source: None,
            sourcing: None,
            formulas: Vec::new(),
            data,
        }
    }

    /// Read the identity fields shared by every library entry.
    pub fn parse_common(&mut self, s: &Map<String, Value>) {
        if let Some(name) = s.get("name").and_then(Value::as_str) {
            self.name = name.to_string();
        }
        if let Some(label) = s.get("label").and_then(Value::as_str) {
            self.label = Some(label.to_string());
        }
        if let Some(ty) = s.get("type").and_then(Value::as_str) {
            self.type_name = Some(ty.to_string());
        }
        if let Some(url) = s.get("url").and_then(Value::as_str) {
            self.url = Some(url.to_string());
        }
        if let Some(channel) = s.get("channel").and_then(Value::as_object) {
            if let Some(visible) = channel.get("visible").and_then(Value::as_bool) {
                self.visible = visible;
            }
            if self.label.is_none() {
                if let Some(label) = channel.get("label").and_then(Value::as_str) {
                    self.label = Some(label.to_string());
                }
            }
        }
    }

    /// Display name: label, falling back to name, falling back to the
    /// id fragment, percent-decoded.
    pub fn get_name(&self) -> String {
        if let Some(label) = &self.label {
            return unquote(label);
        }
        if !self.name.is_empty() {
            return unquote(&self.name);
        }
        unquote(self.id.fragment().unwrap_or(self.id.as_str()))
    }

    pub fn file(&self) -> Option<&FileData> {
        match &self.data {
            AssetData::File(file) => Some(file),
            _ => None,
        }
    }

    pub fn file_mut(&mut self) -> Option<&mut FileData> {
        match &mut self.data {
            AssetData::File(file) => Some(file),
            _ => None,
        }
    }

    pub fn node(&self) -> Option<&NodeData> {
        match &self.data {
            AssetData::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn node_mut(&mut self) -> Option<&mut NodeData> {
        match &mut self.data {
            AssetData::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn channel(&self) -> Option<&ChannelData> {
        match &self.data {
            AssetData::Channel(ch) => Some(ch),
            AssetData::Morph(morph) => Some(&morph.channel),
            _ => None,
        }
    }

    pub fn channel_mut(&mut self) -> Option<&mut ChannelData> {
        match &mut self.data {
            AssetData::Channel(ch) => Some(ch),
            AssetData::Morph(morph) => Some(&mut morph.channel),
            _ => None,
        }
    }
}

/// The live value of a channel struct: `current_value` wins over `value`.
pub fn current_value(channel: &Map<String, Value>) -> Option<&Value> {
    channel
        .get("current_value")
        .or_else(|| channel.get("value"))
}

pub fn value_to_f32(v: &Value) -> Option<f32> {
    v.as_f64().map(|x| x as f32)
}

pub fn value_to_vec3(v: &Value) -> Option<Vec3> {
    let arr = v.as_array()?;
    if arr.len() < 3 {
        return None;
    }
    Some(Vec3::new(
        arr[0].as_f64()? as f32,
        arr[1].as_f64()? as f32,
        arr[2].as_f64()? as f32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_common() {
        let mut asset = Asset::new("/data/base.dsf", AssetData::Geometry);
        asset.parse_common(&obj(json!({
            "name": "hip",
            "label": "Hip",
            "type": "bone",
            "url": "#hip"
        })));
        assert_eq!(asset.name, "hip");
        assert_eq!(asset.label.as_deref(), Some("Hip"));
        assert_eq!(asset.type_name.as_deref(), Some("bone"));
        assert_eq!(asset.get_name(), "Hip");
    }

    #[test]
    fn test_channel_visibility() {
        let mut asset = Asset::new("/data/m.dsf", AssetData::Channel(ChannelData::default()));
        asset.parse_common(&obj(json!({
            "channel": { "visible": false, "label": "Smile" }
        })));
        assert!(!asset.visible);
        assert_eq!(asset.get_name(), "Smile");
    }

    #[test]
    fn test_current_value_wins() {
        let ch = obj(json!({ "value": 1.0, "current_value": 0.25 }));
        assert_eq!(current_value(&ch).and_then(Value::as_f64), Some(0.25));
        let ch = obj(json!({ "value": 1.0 }));
        assert_eq!(current_value(&ch).and_then(Value::as_f64), Some(1.0));
    }

    #[test]
    fn test_value_to_vec3() {
        let v = json!([1.0, 2.0, 3.0]);
        assert_eq!(value_to_vec3(&v), Some(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(value_to_vec3(&json!([1.0])), None);
    }
}
