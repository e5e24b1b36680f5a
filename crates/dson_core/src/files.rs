//! Document parsing and top-level scene import.
//!
//! A document is one JSON value with library sections (`node_library`,
//! `modifier_library`, geometry/uv/image/material libraries) defining
//! assets, and an optional `scene` section placing them. Referenced
//! files go through the same parser via
//! [`resolve_file`](Session::resolve_file); only the top-level document
//! produces a [`SceneImport`].

use crate::asset::{
    current_value, Asset, AssetData, AssetId, ChannelData, FileData, InstanceId, MorphData,
};
use crate::bone::Rig;
use crate::error::Result;
use crate::formula::Formula;
use crate::node::NodeKind;
use crate::refs::{get_id, Ref};
use crate::session::{FileContext, Session};
use serde_json::{Map, Value};
use std::path::Path;

/// What a top-level document import produced.
#[derive(Debug, Default)]
pub struct SceneImport {
    pub file: AssetId,
    /// Scene node placements, in document order.
    pub nodes: Vec<(AssetId, InstanceId)>,
    /// Placements without a parent; world transforms are composed from
    /// these down.
    pub roots: Vec<InstanceId>,
    /// One rig per figure placement, in scene order.
    pub rigs: Vec<Rig>,
    /// Scene modifier references, for driver building.
    pub modifiers: Vec<AssetId>,
}

impl Session {
    /// Import a scene document from disk. An unreadable or unparseable
    /// top-level file is fatal.
    pub fn import_file(&mut self, path: &Path) -> Result<SceneImport> {
        let text = std::fs::read_to_string(path)?;
        let doc: Value = serde_json::from_str(&text)?;
        let fileref = self.fileref_for_path(path);
        self.import_document(&doc, &fileref)
    }

    /// Import an already-parsed scene document.
    pub fn import_document(&mut self, doc: &Value, fileref: &str) -> Result<SceneImport> {
        let file = self.parse_document(doc, fileref, true)?;
        let mut import = SceneImport {
            file,
            ..Default::default()
        };
        if let Some(data) = self.asset(file).file() {
            import.nodes = data.nodes.clone();
            import.modifiers = data.modifiers.clone();
        }
        import.roots = import
            .nodes
            .iter()
            .map(|&(_, iid)| iid)
            .filter(|&iid| self.instance(iid).parent.is_none())
            .collect();
        for &root in &import.roots {
            self.compose_tree(root);
        }
        for &(_, iid) in &import.nodes {
            match self.instance(iid).kind {
                NodeKind::Figure | NodeKind::LegacyFigure => {
                    let rig = self.build_rig(iid)?;
                    import.rigs.push(rig);
                }
                _ => {}
            }
        }
        Ok(import)
    }

    /// Parse a document from JSON text, for callers that already have
    /// the bytes in hand.
    pub fn parse_document_str(&mut self, text: &str, fileref: &str) -> Result<AssetId> {
        let doc: Value = serde_json::from_str(text)?;
        self.parse_document(&doc, fileref, false)
    }

    /// The content-relative file reference for a filesystem path.
    fn fileref_for_path(&self, path: &Path) -> String {
        for dir in &self.settings.content_dirs {
            if let Ok(rel) = path.strip_prefix(dir) {
                return format!("/{}", rel.to_string_lossy().replace('\\', "/"));
            }
        }
        path.to_string_lossy().replace('\\', "/")
    }

    /// Parse one document's libraries and scene into the registry.
    pub(crate) fn parse_document(
        &mut self,
        doc: &Value,
        fileref: &str,
        toplevel: bool,
    ) -> Result<AssetId> {
        self.push_trace(format!("+FILE {fileref}"));
        let cx = FileContext::new(fileref);

        let mut asset = Asset::new(
            fileref,
            AssetData::File(FileData {
                toplevel,
                ..Default::default()
            }),
        );
        if let Some(info) = doc.get("asset_info").and_then(Value::as_object) {
            asset.parse_common(info);
        }
        let rid = Ref::normalize(fileref);
        asset.id = rid.clone();
        let file = self.alloc_asset(asset);
        self.save_asset(&rid, file)?;

        let stub_sections: [(&str, fn() -> AssetData); 4] = [
            ("geometry_library", || AssetData::Geometry),
            ("uv_set_library", || AssetData::UvSet),
            ("image_library", || AssetData::Image),
            ("material_library", || AssetData::Material),
        ];
        for (section, make) in stub_sections {
            if let Some(entries) = doc.get(section).and_then(Value::as_array) {
                for entry in entries {
                    if let Some(s) = entry.as_object() {
                        self.parse_stub(&cx, s, make())?;
                    }
                }
            }
        }

        if let Some(entries) = doc.get("node_library").and_then(Value::as_array) {
            for entry in entries {
                if let Some(s) = entry.as_object() {
                    self.parse_node(&cx, s)?;
                }
            }
        }
        if let Some(entries) = doc.get("modifier_library").and_then(Value::as_array) {
            for entry in entries {
                if let Some(s) = entry.as_object() {
                    self.parse_modifier(&cx, s)?;
                }
            }
        }

        if let Some(scene) = doc.get("scene").and_then(Value::as_object) {
            self.parse_scene(&cx, file, scene)?;
        }

        self.push_trace(format!("-FILE {fileref}"));
        Ok(file)
    }

    fn parse_scene(
        &mut self,
        cx: &FileContext,
        file: AssetId,
        scene: &Map<String, Value>,
    ) -> Result<()> {
        if let Some(nodes) = scene.get("nodes").and_then(Value::as_array) {
            for entry in nodes {
                let Some(s) = entry.as_object() else { continue };
                let Some(aid) = self.parse_url_asset(cx, s)? else {
                    continue;
                };
                match &self.asset(aid).data {
                    AssetData::Node(_) => {
                        let iid = self.make_instance(cx, aid, s)?;
                        if let Some(data) = self.asset_mut(file).file_mut() {
                            data.nodes.push((aid, iid));
                        }
                    }
                    _ => {
                        let id = self.asset(aid).id.clone();
                        self.report(format!("Expected a node asset: {id}"), (2, 3))?;
                    }
                }
            }
        }
        if let Some(modifiers) = scene.get("modifiers").and_then(Value::as_array) {
            for entry in modifiers {
                let Some(s) = entry.as_object() else { continue };
                let Some(aid) = self.parse_url_asset(cx, s)? else {
                    continue;
                };
                if let Some(data) = self.asset_mut(file).file_mut() {
                    data.modifiers.push(aid);
                }
            }
        }
        Ok(())
    }

    /// A library entry whose payload the core does not elaborate; only
    /// its identity is registered for reference resolution.
    fn parse_stub(
        &mut self,
        cx: &FileContext,
        s: &Map<String, Value>,
        data: AssetData,
    ) -> Result<AssetId> {
        let mut asset = Asset::new(&cx.fileref, data);
        asset.parse_common(s);
        let declared = s.get("id").and_then(Value::as_str).unwrap_or("");
        let rid = get_id(declared, &cx.fileref);
        asset.id = rid.clone();
        let aid = self.alloc_asset(asset);
        self.save_asset(&rid, aid)?;
        Ok(aid)
    }

    /// Dispatch one `modifier_library` entry on its payload key.
    pub(crate) fn parse_modifier(
        &mut self,
        cx: &FileContext,
        s: &Map<String, Value>,
    ) -> Result<Option<AssetId>> {
        let channel = s.get("channel").and_then(Value::as_object);
        let data = if s.contains_key("skin") || s.contains_key("legacy_skin") {
            AssetData::SkinBinding
        } else if let Some(morph) = s.get("morph").and_then(Value::as_object) {
            AssetData::Morph(MorphData {
                channel: channel.map(parse_channel_data).unwrap_or_default(),
                vertex_count: morph
                    .get("vertex_count")
                    .and_then(Value::as_i64)
                    .unwrap_or(0),
            })
        } else if s.contains_key("formulas") {
            AssetData::Channel(channel.map(parse_channel_data).unwrap_or_default())
        } else if let Some(channel) = channel {
            if channel.get("type").and_then(Value::as_str) == Some("alias") {
                AssetData::Alias(Default::default())
            } else {
                AssetData::Channel(parse_channel_data(channel))
            }
        } else {
            let keys: Vec<&String> = s.keys().collect();
            self.report(
                format!("Modifier not implemented in {}: {keys:?}", cx.fileref),
                (2, 4),
            )?;
            return Ok(None);
        };

        let mut asset = Asset::new(&cx.fileref, data);
        asset.parse_common(s);
        asset.formulas = Formula::parse_list(s.get("formulas"));
        let declared = s.get("id").and_then(Value::as_str).unwrap_or("");
        let rid = get_id(declared, &cx.fileref);
        asset.id = rid.clone();
        let aid = self.alloc_asset(asset);
        self.save_asset(&rid, aid)?;

        // An alias forwards to its target channel.
        if let AssetData::Alias(_) = &self.asset(aid).data {
            let target = s
                .get("channel")
                .and_then(Value::as_object)
                .and_then(|ch| ch.get("target_channel"))
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(url) = target {
                let resolved = self.get_asset(cx, &url, false)?;
                if let AssetData::Alias(alias) = &mut self.asset_mut(aid).data {
                    alias.target = resolved;
                }
            }
        }
        Ok(Some(aid))
    }

    /// Resolve a scene entry's `url` to its library asset and merge the
    /// placement struct on top of it.
    pub(crate) fn parse_url_asset(
        &mut self,
        cx: &FileContext,
        s: &Map<String, Value>,
    ) -> Result<Option<AssetId>> {
        let Some(url) = s.get("url").and_then(Value::as_str) else {
            let id = s.get("id").and_then(Value::as_str).unwrap_or("?");
            self.report(
                format!("URL asset failure: no url for {id} in {}", cx.fileref),
                (2, 3),
            )?;
            return Ok(None);
        };
        let url = url.to_string();
        let Some(aid) = self.get_asset(cx, &url, true)? else {
            self.report(format!("URL asset failure: {url}"), (3, 4))?;
            return Ok(None);
        };
        match &self.asset(aid).data {
            AssetData::Node(_) => self.update_node(aid, s),
            AssetData::Channel(_) | AssetData::Morph(_) => {
                if let Some(channel) = s.get("channel").and_then(Value::as_object) {
                    if let Some(value) = current_value(channel).and_then(Value::as_f64) {
                        if let Some(ch) = self.asset_mut(aid).channel_mut() {
                            ch.value = value;
                        }
                    }
                }
            }
            _ => {}
        }
        // The placement id makes the asset addressable from this file.
        if let Some(declared) = s.get("id").and_then(Value::as_str) {
            let rid = get_id(declared, &cx.fileref);
            self.save_asset(&rid, aid)?;
        }
        Ok(Some(aid))
    }
}

fn parse_channel_data(channel: &Map<String, Value>) -> ChannelData {
    ChannelData {
        channel_type: channel
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("float")
            .to_string(),
        value: current_value(channel).and_then(Value::as_f64).unwrap_or(0.0),
        min: channel.get("min").and_then(Value::as_f64),
        max: channel.get("max").and_then(Value::as_f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use serde_json::json;

    fn session() -> Session {
        Session::new(Settings::default())
    }

    #[test]
    fn test_parse_libraries_registers_assets() {
        let mut s = session();
        let doc = json!({
            "asset_info": { "id": "/data/base.dsf" },
            "geometry_library": [ { "id": "torso-geo", "name": "torso" } ],
            "node_library": [ { "id": "hip", "name": "hip", "type": "bone" } ],
            "modifier_library": [
                { "id": "Smile", "name": "Smile",
                  "channel": { "type": "float", "value": 0.25 } }
            ]
        });
        s.parse_document_str(&doc.to_string(), "/data/base.dsf")
            .unwrap();
        let cx = FileContext::new("/data/base.dsf");
        let geo = s.get_asset(&cx, "#torso-geo", false).unwrap().unwrap();
        assert!(matches!(s.asset(geo).data, AssetData::Geometry));
        let smile = s.get_asset(&cx, "#Smile", false).unwrap().unwrap();
        assert_eq!(s.asset(smile).channel().unwrap().value, 0.25);
        assert!(s.get_asset(&cx, "#hip", false).unwrap().is_some());
    }

    #[test]
    fn test_modifier_dispatch() {
        let mut s = session();
        let cx = FileContext::new("/data/m.dsf");
        let skin = s
            .parse_modifier(&cx, json!({ "id": "sk", "skin": {} }).as_object().unwrap())
            .unwrap()
            .unwrap();
        assert!(matches!(s.asset(skin).data, AssetData::SkinBinding));

        let morph = s
            .parse_modifier(
                &cx,
                json!({
                    "id": "mo",
                    "morph": { "vertex_count": 16556 },
                    "channel": { "type": "float", "value": 0.0 }
                })
                .as_object()
                .unwrap(),
            )
            .unwrap()
            .unwrap();
        match &s.asset(morph).data {
            AssetData::Morph(m) => assert_eq!(m.vertex_count, 16556),
            other => panic!("expected morph, got {other:?}"),
        }

        let unknown = s
            .parse_modifier(&cx, json!({ "id": "x", "dform": {} }).as_object().unwrap())
            .unwrap();
        assert!(unknown.is_none());
        assert_eq!(s.warnings().len(), 1);
    }

    #[test]
    fn test_scene_channel_restated_value() {
        let mut s = session();
        let doc = json!({
            "modifier_library": [
                { "id": "Smile", "channel": { "type": "float", "value": 0.0 } }
            ],
            "scene": {
                "modifiers": [
                    { "id": "Smile-1", "url": "#Smile",
                      "channel": { "current_value": 0.75 } }
                ]
            }
        });
        let file = s.parse_document(&doc, "/scene.duf", false).unwrap();
        let modifiers = s.asset(file).file().unwrap().modifiers.clone();
        assert_eq!(modifiers.len(), 1);
        assert_eq!(s.asset(modifiers[0]).channel().unwrap().value, 0.75);
    }

    #[test]
    fn test_url_asset_without_url_reported() {
        let mut s = session();
        let cx = FileContext::new("/scene.duf");
        let got = s
            .parse_url_asset(&cx, json!({ "id": "thing" }).as_object().unwrap())
            .unwrap();
        assert!(got.is_none());
        assert_eq!(s.warnings().len(), 1);
    }

    #[test]
    fn test_import_document_composes_scene() {
        let mut s = session();
        let doc = json!({
            "node_library": [
                { "id": "box", "name": "box",
                  "translation": [ { "id": "y", "value": 2.0 } ] }
            ],
            "scene": {
                "nodes": [ { "id": "box-1", "url": "#box" } ]
            }
        });
        let import = s.import_document(&doc, "/scene.duf").unwrap();
        assert_eq!(import.nodes.len(), 1);
        assert_eq!(import.roots.len(), 1);
        assert!(import.rigs.is_empty());
        let world = &s.instance(import.roots[0]).world;
        assert_eq!(world.trans, dson_math::Vec3::new(0.0, 2.0, 0.0));
    }

    #[test]
    fn test_import_builds_figure_rig() {
        let mut s = session();
        let doc = json!({
            "node_library": [
                { "id": "fig", "name": "fig", "type": "figure" },
                { "id": "hip", "name": "hip", "type": "bone", "parent": "#fig",
                  "center_point": [ { "id": "y", "value": 1.0 } ],
                  "end_point": [ { "id": "y", "value": 2.0 } ] }
            ],
            "scene": {
                "nodes": [
                    { "id": "fig-1", "url": "#fig" },
                    { "id": "hip-1", "url": "#hip", "parent": "#fig-1" }
                ]
            }
        });
        let import = s.import_document(&doc, "/scene.duf").unwrap();
        assert_eq!(import.rigs.len(), 1);
        let rig = &import.rigs[0];
        let hip = rig.bone("hip").unwrap();
        assert_eq!(hip.head, dson_math::Vec3::new(0.0, 1.0, 0.0));
        assert!((hip.length() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_cross_file_import() {
        let _ = env_logger::builder().is_test(true).try_init();
        let root = tempfile::tempdir().unwrap();
        let data = root.path().join("data");
        std::fs::create_dir(&data).unwrap();
        std::fs::write(
            data.join("base.dsf"),
            json!({
                "node_library": [
                    { "id": "box", "name": "box",
                      "translation": [ { "id": "x", "value": 3.0 } ] }
                ]
            })
            .to_string(),
        )
        .unwrap();
        let scene_path = root.path().join("scene.duf");
        std::fs::write(
            &scene_path,
            json!({
                "scene": {
                    "nodes": [ { "id": "box-1", "url": "/data/base.dsf#box" } ]
                }
            })
            .to_string(),
        )
        .unwrap();

        let mut settings = Settings::default();
        settings.content_dirs.push(root.path().to_path_buf());
        let mut s = Session::new(settings);
        let import = s.import_file(&scene_path).unwrap();
        assert_eq!(import.nodes.len(), 1);
        let world = &s.instance(import.roots[0]).world;
        assert_eq!(world.trans, dson_math::Vec3::new(3.0, 0.0, 0.0));
        assert!(s.trace().contains(&"+FILE /data/base.dsf".to_string()));
        assert!(s.missing.is_empty());
    }

    #[test]
    fn test_missing_cross_file_reference_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.content_dirs.push(root.path().to_path_buf());
        let mut s = Session::new(settings);
        let doc = json!({
            "scene": {
                "nodes": [ { "id": "x-1", "url": "/data/gone.dsf#x" } ]
            }
        });
        let import = s.import_document(&doc, "/scene.duf").unwrap();
        assert!(import.nodes.is_empty());
        assert!(!s.warnings().is_empty());
    }

    #[test]
    fn test_trace_records_files() {
        let mut s = session();
        let doc = json!({ "node_library": [] });
        s.parse_document(&doc, "/data/base.dsf", false).unwrap();
        assert_eq!(
            s.trace(),
            ["+FILE /data/base.dsf", "-FILE /data/base.dsf"]
        );
    }
}
