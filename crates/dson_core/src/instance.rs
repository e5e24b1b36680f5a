//! Instances and world-transform composition.
//!
//! A node asset is a template; each placement in a scene creates one
//! [`Instance`] with its own copy of the attributes, so the same asset
//! can be posed independently per placement. Instances live in a flat
//! arena on the session; parent and child links are indices, and a
//! child never owns its parent.

use crate::asset::{AssetId, InstanceId};
use crate::bone::bone_alternative;
use crate::error::Result;
use crate::node::{Attributes, NodeKind};
use crate::refs::{inst_ref, unquote, Ref};
use crate::session::{FileContext, Session};
use dson_math::{scale_matrix, Mat3, Mat4, RotationOrder, Vec3};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::f32::consts::{FRAC_PI_2, PI};

const DEG: f32 = PI / 180.0;

/// Composed world-space transform of an instance.
#[derive(Clone, Debug)]
pub struct WorldTransform {
    pub trans: Vec3,
    pub rot: Mat4,
    pub scale: Mat4,
    pub mat: Mat4,
    /// The instance's own center point, in figure space; children
    /// subtract it when composing their offsets.
    pub center: Vec3,
}

impl Default for WorldTransform {
    fn default() -> Self {
        WorldTransform {
            trans: Vec3::ZERO,
            rot: Mat4::IDENTITY,
            scale: Mat4::IDENTITY,
            mat: Mat4::IDENTITY,
            center: Vec3::ZERO,
        }
    }
}

/// Axis bookkeeping for a bone instance, written by the bone builder and
/// read back by downstream lock/limit logic.
#[derive(Clone, Debug)]
pub struct BoneState {
    pub roll: f32,
    pub axes: [usize; 3],
    pub flipped: [bool; 3],
    pub flopped: [bool; 3],
    pub built: bool,
}

impl Default for BoneState {
    fn default() -> Self {
        BoneState {
            roll: 0.0,
            axes: [0, 1, 2],
            flipped: [false; 3],
            flopped: [false; 3],
            built: false,
        }
    }
}

/// Rest geometry supplied by an external fitting source. When present it
/// overrides the declared center/end points.
#[derive(Clone, Debug)]
pub struct RestData {
    pub head: Vec3,
    pub tail: Vec3,
    /// Fitted orientation; `None` falls back to the declared channel.
    pub orient: Option<Mat3>,
    pub rotation_order: RotationOrder,
    /// World-space pose correction from the fit.
    pub ws_mat: Mat3,
}

/// One placement of a node asset in a parent chain.
#[derive(Debug)]
pub struct Instance {
    pub id: String,
    pub node: AssetId,
    pub kind: NodeKind,
    pub name: String,
    pub label: Option<String>,
    pub parent: Option<InstanceId>,
    pub children: BTreeMap<String, InstanceId>,
    pub rotation_order: RotationOrder,
    pub attributes: Attributes,
    pub rest_data: Option<RestData>,
    pub world: WorldTransform,
    pub bone: Option<BoneState>,
    /// Owning figure instance, for bones and their descendants.
    pub figure: Option<InstanceId>,
}

impl Session {
    /// Create an instance from a node asset and its scene placement
    /// struct. The template's pose channels are consumed by the copy.
    pub fn make_instance(
        &mut self,
        cx: &FileContext,
        node: AssetId,
        s: &Map<String, Value>,
    ) -> Result<InstanceId> {
        let asset = self.asset(node);
        let Some(data) = asset.node() else {
            self.report(
                format!("Not a node asset: {}", self.asset(node).id),
                (2, 3),
            )?;
            // Recovered: synthesize a detached placeholder instance.
            let inst = Instance {
                id: String::new(),
                node,
                kind: NodeKind::Node,
                name: self.asset(node).get_name(),
                label: None,
                parent: None,
                children: BTreeMap::new(),
                rotation_order: RotationOrder::default(),
                attributes: Attributes::default(),
                rest_data: None,
                world: WorldTransform::default(),
                bone: None,
                figure: None,
            };
            return Ok(self.alloc_instance(inst));
        };

        let kind = data.kind;
        let rotation_order = data.rotation_order;
        let attributes = data.attributes.clone();
        let name = asset.get_name();
        let label = asset.label.clone();
        let node_parent = asset.parent;

        let declared = s.get("id").and_then(Value::as_str).unwrap_or("");
        let id = if kind == NodeKind::Bone && !self.asset(node).name.is_empty() {
            self.asset(node).name.clone()
        } else {
            inst_ref(Ref::normalize(declared).as_str()).to_string()
        };

        let mut parent = None;
        if let Some(pref) = s.get("parent").and_then(Value::as_str) {
            if let Some(paid) = node_parent {
                parent = self.get_instance(paid, pref)?;
            }
            if let Some(pid) = parent {
                let pinst = self.instance(pid);
                if pinst.node == node && pinst.id == id {
                    let msg =
                        format!("Instance {id} cannot be its own parent in {}", cx.fileref);
                    self.report(msg, (2, 3))?;
                    parent = None;
                }
            }
        }

        let figure = parent.and_then(|pid| {
            let pinst = self.instance(pid);
            match pinst.kind {
                NodeKind::Figure | NodeKind::LegacyFigure => Some(pid),
                _ => pinst.figure,
            }
        });

        let inst = Instance {
            id: id.clone(),
            node,
            kind,
            name,
            label,
            parent,
            children: BTreeMap::new(),
            rotation_order,
            attributes,
            rest_data: None,
            world: WorldTransform::default(),
            bone: (kind == NodeKind::Bone).then(BoneState::default),
            figure,
        };
        let iid = self.alloc_instance(inst);

        // The template reverts to rest so the next placement starts clean.
        if let Some(data) = self.asset_mut(node).node_mut() {
            data.instances.insert(id.clone(), iid);
            let orig = data.orig_attributes.clone();
            data.attributes.translation = orig.translation;
            data.attributes.rotation = orig.rotation;
            data.attributes.scale = orig.scale;
            data.attributes.general_scale = orig.general_scale;
        }
        self.asset_mut(node).label = None;
        if let Some(pid) = parent {
            self.instance_mut(pid).children.insert(id, iid);
        }
        Ok(iid)
    }

    /// Find the instance of `node` named by `r`, tolerating quoting
    /// differences and legacy bone names.
    pub fn get_instance(&mut self, node: AssetId, r: &str) -> Result<Option<InstanceId>> {
        let normalized = Ref::normalize(r);
        let iref = inst_ref(normalized.as_str()).to_string();
        let Some(data) = self.asset(node).node() else {
            return Ok(None);
        };
        if let Some(&iid) = data.instances.get(&iref) {
            return Ok(Some(iid));
        }
        let decoded = unquote(&iref);
        if let Some(&iid) = data.instances.get(&decoded) {
            return Ok(Some(iid));
        }
        if let Some(alt) = bone_alternative(&decoded) {
            if let Some(&iid) = data.instances.get(alt) {
                return Ok(Some(iid));
            }
        }
        if self.settings.verbosity <= 2 {
            if let Some(&iid) = data.instances.values().next() {
                return Ok(Some(iid));
            }
        }
        let known: Vec<&String> = data.instances.keys().collect();
        let msg = format!("Did not find instance {iref} among {known:?}");
        self.report(msg, (2, 3))?;
        Ok(None)
    }

    //-------------------------------------------------------------
    //  World transforms
    //-------------------------------------------------------------

    /// Compose this instance's world transform from its parent's.
    ///
    /// Follows the format's center-point convention:
    /// ```text
    /// center_offset      = center_point - parent.center_point
    /// global_translation = parent.global_transform * (center_offset + translation)
    /// global_rotation    = parent.global_rotation * orient * rotation * orient^-1
    /// global_scale       = parent.global_scale * orient * scale * general_scale * orient^-1
    /// global_transform   = translate(global_translation) * global_rotation * global_scale
    /// ```
    /// The local rotation uses the instance's declared rotation order;
    /// the orientation channel is always XYZ.
    pub fn update_matrices(&mut self, iid: InstanceId) {
        let inst = self.instance(iid);
        let attrs = inst.attributes.clone();
        let order = inst.rotation_order;
        let parent = inst.parent.map(|pid| self.instance(pid).world.clone());

        let cpoint = attrs.center_point;
        let lrot = order.to_mat4(attrs.rotation * DEG);
        let lscale = scale_matrix(attrs.scale * attrs.general_scale);
        let orient = RotationOrder::Xyz.to_mat4(attrs.orientation * DEG);
        let oscale = orient * lscale * orient.inverse();

        let world = match parent {
            Some(p) => {
                let coffset = cpoint - p.center;
                let trans = p.mat.transform_point3(coffset + attrs.translation);
                let rot = p.rot * orient * lrot * orient.inverse();
                let scale = p.scale * oscale;
                let mat = Mat4::from_translation(trans) * rot * scale;
                WorldTransform {
                    trans,
                    rot,
                    scale,
                    mat,
                    center: cpoint,
                }
            }
            None => {
                let trans = cpoint + attrs.translation;
                let rot = orient * lrot * orient.inverse();
                let mat = Mat4::from_translation(trans) * rot * oscale;
                WorldTransform {
                    trans,
                    rot,
                    scale: oscale,
                    mat,
                    center: cpoint,
                }
            }
        };
        self.instance_mut(iid).world = world;
    }

    /// Pre-order walk: every parent transform is final before any child
    /// transform is computed.
    pub fn compose_tree(&mut self, root: InstanceId) {
        self.update_matrices(root);
        let children: Vec<InstanceId> = self.instance(root).children.values().copied().collect();
        for child in children {
            self.compose_tree(child);
        }
    }

    /// The composed matrix in the output convention.
    pub fn world_matrix(&self, iid: InstanceId) -> Mat4 {
        let mat = self.instance(iid).world.mat;
        if self.settings.zup {
            let rxp = Mat4::from_rotation_x(FRAC_PI_2);
            let rxn = Mat4::from_rotation_x(-FRAC_PI_2);
            rxp * mat * rxn
        } else {
            mat
        }
    }
}
