//! Bone geometry construction.
//!
//! The source format describes a joint by center point, end point, a
//! per-joint orientation, and one of six rotation orders encoding which
//! axis is the bend and which the twist. The target convention wants a
//! head, a tail along the bone's Y axis, and a roll angle. Reconciling
//! the two takes a fixed axis-remap table per rotation order, an
//! optional extra flip when the mapped Y axis points away from the tail,
//! and a set of per-bone roll corrections. The axis permutation and the
//! flip flags are recorded on the bone instance because downstream
//! rotation-lock logic must read back how the axes were remapped.

use crate::asset::InstanceId;
use crate::error::Result;
use crate::node::NodeKind;
use crate::session::Session;
use dson_math::{
    mat3_to_vec_roll, roll_from_quat, vec_roll_to_mat3, wrap_angle, Mat3, Mat4, Mat4Ext, Quat,
    RotationOrder, Vec3,
};
use std::collections::BTreeMap;
use std::f32::consts::{FRAC_PI_2, PI};

const DEG: f32 = PI / 180.0;

//-------------------------------------------------------------
//  Fixed name tables
//-------------------------------------------------------------

/// Roll offset in degrees for bones whose studio convention disagrees
/// with the target bone space.
fn roll_correction(name: &str) -> Option<f32> {
    let deg = match name {
        "lCollar" | "lThumb1" | "lThumb2" | "lThumb3" => 180.0,
        "lShldr" | "lShldrBend" | "lShldrTwist" | "lHand" | "lEar" => -90.0,
        "rCollar" | "rThumb1" | "rThumb2" | "rThumb3" => 180.0,
        "rShldr" | "rShldrBend" | "rShldrTwist" | "rHand" | "rEar" => 90.0,
        _ => return None,
    };
    Some(deg)
}

/// Extra corrections that only apply to the first two figure generations.
fn roll_correction_genesis(name: &str) -> Option<f32> {
    match name {
        "lEye" | "rEye" => Some(180.0),
        _ => None,
    }
}

/// Region roll table used when no plane or name correction applies.
fn rotate_roll(name: &str) -> Option<f32> {
    let deg = match name {
        "lPectoral" => -90.0,
        "rPectoral" => 90.0,
        "upperJaw" | "lowerJaw" => 0.0,
        "lFoot" | "lMetatarsals" | "lToe" => -90.0,
        "rFoot" | "rMetatarsals" | "rToe" => 90.0,
        "lShldr" | "lShldrBend" | "lShldrTwist" | "lForearmBend" | "lForearmTwist" => 90.0,
        "lForeArm" => 0.0,
        "rShldr" | "rShldrBend" | "rShldrTwist" | "rForearmBend" | "rForearmTwist" => -90.0,
        "rForeArm" => 0.0,
        _ => return None,
    };
    Some(deg)
}

/// Which component of the bone Z axis is forced to zero for limb bones,
/// keeping the bend axis perpendicular to the limb plane.
fn z_perpendicular(name: &str) -> Option<usize> {
    if is_arm_bone(name) {
        Some(2)
    } else if is_leg_bone(name) || is_toe_bone(name) || is_finger_bone(name) {
        Some(0)
    } else {
        None
    }
}

fn is_arm_bone(name: &str) -> bool {
    matches!(
        name,
        "lShldr"
            | "lShldrBend"
            | "lShldrTwist"
            | "lForeArm"
            | "lForearmBend"
            | "lForearmTwist"
            | "rShldr"
            | "rShldrBend"
            | "rShldrTwist"
            | "rForeArm"
            | "rForearmBend"
            | "rForearmTwist"
    )
}

fn is_leg_bone(name: &str) -> bool {
    matches!(
        name,
        "lThigh"
            | "lThighBend"
            | "lThighTwist"
            | "lShin"
            | "lFoot"
            | "lMetatarsals"
            | "lToe"
            | "rThigh"
            | "rThighBend"
            | "rThighTwist"
            | "rShin"
            | "rFoot"
            | "rMetatarsals"
            | "rToe"
    )
}

fn is_finger_bone(name: &str) -> bool {
    matches!(
        name,
        "lHand"
            | "lCarpal1"
            | "lCarpal2"
            | "lCarpal3"
            | "lCarpal4"
            | "lIndex1"
            | "lIndex2"
            | "lIndex3"
            | "lMid1"
            | "lMid2"
            | "lMid3"
            | "lRing1"
            | "lRing2"
            | "lRing3"
            | "lPinky1"
            | "lPinky2"
            | "lPinky3"
            | "rHand"
            | "rCarpal1"
            | "rCarpal2"
            | "rCarpal3"
            | "rCarpal4"
            | "rIndex1"
            | "rIndex2"
            | "rIndex3"
            | "rMid1"
            | "rMid2"
            | "rMid3"
            | "rRing1"
            | "rRing2"
            | "rRing3"
            | "rPinky1"
            | "rPinky2"
            | "rPinky3"
    )
}

fn is_toe_bone(name: &str) -> bool {
    matches!(
        name,
        "lBigToe"
            | "lSmallToe1"
            | "lSmallToe2"
            | "lSmallToe3"
            | "lSmallToe4"
            | "lBigToe_2"
            | "lSmallToe1_2"
            | "lSmallToe2_2"
            | "lSmallToe3_2"
            | "lSmallToe4_2"
            | "rBigToe"
            | "rSmallToe1"
            | "rSmallToe2"
            | "rSmallToe3"
            | "rSmallToe4"
            | "rBigToe_2"
            | "rSmallToe1_2"
            | "rSmallToe2_2"
            | "rSmallToe3_2"
            | "rSmallToe4_2"
    )
}

/// Legacy bone names mapped to their modern equivalents, used when an
/// older asset references a bone of a newer figure.
pub fn bone_alternative(name: &str) -> Option<&'static str> {
    let alt = match name {
        "abdomen" => "abdomenLower",
        "abdomen2" => "abdomenUpper",
        "chest" => "chestLower",
        "chest_2" => "chestUpper",
        "neck" => "neckLower",
        "neck_2" => "neckUpper",
        "lShldr" => "lShldrBend",
        "lForeArm" => "lForearmBend",
        "lWrist" => "lForearmTwist",
        "lCarpal2-1" => "lCarpal2",
        "lCarpal2" => "lCarpal4",
        "rShldr" => "rShldrBend",
        "rForeArm" => "rForearmBend",
        "rWrist" => "rForearmTwist",
        "rCarpal2-1" => "rCarpal2",
        "rCarpal2" => "rCarpal4",
        "upperJaw" => "upperTeeth",
        "tongueBase" => "tongue01",
        "tongue01" => "tongue02",
        "tongue02" => "tongue03",
        "tongue03" => "tongue04",
        "MidBrowUpper" => "CenterBrow",
        "lLipCorver" => "lLipCorner",
        "lCheekLowerInner" => "lCheekLower",
        "lCheekUpperInner" => "lCheekUpper",
        "lEyelidTop" => "lEyelidUpper",
        "lEyelidLower_2" => "lEyelidLowerInner",
        "lNoseBirdge" => "lNasolabialUpper",
        "rCheekLowerInner" => "rCheekLower",
        "rCheekUpperInner" => "rCheekUpper",
        "lThigh" => "lThighBend",
        "lBigToe2" => "lBigToe_2",
        "rThigh" => "rThighBend",
        "rBigToe2" => "rBigToe_2",
        "Shaft 1" => "shaft1",
        "Shaft 2" => "shaft2",
        "Shaft 3" => "shaft3",
        "Shaft 4" => "shaft4",
        "Shaft 5" | "Shaft5" => "shaft5",
        "Shaft 6" => "shaft6",
        "Shaft 7" => "shaft7",
        "Left Testicle" => "lTesticle",
        "Right Testicle" => "rTesticle",
        "Scortum" => "scrotum",
        "Legs Crease" => "legsCrease",
        "Rectum" | "Rectum 1" => "rectum1",
        "Rectum 2" => "rectum2",
        "Colon" => "colon",
        "Root" | "root" => "shaftRoot",
        _ => return None,
    };
    Some(alt)
}

//-------------------------------------------------------------
//  Anatomical planes
//-------------------------------------------------------------

/// Reference planes a bone's roll can be derived from: `(x_plane, z_plane)`.
fn plane_refs(name: &str) -> Option<(&'static str, &'static str)> {
    let refs = match name {
        "lShldr" | "lForeArm" => ("lArm", ""),
        "lHand" | "lCarpal1" | "lCarpal2" | "lCarpal3" | "lCarpal4" => ("", "lHand"),
        "lThumb1" | "lThumb2" | "lThumb3" => ("lThumb", ""),
        "lIndex1" | "lIndex2" | "lIndex3" => ("lIndex", "lHand"),
        "lMid1" | "lMid2" | "lMid3" => ("lMid", "lHand"),
        "lRing1" | "lRing2" | "lRing3" => ("lRing", "lHand"),
        "lPinky1" | "lPinky2" | "lPinky3" => ("lPinky", "lHand"),
        "rShldr" | "rForeArm" => ("rArm", ""),
        "rHand" | "rCarpal1" | "rCarpal2" | "rCarpal3" | "rCarpal4" => ("", "rHand"),
        "rThumb1" | "rThumb2" | "rThumb3" => ("rThumb", ""),
        "rIndex1" | "rIndex2" | "rIndex3" => ("rIndex", "rHand"),
        "rMid1" | "rMid2" | "rMid3" => ("rMid", "rHand"),
        "rRing1" | "rRing2" | "rRing3" => ("rRing", "rHand"),
        "rPinky1" | "rPinky2" | "rPinky3" => ("rPinky", "rHand"),
        _ => return None,
    };
    Some(refs)
}

/// Three bones whose points span a named plane: center, center, end.
fn plane_points(pname: &str) -> Option<[&'static str; 3]> {
    let points = match pname {
        "lArm" => ["lShldr", "lForeArm", "lForeArm"],
        "lLeg" => ["lThigh", "lShin", "lShin"],
        "lThumb" => ["lThumb1", "lThumb2", "lThumb2"],
        "lIndex" => ["lIndex1", "lIndex2", "lIndex3"],
        "lMid" => ["lMid1", "lMid2", "lMid3"],
        "lRing" => ["lRing1", "lRing2", "lRing3"],
        "lPinky" => ["lPinky1", "lPinky2", "lPinky3"],
        "lHand" => ["lIndex3", "lMid1", "lPinky2"],
        "rArm" => ["rShldr", "rForeArm", "rForeArm"],
        "rLeg" => ["rThigh", "rShin", "rShin"],
        "rThumb" => ["rThumb1", "rThumb2", "rThumb2"],
        "rIndex" => ["rIndex1", "rIndex2", "rIndex3"],
        "rMid" => ["rMid1", "rMid2", "rMid3"],
        "rRing" => ["rRing1", "rRing2", "rRing3"],
        "rPinky" => ["rPinky1", "rPinky2", "rPinky3"],
        "rHand" => ["rMid1", "rIndex3", "rPinky2"],
        _ => return None,
    };
    Some(points)
}

fn planes_used(rigtype: &str) -> &'static [&'static str] {
    match rigtype {
        "genesis1" | "genesis2" => &[
            "lArm", "lHand", "lThumb", "lIndex", "lMid", "lRing", "lPinky", "rArm", "rHand",
            "rThumb", "rIndex", "rMid", "rRing", "rPinky",
        ],
        "genesis3" => &["lArm", "lThumb", "lHand", "rArm", "rThumb", "rHand"],
        "genesis8" => &[
            "lArm", "lLeg", "lThumb", "lHand", "rArm", "rLeg", "rThumb", "rHand",
        ],
        _ => &[],
    }
}

/// Classify a figure generation from its bone names.
pub fn guess_rig_type<'a>(bones: impl Iterator<Item = &'a str> + Clone) -> &'static str {
    let has = |name: &str| bones.clone().any(|b| b == name);
    if has("abdomenLower") && has("lShldrBend") && has("rShldrBend") {
        if has("lHeel") {
            "genesis3"
        } else {
            "genesis8"
        }
    } else if has("abdomenLower") && has("lShldrBend") && has("lJawClench") {
        "genesis8"
    } else if has("abdomen") && has("lShldr") && has("rShldr") {
        if has("lSmallToe1") {
            "genesis2"
        } else {
            "genesis1"
        }
    } else {
        ""
    }
}

//-------------------------------------------------------------
//  Axis remapping
//-------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flip {
    X,
    Z,
}

impl Flip {
    fn matrix(self) -> Mat4 {
        match self {
            Flip::X => Mat4::from_rotation_x(PI),
            Flip::Z => Mat4::from_rotation_z(PI),
        }
    }
}

/// One row of the rotation-order remap table.
#[derive(Clone, Copy, Debug)]
struct AxisCase {
    euler: Vec3,
    flip: Flip,
    axes: [usize; 3],
    flipped: [bool; 3],
    flopped: [bool; 3],
}

/// The fixed mapping from a joint's rotation order to the target bone
/// space, where Y is the twist axis.
fn axis_case(order: RotationOrder) -> AxisCase {
    match order {
        RotationOrder::Yzx => AxisCase {
            euler: Vec3::ZERO,
            flip: Flip::X,
            axes: [0, 1, 2],
            flipped: [false, false, false],
            flopped: [false, true, true],
        },
        RotationOrder::Yxz => AxisCase {
            euler: Vec3::new(0.0, FRAC_PI_2, 0.0),
            flip: Flip::Z,
            axes: [2, 1, 0],
            flipped: [false, false, false],
            flopped: [false, false, false],
        },
        RotationOrder::Zyx => AxisCase {
            euler: Vec3::new(FRAC_PI_2, 0.0, 0.0),
            flip: Flip::X,
            axes: [0, 2, 1],
            flipped: [false, true, false],
            flopped: [false, false, false],
        },
        RotationOrder::Xzy => AxisCase {
            euler: Vec3::new(0.0, 0.0, FRAC_PI_2),
            flip: Flip::Z,
            axes: [1, 0, 2],
            flipped: [false, false, false],
            flopped: [false, true, false],
        },
        RotationOrder::Zxy => AxisCase {
            euler: Vec3::new(FRAC_PI_2, 0.0, 0.0),
            flip: Flip::Z,
            axes: [0, 2, 1],
            flipped: [false, true, false],
            flopped: [false, false, false],
        },
        RotationOrder::Xyz => AxisCase {
            euler: Vec3::new(FRAC_PI_2, FRAC_PI_2, 0.0),
            flip: Flip::Z,
            axes: [1, 2, 0],
            flipped: [true, true, true],
            flopped: [true, true, false],
        },
    }
}

//-------------------------------------------------------------
//  Edit bones and rigs
//-------------------------------------------------------------

/// Edit-time geometry for one bone, ready for an armature builder.
#[derive(Clone, Debug)]
pub struct EditBone {
    pub name: String,
    pub parent: Option<usize>,
    pub head: Vec3,
    pub tail: Vec3,
    pub roll: f32,
    pub use_connect: bool,
    /// Declared orientation channel, in degrees, kept for round-tripping
    /// poses back to the source convention.
    pub orientation: Vec3,
    pub rotation_order: RotationOrder,
    pub axes: [usize; 3],
    pub flipped: [bool; 3],
}

impl EditBone {
    pub fn length(&self) -> f32 {
        (self.tail - self.head).length()
    }

    /// The bone's rest matrix implied by head, tail and roll.
    pub fn matrix(&self) -> Mat4 {
        let mat = vec_roll_to_mat3(self.tail - self.head, self.roll);
        let mut out = Mat4::from_mat3(mat);
        out.w_axis = self.head.extend(1.0);
        out
    }
}

/// The skeleton built from one figure instance.
#[derive(Debug, Default)]
pub struct Rig {
    pub name: String,
    pub rigtype: String,
    pub bones: Vec<EditBone>,
    pub index: BTreeMap<String, usize>,
    pub planes: BTreeMap<String, Vec3>,
}

impl Rig {
    pub fn bone(&self, name: &str) -> Option<&EditBone> {
        self.index.get(name).map(|&i| &self.bones[i])
    }

    /// Resolve a bone by name, falling back to legacy alternatives.
    pub fn target_bone(&self, name: &str) -> Option<&str> {
        if self.index.contains_key(name) {
            return self.index.get_key_value(name).map(|(k, _)| k.as_str());
        }
        let alt = bone_alternative(name)?;
        if self.index.contains_key(alt) {
            Some(alt)
        } else {
            None
        }
    }
}

impl Session {
    /// Build the skeleton for a figure instance: walk its bone children
    /// in pre-order, emitting one [`EditBone`] per bone instance and
    /// recording the axis bookkeeping back on the instance.
    pub fn build_rig(&mut self, figure: InstanceId) -> Result<Rig> {
        let mut rig = Rig {
            name: self.instance(figure).name.clone(),
            ..Default::default()
        };

        let mut bone_names = Vec::new();
        let mut roots = Vec::new();
        let children: Vec<InstanceId> =
            self.instance(figure).children.values().copied().collect();
        for child in &children {
            self.list_bones(*child, &mut bone_names);
        }
        rig.rigtype = guess_rig_type(bone_names.iter().map(|(name, _)| name.as_str())).to_string();
        for child in children {
            if self.instance(child).kind == NodeKind::Bone {
                roots.push(child);
            }
        }

        self.setup_planes(&mut rig, &bone_names);

        let center = self.instance(figure).attributes.center_point;
        for root in roots {
            self.build_bone(&mut rig, root, None, center, false)?;
        }
        Ok(rig)
    }

    fn list_bones(&self, iid: InstanceId, out: &mut Vec<(String, InstanceId)>) {
        let inst = self.instance(iid);
        if inst.kind != NodeKind::Bone {
            return;
        }
        out.push((inst.name.clone(), iid));
        for &child in inst.children.values() {
            self.list_bones(child, out);
        }
    }

    /// Build the anatomical reference planes this figure generation
    /// uses. A missing point bone just skips that plane.
    fn setup_planes(&self, rig: &mut Rig, bones: &[(String, InstanceId)]) {
        let lookup = |name: &str| -> Option<InstanceId> {
            bones
                .iter()
                .find(|(bname, _)| bname == name)
                .map(|&(_, iid)| iid)
        };
        let scale = self.settings.scale;
        for pname in planes_used(&rig.rigtype) {
            let Some([b1, b2, b3]) = plane_points(pname) else {
                continue;
            };
            let (Some(i1), Some(i2), Some(i3)) = (lookup(b1), lookup(b2), lookup(b3)) else {
                continue;
            };
            let pt1 = self.instance(i1).attributes.center_point * scale;
            let pt2 = self.instance(i2).attributes.center_point * scale;
            let pt3 = self.instance(i3).attributes.end_point * scale;
            let normal = (pt2 - pt1).cross(pt3 - pt1).normalize_or_zero();
            if normal != Vec3::ZERO {
                rig.planes.insert(pname.to_string(), normal);
            }
        }
    }

    fn build_bone(
        &mut self,
        rig: &mut Rig,
        iid: InstanceId,
        parent: Option<usize>,
        center: Vec3,
        is_face: bool,
    ) -> Result<()> {
        let scale = self.settings.scale;
        let name = make_name_unique(&self.instance(iid).name, &rig.index);
        let (head, tail, orient_mat, order, ws_mat) = self.head_tail(iid, center, true);
        let head = head * scale;
        let tail = tail * scale;
        let length = (tail - head).length();
        let orientation = self.instance(iid).attributes.orientation;

        let mut omat = Mat4::from_mat3(orient_mat);
        let case = axis_case(order);
        omat *= Mat4::from_mat3(RotationOrder::Xyz.to_mat3(case.euler));
        let flip = case.flip;
        let mut axes = case.axes;
        let mut flipped = case.flipped;
        let flopped = case.flopped;

        // Pose correction from fitted rest data; skipped when the fit
        // matrix is not invertible.
        let rmat = Mat4::from_mat3(ws_mat);
        if !rmat.is_near_identity(1e-6) && rmat.determinant() > 1e-4 {
            omat = rmat.inverse() * omat;
        }

        // Flop when the remapped Y axis points away from the tail.
        let yaxis = omat.y_axis.truncate();
        if (tail - head).dot(yaxis) < 0.0 {
            flipped = flopped;
            omat *= flip.matrix();
        }

        let dir = omat.y_axis.truncate().normalize();
        let tail = head + length * dir;
        let (_, raw_roll) = mat3_to_vec_roll(Mat3::from_mat4(omat));
        let mut roll = wrap_angle(raw_roll);

        let corrected = self.correct_roll(rig, &name, &mut roll, &mut axes, &mut flipped);
        if !corrected {
            roll = self.fallback_roll(rig, &name, head, tail, roll, is_face);
        }

        let use_connect = match parent {
            Some(pidx) => {
                let gap = (rig.bones[pidx].tail - head).length();
                gap < self.settings.connect_epsilon * scale
            }
            None => false,
        };

        let bone = EditBone {
            name: name.clone(),
            parent,
            head,
            tail,
            roll,
            use_connect,
            orientation,
            rotation_order: order,
            axes,
            flipped,
        };
        let idx = rig.bones.len();
        rig.bones.push(bone);
        rig.index.insert(name.clone(), idx);

        if let Some(state) = &mut self.instance_mut(iid).bone {
            state.roll = roll;
            state.axes = axes;
            state.flipped = flipped;
            state.flopped = flopped;
            state.built = true;
        }

        let is_face = is_face || matches!(name.as_str(), "upperFaceRig" | "lowerFaceRig");
        let children: Vec<InstanceId> = self.instance(iid).children.values().copied().collect();
        for child in children {
            if self.instance(child).kind == NodeKind::Bone {
                self.build_bone(rig, child, Some(idx), center, is_face)?;
            }
        }
        Ok(())
    }

    /// Head, tail, orientation matrix, rotation order and world-space
    /// correction for a bone instance. Fitted rest data wins over the
    /// declared points; a near-degenerate bone gets a unit tail along Y.
    fn head_tail(
        &self,
        iid: InstanceId,
        center: Vec3,
        mayfit: bool,
    ) -> (Vec3, Vec3, Mat3, RotationOrder, Mat3) {
        let inst = self.instance(iid);
        let (head, mut tail, orient, order, ws_mat) = match (&inst.rest_data, mayfit) {
            (Some(rest), true) => {
                let orient = rest.orient.unwrap_or_else(|| {
                    RotationOrder::Xyz.to_mat3(inst.attributes.orientation * DEG)
                });
                let order = if rest.orient.is_some() {
                    rest.rotation_order
                } else {
                    inst.rotation_order
                };
                (rest.head, rest.tail, orient, order, rest.ws_mat)
            }
            _ => {
                let head = inst.attributes.center_point - center;
                let tail = inst.attributes.end_point - center;
                let orient = RotationOrder::Xyz.to_mat3(inst.attributes.orientation * DEG);
                (head, tail, orient, inst.rotation_order, Mat3::IDENTITY)
            }
        };
        if (tail - head).length() < 0.1 {
            tail = head + Vec3::Y;
        }
        (head, tail, orient, order, ws_mat)
    }

    /// Apply the per-name roll correction. Quarter and half turn offsets
    /// also permute the recorded axes so limits stay on the right axis.
    fn correct_roll(
        &self,
        rig: &Rig,
        name: &str,
        roll: &mut f32,
        axes: &mut [usize; 3],
        flipped: &mut [bool; 3],
    ) -> bool {
        let offset = match roll_correction(name) {
            Some(offset) => offset,
            None => {
                if matches!(rig.rigtype.as_str(), "genesis1" | "genesis2") {
                    match roll_correction_genesis(name) {
                        Some(offset) => offset,
                        None => return false,
                    }
                } else {
                    return false;
                }
            }
        };

        *roll = wrap_angle(*roll + offset * DEG);

        let i = axes.iter().position(|&a| a == 0).unwrap_or(0);
        let k = axes.iter().position(|&a| a == 2).unwrap_or(2);
        if offset == 90.0 || offset == -90.0 {
            axes.swap(i, k);
            let fi = flipped[i];
            flipped[i] = !flipped[k];
            flipped[k] = fi;
        } else if offset == 180.0 {
            flipped[i] = !flipped[i];
            flipped[k] = !flipped[k];
        }
        true
    }

    /// Roll from an anatomical plane when one is defined for this bone,
    /// else the region table, else unchanged.
    fn fallback_roll(
        &self,
        rig: &Rig,
        name: &str,
        head: Vec3,
        tail: Vec3,
        roll: f32,
        is_face: bool,
    ) -> f32 {
        if let Some(plane_roll) = roll_from_plane(rig, name, head, tail) {
            return plane_roll;
        }

        let deg = if let Some(deg) = rotate_roll(name) {
            deg
        } else if is_face || name == "lEye" || name == "rEye" {
            -90.0
        } else if is_toe_bone(name) {
            if name.starts_with('l') {
                -90.0
            } else {
                90.0
            }
        } else if is_finger_bone(name) {
            if rig.rigtype == "genesis8" {
                if name.starts_with('l') {
                    90.0
                } else {
                    -90.0
                }
            } else {
                180.0
            }
        } else {
            return roll;
        };

        let mut roll = wrap_angle(deg * DEG);
        if let Some(nz) = z_perpendicular(name) {
            let mut mat = vec_roll_to_mat3((tail - head).normalize_or_zero(), roll);
            mat.z_axis[nz] = 0.0;
            if mat.z_axis.length() > 1e-6 {
                mat.x_axis = mat.x_axis.normalize();
                mat.y_axis = mat.y_axis.normalize();
                mat.z_axis = mat.z_axis.normalize();
                let (_, fixed) = mat3_to_vec_roll(mat);
                roll = wrap_angle(fixed);
            }
        }
        roll
    }
}

/// Derive roll by aligning the bone X (or Z) axis to a reference plane
/// normal. Returns `None` when no plane applies to this bone.
fn roll_from_plane(rig: &Rig, name: &str, head: Vec3, tail: Vec3) -> Option<f32> {
    let (xplane, zplane) = plane_refs(name)?;
    let prefer_z = !zplane.is_empty()
        && rig.planes.contains_key(zplane)
        && (matches!(rig.rigtype.as_str(), "genesis3" | "genesis8") || xplane.is_empty());
    if prefer_z {
        let zaxis = rig.planes[zplane];
        let roll = roll_toward_axis(head, tail, zaxis) + FRAC_PI_2;
        return Some(wrap_angle(roll));
    }
    if !xplane.is_empty() && rig.planes.contains_key(xplane) {
        let xaxis = rig.planes[xplane];
        return Some(wrap_angle(roll_toward_axis(head, tail, xaxis)));
    }
    None
}

/// Roll that points the bone's X axis along `xaxis`, projected
/// perpendicular to the bone direction.
fn roll_toward_axis(head: Vec3, tail: Vec3, xaxis: Vec3) -> f32 {
    let yaxis = (tail - head).normalize_or_zero();
    if yaxis == Vec3::ZERO {
        return 0.0;
    }
    let xaxis = (xaxis - yaxis.dot(xaxis) * yaxis).normalize_or_zero();
    if xaxis == Vec3::ZERO {
        return 0.0;
    }
    let zaxis = xaxis.cross(yaxis).normalize();
    let mat = Mat3::from_cols(xaxis, yaxis, zaxis);
    roll_from_quat(Quat::from_mat3(&mat))
}

/// Suffix a duplicate bone name with `-1`, `-2`, ...
fn make_name_unique(name: &str, taken: &BTreeMap<String, usize>) -> String {
    if !taken.contains_key(name) {
        return name.to_string();
    }
    let mut candidate = name.to_string();
    if candidate.len() < 2 {
        candidate = format!("{candidate}-1");
    }
    while taken.contains_key(&candidate) {
        let bytes = candidate.as_bytes();
        let n = bytes.len();
        if n >= 2 && bytes[n - 2] == b'-' && bytes[n - 1].is_ascii_digit() {
            let digit = (bytes[n - 1] - b'0') as u32;
            candidate = format!("{}-{}", &candidate[..n - 2], digit + 1);
        } else {
            candidate = format!("{candidate}-1");
        }
    }
    log::info!("Bone name made unique: {name} => {candidate}");
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use serde_json::json;

    #[test]
    fn test_coincident_points_get_unit_tail() {
        let mut s = Session::new(Settings::default());
        let doc = json!({
            "node_library": [
                { "id": "fig", "name": "fig", "type": "figure" },
                { "id": "stub", "name": "stub", "type": "bone", "parent": "#fig",
                  "center_point": [ { "id": "y", "value": 1.0 } ],
                  "end_point": [ { "id": "y", "value": 1.0 } ] }
            ],
            "scene": {
                "nodes": [
                    { "id": "fig-1", "url": "#fig" },
                    { "id": "stub-1", "url": "#stub", "parent": "#fig-1" }
                ]
            }
        });
        let import = s.import_document(&doc, "/scene.duf").unwrap();
        let bone = import.rigs[0].bone("stub").unwrap();
        assert!(bone.length() >= 1.0 - 1e-6, "length {}", bone.length());
    }

    #[test]
    fn test_axis_case_table() {
        let yzx = axis_case(RotationOrder::Yzx);
        assert_eq!(yzx.axes, [0, 1, 2]);
        assert_eq!(yzx.flip, Flip::X);
        assert_eq!(yzx.flopped, [false, true, true]);

        let xyz = axis_case(RotationOrder::Xyz);
        assert_eq!(xyz.axes, [1, 2, 0]);
        assert_eq!(xyz.flipped, [true, true, true]);
        assert_eq!(xyz.flopped, [true, true, false]);

        let zyx = axis_case(RotationOrder::Zyx);
        assert_eq!(zyx.axes, [0, 2, 1]);
        assert_eq!(zyx.flipped, [false, true, false]);
        assert_eq!(zyx.flip, Flip::X);

        let zxy = axis_case(RotationOrder::Zxy);
        assert_eq!(zxy.axes, [0, 2, 1]);
        assert_eq!(zxy.flip, Flip::Z);

        let xzy = axis_case(RotationOrder::Xzy);
        assert_eq!(xzy.axes, [1, 0, 2]);
        assert_eq!(xzy.flopped, [false, true, false]);

        let yxz = axis_case(RotationOrder::Yxz);
        assert_eq!(yxz.axes, [2, 1, 0]);
        assert_eq!(yxz.flipped, [false, false, false]);
    }

    #[test]
    fn test_bone_alternative() {
        assert_eq!(bone_alternative("abdomen"), Some("abdomenLower"));
        assert_eq!(bone_alternative("Left Testicle"), Some("lTesticle"));
        assert_eq!(bone_alternative("hip"), None);
    }

    #[test]
    fn test_guess_rig_type() {
        let g8 = ["abdomenLower", "lShldrBend", "rShldrBend", "hip"];
        assert_eq!(guess_rig_type(g8.iter().copied()), "genesis8");
        let g3 = ["abdomenLower", "lShldrBend", "rShldrBend", "lHeel"];
        assert_eq!(guess_rig_type(g3.iter().copied()), "genesis3");
        let g1 = ["abdomen", "lShldr", "rShldr"];
        assert_eq!(guess_rig_type(g1.iter().copied()), "genesis1");
        let g2 = ["abdomen", "lShldr", "rShldr", "lSmallToe1"];
        assert_eq!(guess_rig_type(g2.iter().copied()), "genesis2");
        assert_eq!(guess_rig_type(["ball.marker.L"].iter().copied()), "");
    }

    #[test]
    fn test_make_name_unique() {
        let mut taken = BTreeMap::new();
        assert_eq!(make_name_unique("hip", &taken), "hip");
        taken.insert("hip".to_string(), 0);
        assert_eq!(make_name_unique("hip", &taken), "hip-1");
        taken.insert("hip-1".to_string(), 1);
        assert_eq!(make_name_unique("hip", &taken), "hip-2");
    }

    #[test]
    fn test_roll_correction_tables() {
        assert_eq!(roll_correction("lShldrBend"), Some(-90.0));
        assert_eq!(roll_correction("rThumb2"), Some(180.0));
        assert_eq!(roll_correction("hip"), None);
        assert_eq!(roll_correction_genesis("lEye"), Some(180.0));
        assert_eq!(rotate_roll("lFoot"), Some(-90.0));
        assert_eq!(z_perpendicular("lShldrBend"), Some(2));
        assert_eq!(z_perpendicular("rToe"), Some(0));
        assert_eq!(z_perpendicular("head"), None);
    }

    #[test]
    fn test_roll_toward_axis() {
        // Bone along Y, X axis requested along world X: zero roll.
        let roll = roll_toward_axis(Vec3::ZERO, Vec3::Y, Vec3::X);
        assert!(roll.abs() < 1e-5);
        // Requested along world Z: quarter turn.
        let roll = roll_toward_axis(Vec3::ZERO, Vec3::Y, Vec3::Z);
        assert!((roll.abs() - FRAC_PI_2).abs() < 1e-5);
    }

    #[test]
    fn test_edit_bone_matrix() {
        let bone = EditBone {
            name: "hip".to_string(),
            parent: None,
            head: Vec3::new(0.0, 1.0, 0.0),
            tail: Vec3::new(0.0, 2.0, 0.0),
            roll: 0.0,
            use_connect: false,
            orientation: Vec3::ZERO,
            rotation_order: RotationOrder::Xyz,
            axes: [0, 1, 2],
            flipped: [false; 3],
        };
        let mat = bone.matrix();
        assert!((mat.w_axis.truncate() - bone.head).length() < 1e-6);
        assert!((mat.y_axis.truncate() - Vec3::Y).length() < 1e-6);
    }
}
