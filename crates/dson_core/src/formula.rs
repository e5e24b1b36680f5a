//! Formula evaluation and driver synthesis.
//!
//! A formula is a small stack program: `push` literals or channel
//! values, `mult` them, or supply `spline_tcb` control points. Formulas
//! appear in two roles. Simple three-operation formulas are applied
//! directly: the computed value lands on the target's channel or
//! attribute. Morph formulas are instead decomposed into
//! [`Expression`]s per driven channel component and synthesized into
//! drivers: a bone pose channel driven by a slider, a slider driven by
//! a bone rotation, or a slider driven by a weighted sum of other
//! sliders. Morph-of-morph chains are open-coded (inlined) up to a
//! recursion guard, and sliders whose dependencies are not yet known
//! go through a bounded multi-pass solver instead of deadlocking.

use crate::asset::{AssetData, AssetId};
use crate::bone::Rig;
use crate::error::{Error, Result};
use crate::node::component_index;
use crate::session::{FileContext, Session};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

//-------------------------------------------------------------
//  Parsing
//-------------------------------------------------------------

/// What a `push` operation pushes.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    /// A channel reference, `file#id?channel`.
    Url(String),
    /// A literal: a number, or a control point for `spline_tcb`.
    Val(Value),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Push(Operand),
    Mult,
    SplineTcb,
    Unknown(String),
}

/// One parsed formula: output channel plus stack program.
#[derive(Clone, Debug, Default)]
pub struct Formula {
    pub output: String,
    pub operations: Vec<Op>,
    /// Multi-stage marker; `"mult"` makes the referenced property a
    /// multiplier of the output.
    pub stage: Option<String>,
}

impl Formula {
    pub fn parse(v: &Value) -> Option<Formula> {
        let obj = v.as_object()?;
        let output = obj.get("output")?.as_str()?.to_string();
        let mut operations = Vec::new();
        for op in obj.get("operations")?.as_array()? {
            let Some(op_obj) = op.as_object() else { continue };
            let name = op_obj.get("op").and_then(Value::as_str).unwrap_or("");
            let parsed = match name {
                "push" => {
                    if let Some(url) = op_obj.get("url").and_then(Value::as_str) {
                        Op::Push(Operand::Url(url.to_string()))
                    } else if let Some(val) = op_obj.get("val") {
                        Op::Push(Operand::Val(val.clone()))
                    } else {
                        Op::Unknown("push without url or val".to_string())
                    }
                }
                "mult" => Op::Mult,
                "spline_tcb" => Op::SplineTcb,
                other => Op::Unknown(other.to_string()),
            };
            operations.push(parsed);
        }
        let stage = obj
            .get("stage")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        Some(Formula {
            output,
            operations,
            stage,
        })
    }

    pub fn parse_list(v: Option<&Value>) -> Vec<Formula> {
        v.and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Formula::parse).collect())
            .unwrap_or_default()
    }
}

/// The channel a formula output or operand names.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum ChannelPath {
    Value,
    GeneralScale,
    Rotation,
    Translation,
    Scale,
    CenterPoint,
    EndPoint,
}

/// Parse a channel spelling like `value`, `general_scale` or
/// `rotation/x` into its path and component index. Orientation channels
/// are never driven; unknown attributes return `None`.
pub fn parse_channel(channel: &str) -> Option<(ChannelPath, usize)> {
    match channel {
        "value" => return Some((ChannelPath::Value, 0)),
        "general_scale" => return Some((ChannelPath::GeneralScale, 0)),
        _ => {}
    }
    let (attr, comp) = channel.split_once('/')?;
    let idx = component_index(comp)?;
    let path = match attr {
        "rotation" => ChannelPath::Rotation,
        "translation" => ChannelPath::Translation,
        "scale" => ChannelPath::Scale,
        "center_point" => ChannelPath::CenterPoint,
        "end_point" => ChannelPath::EndPoint,
        _ => return None,
    };
    Some((path, idx))
}

/// Split a channel url into `(asset ref, channel key)`, dropping any
/// scene-name prefix before the first `:`.
fn get_ref_key(s: &str) -> (&str, &str) {
    let base = match s.split_once(':') {
        Some((_, rest)) => rest,
        None => s,
    };
    match base.rsplit_once('?') {
        Some((r, key)) => (r, key),
        None => (base, ""),
    }
}

//-------------------------------------------------------------
//  Stack evaluation
//-------------------------------------------------------------

/// Run a formula's stack program. `fetch` supplies the current value of
/// a referenced channel. Pure: the result depends only on the operand
/// values.
pub fn eval_stack(ops: &[Op], fetch: &dyn Fn(&str) -> Option<f64>) -> Result<f64> {
    let mut stack: Vec<f64> = Vec::new();
    for op in ops {
        match op {
            Op::Push(Operand::Val(v)) => {
                let Some(x) = v.as_f64() else {
                    return Err(Error::FormulaStack(format!("cannot push {v}")));
                };
                stack.push(x);
            }
            Op::Push(Operand::Url(url)) => {
                let Some(x) = fetch(url) else {
                    return Err(Error::FormulaStack(format!("unresolved operand {url}")));
                };
                stack.push(x);
            }
            Op::Mult => {
                let (Some(b), Some(a)) = (stack.pop(), stack.pop()) else {
                    return Err(Error::FormulaStack("mult on short stack".to_string()));
                };
                stack.push(a * b);
            }
            Op::SplineTcb => {
                return Err(Error::FormulaStack(
                    "spline_tcb cannot be evaluated directly".to_string(),
                ));
            }
            Op::Unknown(name) => {
                return Err(Error::FormulaStack(format!("unknown operation {name}")));
            }
        }
    }
    match stack.as_slice() {
        [result] => Ok(*result),
        other => Err(Error::FormulaStack(format!(
            "stack has {} values after evaluation",
            other.len()
        ))),
    }
}

impl Session {
    /// Evaluate a simple three-operation formula to its immediate
    /// result `(target ref, channel key, value)`. Formulas that do not
    /// fit the immediate shape return `None` and are left to the
    /// expression path.
    pub fn compute_formula(
        &mut self,
        cx: &FileContext,
        formula: &Formula,
    ) -> Result<Option<(String, String, f64)>> {
        if formula.operations.len() != 3 {
            return Ok(None);
        }
        // Resolve channel operands up front so evaluation stays pure.
        let mut resolved: Vec<Op> = Vec::with_capacity(3);
        for op in &formula.operations {
            match op {
                Op::Push(Operand::Url(url)) => {
                    let (r, key) = get_ref_key(url);
                    if key != "value" {
                        return Ok(None);
                    }
                    let r = r.to_string();
                    let Some(aid) = self.get_asset(cx, &r, false)? else {
                        return Ok(None);
                    };
                    let Some(channel) = self.asset(aid).channel() else {
                        return Ok(None);
                    };
                    resolved.push(Op::Push(Operand::Val(Value::from(channel.value))));
                }
                other => resolved.push(other.clone()),
            }
        }
        let value = eval_stack(&resolved, &|_| None)?;
        let (r, key) = get_ref_key(&formula.output);
        Ok(Some((r.to_string(), key.to_string(), value)))
    }

    /// Apply an asset's simple formulas directly: channel targets get
    /// their value set, node targets get the attribute component set on
    /// their instances.
    pub fn apply_formulas(&mut self, cx: &FileContext, aid: AssetId) -> Result<()> {
        let formulas = self.asset(aid).formulas.clone();
        for formula in &formulas {
            let Some((target, key, value)) = self.compute_formula(cx, formula)? else {
                continue;
            };
            let Some(tid) = self.get_asset(cx, &target, false)? else {
                continue;
            };
            match &self.asset(tid).data {
                AssetData::Channel(_) | AssetData::Morph(_) if key == "value" => {
                    if let Some(channel) = self.asset_mut(tid).channel_mut() {
                        channel.value = value;
                    }
                }
                AssetData::Node(_) => {
                    let Some((path, idx)) = parse_channel(&key) else {
                        continue;
                    };
                    let Some(iid) = self.get_instance(tid, &target)? else {
                        continue;
                    };
                    let attrs = &mut self.instance_mut(iid).attributes;
                    let value = value as f32;
                    match path {
                        ChannelPath::Rotation => attrs.rotation[idx] = value,
                        ChannelPath::Translation => attrs.translation[idx] = value,
                        ChannelPath::Scale => attrs.scale[idx] = value,
                        ChannelPath::GeneralScale => attrs.general_scale = value,
                        ChannelPath::CenterPoint => attrs.center_point[idx] = value,
                        ChannelPath::EndPoint => attrs.end_point[idx] = value,
                        ChannelPath::Value => {}
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

//-------------------------------------------------------------
//  Expressions
//-------------------------------------------------------------

/// One formula decomposed against its driving source.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Expression {
    pub factor: f64,
    /// Driving scalar property, when the source is a `?value` channel.
    pub prop: Option<String>,
    /// Driving bone, when the source is a pose channel.
    pub bone: Option<String>,
    /// Component of the driving bone channel.
    pub comp: usize,
    /// Control points of a `spline_tcb` program, in document order.
    pub points: Vec<(f64, f64)>,
    /// Multiplier property from a `"stage": "mult"` formula.
    pub mult: Option<String>,
}

/// A decomposed formula: which output channel component it drives, and
/// by what.
#[derive(Clone, Debug)]
pub struct FormulaExpr {
    /// Driven target name (bone name or property name).
    pub output: String,
    pub channel: ChannelPath,
    /// Driven component index.
    pub comp: usize,
    pub expr: Expression,
}

impl Session {
    /// Decompose formulas into expressions. Formulas that do not match
    /// a recognized shape are reported and skipped.
    pub fn eval_formulas(&mut self, formulas: &[Formula]) -> Result<Vec<FormulaExpr>> {
        let mut out = Vec::new();
        let mut success = formulas.is_empty();
        for formula in formulas {
            if let Some(expr) = self.eval_formula(formula)? {
                out.push(expr);
                success = true;
            }
        }
        if !success {
            self.report("Could not parse formulas".to_string(), (3, 5))?;
        }
        Ok(out)
    }

    fn eval_formula(&mut self, formula: &Formula) -> Result<Option<FormulaExpr>> {
        let driven = formula.output.rsplit('#').next().unwrap_or(&formula.output);
        let Some((target, channel)) = driven.split_once('?') else {
            return Ok(None);
        };
        let Some((path, idx)) = parse_channel(channel) else {
            self.report(format!("Unknown driven channel: {channel}"), (2, 4))?;
            return Ok(None);
        };

        let ops = &formula.operations;
        let Some(Op::Push(Operand::Url(url))) = ops.first() else {
            return Ok(None);
        };
        let source = url.rsplit('#').next().unwrap_or(url);
        let Some((prop, ptype)) = source.split_once('?') else {
            return Ok(None);
        };
        let prop = prop.replace("%20", " ");
        let Some((_, comp)) = parse_channel(ptype) else {
            return Ok(None);
        };

        let mut expr = Expression::default();
        if ptype == "value" {
            expr.prop = Some(prop);
        } else {
            expr.bone = Some(prop);
            expr.comp = comp;
        }

        match ops.last() {
            Some(Op::Mult) if ops.len() == 3 => {
                let Some(Op::Push(Operand::Val(val))) = ops.get(1) else {
                    return Ok(None);
                };
                let Some(value) = val.as_f64() else {
                    return Ok(None);
                };
                expr.factor = value;
            }
            Some(Op::SplineTcb) if ops.len() >= 4 => {
                for op in &ops[1..ops.len() - 2] {
                    let Op::Push(Operand::Val(val)) = op else { continue };
                    let Some(point) = val.as_array() else { continue };
                    if point.len() >= 2 {
                        let (Some(x), Some(y)) = (point[0].as_f64(), point[1].as_f64()) else {
                            continue;
                        };
                        expr.points.push((x, y));
                    }
                }
            }
            Some(Op::Push(_)) if ops.len() == 1 && formula.stage.as_deref() == Some("mult") => {
                // The referenced property multiplies the driven output.
                expr.mult = expr.prop.take();
                if expr.mult.is_none() {
                    return Ok(None);
                }
            }
            _ => return Ok(None),
        }

        Ok(Some(FormulaExpr {
            output: target.to_string(),
            channel: path,
            comp: idx,
            expr,
        }))
    }
}

//-------------------------------------------------------------
//  Drivers
//-------------------------------------------------------------

/// Weighted contribution of one property to a summed driver.
#[derive(Clone, Debug, PartialEq)]
pub struct DriverTerm {
    pub prop: String,
    pub factor: f64,
}

/// A bone pose channel driven by a scalar property.
#[derive(Clone, Debug)]
pub struct BoneDriver {
    pub bone: String,
    pub channel: ChannelPath,
    pub comp: usize,
    pub prop: String,
    pub factor: f64,
}

/// A scalar property driven by a bone rotation component.
#[derive(Clone, Debug)]
pub struct ValueDriver {
    pub prop: String,
    pub bone: String,
    pub comp: usize,
    pub factor: f64,
    /// Piecewise-linear control points; empty for a plain product.
    pub points: Vec<(f64, f64)>,
    pub mults: Vec<String>,
}

/// A scalar property driven by a weighted sum of other properties.
#[derive(Clone, Debug)]
pub struct PropDriver {
    pub prop: String,
    pub terms: Vec<DriverTerm>,
    pub mults: Vec<String>,
}

#[derive(Clone, Debug)]
pub enum Driver {
    BonePose(BoneDriver),
    BoneValue(ValueDriver),
    PropSum(PropDriver),
}

/// Everything the pose/driver application layer needs.
#[derive(Debug, Default)]
pub struct DriverSet {
    pub drivers: Vec<Driver>,
    /// Backlog entries whose dependencies never resolved.
    pub unresolved: Vec<String>,
}

/// One driving source of a value output, before open-coding.
#[derive(Clone, Debug)]
enum Source {
    Prop {
        prop: String,
        factor: f64,
    },
    Bone {
        bone: String,
        comp: usize,
        factor: f64,
        points: Vec<(f64, f64)>,
    },
}

/// Linearize spline control points into a single slope through the
/// point at the origin. Without an origin point the declared factor
/// stands.
fn cheat_spline_tcb(points: &[(f64, f64)], factor: f64) -> f64 {
    let Some(n0) = points.iter().position(|&(x, y)| x == 0.0 && y == 0.0) else {
        return factor;
    };
    let (x1, y1) = if n0 == 0 {
        match points.last() {
            Some(&p) => p,
            None => return factor,
        }
    } else {
        points[0]
    };
    if x1 == 0.0 {
        factor
    } else {
        y1 / x1
    }
}

/// Resolve a backlog of summed drivers whose dependencies may refer to
/// each other. Runs up to `max_passes` passes, building every entry
/// whose dependencies are all resolved; stops early when a pass makes
/// no progress. Leftovers are cyclic or dangling and are returned for
/// reporting rather than looping forever.
pub fn solve_dependencies(
    backlog: &BTreeMap<String, Vec<DriverTerm>>,
    resolved: &BTreeSet<String>,
    max_passes: u32,
) -> (Vec<PropDriver>, Vec<String>) {
    let mut pending = backlog.clone();
    let mut built: BTreeSet<String> = BTreeSet::new();
    let mut drivers = Vec::new();
    for _ in 0..max_passes {
        let ready: Vec<String> = pending
            .iter()
            .filter(|(_, terms)| {
                terms
                    .iter()
                    .all(|t| resolved.contains(&t.prop) || built.contains(&t.prop))
            })
            .map(|(key, _)| key.clone())
            .collect();
        if ready.is_empty() {
            break;
        }
        for key in ready {
            if let Some(terms) = pending.remove(&key) {
                built.insert(key.clone());
                drivers.push(PropDriver {
                    prop: key,
                    terms,
                    mults: Vec::new(),
                });
            }
        }
        if pending.is_empty() {
            break;
        }
    }
    let unresolved: Vec<String> = pending.into_keys().collect();
    (drivers, unresolved)
}

impl Session {
    /// Turn a batch of morph assets into drivers against `rig`.
    ///
    /// First pass collects expressions per morph; bone-channel outputs
    /// become pose drivers immediately. Value outputs are open-coded:
    /// chains of morph-driving-morph are inlined with multiplied
    /// factors up to the recursion guard, bottoming out at bone sources
    /// or registered sliders. Outputs depending on unregistered sliders
    /// go to the backlog and through [`solve_dependencies`].
    pub fn build_morph_drivers(&mut self, morphs: &[AssetId], rig: &Rig) -> Result<DriverSet> {
        let mut registered: BTreeSet<String> = BTreeSet::new();
        let mut sources: BTreeMap<String, Vec<Source>> = BTreeMap::new();
        let mut mults: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut set = DriverSet::default();

        for &aid in morphs {
            let name = self.asset(aid).get_name();
            registered.insert(name);
            let formulas = self.asset(aid).formulas.clone();
            for fx in self.eval_formulas(&formulas)? {
                self.collect_expr(rig, fx, &mut sources, &mut mults, &mut set)?;
            }
        }

        // Open-code the value outputs.
        let outputs: Vec<String> = sources.keys().cloned().collect();
        let mut backlog: BTreeMap<String, Vec<DriverTerm>> = BTreeMap::new();
        for output in outputs {
            let Some(srcs) = sources.get(&output) else { continue };
            let mut bones = Vec::new();
            let mut terms = Vec::new();
            let mut deferred = Vec::new();
            let mut overflow = false;
            for src in srcs.clone() {
                expand_source(
                    &sources,
                    &registered,
                    &output,
                    &src,
                    1.0,
                    self.settings.max_formula_depth,
                    &mut bones,
                    &mut terms,
                    &mut deferred,
                    &mut overflow,
                );
            }
            if overflow {
                self.report(
                    format!("Formula dependency depth exceeded for {output}"),
                    (2, 4),
                )?;
            }
            let out_mults = mults.get(&output).cloned().unwrap_or_default();
            for driver in combine_bone_sources(&output, bones, &out_mults) {
                set.drivers.push(Driver::BoneValue(driver));
            }
            if !deferred.is_empty() {
                let mut all = combine_terms(terms);
                all.extend(combine_terms(deferred));
                backlog.insert(output.clone(), all);
            } else if !terms.is_empty() {
                set.drivers.push(Driver::PropSum(PropDriver {
                    prop: output.clone(),
                    terms: combine_terms(terms),
                    mults: out_mults,
                }));
            }
        }

        // Entries already driven count as resolved for the backlog.
        let mut resolved = registered;
        for driver in &set.drivers {
            if let Driver::PropSum(d) = driver {
                resolved.insert(d.prop.clone());
            }
        }
        let (built, unresolved) =
            solve_dependencies(&backlog, &resolved, self.settings.max_solver_passes);
        for driver in built {
            set.drivers.push(Driver::PropSum(driver));
        }
        for prop in &unresolved {
            self.report(format!("Unresolved morph dependency: {prop}"), (2, 4))?;
        }
        set.unresolved = unresolved;
        Ok(set)
    }

    fn collect_expr(
        &mut self,
        rig: &Rig,
        fx: FormulaExpr,
        sources: &mut BTreeMap<String, Vec<Source>>,
        mults: &mut BTreeMap<String, Vec<String>>,
        set: &mut DriverSet,
    ) -> Result<()> {
        match fx.channel {
            ChannelPath::Value => {
                if let Some(mult) = fx.expr.mult {
                    mults.entry(fx.output).or_default().push(mult);
                    return Ok(());
                }
                if let Some(prop) = fx.expr.prop {
                    sources.entry(fx.output.clone()).or_default().push(Source::Prop {
                        prop,
                        factor: fx.expr.factor,
                    });
                }
                if let Some(bone) = fx.expr.bone {
                    match rig.target_bone(&bone) {
                        Some(real) => {
                            sources.entry(fx.output).or_default().push(Source::Bone {
                                bone: real.to_string(),
                                comp: fx.expr.comp,
                                factor: fx.expr.factor,
                                points: fx.expr.points,
                            });
                        }
                        None => {
                            self.report(format!("Missing driving bone: {bone}"), (2, 4))?;
                        }
                    }
                }
            }
            ChannelPath::Rotation
            | ChannelPath::Translation
            | ChannelPath::Scale
            | ChannelPath::GeneralScale => {
                let Some(prop) = fx.expr.prop else {
                    return Ok(());
                };
                let Some(bone) = rig.target_bone(&fx.output) else {
                    self.report(format!("Missing driven bone: {}", fx.output), (2, 4))?;
                    return Ok(());
                };
                let factor = if fx.expr.points.is_empty() {
                    fx.expr.factor
                } else {
                    cheat_spline_tcb(&fx.expr.points, fx.expr.factor)
                };
                set.drivers.push(Driver::BonePose(BoneDriver {
                    bone: bone.to_string(),
                    channel: fx.channel,
                    comp: fx.comp,
                    prop,
                    factor,
                }));
            }
            // Rest-geometry morphs are the mesh layer's concern.
            ChannelPath::CenterPoint | ChannelPath::EndPoint => {}
        }
        Ok(())
    }
}

/// Inline one driving source, multiplying factors down the chain.
#[allow(clippy::too_many_arguments)]
fn expand_source(
    sources: &BTreeMap<String, Vec<Source>>,
    registered: &BTreeSet<String>,
    output: &str,
    src: &Source,
    factor: f64,
    depth: u32,
    bones: &mut Vec<(String, usize, f64, Vec<(f64, f64)>)>,
    terms: &mut Vec<DriverTerm>,
    deferred: &mut Vec<DriverTerm>,
    overflow: &mut bool,
) {
    match src {
        Source::Bone {
            bone,
            comp,
            factor: f,
            points,
        } => {
            bones.push((bone.clone(), *comp, factor * f, points.clone()));
        }
        Source::Prop { prop, factor: f } => {
            let factor = factor * f;
            // A property that is itself driven gets inlined, except a
            // self-reference, which stays a plain term.
            match sources.get(prop) {
                Some(subs) if !subs.is_empty() && prop != output => {
                    if depth == 0 {
                        *overflow = true;
                        return;
                    }
                    for sub in subs {
                        expand_source(
                            sources, registered, output, sub, factor, depth - 1, bones, terms,
                            deferred, overflow,
                        );
                    }
                }
                _ => {
                    let term = DriverTerm {
                        prop: prop.clone(),
                        factor,
                    };
                    if registered.contains(prop) {
                        terms.push(term);
                    } else {
                        deferred.push(term);
                    }
                }
            }
        }
    }
}

/// Merge duplicate terms by summing their factors.
fn combine_terms(terms: Vec<DriverTerm>) -> Vec<DriverTerm> {
    let mut merged: BTreeMap<String, f64> = BTreeMap::new();
    for term in terms {
        *merged.entry(term.prop).or_insert(0.0) += term.factor;
    }
    merged
        .into_iter()
        .map(|(prop, factor)| DriverTerm { prop, factor })
        .collect()
}

/// Merge bone contributions per (bone, component), summing factors.
/// Spline points survive only when a single contributor supplies them.
fn combine_bone_sources(
    output: &str,
    bones: Vec<(String, usize, f64, Vec<(f64, f64)>)>,
    mults: &[String],
) -> Vec<ValueDriver> {
    let mut merged: BTreeMap<(String, usize), (f64, Vec<(f64, f64)>, usize)> = BTreeMap::new();
    for (bone, comp, factor, points) in bones {
        let entry = merged.entry((bone, comp)).or_insert((0.0, Vec::new(), 0));
        entry.0 += factor;
        if entry.1.is_empty() {
            entry.1 = points;
        }
        entry.2 += 1;
    }
    merged
        .into_iter()
        .map(|((bone, comp), (factor, points, count))| ValueDriver {
            prop: output.to_string(),
            bone,
            comp,
            factor,
            points: if count == 1 { points } else { Vec::new() },
            mults: mults.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{Asset, ChannelData};
    use crate::settings::Settings;
    use serde_json::json;

    fn push_val(x: f64) -> Op {
        Op::Push(Operand::Val(json!(x)))
    }

    #[test]
    fn test_parse_formula() {
        let f = Formula::parse(&json!({
            "output": "/scene.duf#lForearmBend?rotation/x",
            "operations": [
                { "op": "push", "url": "/scene.duf#BendArm?value" },
                { "op": "push", "val": 57.0 },
                { "op": "mult" }
            ]
        }))
        .unwrap();
        assert_eq!(f.operations.len(), 3);
        assert_eq!(
            f.operations[0],
            Op::Push(Operand::Url("/scene.duf#BendArm?value".to_string()))
        );
        assert_eq!(f.operations[2], Op::Mult);
    }

    #[test]
    fn test_eval_stack_product() {
        let ops = vec![push_val(3.0), push_val(4.0), Op::Mult];
        let a = eval_stack(&ops, &|_| None).unwrap();
        let b = eval_stack(&ops, &|_| None).unwrap();
        assert_eq!(a, 12.0);
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn test_eval_stack_errors() {
        assert!(eval_stack(&[Op::Mult], &|_| None).is_err());
        assert!(eval_stack(&[push_val(1.0), push_val(2.0)], &|_| None).is_err());
        assert!(eval_stack(&[], &|_| None).is_err());
    }

    #[test]
    fn test_eval_stack_fetches_urls() {
        let ops = vec![
            Op::Push(Operand::Url("#Morph?value".to_string())),
            push_val(2.0),
            Op::Mult,
        ];
        let result = eval_stack(&ops, &|url| (url == "#Morph?value").then_some(0.5)).unwrap();
        assert_eq!(result, 1.0);
    }

    #[test]
    fn test_parse_channel() {
        assert_eq!(parse_channel("value"), Some((ChannelPath::Value, 0)));
        assert_eq!(
            parse_channel("general_scale"),
            Some((ChannelPath::GeneralScale, 0))
        );
        assert_eq!(parse_channel("rotation/y"), Some((ChannelPath::Rotation, 1)));
        assert_eq!(parse_channel("scale/z"), Some((ChannelPath::Scale, 2)));
        assert_eq!(parse_channel("orientation/x"), None);
        assert_eq!(parse_channel("rotation/w"), None);
    }

    #[test]
    fn test_get_ref_key() {
        assert_eq!(
            get_ref_key("Scene:/data/m.dsf#morph?value"),
            ("/data/m.dsf#morph", "value")
        );
        assert_eq!(get_ref_key("#bone?rotation/x"), ("#bone", "rotation/x"));
        assert_eq!(get_ref_key("#plain"), ("#plain", ""));
    }

    #[test]
    fn test_cheat_spline_tcb() {
        // Origin first: slope from last point.
        let pts = vec![(0.0, 0.0), (0.5, 0.25), (1.0, 1.0)];
        assert_eq!(cheat_spline_tcb(&pts, 7.0), 1.0);
        // Origin last: slope from first point.
        let pts = vec![(-1.0, 0.5), (0.0, 0.0)];
        assert_eq!(cheat_spline_tcb(&pts, 7.0), -0.5);
        // No origin point: factor unchanged.
        let pts = vec![(0.5, 0.25), (1.0, 1.0)];
        assert_eq!(cheat_spline_tcb(&pts, 7.0), 7.0);
    }

    #[test]
    fn test_solver_acyclic() {
        let mut backlog = BTreeMap::new();
        backlog.insert(
            "B".to_string(),
            vec![DriverTerm {
                prop: "A".to_string(),
                factor: 1.0,
            }],
        );
        backlog.insert(
            "C".to_string(),
            vec![DriverTerm {
                prop: "B".to_string(),
                factor: 2.0,
            }],
        );
        let resolved: BTreeSet<String> = ["A".to_string()].into();
        let (built, unresolved) = solve_dependencies(&backlog, &resolved, 5);
        assert_eq!(built.len(), 2);
        assert!(unresolved.is_empty());
    }

    #[test]
    fn test_solver_cycle_terminates() {
        let mut backlog = BTreeMap::new();
        backlog.insert(
            "A".to_string(),
            vec![DriverTerm {
                prop: "B".to_string(),
                factor: 1.0,
            }],
        );
        backlog.insert(
            "B".to_string(),
            vec![DriverTerm {
                prop: "A".to_string(),
                factor: 1.0,
            }],
        );
        let (built, unresolved) = solve_dependencies(&backlog, &BTreeSet::new(), 5);
        assert!(built.is_empty());
        assert_eq!(unresolved, vec!["A".to_string(), "B".to_string()]);
    }

    fn session() -> Session {
        Session::new(Settings::default())
    }

    fn channel_asset(s: &mut Session, fileref: &str, id: &str, value: f64) -> AssetId {
        use crate::refs::get_id;
        let mut asset = Asset::new(
            fileref,
            AssetData::Channel(ChannelData {
                value,
                ..Default::default()
            }),
        );
        let rid = get_id(id, fileref);
        asset.id = rid.clone();
        asset.name = id.to_string();
        let aid = s.alloc_asset(asset);
        s.save_asset(&rid, aid).unwrap();
        aid
    }

    #[test]
    fn test_compute_formula_immediate() {
        let mut s = session();
        let cx = FileContext::new("/data/m.dsf");
        channel_asset(&mut s, "/data/m.dsf", "Strength", 0.5);
        let f = Formula::parse(&json!({
            "output": "/data/m.dsf#target?value",
            "operations": [
                { "op": "push", "url": "#Strength?value" },
                { "op": "push", "val": 4.0 },
                { "op": "mult" }
            ]
        }))
        .unwrap();
        let (target, key, value) = s.compute_formula(&cx, &f).unwrap().unwrap();
        assert_eq!(target, "/data/m.dsf#target");
        assert_eq!(key, "value");
        assert_eq!(value, 2.0);
    }

    #[test]
    fn test_apply_formula_sets_channel_value() {
        let mut s = session();
        let cx = FileContext::new("/data/m.dsf");
        let target = channel_asset(&mut s, "/data/m.dsf", "Target", 0.0);
        let owner = channel_asset(&mut s, "/data/m.dsf", "Owner", 0.0);
        s.asset_mut(owner).formulas = vec![Formula::parse(&json!({
            "output": "#Target?value",
            "operations": [
                { "op": "push", "val": 3.0 },
                { "op": "push", "val": 0.5 },
                { "op": "mult" }
            ]
        }))
        .unwrap()];
        s.apply_formulas(&cx, owner).unwrap();
        assert_eq!(s.asset(target).channel().unwrap().value, 1.5);
    }

    #[test]
    fn test_eval_formula_rotation_output() {
        let mut s = session();
        let f = Formula::parse(&json!({
            "output": "Scene:#lForearmBend?rotation/x",
            "operations": [
                { "op": "push", "url": "Scene:#BendArm?value" },
                { "op": "push", "val": -57.0 },
                { "op": "mult" }
            ]
        }))
        .unwrap();
        let exprs = s.eval_formulas(&[f]).unwrap();
        assert_eq!(exprs.len(), 1);
        let fx = &exprs[0];
        assert_eq!(fx.output, "lForearmBend");
        assert_eq!(fx.channel, ChannelPath::Rotation);
        assert_eq!(fx.comp, 0);
        assert_eq!(fx.expr.prop.as_deref(), Some("BendArm"));
        assert_eq!(fx.expr.factor, -57.0);
    }

    #[test]
    fn test_eval_formula_spline_points() {
        let mut s = session();
        let f = Formula::parse(&json!({
            "output": "Scene:#Morph?value",
            "operations": [
                { "op": "push", "url": "Scene:#lShin?rotation/x" },
                { "op": "push", "val": [0.0, 0.0, 0.0] },
                { "op": "push", "val": [1.5, 1.0, 0.0] },
                { "op": "push", "val": 2 },
                { "op": "spline_tcb" }
            ]
        }))
        .unwrap();
        let exprs = s.eval_formulas(&[f]).unwrap();
        let fx = &exprs[0];
        assert_eq!(fx.expr.bone.as_deref(), Some("lShin"));
        assert_eq!(fx.expr.comp, 0);
        assert_eq!(fx.expr.points, vec![(0.0, 0.0), (1.5, 1.0)]);
    }

    #[test]
    fn test_eval_formula_stage_mult() {
        let mut s = session();
        let f = Formula::parse(&json!({
            "output": "Scene:#Morph?value",
            "operations": [
                { "op": "push", "url": "Scene:#Master?value" }
            ],
            "stage": "mult"
        }))
        .unwrap();
        let exprs = s.eval_formulas(&[f]).unwrap();
        assert_eq!(exprs[0].expr.mult.as_deref(), Some("Master"));
    }

    #[test]
    fn test_combine_terms_accumulates() {
        let terms = vec![
            DriverTerm {
                prop: "A".to_string(),
                factor: 1.0,
            },
            DriverTerm {
                prop: "A".to_string(),
                factor: 2.0,
            },
            DriverTerm {
                prop: "B".to_string(),
                factor: 0.5,
            },
        ];
        let merged = combine_terms(terms);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].factor, 3.0);
    }
}
