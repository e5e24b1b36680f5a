//! The import session: asset arena, registry tables, and file resolution.
//!
//! All state for one import lives here and is passed explicitly; there
//! are no module-level globals. The registry maps normalized [`Ref`]s to
//! arena indices. Resolution is memoized: a `Ref` that is already in the
//! registry is never re-parsed, and a `Ref` that cannot be resolved is
//! recorded in the missing set exactly once.

use crate::asset::{Asset, AssetData, AssetId, InstanceId};
use crate::error::{Reporter, Result, Trigger};
use crate::instance::Instance;
use crate::refs::{get_ref, unquote, Ref};
use crate::settings::Settings;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Where a parse is happening: the file being parsed and, when an asset
/// from another file is being elaborated on behalf of a scene, the file
/// that asked for it.
#[derive(Clone, Debug)]
pub struct FileContext {
    pub fileref: String,
    pub caller: Option<String>,
}

impl FileContext {
    pub fn new(fileref: impl Into<String>) -> FileContext {
        FileContext {
            fileref: fileref.into(),
            caller: None,
        }
    }

    pub fn called_from(&self, fileref: impl Into<String>) -> FileContext {
        FileContext {
            fileref: fileref.into(),
            caller: Some(self.fileref.clone()),
        }
    }
}

pub struct Session {
    pub settings: Settings,
    pub(crate) assets: Vec<Asset>,
    pub(crate) instances: Vec<Instance>,
    /// Primary registry. Most recent definition wins; a `source`
    /// delegation may overwrite a slot with the aliasing asset.
    primary: HashMap<Ref, AssetId>,
    /// Overflow table for assets duplicated into another file's
    /// namespace by a `source` delegation.
    secondary: HashMap<Ref, AssetId>,
    /// Delegation targets, keyed by the ref they were aliased under.
    sources: HashMap<Ref, AssetId>,
    /// Refs that failed to resolve, each recorded once.
    pub missing: BTreeSet<Ref>,
    pub(crate) reporter: Reporter,
    /// Files entered during this import, in parse order.
    trace: Vec<String>,
}

impl Session {
    pub fn new(settings: Settings) -> Session {
        let reporter = Reporter::new(settings.verbosity);
        Session {
            settings,
            assets: Vec::new(),
            instances: Vec::new(),
            primary: HashMap::new(),
            secondary: HashMap::new(),
            sources: HashMap::new(),
            missing: BTreeSet::new(),
            reporter,
            trace: Vec::new(),
        }
    }

    pub fn report(&mut self, msg: impl Into<String>, trigger: Trigger) -> Result<()> {
        self.reporter.report(msg, trigger)
    }

    /// Warnings collected so far.
    pub fn warnings(&self) -> &[String] {
        &self.reporter.collected
    }

    pub fn trace(&self) -> &[String] {
        &self.trace
    }

    pub(crate) fn push_trace(&mut self, entry: String) {
        self.trace.push(entry);
    }

    //-------------------------------------------------------------
    //  Arenas
    //-------------------------------------------------------------

    pub(crate) fn alloc_asset(&mut self, asset: Asset) -> AssetId {
        let id = AssetId(self.assets.len() as u32);
        self.assets.push(asset);
        id
    }

    pub fn asset(&self, id: AssetId) -> &Asset {
        &self.assets[id.index()]
    }

    pub(crate) fn asset_mut(&mut self, id: AssetId) -> &mut Asset {
        &mut self.assets[id.index()]
    }

    pub(crate) fn alloc_instance(&mut self, instance: Instance) -> InstanceId {
        let id = InstanceId(self.instances.len() as u32);
        self.instances.push(instance);
        id
    }

    pub fn instance(&self, id: InstanceId) -> &Instance {
        &self.instances[id.index()]
    }

    pub(crate) fn instance_mut(&mut self, id: InstanceId) -> &mut Instance {
        &mut self.instances[id.index()]
    }

    //-------------------------------------------------------------
    //  Registry
    //-------------------------------------------------------------

    /// Look a ref up without triggering any file loads.
    pub fn lookup(&self, rid: &Ref) -> Option<AssetId> {
        self.primary
            .get(rid)
            .or_else(|| self.secondary.get(rid))
            .copied()
    }

    /// Register an asset under its ref. Redefinition of an existing ref
    /// is logged as a duplicate; the latest definition wins.
    pub(crate) fn save_asset(&mut self, rid: &Ref, aid: AssetId) -> Result<()> {
        if let Some(&old) = self.primary.get(rid) {
            if old != aid {
                self.report(format!("Duplicate asset definition: {rid}"), (2, 4))?;
            }
        }
        self.primary.insert(rid.clone(), aid);
        Ok(())
    }

    fn note_missing(&mut self, rid: Ref, strict: bool) -> Result<()> {
        if self.missing.insert(rid.clone()) {
            let trigger = if strict && self.settings.strict {
                (2, 3)
            } else {
                (2, 4)
            };
            self.report(format!("Missing asset: {rid}"), trigger)?;
        }
        Ok(())
    }

    //-------------------------------------------------------------
    //  Resolution
    //-------------------------------------------------------------

    /// Resolve a reference to an asset, loading its file on demand.
    ///
    /// Local fragment references try the caller's file, then the own
    /// file, then the secondary table. Unresolvable references return
    /// `None` after being recorded; they only raise under strict mode.
    pub fn get_asset(
        &mut self,
        cx: &FileContext,
        id: &str,
        strict: bool,
    ) -> Result<Option<AssetId>> {
        if id.contains('?') {
            // Channel references name a value, not an asset.
            return Ok(None);
        }
        let rid = get_ref(id, &cx.fileref);
        if let Some(&aid) = self.primary.get(&rid) {
            return Ok(Some(aid));
        }
        if id.starts_with('#') {
            if let Some(caller) = &cx.caller {
                let alt = get_ref(id, caller);
                if let Some(&aid) = self.primary.get(&alt) {
                    return Ok(Some(aid));
                }
            }
            if let Some(&aid) = self.secondary.get(&rid) {
                return Ok(Some(aid));
            }
            self.note_missing(rid, strict)?;
            return Ok(None);
        }
        self.resolve_file(rid.file())?;
        if let Some(aid) = self.lookup(&rid) {
            return Ok(Some(aid));
        }
        self.note_missing(rid, strict)?;
        Ok(None)
    }

    /// Parse a referenced file into the registry, if it can be found
    /// under the content roots. Memoized on the file's own ref.
    pub fn resolve_file(&mut self, fileref: &str) -> Result<Option<AssetId>> {
        let rid = Ref::normalize(fileref);
        if let Some(&aid) = self.primary.get(&rid) {
            return Ok(Some(aid));
        }
        let Some(path) = self.resolve_path(rid.file()) else {
            if !self.missing.contains(&rid) {
                self.missing.insert(rid.clone());
                self.report(format!("Cannot open file: {rid}"), (3, 4))?;
            }
            return Ok(None);
        };
        let text = std::fs::read_to_string(&path)?;
        let doc: serde_json::Value = serde_json::from_str(&text)?;
        let fileref = rid.file().to_string();
        let aid = self.parse_document(&doc, &fileref, false)?;
        Ok(Some(aid))
    }

    /// Map a normalized file reference onto the filesystem via the
    /// content roots, with a case-insensitive fallback scan.
    pub fn resolve_path(&self, fileref: &str) -> Option<PathBuf> {
        let rel = unquote(fileref);
        let rel = rel.trim_start_matches('/');
        for dir in &self.settings.content_dirs {
            let candidate = dir.join(rel);
            if candidate.exists() {
                return Some(candidate);
            }
            if !self.settings.case_sensitive_paths {
                if let Some(fixed) = fix_broken_path(dir, rel) {
                    return Some(fixed);
                }
            }
        }
        None
    }

    //-------------------------------------------------------------
    //  Source delegation
    //-------------------------------------------------------------

    /// Make `aid` a live alias of the asset at `url`. Lookups of the
    /// source ref now land on the aliasing asset, and the source file's
    /// other assets become addressable in the alias's namespace.
    pub(crate) fn apply_source(&mut self, cx: &FileContext, aid: AssetId, url: &str) -> Result<()> {
        let rid = get_ref(url, &cx.fileref);
        let src = self.get_asset(cx, url, false)?;
        let Some(src) = src.filter(|&src| src != aid) else {
            return self.report(format!("Missing source asset: {rid}"), (2, 3));
        };
        if !same_kind(&self.asset(aid).data, &self.asset(src).data) {
            return self.report(format!("Source type mismatch: {rid}"), (2, 3));
        }
        self.asset_mut(aid).source = Some(src);
        self.asset_mut(src).sourcing = Some(aid);
        self.sources.insert(rid.clone(), src);
        self.primary.insert(rid.clone(), aid);
        self.copy_source_assets(&rid, aid);
        Ok(())
    }

    /// The asset `rid` was aliased to; used when a bone lookup must fall
    /// through to the delegation target's figure.
    pub fn source_of(&self, rid: &Ref) -> Option<AssetId> {
        self.sources.get(rid).copied()
    }

    fn copy_source_assets(&mut self, src_ref: &Ref, aid: AssetId) {
        let old_prefix = src_ref.file().to_string();
        let new_prefix = Ref::normalize(&self.asset(aid).fileref)
            .file()
            .to_string();
        let copies: Vec<(Ref, AssetId)> = self
            .primary
            .iter()
            .filter_map(|(key, &val)| {
                let frag = key.fragment()?;
                if key.file() == old_prefix {
                    Some((Ref::normalize(&format!("{new_prefix}#{frag}")), val))
                } else {
                    None
                }
            })
            .collect();
        for (key, val) in copies {
            self.secondary.entry(key).or_insert(val);
        }
    }
}

/// Whether a delegation is between assets of compatible kinds.
fn same_kind(a: &AssetData, b: &AssetData) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

/// Walk `rel` under `root`, matching each component case-insensitively
/// against the actual directory listing.
fn fix_broken_path(root: &Path, rel: &str) -> Option<PathBuf> {
    let mut current = root.to_path_buf();
    for part in rel.split('/').filter(|p| !p.is_empty()) {
        let next = current.join(part);
        if next.exists() {
            current = next;
            continue;
        }
        let entries = std::fs::read_dir(&current).ok()?;
        let mut found = None;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().to_lowercase() == part.to_lowercase() {
                found = Some(entry.path());
                break;
            }
        }
        current = found?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{Asset, AssetData};

    fn session() -> Session {
        Session::new(Settings::default())
    }

    #[test]
    fn test_lookup_unregistered_is_none() {
        let s = session();
        assert!(s.lookup(&Ref::normalize("/data/base.dsf#hip")).is_none());
    }

    #[test]
    fn test_save_and_lookup() {
        let mut s = session();
        let rid = Ref::normalize("/data/base.dsf#hip");
        let asset = Asset::new("/data/base.dsf", AssetData::Geometry);
        let aid = s.alloc_asset(asset);
        s.save_asset(&rid, aid).unwrap();
        assert_eq!(s.lookup(&rid), Some(aid));
        // Different spelling, same ref.
        assert_eq!(s.lookup(&Ref::normalize("/Data/Base.dsf#hip")), Some(aid));
    }

    #[test]
    fn test_duplicate_definition_latest_wins() {
        let mut s = session();
        let rid = Ref::normalize("/data/base.dsf#hip");
        let a = s.alloc_asset(Asset::new("/data/base.dsf", AssetData::Geometry));
        let b = s.alloc_asset(Asset::new("/data/base.dsf", AssetData::Geometry));
        s.save_asset(&rid, a).unwrap();
        s.save_asset(&rid, b).unwrap();
        assert_eq!(s.lookup(&rid), Some(b));
        assert_eq!(s.warnings().len(), 1);
    }

    #[test]
    fn test_missing_recorded_once() {
        let mut s = session();
        let cx = FileContext::new("/data/base.dsf");
        assert!(s.get_asset(&cx, "#nothere", false).unwrap().is_none());
        assert!(s.get_asset(&cx, "#nothere", false).unwrap().is_none());
        assert_eq!(s.missing.len(), 1);
        assert_eq!(s.warnings().len(), 1);
    }

    #[test]
    fn test_channel_reference_is_not_an_asset() {
        let mut s = session();
        let cx = FileContext::new("/data/base.dsf");
        assert!(s.get_asset(&cx, "#hip?rotation/x", false).unwrap().is_none());
        assert!(s.missing.is_empty());
    }

    #[test]
    fn test_source_delegation_alias() {
        let mut s = session();
        let a_rid = Ref::normalize("/data/base.dsf#hip");
        let mut a = Asset::new("/data/base.dsf", AssetData::Node(Default::default()));
        a.id = a_rid.clone();
        let a_id = s.alloc_asset(a);
        s.save_asset(&a_rid, a_id).unwrap();
        let extra_rid = Ref::normalize("/data/base.dsf#pelvis-geo");
        let extra = s.alloc_asset(Asset::new("/data/base.dsf", AssetData::Geometry));
        s.save_asset(&extra_rid, extra).unwrap();

        let cx = FileContext::new("/figures/alias.duf");
        let mut b = Asset::new("/figures/alias.duf", AssetData::Node(Default::default()));
        b.id = Ref::normalize("/figures/alias.duf#hip");
        let b_id = s.alloc_asset(b);
        s.apply_source(&cx, b_id, "/data/base.dsf#hip").unwrap();

        // The alias took over the source's registry slot.
        assert_eq!(s.lookup(&a_rid), Some(b_id));
        assert_eq!(s.source_of(&a_rid), Some(a_id));
        // Other assets from the source file are addressable under the
        // alias's file prefix.
        let copied = Ref::normalize("/figures/alias.duf#pelvis-geo");
        assert_eq!(s.lookup(&copied), Some(extra));
    }

    #[test]
    fn test_fix_broken_path() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("People").join("Genesis");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join("Base.duf"), "{}").unwrap();
        let fixed = fix_broken_path(dir.path(), "people/genesis/base.duf").unwrap();
        assert!(fixed.ends_with("People/Genesis/Base.duf"));
        assert!(fix_broken_path(dir.path(), "people/missing.duf").is_none());
    }
}
