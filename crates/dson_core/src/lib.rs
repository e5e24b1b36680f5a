//! DSON Core - asset resolution and rigging for DSON scene import.
//!
//! This crate provides:
//!
//! - **Reference resolution**: normalized [`Ref`]s, the asset registry,
//!   cross-file loading with content-root search
//! - **Scene graph**: node assets, per-placement [`Instance`]s, world
//!   transform composition
//! - **Rigging**: armature construction with orientation remapping and
//!   roll derivation, morph formulas synthesized into drivers
//!
//! # Example
//!
//! ```ignore
//! use dson_core::{Session, Settings};
//!
//! let mut settings = Settings::default();
//! settings.content_dirs.push("/opt/content".into());
//! let mut session = Session::new(settings);
//!
//! // Import a scene
//! let import = session.import_file("scene.duf".as_ref())?;
//! println!("Placed {} nodes, built {} rigs",
//!     import.nodes.len(),
//!     import.rigs.len());
//! ```

pub mod asset;
pub mod bone;
pub mod error;
pub mod files;
pub mod formula;
pub mod instance;
pub mod node;
pub mod refs;
pub mod session;
pub mod settings;

// Re-export commonly used types
pub use asset::{Asset, AssetData, AssetId, InstanceId};
pub use bone::{EditBone, Rig};
pub use error::{Error, Result, Trigger};
pub use files::SceneImport;
pub use formula::{Driver, DriverSet, Formula};
pub use instance::{Instance, WorldTransform};
pub use node::{Attributes, NodeKind};
pub use refs::Ref;
pub use session::{FileContext, Session};
pub use settings::Settings;
