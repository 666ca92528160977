//! # Enhancement Stages
//!
//! Named, parameterized transforms applied to one segment at a time.
//! Every stage declares what it accepts, what it produces and how it
//! changes segment metadata, so whole chains can be checked before any
//! media is decoded.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use av_composer::stages::{StageParams, StageRegistry};
//!
//! let registry = StageRegistry::new();
//! let volume = registry.get("volume").unwrap();
//! let params = StageParams::new().set("db", -6.0);
//! volume.validate_params(&params).unwrap();
//! ```

pub mod audio;
pub mod registry;
pub mod traits;
pub mod video;

pub use registry::StageRegistry;
pub use traits::{ParamDomain, ParamSpec, ParamValue, Stage, StageCapabilities, StageParams};
