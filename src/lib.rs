#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::trivially_copy_pass_by_ref)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::should_implement_trait)]

//! # inkplug
//!
//! Plugin runtime for a novel-writing app.
//!
//! inkplug installs third-party plugins from a `plugin.json` manifest, keeps
//! them away from host capabilities they were not granted, and serializes
//! every lifecycle operation per plugin so concurrent installs, activations
//! and uninstalls never leave stray commands, storage or grants behind.
//!
//! ## Features
//!
//! - **Manifest validation**: field-path errors such as `permissions[2].risk`
//! - **Permission gating**: risk-classified permissions, checked on every call
//! - **Bounded activation**: timeout, memory, file and connection ceilings
//! - **Search**: ranked plugin lookup with a fuzzy tier (powered by nucleo)
//!
//! ## Quick Start
//!
//! ```bash
//! inkplug install ./word-count
//! inkplug grant word-count editor
//! inkplug activate word-count
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::redundant_else)]
#![allow(clippy::if_not_else)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::significant_drop_in_scrutinee)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::redundant_clone)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::use_self)]

pub mod core;
pub mod plugin;

// Re-export commonly used types
pub use core::Config;
pub use plugin::{
    Capability, PermissionRisk, Plugin, PluginCommand, PluginContext, PluginError, PluginEvent,
    PluginManager, PluginManifest, PluginResult, PluginState, PluginType,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "inkplug";
