//! Authorization core - resource tree, resolution and control checks
//!
//! This module implements:
//! - Resource tree assembly from the flat catalog
//! - Tri-state resolution (user exception, delegated grants, job grants with scope)
//! - Control authority checks over jobs and organizational placements
//! - The distribution filter bounding delegable scopes

mod distribution;
mod index;
mod tree;

pub use distribution::{valid_scopes, valid_scopes_for, ValidScopes};
pub use index::{Decision, PermissionIndex};
pub use tree::{build_resource_tree, natural_cmp};
