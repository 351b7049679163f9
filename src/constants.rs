//! # Constants and type definitions for xmatch
//!
//! This module centralizes the **unit conversions** and **common type
//! definitions** used throughout the `xmatch` library.
//!
//! ## Overview
//!
//! - Angular unit conversions (degrees ↔ radians, arcmin/arcsec → radians)
//! - Core type aliases used across the crate
//! - Container types for per-type object counts
//!
//! These definitions are used by all main modules, including the spherical
//! grid, the density atlas, and the match reduction pipeline.

use std::collections::BTreeMap;

// -------------------------------------------------------------------------------------------------
// Unit conversions
// -------------------------------------------------------------------------------------------------

/// 2π, useful for longitude wrapping
pub const DPI: f64 = 2. * std::f64::consts::PI;

/// Full-sphere solid angle in steradians (4π)
pub const SPHERE_SR: f64 = 4. * std::f64::consts::PI;

/// Degrees → radians
pub const RADEG: f64 = std::f64::consts::PI / 180.0;

/// Arcminutes → radians
pub const RADMIN: f64 = std::f64::consts::PI / 10_800.0;

/// Arcseconds → radians
pub const RADSEC: f64 = std::f64::consts::PI / 648_000.0;

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Angle in radians
pub type Radian = f64;

/// Angle in degrees
pub type Degree = f64;

/// Solid angle in steradians
pub type Steradian = f64;

/// A reference-database object type code (SIMBAD-style, e.g. `"G"`, `"QSO"`)
pub type ObjectType = String;

/// Per-type object counts from a single sample query.
///
/// A `BTreeMap` keeps the serialization of persisted samples deterministic.
pub type TypeCounts = BTreeMap<ObjectType, u64>;

/// Catalog source identifier
pub type SourceId = String;

/// Reference-database candidate identifier (object name)
pub type CandidateId = String;
