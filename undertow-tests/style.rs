//! Source Hygiene Tests
//!
//! Scans the workspace for patterns that clippy does not reject on its own.
//!
//! - `source_hygiene` - Production code must not unwrap, expect or silence dead code

#[path = "style/source_hygiene.rs"]
mod source_hygiene;
