//! Workspace root crate. Exists only to anchor workspace-wide tooling
//! (git hooks); all functionality lives in `crates/sqrl-core`.
