/// Process-level plumbing shared by all spider binaries.
pub mod helpers;
